//! Structural checks over a function. A failure here is always a defect in a
//! pass, never in the program being compiled.

use std::collections::BTreeSet;

use crate::{error::InternalError, middle::lir::Function};

/// Checks that the edge sets match the terminators and that every phi has
/// exactly one source per predecessor
pub fn verify_function(function: &Function) -> Result<(), InternalError> {
    function.require_current_cfg()?;

    let inconsistent = |block| InternalError::InconsistentEdges {
        function: function.symbol_name,
        block,
    };

    for block in function.blocks.values() {
        let targets = block.terminator.targets().collect::<BTreeSet<_>>();

        for target in &targets {
            if !function.blocks.contains_key(target) {
                return Err(InternalError::UnknownBlock {
                    function: function.symbol_name,
                    block: *target,
                });
            }
        }

        if targets != block.successors {
            return Err(inconsistent(block.id));
        }

        for predecessor in &block.predecessors {
            let linked = function
                .blocks
                .get(predecessor)
                .is_some_and(|predecessor| predecessor.successors.contains(&block.id));

            if !linked {
                return Err(inconsistent(block.id));
            }
        }

        for successor in &block.successors {
            if !function.block(*successor).predecessors.contains(&block.id) {
                return Err(inconsistent(block.id));
            }
        }

        for phi in &block.phis {
            if !phi.sources.keys().eq(block.predecessors.iter()) {
                return Err(InternalError::MalformedPhi {
                    function: function.symbol_name,
                    block: block.id,
                    phi: phi.destination,
                    sources: phi.sources.keys().copied().collect(),
                    predecessors: block.predecessors.iter().copied().collect(),
                });
            }
        }
    }

    Ok(())
}

/// Fails on the first phi found. Code generation must never see one.
pub fn ensure_phi_free(function: &Function) -> Result<(), InternalError> {
    for block in function.blocks.values() {
        if let Some(phi) = block.phis.first() {
            return Err(InternalError::PhiAfterDestruction {
                function: function.symbol_name,
                block: block.id,
                phi: phi.destination,
            });
        }
    }

    Ok(())
}
