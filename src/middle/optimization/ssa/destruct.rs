//! Takes a function out of SSA form. Each phi becomes one move per incoming
//! edge, placed at the end of the predecessor. Critical edges get a relay
//! block first so a move never runs on a path it does not belong to.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    error::InternalError,
    middle::lir::{
        BlockId, Function, Instruction, Operand, Terminator, ValueId,
        verify::{ensure_phi_free, verify_function},
    },
};

/// One phi operand materialized on one edge: `destination <- source`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyEdge {
    pub destination: ValueId,
    pub source: Operand,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DestructionStatistics {
    pub split_edges: usize,
    pub moves: usize,
    pub temporaries: usize,
}

pub fn destruct_ssa(function: &mut Function) -> Result<DestructionStatistics, InternalError> {
    verify_function(function)?;

    let mut statistics = DestructionStatistics::default();
    if function.phi_count() == 0 {
        return Ok(statistics);
    }

    statistics.split_edges = split_critical_edges(function);

    /* Copy sets, one per predecessor */

    let mut copy_sets: BTreeMap<BlockId, Vec<CopyEdge>> = BTreeMap::new();
    for block in function.blocks.values() {
        for phi in &block.phis {
            for (predecessor, source) in &phi.sources {
                copy_sets.entry(*predecessor).or_default().push(CopyEdge {
                    destination: phi.destination,
                    source: *source,
                });
            }
        }
    }

    for (block, copies) in copy_sets {
        let moves = sequentialize_parallel_copy(copies, |blocked| {
            statistics.temporaries += 1;
            let ty = function.values[blocked].ty;
            function.create_value(ty)
        });

        statistics.moves += moves.len();
        function.block_mut(block).instructions.extend(moves);
    }

    for block in function.blocks.values_mut() {
        block.phis.clear();
    }
    ensure_phi_free(function)?;

    tracing::debug!(
        function = %function.symbol_name,
        split_edges = statistics.split_edges,
        moves = statistics.moves,
        temporaries = statistics.temporaries,
        "destructed ssa"
    );

    Ok(statistics)
}

/// Puts an empty relay block on every edge from a block with several
/// successors to a block with several predecessors. Edge sets are updated in
/// place, so the CFG stays current.
pub fn split_critical_edges(function: &mut Function) -> usize {
    let critical = function
        .blocks
        .values()
        .filter(|block| block.successors.len() > 1)
        .flat_map(|block| {
            block
                .successors
                .iter()
                .map(move |successor| (block.id, *successor))
        })
        .filter(|(_, successor)| function.block(*successor).predecessors.len() > 1)
        .collect::<Vec<_>>();

    for (source, target) in &critical {
        let relay = function.create_block();

        let relay_block = function.block_mut(relay);
        relay_block.terminator = Terminator::Jump {
            destination: *target,
        };
        relay_block.predecessors = BTreeSet::from([*source]);
        relay_block.successors = BTreeSet::from([*target]);

        let source_block = function.block_mut(*source);
        source_block.terminator.retarget(*target, relay);
        source_block.successors.remove(target);
        source_block.successors.insert(relay);

        let target_block = function.block_mut(*target);
        target_block.predecessors.remove(source);
        target_block.predecessors.insert(relay);
        target_block.redirect_phi_source(*source, relay);

        tracing::trace!(
            function = %function.symbol_name,
            %source,
            %target,
            %relay,
            "split critical edge"
        );
    }

    critical.len()
}

/// Orders a set of simultaneous copies into sequential moves. A copy is safe
/// to emit once no remaining copy still reads its destination. When only
/// cycles remain, one destination is saved into a temporary obtained from
/// `fresh` and its readers are pointed at the temporary instead.
pub fn sequentialize_parallel_copy(
    copies: Vec<CopyEdge>,
    mut fresh: impl FnMut(ValueId) -> ValueId,
) -> Vec<Instruction> {
    let mut pending = copies
        .into_iter()
        .filter(|copy| copy.source != Operand::Value(copy.destination))
        .collect::<Vec<_>>();
    let mut moves = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        let free = pending.iter().position(|copy| {
            pending
                .iter()
                .all(|other| other.source != Operand::Value(copy.destination))
        });

        match free {
            Some(index) => {
                let copy = pending.remove(index);
                moves.push(Instruction::Move {
                    destination: copy.destination,
                    source: copy.source,
                });
            }
            None => {
                let blocked = pending[0].destination;
                let temporary = fresh(blocked);

                moves.push(Instruction::Move {
                    destination: temporary,
                    source: Operand::Value(blocked),
                });

                for copy in &mut pending {
                    if copy.source == Operand::Value(blocked) {
                        copy.source = Operand::Value(temporary);
                    }
                }
            }
        }
    }

    moves
}
