use hashbrown::HashMap;

use crate::{
    error::InternalError,
    middle::{
        analysis::cfg,
        lir::{BlockId, Function, Terminator},
    },
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimplifyStatistics {
    pub removed_blocks: usize,
    pub merged_blocks: usize,
}

/// Cleans up the control flow left behind by constant propagation: blocks
/// nothing jumps to are deleted and straight-line chains of blocks are fused.
/// Runs before SSA destruction so that the moves land in the final layout.
pub fn simplify_cfg(function: &mut Function) -> Result<SimplifyStatistics, InternalError> {
    cfg::build(function)?;

    let statistics = SimplifyStatistics {
        removed_blocks: eliminate_dead_blocks(function),
        merged_blocks: merge_blocks(function),
    };

    cfg::build(function)?;

    tracing::debug!(
        function = %function.symbol_name,
        removed_blocks = statistics.removed_blocks,
        merged_blocks = statistics.merged_blocks,
        "simplified cfg"
    );

    Ok(statistics)
}

/// Removes every block other than the entry which has no predecessors. Doing
/// so can strand its successors, so this repeats until nothing changes.
fn eliminate_dead_blocks(function: &mut Function) -> usize {
    let mut removed = 0;

    loop {
        let dead = function
            .blocks
            .values()
            .filter(|block| block.id != function.entry && block.predecessors.is_empty())
            .map(|block| block.id)
            .collect::<Vec<_>>();

        if dead.is_empty() {
            return removed;
        }

        for block_id in dead {
            let Some(block) = function.remove_block(block_id) else {
                continue;
            };
            removed += 1;

            // keep the edge sets usable for the next sweep
            for successor in &block.successors {
                if let Some(successor) = function.blocks.get_mut(successor) {
                    successor.predecessors.remove(&block_id);
                    successor.remove_phi_source(block_id);
                }
            }

            tracing::trace!(function = %function.symbol_name, block = %block_id, "removed dead block");
        }
    }
}

/// Fuses a block with its successor when the block ends in a jump and is the
/// successor's only predecessor. The successor's phis then have a single
/// source and are replaced by it.
fn merge_blocks(function: &mut Function) -> usize {
    let mut merged = 0;
    let mut substitutions = HashMap::new();

    for block_id in function.blocks.keys().copied().collect::<Vec<_>>() {
        if !function.blocks.contains_key(&block_id) {
            continue;
        }

        while let Some(next) = mergeable_successor(function, block_id) {
            let exit = function.exit;
            let Some(absorbed) = function.remove_block(next) else {
                break;
            };

            for phi in &absorbed.phis {
                if let Some(source) = phi.sources.get(&block_id) {
                    substitutions.insert(phi.destination, *source);
                }
            }

            for successor in &absorbed.successors {
                let successor = function.block_mut(*successor);
                successor.predecessors.remove(&next);
                successor.predecessors.insert(block_id);
                successor.redirect_phi_source(next, block_id);
            }

            if exit == Some(next) {
                function.exit = Some(block_id);
            }

            let block = function.block_mut(block_id);
            block.instructions.extend(absorbed.instructions);
            block.terminator = absorbed.terminator;
            block.successors = absorbed.successors;
            merged += 1;

            tracing::trace!(
                function = %function.symbol_name,
                block = %block_id,
                %next,
                "merged blocks"
            );
        }
    }

    function.replace_uses(&substitutions);
    merged
}

fn mergeable_successor(function: &Function, block_id: BlockId) -> Option<BlockId> {
    let Terminator::Jump { destination } = function.block(block_id).terminator else {
        return None;
    };

    let next = function.block(destination);
    let only_predecessor = next.predecessors.len() == 1 && next.predecessors.contains(&block_id);

    (destination != block_id && destination != function.entry && only_predecessor)
        .then_some(destination)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        index::Index,
        middle::lir::{
            BinaryOperator, Immediate, Instruction, Operand, ValueId, parser::parse_function,
            verify::verify_function,
        },
    };

    fn block(n: usize) -> BlockId {
        BlockId::new(n)
    }

    #[test]
    fn removes_dead_blocks_and_merges_chains() {
        let mut function = parse_function(indoc! {"
            fn f(%c: bool) {
            .a:
                jmp .b
            .b:
                %x: i64 = add 1, 2
                br %c .c .d
            .c:
                jmp .e
            .d:
                jmp .e
            .e:
                %p: i64 = phi [.c: 1, .d: %x, .dead: 3]
                jmp .f
            .f:
                ret %p
            .dead:
                jmp .e
            }
        "})
        .unwrap();

        let statistics = simplify_cfg(&mut function).unwrap();

        assert_eq!(
            statistics,
            SimplifyStatistics {
                removed_blocks: 1,
                merged_blocks: 2,
            }
        );
        assert_eq!(
            function.blocks.keys().copied().collect::<Vec<_>>(),
            vec![block(0), block(2), block(3), block(4)]
        );
        assert_eq!(
            function.block(block(4)).phis[0].sources.keys().copied().collect::<BTreeSet<_>>(),
            BTreeSet::from([block(2), block(3)])
        );
        assert_eq!(function.exit, Some(block(4)));
        verify_function(&function).unwrap();
    }

    #[test]
    fn single_source_phis_are_replaced() {
        let mut function = parse_function(indoc! {"
            fn f(%n: i64) {
            .a:
                %v: i64 = add %n, 1
                jmp .b
            .b:
                %p: i64 = phi [.a: %v]
                %q: i64 = mul %p, 2
                ret %q
            }
        "})
        .unwrap();

        simplify_cfg(&mut function).unwrap();

        let entry = function.block(block(0));
        assert!(entry.phis.is_empty());
        assert_eq!(
            entry.instructions[1],
            Instruction::Binary {
                destination: ValueId::new(3),
                operator: BinaryOperator::Mul,
                lhs: Operand::Value(ValueId::new(1)),
                rhs: Operand::Immediate(Immediate::Int(2)),
            }
        );
        assert!(entry.returns());
    }

    #[test]
    fn dead_chains_are_removed_entirely() {
        let mut function = parse_function(indoc! {"
            fn f() {
            .a:
                ret
            .x:
                jmp .y
            .y:
                jmp .z
            .z:
                ret
            }
        "})
        .unwrap();

        let statistics = simplify_cfg(&mut function).unwrap();

        assert_eq!(statistics.removed_blocks, 3);
        assert_eq!(function.blocks.len(), 1);
        assert!(function.cfg_is_current());
    }
}
