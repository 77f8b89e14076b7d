use std::collections::BTreeSet;

use crate::{error::InternalError, middle::lir::Function};

/// Recomputes every block's predecessor and successor sets from the
/// terminators. Must run again after any terminator rewrite before dominance
/// information is trusted.
pub fn build(function: &mut Function) -> Result<(), InternalError> {
    for block in function.blocks.values_mut() {
        block.predecessors.clear();
        block.successors.clear();
    }

    let edges = function
        .blocks
        .values()
        .flat_map(|block| block.terminator.targets().map(move |target| (block.id, target)))
        .collect::<BTreeSet<_>>();

    for (source, target) in edges {
        let Some(target_block) = function.blocks.get_mut(&target) else {
            return Err(InternalError::UnknownBlock {
                function: function.symbol_name,
                block: target,
            });
        };

        target_block.predecessors.insert(source);
        function.block_mut(source).successors.insert(target);
    }

    tracing::trace!(function = %function.symbol_name, blocks = function.blocks.len(), "rebuilt cfg");
    function.mark_cfg_current();

    Ok(())
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        index::Index,
        middle::lir::{BlockId, Terminator, parser::parse_function},
    };

    #[test]
    fn links_jumps_and_branches() {
        let mut function = parse_function(indoc! {"
            fn diamond(%c: bool) {
            .a:
                br %c .b .c
            .b:
                jmp .d
            .c:
                jmp .d
            .d:
                ret
            }
        "})
        .unwrap();

        assert!(!function.cfg_is_current());
        build(&mut function).unwrap();
        assert!(function.cfg_is_current());

        let block = |n| function.block(BlockId::new(n));
        assert_eq!(
            block(0).successors,
            BTreeSet::from([BlockId::new(1), BlockId::new(2)])
        );
        assert_eq!(
            block(3).predecessors,
            BTreeSet::from([BlockId::new(1), BlockId::new(2)])
        );
        assert!(block(0).predecessors.is_empty());
        assert!(block(3).successors.is_empty());
    }

    #[test]
    fn rebuilding_drops_old_edges() {
        let mut function = parse_function(indoc! {"
            fn f(%c: bool) {
            .a:
                br %c .b .c
            .b:
                ret
            .c:
                ret
            }
        "})
        .unwrap();
        build(&mut function).unwrap();

        function.set_terminator(
            BlockId::new(0),
            Terminator::Jump {
                destination: BlockId::new(2),
            },
        );
        assert!(function.require_current_cfg().is_err());

        build(&mut function).unwrap();
        assert!(function.block(BlockId::new(1)).predecessors.is_empty());
        assert_eq!(
            function.block(BlockId::new(0)).successors,
            BTreeSet::from([BlockId::new(2)])
        );
    }

    #[test]
    fn same_target_twice_is_one_edge() {
        let mut function = parse_function(indoc! {"
            fn f(%c: bool) {
            .a:
                br %c .b .b
            .b:
                ret
            }
        "})
        .unwrap();
        build(&mut function).unwrap();

        assert_eq!(
            function.block(BlockId::new(1)).predecessors,
            BTreeSet::from([BlockId::new(0)])
        );
    }
}
