//! Dominator tree and dominance frontiers, computed with the iterative
//! algorithm of Cooper, Harvey and Kennedy ("A Simple, Fast Dominance
//! Algorithm") over reverse postorder.

use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashMap;

use crate::{
    error::InternalError,
    middle::lir::{BlockId, Function},
};

#[derive(Debug, Clone)]
pub struct DominatorTree {
    entry: BlockId,
    /// Absent for the entry block and for unreachable blocks
    immediate_dominators: BTreeMap<BlockId, BlockId>,
    /// Children in block order
    children: BTreeMap<BlockId, Vec<BlockId>>,
    frontiers: BTreeMap<BlockId, BTreeSet<BlockId>>,
    unreachable: Vec<BlockId>,
}

impl DominatorTree {
    /// Blocks which cannot be reached from the entry take no part in the
    /// computation and are listed in [`DominatorTree::unreachable`] for the
    /// caller to remove.
    pub fn compute(function: &Function) -> Result<Self, InternalError> {
        function.require_current_cfg()?;

        let entry = function.entry;
        let reverse_postorder = reverse_postorder(function, entry);
        let order = reverse_postorder
            .iter()
            .enumerate()
            .map(|(i, block)| (*block, i))
            .collect::<HashMap<_, _>>();

        // the entry temporarily dominates itself so that intersection stops there
        let mut idom: HashMap<BlockId, BlockId> = HashMap::from([(entry, entry)]);

        let mut changed = true;
        while changed {
            changed = false;

            for block in reverse_postorder.iter().skip(1) {
                let mut processed = function
                    .block(*block)
                    .predecessors
                    .iter()
                    .filter(|predecessor| idom.contains_key(*predecessor));

                let Some(first) = processed.next() else {
                    continue;
                };

                let new_idom = processed.fold(*first, |current, predecessor| {
                    intersect(&idom, &order, current, *predecessor)
                });

                if idom.get(block) != Some(&new_idom) {
                    idom.insert(*block, new_idom);
                    changed = true;
                }
            }
        }

        idom.remove(&entry);
        let immediate_dominators = idom.into_iter().collect::<BTreeMap<_, _>>();

        let mut children: BTreeMap<BlockId, Vec<BlockId>> = BTreeMap::new();
        for (block, parent) in &immediate_dominators {
            children.entry(*parent).or_default().push(*block);
        }

        let mut frontiers: BTreeMap<BlockId, BTreeSet<BlockId>> = BTreeMap::new();
        for block in &reverse_postorder {
            let stop = immediate_dominators.get(block).copied();

            for predecessor in &function.block(*block).predecessors {
                if !order.contains_key(predecessor) {
                    continue;
                }

                let mut runner = Some(*predecessor);
                while let Some(current) = runner {
                    if Some(current) == stop {
                        break;
                    }

                    frontiers.entry(current).or_default().insert(*block);
                    runner = immediate_dominators.get(&current).copied();
                }
            }
        }

        let unreachable = function
            .blocks
            .keys()
            .filter(|block| !order.contains_key(*block))
            .copied()
            .collect::<Vec<_>>();

        tracing::trace!(
            function = %function.symbol_name,
            reachable = reverse_postorder.len(),
            unreachable = unreachable.len(),
            "computed dominator tree"
        );

        Ok(Self {
            entry,
            immediate_dominators,
            children,
            frontiers,
            unreachable,
        })
    }

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    pub fn immediate_dominator(&self, block: BlockId) -> Option<BlockId> {
        self.immediate_dominators.get(&block).copied()
    }

    pub fn children(&self, block: BlockId) -> &[BlockId] {
        self.children.get(&block).map_or(&[], Vec::as_slice)
    }

    pub fn frontier(&self, block: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        self.frontiers.get(&block).into_iter().flatten().copied()
    }

    pub fn unreachable(&self) -> &[BlockId] {
        &self.unreachable
    }

    pub fn is_reachable(&self, block: BlockId) -> bool {
        block == self.entry || self.immediate_dominators.contains_key(&block)
    }

    /// Every block dominates itself. Unreachable blocks dominate nothing.
    pub fn dominates(&self, dominator: BlockId, block: BlockId) -> bool {
        if !self.is_reachable(dominator) || !self.is_reachable(block) {
            return false;
        }

        let mut current = Some(block);
        while let Some(id) = current {
            if id == dominator {
                return true;
            }
            current = self.immediate_dominator(id);
        }

        false
    }

    pub fn strictly_dominates(&self, dominator: BlockId, block: BlockId) -> bool {
        dominator != block && self.dominates(dominator, block)
    }
}

/// Walks both fingers up the tree until they meet
fn intersect(
    idom: &HashMap<BlockId, BlockId>,
    order: &HashMap<BlockId, usize>,
    mut lhs: BlockId,
    mut rhs: BlockId,
) -> BlockId {
    while lhs != rhs {
        while order[&lhs] > order[&rhs] {
            lhs = idom[&lhs];
        }
        while order[&rhs] > order[&lhs] {
            rhs = idom[&rhs];
        }
    }

    lhs
}

fn reverse_postorder(function: &Function, entry: BlockId) -> Vec<BlockId> {
    let mut visited = BTreeSet::from([entry]);
    let mut postorder = Vec::with_capacity(function.blocks.len());
    let mut stack = vec![(entry, function.block(entry).successors.iter())];

    while let Some((block, successors)) = stack.last_mut() {
        match successors.find(|successor| !visited.contains(*successor)) {
            Some(successor) => {
                let successor = *successor;
                visited.insert(successor);
                stack.push((successor, function.block(successor).successors.iter()));
            }
            None => {
                postorder.push(*block);
                stack.pop();
            }
        }
    }

    postorder.reverse();
    postorder
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;
    use crate::{
        index::Index,
        intern::InternedSymbol,
        middle::{
            analysis::cfg,
            lir::{Operand, Terminator, Type, parser::parse_function},
        },
    };

    fn id(n: usize) -> BlockId {
        BlockId::new(n)
    }

    fn frontier(tree: &DominatorTree, block: usize) -> Vec<BlockId> {
        tree.frontier(id(block)).collect()
    }

    #[test]
    fn diamond_with_loop() {
        // .a -> .b -> {.c, .d} -> .e -> {.b, .f}
        let mut function = parse_function(indoc! {"
            fn f(%x: bool) {
            .a:
                jmp .b
            .b:
                br %x .c .d
            .c:
                jmp .e
            .d:
                jmp .e
            .e:
                br %x .b .f
            .f:
                ret
            .dead:
                jmp .f
            }
        "})
        .unwrap();
        cfg::build(&mut function).unwrap();
        let tree = DominatorTree::compute(&function).unwrap();

        assert_eq!(tree.immediate_dominator(id(0)), None);
        assert_eq!(tree.immediate_dominator(id(1)), Some(id(0)));
        assert_eq!(tree.immediate_dominator(id(4)), Some(id(1)));
        assert_eq!(tree.immediate_dominator(id(5)), Some(id(4)));
        assert_eq!(tree.children(id(1)), &[id(2), id(3), id(4)]);

        assert_eq!(frontier(&tree, 2), vec![id(4)]);
        assert_eq!(frontier(&tree, 3), vec![id(4)]);
        assert_eq!(frontier(&tree, 4), vec![id(1)]);
        assert_eq!(frontier(&tree, 1), vec![id(1)]);
        assert_eq!(frontier(&tree, 0), vec![]);

        assert_eq!(tree.unreachable(), &[id(6)]);
        assert!(tree.dominates(id(1), id(5)));
        assert!(!tree.dominates(id(2), id(4)));
        assert!(!tree.strictly_dominates(id(4), id(4)));
        assert!(!tree.dominates(id(6), id(5)));
    }

    #[test]
    fn stale_cfg_is_refused() {
        let function = parse_function("fn f() { .a: ret }").unwrap();

        assert!(matches!(
            DominatorTree::compute(&function),
            Err(InternalError::StaleCfg { .. })
        ));
    }

    /// Builds a function over `shapes.len()` blocks where each shape picks a
    /// return (0), a jump (1) or a branch (2) to the given targets
    fn random_function(shapes: &[(u8, usize, usize)]) -> Function {
        let mut function = Function::new(InternedSymbol::new("random"));
        let condition = function.create_parameter(Type::Bool);
        let blocks = shapes
            .iter()
            .map(|_| function.create_block())
            .collect::<Vec<_>>();

        for (block, (kind, first, second)) in blocks.iter().zip(shapes) {
            let first = blocks[first % blocks.len()];
            let second = blocks[second % blocks.len()];

            let terminator = match kind % 3 {
                0 => Terminator::Return { value: None },
                1 => Terminator::Jump { destination: first },
                _ => Terminator::Branch {
                    condition: Operand::Value(condition),
                    positive: first,
                    negative: second,
                },
            };
            function.set_terminator(*block, terminator);
        }

        function
    }

    /// Blocks reachable from the entry without passing through `removed`
    fn reachable_without(function: &Function, removed: Option<BlockId>) -> BTreeSet<BlockId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![function.entry];

        while let Some(block) = stack.pop() {
            if Some(block) == removed || !seen.insert(block) {
                continue;
            }
            stack.extend(function.block(block).successors.iter().copied());
        }

        seen
    }

    proptest! {
        #[test]
        fn frontiers_match_definition(
            shapes in prop::collection::vec((0u8..3, 0usize..8, 0usize..8), 1..9)
        ) {
            let mut function = random_function(&shapes);
            cfg::build(&mut function).unwrap();
            let tree = DominatorTree::compute(&function).unwrap();

            let reachable = reachable_without(&function, None);
            let dominates = |a: BlockId, b: BlockId| {
                a == b || a == function.entry || !reachable_without(&function, Some(a)).contains(&b)
            };

            for a in &reachable {
                for b in &reachable {
                    prop_assert_eq!(tree.dominates(*a, *b), dominates(*a, *b));
                }

                let expected = reachable
                    .iter()
                    .filter(|b| {
                        let strictly = *a != **b && dominates(*a, **b);
                        !strictly
                            && function
                                .block(**b)
                                .predecessors
                                .iter()
                                .any(|p| reachable.contains(p) && dominates(*a, *p))
                    })
                    .copied()
                    .collect::<Vec<_>>();

                prop_assert_eq!(tree.frontier(*a).collect::<Vec<_>>(), expected);
            }

            prop_assert_eq!(
                tree.unreachable().len() + reachable.len(),
                function.blocks.len()
            );
        }
    }
}
