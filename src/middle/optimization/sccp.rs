//! Sparse conditional constant propagation. Values and blocks are solved
//! together on a three-level lattice, so constants flowing only through
//! executable paths are found and code on never-taken paths is removed.

use std::collections::VecDeque;

use hashbrown::{HashMap, HashSet};

use crate::{
    diagnostics::{Diagnostic, Diagnostics, report_diagnostic},
    error::InternalError,
    index::IndexVec,
    middle::{
        analysis::cfg,
        lir::{
            BlockId, EvaluationError, Function, Immediate, Instruction, Operand, Terminator,
            UseSite, ValueId,
        },
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatticeCell {
    /// No evidence yet
    Undetermined,
    Constant(Immediate),
    /// Not known at compile time
    Overdefined,
}

impl LatticeCell {
    /// Combines two facts about the same value. Cells only ever move down
    /// from undetermined to constant to overdefined.
    pub fn meet(self, other: LatticeCell) -> LatticeCell {
        match (self, other) {
            (LatticeCell::Undetermined, cell) | (cell, LatticeCell::Undetermined) => cell,
            (LatticeCell::Constant(lhs), LatticeCell::Constant(rhs)) if lhs == rhs => self,
            _ => LatticeCell::Overdefined,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SccpStatistics {
    pub rounds: usize,
    pub removed_blocks: usize,
    /// Phis and instructions, including those of removed blocks
    pub removed_instructions: usize,
    pub rewritten_branches: usize,
}

impl SccpStatistics {
    pub fn changed_anything(&self) -> bool {
        self.removed_blocks != 0 || self.removed_instructions != 0 || self.rewritten_branches != 0
    }

    fn absorb(&mut self, round: SccpStatistics) {
        self.removed_blocks += round.removed_blocks;
        self.removed_instructions += round.removed_instructions;
        self.rewritten_branches += round.rewritten_branches;
    }
}

/// Repeats solve-and-rewrite rounds until a round changes nothing. Leaves the
/// CFG current.
pub fn propagate_constants(
    function: &mut Function,
    diagnostics: &mut Diagnostics,
) -> Result<SccpStatistics, InternalError> {
    let mut statistics = SccpStatistics::default();
    let mut reported = HashSet::new();

    loop {
        cfg::build(function)?;

        let solution = Solver::new(function, diagnostics, &mut reported).solve();
        let round = rewrite(function, &solution);

        statistics.rounds += 1;
        statistics.absorb(round);

        tracing::debug!(
            function = %function.symbol_name,
            round = statistics.rounds,
            removed_blocks = round.removed_blocks,
            removed_instructions = round.removed_instructions,
            rewritten_branches = round.rewritten_branches,
            "sccp round finished"
        );

        if !round.changed_anything() {
            return Ok(statistics);
        }
    }
}

struct Solution {
    cells: IndexVec<ValueId, LatticeCell>,
    executable: HashSet<BlockId>,
}

struct Solver<'a> {
    function: &'a Function,
    diagnostics: &'a mut Diagnostics,
    /// Divisions already reported during this invocation of the pass
    reported: &'a mut HashSet<ValueId>,
    users: HashMap<ValueId, Vec<UseSite>>,
    cells: IndexVec<ValueId, LatticeCell>,
    executable: HashSet<BlockId>,
    /// Control flow edges `(from, to)` known to be taken
    executable_edges: HashSet<(BlockId, BlockId)>,
    value_worklist: VecDeque<ValueId>,
    block_worklist: VecDeque<BlockId>,
}

impl<'a> Solver<'a> {
    fn new(
        function: &'a Function,
        diagnostics: &'a mut Diagnostics,
        reported: &'a mut HashSet<ValueId>,
    ) -> Self {
        let mut cells = IndexVec::from_raw(vec![LatticeCell::Undetermined; function.values.len()]);
        for parameter in &function.parameters {
            cells[*parameter] = LatticeCell::Overdefined;
        }

        Self {
            function,
            diagnostics,
            reported,
            users: function.users(),
            cells,
            executable: HashSet::new(),
            executable_edges: HashSet::new(),
            value_worklist: VecDeque::new(),
            block_worklist: VecDeque::new(),
        }
    }

    fn solve(mut self) -> Solution {
        self.mark_executable(self.function.entry);

        loop {
            while !self.block_worklist.is_empty() || !self.value_worklist.is_empty() {
                while let Some(block) = self.block_worklist.pop_front() {
                    self.visit_block(block);
                }

                while let Some(value) = self.value_worklist.pop_front() {
                    let sites = self.users.get(&value).cloned().unwrap_or_default();

                    for site in sites {
                        if self.executable.contains(&site.block()) {
                            self.visit_site(site);
                        }
                    }
                }
            }

            // A branch on a value that never resolved (e.g. a division by
            // zero) gives no evidence for either target. Both are kept so
            // that no reachable code is deleted.
            if !self.release_undetermined_branches() {
                break;
            }
        }

        Solution {
            cells: self.cells,
            executable: self.executable,
        }
    }

    fn release_undetermined_branches(&mut self) -> bool {
        let stuck = self
            .executable
            .iter()
            .filter_map(|block| match &self.function.block(*block).terminator {
                Terminator::Branch {
                    condition,
                    positive,
                    negative,
                } if self.cell(*condition) == LatticeCell::Undetermined => {
                    Some([(*block, *positive), (*block, *negative)])
                }
                _ => None,
            })
            .flatten()
            .filter(|edge| !self.executable_edges.contains(edge))
            .collect::<Vec<_>>();

        for (from, to) in &stuck {
            self.mark_edge(*from, *to);
        }

        !stuck.is_empty()
    }

    fn cell(&self, operand: Operand) -> LatticeCell {
        match operand {
            Operand::Immediate(immediate) => LatticeCell::Constant(immediate),
            Operand::Value(value) => self.cells[value],
        }
    }

    fn lower(&mut self, value: ValueId, cell: LatticeCell) {
        let current = self.cells[value];
        let lowered = current.meet(cell);

        if lowered != current {
            self.cells[value] = lowered;
            self.value_worklist.push_back(value);
        }
    }

    fn mark_executable(&mut self, block: BlockId) {
        if !self.executable.insert(block) {
            return;
        }

        tracing::trace!(function = %self.function.symbol_name, %block, "block is executable");
        self.block_worklist.push_back(block);
    }

    /// Records that control can flow from `from` to `to`. A block that was
    /// already visited gains an incoming path, so its phis are merged again.
    fn mark_edge(&mut self, from: BlockId, to: BlockId) {
        if !self.executable_edges.insert((from, to)) {
            return;
        }

        if self.executable.contains(&to) {
            for index in 0..self.function.block(to).phis.len() {
                self.visit_phi(to, index);
            }
        } else {
            self.mark_executable(to);
        }
    }

    fn visit_block(&mut self, block: BlockId) {
        let function = self.function;
        let contents = function.block(block);

        for index in 0..contents.phis.len() {
            self.visit_phi(block, index);
        }

        for instruction in &contents.instructions {
            self.visit_instruction(block, instruction);
        }

        self.visit_terminator(block);
    }

    fn visit_site(&mut self, site: UseSite) {
        let function = self.function;

        match site {
            UseSite::Phi { block, index } => self.visit_phi(block, index),
            UseSite::Instruction { block, index } => {
                self.visit_instruction(block, &function.block(block).instructions[index])
            }
            UseSite::Terminator { block } => self.visit_terminator(block),
        }
    }

    fn visit_phi(&mut self, block: BlockId, index: usize) {
        let function = self.function;
        let phi = &function.block(block).phis[index];

        let merged = phi
            .sources
            .iter()
            .filter(|(predecessor, _)| self.executable_edges.contains(&(**predecessor, block)))
            .fold(LatticeCell::Undetermined, |merged, (_, operand)| {
                merged.meet(self.cell(*operand))
            });

        if merged != LatticeCell::Undetermined {
            self.lower(phi.destination, merged);
        }
    }

    fn visit_instruction(&mut self, block: BlockId, instruction: &Instruction) {
        match instruction {
            Instruction::Alloca { destination, .. }
            | Instruction::Load { destination, .. }
            | Instruction::Offset { destination, .. } => {
                self.lower(*destination, LatticeCell::Overdefined)
            }
            Instruction::Call { destination, .. } => {
                if let Some(destination) = destination {
                    self.lower(*destination, LatticeCell::Overdefined);
                }
            }
            Instruction::Store { .. } => {}
            Instruction::Move {
                destination,
                source,
            } => self.lower(*destination, self.cell(*source)),
            Instruction::Cast {
                destination,
                operand,
                ty,
            } => {
                let cell = match self.cell(*operand) {
                    LatticeCell::Constant(constant) => constant
                        .cast(*ty)
                        .map_or(LatticeCell::Overdefined, LatticeCell::Constant),
                    cell => cell,
                };
                self.lower(*destination, cell);
            }
            Instruction::Binary {
                operator,
                destination,
                lhs,
                rhs,
            } => {
                let cell = match (self.cell(*lhs), self.cell(*rhs)) {
                    (LatticeCell::Constant(lhs), LatticeCell::Constant(rhs)) => {
                        match operator.evaluate(lhs, rhs) {
                            Ok(folded) => LatticeCell::Constant(folded),
                            Err(EvaluationError::DivisionByZero) => {
                                if self.reported.insert(*destination) {
                                    report_diagnostic!(
                                        self.diagnostics,
                                        Diagnostic::DivisionByZero {
                                            function: self.function.symbol_name,
                                            block,
                                            operator: *operator,
                                            value: *destination,
                                        }
                                    );
                                }
                                LatticeCell::Undetermined
                            }
                            Err(EvaluationError::IncompatibleOperands) => LatticeCell::Overdefined,
                        }
                    }
                    (LatticeCell::Overdefined, LatticeCell::Constant(zero))
                    | (LatticeCell::Constant(zero), LatticeCell::Overdefined)
                        if operator.is_annihilated_by_zero() && is_zero(zero) =>
                    {
                        LatticeCell::Constant(zero)
                    }
                    (LatticeCell::Overdefined, _) | (_, LatticeCell::Overdefined) => {
                        LatticeCell::Overdefined
                    }
                    _ => LatticeCell::Undetermined,
                };

                self.lower(*destination, cell);
            }
            Instruction::Compare {
                operator,
                destination,
                lhs,
                rhs,
            } => {
                let cell = match (self.cell(*lhs), self.cell(*rhs)) {
                    (LatticeCell::Constant(lhs), LatticeCell::Constant(rhs)) => operator
                        .evaluate(lhs, rhs)
                        .map_or(LatticeCell::Overdefined, |result| {
                            LatticeCell::Constant(Immediate::Bool(result))
                        }),
                    (LatticeCell::Overdefined, _) | (_, LatticeCell::Overdefined) => {
                        match (lhs, rhs, operator.reflexive_result()) {
                            (Operand::Value(lhs), Operand::Value(rhs), Some(result))
                                if lhs == rhs =>
                            {
                                LatticeCell::Constant(Immediate::Bool(result))
                            }
                            _ => LatticeCell::Overdefined,
                        }
                    }
                    _ => LatticeCell::Undetermined,
                };

                self.lower(*destination, cell);
            }
        }
    }

    fn visit_terminator(&mut self, block: BlockId) {
        match self.function.block(block).terminator {
            Terminator::Jump { destination } => self.mark_edge(block, destination),
            Terminator::Branch {
                condition,
                positive,
                negative,
            } => match self.cell(condition) {
                LatticeCell::Undetermined => {}
                LatticeCell::Constant(constant) => match constant.as_condition() {
                    Some(true) => self.mark_edge(block, positive),
                    Some(false) => self.mark_edge(block, negative),
                    None => {
                        self.mark_edge(block, positive);
                        self.mark_edge(block, negative);
                    }
                },
                LatticeCell::Overdefined => {
                    self.mark_edge(block, positive);
                    self.mark_edge(block, negative);
                }
            },
            Terminator::Return { .. } => {}
        }
    }
}

fn is_zero(immediate: Immediate) -> bool {
    matches!(immediate, Immediate::Int(0) | Immediate::Bool(false))
}

/// Applies a solution: deletes blocks that never execute, replaces values
/// with their constants and turns decided branches into jumps
fn rewrite(function: &mut Function, solution: &Solution) -> SccpStatistics {
    let mut statistics = SccpStatistics::default();

    /* Unreachable blocks */

    let dead = function
        .blocks
        .keys()
        .filter(|block| !solution.executable.contains(*block))
        .copied()
        .collect::<Vec<_>>();

    for block in &dead {
        let predecessors = function.block(*block).predecessors.clone();

        for predecessor in predecessors {
            if !solution.executable.contains(&predecessor) {
                continue;
            }

            // a live predecessor can only reach a dead block through the
            // untaken side of a decided branch
            if let Terminator::Branch {
                positive, negative, ..
            } = function.block(predecessor).terminator
            {
                let taken = if positive == *block { negative } else { positive };
                function.set_terminator(predecessor, Terminator::Jump { destination: taken });
                statistics.rewritten_branches += 1;
            }
        }

        if let Some(removed) = function.remove_block(*block) {
            for successor in &removed.successors {
                if let Some(successor) = function.blocks.get_mut(successor) {
                    successor.remove_phi_source(*block);
                }
            }

            statistics.removed_blocks += 1;
            statistics.removed_instructions += removed.phis.len() + removed.instructions.len();
        }
    }

    /* Constant values */

    let constant = |value: ValueId| match solution.cells[value] {
        LatticeCell::Constant(constant) => Some(Operand::Immediate(constant)),
        _ => None,
    };

    let mut substitutions = HashMap::new();
    for block in function.blocks.values_mut() {
        let before = block.phis.len() + block.instructions.len();

        block.phis.retain(|phi| match constant(phi.destination) {
            Some(operand) => {
                substitutions.insert(phi.destination, operand);
                false
            }
            None => true,
        });

        block.instructions.retain(|instruction| {
            let folded = match instruction {
                Instruction::Binary { destination, .. }
                | Instruction::Compare { destination, .. }
                | Instruction::Cast { destination, .. }
                | Instruction::Move { destination, .. } => constant(*destination),
                _ => None,
            };

            match (folded, instruction.destination()) {
                (Some(operand), Some(destination)) => {
                    substitutions.insert(destination, operand);
                    false
                }
                _ => true,
            }
        });

        statistics.removed_instructions += before - block.phis.len() - block.instructions.len();
    }
    function.replace_uses(&substitutions);

    /* Decided branches */

    let decided = function
        .blocks
        .values()
        .filter_map(|block| match block.terminator {
            Terminator::Branch {
                condition: Operand::Immediate(condition),
                positive,
                negative,
            } => condition
                .as_condition()
                .map(|taken| (block.id, taken, positive, negative)),
            _ => None,
        })
        .collect::<Vec<_>>();

    for (block, taken, positive, negative) in decided {
        let (target, abandoned) = if taken {
            (positive, negative)
        } else {
            (negative, positive)
        };

        function.set_terminator(block, Terminator::Jump { destination: target });
        if abandoned != target {
            function.block_mut(abandoned).remove_phi_source(block);
        }
        statistics.rewritten_branches += 1;
    }

    statistics
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
        middle::lir::{
            BinaryOperator, Type,
            interpret::{RuntimeValue, interpret},
            parser::parse_function,
            verify::verify_function,
        },
    };

    fn optimize(source: &str) -> (Function, SccpStatistics, Diagnostics) {
        let mut function = parse_function(source).unwrap();
        let mut diagnostics = Diagnostics::new();
        let statistics = propagate_constants(&mut function, &mut diagnostics).unwrap();
        verify_function(&function).unwrap();
        (function, statistics, diagnostics)
    }

    fn returned(function: &Function) -> Option<Operand> {
        let exit = function.exit.unwrap();
        match function.block(exit).terminator {
            Terminator::Return { value } => value,
            _ => panic!("exit block does not return"),
        }
    }

    fn int(value: i64) -> Option<Operand> {
        Some(Operand::Immediate(Immediate::Int(value)))
    }

    #[test]
    fn meet_only_moves_down() {
        let five = LatticeCell::Constant(Immediate::Int(5));
        let six = LatticeCell::Constant(Immediate::Int(6));

        assert_eq!(LatticeCell::Undetermined.meet(five), five);
        assert_eq!(five.meet(LatticeCell::Undetermined), five);
        assert_eq!(five.meet(five), five);
        assert_eq!(five.meet(six), LatticeCell::Overdefined);
        assert_eq!(
            LatticeCell::Overdefined.meet(LatticeCell::Undetermined),
            LatticeCell::Overdefined
        );
    }

    #[test]
    fn folds_straight_line_code() {
        let (function, statistics, _) = optimize(indoc! {"
            fn f() {
            .a:
                %x: i64 = add 2, 3
                %y: i64 = mul %x, %x
                %z: bool = gt %y, 20
                %w: i64 = cast %z as i64
                %v: i64 = sub %y, %w
                ret %v
            }
        "});

        assert_eq!(returned(&function), int(24));
        assert!(function.block(BlockId::new(0)).instructions.is_empty());
        assert_eq!(statistics.removed_instructions, 5);
    }

    #[test]
    fn constant_false_branch_removes_its_block() {
        let (function, _, _) = optimize(indoc! {"
            fn f(%x: i64) {
            .entry:
                %c: bool = gt 1, 2
                br %c .then .else
            .then:
                %a: i64 = add %x, 1
                jmp .join
            .else:
                %b: i64 = mul %x, 2
                jmp .join
            .join:
                %p: i64 = phi [.then: %a, .else: %b]
                ret %p
            }
        "});

        let then = BlockId::new(1);
        let otherwise = BlockId::new(2);
        let join = BlockId::new(3);

        assert!(!function.blocks.contains_key(&then));
        assert_eq!(
            function.block(BlockId::new(0)).terminator,
            Terminator::Jump {
                destination: otherwise
            }
        );

        let phi = &function.block(join).phis[0];
        assert_eq!(phi.sources.keys().copied().collect::<Vec<_>>(), vec![otherwise]);
    }

    #[test]
    fn loop_invariant_phi_becomes_constant() {
        let (function, _, _) = optimize(indoc! {"
            fn f(%n: i64) {
            .entry:
                jmp .loop
            .loop:
                %k: i64 = phi [.entry: 7, .loop: %k2]
                %i: i64 = phi [.entry: 0, .loop: %j]
                %k2: i64 = mul %k, 1
                %j: i64 = add %i, 1
                %c: bool = lt %j, %n
                br %c .loop .exit
            .exit:
                ret %k
            }
        "});

        assert_eq!(returned(&function), int(7));
        assert_eq!(function.block(BlockId::new(1)).phis.len(), 1);
    }

    #[test]
    fn short_circuits_zero_and_reflexive_compare() {
        let (function, _, _) = optimize(indoc! {"
            fn f(%a: i64) {
            .entry:
                %z: i64 = mul %a, 0
                %e: bool = le %a, %a
                br %e .yes .no
            .yes:
                ret %z
            .no:
                ret 1
            }
        "});

        assert!(!function.blocks.contains_key(&BlockId::new(2)));
        assert_eq!(returned(&function), int(0));
    }

    #[test]
    fn overdefined_operands_are_not_guessed() {
        let (function, _, _) = optimize(indoc! {"
            fn f(%a: i64) {
            .entry:
                %s: i64 = add %a, 0
                %l: bool = lt %a, %a
                br %l .yes .no
            .yes:
                ret %s
            .no:
                ret 1
            }
        "});

        assert_eq!(function.blocks.len(), 3);
        assert_eq!(function.block(BlockId::new(0)).instructions.len(), 2);
    }

    #[test]
    fn division_by_zero_is_reported_once_and_kept() {
        let (function, statistics, diagnostics) = optimize(indoc! {"
            fn f() {
            .entry:
                %d: i64 = div 1, 0
                %c: bool = eq %d, 0
                br %c .a .b
            .a:
                %x: i64 = add 1, 1
                ret %x
            .b:
                ret 2
            }
        "});

        assert_eq!(diagnostics.len(), 1);
        assert!(matches!(
            diagnostics.iter().next(),
            Some(Diagnostic::DivisionByZero {
                operator: BinaryOperator::Div,
                ..
            })
        ));
        assert_eq!(function.blocks.len(), 3);
        assert_eq!(function.block(BlockId::new(0)).instructions.len(), 2);
        assert_eq!(statistics.removed_blocks, 0);
    }

    #[test]
    fn moves_adopt_constants() {
        let (function, statistics, _) = optimize(indoc! {"
            fn f(%n: i64) {
            .a:
                %m: i64 = 5
                %k: i64 = add %m, 1
                %o: i64 = %n
                %s: i64 = add %o, %k
                ret %s
            }
        "});

        assert_eq!(
            function.block(BlockId::new(0)).instructions,
            vec![
                Instruction::Move {
                    destination: ValueId::new(3),
                    source: Operand::Value(ValueId::new(0)),
                },
                Instruction::Binary {
                    operator: BinaryOperator::Add,
                    destination: ValueId::new(4),
                    lhs: Operand::Value(ValueId::new(3)),
                    rhs: Operand::Immediate(Immediate::Int(6)),
                },
            ]
        );
        assert_eq!(statistics.removed_instructions, 2);
    }

    #[test]
    fn move_of_varying_phi_is_kept() {
        let (function, statistics, _) = optimize(indoc! {"
            fn f(%n: i64) {
            .entry:
                jmp .loop
            .loop:
                %i: i64 = phi [.entry: 0, .loop: %j]
                %copy: i64 = %i
                %j: i64 = add %copy, 1
                %c: bool = lt %j, %n
                br %c .loop .exit
            .exit:
                ret %copy
            }
        "});

        let body = function.block(BlockId::new(1));
        assert_eq!(body.phis.len(), 1);

        let Instruction::Move {
            destination,
            source,
        } = body.instructions[0]
        else {
            panic!("expected the copy to survive");
        };
        assert_eq!(source, Operand::Value(body.phis[0].destination));
        assert_eq!(returned(&function), Some(Operand::Value(destination)));
        assert_eq!(statistics.removed_instructions, 0);
    }

    #[test]
    fn memory_and_call_results_block_folding() {
        let (function, statistics, _) = optimize(indoc! {"
            fn f() {
            .a:
                %p: ptr = alloca i64
                store %p <- 4
                %l: i64 = load %p
                %m: i64 = mul %l, 1
                %r: i64 = call next()
                %s: i64 = add %r, 0
                %q: ptr = offset %p, 0
                %e: bool = eq %q, null
                %w: i64 = cast %e as i64
                %t: i64 = add %m, %s
                %u: i64 = add %t, %w
                ret %u
            }
        "});

        assert_eq!(function.block(BlockId::new(0)).instructions.len(), 11);
        assert!(matches!(returned(&function), Some(Operand::Value(_))));
        assert_eq!(
            statistics,
            SccpStatistics {
                rounds: 1,
                ..SccpStatistics::default()
            }
        );
    }

    #[test]
    fn phis_ignore_untaken_edges_of_live_blocks() {
        let (function, statistics, _) = optimize(indoc! {"
            fn f() {
            .a:
                br true .b .c
            .b:
                jmp .c
            .c:
                %p: i64 = phi [.a: 1, .b: 2]
                ret %p
            }
        "});

        assert_eq!(returned(&function), int(2));
        assert!(function.block(BlockId::new(2)).phis.is_empty());
        // one round folds the phi along with the branch, one confirms
        assert_eq!(statistics.rounds, 2);
    }

    #[test]
    fn second_run_changes_nothing() {
        let source = indoc! {"
            fn f(%n: i64) {
            .entry:
                %c: bool = eq 4, 4
                br %c .loop .exit
            .loop:
                %i: i64 = phi [.entry: 0, .loop: %j]
                %j: i64 = add %i, 2
                %d: bool = lt %j, %n
                br %d .loop .exit
            .exit:
                %r: i64 = phi [.entry: -1, .loop: %j]
                ret %r
            }
        "};
        let (mut function, first, _) = optimize(source);
        assert!(first.changed_anything());

        let second = propagate_constants(&mut function, &mut Diagnostics::new()).unwrap();
        assert_eq!(
            second,
            SccpStatistics {
                rounds: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn optimized_function_behaves_the_same() {
        let source = indoc! {"
            fn f(%n: i64) {
            .entry:
                %limit: i64 = mul 3, 4
                jmp .loop
            .loop:
                %i: i64 = phi [.entry: 0, .body: %j]
                %acc: i64 = phi [.entry: 0, .body: %acc2]
                %c: bool = lt %i, %limit
                br %c .body .exit
            .body:
                %scaled: i64 = mul %i, %n
                %acc2: i64 = add %acc, %scaled
                %j: i64 = add %i, 1
                jmp .loop
            .exit:
                ret %acc
            }
        "};
        let original = parse_function(source).unwrap();
        let (optimized, _, _) = optimize(source);

        for n in [-3, 0, 2, 9] {
            let arguments = [RuntimeValue::Int(n)];
            assert_eq!(
                interpret(&original, &arguments).unwrap(),
                interpret(&optimized, &arguments).unwrap()
            );
        }
    }

    /// Folding a single binary instruction
    fn fold(operator: BinaryOperator, lhs: i64, rhs: i64) -> (Function, Diagnostics) {
        let mut function = Function::new(InternedSymbol::new("fold"));
        let result = function.create_value(Type::Int);
        let block = function.create_block();
        function.block_mut(block).instructions.push(Instruction::Binary {
            operator,
            destination: result,
            lhs: Operand::Immediate(Immediate::Int(lhs)),
            rhs: Operand::Immediate(Immediate::Int(rhs)),
        });
        function.set_terminator(
            block,
            Terminator::Return {
                value: Some(Operand::Value(result)),
            },
        );
        function.exit = Some(block);

        let mut diagnostics = Diagnostics::new();
        propagate_constants(&mut function, &mut diagnostics).unwrap();
        (function, diagnostics)
    }

    fn expected(operator: BinaryOperator, lhs: i64, rhs: i64) -> Option<i64> {
        Some(match operator {
            BinaryOperator::Add => lhs.wrapping_add(rhs),
            BinaryOperator::Sub => lhs.wrapping_sub(rhs),
            BinaryOperator::Mul => lhs.wrapping_mul(rhs),
            // only `i64::MIN / -1` overflows, and it wraps
            BinaryOperator::Div => lhs
                .checked_div(rhs)
                .or((rhs == -1).then_some(lhs.wrapping_neg()))?,
            BinaryOperator::Mod => lhs.checked_rem(rhs).or((rhs == -1).then_some(0))?,
            BinaryOperator::And => lhs & rhs,
            BinaryOperator::Or => lhs | rhs,
            BinaryOperator::Xor => lhs ^ rhs,
            BinaryOperator::Shl => lhs << (rhs & 63),
            BinaryOperator::Shr => lhs >> (rhs & 63),
        })
    }

    fn operand() -> impl Strategy<Value = i64> {
        prop_oneof![
            -4i64..=4,
            Just(i64::MIN),
            Just(i64::MAX),
            any::<i64>(),
        ]
    }

    proptest! {
        #[test]
        fn folding_matches_native_arithmetic(
            operator in proptest::sample::select(vec![
                BinaryOperator::Add,
                BinaryOperator::Sub,
                BinaryOperator::Mul,
                BinaryOperator::Div,
                BinaryOperator::Mod,
                BinaryOperator::And,
                BinaryOperator::Or,
                BinaryOperator::Xor,
                BinaryOperator::Shl,
                BinaryOperator::Shr,
            ]),
            lhs in operand(),
            rhs in operand(),
        ) {
            let (function, diagnostics) = fold(operator, lhs, rhs);

            match expected(operator, lhs, rhs) {
                Some(value) => {
                    prop_assert_eq!(returned(&function), int(value));
                    prop_assert!(diagnostics.is_empty());
                }
                None => {
                    prop_assert_eq!(rhs, 0);
                    prop_assert_eq!(diagnostics.len(), 1);
                    prop_assert_eq!(function.block(BlockId::new(0)).instructions.len(), 1);
                }
            }
        }
    }
}
