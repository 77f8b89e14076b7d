//! LIR (Low-level Intermediate Representation). In this form, loops and
//! conditionals are simplified to labels and jumps, expression trees are
//! flattened into ordered operations over virtual values, and local variables
//! live in stack slots until SSA construction promotes them.

use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashMap;
use strum::{Display, EnumIter, EnumString};

use crate::{
    error::InternalError,
    index::{Index, IndexVec, simple_index},
    intern::InternedSymbol,
};

pub mod interpret;
pub mod lexer;
pub mod parser;
pub mod pretty_print;
pub mod verify;

#[derive(Debug, Clone, Default)]
pub struct Module {
    pub functions: Vec<Function>,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub symbol_name: InternedSymbol,
    /// Every value defined in the function: parameters, instruction results
    /// and temporaries introduced by passes
    pub values: IndexVec<ValueId, Value>,
    pub parameters: Vec<ValueId>,
    /// Blocks in layout order
    pub blocks: BTreeMap<BlockId, Block>,
    pub entry: BlockId,
    /// The block holding the function's return, if it is still reachable
    pub exit: Option<BlockId>,
    next_block_id: BlockId,
    cfg_current: bool,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub phis: Vec<Phi>,
    pub instructions: Vec<Instruction>,
    pub terminator: Terminator,
    pub predecessors: BTreeSet<BlockId>,
    pub successors: BTreeSet<BlockId>,
}

simple_index! {
    /// Identifies an LIR block
    pub struct BlockId;
}

impl BlockId {
    pub const ZERO: Self = Self(0);
}

simple_index! {
    /// Identifies a virtual LIR value. Each value has exactly one defining
    /// instruction, phi or parameter slot while the function is in SSA form.
    pub struct ValueId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Value {
    pub id: ValueId,
    pub ty: Type,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display)]
pub enum Type {
    #[strum(serialize = "i64")]
    Int,
    #[strum(serialize = "bool")]
    Bool,
    #[strum(serialize = "ptr")]
    Pointer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Reserves a stack slot and defines its address
    Alloca {
        destination: ValueId,
        ty: Type,
    },
    Load {
        destination: ValueId,
        source: Operand,
    },
    Store {
        destination: Operand,
        source: Operand,
    },
    Binary {
        operator: BinaryOperator,
        destination: ValueId,
        lhs: Operand,
        rhs: Operand,
    },
    Compare {
        operator: CompareOperator,
        destination: ValueId,
        lhs: Operand,
        rhs: Operand,
    },
    Call {
        destination: Option<ValueId>,
        target: InternedSymbol,
        arguments: Vec<Operand>,
    },
    Cast {
        destination: ValueId,
        operand: Operand,
        ty: Type,
    },
    Move {
        destination: ValueId,
        source: Operand,
    },
    /// Pointer arithmetic: `base + offset` cells
    Offset {
        destination: ValueId,
        base: Operand,
        offset: Operand,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Jump {
        destination: BlockId,
    },
    Branch {
        condition: Operand,
        positive: BlockId,
        negative: BlockId,
    },
    Return {
        value: Option<Operand>,
    },
}

/// Selects one incoming operand per predecessor block
#[derive(Debug, Clone, PartialEq)]
pub struct Phi {
    pub destination: ValueId,
    pub sources: BTreeMap<BlockId, Operand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Immediate {
    Int(i64),
    Bool(bool),
    /// Placeholder for values that are read before any definition reaches them
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Immediate(Immediate),
    Value(ValueId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum CompareOperator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Why two constants could not be folded into a third
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EvaluationError {
    #[error("division by zero")]
    DivisionByZero,
    #[error("operands have incompatible kinds")]
    IncompatibleOperands,
}

/// A position within a function which reads a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UseSite {
    Phi { block: BlockId, index: usize },
    Instruction { block: BlockId, index: usize },
    Terminator { block: BlockId },
}

impl UseSite {
    pub fn block(self) -> BlockId {
        match self {
            UseSite::Phi { block, .. }
            | UseSite::Instruction { block, .. }
            | UseSite::Terminator { block } => block,
        }
    }
}

impl Function {
    pub fn new(symbol_name: InternedSymbol) -> Self {
        Self {
            symbol_name,
            values: IndexVec::new(),
            parameters: Vec::new(),
            blocks: BTreeMap::new(),
            entry: BlockId::ZERO,
            exit: None,
            next_block_id: BlockId::ZERO,
            cfg_current: false,
        }
    }

    pub fn create_value(&mut self, ty: Type) -> ValueId {
        let id = self.values.next_index();
        self.values.push(Value { id, ty })
    }

    pub fn create_parameter(&mut self, ty: Type) -> ValueId {
        let id = self.create_value(ty);
        self.parameters.push(id);
        id
    }

    /// Appends a new block which returns nothing. The first block created
    /// becomes the entry block. A block without edges leaves the CFG state
    /// untouched.
    pub fn create_block(&mut self) -> BlockId {
        let id = self.next_block_id;
        self.next_block_id.increment_by(1);

        if self.blocks.is_empty() {
            self.entry = id;
        }

        self.blocks.insert(
            id,
            Block {
                id,
                phis: Vec::new(),
                instructions: Vec::new(),
                terminator: Terminator::Return { value: None },
                predecessors: BTreeSet::new(),
                successors: BTreeSet::new(),
            },
        );

        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        self.blocks
            .get(&id)
            .unwrap_or_else(|| panic!("{id} does not exist in `{}`", self.symbol_name))
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        let symbol_name = self.symbol_name;
        self.blocks
            .get_mut(&id)
            .unwrap_or_else(|| panic!("{id} does not exist in `{symbol_name}`"))
    }

    pub fn value_type(&self, operand: Operand) -> Type {
        match operand {
            Operand::Value(value) => self.values[value].ty,
            Operand::Immediate(Immediate::Int(_)) => Type::Int,
            Operand::Immediate(Immediate::Bool(_)) => Type::Bool,
            Operand::Immediate(Immediate::Null) => Type::Pointer,
        }
    }

    /// Replaces a block's terminator. The CFG must be rebuilt before
    /// dominance information is trusted again.
    pub fn set_terminator(&mut self, block: BlockId, terminator: Terminator) {
        self.block_mut(block).terminator = terminator;
        self.cfg_current = false;
    }

    /// Detaches a block from the function. Edges pointing at it are left for
    /// the caller to repair.
    pub fn remove_block(&mut self, id: BlockId) -> Option<Block> {
        let block = self.blocks.remove(&id)?;

        if self.exit == Some(id) {
            self.exit = None;
        }
        self.cfg_current = false;

        Some(block)
    }

    pub fn cfg_is_current(&self) -> bool {
        self.cfg_current
    }

    pub(crate) fn mark_cfg_current(&mut self) {
        self.cfg_current = true;
    }

    pub fn require_current_cfg(&self) -> Result<(), InternalError> {
        if self.cfg_current {
            Ok(())
        } else {
            Err(InternalError::StaleCfg {
                function: self.symbol_name,
            })
        }
    }

    pub fn phi_count(&self) -> usize {
        self.blocks.values().map(|block| block.phis.len()).sum()
    }

    /// Collects, for every value, the sites which read it
    pub fn users(&self) -> HashMap<ValueId, Vec<UseSite>> {
        let mut users: HashMap<ValueId, Vec<UseSite>> = HashMap::new();

        for block in self.blocks.values() {
            for (index, phi) in block.phis.iter().enumerate() {
                for operand in phi.sources.values() {
                    if let Operand::Value(value) = operand {
                        users.entry(*value).or_default().push(UseSite::Phi {
                            block: block.id,
                            index,
                        });
                    }
                }
            }

            for (index, instruction) in block.instructions.iter().enumerate() {
                for operand in instruction.operands() {
                    if let Operand::Value(value) = operand {
                        users
                            .entry(*value)
                            .or_default()
                            .push(UseSite::Instruction {
                                block: block.id,
                                index,
                            });
                    }
                }
            }

            for operand in block.terminator.operands() {
                if let Operand::Value(value) = operand {
                    users
                        .entry(*value)
                        .or_default()
                        .push(UseSite::Terminator { block: block.id });
                }
            }
        }

        users
    }

    /// Rewrites every operand according to `substitutions`. Chains (`a -> b`,
    /// `b -> c`) are followed to their end.
    pub fn replace_uses(&mut self, substitutions: &HashMap<ValueId, Operand>) {
        if substitutions.is_empty() {
            return;
        }

        for block in self.blocks.values_mut() {
            for phi in &mut block.phis {
                for operand in phi.sources.values_mut() {
                    *operand = resolve_substitution(substitutions, *operand);
                }
            }

            for instruction in &mut block.instructions {
                for operand in instruction.operands_mut() {
                    *operand = resolve_substitution(substitutions, *operand);
                }
            }

            for operand in block.terminator.operands_mut() {
                *operand = resolve_substitution(substitutions, *operand);
            }
        }
    }
}

pub fn resolve_substitution(
    substitutions: &HashMap<ValueId, Operand>,
    mut operand: Operand,
) -> Operand {
    while let Operand::Value(value) = operand {
        match substitutions.get(&value) {
            Some(replacement) if *replacement != operand => operand = *replacement,
            _ => break,
        }
    }

    operand
}

impl Block {
    pub fn returns(&self) -> bool {
        matches!(self.terminator, Terminator::Return { .. })
    }

    /// Drops the incoming operand for `predecessor` from every phi
    pub fn remove_phi_source(&mut self, predecessor: BlockId) {
        for phi in &mut self.phis {
            phi.sources.remove(&predecessor);
        }
    }

    /// Re-keys the incoming operand for `from` to `to` in every phi
    pub fn redirect_phi_source(&mut self, from: BlockId, to: BlockId) {
        for phi in &mut self.phis {
            if let Some(operand) = phi.sources.remove(&from) {
                phi.sources.insert(to, operand);
            }
        }
    }
}

impl Instruction {
    pub fn destination(&self) -> Option<ValueId> {
        match self {
            Instruction::Alloca { destination, .. }
            | Instruction::Load { destination, .. }
            | Instruction::Binary { destination, .. }
            | Instruction::Compare { destination, .. }
            | Instruction::Cast { destination, .. }
            | Instruction::Move { destination, .. }
            | Instruction::Offset { destination, .. } => Some(*destination),
            Instruction::Call { destination, .. } => *destination,
            Instruction::Store { .. } => None,
        }
    }

    pub fn operands(&self) -> impl Iterator<Item = &Operand> {
        let (fixed, rest): ([Option<&Operand>; 2], &[Operand]) = match self {
            Instruction::Alloca { .. } => ([None, None], &[]),
            Instruction::Load { source, .. } | Instruction::Move { source, .. } => {
                ([Some(source), None], &[])
            }
            Instruction::Cast { operand, .. } => ([Some(operand), None], &[]),
            Instruction::Store {
                destination,
                source,
            } => ([Some(destination), Some(source)], &[]),
            Instruction::Binary { lhs, rhs, .. } | Instruction::Compare { lhs, rhs, .. } => {
                ([Some(lhs), Some(rhs)], &[])
            }
            Instruction::Offset { base, offset, .. } => ([Some(base), Some(offset)], &[]),
            Instruction::Call { arguments, .. } => ([None, None], arguments.as_slice()),
        };

        fixed.into_iter().flatten().chain(rest)
    }

    pub fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
        let (fixed, rest): ([Option<&mut Operand>; 2], &mut [Operand]) = match self {
            Instruction::Alloca { .. } => ([None, None], &mut []),
            Instruction::Load { source, .. } | Instruction::Move { source, .. } => {
                ([Some(source), None], &mut [])
            }
            Instruction::Cast { operand, .. } => ([Some(operand), None], &mut []),
            Instruction::Store {
                destination,
                source,
            } => ([Some(destination), Some(source)], &mut []),
            Instruction::Binary { lhs, rhs, .. } | Instruction::Compare { lhs, rhs, .. } => {
                ([Some(lhs), Some(rhs)], &mut [])
            }
            Instruction::Offset { base, offset, .. } => ([Some(base), Some(offset)], &mut []),
            Instruction::Call { arguments, .. } => ([None, None], arguments.as_mut_slice()),
        };

        fixed.into_iter().flatten().chain(rest.iter_mut())
    }
}

impl Terminator {
    pub fn targets(&self) -> impl Iterator<Item = BlockId> + use<> {
        let targets = match *self {
            Terminator::Jump { destination } => [Some(destination), None],
            Terminator::Branch {
                positive, negative, ..
            } => [Some(positive), Some(negative)],
            Terminator::Return { .. } => [None, None],
        };

        targets.into_iter().flatten()
    }

    pub fn operands(&self) -> impl Iterator<Item = &Operand> {
        match self {
            Terminator::Branch { condition, .. } => Some(condition),
            Terminator::Return { value } => value.as_ref(),
            Terminator::Jump { .. } => None,
        }
        .into_iter()
    }

    pub fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
        match self {
            Terminator::Branch { condition, .. } => Some(condition),
            Terminator::Return { value } => value.as_mut(),
            Terminator::Jump { .. } => None,
        }
        .into_iter()
    }

    /// Points every edge to `from` at `to` instead
    pub fn retarget(&mut self, from: BlockId, to: BlockId) {
        match self {
            Terminator::Jump { destination } => {
                if *destination == from {
                    *destination = to;
                }
            }
            Terminator::Branch {
                positive, negative, ..
            } => {
                if *positive == from {
                    *positive = to;
                }
                if *negative == from {
                    *negative = to;
                }
            }
            Terminator::Return { .. } => {}
        }
    }
}

impl Immediate {
    /// Converts a constant to another type, `None` when the conversion is
    /// only known at run time
    pub fn cast(self, ty: Type) -> Option<Immediate> {
        match (self, ty) {
            (Immediate::Int(value), Type::Int) => Some(Immediate::Int(value)),
            (Immediate::Int(value), Type::Bool) => Some(Immediate::Bool(value != 0)),
            (Immediate::Bool(value), Type::Int) => Some(Immediate::Int(value as i64)),
            (Immediate::Bool(value), Type::Bool) => Some(Immediate::Bool(value)),
            (Immediate::Null, Type::Int) => Some(Immediate::Int(0)),
            (Immediate::Null, Type::Bool) => Some(Immediate::Bool(false)),
            (Immediate::Null, Type::Pointer) => Some(Immediate::Null),
            (Immediate::Int(_) | Immediate::Bool(_), Type::Pointer) => None,
        }
    }

    /// Interprets the constant as a branch condition
    pub fn as_condition(self) -> Option<bool> {
        match self {
            Immediate::Bool(value) => Some(value),
            Immediate::Int(value) => Some(value != 0),
            Immediate::Null => None,
        }
    }
}

impl BinaryOperator {
    /// Folds two constants with 64-bit wrapping semantics. Shift amounts are
    /// taken modulo 64 and `shr` is arithmetic.
    pub fn evaluate(self, lhs: Immediate, rhs: Immediate) -> Result<Immediate, EvaluationError> {
        match (lhs, rhs) {
            (Immediate::Int(lhs), Immediate::Int(rhs)) => {
                let value = match self {
                    BinaryOperator::Add => lhs.wrapping_add(rhs),
                    BinaryOperator::Sub => lhs.wrapping_sub(rhs),
                    BinaryOperator::Mul => lhs.wrapping_mul(rhs),
                    BinaryOperator::Div => {
                        if rhs == 0 {
                            return Err(EvaluationError::DivisionByZero);
                        }
                        lhs.wrapping_div(rhs)
                    }
                    BinaryOperator::Mod => {
                        if rhs == 0 {
                            return Err(EvaluationError::DivisionByZero);
                        }
                        lhs.wrapping_rem(rhs)
                    }
                    BinaryOperator::And => lhs & rhs,
                    BinaryOperator::Or => lhs | rhs,
                    BinaryOperator::Xor => lhs ^ rhs,
                    BinaryOperator::Shl => lhs.wrapping_shl(rhs as u32),
                    BinaryOperator::Shr => lhs.wrapping_shr(rhs as u32),
                };

                Ok(Immediate::Int(value))
            }
            (Immediate::Bool(lhs), Immediate::Bool(rhs)) => match self {
                BinaryOperator::And => Ok(Immediate::Bool(lhs & rhs)),
                BinaryOperator::Or => Ok(Immediate::Bool(lhs | rhs)),
                BinaryOperator::Xor => Ok(Immediate::Bool(lhs ^ rhs)),
                _ => Err(EvaluationError::IncompatibleOperands),
            },
            _ => Err(EvaluationError::IncompatibleOperands),
        }
    }

    /// `x * 0` and `x & 0` are zero whatever `x` is
    pub fn is_annihilated_by_zero(self) -> bool {
        matches!(self, BinaryOperator::Mul | BinaryOperator::And)
    }
}

impl CompareOperator {
    pub fn evaluate(self, lhs: Immediate, rhs: Immediate) -> Result<bool, EvaluationError> {
        match (lhs, rhs) {
            (Immediate::Int(lhs), Immediate::Int(rhs)) => Ok(self.compare(lhs, rhs)),
            (Immediate::Bool(lhs), Immediate::Bool(rhs)) => Ok(self.compare(lhs, rhs)),
            (Immediate::Null, Immediate::Null) => match self {
                CompareOperator::Eq => Ok(true),
                CompareOperator::Ne => Ok(false),
                _ => Err(EvaluationError::IncompatibleOperands),
            },
            _ => Err(EvaluationError::IncompatibleOperands),
        }
    }

    fn compare<T: Ord>(self, lhs: T, rhs: T) -> bool {
        match self {
            CompareOperator::Eq => lhs == rhs,
            CompareOperator::Ne => lhs != rhs,
            CompareOperator::Lt => lhs < rhs,
            CompareOperator::Le => lhs <= rhs,
            CompareOperator::Gt => lhs > rhs,
            CompareOperator::Ge => lhs >= rhs,
        }
    }

    /// The result of comparing a value against itself, for the operators
    /// where that is known without knowing the value
    pub fn reflexive_result(self) -> Option<bool> {
        match self {
            CompareOperator::Eq | CompareOperator::Le | CompareOperator::Ge => Some(true),
            CompareOperator::Ne => Some(false),
            CompareOperator::Lt | CompareOperator::Gt => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_uses_follows_chains() {
        let mut function = Function::new(InternedSymbol::new("chain"));
        let a = function.create_parameter(Type::Int);
        let b = function.create_value(Type::Int);
        let c = function.create_value(Type::Int);
        let entry = function.create_block();

        function.block_mut(entry).instructions.push(Instruction::Binary {
            operator: BinaryOperator::Add,
            destination: c,
            lhs: Operand::Value(b),
            rhs: Operand::Value(a),
        });
        function.set_terminator(
            entry,
            Terminator::Return {
                value: Some(Operand::Value(c)),
            },
        );

        let substitutions = HashMap::from([
            (b, Operand::Value(a)),
            (a, Operand::Immediate(Immediate::Int(7))),
        ]);
        function.replace_uses(&substitutions);

        assert_eq!(
            function.block(entry).instructions[0],
            Instruction::Binary {
                operator: BinaryOperator::Add,
                destination: c,
                lhs: Operand::Immediate(Immediate::Int(7)),
                rhs: Operand::Immediate(Immediate::Int(7)),
            }
        );
    }

    #[test]
    fn users_cover_every_position() {
        let mut function = Function::new(InternedSymbol::new("users"));
        let parameter = function.create_parameter(Type::Bool);
        let entry = function.create_block();
        let next = function.create_block();
        let merged = function.create_value(Type::Bool);

        function.set_terminator(
            entry,
            Terminator::Branch {
                condition: Operand::Value(parameter),
                positive: next,
                negative: next,
            },
        );
        function.block_mut(next).phis.push(Phi {
            destination: merged,
            sources: BTreeMap::from([(entry, Operand::Value(parameter))]),
        });

        let users = function.users();
        assert_eq!(
            users[&parameter],
            vec![
                UseSite::Terminator { block: entry },
                UseSite::Phi {
                    block: next,
                    index: 0
                },
            ]
        );
        assert!(!users.contains_key(&merged));
    }

    #[test]
    fn integer_folding_wraps() {
        assert_eq!(
            BinaryOperator::Add.evaluate(Immediate::Int(i64::MAX), Immediate::Int(1)),
            Ok(Immediate::Int(i64::MIN))
        );
        assert_eq!(
            BinaryOperator::Div.evaluate(Immediate::Int(i64::MIN), Immediate::Int(-1)),
            Ok(Immediate::Int(i64::MIN))
        );
        assert_eq!(
            BinaryOperator::Shl.evaluate(Immediate::Int(1), Immediate::Int(65)),
            Ok(Immediate::Int(2))
        );
        assert_eq!(
            BinaryOperator::Mod.evaluate(Immediate::Int(3), Immediate::Int(0)),
            Err(EvaluationError::DivisionByZero)
        );
        assert_eq!(
            BinaryOperator::Add.evaluate(Immediate::Bool(true), Immediate::Bool(true)),
            Err(EvaluationError::IncompatibleOperands)
        );
    }
}
