//! Reference interpreter for LIR. Runs a function on concrete arguments so the
//! passes can be checked by comparing what a program does before and after
//! them. Calls leave the function: they are recorded and produce zero.

use crate::{
    index::IndexVec,
    intern::InternedSymbol,
    middle::lir::{
        BlockId, EvaluationError, Function, Immediate, Instruction, Operand, Terminator, Type,
        ValueId,
    },
};

pub const DEFAULT_STEP_LIMIT: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeValue {
    Int(i64),
    Bool(bool),
    /// Index of a memory cell
    Pointer(usize),
    Null,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEvent {
    pub target: InternedSymbol,
    pub arguments: Vec<RuntimeValue>,
}

/// Everything observable about one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Execution {
    pub return_value: Option<RuntimeValue>,
    pub calls: Vec<CallEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterpretError {
    #[error("`{function}` takes {expected} arguments but {given} were given")]
    ArgumentCount {
        function: InternedSymbol,
        expected: usize,
        given: usize,
    },

    #[error("{value} is read before it is defined")]
    UndefinedValue { value: ValueId },

    #[error("{block} does not exist")]
    UnknownBlock { block: BlockId },

    #[error("phi {phi} in {block} has no source for {predecessor}")]
    MissingPhiSource {
        phi: ValueId,
        block: BlockId,
        predecessor: BlockId,
    },

    #[error("{value} cannot be evaluated: {source}")]
    Evaluation {
        value: ValueId,
        #[source]
        source: EvaluationError,
    },

    #[error("branch condition in {block} is not a boolean or integer")]
    InvalidCondition { block: BlockId },

    #[error("memory access through an invalid pointer in {block}")]
    InvalidAddress { block: BlockId },

    #[error("execution did not finish within {limit} steps")]
    StepLimit { limit: usize },
}

pub fn interpret(
    function: &Function,
    arguments: &[RuntimeValue],
) -> Result<Execution, InterpretError> {
    interpret_with_limit(function, arguments, DEFAULT_STEP_LIMIT)
}

pub fn interpret_with_limit(
    function: &Function,
    arguments: &[RuntimeValue],
    limit: usize,
) -> Result<Execution, InterpretError> {
    if arguments.len() != function.parameters.len() {
        return Err(InterpretError::ArgumentCount {
            function: function.symbol_name,
            expected: function.parameters.len(),
            given: arguments.len(),
        });
    }

    let mut state = State {
        values: IndexVec::from_raw(vec![None; function.values.len()]),
        memory: Vec::new(),
        execution: Execution::default(),
    };

    for (parameter, argument) in function.parameters.iter().zip(arguments) {
        state.values[*parameter] = Some(*argument);
    }

    let mut steps = 0;
    let mut previous: Option<BlockId> = None;
    let mut current = function.entry;

    loop {
        let block = function
            .blocks
            .get(&current)
            .ok_or(InterpretError::UnknownBlock { block: current })?;

        // every phi reads its source before any phi of the block is written
        if let Some(previous) = previous {
            let incoming = block
                .phis
                .iter()
                .map(|phi| {
                    let source = phi.sources.get(&previous).ok_or(
                        InterpretError::MissingPhiSource {
                            phi: phi.destination,
                            block: current,
                            predecessor: previous,
                        },
                    )?;
                    Ok((phi.destination, state.read(*source)?))
                })
                .collect::<Result<Vec<_>, InterpretError>>()?;

            for (destination, value) in incoming {
                state.values[destination] = Some(value);
            }
        }

        for instruction in &block.instructions {
            steps += 1;
            if steps > limit {
                return Err(InterpretError::StepLimit { limit });
            }

            state.execute(function, current, instruction)?;
        }

        steps += 1;
        if steps > limit {
            return Err(InterpretError::StepLimit { limit });
        }

        let next = match &block.terminator {
            Terminator::Jump { destination } => *destination,
            Terminator::Branch {
                condition,
                positive,
                negative,
            } => {
                let taken = match state.read(*condition)? {
                    RuntimeValue::Bool(value) => value,
                    RuntimeValue::Int(value) => value != 0,
                    RuntimeValue::Pointer(_) | RuntimeValue::Null => {
                        return Err(InterpretError::InvalidCondition { block: current });
                    }
                };

                if taken { *positive } else { *negative }
            }
            Terminator::Return { value } => {
                state.execution.return_value = value.map(|value| state.read(value)).transpose()?;
                return Ok(state.execution);
            }
        };

        previous = Some(current);
        current = next;
    }
}

struct State {
    values: IndexVec<ValueId, Option<RuntimeValue>>,
    /// One cell per executed alloca. `None` until first stored to.
    memory: Vec<Option<RuntimeValue>>,
    execution: Execution,
}

impl State {
    fn read(&self, operand: Operand) -> Result<RuntimeValue, InterpretError> {
        match operand {
            Operand::Immediate(Immediate::Int(value)) => Ok(RuntimeValue::Int(value)),
            Operand::Immediate(Immediate::Bool(value)) => Ok(RuntimeValue::Bool(value)),
            Operand::Immediate(Immediate::Null) => Ok(RuntimeValue::Null),
            Operand::Value(value) => {
                self.values[value].ok_or(InterpretError::UndefinedValue { value })
            }
        }
    }

    fn address(&self, block: BlockId, operand: Operand) -> Result<usize, InterpretError> {
        match self.read(operand)? {
            RuntimeValue::Pointer(address) if address < self.memory.len() => Ok(address),
            _ => Err(InterpretError::InvalidAddress { block }),
        }
    }

    fn execute(
        &mut self,
        function: &Function,
        block: BlockId,
        instruction: &Instruction,
    ) -> Result<(), InterpretError> {
        let result = match instruction {
            Instruction::Alloca { .. } => {
                self.memory.push(None);
                RuntimeValue::Pointer(self.memory.len() - 1)
            }
            Instruction::Load { source, .. } => {
                let address = self.address(block, *source)?;
                self.memory[address].unwrap_or(RuntimeValue::Null)
            }
            Instruction::Store {
                destination,
                source,
            } => {
                let address = self.address(block, *destination)?;
                self.memory[address] = Some(self.read(*source)?);
                return Ok(());
            }
            Instruction::Binary {
                operator,
                destination,
                lhs,
                rhs,
            } => {
                let lhs = as_immediate(self.read(*lhs)?);
                let rhs = as_immediate(self.read(*rhs)?);

                let folded = match (lhs, rhs) {
                    (Some(lhs), Some(rhs)) => operator.evaluate(lhs, rhs),
                    _ => Err(EvaluationError::IncompatibleOperands),
                };

                folded
                    .map(from_immediate)
                    .map_err(|source| InterpretError::Evaluation {
                        value: *destination,
                        source,
                    })?
            }
            Instruction::Compare {
                operator,
                destination,
                lhs,
                rhs,
            } => {
                // pointers compare by address
                let comparable = |value: RuntimeValue| match value {
                    RuntimeValue::Pointer(address) => Some(Immediate::Int(address as i64)),
                    value => as_immediate(value),
                };

                let folded = match (comparable(self.read(*lhs)?), comparable(self.read(*rhs)?)) {
                    (Some(lhs), Some(rhs)) => operator.evaluate(lhs, rhs),
                    _ => Err(EvaluationError::IncompatibleOperands),
                };

                folded
                    .map(RuntimeValue::Bool)
                    .map_err(|source| InterpretError::Evaluation {
                        value: *destination,
                        source,
                    })?
            }
            Instruction::Call {
                destination,
                target,
                arguments,
            } => {
                let arguments = arguments
                    .iter()
                    .map(|argument| self.read(*argument))
                    .collect::<Result<Vec<_>, _>>()?;

                self.execution.calls.push(CallEvent {
                    target: *target,
                    arguments,
                });

                let Some(destination) = destination else {
                    return Ok(());
                };

                match function.values[*destination].ty {
                    Type::Int => RuntimeValue::Int(0),
                    Type::Bool => RuntimeValue::Bool(false),
                    Type::Pointer => RuntimeValue::Null,
                }
            }
            Instruction::Cast {
                destination,
                operand,
                ty,
            } => match (self.read(*operand)?, ty) {
                (RuntimeValue::Pointer(address), Type::Pointer) => RuntimeValue::Pointer(address),
                (RuntimeValue::Pointer(address), Type::Int) => RuntimeValue::Int(address as i64),
                (RuntimeValue::Pointer(_), Type::Bool) => RuntimeValue::Bool(true),
                (RuntimeValue::Int(address), Type::Pointer) if address >= 0 => {
                    RuntimeValue::Pointer(address as usize)
                }
                (value, ty) => as_immediate(value)
                    .and_then(|value| value.cast(*ty))
                    .map(from_immediate)
                    .ok_or(InterpretError::Evaluation {
                        value: *destination,
                        source: EvaluationError::IncompatibleOperands,
                    })?,
            },
            Instruction::Move { source, .. } => self.read(*source)?,
            Instruction::Offset { base, offset, .. } => {
                let address = self.address(block, *base)?;

                let RuntimeValue::Int(offset) = self.read(*offset)? else {
                    return Err(InterpretError::InvalidAddress { block });
                };

                address
                    .checked_add_signed(offset as isize)
                    .map(RuntimeValue::Pointer)
                    .ok_or(InterpretError::InvalidAddress { block })?
            }
        };

        if let Some(destination) = instruction.destination() {
            self.values[destination] = Some(result);
        }

        Ok(())
    }
}

fn as_immediate(value: RuntimeValue) -> Option<Immediate> {
    match value {
        RuntimeValue::Int(value) => Some(Immediate::Int(value)),
        RuntimeValue::Bool(value) => Some(Immediate::Bool(value)),
        RuntimeValue::Null => Some(Immediate::Null),
        RuntimeValue::Pointer(_) => None,
    }
}

fn from_immediate(value: Immediate) -> RuntimeValue {
    match value {
        Immediate::Int(value) => RuntimeValue::Int(value),
        Immediate::Bool(value) => RuntimeValue::Bool(value),
        Immediate::Null => RuntimeValue::Null,
    }
}
