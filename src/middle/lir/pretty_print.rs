use colored::Colorize;
use itertools::Itertools;

use crate::{index::Index, middle::lir};

impl core::fmt::Display for lir::Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.functions.iter().join("\n\n"))
    }
}

impl core::fmt::Display for lir::Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}{}",
            "fn".magenta(),
            self.symbol_name.value().blue(),
            "(".white()
        )?;

        write!(
            f,
            "{}",
            self.parameters
                .iter()
                .map(|parameter| format!(
                    "{}: {}",
                    register(*parameter),
                    self.values[*parameter].ty
                ))
                .join(", ")
        )?;

        writeln!(f, "{}", ") {".white())?;

        for block in self.blocks.values() {
            writeln!(f, "{}", format!("{}:", block.id).bright_red())?;

            for phi in &block.phis {
                writeln!(
                    f,
                    "    {} {}{}{}{}",
                    self.definition(phi.destination),
                    "phi".bright_green(),
                    " [".white(),
                    phi.sources
                        .iter()
                        .map(|(block, operand)| format!(
                            "{}: {operand}",
                            block.to_string().blue()
                        ))
                        .join(", "),
                    "]".white()
                )?;
            }

            for instruction in &block.instructions {
                writeln!(f, "    {}", self.instruction(instruction))?;
            }

            writeln!(f, "    {}", block.terminator)?;
        }

        write!(f, "{}", "}".white())
    }
}

impl lir::Function {
    /// `%n: ty =`
    fn definition(&self, value: lir::ValueId) -> String {
        format!("{}: {} {}", register(value), self.values[value].ty, "=".white())
    }

    fn instruction(&self, instruction: &lir::Instruction) -> String {
        match instruction {
            lir::Instruction::Alloca { destination, ty } => {
                format!("{} {} {ty}", self.definition(*destination), "alloca".cyan())
            }
            lir::Instruction::Load {
                destination,
                source,
            } => format!("{} {} {source}", self.definition(*destination), "load".cyan()),
            lir::Instruction::Store {
                destination,
                source,
            } => format!("{} {destination} {} {source}", "store".cyan(), "<-".white()),
            lir::Instruction::Binary {
                operator,
                destination,
                lhs,
                rhs,
            } => format!(
                "{} {} {lhs}, {rhs}",
                self.definition(*destination),
                operator.to_string().cyan()
            ),
            lir::Instruction::Compare {
                operator,
                destination,
                lhs,
                rhs,
            } => format!(
                "{} {} {lhs}, {rhs}",
                self.definition(*destination),
                operator.to_string().cyan()
            ),
            lir::Instruction::Call {
                destination,
                target,
                arguments,
            } => {
                let call = format!(
                    "{} {target}{}{}{}",
                    "call".cyan(),
                    "(".white(),
                    arguments.iter().join(", "),
                    ")".white()
                );

                match destination {
                    Some(destination) => format!("{} {call}", self.definition(*destination)),
                    None => call,
                }
            }
            lir::Instruction::Cast {
                destination,
                operand,
                ty,
            } => format!(
                "{} {} {operand} {} {ty}",
                self.definition(*destination),
                "cast".cyan(),
                "as".cyan()
            ),
            lir::Instruction::Move {
                destination,
                source,
            } => format!("{} {source}", self.definition(*destination)),
            lir::Instruction::Offset {
                destination,
                base,
                offset,
            } => format!(
                "{} {} {base}, {offset}",
                self.definition(*destination),
                "offset".cyan()
            ),
        }
    }
}

fn register(value: lir::ValueId) -> colored::ColoredString {
    value.to_string().yellow()
}

impl core::fmt::Display for lir::Terminator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            lir::Terminator::Jump { destination } => {
                write!(f, "{} {}", "jmp".cyan(), destination.to_string().blue())
            }
            lir::Terminator::Branch {
                condition,
                positive,
                negative,
            } => write!(
                f,
                "{} {condition} {} {}",
                "br".cyan(),
                positive.to_string().blue(),
                negative.to_string().blue()
            ),
            lir::Terminator::Return { value: Some(value) } => {
                write!(f, "{} {value}", "ret".cyan())
            }
            lir::Terminator::Return { value: None } => write!(f, "{}", "ret".cyan()),
        }
    }
}

impl core::fmt::Display for lir::ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.index())
    }
}

impl core::fmt::Display for lir::BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, ".label_{}", self.index())
    }
}

impl core::fmt::Display for lir::Immediate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            lir::Immediate::Int(value) => write!(f, "{value}"),
            lir::Immediate::Bool(value) => write!(f, "{value}"),
            lir::Immediate::Null => write!(f, "null"),
        }
    }
}

impl core::fmt::Display for lir::Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            lir::Operand::Immediate(immediate) => write!(f, "{}", immediate.to_string().purple()),
            lir::Operand::Value(value) => write!(f, "{}", register(*value)),
        }
    }
}
