//! Non-fatal findings reported by the passes. A diagnostic never stops
//! compilation of the function it was found in; the pass substitutes a
//! conservative placeholder and keeps going.

use colored::Colorize;

use crate::{
    intern::InternedSymbol,
    middle::lir::{BinaryOperator, BlockId, ValueId},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A stack slot was loaded on a path where nothing was stored to it yet
    UseBeforeInitialization {
        function: InternedSymbol,
        block: BlockId,
        location: ValueId,
    },
    /// Both operands of a division or modulo folded and the divisor is zero
    DivisionByZero {
        function: InternedSymbol,
        block: BlockId,
        operator: BinaryOperator,
        value: ValueId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reported {
    pub diagnostic: Diagnostic,
    /// Pass location which raised the diagnostic (`error-backtrace` builds)
    pub origin: Option<String>,
}

/// Collects diagnostics from every pass run over a module
#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: Vec<Reported>,
}

/// Reports a diagnostic, recording where in the compiler it was raised when
/// the `error-backtrace` feature is enabled
macro_rules! report_diagnostic {
    ($sink:expr, $diagnostic:expr $(,)?) => {{
        #[cfg(feature = "error-backtrace")]
        let origin = Some(format!("{}:{}", module_path!(), line!()));
        #[cfg(not(feature = "error-backtrace"))]
        let origin = None;

        $sink.report_at($diagnostic, origin)
    }};
}

pub(crate) use report_diagnostic;

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report_at(&mut self, diagnostic: Diagnostic, origin: Option<String>) {
        tracing::warn!(%diagnostic, "diagnostic reported");
        self.entries.push(Reported { diagnostic, origin });
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().map(|reported| &reported.diagnostic)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Prints every diagnostic to stderr in the compiler's warning style
    pub fn emit(&self) {
        for reported in &self.entries {
            eprintln!("{}", render(reported));
        }
    }
}

fn render(reported: &Reported) -> String {
    let message = format!("{}: {}", "warning".yellow(), reported.diagnostic);

    match &reported.origin {
        Some(origin) => format!("{}: {}\n{}", "backtrace".blue(), origin.white(), message),
        None => message,
    }
}

impl core::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostic::UseBeforeInitialization {
                function,
                block,
                location,
            } => write!(
                f,
                "stack slot {location} is read before it is initialized (in `{function}` at {block})"
            ),
            Diagnostic::DivisionByZero {
                function,
                block,
                operator,
                value,
            } => write!(
                f,
                "`{operator}` defining {value} always divides by zero (in `{function}` at {block})"
            ),
        }
    }
}
