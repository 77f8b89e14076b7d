use std::path::PathBuf;

use crate::{
    intern::InternedSymbol,
    middle::lir::{BlockId, ValueId, parser::ParseError},
};

/// A broken invariant inside the compiler itself. These are never caused by
/// user code and abort the pass that detects them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InternalError {
    #[error("control flow graph of `{function}` is stale and must be rebuilt first")]
    StaleCfg { function: InternedSymbol },

    #[error("{block} of `{function}` is referenced but does not exist")]
    UnknownBlock {
        function: InternedSymbol,
        block: BlockId,
    },

    #[error(
        "phi {phi} in {block} of `{function}` has sources {sources:?} but the block's predecessors are {predecessors:?}"
    )]
    MalformedPhi {
        function: InternedSymbol,
        block: BlockId,
        phi: ValueId,
        sources: Vec<BlockId>,
        predecessors: Vec<BlockId>,
    },

    #[error("phi {phi} in {block} of `{function}` survived SSA destruction")]
    PhiAfterDestruction {
        function: InternedSymbol,
        block: BlockId,
        phi: ValueId,
    },

    #[error("successors of {block} in `{function}` do not match its terminator")]
    InconsistentEdges {
        function: InternedSymbol,
        block: BlockId,
    },
}

/// Everything that can stop the driver
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("internal compiler error: {0}")]
    Internal(#[from] InternalError),
}
