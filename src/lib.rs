//! SSA middle tier of the Drip compiler. Functions arrive as LIR with locals
//! in stack slots and leave phi-free, with constants folded and dead code
//! removed, ready for instruction selection.

pub mod diagnostics;
pub mod error;
pub mod index;
pub mod intern;
pub mod middle;

pub use error::{Error, InternalError};
