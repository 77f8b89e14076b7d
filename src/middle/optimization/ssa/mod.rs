//! Entering and leaving SSA form. Construction promotes stack slots whose
//! address never escapes into phis and plain values; destruction lowers the
//! phis back into moves on the incoming edges.

pub mod construct;
pub mod destruct;

pub use construct::construct_ssa;
pub use destruct::destruct_ssa;
