//! Control flow facts the SSA passes are built on. Both analyses read the
//! function and never change its instructions.

pub mod cfg;
pub mod dominators;
