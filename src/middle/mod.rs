//! The middle tier works on LIR functions: the control flow graph is built,
//! locals are promoted into SSA form, constants are propagated, and SSA form
//! is torn down again into plain moves for instruction selection.

pub mod analysis;
pub mod lir;
pub mod optimization;
