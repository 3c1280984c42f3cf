//! The flat IR this backend compiles and interprets.
//!
//! Re-exports [`crate::runtime::ValueKind`] as the IR's own `value_kind`
//! vocabulary: the IR, the typed-register window, and the boxed `Value`
//! type all need to agree on the same set of kinds, so one enum serves all
//! three rather than three near-identical copies.

pub mod instr;

pub use crate::runtime::ValueKind;
pub use instr::{ArithOp, CompareOp, IrInstruction, IrOp, IrProgram, LoopCompare, OptFlags};
