//! The stack-bytecode representation the eliminator operates on.
//!
//! This module owns the instruction catalog ([`Opcode`]), the literal value
//! model ([`Value`], [`ArrayLit`]), and the function/block/local storage the
//! rewrites mutate. Static types, exception flags, and everything else the
//! abstract interpreter knows live separately in [`crate::facts`]; this
//! module is purely structural.

mod function;
mod opcode;
mod value;

pub use function::{Block, BlockId, Function, Instr, Local, LocalId, NO_BLOCK, NO_LOCAL};
pub use opcode::{BinOp, CastKind, IncDecOp, MemberKey, Opcode, TypeCheck, UnOp};
pub use value::{ArrayKey, ArrayLit, Value};
