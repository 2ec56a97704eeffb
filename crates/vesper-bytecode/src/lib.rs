//! Bytecode artifact shared by the Vesper compiler and virtual machine.
//!
//! The format is private to this compiler/VM pair; no cross-version or
//! cross-implementation compatibility is promised.

mod code;
mod opcode;

pub use code::{Code, CodeBuilder, Constant, HandlerRecord, Param, SourceLocation};
pub use opcode::{BinOp, CmpOp, Op, NO_TARGET};
