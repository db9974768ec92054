//! The Jasmine intermediate representation: types, operands, instructions,
//! and the two concrete encodings (text and binary) of an instruction
//! stream.

pub mod binary;
pub mod insn;
pub mod lex;
pub mod opcode;
pub mod param;
pub mod text;
pub mod types;

pub use insn::Insn;
pub use opcode::Opcode;
pub use param::{Mem, MemKind, Param, Register};
pub use text::ParsedProgram;
pub use types::{Member, Type, TypeContext, TypeInfo};
