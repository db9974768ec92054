//! Typed errors for each fallible subsystem, composed into one top-level
//! error for uniform `[ERROR]`-prefixed CLI reporting. Input-validation and
//! I/O failures are reportable here; internal invariants panic instead and
//! so have no place in this enum.

use thiserror::Error;

/// Errors raised while lexing or parsing the text IR grammar.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unexpected character {ch:?} at byte {pos}")]
    UnexpectedChar { pos: usize, ch: char },
    #[error("unexpected token {found:?} at byte {pos}, expected {expected}")]
    UnexpectedToken { pos: usize, found: String, expected: &'static str },
    #[error("unknown opcode `{0}`")]
    UnknownOpcode(String),
    #[error("unknown type name `{0}`")]
    UnknownTypeName(String),
    #[error("duplicate type definition for `{0}`")]
    DuplicateType(String),
    #[error("unknown field `{field}` on type `{ty}`")]
    UnknownField { ty: String, field: String },
    #[error("integer literal out of range at byte {0}")]
    IntOutOfRange(usize),
}

/// Errors raised while assembling or disassembling the binary IR form
/// stored in an object's `code` section under `arch = jasmine`.
#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("unknown opcode byte 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("truncated instruction stream: expected {expected} more byte(s)")]
    Truncated { expected: usize },
    #[error("parameter of wrong kind for opcode `{opcode}`")]
    WrongParamKind { opcode: &'static str },
    #[error("malformed variable-length struct id")]
    MalformedStructId,
    #[error("reference to undeclared struct type id {0}")]
    UnknownStructId(u32),
}

/// Errors raised while reading, writing, or validating an [`crate::object::Object`].
#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a jasmine object: missing shebang")]
    BadShebang,
    #[error("not a jasmine object: bad magic bytes")]
    BadMagic,
    #[error("object requires compiler version {required_major}, this build is {actual_major}")]
    VersionMismatch { required_major: u16, actual_major: u16 },
    #[error("announced section length {announced} does not match available {actual} bytes")]
    LengthMismatch { announced: u64, actual: u64 },
    #[error("reference to undefined symbol `{0}`")]
    UndefinedSymbol(String),
    #[error(transparent)]
    Assemble(#[from] AssembleError),
    #[error(transparent)]
    Emit(#[from] EmitError),
}

/// Errors raised by the x86-64 emitter and instruction selector.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("ambiguous operand size: all operands are auto-sized")]
    AmbiguousSize,
    #[error("incompatible operand sizes: {a} vs {b}")]
    IncompatibleSizes { a: u32, b: u32 },
    #[error("displacement {0} does not fit in a 32-bit field")]
    DisplacementOutOfRange(i64),
    #[error("immediate {0} does not fit in a 32-bit field")]
    ImmediateOutOfRange(i64),
    #[error("unsupported opcode for native lowering: {0}")]
    Unsupported(&'static str),
    #[error("unknown field `{field}` on type `{ty}`")]
    UnknownField { ty: String, field: String },
}

/// Errors raised while loading an object into executable memory.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to allocate {size} bytes of virtual memory: {source}")]
    Alloc { size: usize, source: std::io::Error },
    #[error("failed to set page protection: {0}")]
    Protect(std::io::Error),
    #[error("reference to symbol `{0}` was never defined or bound natively")]
    UnresolvedSymbol(String),
    #[error("entry point `{0}` not found in object")]
    EntryNotFound(String),
}

/// The crate's top-level error, composing every subsystem error for the
/// CLI's one-shot fatal reporting.
#[derive(Debug, Error)]
pub enum JasmineError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Assemble(#[from] AssembleError),
    #[error(transparent)]
    Object(#[from] ObjectError),
    #[error(transparent)]
    Emit(#[from] EmitError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
