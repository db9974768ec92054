//! The Jasmine opcode set.

use std::fmt;

/// Every opcode in the Jasmine virtual instruction set. Each has a fixed
/// arity and parameter-kind signature, enforced by the text parser, the
/// binary (dis)assembler, the instruction selector, and the liveness pass
/// (for which params are destructive/which are mere uses).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Opcode {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    // Bitwise
    And,
    Or,
    Xor,
    Not,
    // Conversions
    ICast,
    F32Cast,
    F64Cast,
    Sxt,
    Zxt,
    // Shifts
    Sl,
    Slr,
    Sar,
    Rol,
    Ror,
    // Memory
    Mov,
    Xchg,
    Local,
    Param,
    Push,
    Pop,
    // Control
    Frame,
    Ret,
    Call,
    Jeq,
    Jne,
    Jl,
    Jle,
    Jg,
    Jge,
    Jump,
    Nop,
    // Comparisons
    Ceq,
    Cne,
    Cl,
    Cle,
    Cg,
    Cge,
    // Top-level
    Type,
    Global,
    // Literals
    Lit,
    Stat,
}

impl Opcode {
    pub const ALL: &'static [Opcode] = &[
        Opcode::Add, Opcode::Sub, Opcode::Mul, Opcode::Div, Opcode::Rem,
        Opcode::And, Opcode::Or, Opcode::Xor, Opcode::Not,
        Opcode::ICast, Opcode::F32Cast, Opcode::F64Cast, Opcode::Sxt, Opcode::Zxt,
        Opcode::Sl, Opcode::Slr, Opcode::Sar, Opcode::Rol, Opcode::Ror,
        Opcode::Mov, Opcode::Xchg, Opcode::Local, Opcode::Param, Opcode::Push, Opcode::Pop,
        Opcode::Frame, Opcode::Ret, Opcode::Call,
        Opcode::Jeq, Opcode::Jne, Opcode::Jl, Opcode::Jle, Opcode::Jg, Opcode::Jge, Opcode::Jump, Opcode::Nop,
        Opcode::Ceq, Opcode::Cne, Opcode::Cl, Opcode::Cle, Opcode::Cg, Opcode::Cge,
        Opcode::Type, Opcode::Global,
        Opcode::Lit, Opcode::Stat,
    ];

    pub fn mnemonic(self) -> &'static str {
        use Opcode::*;
        match self {
            Add => "add", Sub => "sub", Mul => "mul", Div => "div", Rem => "rem",
            And => "and", Or => "or", Xor => "xor", Not => "not",
            ICast => "icast", F32Cast => "f32cast", F64Cast => "f64cast", Sxt => "sxt", Zxt => "zxt",
            Sl => "sl", Slr => "slr", Sar => "sar", Rol => "rol", Ror => "ror",
            Mov => "mov", Xchg => "xchg", Local => "local", Param => "param", Push => "push", Pop => "pop",
            Frame => "frame", Ret => "ret", Call => "call",
            Jeq => "jeq", Jne => "jne", Jl => "jl", Jle => "jle", Jg => "jg", Jge => "jge", Jump => "jump", Nop => "nop",
            Ceq => "ceq", Cne => "cne", Cl => "cl", Cle => "cle", Cg => "cg", Cge => "cge",
            Type => "type", Global => "global",
            Lit => "lit", Stat => "stat",
        }
    }

    pub fn from_mnemonic(s: &str) -> Option<Opcode> {
        Opcode::ALL.iter().copied().find(|op| op.mnemonic() == s)
    }

    /// Binary encoding: a 6-bit slot in the instruction header.
    pub fn binary_code(self) -> u8 {
        Opcode::ALL
            .iter()
            .position(|&op| op == self)
            .expect("Opcode::ALL is exhaustive") as u8
    }

    pub fn from_binary_code(code: u8) -> Option<Opcode> {
        Opcode::ALL.get(code as usize).copied()
    }

    /// Whether this opcode writes its first parameter (as opposed to only
    /// reading it). Drives `defs[i]` in the liveness pass. `push`, `not`,
    /// and `ret` are explicitly *not* destructive even though they take a
    /// register-shaped first operand — `not` is `dst := !dst, dst` is
    /// written but via the same identity alias, listed here as an
    /// instruction-selector concern rather than a liveness concern: per
    /// spec, `not`'s first param is a plain use like its operand.
    pub fn is_destructive(self) -> bool {
        use Opcode::*;
        !matches!(self, Push | Not | Ret | Frame | Jump | Jeq | Jne | Jl | Jle | Jg | Jge | Nop | Type | Global | Lit | Stat)
    }

    /// Whether this opcode ends a basic block (control transfer).
    pub fn is_terminator(self) -> bool {
        matches!(self, Opcode::Jump | Opcode::Jeq | Opcode::Jne | Opcode::Jl | Opcode::Jle | Opcode::Jg | Opcode::Jge | Opcode::Ret)
    }

    pub fn is_conditional_jump(self) -> bool {
        matches!(self, Opcode::Jeq | Opcode::Jne | Opcode::Jl | Opcode::Jle | Opcode::Jg | Opcode::Jge)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_codes_are_dense_and_reversible() {
        for (i, &op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(op.binary_code(), i as u8);
            assert_eq!(Opcode::from_binary_code(i as u8), Some(op));
        }
    }

    #[test]
    fn mnemonics_round_trip() {
        for &op in Opcode::ALL {
            assert_eq!(Opcode::from_mnemonic(op.mnemonic()), Some(op));
        }
    }

    #[test]
    fn push_is_not_destructive() {
        assert!(!Opcode::Push.is_destructive());
        assert!(Opcode::Mov.is_destructive());
    }
}
