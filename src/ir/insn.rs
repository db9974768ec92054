//! A single Jasmine instruction.

use crate::common::Symbol;
use crate::ir::opcode::Opcode;
use crate::ir::param::{Param, Register};
use crate::ir::types::Type;
use std::fmt;

/// `{label?, opcode, type, params[]}`. `type` is the operand kind for
/// arithmetic opcodes and the result kind for comparisons; the per-opcode
/// contract (see [`crate::ir::text`] and [`crate::ir::binary`]) fixes how
/// many params of which kinds are expected.
#[derive(Clone, Debug, PartialEq)]
pub struct Insn {
    pub label: Option<Symbol>,
    pub opcode: Opcode,
    pub ty: Type,
    pub params: Vec<Param>,
}

impl Insn {
    pub fn new(opcode: Opcode, ty: Type, params: Vec<Param>) -> Insn {
        Insn { label: None, opcode, ty, params }
    }

    pub fn labeled(label: Symbol, opcode: Opcode, ty: Type, params: Vec<Param>) -> Insn {
        Insn { label: Some(label), opcode, ty, params }
    }

    /// The register defined by this instruction, if it is destructive.
    pub fn defined_register(&self) -> Option<Register> {
        if self.opcode.is_destructive() {
            self.params.first().and_then(Param::as_register)
        } else {
            None
        }
    }

    /// All registers read by this instruction: every register-valued
    /// param, plus the base registers of memory operands, minus the
    /// destination of a destructive op (which is a def, not a use) —
    /// except destructive ops with a memory destination, a read-modify
    /// form, whose base register is still a use.
    pub fn used_registers(&self) -> Vec<Register> {
        let mut used = Vec::new();
        for (i, param) in self.params.iter().enumerate() {
            if i == 0 && self.opcode.is_destructive() {
                if let Param::Mem(m) = param {
                    used.extend(m.base_register());
                }
                continue;
            }
            used.extend(param.registers_used());
        }
        used
    }

    pub fn label_target(&self) -> Option<Symbol> {
        self.params.iter().find_map(Param::as_label)
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(label) = self.label {
            write!(f, "{label}: ")?;
        }
        write!(f, "{} {}", self.opcode, self.ty)?;
        for (i, p) in self.params.iter().enumerate() {
            if i == 0 {
                write!(f, " ")?;
            } else {
                write!(f, ", ")?;
            }
            crate::ir::text::write_param(f, p)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::intern_global;

    #[test]
    fn destructive_first_param_is_defined() {
        let r0 = Register::local(0);
        let insn = Insn::new(Opcode::Mov, Type::I64, vec![Param::Reg(r0), Param::Imm(1)]);
        assert_eq!(insn.defined_register(), Some(r0));
        assert!(insn.used_registers().is_empty());
    }

    #[test]
    fn non_destructive_uses_all_registers() {
        let r0 = Register::local(0);
        let insn = Insn::new(Opcode::Push, Type::I64, vec![Param::Reg(r0)]);
        assert_eq!(insn.defined_register(), None);
        assert_eq!(insn.used_registers(), vec![r0]);
    }

    #[test]
    fn label_target_is_found() {
        let l = intern_global("end");
        let insn = Insn::new(Opcode::Jump, Type::I64, vec![Param::Label(l)]);
        assert_eq!(insn.label_target(), Some(l));
    }
}
