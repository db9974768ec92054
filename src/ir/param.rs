//! Virtual registers and instruction parameters.

use crate::common::Symbol;
use crate::ir::types::Type;
use std::fmt;

/// A register, virtual in the IR and physical after allocation. Global
/// registers are addressed by symbol rather than a numeric id; they denote
/// a top-level `global` declaration rather than a function-local value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Register {
    pub global: bool,
    pub id: u64,
}

impl Register {
    pub fn local(id: u64) -> Register {
        Register { global: false, id }
    }

    pub fn global(symbol: Symbol) -> Register {
        Register { global: true, id: symbol.id() as u64 }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.global {
            write!(f, "%{}", crate::common::SymbolTable::global().name_by_id(self.id as u32))
        } else {
            write!(f, "%{}", self.id)
        }
    }
}

/// The four memory-operand shapes a [`Param::Mem`] can take.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemKind {
    /// `[reg + offset]`
    RegOff,
    /// `[label + offset]`
    LabelOff,
    /// `[reg + TypeName]` or `[reg + TypeName.field]`
    RegType,
    /// `[label + TypeName]` or `[label + TypeName.field]`
    LabelType,
}

/// A memory operand. The `RegType`/`LabelType` forms carry a field index
/// into the struct's member list rather than a byte offset directly; the
/// byte offset is resolved against the target's pointer size at emit time
/// (see [`crate::ir::types::TypeInfo::offset_of`]).
#[derive(Clone, Debug, PartialEq)]
pub struct Mem {
    pub kind: MemKind,
    pub reg: Option<Register>,
    pub label: Option<Symbol>,
    /// For `RegOff`/`LabelOff`: a byte offset. For `RegType`/`LabelType`
    /// with no named field: unused (whole-struct base address). For
    /// `RegType`/`LabelType` with a named field: the field's declared
    /// index within the struct, not a byte offset.
    pub off: i64,
    pub ty: Option<Type>,
    pub field: Option<usize>,
    /// The struct type's own name, carried alongside `ty` so this operand
    /// can print itself (`[%0+Pair.left]`) without a `TypeContext` at hand.
    /// `None` for a primitive `ty` (the kind itself is the printed name).
    pub type_name: Option<Symbol>,
    /// The field's own name, mirroring `type_name`'s role for `field`.
    pub field_name: Option<Symbol>,
}

impl Mem {
    pub fn reg_off(reg: Register, off: i64) -> Mem {
        Mem { kind: MemKind::RegOff, reg: Some(reg), label: None, off, ty: None, field: None, type_name: None, field_name: None }
    }

    pub fn label_off(label: Symbol, off: i64) -> Mem {
        Mem { kind: MemKind::LabelOff, reg: None, label: Some(label), off, ty: None, field: None, type_name: None, field_name: None }
    }

    pub fn reg_type(reg: Register, ty: Type, field: Option<usize>) -> Mem {
        Mem { kind: MemKind::RegType, reg: Some(reg), label: None, off: 0, ty: Some(ty), field, type_name: None, field_name: None }
    }

    pub fn label_type(label: Symbol, ty: Type, field: Option<usize>) -> Mem {
        Mem { kind: MemKind::LabelType, reg: None, label: Some(label), off: 0, ty: Some(ty), field, type_name: None, field_name: None }
    }

    /// Attach the struct type's own name for display, when `ty` is a
    /// struct kind (a no-op call site can skip this for primitive `ty`s).
    pub fn with_type_name(mut self, name: Symbol) -> Mem {
        self.type_name = Some(name);
        self
    }

    /// Attach the accessed field's own name for display.
    pub fn with_field_name(mut self, name: Symbol) -> Mem {
        self.field_name = Some(name);
        self
    }

    /// The base register this operand addresses through, if any (labels
    /// have no base register).
    pub fn base_register(&self) -> Option<Register> {
        self.reg
    }
}

/// One instruction parameter: a value or location operand.
#[derive(Clone, Debug, PartialEq)]
pub enum Param {
    Reg(Register),
    Imm(i64),
    Label(Symbol),
    Mem(Mem),
}

impl Param {
    pub fn as_register(&self) -> Option<Register> {
        match self {
            Param::Reg(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_immediate(&self) -> Option<i64> {
        match self {
            Param::Imm(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_label(&self) -> Option<Symbol> {
        match self {
            Param::Label(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_mem(&self) -> Option<&Mem> {
        match self {
            Param::Mem(m) => Some(m),
            _ => None,
        }
    }

    /// All registers referenced by this operand: the register itself for
    /// `Reg`, or the base register of a memory operand. Used by liveness
    /// to collect `uses[i]`.
    pub fn registers_used(&self) -> Vec<Register> {
        match self {
            Param::Reg(r) => vec![*r],
            Param::Mem(m) => m.base_register().into_iter().collect(),
            Param::Imm(_) | Param::Label(_) => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_uses_collects_memory_base() {
        let r = Register::local(3);
        let p = Param::Mem(Mem::reg_off(r, 8));
        assert_eq!(p.registers_used(), vec![r]);
    }

    #[test]
    fn immediate_has_no_registers() {
        assert!(Param::Imm(5).registers_used().is_empty());
    }
}
