//! The Jasmine IR's own binary encoding, stored in an object's `code`
//! section when that object's `code` section has `arch = jasmine` (see
//! [`crate::object`]). This is a structured serialization of [`Insn`]s, not
//! to be confused with the native x86-64 machine code a retargeted object's
//! `code` section holds instead.
//!
//! Each instruction is a header (opcode, optional label, operand type, param
//! count) followed by that many tagged params. Struct type ids are a
//! sequential index into the `TypeContext` being built up by the
//! instruction stream itself (types must be declared, via an
//! [`Opcode::Type`] instruction, before any later instruction refers to
//! them — the same declare-before-use rule the text parser enforces), so
//! they're packed as a variable-length integer rather than a fixed 4 bytes.

use crate::common::{intern_global, ByteBuf, Kind, Symbol};
use crate::error::AssembleError;
use crate::ir::insn::Insn;
use crate::ir::opcode::Opcode;
use crate::ir::param::{Mem, Param, Register};
use crate::ir::types::{Member, Type, TypeContext};

const STRUCT_TY_TAG: u8 = 0xFF;
const PARAM_REG: u8 = 0;
const PARAM_IMM: u8 = 1;
const PARAM_LABEL: u8 = 2;
const PARAM_MEM: u8 = 3;
const MEM_REG_OFF: u8 = 0;
const MEM_LABEL_OFF: u8 = 1;
const MEM_REG_TYPE: u8 = 2;
const MEM_LABEL_TYPE: u8 = 3;

/// Write `v` as a little-endian base-128 varint, one continuation bit per
/// byte. Struct ids never approach 2^60, but the cap catches a runaway
/// caller rather than silently truncating.
fn write_varint(buf: &mut ByteBuf, mut v: u64) {
    assert!(v < (1u64 << 60), "struct id {v} exceeds the 60-bit budget");
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            buf.write(byte | 0x80);
        } else {
            buf.write(byte);
            break;
        }
    }
}

fn read_varint(buf: &mut ByteBuf) -> Result<u64, AssembleError> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = buf.read().ok_or(AssembleError::Truncated { expected: 1 })?;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift > 63 {
            return Err(AssembleError::MalformedStructId);
        }
    }
}

fn write_symbol_name(buf: &mut ByteBuf, symbol: Symbol) {
    let name = symbol.name();
    let bytes = name.as_bytes();
    buf.write_u16_le(bytes.len() as u16);
    buf.write_bytes(bytes);
}

fn read_symbol_name(buf: &mut ByteBuf) -> Result<Symbol, AssembleError> {
    let len = buf.read_u16_le().ok_or(AssembleError::Truncated { expected: 2 })? as usize;
    let bytes = buf.read_n(len).ok_or(AssembleError::Truncated { expected: len })?.to_vec();
    let name = String::from_utf8(bytes).map_err(|_| AssembleError::MalformedStructId)?;
    Ok(intern_global(name))
}

fn write_ty(buf: &mut ByteBuf, ty: Type) {
    if ty.kind == Kind::Struct {
        buf.write(STRUCT_TY_TAG);
        write_varint(buf, ty.id as u64);
    } else {
        buf.write(ty.kind.code());
    }
}

fn read_ty(buf: &mut ByteBuf) -> Result<Type, AssembleError> {
    let tag = buf.read().ok_or(AssembleError::Truncated { expected: 1 })?;
    if tag == STRUCT_TY_TAG {
        let id = read_varint(buf)?;
        Ok(Type::struct_(id as u32))
    } else {
        let kind = Kind::from_code(tag).ok_or(AssembleError::WrongParamKind { opcode: "type" })?;
        Ok(Type::primitive(kind))
    }
}

fn write_register(buf: &mut ByteBuf, reg: Register) {
    buf.write(reg.global as u8);
    buf.write_u64_le(reg.id);
}

fn read_register(buf: &mut ByteBuf) -> Result<Register, AssembleError> {
    let global = buf.read().ok_or(AssembleError::Truncated { expected: 1 })? != 0;
    let id = buf.read_u64_le().ok_or(AssembleError::Truncated { expected: 8 })?;
    Ok(Register { global, id })
}

fn write_mem(buf: &mut ByteBuf, mem: &Mem) {
    match mem.kind {
        crate::ir::param::MemKind::RegOff => {
            buf.write(MEM_REG_OFF);
            write_register(buf, mem.reg.unwrap());
            buf.write_i64_le(mem.off);
        }
        crate::ir::param::MemKind::LabelOff => {
            buf.write(MEM_LABEL_OFF);
            write_symbol_name(buf, mem.label.unwrap());
            buf.write_i64_le(mem.off);
        }
        crate::ir::param::MemKind::RegType => {
            buf.write(MEM_REG_TYPE);
            write_register(buf, mem.reg.unwrap());
            write_ty(buf, mem.ty.unwrap());
            write_field(buf, mem.field);
        }
        crate::ir::param::MemKind::LabelType => {
            buf.write(MEM_LABEL_TYPE);
            write_symbol_name(buf, mem.label.unwrap());
            write_ty(buf, mem.ty.unwrap());
            write_field(buf, mem.field);
        }
    }
}

fn write_field(buf: &mut ByteBuf, field: Option<usize>) {
    match field {
        Some(i) => {
            buf.write(1);
            buf.write(i as u8);
        }
        None => buf.write(0),
    }
}

fn read_field(buf: &mut ByteBuf) -> Result<Option<usize>, AssembleError> {
    let present = buf.read().ok_or(AssembleError::Truncated { expected: 1 })?;
    if present == 0 {
        Ok(None)
    } else {
        let idx = buf.read().ok_or(AssembleError::Truncated { expected: 1 })?;
        Ok(Some(idx as usize))
    }
}

fn read_mem(buf: &mut ByteBuf, types: &TypeContext) -> Result<Mem, AssembleError> {
    let kind = buf.read().ok_or(AssembleError::Truncated { expected: 1 })?;
    let mem = match kind {
        MEM_REG_OFF => {
            let reg = read_register(buf)?;
            let off = buf.read_i64_le().ok_or(AssembleError::Truncated { expected: 8 })?;
            Mem::reg_off(reg, off)
        }
        MEM_LABEL_OFF => {
            let label = read_symbol_name(buf)?;
            let off = buf.read_i64_le().ok_or(AssembleError::Truncated { expected: 8 })?;
            Mem::label_off(label, off)
        }
        MEM_REG_TYPE => {
            let reg = read_register(buf)?;
            let ty = read_ty(buf)?;
            let field = read_field(buf)?;
            attach_names(Mem::reg_type(reg, ty, field), ty, field, types)
        }
        MEM_LABEL_TYPE => {
            let label = read_symbol_name(buf)?;
            let ty = read_ty(buf)?;
            let field = read_field(buf)?;
            attach_names(Mem::label_type(label, ty, field), ty, field, types)
        }
        _ => return Err(AssembleError::WrongParamKind { opcode: "mem" }),
    };
    Ok(mem)
}

fn attach_names(mem: Mem, ty: Type, field: Option<usize>, types: &TypeContext) -> Mem {
    let mut mem = mem;
    if ty.kind == Kind::Struct {
        let info = types.info(ty);
        mem = mem.with_type_name(intern_global(&info.name));
        if let Some(idx) = field {
            mem = mem.with_field_name(intern_global(&info.members[idx].name));
        }
    }
    mem
}

fn write_param(buf: &mut ByteBuf, param: &Param) {
    match param {
        Param::Reg(r) => {
            buf.write(PARAM_REG);
            write_register(buf, *r);
        }
        Param::Imm(i) => {
            buf.write(PARAM_IMM);
            buf.write_i64_le(*i);
        }
        Param::Label(s) => {
            buf.write(PARAM_LABEL);
            write_symbol_name(buf, *s);
        }
        Param::Mem(m) => {
            buf.write(PARAM_MEM);
            write_mem(buf, m);
        }
    }
}

fn read_param(buf: &mut ByteBuf, types: &TypeContext) -> Result<Param, AssembleError> {
    let tag = buf.read().ok_or(AssembleError::Truncated { expected: 1 })?;
    Ok(match tag {
        PARAM_REG => Param::Reg(read_register(buf)?),
        PARAM_IMM => Param::Imm(buf.read_i64_le().ok_or(AssembleError::Truncated { expected: 8 })?),
        PARAM_LABEL => Param::Label(read_symbol_name(buf)?),
        PARAM_MEM => Param::Mem(read_mem(buf, types)?),
        _ => return Err(AssembleError::WrongParamKind { opcode: "param" }),
    })
}

/// Serialize one instruction stream to the Jasmine binary IR form.
pub fn assemble(insns: &[Insn]) -> ByteBuf {
    let mut buf = ByteBuf::new();
    for insn in insns {
        buf.write(insn.opcode.binary_code());
        match insn.label {
            Some(label) => {
                buf.write(1);
                write_symbol_name(&mut buf, label);
            }
            None => buf.write(0),
        }
        write_ty(&mut buf, insn.ty);
        assert!(insn.params.len() <= u8::MAX as usize, "more than 255 params in one instruction");
        buf.write(insn.params.len() as u8);
        for p in &insn.params {
            write_param(&mut buf, p);
        }
    }
    buf
}

/// Deserialize a Jasmine binary IR stream, rebuilding the struct-type table
/// from the embedded [`Opcode::Type`] instructions as they're encountered.
pub fn disassemble(mut buf: ByteBuf) -> Result<(Vec<Insn>, TypeContext), AssembleError> {
    let mut insns = Vec::new();
    let mut types = TypeContext::new();
    while !buf.is_empty() {
        let opcode_byte = buf.read().ok_or(AssembleError::Truncated { expected: 1 })?;
        let opcode = Opcode::from_binary_code(opcode_byte).ok_or(AssembleError::UnknownOpcode(opcode_byte))?;
        let has_label = buf.read().ok_or(AssembleError::Truncated { expected: 1 })? != 0;
        let label = if has_label { Some(read_symbol_name(&mut buf)?) } else { None };
        let _decoded_ty = read_ty(&mut buf)?;
        let param_count = buf.read().ok_or(AssembleError::Truncated { expected: 1 })? as usize;
        let mut params = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            params.push(read_param(&mut buf, &types)?);
        }

        if opcode == Opcode::Type {
            let name = label.ok_or(AssembleError::WrongParamKind { opcode: "type" })?;
            let members = decode_members(&params, &types)?;
            let ty = types.declare(name.name(), members);
            insns.push(Insn { label: Some(name), opcode, ty, params });
        } else {
            insns.push(Insn { label, opcode, ty: _decoded_ty, params });
        }
    }
    Ok((insns, types))
}

fn decode_members(params: &[Param], types: &TypeContext) -> Result<Vec<Member>, AssembleError> {
    let mut members = Vec::new();
    for chunk in params.chunks(3) {
        let [name, count, elem] = chunk else {
            return Err(AssembleError::WrongParamKind { opcode: "type" });
        };
        let name = name.as_label().ok_or(AssembleError::WrongParamKind { opcode: "type" })?.name();
        let count = count.as_immediate().ok_or(AssembleError::WrongParamKind { opcode: "type" })?;
        let element_type = match elem {
            Param::Imm(-1) => None,
            Param::Imm(code) => {
                let kind = Kind::from_code(*code as u8).ok_or(AssembleError::WrongParamKind { opcode: "type" })?;
                Some(Type::primitive(kind))
            }
            Param::Label(struct_name) => {
                Some(types.lookup(&struct_name.name()).ok_or_else(|| AssembleError::UnknownStructId(0))?)
            }
            _ => return Err(AssembleError::WrongParamKind { opcode: "type" }),
        };
        members.push(Member { name, count: count as u64, element_type });
    }
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::text;

    #[test]
    fn round_trips_simple_program() {
        let src = "foo: frame\nmov i64 %0,1\nadd i64 %1,%0,%0\nret i64 %1\n";
        let parsed = text::parse(src).unwrap();
        let bytes = assemble(&parsed.insns);
        let (insns, _types) = disassemble(bytes).unwrap();
        assert_eq!(insns.len(), parsed.insns.len());
        assert_eq!(insns[0].opcode, Opcode::Frame);
        assert_eq!(insns[2].opcode, Opcode::Add);
        assert_eq!(insns[3].opcode, Opcode::Ret);
    }

    #[test]
    fn round_trips_struct_type_and_field_mem() {
        let src = "type Pair{left:i64,right:i64}\nfoo: frame\nlocal Pair %0\nmov i64 [%0+Pair.left],1\nret i64 %0\n";
        let parsed = text::parse(src).unwrap();
        let bytes = assemble(&parsed.insns);
        let (insns, types) = disassemble(bytes).unwrap();
        assert_eq!(insns[0].opcode, Opcode::Type);
        let info = types.info(insns[0].ty);
        assert_eq!(info.name, "Pair");
        let mem = insns[3].params[0].as_mem().unwrap();
        assert_eq!(mem.field, Some(0));
        assert_eq!(mem.type_name.unwrap().name(), "Pair");
    }

    #[test]
    fn varint_round_trips_large_ids() {
        let mut buf = ByteBuf::new();
        write_varint(&mut buf, 123_456_789);
        assert_eq!(read_varint(&mut buf).unwrap(), 123_456_789);
    }

    #[test]
    fn unknown_opcode_byte_is_reported() {
        let buf = ByteBuf::from_vec(vec![0xFE, 0, 0, 0]);
        let err = disassemble(buf).unwrap_err();
        assert!(matches!(err, AssembleError::UnknownOpcode(0xFE)));
    }
}
