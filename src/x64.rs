//! A low-level x86-64 assembler: argument types, REX/ModR/M/SIB encoding,
//! and one emitter per instruction family. [`crate::select`] is the only
//! caller — it converts IR params into [`Arg`]s and asks this module to
//! encode them; this module knows nothing about the IR.

use crate::error::EmitError;
use crate::target::{PhysReg, RBP, RSP};

/// Operand size in bits, or `Auto` when unconstrained by the argument
/// itself (an immediate, or a memory operand with no registered width) —
/// resolved against the instruction's other operands by [`resolve_size`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Size {
    S8,
    S16,
    S32,
    S64,
    Auto,
}

impl Size {
    pub fn bits(self) -> Option<u32> {
        match self {
            Size::S8 => Some(8),
            Size::S16 => Some(16),
            Size::S32 => Some(32),
            Size::S64 => Some(64),
            Size::Auto => None,
        }
    }
}

/// A scaled-index memory operand's scale factor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scale {
    X1,
    X2,
    X4,
    X8,
}

impl Scale {
    fn bits(self) -> u8 {
        match self {
            Scale::X1 => 0,
            Scale::X2 => 1,
            Scale::X4 => 2,
            Scale::X8 => 3,
        }
    }
}

/// The closed set of x86-64 operand shapes this emitter accepts.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    Reg(Size, PhysReg),
    /// An XMM register (float operations always address the SSE file,
    /// never the GPR file, regardless of `Size`).
    Xmm(PhysReg),
    Imm(Size, i64),
    /// `[base + disp]`
    Mem { size: Size, base: PhysReg, disp: i32 },
    /// `[base + index*scale + disp]`
    MemIndex { size: Size, base: PhysReg, index: PhysReg, scale: Scale, disp: i32 },
    /// RIP-relative: `disp` is patched by a relocation after encoding, so
    /// this carries a placeholder and the caller fixes up the symbol
    /// reference itself via `Object::reference`.
    RipRelative { size: Size },
    /// An absolute 64-bit address, used only where the ABI allows it
    /// (`movabs`).
    Abs64(u64),
    /// A label operand: emitted as a 4-byte placeholder plus a relocation,
    /// also left to the caller (mirrors `RipRelative`).
    Label,
}

impl Arg {
    pub fn size(&self) -> Size {
        match self {
            Arg::Reg(s, _) => *s,
            Arg::Xmm(_) => Size::S64,
            Arg::Imm(s, _) => *s,
            Arg::Mem { size, .. } => *size,
            Arg::MemIndex { size, .. } => *size,
            Arg::RipRelative { size } => *size,
            Arg::Abs64(_) => Size::S64,
            Arg::Label => Size::S32,
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, Arg::Mem { .. } | Arg::MemIndex { .. } | Arg::RipRelative { .. })
    }
}

/// Resolve the effective operand size across an instruction's arguments:
/// any concrete size constrains it; multiple concrete sizes must agree;
/// all-`Auto` is an error (ambiguous size).
pub fn resolve_size(args: &[&Arg]) -> Result<u32, EmitError> {
    let mut resolved: Option<u32> = None;
    for a in args {
        if let Some(bits) = a.size().bits() {
            match resolved {
                None => resolved = Some(bits),
                Some(r) if r == bits => {}
                Some(r) => return Err(EmitError::IncompatibleSizes { a: r, b: bits }),
            }
        }
    }
    resolved.ok_or(EmitError::AmbiguousSize)
}

fn reg_num(r: PhysReg) -> u8 {
    r & 0x7
}

fn reg_ext(r: PhysReg) -> bool {
    r >= 8
}

/// Whether encoding this register in the low (non-REX) byte-register
/// position would actually select AH/CH/DH/BH instead of the intended
/// SPL/BPL/SIL/DIL — the REX prefix (even a content-free `0x40`) is what
/// disambiguates them, so 8-bit operands on RSP/RBP/RSI/RDI always force
/// one.
fn needs_rex_for_byte_reg(r: PhysReg) -> bool {
    matches!(r, RSP | RBP | 6 | 7)
}

struct RexBuilder {
    w: bool,
    r: bool,
    x: bool,
    b: bool,
    force: bool,
}

impl RexBuilder {
    fn new(size_bits: u32) -> RexBuilder {
        RexBuilder { w: size_bits == 64, r: false, x: false, b: false, force: false }
    }

    fn reg_field(mut self, r: PhysReg) -> RexBuilder {
        self.r = reg_ext(r);
        self
    }

    fn rm_field(mut self, r: PhysReg) -> RexBuilder {
        self.b = reg_ext(r);
        self
    }

    fn index_field(mut self, r: PhysReg) -> RexBuilder {
        self.x = reg_ext(r);
        self
    }

    fn force(mut self) -> RexBuilder {
        self.force = true;
        self
    }

    /// Emit the REX byte iff any bit is set or it was forced (8-bit
    /// operand touching SPL/BPL/SIL/DIL).
    fn emit(self, out: &mut Vec<u8>) {
        if self.w || self.r || self.x || self.b || self.force {
            let byte = 0x40 | (self.w as u8) << 3 | (self.r as u8) << 2 | (self.x as u8) << 1 | (self.b as u8);
            out.push(byte);
        }
    }
}

/// Encode a ModR/M (+ SIB + displacement) sequence for `reg_field` paired
/// with `rm`. `reg_field` holds either a second register operand or an
/// opcode extension, per the caller's choice.
fn encode_modrm(out: &mut Vec<u8>, reg_field: u8, rm: &Arg) -> Result<(), EmitError> {
    match rm {
        Arg::Reg(_, r) | Arg::Xmm(r) => {
            out.push(0xC0 | (reg_field & 7) << 3 | reg_num(*r));
        }
        Arg::Mem { base, disp, .. } => encode_mem(out, reg_field, *base, *disp),
        Arg::MemIndex { base, index, scale, disp, .. } => encode_mem_index(out, reg_field, *base, *index, *scale, *disp),
        Arg::RipRelative { .. } => {
            out.push((reg_field & 7) << 3 | 0b101);
            out.extend_from_slice(&0i32.to_le_bytes());
        }
        _ => return Err(EmitError::Unsupported("modrm operand must be a register or memory")),
    }
    Ok(())
}

fn disp_class(disp: i32, base: PhysReg) -> u8 {
    if disp == 0 && reg_num(base) != 0b101 {
        0b00
    } else if (-128..=127).contains(&disp) {
        0b01
    } else {
        0b10
    }
}

fn encode_mem(out: &mut Vec<u8>, reg_field: u8, base: PhysReg, disp: i32) {
    let md = disp_class(disp, base);
    let rm_needs_sib = reg_num(base) == 0b100; // RSP/R12 always need a SIB byte
    if rm_needs_sib {
        out.push(md << 6 | (reg_field & 7) << 3 | 0b100);
        out.push(0b00_100_100 | reg_num(base)); // scale=1, no index, base
    } else {
        out.push(md << 6 | (reg_field & 7) << 3 | reg_num(base));
    }
    push_disp(out, md, disp);
}

fn encode_mem_index(out: &mut Vec<u8>, reg_field: u8, base: PhysReg, index: PhysReg, scale: Scale, disp: i32) {
    let md = disp_class(disp, base);
    out.push(md << 6 | (reg_field & 7) << 3 | 0b100);
    out.push(scale.bits() << 6 | reg_num(index) << 3 | reg_num(base));
    push_disp(out, md, disp);
}

fn push_disp(out: &mut Vec<u8>, md: u8, disp: i32) {
    match md {
        0b00 => {}
        0b01 => out.push(disp as i8 as u8),
        _ => out.extend_from_slice(&disp.to_le_bytes()),
    }
}

fn arg_registers(arg: &Arg) -> (Option<PhysReg>, Option<PhysReg>) {
    match arg {
        Arg::Mem { base, .. } => (Some(*base), None),
        Arg::MemIndex { base, index, .. } => (Some(*base), Some(*index)),
        _ => (None, None),
    }
}

/// Arithmetic operation numbers for the shared `0x00..0x3D` grid (each
/// op occupies 8 opcode bytes: r/m8,r8 / r/m32,r32 / r8,r/m8 / r32,r/m32 /
/// al,imm8 / eax,imm32, plus two reserved slots).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl ArithOp {
    fn grid_index(self) -> u8 {
        match self {
            ArithOp::Add => 0,
            ArithOp::Or => 1,
            ArithOp::Adc => 2,
            ArithOp::Sbb => 3,
            ArithOp::And => 4,
            ArithOp::Sub => 5,
            ArithOp::Xor => 6,
            ArithOp::Cmp => 7,
        }
    }

    /// The `/digit` opcode-extension used by the immediate-form
    /// (`0x80`-`0x83`) encoding, identical to the grid index here.
    fn imm_extension(self) -> u8 {
        self.grid_index()
    }
}

fn size_prefix(bits: u32, out: &mut Vec<u8>) {
    if bits == 16 {
        out.push(0x66);
    }
}

/// Encode a binary arithmetic instruction `op dst, src` where `dst` is a
/// register or memory operand and `src` is a register or an immediate.
/// Dispatches on whether `src` is an immediate (the `0x80`-`0x83` family,
/// opcode extension in ModR/M's `reg` field) or a register (the
/// `0x00`-`0x3D` grid, indexed by `op`'s grid position times 8).
pub fn encode_arith(op: ArithOp, dst: &Arg, src: &Arg) -> Result<Vec<u8>, EmitError> {
    let bits = resolve_size(&[dst, src])?;
    let mut out = Vec::new();
    size_prefix(bits, &mut out);

    match src {
        Arg::Imm(_, imm) => {
            if bits == 64 && (*imm < i32::MIN as i64 || *imm > i32::MAX as i64) {
                return Err(EmitError::ImmediateOutOfRange(*imm));
            }
            let (base, index) = arg_registers(dst);
            let mut rex = RexBuilder::new(bits).rm_field(base.unwrap_or(0));
            if let Some(idx) = index {
                rex = rex.index_field(idx);
            }
            if bits == 8 {
                if let Arg::Reg(_, r) = dst {
                    if needs_rex_for_byte_reg(*r) {
                        rex = rex.force();
                    }
                }
            }
            rex.emit(&mut out);
            let imm8_fits = bits != 8 && (-128..=127).contains(imm);
            let opcode = match bits {
                8 => 0x80,
                _ if imm8_fits => 0x83,
                _ => 0x81,
            };
            out.push(opcode);
            encode_modrm(&mut out, op.imm_extension(), dst)?;
            match bits {
                8 => out.push(*imm as u8),
                _ if imm8_fits => out.push(*imm as i8 as u8),
                16 => out.extend_from_slice(&(*imm as i16).to_le_bytes()),
                _ => out.extend_from_slice(&(*imm as i32).to_le_bytes()),
            }
        }
        Arg::Reg(_, src_reg) => {
            let (base, index) = arg_registers(dst);
            let mut rex = RexBuilder::new(bits).reg_field(*src_reg);
            rex = if let Some(b) = base { rex.rm_field(b) } else { rex };
            if let Some(idx) = index {
                rex = rex.index_field(idx);
            }
            if bits == 8 && (needs_rex_for_byte_reg(*src_reg) || matches!(dst, Arg::Reg(_, r) if needs_rex_for_byte_reg(*r))) {
                rex = rex.force();
            }
            rex.emit(&mut out);
            let base_opcode = op.grid_index() * 8;
            let opcode = base_opcode + if bits == 8 { 0x00 } else { 0x01 };
            // Direction: the grid's `+0/+1` forms are `r/m, reg` (dst is
            // rm); `dst` here is always the memory/register destination,
            // matching that convention directly.
            out.push(opcode);
            encode_modrm(&mut out, reg_num(*src_reg) | (reg_ext(*src_reg) as u8) << 3, dst)?;
        }
        _ => return Err(EmitError::Unsupported("arithmetic source must be a register or immediate")),
    }
    Ok(out)
}

/// `mov dst, src`, register/memory/immediate in either direction (never
/// memory-to-memory — [`crate::select`] splits that via a push/pop pair
/// before calling here).
pub fn encode_mov(dst: &Arg, src: &Arg) -> Result<Vec<u8>, EmitError> {
    let bits = resolve_size(&[dst, src])?;
    let mut out = Vec::new();
    size_prefix(bits, &mut out);
    match (dst, src) {
        (_, Arg::Imm(_, imm)) if dst.is_memory() => {
            let (base, index) = arg_registers(dst);
            let mut rex = RexBuilder::new(bits).rm_field(base.unwrap_or(0));
            if let Some(idx) = index {
                rex = rex.index_field(idx);
            }
            rex.emit(&mut out);
            out.push(if bits == 8 { 0xC6 } else { 0xC7 });
            encode_modrm(&mut out, 0, dst)?;
            match bits {
                8 => out.push(*imm as u8),
                16 => out.extend_from_slice(&(*imm as i16).to_le_bytes()),
                _ => out.extend_from_slice(&(*imm as i32).to_le_bytes()),
            }
        }
        (Arg::Reg(_, r), Arg::Imm(_, imm)) if bits == 64 => {
            let mut rex = RexBuilder::new(64).rm_field(*r);
            rex.emit(&mut out);
            out.push(0xB8 + reg_num(*r));
            out.extend_from_slice(&imm.to_le_bytes());
        }
        (Arg::Reg(_, r), Arg::Imm(_, imm)) => {
            let mut rex = RexBuilder::new(bits);
            if bits == 8 && needs_rex_for_byte_reg(*r) {
                rex = rex.force();
            }
            rex = rex.rm_field(*r);
            rex.emit(&mut out);
            out.push(if bits == 8 { 0xB0 + reg_num(*r) } else { 0xB8 + reg_num(*r) });
            match bits {
                8 => out.push(*imm as u8),
                16 => out.extend_from_slice(&(*imm as i16).to_le_bytes()),
                _ => out.extend_from_slice(&(*imm as i32).to_le_bytes()),
            }
        }
        (Arg::Reg(_, r), rm) if !matches!(rm, Arg::Imm(..)) => {
            let (base, index) = arg_registers(rm);
            let mut rex = RexBuilder::new(bits).reg_field(*r);
            rex = if let Some(b) = base { rex.rm_field(b) } else { rex };
            if let Some(idx) = index {
                rex = rex.index_field(idx);
            }
            rex.emit(&mut out);
            out.push(if bits == 8 { 0x8A } else { 0x8B });
            encode_modrm(&mut out, reg_num(*r) | (reg_ext(*r) as u8) << 3, rm)?;
        }
        (rm, Arg::Reg(_, r)) => {
            let (base, index) = arg_registers(rm);
            let mut rex = RexBuilder::new(bits).reg_field(*r);
            rex = if let Some(b) = base { rex.rm_field(b) } else { rex };
            if let Some(idx) = index {
                rex = rex.index_field(idx);
            }
            rex.emit(&mut out);
            out.push(if bits == 8 { 0x88 } else { 0x89 });
            encode_modrm(&mut out, reg_num(*r) | (reg_ext(*r) as u8) << 3, rm)?;
        }
        _ => return Err(EmitError::Unsupported("unsupported mov operand combination")),
    }
    Ok(out)
}

/// `lea dst, [mem]`.
pub fn encode_lea(dst: PhysReg, mem: &Arg) -> Result<Vec<u8>, EmitError> {
    if !mem.is_memory() {
        return Err(EmitError::Unsupported("lea source must be a memory operand"));
    }
    let mut out = Vec::new();
    let (base, index) = arg_registers(mem);
    let mut rex = RexBuilder::new(64).reg_field(dst);
    rex = if let Some(b) = base { rex.rm_field(b) } else { rex };
    if let Some(idx) = index {
        rex = rex.index_field(idx);
    }
    rex.emit(&mut out);
    out.push(0x8D);
    encode_modrm(&mut out, reg_num(dst) | (reg_ext(dst) as u8) << 3, mem)?;
    Ok(out)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
}

impl ShiftOp {
    fn extension(self) -> u8 {
        match self {
            ShiftOp::Rol => 0,
            ShiftOp::Ror => 1,
            ShiftOp::Shl => 4,
            ShiftOp::Shr => 5,
            ShiftOp::Sar => 7,
        }
    }
}

/// `op dst, imm8` (shifts always take an immediate count here — variable
/// `cl`-counted shifts aren't part of the IR's shift opcodes).
pub fn encode_shift(op: ShiftOp, dst: &Arg, count: u8) -> Result<Vec<u8>, EmitError> {
    let bits = resolve_size(&[dst])?;
    let mut out = Vec::new();
    size_prefix(bits, &mut out);
    let (base, _) = arg_registers(dst);
    let mut rex = RexBuilder::new(bits).rm_field(base.unwrap_or(0));
    if let Arg::Reg(_, r) = dst {
        if bits == 8 && needs_rex_for_byte_reg(*r) {
            rex = rex.force();
        }
    }
    rex.emit(&mut out);
    if count == 1 {
        out.push(if bits == 8 { 0xD0 } else { 0xD1 });
        encode_modrm(&mut out, op.extension(), dst)?;
    } else {
        out.push(if bits == 8 { 0xC0 } else { 0xC1 });
        encode_modrm(&mut out, op.extension(), dst)?;
        out.push(count);
    }
    Ok(out)
}

/// `neg`/`not dst`, `inc`/`dec dst` — the unary `0xF6`-`0xFF` family,
/// dispatched by opcode extension.
pub fn encode_unary(extension: u8, wide_opcode: u8, dst: &Arg) -> Result<Vec<u8>, EmitError> {
    let bits = resolve_size(&[dst])?;
    let mut out = Vec::new();
    size_prefix(bits, &mut out);
    let (base, _) = arg_registers(dst);
    RexBuilder::new(bits).rm_field(base.unwrap_or(0)).emit(&mut out);
    out.push(if bits == 8 { wide_opcode - 1 } else { wide_opcode });
    encode_modrm(&mut out, extension, dst)?;
    Ok(out)
}

pub fn encode_neg(dst: &Arg) -> Result<Vec<u8>, EmitError> {
    encode_unary(3, 0xF7, dst)
}

pub fn encode_not(dst: &Arg) -> Result<Vec<u8>, EmitError> {
    encode_unary(2, 0xF7, dst)
}

pub fn encode_inc(dst: &Arg) -> Result<Vec<u8>, EmitError> {
    encode_unary(0, 0xFF, dst)
}

pub fn encode_dec(dst: &Arg) -> Result<Vec<u8>, EmitError> {
    encode_unary(1, 0xFF, dst)
}

/// `imul dst, src` (two-operand form; truncating signed multiply).
pub fn encode_imul(dst: PhysReg, src: &Arg) -> Result<Vec<u8>, EmitError> {
    let bits = resolve_size(&[src])?.max(64);
    let mut out = Vec::new();
    let (base, index) = arg_registers(src);
    let mut rex = RexBuilder::new(bits).reg_field(dst);
    rex = if let Some(b) = base { rex.rm_field(b) } else { rex };
    if let Some(idx) = index {
        rex = rex.index_field(idx);
    }
    rex.emit(&mut out);
    out.extend_from_slice(&[0x0F, 0xAF]);
    encode_modrm(&mut out, reg_num(dst) | (reg_ext(dst) as u8) << 3, src)?;
    Ok(out)
}

/// `idiv src` (implicit `rdx:rax / src -> rax, rdx`).
pub fn encode_idiv(src: &Arg) -> Result<Vec<u8>, EmitError> {
    encode_unary(7, 0xF7, src)
}

/// `cqo`: sign-extend RAX into RDX:RAX ahead of a 64-bit `idiv`.
pub fn encode_cqo() -> Vec<u8> {
    vec![0x48, 0x99]
}

pub fn encode_push(src: &Arg) -> Result<Vec<u8>, EmitError> {
    match src {
        Arg::Reg(_, r) => {
            let mut out = Vec::new();
            if reg_ext(*r) {
                out.push(0x41);
            }
            out.push(0x50 + reg_num(*r));
            Ok(out)
        }
        Arg::Imm(_, imm) if (i32::MIN as i64..=i32::MAX as i64).contains(imm) => {
            let mut out = vec![0x68];
            out.extend_from_slice(&(*imm as i32).to_le_bytes());
            Ok(out)
        }
        Arg::Mem { .. } | Arg::MemIndex { .. } => {
            let mut out = Vec::new();
            let (base, index) = arg_registers(src);
            let mut rex = RexBuilder::new(0).rm_field(base.unwrap_or(0));
            if let Some(idx) = index {
                rex = rex.index_field(idx);
            }
            rex.emit(&mut out);
            out.push(0xFF);
            encode_modrm(&mut out, 6, src)?;
            Ok(out)
        }
        _ => Err(EmitError::Unsupported("push operand")),
    }
}

pub fn encode_pop(dst: PhysReg) -> Vec<u8> {
    let mut out = Vec::new();
    if reg_ext(dst) {
        out.push(0x41);
    }
    out.push(0x58 + reg_num(dst));
    out
}

pub fn encode_ret() -> Vec<u8> {
    vec![0xC3]
}

/// `call reg` (indirect) or a `call rel32` placeholder (4 zero bytes; the
/// caller attaches a relocation over them via `Object::reference`).
pub fn encode_call_reg(target: PhysReg) -> Vec<u8> {
    let mut out = Vec::new();
    if reg_ext(target) {
        out.push(0x41);
    }
    out.push(0xFF);
    out.push(0xD0 | reg_num(target));
    out
}

pub fn encode_call_rel32_placeholder() -> Vec<u8> {
    let mut out = vec![0xE8];
    out.extend_from_slice(&[0, 0, 0, 0]);
    out
}

pub fn encode_jmp_rel32_placeholder() -> Vec<u8> {
    let mut out = vec![0xE9];
    out.extend_from_slice(&[0, 0, 0, 0]);
    out
}

/// Condition codes for `jcc`, indexed to match the IR's six comparison/
/// branch opcode pairs (`jeq/ceq` .. `jge/cge`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Condition {
    fn tttn(self) -> u8 {
        match self {
            Condition::Eq => 0x4,
            Condition::Ne => 0x5,
            Condition::Lt => 0xC,
            Condition::Ge => 0xD,
            Condition::Le => 0xE,
            Condition::Gt => 0xF,
        }
    }

    /// The byte that would set a GPR to 0/1 via `setcc`, used by the
    /// comparison opcodes (`ceq`, `cl`, ...) which materialise a boolean
    /// rather than branch.
    pub fn setcc_opcode(self) -> u8 {
        0x90 | self.tttn()
    }
}

pub fn encode_jcc_rel32_placeholder(cond: Condition) -> Vec<u8> {
    let mut out = vec![0x0F, 0x80 | cond.tttn()];
    out.extend_from_slice(&[0, 0, 0, 0]);
    out
}

/// `setcc dst8` followed by a zero-extend into the full destination
/// width, the standard sequence for materialising a comparison's boolean
/// result in a GPR.
pub fn encode_setcc(cond: Condition, dst: PhysReg) -> Vec<u8> {
    let mut out = Vec::new();
    if reg_ext(dst) || needs_rex_for_byte_reg(dst) {
        RexBuilder::new(0).rm_field(dst).force().emit(&mut out);
    }
    out.extend_from_slice(&[0x0F, cond.setcc_opcode()]);
    out.push(0xC0 | reg_num(dst));
    out
}

pub fn encode_movzx_byte_to(dst: PhysReg, src: PhysReg) -> Vec<u8> {
    let mut out = Vec::new();
    RexBuilder::new(64).reg_field(dst).rm_field(src).emit(&mut out);
    out.extend_from_slice(&[0x0F, 0xB6]);
    out.push(0xC0 | reg_num(dst) << 3 | reg_num(src));
    out
}

pub fn encode_cmp(lhs: &Arg, rhs: &Arg) -> Result<Vec<u8>, EmitError> {
    encode_arith(ArithOp::Cmp, lhs, rhs)
}

/// `cmp reg, reg/imm` followed by `setcc`/zero-extend, for `ceq`..`cge`.
pub fn encode_compare_to_bool(cond: Condition, dst: PhysReg, lhs: &Arg, rhs: &Arg) -> Result<Vec<u8>, EmitError> {
    let mut out = encode_cmp(lhs, rhs)?;
    out.extend(encode_setcc(cond, dst));
    out.extend(encode_movzx_byte_to(dst, dst));
    Ok(out)
}

/// `xor dst, dst`, the canonical zero-register idiom.
pub fn encode_xor_zero(dst: PhysReg) -> Result<Vec<u8>, EmitError> {
    encode_arith(ArithOp::Xor, &Arg::Reg(Size::S32, dst), &Arg::Reg(Size::S32, dst))
}

/// Intel's recommended multi-byte `nop` sequences, 1 through 9 bytes.
pub fn canonical_nop(len: u8) -> Vec<u8> {
    match len {
        1 => vec![0x90],
        2 => vec![0x66, 0x90],
        3 => vec![0x0F, 0x1F, 0x00],
        4 => vec![0x0F, 0x1F, 0x40, 0x00],
        5 => vec![0x0F, 0x1F, 0x44, 0x00, 0x00],
        6 => vec![0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
        7 => vec![0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
        8 => vec![0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        9 => vec![0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        _ => (0..len).flat_map(|_| vec![0x90]).collect(),
    }
}

// --- Scalar SSE float ops -------------------------------------------------

fn xmm_rex(reg: PhysReg, rm_base: Option<PhysReg>) -> RexBuilder {
    let mut rex = RexBuilder::new(0).reg_field(reg);
    if let Some(b) = rm_base {
        rex = rex.rm_field(b);
    }
    rex
}

/// `movss`/`movsd dst, src` between XMM registers or memory.
pub fn encode_movx(double: bool, dst: &Arg, src: &Arg) -> Result<Vec<u8>, EmitError> {
    let mut out = vec![if double { 0xF2 } else { 0xF3 }];
    match (dst, src) {
        (Arg::Xmm(d), s) => {
            let (base, _) = arg_registers(s);
            xmm_rex(*d, base.or_else(|| if let Arg::Xmm(r) = s { Some(*r) } else { None })).emit(&mut out);
            out.extend_from_slice(&[0x0F, 0x10]);
            encode_modrm(&mut out, reg_num(*d) | (reg_ext(*d) as u8) << 3, s)?;
        }
        (d, Arg::Xmm(s)) => {
            let (base, _) = arg_registers(d);
            xmm_rex(*s, base).emit(&mut out);
            out.extend_from_slice(&[0x0F, 0x11]);
            encode_modrm(&mut out, reg_num(*s) | (reg_ext(*s) as u8) << 3, d)?;
        }
        _ => return Err(EmitError::Unsupported("movss/movsd needs at least one xmm operand")),
    }
    Ok(out)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl FloatOp {
    fn opcode(self) -> u8 {
        match self {
            FloatOp::Add => 0x58,
            FloatOp::Sub => 0x5C,
            FloatOp::Mul => 0x59,
            FloatOp::Div => 0x5E,
        }
    }
}

pub fn encode_float_arith(op: FloatOp, double: bool, dst: PhysReg, src: &Arg) -> Result<Vec<u8>, EmitError> {
    let mut out = vec![if double { 0xF2 } else { 0xF3 }];
    let (base, _) = arg_registers(src);
    xmm_rex(dst, base.or_else(|| if let Arg::Xmm(r) = src { Some(*r) } else { None })).emit(&mut out);
    out.extend_from_slice(&[0x0F, op.opcode()]);
    encode_modrm(&mut out, reg_num(dst) | (reg_ext(dst) as u8) << 3, src)?;
    Ok(out)
}

/// `cvtsi2sd`/`cvtsi2ss dst, src` (GPR -> XMM) and `cvttsd2si`/`cvttss2si`
/// (XMM -> GPR, truncating), covering `icast` between integer and float
/// kinds.
pub fn encode_cvt_int_to_float(double: bool, dst: PhysReg, src: &Arg) -> Result<Vec<u8>, EmitError> {
    let bits = resolve_size(&[src])?;
    let mut out = vec![if double { 0xF2 } else { 0xF3 }];
    let (base, _) = arg_registers(src);
    let mut rex = RexBuilder::new(bits).reg_field(dst);
    if let Some(b) = base {
        rex = rex.rm_field(b);
    }
    rex.emit(&mut out);
    out.extend_from_slice(&[0x0F, 0x2A]);
    encode_modrm(&mut out, reg_num(dst) | (reg_ext(dst) as u8) << 3, src)?;
    Ok(out)
}

pub fn encode_cvt_float_to_int(double: bool, dst: PhysReg, src: PhysReg) -> Vec<u8> {
    let mut out = vec![if double { 0xF2 } else { 0xF3 }];
    RexBuilder::new(64).reg_field(dst).rm_field(src).emit(&mut out);
    out.extend_from_slice(&[0x0F, 0x2C]);
    out.push(0xC0 | reg_num(dst) << 3 | reg_num(src));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{RAX, RCX};

    #[test]
    fn mov_reg_imm64_uses_rex_w_and_b8() {
        let bytes = encode_mov(&Arg::Reg(Size::S64, RAX), &Arg::Imm(Size::S64, 42)).unwrap();
        assert_eq!(bytes[0], 0x48); // REX.W
        assert_eq!(bytes[1], 0xB8); // mov rax, imm64
    }

    #[test]
    fn add_reg_reg_uses_grid_opcode() {
        let bytes = encode_arith(ArithOp::Add, &Arg::Reg(Size::S64, RAX), &Arg::Reg(Size::S64, RCX)).unwrap();
        assert_eq!(bytes[0], 0x48);
        assert_eq!(bytes[1], 0x01); // add r/m64, r64
    }

    #[test]
    fn lea_requires_memory_source() {
        let err = encode_lea(RAX, &Arg::Reg(Size::S64, RCX)).unwrap_err();
        assert!(matches!(err, EmitError::Unsupported(_)));
    }

    #[test]
    fn ambiguous_size_is_rejected() {
        let err = encode_arith(ArithOp::Add, &Arg::Imm(Size::Auto, 1), &Arg::Imm(Size::Auto, 2)).unwrap_err();
        assert!(matches!(err, EmitError::AmbiguousSize));
    }

    #[test]
    fn canonical_nops_match_intel_lengths() {
        for n in 1..=9u8 {
            assert_eq!(canonical_nop(n).len(), n as usize);
        }
    }

    #[test]
    fn rsp_base_memory_operand_forces_sib() {
        let bytes = encode_mov(
            &Arg::Reg(Size::S64, RAX),
            &Arg::Mem { size: Size::S64, base: RSP, disp: 8 },
        )
        .unwrap();
        // REX, opcode, modrm, sib, disp8
        assert_eq!(bytes.len(), 5);
    }
}
