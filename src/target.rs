//! Architecture + OS descriptors: register pools, calling convention, and
//! per-instruction clobber/hint information consumed by [`crate::regalloc`].

use crate::common::{Kind, Set};
use crate::ir::{Insn, Opcode};

pub type PhysReg = u8;

// x86-64 general-purpose register encodings (used both standalone and as
// the `reg`/`rm` fields of ModR/M).
pub const RAX: PhysReg = 0;
pub const RCX: PhysReg = 1;
pub const RDX: PhysReg = 2;
pub const RBX: PhysReg = 3;
pub const RSP: PhysReg = 4;
pub const RBP: PhysReg = 5;
pub const RSI: PhysReg = 6;
pub const RDI: PhysReg = 7;
pub const R8: PhysReg = 8;
pub const R9: PhysReg = 9;
pub const R10: PhysReg = 10;
pub const R11: PhysReg = 11;
pub const R12: PhysReg = 12;
pub const R13: PhysReg = 13;
pub const R14: PhysReg = 14;
pub const R15: PhysReg = 15;

/// A post-allocation operand placement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    None,
    Register(PhysReg),
    /// Byte offset from RBP, for a spilled local (negative: below the
    /// frame pointer, growing downward as more locals spill).
    StackSlot(i64),
    /// A parameter pushed by the caller, addressed positively from RBP
    /// (past the saved RBP and return address).
    PushedR2L(i64),
    /// Reserved for ABI forms that push left-to-right; unused by the two
    /// targets implemented here, kept for completeness of the location
    /// lattice described by the data model.
    PushedL2R,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    X86_64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Os {
    Linux,
    MacOs,
    Windows,
}

/// An architecture+OS pair: register pools, calling convention, and
/// per-instruction clobber/hint information. Two concrete targets are
/// provided: [`SystemV`] (Linux/macOS) and [`MicrosoftX64`] (Windows).
pub trait Target: std::fmt::Debug {
    fn arch(&self) -> Arch;
    fn os(&self) -> Os;
    fn name(&self) -> &'static str;
    fn pointer_size(&self) -> u64 {
        8
    }

    /// Allocation candidates for a value of this `Kind`: GPRs for
    /// integers/pointers, XMM registers for floats. `RSP`/`RBP` are never
    /// included — they're reserved for stack and frame management.
    fn registers(&self, kind: Kind) -> &'static [PhysReg];

    /// The calling convention's argument registers for this `Kind`, in
    /// left-to-right placement order.
    fn parameter_registers(&self, kind: Kind) -> &'static [PhysReg];

    /// Place each parameter, walking the integer and floating-point pools
    /// independently; once a pool is exhausted, later parameters of that
    /// class go on the stack.
    fn place_parameters(&self, kinds: &[Kind]) -> Vec<Location> {
        let mut int_idx = 0usize;
        let mut float_idx = 0usize;
        let mut stack_offset: i64 = 16; // past saved RBP + return address
        kinds
            .iter()
            .map(|&kind| {
                let pool = self.parameter_registers(kind);
                let idx = if kind.is_float() { &mut float_idx } else { &mut int_idx };
                if *idx < pool.len() {
                    let reg = pool[*idx];
                    *idx += 1;
                    Location::Register(reg)
                } else {
                    let offset = stack_offset;
                    stack_offset += 8;
                    Location::PushedR2L(offset)
                }
            })
            .collect()
    }

    fn locate_return_value(&self, kind: Kind) -> Location {
        if kind.is_float() {
            Location::Register(0) // XMM0
        } else {
            Location::Register(RAX)
        }
    }

    /// Bytes of caller-reserved scratch space below the return address
    /// that the callee may use without adjusting RSP (Windows shadow
    /// space; zero under System V).
    fn shadow_space(&self) -> u64 {
        0
    }

    fn caller_saved(&self, kind: Kind) -> &'static [PhysReg];

    /// Physical registers this instruction invalidates, beyond whatever it
    /// explicitly writes as an IR destination.
    fn clobbers(&self, insn: &Insn) -> Set<PhysReg> {
        match insn.opcode {
            Opcode::Div | Opcode::Rem | Opcode::Mul => [RAX, RDX].into_iter().collect(),
            Opcode::Call => {
                let mut set: Set<PhysReg> = self.caller_saved(Kind::I64).iter().copied().collect();
                set.extend(self.caller_saved(Kind::F64).iter().copied());
                set
            }
            _ => Set::new(),
        }
    }

    /// One hint per parameter position of `insn` (parallel to
    /// `insn.params`); `None` means "no preference, pick from the pool".
    fn hint(&self, insn: &Insn) -> Vec<Option<PhysReg>> {
        let mut hints = vec![None; insn.params.len()];
        match insn.opcode {
            Opcode::Div | Opcode::Rem if !hints.is_empty() => {
                hints[0] = Some(RAX);
            }
            Opcode::Call => {
                if !hints.is_empty() {
                    hints[0] = Some(self.locate_return_value(insn.ty.kind).register().unwrap_or(RAX));
                }
                let params = self.parameter_registers(insn.ty.kind);
                for (i, h) in hints.iter_mut().enumerate().skip(2) {
                    if let Some(&reg) = params.get(i - 2) {
                        *h = Some(reg);
                    }
                }
            }
            _ => {}
        }
        hints
    }

    /// The native bytes `define_native` writes to the code section as a
    /// trampoline to an externally-bound address: `mov rax, imm64; call
    /// rax; ret`.
    fn trampoline(&self, address: u64) -> Vec<u8> {
        let mut bytes = vec![0x48, 0xb8]; // REX.W + mov rax, imm64
        bytes.extend_from_slice(&address.to_le_bytes());
        bytes.extend_from_slice(&[0xff, 0xd0]); // call rax
        bytes.push(0xc3); // ret
        bytes
    }
}

impl Location {
    pub fn register(self) -> Option<PhysReg> {
        match self {
            Location::Register(r) => Some(r),
            _ => None,
        }
    }
}

const INT_POOL: [PhysReg; 12] = [RAX, RCX, RDX, RSI, RDI, RBX, R8, R9, R10, R11, R12, R13];
const INT_POOL_WIN: [PhysReg; 12] = [RAX, RCX, RDX, RSI, RDI, RBX, R8, R9, R10, R11, R12, R13];
const FLOAT_POOL: [PhysReg; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

const SYSV_INT_PARAMS: [PhysReg; 6] = [RDI, RSI, RDX, RCX, R8, R9];
const SYSV_FLOAT_PARAMS: [PhysReg; 8] = [0, 1, 2, 3, 4, 5, 6, 7];
const SYSV_CALLER_SAVED_INT: [PhysReg; 9] = [RAX, RCX, RDX, RSI, RDI, R8, R9, R10, R11];
const SYSV_CALLER_SAVED_FLOAT: [PhysReg; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

const WIN_INT_PARAMS: [PhysReg; 4] = [RCX, RDX, R8, R9];
const WIN_FLOAT_PARAMS: [PhysReg; 4] = [0, 1, 2, 3];
const WIN_CALLER_SAVED_INT: [PhysReg; 7] = [RAX, RCX, RDX, R8, R9, R10, R11];
const WIN_CALLER_SAVED_FLOAT: [PhysReg; 6] = [0, 1, 2, 3, 4, 5];

/// System V AMD64 ABI: Linux and macOS.
#[derive(Debug, Clone, Copy)]
pub struct SystemV {
    pub os: Os,
}

impl Target for SystemV {
    fn arch(&self) -> Arch {
        Arch::X86_64
    }
    fn os(&self) -> Os {
        self.os
    }
    fn name(&self) -> &'static str {
        "x86_64-systemv"
    }

    fn registers(&self, kind: Kind) -> &'static [PhysReg] {
        if kind.is_float() {
            &FLOAT_POOL
        } else {
            &INT_POOL
        }
    }

    fn parameter_registers(&self, kind: Kind) -> &'static [PhysReg] {
        if kind.is_float() {
            &SYSV_FLOAT_PARAMS
        } else {
            &SYSV_INT_PARAMS
        }
    }

    fn caller_saved(&self, kind: Kind) -> &'static [PhysReg] {
        if kind.is_float() {
            &SYSV_CALLER_SAVED_FLOAT
        } else {
            &SYSV_CALLER_SAVED_INT
        }
    }
}

/// Microsoft x64 ABI: Windows.
#[derive(Debug, Clone, Copy)]
pub struct MicrosoftX64;

impl Target for MicrosoftX64 {
    fn arch(&self) -> Arch {
        Arch::X86_64
    }
    fn os(&self) -> Os {
        Os::Windows
    }
    fn name(&self) -> &'static str {
        "x86_64-windows"
    }

    fn registers(&self, kind: Kind) -> &'static [PhysReg] {
        if kind.is_float() {
            &FLOAT_POOL
        } else {
            &INT_POOL_WIN
        }
    }

    fn parameter_registers(&self, kind: Kind) -> &'static [PhysReg] {
        if kind.is_float() {
            &WIN_FLOAT_PARAMS
        } else {
            &WIN_INT_PARAMS
        }
    }

    fn caller_saved(&self, kind: Kind) -> &'static [PhysReg] {
        if kind.is_float() {
            &WIN_CALLER_SAVED_FLOAT
        } else {
            &WIN_CALLER_SAVED_INT
        }
    }

    fn shadow_space(&self) -> u64 {
        32
    }
}

/// Construct the host's native target, used by `retarget`/`--compile` when
/// no explicit target is given.
pub fn host_target() -> Box<dyn Target> {
    #[cfg(target_os = "windows")]
    {
        Box::new(MicrosoftX64)
    }
    #[cfg(target_os = "macos")]
    {
        Box::new(SystemV { os: Os::MacOs })
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        Box::new(SystemV { os: Os::Linux })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Type;

    #[test]
    fn sysv_places_overflow_on_stack() {
        let t = SystemV { os: Os::Linux };
        let kinds = vec![Kind::I64; 7];
        let locs = t.place_parameters(&kinds);
        assert_eq!(locs[5], Location::Register(R9));
        assert_eq!(locs[6], Location::PushedR2L(16));
    }

    #[test]
    fn windows_has_four_register_params_and_shadow_space() {
        let t = MicrosoftX64;
        assert_eq!(t.parameter_registers(Kind::I64).len(), 4);
        assert_eq!(t.shadow_space(), 32);
    }

    #[test]
    fn div_clobbers_rax_and_rdx() {
        let t = SystemV { os: Os::Linux };
        let insn = Insn::new(
            Opcode::Div,
            Type::I64,
            vec![
                crate::ir::Param::Reg(crate::ir::Register::local(0)),
                crate::ir::Param::Reg(crate::ir::Register::local(1)),
                crate::ir::Param::Reg(crate::ir::Register::local(2)),
            ],
        );
        let clobbers = t.clobbers(&insn);
        assert!(clobbers.contains(&RAX));
        assert!(clobbers.contains(&RDX));
    }
}
