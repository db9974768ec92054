//! Register allocation: turns the liveness analysis's per-instruction
//! bitsets and generation numbers into concrete [`Location`]s (physical
//! register or stack slot) for every virtual-register assignment inside a
//! function.

use crate::common::{Kind, Set};
use crate::ir::param::Register;
use crate::ir::{Insn, Type};
use crate::liveness::{self, Function, Liveness};
use crate::target::{Location, PhysReg, Target};
use log::{debug, trace};

/// The lifetime of one virtual-register *assignment*: a register id paired
/// with a generation number, since liveness splits a reused id into
/// independent ranges whenever it's redefined. A range's `intervals` can
/// hold more than one `(first, last)` pair because liveness through
/// branches can leave holes in an otherwise-contiguous program-order span.
#[derive(Clone, Debug)]
pub struct LiveRange {
    pub register: Register,
    pub generation: usize,
    pub ty: Type,
    pub intervals: Vec<(usize, usize)>,
    pub loc: Location,
    pub hint: Option<PhysReg>,
    pub param_idx: Option<usize>,
    /// Physical registers this range may not use: accumulated from the
    /// target's clobber set at any instruction the range is live across.
    pub illegal: Set<PhysReg>,
}

impl LiveRange {
    pub fn first(&self) -> usize {
        self.intervals.iter().map(|(a, _)| *a).min().unwrap()
    }

    pub fn last(&self) -> usize {
        self.intervals.iter().map(|(_, b)| *b).max().unwrap()
    }

    pub fn covers(&self, i: usize) -> bool {
        self.intervals.iter().any(|&(a, b)| a <= i && i <= b)
    }

    /// Whether this range ends exactly at instruction `i` (its last
    /// interval's upper bound is `i`), used by the allocator's release
    /// step.
    pub fn ends_at(&self, i: usize) -> bool {
        self.intervals.iter().any(|&(_, b)| b == i) && !self.intervals.iter().any(|&(a, b)| a <= i && i < b)
    }
}

/// Build one [`LiveRange`] per `(register, generation)` pair live anywhere
/// in `func`, grouping the instruction indices that share a generation
/// into maximal contiguous runs.
pub fn build_live_ranges(insns: &[Insn], func: &Function, live: &Liveness, generations: &crate::common::Map<(usize, usize), usize>) -> Vec<LiveRange> {
    use crate::common::Map;

    // (reg_idx, generation) -> sorted instruction indices where live.
    let mut members: Map<(usize, usize), Vec<usize>> = Map::new();
    for i in func.span() {
        for r in live.live_in(i).iter().chain(live.live_out(i).iter()) {
            if let Some(&gen) = generations.get(&(i, r)) {
                members.entry((r, gen)).or_default().push(i);
            }
        }
    }

    let mut ranges = Vec::new();
    for ((r_idx, gen), mut instrs) in members {
        instrs.sort_unstable();
        instrs.dedup();
        let mut intervals = Vec::new();
        let mut start = instrs[0];
        let mut prev = instrs[0];
        for &i in &instrs[1..] {
            if i > prev + 1 {
                intervals.push((start, prev));
                start = i;
            }
            prev = i;
        }
        intervals.push((start, prev));

        let register = live.regs.register(r_idx);
        let ty = instrs
            .iter()
            .find_map(|&i| {
                if insns[i].defined_register() == Some(register) {
                    Some(insns[i].ty)
                } else {
                    insns[i]
                        .used_registers()
                        .contains(&register)
                        .then_some(insns[i].ty)
                }
            })
            .unwrap_or(Type::I64);

        ranges.push(LiveRange {
            register,
            generation: gen,
            ty,
            intervals,
            loc: Location::None,
            hint: None,
            param_idx: None,
            illegal: Set::new(),
        });
    }
    ranges.sort_by_key(|r| r.first());
    ranges
}

/// A per-kind bitset of which physical registers are currently free,
/// indexed by the register's encoding (0..16 for GPRs, 0..16 for XMM).
struct FreePool {
    free: u32,
}

impl FreePool {
    fn new(candidates: &[PhysReg]) -> FreePool {
        let mut free = 0u32;
        for &r in candidates {
            free |= 1 << r;
        }
        FreePool { free }
    }

    fn take(&mut self, candidates: &[PhysReg], prefer: Option<PhysReg>, illegal: &Set<PhysReg>) -> Option<PhysReg> {
        if let Some(p) = prefer {
            if self.free & (1 << p) != 0 && !illegal.contains(&p) {
                self.free &= !(1 << p);
                return Some(p);
            }
        }
        for &r in candidates {
            if self.free & (1 << r) != 0 && !illegal.contains(&r) {
                self.free &= !(1 << r);
                return Some(r);
            }
        }
        None
    }

    fn release(&mut self, r: PhysReg) {
        self.free |= 1 << r;
    }

    fn is_free(&self, r: PhysReg) -> bool {
        self.free & (1 << r) != 0
    }
}

/// The outcome of allocating one function: every live range with its
/// final [`Location`], and the total bytes of stack space its spills
/// consumed (used to size the prologue's `sub rsp, N`).
pub struct Allocation {
    pub ranges: Vec<LiveRange>,
    pub stack_bytes: u64,
}

/// Run the linear allocation pass described in the register-allocator
/// design: a left-to-right scan over the function's instructions applying
/// clobber handling, releases, and starts, maintaining one [`FreePool`]
/// per register kind class (integer/pointer vs. floating point).
pub fn allocate(
    insns: &[Insn],
    func: &Function,
    live: &Liveness,
    generations: &crate::common::Map<(usize, usize), usize>,
    target: &dyn Target,
    param_types: &[Kind],
) -> Allocation {
    let mut ranges = build_live_ranges(insns, func, live, generations);

    let param_locations = target.place_parameters(param_types);
    let mut param_order = 0usize;
    for i in func.span() {
        if insns[i].opcode == crate::ir::Opcode::Param {
            if let Some(reg) = insns[i].params[0].as_register() {
                if let Some(range) = ranges.iter_mut().find(|r| r.register == reg && r.covers(i)) {
                    range.param_idx = Some(param_order);
                    if let Some(loc) = param_locations.get(param_order) {
                        range.loc = *loc;
                        if let Location::Register(p) = loc {
                            range.hint = Some(*p);
                        }
                    }
                }
            }
            param_order += 1;
        }
    }

    let mut int_pool = FreePool::new(target.registers(Kind::I64));
    let mut float_pool = FreePool::new(target.registers(Kind::F64));
    let mut stack_bytes: u64 = 0;

    for i in func.span() {
        // 1. Clobber: any range live across this instruction whose
        // physical register the target invalidates gets reassigned (or
        // spilled), unless the range itself dies here.
        let clobbered = target.clobbers(&insns[i]);
        if !clobbered.is_empty() {
            for idx in 0..ranges.len() {
                let (covers, reg_loc, kind) = {
                    let r = &ranges[idx];
                    (r.covers(i), r.loc, r.ty.kind)
                };
                if !covers {
                    continue;
                }
                if let Location::Register(p) = reg_loc {
                    if clobbered.contains(&p) {
                        ranges[idx].illegal.extend(clobbered.iter().copied());
                        if ranges[idx].ends_at(i) {
                            continue;
                        }
                        let pool = if kind.is_float() { &mut float_pool } else { &mut int_pool };
                        pool.release(p);
                        let candidates = target.registers(kind);
                        let illegal = ranges[idx].illegal.clone();
                        if let Some(new_reg) = pool.take(candidates, None, &illegal) {
                            ranges[idx].loc = Location::Register(new_reg);
                        } else {
                            stack_bytes += kind.size().unwrap_or(8);
                            ranges[idx].loc = Location::StackSlot(-(stack_bytes as i64));
                        }
                    }
                }
            }
        }

        // 2. Release: ranges ending here give back their register.
        for r in &ranges {
            if r.ends_at(i) {
                if let Location::Register(p) = r.loc {
                    let pool = if r.ty.kind.is_float() { &mut float_pool } else { &mut int_pool };
                    pool.release(p);
                }
            }
        }

        // 3. Start: ranges beginning here get a location, unless a
        // parameter already placed them.
        for idx in 0..ranges.len() {
            if ranges[idx].first() != i || ranges[idx].loc != Location::None {
                continue;
            }
            if ranges[idx].hint.is_none() && insns[i].defined_register() == Some(ranges[idx].register) {
                ranges[idx].hint = target.hint(&insns[i]).first().copied().flatten();
            }
            let kind = ranges[idx].ty.kind;
            let candidates = target.registers(kind);
            let pool = if kind.is_float() { &mut float_pool } else { &mut int_pool };
            let hint = ranges[idx].hint.filter(|h| pool.is_free(*h));
            let illegal = ranges[idx].illegal.clone();
            if let Some(p) = pool.take(candidates, hint, &illegal) {
                trace!("instr {i}: {} -> register {p}", ranges[idx].register);
                ranges[idx].loc = Location::Register(p);
            } else {
                stack_bytes += kind.size().unwrap_or(8);
                ranges[idx].loc = Location::StackSlot(-(stack_bytes as i64));
                trace!("instr {i}: {} -> stack slot {}", ranges[idx].register, -(stack_bytes as i64));
            }
        }
    }

    debug!(
        "allocated function [{}, {}]: {} range(s), {} byte(s) spilled",
        func.start,
        func.end,
        ranges.len(),
        stack_bytes
    );

    Allocation { ranges, stack_bytes }
}

/// Find the [`LiveRange`] covering `register` at instruction `i`. Panics
/// if none does — per the data model's invariant, every virtual register
/// referenced inside a function has exactly one covering range after
/// allocation; violating this is an internal-invariant bug, not a
/// reportable error.
pub fn range_at<'a>(ranges: &'a [LiveRange], register: Register, i: usize) -> &'a LiveRange {
    ranges
        .iter()
        .find(|r| r.register == register && r.covers(i))
        .unwrap_or_else(|| panic!("internal error: no live range covers {register} at instruction {i}"))
}

pub fn find_functions(insns: &[Insn]) -> Vec<Function> {
    liveness::find_functions(insns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Opcode, Param, Register};
    use crate::target::{Os, SystemV};

    fn reg(id: u64) -> Param {
        Param::Reg(Register::local(id))
    }

    #[test]
    fn straight_line_gets_distinct_registers() {
        let insns = vec![
            Insn::new(Opcode::Frame, Type::I64, vec![]),
            Insn::new(Opcode::Mov, Type::I64, vec![reg(0), Param::Imm(1)]),
            Insn::new(Opcode::Mov, Type::I64, vec![reg(1), Param::Imm(2)]),
            Insn::new(Opcode::Add, Type::I64, vec![reg(2), reg(0), reg(1)]),
            Insn::new(Opcode::Ret, Type::I64, vec![reg(2)]),
        ];
        let func = liveness::find_functions(&insns)[0];
        let live = liveness::compute_liveness(&insns, &func);
        let gens = liveness::assign_generations(&insns, &func, &live);
        let target = SystemV { os: Os::Linux };
        let alloc = allocate(&insns, &func, &live, &gens, &target, &[]);

        let r0 = range_at(&alloc.ranges, Register::local(0), 1).loc;
        let r1 = range_at(&alloc.ranges, Register::local(1), 2).loc;
        assert_ne!(r0, Location::None);
        assert_ne!(r1, Location::None);
        assert_ne!(r0, r1);
    }

    #[test]
    fn div_destination_is_hinted_to_rax() {
        let insns = vec![
            Insn::new(Opcode::Frame, Type::I64, vec![]),
            Insn::new(Opcode::Mov, Type::I64, vec![reg(0), Param::Imm(10)]),
            Insn::new(Opcode::Mov, Type::I64, vec![reg(1), Param::Imm(2)]),
            Insn::new(Opcode::Div, Type::I64, vec![reg(2), reg(0), reg(1)]),
            Insn::new(Opcode::Ret, Type::I64, vec![reg(2)]),
        ];
        let func = liveness::find_functions(&insns)[0];
        let live = liveness::compute_liveness(&insns, &func);
        let gens = liveness::assign_generations(&insns, &func, &live);
        let target = SystemV { os: Os::Linux };
        let alloc = allocate(&insns, &func, &live, &gens, &target, &[]);
        let r2 = range_at(&alloc.ranges, Register::local(2), 3).loc;
        assert_eq!(r2, Location::Register(crate::target::RAX));
    }

    #[test]
    fn survivor_across_div_avoids_both_clobbered_registers() {
        let insns = vec![
            Insn::new(Opcode::Frame, Type::I64, vec![]),
            Insn::new(Opcode::Mov, Type::I64, vec![reg(0), Param::Imm(100)]),
            Insn::new(Opcode::Mov, Type::I64, vec![reg(1), Param::Imm(7)]),
            Insn::new(Opcode::Div, Type::I64, vec![reg(2), reg(1), Param::Imm(3)]),
            Insn::new(Opcode::Add, Type::I64, vec![reg(3), reg(2), reg(0)]),
            Insn::new(Opcode::Ret, Type::I64, vec![reg(3)]),
        ];
        let func = liveness::find_functions(&insns)[0];
        let live = liveness::compute_liveness(&insns, &func);
        let gens = liveness::assign_generations(&insns, &func, &live);
        let target = SystemV { os: Os::Linux };
        let alloc = allocate(&insns, &func, &live, &gens, &target, &[]);

        // %0 is live across the `div`, which clobbers both RAX and RDX;
        // it must not land in either, even if one of them happens to be
        // free in the pool at that instruction.
        let r0_at_div = range_at(&alloc.ranges, Register::local(0), 3).loc;
        assert_ne!(r0_at_div, Location::Register(crate::target::RAX));
        assert_ne!(r0_at_div, Location::Register(crate::target::RDX));
    }
}
