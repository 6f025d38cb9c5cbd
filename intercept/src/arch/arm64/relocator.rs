//! Prologue relocation for AArch64.
//!
//! Instructions are fixed width, so relocation works on whole words. Every
//! PC-relative form is rewritten into an absolute one through a scratch
//! register (x16 unless the window itself uses it).

use crate::arch::arm64::writer::{Arm64Writer, Reg};
use crate::error::{DetourError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsnKind {
    Plain,
    B,
    Call,
    BCond,
    CbzCbnz,
    TbzTbnz,
    Adr,
    Adrp,
    /// PC-relative load; `load` is the matching `[xN, #0]` form.
    Literal { load: u32, gpr: bool },
}

fn insn_kind(insn: u32) -> InsnKind {
    match insn & 0xFC00_0000 {
        0x1400_0000 => return InsnKind::B,
        0x9400_0000 => return InsnKind::Call,
        _ => {}
    }
    // blr xN
    if insn & 0xFFFF_FC1F == 0xD63F_0000 {
        return InsnKind::Call;
    }
    if insn & 0xFF00_0010 == 0x5400_0000 {
        return InsnKind::BCond;
    }
    match insn & 0x7F00_0000 {
        0x3400_0000 | 0x3500_0000 => return InsnKind::CbzCbnz,
        0x3600_0000 | 0x3700_0000 => return InsnKind::TbzTbnz,
        _ => {}
    }
    match insn & 0x9F00_0000 {
        0x1000_0000 => return InsnKind::Adr,
        0x9000_0000 => return InsnKind::Adrp,
        _ => {}
    }
    match insn & 0xFF00_0000 {
        0x5800_0000 => InsnKind::Literal { load: 0xF940_0000, gpr: true },
        0x1800_0000 => InsnKind::Literal { load: 0xB940_0000, gpr: true },
        0x9800_0000 => InsnKind::Literal { load: 0xB980_0000, gpr: true },
        0x5C00_0000 => InsnKind::Literal { load: 0xFD40_0000, gpr: false },
        0x1C00_0000 => InsnKind::Literal { load: 0xBD40_0000, gpr: false },
        0x9C00_0000 => InsnKind::Literal { load: 0x3DC0_0000, gpr: false },
        _ => InsnKind::Plain,
    }
}

fn sign_extend(value: i64, bits: u32) -> i64 {
    let shift = 64 - bits;
    (value << shift) >> shift
}

fn imm26(insn: u32) -> i64 {
    sign_extend((insn & 0x03FF_FFFF) as i64, 26) << 2
}

fn imm19(insn: u32) -> i64 {
    sign_extend(((insn >> 5) & 0x7FFFF) as i64, 19) << 2
}

fn imm14(insn: u32) -> i64 {
    sign_extend(((insn >> 5) & 0x3FFF) as i64, 14) << 2
}

fn adr_imm21(insn: u32) -> i64 {
    let lo = ((insn >> 29) & 0x3) as i64;
    let hi = ((insn >> 5) & 0x7FFFF) as i64;
    sign_extend((hi << 2) | lo, 21)
}

fn offset_from(pc: u64, delta: i64) -> u64 {
    (pc as i64).wrapping_add(delta) as u64
}

/// Bytes `relocate_n` emits for one instruction.
fn emitted_size(kind: InsnKind) -> usize {
    match kind {
        InsnKind::Plain => 4,
        InsnKind::B | InsnKind::Adr | InsnKind::Adrp | InsnKind::Call => 16,
        InsnKind::BCond | InsnKind::CbzCbnz | InsnKind::TbzTbnz | InsnKind::Literal { .. } => 20,
    }
}

/// Bits 0-4, 5-9, 10-14 and 16-20 may name a register. Immediate fields
/// occasionally look like x16/x17 too, which only costs a scratch choice.
fn mentions(insn: u32, reg: u32) -> bool {
    [insn & 0x1f, (insn >> 5) & 0x1f, (insn >> 10) & 0x1f, (insn >> 16) & 0x1f].contains(&reg)
}

/// BTI landing pad (`bti`, `bti c`, `bti j`, `bti jc`).
pub fn is_bti(insn: u32) -> bool {
    insn & 0xFFFF_FF3F == 0xD503_241F
}

/// How many of `insns` can be moved, and the scratch register to use.
///
/// Stops before the first BL or BLR: a relocated call would return into a
/// trampoline no unwind table describes.
pub fn can_relocate(insns: &[u32]) -> (usize, Reg) {
    let limit = insns
        .iter()
        .position(|&i| insn_kind(i) == InsnKind::Call)
        .unwrap_or(insns.len());
    (limit, scratch_for(&insns[..limit]))
}

fn scratch_for(insns: &[u32]) -> Reg {
    if !insns.iter().any(|&i| mentions(i, 16)) {
        Reg::X16
    } else if !insns.iter().any(|&i| mentions(i, 17)) {
        Reg::X17
    } else {
        Reg::X16
    }
}

pub struct Arm64Relocator<'a> {
    input: &'a [u32],
    input_pc: u64,
    scratch: Reg,
}

impl<'a> Arm64Relocator<'a> {
    pub fn new(input: &'a [u32], input_pc: u64) -> Self {
        Self { input, input_pc, scratch: scratch_for(input) }
    }

    /// Register free for the jump back to the original code.
    pub fn scratch(&self) -> Reg {
        self.scratch
    }

    fn fail(&self, index: usize, reason: &'static str) -> DetourError {
        DetourError::RelocationFailed { address: (self.input_pc as usize).wrapping_add(index * 4), reason }
    }

    /// Relocate the first `count` instructions.
    pub fn relocate_n(&mut self, w: &mut Arm64Writer, count: usize) -> Result<()> {
        let window = self
            .input
            .get(..count)
            .ok_or_else(|| self.fail(self.input.len(), "prologue shorter than patch"))?;
        let start = self.input_pc;
        let end = start + 4 * count as u64;

        // Branches into the window must land on the relocated copy.
        let mut dst_pcs = Vec::with_capacity(count);
        let mut cursor = w.pc();
        for &insn in window {
            dst_pcs.push(cursor);
            cursor = cursor.wrapping_add(emitted_size(insn_kind(insn)) as u64);
        }
        let map = |target: u64| -> u64 {
            if (start..end).contains(&target) {
                dst_pcs[((target - start) / 4) as usize]
            } else {
                target
            }
        };

        let scratch = self.scratch;
        for (i, &insn) in window.iter().enumerate() {
            let pc = start + 4 * i as u64;
            match insn_kind(insn) {
                InsnKind::Plain => w.put_u32_raw(insn),
                InsnKind::Call => return Err(self.fail(i, "call in patched prologue")),
                InsnKind::Adr => {
                    w.put_ldr_reg_address(Reg::from_field(insn), offset_from(pc, adr_imm21(insn)));
                }
                InsnKind::Adrp => {
                    let page = offset_from(pc & !0xFFF, adr_imm21(insn) << 12);
                    w.put_ldr_reg_address(Reg::from_field(insn), page);
                }
                InsnKind::Literal { load, gpr } => {
                    let rt = insn & 0x1f;
                    let base = if gpr && rt == scratch as u32 {
                        if scratch == Reg::X16 {
                            Reg::X17
                        } else {
                            Reg::X16
                        }
                    } else {
                        scratch
                    };
                    w.put_ldr_reg_address(base, offset_from(pc, imm19(insn)));
                    w.put_u32_raw(load | ((base as u32) << 5) | rt);
                }
                InsnKind::B => w.put_ldr_br_address(scratch, map(offset_from(pc, imm26(insn)))),
                InsnKind::BCond => {
                    let target = map(offset_from(pc, imm19(insn)));
                    let cond = insn & 0xf;
                    if cond >= 0xe {
                        // b.al / b.nv: no inverse exists, keep the size.
                        w.put_nop();
                    } else {
                        // b.<!cond> over the 16-byte long branch
                        w.put_u32_raw(0x5400_0000 | (5 << 5) | (cond ^ 1));
                    }
                    w.put_ldr_br_address(scratch, target);
                }
                InsnKind::CbzCbnz => {
                    let target = map(offset_from(pc, imm19(insn)));
                    w.put_u32_raw(((insn ^ (1 << 24)) & !0x00FF_FFE0) | (5 << 5));
                    w.put_ldr_br_address(scratch, target);
                }
                InsnKind::TbzTbnz => {
                    let target = map(offset_from(pc, imm14(insn)));
                    w.put_u32_raw(((insn ^ (1 << 24)) & !0x0007_FFE0) | (5 << 5));
                    w.put_ldr_br_address(scratch, target);
                }
            }
        }
        Ok(())
    }
}
