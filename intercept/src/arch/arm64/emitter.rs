//! AArch64 stubs.
//!
//! Framed stub layout:
//!
//! ```text
//!   stp  x29, x30, [sp, #-16]!
//!   mov  x29, sp
//!   [sub sp, sp, #area]            ; stack arguments, 16-byte aligned
//!   [ldr x9, [x29, #16+8j]; str x9, [sp, #8j]]
//!   <atomic add 1 to counter>      ; x9-x11
//!   mov  x16, target
//!   blr  x16
//!   <atomic add -1 to counter>
//!   mov  sp, x29
//!   ldp  x29, x30, [sp], #16
//!   ret
//! landing:
//!   <atomic add -1 to counter>     ; x0 holds the exception object
//!   mov  x16, _Unwind_Resume
//!   blr  x16
//!   brk  #0
//! ```
//!
//! x0-x8 are never touched on the way in, so register arguments and the
//! indirect result pointer pass straight through.

use gimli::write::CallFrameInstruction as Cfi;
use gimli::AArch64;

use super::relocator::{can_relocate, is_bti, Arm64Relocator};
use super::writer::{Arm64Writer, Reg};
use crate::abi::{align_up, CallLayout, CallingConvention};
use crate::arch::{check_convention, FrameDescription, FramedStub, StubEmitter, StubImage};
use crate::error::{DetourError, Result};

const FIXED_SIZE: usize = 160;
const COPY_SLOT: usize = 8;

pub struct Arm64Emitter;

impl Arm64Emitter {
    fn put_counter_update(w: &mut Arm64Writer, counter: u64, increment: bool) {
        w.put_mov_reg_u64(Reg::X9, counter);
        let top = w.pc();
        w.put_ldaxr(Reg::X10, Reg::X9);
        if increment {
            w.put_add_reg_reg_imm(Reg::X10, Reg::X10, 1);
        } else {
            w.put_sub_reg_reg_imm(Reg::X10, Reg::X10, 1);
        }
        w.put_stlxr(Reg::X11, Reg::X10, Reg::X9);
        w.put_cbnz_w(Reg::X11, top);
    }

    fn frame(ret_at: usize, landing: usize) -> FrameDescription {
        let ret_at = ret_at as u32;
        FrameDescription {
            code_alignment: 4,
            data_alignment: -8,
            return_address: AArch64::X30,
            initial: vec![Cfi::Cfa(AArch64::SP, 0)],
            rows: vec![
                (4, Cfi::CfaOffset(16)),
                (4, Cfi::Offset(AArch64::X29, -16)),
                (4, Cfi::Offset(AArch64::X30, -8)),
                (8, Cfi::CfaRegister(AArch64::X29)),
                (ret_at, Cfi::RememberState),
                (ret_at, Cfi::Cfa(AArch64::SP, 0)),
                (ret_at, Cfi::Restore(AArch64::X29)),
                (ret_at, Cfi::Restore(AArch64::X30)),
                (landing as u32, Cfi::RestoreState),
            ],
        }
    }

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

impl StubEmitter for Arm64Emitter {
    const CONVENTION: CallingConvention = CallingConvention::Aapcs64 {
        darwin: cfg!(target_vendor = "apple"),
    };
    const TAIL_SIZE: usize = 16;
    const MAX_PATCH_SIZE: usize = 16;
    const INSN_OVERHANG: usize = 0;

    fn framed_size(layout: &CallLayout) -> usize {
        match layout.stack_slots() {
            0 => FIXED_SIZE,
            n => FIXED_SIZE + 4 + COPY_SLOT * n,
        }
    }

    fn emit_framed(buf: &mut [u8], pc: u64, stub: &FramedStub) -> Result<StubImage> {
        check_convention::<Self>(stub.layout)?;
        let slots = stub.layout.stack_slots();
        let mut w = Arm64Writer::new(buf, pc);

        w.put_push_reg_reg(Reg::X29, Reg::X30);
        w.put_mov_reg_reg(Reg::X29, Reg::SP);
        if slots > 0 {
            w.put_sub_reg_reg_imm(Reg::SP, Reg::SP, align_up(slots * 8, 16) as u32);
            for j in 0..slots as u32 {
                w.put_ldr_reg_reg_offset(Reg::X9, Reg::X29, 16 + 8 * j);
                w.put_str_reg_reg_offset(Reg::X9, Reg::SP, 8 * j);
            }
        }

        Self::put_counter_update(&mut w, stub.counter, true);
        w.put_mov_reg_u64(Reg::X16, stub.target);
        let call_start = w.offset();
        w.put_blr_reg(Reg::X16);
        let call_end = w.offset();

        Self::put_counter_update(&mut w, stub.counter, false);
        w.put_mov_reg_reg(Reg::SP, Reg::X29);
        w.put_pop_reg_reg(Reg::X29, Reg::X30);
        let ret_at = w.offset();
        w.put_ret();

        let landing = w.offset();
        Self::put_counter_update(&mut w, stub.counter, false);
        w.put_mov_reg_u64(Reg::X16, stub.resume);
        w.put_blr_reg(Reg::X16);
        w.put_brk(0);

        let len = w.finish()?;
        Ok(StubImage { len, call_start, call_end, landing, frame: Self::frame(ret_at, landing) })
    }

    fn emit_tail(buf: &mut [u8], pc: u64, target: u64) -> Result<usize> {
        let mut w = Arm64Writer::new(buf, pc);
        w.put_ldr_br_address(Reg::X16, target);
        w.finish()
    }

    fn entry_skip(code: &[u8]) -> usize {
        match Self::words(code).first() {
            Some(&insn) if is_bti(insn) => 4,
            _ => 0,
        }
    }

    fn patch_size(at: u64, to: u64) -> usize {
        if Arm64Writer::adrp_reachable(at, to) {
            12
        } else {
            16
        }
    }

    fn emit_original(
        buf: &mut [u8],
        pc: u64,
        code: &[u8],
        code_pc: u64,
        min_bytes: usize,
    ) -> Result<(usize, usize)> {
        let count = align_up(min_bytes, 4) / 4;
        let words = Self::words(code);
        let (limit, _) = can_relocate(&words);
        if limit < count {
            return Err(DetourError::RelocationFailed {
                address: code_pc as usize + 4 * limit,
                reason: if limit < words.len() {
                    "call in patched prologue"
                } else {
                    "prologue shorter than patch"
                },
            });
        }

        let mut w = Arm64Writer::new(buf, pc);
        let mut relocator = Arm64Relocator::new(&words[..count], code_pc);
        relocator.relocate_n(&mut w, count)?;
        let consumed = 4 * count;
        w.put_ldr_br_address(relocator.scratch(), code_pc + consumed as u64);
        Ok((w.finish()?, consumed))
    }

    fn entry_patch(at: u64, to: u64, len: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; len];
        let mut w = Arm64Writer::new(&mut bytes, at);
        if Arm64Writer::adrp_reachable(at, to) {
            w.put_adrp_add_br(Reg::X16, to);
        } else {
            w.put_ldr_br_address(Reg::X16, to);
        }
        while w.offset() + 4 <= len {
            w.put_nop();
        }
        w.finish()?;
        Ok(bytes)
    }
}
