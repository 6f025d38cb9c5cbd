//! SysV x86_64 stubs.
//!
//! Framed stub layout:
//!
//! ```text
//!   push rbp
//!   mov  rbp, rsp
//!   [sub rsp, 8]                    ; keep rsp 16-aligned at the call
//!   push [rbp+16+8*i]  (i = n-1..0) ; re-materialize stack arguments
//!   mov  r11, counter ; lock inc [r11]
//!   mov  r11, target  ; call r11
//!   mov  r11, counter ; lock dec [r11]
//!   mov  rsp, rbp
//!   pop  rbp
//!   ret
//! landing:
//!   mov  r11, counter ; lock dec [r11]
//!   mov  rdi, rax
//!   mov  r11, _Unwind_Resume ; call r11
//!   ud2
//! ```
//!
//! r11 is the only register touched before the call, so every argument
//! register reaches the target unchanged, including the hidden result
//! pointer in rdi.

use gimli::write::CallFrameInstruction as Cfi;
use gimli::X86_64;

use super::relocator::{is_endbr64, X86_64Relocator};
use super::writer::{Reg, X86_64Writer};
use crate::abi::{CallLayout, CallingConvention};
use crate::arch::{check_convention, FrameDescription, FramedStub, StubEmitter, StubImage};
use crate::error::Result;

const PROLOGUE: usize = 4;
const ALIGN_PAD: usize = 7;
const PUSH_SLOT: usize = 6;
const COUNTER_UPDATE: usize = 10 + 4;
const CALL_ABS: usize = 10 + 3;
const EPILOGUE: usize = 3 + 1 + 1;
const LANDING: usize = COUNTER_UPDATE + 3 + CALL_ABS + 2;

pub struct X86_64Emitter;

impl X86_64Emitter {
    fn frame(ret_at: usize, landing: usize) -> FrameDescription {
        let ret_at = ret_at as u32;
        FrameDescription {
            code_alignment: 1,
            data_alignment: -8,
            return_address: X86_64::RA,
            initial: vec![Cfi::Cfa(X86_64::RSP, 8), Cfi::Offset(X86_64::RA, -8)],
            rows: vec![
                (1, Cfi::CfaOffset(16)),
                (1, Cfi::Offset(X86_64::RBP, -16)),
                (4, Cfi::CfaRegister(X86_64::RBP)),
                (ret_at, Cfi::RememberState),
                (ret_at, Cfi::Cfa(X86_64::RSP, 8)),
                (ret_at, Cfi::Restore(X86_64::RBP)),
                (landing as u32, Cfi::RestoreState),
            ],
        }
    }
}

impl StubEmitter for X86_64Emitter {
    const CONVENTION: CallingConvention = CallingConvention::SysV64;
    const TAIL_SIZE: usize = 16;
    const MAX_PATCH_SIZE: usize = 16;
    const INSN_OVERHANG: usize = 14;

    fn framed_size(layout: &CallLayout) -> usize {
        let slots = layout.stack_slots();
        let pad = if slots % 2 == 1 { ALIGN_PAD } else { 0 };
        PROLOGUE + pad + PUSH_SLOT * slots + 2 * COUNTER_UPDATE + CALL_ABS + EPILOGUE + LANDING
    }

    fn emit_framed(buf: &mut [u8], pc: u64, stub: &FramedStub) -> Result<StubImage> {
        check_convention::<Self>(stub.layout)?;
        let slots = stub.layout.stack_slots();
        let mut w = X86_64Writer::new(buf, pc);

        w.put_push_reg(Reg::RBP);
        w.put_mov_reg_reg(Reg::RBP, Reg::RSP);
        if slots % 2 == 1 {
            w.put_sub_reg_imm32(Reg::RSP, 8);
        }
        for i in (0..slots).rev() {
            w.put_push_mem(Reg::RBP, 16 + 8 * i as i32);
        }

        w.put_mov_reg_imm64(Reg::R11, stub.counter);
        w.put_lock_inc_mem(Reg::R11);
        w.put_mov_reg_imm64(Reg::R11, stub.target);
        let call_start = w.offset();
        w.put_call_reg(Reg::R11);
        let call_end = w.offset();

        w.put_mov_reg_imm64(Reg::R11, stub.counter);
        w.put_lock_dec_mem(Reg::R11);
        w.put_mov_reg_reg(Reg::RSP, Reg::RBP);
        w.put_pop_reg(Reg::RBP);
        let ret_at = w.offset();
        w.put_ret();

        // Entered by the unwinder with rsp as it was at the call and the
        // exception object in rax.
        let landing = w.offset();
        w.put_mov_reg_imm64(Reg::R11, stub.counter);
        w.put_lock_dec_mem(Reg::R11);
        w.put_mov_reg_reg(Reg::RDI, Reg::RAX);
        w.put_mov_reg_imm64(Reg::R11, stub.resume);
        w.put_call_reg(Reg::R11);
        w.put_ud2();

        let len = w.finish()?;
        Ok(StubImage { len, call_start, call_end, landing, frame: Self::frame(ret_at, landing) })
    }

    fn emit_tail(buf: &mut [u8], pc: u64, target: u64) -> Result<usize> {
        let mut w = X86_64Writer::new(buf, pc);
        w.put_jmp_far(target);
        w.finish()
    }

    fn entry_skip(code: &[u8]) -> usize {
        if is_endbr64(code) {
            4
        } else {
            0
        }
    }

    fn patch_size(at: u64, to: u64) -> usize {
        if X86_64Writer::near_reachable(at, to) {
            5
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
        let mut w = X86_64Writer::new(buf, pc);
        let consumed = X86_64Relocator::new(code, code_pc).relocate_bytes(&mut w, min_bytes)?;
        w.put_jmp_address(code_pc + consumed as u64);
        Ok((w.finish()?, consumed))
    }

    fn entry_patch(at: u64, to: u64, len: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; len];
        let mut w = X86_64Writer::new(&mut bytes, at);
        w.put_jmp_address(to);
        w.put_nop_n(len.saturating_sub(w.offset()));
        w.finish()?;
        Ok(bytes)
    }
}
