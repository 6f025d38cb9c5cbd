//! Prologue relocation for x86_64.
//!
//! Only what a function entry realistically contains is understood: legacy
//! and REX prefixes, one- and two-byte opcodes with ModRM/SIB, immediates,
//! RIP-relative operands and relative branches.

use crate::arch::x86_64::writer::{Reg, X86_64Writer};
use crate::error::{DetourError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsnKind {
    Plain,
    RipRelative { disp_at: usize },
    Jmp { rel: i64 },
    Jcc { cc: u8, rel: i64 },
    Call { rel: i64 },
    Ret,
    Trap,
}

#[derive(Debug, Clone, Copy)]
struct Insn {
    len: usize,
    kind: InsnKind,
}

fn one_byte_has_modrm(op: u8) -> bool {
    matches!(
        op,
        0x00..=0x03
            | 0x08..=0x0B
            | 0x10..=0x13
            | 0x18..=0x1B
            | 0x20..=0x23
            | 0x28..=0x2B
            | 0x30..=0x33
            | 0x38..=0x3B
            | 0x62..=0x63
            | 0x69
            | 0x6B
            | 0x80..=0x8F
            | 0xC0..=0xC1
            | 0xC4..=0xC7
            | 0xD0..=0xD3
            | 0xD8..=0xDF
            | 0xF6..=0xF7
            | 0xFE..=0xFF
    )
}

fn one_byte_imm_size(op: u8, opsize16: bool, rexw: bool) -> usize {
    let imm_z = if opsize16 { 2 } else { 4 };
    match op {
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => 1,
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => imm_z,
        0x68 | 0x69 | 0x81 | 0xA9 | 0xC7 => imm_z,
        0x6A | 0x6B | 0x80 | 0x82 | 0x83 | 0xA8 | 0xC0 | 0xC1 | 0xC6 | 0xCD => 1,
        0xA0..=0xA3 => {
            if rexw {
                8
            } else {
                4
            }
        }
        0xB0..=0xB7 => 1,
        0xB8..=0xBF => {
            if rexw {
                8
            } else {
                imm_z
            }
        }
        0xC8 => 3,
        0xE0..=0xE7 => 1,
        _ => 0,
    }
}

fn two_byte_has_modrm(op: u8) -> bool {
    !matches!(
        op,
        0x05..=0x09 | 0x0B | 0x0E | 0x30..=0x37 | 0x77 | 0x80..=0x8F | 0xA0..=0xA1 | 0xA8..=0xA9
    )
}

fn two_byte_imm_size(op: u8) -> usize {
    match op {
        0x70..=0x73 | 0xA4 | 0xAC | 0xBA | 0xC2 | 0xC4..=0xC6 => 1,
        _ => 0,
    }
}

struct Cursor<'a> {
    code: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> u8 {
        self.code.get(self.pos).copied().unwrap_or(0)
    }

    fn byte(&mut self) -> u8 {
        let b = self.peek();
        self.pos += 1;
        b
    }

    fn rel8(&mut self) -> i64 {
        self.byte() as i8 as i64
    }

    fn rel32(&mut self) -> i64 {
        let mut raw = [0u8; 4];
        for b in &mut raw {
            *b = self.byte();
        }
        i32::from_le_bytes(raw) as i64
    }

    /// Skip ModRM, SIB and displacement; returns where a RIP disp32 starts.
    fn modrm(&mut self) -> (u8, Option<usize>) {
        let modrm = self.byte();
        let mode = modrm >> 6;
        let rm = modrm & 7;
        if mode == 0 && rm == 5 {
            let at = self.pos;
            self.pos += 4;
            return (modrm, Some(at));
        }
        if mode != 3 && rm == 4 {
            let sib = self.byte();
            if mode == 0 && sib & 7 == 5 {
                self.pos += 4;
            }
        }
        match mode {
            1 => self.pos += 1,
            2 => self.pos += 4,
            _ => {}
        }
        (modrm, None)
    }
}

/// Decode the instruction at the start of `code`.
fn decode_insn(code: &[u8]) -> Result<Insn> {
    let mut c = Cursor { code, pos: 0 };

    let mut opsize16 = false;
    loop {
        match c.peek() {
            0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0x67 | 0xF0 | 0xF2 | 0xF3 => c.pos += 1,
            0x66 => {
                opsize16 = true;
                c.pos += 1;
            }
            _ => break,
        }
    }

    let mut rexw = false;
    if c.peek() & 0xF0 == 0x40 {
        rexw = c.byte() & 0x08 != 0;
    }

    let op = c.byte();
    let kind = match op {
        0xC3 => InsnKind::Ret,
        0xC2 => {
            c.pos += 2;
            InsnKind::Ret
        }
        0xCC | 0xF4 => InsnKind::Trap,
        0xEB => InsnKind::Jmp { rel: c.rel8() },
        0xE9 => InsnKind::Jmp { rel: c.rel32() },
        0xE8 => InsnKind::Call { rel: c.rel32() },
        0x70..=0x7F => InsnKind::Jcc { cc: op & 0x0F, rel: c.rel8() },
        0x0F => {
            let op2 = c.byte();
            match op2 {
                0x0B => InsnKind::Trap,
                0x80..=0x8F => InsnKind::Jcc { cc: op2 & 0x0F, rel: c.rel32() },
                _ => {
                    let disp = if two_byte_has_modrm(op2) { c.modrm().1 } else { None };
                    c.pos += two_byte_imm_size(op2);
                    disp.map_or(InsnKind::Plain, |disp_at| InsnKind::RipRelative { disp_at })
                }
            }
        }
        _ if one_byte_has_modrm(op) => {
            let (modrm, disp) = c.modrm();
            c.pos += match op {
                // TEST r/m, imm is /0 and /1 of group 3
                0xF6 if (modrm >> 3) & 7 <= 1 => 1,
                0xF7 if (modrm >> 3) & 7 <= 1 => {
                    if opsize16 {
                        2
                    } else {
                        4
                    }
                }
                0xF6 | 0xF7 => 0,
                _ => one_byte_imm_size(op, opsize16, rexw),
            };
            disp.map_or(InsnKind::Plain, |disp_at| InsnKind::RipRelative { disp_at })
        }
        _ => {
            c.pos += one_byte_imm_size(op, opsize16, rexw);
            InsnKind::Plain
        }
    };

    if c.pos > code.len() {
        return Err(DetourError::RelocationFailed { address: 0, reason: "truncated instruction" });
    }
    Ok(Insn { len: c.pos, kind })
}

/// ENDBR64 (F3 0F 1E FA).
pub fn is_endbr64(code: &[u8]) -> bool {
    code.starts_with(&[0xF3, 0x0F, 0x1E, 0xFA])
}

/// Copies whole instructions out of a function prologue into a writer,
/// rewriting everything whose meaning depends on where it executes.
pub struct X86_64Relocator<'a> {
    input: &'a [u8],
    input_pc: u64,
}

impl<'a> X86_64Relocator<'a> {
    /// `input` is a copy of the code that lives at `input_pc`.
    pub fn new(input: &'a [u8], input_pc: u64) -> Self {
        Self { input, input_pc }
    }

    fn fail(&self, offset: usize, reason: &'static str) -> DetourError {
        DetourError::RelocationFailed { address: (self.input_pc as usize).wrapping_add(offset), reason }
    }

    /// Relocate at least `min_bytes` worth of instructions. Returns the number
    /// of source bytes consumed, which always ends on an instruction boundary.
    pub fn relocate_bytes(&mut self, w: &mut X86_64Writer, min_bytes: usize) -> Result<usize> {
        let mut off = 0usize;

        while off < min_bytes {
            let src = self.input.get(off..).unwrap_or_default();
            let insn = decode_insn(src).map_err(|_| self.fail(off, "truncated instruction"))?;
            let bytes = &src[..insn.len];
            let src_pc = self.input_pc.wrapping_add(off as u64);
            let next_pc = src_pc.wrapping_add(insn.len as u64);

            match insn.kind {
                InsnKind::Ret | InsnKind::Trap => {
                    return Err(self.fail(off, "function too short to patch"));
                }
                InsnKind::Plain => w.put_bytes(bytes),
                InsnKind::RipRelative { disp_at } => {
                    let mut raw = [0u8; 4];
                    raw.copy_from_slice(&bytes[disp_at..disp_at + 4]);
                    let abs = (next_pc as i64).wrapping_add(i32::from_le_bytes(raw) as i64);
                    let new_disp = abs.wrapping_sub(w.pc() as i64 + insn.len as i64);
                    let new_disp = i32::try_from(new_disp)
                        .map_err(|_| self.fail(off, "rip-relative operand out of reach"))?;
                    let mut patched = bytes.to_vec();
                    patched[disp_at..disp_at + 4].copy_from_slice(&new_disp.to_le_bytes());
                    w.put_bytes(&patched);
                }
                InsnKind::Jmp { rel } => {
                    w.put_jmp_address((next_pc as i64).wrapping_add(rel) as u64);
                }
                InsnKind::Jcc { cc, rel } => {
                    // Inverted condition hops over an absolute jump to the target.
                    w.put_jcc_short(cc ^ 1, 16);
                    w.put_jmp_far((next_pc as i64).wrapping_add(rel) as u64);
                }
                InsnKind::Call { rel: 0 } => {
                    // call $+0: only the pushed return address matters.
                    w.put_mov_reg_imm64(Reg::R11, next_pc);
                    w.put_push_reg(Reg::R11);
                }
                InsnKind::Call { .. } => {
                    // A relocated call would return into the original trampoline,
                    // a frame no unwind table describes.
                    return Err(self.fail(off, "call in patched prologue"));
                }
            }

            off += insn.len;
        }

        Ok(off)
    }
}

/// How many bytes of `code` can be relocated before a return, trap, or the
/// end of the buffer, stopping as soon as `min_bytes` is covered.
pub fn can_relocate(code: &[u8], min_bytes: usize) -> usize {
    let mut off = 0usize;
    while off < min_bytes {
        let Some(rest) = code.get(off..) else { break };
        match decode_insn(rest) {
            Ok(Insn { kind: InsnKind::Ret | InsnKind::Trap, .. }) | Err(_) => break,
            Ok(insn) => off += insn.len,
        }
    }
    off
}
