use crate::error::{DetourError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    X0 = 0,
    X1 = 1,
    X2 = 2,
    X3 = 3,
    X4 = 4,
    X5 = 5,
    X6 = 6,
    X7 = 7,
    X8 = 8,
    X9 = 9,
    X10 = 10,
    X11 = 11,
    X12 = 12,
    X13 = 13,
    X14 = 14,
    X15 = 15,
    X16 = 16,
    X17 = 17,
    X18 = 18,
    X19 = 19,
    X20 = 20,
    X21 = 21,
    X22 = 22,
    X23 = 23,
    X24 = 24,
    X25 = 25,
    X26 = 26,
    X27 = 27,
    X28 = 28,
    X29 = 29,
    X30 = 30,
    SP = 31,
}

impl Reg {
    const ALL: [Reg; 32] = [
        Reg::X0,
        Reg::X1,
        Reg::X2,
        Reg::X3,
        Reg::X4,
        Reg::X5,
        Reg::X6,
        Reg::X7,
        Reg::X8,
        Reg::X9,
        Reg::X10,
        Reg::X11,
        Reg::X12,
        Reg::X13,
        Reg::X14,
        Reg::X15,
        Reg::X16,
        Reg::X17,
        Reg::X18,
        Reg::X19,
        Reg::X20,
        Reg::X21,
        Reg::X22,
        Reg::X23,
        Reg::X24,
        Reg::X25,
        Reg::X26,
        Reg::X27,
        Reg::X28,
        Reg::X29,
        Reg::X30,
        Reg::SP,
    ];

    /// Register named by a 5-bit instruction field.
    pub fn from_field(field: u32) -> Reg {
        Self::ALL[(field & 0x1f) as usize]
    }
}

/// Instruction emitter over a borrowed buffer.
///
/// Like the x86_64 writer, it never writes out of bounds: overflow is
/// recorded and reported by `finish`.
#[derive(Debug)]
pub struct Arm64Writer<'a> {
    buf: &'a mut [u8],
    len: usize,
    pc: u64,
}

impl<'a> Arm64Writer<'a> {
    pub fn new(buf: &'a mut [u8], pc: u64) -> Self {
        Self { buf, len: 0, pc }
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn offset(&self) -> usize {
        self.len
    }

    pub fn finish(self) -> Result<usize> {
        if self.len > self.buf.len() {
            return Err(DetourError::CodeTooLarge { needed: self.len, capacity: self.buf.len() });
        }
        Ok(self.len)
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        let end = self.len + bytes.len();
        if end <= self.buf.len() {
            self.buf[self.len..end].copy_from_slice(bytes);
        }
        self.len = end;
        self.pc = self.pc.wrapping_add(bytes.len() as u64);
    }

    pub fn put_u32_raw(&mut self, insn: u32) {
        self.put_bytes(&insn.to_le_bytes());
    }

    pub fn put_u64_raw(&mut self, literal: u64) {
        self.put_bytes(&literal.to_le_bytes());
    }

    pub fn put_nop(&mut self) {
        self.put_u32_raw(0xD503_201F);
    }

    pub fn put_ret(&mut self) {
        self.put_u32_raw(0xD65F_03C0);
    }

    /// `brk #imm16`
    pub fn put_brk(&mut self, imm: u16) {
        self.put_u32_raw(0xD420_0000 | ((imm as u32) << 5));
    }

    pub fn put_br_reg(&mut self, reg: Reg) {
        self.put_u32_raw(0xD61F_0000 | ((reg as u32) << 5));
    }

    pub fn put_blr_reg(&mut self, reg: Reg) {
        self.put_u32_raw(0xD63F_0000 | ((reg as u32) << 5));
    }

    /// `stp a, b, [sp, #-16]!`
    pub fn put_push_reg_reg(&mut self, a: Reg, b: Reg) {
        let imm7 = (-2i32 as u32) & 0x7f;
        self.put_u32_raw(
            0xA980_0000 | (imm7 << 15) | ((b as u32) << 10) | ((Reg::SP as u32) << 5) | a as u32,
        );
    }

    /// `ldp a, b, [sp], #16`
    pub fn put_pop_reg_reg(&mut self, a: Reg, b: Reg) {
        self.put_u32_raw(
            0xA8C0_0000 | (2 << 15) | ((b as u32) << 10) | ((Reg::SP as u32) << 5) | a as u32,
        );
    }

    /// `add d, n, #imm12`
    pub fn put_add_reg_reg_imm(&mut self, d: Reg, n: Reg, imm: u32) {
        debug_assert!(imm <= 0xfff);
        self.put_u32_raw(0x9100_0000 | ((imm & 0xfff) << 10) | ((n as u32) << 5) | d as u32);
    }

    /// `sub d, n, #imm12`
    pub fn put_sub_reg_reg_imm(&mut self, d: Reg, n: Reg, imm: u32) {
        debug_assert!(imm <= 0xfff);
        self.put_u32_raw(0xD100_0000 | ((imm & 0xfff) << 10) | ((n as u32) << 5) | d as u32);
    }

    pub fn put_mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        // ORR treats register 31 as XZR, so moves involving SP go through ADD #0.
        if src == Reg::SP || dst == Reg::SP {
            self.put_add_reg_reg_imm(dst, src, 0);
            return;
        }
        self.put_u32_raw(0xAA00_03E0 | ((src as u32) << 16) | dst as u32);
    }

    /// MOVZ + three MOVK. Always 16 bytes so stub sizes stay fixed.
    pub fn put_mov_reg_u64(&mut self, dst: Reg, value: u64) {
        let rd = dst as u32;
        for hw in 0..4u32 {
            let imm16 = ((value >> (hw * 16)) & 0xffff) as u32;
            let base = if hw == 0 { 0xD280_0000 } else { 0xF280_0000 };
            self.put_u32_raw(base | (hw << 21) | (imm16 << 5) | rd);
        }
    }

    pub fn put_b_imm(&mut self, target: u64) {
        let imm = (target as i64).wrapping_sub(self.pc as i64) >> 2;
        self.put_u32_raw(0x1400_0000 | ((imm as u32) & 0x03FF_FFFF));
    }

    /// Whether an ADRP from `from` can name the page of `to` (±4 GiB).
    pub fn adrp_reachable(from: u64, to: u64) -> bool {
        let pages = ((to & !0xFFF) as i64).wrapping_sub((from & !0xFFF) as i64) >> 12;
        (-(1i64 << 20)..(1i64 << 20)).contains(&pages)
    }

    /// ADRP + ADD + BR (12 bytes).
    pub fn put_adrp_add_br(&mut self, reg: Reg, target: u64) {
        let rt = reg as u32;
        let pages = ((target & !0xFFF) as i64).wrapping_sub((self.pc & !0xFFF) as i64) >> 12;
        let immlo = (pages as u32) & 0x3;
        let immhi = ((pages as u32) >> 2) & 0x7FFFF;
        self.put_u32_raw(0x9000_0000 | (immlo << 29) | (immhi << 5) | rt);
        self.put_add_reg_reg_imm(reg, reg, (target & 0xFFF) as u32);
        self.put_br_reg(reg);
    }

    /// LDR + BR + literal (16 bytes, any distance).
    pub fn put_ldr_br_address(&mut self, reg: Reg, addr: u64) {
        // ldr reg, [pc, #8]
        self.put_u32_raw(0x5800_0000 | (2 << 5) | reg as u32);
        self.put_br_reg(reg);
        self.put_u64_raw(addr);
    }

    /// Load an absolute value and continue after the literal (16 bytes).
    pub fn put_ldr_reg_address(&mut self, reg: Reg, addr: u64) {
        self.put_u32_raw(0x5800_0000 | (2 << 5) | reg as u32);
        self.put_b_imm(self.pc.wrapping_add(12));
        self.put_u64_raw(addr);
    }

    /// `ldr rt, [rn, #offset]`. Offset must be a non-negative multiple of 8.
    pub fn put_ldr_reg_reg_offset(&mut self, rt: Reg, rn: Reg, offset: u32) {
        debug_assert!(offset % 8 == 0 && offset / 8 <= 0xfff);
        let imm12 = (offset >> 3) & 0xfff;
        self.put_u32_raw(0xF940_0000 | (imm12 << 10) | ((rn as u32) << 5) | rt as u32);
    }

    /// `str rt, [rn, #offset]`. Offset must be a non-negative multiple of 8.
    pub fn put_str_reg_reg_offset(&mut self, rt: Reg, rn: Reg, offset: u32) {
        debug_assert!(offset % 8 == 0 && offset / 8 <= 0xfff);
        let imm12 = (offset >> 3) & 0xfff;
        self.put_u32_raw(0xF900_0000 | (imm12 << 10) | ((rn as u32) << 5) | rt as u32);
    }

    /// `ldaxr rt, [rn]`
    pub fn put_ldaxr(&mut self, rt: Reg, rn: Reg) {
        self.put_u32_raw(0xC85F_FC00 | ((rn as u32) << 5) | rt as u32);
    }

    /// `stlxr ws, rt, [rn]`
    pub fn put_stlxr(&mut self, ws: Reg, rt: Reg, rn: Reg) {
        self.put_u32_raw(0xC800_FC00 | ((ws as u32) << 16) | ((rn as u32) << 5) | rt as u32);
    }

    /// `cbnz wt, target`
    pub fn put_cbnz_w(&mut self, rt: Reg, target: u64) {
        let imm19 = ((target as i64).wrapping_sub(self.pc as i64) >> 2) as u32 & 0x7FFFF;
        self.put_u32_raw(0x3500_0000 | (imm19 << 5) | rt as u32);
    }
}
