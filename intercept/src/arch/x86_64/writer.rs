use crate::error::{DetourError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    RAX = 0,
    RCX = 1,
    RDX = 2,
    RBX = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Low 3 bits of the register encoding.
    #[inline]
    fn lo3(self) -> u8 {
        (self as u8) & 7
    }

    /// Whether this register requires the REX.B or REX.R extension bit.
    #[inline]
    fn is_extended(self) -> bool {
        (self as u8) >= 8
    }
}

/// Byte emitter over a borrowed buffer.
///
/// Writes past the end of the buffer are dropped and remembered; `finish`
/// reports them as `CodeTooLarge` together with the size that was needed.
#[derive(Debug)]
pub struct X86_64Writer<'a> {
    buf: &'a mut [u8],
    len: usize,
    pc: u64,
}

impl<'a> X86_64Writer<'a> {
    /// `pc` is the address `buf[0]` will execute at.
    pub fn new(buf: &'a mut [u8], pc: u64) -> Self {
        Self { buf, len: 0, pc }
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn offset(&self) -> usize {
        self.len
    }

    pub fn overflowed(&self) -> bool {
        self.len > self.buf.len()
    }

    /// Number of bytes written, or `CodeTooLarge` if the buffer ran out.
    pub fn finish(self) -> Result<usize> {
        if self.overflowed() {
            return Err(DetourError::CodeTooLarge { needed: self.len, capacity: self.buf.len() });
        }
        Ok(self.len)
    }

    fn emit(&mut self, byte: u8) {
        if let Some(slot) = self.buf.get_mut(self.len) {
            *slot = byte;
        }
        self.len += 1;
        self.pc = self.pc.wrapping_add(1);
    }

    fn emit_u32_le(&mut self, val: u32) {
        self.put_bytes(&val.to_le_bytes());
    }

    fn emit_u64_le(&mut self, val: u64) {
        self.put_bytes(&val.to_le_bytes());
    }

    /// REX prefix: 0100 W R X B
    #[inline]
    fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
        0x40 | ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8)
    }

    /// ModRM byte: mod(2) | reg(3) | rm(3)
    #[inline]
    fn modrm(mod_: u8, reg: u8, rm: u8) -> u8 {
        ((mod_ & 3) << 6) | ((reg & 7) << 3) | (rm & 7)
    }

    fn rel32(&self, target: u64, insn_end: u64) -> u32 {
        (target as i64).wrapping_sub(insn_end as i64) as u32
    }

    // ── Push / Pop ───────────────────────────────────────────────────

    /// `push reg`: [REX.B] 50+rd
    pub fn put_push_reg(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.emit(Self::rex(false, false, false, true));
        }
        self.emit(0x50 + reg.lo3());
    }

    /// `pop reg`: [REX.B] 58+rd
    pub fn put_pop_reg(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.emit(Self::rex(false, false, false, true));
        }
        self.emit(0x58 + reg.lo3());
    }

    /// `push qword [base + offset]`: [REX.B] FF /6
    pub fn put_push_mem(&mut self, base: Reg, offset: i32) {
        if base.is_extended() {
            self.emit(Self::rex(false, false, false, true));
        }
        self.emit(0xFF);
        self.emit_modrm_base_disp32(6, base, offset);
    }

    // ── MOV ────────────────────────────────────────────────────

    /// `mov reg, imm64`: REX.W B8+rd io (10 bytes)
    pub fn put_mov_reg_imm64(&mut self, reg: Reg, imm: u64) {
        self.emit(Self::rex(true, false, false, reg.is_extended()));
        self.emit(0xB8 + reg.lo3());
        self.emit_u64_le(imm);
    }

    /// `mov dst, src` (64-bit): REX.W 89 /r
    pub fn put_mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.emit(Self::rex(true, src.is_extended(), false, dst.is_extended()));
        self.emit(0x89);
        self.emit(Self::modrm(0b11, src.lo3(), dst.lo3()));
    }

    /// ModRM + optional SIB + disp32 for `[base + disp32]`.
    ///
    /// Always mod=10 so RBP/R13 never decode as RIP-relative. RSP/R12 need SIB 0x24.
    fn emit_modrm_base_disp32(&mut self, reg_field: u8, base: Reg, offset: i32) {
        if base.lo3() == 4 {
            self.emit(Self::modrm(0b10, reg_field, 0b100));
            self.emit(0x24);
        } else {
            self.emit(Self::modrm(0b10, reg_field, base.lo3()));
        }
        self.emit_u32_le(offset as u32);
    }

    // ── Arithmetic ───────────────────────────────────────────────────

    /// `sub reg, imm32`: REX.W 81 /5 id
    pub fn put_sub_reg_imm32(&mut self, reg: Reg, imm: u32) {
        self.emit(Self::rex(true, false, false, reg.is_extended()));
        self.emit(0x81);
        self.emit(Self::modrm(0b11, 5, reg.lo3()));
        self.emit_u32_le(imm);
    }

    /// `lock inc qword [reg]`: F0 REX.W FF /0
    pub fn put_lock_inc_mem(&mut self, reg: Reg) {
        self.put_lock_group5(0, reg);
    }

    /// `lock dec qword [reg]`: F0 REX.W FF /1
    pub fn put_lock_dec_mem(&mut self, reg: Reg) {
        self.put_lock_group5(1, reg);
    }

    fn put_lock_group5(&mut self, op: u8, reg: Reg) {
        debug_assert!(reg.lo3() != 4 && reg.lo3() != 5, "[rsp]/[rbp] forms need SIB or disp8");
        self.emit(0xF0);
        self.emit(Self::rex(true, false, false, reg.is_extended()));
        self.emit(0xFF);
        self.emit(Self::modrm(0b00, op, reg.lo3()));
    }

    // ── Branches / Calls ─────────────────────────────────────────────

    /// `jmp rel32`: E9 cd (5 bytes)
    pub fn put_jmp_near(&mut self, target: u64) {
        let rel = self.rel32(target, self.pc.wrapping_add(5));
        self.emit(0xE9);
        self.emit_u32_le(rel);
    }

    /// Absolute jump through an inline literal (16 bytes).
    ///
    /// FF 25 02 00 00 00   jmp [rip+2]
    /// 0F 0B               ud2
    /// <8-byte address>
    pub fn put_jmp_far(&mut self, target: u64) {
        self.emit(0xFF);
        self.emit(0x25);
        self.emit_u32_le(0x02);
        self.put_ud2();
        self.emit_u64_le(target);
    }

    /// Whether a 5-byte `jmp rel32` placed at `from` reaches `target`.
    pub fn near_reachable(from: u64, target: u64) -> bool {
        let rel = (target as i64).wrapping_sub(from.wrapping_add(5) as i64);
        rel >= i32::MIN as i64 && rel <= i32::MAX as i64
    }

    /// Near jump when rel32 reaches `target`, far jump otherwise.
    pub fn put_jmp_address(&mut self, target: u64) {
        if Self::near_reachable(self.pc, target) {
            self.put_jmp_near(target);
        } else {
            self.put_jmp_far(target);
        }
    }

    /// `call reg`: [REX.B] FF /2
    pub fn put_call_reg(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.emit(Self::rex(false, false, false, true));
        }
        self.emit(0xFF);
        self.emit(Self::modrm(0b11, 2, reg.lo3()));
    }

    /// `jcc rel8` with a raw condition code (0..=15).
    pub fn put_jcc_short(&mut self, cc: u8, rel8: i8) {
        self.emit(0x70 | (cc & 0x0F));
        self.emit(rel8 as u8);
    }

    // ── Misc ─────────────────────────────────────────────────────────

    pub fn put_ret(&mut self) {
        self.emit(0xC3);
    }

    pub fn put_ud2(&mut self) {
        self.emit(0x0F);
        self.emit(0x0B);
    }

    pub fn put_nop(&mut self) {
        self.emit(0x90);
    }

    /// Multi-byte NOP padding using the recommended forms.
    pub fn put_nop_n(&mut self, n: usize) {
        const NOPS: [&[u8]; 9] = [
            &[0x90],
            &[0x66, 0x90],
            &[0x0F, 0x1F, 0x00],
            &[0x0F, 0x1F, 0x40, 0x00],
            &[0x0F, 0x1F, 0x44, 0x00, 0x00],
            &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
            &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
            &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
            &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        ];
        let mut remaining = n;
        while remaining > 0 {
            let chunk = remaining.min(NOPS.len());
            self.put_bytes(NOPS[chunk - 1]);
            remaining -= chunk;
        }
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        let end = self.len + bytes.len();
        if end <= self.buf.len() {
            self.buf[self.len..end].copy_from_slice(bytes);
        }
        self.len = end;
        self.pc = self.pc.wrapping_add(bytes.len() as u64);
    }
}
