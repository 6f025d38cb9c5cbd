//! Instruction emission for the supported hosts.
//!
//! Each architecture provides a writer, a prologue relocator and a
//! [`StubEmitter`]. The emitter produces the two trampoline shapes and, for
//! the framed one, the call-frame rows the unwinder needs to walk through it.

pub mod arm64;
pub mod x86_64;

use gimli::write::CallFrameInstruction;
use gimli::Register;

use crate::abi::{CallLayout, CallingConvention};
use crate::error::{DetourError, Result};

/// Inputs for a framed stub: a frame-owning relay to `target`.
#[derive(Debug, Clone, Copy)]
pub struct FramedStub<'a> {
    pub target: u64,
    pub layout: &'a CallLayout,
    /// Address of the in-flight counter the stub increments around the call.
    pub counter: u64,
    /// `_Unwind_Resume`, called from the landing pad.
    pub resume: u64,
}

/// Unwind description of one generated function.
///
/// Offsets in `rows` are byte offsets from the start of the stub and are
/// strictly ordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDescription {
    pub code_alignment: u8,
    pub data_alignment: i8,
    pub return_address: Register,
    pub initial: Vec<CallFrameInstruction>,
    pub rows: Vec<(u32, CallFrameInstruction)>,
}

/// What emitting a framed stub produced. Offsets are relative to the stub start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubImage {
    pub len: usize,
    /// First byte of the call instruction to the target.
    pub call_start: usize,
    /// Return address of that call.
    pub call_end: usize,
    /// Entry of the unwind landing pad.
    pub landing: usize,
    pub frame: FrameDescription,
}

/// Code generation for one architecture.
pub trait StubEmitter {
    /// The convention stubs produced by this emitter assume.
    const CONVENTION: CallingConvention;
    /// Exact size of a tail stub.
    const TAIL_SIZE: usize;
    /// Bytes the entry patch overwrites at most.
    const MAX_PATCH_SIZE: usize;
    /// How far the last instruction touched by a patch may run past its end.
    const INSN_OVERHANG: usize;

    /// Exact size of the framed stub for `layout`.
    fn framed_size(layout: &CallLayout) -> usize;

    /// Frame-owning stub: copies the stack argument area, calls the target,
    /// counts itself in flight, and carries a landing pad for unwinding.
    fn emit_framed(buf: &mut [u8], pc: u64, stub: &FramedStub) -> Result<StubImage>;

    /// Frameless stub: a single jump to `target`. Invisible to the unwinder.
    fn emit_tail(buf: &mut [u8], pc: u64, target: u64) -> Result<usize>;

    /// Bytes at the start of `code` that must stay in place, such as a
    /// branch-target landing instruction.
    fn entry_skip(code: &[u8]) -> usize;

    /// How many bytes a jump from `at` to `to` needs.
    fn patch_size(at: u64, to: u64) -> usize;

    /// Relocate whole instructions covering at least `min_bytes` of `code`
    /// (which lives at `code_pc`) into `buf`, followed by a jump back to the
    /// first instruction not relocated. Returns `(stub_len, consumed)`.
    fn emit_original(buf: &mut [u8], pc: u64, code: &[u8], code_pc: u64, min_bytes: usize)
        -> Result<(usize, usize)>;

    /// The bytes that redirect `at` to `to`, padded to exactly `len` bytes.
    fn entry_patch(at: u64, to: u64, len: usize) -> Result<Vec<u8>>;
}

#[cfg(target_arch = "x86_64")]
pub type HostEmitter = x86_64::X86_64Emitter;

#[cfg(target_arch = "aarch64")]
pub type HostEmitter = arm64::Arm64Emitter;

/// Reject layouts computed for a different convention than `E` emits for.
pub(crate) fn check_convention<E: StubEmitter>(layout: &CallLayout) -> Result<()> {
    let ok = match (E::CONVENTION, layout.convention) {
        (CallingConvention::SysV64, CallingConvention::SysV64) => true,
        (CallingConvention::Aapcs64 { darwin: a }, CallingConvention::Aapcs64 { darwin: b }) => a == b,
        _ => false,
    };
    if !ok {
        return Err(DetourError::ConventionMismatch {
            expected: E::CONVENTION.name(),
            found: layout.convention.name(),
        });
    }
    Ok(())
}
