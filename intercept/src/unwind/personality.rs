//! Personality routine for framed stubs.
//!
//! Generated stubs have exactly one call site and one cleanup. The routine
//! never claims a handler: in the search phase it lets the unwinder keep
//! walking, in the cleanup phase it sends control to the stub's landing pad,
//! which balances the in-flight counter and resumes the same exception.

#![allow(non_camel_case_types)]

use core::ffi::{c_int, c_void};

pub type _Unwind_Reason_Code = c_int;
pub type _Unwind_Action = c_int;

pub const _URC_FATAL_PHASE1_ERROR: _Unwind_Reason_Code = 3;
pub const _URC_INSTALL_CONTEXT: _Unwind_Reason_Code = 7;
pub const _URC_CONTINUE_UNWIND: _Unwind_Reason_Code = 8;

pub const _UA_SEARCH_PHASE: _Unwind_Action = 1;
pub const _UA_CLEANUP_PHASE: _Unwind_Action = 2;

#[repr(C)]
pub struct _Unwind_Exception {
    _private: [u8; 0],
}

#[repr(C)]
pub struct _Unwind_Context {
    _private: [u8; 0],
}

extern "C" {
    fn _Unwind_GetIP(ctx: *mut _Unwind_Context) -> usize;
    fn _Unwind_SetIP(ctx: *mut _Unwind_Context, ip: usize);
    fn _Unwind_SetGR(ctx: *mut _Unwind_Context, index: c_int, value: usize);
    fn _Unwind_GetLanguageSpecificData(ctx: *mut _Unwind_Context) -> *mut c_void;
}

extern "C-unwind" {
    fn _Unwind_Resume(exc: *mut _Unwind_Exception) -> !;
}

/// The language-specific data of a framed stub. Addresses are absolute.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LandingSite {
    /// First byte of the call to the target.
    pub call_start: usize,
    /// Return address of that call.
    pub call_end: usize,
    pub landing: usize,
}

impl LandingSite {
    /// Whether a frame whose return address is `ip` is stopped at the call.
    pub fn covers(&self, ip: usize) -> bool {
        ip > self.call_start && ip <= self.call_end
    }
}

/// Cleanup-phase decision for one frame, separated from the unwinder calls.
pub(crate) fn landing_for(actions: _Unwind_Action, site: Option<&LandingSite>, ip: usize) -> Option<usize> {
    if actions & _UA_CLEANUP_PHASE == 0 {
        return None;
    }
    site.filter(|s| s.covers(ip)).map(|s| s.landing)
}

/// Referenced from the CIE of every framed stub.
///
/// # Safety
/// Only the unwinder calls this, with an LSDA that points at a live
/// [`LandingSite`].
pub unsafe extern "C" fn stub_personality(
    version: c_int,
    actions: _Unwind_Action,
    _class: u64,
    exc: *mut _Unwind_Exception,
    ctx: *mut _Unwind_Context,
) -> _Unwind_Reason_Code {
    if version != 1 {
        return _URC_FATAL_PHASE1_ERROR;
    }

    let site = _Unwind_GetLanguageSpecificData(ctx) as *const LandingSite;
    let ip = _Unwind_GetIP(ctx);
    match landing_for(actions, site.as_ref(), ip) {
        Some(landing) => {
            // DWARF register 0 is rax / x0, the first argument register of the
            // landing pad's _Unwind_Resume call on each host.
            _Unwind_SetGR(ctx, 0, exc as usize);
            _Unwind_SetIP(ctx, landing);
            _URC_INSTALL_CONTEXT
        }
        None => _URC_CONTINUE_UNWIND,
    }
}

pub fn personality_address() -> u64 {
    crate::code::cache::strip_code_ptr(stub_personality as usize) as u64
}

/// Where landing pads continue the unwind.
pub fn resume_address() -> u64 {
    crate::code::cache::strip_code_ptr(_Unwind_Resume as usize) as u64
}
