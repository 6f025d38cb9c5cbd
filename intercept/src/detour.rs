//! Entry-point detours.
//!
//! Installing a detour overwrites the first instructions of the target with a
//! jump to a framed stub that calls the replacement. The overwritten
//! instructions are relocated into a second stub that ends with a jump back
//! into the target body; that stub is what [`Detour::original`] returns.
//!
//! ```text
//! caller -> target: jmp hook -> hook (framed) -> replacement
//!                                                   |
//!                       original: prologue; jmp target+n
//! ```
//!
//! The hook stub owns a frame described to the unwinder, so a panic in the
//! replacement unwinds straight back to whoever called the target.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, OnceLock};

use log::{debug, warn};

use crate::abi::Function;
use crate::arch::{HostEmitter, StubEmitter};
use crate::code::cache::strip_code_ptr;
use crate::code::patcher::patch_code;
use crate::config::config;
use crate::error::{DetourError, Result};
use crate::trampoline::Trampoline;

/// Bytes inspected before anything is known about the target. Covers the
/// longest entry landing pad (`endbr64`, `bti`).
const SKIP_WINDOW: usize = 4;

/// What [`installed`] reports about one live detour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetourInfo {
    pub target: usize,
    pub replacement: usize,
    /// Entry of the relocated-prologue stub.
    pub original: usize,
    /// Bytes overwritten at the target entry.
    pub patch_size: usize,
}

fn registry() -> MutexGuard<'static, HashMap<usize, DetourInfo>> {
    static REGISTRY: OnceLock<Mutex<HashMap<usize, DetourInfo>>> = OnceLock::new();
    REGISTRY
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

/// Every detour currently installed in the process, by target address.
pub fn installed() -> Vec<DetourInfo> {
    let mut out: Vec<DetourInfo> = registry().values().copied().collect();
    out.sort_by_key(|info| info.target);
    out
}

/// A live redirection of `F`-typed code to a replacement.
///
/// Dropping an installed detour removes it.
#[derive(Debug)]
pub struct Detour<F: Function> {
    target: usize,
    patch_at: usize,
    /// Original bytes from `patch_at` through the end of the relocated
    /// prologue. Any patch up to this length can be reverted from it.
    saved: Vec<u8>,
    patch_size: usize,
    original: F,
    hook: Option<Trampoline>,
    relocated: Option<Trampoline>,
}

/// Wait for calls still inside `hook`, then let it retire.
fn retire_hook(hook: Trampoline, target: usize) {
    let timeout = config().quiesce_timeout;
    if !hook.wait_quiescent(timeout) {
        warn!(
            "{} calls still inside detour at {target:#x} after {timeout:?}; retiring anyway",
            hook.in_flight()
        );
    }
}

impl<F: Function> Detour<F> {
    /// Redirect every call of `target` to `replacement`.
    ///
    /// # Safety
    /// `target` must be a function whose first instructions no thread is
    /// executing during the patch, and `replacement` must be callable in its
    /// place. The bytes from `target` through the end of the patched
    /// instructions are read; on x86_64 that may run up to 14 bytes past the
    /// patch (at most 34 bytes in all), so those bytes must be readable.
    pub unsafe fn install(target: F, replacement: F) -> Result<Self> {
        let target_addr = strip_code_ptr(target.to_ptr() as usize);
        if target_addr == 0 || replacement.to_ptr().is_null() {
            return Err(DetourError::NullTarget);
        }

        let mut registry = registry();
        if registry.contains_key(&target_addr) {
            return Err(DetourError::AlreadyInstalled(target_addr));
        }

        let head = core::slice::from_raw_parts(target_addr as *const u8, SKIP_WINDOW);
        let skip = HostEmitter::entry_skip(head);
        let patch_at = target_addr + skip;

        let hook = Trampoline::framed_near(replacement.to_ptr(), &F::signature(), Some(patch_at))?
            .with_call_site(target_addr);
        let hook_entry = hook.entry() as u64;
        let patch_size = HostEmitter::patch_size(patch_at as u64, hook_entry);

        let window = skip + patch_size + HostEmitter::INSN_OVERHANG;
        let code = core::slice::from_raw_parts(target_addr as *const u8, window);
        let (relocated, consumed) = Trampoline::original(code, target_addr, skip + patch_size)?;

        let patch = HostEmitter::entry_patch(patch_at as u64, hook_entry, patch_size)?;
        let saved = code[skip..consumed].to_vec();
        patch_code(patch_at as *mut u8, &patch)?;

        let info = DetourInfo {
            target: target_addr,
            replacement: hook.target(),
            original: relocated.entry() as usize,
            patch_size,
        };
        registry.insert(target_addr, info);
        debug!(
            "detour {target_addr:#x} -> {:#x}: {patch_size} byte patch, {consumed} bytes relocated",
            info.replacement
        );

        Ok(Self {
            target: target_addr,
            patch_at,
            saved,
            patch_size,
            original: F::from_ptr(relocated.entry()),
            hook: Some(hook),
            relocated: Some(relocated),
        })
    }

    /// The entry patch redirecting to a hook at `hook_entry`, sized to cover
    /// whatever the current patch overwrote.
    fn retarget_patch(&self, hook_entry: u64) -> Result<Vec<u8>> {
        let needed = HostEmitter::patch_size(self.patch_at as u64, hook_entry);
        if needed > self.saved.len() {
            return Err(DetourError::PatchTooLarge { needed, available: self.saved.len() });
        }
        HostEmitter::entry_patch(self.patch_at as u64, hook_entry, needed.max(self.patch_size))
    }

    /// Send calls of the target to `replacement` instead, keeping the
    /// relocated prologue and [`original`](Self::original) as they are.
    ///
    /// The old hook is retired after calls already inside it finish (or the
    /// configured timeout passes). Fails with `PatchTooLarge` when the new
    /// hook lands out of reach of the bytes relocated at install time; the
    /// entry is left untouched in that case.
    ///
    /// # Safety
    /// `replacement` must be callable in place of the target.
    pub unsafe fn change_target(&mut self, replacement: F) -> Result<()> {
        if replacement.to_ptr().is_null() {
            return Err(DetourError::NullTarget);
        }
        let mut registry = registry();
        if self.hook.is_none() {
            return Err(DetourError::NotInstalled(self.target));
        }

        let hook = Trampoline::framed_near(replacement.to_ptr(), &F::signature(), Some(self.patch_at))?
            .with_call_site(self.target);
        let patch = self.retarget_patch(hook.entry() as u64)?;
        patch_code(self.patch_at as *mut u8, &patch)?;
        self.patch_size = patch.len();

        if let Some(info) = registry.get_mut(&self.target) {
            info.replacement = hook.target();
            info.patch_size = self.patch_size;
        }
        drop(registry);
        debug!("detour {:#x} retargeted to {:#x}", self.target, hook.target());

        if let Some(old) = self.hook.replace(hook) {
            retire_hook(old, self.target);
        }
        Ok(())
    }

    /// Restore the original entry bytes, wait for calls still inside the
    /// replacement, and retire the generated stubs.
    pub fn remove(&mut self) -> Result<()> {
        let mut registry = registry();
        if self.hook.is_none() {
            return Err(DetourError::NotInstalled(self.target));
        }

        // SAFETY: `saved` holds the original bytes at `patch_at`, covering
        // everything any patch of this detour overwrote.
        unsafe { patch_code(self.patch_at as *mut u8, &self.saved[..self.patch_size])? };
        registry.remove(&self.target);
        drop(registry);

        if let Some(hook) = self.hook.take() {
            retire_hook(hook, self.target);
        }
        self.relocated = None;
        debug!("detour {:#x} removed", self.target);
        Ok(())
    }

    /// The target's behavior without the detour: relocated entry
    /// instructions followed by a jump into the rest of the body.
    ///
    /// Must not be called after the detour is removed and retired stubs are
    /// reclaimed.
    pub fn original(&self) -> F {
        self.original
    }

    pub fn is_installed(&self) -> bool {
        self.hook.is_some()
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// The framed stub the entry patch jumps to.
    pub fn hook(&self) -> Option<&Trampoline> {
        self.hook.as_ref()
    }

    pub fn patch_size(&self) -> usize {
        self.patch_size
    }

    /// Original bytes at the patch site, covering every instruction the
    /// detour relocated. The first [`patch_size`](Self::patch_size) of them
    /// are what `remove` writes back.
    pub fn backup(&self) -> &[u8] {
        &self.saved
    }
}

impl<F: Function> Drop for Detour<F> {
    fn drop(&mut self) {
        if self.is_installed() {
            if let Err(err) = self.remove() {
                warn!("failed to remove detour at {:#x}: {err}", self.target);
            }
        }
    }
}
