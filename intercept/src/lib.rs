//! relay-intercept: unwind-transparent native detours.
//!
//! Generated trampolines own a real stack frame described to the platform
//! unwinder, so a panic (or any Itanium-ABI exception) raised behind one
//! propagates to the logical caller exactly as if the call were direct.

pub mod abi;
pub mod arch;
pub mod code;
pub mod config;
pub mod detour;
pub mod error;
pub mod forward;
pub mod probe;
pub mod trampoline;
pub mod unwind;

// Re-exports for convenience (flattened imports)
pub use abi::Function;
pub use detour::{installed, Detour, DetourInfo};
pub use error::{DetourError, Result};
pub use forward::Forwarder;
pub use probe::exception_in_flight;
pub use trampoline::{reclaim_retired, Trampoline};

/// Load configuration from the environment and log it.
///
/// Optional: everything loads lazily on first use. Calling this early makes
/// malformed variables show up at startup rather than at the first install.
pub fn init() {
    let cfg = config::config();
    log::debug!(
        "intercept config: slab={} near_alloc={} quiesce={:?} hook_debug={}",
        cfg.slab_size,
        cfg.near_alloc,
        cfg.quiesce_timeout,
        cfg.hook_debug
    );
}

/// Process-global lock for tests that patch executable code.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
