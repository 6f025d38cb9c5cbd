//! Read-only view of the calling thread's unwinding state.

use core::mem::ManuallyDrop;

/// Returns true while the calling thread is unwinding because of a panic.
///
/// The flag is owned by the Rust panic runtime. It is raised when a panic
/// starts (including `resume_unwind`) and cleared when `catch_unwind`
/// absorbs it, so it stays set while frames made of generated trampoline
/// code are being unwound. Never allocates and never panics.
#[inline]
pub fn exception_in_flight() -> bool {
    std::thread::panicking()
}

/// Runs a closure only if the frame holding the guard is left by unwinding.
///
/// This is how caller code observes a propagating exception from its own
/// frame: the closure runs during the cleanup phase, before control leaves
/// the frame, with [`exception_in_flight`] reporting true.
///
/// A guard armed while the thread is already unwinding (inside a `Drop` run
/// by an unrelated panic, say) can't tell its own unwind from the outer one
/// and never fires.
#[must_use = "the closure runs when the guard is dropped during unwinding"]
pub struct UnwindGuard<F: FnOnce()> {
    on_unwind: ManuallyDrop<F>,
    armed: bool,
}

/// Arm `f` to run if the current scope unwinds.
pub fn on_unwind<F: FnOnce()>(f: F) -> UnwindGuard<F> {
    UnwindGuard {
        on_unwind: ManuallyDrop::new(f),
        armed: !exception_in_flight(),
    }
}

impl<F: FnOnce()> UnwindGuard<F> {
    /// Drop the closure without running it. Used on the normal return path.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl<F: FnOnce()> Drop for UnwindGuard<F> {
    fn drop(&mut self) {
        // SAFETY: the closure is taken exactly once, here.
        let f = unsafe { ManuallyDrop::take(&mut self.on_unwind) };
        if self.armed && exception_in_flight() {
            f();
        }
    }
}
