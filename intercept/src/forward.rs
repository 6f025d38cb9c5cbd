//! Routing a logical call through a framed trampoline and back.

use log::trace;

use crate::abi::Function;
use crate::error::{DetourError, Result};
use crate::probe;
use crate::trampoline::Trampoline;

/// Calls `F` through generated code that owns a real frame, so a panic
/// raised by the target unwinds through the stub exactly as it would through
/// a compiled caller.
#[derive(Debug)]
pub struct Forwarder<F: Function> {
    trampoline: Trampoline,
    entry: F,
    target: F,
}

impl<F: Function> Forwarder<F> {
    pub fn new(target: F) -> Result<Self> {
        if target.to_ptr().is_null() {
            return Err(DetourError::NullTarget);
        }
        let trampoline = Trampoline::framed(target.to_ptr(), &F::signature())?;
        // SAFETY: the stub was emitted from `F`'s own signature.
        let entry = unsafe { F::from_ptr(trampoline.entry()) };
        trace!("forwarder {:p} -> {:p}", trampoline.entry(), target.to_ptr());
        Ok(Self { trampoline, entry, target })
    }

    /// The trampoline as a callable `F`.
    ///
    /// The pointer must not be called after the forwarder is dropped and its
    /// region reclaimed with [`crate::trampoline::reclaim_retired`].
    pub fn entry(&self) -> F {
        self.entry
    }

    pub fn target(&self) -> F {
        self.target
    }

    pub fn trampoline(&self) -> &Trampoline {
        &self.trampoline
    }

    /// Invoke the target through the trampoline.
    ///
    /// # Safety
    /// Same contract as calling the target directly.
    #[inline]
    pub unsafe fn call(&self, args: F::Arguments) -> F::Output {
        self.entry.invoke(args)
    }

    /// Invoke the target through the trampoline, then run `after` with its
    /// result. If the call unwinds instead, `after` never runs and
    /// `on_unwind` runs once, from this frame, while the panic is still
    /// propagating.
    ///
    /// # Safety
    /// Same contract as calling the target directly.
    pub unsafe fn call_sequenced<R>(
        &self,
        args: F::Arguments,
        after: impl FnOnce(F::Output) -> R,
        on_unwind: impl FnOnce(),
    ) -> R {
        let guard = probe::on_unwind(on_unwind);
        let out = self.call(args);
        guard.disarm();
        after(out)
    }

    /// Calls currently inside the trampoline.
    pub fn in_flight(&self) -> usize {
        self.trampoline.in_flight()
    }
}
