//! Owned executable regions holding generated stubs.
//!
//! A [`Trampoline`] is written once while its slab is RW, flipped to RX, and
//! never touched again. Dropping it does not unmap anything: the region, its
//! unwind registration and its in-flight counter move to a process-wide
//! graveyard, since a thread may still be executing inside it or about to
//! return into it. [`reclaim_retired`] frees retired regions once the caller
//! knows they are quiescent.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::abi::{self, CallLayout, Signature};
use crate::arch::{FramedStub, HostEmitter, StubEmitter};
use crate::code::allocator::{CodeAllocator, CodeSlice};
use crate::config::config;
use crate::error::{DetourError, Result};
use crate::unwind::personality::{personality_address, resume_address, LandingSite};
use crate::unwind::{build_eh_frame, FrameSite, UnwindRegistration};

/// Furthest a stub may sit from the code that jumps to it with a rel32.
const NEAR_RANGE: usize = 0x7FF0_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubShape {
    /// Frame-owning call-through with unwind info and a landing pad.
    Framed,
    /// A single jump.
    Tail,
    /// Relocated entry instructions followed by a jump back into the body.
    Original,
}

/// Data the generated code and the personality routine point into.
#[derive(Debug)]
struct FrameGuard {
    site: LandingSite,
    in_flight: AtomicUsize,
}

#[derive(Debug)]
struct Region {
    slice: CodeSlice,
    guard: Option<Box<FrameGuard>>,
    unwind: Option<UnwindRegistration>,
}

impl Region {
    fn in_flight(&self) -> usize {
        self.guard.as_ref().map_or(0, |g| g.in_flight.load(Ordering::Acquire))
    }
}

static GRAVEYARD: Mutex<Vec<Region>> = Mutex::new(Vec::new());

/// Generated code owned by one forwarder or detour.
#[derive(Debug)]
pub struct Trampoline {
    region: Option<Region>,
    entry: usize,
    len: usize,
    target: usize,
    call_site: Option<usize>,
    shape: StubShape,
    layout: Option<CallLayout>,
}

fn alloc_slab(near: Option<usize>) -> Result<CodeSlice> {
    let allocator = CodeAllocator::new(config().slab_size);
    if let Some(near) = near.filter(|_| config().near_alloc) {
        match allocator.alloc_near(near as *const u8, NEAR_RANGE) {
            Ok(slice) => return Ok(slice),
            Err(err) => debug!("no slab near {near:#x} ({err}), falling back"),
        }
    }
    allocator.alloc_any()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ")
}

fn dump(what: &str, slice: &CodeSlice, len: usize) {
    if config().hook_debug {
        // SAFETY: the first `len` bytes of the slab were just written.
        let code = unsafe { core::slice::from_raw_parts(slice.data, len) };
        debug!("{what} stub at {:#x} ({len} bytes): {}", slice.pc(), hex(code));
    }
}

/// Emit, protect and register a framed stub into `slice`.
fn build_framed(slice: &mut CodeSlice, target: usize, layout: &CallLayout) -> Result<(usize, Box<FrameGuard>, UnwindRegistration)> {
    let mut guard = Box::new(FrameGuard {
        site: LandingSite { call_start: 0, call_end: 0, landing: 0 },
        in_flight: AtomicUsize::new(0),
    });

    let pc = slice.pc();
    let stub = FramedStub {
        target: target as u64,
        layout,
        counter: &guard.in_flight as *const AtomicUsize as u64,
        resume: resume_address(),
    };
    // SAFETY: the slab is freshly mapped RW and not yet executable.
    let image = HostEmitter::emit_framed(unsafe { slice.as_mut_slice() }, pc, &stub)?;

    let base = slice.data as usize;
    guard.site = LandingSite {
        call_start: base + image.call_start,
        call_end: base + image.call_end,
        landing: base + image.landing,
    };

    let table = build_eh_frame(&FrameSite {
        start: pc,
        len: image.len,
        frame: &image.frame,
        personality: personality_address(),
        lsda: &guard.site as *const LandingSite as u64,
    })?;

    dump("framed", slice, image.len);
    // SAFETY: `slice` came from `alloc_slab` and is still mapped; the
    // registration is kept next to the region for as long as it is mapped.
    unsafe {
        CodeAllocator::default().make_executable(slice)?;
        let unwind = UnwindRegistration::register(table)?;
        Ok((image.len, guard, unwind))
    }
}

impl Trampoline {
    /// A framed call-through stub to `target` for calls shaped like `signature`.
    pub fn framed(target: *const (), signature: &Signature) -> Result<Self> {
        Self::framed_near(target, signature, None)
    }

    pub(crate) fn framed_near(target: *const (), signature: &Signature, near: Option<usize>) -> Result<Self> {
        if target.is_null() {
            return Err(DetourError::NullTarget);
        }
        let layout = abi::layout(signature)?;
        let target = crate::code::cache::strip_code_ptr(target as usize);

        let mut slice = alloc_slab(near)?;
        match build_framed(&mut slice, target, &layout) {
            Ok((len, guard, unwind)) => {
                let entry = slice.data as usize;
                trace!("framed stub {entry:#x} -> {target:#x}, {} stack bytes", layout.stack_bytes);
                Ok(Self {
                    region: Some(Region { slice, guard: Some(guard), unwind: Some(unwind) }),
                    entry,
                    len,
                    target,
                    call_site: None,
                    shape: StubShape::Framed,
                    layout: Some(layout),
                })
            }
            Err(err) => {
                // SAFETY: nothing has been handed out that points into the slab.
                unsafe { CodeAllocator::default().free(slice) };
                Err(err)
            }
        }
    }

    /// A frameless relay that jumps straight to `target`. Carries no unwind
    /// info since it never owns a return address.
    pub fn tail(target: *const ()) -> Result<Self> {
        if target.is_null() {
            return Err(DetourError::NullTarget);
        }
        let target = crate::code::cache::strip_code_ptr(target as usize);
        let mut slice = alloc_slab(None)?;
        let pc = slice.pc();

        // SAFETY: fresh RW slab.
        let emitted = HostEmitter::emit_tail(unsafe { slice.as_mut_slice() }, pc, target as u64)
            .and_then(|len| unsafe { CodeAllocator::default().make_executable(&slice) }.map(|()| len));
        let len = match emitted {
            Ok(len) => len,
            Err(err) => {
                unsafe { CodeAllocator::default().free(slice) };
                return Err(err);
            }
        };
        dump("tail", &slice, len);

        Ok(Self {
            entry: slice.data as usize,
            region: Some(Region { slice, guard: None, unwind: None }),
            len,
            target,
            call_site: None,
            shape: StubShape::Tail,
            layout: None,
        })
    }

    /// Relocate the whole instructions of `code` (read from `code_pc`)
    /// covering `min_bytes` and jump back after them. Returns the stub and
    /// the number of bytes it took over.
    pub(crate) fn original(code: &[u8], code_pc: usize, min_bytes: usize) -> Result<(Self, usize)> {
        let mut slice = alloc_slab(Some(code_pc))?;
        let pc = slice.pc();

        // SAFETY: fresh RW slab.
        let emitted = HostEmitter::emit_original(unsafe { slice.as_mut_slice() }, pc, code, code_pc as u64, min_bytes)
            .and_then(|out| unsafe { CodeAllocator::default().make_executable(&slice) }.map(|()| out));
        let (len, consumed) = match emitted {
            Ok(out) => out,
            Err(err) => {
                unsafe { CodeAllocator::default().free(slice) };
                return Err(err);
            }
        };
        dump("original", &slice, len);

        let trampoline = Self {
            entry: slice.data as usize,
            region: Some(Region { slice, guard: None, unwind: None }),
            len,
            target: code_pc + consumed,
            call_site: Some(code_pc),
            shape: StubShape::Original,
            layout: None,
        };
        Ok((trampoline, consumed))
    }

    pub(crate) fn with_call_site(mut self, site: usize) -> Self {
        self.call_site = Some(site);
        self
    }

    /// Address to call. Valid until the trampoline is reclaimed.
    pub fn entry(&self) -> *const () {
        self.entry as *const ()
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// The patched function entry this stub belongs to, if any.
    pub fn call_site(&self) -> Option<usize> {
        self.call_site
    }

    pub fn shape(&self) -> StubShape {
        self.shape
    }

    pub fn layout(&self) -> Option<&CallLayout> {
        self.layout.as_ref()
    }

    /// The generated instructions.
    pub fn code(&self) -> &[u8] {
        // SAFETY: the region stays mapped while `self` is alive and is never
        // written after construction.
        unsafe { core::slice::from_raw_parts(self.entry as *const u8, self.len) }
    }

    /// Calls currently between entering the target and leaving the stub,
    /// normally or by unwinding. Always zero for frameless stubs.
    pub fn in_flight(&self) -> usize {
        self.region.as_ref().map_or(0, Region::in_flight)
    }

    /// Block until no call is in flight or `timeout` passes. Returns whether
    /// the stub went quiet.
    pub fn wait_quiescent(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.in_flight() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            trace!("retiring {:?} stub at {:#x}", self.shape, self.entry);
            GRAVEYARD.lock().unwrap_or_else(|e| e.into_inner()).push(region);
        }
    }
}

/// Number of retired regions not yet reclaimed.
pub fn retired() -> usize {
    GRAVEYARD.lock().unwrap_or_else(|e| e.into_inner()).len()
}

/// Unmap retired regions whose in-flight counter is zero and drop their
/// unwind registrations. Returns how many were freed.
///
/// # Safety
/// No thread may be about to enter a retired stub: every patch or function
/// pointer leading to one must be gone, and frameless stubs (which are not
/// counted) must not be executing.
pub unsafe fn reclaim_retired() -> usize {
    let ready: Vec<Region> = {
        let mut graveyard = GRAVEYARD.lock().unwrap_or_else(|e| e.into_inner());
        let (ready, busy) = graveyard.drain(..).partition(|r| r.in_flight() == 0);
        *graveyard = busy;
        ready
    };

    let freed = ready.len();
    for region in ready {
        let Region { slice, guard, unwind } = region;
        drop(unwind);
        CodeAllocator::default().free(slice);
        drop(guard);
    }
    if freed > 0 {
        debug!("reclaimed {freed} retired trampolines");
    }
    freed
}
