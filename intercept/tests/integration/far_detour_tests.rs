//! Detours whose hook lands out of reach of a relative branch.
//!
//! Near allocation is switched off for this binary and the targets live on
//! low fixed pages, so every entry patch is the absolute form.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

use relay_intercept::arch::{HostEmitter, StubEmitter};
use relay_intercept::config::{config, NEAR_ALLOC_VAR};
use relay_intercept::{installed, Detour, Function};

use crate::common::{add_const_code, emit_code_at, entry_bytes, lock, setup, AddFn};

const LOW_PAGES: &[usize] = &[
    0x1000_0000,
    0x1100_0000,
    0x1200_0000,
    0x1300_0000,
    0x5000_0000_0000,
    0x5000_1000_0000,
    0x5000_2000_0000,
];

fn far_setup() {
    static NO_NEAR: Once = Once::new();
    NO_NEAR.call_once(|| std::env::set_var(NEAR_ALLOC_VAR, "0"));
    setup();
    assert!(!config().near_alloc, "configuration was loaded before {NEAR_ALLOC_VAR} was set");
}

fn make_low_add_const(k: u32) -> AddFn {
    let code = emit_code_at(LOW_PAGES, &add_const_code(k)).expect("a free low page");
    unsafe { AddFn::from_ptr(code) }
}

static ORIGINAL: AtomicUsize = AtomicUsize::new(0);

extern "C-unwind" fn plus_hundred_of_original(x: u64) -> u64 {
    let original = unsafe { AddFn::from_ptr(ORIGINAL.load(Ordering::SeqCst) as *const ()) };
    original(x) + 100
}

extern "C-unwind" fn negate(x: u64) -> u64 {
    x.wrapping_neg()
}

extern "C-unwind" fn panics(x: u64) -> u64 {
    panic::panic_any(x)
}

#[test]
fn far_target_takes_the_absolute_patch() {
    far_setup();
    let _lock = lock();
    let target = make_low_add_const(7);
    let pristine = entry_bytes(target, 32);

    let mut detour = unsafe { Detour::install(target, plus_hundred_of_original as AddFn) }.unwrap();
    ORIGINAL.store(detour.original().to_ptr() as usize, Ordering::SeqCst);
    assert_eq!(detour.patch_size(), HostEmitter::MAX_PATCH_SIZE);

    assert_eq!(target(1), 108);
    assert_eq!((detour.original())(1), 8);
    assert_eq!(detour.hook().map(|h| h.in_flight()), Some(0));

    detour.remove().unwrap();
    assert_eq!(entry_bytes(target, 32), pristine);
    assert_eq!(target(1), 8);
}

#[test]
fn far_hook_unwinds_and_retargets() {
    far_setup();
    let _lock = lock();
    let target = make_low_add_const(2);
    let pristine = entry_bytes(target, 32);

    let mut detour = unsafe { Detour::install(target, panics as AddFn) }.unwrap();
    assert_eq!(detour.patch_size(), HostEmitter::MAX_PATCH_SIZE);

    let err = panic::catch_unwind(AssertUnwindSafe(|| target(41))).unwrap_err();
    assert_eq!(err.downcast_ref::<u64>(), Some(&41));
    assert_eq!(detour.hook().map(|h| h.in_flight()), Some(0));

    unsafe { detour.change_target(negate as AddFn) }.unwrap();
    assert_eq!(target(5), 5u64.wrapping_neg());
    assert_eq!((detour.original())(5), 7);
    let info = installed().into_iter().find(|i| i.target == detour.target()).unwrap();
    assert_eq!(info.patch_size, HostEmitter::MAX_PATCH_SIZE);

    drop(detour);
    assert_eq!(entry_bytes(target, 32), pristine);
    assert_eq!(target(5), 7);
}
