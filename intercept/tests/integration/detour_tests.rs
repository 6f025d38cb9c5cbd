//! Detour install/remove against generated target functions.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

use relay_intercept::code::cache::strip_code_ptr;
use relay_intercept::probe::{exception_in_flight, on_unwind};
use relay_intercept::{installed, reclaim_retired, trampoline, Detour, DetourError, Function};

use crate::common::{
    entry_bytes, lock, make_add_const, make_calling_prologue, make_short_add_const, setup, AddFn,
};

static ORIGINAL: AtomicUsize = AtomicUsize::new(0);

fn call_original(x: u64) -> u64 {
    let f = unsafe { AddFn::from_ptr(ORIGINAL.load(Ordering::SeqCst) as *const ()) };
    f(x)
}

extern "C-unwind" fn times_ten_of_original(x: u64) -> u64 {
    call_original(x) * 10
}

extern "C-unwind" fn always_zero(_: u64) -> u64 {
    0
}

extern "C-unwind" fn panics(x: u64) -> u64 {
    panic::panic_any(x)
}

#[test]
fn replacement_runs_and_original_is_reachable() {
    setup();
    let _lock = lock();
    let target = make_add_const(3);

    let detour = unsafe { Detour::install(target, times_ten_of_original as AddFn) }.unwrap();
    ORIGINAL.store(detour.original().to_ptr() as usize, Ordering::SeqCst);

    assert_eq!(target(4), 70);
    assert_eq!((detour.original())(4), 7);
    assert_eq!(detour.hook().map(|h| h.in_flight()), Some(0));
}

#[test]
fn install_remove_cycles_restore_entry_bytes() {
    setup();
    let _lock = lock();
    let target = make_add_const(11);
    let pristine = entry_bytes(target, 32);

    for round in 0..5 {
        let mut detour = unsafe { Detour::install(target, always_zero as AddFn) }.unwrap();
        assert_eq!(target(1), 0, "round {round}");
        assert_ne!(entry_bytes(target, 32), pristine);

        detour.remove().unwrap();
        assert_eq!(entry_bytes(target, 32), pristine, "round {round}");
        assert_eq!(target(1), 12, "round {round}");
    }
    assert!(installed().iter().all(|info| info.target != target.to_ptr() as usize));
}

#[test]
fn panicking_replacement_unwinds_to_the_caller() {
    setup();
    let _lock = lock();
    let target = make_add_const(1);
    let detour = unsafe { Detour::install(target, panics as AddFn) }.unwrap();

    let seen = Cell::new(None);
    let after = Cell::new(false);
    let err = panic::catch_unwind(AssertUnwindSafe(|| {
        assert!(!exception_in_flight());
        let _g = on_unwind(|| seen.set(Some(exception_in_flight())));
        let v = target(99);
        after.set(true);
        v
    }))
    .unwrap_err();

    assert_eq!(err.downcast_ref::<u64>(), Some(&99));
    assert_eq!(seen.get(), Some(true));
    assert!(!after.get());
    assert_eq!(detour.hook().map(|h| h.in_flight()), Some(0));
    assert!(!exception_in_flight());

    drop(detour);
    assert_eq!(target(1), 2);
}

#[test]
fn double_install_and_double_remove_are_errors() {
    setup();
    let _lock = lock();
    let target = make_add_const(5);

    let mut detour = unsafe { Detour::install(target, always_zero as AddFn) }.unwrap();
    assert_eq!(
        unsafe { Detour::install(target, always_zero as AddFn) }.unwrap_err(),
        DetourError::AlreadyInstalled(detour.target())
    );

    detour.remove().unwrap();
    assert_eq!(detour.remove(), Err(DetourError::NotInstalled(detour.target())));
    assert!(!detour.is_installed());
}

#[test]
fn registry_reports_live_detours() {
    setup();
    let _lock = lock();
    let a = make_add_const(1);
    let b = make_add_const(2);

    let da = unsafe { Detour::install(a, always_zero as AddFn) }.unwrap();
    let db = unsafe { Detour::install(b, always_zero as AddFn) }.unwrap();

    let live = installed();
    let ia = live.iter().find(|i| i.target == da.target()).copied().unwrap();
    let ib = live.iter().find(|i| i.target == db.target()).copied().unwrap();
    assert_eq!(ia.patch_size, da.patch_size());
    assert_eq!(ib.original, db.original().to_ptr() as usize);

    drop(da);
    let live = installed();
    assert!(live.iter().all(|i| i.target != ia.target));
    assert!(live.iter().any(|i| i.target == ib.target));
    drop(db);
}

#[test]
fn prologue_with_a_call_is_refused() {
    setup();
    let _lock = lock();
    let target = make_calling_prologue();
    let before = entry_bytes(target, 16);

    let err = unsafe { Detour::install(target, always_zero as AddFn) }.unwrap_err();
    assert!(
        matches!(err, DetourError::RelocationFailed { reason: "call in patched prologue", .. }),
        "{err}"
    );
    assert_eq!(entry_bytes(target, 16), before);
    assert!(installed().iter().all(|i| i.target != target.to_ptr() as usize));
}

#[test]
fn removed_detours_are_reclaimed() {
    setup();
    let _lock = lock();
    let target = make_add_const(9);
    let mut detour = unsafe { Detour::install(target, always_zero as AddFn) }.unwrap();
    detour.remove().unwrap();

    assert!(trampoline::retired() >= 2);
    // Nothing can reach the retired stubs: the entry is restored and the
    // lock keeps other tests from running them.
    assert!(unsafe { reclaim_retired() } >= 2);
    assert_eq!(target(0), 9);
}

#[test]
fn retargeting_a_live_detour() {
    setup();
    let _lock = lock();
    let target = make_add_const(4);
    let pristine = entry_bytes(target, 32);

    let mut detour = unsafe { Detour::install(target, always_zero as AddFn) }.unwrap();
    ORIGINAL.store(detour.original().to_ptr() as usize, Ordering::SeqCst);
    let original = detour.original();
    assert_eq!(detour.backup(), &pristine[..detour.backup().len()]);
    assert_eq!(target(2), 0);

    unsafe { detour.change_target(times_ten_of_original as AddFn) }.unwrap();
    assert_eq!(target(2), 60);
    assert_eq!(detour.original().to_ptr(), original.to_ptr());
    let info = installed().into_iter().find(|i| i.target == detour.target()).unwrap();
    assert_eq!(info.replacement, strip_code_ptr(times_ten_of_original as usize));
    assert_eq!(info.original, original.to_ptr() as usize);

    unsafe { detour.change_target(panics as AddFn) }.unwrap();
    let err = panic::catch_unwind(AssertUnwindSafe(|| target(3))).unwrap_err();
    assert_eq!(err.downcast_ref::<u64>(), Some(&3));
    assert_eq!(detour.hook().map(|h| h.in_flight()), Some(0));

    detour.remove().unwrap();
    assert_eq!(entry_bytes(target, 32), pristine);
    assert_eq!(target(2), 6);
    assert!(unsafe { detour.change_target(always_zero as AddFn) }.is_err());
}

#[test]
fn short_function_at_the_end_of_its_mapping() {
    setup();
    let _lock = lock();
    let target = make_short_add_const(8);
    assert_eq!(target(1), 9);

    let mut detour = unsafe { Detour::install(target, always_zero as AddFn) }.unwrap();
    assert_eq!(target(1), 0);
    assert_eq!((detour.original())(1), 9);

    detour.remove().unwrap();
    assert_eq!(target(1), 9);
}
