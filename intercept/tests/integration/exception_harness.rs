//! The throwex / caller scenario.
//!
//! `throwex` always panics. `caller` checks the probe, invokes `throwex`
//! through a forwarder and observes the unwind from its own frame. The test
//! drives `caller` through a second forwarder from inside `catch_unwind`.

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};

use relay_intercept::probe::{exception_in_flight, on_unwind};
use relay_intercept::Forwarder;

use crate::common::setup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    ProbeCheckedClear,
    ForwardedCallEntered,
    TargetThrew,
    TargetReturned,
    ProbeCheckedSet,
    UnwoundToHandler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Thrown(u32);

const PAYLOAD: Thrown = Thrown(0x0E_C0DE);

type ThrowFn = extern "C-unwind" fn();
type CallerFn = extern "C-unwind" fn();

thread_local! {
    static STEPS: RefCell<Vec<Step>> = const { RefCell::new(Vec::new()) };
    static MARKER: Cell<u32> = const { Cell::new(0) };
    static AFTER_RAN: Cell<bool> = const { Cell::new(false) };
    static PROBE_BEFORE: Cell<Option<bool>> = const { Cell::new(None) };
    static PROBE_ON_UNWIND: Cell<Option<bool>> = const { Cell::new(None) };
    static THROWER: Forwarder<ThrowFn> =
        Forwarder::new(throwex as ThrowFn).expect("forwarder for throwex");
    static RETURNER: Forwarder<ThrowFn> =
        Forwarder::new(returns as ThrowFn).expect("forwarder for returns");
}

fn step(s: Step) {
    STEPS.with(|steps| steps.borrow_mut().push(s));
}

fn reset() {
    STEPS.with(|steps| steps.borrow_mut().clear());
    MARKER.set(0);
    AFTER_RAN.set(false);
    PROBE_BEFORE.set(None);
    PROBE_ON_UNWIND.set(None);
}

fn steps() -> Vec<Step> {
    STEPS.with(|steps| steps.borrow().clone())
}

extern "C-unwind" fn throwex() {
    step(Step::TargetThrew);
    panic::panic_any(PAYLOAD);
}

extern "C-unwind" fn returns() {
    step(Step::TargetReturned);
}

/// First revision: probe before the call, probe from the unwind path.
extern "C-unwind" fn caller_v1() {
    PROBE_BEFORE.set(Some(exception_in_flight()));
    step(Step::ProbeCheckedClear);

    let _probe = on_unwind(|| {
        PROBE_ON_UNWIND.set(Some(exception_in_flight()));
        step(Step::ProbeCheckedSet);
    });
    step(Step::ForwardedCallEntered);
    THROWER.with(|fwd| unsafe { fwd.call(()) });
    AFTER_RAN.set(true);
}

/// Second revision: adds the did-run-after marker through `call_sequenced`.
fn caller_v2_through(fwd: &'static std::thread::LocalKey<Forwarder<ThrowFn>>) {
    PROBE_BEFORE.set(Some(exception_in_flight()));
    step(Step::ProbeCheckedClear);
    step(Step::ForwardedCallEntered);

    fwd.with(|fwd| unsafe {
        fwd.call_sequenced(
            (),
            |()| AFTER_RAN.set(true),
            || {
                MARKER.set(MARKER.get() + 1);
                PROBE_ON_UNWIND.set(Some(exception_in_flight()));
                step(Step::ProbeCheckedSet);
            },
        )
    });
}

extern "C-unwind" fn caller_v2() {
    caller_v2_through(&THROWER);
}

extern "C-unwind" fn caller_v2_returning() {
    caller_v2_through(&RETURNER);
}

/// Call `outer` under a handler and return the payloads it caught.
fn drive(outer: &Forwarder<CallerFn>) -> Vec<Thrown> {
    let mut caught = Vec::new();
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| unsafe { outer.call(()) })) {
        step(Step::UnwoundToHandler);
        caught.push(*payload.downcast::<Thrown>().expect("payload type survives"));
    }
    caught
}

#[test]
fn revision_one_probe_is_set_on_the_unwind_path() {
    setup();
    reset();
    let outer = Forwarder::new(caller_v1 as CallerFn).unwrap();

    assert!(!exception_in_flight());
    let caught = drive(&outer);

    assert_eq!(caught, vec![PAYLOAD]);
    assert_eq!(PROBE_BEFORE.get(), Some(false));
    assert_eq!(PROBE_ON_UNWIND.get(), Some(true));
    assert!(!AFTER_RAN.get());
    assert_eq!(
        steps(),
        vec![
            Step::ProbeCheckedClear,
            Step::ForwardedCallEntered,
            Step::TargetThrew,
            Step::ProbeCheckedSet,
            Step::UnwoundToHandler,
        ]
    );
    assert!(!exception_in_flight());
}

#[test]
fn revision_two_marker_runs_once_and_after_never_runs() {
    setup();
    reset();
    let outer = Forwarder::new(caller_v2 as CallerFn).unwrap();

    let caught = drive(&outer);

    assert_eq!(caught, vec![PAYLOAD]);
    assert_eq!(MARKER.get(), 1);
    assert_eq!(PROBE_BEFORE.get(), Some(false));
    assert_eq!(PROBE_ON_UNWIND.get(), Some(true));
    assert!(!AFTER_RAN.get());
    assert_eq!(
        steps(),
        vec![
            Step::ProbeCheckedClear,
            Step::ForwardedCallEntered,
            Step::TargetThrew,
            Step::ProbeCheckedSet,
            Step::UnwoundToHandler,
        ]
    );
    assert_eq!(outer.in_flight(), 0);
    THROWER.with(|fwd| assert_eq!(fwd.in_flight(), 0));
    assert!(!exception_in_flight());
}

#[test]
fn returning_target_takes_the_normal_path() {
    setup();
    reset();
    let outer = Forwarder::new(caller_v2_returning as CallerFn).unwrap();

    let caught = drive(&outer);

    assert!(caught.is_empty());
    assert_eq!(MARKER.get(), 0);
    assert!(AFTER_RAN.get());
    assert_eq!(PROBE_ON_UNWIND.get(), None);
    assert_eq!(
        steps(),
        vec![Step::ProbeCheckedClear, Step::ForwardedCallEntered, Step::TargetReturned]
    );
}

/// Caller shape of revision one around a target that returns. Runs from a
/// `Drop` during an unrelated panic and must not see its guard fire.
fn guarded_returning_call(fired: &Cell<u32>) -> bool {
    let _g = on_unwind(|| fired.set(fired.get() + 1));
    RETURNER.with(|fwd| unsafe { fwd.call(()) });
    true
}

#[test]
fn guard_stays_quiet_when_armed_during_another_unwind() {
    setup();
    reset();

    struct Cleanup<'a> {
        fired: &'a Cell<u32>,
        returned: &'a Cell<bool>,
    }
    impl Drop for Cleanup<'_> {
        fn drop(&mut self) {
            assert!(exception_in_flight());
            self.returned.set(guarded_returning_call(self.fired));
        }
    }

    let fired = Cell::new(0);
    let returned = Cell::new(false);
    let err = panic::catch_unwind(AssertUnwindSafe(|| {
        let _c = Cleanup { fired: &fired, returned: &returned };
        panic::panic_any(PAYLOAD);
    }))
    .unwrap_err();

    assert_eq!(err.downcast_ref::<Thrown>(), Some(&PAYLOAD));
    assert!(returned.get());
    assert_eq!(fired.get(), 0);
    assert_eq!(steps(), vec![Step::TargetReturned]);
    RETURNER.with(|fwd| assert_eq!(fwd.in_flight(), 0));
    assert!(!exception_in_flight());
}

#[test]
fn scenario_repeats_without_residue() {
    setup();
    let outer = Forwarder::new(caller_v2 as CallerFn).unwrap();
    for _ in 0..16 {
        reset();
        assert_eq!(drive(&outer), vec![PAYLOAD]);
        assert_eq!(MARKER.get(), 1);
        assert!(!AFTER_RAN.get());
    }
    assert_eq!(outer.in_flight(), 0);
}

#[test]
fn scenario_runs_on_many_threads() {
    setup();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            std::thread::spawn(|| {
                reset();
                let outer = Forwarder::new(caller_v2 as CallerFn).unwrap();
                let caught = drive(&outer);
                (caught, MARKER.get(), AFTER_RAN.get())
            })
        })
        .collect();

    for handle in handles {
        let (caught, marker, after) = handle.join().unwrap();
        assert_eq!(caught, vec![PAYLOAD]);
        assert_eq!(marker, 1);
        assert!(!after);
    }
}
