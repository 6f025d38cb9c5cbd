//! Argument and return value forwarding through framed trampolines.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use relay_intercept::abi::{ArgType, AbiReturn, AbiType, ReturnClass};
use relay_intercept::probe::exception_in_flight;
use relay_intercept::{DetourError, Forwarder, Trampoline};

use crate::common::setup;

extern "C" fn add(a: i64, b: i64) -> i64 {
    a + b
}

extern "C" fn blend(a: f64, b: f32, n: i32, c: f64) -> f64 {
    a * b as f64 + n as f64 * c
}

#[allow(clippy::too_many_arguments)]
extern "C-unwind" fn weighted(a: i64, b: i64, c: i64, d: i64, e: i64, f: i64, g: i64, h: i64, i: i64, j: i64) -> i64 {
    if j < 0 {
        panic!("negative weight {j}");
    }
    a + 2 * b + 3 * c + 4 * d + 5 * e + 6 * f + 7 * g + 8 * h + 9 * i + 10 * j
}

#[allow(clippy::too_many_arguments)]
extern "C" fn floats(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64, g: f64, h: f64, i: f64, j: f64) -> f64 {
    a - b + c - d + e - f + g - h + i * 100.0 + j * 1000.0
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Quad([u64; 4]);

unsafe impl AbiType for Quad {
    const ARG: ArgType = ArgType::aggregate_of::<Quad>();
}

unsafe impl AbiReturn for Quad {
    const RET: ReturnClass = ReturnClass::Indirect;
}

extern "C" fn sum_quad(tag: u64, q: Quad) -> u64 {
    tag * 1000 + q.0.iter().sum::<u64>()
}

extern "C" fn make_quad(base: u64) -> Quad {
    Quad([base, base + 1, base + 2, base + 3])
}

type Add = extern "C" fn(i64, i64) -> i64;
type Blend = extern "C" fn(f64, f32, i32, f64) -> f64;
type Weighted = extern "C-unwind" fn(i64, i64, i64, i64, i64, i64, i64, i64, i64, i64) -> i64;
type Floats = extern "C" fn(f64, f64, f64, f64, f64, f64, f64, f64, f64, f64) -> f64;

#[test]
fn integers_match_the_direct_call() {
    setup();
    let fwd = Forwarder::new(add as Add).unwrap();
    for (a, b) in [(0, 0), (1, -1), (i64::MAX, 0), (-40, -2)] {
        assert!(!exception_in_flight());
        assert_eq!(unsafe { fwd.call((a, b)) }, add(a, b));
        assert!(!exception_in_flight());
    }
}

#[test]
fn mixed_float_and_integer_arguments() {
    setup();
    let fwd = Forwarder::new(blend as Blend).unwrap();
    assert_eq!((fwd.entry())(1.5, 2.0, 3, 0.25), blend(1.5, 2.0, 3, 0.25));
}

#[test]
fn stack_spilled_integers() {
    setup();
    let fwd = Forwarder::new(weighted as Weighted).unwrap();
    let layout = fwd.trampoline().layout().copied().unwrap();
    assert!(layout.stack_bytes > 0);
    assert_eq!(
        (fwd.entry())(1, 2, 3, 4, 5, 6, 7, 8, 9, 10),
        weighted(1, 2, 3, 4, 5, 6, 7, 8, 9, 10)
    );
}

#[test]
fn stack_spilled_floats() {
    setup();
    let fwd = Forwarder::new(floats as Floats).unwrap();
    let got = (fwd.entry())(1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0);
    assert_eq!(got, floats(1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0));
}

#[test]
fn large_aggregate_by_value() {
    setup();
    let fwd = Forwarder::new(sum_quad as extern "C" fn(u64, Quad) -> u64).unwrap();
    assert_eq!((fwd.entry())(7, Quad([1, 2, 3, 4])), 7010);
}

#[test]
fn indirect_return() {
    setup();
    let fwd = Forwarder::new(make_quad as extern "C" fn(u64) -> Quad).unwrap();
    assert!(fwd.trampoline().layout().unwrap().indirect_return);
    assert_eq!((fwd.entry())(40), Quad([40, 41, 42, 43]));
}

#[test]
fn panic_with_stack_arguments_unwinds_cleanly() {
    setup();
    let fwd = Forwarder::new(weighted as Weighted).unwrap();
    let err = panic::catch_unwind(AssertUnwindSafe(|| (fwd.entry())(1, 2, 3, 4, 5, 6, 7, 8, 9, -1))).unwrap_err();
    assert_eq!(err.downcast_ref::<String>().map(String::as_str), Some("negative weight -1"));
    assert_eq!(fwd.in_flight(), 0);
    // The stub still works after an unwind went through it.
    assert_eq!((fwd.entry())(0, 0, 0, 0, 0, 0, 0, 0, 0, 1), 10);
}

#[test]
fn nested_forwarders_unwind_through_both() {
    setup();
    let inner = Forwarder::new(weighted as Weighted).unwrap();
    let outer = Forwarder::new(inner.entry()).unwrap();
    assert_eq!((outer.entry())(1, 0, 0, 0, 0, 0, 0, 0, 0, 0), 1);

    let err = panic::catch_unwind(AssertUnwindSafe(|| (outer.entry())(0, 0, 0, 0, 0, 0, 0, 0, 0, -5))).unwrap_err();
    assert!(err.downcast_ref::<String>().is_some());
    assert_eq!(inner.in_flight(), 0);
    assert_eq!(outer.in_flight(), 0);
}

static COUNTED: OnceLock<Forwarder<extern "C-unwind" fn() -> usize>> = OnceLock::new();

extern "C-unwind" fn observe_in_flight() -> usize {
    COUNTED.get().map_or(0, Forwarder::in_flight)
}

#[test]
fn counter_tracks_calls_inside_the_stub() {
    setup();
    let fwd = COUNTED.get_or_init(|| Forwarder::new(observe_in_flight as extern "C-unwind" fn() -> usize).unwrap());
    assert!((fwd.entry())() >= 1);
    assert!(fwd.trampoline().wait_quiescent(std::time::Duration::from_secs(1)));
}

#[test]
fn shared_forwarder_across_threads() {
    setup();
    let fwd = Arc::new(Forwarder::new(add as Add).unwrap());
    let total = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let fwd = Arc::clone(&fwd);
            let total = Arc::clone(&total);
            std::thread::spawn(move || {
                for i in 0..1000 {
                    let v = (fwd.entry())(t, i);
                    total.fetch_add(v as usize, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let expected: i64 = (0..8).map(|t| (0..1000).map(|i| t + i).sum::<i64>()).sum();
    assert_eq!(total.load(Ordering::Relaxed), expected as usize);
    assert_eq!(fwd.in_flight(), 0);
}

#[test]
fn tail_trampoline_forwards_without_a_frame() {
    setup();
    let tail = Trampoline::tail(add as *const ()).unwrap();
    let f: Add = unsafe { std::mem::transmute(tail.entry()) };
    assert_eq!(f(20, 22), 42);
    assert_eq!(tail.in_flight(), 0);
}

#[test]
fn unsupported_signatures_fail_at_construction() {
    setup();
    #[repr(C)]
    #[derive(Clone, Copy)]
    struct Pair(u64, u64);
    unsafe impl AbiType for Pair {
        const ARG: ArgType = ArgType::aggregate_of::<Pair>();
    }
    extern "C" fn takes_pair(_: Pair) {}

    let err = Forwarder::new(takes_pair as extern "C" fn(Pair)).unwrap_err();
    assert!(matches!(err, DetourError::UnsupportedSignature(_)));
}
