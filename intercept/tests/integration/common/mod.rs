//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard, Once};

use relay_intercept::code::allocator::CodeAllocator;
use relay_intercept::code::cache::invalidate_icache;
use relay_intercept::Function;

static LOGGER: Once = Once::new();

/// Route `log` output through the test harness. Set `RUST_LOG=debug` to see it.
pub fn setup() {
    LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Serializes tests that patch code or reclaim retired stubs.
pub fn lock() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

pub type AddFn = extern "C-unwind" fn(u64) -> u64;

/// Place `code` in a fresh executable slab and return its address.
pub fn emit_code(code: &[u8]) -> *const () {
    let alloc = CodeAllocator::default();
    let mut slice = alloc.alloc_any().expect("alloc code");
    unsafe {
        slice.as_mut_slice()[..code.len()].copy_from_slice(code);
        alloc.make_executable(&slice).expect("make executable");
    }
    // Leaked: targets live for the whole test binary.
    slice.data as *const ()
}

#[cfg(target_arch = "aarch64")]
fn words(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Machine code computing `x + k` behind a frame-pointer prologue, padded
/// so any entry patch covers only straight-line instructions.
pub fn add_const_code(k: u32) -> Vec<u8> {
    #[cfg(target_arch = "x86_64")]
    let code = {
        // push rbp; mov rbp, rsp; mov rax, rdi; add rax, imm32
        let mut code = vec![0x55, 0x48, 0x89, 0xE5, 0x48, 0x89, 0xF8, 0x48, 0x05];
        code.extend_from_slice(&k.to_le_bytes());
        code.extend_from_slice(&[0x90; 16]);
        // pop rbp; ret
        code.extend_from_slice(&[0x5D, 0xC3]);
        code
    };
    #[cfg(target_arch = "aarch64")]
    let code = {
        assert!(k < 4096);
        words(&[
            0xA9BF_7BFD,             // stp x29, x30, [sp, #-16]!
            0x9100_03FD,             // mov x29, sp
            0x9100_0000 | (k << 10), // add x0, x0, #k
            0xD503_201F,
            0xD503_201F,
            0xD503_201F,
            0xD503_201F,
            0xA8C1_7BFD, // ldp x29, x30, [sp], #16
            0xD65F_03C0, // ret
        ])
    };
    let mut padded = code;
    padded.resize(64, 0);
    padded
}

pub fn make_add_const(k: u32) -> AddFn {
    unsafe { AddFn::from_ptr(emit_code(&add_const_code(k))) }
}

/// Place `code` on a page mapped exactly at one of `hints`, or `None` if
/// every hint is taken.
pub fn emit_code_at(hints: &[usize], code: &[u8]) -> Option<*const ()> {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    for &hint in hints {
        unsafe {
            let ptr = libc::mmap(
                hint as *mut libc::c_void,
                page,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                continue;
            }
            if ptr as usize != hint {
                libc::munmap(ptr, page);
                continue;
            }
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr as *mut u8, code.len());
            assert_eq!(libc::mprotect(ptr, page, libc::PROT_READ | libc::PROT_EXEC), 0);
            invalidate_icache(ptr as *mut u8, code.len());
            return Some(ptr as *const ());
        }
    }
    None
}

/// Place `code` so it ends exactly where an inaccessible page begins.
pub fn emit_code_at_page_end(code: &[u8]) -> *const () {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    unsafe {
        let base = libc::mmap(
            std::ptr::null_mut(),
            2 * page,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        assert_ne!(base, libc::MAP_FAILED);
        let guard = (base as *mut u8).add(page);
        assert_eq!(libc::mprotect(guard.cast(), page, libc::PROT_NONE), 0);

        let at = guard.sub(code.len());
        std::ptr::copy_nonoverlapping(code.as_ptr(), at, code.len());
        assert_eq!(libc::mprotect(base, page, libc::PROT_READ | libc::PROT_EXEC), 0);
        invalidate_icache(at, code.len());
        at as *const ()
    }
}

/// `x + k` with no padding: the last byte is the `ret`, except on x86_64
/// where the tail a relocated instruction may overhang is left as `int3`.
pub fn make_short_add_const(k: u32) -> AddFn {
    #[cfg(target_arch = "x86_64")]
    let code = {
        // push rbp; mov rbp, rsp; mov rax, rdi; add rax, imm32; pop rbp; ret
        let mut code = vec![0x55, 0x48, 0x89, 0xE5, 0x48, 0x89, 0xF8, 0x48, 0x05];
        code.extend_from_slice(&k.to_le_bytes());
        code.extend_from_slice(&[0x5D, 0xC3]);
        // A 5-byte patch plus the longest instruction tail.
        code.resize(5 + 14, 0xCC);
        code
    };
    #[cfg(target_arch = "aarch64")]
    let code = {
        assert!(k < 4096);
        words(&[
            0xA9BF_7BFD,
            0x9100_03FD,
            0x9100_0000 | (k << 10),
            0xA8C1_7BFD,
            0xD65F_03C0,
        ])
    };
    unsafe { AddFn::from_ptr(emit_code_at_page_end(&code)) }
}

/// A function whose first instruction is a call, which cannot be moved.
pub fn make_calling_prologue() -> AddFn {
    #[cfg(target_arch = "x86_64")]
    let mut code = {
        // call +16; ret; padding
        let mut code = vec![0xE8, 0x10, 0x00, 0x00, 0x00, 0xC3];
        code.extend_from_slice(&[0x90; 16]);
        code.push(0xC3);
        code
    };
    #[cfg(target_arch = "aarch64")]
    let mut code = words(&[
        0x9400_0004, // bl +16
        0xD503_201F,
        0xD503_201F,
        0xD65F_03C0,
        0xD65F_03C0,
    ]);
    code.resize(64, 0);
    unsafe { AddFn::from_ptr(emit_code(&code)) }
}

pub fn entry_bytes(f: AddFn, len: usize) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(f.to_ptr() as *const u8, len).to_vec() }
}
