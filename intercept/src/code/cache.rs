#[cfg(target_os = "macos")]
extern "C" {
    fn sys_icache_invalidate(addr: *mut core::ffi::c_void, size: usize);
    fn sys_dcache_flush(addr: *mut core::ffi::c_void, size: usize);
}

#[cfg(all(not(target_os = "macos"), target_arch = "aarch64"))]
extern "C" {
    fn __clear_cache(beg: *mut core::ffi::c_void, end: *mut core::ffi::c_void);
}

/// Make freshly written instructions visible to instruction fetch.
///
/// AArch64 caches are not coherent, so the data side is cleaned and the
/// instruction side invalidated. x86_64 needs nothing.
///
/// # Safety
/// `addr` must point to at least `size` mapped bytes.
#[inline]
pub unsafe fn invalidate_icache(addr: *mut u8, size: usize) {
    #[cfg(target_os = "macos")]
    {
        sys_dcache_flush(addr.cast(), size);
        sys_icache_invalidate(addr.cast(), size);
    }

    #[cfg(all(not(target_os = "macos"), target_arch = "aarch64"))]
    {
        __clear_cache(addr.cast(), addr.add(size).cast());
    }

    #[cfg(all(not(target_os = "macos"), not(target_arch = "aarch64")))]
    {
        let _ = (addr, size);
    }
}

/// Plain code address of a function pointer. On arm64e pointers carry a
/// PAC signature in the high bits.
#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
#[inline]
pub fn strip_code_ptr(ptr: usize) -> usize {
    let mut x = ptr as u64;
    // SAFETY: xpaci only clears bits in its operand.
    unsafe {
        core::arch::asm!("xpaci {0}", inout(reg) x, options(nomem, nostack, preserves_flags));
    }
    x as usize
}

#[cfg(not(all(target_arch = "aarch64", target_os = "macos")))]
#[inline]
pub fn strip_code_ptr(ptr: usize) -> usize {
    ptr
}
