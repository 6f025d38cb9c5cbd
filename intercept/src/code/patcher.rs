use log::debug;

use crate::code::allocator::page_size;
use crate::code::cache::invalidate_icache;
use crate::error::{DetourError, Result};

fn page_span(addr: usize, len: usize) -> (usize, usize) {
    let page = page_size();
    let start = addr & !(page - 1);
    let end = (addr + len).next_multiple_of(page);
    (start, end - start)
}

#[cfg(target_os = "macos")]
mod darwin {
    use super::*;

    use mach2::boolean::boolean_t;
    use mach2::kern_return::{kern_return_t, KERN_SUCCESS};
    use mach2::message::mach_msg_type_number_t;
    use mach2::traps::mach_task_self;
    use mach2::vm::{mach_vm_deallocate, mach_vm_protect, mach_vm_write};
    use mach2::vm_inherit::{vm_inherit_t, VM_INHERIT_NONE};
    use mach2::vm_prot::{vm_prot_t, VM_PROT_COPY, VM_PROT_READ, VM_PROT_WRITE};
    use mach2::vm_statistics::VM_FLAGS_ANYWHERE;
    use mach2::vm_types::{vm_address_t, vm_map_t, vm_offset_t, vm_size_t};

    extern "C" {
        fn vm_remap(
            target_task: vm_map_t,
            target_address: *mut vm_address_t,
            size: vm_size_t,
            mask: vm_address_t,
            flags: libc::c_int,
            src_task: vm_map_t,
            src_address: vm_address_t,
            copy: boolean_t,
            cur_protection: *mut vm_prot_t,
            max_protection: *mut vm_prot_t,
            inheritance: vm_inherit_t,
        ) -> kern_return_t;
    }

    /// Write through a second, writable mapping of the same pages so the
    /// executable mapping never loses its protection or code signature.
    unsafe fn write_through_alias(addr: *mut u8, bytes: &[u8]) -> core::result::Result<(), kern_return_t> {
        let task = mach_task_self();
        let (start, size) = page_span(addr as usize, bytes.len());

        let mut alias: vm_address_t = 0;
        let mut cur: vm_prot_t = 0;
        let mut max: vm_prot_t = 0;
        let kr = vm_remap(
            task,
            &mut alias,
            size as vm_size_t,
            0,
            VM_FLAGS_ANYWHERE,
            task,
            start as vm_address_t,
            0,
            &mut cur,
            &mut max,
            VM_INHERIT_NONE,
        );
        if kr != KERN_SUCCESS {
            return Err(kr);
        }

        let mut kr = mach_vm_protect(task, alias as u64, size as u64, 0, VM_PROT_READ | VM_PROT_WRITE);
        if kr != KERN_SUCCESS {
            kr = mach_vm_protect(task, alias as u64, size as u64, 0, VM_PROT_READ | VM_PROT_WRITE | VM_PROT_COPY);
        }
        if kr == KERN_SUCCESS {
            let dst = (alias as usize + (addr as usize - start)) as *mut u8;
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
        mach_vm_deallocate(task, alias as u64, size as u64);
        if kr != KERN_SUCCESS {
            return Err(kr);
        }
        Ok(())
    }

    pub unsafe fn patch_code(addr: *mut u8, bytes: &[u8]) -> Result<()> {
        match write_through_alias(addr, bytes) {
            Ok(()) => {
                invalidate_icache(addr, bytes.len());
                return Ok(());
            }
            Err(kr) => debug!("writable alias for {:#x} failed: kr={kr}", addr as usize),
        }

        let kr = mach_vm_write(
            mach_task_self(),
            addr as u64,
            bytes.as_ptr() as vm_offset_t,
            bytes.len() as mach_msg_type_number_t,
        );
        if kr == KERN_SUCCESS {
            invalidate_icache(addr, bytes.len());
            return Ok(());
        }
        debug!("mach_vm_write at {:#x} failed: kr={kr}", addr as usize);

        super::patch_with_mprotect(addr, bytes)
    }
}

unsafe fn patch_with_mprotect(addr: *mut u8, bytes: &[u8]) -> Result<()> {
    let (start, size) = page_span(addr as usize, bytes.len());

    // RWX so other code sharing the page keeps running while we write.
    if libc::mprotect(start as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) != 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(-1);
        debug!("mprotect RWX at {start:#x}+{size:#x} failed: errno={errno}");
        return Err(DetourError::ProtectionFailed(errno));
    }

    core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr, bytes.len());

    libc::mprotect(start as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_EXEC);
    // Whole pages: neighbours patched separately must not see stale lines.
    invalidate_icache(start as *mut u8, size);
    Ok(())
}

/// Overwrite executable code at `addr` with `bytes`.
///
/// # Safety
/// `addr` must point to `bytes.len()` bytes of mapped code, and no thread
/// may be executing the instructions being replaced.
pub unsafe fn patch_code(addr: *mut u8, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    #[cfg(target_os = "macos")]
    {
        darwin::patch_code(addr, bytes)
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        patch_with_mprotect(addr, bytes)
    }
    #[cfg(not(unix))]
    {
        let _ = addr;
        Err(DetourError::Unsupported)
    }
}
