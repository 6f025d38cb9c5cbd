use crate::error::{DetourError, Result};

/// A writable, later executable, mapping owned by one trampoline.
#[derive(Debug)]
pub struct CodeSlice {
    pub data: *mut u8,
    pub size: usize,
}

unsafe impl Send for CodeSlice {}
unsafe impl Sync for CodeSlice {}

impl CodeSlice {
    /// Address the code executes at.
    pub fn pc(&self) -> u64 {
        self.data as u64
    }

    /// # Safety
    /// The slice must still be mapped writable and not executing.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.data, self.size)
    }

    pub fn contains(&self, addr: usize) -> bool {
        (self.data as usize..self.data as usize + self.size).contains(&addr)
    }
}

pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

/// Candidate page-aligned start addresses for a `need`-byte mapping within
/// `max_distance` of `near`, given the sorted occupied `regions`. Closest
/// candidates come first.
pub(crate) fn gap_candidates(
    regions: &[(usize, usize)],
    near: usize,
    max_distance: usize,
    need: usize,
    page: usize,
) -> Vec<usize> {
    let win_start = near.saturating_sub(max_distance).next_multiple_of(page).max(page);
    let win_end = near.saturating_add(max_distance) & !(page - 1);

    let mut out = Vec::new();
    let mut consider = |gap_start: usize, gap_end: usize| {
        let gap_start = gap_start.max(win_start).next_multiple_of(page);
        let gap_end = gap_end.min(win_end);
        if gap_end > gap_start && gap_end - gap_start >= need {
            out.push(near.clamp(gap_start, gap_end - need) & !(page - 1));
        }
    };

    let mut prev_end = win_start;
    for &(start, end) in regions {
        if start > win_end {
            break;
        }
        if start > prev_end {
            consider(prev_end, start);
        }
        prev_end = prev_end.max(end);
    }
    consider(prev_end, win_end);

    out.sort_by_key(|&c| c.abs_diff(near));
    out
}

#[derive(Debug)]
pub struct CodeAllocator {
    slab_size: usize,
}

impl Default for CodeAllocator {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl CodeAllocator {
    /// Mappings are rounded up to whole pages.
    pub fn new(slab_size: usize) -> Self {
        Self { slab_size: slab_size.max(1).next_multiple_of(page_size()) }
    }

    pub fn slab_size(&self) -> usize {
        self.slab_size
    }

    /// Map a slab with every byte within `max_distance` of `near`, or fail.
    pub fn alloc_near(&self, near: *const u8, max_distance: usize) -> Result<CodeSlice> {
        #[cfg(target_os = "macos")]
        unsafe {
            use mach2::kern_return::KERN_SUCCESS;
            use mach2::traps::mach_task_self;
            use mach2::vm::{mach_vm_allocate, mach_vm_region};
            use mach2::vm_region::{vm_region_basic_info_64, vm_region_info_t, VM_REGION_BASIC_INFO_64};
            use mach2::vm_statistics::VM_FLAGS_FIXED;
            use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

            let task = mach_task_self();
            let page = page_size();
            let near_u = near as usize;
            let win_end = near_u.saturating_add(max_distance);

            let mut regions = Vec::new();
            let mut addr: mach_vm_address_t = near_u.saturating_sub(max_distance) as u64;
            while (addr as usize) < win_end {
                let mut region_addr = addr;
                let mut region_size: mach_vm_size_t = 0;
                let mut info: vm_region_basic_info_64 = core::mem::zeroed();
                let mut info_count = vm_region_basic_info_64::count();
                let mut object_name: u32 = 0;
                let kr = mach_vm_region(
                    task,
                    &mut region_addr,
                    &mut region_size,
                    VM_REGION_BASIC_INFO_64,
                    (&mut info as *mut vm_region_basic_info_64) as vm_region_info_t,
                    &mut info_count,
                    &mut object_name,
                );
                if kr != KERN_SUCCESS {
                    break;
                }
                let end = region_addr.saturating_add(region_size);
                regions.push((region_addr as usize, end as usize));
                addr = end;
            }

            for candidate in gap_candidates(&regions, near_u, max_distance, self.slab_size, page) {
                let mut out = candidate as mach_vm_address_t;
                if mach_vm_allocate(task, &mut out, self.slab_size as u64, VM_FLAGS_FIXED) == KERN_SUCCESS {
                    return Ok(CodeSlice { data: out as *mut u8, size: self.slab_size });
                }
            }
            Err(DetourError::AllocationFailed)
        }

        #[cfg(target_os = "linux")]
        unsafe {
            let maps = std::fs::read_to_string("/proc/self/maps")
                .map_err(|_| DetourError::AllocationFailed)?;
            let mut regions: Vec<(usize, usize)> = maps
                .lines()
                .filter_map(|line| {
                    let (start, end) = line.split_whitespace().next()?.split_once('-')?;
                    Some((usize::from_str_radix(start, 16).ok()?, usize::from_str_radix(end, 16).ok()?))
                })
                .collect();
            regions.sort_unstable();

            let near_u = near as usize;
            for candidate in gap_candidates(&regions, near_u, max_distance, self.slab_size, page_size()) {
                let ptr = libc::mmap(
                    candidate as *mut libc::c_void,
                    self.slab_size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                    -1,
                    0,
                );
                if ptr == libc::MAP_FAILED {
                    continue;
                }
                // Kernels before 4.17 ignore the NOREPLACE bit and may place
                // the mapping elsewhere.
                if ptr as usize != candidate {
                    libc::munmap(ptr, self.slab_size);
                    continue;
                }
                return Ok(CodeSlice { data: ptr as *mut u8, size: self.slab_size });
            }
            Err(DetourError::AllocationFailed)
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            let _ = (near, max_distance);
            Err(DetourError::AllocationFailed)
        }
    }

    /// Map a slab anywhere.
    pub fn alloc_any(&self) -> Result<CodeSlice> {
        #[cfg(target_os = "macos")]
        unsafe {
            use mach2::kern_return::KERN_SUCCESS;
            use mach2::traps::mach_task_self;
            use mach2::vm::mach_vm_allocate;
            use mach2::vm_statistics::VM_FLAGS_ANYWHERE;

            let mut addr: u64 = 0;
            let kr = mach_vm_allocate(mach_task_self(), &mut addr, self.slab_size as u64, VM_FLAGS_ANYWHERE);
            if kr != KERN_SUCCESS {
                return Err(DetourError::AllocationFailed);
            }
            Ok(CodeSlice { data: addr as *mut u8, size: self.slab_size })
        }

        #[cfg(all(unix, not(target_os = "macos")))]
        unsafe {
            let ptr = libc::mmap(
                core::ptr::null_mut(),
                self.slab_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(DetourError::AllocationFailed);
            }
            Ok(CodeSlice { data: ptr as *mut u8, size: self.slab_size })
        }

        #[cfg(not(unix))]
        {
            Err(DetourError::Unsupported)
        }
    }

    /// Flip a slab from RW to RX and make the new instructions visible.
    ///
    /// # Safety
    /// `slice` must come from this allocator and not have been freed.
    pub unsafe fn make_executable(&self, slice: &CodeSlice) -> Result<()> {
        #[cfg(target_os = "macos")]
        {
            use mach2::kern_return::KERN_SUCCESS;
            use mach2::traps::mach_task_self;
            use mach2::vm::mach_vm_protect;
            use mach2::vm_prot::{VM_PROT_EXECUTE, VM_PROT_READ};

            let kr = mach_vm_protect(
                mach_task_self(),
                slice.data as u64,
                slice.size as u64,
                0,
                VM_PROT_READ | VM_PROT_EXECUTE,
            );
            if kr != KERN_SUCCESS {
                return Err(DetourError::ProtectionFailed(kr));
            }
        }

        #[cfg(all(unix, not(target_os = "macos")))]
        {
            if libc::mprotect(slice.data as *mut libc::c_void, slice.size, libc::PROT_READ | libc::PROT_EXEC) != 0 {
                return Err(DetourError::ProtectionFailed(
                    std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
                ));
            }
        }

        crate::code::cache::invalidate_icache(slice.data, slice.size);
        Ok(())
    }

    /// Unmap a slab.
    ///
    /// # Safety
    /// No thread may be executing in, or about to return into, `slice`.
    pub unsafe fn free(&self, slice: CodeSlice) {
        #[cfg(target_os = "macos")]
        {
            use mach2::traps::mach_task_self;
            use mach2::vm::mach_vm_deallocate;
            mach_vm_deallocate(mach_task_self(), slice.data as u64, slice.size as u64);
        }

        #[cfg(all(unix, not(target_os = "macos")))]
        {
            libc::munmap(slice.data as *mut libc::c_void, slice.size);
        }

        #[cfg(not(unix))]
        {
            let _ = slice;
        }
    }
}
