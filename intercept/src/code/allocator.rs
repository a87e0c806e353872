use crate::types::HookError;

/// A page-aligned slab of memory handed out by [`CodeAllocator`].
///
/// Slabs start read-write so code can be emitted into them; call
/// [`CodeAllocator::make_executable`] before jumping into one. Slabs that
/// back a prepared hook are never unmapped: a wrapper or trampoline may still
/// be executing on another thread after its hook has been removed.
#[derive(Debug)]
pub struct CodeSlice {
    pub data: *mut u8,
    pub pc: *const u8,
    pub size: usize,
}

unsafe impl Send for CodeSlice {}
unsafe impl Sync for CodeSlice {}

impl CodeSlice {
    /// Copy `code` to the start of the slab.
    ///
    /// # Safety
    /// The slab must still be writable.
    pub unsafe fn write(&self, code: &[u8]) -> Result<(), HookError> {
        if code.len() > self.size {
            return Err(HookError::AllocationFailed);
        }
        core::ptr::copy_nonoverlapping(code.as_ptr(), self.data, code.len());
        Ok(())
    }
}

#[derive(Debug)]
pub struct CodeAllocator {
    slab_size: usize,
}

impl Default for CodeAllocator {
    fn default() -> Self {
        Self { slab_size: 4096 }
    }
}

impl CodeAllocator {
    pub fn new(slab_size: usize) -> Self {
        Self { slab_size: slab_size.max(4096) }
    }

    /// Allocate a slab within `max_distance` bytes of `near`, so rel32 jumps
    /// and RIP-relative operands can reach between the two.
    ///
    /// Falls back to [`alloc_any`](Self::alloc_any) when no gap in range is
    /// free; callers must check the distance themselves.
    pub fn alloc_near(&mut self, near: *const u8, max_distance: usize) -> Result<CodeSlice, HookError> {
        #[cfg(target_os = "linux")]
        unsafe {
            if let Some(slice) = self.alloc_in_gap(near as usize, max_distance) {
                return Ok(slice);
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            let _ = (near, max_distance);
        }

        self.alloc_any()
    }

    /// Walk `/proc/self/maps` for an unmapped gap inside the window around `near`.
    #[cfg(target_os = "linux")]
    unsafe fn alloc_in_gap(&self, near: usize, max_distance: usize) -> Option<CodeSlice> {
        let page_sz = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let need = self.slab_size;

        let win_start = near.saturating_sub(max_distance) & !(page_sz - 1);
        let win_end = near.saturating_add(max_distance) & !(page_sz - 1);

        let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
        let mut regions: Vec<(usize, usize)> = Vec::new();
        for line in maps.lines() {
            let Some(range) = line.split_whitespace().next() else { continue };
            let Some((start_s, end_s)) = range.split_once('-') else { continue };
            let Ok(start) = usize::from_str_radix(start_s, 16) else { continue };
            let Ok(end) = usize::from_str_radix(end_s, 16) else { continue };
            regions.push((start, end));
        }
        regions.sort_by_key(|&(s, _)| s);

        // Gaps between consecutive regions, then the tail after the last one.
        let mut gaps: Vec<(usize, usize)> = Vec::new();
        let mut prev_end = win_start;
        for &(region_start, region_end) in &regions {
            if region_start > win_end {
                break;
            }
            if region_start > prev_end {
                gaps.push((prev_end, region_start.min(win_end)));
            }
            prev_end = prev_end.max(region_end);
        }
        if prev_end < win_end {
            gaps.push((prev_end, win_end));
        }

        for (gap_start, gap_end) in gaps {
            if gap_end <= gap_start || gap_end - gap_start < need {
                continue;
            }
            let candidate = near.clamp(gap_start, gap_end - need) & !(page_sz - 1);
            if candidate < gap_start {
                continue;
            }
            let ptr = libc::mmap(
                candidate as *mut libc::c_void,
                need,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            );
            if ptr != libc::MAP_FAILED {
                return Some(CodeSlice {
                    data: ptr as *mut u8,
                    pc: ptr as *const u8,
                    size: need,
                });
            }
        }

        None
    }

    pub fn alloc_any(&mut self) -> Result<CodeSlice, HookError> {
        #[cfg(unix)]
        unsafe {
            let ptr = libc::mmap(
                core::ptr::null_mut(),
                self.slab_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(HookError::AllocationFailed);
            }
            Ok(CodeSlice {
                data: ptr as *mut u8,
                pc: ptr as *const u8,
                size: self.slab_size,
            })
        }

        #[cfg(not(unix))]
        {
            Err(HookError::Unsupported)
        }
    }

    /// Unmap a slab that never became reachable, e.g. when hook preparation
    /// fails halfway.
    ///
    /// # Safety
    /// No code may be executing in, or jump into, `slice`.
    pub unsafe fn release(&self, slice: CodeSlice) {
        #[cfg(unix)]
        {
            if libc::munmap(slice.data as *mut libc::c_void, slice.size) != 0 {
                log::warn!("failed to unmap code slab at {:#x}", slice.data as usize);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = slice;
        }
    }

    /// Flip a slab from RW to RX.
    ///
    /// # Safety
    /// `slice` must come from this allocator and nothing may still be writing to it.
    pub unsafe fn make_executable(&self, slice: &CodeSlice) -> Result<(), HookError> {
        #[cfg(unix)]
        {
            if libc::mprotect(
                slice.data as *mut libc::c_void,
                slice.size,
                libc::PROT_READ | libc::PROT_EXEC,
            ) != 0
            {
                return Err(HookError::ProtectionFailed(slice.data as usize));
            }
            Ok(())
        }

        #[cfg(not(unix))]
        {
            let _ = slice;
            Err(HookError::Unsupported)
        }
    }
}
