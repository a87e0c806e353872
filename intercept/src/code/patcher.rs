use crate::types::HookError;

/// Make the pages covering `[addr, addr + size)` writable, run `apply`, and
/// flip them back to RX.
///
/// The pages stay executable (RWX) while `apply` runs so other code sharing
/// the page keeps working on other threads.
///
/// # Safety
/// `addr..addr + size` must be mapped code that no thread is executing
/// through the bytes being rewritten.
#[cfg(unix)]
pub unsafe fn patch_code(addr: *mut u8, size: usize, apply: impl FnOnce(*mut u8)) -> Result<(), HookError> {
    if size == 0 {
        return Ok(());
    }

    let page_sz = libc::sysconf(libc::_SC_PAGESIZE) as usize;
    let page_start = (addr as usize) & !(page_sz - 1);
    let page_end = ((addr as usize) + size + page_sz - 1) & !(page_sz - 1);
    let map_size = page_end - page_start;

    if libc::mprotect(
        page_start as *mut libc::c_void,
        map_size,
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
    ) != 0
    {
        return Err(HookError::ProtectionFailed(addr as usize));
    }

    apply(addr);

    if libc::mprotect(
        page_start as *mut libc::c_void,
        map_size,
        libc::PROT_READ | libc::PROT_EXEC,
    ) != 0
    {
        log::warn!("left {:#x} writable after patching", page_start);
    }

    // x86_64 keeps the I-cache coherent with stores, no flush needed.
    Ok(())
}

#[cfg(not(unix))]
pub unsafe fn patch_code(addr: *mut u8, size: usize, apply: impl FnOnce(*mut u8)) -> Result<(), HookError> {
    let _ = (addr, size, apply);
    Err(HookError::Unsupported)
}

/// Overwrite `bytes.len()` bytes at `addr`.
///
/// # Safety
/// See [`patch_code`].
pub unsafe fn write_code(addr: *mut u8, bytes: &[u8]) -> Result<(), HookError> {
    patch_code(addr, bytes.len(), |p| {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), p, bytes.len());
    })
}
