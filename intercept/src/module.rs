//! Loaded-module enumeration and symbol lookup.

use crate::types::{HookError, ModuleInfo};

#[cfg(target_os = "linux")]
use core::ffi::c_void;
#[cfg(target_os = "linux")]
use std::ffi::{CStr, CString};

#[cfg(target_os = "linux")]
fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Enumerate all loaded shared objects via `dl_iterate_phdr`.
///
/// The main executable appears with the name of `/proc/self/exe`.
#[cfg(target_os = "linux")]
pub fn enumerate_modules() -> Vec<ModuleInfo> {
    unsafe extern "C" fn callback(info: *mut libc::dl_phdr_info, _size: libc::size_t, data: *mut c_void) -> libc::c_int {
        let modules = &mut *(data as *mut Vec<ModuleInfo>);
        let info = &*info;

        let path = if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
            std::fs::read_link("/proc/self/exe")
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
        };

        let load_bias = info.dlpi_addr as usize;
        let phdrs = core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        let loads = phdrs.iter().filter(|p| p.p_type == libc::PT_LOAD && p.p_memsz > 0);

        let mut lowest = usize::MAX;
        let mut highest = 0usize;
        let mut segments = Vec::new();
        for phdr in loads {
            let start = load_bias + phdr.p_vaddr as usize;
            let len = phdr.p_memsz as usize;
            lowest = lowest.min(start);
            highest = highest.max(start + len);
            if phdr.p_flags & libc::PF_R != 0 {
                segments.push((start, len));
            }
        }
        if lowest == usize::MAX {
            lowest = load_bias;
            highest = load_bias;
        }

        let name = if path.is_empty() { String::from("[unknown]") } else { basename(&path).to_string() };
        modules.push(ModuleInfo {
            name,
            path,
            base_address: lowest,
            size: highest - lowest,
            segments,
        });

        0
    }

    let mut modules: Vec<ModuleInfo> = Vec::new();
    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut modules as *mut Vec<ModuleInfo> as *mut c_void);
    }
    modules
}

#[cfg(not(target_os = "linux"))]
pub fn enumerate_modules() -> Vec<ModuleInfo> {
    Vec::new()
}

/// First loaded module whose name or path ends with `name`.
pub fn find_module_by_name(name: &str) -> Option<ModuleInfo> {
    enumerate_modules()
        .into_iter()
        .find(|m| m.name == name || m.path.ends_with(name))
}

/// Module whose loaded image contains `address`.
pub fn find_module_by_address(address: usize) -> Option<ModuleInfo> {
    enumerate_modules()
        .into_iter()
        .find(|m| (m.base_address..m.base_address + m.size).contains(&address))
}

/// Resolve a symbol across all loaded modules with `dlsym(RTLD_DEFAULT, ...)`.
#[cfg(target_os = "linux")]
pub fn find_global_export_by_name(symbol: &str) -> Result<usize, HookError> {
    let cstr = CString::new(symbol).map_err(|_| HookError::SymbolNotFound(symbol.to_string()))?;
    let p = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cstr.as_ptr()) };
    if p.is_null() {
        Err(HookError::SymbolNotFound(symbol.to_string()))
    } else {
        Ok(p as usize)
    }
}

#[cfg(not(target_os = "linux"))]
pub fn find_global_export_by_name(_symbol: &str) -> Result<usize, HookError> {
    Err(HookError::Unsupported)
}

/// Resolve a symbol within one already loaded module using
/// `dlopen(RTLD_NOLOAD) + dlsym`.
#[cfg(target_os = "linux")]
pub fn find_export_by_name(module_name: &str, symbol: &str) -> Result<usize, HookError> {
    let not_found = || HookError::SymbolNotFound(format!("{module_name}!{symbol}"));
    let module = find_module_by_name(module_name).ok_or_else(not_found)?;
    let sym = CString::new(symbol).map_err(|_| not_found())?;

    for path in [&module.path, &module.name] {
        let Ok(path) = CString::new(path.as_str()) else { continue };
        unsafe {
            let handle = libc::dlopen(path.as_ptr(), libc::RTLD_NOLOAD | libc::RTLD_NOW);
            if handle.is_null() {
                continue;
            }
            let p = libc::dlsym(handle, sym.as_ptr());
            libc::dlclose(handle);
            if !p.is_null() {
                return Ok(p as usize);
            }
        }
    }

    Err(not_found())
}

#[cfg(not(target_os = "linux"))]
pub fn find_export_by_name(_module_name: &str, _symbol: &str) -> Result<usize, HookError> {
    Err(HookError::Unsupported)
}
