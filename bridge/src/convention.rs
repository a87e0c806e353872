//! Calling convention to libffi ABI resolution.

use libffi::raw::{ffi_abi, ffi_abi_FFI_DEFAULT_ABI};

use crate::types::Convention;

/// Native ABI for `convention` on the current target, or `None` when the
/// convention cannot be called here.
pub fn resolve(convention: Convention) -> Option<ffi_abi> {
    match convention {
        Convention::Custom => None,
        Convention::Cdecl => Some(ffi_abi_FFI_DEFAULT_ABI),
        Convention::ThisCall => Some(thiscall_abi()),
        Convention::StdCall => stdcall_abi(),
        Convention::FastCall => fastcall_abi(),
    }
}

#[cfg(target_arch = "x86")]
fn thiscall_abi() -> ffi_abi {
    libffi::raw::ffi_abi_FFI_THISCALL
}

// Elsewhere the receiver is an ordinary first argument.
#[cfg(not(target_arch = "x86"))]
fn thiscall_abi() -> ffi_abi {
    ffi_abi_FFI_DEFAULT_ABI
}

#[cfg(all(windows, target_arch = "x86"))]
fn stdcall_abi() -> Option<ffi_abi> {
    Some(libffi::raw::ffi_abi_FFI_STDCALL)
}

#[cfg(all(windows, target_arch = "x86"))]
fn fastcall_abi() -> Option<ffi_abi> {
    Some(libffi::raw::ffi_abi_FFI_FASTCALL)
}

// x64 Windows has a single convention; the keywords are accepted and ignored.
#[cfg(all(windows, not(target_arch = "x86")))]
fn stdcall_abi() -> Option<ffi_abi> {
    Some(ffi_abi_FFI_DEFAULT_ABI)
}

#[cfg(all(windows, not(target_arch = "x86")))]
fn fastcall_abi() -> Option<ffi_abi> {
    Some(ffi_abi_FFI_DEFAULT_ABI)
}

#[cfg(not(windows))]
fn stdcall_abi() -> Option<ffi_abi> {
    None
}

#[cfg(not(windows))]
fn fastcall_abi() -> Option<ffi_abi> {
    None
}
