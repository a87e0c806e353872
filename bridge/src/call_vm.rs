//! The process-wide native call context.
//!
//! Arguments are staged on a single [`CallVm`] and then issued as one libffi
//! call. Every use goes through [`CallVm::acquire`], which serializes callers
//! across threads and refuses same-thread re-entry (a hooked native called
//! while the context is held would otherwise deadlock on the mutex).

use core::cell::Cell;
use core::ffi::{c_long, c_ulong, c_void};
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

use libffi::middle::{Arg, Cif, CodePtr, Type};
use libffi::raw::{ffi_abi, ffi_abi_FFI_DEFAULT_ABI};

use crate::error::BridgeError;

/// One staged argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeArg {
    Bool(bool),
    Char(i8),
    UChar(u8),
    Short(i16),
    UShort(u16),
    Int(i32),
    UInt(u32),
    Long(c_long),
    ULong(c_ulong),
    LongLong(i64),
    ULongLong(u64),
    Float(f32),
    Double(f64),
    Pointer(*const c_void),
}

impl NativeArg {
    fn ffi_type(&self) -> Type {
        match self {
            NativeArg::Bool(_) | NativeArg::UChar(_) => Type::u8(),
            NativeArg::Char(_) => Type::i8(),
            NativeArg::Short(_) => Type::i16(),
            NativeArg::UShort(_) => Type::u16(),
            NativeArg::Int(_) => Type::i32(),
            NativeArg::UInt(_) => Type::u32(),
            NativeArg::Long(_) => Type::c_long(),
            NativeArg::ULong(_) => Type::c_ulong(),
            NativeArg::LongLong(_) => Type::i64(),
            NativeArg::ULongLong(_) => Type::u64(),
            NativeArg::Float(_) => Type::f32(),
            NativeArg::Double(_) => Type::f64(),
            NativeArg::Pointer(_) => Type::pointer(),
        }
    }

    fn as_arg(&self) -> Arg {
        match self {
            // C `bool` is one byte holding 0 or 1, same as Rust's.
            NativeArg::Bool(v) => Arg::new(v),
            NativeArg::Char(v) => Arg::new(v),
            NativeArg::UChar(v) => Arg::new(v),
            NativeArg::Short(v) => Arg::new(v),
            NativeArg::UShort(v) => Arg::new(v),
            NativeArg::Int(v) => Arg::new(v),
            NativeArg::UInt(v) => Arg::new(v),
            NativeArg::Long(v) => Arg::new(v),
            NativeArg::ULong(v) => Arg::new(v),
            NativeArg::LongLong(v) => Arg::new(v),
            NativeArg::ULongLong(v) => Arg::new(v),
            NativeArg::Float(v) => Arg::new(v),
            NativeArg::Double(v) => Arg::new(v),
            NativeArg::Pointer(v) => Arg::new(v),
        }
    }
}

#[derive(Debug)]
pub struct CallVm {
    abi: ffi_abi,
    args: Vec<NativeArg>,
}

// Staged pointers are plain addresses; they are only dereferenced by the
// callee, on the thread that holds the guard.
unsafe impl Send for CallVm {}

static CALL_VM: Mutex<CallVm> = Mutex::new(CallVm {
    abi: ffi_abi_FFI_DEFAULT_ABI,
    args: Vec::new(),
});

thread_local! {
    static HELD: Cell<bool> = const { Cell::new(false) };
}

/// Exclusive access to the call context; released on drop.
pub struct CallVmGuard {
    vm: MutexGuard<'static, CallVm>,
}

impl Deref for CallVmGuard {
    type Target = CallVm;

    fn deref(&self) -> &CallVm {
        &self.vm
    }
}

impl DerefMut for CallVmGuard {
    fn deref_mut(&mut self) -> &mut CallVm {
        &mut self.vm
    }
}

impl Drop for CallVmGuard {
    fn drop(&mut self) {
        HELD.with(|held| held.set(false));
    }
}

impl CallVm {
    /// Take exclusive ownership of the shared call context.
    pub fn acquire() -> Result<CallVmGuard, BridgeError> {
        if HELD.with(|held| held.replace(true)) {
            return Err(BridgeError::Reentrant);
        }
        let vm = CALL_VM.lock().unwrap_or_else(|e| e.into_inner());
        Ok(CallVmGuard { vm })
    }

    /// Whether the current thread holds the context.
    pub fn is_held() -> bool {
        HELD.with(|held| held.get())
    }

    /// Drop staged arguments and return to the default ABI.
    pub fn reset(&mut self) {
        self.abi = ffi_abi_FFI_DEFAULT_ABI;
        self.args.clear();
    }

    pub fn mode(&mut self, abi: ffi_abi) {
        self.abi = abi;
    }

    pub fn arg(&mut self, arg: NativeArg) {
        self.args.push(arg);
    }

    pub fn staged(&self) -> &[NativeArg] {
        &self.args
    }

    fn cif(&self, ret: Type) -> Cif {
        let mut cif = Cif::new(self.args.iter().map(NativeArg::ffi_type), ret);
        cif.set_abi(self.abi);
        cif
    }

    /// # Safety
    /// `address` must be a function matching the staged arguments and the
    /// selected ABI.
    pub unsafe fn call_void(&self, address: usize) {
        let args: Vec<Arg> = self.args.iter().map(NativeArg::as_arg).collect();
        self.cif(Type::void()).call::<()>(CodePtr(address as *mut c_void), &args)
    }

    /// Call a function returning an integer or pointer of type `ret`.
    ///
    /// libffi widens integral results to a full register, so the result is
    /// always read as a `u64` and narrowed by the caller.
    ///
    /// # Safety
    /// See [`call_void`](Self::call_void).
    pub unsafe fn call_word(&self, address: usize, ret: Type) -> u64 {
        let args: Vec<Arg> = self.args.iter().map(NativeArg::as_arg).collect();
        self.cif(ret).call::<u64>(CodePtr(address as *mut c_void), &args)
    }

    /// # Safety
    /// See [`call_void`](Self::call_void).
    pub unsafe fn call_float(&self, address: usize) -> f32 {
        let args: Vec<Arg> = self.args.iter().map(NativeArg::as_arg).collect();
        self.cif(Type::f32()).call::<f32>(CodePtr(address as *mut c_void), &args)
    }

    /// # Safety
    /// See [`call_void`](Self::call_void).
    pub unsafe fn call_double(&self, address: usize) -> f64 {
        let args: Vec<Arg> = self.args.iter().map(NativeArg::as_arg).collect();
        self.cif(Type::f64()).call::<f64>(CodePtr(address as *mut c_void), &args)
    }
}
