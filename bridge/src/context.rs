//! The value bag exchanged with the scripting layer.
//!
//! A [`ScriptContext`] is a fixed-capacity, `#[repr(C)]` record of raw 64-bit
//! slots, so the scripting host can hand one across the boundary as
//! `*mut ScriptContext` and read it with its own layout definition. Typed
//! access goes through [`ScriptValue`].

use crate::error::BridgeError;
use crate::types::MAX_ARGUMENTS;

/// Bytes reserved for a native error message, including the NUL.
pub const NATIVE_ERROR_LEN: usize = 256;

/// Callback signature used by hooks and natives.
pub type CallbackT = unsafe extern "C" fn(*mut ScriptContext);

#[repr(C)]
#[derive(Clone)]
pub struct ScriptContext {
    has_error: i32,
    num_arguments: i32,
    arguments: [u64; MAX_ARGUMENTS],
    result: u64,
    native_error: [u8; NATIVE_ERROR_LEN],
}

impl Default for ScriptContext {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for ScriptContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScriptContext")
            .field("arguments", &&self.arguments[..self.argument_count()])
            .field("result", &self.result)
            .field("native_error", &self.native_error())
            .finish()
    }
}

impl ScriptContext {
    pub const fn new() -> Self {
        Self {
            has_error: 0,
            num_arguments: 0,
            arguments: [0; MAX_ARGUMENTS],
            result: 0,
            native_error: [0; NATIVE_ERROR_LEN],
        }
    }

    /// Drop all arguments, the result and any recorded error.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn argument_count(&self) -> usize {
        self.num_arguments as usize
    }

    /// Append an argument after the last one.
    pub fn push<T: ScriptValue>(&mut self, value: T) -> Result<(), BridgeError> {
        let index = self.argument_count();
        if index >= MAX_ARGUMENTS {
            return Err(BridgeError::ContextFull);
        }
        self.arguments[index] = value.into_slot();
        self.num_arguments += 1;
        Ok(())
    }

    /// Read argument `index`; indices past the pushed arguments read as zero.
    pub fn get_argument<T: ScriptValue>(&self, index: usize) -> T {
        T::from_slot(self.raw_argument(index))
    }

    pub fn raw_argument(&self, index: usize) -> u64 {
        if index < self.argument_count() {
            self.arguments[index]
        } else {
            0
        }
    }

    /// Overwrite argument `index`, growing the argument count to cover it.
    pub fn set_argument<T: ScriptValue>(&mut self, index: usize, value: T) -> Result<(), BridgeError> {
        if index >= MAX_ARGUMENTS {
            return Err(BridgeError::ArgumentsOutOfRange {
                needed: index + 1,
                available: MAX_ARGUMENTS,
            });
        }
        self.arguments[index] = value.into_slot();
        self.num_arguments = self.num_arguments.max(index as i32 + 1);
        Ok(())
    }

    pub fn set_result<T: ScriptValue>(&mut self, value: T) {
        self.result = value.into_slot();
    }

    pub fn get_result<T: ScriptValue>(&self) -> T {
        T::from_slot(self.result)
    }

    /// Record an error for the scripting host. Messages longer than the
    /// buffer are cut at a character boundary.
    pub fn throw_native_error(&mut self, message: &str) {
        let mut len = message.len().min(NATIVE_ERROR_LEN - 1);
        while !message.is_char_boundary(len) {
            len -= 1;
        }
        self.native_error = [0; NATIVE_ERROR_LEN];
        self.native_error[..len].copy_from_slice(&message.as_bytes()[..len]);
        self.has_error = 1;
    }

    pub fn has_error(&self) -> bool {
        self.has_error != 0
    }

    pub fn native_error(&self) -> Option<&str> {
        if !self.has_error() {
            return None;
        }
        let len = self.native_error.iter().position(|&b| b == 0).unwrap_or(NATIVE_ERROR_LEN);
        core::str::from_utf8(&self.native_error[..len]).ok()
    }

    /// Argument `index` as a nullable callback pointer.
    pub fn get_callback(&self, index: usize) -> Option<CallbackT> {
        let raw = self.raw_argument(index) as usize;
        if raw == 0 {
            None
        } else {
            // SAFETY: non-null slot written by the host as a callback pointer.
            Some(unsafe { core::mem::transmute::<usize, CallbackT>(raw) })
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// A primitive that fits in one 64-bit slot.
///
/// Signed integers are sign-extended, floats keep their exact bit pattern
/// and `bool` is stored as 0 or 1.
pub trait ScriptValue: sealed::Sealed + Copy {
    fn from_slot(raw: u64) -> Self;
    fn into_slot(self) -> u64;
}

macro_rules! int_script_value {
    ($($t:ty => $wide:ty),* $(,)?) => {$(
        impl sealed::Sealed for $t {}
        impl ScriptValue for $t {
            #[inline]
            fn from_slot(raw: u64) -> Self {
                raw as $t
            }
            #[inline]
            fn into_slot(self) -> u64 {
                self as $wide as u64
            }
        }
    )*};
}

int_script_value! {
    i8 => i64, u8 => u64, i16 => i64, u16 => u64,
    i32 => i64, u32 => u64, i64 => i64, u64 => u64,
    isize => i64, usize => u64,
}

impl sealed::Sealed for bool {}
impl ScriptValue for bool {
    fn from_slot(raw: u64) -> Self {
        raw as u8 != 0
    }
    fn into_slot(self) -> u64 {
        self as u64
    }
}

impl sealed::Sealed for f32 {}
impl ScriptValue for f32 {
    fn from_slot(raw: u64) -> Self {
        f32::from_bits(raw as u32)
    }
    fn into_slot(self) -> u64 {
        self.to_bits() as u64
    }
}

impl sealed::Sealed for f64 {}
impl ScriptValue for f64 {
    fn from_slot(raw: u64) -> Self {
        f64::from_bits(raw)
    }
    fn into_slot(self) -> u64 {
        self.to_bits()
    }
}

impl<T> sealed::Sealed for *const T {}
impl<T> ScriptValue for *const T {
    fn from_slot(raw: u64) -> Self {
        raw as usize as *const T
    }
    fn into_slot(self) -> u64 {
        self as usize as u64
    }
}

impl<T> sealed::Sealed for *mut T {}
impl<T> ScriptValue for *mut T {
    fn from_slot(raw: u64) -> Self {
        raw as usize as *mut T
    }
    fn into_slot(self) -> u64 {
        self as usize as u64
    }
}
