use crate::types::InvocationContext;
use core::ffi::c_void;

pub type EnterCallback = unsafe extern "C" fn(*mut InvocationContext, *mut c_void);

/// A pre-call listener: `on_enter` runs before the original function with the
/// captured register image, and receives `user_data` back untouched.
#[derive(Debug, Clone, Copy)]
pub struct CallListener {
    pub on_enter: Option<EnterCallback>,
    pub user_data: *mut c_void,
}

impl CallListener {
    #[inline]
    pub fn matches(&self, other: &CallListener) -> bool {
        let enter_eq = match (self.on_enter, other.on_enter) {
            (None, None) => true,
            (Some(a), Some(b)) => core::ptr::fn_addr_eq(a, b),
            _ => false,
        };
        enter_eq && self.user_data == other.user_data
    }
}

// CallListener is an FFI-style function pointer + opaque user data.
// The interceptor stores listeners in a global singleton; treat this as thread-safe
// so long as the user upholds the usual FFI invariants for `user_data`.
unsafe impl Send for CallListener {}
unsafe impl Sync for CallListener {}
