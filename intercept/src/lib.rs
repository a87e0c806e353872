//! nativebridge-intercept: inline function interception for nativebridge.

pub mod code;
pub mod interceptor;
pub mod module;
pub mod types;

// Re-exports for convenience (flattened imports)
pub use interceptor::invocation;
pub use interceptor::listener::CallListener;
pub use interceptor::{Interceptor, PreparedHook};
pub use types::{HookError, InvocationContext};

/// Initialize the intercept subsystem.
///
/// Uses Rust-managed state, so this is a no-op today but kept so hosts have a
/// single place to call before the first hook is prepared.
pub fn init() {}

/// Process-global lock for tests that modify executable code (interceptor + patcher).
///
/// All tests that patch functions must hold this lock to prevent SIGSEGV from
/// concurrent patching of the same page.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
