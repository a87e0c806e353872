use crate::code::patcher::write_code;
use crate::interceptor::listener::CallListener;
use crate::types::HookError;
use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

pub mod invocation;
pub mod listener;

#[cfg(all(target_arch = "x86_64", unix))]
mod attach_x86_64;

/// Per-function interception state.
///
/// Contexts are leaked on creation: the wrapper holds a raw pointer to its
/// context and may still be running on another thread when the hook is
/// removed, so a context must outlive every call that entered it.
struct FunctionContext {
    function: usize,
    /// First patched byte (after an ENDBR64 if present).
    patch_addr: usize,
    /// Bytes at `patch_addr` that `redirect` overwrites.
    original_bytes: Vec<u8>,
    /// Jump to `wrapper`, NOP-padded to `original_bytes.len()`.
    redirect: Vec<u8>,
    trampoline: usize,
    wrapper: usize,
    installed: AtomicBool,
    listeners: Mutex<Vec<CallListener>>,
}

impl FunctionContext {
    fn lock_listeners(&self) -> MutexGuard<'_, Vec<CallListener>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the listener list, so listeners can attach or detach while
    /// an invocation is being dispatched.
    fn snapshot_listeners(&self) -> Vec<CallListener> {
        self.lock_listeners().clone()
    }

    fn prepared(&self) -> PreparedHook {
        PreparedHook {
            function: self.function,
            wrapper: self.wrapper,
            trampoline: self.trampoline,
        }
    }
}

/// A hook whose wrapper and trampoline exist but whose target may not be patched yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreparedHook {
    pub function: usize,
    /// Entry point that runs listeners and then the original.
    pub wrapper: usize,
    /// Relocated prologue followed by a jump back into the original body.
    /// Calling it runs the unhooked function.
    pub trampoline: usize,
}

/// Inline function interceptor.
///
/// A hook goes through two steps: [`prepare`](Self::prepare) emits the
/// trampoline and wrapper without touching the target, and
/// [`install`](Self::install) patches the target's prologue with a jump to
/// the wrapper. [`attach`](Self::attach) does both. Listeners added to an
/// already prepared function share its single wrapper.
pub struct Interceptor {
    attach_map: Mutex<HashMap<usize, &'static FunctionContext>>,
}

impl Interceptor {
    pub fn obtain() -> &'static Interceptor {
        static INSTANCE: std::sync::OnceLock<Interceptor> = std::sync::OnceLock::new();
        INSTANCE.get_or_init(|| Interceptor {
            attach_map: Mutex::new(HashMap::new()),
        })
    }

    fn lock_map(&self) -> MutexGuard<'_, HashMap<usize, &'static FunctionContext>> {
        self.attach_map.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Build the wrapper and trampoline for `function_address` and register
    /// `listener` on it, without patching the function.
    pub fn prepare(&self, function_address: *mut c_void, listener: CallListener) -> Result<PreparedHook, HookError> {
        let mut map = self.lock_map();
        if let Some(ctx) = map.get(&(function_address as usize)) {
            ctx.lock_listeners().push(listener);
            return Ok(ctx.prepared());
        }

        #[cfg(all(target_arch = "x86_64", unix))]
        {
            let ctx = attach_x86_64::prepare(function_address, listener)?;
            map.insert(ctx.function, ctx);
            Ok(ctx.prepared())
        }
        #[cfg(not(all(target_arch = "x86_64", unix)))]
        {
            let _ = (&mut map, listener);
            Err(HookError::Unsupported)
        }
    }

    /// Patch the target's prologue so calls enter the wrapper. Installing an
    /// already installed hook is a no-op.
    pub fn install(&self, hook: &PreparedHook) -> Result<(), HookError> {
        let map = self.lock_map();
        let ctx = map.get(&hook.function).ok_or(HookError::NotAttached(hook.function))?;
        if ctx.installed.load(Ordering::Acquire) {
            return Ok(());
        }
        unsafe {
            write_code(ctx.patch_addr as *mut u8, &ctx.redirect)?;
        }
        ctx.installed.store(true, Ordering::Release);
        Ok(())
    }

    pub fn attach(&self, function_address: *mut c_void, listener: CallListener) -> Result<PreparedHook, HookError> {
        let prepared = self.prepare(function_address, listener)?;
        self.install(&prepared)?;
        Ok(prepared)
    }

    /// Remove `listener` from every function it is attached to. Functions
    /// left without listeners get their original bytes back.
    pub fn detach(&self, listener: &CallListener) {
        let mut map = self.lock_map();

        let emptied: Vec<usize> = map
            .iter()
            .filter_map(|(key, ctx)| {
                let mut listeners = ctx.lock_listeners();
                let before = listeners.len();
                listeners.retain(|l| !l.matches(listener));
                (before != listeners.len() && listeners.is_empty()).then_some(*key)
            })
            .collect();

        for key in emptied {
            if let Some(ctx) = map.remove(&key) {
                if let Err(e) = restore(ctx) {
                    log::warn!("failed to restore {:#x} on detach: {}", key, e);
                }
            }
        }
    }

    /// Restore the original bytes of `function_address` and forget its
    /// listeners, whatever their number.
    pub fn uninstall(&self, function_address: *mut c_void) -> Result<(), HookError> {
        let key = function_address as usize;
        let mut map = self.lock_map();
        let ctx = map.get(&key).copied().ok_or(HookError::NotAttached(key))?;
        restore(ctx)?;
        map.remove(&key);
        Ok(())
    }

    pub fn is_installed(&self, function_address: *mut c_void) -> bool {
        self.lock_map()
            .get(&(function_address as usize))
            .is_some_and(|ctx| ctx.installed.load(Ordering::Acquire))
    }

    pub fn listener_count(&self, function_address: *mut c_void) -> usize {
        self.lock_map()
            .get(&(function_address as usize))
            .map_or(0, |ctx| ctx.lock_listeners().len())
    }

    /// Address that runs the unhooked function, if `function_address` is prepared.
    pub fn trampoline(&self, function_address: *mut c_void) -> Option<usize> {
        self.lock_map().get(&(function_address as usize)).map(|ctx| ctx.trampoline)
    }
}

fn restore(ctx: &FunctionContext) -> Result<(), HookError> {
    if ctx.installed.swap(false, Ordering::AcqRel) {
        unsafe {
            write_code(ctx.patch_addr as *mut u8, &ctx.original_bytes)?;
        }
    }
    Ok(())
}
