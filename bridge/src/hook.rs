//! The hook engine.
//!
//! One [`HookState`] exists per hooked address. Its interceptor listener
//! captures the arguments of every intercepted call into a fresh
//! [`ScriptContext`], runs the callback chain and folds the dispositions into
//! a single decision: forward to the original (through the interceptor's
//! trampoline) or suppress it.

use core::ffi::{c_char, c_long, c_ulong, c_void};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use nativebridge_intercept::invocation::{locate_arguments, ArgumentLocation, MAX_STACK_ARGUMENTS};
use nativebridge_intercept::{CallListener, Interceptor, InvocationContext};

use crate::callback::{CallbackChain, CallbackManager};
use crate::config::BridgeConfig;
use crate::context::{CallbackT, ScriptContext};
use crate::error::BridgeError;
use crate::types::{Disposition, ValueType, MAX_ARGUMENTS};

/// Raw per-argument access to an intercepted call, keyed by declared index.
///
/// Capture and write-back only see this trait, so they stay independent of
/// where a calling convention places each argument.
pub trait ArgumentSource {
    /// Raw 64-bit content of argument `index`. Narrow values occupy the low bits.
    fn read(&self, index: usize) -> u64;
    fn write(&mut self, index: usize, raw: u64);
}

/// Append the arguments described by `types`, in declared order, to `bag`.
pub fn capture_arguments(types: &[ValueType], source: &impl ArgumentSource, bag: &mut ScriptContext) -> Result<(), BridgeError> {
    for (index, ty) in types.iter().enumerate() {
        let raw = source.read(index);
        match ty {
            ValueType::Bool => bag.push(raw as u8 != 0)?,
            ValueType::Char => bag.push(raw as i8)?,
            ValueType::UChar => bag.push(raw as u8)?,
            ValueType::Short => bag.push(raw as i16)?,
            ValueType::UShort => bag.push(raw as u16)?,
            ValueType::Int => bag.push(raw as i32)?,
            ValueType::UInt => bag.push(raw as u32)?,
            ValueType::Long => bag.push(raw as c_long as i64)?,
            ValueType::ULong => bag.push(raw as c_ulong as u64)?,
            ValueType::LongLong => bag.push(raw as i64)?,
            ValueType::ULongLong => bag.push(raw)?,
            ValueType::Float => bag.push(f32::from_bits(raw as u32))?,
            ValueType::Double => bag.push(f64::from_bits(raw))?,
            ValueType::Pointer => bag.push(raw as usize as *mut c_void)?,
            ValueType::String => bag.push(raw as usize as *const c_char)?,
        }
    }
    Ok(())
}

/// Store the bag's (possibly modified) arguments back into their native locations.
pub fn write_back_arguments(types: &[ValueType], bag: &ScriptContext, source: &mut impl ArgumentSource) {
    for (index, ty) in types.iter().enumerate() {
        let raw = match ty {
            ValueType::Bool => bag.get_argument::<bool>(index) as u64,
            ValueType::Char => bag.get_argument::<i8>(index) as u8 as u64,
            ValueType::UChar => bag.get_argument::<u8>(index) as u64,
            ValueType::Short => bag.get_argument::<i16>(index) as u16 as u64,
            ValueType::UShort => bag.get_argument::<u16>(index) as u64,
            ValueType::Int => bag.get_argument::<i32>(index) as u32 as u64,
            ValueType::UInt => bag.get_argument::<u32>(index) as u64,
            ValueType::Long => bag.get_argument::<i64>(index) as c_long as u64,
            ValueType::ULong => bag.get_argument::<u64>(index) as c_ulong as u64,
            ValueType::LongLong => bag.get_argument::<i64>(index) as u64,
            ValueType::ULongLong => bag.get_argument::<u64>(index),
            ValueType::Float => bag.get_argument::<f32>(index).to_bits() as u64,
            ValueType::Double => bag.get_argument::<f64>(index).to_bits(),
            ValueType::Pointer | ValueType::String => bag.get_argument::<usize>(index) as u64,
        };
        source.write(index, raw);
    }
}

/// Result of running a callback chain over one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub call_original: bool,
    /// Highest disposition returned by any callback that ran.
    pub worst: Disposition,
    pub callbacks_run: usize,
}

/// Run `callbacks` in order over `bag`.
///
/// The result slot is reset to `Continue` before each callback. `Handled`
/// suppresses the original but lets the rest of the chain run; `Stop`
/// suppresses it and ends the chain. Null entries are skipped.
pub fn dispatch(callbacks: &[Option<CallbackT>], bag: &mut ScriptContext) -> DispatchOutcome {
    let debug = BridgeConfig::global().hook_debug;
    let mut outcome = DispatchOutcome {
        call_original: true,
        worst: Disposition::Continue,
        callbacks_run: 0,
    };

    for callback in callbacks.iter().flatten() {
        bag.set_result(Disposition::Continue as i32);
        unsafe { callback(bag) };
        outcome.callbacks_run += 1;

        let disposition = Disposition::from_raw(bag.get_result::<i32>());
        if debug {
            log::debug!("hook callback #{} returned {:?}", outcome.callbacks_run, disposition);
        }
        outcome.worst = outcome.worst.max(disposition);

        if disposition >= Disposition::Stop {
            outcome.call_original = false;
            break;
        }
        if disposition >= Disposition::Handled {
            outcome.call_original = false;
        }
    }

    outcome
}

/// Argument source backed by the register image the interceptor captured.
#[cfg(all(target_arch = "x86_64", unix))]
pub struct RegisterSource<'a> {
    ctx: *mut InvocationContext,
    locations: &'a [ArgumentLocation],
}

#[cfg(all(target_arch = "x86_64", unix))]
impl<'a> RegisterSource<'a> {
    /// # Safety
    /// `ctx` must be the live context of an intercepted call whose arguments
    /// are laid out as `locations` says.
    pub unsafe fn new(ctx: *mut InvocationContext, locations: &'a [ArgumentLocation]) -> Self {
        Self { ctx, locations }
    }
}

#[cfg(all(target_arch = "x86_64", unix))]
impl ArgumentSource for RegisterSource<'_> {
    fn read(&self, index: usize) -> u64 {
        match self.locations.get(index) {
            Some(location) => unsafe { nativebridge_intercept::invocation::read_argument(self.ctx, *location) },
            None => 0,
        }
    }

    fn write(&mut self, index: usize, raw: u64) {
        if let Some(location) = self.locations.get(index) {
            unsafe { nativebridge_intercept::invocation::write_argument(self.ctx, *location, raw) }
        }
    }
}

/// Everything the interception path needs for one hooked address.
#[derive(Debug)]
pub struct HookState {
    address: usize,
    args: Vec<ValueType>,
    locations: Vec<ArgumentLocation>,
    chain: Arc<CallbackChain>,
}

impl HookState {
    /// The listener registered with the interceptor. `user_data` carries the
    /// address so listeners of different hooks never compare equal.
    fn listener(&self) -> CallListener {
        CallListener {
            on_enter: Some(on_enter),
            user_data: self.address as *mut c_void,
        }
    }
}

fn registry() -> MutexGuard<'static, HashMap<usize, Arc<HookState>>> {
    static HOOKS: OnceLock<Mutex<HashMap<usize, Arc<HookState>>>> = OnceLock::new();
    HOOKS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

fn lookup(address: usize) -> Option<Arc<HookState>> {
    registry().get(&address).cloned()
}

/// Interception entry point for every bridge hook.
///
/// The state is looked up by address on each call instead of being reached
/// through a raw pointer, so a hook removed concurrently is simply skipped.
unsafe extern "C" fn on_enter(ctx: *mut InvocationContext, user_data: *mut c_void) {
    let Some(state) = lookup(user_data as usize) else {
        return;
    };
    intercept(&state, ctx);
}

#[cfg(all(target_arch = "x86_64", unix))]
unsafe fn intercept(state: &HookState, ctx: *mut InvocationContext) {
    use nativebridge_intercept::invocation::{replace_float_return_value, replace_return_value};

    let mut source = RegisterSource::new(ctx, &state.locations);
    let mut bag = ScriptContext::new();
    if let Err(e) = capture_arguments(&state.args, &source, &mut bag) {
        log::warn!("failed to capture arguments of {:#x}: {}", state.address, e);
        return;
    }
    if BridgeConfig::global().hook_debug {
        log::debug!("intercepted {:#x} with {:?}", state.address, bag);
    }

    let outcome = dispatch(&state.chain.snapshot(), &mut bag);
    if !outcome.call_original {
        replace_return_value(ctx, core::ptr::null_mut());
        replace_float_return_value(ctx, 0);
    } else if outcome.worst == Disposition::Changed {
        write_back_arguments(&state.args, &bag, &mut source);
    }
}

#[cfg(not(all(target_arch = "x86_64", unix)))]
unsafe fn intercept(_state: &HookState, _ctx: *mut InvocationContext) {}

/// A separately owned hook on one address.
///
/// Clones refer to the same hook. Dropping a handle leaves the hook
/// installed; only [`uninstall`](Self::uninstall) removes it.
#[derive(Debug, Clone)]
pub struct HookHandle {
    state: Arc<HookState>,
}

impl HookHandle {
    pub fn address(&self) -> usize {
        self.state.address
    }

    pub fn add_listener(&self, callback: CallbackT) {
        self.state.chain.add(Some(callback));
    }

    pub fn remove_listener(&self, callback: CallbackT) -> bool {
        self.state.chain.remove(callback)
    }

    pub fn listener_count(&self) -> usize {
        self.state.chain.count()
    }

    pub fn is_installed(&self) -> bool {
        lookup(self.state.address).is_some_and(|s| Arc::ptr_eq(&s, &self.state))
            && Interceptor::obtain().is_installed(self.state.address as *mut c_void)
    }

    /// Address that runs the original function without interception.
    pub fn trampoline(&self) -> Option<usize> {
        Interceptor::obtain().trampoline(self.state.address as *mut c_void)
    }

    /// Restore the original code and forget the callback chain.
    pub fn uninstall(&self) -> Result<(), BridgeError> {
        let mut hooks = registry();
        match hooks.get(&self.state.address) {
            Some(current) if Arc::ptr_eq(current, &self.state) => {}
            _ => return Err(BridgeError::NotHooked(self.state.address)),
        }
        hooks.remove(&self.state.address);
        drop(hooks);

        Interceptor::obtain().detach(&self.state.listener());
        CallbackManager::global().release_callback(&self.state.chain);
        log::info!("removed hook on {:#x}", self.state.address);
        Ok(())
    }
}

/// Current hook on `address`, if any.
pub fn find_hook(address: usize) -> Option<HookHandle> {
    lookup(address).map(|state| HookHandle { state })
}

/// Argument locations for a hook on `args`, or an error when the wrapper
/// could not forward them.
fn hook_layout(args: &[ValueType]) -> Result<Vec<ArgumentLocation>, BridgeError> {
    if args.len() > MAX_ARGUMENTS {
        return Err(BridgeError::TooManyArguments {
            count: args.len(),
            max: MAX_ARGUMENTS,
        });
    }
    let classes: Vec<_> = args.iter().map(|ty| ty.class()).collect();
    let locations = locate_arguments(&classes);
    let stack_slots = stack_slots(&locations);
    if stack_slots > MAX_STACK_ARGUMENTS {
        return Err(BridgeError::TooManyStackArguments {
            count: stack_slots,
            max: MAX_STACK_ARGUMENTS,
        });
    }
    Ok(locations)
}

/// Caller stack slots a call with `locations` occupies.
fn stack_slots(locations: &[ArgumentLocation]) -> usize {
    locations
        .iter()
        .filter_map(|loc| match loc {
            ArgumentLocation::Stack(k) => Some(k + 1),
            _ => None,
        })
        .max()
        .unwrap_or(0)
}

/// Hook `address` and register `callback` on its chain.
///
/// An address is hooked at most once; later calls join the existing chain
/// and keep the argument layout of the first registration. Every call must
/// still pass an argument list the wrapper can forward.
///
/// The registry lock is only held to look up or publish the state. Callbacks
/// and loggers may call the hooked function as soon as it is installed, and
/// its listener takes the same lock.
pub fn hook_function(address: usize, args: &[ValueType], callback: Option<CallbackT>) -> Result<HookHandle, BridgeError> {
    let locations = hook_layout(args).inspect_err(|e| log::warn!("failed to hook {:#x}: {}", address, e))?;
    let state = {
        let mut hooks = registry();
        if let Some(state) = hooks.get(&address) {
            let state = Arc::clone(state);
            drop(hooks);
            state.chain.add(callback);
            log::debug!("added listener to existing hook on {:#x}", address);
            return Ok(HookHandle { state });
        }

        let state = Arc::new(HookState {
            address,
            args: args.to_vec(),
            locations,
            chain: CallbackManager::global().create_callback(&format!("hook:{address:#x}")),
        });
        state.chain.add(callback);
        // Published before installing so the first intercepted call finds it.
        hooks.insert(address, Arc::clone(&state));
        state
    };

    let interceptor = Interceptor::obtain();
    let hook_failed = |source| {
        let mut hooks = registry();
        if hooks.get(&address).is_some_and(|current| Arc::ptr_eq(current, &state)) {
            hooks.remove(&address);
        }
        drop(hooks);
        CallbackManager::global().release_callback(&state.chain);
        log::warn!("failed to hook {:#x}: {}", address, source);
        BridgeError::Hook { address, source }
    };

    let prepared = match interceptor.prepare(address as *mut c_void, state.listener()) {
        Ok(prepared) => prepared,
        Err(e) => return Err(hook_failed(e)),
    };
    if let Err(e) = interceptor.install(&prepared) {
        interceptor.detach(&state.listener());
        return Err(hook_failed(e));
    }

    log::info!(
        "hooked {:#x} (wrapper {:#x}, trampoline {:#x})",
        address,
        prepared.wrapper,
        prepared.trampoline
    );
    Ok(HookHandle { state })
}
