//! Script-facing natives.
//!
//! Each native reads its parameters from a [`ScriptContext`] and writes its
//! result back into it. Failures are recorded with
//! [`ScriptContext::throw_native_error`] for the scripting host.

use core::ffi::{c_char, c_void, CStr};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::context::ScriptContext;
use crate::error::BridgeError;
use crate::function::NativeFunction;
use crate::signature::BytePattern;
use crate::types::{Convention, DataType};

pub type NativeHandler = fn(&mut ScriptContext) -> Result<(), BridgeError>;

pub const CREATE_FUNCTION: &str = "CREATE_FUNCTION";
pub const CREATE_VIRTUAL_FUNCTION: &str = "CREATE_VIRTUAL_FUNCTION";
pub const FIND_SIGNATURE: &str = "FIND_SIGNATURE";
pub const EXECUTE_FUNCTION: &str = "EXECUTE_FUNCTION";
pub const HOOK_FUNCTION: &str = "HOOK_FUNCTION";
pub const UNHOOK_FUNCTION: &str = "UNHOOK_FUNCTION";
pub const RELEASE_FUNCTION: &str = "RELEASE_FUNCTION";

/// Native name to handler table.
#[derive(Debug, Default)]
pub struct NativeRegistry {
    natives: HashMap<String, NativeHandler>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the function and memory natives.
    pub fn with_memory_natives() -> Self {
        let mut registry = Self::new();
        registry.register_natives(&[
            (CREATE_FUNCTION, create_function),
            (CREATE_VIRTUAL_FUNCTION, create_virtual_function),
            (FIND_SIGNATURE, find_signature),
            (EXECUTE_FUNCTION, execute_function),
            (HOOK_FUNCTION, hook_function),
            (UNHOOK_FUNCTION, unhook_function),
            (RELEASE_FUNCTION, release_function),
        ]);
        registry
    }

    pub fn register(&mut self, name: &str, handler: NativeHandler) {
        if self.natives.insert(name.to_string(), handler).is_some() {
            log::warn!("native {} registered twice, keeping the latest", name);
        }
    }

    pub fn register_natives(&mut self, table: &[(&str, NativeHandler)]) {
        for (name, handler) in table {
            self.register(name, *handler);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.natives.contains_key(name)
    }

    /// Run native `name` over `ctx`. Errors are also recorded in `ctx`.
    pub fn invoke(&self, name: &str, ctx: &mut ScriptContext) -> Result<(), BridgeError> {
        let result = match self.natives.get(name) {
            Some(handler) => handler(ctx),
            None => Err(BridgeError::UnknownNative(name.to_string())),
        };
        if let Err(e) = &result {
            log::debug!("native {} failed: {}", name, e);
            ctx.throw_native_error(&e.to_string());
        }
        result
    }
}

#[derive(Debug, Default)]
struct FunctionTable {
    last_handle: u64,
    functions: HashMap<u64, Arc<NativeFunction>>,
}

fn function_table() -> MutexGuard<'static, FunctionTable> {
    static TABLE: OnceLock<Mutex<FunctionTable>> = OnceLock::new();
    TABLE
        .get_or_init(|| Mutex::new(FunctionTable::default()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

/// Store `function` and return its script handle. Handles start at 1.
pub fn register_function(function: NativeFunction) -> u64 {
    let mut table = function_table();
    table.last_handle += 1;
    let handle = table.last_handle;
    table.functions.insert(handle, Arc::new(function));
    handle
}

pub fn get_function(handle: u64) -> Result<Arc<NativeFunction>, BridgeError> {
    function_table()
        .functions
        .get(&handle)
        .cloned()
        .ok_or(BridgeError::InvalidHandle(handle))
}

/// Forget `handle`. An installed hook stays installed.
pub fn release_function_handle(handle: u64) -> Result<(), BridgeError> {
    function_table()
        .functions
        .remove(&handle)
        .map(|_| ())
        .ok_or(BridgeError::InvalidHandle(handle))
}

fn read_str(ctx: &ScriptContext, index: usize) -> Result<String, BridgeError> {
    let ptr = ctx.get_argument::<*const c_char>(index);
    if ptr.is_null() {
        return Err(BridgeError::NullAddress);
    }
    // SAFETY: the host passes NUL-terminated strings for string parameters.
    Ok(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

/// Read `count` type tags starting at `first`.
fn read_tags(ctx: &ScriptContext, first: usize, count: i32) -> Result<Vec<DataType>, BridgeError> {
    let count = usize::try_from(count).map_err(|_| BridgeError::InvalidArgumentCount(count))?;
    if first + count > ctx.argument_count() {
        return Err(BridgeError::ArgumentsOutOfRange {
            needed: first + count,
            available: ctx.argument_count(),
        });
    }
    (first..first + count)
        .map(|i| DataType::try_from(ctx.get_argument::<i32>(i)))
        .collect()
}

/// `(address, convention, return_type, arg_count, tags...) -> handle`
fn create_function(ctx: &mut ScriptContext) -> Result<(), BridgeError> {
    let address = ctx.get_argument::<*mut c_void>(0);
    let convention = Convention::try_from(ctx.get_argument::<i32>(1))?;
    let ret = DataType::try_from(ctx.get_argument::<i32>(2))?;
    let args = read_tags(ctx, 4, ctx.get_argument::<i32>(3))?;

    // SAFETY: the host vouches for the signature of the address it passes.
    let function = unsafe { NativeFunction::new(address, convention, &args, ret)? };
    log::debug!("created function {:#x} {:?} {:?} -> {:?}", address as usize, convention, args, ret);
    ctx.set_result(register_function(function));
    Ok(())
}

/// `(object, vtable_index, arg_count, return_type, tags...) -> handle`
fn create_virtual_function(ctx: &mut ScriptContext) -> Result<(), BridgeError> {
    let object = ctx.get_argument::<*mut c_void>(0);
    let raw_index = ctx.get_argument::<i32>(1);
    let index = usize::try_from(raw_index).map_err(|_| BridgeError::InvalidVtableIndex(raw_index))?;
    let ret = DataType::try_from(ctx.get_argument::<i32>(3))?;
    let args = read_tags(ctx, 4, ctx.get_argument::<i32>(2))?;

    // SAFETY: the host passes a live object with a vtable.
    let function = unsafe { NativeFunction::from_vtable(object, index, &args, ret)? };
    ctx.set_result(register_function(function));
    Ok(())
}

/// `(module_name, signature) -> address`
fn find_signature(ctx: &mut ScriptContext) -> Result<(), BridgeError> {
    let module_name = read_str(ctx, 0)?;
    let pattern: BytePattern = read_str(ctx, 1)?.parse()?;
    let address = pattern.find_in_module(&module_name)?;
    ctx.set_result(address as *mut c_void);
    Ok(())
}

/// `(handle, args...) -> return value`
fn execute_function(ctx: &mut ScriptContext) -> Result<(), BridgeError> {
    let function = get_function(ctx.get_argument::<u64>(0))?;
    function.call(ctx, 1)
}

/// `(handle, callback)`
fn hook_function(ctx: &mut ScriptContext) -> Result<(), BridgeError> {
    let function = get_function(ctx.get_argument::<u64>(0))?;
    let callback = ctx.get_callback(1).ok_or(BridgeError::NullCallback)?;
    function.add_hook(callback)?;
    Ok(())
}

/// `(handle, callback)`
fn unhook_function(ctx: &mut ScriptContext) -> Result<(), BridgeError> {
    let function = get_function(ctx.get_argument::<u64>(0))?;
    let callback = ctx.get_callback(1).ok_or(BridgeError::NullCallback)?;
    function.remove_hook(callback)
}

/// `(handle)`
fn release_function(ctx: &mut ScriptContext) -> Result<(), BridgeError> {
    release_function_handle(ctx.get_argument::<u64>(0))
}
