//! nativebridge: typed native calls and function hooks for scripting hosts.
//!
//! The invoker side ([`NativeFunction`]) calls into native code with
//! arguments taken from a [`ScriptContext`]. The hook side ([`hook_function`])
//! detours a native function so script callbacks observe and rewrite its
//! arguments, or replace the call entirely.

pub mod call_vm;
pub mod callback;
pub mod config;
pub mod context;
pub mod convention;
pub mod error;
pub mod function;
pub mod hook;
pub mod natives;
pub mod signature;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use callback::{CallbackChain, CallbackManager};
pub use config::BridgeConfig;
pub use context::{CallbackT, ScriptContext, ScriptValue};
pub use error::BridgeError;
pub use function::NativeFunction;
pub use hook::{find_hook, hook_function, HookHandle};
pub use natives::NativeRegistry;
pub use signature::BytePattern;
pub use types::{Convention, DataType, Disposition, ValueType};

/// Initialize logging and the intercept subsystem. Safe to call more than once.
pub fn init() {
    let config = BridgeConfig::global();
    config::init_logging(config);
    nativebridge_intercept::init();
    log::debug!("nativebridge initialized (hook_debug={})", config.hook_debug);
}
