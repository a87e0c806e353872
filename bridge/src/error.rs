use nativebridge_intercept::HookError;
use thiserror::Error;

use crate::types::{Convention, DataType};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("function at {address:#x} is not callable with the {convention:?} convention on this platform")]
    NotCallable { address: usize, convention: Convention },

    #[error("unknown data type tag {0}")]
    UnknownDataType(i32),

    #[error("unknown calling convention {0}")]
    UnknownConvention(i32),

    #[error("{0:?} cannot be used as an argument type")]
    InvalidArgumentType(DataType),

    #[error("{0:?} cannot be used as a return type")]
    InvalidReturnType(DataType),

    #[error("{count} arguments exceed the {max} slots of a script context")]
    TooManyArguments { count: usize, max: usize },

    #[error("{count} stack arguments exceed the {max} slots a hook can forward")]
    TooManyStackArguments { count: usize, max: usize },

    #[error("invalid argument count {0}")]
    InvalidArgumentCount(i32),

    #[error("invalid vtable index {0}")]
    InvalidVtableIndex(i32),

    #[error("call needs {needed} arguments but the script context holds {available}")]
    ArgumentsOutOfRange { needed: usize, available: usize },

    #[error("script context is full")]
    ContextFull,

    #[error("native call context is already in use on this thread")]
    Reentrant,

    #[error("failed to hook function at {address:#x}: {source}")]
    Hook {
        address: usize,
        #[source]
        source: HookError,
    },

    #[error("function at {0:#x} is not hooked")]
    NotHooked(usize),

    #[error("unknown native {0}")]
    UnknownNative(String),

    #[error("invalid function handle {0}")]
    InvalidHandle(u64),

    #[error("null address")]
    NullAddress,

    #[error("null callback")]
    NullCallback,

    #[error("invalid signature {0:?}")]
    InvalidSignature(String),

    #[error("module {0} is not loaded")]
    ModuleNotFound(String),

    #[error("signature not found in {0}")]
    SignatureNotFound(String),
}
