//! Type tags, calling conventions and hook dispositions shared by the
//! invoker and the hook engine.

use libffi::middle::Type;
use nativebridge_intercept::invocation::ArgumentClass;

use crate::error::BridgeError;

/// Upper bound on a descriptor's arity, equal to the argument slots of a
/// [`ScriptContext`](crate::context::ScriptContext).
pub const MAX_ARGUMENTS: usize = 32;

/// Type tag as exchanged with the scripting layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DataType {
    Void = 0,
    Bool = 1,
    Char = 2,
    UChar = 3,
    Short = 4,
    UShort = 5,
    Int = 6,
    UInt = 7,
    Long = 8,
    ULong = 9,
    LongLong = 10,
    ULongLong = 11,
    Float = 12,
    Double = 13,
    Pointer = 14,
    String = 15,
    Custom = 16,
}

impl TryFrom<i32> for DataType {
    type Error = BridgeError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        Ok(match raw {
            0 => DataType::Void,
            1 => DataType::Bool,
            2 => DataType::Char,
            3 => DataType::UChar,
            4 => DataType::Short,
            5 => DataType::UShort,
            6 => DataType::Int,
            7 => DataType::UInt,
            8 => DataType::Long,
            9 => DataType::ULong,
            10 => DataType::LongLong,
            11 => DataType::ULongLong,
            12 => DataType::Float,
            13 => DataType::Double,
            14 => DataType::Pointer,
            15 => DataType::String,
            16 => DataType::Custom,
            other => return Err(BridgeError::UnknownDataType(other)),
        })
    }
}

impl DataType {
    /// The marshalable value this tag names, or `None` for void and custom.
    pub fn as_value(self) -> Option<ValueType> {
        Some(match self {
            DataType::Void | DataType::Custom => return None,
            DataType::Bool => ValueType::Bool,
            DataType::Char => ValueType::Char,
            DataType::UChar => ValueType::UChar,
            DataType::Short => ValueType::Short,
            DataType::UShort => ValueType::UShort,
            DataType::Int => ValueType::Int,
            DataType::UInt => ValueType::UInt,
            DataType::Long => ValueType::Long,
            DataType::ULong => ValueType::ULong,
            DataType::LongLong => ValueType::LongLong,
            DataType::ULongLong => ValueType::ULongLong,
            DataType::Float => ValueType::Float,
            DataType::Double => ValueType::Double,
            DataType::Pointer => ValueType::Pointer,
            DataType::String => ValueType::String,
        })
    }
}

/// A marshalable primitive. Descriptors only ever store these, so every
/// marshal site matches over a closed set with nothing left to reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Bool,
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    LongLong,
    ULongLong,
    Float,
    Double,
    Pointer,
    /// Pointer to a NUL-terminated C string.
    String,
}

impl From<ValueType> for DataType {
    fn from(value: ValueType) -> Self {
        match value {
            ValueType::Bool => DataType::Bool,
            ValueType::Char => DataType::Char,
            ValueType::UChar => DataType::UChar,
            ValueType::Short => DataType::Short,
            ValueType::UShort => DataType::UShort,
            ValueType::Int => DataType::Int,
            ValueType::UInt => DataType::UInt,
            ValueType::Long => DataType::Long,
            ValueType::ULong => DataType::ULong,
            ValueType::LongLong => DataType::LongLong,
            ValueType::ULongLong => DataType::ULongLong,
            ValueType::Float => DataType::Float,
            ValueType::Double => DataType::Double,
            ValueType::Pointer => DataType::Pointer,
            ValueType::String => DataType::String,
        }
    }
}

impl ValueType {
    pub fn ffi_type(self) -> Type {
        match self {
            ValueType::Bool | ValueType::UChar => Type::u8(),
            ValueType::Char => Type::c_schar(),
            ValueType::Short => Type::i16(),
            ValueType::UShort => Type::u16(),
            ValueType::Int => Type::c_int(),
            ValueType::UInt => Type::c_uint(),
            ValueType::Long => Type::c_long(),
            ValueType::ULong => Type::c_ulong(),
            ValueType::LongLong => Type::c_longlong(),
            ValueType::ULongLong => Type::c_ulonglong(),
            ValueType::Float => Type::f32(),
            ValueType::Double => Type::f64(),
            ValueType::Pointer | ValueType::String => Type::pointer(),
        }
    }

    /// Register class the value travels in.
    pub fn class(self) -> ArgumentClass {
        match self {
            ValueType::Float | ValueType::Double => ArgumentClass::Float,
            _ => ArgumentClass::Integer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Convention {
    Custom = 0,
    Cdecl = 1,
    ThisCall = 2,
    StdCall = 3,
    FastCall = 4,
}

impl TryFrom<i32> for Convention {
    type Error = BridgeError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Convention::Custom),
            1 => Ok(Convention::Cdecl),
            2 => Ok(Convention::ThisCall),
            3 => Ok(Convention::StdCall),
            4 => Ok(Convention::FastCall),
            other => Err(BridgeError::UnknownConvention(other)),
        }
    }
}

/// A hook callback's verdict, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum Disposition {
    Continue = 0,
    /// Arguments were modified and should reach the original.
    Changed = 1,
    /// Skip the original; remaining callbacks still run.
    Handled = 3,
    /// Skip the original and every remaining callback.
    Stop = 4,
}

impl Disposition {
    /// Interpret a raw callback result by threshold.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            r if r >= Disposition::Stop as i32 => Disposition::Stop,
            r if r >= Disposition::Handled as i32 => Disposition::Handled,
            r if r >= Disposition::Changed as i32 => Disposition::Changed,
            _ => Disposition::Continue,
        }
    }
}
