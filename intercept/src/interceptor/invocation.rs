//! Raw argument and return-value access for listeners.
//!
//! Arguments are addressed either by their plain integer-register index
//! (`get_nth_argument`) or by an [`ArgumentLocation`] computed from the
//! argument classes of a signature (`locate_arguments`), which also covers
//! floating-point registers and stack slots.

use crate::types::InvocationContext;

#[cfg(target_arch = "x86_64")]
use crate::types::X86_64CpuContext;

use core::ffi::c_void;

/// Register class an argument is passed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentClass {
    Integer,
    Float,
}

/// Where one argument lives at function entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentLocation {
    /// Index into the integer argument registers.
    IntRegister(usize),
    /// Index into the floating-point argument registers.
    FloatRegister(usize),
    /// Index of the 8-byte stack slot above the return address.
    Stack(usize),
}

// ── x86_64 (System V AMD64 ABI) ─────────────────────────────────────
//
// Arg0=RDI, Arg1=RSI, Arg2=RDX, Arg3=RCX, Arg4=R8, Arg5=R9
// Float args in XMM0-XMM7, everything else on the stack in order.
// Return value=RAX (integer) / XMM0 (float)

pub const INT_ARG_REGISTERS: usize = 6;
pub const FLOAT_ARG_REGISTERS: usize = 8;
/// Stack argument slots the wrapper copies when it forwards a call to the
/// original function. `Stack(k)` locations at or past this are not forwarded.
pub const MAX_STACK_ARGUMENTS: usize = 32;

/// Assign System V locations to a signature's arguments, in declared order.
///
/// Integer and float registers are consumed independently; once a class runs
/// out, its arguments spill to consecutive stack slots shared by both classes.
pub fn locate_arguments(classes: &[ArgumentClass]) -> Vec<ArgumentLocation> {
    let mut next_int = 0;
    let mut next_float = 0;
    let mut next_stack = 0;

    classes
        .iter()
        .map(|class| match class {
            ArgumentClass::Integer if next_int < INT_ARG_REGISTERS => {
                next_int += 1;
                ArgumentLocation::IntRegister(next_int - 1)
            }
            ArgumentClass::Float if next_float < FLOAT_ARG_REGISTERS => {
                next_float += 1;
                ArgumentLocation::FloatRegister(next_float - 1)
            }
            _ => {
                next_stack += 1;
                ArgumentLocation::Stack(next_stack - 1)
            }
        })
        .collect()
}

#[cfg(target_arch = "x86_64")]
#[inline]
unsafe fn cpu<'a>(ctx: *mut InvocationContext) -> &'a mut X86_64CpuContext {
    &mut *(*ctx).cpu_context
}

#[cfg(target_arch = "x86_64")]
fn int_register(cpu: &mut X86_64CpuContext, n: usize) -> Option<&mut u64> {
    match n {
        0 => Some(&mut cpu.rdi),
        1 => Some(&mut cpu.rsi),
        2 => Some(&mut cpu.rdx),
        3 => Some(&mut cpu.rcx),
        4 => Some(&mut cpu.r8),
        5 => Some(&mut cpu.r9),
        _ => None,
    }
}

/// # Safety
/// `ctx` must be a valid pointer to an active `InvocationContext`.
#[cfg(target_arch = "x86_64")]
pub unsafe fn get_nth_argument(ctx: *mut InvocationContext, n: u32) -> *mut c_void {
    match int_register(cpu(ctx), n as usize) {
        Some(reg) => *reg as usize as *mut c_void,
        None => core::ptr::null_mut(),
    }
}

/// # Safety
/// `ctx` must be a valid pointer to an active `InvocationContext`.
#[cfg(target_arch = "x86_64")]
pub unsafe fn replace_nth_argument(ctx: *mut InvocationContext, n: u32, value: *mut c_void) {
    if let Some(reg) = int_register(cpu(ctx), n as usize) {
        *reg = value as usize as u64;
    }
}

/// Read the raw 64-bit content of an argument location. Float registers
/// yield their low 64 bits.
///
/// # Safety
/// `ctx` must be a valid pointer to an active `InvocationContext`, and a
/// `Stack` location must be within the caller's pushed arguments.
#[cfg(target_arch = "x86_64")]
pub unsafe fn read_argument(ctx: *mut InvocationContext, location: ArgumentLocation) -> u64 {
    let cpu = cpu(ctx);
    match location {
        ArgumentLocation::IntRegister(n) => int_register(cpu, n).map_or(0, |reg| *reg),
        ArgumentLocation::FloatRegister(n) => cpu.xmm.get(n).map_or(0, |reg| *reg as u64),
        ArgumentLocation::Stack(k) => *((cpu.rsp as usize + 8 * k) as *const u64),
    }
}

/// Overwrite an argument location before the original function runs. Float
/// registers keep their upper lanes.
///
/// # Safety
/// Same as [`read_argument`]; stack slots belong to the caller's frame.
#[cfg(target_arch = "x86_64")]
pub unsafe fn write_argument(ctx: *mut InvocationContext, location: ArgumentLocation, value: u64) {
    let cpu = cpu(ctx);
    match location {
        ArgumentLocation::IntRegister(n) => {
            if let Some(reg) = int_register(cpu, n) {
                *reg = value;
            }
        }
        ArgumentLocation::FloatRegister(n) => {
            if let Some(reg) = cpu.xmm.get_mut(n) {
                *reg = (*reg & !(u64::MAX as u128)) | value as u128;
            }
        }
        ArgumentLocation::Stack(k) => *((cpu.rsp as usize + 8 * k) as *mut u64) = value,
    }
}

/// # Safety
/// `ctx` must be a valid pointer to an active `InvocationContext`.
#[cfg(target_arch = "x86_64")]
pub unsafe fn get_return_value(ctx: *mut InvocationContext) -> *mut c_void {
    cpu(ctx).rax as usize as *mut c_void
}

/// Set RAX and skip the original function.
///
/// # Safety
/// `ctx` must be a valid pointer to an active `InvocationContext`.
#[cfg(target_arch = "x86_64")]
pub unsafe fn replace_return_value(ctx: *mut InvocationContext, value: *mut c_void) {
    cpu(ctx).rax = value as usize as u64;
    (*ctx).skip_original = true;
}

/// Set the low 64 bits of XMM0 and skip the original function.
///
/// # Safety
/// `ctx` must be a valid pointer to an active `InvocationContext`.
#[cfg(target_arch = "x86_64")]
pub unsafe fn replace_float_return_value(ctx: *mut InvocationContext, bits: u64) {
    cpu(ctx).xmm[0] = bits as u128;
    (*ctx).skip_original = true;
}
