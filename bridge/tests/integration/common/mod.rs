//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard, OnceLock};

use iced_x86::code_asm::*;
use iced_x86::IcedError;
use nativebridge_intercept::code::allocator::{CodeAllocator, CodeSlice};

/// Hooks are process-global; every test that installs one holds this lock.
pub fn lock_hook_tests() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}

/// Assemble `body` into a fresh executable page.
pub fn emit(body: impl FnOnce(&mut CodeAssembler) -> Result<(), IcedError>) -> CodeSlice {
    let mut alloc = CodeAllocator::default();
    let slice = alloc.alloc_any().expect("alloc");
    let mut a = CodeAssembler::new(64).expect("assembler");
    body(&mut a).expect("emit");
    let code = a.assemble(slice.pc as u64).expect("assemble");
    unsafe {
        slice.write(&code).expect("write");
        alloc.make_executable(&slice).expect("rx");
    }
    slice
}

pub type Mul = extern "C" fn(i32, i32) -> i32;

/// f(a, b) = a * b, padded so the prologue can be relocated.
pub fn make_mul() -> (CodeSlice, Mul) {
    let slice = emit(|a| {
        a.mov(eax, edi)?;
        a.imul_2(eax, esi)?;
        a.ret()?;
        for _ in 0..14 {
            a.nop()?;
        }
        Ok(())
    });
    let f: Mul = unsafe { core::mem::transmute(slice.pc) };
    (slice, f)
}

pub type Scale = extern "C" fn(f64, i32) -> f64;

/// f(x, n) = x * n.
pub fn make_scale() -> (CodeSlice, Scale) {
    let slice = emit(|a| {
        a.cvtsi2sd(xmm1, edi)?;
        a.mulsd(xmm0, xmm1)?;
        a.ret()?;
        for _ in 0..14 {
            a.nop()?;
        }
        Ok(())
    });
    let f: Scale = unsafe { core::mem::transmute(slice.pc) };
    (slice, f)
}

pub type Sum16 = extern "C" fn(i64, i64, i64, i64, i64, i64, i64, i64, i64, i64, i64, i64, i64, i64, i64, i64) -> i64;

/// Sum of sixteen integer arguments; the last ten arrive on the stack.
pub fn make_sum16() -> (CodeSlice, Sum16) {
    let slice = emit(|a| {
        a.mov(rax, rdi)?;
        a.add(rax, rsi)?;
        a.add(rax, rdx)?;
        a.add(rax, rcx)?;
        a.add(rax, r8)?;
        a.add(rax, r9)?;
        for slot in 0..10 {
            a.add(rax, qword_ptr(rsp + 8 * (slot + 1)))?;
        }
        a.ret()?;
        Ok(())
    });
    let f: Sum16 = unsafe { core::mem::transmute(slice.pc) };
    (slice, f)
}

/// Argument tuples seen by recording callbacks.
pub static SEEN: Mutex<Vec<(i64, i64)>> = Mutex::new(Vec::new());

pub fn seen(a: i64, b: i64) {
    SEEN.lock().unwrap_or_else(|e| e.into_inner()).push((a, b));
}

pub fn take_seen() -> Vec<(i64, i64)> {
    std::mem::take(&mut *SEEN.lock().unwrap_or_else(|e| e.into_inner()))
}
