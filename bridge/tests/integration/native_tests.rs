//! The script-facing natives driving a hooked function end to end.

use core::ffi::c_void;

use nativebridge::natives::{self, CREATE_FUNCTION, EXECUTE_FUNCTION, HOOK_FUNCTION, RELEASE_FUNCTION, UNHOOK_FUNCTION};
use nativebridge::{find_hook, BridgeError, Convention, DataType, Disposition, NativeRegistry, ScriptContext};

use crate::common::*;

unsafe extern "C" fn swap_arguments(ctx: *mut ScriptContext) {
    let ctx = &mut *ctx;
    let (a, b) = (ctx.get_argument::<i32>(0), ctx.get_argument::<i32>(1));
    seen(a as i64, b as i64);
    ctx.set_argument(0, b).unwrap();
    ctx.set_argument(1, a + 1).unwrap();
    ctx.set_result(Disposition::Changed as i32);
}

unsafe extern "C" fn stop_call(ctx: *mut ScriptContext) {
    (*ctx).set_result(Disposition::Stop as i32);
}

fn bag(values: &[u64]) -> ScriptContext {
    let mut ctx = ScriptContext::new();
    for v in values {
        ctx.push(*v).unwrap();
    }
    ctx
}

fn create_mul(registry: &NativeRegistry, address: usize) -> u64 {
    let mut ctx = ScriptContext::new();
    ctx.push(address as *mut c_void).unwrap();
    ctx.push(Convention::Cdecl as i32).unwrap();
    ctx.push(DataType::Int as i32).unwrap();
    ctx.push(2i32).unwrap();
    ctx.push(DataType::Int as i32).unwrap();
    ctx.push(DataType::Int as i32).unwrap();
    registry.invoke(CREATE_FUNCTION, &mut ctx).expect("create");
    ctx.get_result::<u64>()
}

fn execute(registry: &NativeRegistry, handle: u64, a: i32, b: i32) -> i32 {
    let mut ctx = ScriptContext::new();
    ctx.push(handle).unwrap();
    ctx.push(a).unwrap();
    ctx.push(b).unwrap();
    registry.invoke(EXECUTE_FUNCTION, &mut ctx).expect("execute");
    ctx.get_result::<i32>()
}

#[test]
fn hook_execute_unhook_round_trip() {
    let _g = lock_hook_tests();
    let registry = NativeRegistry::with_memory_natives();
    let (slice, mul) = make_mul();
    let address = slice.pc as usize;
    take_seen();

    let handle = create_mul(&registry, address);
    assert_eq!(execute(&registry, handle, 4, 5), 20);

    registry
        .invoke(HOOK_FUNCTION, &mut bag(&[handle, swap_arguments as usize as u64]))
        .expect("hook");
    assert!(natives::get_function(handle).unwrap().hook().is_some());

    // Invoked through the bridge and natively, the callback sees both calls.
    assert_eq!(execute(&registry, handle, 4, 5), 25);
    assert_eq!(mul(2, 3), 9);
    assert_eq!(take_seen(), [(4, 5), (2, 3)]);

    registry
        .invoke(UNHOOK_FUNCTION, &mut bag(&[handle, swap_arguments as usize as u64]))
        .expect("unhook");
    assert!(find_hook(address).is_none());
    assert_eq!(execute(&registry, handle, 4, 5), 20);

    registry.invoke(RELEASE_FUNCTION, &mut bag(&[handle])).expect("release");
}

#[test]
fn released_descriptors_leave_their_hook_installed() {
    let _g = lock_hook_tests();
    let registry = NativeRegistry::with_memory_natives();
    let (slice, mul) = make_mul();
    let address = slice.pc as usize;

    let handle = create_mul(&registry, address);
    registry
        .invoke(HOOK_FUNCTION, &mut bag(&[handle, stop_call as usize as u64]))
        .expect("hook");
    registry.invoke(RELEASE_FUNCTION, &mut bag(&[handle])).expect("release");

    assert_eq!(mul(6, 7), 0);
    let hook = find_hook(address).expect("still hooked");
    hook.uninstall().unwrap();
    assert_eq!(mul(6, 7), 42);

    let mut ctx = bag(&[handle, 1, 2]);
    assert_eq!(registry.invoke(EXECUTE_FUNCTION, &mut ctx), Err(BridgeError::InvalidHandle(handle)));
    assert!(ctx.has_error());
}

#[test]
fn unhooking_an_unhooked_function_reports_an_error() {
    let _g = lock_hook_tests();
    let registry = NativeRegistry::with_memory_natives();
    let (slice, _mul) = make_mul();

    let handle = create_mul(&registry, slice.pc as usize);
    let mut ctx = bag(&[handle, stop_call as usize as u64]);
    assert_eq!(
        registry.invoke(UNHOOK_FUNCTION, &mut ctx),
        Err(BridgeError::NotHooked(slice.pc as usize))
    );
    assert!(ctx.native_error().is_some_and(|m| m.contains("not hooked")));
    registry.invoke(RELEASE_FUNCTION, &mut bag(&[handle])).expect("release");
}
