//! Hooks installed with `hook_function` on emitted targets.

use nativebridge::{find_hook, hook_function, BridgeError, Disposition, ScriptContext, ValueType};

use crate::common::*;

const MUL_ARGS: [ValueType; 2] = [ValueType::Int, ValueType::Int];

unsafe extern "C" fn record_ints(ctx: *mut ScriptContext) {
    let ctx = &mut *ctx;
    seen(ctx.get_argument::<i32>(0) as i64, ctx.get_argument::<i32>(1) as i64);
    ctx.set_result(Disposition::Continue as i32);
}

unsafe extern "C" fn first_becomes_ten(ctx: *mut ScriptContext) {
    let ctx = &mut *ctx;
    ctx.set_argument(0, 10i32).unwrap();
    ctx.set_result(Disposition::Changed as i32);
}

unsafe extern "C" fn first_becomes_ten_quietly(ctx: *mut ScriptContext) {
    let ctx = &mut *ctx;
    ctx.set_argument(0, 10i32).unwrap();
    ctx.set_result(Disposition::Continue as i32);
}

unsafe extern "C" fn handle_call(ctx: *mut ScriptContext) {
    (*ctx).set_result(Disposition::Handled as i32);
}

unsafe extern "C" fn record_last_two(ctx: *mut ScriptContext) {
    let ctx = &mut *ctx;
    seen(ctx.get_argument::<i64>(14), ctx.get_argument::<i64>(15));
    ctx.set_result(Disposition::Continue as i32);
}

unsafe extern "C" fn last_becomes_hundred(ctx: *mut ScriptContext) {
    let ctx = &mut *ctx;
    ctx.set_argument(15, 100i64).unwrap();
    ctx.set_result(Disposition::Changed as i32);
}

unsafe extern "C" fn double_x(ctx: *mut ScriptContext) {
    let ctx = &mut *ctx;
    let x = ctx.get_argument::<f64>(0);
    ctx.set_argument(0, x * 2.0).unwrap();
    ctx.set_result(Disposition::Changed as i32);
}

#[test]
fn continue_forwards_to_the_original() {
    let _g = lock_hook_tests();
    let (slice, mul) = make_mul();
    let address = slice.pc as usize;
    take_seen();

    let hook = hook_function(address, &MUL_ARGS, Some(record_ints)).expect("hook");
    assert!(hook.is_installed());
    assert_eq!(mul(6, -7), -42);
    assert_eq!(take_seen(), [(6, -7)]);

    hook.uninstall().unwrap();
}

#[test]
fn changed_arguments_reach_the_original() {
    let _g = lock_hook_tests();
    let (slice, mul) = make_mul();

    let hook = hook_function(slice.pc as usize, &MUL_ARGS, Some(first_becomes_ten)).expect("hook");
    assert_eq!(mul(6, 7), 70);
    hook.uninstall().unwrap();
}

#[test]
fn edits_without_changed_are_discarded() {
    let _g = lock_hook_tests();
    let (slice, mul) = make_mul();

    let hook = hook_function(slice.pc as usize, &MUL_ARGS, Some(first_becomes_ten_quietly)).expect("hook");
    assert_eq!(mul(6, 7), 42);
    hook.uninstall().unwrap();
}

#[test]
fn handled_calls_return_zero_without_running_the_original() {
    let _g = lock_hook_tests();
    let (mul_slice, mul) = make_mul();
    let (scale_slice, scale) = make_scale();

    let mul_hook = hook_function(mul_slice.pc as usize, &MUL_ARGS, Some(handle_call)).expect("hook");
    let scale_hook = hook_function(
        scale_slice.pc as usize,
        &[ValueType::Double, ValueType::Int],
        Some(handle_call),
    )
    .expect("hook");

    assert_eq!(mul(6, 7), 0);
    assert_eq!(scale(1.5, 4), 0.0);

    mul_hook.uninstall().unwrap();
    scale_hook.uninstall().unwrap();
}

#[test]
fn float_arguments_are_captured_and_rewritten() {
    let _g = lock_hook_tests();
    let (slice, scale) = make_scale();

    let hook = hook_function(slice.pc as usize, &[ValueType::Double, ValueType::Int], Some(double_x)).expect("hook");
    assert_eq!(scale(1.5, 4), 12.0);
    hook.uninstall().unwrap();
    assert_eq!(scale(1.5, 4), 6.0);
}

#[test]
fn callbacks_on_one_address_share_a_chain() {
    let _g = lock_hook_tests();
    let (slice, mul) = make_mul();
    let address = slice.pc as usize;
    take_seen();

    let first = hook_function(address, &MUL_ARGS, Some(record_ints)).expect("hook");
    let second = hook_function(address, &MUL_ARGS, Some(first_becomes_ten)).expect("hook");
    assert_eq!(first.listener_count(), 2);
    assert_eq!(second.trampoline(), first.trampoline());

    // The recorder runs before the rewrite, so it sees the caller's values.
    assert_eq!(mul(3, 5), 50);
    assert_eq!(take_seen(), [(3, 5)]);

    assert!(first.remove_listener(first_becomes_ten));
    assert_eq!(mul(3, 5), 15);

    first.uninstall().unwrap();
    assert_eq!(second.uninstall(), Err(BridgeError::NotHooked(address)));
}

#[test]
fn uninstall_restores_the_original() {
    let _g = lock_hook_tests();
    let (slice, mul) = make_mul();
    let address = slice.pc as usize;
    let before = unsafe { core::slice::from_raw_parts(slice.pc, 5) }.to_vec();
    take_seen();

    let hook = hook_function(address, &MUL_ARGS, Some(record_ints)).expect("hook");
    assert!(find_hook(address).is_some());
    assert_ne!(unsafe { core::slice::from_raw_parts(slice.pc, 5) }, &before[..]);

    hook.uninstall().unwrap();
    assert!(!hook.is_installed());
    assert!(find_hook(address).is_none());
    assert_eq!(unsafe { core::slice::from_raw_parts(slice.pc, 5) }, &before[..]);

    assert_eq!(mul(2, 9), 18);
    assert!(take_seen().is_empty());
}

#[test]
fn an_address_can_be_hooked_again_after_uninstall() {
    let _g = lock_hook_tests();
    let (slice, mul) = make_mul();
    let address = slice.pc as usize;

    hook_function(address, &MUL_ARGS, Some(handle_call)).unwrap().uninstall().unwrap();
    let hook = hook_function(address, &MUL_ARGS, Some(first_becomes_ten)).expect("rehook");
    assert_eq!(mul(2, 9), 90);
    hook.uninstall().unwrap();
}

#[test]
fn hooked_functions_stay_hooked_across_threads() {
    let _g = lock_hook_tests();
    let (slice, mul) = make_mul();

    let hook = hook_function(slice.pc as usize, &MUL_ARGS, Some(first_becomes_ten)).expect("hook");
    let results: Vec<i32> = (1..=4)
        .map(|n| std::thread::spawn(move || mul(n, n)))
        .collect::<Vec<_>>()
        .into_iter()
        .map(|t| t.join().unwrap())
        .collect();
    assert_eq!(results, [10, 20, 30, 40]);
    hook.uninstall().unwrap();
}

#[test]
fn ten_stack_arguments_are_captured_and_forwarded() {
    let _g = lock_hook_tests();
    let (slice, sum16) = make_sum16();
    take_seen();

    let hook = hook_function(slice.pc as usize, &[ValueType::LongLong; 16], Some(record_last_two)).expect("hook");
    assert_eq!(sum16(1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16), 136);
    assert_eq!(take_seen(), [(15, 16)]);
    hook.uninstall().unwrap();
}

#[test]
fn changed_stack_arguments_reach_the_original() {
    let _g = lock_hook_tests();
    let (slice, sum16) = make_sum16();

    let hook = hook_function(slice.pc as usize, &[ValueType::LongLong; 16], Some(last_becomes_hundred)).expect("hook");
    assert_eq!(sum16(1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16), 136 - 16 + 100);
    hook.uninstall().unwrap();
    assert_eq!(sum16(1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16), 136);
}
