//! A logger that calls the function being hooked while the hook is reported.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use log::{LevelFilter, Log, Metadata, Record};
use nativebridge::{hook_function, Disposition, ScriptContext, ValueType};

use crate::common::*;

/// Address of a `Mul` the logger calls once, on the next "hooked" record.
static TARGET: AtomicUsize = AtomicUsize::new(0);

struct CallingLogger;

impl Log for CallingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) || !record.args().to_string().starts_with("hooked") {
            return;
        }
        let target = TARGET.swap(0, Ordering::SeqCst);
        if target != 0 {
            let mul: Mul = unsafe { core::mem::transmute(target) };
            assert_eq!(mul(2, 3), 6);
        }
    }

    fn flush(&self) {}
}

static LOGGER: CallingLogger = CallingLogger;

unsafe extern "C" fn record_ints(ctx: *mut ScriptContext) {
    let ctx = &mut *ctx;
    seen(ctx.get_argument::<i32>(0) as i64, ctx.get_argument::<i32>(1) as i64);
    ctx.set_result(Disposition::Continue as i32);
}

#[test]
fn logger_may_call_the_function_it_reports_hooked() {
    let _g = lock_hook_tests();
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LevelFilter::Info);

    let (slice, mul) = make_mul();
    let address = slice.pc as usize;
    take_seen();
    TARGET.store(address, Ordering::SeqCst);

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(hook_function(address, &[ValueType::Int, ValueType::Int], Some(record_ints)));
    });
    let hook = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("hook_function did not return while its log record ran the hooked function")
        .expect("hook");

    assert_eq!(TARGET.load(Ordering::SeqCst), 0);
    assert_eq!(take_seen(), [(2, 3)]);
    assert_eq!(mul(4, 5), 20);
    assert_eq!(take_seen(), [(4, 5)]);
    hook.uninstall().unwrap();
}
