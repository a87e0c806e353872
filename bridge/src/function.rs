//! Native function descriptors and the typed invoker.

use core::ffi::{c_char, c_long, c_ulong, c_void};
use std::sync::{Mutex, MutexGuard};

use libffi::raw::ffi_abi;

use crate::call_vm::{CallVm, NativeArg};
use crate::context::{CallbackT, ScriptContext};
use crate::convention;
use crate::error::BridgeError;
use crate::hook::{self, HookHandle};
use crate::types::{Convention, DataType, ValueType, MAX_ARGUMENTS};

/// One native function: where it lives and how to call it.
///
/// The descriptor never owns the code at `address`. A hook added through it
/// is a separate resource: dropping the descriptor leaves the hook installed.
#[derive(Debug)]
pub struct NativeFunction {
    address: usize,
    convention: Convention,
    abi: Option<ffi_abi>,
    args: Vec<ValueType>,
    ret: Option<ValueType>,
    hook: Mutex<Option<HookHandle>>,
}

impl NativeFunction {
    /// Describe the function at `address`.
    ///
    /// # Safety
    /// If the descriptor is called or hooked, `address` must be a function
    /// taking `args` and returning `ret` under `convention`.
    pub unsafe fn new(address: *mut c_void, convention: Convention, args: &[DataType], ret: DataType) -> Result<Self, BridgeError> {
        if address.is_null() {
            return Err(BridgeError::NullAddress);
        }
        if args.len() > MAX_ARGUMENTS {
            return Err(BridgeError::TooManyArguments {
                count: args.len(),
                max: MAX_ARGUMENTS,
            });
        }
        let args = args
            .iter()
            .map(|tag| tag.as_value().ok_or(BridgeError::InvalidArgumentType(*tag)))
            .collect::<Result<Vec<_>, _>>()?;
        let ret = match ret {
            DataType::Void => None,
            DataType::Custom => return Err(BridgeError::InvalidReturnType(ret)),
            other => other.as_value(),
        };

        Ok(Self {
            address: address as usize,
            convention,
            abi: convention::resolve(convention),
            args,
            ret,
            hook: Mutex::new(None),
        })
    }

    /// Describe slot `index` of the vtable of `object`, called with the
    /// this-call convention. `args` includes the receiver.
    ///
    /// # Safety
    /// `object` must point to an object whose first word is a vtable with at
    /// least `index + 1` entries, plus the requirements of [`new`](Self::new).
    pub unsafe fn from_vtable(object: *mut c_void, index: usize, args: &[DataType], ret: DataType) -> Result<Self, BridgeError> {
        if object.is_null() {
            return Err(BridgeError::NullAddress);
        }
        let vtable = *(object as *const *const *mut c_void);
        if vtable.is_null() {
            return Err(BridgeError::NullAddress);
        }
        Self::new(*vtable.add(index), Convention::ThisCall, args, ret)
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn convention(&self) -> Convention {
        self.convention
    }

    pub fn arguments(&self) -> &[ValueType] {
        &self.args
    }

    pub fn return_type(&self) -> Option<ValueType> {
        self.ret
    }

    pub fn is_callable(&self) -> bool {
        self.convention != Convention::Custom && self.abi.is_some()
    }

    /// Call the function with arguments `offset..offset + arity` of `bag`
    /// and store its return value in the result slot.
    ///
    /// A descriptor that is not callable leaves `bag` untouched.
    pub fn call(&self, bag: &mut ScriptContext, offset: usize) -> Result<(), BridgeError> {
        let abi = match self.abi {
            Some(abi) if self.convention != Convention::Custom => abi,
            _ => {
                return Err(BridgeError::NotCallable {
                    address: self.address,
                    convention: self.convention,
                })
            }
        };
        let needed = offset + self.args.len();
        if needed > bag.argument_count() {
            return Err(BridgeError::ArgumentsOutOfRange {
                needed,
                available: bag.argument_count(),
            });
        }

        let mut vm = CallVm::acquire()?;
        vm.reset();
        vm.mode(abi);
        for (i, ty) in self.args.iter().enumerate() {
            vm.arg(stage(*ty, bag, offset + i));
        }
        unsafe { self.invoke(&vm, bag) };
        Ok(())
    }

    unsafe fn invoke(&self, vm: &CallVm, bag: &mut ScriptContext) {
        let addr = self.address;
        let Some(ret) = self.ret else {
            vm.call_void(addr);
            return;
        };

        let ty = ret.ffi_type();
        match ret {
            ValueType::Bool => bag.set_result(vm.call_word(addr, ty) as u8 != 0),
            ValueType::Char => bag.set_result(vm.call_word(addr, ty) as i8),
            ValueType::UChar => bag.set_result(vm.call_word(addr, ty) as u8),
            ValueType::Short => bag.set_result(vm.call_word(addr, ty) as i16),
            ValueType::UShort => bag.set_result(vm.call_word(addr, ty) as u16),
            ValueType::Int => bag.set_result(vm.call_word(addr, ty) as i32),
            ValueType::UInt => bag.set_result(vm.call_word(addr, ty) as u32),
            ValueType::Long => bag.set_result(vm.call_word(addr, ty) as c_long as i64),
            ValueType::ULong => bag.set_result(vm.call_word(addr, ty) as c_ulong as u64),
            ValueType::LongLong => bag.set_result(vm.call_word(addr, ty) as i64),
            ValueType::ULongLong => bag.set_result(vm.call_word(addr, ty)),
            ValueType::Float => bag.set_result(vm.call_float(addr)),
            ValueType::Double => bag.set_result(vm.call_double(addr)),
            ValueType::Pointer => bag.set_result(vm.call_word(addr, ty) as usize as *mut c_void),
            ValueType::String => bag.set_result(vm.call_word(addr, ty) as usize as *const c_char),
        }
    }

    fn lock_hook(&self) -> MutexGuard<'_, Option<HookHandle>> {
        self.hook.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hook the function and register `callback` as a listener.
    ///
    /// The first hook on an address installs the detour; later ones join its
    /// callback chain.
    pub fn add_hook(&self, callback: CallbackT) -> Result<HookHandle, BridgeError> {
        let mut slot = self.lock_hook();
        let handle = hook::hook_function(self.address, &self.args, Some(callback))?;
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// The hook this descriptor installed or joined, if it is still active.
    pub fn hook(&self) -> Option<HookHandle> {
        self.lock_hook().clone().filter(HookHandle::is_installed)
    }

    /// Unregister `callback`; the detour is removed with the last listener.
    pub fn remove_hook(&self, callback: CallbackT) -> Result<(), BridgeError> {
        let mut slot = self.lock_hook();
        let handle = hook::find_hook(self.address).ok_or(BridgeError::NotHooked(self.address))?;
        handle.remove_listener(callback);
        if handle.listener_count() == 0 {
            handle.uninstall()?;
            *slot = None;
        }
        Ok(())
    }
}

fn stage(ty: ValueType, bag: &ScriptContext, index: usize) -> NativeArg {
    match ty {
        ValueType::Bool => NativeArg::Bool(bag.get_argument(index)),
        ValueType::Char => NativeArg::Char(bag.get_argument(index)),
        ValueType::UChar => NativeArg::UChar(bag.get_argument(index)),
        ValueType::Short => NativeArg::Short(bag.get_argument(index)),
        ValueType::UShort => NativeArg::UShort(bag.get_argument(index)),
        ValueType::Int => NativeArg::Int(bag.get_argument(index)),
        ValueType::UInt => NativeArg::UInt(bag.get_argument(index)),
        ValueType::Long => NativeArg::Long(bag.get_argument::<i64>(index) as c_long),
        ValueType::ULong => NativeArg::ULong(bag.get_argument::<u64>(index) as c_ulong),
        ValueType::LongLong => NativeArg::LongLong(bag.get_argument(index)),
        ValueType::ULongLong => NativeArg::ULongLong(bag.get_argument(index)),
        ValueType::Float => NativeArg::Float(bag.get_argument(index)),
        ValueType::Double => NativeArg::Double(bag.get_argument(index)),
        ValueType::Pointer => NativeArg::Pointer(bag.get_argument::<*const c_void>(index)),
        ValueType::String => NativeArg::Pointer(bag.get_argument::<*const c_char>(index) as *const c_void),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ffi::CStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    extern "C" fn id_bool(v: bool) -> bool { v }
    extern "C" fn id_char(v: i8) -> i8 { v }
    extern "C" fn id_uchar(v: u8) -> u8 { v }
    extern "C" fn id_short(v: i16) -> i16 { v }
    extern "C" fn id_ushort(v: u16) -> u16 { v }
    extern "C" fn id_int(v: i32) -> i32 { v }
    extern "C" fn id_uint(v: u32) -> u32 { v }
    extern "C" fn id_long(v: c_long) -> c_long { v }
    extern "C" fn id_ulong(v: c_ulong) -> c_ulong { v }
    extern "C" fn id_longlong(v: i64) -> i64 { v }
    extern "C" fn id_ulonglong(v: u64) -> u64 { v }
    extern "C" fn id_float(v: f32) -> f32 { v }
    extern "C" fn id_double(v: f64) -> f64 { v }
    extern "C" fn id_pointer(v: *mut c_void) -> *mut c_void { v }
    extern "C" fn id_string(v: *const c_char) -> *const c_char { v }

    fn descriptor(address: usize, tag: DataType) -> NativeFunction {
        unsafe { NativeFunction::new(address as *mut c_void, Convention::Cdecl, &[tag], tag) }.expect("valid descriptor")
    }

    fn call_identity<T: crate::context::ScriptValue>(address: usize, tag: DataType, value: T) -> T {
        let function = descriptor(address, tag);
        let mut bag = ScriptContext::new();
        bag.push(value).unwrap();
        function.call(&mut bag, 0).expect("call");
        bag.get_result::<T>()
    }

    #[test]
    fn every_tag_survives_an_identity_call() {
        assert!(call_identity(id_bool as usize, DataType::Bool, true));
        assert!(!call_identity(id_bool as usize, DataType::Bool, false));
        assert_eq!(call_identity(id_char as usize, DataType::Char, -100i8), -100);
        assert_eq!(call_identity(id_uchar as usize, DataType::UChar, 250u8), 250);
        assert_eq!(call_identity(id_short as usize, DataType::Short, i16::MIN), i16::MIN);
        assert_eq!(call_identity(id_ushort as usize, DataType::UShort, u16::MAX), u16::MAX);
        assert_eq!(call_identity(id_int as usize, DataType::Int, -123_456i32), -123_456);
        assert_eq!(call_identity(id_uint as usize, DataType::UInt, u32::MAX), u32::MAX);
        assert_eq!(call_identity(id_long as usize, DataType::Long, -7i64), -7);
        assert_eq!(call_identity(id_ulong as usize, DataType::ULong, 7u64), 7);
        assert_eq!(call_identity(id_longlong as usize, DataType::LongLong, i64::MIN), i64::MIN);
        assert_eq!(call_identity(id_ulonglong as usize, DataType::ULongLong, u64::MAX), u64::MAX);
        assert_eq!(call_identity(id_float as usize, DataType::Float, -1.5f32).to_bits(), (-1.5f32).to_bits());
        assert_eq!(call_identity(id_double as usize, DataType::Double, 1e300f64).to_bits(), 1e300f64.to_bits());

        let marker = 0xDEAD_BEEFusize as *mut c_void;
        assert_eq!(call_identity(id_pointer as usize, DataType::Pointer, marker), marker);

        let text = c"bridge";
        let out = call_identity(id_string as usize, DataType::String, text.as_ptr());
        assert_eq!(unsafe { CStr::from_ptr(out) }, text);
    }

    static STUB_CALLS: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn counting_stub(v: i32) -> i32 {
        STUB_CALLS.fetch_add(1, Ordering::SeqCst);
        v
    }

    #[test]
    fn non_callable_descriptors_leave_the_bag_alone() {
        let custom = unsafe {
            NativeFunction::new(counting_stub as *mut c_void, Convention::Custom, &[DataType::Int], DataType::Int)
        }
        .unwrap();
        assert!(!custom.is_callable());

        let mut bag = ScriptContext::new();
        bag.push(5i32).unwrap();
        bag.set_result(77i32);
        let before = STUB_CALLS.load(Ordering::SeqCst);

        let err = custom.call(&mut bag, 0).unwrap_err();
        assert!(matches!(err, BridgeError::NotCallable { convention: Convention::Custom, .. }));
        assert_eq!(bag.get_result::<i32>(), 77);
        assert_eq!(STUB_CALLS.load(Ordering::SeqCst), before);

        #[cfg(not(windows))]
        {
            let stdcall = unsafe {
                NativeFunction::new(counting_stub as *mut c_void, Convention::StdCall, &[DataType::Int], DataType::Int)
            }
            .unwrap();
            assert!(!stdcall.is_callable());
            assert!(stdcall.call(&mut bag, 0).is_err());
            assert_eq!(bag.get_result::<i32>(), 77);
            assert_eq!(STUB_CALLS.load(Ordering::SeqCst), before);
        }
    }

    #[test]
    fn offset_selects_the_argument_window() {
        let function = descriptor(id_int as usize, DataType::Int);
        let mut bag = ScriptContext::new();
        bag.push(1i32).unwrap();
        bag.push(2i32).unwrap();
        bag.push(3i32).unwrap();

        function.call(&mut bag, 2).unwrap();
        assert_eq!(bag.get_result::<i32>(), 3);

        assert_eq!(
            function.call(&mut bag, 3),
            Err(BridgeError::ArgumentsOutOfRange { needed: 4, available: 3 })
        );
    }

    extern "C" fn sub(a: i32, b: i32) -> i32 {
        a - b
    }
    extern "C" fn half(v: f64) -> f64 {
        v / 2.0
    }

    #[test]
    fn sequential_calls_do_not_share_state() {
        let subtract = unsafe {
            NativeFunction::new(sub as *mut c_void, Convention::Cdecl, &[DataType::Int, DataType::Int], DataType::Int)
        }
        .unwrap();
        let halve = descriptor(half as usize, DataType::Double);

        let mut first = ScriptContext::new();
        first.push(10i32).unwrap();
        first.push(4i32).unwrap();
        subtract.call(&mut first, 0).unwrap();

        let mut second = ScriptContext::new();
        second.push(9.0f64).unwrap();
        halve.call(&mut second, 0).unwrap();

        assert_eq!(first.get_result::<i32>(), 6);
        assert_eq!(second.get_result::<f64>(), 4.5);
    }

    static VOID_HITS: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn void_target(by: u32) {
        VOID_HITS.fetch_add(by as usize, Ordering::SeqCst);
    }

    #[test]
    fn void_returns_leave_the_result_slot_alone() {
        let function = unsafe {
            NativeFunction::new(void_target as *mut c_void, Convention::Cdecl, &[DataType::UInt], DataType::Void)
        }
        .unwrap();
        let mut bag = ScriptContext::new();
        bag.push(3u32).unwrap();
        bag.set_result(11i32);
        let before = VOID_HITS.load(Ordering::SeqCst);
        function.call(&mut bag, 0).unwrap();
        assert_eq!(VOID_HITS.load(Ordering::SeqCst) - before, 3);
        assert_eq!(bag.get_result::<i32>(), 11);
    }

    #[repr(C)]
    struct FakeObject {
        vtable: *const usize,
        value: i32,
    }

    extern "C" fn read_value(this: *const FakeObject) -> i32 {
        unsafe { (*this).value }
    }
    extern "C" fn read_value_plus(this: *const FakeObject, extra: i32) -> i32 {
        unsafe { (*this).value + extra }
    }

    #[test]
    fn vtable_slots_resolve_and_take_the_receiver_first() {
        let vtable = [read_value as usize, read_value_plus as usize];
        let mut object = FakeObject { vtable: vtable.as_ptr(), value: 40 };
        let object_ptr = &mut object as *mut FakeObject as *mut c_void;

        let plus = unsafe {
            NativeFunction::from_vtable(object_ptr, 1, &[DataType::Pointer, DataType::Int], DataType::Int)
        }
        .unwrap();
        assert_eq!(plus.address(), read_value_plus as usize);
        assert_eq!(plus.convention(), Convention::ThisCall);

        let mut bag = ScriptContext::new();
        bag.push(object_ptr).unwrap();
        bag.push(2i32).unwrap();
        plus.call(&mut bag, 0).unwrap();
        assert_eq!(bag.get_result::<i32>(), 42);
        assert_eq!(object.value, 40);
    }

    #[test]
    fn construction_validates_tags() {
        let addr = id_int as *mut c_void;
        unsafe {
            assert_eq!(
                NativeFunction::new(addr, Convention::Cdecl, &[DataType::Void], DataType::Int).unwrap_err(),
                BridgeError::InvalidArgumentType(DataType::Void)
            );
            assert_eq!(
                NativeFunction::new(addr, Convention::Cdecl, &[DataType::Custom], DataType::Int).unwrap_err(),
                BridgeError::InvalidArgumentType(DataType::Custom)
            );
            assert_eq!(
                NativeFunction::new(addr, Convention::Cdecl, &[], DataType::Custom).unwrap_err(),
                BridgeError::InvalidReturnType(DataType::Custom)
            );
            assert_eq!(
                NativeFunction::new(core::ptr::null_mut(), Convention::Cdecl, &[], DataType::Void).unwrap_err(),
                BridgeError::NullAddress
            );
            let too_many = vec![DataType::Int; MAX_ARGUMENTS + 1];
            assert!(matches!(
                NativeFunction::new(addr, Convention::Cdecl, &too_many, DataType::Void),
                Err(BridgeError::TooManyArguments { count: 33, max: 32 })
            ));
        }
    }
}
