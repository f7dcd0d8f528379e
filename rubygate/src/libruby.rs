//! `RubyApi` on top of the system libruby (CRuby 3.2 or newer, 64-bit, flonum build).
use std::ffi::{CStr, c_char, c_int, c_long, c_void};

use crate::{BlockFunc, Id, RubyApi, Thunk, Value, ValueType};

#[allow(non_upper_case_globals, unused)]
mod ffi {
    use std::ffi::{c_char, c_int, c_long, c_void};

    use crate::{BlockFunc, Id, Thunk, Value};

    pub const Qfalse: usize = 0x00;
    pub const Qnil: usize = 0x04;
    pub const Qtrue: usize = 0x14;
    pub const Qundef: usize = 0x24;

    pub const FIXNUM_FLAG: usize = 0x01;
    pub const FLONUM_MASK: usize = 0x03;
    pub const FLONUM_FLAG: usize = 0x02;
    pub const SYMBOL_MASK: usize = 0xff;
    pub const SYMBOL_FLAG: usize = 0x0c;
    pub const IMMEDIATE_MASK: usize = 0x07;

    // ruby_value_type, the low bits of RBasic::flags
    pub const T_MASK: usize = 0x1f;
    pub const T_OBJECT: usize = 0x01;
    pub const T_CLASS: usize = 0x02;
    pub const T_MODULE: usize = 0x03;
    pub const T_FLOAT: usize = 0x04;
    pub const T_STRING: usize = 0x05;
    pub const T_ARRAY: usize = 0x07;
    pub const T_HASH: usize = 0x08;
    pub const T_BIGNUM: usize = 0x0a;
    pub const T_SYMBOL: usize = 0x14;
    pub const T_ICLASS: usize = 0x1c;

    unsafe extern "C-unwind" {
        pub static rb_cObject: Value;
        pub static rb_eTypeError: Value;
        pub static rb_eRuntimeError: Value;
        pub static ruby_version: c_char;
        pub static ruby_description: c_char;

        pub fn ruby_setup() -> c_int;
        pub fn ruby_options(argc: c_int, argv: *mut *mut c_char) -> *mut c_void;
        pub fn ruby_executable_node(node: *mut c_void, status: *mut c_int) -> c_int;
        pub fn ruby_cleanup(code: c_int) -> c_int;

        pub fn rb_protect(func: Thunk, data: usize, state: *mut c_int) -> Value;
        pub fn rb_errinfo() -> Value;
        pub fn rb_set_errinfo(err: Value);

        pub fn rb_load(path: Value, wrap: c_int);
        pub fn rb_intern(name: *const c_char) -> Id;
        pub fn rb_id2sym(id: Id) -> Value;
        pub fn rb_const_get(module: Value, id: Id) -> Value;
        pub fn rb_const_get_at(module: Value, id: Id) -> Value;
        pub fn rb_cvar_get(class: Value, id: Id) -> Value;

        pub fn rb_funcallv_kw(
            recv: Value,
            mid: Id,
            argc: c_int,
            argv: *const Value,
            kw_splat: c_int,
        ) -> Value;
        pub fn rb_block_call(
            obj: Value,
            mid: Id,
            argc: c_int,
            argv: *const Value,
            func: BlockFunc,
            data: Value,
        ) -> Value;
        pub fn rb_funcall_with_block(
            recv: Value,
            mid: Id,
            argc: c_int,
            argv: *const Value,
            procval: Value,
        ) -> Value;
        pub fn rb_proc_new(func: BlockFunc, data: Value) -> Value;
        pub fn rb_proc_call_with_block(
            proc: Value,
            argc: c_int,
            argv: *const Value,
            passed: Value,
        ) -> Value;

        pub fn rb_inspect(value: Value) -> Value;
        #[link_name = "rb_String"]
        pub fn rb_string(value: Value) -> Value;
        #[link_name = "rb_Integer"]
        pub fn rb_integer(value: Value) -> Value;
        #[link_name = "rb_Float"]
        pub fn rb_float(value: Value) -> Value;
        pub fn rb_string_value_ptr(value: *mut Value) -> *const c_char;

        pub fn rb_num2long(value: Value) -> c_long;
        pub fn rb_num2ulong(value: Value) -> usize;
        pub fn rb_num2dbl(value: Value) -> f64;
        pub fn rb_float_value(value: Value) -> f64;
        pub fn rb_float_new(value: f64) -> Value;
        pub fn rb_int2inum(value: isize) -> Value;
        pub fn rb_uint2inum(value: usize) -> Value;
        pub fn rb_big_cmp(x: Value, y: Value) -> Value;
        pub fn rb_str_new(ptr: *const c_char, len: c_long) -> Value;
        pub fn rb_hash_new() -> Value;
        pub fn rb_hash_aset(hash: Value, key: Value, value: Value) -> Value;

        pub fn rb_exc_new(class: Value, ptr: *const c_char, len: c_long) -> Value;
        pub fn rb_exc_raise(exception: Value) -> !;
        pub fn rb_iter_break() -> !;
        pub fn rb_iter_break_value(value: Value) -> !;

        pub fn rb_gc_register_address(slot: *mut Value);
        pub fn rb_gc_unregister_address(slot: *mut Value);
    }
}

#[inline]
fn fix2long(value: Value) -> i64 {
    (value.raw() as i64) >> 1
}

#[inline]
fn int2fix(value: i64) -> Value {
    Value::from_raw(((value << 1) as usize) | ffi::FIXNUM_FLAG)
}

/// The process's linked libruby. Stateless: the runtime keeps its own globals.
#[derive(Debug, Default, Copy, Clone)]
pub struct LibRuby;

impl LibRuby {
    fn raise_with(&self, class: Value, message: &CStr) -> ! {
        let bytes = message.to_bytes();
        // SAFETY: only reached from raising api methods, which run inside a barrier
        unsafe {
            let exception = ffi::rb_exc_new(class, bytes.as_ptr().cast(), bytes.len() as c_long);
            ffi::rb_exc_raise(exception)
        }
    }
}

impl RubyApi for LibRuby {
    fn qnil(&self) -> Value {
        Value::from_raw(ffi::Qnil)
    }

    fn qtrue(&self) -> Value {
        Value::from_raw(ffi::Qtrue)
    }

    fn qfalse(&self) -> Value {
        Value::from_raw(ffi::Qfalse)
    }

    fn qundef(&self) -> Value {
        Value::from_raw(ffi::Qundef)
    }

    unsafe fn value_type(&self, value: Value) -> ValueType {
        let raw = value.raw();
        match raw {
            ffi::Qfalse => return ValueType::False,
            ffi::Qnil => return ValueType::Nil,
            ffi::Qtrue => return ValueType::True,
            ffi::Qundef => return ValueType::Undef,
            _ => {}
        }
        if raw & ffi::FIXNUM_FLAG != 0 {
            return ValueType::Fixnum;
        }
        if raw & ffi::FLONUM_MASK == ffi::FLONUM_FLAG {
            return ValueType::Float;
        }
        if raw & ffi::SYMBOL_MASK == ffi::SYMBOL_FLAG {
            return ValueType::Symbol;
        }
        if raw & ffi::IMMEDIATE_MASK != 0 {
            return ValueType::Object;
        }
        // SAFETY: the caller passes a live object, which starts with RBasic::flags
        let flags = unsafe { *value.as_ptr::<usize>() };
        match flags & ffi::T_MASK {
            ffi::T_CLASS | ffi::T_MODULE | ffi::T_ICLASS => ValueType::Module,
            ffi::T_FLOAT => ValueType::Float,
            ffi::T_STRING => ValueType::String,
            ffi::T_ARRAY => ValueType::Array,
            ffi::T_HASH => ValueType::Hash,
            ffi::T_BIGNUM => ValueType::Bignum,
            ffi::T_SYMBOL => ValueType::Symbol,
            _ => ValueType::Object,
        }
    }

    fn fix2long(&self, value: Value) -> i64 {
        fix2long(value)
    }

    unsafe fn float_value(&self, value: Value) -> f64 {
        // SAFETY: forwarded to the caller
        unsafe { ffi::rb_float_value(value) }
    }

    unsafe fn bignum_negative(&self, value: Value) -> bool {
        // SAFETY: forwarded to the caller
        let order = unsafe { ffi::rb_big_cmp(value, int2fix(0)) };
        fix2long(order) < 0
    }

    fn is_initialized(&self) -> bool {
        // SAFETY: a plain read of a global the runtime sets during init
        unsafe { ffi::rb_cObject.raw() != 0 }
    }

    unsafe fn setup(&self) -> c_int {
        // SAFETY: forwarded to the caller
        unsafe { ffi::ruby_setup() }
    }

    unsafe fn options(&self, argv: &mut [*mut c_char]) -> *mut c_void {
        // SAFETY: forwarded to the caller, argc was checked when the args were built
        unsafe { ffi::ruby_options(argv.len() as c_int, argv.as_mut_ptr()) }
    }

    unsafe fn executable_node(&self, node: *mut c_void, status: &mut c_int) -> bool {
        // SAFETY: forwarded to the caller
        unsafe { ffi::ruby_executable_node(node, status) != 0 }
    }

    unsafe fn cleanup(&self, code: c_int) -> c_int {
        // SAFETY: forwarded to the caller
        unsafe { ffi::ruby_cleanup(code) }
    }

    fn version(&self) -> String {
        // SAFETY: a NUL terminated static array
        let version = unsafe { CStr::from_ptr(&raw const ffi::ruby_version) };
        version.to_string_lossy().into_owned()
    }

    fn description(&self) -> String {
        let description = unsafe { CStr::from_ptr(&raw const ffi::ruby_description) };
        description.to_string_lossy().into_owned()
    }

    fn object_class(&self) -> Value {
        unsafe { ffi::rb_cObject }
    }

    unsafe fn protect(&self, thunk: Thunk, data: usize, status: &mut c_int) -> Value {
        unsafe { ffi::rb_protect(thunk, data, status) }
    }

    fn errinfo(&self) -> Value {
        unsafe { ffi::rb_errinfo() }
    }

    unsafe fn set_errinfo(&self, value: Value) {
        // SAFETY: forwarded to the caller
        unsafe { ffi::rb_set_errinfo(value) }
    }

    unsafe fn load(&self, path: Value, wrap: bool) {
        unsafe { ffi::rb_load(path, c_int::from(wrap)) }
    }

    unsafe fn intern(&self, name: &CStr) -> Id {
        unsafe { ffi::rb_intern(name.as_ptr()) }
    }

    fn id2sym(&self, id: Id) -> Value {
        unsafe { ffi::rb_id2sym(id) }
    }

    unsafe fn const_get(&self, module: Value, id: Id) -> Value {
        unsafe { ffi::rb_const_get(module, id) }
    }

    unsafe fn const_get_at(&self, module: Value, id: Id) -> Value {
        unsafe { ffi::rb_const_get_at(module, id) }
    }

    unsafe fn funcallv(
        &self,
        receiver: Value,
        method: Id,
        args: &[Value],
        kw_splat: bool,
    ) -> Value {
        // argument counts are checked against c_int before a job is built
        unsafe {
            ffi::rb_funcallv_kw(
                receiver,
                method,
                args.len() as c_int,
                args.as_ptr(),
                c_int::from(kw_splat),
            )
        }
    }

    unsafe fn block_call(
        &self,
        receiver: Value,
        method: Id,
        args: &[Value],
        func: BlockFunc,
        data: Value,
    ) -> Value {
        unsafe {
            ffi::rb_block_call(
                receiver,
                method,
                args.len() as c_int,
                args.as_ptr(),
                func,
                data,
            )
        }
    }

    unsafe fn funcall_with_block(
        &self,
        receiver: Value,
        method: Id,
        args: &[Value],
        block: Value,
    ) -> Value {
        unsafe {
            ffi::rb_funcall_with_block(receiver, method, args.len() as c_int, args.as_ptr(), block)
        }
    }

    unsafe fn proc_new(&self, func: BlockFunc, data: Value) -> Value {
        unsafe { ffi::rb_proc_new(func, data) }
    }

    unsafe fn proc_call_with_block(&self, proc: Value, args: &[Value], block: Value) -> Value {
        unsafe { ffi::rb_proc_call_with_block(proc, args.len() as c_int, args.as_ptr(), block) }
    }

    unsafe fn cvar_get(&self, class: Value, id: Id) -> Value {
        unsafe { ffi::rb_cvar_get(class, id) }
    }

    unsafe fn inspect(&self, value: Value) -> Value {
        unsafe { ffi::rb_inspect(value) }
    }

    unsafe fn string(&self, value: Value) -> Value {
        unsafe { ffi::rb_string(value) }
    }

    unsafe fn string_bytes(&self, value: Value) -> Vec<u8> {
        let mut value = value;
        // SAFETY: both calls may raise, which the caller allows; the pointer is read before
        // anything else can run on the runtime side
        unsafe {
            let size_id = ffi::rb_intern(c"bytesize".as_ptr());
            let len = fix2long(ffi::rb_funcallv_kw(value, size_id, 0, std::ptr::null(), 0));
            let ptr = ffi::rb_string_value_ptr(&mut value);
            std::slice::from_raw_parts(ptr.cast::<u8>(), len as usize).to_vec()
        }
    }

    unsafe fn integer(&self, value: Value) -> Value {
        unsafe { ffi::rb_integer(value) }
    }

    unsafe fn float(&self, value: Value) -> Value {
        unsafe { ffi::rb_float(value) }
    }

    unsafe fn num2long(&self, value: Value) -> i64 {
        unsafe { ffi::rb_num2long(value) as i64 }
    }

    unsafe fn num2ulong(&self, value: Value) -> u64 {
        unsafe { ffi::rb_num2ulong(value) as u64 }
    }

    unsafe fn num2dbl(&self, value: Value) -> f64 {
        unsafe { ffi::rb_num2dbl(value) }
    }

    unsafe fn hash_new(&self) -> Value {
        unsafe { ffi::rb_hash_new() }
    }

    unsafe fn hash_aset(&self, hash: Value, key: Value, value: Value) {
        unsafe {
            ffi::rb_hash_aset(hash, key, value);
        }
    }

    unsafe fn raise_type_error(&self, message: &CStr) -> ! {
        self.raise_with(unsafe { ffi::rb_eTypeError }, message)
    }

    unsafe fn raise_runtime_error(&self, message: &CStr) -> ! {
        self.raise_with(unsafe { ffi::rb_eRuntimeError }, message)
    }

    unsafe fn exc_raise(&self, exception: Value) -> ! {
        unsafe { ffi::rb_exc_raise(exception) }
    }

    unsafe fn iter_break(&self) -> ! {
        unsafe { ffi::rb_iter_break() }
    }

    unsafe fn iter_break_value(&self, value: Value) -> ! {
        unsafe { ffi::rb_iter_break_value(value) }
    }

    fn int2num(&self, value: i64) -> Value {
        unsafe { ffi::rb_int2inum(value as isize) }
    }

    fn uint2num(&self, value: u64) -> Value {
        unsafe { ffi::rb_uint2inum(value as usize) }
    }

    fn float_new(&self, value: f64) -> Value {
        unsafe { ffi::rb_float_new(value) }
    }

    fn str_new(&self, bytes: &[u8]) -> Value {
        unsafe { ffi::rb_str_new(bytes.as_ptr().cast(), bytes.len() as c_long) }
    }

    unsafe fn gc_register(&self, slot: *mut Value) {
        // SAFETY: forwarded to the caller
        unsafe { ffi::rb_gc_register_address(slot) }
    }

    unsafe fn gc_unregister(&self, slot: *mut Value) {
        // SAFETY: forwarded to the caller
        unsafe { ffi::rb_gc_unregister_address(slot) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockReturn, Error, TAG_RAISE, VM, job::Job, protect};

    #[test]
    fn immediates_classify_without_the_runtime() {
        let ruby = LibRuby;
        // SAFETY: immediates are never dereferenced
        let kind = |value| unsafe { ruby.value_type(value) };
        assert_eq!(kind(ruby.qnil()), ValueType::Nil);
        assert_eq!(kind(ruby.qtrue()), ValueType::True);
        assert_eq!(kind(ruby.qfalse()), ValueType::False);
        assert_eq!(kind(ruby.qundef()), ValueType::Undef);
        assert_eq!(kind(int2fix(-5)), ValueType::Fixnum);
        assert_eq!(fix2long(int2fix(-5)), -5);
        assert_eq!(kind(Value::from_raw(0x1234_0c)), ValueType::Symbol);
    }

    // One interpreter per process, so every check against it lives in this one test.
    #[test]
    fn jumps_cross_the_real_runtime() {
        let vm = VM::new(LibRuby);
        vm.setup().unwrap();
        let api = vm.api();

        let protected = protect(api, Job::ToLong { value: api.str_new(b"not a number") });
        assert_eq!(protected.status, TAG_RAISE, "rb_protect must catch the ArgumentError");
        // SAFETY: the pending exception is ours to discard
        unsafe { api.set_errinfo(api.qnil()) };

        let array = vm.get_constant("Array").unwrap();
        let numbers = vm.call(array, "new", &[api.int2num(4), api.int2num(2)]).unwrap();
        let marker = api.str_new(b"stopped");
        let mut calls = 0;
        let result = vm
            .call_with_block(numbers, "each", &[], |_| {
                calls += 1;
                if calls == 2 {
                    BlockReturn::BreakValue(marker)
                } else {
                    BlockReturn::Value(api.qnil())
                }
            })
            .unwrap();
        assert_eq!(result, marker);
        assert_eq!(calls, 2, "rb_iter_break_value leaves the iteration");

        let exception = vm.new_exception("ArgumentError", "bad element").unwrap();
        let err = vm
            .call_with_block(numbers, "each", &[], |_| BlockReturn::Raise(exception))
            .unwrap_err();
        assert!(
            matches!(&err, Error::Exception(exc) if exc.description == "#<ArgumentError: bad element>"),
            "{err:?}"
        );

        let doubled = vm
            .call_with_block(numbers, "map", &[], |args| {
                BlockReturn::Value(api.int2num(fix2long(args[0]) * 2))
            })
            .unwrap();
        assert_eq!(vm.inspect(doubled), Ok("[4, 4, 4, 4]".to_string()));

        let pinned = vm.pin(marker).unwrap();
        drop(pinned);
        vm.cleanup();
        assert!(matches!(vm.pin(marker), Err(Error::Setup(_))));
    }
}
