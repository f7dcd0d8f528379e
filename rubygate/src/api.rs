//! The slice of the Ruby C API the boundary is built on.
//!
//! Methods marked `unsafe` may perform a non-local exit (raise, break, throw). They must only
//! be reached from inside [`RubyApi::protect`], i.e. from a job run by the barrier, and the
//! calling frame must not own anything with a destructor while they run.
use std::ffi::{CStr, c_char, c_int, c_void};

use crate::{Id, Value, ValueType};

/// The single function shape `rb_protect` accepts. `data` carries a pointer to the job frame.
pub type Thunk = unsafe extern "C-unwind" fn(data: usize) -> usize;

/// `rb_block_call_func_t`: what the runtime calls when it yields to a host block or proc.
pub type BlockFunc = unsafe extern "C-unwind" fn(
    yielded: Value,
    data: Value,
    argc: c_int,
    argv: *const Value,
    blockarg: Value,
) -> Value;

// ruby_tag_type
pub const TAG_NONE: c_int = 0x0;
pub const TAG_RETURN: c_int = 0x1;
pub const TAG_BREAK: c_int = 0x2;
pub const TAG_NEXT: c_int = 0x3;
pub const TAG_RETRY: c_int = 0x4;
pub const TAG_REDO: c_int = 0x5;
pub const TAG_RAISE: c_int = 0x6;
pub const TAG_THROW: c_int = 0x7;
pub const TAG_FATAL: c_int = 0x8;

pub fn tag_name(tag: c_int) -> &'static str {
    match tag {
        TAG_NONE => "none",
        TAG_RETURN => "return",
        TAG_BREAK => "break",
        TAG_NEXT => "next",
        TAG_RETRY => "retry",
        TAG_REDO => "redo",
        TAG_RAISE => "raise",
        TAG_THROW => "throw",
        TAG_FATAL => "fatal",
        _ => "unknown",
    }
}

pub trait RubyApi: Send + Sync + 'static {
    fn qnil(&self) -> Value;
    fn qtrue(&self) -> Value;
    fn qfalse(&self) -> Value;
    fn qundef(&self) -> Value;

    /// # Safety
    /// `value` must be an immediate or a live object of this runtime; heap values are read
    /// through their object header.
    unsafe fn value_type(&self, value: Value) -> ValueType;
    /// `FIX2LONG`, only meaningful for `ValueType::Fixnum`
    fn fix2long(&self, value: Value) -> i64;
    /// `RFLOAT_VALUE`
    ///
    /// # Safety
    /// `value` must be a live `ValueType::Float`.
    unsafe fn float_value(&self, value: Value) -> f64;
    /// Sign of a `ValueType::Bignum`.
    ///
    /// # Safety
    /// May raise.
    unsafe fn bignum_negative(&self, value: Value) -> bool;

    /// Whether the interpreter has been brought up in this process by anyone.
    fn is_initialized(&self) -> bool;
    /// `ruby_setup`
    ///
    /// # Safety
    /// Only the VM lifecycle may bring the runtime up, once per process.
    unsafe fn setup(&self) -> c_int;
    /// `ruby_options`
    ///
    /// # Safety
    /// `argv` must point at NUL-terminated strings that outlive the call.
    unsafe fn options(&self, argv: &mut [*mut c_char]) -> *mut c_void;
    /// `ruby_executable_node`
    ///
    /// # Safety
    /// `node` must come from `options`.
    unsafe fn executable_node(&self, node: *mut c_void, status: &mut c_int) -> bool;
    /// `ruby_cleanup`
    ///
    /// # Safety
    /// Every `Value` handed out before is dangling afterwards. Only the VM lifecycle may call it.
    unsafe fn cleanup(&self, code: c_int) -> c_int;
    fn version(&self) -> String;
    fn description(&self) -> String;
    /// `rb_cObject`
    fn object_class(&self) -> Value;

    /// `rb_protect`: run `thunk(data)`, catching any non-local exit into `status`.
    ///
    /// # Safety
    /// `thunk` must treat `data` the way its caller packed it.
    unsafe fn protect(&self, thunk: Thunk, data: usize, status: &mut c_int) -> Value;
    /// `rb_errinfo`, the pending exception slot
    fn errinfo(&self) -> Value;
    /// # Safety
    /// The pending exception belongs to whoever surfaces the current protected call.
    unsafe fn set_errinfo(&self, value: Value);

    /// # Safety
    /// May raise.
    unsafe fn load(&self, path: Value, wrap: bool);
    /// # Safety
    /// May raise.
    unsafe fn intern(&self, name: &CStr) -> Id;
    fn id2sym(&self, id: Id) -> Value;
    /// # Safety
    /// May raise.
    unsafe fn const_get(&self, module: Value, id: Id) -> Value;
    /// # Safety
    /// May raise.
    unsafe fn const_get_at(&self, module: Value, id: Id) -> Value;
    /// `rb_funcallv_kw`; with `kw_splat` the last argument is a keyword hash.
    ///
    /// # Safety
    /// May raise.
    unsafe fn funcallv(&self, receiver: Value, method: Id, args: &[Value], kw_splat: bool)
    -> Value;
    /// `rb_block_call`
    ///
    /// # Safety
    /// May raise. `func` receives `data` back untouched.
    unsafe fn block_call(
        &self,
        receiver: Value,
        method: Id,
        args: &[Value],
        func: BlockFunc,
        data: Value,
    ) -> Value;
    /// `rb_funcall_with_block`
    ///
    /// # Safety
    /// May raise.
    unsafe fn funcall_with_block(
        &self,
        receiver: Value,
        method: Id,
        args: &[Value],
        block: Value,
    ) -> Value;
    /// `rb_proc_new`
    ///
    /// # Safety
    /// May raise. `data` must stay valid for as long as the proc can be called.
    unsafe fn proc_new(&self, func: BlockFunc, data: Value) -> Value;
    /// `rb_proc_call_with_block`, `block` is nil for none
    ///
    /// # Safety
    /// May raise.
    unsafe fn proc_call_with_block(&self, proc: Value, args: &[Value], block: Value) -> Value;
    /// `rb_cvar_get`
    ///
    /// # Safety
    /// May raise.
    unsafe fn cvar_get(&self, class: Value, id: Id) -> Value;
    /// `rb_inspect`
    ///
    /// # Safety
    /// May raise.
    unsafe fn inspect(&self, value: Value) -> Value;
    /// `rb_String`
    ///
    /// # Safety
    /// May raise.
    unsafe fn string(&self, value: Value) -> Value;
    /// Copy the bytes of a String.
    ///
    /// # Safety
    /// May raise.
    unsafe fn string_bytes(&self, value: Value) -> Vec<u8>;
    /// `rb_Integer`
    ///
    /// # Safety
    /// May raise.
    unsafe fn integer(&self, value: Value) -> Value;
    /// `rb_Float`
    ///
    /// # Safety
    /// May raise.
    unsafe fn float(&self, value: Value) -> Value;
    /// # Safety
    /// May raise.
    unsafe fn num2long(&self, value: Value) -> i64;
    /// Silently wraps negative numbers, see `job::Job::ToUlong`.
    ///
    /// # Safety
    /// May raise.
    unsafe fn num2ulong(&self, value: Value) -> u64;
    /// # Safety
    /// May raise.
    unsafe fn num2dbl(&self, value: Value) -> f64;
    /// # Safety
    /// May raise.
    unsafe fn hash_new(&self) -> Value;
    /// # Safety
    /// May raise.
    unsafe fn hash_aset(&self, hash: Value, key: Value, value: Value);

    /// # Safety
    /// Always jumps.
    unsafe fn raise_type_error(&self, message: &CStr) -> !;
    /// # Safety
    /// Always jumps.
    unsafe fn raise_runtime_error(&self, message: &CStr) -> !;
    /// `rb_exc_raise`
    ///
    /// # Safety
    /// Always jumps.
    unsafe fn exc_raise(&self, exception: Value) -> !;
    /// `rb_iter_break`
    ///
    /// # Safety
    /// Always jumps.
    unsafe fn iter_break(&self) -> !;
    /// `rb_iter_break_value`
    ///
    /// # Safety
    /// Always jumps.
    unsafe fn iter_break_value(&self, value: Value) -> !;

    fn int2num(&self, value: i64) -> Value;
    fn uint2num(&self, value: u64) -> Value;
    fn float_new(&self, value: f64) -> Value;
    fn str_new(&self, bytes: &[u8]) -> Value;

    /// `rb_gc_register_address`
    ///
    /// # Safety
    /// The runtime must be up, and `slot` must stay put until it is unregistered.
    unsafe fn gc_register(&self, slot: *mut Value);
    /// `rb_gc_unregister_address`
    ///
    /// # Safety
    /// The runtime must be up, and `slot` must have been registered.
    unsafe fn gc_unregister(&self, slot: *mut Value);
}
