//! An in-process stand-in for the embedded Ruby runtime.
//!
//! It implements `RubyApi` closely enough for the boundary to be exercised without a Ruby
//! install: the same immediate encoding, a small core class tree, exceptions with backtraces,
//! blocks, procs and a loader for constant-only scripts. A non-local exit is a Rust unwind
//! carrying a `Jump`, and `protect` is the `catch_unwind` that stops it.
mod builtins;
mod heap;
mod script;

use std::{
    ffi::{CStr, c_char, c_int, c_void},
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::{Mutex, MutexGuard};

pub use heap::SimMethod;
use heap::{Body, Frame, QFALSE, QNIL, QTRUE, QUNDEF, SimState, fixnum_value, symbol};

use crate::{
    Id, RubyApi, Value, ValueType,
    api::{BlockFunc, TAG_BREAK, TAG_RAISE, Thunk},
};

pub const SIM_VERSION: &str = "3.4.1";

/// A non-local exit in flight.
pub(crate) struct Jump {
    tag: c_int,
    /// The iteration a break ends, `None` when no block is running.
    target: Option<u64>,
    value: Value,
}

#[derive(Debug, Copy, Clone)]
pub(crate) enum SimBlock {
    None,
    Func {
        func: BlockFunc,
        data: Value,
        target: u64,
    },
    Proc {
        proc: Value,
        target: u64,
    },
}

/// A method invocation as seen by a method body.
pub struct SimCall {
    pub receiver: Value,
    pub method: Id,
    pub args: Vec<Value>,
    /// The last argument is a keyword hash.
    pub kw_splat: bool,
    pub(crate) block: SimBlock,
}

pub struct SimRuby {
    state: Mutex<SimState>,
    setup_code: c_int,
    cleanup_code: Option<c_int>,
    setup_calls: AtomicUsize,
    cleanup_calls: AtomicUsize,
    intern_calls: AtomicUsize,
}

impl Default for SimRuby {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRuby {
    pub fn new() -> Self {
        let sim = Self {
            state: Mutex::new(SimState::new()),
            setup_code: 0,
            cleanup_code: None,
            setup_calls: AtomicUsize::new(0),
            cleanup_calls: AtomicUsize::new(0),
            intern_calls: AtomicUsize::new(0),
        };
        builtins::install(&sim);
        sim
    }

    /// `ruby_setup` will fail with `code`.
    pub fn with_setup_code(code: c_int) -> Self {
        Self {
            setup_code: code,
            ..Self::new()
        }
    }

    /// `ruby_cleanup` will report `code`.
    pub fn with_cleanup_code(code: c_int) -> Self {
        Self {
            cleanup_code: Some(code),
            ..Self::new()
        }
    }

    /// A runtime somebody else already brought up.
    pub fn preinitialized() -> Self {
        let sim = Self::new();
        sim.st().initialized = true;
        sim
    }

    pub fn setup_calls(&self) -> usize {
        self.setup_calls.load(Ordering::SeqCst)
    }

    pub fn cleanup_calls(&self) -> usize {
        self.cleanup_calls.load(Ordering::SeqCst)
    }

    pub fn intern_calls(&self) -> usize {
        self.intern_calls.load(Ordering::SeqCst)
    }

    /// Number of registered GC roots.
    pub fn pinned_count(&self) -> usize {
        self.st().pinned.len()
    }

    /// Define or replace an instance method of `class`.
    pub fn define_method<F>(&self, class: Value, name: &str, body: F)
    where
        F: Fn(&SimRuby, &SimCall) -> Value + Send + Sync + 'static,
    {
        self.def(class, name, Arc::new(body));
    }

    pub(crate) fn def(&self, class: Value, name: &str, body: SimMethod) {
        let mut state = self.st();
        let id = state.space.intern(name);
        state.methods.insert((class, id), body);
    }

    pub(crate) fn st(&self) -> MutexGuard<'_, SimState> {
        self.state.lock()
    }

    pub(crate) fn nil(&self) -> Value {
        Value::from_raw(QNIL)
    }

    pub(crate) fn boolean(&self, value: bool) -> Value {
        Value::from_raw(if value { QTRUE } else { QFALSE })
    }

    pub(crate) fn truthy(&self, value: Value) -> bool {
        value.raw() != QNIL && value.raw() != QFALSE
    }

    pub(crate) fn id(&self, name: &str) -> Id {
        self.st().space.intern(name)
    }

    pub(crate) fn id_name(&self, id: Id) -> String {
        self.st().space.name(id).to_string()
    }

    pub(crate) fn core(&self) -> heap::Core {
        self.st().core
    }

    pub(crate) fn push_frame(&self, file: &str, label: &str) -> usize {
        let mut state = self.st();
        state.frames.push(Frame {
            file: file.to_string(),
            line: 0,
            label: label.to_string(),
        });
        state.frames.len() - 1
    }

    pub(crate) fn set_line(&self, line: usize) {
        if let Some(frame) = self.st().frames.last_mut() {
            frame.line = line;
        }
    }

    pub(crate) fn truncate_frames(&self, depth: usize) {
        self.st().frames.truncate(depth);
    }

    fn depths(&self) -> (usize, usize) {
        let state = self.st();
        (state.frames.len(), state.yields.len())
    }

    fn restore(&self, (frames, yields): (usize, usize)) {
        let mut state = self.st();
        state.frames.truncate(frames);
        state.yields.truncate(yields);
    }

    fn next_target(&self) -> u64 {
        let mut state = self.st();
        state.next_target += 1;
        state.next_target
    }

    /// Raise a new `class` exception with `message`.
    pub(crate) fn raise(&self, class: Value, message: impl Into<String>) -> ! {
        let message = message.into();
        let exception = {
            let mut state = self.st();
            let message = state.new_string(message.as_bytes());
            let backtrace = state.backtrace();
            state.space.alloc(class, Body::Exception { message, backtrace })
        };
        self.raise_exception(exception)
    }

    pub(crate) fn raise_exception(&self, exception: Value) -> ! {
        let not_exception = {
            let mut state = self.st();
            let exception_class = state.core.exception;
            if state.is_kind_of(exception, exception_class) {
                let missing = matches!(
                    state.space.slot(exception).map(|slot| &slot.body),
                    Some(Body::Exception { backtrace, .. }) if backtrace.raw() == QNIL
                );
                if missing {
                    let trace = state.backtrace();
                    if let Some(slot) = state.space.slot_mut(exception) {
                        if let Body::Exception { backtrace, .. } = &mut slot.body {
                            *backtrace = trace;
                        }
                    }
                }
                state.errinfo = exception;
                None
            } else {
                Some(state.core.type_error)
            }
        };
        if let Some(type_error) = not_exception {
            self.raise(type_error, "exception class/object expected");
        }
        panic::resume_unwind(Box::new(Jump {
            tag: TAG_RAISE,
            target: None,
            value: exception,
        }))
    }

    fn break_out(&self, value: Value) -> ! {
        let target = self.st().yields.last().copied().flatten();
        panic::resume_unwind(Box::new(Jump {
            tag: TAG_BREAK,
            target,
            value,
        }))
    }

    /// Run `body`, stopping a break aimed at `target`.
    fn iterate(&self, target: u64, body: impl FnOnce() -> Value) -> Value {
        let depths = self.depths();
        match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(value) => value,
            Err(payload) => match payload.downcast::<Jump>() {
                Ok(jump) if jump.tag == TAG_BREAK && jump.target == Some(target) => {
                    self.restore(depths);
                    jump.value
                }
                Ok(jump) => panic::resume_unwind(jump),
                Err(payload) => panic::resume_unwind(payload),
            },
        }
    }

    /// `"nil"`, `"an instance of Foo"`, `"class Foo"`, as used in `NoMethodError` messages.
    pub(crate) fn describe(&self, value: Value) -> String {
        let state = self.st();
        match state.value_type(value) {
            ValueType::Nil => "nil".to_string(),
            ValueType::True => "true".to_string(),
            ValueType::False => "false".to_string(),
            ValueType::Module => {
                let kind = if state.module(value).is_some_and(|data| data.is_class) {
                    "class"
                } else {
                    "module"
                };
                format!("{kind} {}", state.module_name(value))
            }
            _ => format!("an instance of {}", state.class_name(value)),
        }
    }

    pub(crate) fn dispatch(
        &self,
        receiver: Value,
        method: Id,
        args: &[Value],
        kw_splat: bool,
        block: SimBlock,
    ) -> Value {
        let body = {
            let state = self.st();
            state.find_method(state.class_of(receiver), method)
        };
        let Some(body) = body else {
            let name = self.id_name(method);
            let no_method_error = self.core().no_method_error;
            let description = self.describe(receiver);
            self.raise(
                no_method_error,
                format!("undefined method '{name}' for {description}"),
            )
        };
        let call = SimCall {
            receiver,
            method,
            args: args.to_vec(),
            kw_splat,
            block,
        };
        (*body)(self, &call)
    }

    /// Call a method by name with no block.
    pub(crate) fn send(&self, receiver: Value, name: &str, args: &[Value]) -> Value {
        let method = self.id(name);
        self.dispatch(receiver, method, args, false, SimBlock::None)
    }

    pub(crate) fn responds_to(&self, receiver: Value, name: &str) -> bool {
        let method = self.id(name);
        let state = self.st();
        state.find_method(state.class_of(receiver), method).is_some()
    }

    fn call_block_func(
        &self,
        func: BlockFunc,
        data: Value,
        args: &[Value],
        target: Option<u64>,
        blockarg: Value,
    ) -> Value {
        let depth = {
            let mut state = self.st();
            state.yields.push(target);
            state.yields.len() - 1
        };
        let yielded = args.first().copied().unwrap_or(self.nil());
        let Ok(argc) = c_int::try_from(args.len()) else {
            let argument_error = self.core().argument_error;
            self.raise(argument_error, "too many arguments")
        };
        // SAFETY: func and data were handed to us together by block_call or proc_new
        let result = unsafe { func(yielded, data, argc, args.as_ptr(), blockarg) };
        self.st().yields.truncate(depth);
        result
    }

    fn proc_parts(&self, proc: Value) -> Option<(BlockFunc, Value)> {
        match self.st().space.slot(proc).map(|slot| &slot.body) {
            Some(&Body::Proc { func, data }) => Some((func, data)),
            _ => None,
        }
    }

    pub(crate) fn call_proc(
        &self,
        proc: Value,
        args: &[Value],
        target: Option<u64>,
        blockarg: Value,
    ) -> Value {
        let Some((func, data)) = self.proc_parts(proc) else {
            let type_error = self.core().type_error;
            let description = self.describe(proc);
            self.raise(type_error, format!("wrong argument type {description} (expected Proc)"))
        };
        self.call_block_func(func, data, args, target, blockarg)
    }

    /// `yield` from a method body.
    pub(crate) fn yield_block(&self, call: &SimCall, args: &[Value]) -> Value {
        match call.block {
            SimBlock::None => {
                let local_jump_error = self.core().local_jump_error;
                self.raise(local_jump_error, "no block given (yield)")
            }
            SimBlock::Func { func, data, target } => {
                self.call_block_func(func, data, args, Some(target), self.nil())
            }
            SimBlock::Proc { proc, target } => self.call_proc(proc, args, Some(target), self.nil()),
        }
    }

    pub(crate) fn block_given(&self, call: &SimCall) -> bool {
        !matches!(call.block, SimBlock::None)
    }

    fn string_arg(&self, value: Value) -> String {
        let bytes = self.st().bytes_of(value);
        match bytes {
            Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            None => {
                let type_error = self.core().type_error;
                let description = self.describe(value);
                self.raise(
                    type_error,
                    format!("no implicit conversion of {description} into String"),
                )
            }
        }
    }

    fn parse_options(&self, argv: &[String]) -> bool {
        let mut load_path = Vec::new();
        let mut args = argv.iter().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--disable-gems" | "--disable=gems" | "-w" | "-W" | "-W0" | "-W1" | "-W2" => {}
                "-e" => {
                    // the program itself is never run by the sim
                    if args.next().is_none() {
                        return false;
                    }
                }
                "-I" => match args.next() {
                    Some(dir) => load_path.push(PathBuf::from(dir)),
                    None => return false,
                },
                other if other.starts_with("-I") => load_path.push(PathBuf::from(&other[2..])),
                other => {
                    log::warn!("sim: invalid option {other}");
                    return false;
                }
            }
        }
        if let Ok(rubylib) = std::env::var("RUBYLIB") {
            load_path.extend(std::env::split_paths(&rubylib));
        }
        self.st().load_path.extend(load_path);
        true
    }
}

impl RubyApi for SimRuby {
    fn qnil(&self) -> Value {
        Value::from_raw(QNIL)
    }

    fn qtrue(&self) -> Value {
        Value::from_raw(QTRUE)
    }

    fn qfalse(&self) -> Value {
        Value::from_raw(QFALSE)
    }

    fn qundef(&self) -> Value {
        Value::from_raw(QUNDEF)
    }

    unsafe fn value_type(&self, value: Value) -> ValueType {
        self.st().value_type(value)
    }

    fn fix2long(&self, value: Value) -> i64 {
        fixnum_value(value)
    }

    unsafe fn float_value(&self, value: Value) -> f64 {
        self.st().float_of(value).unwrap_or(0.0)
    }

    unsafe fn bignum_negative(&self, value: Value) -> bool {
        self.st().int_of(value).is_some_and(|big| big < 0)
    }

    fn is_initialized(&self) -> bool {
        self.st().initialized
    }

    unsafe fn setup(&self) -> c_int {
        self.setup_calls.fetch_add(1, Ordering::SeqCst);
        if self.setup_code == 0 {
            self.st().initialized = true;
        }
        self.setup_code
    }

    unsafe fn options(&self, argv: &mut [*mut c_char]) -> *mut c_void {
        let argv: Vec<String> = argv
            .iter()
            .map(|&arg| {
                // SAFETY: the caller guarantees NUL-terminated strings
                unsafe { CStr::from_ptr(arg) }.to_string_lossy().into_owned()
            })
            .collect();
        if self.parse_options(&argv) {
            (&raw const *self).cast_mut().cast()
        } else {
            std::ptr::null_mut()
        }
    }

    unsafe fn executable_node(&self, node: *mut c_void, status: &mut c_int) -> bool {
        if node.is_null() {
            *status = 1;
            return false;
        }
        *status = 0;
        true
    }

    unsafe fn cleanup(&self, code: c_int) -> c_int {
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        self.st().initialized = false;
        self.cleanup_code.unwrap_or(code)
    }

    fn version(&self) -> String {
        SIM_VERSION.to_string()
    }

    fn description(&self) -> String {
        format!(
            "ruby {SIM_VERSION} (rubygate sim) [{}-{}]",
            std::env::consts::ARCH,
            std::env::consts::OS
        )
    }

    fn object_class(&self) -> Value {
        self.st().core.object
    }

    unsafe fn protect(&self, thunk: Thunk, data: usize, status: &mut c_int) -> Value {
        let depths = self.depths();
        // SAFETY: the caller pairs thunk with its data
        match panic::catch_unwind(AssertUnwindSafe(|| unsafe { thunk(data) })) {
            Ok(result) => {
                *status = 0;
                Value::from_raw(result)
            }
            Err(payload) => match payload.downcast::<Jump>() {
                Ok(jump) => {
                    self.restore(depths);
                    *status = jump.tag;
                    self.qnil()
                }
                Err(payload) => panic::resume_unwind(payload),
            },
        }
    }

    fn errinfo(&self) -> Value {
        self.st().errinfo
    }

    unsafe fn set_errinfo(&self, value: Value) {
        self.st().errinfo = value;
    }

    unsafe fn load(&self, path: Value, wrap: bool) {
        let path = self.string_arg(path);
        script::load(self, &path, wrap);
    }

    unsafe fn intern(&self, name: &CStr) -> Id {
        self.intern_calls.fetch_add(1, Ordering::SeqCst);
        self.id(&name.to_string_lossy())
    }

    fn id2sym(&self, id: Id) -> Value {
        symbol(id)
    }

    unsafe fn const_get(&self, module: Value, id: Id) -> Value {
        self.lookup_constant(module, id, false)
    }

    unsafe fn const_get_at(&self, module: Value, id: Id) -> Value {
        self.lookup_constant(module, id, true)
    }

    unsafe fn funcallv(&self, receiver: Value, method: Id, args: &[Value], kw_splat: bool) -> Value {
        self.dispatch(receiver, method, args, kw_splat, SimBlock::None)
    }

    unsafe fn block_call(
        &self,
        receiver: Value,
        method: Id,
        args: &[Value],
        func: BlockFunc,
        data: Value,
    ) -> Value {
        let target = self.next_target();
        self.iterate(target, || {
            self.dispatch(receiver, method, args, false, SimBlock::Func { func, data, target })
        })
    }

    unsafe fn funcall_with_block(
        &self,
        receiver: Value,
        method: Id,
        args: &[Value],
        block: Value,
    ) -> Value {
        if block.raw() == QNIL {
            return self.dispatch(receiver, method, args, false, SimBlock::None);
        }
        let target = self.next_target();
        self.iterate(target, || {
            self.dispatch(receiver, method, args, false, SimBlock::Proc { proc: block, target })
        })
    }

    unsafe fn proc_new(&self, func: BlockFunc, data: Value) -> Value {
        let mut state = self.st();
        let class = state.core.proc_class;
        state.space.alloc(class, Body::Proc { func, data })
    }

    unsafe fn proc_call_with_block(&self, proc: Value, args: &[Value], block: Value) -> Value {
        self.call_proc(proc, args, None, block)
    }

    unsafe fn cvar_get(&self, class: Value, id: Id) -> Value {
        let name = self.id_name(id);
        let found = self.st().class_var(class, id);
        if let Some(value) = found {
            return value;
        }
        let core = self.core();
        if !name.starts_with("@@") {
            self.raise(
                core.name_error,
                format!("'{name}' is not allowed as a class variable name"),
            );
        }
        let module = self.st().module_name(class);
        self.raise(
            core.name_error,
            format!("uninitialized class variable {name} in {module}"),
        )
    }

    unsafe fn inspect(&self, value: Value) -> Value {
        let inspected = self.send(value, "inspect", &[]);
        // SAFETY: we are already wherever our caller is
        unsafe { self.string(inspected) }
    }

    unsafe fn string(&self, value: Value) -> Value {
        if self.st().value_type(value) == ValueType::String {
            return value;
        }
        let converted = self.send(value, "to_s", &[]);
        if self.st().value_type(converted) != ValueType::String {
            let type_error = self.core().type_error;
            let class = self.st().class_name(value);
            self.raise(type_error, format!("can't convert {class} to String"));
        }
        converted
    }

    unsafe fn string_bytes(&self, value: Value) -> Vec<u8> {
        let bytes = self.st().bytes_of(value);
        match bytes {
            Some(bytes) => bytes,
            None => {
                let type_error = self.core().type_error;
                let class = self.st().class_name(value);
                self.raise(type_error, format!("wrong argument type {class} (expected String)"))
            }
        }
    }

    unsafe fn integer(&self, value: Value) -> Value {
        self.to_integer(value)
    }

    unsafe fn float(&self, value: Value) -> Value {
        self.to_float(value)
    }

    unsafe fn num2long(&self, value: Value) -> i64 {
        self.num_to_long(value)
    }

    unsafe fn num2ulong(&self, value: Value) -> u64 {
        self.num_to_ulong(value)
    }

    unsafe fn num2dbl(&self, value: Value) -> f64 {
        self.num_to_double(value)
    }

    unsafe fn hash_new(&self) -> Value {
        let mut state = self.st();
        let class = state.core.hash;
        state.space.alloc(class, Body::Hash(Vec::new()))
    }

    unsafe fn hash_aset(&self, hash: Value, key: Value, value: Value) {
        self.hash_store(hash, key, value);
    }

    unsafe fn raise_type_error(&self, message: &CStr) -> ! {
        let type_error = self.core().type_error;
        self.raise(type_error, message.to_string_lossy())
    }

    unsafe fn raise_runtime_error(&self, message: &CStr) -> ! {
        let runtime_error = self.core().runtime_error;
        self.raise(runtime_error, message.to_string_lossy())
    }

    unsafe fn exc_raise(&self, exception: Value) -> ! {
        self.raise_exception(exception)
    }

    unsafe fn iter_break(&self) -> ! {
        self.break_out(self.nil())
    }

    unsafe fn iter_break_value(&self, value: Value) -> ! {
        self.break_out(value)
    }

    fn int2num(&self, value: i64) -> Value {
        self.st().integer(value as i128)
    }

    fn uint2num(&self, value: u64) -> Value {
        self.st().integer(value as i128)
    }

    fn float_new(&self, value: f64) -> Value {
        self.st().new_float(value)
    }

    fn str_new(&self, bytes: &[u8]) -> Value {
        self.st().new_string(bytes)
    }

    unsafe fn gc_register(&self, slot: *mut Value) {
        self.st().pinned.insert(slot as usize);
    }

    unsafe fn gc_unregister(&self, slot: *mut Value) {
        self.st().pinned.remove(&(slot as usize));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TAG_BREAK;

    unsafe extern "C-unwind" fn raise_thunk(data: usize) -> usize {
        // SAFETY: the test passes a pointer to a live SimRuby
        let sim = unsafe { &*(data as *const SimRuby) };
        let argument_error = sim.core().argument_error;
        sim.raise(argument_error, "thunk failed")
    }

    unsafe extern "C-unwind" fn break_thunk(data: usize) -> usize {
        let sim = unsafe { &*(data as *const SimRuby) };
        // SAFETY: inside protect
        unsafe { sim.iter_break_value(sim.int2num(9)) }
    }

    unsafe extern "C-unwind" fn ok_thunk(_data: usize) -> usize {
        QTRUE
    }

    #[test]
    fn protect_reports_raise_and_sets_errinfo() {
        let sim = SimRuby::new();
        let mut status = 0;
        let result = unsafe { sim.protect(raise_thunk, (&raw const sim) as usize, &mut status) };
        assert_eq!(status, TAG_RAISE);
        assert_eq!(result, sim.qnil());
        let message = sim.send(sim.errinfo(), "message", &[]);
        assert_eq!(sim.st().bytes_of(message), Some(b"thunk failed".to_vec()));
    }

    #[test]
    fn stray_break_reaches_protect_without_exception() {
        let sim = SimRuby::new();
        let mut status = 0;
        unsafe { sim.protect(break_thunk, (&raw const sim) as usize, &mut status) };
        assert_eq!(status, TAG_BREAK);
        assert_eq!(sim.errinfo(), sim.qnil(), "a break is not an exception");
    }

    #[test]
    fn protect_passes_the_thunk_result_through() {
        let sim = SimRuby::new();
        let mut status = -1;
        let result = unsafe { sim.protect(ok_thunk, 0, &mut status) };
        assert_eq!(status, 0);
        assert_eq!(result, sim.qtrue());
    }

    #[test]
    fn foreign_panics_are_not_swallowed() {
        unsafe extern "C-unwind" fn panicking(_data: usize) -> usize {
            panic!("not a jump")
        }
        let sim = SimRuby::new();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut status = 0;
            unsafe { sim.protect(panicking, 0, &mut status) };
        }));
        assert!(outcome.is_err(), "only Jump payloads may be caught by protect");
    }

    #[test]
    fn unknown_options_give_no_node() {
        let sim = SimRuby::new();
        let args = [c"ruby".to_owned(), c"--bogus".to_owned()];
        let mut argv: Vec<*mut c_char> = args.iter().map(|a| a.as_ptr().cast_mut()).collect();
        let node = unsafe { sim.options(&mut argv) };
        let mut status = 0;
        assert!(!unsafe { sim.executable_node(node, &mut status) });
        assert_ne!(status, 0);
    }

    #[test]
    fn define_method_sees_keyword_flag() {
        let sim = SimRuby::new();
        let object = sim.object_class();
        sim.define_method(object, "kw?", |sim, call| sim.boolean(call.kw_splat));
        let id = sim.id("kw?");
        let plain = unsafe { sim.funcallv(object, id, &[], false) };
        let kw = unsafe { sim.funcallv(object, id, &[sim.nil()], true) };
        assert_eq!((plain, kw), (sim.qfalse(), sim.qtrue()));
    }
}
