use std::{
    collections::HashSet,
    ffi::{c_int, c_void},
    path::Path,
};

use parking_lot::Mutex;

use crate::{
    Error, ErrorHistory, Id, IdentifierKind, PinnedValue, RubyApi, VMCreateInfo, VMState, Value,
    callback::{self, BlockBody, BlockReturn, Callback, ProcBody, TrampolineData, proc_trampoline},
    job,
    lifecycle::Lifecycle,
};

/// A host closure turned into a Ruby proc. Kept until the VM goes away: Ruby may hold on to the
/// proc for as long as it likes.
struct HostProc<A: RubyApi> {
    body: Box<ProcBody>,
    data: TrampolineData<A>,
    proc: Box<Value>,
}

// SAFETY: only touched while holding the VM lock
unsafe impl<A: RubyApi> Send for HostProc<A> {}

/// The embedded Ruby VM.
///
/// There is one per process, reached through `VM::shared()`. Every operation takes the VM lock
/// and brings the interpreter up on first use.
pub struct VM<A: RubyApi> {
    lifecycle: Lifecycle<A>,
    procs: Mutex<Vec<Box<HostProc<A>>>>,
}

#[cfg(any(test, feature = "sim", feature = "libruby"))]
static SHARED: std::sync::OnceLock<VM<crate::DefaultApi>> = std::sync::OnceLock::new();

#[cfg(any(test, feature = "sim", feature = "libruby"))]
impl VM<crate::DefaultApi> {
    pub fn shared() -> &'static VM<crate::DefaultApi> {
        SHARED.get_or_init(|| VM::new(crate::DefaultApi::default()))
    }
}

fn check_method(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(Error::BadIdentifier {
            kind: IdentifierKind::Method,
            id: name.to_string(),
        });
    }
    Ok(())
}

fn check_constant(name: &str) -> Result<(), Error> {
    let valid = name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
        && name.chars().all(|c| c.is_alphanumeric() || c == '_');
    if !valid {
        return Err(Error::BadIdentifier {
            kind: IdentifierKind::Constant,
            id: name.to_string(),
        });
    }
    Ok(())
}

fn check_class_var(name: &str) -> Result<(), Error> {
    let valid = name.len() > 2
        && name.starts_with("@@")
        && name[2..].chars().all(|c| c.is_alphanumeric() || c == '_');
    if !valid {
        return Err(Error::BadIdentifier {
            kind: IdentifierKind::ClassVariable,
            id: name.to_string(),
        });
    }
    Ok(())
}

impl<A: RubyApi> VM<A> {
    pub(crate) fn new(api: A) -> Self {
        Self {
            lifecycle: Lifecycle::new(api),
            procs: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn api(&self) -> &A {
        self.lifecycle.api()
    }

    pub fn history(&self) -> &ErrorHistory {
        self.lifecycle.history()
    }

    pub fn state(&self) -> VMState {
        self.lifecycle.state()
    }

    pub fn setup(&self) -> Result<bool, Error> {
        self.lifecycle.setup(&VMCreateInfo::default())
    }

    pub fn setup_with(&self, info: &VMCreateInfo) -> Result<bool, Error> {
        self.lifecycle.setup(info)
    }

    pub fn cleanup(&self) -> c_int {
        let code = self.lifecycle.cleanup();
        // the runtime is gone, nothing can call these procs any more
        if self.lifecycle.state() == VMState::CleanedUp {
            self.procs.lock().clear();
        }
        code
    }

    pub fn get_id(&self, name: &str) -> Result<Id, Error> {
        self.lifecycle.get_id(name)
    }

    pub fn version(&self) -> Result<String, Error> {
        let _guard = self.lifecycle.lock();
        self.lifecycle.ensure_setup()?;
        Ok(self.api().version())
    }

    pub fn description(&self) -> Result<String, Error> {
        let _guard = self.lifecycle.lock();
        self.lifecycle.ensure_setup()?;
        Ok(self.api().description())
    }

    /// Record `error` in the history and hand it back, for failures found on the host side.
    pub fn raise(&self, error: Error) -> Error {
        self.lifecycle.raise(error)
    }

    /// Replace the closure-based block callback. Once per process, before the VM is set up.
    /// Host closures can no longer be passed to `call_with_block` afterwards.
    pub fn register_block_callback(&self, func: Callback) -> Result<(), Error> {
        callback::register_block_callback(func).map_err(|error| self.raise(error))
    }

    /// Replace the closure-based proc callback. Same rules as `register_block_callback`.
    pub fn register_proc_callback(&self, func: Callback) -> Result<(), Error> {
        callback::register_proc_callback(func).map_err(|error| self.raise(error))
    }

    fn check(&self, status: c_int) -> Result<(), Error> {
        if status != 0 {
            return Err(self.lifecycle.surface(status));
        }
        Ok(())
    }

    fn validated(&self, check: Result<(), Error>) -> Result<(), Error> {
        check.map_err(|error| self.raise(error))
    }

    pub fn nil(&self) -> Value {
        self.api().qnil()
    }

    pub fn is_nil(&self, value: Value) -> bool {
        value == self.api().qnil()
    }

    pub fn load(&self, path: impl AsRef<Path>, wrap: bool) -> Result<(), Error> {
        let _guard = self.lifecycle.lock();
        self.lifecycle.ensure_setup()?;
        let path = path.as_ref().to_str().ok_or_else(|| {
            self.raise(Error::BadParameter(format!(
                "script path is not UTF-8: {}",
                path.as_ref().display()
            )))
        })?;
        log::debug!("load {path} (wrap: {wrap})");
        let path = self.api().str_new(path.as_bytes());
        let (_, status) = job::load_protect(self.api(), path, wrap);
        self.check(status)
    }

    pub fn object_class(&self) -> Result<Value, Error> {
        let _guard = self.lifecycle.lock();
        self.lifecycle.ensure_setup()?;
        Ok(self.api().object_class())
    }

    /// Look up a constant from the top level. `A::B::C` paths are walked one name at a time.
    pub fn get_constant(&self, path: &str) -> Result<Value, Error> {
        let _guard = self.lifecycle.lock();
        let mut current = self.object_class()?;
        for name in path.trim_start_matches("::").split("::") {
            current = self.get_constant_in(current, name)?;
        }
        Ok(current)
    }

    /// `rb_const_get`: searches `module`'s ancestors, and `Object` for modules.
    pub fn get_constant_in(&self, module: Value, name: &str) -> Result<Value, Error> {
        let _guard = self.lifecycle.lock();
        self.validated(check_constant(name))?;
        let id = self.get_id(name)?;
        let (value, status) = job::const_get_protect(self.api(), module, id);
        self.check(status)?;
        Ok(value)
    }

    /// `rb_const_get_at`: only `module` itself.
    pub fn get_constant_at(&self, module: Value, name: &str) -> Result<Value, Error> {
        let _guard = self.lifecycle.lock();
        self.validated(check_constant(name))?;
        let id = self.get_id(name)?;
        let (value, status) = job::const_get_at_protect(self.api(), module, id);
        self.check(status)?;
        Ok(value)
    }

    pub fn class_var(&self, class: Value, name: &str) -> Result<Value, Error> {
        let _guard = self.lifecycle.lock();
        self.validated(check_class_var(name))?;
        let id = self.get_id(name)?;
        let (value, status) = job::cvar_get_protect(self.api(), class, id);
        self.check(status)?;
        Ok(value)
    }

    pub fn call(&self, receiver: Value, method: &str, args: &[Value]) -> Result<Value, Error> {
        let _guard = self.lifecycle.lock();
        self.validated(check_method(method))?;
        let id = self.get_id(method)?;
        check_argc(args.len()).map_err(|error| self.raise(error))?;
        let (value, status) = job::funcallv_protect(self.api(), receiver, id, args);
        self.check(status)?;
        Ok(value)
    }

    /// Call with keyword arguments after the positional ones.
    pub fn call_kw(
        &self,
        receiver: Value,
        method: &str,
        args: &[Value],
        kwargs: &[(&str, Value)],
    ) -> Result<Value, Error> {
        let _guard = self.lifecycle.lock();
        self.validated(check_method(method))?;

        let mut seen = HashSet::new();
        for (name, _) in kwargs {
            if !seen.insert(*name) {
                return Err(self.raise(Error::DuplicateKwArg(name.to_string())));
            }
        }
        if kwargs.is_empty() {
            return self.call(receiver, method, args);
        }

        let id = self.get_id(method)?;
        let mut pairs = Vec::with_capacity(kwargs.len());
        for &(name, value) in kwargs {
            pairs.push((self.get_id(name)?, value));
        }
        let (hash, status) = job::kw_hash_protect(self.api(), &pairs);
        self.check(status)?;

        let mut all = Vec::with_capacity(args.len() + 1);
        all.extend_from_slice(args);
        all.push(hash);
        check_argc(all.len()).map_err(|error| self.raise(error))?;
        let (value, status) = job::funcallv_kw_protect(self.api(), receiver, id, &all);
        self.check(status)?;
        Ok(value)
    }

    /// Call `method` with a host closure as its block.
    pub fn call_with_block<F>(
        &self,
        receiver: Value,
        method: &str,
        args: &[Value],
        mut body: F,
    ) -> Result<Value, Error>
    where
        F: FnMut(&[Value]) -> BlockReturn,
    {
        let _guard = self.lifecycle.lock();
        self.validated(check_method(method))?;
        let id = self.get_id(method)?;
        check_argc(args.len()).map_err(|error| self.raise(error))?;
        if !callback::closure_blocks_installed() {
            return Err(self.raise(Error::BadParameter(
                "a custom block callback is registered, host closures cannot be blocks".to_string(),
            )));
        }

        let mut body: BlockBody<'_> = &mut body;
        let context = (&raw mut body).cast::<c_void>();
        let (value, status) = job::block_call_protect(self.api(), receiver, id, args, context);
        self.check(status)?;
        Ok(value)
    }

    /// Call `method` with an existing proc as its block.
    pub fn call_with_proc(
        &self,
        receiver: Value,
        method: &str,
        args: &[Value],
        proc: Value,
    ) -> Result<Value, Error> {
        let _guard = self.lifecycle.lock();
        self.validated(check_method(method))?;
        let id = self.get_id(method)?;
        check_argc(args.len()).map_err(|error| self.raise(error))?;
        let (value, status) = job::block_call_proc_protect(self.api(), receiver, id, args, proc);
        self.check(status)?;
        Ok(value)
    }

    /// Make a Ruby proc that runs `body`.
    pub fn new_proc<F>(&self, body: F) -> Result<Value, Error>
    where
        F: Fn(&[Value]) -> BlockReturn + Send + Sync + 'static,
    {
        let _guard = self.lifecycle.lock();
        self.lifecycle.ensure_setup()?;

        let body: Box<ProcBody> = Box::new(Box::new(body));
        let context = (&raw const *body).cast_mut().cast::<c_void>();
        let mut host = Box::new(HostProc {
            body,
            data: TrampolineData::new(self.api(), context),
            proc: Box::new(self.api().qnil()),
        });

        let data = (&raw const host.data).cast::<c_void>();
        let (proc, status) = job::proc_new_protect(self.api(), proc_trampoline::<A>, data);
        self.check(status)?;
        *host.proc = proc;
        // SAFETY: the runtime is up and the boxed slot lives in `procs` until cleanup
        unsafe { self.api().gc_register(&raw mut *host.proc) };
        log::debug!("host proc {:#x} created", proc.raw());
        self.procs.lock().push(host);
        Ok(proc)
    }

    pub fn call_proc(
        &self,
        proc: Value,
        args: &[Value],
        block: Option<Value>,
    ) -> Result<Value, Error> {
        let _guard = self.lifecycle.lock();
        self.lifecycle.ensure_setup()?;
        check_argc(args.len()).map_err(|error| self.raise(error))?;
        let (value, status) = job::proc_call_protect(self.api(), proc, args, block);
        self.check(status)?;
        Ok(value)
    }

    /// `Class.new(message)` for an exception class, ready for `BlockReturn::Raise`.
    pub fn new_exception(&self, class: &str, message: &str) -> Result<Value, Error> {
        let _guard = self.lifecycle.lock();
        let class = self.get_constant(class)?;
        let message = self.api().str_new(message.as_bytes());
        self.call(class, "new", &[message])
    }

    pub fn inspect(&self, value: Value) -> Result<String, Error> {
        let _guard = self.lifecycle.lock();
        self.lifecycle.ensure_setup()?;
        let (bytes, status) = job::inspect_protect(self.api(), value);
        self.check(status)?;
        Ok(String::from_utf8_lossy(&bytes.unwrap_or_default()).into_owned())
    }

    /// `rb_String`, then the bytes as UTF-8.
    pub fn to_s(&self, value: Value) -> Result<String, Error> {
        let _guard = self.lifecycle.lock();
        self.lifecycle.ensure_setup()?;
        let (bytes, status) = job::string_protect(self.api(), value);
        self.check(status)?;
        String::from_utf8(bytes.unwrap_or_default())
            .map_err(|err| self.raise(Error::BadType(format!("string is not UTF-8: {err}"))))
    }

    pub fn to_u64(&self, value: Value) -> Result<u64, Error> {
        let _guard = self.lifecycle.lock();
        self.lifecycle.ensure_setup()?;
        let (number, status) = job::obj2ulong_protect(self.api(), value);
        self.check(status)?;
        Ok(number)
    }

    pub fn to_i64(&self, value: Value) -> Result<i64, Error> {
        let _guard = self.lifecycle.lock();
        self.lifecycle.ensure_setup()?;
        let (number, status) = job::obj2long_protect(self.api(), value);
        self.check(status)?;
        Ok(number)
    }

    pub fn to_f64(&self, value: Value) -> Result<f64, Error> {
        let _guard = self.lifecycle.lock();
        self.lifecycle.ensure_setup()?;
        let (number, status) = job::obj2double_protect(self.api(), value);
        self.check(status)?;
        Ok(number)
    }

    /// Run `f` against the api with the VM lock held and the interpreter up, for the
    /// non-raising constructors (`int2num`, `str_new`, ...).
    pub fn with_api<R>(&self, f: impl FnOnce(&A) -> R) -> Result<R, Error> {
        let _guard = self.lifecycle.lock();
        self.lifecycle.ensure_setup()?;
        Ok(f(self.api()))
    }

    /// Keep `value` alive for as long as the returned box is.
    pub fn pin(&self, value: Value) -> Result<PinnedValue<'_, A>, Error> {
        PinnedValue::new(self, value)
    }

    pub(crate) fn register_slot(&self, slot: *mut Value) -> Result<(), Error> {
        let _guard = self.lifecycle.lock();
        self.lifecycle.ensure_setup()?;
        // SAFETY: the runtime is up and the slot is boxed by its PinnedValue
        unsafe { self.api().gc_register(slot) };
        Ok(())
    }

    pub(crate) fn release_slot(&self, slot: *mut Value) {
        let _guard = self.lifecycle.lock();
        // a slot is only registered while set up, and cleanup drops every root
        if self.lifecycle.is_setup() {
            // SAFETY: registered by register_slot, the runtime is still up
            unsafe { self.api().gc_unregister(slot) };
        }
    }
}

fn check_argc(len: usize) -> Result<(), Error> {
    if c_int::try_from(len).is_err() {
        return Err(Error::BadParameter(format!("too many arguments: {len}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use super::*;
    use crate::{Exception, FromRuby, RawBlockReturn, ToRuby, api::TAG_BREAK, sim::SimRuby};

    fn vm() -> VM<SimRuby> {
        let vm = VM::new(SimRuby::new());
        vm.setup().unwrap();
        vm
    }

    fn script(name: &str, source: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rubygate-vm-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, source).unwrap();
        path
    }

    fn array(vm: &VM<SimRuby>, items: &[i64]) -> Value {
        let items: Vec<Value> = items.iter().map(|&i| vm.api().int2num(i)).collect();
        let array_class = vm.get_constant("Array").unwrap();
        let array = vm.call(array_class, "new", &[]).unwrap();
        for item in items {
            vm.call(array, "push", &[item]).unwrap();
        }
        array
    }

    fn exception_of(err: Error) -> Exception {
        match err {
            Error::Exception(exception) => exception,
            other => panic!("expected a wrapped exception, got {other:?}"),
        }
    }

    #[test]
    fn operations_set_up_lazily() {
        let vm = VM::new(SimRuby::new());
        assert_eq!(vm.state(), VMState::Unknown);
        vm.get_id("puts").unwrap();
        assert_eq!(vm.state(), VMState::Setup);
        assert_eq!(vm.setup(), Ok(false));
    }

    #[test]
    fn load_defines_constants() {
        let vm = vm();
        let path = script("consts.rb", "ANSWER = 42\nGREETING = \"hi\"\n");
        vm.load(&path, false).unwrap();
        let answer = vm.get_constant("ANSWER").unwrap();
        assert_eq!(vm.to_i64(answer), Ok(42));
        assert_eq!(vm.to_s(vm.get_constant("GREETING").unwrap()), Ok("hi".to_string()));
    }

    #[test]
    fn wrapped_load_keeps_constants_out_of_object() {
        let vm = vm();
        let path = script("wrapped.rb", "HIDDEN = 1\n");
        vm.load(&path, true).unwrap();
        let err = vm.get_constant("HIDDEN").unwrap_err();
        assert!(
            exception_of(err).description.contains("NameError"),
            "wrapped constants must not leak into Object"
        );
    }

    #[test]
    fn load_of_missing_file_is_a_load_error() {
        let vm = vm();
        let err = vm.load("/definitely/not/here.rb", false).unwrap_err();
        assert!(exception_of(err).description.contains("LoadError"));
    }

    #[test]
    fn syntax_errors_run_nothing() {
        let vm = vm();
        let path = script("broken.rb", "EARLY = 1\ndef nope\n");
        let err = exception_of(vm.load(&path, false).unwrap_err());
        assert!(err.description.starts_with("#<SyntaxError"), "{}", err.description);
        assert!(err.description.contains("broken.rb:2"));
        assert!(vm.get_constant("EARLY").is_err(), "a file that fails to parse is not run");
    }

    #[test]
    fn class_bodies_show_up_in_backtraces() {
        let vm = vm();
        let path = script(
            "nested_raise.rb",
            "module Deep\n  class Failing\n    raise ArgumentError, \"inside\"\n  end\nend\n",
        );
        let err = exception_of(vm.load(&path, false).unwrap_err());
        assert_eq!(err.description, "#<ArgumentError: inside>");
        assert!(err.backtrace[0].ends_with("nested_raise.rb:3:in '<class:Failing>'"));
        assert!(err.backtrace[1].ends_with("nested_raise.rb:2:in '<module:Deep>'"));
        assert!(err.backtrace[2].ends_with("nested_raise.rb:1:in '<top (required)>'"));
        let failing = vm.get_constant("Deep::Failing").unwrap();
        assert_eq!(vm.inspect(failing), Ok("Deep::Failing".to_string()));
    }

    #[test]
    fn raise_in_script_carries_backtrace() {
        let vm = vm();
        let path = script("raises.rb", "X = 1\n\nraise \"kaboom\"\n");
        let err = vm.load(&path, false).unwrap_err();
        let exception = exception_of(err);
        assert_eq!(exception.description, "#<RuntimeError: kaboom>");
        assert!(
            exception.backtrace[0].ends_with("raises.rb:3:in '<top (required)>'"),
            "backtrace: {:?}",
            exception.backtrace
        );
    }

    #[test]
    fn constant_paths_and_class_variables() {
        let vm = vm();
        let path = script(
            "classes.rb",
            "class Outer\n  LIMIT = 5\n  @@count = 7\n  class Inner\n    DEPTH = 2\n  end\nend\n",
        );
        vm.load(&path, false).unwrap();
        assert_eq!(vm.to_i64(vm.get_constant("Outer::LIMIT").unwrap()), Ok(5));
        assert_eq!(vm.to_i64(vm.get_constant("::Outer::Inner::DEPTH").unwrap()), Ok(2));

        let outer = vm.get_constant("Outer").unwrap();
        assert_eq!(vm.to_i64(vm.class_var(outer, "@@count").unwrap()), Ok(7));
        assert!(vm.get_constant_at(outer, "Inner").is_ok());
        assert!(vm.get_constant_at(outer, "String").is_err(), "_at must not search Object");
        assert!(vm.get_constant_in(outer, "String").is_ok());
    }

    #[test]
    fn bad_identifiers_never_reach_the_runtime() {
        let vm = vm();
        let object = vm.object_class().unwrap();
        let calls = vm.api().intern_calls();

        assert!(matches!(
            vm.get_constant_in(object, "lowercase"),
            Err(Error::BadIdentifier { kind: IdentifierKind::Constant, .. })
        ));
        assert!(matches!(
            vm.class_var(object, "count"),
            Err(Error::BadIdentifier { kind: IdentifierKind::ClassVariable, .. })
        ));
        assert!(matches!(
            vm.call(object, "", &[]),
            Err(Error::BadIdentifier { kind: IdentifierKind::Method, .. })
        ));
        assert_eq!(vm.api().intern_calls(), calls);
        assert_eq!(vm.history().len(), 3, "validation failures are recorded too");
    }

    #[test]
    fn method_errors_are_wrapped() {
        let vm = vm();
        let err = vm.call(vm.nil(), "no_such_method", &[]).unwrap_err();
        let exception = exception_of(err);
        assert!(exception.description.contains("NoMethodError"), "{}", exception.description);
        assert!(exception.description.contains("no_such_method"));
    }

    #[test]
    fn block_sees_every_element() {
        let vm = vm();
        let numbers = array(&vm, &[1, 2, 3]);
        let mut seen = Vec::new();
        let result = vm
            .call_with_block(numbers, "each", &[], |args| {
                seen.push(args[0]);
                BlockReturn::Value(args[0])
            })
            .unwrap();
        assert_eq!(result, numbers, "each returns its receiver");
        let seen: Vec<i64> = seen.into_iter().map(|v| vm.to_i64(v).unwrap()).collect();
        assert_eq!(seen, [1, 2, 3]);
    }

    #[test]
    fn block_values_come_back_through_map() {
        let vm = vm();
        let numbers = array(&vm, &[1, 2, 3]);
        let doubled = vm
            .call_with_block(numbers, "map", &[], |args| {
                let n = vm.to_i64(args[0]).unwrap();
                BlockReturn::Value(vm.api().int2num(n * 2))
            })
            .unwrap();
        assert_eq!(vm.inspect(doubled), Ok("[2, 4, 6]".to_string()));
    }

    #[test]
    fn break_with_value_ends_the_iteration() {
        let vm = vm();
        let numbers = array(&vm, &[1, 2, 3, 4]);
        let marker = vm.api().str_new(b"stopped");
        let mut calls = 0;
        let result = vm
            .call_with_block(numbers, "each", &[], |_| {
                calls += 1;
                if calls == 2 {
                    BlockReturn::BreakValue(marker)
                } else {
                    BlockReturn::Value(vm.nil())
                }
            })
            .unwrap();
        assert_eq!(result, marker, "the iterating call returns the break value");
        assert_eq!(calls, 2, "no element after the break is visited");
    }

    #[test]
    fn plain_break_returns_nil() {
        let vm = vm();
        let numbers = array(&vm, &[1, 2]);
        let result = vm
            .call_with_block(numbers, "each", &[], |_| BlockReturn::Break)
            .unwrap();
        assert!(vm.is_nil(result));
    }

    #[test]
    fn raise_from_block_surfaces_the_exception() {
        let vm = vm();
        let numbers = array(&vm, &[1]);
        let exception = vm.new_exception("ArgumentError", "bad element").unwrap();
        let err = vm
            .call_with_block(numbers, "each", &[], |_| BlockReturn::Raise(exception))
            .unwrap_err();
        let wrapped = exception_of(err);
        assert_eq!(wrapped.description, "#<ArgumentError: bad element>");
    }

    #[test]
    fn nested_protected_calls_inside_a_block() {
        let vm = vm();
        let outer = array(&vm, &[1, 2]);
        let mut inner_errors = 0;
        let result = vm.call_with_block(outer, "each", &[], |args| {
            // a failing call inside the block is contained at its own level
            if vm.call(args[0], "no_such_method", &[]).is_err() {
                inner_errors += 1;
            }
            let inner = array(&vm, &[10, 20]);
            let sum = vm
                .call_with_block(inner, "each", &[], |_| BlockReturn::Break)
                .unwrap();
            BlockReturn::Value(sum)
        });
        assert!(result.is_ok(), "the outer iteration is unaffected: {result:?}");
        assert_eq!(inner_errors, 2);
    }

    #[test]
    fn host_procs_run_as_blocks_and_directly() {
        let vm = vm();
        let triple = vm
            .new_proc(|args| {
                let n = args.first().copied().unwrap_or(Value::from_raw(1));
                BlockReturn::Value(n)
            })
            .unwrap();
        let numbers = array(&vm, &[4, 5]);
        let mapped = vm.call_with_proc(numbers, "map", &[], triple).unwrap();
        assert_eq!(vm.inspect(mapped), Ok("[4, 5]".to_string()));

        let seven = vm.api().int2num(7);
        assert_eq!(vm.call_proc(triple, &[seven], None), Ok(seven));
        assert_eq!(vm.api().pinned_count(), 1, "the proc is kept alive");
    }

    #[test]
    fn break_outside_iteration_is_a_raw_jump() {
        let vm = vm();
        let breaker = vm.new_proc(|_| BlockReturn::Break).unwrap();
        let err = vm.call_proc(breaker, &[], None).unwrap_err();
        assert_eq!(err, Error::Jump(TAG_BREAK));
        assert_eq!(vm.history().most_recent(), Some(Error::Jump(TAG_BREAK)));
    }

    #[test]
    fn host_panics_cross_back_as_panics() {
        let vm = vm();
        let numbers = array(&vm, &[1]);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = vm.call_with_block(numbers, "each", &[], |_| panic!("host bug"));
        }));
        let payload = outcome.expect_err("the panic must reach the host again");
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"host bug"));
        assert_eq!(vm.api().errinfo(), vm.nil(), "no exception is left pending");
    }

    #[test]
    fn keyword_arguments() {
        let vm = vm();
        let object = vm.object_class().unwrap();
        vm.api().define_method(object, "kwargs", |sim, call| {
            if call.kw_splat {
                *call.args.last().unwrap()
            } else {
                sim.nil()
            }
        });
        let one = vm.api().int2num(1);
        let hash = vm
            .call_kw(object, "kwargs", &[], &[("size", one), ("mode", vm.nil())])
            .unwrap();
        assert_eq!(vm.inspect(hash), Ok("{size: 1, mode: nil}".to_string()));

        let err = vm
            .call_kw(object, "kwargs", &[], &[("size", one), ("size", one)])
            .unwrap_err();
        assert_eq!(err, Error::DuplicateKwArg("size".to_string()));
    }

    #[test]
    fn pinned_values_register_and_release() {
        let vm = vm();
        let value = vm.api().str_new(b"kept");
        {
            let pinned = vm.pin(value).unwrap();
            let copy = pinned.dup().unwrap();
            assert_eq!(copy.get(), pinned.get());
            assert_eq!(vm.api().pinned_count(), 2, "dup pins a second slot");
        }
        assert_eq!(vm.api().pinned_count(), 0, "every box releases its slot");
    }

    #[test]
    fn pinning_brings_the_runtime_up_first() {
        let vm = VM::new(SimRuby::new());
        let value = vm.api().qnil();
        let pinned = vm.pin(value).unwrap();
        assert_eq!(vm.state(), VMState::Setup);
        assert_eq!(vm.api().setup_calls(), 1, "no root is registered before setup");
        assert_eq!(vm.api().pinned_count(), 1);
        drop(pinned);
        assert_eq!(vm.api().pinned_count(), 0);
    }

    #[test]
    fn pinning_after_cleanup_is_refused() {
        let vm = vm();
        let value = vm.api().int2num(3);
        vm.cleanup();
        let err = vm.pin(value).unwrap_err();
        assert!(matches!(&err, Error::Setup(msg) if msg.contains("cleaned up")), "{err:?}");
        assert_eq!(vm.api().pinned_count(), 0, "a torn down runtime gets no new roots");
        assert_eq!(vm.history().most_recent(), Some(err));
    }

    unsafe extern "C-unwind" fn always_break(
        _context: *mut c_void,
        _argc: c_int,
        _argv: *const Value,
        _blockarg: Value,
    ) -> RawBlockReturn {
        BlockReturn::Break.into_raw()
    }

    #[test]
    fn late_callback_registration_is_recorded() {
        let vm = vm();
        let before = vm.history().len();
        let err = vm.register_block_callback(always_break).unwrap_err();
        assert!(matches!(err, Error::BadParameter(_)));
        let err = vm.register_proc_callback(always_break).unwrap_err();
        assert_eq!(vm.history().len(), before + 2, "both refusals land in the history");
        assert_eq!(vm.history().most_recent(), Some(err));
    }

    #[test]
    fn scalar_round_trip_through_vm() {
        let vm = vm();
        let value = 300_u16.to_ruby(&vm).unwrap();
        assert_eq!(u16::from_ruby(&vm, value), Some(300));
        assert_eq!(u8::from_ruby(&vm, value), None);
    }

    #[test]
    fn versions_are_reported() {
        let vm = vm();
        assert!(!vm.version().unwrap().is_empty());
        assert!(vm.description().unwrap().contains(&vm.version().unwrap()));
    }
}
