//! The state machine that owns the interpreter.
//!
//! Unknown -> Setup | SetupFailed(err); Setup -> CleanedUp. SetupFailed and CleanedUp are
//! terminal. All of it, and the symbol cache, lives behind one re-entrant lock: a protected call
//! can call back into the host, which can come straight back in here on the same thread.
use std::{
    cell::RefCell,
    collections::HashMap,
    ffi::{CString, c_char, c_int},
    path::PathBuf,
};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::{
    Error, ErrorHistory, Exception, Id, IdentifierKind, RubyApi, Value, ValueType, callback,
    job::{funcallv_protect, inspect_protect, intern_protect, string_protect},
};

#[derive(Debug, Clone, PartialEq)]
pub enum VMState {
    Unknown,
    SetupFailed(Error),
    Setup,
    CleanedUp,
}

/// How the interpreter is bootstrapped.
#[derive(Debug, Clone, Default)]
pub struct VMCreateInfo {
    /// `$0` of the embedded interpreter, defaults to "rubygate"
    pub program_name: Option<String>,
    /// extra `$LOAD_PATH` entries, passed as `-I`
    pub load_paths: Vec<PathBuf>,
    pub disable_gems: bool,
    /// passed to `ruby_options` before the empty `-e` program
    pub extra_args: Vec<String>,
}

impl VMCreateInfo {
    /// Arguments for `ruby_options`. The `-e ""` program keeps Ruby from reading stdin.
    pub fn bootstrap_args(&self) -> Result<Vec<CString>, Error> {
        let mut args = vec![self.program_name.as_deref().unwrap_or("rubygate").to_string()];
        if self.disable_gems {
            args.push("--disable-gems".to_string());
        }
        for path in &self.load_paths {
            args.push(format!("-I{}", path.display()));
        }
        args.extend(self.extra_args.iter().cloned());
        args.push("-e".to_string());
        args.push(String::new());

        args.into_iter()
            .map(|arg| {
                CString::new(arg).map_err(|err| {
                    Error::BadParameter(format!("bootstrap argument contains NUL: {err}"))
                })
            })
            .collect()
    }
}

pub(crate) struct LifecycleState {
    state: VMState,
    ids: HashMap<String, Id>,
}

pub(crate) struct Lifecycle<A: RubyApi> {
    api: A,
    lock: ReentrantMutex<RefCell<LifecycleState>>,
    history: ErrorHistory,
}

pub(crate) type LifecycleGuard<'a> = ReentrantMutexGuard<'a, RefCell<LifecycleState>>;

impl<A: RubyApi> Lifecycle<A> {
    pub(crate) fn new(api: A) -> Self {
        Self {
            api,
            lock: ReentrantMutex::new(RefCell::new(LifecycleState {
                state: VMState::Unknown,
                ids: HashMap::new(),
            })),
            history: ErrorHistory::default(),
        }
    }

    pub(crate) fn api(&self) -> &A {
        &self.api
    }

    pub(crate) fn history(&self) -> &ErrorHistory {
        &self.history
    }

    pub(crate) fn lock(&self) -> LifecycleGuard<'_> {
        self.lock.lock()
    }

    pub(crate) fn state(&self) -> VMState {
        self.lock().borrow().state.clone()
    }

    pub(crate) fn is_setup(&self) -> bool {
        self.lock().borrow().state == VMState::Setup
    }

    /// Every error a caller sees passes through here.
    pub(crate) fn raise(&self, error: Error) -> Error {
        log::warn!("{error}");
        self.history.record(error.clone());
        error
    }

    /// Returns whether this call brought the interpreter up.
    pub(crate) fn setup(&self, info: &VMCreateInfo) -> Result<bool, Error> {
        let guard = self.lock();
        let current = guard.borrow().state.clone();
        match current {
            VMState::Setup => return Ok(false),
            VMState::SetupFailed(error) => return Err(self.raise(error)),
            VMState::CleanedUp => {
                return Err(self.raise(Error::Setup(
                    "Ruby VM has already been cleaned up".to_string(),
                )));
            }
            VMState::Unknown => {}
        }

        let result = self.bootstrap(info);
        let mut inner = guard.borrow_mut();
        match result {
            Ok(()) => {
                inner.state = VMState::Setup;
                log::info!("ruby VM ready: {}", self.api.description());
                Ok(true)
            }
            Err(error) => {
                inner.state = VMState::SetupFailed(error.clone());
                drop(inner);
                Err(self.raise(error))
            }
        }
    }

    fn bootstrap(&self, info: &VMCreateInfo) -> Result<(), Error> {
        if self.api.is_initialized() {
            panic!("the embedded Ruby was initialized outside of this VM");
        }

        // SAFETY: we hold the lifecycle lock and the state is still Unknown
        let code = unsafe { self.api.setup() };
        if code != 0 {
            return Err(Error::Setup(format!("ruby_setup() failed with code {code}")));
        }
        callback::install_default_callbacks();

        let args = info.bootstrap_args()?;
        let mut argv: Vec<*mut c_char> = args.iter().map(|arg| arg.as_ptr().cast_mut()).collect();
        log::debug!("ruby_options({args:?})");
        // SAFETY: argv points into `args`, which outlives the call
        let node = unsafe { self.api.options(&mut argv) };

        let mut status: c_int = 0;
        // SAFETY: node came from options right above
        if !unsafe { self.api.executable_node(node, &mut status) } {
            return Err(Error::Setup(format!(
                "ruby_options() did not produce a runnable program, status {status}"
            )));
        }
        if status != 0 {
            return Err(Error::Setup(format!(
                "ruby_executable_node() reported status {status}"
            )));
        }
        Ok(())
    }

    /// Tear the interpreter down if it is up. Returns the runtime's own exit code.
    pub(crate) fn cleanup(&self) -> c_int {
        let guard = self.lock();
        if guard.borrow().state != VMState::Setup {
            return 0;
        }
        // at_exit handlers may call back into us, keep the RefCell free
        // SAFETY: the state moves to CleanedUp below, so no handle is used after this
        let code = unsafe { self.api.cleanup(0) };
        let mut inner = guard.borrow_mut();
        inner.state = VMState::CleanedUp;
        inner.ids.clear();
        log::info!("ruby VM cleaned up, code {code}");
        code
    }

    pub(crate) fn ensure_setup(&self) -> Result<(), Error> {
        self.setup(&VMCreateInfo::default()).map(|_| ())
    }

    pub(crate) fn get_id(&self, name: &str) -> Result<Id, Error> {
        let guard = self.lock();
        self.ensure_setup()?;
        if let Some(&id) = guard.borrow().ids.get(name) {
            return Ok(id);
        }

        let cname = CString::new(name).map_err(|_| {
            self.raise(Error::BadIdentifier {
                kind: IdentifierKind::Symbol,
                id: name.to_string(),
            })
        })?;
        let (id, status) = intern_protect(&self.api, &cname);
        if status != 0 {
            return Err(self.surface(status));
        }
        log::debug!("interned {name} -> {}", id.raw());
        guard.borrow_mut().ids.insert(name.to_string(), id);
        Ok(id)
    }

    /// Turn a nonzero status into an `Error`. Must run before anything else touches the runtime.
    pub(crate) fn surface(&self, status: c_int) -> Error {
        let exception = self.api.errinfo();
        if exception == self.api.qnil() {
            callback::resume_pending_panic();
            return self.raise(Error::Jump(status));
        }
        self.clear_errinfo();
        callback::resume_pending_panic();

        let exception = self.describe(exception);
        self.raise(Error::Exception(exception))
    }

    fn clear_errinfo(&self) {
        // SAFETY: only called while surfacing, the exception has been read or is discarded
        unsafe { self.api.set_errinfo(self.api.qnil()) }
    }

    /// Best effort: a failure here must not recurse into `surface`.
    fn describe(&self, exception: Value) -> Exception {
        let description = self
            .quiet_string(inspect_protect(&self.api, exception))
            .unwrap_or_else(|| "#<unprintable exception>".to_string());

        let backtrace = self
            .quiet_backtrace(exception)
            .map(|joined| joined.lines().map(str::to_string).collect())
            .unwrap_or_default();

        Exception {
            description,
            backtrace,
        }
    }

    fn quiet_backtrace(&self, exception: Value) -> Option<String> {
        let backtrace_id = self.quiet_intern(c"backtrace")?;
        let join_id = self.quiet_intern(c"join")?;

        let (frames, status) = funcallv_protect(&self.api, exception, backtrace_id, &[]);
        if status != 0 {
            self.clear_errinfo();
            return None;
        }
        // SAFETY: frames was just returned by the runtime
        if unsafe { self.api.value_type(frames) } != ValueType::Array {
            return None;
        }
        let separator = self.api.str_new(b"\n");
        let (joined, status) = funcallv_protect(&self.api, frames, join_id, &[separator]);
        if status != 0 {
            self.clear_errinfo();
            return None;
        }
        self.quiet_string(string_protect(&self.api, joined))
    }

    fn quiet_intern(&self, name: &std::ffi::CStr) -> Option<Id> {
        let key = name.to_str().ok()?;
        if let Some(&id) = self.lock().borrow().ids.get(key) {
            return Some(id);
        }
        let (id, status) = intern_protect(&self.api, name);
        if status != 0 {
            self.clear_errinfo();
            return None;
        }
        self.lock().borrow_mut().ids.insert(key.to_string(), id);
        Some(id)
    }

    fn quiet_string(&self, (bytes, status): (Option<Vec<u8>>, c_int)) -> Option<String> {
        if status != 0 {
            self.clear_errinfo();
            return None;
        }
        bytes.map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }
}
