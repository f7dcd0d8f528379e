//! Blocks and procs implemented by the host.
//!
//! Ruby calls a trampoline, the trampoline calls the registered slot callback, the callback says
//! what should happen next as a `BlockReturn`, and the trampoline makes it happen with Ruby's own
//! primitives. The host never unwinds its own frames to leave a block: break and raise are
//! performed from the trampoline, which is a frame Ruby expects to jump over.
use std::{
    any::Any,
    cell::RefCell,
    ffi::{CStr, c_int, c_void},
    io::Write,
    panic::{self, AssertUnwindSafe},
    sync::OnceLock,
};

use crate::{Error, RubyApi, Value};

/// What a host block wants Ruby to do when it finishes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockReturn {
    /// Hand the value back as the block's result.
    Value(Value),
    /// Stop the iteration, the iterating method returns nil.
    Break,
    /// Stop the iteration, the iterating method returns the value.
    BreakValue(Value),
    /// Raise the exception object.
    Raise(Value),
}

pub const BLOCK_RETURN_VALUE: u32 = 0;
pub const BLOCK_RETURN_BREAK: u32 = 1;
pub const BLOCK_RETURN_BREAK_VALUE: u32 = 2;
pub const BLOCK_RETURN_RAISE: u32 = 3;

/// `BlockReturn` as it crosses the callback slot ABI.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RawBlockReturn {
    pub tag: u32,
    pub value: Value,
}

impl BlockReturn {
    pub fn into_raw(self) -> RawBlockReturn {
        let (tag, value) = match self {
            BlockReturn::Value(value) => (BLOCK_RETURN_VALUE, value),
            BlockReturn::Break => (BLOCK_RETURN_BREAK, Value::from_raw(0)),
            BlockReturn::BreakValue(value) => (BLOCK_RETURN_BREAK_VALUE, value),
            BlockReturn::Raise(value) => (BLOCK_RETURN_RAISE, value),
        };
        RawBlockReturn { tag, value }
    }

    /// Fails with the offending tag.
    pub fn from_raw(raw: RawBlockReturn) -> Result<Self, u32> {
        match raw.tag {
            BLOCK_RETURN_VALUE => Ok(BlockReturn::Value(raw.value)),
            BLOCK_RETURN_BREAK => Ok(BlockReturn::Break),
            BLOCK_RETURN_BREAK_VALUE => Ok(BlockReturn::BreakValue(raw.value)),
            BLOCK_RETURN_RAISE => Ok(BlockReturn::Raise(raw.value)),
            tag => Err(tag),
        }
    }
}

/// A registered callback. `context` is whatever the caller associated with the block or proc.
pub type Callback = unsafe extern "C-unwind" fn(
    context: *mut c_void,
    argc: c_int,
    argv: *const Value,
    blockarg: Value,
) -> RawBlockReturn;

static BLOCK_CALLBACK: OnceLock<Callback> = OnceLock::new();
static PROC_CALLBACK: OnceLock<Callback> = OnceLock::new();

/// Install the callback run for blocks passed by `job::block_call_protect`. Once per process,
/// before the VM is set up; setup installs the default closure-based callback otherwise.
pub(crate) fn register_block_callback(callback: Callback) -> Result<(), Error> {
    BLOCK_CALLBACK
        .set(callback)
        .map_err(|_| Error::BadParameter("block callback is already registered".to_string()))
}

/// Install the callback run when a host-backed proc is called. Same rules as
/// `register_block_callback`.
pub(crate) fn register_proc_callback(callback: Callback) -> Result<(), Error> {
    PROC_CALLBACK
        .set(callback)
        .map_err(|_| Error::BadParameter("proc callback is already registered".to_string()))
}

pub(crate) fn install_default_callbacks() {
    BLOCK_CALLBACK.get_or_init(|| {
        log::debug!("installing default block callback");
        closure_block_callback
    });
    PROC_CALLBACK.get_or_init(|| {
        log::debug!("installing default proc callback");
        closure_proc_callback
    });
}

/// Whether blocks still reach the closure callback `VM::call_with_block` hands its context to.
pub(crate) fn closure_blocks_installed() -> bool {
    is_closure_block_callback(BLOCK_CALLBACK.get().copied())
}

fn is_closure_block_callback(callback: Option<Callback>) -> bool {
    callback.is_some_and(|callback| {
        std::ptr::fn_addr_eq(callback, closure_block_callback as Callback)
    })
}

/// Host closure used as a block. The callback gets a pointer to one of these.
pub type BlockBody<'a> = &'a mut dyn FnMut(&[Value]) -> BlockReturn;
/// Host closure used as a proc body.
pub type ProcBody = Box<dyn Fn(&[Value]) -> BlockReturn + Send + Sync>;

unsafe fn arguments<'a>(argc: c_int, argv: *const Value) -> &'a [Value] {
    if argc <= 0 || argv.is_null() {
        return &[];
    }
    // SAFETY: the runtime passes argc valid values at argv
    unsafe { std::slice::from_raw_parts(argv, argc as usize) }
}

unsafe extern "C-unwind" fn closure_block_callback(
    context: *mut c_void,
    argc: c_int,
    argv: *const Value,
    _blockarg: Value,
) -> RawBlockReturn {
    // SAFETY: VM::call_with_block passes a pointer to its live BlockBody
    let body = unsafe { &mut *(context as *mut BlockBody<'_>) };
    let args = unsafe { arguments(argc, argv) };
    body(args).into_raw()
}

unsafe extern "C-unwind" fn closure_proc_callback(
    context: *mut c_void,
    argc: c_int,
    argv: *const Value,
    _blockarg: Value,
) -> RawBlockReturn {
    // SAFETY: VM::new_proc passes a pointer to a ProcBody it keeps for the VM's lifetime
    let body = unsafe { &*(context as *const ProcBody) };
    let args = unsafe { arguments(argc, argv) };
    body(args).into_raw()
}

/// What the runtime hands back to a trampoline as `data`.
pub(crate) struct TrampolineData<A: RubyApi> {
    api: *const A,
    context: *mut c_void,
}

impl<A: RubyApi> TrampolineData<A> {
    pub(crate) fn new(api: &A, context: *mut c_void) -> Self {
        Self { api, context }
    }
}

// SAFETY: only dereferenced on the thread holding the VM lock
unsafe impl<A: RubyApi> Send for TrampolineData<A> {}

thread_local! {
    static PENDING_PANIC: RefCell<Option<Box<dyn Any + Send>>> = const { RefCell::new(None) };
}

/// Re-throw a host panic that was parked while Ruby frames were on the stack.
pub(crate) fn resume_pending_panic() {
    if let Some(payload) = PENDING_PANIC.with(|pending| pending.borrow_mut().take()) {
        panic::resume_unwind(payload);
    }
}

pub(crate) unsafe extern "C-unwind" fn block_trampoline<A: RubyApi>(
    _yielded: Value,
    data: Value,
    argc: c_int,
    argv: *const Value,
    blockarg: Value,
) -> Value {
    // SAFETY: Job::BlockCall passes its TrampolineData<A> as data
    let data = unsafe { &*data.as_ptr::<TrampolineData<A>>() };
    unsafe { dispatch(data, BLOCK_CALLBACK.get().copied(), argc, argv, blockarg) }
}

pub(crate) unsafe extern "C-unwind" fn proc_trampoline<A: RubyApi>(
    _yielded: Value,
    data: Value,
    argc: c_int,
    argv: *const Value,
    blockarg: Value,
) -> Value {
    // SAFETY: VM::new_proc passes a TrampolineData<A> it keeps for the VM's lifetime
    let data = unsafe { &*data.as_ptr::<TrampolineData<A>>() };
    unsafe { dispatch(data, PROC_CALLBACK.get().copied(), argc, argv, blockarg) }
}

/// Runs on the runtime's stack. Nothing owned may be alive when we jump out of here.
unsafe fn dispatch<A: RubyApi>(
    data: &TrampolineData<A>,
    callback: Option<Callback>,
    argc: c_int,
    argv: *const Value,
    blockarg: Value,
) -> Value {
    // SAFETY: the api outlives every call into the runtime
    let api = unsafe { &*data.api };
    let Some(callback) = callback else {
        unsafe { api.raise_runtime_error(c"no host callback registered") }
    };

    let context = data.context;
    let result = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
        callback(context, argc, argv, blockarg)
    }));
    let raw = match result {
        Ok(raw) => raw,
        Err(payload) => {
            PENDING_PANIC.with(|pending| *pending.borrow_mut() = Some(payload));
            unsafe { api.raise_runtime_error(c"host callback panicked") }
        }
    };

    // SAFETY: every arm either returns or hands control to the runtime
    unsafe {
        match BlockReturn::from_raw(raw) {
            Ok(BlockReturn::Value(value)) => value,
            Ok(BlockReturn::Break) => api.iter_break(),
            Ok(BlockReturn::BreakValue(value)) => api.iter_break_value(value),
            Ok(BlockReturn::Raise(exception)) => api.exc_raise(exception),
            Err(tag) => {
                log::error!("corrupt block return tag {tag}");
                let mut buffer = [0_u8; 64];
                let message = match write!(&mut buffer[..63], "corrupt block return tag {tag}") {
                    Ok(()) => CStr::from_bytes_until_nul(&buffer)
                        .unwrap_or(c"corrupt block return tag"),
                    Err(_) => c"corrupt block return tag",
                };
                api.raise_runtime_error(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use super::*;
    use crate::{
        TAG_RAISE,
        barrier::protect,
        job::{Job, JobOutput},
        sim::SimRuby,
    };

    unsafe extern "C-unwind" fn corrupt_tag(
        _context: *mut c_void,
        _argc: c_int,
        _argv: *const Value,
        _blockarg: Value,
    ) -> RawBlockReturn {
        RawBlockReturn {
            tag: 99,
            value: Value::from_raw(0),
        }
    }

    unsafe extern "C-unwind" fn panicking(
        _context: *mut c_void,
        _argc: c_int,
        _argv: *const Value,
        _blockarg: Value,
    ) -> RawBlockReturn {
        panic!("callback bug")
    }

    unsafe extern "C-unwind" fn first_argument(
        _context: *mut c_void,
        argc: c_int,
        argv: *const Value,
        _blockarg: Value,
    ) -> RawBlockReturn {
        let args = unsafe { arguments(argc, argv) };
        BlockReturn::Value(args[0]).into_raw()
    }

    struct Dispatch<'a> {
        data: &'a TrampolineData<SimRuby>,
        callback: Option<Callback>,
        args: &'a [Value],
    }

    unsafe extern "C-unwind" fn dispatch_thunk(data: usize) -> usize {
        // SAFETY: dispatched() passes a pointer to its live Dispatch
        let frame = unsafe { &*(data as *const Dispatch<'_>) };
        let argc = frame.args.len() as c_int;
        let result = unsafe {
            dispatch(frame.data, frame.callback, argc, frame.args.as_ptr(), Value::from_raw(0))
        };
        result.raw()
    }

    /// Run `dispatch` the way a trampoline would: on the runtime side of a protect frame.
    fn dispatched(sim: &SimRuby, callback: Option<Callback>, args: &[Value]) -> (Value, c_int) {
        let data = TrampolineData::new(sim, ptr::null_mut());
        let frame = Dispatch {
            data: &data,
            callback,
            args,
        };
        let mut status = 0;
        let result = unsafe { sim.protect(dispatch_thunk, (&raw const frame) as usize, &mut status) };
        (result, status)
    }

    fn pending_exception(sim: &SimRuby) -> String {
        let exception = sim.errinfo();
        unsafe { sim.set_errinfo(sim.qnil()) };
        match protect(sim, Job::Inspect { value: exception }).output {
            JobOutput::Bytes(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            other => panic!("pending exception could not be inspected: {other:?}"),
        }
    }

    fn ready() -> SimRuby {
        let sim = SimRuby::new();
        assert_eq!(unsafe { sim.setup() }, 0, "sim setup must succeed");
        sim
    }

    #[test]
    fn corrupt_tag_becomes_a_runtime_error() {
        let sim = ready();
        let (_, status) = dispatched(&sim, Some(corrupt_tag), &[]);
        assert_eq!(status, TAG_RAISE);
        assert_eq!(pending_exception(&sim), "#<RuntimeError: corrupt block return tag 99>");
    }

    #[test]
    fn empty_slot_raises_instead_of_calling() {
        let sim = ready();
        let (_, status) = dispatched(&sim, None, &[]);
        assert_eq!(status, TAG_RAISE);
        assert_eq!(pending_exception(&sim), "#<RuntimeError: no host callback registered>");
    }

    #[test]
    fn plain_values_are_handed_back() {
        let sim = ready();
        let seven = sim.int2num(7);
        assert_eq!(dispatched(&sim, Some(first_argument), &[seven]), (seven, 0));
    }

    #[test]
    fn callback_panics_are_parked_until_the_host_resumes() {
        let sim = ready();
        let (_, status) = dispatched(&sim, Some(panicking), &[]);
        assert_eq!(status, TAG_RAISE);
        assert_eq!(pending_exception(&sim), "#<RuntimeError: host callback panicked>");

        let resumed = panic::catch_unwind(resume_pending_panic).unwrap_err();
        assert_eq!(resumed.downcast_ref::<&str>(), Some(&"callback bug"));
        resume_pending_panic();
    }

    #[test]
    fn only_the_closure_callback_accepts_host_closures() {
        assert!(is_closure_block_callback(Some(closure_block_callback)));
        assert!(!is_closure_block_callback(Some(corrupt_tag)));
        assert!(!is_closure_block_callback(None));
    }

    #[test]
    fn raw_form_round_trips_every_outcome() {
        let value = Value::from_raw(0x40);
        for outcome in [
            BlockReturn::Value(value),
            BlockReturn::Break,
            BlockReturn::BreakValue(value),
            BlockReturn::Raise(value),
        ] {
            assert_eq!(BlockReturn::from_raw(outcome.into_raw()), Ok(outcome));
        }
    }

    #[test]
    fn unknown_tag_is_reported() {
        let raw = RawBlockReturn {
            tag: 99,
            value: Value::from_raw(0),
        };
        assert_eq!(BlockReturn::from_raw(raw), Err(99));
    }

    #[test]
    fn slots_accept_only_one_registration() {
        install_default_callbacks();
        let again = register_block_callback(closure_block_callback);
        assert!(
            matches!(again, Err(Error::BadParameter(_))),
            "a set slot must refuse a second callback"
        );
        let again = register_proc_callback(closure_proc_callback);
        assert!(matches!(again, Err(Error::BadParameter(_))));
    }
}
