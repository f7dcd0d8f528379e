//! One enum, one interpreter: every runtime operation that can raise is a `Job`, run by the
//! barrier's single thunk.
//!
//! `Job::run` executes inside `rb_protect`. A jump can leave it at any raising call, so nothing
//! in it may own a destructor while such a call is in flight. Owned outputs are only built after
//! the last raising call of a job.
use std::ffi::{CStr, c_int, c_void};

use crate::{
    Id, RubyApi, Value, ValueType,
    barrier::protect,
    callback::{TrampolineData, block_trampoline},
};

#[derive(Debug, Copy, Clone)]
pub enum BlockSource {
    /// A host closure, reached through the registered block callback.
    Host(*mut c_void),
    /// An existing Ruby proc.
    Proc(Value),
}

#[derive(Debug, Copy, Clone)]
pub enum Job<'a> {
    Load {
        path: Value,
        wrap: bool,
    },
    Intern {
        name: &'a CStr,
    },
    ConstGet {
        module: Value,
        id: Id,
    },
    ConstGetAt {
        module: Value,
        id: Id,
    },
    Call {
        receiver: Value,
        method: Id,
        args: &'a [Value],
        kw_splat: bool,
    },
    BlockCall {
        receiver: Value,
        method: Id,
        args: &'a [Value],
        block: BlockSource,
    },
    CvarGet {
        class: Value,
        id: Id,
    },
    ToUlong {
        value: Value,
    },
    ToLong {
        value: Value,
    },
    ToDouble {
        value: Value,
    },
    ProcCall {
        proc: Value,
        args: &'a [Value],
        block: Option<Value>,
    },
    Inspect {
        value: Value,
    },
    ToString {
        value: Value,
    },
    KwHash {
        pairs: &'a [(Id, Value)],
    },
    ProcNew {
        data: *const c_void,
        func: crate::api::BlockFunc,
    },
}

/// The output slot of a job. `Undefined` until the job finishes.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput {
    Undefined,
    Value(Value),
    Id(Id),
    Ulong(u64),
    Long(i64),
    Double(f64),
    Bytes(Vec<u8>),
}

impl Job<'_> {
    /// # Safety
    /// Must run inside `RubyApi::protect`.
    pub(crate) unsafe fn run<A: RubyApi>(self, api: &A) -> JobOutput {
        // SAFETY: we are inside the barrier, jumps land in protect
        unsafe {
            match self {
                Job::Load { path, wrap } => {
                    api.load(path, wrap);
                    JobOutput::Value(api.qnil())
                }
                Job::Intern { name } => JobOutput::Id(api.intern(name)),
                Job::ConstGet { module, id } => JobOutput::Value(api.const_get(module, id)),
                Job::ConstGetAt { module, id } => JobOutput::Value(api.const_get_at(module, id)),
                Job::Call {
                    receiver,
                    method,
                    args,
                    kw_splat,
                } => JobOutput::Value(api.funcallv(receiver, method, args, kw_splat)),
                Job::BlockCall {
                    receiver,
                    method,
                    args,
                    block: BlockSource::Host(context),
                } => {
                    let data = TrampolineData::new(api, context);
                    JobOutput::Value(api.block_call(
                        receiver,
                        method,
                        args,
                        block_trampoline::<A>,
                        Value::from_ptr(&data),
                    ))
                }
                Job::BlockCall {
                    receiver,
                    method,
                    args,
                    block: BlockSource::Proc(proc),
                } => JobOutput::Value(api.funcall_with_block(receiver, method, args, proc)),
                Job::CvarGet { class, id } => JobOutput::Value(api.cvar_get(class, id)),
                Job::ToUlong { value } => JobOutput::Ulong(to_ulong(api, value)),
                Job::ToLong { value } => JobOutput::Long(api.num2long(api.integer(value))),
                Job::ToDouble { value } => JobOutput::Double(api.num2dbl(api.float(value))),
                Job::ProcCall { proc, args, block } => JobOutput::Value(api.proc_call_with_block(
                    proc,
                    args,
                    block.unwrap_or(api.qnil()),
                )),
                Job::Inspect { value } => JobOutput::Bytes(api.string_bytes(api.inspect(value))),
                Job::ToString { value } => JobOutput::Bytes(api.string_bytes(api.string(value))),
                Job::KwHash { pairs } => {
                    let hash = api.hash_new();
                    for &(id, value) in pairs {
                        api.hash_aset(hash, api.id2sym(id), value);
                    }
                    JobOutput::Value(hash)
                }
                Job::ProcNew { data, func } => {
                    JobOutput::Value(api.proc_new(func, Value::from_ptr(data)))
                }
            }
        }
    }
}

/// `rb_num2ulong` happily turns -1 into `u64::MAX`. Find the sign first and refuse negatives.
///
/// # Safety
/// Must run inside `RubyApi::protect`.
unsafe fn to_ulong<A: RubyApi>(api: &A, value: Value) -> u64 {
    let mut value = value;
    loop {
        // SAFETY: value is a live object handed in by the caller or made by rb_Integer
        match unsafe { api.value_type(value) } {
            ValueType::Fixnum | ValueType::Float | ValueType::Bignum | ValueType::Nil => break,
            // SAFETY: inside the barrier
            _ => value = unsafe { api.integer(value) },
        }
    }
    // SAFETY: as above
    let negative = match unsafe { api.value_type(value) } {
        ValueType::Fixnum => api.fix2long(value) < 0,
        // SAFETY: classified as a Float just now
        ValueType::Float => (unsafe { api.float_value(value) }) < 0.0,
        // SAFETY: inside the barrier
        ValueType::Bignum => unsafe { api.bignum_negative(value) },
        // nil, range is checked by the caller
        _ => false,
    };
    // SAFETY: inside the barrier
    unsafe {
        if negative {
            api.raise_type_error(c"can't convert negative value to unsigned integer");
        }
        api.num2ulong(value)
    }
}

fn value_or_undef<A: RubyApi>(api: &A, output: JobOutput, status: c_int) -> (Value, c_int) {
    match output {
        JobOutput::Value(value) => (value, status),
        _ => (api.qundef(), status),
    }
}

fn run_value<A: RubyApi>(api: &A, job: Job<'_>) -> (Value, c_int) {
    let protected = protect(api, job);
    value_or_undef(api, protected.output, protected.status)
}

pub fn load_protect<A: RubyApi>(api: &A, path: Value, wrap: bool) -> (Value, c_int) {
    run_value(api, Job::Load { path, wrap })
}

pub fn intern_protect<A: RubyApi>(api: &A, name: &CStr) -> (Id, c_int) {
    let protected = protect(api, Job::Intern { name });
    match protected.output {
        JobOutput::Id(id) => (id, protected.status),
        _ => (Id::from_raw(0), protected.status),
    }
}

pub fn const_get_protect<A: RubyApi>(api: &A, module: Value, id: Id) -> (Value, c_int) {
    run_value(api, Job::ConstGet { module, id })
}

pub fn const_get_at_protect<A: RubyApi>(api: &A, module: Value, id: Id) -> (Value, c_int) {
    run_value(api, Job::ConstGetAt { module, id })
}

pub fn funcallv_protect<A: RubyApi>(
    api: &A,
    receiver: Value,
    method: Id,
    args: &[Value],
) -> (Value, c_int) {
    run_value(
        api,
        Job::Call {
            receiver,
            method,
            args,
            kw_splat: false,
        },
    )
}

/// Like `funcallv_protect`, with the last argument passed as keywords.
pub fn funcallv_kw_protect<A: RubyApi>(
    api: &A,
    receiver: Value,
    method: Id,
    args: &[Value],
) -> (Value, c_int) {
    run_value(
        api,
        Job::Call {
            receiver,
            method,
            args,
            kw_splat: true,
        },
    )
}

/// Call `method` with a block that runs the registered block callback with `context`.
pub fn block_call_protect<A: RubyApi>(
    api: &A,
    receiver: Value,
    method: Id,
    args: &[Value],
    context: *mut c_void,
) -> (Value, c_int) {
    run_value(
        api,
        Job::BlockCall {
            receiver,
            method,
            args,
            block: BlockSource::Host(context),
        },
    )
}

/// Call `method` passing an existing proc as its block.
pub fn block_call_proc_protect<A: RubyApi>(
    api: &A,
    receiver: Value,
    method: Id,
    args: &[Value],
    proc: Value,
) -> (Value, c_int) {
    run_value(
        api,
        Job::BlockCall {
            receiver,
            method,
            args,
            block: BlockSource::Proc(proc),
        },
    )
}

pub fn cvar_get_protect<A: RubyApi>(api: &A, class: Value, id: Id) -> (Value, c_int) {
    run_value(api, Job::CvarGet { class, id })
}

pub fn obj2ulong_protect<A: RubyApi>(api: &A, value: Value) -> (u64, c_int) {
    let protected = protect(api, Job::ToUlong { value });
    match protected.output {
        JobOutput::Ulong(value) => (value, protected.status),
        _ => (0, protected.status),
    }
}

pub fn obj2long_protect<A: RubyApi>(api: &A, value: Value) -> (i64, c_int) {
    let protected = protect(api, Job::ToLong { value });
    match protected.output {
        JobOutput::Long(value) => (value, protected.status),
        _ => (0, protected.status),
    }
}

pub fn obj2double_protect<A: RubyApi>(api: &A, value: Value) -> (f64, c_int) {
    let protected = protect(api, Job::ToDouble { value });
    match protected.output {
        JobOutput::Double(value) => (value, protected.status),
        _ => (0.0, protected.status),
    }
}

pub fn proc_call_protect<A: RubyApi>(
    api: &A,
    proc: Value,
    args: &[Value],
    block: Option<Value>,
) -> (Value, c_int) {
    run_value(api, Job::ProcCall { proc, args, block })
}

pub fn inspect_protect<A: RubyApi>(api: &A, value: Value) -> (Option<Vec<u8>>, c_int) {
    bytes_of(protect(api, Job::Inspect { value }))
}

pub fn string_protect<A: RubyApi>(api: &A, value: Value) -> (Option<Vec<u8>>, c_int) {
    bytes_of(protect(api, Job::ToString { value }))
}

pub fn kw_hash_protect<A: RubyApi>(api: &A, pairs: &[(Id, Value)]) -> (Value, c_int) {
    run_value(api, Job::KwHash { pairs })
}

pub fn proc_new_protect<A: RubyApi>(
    api: &A,
    func: crate::api::BlockFunc,
    data: *const c_void,
) -> (Value, c_int) {
    run_value(api, Job::ProcNew { data, func })
}

fn bytes_of(protected: crate::barrier::Protected) -> (Option<Vec<u8>>, c_int) {
    match protected.output {
        JobOutput::Bytes(bytes) => (Some(bytes), protected.status),
        _ => (None, protected.status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{api::TAG_RAISE, sim::SimRuby};

    fn ready() -> SimRuby {
        let sim = SimRuby::new();
        assert_eq!(unsafe { sim.setup() }, 0, "sim setup must succeed");
        sim
    }

    fn intern(api: &SimRuby, name: &CStr) -> Id {
        let (id, status) = intern_protect(api, name);
        assert_eq!(status, 0, "interning {name:?} must not raise");
        id
    }

    #[test]
    fn unsigned_coercion_rejects_negative_fixnum() {
        let api = ready();
        let (value, status) = obj2ulong_protect(&api, api.int2num(-1));
        assert_eq!(status, TAG_RAISE, "-1 must not wrap to u64::MAX");
        assert_eq!(value, 0);
        assert_ne!(api.errinfo(), api.qnil(), "a TypeError must be pending");
    }

    #[test]
    fn unsigned_coercion_rejects_negative_float_and_bignum() {
        let api = ready();
        let (_, status) = obj2ulong_protect(&api, api.float_new(-1.0));
        assert_eq!(status, TAG_RAISE, "-1.0 must be refused");
        unsafe { api.set_errinfo(api.qnil()) };

        let big = api.int2num(i64::MIN);
        assert_eq!(unsafe { api.value_type(big) }, ValueType::Bignum, "i64::MIN is not a fixnum");
        let (_, status) = obj2ulong_protect(&api, big);
        assert_eq!(status, TAG_RAISE, "negative bignum must be refused");
    }

    #[test]
    fn unsigned_coercion_accepts_zero_and_max() {
        let api = ready();
        assert_eq!(obj2ulong_protect(&api, api.int2num(0)), (0, 0));
        assert_eq!(obj2ulong_protect(&api, api.uint2num(u64::MAX)), (u64::MAX, 0));
    }

    #[test]
    fn unsigned_coercion_drives_strings_through_integer() {
        let api = ready();
        assert_eq!(obj2ulong_protect(&api, api.str_new(b"42")), (42, 0));
        let (_, status) = obj2ulong_protect(&api, api.str_new(b"-42"));
        assert_eq!(status, TAG_RAISE, "negative strings are refused after conversion");
    }

    #[test]
    fn nil_is_not_negative_but_still_fails_conversion() {
        let api = ready();
        let (_, status) = obj2ulong_protect(&api, api.qnil());
        assert_eq!(status, TAG_RAISE, "nil has no unsigned value");
    }

    #[test]
    fn const_get_at_does_not_search_object() {
        let api = ready();
        let integer = intern(&api, c"Integer");
        let (integer_class, status) = const_get_protect(&api, api.object_class(), integer);
        assert_eq!(status, 0);
        assert_eq!(unsafe { api.value_type(integer_class) }, ValueType::Module);

        let (module, status) = funcallv_protect(&api, integer_class, intern(&api, c"class"), &[]);
        assert_eq!(status, 0);
        let (_, status) = const_get_at_protect(&api, module, integer);
        assert_eq!(status, TAG_RAISE, "Class does not itself define Integer");
    }

    #[test]
    fn failed_jobs_report_undefined() {
        let api = ready();
        let missing = intern(&api, c"NoSuchThing");
        let (value, status) = const_get_protect(&api, api.object_class(), missing);
        assert_eq!(status, TAG_RAISE);
        assert_eq!(value, api.qundef(), "failed calls must yield the undefined sentinel");
    }
}
