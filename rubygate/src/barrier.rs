//! The jump barrier: the one place a job meets `rb_protect`.
//!
//! Ruby can only intercept a non-local exit at a protect frame, and that frame takes a single
//! `VALUE (*)(VALUE)` function. So every job goes through `job_thunk`, with the job and its
//! output slot packed into a `Frame` on the caller's stack.
use std::ffi::c_int;

use crate::{
    RubyApi,
    job::{Job, JobOutput},
};

/// What came back from a protected call. `status` is zero on success; otherwise `output` is
/// `Undefined` and the tag of the non-local exit is in `status`.
#[derive(Debug, Clone, PartialEq)]
pub struct Protected {
    pub output: JobOutput,
    pub status: c_int,
}

impl Protected {
    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

struct Frame<'a, A: RubyApi> {
    api: &'a A,
    job: Job<'a>,
    output: JobOutput,
}

unsafe extern "C-unwind" fn job_thunk<A: RubyApi>(data: usize) -> usize {
    // SAFETY: `protect` hands us a pointer to its own live `Frame<A>`
    let frame = unsafe { &mut *(data as *mut Frame<'_, A>) };
    // SAFETY: we are running under rb_protect
    let output = unsafe { frame.job.run(frame.api) };
    frame.output = output;
    0
}

/// Run `job` under the runtime's protect frame. Nested calls are fine: each level only sees the
/// exits raised inside it.
pub fn protect<A: RubyApi>(api: &A, job: Job<'_>) -> Protected {
    let mut frame = Frame {
        api,
        job,
        output: JobOutput::Undefined,
    };
    let mut status: c_int = 0;
    log::trace!("protect {:?}", frame.job);

    // SAFETY: job_thunk::<A> reads exactly the Frame<A> we pass, which outlives the call
    unsafe {
        api.protect(job_thunk::<A>, (&raw mut frame) as usize, &mut status);
    }

    if status != 0 {
        log::trace!("protected job exited non-locally, tag {status}");
        return Protected {
            output: JobOutput::Undefined,
            status,
        };
    }
    Protected {
        output: frame.output,
        status,
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

    #[test]
    fn successful_job_fills_output() {
        let api = ready();
        let protected = protect(&api, Job::Intern { name: c"each" });
        assert!(protected.is_ok(), "interning never raises");
        assert!(matches!(protected.output, JobOutput::Id(_)));
    }

    #[test]
    fn raising_job_is_contained() {
        let api = ready();
        let protected = protect(
            &api,
            Job::ToLong {
                value: api.str_new(b"not a number"),
            },
        );
        assert_eq!(protected.status, TAG_RAISE, "ArgumentError must be caught");
        assert_eq!(protected.output, JobOutput::Undefined);
        assert_ne!(api.errinfo(), api.qnil(), "the exception must be pending");
    }

    #[test]
    fn consecutive_barriers_are_independent() {
        let api = ready();
        let outer = protect(&api, Job::ToDouble { value: api.int2num(3) });
        let inner = protect(&api, Job::ToDouble { value: api.qnil() });
        let again = protect(&api, Job::Inspect { value: api.int2num(7) });

        assert_eq!(outer.output, JobOutput::Double(3.0));
        assert_eq!(inner.status, TAG_RAISE, "nil has no float value");
        assert_eq!(
            again.output,
            JobOutput::Bytes(b"7".to_vec()),
            "a failed barrier must not poison the next one"
        );
    }
}
