mod api;
mod barrier;
mod boxed;
pub mod callback;
mod convert;
mod error;
pub mod job;
#[cfg(feature = "libruby")]
mod libruby;
mod lifecycle;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
mod value;
mod vm;

pub use api::{BlockFunc, RubyApi, TAG_BREAK, TAG_FATAL, TAG_RAISE, TAG_THROW, Thunk, tag_name};
pub use barrier::{Protected, protect};
pub use boxed::PinnedValue;
pub use callback::{BlockReturn, Callback, RawBlockReturn};
pub use convert::{FromRuby, ToRuby};
pub use error::{Error, ErrorHistory, Exception, IdentifierKind, MAX_ERRORS, Result};
#[cfg(feature = "libruby")]
pub use libruby::LibRuby;
pub use lifecycle::{VMCreateInfo, VMState};
#[cfg(any(test, feature = "sim"))]
pub use sim::SimRuby;
pub use value::{Id, Value, ValueType};
pub use vm::VM;

/// The runtime `VM::shared()` drives.
#[cfg(feature = "libruby")]
pub type DefaultApi = LibRuby;
/// The runtime `VM::shared()` drives. The in-process stand-in, for tests without a libruby.
#[cfg(all(not(feature = "libruby"), any(test, feature = "sim")))]
pub type DefaultApi = SimRuby;
