//! Value: a raw Ruby `VALUE`, an opaque handle to a live object inside the runtime.
//!
//! Id: a raw Ruby `ID`, the interned form of a name.
//!
//! Neither is owned by the host. The runtime's collector may reclaim the object behind a
//! `Value` once nothing on the runtime side references it; use a `PinnedValue` to keep one alive.
use std::ffi::c_void;

/// A Ruby object handle, same layout as `VALUE`
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Value(usize);

/// An interned name, same layout as `ID`
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Id(usize);

/// Coarse classification of a value, enough for the boundary to pick a conversion path.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValueType {
    Nil,
    True,
    False,
    Undef,
    Fixnum,
    Float,
    Bignum,
    Symbol,
    String,
    Array,
    Hash,
    Module,
    Object,
}

impl Value {
    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Smuggle a host pointer through a `VALUE`-typed parameter, e.g. the `data2` of
    /// `rb_block_call`. The runtime never interprets it.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    #[inline]
    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    pub fn as_c_void(self) -> *mut c_void {
        self.as_ptr()
    }
}

impl Id {
    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointers_survive_the_value_round_trip() {
        let data = 42_u64;
        let value = Value::from_ptr(&data);
        let back: *mut u64 = value.as_ptr();
        assert_eq!(unsafe { *back }, 42, "pointer smuggled through a VALUE must be intact");
    }
}
