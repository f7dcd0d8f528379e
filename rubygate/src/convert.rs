//! Scalar conversion between Rust values and Ruby objects.
//!
//! `FromRuby` answers `None` when the value cannot be turned into `Self`; why is in the VM's
//! error history. `ToRuby` only fails when the interpreter cannot be brought up.
use crate::{Error, RubyApi, VM, Value};

pub trait FromRuby: Sized {
    fn from_ruby<A: RubyApi>(vm: &VM<A>, value: Value) -> Option<Self>;
}

pub trait ToRuby {
    fn to_ruby<A: RubyApi>(self, vm: &VM<A>) -> Result<Value, Error>;
}

fn misfit<A: RubyApi, T>(vm: &VM<A>, number: impl std::fmt::Display, target: &str) -> Option<T> {
    vm.raise(Error::BadType(format!("{number} does not fit in {target}")));
    None
}

macro_rules! from_unsigned {
    ($($ty:ty),*) => {$(
        impl FromRuby for $ty {
            fn from_ruby<A: RubyApi>(vm: &VM<A>, value: Value) -> Option<Self> {
                let number = vm.to_u64(value).ok()?;
                match <$ty>::try_from(number) {
                    Ok(number) => Some(number),
                    Err(_) => misfit(vm, number, stringify!($ty)),
                }
            }
        }
    )*};
}

macro_rules! from_signed {
    ($($ty:ty),*) => {$(
        impl FromRuby for $ty {
            fn from_ruby<A: RubyApi>(vm: &VM<A>, value: Value) -> Option<Self> {
                let number = vm.to_i64(value).ok()?;
                match <$ty>::try_from(number) {
                    Ok(number) => Some(number),
                    Err(_) => misfit(vm, number, stringify!($ty)),
                }
            }
        }
    )*};
}

from_unsigned!(u8, u16, u32, u64, usize);
from_signed!(i8, i16, i32, i64, isize);

impl FromRuby for f64 {
    fn from_ruby<A: RubyApi>(vm: &VM<A>, value: Value) -> Option<Self> {
        vm.to_f64(value).ok()
    }
}

impl FromRuby for f32 {
    fn from_ruby<A: RubyApi>(vm: &VM<A>, value: Value) -> Option<Self> {
        let number = vm.to_f64(value).ok()?;
        if number.is_finite() && number.abs() > f64::from(f32::MAX) {
            return misfit(vm, number, "f32");
        }
        Some(number as f32)
    }
}

impl FromRuby for bool {
    fn from_ruby<A: RubyApi>(vm: &VM<A>, value: Value) -> Option<Self> {
        let api = vm.api();
        if value == api.qtrue() {
            Some(true)
        } else if value == api.qfalse() {
            Some(false)
        } else {
            let shown = vm.inspect(value).unwrap_or_else(|_| format!("{:#x}", value.raw()));
            vm.raise(Error::BadType(format!("{shown} is not true or false")));
            None
        }
    }
}

impl FromRuby for String {
    fn from_ruby<A: RubyApi>(vm: &VM<A>, value: Value) -> Option<Self> {
        vm.to_s(value).ok()
    }
}

macro_rules! to_signed {
    ($($ty:ty),*) => {$(
        impl ToRuby for $ty {
            fn to_ruby<A: RubyApi>(self, vm: &VM<A>) -> Result<Value, Error> {
                vm.with_api(|api| api.int2num(i64::from(self)))
            }
        }
    )*};
}

macro_rules! to_unsigned {
    ($($ty:ty),*) => {$(
        impl ToRuby for $ty {
            fn to_ruby<A: RubyApi>(self, vm: &VM<A>) -> Result<Value, Error> {
                vm.with_api(|api| api.uint2num(u64::from(self)))
            }
        }
    )*};
}

to_signed!(i8, i16, i32, i64);
to_unsigned!(u8, u16, u32, u64);

impl ToRuby for isize {
    fn to_ruby<A: RubyApi>(self, vm: &VM<A>) -> Result<Value, Error> {
        // isize is at most 64 bits on every supported target
        vm.with_api(|api| api.int2num(self as i64))
    }
}

impl ToRuby for usize {
    fn to_ruby<A: RubyApi>(self, vm: &VM<A>) -> Result<Value, Error> {
        vm.with_api(|api| api.uint2num(self as u64))
    }
}

impl ToRuby for f64 {
    fn to_ruby<A: RubyApi>(self, vm: &VM<A>) -> Result<Value, Error> {
        vm.with_api(|api| api.float_new(self))
    }
}

impl ToRuby for f32 {
    fn to_ruby<A: RubyApi>(self, vm: &VM<A>) -> Result<Value, Error> {
        f64::from(self).to_ruby(vm)
    }
}

impl ToRuby for bool {
    fn to_ruby<A: RubyApi>(self, vm: &VM<A>) -> Result<Value, Error> {
        vm.with_api(|api| if self { api.qtrue() } else { api.qfalse() })
    }
}

impl ToRuby for &str {
    fn to_ruby<A: RubyApi>(self, vm: &VM<A>) -> Result<Value, Error> {
        vm.with_api(|api| api.str_new(self.as_bytes()))
    }
}

impl ToRuby for String {
    fn to_ruby<A: RubyApi>(self, vm: &VM<A>) -> Result<Value, Error> {
        self.as_str().to_ruby(vm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimRuby;

    fn vm() -> VM<SimRuby> {
        let vm = VM::new(SimRuby::new());
        vm.setup().unwrap();
        vm
    }

    #[test]
    fn integer_extremes_round_trip() {
        let vm = vm();
        let max = u64::MAX.to_ruby(&vm).unwrap();
        assert_eq!(u64::from_ruby(&vm, max), Some(u64::MAX));
        let zero = 0_u64.to_ruby(&vm).unwrap();
        assert_eq!(u64::from_ruby(&vm, zero), Some(0));

        let min = i64::MIN.to_ruby(&vm).unwrap();
        assert_eq!(i64::from_ruby(&vm, min), Some(i64::MIN));
        let top = i64::MAX.to_ruby(&vm).unwrap();
        assert_eq!(i64::from_ruby(&vm, top), Some(i64::MAX));

        let small = i8::MIN.to_ruby(&vm).unwrap();
        assert_eq!(i8::from_ruby(&vm, small), Some(i8::MIN));
        let byte = u8::MAX.to_ruby(&vm).unwrap();
        assert_eq!(u8::from_ruby(&vm, byte), Some(u8::MAX));
    }

    #[test]
    fn unsigned_max_plus_one_fails() {
        let vm = vm();
        let max = u64::MAX.to_ruby(&vm).unwrap();
        let one = 1_u64.to_ruby(&vm).unwrap();
        let beyond = vm.call(max, "+", &[one]).unwrap();
        assert_eq!(u64::from_ruby(&vm, beyond), None);
        assert!(
            vm.history().most_recent().is_some_and(|err| err.exception().is_some()),
            "the runtime's range error is recorded"
        );
    }

    #[test]
    fn negatives_never_become_unsigned() {
        let vm = vm();
        let minus_one = (-1_i64).to_ruby(&vm).unwrap();
        assert_eq!(u32::from_ruby(&vm, minus_one), None);
        let err = vm.history().most_recent().unwrap();
        assert!(
            err.exception().is_some_and(|exc| exc.description.starts_with("#<TypeError")),
            "sign check raises before conversion: {err}"
        );

        assert_eq!(i32::from_ruby(&vm, minus_one), Some(-1));
    }

    #[test]
    fn narrowing_misfits_are_bad_types() {
        let vm = vm();
        let big = 300_i64.to_ruby(&vm).unwrap();
        assert_eq!(u8::from_ruby(&vm, big), None);
        assert_eq!(
            vm.history().most_recent(),
            Some(Error::BadType("300 does not fit in u8".to_string()))
        );
        assert_eq!(i8::from_ruby(&vm, big), None);

        let huge = 1e300_f64.to_ruby(&vm).unwrap();
        assert_eq!(f32::from_ruby(&vm, huge), None);
    }

    #[test]
    fn floats_keep_nan_and_infinity() {
        let vm = vm();
        let nan = f64::NAN.to_ruby(&vm).unwrap();
        assert!(f64::from_ruby(&vm, nan).is_some_and(f64::is_nan));
        let inf = f32::INFINITY.to_ruby(&vm).unwrap();
        assert_eq!(f32::from_ruby(&vm, inf), Some(f32::INFINITY));
        let half = 0.5_f32.to_ruby(&vm).unwrap();
        assert_eq!(f32::from_ruby(&vm, half), Some(0.5));
    }

    #[test]
    fn booleans_and_strings() {
        let vm = vm();
        let yes = true.to_ruby(&vm).unwrap();
        assert_eq!(bool::from_ruby(&vm, yes), Some(true));
        let no = false.to_ruby(&vm).unwrap();
        assert_eq!(bool::from_ruby(&vm, no), Some(false));
        assert_eq!(bool::from_ruby(&vm, vm.nil()), None);
        assert!(matches!(vm.history().most_recent(), Some(Error::BadType(_))));

        let text = "grüße".to_ruby(&vm).unwrap();
        assert_eq!(String::from_ruby(&vm, text), Some("grüße".to_string()));
        let number = 42_i32.to_ruby(&vm).unwrap();
        assert_eq!(String::from_ruby(&vm, number), Some("42".to_string()));
    }
}
