use std::fmt;

use crate::{Error, RubyApi, VM, Value};

/// A `Value` the collector will not reclaim while the box is alive.
///
/// The value lives in its own heap slot whose address is registered as a GC root, so the
/// address must not move: that is why the slot is boxed rather than stored inline. `dup`
/// registers a second slot for the same object.
pub struct PinnedValue<'vm, A: RubyApi> {
    vm: &'vm VM<A>,
    slot: Box<Value>,
}

impl<'vm, A: RubyApi> PinnedValue<'vm, A> {
    pub(crate) fn new(vm: &'vm VM<A>, value: Value) -> Result<Self, Error> {
        let mut slot = Box::new(value);
        vm.register_slot(&raw mut *slot)?;
        Ok(Self { vm, slot })
    }

    #[inline]
    pub fn get(&self) -> Value {
        *self.slot
    }

    /// Point the registered slot at another object.
    #[inline]
    pub fn set(&mut self, value: Value) {
        *self.slot = value;
    }

    /// Pin the same object in a new slot. Fails once the VM has been cleaned up.
    pub fn dup(&self) -> Result<Self, Error> {
        PinnedValue::new(self.vm, self.get())
    }
}

impl<A: RubyApi> Drop for PinnedValue<'_, A> {
    fn drop(&mut self) {
        self.vm.release_slot(&raw mut *self.slot);
    }
}

impl<A: RubyApi> fmt::Debug for PinnedValue<'_, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PinnedValue").field(&self.get()).finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::{Error, RubyApi, SimRuby, VM};

    #[test]
    fn slot_follows_set() {
        let vm = VM::new(SimRuby::new());
        vm.setup().unwrap();
        let first = vm.api().str_new(b"first");
        let second = vm.api().str_new(b"second");

        let mut pinned = vm.pin(first).unwrap();
        pinned.set(second);
        assert_eq!(pinned.get(), second);
        assert_eq!(vm.api().pinned_count(), 1, "set reuses the registered slot");
    }

    #[test]
    fn release_after_cleanup_skips_the_runtime() {
        let vm = VM::new(SimRuby::new());
        vm.setup().unwrap();
        let pinned = vm.pin(vm.api().int2num(7)).unwrap();
        assert_eq!(vm.api().pinned_count(), 1);
        vm.cleanup();
        drop(pinned);
        assert_eq!(
            vm.api().pinned_count(),
            1,
            "a torn down runtime is never asked to unregister"
        );
    }

    #[test]
    fn dup_after_cleanup_fails_without_a_new_root() {
        let vm = VM::new(SimRuby::new());
        let pinned = vm.pin(vm.api().str_new(b"kept")).unwrap();
        vm.cleanup();
        assert!(matches!(pinned.dup(), Err(Error::Setup(_))));
        assert_eq!(vm.api().pinned_count(), 1, "only the original slot was ever registered");
    }
}
