//! Object space of the sim runtime: `VALUE` encoding, heap slots, the core class tree.
//!
//! Immediates use the Ruby 3.2+ 64-bit layout so that values look the same to the boundary as
//! they would with libruby. Heap references are slot addresses in a private range.
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
};

use super::{SimCall, SimRuby};
use crate::{Id, Value, ValueType, api::BlockFunc};

pub(crate) const QFALSE: usize = 0x00;
pub(crate) const QNIL: usize = 0x04;
pub(crate) const QTRUE: usize = 0x14;
pub(crate) const QUNDEF: usize = 0x24;
const FIXNUM_FLAG: usize = 0x01;
const SYMBOL_FLAG: usize = 0x0c;
const HEAP_BASE: usize = 0x1000;

pub(crate) const FIXNUM_MIN: i128 = -(1 << 62);
pub(crate) const FIXNUM_MAX: i128 = (1 << 62) - 1;

/// A method body. Builtins and test-defined methods share the shape.
pub type SimMethod = Arc<dyn Fn(&SimRuby, &SimCall) -> Value + Send + Sync>;

pub(crate) struct ModuleData {
    pub name: Option<String>,
    pub is_class: bool,
    pub superclass: Option<Value>,
    pub constants: HashMap<Id, Value>,
    pub class_vars: HashMap<Id, Value>,
}

impl ModuleData {
    pub(crate) fn new(name: Option<String>, is_class: bool, superclass: Option<Value>) -> Self {
        Self {
            name,
            is_class,
            superclass,
            constants: HashMap::new(),
            class_vars: HashMap::new(),
        }
    }
}

pub(crate) enum Body {
    Float(f64),
    Bignum(i128),
    String(Vec<u8>),
    Array(Vec<Value>),
    Hash(Vec<(Value, Value)>),
    Module(ModuleData),
    Object,
    Exception { message: Value, backtrace: Value },
    Proc { func: BlockFunc, data: Value },
}

pub(crate) struct Slot {
    pub class: Value,
    pub body: Body,
}

/// One line of a backtrace.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub file: String,
    pub line: usize,
    pub label: String,
}

impl Frame {
    pub(crate) fn render(&self) -> String {
        format!("{}:{}:in '{}'", self.file, self.line, self.label)
    }
}

#[inline]
pub(crate) fn fixnum(value: i64) -> Value {
    Value::from_raw(((value as usize) << 1) | FIXNUM_FLAG)
}

#[inline]
pub(crate) fn fixnum_value(value: Value) -> i64 {
    (value.raw() as i64) >> 1
}

#[inline]
pub(crate) fn is_fixnum(value: Value) -> bool {
    value.raw() & FIXNUM_FLAG != 0
}

#[inline]
pub(crate) fn symbol(id: Id) -> Value {
    Value::from_raw((id.raw() << 8) | SYMBOL_FLAG)
}

#[inline]
pub(crate) fn symbol_id(value: Value) -> Option<Id> {
    (value.raw() & 0xff == SYMBOL_FLAG).then(|| Id::from_raw(value.raw() >> 8))
}

#[derive(Default)]
pub(crate) struct ObjectSpace {
    slots: Vec<Slot>,
    names: Vec<String>,
    ids: HashMap<String, Id>,
}

impl ObjectSpace {
    pub(crate) fn alloc(&mut self, class: Value, body: Body) -> Value {
        let index = self.slots.len();
        self.slots.push(Slot { class, body });
        Value::from_raw(HEAP_BASE + index * 8)
    }

    fn index(value: Value) -> Option<usize> {
        let raw = value.raw();
        if raw < HEAP_BASE || raw & 0x7 != 0 {
            return None;
        }
        Some((raw - HEAP_BASE) / 8)
    }

    pub(crate) fn slot(&self, value: Value) -> Option<&Slot> {
        self.slots.get(Self::index(value)?)
    }

    pub(crate) fn slot_mut(&mut self, value: Value) -> Option<&mut Slot> {
        self.slots.get_mut(Self::index(value)?)
    }

    pub(crate) fn intern(&mut self, name: &str) -> Id {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        self.names.push(name.to_string());
        let id = Id::from_raw(self.names.len());
        self.ids.insert(name.to_string(), id);
        id
    }

    pub(crate) fn name(&self, id: Id) -> &str {
        id.raw()
            .checked_sub(1)
            .and_then(|index| self.names.get(index))
            .map_or("", String::as_str)
    }
}

/// The classes the runtime itself refers to.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Core {
    pub object: Value,
    pub module: Value,
    pub class: Value,
    pub nil_class: Value,
    pub true_class: Value,
    pub false_class: Value,
    pub integer: Value,
    pub float: Value,
    pub string: Value,
    pub symbol: Value,
    pub array: Value,
    pub hash: Value,
    pub proc_class: Value,
    pub exception: Value,
    pub load_error: Value,
    pub syntax_error: Value,
    pub standard_error: Value,
    pub runtime_error: Value,
    pub type_error: Value,
    pub argument_error: Value,
    pub name_error: Value,
    pub no_method_error: Value,
    pub range_error: Value,
    pub float_domain_error: Value,
    pub zero_division_error: Value,
    pub local_jump_error: Value,
}

fn set_constant(space: &mut ObjectSpace, module: Value, name: &str, value: Value) {
    let id = space.intern(name);
    if let Some(Slot {
        body: Body::Module(data),
        ..
    }) = space.slot_mut(module)
    {
        data.constants.insert(id, value);
    }
}

fn boot(space: &mut ObjectSpace) -> Core {
    let placeholder = Value::from_raw(QNIL);
    let class_data = |name: &str, superclass| {
        Body::Module(ModuleData::new(Some(name.to_string()), true, superclass))
    };

    let object = space.alloc(placeholder, class_data("Object", None));
    let module = space.alloc(placeholder, class_data("Module", Some(object)));
    let class = space.alloc(placeholder, class_data("Class", Some(module)));
    for value in [object, module, class] {
        if let Some(slot) = space.slot_mut(value) {
            slot.class = class;
        }
    }
    for (name, value) in [("Object", object), ("Module", module), ("Class", class)] {
        set_constant(space, object, name, value);
    }

    let mut define = |name: &str, superclass: Value| {
        let value = space.alloc(class, class_data(name, Some(superclass)));
        set_constant(space, object, name, value);
        value
    };

    let nil_class = define("NilClass", object);
    let true_class = define("TrueClass", object);
    let false_class = define("FalseClass", object);
    let integer = define("Integer", object);
    let float = define("Float", object);
    let string = define("String", object);
    let symbol = define("Symbol", object);
    let array = define("Array", object);
    let hash = define("Hash", object);
    let proc_class = define("Proc", object);

    let exception = define("Exception", object);
    let script_error = define("ScriptError", exception);
    let load_error = define("LoadError", script_error);
    let syntax_error = define("SyntaxError", script_error);
    let standard_error = define("StandardError", exception);
    let runtime_error = define("RuntimeError", standard_error);
    let type_error = define("TypeError", standard_error);
    let argument_error = define("ArgumentError", standard_error);
    let name_error = define("NameError", standard_error);
    let no_method_error = define("NoMethodError", name_error);
    let range_error = define("RangeError", standard_error);
    let float_domain_error = define("FloatDomainError", range_error);
    let zero_division_error = define("ZeroDivisionError", standard_error);
    let local_jump_error = define("LocalJumpError", standard_error);
    let index_error = define("IndexError", standard_error);
    define("KeyError", index_error);

    let kernel = space.alloc(
        module,
        Body::Module(ModuleData::new(Some("Kernel".to_string()), false, None)),
    );
    set_constant(space, object, "Kernel", kernel);

    Core {
        object,
        module,
        class,
        nil_class,
        true_class,
        false_class,
        integer,
        float,
        string,
        symbol,
        array,
        hash,
        proc_class,
        exception,
        load_error,
        syntax_error,
        standard_error,
        runtime_error,
        type_error,
        argument_error,
        name_error,
        no_method_error,
        range_error,
        float_domain_error,
        zero_division_error,
        local_jump_error,
    }
}

/// Everything the sim runtime knows, behind the `SimRuby` mutex. Nothing in here calls back out
/// of the sim, so a lock on it is never held across a method body or a block.
pub(crate) struct SimState {
    pub space: ObjectSpace,
    pub core: Core,
    pub methods: HashMap<(Value, Id), SimMethod>,
    pub errinfo: Value,
    pub frames: Vec<Frame>,
    /// Break targets of the blocks currently running, innermost last.
    pub yields: Vec<Option<u64>>,
    pub next_target: u64,
    pub load_path: Vec<PathBuf>,
    pub pinned: HashSet<usize>,
    pub initialized: bool,
}

impl SimState {
    pub(crate) fn new() -> Self {
        let mut space = ObjectSpace::default();
        let core = boot(&mut space);
        Self {
            space,
            core,
            methods: HashMap::new(),
            errinfo: Value::from_raw(QNIL),
            frames: Vec::new(),
            yields: Vec::new(),
            next_target: 1,
            load_path: Vec::new(),
            pinned: HashSet::new(),
            initialized: false,
        }
    }

    pub(crate) fn value_type(&self, value: Value) -> ValueType {
        match value.raw() {
            QFALSE => return ValueType::False,
            QNIL => return ValueType::Nil,
            QTRUE => return ValueType::True,
            QUNDEF => return ValueType::Undef,
            _ => {}
        }
        if is_fixnum(value) {
            return ValueType::Fixnum;
        }
        if symbol_id(value).is_some() {
            return ValueType::Symbol;
        }
        match self.space.slot(value).map(|slot| &slot.body) {
            Some(Body::Float(_)) => ValueType::Float,
            Some(Body::Bignum(_)) => ValueType::Bignum,
            Some(Body::String(_)) => ValueType::String,
            Some(Body::Array(_)) => ValueType::Array,
            Some(Body::Hash(_)) => ValueType::Hash,
            Some(Body::Module(_)) => ValueType::Module,
            _ => ValueType::Object,
        }
    }

    pub(crate) fn class_of(&self, value: Value) -> Value {
        let core = &self.core;
        match self.value_type(value) {
            ValueType::Nil => core.nil_class,
            ValueType::True => core.true_class,
            ValueType::False => core.false_class,
            ValueType::Fixnum => core.integer,
            ValueType::Symbol => core.symbol,
            _ => self.space.slot(value).map_or(core.object, |slot| slot.class),
        }
    }

    pub(crate) fn module(&self, value: Value) -> Option<&ModuleData> {
        match self.space.slot(value) {
            Some(Slot {
                body: Body::Module(data),
                ..
            }) => Some(data),
            _ => None,
        }
    }

    pub(crate) fn module_mut(&mut self, value: Value) -> Option<&mut ModuleData> {
        match self.space.slot_mut(value) {
            Some(Slot {
                body: Body::Module(data),
                ..
            }) => Some(data),
            _ => None,
        }
    }

    /// `module` and its superclasses, nearest first.
    pub(crate) fn ancestors(&self, module: Value) -> Vec<Value> {
        let mut chain = Vec::new();
        let mut current = Some(module);
        while let Some(value) = current {
            chain.push(value);
            current = self.module(value).and_then(|data| data.superclass);
        }
        chain
    }

    pub(crate) fn is_subclass(&self, class: Value, parent: Value) -> bool {
        self.ancestors(class).contains(&parent)
    }

    pub(crate) fn is_kind_of(&self, value: Value, class: Value) -> bool {
        self.is_subclass(self.class_of(value), class)
    }

    pub(crate) fn find_method(&self, class: Value, method: Id) -> Option<SimMethod> {
        self.ancestors(class)
            .into_iter()
            .find_map(|module| self.methods.get(&(module, method)).cloned())
    }

    pub(crate) fn module_name(&self, module: Value) -> String {
        match self.module(module) {
            Some(ModuleData {
                name: Some(name), ..
            }) => name.clone(),
            Some(ModuleData { is_class: true, .. }) => format!("#<Class:{:#018x}>", module.raw()),
            _ => format!("#<Module:{:#018x}>", module.raw()),
        }
    }

    pub(crate) fn class_name(&self, value: Value) -> String {
        self.module_name(self.class_of(value))
    }

    pub(crate) fn integer(&mut self, value: i128) -> Value {
        if (FIXNUM_MIN..=FIXNUM_MAX).contains(&value) {
            return fixnum(value as i64);
        }
        let class = self.core.integer;
        self.space.alloc(class, Body::Bignum(value))
    }

    pub(crate) fn int_of(&self, value: Value) -> Option<i128> {
        if is_fixnum(value) {
            return Some(fixnum_value(value) as i128);
        }
        match self.space.slot(value)?.body {
            Body::Bignum(big) => Some(big),
            _ => None,
        }
    }

    pub(crate) fn float_of(&self, value: Value) -> Option<f64> {
        match self.space.slot(value)?.body {
            Body::Float(float) => Some(float),
            _ => None,
        }
    }

    pub(crate) fn new_float(&mut self, value: f64) -> Value {
        let class = self.core.float;
        self.space.alloc(class, Body::Float(value))
    }

    pub(crate) fn bytes_of(&self, value: Value) -> Option<Vec<u8>> {
        match &self.space.slot(value)?.body {
            Body::String(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }

    pub(crate) fn new_string(&mut self, bytes: &[u8]) -> Value {
        let class = self.core.string;
        self.space.alloc(class, Body::String(bytes.to_vec()))
    }

    pub(crate) fn items_of(&self, value: Value) -> Option<Vec<Value>> {
        match &self.space.slot(value)?.body {
            Body::Array(items) => Some(items.clone()),
            _ => None,
        }
    }

    pub(crate) fn new_array(&mut self, items: Vec<Value>) -> Value {
        let class = self.core.array;
        self.space.alloc(class, Body::Array(items))
    }

    pub(crate) fn new_module(&mut self, name: Option<String>, superclass: Option<Value>) -> Value {
        let is_class = superclass.is_some();
        let class = if is_class { self.core.class } else { self.core.module };
        self.space
            .alloc(class, Body::Module(ModuleData::new(name, is_class, superclass)))
    }

    pub(crate) fn set_constant(&mut self, module: Value, id: Id, value: Value) {
        if let Some(data) = self.module_mut(module) {
            data.constants.insert(id, value);
        }
    }

    pub(crate) fn constant_at(&self, module: Value, id: Id) -> Option<Value> {
        self.module(module)?.constants.get(&id).copied()
    }

    /// Ancestors first, then `Object` for plain modules.
    pub(crate) fn constant(&self, module: Value, id: Id) -> Option<Value> {
        self.ancestors(module)
            .into_iter()
            .chain(std::iter::once(self.core.object))
            .find_map(|module| self.constant_at(module, id))
    }

    pub(crate) fn class_var(&self, class: Value, id: Id) -> Option<Value> {
        self.ancestors(class)
            .into_iter()
            .find_map(|module| self.module(module)?.class_vars.get(&id).copied())
    }

    /// Name for a constant defined in `parent`.
    pub(crate) fn qualified_name(&self, parent: Value, name: &str) -> String {
        if parent == self.core.object {
            name.to_string()
        } else {
            format!("{}::{name}", self.module_name(parent))
        }
    }

    pub(crate) fn backtrace(&mut self) -> Value {
        let lines: Vec<Vec<u8>> = self
            .frames
            .iter()
            .rev()
            .map(|frame| frame.render().into_bytes())
            .collect();
        let items = lines.iter().map(|line| self.new_string(line)).collect();
        self.new_array(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediates_use_the_ruby_layout() {
        let state = SimState::new();
        assert_eq!(state.value_type(Value::from_raw(QNIL)), ValueType::Nil);
        assert_eq!(state.value_type(fixnum(-5)), ValueType::Fixnum);
        assert_eq!(fixnum_value(fixnum(-5)), -5);
        assert_eq!(fixnum(0).raw(), 1, "INT2FIX(0) is 1");
        assert_eq!(state.value_type(symbol(Id::from_raw(3))), ValueType::Symbol);
    }

    #[test]
    fn integers_outside_fixnum_range_are_bignums() {
        let mut state = SimState::new();
        let max = state.integer(FIXNUM_MAX);
        let over = state.integer(FIXNUM_MAX + 1);
        assert_eq!(state.value_type(max), ValueType::Fixnum);
        assert_eq!(state.value_type(over), ValueType::Bignum);
        assert_eq!(state.int_of(over), Some(FIXNUM_MAX + 1));
    }

    #[test]
    fn core_classes_form_a_tree() {
        let state = SimState::new();
        let core = state.core;
        assert!(state.is_subclass(core.no_method_error, core.standard_error));
        assert!(!state.is_subclass(core.load_error, core.standard_error));
        assert_eq!(state.class_of(core.object), core.class);
        assert_eq!(state.module_name(core.float_domain_error), "FloatDomainError");
    }
}
