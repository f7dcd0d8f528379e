//! Core methods of the sim runtime and the numeric conversions behind `rb_Integer`, `rb_Float`,
//! `rb_num2long`, `rb_num2ulong` and `rb_num2dbl`.
use std::{io::Write, sync::Arc};

use super::{
    SimBlock, SimCall, SimRuby,
    heap::{Body, fixnum, symbol, symbol_id},
};
use crate::{Id, Value, ValueType};

type Builtin = fn(&SimRuby, &SimCall) -> Value;

fn define(sim: &SimRuby, class: Value, methods: &[(&str, Builtin)]) {
    for &(name, body) in methods {
        sim.def(class, name, Arc::new(body));
    }
}

pub(super) fn install(sim: &SimRuby) {
    let core = sim.core();
    define(
        sim,
        core.object,
        &[
            ("class", object_class),
            ("inspect", object_inspect),
            ("to_s", object_inspect),
            ("==", object_equal),
            ("equal?", object_equal),
            ("!=", object_not_equal),
            ("nil?", object_is_nil),
            ("is_a?", object_is_a),
            ("kind_of?", object_is_a),
            ("respond_to?", object_respond_to),
            ("puts", kernel_puts),
            ("p", kernel_p),
        ],
    );
    define(
        sim,
        core.module,
        &[
            ("name", module_name),
            ("to_s", module_to_s),
            ("inspect", module_to_s),
            ("===", module_case_equal),
            ("const_get", module_const_get),
            ("class_variable_get", module_class_variable_get),
        ],
    );
    define(
        sim,
        core.class,
        &[("new", class_new), ("superclass", class_superclass)],
    );
    define(
        sim,
        core.nil_class,
        &[
            ("to_s", nil_to_s),
            ("to_a", nil_to_a),
            ("to_i", nil_to_i),
            ("to_f", nil_to_f),
            ("inspect", nil_inspect),
            ("nil?", nil_is_nil),
        ],
    );
    define(
        sim,
        core.true_class,
        &[("to_s", true_to_s), ("inspect", true_to_s)],
    );
    define(
        sim,
        core.false_class,
        &[("to_s", false_to_s), ("inspect", false_to_s)],
    );
    define(
        sim,
        core.integer,
        &[
            ("+", num_add),
            ("-", num_sub),
            ("*", num_mul),
            ("/", num_div),
            ("%", num_mod),
            ("-@", num_neg),
            ("==", num_equal),
            ("<", num_lt),
            (">", num_gt),
            ("<=", num_le),
            (">=", num_ge),
            ("to_s", num_to_s),
            ("inspect", num_to_s),
            ("to_i", integer_to_i),
            ("to_int", integer_to_i),
            ("to_f", num_to_f),
            ("times", integer_times),
            ("zero?", num_is_zero),
        ],
    );
    define(
        sim,
        core.float,
        &[
            ("+", num_add),
            ("-", num_sub),
            ("*", num_mul),
            ("/", num_div),
            ("-@", num_neg),
            ("==", num_equal),
            ("<", num_lt),
            (">", num_gt),
            ("<=", num_le),
            (">=", num_ge),
            ("to_s", num_to_s),
            ("inspect", num_to_s),
            ("to_i", float_to_i),
            ("to_int", float_to_i),
            ("to_f", num_to_f),
            ("nan?", float_is_nan),
            ("zero?", num_is_zero),
        ],
    );
    define(
        sim,
        core.string,
        &[
            ("to_s", string_to_s),
            ("to_str", string_to_s),
            ("inspect", string_inspect),
            ("length", string_length),
            ("size", string_length),
            ("+", string_plus),
            ("==", string_equal),
            ("to_i", string_to_i),
            ("to_f", string_to_f),
            ("to_sym", string_to_sym),
        ],
    );
    define(
        sim,
        core.symbol,
        &[
            ("to_s", symbol_to_s),
            ("to_sym", symbol_to_sym),
            ("inspect", symbol_inspect),
        ],
    );
    define(
        sim,
        core.array,
        &[
            ("each", array_each),
            ("map", array_map),
            ("push", array_push),
            ("<<", array_push),
            ("length", array_length),
            ("size", array_length),
            ("first", array_first),
            ("last", array_last),
            ("[]", array_at),
            ("join", array_join),
            ("inspect", array_inspect),
            ("to_s", array_inspect),
        ],
    );
    define(
        sim,
        core.hash,
        &[
            ("[]", hash_get),
            ("[]=", hash_set),
            ("length", hash_length),
            ("size", hash_length),
            ("keys", hash_keys),
            ("inspect", hash_inspect),
            ("to_s", hash_inspect),
        ],
    );
    define(
        sim,
        core.proc_class,
        &[
            ("call", proc_call),
            ("yield", proc_call),
            ("to_proc", proc_to_proc),
            ("lambda?", proc_is_lambda),
        ],
    );
    define(
        sim,
        core.exception,
        &[
            ("message", exception_message),
            ("to_s", exception_to_s),
            ("inspect", exception_inspect),
            ("backtrace", exception_backtrace),
        ],
    );
}

fn arity(sim: &SimRuby, call: &SimCall, min: usize, max: usize) {
    let given = call.args.len();
    if given < min || given > max {
        let expected = if min == max {
            min.to_string()
        } else if max == usize::MAX {
            format!("{min}+")
        } else {
            format!("{min}..{max}")
        };
        let argument_error = sim.core().argument_error;
        sim.raise(
            argument_error,
            format!("wrong number of arguments (given {given}, expected {expected})"),
        );
    }
}

fn text_of(sim: &SimRuby, value: Value) -> String {
    let bytes = sim.st().bytes_of(value);
    String::from_utf8_lossy(&bytes.unwrap_or_default()).into_owned()
}

pub(crate) fn inspect_text(sim: &SimRuby, value: Value) -> String {
    let inspected = sim.send(value, "inspect", &[]);
    text_of(sim, inspected)
}

pub(crate) fn to_s_text(sim: &SimRuby, value: Value) -> String {
    if sim.st().value_type(value) == ValueType::String {
        return text_of(sim, value);
    }
    let converted = sim.send(value, "to_s", &[]);
    text_of(sim, converted)
}

fn new_string(sim: &SimRuby, text: &str) -> Value {
    sim.st().new_string(text.as_bytes())
}

fn object_class(sim: &SimRuby, call: &SimCall) -> Value {
    sim.st().class_of(call.receiver)
}

fn object_inspect(sim: &SimRuby, call: &SimCall) -> Value {
    let class = sim.st().class_name(call.receiver);
    new_string(sim, &format!("#<{class}:{:#018x}>", call.receiver.raw()))
}

fn object_equal(sim: &SimRuby, call: &SimCall) -> Value {
    arity(sim, call, 1, 1);
    sim.boolean(call.receiver == call.args[0])
}

fn object_not_equal(sim: &SimRuby, call: &SimCall) -> Value {
    arity(sim, call, 1, 1);
    let equal = sim.send(call.receiver, "==", &call.args);
    sim.boolean(!sim.truthy(equal))
}

fn object_is_nil(sim: &SimRuby, _call: &SimCall) -> Value {
    sim.boolean(false)
}

fn object_is_a(sim: &SimRuby, call: &SimCall) -> Value {
    arity(sim, call, 1, 1);
    let (is_module, is_a) = {
        let state = sim.st();
        (
            state.module(call.args[0]).is_some(),
            state.is_kind_of(call.receiver, call.args[0]),
        )
    };
    if !is_module {
        let type_error = sim.core().type_error;
        sim.raise(type_error, "class or module required");
    }
    sim.boolean(is_a)
}

fn object_respond_to(sim: &SimRuby, call: &SimCall) -> Value {
    arity(sim, call, 1, 2);
    let name = name_arg(sim, call.args[0]);
    sim.boolean(sim.responds_to(call.receiver, &name))
}

fn write_stdout(bytes: &[u8]) {
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(bytes);
    let _ = out.flush();
}

fn kernel_puts(sim: &SimRuby, call: &SimCall) -> Value {
    if call.args.is_empty() {
        write_stdout(b"\n");
    }
    for &arg in &call.args {
        let items = sim.st().items_of(arg);
        let lines = match items {
            Some(items) => items.into_iter().map(|item| to_s_text(sim, item)).collect(),
            None => vec![to_s_text(sim, arg)],
        };
        for mut line in lines {
            if !line.ends_with('\n') {
                line.push('\n');
            }
            write_stdout(line.as_bytes());
        }
    }
    sim.nil()
}

fn kernel_p(sim: &SimRuby, call: &SimCall) -> Value {
    for &arg in &call.args {
        let line = inspect_text(sim, arg) + "\n";
        write_stdout(line.as_bytes());
    }
    match call.args.as_slice() {
        [] => sim.nil(),
        [single] => *single,
        many => sim.st().new_array(many.to_vec()),
    }
}

/// A symbol or string argument naming something.
fn name_arg(sim: &SimRuby, value: Value) -> String {
    if let Some(id) = symbol_id(value) {
        return sim.id_name(id);
    }
    let bytes = sim.st().bytes_of(value);
    match bytes {
        Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        None => {
            let type_error = sim.core().type_error;
            let text = inspect_text(sim, value);
            sim.raise(type_error, format!("{text} is not a symbol nor a string"))
        }
    }
}

fn module_name(sim: &SimRuby, call: &SimCall) -> Value {
    let name = sim.st().module(call.receiver).and_then(|data| data.name.clone());
    match name {
        Some(name) => new_string(sim, &name),
        None => sim.nil(),
    }
}

fn module_to_s(sim: &SimRuby, call: &SimCall) -> Value {
    let name = sim.st().module_name(call.receiver);
    new_string(sim, &name)
}

fn module_case_equal(sim: &SimRuby, call: &SimCall) -> Value {
    arity(sim, call, 1, 1);
    let is_a = sim.st().is_kind_of(call.args[0], call.receiver);
    sim.boolean(is_a)
}

fn module_const_get(sim: &SimRuby, call: &SimCall) -> Value {
    arity(sim, call, 1, 2);
    let name = name_arg(sim, call.args[0]);
    let mut module = call.receiver;
    for part in name.trim_start_matches("::").split("::") {
        let id = sim.id(part);
        module = sim.lookup_constant(module, id, false);
    }
    module
}

fn module_class_variable_get(sim: &SimRuby, call: &SimCall) -> Value {
    arity(sim, call, 1, 1);
    let name = name_arg(sim, call.args[0]);
    let id = sim.id(&name);
    // SAFETY: method bodies only run under protect
    unsafe { crate::RubyApi::cvar_get(sim, call.receiver, id) }
}

fn class_new(sim: &SimRuby, call: &SimCall) -> Value {
    let class = call.receiver;
    let (core, ancestors) = {
        let state = sim.st();
        (state.core, state.ancestors(class))
    };
    let kind = ancestors
        .iter()
        .copied()
        .find(|&ancestor| {
            [
                core.array,
                core.hash,
                core.string,
                core.exception,
                core.class,
                core.module,
                core.integer,
                core.float,
                core.symbol,
                core.nil_class,
                core.true_class,
                core.false_class,
                core.proc_class,
            ]
            .contains(&ancestor)
        })
        .unwrap_or(core.object);

    let body = if kind == core.array {
        arity(sim, call, 0, 2);
        let size = match call.args.first() {
            Some(&size) => sim.num_to_long(size).max(0) as usize,
            None => 0,
        };
        let fill = call.args.get(1).copied().unwrap_or(sim.nil());
        Body::Array(vec![fill; size])
    } else if kind == core.hash {
        Body::Hash(Vec::new())
    } else if kind == core.string {
        arity(sim, call, 0, 1);
        let text = call.args.first().map(|&arg| to_s_text(sim, arg)).unwrap_or_default();
        Body::String(text.into_bytes())
    } else if kind == core.exception {
        arity(sim, call, 0, 1);
        Body::Exception {
            message: call.args.first().copied().unwrap_or(sim.nil()),
            backtrace: sim.nil(),
        }
    } else if kind == core.class {
        arity(sim, call, 0, 1);
        let superclass = call.args.first().copied().unwrap_or(core.object);
        return sim.st().new_module(None, Some(superclass));
    } else if kind == core.module {
        return sim.st().new_module(None, None);
    } else if kind == core.object {
        Body::Object
    } else {
        let no_method_error = sim.core().no_method_error;
        let description = sim.describe(class);
        sim.raise(
            no_method_error,
            format!("undefined method 'new' for {description}"),
        )
    };

    let object = sim.st().space.alloc(class, body);
    if kind == core.object && sim.responds_to(object, "initialize") {
        sim.send(object, "initialize", &call.args);
    }
    object
}

fn class_superclass(sim: &SimRuby, call: &SimCall) -> Value {
    let superclass = sim.st().module(call.receiver).and_then(|data| data.superclass);
    superclass.unwrap_or(sim.nil())
}

fn nil_to_s(sim: &SimRuby, _call: &SimCall) -> Value {
    new_string(sim, "")
}

fn nil_to_a(sim: &SimRuby, _call: &SimCall) -> Value {
    sim.st().new_array(Vec::new())
}

fn nil_to_i(_sim: &SimRuby, _call: &SimCall) -> Value {
    fixnum(0)
}

fn nil_to_f(sim: &SimRuby, _call: &SimCall) -> Value {
    sim.st().new_float(0.0)
}

fn nil_inspect(sim: &SimRuby, _call: &SimCall) -> Value {
    new_string(sim, "nil")
}

fn nil_is_nil(sim: &SimRuby, _call: &SimCall) -> Value {
    sim.boolean(true)
}

fn true_to_s(sim: &SimRuby, _call: &SimCall) -> Value {
    new_string(sim, "true")
}

fn false_to_s(sim: &SimRuby, _call: &SimCall) -> Value {
    new_string(sim, "false")
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum Num {
    Int(i128),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(int) => int as f64,
            Num::Float(float) => float,
        }
    }
}

fn num_of(sim: &SimRuby, value: Value) -> Option<Num> {
    let state = sim.st();
    if let Some(int) = state.int_of(value) {
        return Some(Num::Int(int));
    }
    state.float_of(value).map(Num::Float)
}

fn num_value(sim: &SimRuby, num: Num) -> Value {
    match num {
        Num::Int(int) => sim.st().integer(int),
        Num::Float(float) => sim.st().new_float(float),
    }
}

fn operands(sim: &SimRuby, call: &SimCall) -> (Num, Num) {
    arity(sim, call, 1, 1);
    let lhs = num_of(sim, call.receiver);
    let rhs = num_of(sim, call.args[0]);
    match (lhs, rhs) {
        (Some(lhs), Some(rhs)) => (lhs, rhs),
        _ => {
            let type_error = sim.core().type_error;
            let arg = sim.conversion_subject(call.args[0]);
            let receiver = sim.st().class_name(call.receiver);
            sim.raise(type_error, format!("{arg} can't be coerced into {receiver}"))
        }
    }
}

fn arithmetic(
    sim: &SimRuby,
    call: &SimCall,
    int: fn(i128, i128) -> Option<i128>,
    float: fn(f64, f64) -> f64,
) -> Value {
    let result = match operands(sim, call) {
        (Num::Int(lhs), Num::Int(rhs)) => match int(lhs, rhs) {
            Some(result) => Num::Int(result),
            None => {
                let range_error = sim.core().range_error;
                sim.raise(range_error, "integer overflow")
            }
        },
        (lhs, rhs) => Num::Float(float(lhs.as_f64(), rhs.as_f64())),
    };
    num_value(sim, result)
}

fn num_add(sim: &SimRuby, call: &SimCall) -> Value {
    arithmetic(sim, call, i128::checked_add, |a, b| a + b)
}

fn num_sub(sim: &SimRuby, call: &SimCall) -> Value {
    arithmetic(sim, call, i128::checked_sub, |a, b| a - b)
}

fn num_mul(sim: &SimRuby, call: &SimCall) -> Value {
    arithmetic(sim, call, i128::checked_mul, |a, b| a * b)
}

fn check_divisor(sim: &SimRuby, lhs: Num, rhs: Num) {
    if let (Num::Int(_), Num::Int(0)) = (lhs, rhs) {
        let zero_division_error = sim.core().zero_division_error;
        sim.raise(zero_division_error, "divided by 0");
    }
}

fn num_div(sim: &SimRuby, call: &SimCall) -> Value {
    let (lhs, rhs) = operands(sim, call);
    check_divisor(sim, lhs, rhs);
    arithmetic(
        sim,
        call,
        |a, b| {
            let quotient = a.checked_div(b)?;
            Some(if a % b != 0 && (a < 0) != (b < 0) {
                quotient - 1
            } else {
                quotient
            })
        },
        |a, b| a / b,
    )
}

fn num_mod(sim: &SimRuby, call: &SimCall) -> Value {
    let (lhs, rhs) = operands(sim, call);
    check_divisor(sim, lhs, rhs);
    arithmetic(
        sim,
        call,
        |a, b| {
            let remainder = a.checked_rem(b)?;
            Some(if remainder != 0 && (remainder < 0) != (b < 0) {
                remainder + b
            } else {
                remainder
            })
        },
        |a, b| a - b * (a / b).floor(),
    )
}

fn num_neg(sim: &SimRuby, call: &SimCall) -> Value {
    let negated = match num_of(sim, call.receiver) {
        Some(Num::Int(int)) => Num::Int(-int),
        Some(Num::Float(float)) => Num::Float(-float),
        None => return sim.nil(),
    };
    num_value(sim, negated)
}

fn num_equal(sim: &SimRuby, call: &SimCall) -> Value {
    arity(sim, call, 1, 1);
    let equal = match (num_of(sim, call.receiver), num_of(sim, call.args[0])) {
        (Some(Num::Int(lhs)), Some(Num::Int(rhs))) => lhs == rhs,
        (Some(lhs), Some(rhs)) => lhs.as_f64() == rhs.as_f64(),
        _ => false,
    };
    sim.boolean(equal)
}

fn compare(sim: &SimRuby, call: &SimCall) -> std::cmp::Ordering {
    arity(sim, call, 1, 1);
    let ordering = match (num_of(sim, call.receiver), num_of(sim, call.args[0])) {
        (Some(Num::Int(lhs)), Some(Num::Int(rhs))) => Some(lhs.cmp(&rhs)),
        (Some(lhs), Some(rhs)) => lhs.as_f64().partial_cmp(&rhs.as_f64()),
        _ => None,
    };
    match ordering {
        Some(ordering) => ordering,
        None => {
            let argument_error = sim.core().argument_error;
            let receiver = sim.st().class_name(call.receiver);
            let arg = inspect_text(sim, call.args[0]);
            sim.raise(
                argument_error,
                format!("comparison of {receiver} with {arg} failed"),
            )
        }
    }
}

fn num_lt(sim: &SimRuby, call: &SimCall) -> Value {
    sim.boolean(compare(sim, call).is_lt())
}

fn num_gt(sim: &SimRuby, call: &SimCall) -> Value {
    sim.boolean(compare(sim, call).is_gt())
}

fn num_le(sim: &SimRuby, call: &SimCall) -> Value {
    sim.boolean(compare(sim, call).is_le())
}

fn num_ge(sim: &SimRuby, call: &SimCall) -> Value {
    sim.boolean(compare(sim, call).is_ge())
}

pub(crate) fn float_to_s(float: f64) -> String {
    if float.is_nan() {
        "NaN".to_string()
    } else if float.is_infinite() {
        let text = if float > 0.0 { "Infinity" } else { "-Infinity" };
        text.to_string()
    } else if float == float.trunc() && float.abs() < 1e16 {
        format!("{float:.1}")
    } else {
        format!("{float:?}")
    }
}

fn num_to_s(sim: &SimRuby, call: &SimCall) -> Value {
    let text = match num_of(sim, call.receiver) {
        Some(Num::Int(int)) => int.to_string(),
        Some(Num::Float(float)) => float_to_s(float),
        None => String::new(),
    };
    new_string(sim, &text)
}

fn num_to_f(sim: &SimRuby, call: &SimCall) -> Value {
    let float = num_of(sim, call.receiver).map_or(0.0, Num::as_f64);
    sim.st().new_float(float)
}

fn num_is_zero(sim: &SimRuby, call: &SimCall) -> Value {
    let zero = num_of(sim, call.receiver).is_some_and(|num| num.as_f64() == 0.0);
    sim.boolean(zero)
}

fn integer_to_i(_sim: &SimRuby, call: &SimCall) -> Value {
    call.receiver
}

fn integer_times(sim: &SimRuby, call: &SimCall) -> Value {
    let count = sim.st().int_of(call.receiver).unwrap_or(0);
    let mut index = 0;
    while index < count {
        let current = sim.st().integer(index);
        sim.yield_block(call, &[current]);
        index += 1;
    }
    call.receiver
}

fn float_to_integer(sim: &SimRuby, float: f64) -> Value {
    if !float.is_finite() {
        let float_domain_error = sim.core().float_domain_error;
        sim.raise(float_domain_error, float_to_s(float));
    }
    sim.st().integer(float.trunc() as i128)
}

fn float_to_i(sim: &SimRuby, call: &SimCall) -> Value {
    let float = sim.st().float_of(call.receiver).unwrap_or(0.0);
    float_to_integer(sim, float)
}

fn float_is_nan(sim: &SimRuby, call: &SimCall) -> Value {
    let float = sim.st().float_of(call.receiver).unwrap_or(0.0);
    sim.boolean(float.is_nan())
}

pub(crate) fn inspect_bytes(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\u{1b}' => out.push_str("\\e"),
            c if c.is_control() && (c as u32) < 0x100 => {
                out.push_str(&format!("\\x{:02X}", c as u32));
            }
            c if c.is_control() => out.push_str(&format!("\\u{:04X}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn string_to_s(_sim: &SimRuby, call: &SimCall) -> Value {
    call.receiver
}

fn string_inspect(sim: &SimRuby, call: &SimCall) -> Value {
    let bytes = sim.st().bytes_of(call.receiver).unwrap_or_default();
    new_string(sim, &inspect_bytes(&bytes))
}

fn string_length(sim: &SimRuby, call: &SimCall) -> Value {
    let length = text_of(sim, call.receiver).chars().count();
    sim.st().integer(length as i128)
}

fn string_plus(sim: &SimRuby, call: &SimCall) -> Value {
    arity(sim, call, 1, 1);
    let (lhs, rhs) = {
        let state = sim.st();
        (state.bytes_of(call.receiver), state.bytes_of(call.args[0]))
    };
    let (Some(mut lhs), Some(rhs)) = (lhs, rhs) else {
        let type_error = sim.core().type_error;
        let class = sim.st().class_name(call.args[0]);
        sim.raise(
            type_error,
            format!("no implicit conversion of {class} into String"),
        )
    };
    lhs.extend_from_slice(&rhs);
    sim.st().new_string(&lhs)
}

fn string_equal(sim: &SimRuby, call: &SimCall) -> Value {
    arity(sim, call, 1, 1);
    let equal = {
        let state = sim.st();
        let rhs = state.bytes_of(call.args[0]);
        rhs.is_some() && state.bytes_of(call.receiver) == rhs
    };
    sim.boolean(equal)
}

/// Leading numeric prefix the way `String#to_i` and `#to_f` read it.
fn numeric_prefix(text: &str, float: bool) -> &str {
    let text = text.trim_start();
    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;
    for (index, c) in text.char_indices() {
        let accept = match c {
            '+' | '-' => index == 0 || (float && text[..index].ends_with(['e', 'E'])),
            '0'..='9' => {
                seen_digit = true;
                true
            }
            '_' => seen_digit,
            '.' if float && !seen_dot && !seen_exp && seen_digit => {
                seen_dot = true;
                true
            }
            'e' | 'E' if float && seen_digit && !seen_exp => {
                seen_exp = true;
                true
            }
            _ => false,
        };
        if !accept {
            break;
        }
        end = index + c.len_utf8();
    }
    text[..end].trim_end_matches(['e', 'E', '.', '_', '+', '-'])
}

fn string_to_i(sim: &SimRuby, call: &SimCall) -> Value {
    let text = text_of(sim, call.receiver);
    let prefix = numeric_prefix(&text, false).replace('_', "");
    let value = prefix.parse::<i128>().unwrap_or(0);
    sim.st().integer(value)
}

fn string_to_f(sim: &SimRuby, call: &SimCall) -> Value {
    let text = text_of(sim, call.receiver);
    let prefix = numeric_prefix(&text, true).replace('_', "");
    let value = prefix.parse::<f64>().unwrap_or(0.0);
    sim.st().new_float(value)
}

fn string_to_sym(sim: &SimRuby, call: &SimCall) -> Value {
    let text = text_of(sim, call.receiver);
    symbol(sim.id(&text))
}

fn symbol_name(sim: &SimRuby, value: Value) -> String {
    symbol_id(value).map(|id| sim.id_name(id)).unwrap_or_default()
}

fn symbol_to_s(sim: &SimRuby, call: &SimCall) -> Value {
    let name = symbol_name(sim, call.receiver);
    new_string(sim, &name)
}

fn symbol_to_sym(_sim: &SimRuby, call: &SimCall) -> Value {
    call.receiver
}

fn is_plain_name(name: &str) -> bool {
    let body = name.strip_suffix(['?', '!', '=']).unwrap_or(name);
    let mut chars = body.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn symbol_inspect(sim: &SimRuby, call: &SimCall) -> Value {
    let name = symbol_name(sim, call.receiver);
    let text = if is_plain_name(&name) {
        format!(":{name}")
    } else {
        format!(":{}", inspect_bytes(name.as_bytes()))
    };
    new_string(sim, &text)
}

fn element(sim: &SimRuby, array: Value, index: usize) -> Option<Value> {
    match sim.st().space.slot(array).map(|slot| &slot.body) {
        Some(Body::Array(items)) => items.get(index).copied(),
        _ => None,
    }
}

fn items(sim: &SimRuby, array: Value) -> Vec<Value> {
    sim.st().items_of(array).unwrap_or_default()
}

fn array_each(sim: &SimRuby, call: &SimCall) -> Value {
    let mut index = 0;
    while let Some(item) = element(sim, call.receiver, index) {
        sim.yield_block(call, &[item]);
        index += 1;
    }
    call.receiver
}

fn array_map(sim: &SimRuby, call: &SimCall) -> Value {
    let mut mapped = Vec::new();
    let mut index = 0;
    while let Some(item) = element(sim, call.receiver, index) {
        mapped.push(sim.yield_block(call, &[item]));
        index += 1;
    }
    sim.st().new_array(mapped)
}

fn array_push(sim: &SimRuby, call: &SimCall) -> Value {
    let mut state = sim.st();
    if let Some(slot) = state.space.slot_mut(call.receiver) {
        if let Body::Array(items) = &mut slot.body {
            items.extend_from_slice(&call.args);
        }
    }
    call.receiver
}

fn array_length(sim: &SimRuby, call: &SimCall) -> Value {
    let length = items(sim, call.receiver).len();
    fixnum(length as i64)
}

fn array_first(sim: &SimRuby, call: &SimCall) -> Value {
    element(sim, call.receiver, 0).unwrap_or(sim.nil())
}

fn array_last(sim: &SimRuby, call: &SimCall) -> Value {
    items(sim, call.receiver).last().copied().unwrap_or(sim.nil())
}

fn array_at(sim: &SimRuby, call: &SimCall) -> Value {
    arity(sim, call, 1, 1);
    let index = sim.num_to_long(call.args[0]);
    let items = items(sim, call.receiver);
    let index = if index < 0 {
        items.len().checked_sub(index.unsigned_abs() as usize)
    } else {
        Some(index as usize)
    };
    index
        .and_then(|index| items.get(index).copied())
        .unwrap_or(sim.nil())
}

fn join(sim: &SimRuby, array: Value, separator: &str, out: &mut String) {
    for (index, item) in items(sim, array).into_iter().enumerate() {
        if index > 0 {
            out.push_str(separator);
        }
        if sim.st().value_type(item) == ValueType::Array {
            join(sim, item, separator, out);
        } else {
            out.push_str(&to_s_text(sim, item));
        }
    }
}

fn array_join(sim: &SimRuby, call: &SimCall) -> Value {
    arity(sim, call, 0, 1);
    let separator = match call.args.first() {
        Some(&separator) => to_s_text(sim, separator),
        None => String::new(),
    };
    let mut out = String::new();
    join(sim, call.receiver, &separator, &mut out);
    new_string(sim, &out)
}

fn array_inspect(sim: &SimRuby, call: &SimCall) -> Value {
    let parts: Vec<String> = items(sim, call.receiver)
        .into_iter()
        .map(|item| inspect_text(sim, item))
        .collect();
    new_string(sim, &format!("[{}]", parts.join(", ")))
}

fn pairs(sim: &SimRuby, hash: Value) -> Vec<(Value, Value)> {
    match sim.st().space.slot(hash).map(|slot| &slot.body) {
        Some(Body::Hash(pairs)) => pairs.clone(),
        _ => Vec::new(),
    }
}

fn same_key(sim: &SimRuby, lhs: Value, rhs: Value) -> bool {
    if lhs == rhs {
        return true;
    }
    let state = sim.st();
    match (state.bytes_of(lhs), state.bytes_of(rhs)) {
        (Some(lhs), Some(rhs)) => lhs == rhs,
        _ => matches!((state.int_of(lhs), state.int_of(rhs)), (Some(a), Some(b)) if a == b),
    }
}

fn hash_get(sim: &SimRuby, call: &SimCall) -> Value {
    arity(sim, call, 1, 1);
    pairs(sim, call.receiver)
        .into_iter()
        .find(|&(key, _)| same_key(sim, key, call.args[0]))
        .map_or(sim.nil(), |(_, value)| value)
}

fn hash_set(sim: &SimRuby, call: &SimCall) -> Value {
    arity(sim, call, 2, 2);
    sim.hash_store(call.receiver, call.args[0], call.args[1]);
    call.args[1]
}

fn hash_length(sim: &SimRuby, call: &SimCall) -> Value {
    fixnum(pairs(sim, call.receiver).len() as i64)
}

fn hash_keys(sim: &SimRuby, call: &SimCall) -> Value {
    let keys = pairs(sim, call.receiver).into_iter().map(|(key, _)| key).collect();
    sim.st().new_array(keys)
}

fn hash_inspect(sim: &SimRuby, call: &SimCall) -> Value {
    let parts: Vec<String> = pairs(sim, call.receiver)
        .into_iter()
        .map(|(key, value)| {
            let value = inspect_text(sim, value);
            match symbol_id(key).map(|id| sim.id_name(id)) {
                Some(name) if is_plain_name(&name) => format!("{name}: {value}"),
                _ => format!("{} => {value}", inspect_text(sim, key)),
            }
        })
        .collect();
    if parts.is_empty() {
        return new_string(sim, "{}");
    }
    new_string(sim, &format!("{{{}}}", parts.join(", ")))
}

fn proc_call(sim: &SimRuby, call: &SimCall) -> Value {
    let blockarg = match call.block {
        SimBlock::Proc { proc, .. } => proc,
        _ => sim.nil(),
    };
    sim.call_proc(call.receiver, &call.args, None, blockarg)
}

fn proc_to_proc(_sim: &SimRuby, call: &SimCall) -> Value {
    call.receiver
}

fn proc_is_lambda(sim: &SimRuby, _call: &SimCall) -> Value {
    sim.boolean(false)
}

fn exception_parts(sim: &SimRuby, exception: Value) -> (Value, Value) {
    match sim.st().space.slot(exception).map(|slot| &slot.body) {
        Some(&Body::Exception { message, backtrace }) => (message, backtrace),
        _ => (sim.nil(), sim.nil()),
    }
}

fn exception_to_s(sim: &SimRuby, call: &SimCall) -> Value {
    let (message, _) = exception_parts(sim, call.receiver);
    if message == sim.nil() {
        let class = sim.st().class_name(call.receiver);
        return new_string(sim, &class);
    }
    if sim.st().value_type(message) == ValueType::String {
        return message;
    }
    sim.send(message, "to_s", &[])
}

fn exception_message(sim: &SimRuby, call: &SimCall) -> Value {
    sim.send(call.receiver, "to_s", &[])
}

fn exception_inspect(sim: &SimRuby, call: &SimCall) -> Value {
    let class = sim.st().class_name(call.receiver);
    let message = sim.send(call.receiver, "to_s", &[]);
    let message = text_of(sim, message);
    if message.is_empty() {
        return new_string(sim, &class);
    }
    new_string(sim, &format!("#<{class}: {message}>"))
}

fn exception_backtrace(sim: &SimRuby, call: &SimCall) -> Value {
    exception_parts(sim, call.receiver).1
}

/// `Integer()` on a string: the whole string must be a number.
pub(crate) fn parse_integer(text: &str) -> Option<i128> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (radix, digits) = match digits.get(..2) {
        Some("0x" | "0X") => (16, &digits[2..]),
        Some("0b" | "0B") => (2, &digits[2..]),
        Some("0o" | "0O") => (8, &digits[2..]),
        _ => (10, digits),
    };
    if digits.is_empty() || digits.starts_with('_') || digits.ends_with('_') || digits.contains("__")
    {
        return None;
    }
    let digits = digits.replace('_', "");
    if !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    let magnitude = i128::from_str_radix(&digits, radix).ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

/// `Float()` on a string.
pub(crate) fn parse_float(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() || text.contains("__") || text.starts_with('_') || text.ends_with('_') {
        return None;
    }
    let cleaned = text.replace('_', "");
    let valid = cleaned
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'));
    if !valid || cleaned.ends_with('.') || cleaned.starts_with('.') {
        return None;
    }
    cleaned.parse().ok()
}

/// Range of `long` as doubles: `[-2^63, 2^63)`.
const LONG_MIN_F: f64 = -9_223_372_036_854_775_808.0;
const LONG_END_F: f64 = 9_223_372_036_854_775_808.0;
const ULONG_END_F: f64 = 18_446_744_073_709_551_616.0;

impl SimRuby {
    fn conversion_subject(&self, value: Value) -> String {
        let value_type = self.st().value_type(value);
        match value_type {
            ValueType::Nil => "nil".to_string(),
            ValueType::True => "true".to_string(),
            ValueType::False => "false".to_string(),
            _ => self.st().class_name(value),
        }
    }

    fn convert_with(&self, value: Value, methods: &[&str], target: &str, check: ValueType) -> Value {
        let core = self.core();
        let subject = self.conversion_subject(value);
        let Some(method) = methods.iter().find(|method| self.responds_to(value, method)) else {
            self.raise(
                core.type_error,
                format!("can't convert {subject} into {target}"),
            )
        };
        let converted = self.send(value, method, &[]);
        let converted_type = self.st().value_type(converted);
        let accepted = converted_type == check
            || (check == ValueType::Fixnum && converted_type == ValueType::Bignum);
        if !accepted {
            let given = self.conversion_subject(converted);
            self.raise(
                core.type_error,
                format!("can't convert {subject} to {target} ({subject}#{method} gives {given})"),
            );
        }
        converted
    }

    pub(crate) fn to_integer(&self, value: Value) -> Value {
        let core = self.core();
        let value_type = self.st().value_type(value);
        match value_type {
            ValueType::Fixnum | ValueType::Bignum => value,
            ValueType::Float => {
                let float = self.st().float_of(value).unwrap_or(0.0);
                float_to_integer(self, float)
            }
            ValueType::String => {
                let text = text_of(self, value);
                match parse_integer(&text) {
                    Some(int) => self.st().integer(int),
                    None => self.raise(
                        core.argument_error,
                        format!("invalid value for Integer(): {}", inspect_bytes(text.as_bytes())),
                    ),
                }
            }
            ValueType::Nil => self.raise(core.type_error, "can't convert nil into Integer"),
            _ => self.convert_with(value, &["to_int", "to_i"], "Integer", ValueType::Fixnum),
        }
    }

    pub(crate) fn to_float(&self, value: Value) -> Value {
        let core = self.core();
        let value_type = self.st().value_type(value);
        match value_type {
            ValueType::Float => value,
            ValueType::Fixnum | ValueType::Bignum => {
                let int = self.st().int_of(value).unwrap_or(0);
                self.st().new_float(int as f64)
            }
            ValueType::String => {
                let text = text_of(self, value);
                match parse_float(&text) {
                    Some(float) => self.st().new_float(float),
                    None => self.raise(
                        core.argument_error,
                        format!("invalid value for Float(): {}", inspect_bytes(text.as_bytes())),
                    ),
                }
            }
            ValueType::Nil | ValueType::True | ValueType::False => {
                let subject = self.conversion_subject(value);
                self.raise(core.type_error, format!("can't convert {subject} into Float"))
            }
            _ => self.convert_with(value, &["to_f"], "Float", ValueType::Float),
        }
    }

    fn no_implicit_integer(&self, value: Value) -> ! {
        let core = self.core();
        let value_type = self.st().value_type(value);
        let message = match value_type {
            ValueType::Nil => "no implicit conversion from nil to integer".to_string(),
            _ => format!(
                "no implicit conversion of {} into Integer",
                self.conversion_subject(value)
            ),
        };
        self.raise(core.type_error, message)
    }

    /// Integral value of anything `rb_num2long`/`rb_num2ulong` accept, before range checks.
    fn integral(&self, value: Value) -> Result<i128, f64> {
        let (value_type, int, float) = {
            let state = self.st();
            (state.value_type(value), state.int_of(value), state.float_of(value))
        };
        match (value_type, int, float) {
            (_, Some(int), _) => Ok(int),
            (_, _, Some(float)) => Err(float),
            (ValueType::Nil | ValueType::True | ValueType::False, ..) => {
                self.no_implicit_integer(value)
            }
            _ if self.responds_to(value, "to_int") => {
                let converted = self.send(value, "to_int", &[]);
                let int = self.st().int_of(converted);
                match int {
                    Some(int) => Ok(int),
                    None => self.no_implicit_integer(value),
                }
            }
            _ => self.no_implicit_integer(value),
        }
    }

    pub(crate) fn num_to_long(&self, value: Value) -> i64 {
        let range_error = self.core().range_error;
        match self.integral(value) {
            Ok(int) => match i64::try_from(int) {
                Ok(long) => long,
                Err(_) => self.raise(range_error, "bignum too big to convert into 'long'"),
            },
            Err(float) if float.is_finite() && (LONG_MIN_F..LONG_END_F).contains(&float) => {
                float as i64
            }
            Err(float) => self.raise(
                range_error,
                format!("float {} out of range of integer", float_to_s(float)),
            ),
        }
    }

    /// Negative values in `long` range wrap, as in C.
    pub(crate) fn num_to_ulong(&self, value: Value) -> u64 {
        let range_error = self.core().range_error;
        match self.integral(value) {
            Ok(int) => match (u64::try_from(int), i64::try_from(int)) {
                (Ok(ulong), _) => ulong,
                (_, Ok(long)) => long as u64,
                _ => self.raise(range_error, "bignum out of range of unsigned long"),
            },
            Err(float) if float.is_finite() && float > LONG_MIN_F && float < ULONG_END_F => {
                if float < 0.0 {
                    (float as i64) as u64
                } else {
                    float as u64
                }
            }
            Err(float) => self.raise(
                range_error,
                format!("float {} out of range of integer", float_to_s(float)),
            ),
        }
    }

    pub(crate) fn num_to_double(&self, value: Value) -> f64 {
        let core = self.core();
        let (value_type, int, float) = {
            let state = self.st();
            (state.value_type(value), state.int_of(value), state.float_of(value))
        };
        if let Some(int) = int {
            return int as f64;
        }
        if let Some(float) = float {
            return float;
        }
        let message = match value_type {
            ValueType::String => "no implicit conversion to float from string".to_string(),
            ValueType::Nil => "no implicit conversion to float from nil".to_string(),
            ValueType::True => "no implicit conversion to float from true".to_string(),
            ValueType::False => "no implicit conversion to float from false".to_string(),
            _ => format!("can't convert {} into Float", self.conversion_subject(value)),
        };
        self.raise(core.type_error, message)
    }

    pub(crate) fn hash_store(&self, hash: Value, key: Value, value: Value) {
        let existing = pairs(self, hash)
            .iter()
            .position(|&(candidate, _)| same_key(self, candidate, key));
        if self.st().value_type(hash) != ValueType::Hash {
            let type_error = self.core().type_error;
            let class = self.st().class_name(hash);
            self.raise(type_error, format!("wrong argument type {class} (expected Hash)"));
        }
        let mut state = self.st();
        if let Some(Body::Hash(pairs)) = state.space.slot_mut(hash).map(|slot| &mut slot.body) {
            match existing {
                Some(index) => pairs[index].1 = value,
                None => pairs.push((key, value)),
            }
        }
    }

    pub(crate) fn lookup_constant(&self, module: Value, id: Id, at_only: bool) -> Value {
        let core = self.core();
        let is_module = self.st().module(module).is_some();
        if !is_module {
            let text = inspect_text(self, module);
            self.raise(core.type_error, format!("{text} is not a class/module"));
        }
        let name = self.id_name(id);
        if !name.starts_with(|c: char| c.is_ascii_uppercase()) {
            self.raise(core.name_error, format!("wrong constant name {name}"));
        }
        let found = {
            let state = self.st();
            if at_only {
                state.constant_at(module, id)
            } else {
                state.constant(module, id)
            }
        };
        if let Some(value) = found {
            return value;
        }
        let qualified = self.st().qualified_name(module, &name);
        self.raise(core.name_error, format!("uninitialized constant {qualified}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_integer_parsing() {
        assert_eq!(parse_integer("42"), Some(42));
        assert_eq!(parse_integer(" -1_000 "), Some(-1000));
        assert_eq!(parse_integer("0x1f"), Some(31));
        assert_eq!(parse_integer("12abc"), None);
        assert_eq!(parse_integer("1__0"), None);
        assert_eq!(parse_integer(""), None);
    }

    #[test]
    fn strict_float_parsing() {
        assert_eq!(parse_float("3.5"), Some(3.5));
        assert_eq!(parse_float("-1e3"), Some(-1000.0));
        assert_eq!(parse_float("1."), None);
        assert_eq!(parse_float("nan"), None, "only digits are accepted");
    }

    #[test]
    fn lenient_prefixes() {
        assert_eq!(numeric_prefix("  12abc", false), "12");
        assert_eq!(numeric_prefix("-3.25e2x", true), "-3.25e2");
        assert_eq!(numeric_prefix("1e", true), "1");
        assert_eq!(numeric_prefix("abc", false), "");
    }

    #[test]
    fn float_formatting_follows_ruby() {
        assert_eq!(float_to_s(3.0), "3.0");
        assert_eq!(float_to_s(0.5), "0.5");
        assert_eq!(float_to_s(f64::NAN), "NaN");
        assert_eq!(float_to_s(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn string_escapes() {
        assert_eq!(inspect_bytes(b"a\"b\n"), r#""a\"b\n""#);
        assert_eq!(inspect_bytes(b"\x01"), r#""\x01""#);
    }

    #[test]
    fn ruby_level_conversions() {
        let sim = SimRuby::new();
        assert_eq!(sim.num_to_ulong(fixnum(-1)), u64::MAX, "num2ulong wraps like C does");
        let big = sim.st().integer(1 << 70);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            sim.num_to_long(big);
        }));
        assert!(result.is_err(), "an out of range bignum must raise");
        let sixty = sim.st().new_string(b"60");
        let converted = sim.to_integer(sixty);
        assert_eq!(sim.st().int_of(converted), Some(60));
    }
}
