//! Builtin functions
//!
//! Registered into the global store through the same native-function
//! interface hosts use, so scripts cannot tell a builtin from a
//! host-registered native. Each builtin returns `Err` to raise a user
//! error the script can `recover` from.

use std::collections::HashMap;
use std::rc::Rc;

use brio_core::{
    stringify, ErrorObj, GlobalStore, Heap, MapKey, NativeApi, NativeFunction, ObjData, Value,
    ValueKind,
};

type BuiltinFn = fn(&mut dyn NativeApi, &[Value]) -> Result<Value, String>;

pub fn register_all(store: &mut GlobalStore, heap: &mut Heap) {
    let builtins: &[(&str, BuiltinFn)] = &[
        ("len", builtin_len),
        ("println", builtin_println),
        ("print", builtin_print),
        ("to_str", builtin_to_str),
        ("to_num", builtin_to_num),
        ("error", builtin_error),
        ("crash", builtin_crash),
        ("assert", builtin_assert),
        ("range", builtin_range),
        ("append", builtin_append),
        ("remove", builtin_remove),
        ("remove_at", builtin_remove_at),
        ("keys", builtin_keys),
        ("values", builtin_values),
        ("copy", builtin_copy),
        ("deep_copy", builtin_deep_copy),
        ("concat", builtin_concat),
        ("slice", builtin_slice),
        ("reverse", builtin_reverse),
        ("first", builtin_first),
        ("last", builtin_last),
        ("rest", builtin_rest),
        ("is_string", builtin_is_string),
        ("is_array", builtin_is_array),
        ("is_map", builtin_is_map),
        ("is_number", builtin_is_number),
        ("is_bool", builtin_is_bool),
        ("is_null", builtin_is_null),
        ("is_function", builtin_is_function),
        ("is_error", builtin_is_error),
        ("is_native_function", builtin_is_native_function),
        ("sqrt", builtin_sqrt),
        ("pow", builtin_pow),
        ("abs", builtin_abs),
        ("floor", builtin_floor),
        ("ceil", builtin_ceil),
        ("read_file", builtin_read_file),
        ("write_file", builtin_write_file),
        ("to_json", builtin_to_json),
    ];
    for (name, func) in builtins {
        let value = heap.alloc(ObjData::Native(NativeFunction {
            name: (*name).to_string(),
            func: Rc::new(*func),
        }));
        store.set(name, value);
    }
}

fn expect_args(name: &str, args: &[Value], count: usize) -> Result<(), String> {
    if args.len() != count {
        return Err(format!(
            "{}: expected {} argument{}, got {}",
            name,
            count,
            if count == 1 { "" } else { "s" },
            args.len()
        ));
    }
    Ok(())
}

fn number_arg(api: &mut dyn NativeApi, name: &str, value: Value) -> Result<f64, String> {
    value.as_number().ok_or_else(|| {
        format!(
            "{}: expected a number, got {}",
            name,
            api.heap().kind_of(value).name()
        )
    })
}

fn string_arg(api: &mut dyn NativeApi, name: &str, value: Value) -> Result<String, String> {
    match api.heap().str_value(value) {
        Some(s) => Ok(s.as_str().to_string()),
        None => Err(format!(
            "{}: expected a string, got {}",
            name,
            api.heap().kind_of(value).name()
        )),
    }
}

// ----------------------------------------------------------------------
// Core
// ----------------------------------------------------------------------

fn builtin_len(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("len", args, 1)?;
    let heap = api.heap();
    let len = match heap.kind_of(args[0]) {
        ValueKind::Array => heap.array(args[0]).map(|a| a.len()),
        ValueKind::Map => heap.map(args[0]).map(|m| m.len()),
        ValueKind::Str => heap.str_value(args[0]).map(|s| s.len()),
        other => return Err(format!("len: cannot get length of {}", other.name())),
    };
    Ok(Value::number(len.unwrap_or(0) as f64))
}

fn builtin_println(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    let mut out = join_stringified(api.heap(), args);
    out.push('\n');
    api.stdout_write(out.as_bytes());
    Ok(Value::NULL)
}

fn builtin_print(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    let out = join_stringified(api.heap(), args);
    api.stdout_write(out.as_bytes());
    Ok(Value::NULL)
}

fn join_stringified(heap: &Heap, args: &[Value]) -> String {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&stringify(heap, *arg));
    }
    out
}

fn builtin_to_str(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("to_str", args, 1)?;
    let s = stringify(api.heap(), args[0]);
    Ok(api.heap().alloc_string(&s))
}

fn builtin_to_num(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("to_num", args, 1)?;
    let value = args[0];
    if let Some(n) = value.as_number() {
        return Ok(Value::number(n));
    }
    if let Some(b) = value.as_bool() {
        return Ok(Value::number(if b { 1.0 } else { 0.0 }));
    }
    if value.is_null() {
        return Ok(Value::number(0.0));
    }
    if let Some(s) = api.heap().str_value(value) {
        return s
            .as_str()
            .trim()
            .parse::<f64>()
            .map(Value::number)
            .map_err(|_| format!("to_num: cannot convert \"{}\" to a number", s.as_str()));
    }
    Err(format!(
        "to_num: cannot convert {} to a number",
        api.heap().kind_of(value).name()
    ))
}

fn builtin_error(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("error", args, 1)?;
    let message = string_arg(api, "error", args[0])?;
    Ok(api.heap().alloc(ObjData::Error(ErrorObj {
        message,
        traceback: None,
    })))
}

fn builtin_crash(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    let message = match args.first() {
        Some(v) => match api.heap().str_value(*v) {
            Some(s) => s.as_str().to_string(),
            None => stringify(api.heap(), *v),
        },
        None => "crash".to_string(),
    };
    Err(message)
}

fn builtin_assert(_api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("assert", args, 1)?;
    if !args[0].is_truthy() {
        return Err("assertion failed".to_string());
    }
    Ok(Value::TRUE)
}

// ----------------------------------------------------------------------
// Collections
// ----------------------------------------------------------------------

fn builtin_range(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    let (start, end, step) = match args.len() {
        1 => (0.0, number_arg(api, "range", args[0])?, 1.0),
        2 => (
            number_arg(api, "range", args[0])?,
            number_arg(api, "range", args[1])?,
            1.0,
        ),
        3 => (
            number_arg(api, "range", args[0])?,
            number_arg(api, "range", args[1])?,
            number_arg(api, "range", args[2])?,
        ),
        n => return Err(format!("range: expected 1 to 3 arguments, got {}", n)),
    };
    if step == 0.0 {
        return Err("range: step cannot be zero".to_string());
    }
    let mut items = Vec::new();
    let mut current = start;
    while (step > 0.0 && current < end) || (step < 0.0 && current > end) {
        items.push(Value::number(current));
        current += step;
    }
    Ok(api.heap().alloc(ObjData::Array(items)))
}

fn builtin_append(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("append", args, 2)?;
    let heap = api.heap();
    match heap.array_mut(args[0]) {
        Some(items) => {
            items.push(args[1]);
            let len = items.len();
            Ok(Value::number(len as f64))
        }
        None => Err(format!(
            "append: expected an array, got {}",
            heap.kind_of(args[0]).name()
        )),
    }
}

fn builtin_remove(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("remove", args, 2)?;
    let heap = api.heap();
    let found = match heap.array(args[0]) {
        Some(items) => items
            .iter()
            .position(|item| values_equal(heap, *item, args[1])),
        None => {
            return Err(format!(
                "remove: expected an array, got {}",
                heap.kind_of(args[0]).name()
            ))
        }
    };
    match found {
        Some(ix) => {
            if let Some(items) = heap.array_mut(args[0]) {
                items.remove(ix);
            }
            Ok(Value::TRUE)
        }
        None => Ok(Value::FALSE),
    }
}

fn builtin_remove_at(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("remove_at", args, 2)?;
    let ix = number_arg(api, "remove_at", args[1])? as i64;
    let heap = api.heap();
    match heap.array_mut(args[0]) {
        Some(items) => {
            if ix < 0 || ix as usize >= items.len() {
                return Ok(Value::FALSE);
            }
            items.remove(ix as usize);
            Ok(Value::TRUE)
        }
        None => Err(format!(
            "remove_at: expected an array, got {}",
            heap.kind_of(args[0]).name()
        )),
    }
}

fn builtin_keys(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("keys", args, 1)?;
    let heap = api.heap();
    let keys: Vec<Value> = match heap.map(args[0]) {
        Some(map) => map.iter().map(|(k, _)| k).collect(),
        None => {
            return Err(format!(
                "keys: expected a map, got {}",
                heap.kind_of(args[0]).name()
            ))
        }
    };
    Ok(heap.alloc(ObjData::Array(keys)))
}

fn builtin_values(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("values", args, 1)?;
    let heap = api.heap();
    let values: Vec<Value> = match heap.map(args[0]) {
        Some(map) => map.iter().map(|(_, v)| v).collect(),
        None => {
            return Err(format!(
                "values: expected a map, got {}",
                heap.kind_of(args[0]).name()
            ))
        }
    };
    Ok(heap.alloc(ObjData::Array(values)))
}

fn builtin_copy(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("copy", args, 1)?;
    let heap = api.heap();
    match heap.kind_of(args[0]) {
        ValueKind::Array => {
            let items = heap.array(args[0]).map(|a| a.clone()).unwrap_or_default();
            Ok(heap.alloc(ObjData::Array(items)))
        }
        ValueKind::Map => {
            let map = heap.map(args[0]).cloned().unwrap_or_default();
            Ok(heap.alloc(ObjData::Map(map)))
        }
        _ => Ok(args[0]),
    }
}

fn builtin_deep_copy(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("deep_copy", args, 1)?;
    let mut memo: HashMap<u32, Value> = HashMap::new();
    Ok(deep_copy_value(api.heap(), args[0], &mut memo))
}

/// Copies arrays and maps recursively; the memo maps old object
/// identity to the new copy so self-referential structures terminate.
fn deep_copy_value(heap: &mut Heap, value: Value, memo: &mut HashMap<u32, Value>) -> Value {
    let Some(handle) = value.as_handle() else {
        return value;
    };
    if let Some(copied) = memo.get(&handle.index()) {
        return *copied;
    }
    match heap.kind_of(value) {
        ValueKind::Array => {
            let copy = heap.alloc(ObjData::Array(Vec::new()));
            memo.insert(handle.index(), copy);
            let items = heap.array(value).map(|a| a.clone()).unwrap_or_default();
            let copied: Vec<Value> = items
                .into_iter()
                .map(|item| deep_copy_value(heap, item, memo))
                .collect();
            if let Some(slot) = heap.array_mut(copy) {
                *slot = copied;
            }
            copy
        }
        ValueKind::Map => {
            let copy = heap.alloc(ObjData::Map(Default::default()));
            memo.insert(handle.index(), copy);
            let entries: Vec<(Value, Value)> = heap
                .map(value)
                .map(|m| m.iter().collect())
                .unwrap_or_default();
            for (key, val) in entries {
                let key_copy = deep_copy_value(heap, key, memo);
                let val_copy = deep_copy_value(heap, val, memo);
                if let Some(map_key) = MapKey::from_value(heap, key_copy) {
                    if let Some(map) = heap.map_mut(copy) {
                        map.insert(map_key, key_copy, val_copy);
                    }
                }
            }
            copy
        }
        ValueKind::External => {
            let copied = match heap.get(handle) {
                ObjData::External(e) => e.copy_fn.as_ref().map(|copy_fn| brio_core::ExternalData {
                    data: copy_fn(&*e.data),
                    copy_fn: Some(Rc::clone(copy_fn)),
                }),
                _ => None,
            };
            match copied {
                Some(external) => {
                    let copy = heap.alloc(ObjData::External(external));
                    memo.insert(handle.index(), copy);
                    copy
                }
                None => value,
            }
        }
        _ => value,
    }
}

fn builtin_concat(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("concat", args, 2)?;
    let heap = api.heap();
    match (heap.kind_of(args[0]), heap.kind_of(args[1])) {
        (ValueKind::Array, ValueKind::Array) => {
            let mut items = heap.array(args[0]).map(|a| a.clone()).unwrap_or_default();
            if let Some(right) = heap.array(args[1]) {
                items.extend_from_slice(right);
            }
            Ok(heap.alloc(ObjData::Array(items)))
        }
        (ValueKind::Str, ValueKind::Str) => {
            let combined = {
                let l = heap.str_value(args[0]).map(|s| s.as_str()).unwrap_or("");
                let r = heap.str_value(args[1]).map(|s| s.as_str()).unwrap_or("");
                format!("{}{}", l, r)
            };
            Ok(heap.alloc_string(&combined))
        }
        (l, r) => Err(format!("concat: cannot concat {} and {}", l.name(), r.name())),
    }
}

fn builtin_slice(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    if args.len() != 2 && args.len() != 3 {
        return Err(format!("slice: expected 2 or 3 arguments, got {}", args.len()));
    }
    let start = number_arg(api, "slice", args[1])? as i64;
    let heap = api.heap();
    let container = args[0];
    match heap.kind_of(container) {
        ValueKind::Array => {
            let items = heap.array(container).map(|a| a.clone()).unwrap_or_default();
            let (from, to) = slice_bounds(start, args.get(2), items.len())?;
            Ok(heap.alloc(ObjData::Array(items[from..to].to_vec())))
        }
        ValueKind::Str => {
            let s = heap
                .str_value(container)
                .map(|s| s.as_str().to_string())
                .unwrap_or_default();
            let (from, to) = slice_bounds(start, args.get(2), s.len())?;
            let sub = String::from_utf8_lossy(&s.as_bytes()[from..to]).into_owned();
            Ok(heap.alloc_string(&sub))
        }
        other => Err(format!("slice: cannot slice {}", other.name())),
    }
}

fn slice_bounds(
    start: i64,
    end: Option<&Value>,
    len: usize,
) -> Result<(usize, usize), String> {
    let clamp = |mut ix: i64| -> usize {
        if ix < 0 {
            ix += len as i64;
        }
        ix.clamp(0, len as i64) as usize
    };
    let from = clamp(start);
    let to = match end {
        Some(v) => match v.as_number() {
            Some(n) => clamp(n as i64),
            None => return Err("slice: end must be a number".to_string()),
        },
        None => len,
    };
    Ok((from, to.max(from)))
}

fn builtin_reverse(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("reverse", args, 1)?;
    let heap = api.heap();
    match heap.kind_of(args[0]) {
        ValueKind::Array => {
            let mut items = heap.array(args[0]).map(|a| a.clone()).unwrap_or_default();
            items.reverse();
            Ok(heap.alloc(ObjData::Array(items)))
        }
        ValueKind::Str => {
            let reversed: String = heap
                .str_value(args[0])
                .map(|s| s.as_str().chars().rev().collect())
                .unwrap_or_default();
            Ok(heap.alloc_string(&reversed))
        }
        other => Err(format!("reverse: cannot reverse {}", other.name())),
    }
}

fn builtin_first(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("first", args, 1)?;
    array_arg(api, "first", args[0]).map(|items| items.first().copied().unwrap_or(Value::NULL))
}

fn builtin_last(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("last", args, 1)?;
    array_arg(api, "last", args[0]).map(|items| items.last().copied().unwrap_or(Value::NULL))
}

fn builtin_rest(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("rest", args, 1)?;
    let items = array_arg(api, "rest", args[0])?;
    if items.is_empty() {
        return Ok(Value::NULL);
    }
    let rest = items[1..].to_vec();
    Ok(api.heap().alloc(ObjData::Array(rest)))
}

fn array_arg(api: &mut dyn NativeApi, name: &str, value: Value) -> Result<Vec<Value>, String> {
    match api.heap().array(value) {
        Some(items) => Ok(items.clone()),
        None => Err(format!(
            "{}: expected an array, got {}",
            name,
            api.heap().kind_of(value).name()
        )),
    }
}

// ----------------------------------------------------------------------
// Predicates
// ----------------------------------------------------------------------

macro_rules! kind_predicate {
    ($fn_name:ident, $name:literal, $($kind:pat_param)|+) => {
        fn $fn_name(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
            expect_args($name, args, 1)?;
            Ok(Value::boolean(matches!(
                api.heap().kind_of(args[0]),
                $($kind)|+
            )))
        }
    };
}

kind_predicate!(builtin_is_string, "is_string", ValueKind::Str);
kind_predicate!(builtin_is_array, "is_array", ValueKind::Array);
kind_predicate!(builtin_is_map, "is_map", ValueKind::Map);
kind_predicate!(builtin_is_number, "is_number", ValueKind::Number);
kind_predicate!(builtin_is_bool, "is_bool", ValueKind::Bool);
kind_predicate!(builtin_is_null, "is_null", ValueKind::Null);
kind_predicate!(builtin_is_function, "is_function", ValueKind::Function);
kind_predicate!(builtin_is_error, "is_error", ValueKind::Error);
kind_predicate!(
    builtin_is_native_function,
    "is_native_function",
    ValueKind::Native
);

// ----------------------------------------------------------------------
// Math
// ----------------------------------------------------------------------

fn builtin_sqrt(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("sqrt", args, 1)?;
    Ok(Value::number(number_arg(api, "sqrt", args[0])?.sqrt()))
}

fn builtin_pow(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("pow", args, 2)?;
    let base = number_arg(api, "pow", args[0])?;
    let exp = number_arg(api, "pow", args[1])?;
    Ok(Value::number(base.powf(exp)))
}

fn builtin_abs(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("abs", args, 1)?;
    Ok(Value::number(number_arg(api, "abs", args[0])?.abs()))
}

fn builtin_floor(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("floor", args, 1)?;
    Ok(Value::number(number_arg(api, "floor", args[0])?.floor()))
}

fn builtin_ceil(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("ceil", args, 1)?;
    Ok(Value::number(number_arg(api, "ceil", args[0])?.ceil()))
}

// ----------------------------------------------------------------------
// I/O through the host hooks
// ----------------------------------------------------------------------

fn builtin_read_file(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("read_file", args, 1)?;
    let path = string_arg(api, "read_file", args[0])?;
    let contents = api.file_read(&path)?;
    Ok(api.heap().alloc_string(&contents))
}

fn builtin_write_file(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("write_file", args, 2)?;
    let path = string_arg(api, "write_file", args[0])?;
    let contents = string_arg(api, "write_file", args[1])?;
    let written = api.file_write(&path, contents.as_bytes())?;
    Ok(Value::number(written as f64))
}

// ----------------------------------------------------------------------
// JSON
// ----------------------------------------------------------------------

fn builtin_to_json(api: &mut dyn NativeApi, args: &[Value]) -> Result<Value, String> {
    expect_args("to_json", args, 1)?;
    let json = {
        let heap = api.heap();
        let mut visiting = Vec::new();
        value_to_json(heap, args[0], &mut visiting)?
    };
    let text = json.to_string();
    Ok(api.heap().alloc_string(&text))
}

fn value_to_json(
    heap: &Heap,
    value: Value,
    visiting: &mut Vec<u32>,
) -> Result<serde_json::Value, String> {
    if value.is_null() {
        return Ok(serde_json::Value::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(serde_json::Value::Bool(b));
    }
    if let Some(n) = value.as_number() {
        return Ok(serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null));
    }
    let Some(handle) = value.as_handle() else {
        return Ok(serde_json::Value::Null);
    };
    if visiting.contains(&handle.index()) {
        return Err("to_json: value contains a cycle".to_string());
    }
    match heap.get(handle) {
        ObjData::Str(s) => Ok(serde_json::Value::String(s.as_str().to_string())),
        ObjData::Array(items) => {
            visiting.push(handle.index());
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(value_to_json(heap, *item, visiting)?);
            }
            visiting.pop();
            Ok(serde_json::Value::Array(out))
        }
        ObjData::Map(map) => {
            visiting.push(handle.index());
            let mut out = serde_json::Map::new();
            for (key, val) in map.iter() {
                let key_str = stringify(heap, key);
                out.insert(key_str, value_to_json(heap, val, visiting)?);
            }
            visiting.pop();
            Ok(serde_json::Value::Object(out))
        }
        ObjData::Error(e) => Ok(serde_json::Value::String(format!("error: {}", e.message))),
        other => Err(format!("to_json: cannot serialize {}", other.kind().name())),
    }
}

// ----------------------------------------------------------------------
// Shared helpers
// ----------------------------------------------------------------------

/// Loose equality used by `remove`: numbers by value, strings by
/// content, everything else by identity.
fn values_equal(heap: &Heap, a: Value, b: Value) -> bool {
    if let (Some(l), Some(r)) = (a.as_numeric(), b.as_numeric()) {
        return l == r;
    }
    if a.is_null() && b.is_null() {
        return true;
    }
    if let (Some(l), Some(r)) = (heap.str_value(a), heap.str_value(b)) {
        return l == r;
    }
    a == b
}
