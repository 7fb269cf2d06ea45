//! Allocated object records
//!
//! Everything that does not fit in a NaN-boxed immediate lives in the
//! heap as an [`ObjData`] record: strings, arrays, maps, script and
//! native functions, error values, and host-owned externals. The
//! record's own variant disambiguates the shared "object" value tag.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode::CompiledBlock;
use crate::heap::{Handle, Heap};
use crate::string::BrioString;
use crate::traceback::Traceback;
use crate::value::{Value, ValueKind};

/// A compiled function prototype or closure.
///
/// Prototypes live in the constant pool with an empty `free_vals`;
/// the `Function` opcode clones the prototype and fills in the
/// captured values. The compiled block is shared via `Rc`, which is
/// what lets the top-level "main" function share its block with the
/// VM caller.
#[derive(Debug, Clone)]
pub struct ScriptFunction {
    pub block: Rc<CompiledBlock>,
    pub name: Option<String>,
    pub num_locals: usize,
    pub num_args: usize,
    pub free_vals: Vec<Value>,
}

impl ScriptFunction {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("anonymous")
    }
}

/// Interface native callbacks see. The runtime implements it on top
/// of the live VM so natives can allocate, perform host I/O through
/// the configured hooks, and call back into script code.
pub trait NativeApi {
    fn heap(&mut self) -> &mut Heap;
    fn call_value(&mut self, callee: Value, args: &[Value]) -> Result<Value, String>;
    fn stdout_write(&mut self, bytes: &[u8]) -> usize;
    fn file_read(&mut self, path: &str) -> Result<String, String>;
    fn file_write(&mut self, path: &str, data: &[u8]) -> Result<usize, String>;
}

/// A native function body. An `Err` return becomes a positioned user
/// error in the VM's error list.
pub type NativeCallback = Rc<dyn Fn(&mut dyn NativeApi, &[Value]) -> Result<Value, String>>;

#[derive(Clone)]
pub struct NativeFunction {
    pub name: String,
    pub func: NativeCallback,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}

/// Opaque host data carried as a value. Dropping the record drops the
/// data; copying uses the optional hook and otherwise shares.
#[derive(Clone)]
pub struct ExternalData {
    pub data: Rc<dyn Any>,
    pub copy_fn: Option<Rc<dyn Fn(&dyn Any) -> Rc<dyn Any>>>,
}

impl fmt::Debug for ExternalData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExternalData")
    }
}

/// An error value: the payload of `error("...")` and of values bound
/// by `recover`.
#[derive(Debug, Clone, Default)]
pub struct ErrorObj {
    pub message: String,
    pub traceback: Option<Traceback>,
}

/// Hashable projection of a value, used as the lookup key of map
/// objects. Only numbers, bools, and strings can key a map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MapKey {
    /// Bit pattern of the (canonicalized) number.
    Number(u64),
    Bool(bool),
    Str(Box<str>),
}

impl MapKey {
    pub fn from_value(heap: &Heap, v: Value) -> Option<MapKey> {
        if v.is_number() {
            return Some(MapKey::Number(v.to_bits()));
        }
        if let Some(b) = v.as_bool() {
            return Some(MapKey::Bool(b));
        }
        if let Some(h) = v.as_handle() {
            if let ObjData::Str(s) = heap.get(h) {
                return Some(MapKey::Str(Box::from(s.as_str())));
            }
        }
        None
    }

    pub fn from_str(s: &str) -> MapKey {
        MapKey::Str(Box::from(s))
    }
}

/// Insertion-ordered, value-keyed dictionary. Each entry remembers the
/// original key value so iteration can hand keys back to the script.
#[derive(Debug, Clone, Default)]
pub struct ValueMap {
    entries: IndexMap<MapKey, (Value, Value)>,
}

impl ValueMap {
    pub fn new() -> ValueMap {
        ValueMap::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &MapKey) -> Option<Value> {
        self.entries.get(key).map(|(_, v)| *v)
    }

    /// Insert or update. An existing key keeps its position and its
    /// original key value.
    pub fn insert(&mut self, key: MapKey, key_value: Value, value: Value) {
        match self.entries.get_mut(&key) {
            Some(entry) => entry.1 = value,
            None => {
                self.entries.insert(key, (key_value, value));
            }
        }
    }

    /// Remove by key, preserving the order of the remaining entries.
    pub fn remove(&mut self, key: &MapKey) -> Option<Value> {
        self.entries.shift_remove(key).map(|(_, v)| v)
    }

    pub fn key_at(&self, ix: usize) -> Option<Value> {
        self.entries.get_index(ix).map(|(_, (k, _))| *k)
    }

    pub fn value_at(&self, ix: usize) -> Option<Value> {
        self.entries.get_index(ix).map(|(_, (_, v))| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.values().copied()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Payload of one heap slot.
#[derive(Debug, Clone, Default)]
pub enum ObjData {
    /// Vacant slot awaiting reuse.
    #[default]
    Free,
    Str(BrioString),
    Error(ErrorObj),
    Array(Vec<Value>),
    Map(ValueMap),
    Function(ScriptFunction),
    Native(NativeFunction),
    External(ExternalData),
}

impl ObjData {
    pub fn kind(&self) -> ValueKind {
        match self {
            ObjData::Free => ValueKind::Null,
            ObjData::Str(_) => ValueKind::Str,
            ObjData::Error(_) => ValueKind::Error,
            ObjData::Array(_) => ValueKind::Array,
            ObjData::Map(_) => ValueKind::Map,
            ObjData::Function(_) => ValueKind::Function,
            ObjData::Native(_) => ValueKind::Native,
            ObjData::External(_) => ValueKind::External,
        }
    }
}

/// Render a value for display: the form `println` and the REPL print.
/// Strings render raw at the top level and quoted inside containers.
/// Cycles print as `...`.
pub fn stringify(heap: &Heap, value: Value) -> String {
    let mut out = String::new();
    let mut visiting = Vec::new();
    write_value(heap, value, false, &mut visiting, &mut out);
    out
}

fn write_value(
    heap: &Heap,
    value: Value,
    quote_strings: bool,
    visiting: &mut Vec<Handle>,
    out: &mut String,
) {
    if value.is_null() {
        out.push_str("null");
        return;
    }
    if let Some(b) = value.as_bool() {
        out.push_str(if b { "true" } else { "false" });
        return;
    }
    if let Some(n) = value.as_number() {
        write_number(n, out);
        return;
    }
    let Some(h) = value.as_handle() else {
        out.push_str("<invalid>");
        return;
    };
    if visiting.contains(&h) {
        out.push_str("...");
        return;
    }
    match heap.get(h) {
        ObjData::Str(s) => {
            if quote_strings {
                out.push('"');
                out.push_str(s.as_str());
                out.push('"');
            } else {
                out.push_str(s.as_str());
            }
        }
        ObjData::Array(items) => {
            visiting.push(h);
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(heap, *item, true, visiting, out);
            }
            out.push(']');
            visiting.pop();
        }
        ObjData::Map(map) => {
            visiting.push(h);
            out.push('{');
            for (i, (k, v)) in map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(heap, k, true, visiting, out);
                out.push_str(": ");
                write_value(heap, v, true, visiting, out);
            }
            out.push('}');
            visiting.pop();
        }
        ObjData::Function(f) => {
            out.push_str("fn ");
            out.push_str(f.display_name());
        }
        ObjData::Native(n) => {
            out.push_str("native fn ");
            out.push_str(&n.name);
        }
        ObjData::Error(e) => {
            out.push_str("error: ");
            out.push_str(&e.message);
        }
        ObjData::External(_) => out.push_str("external"),
        ObjData::Free => out.push_str("<freed>"),
    }
}

fn write_number(n: f64, out: &mut String) {
    if n == n.trunc() && n.is_finite() && n.abs() < 1e15 {
        out.push_str(&format!("{}", n as i64));
    } else {
        out.push_str(&format!("{}", n));
    }
}
