//! Host embedding context
//!
//! One `Context` owns a whole interpreter: configuration, heap, error
//! list, global store, persistent compiler state, and the VM. The
//! full pipeline runs through [`Context::execute`]; everything else
//! here is the embedding surface hosts use to register natives, read
//! results, and call script values back.
//!
//! Contexts are single-threaded and share nothing; create one per
//! interpreter you need.

use std::any::Any;
use std::rc::Rc;

use brio_compiler::{Compiler, CompilerState, SymbolKind};
use brio_core::{
    stringify, BrioError, CompiledFile, Config, ErrorList, ErrorObj, ExternalData, GlobalStore,
    Heap, MapKey, NativeApi, NativeFunction, ObjData, Value, ValueKind,
};

use crate::builtins;
use crate::vm::{RunEnv, Vm};

pub struct Context {
    config: Config,
    heap: Heap,
    errors: ErrorList,
    global_store: GlobalStore,
    state: CompilerState,
    vm: Vm,
}

impl Context {
    pub fn new(config: Config) -> Context {
        let mut heap = Heap::new();
        let mut global_store = GlobalStore::new();
        builtins::register_all(&mut global_store, &mut heap);
        Context {
            config,
            heap,
            errors: ErrorList::new(),
            global_store,
            state: CompilerState::new(),
            vm: Vm::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------

    /// Compile and run a source string. Returns the value of the last
    /// popped expression, or null if errors occurred (check
    /// [`Context::has_errors`]). Clears any previous errors first.
    pub fn execute(&mut self, source: &str) -> Value {
        self.execute_named("<input>", source)
    }

    /// Read and execute a file through the configured read hook.
    pub fn execute_file(&mut self, path: &str) -> Value {
        self.errors.clear();
        let source = match self.config.read_file(path) {
            Ok(source) => source,
            Err(message) => {
                self.errors
                    .push(BrioError::compilation(message, brio_core::Pos::invalid()));
                return Value::NULL;
            }
        };
        self.execute_named(path, &source)
    }

    fn execute_named(&mut self, path: &str, source: &str) -> Value {
        self.errors.clear();
        let file = CompiledFile::new(path);
        let main = {
            let mut compiler = Compiler::new(
                &self.config,
                &mut self.heap,
                &self.global_store,
                &mut self.errors,
                &mut self.state,
            );
            compiler.compile(file, source)
        };
        let Some(main) = main else {
            return Value::NULL;
        };
        let main_value = self.heap.alloc(ObjData::Function(main));
        let mut env = RunEnv {
            heap: &mut self.heap,
            errors: &mut self.errors,
            globals: &self.global_store,
            config: &self.config,
            constants: &self.state.constants,
        };
        self.vm.run(&mut env, main_value).unwrap_or(Value::NULL)
    }

    /// Call a script or native function value. This is how hosts (and
    /// native callbacks, via [`NativeApi::call_value`]) re-enter the
    /// VM; it works both between runs and from inside one.
    pub fn call_value(&mut self, callee: Value, args: &[Value]) -> Result<Value, String> {
        let mut env = RunEnv {
            heap: &mut self.heap,
            errors: &mut self.errors,
            globals: &self.global_store,
            config: &self.config,
            constants: &self.state.constants,
        };
        self.vm.call(&mut env, callee, args)
    }

    // ------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------

    pub fn has_errors(&self) -> bool {
        self.errors.has_errors()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn error(&self, ix: usize) -> Option<&BrioError> {
        self.errors.get(ix)
    }

    pub fn errors(&self) -> impl Iterator<Item = &BrioError> {
        self.errors.iter()
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }

    /// Human-readable rendering with the offending source line and a
    /// caret, plus the traceback when one exists.
    pub fn serialize_error(error: &BrioError) -> String {
        let mut out = error.to_string();
        out.push('\n');
        if let (Some(file), true) = (&error.pos.file, error.pos.is_valid()) {
            if let Some(line) = file.line(error.pos.line as usize) {
                out.push_str(&line);
                out.push('\n');
                for _ in 0..error.pos.column.max(0) {
                    out.push(' ');
                }
                out.push_str("^\n");
            }
        }
        if let Some(traceback) = &error.traceback {
            out.push_str(&traceback.to_string());
        }
        out
    }

    /// Machine-readable rendering of an error.
    pub fn error_to_json(error: &BrioError) -> String {
        let traceback: Vec<serde_json::Value> = error
            .traceback
            .iter()
            .flat_map(|tb| tb.entries())
            .map(|entry| {
                serde_json::json!({
                    "function": entry.function_name,
                    "file": entry.pos.file_path(),
                    "line": entry.pos.line + 1,
                    "column": entry.pos.column + 1,
                })
            })
            .collect();
        serde_json::json!({
            "kind": error.kind.name(),
            "message": error.message,
            "file": error.pos.file_path(),
            "line": error.pos.line + 1,
            "column": error.pos.column + 1,
            "traceback": traceback,
        })
        .to_string()
    }

    // ------------------------------------------------------------------
    // Host globals
    // ------------------------------------------------------------------

    /// Register a native function visible to every script as `name`.
    pub fn set_native_function<F>(&mut self, name: &str, func: F)
    where
        F: Fn(&mut dyn NativeApi, &[Value]) -> Result<Value, String> + 'static,
    {
        let value = self.heap.alloc(ObjData::Native(NativeFunction {
            name: name.to_string(),
            func: Rc::new(func),
        }));
        self.global_store.set(name, value);
    }

    pub fn set_global_constant(&mut self, name: &str, value: Value) {
        self.global_store.set(name, value);
    }

    /// Look up a top-level script definition by name, falling back to
    /// host globals.
    pub fn get_object(&self, name: &str) -> Value {
        if let Some(symbol) = self.state.global_symbol(name) {
            if symbol.kind == SymbolKind::ModuleGlobal {
                return self.vm.module_global(symbol.index);
            }
        }
        self.global_store.get_by_name(name).unwrap_or(Value::NULL)
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    pub fn make_string(&mut self, s: &str) -> Value {
        self.heap.alloc_string(s)
    }

    pub fn make_array(&mut self, items: &[Value]) -> Value {
        self.heap.alloc(ObjData::Array(items.to_vec()))
    }

    pub fn make_map(&mut self) -> Value {
        self.heap.alloc(ObjData::Map(Default::default()))
    }

    pub fn make_error(&mut self, message: &str) -> Value {
        self.heap.alloc(ObjData::Error(ErrorObj {
            message: message.to_string(),
            traceback: None,
        }))
    }

    /// Wrap opaque host data as a value. `copy_fn` is used by
    /// `deep_copy`; without one, copies share the data.
    pub fn make_external(
        &mut self,
        data: Rc<dyn Any>,
        copy_fn: Option<Rc<dyn Fn(&dyn Any) -> Rc<dyn Any>>>,
    ) -> Value {
        self.heap
            .alloc(ObjData::External(ExternalData { data, copy_fn }))
    }

    pub fn external_of(&self, value: Value) -> Option<Rc<dyn Any>> {
        match self.heap.get(value.as_handle()?) {
            ObjData::External(e) => Some(Rc::clone(&e.data)),
            _ => None,
        }
    }

    pub fn kind_of(&self, value: Value) -> ValueKind {
        self.heap.kind_of(value)
    }

    pub fn length(&self, value: Value) -> Option<usize> {
        match self.heap.kind_of(value) {
            ValueKind::Array => self.heap.array(value).map(|a| a.len()),
            ValueKind::Map => self.heap.map(value).map(|m| m.len()),
            ValueKind::Str => self.heap.str_value(value).map(|s| s.len()),
            _ => None,
        }
    }

    pub fn string_of(&self, value: Value) -> Option<String> {
        self.heap.str_value(value).map(|s| s.as_str().to_string())
    }

    pub fn stringify(&self, value: Value) -> String {
        stringify(&self.heap, value)
    }

    pub fn array_push(&mut self, array: Value, value: Value) -> bool {
        match self.heap.array_mut(array) {
            Some(items) => {
                items.push(value);
                true
            }
            None => false,
        }
    }

    pub fn array_get(&self, array: Value, ix: usize) -> Value {
        self.heap
            .array(array)
            .and_then(|items| items.get(ix).copied())
            .unwrap_or(Value::NULL)
    }

    pub fn array_set(&mut self, array: Value, ix: usize, value: Value) -> bool {
        match self.heap.array_mut(array) {
            Some(items) if ix < items.len() => {
                items[ix] = value;
                true
            }
            _ => false,
        }
    }

    pub fn map_get(&self, map: Value, key: &str) -> Value {
        self.heap
            .map(map)
            .and_then(|m| m.get(&MapKey::from_str(key)))
            .unwrap_or(Value::NULL)
    }

    pub fn map_set(&mut self, map: Value, key: &str, value: Value) -> bool {
        let key_value = self.heap.alloc_string(key);
        match self.heap.map_mut(map) {
            Some(m) => {
                m.insert(MapKey::from_str(key), key_value, value);
                true
            }
            None => false,
        }
    }

    /// Keep a value alive across VM operations that do not reference
    /// it from any stack.
    pub fn pin(&mut self, value: Value) {
        self.heap.pin(value);
    }

    pub fn unpin(&mut self, value: Value) {
        self.heap.unpin(value);
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn stack_pointer(&self) -> usize {
        self.vm.sp()
    }

    pub fn frame_count(&self) -> usize {
        self.vm.frames_count()
    }

    pub fn live_objects(&self) -> usize {
        self.heap.live_count()
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new(Config::default())
    }
}
