//! Virtual machine
//!
//! A stack machine over the compiled bytecode. Three stacks: values,
//! call frames, and the "this" stack holding map literals under
//! construction. Errors never unwind through Rust: an opcode handler
//! pushes a positioned error onto the shared list and returns, and
//! the dispatch loop either transfers control to the innermost
//! `recover` handler or halts with the stacks restored.

use std::rc::Rc;
use std::time::Instant;

use tracing::{debug, trace};

use brio_core::opcode::read_operand;
use brio_core::{
    BrioError, BrioString, Config, ErrorKind, ErrorList, ErrorObj, GlobalStore, Heap, MapKey,
    ObjData, Opcode, Pos, ScriptFunction, Traceback, Value, ValueKind,
};

use crate::frame::Frame;

pub const STACK_SIZE: usize = 2048;
pub const FRAMES_SIZE: usize = 2048;
pub const GLOBALS_SIZE: usize = 2048;

/// How many instructions run between wall-clock checks of the
/// execution budget.
const TIME_CHECK_INTERVAL: u64 = 1000;

/// Everything the VM borrows from the context for the duration of one
/// run.
pub struct RunEnv<'a> {
    pub heap: &'a mut Heap,
    pub errors: &'a mut ErrorList,
    pub globals: &'a GlobalStore,
    pub config: &'a Config,
    pub constants: &'a [Value],
}

pub struct Vm {
    stack: Vec<Value>,
    sp: usize,
    this_stack: Vec<Value>,
    frames: Vec<Frame>,
    globals: Vec<Value>,
    last_popped: Value,
    running: bool,
    start_time: Option<Instant>,
    op_count: u64,
}

type OpResult = Result<(), ()>;

impl Vm {
    pub fn new() -> Vm {
        Vm {
            stack: vec![Value::NULL; STACK_SIZE],
            sp: 0,
            this_stack: Vec::new(),
            frames: Vec::new(),
            globals: vec![Value::NULL; GLOBALS_SIZE],
            last_popped: Value::NULL,
            running: false,
            start_time: None,
            op_count: 0,
        }
    }

    pub fn sp(&self) -> usize {
        self.sp
    }

    pub fn frames_count(&self) -> usize {
        self.frames.len()
    }

    pub fn last_popped(&self) -> Value {
        self.last_popped
    }

    pub fn module_global(&self, ix: usize) -> Value {
        self.globals.get(ix).copied().unwrap_or(Value::NULL)
    }

    /// Run a compiled top-level function to completion. Returns the
    /// last popped value on success, `None` with errors in the list
    /// otherwise. Fails immediately if a run is already active;
    /// native callbacks re-enter through [`Vm::call`] instead.
    pub fn run(&mut self, env: &mut RunEnv, function: Value) -> Option<Value> {
        if self.running {
            env.errors
                .push(BrioError::runtime("VM is already running", Pos::invalid()));
            return None;
        }
        let (block, num_locals) = match function.as_handle().map(|h| env.heap.get(h)) {
            Some(ObjData::Function(f)) => (Rc::clone(&f.block), f.num_locals),
            _ => {
                env.errors
                    .push(BrioError::runtime("value is not a function", Pos::invalid()));
                return None;
            }
        };

        self.running = true;
        self.start_time = Some(Instant::now());
        self.op_count = 0;
        let entry_sp = self.sp;
        let min_frames = self.frames.len();

        let result = if entry_sp + num_locals > STACK_SIZE {
            env.errors
                .push(BrioError::runtime("stack overflow", Pos::invalid()));
            Err(())
        } else {
            self.frames.push(Frame::new(function, block, entry_sp));
            for slot in &mut self.stack[entry_sp..entry_sp + num_locals] {
                *slot = Value::NULL;
            }
            self.sp = entry_sp + num_locals;
            self.execute_until(env, min_frames)
        };

        self.running = false;
        match result {
            Ok(()) => Some(self.last_popped),
            Err(()) => {
                self.sp = entry_sp;
                self.frames.truncate(min_frames);
                self.this_stack.clear();
                None
            }
        }
    }

    /// Call a function value with arguments, re-entering the dispatch
    /// loop for script functions. This is the path native callbacks
    /// and hosts use; it pushes frames instead of taking the
    /// `running` latch.
    pub fn call(&mut self, env: &mut RunEnv, callee: Value, args: &[Value]) -> Result<Value, String> {
        let min_frames = self.frames.len();
        if self.push(env, callee).is_err() {
            return Err(self.take_error_message(env));
        }
        for arg in args {
            if self.push(env, *arg).is_err() {
                return Err(self.take_error_message(env));
            }
        }
        if self.call_function(env, args.len()).is_err() {
            return Err(self.take_error_message(env));
        }
        if self.frames.len() > min_frames {
            if self.execute_until(env, min_frames).is_err() {
                return Err(self.take_error_message(env));
            }
        }
        Ok(self.pop())
    }

    fn take_error_message(&self, env: &RunEnv) -> String {
        env.errors
            .iter()
            .last()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "call failed".to_string())
    }

    // ------------------------------------------------------------------
    // Dispatch loop
    // ------------------------------------------------------------------

    fn execute_until(&mut self, env: &mut RunEnv, min_frames: usize) -> OpResult {
        loop {
            if self.frames.len() <= min_frames {
                return Ok(());
            }

            let fetched = {
                let frame = self.frames.last_mut().expect("active frame");
                if frame.ip >= frame.block.bytecode.len() {
                    None
                } else {
                    frame.src_ip = frame.ip;
                    let byte = frame.block.bytecode[frame.ip];
                    frame.ip += 1;
                    Some(byte)
                }
            };
            let Some(byte) = fetched else {
                // The top-level block has no trailing return; falling
                // off its end finishes the run.
                let frame = self.frames.pop().expect("active frame");
                self.sp = frame.base_pointer;
                continue;
            };

            let failed = match Opcode::from_u8(byte) {
                Some(op) => self.execute_op(env, op).is_err(),
                None => {
                    self.runtime_error(env, format!("invalid opcode {:#04x}", byte));
                    true
                }
            };

            if failed || env.errors.has_errors() {
                if !self.try_recover(env, min_frames) {
                    self.frames.truncate(min_frames);
                    return Err(());
                }
            }

            self.op_count += 1;
            if self.op_count % TIME_CHECK_INTERVAL == 0 {
                if let (Some(budget), Some(start)) =
                    (env.config.max_execution_time, self.start_time)
                {
                    if start.elapsed() > budget {
                        debug!(ops = self.op_count, "execution budget exceeded");
                        env.errors.push(BrioError::timeout(
                            "execution timed out",
                            self.current_pos(),
                        ));
                        self.frames.truncate(min_frames);
                        return Err(());
                    }
                }
            }

            if env.heap.should_collect() {
                self.collect_garbage(env);
            }
        }
    }

    fn execute_op(&mut self, env: &mut RunEnv, op: Opcode) -> OpResult {
        match op {
            Opcode::Constant => {
                let ix = self.read_operand_usize(2);
                match env.constants.get(ix).copied() {
                    Some(v) => self.push(env, v),
                    None => {
                        self.runtime_error(env, format!("constant {} out of range", ix));
                        Err(())
                    }
                }
            }
            Opcode::Number => {
                let bits = self.read_operand_u64(8);
                self.push(env, Value::number(f64::from_bits(bits)))
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Or
            | Opcode::Xor
            | Opcode::And
            | Opcode::Lshift
            | Opcode::Rshift => self.binary_op(env, op),
            Opcode::Pop => {
                self.pop();
                Ok(())
            }
            Opcode::Dup => {
                if self.sp == 0 {
                    self.runtime_error(env, "stack underflow");
                    return Err(());
                }
                let top = self.stack[self.sp - 1];
                self.push(env, top)
            }
            Opcode::True => self.push(env, Value::TRUE),
            Opcode::False => self.push(env, Value::FALSE),
            Opcode::Null => self.push(env, Value::NULL),
            Opcode::Compare | Opcode::CompareEq => {
                let right = self.pop();
                let left = self.pop();
                if op == Opcode::Compare {
                    if self.try_overload_binary(env, Opcode::Compare, left, right)? {
                        return Ok(());
                    }
                }
                match compare_values(env.heap, left, right, op == Opcode::CompareEq) {
                    Ok(d) => self.push(env, Value::number(d)),
                    Err(message) => {
                        self.runtime_error(env, message);
                        Err(())
                    }
                }
            }
            Opcode::Equal => self.comparison_result(env, |d| d == 0.0),
            Opcode::NotEqual => self.comparison_result(env, |d| d != 0.0),
            Opcode::GreaterThan => self.comparison_result(env, |d| d > 0.0),
            Opcode::GreaterThanEqual => self.comparison_result(env, |d| d >= 0.0),
            Opcode::Minus => {
                let operand = self.pop();
                if let Some(n) = operand.as_numeric() {
                    return self.push(env, Value::number(-n));
                }
                if self.try_overload_unary(env, Opcode::Minus, operand)? {
                    return Ok(());
                }
                self.runtime_error(
                    env,
                    format!("invalid operand for '-': {}", env.heap.kind_of(operand).name()),
                );
                Err(())
            }
            Opcode::Bang => {
                let operand = self.pop();
                if let Some(b) = operand.as_bool() {
                    return self.push(env, Value::boolean(!b));
                }
                if operand.is_null() {
                    return self.push(env, Value::TRUE);
                }
                if self.try_overload_unary(env, Opcode::Bang, operand)? {
                    return Ok(());
                }
                // Same truthiness the conditional jumps use, so !x and
                // `if (x)` always agree.
                self.push(env, Value::boolean(!operand.is_truthy()))
            }
            Opcode::Jump => {
                let target = self.read_operand_usize(2);
                self.frames.last_mut().expect("active frame").ip = target;
                Ok(())
            }
            Opcode::JumpIfFalse => {
                let target = self.read_operand_usize(2);
                let condition = self.pop();
                if !condition.is_truthy() {
                    self.frames.last_mut().expect("active frame").ip = target;
                }
                Ok(())
            }
            Opcode::JumpIfTrue => {
                let target = self.read_operand_usize(2);
                let condition = self.pop();
                if condition.is_truthy() {
                    self.frames.last_mut().expect("active frame").ip = target;
                }
                Ok(())
            }
            Opcode::GetModuleGlobal => {
                let ix = self.read_operand_usize(2);
                let value = self.globals.get(ix).copied().unwrap_or(Value::NULL);
                self.push(env, value)
            }
            Opcode::SetModuleGlobal | Opcode::DefineModuleGlobal => {
                let ix = self.read_operand_usize(2);
                let value = self.pop();
                if ix >= GLOBALS_SIZE {
                    self.runtime_error(env, format!("module global {} out of range", ix));
                    return Err(());
                }
                self.globals[ix] = value;
                Ok(())
            }
            Opcode::Array => {
                let count = self.read_operand_usize(2);
                let base = self.sp - count;
                let mut buf = env.heap.take_array_buffer();
                buf.extend_from_slice(&self.stack[base..self.sp]);
                self.sp = base;
                let value = env.heap.alloc(ObjData::Array(buf));
                self.push(env, value)
            }
            Opcode::MapStart => {
                let _count = self.read_operand_usize(2);
                let buf = env.heap.take_map_buffer();
                let value = env.heap.alloc(ObjData::Map(buf));
                self.this_stack.push(value);
                Ok(())
            }
            Opcode::MapEnd => {
                let count = self.read_operand_usize(2);
                let Some(map_value) = self.this_stack.pop() else {
                    self.runtime_error(env, "map construction underflow");
                    return Err(());
                };
                let base = self.sp - count * 2;
                for i in 0..count {
                    let key = self.stack[base + 2 * i];
                    let value = self.stack[base + 2 * i + 1];
                    let Some(map_key) = MapKey::from_value(env.heap, key) else {
                        self.runtime_error(
                            env,
                            format!("type {} cannot be a map key", env.heap.kind_of(key).name()),
                        );
                        return Err(());
                    };
                    if let Some(map) = env.heap.map_mut(map_value) {
                        map.insert(map_key, key, value);
                    }
                }
                self.sp = base;
                self.push(env, map_value)
            }
            Opcode::GetThis => {
                let value = self.this_stack.last().copied().unwrap_or(Value::NULL);
                self.push(env, value)
            }
            Opcode::GetIndex => {
                let index = self.pop();
                let left = self.pop();
                match get_index(env.heap, left, index) {
                    Ok(value) => self.push(env, value),
                    Err(message) => {
                        self.runtime_error(env, message);
                        Err(())
                    }
                }
            }
            Opcode::SetIndex => {
                let index = self.pop();
                let base = self.pop();
                let value = self.pop();
                match set_index(env.heap, base, index, value) {
                    Ok(()) => Ok(()),
                    Err(message) => {
                        self.runtime_error(env, message);
                        Err(())
                    }
                }
            }
            Opcode::GetValueAt => {
                let index = self.pop();
                let source = self.pop();
                match get_value_at(env.heap, source, index) {
                    Ok(value) => self.push(env, value),
                    Err(message) => {
                        self.runtime_error(env, message);
                        Err(())
                    }
                }
            }
            Opcode::Len => {
                let value = self.pop();
                match len_of(env.heap, value) {
                    Some(n) => self.push(env, Value::number(n as f64)),
                    None => {
                        self.runtime_error(
                            env,
                            format!("cannot get length of {}", env.heap.kind_of(value).name()),
                        );
                        Err(())
                    }
                }
            }
            Opcode::Call => {
                let argc = self.read_operand_usize(1);
                self.call_function(env, argc)
            }
            Opcode::Return => {
                let frame = self.frames.pop().expect("active frame");
                self.sp = frame.base_pointer - 1;
                self.push(env, Value::NULL)
            }
            Opcode::ReturnValue => {
                let value = self.pop();
                let frame = self.frames.pop().expect("active frame");
                self.sp = frame.base_pointer - 1;
                self.push(env, value)
            }
            Opcode::GetLocal => {
                let ix = self.read_operand_usize(1);
                let bp = self.frames.last().expect("active frame").base_pointer;
                let value = self.stack[bp + ix];
                self.push(env, value)
            }
            Opcode::DefineLocal | Opcode::SetLocal => {
                let ix = self.read_operand_usize(1);
                let value = self.pop();
                let bp = self.frames.last().expect("active frame").base_pointer;
                self.stack[bp + ix] = value;
                Ok(())
            }
            Opcode::GetFree => {
                let ix = self.read_operand_usize(1);
                let function = self.frames.last().expect("active frame").function;
                let value = match function.as_handle().map(|h| env.heap.get(h)) {
                    Some(ObjData::Function(f)) => f.free_vals.get(ix).copied(),
                    _ => None,
                };
                match value {
                    Some(v) => self.push(env, v),
                    None => {
                        self.runtime_error(env, format!("free variable {} out of range", ix));
                        Err(())
                    }
                }
            }
            Opcode::SetFree => {
                let ix = self.read_operand_usize(1);
                let value = self.pop();
                let function = self.frames.last().expect("active frame").function;
                let slot = function.as_handle().map(|h| env.heap.get_mut(h));
                match slot {
                    Some(ObjData::Function(f)) if ix < f.free_vals.len() => {
                        f.free_vals[ix] = value;
                        Ok(())
                    }
                    _ => {
                        self.runtime_error(env, format!("free variable {} out of range", ix));
                        Err(())
                    }
                }
            }
            Opcode::CurrentFunction => {
                let function = self.frames.last().expect("active frame").function;
                self.push(env, function)
            }
            Opcode::Function => {
                let pool_ix = self.read_operand_usize(2);
                let free_count = self.read_operand_usize(1);
                let prototype = env
                    .constants
                    .get(pool_ix)
                    .and_then(|v| v.as_handle())
                    .map(|h| env.heap.get(h));
                let (block, name, num_locals, num_args) = match prototype {
                    Some(ObjData::Function(f)) => (
                        Rc::clone(&f.block),
                        f.name.clone(),
                        f.num_locals,
                        f.num_args,
                    ),
                    _ => {
                        self.runtime_error(env, format!("constant {} is not a function", pool_ix));
                        return Err(());
                    }
                };
                let base = self.sp - free_count;
                let free_vals = self.stack[base..self.sp].to_vec();
                self.sp = base;
                let value = env.heap.alloc(ObjData::Function(ScriptFunction {
                    block,
                    name,
                    num_locals,
                    num_args,
                    free_vals,
                }));
                self.push(env, value)
            }
            Opcode::GetHostGlobal => {
                let ix = self.read_operand_usize(2);
                match env.globals.get(ix) {
                    Some(value) => self.push(env, value),
                    None => {
                        self.runtime_error(env, format!("host global {} out of range", ix));
                        Err(())
                    }
                }
            }
            Opcode::SetRecover => {
                let target = self.read_operand_usize(2);
                self.frames.last_mut().expect("active frame").recover_ip = target as i64;
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn call_function(&mut self, env: &mut RunEnv, argc: usize) -> OpResult {
        let callee = self.stack[self.sp - 1 - argc];
        let kind = env.heap.kind_of(callee);
        match kind {
            ValueKind::Function => {
                let (block, num_locals, num_args, name) = {
                    let Some(ObjData::Function(f)) = callee.as_handle().map(|h| env.heap.get(h))
                    else {
                        unreachable!("kind checked above");
                    };
                    (
                        Rc::clone(&f.block),
                        f.num_locals,
                        f.num_args,
                        f.display_name().to_string(),
                    )
                };
                if argc != num_args {
                    self.runtime_error(
                        env,
                        format!(
                            "invalid number of arguments to {}: expected {}, got {}",
                            name, num_args, argc
                        ),
                    );
                    return Err(());
                }
                if self.frames.len() >= FRAMES_SIZE {
                    self.runtime_error(env, "call stack overflow");
                    return Err(());
                }
                let base = self.sp - argc;
                if base + num_locals > STACK_SIZE {
                    self.runtime_error(env, "stack overflow");
                    return Err(());
                }
                self.frames.push(Frame::new(callee, block, base));
                for slot in &mut self.stack[self.sp..base + num_locals] {
                    *slot = Value::NULL;
                }
                self.sp = base + num_locals;
                Ok(())
            }
            ValueKind::Native => {
                let (func, _name) = {
                    let Some(ObjData::Native(n)) = callee.as_handle().map(|h| env.heap.get(h))
                    else {
                        unreachable!("kind checked above");
                    };
                    (Rc::clone(&n.func), n.name.clone())
                };
                let args = self.stack[self.sp - argc..self.sp].to_vec();
                let result = {
                    let mut api = VmNativeApi {
                        vm: &mut *self,
                        env: &mut *env,
                    };
                    func(&mut api, &args)
                };
                match result {
                    Ok(value) => {
                        self.sp = self.sp - argc - 1;
                        self.push(env, value)
                    }
                    Err(message) => {
                        env.errors
                            .push(BrioError::user(message, self.current_pos()));
                        Err(())
                    }
                }
            }
            other => {
                self.runtime_error(env, format!("{} is not callable", other.name()));
                Err(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Operator overloading
    // ------------------------------------------------------------------

    fn try_overload_binary(
        &mut self,
        env: &mut RunEnv,
        op: Opcode,
        left: Value,
        right: Value,
    ) -> Result<bool, ()> {
        let Some(key) = overload_key(op) else {
            return Ok(false);
        };
        let Some(callee) = lookup_overload(env.heap, left, key)
            .or_else(|| lookup_overload(env.heap, right, key))
        else {
            return Ok(false);
        };
        self.push(env, callee)?;
        self.push(env, left)?;
        self.push(env, right)?;
        self.call_function(env, 2)?;
        Ok(true)
    }

    fn try_overload_unary(
        &mut self,
        env: &mut RunEnv,
        op: Opcode,
        operand: Value,
    ) -> Result<bool, ()> {
        let Some(key) = overload_key(op) else {
            return Ok(false);
        };
        let Some(callee) = lookup_overload(env.heap, operand, key) else {
            return Ok(false);
        };
        self.push(env, callee)?;
        self.push(env, operand)?;
        self.call_function(env, 1)?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Arithmetic
    // ------------------------------------------------------------------

    fn binary_op(&mut self, env: &mut RunEnv, op: Opcode) -> OpResult {
        let right = self.pop();
        let left = self.pop();

        if let (Some(l), Some(r)) = (left.as_numeric(), right.as_numeric()) {
            let result = match op {
                Opcode::Add => l + r,
                Opcode::Sub => l - r,
                Opcode::Mul => l * r,
                Opcode::Div => l / r,
                Opcode::Mod => l % r,
                Opcode::Or => ((l as i64) | (r as i64)) as f64,
                Opcode::Xor => ((l as i64) ^ (r as i64)) as f64,
                Opcode::And => ((l as i64) & (r as i64)) as f64,
                Opcode::Lshift => (((l as i64) << ((r as i64) & 63)) as f64),
                Opcode::Rshift => (((l as i64) >> ((r as i64) & 63)) as f64),
                _ => unreachable!("not an arithmetic opcode"),
            };
            return self.push(env, Value::number(result));
        }

        if op == Opcode::Add {
            let concat = match (env.heap.str_value(left), env.heap.str_value(right)) {
                (Some(l), Some(r)) => Some(BrioString::concat(l.as_str(), r.as_str())),
                _ => None,
            };
            if let Some(s) = concat {
                let value = env.heap.alloc(ObjData::Str(s));
                return self.push(env, value);
            }
            // Array on the left: append in place.
            if env.heap.array(left).is_some() {
                if let Some(items) = env.heap.array_mut(left) {
                    items.push(right);
                }
                return self.push(env, left);
            }
        }

        if self.try_overload_binary(env, op, left, right)? {
            return Ok(());
        }

        self.runtime_error(
            env,
            format!(
                "invalid operands for '{}': {} and {}",
                op.def().name,
                env.heap.kind_of(left).name(),
                env.heap.kind_of(right).name()
            ),
        );
        Err(())
    }

    fn comparison_result(&mut self, env: &mut RunEnv, test: fn(f64) -> bool) -> OpResult {
        let diff = self.pop().as_number().unwrap_or(1.0);
        self.push(env, Value::boolean(test(diff)))
    }

    // ------------------------------------------------------------------
    // Recover
    // ------------------------------------------------------------------

    /// Transfer control to the innermost armed `recover` handler, if
    /// any frame above `min_frames` has one. Timeout and allocation
    /// errors are not recoverable.
    fn try_recover(&mut self, env: &mut RunEnv, min_frames: usize) -> bool {
        let recoverable = env
            .errors
            .get(0)
            .map(|e| matches!(e.kind, ErrorKind::Runtime | ErrorKind::User))
            .unwrap_or(false);
        if !recoverable {
            return false;
        }
        let target = self
            .frames
            .iter()
            .enumerate()
            .rev()
            .find(|(i, f)| *i >= min_frames && f.recover_ip >= 0 && !f.is_recovering)
            .map(|(i, _)| i);
        let Some(target) = target else {
            return false;
        };

        // Traceback of the frames as they stood when the error fired.
        let mut current = Traceback::new();
        for frame in self.frames.iter().rev() {
            let name = match frame.function.as_handle().map(|h| env.heap.get(h)) {
                Some(ObjData::Function(f)) => f.display_name().to_string(),
                _ => String::new(),
            };
            current.push(&name, frame.current_pos());
        }

        self.frames.truncate(target + 1);
        let num_locals = {
            let frame = &self.frames[target];
            match frame.function.as_handle().map(|h| env.heap.get(h)) {
                Some(ObjData::Function(f)) => f.num_locals,
                _ => 0,
            }
        };
        let frame = &mut self.frames[target];
        frame.is_recovering = true;
        frame.ip = frame.recover_ip as usize;
        self.sp = frame.base_pointer + num_locals;

        let mut errors = env.errors.take();
        let first = errors.remove(0);
        let mut traceback = first.traceback.unwrap_or_default();
        traceback.append(&current);
        trace!(message = %first.message, "recovering from error");

        let error_value = env.heap.alloc(ObjData::Error(ErrorObj {
            message: first.message,
            traceback: Some(traceback),
        }));
        self.push(env, error_value).is_ok()
    }

    // ------------------------------------------------------------------
    // Stack and operand plumbing
    // ------------------------------------------------------------------

    fn push(&mut self, env: &mut RunEnv, value: Value) -> OpResult {
        if self.sp >= STACK_SIZE {
            self.runtime_error(env, "stack overflow");
            return Err(());
        }
        self.stack[self.sp] = value;
        self.sp += 1;
        Ok(())
    }

    fn pop(&mut self) -> Value {
        if self.sp == 0 {
            return Value::NULL;
        }
        self.sp -= 1;
        let value = self.stack[self.sp];
        self.last_popped = value;
        value
    }

    fn read_operand_usize(&mut self, width: usize) -> usize {
        self.read_operand_u64(width) as usize
    }

    fn read_operand_u64(&mut self, width: usize) -> u64 {
        let frame = self.frames.last_mut().expect("active frame");
        let value = read_operand(&frame.block.bytecode, frame.ip, width);
        frame.ip += width;
        value
    }

    fn current_pos(&self) -> Pos {
        self.frames
            .last()
            .map(|f| f.current_pos())
            .unwrap_or_else(Pos::invalid)
    }

    fn runtime_error(&self, env: &mut RunEnv, message: impl Into<String>) {
        env.errors
            .push(BrioError::runtime(message, self.current_pos()));
    }

    // ------------------------------------------------------------------
    // GC
    // ------------------------------------------------------------------

    fn collect_garbage(&self, env: &mut RunEnv) {
        let mut roots: Vec<Value> = Vec::with_capacity(
            env.constants.len() + env.globals.len() + GLOBALS_SIZE + self.sp + 8,
        );
        roots.extend_from_slice(env.constants);
        roots.extend_from_slice(env.globals.values());
        roots.extend_from_slice(&self.globals);
        roots.extend_from_slice(&self.stack[..self.sp]);
        roots.extend_from_slice(&self.this_stack);
        roots.extend(self.frames.iter().map(|f| f.function));
        roots.push(self.last_popped);
        env.heap.collect(&roots);
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

/// Native callbacks see the VM through this adapter.
struct VmNativeApi<'a, 'b> {
    vm: &'a mut Vm,
    env: &'a mut RunEnv<'b>,
}

impl brio_core::NativeApi for VmNativeApi<'_, '_> {
    fn heap(&mut self) -> &mut Heap {
        &mut *self.env.heap
    }

    fn call_value(&mut self, callee: Value, args: &[Value]) -> Result<Value, String> {
        self.vm.call(self.env, callee, args)
    }

    fn stdout_write(&mut self, bytes: &[u8]) -> usize {
        self.env.config.write_stdout(bytes)
    }

    fn file_read(&mut self, path: &str) -> Result<String, String> {
        self.env.config.read_file(path)
    }

    fn file_write(&mut self, path: &str, data: &[u8]) -> Result<usize, String> {
        self.env.config.write_file(path, data)
    }
}

// ----------------------------------------------------------------------
// Value semantics helpers
// ----------------------------------------------------------------------

fn overload_key(op: Opcode) -> Option<&'static str> {
    Some(match op {
        Opcode::Add => "__operator_add__",
        Opcode::Sub => "__operator_sub__",
        Opcode::Mul => "__operator_mul__",
        Opcode::Div => "__operator_div__",
        Opcode::Mod => "__operator_mod__",
        Opcode::Or => "__operator_or__",
        Opcode::Xor => "__operator_xor__",
        Opcode::And => "__operator_and__",
        Opcode::Lshift => "__operator_lshift__",
        Opcode::Rshift => "__operator_rshift__",
        Opcode::Compare => "__cmp__",
        Opcode::Minus => "__operator_minus__",
        Opcode::Bang => "__operator_bang__",
        _ => return None,
    })
}

fn lookup_overload(heap: &Heap, value: Value, key: &str) -> Option<Value> {
    let map = heap.map(value)?;
    let candidate = map.get(&MapKey::from_str(key))?;
    match heap.kind_of(candidate) {
        ValueKind::Function | ValueKind::Native => Some(candidate),
        _ => None,
    }
}

/// Three-way comparison as a double. `loose` is the `compare_eq`
/// behavior: values of different types are simply unequal.
fn compare_values(heap: &Heap, left: Value, right: Value, loose: bool) -> Result<f64, String> {
    if let (Some(l), Some(r)) = (left.as_numeric(), right.as_numeric()) {
        return Ok(l - r);
    }
    if left.is_null() && right.is_null() {
        return Ok(0.0);
    }
    if let (Some(l), Some(r)) = (heap.str_value(left), heap.str_value(right)) {
        if l.len() != r.len() {
            return Ok(l.len() as f64 - r.len() as f64);
        }
        if l.hash() != r.hash() {
            return Ok(if l.hash() < r.hash() { -1.0 } else { 1.0 });
        }
        return Ok(match l.as_str().cmp(r.as_str()) {
            std::cmp::Ordering::Less => -1.0,
            std::cmp::Ordering::Equal => 0.0,
            std::cmp::Ordering::Greater => 1.0,
        });
    }
    if let (Some(l), Some(r)) = (left.as_handle(), right.as_handle()) {
        return Ok(if l == r {
            0.0
        } else if l.index() < r.index() {
            -1.0
        } else {
            1.0
        });
    }
    if loose {
        return Ok(1.0);
    }
    Err(format!(
        "cannot compare {} and {}",
        heap.kind_of(left).name(),
        heap.kind_of(right).name()
    ))
}

fn get_index(heap: &mut Heap, left: Value, index: Value) -> Result<Value, String> {
    match heap.kind_of(left) {
        ValueKind::Array => {
            let Some(n) = index.as_number() else {
                return Err(format!(
                    "array index must be a number, got {}",
                    heap.kind_of(index).name()
                ));
            };
            let items = heap.array(left).expect("kind checked");
            Ok(array_element(items, n).unwrap_or(Value::NULL))
        }
        ValueKind::Map => {
            let Some(key) = MapKey::from_value(heap, index) else {
                return Err(format!(
                    "type {} cannot be a map key",
                    heap.kind_of(index).name()
                ));
            };
            let map = heap.map(left).expect("kind checked");
            Ok(map.get(&key).unwrap_or(Value::NULL))
        }
        ValueKind::Str => {
            let Some(n) = index.as_number() else {
                return Err(format!(
                    "string index must be a number, got {}",
                    heap.kind_of(index).name()
                ));
            };
            let ch = {
                let s = heap.str_value(left).expect("kind checked");
                let bytes = s.as_str().as_bytes();
                wrap_index(n, bytes.len()).map(|ix| bytes[ix])
            };
            match ch {
                Some(byte) => {
                    let s = String::from_utf8_lossy(&[byte]).into_owned();
                    Ok(heap.alloc_string(&s))
                }
                None => Ok(Value::NULL),
            }
        }
        ValueKind::Error => {
            // Error values expose their parts by string key.
            let key = heap.str_value(index).map(|s| s.as_str().to_string());
            let Some(h) = left.as_handle() else {
                return Ok(Value::NULL);
            };
            let (message, traceback) = match heap.get(h) {
                ObjData::Error(e) => (e.message.clone(), e.traceback.clone()),
                _ => return Ok(Value::NULL),
            };
            match key.as_deref() {
                Some("message") => Ok(heap.alloc_string(&message)),
                Some("traceback") => match traceback {
                    Some(tb) => Ok(heap.alloc_string(&tb.to_string())),
                    None => Ok(Value::NULL),
                },
                _ => Ok(Value::NULL),
            }
        }
        other => Err(format!("type {} is not indexable", other.name())),
    }
}

fn set_index(heap: &mut Heap, base: Value, index: Value, value: Value) -> Result<(), String> {
    match heap.kind_of(base) {
        ValueKind::Array => {
            let Some(n) = index.as_number() else {
                return Err(format!(
                    "array index must be a number, got {}",
                    heap.kind_of(index).name()
                ));
            };
            let len = heap.array(base).expect("kind checked").len();
            let Some(ix) = wrap_index(n, len) else {
                return Err(format!("array index {} out of range", n));
            };
            heap.array_mut(base).expect("kind checked")[ix] = value;
            Ok(())
        }
        ValueKind::Map => {
            let Some(key) = MapKey::from_value(heap, index) else {
                return Err(format!(
                    "type {} cannot be a map key",
                    heap.kind_of(index).name()
                ));
            };
            heap.map_mut(base)
                .expect("kind checked")
                .insert(key, index, value);
            Ok(())
        }
        other => Err(format!(
            "type {} does not support index assignment",
            other.name()
        )),
    }
}

fn get_value_at(heap: &mut Heap, source: Value, index: Value) -> Result<Value, String> {
    let Some(n) = index.as_number() else {
        return Err("iteration index must be a number".to_string());
    };
    let ix = n as i64;
    if ix < 0 {
        return Ok(Value::NULL);
    }
    let ix = ix as usize;
    match heap.kind_of(source) {
        ValueKind::Array => Ok(heap
            .array(source)
            .expect("kind checked")
            .get(ix)
            .copied()
            .unwrap_or(Value::NULL)),
        ValueKind::Map => Ok(heap
            .map(source)
            .expect("kind checked")
            .key_at(ix)
            .unwrap_or(Value::NULL)),
        ValueKind::Str => {
            let byte = {
                let s = heap.str_value(source).expect("kind checked");
                s.as_str().as_bytes().get(ix).copied()
            };
            match byte {
                Some(b) => {
                    let s = String::from_utf8_lossy(&[b]).into_owned();
                    Ok(heap.alloc_string(&s))
                }
                None => Ok(Value::NULL),
            }
        }
        other => Err(format!("cannot iterate over {}", other.name())),
    }
}

fn len_of(heap: &Heap, value: Value) -> Option<usize> {
    match heap.kind_of(value) {
        ValueKind::Array => heap.array(value).map(|a| a.len()),
        ValueKind::Map => heap.map(value).map(|m| m.len()),
        ValueKind::Str => heap.str_value(value).map(|s| s.len()),
        _ => None,
    }
}

/// Negative indices wrap once from the end; anything still out of
/// range is `None`.
fn array_element(items: &[Value], n: f64) -> Option<Value> {
    wrap_index(n, items.len()).map(|ix| items[ix])
}

fn wrap_index(n: f64, len: usize) -> Option<usize> {
    let mut ix = n as i64;
    if ix < 0 {
        ix += len as i64;
    }
    if ix < 0 || ix >= len as i64 {
        None
    } else {
        Some(ix as usize)
    }
}
