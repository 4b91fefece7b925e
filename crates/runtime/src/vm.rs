//! The bytecode dispatch loop.
//!
//! One [`Vm`] owns one [`Heap`] for its whole lifetime (§5: single-threaded,
//! single owner). `run` executes a freshly compiled program from its
//! synthetic top-level function; `call` is the embedder's path for invoking
//! an already-compiled function value (or a registered native) directly.
//! Both end up in `execute_function`, which pushes one frame and loops
//! `step` until that frame (and anything it calls) has returned.

use crate::frame::Frame;
use crate::globals::HostGlobals;
use crate::stdlib;
use loom_core::{
    gc, Chunk, ErrorKind, ErrorObject, HeapObject, HeapString, LangError, MapKey, NativeFunctionObject,
    Opcode, SourcePosition, Traceback, Value,
};
use loom_compiler::CompiledProgram;
use std::rc::Rc;
use std::time::{Duration, Instant};

const MAX_FRAMES: usize = 2048;
const MAX_STACK: usize = 2048;
const MAX_THIS_STACK: usize = 2048;
const MODULE_GLOBALS_CAP: usize = 2048;
const TIMEOUT_CHECK_INTERVAL: u64 = 1000;

/// The magic map keys operator overloading dispatches through, computed once
/// so arithmetic opcodes never re-allocate the key string per evaluation.
struct OperatorKeys {
    add: MapKey,
    sub: MapKey,
    mul: MapKey,
    div: MapKey,
    modulo: MapKey,
    bit_or: MapKey,
    bit_xor: MapKey,
    bit_and: MapKey,
    lshift: MapKey,
    rshift: MapKey,
    minus: MapKey,
    bang: MapKey,
    cmp: MapKey,
}

impl OperatorKeys {
    fn new() -> Self {
        let key = |s: &str| MapKey::String(s.to_string());
        Self {
            add: key("__operator_add__"),
            sub: key("__operator_sub__"),
            mul: key("__operator_mul__"),
            div: key("__operator_div__"),
            modulo: key("__operator_mod__"),
            bit_or: key("__operator_or__"),
            bit_xor: key("__operator_xor__"),
            bit_and: key("__operator_and__"),
            lshift: key("__operator_lshift__"),
            rshift: key("__operator_rshift__"),
            minus: key("__operator_minus__"),
            bang: key("__operator_bang__"),
            cmp: key("__cmp__"),
        }
    }
}

enum Callable {
    Native(NativeFunctionObject),
    User { chunk: Rc<Chunk>, num_params: u8 },
}

pub struct Vm {
    heap: loom_core::Heap,
    host_globals: HostGlobals,
    module_globals: Vec<Value>,
    frames: Vec<Frame>,
    stack: Vec<Value>,
    this_stack: Vec<Value>,
    constants: Vec<Value>,
    operator_keys: OperatorKeys,
    max_execution_time: Option<Duration>,
    deadline: Option<Instant>,
    instructions_executed: u64,
    /// Lower bound (inclusive) on frame index that `propagate` may unwind
    /// into, and that `capture_traceback` walks up from. Set by `run_loop`
    /// for the duration of one nested dispatch, so a reentrant call (an
    /// operator overload, or the embedder's `call`) can't unwind past the
    /// frame that invoked it.
    floor: usize,
}

impl Vm {
    pub fn new(heap: loom_core::Heap, max_execution_time: Option<Duration>) -> Self {
        Self {
            heap,
            host_globals: HostGlobals::new(),
            module_globals: vec![Value::Null; MODULE_GLOBALS_CAP],
            frames: Vec::new(),
            stack: Vec::with_capacity(MAX_STACK),
            this_stack: Vec::with_capacity(MAX_THIS_STACK),
            constants: Vec::new(),
            operator_keys: OperatorKeys::new(),
            max_execution_time,
            deadline: None,
            instructions_executed: 0,
            floor: 0,
        }
    }

    pub fn heap(&self) -> &loom_core::Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut loom_core::Heap {
        &mut self.heap
    }

    pub fn set_host_global(&mut self, index: u16, value: Value) {
        self.host_globals.set(index, value);
    }

    pub fn get_host_global(&self, index: u16) -> Value {
        self.host_globals.get(index)
    }

    /// Reads a module-global slot after `run` has populated it. Used by the
    /// embedder to fetch a top-level function value by name before calling it.
    pub fn get_module_global(&self, index: u16) -> Value {
        self.module_globals[index as usize]
    }

    // ---- embedder entry points ----

    pub fn run(&mut self, program: &CompiledProgram) -> Result<Value, LangError> {
        self.constants = program.constants.clone();
        self.reset_deadline();
        let main = loom_core::FunctionObject {
            chunk: program.chunk.clone(),
            free_values: Vec::new(),
        };
        let main_ref = self.heap.alloc_function(main);
        self.execute_function(Value::Heap(main_ref), program.chunk.clone(), &[])
    }

    pub fn call(&mut self, constants: &[Value], callee: Value, args: &[Value]) -> Result<Value, LangError> {
        self.constants = constants.to_vec();
        self.reset_deadline();
        self.call_value(callee, args)
    }

    fn reset_deadline(&mut self) {
        self.instructions_executed = 0;
        self.deadline = self.max_execution_time.map(|d| Instant::now() + d);
    }

    // ---- dispatch core ----

    fn execute_function(&mut self, callee: Value, chunk: Rc<Chunk>, args: &[Value]) -> Result<Value, LangError> {
        if self.frames.len() >= MAX_FRAMES {
            return Err(LangError::new(ErrorKind::Runtime, "stack overflow", self.current_position()));
        }
        self.push(callee);
        let base_pointer = self.stack.len();
        self.stack.extend_from_slice(args);
        self.stack.resize(base_pointer + chunk.num_locals as usize, Value::Null);
        let floor = self.frames.len();
        self.frames.push(Frame::new(callee, chunk, base_pointer));
        tracing::debug!(base_pointer, floor, "call");
        let result = self.run_loop(floor);
        tracing::debug!(floor, "return");
        if floor == 0 {
            let roots = self.gc_roots();
            gc::run_gc(&mut self.heap, roots);
        }
        result
    }

    fn run_loop(&mut self, floor: usize) -> Result<Value, LangError> {
        let previous_floor = self.floor;
        self.floor = floor;
        let outcome = loop {
            if self.frames.len() <= floor {
                break Ok(self.stack.pop().unwrap_or(Value::Null));
            }
            match self.step() {
                Ok(()) => {}
                Err(e) => break Err(e),
            }
        };
        let outcome = match outcome {
            Ok(v) => Ok(v),
            Err(e) => {
                let tb = self.capture_traceback();
                tracing::warn!(error = %e, "unrecovered runtime error");
                self.frames.truncate(floor);
                Err(e.with_traceback(tb))
            }
        };
        self.floor = previous_floor;
        outcome
    }

    fn step(&mut self) -> Result<(), LangError> {
        let roots = self.gc_roots();
        gc::maybe_run_gc(&mut self.heap, roots);

        self.instructions_executed += 1;
        if self.instructions_executed % TIMEOUT_CHECK_INTERVAL == 0 {
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    return self.propagate(LangError::new(ErrorKind::Timeout, "execution timed out", self.current_position()));
                }
            }
        }

        self.frame_mut().src_ip = self.frame().ip;
        let opcode_byte = self.fetch_u8();
        let opcode = Opcode::from_byte(opcode_byte).expect("invalid opcode byte in compiled chunk");
        tracing::trace!(op = %opcode, "dispatch");

        match opcode {
            Opcode::Constant => {
                let ix = self.fetch_u16();
                let v = self.constants[ix as usize];
                self.push(v);
                Ok(())
            }
            Opcode::Number => {
                let bits = self.fetch_u64();
                self.push(Value::Number(f64::from_bits(bits)));
                Ok(())
            }
            Opcode::True => {
                self.push(Value::Boolean(true));
                Ok(())
            }
            Opcode::False => {
                self.push(Value::Boolean(false));
                Ok(())
            }
            Opcode::Null => {
                self.push(Value::Null);
                Ok(())
            }

            Opcode::Add => {
                let b = self.pop();
                let a = self.pop();
                self.dispatch_result(self.op_add(a, b))
            }
            Opcode::Sub => {
                let b = self.pop();
                let a = self.pop();
                let key = self.operator_keys.sub.clone();
                self.dispatch_result(self.numeric_binop(a, b, &key, |x, y| x - y))
            }
            Opcode::Mul => {
                let b = self.pop();
                let a = self.pop();
                let key = self.operator_keys.mul.clone();
                self.dispatch_result(self.numeric_binop(a, b, &key, |x, y| x * y))
            }
            Opcode::Div => {
                let b = self.pop();
                let a = self.pop();
                let key = self.operator_keys.div.clone();
                self.dispatch_result(self.numeric_binop(a, b, &key, |x, y| x / y))
            }
            Opcode::Mod => {
                let b = self.pop();
                let a = self.pop();
                let key = self.operator_keys.modulo.clone();
                self.dispatch_result(self.numeric_binop(a, b, &key, |x, y| x % y))
            }
            Opcode::Minus => {
                let a = self.pop();
                self.dispatch_result(self.op_minus(a))
            }
            Opcode::Bang => {
                let a = self.pop();
                self.dispatch_result(self.op_bang(a))
            }

            Opcode::BitOr => {
                let b = self.pop();
                let a = self.pop();
                let key = self.operator_keys.bit_or.clone();
                self.dispatch_result(self.numeric_binop(a, b, &key, |x, y| ((x as i64) | (y as i64)) as f64))
            }
            Opcode::BitXor => {
                let b = self.pop();
                let a = self.pop();
                let key = self.operator_keys.bit_xor.clone();
                self.dispatch_result(self.numeric_binop(a, b, &key, |x, y| ((x as i64) ^ (y as i64)) as f64))
            }
            Opcode::BitAnd => {
                let b = self.pop();
                let a = self.pop();
                let key = self.operator_keys.bit_and.clone();
                self.dispatch_result(self.numeric_binop(a, b, &key, |x, y| ((x as i64) & (y as i64)) as f64))
            }
            Opcode::LShift => {
                let b = self.pop();
                let a = self.pop();
                let key = self.operator_keys.lshift.clone();
                self.dispatch_result(self.numeric_binop(a, b, &key, |x, y| ((x as i64) << (y as i64)) as f64))
            }
            Opcode::RShift => {
                let b = self.pop();
                let a = self.pop();
                let key = self.operator_keys.rshift.clone();
                self.dispatch_result(self.numeric_binop(a, b, &key, |x, y| ((x as i64) >> (y as i64)) as f64))
            }

            Opcode::Compare => unreachable!("never emitted; Equal/NotEqual/GreaterThan(Equal) cover comparisons"),
            Opcode::Equal => {
                let b = self.pop();
                let a = self.pop();
                let eq = self.values_equal(a, b);
                self.push(Value::Boolean(eq));
                Ok(())
            }
            Opcode::NotEqual => {
                let b = self.pop();
                let a = self.pop();
                let eq = self.values_equal(a, b);
                self.push(Value::Boolean(!eq));
                Ok(())
            }
            Opcode::GreaterThan => {
                let b = self.pop();
                let a = self.pop();
                self.dispatch_result(self.op_compare(a, b, true))
            }
            Opcode::GreaterThanEqual => {
                let b = self.pop();
                let a = self.pop();
                self.dispatch_result(self.op_compare(a, b, false))
            }

            Opcode::Pop => {
                self.pop();
                Ok(())
            }
            Opcode::Dup => {
                let v = self.peek();
                self.push(v);
                Ok(())
            }

            Opcode::Jump => {
                let target = self.fetch_u16() as usize;
                self.frame_mut().ip = target;
                Ok(())
            }
            Opcode::JumpIfFalse => {
                let target = self.fetch_u16() as usize;
                let v = self.pop();
                if !v.is_truthy() {
                    self.frame_mut().ip = target;
                }
                Ok(())
            }
            Opcode::JumpIfTrue => {
                let target = self.fetch_u16() as usize;
                let v = self.pop();
                if v.is_truthy() {
                    self.frame_mut().ip = target;
                }
                Ok(())
            }

            Opcode::Call => {
                let argc = self.fetch_u8() as usize;
                let callee_index = self.stack.len() - argc - 1;
                let callee = self.stack[callee_index];
                let args: Vec<Value> = self.stack[callee_index + 1..].to_vec();
                self.stack.truncate(callee_index);
                self.dispatch_result(self.call_value(callee, &args))
            }
            Opcode::ReturnValue => {
                let v = self.pop();
                self.do_return(v)
            }
            Opcode::Return => self.do_return(Value::Null),
            Opcode::SetRecover => {
                let target = self.fetch_u16() as usize;
                self.frame_mut().recover_ip = target as i32;
                Ok(())
            }

            Opcode::DefineModuleGlobal => {
                let ix = self.fetch_u16() as usize;
                let v = self.pop();
                self.module_globals[ix] = v;
                Ok(())
            }
            Opcode::SetModuleGlobal => {
                let ix = self.fetch_u16() as usize;
                let new = self.peek();
                let old = self.module_globals[ix];
                match self.check_assignment(old, new) {
                    Ok(()) => {
                        self.module_globals[ix] = new;
                        Ok(())
                    }
                    Err(e) => self.propagate(e),
                }
            }
            Opcode::GetModuleGlobal => {
                let ix = self.fetch_u16() as usize;
                self.push(self.module_globals[ix]);
                Ok(())
            }
            Opcode::GetHostGlobal => {
                let ix = self.fetch_u16();
                let v = self.host_globals.get(ix);
                self.push(v);
                Ok(())
            }

            Opcode::DefineLocal => {
                let ix = self.fetch_u8() as usize;
                let v = self.pop();
                let base = self.frame().base_pointer;
                self.stack[base + ix] = v;
                Ok(())
            }
            Opcode::SetLocal => {
                let ix = self.fetch_u8() as usize;
                let new = self.peek();
                let base = self.frame().base_pointer;
                let old = self.stack[base + ix];
                match self.check_assignment(old, new) {
                    Ok(()) => {
                        self.stack[base + ix] = new;
                        Ok(())
                    }
                    Err(e) => self.propagate(e),
                }
            }
            Opcode::GetLocal => {
                let ix = self.fetch_u8() as usize;
                let base = self.frame().base_pointer;
                self.push(self.stack[base + ix]);
                Ok(())
            }
            Opcode::GetFree => {
                let ix = self.fetch_u8() as usize;
                let v = self.get_free_value(ix);
                self.push(v);
                Ok(())
            }
            Opcode::SetFree => {
                let ix = self.fetch_u8() as usize;
                let new = self.peek();
                self.dispatch_result(self.set_free_value(ix, new).map(|()| Value::Null))
            }
            Opcode::CurrentFunction => {
                let f = self.frame().function;
                self.push(f);
                Ok(())
            }
            Opcode::GetThis => {
                let v = self.this_stack.last().copied().unwrap_or(Value::Null);
                self.push(v);
                Ok(())
            }

            Opcode::Array => {
                let count = self.fetch_u16() as usize;
                let mut items = self.heap.get_array_from_pool();
                let start = self.stack.len() - count;
                items.extend_from_slice(&self.stack[start..]);
                self.stack.truncate(start);
                let r = self.heap.alloc_array(items);
                self.push(Value::Heap(r));
                Ok(())
            }
            Opcode::MapStart => {
                let _count = self.fetch_u16();
                let map = self.heap.get_map_from_pool();
                let r = self.heap.alloc_map(map);
                self.this_stack.push(Value::Heap(r));
                Ok(())
            }
            Opcode::MapEnd => {
                let count = self.fetch_u16() as usize;
                let this_val = self.this_stack.pop().expect("MAP_END without a matching MAP_START");
                let map_ref = this_val.as_heap_ref().expect("MAP_START always pushes a heap ref");
                let mut pairs = Vec::with_capacity(count);
                for _ in 0..count {
                    let value = self.pop();
                    let key = self.pop();
                    pairs.push((key, value));
                }
                pairs.reverse();
                let mut failure = None;
                for (key, value) in pairs {
                    match self.heap.value_to_map_key(&key) {
                        Some(map_key) => {
                            if let Some(HeapObject::Map(map)) = self.heap.get_mut(map_ref) {
                                map.insert(map_key, value);
                            }
                        }
                        None => {
                            failure = Some(format!("{} is not a valid map key", self.display_type(key)));
                            break;
                        }
                    }
                }
                match failure {
                    Some(msg) => self.propagate(LangError::new(ErrorKind::Runtime, msg, self.current_position())),
                    None => {
                        self.push(Value::Heap(map_ref));
                        Ok(())
                    }
                }
            }
            Opcode::GetIndex | Opcode::GetValueAt => {
                let index = self.pop();
                let target = self.pop();
                self.dispatch_result(self.index_get_value(target, index))
            }
            Opcode::SetIndex => {
                let value = self.pop();
                let index = self.pop();
                let target = self.pop();
                match self.index_set(target, index, value) {
                    Ok(()) => {
                        self.push(value);
                        Ok(())
                    }
                    Err(e) => self.propagate(e),
                }
            }
            Opcode::Len => {
                let v = self.pop();
                match stdlib::len_of(&self.heap, &v) {
                    Ok(n) => {
                        self.push(Value::Number(n));
                        Ok(())
                    }
                    Err(msg) => self.propagate(LangError::new(ErrorKind::Runtime, msg, self.current_position())),
                }
            }

            Opcode::Function => {
                let const_ix = self.fetch_u16() as usize;
                let num_free = self.fetch_u8() as usize;
                let template_ref = self.constants[const_ix]
                    .as_heap_ref()
                    .expect("FUNCTION constant must be a function template");
                let chunk = match self.heap.get(template_ref) {
                    Some(HeapObject::Function(f)) => f.chunk.clone(),
                    _ => panic!("FUNCTION constant slot does not hold a function template"),
                };
                let mut free_values = Vec::with_capacity(num_free);
                for _ in 0..num_free {
                    free_values.push(self.pop());
                }
                free_values.reverse();
                let closure = loom_core::FunctionObject { chunk, free_values };
                let r = self.heap.alloc_function(closure);
                self.push(Value::Heap(r));
                Ok(())
            }
        }
    }

    /// Converts a plain `Result<Value, LangError>` into the step-level
    /// `Result<(), LangError>` contract: push on success, try recovery (or
    /// propagate further) on failure.
    fn dispatch_result(&mut self, result: Result<Value, LangError>) -> Result<(), LangError> {
        match result {
            Ok(v) => {
                self.push(v);
                Ok(())
            }
            Err(e) => self.propagate(e),
        }
    }

    fn do_return(&mut self, value: Value) -> Result<(), LangError> {
        let frame = self.frames.pop().expect("RETURN must pop an active frame");
        tracing::debug!(base_pointer = frame.base_pointer, "do_return");
        self.stack.truncate(frame.base_pointer - 1);
        self.push(value);
        Ok(())
    }

    /// Attempts to recover `err` at the innermost enabled `recover` frame
    /// within `self.floor..`. On success, unwinds to that frame, pushes the
    /// constructed Error value, and redirects `ip` into the recover block —
    /// the caller must treat `Ok(())` as "abandon the rest of this
    /// instruction", not "the error didn't happen".
    fn propagate(&mut self, err: LangError) -> Result<(), LangError> {
        for i in (self.floor..self.frames.len()).rev() {
            if self.frames[i].recover_ip >= 0 && !self.frames[i].is_recovering {
                let tb = self.capture_traceback();
                let recovered = err.clone().with_traceback(tb);
                tracing::warn!(error = %recovered, "runtime error recovered");
                let base = self.frames[i].base_pointer;
                let num_locals = self.frames[i].chunk.num_locals as usize;
                self.frames.truncate(i + 1);
                self.stack.truncate(base + num_locals);
                let error_obj = ErrorObject {
                    message: HeapString::new(&recovered.message),
                    traceback: recovered.traceback.clone(),
                };
                let error_ref = self.heap.alloc_error(error_obj);
                self.stack.push(Value::Heap(error_ref));
                let frame = self.frames.last_mut().expect("just truncated to include this frame");
                frame.ip = frame.recover_ip as usize;
                frame.is_recovering = true;
                return Ok(());
            }
        }
        Err(err)
    }

    fn capture_traceback(&self) -> Traceback {
        let mut tb = Traceback::default();
        for frame in self.frames[self.floor..].iter().rev() {
            let name = frame.chunk.name.clone().unwrap_or_else(|| "<anonymous>".to_string());
            tb.push(name, frame.chunk.bytecode.position_at(frame.src_ip));
        }
        tb
    }

    fn current_position(&self) -> SourcePosition {
        self.frames
            .last()
            .map(|f| f.chunk.bytecode.position_at(f.src_ip))
            .unwrap_or_else(SourcePosition::unknown)
    }

    // ---- calls ----

    fn resolve_callable(&self, value: Value) -> Option<Callable> {
        match value {
            Value::Heap(r) => match self.heap.get(r) {
                Some(HeapObject::Function(f)) => Some(Callable::User {
                    chunk: f.chunk.clone(),
                    num_params: f.chunk.num_params,
                }),
                Some(HeapObject::NativeFunction(n)) => Some(Callable::Native(n.clone())),
                _ => None,
            },
            _ => None,
        }
    }

    fn invoke_native(&mut self, native: &NativeFunctionObject, args: &[Value]) -> Result<Value, LangError> {
        (native.func)(&mut self.heap, args).map_err(|msg| {
            let kind = if native.name.as_str() == stdlib::CRASH_NAME {
                ErrorKind::User
            } else {
                ErrorKind::Runtime
            };
            LangError::new(kind, msg, self.current_position())
        })
    }

    fn call_value(&mut self, callee: Value, args: &[Value]) -> Result<Value, LangError> {
        match self.resolve_callable(callee) {
            Some(Callable::Native(native)) => self.invoke_native(&native, args),
            Some(Callable::User { chunk, num_params }) => {
                if num_params as usize != args.len() {
                    return Err(LangError::new(
                        ErrorKind::Runtime,
                        format!("expected {num_params} arguments, got {}", args.len()),
                        self.current_position(),
                    ));
                }
                self.execute_function(callee, chunk, args)
            }
            None => Err(LangError::new(
                ErrorKind::Runtime,
                format!("{} is not callable", self.display_type(callee)),
                self.current_position(),
            )),
        }
    }

    // ---- arithmetic & comparison ----

    fn is_string_value(&self, v: Value) -> bool {
        matches!(v, Value::Heap(r) if matches!(self.heap.get(r), Some(HeapObject::String(_))))
    }

    /// `+` concatenates whenever either side is a string, coercing the other
    /// side through [`stdlib::to_str_of`] (so `"caught: " + error_value`
    /// yields the error's bare message, matching a native `to_str` call on
    /// the same value); otherwise it's numeric addition or an overload.
    fn op_add(&mut self, a: Value, b: Value) -> Result<Value, LangError> {
        if let (Value::Heap(ra), Value::Heap(rb)) = (a, b) {
            if let (Some(HeapObject::String(sa)), Some(HeapObject::String(sb))) = (self.heap.get(ra), self.heap.get(rb)) {
                let s = sa.concat(sb);
                let r = self.heap.alloc_string(s);
                return Ok(Value::Heap(r));
            }
        }
        if self.is_string_value(a) || self.is_string_value(b) {
            let sa = stdlib::to_str_of(&self.heap, &a);
            let sb = stdlib::to_str_of(&self.heap, &b);
            let r = self.heap.alloc_string(sa + &sb);
            return Ok(Value::Heap(r));
        }
        let key = self.operator_keys.add.clone();
        self.numeric_binop(a, b, &key, |x, y| x + y)
    }

    fn numeric_binop(&mut self, a: Value, b: Value, overload_key: &MapKey, f: impl Fn(f64, f64) -> f64) -> Result<Value, LangError> {
        if let (Some(x), Some(y)) = (a.coerce_numeric(), b.coerce_numeric()) {
            return Ok(Value::Number(f(x, y)));
        }
        if let Some(result) = self.try_operator_overload(overload_key, a, Some(b))? {
            return Ok(result);
        }
        Err(LangError::new(
            ErrorKind::Runtime,
            format!("cannot apply operator to {} and {}", self.display_type(a), self.display_type(b)),
            self.current_position(),
        ))
    }

    fn op_minus(&mut self, a: Value) -> Result<Value, LangError> {
        if let Value::Number(n) = a {
            return Ok(Value::Number(-n));
        }
        let key = self.operator_keys.minus.clone();
        if let Some(result) = self.try_operator_overload(&key, a, None)? {
            return Ok(result);
        }
        Err(LangError::new(
            ErrorKind::Runtime,
            format!("cannot negate {}", self.display_type(a)),
            self.current_position(),
        ))
    }

    fn op_bang(&mut self, a: Value) -> Result<Value, LangError> {
        if matches!(a, Value::Heap(_)) {
            let key = self.operator_keys.bang.clone();
            if let Some(result) = self.try_operator_overload(&key, a, None)? {
                return Ok(result);
            }
        }
        Ok(Value::Boolean(!a.is_truthy()))
    }

    fn op_compare(&mut self, a: Value, b: Value, strict: bool) -> Result<Value, LangError> {
        if let (Some(x), Some(y)) = (a.coerce_numeric(), b.coerce_numeric()) {
            let result = if strict { x > y } else { x >= y };
            return Ok(Value::Boolean(result));
        }
        let key = self.operator_keys.cmp.clone();
        if let Some(result) = self.try_operator_overload(&key, a, Some(b))? {
            let n = result.as_number().ok_or_else(|| {
                LangError::new(ErrorKind::Runtime, "__cmp__ overload must return a number", self.current_position())
            })?;
            let outcome = if strict { n > 0.0 } else { n >= 0.0 };
            return Ok(Value::Boolean(outcome));
        }
        Err(LangError::new(
            ErrorKind::Runtime,
            format!("cannot compare {} and {}", self.display_type(a), self.display_type(b)),
            self.current_position(),
        ))
    }

    fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => (x - y).abs() < f64::EPSILON,
            (Value::Boolean(x), Value::Boolean(y)) => x == y,
            (Value::Null, Value::Null) => true,
            (Value::Heap(ra), Value::Heap(rb)) => {
                if ra == rb {
                    return true;
                }
                match (self.heap.get(ra), self.heap.get(rb)) {
                    (Some(HeapObject::String(sa)), Some(HeapObject::String(sb))) => sa == sb,
                    _ => false,
                }
            }
            _ => match (a.coerce_numeric(), b.coerce_numeric()) {
                (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
                _ => false,
            },
        }
    }

    fn find_overload(&self, value: Value, key: &MapKey) -> Option<Value> {
        if let Value::Heap(r) = value {
            if let Some(HeapObject::Map(map)) = self.heap.get(r) {
                return map.get(key).copied();
            }
        }
        None
    }

    fn try_operator_overload(&mut self, key: &MapKey, a: Value, b: Option<Value>) -> Result<Option<Value>, LangError> {
        let func = self.find_overload(a, key).or_else(|| b.and_then(|bv| self.find_overload(bv, key)));
        let Some(func) = func else { return Ok(None) };
        let mut args = vec![a];
        if let Some(bv) = b {
            args.push(bv);
        }
        let result = self.call_value(func, &args)?;
        Ok(Some(result))
    }

    fn display_type(&self, v: Value) -> &'static str {
        match v {
            Value::Heap(r) => self.heap.get(r).map(|o| o.type_name()).unwrap_or("FREED"),
            other => other.type_name(),
        }
    }

    fn check_assignment(&self, old: Value, new: Value) -> Result<(), LangError> {
        if matches!(old, Value::Null) || matches!(new, Value::Null) {
            return Ok(());
        }
        let old_t = self.display_type(old);
        let new_t = self.display_type(new);
        if old_t != new_t {
            return Err(LangError::new(
                ErrorKind::Runtime,
                format!("Trying to assign variable of type {new_t} to {old_t}"),
                self.current_position(),
            ));
        }
        Ok(())
    }

    // ---- indexing ----

    fn index_get_value(&self, target: Value, index: Value) -> Result<Value, LangError> {
        let pos = self.current_position();
        match target {
            Value::Heap(r) => match self.heap.get(r) {
                Some(HeapObject::Array(items)) => {
                    let n = index
                        .as_number()
                        .ok_or_else(|| LangError::new(ErrorKind::Runtime, "array index must be a number", pos.clone()))?;
                    let i = n as i64;
                    if i < 0 || i as usize >= items.len() {
                        return Err(LangError::new(ErrorKind::Runtime, format!("index {i} out of range"), pos));
                    }
                    Ok(items[i as usize])
                }
                Some(HeapObject::Map(map)) => {
                    let key = self
                        .heap
                        .value_to_map_key(&index)
                        .ok_or_else(|| LangError::new(ErrorKind::Runtime, format!("{} is not a valid map key", index.type_name()), pos.clone()))?;
                    Ok(map.get(&key).copied().unwrap_or(Value::Null))
                }
                other => Err(LangError::new(
                    ErrorKind::Runtime,
                    format!("cannot index into {}", other.map(|o| o.type_name()).unwrap_or("FREED")),
                    pos,
                )),
            },
            _ => Err(LangError::new(ErrorKind::Runtime, format!("cannot index into {}", target.type_name()), pos)),
        }
    }

    fn index_set(&mut self, target: Value, index: Value, value: Value) -> Result<(), LangError> {
        let pos = self.current_position();
        let Value::Heap(r) = target else {
            return Err(LangError::new(ErrorKind::Runtime, format!("cannot index into {}", target.type_name()), pos));
        };
        let map_key = match self.heap.get(r) {
            Some(HeapObject::Map(_)) => Some(
                self.heap
                    .value_to_map_key(&index)
                    .ok_or_else(|| LangError::new(ErrorKind::Runtime, format!("{} is not a valid map key", index.type_name()), pos.clone()))?,
            ),
            _ => None,
        };
        match self.heap.get_mut(r) {
            Some(HeapObject::Array(items)) => {
                let n = index
                    .as_number()
                    .ok_or_else(|| LangError::new(ErrorKind::Runtime, "array index must be a number", pos.clone()))?;
                let i = n as i64;
                if i < 0 || i as usize >= items.len() {
                    return Err(LangError::new(ErrorKind::Runtime, format!("index {i} out of range"), pos));
                }
                items[i as usize] = value;
                Ok(())
            }
            Some(HeapObject::Map(map)) => {
                map.insert(map_key.expect("computed above for Map target"), value);
                Ok(())
            }
            other => Err(LangError::new(
                ErrorKind::Runtime,
                format!("cannot index into {}", other.map(|o| o.type_name()).unwrap_or("FREED")),
                pos,
            )),
        }
    }

    // ---- free variables ----

    fn get_free_value(&self, index: usize) -> Value {
        let Value::Heap(r) = self.frame().function else { return Value::Null };
        match self.heap.get(r) {
            Some(HeapObject::Function(f)) => f.free_values.get(index).copied().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    fn set_free_value(&mut self, index: usize, value: Value) -> Result<(), LangError> {
        let Value::Heap(r) = self.frame().function else { return Ok(()) };
        let old = match self.heap.get(r) {
            Some(HeapObject::Function(f)) => f.free_values.get(index).copied().unwrap_or(Value::Null),
            _ => Value::Null,
        };
        self.check_assignment(old, value)?;
        if let Some(HeapObject::Function(f)) = self.heap.get_mut(r) {
            if index < f.free_values.len() {
                f.free_values[index] = value;
            }
        }
        Ok(())
    }

    // ---- gc ----

    fn gc_roots(&self) -> Vec<Value> {
        let mut roots = Vec::with_capacity(self.stack.len() + self.this_stack.len() + self.frames.len() + self.constants.len() + self.module_globals.len());
        roots.extend_from_slice(&self.stack);
        roots.extend_from_slice(&self.this_stack);
        roots.extend(self.module_globals.iter().copied());
        roots.extend(self.host_globals.iter());
        roots.extend(self.frames.iter().map(|f| f.function));
        roots.extend(self.constants.iter().copied());
        roots
    }

    // ---- stack plumbing ----

    fn frame(&self) -> &Frame {
        self.frames.last().expect("dispatch loop requires an active frame")
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("dispatch loop requires an active frame")
    }

    fn fetch_u8(&mut self) -> u8 {
        let frame = self.frame_mut();
        let byte = frame.chunk.bytecode.read_u8(frame.ip);
        frame.ip += 1;
        byte
    }

    fn fetch_u16(&mut self) -> u16 {
        let frame = self.frame_mut();
        let v = frame.chunk.bytecode.read_u16(frame.ip);
        frame.ip += 2;
        v
    }

    fn fetch_u64(&mut self) -> u64 {
        let frame = self.frame_mut();
        let v = frame.chunk.bytecode.read_u64(frame.ip);
        frame.ip += 8;
        v
    }

    fn push(&mut self, v: Value) {
        debug_assert!(self.stack.len() < MAX_STACK, "operand stack overflow");
        self.stack.push(v);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow: compiler emitted an unbalanced instruction")
    }

    fn peek(&self) -> Value {
        *self.stack.last().expect("PEEK on an empty operand stack")
    }
}
