//! The Vesper virtual machine.
//!
//! A stack machine driving a fetch-decode-execute loop over compiled
//! [`Code`]. Before each instruction the loop checks the shared halt
//! flag, runs the periodic resource checks every `check_interval`
//! instructions, and dispatches the attached observer.

use std::rc::Rc;
use std::time::Duration;

use ahash::AHashMap;
use vesper_bytecode::{BinOp, CmpOp, Code, Constant, Op, NO_TARGET};
use vesper_error::{suggestion_hint, ErrorKind, SourceSpan, TraceFrame};

use crate::builtins;
use crate::context::ExecContext;
use crate::error::VmError;
use crate::frame::Frame;
use crate::observer::{CallEvent, ObserveMode, Observer, ObserverConfig, ReturnEvent, StepEvent};
use crate::value::{Closure, HostContext, MapValue, Partial, TypeRegistry, Value};

/// Positional arguments per call.
pub const MAX_ARGS: usize = 256;

/// Default cap on simultaneously active frames.
pub const DEFAULT_FRAME_LIMIT: usize = 1024;

/// Default stride of the periodic-check boundary.
pub const DEFAULT_CHECK_INTERVAL: u32 = 1000;

const INITIAL_FRAME_CAPACITY: usize = 16;

/// A handler pushed for an active `try` region.
#[derive(Debug, Clone)]
struct HandlerFrame {
    code: Rc<Code>,
    /// Frame count at push time; identifies the owning frame.
    frame_depth: usize,
    /// Value-stack height at push time.
    stack_base: usize,
    catch_ip: Option<usize>,
    finally_ip: Option<usize>,
    in_catch: bool,
    in_finally: bool,
    pending_error: Option<VmError>,
    pending_return: Option<Value>,
}

/// Construction-time VM options.
#[derive(Default)]
pub struct VmOptions {
    globals: Vec<(String, Value)>,
    instruction_offset: usize,
    check_interval: Option<u32>,
    observer: Option<Box<dyn Observer>>,
    registry: Option<Rc<TypeRegistry>>,
    max_steps: u64,
    max_value_stack: usize,
    max_frame_depth: usize,
    timeout: Option<Duration>,
}

impl VmOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed named globals before the first run.
    pub fn with_globals(mut self, globals: impl IntoIterator<Item = (String, Value)>) -> Self {
        self.globals.extend(globals);
        self
    }

    /// Start the next run at instruction `n` (REPL skip-ahead).
    pub fn with_instruction_offset(mut self, offset: usize) -> Self {
        self.instruction_offset = offset;
        self
    }

    /// Periodic-check stride; zero disables the periodic checks.
    pub fn with_context_check_interval(mut self, interval: u32) -> Self {
        self.check_interval = Some(interval);
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_type_registry(mut self, registry: Rc<TypeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Cumulative instruction limit for one invocation; zero is unlimited.
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Coarse knob: caps both the value stack and the frame stack.
    pub fn with_max_stack_depth(mut self, depth: usize) -> Self {
        self.max_value_stack = depth;
        self.max_frame_depth = depth;
        self
    }

    pub fn with_max_value_stack_depth(mut self, depth: usize) -> Self {
        self.max_value_stack = depth;
        self
    }

    pub fn with_max_frame_depth(mut self, depth: usize) -> Self {
        self.max_frame_depth = depth;
        self
    }

    /// Wrap each invocation's context with a deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The virtual machine.
pub struct Vm {
    code: Rc<Code>,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    handlers: Vec<HandlerFrame>,
    globals: Vec<Value>,
    global_indexes: AHashMap<String, usize>,
    global_slots: Vec<String>,
    // Resource governance. Counters are VM-scoped so nested host-callback
    // re-entries cannot reset them.
    steps: u64,
    tick: u32,
    check_interval: u32,
    max_steps: u64,
    max_value_stack: usize,
    max_frame_depth: usize,
    timeout: Option<Duration>,
    // Observer state.
    observer: Option<Box<dyn Observer>>,
    observer_config: ObserverConfig,
    sample_counter: u32,
    last_line: Option<(usize, usize)>,
    registry: Option<Rc<TypeRegistry>>,
    running: bool,
    start_ip: usize,
    ctx: ExecContext,
}

impl Vm {
    pub fn new(code: Rc<Code>, options: VmOptions) -> Self {
        let observer_config = options
            .observer
            .as_ref()
            .map(|o| o.config().normalized())
            .unwrap_or_default();

        let max_frame_depth = if options.max_frame_depth == 0 {
            DEFAULT_FRAME_LIMIT
        } else {
            options.max_frame_depth
        };

        let mut vm = Self {
            code,
            stack: Vec::new(),
            frames: Vec::with_capacity(INITIAL_FRAME_CAPACITY.min(max_frame_depth)),
            handlers: Vec::new(),
            globals: Vec::new(),
            global_indexes: AHashMap::new(),
            global_slots: Vec::new(),
            steps: 0,
            tick: 0,
            check_interval: options.check_interval.unwrap_or(DEFAULT_CHECK_INTERVAL),
            max_steps: options.max_steps,
            max_value_stack: options.max_value_stack,
            max_frame_depth,
            timeout: options.timeout,
            observer: options.observer,
            observer_config,
            sample_counter: 0,
            last_line: None,
            registry: options.registry,
            running: false,
            start_ip: options.instruction_offset,
            ctx: ExecContext::new(),
        };

        for (name, value) in options.globals {
            vm.define_global(name, value);
        }
        let code = vm.code.clone();
        vm.register_code_globals(&code);
        vm
    }

    // -------------------------------------------------------------------
    // Embedder API
    // -------------------------------------------------------------------

    /// Execute the VM's code from the current instruction offset.
    pub fn run(&mut self, ctx: &ExecContext) -> Result<Value, VmError> {
        self.ensure_idle()?;
        self.running = true;
        let code = self.code.clone();
        let result = self.execute_main(ctx, code);
        self.running = false;
        result
    }

    /// Execute new code, resetting execution state but preserving
    /// accumulated globals so REPL-style sessions work.
    pub fn run_code(&mut self, ctx: &ExecContext, code: Rc<Code>) -> Result<Value, VmError> {
        self.ensure_idle()?;
        self.running = true;
        self.code = code.clone();
        let result = self.execute_main(ctx, code);
        self.running = false;
        result
    }

    /// Call a script value with the given arguments.
    pub fn call(
        &mut self,
        ctx: &ExecContext,
        func: &Value,
        args: Vec<Value>,
    ) -> Result<Value, VmError> {
        self.ensure_idle()?;
        self.running = true;
        self.ctx = match self.timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        };
        let result = self.protected(|vm| vm.invoke_value(func, args));
        self.running = false;
        if result.is_err() {
            self.frames.clear();
            self.handlers.clear();
        }
        result
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.global_indexes
            .get(name)
            .map(|&index| self.globals[index].clone())
    }

    /// Global names in slot order.
    pub fn global_names(&self) -> Vec<String> {
        self.global_slots.clone()
    }

    /// Set the instruction offset for the next run. Only valid while the
    /// VM is stopped.
    pub fn set_ip(&mut self, ip: usize) -> Result<(), VmError> {
        self.ensure_idle()?;
        self.start_ip = ip;
        Ok(())
    }

    pub fn top_of_stack(&self) -> Option<Value> {
        self.stack.last().cloned()
    }

    /// Total instructions executed, counted at periodic boundaries.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn type_registry(&self) -> Option<&Rc<TypeRegistry>> {
        self.registry.as_ref()
    }

    fn ensure_idle(&self) -> Result<(), VmError> {
        if self.running {
            return Err(VmError::fatal(ErrorKind::Runtime, "vm is already running"));
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Globals
    // -------------------------------------------------------------------

    fn define_global(&mut self, name: String, value: Value) {
        if let Some(&index) = self.global_indexes.get(&name) {
            self.globals[index] = value;
            return;
        }
        let index = self.globals.len();
        self.globals.push(value);
        self.global_indexes.insert(name.clone(), index);
        self.global_slots.push(name);
    }

    fn register_code_globals(&mut self, code: &Code) {
        for name in &code.global_names {
            if !self.global_indexes.contains_key(name) {
                self.define_global(name.clone(), Value::Nil);
            }
        }
    }

    // -------------------------------------------------------------------
    // Execution entry points
    // -------------------------------------------------------------------

    fn execute_main(&mut self, ctx: &ExecContext, code: Rc<Code>) -> Result<Value, VmError> {
        self.stack.clear();
        self.frames.clear();
        self.handlers.clear();
        self.steps = 0;
        self.tick = 0;
        self.sample_counter = 0;
        self.last_line = None;
        self.register_code_globals(&code);

        self.ctx = match self.timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        };

        let start_ip = self.start_ip.min(code.instructions.len());
        let mut frame = Frame::new(code, 0, 0, true, None);
        frame.ip = start_ip;
        self.frames.push(frame);

        let result = self.protected(|vm| vm.dispatch(1));
        if result.is_err() {
            self.frames.clear();
            self.handlers.clear();
        }
        result
    }

    /// Run `f`, converting host panics into structured errors with the
    /// stack captured at the point of failure.
    fn protected(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<Value, VmError>,
    ) -> Result<Value, VmError> {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(self))) {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic during execution".to_string());
                let kind = classify_panic(&message);
                let trace = self.capture_trace();
                let mut err = VmError::fatal(kind, message);
                err.error.trace = trace;
                Err(err)
            }
        }
    }

    fn invoke_value(&mut self, func: &Value, args: Vec<Value>) -> Result<Value, VmError> {
        match func {
            Value::Builtin(builtin) => {
                let builtin = builtin.clone();
                builtin.call(self, &args)
            }
            Value::Closure(closure) => {
                let closure = closure.clone();
                let base = self.frames.len() + 1;
                self.enter_frame(closure, args, true)?;
                self.dispatch(base)
            }
            Value::Partial(partial) => {
                let mut full = partial.bound.clone();
                full.extend(args);
                let callable = partial.callable.clone();
                self.invoke_value(&callable, full)
            }
            other => Err(VmError::type_error(format!(
                "object is not callable (got {})",
                other.type_name()
            ))),
        }
    }

    // -------------------------------------------------------------------
    // Dispatch loop
    // -------------------------------------------------------------------

    fn dispatch(&mut self, base: usize) -> Result<Value, VmError> {
        loop {
            // Halt flag, every instruction.
            if self.ctx.is_cancelled() {
                return Err(self.finalize(VmError::cancelled(), base));
            }

            // Periodic checks, every `check_interval` instructions.
            if self.check_interval != 0 {
                self.tick += 1;
                if self.tick >= self.check_interval {
                    self.tick = 0;
                    self.steps += self.check_interval as u64;
                    if self.ctx.deadline_exceeded() {
                        return Err(self.finalize(VmError::deadline_exceeded(), base));
                    }
                    if self.max_steps != 0 && self.steps > self.max_steps {
                        let err = VmError::fatal(
                            ErrorKind::Runtime,
                            format!("step limit of {} exceeded", self.max_steps),
                        );
                        return Err(self.finalize(err, base));
                    }
                    if self.max_value_stack != 0 && self.stack.len() > self.max_value_stack {
                        let err = VmError::fatal(
                            ErrorKind::Runtime,
                            format!("value stack limit of {} exceeded", self.max_value_stack),
                        );
                        return Err(self.finalize(err, base));
                    }
                }
            }

            self.observe_step().map_err(|e| self.finalize(e, base))?;

            let op_pos = self.frame().ip;
            if self.frame().at_end() {
                // Compiled code always ends in Halt or Return; running off
                // the end means the artifact is damaged.
                let err = VmError::fatal(ErrorKind::Runtime, "instruction pointer out of bounds");
                return Err(self.finalize(err, base));
            }
            let word = self.frame_mut().read_word();
            let Some(op) = Op::decode(word) else {
                let err = VmError::fatal(
                    ErrorKind::Runtime,
                    format!("invalid opcode {} at {}", word, op_pos),
                );
                return Err(self.finalize(err, base));
            };

            let step: Result<(), VmError> = match op {
                Op::Nop => Ok(()),

                Op::Halt => {
                    let value = self.stack.last().cloned().unwrap_or(Value::Nil);
                    self.frames.pop();
                    return Ok(value);
                }

                Op::Call => {
                    let argc = self.frame_mut().read_word() as usize;
                    self.op_call(argc)
                }

                Op::CallSpread => self.op_call_spread(),

                Op::Return => {
                    let value = self.pop();
                    match self.perform_return(value, base) {
                        Ok(Some(result)) => return Ok(result),
                        Ok(None) => Ok(()),
                        Err(err) => Err(err),
                    }
                }

                Op::Jump => {
                    let delta = self.frame_mut().read_word() as usize;
                    self.frame_mut().ip = op_pos + delta;
                    Ok(())
                }

                Op::JumpBack => {
                    let delta = self.frame_mut().read_word() as usize;
                    self.frame_mut().ip = op_pos - delta;
                    Ok(())
                }

                Op::PopJumpIfFalse => {
                    let delta = self.frame_mut().read_word() as usize;
                    let value = self.pop();
                    if !value.is_truthy() {
                        self.frame_mut().ip = op_pos + delta;
                    }
                    Ok(())
                }

                Op::PopJumpIfTrue => {
                    let delta = self.frame_mut().read_word() as usize;
                    let value = self.pop();
                    if value.is_truthy() {
                        self.frame_mut().ip = op_pos + delta;
                    }
                    Ok(())
                }

                Op::PopJumpIfNil => {
                    let delta = self.frame_mut().read_word() as usize;
                    let value = self.pop();
                    if value.is_nil() {
                        self.frame_mut().ip = op_pos + delta;
                    }
                    Ok(())
                }

                Op::PopJumpIfNotNil => {
                    let delta = self.frame_mut().read_word() as usize;
                    let value = self.pop();
                    if !value.is_nil() {
                        self.push(value);
                        self.frame_mut().ip = op_pos + delta;
                    }
                    Ok(())
                }

                Op::LoadConst => {
                    let index = self.frame_mut().read_word() as usize;
                    let constant = self.frame().code.constants[index].clone();
                    let value = constant_value(&constant);
                    self.push(value);
                    Ok(())
                }

                Op::LoadLocal => {
                    let index = self.frame_mut().read_word() as usize;
                    let value = self.frame().load_local(index);
                    self.push(value);
                    Ok(())
                }

                Op::StoreLocal => {
                    let index = self.frame_mut().read_word() as usize;
                    let value = self.pop();
                    self.frame_mut().store_local(index, value);
                    Ok(())
                }

                Op::LoadGlobal => {
                    let index = self.frame_mut().read_word() as usize;
                    let value = self.globals[index].clone();
                    self.push(value);
                    Ok(())
                }

                Op::StoreGlobal => {
                    let index = self.frame_mut().read_word() as usize;
                    let value = self.pop();
                    self.globals[index] = value;
                    Ok(())
                }

                Op::LoadFree => {
                    let index = self.frame_mut().read_word() as usize;
                    self.op_load_free(index)
                }

                Op::StoreFree => {
                    let index = self.frame_mut().read_word() as usize;
                    self.op_store_free(index)
                }

                Op::LoadAttr => {
                    let name_index = self.frame_mut().read_word() as usize;
                    self.op_load_attr(name_index, false)
                }

                Op::LoadAttrOrNil => {
                    let name_index = self.frame_mut().read_word() as usize;
                    self.op_load_attr(name_index, true)
                }

                Op::StoreAttr => {
                    let name_index = self.frame_mut().read_word() as usize;
                    self.op_store_attr(name_index)
                }

                Op::BinaryOp => {
                    let word = self.frame_mut().read_word();
                    let right = self.pop();
                    let left = self.pop();
                    match BinOp::decode(word) {
                        Some(op) => binary(op, left, right).map(|v| self.push(v)),
                        None => Err(VmError::fatal(
                            ErrorKind::Runtime,
                            format!("invalid binary operator {}", word),
                        )),
                    }
                }

                Op::CompareOp => {
                    let word = self.frame_mut().read_word();
                    let right = self.pop();
                    let left = self.pop();
                    match CmpOp::decode(word) {
                        Some(op) => compare(op, &left, &right).map(|v| self.push(v)),
                        None => Err(VmError::fatal(
                            ErrorKind::Runtime,
                            format!("invalid comparison operator {}", word),
                        )),
                    }
                }

                Op::Negate => {
                    let value = self.pop();
                    match value {
                        Value::Int(n) => {
                            self.push(Value::Int(n.wrapping_neg()));
                            Ok(())
                        }
                        Value::Float(n) => {
                            self.push(Value::Float(-n));
                            Ok(())
                        }
                        other => Err(VmError::type_error(format!(
                            "cannot negate {}",
                            other.type_name()
                        ))),
                    }
                }

                Op::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(!value.is_truthy()));
                    Ok(())
                }

                Op::Contains => {
                    let invert = self.frame_mut().read_word() != 0;
                    let item = self.pop();
                    let container = self.pop();
                    contains(&container, &item).map(|found| {
                        self.push(Value::Bool(found != invert));
                    })
                }

                Op::BuildList => {
                    let count = self.frame_mut().read_word() as usize;
                    let items = self.stack.split_off(self.stack.len() - count);
                    self.push(Value::list(items));
                    Ok(())
                }

                Op::BuildMap => {
                    let count = self.frame_mut().read_word() as usize;
                    self.op_build_map(count)
                }

                Op::BuildString => {
                    let count = self.frame_mut().read_word() as usize;
                    let pieces = self.stack.split_off(self.stack.len() - count);
                    let mut text = String::new();
                    for piece in pieces {
                        match piece {
                            Value::String(s) => text.push_str(&s),
                            Value::Error(e) => text.push_str(&e.message),
                            other => text.push_str(&other.inspect()),
                        }
                    }
                    self.push(Value::string(text));
                    Ok(())
                }

                Op::ListAppend => self.op_list_append(),
                Op::ListExtend => self.op_list_extend(),
                Op::MapMerge => self.op_map_merge(),
                Op::MapSet => self.op_map_set(),

                Op::Index => {
                    let index = self.pop();
                    let object = self.pop();
                    index_value(&object, &index).map(|v| self.push(v))
                }

                Op::StoreIndex => self.op_store_index(),

                Op::Slice => {
                    let high = self.pop();
                    let low = self.pop();
                    let object = self.pop();
                    slice_value(&object, &low, &high).map(|v| self.push(v))
                }

                Op::Length => {
                    let value = self.pop();
                    length_of(&value).map(|n| self.push(Value::Int(n)))
                }

                Op::Unpack => {
                    let count = self.frame_mut().read_word() as usize;
                    self.op_unpack(count)
                }

                Op::Pop => {
                    self.pop();
                    Ok(())
                }

                Op::Copy => {
                    let depth = self.frame_mut().read_word() as usize;
                    let value = self.peek(depth).clone();
                    self.push(value);
                    Ok(())
                }

                Op::Swap => {
                    let depth = self.frame_mut().read_word() as usize;
                    let top = self.stack.len() - 1;
                    self.stack.swap(top, top - depth);
                    Ok(())
                }

                Op::Nil => {
                    self.push(Value::Nil);
                    Ok(())
                }

                Op::True => {
                    self.push(Value::Bool(true));
                    Ok(())
                }

                Op::False => {
                    self.push(Value::Bool(false));
                    Ok(())
                }

                Op::MakeCell => {
                    let index = self.frame_mut().read_word() as usize;
                    let depth = self.frame_mut().read_word() as usize;
                    self.op_make_cell(index, depth)
                }

                Op::LoadClosure => {
                    let const_index = self.frame_mut().read_word() as usize;
                    let capture_count = self.frame_mut().read_word() as usize;
                    self.op_load_closure(const_index, capture_count)
                }

                Op::MakePartial => {
                    let argc = self.frame_mut().read_word() as usize;
                    let bound = self.stack.split_off(self.stack.len() - argc);
                    let callable = self.pop();
                    self.push(Value::Partial(Rc::new(Partial { callable, bound })));
                    Ok(())
                }

                Op::PushExcept => {
                    let catch_delta = self.frame_mut().read_word();
                    let finally_delta = self.frame_mut().read_word();
                    self.op_push_except(op_pos, catch_delta, finally_delta);
                    Ok(())
                }

                Op::PopExcept => self.op_pop_except(),

                Op::Throw => {
                    let value = self.pop();
                    Err(throw_value(value))
                }

                Op::EndFinally => match self.op_end_finally(base) {
                    Ok(Some(result)) => return Ok(result),
                    Ok(None) => Ok(()),
                    Err(err) => Err(err),
                },
            };

            if let Err(err) = step {
                self.raise(err, base)?;
            }
        }
    }

    // -------------------------------------------------------------------
    // Stack and frame helpers
    // -------------------------------------------------------------------

    fn frame(&self) -> &Frame {
        self.frames.last().expect("active frame")
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("active frame")
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Nil)
    }

    fn peek(&self, depth: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - depth]
    }

    // -------------------------------------------------------------------
    // Calls and returns
    // -------------------------------------------------------------------

    fn op_call(&mut self, argc: usize) -> Result<(), VmError> {
        let args = self.stack.split_off(self.stack.len() - argc);
        let callee = self.pop();
        self.call_with(callee, args)
    }

    fn op_call_spread(&mut self) -> Result<(), VmError> {
        let list = self.pop();
        let Value::List(items) = list else {
            return Err(VmError::fatal(
                ErrorKind::Runtime,
                "spread call expects an argument list",
            ));
        };
        let args = items.borrow().clone();
        let callee = self.pop();
        self.call_with(callee, args)
    }

    fn call_with(&mut self, callee: Value, args: Vec<Value>) -> Result<(), VmError> {
        if args.len() > MAX_ARGS {
            return Err(VmError::args_error(format!(
                "functions take at most {} arguments ({} given)",
                MAX_ARGS,
                args.len()
            )));
        }
        match callee {
            Value::Closure(closure) => self.enter_frame(closure, args, false),
            Value::Builtin(builtin) => {
                let result = builtin.call(self, &args)?;
                self.push(result);
                Ok(())
            }
            Value::Partial(partial) => {
                let mut full = partial.bound.clone();
                full.extend(args);
                self.call_with(partial.callable.clone(), full)
            }
            other => Err(VmError::type_error(format!(
                "object is not callable (got {})",
                other.type_name()
            ))),
        }
    }

    fn enter_frame(
        &mut self,
        closure: Rc<Closure>,
        args: Vec<Value>,
        host_entry: bool,
    ) -> Result<(), VmError> {
        let code = closure.code.clone();
        let locals = bind_args(&code, args)?;

        if self.frames.len() >= self.max_frame_depth {
            return Err(VmError::fatal(
                ErrorKind::Runtime,
                format!(
                    "stack overflow: maximum call depth of {} exceeded",
                    self.max_frame_depth
                ),
            ));
        }

        self.observe_call(&code)?;

        let call_ip = self
            .frames
            .last()
            .map(|frame| frame.ip.saturating_sub(1))
            .unwrap_or(0);
        let mut frame = Frame::new(code, self.stack.len(), call_ip, host_entry, Some(closure.clone()));
        for (slot, value) in locals.into_iter().enumerate() {
            frame.locals.set(slot, value);
        }
        if let Some(slot) = frame.code.self_slot {
            frame.store_local(slot as usize, Value::Closure(closure));
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Complete a `return`, first routing it through any finally blocks of
    /// the current frame that have not yet executed. Returns `Some` when
    /// control leaves this dispatch invocation.
    fn perform_return(
        &mut self,
        value: Value,
        _base: usize,
    ) -> Result<Option<Value>, VmError> {
        let depth = self.frames.len();

        while let Some(handler) = self.handlers.last_mut() {
            if handler.frame_depth > depth {
                self.handlers.pop();
                continue;
            }
            if handler.frame_depth < depth {
                break;
            }
            if handler.in_finally {
                // A return out of a running finally overrides whatever was
                // pending in that handler.
                self.handlers.pop();
                continue;
            }
            if let Some(finally_ip) = handler.finally_ip {
                handler.pending_return = Some(value);
                handler.pending_error = None;
                handler.in_catch = false;
                handler.in_finally = true;
                let stack_base = handler.stack_base;
                self.stack.truncate(stack_base);
                self.frame_mut().ip = finally_ip;
                return Ok(None);
            }
            self.handlers.pop();
        }

        self.observe_return()?;

        let frame = self.frames.pop().expect("returning frame");
        self.stack.truncate(frame.base_sp);

        if frame.host_entry {
            if self.frames.is_empty() {
                // Keep the result visible to top_of_stack.
                self.push(value.clone());
            }
            return Ok(Some(value));
        }

        self.push(value);
        Ok(None)
    }

    // -------------------------------------------------------------------
    // Exception engine
    // -------------------------------------------------------------------

    fn op_push_except(&mut self, op_pos: usize, catch_delta: u16, finally_delta: u16) {
        let code = self.frame().code.clone();
        // The operands locate the matching record in the code object's
        // handler table; the raw deltas are the fallback.
        let record = code.handlers.iter().find(|h| h.try_start == op_pos);
        let (catch_ip, finally_ip) = match record {
            Some(record) => (record.catch_start, record.finally_start),
            None => (
                (catch_delta != NO_TARGET).then(|| op_pos + catch_delta as usize),
                (finally_delta != NO_TARGET).then(|| op_pos + finally_delta as usize),
            ),
        };
        self.handlers.push(HandlerFrame {
            code,
            frame_depth: self.frames.len(),
            stack_base: self.stack.len(),
            catch_ip,
            finally_ip,
            in_catch: false,
            in_finally: false,
            pending_error: None,
            pending_return: None,
        });
    }

    /// Clean exit from a try region (or from a catch block): run the
    /// pending finally if one exists, otherwise retire the handler.
    fn op_pop_except(&mut self) -> Result<(), VmError> {
        let pending_finally = {
            let Some(handler) = self.handlers.last_mut() else {
                return Err(VmError::fatal(
                    ErrorKind::Runtime,
                    "exception handler stack underflow",
                ));
            };
            match (handler.finally_ip, handler.in_finally) {
                (Some(finally_ip), false) => {
                    handler.in_catch = false;
                    handler.in_finally = true;
                    Some(finally_ip)
                }
                _ => None,
            }
        };
        match pending_finally {
            Some(finally_ip) => self.frame_mut().ip = finally_ip,
            None => {
                self.handlers.pop();
            }
        }
        Ok(())
    }

    /// End of a finally block: dispatch whatever was parked on the
    /// handler. Returns `Some` when a pending return leaves this dispatch.
    fn op_end_finally(&mut self, base: usize) -> Result<Option<Value>, VmError> {
        let Some(handler) = self.handlers.pop() else {
            return Err(VmError::fatal(
                ErrorKind::Runtime,
                "exception handler stack underflow",
            ));
        };
        if let Some(value) = handler.pending_return {
            return self.perform_return(value, base);
        }
        if let Some(err) = handler.pending_error {
            self.raise(err, base)?;
        }
        Ok(None)
    }

    /// Unwind with `err`: walk the handler stack for a catch or finally to
    /// run; otherwise propagate out of this dispatch invocation.
    fn raise(&mut self, mut err: VmError, base: usize) -> Result<(), VmError> {
        if err.fatal {
            return Err(self.finalize(err, base));
        }

        // Annotate once, at the original raise site.
        if err.error.span.is_none() {
            err.error.span = self.current_span();
        }
        if err.error.trace.is_empty() {
            err.error.trace = self.capture_trace();
        }
        let payload = err.payload.clone().unwrap_or_else(|| {
            Value::Error(Rc::new(crate::value::ErrorValue {
                kind: err.kind(),
                message: err.message().into(),
                context: None,
            }))
        });

        loop {
            let Some(top) = self.handlers.last() else {
                break;
            };
            // Below this dispatch invocation: the caller's loop owns it.
            if top.frame_depth < base {
                break;
            }
            // Stale: the owning frame already returned.
            if top.frame_depth > self.frames.len() {
                self.handlers.pop();
                continue;
            }
            let owner = &self.frames[top.frame_depth - 1];
            if !Rc::ptr_eq(&top.code, &owner.code) {
                self.handlers.pop();
                continue;
            }

            // Unwind callee frames above the handler's frame.
            while self.frames.len() > top.frame_depth {
                let frame = self.frames.pop().expect("unwound frame");
                self.stack.truncate(frame.base_sp);
            }

            let handler = self.handlers.last_mut().expect("handler");
            if handler.in_finally {
                // The finally body itself threw: the new error replaces any
                // pending error or return, and matches outer handlers only.
                self.handlers.pop();
                continue;
            }

            if let (Some(catch_ip), false) = (handler.catch_ip, handler.in_catch) {
                handler.in_catch = true;
                let stack_base = handler.stack_base;
                // The handler survives catch entry only when a finally
                // still has to run, so return-in-catch can reach it.
                if handler.finally_ip.is_none() {
                    self.handlers.pop();
                }
                self.stack.truncate(stack_base);
                self.push(payload);
                self.frame_mut().ip = catch_ip;
                return Ok(());
            }

            if let (Some(finally_ip), false) = (handler.finally_ip, handler.in_finally) {
                handler.pending_error = Some(err);
                handler.pending_return = None;
                handler.in_catch = false;
                handler.in_finally = true;
                let stack_base = handler.stack_base;
                self.stack.truncate(stack_base);
                self.frame_mut().ip = finally_ip;
                return Ok(());
            }

            self.handlers.pop();
        }

        Err(self.finalize(err, base))
    }

    /// Leave this dispatch invocation with an error: unwind frames down to
    /// the invocation floor and drop handlers that belong above it.
    fn finalize(&mut self, err: VmError, base: usize) -> VmError {
        while self.frames.len() >= base {
            let frame = self.frames.pop().expect("frame");
            self.stack.truncate(frame.base_sp);
        }
        self.handlers.retain(|h| h.frame_depth < base);
        err
    }

    // -------------------------------------------------------------------
    // Attribute and aggregate ops
    // -------------------------------------------------------------------

    fn op_load_attr(&mut self, name_index: usize, or_nil: bool) -> Result<(), VmError> {
        let object = self.pop();
        let name = self.frame().code.names[name_index].clone();
        match self.get_attr(&object, &name) {
            Ok(value) => {
                self.push(value);
                Ok(())
            }
            Err(err) if or_nil && !err.fatal => {
                self.push(Value::Nil);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn get_attr(&mut self, object: &Value, name: &str) -> Result<Value, VmError> {
        if let Some(method) = builtins::lookup_method(object, name) {
            return Ok(method);
        }
        match object {
            Value::Map(map) => {
                if let Some(value) = map.borrow().get(name) {
                    return Ok(value.clone());
                }
            }
            Value::Error(err) => match name {
                "message" => return Ok(Value::String(err.message.clone())),
                "kind" => return Ok(Value::string(err.kind.to_string())),
                "context" => return Ok(err.context.clone().unwrap_or(Value::Nil)),
                _ => {}
            },
            Value::Host(host) => {
                if let Some(value) = host.get_attr(name) {
                    return Ok(value);
                }
            }
            _ => {}
        }

        let mut err = VmError::type_error(format!(
            "attribute \"{}\" not found on {} object",
            name,
            object.type_name()
        ));
        if let Some(hint) = suggestion_hint(name, builtins::attr_candidates(object)) {
            err = err.with_hint(hint);
        }
        Err(err)
    }

    fn op_store_attr(&mut self, name_index: usize) -> Result<(), VmError> {
        let value = self.pop();
        let object = self.pop();
        let name = self.frame().code.names[name_index].clone();
        match &object {
            Value::Map(map) => {
                map.borrow_mut().insert(name.into(), value);
                Ok(())
            }
            other => Err(VmError::type_error(format!(
                "cannot set attribute \"{}\" on {} object",
                name,
                other.type_name()
            ))),
        }
    }

    fn op_build_map(&mut self, count: usize) -> Result<(), VmError> {
        let flat = self.stack.split_off(self.stack.len() - count * 2);
        let mut map = MapValue::new();
        for pair in flat.chunks_exact(2) {
            let Value::String(key) = &pair[0] else {
                return Err(VmError::type_error(format!(
                    "map keys must be strings, got {}",
                    pair[0].type_name()
                )));
            };
            map.insert(key.clone(), pair[1].clone());
        }
        self.push(Value::map(map));
        Ok(())
    }

    fn op_list_append(&mut self) -> Result<(), VmError> {
        let item = self.pop();
        match self.peek(0) {
            Value::List(items) => {
                items.borrow_mut().push(item);
                Ok(())
            }
            other => Err(VmError::type_error(format!(
                "cannot append to {}",
                other.type_name()
            ))),
        }
    }

    fn op_list_extend(&mut self) -> Result<(), VmError> {
        let source = self.pop();
        let Value::List(target) = self.peek(0).clone() else {
            return Err(VmError::type_error("cannot extend a non-list".to_string()));
        };
        match &source {
            Value::List(items) => {
                target.borrow_mut().extend(items.borrow().iter().cloned());
                Ok(())
            }
            // Maps spread their keys, in sorted order.
            Value::Map(map) => {
                target
                    .borrow_mut()
                    .extend(map.borrow().keys().map(|k| Value::String(k.clone())));
                Ok(())
            }
            Value::String(s) => {
                target
                    .borrow_mut()
                    .extend(s.chars().map(|c| Value::string(c.to_string())));
                Ok(())
            }
            other => Err(VmError::type_error(format!(
                "cannot spread {} into a list",
                other.type_name()
            ))),
        }
    }

    fn op_map_merge(&mut self) -> Result<(), VmError> {
        let source = self.pop();
        let Value::Map(target) = self.peek(0).clone() else {
            return Err(VmError::type_error("cannot merge into a non-map".to_string()));
        };
        match &source {
            Value::Map(map) => {
                for (key, value) in map.borrow().iter() {
                    target.borrow_mut().insert(key.clone(), value.clone());
                }
                Ok(())
            }
            other => Err(VmError::type_error(format!(
                "cannot spread {} into a map",
                other.type_name()
            ))),
        }
    }

    fn op_map_set(&mut self) -> Result<(), VmError> {
        let value = self.pop();
        let key = self.pop();
        let Value::Map(target) = self.peek(0).clone() else {
            return Err(VmError::type_error("cannot set entry on a non-map".to_string()));
        };
        let Value::String(key) = key else {
            return Err(VmError::type_error(format!(
                "map keys must be strings, got {}",
                key.type_name()
            )));
        };
        target.borrow_mut().insert(key, value);
        Ok(())
    }

    fn op_store_index(&mut self) -> Result<(), VmError> {
        let value = self.pop();
        let index = self.pop();
        let object = self.pop();
        match (&object, &index) {
            (Value::List(items), Value::Int(i)) => {
                let mut items = items.borrow_mut();
                let len = items.len() as i64;
                let at = if *i < 0 { len + i } else { *i };
                if at < 0 || at >= len {
                    return Err(VmError::value_error("index out of range"));
                }
                items[at as usize] = value;
                Ok(())
            }
            (Value::Map(map), Value::String(key)) => {
                map.borrow_mut().insert(key.clone(), value);
                Ok(())
            }
            (Value::Map(_), other) => Err(VmError::type_error(format!(
                "map keys must be strings, got {}",
                other.type_name()
            ))),
            (other, _) => Err(VmError::type_error(format!(
                "cannot assign into {}",
                other.type_name()
            ))),
        }
    }

    fn op_unpack(&mut self, count: usize) -> Result<(), VmError> {
        let value = self.pop();
        let Value::List(items) = &value else {
            return Err(VmError::type_error(format!(
                "cannot unpack {}",
                value.type_name()
            )));
        };
        let items = items.borrow();
        if items.len() > count {
            return Err(VmError::value_error(format!(
                "too many values to unpack (expected {}, got {})",
                count,
                items.len()
            )));
        }
        // Missing positions pad with nil so defaults can apply.
        for i in (0..count).rev() {
            self.push(items.get(i).cloned().unwrap_or(Value::Nil));
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Closures
    // -------------------------------------------------------------------

    fn op_make_cell(&mut self, index: usize, depth: usize) -> Result<(), VmError> {
        if depth == 0 {
            let cell = self.frame_mut().promote_local(index);
            self.push(Value::Cell(cell));
            return Ok(());
        }
        let Some(closure) = &self.frame().closure else {
            return Err(VmError::fatal(
                ErrorKind::Runtime,
                "cell capture outside a closure frame",
            ));
        };
        let cell = closure.captures[index].clone();
        self.push(Value::Cell(cell));
        Ok(())
    }

    fn op_load_closure(&mut self, const_index: usize, capture_count: usize) -> Result<(), VmError> {
        let mut captures = Vec::with_capacity(capture_count);
        for _ in 0..capture_count {
            match self.pop() {
                Value::Cell(cell) => captures.push(cell),
                other => {
                    return Err(VmError::fatal(
                        ErrorKind::Runtime,
                        format!("closure capture must be a cell, got {}", other.type_name()),
                    ))
                }
            }
        }
        captures.reverse();

        let Constant::Function(code) = &self.frame().code.constants[const_index] else {
            return Err(VmError::fatal(
                ErrorKind::Runtime,
                "closure constant is not a function",
            ));
        };
        let closure = Closure::new(code.clone(), captures);
        self.push(Value::Closure(Rc::new(closure)));
        Ok(())
    }

    fn op_load_free(&mut self, index: usize) -> Result<(), VmError> {
        let Some(closure) = &self.frame().closure else {
            return Err(VmError::fatal(
                ErrorKind::Runtime,
                "free variable outside a closure frame",
            ));
        };
        let value = closure.captures[index].borrow().clone();
        self.push(value);
        Ok(())
    }

    fn op_store_free(&mut self, index: usize) -> Result<(), VmError> {
        let value = self.pop();
        let Some(closure) = &self.frame().closure else {
            return Err(VmError::fatal(
                ErrorKind::Runtime,
                "free variable outside a closure frame",
            ));
        };
        *closure.captures[index].borrow_mut() = value;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Observer dispatch
    // -------------------------------------------------------------------

    fn observe_step(&mut self) -> Result<(), VmError> {
        let Some(mut observer) = self.observer.take() else {
            return Ok(());
        };

        let fire = match self.observer_config.mode {
            ObserveMode::None => false,
            ObserveMode::All => true,
            ObserveMode::Sampled(stride) => {
                self.sample_counter += 1;
                if self.sample_counter >= stride {
                    self.sample_counter = 0;
                    true
                } else {
                    false
                }
            }
            ObserveMode::OnLine => {
                let frame = self.frames.last().expect("active frame");
                let line = frame
                    .code
                    .location(frame.ip)
                    .map(|l| l.line)
                    .unwrap_or(0);
                if line == 0 {
                    false
                } else {
                    let key = (Rc::as_ptr(&frame.code) as usize, line);
                    if self.last_line != Some(key) {
                        self.last_line = Some(key);
                        true
                    } else {
                        false
                    }
                }
            }
        };

        let mut halted = false;
        if fire {
            let frame = self.frames.last().expect("active frame");
            let location = frame.code.location(frame.ip).unwrap_or_default();
            let event = StepEvent {
                ip: frame.ip,
                line: location.line,
                depth: self.frames.len(),
                function: &frame.code.name,
                file: &frame.code.file,
            };
            halted = !observer.on_step(&event);
        }

        self.observer = Some(observer);
        if halted {
            Err(VmError::halted_by_observer())
        } else {
            Ok(())
        }
    }

    fn observe_call(&mut self, code: &Code) -> Result<(), VmError> {
        if !self.observer_config.observe_calls {
            return Ok(());
        }
        let Some(mut observer) = self.observer.take() else {
            return Ok(());
        };
        let event = CallEvent {
            function: &code.name,
            depth: self.frames.len() + 1,
        };
        let keep_going = observer.on_call(&event);
        self.observer = Some(observer);
        if keep_going {
            Ok(())
        } else {
            Err(VmError::halted_by_observer())
        }
    }

    fn observe_return(&mut self) -> Result<(), VmError> {
        if !self.observer_config.observe_returns {
            return Ok(());
        }
        let Some(mut observer) = self.observer.take() else {
            return Ok(());
        };
        let frame = self.frames.last().expect("returning frame");
        let event = ReturnEvent {
            function: &frame.code.name,
            depth: self.frames.len(),
        };
        let keep_going = observer.on_return(&event);
        self.observer = Some(observer);
        if keep_going {
            Ok(())
        } else {
            Err(VmError::halted_by_observer())
        }
    }

    // -------------------------------------------------------------------
    // Diagnostics
    // -------------------------------------------------------------------

    fn current_span(&self) -> Option<SourceSpan> {
        let frame = self.frames.last()?;
        let location = frame.code.location(frame.ip.saturating_sub(1))?;
        if location.line == 0 {
            return None;
        }
        let mut span = SourceSpan::new(frame.code.file.to_string(), location.line, location.column);
        if location.end_column > location.column {
            span = span.with_end_column(location.end_column);
        }
        if let Some(text) = frame.code.line_text(location.line) {
            span = span.with_source_line(text);
        }
        Some(span)
    }

    fn capture_trace(&self) -> Vec<TraceFrame> {
        let count = self.frames.len();
        let mut trace = Vec::with_capacity(count);
        for (i, frame) in self.frames.iter().enumerate().rev() {
            let ip = if i + 1 == count {
                frame.ip.saturating_sub(1)
            } else {
                self.frames[i + 1].call_ip
            };
            let location = frame.code.location(ip).unwrap_or_default();
            trace.push(TraceFrame {
                function: frame.code.name.clone(),
                file: frame.code.file.to_string(),
                line: location.line,
                column: location.column,
            });
        }
        trace
    }
}

impl HostContext for Vm {
    fn call_value(&mut self, func: &Value, args: &[Value]) -> Result<Value, VmError> {
        self.invoke_value(func, args.to_vec())
    }
}

// ---------------------------------------------------------------------
// Free functions: argument binding, operators, indexing
// ---------------------------------------------------------------------

fn constant_value(constant: &Constant) -> Value {
    match constant {
        Constant::Nil => Value::Nil,
        Constant::Bool(b) => Value::Bool(*b),
        Constant::Int(n) => Value::Int(*n),
        Constant::Float(n) => Value::Float(*n),
        Constant::String(s) => Value::String(s.clone()),
        Constant::Function(code) => Value::Closure(Rc::new(Closure::new(code.clone(), Vec::new()))),
    }
}

fn function_label(code: &Code) -> &str {
    if code.name.is_empty() {
        "anonymous"
    } else {
        &code.name
    }
}

/// Check arity and produce the initial local slots: positional args,
/// defaults for the missing tail, and the rest list when declared.
fn bind_args(code: &Code, mut args: Vec<Value>) -> Result<Vec<Value>, VmError> {
    let nparams = code.params.len();
    let required = code.required_args();

    if code.rest_param.is_some() {
        if args.len() < required {
            return Err(VmError::args_error(format!(
                "function \"{}\" takes at least {} arguments ({} given)",
                function_label(code),
                required,
                args.len()
            )));
        }
        let rest = if args.len() > nparams {
            args.split_off(nparams)
        } else {
            Vec::new()
        };
        while args.len() < nparams {
            let param = &code.params[args.len()];
            args.push(
                param
                    .default
                    .as_ref()
                    .map(constant_value)
                    .unwrap_or(Value::Nil),
            );
        }
        args.push(Value::list(rest));
        return Ok(args);
    }

    if args.len() < required || args.len() > nparams {
        let expected = if required == nparams {
            format!("{}", nparams)
        } else {
            format!("{} to {}", required, nparams)
        };
        return Err(VmError::args_error(format!(
            "function \"{}\" takes {} arguments ({} given)",
            function_label(code),
            expected,
            args.len()
        )));
    }
    while args.len() < nparams {
        let param = &code.params[args.len()];
        args.push(
            param
                .default
                .as_ref()
                .map(constant_value)
                .unwrap_or(Value::Nil),
        );
    }
    Ok(args)
}

/// Coerce a thrown value into an unwinding error. Errors pass through;
/// strings become the message; anything else uses its inspection form.
fn throw_value(value: Value) -> VmError {
    match &value {
        Value::Error(err) => {
            VmError::new(err.kind, err.message.to_string()).with_payload(value.clone())
        }
        Value::String(s) => {
            let message = s.to_string();
            VmError::runtime(message.clone()).with_payload(Value::error(message))
        }
        other => {
            let message = other.inspect();
            VmError::runtime(message.clone()).with_payload(Value::error(message))
        }
    }
}

fn unsupported(op: BinOp, left: &Value, right: &Value) -> VmError {
    VmError::type_error(format!(
        "unsupported operation for {}: {} on type {}",
        left.type_name(),
        op,
        right.type_name()
    ))
}

fn binary(op: BinOp, left: Value, right: Value) -> Result<Value, VmError> {
    match op {
        BinOp::Add => match (&left, &right) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(*b))),
            (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
            (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 + b)),
            (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a + *b as f64)),
            (Value::String(a), Value::String(b)) => Ok(Value::string(format!("{}{}", a, b))),
            (Value::List(a), Value::List(b)) => {
                let mut joined = a.borrow().clone();
                joined.extend(b.borrow().iter().cloned());
                Ok(Value::list(joined))
            }
            _ => Err(unsupported(op, &left, &right)),
        },
        BinOp::Sub => match (&left, &right) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_sub(*b))),
            (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a - b)),
            (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 - b)),
            (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a - *b as f64)),
            _ => Err(unsupported(op, &left, &right)),
        },
        BinOp::Mul => match (&left, &right) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_mul(*b))),
            (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a * b)),
            (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 * b)),
            (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a * *b as f64)),
            (Value::String(s), Value::Int(n)) if *n >= 0 => {
                Ok(Value::string(s.repeat(*n as usize)))
            }
            _ => Err(unsupported(op, &left, &right)),
        },
        BinOp::Div => {
            let (Some(a), Some(b)) = (as_number(&left), as_number(&right)) else {
                return Err(unsupported(op, &left, &right));
            };
            if b == 0.0 {
                return Err(VmError::value_error("division by zero"));
            }
            Ok(Value::Float(a / b))
        }
        BinOp::Rem => match (&left, &right) {
            (Value::Int(a), Value::Int(b)) => {
                if *b == 0 {
                    return Err(VmError::value_error("division by zero"));
                }
                Ok(Value::Int(a.wrapping_rem(*b)))
            }
            _ => {
                let (Some(a), Some(b)) = (as_number(&left), as_number(&right)) else {
                    return Err(unsupported(op, &left, &right));
                };
                if b == 0.0 {
                    return Err(VmError::value_error("division by zero"));
                }
                Ok(Value::Float(a % b))
            }
        },
        BinOp::Pow => match (&left, &right) {
            (Value::Int(a), Value::Int(b)) if *b >= 0 => {
                let result = u32::try_from(*b)
                    .ok()
                    .and_then(|exp| a.checked_pow(exp))
                    .map(Value::Int)
                    .unwrap_or_else(|| Value::Float((*a as f64).powf(*b as f64)));
                Ok(result)
            }
            _ => {
                let (Some(a), Some(b)) = (as_number(&left), as_number(&right)) else {
                    return Err(unsupported(op, &left, &right));
                };
                Ok(Value::Float(a.powf(b)))
            }
        },
        BinOp::BitAnd => int_op(op, &left, &right, |a, b| Ok(a & b)),
        BinOp::BitOr => int_op(op, &left, &right, |a, b| Ok(a | b)),
        BinOp::BitXor => int_op(op, &left, &right, |a, b| Ok(a ^ b)),
        BinOp::Shl => int_op(op, &left, &right, |a, b| {
            if b < 0 {
                return Err(VmError::value_error("negative shift amount"));
            }
            Ok(u32::try_from(b)
                .ok()
                .and_then(|shift| a.checked_shl(shift))
                .unwrap_or(0))
        }),
        BinOp::Shr => int_op(op, &left, &right, |a, b| {
            if b < 0 {
                return Err(VmError::value_error("negative shift amount"));
            }
            if b >= 64 {
                return Ok(if a < 0 { -1 } else { 0 });
            }
            Ok(a >> b)
        }),
    }
}

fn int_op(
    op: BinOp,
    left: &Value,
    right: &Value,
    f: impl Fn(i64, i64) -> Result<i64, VmError>,
) -> Result<Value, VmError> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => f(*a, *b).map(Value::Int),
        _ => Err(unsupported(op, left, right)),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Int(n) => Some(*n as f64),
        Value::Float(n) => Some(*n),
        _ => None,
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<Value, VmError> {
    let result = match op {
        CmpOp::Eq => left.equals(right),
        CmpOp::Ne => !left.equals(right),
        ordering => {
            let Some(cmp) = left.compare(right) else {
                return Err(VmError::type_error(format!(
                    "unsupported operation for {}: {} on type {}",
                    left.type_name(),
                    op,
                    right.type_name()
                )));
            };
            match ordering {
                CmpOp::Lt => cmp.is_lt(),
                CmpOp::Le => cmp.is_le(),
                CmpOp::Gt => cmp.is_gt(),
                CmpOp::Ge => cmp.is_ge(),
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            }
        }
    };
    Ok(Value::Bool(result))
}

fn contains(container: &Value, item: &Value) -> Result<bool, VmError> {
    match container {
        Value::List(items) => Ok(items.borrow().iter().any(|entry| entry.equals(item))),
        Value::Map(map) => match item {
            Value::String(key) => Ok(map.borrow().contains_key(key)),
            _ => Ok(false),
        },
        Value::String(text) => match item {
            Value::String(needle) => Ok(text.contains(needle.as_ref())),
            other => Err(VmError::type_error(format!(
                "membership test on string requires a string, got {}",
                other.type_name()
            ))),
        },
        other => Err(VmError::type_error(format!(
            "cannot check membership in {}",
            other.type_name()
        ))),
    }
}

fn index_value(object: &Value, index: &Value) -> Result<Value, VmError> {
    match (object, index) {
        (Value::List(items), Value::Int(i)) => {
            let items = items.borrow();
            let len = items.len() as i64;
            let at = if *i < 0 { len + i } else { *i };
            if at < 0 || at >= len {
                return Err(VmError::value_error("index out of range"));
            }
            Ok(items[at as usize].clone())
        }
        (Value::Map(map), Value::String(key)) => {
            Ok(map.borrow().get(key).cloned().unwrap_or(Value::Nil))
        }
        (Value::Map(_), other) => Err(VmError::type_error(format!(
            "map keys must be strings, got {}",
            other.type_name()
        ))),
        (Value::String(text), Value::Int(i)) => {
            // Strings index by Unicode scalar value.
            let chars: Vec<char> = text.chars().collect();
            let len = chars.len() as i64;
            let at = if *i < 0 { len + i } else { *i };
            if at < 0 || at >= len {
                return Err(VmError::value_error("index out of range"));
            }
            Ok(Value::string(chars[at as usize].to_string()))
        }
        (other, _) => Err(VmError::type_error(format!(
            "cannot index {}",
            other.type_name()
        ))),
    }
}

fn slice_bound(value: &Value, len: i64, default: i64) -> Result<i64, VmError> {
    match value {
        Value::Nil => Ok(default),
        Value::Int(i) => Ok(if *i < 0 { len + i } else { *i }),
        other => Err(VmError::type_error(format!(
            "slice bounds must be integers, got {}",
            other.type_name()
        ))),
    }
}

fn slice_value(object: &Value, low: &Value, high: &Value) -> Result<Value, VmError> {
    match object {
        Value::List(items) => {
            let items = items.borrow();
            let len = items.len() as i64;
            let start = slice_bound(low, len, 0)?;
            let end = slice_bound(high, len, len)?;
            if start < 0 || end < 0 || start > end || end > len {
                return Err(VmError::value_error("slice bounds out of range"));
            }
            Ok(Value::list(items[start as usize..end as usize].to_vec()))
        }
        Value::String(text) => {
            let chars: Vec<char> = text.chars().collect();
            let len = chars.len() as i64;
            let start = slice_bound(low, len, 0)?;
            let end = slice_bound(high, len, len)?;
            if start < 0 || end < 0 || start > end || end > len {
                return Err(VmError::value_error("slice bounds out of range"));
            }
            let text: String = chars[start as usize..end as usize].iter().collect();
            Ok(Value::string(text))
        }
        other => Err(VmError::type_error(format!(
            "cannot slice {}",
            other.type_name()
        ))),
    }
}

fn length_of(value: &Value) -> Result<i64, VmError> {
    match value {
        Value::String(s) => Ok(s.chars().count() as i64),
        Value::List(items) => Ok(items.borrow().len() as i64),
        Value::Map(map) => Ok(map.borrow().len() as i64),
        other => Err(VmError::type_error(format!(
            "cannot take the length of {}",
            other.type_name()
        ))),
    }
}

fn classify_panic(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("divide by zero")
        || lower.contains("division by zero")
        || lower.contains("index out of")
        || lower.contains("overflow")
    {
        ErrorKind::Value
    } else {
        ErrorKind::Runtime
    }
}
