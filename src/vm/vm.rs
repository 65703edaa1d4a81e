//! The bytecode virtual machine: stack-based execution engine.

use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::config::VmConfig;
use crate::error::{ConfigError, Raised};
use crate::logging::VM_TARGET;

use super::chunk::{CompiledModule, Constant, FunctionProto};
use super::core::{Core, Special};
use super::heap::Heap;
use super::object::{
    GeneratorState, NativeFn, ObjClass, ObjClosure, ObjFunction, ObjGenerator, ObjList, ObjModule,
    ObjTuple, Object,
};
use super::opcode::Op;
use super::operators::BinaryOperator;
use super::table::{StrKey, Table};
use super::upvalue::Upvalue;
use super::value::{ObjRef, Value};

/// Unwind cause pushed for an except/ensure handler: an exception is in
/// flight.
pub(crate) const CAUSE_EXCEPT: f64 = 0.0;
/// Unwind cause pushed for an ensure handler run by `return`.
pub(crate) const CAUSE_RETURN: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Except,
    Ensure,
}

/// An exception handler installed by `SetupExcept`/`SetupEnsure`.
#[derive(Debug, Clone, Copy)]
pub struct Handler {
    pub kind: HandlerKind,
    /// Absolute instruction index of the handler code.
    pub address: usize,
    /// Stack height when the handler was installed.
    pub saved_sp: usize,
}

/// A call frame on the VM call stack.
#[derive(Debug, Clone)]
pub struct CallFrame {
    /// The closure being executed.
    pub closure: ObjRef,
    /// The closure's function object (constants and module).
    pub function: ObjRef,
    pub proto: Rc<FunctionProto>,
    /// Stack index of slot 0 (the callee or receiver).
    pub base: usize,
    /// Instruction pointer (index into chunk.code).
    pub ip: usize,
    pub handlers: Vec<Handler>,
    /// Set while the frame runs the body of a resumed generator.
    pub generator: Option<ObjRef>,
}

/// Registry key of a host function: module, optional class, name.
pub(crate) type NativeKey = (String, Option<String>, String);

/// Host callback loading modules that are not registered yet.
pub type ImportResolver = Box<dyn FnMut(&str) -> Option<CompiledModule>>;

/// The bytecode VM.
pub struct Vm {
    /// Value stack.
    pub(crate) stack: Vec<Value>,
    /// Call frame stack.
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) heap: Heap,
    /// Open upvalues (pointing to stack slots that are still live).
    pub(crate) open_upvalues: Vec<ObjRef>,
    /// Loaded modules by name.
    pub(crate) modules: Table,
    pub(crate) core: Core,
    /// Stack index of slot 0 for the running native or API caller.
    pub(crate) api_base: usize,
    pub(crate) natives: IndexMap<NativeKey, NativeFn>,
    pub(crate) import_resolver: Option<ImportResolver>,
    pub(crate) interrupt: Arc<AtomicBool>,
    /// Nesting of host-to-script calls.
    pub(crate) reentrant: usize,
    pub(crate) config: VmConfig,
    /// Collect `print` output instead of writing it to stdout.
    pub capture_output: bool,
    /// Output buffer for print statements (for testing/capture).
    pub output: Vec<String>,
}

impl Vm {
    pub fn new() -> Self {
        Self::build(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: VmConfig) -> Self {
        let mut heap = Heap::new(
            config.first_gc_threshold,
            config.heap_grow_rate,
            config.max_heap_bytes,
        );
        let core = super::core::bootstrap(&mut heap);

        let mut modules = Table::new();
        let core_name = heap.intern_key(super::core::CORE_MODULE);
        modules.put(core_name, Value::Obj(core.module));

        Self {
            stack: Vec::with_capacity(config.initial_stack),
            frames: Vec::with_capacity(64),
            heap,
            open_upvalues: Vec::new(),
            modules,
            core,
            api_base: 0,
            natives: IndexMap::new(),
            import_resolver: None,
            interrupt: Arc::new(AtomicBool::new(false)),
            reentrant: 0,
            config,
            capture_output: false,
            output: Vec::new(),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    // --- Stack helpers ---

    #[inline]
    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Null)
    }

    /// Value `distance` slots below the top.
    #[inline]
    pub(crate) fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    #[inline]
    pub(crate) fn frame(&self) -> &CallFrame {
        &self.frames[self.frames.len() - 1]
    }

    #[inline]
    pub(crate) fn frame_mut(&mut self) -> &mut CallFrame {
        let idx = self.frames.len() - 1;
        &mut self.frames[idx]
    }

    pub(crate) fn special(&self, special: Special) -> StrKey {
        self.core.specials[special as usize]
    }

    /// Key of an interned string handle.
    pub(crate) fn string_key(&self, r: ObjRef) -> StrKey {
        match self.heap.string(r) {
            Some(s) => StrKey::new(r, s.hash),
            None => panic!("expected a string handle, found {}", self.heap.get(r).type_name()),
        }
    }

    fn constant(&self, idx: u16) -> Value {
        match self.heap.function(self.frame().function) {
            Some(f) => f.constants[idx as usize],
            None => panic!("frame without a function object"),
        }
    }

    fn constant_key(&self, idx: u16) -> StrKey {
        match self.constant(idx) {
            Value::Obj(r) => self.string_key(r),
            other => panic!("constant {} is not a name: {:?}", idx, other),
        }
    }

    pub(crate) fn current_module(&self) -> ObjRef {
        match self.frames.last() {
            Some(frame) => match self.heap.function(frame.function) {
                Some(f) => f.module,
                None => self.core.module,
            },
            None => self.core.module,
        }
    }

    fn frame_upvalue(&self, idx: u16) -> ObjRef {
        match self.heap.closure(self.frame().closure) {
            Some(c) => c.upvalues[idx as usize],
            None => panic!("frame without a closure"),
        }
    }

    // --- Upvalues ---

    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        for &uv in &self.open_upvalues {
            if let Some(Upvalue::Open(open)) = self.heap.upvalue(uv) {
                if *open == slot {
                    return uv;
                }
            }
        }
        let uv = self.alloc(Object::Upvalue(Upvalue::Open(slot)));
        self.open_upvalues.push(uv);
        uv
    }

    /// Close every open upvalue pointing at `from` or above.
    pub(crate) fn close_upvalues(&mut self, from: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let uv = self.open_upvalues[i];
            match self.heap.upvalue(uv).and_then(Upvalue::open_slot) {
                Some(slot) if slot >= from => {
                    let value = self.stack[slot];
                    if let Some(cell) = self.heap.upvalue_mut(uv) {
                        *cell = Upvalue::Closed(value);
                    }
                    self.open_upvalues.swap_remove(i);
                }
                _ => i += 1,
            }
        }
    }

    // --- Module loading ---

    /// Register (or reuse) module `name` and materialize `compiled` into it.
    /// Returns the closure of the module's top-level code.
    pub(crate) fn load_compiled(&mut self, name: StrKey, compiled: &CompiledModule) -> ObjRef {
        self.heap.disable_gc();

        let module = match self.modules.get(name).and_then(|v| v.as_obj()) {
            Some(existing) => existing,
            None => {
                let globals = match self.heap.module(self.core.module) {
                    Some(core) => core.globals.clone(),
                    None => Table::new(),
                };
                let module = self.alloc(Object::Module(ObjModule {
                    name: name.handle,
                    globals,
                }));
                self.modules.put(name, Value::Obj(module));
                module
            }
        };

        let function = self.materialize(&compiled.main, module);
        let closure = self.alloc(Object::Closure(ObjClosure {
            function,
            upvalues: Vec::new(),
        }));

        self.heap.enable_gc();
        tracing::debug!(
            target: VM_TARGET,
            file = %compiled.file,
            live_objects = self.heap.live_objects(),
            "loaded module"
        );
        closure
    }

    fn materialize(&mut self, proto: &Rc<FunctionProto>, module: ObjRef) -> ObjRef {
        let constants = proto
            .chunk
            .constants
            .iter()
            .map(|c| self.constant_value(c, module))
            .collect();
        let defaults = proto
            .defaults
            .iter()
            .map(|c| self.constant_value(c, module))
            .collect();
        self.alloc(Object::Function(ObjFunction {
            proto: proto.clone(),
            constants,
            defaults,
            module,
        }))
    }

    pub(crate) fn constant_value(&mut self, constant: &Constant, module: ObjRef) -> Value {
        match constant {
            Constant::Number(n) => Value::Number(*n),
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Null => Value::Null,
            Constant::String(s) => Value::Obj(self.intern(s.as_bytes())),
            Constant::Function(proto) => Value::Obj(self.materialize(proto, module)),
            // Resolved when the `Native` instruction runs
            Constant::Native(_) => Value::Null,
        }
    }

    // --- Dispatch ---

    /// Run until the frame count drops back to `depth`. On `Err` the
    /// exception is on top of the stack.
    pub(crate) fn run(&mut self, depth: usize) -> Result<(), Raised> {
        loop {
            let (proto, ip) = {
                let frame = self.frame_mut();
                let ip = frame.ip;
                frame.ip += 1;
                (frame.proto.clone(), ip)
            };
            let op = &proto.chunk.code[ip];

            if self.config.trace_execution {
                tracing::trace!(
                    target: VM_TARGET,
                    function = proto.display_name(),
                    ip,
                    ?op,
                    stack = self.stack.len(),
                    "exec"
                );
            }

            match self.dispatch(op, depth) {
                Ok(false) => {}
                Ok(true) => return Ok(()),
                Err(Raised) => {
                    if !self.unwind_stack(depth) {
                        return Err(Raised);
                    }
                }
            }
        }
    }

    /// Execute one instruction. Returns true once the frame at `depth`
    /// has returned.
    fn dispatch(&mut self, op: &Op, depth: usize) -> Result<bool, Raised> {
        match op {
            Op::Constant(idx) => {
                let value = self.constant(*idx);
                self.push(value);
            }
            Op::Null => self.push(Value::Null),
            Op::True => self.push(Value::Bool(true)),
            Op::False => self.push(Value::Bool(false)),

            Op::Pop => {
                self.pop();
            }
            Op::Dup => {
                let value = self.peek(0);
                self.push(value);
            }
            Op::Dup2 => {
                let (a, b) = (self.peek(1), self.peek(0));
                self.push(a);
                self.push(b);
            }

            Op::GetLocal(slot) => {
                let value = self.stack[self.frame().base + *slot as usize];
                self.push(value);
            }
            Op::SetLocal(slot) => {
                let idx = self.frame().base + *slot as usize;
                self.stack[idx] = self.peek(0);
            }
            Op::GetGlobal(idx) => {
                let key = self.constant_key(*idx);
                let module = self.current_module();
                match self.heap.module(module).and_then(|m| m.globals.get(key)) {
                    Some(value) => self.push(value),
                    None => return Err(self.name_error(module, key)),
                }
            }
            Op::SetGlobal(idx) => {
                let key = self.constant_key(*idx);
                let module = self.current_module();
                let value = self.peek(0);
                let defined = match self.heap.module_mut(module) {
                    Some(m) if m.globals.contains_key(key) => {
                        m.globals.put(key, value);
                        true
                    }
                    _ => false,
                };
                if !defined {
                    return Err(self.name_error(module, key));
                }
            }
            Op::DefineGlobal(idx) => {
                let key = self.constant_key(*idx);
                let module = self.current_module();
                let value = self.pop();
                if let Some(m) = self.heap.module_mut(module) {
                    m.globals.put(key, value);
                }
                self.heap.resize(module);
            }

            Op::GetUpvalue(idx) => {
                let uv = self.frame_upvalue(*idx);
                let value = match self.heap.upvalue(uv) {
                    Some(Upvalue::Open(slot)) => self.stack[*slot],
                    Some(Upvalue::Closed(value)) => *value,
                    None => Value::Null,
                };
                self.push(value);
            }
            Op::SetUpvalue(idx) => {
                let uv = self.frame_upvalue(*idx);
                let value = self.peek(0);
                match self.heap.upvalue(uv).copied() {
                    Some(Upvalue::Open(slot)) => self.stack[slot] = value,
                    Some(Upvalue::Closed(_)) => {
                        if let Some(cell) = self.heap.upvalue_mut(uv) {
                            *cell = Upvalue::Closed(value);
                        }
                    }
                    None => {}
                }
            }
            Op::CloseUpvalue => {
                let top = self.stack.len() - 1;
                self.close_upvalues(top);
                self.pop();
            }

            Op::GetField(idx) => {
                let key = self.constant_key(*idx);
                let object = self.peek(0);
                let value = self.get_field(object, key)?;
                self.pop();
                self.push(value);
            }
            Op::SetField(idx) => {
                let key = self.constant_key(*idx);
                let value = self.peek(0);
                let object = self.peek(1);
                self.set_field(object, key, value)?;
                self.pop();
                self.pop();
                self.push(value);
            }
            Op::GetSubscript => self.get_subscript()?,
            Op::SetSubscript => self.set_subscript()?,

            Op::Add => self.binary_op(BinaryOperator::Add)?,
            Op::Subtract => self.binary_op(BinaryOperator::Subtract)?,
            Op::Multiply => self.binary_op(BinaryOperator::Multiply)?,
            Op::Divide => self.binary_op(BinaryOperator::Divide)?,
            Op::Modulo => self.binary_op(BinaryOperator::Modulo)?,
            Op::Power => self.binary_op(BinaryOperator::Power)?,
            Op::Negate => self.negate()?,

            Op::BitAnd => self.binary_op(BinaryOperator::BitAnd)?,
            Op::BitOr => self.binary_op(BinaryOperator::BitOr)?,
            Op::Xor => self.binary_op(BinaryOperator::Xor)?,
            Op::ShiftLeft => self.binary_op(BinaryOperator::ShiftLeft)?,
            Op::ShiftRight => self.binary_op(BinaryOperator::ShiftRight)?,
            Op::Invert => self.invert()?,

            Op::Equal => {
                let (a, b) = (self.peek(1), self.peek(0));
                let equal = self.values_equal(a, b)?;
                self.pop();
                self.pop();
                self.push(Value::Bool(equal));
            }
            Op::Less => self.binary_op(BinaryOperator::Less)?,
            Op::LessEqual => self.binary_op(BinaryOperator::LessEqual)?,
            Op::Greater => self.binary_op(BinaryOperator::Greater)?,
            Op::GreaterEqual => self.binary_op(BinaryOperator::GreaterEqual)?,
            Op::Is => {
                let (value, class) = (self.peek(1), self.peek(0));
                let Some(class) = class.as_obj().filter(|r| self.heap.class(*r).is_some()) else {
                    return Err(self.throw(
                        self.core.classes.type_exception,
                        "Right operand of `is` must be a Class",
                    ));
                };
                let result = self.is_instance(value, class);
                self.pop();
                self.pop();
                self.push(Value::Bool(result));
            }

            Op::Not => {
                let value = self.pop();
                self.push(Value::Bool(!value.is_truthy()));
            }

            Op::Jump(offset) => {
                self.frame_mut().ip += *offset as usize;
                self.check_interrupt()?;
            }
            Op::JumpIfFalse(offset) => {
                if !self.pop().is_truthy() {
                    self.frame_mut().ip += *offset as usize;
                }
            }
            Op::JumpIfTrue(offset) => {
                if self.pop().is_truthy() {
                    self.frame_mut().ip += *offset as usize;
                }
            }
            Op::Loop(offset) => {
                self.frame_mut().ip -= *offset as usize;
                self.check_interrupt()?;
            }

            Op::Call0
            | Op::Call1
            | Op::Call2
            | Op::Call3
            | Op::Call4
            | Op::Call5
            | Op::Call6
            | Op::Call7
            | Op::Call8
            | Op::Call9
            | Op::Call10
            | Op::Call(_) => {
                self.check_interrupt()?;
                self.call_value(op.call_argc().unwrap_or(0))?;
            }
            Op::Invoke0(_)
            | Op::Invoke1(_)
            | Op::Invoke2(_)
            | Op::Invoke3(_)
            | Op::Invoke4(_)
            | Op::Invoke5(_)
            | Op::Invoke6(_)
            | Op::Invoke7(_)
            | Op::Invoke8(_)
            | Op::Invoke9(_)
            | Op::Invoke10(_)
            | Op::Invoke(..) => {
                self.check_interrupt()?;
                let (argc, name) = op.invoke_args().unwrap_or((0, 0));
                let key = self.constant_key(name);
                self.invoke(key, argc)?;
            }
            Op::CallUnpack => {
                self.check_interrupt()?;
                let argc = self.unpack_arguments()?;
                self.call_value(argc)?;
            }
            Op::InvokeUnpack(idx) => {
                self.check_interrupt()?;
                let key = self.constant_key(*idx);
                let argc = self.unpack_arguments()?;
                self.invoke(key, argc)?;
            }
            Op::SuperUnpack(idx) => {
                self.check_interrupt()?;
                let key = self.constant_key(*idx);
                let superclass = self.pop();
                let method = self.super_method(superclass, key)?;
                let argc = self.unpack_arguments()?;
                self.call_method_value(method, argc)?;
            }
            Op::Super(argc, idx) => {
                self.check_interrupt()?;
                let key = self.constant_key(*idx);
                let superclass = self.pop();
                let method = self.super_method(superclass, key)?;
                self.call_method_value(method, *argc)?;
            }
            Op::SuperBind(idx) => {
                let key = self.constant_key(*idx);
                let superclass = self.pop();
                let method = self.super_method(superclass, key)?;
                let receiver = self.peek(0);
                let bound = self.bind_method(receiver, method);
                self.pop();
                self.push(bound);
            }
            Op::Return => {
                self.check_interrupt()?;
                let ret = self.pop();
                return Ok(self.return_from_frame(ret, depth));
            }

            Op::Closure(idx, upvalues) => {
                let function = match self.constant(*idx) {
                    Value::Obj(r) => r,
                    other => panic!("closure constant is not a function: {:?}", other),
                };
                let base = self.frame().base;
                let mut captured = Vec::with_capacity(upvalues.len());
                for desc in upvalues {
                    let uv = if desc.is_local {
                        self.capture_upvalue(base + desc.index as usize)
                    } else {
                        self.frame_upvalue(desc.index)
                    };
                    captured.push(uv);
                }
                let closure = self.alloc(Object::Closure(ObjClosure {
                    function,
                    upvalues: captured,
                }));
                self.push(Value::Obj(closure));
            }
            Op::Native(idx) => {
                let native = self.resolve_native(*idx, None)?;
                self.push(Value::Obj(native));
            }

            Op::NewList(count) => {
                let start = self.stack.len() - *count as usize;
                let items = self.stack[start..].to_vec();
                let list = self.alloc(Object::List(ObjList { items }));
                self.stack.truncate(start);
                self.push(Value::Obj(list));
            }
            Op::NewTuple(count) => {
                let start = self.stack.len() - *count as usize;
                let items = self.stack[start..].to_vec().into_boxed_slice();
                let tuple = self.alloc(Object::Tuple(ObjTuple { items }));
                self.stack.truncate(start);
                self.push(Value::Obj(tuple));
            }
            Op::NewTable(count) => self.new_table(*count as usize)?,
            Op::Unpack(count) => self.unpack(*count as usize)?,
            Op::AppendList => {
                let item = self.pop();
                if let Some(list) = self.peek(0).as_obj().and_then(|r| self.heap.list_mut(r)) {
                    list.items.push(item);
                }
                self.resize_top();
            }
            Op::ExtendList => self.extend_list()?,
            Op::ListToTuple => {
                let items = match self.peek(0).as_obj().and_then(|r| self.heap.list(r)) {
                    Some(l) => l.items.clone().into_boxed_slice(),
                    None => Box::default(),
                };
                let tuple = self.alloc(Object::Tuple(ObjTuple { items }));
                self.pop();
                self.push(Value::Obj(tuple));
            }

            Op::GetObject => self.push(Value::Obj(self.core.classes.object)),
            Op::NewClass(idx) => {
                let name = match self.constant(*idx) {
                    Value::Obj(r) => r,
                    other => panic!("class name is not a string: {:?}", other),
                };
                let class = self.alloc(Object::Class(ObjClass {
                    name,
                    superclass: None,
                    methods: Table::new(),
                    builtin: false,
                }));
                self.push(Value::Obj(class));
            }
            Op::Subclass => self.subclass()?,
            Op::DefMethod(idx) => {
                let key = self.constant_key(*idx);
                let method = self.pop();
                let class = self.peek(0);
                self.define_method(class, key, method);
            }
            Op::NativeMethod(idx) => {
                let class = self.peek(0);
                let native = self.resolve_native(*idx, class.as_obj())?;
                let name = match self.heap.native(native) {
                    Some(n) => n.name.clone(),
                    None => String::new(),
                };
                let key = self.heap.intern_key(&name);
                self.define_method(class, key, Value::Obj(native));
            }

            Op::SetupExcept(offset) | Op::SetupEnsure(offset) => {
                let kind = match op {
                    Op::SetupExcept(_) => HandlerKind::Except,
                    _ => HandlerKind::Ensure,
                };
                let saved_sp = self.stack.len();
                let frame = self.frame_mut();
                let address = frame.ip + *offset as usize;
                frame.handlers.push(Handler {
                    kind,
                    address,
                    saved_sp,
                });
            }
            Op::PopHandler => {
                self.frame_mut().handlers.pop();
            }
            Op::EndHandler => {
                // Null cause: the except clause handled it, or no exception
                if !self.peek(0).is_null() {
                    let cause = self.pop().as_number();
                    if cause == Some(CAUSE_RETURN) {
                        let ret = self.pop();
                        return Ok(self.return_from_frame(ret, depth));
                    }
                    // CAUSE_EXCEPT: keep unwinding with the exception on top
                    return Err(Raised);
                }
            }
            Op::Raise => return Err(self.raise_top()),

            Op::ForPrep => self.for_prep()?,
            Op::ForIter => self.for_iter()?,
            Op::ForNext(offset) => self.for_next(*offset)?,

            Op::Generator => {
                let frame = self.frame();
                let (closure, function, ip, base) = (frame.closure, frame.function, frame.ip, frame.base);
                let handlers = relative_handlers(&frame.handlers, base);
                let stack = self.stack[base..].to_vec();
                let generator = self.alloc(Object::Generator(ObjGenerator {
                    closure,
                    function,
                    state: GeneratorState::Started,
                    ip,
                    stack,
                    handlers,
                    last_yield: Value::Null,
                }));
                self.frame_mut().handlers.clear();
                return Ok(self.return_from_frame(Value::Obj(generator), depth));
            }
            Op::Yield => {
                let value = self.pop();
                let Some(frame) = self.frames.pop() else {
                    return Ok(true);
                };
                let Some(generator) = frame.generator else {
                    panic!("yield outside a generator frame");
                };
                self.close_upvalues(frame.base);
                let stack = self.stack.split_off(frame.base);
                if let Some(g) = self.heap.generator_mut(generator) {
                    g.state = GeneratorState::Suspended;
                    g.ip = frame.ip;
                    g.stack = stack;
                    g.handlers = relative_handlers(&frame.handlers, frame.base);
                    g.last_yield = value;
                }
                self.heap.resize(generator);
                self.push(value);
                return Ok(self.frames.len() == depth);
            }
            Op::GeneratorClose => {
                if let Some(generator) = self.frame().generator {
                    self.finish_generator(generator);
                }
            }

            Op::Import(idx) => {
                let key = self.constant_key(*idx);
                self.import(key, true)?;
            }
            Op::ImportFrom(idx) => {
                let key = self.constant_key(*idx);
                self.import(key, false)?;
            }
            Op::ImportName(module_idx, name_idx) => {
                let module_key = self.constant_key(*module_idx);
                let key = self.constant_key(*name_idx);
                let module = self.loaded_module(module_key);
                match self.heap.module(module).and_then(|m| m.globals.get(key)) {
                    Some(value) => self.push(value),
                    None => return Err(self.name_error(module, key)),
                }
            }
            Op::ImportAll(idx) => {
                let key = self.constant_key(*idx);
                let source = self.loaded_module(key);
                let globals = match self.heap.module(source) {
                    Some(m) => m.globals.clone(),
                    None => Table::new(),
                };
                let target = self.current_module();
                if let Some(m) = self.heap.module_mut(target) {
                    m.globals.merge(&globals);
                }
                self.heap.resize(target);
            }
        }
        Ok(false)
    }

    /// Pop the current frame and leave `ret` in its callee slot, unless an
    /// ensure handler has to run first. Returns true when the frame count
    /// reaches `depth`.
    fn return_from_frame(&mut self, ret: Value, depth: usize) -> bool {
        if self.unwind_handlers(ret) {
            return false;
        }
        let Some(frame) = self.frames.pop() else {
            return true;
        };
        if let Some(generator) = frame.generator {
            self.finish_generator(generator);
        }
        self.close_upvalues(frame.base);
        self.stack.truncate(frame.base);
        self.push(ret);
        self.frames.len() == depth
    }

    /// Mark a generator as completed and drop its saved state.
    pub(crate) fn finish_generator(&mut self, generator: ObjRef) {
        if let Some(g) = self.heap.generator_mut(generator) {
            g.state = GeneratorState::Done;
            g.stack = Vec::new();
            g.handlers = Vec::new();
        }
        self.heap.resize(generator);
    }

    /// Stack: `[list, iterable]` → `[list]` with the iterable's items
    /// appended. Lists and tuples are copied directly; anything else goes
    /// through `__iter__`/`__next__`.
    fn extend_list(&mut self) -> Result<(), Raised> {
        let iterable = self.peek(0);
        let direct = match iterable.as_obj().map(|r| self.heap.get(r)) {
            Some(Object::List(l)) => Some(l.items.clone()),
            Some(Object::Tuple(t)) => Some(t.items.to_vec()),
            _ => None,
        };
        if let Some(items) = direct {
            self.pop();
            if let Some(list) = self.peek(0).as_obj().and_then(|r| self.heap.list_mut(r)) {
                list.items.extend(items);
            }
            self.resize_top();
            return Ok(());
        }

        let class = self.get_class(iterable);
        let (iter_key, next_key) = (self.special(Special::Iter), self.special(Special::Next));
        let Some(iter) = self.find_method(class, iter_key) else {
            return Err(self.method_error(class, iter_key));
        };
        let Some(next) = self.find_method(class, next_key) else {
            return Err(self.method_error(class, next_key));
        };
        // Stack: [list, iterable, state]
        self.push(Value::Null);
        loop {
            let state = self.peek(0);
            self.push(iterable);
            self.push(state);
            self.call_method_sync(iter, 1)?;
            let state = self.pop();
            let len = self.stack.len();
            self.stack[len - 1] = state;
            if !state.is_truthy() {
                break;
            }
            self.push(iterable);
            self.push(state);
            self.call_method_sync(next, 1)?;
            let item = self.pop();
            let list = self.peek(2);
            if let Some(l) = list.as_obj().and_then(|r| self.heap.list_mut(r)) {
                l.items.push(item);
            }
            self.resize_top_at(2);
        }
        self.pop();
        self.pop();
        Ok(())
    }

    fn resize_top(&mut self) {
        self.resize_top_at(0);
    }

    fn resize_top_at(&mut self, distance: usize) {
        if let Some(r) = self.peek(distance).as_obj() {
            self.heap.resize(r);
        }
    }

    fn define_method(&mut self, class: Value, key: StrKey, method: Value) {
        if let Some(class) = class.as_obj() {
            if let Some(c) = self.heap.class_mut(class) {
                c.methods.put(key, method);
            }
            self.heap.resize(class);
        }
    }

    /// Resolve the native declared by constant `idx` through the registry.
    /// `class` is set for native methods.
    fn resolve_native(&mut self, idx: u16, class: Option<ObjRef>) -> Result<ObjRef, Raised> {
        let decl = match &self.frame().proto.chunk.constants[idx as usize] {
            Constant::Native(decl) => decl.clone(),
            other => panic!("constant {} is not a native declaration: {:?}", idx, other),
        };
        let module = self.current_module();
        let module_name = self.module_name(module);
        let class_name = class.map(|c| self.class_name(c));
        let key: NativeKey = (module_name, class_name, decl.name.clone());

        let Some(&function) = self.natives.get(&key) else {
            let qualified = match &key.1 {
                Some(class) => format!("{}.{}.{}", key.0, class, key.2),
                None => format!("{}.{}", key.0, key.2),
            };
            return Err(self.throw(
                self.core.classes.exception,
                &format!("Cannot resolve native `{}`", qualified),
            ));
        };

        self.heap.disable_gc();
        let defaults = decl
            .defaults
            .iter()
            .map(|c| self.constant_value(c, module))
            .collect();
        self.heap.enable_gc();
        Ok(super::core::new_native(
            self,
            &decl.name,
            decl.arity,
            defaults,
            decl.vararg,
            module,
            function,
        ))
    }

    // --- Import ---

    fn import(&mut self, name: StrKey, bind: bool) -> Result<(), Raised> {
        if let Some(module) = self.modules.get(name) {
            if bind {
                self.push(module);
            }
            self.push(Value::Null);
            return Ok(());
        }

        let display = self.string_value(name.handle);
        let compiled = match self.import_resolver.as_mut() {
            Some(resolver) => resolver(&display),
            None => None,
        };
        let Some(compiled) = compiled else {
            return Err(self.throw(
                self.core.classes.import_exception,
                &format!("Cannot load module `{}`", display),
            ));
        };
        if let Err(err) = super::blob::verify(&compiled.main) {
            return Err(self.throw(
                self.core.classes.import_exception,
                &format!("Cannot load module `{}`: {}", display, err),
            ));
        }

        let closure = self.load_compiled(name, &compiled);
        if bind {
            let module = self.loaded_module(name);
            self.push(Value::Obj(module));
        }
        self.push(Value::Obj(closure));
        self.call_value(0)
    }

    fn loaded_module(&self, name: StrKey) -> ObjRef {
        match self.modules.get(name).and_then(|v| v.as_obj()) {
            Some(module) => module,
            None => panic!("module used before import"),
        }
    }

    pub(crate) fn module_name(&self, module: ObjRef) -> String {
        match self.heap.module(module) {
            Some(m) => self.string_value(m.name),
            None => String::new(),
        }
    }

    /// Contents of a string handle.
    pub(crate) fn string_value(&self, r: ObjRef) -> String {
        match self.heap.string(r) {
            Some(s) => s.as_str().into_owned(),
            None => String::new(),
        }
    }
}

/// Handlers with their stack heights made relative to `base`.
fn relative_handlers(handlers: &[Handler], base: usize) -> Vec<Handler> {
    handlers
        .iter()
        .map(|h| Handler {
            saved_sp: h.saved_sp - base,
            ..*h
        })
        .collect()
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
