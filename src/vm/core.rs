//! The `__core__` module: base classes, exception hierarchy and the few
//! natives the VM itself relies on (iteration, equality, printing).

use crate::error::Raised;

use super::heap::Heap;
use super::object::{
    GeneratorState, NativeFn, NativeResult, ObjClass, ObjModule, ObjNative, Object,
};
use super::table::{StrKey, Table};
use super::value::{format_number, ObjRef, Value};
use super::vm::Vm;

pub(crate) const CORE_MODULE: &str = "__core__";

/// Names the VM looks up by key on hot paths, interned once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub(crate) enum Special {
    Construct,
    Eq,
    Hash,
    String,
    Iter,
    Next,
    Get,
    Set,
    Add,
    RAdd,
    Sub,
    RSub,
    Mul,
    RMul,
    Div,
    RDiv,
    Mod,
    RMod,
    Pow,
    RPow,
    Lt,
    Le,
    Gt,
    Ge,
    Neg,
    BAnd,
    RBAnd,
    BOr,
    RBOr,
    Xor,
    RXor,
    LShift,
    RLShift,
    RShift,
    RRShift,
    Inv,
    Len,
    Err,
    Cause,
    Stacktrace,
}

impl Special {
    const ALL: [Special; 40] = [
        Special::Construct,
        Special::Eq,
        Special::Hash,
        Special::String,
        Special::Iter,
        Special::Next,
        Special::Get,
        Special::Set,
        Special::Add,
        Special::RAdd,
        Special::Sub,
        Special::RSub,
        Special::Mul,
        Special::RMul,
        Special::Div,
        Special::RDiv,
        Special::Mod,
        Special::RMod,
        Special::Pow,
        Special::RPow,
        Special::Lt,
        Special::Le,
        Special::Gt,
        Special::Ge,
        Special::Neg,
        Special::BAnd,
        Special::RBAnd,
        Special::BOr,
        Special::RBOr,
        Special::Xor,
        Special::RXor,
        Special::LShift,
        Special::RLShift,
        Special::RShift,
        Special::RRShift,
        Special::Inv,
        Special::Len,
        Special::Err,
        Special::Cause,
        Special::Stacktrace,
    ];

    pub(crate) fn name(self) -> &'static str {
        match self {
            Special::Construct => "construct",
            Special::Eq => "__eq__",
            Special::Hash => "__hash__",
            Special::String => "__string__",
            Special::Iter => "__iter__",
            Special::Next => "__next__",
            Special::Get => "__get__",
            Special::Set => "__set__",
            Special::Add => "__add__",
            Special::RAdd => "__radd__",
            Special::Sub => "__sub__",
            Special::RSub => "__rsub__",
            Special::Mul => "__mul__",
            Special::RMul => "__rmul__",
            Special::Div => "__div__",
            Special::RDiv => "__rdiv__",
            Special::Mod => "__mod__",
            Special::RMod => "__rmod__",
            Special::Pow => "__pow__",
            Special::RPow => "__rpow__",
            Special::Lt => "__lt__",
            Special::Le => "__le__",
            Special::Gt => "__gt__",
            Special::Ge => "__ge__",
            Special::Neg => "__neg__",
            Special::BAnd => "__band__",
            Special::RBAnd => "__rband__",
            Special::BOr => "__bor__",
            Special::RBOr => "__rbor__",
            Special::Xor => "__xor__",
            Special::RXor => "__rxor__",
            Special::LShift => "__lshft__",
            Special::RLShift => "__rlshft__",
            Special::RShift => "__rshft__",
            Special::RRShift => "__rrshft__",
            Special::Inv => "__inv__",
            Special::Len => "__len__",
            Special::Err => "_err",
            Special::Cause => "_cause",
            Special::Stacktrace => "_stacktrace",
        }
    }
}

/// Handles of the core classes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CoreClasses {
    pub object: ObjRef,
    pub class: ObjRef,
    pub number: ObjRef,
    pub boolean: ObjRef,
    pub null: ObjRef,
    pub string: ObjRef,
    pub list: ObjRef,
    pub tuple: ObjRef,
    pub table: ObjRef,
    pub function: ObjRef,
    pub module: ObjRef,
    pub stack_trace: ObjRef,
    pub generator: ObjRef,
    pub exception: ObjRef,
    pub type_exception: ObjRef,
    pub name_exception: ObjRef,
    pub field_exception: ObjRef,
    pub method_exception: ObjRef,
    pub index_exception: ObjRef,
    pub stack_overflow: ObjRef,
    pub import_exception: ObjRef,
    pub invalid_arg: ObjRef,
    pub assert_exception: ObjRef,
    pub program_interrupt: ObjRef,
    pub generator_exception: ObjRef,
}

impl CoreClasses {
    pub(crate) fn all(&self) -> [ObjRef; 25] {
        [
            self.object,
            self.class,
            self.number,
            self.boolean,
            self.null,
            self.string,
            self.list,
            self.tuple,
            self.table,
            self.function,
            self.module,
            self.stack_trace,
            self.generator,
            self.exception,
            self.type_exception,
            self.name_exception,
            self.field_exception,
            self.method_exception,
            self.index_exception,
            self.stack_overflow,
            self.import_exception,
            self.invalid_arg,
            self.assert_exception,
            self.program_interrupt,
            self.generator_exception,
        ]
    }
}

#[derive(Debug)]
pub(crate) struct Core {
    pub module: ObjRef,
    pub classes: CoreClasses,
    pub specials: Vec<StrKey>,
}

pub(crate) fn native_object(
    name: &str,
    arity: u8,
    defaults: Vec<Value>,
    vararg: bool,
    module: ObjRef,
    function: NativeFn,
) -> Object {
    Object::Native(ObjNative {
        name: name.to_string(),
        arity,
        defaults,
        vararg,
        module,
        function,
    })
}

pub(crate) fn new_native(
    vm: &mut Vm,
    name: &str,
    arity: u8,
    defaults: Vec<Value>,
    vararg: bool,
    module: ObjRef,
    function: NativeFn,
) -> ObjRef {
    vm.alloc(native_object(name, arity, defaults, vararg, module, function))
}

/// Populates `__core__` directly on the heap, before a `Vm` exists.
struct Builder<'a> {
    heap: &'a mut Heap,
    module: ObjRef,
    globals: Table,
}

impl Builder<'_> {
    fn class(&mut self, name: &str, superclass: Option<ObjRef>, builtin: bool) -> ObjRef {
        let key = self.heap.intern_key(name);
        let methods = superclass
            .and_then(|sup| self.heap.class(sup))
            .map(|sup| sup.methods.clone())
            .unwrap_or_default();
        let class = self.heap.insert(Object::Class(ObjClass {
            name: key.handle,
            superclass,
            methods,
            builtin,
        }));
        self.globals.put(key, Value::Obj(class));
        class
    }

    fn method(&mut self, class: ObjRef, name: &str, arity: u8, function: NativeFn) {
        self.method_with_defaults(class, name, arity, Vec::new(), function);
    }

    fn method_with_defaults(
        &mut self,
        class: ObjRef,
        name: &str,
        arity: u8,
        defaults: Vec<Value>,
        function: NativeFn,
    ) {
        let key = self.heap.intern_key(name);
        let native = self.heap.insert(native_object(
            name,
            arity,
            defaults,
            false,
            self.module,
            function,
        ));
        if let Some(c) = self.heap.class_mut(class) {
            c.methods.put(key, Value::Obj(native));
        }
        self.heap.resize(class);
    }

    fn function(
        &mut self,
        name: &str,
        arity: u8,
        defaults: Vec<Value>,
        vararg: bool,
        function: NativeFn,
    ) {
        let key = self.heap.intern_key(name);
        let native = self
            .heap
            .insert(native_object(name, arity, defaults, vararg, self.module, function));
        self.globals.put(key, Value::Obj(native));
    }
}

pub(crate) fn bootstrap(heap: &mut Heap) -> Core {
    let specials = Special::ALL
        .iter()
        .map(|s| heap.intern_key(s.name()))
        .collect();
    let module_name = heap.intern(CORE_MODULE.as_bytes());
    let module = heap.insert(Object::Module(ObjModule {
        name: module_name,
        globals: Table::new(),
    }));
    let empty = heap.intern(b"");
    let assert_message = heap.intern(b"Assertion failed");

    let mut b = Builder {
        heap: &mut *heap,
        module,
        globals: Table::new(),
    };

    let object = b.class("Object", None, false);
    b.method(object, "__eq__", 1, object_eq);
    b.method(object, "__hash__", 0, object_hash);
    b.method(object, "__string__", 0, object_string);

    let class = b.class("Class", Some(object), true);
    let number = b.class("Number", Some(object), true);
    b.method(number, "__string__", 0, number_string);
    let boolean = b.class("Boolean", Some(object), true);
    let null = b.class("Null", Some(object), true);

    let string = b.class("String", Some(object), true);
    b.method(string, "len", 0, string_len);
    b.method(string, "__len__", 0, string_len);
    b.method(string, "__eq__", 1, string_eq);
    b.method(string, "__hash__", 0, string_hash);
    b.method(string, "__iter__", 1, string_iter);
    b.method(string, "__next__", 1, string_next);

    let list = b.class("List", Some(object), true);
    b.method(list, "add", 1, list_add);
    b.method(list, "len", 0, list_len);
    b.method(list, "__len__", 0, list_len);
    b.method(list, "__eq__", 1, list_eq);
    b.method(list, "__iter__", 1, list_iter);
    b.method(list, "__next__", 1, list_next);

    let tuple = b.class("Tuple", Some(object), true);
    b.method(tuple, "len", 0, tuple_len);
    b.method(tuple, "__len__", 0, tuple_len);
    b.method(tuple, "__eq__", 1, tuple_eq);
    b.method(tuple, "__hash__", 0, tuple_hash);
    b.method(tuple, "__iter__", 1, tuple_iter);
    b.method(tuple, "__next__", 1, tuple_next);

    let table = b.class("Table", Some(object), true);
    b.method(table, "len", 0, table_len);
    b.method(table, "__len__", 0, table_len);
    b.method(table, "contains", 1, table_contains);
    b.method(table, "delete", 1, table_delete);
    b.method(table, "__iter__", 1, table_iter);
    b.method(table, "__next__", 1, table_next);

    let function = b.class("Function", Some(object), true);
    let module_class = b.class("Module", Some(object), true);
    let stack_trace = b.class("StackTrace", Some(object), true);

    let generator = b.class("Generator", Some(object), true);
    b.method(generator, "isDone", 0, generator_is_done);
    b.method(generator, "__iter__", 1, generator_iter);
    b.method(generator, "__next__", 1, generator_next);

    let exception = b.class("Exception", Some(object), false);
    b.method_with_defaults(
        exception,
        "construct",
        2,
        vec![Value::Obj(empty), Value::Null],
        exception_construct,
    );
    b.method(exception, "printStacktrace", 0, exception_print_stacktrace);
    b.method(exception, "getStacktrace", 0, exception_get_stacktrace);

    let classes = CoreClasses {
        object,
        class,
        number,
        boolean,
        null,
        string,
        list,
        tuple,
        table,
        function,
        module: module_class,
        stack_trace,
        generator,
        exception,
        type_exception: b.class("TypeException", Some(exception), false),
        name_exception: b.class("NameException", Some(exception), false),
        field_exception: b.class("FieldException", Some(exception), false),
        method_exception: b.class("MethodException", Some(exception), false),
        index_exception: b.class("IndexOutOfBoundException", Some(exception), false),
        stack_overflow: b.class("StackOverflowException", Some(exception), false),
        import_exception: b.class("ImportException", Some(exception), false),
        invalid_arg: b.class("InvalidArgException", Some(exception), false),
        assert_exception: b.class("AssertException", Some(exception), false),
        program_interrupt: b.class("ProgramInterrupt", Some(exception), false),
        generator_exception: b.class("GeneratorException", Some(exception), false),
    };

    b.function("print", 0, Vec::new(), true, core_print);
    b.function("type", 1, Vec::new(), false, core_type);
    b.function("str", 1, Vec::new(), false, core_str);
    b.function(
        "assert",
        2,
        vec![Value::Obj(assert_message)],
        false,
        core_assert,
    );

    let globals = std::mem::take(&mut b.globals);
    if let Some(m) = heap.module_mut(module) {
        m.globals = globals;
    }
    heap.resize(module);

    Core {
        module,
        classes,
        specials,
    }
}

// --- String conversion ---

const MAX_DISPLAY_DEPTH: usize = 64;

impl Vm {
    /// Text of `value` as `print` and `str` show it. Instances go through
    /// their `__string__` method.
    pub(crate) fn to_display_string(&mut self, value: Value) -> Result<String, Raised> {
        self.display_at(value, 0)
    }

    fn display_at(&mut self, value: Value, depth: usize) -> Result<String, Raised> {
        let r = match value {
            Value::Number(n) => return Ok(format_number(n)),
            Value::Bool(b) => return Ok(b.to_string()),
            Value::Null => return Ok("null".to_string()),
            Value::Obj(r) => r,
        };
        if depth > MAX_DISPLAY_DEPTH {
            return Ok("...".to_string());
        }

        let (open, close, items) = match self.heap.get(r) {
            Object::String(s) => return Ok(s.as_str().into_owned()),
            Object::List(l) => ("[", "]", l.items.clone()),
            Object::Tuple(t) => ("(", ")", t.items.to_vec()),
            Object::Table(t) => {
                let entries: Vec<(Value, Value)> = t.iter().map(|e| (e.key, e.value)).collect();
                let mut parts = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    let key = self.display_nested(key, depth)?;
                    let value = self.display_nested(value, depth)?;
                    parts.push(format!("{}: {}", key, value));
                }
                return Ok(format!("{{{}}}", parts.join(", ")));
            }
            Object::Instance(i) => {
                let class = i.class;
                let method = self.find_method(class, self.special(Special::String));
                return match method {
                    Some(method) => {
                        self.push(value);
                        self.call_method_sync(method, 0)?;
                        let result = self.pop();
                        match self.heap.value_string(result) {
                            Some(s) => Ok(s.as_str().into_owned()),
                            None => Err(self.throw(
                                self.core.classes.type_exception,
                                "__string__() must return a String",
                            )),
                        }
                    }
                    None => Ok(self.default_repr(value)),
                };
            }
            Object::Class(c) => return Ok(format!("<Class {}>", self.string_value(c.name))),
            Object::Function(f) => return Ok(format!("<Function {}>", f.proto.display_name())),
            Object::Closure(c) => {
                let name = match self.heap.function(c.function) {
                    Some(f) => f.proto.display_name().to_string(),
                    None => String::new(),
                };
                return Ok(format!("<Function {}>", name));
            }
            Object::Native(n) => return Ok(format!("<Native {}>", n.name)),
            Object::BoundMethod(b) => {
                let method = b.method;
                let receiver = self.get_class(b.receiver);
                let name = match self.heap.get(method) {
                    Object::Native(n) => n.name.clone(),
                    Object::Closure(c) => match self.heap.function(c.function) {
                        Some(f) => f.proto.display_name().to_string(),
                        None => String::new(),
                    },
                    other => other.type_name().to_string(),
                };
                return Ok(format!("<BoundMethod {}.{}>", self.class_name(receiver), name));
            }
            Object::Module(m) => return Ok(format!("<Module {}>", self.string_value(m.name))),
            Object::StackTrace(st) => {
                let lines: Vec<String> = st.records.iter().map(|r| r.to_string()).collect();
                return Ok(lines.join("\n"));
            }
            Object::Generator(g) => {
                let name = match self.heap.function(g.function) {
                    Some(f) => f.proto.display_name().to_string(),
                    None => String::new(),
                };
                return Ok(format!("<Generator {}>", name));
            }
            Object::Upvalue(_) => return Ok("<Upvalue>".to_string()),
        };

        let mut parts = Vec::with_capacity(items.len());
        for item in items {
            parts.push(self.display_nested(item, depth)?);
        }
        if open == "(" && parts.len() == 1 {
            return Ok(format!("({},)", parts[0]));
        }
        Ok(format!("{}{}{}", open, parts.join(", "), close))
    }

    /// Elements inside containers: strings are quoted.
    fn display_nested(&mut self, value: Value, depth: usize) -> Result<String, Raised> {
        if let Some(s) = self.heap.value_string(value) {
            return Ok(format!("{:?}", s.as_str()));
        }
        self.display_at(value, depth + 1)
    }

    pub(crate) fn default_repr(&self, value: Value) -> String {
        let class = self.get_class(value);
        match value {
            Value::Obj(r) => format!("<{} object at {:#x}>", self.class_name(class), r.index()),
            _ => format!("<{} object>", self.class_name(class)),
        }
    }
}

// --- Natives ---

fn object_eq(vm: &mut Vm) -> NativeResult {
    let equal = vm.get_slot(0).raw_eq(&vm.get_slot(1));
    vm.push_bool(equal);
    Ok(())
}

fn object_hash(vm: &mut Vm) -> NativeResult {
    let hash = match vm.get_slot(0) {
        Value::Obj(r) => super::operators::identity_hash(r),
        other => vm.hash_value(other)?,
    };
    vm.push_number(hash as f64);
    Ok(())
}

/// `##x` on anything without its own `__string__`: the `print` text,
/// except instances, which would recurse into this method.
fn object_string(vm: &mut Vm) -> NativeResult {
    let this = vm.get_slot(0);
    let text = if vm.is_instance_slot(0) {
        vm.default_repr(this)
    } else {
        vm.to_display_string(this)?
    };
    vm.push_string(&text);
    Ok(())
}

fn number_string(vm: &mut Vm) -> NativeResult {
    let n = vm.check_number(0, "this")?;
    vm.push_string(&format_number(n));
    Ok(())
}

fn string_len(vm: &mut Vm) -> NativeResult {
    let len = vm.heap.value_string(vm.get_slot(0)).map_or(0, |s| s.data.len());
    vm.push_number(len as f64);
    Ok(())
}

fn string_eq(vm: &mut Vm) -> NativeResult {
    let equal = match (
        vm.heap.value_string(vm.get_slot(0)),
        vm.heap.value_string(vm.get_slot(1)),
    ) {
        (Some(a), Some(b)) => a.data == b.data,
        _ => false,
    };
    vm.push_bool(equal);
    Ok(())
}

fn string_hash(vm: &mut Vm) -> NativeResult {
    let hash = vm.heap.value_string(vm.get_slot(0)).map_or(0, |s| s.hash);
    vm.push_number(hash as f64);
    Ok(())
}

/// Next index state of an index-based iteration over `len` elements.
fn index_iter(len: usize, state: Value) -> Value {
    match state {
        Value::Null if len > 0 => Value::Number(0.0),
        Value::Number(i) if i >= 0.0 && (i as usize) + 1 < len => Value::Number(i + 1.0),
        _ => Value::Bool(false),
    }
}

fn string_iter(vm: &mut Vm) -> NativeResult {
    let len = vm.heap.value_string(vm.get_slot(0)).map_or(0, |s| s.data.len());
    let state = index_iter(len, vm.get_slot(1));
    vm.push_value(state);
    Ok(())
}

fn string_next(vm: &mut Vm) -> NativeResult {
    let byte = match (vm.heap.value_string(vm.get_slot(0)), vm.get_slot(1).as_index()) {
        (Some(s), Some(i)) if i >= 0 => s.data.get(i as usize).copied(),
        _ => None,
    };
    match byte {
        Some(byte) => {
            let r = vm.intern(&[byte]);
            vm.push_value(Value::Obj(r));
        }
        None => vm.push_null(),
    }
    Ok(())
}

fn list_add(vm: &mut Vm) -> NativeResult {
    let item = vm.get_slot(1);
    if let Some(list) = vm.get_slot(0).as_obj() {
        if let Some(l) = vm.heap.list_mut(list) {
            l.items.push(item);
        }
        vm.heap.resize(list);
    }
    vm.push_null();
    Ok(())
}

fn list_items_len(vm: &Vm) -> usize {
    vm.get_slot(0)
        .as_obj()
        .and_then(|r| vm.heap.list(r))
        .map_or(0, |l| l.items.len())
}

fn list_len(vm: &mut Vm) -> NativeResult {
    let len = list_items_len(vm);
    vm.push_number(len as f64);
    Ok(())
}

fn list_iter(vm: &mut Vm) -> NativeResult {
    let state = index_iter(list_items_len(vm), vm.get_slot(1));
    vm.push_value(state);
    Ok(())
}

fn list_next(vm: &mut Vm) -> NativeResult {
    let item = match (vm.get_slot(0).as_obj().and_then(|r| vm.heap.list(r)), vm.get_slot(1).as_index()) {
        (Some(l), Some(i)) if i >= 0 => l.items.get(i as usize).copied(),
        _ => None,
    };
    vm.push_value(item.unwrap_or(Value::Null));
    Ok(())
}

fn tuple_items_len(vm: &Vm) -> usize {
    vm.get_slot(0)
        .as_obj()
        .and_then(|r| vm.heap.tuple(r))
        .map_or(0, |t| t.items.len())
}

fn tuple_len(vm: &mut Vm) -> NativeResult {
    let len = tuple_items_len(vm);
    vm.push_number(len as f64);
    Ok(())
}

fn tuple_iter(vm: &mut Vm) -> NativeResult {
    let state = index_iter(tuple_items_len(vm), vm.get_slot(1));
    vm.push_value(state);
    Ok(())
}

fn tuple_next(vm: &mut Vm) -> NativeResult {
    let item = match (vm.get_slot(0).as_obj().and_then(|r| vm.heap.tuple(r)), vm.get_slot(1).as_index()) {
        (Some(t), Some(i)) if i >= 0 => t.items.get(i as usize).copied(),
        _ => None,
    };
    vm.push_value(item.unwrap_or(Value::Null));
    Ok(())
}

/// Element-wise equality, each pair compared with `==`.
fn items_equal(vm: &mut Vm, a: &[Value], b: &[Value]) -> Result<bool, Raised> {
    if a.len() != b.len() {
        return Ok(false);
    }
    for (x, y) in a.iter().zip(b) {
        if !vm.values_equal(*x, *y)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn list_eq(vm: &mut Vm) -> NativeResult {
    let (this, other) = (vm.get_slot(0), vm.get_slot(1));
    if this.raw_eq(&other) {
        vm.push_bool(true);
        return Ok(());
    }
    let items = |vm: &Vm, v: Value| v.as_obj().and_then(|r| vm.heap.list(r)).map(|l| l.items.clone());
    let equal = match (items(&*vm, this), items(&*vm, other)) {
        (Some(a), Some(b)) => items_equal(vm, &a, &b)?,
        _ => false,
    };
    vm.push_bool(equal);
    Ok(())
}

fn tuple_eq(vm: &mut Vm) -> NativeResult {
    let (this, other) = (vm.get_slot(0), vm.get_slot(1));
    let items = |vm: &Vm, v: Value| v.as_obj().and_then(|r| vm.heap.tuple(r)).map(|t| t.items.to_vec());
    let equal = match (items(&*vm, this), items(&*vm, other)) {
        (Some(a), Some(b)) => items_equal(vm, &a, &b)?,
        _ => false,
    };
    vm.push_bool(equal);
    Ok(())
}

fn tuple_hash(vm: &mut Vm) -> NativeResult {
    let items = match vm.get_slot(0).as_obj().and_then(|r| vm.heap.tuple(r)) {
        Some(t) => t.items.to_vec(),
        None => Vec::new(),
    };
    let mut hash: u64 = 0x345678;
    for item in items {
        hash = hash.wrapping_mul(1000003) ^ vm.hash_value(item)?;
    }
    // Keep the value exact as a Number
    vm.push_number((hash & ((1 << 53) - 1)) as f64);
    Ok(())
}

fn this_generator(vm: &Vm) -> Option<&super::object::ObjGenerator> {
    vm.get_slot(0).as_obj().and_then(|r| vm.heap.generator(r))
}

fn generator_done(vm: &Vm) -> bool {
    this_generator(vm).map_or(true, |g| g.state == GeneratorState::Done)
}

fn generator_is_done(vm: &mut Vm) -> NativeResult {
    let done = generator_done(vm);
    vm.push_bool(done);
    Ok(())
}

/// Resume the generator; iteration continues while it has not completed.
fn generator_iter(vm: &mut Vm) -> NativeResult {
    if generator_done(vm) {
        vm.push_bool(false);
        return Ok(());
    }
    vm.push_value(vm.get_slot(0));
    vm.call_sync(0)?;
    vm.pop_value();
    let done = generator_done(vm);
    vm.push_bool(!done);
    Ok(())
}

fn generator_next(vm: &mut Vm) -> NativeResult {
    let value = this_generator(vm).map_or(Value::Null, |g| g.last_yield);
    vm.push_value(value);
    Ok(())
}

fn this_table(vm: &Vm) -> Option<ObjRef> {
    vm.get_slot(0).as_obj().filter(|r| vm.heap.table(*r).is_some())
}

fn table_len(vm: &mut Vm) -> NativeResult {
    let len = this_table(vm)
        .and_then(|r| vm.heap.table(r))
        .map_or(0, |t| t.len());
    vm.push_number(len as f64);
    Ok(())
}

fn table_contains(vm: &mut Vm) -> NativeResult {
    let key = vm.get_slot(1);
    let found = match this_table(vm) {
        Some(table) => vm.table_get(table, key)?.is_some(),
        None => false,
    };
    vm.push_bool(found);
    Ok(())
}

fn table_delete(vm: &mut Vm) -> NativeResult {
    let key = vm.get_slot(1);
    let removed = match this_table(vm) {
        Some(table) => vm.table_delete(table, key)?,
        None => false,
    };
    vm.push_bool(removed);
    Ok(())
}

fn table_iter(vm: &mut Vm) -> NativeResult {
    let after = match vm.get_slot(1) {
        Value::Null => None,
        Value::Number(n) if n >= 0.0 => Some(n as usize),
        _ => {
            vm.push_bool(false);
            return Ok(());
        }
    };
    let next = this_table(vm)
        .and_then(|r| vm.heap.table(r))
        .and_then(|t| t.next_position(after));
    match next {
        Some(position) => vm.push_number(position as f64),
        None => vm.push_bool(false),
    }
    Ok(())
}

fn table_next(vm: &mut Vm) -> NativeResult {
    let key = match (this_table(vm).and_then(|r| vm.heap.table(r)), vm.get_slot(1).as_index()) {
        (Some(t), Some(i)) if i >= 0 => t.entry(i as usize).map(|e| e.key),
        _ => None,
    };
    vm.push_value(key.unwrap_or(Value::Null));
    Ok(())
}

fn exception_construct(vm: &mut Vm) -> NativeResult {
    let this = vm.get_slot(0);
    let err = vm.get_slot(1);
    let cause = vm.get_slot(2);
    if vm.heap.value_string(err).is_none() {
        return Err(vm.throw(
            vm.core.classes.type_exception,
            "err must be a String",
        ));
    }
    if let Some(instance) = this.as_obj() {
        vm.set_instance_field(instance, vm.special(Special::Err), err);
        vm.set_instance_field(instance, vm.special(Special::Cause), cause);
    }
    vm.push_value(this);
    Ok(())
}

fn exception_print_stacktrace(vm: &mut Vm) -> NativeResult {
    vm.print_traceback(vm.get_slot(0));
    vm.push_null();
    Ok(())
}

fn exception_get_stacktrace(vm: &mut Vm) -> NativeResult {
    let text = vm.format_traceback(vm.get_slot(0), false);
    vm.push_string(&text);
    Ok(())
}

fn core_print(vm: &mut Vm) -> NativeResult {
    let args = match vm.get_slot(1).as_obj().and_then(|r| vm.heap.tuple(r)) {
        Some(t) => t.items.to_vec(),
        None => Vec::new(),
    };
    let mut parts = Vec::with_capacity(args.len());
    for arg in args {
        parts.push(vm.to_display_string(arg)?);
    }
    let line = parts.join(" ");
    if vm.capture_output {
        vm.output.push(line);
    } else {
        println!("{}", line);
    }
    vm.push_null();
    Ok(())
}

fn core_type(vm: &mut Vm) -> NativeResult {
    let class = vm.get_class(vm.get_slot(1));
    vm.push_value(Value::Obj(class));
    Ok(())
}

fn core_str(vm: &mut Vm) -> NativeResult {
    let text = vm.to_display_string(vm.get_slot(1))?;
    vm.push_string(&text);
    Ok(())
}

fn core_assert(vm: &mut Vm) -> NativeResult {
    if !vm.get_slot(1).is_truthy() {
        let message = vm.to_display_string(vm.get_slot(2))?;
        return Err(vm.throw(vm.core.classes.assert_exception, &message));
    }
    vm.push_null();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_core_module_exports_classes_and_functions() {
        let vm = Vm::new();
        for name in ["Object", "Exception", "ProgramInterrupt", "List", "print", "assert"] {
            let key = vm.heap.lookup_key(name).unwrap();
            let globals = &vm.heap.module(vm.core.module).unwrap().globals;
            assert!(globals.contains_key(key), "missing {}", name);
        }
    }

    #[test]
    fn test_subclasses_inherit_object_methods() {
        let vm = Vm::new();
        let eq = vm.special(Special::Eq);
        let list = vm.heap.class(vm.core.classes.list).unwrap();
        assert!(list.methods.contains_key(eq));
        assert!(list.builtin);
        let type_exception = vm.heap.class(vm.core.classes.type_exception).unwrap();
        assert_eq!(type_exception.superclass, Some(vm.core.classes.exception));
        assert!(type_exception.methods.contains_key(vm.special(Special::Construct)));
    }

    #[test]
    fn test_index_iteration_states() {
        assert_eq!(index_iter(2, Value::Null), Value::Number(0.0));
        assert_eq!(index_iter(2, Value::Number(0.0)), Value::Number(1.0));
        assert_eq!(index_iter(2, Value::Number(1.0)), Value::Bool(false));
        assert_eq!(index_iter(0, Value::Null), Value::Bool(false));
    }

    #[test]
    fn test_display_strings() {
        let mut vm = Vm::new();
        let s = vm.intern(b"hi");
        let list = vm.alloc(Object::List(super::super::object::ObjList {
            items: vec![Value::Number(1.0), Value::Obj(s), Value::Null],
        }));
        assert_eq!(vm.to_display_string(Value::Obj(list)).unwrap(), r#"[1, "hi", null]"#);
        assert_eq!(vm.to_display_string(Value::Number(2.5)).unwrap(), "2.5");
        assert_eq!(vm.to_display_string(Value::Obj(s)).unwrap(), "hi");
    }
}
