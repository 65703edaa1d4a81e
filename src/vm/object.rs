//! Heap object variants.

use std::borrow::Cow;
use std::rc::Rc;

use ahash::AHashMap;

use super::chunk::FunctionProto;
use super::table::Table;
use super::upvalue::Upvalue;
use super::value::{ObjRef, Value};
use super::vm::{Handler, Vm};
use crate::error::{Raised, TraceRecord};

/// Signature of host functions. Arguments live at `api_base + 1..`, slot 0
/// holds the receiver (or the native itself). On `Ok(())` the value on top
/// of the stack is the result; on `Err(Raised)` an exception has been
/// pushed.
pub type NativeFn = fn(&mut Vm) -> NativeResult;
pub type NativeResult = Result<(), Raised>;

/// 32-bit FNV-1a.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Arena slot contents: GC header plus payload.
#[derive(Debug)]
pub struct HeapObject {
    pub marked: bool,
    pub size: usize,
    pub kind: Object,
}

#[derive(Debug)]
pub enum Object {
    String(ObjString),
    List(ObjList),
    Tuple(ObjTuple),
    Table(ObjTable),
    Function(ObjFunction),
    Closure(ObjClosure),
    Native(ObjNative),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
    Module(ObjModule),
    StackTrace(ObjStackTrace),
    Generator(ObjGenerator),
    Upvalue(Upvalue),
}

#[derive(Debug)]
pub struct ObjString {
    pub data: Box<[u8]>,
    pub hash: u32,
    pub interned: bool,
}

impl ObjString {
    pub fn as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

#[derive(Debug, Default)]
pub struct ObjList {
    pub items: Vec<Value>,
}

#[derive(Debug)]
pub struct ObjTuple {
    pub items: Box<[Value]>,
}

#[derive(Debug, Clone, Copy)]
pub struct TableEntry {
    pub hash: u64,
    pub key: Value,
    pub value: Value,
}

/// User-level map keyed by arbitrary values.
///
/// Entries keep insertion order; removed entries leave a hole that the next
/// compaction drops. Key equality needs the VM (it may call `__eq__`), so
/// this type only exposes hash buckets and positions; lookups live in
/// `Vm::table_find`.
#[derive(Debug, Default)]
pub struct ObjTable {
    entries: Vec<Option<TableEntry>>,
    buckets: AHashMap<u64, Vec<usize>>,
    live: usize,
}

impl ObjTable {
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Positions of entries whose hash equals `hash`.
    pub fn candidates(&self, hash: u64) -> Vec<usize> {
        self.buckets.get(&hash).cloned().unwrap_or_default()
    }

    pub fn entry(&self, position: usize) -> Option<&TableEntry> {
        self.entries.get(position).and_then(Option::as_ref)
    }

    pub fn set_value(&mut self, position: usize, value: Value) {
        if let Some(Some(entry)) = self.entries.get_mut(position) {
            entry.value = value;
        }
    }

    pub fn insert_new(&mut self, hash: u64, key: Value, value: Value) {
        let position = self.entries.len();
        self.entries.push(Some(TableEntry { hash, key, value }));
        self.buckets.entry(hash).or_default().push(position);
        self.live += 1;
    }

    pub fn remove(&mut self, position: usize) -> Option<TableEntry> {
        let entry = self.entries.get_mut(position)?.take()?;
        if let Some(bucket) = self.buckets.get_mut(&entry.hash) {
            bucket.retain(|&p| p != position);
            if bucket.is_empty() {
                self.buckets.remove(&entry.hash);
            }
        }
        self.live -= 1;
        if self.entries.len() > 16 && self.live * 2 < self.entries.len() {
            self.compact();
        }
        Some(entry)
    }

    /// First live position strictly after `after` (or from the start).
    pub fn next_position(&self, after: Option<usize>) -> Option<usize> {
        let start = after.map_or(0, |p| p + 1);
        (start..self.entries.len()).find(|&p| self.entries[p].is_some())
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableEntry> + '_ {
        self.entries.iter().flatten()
    }

    fn compact(&mut self) {
        let entries: Vec<TableEntry> = self.entries.drain(..).flatten().collect();
        self.buckets.clear();
        self.live = 0;
        for entry in entries {
            self.insert_new(entry.hash, entry.key, entry.value);
        }
    }
}

/// A function prototype materialized for one module.
#[derive(Debug)]
pub struct ObjFunction {
    pub proto: Rc<FunctionProto>,
    /// Constant pool as runtime values, parallel to `proto.chunk.constants`.
    pub constants: Vec<Value>,
    pub defaults: Vec<Value>,
    pub module: ObjRef,
}

#[derive(Debug)]
pub struct ObjClosure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

pub struct ObjNative {
    pub name: String,
    pub arity: u8,
    pub defaults: Vec<Value>,
    pub vararg: bool,
    pub module: ObjRef,
    pub function: NativeFn,
}

impl std::fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<native {}>", self.name)
    }
}

#[derive(Debug)]
pub struct ObjClass {
    pub name: ObjRef,
    pub superclass: Option<ObjRef>,
    pub methods: Table,
    /// Core value classes (List, Number, ...) cannot be instantiated or
    /// subclassed from scripts.
    pub builtin: bool,
}

#[derive(Debug)]
pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table,
}

#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

#[derive(Debug)]
pub struct ObjModule {
    pub name: ObjRef,
    pub globals: Table,
}

#[derive(Debug, Default)]
pub struct ObjStackTrace {
    pub records: Vec<TraceRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    /// Created; the body has not run yet.
    Started,
    /// Stopped at a `yield`.
    Suspended,
    Running,
    Done,
}

/// A call that can be suspended and resumed. While suspended it owns the
/// frame's slots (callee slot first), its instruction pointer and its
/// handlers, whose `saved_sp` is relative to the frame base.
#[derive(Debug)]
pub struct ObjGenerator {
    pub closure: ObjRef,
    pub function: ObjRef,
    pub state: GeneratorState,
    pub ip: usize,
    pub stack: Vec<Value>,
    pub handlers: Vec<Handler>,
    pub last_yield: Value,
}

impl Object {
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::String(_) => "String",
            Object::List(_) => "List",
            Object::Tuple(_) => "Tuple",
            Object::Table(_) => "Table",
            Object::Function(_) => "Function",
            Object::Closure(_) => "Closure",
            Object::Native(_) => "Native",
            Object::Class(_) => "Class",
            Object::Instance(_) => "Instance",
            Object::BoundMethod(_) => "BoundMethod",
            Object::Module(_) => "Module",
            Object::StackTrace(_) => "StackTrace",
            Object::Generator(_) => "Generator",
            Object::Upvalue(_) => "Upvalue",
        }
    }

    /// Approximate heap footprint, charged against the GC budget.
    pub fn estimate_size(&self) -> usize {
        let value = std::mem::size_of::<Value>();
        let slot = std::mem::size_of::<HeapObject>();
        slot + match self {
            Object::String(s) => s.data.len(),
            Object::List(l) => l.items.capacity() * value,
            Object::Tuple(t) => t.items.len() * value,
            Object::Table(t) => t.entries.capacity() * std::mem::size_of::<Option<TableEntry>>(),
            Object::Function(f) => (f.constants.len() + f.defaults.len()) * value,
            Object::Closure(c) => c.upvalues.len() * std::mem::size_of::<ObjRef>(),
            Object::Native(n) => n.defaults.len() * value + n.name.len(),
            Object::Class(c) => c.methods.capacity() * 2 * value,
            Object::Instance(i) => i.fields.capacity() * 2 * value,
            Object::Module(m) => m.globals.capacity() * 2 * value,
            Object::StackTrace(st) => st.records.len() * std::mem::size_of::<TraceRecord>(),
            Object::Generator(g) => {
                g.stack.capacity() * value + g.handlers.capacity() * std::mem::size_of::<Handler>()
            }
            Object::BoundMethod(_) | Object::Upvalue(_) => 0,
        }
    }

    /// Push every handle this object keeps alive onto `out`.
    pub fn trace(&self, out: &mut Vec<ObjRef>) {
        fn push_value(out: &mut Vec<ObjRef>, v: &Value) {
            if let Value::Obj(r) = v {
                out.push(*r);
            }
        }
        fn push_table(out: &mut Vec<ObjRef>, table: &Table) {
            for (key, value) in table.iter() {
                out.push(key.handle);
                push_value(out, &value);
            }
        }
        match self {
            Object::String(_) | Object::StackTrace(_) => {}
            Object::List(l) => l.items.iter().for_each(|v| push_value(out, v)),
            Object::Tuple(t) => t.items.iter().for_each(|v| push_value(out, v)),
            Object::Table(t) => {
                for entry in t.iter() {
                    push_value(out, &entry.key);
                    push_value(out, &entry.value);
                }
            }
            Object::Function(f) => {
                f.constants.iter().for_each(|v| push_value(out, v));
                f.defaults.iter().for_each(|v| push_value(out, v));
                out.push(f.module);
            }
            Object::Closure(c) => {
                out.push(c.function);
                out.extend_from_slice(&c.upvalues);
            }
            Object::Native(n) => {
                n.defaults.iter().for_each(|v| push_value(out, v));
                out.push(n.module);
            }
            Object::Class(c) => {
                out.push(c.name);
                if let Some(sup) = c.superclass {
                    out.push(sup);
                }
                push_table(out, &c.methods);
            }
            Object::Instance(i) => {
                out.push(i.class);
                push_table(out, &i.fields);
            }
            Object::BoundMethod(b) => {
                push_value(out, &b.receiver);
                out.push(b.method);
            }
            Object::Module(m) => {
                out.push(m.name);
                push_table(out, &m.globals);
            }
            Object::Generator(g) => {
                out.push(g.closure);
                out.push(g.function);
                g.stack.iter().for_each(|v| push_value(out, v));
                push_value(out, &g.last_yield);
            }
            Object::Upvalue(Upvalue::Closed(v)) => push_value(out, v),
            Object::Upvalue(Upvalue::Open(_)) => {}
        }
    }
}
