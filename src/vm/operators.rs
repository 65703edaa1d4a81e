//! Arithmetic, comparison, equality, hashing and subscripts, with the
//! overload fallbacks (`__add__`, `__radd__`, `__eq__`, `__get__`, ...).

use crate::error::Raised;

use super::core::Special;
use super::object::{ObjList, ObjTable, Object};
use super::value::{ObjRef, Value};
use super::vm::Vm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    BitAnd,
    BitOr,
    Xor,
    ShiftLeft,
    ShiftRight,
}

impl BinaryOperator {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "/",
            BinaryOperator::Modulo => "%",
            BinaryOperator::Power => "^",
            BinaryOperator::Less => "<",
            BinaryOperator::LessEqual => "<=",
            BinaryOperator::Greater => ">",
            BinaryOperator::GreaterEqual => ">=",
            BinaryOperator::BitAnd => "&",
            BinaryOperator::BitOr => "|",
            BinaryOperator::Xor => "~",
            BinaryOperator::ShiftLeft => "<<",
            BinaryOperator::ShiftRight => ">>",
        }
    }

    /// Overload method on the left operand, and the reflected one on the
    /// right operand (arithmetic only).
    fn methods(self) -> (Special, Option<Special>) {
        match self {
            BinaryOperator::Add => (Special::Add, Some(Special::RAdd)),
            BinaryOperator::Subtract => (Special::Sub, Some(Special::RSub)),
            BinaryOperator::Multiply => (Special::Mul, Some(Special::RMul)),
            BinaryOperator::Divide => (Special::Div, Some(Special::RDiv)),
            BinaryOperator::Modulo => (Special::Mod, Some(Special::RMod)),
            BinaryOperator::Power => (Special::Pow, Some(Special::RPow)),
            BinaryOperator::Less => (Special::Lt, None),
            BinaryOperator::LessEqual => (Special::Le, None),
            BinaryOperator::Greater => (Special::Gt, None),
            BinaryOperator::GreaterEqual => (Special::Ge, None),
            BinaryOperator::BitAnd => (Special::BAnd, Some(Special::RBAnd)),
            BinaryOperator::BitOr => (Special::BOr, Some(Special::RBOr)),
            BinaryOperator::Xor => (Special::Xor, Some(Special::RXor)),
            BinaryOperator::ShiftLeft => (Special::LShift, Some(Special::RLShift)),
            BinaryOperator::ShiftRight => (Special::RShift, Some(Special::RRShift)),
        }
    }

    /// `None` when a bitwise operand has no integer representation.
    fn apply(self, a: f64, b: f64) -> Option<Value> {
        let bits = |f: fn(i64, i64) -> i64| Some(Value::Number(f(to_int(a)?, to_int(b)?) as f64));
        Some(match self {
            BinaryOperator::Add => Value::Number(a + b),
            BinaryOperator::Subtract => Value::Number(a - b),
            BinaryOperator::Multiply => Value::Number(a * b),
            BinaryOperator::Divide => Value::Number(a / b),
            BinaryOperator::Modulo => Value::Number(a % b),
            BinaryOperator::Power => Value::Number(a.powf(b)),
            BinaryOperator::Less => Value::Bool(a < b),
            BinaryOperator::LessEqual => Value::Bool(a <= b),
            BinaryOperator::Greater => Value::Bool(a > b),
            BinaryOperator::GreaterEqual => Value::Bool(a >= b),
            BinaryOperator::BitAnd => return bits(|x, y| x & y),
            BinaryOperator::BitOr => return bits(|x, y| x | y),
            BinaryOperator::Xor => return bits(|x, y| x ^ y),
            // Shift counts wrap modulo 64
            BinaryOperator::ShiftLeft => return bits(|x, y| x.wrapping_shl(y as u32)),
            BinaryOperator::ShiftRight => return bits(|x, y| x.wrapping_shr(y as u32)),
        })
    }
}

/// The `i64` a number truncates to, if it is in range.
fn to_int(n: f64) -> Option<i64> {
    (n >= i64::MIN as f64 && n < -(i64::MIN as f64)).then_some(n as i64)
}

/// Hash of a number key. `0.0` and `-0.0` compare equal, so they hash
/// alike.
pub(crate) fn number_hash(n: f64) -> u64 {
    let bits = if n == 0.0 { 0 } else { n.to_bits() };
    bits ^ (bits >> 32)
}

/// Hash of an object compared by identity.
pub(crate) fn identity_hash(r: ObjRef) -> u64 {
    let mut x = r.index() as u64;
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x
}

impl Vm {
    /// Stack: `[a, b]` → `[a op b]`.
    pub(crate) fn binary_op(&mut self, op: BinaryOperator) -> Result<(), Raised> {
        let (a, b) = (self.peek(1), self.peek(0));
        if let (Value::Number(x), Value::Number(y)) = (a, b) {
            let Some(result) = op.apply(x, y) else {
                return Err(self.no_integer_representation());
            };
            self.pop();
            self.pop();
            self.push(result);
            return Ok(());
        }

        if op == BinaryOperator::Add {
            if let (Some(x), Some(y)) = (self.heap.value_string(a), self.heap.value_string(b)) {
                let mut data = Vec::with_capacity(x.data.len() + y.data.len());
                data.extend_from_slice(&x.data);
                data.extend_from_slice(&y.data);
                let s = self.new_string(data);
                self.pop();
                self.pop();
                self.push(Value::Obj(s));
                return Ok(());
            }
        }

        let (method, reflected) = op.methods();
        if let Some(m) = self.find_method(self.get_class(a), self.special(method)) {
            return self.call_method_value(m, 1);
        }
        if let Some(reflected) = reflected {
            if let Some(m) = self.find_method(self.get_class(b), self.special(reflected)) {
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 2);
                return self.call_method_value(m, 1);
            }
        }

        let message = format!(
            "Operator {} not defined for types {} and {}",
            op.symbol(),
            self.class_name(self.get_class(a)),
            self.class_name(self.get_class(b))
        );
        Err(self.throw(self.core.classes.type_exception, &message))
    }

    pub(crate) fn negate(&mut self) -> Result<(), Raised> {
        let value = self.peek(0);
        if let Value::Number(n) = value {
            self.pop();
            self.push(Value::Number(-n));
            return Ok(());
        }
        let class = self.get_class(value);
        match self.find_method(class, self.special(Special::Neg)) {
            Some(m) => self.call_method_value(m, 0),
            None => {
                let message = format!("Operator - not defined for type {}", self.class_name(class));
                Err(self.throw(self.core.classes.type_exception, &message))
            }
        }
    }

    /// `~x`: bitwise complement, or `__inv__`.
    pub(crate) fn invert(&mut self) -> Result<(), Raised> {
        let value = self.peek(0);
        if let Value::Number(n) = value {
            let Some(x) = to_int(n) else {
                return Err(self.no_integer_representation());
            };
            self.pop();
            self.push(Value::Number(!x as f64));
            return Ok(());
        }
        let class = self.get_class(value);
        match self.find_method(class, self.special(Special::Inv)) {
            Some(m) => self.call_method_value(m, 0),
            None => {
                let message = format!("Operator ~ not defined for type {}", self.class_name(class));
                Err(self.throw(self.core.classes.type_exception, &message))
            }
        }
    }

    fn no_integer_representation(&mut self) -> Raised {
        self.throw(
            self.core.classes.type_exception,
            "Number has no integer representation",
        )
    }

    /// `a == b`. Objects other than strings dispatch to their class's
    /// `__eq__`, which runs to completion; `Object.__eq__` is identity.
    pub(crate) fn values_equal(&mut self, a: Value, b: Value) -> Result<bool, Raised> {
        let Value::Obj(x) = a else {
            return Ok(a.raw_eq(&b));
        };
        if let Some(sa) = self.heap.string(x) {
            return Ok(match self.heap.value_string(b) {
                Some(sb) => sa.data == sb.data,
                None => false,
            });
        }
        let key = self.special(Special::Eq);
        let Some(eq) = self.find_method(self.get_class(a), key) else {
            return Ok(a.raw_eq(&b));
        };
        if self.find_method(self.core.classes.object, key) == Some(eq) {
            return Ok(a.raw_eq(&b));
        }
        self.push(a);
        self.push(b);
        self.call_method_sync(eq, 1)?;
        Ok(self.pop().is_truthy())
    }

    /// Table hash of a value. Objects other than strings dispatch to their
    /// class's `__hash__`; `Object.__hash__` hashes identity.
    pub(crate) fn hash_value(&mut self, value: Value) -> Result<u64, Raised> {
        let r = match value {
            Value::Number(n) => return Ok(number_hash(n)),
            Value::Bool(true) => return Ok(1231),
            Value::Bool(false) => return Ok(1237),
            Value::Null => return Ok(0),
            Value::Obj(r) => r,
        };
        if let Some(s) = self.heap.string(r) {
            return Ok(s.hash as u64);
        }
        let key = self.special(Special::Hash);
        let Some(hash) = self.find_method(self.get_class(value), key) else {
            return Ok(identity_hash(r));
        };
        if self.find_method(self.core.classes.object, key) == Some(hash) {
            return Ok(identity_hash(r));
        }
        self.push(value);
        self.call_method_sync(hash, 0)?;
        match self.pop() {
            Value::Number(n) => Ok(number_hash(n)),
            _ => Err(self.throw(
                self.core.classes.type_exception,
                "__hash__() must return a Number",
            )),
        }
    }

    fn table_find(&mut self, table: ObjRef, key: Value, hash: u64) -> Result<Option<usize>, Raised> {
        let candidates = match self.heap.table(table) {
            Some(t) => t.candidates(hash),
            None => return Ok(None),
        };
        for position in candidates {
            let Some(entry_key) = self.heap.table(table).and_then(|t| t.entry(position)).map(|e| e.key) else {
                continue;
            };
            if self.values_equal(entry_key, key)? {
                return Ok(Some(position));
            }
        }
        Ok(None)
    }

    pub(crate) fn table_get(&mut self, table: ObjRef, key: Value) -> Result<Option<Value>, Raised> {
        let hash = self.hash_value(key)?;
        let position = self.table_find(table, key, hash)?;
        Ok(position.and_then(|p| self.heap.table(table).and_then(|t| t.entry(p)).map(|e| e.value)))
    }

    pub(crate) fn table_set(&mut self, table: ObjRef, key: Value, value: Value) -> Result<(), Raised> {
        let hash = self.hash_value(key)?;
        let position = self.table_find(table, key, hash)?;
        if let Some(t) = self.heap.table_mut(table) {
            match position {
                Some(p) => t.set_value(p, value),
                None => t.insert_new(hash, key, value),
            }
        }
        self.heap.resize(table);
        Ok(())
    }

    pub(crate) fn table_delete(&mut self, table: ObjRef, key: Value) -> Result<bool, Raised> {
        let hash = self.hash_value(key)?;
        let removed = match self.table_find(table, key, hash)? {
            Some(p) => self.heap.table_mut(table).and_then(|t| t.remove(p)).is_some(),
            None => false,
        };
        self.heap.resize(table);
        Ok(removed)
    }

    /// Stack: `[k0, v0, .., kn, vn]` → `[table]`.
    pub(crate) fn new_table(&mut self, count: usize) -> Result<(), Raised> {
        let start = self.stack.len() - count * 2;
        let table = self.alloc(Object::Table(ObjTable::default()));
        self.push(Value::Obj(table));
        for i in 0..count {
            let (key, value) = (self.stack[start + i * 2], self.stack[start + i * 2 + 1]);
            self.table_set(table, key, value)?;
        }
        self.stack.truncate(start);
        self.push(Value::Obj(table));
        Ok(())
    }

    /// Stack: `[seq]` → `[x0, .., xn-1]`. Extra elements are ignored.
    pub(crate) fn unpack(&mut self, count: usize) -> Result<(), Raised> {
        let value = self.peek(0);
        let items = match value.as_obj().map(|r| self.heap.get(r)) {
            Some(Object::List(l)) => l.items.clone(),
            Some(Object::Tuple(t)) => t.items.to_vec(),
            _ => {
                let message = format!(
                    "Cannot unpack a value of type {}",
                    self.class_name(self.get_class(value))
                );
                return Err(self.throw(self.core.classes.type_exception, &message));
            }
        };
        if items.len() < count {
            let message = format!(
                "Too few values to unpack: expected {}, got {}",
                count,
                items.len()
            );
            return Err(self.throw(self.core.classes.type_exception, &message));
        }
        self.pop();
        self.stack.extend_from_slice(&items[..count]);
        Ok(())
    }

    /// Normalize `index` (negative counts from the end) into `0..len`.
    fn check_index(&mut self, index: Value, len: usize, kind: &str) -> Result<usize, Raised> {
        let Some(i) = index.as_index() else {
            let message = format!("{} index must be an integer", kind);
            return Err(self.throw(self.core.classes.type_exception, &message));
        };
        let resolved = if i < 0 { i + len as i64 } else { i };
        if resolved < 0 || resolved >= len as i64 {
            let message = format!("{} index out of bounds: {}", kind, i);
            return Err(self.throw(self.core.classes.index_exception, &message));
        }
        Ok(resolved as usize)
    }

    /// Stack: `[object, index]` → `[object[index]]`.
    pub(crate) fn get_subscript(&mut self) -> Result<(), Raised> {
        let (object, index) = (self.peek(1), self.peek(0));
        let Some(r) = object.as_obj() else {
            return self.subscript_overload(object, Special::Get, 1);
        };

        let value = match self.heap.get(r) {
            Object::List(l) => {
                let len = l.items.len();
                let i = self.check_index(index, len, "List")?;
                self.heap.list(r).map_or(Value::Null, |l| l.items[i])
            }
            Object::Tuple(t) => {
                let len = t.items.len();
                let i = self.check_index(index, len, "Tuple")?;
                self.heap.tuple(r).map_or(Value::Null, |t| t.items[i])
            }
            Object::String(s) => {
                let len = s.data.len();
                let i = self.check_index(index, len, "String")?;
                let byte = self.heap.string(r).map_or(0, |s| s.data[i]);
                Value::Obj(self.intern(&[byte]))
            }
            Object::Table(_) => self.table_get(r, index)?.unwrap_or(Value::Null),
            _ => return self.subscript_overload(object, Special::Get, 1),
        };
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    /// Stack: `[object, index, value]` → `[value]`.
    pub(crate) fn set_subscript(&mut self) -> Result<(), Raised> {
        let (object, index, value) = (self.peek(2), self.peek(1), self.peek(0));
        let Some(r) = object.as_obj() else {
            return self.subscript_overload(object, Special::Set, 2);
        };

        match self.heap.get(r) {
            Object::List(l) => {
                let len = l.items.len();
                let i = self.check_index(index, len, "List")?;
                if let Some(ObjList { items }) = self.heap.list_mut(r) {
                    items[i] = value;
                }
            }
            Object::Table(_) => self.table_set(r, index, value)?,
            _ => return self.subscript_overload(object, Special::Set, 2),
        }
        self.pop();
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    fn subscript_overload(&mut self, object: Value, method: Special, argc: u8) -> Result<(), Raised> {
        let class = self.get_class(object);
        match self.find_method(class, self.special(method)) {
            Some(m) => self.call_method_value(m, argc),
            None => {
                let message = format!(
                    "Object `{}` is not subscriptable",
                    self.class_name(class)
                );
                Err(self.throw(self.core.classes.type_exception, &message))
            }
        }
    }
}
