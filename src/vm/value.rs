//! Tagged runtime values.

use std::fmt;

/// Handle to a heap object: an index into the VM's object arena.
///
/// Handles are only meaningful for the `Heap` that issued them and stay
/// valid while the object is reachable from a GC root.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(u32);

impl ObjRef {
    #[inline]
    pub(crate) fn new(index: usize) -> Self {
        Self(index as u32)
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A runtime value. Scalars are stored inline, everything else is a heap
/// handle.
///
/// The derived `PartialEq` is raw identity: IEEE-754 for numbers (so
/// `NaN != NaN`), handle comparison for objects. Overloaded equality lives
/// in `Vm::values_equal`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
    Null,
    Obj(ObjRef),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl Value {
    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Number(_))
    }

    #[inline]
    pub fn is_bool(&self) -> bool {
        matches!(self, Value::Bool(_))
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    #[inline]
    pub fn is_obj(&self) -> bool {
        matches!(self, Value::Obj(_))
    }

    #[inline]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[inline]
    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(r) => Some(*r),
            _ => None,
        }
    }

    /// `null` and `false` are falsy, everything else is truthy.
    #[inline]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Null | Value::Bool(false))
    }

    /// Scalar or handle comparison without operator overloading.
    #[inline]
    pub fn raw_eq(&self, other: &Value) -> bool {
        self == other
    }

    /// The value as an integer index, if it is a whole number.
    pub fn as_index(&self) -> Option<i64> {
        match self {
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<ObjRef> for Value {
    fn from(r: ObjRef) -> Self {
        Value::Obj(r)
    }
}

/// Render a number the way scripts print it: whole numbers without a
/// fractional part.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "nan".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Number(0.0).is_truthy());
        assert!(Value::Obj(ObjRef::new(0)).is_truthy());
    }

    #[test]
    fn test_raw_eq_is_ieee() {
        assert!(!Value::Number(f64::NAN).raw_eq(&Value::Number(f64::NAN)));
        assert!(Value::Number(0.0).raw_eq(&Value::Number(-0.0)));
        assert!(!Value::Null.raw_eq(&Value::Bool(false)));
        assert!(Value::Obj(ObjRef::new(3)).raw_eq(&Value::Obj(ObjRef::new(3))));
    }

    #[test]
    fn test_as_index() {
        assert_eq!(Value::Number(-2.0).as_index(), Some(-2));
        assert_eq!(Value::Number(1.5).as_index(), None);
        assert_eq!(Value::Null.as_index(), None);
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(-0.5), "-0.5");
        assert_eq!(format_number(f64::INFINITY), "inf");
        assert_eq!(format_number(1e20), "100000000000000000000");
    }
}
