//! Upvalue cells and the descriptors closures are built from.

use serde::{Deserialize, Serialize};

use super::value::Value;

/// An upvalue captures a variable from an enclosing scope.
///
/// While the variable is still on the stack (the enclosing function hasn't returned),
/// the upvalue is "open" and points to a stack slot.
/// Once the slot leaves the stack the upvalue is "closed": the value moves
/// into the cell itself. Every closure sharing the cell sees the change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Upvalue {
    /// Absolute index of a live stack slot.
    Open(usize),
    /// Holds the captured value after the enclosing scope exits.
    Closed(Value),
}

impl Upvalue {
    pub fn open_slot(&self) -> Option<usize> {
        match self {
            Upvalue::Open(slot) => Some(*slot),
            Upvalue::Closed(_) => None,
        }
    }
}

/// Descriptor emitted by the compiler for each upvalue a closure captures.
/// Used at runtime when creating the closure to wire up the upvalue references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpvalueDescriptor {
    /// If true, the upvalue captures a local from the immediately enclosing function.
    /// If false, it captures an upvalue from the enclosing function's upvalue list.
    pub is_local: bool,
    /// Index: either a local slot (if is_local) or an upvalue index in the enclosing closure.
    pub index: u16,
}
