//! Bytecode opcodes for the Corvid VM.
//!
//! Jump operands are instruction counts relative to the instruction after
//! the jump: forward for `Jump`, `JumpIfFalse`, `JumpIfTrue`, `SetupExcept`,
//! `SetupEnsure` and `ForNext`, backward for `Loop`. Name operands are
//! indices of string constants.

use serde::{Deserialize, Serialize};

use super::upvalue::UpvalueDescriptor;

/// A single bytecode instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    // --- Constants & Literals ---
    /// Push a constant from the constant pool onto the stack.
    Constant(u16),
    /// Push null.
    Null,
    /// Push true.
    True,
    /// Push false.
    False,

    // --- Stack manipulation ---
    /// Pop the top value off the stack.
    Pop,
    /// Duplicate the top of the stack.
    Dup,
    /// Duplicate the top two values, keeping their order.
    Dup2,

    // --- Variables ---
    /// Get a local variable by frame slot index.
    GetLocal(u16),
    /// Set a local variable by frame slot index.
    SetLocal(u16),
    /// Get a global variable of the current module.
    GetGlobal(u16),
    /// Set a global variable of the current module.
    SetGlobal(u16),
    /// Pop the top value into a new global.
    DefineGlobal(u16),

    // --- Upvalues (closures) ---
    GetUpvalue(u16),
    SetUpvalue(u16),
    /// Close the upvalue on the top slot, then pop it.
    CloseUpvalue,

    // --- Fields & subscripts ---
    /// [object] -> [value]
    GetField(u16),
    /// [object, value] -> [value]
    SetField(u16),
    /// [object, index] -> [value]
    GetSubscript,
    /// [object, index, value] -> [value]
    SetSubscript,

    // --- Arithmetic ---
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
    Negate,

    // --- Bitwise ---
    /// Operands must have an integer representation; the result is the
    /// operation on their `i64` values.
    BitAnd,
    BitOr,
    Xor,
    ShiftLeft,
    ShiftRight,
    Invert,

    // --- Comparison ---
    Equal,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    /// [value, class] -> [bool]
    Is,

    // --- Logical ---
    Not,

    // --- Control flow ---
    Jump(u16),
    /// Pop the condition; jump if it is falsy.
    JumpIfFalse(u16),
    /// Pop the condition; jump if it is truthy.
    JumpIfTrue(u16),
    Loop(u16),

    // --- Calls ---
    Call0,
    Call1,
    Call2,
    Call3,
    Call4,
    Call5,
    Call6,
    Call7,
    Call8,
    Call9,
    Call10,
    Call(u8),
    /// Call method `name` on the receiver below the arguments.
    Invoke0(u16),
    Invoke1(u16),
    Invoke2(u16),
    Invoke3(u16),
    Invoke4(u16),
    Invoke5(u16),
    Invoke6(u16),
    Invoke7(u16),
    Invoke8(u16),
    Invoke9(u16),
    Invoke10(u16),
    Invoke(u8, u16),
    /// [callee, args list]: call with the list's elements as arguments.
    CallUnpack,
    /// [receiver, args list]: invoke method `name` with the list's
    /// elements as arguments.
    InvokeUnpack(u16),
    /// [this, args.., superclass]: call the superclass method `name`.
    Super(u8, u16),
    /// [this, args list, superclass]
    SuperUnpack(u16),
    /// [this, superclass] -> [bound method]
    SuperBind(u16),
    Return,

    // --- Closures ---
    /// Materialize the function constant as a closure capturing the
    /// described upvalues.
    Closure(u16, Vec<UpvalueDescriptor>),
    /// Resolve a native declaration through the registry; pushes it.
    Native(u16),

    // --- Collections ---
    NewList(u16),
    NewTuple(u16),
    /// Build a table from 2n stacked key/value values.
    NewTable(u16),
    /// Replace a List or Tuple with its first n elements.
    Unpack(u8),
    /// [list, value] -> [list], appending the value.
    AppendList,
    /// [list, iterable] -> [list], appending every element.
    ExtendList,
    /// [list] -> [tuple]
    ListToTuple,

    // --- Classes ---
    /// Push the core `Object` class.
    GetObject,
    NewClass(u16),
    /// [superclass, class] -> [superclass, class], inheriting methods.
    Subclass,
    /// [class, method] -> [class]
    DefMethod(u16),
    /// [class] -> [class], binding the native method declared by the
    /// constant.
    NativeMethod(u16),

    // --- Exceptions ---
    SetupExcept(u16),
    SetupEnsure(u16),
    PopHandler,
    /// Finish an except or ensure block: re-raise or resume a return
    /// depending on the cause on the stack.
    EndHandler,
    Raise,

    // --- Iteration ---
    /// Cache `__iter__` and `__next__` of the iterated value's class.
    ForPrep,
    /// Call `__iter__(expr, iter)`.
    ForIter,
    /// Store the iterator state; jump out if falsy, else call `__next__`.
    ForNext(u16),

    // --- Generators ---
    /// Function prologue of a generator: save the frame into a new
    /// generator and return it.
    Generator,
    /// Suspend the generator, returning the value on top to its caller.
    Yield,
    /// Mark the running generator as completed.
    GeneratorClose,

    // --- Modules ---
    /// Load module `name` if needed and push it.
    Import(u16),
    /// Load module `name` if needed without binding it.
    ImportFrom(u16),
    /// Push global `name` of module `module`.
    ImportName(u16, u16),
    /// Copy every global of `module` into the current module.
    ImportAll(u16),
}

impl Op {
    /// The call instruction for `argc` arguments.
    pub fn call(argc: u8) -> Op {
        match argc {
            0 => Op::Call0,
            1 => Op::Call1,
            2 => Op::Call2,
            3 => Op::Call3,
            4 => Op::Call4,
            5 => Op::Call5,
            6 => Op::Call6,
            7 => Op::Call7,
            8 => Op::Call8,
            9 => Op::Call9,
            10 => Op::Call10,
            n => Op::Call(n),
        }
    }

    /// The invoke instruction for `argc` arguments and method `name`.
    pub fn invoke(argc: u8, name: u16) -> Op {
        match argc {
            0 => Op::Invoke0(name),
            1 => Op::Invoke1(name),
            2 => Op::Invoke2(name),
            3 => Op::Invoke3(name),
            4 => Op::Invoke4(name),
            5 => Op::Invoke5(name),
            6 => Op::Invoke6(name),
            7 => Op::Invoke7(name),
            8 => Op::Invoke8(name),
            9 => Op::Invoke9(name),
            10 => Op::Invoke10(name),
            n => Op::Invoke(n, name),
        }
    }

    /// Argument count of a call instruction.
    pub fn call_argc(&self) -> Option<u8> {
        Some(match self {
            Op::Call0 => 0,
            Op::Call1 => 1,
            Op::Call2 => 2,
            Op::Call3 => 3,
            Op::Call4 => 4,
            Op::Call5 => 5,
            Op::Call6 => 6,
            Op::Call7 => 7,
            Op::Call8 => 8,
            Op::Call9 => 9,
            Op::Call10 => 10,
            Op::Call(n) => *n,
            _ => return None,
        })
    }

    /// Argument count and method name of an invoke instruction.
    pub fn invoke_args(&self) -> Option<(u8, u16)> {
        Some(match self {
            Op::Invoke0(name) => (0, *name),
            Op::Invoke1(name) => (1, *name),
            Op::Invoke2(name) => (2, *name),
            Op::Invoke3(name) => (3, *name),
            Op::Invoke4(name) => (4, *name),
            Op::Invoke5(name) => (5, *name),
            Op::Invoke6(name) => (6, *name),
            Op::Invoke7(name) => (7, *name),
            Op::Invoke8(name) => (8, *name),
            Op::Invoke9(name) => (9, *name),
            Op::Invoke10(name) => (10, *name),
            Op::Invoke(n, name) => (*n, *name),
            _ => return None,
        })
    }

    /// Target offset of a forward jump at `offset`, if this is one.
    pub fn forward_target(&self, offset: usize) -> Option<usize> {
        match self {
            Op::Jump(j)
            | Op::JumpIfFalse(j)
            | Op::JumpIfTrue(j)
            | Op::SetupExcept(j)
            | Op::SetupEnsure(j)
            | Op::ForNext(j) => Some(offset + 1 + *j as usize),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_specialization() {
        assert_eq!(Op::call(0), Op::Call0);
        assert_eq!(Op::call(10), Op::Call10);
        assert_eq!(Op::call(11), Op::Call(11));
        for argc in [0u8, 3, 10, 42] {
            assert_eq!(Op::call(argc).call_argc(), Some(argc));
            assert_eq!(Op::invoke(argc, 7).invoke_args(), Some((argc, 7)));
        }
        assert_eq!(Op::Pop.call_argc(), None);
    }

    #[test]
    fn test_forward_target() {
        assert_eq!(Op::Jump(3).forward_target(10), Some(14));
        assert_eq!(Op::Loop(3).forward_target(10), None);
    }
}
