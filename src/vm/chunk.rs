//! Bytecode chunk and function prototype types.
//!
//! Prototypes are heap-independent: they hold plain Rust constants and can
//! be shared, cached or serialized. The VM turns them into heap `Function`
//! objects when a module is loaded.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use super::opcode::Op;

/// A constant value stored in a chunk's constant pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Number(f64),
    String(String),
    Bool(bool),
    Null,
    /// A compiled function prototype.
    Function(Rc<FunctionProto>),
    /// A `native` declaration, resolved through the registry at run time.
    Native(Rc<NativeProto>),
}

/// Signature of a `native` declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeProto {
    pub name: String,
    pub arity: u8,
    pub defaults: Vec<Constant>,
    pub vararg: bool,
}

/// A compiled function (or top-level script).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionProto {
    /// Function name (empty string for top-level script).
    pub name: String,
    /// Number of declared parameters, including those with defaults.
    pub arity: u8,
    /// Defaults for the trailing parameters.
    pub defaults: Vec<Constant>,
    /// Extra arguments are packed into a tuple in the slot after the
    /// declared parameters.
    pub vararg: bool,
    /// Number of upvalues a closure of this function captures.
    pub upvalue_count: u16,
    /// The bytecode instructions.
    pub chunk: Chunk,
}

impl FunctionProto {
    pub fn new(name: String) -> Self {
        Self {
            name,
            arity: 0,
            defaults: Vec::new(),
            vararg: false,
            upvalue_count: 0,
            chunk: Chunk::new(),
        }
    }

    /// Name shown in stack traces.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "<main>"
        } else {
            &self.name
        }
    }
}

/// One run of consecutive instructions compiled from the same line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRun {
    pub line: u32,
    pub count: u32,
}

/// Run-length-encoded source lines, parallel to `Chunk::code`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineTable {
    runs: Vec<LineRun>,
}

impl LineTable {
    pub fn push(&mut self, line: usize) {
        let line = line as u32;
        match self.runs.last_mut() {
            Some(run) if run.line == line => run.count += 1,
            _ => self.runs.push(LineRun { line, count: 1 }),
        }
    }

    /// Source line of the instruction at `offset`.
    pub fn line_at(&self, offset: usize) -> Option<usize> {
        let mut remaining = offset;
        for run in &self.runs {
            if remaining < run.count as usize {
                return Some(run.line as usize);
            }
            remaining -= run.count as usize;
        }
        None
    }

    /// Number of instructions covered.
    pub fn len(&self) -> usize {
        self.runs.iter().map(|r| r.count as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn runs(&self) -> &[LineRun] {
        &self.runs
    }
}

/// A chunk of bytecode: instructions + constant pool + line info.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// The bytecode instructions.
    pub code: Vec<Op>,
    /// Constant pool.
    pub constants: Vec<Constant>,
    /// Source lines, run-length encoded.
    pub lines: LineTable,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit an instruction and record its source line.
    pub fn emit(&mut self, op: Op, line: usize) -> usize {
        let offset = self.code.len();
        self.code.push(op);
        self.lines.push(line);
        offset
    }

    /// Add a constant to the pool and return its index. Strings and
    /// numbers are de-duplicated. Returns `None` once the pool is full.
    pub fn add_constant(&mut self, constant: Constant) -> Option<u16> {
        let existing = match &constant {
            Constant::String(s) => self
                .constants
                .iter()
                .position(|c| matches!(c, Constant::String(existing) if existing == s)),
            Constant::Number(n) => self
                .constants
                .iter()
                .position(|c| matches!(c, Constant::Number(existing) if existing.to_bits() == n.to_bits())),
            _ => None,
        };
        if let Some(idx) = existing {
            return Some(idx as u16);
        }
        let idx = self.constants.len();
        if idx > u16::MAX as usize {
            return None;
        }
        self.constants.push(constant);
        Some(idx as u16)
    }

    /// Get the current offset (next instruction index).
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Line of the instruction at `offset`.
    pub fn line_at(&self, offset: usize) -> Option<usize> {
        self.lines.line_at(offset)
    }

    /// Patch a forward jump at `offset` to land on the next instruction
    /// to be emitted. Returns false if the distance does not fit.
    pub fn patch_jump(&mut self, offset: usize) -> bool {
        let jump = self.code.len() - offset - 1;
        if jump > u16::MAX as usize {
            return false;
        }
        let jump = jump as u16;
        match &mut self.code[offset] {
            Op::Jump(target)
            | Op::JumpIfFalse(target)
            | Op::JumpIfTrue(target)
            | Op::SetupExcept(target)
            | Op::SetupEnsure(target)
            | Op::ForNext(target) => {
                *target = jump;
            }
            _ => panic!("Tried to patch non-jump instruction at offset {}", offset),
        }
        true
    }

    /// Name stored in string constant `idx`.
    pub fn constant_str(&self, idx: u16) -> Option<&str> {
        match self.constants.get(idx as usize) {
            Some(Constant::String(s)) => Some(s),
            _ => None,
        }
    }
}

/// A compiled module: the top-level script function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledModule {
    /// Source file the module was compiled from.
    pub file: String,
    pub main: Rc<FunctionProto>,
}
