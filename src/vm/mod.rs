//! Bytecode runtime: compiles the AST to bytecode and executes it on a
//! stack-based VM with a mark-and-sweep collected heap.

pub mod api;
pub mod blob;
pub mod chunk;
pub mod compiler;
pub mod compiler_classes;
pub mod compiler_exprs;
pub mod compiler_stmts;
pub(crate) mod core;
pub mod disassembler;
pub mod gc;
pub mod heap;
pub mod object;
pub mod opcode;
pub(crate) mod operators;
pub mod table;
pub mod upvalue;
pub mod value;
#[allow(clippy::module_inception)]
pub mod vm;
pub mod vm_calls;
pub mod vm_classes;
pub mod vm_exceptions;

pub use chunk::{CompiledModule, Constant, FunctionProto};
pub use compiler::Compiler;
pub use disassembler::disassemble;
pub use heap::GcStats;
pub use object::{NativeFn, NativeResult};
pub use opcode::Op;
pub use value::{ObjRef, Value};
pub use vm::{ImportResolver, Vm};
