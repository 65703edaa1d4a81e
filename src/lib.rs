//! Corvid: an embeddable, class-based scripting runtime.
//!
//! The crate takes an AST (built by an external parser or by the helpers in
//! [`ast::build`]), compiles it to bytecode with [`vm::Compiler`] and runs it
//! on [`vm::Vm`], a stack machine with a tracing garbage collector. Hosts
//! drive the VM through the slot-based embedding API and can persist
//! compiled modules with [`vm::blob`].
//!
//! ```no_run
//! use corvid::ast::build::*;
//! use corvid::vm::Vm;
//!
//! let program = program(vec![expr(call_named("print", vec![string("hello")]))]);
//! let mut vm = Vm::new();
//! vm.eval_program(&program).unwrap();
//! ```

#![allow(clippy::module_inception)]
#![allow(clippy::result_large_err)]
#![allow(clippy::too_many_arguments)]

pub mod ast;
pub mod config;
pub mod error;
pub mod logging;
pub mod span;
pub mod vm;

pub use config::VmConfig;
pub use error::{CompileError, CorvidError, RuntimeError};
pub use vm::Vm;
