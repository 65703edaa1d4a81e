//! Abstract Syntax Tree consumed by the bytecode compiler.
//!
//! The runtime ships no parser; a front end (or the helpers in [`build`])
//! produces these nodes.

pub mod build;
pub mod expr;
pub mod stmt;

pub use expr::{BinaryOp, Expr, ExprKind, UnaryOp};
pub use stmt::{
    ClassDecl, ExceptClause, FunctionDecl, ImportDecl, ImportItems, MethodDecl, NativeDecl,
    Parameter, Program, Stmt, StmtKind,
};
