//! Error types for compilation, loading and execution.

use crate::span::Span;
use std::fmt;
use thiserror::Error;

/// A static error found while compiling one unit. No bytecode is produced.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{file}:{span}: {message}")]
pub struct CompileError {
    pub message: String,
    pub file: String,
    pub span: Span,
}

impl CompileError {
    pub fn new(message: impl Into<String>, file: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            file: file.into(),
            span,
        }
    }
}

pub type CompileResult<T> = Result<T, CompileError>;

/// One frame of a captured stack trace, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub line: Option<usize>,
    pub module: String,
    pub function: String,
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "[line {}]", line)?,
            None => write!(f, "[line ?]")?,
        }
        write!(f, " module {} in {}", self.module, self.function)
    }
}

/// An exception that unwound past the outermost frame of an evaluation.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{class}: {message}")]
pub struct RuntimeError {
    pub class: String,
    pub message: String,
    pub trace: Vec<TraceRecord>,
}

/// Bytecode that breaks the VM's structural assumptions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid bytecode in `{function}` at {offset}: {message}")]
pub struct InternalError {
    pub function: String,
    pub offset: usize,
    pub message: String,
}

/// Errors reading a persisted bytecode blob.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlobError {
    #[error("not a corvid bytecode file")]
    NotBytecode,

    #[error("incompatible bytecode version {}.{} (expected {}.{})", found.0, found.1, expected.0, expected.1)]
    Version {
        found: (u8, u8),
        expected: (u8, u8),
    },

    #[error("corrupt bytecode: {0}")]
    Corrupt(String),
}

impl From<InternalError> for BlobError {
    fn from(err: InternalError) -> Self {
        Self::Corrupt(err.to_string())
    }
}

/// Rejected VM configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Marker returned by operations that raised: the exception object sits on
/// top of the VM stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Raised;

/// A unified error type for all phases.
#[derive(Debug, Error)]
pub enum CorvidError {
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Internal error: {0}")]
    Internal(#[from] InternalError),

    #[error("Bytecode error: {0}")]
    Blob(#[from] BlobError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}
