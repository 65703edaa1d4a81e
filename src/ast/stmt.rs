//! Statement AST nodes.

use crate::ast::expr::Expr;
use crate::span::Span;

/// A statement in the AST.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { kind, span }
    }
}

/// Statement variants.
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// Expression statement
    Expression(Expr),

    /// Variable declaration: `var a = x` or `var a, b = tuple`.
    /// With several names the initializer is unpacked.
    Var {
        names: Vec<String>,
        initializer: Option<Expr>,
    },

    /// Block: begin ... end
    Block(Vec<Stmt>),

    If {
        condition: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },

    While {
        condition: Expr,
        body: Box<Stmt>,
    },

    /// C-style loop: for init; cond; step do ... end
    For {
        initializer: Option<Box<Stmt>>,
        condition: Option<Expr>,
        increment: Option<Expr>,
        body: Box<Stmt>,
    },

    /// for x in expr / for k, v in expr
    ForEach {
        names: Vec<String>,
        iterable: Expr,
        body: Box<Stmt>,
    },

    Break,
    Continue,
    Return(Option<Expr>),

    Raise(Expr),

    /// try ... except Class e ... ensure ... end
    Try {
        body: Box<Stmt>,
        excepts: Vec<ExceptClause>,
        ensure: Option<Box<Stmt>>,
    },

    /// `with name = value ... end`: `name.close()` runs when the body
    /// exits, unless `name` is falsy.
    With {
        variable: String,
        value: Expr,
        body: Box<Stmt>,
    },

    Function(FunctionDecl),
    Native(NativeDecl),
    Class(ClassDecl),
    Import(ImportDecl),
}

impl Stmt {
    /// True if this statement yields from the enclosing function.
    /// Nested function and class declarations are not searched.
    pub fn contains_yield(&self) -> bool {
        let any = |stmts: &[Stmt]| stmts.iter().any(Stmt::contains_yield);
        match &self.kind {
            StmtKind::Expression(e) | StmtKind::Raise(e) => e.contains_yield(),
            StmtKind::Var { initializer, .. } => initializer.as_ref().is_some_and(Expr::contains_yield),
            StmtKind::Block(stmts) => any(stmts),
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                condition.contains_yield()
                    || then_branch.contains_yield()
                    || else_branch.as_ref().is_some_and(|s| s.contains_yield())
            }
            StmtKind::While { condition, body } => condition.contains_yield() || body.contains_yield(),
            StmtKind::For {
                initializer,
                condition,
                increment,
                body,
            } => {
                initializer.as_ref().is_some_and(|s| s.contains_yield())
                    || condition.as_ref().is_some_and(Expr::contains_yield)
                    || increment.as_ref().is_some_and(Expr::contains_yield)
                    || body.contains_yield()
            }
            StmtKind::ForEach { iterable, body, .. } => iterable.contains_yield() || body.contains_yield(),
            StmtKind::Return(value) => value.as_ref().is_some_and(Expr::contains_yield),
            StmtKind::Try {
                body,
                excepts,
                ensure,
            } => {
                body.contains_yield()
                    || excepts.iter().any(|e| e.class.contains_yield() || e.body.contains_yield())
                    || ensure.as_ref().is_some_and(|s| s.contains_yield())
            }
            StmtKind::With { value, body, .. } => value.contains_yield() || body.contains_yield(),
            StmtKind::Break
            | StmtKind::Continue
            | StmtKind::Function(_)
            | StmtKind::Native(_)
            | StmtKind::Class(_)
            | StmtKind::Import(_) => false,
        }
    }
}

/// `except Class as name` handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptClause {
    pub class: Expr,
    pub variable: String,
    pub body: Box<Stmt>,
    pub span: Span,
}

/// A function parameter. Defaults must be constant literals.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub default_value: Option<Expr>,
    /// Names the argument is unpacked into: `fun f((a, b))`. Empty for
    /// a plain parameter.
    pub pattern: Vec<String>,
}

impl FunctionDecl {
    /// A function whose body yields is a generator.
    pub fn is_generator(&self) -> bool {
        self.body.iter().any(Stmt::contains_yield)
    }
}

/// A function or method declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<Parameter>,
    /// Name bound to the tuple of extra arguments, if any.
    pub vararg: Option<String>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

/// A function implemented by the host, resolved through the native registry.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeDecl {
    pub name: String,
    pub params: Vec<Parameter>,
    pub vararg: Option<String>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MethodDecl {
    Function(FunctionDecl),
    Native(NativeDecl),
}

impl MethodDecl {
    pub fn name(&self) -> &str {
        match self {
            MethodDecl::Function(f) => &f.name,
            MethodDecl::Native(n) => &n.name,
        }
    }
}

/// class Name is Super ... end
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDecl {
    pub name: String,
    pub superclass: Option<Expr>,
    pub methods: Vec<MethodDecl>,
    pub span: Span,
}

/// What an import binds.
#[derive(Debug, Clone, PartialEq)]
pub enum ImportItems {
    /// import a.b [as c]
    Module { alias: Option<String> },
    /// import a for x, y
    Names(Vec<String>),
    /// import a for *
    All,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportDecl {
    pub module: String,
    pub items: ImportItems,
}

impl ImportDecl {
    /// Name bound by `import a.b` without an alias: the last path segment.
    pub fn binding_name(&self) -> &str {
        match &self.items {
            ImportItems::Module { alias: Some(alias) } => alias,
            _ => self.module.rsplit('.').next().unwrap_or(&self.module),
        }
    }
}

/// A complete compilation unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub file: String,
    pub statements: Vec<Stmt>,
}

impl Program {
    pub fn new(file: impl Into<String>, statements: Vec<Stmt>) -> Self {
        Self {
            file: file.into(),
            statements,
        }
    }
}
