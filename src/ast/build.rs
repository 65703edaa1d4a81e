//! Terse constructors for hand-built ASTs.
//!
//! Every node starts at line 1; chain [`Expr::at`] / [`Stmt::at`] to place
//! it elsewhere.

use super::*;
use crate::span::Span;

impl Expr {
    pub fn at(mut self, line: usize) -> Self {
        self.span = Span::line(line);
        self
    }
}

impl Stmt {
    pub fn at(mut self, line: usize) -> Self {
        self.span = Span::line(line);
        self
    }
}

fn e(kind: ExprKind) -> Expr {
    Expr::new(kind, Span::line(1))
}

fn s(kind: StmtKind) -> Stmt {
    Stmt::new(kind, Span::line(1))
}

// --- Expressions ---

pub fn num(n: f64) -> Expr {
    e(ExprKind::Number(n))
}

pub fn string(text: &str) -> Expr {
    e(ExprKind::String(text.to_string()))
}

pub fn boolean(b: bool) -> Expr {
    e(ExprKind::Bool(b))
}

pub fn null() -> Expr {
    e(ExprKind::Null)
}

pub fn var(name: &str) -> Expr {
    e(ExprKind::Variable(name.to_string()))
}

pub fn this() -> Expr {
    e(ExprKind::This)
}

pub fn binary(left: Expr, operator: BinaryOp, right: Expr) -> Expr {
    e(ExprKind::Binary {
        left: Box::new(left),
        operator,
        right: Box::new(right),
    })
}

pub fn unary(operator: UnaryOp, operand: Expr) -> Expr {
    e(ExprKind::Unary {
        operator,
        operand: Box::new(operand),
    })
}

pub fn and(left: Expr, right: Expr) -> Expr {
    e(ExprKind::LogicalAnd {
        left: Box::new(left),
        right: Box::new(right),
    })
}

pub fn or(left: Expr, right: Expr) -> Expr {
    e(ExprKind::LogicalOr {
        left: Box::new(left),
        right: Box::new(right),
    })
}

pub fn ternary(condition: Expr, then_expr: Expr, else_expr: Expr) -> Expr {
    e(ExprKind::Ternary {
        condition: Box::new(condition),
        then_expr: Box::new(then_expr),
        else_expr: Box::new(else_expr),
    })
}

pub fn assign(target: Expr, value: Expr) -> Expr {
    e(ExprKind::Assign {
        target: Box::new(target),
        value: Box::new(value),
    })
}

pub fn compound(target: Expr, operator: BinaryOp, value: Expr) -> Expr {
    e(ExprKind::CompoundAssign {
        target: Box::new(target),
        operator,
        value: Box::new(value),
    })
}

pub fn call(callee: Expr, arguments: Vec<Expr>) -> Expr {
    e(ExprKind::Call {
        callee: Box::new(callee),
        arguments,
    })
}

/// `name(args)` for a named function.
pub fn call_named(name: &str, arguments: Vec<Expr>) -> Expr {
    call(var(name), arguments)
}

/// `object.name(args)`
pub fn invoke(object: Expr, name: &str, arguments: Vec<Expr>) -> Expr {
    call(member(object, name), arguments)
}

pub fn member(object: Expr, name: &str) -> Expr {
    e(ExprKind::Member {
        object: Box::new(object),
        name: name.to_string(),
    })
}

pub fn index(object: Expr, index: Expr) -> Expr {
    e(ExprKind::Index {
        object: Box::new(object),
        index: Box::new(index),
    })
}

/// `super.method(args)`, or `super(args)` when `method` is `None`.
pub fn super_call(method: Option<&str>, arguments: Vec<Expr>) -> Expr {
    e(ExprKind::Super {
        method: method.map(str::to_string),
        arguments: Some(arguments),
    })
}

/// `super.method` as a bound method.
pub fn super_member(method: &str) -> Expr {
    e(ExprKind::Super {
        method: Some(method.to_string()),
        arguments: None,
    })
}

pub fn list(items: Vec<Expr>) -> Expr {
    e(ExprKind::List(items))
}

pub fn tuple(items: Vec<Expr>) -> Expr {
    e(ExprKind::Tuple(items))
}

pub fn table(entries: Vec<(Expr, Expr)>) -> Expr {
    e(ExprKind::Table(entries))
}

/// `...inner` inside call arguments or a list/tuple literal.
pub fn spread(inner: Expr) -> Expr {
    e(ExprKind::Spread(Box::new(inner)))
}

pub fn yield_(value: Option<Expr>) -> Expr {
    e(ExprKind::Yield(value.map(Box::new)))
}

pub fn lambda(params: &[&str], body: Vec<Stmt>) -> Expr {
    e(ExprKind::Function(Box::new(function("", params, body))))
}

// --- Statements ---

pub fn expr(expr: Expr) -> Stmt {
    let span = expr.span;
    Stmt::new(StmtKind::Expression(expr), span)
}

pub fn var_decl(name: &str, initializer: Option<Expr>) -> Stmt {
    s(StmtKind::Var {
        names: vec![name.to_string()],
        initializer,
    })
}

/// `var a, b = initializer`
pub fn var_unpack(names: &[&str], initializer: Expr) -> Stmt {
    s(StmtKind::Var {
        names: names.iter().map(|n| n.to_string()).collect(),
        initializer: Some(initializer),
    })
}

pub fn block(statements: Vec<Stmt>) -> Stmt {
    s(StmtKind::Block(statements))
}

pub fn if_(condition: Expr, then_branch: Vec<Stmt>, else_branch: Option<Vec<Stmt>>) -> Stmt {
    s(StmtKind::If {
        condition,
        then_branch: Box::new(block(then_branch)),
        else_branch: else_branch.map(|b| Box::new(block(b))),
    })
}

pub fn while_(condition: Expr, body: Vec<Stmt>) -> Stmt {
    s(StmtKind::While {
        condition,
        body: Box::new(block(body)),
    })
}

pub fn for_(
    initializer: Option<Stmt>,
    condition: Option<Expr>,
    increment: Option<Expr>,
    body: Vec<Stmt>,
) -> Stmt {
    s(StmtKind::For {
        initializer: initializer.map(Box::new),
        condition,
        increment,
        body: Box::new(block(body)),
    })
}

pub fn for_each(names: &[&str], iterable: Expr, body: Vec<Stmt>) -> Stmt {
    s(StmtKind::ForEach {
        names: names.iter().map(|n| n.to_string()).collect(),
        iterable,
        body: Box::new(block(body)),
    })
}

pub fn break_() -> Stmt {
    s(StmtKind::Break)
}

pub fn continue_() -> Stmt {
    s(StmtKind::Continue)
}

pub fn ret(value: Option<Expr>) -> Stmt {
    s(StmtKind::Return(value))
}

pub fn raise(exception: Expr) -> Stmt {
    s(StmtKind::Raise(exception))
}

pub fn try_(body: Vec<Stmt>, excepts: Vec<ExceptClause>, ensure: Option<Vec<Stmt>>) -> Stmt {
    s(StmtKind::Try {
        body: Box::new(block(body)),
        excepts,
        ensure: ensure.map(|b| Box::new(block(b))),
    })
}

/// `with variable = value ... end`
pub fn with_(variable: &str, value: Expr, body: Vec<Stmt>) -> Stmt {
    s(StmtKind::With {
        variable: variable.to_string(),
        value,
        body: Box::new(block(body)),
    })
}

pub fn except(class: Expr, variable: &str, body: Vec<Stmt>) -> ExceptClause {
    ExceptClause {
        class,
        variable: variable.to_string(),
        body: Box::new(block(body)),
        span: Span::line(1),
    }
}

pub fn param(name: &str) -> Parameter {
    Parameter {
        name: name.to_string(),
        default_value: None,
        pattern: Vec::new(),
    }
}

pub fn param_default(name: &str, value: Expr) -> Parameter {
    Parameter {
        name: name.to_string(),
        default_value: Some(value),
        pattern: Vec::new(),
    }
}

/// A parameter unpacked into `names`: `fun f((a, b))`.
pub fn param_unpack(names: &[&str]) -> Parameter {
    Parameter {
        name: format!("({})", names.join(", ")),
        default_value: None,
        pattern: names.iter().map(|n| n.to_string()).collect(),
    }
}

pub fn function(name: &str, params: &[&str], body: Vec<Stmt>) -> FunctionDecl {
    FunctionDecl {
        name: name.to_string(),
        params: params.iter().map(|p| param(p)).collect(),
        vararg: None,
        body,
        span: Span::line(1),
    }
}

pub fn fun(name: &str, params: &[&str], body: Vec<Stmt>) -> Stmt {
    s(StmtKind::Function(function(name, params, body)))
}

pub fn fun_decl(decl: FunctionDecl) -> Stmt {
    let span = decl.span;
    Stmt::new(StmtKind::Function(decl), span)
}

pub fn native(name: &str, params: &[&str]) -> NativeDecl {
    NativeDecl {
        name: name.to_string(),
        params: params.iter().map(|p| param(p)).collect(),
        vararg: None,
        span: Span::line(1),
    }
}

pub fn native_stmt(decl: NativeDecl) -> Stmt {
    let span = decl.span;
    Stmt::new(StmtKind::Native(decl), span)
}

pub fn method(decl: FunctionDecl) -> MethodDecl {
    MethodDecl::Function(decl)
}

pub fn class(name: &str, superclass: Option<Expr>, methods: Vec<MethodDecl>) -> Stmt {
    s(StmtKind::Class(ClassDecl {
        name: name.to_string(),
        superclass,
        methods,
        span: Span::line(1),
    }))
}

pub fn import(module: &str) -> Stmt {
    s(StmtKind::Import(ImportDecl {
        module: module.to_string(),
        items: ImportItems::Module { alias: None },
    }))
}

pub fn import_for(module: &str, names: &[&str]) -> Stmt {
    s(StmtKind::Import(ImportDecl {
        module: module.to_string(),
        items: ImportItems::Names(names.iter().map(|n| n.to_string()).collect()),
    }))
}

pub fn import_all(module: &str) -> Stmt {
    s(StmtKind::Import(ImportDecl {
        module: module.to_string(),
        items: ImportItems::All,
    }))
}

pub fn program(statements: Vec<Stmt>) -> Program {
    Program::new("<test>", statements)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_moves_span() {
        let stmt = expr(num(1.0).at(7));
        assert_eq!(stmt.span.line, 7);
        assert_eq!(ret(None).at(3).span, Span::line(3));
    }

    #[test]
    fn test_yield_search_skips_nested_functions() {
        let nested = function("outer", &[], vec![fun("inner", &[], vec![expr(yield_(None))])]);
        assert!(!nested.is_generator());

        let direct = function(
            "gen",
            &[],
            vec![while_(boolean(true), vec![expr(assign(var("x"), yield_(Some(num(1.0)))))])],
        );
        assert!(direct.is_generator());
    }

    #[test]
    fn test_import_binding_name() {
        let StmtKind::Import(decl) = import("net.http").kind else {
            panic!("expected import");
        };
        assert_eq!(decl.binding_name(), "http");
    }
}
