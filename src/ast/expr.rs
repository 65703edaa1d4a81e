//! Expression AST nodes.

use crate::ast::stmt::FunctionDecl;
use crate::span::Span;

/// An expression in the AST.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// True for literals the compiler can fold into a constant slot.
    pub fn is_constant_literal(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Number(_) | ExprKind::String(_) | ExprKind::Bool(_) | ExprKind::Null
        )
    }

    /// True if evaluating this expression can yield from the enclosing
    /// function. Nested function literals are not searched.
    pub fn contains_yield(&self) -> bool {
        match &self.kind {
            ExprKind::Yield(_) => true,
            ExprKind::Number(_)
            | ExprKind::String(_)
            | ExprKind::Bool(_)
            | ExprKind::Null
            | ExprKind::Variable(_)
            | ExprKind::This
            | ExprKind::Function(_) => false,
            ExprKind::Unary { operand, .. } => operand.contains_yield(),
            ExprKind::Spread(inner) => inner.contains_yield(),
            ExprKind::Member { object, .. } => object.contains_yield(),
            ExprKind::Binary { left, right, .. }
            | ExprKind::LogicalAnd { left, right }
            | ExprKind::LogicalOr { left, right } => left.contains_yield() || right.contains_yield(),
            ExprKind::Assign { target, value } | ExprKind::CompoundAssign { target, value, .. } => {
                target.contains_yield() || value.contains_yield()
            }
            ExprKind::Index { object, index } => object.contains_yield() || index.contains_yield(),
            ExprKind::Ternary {
                condition,
                then_expr,
                else_expr,
            } => condition.contains_yield() || then_expr.contains_yield() || else_expr.contains_yield(),
            ExprKind::Call { callee, arguments } => {
                callee.contains_yield() || arguments.iter().any(Expr::contains_yield)
            }
            ExprKind::Super { arguments, .. } => arguments
                .as_ref()
                .is_some_and(|args| args.iter().any(Expr::contains_yield)),
            ExprKind::List(items) | ExprKind::Tuple(items) => items.iter().any(Expr::contains_yield),
            ExprKind::Table(entries) => entries
                .iter()
                .any(|(k, v)| k.contains_yield() || v.contains_yield()),
        }
    }
}

/// All expression variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// Number literal: 42, 3.14
    Number(f64),
    /// String literal: "hello"
    String(String),
    /// Boolean literal: true, false
    Bool(bool),
    /// Null literal
    Null,

    /// Variable reference: foo
    Variable(String),

    /// Binary operation: a + b
    Binary {
        left: Box<Expr>,
        operator: BinaryOp,
        right: Box<Expr>,
    },

    /// Unary operation: -x, !x
    Unary {
        operator: UnaryOp,
        operand: Box<Expr>,
    },

    /// Logical and: a && b
    LogicalAnd { left: Box<Expr>, right: Box<Expr> },

    /// Logical or: a || b
    LogicalOr { left: Box<Expr>, right: Box<Expr> },

    /// Conditional expression: cond ? a : b
    Ternary {
        condition: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },

    /// Assignment: x = v, obj.f = v, obj[i] = v
    Assign { target: Box<Expr>, value: Box<Expr> },

    /// Compound assignment: x += v
    CompoundAssign {
        target: Box<Expr>,
        operator: BinaryOp,
        value: Box<Expr>,
    },

    /// Function call: foo(a, b). A member callee compiles to a method invoke.
    Call {
        callee: Box<Expr>,
        arguments: Vec<Expr>,
    },

    /// Member access: obj.field
    Member { object: Box<Expr>, name: String },

    /// Subscript: obj[index]
    Index { object: Box<Expr>, index: Box<Expr> },

    /// this reference
    This,

    /// Superclass access inside a method.
    /// - `super.m(args)`: `method = Some(m)`, `arguments = Some(args)`
    /// - `super(args)`: calls the superclass method named like the enclosing one
    /// - `super.m`: bound method
    Super {
        method: Option<String>,
        arguments: Option<Vec<Expr>>,
    },

    /// List literal: [1, 2, 3]
    List(Vec<Expr>),

    /// Tuple literal: (1, 2, 3)
    Tuple(Vec<Expr>),

    /// Table literal: { k: v, ... }
    Table(Vec<(Expr, Expr)>),

    /// Anonymous function: fun(a) ... end
    Function(Box<FunctionDecl>),

    /// Spread argument or element: `f(...xs)`, `[...xs]`, `(...xs)`.
    /// Only valid in call arguments and list or tuple literals.
    Spread(Box<Expr>),

    /// `yield` or `yield v`; evaluates to the value the generator is
    /// resumed with.
    Yield(Option<Box<Expr>>),
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Is,
    BitAnd,
    BitOr,
    Xor,
    ShiftLeft,
    ShiftRight,
}

impl std::fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinaryOp::Add => write!(f, "+"),
            BinaryOp::Subtract => write!(f, "-"),
            BinaryOp::Multiply => write!(f, "*"),
            BinaryOp::Divide => write!(f, "/"),
            BinaryOp::Modulo => write!(f, "%"),
            BinaryOp::Power => write!(f, "^"),
            BinaryOp::Equal => write!(f, "=="),
            BinaryOp::NotEqual => write!(f, "!="),
            BinaryOp::Less => write!(f, "<"),
            BinaryOp::LessEqual => write!(f, "<="),
            BinaryOp::Greater => write!(f, ">"),
            BinaryOp::GreaterEqual => write!(f, ">="),
            BinaryOp::Is => write!(f, "is"),
            BinaryOp::BitAnd => write!(f, "&"),
            BinaryOp::BitOr => write!(f, "|"),
            BinaryOp::Xor => write!(f, "~"),
            BinaryOp::ShiftLeft => write!(f, "<<"),
            BinaryOp::ShiftRight => write!(f, ">>"),
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
    /// `~x`
    BitNot,
    /// `#x`: `x.__len__()`
    Len,
    /// `##x`: `x.__string__()`
    Stringify,
}

impl std::fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnaryOp::Negate => write!(f, "-"),
            UnaryOp::Not => write!(f, "!"),
            UnaryOp::BitNot => write!(f, "~"),
            UnaryOp::Len => write!(f, "#"),
            UnaryOp::Stringify => write!(f, "##"),
        }
    }
}
