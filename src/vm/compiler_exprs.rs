//! Expression compilation: AST expressions to bytecode.

use crate::ast::expr::{BinaryOp, ExprKind, UnaryOp};
use crate::ast::Expr;
use crate::error::CompileResult;
use crate::span::Span;

use super::chunk::Constant;
use super::compiler::{Compiler, FunctionType, VariableAccess, MAX_ARGS};
use super::opcode::Op;

impl Compiler {
    /// Compile an expression; the result is left on the stack.
    pub fn compile_expr(&mut self, expr: &Expr) -> CompileResult<()> {
        let line = expr.span.line;
        match &expr.kind {
            ExprKind::Number(n) => {
                self.emit_constant(Constant::Number(*n), expr.span)?;
            }
            ExprKind::String(s) => {
                self.emit_constant(Constant::String(s.clone()), expr.span)?;
            }
            ExprKind::Bool(b) => {
                self.emit(if *b { Op::True } else { Op::False }, line);
            }
            ExprKind::Null => {
                self.emit(Op::Null, line);
            }
            ExprKind::Variable(name) => {
                self.compile_variable_get(name, expr.span)?;
            }
            ExprKind::Binary {
                left,
                operator,
                right,
            } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit_binary_op(*operator, line);
            }
            ExprKind::Unary { operator, operand } => {
                self.compile_expr(operand)?;
                match operator {
                    UnaryOp::Negate => self.emit(Op::Negate, line),
                    UnaryOp::Not => self.emit(Op::Not, line),
                    UnaryOp::BitNot => self.emit(Op::Invert, line),
                    UnaryOp::Len => {
                        let idx = self.add_string_constant("__len__", expr.span)?;
                        self.emit(Op::Invoke0(idx), line)
                    }
                    UnaryOp::Stringify => {
                        let idx = self.add_string_constant("__string__", expr.span)?;
                        self.emit(Op::Invoke0(idx), line)
                    }
                };
            }
            ExprKind::LogicalAnd { left, right } => {
                self.compile_expr(left)?;
                self.emit(Op::Dup, line);
                let jump = self.emit_jump(Op::JumpIfFalse(0), line);
                self.emit(Op::Pop, line);
                self.compile_expr(right)?;
                self.patch_jump(jump, expr.span)?;
            }
            ExprKind::LogicalOr { left, right } => {
                self.compile_expr(left)?;
                self.emit(Op::Dup, line);
                let jump = self.emit_jump(Op::JumpIfTrue(0), line);
                self.emit(Op::Pop, line);
                self.compile_expr(right)?;
                self.patch_jump(jump, expr.span)?;
            }
            ExprKind::Ternary {
                condition,
                then_expr,
                else_expr,
            } => {
                self.compile_expr(condition)?;
                let else_jump = self.emit_jump(Op::JumpIfFalse(0), line);
                self.compile_expr(then_expr)?;
                let end_jump = self.emit_jump(Op::Jump(0), line);
                self.patch_jump(else_jump, expr.span)?;
                self.compile_expr(else_expr)?;
                self.patch_jump(end_jump, expr.span)?;
            }
            ExprKind::Assign { target, value } => {
                self.compile_assign(target, value)?;
            }
            ExprKind::CompoundAssign {
                target,
                operator,
                value,
            } => {
                self.compile_compound_assign(target, *operator, value)?;
            }
            ExprKind::Call { callee, arguments } => {
                self.compile_call(callee, arguments, expr.span)?;
            }
            ExprKind::Member { object, name } => {
                self.compile_expr(object)?;
                let idx = self.add_string_constant(name, expr.span)?;
                self.emit(Op::GetField(idx), line);
            }
            ExprKind::Index { object, index } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.emit(Op::GetSubscript, line);
            }
            ExprKind::This => {
                self.compile_this(expr.span)?;
            }
            ExprKind::Super { method, arguments } => {
                self.compile_super(method.as_deref(), arguments.as_deref(), expr.span)?;
            }
            ExprKind::List(items) if has_spread(items) => {
                self.compile_spread_list(items)?;
            }
            ExprKind::Tuple(items) if has_spread(items) => {
                self.compile_spread_list(items)?;
                self.emit(Op::ListToTuple, line);
            }
            ExprKind::List(items) => {
                let count = self.compile_items(items, expr.span)?;
                self.emit(Op::NewList(count), line);
            }
            ExprKind::Tuple(items) => {
                let count = self.compile_items(items, expr.span)?;
                self.emit(Op::NewTuple(count), line);
            }
            ExprKind::Table(entries) => {
                if entries.len() > u16::MAX as usize {
                    return Err(self.error("Too many entries in table literal", expr.span));
                }
                for (key, value) in entries {
                    self.compile_expr(key)?;
                    self.compile_expr(value)?;
                }
                self.emit(Op::NewTable(entries.len() as u16), line);
            }
            ExprKind::Function(decl) => {
                let name = if decl.name.is_empty() {
                    format!("<anon:{}>", line)
                } else {
                    decl.name.clone()
                };
                self.compile_function(
                    FunctionType::Function,
                    name,
                    &decl.params,
                    decl.vararg.as_deref(),
                    &decl.body,
                    decl.span,
                )?;
            }
            ExprKind::Spread(_) => {
                return Err(self.error(
                    "Spread is only allowed in call arguments and list or tuple literals",
                    expr.span,
                ));
            }
            ExprKind::Yield(value) => {
                if !self.generator {
                    return Err(self.error("Cannot use `yield` outside of a function", expr.span));
                }
                match value {
                    Some(value) => self.compile_expr(value)?,
                    None => {
                        self.emit(Op::Null, line);
                    }
                }
                // Resuming pushes the sent value as the result
                self.emit(Op::Yield, line);
            }
        }
        Ok(())
    }

    /// `[a, ...b]`: an empty list extended item by item.
    fn compile_spread_list(&mut self, items: &[Expr]) -> CompileResult<()> {
        for (i, item) in items.iter().enumerate() {
            if i == 0 {
                self.emit(Op::NewList(0), item.span.line);
            }
            match &item.kind {
                ExprKind::Spread(inner) => {
                    self.compile_expr(inner)?;
                    self.emit(Op::ExtendList, item.span.line);
                }
                _ => {
                    self.compile_expr(item)?;
                    self.emit(Op::AppendList, item.span.line);
                }
            }
        }
        Ok(())
    }

    fn compile_variable_get(&mut self, name: &str, span: Span) -> CompileResult<()> {
        match self.resolve_variable(name, span)? {
            VariableAccess::Local(slot) => self.emit(Op::GetLocal(slot), span.line),
            VariableAccess::Upvalue(idx) => self.emit(Op::GetUpvalue(idx), span.line),
            VariableAccess::Global(name) => {
                let idx = self.add_string_constant(&name, span)?;
                self.emit(Op::GetGlobal(idx), span.line)
            }
        };
        Ok(())
    }

    fn compile_variable_set(&mut self, name: &str, span: Span) -> CompileResult<()> {
        match self.resolve_variable(name, span)? {
            VariableAccess::Local(slot) => self.emit(Op::SetLocal(slot), span.line),
            VariableAccess::Upvalue(idx) => self.emit(Op::SetUpvalue(idx), span.line),
            VariableAccess::Global(name) => {
                let idx = self.add_string_constant(&name, span)?;
                self.emit(Op::SetGlobal(idx), span.line)
            }
        };
        Ok(())
    }

    fn emit_binary_op(&mut self, op: BinaryOp, line: usize) {
        match op {
            BinaryOp::Add => self.emit(Op::Add, line),
            BinaryOp::Subtract => self.emit(Op::Subtract, line),
            BinaryOp::Multiply => self.emit(Op::Multiply, line),
            BinaryOp::Divide => self.emit(Op::Divide, line),
            BinaryOp::Modulo => self.emit(Op::Modulo, line),
            BinaryOp::Power => self.emit(Op::Power, line),
            BinaryOp::Equal => self.emit(Op::Equal, line),
            BinaryOp::NotEqual => {
                self.emit(Op::Equal, line);
                self.emit(Op::Not, line)
            }
            BinaryOp::Less => self.emit(Op::Less, line),
            BinaryOp::LessEqual => self.emit(Op::LessEqual, line),
            BinaryOp::Greater => self.emit(Op::Greater, line),
            BinaryOp::GreaterEqual => self.emit(Op::GreaterEqual, line),
            BinaryOp::Is => self.emit(Op::Is, line),
            BinaryOp::BitAnd => self.emit(Op::BitAnd, line),
            BinaryOp::BitOr => self.emit(Op::BitOr, line),
            BinaryOp::Xor => self.emit(Op::Xor, line),
            BinaryOp::ShiftLeft => self.emit(Op::ShiftLeft, line),
            BinaryOp::ShiftRight => self.emit(Op::ShiftRight, line),
        };
    }

    fn compile_items(&mut self, items: &[Expr], span: Span) -> CompileResult<u16> {
        if items.len() > u16::MAX as usize {
            return Err(self.error("Too many elements in collection literal", span));
        }
        for item in items {
            self.compile_expr(item)?;
        }
        Ok(items.len() as u16)
    }

    fn compile_arguments(&mut self, arguments: &[Expr], span: Span) -> CompileResult<u8> {
        if arguments.len() > MAX_ARGS {
            return Err(self.error(
                format!("Too many arguments (max {})", MAX_ARGS),
                span,
            ));
        }
        for arg in arguments {
            self.compile_expr(arg)?;
        }
        Ok(arguments.len() as u8)
    }

    fn compile_call(&mut self, callee: &Expr, arguments: &[Expr], span: Span) -> CompileResult<()> {
        let spread = has_spread(arguments);
        if let ExprKind::Member { object, name } = &callee.kind {
            // recv.m(args) dispatches without materializing a bound method
            self.compile_expr(object)?;
            if spread {
                self.compile_spread_list(arguments)?;
                let idx = self.add_string_constant(name, span)?;
                self.emit(Op::InvokeUnpack(idx), span.line);
            } else {
                let argc = self.compile_arguments(arguments, span)?;
                let idx = self.add_string_constant(name, span)?;
                self.emit(Op::invoke(argc, idx), span.line);
            }
            return Ok(());
        }

        self.compile_expr(callee)?;
        if spread {
            self.compile_spread_list(arguments)?;
            self.emit(Op::CallUnpack, span.line);
        } else {
            let argc = self.compile_arguments(arguments, span)?;
            self.emit(Op::call(argc), span.line);
        }
        Ok(())
    }

    fn compile_assign(&mut self, target: &Expr, value: &Expr) -> CompileResult<()> {
        let line = target.span.line;
        match &target.kind {
            ExprKind::Variable(name) => {
                self.compile_expr(value)?;
                self.compile_variable_set(name, target.span)?;
            }
            ExprKind::Member { object, name } => {
                self.compile_expr(object)?;
                self.compile_expr(value)?;
                let idx = self.add_string_constant(name, target.span)?;
                self.emit(Op::SetField(idx), line);
            }
            ExprKind::Index { object, index } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.compile_expr(value)?;
                self.emit(Op::SetSubscript, line);
            }
            _ => return Err(self.error("Invalid assignment target", target.span)),
        }
        Ok(())
    }

    fn compile_compound_assign(
        &mut self,
        target: &Expr,
        operator: BinaryOp,
        value: &Expr,
    ) -> CompileResult<()> {
        let line = target.span.line;
        match &target.kind {
            ExprKind::Variable(name) => {
                self.compile_variable_get(name, target.span)?;
                self.compile_expr(value)?;
                self.emit_binary_op(operator, line);
                self.compile_variable_set(name, target.span)?;
            }
            ExprKind::Member { object, name } => {
                let idx = self.add_string_constant(name, target.span)?;
                self.compile_expr(object)?;
                self.emit(Op::Dup, line);
                self.emit(Op::GetField(idx), line);
                self.compile_expr(value)?;
                self.emit_binary_op(operator, line);
                self.emit(Op::SetField(idx), line);
            }
            ExprKind::Index { object, index } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.emit(Op::Dup2, line);
                self.emit(Op::GetSubscript, line);
                self.compile_expr(value)?;
                self.emit_binary_op(operator, line);
                self.emit(Op::SetSubscript, line);
            }
            _ => return Err(self.error("Invalid assignment target", target.span)),
        }
        Ok(())
    }

    fn compile_this(&mut self, span: Span) -> CompileResult<()> {
        if self.class_context.is_none() {
            return Err(self.error("Cannot use `this` outside of a method", span));
        }
        self.compile_variable_get("this", span)
    }

    /// `super.m(args)`, `super(args)` and `super.m`. The superclass lives in
    /// the hidden `super` local of the class body.
    fn compile_super(
        &mut self,
        method: Option<&str>,
        arguments: Option<&[Expr]>,
        span: Span,
    ) -> CompileResult<()> {
        let Some(ctx) = &self.class_context else {
            return Err(self.error("Cannot use `super` outside of a method", span));
        };
        let name = match method {
            Some(name) => name.to_string(),
            None => ctx.method.clone(),
        };

        self.compile_variable_get("this", span)?;
        match arguments {
            Some(arguments) if has_spread(arguments) => {
                self.compile_spread_list(arguments)?;
                self.compile_variable_get("super", span)?;
                let idx = self.add_string_constant(&name, span)?;
                self.emit(Op::SuperUnpack(idx), span.line);
            }
            Some(arguments) => {
                let argc = self.compile_arguments(arguments, span)?;
                self.compile_variable_get("super", span)?;
                let idx = self.add_string_constant(&name, span)?;
                self.emit(Op::Super(argc, idx), span.line);
            }
            None => {
                if method.is_none() {
                    return Err(self.error("Expected a method call or access after `super`", span));
                }
                self.compile_variable_get("super", span)?;
                let idx = self.add_string_constant(&name, span)?;
                self.emit(Op::SuperBind(idx), span.line);
            }
        }
        Ok(())
    }
}

fn has_spread(items: &[Expr]) -> bool {
    items.iter().any(|item| matches!(item.kind, ExprKind::Spread(_)))
}
