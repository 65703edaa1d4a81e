//! Statement compilation: AST statements to bytecode.

use crate::ast::stmt::{ExceptClause, ImportDecl, ImportItems, NativeDecl, StmtKind};
use crate::ast::{Expr, ExprKind, Stmt};
use crate::error::CompileResult;
use crate::span::Span;

use super::chunk::{Constant, NativeProto};
use super::compiler::{Compiler, FunctionType, TryContext, TryPhase};
use super::opcode::Op;

use std::rc::Rc;

impl Compiler {
    /// Compile a statement.
    pub fn compile_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        let line = stmt.span.line;
        match &stmt.kind {
            StmtKind::Expression(expr) => {
                self.compile_expr(expr)?;
                self.emit(Op::Pop, line);
            }
            StmtKind::Var { names, initializer } => {
                self.compile_var(names, initializer.as_ref(), stmt.span)?;
            }
            StmtKind::Block(stmts) => {
                self.begin_scope();
                for s in stmts {
                    self.compile_stmt(s)?;
                }
                self.end_scope(line);
            }
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.compile_if_stmt(condition, then_branch, else_branch.as_deref(), stmt.span)?;
            }
            StmtKind::While { condition, body } => {
                self.compile_while(condition, body, stmt.span)?;
            }
            StmtKind::For {
                initializer,
                condition,
                increment,
                body,
            } => {
                self.compile_for(
                    initializer.as_deref(),
                    condition.as_ref(),
                    increment.as_ref(),
                    body,
                    stmt.span,
                )?;
            }
            StmtKind::ForEach {
                names,
                iterable,
                body,
            } => {
                self.compile_for_each(names, iterable, body, stmt.span)?;
            }
            StmtKind::Break => self.compile_break(stmt.span)?,
            StmtKind::Continue => self.compile_continue(stmt.span)?,
            StmtKind::Return(expr) => self.compile_return(expr.as_ref(), stmt.span)?,
            StmtKind::Raise(expr) => {
                self.compile_expr(expr)?;
                self.emit(Op::Raise, line);
            }
            StmtKind::Try {
                body,
                excepts,
                ensure,
            } => {
                self.compile_try(body, excepts, ensure.as_deref(), stmt.span)?;
            }
            StmtKind::With {
                variable,
                value,
                body,
            } => {
                self.compile_with(variable, value, body, stmt.span)?;
            }
            StmtKind::Function(decl) => {
                if self.scope_depth > 0 {
                    // Declared before the body so the function can call itself
                    self.define_local(&decl.name, decl.span)?;
                    self.compile_function(
                        FunctionType::Function,
                        decl.name.clone(),
                        &decl.params,
                        decl.vararg.as_deref(),
                        &decl.body,
                        decl.span,
                    )?;
                } else {
                    self.compile_function(
                        FunctionType::Function,
                        decl.name.clone(),
                        &decl.params,
                        decl.vararg.as_deref(),
                        &decl.body,
                        decl.span,
                    )?;
                    self.define_variable(&decl.name, decl.span)?;
                }
            }
            StmtKind::Native(decl) => {
                let idx = self.native_constant(decl)?;
                self.emit(Op::Native(idx), line);
                self.define_variable(&decl.name, decl.span)?;
            }
            StmtKind::Class(decl) => {
                self.compile_class_decl(decl)?;
            }
            StmtKind::Import(decl) => {
                self.compile_import(decl, stmt.span)?;
            }
        }
        Ok(())
    }

    fn compile_var(
        &mut self,
        names: &[String],
        initializer: Option<&Expr>,
        span: Span,
    ) -> CompileResult<()> {
        let global = self.scope_depth == 0;
        if !global {
            for name in names {
                self.declare_variable(name, span)?;
            }
        }

        match initializer {
            Some(init) => {
                self.compile_expr(init)?;
                if names.len() > 1 {
                    if names.len() > u8::MAX as usize {
                        return Err(self.error("Too many names to unpack", span));
                    }
                    self.emit(Op::Unpack(names.len() as u8), span.line);
                }
            }
            None => {
                for _ in names {
                    self.emit(Op::Null, span.line);
                }
            }
        }

        if global {
            // Unpacked values are stacked in order, the last name on top
            for name in names.iter().rev() {
                let idx = self.add_string_constant(name, span)?;
                self.emit(Op::DefineGlobal(idx), span.line);
            }
        } else {
            self.mark_initialized(names.len());
        }
        Ok(())
    }

    fn compile_if_stmt(
        &mut self,
        condition: &Expr,
        then_branch: &Stmt,
        else_branch: Option<&Stmt>,
        span: Span,
    ) -> CompileResult<()> {
        self.compile_expr(condition)?;
        let then_jump = self.emit_jump(Op::JumpIfFalse(0), span.line);

        self.compile_stmt(then_branch)?;

        if let Some(else_stmt) = else_branch {
            let else_jump = self.emit_jump(Op::Jump(0), span.line);
            self.patch_jump(then_jump, span)?;
            self.compile_stmt(else_stmt)?;
            self.patch_jump(else_jump, span)?;
        } else {
            self.patch_jump(then_jump, span)?;
        }
        Ok(())
    }

    fn compile_while(&mut self, condition: &Expr, body: &Stmt, span: Span) -> CompileResult<()> {
        let loop_start = self.current_offset();
        self.begin_loop(Some(loop_start));

        self.compile_expr(condition)?;
        let exit_jump = self.emit_jump(Op::JumpIfFalse(0), span.line);

        self.compile_stmt(body)?;
        self.emit_loop(loop_start, span)?;
        self.patch_jump(exit_jump, span)?;

        self.end_loop(span)
    }

    fn compile_for(
        &mut self,
        initializer: Option<&Stmt>,
        condition: Option<&Expr>,
        increment: Option<&Expr>,
        body: &Stmt,
        span: Span,
    ) -> CompileResult<()> {
        self.begin_scope();
        if let Some(init) = initializer {
            self.compile_stmt(init)?;
        }

        let loop_start = self.current_offset();
        let exit_jump = match condition {
            Some(cond) => {
                self.compile_expr(cond)?;
                Some(self.emit_jump(Op::JumpIfFalse(0), span.line))
            }
            None => None,
        };

        // `continue` lands on the increment, which is emitted after the body
        self.begin_loop(None);
        self.compile_stmt(body)?;
        self.patch_continues(span)?;

        if let Some(step) = increment {
            self.compile_expr(step)?;
            self.emit(Op::Pop, span.line);
        }
        self.emit_loop(loop_start, span)?;

        if let Some(exit) = exit_jump {
            self.patch_jump(exit, span)?;
        }
        self.end_loop(span)?;
        self.end_scope(span.line);
        Ok(())
    }

    /// `for x in e`: hidden locals hold the iterated value, the iterator
    /// state and the cached `__iter__`/`__next__` methods.
    fn compile_for_each(
        &mut self,
        names: &[String],
        iterable: &Expr,
        body: &Stmt,
        span: Span,
    ) -> CompileResult<()> {
        let line = span.line;
        self.begin_scope();

        self.compile_expr(iterable)?;
        self.define_local(".expr", span)?;
        self.emit(Op::Null, line);
        self.define_local(".iter", span)?;
        self.emit(Op::ForPrep, line);
        self.define_local(".__iter__", span)?;
        self.define_local(".__next__", span)?;

        let loop_start = self.current_offset();
        self.begin_loop(Some(loop_start));
        self.emit(Op::ForIter, line);
        let exit_jump = self.emit_jump(Op::ForNext(0), line);

        self.begin_scope();
        if names.len() > 1 {
            if names.len() > u8::MAX as usize {
                return Err(self.error("Too many names to unpack", span));
            }
            self.emit(Op::Unpack(names.len() as u8), line);
        }
        for name in names {
            self.declare_variable(name, span)?;
        }
        self.mark_initialized(names.len());
        self.compile_stmt(body)?;
        self.end_scope(line);

        self.emit_loop(loop_start, span)?;
        self.patch_jump(exit_jump, span)?;
        self.end_loop(span)?;

        self.end_scope(line);
        Ok(())
    }

    fn compile_break(&mut self, span: Span) -> CompileResult<()> {
        let Some(ctx) = self.loops.last() else {
            return Err(self.error("Cannot use `break` outside of a loop", span));
        };
        let (locals_len, try_depth) = (ctx.locals_len, ctx.try_depth);

        self.exit_try_blocks(try_depth, span)?;
        self.discard_locals(locals_len, span.line);
        let jump = self.emit_jump(Op::Jump(0), span.line);
        if let Some(ctx) = self.loops.last_mut() {
            ctx.break_patches.push(jump);
        }
        Ok(())
    }

    fn compile_continue(&mut self, span: Span) -> CompileResult<()> {
        let Some(ctx) = self.loops.last() else {
            return Err(self.error("Cannot use `continue` outside of a loop", span));
        };
        let (locals_len, try_depth, target) = (ctx.locals_len, ctx.try_depth, ctx.continue_target);

        self.exit_try_blocks(try_depth, span)?;
        self.discard_locals(locals_len, span.line);
        match target {
            Some(start) => self.emit_loop(start, span)?,
            None => {
                let jump = self.emit_jump(Op::Jump(0), span.line);
                if let Some(ctx) = self.loops.last_mut() {
                    ctx.continue_patches.push(jump);
                }
            }
        }
        Ok(())
    }

    /// Leave every `try` entered since the loop began: drop its handlers
    /// and run its pending ensure body inline, innermost first.
    fn exit_try_blocks(&mut self, try_depth: usize, span: Span) -> CompileResult<()> {
        if self.try_blocks.len() <= try_depth {
            return Ok(());
        }
        let saved_locals = self.locals.clone();
        let saved_tries = self.try_blocks.clone();

        for i in (try_depth..saved_tries.len()).rev() {
            let block = &saved_tries[i];
            self.discard_locals(block.locals_len, span.line);
            self.locals.truncate(block.locals_len);
            for _ in 0..block.live_handlers() {
                self.emit(Op::PopHandler, span.line);
            }
            if block.phase != TryPhase::Ensure {
                if let Some(ensure) = &block.ensure {
                    self.try_blocks.truncate(i);
                    self.compile_stmt(ensure)?;
                }
            }
        }

        // Captures made by the inlined ensure bodies must survive the restore
        let mut locals = saved_locals;
        for (restored, current) in locals.iter_mut().zip(&self.locals) {
            restored.is_captured |= current.is_captured;
        }
        self.locals = locals;
        self.try_blocks = saved_tries;
        Ok(())
    }

    fn compile_return(&mut self, value: Option<&Expr>, span: Span) -> CompileResult<()> {
        match self.function_type {
            FunctionType::Script => {
                return Err(self.error("Cannot use `return` outside of a function", span));
            }
            FunctionType::Constructor => {
                if value.is_some() {
                    return Err(self.error("Cannot return a value from a constructor", span));
                }
                self.emit(Op::GetLocal(0), span.line);
            }
            FunctionType::Function | FunctionType::Method => match value {
                Some(expr) => self.compile_expr(expr)?,
                None => {
                    self.emit(Op::Null, span.line);
                }
            },
        }
        self.emit_return(span.line);
        Ok(())
    }

    /// `with x = e body` runs as
    /// `begin var x = null try x = e body ensure if x then x.close() end end end`.
    fn compile_with(&mut self, variable: &str, value: &Expr, body: &Stmt, span: Span) -> CompileResult<()> {
        let at = |kind: StmtKind| Stmt::new(kind, span);
        let close = at(StmtKind::If {
            condition: Expr::new(ExprKind::Variable(variable.to_string()), span),
            then_branch: Box::new(at(StmtKind::Expression(Expr::new(
                ExprKind::Call {
                    callee: Box::new(Expr::new(
                        ExprKind::Member {
                            object: Box::new(Expr::new(ExprKind::Variable(variable.to_string()), span)),
                            name: "close".to_string(),
                        },
                        span,
                    )),
                    arguments: Vec::new(),
                },
                span,
            )))),
            else_branch: None,
        });
        let assign = at(StmtKind::Expression(Expr::new(
            ExprKind::Assign {
                target: Box::new(Expr::new(ExprKind::Variable(variable.to_string()), span)),
                value: Box::new(value.clone()),
            },
            span,
        )));
        let desugared = at(StmtKind::Block(vec![
            at(StmtKind::Var {
                names: vec![variable.to_string()],
                initializer: None,
            }),
            at(StmtKind::Try {
                body: Box::new(at(StmtKind::Block(vec![assign, body.clone()]))),
                excepts: Vec::new(),
                ensure: Some(Box::new(close)),
            }),
        ]));
        self.compile_stmt(&desugared)
    }

    fn compile_try(
        &mut self,
        body: &Stmt,
        excepts: &[ExceptClause],
        ensure: Option<&Stmt>,
        span: Span,
    ) -> CompileResult<()> {
        let line = span.line;
        let has_except = !excepts.is_empty();

        let ensure_setup = match ensure {
            Some(_) => Some(self.emit_jump(Op::SetupEnsure(0), line)),
            None => None,
        };
        let except_setup = if has_except {
            Some(self.emit_jump(Op::SetupExcept(0), line))
        } else {
            None
        };

        self.try_blocks.push(TryContext {
            locals_len: self.locals.len(),
            has_except,
            ensure: ensure.cloned(),
            phase: TryPhase::Body,
        });
        self.compile_stmt(body)?;

        if has_except {
            self.emit(Op::PopHandler, line);
        }
        if ensure.is_some() {
            self.emit(Op::PopHandler, line);
            // No exception and no pending return
            self.emit(Op::Null, line);
            self.emit(Op::Null, line);
        }

        self.begin_scope();
        self.define_local(".exception", span)?;
        self.define_local(".cause", span)?;

        if let Some(except_setup) = except_setup {
            self.set_try_phase(TryPhase::Except);
            let skip_excepts = self.emit_jump(Op::Jump(0), line);
            self.patch_jump(except_setup, span)?;
            self.compile_excepts(excepts)?;

            if ensure.is_some() {
                self.emit(Op::PopHandler, line);
            } else {
                self.emit(Op::EndHandler, line);
                self.end_scope(line);
            }
            self.patch_jump(skip_excepts, span)?;
        }

        if let (Some(ensure), Some(ensure_setup)) = (ensure, ensure_setup) {
            self.set_try_phase(TryPhase::Ensure);
            self.patch_jump(ensure_setup, span)?;
            self.compile_stmt(ensure)?;
            self.emit(Op::EndHandler, line);
            self.end_scope(line);
        }

        self.try_blocks.pop();
        Ok(())
    }

    fn set_try_phase(&mut self, phase: TryPhase) {
        if let Some(block) = self.try_blocks.last_mut() {
            block.phase = phase;
        }
    }

    /// Each clause tests `.exception is Class`; a match binds the variable,
    /// runs the body and clears `.cause` to mark the exception handled.
    fn compile_excepts(&mut self, excepts: &[ExceptClause]) -> CompileResult<()> {
        let exception_slot = self.resolve_local(".exception", Span::default())?;
        let cause_slot = self.resolve_local(".cause", Span::default())?;
        let (Some(exception_slot), Some(cause_slot)) = (exception_slot, cause_slot) else {
            return Err(self.error("Exception handler locals missing", Span::default()));
        };

        let mut exit_jumps = Vec::new();
        for (i, clause) in excepts.iter().enumerate() {
            let line = clause.span.line;
            self.emit(Op::GetLocal(exception_slot), line);
            self.compile_expr(&clause.class)?;
            self.emit(Op::Is, line);
            let next_clause = self.emit_jump(Op::JumpIfFalse(0), line);

            self.begin_scope();
            self.emit(Op::GetLocal(exception_slot), line);
            self.define_local(&clause.variable, clause.span)?;
            self.compile_stmt(&clause.body)?;

            self.emit(Op::Null, line);
            self.emit(Op::SetLocal(cause_slot), line);
            self.emit(Op::Pop, line);
            self.end_scope(line);

            if i + 1 < excepts.len() {
                exit_jumps.push(self.emit_jump(Op::Jump(0), line));
            }
            self.patch_jump(next_clause, clause.span)?;
        }
        for jump in exit_jumps {
            self.patch_jump(jump, Span::default())?;
        }
        Ok(())
    }

    pub(crate) fn native_constant(&mut self, decl: &NativeDecl) -> CompileResult<u16> {
        if let Some(param) = decl.params.iter().find(|p| !p.pattern.is_empty()) {
            return Err(self.error(
                format!("Native `{}` cannot unpack parameter `{}`", decl.name, param.name),
                decl.span,
            ));
        }
        let defaults = self.parameter_defaults(&decl.params, decl.span)?;
        let proto = NativeProto {
            name: decl.name.clone(),
            arity: decl.params.len() as u8,
            defaults,
            vararg: decl.vararg.is_some(),
        };
        self.add_constant(Constant::Native(Rc::new(proto)), decl.span)
    }

    fn compile_import(&mut self, decl: &ImportDecl, span: Span) -> CompileResult<()> {
        let line = span.line;
        let module = self.add_string_constant(&decl.module, span)?;
        match &decl.items {
            ImportItems::Module { .. } => {
                // Leaves [module, init result]
                self.emit(Op::Import(module), line);
                self.emit(Op::Pop, line);
                let name = decl.binding_name().to_string();
                self.define_variable(&name, span)?;
            }
            ImportItems::Names(names) => {
                self.emit(Op::ImportFrom(module), line);
                self.emit(Op::Pop, line);
                for name in names {
                    let idx = self.add_string_constant(name, span)?;
                    self.emit(Op::ImportName(module, idx), line);
                    self.define_variable(name, span)?;
                }
            }
            ImportItems::All => {
                self.emit(Op::ImportFrom(module), line);
                self.emit(Op::Pop, line);
                self.emit(Op::ImportAll(module), line);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::build::*;
    use crate::ast::BinaryOp;
    use crate::vm::chunk::FunctionProto;
    use crate::vm::compiler::Compiler;
    use crate::vm::opcode::Op;
    use pretty_assertions::assert_eq;

    fn compile(stmts: Vec<crate::ast::Stmt>) -> FunctionProto {
        let module = Compiler::compile(&program(stmts)).unwrap();
        (*module.main).clone()
    }

    fn compile_err(stmts: Vec<crate::ast::Stmt>) -> String {
        Compiler::compile(&program(stmts)).unwrap_err().message
    }

    #[test]
    fn test_global_var() {
        let proto = compile(vec![var_decl("x", Some(num(1.0)))]);
        assert_eq!(
            proto.chunk.code,
            vec![Op::Constant(0), Op::DefineGlobal(1), Op::Null, Op::Return]
        );
    }

    #[test]
    fn test_local_var_in_block() {
        let proto = compile(vec![block(vec![
            var_decl("x", Some(num(1.0))),
            expr(var("x")),
        ])]);
        assert_eq!(
            proto.chunk.code,
            vec![
                Op::Constant(0),
                Op::GetLocal(1),
                Op::Pop,
                Op::Pop,
                Op::Null,
                Op::Return
            ]
        );
    }

    #[test]
    fn test_unpack_globals_defined_in_reverse() {
        let proto = compile(vec![var_unpack(&["a", "b"], tuple(vec![num(1.0), num(2.0)]))]);
        assert_eq!(
            &proto.chunk.code[..5],
            &[
                Op::Constant(0),
                Op::Constant(1),
                Op::NewTuple(2),
                Op::Unpack(2),
                Op::DefineGlobal(2),
            ]
        );
        assert_eq!(proto.chunk.constant_str(2), Some("b"));
    }

    #[test]
    fn test_redeclare_in_scope() {
        let err = compile_err(vec![block(vec![
            var_decl("x", None),
            var_decl("x", None),
        ])]);
        assert_eq!(err, "Variable `x` already declared in this scope");
    }

    #[test]
    fn test_shadowing_in_inner_scope_is_allowed() {
        compile(vec![block(vec![
            var_decl("x", None),
            block(vec![var_decl("x", None)]),
        ])]);
    }

    #[test]
    fn test_read_in_own_initializer() {
        let err = compile_err(vec![block(vec![var_decl("x", Some(var("x")))])]);
        assert_eq!(err, "Cannot read local variable `x` in its own initializer");
    }

    #[test]
    fn test_break_outside_loop() {
        assert_eq!(
            compile_err(vec![break_()]),
            "Cannot use `break` outside of a loop"
        );
        assert_eq!(
            compile_err(vec![continue_()]),
            "Cannot use `continue` outside of a loop"
        );
    }

    #[test]
    fn test_return_outside_function() {
        assert_eq!(
            compile_err(vec![ret(None)]),
            "Cannot use `return` outside of a function"
        );
    }

    #[test]
    fn test_while_loop_layout() {
        let proto = compile(vec![while_(boolean(true), vec![break_()])]);
        assert_eq!(
            proto.chunk.code,
            vec![
                Op::True,
                Op::JumpIfFalse(2),
                Op::Jump(1),
                Op::Loop(4),
                Op::Null,
                Op::Return
            ]
        );
    }

    #[test]
    fn test_break_pops_loop_locals() {
        let proto = compile(vec![while_(
            boolean(true),
            vec![var_decl("x", Some(num(1.0))), break_()],
        )]);
        // Constant, then the break pops `x` and jumps past the scope-end Pop and the Loop
        assert_eq!(
            &proto.chunk.code[2..7],
            &[Op::Constant(0), Op::Pop, Op::Jump(2), Op::Pop, Op::Loop(7)]
        );
    }

    #[test]
    fn test_for_continue_targets_increment() {
        let proto = compile(vec![for_(
            Some(var_decl("i", Some(num(0.0)))),
            Some(binary(var("i"), BinaryOp::Less, num(3.0))),
            Some(compound(var("i"), BinaryOp::Add, num(1.0))),
            vec![continue_()],
        )]);
        let code = &proto.chunk.code;
        let jump_at = code.iter().position(|op| matches!(op, Op::Jump(_))).unwrap();
        let target = code[jump_at].forward_target(jump_at).unwrap();
        // The increment starts by reading `i`
        assert_eq!(code[target], Op::GetLocal(1));
    }

    #[test]
    fn test_for_each_layout() {
        let proto = compile(vec![for_each(&["x"], list(vec![]), vec![])]);
        assert_eq!(
            proto.chunk.code,
            vec![
                Op::NewList(0),
                Op::Null,
                Op::ForPrep,
                Op::ForIter,
                Op::ForNext(2),
                Op::Pop,
                Op::Loop(4),
                Op::Pop,
                Op::Pop,
                Op::Pop,
                Op::Pop,
                Op::Null,
                Op::Return
            ]
        );
    }

    #[test]
    fn test_try_except_ensure_layout() {
        let proto = compile(vec![try_(
            vec![],
            vec![except(var("Exception"), "e", vec![])],
            Some(vec![]),
        )]);
        let code = &proto.chunk.code;
        assert_eq!(code[0], Op::SetupEnsure(16));
        assert_eq!(code[1], Op::SetupExcept(5));
        assert_eq!(&code[2..7], &[Op::PopHandler, Op::PopHandler, Op::Null, Op::Null, Op::Jump(10)]);
        assert_eq!(&code[7..11], &[Op::GetLocal(1), Op::GetGlobal(0), Op::Is, Op::JumpIfFalse(5)]);
        // Clause end pops `e`, then the except path drops the except handler
        assert_eq!(&code[15..17], &[Op::Pop, Op::PopHandler]);
        assert_eq!(&code[17..20], &[Op::EndHandler, Op::Pop, Op::Pop]);
    }

    #[test]
    fn test_break_inside_try_runs_ensure_inline() {
        let proto = compile(vec![while_(
            boolean(true),
            vec![try_(
                vec![break_()],
                vec![],
                Some(vec![expr(call_named("print", vec![]))]),
            )],
        )]);
        let code = &proto.chunk.code;
        let get_print = code
            .iter()
            .filter(|op| matches!(op, Op::GetGlobal(_)))
            .count();
        // Once inline for the break, once in the handler
        assert_eq!(get_print, 2);
        let setup = code.iter().position(|op| matches!(op, Op::SetupEnsure(_))).unwrap();
        assert_eq!(code[setup + 1], Op::PopHandler);
    }

    #[test]
    fn test_import_forms() {
        let proto = compile(vec![import("a.b"), import_for("c", &["x"]), import_all("d")]);
        assert_eq!(
            proto.chunk.code,
            vec![
                Op::Import(0),
                Op::Pop,
                Op::DefineGlobal(1),
                Op::ImportFrom(2),
                Op::Pop,
                Op::ImportName(2, 3),
                Op::DefineGlobal(3),
                Op::ImportFrom(4),
                Op::Pop,
                Op::ImportAll(4),
                Op::Null,
                Op::Return
            ]
        );
        assert_eq!(proto.chunk.constant_str(1), Some("b"));
    }

    #[test]
    fn test_with_closes_in_ensure() {
        let proto = compile(vec![with_("f", call_named("open", vec![]), vec![])]);
        let code = &proto.chunk.code;
        assert_eq!(&code[..2], &[Op::Null, Op::SetupEnsure(7)]);
        let close = code
            .iter()
            .find_map(|op| match op {
                Op::Invoke0(idx) => Some(*idx),
                _ => None,
            })
            .unwrap();
        assert_eq!(proto.chunk.constant_str(close), Some("close"));
    }

    #[test]
    fn test_native_rejects_unpacked_parameter() {
        let mut decl = native("read", &[]);
        decl.params = vec![param_unpack(&["a", "b"])];
        assert_eq!(
            compile_err(vec![native_stmt(decl)]),
            "Native `read` cannot unpack parameter `(a, b)`"
        );
    }

    #[test]
    fn test_local_function_can_recurse() {
        let proto = compile(vec![block(vec![fun(
            "f",
            &[],
            vec![expr(call_named("f", vec![]))],
        )])]);
        let crate::vm::chunk::Constant::Function(f) = &proto.chunk.constants[0] else {
            panic!("expected function constant");
        };
        assert_eq!(f.upvalue_count, 1);
        assert_eq!(f.chunk.code[0], Op::GetUpvalue(0));
    }
}
