//! AST-to-bytecode compiler.
//!
//! Single-pass compilation: walks the AST once, emitting bytecode into a `Chunk`.
//! Variable resolution happens at compile time: locals become frame slot
//! indices, captured variables become upvalues, and everything else is a
//! global looked up by name at run time.

use std::rc::Rc;

use crate::ast::stmt::{Parameter, Program, Stmt};
use crate::error::{CompileError, CompileResult};
use crate::logging::COMPILER_TARGET;
use crate::span::Span;

use super::chunk::{Chunk, CompiledModule, Constant, FunctionProto};
use super::opcode::Op;
use super::upvalue::UpvalueDescriptor;

const MAX_LOCALS: usize = u16::MAX as usize + 1;
const MAX_UPVALUES: usize = u16::MAX as usize + 1;
pub(crate) const MAX_ARGS: usize = u8::MAX as usize;

/// A local variable tracked during compilation.
#[derive(Debug, Clone)]
pub struct Local {
    pub name: String,
    /// Scope depth, or -1 while the initializer is being compiled.
    pub depth: i32,
    pub is_captured: bool,
}

/// Tracks what kind of function is being compiled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FunctionType {
    Script,
    Function,
    Method,
    Constructor,
}

/// The compiler: transforms AST into bytecode.
pub struct Compiler {
    /// The function prototype being built.
    pub proto: FunctionProto,
    /// Local variables in scope, slot 0 first.
    pub locals: Vec<Local>,
    /// Current scope depth (0 = global).
    pub scope_depth: i32,
    /// Upvalue descriptors for the current function.
    pub upvalues: Vec<UpvalueDescriptor>,
    /// Enclosing compiler (for nested functions/closures).
    pub enclosing: Option<Box<Compiler>>,
    /// What kind of function we're compiling.
    pub function_type: FunctionType,
    /// The body yields: calls return a generator.
    pub generator: bool,
    /// Loops enclosing the current statement, innermost last.
    pub loops: Vec<LoopContext>,
    /// `try` statements enclosing the current statement, innermost last.
    pub try_blocks: Vec<TryContext>,
    /// Set inside methods (and closures nested in them) for this/super.
    pub class_context: Option<ClassContext>,
    /// Source file, for diagnostics.
    pub file: Rc<str>,
}

#[derive(Debug, Clone)]
pub struct LoopContext {
    /// Where `continue` lands, if already emitted (backward jump).
    pub continue_target: Option<usize>,
    /// Forward `continue` jumps, patched once the target is emitted.
    pub continue_patches: Vec<usize>,
    pub break_patches: Vec<usize>,
    /// Number of locals live when the body starts.
    pub locals_len: usize,
    /// Number of enclosing `try` statements when the loop started.
    pub try_depth: usize,
}

/// Which part of a `try` statement is being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryPhase {
    Body,
    Except,
    Ensure,
}

#[derive(Debug, Clone)]
pub struct TryContext {
    /// Number of locals live at the handler setup.
    pub locals_len: usize,
    pub has_except: bool,
    /// Copy of the ensure block, replayed inline by `break`/`continue`.
    pub ensure: Option<Stmt>,
    pub phase: TryPhase,
}

impl TryContext {
    /// Handlers still installed at run time in the current phase.
    pub fn live_handlers(&self) -> usize {
        match self.phase {
            TryPhase::Body => self.has_except as usize + self.ensure.is_some() as usize,
            TryPhase::Except => self.ensure.is_some() as usize,
            TryPhase::Ensure => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassContext {
    /// Bare name of the method being compiled, for `super(...)`.
    pub method: String,
}

impl Compiler {
    pub fn new(function_type: FunctionType, name: String, file: Rc<str>) -> Self {
        let mut compiler = Self {
            proto: FunctionProto::new(name),
            locals: Vec::new(),
            scope_depth: 0,
            upvalues: Vec::new(),
            enclosing: None,
            function_type,
            generator: false,
            loops: Vec::new(),
            try_blocks: Vec::new(),
            class_context: None,
            file,
        };

        // Reserve slot 0 for `this` in methods, or an empty slot otherwise
        let slot_name = match function_type {
            FunctionType::Method | FunctionType::Constructor => "this".to_string(),
            _ => String::new(),
        };
        compiler.locals.push(Local {
            name: slot_name,
            depth: 0,
            is_captured: false,
        });

        compiler
    }

    /// Compile a full program.
    pub fn compile(program: &Program) -> CompileResult<CompiledModule> {
        let file: Rc<str> = Rc::from(program.file.as_str());
        let mut compiler = Compiler::new(FunctionType::Script, String::new(), file);
        for stmt in &program.statements {
            compiler.compile_stmt(stmt)?;
        }
        let last_line = program.statements.last().map_or(1, |s| s.span.line);
        compiler.emit(Op::Null, last_line);
        compiler.emit(Op::Return, last_line);

        tracing::debug!(
            target: COMPILER_TARGET,
            file = %program.file,
            ops = compiler.proto.chunk.len(),
            constants = compiler.proto.chunk.constants.len(),
            "compiled module"
        );

        Ok(CompiledModule {
            file: program.file.clone(),
            main: Rc::new(compiler.proto),
        })
    }

    pub fn error(&self, message: impl Into<String>, span: Span) -> CompileError {
        CompileError::new(message, self.file.as_ref(), span)
    }

    // --- Chunk helpers ---

    pub fn chunk(&mut self) -> &mut Chunk {
        &mut self.proto.chunk
    }

    pub fn emit(&mut self, op: Op, line: usize) -> usize {
        self.proto.chunk.emit(op, line)
    }

    pub fn emit_constant(&mut self, constant: Constant, span: Span) -> CompileResult<()> {
        let idx = self.add_constant(constant, span)?;
        self.emit(Op::Constant(idx), span.line);
        Ok(())
    }

    pub fn current_offset(&self) -> usize {
        self.proto.chunk.len()
    }

    pub fn emit_jump(&mut self, op: Op, line: usize) -> usize {
        self.emit(op, line)
    }

    pub fn patch_jump(&mut self, offset: usize, span: Span) -> CompileResult<()> {
        if self.proto.chunk.patch_jump(offset) {
            Ok(())
        } else {
            Err(self.error("Too much code to jump over", span))
        }
    }

    pub fn emit_loop(&mut self, loop_start: usize, span: Span) -> CompileResult<()> {
        let offset = self.proto.chunk.len() - loop_start + 1;
        if offset > u16::MAX as usize {
            return Err(self.error("Loop body too large", span));
        }
        self.emit(Op::Loop(offset as u16), span.line);
        Ok(())
    }

    pub fn add_constant(&mut self, constant: Constant, span: Span) -> CompileResult<u16> {
        match self.proto.chunk.add_constant(constant) {
            Some(idx) => Ok(idx),
            None => Err(self.error("Too many constants in function", span)),
        }
    }

    pub fn add_string_constant(&mut self, s: &str, span: Span) -> CompileResult<u16> {
        self.add_constant(Constant::String(s.to_string()), span)
    }

    // --- Scope management ---

    pub fn begin_scope(&mut self) {
        self.scope_depth += 1;
    }

    pub fn end_scope(&mut self, line: usize) {
        self.scope_depth -= 1;
        // Pop locals that go out of scope
        while let Some(local) = self.locals.last() {
            if local.depth <= self.scope_depth {
                break;
            }
            if local.is_captured {
                self.emit(Op::CloseUpvalue, line);
            } else {
                self.emit(Op::Pop, line);
            }
            self.locals.pop();
        }
    }

    /// Emit pops for every local above `len` without forgetting them; the
    /// code that follows jumps away from this scope.
    pub fn discard_locals(&mut self, len: usize, line: usize) {
        for i in (len..self.locals.len()).rev() {
            if self.locals[i].is_captured {
                self.emit(Op::CloseUpvalue, line);
            } else {
                self.emit(Op::Pop, line);
            }
        }
    }

    // --- Local variables ---

    pub fn add_local(&mut self, name: String, span: Span) -> CompileResult<()> {
        if self.locals.len() >= MAX_LOCALS {
            return Err(self.error("Too many local variables in function", span));
        }
        self.locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
        Ok(())
    }

    /// Declare a local in the current scope, uninitialized until
    /// `mark_initialized`.
    pub fn declare_variable(&mut self, name: &str, span: Span) -> CompileResult<()> {
        // Check for redeclaration in the same scope
        for local in self.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.scope_depth {
                break;
            }
            if local.name == name {
                return Err(self.error(
                    format!("Variable `{}` already declared in this scope", name),
                    span,
                ));
            }
        }
        self.add_local(name.to_string(), span)
    }

    /// Mark the last `count` locals as usable.
    pub fn mark_initialized(&mut self, count: usize) {
        let depth = self.scope_depth;
        let len = self.locals.len();
        for local in &mut self.locals[len - count..] {
            local.depth = depth;
        }
    }

    /// Declare and immediately initialize a local, for values already on
    /// the stack.
    pub fn define_local(&mut self, name: &str, span: Span) -> CompileResult<()> {
        self.declare_variable(name, span)?;
        self.mark_initialized(1);
        Ok(())
    }

    /// Bind the value on top of the stack to `name`: a global at depth 0,
    /// a local otherwise.
    pub fn define_variable(&mut self, name: &str, span: Span) -> CompileResult<()> {
        if self.scope_depth == 0 {
            let idx = self.add_string_constant(name, span)?;
            self.emit(Op::DefineGlobal(idx), span.line);
            Ok(())
        } else {
            self.define_local(name, span)
        }
    }

    pub fn resolve_local(&self, name: &str, span: Span) -> CompileResult<Option<u16>> {
        for (i, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err(self.error(
                        format!("Cannot read local variable `{}` in its own initializer", name),
                        span,
                    ));
                }
                return Ok(Some(i as u16));
            }
        }
        Ok(None)
    }

    pub fn resolve_upvalue(&mut self, name: &str, span: Span) -> CompileResult<Option<u16>> {
        let found = match self.enclosing.as_mut() {
            None => None,
            Some(enclosing) => {
                // Check local in enclosing compiler
                if let Some(local_idx) = enclosing.resolve_local(name, span)? {
                    enclosing.locals[local_idx as usize].is_captured = true;
                    Some((local_idx, true))
                } else {
                    // Check upvalue in enclosing compiler (recursive)
                    enclosing
                        .resolve_upvalue(name, span)?
                        .map(|upvalue_idx| (upvalue_idx, false))
                }
            }
        };
        match found {
            Some((index, is_local)) => self.add_upvalue(index, is_local, span).map(Some),
            None => Ok(None),
        }
    }

    fn add_upvalue(&mut self, index: u16, is_local: bool, span: Span) -> CompileResult<u16> {
        // Check if we already have this upvalue
        for (i, uv) in self.upvalues.iter().enumerate() {
            if uv.index == index && uv.is_local == is_local {
                return Ok(i as u16);
            }
        }
        if self.upvalues.len() >= MAX_UPVALUES {
            return Err(self.error("Too many captured variables in function", span));
        }
        let idx = self.upvalues.len() as u16;
        self.upvalues.push(UpvalueDescriptor { is_local, index });
        Ok(idx)
    }

    /// Resolve a variable name to the appropriate get/set operations.
    pub fn resolve_variable(&mut self, name: &str, span: Span) -> CompileResult<VariableAccess> {
        if let Some(slot) = self.resolve_local(name, span)? {
            Ok(VariableAccess::Local(slot))
        } else if let Some(idx) = self.resolve_upvalue(name, span)? {
            Ok(VariableAccess::Upvalue(idx))
        } else {
            Ok(VariableAccess::Global(name.to_string()))
        }
    }

    // --- Function compilation ---

    /// Compile a function body into a new prototype and emit the closure
    /// that captures it.
    pub fn compile_function(
        &mut self,
        function_type: FunctionType,
        name: String,
        params: &[Parameter],
        vararg: Option<&str>,
        body: &[Stmt],
        span: Span,
    ) -> CompileResult<()> {
        let defaults = self.parameter_defaults(params, span)?;
        let generator = body.iter().any(Stmt::contains_yield);
        if generator && function_type == FunctionType::Constructor {
            return Err(self.error("Cannot use yield in constructor", span));
        }

        self.start_function(function_type, name);
        self.generator = generator;
        self.proto.arity = params.len() as u8;
        self.proto.defaults = defaults;
        self.proto.vararg = vararg.is_some();

        self.begin_scope();
        for (i, param) in params.iter().enumerate() {
            if param.pattern.is_empty() {
                self.define_local(&param.name, span)?;
            } else {
                self.define_local(&format!(".arg{}", i), span)?;
            }
        }
        if let Some(vararg) = vararg {
            self.define_local(vararg, span)?;
        }
        if generator {
            self.emit(Op::Generator, span.line);
        }
        self.unpack_parameters(params, span)?;
        for stmt in body {
            self.compile_stmt(stmt)?;
        }

        let end_line = body.last().map_or(span.line, |s| s.span.line);
        let (proto, upvalues) = self.finish_function(end_line);
        let idx = self.add_constant(Constant::Function(Rc::new(proto)), span)?;
        self.emit(Op::Closure(idx, upvalues), span.line);
        Ok(())
    }

    /// Unpack every patterned parameter into fresh locals. Parameters
    /// occupy slots 1..=n.
    fn unpack_parameters(&mut self, params: &[Parameter], span: Span) -> CompileResult<()> {
        for (i, param) in params.iter().enumerate() {
            if param.pattern.is_empty() {
                continue;
            }
            if param.pattern.len() > MAX_ARGS {
                return Err(self.error("Too many names to unpack", span));
            }
            self.emit(Op::GetLocal(i as u16 + 1), span.line);
            self.emit(Op::Unpack(param.pattern.len() as u8), span.line);
            for name in &param.pattern {
                self.define_local(name, span)?;
            }
        }
        Ok(())
    }

    /// Emit the return of the value on top, completing a generator first.
    pub fn emit_return(&mut self, line: usize) {
        if self.generator {
            self.emit(Op::GeneratorClose, line);
        }
        self.emit(Op::Return, line);
    }

    /// Validate a parameter list and collect its constant defaults.
    pub fn parameter_defaults(
        &self,
        params: &[Parameter],
        span: Span,
    ) -> CompileResult<Vec<Constant>> {
        if params.len() > MAX_ARGS {
            return Err(self.error(
                format!("Too many parameters (max {})", MAX_ARGS),
                span,
            ));
        }
        let mut defaults = Vec::new();
        for param in params {
            match &param.default_value {
                Some(expr) => defaults.push(constant_of(expr).ok_or_else(|| {
                    self.error("Default argument must be a constant literal", expr.span)
                })?),
                None if !defaults.is_empty() => {
                    return Err(self.error(
                        format!("Parameter `{}` without default follows a default", param.name),
                        span,
                    ));
                }
                None => {}
            }
        }
        Ok(defaults)
    }

    /// Swap in a fresh compiler for a nested function; the current one
    /// becomes its `enclosing`.
    pub fn start_function(&mut self, function_type: FunctionType, name: String) {
        let mut new_compiler = Compiler::new(function_type, name, self.file.clone());
        new_compiler.class_context = self.class_context.clone();

        // Swap self with the new compiler, storing self as enclosing
        let old = std::mem::replace(self, new_compiler);
        self.enclosing = Some(Box::new(old));
    }

    /// Finish compiling the current function, returning the proto and restoring the enclosing compiler.
    pub fn finish_function(&mut self, line: usize) -> (FunctionProto, Vec<UpvalueDescriptor>) {
        // Constructors return the instance, everything else null
        if self.function_type == FunctionType::Constructor {
            self.emit(Op::GetLocal(0), line);
        } else {
            self.emit(Op::Null, line);
        }
        self.emit_return(line);

        let mut proto = std::mem::replace(&mut self.proto, FunctionProto::new(String::new()));
        let upvalues = std::mem::take(&mut self.upvalues);
        proto.upvalue_count = upvalues.len() as u16;

        tracing::trace!(
            target: COMPILER_TARGET,
            function = proto.display_name(),
            ops = proto.chunk.len(),
            upvalues = upvalues.len(),
            "compiled function"
        );

        // Restore enclosing compiler
        if let Some(enclosing) = self.enclosing.take() {
            *self = *enclosing;
        }

        (proto, upvalues)
    }

    // --- Loop context ---

    pub fn begin_loop(&mut self, continue_target: Option<usize>) {
        self.loops.push(LoopContext {
            continue_target,
            continue_patches: Vec::new(),
            break_patches: Vec::new(),
            locals_len: self.locals.len(),
            try_depth: self.try_blocks.len(),
        });
    }

    /// Patch pending `continue` jumps to land here.
    pub fn patch_continues(&mut self, span: Span) -> CompileResult<()> {
        let patches = match self.loops.last_mut() {
            Some(ctx) => std::mem::take(&mut ctx.continue_patches),
            None => Vec::new(),
        };
        for patch in patches {
            self.patch_jump(patch, span)?;
        }
        Ok(())
    }

    pub fn end_loop(&mut self, span: Span) -> CompileResult<()> {
        if let Some(ctx) = self.loops.pop() {
            // Patch all break jumps
            for patch in ctx.break_patches {
                self.patch_jump(patch, span)?;
            }
        }
        Ok(())
    }
}

/// The constant a literal expression folds to.
pub(crate) fn constant_of(expr: &crate::ast::Expr) -> Option<Constant> {
    use crate::ast::ExprKind;
    match &expr.kind {
        ExprKind::Number(n) => Some(Constant::Number(*n)),
        ExprKind::String(s) => Some(Constant::String(s.clone())),
        ExprKind::Bool(b) => Some(Constant::Bool(*b)),
        ExprKind::Null => Some(Constant::Null),
        _ => None,
    }
}

/// How a variable is accessed at runtime.
#[derive(Debug, Clone)]
pub enum VariableAccess {
    Local(u16),
    Upvalue(u16),
    Global(String),
}
