//! Class declaration compilation.
//!
//! A class body compiles to: the class object, a hidden `super` local
//! holding the superclass (or `Object`), `Subclass` to inherit its
//! methods, then one `DefMethod`/`NativeMethod` per method.

use crate::ast::stmt::{ClassDecl, MethodDecl};
use crate::error::CompileResult;

use super::compiler::{ClassContext, Compiler, FunctionType};
use super::opcode::Op;

impl Compiler {
    /// Compile a class declaration.
    pub fn compile_class_decl(&mut self, decl: &ClassDecl) -> CompileResult<()> {
        let line = decl.span.line;
        let name_idx = self.add_string_constant(&decl.name, decl.span)?;

        self.emit(Op::NewClass(name_idx), line);
        self.define_variable(&decl.name, decl.span)?;

        self.begin_scope();
        match &decl.superclass {
            Some(superclass) => self.compile_expr(superclass)?,
            None => {
                self.emit(Op::GetObject, line);
            }
        }
        self.define_local("super", decl.span)?;

        self.compile_expr(&crate::ast::Expr::new(
            crate::ast::ExprKind::Variable(decl.name.clone()),
            decl.span,
        ))?;
        self.emit(Op::Subclass, line);

        // Store class context for this/super resolution
        let prev_class_ctx = self.class_context.take();
        for method in &decl.methods {
            self.class_context = Some(ClassContext {
                method: method.name().to_string(),
            });
            let compiled = self.compile_method(decl, method);
            if compiled.is_err() {
                self.class_context = prev_class_ctx;
                return compiled;
            }
        }
        self.class_context = prev_class_ctx;

        // Drop the class copy, then the `super` local
        self.emit(Op::Pop, line);
        self.end_scope(line);
        Ok(())
    }

    fn compile_method(&mut self, class: &ClassDecl, method: &MethodDecl) -> CompileResult<()> {
        match method {
            MethodDecl::Function(f) => {
                let function_type = if f.name == "construct" {
                    FunctionType::Constructor
                } else {
                    FunctionType::Method
                };
                self.compile_function(
                    function_type,
                    format!("{}.{}", class.name, f.name),
                    &f.params,
                    f.vararg.as_deref(),
                    &f.body,
                    f.span,
                )?;
                let name_idx = self.add_string_constant(&f.name, f.span)?;
                self.emit(Op::DefMethod(name_idx), f.span.line);
            }
            MethodDecl::Native(n) => {
                let idx = self.native_constant(n)?;
                self.emit(Op::NativeMethod(idx), n.span.line);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::build::*;
    use crate::ast::stmt::MethodDecl;
    use crate::vm::chunk::{Constant, FunctionProto};
    use crate::vm::compiler::Compiler;
    use crate::vm::opcode::Op;
    use pretty_assertions::assert_eq;

    fn compile(stmts: Vec<crate::ast::Stmt>) -> FunctionProto {
        let module = Compiler::compile(&program(stmts)).unwrap();
        (*module.main).clone()
    }

    fn method_protos(proto: &FunctionProto) -> Vec<&FunctionProto> {
        proto
            .chunk
            .constants
            .iter()
            .filter_map(|c| match c {
                Constant::Function(f) => Some(f.as_ref()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_class_layout_without_superclass() {
        let proto = compile(vec![class(
            "Point",
            None,
            vec![method(function("len", &[], vec![ret(Some(num(0.0)))]))],
        )]);
        assert_eq!(
            proto.chunk.code,
            vec![
                Op::NewClass(0),
                Op::DefineGlobal(0),
                Op::GetObject,
                Op::GetGlobal(0),
                Op::Subclass,
                Op::Closure(1, vec![]),
                Op::DefMethod(2),
                Op::Pop,
                Op::Pop,
                Op::Null,
                Op::Return
            ]
        );
        let methods = method_protos(&proto);
        assert_eq!(methods[0].name, "Point.len");
    }

    #[test]
    fn test_constructor_returns_instance() {
        let proto = compile(vec![class(
            "A",
            None,
            vec![method(function("construct", &["x"], vec![expr(assign(
                member(this(), "x"),
                var("x"),
            ))]))],
        )]);
        let ctor = method_protos(&proto)[0];
        let code = &ctor.chunk.code;
        assert_eq!(&code[code.len() - 2..], &[Op::GetLocal(0), Op::Return]);
        assert_eq!(ctor.arity, 1);
        assert_eq!(code[0], Op::GetLocal(0));
    }

    #[test]
    fn test_constructor_cannot_return_value() {
        let err = Compiler::compile(&program(vec![class(
            "A",
            None,
            vec![method(function("construct", &[], vec![ret(Some(num(1.0)))]))],
        )]))
        .unwrap_err();
        assert_eq!(err.message, "Cannot return a value from a constructor");
    }

    #[test]
    fn test_constructor_cannot_yield() {
        let err = Compiler::compile(&program(vec![class(
            "A",
            None,
            vec![method(function("construct", &[], vec![expr(yield_(None))]))],
        )]))
        .unwrap_err();
        assert_eq!(err.message, "Cannot use yield in constructor");
    }

    #[test]
    fn test_super_call_with_spread() {
        let proto = compile(vec![class(
            "B",
            Some(var("A")),
            vec![method(function(
                "f",
                &["xs"],
                vec![expr(super_call(Some("g"), vec![spread(var("xs"))]))],
            ))],
        )]);
        let f = method_protos(&proto)[0];
        assert_eq!(
            &f.chunk.code[..6],
            &[
                Op::GetLocal(0),
                Op::NewList(0),
                Op::GetLocal(1),
                Op::ExtendList,
                Op::GetUpvalue(0),
                Op::SuperUnpack(0)
            ]
        );
    }

    #[test]
    fn test_super_call_captures_superclass() {
        let proto = compile(vec![class(
            "B",
            Some(var("A")),
            vec![method(function(
                "construct",
                &["x"],
                vec![expr(super_call(None, vec![var("x")]))],
            ))],
        )]);
        let ctor = method_protos(&proto)[0];
        assert_eq!(
            &ctor.chunk.code[..4],
            &[Op::GetLocal(0), Op::GetLocal(1), Op::GetUpvalue(0), Op::Super(1, 0)]
        );
        assert_eq!(ctor.chunk.constant_str(0), Some("construct"));
        // The `super` local is captured, so the class scope closes it
        let code = &proto.chunk.code;
        assert_eq!(code[code.len() - 3], Op::CloseUpvalue);
    }

    #[test]
    fn test_super_member_binds() {
        let proto = compile(vec![class(
            "B",
            Some(var("A")),
            vec![method(function("f", &[], vec![ret(Some(super_member("g")))]))],
        )]);
        let f = method_protos(&proto)[0];
        assert_eq!(
            &f.chunk.code[..3],
            &[Op::GetLocal(0), Op::GetUpvalue(0), Op::SuperBind(0)]
        );
    }

    #[test]
    fn test_native_method() {
        let proto = compile(vec![class(
            "File",
            None,
            vec![MethodDecl::Native(native("read", &["n"]))],
        )]);
        let native_op = proto
            .chunk
            .code
            .iter()
            .find_map(|op| match op {
                Op::NativeMethod(idx) => Some(*idx),
                _ => None,
            })
            .unwrap();
        let Constant::Native(decl) = &proto.chunk.constants[native_op as usize] else {
            panic!("expected native constant");
        };
        assert_eq!(decl.name, "read");
        assert_eq!(decl.arity, 1);
    }
}
