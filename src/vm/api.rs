//! Embedding API.
//!
//! Hosts and natives talk to the VM through stack slots. Slot indices are
//! relative to `api_base`: inside a native, slot 0 is the receiver (or the
//! native itself) and arguments start at slot 1. Negative indices count
//! from the top of the stack, `-1` being the top.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::ast::Program;
use crate::error::{CorvidError, Raised};
use crate::logging::VM_TARGET;

use super::blob;
use super::chunk::CompiledModule;
use super::compiler::Compiler;
use super::heap::GcStats;
use super::object::{NativeFn, ObjList, ObjTable, ObjTuple, Object};
use super::value::Value;
use super::vm::{ImportResolver, Vm};

impl Vm {
    // --- Execution ---

    /// Compile `program` and run it as module `__main__`.
    pub fn eval_program(&mut self, program: &Program) -> Result<(), CorvidError> {
        let module = Compiler::compile(program)?;
        self.eval_module("__main__", &module)
    }

    /// Run `module` as module `name`, registering the module first. An
    /// uncaught exception is printed (if `print_uncaught`) and returned.
    pub fn eval_module(&mut self, name: &str, module: &CompiledModule) -> Result<(), CorvidError> {
        blob::verify(&module.main)?;

        let key = self.heap.intern_key(name);
        let closure = self.load_compiled(key, module);
        let height = self.stack.len();
        self.push(Value::Obj(closure));

        match self.call_sync(0) {
            Ok(()) => {
                self.stack.truncate(height);
                Ok(())
            }
            Err(Raised) => {
                let exception = self.peek(0);
                let report = self.exception_report(exception);
                tracing::debug!(
                    target: VM_TARGET,
                    module = name,
                    class = %report.class,
                    "uncaught exception"
                );
                if self.config.print_uncaught {
                    self.print_traceback(exception);
                }
                self.stack.truncate(height);
                Err(CorvidError::Runtime(report))
            }
        }
    }

    /// Deserialize a persisted module and run it as module `name`.
    pub fn load_blob(&mut self, name: &str, bytes: &[u8]) -> Result<(), CorvidError> {
        let module = blob::deserialize(bytes)?;
        self.eval_module(name, &module)
    }

    /// Hook called for `import` of a module that is not loaded yet.
    pub fn set_import_resolver(&mut self, resolver: ImportResolver) {
        self.import_resolver = Some(resolver);
    }

    /// Make `function` available to `native` declarations named `name` in
    /// `module` (and in `class`, for native methods).
    pub fn register_native(
        &mut self,
        module: &str,
        class: Option<&str>,
        name: &str,
        function: NativeFn,
    ) {
        self.natives.insert(
            (module.to_string(), class.map(str::to_string), name.to_string()),
            function,
        );
    }

    /// Flag polled on jumps, calls and returns. Setting it raises
    /// `ProgramInterrupt` in the running script.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Drain captured `print` output.
    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    // --- Stack ---

    fn slot_index(&self, slot: isize) -> usize {
        if slot < 0 {
            (self.stack.len() as isize + slot) as usize
        } else {
            self.api_base + slot as usize
        }
    }

    pub fn get_slot(&self, slot: isize) -> Value {
        self.stack[self.slot_index(slot)]
    }

    pub fn set_slot(&mut self, slot: isize, value: Value) {
        let idx = self.slot_index(slot);
        self.stack[idx] = value;
    }

    pub fn top(&self) -> Value {
        self.peek(0)
    }

    pub fn push_value(&mut self, value: Value) {
        self.push(value);
    }

    pub fn pop_value(&mut self) -> Value {
        self.pop()
    }

    pub fn push_number(&mut self, n: f64) {
        self.push(Value::Number(n));
    }

    pub fn push_bool(&mut self, b: bool) {
        self.push(Value::Bool(b));
    }

    pub fn push_null(&mut self) {
        self.push(Value::Null);
    }

    pub fn push_string(&mut self, s: &str) {
        let r = self.new_string(s.as_bytes().to_vec());
        self.push(Value::Obj(r));
    }

    pub fn push_list(&mut self) {
        let r = self.alloc(Object::List(ObjList::default()));
        self.push(Value::Obj(r));
    }

    /// Pack the top `count` values into a tuple.
    pub fn push_tuple(&mut self, count: usize) {
        let start = self.stack.len() - count;
        let items = self.stack[start..].to_vec().into_boxed_slice();
        let r = self.alloc(Object::Tuple(ObjTuple { items }));
        self.stack.truncate(start);
        self.push(Value::Obj(r));
    }

    pub fn push_table(&mut self) {
        let r = self.alloc(Object::Table(ObjTable::default()));
        self.push(Value::Obj(r));
    }

    /// Pop the top value and append it to the list at `slot`.
    pub fn list_append(&mut self, slot: isize) {
        let list = self.get_slot(slot);
        let item = self.pop();
        if let Some(r) = list.as_obj() {
            if let Some(l) = self.heap.list_mut(r) {
                l.items.push(item);
            }
            self.heap.resize(r);
        }
    }

    pub fn get_number(&self, slot: isize) -> Option<f64> {
        self.get_slot(slot).as_number()
    }

    pub fn get_bool(&self, slot: isize) -> Option<bool> {
        self.get_slot(slot).as_bool()
    }

    pub fn get_string(&self, slot: isize) -> Option<String> {
        self.heap
            .value_string(self.get_slot(slot))
            .map(|s| s.as_str().into_owned())
    }

    pub fn is_number(&self, slot: isize) -> bool {
        self.get_slot(slot).is_number()
    }

    pub fn is_null(&self, slot: isize) -> bool {
        self.get_slot(slot).is_null()
    }

    pub fn is_string(&self, slot: isize) -> bool {
        self.heap.value_string(self.get_slot(slot)).is_some()
    }

    pub fn is_list(&self, slot: isize) -> bool {
        self.get_slot(slot)
            .as_obj()
            .is_some_and(|r| self.heap.list(r).is_some())
    }

    pub fn is_table(&self, slot: isize) -> bool {
        self.get_slot(slot)
            .as_obj()
            .is_some_and(|r| self.heap.table(r).is_some())
    }

    pub fn is_instance_slot(&self, slot: isize) -> bool {
        self.get_slot(slot)
            .as_obj()
            .is_some_and(|r| self.heap.instance(r).is_some())
    }

    /// Number in `slot`, or a `TypeException` naming the argument.
    pub fn check_number(&mut self, slot: isize, name: &str) -> Result<f64, Raised> {
        match self.get_number(slot) {
            Some(n) => Ok(n),
            None => Err(self.throw(
                self.core.classes.type_exception,
                &format!("{} must be a Number", name),
            )),
        }
    }

    pub fn check_string(&mut self, slot: isize, name: &str) -> Result<String, Raised> {
        match self.get_string(slot) {
            Some(s) => Ok(s),
            None => Err(self.throw(
                self.core.classes.type_exception,
                &format!("{} must be a String", name),
            )),
        }
    }

    // --- Names ---

    /// Push global `name` of `module`. Returns false (pushing nothing) if
    /// the module or the name does not exist.
    pub fn get_global(&mut self, module: &str, name: &str) -> bool {
        let (Some(module_key), Some(key)) = (self.heap.lookup_key(module), self.heap.lookup_key(name))
        else {
            return false;
        };
        let value = self
            .modules
            .get(module_key)
            .and_then(|m| m.as_obj())
            .and_then(|m| self.heap.module(m))
            .and_then(|m| m.globals.get(key));
        match value {
            Some(value) => {
                self.push(value);
                true
            }
            None => false,
        }
    }

    /// Set global `name` of `module` to the top value (left on the stack).
    /// Returns false if the module is not loaded.
    pub fn set_global(&mut self, module: &str, name: &str) -> bool {
        let Some(module_key) = self.heap.lookup_key(module) else {
            return false;
        };
        let Some(module) = self.modules.get(module_key).and_then(|m| m.as_obj()) else {
            return false;
        };
        let key = self.heap.intern_key(name);
        let value = self.peek(0);
        if let Some(m) = self.heap.module_mut(module) {
            m.globals.put(key, value);
        }
        self.heap.resize(module);
        true
    }

    /// Push field `name` of the value in `slot`.
    pub fn get_field_slot(&mut self, slot: isize, name: &str) -> Result<(), Raised> {
        let object = self.get_slot(slot);
        let key = self.heap.intern_key(name);
        let value = self.get_field(object, key)?;
        self.push(value);
        Ok(())
    }

    /// Set field `name` of the value in `slot` to the top value.
    pub fn set_field_slot(&mut self, slot: isize, name: &str) -> Result<(), Raised> {
        let object = self.get_slot(slot);
        let key = self.heap.intern_key(name);
        let value = self.peek(0);
        self.set_field(object, key, value)
    }

    // --- Calls ---

    /// Call the value below the top `argc` arguments and run it to
    /// completion. The result (or exception) replaces callee and arguments.
    pub fn call(&mut self, argc: u8) -> Result<(), Raised> {
        self.call_sync(argc)
    }

    /// Call method `name` on the receiver below the top `argc` arguments.
    pub fn call_method(&mut self, name: &str, argc: u8) -> Result<(), Raised> {
        let key = self.heap.intern_key(name);
        let receiver = self.peek(argc as usize);
        let class = self.get_class(receiver);
        match self.find_method(class, key) {
            Some(method) => self.call_method_sync(method, argc),
            None => {
                let raised = self.method_error(class, key);
                let exception = self.pop();
                let callee = self.stack.len() - 1 - argc as usize;
                self.stack.truncate(callee);
                self.push(exception);
                Err(raised)
            }
        }
    }

    // --- Raising ---

    /// Raise a new instance of the core exception class `class`, or of
    /// `Exception` if no such class exists.
    pub fn raise(&mut self, class: &str, message: &str) -> Raised {
        let class = self
            .heap
            .lookup_key(class)
            .and_then(|key| self.heap.module(self.core.module).and_then(|m| m.globals.get(key)))
            .and_then(|v| v.as_obj())
            .filter(|r| self.heap.class(*r).is_some())
            .unwrap_or(self.core.classes.exception);
        self.throw(class, message)
    }

    /// Raise the exception in `slot`.
    pub fn raise_exception(&mut self, slot: isize) -> Raised {
        let exception = self.get_slot(slot);
        self.push(exception);
        self.raise_top()
    }

    /// Print the traceback of the exception in `slot` to stderr.
    pub fn print_stacktrace(&self, slot: isize) {
        self.print_traceback(self.get_slot(slot));
    }

    // --- GC ---

    /// Suspend collection; calls nest.
    pub fn disable_gc(&mut self) {
        self.heap.disable_gc();
    }

    pub fn enable_gc(&mut self) {
        self.heap.enable_gc();
    }

    pub fn heap_stats(&self) -> GcStats {
        self.heap.stats().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;
    use crate::ast::{BinaryOp, UnaryOp};
    use crate::config::VmConfig;
    use crate::error::RuntimeError;
    use crate::vm::object::NativeResult;
    use pretty_assertions::assert_eq;

    fn vm() -> Vm {
        let mut vm = Vm::with_config(VmConfig {
            print_uncaught: false,
            ..VmConfig::default()
        })
        .unwrap();
        vm.capture_output = true;
        vm
    }

    fn run(statements: Vec<crate::ast::Stmt>) -> (Vm, Result<(), CorvidError>) {
        let mut vm = vm();
        let result = vm.eval_program(&program(statements));
        (vm, result)
    }

    fn output(statements: Vec<crate::ast::Stmt>) -> Vec<String> {
        let (mut vm, result) = run(statements);
        result.unwrap();
        vm.take_output()
    }

    fn runtime_error(statements: Vec<crate::ast::Stmt>) -> RuntimeError {
        match run(statements).1 {
            Err(CorvidError::Runtime(err)) => err,
            other => panic!("expected a runtime error, got {:?}", other),
        }
    }

    fn print(args: Vec<crate::ast::Expr>) -> crate::ast::Stmt {
        expr(call_named("print", args))
    }

    #[test]
    fn test_globals_and_arithmetic() {
        let out = output(vec![
            var_decl("x", Some(num(6.0))),
            expr(compound(var("x"), BinaryOp::Multiply, num(7.0))),
            print(vec![var("x"), binary(string("a"), BinaryOp::Add, string("b"))]),
        ]);
        assert_eq!(out, vec!["42 ab"]);
    }

    #[test]
    fn test_recursive_function() {
        let fib = fun(
            "fib",
            &["n"],
            vec![
                if_(
                    binary(var("n"), BinaryOp::Less, num(2.0)),
                    vec![ret(Some(var("n")))],
                    None,
                ),
                ret(Some(binary(
                    call_named("fib", vec![binary(var("n"), BinaryOp::Subtract, num(1.0))]),
                    BinaryOp::Add,
                    call_named("fib", vec![binary(var("n"), BinaryOp::Subtract, num(2.0))]),
                ))),
            ],
        );
        let out = output(vec![fib, print(vec![call_named("fib", vec![num(15.0)])])]);
        assert_eq!(out, vec!["610"]);
    }

    #[test]
    fn test_closure_counter() {
        // fun make() var n = 0; fun inc() n += 1; return n end; return inc end
        let make = fun(
            "make",
            &[],
            vec![
                var_decl("n", Some(num(0.0))),
                fun(
                    "inc",
                    &[],
                    vec![
                        expr(compound(var("n"), BinaryOp::Add, num(1.0))),
                        ret(Some(var("n"))),
                    ],
                ),
                ret(Some(var("inc"))),
            ],
        );
        let out = output(vec![
            make,
            var_decl("c", Some(call_named("make", vec![]))),
            expr(call_named("c", vec![])),
            expr(call_named("c", vec![])),
            print(vec![call_named("c", vec![])]),
        ]);
        assert_eq!(out, vec!["3"]);
    }

    #[test]
    fn test_class_with_super_and_fields() {
        let base = class(
            "Base",
            None,
            vec![
                method(function(
                    "construct",
                    &["x"],
                    vec![expr(assign(member(this(), "x"), var("x")))],
                )),
                method(function("get", &[], vec![ret(Some(member(this(), "x")))])),
            ],
        );
        let derived = class(
            "Derived",
            Some(var("Base")),
            vec![
                method(function(
                    "construct",
                    &["x"],
                    vec![expr(super_call(
                        Some("construct"),
                        vec![binary(var("x"), BinaryOp::Multiply, num(2.0))],
                    ))],
                )),
                method(function(
                    "get",
                    &[],
                    vec![ret(Some(binary(
                        super_call(Some("get"), vec![]),
                        BinaryOp::Add,
                        num(1.0),
                    )))],
                )),
            ],
        );
        let out = output(vec![
            base,
            derived,
            var_decl("d", Some(call_named("Derived", vec![num(5.0)]))),
            print(vec![
                invoke(var("d"), "get", vec![]),
                binary(var("d"), BinaryOp::Is, var("Base")),
            ]),
        ]);
        assert_eq!(out, vec!["11 true"]);
    }

    #[test]
    fn test_for_each_over_collections() {
        let out = output(vec![
            var_decl("total", Some(num(0.0))),
            for_each(
                &["x"],
                list(vec![num(1.0), num(2.0), num(3.0)]),
                vec![expr(compound(var("total"), BinaryOp::Add, var("x")))],
            ),
            var_decl("keys", Some(list(vec![]))),
            for_each(
                &["k"],
                table(vec![(string("a"), num(1.0)), (string("b"), num(2.0))]),
                vec![expr(invoke(var("keys"), "add", vec![var("k")]))],
            ),
            for_each(
                &["a", "b"],
                list(vec![tuple(vec![num(1.0), num(2.0)])]),
                vec![print(vec![var("a"), var("b")])],
            ),
            print(vec![var("total"), var("keys")]),
        ]);
        assert_eq!(out, vec!["1 2", r#"6 ["a", "b"]"#]);
    }

    #[test]
    fn test_except_catches_and_ensure_runs() {
        let out = output(vec![try_(
            vec![
                print(vec![string("body")]),
                raise(call_named("TypeException", vec![string("bad")])),
            ],
            vec![
                except(var("NameException"), "e", vec![print(vec![string("wrong")])]),
                except(
                    var("TypeException"),
                    "e",
                    vec![print(vec![invoke(var("e"), "getStacktrace", vec![])])],
                ),
            ],
            Some(vec![print(vec![string("ensure")])]),
        )]);
        assert_eq!(
            out,
            vec![
                "body",
                "Traceback (most recent call last):\n    [line 1] module __main__ in <main>\nTypeException: bad",
                "ensure",
            ]
        );
    }

    #[test]
    fn test_ensure_runs_on_return() {
        let f = fun(
            "f",
            &[],
            vec![try_(
                vec![ret(Some(num(1.0)))],
                vec![],
                Some(vec![print(vec![string("cleanup")])]),
            )],
        );
        let out = output(vec![f, print(vec![call_named("f", vec![])])]);
        assert_eq!(out, vec!["cleanup", "1"]);
    }

    #[test]
    fn test_break_through_ensure_runs_it_once() {
        let out = output(vec![
            while_(
                boolean(true),
                vec![try_(vec![break_()], vec![], Some(vec![print(vec![string("once")])]))],
            ),
            print(vec![string("after")]),
        ]);
        assert_eq!(out, vec!["once", "after"]);
    }

    #[test]
    fn test_uncaught_exception_report() {
        let f = fun(
            "f",
            &[],
            vec![raise(call_named("Exception", vec![string("deep")]).at(3)).at(3)],
        );
        let err = runtime_error(vec![f, expr(call_named("f", vec![]).at(5)).at(5)]);
        assert_eq!(err.class, "Exception");
        assert_eq!(err.message, "deep");
        assert_eq!(err.trace.len(), 2);
        assert_eq!(err.trace[0].function, "f");
        assert_eq!(err.trace[0].line, Some(3));
        assert_eq!(err.trace[1].function, "<main>");
        assert_eq!(err.trace[1].line, Some(5));
    }

    #[test]
    fn test_raise_requires_exception() {
        let err = runtime_error(vec![raise(num(1.0))]);
        assert_eq!(err.class, "TypeException");
    }

    #[test]
    fn test_deep_recursion_overflows() {
        let f = fun("f", &[], vec![ret(Some(call_named("f", vec![])))]);
        let err = runtime_error(vec![f, expr(call_named("f", vec![]))]);
        assert_eq!(err.class, "StackOverflowException");
    }

    #[test]
    fn test_undefined_global() {
        let err = runtime_error(vec![print(vec![var("nope")])]);
        assert_eq!(err.class, "NameException");
        assert_eq!(err.message, "Name `nope` is not defined in module `__main__`");
    }

    #[test]
    fn test_operator_overloads() {
        let vec2 = class(
            "V",
            None,
            vec![
                method(function(
                    "construct",
                    &["x"],
                    vec![expr(assign(member(this(), "x"), var("x")))],
                )),
                method(function(
                    "__add__",
                    &["o"],
                    vec![ret(Some(call_named(
                        "V",
                        vec![binary(member(this(), "x"), BinaryOp::Add, member(var("o"), "x"))],
                    )))],
                )),
                method(function(
                    "__radd__",
                    &["o"],
                    vec![ret(Some(call_named(
                        "V",
                        vec![binary(member(this(), "x"), BinaryOp::Add, var("o"))],
                    )))],
                )),
                method(function(
                    "__eq__",
                    &["o"],
                    vec![ret(Some(binary(member(this(), "x"), BinaryOp::Equal, member(var("o"), "x"))))],
                )),
            ],
        );
        let out = output(vec![
            vec2,
            var_decl(
                "a",
                Some(binary(
                    call_named("V", vec![num(1.0)]),
                    BinaryOp::Add,
                    call_named("V", vec![num(2.0)]),
                )),
            ),
            var_decl("b", Some(binary(num(10.0), BinaryOp::Add, var("a")))),
            print(vec![
                member(var("a"), "x"),
                member(var("b"), "x"),
                binary(var("a"), BinaryOp::Equal, call_named("V", vec![num(3.0)])),
            ]),
        ]);
        assert_eq!(out, vec!["3 13 true"]);
    }

    #[test]
    fn test_sequences_compare_and_hash_by_value() {
        let out = output(vec![print(vec![
            binary(
                tuple(vec![num(1.0), num(2.0)]),
                BinaryOp::Equal,
                tuple(vec![num(1.0), num(2.0)]),
            ),
            binary(list(vec![num(1.0)]), BinaryOp::Equal, list(vec![num(1.0)])),
            index(
                table(vec![(tuple(vec![num(1.0), num(2.0)]), string("v"))]),
                tuple(vec![num(1.0), num(2.0)]),
            ),
        ])]);
        assert_eq!(out, vec!["true true v"]);
    }

    #[test]
    fn test_instance_hash_matches_number_key() {
        // An instance equal to 1 lands in the bucket of the Number key 1
        let key = class(
            "One",
            None,
            vec![
                method(function("__hash__", &[], vec![ret(Some(num(1.0)))])),
                method(function(
                    "__eq__",
                    &["o"],
                    vec![ret(Some(binary(var("o"), BinaryOp::Equal, num(1.0))))],
                )),
            ],
        );
        let out = output(vec![
            key,
            var_decl("t", Some(table(vec![(call_named("One", vec![]), string("found"))]))),
            print(vec![index(var("t"), num(1.0))]),
        ]);
        assert_eq!(out, vec!["found"]);
    }

    #[test]
    fn test_loop_closures_capture_each_iteration() {
        let out = output(vec![
            var_decl("fs", Some(list(vec![]))),
            for_each(
                &["x"],
                list(vec![num(0.0), num(1.0), num(2.0)]),
                vec![expr(invoke(
                    var("fs"),
                    "add",
                    vec![lambda(&[], vec![ret(Some(var("x")))])],
                ))],
            ),
            for_each(&["f"], var("fs"), vec![print(vec![call(var("f"), vec![])])]),
        ]);
        assert_eq!(out, vec!["0", "1", "2"]);
    }

    #[test]
    fn test_raising_ensure_replaces_exception() {
        let out = output(vec![try_(
            vec![try_(
                vec![raise(call_named("TypeException", vec![string("A")]))],
                vec![],
                Some(vec![print(vec![string("B")]), expr(var("undefined"))]),
            )],
            vec![except(var("Exception"), "e", vec![print(vec![var("e")])])],
            None,
        )]);
        assert_eq!(out[0], "B");
        assert!(out[1].starts_with("<NameException"), "got {}", out[1]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_uncaught_raise_runs_ensure_first() {
        let (mut vm, result) = run(vec![try_(
            vec![raise(call_named("TypeException", vec![string("late")]))],
            vec![],
            Some(vec![print(vec![string("ensure")])]),
        )]);
        match result {
            Err(CorvidError::Runtime(err)) => assert_eq!(err.class, "TypeException"),
            other => panic!("expected a runtime error, got {:?}", other),
        }
        assert_eq!(vm.take_output(), vec!["ensure"]);
    }

    #[test]
    fn test_instances_have_independent_fields() {
        let point = class(
            "P",
            None,
            vec![method(function(
                "construct",
                &["v"],
                vec![expr(assign(member(this(), "v"), var("v")))],
            ))],
        );
        let out = output(vec![
            point,
            var_decl("a", Some(call_named("P", vec![num(1.0)]))),
            var_decl("b", Some(call_named("P", vec![num(1.0)]))),
            expr(assign(member(var("a"), "v"), num(99.0))),
            print(vec![member(var("a"), "v"), member(var("b"), "v")]),
        ]);
        assert_eq!(out, vec!["99 1"]);
    }

    /// `Steps(n)` iterates 0, 10, .. (n - 1) * 10.
    fn steps_class() -> crate::ast::Stmt {
        class(
            "Steps",
            None,
            vec![
                method(function(
                    "construct",
                    &["n"],
                    vec![expr(assign(member(this(), "n"), var("n")))],
                )),
                method(function(
                    "__iter__",
                    &["i"],
                    vec![
                        if_(
                            binary(var("i"), BinaryOp::Equal, null()),
                            vec![ret(Some(num(0.0)))],
                            None,
                        ),
                        if_(
                            binary(
                                binary(var("i"), BinaryOp::Add, num(1.0)),
                                BinaryOp::Less,
                                member(this(), "n"),
                            ),
                            vec![ret(Some(binary(var("i"), BinaryOp::Add, num(1.0))))],
                            None,
                        ),
                        ret(Some(boolean(false))),
                    ],
                )),
                method(function(
                    "__next__",
                    &["i"],
                    vec![ret(Some(binary(var("i"), BinaryOp::Multiply, num(10.0))))],
                )),
            ],
        )
    }

    #[test]
    fn test_user_iterator_drives_for_each() {
        let out = output(vec![
            steps_class(),
            for_each(&["x"], call_named("Steps", vec![num(3.0)]), vec![print(vec![var("x")])]),
        ]);
        assert_eq!(out, vec!["0", "10", "20"]);
    }

    /// `fun count(n) var i = 0 while i < n do yield i; i += 1 end end`
    fn count_generator() -> crate::ast::Stmt {
        fun(
            "count",
            &["n"],
            vec![
                var_decl("i", Some(num(0.0))),
                while_(
                    binary(var("i"), BinaryOp::Less, var("n")),
                    vec![
                        expr(yield_(Some(var("i")))),
                        expr(compound(var("i"), BinaryOp::Add, num(1.0))),
                    ],
                ),
            ],
        )
    }

    #[test]
    fn test_generator_drives_for_each() {
        let out = output(vec![
            count_generator(),
            for_each(&["x"], call_named("count", vec![num(3.0)]), vec![print(vec![var("x")])]),
            print(vec![list(vec![spread(call_named("count", vec![num(2.0)]))])]),
        ]);
        assert_eq!(out, vec!["0", "1", "2", "[0, 1]"]);
    }

    #[test]
    fn test_generator_receives_sent_values() {
        // fun acc() var total = 0 while true do total += yield total end end
        let acc = fun(
            "acc",
            &[],
            vec![
                var_decl("total", Some(num(0.0))),
                while_(
                    boolean(true),
                    vec![expr(compound(
                        var("total"),
                        BinaryOp::Add,
                        yield_(Some(var("total"))),
                    ))],
                ),
            ],
        );
        let out = output(vec![
            acc,
            var_decl("g", Some(call_named("acc", vec![]))),
            expr(call_named("g", vec![])),
            expr(call_named("g", vec![num(5.0)])),
            print(vec![call_named("g", vec![num(10.0)]), var("g")]),
        ]);
        assert_eq!(out, vec!["15 <Generator acc>"]);
    }

    #[test]
    fn test_generator_ensure_runs_on_completion() {
        let g = fun(
            "g",
            &[],
            vec![try_(
                vec![expr(yield_(Some(num(1.0)))), expr(yield_(Some(num(2.0))))],
                vec![],
                Some(vec![print(vec![string("cleanup")])]),
            )],
        );
        let out = output(vec![
            g,
            for_each(&["x"], call_named("g", vec![]), vec![print(vec![var("x")])]),
        ]);
        assert_eq!(out, vec!["1", "2", "cleanup"]);
    }

    #[test]
    fn test_completed_generator_cannot_resume() {
        let once = fun("once", &[], vec![expr(yield_(Some(num(1.0))))]);
        let program = vec![
            once,
            var_decl("g", Some(call_named("once", vec![]))),
            expr(call_named("g", vec![])),
            print(vec![invoke(var("g"), "isDone", vec![])]),
            expr(call_named("g", vec![])),
            print(vec![invoke(var("g"), "isDone", vec![])]),
            expr(call_named("g", vec![])),
        ];
        let (mut vm, result) = run(program);
        match result {
            Err(CorvidError::Runtime(err)) => {
                assert_eq!(err.class, "GeneratorException");
                assert_eq!(err.message, "Generator has completed");
            }
            other => panic!("expected a runtime error, got {:?}", other),
        }
        assert_eq!(vm.take_output(), vec!["false", "true"]);

        let err = runtime_error(vec![
            count_generator(),
            expr(call(call_named("count", vec![num(1.0)]), vec![num(1.0), num(2.0)])),
        ]);
        assert_eq!(err.class, "TypeException");
        assert_eq!(err.message, "Generator takes at most 1 argument, 2 supplied");
    }

    #[test]
    fn test_spread_calls_and_literals() {
        let add3 = fun(
            "add3",
            &["a", "b", "c"],
            vec![ret(Some(binary(
                binary(var("a"), BinaryOp::Add, var("b")),
                BinaryOp::Add,
                var("c"),
            )))],
        );
        let out = output(vec![
            add3,
            var_decl("xs", Some(list(vec![num(2.0), num(3.0)]))),
            print(vec![
                call_named("add3", vec![num(1.0), spread(var("xs"))]),
                list(vec![num(0.0), spread(var("xs")), spread(tuple(vec![num(4.0)]))]),
                tuple(vec![spread(var("xs"))]),
            ]),
            expr(invoke(var("xs"), "add", vec![spread(list(vec![num(9.0)]))])),
            print(vec![var("xs")]),
        ]);
        assert_eq!(out, vec!["6 [0, 2, 3, 4] (2, 3)", "[2, 3, 9]"]);

        let err = runtime_error(vec![expr(call_named("print", vec![spread(num(1.0))]))]);
        assert_eq!(err.class, "MethodException");
    }

    #[test]
    fn test_with_closes_resource() {
        let resource = class(
            "Res",
            None,
            vec![method(function("close", &[], vec![print(vec![string("closed")])]))],
        );
        let out = output(vec![
            resource,
            with_("r", call_named("Res", vec![]), vec![print(vec![string("body")])]),
            try_(
                vec![with_(
                    "r",
                    call_named("Res", vec![]),
                    vec![raise(call_named("Exception", vec![string("x")]))],
                )],
                vec![except(var("Exception"), "e", vec![print(vec![string("caught")])])],
                None,
            ),
            with_("r", null(), vec![print(vec![string("no resource")])]),
        ]);
        assert_eq!(out, vec!["body", "closed", "closed", "caught", "no resource"]);
    }

    #[test]
    fn test_unpacked_parameters() {
        let mut decl = function(
            "f",
            &[],
            vec![ret(Some(binary(
                var("x"),
                BinaryOp::Add,
                binary(var("a"), BinaryOp::Multiply, var("b")),
            )))],
        );
        decl.params = vec![param("x"), param_unpack(&["a", "b"])];
        let out = output(vec![
            fun_decl(decl),
            print(vec![call_named("f", vec![num(1.0), tuple(vec![num(2.0), num(3.0)])])]),
        ]);
        assert_eq!(out, vec!["7"]);
    }

    #[test]
    fn test_bitwise_operators() {
        let out = output(vec![print(vec![
            binary(num(6.0), BinaryOp::BitAnd, num(3.0)),
            binary(num(6.0), BinaryOp::BitOr, num(3.0)),
            binary(num(6.0), BinaryOp::Xor, num(3.0)),
            binary(num(1.0), BinaryOp::ShiftLeft, num(4.0)),
            binary(num(-16.0), BinaryOp::ShiftRight, num(2.0)),
            unary(UnaryOp::BitNot, num(5.0)),
        ])]);
        assert_eq!(out, vec!["2 7 5 16 -4 -6"]);

        let err = runtime_error(vec![print(vec![binary(num(1e300), BinaryOp::BitAnd, num(1.0))])]);
        assert_eq!(err.class, "TypeException");
        assert_eq!(err.message, "Number has no integer representation");
    }

    #[test]
    fn test_bitwise_overloads() {
        let flags = class(
            "Flags",
            None,
            vec![
                method(function("__band__", &["o"], vec![ret(Some(string("band")))])),
                method(function("__rbor__", &["o"], vec![ret(Some(string("rbor")))])),
                method(function("__inv__", &[], vec![ret(Some(string("inv")))])),
            ],
        );
        let out = output(vec![
            flags,
            var_decl("f", Some(call_named("Flags", vec![]))),
            print(vec![
                binary(var("f"), BinaryOp::BitAnd, num(1.0)),
                binary(num(1.0), BinaryOp::BitOr, var("f")),
                unary(UnaryOp::BitNot, var("f")),
            ]),
        ]);
        assert_eq!(out, vec!["band rbor inv"]);

        let err = runtime_error(vec![print(vec![unary(UnaryOp::BitNot, string("s"))])]);
        assert_eq!(err.message, "Operator ~ not defined for type String");
    }

    #[test]
    fn test_length_and_string_operators() {
        let sized = class(
            "Sized",
            None,
            vec![method(function("__len__", &[], vec![ret(Some(num(7.0)))]))],
        );
        let out = output(vec![
            sized,
            print(vec![
                unary(UnaryOp::Len, list(vec![num(1.0), num(2.0), num(3.0)])),
                unary(UnaryOp::Len, string("ab")),
                unary(UnaryOp::Len, call_named("Sized", vec![])),
                binary(unary(UnaryOp::Stringify, num(12.0)), BinaryOp::Add, string("!")),
                unary(UnaryOp::Stringify, list(vec![num(1.0)])),
            ]),
        ]);
        assert_eq!(out, vec!["3 2 7 12! [1]"]);
    }

    #[test]
    fn test_interrupt_raises_program_interrupt() {
        let mut vm = vm();
        vm.interrupt_handle()
            .store(true, std::sync::atomic::Ordering::Relaxed);
        let result = vm.eval_program(&program(vec![while_(boolean(true), vec![])]));
        match result {
            Err(CorvidError::Runtime(err)) => assert_eq!(err.class, "ProgramInterrupt"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_import_resolver_and_forms() {
        let mut vm = vm();
        let lib = Compiler::compile(&program(vec![
            var_decl("answer", Some(num(42.0))),
            fun("double", &["x"], vec![ret(Some(binary(var("x"), BinaryOp::Multiply, num(2.0))))]),
        ]))
        .unwrap();
        vm.set_import_resolver(Box::new(move |name: &str| (name == "lib").then(|| lib.clone())));

        vm.eval_program(&program(vec![
            import("lib"),
            import_for("lib", &["double"]),
            print(vec![member(var("lib"), "answer"), call_named("double", vec![num(4.0)])]),
        ]))
        .unwrap();
        vm.eval_module(
            "other",
            &Compiler::compile(&program(vec![import_all("lib"), print(vec![var("answer")])])).unwrap(),
        )
        .unwrap();
        assert_eq!(vm.take_output(), vec!["42 8", "42"]);

        let err = vm.eval_program(&program(vec![import("missing")])).unwrap_err();
        assert!(matches!(err, CorvidError::Runtime(ref e) if e.class == "ImportException"));
    }

    fn host_add(vm: &mut Vm) -> NativeResult {
        let a = vm.check_number(1, "a")?;
        let b = vm.check_number(2, "b")?;
        vm.push_number(a + b);
        Ok(())
    }

    #[test]
    fn test_native_declarations_resolve_through_registry() {
        let mut vm = vm();
        vm.register_native("__main__", None, "add", host_add);
        vm.eval_program(&program(vec![
            native_stmt(native("add", &["a", "b"])),
            print(vec![call_named("add", vec![num(2.0), num(3.0)])]),
        ]))
        .unwrap();
        assert_eq!(vm.take_output(), vec!["5"]);

        let err = vm
            .eval_program(&program(vec![native_stmt(native("missing", &[]))]))
            .unwrap_err();
        assert!(matches!(err, CorvidError::Runtime(ref e) if e.message.contains("Cannot resolve native")));
    }

    #[test]
    fn test_host_calls_script_function() {
        let mut vm = vm();
        vm.eval_program(&program(vec![fun(
            "greet",
            &["name"],
            vec![ret(Some(binary(string("hi "), BinaryOp::Add, var("name"))))],
        )]))
        .unwrap();

        assert!(vm.get_global("__main__", "greet"));
        vm.push_string("bob");
        vm.call(1).unwrap();
        assert_eq!(vm.get_string(-1).as_deref(), Some("hi bob"));
        vm.pop_value();

        vm.push_list();
        vm.push_number(1.0);
        vm.list_append(-2);
        vm.call_method("len", 0).unwrap();
        assert_eq!(vm.get_number(-1), Some(1.0));
        vm.pop_value();

        vm.push_number(1.0);
        assert_eq!(vm.call_method("nope", 0), Err(Raised));
        vm.pop_value();
        assert!(vm.stack.is_empty());
    }

    #[test]
    fn test_blob_round_trip_runs() {
        let module = Compiler::compile(&program(vec![print(vec![string("from blob")])])).unwrap();
        let bytes = blob::serialize(&module);
        let mut vm = vm();
        vm.load_blob("blob", &bytes).unwrap();
        assert_eq!(vm.take_output(), vec!["from blob"]);
        assert!(matches!(
            vm.load_blob("junk", b"not bytecode"),
            Err(CorvidError::Blob(_))
        ));
    }

    #[test]
    fn test_gc_reclaims_loop_garbage() {
        let mut vm = Vm::with_config(VmConfig {
            first_gc_threshold: 64 * 1024,
            print_uncaught: false,
            ..VmConfig::default()
        })
        .unwrap();
        vm.eval_program(&program(vec![
            var_decl("keep", Some(list(vec![]))),
            for_(
                Some(var_decl("i", Some(num(0.0)))),
                Some(binary(var("i"), BinaryOp::Less, num(5000.0))),
                Some(compound(var("i"), BinaryOp::Add, num(1.0))),
                vec![var_decl("tmp", Some(list(vec![num(1.0), num(2.0), num(3.0)])))],
            ),
        ]))
        .unwrap();
        assert!(vm.gc_stats().collections > 0);
        assert!(vm.get_global("__main__", "keep"));
        assert!(vm.is_list(-1));
    }
}
