//! Function call dispatch for the VM.

use crate::error::Raised;

use super::object::{GeneratorState, ObjInstance, ObjTuple, Object};
use super::table::{StrKey, Table};
use super::value::{ObjRef, Value};
use super::vm::{CallFrame, Vm};
use super::core::Special;

impl Vm {
    /// Call a value with the given number of argument slots on the stack.
    /// The callee is below the arguments on the stack.
    pub(crate) fn call_value(&mut self, argc: u8) -> Result<(), Raised> {
        let callee_idx = self.stack.len() - 1 - argc as usize;
        let callee = self.stack[callee_idx];

        let Value::Obj(r) = callee else {
            return Err(self.not_callable(callee));
        };
        match self.heap.get(r) {
            Object::Closure(c) => {
                let function = c.function;
                self.call_closure(r, function, argc)
            }
            Object::Native(_) => self.call_native(r, argc),
            Object::Class(_) => self.call_class(r, argc),
            Object::BoundMethod(b) => {
                let (receiver, method) = (b.receiver, b.method);
                self.stack[callee_idx] = receiver;
                self.call_method_value(Value::Obj(method), argc)
            }
            Object::Generator(_) => self.resume_generator(r, argc),
            _ => Err(self.not_callable(callee)),
        }
    }

    /// Resume a generator where it stopped. The argument, if any, becomes
    /// the value of the suspended `yield` expression.
    fn resume_generator(&mut self, generator: ObjRef, argc: u8) -> Result<(), Raised> {
        let state = match self.heap.generator(generator) {
            Some(g) => g.state,
            None => GeneratorState::Done,
        };
        match state {
            GeneratorState::Done => {
                return Err(self.throw(
                    self.core.classes.generator_exception,
                    "Generator has completed",
                ))
            }
            GeneratorState::Running => {
                return Err(self.throw(
                    self.core.classes.generator_exception,
                    "Generator is already running",
                ))
            }
            GeneratorState::Started | GeneratorState::Suspended => {}
        }
        if argc > 1 {
            let message = format!("Generator takes at most 1 argument, {} supplied", argc);
            return Err(self.throw(self.core.classes.type_exception, &message));
        }
        if self.frames.len() >= self.config.max_frames {
            return Err(self.throw(self.core.classes.stack_overflow, "Stack overflow"));
        }

        let sent = if argc == 1 { self.pop() } else { Value::Null };
        let base = self.stack.len() - 1;
        self.stack.truncate(base);

        let Some(g) = self.heap.generator_mut(generator) else {
            return Err(self.not_callable(Value::Obj(generator)));
        };
        g.state = GeneratorState::Running;
        let (closure, function, ip) = (g.closure, g.function, g.ip);
        let saved = std::mem::take(&mut g.stack);
        let mut handlers = std::mem::take(&mut g.handlers);
        for handler in &mut handlers {
            handler.saved_sp += base;
        }

        let proto = match self.heap.function(function) {
            Some(f) => f.proto.clone(),
            None => panic!("generator without a function object"),
        };
        self.stack.extend_from_slice(&saved);
        if state == GeneratorState::Suspended {
            self.push(sent);
        }
        self.frames.push(CallFrame {
            closure,
            function,
            proto,
            base,
            ip,
            handlers,
            generator: Some(generator),
        });
        Ok(())
    }

    /// Stack: `[callee, list]` → `[callee, x0, .., xn-1]`. Returns the
    /// argument count for a spread call.
    pub(crate) fn unpack_arguments(&mut self) -> Result<u8, Raised> {
        let list = self.pop();
        let items = match list.as_obj().and_then(|r| self.heap.list(r)) {
            Some(l) => l.items.clone(),
            None => Vec::new(),
        };
        if items.len() >= u8::MAX as usize {
            let message = format!("Too many arguments for function call: {}", items.len());
            return Err(self.throw(self.core.classes.type_exception, &message));
        }
        self.stack.extend_from_slice(&items);
        Ok(items.len() as u8)
    }

    /// Call `method` with the receiver already in the callee slot.
    pub(crate) fn call_method_value(&mut self, method: Value, argc: u8) -> Result<(), Raised> {
        if let Value::Obj(r) = method {
            match self.heap.get(r) {
                Object::Closure(c) => {
                    let function = c.function;
                    return self.call_closure(r, function, argc);
                }
                Object::Native(_) => return self.call_native(r, argc),
                _ => {}
            }
        }
        // Any other callable stored as a method replaces the receiver
        let callee_idx = self.stack.len() - 1 - argc as usize;
        self.stack[callee_idx] = method;
        self.call_value(argc)
    }

    fn not_callable(&mut self, callee: Value) -> Raised {
        let message = format!(
            "Object `{}` is not callable",
            self.class_name(self.get_class(callee))
        );
        self.throw(self.core.classes.type_exception, &message)
    }

    fn call_closure(&mut self, closure: ObjRef, function: ObjRef, argc: u8) -> Result<(), Raised> {
        if self.frames.len() >= self.config.max_frames {
            return Err(self.throw(self.core.classes.stack_overflow, "Stack overflow"));
        }
        let (proto, defaults) = match self.heap.function(function) {
            Some(f) => (f.proto.clone(), f.defaults.clone()),
            None => panic!("closure without a function object"),
        };
        let total = self.adjust_arguments(
            proto.display_name(),
            proto.arity,
            &defaults,
            proto.vararg,
            argc,
        )?;
        let base = self.stack.len() - total - 1;
        self.frames.push(CallFrame {
            closure,
            function,
            proto,
            base,
            ip: 0,
            handlers: Vec::new(),
            generator: None,
        });
        Ok(())
    }

    /// Natives run without a frame: `api_base` points at the callee slot
    /// while the host function runs.
    fn call_native(&mut self, native: ObjRef, argc: u8) -> Result<(), Raised> {
        let (name, arity, defaults, vararg, function) = match self.heap.native(native) {
            Some(n) => (n.name.clone(), n.arity, n.defaults.clone(), n.vararg, n.function),
            None => panic!("expected a native"),
        };
        let total = self.adjust_arguments(&name, arity, &defaults, vararg, argc)?;
        let base = self.stack.len() - total - 1;

        let saved = std::mem::replace(&mut self.api_base, base);
        let result = function(self);
        self.api_base = saved;

        // Result or exception on top
        let top = self.pop();
        self.stack.truncate(base);
        self.push(top);
        result
    }

    /// Bring the argument count to the callee's signature: fill defaults,
    /// pack varargs. Returns the number of argument slots.
    fn adjust_arguments(
        &mut self,
        name: &str,
        arity: u8,
        defaults: &[Value],
        vararg: bool,
        argc: u8,
    ) -> Result<usize, Raised> {
        let most = arity as usize;
        let least = most - defaults.len();
        let argc = argc as usize;

        if argc < least || (!vararg && argc > most) {
            let (qualifier, expected) = if least == most && !vararg {
                ("exactly", most)
            } else if argc < least {
                ("at least", least)
            } else {
                ("at most", most)
            };
            let message = format!(
                "Function `{}` takes {} {} arguments, {} supplied",
                name, qualifier, expected, argc
            );
            return Err(self.throw(self.core.classes.type_exception, &message));
        }

        for i in argc..most {
            self.push(defaults[i - least]);
        }

        if vararg {
            let extra = argc.saturating_sub(most);
            let start = self.stack.len() - extra;
            let items = self.stack[start..].to_vec().into_boxed_slice();
            let tuple = self.alloc(Object::Tuple(ObjTuple { items }));
            self.stack.truncate(start);
            self.push(Value::Obj(tuple));
            return Ok(most + 1);
        }
        Ok(most)
    }

    fn call_class(&mut self, class: ObjRef, argc: u8) -> Result<(), Raised> {
        let builtin = self.heap.class(class).is_some_and(|c| c.builtin);
        if builtin {
            let message = format!("Cannot instantiate builtin class `{}`", self.class_name(class));
            return Err(self.throw(self.core.classes.type_exception, &message));
        }

        let instance = self.alloc(Object::Instance(ObjInstance {
            class,
            fields: Table::new(),
        }));
        let callee_idx = self.stack.len() - 1 - argc as usize;
        self.stack[callee_idx] = Value::Obj(instance);

        match self.find_method(class, self.special(Special::Construct)) {
            Some(constructor) => self.call_method_value(constructor, argc),
            None if argc > 0 => {
                let message = format!(
                    "Class `{}` has no constructor and takes no arguments, {} supplied",
                    self.class_name(class),
                    argc
                );
                Err(self.throw(self.core.classes.type_exception, &message))
            }
            None => Ok(()),
        }
    }

    /// `receiver.name(args)`: class methods first, then a callable field
    /// (instances) or global (modules).
    pub(crate) fn invoke(&mut self, name: StrKey, argc: u8) -> Result<(), Raised> {
        let receiver = self.peek(argc as usize);
        let class = self.get_class(receiver);
        if let Some(method) = self.find_method(class, name) {
            return self.call_method_value(method, argc);
        }

        let field = match receiver.as_obj().map(|r| self.heap.get(r)) {
            Some(Object::Instance(i)) => i.fields.get(name),
            Some(Object::Module(m)) => m.globals.get(name),
            _ => None,
        };
        match field {
            Some(callee) => {
                let callee_idx = self.stack.len() - 1 - argc as usize;
                self.stack[callee_idx] = callee;
                self.call_value(argc)
            }
            None => Err(self.method_error(class, name)),
        }
    }

    /// Call the callee at `stack[len - 1 - argc]` and run it to completion.
    /// The result (or the exception) replaces callee and arguments.
    pub(crate) fn call_sync(&mut self, argc: u8) -> Result<(), Raised> {
        self.run_sync(argc, None)
    }

    /// Like [`Vm::call_sync`] for `method` with the receiver in the callee
    /// slot.
    pub(crate) fn call_method_sync(&mut self, method: Value, argc: u8) -> Result<(), Raised> {
        self.run_sync(argc, Some(method))
    }

    fn run_sync(&mut self, argc: u8, method: Option<Value>) -> Result<(), Raised> {
        let callee_idx = self.stack.len() - 1 - argc as usize;
        if self.reentrant >= self.config.max_reentrant {
            let raised = self.throw(self.core.classes.stack_overflow, "Stack overflow");
            return Err(self.settle_exception(callee_idx, raised));
        }

        let depth = self.frames.len();
        let called = match method {
            Some(method) => self.call_method_value(method, argc),
            None => self.call_value(argc),
        };
        if let Err(raised) = called {
            return Err(self.settle_exception(callee_idx, raised));
        }
        if self.frames.len() == depth {
            // Natives and constructor-less classes finish immediately
            return Ok(());
        }

        self.reentrant += 1;
        let result = self.run(depth);
        self.reentrant -= 1;
        result
    }

    /// Move the exception on top down to `slot`, dropping what is above.
    fn settle_exception(&mut self, slot: usize, raised: Raised) -> Raised {
        let exception = self.pop();
        self.stack.truncate(slot);
        self.push(exception);
        raised
    }

    // --- Iteration protocol ---

    /// Stack: `[.expr, .iter]` → `[.expr, .iter, __iter__, __next__]`.
    pub(crate) fn for_prep(&mut self) -> Result<(), Raised> {
        let expr = self.peek(1);
        let class = self.get_class(expr);
        let iter_key = self.special(Special::Iter);
        let next_key = self.special(Special::Next);
        let Some(iter) = self.find_method(class, iter_key) else {
            return Err(self.method_error(class, iter_key));
        };
        let Some(next) = self.find_method(class, next_key) else {
            return Err(self.method_error(class, next_key));
        };
        self.push(iter);
        self.push(next);
        Ok(())
    }

    /// Call `__iter__(expr, iter)`.
    pub(crate) fn for_iter(&mut self) -> Result<(), Raised> {
        let len = self.stack.len();
        let (expr, state, iter) = (self.stack[len - 4], self.stack[len - 3], self.stack[len - 2]);
        self.push(expr);
        self.push(state);
        self.call_method_value(iter, 1)
    }

    /// Store the result of `__iter__` as the new state; leave the loop if
    /// it is falsy, else call `__next__(expr, state)`.
    pub(crate) fn for_next(&mut self, offset: u16) -> Result<(), Raised> {
        let state = self.pop();
        let len = self.stack.len();
        self.stack[len - 3] = state;
        if !state.is_truthy() {
            self.frame_mut().ip += offset as usize;
            return Ok(());
        }
        let (expr, next) = (self.stack[len - 4], self.stack[len - 1]);
        self.push(expr);
        self.push(state);
        self.call_method_value(next, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::vm::core::new_native;
    use crate::vm::object::NativeResult;
    use pretty_assertions::assert_eq;

    fn sum_native(vm: &mut Vm) -> NativeResult {
        let a = vm.check_number(1, "a")?;
        let b = vm.check_number(2, "b")?;
        let rest = match vm.get_slot(3).as_obj().and_then(|r| vm.heap.tuple(r)) {
            Some(t) => t.items.iter().filter_map(Value::as_number).sum::<f64>(),
            None => 0.0,
        };
        vm.push_number(a + b + rest);
        Ok(())
    }

    fn native(vm: &mut Vm, defaults: Vec<Value>) -> ObjRef {
        let module = vm.core.module;
        new_native(vm, "sum", 2, defaults, true, module, sum_native)
    }

    #[test]
    fn test_native_defaults_and_varargs() {
        let mut vm = Vm::new();
        let sum = native(&mut vm, vec![Value::Number(10.0)]);

        vm.push(Value::Obj(sum));
        vm.push(Value::Number(1.0));
        vm.call_sync(1).unwrap();
        assert_eq!(vm.pop(), Value::Number(11.0));

        vm.push(Value::Obj(sum));
        for n in [1.0, 2.0, 3.0, 4.0] {
            vm.push(Value::Number(n));
        }
        vm.call_sync(4).unwrap();
        assert_eq!(vm.pop(), Value::Number(10.0));
        assert!(vm.stack.is_empty());
    }

    #[test]
    fn test_arity_error_message() {
        let mut vm = Vm::new();
        let sum = native(&mut vm, Vec::new());
        vm.push(Value::Obj(sum));
        assert_eq!(vm.call_sync(0), Err(Raised));
        let exception = vm.pop();
        assert!(vm.stack.is_empty());
        let report = vm.exception_report(exception);
        assert_eq!(report.class, "TypeException");
        assert_eq!(
            report.message,
            "Function `sum` takes at least 2 arguments, 0 supplied"
        );
    }

    #[test]
    fn test_builtin_class_cannot_be_called() {
        let mut vm = Vm::new();
        vm.push(Value::Obj(vm.core.classes.list));
        assert_eq!(vm.call_sync(0), Err(Raised));
        let exception = vm.pop();
        assert!(vm.is_instance(exception, vm.core.classes.type_exception));
    }

    #[test]
    fn test_exception_class_constructor() {
        let mut vm = Vm::new();
        let message = vm.intern(b"boom");
        vm.push(Value::Obj(vm.core.classes.exception));
        vm.push(Value::Obj(message));
        vm.call_sync(1).unwrap();
        let exception = vm.pop();
        assert_eq!(vm.exception_report(exception).message, "boom");
    }

    #[test]
    fn test_reentrancy_limit() {
        let mut vm = Vm::with_config(VmConfig {
            max_reentrant: 1,
            ..VmConfig::default()
        })
        .unwrap();
        vm.reentrant = 1;
        let sum = native(&mut vm, Vec::new());
        vm.push(Value::Obj(sum));
        assert_eq!(vm.call_sync(0), Err(Raised));
        let exception = vm.pop();
        assert!(vm.is_instance(exception, vm.core.classes.stack_overflow));
    }
}
