//! Class operations for the VM: field access, method lookup, inheritance.

use crate::error::Raised;

use super::object::{ObjBoundMethod, Object};
use super::table::StrKey;
use super::value::{ObjRef, Value};
use super::vm::Vm;

impl Vm {
    /// The class of any value.
    pub(crate) fn get_class(&self, value: Value) -> ObjRef {
        let classes = &self.core.classes;
        match value {
            Value::Number(_) => classes.number,
            Value::Bool(_) => classes.boolean,
            Value::Null => classes.null,
            Value::Obj(r) => match self.heap.get(r) {
                Object::String(_) => classes.string,
                Object::List(_) => classes.list,
                Object::Tuple(_) => classes.tuple,
                Object::Table(_) => classes.table,
                Object::Function(_)
                | Object::Closure(_)
                | Object::Native(_)
                | Object::BoundMethod(_) => classes.function,
                Object::Class(_) => classes.class,
                Object::Instance(i) => i.class,
                Object::Module(_) => classes.module,
                Object::StackTrace(_) => classes.stack_trace,
                Object::Generator(_) => classes.generator,
                Object::Upvalue(_) => classes.object,
            },
        }
    }

    /// True if `class` is `ancestor` or inherits from it.
    pub(crate) fn is_subclass(&self, class: ObjRef, ancestor: ObjRef) -> bool {
        let mut current = Some(class);
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            current = self.heap.class(c).and_then(|c| c.superclass);
        }
        false
    }

    pub(crate) fn is_instance(&self, value: Value, class: ObjRef) -> bool {
        self.is_subclass(self.get_class(value), class)
    }

    /// Methods are merged down at `Subclass`, so one probe is enough.
    pub(crate) fn find_method(&self, class: ObjRef, name: StrKey) -> Option<Value> {
        self.heap.class(class).and_then(|c| c.methods.get(name))
    }

    pub(crate) fn class_name(&self, class: ObjRef) -> String {
        match self.heap.class(class) {
            Some(c) => self.string_value(c.name),
            None => String::from("?"),
        }
    }

    pub(crate) fn bind_method(&mut self, receiver: Value, method: Value) -> Value {
        match method.as_obj() {
            Some(method) => Value::Obj(self.alloc(Object::BoundMethod(ObjBoundMethod {
                receiver,
                method,
            }))),
            None => method,
        }
    }

    /// `object.name`: instance field, module global, then a method bound
    /// to the receiver.
    pub(crate) fn get_field(&mut self, object: Value, name: StrKey) -> Result<Value, Raised> {
        if let Value::Obj(r) = object {
            match self.heap.get(r) {
                Object::Instance(i) => {
                    if let Some(value) = i.fields.get(name) {
                        return Ok(value);
                    }
                }
                Object::Module(m) => {
                    return match m.globals.get(name) {
                        Some(value) => Ok(value),
                        None => Err(self.name_error(r, name)),
                    };
                }
                _ => {}
            }
        }

        let class = self.get_class(object);
        match self.find_method(class, name) {
            Some(method) => Ok(self.bind_method(object, method)),
            None => {
                let message = format!(
                    "Object `{}` doesn't have field `{}`",
                    self.class_name(class),
                    self.string_value(name.handle)
                );
                Err(self.throw(self.core.classes.field_exception, &message))
            }
        }
    }

    pub(crate) fn set_field(
        &mut self,
        object: Value,
        name: StrKey,
        value: Value,
    ) -> Result<(), Raised> {
        if let Value::Obj(r) = object {
            let stored = match self.heap.get_mut(r) {
                Object::Instance(i) => {
                    i.fields.put(name, value);
                    true
                }
                Object::Module(m) => {
                    m.globals.put(name, value);
                    true
                }
                _ => false,
            };
            if stored {
                self.heap.resize(r);
                return Ok(());
            }
        }
        let message = format!(
            "Object `{}` doesn't have fields",
            self.class_name(self.get_class(object))
        );
        Err(self.throw(self.core.classes.field_exception, &message))
    }

    pub(crate) fn set_instance_field(&mut self, instance: ObjRef, name: StrKey, value: Value) {
        if let Some(i) = self.heap.instance_mut(instance) {
            i.fields.put(name, value);
        }
        self.heap.resize(instance);
    }

    /// `Subclass`: the class on top inherits from the value below it. Both
    /// stay on the stack.
    pub(crate) fn subclass(&mut self) -> Result<(), Raised> {
        let superclass = self.peek(1);
        let Some(class) = self.peek(0).as_obj() else {
            panic!("Subclass without a class on the stack");
        };

        let Some((builtin, methods)) = superclass
            .as_obj()
            .and_then(|r| self.heap.class(r))
            .map(|c| (c.builtin, c.methods.clone()))
        else {
            return Err(self.throw(
                self.core.classes.type_exception,
                "Superclass in class declaration must be a Class",
            ));
        };
        if builtin {
            let name = superclass.as_obj().map(|r| self.class_name(r)).unwrap_or_default();
            return Err(self.throw(
                self.core.classes.type_exception,
                &format!("Cannot subclass builtin class `{}`", name),
            ));
        }

        if let Some(c) = self.heap.class_mut(class) {
            c.superclass = superclass.as_obj();
            c.methods.merge(&methods);
        }
        self.heap.resize(class);
        Ok(())
    }

    /// Method `name` of the superclass, for `super` calls.
    pub(crate) fn super_method(&mut self, superclass: Value, name: StrKey) -> Result<Value, Raised> {
        let class = match superclass.as_obj() {
            Some(r) if self.heap.class(r).is_some() => r,
            _ => panic!("super lookup without a superclass"),
        };
        match self.find_method(class, name) {
            Some(method) => Ok(method),
            None => Err(self.method_error(class, name)),
        }
    }

    pub(crate) fn method_error(&mut self, class: ObjRef, name: StrKey) -> Raised {
        let message = format!(
            "Method `{}.{}()` doesn't exist",
            self.class_name(class),
            self.string_value(name.handle)
        );
        self.throw(self.core.classes.method_exception, &message)
    }

    pub(crate) fn name_error(&mut self, module: ObjRef, name: StrKey) -> Raised {
        let message = format!(
            "Name `{}` is not defined in module `{}`",
            self.string_value(name.handle),
            self.module_name(module)
        );
        self.throw(self.core.classes.name_exception, &message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::object::{ObjClass, ObjInstance};
    use crate::vm::table::Table;
    use pretty_assertions::assert_eq;

    fn user_class(vm: &mut Vm, name: &str, superclass: Option<ObjRef>) -> ObjRef {
        let name = vm.intern(name.as_bytes());
        vm.alloc(Object::Class(ObjClass {
            name,
            superclass,
            methods: Table::new(),
            builtin: false,
        }))
    }

    #[test]
    fn test_class_of_values() {
        let mut vm = Vm::new();
        let s = vm.intern(b"x");
        assert_eq!(vm.get_class(Value::Number(1.0)), vm.core.classes.number);
        assert_eq!(vm.get_class(Value::Null), vm.core.classes.null);
        assert_eq!(vm.get_class(Value::Obj(s)), vm.core.classes.string);
        assert_eq!(vm.class_name(vm.core.classes.boolean), "Boolean");
    }

    #[test]
    fn test_subclass_chain() {
        let mut vm = Vm::new();
        let object = vm.core.classes.object;
        let base = user_class(&mut vm, "Base", Some(object));
        vm.push(Value::Obj(base));
        let derived = user_class(&mut vm, "Derived", Some(base));
        vm.push(Value::Obj(derived));

        let instance = vm.alloc(Object::Instance(ObjInstance {
            class: derived,
            fields: Table::new(),
        }));
        assert!(vm.is_instance(Value::Obj(instance), base));
        assert!(vm.is_instance(Value::Obj(instance), object));
        assert!(!vm.is_instance(Value::Obj(instance), vm.core.classes.exception));
        assert!(!vm.is_subclass(base, derived));
    }

    #[test]
    fn test_subclassing_builtin_is_rejected() {
        let mut vm = Vm::new();
        let list = vm.core.classes.list;
        let class = user_class(&mut vm, "MyList", None);
        vm.push(Value::Obj(list));
        vm.push(Value::Obj(class));
        assert_eq!(vm.subclass(), Err(Raised));
        let exception = vm.peek(0);
        assert!(vm.is_instance(exception, vm.core.classes.type_exception));
    }

    #[test]
    fn test_missing_field_raises() {
        let mut vm = Vm::new();
        let name = vm.heap.intern_key("missing");
        assert_eq!(vm.get_field(Value::Number(3.0), name), Err(Raised));
        assert!(vm.is_instance(vm.peek(0), vm.core.classes.field_exception));
    }
}
