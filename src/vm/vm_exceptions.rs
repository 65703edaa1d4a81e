//! Exception handling for the VM: raising, handler unwinding and
//! traceback formatting.

use std::fmt::Write;
use std::sync::atomic::Ordering;

use colored::Colorize;

use crate::error::{Raised, RuntimeError, TraceRecord};

use super::core::Special;
use super::object::{ObjInstance, ObjStackTrace, Object};
use super::table::Table;
use super::value::{ObjRef, Value};
use super::vm::{Handler, HandlerKind, Vm, CAUSE_EXCEPT, CAUSE_RETURN};

/// Causes printed above an exception, at most.
const MAX_CAUSE_DEPTH: usize = 16;

impl Vm {
    /// Create an instance of exception `class` with `message`, capture the
    /// stack trace and push it.
    pub(crate) fn throw(&mut self, class: ObjRef, message: &str) -> Raised {
        let message = self.new_string(message.as_bytes().to_vec());
        self.push(Value::Obj(message));
        let instance = self.alloc(Object::Instance(ObjInstance {
            class,
            fields: Table::new(),
        }));
        self.pop();
        self.push(Value::Obj(instance));

        self.set_instance_field(instance, self.special(Special::Err), Value::Obj(message));
        self.set_instance_field(instance, self.special(Special::Cause), Value::Null);
        self.record_stacktrace(instance);
        Raised
    }

    /// `raise` with the value on top of the stack.
    pub(crate) fn raise_top(&mut self) -> Raised {
        let value = self.peek(0);
        if !self.is_instance(value, self.core.classes.exception) {
            let message = format!(
                "Can only raise Exception instances, got {}",
                self.class_name(self.get_class(value))
            );
            self.pop();
            return self.throw(self.core.classes.type_exception, &message);
        }
        if let Some(instance) = value.as_obj() {
            self.record_stacktrace(instance);
        }
        Raised
    }

    fn record_stacktrace(&mut self, instance: ObjRef) {
        let records = self
            .frames
            .iter()
            .rev()
            .map(|frame| TraceRecord {
                line: frame.proto.chunk.line_at(frame.ip.saturating_sub(1)),
                module: match self.heap.function(frame.function) {
                    Some(f) => self.module_name(f.module),
                    None => String::new(),
                },
                function: frame.proto.display_name().to_string(),
            })
            .collect();
        let trace = self.alloc(Object::StackTrace(ObjStackTrace { records }));
        self.set_instance_field(instance, self.special(Special::Stacktrace), Value::Obj(trace));
    }

    /// Raise `ProgramInterrupt` if the host set the interrupt flag.
    #[inline]
    pub(crate) fn check_interrupt(&mut self) -> Result<(), Raised> {
        if self.interrupt.load(Ordering::Relaxed) && self.interrupt.swap(false, Ordering::Relaxed) {
            return Err(self.throw(self.core.classes.program_interrupt, "Program interrupted"));
        }
        Ok(())
    }

    /// Unwind towards the nearest handler above `depth` frames. The
    /// exception is on top of the stack. Returns false if none caught it;
    /// the exception then sits in the callee slot of the outermost frame
    /// that was popped.
    pub(crate) fn unwind_stack(&mut self, depth: usize) -> bool {
        let exception = self.pop();
        let mut base = None;
        while self.frames.len() > depth {
            if let Some(handler) = self.frame_mut().handlers.pop() {
                self.restore_handler(handler, exception, CAUSE_EXCEPT);
                return true;
            }
            let Some(frame) = self.frames.pop() else {
                break;
            };
            if let Some(generator) = frame.generator {
                self.finish_generator(generator);
            }
            self.close_upvalues(frame.base);
            base = Some(frame.base);
        }
        if let Some(base) = base {
            self.stack.truncate(base);
        }
        self.push(exception);
        false
    }

    /// Before a return: run the innermost pending ensure handler of the
    /// frame, if any.
    pub(crate) fn unwind_handlers(&mut self, ret: Value) -> bool {
        while let Some(handler) = self.frame_mut().handlers.pop() {
            if handler.kind == HandlerKind::Ensure {
                self.restore_handler(handler, ret, CAUSE_RETURN);
                return true;
            }
        }
        false
    }

    fn restore_handler(&mut self, handler: Handler, value: Value, cause: f64) {
        self.close_upvalues(handler.saved_sp);
        self.stack.truncate(handler.saved_sp);
        self.push(value);
        self.push(Value::Number(cause));
        self.frame_mut().ip = handler.address;
    }

    fn exception_field(&self, exception: Value, field: Special) -> Option<Value> {
        exception
            .as_obj()
            .and_then(|r| self.heap.instance(r))
            .and_then(|i| i.fields.get(self.special(field)))
    }

    /// Class, message and captured trace of an exception value.
    pub(crate) fn exception_report(&self, exception: Value) -> RuntimeError {
        let class = self.class_name(self.get_class(exception));
        let message = self
            .exception_field(exception, Special::Err)
            .and_then(|v| self.heap.value_string(v))
            .map(|s| s.as_str().into_owned())
            .unwrap_or_default();
        let trace = self
            .exception_field(exception, Special::Stacktrace)
            .and_then(|v| v.as_obj())
            .and_then(|r| self.heap.stack_trace(r))
            .map(|st| st.records.clone())
            .unwrap_or_default();
        RuntimeError {
            class,
            message,
            trace,
        }
    }

    /// Traceback text: causes first, then the exception itself.
    pub(crate) fn format_traceback(&self, exception: Value, color: bool) -> String {
        let mut out = String::new();
        self.write_traceback(&mut out, exception, color, 0);
        out
    }

    fn write_traceback(&self, out: &mut String, exception: Value, color: bool, depth: usize) {
        if let Some(cause) = self.exception_field(exception, Special::Cause) {
            if depth < MAX_CAUSE_DEPTH && self.is_instance(cause, self.core.classes.exception) {
                self.write_traceback(out, cause, color, depth + 1);
                let _ = writeln!(out, "\n\nAbove Exception caused:\n");
            }
        }

        let report = self.exception_report(exception);
        if !report.trace.is_empty() {
            let header = "Traceback (most recent call last):";
            if color {
                let _ = writeln!(out, "{}", header.bold());
            } else {
                let _ = writeln!(out, "{}", header);
            }
            let mut records = report.trace.iter().rev().peekable();
            while let Some(record) = records.next() {
                let mut repeated = 0;
                while records.peek() == Some(&record) {
                    records.next();
                    repeated += 1;
                }
                let _ = writeln!(out, "    {}", record);
                if repeated > 0 {
                    let _ = writeln!(out, "    [Previous line repeated {} more times]", repeated);
                }
            }
        }

        let summary = if report.message.is_empty() {
            report.class.clone()
        } else {
            format!("{}: {}", report.class, report.message)
        };
        if color {
            let _ = write!(out, "{}", summary.red().bold());
        } else {
            let _ = write!(out, "{}", summary);
        }
    }

    /// Print the traceback of `exception` to stderr.
    pub(crate) fn print_traceback(&self, exception: Value) {
        eprintln!("{}", self.format_traceback(exception, true));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_throw_sets_fields() {
        let mut vm = Vm::new();
        assert_eq!(vm.throw(vm.core.classes.name_exception, "no such name"), Raised);
        let exception = vm.pop();
        let report = vm.exception_report(exception);
        assert_eq!(report.class, "NameException");
        assert_eq!(report.message, "no such name");
        assert!(report.trace.is_empty());
    }

    #[test]
    fn test_raise_rejects_non_exceptions() {
        let mut vm = Vm::new();
        vm.push(Value::Number(4.0));
        vm.raise_top();
        let exception = vm.pop();
        assert!(vm.stack.is_empty());
        assert_eq!(vm.exception_report(exception).class, "TypeException");
    }

    #[test]
    fn test_traceback_with_cause() {
        let mut vm = Vm::new();
        vm.throw(vm.core.classes.exception, "inner");
        let inner = vm.peek(0);
        vm.throw(vm.core.classes.type_exception, "outer");
        let outer = vm.peek(0).as_obj().unwrap();
        vm.set_instance_field(outer, vm.special(Special::Cause), inner);

        let text = vm.format_traceback(Value::Obj(outer), false);
        assert_eq!(
            text,
            "Exception: inner\n\nAbove Exception caused:\n\nTypeException: outer"
        );
    }

    #[test]
    fn test_interrupt_flag_is_cleared() {
        let mut vm = Vm::new();
        vm.interrupt.store(true, Ordering::Relaxed);
        assert_eq!(vm.check_interrupt(), Err(Raised));
        assert_eq!(vm.exception_report(vm.peek(0)).class, "ProgramInterrupt");
        assert_eq!(vm.check_interrupt(), Ok(()));
    }
}
