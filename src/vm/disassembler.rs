//! Bytecode disassembler for debug output.

use super::chunk::{Chunk, Constant, FunctionProto};
use super::opcode::Op;

/// Disassemble a function prototype to a human-readable string.
pub fn disassemble(proto: &FunctionProto) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "== {} (arity={}, upvalues={}{}) ==\n",
        proto.display_name(),
        proto.arity,
        proto.upvalue_count,
        if proto.vararg { ", vararg" } else { "" }
    ));
    disassemble_chunk(&proto.chunk, &mut out);

    // Recursively disassemble nested functions
    for constant in &proto.chunk.constants {
        if let Constant::Function(nested) = constant {
            out.push('\n');
            out.push_str(&disassemble(nested));
        }
    }
    out
}

fn disassemble_chunk(chunk: &Chunk, out: &mut String) {
    let mut previous = None;
    for (offset, op) in chunk.code.iter().enumerate() {
        let line = chunk.line_at(offset);
        let line_str = match line {
            Some(_) if line == previous => "   |".to_string(),
            Some(line) => format!("{:4}", line),
            None => "   ?".to_string(),
        };
        previous = line;
        out.push_str(&format!("{:04} {} ", offset, line_str));
        disassemble_op(op, offset, chunk, out);
        out.push('\n');
    }
}

fn disassemble_op(op: &Op, offset: usize, chunk: &Chunk, out: &mut String) {
    let named = |label: &str, idx: u16| format!("{:<13}{:>5} ({})", label, idx, constant_string(chunk, idx));
    let jump = |label: &str, target: usize| format!("{:<13}{:>5} -> {}", label, offset, target);

    let text = match op {
        Op::Constant(idx) => format!(
            "{:<13}{:>5} ({})",
            "CONSTANT",
            idx,
            format_constant(chunk.constants.get(*idx as usize))
        ),
        Op::Null => "NULL".to_string(),
        Op::True => "TRUE".to_string(),
        Op::False => "FALSE".to_string(),
        Op::Pop => "POP".to_string(),
        Op::Dup => "DUP".to_string(),
        Op::Dup2 => "DUP2".to_string(),
        Op::GetLocal(slot) => format!("{:<13}{:>5}", "GET_LOCAL", slot),
        Op::SetLocal(slot) => format!("{:<13}{:>5}", "SET_LOCAL", slot),
        Op::GetGlobal(idx) => named("GET_GLOBAL", *idx),
        Op::SetGlobal(idx) => named("SET_GLOBAL", *idx),
        Op::DefineGlobal(idx) => named("DEF_GLOBAL", *idx),
        Op::GetUpvalue(idx) => format!("{:<13}{:>5}", "GET_UPVALUE", idx),
        Op::SetUpvalue(idx) => format!("{:<13}{:>5}", "SET_UPVALUE", idx),
        Op::CloseUpvalue => "CLOSE_UPVALUE".to_string(),
        Op::GetField(idx) => named("GET_FIELD", *idx),
        Op::SetField(idx) => named("SET_FIELD", *idx),
        Op::GetSubscript => "GET_SUBSCR".to_string(),
        Op::SetSubscript => "SET_SUBSCR".to_string(),
        Op::Add => "ADD".to_string(),
        Op::Subtract => "SUBTRACT".to_string(),
        Op::Multiply => "MULTIPLY".to_string(),
        Op::Divide => "DIVIDE".to_string(),
        Op::Modulo => "MODULO".to_string(),
        Op::Power => "POWER".to_string(),
        Op::Negate => "NEGATE".to_string(),
        Op::BitAnd => "BAND".to_string(),
        Op::BitOr => "BOR".to_string(),
        Op::Xor => "XOR".to_string(),
        Op::ShiftLeft => "LSHIFT".to_string(),
        Op::ShiftRight => "RSHIFT".to_string(),
        Op::Invert => "INVERT".to_string(),
        Op::Equal => "EQUAL".to_string(),
        Op::Less => "LESS".to_string(),
        Op::LessEqual => "LESS_EQUAL".to_string(),
        Op::Greater => "GREATER".to_string(),
        Op::GreaterEqual => "GREATER_EQUAL".to_string(),
        Op::Is => "IS".to_string(),
        Op::Not => "NOT".to_string(),
        Op::Jump(_)
        | Op::JumpIfFalse(_)
        | Op::JumpIfTrue(_)
        | Op::SetupExcept(_)
        | Op::SetupEnsure(_)
        | Op::ForNext(_) => {
            let label = match op {
                Op::Jump(_) => "JUMP",
                Op::JumpIfFalse(_) => "JUMP_FALSE",
                Op::JumpIfTrue(_) => "JUMP_TRUE",
                Op::SetupExcept(_) => "SETUP_EXCEPT",
                Op::SetupEnsure(_) => "SETUP_ENSURE",
                _ => "FOR_NEXT",
            };
            jump(label, op.forward_target(offset).unwrap_or(offset))
        }
        Op::Loop(back) => jump("LOOP", (offset + 1).saturating_sub(*back as usize)),
        Op::Super(argc, idx) => format!(
            "{:<13}{:>5} ({}) argc={}",
            "SUPER",
            idx,
            constant_string(chunk, *idx),
            argc
        ),
        Op::SuperBind(idx) => named("SUPER_BIND", *idx),
        Op::SuperUnpack(idx) => named("SUPER_UNPACK", *idx),
        Op::CallUnpack => "CALL_UNPACK".to_string(),
        Op::InvokeUnpack(idx) => named("INVOKE_UNPACK", *idx),
        Op::Return => "RETURN".to_string(),
        Op::Closure(idx, upvalues) => {
            let mut text = format!(
                "{:<13}{:>5} ({})",
                "CLOSURE",
                idx,
                format_constant(chunk.constants.get(*idx as usize))
            );
            for uv in upvalues {
                let kind = if uv.is_local { "local" } else { "upvalue" };
                text.push_str(&format!("\n     |        {} {}", kind, uv.index));
            }
            text
        }
        Op::Native(idx) => named("NATIVE", *idx),
        Op::NewList(n) => format!("{:<13}{:>5}", "NEW_LIST", n),
        Op::NewTuple(n) => format!("{:<13}{:>5}", "NEW_TUPLE", n),
        Op::NewTable(n) => format!("{:<13}{:>5}", "NEW_TABLE", n),
        Op::Unpack(n) => format!("{:<13}{:>5}", "UNPACK", n),
        Op::AppendList => "APPEND_LIST".to_string(),
        Op::ExtendList => "EXTEND_LIST".to_string(),
        Op::ListToTuple => "LIST_TO_TUPLE".to_string(),
        Op::GetObject => "GET_OBJECT".to_string(),
        Op::NewClass(idx) => named("NEW_CLASS", *idx),
        Op::Subclass => "SUBCLASS".to_string(),
        Op::DefMethod(idx) => named("DEF_METHOD", *idx),
        Op::NativeMethod(idx) => named("NAT_METHOD", *idx),
        Op::PopHandler => "POP_HANDLER".to_string(),
        Op::EndHandler => "END_HANDLER".to_string(),
        Op::Raise => "RAISE".to_string(),
        Op::ForPrep => "FOR_PREP".to_string(),
        Op::ForIter => "FOR_ITER".to_string(),
        Op::Generator => "GENERATOR".to_string(),
        Op::Yield => "YIELD".to_string(),
        Op::GeneratorClose => "GEN_CLOSE".to_string(),
        Op::Import(idx) => named("IMPORT", *idx),
        Op::ImportFrom(idx) => named("IMPORT_FROM", *idx),
        Op::ImportName(module, idx) => format!(
            "{:<13}{:>5} ({}.{})",
            "IMPORT_NAME",
            idx,
            constant_string(chunk, *module),
            constant_string(chunk, *idx)
        ),
        Op::ImportAll(idx) => named("IMPORT_ALL", *idx),
        other => match (other.call_argc(), other.invoke_args()) {
            (Some(argc), _) => format!("{:<13}{:>5}", "CALL", argc),
            (_, Some((argc, idx))) => format!(
                "{:<13}{:>5} ({}) argc={}",
                "INVOKE",
                idx,
                constant_string(chunk, idx),
                argc
            ),
            _ => format!("{:?}", other),
        },
    };
    out.push_str(&text);
}

fn constant_string(chunk: &Chunk, idx: u16) -> String {
    match chunk.constants.get(idx as usize) {
        Some(Constant::String(s)) => s.clone(),
        _ => format!("?{}", idx),
    }
}

fn format_constant(val: Option<&Constant>) -> String {
    match val {
        Some(Constant::Number(n)) => super::value::format_number(*n),
        Some(Constant::String(s)) => format!("\"{}\"", s),
        Some(Constant::Bool(b)) => format!("{}", b),
        Some(Constant::Null) => "null".to_string(),
        Some(Constant::Function(f)) => format!("<fn {}>", f.display_name()),
        Some(Constant::Native(n)) => format!("<native {}>", n.name),
        None => "???".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;
    use crate::vm::compiler::Compiler;

    #[test]
    fn test_disassembles_nested_functions() {
        let program = program(vec![
            var_decl("x", Some(num(1.0))),
            fun("f", &["a"], vec![ret(Some(var("a")))]),
        ]);
        let module = Compiler::compile(&program).unwrap();
        let text = disassemble(&module.main);

        assert!(text.starts_with("== <main> (arity=0, upvalues=0) ==\n"));
        assert!(text.contains("0000    1 CONSTANT         0 (1)"));
        assert!(text.contains("DEF_GLOBAL"));
        assert!(text.contains("== f (arity=1, upvalues=0) =="));
        assert!(text.contains("RETURN"));
    }

    #[test]
    fn test_jump_targets() {
        let program = program(vec![while_(boolean(true), vec![break_()])]);
        let module = Compiler::compile(&program).unwrap();
        let text = disassemble(&module.main);
        assert!(text.contains("JUMP_FALSE       1 -> 4"));
        assert!(text.contains("LOOP             3 -> 0"));
    }

    #[test]
    fn test_generator_ops() {
        let program = program(vec![fun("g", &[], vec![expr(yield_(Some(num(1.0))))])]);
        let module = Compiler::compile(&program).unwrap();
        let text = disassemble(&module.main);
        assert!(text.contains("GENERATOR"));
        assert!(text.contains("YIELD"));
        assert!(text.contains("GEN_CLOSE"));
    }
}
