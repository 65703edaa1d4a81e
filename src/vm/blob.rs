//! Persisted bytecode.
//!
//! Layout: 4-byte magic, major and minor version bytes, then a MessagePack
//! body holding the `CompiledModule`. Only an exact version match loads.

use super::chunk::{Chunk, CompiledModule, Constant, FunctionProto};
use super::opcode::Op;
use crate::error::{BlobError, InternalError};

pub const MAGIC: &[u8; 4] = b"\xb5CVD";
pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 5;

const HEADER_LEN: usize = MAGIC.len() + 2;

/// Encode a module with its version header.
pub fn serialize(module: &CompiledModule) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(MAGIC);
    out.push(VERSION_MAJOR);
    out.push(VERSION_MINOR);
    // Serializing plain data into a Vec cannot fail.
    if let Ok(body) = rmp_serde::to_vec(module) {
        out.extend_from_slice(&body);
    }
    out
}

/// True if `bytes` starts with the bytecode magic.
pub fn is_bytecode(bytes: &[u8]) -> bool {
    bytes.starts_with(MAGIC)
}

/// Decode and verify a module.
pub fn deserialize(bytes: &[u8]) -> Result<CompiledModule, BlobError> {
    if bytes.len() < HEADER_LEN || !is_bytecode(bytes) {
        return Err(BlobError::NotBytecode);
    }
    let found = (bytes[4], bytes[5]);
    if found != (VERSION_MAJOR, VERSION_MINOR) {
        return Err(BlobError::Version {
            found,
            expected: (VERSION_MAJOR, VERSION_MINOR),
        });
    }
    let module: CompiledModule = rmp_serde::from_slice(&bytes[HEADER_LEN..])
        .map_err(|e| BlobError::Corrupt(e.to_string()))?;
    verify(&module.main)?;
    Ok(module)
}

/// Check the structural invariants dispatch relies on: operands index
/// existing constants of the right kind and jumps land inside the chunk.
/// Nested prototypes are checked recursively.
pub fn verify(proto: &FunctionProto) -> Result<(), InternalError> {
    let chunk = &proto.chunk;
    let fail = |offset: usize, message: String| InternalError {
        function: proto.display_name().to_string(),
        offset,
        message,
    };

    if chunk.lines.len() != chunk.code.len() {
        return Err(fail(0, "line table does not cover the code".into()));
    }
    if proto.defaults.len() > proto.arity as usize {
        return Err(fail(0, "more defaults than parameters".into()));
    }
    if !matches!(chunk.code.last(), Some(Op::Return)) {
        return Err(fail(chunk.code.len(), "chunk does not end in RETURN".into()));
    }

    let generator = chunk.code.iter().any(|op| *op == Op::Generator);
    for (offset, op) in chunk.code.iter().enumerate() {
        if matches!(op, Op::Yield | Op::GeneratorClose) && !generator {
            return Err(fail(offset, "yield outside a generator".into()));
        }
        for (idx, kind) in constant_operands(op) {
            if !constant_matches(chunk, idx, kind) {
                return Err(fail(offset, format!("bad {} constant {}", kind.describe(), idx)));
            }
        }
        if let Some(target) = op.forward_target(offset) {
            if target > chunk.code.len() {
                return Err(fail(offset, format!("jump to {} out of range", target)));
            }
        }
        match op {
            Op::Loop(back) if *back as usize > offset + 1 => {
                return Err(fail(offset, format!("loop back {} out of range", back)));
            }
            Op::GetUpvalue(idx) | Op::SetUpvalue(idx) if *idx >= proto.upvalue_count => {
                return Err(fail(offset, format!("unknown upvalue {}", idx)));
            }
            Op::Closure(idx, upvalues) => {
                if let Some(Constant::Function(nested)) = chunk.constants.get(*idx as usize) {
                    if nested.upvalue_count as usize != upvalues.len() {
                        return Err(fail(offset, "upvalue count mismatch".into()));
                    }
                }
                for uv in upvalues {
                    if !uv.is_local && uv.index >= proto.upvalue_count {
                        return Err(fail(offset, format!("unknown upvalue {}", uv.index)));
                    }
                }
            }
            _ => {}
        }
    }

    for constant in &chunk.constants {
        if let Constant::Function(nested) = constant {
            verify(nested)?;
        }
    }
    Ok(())
}

#[derive(Clone, Copy)]
enum ConstKind {
    Any,
    Name,
    Function,
    Native,
}

impl ConstKind {
    fn describe(self) -> &'static str {
        match self {
            ConstKind::Any => "value",
            ConstKind::Name => "name",
            ConstKind::Function => "function",
            ConstKind::Native => "native",
        }
    }
}

fn constant_matches(chunk: &Chunk, idx: u16, kind: ConstKind) -> bool {
    match (chunk.constants.get(idx as usize), kind) {
        (None, _) => false,
        (Some(_), ConstKind::Any) => true,
        (Some(Constant::String(_)), ConstKind::Name) => true,
        (Some(Constant::Function(_)), ConstKind::Function) => true,
        (Some(Constant::Native(_)), ConstKind::Native) => true,
        _ => false,
    }
}

fn constant_operands(op: &Op) -> Vec<(u16, ConstKind)> {
    if let Some((_, name)) = op.invoke_args() {
        return vec![(name, ConstKind::Name)];
    }
    match op {
        Op::Constant(idx) => vec![(*idx, ConstKind::Any)],
        Op::GetGlobal(idx)
        | Op::SetGlobal(idx)
        | Op::DefineGlobal(idx)
        | Op::GetField(idx)
        | Op::SetField(idx)
        | Op::Super(_, idx)
        | Op::SuperUnpack(idx)
        | Op::InvokeUnpack(idx)
        | Op::SuperBind(idx)
        | Op::NewClass(idx)
        | Op::DefMethod(idx)
        | Op::Import(idx)
        | Op::ImportFrom(idx)
        | Op::ImportAll(idx) => vec![(*idx, ConstKind::Name)],
        Op::ImportName(module, name) => vec![(*module, ConstKind::Name), (*name, ConstKind::Name)],
        Op::Closure(idx, _) => vec![(*idx, ConstKind::Function)],
        Op::Native(idx) | Op::NativeMethod(idx) => vec![(*idx, ConstKind::Native)],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn module() -> CompiledModule {
        let mut main = FunctionProto::new(String::new());
        let idx = main.chunk.add_constant(Constant::Number(42.0)).unwrap();
        main.chunk.emit(Op::Constant(idx), 1);
        main.chunk.emit(Op::Return, 1);
        CompiledModule {
            file: "answer.cv".into(),
            main: Rc::new(main),
        }
    }

    #[test]
    fn test_round_trip() {
        let original = module();
        let bytes = serialize(&original);
        assert!(is_bytecode(&bytes));
        assert_eq!(deserialize(&bytes).unwrap(), original);
    }

    #[test]
    fn test_version_mismatch() {
        let mut bytes = serialize(&module());
        bytes[4] = VERSION_MAJOR + 1;
        assert_eq!(
            deserialize(&bytes),
            Err(BlobError::Version {
                found: (VERSION_MAJOR + 1, VERSION_MINOR),
                expected: (VERSION_MAJOR, VERSION_MINOR),
            })
        );
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(deserialize(b"print('hi')"), Err(BlobError::NotBytecode));
        assert_eq!(deserialize(b"\xb5C"), Err(BlobError::NotBytecode));

        let mut bytes = serialize(&module());
        bytes.truncate(HEADER_LEN + 3);
        assert!(matches!(deserialize(&bytes), Err(BlobError::Corrupt(_))));
    }

    #[test]
    fn test_verify_catches_bad_operands() {
        let mut proto = FunctionProto::new("broken".into());
        proto.chunk.emit(Op::GetGlobal(3), 1);
        proto.chunk.emit(Op::Return, 1);
        let err = verify(&proto).unwrap_err();
        assert_eq!(err.function, "broken");
        assert_eq!(err.offset, 0);

        let mut proto = FunctionProto::new("eager".into());
        proto.chunk.emit(Op::Null, 1);
        proto.chunk.emit(Op::Yield, 1);
        proto.chunk.emit(Op::Return, 1);
        assert_eq!(verify(&proto).unwrap_err().message, "yield outside a generator");

        let mut proto = FunctionProto::new("jumpy".into());
        proto.chunk.emit(Op::Jump(9), 1);
        proto.chunk.emit(Op::Return, 1);
        assert!(verify(&proto).is_err());
    }
}
