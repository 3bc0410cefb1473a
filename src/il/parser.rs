//! This module contains the parser for the textual IR dialect.
//!
//! Parsing is two-pass: the first pass registers globals and function
//! signatures so that call sites and the `SEM_` pointer table can resolve
//! forward references; the second pass fills in function bodies.

use std::collections::HashMap;

use crate::il::{
    Attrs,
    BinaryOp,
    BlockId,
    CastKind,
    Function,
    Global,
    GlobalKind,
    Inst,
    Module,
    Param,
    Predicate,
    Ty,
    Value,
};
use crate::error::lifting::{Error, Result};

/// Parses a whole module from its textual form.
pub fn parse_module(text: &str) -> Result<Module> {
    let mut module = Module::new();

    // First pass: globals and function signatures.
    for (number, raw) in text.lines().enumerate() {
        let line = strip_comment(raw);
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("global ") {
            module.add_global(parse_global(rest, number + 1)?);
        } else if line.starts_with("declare ") || line.starts_with("define ") {
            let header = parse_header(line, number + 1)?;
            module.add_function(header);
        }
    }

    // Second pass: bodies.
    let mut lines = text.lines().enumerate().peekable();
    while let Some((number, raw)) = lines.next() {
        let line = strip_comment(raw);
        let Some(rest) = line.strip_prefix("define ") else {
            continue;
        };
        let name = rest
            .split('(')
            .next()
            .ok_or_else(|| error(number + 1, "malformed define"))?
            .trim();
        let id = module
            .function_by_name(name)
            .ok_or_else(|| error(number + 1, "function vanished between passes"))?;

        // Collect the body lines up to the closing brace.
        let mut body = Vec::new();
        for (body_number, body_raw) in lines.by_ref() {
            let body_line = strip_comment(body_raw);
            if body_line == "}" {
                break;
            }
            if !body_line.is_empty() {
                body.push((body_number + 1, body_line.to_owned()));
            }
        }
        parse_body(&mut module, id, &body)?;
    }

    Ok(module)
}

/// Strips a `;` comment and surrounding whitespace.
fn strip_comment(line: &str) -> &str {
    line.split(';').next().unwrap_or("").trim()
}

fn error(line: usize, message: impl Into<String>) -> Error {
    Error::Parse {
        line,
        message: message.into(),
    }
}

fn parse_global(rest: &str, number: usize) -> Result<Global> {
    // NAME : TYPE [= @func]
    let (name, shape) = rest
        .split_once(':')
        .ok_or_else(|| error(number, "global needs a type"))?;
    let name = name.trim().to_owned();
    let shape = shape.trim();

    if let Some((ty, init)) = shape.split_once('=') {
        if ty.trim() != "ptr" {
            return Err(error(number, "initialized globals must be pointers"));
        }
        let target = init
            .trim()
            .strip_prefix('@')
            .ok_or_else(|| error(number, "global initializer must name a function"))?;
        return Ok(Global {
            name,
            kind: GlobalKind::FunctionPointer(target.to_owned()),
        });
    }
    if shape == "[0 x i8]" {
        return Ok(Global {
            name,
            kind: GlobalKind::ByteArray,
        });
    }
    let ty = parse_ty(shape).ok_or_else(|| error(number, format!("unknown type {shape:?}")))?;
    Ok(Global {
        name,
        kind: GlobalKind::Scalar(ty),
    })
}

/// Parses a `define`/`declare` header into a body-less function.
fn parse_header(line: &str, number: usize) -> Result<Function> {
    let rest = line
        .strip_prefix("declare ")
        .or_else(|| line.strip_prefix("define "))
        .expect("caller checked the prefix");
    let rest = rest.trim_end_matches('{').trim();

    let open = rest
        .find('(')
        .ok_or_else(|| error(number, "function needs a parameter list"))?;
    let close = rest
        .rfind(')')
        .ok_or_else(|| error(number, "unterminated parameter list"))?;
    let name = rest[..open].trim().to_owned();

    let mut params = Vec::new();
    let list = &rest[open + 1..close];
    if !list.trim().is_empty() {
        for piece in list.split(',') {
            let (pname, ty) = piece
                .split_once(':')
                .ok_or_else(|| error(number, "parameter needs a type"))?;
            let ty = parse_ty(ty.trim())
                .ok_or_else(|| error(number, format!("unknown type {:?}", ty.trim())))?;
            params.push(Param {
                name: pname.trim().to_owned(),
                ty,
            });
        }
    }

    let tail = rest[close + 1..].trim();
    let mut ret = None;
    let mut attrs = Attrs::default();
    let mut tail = tail;
    if let Some(rest) = tail.strip_prefix("->") {
        let (ty, more) = match rest.trim_start().split_once(' ') {
            Some((ty, more)) => (ty, more),
            None => (rest.trim(), ""),
        };
        ret = Some(
            parse_ty(ty.trim()).ok_or_else(|| error(number, format!("unknown type {ty:?}")))?,
        );
        tail = more;
    }
    let tail = tail.trim();
    if let Some(rest) = tail.strip_prefix("attrs(") {
        let list = rest
            .strip_suffix(')')
            .ok_or_else(|| error(number, "unterminated attrs"))?;
        for attr in list.split(',') {
            match attr.trim() {
                "inline" => attrs.inline = true,
                "pure" => attrs.pure_fn = true,
                "noduplicate" => attrs.noduplicate = true,
                other => return Err(error(number, format!("unknown attribute {other:?}"))),
            }
        }
    } else if !tail.is_empty() {
        return Err(error(number, format!("trailing tokens {tail:?}")));
    }

    let mut function = Function::declaration(name, params, ret);
    function.attrs = attrs;
    Ok(function)
}

/// Parses the body lines of the function with id `id`.
fn parse_body(module: &mut Module, id: usize, body: &[(usize, String)]) -> Result<()> {
    // Pre-scan the labels so branches can reference blocks ahead of their
    // definitions.
    let mut labels: HashMap<String, BlockId> = HashMap::new();
    {
        let function = module.function_mut(id);
        for (number, line) in body {
            if let Some(label) = line.strip_suffix(':') {
                if labels
                    .insert(label.to_owned(), function.add_block(label))
                    .is_some()
                {
                    return Err(error(*number, format!("duplicate label {label:?}")));
                }
            }
        }
    }
    if labels.is_empty() {
        return Err(error(
            body.first().map_or(0, |(n, _)| *n),
            "function body has no blocks",
        ));
    }

    let mut locals: HashMap<String, Value> = HashMap::new();
    for (index, param) in module.function(id).params.iter().enumerate() {
        locals.insert(param.name.clone(), Value::Arg(index));
    }

    let mut block: Option<BlockId> = None;
    for (number, line) in body {
        if let Some(label) = line.strip_suffix(':') {
            block = Some(labels[label]);
            continue;
        }
        let block =
            block.ok_or_else(|| error(*number, "instruction before the first label"))?;

        let (result, op_text) = match line.split_once('=') {
            Some((result, op)) if result.trim_start().starts_with('%') => {
                (Some(result.trim().to_owned()), op.trim().to_owned())
            }
            _ => (None, line.clone()),
        };

        let inst = parse_inst(module, &labels, &locals, &op_text, *number)?;
        let value = module.function_mut(id).append(block, inst);
        if let Some(result) = result {
            let name = result
                .strip_prefix('%')
                .ok_or_else(|| error(*number, "results must be %-named"))?;
            if locals.insert(name.to_owned(), value).is_some() {
                return Err(error(*number, format!("redefinition of %{name}")));
            }
        }
    }
    Ok(())
}

/// Parses one instruction from its textual form.
fn parse_inst(
    module: &Module,
    labels: &HashMap<String, BlockId>,
    locals: &HashMap<String, Value>,
    text: &str,
    number: usize,
) -> Result<Inst> {
    let (mnemonic, rest) = text.split_once(' ').unwrap_or((text, ""));
    let rest = rest.trim();
    let value = |ty: Ty, token: &str| parse_value(module, locals, ty, token, number);

    match mnemonic {
        "alloca" => {
            let size = rest
                .parse::<u64>()
                .map_err(|_| error(number, "alloca needs a byte size"))?;
            Ok(Inst::Alloca { size })
        }
        "load" => {
            // load TY, ptr VAL
            let (ty, ptr) = rest
                .split_once(',')
                .ok_or_else(|| error(number, "malformed load"))?;
            let ty = parse_ty(ty.trim()).ok_or_else(|| error(number, "unknown load type"))?;
            let ptr = ptr
                .trim()
                .strip_prefix("ptr ")
                .ok_or_else(|| error(number, "load needs a ptr operand"))?;
            Ok(Inst::Load {
                ty,
                ptr: value(Ty::Ptr, ptr.trim())?,
            })
        }
        "store" => {
            // store TY VAL, ptr VAL
            let (lhs, ptr) = rest
                .split_once(',')
                .ok_or_else(|| error(number, "malformed store"))?;
            let (ty, v) = lhs
                .trim()
                .split_once(' ')
                .ok_or_else(|| error(number, "store needs a typed value"))?;
            let ty = parse_ty(ty.trim()).ok_or_else(|| error(number, "unknown store type"))?;
            let ptr = ptr
                .trim()
                .strip_prefix("ptr ")
                .ok_or_else(|| error(number, "store needs a ptr operand"))?;
            Ok(Inst::Store {
                ty,
                value: value(ty, v.trim())?,
                ptr: value(Ty::Ptr, ptr.trim())?,
            })
        }
        "gep" => {
            // gep ptr VAL, i64 VAL
            let (base, offset) = rest
                .split_once(',')
                .ok_or_else(|| error(number, "malformed gep"))?;
            let base = base
                .trim()
                .strip_prefix("ptr ")
                .ok_or_else(|| error(number, "gep needs a ptr base"))?;
            let offset = offset
                .trim()
                .strip_prefix("i64 ")
                .ok_or_else(|| error(number, "gep offsets are i64"))?;
            Ok(Inst::Gep {
                base:   value(Ty::Ptr, base.trim())?,
                offset: value(Ty::I64, offset.trim())?,
            })
        }
        "add" | "sub" | "mul" | "and" | "or" | "xor" | "shl" | "lshr" | "ashr" => {
            let op = match mnemonic {
                "add" => BinaryOp::Add,
                "sub" => BinaryOp::Sub,
                "mul" => BinaryOp::Mul,
                "and" => BinaryOp::And,
                "or" => BinaryOp::Or,
                "xor" => BinaryOp::Xor,
                "shl" => BinaryOp::Shl,
                "lshr" => BinaryOp::Lshr,
                _ => BinaryOp::Ashr,
            };
            let (ty, operands) = rest
                .split_once(' ')
                .ok_or_else(|| error(number, "binary op needs a type"))?;
            let ty = parse_ty(ty.trim()).ok_or_else(|| error(number, "unknown type"))?;
            let (lhs, rhs) = operands
                .split_once(',')
                .ok_or_else(|| error(number, "binary op needs two operands"))?;
            Ok(Inst::Binary {
                op,
                ty,
                lhs: value(ty, lhs.trim())?,
                rhs: value(ty, rhs.trim())?,
            })
        }
        "icmp" => {
            let (pred, rest) = rest
                .split_once(' ')
                .ok_or_else(|| error(number, "icmp needs a predicate"))?;
            let pred = parse_predicate(pred.trim())
                .ok_or_else(|| error(number, "unknown predicate"))?;
            let (ty, operands) = rest
                .trim()
                .split_once(' ')
                .ok_or_else(|| error(number, "icmp needs a type"))?;
            let ty = parse_ty(ty.trim()).ok_or_else(|| error(number, "unknown type"))?;
            let (lhs, rhs) = operands
                .split_once(',')
                .ok_or_else(|| error(number, "icmp needs two operands"))?;
            Ok(Inst::Icmp {
                pred,
                ty,
                lhs: value(ty, lhs.trim())?,
                rhs: value(ty, rhs.trim())?,
            })
        }
        "select" => {
            // select i1 VAL, TY VAL, VAL
            let rest = rest
                .strip_prefix("i1 ")
                .ok_or_else(|| error(number, "select conditions are i1"))?;
            let (cond, rest) = rest
                .split_once(',')
                .ok_or_else(|| error(number, "malformed select"))?;
            let (ty, operands) = rest
                .trim()
                .split_once(' ')
                .ok_or_else(|| error(number, "select needs a type"))?;
            let ty = parse_ty(ty.trim()).ok_or_else(|| error(number, "unknown type"))?;
            let (then, otherwise) = operands
                .split_once(',')
                .ok_or_else(|| error(number, "select needs two arms"))?;
            Ok(Inst::Select {
                cond: value(Ty::I1, cond.trim())?,
                ty,
                then: value(ty, then.trim())?,
                otherwise: value(ty, otherwise.trim())?,
            })
        }
        "zext" | "sext" | "trunc" => {
            let kind = match mnemonic {
                "zext" => CastKind::Zext,
                "sext" => CastKind::Sext,
                _ => CastKind::Trunc,
            };
            // CAST TY VAL to TY
            let (from, rest) = rest
                .split_once(' ')
                .ok_or_else(|| error(number, "cast needs a source type"))?;
            let from =
                parse_ty(from.trim()).ok_or_else(|| error(number, "unknown type"))?;
            let (v, to) = rest
                .split_once(" to ")
                .ok_or_else(|| error(number, "cast needs a target type"))?;
            let to = parse_ty(to.trim()).ok_or_else(|| error(number, "unknown type"))?;
            Ok(Inst::Cast {
                kind,
                to,
                value: value(from, v.trim())?,
            })
        }
        "phi" => {
            let (ty, arms) = rest
                .split_once(' ')
                .ok_or_else(|| error(number, "phi needs a type"))?;
            let ty = parse_ty(ty.trim()).ok_or_else(|| error(number, "unknown type"))?;
            let mut incoming = Vec::new();
            for arm in arms.split("],") {
                let arm = arm.trim().trim_start_matches('[').trim_end_matches(']');
                let (v, label) = arm
                    .split_once(',')
                    .ok_or_else(|| error(number, "malformed phi arm"))?;
                let label = label
                    .trim()
                    .strip_prefix('%')
                    .ok_or_else(|| error(number, "phi arm needs a label"))?;
                let block = *labels
                    .get(label)
                    .ok_or_else(|| error(number, format!("unknown label {label:?}")))?;
                incoming.push((block, value(ty, v.trim())?));
            }
            Ok(Inst::Phi { ty, incoming })
        }
        "call" => {
            // call RET @NAME(TY VAL, ...)
            let (_ret, rest) = rest
                .split_once(' ')
                .ok_or_else(|| error(number, "call needs a return type"))?;
            let rest = rest.trim();
            let open = rest
                .find('(')
                .ok_or_else(|| error(number, "call needs an argument list"))?;
            let close = rest
                .rfind(')')
                .ok_or_else(|| error(number, "unterminated argument list"))?;
            let callee_name = rest[..open]
                .trim()
                .strip_prefix('@')
                .ok_or_else(|| error(number, "call target must be @-named"))?;
            let callee = module
                .function_by_name(callee_name)
                .ok_or_else(|| error(number, format!("unknown function @{callee_name}")))?;
            let mut args = Vec::new();
            let list = &rest[open + 1..close];
            if !list.trim().is_empty() {
                for piece in list.split(',') {
                    let (ty, v) = piece
                        .trim()
                        .split_once(' ')
                        .ok_or_else(|| error(number, "call arguments are typed"))?;
                    let ty =
                        parse_ty(ty.trim()).ok_or_else(|| error(number, "unknown type"))?;
                    args.push(value(ty, v.trim())?);
                }
            }
            Ok(Inst::Call { callee, args })
        }
        "br" => {
            if let Some(target) = rest.strip_prefix("label %") {
                let block = *labels
                    .get(target.trim())
                    .ok_or_else(|| error(number, format!("unknown label {target:?}")))?;
                return Ok(Inst::Br { target: block });
            }
            let rest = rest
                .strip_prefix("i1 ")
                .ok_or_else(|| error(number, "malformed br"))?;
            let (cond, targets) = rest
                .split_once(',')
                .ok_or_else(|| error(number, "conditional br needs targets"))?;
            let (then, otherwise) = targets
                .split_once(',')
                .ok_or_else(|| error(number, "conditional br needs two targets"))?;
            let then = then
                .trim()
                .strip_prefix("label %")
                .ok_or_else(|| error(number, "malformed br target"))?;
            let otherwise = otherwise
                .trim()
                .strip_prefix("label %")
                .ok_or_else(|| error(number, "malformed br target"))?;
            Ok(Inst::CondBr {
                cond: value(Ty::I1, cond.trim())?,
                then: *labels
                    .get(then)
                    .ok_or_else(|| error(number, format!("unknown label {then:?}")))?,
                otherwise: *labels
                    .get(otherwise)
                    .ok_or_else(|| error(number, format!("unknown label {otherwise:?}")))?,
            })
        }
        "ret" => {
            if rest == "void" || rest.is_empty() {
                return Ok(Inst::Ret { value: None });
            }
            let (ty, v) = rest
                .split_once(' ')
                .ok_or_else(|| error(number, "ret needs a typed value"))?;
            let ty = parse_ty(ty.trim()).ok_or_else(|| error(number, "unknown type"))?;
            Ok(Inst::Ret {
                value: Some(value(ty, v.trim())?),
            })
        }
        other => Err(error(number, format!("unknown instruction {other:?}"))),
    }
}

/// Parses one value token in a `ty` context.
fn parse_value(
    module: &Module,
    locals: &HashMap<String, Value>,
    ty: Ty,
    token: &str,
    number: usize,
) -> Result<Value> {
    if token == "undef" {
        return Ok(Value::Undef { ty });
    }
    if let Some(name) = token.strip_prefix('%') {
        return locals
            .get(name)
            .copied()
            .ok_or_else(|| error(number, format!("unknown value %{name}")));
    }
    if let Some(name) = token.strip_prefix('@') {
        let id = module
            .global_by_name(name)
            .ok_or_else(|| error(number, format!("unknown global @{name}")))?;
        return Ok(Value::Global(id));
    }
    let parsed = if let Some(hex) = token.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else if let Some(negative) = token.strip_prefix('-') {
        negative.parse::<u64>().ok().map(u64::wrapping_neg)
    } else {
        token.parse::<u64>().ok()
    };
    let parsed =
        parsed.ok_or_else(|| error(number, format!("malformed constant {token:?}")))?;
    Ok(Value::const_int(ty, parsed))
}

fn parse_ty(token: &str) -> Option<Ty> {
    match token {
        "i1" => Some(Ty::I1),
        "i8" => Some(Ty::I8),
        "i16" => Some(Ty::I16),
        "i32" => Some(Ty::I32),
        "i64" => Some(Ty::I64),
        "ptr" => Some(Ty::Ptr),
        _ => None,
    }
}

fn parse_predicate(token: &str) -> Option<Predicate> {
    match token {
        "eq" => Some(Predicate::Eq),
        "ne" => Some(Predicate::Ne),
        "ult" => Some(Predicate::Ult),
        "ule" => Some(Predicate::Ule),
        "ugt" => Some(Predicate::Ugt),
        "uge" => Some(Predicate::Uge),
        "slt" => Some(Predicate::Slt),
        "sle" => Some(Predicate::Sle),
        "sgt" => Some(Predicate::Sgt),
        "sge" => Some(Predicate::Sge),
        _ => None,
    }
}
