//! This module contains the textual emission of modules and functions.
//!
//! The dialect round-trips through [`crate::il::parser`]: the intrinsics
//! module is authored in it, and the final devirtualized routine is written
//! back out in it.

use std::collections::HashMap;

use crate::il::{
    BinaryOp,
    CastKind,
    Function,
    GlobalKind,
    Inst,
    InstId,
    Module,
    Predicate,
    Ty,
    Value,
};

/// Prints the whole `module`.
#[must_use]
pub fn print_module(module: &Module) -> String {
    let mut out = String::new();
    for (_, global) in module.globals() {
        match &global.kind {
            GlobalKind::ByteArray => {
                out.push_str(&format!("global {} : [0 x i8]\n", global.name));
            }
            GlobalKind::Scalar(ty) => {
                out.push_str(&format!("global {} : {}\n", global.name, ty_name(*ty)));
            }
            GlobalKind::FunctionPointer(target) => {
                out.push_str(&format!("global {} : ptr = @{target}\n", global.name));
            }
        }
    }
    out.push('\n');
    for (_, function) in module.functions() {
        out.push_str(&print_function(module, function));
        out.push('\n');
    }
    out
}

/// Prints one function definition or declaration.
#[must_use]
pub fn print_function(module: &Module, function: &Function) -> String {
    let params = function
        .params
        .iter()
        .map(|param| format!("{}: {}", param.name, ty_name(param.ty)))
        .collect::<Vec<_>>()
        .join(", ");
    let ret = function
        .ret
        .map_or_else(String::new, |ty| format!(" -> {}", ty_name(ty)));

    let mut attrs = Vec::new();
    if function.attrs.inline {
        attrs.push("inline");
    }
    if function.attrs.pure_fn {
        attrs.push("pure");
    }
    if function.attrs.noduplicate {
        attrs.push("noduplicate");
    }
    let attrs = if attrs.is_empty() {
        String::new()
    } else {
        format!(" attrs({})", attrs.join(", "))
    };

    if function.is_declaration() {
        return format!("declare {}({params}){ret}{attrs}\n", function.name);
    }

    // Results are renumbered densely in layout order.
    let mut numbers: HashMap<InstId, usize> = HashMap::new();
    for block in &function.blocks {
        for id in &block.insts {
            if function.inst_ty(module, *id).is_some() {
                let number = numbers.len();
                numbers.insert(*id, number);
            }
        }
    }

    let mut out = format!("define {}({params}){ret}{attrs} {{\n", function.name);
    for block in &function.blocks {
        out.push_str(&format!("{}:\n", block.label));
        for id in &block.insts {
            out.push_str("  ");
            if let Some(number) = numbers.get(id) {
                out.push_str(&format!("%{number} = "));
            }
            out.push_str(&print_inst(module, function, &numbers, *id));
            out.push('\n');
        }
    }
    out.push_str("}\n");
    out
}

fn print_inst(
    module: &Module,
    function: &Function,
    numbers: &HashMap<InstId, usize>,
    id: InstId,
) -> String {
    let value = |v: Value| print_value(module, function, numbers, v);
    match &function.insts[id] {
        Inst::Alloca { size } => format!("alloca {size}"),
        Inst::Load { ty, ptr } => format!("load {}, ptr {}", ty_name(*ty), value(*ptr)),
        Inst::Store { ty, value: v, ptr } => {
            format!("store {} {}, ptr {}", ty_name(*ty), value(*v), value(*ptr))
        }
        Inst::Gep { base, offset } => {
            format!("gep ptr {}, i64 {}", value(*base), value(*offset))
        }
        Inst::Binary { op, ty, lhs, rhs } => format!(
            "{} {} {}, {}",
            binary_name(*op),
            ty_name(*ty),
            value(*lhs),
            value(*rhs)
        ),
        Inst::Icmp { pred, ty, lhs, rhs } => format!(
            "icmp {} {} {}, {}",
            predicate_name(*pred),
            ty_name(*ty),
            value(*lhs),
            value(*rhs)
        ),
        Inst::Select {
            cond,
            ty,
            then,
            otherwise,
        } => format!(
            "select i1 {}, {} {}, {}",
            value(*cond),
            ty_name(*ty),
            value(*then),
            value(*otherwise)
        ),
        Inst::Cast { kind, to, value: v } => {
            let from = function
                .value_ty(module, *v)
                .expect("Cast operands are typed");
            format!(
                "{} {} {} to {}",
                cast_name(*kind),
                ty_name(from),
                value(*v),
                ty_name(*to)
            )
        }
        Inst::Phi { ty, incoming } => {
            let arms = incoming
                .iter()
                .map(|(block, v)| {
                    format!("[ {}, %{} ]", value(*v), function.blocks[*block].label)
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("phi {} {arms}", ty_name(*ty))
        }
        Inst::Call { callee, args } => {
            let callee = module.function(*callee);
            let args = args
                .iter()
                .map(|arg| {
                    let ty = function.value_ty(module, *arg).expect("Arguments are typed");
                    format!("{} {}", ty_name(ty), value(*arg))
                })
                .collect::<Vec<_>>()
                .join(", ");
            let ret = callee.ret.map_or("void".to_owned(), ty_name_owned);
            format!("call {ret} @{}({args})", callee.name)
        }
        Inst::Br { target } => format!("br label %{}", function.blocks[*target].label),
        Inst::CondBr {
            cond,
            then,
            otherwise,
        } => format!(
            "br i1 {}, label %{}, label %{}",
            value(*cond),
            function.blocks[*then].label,
            function.blocks[*otherwise].label
        ),
        Inst::Ret { value: None } => "ret void".to_owned(),
        Inst::Ret { value: Some(v) } => {
            let ty = function.value_ty(module, *v).expect("Returns are typed");
            format!("ret {} {}", ty_name(ty), value(*v))
        }
    }
}

fn print_value(
    module: &Module,
    function: &Function,
    numbers: &HashMap<InstId, usize>,
    value: Value,
) -> String {
    match value {
        Value::Const { value, .. } => format!("{value}"),
        Value::Undef { .. } => "undef".to_owned(),
        Value::Arg(index) => format!("%{}", function.params[index].name),
        Value::Global(id) => format!("@{}", module.global(id).name),
        Value::Inst(id) => format!("%{}", numbers[&id]),
    }
}

/// Gets the name of a type in the textual dialect.
#[must_use]
pub fn ty_name(ty: Ty) -> String {
    ty_name_owned(ty)
}

fn ty_name_owned(ty: Ty) -> String {
    match ty {
        Ty::I1 => "i1",
        Ty::I8 => "i8",
        Ty::I16 => "i16",
        Ty::I32 => "i32",
        Ty::I64 => "i64",
        Ty::Ptr => "ptr",
    }
    .to_owned()
}

/// Gets the mnemonic of a binary operator.
#[must_use]
pub fn binary_name(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "add",
        BinaryOp::Sub => "sub",
        BinaryOp::Mul => "mul",
        BinaryOp::And => "and",
        BinaryOp::Or => "or",
        BinaryOp::Xor => "xor",
        BinaryOp::Shl => "shl",
        BinaryOp::Lshr => "lshr",
        BinaryOp::Ashr => "ashr",
    }
}

/// Gets the mnemonic of a comparison predicate.
#[must_use]
pub fn predicate_name(pred: Predicate) -> &'static str {
    match pred {
        Predicate::Eq => "eq",
        Predicate::Ne => "ne",
        Predicate::Ult => "ult",
        Predicate::Ule => "ule",
        Predicate::Ugt => "ugt",
        Predicate::Uge => "uge",
        Predicate::Slt => "slt",
        Predicate::Sle => "sle",
        Predicate::Sgt => "sgt",
        Predicate::Sge => "sge",
    }
}

/// Gets the mnemonic of a cast kind.
#[must_use]
pub fn cast_name(kind: CastKind) -> &'static str {
    match kind {
        CastKind::Zext => "zext",
        CastKind::Sext => "sext",
        CastKind::Trunc => "trunc",
    }
}
