//! This module contains the segment-aware alias analysis.
//!
//! After lifting, every memory access goes through the flat `RAM` array,
//! which makes the standard disambiguation hopeless: virtual-stack traffic,
//! virtual-register spills and genuine native-memory accesses all look like
//! `RAM[index]`. The classifier inspects the shape of the index expression
//! to put each pointer into a segment, and two pointers in distinct known
//! segments can never alias.

use std::collections::HashSet;

use log::warn;

use crate::il::{BinaryOp, Function, GlobalKind, Inst, Module, Value};

/// The segment classification of a pointer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PointerClass {
    /// A computed index into native memory.
    MemoryArray,

    /// A fixed native-memory slot.
    MemorySlot,

    /// A computed index into the virtual stack.
    StackArray,

    /// A fixed virtual-stack slot.
    StackSlot,

    /// Nothing provable about the pointer.
    Unknown,
}

/// The possible answers of an alias query.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AliasResult {
    NoAlias,
    MayAlias,
}

/// Classifies `ptr` into a segment by the shape of its index expression.
#[must_use]
pub fn classify(module: &Module, function: &Function, ptr: Value) -> PointerClass {
    let Value::Inst(id) = ptr else {
        return PointerClass::Unknown;
    };
    let Inst::Gep { base, offset } = &function.insts[id] else {
        return PointerClass::Unknown;
    };
    if !is_ram(module, *base) {
        return PointerClass::Unknown;
    }

    if is_stack_slot(function, *offset) {
        return PointerClass::StackSlot;
    }

    // Walk the index expression transitively, accumulating the base values
    // it was computed from: loads and function arguments. Exactly two
    // distinct bases is the signature of a native pointer with a computed
    // offset.
    let mut known: HashSet<Value> = HashSet::new();
    let mut worklist = vec![*offset];
    let mut bases: Vec<Value> = Vec::new();

    while let Some(value) = worklist.pop() {
        if !known.insert(value) {
            continue;
        }
        let Value::Inst(id) = value else {
            if matches!(value, Value::Arg(_)) {
                bases.push(value);
            }
            continue;
        };
        match &function.insts[id] {
            Inst::Load { ptr, .. } => {
                bases.push(*ptr);
                continue;
            }
            Inst::Call { callee, .. } => {
                let name = &module.function(*callee).name;
                if !name.starts_with("ctpop") && !name.starts_with("fshr")
                    && !name.starts_with("fshl")
                {
                    warn!("unknown pointer call instruction: @{name}");
                    return PointerClass::Unknown;
                }
            }
            Inst::Binary { .. }
            | Inst::Select { .. }
            | Inst::Cast { .. }
            | Inst::Icmp { .. }
            | Inst::Phi { .. } => {}
            other => {
                warn!("unknown instruction in pointer index: {other:?}");
                return PointerClass::Unknown;
            }
        }
        for operand in function.insts[id].operands() {
            if matches!(operand, Value::Inst(_) | Value::Arg(_)) {
                worklist.push(operand);
            }
        }
    }

    if bases.len() == 2 {
        return PointerClass::MemoryArray;
    }
    PointerClass::Unknown
}

/// Checks whether `offset` has one of the virtual-stack slot shapes:
/// a load through a `*sp` argument, such a load plus a constant, or a `*sp`
/// argument plus a constant.
fn is_stack_slot(function: &Function, offset: Value) -> bool {
    if is_sp_load(function, offset) || is_sp_arg(function, offset) {
        return true;
    }
    if let Value::Inst(id) = offset {
        if let Inst::Binary {
            op: BinaryOp::Add,
            lhs,
            rhs,
            ..
        } = &function.insts[id]
        {
            let constant = lhs.as_const().is_some() || rhs.as_const().is_some();
            let base = if lhs.as_const().is_some() { *rhs } else { *lhs };
            return constant && (is_sp_load(function, base) || is_sp_arg(function, base));
        }
    }
    false
}

/// Checks whether `value` loads through an argument whose name ends in
/// `sp`.
fn is_sp_load(function: &Function, value: Value) -> bool {
    let Value::Inst(id) = value else {
        return false;
    };
    let Inst::Load { ptr, .. } = &function.insts[id] else {
        return false;
    };
    is_sp_arg(function, *ptr)
}

/// Checks whether `value` is an argument whose name ends in `sp`.
fn is_sp_arg(function: &Function, value: Value) -> bool {
    let Value::Arg(index) = value else {
        return false;
    };
    function
        .params
        .get(index)
        .is_some_and(|param| param.name.ends_with("sp"))
}

/// Checks whether `value` is the `RAM` segment base.
fn is_ram(module: &Module, value: Value) -> bool {
    let Value::Global(id) = value else {
        return false;
    };
    let global = module.global(id);
    global.name == "RAM" && global.kind == GlobalKind::ByteArray
}

/// Answers an alias query over two pointers.
///
/// The only answer this analysis ever gives on its own is [`NoAlias`], for
/// pointers in provably distinct segments; everything else is delegated to
/// the caller's fallback disambiguation as [`MayAlias`].
///
/// [`NoAlias`]: AliasResult::NoAlias
/// [`MayAlias`]: AliasResult::MayAlias
#[must_use]
pub fn alias(module: &Module, function: &Function, a: Value, b: Value) -> AliasResult {
    let a_class = classify(module, function, a);
    let b_class = classify(module, function, b);

    if a_class != PointerClass::Unknown && b_class != PointerClass::Unknown && a_class != b_class
    {
        return AliasResult::NoAlias;
    }
    AliasResult::MayAlias
}
