//! This module contains the local memory optimizations: common-subexpression
//! elimination over address computations, store-to-load forwarding, and
//! dead-store elimination.
//!
//! All three work within one basic block at a time and consult the segment
//! classification from [`super::alias`] before letting an access cross a
//! store. Address identity is established by the CSE half: once two
//! structurally identical geps are one value, forwarding and elimination
//! reduce to value identity plus constant-offset disambiguation.

use std::collections::HashMap;

use crate::il::{
    opt::alias::{self, AliasResult},
    BinaryOp,
    FuncId,
    Inst,
    InstId,
    Module,
    Ty,
    Value,
};

/// How two memory locations relate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Overlap {
    /// Provably the same location.
    Must,

    /// Provably disjoint locations.
    No,

    /// Nothing provable.
    May,
}

/// Runs one round of the memory optimizations over the function with id
/// `id`, returning whether anything changed.
pub fn run(module: &mut Module, id: FuncId) -> bool {
    let mut replace: HashMap<InstId, Value> = HashMap::new();
    let mut dead_stores: Vec<InstId> = Vec::new();

    {
        let function = module.function(id);
        for block in &function.blocks {
            scan_block(module, function, &block.insts, &mut replace, &mut dead_stores);
        }
    }

    if replace.is_empty() && dead_stores.is_empty() {
        return false;
    }

    let function = module.function_mut(id);
    if !replace.is_empty() {
        let resolve = |mut value: Value| {
            let mut hops = 0;
            while let Value::Inst(id) = value {
                match replace.get(&id) {
                    Some(next) if hops < 64 => {
                        value = *next;
                        hops += 1;
                    }
                    _ => break,
                }
            }
            value
        };
        for inst in &mut function.insts {
            inst.map_operands(&resolve);
        }
    }
    for block in &mut function.blocks {
        block.insts.retain(|inst_id| !dead_stores.contains(inst_id));
    }
    true
}

/// One tracked store: its location, the stored value, and whether anything
/// may have read the location since.
struct TrackedStore {
    ptr: Value,
    ty: Ty,
    value: Value,
    inst: InstId,
    read: bool,
}

fn scan_block(
    module: &Module,
    function: &crate::il::Function,
    insts: &[InstId],
    replace: &mut HashMap<InstId, Value>,
    dead_stores: &mut Vec<InstId>,
) {
    // Structural value numbering for pure operations.
    let mut expressions: HashMap<Inst, Value> = HashMap::new();
    // Values known to be in memory, from stores and from previous loads.
    let mut stores: Vec<TrackedStore> = Vec::new();
    let mut loads: Vec<(Value, Ty, Value)> = Vec::new();

    let resolve = |value: Value, replace: &HashMap<InstId, Value>| -> Value {
        let mut value = value;
        let mut hops = 0;
        while let Value::Inst(id) = value {
            match replace.get(&id) {
                Some(next) if hops < 64 => {
                    value = *next;
                    hops += 1;
                }
                _ => break,
            }
        }
        value
    };

    for inst_id in insts {
        let mut inst = function.insts[*inst_id].clone();
        inst.map_operands(&|value| resolve(value, replace));

        match &inst {
            Inst::Gep { .. }
            | Inst::Binary { .. }
            | Inst::Icmp { .. }
            | Inst::Select { .. }
            | Inst::Cast { .. } => {
                if let Some(existing) = expressions.get(&inst) {
                    replace.insert(*inst_id, *existing);
                } else {
                    expressions.insert(inst, Value::Inst(*inst_id));
                }
            }
            Inst::Load { ty, ptr } => {
                // Forward a tracked store or a previous load of the same
                // location.
                let forwarded = stores
                    .iter()
                    .rev()
                    .find(|store| {
                        store.ty == *ty
                            && overlap(module, function, store.ptr, *ptr, *ty, *ty)
                                == Overlap::Must
                    })
                    .map(|store| store.value)
                    .or_else(|| {
                        loads.iter().rev().find_map(|(lptr, lty, value)| {
                            (lty == ty
                                && overlap(module, function, *lptr, *ptr, *ty, *ty)
                                    == Overlap::Must)
                                .then_some(*value)
                        })
                    });
                if let Some(value) = forwarded {
                    replace.insert(*inst_id, value);
                } else {
                    loads.push((*ptr, *ty, Value::Inst(*inst_id)));
                    // The load observes every store it may overlap.
                    for store in &mut stores {
                        if overlap(module, function, store.ptr, *ptr, store.ty, *ty)
                            != Overlap::No
                        {
                            store.read = true;
                        }
                    }
                }
            }
            Inst::Store { ty, value, ptr } => {
                // An exact, unread predecessor store dies here.
                for store in &stores {
                    if !store.read
                        && store.ty == *ty
                        && overlap(module, function, store.ptr, *ptr, store.ty, *ty)
                            == Overlap::Must
                    {
                        dead_stores.push(store.inst);
                    }
                }
                // Knowledge that may overlap the written range is gone.
                stores.retain(|store| {
                    overlap(module, function, store.ptr, *ptr, store.ty, *ty) == Overlap::No
                });
                loads.retain(|(lptr, lty, _)| {
                    overlap(module, function, *lptr, *ptr, *lty, *ty) == Overlap::No
                });
                stores.push(TrackedStore {
                    ptr: *ptr,
                    ty: *ty,
                    value: *value,
                    inst: *inst_id,
                    read: false,
                });
            }
            Inst::Call { callee, .. } => {
                if !module.function(*callee).attrs.pure_fn {
                    // The callee may read or write anything.
                    for store in &mut stores {
                        store.read = true;
                    }
                    stores.clear();
                    loads.clear();
                }
            }
            _ => {}
        }
    }
}

/// Relates two typed memory locations.
fn overlap(
    module: &Module,
    function: &crate::il::Function,
    a: Value,
    b: Value,
    a_ty: Ty,
    b_ty: Ty,
) -> Overlap {
    if a == b {
        return if a_ty == b_ty { Overlap::Must } else { Overlap::May };
    }
    // Only byte-sized integer accesses participate in offset reasoning.
    if !matches!(a_ty, Ty::I8 | Ty::I16 | Ty::I32 | Ty::I64)
        || !matches!(b_ty, Ty::I8 | Ty::I16 | Ty::I32 | Ty::I64)
    {
        return Overlap::May;
    }

    // Constant-offset disambiguation against a common base.
    if let (Some((a_base, a_off)), Some((b_base, b_off))) =
        (decompose(function, a), decompose(function, b))
    {
        if a_base == b_base {
            let (a_off, b_off) = (a_off as i64, b_off as i64);
            let a_end = a_off + a_ty.bytes() as i64;
            let b_end = b_off + b_ty.bytes() as i64;
            if a_end <= b_off || b_end <= a_off {
                return Overlap::No;
            }
            if a_off == b_off && a_ty == b_ty {
                return Overlap::Must;
            }
            return Overlap::May;
        }
    }

    // Distinct identified objects cannot overlap: allocations, the segment
    // globals, and the pointer arguments (which the stub signatures declare
    // non-aliasing).
    if let (Some(a_root), Some(b_root)) = (root(function, a), root(function, b)) {
        if a_root != b_root
            && is_identified(function, a_root)
            && is_identified(function, b_root)
        {
            return Overlap::No;
        }
    }

    // Segment classification.
    match alias::alias(module, function, a, b) {
        AliasResult::NoAlias => Overlap::No,
        AliasResult::MayAlias => Overlap::May,
    }
}

/// Decomposes a pointer into `(base value, constant byte offset)`.
///
/// The base is either the non-constant part of the gep index (with the gep
/// base folded in) or the gep base itself for constant indices.
fn decompose(function: &crate::il::Function, ptr: Value) -> Option<(DecomposedBase, u64)> {
    let Value::Inst(id) = ptr else {
        return Some((DecomposedBase::Plain(ptr), 0));
    };
    let Inst::Gep { base, offset } = &function.insts[id] else {
        return Some((DecomposedBase::Plain(ptr), 0));
    };

    let mut constant: u64 = 0;
    let mut index = *offset;
    loop {
        match index {
            Value::Const { value, .. } => {
                return Some((DecomposedBase::Indexed(*base, None), constant.wrapping_add(value)));
            }
            Value::Inst(id) => match &function.insts[id] {
                Inst::Binary {
                    op: BinaryOp::Add,
                    lhs,
                    rhs,
                    ..
                } => {
                    if let Some(value) = rhs.as_const() {
                        constant = constant.wrapping_add(value);
                        index = *lhs;
                    } else if let Some(value) = lhs.as_const() {
                        constant = constant.wrapping_add(value);
                        index = *rhs;
                    } else {
                        return Some((DecomposedBase::Indexed(*base, Some(index)), constant));
                    }
                }
                Inst::Binary {
                    op: BinaryOp::Sub,
                    lhs,
                    rhs,
                    ..
                } => {
                    if let Some(value) = rhs.as_const() {
                        constant = constant.wrapping_sub(value);
                        index = *lhs;
                    } else {
                        return Some((DecomposedBase::Indexed(*base, Some(index)), constant));
                    }
                }
                _ => return Some((DecomposedBase::Indexed(*base, Some(index)), constant)),
            },
            other => return Some((DecomposedBase::Indexed(*base, Some(other)), constant)),
        }
    }
}

/// The base of a decomposed pointer: either the pointer value itself, or a
/// gep base together with the non-constant part of its index.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DecomposedBase {
    Plain(Value),
    Indexed(Value, Option<Value>),
}

/// Walks a pointer to its root value.
fn root(function: &crate::il::Function, ptr: Value) -> Option<Value> {
    let mut value = ptr;
    let mut hops = 0;
    while let Value::Inst(id) = value {
        if hops > 64 {
            return None;
        }
        hops += 1;
        match &function.insts[id] {
            Inst::Gep { base, .. } => value = *base,
            Inst::Alloca { .. } => return Some(value),
            _ => return None,
        }
    }
    Some(value)
}

/// Checks whether `value` roots an identified object: a stack allocation, a
/// module global, or a pointer argument.
fn is_identified(function: &crate::il::Function, value: Value) -> bool {
    match value {
        Value::Global(_) | Value::Arg(_) => true,
        Value::Inst(id) => matches!(function.insts[id], Inst::Alloca { .. }),
        _ => false,
    }
}
