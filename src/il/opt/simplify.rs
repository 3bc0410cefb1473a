//! This module contains the local simplification pass: constant folding,
//! algebraic peepholes, and dead-code elimination.

use std::collections::{HashMap, HashSet};

use crate::il::{BinaryOp, CastKind, FuncId, Inst, InstId, Module, Predicate, Ty, Value};

/// Runs one round of simplification over the function with id `id`,
/// returning whether anything changed.
pub fn run(module: &mut Module, id: FuncId) -> bool {
    let folded = fold(module, id);
    let swept = eliminate_dead_code(module, id);
    folded || swept
}

/// Folds constants and applies algebraic identities, rewriting uses.
fn fold(module: &mut Module, id: FuncId) -> bool {
    let mut replace: HashMap<InstId, Value> = HashMap::new();

    {
        let function = module.function(id);
        for block in &function.blocks {
            for inst_id in &block.insts {
                if replace.contains_key(inst_id) {
                    continue;
                }
                if let Some(value) = fold_inst(function, &function.insts[*inst_id]) {
                    replace.insert(*inst_id, value);
                }
            }
        }
    }

    if replace.is_empty() {
        return false;
    }

    // Resolve chains before substituting.
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

    let function = module.function_mut(id);
    for inst in &mut function.insts {
        inst.map_operands(&resolve);
    }
    true
}

/// Attempts to reduce one instruction to a plain value.
fn fold_inst(function: &crate::il::Function, inst: &Inst) -> Option<Value> {
    match inst {
        Inst::Binary { op, ty, lhs, rhs } => {
            fold_binary(*op, *ty, *lhs, *rhs).or_else(|| cancel(function, *op, *lhs, *rhs))
        }
        Inst::Icmp { pred, lhs, rhs, .. } => {
            let (a, b) = (lhs.as_const()?, rhs.as_const()?);
            let bits = ty_bits_of(*lhs)?;
            Some(Value::const_int(Ty::I1, u64::from(compare(*pred, a, b, bits))))
        }
        Inst::Select {
            cond,
            then,
            otherwise,
            ..
        } => match cond {
            Value::Const { value, .. } => Some(if *value != 0 { *then } else { *otherwise }),
            _ if then == otherwise => Some(*then),
            _ => None,
        },
        Inst::Cast { kind, to, value } => match value {
            Value::Const { ty, value } => {
                let folded = match kind {
                    CastKind::Zext => *value,
                    CastKind::Trunc => *value,
                    CastKind::Sext => {
                        let bits = ty.bits();
                        (((*value << (64 - bits)) as i64) >> (64 - bits)) as u64
                    }
                };
                Some(Value::const_int(*to, folded))
            }
            Value::Undef { .. } => Some(Value::Undef { ty: *to }),
            _ => None,
        },
        Inst::Phi { incoming, .. } => {
            // A phi whose arms all agree is that value.
            let first = incoming.first()?.1;
            incoming
                .iter()
                .all(|(_, value)| *value == first)
                .then_some(first)
        }
        _ => None,
    }
}

fn fold_binary(op: BinaryOp, ty: Ty, lhs: Value, rhs: Value) -> Option<Value> {
    let bits = ty.bits();

    // Undefined operands make the result undefined.
    if matches!(lhs, Value::Undef { .. }) || matches!(rhs, Value::Undef { .. }) {
        return Some(Value::Undef { ty });
    }

    if let (Some(a), Some(b)) = (lhs.as_const(), rhs.as_const()) {
        let folded = match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::And => a & b,
            BinaryOp::Or => a | b,
            BinaryOp::Xor => a ^ b,
            BinaryOp::Shl => {
                if b >= u64::from(bits) {
                    0
                } else {
                    a << b
                }
            }
            BinaryOp::Lshr => {
                if b >= u64::from(bits) {
                    0
                } else {
                    mask(a, bits) >> b
                }
            }
            BinaryOp::Ashr => {
                let shift = b.min(u64::from(bits) - 1);
                ((sign_extend(a, bits)) >> shift) as u64
            }
        };
        return Some(Value::const_int(ty, folded));
    }

    // Algebraic identities with one constant operand.
    let identity = |value: Value, constant: u64, commutes: bool| -> Option<Value> {
        match op {
            BinaryOp::Add | BinaryOp::Or | BinaryOp::Xor if constant == 0 => Some(value),
            BinaryOp::Sub if constant == 0 && !commutes => Some(value),
            BinaryOp::Mul if constant == 1 => Some(value),
            BinaryOp::Mul if constant == 0 => Some(Value::const_int(ty, 0)),
            BinaryOp::And if constant == mask(u64::MAX, bits) => Some(value),
            BinaryOp::And if constant == 0 => Some(Value::const_int(ty, 0)),
            BinaryOp::Shl | BinaryOp::Lshr | BinaryOp::Ashr
                if constant == 0 && !commutes =>
            {
                Some(value)
            }
            _ => None,
        }
    };
    if let Some(constant) = rhs.as_const() {
        return identity(lhs, constant, false);
    }
    if let Some(constant) = lhs.as_const() {
        // Only the commutative identities apply with the constant on the
        // left.
        if matches!(
            op,
            BinaryOp::Add | BinaryOp::Or | BinaryOp::Xor | BinaryOp::Mul | BinaryOp::And
        ) {
            return identity(rhs, constant, true);
        }
    }
    None
}

/// Cancels exact push/pop pairs on pointer arithmetic:
/// `(x - c) + c` and `(x + c) - c` reduce to `x`.
fn cancel(function: &crate::il::Function, op: BinaryOp, lhs: Value, rhs: Value) -> Option<Value> {
    let outer = rhs.as_const()?;
    let Value::Inst(id) = lhs else {
        return None;
    };
    let Inst::Binary {
        op: inner_op,
        lhs: inner_lhs,
        rhs: inner_rhs,
        ..
    } = &function.insts[id]
    else {
        return None;
    };
    let inner = inner_rhs.as_const()?;
    let cancels = matches!(
        (op, inner_op),
        (BinaryOp::Add, BinaryOp::Sub) | (BinaryOp::Sub, BinaryOp::Add)
    );
    (cancels && outer == inner).then_some(*inner_lhs)
}

fn compare(pred: Predicate, a: u64, b: u64, bits: u32) -> bool {
    let (sa, sb) = (sign_extend(a, bits), sign_extend(b, bits));
    match pred {
        Predicate::Eq => a == b,
        Predicate::Ne => a != b,
        Predicate::Ult => a < b,
        Predicate::Ule => a <= b,
        Predicate::Ugt => a > b,
        Predicate::Uge => a >= b,
        Predicate::Slt => sa < sb,
        Predicate::Sle => sa <= sb,
        Predicate::Sgt => sa > sb,
        Predicate::Sge => sa >= sb,
    }
}

fn ty_bits_of(value: Value) -> Option<u32> {
    match value {
        Value::Const { ty, .. } | Value::Undef { ty } => Some(ty.bits()),
        _ => None,
    }
}

fn mask(value: u64, bits: u32) -> u64 {
    if bits >= 64 {
        value
    } else {
        value & ((1 << bits) - 1)
    }
}

fn sign_extend(value: u64, bits: u32) -> i64 {
    if bits >= 64 {
        value as i64
    } else {
        let shift = 64 - bits;
        ((value << shift) as i64) >> shift
    }
}

/// Replaces loads of the `__undef` sentinel with undefined values.
///
/// The stub semantics write `__undef` into popped stack slots; once those
/// loads become undef the dead stores behind them fall away.
pub fn replace_undef_loads(module: &mut Module, id: FuncId) -> bool {
    let undef = module.global_by_name("__undef");
    let Some(undef) = undef else {
        return false;
    };

    let mut replace: HashMap<InstId, Value> = HashMap::new();
    {
        let function = module.function(id);
        for block in &function.blocks {
            for inst_id in &block.insts {
                if let Inst::Load { ty, ptr } = &function.insts[*inst_id] {
                    if *ptr == Value::Global(undef) {
                        replace.insert(*inst_id, Value::Undef { ty: *ty });
                    }
                }
            }
        }
    }
    if replace.is_empty() {
        return false;
    }
    let function = module.function_mut(id);
    for inst in &mut function.insts {
        inst.map_operands(&|value| match value {
            Value::Inst(id) => replace.get(&id).copied().unwrap_or(value),
            _ => value,
        });
    }
    true
}

/// Removes instructions whose results are unused and whose execution has no
/// observable effect.
pub fn eliminate_dead_code(module: &mut Module, id: FuncId) -> bool {
    let mut used: HashSet<InstId> = HashSet::new();
    let mut required: HashSet<InstId> = HashSet::new();

    {
        let function = module.function(id);
        for block in &function.blocks {
            for inst_id in &block.insts {
                let inst = &function.insts[*inst_id];
                let keep = match inst {
                    Inst::Store { .. }
                    | Inst::Br { .. }
                    | Inst::CondBr { .. }
                    | Inst::Ret { .. } => true,
                    Inst::Call { callee, .. } => !module.function(*callee).attrs.pure_fn,
                    _ => false,
                };
                if keep {
                    required.insert(*inst_id);
                }
                for operand in inst.operands() {
                    if let Value::Inst(used_id) = operand {
                        used.insert(used_id);
                    }
                }
            }
        }
    }

    // Iterate to a fixpoint: removing one dead instruction can orphan its
    // operands.
    let mut changed = false;
    loop {
        let mut removed = false;
        let function = module.function_mut(id);
        for block in &mut function.blocks {
            block.insts.retain(|inst_id| {
                let live = required.contains(inst_id) || used.contains(inst_id);
                if !live {
                    removed = true;
                }
                live
            });
        }

        if !removed {
            break;
        }
        changed = true;

        // Recompute use counts over the survivors.
        used.clear();
        let function = module.function(id);
        for block in &function.blocks {
            for inst_id in &block.insts {
                for operand in function.insts[*inst_id].operands() {
                    if let Value::Inst(used_id) = operand {
                        used.insert(used_id);
                    }
                }
            }
        }
    }
    changed
}
