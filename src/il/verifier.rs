//! This module contains the structural and type verifier for IR functions.
//!
//! Every optimization pipeline ends in a verification run; a function the
//! verifier rejects is a bug in the lifter or in a pass, never an input
//! error, but surfacing it as a typed error keeps the session diagnosable.

use std::collections::HashSet;

use crate::{
    error::lifting::{Error, Result},
    il::{CastKind, Function, Inst, Module, Ty, Value},
};

/// Verifies `function`, returning the first violation found.
pub fn verify(module: &Module, function: &Function) -> Result<()> {
    if function.is_declaration() {
        return Ok(());
    }
    let fail = |message: String| {
        Err(Error::Verifier {
            function: function.name.clone(),
            message,
        })
    };

    let mut defined: HashSet<usize> = HashSet::new();
    for block in &function.blocks {
        if block.insts.is_empty() {
            return fail(format!("block {:?} is empty", block.label));
        }
        for (position, id) in block.insts.iter().enumerate() {
            let inst = &function.insts[*id];
            let last = position + 1 == block.insts.len();

            if inst.is_terminator() != last {
                return fail(format!(
                    "terminator placement is wrong in block {:?}",
                    block.label
                ));
            }

            // Operands must be defined ahead of their uses. Phis are exempt:
            // their incoming values flow in from predecessor blocks.
            if !matches!(inst, Inst::Phi { .. }) {
                for operand in inst.operands() {
                    if let Value::Inst(used) = operand {
                        if !defined.contains(&used) {
                            return fail(format!(
                                "use of an undefined value in block {:?}",
                                block.label
                            ));
                        }
                    }
                }
            }
            check_types(module, function, inst, &fail_message(function))?;
            defined.insert(*id);
        }
    }

    // Branch targets must exist.
    for block in &function.blocks {
        for id in &block.insts {
            match &function.insts[*id] {
                Inst::Br { target } => {
                    if *target >= function.blocks.len() {
                        return fail("branch to a non-existent block".to_owned());
                    }
                }
                Inst::CondBr { then, otherwise, .. } => {
                    if *then >= function.blocks.len() || *otherwise >= function.blocks.len() {
                        return fail("branch to a non-existent block".to_owned());
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn fail_message(function: &Function) -> impl Fn(String) -> Error + '_ {
    move |message| Error::Verifier {
        function: function.name.clone(),
        message,
    }
}

/// Checks the operand types of one instruction.
fn check_types(
    module: &Module,
    function: &Function,
    inst: &Inst,
    fail: &impl Fn(String) -> Error,
) -> Result<()> {
    let ty_of = |value: Value| function.value_ty(module, value);
    let expect = |value: Value, expected: Ty, what: &str| -> Result<()> {
        match ty_of(value) {
            Some(ty) if ty == expected => Ok(()),
            other => Err(fail(format!(
                "{what} has type {other:?} where {expected:?} was expected"
            ))),
        }
    };

    match inst {
        Inst::Alloca { .. } | Inst::Br { .. } => Ok(()),
        Inst::Load { ptr, .. } => expect(*ptr, Ty::Ptr, "load pointer"),
        Inst::Store { ty, value, ptr } => {
            expect(*value, *ty, "stored value")?;
            expect(*ptr, Ty::Ptr, "store pointer")
        }
        Inst::Gep { base, offset } => {
            expect(*base, Ty::Ptr, "gep base")?;
            expect(*offset, Ty::I64, "gep offset")
        }
        Inst::Binary { ty, lhs, rhs, .. } => {
            if !ty.is_int() {
                return Err(fail("binary ops require integer types".to_owned()));
            }
            expect(*lhs, *ty, "binary lhs")?;
            expect(*rhs, *ty, "binary rhs")
        }
        Inst::Icmp { ty, lhs, rhs, .. } => {
            if !ty.is_int() {
                return Err(fail("icmp requires integer types".to_owned()));
            }
            expect(*lhs, *ty, "icmp lhs")?;
            expect(*rhs, *ty, "icmp rhs")
        }
        Inst::Select {
            cond,
            ty,
            then,
            otherwise,
        } => {
            expect(*cond, Ty::I1, "select condition")?;
            expect(*then, *ty, "select arm")?;
            expect(*otherwise, *ty, "select arm")
        }
        Inst::Cast { kind, to, value } => {
            let from = ty_of(*value)
                .ok_or_else(|| fail("cast of a value-less operand".to_owned()))?;
            if !from.is_int() || !to.is_int() {
                return Err(fail("casts require integer types".to_owned()));
            }
            let ok = match kind {
                CastKind::Zext | CastKind::Sext => to.bits() > from.bits(),
                CastKind::Trunc => to.bits() < from.bits(),
            };
            if ok {
                Ok(())
            } else {
                Err(fail(format!("cast from {from:?} to {to:?} changes no width")))
            }
        }
        Inst::Phi { ty, incoming } => {
            for (block, value) in incoming {
                if *block >= function.blocks.len() {
                    return Err(fail("phi arm references a non-existent block".to_owned()));
                }
                expect(*value, *ty, "phi arm")?;
            }
            Ok(())
        }
        Inst::Call { callee, args } => {
            let callee = module.function(*callee);
            if callee.params.len() != args.len() {
                return Err(fail(format!(
                    "call to {:?} passes {} arguments for {} parameters",
                    callee.name,
                    args.len(),
                    callee.params.len()
                )));
            }
            for (param, arg) in callee.params.iter().zip(args) {
                expect(*arg, param.ty, "call argument")?;
            }
            Ok(())
        }
        Inst::CondBr { cond, .. } => expect(*cond, Ty::I1, "branch condition"),
        Inst::Ret { value } => match (function.ret, value) {
            (None, None) => Ok(()),
            (Some(ty), Some(value)) => expect(*value, ty, "returned value"),
            _ => Err(fail("return does not match the function type".to_owned())),
        },
    }
}
