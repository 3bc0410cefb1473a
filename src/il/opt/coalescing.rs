//! This module contains the store-coalescing pass.
//!
//! The stub semantics write wide values as sequences of narrow stores when
//! the VM splits them (a 16-bit push of two 8-bit halves, a 32-bit value
//! assembled from 16-bit words). Two adjacent stores of one size to
//! contiguous offsets off one base merge into a single store of double the
//! width, which in turn unlocks forwarding in the next simplification
//! round.

use log::debug;

use crate::il::{
    BinaryOp,
    CastKind,
    FuncId,
    Inst,
    InstId,
    Module,
    Ty,
    Value,
};

/// A store decomposed against the `RAM` base: its block position, pointer,
/// constant offset, value and type.
struct Access {
    position: usize,
    inst: InstId,
    ptr: Value,
    base: Value,
    offset: i64,
    value: Value,
    ty: Ty,
}

/// Runs the coalescing pass over the function with id `id`, returning
/// whether any pair of stores was merged.
pub fn run(module: &mut Module, id: FuncId) -> bool {
    let mut merges: Vec<(usize, Access, Access)> = Vec::new();

    {
        let function = module.function(id);
        for (block_index, block) in function.blocks.iter().enumerate() {
            // Memory definitions of the block in order: stores, with impure
            // calls breaking adjacency.
            let mut defs: Vec<Option<Access>> = Vec::new();
            for (position, inst_id) in block.insts.iter().enumerate() {
                match &function.insts[*inst_id] {
                    Inst::Store { ty, value, ptr } => {
                        defs.push(supported(function, position, *inst_id, *ptr, *value, *ty));
                    }
                    Inst::Call { callee, .. } => {
                        if !module.function(*callee).attrs.pure_fn {
                            defs.push(None);
                        }
                    }
                    _ => {}
                }
            }

            let mut index = 0;
            while index + 1 < defs.len() {
                let (Some(first), Some(second)) = (&defs[index], &defs[index + 1]) else {
                    index += 1;
                    continue;
                };
                let size = first.ty.bytes();
                let mergeable = first.ty == second.ty
                    && size < 8
                    && first.base == second.base
                    && second.offset + size as i64 == first.offset;
                if mergeable {
                    debug!(
                        "Found two sequential stores {} {}",
                        first.offset, second.offset
                    );
                    merges.push((
                        block_index,
                        defs[index].take().expect("checked above"),
                        defs[index + 1].take().expect("checked above"),
                    ));
                    // The second store of the pair must not seed the next
                    // one.
                    index += 2;
                } else {
                    index += 1;
                }
            }
        }
    }

    if merges.is_empty() {
        return false;
    }

    // Apply per block from the back so earlier positions stay valid.
    merges.sort_by_key(|(block, _, second)| (*block, std::cmp::Reverse(second.position)));
    for (block_index, first, second) in merges {
        let function = module.function_mut(id);
        let wide = Ty::from_bits(first.ty.bits() * 2).expect("widths below 64 double cleanly");

        let mut fresh = |inst: Inst| -> Value {
            let id = function.insts.len();
            function.insts.push(inst);
            Value::Inst(id)
        };
        let hi = fresh(Inst::Cast {
            kind:  CastKind::Zext,
            to:    wide,
            value: first.value,
        });
        let lo = fresh(Inst::Cast {
            kind:  CastKind::Zext,
            to:    wide,
            value: second.value,
        });
        let shifted = fresh(Inst::Binary {
            op:  BinaryOp::Shl,
            ty:  wide,
            lhs: hi,
            rhs: Value::const_int(wide, u64::from(first.ty.bits())),
        });
        let combined = fresh(Inst::Binary {
            op:  BinaryOp::Or,
            ty:  wide,
            lhs: shifted,
            rhs: lo,
        });
        let store = fresh(Inst::Store {
            ty:    wide,
            value: combined,
            ptr:   second.ptr,
        });
        let Value::Inst(store_id) = store else {
            unreachable!("fresh only mints instruction values")
        };

        let insts = &mut function.blocks[block_index].insts;
        let new_ids: Vec<InstId> = match (hi, lo, shifted, combined) {
            (Value::Inst(a), Value::Inst(b), Value::Inst(c), Value::Inst(d)) => {
                vec![a, b, c, d, store_id]
            }
            _ => unreachable!("fresh only mints instruction values"),
        };
        insts.splice(second.position + 1..second.position + 1, new_ids);
        // Erase both originals now that the replacement is in place.
        insts.retain(|inst_id| *inst_id != first.inst && *inst_id != second.inst);
    }
    true
}

/// Decomposes a store pointer into the supported shape: a `RAM` gep whose
/// index is one non-constant value plus a constant.
fn supported(
    function: &crate::il::Function,
    position: usize,
    inst: InstId,
    ptr: Value,
    value: Value,
    ty: Ty,
) -> Option<Access> {
    if ty == Ty::I1 || ty == Ty::Ptr {
        return None;
    }
    let Value::Inst(gep_id) = ptr else {
        return None;
    };
    let Inst::Gep { base, offset } = &function.insts[gep_id] else {
        return None;
    };

    // (constant + %base + @RAM)
    let (index, constant) = split_offset(function, *offset)?;
    index?;
    Some(Access {
        position,
        inst,
        ptr,
        base: combine_base(*base, index),
        offset: constant,
        value,
        ty,
    })
}

/// Splits an index expression into its non-constant part and its constant
/// displacement.
fn split_offset(
    function: &crate::il::Function,
    offset: Value,
) -> Option<(Option<Value>, i64)> {
    let mut constant: i64 = 0;
    let mut index = offset;
    loop {
        match index {
            Value::Const { value, .. } => return Some((None, constant.wrapping_add(value as i64))),
            Value::Inst(id) => match &function.insts[id] {
                Inst::Binary {
                    op: BinaryOp::Add,
                    lhs,
                    rhs,
                    ..
                } => {
                    if let Some(value) = rhs.as_const() {
                        constant = constant.wrapping_add(value as i64);
                        index = *lhs;
                    } else if let Some(value) = lhs.as_const() {
                        constant = constant.wrapping_add(value as i64);
                        index = *rhs;
                    } else {
                        return None;
                    }
                }
                Inst::Binary {
                    op: BinaryOp::Sub,
                    lhs,
                    rhs,
                    ..
                } => {
                    let value = rhs.as_const()?;
                    constant = constant.wrapping_sub(value as i64);
                    index = *lhs;
                }
                _ => return Some((Some(index), constant)),
            },
            other => return Some((Some(other), constant)),
        }
    }
}

/// Pairs the gep base with the non-constant index part for comparison.
fn combine_base(base: Value, index: Option<Value>) -> Value {
    // The non-constant part is what distinguishes two accesses off the same
    // segment; the segment base itself is shared.
    index.unwrap_or(base)
}

#[cfg(test)]
mod test {
    use crate::il::{
        opt::{coalescing, memory, simplify},
        parser::parse_module,
        Inst,
        Ty,
        Value,
    };

    const TWO_BYTE_STORES: &str = r"
global RAM : [0 x i8]

define f(vsp: ptr) {
entry:
  %sp = load i64, ptr %vsp
  %hi_off = sub i64 %sp, 1
  %hi = gep ptr @RAM, i64 %hi_off
  store i8 18, ptr %hi
  %lo_off = sub i64 %sp, 2
  %lo = gep ptr @RAM, i64 %lo_off
  store i8 52, ptr %lo
  ret void
}
";

    #[test]
    fn adjacent_byte_stores_merge_into_one_word_store() -> anyhow::Result<()> {
        let mut module = parse_module(TWO_BYTE_STORES)?;
        let id = module.function_by_name("f").unwrap();

        assert!(coalescing::run(&mut module, id));
        while simplify::run(&mut module, id) {}

        let function = module.function(id);
        let stores: Vec<_> = function.blocks[0]
            .insts
            .iter()
            .filter_map(|id| match &function.insts[*id] {
                Inst::Store { ty, value, .. } => Some((*ty, *value)),
                _ => None,
            })
            .collect();

        // One 16-bit store carrying (18 << 8) | 52.
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0].0, Ty::I16);
        assert_eq!(stores[0].1, Value::const_int(Ty::I16, (18 << 8) | 52));
        Ok(())
    }

    #[test]
    fn distant_stores_do_not_merge() -> anyhow::Result<()> {
        let mut module = parse_module(
            "global RAM : [0 x i8]\n\ndefine f(vsp: ptr) {\nentry:\n  \
             %sp = load i64, ptr %vsp\n  %a_off = sub i64 %sp, 1\n  \
             %a = gep ptr @RAM, i64 %a_off\n  store i8 1, ptr %a\n  \
             %b_off = sub i64 %sp, 8\n  %b = gep ptr @RAM, i64 %b_off\n  \
             store i8 2, ptr %b\n  ret void\n}\n",
        )?;
        let id = module.function_by_name("f").unwrap();
        assert!(!coalescing::run(&mut module, id));
        Ok(())
    }

    #[test]
    fn word_sized_stores_do_not_merge() -> anyhow::Result<()> {
        let mut module = parse_module(
            "global RAM : [0 x i8]\n\ndefine f(vsp: ptr) {\nentry:\n  \
             %sp = load i64, ptr %vsp\n  %a_off = sub i64 %sp, 8\n  \
             %a = gep ptr @RAM, i64 %a_off\n  store i64 1, ptr %a\n  \
             %b_off = sub i64 %sp, 16\n  %b = gep ptr @RAM, i64 %b_off\n  \
             store i64 2, ptr %b\n  ret void\n}\n",
        )?;
        let id = module.function_by_name("f").unwrap();
        assert!(!coalescing::run(&mut module, id));
        Ok(())
    }

    #[test]
    fn merged_halves_forward_as_one_word() -> anyhow::Result<()> {
        // After coalescing, a 16-bit reload of the pair forwards directly.
        let text = r"
global RAM : [0 x i8]

define f(vsp: ptr) -> i16 {
entry:
  %sp = load i64, ptr %vsp
  %hi_off = sub i64 %sp, 1
  %hi = gep ptr @RAM, i64 %hi_off
  store i8 18, ptr %hi
  %lo_off = sub i64 %sp, 2
  %lo = gep ptr @RAM, i64 %lo_off
  store i8 52, ptr %lo
  %out = load i16, ptr %lo
  ret i16 %out
}
";
        let mut module = parse_module(text)?;
        let id = module.function_by_name("f").unwrap();

        assert!(coalescing::run(&mut module, id));
        assert!(memory::run(&mut module, id));
        while simplify::run(&mut module, id) {}

        let function = module.function(id);
        let ret = function.blocks[0].insts.last().unwrap();
        assert_eq!(function.insts[*ret], Inst::Ret {
            value: Some(Value::const_int(Ty::I16, (18 << 8) | 52)),
        });
        Ok(())
    }
}
