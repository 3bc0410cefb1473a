//! This module contains call inlining for the always-inline functions of
//! the intrinsics module.
//!
//! The lifter emits a block function as a flat sequence of calls into the
//! intrinsics module, and the slice/final wrappers as a call to the
//! assembled CFG stub; nothing downstream can reason across those calls, so
//! the first thing every pipeline does is splice the callee bodies in.
//! Straight-line callees splice directly into the calling block; callees
//! with control flow split the calling block and join their return sites
//! with a phi.

use std::collections::HashMap;

use crate::il::{BlockId, FuncId, Inst, InstId, Module, Value};

/// Runs one inlining round over the function with id `id`, returning
/// whether any call was spliced.
///
/// Calls that a splice brings in are picked up as the scan continues, so
/// one round drains nested always-inline chains as well.
pub fn run(module: &mut Module, id: FuncId) -> bool {
    let mut changed = false;

    let mut block_index = 0;
    while block_index < module.function(id).blocks.len() {
        loop {
            // Find the next inlinable call in this block.
            let found = {
                let function = module.function(id);
                function.blocks[block_index]
                    .insts
                    .iter()
                    .enumerate()
                    .find_map(|(position, inst_id)| match &function.insts[*inst_id] {
                        Inst::Call { callee, args } if inlinable(module, *callee) => {
                            Some((position, *inst_id, *callee, args.clone()))
                        }
                        _ => None,
                    })
            };
            let Some((position, call_id, callee, args)) = found else {
                break;
            };

            if module.function(callee).blocks.len() == 1 {
                splice_linear(module, id, block_index, position, call_id, callee, &args);
            } else {
                splice_cfg(module, id, block_index, position, call_id, callee, &args);
            }
            changed = true;
        }
        block_index += 1;
    }
    changed
}

/// Checks whether the function with id `callee` can be spliced: marked
/// always-inline and defined.
fn inlinable(module: &Module, callee: FuncId) -> bool {
    let function = module.function(callee);
    function.attrs.inline && !function.is_declaration()
}

/// Splices a straight-line callee over the call at `position` of block
/// `block_index`.
fn splice_linear(
    module: &mut Module,
    id: FuncId,
    block_index: usize,
    position: usize,
    call_id: InstId,
    callee: FuncId,
    args: &[Value],
) {
    let callee_fn = module.function(callee).clone();
    let function = module.function_mut(id);

    let mut value_map: HashMap<InstId, Value> = HashMap::new();
    let mut spliced: Vec<InstId> = Vec::new();
    let mut ret_value: Option<Value> = None;

    for callee_id in &callee_fn.blocks[0].insts {
        let mut inst = callee_fn.insts[*callee_id].clone();
        if let Inst::Ret { value } = &inst {
            ret_value = value.map(|value| remap(value, args, &value_map));
            continue;
        }
        inst.map_operands(&|value| remap(value, args, &value_map));
        let new_id = function.insts.len();
        function.insts.push(inst);
        value_map.insert(*callee_id, Value::Inst(new_id));
        spliced.push(new_id);
    }

    function.blocks[block_index].insts.splice(position..=position, spliced);

    if let Some(ret_value) = ret_value {
        replace_result(function, call_id, ret_value);
    }
}

/// Splices a callee with control flow: the calling block is split at the
/// call, the callee's blocks come in remapped, and its return sites branch
/// to the split-off tail.
fn splice_cfg(
    module: &mut Module,
    id: FuncId,
    block_index: usize,
    position: usize,
    call_id: InstId,
    callee: FuncId,
    args: &[Value],
) {
    let callee_fn = module.function(callee).clone();
    let function = module.function_mut(id);

    // Split the calling block: everything past the call moves into the
    // merge block.
    let mut tail = function.blocks[block_index].insts.split_off(position);
    tail.remove(0);
    let merge = function.add_block(format!("{}.tail", function.blocks[block_index].label));
    function.blocks[merge].insts = tail;

    // Phis naming the split block as a predecessor now flow in from the
    // merge block, which inherited the terminator.
    for inst in &mut function.insts {
        if let Inst::Phi { incoming, .. } = inst {
            for (pred, _) in incoming {
                if *pred == block_index {
                    *pred = merge;
                }
            }
        }
    }

    // Lay out the callee blocks: its entry continues the calling block, the
    // rest become fresh blocks.
    let mut block_map: HashMap<BlockId, BlockId> = HashMap::new();
    block_map.insert(0, block_index);
    for (callee_block, block) in callee_fn.blocks.iter().enumerate().skip(1) {
        block_map.insert(callee_block, function.add_block(format!("inline.{}", block.label)));
    }

    // Copy the instructions, rewriting operands, branch targets and return
    // sites.
    let mut value_map: HashMap<InstId, Value> = HashMap::new();
    let mut returns: Vec<(BlockId, Option<Value>)> = Vec::new();
    for (callee_block, block) in callee_fn.blocks.iter().enumerate() {
        let target_block = block_map[&callee_block];
        for callee_id in &block.insts {
            let mut inst = callee_fn.insts[*callee_id].clone();
            if let Inst::Ret { value } = &inst {
                let value = value.map(|value| remap(value, args, &value_map));
                returns.push((target_block, value));
                function.append(target_block, Inst::Br { target: merge });
                continue;
            }
            inst.map_operands(&|value| remap(value, args, &value_map));
            match &mut inst {
                Inst::Br { target } => *target = block_map[target],
                Inst::CondBr { then, otherwise, .. } => {
                    *then = block_map[then];
                    *otherwise = block_map[otherwise];
                }
                Inst::Phi { incoming, .. } => {
                    for (pred, _) in incoming {
                        *pred = block_map[pred];
                    }
                }
                _ => {}
            }
            let new_id = function.insts.len();
            function.insts.push(inst);
            value_map.insert(*callee_id, Value::Inst(new_id));
            function.blocks[target_block].insts.push(new_id);
        }
    }

    // Join the returned values for the callers of the call's result.
    let result = match returns.as_slice() {
        [(_, Some(value))] => Some(*value),
        returns if returns.iter().any(|(_, value)| value.is_some()) => {
            let ty = callee_fn.ret.expect("return sites carry values");
            let incoming = returns
                .iter()
                .map(|(block, value)| {
                    (*block, value.unwrap_or(Value::Undef { ty }))
                })
                .collect();
            let phi_id = function.insts.len();
            function.insts.push(Inst::Phi { ty, incoming });
            function.blocks[merge].insts.insert(0, phi_id);
            Some(Value::Inst(phi_id))
        }
        _ => None,
    };
    if let Some(result) = result {
        replace_result(function, call_id, result);
    }
}

/// Rewrites a callee-local value against the call site: arguments become
/// the passed values and instruction results the spliced copies.
fn remap(value: Value, args: &[Value], map: &HashMap<InstId, Value>) -> Value {
    match value {
        Value::Arg(index) => args[index],
        Value::Inst(callee_id) => map[&callee_id],
        other => other,
    }
}

/// Rewrites every use of the call's result to `result`.
fn replace_result(function: &mut crate::il::Function, call_id: InstId, result: Value) {
    for inst in &mut function.insts {
        inst.map_operands(&|value| {
            if value == Value::Inst(call_id) {
                result
            } else {
                value
            }
        });
    }
}
