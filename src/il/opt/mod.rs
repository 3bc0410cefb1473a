//! This module contains the optimization pipelines applied to lifted
//! functions.
//!
//! Two pipelines exist, mirroring the two lifetimes a lifted function has:
//! block functions and slices are optimized just enough for target
//! enumeration, while the final function additionally gets the undef
//! cleanup, dead-store elimination and store coalescing before emission.

pub mod alias;
pub mod coalescing;
pub mod inline;
pub mod memory;
pub mod simplify;

use crate::{
    constant::OPTIMIZER_MAXIMUM_IDLE_RUNS,
    error::lifting::Result,
    il::{verifier, FuncId, Module},
};

/// The switches guiding one optimization run.
#[derive(Clone, Copy, Debug, Default)]
pub struct Guide {
    /// Replace loads of the `__undef` sentinel with undefined values.
    pub remove_undef: bool,

    /// Run dead-store elimination and store coalescing.
    pub apply_dse: bool,
}

/// Optimizes a lifted block function or a slice function.
pub fn optimize_block_function(module: &mut Module, id: FuncId) -> Result<()> {
    optimize_function(module, id, Guide::default())
}

/// Optimizes the final devirtualized function.
pub fn optimize_virtual_function(module: &mut Module, id: FuncId) -> Result<()> {
    optimize_function(module, id, Guide {
        remove_undef: true,
        apply_dse:    true,
    })
}

/// Runs one full optimization pipeline over the function with id `id`.
pub fn optimize_function(module: &mut Module, id: FuncId, guide: Guide) -> Result<()> {
    while inline::run(module, id) {}

    exhaust(module, id);

    if guide.remove_undef {
        simplify::replace_undef_loads(module, id);
        exhaust(module, id);
    }

    if guide.apply_dse {
        while coalescing::run(module, id) {
            exhaust(module, id);
        }
        sweep_clones(module, id);
    }

    verifier::verify(module, module.function(id))
}

/// Erases cloned helper functions that are no longer reachable from `root`.
///
/// Block functions and CFG stubs accumulate as clones while the routine is
/// explored; once everything has been inlined into the final function they
/// are garbage.
fn sweep_clones(module: &mut Module, root: FuncId) {
    let mut live = std::collections::HashSet::new();
    let mut worklist = vec![root];
    while let Some(id) = worklist.pop() {
        if !live.insert(id) {
            continue;
        }
        let function = module.function(id);
        for block in &function.blocks {
            for inst_id in &block.insts {
                if let crate::il::Inst::Call { callee, .. } = &function.insts[*inst_id] {
                    worklist.push(*callee);
                }
            }
        }
    }

    let dead: Vec<FuncId> = module
        .functions()
        .filter(|(id, function)| {
            !live.contains(id) && !function.is_declaration() && function.name.contains('.')
        })
        .map(|(id, _)| id)
        .collect();
    for id in dead {
        module.erase_function(id);
    }
}

/// Drives the local optimizations until the instruction count stops
/// dropping for a few consecutive rounds.
fn exhaust(module: &mut Module, id: FuncId) {
    let mut count = module.function(id).inst_count();
    let mut idle = 0;
    loop {
        let changed_simplify = simplify::run(module, id);
        let changed_memory = memory::run(module, id);

        let now = module.function(id).inst_count();
        if now < count {
            count = now;
            idle = 0;
        } else {
            idle += 1;
        }
        if (!changed_simplify && !changed_memory) || idle > OPTIMIZER_MAXIMUM_IDLE_RUNS {
            break;
        }
    }
}

#[cfg(test)]
mod test {
    use crate::il::{opt, parser::parse_module, Inst, Value};

    const MODULE: &str = r"
global RAM : [0 x i8]
global __undef : i64

define PUSH_IMM_64(vsp: ptr, value: i64) attrs(inline) {
entry:
  %sp = load i64, ptr %vsp
  %new = sub i64 %sp, 8
  store i64 %new, ptr %vsp
  %slot = gep ptr @RAM, i64 %new
  store i64 %value, ptr %slot
  ret void
}

define POP_REG_64(vsp: ptr, reg: ptr) attrs(inline) {
entry:
  %sp = load i64, ptr %vsp
  %slot = gep ptr @RAM, i64 %sp
  %value = load i64, ptr %slot
  %undef = load i64, ptr @__undef
  store i64 %undef, ptr %slot
  %new = add i64 %sp, 8
  store i64 %new, ptr %vsp
  store i64 %value, ptr %reg
  ret void
}

define block(vsp: ptr, rax: ptr) -> i64 {
entry:
  call void @PUSH_IMM_64(ptr %vsp, i64 1311768465173141112)
  call void @POP_REG_64(ptr %vsp, ptr %rax)
  %sp = load i64, ptr %vsp
  ret i64 %sp
}
";

    #[test]
    fn push_pop_pairs_collapse_to_a_register_write() -> anyhow::Result<()> {
        let mut module = parse_module(MODULE)?;
        let id = module.function_by_name("block").unwrap();

        opt::optimize_virtual_function(&mut module, id)?;

        let function = module.function(id);
        // The pushed immediate lands in rax directly.
        let stores: Vec<_> = function.blocks[0]
            .insts
            .iter()
            .filter_map(|id| match &function.insts[*id] {
                Inst::Store { value, ptr, .. } => Some((*value, *ptr)),
                _ => None,
            })
            .collect();
        assert!(stores.contains(&(
            Value::const_int(crate::il::Ty::I64, 1_311_768_465_173_141_112),
            Value::Arg(1)
        )));
        // No calls survive inlining.
        let has_calls = function.blocks[0]
            .insts
            .iter()
            .any(|id| matches!(function.insts[*id], Inst::Call { .. }));
        assert!(!has_calls);
        Ok(())
    }
}
