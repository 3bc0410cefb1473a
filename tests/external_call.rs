//! End-to-end coverage of the external-call synthesis: a VM exit whose
//! program counter resolves to a constant destination models a native call.
//!
//! The synthesis path is an explicit opt-in
//! (`Config::synthesize_external_calls`); this is the integration run that
//! opts in.

mod common;

use common::Program;
use devirt::{
    explorer::{Config, Explorer},
    il::{opt, verifier, Inst, Value},
    lifter::Lifter,
    tracer::Tracer,
};

const CALL_TARGET: u64 = 0xcafe_0000;

#[test]
fn constant_exit_targets_synthesize_an_external_call() -> anyhow::Result<()> {
    let mut program = Program::new();
    let entry = program.block();
    program.spill_context(entry);
    program.emit_exit(entry, CALL_TARGET);
    let fixture = common::build(&program);

    let mut lifter = Lifter::from_file(common::intrinsics_path())?;
    let tracer = Tracer::new(fixture.image.clone());
    let config = Config {
        synthesize_external_calls: true,
        ..Config::default()
    };

    let routine = Explorer::with_config(tracer, config).explore(fixture.entry, &mut lifter)?;
    assert_eq!(routine.len(), 1);

    // The exit's program counter is the pushed constant, so a matching
    // external stub is declared: pure, body-less, named after the target.
    let external = lifter
        .module()
        .function_by_name("External.0xcafe0000")
        .expect("the external stub is declared");
    assert!(lifter.module().function(external).is_declaration());
    assert!(lifter.module().function(external).attrs.pure_fn);

    // The final function carries exactly one call to the stub, passing the
    // first argument register and committing the result to the return
    // register.
    let function = lifter.build_final(&routine)?;
    opt::optimize_virtual_function(lifter.module_mut(), function)?;
    verifier::verify(lifter.module(), lifter.module().function(function))?;

    let module = lifter.module();
    let final_fn = module.function(function);
    let calls: Vec<_> = final_fn
        .blocks
        .iter()
        .flat_map(|block| &block.insts)
        .filter_map(|id| match &final_fn.insts[*id] {
            Inst::Call { callee, args } if *callee == external => Some((*id, args.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(calls.len(), 1);
    let (call_id, args) = &calls[0];
    assert_eq!(args.len(), 1);

    let rax = final_fn.param_index("rax").expect("the wrapper names rax");
    let stores_result = final_fn
        .blocks
        .iter()
        .flat_map(|block| &block.insts)
        .any(|id| {
            matches!(
                &final_fn.insts[*id],
                Inst::Store { value, ptr, .. }
                    if *value == Value::Inst(*call_id) && *ptr == Value::Arg(rax)
            )
        });
    assert!(stores_result, "the call result lands in the return register");
    Ok(())
}

#[test]
fn the_opt_out_suppresses_the_synthesis() -> anyhow::Result<()> {
    let mut program = Program::new();
    let entry = program.block();
    program.spill_context(entry);
    program.emit_exit(entry, CALL_TARGET);
    let fixture = common::build(&program);

    let mut lifter = Lifter::from_file(common::intrinsics_path())?;
    let tracer = Tracer::new(fixture.image.clone());
    let config = Config {
        synthesize_external_calls: false,
        ..Config::default()
    };

    Explorer::with_config(tracer, config).explore(fixture.entry, &mut lifter)?;
    assert!(lifter.module().function_by_name("External.0xcafe0000").is_none());
    Ok(())
}
