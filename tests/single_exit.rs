//! End-to-end devirtualization of a single-block routine that restores the
//! context and returns to a constant program counter.

mod common;

use common::Program;
use devirt::{
    explorer::{Config, Explorer},
    il::{opt, verifier, Inst, Value},
    lifter::Lifter,
    tracer::Tracer,
    vm::Flow,
};

const RETURN_PC: u64 = 0xcafe_0000;

fn fixture() -> common::Fixture {
    let mut program = Program::new();
    let entry = program.block();
    program.spill_context(entry);
    program.emit_exit(entry, RETURN_PC);
    common::build(&program)
}

#[test]
fn single_block_routine_devirtualizes_to_its_return_constant() -> anyhow::Result<()> {
    let fixture = fixture();
    let mut lifter = Lifter::from_file(common::intrinsics_path())?;
    let tracer = Tracer::new(fixture.image.clone());
    let config = Config {
        synthesize_external_calls: false,
        ..Config::default()
    };

    let routine = Explorer::with_config(tracer, config).explore(fixture.entry, &mut lifter)?;

    // One block, closed by the exit and its Ret pseudo-instruction.
    assert_eq!(routine.len(), 1);
    let entry = routine.block(routine.entry());
    assert_eq!(entry.vip(), fixture.entry);
    assert!(entry.vins().iter().any(devirt::vm::VInsn::is_exit));
    assert!(matches!(entry.vins().last(), Some(devirt::vm::VInsn::Ret)));
    assert!(entry.next.is_empty());

    // The context recognized at vmenter covers the registers plus the two
    // integers and the relocation.
    let enter = entry.vins().first().expect("the block records the vmenter");
    let devirt::vm::VInsn::Enter(context) = enter else {
        panic!("the first instruction is the vmenter context");
    };
    assert_eq!(context.len(), 19);

    // The final function folds down to the constant program counter.
    let function = lifter.build_final(&routine)?;
    opt::optimize_virtual_function(lifter.module_mut(), function)?;
    verifier::verify(lifter.module(), lifter.module().function(function))?;

    let module = lifter.module();
    let final_fn = module.function(function);
    let returns_constant = final_fn
        .blocks
        .iter()
        .flat_map(|block| &block.insts)
        .any(|id| {
            matches!(
                final_fn.insts[*id],
                Inst::Ret {
                    value: Some(Value::Const { value: RETURN_PC, .. })
                }
            )
        });
    assert!(returns_constant, "the routine returns its constant program counter");
    Ok(())
}

#[test]
fn flow_is_derived_from_the_final_instruction_of_every_block() -> anyhow::Result<()> {
    let fixture = fixture();
    let mut lifter = Lifter::from_file(common::intrinsics_path())?;
    let tracer = Tracer::new(fixture.image.clone());
    let config = Config {
        synthesize_external_calls: false,
        ..Config::default()
    };

    let routine = Explorer::with_config(tracer, config).explore(fixture.entry, &mut lifter)?;

    for (_, block) in routine.iter() {
        let last = block.vins().last();
        assert_eq!(
            block.flow() == Flow::Exit,
            last.is_some_and(devirt::vm::VInsn::is_exit)
        );
        assert_eq!(
            block.flow() == Flow::Conditional,
            last.is_some_and(devirt::vm::VInsn::is_jcc)
        );
        assert_eq!(
            block.flow() == Flow::Unconditional,
            last.is_some_and(devirt::vm::VInsn::is_jmp)
        );
        assert!(block.next.len() <= 2);
    }
    Ok(())
}

#[test]
fn fork_commutes_with_step() -> anyhow::Result<()> {
    let fixture = fixture();
    let mut tracer = Tracer::new(fixture.image.clone());
    tracer.seed(fixture.entry);
    tracer.step(devirt::tracer::StepKind::StopBeforeBranch)?;

    // Stepping a fork and forking after a step must agree on the produced
    // instruction and the machine state.
    let mut forked = tracer.fork();
    let from_fork = forked.step(devirt::tracer::StepKind::StopBeforeBranch)?;
    let from_original = tracer.step(devirt::tracer::StepKind::StopBeforeBranch)?;

    assert_eq!(from_fork, from_original);
    assert_eq!(forked.vip(), tracer.vip());
    assert_eq!(forked.vsp(), tracer.vsp());
    assert_eq!(forked.emulator().rip(), tracer.emulator().rip());
    Ok(())
}
