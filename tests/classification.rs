//! Tracer-level classification tests: each handler shape yields its
//! virtual instruction without running full exploration.

mod common;

use common::{Op, Program};
use devirt::{
    tracer::{StepKind, Tracer},
    vm::{Operand, VInsn},
};

/// Steps the tracer over the fixture until `count` instructions past the
/// vmenter have been classified.
fn classify(fixture: &common::Fixture, count: usize) -> anyhow::Result<Vec<VInsn>> {
    let mut tracer = Tracer::new(fixture.image.clone());
    tracer.seed(fixture.entry);

    let enter = tracer.step(StepKind::StopBeforeBranch)?;
    assert!(enter.is_enter());

    let mut vinsns = Vec::new();
    for _ in 0..count {
        vinsns.push(tracer.step(StepKind::StopBeforeBranch)?);
    }
    Ok(vinsns)
}

#[test]
fn memory_transfer_handlers_classify() -> anyhow::Result<()> {
    let mut program = Program::new();
    let entry = program.block();
    // Store 0x1234 to scratch memory, load it back, shift it.
    program.op(entry, Op::PushImm64(0x1234));
    program.op(entry, Op::PushImm64(0x9000));
    program.op(entry, Op::Str64);
    program.op(entry, Op::PushImm64(0x9000));
    program.op(entry, Op::Ldr64);
    program.op(entry, Op::PushImm16(3));
    program.op(entry, Op::PushImm64(0x80));
    program.op(entry, Op::Shr64);
    let fixture = common::build(&program);

    let vinsns = classify(&fixture, 8)?;
    assert_eq!(vinsns[0], VInsn::push(Operand::Immediate(0x1234), 64));
    assert_eq!(vinsns[1], VInsn::push(Operand::Immediate(0x9000), 64));
    assert_eq!(vinsns[2], VInsn::Str(64));
    assert_eq!(vinsns[3], VInsn::push(Operand::Immediate(0x9000), 64));
    assert_eq!(vinsns[4], VInsn::Ldr(64));
    assert_eq!(vinsns[5], VInsn::push(Operand::Immediate(3), 16));
    assert_eq!(vinsns[6], VInsn::push(Operand::Immediate(0x80), 64));
    assert_eq!(vinsns[7], VInsn::Shr(64));
    Ok(())
}

#[test]
fn virtual_register_transfers_classify_with_their_slots() -> anyhow::Result<()> {
    let mut program = Program::new();
    let entry = program.block();
    program.op(entry, Op::PushImm64(0xfeed));
    program.op(entry, Op::PopVreg(21));
    program.op(entry, Op::PushVreg(21));
    let fixture = common::build(&program);

    let vinsns = classify(&fixture, 3)?;
    assert_eq!(
        vinsns[1],
        VInsn::pop(Operand::VirtualRegister { index: 21, offset: 0 }, 64)
    );
    assert_eq!(
        vinsns[2],
        VInsn::push(Operand::VirtualRegister { index: 21, offset: 0 }, 64)
    );
    Ok(())
}

#[test]
fn arithmetic_handlers_classify_with_their_sizes() -> anyhow::Result<()> {
    let mut program = Program::new();
    let entry = program.block();
    program.op(entry, Op::PushImm64(5));
    program.op(entry, Op::PushImm64(7));
    program.op(entry, Op::Add64);
    program.op(entry, Op::PushImm64(1));
    program.op(entry, Op::Nand64);
    let fixture = common::build(&program);

    let vinsns = classify(&fixture, 5)?;
    assert_eq!(vinsns[2], VInsn::Add(64));
    assert_eq!(vinsns[4], VInsn::Nand(64));
    Ok(())
}

#[test]
fn unconditional_branches_classify_as_jmp() -> anyhow::Result<()> {
    let mut program = Program::new();
    let entry = program.block();
    let target = program.block();
    program.op(entry, Op::PushImm64(common::block_base(1)));
    program.op(entry, Op::Jmp(target));
    program.op(target, Op::PushImm64(1));
    let fixture = common::build(&program);

    let mut tracer = Tracer::new(fixture.image.clone());
    tracer.seed(fixture.entry);
    tracer.step(StepKind::StopBeforeBranch)?; // vmenter
    tracer.step(StepKind::StopBeforeBranch)?; // push of the target address

    let branch = tracer.step(StepKind::StopBeforeBranch)?;
    assert_eq!(branch, VInsn::Jmp);

    // Executing the branch rolls the virtual instruction pointer to the
    // target block.
    let again = tracer.step(StepKind::ExecuteBranch)?;
    assert_eq!(again, VInsn::Jmp);
    assert_eq!(tracer.vip(), fixture.block_vip[1]);
    Ok(())
}

#[test]
fn exits_collect_the_full_context() -> anyhow::Result<()> {
    let mut program = Program::new();
    let entry = program.block();
    program.spill_context(entry);
    program.emit_exit(entry, 0x4444_0000);
    let fixture = common::build(&program);

    let vinsns = classify(&fixture, 19 + 17 + 1)?;
    let exit = vinsns.last().expect("the exit closes the stream");
    let VInsn::Exit(context) = exit else {
        panic!("the last handler is the exit");
    };
    // Fifteen registers plus the flags word.
    assert_eq!(context.len(), 16);
    assert!(context.iter().all(|insn| matches!(
        insn,
        VInsn::Pop { op: Operand::PhysicalRegister(_), .. }
    )));
    Ok(())
}
