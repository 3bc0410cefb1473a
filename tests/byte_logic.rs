//! End-to-end devirtualization of an 8-bit logic chain. The VM encodes
//! native `and`/`or` through its nand/nor primitives, and byte-sized
//! results travel widened to 16-bit stack slots, so the extract-aware size
//! folding of the tracer is what keeps these classified as 8-bit.

mod common;

use common::{Op, Program};
use devirt::{
    explorer::{Config, Explorer},
    il::{opt, verifier, Inst},
    lifter::Lifter,
    tracer::Tracer,
    vm::VInsn,
};

#[test]
fn byte_sized_logic_classifies_at_eight_bits() -> anyhow::Result<()> {
    let mut program = Program::new();
    let entry = program.block();
    program.spill_context(entry);

    // An 8-bit nand and an 8-bit nor over immediate operands; results are
    // discarded into scratch registers.
    program.op(entry, Op::PushImm16(0x12));
    program.op(entry, Op::PushImm16(0x34));
    program.op(entry, Op::Nand8);
    program.op(entry, Op::PopVreg(common::VREG_CONTEXT)); // flags
    program.op(entry, Op::PushImm16(0x56));
    program.op(entry, Op::Nor8);
    program.op(entry, Op::PopVreg(common::VREG_CONTEXT)); // flags
    program.op(entry, Op::PopVreg(common::VREG_CONTEXT + 1)); // result

    program.emit_exit(entry, 0xbbbb_0000);

    let fixture = common::build(&program);
    let mut lifter = Lifter::from_file(common::intrinsics_path())?;
    let tracer = Tracer::new(fixture.image.clone());
    let config = Config {
        synthesize_external_calls: false,
        ..Config::default()
    };

    let routine = Explorer::with_config(tracer, config).explore(fixture.entry, &mut lifter)?;
    let entry_block = routine.block(routine.entry());

    // The sizes fold down from the widened 16-bit slots to 8 bits.
    assert!(entry_block.vins().contains(&VInsn::Nand(8)));
    assert!(entry_block.vins().contains(&VInsn::Nor(8)));
    assert!(!entry_block.vins().contains(&VInsn::Nand(16)));
    assert!(!entry_block.vins().contains(&VInsn::Nor(16)));

    // After optimization no semantic calls survive in the final function:
    // every push and pop has been inlined and folded away, leaving at most
    // the declared bit intrinsics.
    let function = lifter.build_final(&routine)?;
    opt::optimize_virtual_function(lifter.module_mut(), function)?;
    verifier::verify(lifter.module(), lifter.module().function(function))?;

    let module = lifter.module();
    let final_fn = module.function(function);
    for id in final_fn.blocks.iter().flat_map(|block| &block.insts) {
        if let Inst::Call { callee, .. } = &final_fn.insts[*id] {
            let name = &module.function(*callee).name;
            assert!(
                name.starts_with("ctpop") || name.starts_with("fshl") || name.starts_with("fshr"),
                "unexpected surviving call to @{name}"
            );
        }
    }
    Ok(())
}
