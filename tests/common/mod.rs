//! A miniature VMProtect-style interpreter for the integration tests.
//!
//! The builder assembles a vmenter stub, a set of handlers with the shapes
//! the tracer recognizes, and a bytecode program, into one flat image. The
//! conventions are the classic ones: `rsi` carries the virtual instruction
//! pointer, `rdi` the virtual stack pointer, and handlers chain by fetching
//! a 32-bit code offset from the bytecode and dispatching through a
//! `lea reg, [rip - 7]` anchor.
//!
//! Bytecode encoding: every virtual instruction is a 4-byte dispatch offset
//! (resolved against the anchor of the preceding handler) followed by its
//! operand bytes. Conditional branches fetch the target block's leading
//! offset after rolling the virtual instruction pointer, so a block entered
//! conditionally starts with its own offset field; blocks entered by the
//! unconditional branch are dispatched directly and omit it.

#![allow(dead_code)] // Not every test file exercises every helper.

use std::collections::HashMap;

use devirt::image::{RawImage, SharedImage};
use iced_x86::{
    code_asm::{self, CodeAssembler},
    Decoder,
    DecoderOptions,
    Mnemonic,
    Register,
};

/// The base address the fixture image is mapped at.
pub const IMAGE_BASE: u64 = 0x0010_0000;

/// The spacing between handler slots.
const HANDLER_STRIDE: u64 = 0x100;

/// The start of the bytecode region, relative to the image base.
const BYTECODE_OFFSET: u64 = 0x8000;

/// The spacing between bytecode blocks.
const BLOCK_STRIDE: u64 = 0x400;

/// The virtual register slots the context spill occupies (the 19-slot
/// vmenter context), and the scratch slots above them.
pub const VREG_CONTEXT: u8 = 19;
const VREG_JUNK: u8 = 19;
const VREG_S0: u8 = 20;
const VREG_S2: u8 = 21;
const VREG_M: u8 = 22;
const VREG_T0: u8 = 23;
const VREG_X: u8 = 24;
const VREG_NOT_M: u8 = 25;
const VREG_T1: u8 = 26;
const VREG_Y: u8 = 27;
const VREG_NOT_X: u8 = 28;
const VREG_NOT_Y: u8 = 29;

/// The virtual register slot the pushed `rcx` context value spills into.
///
/// The vmenter pushes `k1, k2, rax, rbx, rcx, rdx, rsi, rdi, rbp, r8..r15,
/// eflags, reloc`; spilled top-down that puts `rcx` into slot 14.
pub const VREG_RCX: u8 = 14;

/// One virtual instruction of the fixture bytecode.
#[derive(Clone, Copy, Debug)]
pub enum Op {
    /// Push a 64-bit immediate.
    PushImm64(u64),

    /// Push the branch-target encoding of a block: its base address minus
    /// the branch step.
    PushTarget(usize),

    /// Push a 16-bit immediate.
    PushImm16(u16),

    /// Push the 64-bit virtual register slot.
    PushVreg(u8),

    /// Pop into the 64-bit virtual register slot.
    PopVreg(u8),

    Add64,
    Nand64,
    Nand8,
    Nor8,
    Shl64,
    Shr64,
    Ldr64,
    Str64,

    /// Conditional branch, rolling the fetched target up by the branch
    /// step.
    JccUp,

    /// Unconditional branch to the block.
    Jmp(usize),

    /// Restore the native context and leave the VM.
    Exit,
}

impl Op {
    /// The operand bytes the instruction occupies in the bytecode.
    fn operand_size(self) -> u64 {
        match self {
            Self::PushImm64(_) | Self::PushTarget(_) => 8,
            Self::PushImm16(_) => 2,
            Self::PushVreg(_) | Self::PopVreg(_) => 1,
            Self::Jmp(_) => 4,
            _ => 0,
        }
    }

    /// The handler implementing the instruction.
    fn handler(self) -> HandlerKind {
        match self {
            Self::PushImm64(_) | Self::PushTarget(_) => HandlerKind::PushImm64,
            Self::PushImm16(_) => HandlerKind::PushImm16,
            Self::PushVreg(_) => HandlerKind::PushVreg,
            Self::PopVreg(_) => HandlerKind::PopVreg,
            Self::Add64 => HandlerKind::Add64,
            Self::Nand64 => HandlerKind::Nand64,
            Self::Nand8 => HandlerKind::Nand8,
            Self::Nor8 => HandlerKind::Nor8,
            Self::Shl64 => HandlerKind::Shl64,
            Self::Shr64 => HandlerKind::Shr64,
            Self::Ldr64 => HandlerKind::Ldr64,
            Self::Str64 => HandlerKind::Str64,
            Self::JccUp => HandlerKind::JccUp,
            Self::Jmp(_) => HandlerKind::Jmp,
            Self::Exit => HandlerKind::Exit,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
enum HandlerKind {
    PushImm64,
    PushImm16,
    PushVreg,
    PopVreg,
    Add64,
    Nand64,
    Nand8,
    Nor8,
    Shl64,
    Shr64,
    Ldr64,
    Str64,
    JccUp,
    Jmp,
    Exit,
}

const HANDLER_KINDS: [HandlerKind; 15] = [
    HandlerKind::PushImm64,
    HandlerKind::PushImm16,
    HandlerKind::PushVreg,
    HandlerKind::PopVreg,
    HandlerKind::Add64,
    HandlerKind::Nand64,
    HandlerKind::Nand8,
    HandlerKind::Nor8,
    HandlerKind::Shl64,
    HandlerKind::Shr64,
    HandlerKind::Ldr64,
    HandlerKind::Str64,
    HandlerKind::JccUp,
    HandlerKind::Jmp,
    HandlerKind::Exit,
];

/// A VM program under construction: blocks of virtual instructions plus the
/// entry-kind bookkeeping the encoder needs.
#[derive(Debug, Default)]
pub struct Program {
    blocks: Vec<Vec<Op>>,
    jmp_entered: Vec<bool>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a new, empty block and returns its index. The first block is
    /// the routine entry.
    pub fn block(&mut self) -> usize {
        self.blocks.push(Vec::new());
        self.jmp_entered.push(false);
        self.blocks.len() - 1
    }

    pub fn op(&mut self, block: usize, op: Op) {
        if let Op::Jmp(target) = op {
            self.jmp_entered[target] = true;
        }
        self.blocks[block].push(op);
    }

    pub fn ops(&mut self, block: usize, ops: impl IntoIterator<Item = Op>) {
        for op in ops {
            self.op(block, op);
        }
    }

    /// Spills the 19-slot vmenter context into the virtual register file.
    pub fn spill_context(&mut self, block: usize) {
        for slot in 0..VREG_CONTEXT {
            self.op(block, Op::PopVreg(slot));
        }
    }

    /// Restores the context from the virtual register file and leaves the
    /// VM with `ret_pc` as the popped program counter.
    pub fn emit_exit(&mut self, block: usize, ret_pc: u64) {
        self.op(block, Op::PushImm64(ret_pc));
        // Slot 1 is the pushed flags word, 2..=16 the registers; pushing
        // them in slot order leaves `rax` on top for the handler's pops.
        for slot in 1..=16 {
            self.op(block, Op::PushVreg(slot));
        }
        self.op(block, Op::Exit);
    }

    /// Branches unconditionally to `target` through the conditional-branch
    /// handler with a constant destination.
    pub fn emit_goto(&mut self, block: usize, target: usize) {
        self.op(block, Op::PushTarget(target));
        self.op(block, Op::JccUp);
    }

    /// Emits `nand(a, b)` into the scratch slot `dst`, consuming nothing.
    fn emit_nand(&mut self, block: usize, a: Op, b: Op, dst: u8) {
        self.op(block, a);
        self.op(block, b);
        self.op(block, Op::Nand64);
        self.op(block, Op::PopVreg(VREG_JUNK));
        self.op(block, Op::PopVreg(dst));
    }

    /// Emits the arithmetic branch selector: branches to `taken` when the
    /// virtual register `vreg` is zero and to `fallthrough` otherwise.
    ///
    /// The selector is built the way the VM builds it: an add recomputes
    /// the flags, shifts isolate the zero bit, and a nand-built masked
    /// select combines the two destinations before the branch handler rolls
    /// the winner into the virtual instruction pointer.
    pub fn emit_branch_on_zero(
        &mut self,
        block: usize,
        vreg: u8,
        taken: usize,
        fallthrough: usize,
    ) {
        // flags = flags_of(vreg + 0)
        self.op(block, Op::PushVreg(vreg));
        self.op(block, Op::PushImm64(0));
        self.op(block, Op::Add64);
        self.op(block, Op::PopVreg(VREG_S0));
        self.op(block, Op::PopVreg(VREG_JUNK));

        // zf = (flags << 57) >> 63
        self.op(block, Op::PushImm16(57));
        self.op(block, Op::PushVreg(VREG_S0));
        self.op(block, Op::Shl64);
        self.op(block, Op::PopVreg(VREG_JUNK));
        self.op(block, Op::PopVreg(VREG_S0));
        self.op(block, Op::PushImm16(63));
        self.op(block, Op::PushVreg(VREG_S0));
        self.op(block, Op::Shr64);
        self.op(block, Op::PopVreg(VREG_JUNK));
        self.op(block, Op::PopVreg(VREG_S2));

        // m = 0 - zf
        self.emit_nand(
            block,
            Op::PushVreg(VREG_S2),
            Op::PushVreg(VREG_S2),
            VREG_T0,
        );
        self.op(block, Op::PushVreg(VREG_T0));
        self.op(block, Op::PushImm64(1));
        self.op(block, Op::Add64);
        self.op(block, Op::PopVreg(VREG_JUNK));
        self.op(block, Op::PopVreg(VREG_M));

        // x = taken & m
        self.emit_nand(block, Op::PushTarget(taken), Op::PushVreg(VREG_M), VREG_T0);
        self.emit_nand(block, Op::PushVreg(VREG_T0), Op::PushVreg(VREG_T0), VREG_X);
        // y = fallthrough & !m
        self.emit_nand(block, Op::PushVreg(VREG_M), Op::PushVreg(VREG_M), VREG_NOT_M);
        self.emit_nand(
            block,
            Op::PushTarget(fallthrough),
            Op::PushVreg(VREG_NOT_M),
            VREG_T1,
        );
        self.emit_nand(block, Op::PushVreg(VREG_T1), Op::PushVreg(VREG_T1), VREG_Y);
        // target = x | y
        self.emit_nand(block, Op::PushVreg(VREG_X), Op::PushVreg(VREG_X), VREG_NOT_X);
        self.emit_nand(block, Op::PushVreg(VREG_Y), Op::PushVreg(VREG_Y), VREG_NOT_Y);
        self.op(block, Op::PushVreg(VREG_NOT_X));
        self.op(block, Op::PushVreg(VREG_NOT_Y));
        self.op(block, Op::Nand64);
        self.op(block, Op::PopVreg(VREG_JUNK));

        self.op(block, Op::JccUp);
    }
}

/// A built fixture: the image, the vmenter address, and the virtual
/// instruction pointers the explorer will key the blocks under.
pub struct Fixture {
    pub image: SharedImage,
    pub entry: u64,
    pub block_vip: Vec<u64>,
}

/// Assembles `program` into a flat image.
pub fn build(program: &Program) -> Fixture {
    let mut assembler = FixtureAssembler::new();
    assembler.build(program)
}

struct HandlerInfo {
    base: u64,
    anchor: u64,
}

struct FixtureAssembler {
    bytes: Vec<u8>,
    handlers: HashMap<HandlerKind, HandlerInfo>,
}

impl FixtureAssembler {
    fn new() -> Self {
        Self {
            bytes: vec![0; (BYTECODE_OFFSET + 16 * BLOCK_STRIDE) as usize],
            handlers: HashMap::new(),
        }
    }

    fn write(&mut self, va: u64, code: &[u8]) {
        let offset = (va - IMAGE_BASE) as usize;
        self.bytes[offset..offset + code.len()].copy_from_slice(code);
    }

    fn build(&mut self, program: &Program) -> Fixture {
        // Lay the handlers out on their fixed slots.
        for (index, kind) in HANDLER_KINDS.iter().enumerate() {
            let base = IMAGE_BASE + HANDLER_STRIDE * (index as u64 + 1);
            let code = assemble_handler(*kind, base);
            let anchor = find_anchor(&code, base);
            self.write(base, &code);
            self.handlers.insert(*kind, HandlerInfo { base, anchor });
        }

        // Block base addresses.
        let block_base: Vec<u64> = (0..program.blocks.len())
            .map(|index| IMAGE_BASE + BYTECODE_OFFSET + BLOCK_STRIDE * index as u64)
            .collect();

        // The vmenter stub, dispatching into the entry block's bytecode.
        let entry = IMAGE_BASE;
        let vmenter = assemble_vmenter(entry, block_base[0]);
        let vmenter_anchor = find_anchor(&vmenter, entry);
        self.write(entry, &vmenter);

        // Encode the bytecode.
        for (index, block) in program.blocks.iter().enumerate() {
            let code = self.encode_block(program, block, index, block_base[index], vmenter_anchor);
            self.write(block_base[index], &code);
        }

        // The virtual instruction pointer a block is keyed under: the entry
        // block is keyed by the vmenter address itself, conditional targets
        // by their leading offset field, jump targets by their first
        // operand byte.
        let block_vip = (0..program.blocks.len())
            .map(|index| if index == 0 { entry } else { block_base[index] })
            .collect();

        Fixture {
            image: RawImage::new(IMAGE_BASE, self.bytes.clone()).into_shared(),
            entry,
            block_vip,
        }
    }

    /// Encodes one block: per instruction a dispatch offset (except ahead
    /// of the first instruction of jump-entered blocks) plus the operand
    /// bytes.
    fn encode_block(
        &self,
        program: &Program,
        block: &[Op],
        index: usize,
        base: u64,
        vmenter_anchor: u64,
    ) -> Vec<u8> {
        let mut code = Vec::new();
        let jcc_anchor = self.handlers[&HandlerKind::JccUp].anchor;

        for (position, op) in block.iter().enumerate() {
            let handler = &self.handlers[&op.handler()];

            // The dispatch offset of this instruction, resolved against the
            // anchor of whoever dispatches it.
            let leading = position > 0 || !program.jmp_entered[index];
            if leading {
                let (anchor, extra) = if position > 0 {
                    (self.handlers[&block[position - 1].handler()].anchor, 0)
                } else if index == 0 {
                    (vmenter_anchor, 0)
                } else {
                    // Conditional entry: the handler adds the rolled
                    // instruction pointer on top of the anchor and offset.
                    (jcc_anchor, base + 4)
                };
                let offset = (handler.base as u32)
                    .wrapping_sub(anchor as u32)
                    .wrapping_sub(extra as u32);
                code.extend_from_slice(&offset.to_le_bytes());
            }

            match op {
                Op::PushImm64(value) => code.extend_from_slice(&value.to_le_bytes()),
                Op::PushTarget(target) => {
                    let target_base =
                        IMAGE_BASE + BYTECODE_OFFSET + BLOCK_STRIDE * *target as u64;
                    code.extend_from_slice(&(target_base - 4).to_le_bytes());
                }
                Op::PushImm16(value) => code.extend_from_slice(&value.to_le_bytes()),
                Op::PushVreg(slot) | Op::PopVreg(slot) => code.push(slot * 8),
                Op::Jmp(target) => {
                    let target_block = &program.blocks[*target];
                    let first = self.handlers[&target_block[0].handler()].base;
                    let anchor = self.handlers[&HandlerKind::Jmp].anchor;
                    code.extend_from_slice(
                        &(first as u32).wrapping_sub(anchor as u32).to_le_bytes(),
                    );
                }
                _ => {}
            }
        }
        assert!(code.len() as u64 <= BLOCK_STRIDE, "block bytecode overflows its slot");
        code
    }
}

/// Assembles the vmenter: the context push sequence, the virtual register
/// setup, and the first dispatch.
fn assemble_vmenter(va: u64, bytecode: u64) -> Vec<u8> {
    use code_asm::{dword_ptr, ecx, edx, rcx, rdi, rdx, rsi, rsp};

    let mut a = CodeAssembler::new(64).expect("assembler");
    // Two integers ahead of the context, then the registers, the flags and
    // the relocation.
    a.push(0x1111_2222i32).unwrap();
    a.push(0x3333_4444i32).unwrap();
    a.push(code_asm::rax).unwrap();
    a.push(code_asm::rbx).unwrap();
    a.push(rcx).unwrap();
    a.push(rdx).unwrap();
    a.push(rsi).unwrap();
    a.push(rdi).unwrap();
    a.push(code_asm::rbp).unwrap();
    a.push(code_asm::r8).unwrap();
    a.push(code_asm::r9).unwrap();
    a.push(code_asm::r10).unwrap();
    a.push(code_asm::r11).unwrap();
    a.push(code_asm::r12).unwrap();
    a.push(code_asm::r13).unwrap();
    a.push(code_asm::r14).unwrap();
    a.push(code_asm::r15).unwrap();
    a.pushfq().unwrap();
    a.push(0i32).unwrap();

    // vsp and vip.
    a.mov(rdi, rsp).unwrap();
    a.mov(rsi, bytecode).unwrap();

    // First dispatch.
    a.mov(edx, dword_ptr(rsi)).unwrap();
    a.add(rsi, 4).unwrap();
    lea_anchor_rcx(&mut a);
    a.add(ecx, edx).unwrap();
    a.push(rcx).unwrap();
    a.ret().unwrap();

    a.assemble(va).expect("vmenter assembles")
}

/// Emits `lea rcx, [rip - 7]`: the handler-table anchor, pointing at the
/// lea instruction itself.
fn lea_anchor_rcx(a: &mut CodeAssembler) {
    a.db(&[0x48, 0x8d, 0x0d, 0xf9, 0xff, 0xff, 0xff]).unwrap();
}

/// Assembles one handler at `va`.
fn assemble_handler(kind: HandlerKind, va: u64) -> Vec<u8> {
    use code_asm::{
        al,
        ax,
        byte_ptr,
        cl,
        dl,
        dword_ptr,
        dx,
        eax,
        ecx,
        edx,
        esi,
        qword_ptr,
        rax,
        rcx,
        rdi,
        rdx,
        rsi,
        rsp,
        word_ptr,
    };

    let mut a = CodeAssembler::new(64).expect("assembler");

    // Every handler opens with a stack peek so that the vsp register can be
    // re-derived when the handler is entered through a conditional branch.
    a.mov(rax, qword_ptr(rdi)).unwrap();

    let dispatch = |a: &mut CodeAssembler| {
        a.mov(edx, dword_ptr(rsi)).unwrap();
        a.add(rsi, 4).unwrap();
        lea_anchor_rcx(a);
        a.add(ecx, edx).unwrap();
        a.push(rcx).unwrap();
        a.ret().unwrap();
    };

    match kind {
        HandlerKind::PushImm64 => {
            a.mov(rdx, qword_ptr(rsi)).unwrap();
            a.add(rsi, 8).unwrap();
            a.sub(rdi, 8).unwrap();
            a.mov(qword_ptr(rdi), rdx).unwrap();
            dispatch(&mut a);
        }
        HandlerKind::PushImm16 => {
            a.movzx(edx, word_ptr(rsi)).unwrap();
            a.add(rsi, 2).unwrap();
            a.sub(rdi, 2).unwrap();
            a.mov(word_ptr(rdi), dx).unwrap();
            dispatch(&mut a);
        }
        HandlerKind::PushVreg => {
            a.movzx(edx, byte_ptr(rsi)).unwrap();
            a.add(rsi, 1).unwrap();
            a.mov(rax, qword_ptr(rsp + rdx)).unwrap();
            a.sub(rdi, 8).unwrap();
            a.mov(qword_ptr(rdi), rax).unwrap();
            dispatch(&mut a);
        }
        HandlerKind::PopVreg => {
            a.movzx(edx, byte_ptr(rsi)).unwrap();
            a.add(rsi, 1).unwrap();
            a.mov(rax, qword_ptr(rdi)).unwrap();
            a.add(rdi, 8).unwrap();
            a.mov(qword_ptr(rsp + rdx), rax).unwrap();
            dispatch(&mut a);
        }
        HandlerKind::Add64 => {
            a.mov(rax, qword_ptr(rdi)).unwrap();
            a.add(rdi, 8).unwrap();
            a.mov(rdx, qword_ptr(rdi)).unwrap();
            a.add(rdx, rax).unwrap();
            a.mov(qword_ptr(rdi), rdx).unwrap();
            a.pushfq().unwrap();
            a.pop(rdx).unwrap();
            a.sub(rdi, 8).unwrap();
            a.mov(qword_ptr(rdi), rdx).unwrap();
            dispatch(&mut a);
        }
        HandlerKind::Nand64 => {
            a.mov(rax, qword_ptr(rdi)).unwrap();
            a.add(rdi, 8).unwrap();
            a.mov(rdx, qword_ptr(rdi)).unwrap();
            a.not(rax).unwrap();
            a.not(rdx).unwrap();
            a.or(rdx, rax).unwrap();
            a.mov(qword_ptr(rdi), rdx).unwrap();
            a.pushfq().unwrap();
            a.pop(rdx).unwrap();
            a.sub(rdi, 8).unwrap();
            a.mov(qword_ptr(rdi), rdx).unwrap();
            dispatch(&mut a);
        }
        HandlerKind::Nand8 => {
            a.movzx(eax, byte_ptr(rdi)).unwrap();
            a.add(rdi, 2).unwrap();
            a.mov(dl, byte_ptr(rdi)).unwrap();
            a.add(rdi, 2).unwrap();
            a.not(al).unwrap();
            a.not(dl).unwrap();
            a.or(al, dl).unwrap();
            a.sub(rdi, 2).unwrap();
            a.mov(word_ptr(rdi), ax).unwrap();
            a.pushfq().unwrap();
            a.pop(rdx).unwrap();
            a.sub(rdi, 8).unwrap();
            a.mov(qword_ptr(rdi), rdx).unwrap();
            dispatch(&mut a);
        }
        HandlerKind::Nor8 => {
            a.movzx(eax, byte_ptr(rdi)).unwrap();
            a.add(rdi, 2).unwrap();
            a.mov(dl, byte_ptr(rdi)).unwrap();
            a.add(rdi, 2).unwrap();
            a.not(al).unwrap();
            a.not(dl).unwrap();
            a.and(al, dl).unwrap();
            a.sub(rdi, 2).unwrap();
            a.mov(word_ptr(rdi), ax).unwrap();
            a.pushfq().unwrap();
            a.pop(rdx).unwrap();
            a.sub(rdi, 8).unwrap();
            a.mov(qword_ptr(rdi), rdx).unwrap();
            dispatch(&mut a);
        }
        HandlerKind::Shl64 | HandlerKind::Shr64 => {
            a.mov(rax, qword_ptr(rdi)).unwrap();
            a.add(rdi, 8).unwrap();
            a.movzx(ecx, word_ptr(rdi)).unwrap();
            a.add(rdi, 2).unwrap();
            if kind == HandlerKind::Shl64 {
                a.shl(rax, cl).unwrap();
            } else {
                a.shr(rax, cl).unwrap();
            }
            a.sub(rdi, 8).unwrap();
            a.mov(qword_ptr(rdi), rax).unwrap();
            a.pushfq().unwrap();
            a.pop(rdx).unwrap();
            a.sub(rdi, 8).unwrap();
            a.mov(qword_ptr(rdi), rdx).unwrap();
            dispatch(&mut a);
        }
        HandlerKind::Ldr64 => {
            a.mov(rdx, qword_ptr(rdi)).unwrap();
            a.mov(rax, qword_ptr(rdx)).unwrap();
            a.mov(qword_ptr(rdi), rax).unwrap();
            dispatch(&mut a);
        }
        HandlerKind::Str64 => {
            a.mov(rdx, qword_ptr(rdi)).unwrap();
            a.add(rdi, 8).unwrap();
            a.mov(rax, qword_ptr(rdi)).unwrap();
            a.add(rdi, 8).unwrap();
            a.mov(qword_ptr(rdx), rax).unwrap();
            dispatch(&mut a);
        }
        HandlerKind::JccUp => {
            a.mov(rsi, qword_ptr(rdi)).unwrap();
            a.add(rdi, 8).unwrap();
            a.add(rsi, 4).unwrap();
            a.mov(edx, dword_ptr(rsi)).unwrap();
            a.add(rsi, 4).unwrap();
            lea_anchor_rcx(&mut a);
            a.add(ecx, edx).unwrap();
            a.add(ecx, esi).unwrap();
            a.push(rcx).unwrap();
            a.ret().unwrap();
        }
        HandlerKind::Jmp => {
            a.mov(edx, dword_ptr(rsi)).unwrap();
            a.add(rsi, 4).unwrap();
            a.mov(rsi, qword_ptr(rdi)).unwrap();
            a.add(rdi, 8).unwrap();
            lea_anchor_rcx(&mut a);
            a.add(ecx, edx).unwrap();
            a.push(rcx).unwrap();
            a.ret().unwrap();
        }
        HandlerKind::Exit => {
            a.mov(rsp, rdi).unwrap();
            a.pop(rax).unwrap();
            a.pop(code_asm::rbx).unwrap();
            a.pop(rcx).unwrap();
            a.pop(rdx).unwrap();
            a.pop(rsi).unwrap();
            a.pop(rdi).unwrap();
            a.pop(code_asm::rbp).unwrap();
            a.pop(code_asm::r8).unwrap();
            a.pop(code_asm::r9).unwrap();
            a.pop(code_asm::r10).unwrap();
            a.pop(code_asm::r11).unwrap();
            a.pop(code_asm::r12).unwrap();
            a.pop(code_asm::r13).unwrap();
            a.pop(code_asm::r14).unwrap();
            a.pop(code_asm::r15).unwrap();
            a.popfq().unwrap();
            a.ret().unwrap();
        }
    }

    a.assemble(va).expect("handler assembles")
}

/// Locates the `lea reg, [rip - 7]` anchor of a handler: the address of the
/// lea instruction itself. Terminating handlers carry no anchor.
fn find_anchor(code: &[u8], base: u64) -> u64 {
    let mut decoder = Decoder::with_ip(64, code, base, DecoderOptions::NONE);
    while decoder.can_decode() {
        let insn = decoder.decode();
        if insn.mnemonic() == Mnemonic::Lea && insn.memory_base() == Register::RIP {
            return insn.ip();
        }
    }
    0
}

/// The base address of the bytecode of block `index`.
pub fn block_base(index: usize) -> u64 {
    IMAGE_BASE + BYTECODE_OFFSET + BLOCK_STRIDE * index as u64
}

/// The intrinsics module shipped with the crate, loaded relative to the
/// crate root.
pub fn intrinsics_path() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("intrinsics/vmprotect.ir")
}
