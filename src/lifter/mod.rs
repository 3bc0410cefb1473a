//! This module contains the lifter: the translation of classified virtual
//! instruction streams into IR.
//!
//! Lifting is deliberately declarative. Every virtual instruction becomes a
//! call to the matching pre-authored semantic function from the intrinsics
//! module; a lifted block is nothing but the ordered calls plus the final
//! reload of the virtual instruction pointer. The heavy work of turning
//! that call soup into clean code belongs entirely to [`crate::il::opt`].

pub mod intrinsics;

use std::collections::HashMap;

use itertools::Itertools;

use crate::{
    error::lifting::{Error, Result},
    il::{FuncId, Inst, Module, Param, Predicate, Ty, Value},
    lifter::intrinsics::Intrinsics,
    vm::{BasicBlock, JccDirection, Operand, Routine, VInsn},
};

/// The byte width of one virtual register file slot.
const VREG_SLOT_BYTES: u64 = 8;

/// The placeholder a CFG stub returns for blocks that have not been lifted
/// yet.
const UNLIFTED_PC: u64 = 0xdead_beef;

/// The two SMT root values extracted from a slice function: the candidate
/// program counter and the candidate return address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReturnArguments {
    program_counter: Value,
    return_address: Value,
}

impl ReturnArguments {
    /// Gets the program-counter candidate.
    #[must_use]
    pub fn program_counter(&self) -> Value {
        self.program_counter
    }

    /// Gets the return-address candidate.
    #[must_use]
    pub fn return_address(&self) -> Value {
        self.return_address
    }
}

/// The lifter: owns the intrinsics module and builds block, slice and final
/// functions into it.
#[derive(Clone, Debug)]
pub struct Lifter {
    intr: Intrinsics,

    /// The semantic table, resolved once at load time.
    sems: HashMap<String, FuncId>,
}

impl Lifter {
    /// Loads the intrinsics module at `path` and prepares the lifter.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self::new(Intrinsics::from_file(path)?))
    }

    /// Prepares the lifter over an already-parsed intrinsics module.
    pub fn from_text(text: &str) -> Result<Self> {
        Ok(Self::new(Intrinsics::from_text(text)?))
    }

    fn new(intr: Intrinsics) -> Self {
        let sems = intr.module.semantic_table();
        Self { intr, sems }
    }

    /// Gets the module everything is built into.
    #[must_use]
    pub fn module(&self) -> &Module {
        &self.intr.module
    }

    /// Gets the module everything is built into, for modification.
    pub fn module_mut(&mut self) -> &mut Module {
        &mut self.intr.module
    }

    /// Resolves the semantic function registered under `name`.
    fn sem(&self, name: &str) -> Result<FuncId> {
        self.sems.get(name).copied().ok_or_else(|| Error::MissingSemantic {
            name: name.to_owned(),
        })
    }

    /// Gets the argument of the function with id `id` called `name`.
    fn arg(&self, id: FuncId, name: &str) -> Result<Value> {
        self.intr
            .module
            .function(id)
            .param_index(name)
            .map(Value::Arg)
            .ok_or_else(|| Error::MissingArgument {
                name: name.to_owned(),
            })
    }

    /// Lifts a virtual basic block into a fresh block function: one IR
    /// block of semantic calls closed by a reload of the virtual
    /// instruction pointer.
    pub fn lift_basic_block(&mut self, block: &BasicBlock) -> Result<FuncId> {
        let id = self.intr.module.clone_function(self.intr.virtual_stub_empty);
        {
            let function = self.intr.module.function_mut(id);
            function.blocks.clear();
            function.insts.clear();
            function.add_block("lifted_bb");
        }

        for insn in block.vins() {
            self.emit(id, insn)?;
        }

        // Return the virtual instruction pointer the block ended on.
        let vip = self.arg(id, "vip")?;
        let function = self.intr.module.function_mut(id);
        let pc = function.append(0, Inst::Load {
            ty:  Ty::I64,
            ptr: vip,
        });
        function.append(0, Inst::Ret { value: Some(pc) });
        Ok(id)
    }

    /// Emits the semantic call(s) of one virtual instruction into block
    /// function `id`.
    fn emit(&mut self, id: FuncId, insn: &VInsn) -> Result<()> {
        let vsp = self.arg(id, "vsp")?;
        match insn {
            VInsn::Add(size) => self.emit_sem(id, &format!("ADD_{size}"), vec![vsp]),
            VInsn::Nor(size) => self.emit_sem(id, &format!("NOR_{size}"), vec![vsp]),
            VInsn::Nand(size) => self.emit_sem(id, &format!("NAND_{size}"), vec![vsp]),
            VInsn::Shl(size) => self.emit_sem(id, &format!("SHL_{size}"), vec![vsp]),
            VInsn::Shr(size) => self.emit_sem(id, &format!("SHR_{size}"), vec![vsp]),
            VInsn::Shrd(size) => self.emit_sem(id, &format!("SHRD_{size}"), vec![vsp]),
            VInsn::Shld(size) => self.emit_sem(id, &format!("SHLD_{size}"), vec![vsp]),
            VInsn::Ldr(size) => self.emit_sem(id, &format!("LOAD_{size}"), vec![vsp]),
            VInsn::Str(size) => self.emit_sem(id, &format!("STORE_{size}"), vec![vsp]),
            VInsn::Push { op, size } => self.emit_push(id, vsp, op, *size),
            VInsn::Pop { op, size } => self.emit_pop(id, vsp, op, *size),
            VInsn::Jmp => {
                let vip = self.arg(id, "vip")?;
                self.emit_sem(id, "JMP", vec![vsp, vip])
            }
            VInsn::Ret => {
                let vip = self.arg(id, "vip")?;
                self.emit_sem(id, "RET", vec![vsp, vip])
            }
            VInsn::Jcc { direction, .. } => {
                let vip = self.arg(id, "vip")?;
                let name = match direction {
                    JccDirection::Up => "JCC_INC",
                    JccDirection::Down => "JCC_DEC",
                };
                self.emit_sem(id, name, vec![vsp, vip])
            }
            VInsn::Exit(context) | VInsn::Enter(context) => {
                for insn in context {
                    self.emit(id, insn)?;
                }
                Ok(())
            }
        }
    }

    fn emit_push(&mut self, id: FuncId, vsp: Value, op: &Operand, size: u32) -> Result<()> {
        match op {
            Operand::Immediate(value) => {
                let ty = Ty::from_bits(size).ok_or(Error::UnsupportedSubOffset {
                    size,
                    offset: 0,
                })?;
                let imm = Value::const_int(ty, *value);
                self.emit_sem(id, &format!("PUSH_IMM_{size}"), vec![vsp, imm])
            }
            Operand::PhysicalRegister(name) => {
                let reg = self.arg(id, name)?;
                let function = self.intr.module.function_mut(id);
                let loaded = function.append(0, Inst::Load {
                    ty:  Ty::I64,
                    ptr: reg,
                });
                self.emit_sem(id, &format!("PUSH_REG_{size}"), vec![vsp, loaded])
            }
            Operand::VirtualRegister { index, offset } => {
                let vregs = self.arg(id, "vmregs")?;
                let function = self.intr.module.function_mut(id);
                let slot = function.append(0, Inst::Gep {
                    base:   vregs,
                    offset: Value::const_int(Ty::I64, u64::from(*index) * VREG_SLOT_BYTES),
                });
                let loaded = function.append(0, Inst::Load {
                    ty:  Ty::I64,
                    ptr: slot,
                });
                self.emit_sem(id, &format!("PUSH_VREG_{size}_{offset}"), vec![vsp, loaded])
            }
            Operand::VirtualStackPointer => {
                self.emit_sem(id, &format!("PUSH_VSP_{size}"), vec![vsp])
            }
        }
    }

    fn emit_pop(&mut self, id: FuncId, vsp: Value, op: &Operand, size: u32) -> Result<()> {
        match op {
            Operand::PhysicalRegister(name) => {
                let reg = self.arg(id, name)?;
                self.emit_sem(id, &format!("POP_REG_{size}"), vec![vsp, reg])
            }
            Operand::VirtualRegister { index, offset } => {
                // Only the sub-offsets observed in the wild carry semantics;
                // anything else is a hole in the intrinsics module, not a
                // silent fallback.
                if size == 8 && *offset > 1 {
                    return Err(Error::UnsupportedSubOffset {
                        size,
                        offset: *offset,
                    });
                }
                let vregs = self.arg(id, "vmregs")?;
                let function = self.intr.module.function_mut(id);
                let slot = function.append(0, Inst::Gep {
                    base:   vregs,
                    offset: Value::const_int(Ty::I64, u64::from(*index) * VREG_SLOT_BYTES),
                });
                self.emit_sem(id, &format!("POP_VREG_{size}_{offset}"), vec![vsp, slot])
            }
            Operand::VirtualStackPointer => {
                self.emit_sem(id, &format!("POP_VSP_{size}"), vec![vsp])
            }
            Operand::Immediate(_) => Err(Error::MissingSemantic {
                name: "POP_IMM".to_owned(),
            }),
        }
    }

    fn emit_sem(&mut self, id: FuncId, name: &str, args: Vec<Value>) -> Result<()> {
        let callee = self.sem(name)?;
        let function = self.intr.module.function_mut(id);
        function.append(0, Inst::Call { callee, args });
        Ok(())
    }

    /// Builds the slice function for `routine` focused on the block at
    /// `target`: the CFG prefix with the `KeepReturn` sentinel planted at
    /// the target block.
    pub fn build_slice(&mut self, routine: &Routine, target: u64) -> Result<FuncId> {
        self.build_function(routine, Some(target))
    }

    /// Builds the final function wiring every lifted block of `routine`
    /// together.
    pub fn build_final(&mut self, routine: &Routine) -> Result<FuncId> {
        self.build_function(routine, None)
    }

    /// Assembles the routine CFG into a stub function and wraps it into the
    /// slice or final wrapper.
    fn build_function(&mut self, routine: &Routine, target: Option<u64>) -> Result<FuncId> {
        let stub = self.intr.module.clone_function(self.intr.virtual_stub_empty);
        let vsp = self.arg(stub, "vsp")?;
        let param_count = self.intr.module.function(stub).params.len();
        let ram = self.intr.ram;
        let keep_return = self.intr.keep_return;

        let function = self.intr.module.function_mut(stub);
        function.blocks.clear();
        function.insts.clear();
        let entry = function.add_block("entry");

        // One IR block per discovered virtual block, in address order.
        let vips: Vec<u64> = routine.iter().map(|(_, block)| block.vip()).sorted().collect();
        let mut ir_blocks: HashMap<u64, usize> = HashMap::new();
        for vip in &vips {
            ir_blocks.insert(*vip, function.add_block(format!("bb_0x{vip:x}")));
        }

        // Link the blocks along the discovered edges and populate them with
        // calls to their lifted functions.
        for vip in &vips {
            let vblock = routine.block(routine.block_id(*vip).expect("vip is discovered"));
            let bb = ir_blocks[vip];

            let Some(lifted) = vblock.lifted else {
                function.append(bb, Inst::Ret {
                    value: Some(Value::const_int(Ty::I64, UNLIFTED_PC)),
                });
                continue;
            };

            let args: Vec<Value> = (0..param_count).map(Value::Arg).collect();
            let mut pc = function.append(bb, Inst::Call {
                callee: lifted,
                args,
            });

            // When building a partial function, plant the sentinel that
            // keeps the program counter and the return-address slot alive
            // for the solver.
            if target == Some(*vip) {
                let sp = function.append(bb, Inst::Load {
                    ty:  Ty::I64,
                    ptr: vsp,
                });
                let slot = function.append(bb, Inst::Gep {
                    base:   Value::Global(ram),
                    offset: sp,
                });
                let ret = function.append(bb, Inst::Load {
                    ty:  Ty::I64,
                    ptr: slot,
                });
                pc = function.append(bb, Inst::Call {
                    callee: keep_return,
                    args:   vec![pc, ret],
                });
            }

            match vblock.next.len() {
                0 => {
                    function.append(bb, Inst::Ret { value: Some(pc) });
                }
                1 => {
                    let succ_vip = routine.block(vblock.next[0]).vip();
                    let succ = ir_blocks[&succ_vip];
                    if target == Some(*vip) {
                        // Keep both the taken edge and the kept value alive.
                        let dummy = function.add_block(format!("bb_dummy_0x{vip:x}"));
                        function.append(dummy, Inst::Ret { value: Some(pc) });
                        let cmp = function.append(bb, Inst::Icmp {
                            pred: Predicate::Eq,
                            ty:   Ty::I64,
                            lhs:  pc,
                            rhs:  Value::const_int(Ty::I64, succ_vip),
                        });
                        function.append(bb, Inst::CondBr {
                            cond:      cmp,
                            then:      succ,
                            otherwise: dummy,
                        });
                    } else {
                        function.append(bb, Inst::Br { target: succ });
                    }
                }
                2 => {
                    let first_vip = routine.block(vblock.next[0]).vip();
                    let second_vip = routine.block(vblock.next[1]).vip();
                    let cmp = function.append(bb, Inst::Icmp {
                        pred: Predicate::Eq,
                        ty:   Ty::I64,
                        lhs:  pc,
                        rhs:  Value::const_int(Ty::I64, first_vip),
                    });
                    function.append(bb, Inst::CondBr {
                        cond:      cmp,
                        then:      ir_blocks[&first_vip],
                        otherwise: ir_blocks[&second_vip],
                    });
                }
                count => {
                    return Err(Error::TooManySuccessors {
                        vip: *vip,
                        count,
                    })
                }
            }
        }

        let routine_entry = routine.block(routine.entry()).vip();
        function.append(entry, Inst::Br {
            target: ir_blocks[&routine_entry],
        });

        // Wrap the stub: the slice wrapper seeds the virtual stack at the
        // saved native stack pointer, the final wrapper allocates the
        // virtual machine state.
        let wrapper_src = if target.is_some() {
            self.intr.slice_pc
        } else {
            self.intr.virtual_function
        };
        let wrapper = self.intr.module.clone_function(wrapper_src);
        self.redirect_stub_call(wrapper, stub)?;
        Ok(wrapper)
    }

    /// Redirects the first call to the `VirtualStub` declaration within
    /// function `id` to `stub`.
    fn redirect_stub_call(&mut self, id: FuncId, stub: FuncId) -> Result<()> {
        let declaration = self.intr.virtual_stub;
        let function = self.intr.module.function_mut(id);
        for block in &function.blocks {
            for inst_id in &block.insts {
                if let Inst::Call { callee, .. } = &function.insts[*inst_id] {
                    if *callee == declaration {
                        let inst_id = *inst_id;
                        if let Inst::Call { callee, .. } = &mut function.insts[inst_id] {
                            *callee = stub;
                        }
                        return Ok(());
                    }
                }
            }
        }
        Err(Error::MissingIntrinsic {
            name: "VirtualStub".to_owned(),
        })
    }

    /// Locates the unique `KeepReturn` call of function `id` and extracts
    /// its two root values.
    pub fn get_return_args(&self, id: FuncId) -> Result<ReturnArguments> {
        let function = self.intr.module.function(id);
        for block in &function.blocks {
            for inst_id in &block.insts {
                if let Inst::Call { callee, args } = &function.insts[*inst_id] {
                    if *callee == self.intr.keep_return && args.len() == 2 {
                        return Ok(ReturnArguments {
                            program_counter: args[0],
                            return_address:  args[1],
                        });
                    }
                }
            }
        }
        Err(Error::MissingKeepReturn {
            function: function.name.clone(),
        })
    }

    /// Splices a call to a synthesized external function into block
    /// function `id`, just ahead of its return.
    ///
    /// The external stub models a native call at the point where the VM
    /// exits into unprotected code: the first argument register is passed
    /// through and the result lands in the return register, with the spent
    /// return-address slot popped off the virtual stack.
    pub fn create_external_call(&mut self, id: FuncId, address: u64) -> Result<()> {
        let name = format!("External.0x{address:x}");
        let external = match self.intr.module.function_by_name(&name) {
            Some(existing) => existing,
            None => {
                let mut declaration = crate::il::Function::declaration(
                    name,
                    vec![Param {
                        name: "rcx".into(),
                        ty:   Ty::I64,
                    }],
                    Some(Ty::I64),
                );
                // Marked as reading no memory so the surrounding stack
                // traffic stays optimizable.
                declaration.attrs.pure_fn = true;
                self.intr.module.add_function(declaration)
            }
        };

        let stack_pop = self.sem("STACK_POP_64")?;
        let vsp = self.arg(id, "vsp")?;
        let rcx = self.arg(id, "rcx")?;
        let rax = self.arg(id, "rax")?;

        let function = self.intr.module.function_mut(id);
        let exits: Vec<usize> = function
            .blocks
            .iter()
            .enumerate()
            .filter_map(|(index, block)| {
                block
                    .insts
                    .last()
                    .is_some_and(|last| matches!(function.insts[*last], Inst::Ret { .. }))
                    .then_some(index)
            })
            .collect();
        if exits.len() != 1 {
            return Err(Error::MalformedExitBlocks {
                function: function.name.clone(),
                count:    exits.len(),
            });
        }
        let block = exits[0];
        let position = function.blocks[block].insts.len() - 1;

        let mut fresh = |inst: Inst| -> (usize, Value) {
            let id = function.insts.len();
            function.insts.push(inst);
            (id, Value::Inst(id))
        };
        // Pop the spent return-address slot and mark it undefined.
        let (pop_id, _) = fresh(Inst::Call {
            callee: stack_pop,
            args:   vec![vsp],
        });
        let (load_id, rcx_value) = fresh(Inst::Load {
            ty:  Ty::I64,
            ptr: rcx,
        });
        let (call_id, call_value) = fresh(Inst::Call {
            callee: external,
            args:   vec![rcx_value],
        });
        let (store_id, _) = fresh(Inst::Store {
            ty:    Ty::I64,
            value: call_value,
            ptr:   rax,
        });

        function.blocks[block]
            .insts
            .splice(position..position, [pop_id, load_id, call_id, store_id]);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::{
        il::{opt, verifier, Inst},
        lifter::Lifter,
        vm::{Operand, Routine, VInsn},
    };

    /// A minimal intrinsics module covering the semantics these tests
    /// exercise.
    const INTRINSICS: &str = r"
global RAM : [0 x i8]
global GS : [0 x i8]
global FS : [0 x i8]
global __undef : i64
global SEM_PUSH_IMM_64 : ptr = @PUSH_IMM_64
global SEM_ADD_64 : ptr = @ADD_64
global SEM_JMP : ptr = @JMP
global SEM_STACK_POP_64 : ptr = @STACK_POP_64

declare VirtualStub(rax: ptr, rbx: ptr, rcx: ptr, rdx: ptr, rdi: ptr, rsi: ptr, rsp: ptr, rbp: ptr, r8: ptr, r9: ptr, r10: ptr, r11: ptr, r12: ptr, r13: ptr, r14: ptr, r15: ptr, eflags: ptr, vsp: ptr, vip: ptr, vmregs: ptr) -> i64
declare KeepReturn(pc: i64, ret: i64) -> i64 attrs(pure, noduplicate)

define VirtualStubEmpty(rax: ptr, rbx: ptr, rcx: ptr, rdx: ptr, rdi: ptr, rsi: ptr, rsp: ptr, rbp: ptr, r8: ptr, r9: ptr, r10: ptr, r11: ptr, r12: ptr, r13: ptr, r14: ptr, r15: ptr, eflags: ptr, vsp: ptr, vip: ptr, vmregs: ptr) -> i64 attrs(inline) {
entry:
  ret i64 0
}

define SlicePC(rax: i64, rbx: i64, rcx: i64, rdx: i64, rdi: i64, rsi: i64, rsp: i64, rbp: i64, r8: i64, r9: i64, r10: i64, r11: i64, r12: i64, r13: i64, r14: i64, r15: i64, eflags: i64) -> i64 attrs(inline) {
entry:
  %rax_s = alloca 8
  store i64 %rax, ptr %rax_s
  %rcx_s = alloca 8
  store i64 %rcx, ptr %rcx_s
  %rsp_s = alloca 8
  store i64 %rsp, ptr %rsp_s
  %vsp_s = alloca 8
  store i64 %rsp, ptr %vsp_s
  %vip_s = alloca 8
  %vmregs = alloca 240
  %pc = call i64 @VirtualStub(ptr %rax_s, ptr %rax_s, ptr %rcx_s, ptr %rax_s, ptr %rax_s, ptr %rax_s, ptr %rsp_s, ptr %rax_s, ptr %rax_s, ptr %rax_s, ptr %rax_s, ptr %rax_s, ptr %rax_s, ptr %rax_s, ptr %rax_s, ptr %rax_s, ptr %rax_s, ptr %vsp_s, ptr %vip_s, ptr %vmregs)
  ret i64 %pc
}

define VirtualFunction(rax: ptr, rbx: ptr, rcx: ptr, rdx: ptr, rdi: ptr, rsi: ptr, rsp: ptr, rbp: ptr, r8: ptr, r9: ptr, r10: ptr, r11: ptr, r12: ptr, r13: ptr, r14: ptr, r15: ptr, eflags: ptr) -> i64 attrs(inline) {
entry:
  %vsp_s = alloca 8
  %rsp_v = load i64, ptr %rsp
  store i64 %rsp_v, ptr %vsp_s
  %vip_s = alloca 8
  %vmregs = alloca 240
  %pc = call i64 @VirtualStub(ptr %rax, ptr %rbx, ptr %rcx, ptr %rdx, ptr %rdi, ptr %rsi, ptr %rsp, ptr %rbp, ptr %r8, ptr %r9, ptr %r10, ptr %r11, ptr %r12, ptr %r13, ptr %r14, ptr %r15, ptr %eflags, ptr %vsp_s, ptr %vip_s, ptr %vmregs)
  ret i64 %pc
}

define PUSH_IMM_64(vsp: ptr, value: i64) attrs(inline) {
entry:
  %sp = load i64, ptr %vsp
  %new = sub i64 %sp, 8
  store i64 %new, ptr %vsp
  %slot = gep ptr @RAM, i64 %new
  store i64 %value, ptr %slot
  ret void
}

define ADD_64(vsp: ptr) attrs(inline) {
entry:
  %sp = load i64, ptr %vsp
  %a_ptr = gep ptr @RAM, i64 %sp
  %a = load i64, ptr %a_ptr
  %b_off = add i64 %sp, 8
  %b_ptr = gep ptr @RAM, i64 %b_off
  %b = load i64, ptr %b_ptr
  %sum = add i64 %a, %b
  store i64 %sum, ptr %b_ptr
  ret void
}

define JMP(vsp: ptr, vip: ptr) attrs(inline) {
entry:
  %sp = load i64, ptr %vsp
  %slot = gep ptr @RAM, i64 %sp
  %target = load i64, ptr %slot
  %new = add i64 %sp, 8
  store i64 %new, ptr %vsp
  store i64 %target, ptr %vip
  ret void
}

define STACK_POP_64(vsp: ptr) -> i64 attrs(inline) {
entry:
  %sp = load i64, ptr %vsp
  %slot = gep ptr @RAM, i64 %sp
  %value = load i64, ptr %slot
  %undef = load i64, ptr @__undef
  store i64 %undef, ptr %slot
  %new = add i64 %sp, 8
  store i64 %new, ptr %vsp
  ret i64 %value
}
";

    #[test]
    fn lifted_blocks_are_ordered_semantic_calls() -> anyhow::Result<()> {
        let mut lifter = Lifter::from_text(INTRINSICS)?;
        let mut routine = Routine::new(0x1000);
        let entry = routine.entry();
        routine.block_mut(entry).add(VInsn::push(Operand::Immediate(2), 64));
        routine.block_mut(entry).add(VInsn::push(Operand::Immediate(3), 64));
        routine.block_mut(entry).add(VInsn::Add(64));
        routine.block_mut(entry).add(VInsn::Jmp);

        let id = lifter.lift_basic_block(routine.block(entry))?;
        let function = lifter.module().function(id);

        let callees: Vec<String> = function.blocks[0]
            .insts
            .iter()
            .filter_map(|inst_id| match &function.insts[*inst_id] {
                Inst::Call { callee, .. } => {
                    Some(lifter.module().function(*callee).name.clone())
                }
                _ => None,
            })
            .collect();
        assert_eq!(callees, vec!["PUSH_IMM_64", "PUSH_IMM_64", "ADD_64", "JMP"]);

        verifier::verify(lifter.module(), function)?;
        Ok(())
    }

    #[test]
    fn missing_semantics_are_reported_by_name() -> anyhow::Result<()> {
        let mut lifter = Lifter::from_text(INTRINSICS)?;
        let mut routine = Routine::new(0x1000);
        let entry = routine.entry();
        routine.block_mut(entry).add(VInsn::Shld(32));

        let result = lifter.lift_basic_block(routine.block(entry));
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn slices_carry_the_keep_return_sentinel() -> anyhow::Result<()> {
        let mut lifter = Lifter::from_text(INTRINSICS)?;
        let mut routine = Routine::new(0x1000);
        let entry = routine.entry();
        routine.block_mut(entry).add(VInsn::push(Operand::Immediate(0x2000), 64));
        routine.block_mut(entry).add(VInsn::Jmp);
        let lifted = lifter.lift_basic_block(routine.block(entry))?;
        routine.block_mut(entry).lifted = Some(lifted);

        let slice = lifter.build_slice(&routine, 0x1000)?;
        opt::optimize_block_function(lifter.module_mut(), slice)?;

        let args = lifter.get_return_args(slice)?;
        let _ = args.program_counter();
        let _ = args.return_address();

        lifter.module_mut().erase_function(slice);
        assert!(!lifter.module().is_live(slice));
        Ok(())
    }

    #[test]
    fn external_calls_splice_ahead_of_the_return() -> anyhow::Result<()> {
        let mut lifter = Lifter::from_text(INTRINSICS)?;
        let mut routine = Routine::new(0x1000);
        let entry = routine.entry();
        routine.block_mut(entry).add(VInsn::push(Operand::Immediate(0x7000), 64));
        routine.block_mut(entry).add(VInsn::Jmp);
        let lifted = lifter.lift_basic_block(routine.block(entry))?;

        lifter.create_external_call(lifted, 0x7000)?;

        let external = lifter
            .module()
            .function_by_name("External.0x7000")
            .expect("the external stub is declared");
        assert!(lifter.module().function(external).attrs.pure_fn);
        assert!(lifter.module().function(external).is_declaration());

        // The splice lands between the last semantic call and the return:
        // the spent slot is popped, the argument register loaded, the call
        // made and its result committed to the return register.
        let function = lifter.module().function(lifted);
        let insts = &function.blocks[0].insts;
        let external_position = insts
            .iter()
            .position(|id| {
                matches!(function.insts[*id], Inst::Call { callee, .. } if callee == external)
            })
            .expect("the external call was spliced");
        assert!(external_position + 2 < insts.len());
        assert!(matches!(
            function.insts[insts[external_position + 1]],
            Inst::Store { .. }
        ));
        assert!(matches!(
            function.insts[*insts.last().unwrap()],
            Inst::Ret { .. }
        ));

        verifier::verify(lifter.module(), function)?;
        Ok(())
    }

    #[test]
    fn final_functions_resolve_single_block_routines() -> anyhow::Result<()> {
        let mut lifter = Lifter::from_text(INTRINSICS)?;
        let mut routine = Routine::new(0x1000);
        let entry = routine.entry();
        routine.block_mut(entry).add(VInsn::push(Operand::Immediate(0x2000), 64));
        routine.block_mut(entry).add(VInsn::Jmp);
        let lifted = lifter.lift_basic_block(routine.block(entry))?;
        routine.block_mut(entry).lifted = Some(lifted);

        let final_fn = lifter.build_final(&routine)?;
        opt::optimize_virtual_function(lifter.module_mut(), final_fn)?;

        verifier::verify(lifter.module(), lifter.module().function(final_fn))?;
        Ok(())
    }
}
