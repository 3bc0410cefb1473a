//! This module contains the tracer: the component that executes the VM
//! interpreter one handler at a time and classifies every handler into a
//! [`VInsn`].
//!
//! Classification works on a fork. Each [`Tracer::step`] forks the machine,
//! runs the whole handler on the fork with the virtual instruction pointer,
//! virtual stack pointer and native stack pointer symbolized, and matches
//! the symbolic expressions the handler produces against the known handler
//! shapes. The original tracer then replays the handler concretely, so its
//! own state never accumulates symbolic pollution. On
//! [`StepKind::StopBeforeBranch`] the replay is skipped for branch handlers,
//! leaving the tracer parked ahead of the native instructions that would
//! commit the new virtual instruction pointer.

pub mod pattern;

use std::collections::{HashMap, HashSet};

use iced_x86::{Instruction, Mnemonic, OpKind, Register};
use itertools::Itertools;
use log::{info, warn};

use crate::{
    constant::{
        JCC_VSP_SCAN_LIMIT,
        PHYSICAL_REGISTERS_X64,
        PHYSICAL_REGISTERS_X86,
        STACK_BASE,
        VMENTER_EXTRA_SLOTS,
    },
    emu::{
        ast::{self, collect_variables, Expr, VarRef},
        register_by_name,
        register_name,
        Emulator,
    },
    error::{
        fault::FaultSite,
        tracing::{Error, Result},
    },
    image::SharedImage,
    vm::{JccDirection, Operand, VInsn},
};

/// The classification aliases the tracer mints symbolic variables under.
mod alias {
    pub const RSP: &str = "rsp";
    pub const VIP: &str = "vip";
    pub const VIP_FETCH: &str = "[vip]";
    pub const VSP: &str = "vsp";
    pub const VSP_FETCH: &str = "[vsp]";
    pub const VREGS: &str = "vregs";
    pub const MEMORY_FETCH: &str = "[memory]";
}

/// How a step should treat a branch handler.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StepKind {
    /// Classify the branch but stop ahead of the native instructions that
    /// commit the new virtual instruction pointer, so that the caller can
    /// fork state.
    StopBeforeBranch,

    /// Execute the branch and land on the first instruction of the next
    /// handler.
    ExecuteBranch,
}

/// The symbolic tracer for one VM instance.
///
/// Forking a tracer ([`Tracer::fork`]) deep-copies the machine state and the
/// classification context; forks evolve independently.
#[derive(Clone, Debug)]
pub struct Tracer {
    /// The machine the VM interpreter runs on.
    emu: Emulator,

    /// The number of physical registers a vmenter context push covers.
    physical_registers: usize,

    /// The native register currently carrying the virtual instruction
    /// pointer; [`None`] before vmenter recognition.
    vip_register: Option<Register>,

    /// The native register currently carrying the virtual stack pointer;
    /// [`None`] before vmenter recognition.
    vsp_register: Option<Register>,

    /// The producer cache: for every minted symbolic variable, the native
    /// instruction whose load created it. Classification uses this to
    /// recover original operand widths.
    cache: HashMap<u64, Instruction>,
}

impl Tracer {
    /// Constructs a new tracer over the provided binary `image`.
    #[must_use]
    pub fn new(image: SharedImage) -> Self {
        let physical_registers = if image.is_x64() {
            PHYSICAL_REGISTERS_X64
        } else {
            PHYSICAL_REGISTERS_X86
        };
        Self {
            emu: Emulator::new(image),
            physical_registers,
            vip_register: None,
            vsp_register: None,
            cache: HashMap::new(),
        }
    }

    /// Seeds the tracer at the vmenter `address` with a fresh native stack.
    pub fn seed(&mut self, address: u64) {
        self.emu.set_rip(address);
        let rsp = self.emu.rsp_register();
        self.emu.write_reg(rsp, STACK_BASE);
    }

    /// Produces an independent deep copy of the tracer.
    #[must_use]
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Gets the machine the tracer runs on.
    #[must_use]
    pub fn emulator(&self) -> &Emulator {
        &self.emu
    }

    /// Gets the machine the tracer runs on for modification.
    pub fn emulator_mut(&mut self) -> &mut Emulator {
        &mut self.emu
    }

    /// Gets the number of physical registers of the traced architecture.
    #[must_use]
    pub fn physical_registers(&self) -> usize {
        self.physical_registers
    }

    /// Gets the concrete virtual instruction pointer.
    ///
    /// # Panics
    ///
    /// Panics if called before vmenter recognition. The explorer only calls
    /// this after processing the vmenter.
    #[must_use]
    pub fn vip(&self) -> u64 {
        self.emu
            .read_reg(self.vip_register.expect("vip register is known after vmenter"))
    }

    /// Gets the concrete virtual stack pointer.
    ///
    /// # Panics
    ///
    /// Panics if called before vmenter recognition.
    #[must_use]
    pub fn vsp(&self) -> u64 {
        self.emu
            .read_reg(self.vsp_register.expect("vsp register is known after vmenter"))
    }

    /// Overwrites the word-sized virtual stack slot at the current virtual
    /// stack pointer.
    ///
    /// The explorer uses this to steer a forked tracer towards one of the
    /// enumerated branch targets before executing the branch handler.
    pub fn write_stack_slot(&mut self, value: u64) {
        let vsp = self.vsp();
        let size = self.emu.ptr_size() as usize;
        self.emu.write_mem(vsp, size, value);
    }

    /// Executes exactly one VM handler and returns its classified virtual
    /// instruction.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if the handler cannot be classified or uses a native
    /// instruction the emulator does not support.
    pub fn step(&mut self, kind: StepKind) -> Result<VInsn> {
        let mut probe = self.fork();
        let vinsn = probe.process_instruction()?;

        if vinsn.is_enter() {
            self.vip_register = probe.vip_register;
            self.vsp_register = probe.vsp_register;
        }
        if vinsn.is_branch() && kind == StepKind::StopBeforeBranch {
            return Ok(vinsn);
        }
        if let VInsn::Jcc {
            vip_register,
            vsp_register,
            ..
        } = &vinsn
        {
            self.vip_register = register_by_name(vip_register);
            self.vsp_register = register_by_name(vsp_register);
        }

        // Cycle this tracer to the fork's stop point. The fork carries all
        // of the symbolic pollution; the replay here is purely concrete.
        loop {
            let insn = self.emu.disassemble()?;
            if insn.ip() == probe.emu.rip() {
                break;
            }
            self.emu.execute(&insn)?;
        }
        Ok(vinsn)
    }

    /// Classifies the handler at the current instruction pointer, executing
    /// it in full on this tracer.
    fn process_instruction(&mut self) -> Result<VInsn> {
        if self.vip_register.is_none() || self.vsp_register.is_none() {
            return self.process_vmenter();
        }
        let handler = self.emu.rip();
        let vip_register = self.vip_register.expect("checked above");
        let vsp_register = self.vsp_register.expect("checked above");

        // Matched virtual instructions and the executed native stream.
        let mut vinsns: Vec<VInsn> = Vec::new();
        let mut stream: Vec<Instruction> = Vec::new();

        // Symbolize the bytecode pointer and both stacks.
        self.emu.symbolize_reg(vip_register, alias::VIP);
        self.emu.symbolize_reg(vsp_register, alias::VSP);
        let rsp = self.emu.rsp_register();
        self.emu.symbolize_reg(rsp, alias::RSP);

        self.cache.clear();
        let mut popped_registers: HashSet<String> = HashSet::new();
        let mut popped_context: Vec<VInsn> = Vec::new();

        loop {
            let insn = self.emu.disassemble()?;

            if op_mov_memory_register(&insn) {
                if let Some(vinsn) = self.process_store(&insn)? {
                    vinsns.push(vinsn);
                }
            } else if op_pop_register(&insn) {
                let reg = insn.op_register(0);
                let name = register_name(reg);
                if !popped_registers.contains(&name) {
                    popped_context.push(VInsn::pop(
                        Operand::PhysicalRegister(name.clone()),
                        u32::try_from(reg.size() * 8).expect("register sizes fit"),
                    ));
                    popped_registers.insert(name);
                }
            } else if op_pop_flags(&insn) {
                if popped_registers.insert("eflags".to_owned()) {
                    popped_context.push(VInsn::pop(
                        Operand::PhysicalRegister("eflags".to_owned()),
                        u32::try_from(self.emu.ptr_size() * 8).expect("pointer sizes fit"),
                    ));
                }
            }

            // The load classification needs the address expression as it was
            // before the destination register changed.
            let load_lea = if op_mov_register_memory(&insn) {
                Some(self.emu.lea_expr(&insn))
            } else {
                None
            };

            self.emu.execute(&insn)?;

            if let Some(lea) = load_lea {
                if let Some(vinsn) = self.process_load(&insn, &lea) {
                    vinsns.push(vinsn);
                }
            }

            if op_ret(&insn) && popped_registers.len() == self.physical_registers {
                stream.push(insn);
                break;
            }
            stream.push(insn);

            let rip_variables = self
                .emu
                .rip_expr()
                .map(|expr| collect_variables(&expr))
                .unwrap_or_default();
            if ast::has_variables(&rip_variables, &[alias::VIP_FETCH])
                || ast::has_variables(&rip_variables, &[alias::MEMORY_FETCH, alias::VSP_FETCH])
            {
                break;
            }
            if self.emu.rip() == 0 {
                break;
            }
        }

        if vinsns.is_empty() {
            let rip_variables = self
                .emu
                .rip_expr()
                .map(|expr| collect_variables(&expr))
                .unwrap_or_default();

            if ast::has_variables(&rip_variables, &[alias::MEMORY_FETCH, alias::VSP_FETCH]) {
                return self.classify_jcc(&rip_variables, handler);
            }
            if ast::has_variables(&rip_variables, &[alias::VIP_FETCH])
                && stream.iter().any(op_lea_rip)
            {
                vinsns.push(VInsn::Jmp);
            } else if popped_context.len() == self.physical_registers {
                return Ok(VInsn::Exit(popped_context));
            }
        }

        if vinsns.len() != 1 {
            warn!("{}", format_stream(&stream));
            return Err(Error::UnclassifiedHandler.at(handler));
        }
        Ok(vinsns.remove(0))
    }

    /// Finalizes the classification of a conditional-branch handler.
    ///
    /// The direction falls out of the expression computing the rolled
    /// bytecode pointer, and the new virtual stack pointer register is
    /// recovered by speculatively stepping a fork into the next handler
    /// until its first stack fetch.
    fn classify_jcc(&self, rip_variables: &[VarRef], handler: u64) -> Result<VInsn> {
        let memory_var = ast::get_variable(rip_variables, alias::MEMORY_FETCH)
            .ok_or_else(|| Error::NoSuchVariable {
                alias: alias::MEMORY_FETCH.to_owned(),
            }
            .at(handler))?;
        let comment = memory_var.comment();
        let vip_register = register_by_name(&comment).ok_or_else(|| {
            Error::MalformedVariableComment { comment: comment.clone() }.at(handler)
        })?;

        let vip_expr = self.emu.reg_expr(vip_register);
        let direction = if matches!(
            &*vip_expr,
            Expr::Binary {
                op: ast::BinOp::Add,
                ..
            }
        ) {
            JccDirection::Up
        } else {
            JccDirection::Down
        };

        // The next handler begins by fetching from the rolled stack, so its
        // first memory read names the new vsp register.
        let mut probe = self.fork();
        for _ in 0..JCC_VSP_SCAN_LIMIT {
            let insn = probe.emu.single_step()?;
            if op_mov_register_memory(&insn) {
                let vsp_register = insn.memory_base();
                return Ok(VInsn::Jcc {
                    direction,
                    vip_register: register_name(vip_register),
                    vsp_register: register_name(vsp_register),
                });
            }
        }
        Err(Error::JccStackPointerNotFound.at(handler))
    }

    /// Recognizes the vmenter prelude and reconstructs the pushed context.
    fn process_vmenter(&mut self) -> Result<VInsn> {
        let entry = self.emu.rip();
        let rsp_register = self.emu.rsp_register();
        let rsp_value = self.emu.rsp();

        // Symbolize the initial context under the register names.
        for reg in self.emu.gprs() {
            let name = register_name(reg);
            self.emu.symbolize_reg(reg, &name);
        }

        let mut stream: Vec<Instruction> = Vec::new();
        loop {
            let insn = self.emu.single_step()?;

            if op_mov_register_register(&insn) {
                let dst = insn.op_register(0);
                let src = insn.op_register(1);
                if src == rsp_register && dst.size() == src.size() && self.vsp_register.is_none()
                {
                    self.vsp_register = Some(dst);
                }
            } else if op_mov_register_memory(&insn) {
                let dst = insn.op_register(0);
                let base = insn.memory_base();
                if base != Register::None
                    && base != Register::RIP
                    && base != Register::EIP
                    && base != rsp_register
                    && self.vip_register.is_none()
                {
                    self.vip_register = Some(base);
                }
                let name = register_name(dst);
                self.emu.symbolize_reg(dst, &name);
            }
            stream.push(insn);

            if self.emu.is_rip_symbolized() {
                break;
            }
        }

        if self.vip_register.is_none() || self.vsp_register.is_none() {
            warn!("No virtual registers were found:");
            warn!(
                "\tvip: {}",
                if self.vip_register.is_some() { "found" } else { "not found" }
            );
            warn!(
                "\tvsp: {}",
                if self.vsp_register.is_some() { "found" } else { "not found" }
            );
            warn!("{}", format_stream(&stream));
            return Err(Error::VirtualRegistersNotFound {
                vip_found: self.vip_register.is_some(),
                vsp_found: self.vsp_register.is_some(),
            }
            .at(entry));
        }

        // Physical registers pushed on vmenter, plus the two integers pushed
        // ahead of it and the relocation at the end.
        let context_size = self.physical_registers + VMENTER_EXTRA_SLOTS;
        let word = self.emu.ptr_size();
        let word_bits = u32::try_from(word * 8).expect("pointer sizes fit");

        let mut context: Vec<VInsn> = Vec::new();
        let mut addr = rsp_value.wrapping_sub(word);
        while addr >= rsp_value.wrapping_sub(context_size as u64 * word) {
            if let Some(expr) = self.emu.mem_expr_opt(addr, word as usize) {
                let Expr::Var(variable) = &*expr else {
                    return Err(Error::MalformedContextSlot { address: addr }.at(entry));
                };
                context.push(VInsn::push(
                    Operand::PhysicalRegister(variable.alias().to_owned()),
                    variable.size(),
                ));
            } else {
                // Match eflags since it is not symbolic.
                let off = rsp_value - addr;
                if off > 2 * word && off < context_size as u64 * word {
                    context.push(VInsn::push(
                        Operand::PhysicalRegister("eflags".to_owned()),
                        word_bits,
                    ));
                } else {
                    context.push(VInsn::push(
                        Operand::Immediate(self.emu.read_mem(addr, word as usize)),
                        word_bits,
                    ));
                }
            }
            addr = addr.wrapping_sub(word);
        }

        if context.len() != context_size {
            return Err(Error::MalformedEnterContext {
                found:    context.len(),
                expected: context_size,
            }
            .at(entry));
        }
        Ok(VInsn::Enter(context))
    }

    /// Classifies a `mov [mem], reg` against the handler store shapes.
    ///
    /// Unmatched stores are logged and skipped; a handler that produces no
    /// match at all fails classification later.
    fn process_store(&mut self, insn: &Instruction) -> Result<Option<VInsn>> {
        let mem_expr = self.emu.lea_expr(insn);
        let reg = insn.op_register(1);
        let reg_expr = self.emu.reg_expr(reg);
        let mem_variables = collect_variables(&mem_expr);
        let reg_variables = collect_variables(&reg_expr);

        let word = self.emu.ptr_size();
        let mem_bits = u32::try_from(insn.memory_size().size() * 8).expect("sizes fit");
        let reg_bits = u32::try_from(reg.size() * 8).expect("sizes fit");

        // 8-bit results travel in 16-bit slots; the slicing wrapper gives
        // them away.
        let mut size = reg_expr.size();
        if matches!(&*reg_expr, Expr::Extract { .. })
            && size == 16
            && !ast::has_variables(&reg_variables, &[alias::VSP])
        {
            size = 8;
        }

        let has_mem = |aliases: &[&str]| ast::has_variables(&mem_variables, aliases);
        let has_reg = |aliases: &[&str]| ast::has_variables(&reg_variables, aliases);

        // movzx ax, byte ptr [vsp]
        // mov [vmregs + offset], ax
        if has_mem(&[alias::RSP, alias::VIP_FETCH]) && has_reg(&[alias::VSP_FETCH]) {
            let write_off = self.emu.read_reg(insn.memory_index());
            let index = u32::try_from(write_off / word).expect("register file is small");
            let offset = u32::try_from(write_off % word).expect("offsets are sub-word");
            let producer = self.lookup_producer(&reg_variables, alias::VSP_FETCH, insn.ip())?;
            let bits =
                u32::try_from(producer.memory_size().size() * 8).expect("sizes fit");
            return Ok(Some(VInsn::pop(
                Operand::VirtualRegister { index, offset },
                bits,
            )));
        }
        if has_mem(&[alias::VSP]) && has_reg(&[alias::VIP_FETCH]) {
            let value = reg_expr.evaluate(&ast::Model::new());
            return Ok(Some(VInsn::push(Operand::Immediate(value), reg_bits)));
        }
        // mov ax, word ptr [vmregs + offset]
        // mov [vsp], ax
        if has_mem(&[alias::VSP]) && has_reg(&[alias::VREGS]) {
            let variable = ast::get_variable(&reg_variables, alias::VREGS)
                .expect("presence checked above");
            let comment = variable.comment();
            let index_value = comment
                .strip_prefix("0x")
                .and_then(|hex| u64::from_str_radix(hex, 16).ok())
                .ok_or_else(|| {
                    Error::MalformedVariableComment { comment: comment.clone() }
                        .at(insn.ip())
                })?;
            let producer = self.lookup_producer(&reg_variables, alias::VREGS, insn.ip())?;
            let bits =
                u32::try_from(producer.memory_size().size() * 8).expect("sizes fit");
            let index = u32::try_from(index_value / word).expect("register file is small");
            let offset = u32::try_from(index_value % word).expect("offsets are sub-word");
            return Ok(Some(VInsn::push(
                Operand::VirtualRegister { index, offset },
                bits,
            )));
        }
        if has_mem(&[alias::VSP]) && has_reg(&[alias::VSP]) {
            return Ok(Some(VInsn::push(Operand::VirtualStackPointer, mem_bits)));
        }
        if has_mem(&[alias::VSP_FETCH]) && has_reg(&[alias::VSP_FETCH]) {
            return Ok(Some(VInsn::Str(mem_bits)));
        }
        if has_mem(&[alias::VSP]) && has_reg(&[alias::MEMORY_FETCH]) {
            let producer =
                self.lookup_producer(&reg_variables, alias::MEMORY_FETCH, insn.ip())?;
            let bits =
                u32::try_from(producer.memory_size().size() * 8).expect("sizes fit");
            return Ok(Some(VInsn::Ldr(bits)));
        }
        if has_mem(&[alias::VSP]) && pattern::match_add(&reg_expr) {
            return Ok(Some(VInsn::Add(size)));
        }
        if has_mem(&[alias::VSP]) && pattern::match_nand(&reg_expr) {
            return Ok(Some(VInsn::Nand(size)));
        }
        if has_mem(&[alias::VSP]) && pattern::match_nor(&reg_expr) {
            return Ok(Some(VInsn::Nor(size)));
        }
        if has_mem(&[alias::VSP]) && pattern::match_shr(&reg_expr) {
            return Ok(Some(VInsn::Shr(size)));
        }
        if has_mem(&[alias::VSP]) && pattern::match_shl(&reg_expr) {
            return Ok(Some(VInsn::Shl(size)));
        }
        if has_mem(&[alias::VSP]) && pattern::match_shrd(&reg_expr) {
            return Ok(Some(VInsn::Shrd(size)));
        }
        if has_mem(&[alias::VSP]) && pattern::match_shld(&reg_expr) {
            return Ok(Some(VInsn::Shld(size)));
        }

        warn!("Failed to match store at 0x{:x}:", insn.ip());
        warn!("\tmemory   expression: {mem_expr}");
        warn!("\tregister expression: {reg_expr}");
        Ok(None)
    }

    /// Classifies a `mov reg, [mem]`, re-symbolizing the destination under
    /// the alias derived from the address expression.
    fn process_load(&mut self, insn: &Instruction, lea: &ast::ExprRef) -> Option<VInsn> {
        let reg = insn.op_register(0);
        let variables = collect_variables(lea);
        let mem_bits = u32::try_from(insn.memory_size().size() * 8).expect("sizes fit");

        if ast::has_variables(&variables, &[alias::VIP]) {
            let variable = self.emu.symbolize_reg(reg, alias::VIP_FETCH);
            self.cache.insert(variable.id(), *insn);
        } else if ast::has_variables(&variables, &[alias::VSP]) {
            let variable = self.emu.symbolize_reg(reg, alias::VSP_FETCH);
            self.cache.insert(variable.id(), *insn);

            let vsp = self.vsp_register.expect("set before handler classification");
            if vsp.full_register() == reg.full_register() {
                return Some(VInsn::pop(Operand::VirtualStackPointer, mem_bits));
            }
        } else if ast::has_variables(&variables, &[alias::RSP, alias::VIP_FETCH]) {
            // The read offset names the virtual register; it is recovered
            // from the comment by the push-vreg store classification.
            let variable = self.emu.symbolize_reg(reg, alias::VREGS);
            variable.set_comment(format!("0x{:x}", self.emu.read_reg(insn.memory_index())));
            self.cache.insert(variable.id(), *insn);
        } else if ast::has_variables(&variables, &[alias::VSP_FETCH]) {
            // The base register name is recovered as the new vip register by
            // the jcc classification.
            let variable = self.emu.symbolize_reg(reg, alias::MEMORY_FETCH);
            variable.set_comment(register_name(insn.memory_base()));
            self.cache.insert(variable.id(), *insn);
        }
        None
    }

    /// Looks up the producer instruction cached for the variable with
    /// `alias`.
    fn lookup_producer(
        &self,
        variables: &[VarRef],
        alias: &str,
        address: u64,
    ) -> Result<Instruction> {
        let variable = ast::get_variable(variables, alias).ok_or_else(|| {
            Error::NoSuchVariable {
                alias: alias.to_owned(),
            }
            .at(address)
        })?;
        self.cache.get(&variable.id()).copied().ok_or_else(|| {
            Error::NoCachedProducer {
                alias: alias.to_owned(),
            }
            .at(address)
        })
    }
}

/// Logs a classified instruction in the execution-trace format.
pub fn trace_vinsn(vinsn: &VInsn) {
    match vinsn {
        VInsn::Enter(context) | VInsn::Exit(context) => {
            for insn in context {
                info!("{insn}");
            }
            if vinsn.is_exit() {
                info!("ret");
            }
        }
        _ => info!("{vinsn}"),
    }
}

/// Checks for `mov reg, reg` (including the extending forms).
#[must_use]
pub fn op_mov_register_register(insn: &Instruction) -> bool {
    is_mov(insn) && insn.op0_kind() == OpKind::Register && insn.op1_kind() == OpKind::Register
}

/// Checks for `mov reg, [mem]` (including the extending forms).
#[must_use]
pub fn op_mov_register_memory(insn: &Instruction) -> bool {
    is_mov(insn) && insn.op0_kind() == OpKind::Register && insn.op1_kind() == OpKind::Memory
}

/// Checks for `mov [mem], reg` (including the extending forms).
#[must_use]
pub fn op_mov_memory_register(insn: &Instruction) -> bool {
    is_mov(insn) && insn.op0_kind() == OpKind::Memory && insn.op1_kind() == OpKind::Register
}

fn is_mov(insn: &Instruction) -> bool {
    matches!(
        insn.mnemonic(),
        Mnemonic::Mov | Mnemonic::Movzx | Mnemonic::Movsx
    )
}

/// Checks for `pop reg`.
#[must_use]
pub fn op_pop_register(insn: &Instruction) -> bool {
    insn.mnemonic() == Mnemonic::Pop && insn.op0_kind() == OpKind::Register
}

/// Checks for a flags pop.
#[must_use]
pub fn op_pop_flags(insn: &Instruction) -> bool {
    matches!(insn.mnemonic(), Mnemonic::Popfq | Mnemonic::Popfd)
}

/// Checks for the `lea reg, [rip - 7]` self-reference the jmp handler
/// carries.
#[must_use]
pub fn op_lea_rip(insn: &Instruction) -> bool {
    insn.mnemonic() == Mnemonic::Lea
        && matches!(insn.memory_base(), Register::RIP | Register::EIP)
        && insn.memory_displacement64() == insn.next_ip().wrapping_sub(7)
}

/// Checks for `ret`.
#[must_use]
pub fn op_ret(insn: &Instruction) -> bool {
    insn.mnemonic() == Mnemonic::Ret
}

/// Formats a native instruction stream for diagnostics.
#[must_use]
pub fn format_stream(stream: &[Instruction]) -> String {
    stream.iter().map(|insn| format!("0x{:x}: {insn}", insn.ip())).join("\n")
}
