//! This module contains the concrete/symbolic x86 emulator the tracer runs
//! the VM interpreter on.
//!
//! Execution is always concrete: every register and memory byte has a real
//! value, with instruction bytes served lazily from the binary [`Image`].
//! Symbolic expression trees ([`ast::Expr`]) ride along for the locations
//! the tracer symbolizes, so that classification can pattern-match how a
//! handler computed a value without ever giving up the concrete path.
//!
//! The supported instruction subset is the one VMProtect handler bodies are
//! built from. Anything outside it surfaces as an
//! [`crate::error::tracing::Error::UnsupportedInstruction`] so that the
//! session dies with the offending disassembly rather than silently
//! diverging.

pub mod ast;

use std::collections::HashMap;

use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};

use crate::{
    constant::DECODE_WINDOW_BYTES,
    emu::ast::{BinOp, Expr, ExprRef, UnaryOp, VarRef, Variable},
    error::{
        fault::FaultSite,
        tracing::{Error, Result},
    },
    image::SharedImage,
};

/// The 64-bit general-purpose registers in the order the emulator stores
/// them. The 32-bit set is the first eight entries.
const GPR64: [Register; 16] = [
    Register::RAX,
    Register::RBX,
    Register::RCX,
    Register::RDX,
    Register::RDI,
    Register::RSI,
    Register::RSP,
    Register::RBP,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

/// Flag bit positions within the native flags word.
const FLAG_CF: u32 = 0;
const FLAG_PF: u32 = 2;
const FLAG_AF: u32 = 4;
const FLAG_ZF: u32 = 6;
const FLAG_SF: u32 = 7;
const FLAG_OF: u32 = 11;

/// Gets the lowercase name of a register, as used for classification labels
/// and for naming block-function arguments.
#[must_use]
pub fn register_name(reg: Register) -> String {
    format!("{reg:?}").to_lowercase()
}

/// Resolves a register from its lowercase name.
#[must_use]
pub fn register_by_name(name: &str) -> Option<Register> {
    GPR64
        .into_iter()
        .find(|reg| register_name(*reg) == name)
        .or_else(|| {
            [
                Register::EAX,
                Register::EBX,
                Register::ECX,
                Register::EDX,
                Register::EDI,
                Register::ESI,
                Register::ESP,
                Register::EBP,
            ]
            .into_iter()
            .find(|reg| register_name(*reg) == name)
        })
}

/// Locates a general-purpose register within the emulator's register file:
/// the slot index of its full register, its width in bits, and the bit shift
/// of its low end (8 for the high-byte registers).
fn locate(reg: Register) -> Option<(usize, u32, u32)> {
    if !reg.is_gpr() {
        return None;
    }
    let full = reg.full_register();
    let slot = GPR64.iter().position(|r| *r == full)?;
    let bits = u32::try_from(reg.size() * 8).ok()?;
    let shift = match reg {
        Register::AH | Register::BH | Register::CH | Register::DH => 8,
        _ => 0,
    };
    Some((slot, bits, shift))
}

/// The concrete/symbolic machine state.
///
/// Cloning an emulator is the fork operation: the clone owns independent
/// register and memory state while sharing the immutable binary image.
#[derive(Clone)]
pub struct Emulator {
    /// The binary image backing the address space.
    image: SharedImage,

    /// Whether the machine executes in 64-bit mode.
    x64: bool,

    /// Concrete values of the full-width general-purpose registers.
    regs: [u64; 16],

    /// Symbolic expressions of the full-width registers; [`None`] where the
    /// register currently holds a purely concrete value.
    reg_exprs: [Option<ExprRef>; 16],

    /// The concrete instruction pointer.
    rip: u64,

    /// The symbolic expression of the instruction pointer, if any.
    rip_expr: Option<ExprRef>,

    /// The concrete native flags word.
    rflags: u64,

    /// The concrete memory overlay; bytes absent here read through to the
    /// image and default to zero outside it.
    memory: HashMap<u64, u8>,

    /// The symbolic memory overlay, one 8-bit expression per touched byte.
    sym_memory: HashMap<u64, ExprRef>,

    /// The id the next minted symbolic variable receives.
    next_variable: u64,
}

impl std::fmt::Debug for Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emulator")
            .field("x64", &self.x64)
            .field("rip", &format_args!("0x{:x}", self.rip))
            .finish_non_exhaustive()
    }
}

impl Emulator {
    /// Constructs a new emulator over the provided binary `image`, with all
    /// registers and flags zeroed.
    #[must_use]
    pub fn new(image: SharedImage) -> Self {
        let x64 = image.is_x64();
        Self {
            image,
            x64,
            regs: [0; 16],
            reg_exprs: Default::default(),
            rip: 0,
            rip_expr: None,
            rflags: 0x202,
            memory: HashMap::new(),
            sym_memory: HashMap::new(),
            next_variable: 0,
        }
    }

    /// Checks whether the machine executes in 64-bit mode.
    #[must_use]
    pub fn is_x64(&self) -> bool {
        self.x64
    }

    /// Gets a shared handle to the binary image backing the address space.
    #[must_use]
    pub fn image(&self) -> SharedImage {
        self.image.clone()
    }

    /// Gets the pointer width of the machine in bytes.
    #[must_use]
    pub fn ptr_size(&self) -> u64 {
        if self.x64 {
            8
        } else {
            4
        }
    }

    /// Gets the general-purpose registers of the machine in their canonical
    /// order.
    #[must_use]
    pub fn gprs(&self) -> Vec<Register> {
        if self.x64 {
            GPR64.to_vec()
        } else {
            GPR64[..8]
                .iter()
                .map(|reg| match reg {
                    Register::RAX => Register::EAX,
                    Register::RBX => Register::EBX,
                    Register::RCX => Register::ECX,
                    Register::RDX => Register::EDX,
                    Register::RDI => Register::EDI,
                    Register::RSI => Register::ESI,
                    Register::RSP => Register::ESP,
                    _ => Register::EBP,
                })
                .collect()
        }
    }

    /// Gets the stack pointer register for the machine mode.
    #[must_use]
    pub fn rsp_register(&self) -> Register {
        if self.x64 {
            Register::RSP
        } else {
            Register::ESP
        }
    }

    /// Gets the concrete instruction pointer.
    #[must_use]
    pub fn rip(&self) -> u64 {
        self.rip
    }

    /// Sets the concrete instruction pointer and drops any symbolic
    /// expression attached to it.
    pub fn set_rip(&mut self, value: u64) {
        self.rip = value;
        self.rip_expr = None;
    }

    /// Gets the symbolic expression of the instruction pointer, if any.
    #[must_use]
    pub fn rip_expr(&self) -> Option<ExprRef> {
        self.rip_expr.clone()
    }

    /// Checks whether the instruction pointer currently carries a symbolic
    /// expression.
    #[must_use]
    pub fn is_rip_symbolized(&self) -> bool {
        self.rip_expr.is_some()
    }

    /// Gets the concrete stack pointer.
    #[must_use]
    pub fn rsp(&self) -> u64 {
        self.read_reg(self.rsp_register())
    }

    /// Reads the concrete value of `reg` at its architectural width.
    ///
    /// # Panics
    ///
    /// Panics if `reg` is not a general-purpose register. That is a
    /// programmer bug in the caller.
    #[must_use]
    pub fn read_reg(&self, reg: Register) -> u64 {
        let (slot, bits, shift) = locate(reg).expect("Register must be general-purpose");
        ast::mask(self.regs[slot] >> shift, bits)
    }

    /// Writes the concrete `value` to `reg`, dropping symbolic state for the
    /// written bits.
    ///
    /// # Panics
    ///
    /// Panics if `reg` is not a general-purpose register. That is a
    /// programmer bug in the caller.
    pub fn write_reg(&mut self, reg: Register, value: u64) {
        self.write_reg_with_expr(reg, value, None);
    }

    /// Writes `value` to `reg` together with an optional symbolic expression
    /// of the written width.
    ///
    /// A 32-bit write zeroes the upper half of the full register; narrower
    /// writes merge into the existing register contents, building the
    /// extract/concat shapes the classification matchers expect.
    pub fn write_reg_with_expr(&mut self, reg: Register, value: u64, expr: Option<ExprRef>) {
        let (slot, bits, shift) = locate(reg).expect("Register must be general-purpose");
        let value = ast::mask(value, bits);

        // Concrete update.
        let old = self.regs[slot];
        self.regs[slot] = match (bits, shift) {
            (64, _) => value,
            (32, _) => value,
            (bits, shift) => {
                let field = ast::mask(u64::MAX, bits) << shift;
                (old & !field) | (value << shift)
            }
        };

        // Symbolic update. When neither the write nor the preserved bits are
        // symbolic the register goes back to purely concrete state.
        let written = expr.unwrap_or_else(|| Expr::constant(value, bits));
        let full = match (bits, shift) {
            (64, _) => written,
            (32, _) => Expr::zext(64, written),
            (16, _) => Expr::concat(self.slice_expr(slot, old, 63, 16), written),
            (8, 0) => Expr::concat(self.slice_expr(slot, old, 63, 8), written),
            _ => Expr::concat(
                Expr::concat(self.slice_expr(slot, old, 63, 16), written),
                self.slice_expr(slot, old, 7, 0),
            ),
        };
        self.reg_exprs[slot] = if full.is_concrete() { None } else { Some(full) };
    }

    /// Gets a bit slice of a register's previous contents as an expression.
    fn slice_expr(&self, slot: usize, old: u64, hi: u32, lo: u32) -> ExprRef {
        let full = self.reg_exprs[slot]
            .clone()
            .unwrap_or_else(|| Expr::constant(old, 64));
        Expr::extract(hi, lo, full)
    }

    /// Gets the symbolic expression of `reg` at its architectural width, or
    /// [`None`] if the register is purely concrete.
    #[must_use]
    pub fn reg_expr_opt(&self, reg: Register) -> Option<ExprRef> {
        let (slot, bits, shift) = locate(reg)?;
        let full = self.reg_exprs[slot].clone()?;
        Some(Expr::extract(shift + bits - 1, shift, full))
    }

    /// Gets the symbolic expression of `reg`, falling back to a constant of
    /// its concrete value.
    #[must_use]
    pub fn reg_expr(&self, reg: Register) -> ExprRef {
        self.reg_expr_opt(reg)
            .unwrap_or_else(|| Expr::constant(self.read_reg(reg), reg_bits(reg)))
    }

    /// Checks whether `reg` currently carries symbolic state.
    #[must_use]
    pub fn is_reg_symbolized(&self, reg: Register) -> bool {
        self.reg_expr_opt(reg).is_some()
    }

    /// Replaces the contents of `reg` with a fresh symbolic variable under
    /// `alias`, preserving the concrete value as the variable's backing.
    pub fn symbolize_reg(&mut self, reg: Register, alias: &str) -> VarRef {
        let backing = self.read_reg(reg);
        let variable = Variable::new(self.next_variable, alias, reg_bits(reg), backing);
        self.next_variable += 1;
        self.write_reg_with_expr(reg, backing, Some(Expr::var(variable.clone())));
        variable
    }

    /// Reads `len` concrete bytes starting at `addr`.
    ///
    /// Bytes the emulated program has not written read through to the binary
    /// image; addresses outside any section read as zero.
    #[must_use]
    pub fn read_bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(len);
        for i in 0..len {
            let address = addr.wrapping_add(i as u64);
            let byte = self.memory.get(&address).copied().unwrap_or_else(|| {
                self.image
                    .bytes(address, 1)
                    .map_or(0, |raw| raw.first().copied().unwrap_or(0))
            });
            bytes.push(byte);
        }
        bytes
    }

    /// Reads a little-endian concrete value of `size` bytes at `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `size` exceeds eight bytes. That is a programmer bug.
    #[must_use]
    pub fn read_mem(&self, addr: u64, size: usize) -> u64 {
        assert!(size <= 8, "Memory reads are at most one word");
        let mut value = 0u64;
        for (i, byte) in self.read_bytes(addr, size).into_iter().enumerate() {
            value |= u64::from(byte) << (8 * i);
        }
        value
    }

    /// Writes the little-endian concrete `value` of `size` bytes to `addr`,
    /// dropping symbolic state for the written bytes.
    pub fn write_mem(&mut self, addr: u64, size: usize, value: u64) {
        self.write_mem_with_expr(addr, size, value, None);
    }

    /// Writes `value` to `addr` together with an optional symbolic
    /// expression of the written width.
    pub fn write_mem_with_expr(
        &mut self,
        addr: u64,
        size: usize,
        value: u64,
        expr: Option<ExprRef>,
    ) {
        for i in 0..size {
            let address = addr.wrapping_add(i as u64);
            let byte = ast::mask(value >> (8 * i), 8) as u8;
            self.memory.insert(address, byte);
            match &expr {
                Some(expr) => {
                    let i = u32::try_from(i).expect("Write sizes fit in u32");
                    let slice = Expr::extract(8 * i + 7, 8 * i, expr.clone());
                    if slice.is_concrete() {
                        self.sym_memory.remove(&address);
                    } else {
                        self.sym_memory.insert(address, slice);
                    }
                }
                None => {
                    self.sym_memory.remove(&address);
                }
            }
        }
    }

    /// Gets the symbolic expression of the `size` bytes at `addr`, or
    /// [`None`] when the range is purely concrete.
    ///
    /// Adjacent byte slices of one expression re-fuse on concatenation, so a
    /// full-width reload of a symbolized store surfaces the stored
    /// expression itself.
    #[must_use]
    pub fn mem_expr_opt(&self, addr: u64, size: usize) -> Option<ExprRef> {
        let symbolic = (0..size)
            .any(|i| self.sym_memory.contains_key(&addr.wrapping_add(i as u64)));
        if !symbolic {
            return None;
        }
        let byte_expr = |i: usize| {
            let address = addr.wrapping_add(i as u64);
            self.sym_memory.get(&address).cloned().unwrap_or_else(|| {
                Expr::constant(u64::from(self.read_bytes(address, 1)[0]), 8)
            })
        };
        let mut expr = byte_expr(size - 1);
        for i in (0..size - 1).rev() {
            expr = Expr::concat(expr, byte_expr(i));
        }
        Some(expr)
    }

    /// Computes the concrete effective address of the memory operand of
    /// `insn`.
    #[must_use]
    pub fn lea_concrete(&self, insn: &Instruction) -> u64 {
        if insn.memory_base() == Register::RIP || insn.memory_base() == Register::EIP {
            return insn.memory_displacement64();
        }
        let mut addr = insn.memory_displacement64();
        if insn.memory_base() != Register::None {
            addr = addr.wrapping_add(self.read_reg(insn.memory_base()));
        }
        if insn.memory_index() != Register::None {
            let index = self.read_reg(insn.memory_index());
            addr = addr.wrapping_add(index.wrapping_mul(u64::from(insn.memory_index_scale())));
        }
        addr
    }

    /// Builds the symbolic expression of the memory operand's effective
    /// address, mirroring the lea computation over the current register
    /// expressions.
    #[must_use]
    pub fn lea_expr(&self, insn: &Instruction) -> ExprRef {
        if insn.memory_base() == Register::RIP || insn.memory_base() == Register::EIP {
            return Expr::constant(insn.memory_displacement64(), 64);
        }
        let mut expr = Expr::constant(insn.memory_displacement64(), 64);
        if insn.memory_index() != Register::None {
            let index = Expr::zext(64, self.reg_expr(insn.memory_index()));
            let scaled = Expr::binary(
                BinOp::Mul,
                index,
                Expr::constant(u64::from(insn.memory_index_scale()), 64),
            );
            expr = Expr::binary(BinOp::Add, scaled, expr);
        }
        if insn.memory_base() != Register::None {
            let base = Expr::zext(64, self.reg_expr(insn.memory_base()));
            expr = Expr::binary(BinOp::Add, base, expr);
        }
        expr
    }

    /// Decodes the instruction at the current instruction pointer.
    ///
    /// # Errors
    ///
    /// Returns [`Err`] if no valid instruction can be decoded at `rip`.
    pub fn disassemble(&self) -> Result<Instruction> {
        let bytes = self.read_bytes(self.rip, DECODE_WINDOW_BYTES);
        let bitness = if self.x64 { 64 } else { 32 };
        let mut decoder = Decoder::with_ip(bitness, &bytes, self.rip, DecoderOptions::NONE);
        let insn = decoder.decode();
        if insn.is_invalid() {
            return Err(Error::UnmappedInstruction.at(self.rip));
        }
        Ok(insn)
    }

    /// Decodes and executes one instruction, returning it.
    pub fn single_step(&mut self) -> Result<Instruction> {
        let insn = self.disassemble()?;
        self.execute(&insn)?;
        Ok(insn)
    }

    /// Executes one decoded instruction, updating concrete state and the
    /// symbolic expressions of every written location.
    pub fn execute(&mut self, insn: &Instruction) -> Result<()> {
        use Mnemonic as M;
        match insn.mnemonic() {
            M::Mov | M::Movzx | M::Movsx | M::Movsxd => self.exec_mov(insn),
            M::Lea => self.exec_lea(insn),
            M::Add | M::Sub | M::And | M::Or | M::Xor => self.exec_binary(insn),
            M::Inc | M::Dec | M::Not | M::Neg => self.exec_unary(insn),
            M::Shl | M::Shr | M::Sar | M::Rol | M::Ror => self.exec_shift(insn),
            M::Shld | M::Shrd => self.exec_double_shift(insn),
            M::Push => self.exec_push(insn),
            M::Pop => self.exec_pop(insn),
            M::Pushfq | M::Pushfd => {
                self.exec_pushf();
                self.finish(insn);
                Ok(())
            }
            M::Popfq | M::Popfd => {
                self.exec_popf();
                self.finish(insn);
                Ok(())
            }
            M::Xchg => self.exec_xchg(insn),
            M::Cmp | M::Test => self.exec_compare(insn),
            M::Ret => self.exec_ret(insn),
            M::Jmp => self.exec_jmp(insn),
            M::Call => self.exec_call(insn),
            M::Nop => {
                self.finish(insn);
                Ok(())
            }
            M::Je | M::Jne | M::Jb | M::Jae | M::Ja | M::Jbe | M::Jl | M::Jge | M::Jle
            | M::Jg | M::Js | M::Jns | M::Jo | M::Jno | M::Jp | M::Jnp => {
                self.exec_jcc(insn);
                Ok(())
            }
            _ => Err(Error::UnsupportedInstruction {
                disassembly: format!("{insn}"),
            }
            .at(insn.ip())),
        }
    }

    /// Advances the instruction pointer past a non-branch instruction.
    fn finish(&mut self, insn: &Instruction) {
        self.set_rip(insn.next_ip());
    }

    /// Reads operand `index` of `insn` as a concrete value with its width in
    /// bits and its symbolic expression where one exists.
    fn read_operand(
        &self,
        insn: &Instruction,
        index: u32,
    ) -> Result<(u64, u32, Option<ExprRef>)> {
        match insn.op_kind(index) {
            OpKind::Register => {
                let reg = insn.op_register(index);
                Ok((self.read_reg(reg), reg_bits(reg), self.reg_expr_opt(reg)))
            }
            OpKind::Memory => {
                let addr = self.lea_concrete(insn);
                let size = insn.memory_size().size();
                let bits = u32::try_from(size * 8).expect("Memory sizes fit in u32");
                Ok((
                    self.read_mem(addr, size),
                    bits,
                    self.mem_expr_opt(addr, size),
                ))
            }
            OpKind::Immediate8
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => {
                // The immediate is reported at the width of the destination.
                let bits = operand_bits(insn, 0);
                Ok((ast::mask(insn.immediate(index), bits), bits, None))
            }
            _ => Err(Error::UnsupportedInstruction {
                disassembly: format!("{insn}"),
            }
            .at(insn.ip())),
        }
    }

    /// Writes operand `index` of `insn` with a value and an optional
    /// symbolic expression.
    fn write_operand(
        &mut self,
        insn: &Instruction,
        index: u32,
        value: u64,
        expr: Option<ExprRef>,
    ) -> Result<()> {
        match insn.op_kind(index) {
            OpKind::Register => {
                self.write_reg_with_expr(insn.op_register(index), value, expr);
                Ok(())
            }
            OpKind::Memory => {
                let addr = self.lea_concrete(insn);
                let size = insn.memory_size().size();
                self.write_mem_with_expr(addr, size, value, expr);
                Ok(())
            }
            _ => Err(Error::UnsupportedInstruction {
                disassembly: format!("{insn}"),
            }
            .at(insn.ip())),
        }
    }

    fn exec_mov(&mut self, insn: &Instruction) -> Result<()> {
        let (value, bits, expr) = self.read_operand(insn, 1)?;
        let dst_bits = operand_bits(insn, 0);
        let (value, expr) = match insn.mnemonic() {
            Mnemonic::Movzx => (value, expr.map(|e| Expr::zext(dst_bits, e))),
            Mnemonic::Movsx | Mnemonic::Movsxd => (
                ast::mask(((value << (64 - bits)) as i64 >> (64 - bits)) as u64, dst_bits),
                expr.map(|e| Expr::sext(dst_bits, e)),
            ),
            _ => (value, expr),
        };
        self.write_operand(insn, 0, value, expr)?;
        self.finish(insn);
        Ok(())
    }

    fn exec_lea(&mut self, insn: &Instruction) -> Result<()> {
        let addr = self.lea_concrete(insn);
        let expr = self.lea_expr(insn);
        let bits = operand_bits(insn, 0);
        let expr = if expr.is_concrete() {
            None
        } else {
            Some(Expr::extract(bits - 1, 0, expr))
        };
        self.write_operand(insn, 0, ast::mask(addr, bits), expr)?;
        self.finish(insn);
        Ok(())
    }

    fn exec_binary(&mut self, insn: &Instruction) -> Result<()> {
        let (a, bits, a_expr) = self.read_operand(insn, 0)?;
        let (b, _, b_expr) = self.read_operand(insn, 1)?;
        let b = ast::mask(b, bits);

        let (op, result) = match insn.mnemonic() {
            Mnemonic::Add => (BinOp::Add, ast::mask(a.wrapping_add(b), bits)),
            Mnemonic::Sub => (BinOp::Sub, ast::mask(a.wrapping_sub(b), bits)),
            Mnemonic::And => (BinOp::And, a & b),
            Mnemonic::Or => (BinOp::Or, a | b),
            _ => (BinOp::Xor, a ^ b),
        };
        match op {
            BinOp::Add => self.set_flags_add(a, b, result, bits),
            BinOp::Sub => self.set_flags_sub(a, b, result, bits),
            _ => self.set_flags_logic(result, bits),
        }

        let expr = if a_expr.is_some() || b_expr.is_some() {
            let lhs = a_expr.unwrap_or_else(|| Expr::constant(a, bits));
            let rhs = b_expr.unwrap_or_else(|| Expr::constant(b, bits));
            Some(Expr::binary(op, lhs, rhs))
        } else {
            None
        };
        self.write_operand(insn, 0, result, expr)?;
        self.finish(insn);
        Ok(())
    }

    fn exec_unary(&mut self, insn: &Instruction) -> Result<()> {
        let (a, bits, a_expr) = self.read_operand(insn, 0)?;
        let (result, expr) = match insn.mnemonic() {
            Mnemonic::Inc => {
                let result = ast::mask(a.wrapping_add(1), bits);
                self.set_flags_add(a, 1, result, bits);
                (
                    result,
                    a_expr.map(|e| Expr::binary(BinOp::Add, e, Expr::constant(1, bits))),
                )
            }
            Mnemonic::Dec => {
                let result = ast::mask(a.wrapping_sub(1), bits);
                self.set_flags_sub(a, 1, result, bits);
                (
                    result,
                    a_expr.map(|e| Expr::binary(BinOp::Sub, e, Expr::constant(1, bits))),
                )
            }
            Mnemonic::Not => (
                ast::mask(!a, bits),
                a_expr.map(|e| Expr::unary(UnaryOp::Not, e)),
            ),
            _ => {
                let result = ast::mask(a.wrapping_neg(), bits);
                self.set_flag(FLAG_CF, a != 0);
                self.set_zsp(result, bits);
                (result, a_expr.map(|e| Expr::unary(UnaryOp::Neg, e)))
            }
        };
        self.write_operand(insn, 0, result, expr)?;
        self.finish(insn);
        Ok(())
    }

    fn exec_shift(&mut self, insn: &Instruction) -> Result<()> {
        let (a, bits, a_expr) = self.read_operand(insn, 0)?;
        let (count, _, count_expr) = self.read_operand(insn, 1)?;
        let count_mask = if bits == 64 { 0x3f } else { 0x1f };
        let count = count & count_mask;

        let (op, result) = match insn.mnemonic() {
            Mnemonic::Shl => (
                BinOp::Shl,
                if count >= u64::from(bits) {
                    0
                } else {
                    ast::mask(a << count, bits)
                },
            ),
            Mnemonic::Shr => (
                BinOp::Lshr,
                if count >= u64::from(bits) {
                    0
                } else {
                    a >> count
                },
            ),
            Mnemonic::Sar => {
                let shifted = ((a << (64 - bits)) as i64 >> (64 - bits)) >> count.min(63);
                (BinOp::Ashr, ast::mask(shifted as u64, bits))
            }
            Mnemonic::Rol => (BinOp::Rol, rotate(a, count, bits, true)),
            _ => (BinOp::Ror, rotate(a, count, bits, false)),
        };
        if count != 0 {
            self.set_flags_shift(op, a, count, result, bits);
        }

        let expr = if a_expr.is_some() || count_expr.is_some() {
            let value = a_expr.unwrap_or_else(|| Expr::constant(a, bits));
            let amount = count_expr.unwrap_or_else(|| Expr::constant(count, 8));
            let amount = Expr::binary(
                BinOp::And,
                resize(amount, bits),
                Expr::constant(count_mask, bits),
            );
            Some(Expr::binary(op, value, amount))
        } else {
            None
        };
        self.write_operand(insn, 0, result, expr)?;
        self.finish(insn);
        Ok(())
    }

    fn exec_double_shift(&mut self, insn: &Instruction) -> Result<()> {
        let (a, bits, a_expr) = self.read_operand(insn, 0)?;
        let (b, _, b_expr) = self.read_operand(insn, 1)?;
        let (count, _, count_expr) = self.read_operand(insn, 2)?;
        let count_mask = if bits == 64 { 0x3f } else { 0x1f };
        let count = count & count_mask;
        let left = insn.mnemonic() == Mnemonic::Shld;

        // The handler semantics pack both operands into one double-width
        // value and rotate it, which is also the shape the classification
        // matchers look for.
        let packed = (u128::from(b) << bits) | u128::from(a);
        let rotated = if count == 0 {
            packed
        } else if left {
            (packed << count | packed >> (2 * u64::from(bits) - count)) & double_mask(bits)
        } else {
            (packed >> count | packed << (2 * u64::from(bits) - count)) & double_mask(bits)
        };
        let result = ast::mask(rotated as u64, bits);
        if count != 0 {
            self.set_zsp(result, bits);
        }

        let expr = if a_expr.is_some() || b_expr.is_some() || count_expr.is_some() {
            let dst = a_expr.unwrap_or_else(|| Expr::constant(a, bits));
            let src = b_expr.unwrap_or_else(|| Expr::constant(b, bits));
            let amount = count_expr.unwrap_or_else(|| Expr::constant(count, 8));
            let amount = Expr::zext(2 * bits, resize(amount, 8));
            let packed = Expr::concat(src, dst);
            let op = if left { BinOp::Rol } else { BinOp::Ror };
            Some(Expr::extract(
                bits - 1,
                0,
                Expr::binary(op, packed, amount),
            ))
        } else {
            None
        };
        self.write_operand(insn, 0, result, expr)?;
        self.finish(insn);
        Ok(())
    }

    fn exec_push(&mut self, insn: &Instruction) -> Result<()> {
        let (value, _, expr) = self.read_operand(insn, 0)?;
        let size = self.ptr_size();
        let rsp = self.rsp().wrapping_sub(size);
        self.write_reg(self.rsp_register(), rsp);
        self.write_mem_with_expr(rsp, size as usize, value, expr);
        self.finish(insn);
        Ok(())
    }

    fn exec_pop(&mut self, insn: &Instruction) -> Result<()> {
        let size = self.ptr_size();
        let rsp = self.rsp();
        let value = self.read_mem(rsp, size as usize);
        let expr = self.mem_expr_opt(rsp, size as usize);
        self.write_reg(self.rsp_register(), rsp.wrapping_add(size));
        self.write_operand(insn, 0, value, expr)?;
        self.finish(insn);
        Ok(())
    }

    fn exec_pushf(&mut self) {
        let size = self.ptr_size();
        let rsp = self.rsp().wrapping_sub(size);
        self.write_reg(self.rsp_register(), rsp);
        self.write_mem(rsp, size as usize, self.rflags);
    }

    fn exec_popf(&mut self) {
        let size = self.ptr_size();
        let rsp = self.rsp();
        self.rflags = self.read_mem(rsp, size as usize);
        self.write_reg(self.rsp_register(), rsp.wrapping_add(size));
    }

    fn exec_xchg(&mut self, insn: &Instruction) -> Result<()> {
        let (a, _, a_expr) = self.read_operand(insn, 0)?;
        let (b, _, b_expr) = self.read_operand(insn, 1)?;
        self.write_operand(insn, 0, b, b_expr)?;
        self.write_operand(insn, 1, a, a_expr)?;
        self.finish(insn);
        Ok(())
    }

    fn exec_compare(&mut self, insn: &Instruction) -> Result<()> {
        let (a, bits, _) = self.read_operand(insn, 0)?;
        let (b, _, _) = self.read_operand(insn, 1)?;
        let b = ast::mask(b, bits);
        if insn.mnemonic() == Mnemonic::Cmp {
            let result = ast::mask(a.wrapping_sub(b), bits);
            self.set_flags_sub(a, b, result, bits);
        } else {
            self.set_flags_logic(a & b, bits);
        }
        self.finish(insn);
        Ok(())
    }

    fn exec_ret(&mut self, insn: &Instruction) -> Result<()> {
        let size = self.ptr_size();
        let rsp = self.rsp();
        let target = self.read_mem(rsp, size as usize);
        let expr = self.mem_expr_opt(rsp, size as usize);
        let extra = if insn.op_count() > 0 {
            insn.immediate(0)
        } else {
            0
        };
        self.write_reg(self.rsp_register(), rsp.wrapping_add(size).wrapping_add(extra));
        self.rip = target;
        self.rip_expr = expr;
        Ok(())
    }

    fn exec_jmp(&mut self, insn: &Instruction) -> Result<()> {
        let (target, expr) = self.branch_target(insn)?;
        self.rip = target;
        self.rip_expr = expr;
        Ok(())
    }

    fn exec_call(&mut self, insn: &Instruction) -> Result<()> {
        let (target, expr) = self.branch_target(insn)?;
        let size = self.ptr_size();
        let rsp = self.rsp().wrapping_sub(size);
        self.write_reg(self.rsp_register(), rsp);
        self.write_mem(rsp, size as usize, insn.next_ip());
        self.rip = target;
        self.rip_expr = expr;
        Ok(())
    }

    fn exec_jcc(&mut self, insn: &Instruction) {
        let taken = self.condition(insn.mnemonic());
        if taken {
            self.set_rip(insn.near_branch_target());
        } else {
            self.finish(insn);
        }
    }

    /// Resolves the target of a `jmp`/`call` operand.
    fn branch_target(&self, insn: &Instruction) -> Result<(u64, Option<ExprRef>)> {
        match insn.op_kind(0) {
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Ok((insn.near_branch_target(), None))
            }
            OpKind::Register => {
                let reg = insn.op_register(0);
                Ok((self.read_reg(reg), self.reg_expr_opt(reg)))
            }
            OpKind::Memory => {
                let addr = self.lea_concrete(insn);
                let size = self.ptr_size() as usize;
                Ok((self.read_mem(addr, size), self.mem_expr_opt(addr, size)))
            }
            _ => Err(Error::UnsupportedInstruction {
                disassembly: format!("{insn}"),
            }
            .at(insn.ip())),
        }
    }

    /// Evaluates a conditional-jump predicate over the concrete flags.
    fn condition(&self, mnemonic: Mnemonic) -> bool {
        let flag = |bit: u32| self.rflags >> bit & 1 != 0;
        let (cf, zf, sf, of, pf) = (
            flag(FLAG_CF),
            flag(FLAG_ZF),
            flag(FLAG_SF),
            flag(FLAG_OF),
            flag(FLAG_PF),
        );
        match mnemonic {
            Mnemonic::Je => zf,
            Mnemonic::Jne => !zf,
            Mnemonic::Jb => cf,
            Mnemonic::Jae => !cf,
            Mnemonic::Ja => !cf && !zf,
            Mnemonic::Jbe => cf || zf,
            Mnemonic::Jl => sf != of,
            Mnemonic::Jge => sf == of,
            Mnemonic::Jle => zf || sf != of,
            Mnemonic::Jg => !zf && sf == of,
            Mnemonic::Js => sf,
            Mnemonic::Jns => !sf,
            Mnemonic::Jo => of,
            Mnemonic::Jno => !of,
            Mnemonic::Jp => pf,
            _ => !pf,
        }
    }

    /// Sets or clears one flag bit.
    fn set_flag(&mut self, bit: u32, value: bool) {
        if value {
            self.rflags |= 1 << bit;
        } else {
            self.rflags &= !(1 << bit);
        }
    }

    /// Sets the zero, sign and parity flags from `result`.
    fn set_zsp(&mut self, result: u64, bits: u32) {
        self.set_flag(FLAG_ZF, result == 0);
        self.set_flag(FLAG_SF, result >> (bits - 1) & 1 != 0);
        self.set_flag(FLAG_PF, (result & 0xff).count_ones() % 2 == 0);
    }

    fn set_flags_add(&mut self, a: u64, b: u64, result: u64, bits: u32) {
        let wide = u128::from(a) + u128::from(b);
        self.set_flag(FLAG_CF, wide >> bits != 0);
        self.set_flag(FLAG_AF, (a ^ b ^ result) >> 4 & 1 != 0);
        self.set_flag(FLAG_OF, ((a ^ result) & (b ^ result)) >> (bits - 1) & 1 != 0);
        self.set_zsp(result, bits);
    }

    fn set_flags_sub(&mut self, a: u64, b: u64, result: u64, bits: u32) {
        self.set_flag(FLAG_CF, a < b);
        self.set_flag(FLAG_AF, (a ^ b ^ result) >> 4 & 1 != 0);
        self.set_flag(FLAG_OF, ((a ^ b) & (a ^ result)) >> (bits - 1) & 1 != 0);
        self.set_zsp(result, bits);
    }

    fn set_flags_logic(&mut self, result: u64, bits: u32) {
        self.set_flag(FLAG_CF, false);
        self.set_flag(FLAG_OF, false);
        self.set_zsp(result, bits);
    }

    fn set_flags_shift(&mut self, op: BinOp, a: u64, count: u64, result: u64, bits: u32) {
        let cf = match op {
            BinOp::Shl => {
                count <= u64::from(bits) && a >> (u64::from(bits) - count) & 1 != 0
            }
            BinOp::Lshr | BinOp::Ashr => count <= 64 && a >> (count - 1) & 1 != 0,
            BinOp::Rol => result & 1 != 0,
            _ => result >> (bits - 1) & 1 != 0,
        };
        self.set_flag(FLAG_CF, cf);
        if matches!(op, BinOp::Shl | BinOp::Lshr | BinOp::Ashr) {
            self.set_zsp(result, bits);
        }
        if count == 1 {
            let of = match op {
                BinOp::Shl => (result >> (bits - 1) & 1 != 0) != cf,
                BinOp::Lshr => a >> (bits - 1) & 1 != 0,
                _ => false,
            };
            self.set_flag(FLAG_OF, of);
        }
    }
}

/// Gets the width of a register in bits.
fn reg_bits(reg: Register) -> u32 {
    u32::try_from(reg.size() * 8).expect("Register sizes fit in u32")
}

/// Gets the width in bits of operand `index` of `insn`.
fn operand_bits(insn: &Instruction, index: u32) -> u32 {
    match insn.op_kind(index) {
        OpKind::Register => reg_bits(insn.op_register(index)),
        OpKind::Memory => u32::try_from(insn.memory_size().size() * 8)
            .expect("Memory sizes fit in u32"),
        _ => 64,
    }
}

/// Rotates the `bits`-wide `value` by `count`.
fn rotate(value: u64, count: u64, bits: u32, left: bool) -> u64 {
    let width = u64::from(bits);
    let count = count % width;
    if count == 0 {
        return ast::mask(value, bits);
    }
    if left {
        ast::mask(value << count | value >> (width - count), bits)
    } else {
        ast::mask(value >> count | value << (width - count), bits)
    }
}

/// Widens or narrows `expr` to `bits`.
fn resize(expr: ExprRef, bits: u32) -> ExprRef {
    let size = expr.size();
    if size == bits {
        expr
    } else if size > bits {
        Expr::extract(bits - 1, 0, expr)
    } else {
        Expr::zext(bits, expr)
    }
}

/// Gets the mask of a double-width value.
fn double_mask(bits: u32) -> u128 {
    if bits >= 64 {
        u128::MAX
    } else {
        (1u128 << (2 * bits)) - 1
    }
}
