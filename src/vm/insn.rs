//! This module contains the typed representation of classified VM handlers:
//! the [`Operand`] variants a handler can move data between and the
//! [`VInsn`] variants the tracer emits.

use std::fmt::{self, Formatter};

/// The direction in which a conditional-branch handler adjusts the fetched
/// branch target before committing it to the virtual instruction pointer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JccDirection {
    /// The handler adds the branch step to the fetched target.
    Up,

    /// The handler subtracts the branch step from the fetched target.
    Down,
}

/// An operand of a stack-transfer handler.
///
/// All VM operations implicitly consume from and produce to the virtual
/// stack; the operand names the other end of a `Push`/`Pop` transfer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Operand {
    /// A concrete constant fetched from the bytecode stream.
    Immediate(u64),

    /// A native general-purpose register or the native flags word, by name.
    PhysicalRegister(String),

    /// A slot in the virtual register file, addressed by slot index and a
    /// byte offset within the slot.
    VirtualRegister { index: u32, offset: u32 },

    /// The virtual stack pointer itself.
    VirtualStackPointer,
}

impl Operand {
    /// Checks whether the operand is an immediate.
    #[must_use]
    pub fn is_immediate(&self) -> bool {
        matches!(self, Self::Immediate(_))
    }

    /// Checks whether the operand is a native register.
    #[must_use]
    pub fn is_physical(&self) -> bool {
        matches!(self, Self::PhysicalRegister(_))
    }

    /// Checks whether the operand is a virtual register file slot.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        matches!(self, Self::VirtualRegister { .. })
    }

    /// Checks whether the operand is the virtual stack pointer.
    #[must_use]
    pub fn is_vsp(&self) -> bool {
        matches!(self, Self::VirtualStackPointer)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate(value) => write!(f, "0x{value:016x}"),
            Self::PhysicalRegister(name) => write!(f, "{name}"),
            Self::VirtualRegister { index, offset } => {
                write!(f, "vmregs[{index:02}:{offset:02}]")
            }
            Self::VirtualStackPointer => write!(f, "vsp"),
        }
    }
}

/// A classified virtual instruction.
///
/// The arithmetic and transfer variants carry the bit size of their result
/// on the virtual stack. Operand and result sizes may disagree where the
/// handler semantics demand it; notably, 8-bit results occupy 16-bit stack
/// slots.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VInsn {
    /// Pop two values, push their sum and the resulting flags.
    Add(u32),

    /// Pop two values, push `!a & !b` and the resulting flags.
    Nor(u32),

    /// Pop two values, push `!a | !b` and the resulting flags.
    Nand(u32),

    /// Pop a value and a count, push the left shift and the flags.
    Shl(u32),

    /// Pop a value and a count, push the logical right shift and the flags.
    Shr(u32),

    /// Pop two values and a count, push the double-precision right shift and
    /// the flags.
    Shrd(u32),

    /// Pop two values and a count, push the double-precision left shift and
    /// the flags.
    Shld(u32),

    /// Pop an address, push the value loaded from it.
    Ldr(u32),

    /// Pop an address and a value, commit the value to memory.
    Str(u32),

    /// Push a value from `op` onto the virtual stack.
    Push { op: Operand, size: u32 },

    /// Pop a value off the virtual stack into `op`.
    Pop { op: Operand, size: u32 },

    /// Pop the new virtual instruction pointer off the virtual stack.
    Jmp,

    /// The pseudo-instruction closing a block after [`VInsn::Exit`].
    Ret,

    /// Pop the branch target and adjust it by the branch step in
    /// `direction`, rolling into a fresh handler table.
    Jcc {
        direction: JccDirection,
        vip_register: String,
        vsp_register: String,
    },

    /// Restore the native context and leave the VM. Carries the pops that
    /// restore the context in execution order.
    Exit(Vec<VInsn>),

    /// Enter the VM, pushing the initial native context. Carries the pushes
    /// in execution order.
    Enter(Vec<VInsn>),
}

impl VInsn {
    /// Constructs a `Push` of `op`.
    #[must_use]
    pub fn push(op: Operand, size: u32) -> Self {
        Self::Push { op, size }
    }

    /// Constructs a `Pop` into `op`.
    #[must_use]
    pub fn pop(op: Operand, size: u32) -> Self {
        Self::Pop { op, size }
    }

    /// Checks whether the instruction is a branch terminator.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(self, Self::Jmp | Self::Jcc { .. } | Self::Exit(_))
    }

    /// Checks whether the instruction is a conditional branch.
    #[must_use]
    pub fn is_jcc(&self) -> bool {
        matches!(self, Self::Jcc { .. })
    }

    /// Checks whether the instruction is an unconditional branch.
    #[must_use]
    pub fn is_jmp(&self) -> bool {
        matches!(self, Self::Jmp)
    }

    /// Checks whether the instruction leaves the VM.
    #[must_use]
    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Exit(_))
    }

    /// Checks whether the instruction enters the VM.
    #[must_use]
    pub fn is_enter(&self) -> bool {
        matches!(self, Self::Enter(_))
    }

    /// Checks whether the instruction pushes an immediate.
    #[must_use]
    pub fn is_push_imm(&self) -> bool {
        matches!(self, Self::Push { op, .. } if op.is_immediate())
    }
}

impl fmt::Display for VInsn {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add(size) => write!(f, "{:<5} {size:<2}", "add"),
            Self::Nor(size) => write!(f, "{:<5} {size:<2}", "nor"),
            Self::Nand(size) => write!(f, "{:<5} {size:<2}", "nand"),
            Self::Shl(size) => write!(f, "{:<5} {size:<2}", "shl"),
            Self::Shr(size) => write!(f, "{:<5} {size:<2}", "shr"),
            Self::Shrd(size) => write!(f, "{:<5} {size:<2}", "shrd"),
            Self::Shld(size) => write!(f, "{:<5} {size:<2}", "shld"),
            Self::Ldr(size) => write!(f, "{:<5} {size:<2}", "ldr"),
            Self::Str(size) => write!(f, "{:<5} {size:<2}", "str"),
            Self::Push { op, size } => write!(f, "{:<5} {size:<2} {op}", "push"),
            Self::Pop { op, size } => write!(f, "{:<5} {size:<2} {op}", "pop"),
            Self::Jmp => write!(f, "jmp"),
            Self::Ret => write!(f, "ret"),
            Self::Jcc { direction, .. } => {
                let arrow = match direction {
                    JccDirection::Up => "up",
                    JccDirection::Down => "down",
                };
                write!(f, "jcc {arrow}")
            }
            Self::Exit(context) => {
                for insn in context {
                    writeln!(f, "{insn}")?;
                }
                write!(f, "ret")
            }
            Self::Enter(context) => {
                let mut first = true;
                for insn in context {
                    if !first {
                        writeln!(f)?;
                    }
                    write!(f, "{insn}")?;
                    first = false;
                }
                Ok(())
            }
        }
    }
}
