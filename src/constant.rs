//! This module contains constants that are needed throughout the codebase.

/// The native stack base the tracer seeds `rsp` with before running a
/// `vmenter`.
///
/// The value only needs to be far away from any image section so that stack
/// traffic never shadows mapped bytes.
pub const STACK_BASE: u64 = 0x10000;

/// The number of general-purpose registers pushed by a 64-bit `vmenter`.
pub const PHYSICAL_REGISTERS_X64: usize = 16;

/// The number of general-purpose registers pushed by a 32-bit `vmenter`.
pub const PHYSICAL_REGISTERS_X86: usize = 8;

/// The number of extra slots in the `vmenter` context on top of the pushed
/// physical registers: two integers pushed before entering the VM and one
/// relocation pushed at the end.
pub const VMENTER_EXTRA_SLOTS: usize = 3;

/// The byte distance the `Jcc` handler family adds to or subtracts from the
/// fetched branch target before committing it to the virtual instruction
/// pointer.
pub const JCC_STEP: u64 = 4;

/// The number of native instructions the tracer speculatively executes past a
/// `Jcc` dispatch when recovering the rolled virtual stack pointer register.
pub const JCC_VSP_SCAN_LIMIT: usize = 10;

/// The number of bytes fetched ahead of `rip` when decoding a single native
/// instruction.
pub const DECODE_WINDOW_BYTES: usize = 16;

/// The maximum number of distinct targets the solver will enumerate for one
/// branch before declaring the branch unsupported.
///
/// A computed branch with more than two destinations is a jump table, which
/// is out of scope.
pub const SOLVER_MAXIMUM_TARGETS: usize = 2;

/// The maximum number of choice atoms the solver will enumerate over when
/// searching for branch-target models.
pub const SOLVER_MAXIMUM_ATOMS: usize = 8;

/// The number of no-progress iterations after which an optimization pipeline
/// run is considered exhausted.
pub const OPTIMIZER_MAXIMUM_IDLE_RUNS: usize = 5;
