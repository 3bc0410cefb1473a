//! This module contains errors pertaining to the symbolic tracing and
//! classification of VM handlers.

use thiserror::Error;

use crate::error::fault;

/// Errors that occur while the [`crate::tracer::Tracer`] executes and
/// classifies VM handlers.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("The native instruction `{disassembly}` is not supported by the emulator")]
    UnsupportedInstruction { disassembly: String },

    #[error("No bytes could be fetched for the instruction at the current rip")]
    UnmappedInstruction,

    #[error(
        "No virtual registers were found during vmenter (vip found: {vip_found}, vsp found: \
         {vsp_found})"
    )]
    VirtualRegistersNotFound { vip_found: bool, vsp_found: bool },

    #[error("The vmenter context has {found} slots where {expected} were expected")]
    MalformedEnterContext { found: usize, expected: usize },

    #[error("The vmenter context slot at 0x{address:x} is symbolic but not a whole register")]
    MalformedContextSlot { address: u64 },

    #[error("The handler could not be classified into a virtual instruction")]
    UnclassifiedHandler,

    #[error("The store `{disassembly}` did not match any handler shape")]
    UnclassifiedStore { disassembly: String },

    #[error("No symbolic variable with alias {alias:?} was found in the expression")]
    NoSuchVariable { alias: String },

    #[error("No producer instruction is cached for the variable {alias:?}")]
    NoCachedProducer { alias: String },

    #[error("The comment {comment:?} of a virtual register variable did not parse")]
    MalformedVariableComment { comment: String },

    #[error("No stack access was found while recovering the vsp register after a jcc")]
    JccStackPointerNotFound,
}

/// A tracing error tagged with the address of the offending handler or
/// native instruction.
pub type Fault = fault::Fault<Error>;

/// The result type for methods that may produce tracing errors.
pub type Result<T> = std::result::Result<T, Fault>;
