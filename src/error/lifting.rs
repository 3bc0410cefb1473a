//! This module contains errors pertaining to the IR side of the pipeline: the
//! intrinsics module, block lifting, CFG assembly and IR verification.

use thiserror::Error;

use crate::error::fault;

/// Errors that occur while parsing the intrinsics module, lifting virtual
/// instructions into IR, or assembling and verifying IR functions.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("Failed to read the intrinsics module at {path:?}: {message}")]
    Read { path: String, message: String },

    #[error("Parse error at line {line} of the intrinsics module: {message}")]
    Parse { line: usize, message: String },

    #[error("The intrinsics module does not define the helper {name:?}")]
    MissingIntrinsic { name: String },

    #[error("No semantic function is registered under the name {name:?}")]
    MissingSemantic { name: String },

    #[error("The semantic pointer {name:?} does not resolve to a function")]
    UnresolvedSemantic { name: String },

    #[error("The block function has no argument named {name:?}")]
    MissingArgument { name: String },

    #[error("No call to KeepReturn was found in the function {function:?}")]
    MissingKeepReturn { function: String },

    #[error("A virtual register access of size {size} at sub-offset {offset} is not supported")]
    UnsupportedSubOffset { size: u32, offset: u32 },

    #[error("The block at 0x{vip:x} has {count} successors during assembly")]
    TooManySuccessors { vip: u64, count: usize },

    #[error("The function {function:?} has {count} exit blocks where one was expected")]
    MalformedExitBlocks { function: String, count: usize },

    #[error("IR verification failed in {function:?}: {message}")]
    Verifier { function: String, message: String },
}

/// A lifting error tagged with the entry address of the virtual basic block
/// being processed.
pub type Fault = fault::Fault<Error>;

/// The result type for methods that may produce lifting errors.
pub type Result<T> = std::result::Result<T, Error>;
