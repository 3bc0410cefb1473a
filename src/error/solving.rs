//! This module contains errors pertaining to branch target enumeration.

use thiserror::Error;

use crate::error::fault;

/// Errors that occur while the [`crate::solver`] enumerates the concrete
/// destinations of a computed branch.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("The branch resolves to more than {limit} targets; treating as an unsupported \
             indirect branch")]
    TooManyTargets { limit: usize },

    #[error("The IR value feeding the branch cannot be bridged to an expression: {reason}")]
    UnsupportedValue { reason: String },

    #[error("The solver was asked about a value that does not exist")]
    NoSuchValue,
}

/// A solving error tagged with the entry address of the block whose branch
/// was being enumerated.
pub type Fault = fault::Fault<Error>;

/// The result type for methods that may produce solving errors.
pub type Result<T> = std::result::Result<T, Error>;
