//! This module contains errors pertaining to opening the protected binary and
//! reading bytes out of its sections.

use std::sync::Arc;

use thiserror::Error;

use crate::error::fault;

/// Errors that occur while loading the protected binary or serving bytes from
/// it by virtual address.
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("Failed to open the binary at {path:?}: {message}")]
    Open { path: String, message: String },

    #[error("The binary is not a supported x86 or x86-64 executable")]
    UnsupportedArchitecture,

    #[error("The binary has a malformed section table: {message}")]
    MalformedSections { message: String },

    #[error("No section maps the virtual address 0x{address:x}")]
    NoSuchSection { address: u64 },

    #[error("Section data for 0x{address:x}:{size} is not present in the file")]
    BytesUnavailable { address: u64, size: usize },

    /// Errors surfaced by the PE parsing library.
    ///
    /// The underlying error is wrapped in an [`Arc`] so that the error remains
    /// cloneable like the rest of the error stack.
    #[error("{0}")]
    Pe(Arc<exe::Error>),
}

impl From<exe::Error> for Error {
    fn from(value: exe::Error) -> Self {
        Self::Pe(Arc::new(value))
    }
}

/// A loader error tagged with the virtual address that was being served.
pub type Fault = fault::Fault<Error>;

/// The result type for methods that may produce loader errors.
pub type Result<T> = std::result::Result<T, Error>;
