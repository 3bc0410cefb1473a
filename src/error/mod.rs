//! This module contains the primary error type for the devirtualizer's
//! interface. It also re-exports the more specific error types that are
//! subsystem-specific.
//!
//! # Anyhow
//!
//! All of the errors implement [`std::error::Error`], and hence can be used
//! with [`anyhow::Error`] internally. It is _not_ recommended to use that
//! error type in the interface of the library, as this forces clients to also
//! use `anyhow`.

pub mod fault;
pub mod image;
pub mod lifting;
pub mod solving;
pub mod tracing;

use std::sync::Arc;

use thiserror::Error;

/// The interface result type for the library.
///
/// # Usage
///
/// Any function considered to be part of the public interface of the library
/// should return this result type. Note that _all_ of the library is public
/// in order to facilitate use-cases beyond the ones designed for.
pub type Result<T> = std::result::Result<T, Error>;

/// The interface error type for the library.
///
/// All errors returned from the library interface (and hence encountered by
/// the clients of the library) should be members of this enum.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Errors that come from loading the protected binary.
    #[error(transparent)]
    Image(#[from] image::Error),

    /// Errors from the tracing and handler-classification subsystem.
    #[error(transparent)]
    Tracing(#[from] tracing::Fault),

    /// Errors from the lifting and IR subsystem.
    #[error(transparent)]
    Lifting(#[from] lifting::Error),

    /// Errors from branch target enumeration.
    #[error(transparent)]
    Solving(#[from] solving::Fault),

    /// Unknown errors, usually from the dependencies of the library.
    ///
    /// It is wrapped in an [`Arc`] to ensure that it can be cloned like the
    /// other error types in this interface error.
    #[error("{0}")]
    Other(Arc<anyhow::Error>),
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Self::Other(Arc::new(value))
    }
}

/// Allow simple conversions from faulted loader errors; the interface enum
/// carries the cause alone.
impl From<image::Fault> for Error {
    fn from(value: image::Fault) -> Self {
        Self::Image(value.into_cause())
    }
}

/// Allow simple conversions from faulted lifting errors; the interface enum
/// carries the cause alone.
impl From<lifting::Fault> for Error {
    fn from(value: lifting::Fault) -> Self {
        Self::Lifting(value.into_cause())
    }
}
