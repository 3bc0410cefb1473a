//! This module contains the fault wrapper: the pairing of an error with the
//! virtual address the devirtualizer was working at when it went wrong.
//!
//! Every fatal diagnostic names an address — the handler a classification
//! failed in, the block a branch could not be solved for — so the subsystem
//! error types stay address-free and pick their location up at the point of
//! failure through [`FaultSite::at`].

use std::fmt::{self, Formatter};

/// An error tagged with the virtual address it occurred at.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Fault<E> {
    /// The virtual address being processed when the error occurred.
    address: u64,

    /// The underlying error.
    cause: E,
}

impl<E> Fault<E> {
    /// Wraps `cause` with the virtual `address` it occurred at.
    #[must_use]
    pub fn new(address: u64, cause: E) -> Self {
        Self { address, cause }
    }

    /// Gets the virtual address the fault occurred at.
    #[must_use]
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Unwraps the fault back into its cause.
    #[must_use]
    pub fn into_cause(self) -> E {
        self.cause
    }
}

impl<E> fmt::Display for Fault<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}: {}", self.address, self.cause)
    }
}

impl<E> std::error::Error for Fault<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// The extension every subsystem error implements for attaching its fault
/// address.
pub trait FaultSite
where
    Self: Sized,
{
    /// Tags the error with the virtual `address` it occurred at.
    fn at(self, address: u64) -> Fault<Self> {
        Fault::new(address, self)
    }
}

impl<E> FaultSite for E where E: std::error::Error {}

#[cfg(test)]
mod test {
    use crate::error::{fault::FaultSite, tracing};

    #[test]
    fn faults_display_their_address_ahead_of_the_cause() {
        let fault = tracing::Error::UnclassifiedHandler.at(0x1400_1000);

        assert_eq!(fault.address(), 0x1400_1000);
        let rendered = format!("{fault}");
        assert!(rendered.starts_with("0x0000000014001000: "));
    }

    #[test]
    fn faults_expose_their_cause() {
        let fault = tracing::Error::JccStackPointerNotFound.at(0x2000);

        assert_eq!(fault.into_cause(), tracing::Error::JccStackPointerNotFound);
    }
}
