//! Connection core errors.

use thiserror::Error as ThisError;

/// User-facing error kinds of the connection core.
///
/// Driver-level `(kind, code)` pairs collapse onto the nearest of these
/// before they reach a caller.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Arguments have the wrong shape or type.
    #[error("invalid arguments")]
    InvalidArguments,

    /// Arguments are well-formed but carry an invalid value.
    #[error("invalid format")]
    InvalidFormat,

    /// The referenced object does not exist.
    #[error("not found")]
    NotFound,

    /// The packet service is not attached.
    #[error("not attached")]
    NotAttached,

    /// An attach transition is currently in flight.
    #[error("attach in progress")]
    AttachInProgress,

    /// Another request is outstanding.
    #[error("busy")]
    Busy,

    /// The object is active and read-only.
    #[error("in use")]
    InUse,

    /// The operation is not allowed in the current state.
    #[error("not allowed")]
    NotAllowed,

    /// No back-end implements the operation.
    #[error("not implemented")]
    NotImplemented,

    /// The operation failed.
    #[error("failed")]
    Failed,
}

/// Error class reported by a modem back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Mobile-equipment error (`+CME ERROR`).
    Cme,
    /// Message-service error (`+CMS ERROR`).
    Cms,
    /// Untyped failure.
    Failure,
}

/// Error reported by a modem back-end operation.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
#[error("driver error {kind:?} code {code}")]
pub struct DriverError {
    /// Error class.
    pub kind: DriverErrorKind,
    /// Vendor or standard numeric code within the class.
    pub code: i32,
}

impl DriverError {
    /// Untyped failure without a code.
    pub fn failure() -> Self {
        Self {
            kind: DriverErrorKind::Failure,
            code: 0,
        }
    }
}

impl From<DriverError> for Error {
    fn from(_: DriverError) -> Self {
        Error::Failed
    }
}
