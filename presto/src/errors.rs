//! Definition of errors.

use std::error::Error;
use std::fmt;

/// A specialized Result type for Presto.
pub type Result<T, E = PrestoError> = std::result::Result<T, E>;

/// The error type for Presto.
#[derive(Debug)]
pub enum PrestoError {
    /// The error variant for [`InvalidModelError`].
    InvalidModel(InvalidModelError),

    /// The error variant for [`InvalidArgumentError`].
    InvalidArgument(InvalidArgumentError),

    /// The error variant for [`FromUtf8Error`](std::string::FromUtf8Error).
    InvalidUtf8(std::string::FromUtf8Error),

    /// The error variant for reads through a handle whose resources have
    /// been released.
    AlreadyClosed,

    /// The error variant for [`MapFailedError`].
    MapFailed(MapFailedError),

    /// The error variant for end-of-file in the middle of a field.
    Truncated(TruncatedError),

    /// The error variant for [`std::io::Error`].
    StdIo(std::io::Error),
}

impl PrestoError {
    pub(crate) fn invalid_model<S>(msg: S) -> Self
    where
        S: Into<String>,
    {
        Self::InvalidModel(InvalidModelError { msg: msg.into() })
    }

    pub(crate) fn invalid_argument<S>(arg: &'static str, msg: S) -> Self
    where
        S: Into<String>,
    {
        Self::InvalidArgument(InvalidArgumentError {
            arg,
            msg: msg.into(),
        })
    }

    pub(crate) fn truncated(field: &'static str) -> Self {
        Self::Truncated(TruncatedError { field })
    }

    pub(crate) fn map_failed(source: std::io::Error) -> Self {
        Self::MapFailed(MapFailedError { source })
    }
}

impl fmt::Display for PrestoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidModel(e) => e.fmt(f),
            Self::InvalidArgument(e) => e.fmt(f),
            Self::InvalidUtf8(e) => e.fmt(f),
            Self::AlreadyClosed => write!(f, "AlreadyClosed: the handle has been closed"),
            Self::MapFailed(e) => e.fmt(f),
            Self::Truncated(e) => e.fmt(f),
            Self::StdIo(e) => e.fmt(f),
        }
    }
}

impl Error for PrestoError {}

/// Error used when a model file violates the format contract.
#[derive(Debug)]
pub struct InvalidModelError {
    /// Error message.
    pub(crate) msg: String,
}

impl fmt::Display for InvalidModelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "InvalidModelError: {}", self.msg)
    }
}

impl Error for InvalidModelError {}

/// Error used when the argument is invalid.
#[derive(Debug)]
pub struct InvalidArgumentError {
    /// Name of the argument.
    pub(crate) arg: &'static str,

    /// Error message.
    pub(crate) msg: String,
}

impl fmt::Display for InvalidArgumentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "InvalidArgumentError: {}: {}", self.arg, self.msg)
    }
}

impl Error for InvalidArgumentError {}

/// Error used when mapping a file into memory fails.
#[derive(Debug)]
pub struct MapFailedError {
    /// The underlying OS error.
    pub(crate) source: std::io::Error,
}

impl fmt::Display for MapFailedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "MapFailedError: {} (check address-space limits for large models)",
            self.source
        )
    }
}

impl Error for MapFailedError {}

/// Error used when EOF is reached in the middle of a field.
#[derive(Debug)]
pub struct TruncatedError {
    /// Name of the field being read.
    pub(crate) field: &'static str,
}

impl fmt::Display for TruncatedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TruncatedError: unexpected EOF while reading {}", self.field)
    }
}

impl Error for TruncatedError {}

impl From<std::string::FromUtf8Error> for PrestoError {
    fn from(error: std::string::FromUtf8Error) -> Self {
        Self::InvalidUtf8(error)
    }
}

impl From<std::io::Error> for PrestoError {
    fn from(error: std::io::Error) -> Self {
        Self::StdIo(error)
    }
}
