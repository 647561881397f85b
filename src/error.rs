//! Unified error types for the RackCtl firmware.
//!
//! Every public operation of the control plane returns [`Result`]. The
//! API dispatcher maps [`Error`] onto the wire result codes via
//! [`Error::api_code`], so subsystems never build envelopes themselves.
//! All variants are `Copy` so they can be passed across lock boundaries
//! and stored in status snapshots without allocation.

use core::fmt;

use crate::api::result::ApiCode;
use crate::app::ports::{ConfigError, HwError, StorageError};

// ---------------------------------------------------------------------------
// Top-level firmware error
// ---------------------------------------------------------------------------

/// Every fallible operation in the control plane funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Caller supplied a malformed or out-of-range parameter.
    /// The message names the offending field.
    InvalidArg(&'static str),
    /// Named resource is absent (endpoint, provider, fan slot).
    NotFound,
    /// Operation is illegal in the current state.
    InvalidState,
    /// Underlying driver call failed.
    Hardware(HwError),
    /// Persistent storage failed.
    Storage(StorageError),
    /// A bounded wait elapsed.
    Timeout,
    /// Resource busy (queue full, lock contended).
    Busy,
    /// Operation does not apply to this target (e.g. recovery on the LPMU).
    NotSupported,
    /// Invariant violation or resource exhaustion.
    Internal(&'static str),
    /// Authentication required but absent.
    Unauthorized,
    /// Authenticated principal lacks the required permission.
    Forbidden,
}

impl Error {
    /// Absent record or resource, from either the control plane or storage.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound | Self::Storage(StorageError::NotFound))
    }

    /// Wire result code for this error.
    pub fn api_code(&self) -> ApiCode {
        match self {
            Self::InvalidArg(_) => ApiCode::InvalidArg,
            Self::NotFound => ApiCode::NotFound,
            Self::InvalidState => ApiCode::InvalidState,
            Self::Hardware(_) => ApiCode::Hardware,
            Self::Storage(StorageError::NotFound) => ApiCode::NotFound,
            Self::Storage(StorageError::Full) => ApiCode::NoMem,
            Self::Storage(_) => ApiCode::Hardware,
            Self::Timeout => ApiCode::Timeout,
            Self::Busy => ApiCode::Busy,
            Self::NotSupported => ApiCode::NotSupported,
            Self::Internal(_) => ApiCode::Internal,
            Self::Unauthorized => ApiCode::Unauthorized,
            Self::Forbidden => ApiCode::Forbidden,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArg(msg) => write!(f, "invalid argument: {msg}"),
            Self::NotFound => write!(f, "not found"),
            Self::InvalidState => write!(f, "invalid state"),
            Self::Hardware(e) => write!(f, "hardware: {e}"),
            Self::Storage(e) => write!(f, "storage: {e}"),
            Self::Timeout => write!(f, "timeout"),
            Self::Busy => write!(f, "busy"),
            Self::NotSupported => write!(f, "not supported"),
            Self::Internal(msg) => write!(f, "internal: {msg}"),
            Self::Unauthorized => write!(f, "authentication required"),
            Self::Forbidden => write!(f, "permission denied"),
        }
    }
}

impl From<HwError> for Error {
    fn from(e: HwError) -> Self {
        Self::Hardware(e)
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::NotFound => Self::NotFound,
            ConfigError::Corrupted => Self::Internal("stored config corrupted"),
            ConfigError::ValidationFailed(msg) => Self::InvalidArg(msg),
            ConfigError::Storage(e) => Self::Storage(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Firmware-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
