//! Error types for gdrcopy.

use thiserror::Error;

/// Result type alias using gdrcopy's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for gdrcopy operations.
///
/// Every error is raised synchronously by the call that violated its
/// contract. Nothing is retried internally.
#[derive(Error, Debug)]
pub enum Error {
    /// The driver library or its device node is not present.
    #[error("driver unavailable: {reason}")]
    DriverUnavailable {
        /// What was missing.
        reason: String,
    },

    /// The caller lacks access rights to the driver.
    #[error("permission denied: {reason}")]
    PermissionDenied {
        /// What was refused.
        reason: String,
    },

    /// `open()` was called on a session that is already open.
    #[error("session is already open")]
    AlreadyOpen,

    /// The owning session is closed (or was re-opened since the handle was made).
    #[error("session is closed")]
    SessionClosed,

    /// `close()` was called while regions are still pinned.
    #[error("cannot close session: {live_regions} region(s) still pinned")]
    ResourceLeak {
        /// Number of regions that must be unpinned first.
        live_regions: usize,
    },

    /// The driver rejected a request.
    #[error("driver rejected {op} (code {code})")]
    Driver {
        /// Name of the rejected driver operation.
        op: &'static str,
        /// The driver's native return code.
        code: i32,
    },

    /// Operation attempted from a state that does not permit it.
    #[error("{op} is not valid while region is {state}")]
    InvalidState {
        /// The attempted operation.
        op: &'static str,
        /// The state the region was in.
        state: &'static str,
    },

    /// Malformed size, address or flags.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A copy or map request exceeds the owning capacity.
    #[error("size mismatch: requested {requested} bytes, capacity is {capacity}")]
    SizeMismatch {
        /// Bytes requested (including any offset).
        requested: u64,
        /// Bytes available.
        capacity: u64,
    },

    /// A mapping window was used after it was unmapped.
    #[error("mapping window is stale (unmapped)")]
    StaleMapping,

    /// The attribute key is unknown or not supported by the driver.
    #[error("unsupported attribute: {0}")]
    UnsupportedAttribute(u32),

    /// The driver library could not be loaded or is missing entry points.
    #[error("failed to load driver library: {0}")]
    Library(String),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// The driver's native return code, if this error carries one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Driver { code, .. } => Some(*code),
            Error::System(errno) => Some(-errno.raw_os_error()),
            _ => None,
        }
    }

    /// Returns true for errors caused by calling an operation out of order.
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidState { .. } | Error::SessionClosed | Error::StaleMapping
        )
    }
}
