use std::io;

use thiserror::Error;

/// Internal, matchable backend errors (spec §7's taxonomy for
/// platform-transient vs. platform-fatal conditions). Not part of the
/// public API: `poll_backend`/`run_loop_backend` match on these to decide
/// whether to log-and-continue or escalate to `Diagnostics::fatal`; callers
/// only ever see `io::Error` or a `RegisterStatus`.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The wait primitive reported an invalid handle/descriptor — usually a
    /// benign race between an in-flight `remove` and a wait that already
    /// had the old registration loaded (spec §7, "platform-transient").
    #[error("invalid handle")]
    InvalidHandle,

    /// A per-class slot table, or a platform wait-primitive slot table, is
    /// full (spec §4.2 / §4.7).
    #[error("resource exhausted")]
    Exhausted,
}

impl From<BackendError> for io::Error {
    fn from(err: BackendError) -> io::Error {
        match err {
            BackendError::Io(io_err) => io_err,
            BackendError::InvalidHandle => io::Error::new(io::ErrorKind::NotFound, err.to_string()),
            BackendError::Exhausted => io::Error::new(io::ErrorKind::Other, err.to_string()),
        }
    }
}

/// `register`'s return code (spec §6: `{SUCCESS, INSUFFICIENT_RESOURCES, ERROR}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterStatus {
    Success,
    InsufficientResources,
}
