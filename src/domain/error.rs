//! Control-plane error taxonomy.
//!
//! Every failure surfaced at an operation boundary is one of these. Each
//! variant carries a POSIX-style errno and a stable name used on the RPC wire.

use nix::libc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no such controller: hci{0}")]
    NoSuchController(u16),

    #[error("adapter is not ready")]
    NotReady,

    #[error("hardware I/O failure: {0}")]
    Hardware(#[from] std::io::Error),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("does not exist: {0}")]
    DoesNotExist(String),

    #[error("not authorized")]
    NotAuthorized,

    #[error("in progress: {0}")]
    InProgress(String),

    #[error("not in progress: {0}")]
    NotInProgress(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Negative errno equivalent of this error.
    pub fn errno(&self) -> i32 {
        let code = match self {
            Error::NoSuchController(_) => libc::ENODEV,
            Error::NotReady => libc::ENETDOWN,
            Error::Hardware(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Unsupported(_) => libc::ENOSYS,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::DoesNotExist(_) => libc::ENOENT,
            Error::NotAuthorized => libc::EACCES,
            Error::InProgress(_) => libc::EINPROGRESS,
            Error::NotInProgress(_) => libc::ESRCH,
            Error::InvalidArguments(_) => libc::EINVAL,
        };
        -code
    }

    pub fn rpc_name(&self) -> &'static str {
        match self {
            Error::NoSuchController(_) => "NoSuchAdapter",
            Error::NotReady => "NotReady",
            Error::Hardware(_) => "Failed",
            Error::Unsupported(_) => "NotSupported",
            Error::AlreadyExists(_) => "AlreadyExists",
            Error::DoesNotExist(_) => "DoesNotExist",
            Error::NotAuthorized => "NotAuthorized",
            Error::InProgress(_) => "InProgress",
            Error::NotInProgress(_) => "NotInProgress",
            Error::InvalidArguments(_) => "InvalidArguments",
        }
    }

    /// True when the hardware reported the requested state is already in
    /// effect (e.g. powering on a controller that is up).
    pub fn is_already(&self) -> bool {
        matches!(self, Error::Hardware(e) if e.raw_os_error() == Some(libc::EALREADY))
    }

    pub fn hardware(errno: i32) -> Error {
        Error::Hardware(std::io::Error::from_raw_os_error(errno))
    }
}

/// Serializable form of [`Error`] delivered to RPC clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub name: String,
    pub message: String,
    pub errno: i32,
}

impl From<&Error> for ErrorReply {
    fn from(err: &Error) -> Self {
        Self {
            name: err.rpc_name().to_string(),
            message: err.to_string(),
            errno: err.errno(),
        }
    }
}

impl From<Error> for ErrorReply {
    fn from(err: Error) -> Self {
        ErrorReply::from(&err)
    }
}
