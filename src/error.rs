//! Error types shared across the tool.

use std::fmt;

use tonic::Status;

/// Result alias for fallible operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the resolver, dispatcher, agent group and their
/// collaborators.
#[derive(Debug)]
pub enum Error {
    /// The requested entity does not exist in any consulted store
    NotFound(String),

    /// The request or the resolved operation does not support the action
    BadParameter(String),

    /// An optimistic-concurrency check failed in the RPC layer
    CompareFailed(String),

    /// The surrounding context was cancelled
    Cancelled,

    /// A gRPC call failed; the status code stays observable to callers
    Rpc(Status),

    /// Establishing a transport failed
    Transport(tonic::transport::Error),

    /// Local IO failed
    Io(std::io::Error),

    /// A driver asked the process to exit with a specific code
    ExitCode { code: i32, message: String },

    /// Any other failure
    Other(String),
}

impl Error {
    /// True if this error means the requested entity was absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_bad_parameter(&self) -> bool {
        matches!(self, Error::BadParameter(_))
    }

    /// True if this error is a cancellation in disguise. Compare-failed
    /// errors whose text mentions cancellation originate in the RPC layer
    /// losing a race with a cancelled context.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::CompareFailed(message) => message.contains("cancelled"),
            Error::Rpc(status) => status.code() == tonic::Code::Cancelled,
            _ => false,
        }
    }

    /// The gRPC status carried by this error, if any.
    pub fn status(&self) -> Option<&Status> {
        match self {
            Error::Rpc(status) => Some(status),
            _ => None,
        }
    }

    /// Process exit code for this error. Structured codes returned by
    /// drivers pass through; everything else exits 255.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ExitCode { code, .. } => *code,
            _ => 255,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(message) => write!(f, "{}", message),
            Error::BadParameter(message) => write!(f, "{}", message),
            Error::CompareFailed(message) => write!(f, "compare failed: {}", message),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::Rpc(status) => write!(f, "rpc error: {}", status),
            Error::Transport(err) => write!(f, "transport error: {}", err),
            Error::Io(err) => write!(f, "io error: {}", err),
            Error::ExitCode { code, message } => write!(f, "{} (exit code {})", message, code),
            Error::Other(message) => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Rpc(status) => Some(status),
            Error::Transport(err) => Some(err),
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Error::Rpc(status)
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Error::Transport(err)
    }
}
