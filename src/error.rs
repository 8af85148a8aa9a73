use std::fmt::Display;

/// Errors surfaced by the module host runtime.
#[derive(Debug)]
pub enum Error {
    /// A caller-supplied argument was malformed.
    InvalidArgument { msg: String },
    /// The requested module, symbol, namespace or link does not exist.
    NotFound { msg: String },
    /// A module, symbol, namespace or link with the same identity already exists.
    Duplicate { msg: String },
    /// The operation would introduce a cycle into the dependency graph.
    Cycle { msg: String },
    /// The target is in use or a load is already in progress.
    Busy { msg: String },
    /// The caller is not permitted to perform the operation.
    PermissionDenied { msg: String },
    /// A reference or lock counter would saturate.
    Overflow { msg: &'static str },
    /// An allocation failed during global bookkeeping.
    OutOfMemory,
    /// A module or dynamic-symbol constructor reported failure.
    ConstructorFailed { code: i32 },
    /// The value does not match the declared parameter type.
    TypeMismatch { msg: String },
    /// The module's inner state has already been torn down.
    Detached,
    /// The underlying binary image could not be opened.
    OpenError { err: libloading::Error },
    /// An io error occurred while resolving a binary path.
    IoError { err: std::io::Error },
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidArgument { msg } => write!(f, "invalid argument: {msg}"),
            Error::NotFound { msg } => write!(f, "not found: {msg}"),
            Error::Duplicate { msg } => write!(f, "duplicate: {msg}"),
            Error::Cycle { msg } => write!(f, "dependency cycle: {msg}"),
            Error::Busy { msg } => write!(f, "busy: {msg}"),
            Error::PermissionDenied { msg } => write!(f, "permission denied: {msg}"),
            Error::Overflow { msg } => write!(f, "counter overflow: {msg}"),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::ConstructorFailed { code } => {
                write!(f, "module constructor failed with code {code}")
            }
            Error::TypeMismatch { msg } => write!(f, "type mismatch: {msg}"),
            Error::Detached => write!(f, "module info has been detached"),
            Error::OpenError { err } => write!(f, "{err}"),
            Error::IoError { err } => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::OpenError { err } => Some(err),
            Error::IoError { err } => Some(err),
            _ => None,
        }
    }
}

impl From<libloading::Error> for Error {
    #[cold]
    fn from(value: libloading::Error) -> Self {
        Error::OpenError { err: value }
    }
}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(value: std::io::Error) -> Self {
        Error::IoError { err: value }
    }
}

#[cold]
#[inline(never)]
pub(crate) fn invalid_argument(msg: impl ToString) -> Error {
    Error::InvalidArgument {
        msg: msg.to_string(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn not_found(msg: impl ToString) -> Error {
    Error::NotFound {
        msg: msg.to_string(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn duplicate(msg: impl ToString) -> Error {
    Error::Duplicate {
        msg: msg.to_string(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn cycle_error(msg: impl ToString) -> Error {
    Error::Cycle {
        msg: msg.to_string(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn busy(msg: impl ToString) -> Error {
    Error::Busy {
        msg: msg.to_string(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn permission_denied(msg: impl ToString) -> Error {
    Error::PermissionDenied {
        msg: msg.to_string(),
    }
}

#[cold]
#[inline(never)]
pub(crate) fn overflow(msg: &'static str) -> Error {
    Error::Overflow { msg }
}

#[cold]
#[inline(never)]
pub(crate) fn constructor_failed(code: i32) -> Error {
    Error::ConstructorFailed { code }
}

#[cold]
#[inline(never)]
pub(crate) fn type_mismatch(msg: impl ToString) -> Error {
    Error::TypeMismatch {
        msg: msg.to_string(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;
