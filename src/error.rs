use std::fmt;
use std::io;

/// Result codes shared by every operation of the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatusCode {
    /// Success.
    Success = 0,
    /// Generic error whose cause is unknown.
    UnknownError = 1,
    /// Generic error from underlying systems.
    SystemError = 2,
    /// Error that the feature is not implemented.
    NotImplementedError = 3,
    /// Error that a precondition is not met.
    PreconditionError = 4,
    /// Error that a given argument is invalid.
    InvalidArgumentError = 5,
    /// Error that the operation is canceled.
    CanceledError = 6,
    /// Error that a specific resource is not found.
    NotFoundError = 7,
    /// Error that the operation is not permitted.
    PermissionError = 8,
    /// Error that the operation is infeasible.
    InfeasibleError = 9,
    /// Error that a specific resource is duplicated.
    DuplicationError = 10,
    /// Error that internal data are broken.
    BrokenDataError = 11,
    /// Error caused by networking failure.
    NetworkError = 12,
    /// Generic error caused by the application logic.
    ApplicationError = 13,
}

impl StatusCode {
    /// Returns the canonical upper-case name of the code.
    pub fn name(self) -> &'static str {
        match self {
            StatusCode::Success => "SUCCESS",
            StatusCode::UnknownError => "UNKNOWN_ERROR",
            StatusCode::SystemError => "SYSTEM_ERROR",
            StatusCode::NotImplementedError => "NOT_IMPLEMENTED_ERROR",
            StatusCode::PreconditionError => "PRECONDITION_ERROR",
            StatusCode::InvalidArgumentError => "INVALID_ARGUMENT_ERROR",
            StatusCode::CanceledError => "CANCELED_ERROR",
            StatusCode::NotFoundError => "NOT_FOUND_ERROR",
            StatusCode::PermissionError => "PERMISSION_ERROR",
            StatusCode::InfeasibleError => "INFEASIBLE_ERROR",
            StatusCode::DuplicationError => "DUPLICATION_ERROR",
            StatusCode::BrokenDataError => "BROKEN_DATA_ERROR",
            StatusCode::NetworkError => "NETWORK_ERROR",
            StatusCode::ApplicationError => "APPLICATION_ERROR",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A result code plus an optional message.
///
/// Failing operations return a `Status` as the error half of [`Result`]. A `Status` can
/// also describe success, which is what [`Status::join`] starts from when several outcomes
/// are folded together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    /// Creates a status with a code and a message.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Status {
        Status {
            code,
            message: message.into(),
        }
    }

    /// Creates a status with a code and no message.
    pub fn from_code(code: StatusCode) -> Status {
        Status {
            code,
            message: String::new(),
        }
    }

    /// The success status.
    pub fn success() -> Status {
        Status::from_code(StatusCode::Success)
    }

    /// Gets the code.
    pub fn code(&self) -> StatusCode {
        self.code
    }

    /// Gets the message, empty if none was given.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// True if the code is `Success`.
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Success
    }

    /// Merges another status into this one. The first failure wins: a success status adopts
    /// `other`, a failed status is left untouched.
    pub fn join(&mut self, other: Status) {
        if self.code == StatusCode::Success {
            *self = other;
        }
    }

    /// Merges the outcome of an operation into this status.
    pub fn join_result<T>(&mut self, result: Result<T>) {
        if let Err(status) = result {
            self.join(status);
        }
    }

    /// Converts into a `Result`, failing unless the code is `Success`.
    pub fn into_result(self) -> Result<()> {
        if self.is_ok() { Ok(()) } else { Err(self) }
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Status {
        Status::new(StatusCode::NotFoundError, message)
    }

    pub(crate) fn duplication(message: impl Into<String>) -> Status {
        Status::new(StatusCode::DuplicationError, message)
    }

    pub(crate) fn infeasible(message: impl Into<String>) -> Status {
        Status::new(StatusCode::InfeasibleError, message)
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Status {
        Status::new(StatusCode::InvalidArgumentError, message)
    }

    pub(crate) fn precondition(message: impl Into<String>) -> Status {
        Status::new(StatusCode::PreconditionError, message)
    }

    pub(crate) fn broken_data(message: impl Into<String>) -> Status {
        Status::new(StatusCode::BrokenDataError, message)
    }

    pub(crate) fn not_implemented(message: impl Into<String>) -> Status {
        Status::new(StatusCode::NotImplementedError, message)
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::success()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for Status {}

impl PartialEq<StatusCode> for Status {
    fn eq(&self, other: &StatusCode) -> bool {
        self.code == *other
    }
}

impl From<StatusCode> for Status {
    fn from(code: StatusCode) -> Status {
        Status::from_code(code)
    }
}

impl From<io::Error> for Status {
    fn from(err: io::Error) -> Status {
        let code = match err.kind() {
            io::ErrorKind::NotFound => StatusCode::NotFoundError,
            io::ErrorKind::PermissionDenied => StatusCode::PermissionError,
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
                StatusCode::BrokenDataError
            }
            _ => StatusCode::SystemError,
        };
        Status::new(code, err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Status {
    fn from(err: Box<bincode::ErrorKind>) -> Status {
        match *err {
            bincode::ErrorKind::Io(io_err) => Status::from(io_err),
            other => Status::broken_data(other.to_string()),
        }
    }
}

impl From<toml::de::Error> for Status {
    fn from(err: toml::de::Error) -> Status {
        Status::invalid_argument(err.to_string())
    }
}

impl From<regex::Error> for Status {
    fn from(err: regex::Error) -> Status {
        Status::invalid_argument(err.to_string())
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Status>;
