use std::error::Error;
use std::fmt::{Display, Formatter};

/// Canonical status codes shared by the stream and unary RPC surfaces.
///
/// The numbering follows the usual RPC convention so that causes embedded in
/// server frames can be mapped directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncErrorCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl SyncErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorCode::Cancelled => "sync/cancelled",
            SyncErrorCode::Unknown => "sync/unknown",
            SyncErrorCode::InvalidArgument => "sync/invalid-argument",
            SyncErrorCode::DeadlineExceeded => "sync/deadline-exceeded",
            SyncErrorCode::NotFound => "sync/not-found",
            SyncErrorCode::AlreadyExists => "sync/already-exists",
            SyncErrorCode::PermissionDenied => "sync/permission-denied",
            SyncErrorCode::ResourceExhausted => "sync/resource-exhausted",
            SyncErrorCode::FailedPrecondition => "sync/failed-precondition",
            SyncErrorCode::Aborted => "sync/aborted",
            SyncErrorCode::OutOfRange => "sync/out-of-range",
            SyncErrorCode::Unimplemented => "sync/unimplemented",
            SyncErrorCode::Internal => "sync/internal",
            SyncErrorCode::Unavailable => "sync/unavailable",
            SyncErrorCode::DataLoss => "sync/data-loss",
            SyncErrorCode::Unauthenticated => "sync/unauthenticated",
        }
    }

    /// Maps an RPC status number to a code; unknown numbers collapse to
    /// `Unknown`.
    pub fn from_rpc_code(code: i32) -> Self {
        match code {
            1 => SyncErrorCode::Cancelled,
            2 => SyncErrorCode::Unknown,
            3 => SyncErrorCode::InvalidArgument,
            4 => SyncErrorCode::DeadlineExceeded,
            5 => SyncErrorCode::NotFound,
            6 => SyncErrorCode::AlreadyExists,
            7 => SyncErrorCode::PermissionDenied,
            8 => SyncErrorCode::ResourceExhausted,
            9 => SyncErrorCode::FailedPrecondition,
            10 => SyncErrorCode::Aborted,
            11 => SyncErrorCode::OutOfRange,
            12 => SyncErrorCode::Unimplemented,
            13 => SyncErrorCode::Internal,
            14 => SyncErrorCode::Unavailable,
            15 => SyncErrorCode::DataLoss,
            16 => SyncErrorCode::Unauthenticated,
            _ => SyncErrorCode::Unknown,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyncError {
    pub code: SyncErrorCode,
    message: String,
}

impl SyncError {
    pub fn new(code: SyncErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for SyncError {}

pub type SyncResult<T> = Result<T, SyncError>;

pub fn cancelled(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Cancelled, message)
}

pub fn invalid_argument(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::InvalidArgument, message)
}

pub fn deadline_exceeded(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::DeadlineExceeded, message)
}

pub fn not_found(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::NotFound, message)
}

pub fn permission_denied(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::PermissionDenied, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::ResourceExhausted, message)
}

pub fn failed_precondition(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::FailedPrecondition, message)
}

pub fn aborted(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Aborted, message)
}

pub fn internal_error(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Internal, message)
}

pub fn unavailable(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Unavailable, message)
}

pub fn unauthenticated(message: impl Into<String>) -> SyncError {
    SyncError::new(SyncErrorCode::Unauthenticated, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_rpc_codes() {
        assert_eq!(
            SyncErrorCode::from_rpc_code(14),
            SyncErrorCode::Unavailable
        );
        assert_eq!(SyncErrorCode::from_rpc_code(99), SyncErrorCode::Unknown);
    }

    #[test]
    fn formats_with_code_suffix() {
        let err = unavailable("backend unreachable");
        assert_eq!(err.to_string(), "backend unreachable (sync/unavailable)");
    }
}
