//! Error categories shared by every layer of the datastore.
//!
//! Storage backends wrap driver failures into [`Error::Internal`] and keep the
//! well-known sentinels (missing key, duplicate key) as [`Error::NotFound`] and
//! [`Error::Conflict`]. Controllers preserve an already classified error and
//! only add context to its message. The HTTP and gRPC surfaces map each category
//! onto a status code.

use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Classified datastore error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    UnsupportedMediaType(String),

    #[error("{0}")]
    Internal(String),

    /// Operation not supported by the configured backend
    #[error("{0}")]
    NotImplemented(String),
}

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Error::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Wrap any displayable failure as an internal error
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Error::Internal(err.to_string())
    }

    /// Message without the category
    pub fn message(&self) -> &str {
        match self {
            Error::NotFound(m)
            | Error::Conflict(m)
            | Error::BadRequest(m)
            | Error::UnsupportedMediaType(m)
            | Error::Internal(m)
            | Error::NotImplemented(m) => m,
        }
    }

    /// Prefix the message with `context`, keeping the category
    pub fn context(self, context: impl std::fmt::Display) -> Self {
        let wrap = |m: String| format!("{context}: {m}");
        match self {
            Error::NotFound(m) => Error::NotFound(wrap(m)),
            Error::Conflict(m) => Error::Conflict(wrap(m)),
            Error::BadRequest(m) => Error::BadRequest(wrap(m)),
            Error::UnsupportedMediaType(m) => Error::UnsupportedMediaType(wrap(m)),
            Error::Internal(m) => Error::Internal(wrap(m)),
            Error::NotImplemented(m) => Error::NotImplemented(wrap(m)),
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
        }
    }

    /// Classify an error reported by a remote datastore
    pub fn from_http_status(status: StatusCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            StatusCode::NOT_FOUND => Error::NotFound(message),
            StatusCode::CONFLICT => Error::Conflict(message),
            StatusCode::BAD_REQUEST => Error::BadRequest(message),
            StatusCode::UNSUPPORTED_MEDIA_TYPE => Error::UnsupportedMediaType(message),
            StatusCode::NOT_IMPLEMENTED => Error::NotImplemented(message),
            _ => Error::Internal(message),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

/// Uniform error body returned by the HTTP surface
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
}

impl From<&Error> for ErrorResponse {
    fn from(err: &Error) -> Self {
        Self {
            code: err.http_status().as_u16(),
            message: err.message().to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("serialization error: {err}"))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound(err.to_string()),
            other => Error::Internal(other.to_string()),
        }
    }
}

#[cfg(feature = "grpc")]
impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        use tonic::Code;
        let code = match &err {
            Error::NotFound(_) => Code::NotFound,
            Error::Conflict(_) => Code::AlreadyExists,
            Error::BadRequest(_) => Code::InvalidArgument,
            Error::UnsupportedMediaType(_) | Error::Internal(_) => Code::Unknown,
            Error::NotImplemented(_) => Code::Unimplemented,
        };
        tonic::Status::new(code, err.message().to_string())
    }
}

#[cfg(feature = "grpc")]
impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        use tonic::Code;
        let msg = status.message().to_string();
        match status.code() {
            Code::NotFound => Error::NotFound(msg),
            Code::AlreadyExists => Error::Conflict(msg),
            Code::InvalidArgument => Error::BadRequest(msg),
            Code::Unimplemented => Error::NotImplemented(msg),
            _ => Error::Internal(msg),
        }
    }
}
