//! Structured error types for request handling and the store.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Error codes for request-level rejections.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors
    MissingRequiredField,
    InvalidFieldValue,

    // Gate errors
    VersionSuperseded,
    NotAuthorized,
    AtCapacity,
    UnknownAction,

    // Internal errors
    DatabaseError,
    InternalError,
}

/// A request rejected before (or instead of) reaching the store.
///
/// `Display` renders the exact wire text sent back to the client.
#[derive(Debug, Serialize)]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ProtocolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    // Convenience constructors

    pub fn missing_field(field: &str) -> Self {
        Self::new(ErrorCode::MissingRequiredField, "Error: Invalid query").with_field(field)
    }

    pub fn invalid_value(field: &str) -> Self {
        Self::new(ErrorCode::InvalidFieldValue, "Error: Invalid query").with_field(field)
    }

    pub fn superseded(version: i64, repo: &str) -> Self {
        Self::new(
            ErrorCode::VersionSuperseded,
            format!(
                "The version of DistributedChaffinMethod you are using has been superseded.\n\
                 Please download version {} or later from {}\n\
                 Thanks for being part of this project!",
                version, repo
            ),
        )
    }

    pub fn not_authorized() -> Self {
        Self::new(ErrorCode::NotAuthorized, "Error: Not authorized")
    }

    pub fn at_capacity(live: i64, max: i64) -> Self {
        Self::new(
            ErrorCode::AtCapacity,
            format!(
                "Thanks for offering to join the project, but unfortunately the server is at \
                 capacity right now ({} out of {}), and cannot accept any more clients. We will \
                 continue to increase capacity, so please check back soon!",
                live, max
            ),
        )
    }

    pub fn unknown_action(action: &str) -> Self {
        Self::new(
            ErrorCode::UnknownAction,
            format!("Error: Unrecognised action {}", action),
        )
    }

    pub fn database(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::DatabaseError, err.to_string())
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::InternalError, err.to_string())
    }

    /// Text sent to the client. Internal failures never leak their detail.
    pub fn wire_text(&self) -> String {
        match self.code {
            ErrorCode::DatabaseError | ErrorCode::InternalError => {
                "Error: Server failure, please retry\n".to_string()
            }
            _ => format!("{}\n", self.message),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProtocolError {}

// Store failures reach the dispatcher as anyhow errors
impl From<anyhow::Error> for ProtocolError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ProtocolError>() {
            Ok(protocol_err) => protocol_err,
            Err(err) => match err.downcast_ref::<StoreError>() {
                Some(StoreError::RetriesExhausted { .. }) => ProtocolError::database(err),
                _ => ProtocolError::internal(err),
            },
        }
    }
}

/// Classified store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Every attempt of a unit of work hit a transient failure.
    #[error("{op} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        op: String,
        attempts: u32,
        last: String,
    },

    /// A read inside a transaction contradicted another read. Retried.
    #[error("inconsistent state in {0}")]
    Inconsistent(String),

    #[error("database mutex poisoned")]
    Poisoned,
}

/// Result type for request handling.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
