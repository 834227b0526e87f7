//! Error types shared by every blotter component.
//!
//! Each failure is classified so that the operation boundary (an HTTP handler
//! or the search controller) can turn it into a user-visible message.

use thiserror::Error;

/// Result type for blotter operations
pub type Result<T> = std::result::Result<T, BlotterError>;

/// Authentication failures reported by the auth backend or the session gate
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The email/password pair was rejected
    #[error("Invalid login credentials")]
    InvalidCredentials,

    /// No session is active (never signed in, signed out, or not yet restored)
    #[error("Auth session missing")]
    MissingSession,

    /// The session token was refused by the server
    #[error("Session expired: {0}")]
    Expired(String),
}

/// Required-field and required-column failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A form submission left required fields blank
    #[error("Missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    /// The first row of an import file lacks required columns
    #[error("Missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
}

/// Top-level error for blotter operations
#[derive(Debug, Error)]
pub enum BlotterError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Network or remote-store failure
    #[error("Transport error: {message}")]
    Transport {
        status: Option<u16>,
        message: String,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Malformed upload file
    #[error("Parse error: {0}")]
    Parse(String),

    /// No entry exists with the requested id
    #[error("Entry {0} not found")]
    NotFound(i64),
}

impl BlotterError {
    pub fn transport(message: impl Into<String>) -> Self {
        BlotterError::Transport {
            status: None,
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        BlotterError::Parse(message.into())
    }
}

impl From<reqwest::Error> for BlotterError {
    fn from(err: reqwest::Error) -> Self {
        BlotterError::Transport {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

impl From<calamine::Error> for BlotterError {
    fn from(err: calamine::Error) -> Self {
        BlotterError::Parse(err.to_string())
    }
}

impl From<rust_xlsxwriter::XlsxError> for BlotterError {
    fn from(err: rust_xlsxwriter::XlsxError) -> Self {
        BlotterError::Parse(format!("Failed to write workbook: {}", err))
    }
}
