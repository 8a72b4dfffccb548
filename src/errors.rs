//! Typed error hierarchy for stepwright.
//!
//! Two enums cover the two boundaries:
//! - `RemoteError`: normalized failures of the remote automation engine
//! - `EditingError`: failures of editing-session operations, as surfaced to callers

use thiserror::Error;

use crate::editing::graph::Violation;

/// The failure modes every automation-engine call is normalized to.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The engine has no session for the subject (expired or never opened).
    #[error("Remote session not found")]
    NotFound,

    #[error("Remote call '{operation}' timed out")]
    Timeout { operation: String },

    /// Remote-side validation failure, e.g. a malformed selector.
    #[error("Remote engine rejected the request: {0}")]
    Rejected(String),

    #[error("Remote engine unreachable: {0}")]
    Transport(String),
}

impl RemoteError {
    pub fn timeout(operation: &str) -> Self {
        Self::Timeout {
            operation: operation.to_string(),
        }
    }
}

/// Errors from editing-session operations.
#[derive(Debug, Error)]
pub enum EditingError {
    #[error("Subject {id} not found")]
    SubjectNotFound { id: i64 },

    #[error("User {user_id} does not own subject {subject_id}")]
    Forbidden { subject_id: i64, user_id: i64 },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Correction set has no steps")]
    EmptyDraft,

    #[error("Correction set failed validation with {} violation(s)", .0.len())]
    Validation(Vec<Violation>),

    #[error("No active editing session for subject {subject_id}")]
    NoActiveSession { subject_id: i64 },

    /// The engine lost the session. The editor must drop its remote handle
    /// and ask the user to restart.
    #[error("Remote session for subject {subject_id} was lost; restart editing")]
    SessionLost { subject_id: i64 },

    #[error("Login is already executing for subject {subject_id}")]
    LoginInProgress { subject_id: i64 },

    #[error("Login for subject {subject_id} is not waiting for manual action")]
    LoginNotPaused { subject_id: i64 },

    #[error(transparent)]
    Remote(RemoteError),

    #[error("Failed to seal sensitive value: {0}")]
    Sealing(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

impl EditingError {
    /// Map an engine failure for `subject_id`; a missing session always
    /// becomes the reset signal.
    pub fn from_remote(subject_id: i64, err: RemoteError) -> Self {
        match err {
            RemoteError::NotFound => Self::SessionLost { subject_id },
            other => Self::Remote(other),
        }
    }
}

impl From<anyhow::Error> for EditingError {
    fn from(err: anyhow::Error) -> Self {
        Self::Database(err)
    }
}
