use thiserror::Error;

use crate::core::templates::TemplateError;

pub type StoryResult<T> = std::result::Result<T, StoryError>;

#[derive(Debug, Error)]
pub enum StoryError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("invalid task transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("field cipher error: {0}")]
    Cipher(String),
}

impl StoryError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        StoryError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoryError::NotFound { .. })
    }
}
