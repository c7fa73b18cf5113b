//! Shared error types

use thiserror::Error;

/// Core errors shared between the service crates
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid status value: {0}")]
    InvalidStatus(i64),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
