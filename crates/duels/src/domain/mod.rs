pub mod duels;
pub mod ledger;
pub mod notifications;
pub mod users;

pub use duels::*;
pub use ledger::*;
pub use notifications::*;
pub use users::*;

use serde::Serialize;
use thiserror::Error;

/// Application error kinds. Each maps to the HTTP status the edge layer
/// serializes; only `{message, status}` ever leaves the process.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    PaymentRequired(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    TooManyRequests(String),
    #[error("{0}")]
    LoginTimeout(String),
    #[error("{0}")]
    Internal(String),
    #[error("{0}")]
    ServiceUnavailable(String),
    #[error("problem querying db: {0}")]
    Db(#[from] sqlx::Error),
}

pub const STATUS_LOGIN_TIMEOUT: u16 = 440;

impl Error {
    pub fn status(&self) -> u16 {
        match self {
            Error::BadRequest(_) => 400,
            Error::Unauthorized(_) => 401,
            Error::PaymentRequired(_) => 402,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::TooManyRequests(_) => 429,
            Error::LoginTimeout(_) => STATUS_LOGIN_TIMEOUT,
            Error::Internal(_) | Error::Db(_) => 500,
            Error::ServiceUnavailable(_) => 503,
        }
    }

    /// The wire form of an error: human message plus status, never the
    /// causal chain.
    pub fn public(&self) -> ErrorPublic {
        ErrorPublic {
            message: self.to_string(),
            status: self.status(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPublic {
    pub message: String,
    pub status: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_statuses() {
        assert_eq!(Error::BadRequest("x".into()).status(), 400);
        assert_eq!(Error::PaymentRequired("x".into()).status(), 402);
        assert_eq!(Error::LoginTimeout("x".into()).status(), 440);
        assert_eq!(Error::ServiceUnavailable("x".into()).status(), 503);
        assert_eq!(Error::Db(sqlx::Error::RowNotFound).status(), 500);
    }

    #[test]
    fn public_form_carries_message_and_status() {
        let public = Error::NotFound("duel not found".into()).public();
        assert_eq!(public.message, "duel not found");
        assert_eq!(public.status, 404);

        let serialized = serde_json::to_string(&public).unwrap();
        assert_eq!(
            serialized,
            r#"{"message":"duel not found","status":404}"#
        );
    }
}
