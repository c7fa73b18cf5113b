//! Boundary validation helpers

use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

const USERNAME_MIN_LEN: usize = 2;
const USERNAME_MAX_LEN: usize = 44;

/// A validated username: 2..=44 characters from `[A-Za-z0-9._-]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Username(String);

impl Username {
    pub fn new(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        if !is_valid_username(&raw) {
            return Err(CoreError::Validation(format!(
                "username must be {}..{} characters of [A-Za-z0-9._-], got {:?}",
                USERNAME_MIN_LEN, USERNAME_MAX_LEN, raw
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Username {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Username::new(value)
    }
}

impl From<Username> for String {
    fn from(value: Username) -> Self {
        value.0
    }
}

fn is_valid_username(raw: &str) -> bool {
    (USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&raw.len())
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}
