mod sessions;
mod store;

pub use sessions::*;
pub use store::*;

use crate::{
    domain::Error,
    infra::db::{parse_required_datetime, parse_required_uuid},
};
use duels_core::Username;
use serde::{Deserialize, Serialize};
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use sqlx::{sqlite::SqliteRow, FromRow, Row};
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: Username,
    pub image_url: String,
    /// Chain address, set once the wallet is linked. Unique across users.
    pub public_address: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl User {
    /// A fresh account, created on first wallet sign-in.
    pub fn new(username: Username, image_url: String) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            username,
            image_url,
            public_address: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[cfg(test)]
    pub fn test_user(name: &str) -> Self {
        Self::new(
            Username::new(format!("user_{}", name)).unwrap(),
            String::new(),
        )
    }
}

impl FromRow<'_, SqliteRow> for User {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let username_raw: String = row.try_get("username")?;
        let username = Username::new(username_raw).map_err(|e| sqlx::Error::ColumnDecode {
            index: "username".to_string(),
            source: Box::new(e),
        })?;

        Ok(User {
            id: parse_required_uuid(row, "id")?,
            username,
            image_url: row
                .try_get::<Option<String>, _>("image_url")?
                .unwrap_or_default(),
            public_address: row.try_get("public_address")?,
            created_at: parse_required_datetime(row, "created_at")?,
            updated_at: parse_required_datetime(row, "updated_at")?,
        })
    }
}

/// Per-user lifetime aggregates. The query lives in the store; nothing
/// serves it yet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserStats {
    pub participated: u64,
    pub wins_count: u64,
    pub losses_count: u64,
    pub refunded_count: u64,
    pub earned_amount: f64,
    pub lost_amount: f64,
    pub refunded_amount: f64,
    pub net_profit: f64,
}

/// Verify an ed25519 signature from a wallet over a challenge message.
/// This is the only piece of the sign-in flow the core owns.
pub fn verify_wallet_signature(
    public_address: &str,
    message: &[u8],
    signature_base58: &str,
) -> Result<bool, Error> {
    let pubkey = Pubkey::from_str(public_address)
        .map_err(|_| Error::BadRequest("invalid solana address".to_string()))?;
    let signature = Signature::from_str(signature_base58)
        .map_err(|_| Error::BadRequest("invalid signature encoding".to_string()))?;

    Ok(signature.verify(pubkey.as_ref(), message))
}
