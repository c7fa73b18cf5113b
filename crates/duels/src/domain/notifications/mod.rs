mod service;

pub use service::*;

use crate::{
    domain::Error,
    infra::db::{parse_required_datetime, parse_required_uuid},
};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, FromRow, Row};
use time::OffsetDateTime;
use uuid::Uuid;

/// A persisted user notification. The row is the durable truth; the live
/// push over the event hub is best-effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub notification_type: u8,
    pub data: serde_json::Value,
    pub is_read: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Notification {
    pub fn new<T: Serialize>(
        user_id: Uuid,
        notification_type: u8,
        payload: &T,
    ) -> Result<Self, Error> {
        let data = serde_json::to_value(payload)
            .map_err(|e| Error::Internal(format!("failed to marshal notification: {}", e)))?;

        Ok(Self {
            id: Uuid::new_v4(),
            user_id,
            notification_type,
            data,
            is_read: false,
            created_at: OffsetDateTime::now_utc(),
        })
    }
}

impl FromRow<'_, SqliteRow> for Notification {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let data_bytes: Option<Vec<u8>> = row.try_get("data")?;
        let data = match data_bytes {
            Some(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| sqlx::Error::ColumnDecode {
                    index: "data".to_string(),
                    source: Box::new(e),
                })?
            }
            None => serde_json::Value::Null,
        };

        Ok(Notification {
            id: parse_required_uuid(row, "id")?,
            user_id: parse_required_uuid(row, "user_id")?,
            notification_type: row.try_get::<i64, _>("notification_type")? as u8,
            data,
            is_read: row.try_get("is_read")?,
            created_at: parse_required_datetime(row, "created_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotedForPayload {
    pub duel_id: Uuid,
    pub duel_name: String,
    pub voted_for: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuelResolvePayload {
    pub duel_id: Uuid,
    pub duel_name: String,
    pub voted_for: u8,
    pub amount: f64,
    pub status: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuelPlayersJoinedPayload {
    pub duel_id: Uuid,
    pub duel_name: String,
    pub players_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuelModerationPayload {
    pub duel_id: Uuid,
    pub duel_name: String,
    pub is_approved: bool,
    pub cancellation_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuelEndingSoonPayload {
    pub duel_id: Uuid,
    pub duel_name: String,
    pub deadline: u64,
}
