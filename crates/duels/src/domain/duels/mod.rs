mod orchestrator;
mod store;

pub use orchestrator::*;
pub use store::*;

use crate::infra::db::{parse_optional_blob_json, parse_required_datetime, parse_required_uuid};
use duels_core::{DuelStatus, PlayerStatus, USDC_DUEL_MAX_JOIN_PRICE, USDC_DUEL_MIN_JOIN_PRICE};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, FromRow, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{Error, User};

pub const SAME_PREDICTION_CANCELLATION_REASON: &str = "All users made the same prediction";
pub const LACK_OF_PARTICIPANTS_CANCELLATION_REASON: &str =
    "The duel was canceled due to a lack of participants";

/// A two-outcome prediction market: a creator, a question, a fixed stake
/// per participant, an event time and an on-chain escrow room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Duel {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub room_number: u64,
    pub players_count: u64,
    pub refunded_players_count: u64,
    pub winners_count: u64,
    /// Creator username snapshot taken at creation time
    pub username: String,
    pub status: DuelStatus,
    pub image_url: String,
    pub bg_url: String,
    pub question: String,
    pub duel_price: f64,
    /// Commission percent, 0..100
    pub commission: u64,
    pub duel_info: Option<serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub event_date: OffsetDateTime,
    pub final_result: Option<u8>,
    pub cancellation_reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl FromRow<'_, SqliteRow> for Duel {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let status_raw: i64 = row.try_get("status")?;
        let status = DuelStatus::try_from(status_raw).map_err(|e| sqlx::Error::ColumnDecode {
            index: "status".to_string(),
            source: Box::new(e),
        })?;

        Ok(Duel {
            id: parse_required_uuid(row, "id")?,
            owner_id: parse_required_uuid(row, "owner_id")?,
            room_number: row.try_get::<i64, _>("room_number")? as u64,
            players_count: row.try_get::<i64, _>("players_count")? as u64,
            refunded_players_count: row.try_get::<i64, _>("refunded_players_count")? as u64,
            winners_count: row.try_get::<i64, _>("winners_count")? as u64,
            username: row.try_get("username")?,
            status,
            image_url: row.try_get::<Option<String>, _>("image_url")?.unwrap_or_default(),
            bg_url: row.try_get::<Option<String>, _>("bg_url")?.unwrap_or_default(),
            question: row.try_get("question")?,
            duel_price: row.try_get("duel_price")?,
            commission: row.try_get::<i64, _>("commission")? as u64,
            duel_info: parse_optional_blob_json(row, "duel_info")?,
            event_date: parse_required_datetime(row, "event_date")?,
            final_result: row
                .try_get::<Option<i64>, _>("final_result")?
                .map(|v| v as u8),
            cancellation_reason: row.try_get("cancellation_reason")?,
            created_at: parse_required_datetime(row, "created_at")?,
            updated_at: parse_required_datetime(row, "updated_at")?,
        })
    }
}

/// A user's stake in one duel. At most one player per (user, duel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub id: Uuid,
    pub user_id: Uuid,
    pub duel_id: Uuid,
    pub win_amount: f64,
    pub answer: u8,
    pub final_status: PlayerStatus,
    pub is_winner: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl FromRow<'_, SqliteRow> for Player {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let status_raw: i64 = row.try_get("final_status")?;
        let final_status =
            PlayerStatus::try_from(status_raw).map_err(|e| sqlx::Error::ColumnDecode {
                index: "final_status".to_string(),
                source: Box::new(e),
            })?;

        Ok(Player {
            id: parse_required_uuid(row, "id")?,
            user_id: parse_required_uuid(row, "user_id")?,
            duel_id: parse_required_uuid(row, "duel_id")?,
            win_amount: row.try_get("win_amount")?,
            answer: row.try_get::<i64, _>("answer")? as u8,
            final_status,
            is_winner: row.try_get("is_winner")?,
            created_at: parse_required_datetime(row, "created_at")?,
        })
    }
}

/// Player joined with the payout address from the users table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerWithAddress {
    pub id: Uuid,
    pub user_id: Uuid,
    pub answer: u8,
    pub public_address: String,
}

impl FromRow<'_, SqliteRow> for PlayerWithAddress {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(PlayerWithAddress {
            id: parse_required_uuid(row, "id")?,
            user_id: parse_required_uuid(row, "user_id")?,
            answer: row.try_get::<i64, _>("answer")? as u8,
            public_address: row
                .try_get::<Option<String>, _>("public_address")?
                .unwrap_or_default(),
        })
    }
}

/// Typed form of the free-form `duel_info` payload for crypto duels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CryptoDuelInfo {
    pub coin_id: i64,
    pub target_price: f64,
    pub direction: i64,
}

impl CryptoDuelInfo {
    /// Pull the typed variant out of the stored map, if it carries one.
    pub fn from_duel_info(duel_info: Option<&serde_json::Value>) -> Option<Self> {
        serde_json::from_value(duel_info?.clone()).ok()
    }

    /// Direction-based oracle for future auto-resolution; the resolution
    /// flow itself uses the owner's verdict.
    pub fn determine_winning_bet(&self, coin_price: f64) -> u8 {
        if self.direction == 0 && coin_price <= self.target_price {
            return 1;
        }
        if self.direction == 1 && coin_price >= self.target_price {
            return 1;
        }
        0
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateDuelRequest {
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub bg_url: String,
    pub question: String,
    pub duel_price: f64,
    pub commission: u64,
    #[serde(default)]
    pub duel_info: Option<serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub event_date: OffsetDateTime,
    pub answer: u8,
    #[serde(rename = "tx_hash", default)]
    pub hash: String,
}

impl CreateDuelRequest {
    pub fn validate(&self) -> Result<(), Error> {
        if !(USDC_DUEL_MIN_JOIN_PRICE..=USDC_DUEL_MAX_JOIN_PRICE).contains(&self.duel_price) {
            return Err(Error::BadRequest(format!(
                "duel price must be between {} and {} USDC",
                USDC_DUEL_MIN_JOIN_PRICE, USDC_DUEL_MAX_JOIN_PRICE
            )));
        }
        if self.commission > 100 {
            return Err(Error::BadRequest("commission must be a percent".to_string()));
        }
        if self.answer > 1 {
            return Err(Error::BadRequest("answer must be 0 or 1".to_string()));
        }
        if self.question.trim().is_empty() {
            return Err(Error::BadRequest("question must not be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinDuelRequest {
    pub duel_id: Uuid,
    pub answer: u8,
    #[serde(rename = "tx_hash", default)]
    pub hash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolveDuelRequest {
    pub duel_id: Uuid,
    pub answer: u8,
}

#[derive(Debug, Clone)]
pub struct CancelDuelRequest {
    pub duel_id: Uuid,
    pub status: DuelStatus,
    pub cancellation_reason: String,
}

impl CancelDuelRequest {
    /// Cancellation request for the degenerate resolve outcomes. With no
    /// players there is nothing charged to give back, so the duel ends
    /// `AutoCancelled` instead of `Refund`.
    pub fn auto_cancel(duel: &Duel) -> Self {
        let cancellation_reason = if duel.players_count <= 1 {
            LACK_OF_PARTICIPANTS_CANCELLATION_REASON
        } else {
            SAME_PREDICTION_CANCELLATION_REASON
        };

        let status = if duel.players_count == 0 {
            DuelStatus::AutoCancelled
        } else {
            DuelStatus::Refund
        };

        Self {
            duel_id: duel.id,
            status,
            cancellation_reason: cancellation_reason.to_string(),
        }
    }
}

impl Duel {
    /// Construct a duel from a create request. The room number is a random
    /// placeholder until the on-chain program assigns the real one.
    pub fn from_create_request(req: &CreateDuelRequest, user: &User) -> Self {
        let mut rng = rand::rng();
        let room_number: u64 = rng.random_range(0..(u32::MAX as u64 - 10_000)) + 10_001;

        let bg_url = if req.bg_url.is_empty() {
            format!("background_{}.svg", rng.random_range(0..5))
        } else {
            req.bg_url.clone()
        };

        let now = OffsetDateTime::now_utc();
        Duel {
            id: Uuid::new_v4(),
            owner_id: user.id,
            room_number,
            players_count: 0,
            refunded_players_count: 0,
            winners_count: 0,
            username: user.username.to_string(),
            status: DuelStatus::InProcess,
            image_url: req.image_url.clone(),
            bg_url,
            question: req.question.clone(),
            duel_price: req.duel_price,
            commission: req.commission,
            duel_info: req.duel_info.clone(),
            event_date: req.event_date,
            final_result: None,
            cancellation_reason: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn crypto_duel_info(&self) -> Option<CryptoDuelInfo> {
        CryptoDuelInfo::from_duel_info(self.duel_info.as_ref())
    }
}

/// Reward arithmetic for one resolved duel.
#[derive(Debug, Clone, Copy)]
pub struct DuelParams {
    pool: f64,
    commission: f64,
    winners_count: f64,
}

impl DuelParams {
    pub fn new(price: f64, commission: u64, players_count: u64, winners_count: u64) -> Self {
        Self {
            pool: players_count as f64 * price,
            commission: commission as f64,
            winners_count: winners_count as f64,
        }
    }

    /// Per-winner reward in token base units: the pool minus the full
    /// commission cut, split evenly.
    pub fn final_crypto_reward(&self, price_multiplier: f64) -> u64 {
        let percent_value = self.pool * self.commission * price_multiplier / 100.0;
        let final_pool = self.pool * price_multiplier - percent_value;
        (final_pool / self.winners_count) as u64
    }

    /// Creator commission in base units: half the commission cut. The
    /// other half stays on the program as the platform fee.
    pub fn crypto_commission_reward(&self, price_multiplier: f64) -> u64 {
        let percent_value = self.pool * self.commission * price_multiplier / 100.0;
        (percent_value / 2.0) as u64
    }
}
