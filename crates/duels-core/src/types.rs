//! Shared plain types: status enums, ledger record kinds, user events.

use crate::CoreError;
use serde::{Deserialize, Serialize};

/// Scaling factor between a human USDC amount and token base units.
pub const USDC_PRICE_MULTIPLIER: u64 = 1_000_000;

/// Smallest stake a duel may be created with, in whole USDC.
pub const USDC_DUEL_MIN_JOIN_PRICE: f64 = 1.0;

/// Largest stake a duel may be created with, in whole USDC.
pub const USDC_DUEL_MAX_JOIN_PRICE: f64 = 5000.0;

/// Lifecycle of a duel.
///
/// `InReview` duels can be promoted to `InProcess` or pulled by an admin;
/// running duels end in exactly one of the terminal states. `Refund` means
/// "cancelled with refunds sent"; `AutoCancelled` is the zero-charge
/// degenerate ending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DuelStatus {
    InReview = 1,
    AutoCancelled = 2,
    AdminCancelled = 3,
    InProcess = 4,
    Resolved = 5,
    Refund = 6,
}

impl DuelStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DuelStatus::AutoCancelled
                | DuelStatus::AdminCancelled
                | DuelStatus::Resolved
                | DuelStatus::Refund
        )
    }

    /// Valid edges of the duel state machine.
    pub fn can_transition(&self, next: DuelStatus) -> bool {
        match self {
            DuelStatus::InReview => {
                matches!(next, DuelStatus::InProcess | DuelStatus::AdminCancelled)
            }
            DuelStatus::InProcess => matches!(
                next,
                DuelStatus::Resolved | DuelStatus::Refund | DuelStatus::AutoCancelled
            ),
            _ => false,
        }
    }
}

impl TryFrom<i64> for DuelStatus {
    type Error = CoreError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(DuelStatus::InReview),
            2 => Ok(DuelStatus::AutoCancelled),
            3 => Ok(DuelStatus::AdminCancelled),
            4 => Ok(DuelStatus::InProcess),
            5 => Ok(DuelStatus::Resolved),
            6 => Ok(DuelStatus::Refund),
            other => Err(CoreError::InvalidStatus(other)),
        }
    }
}

/// Terminal settlement state of a single player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PlayerStatus {
    Active = 0,
    Resolved = 1,
    Refunded = 2,
}

impl TryFrom<i64> for PlayerStatus {
    type Error = CoreError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PlayerStatus::Active),
            1 => Ok(PlayerStatus::Resolved),
            2 => Ok(PlayerStatus::Refunded),
            other => Err(CoreError::InvalidStatus(other)),
        }
    }
}

/// Purpose of an outbound chain signature recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TxType {
    DuelPrediction = 1,
    DuelRefund = 2,
    DuelCommission = 3,
    DuelReward = 4,
}

impl TryFrom<i64> for TxType {
    type Error = CoreError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(TxType::DuelPrediction),
            2 => Ok(TxType::DuelRefund),
            3 => Ok(TxType::DuelCommission),
            4 => Ok(TxType::DuelReward),
            other => Err(CoreError::InvalidStatus(other)),
        }
    }
}

/// Notification catalogue. The ids are part of the client contract.
pub const NOTIFICATION_DUEL_RESOLVE: u8 = 10;
pub const NOTIFICATION_DUEL_REFUND: u8 = 11;
pub const NOTIFICATION_VOTED_FOR: u8 = 12;
pub const NOTIFICATION_DUEL_MODERATION: u8 = 13;
pub const NOTIFICATION_DUEL_PLAYERS_JOINED: u8 = 14;
pub const NOTIFICATION_DUEL_ENDING_SOON: u8 = 15;

/// Per-player outcome carried inside a resolve notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ResolveStatus {
    Won = 0,
    Lost = 1,
    Refund = 2,
    Commission = 3,
}

/// Lightweight out-of-band event pushed to a user's event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEvent {
    #[serde(rename = "type")]
    pub kind: u8,
}

pub const EVENT_INSUFFICIENT_FUNDS: u8 = 1;

impl UserEvent {
    pub fn insufficient_funds() -> Self {
        Self {
            kind: EVENT_INSUFFICIENT_FUNDS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duel_status_transitions() {
        assert!(DuelStatus::InReview.can_transition(DuelStatus::InProcess));
        assert!(DuelStatus::InReview.can_transition(DuelStatus::AdminCancelled));
        assert!(!DuelStatus::InReview.can_transition(DuelStatus::Resolved));

        assert!(DuelStatus::InProcess.can_transition(DuelStatus::Resolved));
        assert!(DuelStatus::InProcess.can_transition(DuelStatus::Refund));
        assert!(DuelStatus::InProcess.can_transition(DuelStatus::AutoCancelled));
        assert!(!DuelStatus::InProcess.can_transition(DuelStatus::AdminCancelled));

        for terminal in [
            DuelStatus::Resolved,
            DuelStatus::Refund,
            DuelStatus::AutoCancelled,
            DuelStatus::AdminCancelled,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition(DuelStatus::InProcess));
        }
    }

    #[test]
    fn status_round_trips_from_i64() {
        for raw in 1..=6 {
            let status = DuelStatus::try_from(raw).unwrap();
            assert_eq!(status as i64, raw);
        }
        assert!(DuelStatus::try_from(0).is_err());
        assert!(DuelStatus::try_from(7).is_err());
        assert!(TxType::try_from(5).is_err());
    }
}
