mod store;

pub use store::*;

use duels_core::TxType;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, FromRow, Row};

/// One outbound chain action, keyed by its signature. Append-only; the
/// primary key makes replays free.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    pub signature: String,
    pub tx_type: TxType,
}

impl TxRecord {
    pub fn new(tx_type: TxType, signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            tx_type,
        }
    }

    /// Build records for a batch of signatures sharing one purpose.
    pub fn with_same_type(tx_type: TxType, signatures: &[String]) -> Vec<Self> {
        signatures
            .iter()
            .map(|signature| Self::new(tx_type, signature.clone()))
            .collect()
    }
}

impl FromRow<'_, SqliteRow> for TxRecord {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let tx_type_raw: i64 = row.try_get("tx_type")?;
        let tx_type = TxType::try_from(tx_type_raw).map_err(|e| sqlx::Error::ColumnDecode {
            index: "tx_type".to_string(),
            source: Box::new(e),
        })?;

        Ok(TxRecord {
            signature: row.try_get("signature")?,
            tx_type,
        })
    }
}
