use sqlx::{QueryBuilder, Sqlite};

use super::TxRecord;
use crate::{
    domain::{duels::DbTx, Error},
    infra::db::DBConnection,
};
use duels_core::TxType;

/// Idempotent persistence of outbound signatures. Every insert is
/// `ON CONFLICT(signature) DO NOTHING`, so recording the same signature
/// twice is indistinguishable from recording it once.
#[derive(Clone, Debug)]
pub struct LedgerStore {
    db: DBConnection,
}

impl LedgerStore {
    pub fn new(db: DBConnection) -> Self {
        Self { db }
    }

    pub async fn insert(&self, tx: &mut DbTx, record: &TxRecord) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO transactions (signature, tx_type) VALUES (?, ?) ON CONFLICT(signature) DO NOTHING",
        )
        .bind(&record.signature)
        .bind(record.tx_type as i64)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    pub async fn insert_many(&self, tx: &mut DbTx, records: &[TxRecord]) -> Result<(), Error> {
        if records.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("INSERT INTO transactions (signature, tx_type) ");
        builder.push_values(records, |mut row, record| {
            row.push_bind(&record.signature);
            row.push_bind(record.tx_type as i64);
        });
        builder.push(" ON CONFLICT(signature) DO NOTHING");

        builder.build().execute(&mut **tx).await?;
        Ok(())
    }

    /// Batch insert for signatures that all share one purpose.
    pub async fn insert_many_same_type(
        &self,
        tx: &mut DbTx,
        tx_type: TxType,
        signatures: &[String],
    ) -> Result<(), Error> {
        if signatures.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("INSERT INTO transactions (signature, tx_type) ");
        builder.push_values(signatures, |mut row, signature| {
            row.push_bind(signature);
            row.push_bind(tx_type as i64);
        });
        builder.push(" ON CONFLICT(signature) DO NOTHING");

        builder.build().execute(&mut **tx).await?;
        Ok(())
    }

    pub async fn get_by_signatures(&self, signatures: &[String]) -> Result<Vec<TxRecord>, Error> {
        if signatures.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT signature, tx_type FROM transactions WHERE signature IN (");
        let mut separated = builder.separated(", ");
        for signature in signatures {
            separated.push_bind(signature);
        }
        separated.push_unseparated(")");

        let records = builder
            .build_query_as::<TxRecord>()
            .fetch_all(self.db.read())
            .await?;

        Ok(records)
    }
}

/// A fake but well-formed base58 signature for tests.
#[cfg(test)]
pub fn test_signature(seed: u8) -> String {
    let mut raw = [seed; 64];
    raw[0] = seed.wrapping_add(1);
    solana_sdk::signature::Signature::from(raw).to_string()
}
