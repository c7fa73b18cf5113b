use sqlx::{QueryBuilder, Sqlite, Transaction};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use uuid::Uuid;

use super::{Duel, Player, PlayerWithAddress};
use crate::{
    domain::Error,
    infra::db::DBConnection,
};
use duels_core::PlayerStatus;

/// Persistence for duels and their players. Reads go through the read
/// pool; every mutation takes an explicit transaction so the orchestrator
/// can commit one atomic step.
#[derive(Clone, Debug)]
pub struct DuelStore {
    db: DBConnection,
}

pub type DbTx = Transaction<'static, Sqlite>;

fn fmt_ts(ts: OffsetDateTime) -> Result<String, Error> {
    ts.format(&Rfc3339)
        .map_err(|e| Error::Internal(format!("failed to format timestamp: {}", e)))
}

impl DuelStore {
    pub fn new(db: DBConnection) -> Self {
        Self { db }
    }

    pub async fn begin(&self) -> Result<DbTx, Error> {
        Ok(self.db.write().begin().await?)
    }

    pub async fn get_duel(&self, duel_id: Uuid) -> Result<Duel, Error> {
        sqlx::query_as::<_, Duel>("SELECT * FROM duels WHERE id = ?")
            .bind(duel_id.to_string())
            .fetch_optional(self.db.read())
            .await?
            .ok_or_else(|| Error::NotFound(format!("duel {} not found", duel_id)))
    }

    pub async fn insert_duel(&self, tx: &mut DbTx, duel: &Duel) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO duels (
                id, owner_id, room_number, players_count, refunded_players_count,
                winners_count, username, status, image_url, bg_url, question,
                duel_price, commission, duel_info, event_date, final_result,
                cancellation_reason, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(duel.id.to_string())
        .bind(duel.owner_id.to_string())
        .bind(duel.room_number as i64)
        .bind(duel.players_count as i64)
        .bind(duel.refunded_players_count as i64)
        .bind(duel.winners_count as i64)
        .bind(&duel.username)
        .bind(duel.status as i64)
        .bind(&duel.image_url)
        .bind(&duel.bg_url)
        .bind(&duel.question)
        .bind(duel.duel_price)
        .bind(duel.commission as i64)
        .bind(
            duel.duel_info
                .as_ref()
                .map(serde_json::to_vec)
                .transpose()
                .map_err(|e| Error::Internal(format!("failed to serialize duel info: {}", e)))?,
        )
        .bind(fmt_ts(duel.event_date)?)
        .bind(duel.final_result.map(|v| v as i64))
        .bind(&duel.cancellation_reason)
        .bind(fmt_ts(duel.created_at)?)
        .bind(fmt_ts(duel.updated_at)?)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Persist the mutable duel columns after a lifecycle step.
    pub async fn update_duel(&self, tx: &mut DbTx, duel: &Duel) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE duels SET
                room_number = ?, players_count = ?, refunded_players_count = ?,
                winners_count = ?, status = ?, final_result = ?,
                cancellation_reason = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(duel.room_number as i64)
        .bind(duel.players_count as i64)
        .bind(duel.refunded_players_count as i64)
        .bind(duel.winners_count as i64)
        .bind(duel.status as i64)
        .bind(duel.final_result.map(|v| v as i64))
        .bind(&duel.cancellation_reason)
        .bind(fmt_ts(OffsetDateTime::now_utc())?)
        .bind(duel.id.to_string())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Insert the player row and bump the duel's player counter in the
    /// same transaction.
    pub async fn join_duel(
        &self,
        tx: &mut DbTx,
        user_id: Uuid,
        duel_id: Uuid,
        answer: u8,
    ) -> Result<Player, Error> {
        let player = Player {
            id: Uuid::new_v4(),
            user_id,
            duel_id,
            win_amount: 0.0,
            answer,
            final_status: PlayerStatus::Active,
            is_winner: false,
            created_at: OffsetDateTime::now_utc(),
        };

        sqlx::query(
            r#"
            INSERT INTO players (id, user_id, duel_id, win_amount, answer, final_status, is_winner, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(player.id.to_string())
        .bind(player.user_id.to_string())
        .bind(player.duel_id.to_string())
        .bind(player.win_amount)
        .bind(player.answer as i64)
        .bind(player.final_status as i64)
        .bind(player.is_winner)
        .bind(fmt_ts(player.created_at)?)
        .execute(&mut **tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                Error::Conflict("user is already participating in this duel".to_string())
            }
            other => Error::Db(other),
        })?;

        sqlx::query("UPDATE duels SET players_count = players_count + 1, updated_at = ? WHERE id = ?")
            .bind(fmt_ts(OffsetDateTime::now_utc())?)
            .bind(duel_id.to_string())
            .execute(&mut **tx)
            .await?;

        Ok(player)
    }

    pub async fn user_already_participant(
        &self,
        user_id: Uuid,
        duel_id: Uuid,
    ) -> Result<bool, Error> {
        let exists: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM players WHERE user_id = ? AND duel_id = ?")
                .bind(user_id.to_string())
                .bind(duel_id.to_string())
                .fetch_optional(self.db.read())
                .await?;

        Ok(exists.is_some())
    }

    /// Players who picked the verdict before the event date.
    pub async fn get_duel_winners(
        &self,
        duel_id: Uuid,
        answer: u8,
        deadline: OffsetDateTime,
    ) -> Result<Vec<Player>, Error> {
        let players = sqlx::query_as::<_, Player>(
            r#"
            SELECT * FROM players
            WHERE duel_id = ? AND answer = ? AND created_at <= ?
            ORDER BY created_at
            "#,
        )
        .bind(duel_id.to_string())
        .bind(answer as i64)
        .bind(fmt_ts(deadline)?)
        .fetch_all(self.db.read())
        .await?;

        Ok(players)
    }

    /// Still-active winners joined with their payout addresses.
    pub async fn get_unpaid_winners(
        &self,
        duel_id: Uuid,
        answer: u8,
    ) -> Result<Vec<PlayerWithAddress>, Error> {
        let players = sqlx::query_as::<_, PlayerWithAddress>(
            r#"
            SELECT players.id, players.user_id, players.answer, u.public_address
            FROM players
            LEFT JOIN users u ON players.user_id = u.id
            WHERE players.duel_id = ? AND players.answer = ? AND players.final_status = ?
            ORDER BY players.created_at
            "#,
        )
        .bind(duel_id.to_string())
        .bind(answer as i64)
        .bind(PlayerStatus::Active as i64)
        .fetch_all(self.db.read())
        .await?;

        Ok(players)
    }

    pub async fn count_players_to_refund(
        &self,
        duel_id: Uuid,
        deadline: OffsetDateTime,
    ) -> Result<u64, Error> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM players
            WHERE duel_id = ? AND final_status = ? AND created_at > ?
            "#,
        )
        .bind(duel_id.to_string())
        .bind(PlayerStatus::Active as i64)
        .bind(fmt_ts(deadline)?)
        .fetch_one(self.db.read())
        .await?;

        Ok(count as u64)
    }

    /// Active players who joined after the event date, with addresses.
    pub async fn get_players_to_refund(
        &self,
        duel_id: Uuid,
        deadline: OffsetDateTime,
    ) -> Result<Vec<PlayerWithAddress>, Error> {
        let players = sqlx::query_as::<_, PlayerWithAddress>(
            r#"
            SELECT players.id, players.user_id, players.answer, u.public_address
            FROM players
            LEFT JOIN users u ON players.user_id = u.id
            WHERE players.duel_id = ? AND players.final_status = ? AND players.created_at > ?
            ORDER BY players.created_at
            "#,
        )
        .bind(duel_id.to_string())
        .bind(PlayerStatus::Active as i64)
        .bind(fmt_ts(deadline)?)
        .fetch_all(self.db.read())
        .await?;

        Ok(players)
    }

    /// Every player of the duel with their payout address.
    pub async fn get_all_players_with_addresses(
        &self,
        duel_id: Uuid,
    ) -> Result<Vec<PlayerWithAddress>, Error> {
        let players = sqlx::query_as::<_, PlayerWithAddress>(
            r#"
            SELECT players.id, players.user_id, players.answer, u.public_address
            FROM players
            LEFT JOIN users u ON players.user_id = u.id
            WHERE players.duel_id = ?
            ORDER BY players.created_at
            "#,
        )
        .bind(duel_id.to_string())
        .fetch_all(self.db.read())
        .await?;

        Ok(players)
    }

    pub async fn get_loser_ids(
        &self,
        duel_id: Uuid,
        wrong_answer: u8,
        deadline: OffsetDateTime,
    ) -> Result<Vec<Uuid>, Error> {
        let raw: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT user_id FROM players
            WHERE duel_id = ? AND answer = ? AND created_at <= ?
            "#,
        )
        .bind(duel_id.to_string())
        .bind(wrong_answer as i64)
        .bind(fmt_ts(deadline)?)
        .fetch_all(self.db.read())
        .await?;

        raw.into_iter()
            .map(|s| {
                Uuid::parse_str(&s)
                    .map_err(|e| Error::Internal(format!("invalid user id in players: {}", e)))
            })
            .collect()
    }

    pub async fn get_refunded_players(&self, duel_id: Uuid) -> Result<Vec<Player>, Error> {
        let players = sqlx::query_as::<_, Player>(
            "SELECT * FROM players WHERE duel_id = ? AND final_status = ?",
        )
        .bind(duel_id.to_string())
        .bind(PlayerStatus::Refunded as i64)
        .fetch_all(self.db.read())
        .await?;

        Ok(players)
    }

    /// Settle the winners: flag, record the display amount, close out.
    pub async fn update_duel_winners(
        &self,
        tx: &mut DbTx,
        winner_ids: &[Uuid],
        win_amount: f64,
    ) -> Result<(), Error> {
        if winner_ids.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "UPDATE players SET is_winner = 1, win_amount = ",
        );
        builder.push_bind(win_amount);
        builder.push(", final_status = ");
        builder.push_bind(PlayerStatus::Resolved as i64);
        builder.push(" WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in winner_ids {
            separated.push_bind(id.to_string());
        }
        separated.push_unseparated(")");

        builder.build().execute(&mut **tx).await?;
        Ok(())
    }

    pub async fn set_players_status(
        &self,
        tx: &mut DbTx,
        player_ids: &[Uuid],
        status: PlayerStatus,
    ) -> Result<(), Error> {
        if player_ids.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE players SET final_status = ");
        builder.push_bind(status as i64);
        builder.push(" WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in player_ids {
            separated.push_bind(id.to_string());
        }
        separated.push_unseparated(")");

        builder.build().execute(&mut **tx).await?;
        Ok(())
    }

    pub async fn set_all_players_status(
        &self,
        tx: &mut DbTx,
        duel_id: Uuid,
        status: PlayerStatus,
    ) -> Result<(), Error> {
        sqlx::query("UPDATE players SET final_status = ? WHERE duel_id = ?")
            .bind(status as i64)
            .bind(duel_id.to_string())
            .execute(&mut **tx)
            .await?;

        Ok(())
    }
}
