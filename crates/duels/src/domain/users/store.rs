use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use uuid::Uuid;

use super::{User, UserStats};
use crate::{domain::Error, infra::db::DBConnection};
use duels_core::{PlayerStatus, Username};

#[derive(Clone, Debug)]
pub struct UserStore {
    db: DBConnection,
}

fn fmt_ts(ts: OffsetDateTime) -> Result<String, Error> {
    ts.format(&Rfc3339)
        .map_err(|e| Error::Internal(format!("failed to format timestamp: {}", e)))
}

impl UserStore {
    pub fn new(db: DBConnection) -> Self {
        Self { db }
    }

    pub async fn create_user(&self, user: &User) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, image_url, public_address, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user.id.to_string())
        .bind(user.username.as_str())
        .bind(&user.image_url)
        .bind(&user.public_address)
        .bind(fmt_ts(user.created_at)?)
        .bind(fmt_ts(user.updated_at)?)
        .execute(self.db.write())
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                Error::Conflict("public address is already linked".to_string())
            }
            other => Error::Db(other),
        })?;

        Ok(())
    }

    pub async fn get_by_id(&self, user_id: Uuid) -> Result<User, Error> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(user_id.to_string())
            .fetch_optional(self.db.read())
            .await?
            .ok_or_else(|| Error::NotFound(format!("user {} not found", user_id)))
    }

    pub async fn get_by_public_address(&self, public_address: &str) -> Result<Option<User>, Error> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE public_address = ?")
            .bind(public_address)
            .fetch_optional(self.db.read())
            .await?;

        Ok(user)
    }

    pub async fn change_username(&self, user_id: Uuid, username: &Username) -> Result<(), Error> {
        let updated = sqlx::query("UPDATE users SET username = ?, updated_at = ? WHERE id = ?")
            .bind(username.as_str())
            .bind(fmt_ts(OffsetDateTime::now_utc())?)
            .bind(user_id.to_string())
            .execute(self.db.write())
            .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::NotFound(format!("user {} not found", user_id)));
        }

        Ok(())
    }

    pub async fn change_avatar(&self, user_id: Uuid, image_url: &str) -> Result<(), Error> {
        let updated = sqlx::query("UPDATE users SET image_url = ?, updated_at = ? WHERE id = ?")
            .bind(image_url)
            .bind(fmt_ts(OffsetDateTime::now_utc())?)
            .bind(user_id.to_string())
            .execute(self.db.write())
            .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::NotFound(format!("user {} not found", user_id)));
        }

        Ok(())
    }

    /// Lifetime per-user aggregates across every settled duel.
    pub async fn get_user_stats(&self, user_id: Uuid) -> Result<UserStats, Error> {
        let row: (i64, i64, i64, i64, f64, f64, f64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) AS participated,
                COALESCE(SUM(CASE WHEN is_winner = 1 THEN 1 ELSE 0 END), 0) AS wins_count,
                COALESCE(SUM(CASE WHEN is_winner = 0 AND final_status = ? THEN 1 ELSE 0 END), 0) AS losses_count,
                COALESCE(SUM(CASE WHEN final_status = ? THEN 1 ELSE 0 END), 0) AS refunded_count,
                COALESCE(SUM(CASE WHEN is_winner = 1 THEN win_amount ELSE 0 END), 0.0) AS earned_amount,
                COALESCE(SUM(CASE WHEN is_winner = 0 AND final_status = ? THEN d.duel_price ELSE 0 END), 0.0) AS lost_amount,
                COALESCE(SUM(CASE WHEN players.final_status = ? THEN d.duel_price ELSE 0 END), 0.0) AS refunded_amount
            FROM players
            INNER JOIN duels d ON d.id = players.duel_id
            WHERE players.user_id = ?
            "#,
        )
        .bind(PlayerStatus::Resolved as i64)
        .bind(PlayerStatus::Refunded as i64)
        .bind(PlayerStatus::Resolved as i64)
        .bind(PlayerStatus::Refunded as i64)
        .bind(user_id.to_string())
        .fetch_one(self.db.read())
        .await?;

        let (participated, wins, losses, refunded, earned, lost, refunded_amount) = row;
        Ok(UserStats {
            participated: participated as u64,
            wins_count: wins as u64,
            losses_count: losses as u64,
            refunded_count: refunded as u64,
            earned_amount: earned,
            lost_amount: lost,
            refunded_amount,
            net_profit: earned - lost,
        })
    }
}
