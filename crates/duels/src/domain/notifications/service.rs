use log::{error, info};
use std::{sync::Arc, time::Duration};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::Notification;
use crate::{domain::Error, infra::db::DBConnection, infra::events::EventHub};

/// Persist-then-publish notification fan-out. The row must land before
/// anything is pushed; a failed insert suppresses the publish entirely.
#[derive(Clone)]
pub struct NotificationService {
    db: DBConnection,
    hub: EventHub,
}

impl NotificationService {
    pub fn new(db: DBConnection, hub: EventHub) -> Self {
        Self { db, hub }
    }

    pub async fn publish(&self, notification: &Notification) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, user_id, notification_type, data, is_read, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(notification.id.to_string())
        .bind(notification.user_id.to_string())
        .bind(notification.notification_type as i64)
        .bind(
            serde_json::to_vec(&notification.data)
                .map_err(|e| Error::Internal(format!("failed to marshal notification: {}", e)))?,
        )
        .bind(notification.is_read)
        .bind(
            notification
                .created_at
                .format(&Rfc3339)
                .map_err(|e| Error::Internal(format!("failed to format timestamp: {}", e)))?,
        )
        .execute(self.db.write())
        .await?;

        self.hub.publish(notification.user_id, notification)?;
        Ok(())
    }

    pub async fn get_for_user(&self, user_id: Uuid) -> Result<Vec<Notification>, Error> {
        let notifications = sqlx::query_as::<_, Notification>(
            "SELECT * FROM notifications WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id.to_string())
        .fetch_all(self.db.read())
        .await?;

        Ok(notifications)
    }

    pub async fn unread_count(&self, user_id: Uuid) -> Result<u64, Error> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM notifications WHERE user_id = ? AND is_read = 0")
                .bind(user_id.to_string())
                .fetch_one(self.db.read())
                .await?;

        Ok(count as u64)
    }

    pub async fn mark_read(
        &self,
        user_id: Uuid,
        notification_id: Uuid,
    ) -> Result<Notification, Error> {
        let updated = sqlx::query("UPDATE notifications SET is_read = 1 WHERE id = ? AND user_id = ?")
            .bind(notification_id.to_string())
            .bind(user_id.to_string())
            .execute(self.db.write())
            .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::NotFound("user notification not found".to_string()));
        }

        let notification = sqlx::query_as::<_, Notification>(
            "SELECT * FROM notifications WHERE id = ?",
        )
        .bind(notification_id.to_string())
        .fetch_one(self.db.read())
        .await?;

        Ok(notification)
    }

    pub async fn mark_all_read(&self, user_id: Uuid) -> Result<u64, Error> {
        let updated =
            sqlx::query("UPDATE notifications SET is_read = 1 WHERE user_id = ? AND is_read = 0")
                .bind(user_id.to_string())
                .execute(self.db.write())
                .await?;

        Ok(updated.rows_affected())
    }

    /// Age-based garbage collection of notification rows.
    pub async fn delete_older_than(&self, cutoff: OffsetDateTime) -> Result<u64, Error> {
        let deleted = sqlx::query("DELETE FROM notifications WHERE created_at < ?")
            .bind(
                cutoff
                    .format(&Rfc3339)
                    .map_err(|e| Error::Internal(format!("failed to format timestamp: {}", e)))?,
            )
            .execute(self.db.write())
            .await?;

        Ok(deleted.rows_affected())
    }
}

/// Daily sweep deleting notifications past their retention window.
pub struct NotificationCleanupWatcher {
    notifications: Arc<NotificationService>,
    retention: time::Duration,
    sweep_interval: Duration,
    cancel_token: CancellationToken,
}

impl NotificationCleanupWatcher {
    pub fn new(
        notifications: Arc<NotificationService>,
        cancel_token: CancellationToken,
        retention: time::Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            notifications,
            retention,
            sweep_interval,
            cancel_token,
        }
    }

    pub async fn watch(&self) -> Result<(), anyhow::Error> {
        info!("Starting notification cleanup watcher");

        loop {
            if self.cancel_token.is_cancelled() {
                info!("Notification cleanup watcher received cancellation");
                break;
            }

            tokio::select! {
                _ = sleep(self.sweep_interval) => {}
                _ = self.cancel_token.cancelled() => {
                    info!("Notification cleanup watcher cancelled during sleep");
                    break;
                }
            }

            let cutoff = OffsetDateTime::now_utc() - self.retention;
            match self.notifications.delete_older_than(cutoff).await {
                Ok(deleted) if deleted > 0 => {
                    info!("Deleted {} old notifications", deleted);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Notification cleanup error: {}", e);
                }
            }
        }

        Ok(())
    }
}
