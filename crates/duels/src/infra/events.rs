use log::debug;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::Error;

const CHANNEL_CAPACITY: usize = 64;

/// In-process pub/sub hub for per-user event channels.
///
/// Keys follow the `user:<uuid>:events` space. A channel is created on the
/// first subscriber and reaped once the last receiver is gone; publishing
/// to a key without live subscribers is a no-op. The hub is owned by the
/// application root and injected where needed.
#[derive(Clone, Default)]
pub struct EventHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_event_key(user_id: Uuid) -> String {
        format!("user:{}:events", user_id)
    }

    /// Subscribe to a user's event stream. The returned receiver sees every
    /// payload published after this call.
    pub fn subscribe(&self, user_id: Uuid) -> broadcast::Receiver<String> {
        let key = Self::user_event_key(user_id);
        let mut channels = self.channels.lock().expect("event hub lock poisoned");
        channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a serializable payload to a user's event channel. Delivery is
    /// best-effort: missing subscribers are not an error.
    pub fn publish<T: Serialize>(&self, user_id: Uuid, payload: &T) -> Result<(), Error> {
        let serialized = serde_json::to_string(payload)
            .map_err(|e| Error::Internal(format!("failed to serialize event payload: {}", e)))?;

        let key = Self::user_event_key(user_id);
        let mut channels = self.channels.lock().expect("event hub lock poisoned");
        if let Some(sender) = channels.get(&key) {
            if sender.receiver_count() == 0 {
                channels.remove(&key);
                debug!("reaped idle event channel {}", key);
                return Ok(());
            }
            // Err means every receiver dropped between the check and the send
            let _ = sender.send(serialized);
        }

        Ok(())
    }

    #[cfg(test)]
    pub fn channel_count(&self) -> usize {
        self.channels.lock().expect("event hub lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duels_core::UserEvent;

    #[tokio::test]
    async fn delivers_events_to_subscriber() {
        let hub = EventHub::new();
        let user_id = Uuid::new_v4();
        let mut rx = hub.subscribe(user_id);

        hub.publish(user_id, &UserEvent::insufficient_funds())
            .unwrap();

        let payload = rx.recv().await.unwrap();
        assert_eq!(payload, r#"{"type":1}"#);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = EventHub::new();
        let user_id = Uuid::new_v4();

        hub.publish(user_id, &UserEvent::insufficient_funds())
            .unwrap();
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn reaps_channel_after_last_receiver_drops() {
        let hub = EventHub::new();
        let user_id = Uuid::new_v4();

        let rx = hub.subscribe(user_id);
        assert_eq!(hub.channel_count(), 1);
        drop(rx);

        hub.publish(user_id, &UserEvent::insufficient_funds())
            .unwrap();
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn channels_are_isolated_per_user() {
        let hub = EventHub::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut rx_a = hub.subscribe(a);
        let mut rx_b = hub.subscribe(b);

        hub.publish(a, &UserEvent::insufficient_funds()).unwrap();

        assert!(rx_a.recv().await.is_ok());
        assert!(rx_b.try_recv().is_err());
    }
}
