use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};
use uuid::Uuid;

use crate::domain::Error;

pub const USER_SESSIONS_LIMIT: usize = 5;

#[derive(Debug, Clone)]
struct SessionEntry {
    refresh_token: String,
    expires_at: Instant,
}

/// Bounded per-user refresh-token storage.
///
/// Each user holds at most [`USER_SESSIONS_LIMIT`] sessions, keyed by a
/// time-sortable field derived from the v7 session id; saving past the
/// limit evicts the oldest ids first. Entries expire individually.
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<Uuid, BTreeMap<String, SessionEntry>>>>,
}

/// Sortable storage field for a session id: the v7 timestamp when the id
/// carries one, the raw id otherwise. The id itself breaks ties between
/// sessions created within the same millisecond.
fn session_field(session_id: Uuid) -> String {
    match session_id.get_timestamp() {
        Some(ts) => {
            let (secs, nanos) = ts.to_unix();
            format!("{:020}{:09}-{}", secs, nanos, session_id.simple())
        }
        None => session_id.to_string(),
    }
}

pub fn user_sessions_key(user_id: Uuid) -> String {
    format!("user:{}:session", user_id)
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        refresh_token: String,
        ttl: Duration,
    ) -> Result<(), Error> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| Error::Internal("session store lock poisoned".to_string()))?;

        let user_sessions = sessions.entry(user_id).or_default();
        user_sessions.retain(|_, entry| entry.expires_at > Instant::now());

        // Session ids sort by time, so the map's first keys are the oldest
        while user_sessions.len() >= USER_SESSIONS_LIMIT {
            let Some(oldest) = user_sessions.keys().next().cloned() else {
                break;
            };
            user_sessions.remove(&oldest);
        }

        user_sessions.insert(
            session_field(session_id),
            SessionEntry {
                refresh_token,
                expires_at: Instant::now() + ttl,
            },
        );

        Ok(())
    }

    pub fn get(&self, user_id: Uuid, session_id: Uuid) -> Result<String, Error> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| Error::Internal("session store lock poisoned".to_string()))?;

        let entry = sessions
            .get(&user_id)
            .and_then(|user_sessions| user_sessions.get(&session_field(session_id)))
            .ok_or_else(|| Error::NotFound("token not found in storage".to_string()))?;

        if entry.expires_at <= Instant::now() {
            return Err(Error::NotFound("token not found in storage".to_string()));
        }

        Ok(entry.refresh_token.clone())
    }

    pub fn delete(&self, user_id: Uuid, session_id: Uuid) -> Result<(), Error> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| Error::Internal("session store lock poisoned".to_string()))?;

        if let Some(user_sessions) = sessions.get_mut(&user_id) {
            user_sessions.remove(&session_field(session_id));
            if user_sessions.is_empty() {
                sessions.remove(&user_id);
            }
        }

        Ok(())
    }

    pub fn session_count(&self, user_id: Uuid) -> usize {
        self.sessions
            .read()
            .map(|sessions| sessions.get(&user_id).map_or(0, |s| s.len()))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_get_round_trip() {
        let store = SessionStore::new();
        let user_id = Uuid::new_v4();
        let session_id = Uuid::now_v7();

        store
            .save(user_id, session_id, "token-1".to_string(), Duration::from_secs(60))
            .unwrap();

        assert_eq!(store.get(user_id, session_id).unwrap(), "token-1");
        assert!(matches!(
            store.get(user_id, Uuid::now_v7()),
            Err(Error::NotFound(_))
        ));

        store.delete(user_id, session_id).unwrap();
        assert!(store.get(user_id, session_id).is_err());
    }

    #[test]
    fn sixth_session_evicts_the_oldest() {
        let store = SessionStore::new();
        let user_id = Uuid::new_v4();

        let mut session_ids = Vec::new();
        for i in 0..USER_SESSIONS_LIMIT {
            let session_id = Uuid::now_v7();
            session_ids.push(session_id);
            store
                .save(
                    user_id,
                    session_id,
                    format!("token-{}", i),
                    Duration::from_secs(60),
                )
                .unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(store.session_count(user_id), USER_SESSIONS_LIMIT);

        let newest = Uuid::now_v7();
        store
            .save(user_id, newest, "token-new".to_string(), Duration::from_secs(60))
            .unwrap();

        assert_eq!(store.session_count(user_id), USER_SESSIONS_LIMIT);
        assert!(
            store.get(user_id, session_ids[0]).is_err(),
            "oldest session must be evicted"
        );
        assert_eq!(store.get(user_id, newest).unwrap(), "token-new");
        assert_eq!(store.get(user_id, session_ids[1]).unwrap(), "token-1");
    }

    #[test]
    fn expired_sessions_are_not_returned() {
        let store = SessionStore::new();
        let user_id = Uuid::new_v4();
        let session_id = Uuid::now_v7();

        store
            .save(user_id, session_id, "token".to_string(), Duration::ZERO)
            .unwrap();

        assert!(matches!(
            store.get(user_id, session_id),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn session_keys_sort_chronologically() {
        let older = Uuid::now_v7();
        std::thread::sleep(Duration::from_millis(2));
        let newer = Uuid::now_v7();
        assert!(session_field(older) < session_field(newer));
    }

    #[test]
    fn key_naming_matches_the_session_space() {
        let user_id = Uuid::nil();
        assert_eq!(
            user_sessions_key(user_id),
            "user:00000000-0000-0000-0000-000000000000:session"
        );
    }
}
