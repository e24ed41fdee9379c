use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

struct ActiveRecord {
    channel_id: i64,
    expires_at: Instant,
}

/// Which channel each user is actively viewing right now. Records carry an
/// absolute expiry renewed on every heartbeat; the store itself enforces the
/// TTL, so a stale record reads back as absent. Last write wins — at most one
/// active channel per user.
#[derive(Clone, Default)]
pub struct PresenceTracker {
    inner: Arc<Mutex<HashMap<i64, ActiveRecord>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active(&self, user_id: i64, channel_id: i64, ttl: Duration) {
        let mut map = self.inner.lock().expect("presence lock poisoned");
        map.insert(
            user_id,
            ActiveRecord {
                channel_id,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn clear_active(&self, user_id: i64) {
        let mut map = self.inner.lock().expect("presence lock poisoned");
        map.remove(&user_id);
    }

    pub fn get_active(&self, user_id: i64) -> Option<i64> {
        let mut map = self.inner.lock().expect("presence lock poisoned");
        Self::read(&mut map, user_id)
    }

    /// One lookup for a whole fan-out: the router partitions recipients into
    /// live and push groups from this single call.
    pub fn get_active_bulk(&self, user_ids: &[i64]) -> HashMap<i64, Option<i64>> {
        let mut map = self.inner.lock().expect("presence lock poisoned");
        user_ids
            .iter()
            .map(|&user_id| (user_id, Self::read(&mut map, user_id)))
            .collect()
    }

    fn read(map: &mut HashMap<i64, ActiveRecord>, user_id: i64) -> Option<i64> {
        match map.get(&user_id) {
            Some(record) if record.expires_at > Instant::now() => Some(record.channel_id),
            Some(_) => {
                // Expired: purge lazily.
                map.remove(&user_id);
                None
            }
            None => None,
        }
    }
}
