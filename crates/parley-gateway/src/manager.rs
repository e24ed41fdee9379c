use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Collaborator that records whether a user currently has a live connection.
pub trait OnlineStatus: Send + Sync {
    fn set_online(&self, user_id: i64);
    fn set_offline(&self, user_id: i64);
    fn is_online(&self, user_id: i64) -> bool;
}

/// Process-local online registry.
#[derive(Default)]
pub struct InMemoryOnlineStatus {
    online: RwLock<HashSet<i64>>,
}

impl OnlineStatus for InMemoryOnlineStatus {
    fn set_online(&self, user_id: i64) {
        self.online
            .write()
            .expect("online set poisoned")
            .insert(user_id);
    }

    fn set_offline(&self, user_id: i64) {
        self.online
            .write()
            .expect("online set poisoned")
            .remove(&user_id);
    }

    fn is_online(&self, user_id: i64) -> bool {
        self.online
            .read()
            .expect("online set poisoned")
            .contains(&user_id)
    }
}

struct SessionEntry {
    conn_id: Uuid,
    cancel: CancellationToken,
}

/// Registry of live sessions, at most one per user. Registering a new session
/// cancels the previous one; releasing is guarded by connection id so a stale
/// teardown never clobbers its replacement.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    sessions: Mutex<HashMap<i64, SessionEntry>>,
    online: Arc<dyn OnlineStatus>,
}

impl ConnectionManager {
    pub fn new(online: Arc<dyn OnlineStatus>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                sessions: Mutex::new(HashMap::new()),
                online,
            }),
        }
    }

    /// Register a session for `user_id`, marking them online. Any previous
    /// session for the same user is cancelled — one live channel per user.
    pub fn register(&self, user_id: i64) -> (Uuid, CancellationToken) {
        let conn_id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        let mut sessions = self
            .inner
            .sessions
            .lock()
            .expect("session registry poisoned");
        if let Some(previous) = sessions.insert(
            user_id,
            SessionEntry {
                conn_id,
                cancel: cancel.clone(),
            },
        ) {
            info!("user {} reconnected, cancelling previous session", user_id);
            previous.cancel.cancel();
        }
        drop(sessions);

        self.inner.online.set_online(user_id);
        (conn_id, cancel)
    }

    /// Release a session's registry entry and mark the owner offline — but
    /// only if this connection still owns the entry. A newer connection has
    /// taken over otherwise, and nothing is touched.
    pub fn release(&self, user_id: i64, conn_id: Uuid) {
        let owned = {
            let mut sessions = self
                .inner
                .sessions
                .lock()
                .expect("session registry poisoned");
            match sessions.get(&user_id) {
                Some(entry) if entry.conn_id == conn_id => {
                    sessions.remove(&user_id);
                    true
                }
                _ => false,
            }
        };

        if owned {
            self.inner.online.set_offline(user_id);
        }
    }

    pub fn is_connected(&self, user_id: i64) -> bool {
        self.inner
            .sessions
            .lock()
            .expect("session registry poisoned")
            .contains_key(&user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (ConnectionManager, Arc<InMemoryOnlineStatus>) {
        let online = Arc::new(InMemoryOnlineStatus::default());
        (ConnectionManager::new(online.clone()), online)
    }

    #[test]
    fn register_marks_online_and_release_marks_offline() {
        let (manager, online) = manager();
        let (conn_id, _cancel) = manager.register(1);
        assert!(online.is_online(1));
        assert!(manager.is_connected(1));

        manager.release(1, conn_id);
        assert!(!online.is_online(1));
        assert!(!manager.is_connected(1));
    }

    #[test]
    fn new_session_cancels_the_previous_one() {
        let (manager, online) = manager();
        let (old_conn, old_cancel) = manager.register(1);
        let (_new_conn, new_cancel) = manager.register(1);

        assert!(old_cancel.is_cancelled());
        assert!(!new_cancel.is_cancelled());

        // The old session's teardown must not clobber the new session.
        manager.release(1, old_conn);
        assert!(manager.is_connected(1));
        assert!(online.is_online(1));
    }
}
