pub mod migrations;
pub mod models;
pub mod queries;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::info;

/// Errors surfaced by the persistence layer. Anchor misses get their own
/// variant so the API layer can turn them into a 404 instead of a 500.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no anchor message for this user in channel {0}")]
    NoAnchor(i64),
    #[error("channel {0} not found")]
    ChannelNotFound(i64),
    #[error("user {user_id} is already subscribed to channel {channel_id}")]
    AlreadySubscribed { user_id: i64, channel_id: i64 },
    #[error("user {user_id} is not subscribed to channel {channel_id}")]
    NotSubscribed { user_id: i64, channel_id: i64 },
    #[error("database lock poisoned")]
    LockPoisoned,
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run(&conn)?;

        info!("Database opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database, one per caller. Used by tests and local
    /// tooling.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&conn)
    }
}
