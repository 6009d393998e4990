//! Durable latest-value cache: one SQLite row per source.
//!
//! Each row holds the JSON entity map of the newest snapshot, overwritten
//! wholesale on every update. Revisions are not persisted. The aggregator is
//! the only writer.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{info, warn};

use crate::error::Result;
use crate::types::{EntityValues, SourceId};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS latest_snapshot (
    source     TEXT PRIMARY KEY,
    entities   TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
";

pub struct LatestValueCache {
    conn: Mutex<Connection>,
}

impl LatestValueCache {
    /// Open (or create) the cache file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        // WAL keeps NORMAL crash-safe; only the newest commits can be lost.
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        info!(path = %path.display(), "latest-value cache opened");
        Self::init(conn)
    }

    /// Non-durable cache, for tests and benches.
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement leaves SQLite itself consistent.
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Overwrite the entry for the entities' source.
    pub fn store(&self, entities: &EntityValues) -> Result<()> {
        let json = serde_json::to_string(entities)?;
        let updated_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX));
        self.conn().execute(
            "INSERT INTO latest_snapshot(source, entities, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(source) DO UPDATE SET entities = excluded.entities, updated_at = excluded.updated_at",
            params![entities.source().as_str(), json, updated_at],
        )?;
        Ok(())
    }

    /// Latest entity map for `source`, if one was ever stored.
    pub fn load(&self, source: SourceId) -> Result<Option<EntityValues>> {
        let json: Option<String> = self
            .conn()
            .query_row(
                "SELECT entities FROM latest_snapshot WHERE source = ?1",
                params![source.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| EntityValues::from_json(source, &j))
            .transpose()
            .map_err(Into::into)
    }

    /// Every readable entry. Rows that no longer parse are skipped with a warning.
    #[must_use]
    pub fn load_all(&self) -> Vec<EntityValues> {
        SourceId::ALL
            .into_iter()
            .filter_map(|source| match self.load(source) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(source = source.as_str(), error = %e, "unreadable cache entry");
                    None
                }
            })
            .collect()
    }
}
