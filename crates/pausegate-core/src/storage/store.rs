//! SQLite-backed durable store for crash recovery.
//!
//! The in-memory engine state is authoritative at runtime; this store is a
//! best-effort crash-recovery backup with no read-after-write consistency
//! requirement. It holds:
//! - per-app records, only ever in the ACTIVE or INTERVENTION_ACTIVE state
//! - the preserved-intervention app-id set
//! - the monitored-app allowlist
//! - the quota record
//! - a small key-value table for engine metadata
//!
//! A read failure for one record must never block restoration of the rest:
//! malformed rows are logged and skipped.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use super::data_dir;
use crate::error::StoreError;
use crate::events::AppId;
use crate::quota::QuotaState;
use crate::session::{AppEntry, AppState};

/// One restored per-app row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedAppRecord {
    pub app_id: AppId,
    pub state: AppState,
    pub expires_at: Option<DateTime<Utc>>,
}

/// SQLite database holding the engine's durable state.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open the store at `~/.config/pausegate/pausegate.db`.
    ///
    /// Creates the database file and schema if they don't exist.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open() -> Result<Self, StoreError> {
        let path = data_dir()
            .map_err(|e| StoreError::MigrationFailed(e.to_string()))?
            .join("pausegate.db");
        Self::open_at(&path)
    }

    /// Open the store at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|source| StoreError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory store (tests and the replay harness).
    pub fn open_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS app_records (
                    app_id     TEXT PRIMARY KEY,
                    state      TEXT NOT NULL,
                    expires_at TEXT
                );

                CREATE TABLE IF NOT EXISTS preserved (
                    app_id TEXT PRIMARY KEY
                );

                CREATE TABLE IF NOT EXISTS allowlist (
                    app_id TEXT PRIMARY KEY
                );

                CREATE TABLE IF NOT EXISTS quota (
                    id              INTEGER PRIMARY KEY CHECK (id = 0),
                    max             INTEGER NOT NULL,
                    window_start_at TEXT NOT NULL,
                    remaining       INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS kv (
                    key   TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );",
            )
            .map_err(|e| StoreError::MigrationFailed(e.to_string()))
    }

    // ── Per-app records ─────────────────────────────────────────────

    /// Write a per-app record. Only ACTIVE and INTERVENTION_ACTIVE are
    /// durable; any other state deletes the key.
    pub fn persist_entry(&self, entry: &AppEntry) -> Result<(), StoreError> {
        if !entry.state.is_durable() {
            return self.delete_entry(&entry.app_id);
        }
        self.conn.execute(
            "INSERT OR REPLACE INTO app_records (app_id, state, expires_at)
             VALUES (?1, ?2, ?3)",
            params![
                entry.app_id,
                entry.state.as_str(),
                entry.expires_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn delete_entry(&self, app_id: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM app_records WHERE app_id = ?1", params![app_id])?;
        Ok(())
    }

    /// Load every per-app record. A malformed row degrades to absent and is
    /// logged; it never blocks the others.
    pub fn load_entries(&self) -> Result<Vec<PersistedAppRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT app_id, state, expires_at FROM app_records")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (app_id, state_str, expires_str) = match row {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable app record");
                    continue;
                }
            };
            let Some(state) = AppState::parse(&state_str) else {
                tracing::warn!(%app_id, state = %state_str, "skipping app record with unknown state");
                continue;
            };
            let expires_at = match expires_str {
                None => None,
                Some(s) => match DateTime::parse_from_rfc3339(&s) {
                    Ok(t) => Some(t.with_timezone(&Utc)),
                    Err(e) => {
                        tracing::warn!(%app_id, error = %e, "skipping app record with bad expiry");
                        continue;
                    }
                },
            };
            records.push(PersistedAppRecord {
                app_id,
                state,
                expires_at,
            });
        }
        Ok(records)
    }

    // ── Preserved-intervention flags ────────────────────────────────

    pub fn set_preserved(&self, app_id: &str, preserved: bool) -> Result<(), StoreError> {
        if preserved {
            self.conn.execute(
                "INSERT OR IGNORE INTO preserved (app_id) VALUES (?1)",
                params![app_id],
            )?;
        } else {
            self.conn
                .execute("DELETE FROM preserved WHERE app_id = ?1", params![app_id])?;
        }
        Ok(())
    }

    pub fn load_preserved(&self) -> Result<HashSet<AppId>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT app_id FROM preserved")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut set = HashSet::new();
        for row in rows {
            match row {
                Ok(app_id) => {
                    set.insert(app_id);
                }
                Err(e) => tracing::warn!(error = %e, "skipping unreadable preserved flag"),
            }
        }
        Ok(set)
    }

    // ── Monitored-app allowlist ─────────────────────────────────────

    pub fn allow_app(&self, app_id: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO allowlist (app_id) VALUES (?1)",
            params![app_id],
        )?;
        Ok(())
    }

    pub fn disallow_app(&self, app_id: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM allowlist WHERE app_id = ?1", params![app_id])?;
        Ok(())
    }

    pub fn load_allowlist(&self) -> Result<HashSet<AppId>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT app_id FROM allowlist")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut set = HashSet::new();
        for row in rows {
            match row {
                Ok(app_id) => {
                    set.insert(app_id);
                }
                Err(e) => tracing::warn!(error = %e, "skipping unreadable allowlist row"),
            }
        }
        Ok(set)
    }

    // ── Quota record ────────────────────────────────────────────────

    pub fn save_quota(&self, state: &QuotaState) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO quota (id, max, window_start_at, remaining)
             VALUES (0, ?1, ?2, ?3)",
            params![state.max, state.window_start_at.to_rfc3339(), state.remaining],
        )?;
        Ok(())
    }

    pub fn load_quota(&self) -> Result<Option<QuotaState>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT max, window_start_at, remaining FROM quota WHERE id = 0")?;
        let result = stmt.query_row([], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
            ))
        });
        match result {
            Ok((max, window_str, remaining)) => {
                match DateTime::parse_from_rfc3339(&window_str) {
                    Ok(window_start_at) => Ok(Some(QuotaState {
                        max,
                        window_start_at: window_start_at.with_timezone(&Utc),
                        remaining,
                    })),
                    Err(e) => {
                        tracing::warn!(error = %e, "discarding quota record with bad window start");
                        Ok(None)
                    }
                }
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ── Key-value metadata ──────────────────────────────────────────

    pub fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
        let result = stmt.query_row(params![key], |row| row.get::<_, String>(0));
        match result {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn kv_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn active_entry(app_id: &str, expires_at: DateTime<Utc>) -> AppEntry {
        AppEntry {
            app_id: app_id.to_string(),
            state: AppState::Active,
            expires_at: Some(expires_at),
            post_choice_shown: false,
            last_recovery_launch_at: None,
            suppress_recovery_until: None,
        }
    }

    #[test]
    fn only_durable_states_persist() {
        let store = Store::open_memory().unwrap();
        let now = Utc::now();

        let mut entry = active_entry("a", now + Duration::minutes(5));
        store.persist_entry(&entry).unwrap();
        assert_eq!(store.load_entries().unwrap().len(), 1);

        // Transitioning to a transient state deletes the row.
        entry.state = AppState::PostChoice;
        store.persist_entry(&entry).unwrap();
        assert!(store.load_entries().unwrap().is_empty());

        entry.state = AppState::Decision;
        store.persist_entry(&entry).unwrap();
        assert!(store.load_entries().unwrap().is_empty());
    }

    #[test]
    fn entry_roundtrip_keeps_expiry() {
        let store = Store::open_memory().unwrap();
        let expires = Utc::now() + Duration::minutes(3);
        store.persist_entry(&active_entry("a", expires)).unwrap();

        let records = store.load_entries().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, AppState::Active);
        let restored = records[0].expires_at.unwrap();
        assert!((restored - expires).num_milliseconds().abs() < 1000);
    }

    #[test]
    fn malformed_row_does_not_block_others() {
        let store = Store::open_memory().unwrap();
        let now = Utc::now();
        store
            .persist_entry(&active_entry("good", now + Duration::minutes(5)))
            .unwrap();
        // Simulate a corrupted row written by a broken build.
        store
            .conn
            .execute(
                "INSERT INTO app_records (app_id, state, expires_at)
                 VALUES ('bad', 'running', 'not-a-timestamp')",
                [],
            )
            .unwrap();
        store
            .conn
            .execute(
                "INSERT INTO app_records (app_id, state, expires_at)
                 VALUES ('bad2', 'active', 'not-a-timestamp')",
                [],
            )
            .unwrap();

        let records = store.load_entries().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].app_id, "good");
    }

    #[test]
    fn preserved_flag_roundtrip() {
        let store = Store::open_memory().unwrap();
        store.set_preserved("a", true).unwrap();
        store.set_preserved("a", true).unwrap();
        store.set_preserved("b", true).unwrap();
        store.set_preserved("b", false).unwrap();

        let set = store.load_preserved().unwrap();
        assert!(set.contains("a"));
        assert!(!set.contains("b"));
    }

    #[test]
    fn allowlist_roundtrip() {
        let store = Store::open_memory().unwrap();
        store.allow_app("a").unwrap();
        store.allow_app("b").unwrap();
        store.disallow_app("a").unwrap();
        let set = store.load_allowlist().unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains("b"));
    }

    #[test]
    fn quota_roundtrip_and_overwrite() {
        let store = Store::open_memory().unwrap();
        assert!(store.load_quota().unwrap().is_none());

        let now = Utc::now();
        store
            .save_quota(&QuotaState {
                max: 6,
                window_start_at: now,
                remaining: 4,
            })
            .unwrap();
        store
            .save_quota(&QuotaState {
                max: 6,
                window_start_at: now,
                remaining: 3,
            })
            .unwrap();

        let quota = store.load_quota().unwrap().unwrap();
        assert_eq!(quota.remaining, 3);
        assert_eq!(quota.max, 6);
    }

    #[test]
    fn kv_store() {
        let store = Store::open_memory().unwrap();
        assert!(store.kv_get("test").unwrap().is_none());
        store.kv_set("test", "hello").unwrap();
        assert_eq!(store.kv_get("test").unwrap().unwrap(), "hello");
    }

    #[test]
    fn open_at_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pausegate.db");
        {
            let store = Store::open_at(&path).unwrap();
            store.allow_app("a").unwrap();
        }
        let store = Store::open_at(&path).unwrap();
        assert!(store.load_allowlist().unwrap().contains("a"));
    }
}
