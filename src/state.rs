//! State Management - SQLite-based persistence for the monitor
//!
//! This module provides persistent storage for:
//! - KnownStarSet (every repository id ever observed as starred)
//! - ETag cache entries for the starred listing pages
//! - The pending queue (digest entries and the instant-mode outbox)
//! - Digest mode, monitor control state and the last error
//! - Credentials (GitHub token)
//!
//! The database is stored in XDG_DATA_HOME/starwatch/state.db

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::cache::CacheEntry;
use crate::models::{Destination, DigestMode, StarredRepo};

const KEY_BASELINE: &str = "baseline_established";
const KEY_DIGEST_MODE: &str = "digest_mode";
const KEY_NEXT_FLUSH: &str = "next_flush_at";
const KEY_PAUSED: &str = "paused";
const KEY_INTERVAL: &str = "interval_secs";
const KEY_BACKOFF_MULTIPLIER: &str = "backoff_multiplier";
const KEY_BACKOFF_UNTIL: &str = "backoff_until";
const KEY_LAST_ERROR: &str = "last_error";

/// Persisted slice of the monitor control state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSnapshot {
    pub paused: bool,
    pub interval_secs: u64,
    pub destinations: Vec<Destination>,
    pub backoff_multiplier: u32,
    pub backoff_until: Option<DateTime<Utc>>,
}

/// Everything the monitor needs to resume after a restart, read in one transaction
#[derive(Debug, Clone, Default)]
pub struct PersistedState {
    pub known_ids: Vec<u64>,
    pub cache_entries: Vec<CacheEntry>,
    /// Queue entries in insertion (star-chronological) order
    pub pending: Vec<StarredRepo>,
    pub digest_mode: Option<DigestMode>,
    pub next_flush_at: Option<DateTime<Utc>>,
    /// `None` until the control state has been saved once
    pub control: Option<ControlSnapshot>,
    pub baseline_established: bool,
    pub last_error: Option<String>,
}

/// The result of one successful poll, committed atomically
#[derive(Debug, Clone, Default)]
pub struct PollCommit {
    /// Newly detected stars, oldest first
    pub new_stars: Vec<StarredRepo>,
    /// Put the new stars on the pending queue (false for the first-run baseline)
    pub enqueue: bool,
    /// Pages whose payload changed
    pub changed: Vec<CacheEntry>,
    /// Pages confirmed unchanged by a 304
    pub revalidated: Vec<String>,
    pub checked_at: DateTime<Utc>,
    pub establish_baseline: bool,
}

/// State database manager
pub struct StateDb {
    conn: Mutex<Connection>,
}

impl StateDb {
    /// Open or create the state database
    pub fn open() -> Result<Self> {
        let db_path = Self::get_db_path()?;
        Self::open_at(db_path)
    }

    /// Open or create the state database at a specific path
    pub fn open_at(path: PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize()?;

        info!("State database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize()?;
        Ok(db)
    }

    /// Get the default database path
    fn get_db_path() -> Result<PathBuf> {
        let data_dir = if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
            PathBuf::from(data_home)
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home).join(".local/share")
        } else {
            PathBuf::from("/tmp")
        };

        Ok(data_dir.join("starwatch").join("state.db"))
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied
        // transaction behind: rusqlite rolls back on drop.
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Initialize the database schema
    fn initialize(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                r#"
                -- Scalar settings and flags
                CREATE TABLE IF NOT EXISTS bot_state (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                -- Every repository id ever observed as starred
                CREATE TABLE IF NOT EXISTS known_stars (
                    repo_id INTEGER PRIMARY KEY,
                    full_name TEXT NOT NULL,
                    starred_at TEXT NOT NULL,
                    recorded_at TEXT NOT NULL
                );

                -- Conditional request validators per listing page
                CREATE TABLE IF NOT EXISTS etag_cache (
                    key TEXT PRIMARY KEY,
                    etag TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    fetched_at TEXT NOT NULL
                );

                -- Stars detected but not yet delivered
                CREATE TABLE IF NOT EXISTS digest_queue (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repo_id INTEGER UNIQUE NOT NULL,
                    full_name TEXT NOT NULL,
                    starred_at TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    queued_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS destinations (
                    target_id TEXT PRIMARY KEY,
                    position INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS credentials (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                "#,
            )
            .context("Failed to initialize database schema")?;

        debug!("Database schema initialized");
        Ok(())
    }

    // =========================================================================
    // Snapshot
    // =========================================================================

    /// Load the complete persisted state in a single read transaction
    pub fn load_snapshot(&self) -> Result<PersistedState> {
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .context("Failed to begin snapshot transaction")?;

        let known_ids = {
            let mut stmt = tx.prepare("SELECT repo_id FROM known_stars")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, i64>(0))
                .context("Failed to query known stars")?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to collect known stars")?;
            ids.into_iter().map(|id| id as u64).collect()
        };

        let cache_entries = {
            let mut stmt = tx.prepare("SELECT key, etag, payload, fetched_at FROM etag_cache")?;
            let entries = stmt
                .query_map([], |row| {
                    Ok(CacheEntry {
                        key: row.get(0)?,
                        etag: row.get(1)?,
                        payload: row.get(2)?,
                        fetched_at: parse_timestamp(&row.get::<_, String>(3)?)
                            .unwrap_or_else(Utc::now),
                    })
                })
                .context("Failed to query cache entries")?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to collect cache entries")?;
            entries
        };

        let pending = {
            let mut stmt = tx.prepare("SELECT payload FROM digest_queue ORDER BY id ASC")?;
            let payloads = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .context("Failed to query pending queue")?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to collect pending queue")?;
            payloads
                .iter()
                .map(|payload| {
                    serde_json::from_str::<StarredRepo>(payload)
                        .context("Corrupt pending queue entry")
                })
                .collect::<Result<Vec<_>>>()?
        };

        let destinations = {
            let mut stmt =
                tx.prepare("SELECT target_id FROM destinations ORDER BY position ASC")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .context("Failed to query destinations")?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to collect destinations")?;
            ids.iter()
                .map(|id| Destination::parse(id))
                .collect::<Result<Vec<_>>>()?
        };

        let control = match read_value(&tx, KEY_INTERVAL)? {
            Some(interval) => Some(ControlSnapshot {
                paused: read_value(&tx, KEY_PAUSED)?.as_deref() == Some("1"),
                interval_secs: interval
                    .parse()
                    .context("Corrupt persisted poll interval")?,
                destinations,
                backoff_multiplier: read_value(&tx, KEY_BACKOFF_MULTIPLIER)?
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1),
                backoff_until: read_value(&tx, KEY_BACKOFF_UNTIL)?
                    .and_then(|v| parse_timestamp(&v)),
            }),
            None => None,
        };

        let state = PersistedState {
            known_ids,
            cache_entries,
            pending,
            digest_mode: read_value(&tx, KEY_DIGEST_MODE)?.and_then(|v| DigestMode::parse(&v)),
            next_flush_at: read_value(&tx, KEY_NEXT_FLUSH)?.and_then(|v| parse_timestamp(&v)),
            control,
            baseline_established: read_value(&tx, KEY_BASELINE)?.as_deref() == Some("1"),
            last_error: read_value(&tx, KEY_LAST_ERROR)?,
        };

        tx.commit().context("Failed to finish snapshot transaction")?;
        Ok(state)
    }

    // =========================================================================
    // Poll results
    // =========================================================================

    /// Record a successful poll: KnownStarSet insertions, queue entries and
    /// cache updates land together or not at all. Returns the number of
    /// entries added to the pending queue.
    pub fn commit_poll(&self, commit: &PollCommit) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .context("Failed to begin poll transaction")?;
        let now = commit.checked_at.to_rfc3339();
        let mut enqueued = 0;

        for star in &commit.new_stars {
            let repo_id = star.id as i64;
            let starred_at = star.starred_at.to_rfc3339();

            tx.execute(
                r#"
                INSERT OR IGNORE INTO known_stars (repo_id, full_name, starred_at, recorded_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![repo_id, star.full_name, starred_at, now],
            )
            .context("Failed to record known star")?;

            if commit.enqueue {
                let payload =
                    serde_json::to_string(star).context("Failed to serialize queued star")?;
                enqueued += tx
                    .execute(
                        r#"
                        INSERT OR IGNORE INTO digest_queue (repo_id, full_name, starred_at, payload, queued_at)
                        VALUES (?1, ?2, ?3, ?4, ?5)
                        "#,
                        params![repo_id, star.full_name, starred_at, payload, now],
                    )
                    .context("Failed to enqueue star")?;
            }
        }

        for entry in &commit.changed {
            tx.execute(
                r#"
                INSERT INTO etag_cache (key, etag, payload, fetched_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(key) DO UPDATE SET
                    etag = ?2,
                    payload = ?3,
                    fetched_at = ?4
                "#,
                params![
                    entry.key,
                    entry.etag,
                    entry.payload,
                    entry.fetched_at.to_rfc3339()
                ],
            )
            .context("Failed to store cache entry")?;
        }

        for key in &commit.revalidated {
            tx.execute(
                "UPDATE etag_cache SET fetched_at = ?2 WHERE key = ?1",
                params![key, now],
            )
            .context("Failed to refresh cache entry")?;
        }

        if commit.establish_baseline {
            write_value(&tx, KEY_BASELINE, Some("1"))?;
        }
        write_value(&tx, KEY_LAST_ERROR, None)?;

        tx.commit().context("Failed to commit poll results")?;

        debug!(
            "Committed poll: {} new stars, {} queued, {} pages changed",
            commit.new_stars.len(),
            enqueued,
            commit.changed.len()
        );
        Ok(enqueued)
    }

    /// Remove delivered entries from the pending queue
    pub fn acknowledge(&self, repo_ids: &[u64]) -> Result<()> {
        if repo_ids.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .context("Failed to begin acknowledge transaction")?;
        for id in repo_ids {
            tx.execute(
                "DELETE FROM digest_queue WHERE repo_id = ?1",
                params![*id as i64],
            )
            .context("Failed to acknowledge queue entry")?;
        }
        tx.commit().context("Failed to commit acknowledgement")?;

        debug!("Acknowledged {} delivered entries", repo_ids.len());
        Ok(())
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub fn save_control(&self, control: &ControlSnapshot) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .context("Failed to begin control transaction")?;

        write_value(&tx, KEY_PAUSED, Some(if control.paused { "1" } else { "0" }))?;
        write_value(&tx, KEY_INTERVAL, Some(&control.interval_secs.to_string()))?;
        write_value(
            &tx,
            KEY_BACKOFF_MULTIPLIER,
            Some(&control.backoff_multiplier.to_string()),
        )?;
        write_value(
            &tx,
            KEY_BACKOFF_UNTIL,
            control.backoff_until.map(|t| t.to_rfc3339()).as_deref(),
        )?;

        tx.execute("DELETE FROM destinations", [])
            .context("Failed to clear destinations")?;
        for (position, destination) in control.destinations.iter().enumerate() {
            tx.execute(
                "INSERT INTO destinations (target_id, position) VALUES (?1, ?2)",
                params![destination.as_str(), position as i64],
            )
            .context("Failed to store destination")?;
        }

        tx.commit().context("Failed to commit control state")?;
        Ok(())
    }

    pub fn save_digest(&self, mode: DigestMode, next_flush_at: Option<DateTime<Utc>>) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn
            .transaction()
            .context("Failed to begin digest transaction")?;
        write_value(&tx, KEY_DIGEST_MODE, Some(mode.as_str()))?;
        write_value(
            &tx,
            KEY_NEXT_FLUSH,
            next_flush_at.map(|t| t.to_rfc3339()).as_deref(),
        )?;
        tx.commit().context("Failed to commit digest state")?;
        Ok(())
    }

    pub fn set_last_error(&self, error: Option<&str>) -> Result<()> {
        write_value(&self.conn(), KEY_LAST_ERROR, error)
    }

    // =========================================================================
    // Credentials
    // =========================================================================

    pub fn get_credential(&self, key: &str) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT value FROM credentials WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read credential")
    }

    pub fn set_credential(&self, key: &str, value: &str) -> Result<()> {
        self.conn()
            .execute(
                r#"
                INSERT INTO credentials (key, value) VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET value = ?2
                "#,
                params![key, value],
            )
            .context("Failed to store credential")?;
        Ok(())
    }

    pub fn remove_credential(&self, key: &str) -> Result<bool> {
        let removed = self
            .conn()
            .execute("DELETE FROM credentials WHERE key = ?1", params![key])
            .context("Failed to remove credential")?;
        Ok(removed > 0)
    }
}

fn read_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM bot_state WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
    .with_context(|| format!("Failed to read state key {}", key))
}

/// Upsert a scalar, or delete it when `value` is `None`
fn write_value(conn: &Connection, key: &str, value: Option<&str>) -> Result<()> {
    match value {
        Some(value) => conn.execute(
            r#"
            INSERT INTO bot_state (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = ?2
            "#,
            params![key, value],
        ),
        None => conn.execute("DELETE FROM bot_state WHERE key = ?1", params![key]),
    }
    .with_context(|| format!("Failed to write state key {}", key))?;
    Ok(())
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
