// Copyright 2026 Colloquy Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Owns the single physical database handle for the process. Opening
//! degrades through a recovery ladder instead of failing: disk, then
//! quarantine-and-recreate, then a transient in-memory store, then a
//! minimal in-memory schema. Only when even that fails does `open`
//! return an error.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::thread::sleep;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use fs2::FileExt;
use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::params;
use sha2::Digest;
use sha2::Sha256;
use time::OffsetDateTime;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::Config;
use crate::import;
use crate::migrate;

/// Which rung of the open ladder produced the live handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreHealth {
    /// Normal on-disk store.
    Disk,
    /// The previous store file was quarantined and a fresh one created.
    Recreated,
    /// Transient in-memory store with the full schema; lost on exit.
    Memory,
    /// In-memory store with a hand-rolled minimal schema; search,
    /// attachments, and tool runs are unavailable.
    Minimal,
}

pub struct Engine {
    pub(crate) conn: Connection,
    path: Option<PathBuf>,
    health: StoreHealth,
    lock: Option<StoreLock>,
}

struct StoreLock {
    _file: File,
    path: PathBuf,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub conversation_count: i64,
    pub message_count: i64,
    pub tool_run_count: i64,
    pub db_size_bytes: u64,
}

#[derive(Debug)]
pub struct IntegrityReport {
    pub status: String,
    pub stats: StoreStats,
}

const MINIMAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
  key TEXT PRIMARY KEY,
  value TEXT
);

CREATE TABLE IF NOT EXISTS conversations (
  id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  summary TEXT NOT NULL DEFAULT '',
  created_at INTEGER NOT NULL,
  last_used_at INTEGER NOT NULL,
  message_count INTEGER NOT NULL DEFAULT 0,
  archived INTEGER NOT NULL DEFAULT 0,
  favorite INTEGER NOT NULL DEFAULT 0,
  folder_id TEXT,
  tags TEXT NOT NULL DEFAULT '[]',
  model_provider TEXT,
  model_id TEXT
);

CREATE TABLE IF NOT EXISTS messages (
  rowid INTEGER PRIMARY KEY,
  id TEXT UNIQUE NOT NULL,
  conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
  role TEXT NOT NULL,
  content TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  tool_call_id TEXT,
  tool_name TEXT
);

CREATE INDEX IF NOT EXISTS idx_messages_conv_time ON messages(conversation_id, created_at, id);
"#;

impl Engine {
    /// Opens the store, walking the recovery ladder on failure. The
    /// returned error is the last rung's: even an in-memory store could
    /// not be constructed. That case is the caller's single legitimate
    /// reason to terminate.
    pub fn open(config: &Config) -> Result<Self> {
        let engine = Self::open_with_recovery(config)?;
        if !matches!(engine.health, StoreHealth::Minimal)
            && let Ok(dir) = config.data_dir()
        {
            match import::run_if_needed(&engine, &dir) {
                Ok(Some(report)) => info!(?report, "legacy import complete"),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "legacy import failed; continuing without it"),
            }
        }
        Ok(engine)
    }

    fn open_with_recovery(config: &Config) -> Result<Self> {
        match Self::open_on_disk(config, false) {
            Ok(engine) => return Ok(engine),
            Err(err) => warn!(error = ?err, "failed to open store on disk"),
        }

        match Self::open_on_disk(config, true) {
            Ok(mut engine) => {
                error!("store file was quarantined; starting from a fresh store");
                engine.health = StoreHealth::Recreated;
                return Ok(engine);
            }
            Err(err) => error!(error = ?err, "failed to recreate store on disk"),
        }

        match Self::open_in_memory() {
            Ok(mut engine) => {
                error!("falling back to a transient in-memory store; data will not persist");
                engine.health = StoreHealth::Memory;
                return Ok(engine);
            }
            Err(err) => error!(error = ?err, "failed to construct in-memory store"),
        }

        match Self::open_minimal() {
            Ok(engine) => {
                error!("falling back to a minimal in-memory store; most features unavailable");
                return Ok(engine);
            }
            Err(err) => {
                error!(error = ?err, "failed to construct even a minimal store");
                Err(err.context("no usable store could be constructed"))
            }
        }
    }

    fn open_on_disk(config: &Config, quarantine_existing: bool) -> Result<Self> {
        let path = config.store_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create data dir {}", parent.display()))?;
        }
        // Lock before touching the file, so a store held by another
        // process is never quarantined.
        let lock = Self::acquire_lock(&path)?;
        if quarantine_existing {
            quarantine(&path, "broken")?;
        } else {
            quarantine_if_empty(&path)?;
        }
        let conn = Self::open_connection(&path)?;
        Self::apply_pragmas(&conn, true)?;
        migrate::apply_all(&conn)?;
        info!(path = %path.display(), "store opened");
        Ok(Self {
            conn,
            path: Some(path),
            health: StoreHealth::Disk,
            lock: Some(lock),
        })
    }

    /// Full-schema store with no backing file. Used as a recovery rung
    /// and by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory store")?;
        Self::apply_pragmas(&conn, false)?;
        migrate::apply_all(&conn)?;
        Ok(Self {
            conn,
            path: None,
            health: StoreHealth::Memory,
            lock: None,
        })
    }

    fn open_minimal() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open minimal store")?;
        Self::apply_pragmas(&conn, false)?;
        conn.execute_batch(MINIMAL_SCHEMA)
            .context("create minimal schema")?;
        Ok(Self {
            conn,
            path: None,
            health: StoreHealth::Minimal,
            lock: None,
        })
    }

    fn open_connection(path: &Path) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("open {}", path.display()))?;
        conn.busy_timeout(Duration::from_millis(5000))
            .context("set busy timeout")?;
        Ok(conn)
    }

    fn apply_pragmas(conn: &Connection, durable: bool) -> Result<()> {
        let mut batch = String::from("PRAGMA foreign_keys=ON;");
        if durable {
            batch = format!("PRAGMA journal_mode=WAL;\nPRAGMA synchronous=FULL;\n{batch}");
        }
        conn.execute_batch(&batch).context("apply pragmas")?;
        Ok(())
    }

    fn lock_path_for(path: &Path) -> Result<PathBuf> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string_lossy().as_bytes());
        let hash = hex::encode(hasher.finalize());
        let mut dir = std::env::temp_dir();
        dir.push("colloquy");
        fs::create_dir_all(&dir).with_context(|| format!("create lock dir {}", dir.display()))?;
        Ok(dir.join(format!("colloquy-{hash}.lock")))
    }

    fn acquire_lock(path: &Path) -> Result<StoreLock> {
        let lock_path = Self::lock_path_for(path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("open lock file {}", lock_path.display()))?;
        let deadline = Instant::now() + Duration::from_millis(5000);
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(StoreLock {
                        _file: file,
                        path: lock_path,
                    });
                }
                Err(_) if Instant::now() >= deadline => {
                    anyhow::bail!(
                        "store is locked; another process may be using {}",
                        path.display()
                    );
                }
                Err(_) => sleep(Duration::from_millis(50)),
            }
        }
    }

    pub fn health(&self) -> StoreHealth {
        self.health
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Forces WAL contents into the main store file. Best-effort.
    pub fn checkpoint(&self) {
        if self.path.is_none() {
            return;
        }
        if let Err(err) = self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
            warn!(error = %err, "checkpoint failed");
        }
    }

    /// Runs `f` inside a single `BEGIN IMMEDIATE` transaction. The
    /// closure's statements either all commit or all roll back.
    pub(crate) fn with_tx<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .context("begin transaction")?;
        match f(&self.conn) {
            Ok(value) => {
                self.conn
                    .execute_batch("COMMIT")
                    .context("commit transaction")?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                    error!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    pub(crate) fn meta_get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .context("read meta")?;
        Ok(value)
    }

    pub(crate) fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .context("set meta")?;
        Ok(())
    }

    pub fn setting_get(&self, key: &str) -> Option<String> {
        match self.meta_get(&format!("setting:{key}")) {
            Ok(value) => value,
            Err(err) => {
                error!(key, error = %err, "failed to read setting");
                None
            }
        }
    }

    pub fn setting_set(&self, key: &str, value: &str) -> Result<()> {
        self.meta_set(&format!("setting:{key}"), value)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conversation_count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))
            .context("count conversations")?;
        let message_count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .context("count messages")?;
        let tool_run_count = if migrate::table_exists(&self.conn, "tool_runs")? {
            self.conn
                .query_row("SELECT COUNT(*) FROM tool_runs", [], |row| row.get(0))
                .context("count tool runs")?
        } else {
            0
        };
        let db_size_bytes = self
            .path
            .as_ref()
            .and_then(|path| fs::metadata(path).ok())
            .map(|m| m.len())
            .unwrap_or(0);
        Ok(StoreStats {
            conversation_count,
            message_count,
            tool_run_count,
            db_size_bytes,
        })
    }

    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let status: String = self
            .conn
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))
            .context("integrity_check")?;
        let stats = self.stats()?;
        Ok(IntegrityReport { status, stats })
    }

    /// Reclaims space after large deletions. Explicit, never automatic.
    pub fn compact(&self) -> Result<()> {
        self.conn.execute_batch("VACUUM;").context("vacuum")?;
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.checkpoint();
        self.lock.take();
    }
}

fn quarantine_if_empty(path: &Path) -> Result<()> {
    let Ok(metadata) = fs::metadata(path) else {
        return Ok(());
    };
    if metadata.len() == 0 {
        let target = quarantine_name(path, "empty");
        warn!(from = %path.display(), to = %target.display(), "quarantining zero-byte store file");
        fs::rename(path, &target)
            .with_context(|| format!("quarantine {}", path.display()))?;
    }
    Ok(())
}

fn quarantine(path: &Path, label: &str) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let target = quarantine_name(path, label);
    warn!(from = %path.display(), to = %target.display(), "quarantining store file");
    fs::rename(path, &target).with_context(|| format!("quarantine {}", path.display()))?;
    Ok(())
}

fn quarantine_name(path: &Path, label: &str) -> PathBuf {
    let stamp = OffsetDateTime::now_utc().unix_timestamp();
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    path.with_file_name(format!("{file_name}.{label}-{stamp}"))
}

static SHARED: OnceLock<Mutex<Engine>> = OnceLock::new();
static SHARED_INIT: Mutex<()> = Mutex::new(());

/// Process-wide handle, created once on first access and alive for the
/// process lifetime. All mutating access is serialized through the mutex.
pub fn shared() -> Result<&'static Mutex<Engine>> {
    if let Some(engine) = SHARED.get() {
        return Ok(engine);
    }
    let _guard = SHARED_INIT
        .lock()
        .map_err(|_| anyhow!("shared store init lock poisoned"))?;
    if SHARED.get().is_none() {
        let config = match Config::load() {
            Ok(config) => config,
            Err(err) => {
                warn!(error = %err, "config unreadable; using defaults");
                Config::default()
            }
        };
        let engine = Engine::open(&config)?;
        let _ = SHARED.set(Mutex::new(engine));
    }
    SHARED.get().ok_or_else(|| anyhow!("shared store unavailable"))
}
