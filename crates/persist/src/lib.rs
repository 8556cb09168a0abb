//! cqlop persistence: a small SQLite file holding the local control plane
//! between CLI runs. Managed objects with their status, the in-process
//! cluster's tables, published secrets and a short reconcile history.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{Context, Result};
use cqlop_core::{AnyManaged, ResourceKind};
use cqlop_db::ClusterState;
use metrics::{counter, histogram};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// History rows kept per object.
pub const HISTORY_KEEP: usize = 10;

pub type SecretData = BTreeMap<String, Vec<u8>>;

/// One reconcile of one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub kind: String,
    pub name: String,
    pub ts: i64,
    /// Outcome name, or `error`.
    pub outcome: String,
    pub message: Option<String>,
}

pub trait Store {
    fn put_object(&self, obj: &AnyManaged) -> Result<()>;
    fn get_object(&self, kind: ResourceKind, name: &str) -> Result<Option<AnyManaged>>;
    fn delete_object(&self, kind: ResourceKind, name: &str) -> Result<bool>;
    fn list_objects(&self) -> Result<Vec<AnyManaged>>;

    fn put_cluster(&self, state: &ClusterState) -> Result<()>;
    fn get_cluster(&self) -> Result<Option<ClusterState>>;

    fn put_secret(&self, namespace: &str, name: &str, data: &SecretData) -> Result<()>;
    fn list_secrets(&self) -> Result<Vec<((String, String), SecretData)>>;

    fn record(&self, entry: &HistoryEntry) -> Result<()>;
    fn history(&self, kind: ResourceKind, name: &str, limit: Option<usize>) -> Result<Vec<HistoryEntry>>;
}

/// SQLite-backed store. Synchronous; the CLI is not latency sensitive here.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS objects (
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    json TEXT NOT NULL,
    ts   INTEGER NOT NULL,
    PRIMARY KEY (kind, name)
);
CREATE TABLE IF NOT EXISTS cluster (
    id   INTEGER PRIMARY KEY CHECK (id = 1),
    json TEXT NOT NULL,
    ts   INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS secrets (
    namespace TEXT NOT NULL,
    name      TEXT NOT NULL,
    json      TEXT NOT NULL,
    PRIMARY KEY (namespace, name)
);
CREATE TABLE IF NOT EXISTS history (
    kind    TEXT NOT NULL,
    name    TEXT NOT NULL,
    ts      INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    message TEXT
);
CREATE INDEX IF NOT EXISTS idx_history_obj_ts ON history(kind, name, ts DESC);
";

impl SqliteStore {
    /// Open `CQLOP_DB_PATH`, or `~/.cqlop/cqlop.db`.
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("CQLOP_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute_batch(SCHEMA).context("creating tables")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path, "state store opened");
        Ok(Self { db: Mutex::new(db) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = rusqlite::Connection::open_in_memory().context("opening in-memory sqlite db")?;
        db.execute_batch(SCHEMA).context("creating tables")?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn decode_object(json: &str) -> Result<AnyManaged> {
    serde_json::from_str(json).context("decoding stored object")
}

impl Store for SqliteStore {
    fn put_object(&self, obj: &AnyManaged) -> Result<()> {
        let started = Instant::now();
        let json = serde_json::to_string(obj)?;
        self.conn().execute(
            "INSERT INTO objects(kind, name, json, ts) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(kind, name) DO UPDATE SET json = excluded.json, ts = excluded.ts",
            (obj.kind().as_str(), obj.name(), &json, now_ts()),
        )?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64, "table" => "objects");
        Ok(())
    }

    fn get_object(&self, kind: ResourceKind, name: &str) -> Result<Option<AnyManaged>> {
        let json: Option<String> = self
            .conn()
            .query_row("SELECT json FROM objects WHERE kind = ?1 AND name = ?2", (kind.as_str(), name), |r| r.get(0))
            .optional()?;
        json.as_deref().map(decode_object).transpose()
    }

    fn delete_object(&self, kind: ResourceKind, name: &str) -> Result<bool> {
        let n = self.conn().execute("DELETE FROM objects WHERE kind = ?1 AND name = ?2", (kind.as_str(), name))?;
        Ok(n > 0)
    }

    fn list_objects(&self) -> Result<Vec<AnyManaged>> {
        let started = Instant::now();
        let db = self.conn();
        let mut stmt = db.prepare("SELECT json FROM objects ORDER BY kind, name")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let json: String = row.get(0)?;
            out.push(decode_object(&json)?);
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn put_cluster(&self, state: &ClusterState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        self.conn().execute(
            "INSERT INTO cluster(id, json, ts) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET json = excluded.json, ts = excluded.ts",
            (&json, now_ts()),
        )?;
        counter!("persist_put_total", 1u64, "table" => "cluster");
        Ok(())
    }

    fn get_cluster(&self) -> Result<Option<ClusterState>> {
        let json: Option<String> =
            self.conn().query_row("SELECT json FROM cluster WHERE id = 1", [], |r| r.get(0)).optional()?;
        json.map(|j| serde_json::from_str(&j).context("decoding stored cluster state")).transpose()
    }

    fn put_secret(&self, namespace: &str, name: &str, data: &SecretData) -> Result<()> {
        let json = serde_json::to_string(data)?;
        self.conn().execute(
            "INSERT INTO secrets(namespace, name, json) VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace, name) DO UPDATE SET json = excluded.json",
            (namespace, name, &json),
        )?;
        counter!("persist_put_total", 1u64, "table" => "secrets");
        Ok(())
    }

    fn list_secrets(&self) -> Result<Vec<((String, String), SecretData)>> {
        let db = self.conn();
        let mut stmt = db.prepare("SELECT namespace, name, json FROM secrets ORDER BY namespace, name")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let json: String = row.get(2)?;
            let data: SecretData = serde_json::from_str(&json).context("decoding stored secret")?;
            out.push(((row.get(0)?, row.get(1)?), data));
        }
        Ok(out)
    }

    fn record(&self, e: &HistoryEntry) -> Result<()> {
        let mut db = self.conn();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO history(kind, name, ts, outcome, message) VALUES (?1, ?2, ?3, ?4, ?5)",
            (&e.kind, &e.name, e.ts, &e.outcome, &e.message),
        )?;
        // keep the latest HISTORY_KEEP rows per object
        tx.execute(
            "DELETE FROM history
             WHERE kind = ?1 AND name = ?2
               AND rowid NOT IN (
                   SELECT rowid FROM history WHERE kind = ?1 AND name = ?2 ORDER BY ts DESC, rowid DESC LIMIT ?3
               )",
            (&e.kind, &e.name, HISTORY_KEEP as i64),
        )?;
        tx.commit()?;
        counter!("persist_put_total", 1u64, "table" => "history");
        Ok(())
    }

    fn history(&self, kind: ResourceKind, name: &str, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        let cap = limit.unwrap_or(HISTORY_KEEP);
        let db = self.conn();
        let mut stmt = db.prepare(
            "SELECT ts, outcome, message FROM history WHERE kind = ?1 AND name = ?2 ORDER BY ts DESC, rowid DESC LIMIT ?3",
        )?;
        let mut rows = stmt.query((kind.as_str(), name, cap as i64))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(HistoryEntry {
                kind: kind.as_str().to_string(),
                name: name.to_string(),
                ts: row.get(0)?,
                outcome: row.get(1)?,
                message: row.get(2)?,
            });
        }
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".cqlop");
        let _ = std::fs::create_dir_all(&p);
        p.push("cqlop.db");
        return p.to_string_lossy().to_string();
    }
    "cqlop.db".to_string()
}

/// Seconds since the epoch.
pub fn now_ts() -> i64 {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}
