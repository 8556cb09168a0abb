//! cqlop db: the database access port consumed by the reconcilers.
//!
//! - `Database`: execute a statement, or run a parameterized query returning a cursor
//! - `Rows`: the cursor; decoded with `scan`, released on `close` or drop
//! - `MockDb`: closure-driven double for unit tests
//! - `MemoryCluster`: in-memory cluster that understands the statements the controller emits
//! - `NativeDriver`: pooled native-protocol sessions against a real cluster

#![forbid(unsafe_code)]

pub mod cql;
pub mod memory;
pub mod mock;
pub mod native;
pub mod value;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub use cql::{quote_identifier, quote_literal};
pub use memory::{ClusterState, KeyspaceRow, MemoryCluster, MemorySession, RoleRow};
pub use mock::MockDb;
pub use native::{NativeDriver, NativeSession};
pub use value::{CqlValue, FromCql, FromRow, Row};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DbError {
    /// Statement rejected or failed server-side.
    #[error("{0}")]
    Exec(String),
    /// Query rejected or failed server-side.
    #[error("{0}")]
    Query(String),
    #[error("cannot decode column {column}: {reason}")]
    Decode { column: usize, reason: String },
    #[error("unsupported statement: {0}")]
    Unsupported(String),
    #[error("authentication failed for user {0}")]
    Auth(String),
    #[error("cannot connect to {0}")]
    Connect(String),
    #[error("invalid connection config: {0}")]
    Config(String),
    #[error("cursor already closed")]
    Closed,
}

/// Source of rows behind a cursor.
pub trait RowSource: Send {
    fn next_row(&mut self) -> Result<Option<Row>, DbError>;

    /// Release server-side resources. Called exactly once.
    fn close(&mut self) -> Result<(), DbError> {
        Ok(())
    }
}

/// Rows buffered in memory.
pub struct BufferedRows {
    rows: std::vec::IntoIter<Row>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl BufferedRows {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows: rows.into_iter(), on_close: None }
    }

    /// Run `f` when the cursor is released.
    pub fn on_close(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }
}

impl RowSource for BufferedRows {
    fn next_row(&mut self) -> Result<Option<Row>, DbError> {
        Ok(self.rows.next())
    }

    fn close(&mut self) -> Result<(), DbError> {
        if let Some(f) = self.on_close.take() {
            f();
        }
        Ok(())
    }
}

/// Query cursor. Released by `close`, or on drop when an early return skips it.
pub struct Rows {
    src: Option<Box<dyn RowSource>>,
}

impl Rows {
    pub fn new(src: impl RowSource + 'static) -> Self {
        Self { src: Some(Box::new(src)) }
    }

    pub fn buffered(rows: Vec<Row>) -> Self {
        Self::new(BufferedRows::new(rows))
    }

    pub fn empty() -> Self {
        Self::buffered(Vec::new())
    }

    pub fn next_row(&mut self) -> Result<Option<Row>, DbError> {
        match self.src.as_mut() {
            Some(src) => src.next_row(),
            None => Err(DbError::Closed),
        }
    }

    /// Decode the next row into `T`. `Ok(None)` once the cursor is exhausted.
    pub fn scan<T: FromRow>(&mut self) -> Result<Option<T>, DbError> {
        self.next_row()?.map(|row| T::from_row(&row)).transpose()
    }

    pub fn close(mut self) -> Result<(), DbError> {
        match self.src.take() {
            Some(mut src) => src.close(),
            None => Ok(()),
        }
    }
}

impl Drop for Rows {
    fn drop(&mut self) {
        if let Some(mut src) = self.src.take() {
            if let Err(e) = src.close() {
                warn!(error = %e, "closing cursor failed");
            }
        }
    }
}

impl fmt::Debug for Rows {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rows").field("open", &self.src.is_some()).finish()
    }
}

/// Database access port.
#[async_trait::async_trait]
pub trait Database: Send + Sync {
    /// Execute a statement that returns no rows.
    async fn exec(&self, statement: &str) -> Result<(), DbError>;

    /// Run a query with positional `?` arguments.
    async fn query(&self, statement: &str, args: &[CqlValue]) -> Result<Rows, DbError>;
}

#[async_trait::async_trait]
impl<T: Database + ?Sized> Database for Arc<T> {
    async fn exec(&self, statement: &str) -> Result<(), DbError> {
        (**self).exec(statement).await
    }

    async fn query(&self, statement: &str, args: &[CqlValue]) -> Result<Rows, DbError> {
        (**self).query(statement, args).await
    }
}

/// Credential bundle a session is opened with.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub username: String,
    pub password: String,
    pub endpoint: String,
    pub port: u16,
    /// Keyspace the session is scoped to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyspace: Option<String>,
}

impl ConnectionConfig {
    pub const DEFAULT_PORT: u16 = 9042;

    /// Build from a decoded credential payload (`username`, `password`,
    /// `endpoint`, optional `port`).
    pub fn from_credentials(creds: &BTreeMap<String, String>) -> Result<Self, DbError> {
        let field = |key: &str| -> Result<String, DbError> {
            creds
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| DbError::Config(format!("missing {}", key)))
        };
        let port = match creds.get("port").filter(|v| !v.is_empty()) {
            Some(p) => p.parse::<u16>().map_err(|e| DbError::Config(format!("port {:?}: {}", p, e)))?,
            None => Self::DEFAULT_PORT,
        };
        Ok(Self { username: field("username")?, password: field("password")?, endpoint: field("endpoint")?, port, keyspace: None })
    }

    pub fn with_keyspace(mut self, keyspace: Option<&str>) -> Self {
        self.keyspace = keyspace.filter(|k| !k.is_empty()).map(str::to_string);
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.endpoint, self.port)
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("port", &self.port)
            .field("keyspace", &self.keyspace)
            .finish()
    }
}

/// Leading keyword(s) of a statement, for logs and metrics.
pub fn statement_verb(statement: &str) -> &'static str {
    let upper: Vec<String> = statement.split_whitespace().take(2).map(|w| w.to_ascii_uppercase()).collect();
    match upper.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["CREATE", "KEYSPACE"] => "create_keyspace",
        ["ALTER", "KEYSPACE"] => "alter_keyspace",
        ["DROP", "KEYSPACE"] => "drop_keyspace",
        ["CREATE", "ROLE"] => "create_role",
        ["ALTER", "ROLE"] => "alter_role",
        ["DROP", "ROLE"] => "drop_role",
        ["GRANT", ..] => "grant",
        ["REVOKE", ..] => "revoke",
        ["SELECT", ..] => "select",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn credentials_require_user_password_endpoint() {
        let mut creds = BTreeMap::new();
        creds.insert("username".to_string(), "cassandra".to_string());
        creds.insert("password".to_string(), "secret".to_string());
        assert_eq!(ConnectionConfig::from_credentials(&creds), Err(DbError::Config("missing endpoint".into())));
        creds.insert("endpoint".to_string(), "db.local".to_string());
        let cfg = ConnectionConfig::from_credentials(&creds).unwrap();
        assert_eq!(cfg.port, 9042);
        assert_eq!(cfg.address(), "db.local:9042");
        creds.insert("port".to_string(), "19042".to_string());
        assert_eq!(ConnectionConfig::from_credentials(&creds).unwrap().port, 19042);
        creds.insert("port".to_string(), "nope".to_string());
        assert!(matches!(ConnectionConfig::from_credentials(&creds), Err(DbError::Config(_))));
    }

    #[test]
    fn debug_redacts_password() {
        let cfg = ConnectionConfig {
            username: "u".into(),
            password: "hunter2".into(),
            endpoint: "e".into(),
            port: 1,
            keyspace: None,
        };
        assert!(!format!("{:?}", cfg).contains("hunter2"));
    }

    #[test]
    fn cursor_released_once_on_close_or_drop() {
        let closed = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&closed);
        let mut rows = Rows::new(BufferedRows::new(vec![Row::new(vec![CqlValue::Int(1)])]).on_close(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(rows.scan::<(i32,)>().unwrap(), Some((1,)));
        assert_eq!(rows.scan::<(i32,)>().unwrap(), None);
        rows.close().unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        let c = Arc::clone(&closed);
        {
            let _rows = Rows::new(BufferedRows::new(Vec::new()).on_close(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn verbs() {
        assert_eq!(statement_verb("CREATE KEYSPACE IF NOT EXISTS \"x\""), "create_keyspace");
        assert_eq!(statement_verb("grant SELECT ON KEYSPACE \"x\" TO \"y\""), "grant");
        assert_eq!(statement_verb("TRUNCATE t"), "other");
    }
}
