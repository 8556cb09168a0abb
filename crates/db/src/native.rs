//! Native-protocol sessions against a real cluster, through the `scylla` driver.
//!
//! `NativeDriver` keeps one session per distinct connection config; sessions
//! are opened lazily and shared by every reconcile using the same credentials.

use std::sync::{Arc, Mutex};

use metrics::counter;
use rustc_hash::FxHashMap;
use scylla::frame::response::result::CqlValue as WireValue;
use scylla::{Session, SessionBuilder};
use tracing::debug;

use crate::{statement_verb, ConnectionConfig, CqlValue, Database, DbError, Row, Rows};

pub struct NativeSession {
    session: Session,
    user: String,
}

impl NativeSession {
    pub async fn connect(cfg: &ConnectionConfig) -> Result<Self, DbError> {
        let mut builder = SessionBuilder::new().known_node(cfg.address()).user(&cfg.username, &cfg.password);
        if let Some(ks) = cfg.keyspace.as_deref() {
            builder = builder.use_keyspace(ks, true);
        }
        let session = builder
            .build()
            .await
            .map_err(|e| DbError::Connect(format!("{} as {}: {}", cfg.address(), cfg.username, e)))?;
        debug!(user = %cfg.username, address = %cfg.address(), "native session opened");
        Ok(Self { session, user: cfg.username.clone() })
    }

    pub fn user(&self) -> &str {
        &self.user
    }
}

#[async_trait::async_trait]
impl Database for NativeSession {
    async fn exec(&self, statement: &str) -> Result<(), DbError> {
        counter!("cql_statements_total", 1u64, "verb" => statement_verb(statement));
        self.session.query(statement, ()).await.map_err(|e| DbError::Exec(e.to_string()))?;
        Ok(())
    }

    async fn query(&self, statement: &str, args: &[CqlValue]) -> Result<Rows, DbError> {
        counter!("cql_statements_total", 1u64, "verb" => "select");
        let values: Vec<Option<WireValue>> = args.iter().map(to_wire).collect();
        let result = self.session.query(statement, values).await.map_err(|e| DbError::Query(e.to_string()))?;
        let rows = result
            .rows
            .unwrap_or_default()
            .into_iter()
            .map(|r| Row::new(r.columns.into_iter().map(|c| c.map_or(CqlValue::Null, from_wire)).collect()))
            .collect();
        Ok(Rows::buffered(rows))
    }
}

/// Session pool keyed by connection config.
#[derive(Default)]
pub struct NativeDriver {
    sessions: Mutex<FxHashMap<ConnectionConfig, Arc<NativeSession>>>,
}

impl NativeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn session(&self, cfg: &ConnectionConfig) -> Result<Arc<NativeSession>, DbError> {
        let cached = self.sessions.lock().unwrap_or_else(|e| e.into_inner()).get(cfg).cloned();
        if let Some(s) = cached {
            return Ok(s);
        }
        let session = Arc::new(NativeSession::connect(cfg).await?);
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        Ok(Arc::clone(sessions.entry(cfg.clone()).or_insert(session)))
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn to_wire(v: &CqlValue) -> Option<WireValue> {
    let wire = match v {
        CqlValue::Null => return None,
        CqlValue::Boolean(b) => WireValue::Boolean(*b),
        CqlValue::Int(i) => WireValue::Int(*i),
        CqlValue::BigInt(i) => WireValue::BigInt(*i),
        CqlValue::Text(s) => WireValue::Text(s.clone()),
        CqlValue::List(items) => WireValue::List(items.iter().filter_map(to_wire).collect()),
        CqlValue::Set(items) => WireValue::Set(items.iter().filter_map(to_wire).collect()),
        CqlValue::Map(entries) => {
            WireValue::Map(entries.iter().filter_map(|(k, v)| Some((to_wire(k)?, to_wire(v)?))).collect())
        }
    };
    Some(wire)
}

/// Column types outside the reconcilers' reads decode as null.
fn from_wire(v: WireValue) -> CqlValue {
    match v {
        WireValue::Boolean(b) => CqlValue::Boolean(b),
        WireValue::Int(i) => CqlValue::Int(i),
        WireValue::BigInt(i) => CqlValue::BigInt(i),
        WireValue::Text(s) | WireValue::Ascii(s) => CqlValue::Text(s),
        WireValue::List(items) => CqlValue::List(items.into_iter().map(from_wire).collect()),
        WireValue::Set(items) => CqlValue::Set(items.into_iter().map(from_wire).collect()),
        WireValue::Map(entries) => CqlValue::Map(entries.into_iter().map(|(k, v)| (from_wire(k), from_wire(v))).collect()),
        _ => CqlValue::Null,
    }
}
