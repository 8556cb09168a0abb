//! Closure-driven `Database` double.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::{BufferedRows, CqlValue, Database, DbError, Row, Rows};

type ExecFn = dyn Fn(&str) -> Result<(), DbError> + Send + Sync;
type QueryFn = dyn Fn(&str, &[CqlValue]) -> Result<Vec<Row>, DbError> + Send + Sync;

/// Records every statement and query; behavior comes from optional closures.
/// Without closures `exec` succeeds and `query` returns no rows.
#[derive(Clone, Default)]
pub struct MockDb {
    exec_fn: Option<Arc<ExecFn>>,
    query_fn: Option<Arc<QueryFn>>,
    executed: Arc<Mutex<Vec<String>>>,
    queried: Arc<Mutex<Vec<(String, Vec<CqlValue>)>>>,
    closed: Arc<AtomicUsize>,
}

impl MockDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exec(mut self, f: impl Fn(&str) -> Result<(), DbError> + Send + Sync + 'static) -> Self {
        self.exec_fn = Some(Arc::new(f));
        self
    }

    pub fn with_query(
        mut self,
        f: impl Fn(&str, &[CqlValue]) -> Result<Vec<Row>, DbError> + Send + Sync + 'static,
    ) -> Self {
        self.query_fn = Some(Arc::new(f));
        self
    }

    /// Answer every query with `rows`.
    pub fn with_rows(self, rows: Vec<Row>) -> Self {
        self.with_query(move |_, _| Ok(rows.clone()))
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn queried(&self) -> Vec<(String, Vec<CqlValue>)> {
        self.queried.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of cursors released so far.
    pub fn closed_cursors(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Database for MockDb {
    async fn exec(&self, statement: &str) -> Result<(), DbError> {
        self.executed.lock().unwrap_or_else(|e| e.into_inner()).push(statement.to_string());
        match &self.exec_fn {
            Some(f) => f(statement),
            None => Ok(()),
        }
    }

    async fn query(&self, statement: &str, args: &[CqlValue]) -> Result<Rows, DbError> {
        self.queried.lock().unwrap_or_else(|e| e.into_inner()).push((statement.to_string(), args.to_vec()));
        let rows = match &self.query_fn {
            Some(f) => f(statement, args)?,
            None => Vec::new(),
        };
        let closed = Arc::clone(&self.closed);
        Ok(Rows::new(BufferedRows::new(rows).on_close(move || {
            closed.fetch_add(1, Ordering::SeqCst);
        })))
    }
}
