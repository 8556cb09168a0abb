//! Statement helpers raced against the caller's cancellation token.

use cqlop_db::{CqlValue, Database, Rows};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Error, Result};

pub(crate) async fn exec(ctx: &CancellationToken, db: &dyn Database, label: &'static str, statement: &str) -> Result<()> {
    if ctx.is_cancelled() {
        return Err(Error::Cancelled);
    }
    debug!(statement = %redact(statement), "exec");
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(Error::Cancelled),
        r = db.exec(statement) => r.map_err(Error::statement(label)),
    }
}

pub(crate) async fn query(
    ctx: &CancellationToken,
    db: &dyn Database,
    label: &'static str,
    statement: &str,
    args: &[CqlValue],
) -> Result<Rows> {
    if ctx.is_cancelled() {
        return Err(Error::Cancelled);
    }
    debug!(statement, "query");
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(Error::Cancelled),
        r = db.query(statement, args) => r.map_err(Error::statement(label)),
    }
}

/// Hide password literals in logged statements.
fn redact(statement: &str) -> std::borrow::Cow<'_, str> {
    match statement.find("PASSWORD = '") {
        Some(i) => format!("{}PASSWORD = '***'", &statement[..i]).into(),
        None => statement.into(),
    }
}
