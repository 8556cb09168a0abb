//! Keyspace reconciler.

use std::collections::BTreeMap;
use std::sync::Arc;

use cqlop_core::{Keyspace, KeyspaceParameters, Managed};
use cqlop_db::{quote_identifier, quote_literal, Database};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::exec::{exec, query};
use crate::{
    external_name, late_init_field, Error, ExternalClient, ExternalCreation, ExternalObservation, ExternalUpdate,
    Observation, PasswordGenerator, Reconcilable, Result,
};

pub const SELECT_KEYSPACE: &str = "SELECT keyspace_name FROM system_schema.keyspaces WHERE keyspace_name = ?";
pub const SELECT_KEYSPACE_DETAILS: &str =
    "SELECT replication, durable_writes FROM system_schema.keyspaces WHERE keyspace_name = ?";

pub const DEFAULT_REPLICATION_CLASS: &str = "SimpleStrategy";
pub const DEFAULT_REPLICATION_FACTOR: i32 = 1;
pub const DEFAULT_DURABLE_WRITES: bool = true;

const LOCATOR_PREFIX: &str = "org.apache.cassandra.locator.";

const ERR_SELECT: &str = "cannot select keyspace";
const ERR_CREATE: &str = "cannot create keyspace";
const ERR_UPDATE: &str = "cannot update keyspace";
const ERR_DROP: &str = "cannot drop keyspace";
const ERR_SCAN: &str = "failed to scan keyspace attributes";

/// Fill unset desired fields from `observed`. Returns the filled copy and
/// whether anything was filled.
pub fn late_init(observed: &KeyspaceParameters, desired: &KeyspaceParameters) -> (KeyspaceParameters, bool) {
    let mut filled = desired.clone();
    let mut changed = late_init_field(&mut filled.replication_class, &observed.replication_class);
    changed |= late_init_field(&mut filled.replication_factor, &observed.replication_factor);
    changed |= late_init_field(&mut filled.durable_writes, &observed.durable_writes);
    (filled, changed)
}

pub fn up_to_date(observed: &KeyspaceParameters, desired: &KeyspaceParameters) -> bool {
    observed == desired
}

/// Interpret a `replication` map as read from the schema table.
pub fn parse_replication(replication: &BTreeMap<String, String>) -> Result<(String, i32)> {
    let class = replication
        .get("class")
        .map(|c| c.strip_prefix(LOCATOR_PREFIX).unwrap_or(c).to_string())
        .unwrap_or_default();
    let factor = match replication.get("replication_factor") {
        Some(raw) => raw
            .parse::<i32>()
            .map_err(|e| Error::Malformed(format!("invalid replication_factor {:?}: {}", raw, e)))?,
        None => 0,
    };
    Ok((class, factor))
}

fn with_clause(p: &KeyspaceParameters) -> String {
    let class = p.replication_class.as_deref().unwrap_or(DEFAULT_REPLICATION_CLASS);
    let factor = p.replication_factor.unwrap_or(DEFAULT_REPLICATION_FACTOR);
    let durable = p.durable_writes.unwrap_or(DEFAULT_DURABLE_WRITES);
    format!(
        "WITH replication = {{'class': {}, 'replication_factor': {}}} AND durable_writes = {}",
        quote_literal(class),
        factor,
        durable
    )
}

pub fn create_statement(name: &str, p: &KeyspaceParameters) -> String {
    format!("CREATE KEYSPACE IF NOT EXISTS {} {}", quote_identifier(name), with_clause(p))
}

pub fn alter_statement(name: &str, p: &KeyspaceParameters) -> String {
    format!("ALTER KEYSPACE {} {}", quote_identifier(name), with_clause(p))
}

pub fn drop_statement(name: &str) -> String {
    format!("DROP KEYSPACE IF EXISTS {}", quote_identifier(name))
}

pub struct KeyspaceClient {
    db: Arc<dyn Database>,
}

impl KeyspaceClient {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

impl Reconcilable for Keyspace {
    fn new_client(db: Arc<dyn Database>, _passwords: Arc<dyn PasswordGenerator>) -> Box<dyn ExternalClient<Self>> {
        Box::new(KeyspaceClient::new(db))
    }
}

#[async_trait::async_trait]
impl ExternalClient<Keyspace> for KeyspaceClient {
    async fn observe(&self, ctx: &CancellationToken, cr: &Keyspace) -> Result<Observation<Keyspace>> {
        let name = external_name(cr)?;
        let mut rows = query(ctx, &*self.db, ERR_SELECT, SELECT_KEYSPACE, &[name.into()]).await?;
        let found = rows.scan::<(String,)>().map_err(Error::statement(ERR_SELECT))?;
        rows.close().map_err(Error::statement(ERR_SELECT))?;
        if found.is_none() {
            return Ok(ExternalObservation::absent());
        }

        let mut rows = query(ctx, &*self.db, ERR_SELECT, SELECT_KEYSPACE_DETAILS, &[name.into()]).await?;
        let (replication, durable_writes) = rows
            .scan::<(BTreeMap<String, String>, bool)>()
            .map_err(|e| Error::Malformed(format!("{}: {}", ERR_SCAN, e)))?
            .ok_or_else(|| Error::Malformed(ERR_SCAN.to_string()))?;
        rows.close().map_err(Error::statement(ERR_SELECT))?;

        let (class, factor) = parse_replication(&replication)?;
        let observed = KeyspaceParameters {
            replication_class: Some(class),
            replication_factor: Some(factor),
            durable_writes: Some(durable_writes),
        };
        let (filled, changed) = late_init(&observed, cr.for_provider());
        let up = up_to_date(&observed, &filled);
        debug!(keyspace = name, up_to_date = up, late_initialized = changed, "observed keyspace");
        Ok(ExternalObservation {
            resource_exists: true,
            resource_up_to_date: up,
            late_initialized: changed.then_some(filled),
            at_provider: None,
        })
    }

    async fn create(&self, ctx: &CancellationToken, cr: &Keyspace) -> Result<ExternalCreation> {
        let name = external_name(cr)?;
        exec(ctx, &*self.db, ERR_CREATE, &create_statement(name, cr.for_provider())).await?;
        Ok(ExternalCreation::default())
    }

    async fn update(&self, ctx: &CancellationToken, cr: &Keyspace) -> Result<ExternalUpdate<cqlop_core::KeyspaceObservation>> {
        let name = external_name(cr)?;
        exec(ctx, &*self.db, ERR_UPDATE, &alter_statement(name, cr.for_provider())).await?;
        Ok(ExternalUpdate::default())
    }

    async fn delete(&self, ctx: &CancellationToken, cr: &Keyspace) -> Result<()> {
        let name = external_name(cr)?;
        exec(ctx, &*self.db, ERR_DROP, &drop_statement(name)).await
    }
}
