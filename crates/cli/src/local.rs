//! Local control plane: manifests in, persisted state out.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use cqlop_controller::connector::{CommonCredentialExtractor, MemorySecrets, StaticProviderConfigs};
use cqlop_controller::scheduler::ConvergeReport;
use cqlop_controller::{Connector, ObjectIndex, Reconciler, Scheduler, SchedulerConfig};
use cqlop_core::{
    parse_manifests, AnyManaged, CredentialsSource, EnvSelector, Grant, ManifestSet, ObjectMeta, ProviderConfig,
    ProviderConfigSpec, ProviderCredentials, DEFAULT_PROVIDER_CONFIG,
};
use cqlop_db::MemoryCluster;
use cqlop_persist::{now_ts, HistoryEntry, SqliteStore, Store};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Environment variable read by the fallback `default` provider config.
pub const CREDENTIALS_ENV: &str = "CQLOP_CREDENTIALS";

pub fn read_manifests(files: &[PathBuf]) -> Result<ManifestSet> {
    let mut set = ManifestSet::default();
    for f in files {
        let text = std::fs::read_to_string(f).with_context(|| format!("reading {}", f.display()))?;
        set.extend(parse_manifests(&text).with_context(|| format!("parsing {}", f.display()))?);
    }
    Ok(set)
}

pub fn env_provider_config() -> ProviderConfig {
    ProviderConfig {
        metadata: ObjectMeta { name: Some(DEFAULT_PROVIDER_CONFIG.to_string()), ..Default::default() },
        spec: ProviderConfigSpec {
            credentials: ProviderCredentials {
                source: CredentialsSource::Environment,
                env: Some(EnvSelector { name: CREDENTIALS_ENV.to_string() }),
                ..Default::default()
            },
        },
        ..Default::default()
    }
}

/// Keep a grant's resolved role and keyspace while its references are unchanged.
fn carry_resolved(fresh: &mut Grant, stored: &Grant) {
    let (p, old) = (&mut fresh.spec.for_provider, &stored.spec.for_provider);
    if p.role.is_none() && p.role_ref.is_some() && p.role_ref == old.role_ref {
        p.role = old.role.clone();
    }
    if p.keyspace.is_none() && p.keyspace_ref.is_some() && p.keyspace_ref == old.keyspace_ref {
        p.keyspace = old.keyspace.clone();
    }
}

/// Carry state owned by earlier runs into a freshly parsed object: status,
/// the external name when the manifest does not set one, and resolved grant
/// references.
pub fn merge_stored(fresh: AnyManaged, stored: &AnyManaged) -> Result<AnyManaged> {
    let mut v = serde_json::to_value(&fresh)?;
    let old = serde_json::to_value(stored)?;
    if let Some(status) = old.get("status") {
        v["status"] = status.clone();
    }
    if fresh.external_name().is_none() {
        if let Some(ext) = stored.external_name() {
            let meta = &mut v["metadata"];
            if !meta["annotations"].is_object() {
                meta["annotations"] = Value::Object(Default::default());
            }
            meta["annotations"][cqlop_core::EXTERNAL_NAME_ANNOTATION] = Value::String(ext.to_string());
        }
    }
    let mut merged: AnyManaged = serde_json::from_value(v)?;
    if let (AnyManaged::Grant(g), AnyManaged::Grant(old)) = (&mut merged, stored) {
        carry_resolved(g, old);
    }
    Ok(merged)
}

pub struct Applied {
    pub converge: ConvergeReport,
    pub statements: Vec<String>,
}

pub struct LocalPlane {
    store: SqliteStore,
    cluster: MemoryCluster,
    secrets: Arc<MemorySecrets>,
}

impl LocalPlane {
    pub fn open(state: Option<&Path>) -> Result<Self> {
        let store = match state {
            Some(p) => SqliteStore::open(&p.to_string_lossy())?,
            None => SqliteStore::open_default()?,
        };
        Self::with_store(store)
    }

    pub fn with_store(store: SqliteStore) -> Result<Self> {
        let cluster = match store.get_cluster()? {
            Some(state) => MemoryCluster::from_state(state),
            None => MemoryCluster::new(),
        };
        let secrets = Arc::new(MemorySecrets::new());
        for ((ns, name), data) in store.list_secrets()? {
            secrets.put(&ns, &name, data);
        }
        Ok(Self { store, cluster, secrets })
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }

    pub fn secrets(&self) -> Arc<MemorySecrets> {
        Arc::clone(&self.secrets)
    }

    /// Scheduler whose references also resolve against objects stored by earlier runs.
    fn scheduler(&self, configs: Vec<ProviderConfig>, cfg: SchedulerConfig) -> Result<Scheduler> {
        let configs: StaticProviderConfigs = configs.into_iter().collect();
        if configs.is_empty() {
            debug!(env = CREDENTIALS_ENV, "no ProviderConfig given; using environment credentials");
            configs.insert(env_provider_config());
        }
        let extractor = CommonCredentialExtractor::new().with_secrets(self.secrets());
        let connector = Connector::new(Arc::new(configs), Arc::new(extractor), Arc::new(self.cluster.clone()));
        let known = ObjectIndex::new(&self.store.list_objects()?);
        Ok(Scheduler::new(Reconciler::new(connector).with_publisher(self.secrets()), cfg).with_known(known))
    }

    fn with_stored(&self, objects: Vec<AnyManaged>) -> Result<Vec<AnyManaged>> {
        objects
            .into_iter()
            .map(|o| match self.store.get_object(o.kind(), o.name())? {
                Some(stored) => merge_stored(o, &stored),
                None => Ok(o),
            })
            .collect()
    }

    pub async fn apply(&self, ctx: &CancellationToken, set: ManifestSet, cfg: SchedulerConfig) -> Result<Applied> {
        let objects = self.with_stored(set.managed)?;
        info!(objects = objects.len(), provider_configs = set.provider_configs.len(), "applying");
        let sched = self.scheduler(set.provider_configs, cfg)?;
        let converge = sched.converge(ctx, objects).await;
        self.save(converge)
    }

    pub async fn delete(&self, ctx: &CancellationToken, set: ManifestSet, cfg: SchedulerConfig) -> Result<Applied> {
        let mut objects = self.with_stored(set.managed)?;
        objects.iter_mut().for_each(AnyManaged::mark_deleting);
        info!(objects = objects.len(), "deleting");
        let sched = self.scheduler(set.provider_configs, cfg)?;
        let converge = sched.converge(ctx, objects).await;
        self.save(converge)
    }

    fn save(&self, converge: ConvergeReport) -> Result<Applied> {
        let ts = now_ts();
        for obj in &converge.gone {
            self.store.delete_object(obj.kind(), obj.name())?;
        }
        for r in &converge.last.results {
            let (outcome, message) = match &r.result {
                Ok(rep) => (rep.outcome.as_str().to_string(), None),
                Err(e) => ("error".to_string(), Some(e.to_string())),
            };
            self.store.record(&HistoryEntry {
                kind: r.object.kind().as_str().to_string(),
                name: r.object.name().to_string(),
                ts,
                outcome,
                message,
            })?;
            if !r.is_gone() {
                self.store.put_object(&r.object)?;
            }
        }
        self.store.put_cluster(&self.cluster.snapshot())?;
        for ((ns, name), data) in self.secrets.snapshot() {
            self.store.put_secret(&ns, &name, &data)?;
        }
        Ok(Applied { converge, statements: self.cluster.take_statements() })
    }
}
