//! Managed-resource driver: one reconciliation of one object.
//!
//! Order of work:
//! 1. default the external name to `metadata.name`
//! 2. resolve grant references to the referenced objects' external names
//! 3. connect
//! 4. deleting: orphan, or observe and delete when present
//! 5. observe, writing back late-initialized spec and status
//! 6. create when absent, update when drifted
//!
//! Every write-back lands on the object passed in; the caller persists it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use cqlop_core::{
    AnyManaged, Condition, ConnectionDetails, DeletionPolicy, Grant, Managed, ResourceKind, EXTERNAL_NAME_ANNOTATION,
};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connector::ConnectionPublisher;
use crate::{Connector, Error, Reconcilable, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created,
    Updated,
    UpToDate,
    Deleted,
    /// Deleting with the `Orphan` policy; nothing was issued.
    Orphaned,
    /// Deleting, and the external object was already gone.
    Absent,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Created => "created",
            ReconcileOutcome::Updated => "updated",
            ReconcileOutcome::UpToDate => "up_to_date",
            ReconcileOutcome::Deleted => "deleted",
            ReconcileOutcome::Orphaned => "orphaned",
            ReconcileOutcome::Absent => "absent",
        }
    }

    /// Nothing left to do for this object.
    pub fn is_settled(&self) -> bool {
        !matches!(self, ReconcileOutcome::Created | ReconcileOutcome::Updated)
    }

    /// The object itself is finished with and may be forgotten.
    pub fn is_gone(&self) -> bool {
        matches!(self, ReconcileOutcome::Deleted | ReconcileOutcome::Orphaned | ReconcileOutcome::Absent)
    }
}

impl std::fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub outcome: ReconcileOutcome,
    pub connection_details: ConnectionDetails,
    pub late_initialized: bool,
}

impl ReconcileReport {
    fn new(outcome: ReconcileOutcome) -> Self {
        Self { outcome, connection_details: ConnectionDetails::new(), late_initialized: false }
    }
}

/// Looks up the external name of another managed object.
pub trait ReferenceResolver: Send + Sync {
    fn external_name(&self, kind: ResourceKind, name: &str) -> Option<String>;
}

/// Reference index over a set of objects. An object without an external name
/// resolves to its `metadata.name`, the value the driver would default it to.
#[derive(Debug, Clone, Default)]
pub struct ObjectIndex {
    names: BTreeMap<(ResourceKind, String), String>,
}

impl ObjectIndex {
    pub fn new<'a>(objects: impl IntoIterator<Item = &'a AnyManaged>) -> Self {
        let mut index = Self::default();
        index.extend(objects);
        index
    }

    /// Add objects, replacing earlier entries of the same kind and name.
    /// Deleting objects drop out of the index.
    pub fn extend<'a>(&mut self, objects: impl IntoIterator<Item = &'a AnyManaged>) {
        for o in objects {
            let key = (o.kind(), o.name().to_string());
            if o.is_deleting() {
                self.names.remove(&key);
            } else {
                self.names.insert(key, o.external_name().unwrap_or(o.name()).to_string());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl ReferenceResolver for ObjectIndex {
    fn external_name(&self, kind: ResourceKind, name: &str) -> Option<String> {
        self.names.get(&(kind, name.to_string())).cloned()
    }
}

/// Fill `role`/`keyspace` from `roleRef`/`keyspaceRef` when unset.
pub fn resolve_references(grant: &mut Grant, refs: &dyn ReferenceResolver) -> Result<bool> {
    let p = &mut grant.spec.for_provider;
    let mut changed = false;
    if p.role.as_deref().map_or(true, str::is_empty) {
        if let Some(r) = p.role_ref.as_ref() {
            let ext = refs
                .external_name(ResourceKind::Role, &r.name)
                .ok_or_else(|| Error::UnresolvedReference { field: "roleRef", name: r.name.clone() })?;
            p.role = Some(ext);
            changed = true;
        }
    }
    if p.keyspace.as_deref().map_or(true, str::is_empty) {
        if let Some(r) = p.keyspace_ref.as_ref() {
            let ext = refs
                .external_name(ResourceKind::Keyspace, &r.name)
                .ok_or_else(|| Error::UnresolvedReference { field: "keyspaceRef", name: r.name.clone() })?;
            p.keyspace = Some(ext);
            changed = true;
        }
    }
    Ok(changed)
}

/// Reconciles single objects through a `Connector`.
#[derive(Clone)]
pub struct Reconciler {
    connector: Connector,
    publisher: Option<Arc<dyn ConnectionPublisher>>,
}

impl Reconciler {
    pub fn new(connector: Connector) -> Self {
        Self { connector, publisher: None }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn ConnectionPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Run one reconciliation and record its result in the Synced condition.
    pub async fn reconcile(
        &self,
        ctx: &CancellationToken,
        obj: &mut AnyManaged,
        refs: &dyn ReferenceResolver,
    ) -> Result<ReconcileReport> {
        let started = Instant::now();
        let kind = obj.kind();
        let result = self.run(ctx, obj, refs).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!("reconcile_ms", elapsed_ms, "kind" => kind.as_str());
        match &result {
            Ok(report) => {
                obj.resource_status_mut().set_condition(Condition::reconcile_success());
                counter!("reconcile_total", 1u64, "kind" => kind.as_str(), "outcome" => report.outcome.as_str());
                info!(kind = %kind, name = obj.name(), outcome = %report.outcome, elapsed_ms, "reconciled");
            }
            Err(e) => {
                obj.resource_status_mut().set_condition(Condition::reconcile_error(e.to_string()));
                counter!("reconcile_total", 1u64, "kind" => kind.as_str(), "outcome" => "error");
                warn!(kind = %kind, name = obj.name(), error = %e, "reconcile failed");
            }
        }
        result
    }

    async fn run(&self, ctx: &CancellationToken, obj: &mut AnyManaged, refs: &dyn ReferenceResolver) -> Result<ReconcileReport> {
        if obj.external_name().is_none() {
            let name = obj.name().to_string();
            if name.is_empty() {
                return Err(Error::MissingField("metadata.name"));
            }
            debug!(annotation = EXTERNAL_NAME_ANNOTATION, name = %name, "defaulting external name");
            obj.set_external_name(&name);
        }
        match obj {
            AnyManaged::Keyspace(cr) => self.drive(ctx, cr).await,
            AnyManaged::Role(cr) => self.drive(ctx, cr).await,
            AnyManaged::Grant(cr) => {
                if !cr.is_deleting() {
                    resolve_references(cr, refs)?;
                }
                self.drive(ctx, cr).await
            }
        }
    }

    async fn drive<K: Reconcilable>(&self, ctx: &CancellationToken, cr: &mut K) -> Result<ReconcileReport> {
        let client = self.connector.connect_managed(&*cr).await?;

        if cr.is_deleting() {
            cr.resource_status_mut().set_condition(Condition::deleting());
            if cr.deletion_policy() == DeletionPolicy::Orphan {
                return Ok(ReconcileReport::new(ReconcileOutcome::Orphaned));
            }
            let obs = client.observe(ctx, cr).await?;
            if !obs.resource_exists {
                return Ok(ReconcileReport::new(ReconcileOutcome::Absent));
            }
            client.delete(ctx, cr).await?;
            return Ok(ReconcileReport::new(ReconcileOutcome::Deleted));
        }

        let obs = client.observe(ctx, cr).await?;
        let late_initialized = obs.resource_late_initialized();
        if let Some(filled) = obs.late_initialized {
            *cr.for_provider_mut() = filled;
        }
        if let Some(status) = obs.at_provider {
            *cr.at_provider_mut() = status;
        }

        let mut report = if !obs.resource_exists {
            let created = client.create(ctx, cr).await?;
            cr.resource_status_mut().set_condition(Condition::creating());
            ReconcileReport { outcome: ReconcileOutcome::Created, connection_details: created.connection_details, late_initialized }
        } else {
            cr.resource_status_mut().set_condition(Condition::available());
            if obs.resource_up_to_date {
                ReconcileReport { outcome: ReconcileOutcome::UpToDate, connection_details: ConnectionDetails::new(), late_initialized }
            } else {
                let updated = client.update(ctx, cr).await?;
                if let Some(status) = updated.at_provider {
                    *cr.at_provider_mut() = status;
                }
                ReconcileReport { outcome: ReconcileOutcome::Updated, connection_details: updated.connection_details, late_initialized }
            }
        };

        if !report.connection_details.is_empty() {
            self.publish(cr, &report.connection_details).await?;
        }
        report.late_initialized = late_initialized;
        Ok(report)
    }

    async fn publish<K: Managed>(&self, cr: &K, details: &ConnectionDetails) -> Result<()> {
        let (Some(publisher), Some(target)) = (&self.publisher, cr.resource_spec().write_connection_secret_to_ref.as_ref())
        else {
            return Ok(());
        };
        publisher.publish(target, details).await.map_err(Error::Publish)?;
        debug!(secret = %format!("{}/{}", target.namespace, target.name), keys = details.len(), "published connection details");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cqlop_core::{GrantParameters, Reference};

    fn grant_with_refs() -> Grant {
        Grant::new(
            "g",
            GrantParameters {
                role_ref: Some(Reference { name: "app".into() }),
                keyspace_ref: Some(Reference { name: "shop".into() }),
                ..Default::default()
            },
        )
    }

    #[test]
    fn references_resolve_to_external_names() {
        let role: AnyManaged = cqlop_core::Role::with_external_name("app", "app_role", Default::default()).into();
        let ks: AnyManaged = cqlop_core::Keyspace::new("shop", Default::default()).into();
        let index = ObjectIndex::new([&role, &ks]);
        let mut g = grant_with_refs();
        assert!(resolve_references(&mut g, &index).unwrap());
        assert_eq!(g.spec.for_provider.role.as_deref(), Some("app_role"));
        assert_eq!(g.spec.for_provider.keyspace.as_deref(), Some("shop"));
        assert!(!resolve_references(&mut g, &index).unwrap());
    }

    #[test]
    fn explicit_values_win_over_references() {
        let mut g = grant_with_refs();
        g.spec.for_provider.role = Some("direct".into());
        g.spec.for_provider.keyspace = Some("direct_ks".into());
        assert!(!resolve_references(&mut g, &ObjectIndex::default()).unwrap());
        assert_eq!(g.spec.for_provider.role.as_deref(), Some("direct"));
    }

    #[test]
    fn unresolved_reference() {
        let err = resolve_references(&mut grant_with_refs(), &ObjectIndex::default()).unwrap_err();
        assert_eq!(err.to_string(), "cannot resolve roleRef reference \"app\"");
    }

    #[test]
    fn outcomes() {
        assert!(ReconcileOutcome::UpToDate.is_settled());
        assert!(!ReconcileOutcome::Created.is_settled());
        assert!(ReconcileOutcome::Orphaned.is_gone());
        assert!(!ReconcileOutcome::Updated.is_gone());
    }
}
