//! cqlop controller: drives keyspaces, roles and grants in a CQL database
//! toward their declared state.
//!
//! - `ExternalClient<K>`: observe/create/update/delete for one kind
//! - `connector::Connector`: the Connect step (provider config, credentials, session)
//! - `managed::Reconciler`: one reconciliation of one object, conditions included
//! - `scheduler::Scheduler`: bounded, per-object serialized passes over many objects

#![forbid(unsafe_code)]

pub mod connector;
mod error;
mod exec;
pub mod grant;
pub mod keyspace;
pub mod managed;
pub mod password;
pub mod role;
pub mod scheduler;

use std::sync::Arc;

use cqlop_core::{AnyManaged, ConnectionDetails, Managed};
use cqlop_db::Database;
use tokio_util::sync::CancellationToken;

pub use connector::Connector;
pub use error::{Error, Result};
pub use managed::{ObjectIndex, ReconcileOutcome, ReconcileReport, Reconciler, ReferenceResolver};
pub use password::{PasswordGenerator, RandomPassword, StaticPassword};
pub use scheduler::{PassReport, Scheduler, SchedulerConfig};

/// What Observe learned about the external object.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalObservation<P, O> {
    pub resource_exists: bool,
    pub resource_up_to_date: bool,
    /// Desired parameters with unset fields filled from live state; present
    /// only when something was filled.
    pub late_initialized: Option<P>,
    /// Status to record for the object, when Observe decided one.
    pub at_provider: Option<O>,
}

impl<P, O> ExternalObservation<P, O> {
    pub fn absent() -> Self {
        Self { resource_exists: false, resource_up_to_date: false, late_initialized: None, at_provider: None }
    }

    pub fn resource_late_initialized(&self) -> bool {
        self.late_initialized.is_some()
    }
}

pub type Observation<K> = ExternalObservation<<K as Managed>::Parameters, <K as Managed>::Observation>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExternalCreation {
    pub connection_details: ConnectionDetails,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalUpdate<O> {
    pub connection_details: ConnectionDetails,
    pub at_provider: Option<O>,
}

impl<O> Default for ExternalUpdate<O> {
    fn default() -> Self {
        Self { connection_details: ConnectionDetails::new(), at_provider: None }
    }
}

/// Per-kind operations against the database. Each call is bound to the
/// session the Connect step opened.
#[async_trait::async_trait]
pub trait ExternalClient<K: Managed>: Send + Sync {
    async fn observe(&self, ctx: &CancellationToken, cr: &K) -> Result<Observation<K>>;
    async fn create(&self, ctx: &CancellationToken, cr: &K) -> Result<ExternalCreation>;
    async fn update(&self, ctx: &CancellationToken, cr: &K) -> Result<ExternalUpdate<K::Observation>>;
    async fn delete(&self, ctx: &CancellationToken, cr: &K) -> Result<()>;
}

/// A kind with an `ExternalClient`.
pub trait Reconcilable: Managed {
    fn new_client(db: Arc<dyn Database>, passwords: Arc<dyn PasswordGenerator>) -> Box<dyn ExternalClient<Self>>;
}

/// Narrow a tagged resource to `K`, or fail without side effects.
pub fn narrow<K: Managed>(any: &AnyManaged) -> Result<&K> {
    K::from_any(any).ok_or(Error::WrongKind(K::KIND))
}

/// Copy `observed` into `desired` when the latter is unset.
pub(crate) fn late_init_field<T: Clone>(desired: &mut Option<T>, observed: &Option<T>) -> bool {
    if desired.is_none() && observed.is_some() {
        desired.clone_from(observed);
        true
    } else {
        false
    }
}

pub(crate) fn external_name<K: Managed>(cr: &K) -> Result<&str> {
    cr.external_name().ok_or(Error::MissingExternalName)
}
