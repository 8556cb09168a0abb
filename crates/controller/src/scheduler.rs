//! Passes over many managed objects.
//!
//! Objects of one kind share a concurrency limit. Objects with the same
//! (kind, external name) run one after another in a single task, so the same
//! external object is never reconciled twice at once. A failed object is not
//! retried within a pass; `converge` runs further passes instead.

use std::sync::Arc;

use anyhow::anyhow;
use cqlop_core::{AnyManaged, ResourceKind};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{Error, ObjectIndex, ReconcileReport, Reconciler, Result};

pub const DEFAULT_MAX_CONCURRENCY: usize = 5;
pub const DEFAULT_MAX_PASSES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Concurrent reconciles per kind.
    pub max_concurrency: usize,
    pub max_passes: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_concurrency: DEFAULT_MAX_CONCURRENCY, max_passes: DEFAULT_MAX_PASSES }
    }
}

impl SchedulerConfig {
    /// `CQLOP_MAX_CONCURRENCY` and `CQLOP_MAX_PASSES`, falling back to defaults.
    pub fn from_env() -> Self {
        let read = |key: &str, default: usize| {
            std::env::var(key).ok().and_then(|s| s.parse::<usize>().ok()).filter(|n| *n > 0).unwrap_or(default)
        };
        Self {
            max_concurrency: read("CQLOP_MAX_CONCURRENCY", DEFAULT_MAX_CONCURRENCY),
            max_passes: read("CQLOP_MAX_PASSES", DEFAULT_MAX_PASSES),
        }
    }
}

/// One object after a reconcile, with its write-backs applied.
#[derive(Debug)]
pub struct Reconciled {
    pub object: AnyManaged,
    pub result: Result<ReconcileReport>,
}

impl Reconciled {
    pub fn is_gone(&self) -> bool {
        matches!(&self.result, Ok(r) if r.outcome.is_gone())
    }
}

/// Results of one pass, in input order.
#[derive(Debug, Default)]
pub struct PassReport {
    pub results: Vec<Reconciled>,
}

impl PassReport {
    /// Every object reconciled without error and without issuing a change.
    pub fn is_settled(&self) -> bool {
        self.results.iter().all(|r| matches!(&r.result, Ok(rep) if rep.outcome.is_settled()))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&AnyManaged, &Error)> {
        self.results.iter().filter_map(|r| r.result.as_ref().err().map(|e| (&r.object, e)))
    }
}

#[derive(Debug, Default)]
pub struct ConvergeReport {
    pub passes: usize,
    pub converged: bool,
    /// Objects deleted or orphaned along the way.
    pub gone: Vec<AnyManaged>,
    pub last: PassReport,
}

pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    limits: FxHashMap<ResourceKind, Arc<Semaphore>>,
    config: SchedulerConfig,
    /// Objects outside the batch that references may still point at.
    known: ObjectIndex,
}

fn group_key(o: &AnyManaged) -> (ResourceKind, String) {
    (o.kind(), o.external_name().unwrap_or(o.name()).to_string())
}

impl Scheduler {
    pub fn new(reconciler: Reconciler, config: SchedulerConfig) -> Self {
        let limits = ResourceKind::ALL
            .into_iter()
            .map(|k| (k, Arc::new(Semaphore::new(config.max_concurrency.max(1)))))
            .collect();
        Self { reconciler: Arc::new(reconciler), limits, config, known: ObjectIndex::default() }
    }

    /// Resolve references against `known` as well as the objects of each pass.
    pub fn with_known(mut self, known: ObjectIndex) -> Self {
        self.known = known;
        self
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    fn limit(&self, kind: ResourceKind) -> Arc<Semaphore> {
        match self.limits.get(&kind) {
            Some(sem) => Arc::clone(sem),
            None => Arc::new(Semaphore::new(self.config.max_concurrency.max(1))),
        }
    }

    /// Reconcile every object once.
    pub async fn run_pass(&self, ctx: &CancellationToken, objects: Vec<AnyManaged>) -> PassReport {
        let total = objects.len();
        let mut index = self.known.clone();
        index.extend(&objects);
        let refs = Arc::new(index);

        let mut order: Vec<(ResourceKind, String)> = Vec::new();
        let mut groups: FxHashMap<(ResourceKind, String), Vec<(usize, AnyManaged)>> = FxHashMap::default();
        for (idx, obj) in objects.into_iter().enumerate() {
            let key = group_key(&obj);
            let group = groups.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                Vec::new()
            });
            group.push((idx, obj));
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, Reconciled)>();
        let mut tasks = JoinSet::new();
        let mut inputs: Vec<Option<AnyManaged>> = vec![None; total];
        for key in order {
            let Some(group) = groups.remove(&key) else { continue };
            for (idx, obj) in &group {
                inputs[*idx] = Some(obj.clone());
            }
            let (kind, name) = key;
            let sem = self.limit(kind);
            let reconciler = Arc::clone(&self.reconciler);
            let refs = Arc::clone(&refs);
            let ctx = ctx.clone();
            let tx = tx.clone();
            let span = info_span!("reconcile", kind = %kind, name = %name);
            tasks.spawn(
                async move {
                    for (idx, mut object) in group {
                        let result = tokio::select! {
                            biased;
                            _ = ctx.cancelled() => Err(Error::Cancelled),
                            permit = Arc::clone(&sem).acquire_owned() => match permit {
                                Ok(_permit) => reconciler.reconcile(&ctx, &mut object, &*refs).await,
                                Err(_) => Err(Error::Cancelled),
                            },
                        };
                        if tx.send((idx, Reconciled { object, result })).is_err() {
                            break;
                        }
                    }
                }
                .instrument(span),
            );
        }
        drop(tx);

        let mut slots: Vec<Option<Reconciled>> = (0..total).map(|_| None).collect();
        while let Some((idx, r)) = rx.recv().await {
            slots[idx] = Some(r);
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "reconcile task failed");
            }
        }

        let results = slots
            .into_iter()
            .zip(inputs)
            .filter_map(|(slot, input)| match (slot, input) {
                (Some(r), _) => Some(r),
                (None, Some(object)) => {
                    Some(Reconciled { object, result: Err(Error::Upstream { context: "reconcile task failed", source: anyhow!("task ended early") }) })
                }
                (None, None) => None,
            })
            .collect();
        PassReport { results }
    }

    /// Run passes until one issues no change and sees no error, the pass
    /// budget is spent, or `ctx` is cancelled.
    pub async fn converge(&self, ctx: &CancellationToken, mut objects: Vec<AnyManaged>) -> ConvergeReport {
        let mut report = ConvergeReport::default();
        loop {
            report.passes += 1;
            let pass = self.run_pass(ctx, objects).await;
            report.converged = pass.is_settled();
            debug!(pass = report.passes, settled = report.converged, "pass finished");
            report.gone.extend(pass.results.iter().filter(|r| r.is_gone()).map(|r| r.object.clone()));
            if report.converged || report.passes >= self.config.max_passes || ctx.is_cancelled() {
                report.last = pass;
                break;
            }
            objects = pass.results.into_iter().filter(|r| !r.is_gone()).map(|r| r.object).collect();
        }
        info!(passes = report.passes, converged = report.converged, gone = report.gone.len(), "converge finished");
        report
    }
}
