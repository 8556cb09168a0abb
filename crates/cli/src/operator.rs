//! `run`: reconcile managed resources stored on a Kubernetes API server
//! against the clusters their ProviderConfigs point at.
//!
//! Watch events update a local view; every batch of events, and every resync
//! tick, runs one scheduler pass over the whole view and writes results back.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cqlop_controller::connector::CommonCredentialExtractor;
use cqlop_controller::{Connector, Reconciler, Scheduler, SchedulerConfig};
use cqlop_core::{AnyManaged, ResourceKind};
use cqlop_db::NativeDriver;
use cqlop_kubehub::{Client, KubeProviderConfigs, KubeSecrets, KubeUsageTracker, ManagedEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type View = BTreeMap<(ResourceKind, String), AnyManaged>;

fn apply_event(view: &mut View, ev: ManagedEvent) {
    match ev {
        ManagedEvent::Applied(obj) => {
            view.insert(obj.key(), obj);
        }
        ManagedEvent::Deleted(kind, name) => {
            view.remove(&(kind, name));
        }
    }
}

pub async fn run(ctx: &CancellationToken, client: Client, cfg: SchedulerConfig, resync: Duration) -> Result<()> {
    let secrets = Arc::new(KubeSecrets::new(client.clone()));
    let extractor = CommonCredentialExtractor::new().with_secrets(secrets.clone());
    let connector = Connector::new(
        Arc::new(KubeProviderConfigs::new(client.clone())),
        Arc::new(extractor),
        Arc::new(NativeDriver::new()),
    )
    .with_usage_tracker(Arc::new(KubeUsageTracker::new(client.clone())));
    let sched = Scheduler::new(Reconciler::new(connector).with_publisher(secrets), cfg);

    let (tx, mut rx) = mpsc::channel::<ManagedEvent>(1024);
    let watch = tokio::spawn({
        let client = client.clone();
        async move {
            if let Err(e) = cqlop_kubehub::watch_managed(client, tx).await {
                error!(error = %format!("{e:#}"), "managed resource watch failed");
            }
        }
    });

    let mut view = View::new();
    for obj in cqlop_kubehub::list_managed(&client).await? {
        view.insert(obj.key(), obj);
    }
    let mut tick = tokio::time::interval(resync);
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            maybe = rx.recv() => match maybe {
                Some(ev) => {
                    apply_event(&mut view, ev);
                    while let Ok(more) = rx.try_recv() {
                        apply_event(&mut view, more);
                    }
                }
                None => {
                    warn!("watch channel closed; stopping");
                    break;
                }
            },
            _ = tick.tick() => debug!("resync"),
        }

        let pass = sched.run_pass(ctx, view.values().cloned().collect()).await;
        for r in &pass.results {
            let obj = &r.object;
            let res = if r.is_gone() {
                cqlop_kubehub::set_finalizer(&client, obj, false).await
            } else {
                match cqlop_kubehub::set_finalizer(&client, obj, true).await {
                    Ok(()) => cqlop_kubehub::write_back(&client, obj).await,
                    Err(e) => Err(e),
                }
            };
            if let Err(e) = res {
                warn!(kind = %obj.kind(), name = obj.name(), error = %format!("{e:#}"), "write back failed");
            }
            if r.is_gone() {
                view.remove(&obj.key());
            } else {
                view.insert(obj.key(), obj.clone());
            }
        }
        info!(objects = pass.results.len(), settled = pass.is_settled(), failed = pass.failures().count(), "pass finished");
    }

    watch.abort();
    info!("reconcile loop stopped");
    Ok(())
}
