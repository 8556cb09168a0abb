//! cqlop kubehub: the connect step and managed-resource I/O against a
//! Kubernetes API server.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use cqlop_controller::connector::{ConnectionPublisher, ProviderConfigSource, SecretReader, UsageTracker};
use cqlop_core::{
    AnyManaged, ConnectionDetails, ProviderConfig, ResourceKind, SecretKeySelector, SecretReference, API_GROUP,
    API_VERSION,
};
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::{
    api::{Api, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::watcher::{self, Event},
};
use metrics::counter;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use kube::Client;

pub const PROVIDER_GROUP: &str = "cassandra.crossplane.io";
pub const PROVIDER_VERSION: &str = "v1alpha1";
pub const FIELD_MANAGER: &str = "cqlop";
pub const FINALIZER: &str = "finalizer.managedresource.crossplane.io";

pub async fn client() -> Result<Client> {
    Client::try_default().await.context("cannot build Kubernetes client")
}

fn provider_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(PROVIDER_GROUP, PROVIDER_VERSION, kind), plural)
}

/// API resource of a managed kind. All three are cluster scoped.
pub fn managed_resource(kind: ResourceKind) -> ApiResource {
    let plural = match kind {
        ResourceKind::Keyspace => "keyspaces",
        ResourceKind::Role => "roles",
        ResourceKind::Grant => "grants",
    };
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(API_GROUP, "v1alpha1", kind.as_str()), plural)
}

fn managed_api(client: &Client, kind: ResourceKind) -> Api<DynamicObject> {
    Api::all_with(client.clone(), &managed_resource(kind))
}

fn to_managed(kind: ResourceKind, obj: &DynamicObject) -> Result<AnyManaged> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    if let Some(map) = raw.as_object_mut() {
        map.insert("kind".into(), Value::String(kind.as_str().to_string()));
        map.insert("apiVersion".into(), Value::String(API_VERSION.to_string()));
        if let Some(meta) = map.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.remove("managedFields");
        }
    }
    serde_json::from_value(raw).with_context(|| format!("decoding {} {:?}", kind, obj.metadata.name))
}

/// Provider configs read from the cluster-scoped `ProviderConfig` resource.
#[derive(Clone)]
pub struct KubeProviderConfigs {
    api: Api<DynamicObject>,
}

impl KubeProviderConfigs {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all_with(client, &provider_resource("ProviderConfig", "providerconfigs")) }
    }
}

#[async_trait]
impl ProviderConfigSource for KubeProviderConfigs {
    async fn get(&self, name: &str) -> anyhow::Result<ProviderConfig> {
        counter!("kube_requests_total", 1u64, "op" => "get_provider_config");
        let obj = self.api.get_opt(name).await?.ok_or_else(|| anyhow!("ProviderConfig {:?} not found", name))?;
        let raw = serde_json::to_value(&obj)?;
        Ok(serde_json::from_value(raw)?)
    }
}

/// Secrets through the core/v1 API: credential reads and connection-detail
/// writes.
#[derive(Clone)]
pub struct KubeSecrets {
    client: Client,
}

impl KubeSecrets {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn secret_body(secret: &SecretReference, details: &ConnectionDetails) -> Secret {
    let mut s = Secret::default();
    s.metadata.name = Some(secret.name.clone());
    s.metadata.namespace = Some(secret.namespace.clone());
    s.type_ = Some("connection.crossplane.io/v1alpha1".into());
    s.data = Some(details.iter().map(|(k, v)| (k.clone(), ByteString(v.clone()))).collect());
    s
}

#[async_trait]
impl SecretReader for KubeSecrets {
    async fn read(&self, selector: &SecretKeySelector) -> anyhow::Result<Vec<u8>> {
        counter!("kube_requests_total", 1u64, "op" => "read_secret");
        let secret = self
            .api(&selector.namespace)
            .get_opt(&selector.name)
            .await?
            .ok_or_else(|| anyhow!("secret {}/{} not found", selector.namespace, selector.name))?;
        secret
            .data
            .and_then(|mut d| d.remove(&selector.key))
            .map(|b| b.0)
            .ok_or_else(|| anyhow!("secret {}/{} has no key {:?}", selector.namespace, selector.name, selector.key))
    }
}

#[async_trait]
impl ConnectionPublisher for KubeSecrets {
    async fn publish(&self, secret: &SecretReference, details: &ConnectionDetails) -> anyhow::Result<()> {
        counter!("kube_requests_total", 1u64, "op" => "publish_secret");
        let mut body = serde_json::to_value(secret_body(secret, details))?;
        body["apiVersion"] = json!("v1");
        body["kind"] = json!("Secret");
        self.api(&secret.namespace)
            .patch(&secret.name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&body))
            .await
            .with_context(|| format!("cannot apply secret {}/{}", secret.namespace, secret.name))?;
        Ok(())
    }
}

/// Records provider config usage as `ProviderConfigUsage` objects.
#[derive(Clone)]
pub struct KubeUsageTracker {
    api: Api<DynamicObject>,
}

impl KubeUsageTracker {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all_with(client, &provider_resource("ProviderConfigUsage", "providerconfigusages")) }
    }
}

fn usage_name(kind: ResourceKind, name: &str) -> String {
    format!("{}-{}", kind.as_str().to_ascii_lowercase(), name)
}

fn usage_body(kind: ResourceKind, name: &str, provider_config: &str) -> Value {
    json!({
        "apiVersion": format!("{}/{}", PROVIDER_GROUP, PROVIDER_VERSION),
        "kind": "ProviderConfigUsage",
        "metadata": {
            "name": usage_name(kind, name),
            "labels": { "crossplane.io/provider-config": provider_config },
        },
        "providerConfigRef": { "name": provider_config },
        "resourceRef": { "apiVersion": API_VERSION, "kind": kind.as_str(), "name": name },
    })
}

#[async_trait]
impl UsageTracker for KubeUsageTracker {
    async fn track(&self, kind: ResourceKind, name: &str, provider_config: &str) -> anyhow::Result<()> {
        counter!("kube_requests_total", 1u64, "op" => "track_usage");
        let body = usage_body(kind, name, provider_config);
        self.api
            .patch(&usage_name(kind, name), &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&body))
            .await?;
        Ok(())
    }
}

/// Every managed resource currently stored, in kind order.
pub async fn list_managed(client: &Client) -> Result<Vec<AnyManaged>> {
    let mut out = Vec::new();
    for kind in ResourceKind::ALL {
        let list = managed_api(client, kind).list(&Default::default()).await.with_context(|| format!("listing {}", kind))?;
        for obj in &list.items {
            match to_managed(kind, obj) {
                Ok(m) => out.push(m),
                Err(e) => warn!(kind = %kind, error = %format!("{e:#}"), "skipping undecodable object"),
            }
        }
    }
    debug!(count = out.len(), "listed managed resources");
    Ok(out)
}

/// Change to a watched managed resource.
#[derive(Debug, Clone)]
pub enum ManagedEvent {
    Applied(AnyManaged),
    Deleted(ResourceKind, String),
}

/// List+watch every managed kind and forward events until the receiver is
/// dropped or a watch stream fails.
pub async fn watch_managed(client: Client, tx: mpsc::Sender<ManagedEvent>) -> Result<()> {
    let streams = ResourceKind::ALL.into_iter().map(|kind| {
        watcher::watcher(managed_api(&client, kind), watcher::Config::default()).map(move |ev| ev.map(|e| (kind, e)))
    });
    let stream = futures::stream::select_all(streams.map(|s| s.boxed()));
    futures::pin_mut!(stream);
    info!("managed resource watch started");
    while let Some((kind, ev)) = stream.try_next().await? {
        let events: Vec<ManagedEvent> = match ev {
            Event::Applied(o) => vec![ManagedEvent::Applied(to_managed(kind, &o)?)],
            Event::Deleted(o) => vec![ManagedEvent::Deleted(kind, o.metadata.name.unwrap_or_default())],
            Event::Restarted(list) => {
                debug!(kind = %kind, count = list.len(), "watch restart");
                list.iter().map(|o| to_managed(kind, o).map(ManagedEvent::Applied)).collect::<Result<Vec<_>>>()?
            }
        };
        for e in events {
            if tx.send(e).await.is_err() {
                return Ok(());
            }
        }
    }
    warn!("managed resource watch ended");
    Ok(())
}

fn finalizers_patch(obj: &AnyManaged, present: bool) -> Option<Value> {
    let mut finalizers: Vec<String> = obj.metadata().finalizers.clone().unwrap_or_default();
    let has = finalizers.iter().any(|f| f == FINALIZER);
    match (present, has) {
        (true, false) => finalizers.push(FINALIZER.to_string()),
        (false, true) => finalizers.retain(|f| f != FINALIZER),
        _ => return None,
    }
    Some(json!({ "metadata": { "finalizers": finalizers } }))
}

/// Write a reconciled object back: annotations and spec, then status.
pub async fn write_back(client: &Client, obj: &AnyManaged) -> Result<()> {
    let api = managed_api(client, obj.kind());
    let raw = serde_json::to_value(obj)?;
    let meta = json!({
        "metadata": { "annotations": obj.metadata().annotations.clone().unwrap_or_default() },
        "spec": raw.get("spec").cloned().unwrap_or(Value::Null),
    });
    let pp = PatchParams::default();
    api.patch(obj.name(), &pp, &Patch::Merge(&meta)).await.with_context(|| format!("patching {} {}", obj.kind(), obj.name()))?;
    let status = json!({ "status": raw.get("status").cloned().unwrap_or(Value::Null) });
    api.patch_status(obj.name(), &pp, &Patch::Merge(&status))
        .await
        .with_context(|| format!("patching status of {} {}", obj.kind(), obj.name()))?;
    counter!("kube_requests_total", 2u64, "op" => "write_back");
    Ok(())
}

/// Add (`present`) or remove the managed-resource finalizer.
pub async fn set_finalizer(client: &Client, obj: &AnyManaged, present: bool) -> Result<()> {
    let Some(patch) = finalizers_patch(obj, present) else { return Ok(()) };
    managed_api(client, obj.kind())
        .patch(obj.name(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .with_context(|| format!("updating finalizers of {} {}", obj.kind(), obj.name()))?;
    counter!("kube_requests_total", 1u64, "op" => "finalizer");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cqlop_core::{Keyspace, Managed, Role};

    #[test]
    fn managed_resources_use_group_and_plural() {
        let ar = managed_resource(ResourceKind::Grant);
        assert_eq!(ar.group, API_GROUP);
        assert_eq!(ar.plural, "grants");
        assert_eq!(ar.api_version, API_VERSION);
    }

    #[test]
    fn dynamic_object_decodes_without_kind() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "metadata": { "name": "shop", "managedFields": [{}] },
            "spec": { "forProvider": { "replicationFactor": 3 } },
        }))
        .unwrap();
        let m = to_managed(ResourceKind::Keyspace, &obj).unwrap();
        let ks = Keyspace::from_any(&m).unwrap();
        assert_eq!(ks.spec.for_provider.replication_factor, Some(3));
        assert!(ks.metadata.managed_fields.is_none());
    }

    #[test]
    fn usage_object_references_resource() {
        let body = usage_body(ResourceKind::Role, "app", "prod");
        assert_eq!(body["metadata"]["name"], "role-app");
        assert_eq!(body["providerConfigRef"]["name"], "prod");
        assert_eq!(body["resourceRef"]["kind"], "Role");
    }

    #[test]
    fn secret_body_carries_details() {
        let details = ConnectionDetails::from([("username".to_string(), b"app".to_vec())]);
        let s = secret_body(&SecretReference { namespace: "apps".into(), name: "db".into() }, &details);
        assert_eq!(s.data.unwrap()["username"].0, b"app".to_vec());
        assert_eq!(s.metadata.namespace.as_deref(), Some("apps"));
    }

    #[test]
    fn finalizer_patch_only_on_change() {
        let mut obj: AnyManaged = Role::new("app", Default::default()).into();
        let patch = finalizers_patch(&obj, true).unwrap();
        assert_eq!(patch["metadata"]["finalizers"], json!([FINALIZER]));
        if let AnyManaged::Role(r) = &mut obj {
            r.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        }
        assert!(finalizers_patch(&obj, true).is_none());
        assert_eq!(finalizers_patch(&obj, false).unwrap()["metadata"]["finalizers"], json!([]));
    }
}
