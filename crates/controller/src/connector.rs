//! Connect step: from a managed resource to a database session bound to the
//! credentials its provider config names.
//!
//! Each collaborator sits behind a trait so the same step runs against a
//! Kubernetes API server (`cqlop-kubehub`) or local state (this module).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context};
use cqlop_core::{
    AnyManaged, ConnectionDetails, CredentialsSource, Managed, ProviderConfig, ProviderCredentials, ResourceKind,
    SecretKeySelector, SecretReference,
};
use cqlop_db::{ConnectionConfig, Database, MemoryCluster, NativeDriver};
use tracing::{debug, info};

use crate::{narrow, Error, ExternalClient, PasswordGenerator, RandomPassword, Reconcilable, Result};

/// Records that a managed resource uses a provider config.
#[async_trait::async_trait]
pub trait UsageTracker: Send + Sync {
    async fn track(&self, kind: ResourceKind, name: &str, provider_config: &str) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
pub trait ProviderConfigSource: Send + Sync {
    async fn get(&self, name: &str) -> anyhow::Result<ProviderConfig>;
}

/// Turns a credentials selector into the raw credential payload.
#[async_trait::async_trait]
pub trait CredentialExtractor: Send + Sync {
    async fn extract(&self, credentials: &ProviderCredentials) -> anyhow::Result<Vec<u8>>;
}

#[async_trait::async_trait]
pub trait SecretReader: Send + Sync {
    async fn read(&self, selector: &SecretKeySelector) -> anyhow::Result<Vec<u8>>;
}

/// Writes connection details of a managed resource to a secret.
#[async_trait::async_trait]
pub trait ConnectionPublisher: Send + Sync {
    async fn publish(&self, secret: &SecretReference, details: &ConnectionDetails) -> anyhow::Result<()>;
}

/// Opens database sessions.
#[async_trait::async_trait]
pub trait DbFactory: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> anyhow::Result<Arc<dyn Database>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageTracker;

#[async_trait::async_trait]
impl UsageTracker for NoopUsageTracker {
    async fn track(&self, _kind: ResourceKind, _name: &str, _provider_config: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Provider configs held in memory, e.g. read from a manifest.
#[derive(Debug, Default)]
pub struct StaticProviderConfigs {
    configs: RwLock<BTreeMap<String, ProviderConfig>>,
}

impl StaticProviderConfigs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pc: ProviderConfig) {
        let name = pc.name().to_string();
        self.configs.write().unwrap_or_else(|e| e.into_inner()).insert(name, pc);
    }

    pub fn len(&self) -> usize {
        self.configs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<ProviderConfig> for StaticProviderConfigs {
    fn from_iter<I: IntoIterator<Item = ProviderConfig>>(iter: I) -> Self {
        let me = Self::new();
        for pc in iter {
            me.insert(pc);
        }
        me
    }
}

#[async_trait::async_trait]
impl ProviderConfigSource for StaticProviderConfigs {
    async fn get(&self, name: &str) -> anyhow::Result<ProviderConfig> {
        self.configs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("ProviderConfig {:?} not found", name))
    }
}

/// Secrets held in memory; also receives published connection details.
#[derive(Debug, Default)]
pub struct MemorySecrets {
    secrets: RwLock<BTreeMap<(String, String), BTreeMap<String, Vec<u8>>>>,
}

impl MemorySecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, namespace: &str, name: &str, data: BTreeMap<String, Vec<u8>>) {
        self.secrets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((namespace.to_string(), name.to_string()), data);
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<BTreeMap<String, Vec<u8>>> {
        self.secrets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<(String, String), BTreeMap<String, Vec<u8>>> {
        self.secrets.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait::async_trait]
impl SecretReader for MemorySecrets {
    async fn read(&self, selector: &SecretKeySelector) -> anyhow::Result<Vec<u8>> {
        let secret = self
            .get(&selector.namespace, &selector.name)
            .ok_or_else(|| anyhow!("secret {}/{} not found", selector.namespace, selector.name))?;
        secret
            .get(&selector.key)
            .cloned()
            .ok_or_else(|| anyhow!("secret {}/{} has no key {:?}", selector.namespace, selector.name, selector.key))
    }
}

#[async_trait::async_trait]
impl ConnectionPublisher for MemorySecrets {
    async fn publish(&self, secret: &SecretReference, details: &ConnectionDetails) -> anyhow::Result<()> {
        let mut all = self.secrets.write().unwrap_or_else(|e| e.into_inner());
        let entry = all.entry((secret.namespace.clone(), secret.name.clone())).or_default();
        entry.extend(details.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}

/// Resolves every credentials source; `Secret` needs a `SecretReader`.
#[derive(Default, Clone)]
pub struct CommonCredentialExtractor {
    secrets: Option<Arc<dyn SecretReader>>,
}

impl CommonCredentialExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretReader>) -> Self {
        self.secrets = Some(secrets);
        self
    }
}

#[async_trait::async_trait]
impl CredentialExtractor for CommonCredentialExtractor {
    async fn extract(&self, credentials: &ProviderCredentials) -> anyhow::Result<Vec<u8>> {
        match credentials.source {
            CredentialsSource::None => Ok(Vec::new()),
            CredentialsSource::Secret => {
                let selector = credentials.secret_ref.as_ref().context("no secretRef set for Secret credentials")?;
                let reader = self.secrets.as_ref().context("no secret store configured")?;
                reader.read(selector).await
            }
            CredentialsSource::Environment => {
                let env = credentials.env.as_ref().context("no env set for Environment credentials")?;
                std::env::var(&env.name).map(String::into_bytes).with_context(|| format!("cannot read environment variable {}", env.name))
            }
            CredentialsSource::Filesystem => {
                let fs = credentials.fs.as_ref().context("no fs set for Filesystem credentials")?;
                let path = PathBuf::from(&fs.path);
                tokio::fs::read(&path).await.with_context(|| format!("cannot read {}", path.display()))
            }
        }
    }
}

#[async_trait::async_trait]
impl DbFactory for MemoryCluster {
    async fn connect(&self, config: &ConnectionConfig) -> anyhow::Result<Arc<dyn Database>> {
        let session = MemoryCluster::connect(self, config)?;
        Ok(Arc::new(session))
    }
}

#[async_trait::async_trait]
impl DbFactory for NativeDriver {
    async fn connect(&self, config: &ConnectionConfig) -> anyhow::Result<Arc<dyn Database>> {
        let session: Arc<dyn Database> = self.session(config).await?;
        Ok(session)
    }
}

/// Produces an `ExternalClient` bound to the credentials of a resource's provider config.
#[derive(Clone)]
pub struct Connector {
    usage: Arc<dyn UsageTracker>,
    configs: Arc<dyn ProviderConfigSource>,
    credentials: Arc<dyn CredentialExtractor>,
    factory: Arc<dyn DbFactory>,
    passwords: Arc<dyn PasswordGenerator>,
}

impl Connector {
    pub fn new(
        configs: Arc<dyn ProviderConfigSource>,
        credentials: Arc<dyn CredentialExtractor>,
        factory: Arc<dyn DbFactory>,
    ) -> Self {
        Self { usage: Arc::new(NoopUsageTracker), configs, credentials, factory, passwords: Arc::new(RandomPassword) }
    }

    pub fn with_usage_tracker(mut self, usage: Arc<dyn UsageTracker>) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_password_generator(mut self, passwords: Arc<dyn PasswordGenerator>) -> Self {
        self.passwords = passwords;
        self
    }

    /// Connect for a tagged resource, rejecting it when it is not a `K`.
    pub async fn connect<K: Reconcilable>(&self, mg: &AnyManaged) -> Result<Box<dyn ExternalClient<K>>> {
        let cr = narrow::<K>(mg)?;
        self.connect_managed(cr).await
    }

    pub async fn connect_managed<K: Reconcilable>(&self, cr: &K) -> Result<Box<dyn ExternalClient<K>>> {
        let pc_name = cr.resource_spec().provider_config_name();
        self.usage
            .track(K::KIND, cr.name(), pc_name)
            .await
            .map_err(Error::upstream("cannot track ProviderConfig usage"))?;
        let pc = self.configs.get(pc_name).await.map_err(Error::upstream("cannot get ProviderConfig"))?;
        let raw = self
            .credentials
            .extract(&pc.spec.credentials)
            .await
            .map_err(Error::upstream("cannot get credentials"))?;
        let creds: BTreeMap<String, String> =
            serde_json::from_slice(&raw).map_err(Error::upstream("failed to parse credentials JSON"))?;
        let config = ConnectionConfig::from_credentials(&creds).map_err(Error::upstream("cannot create new Service"))?;
        debug!(kind = %K::KIND, name = cr.name(), provider_config = pc_name, address = %config.address(), "connecting");
        let db = self.factory.connect(&config).await.map_err(Error::upstream("cannot create new Service"))?;
        info!(kind = %K::KIND, name = cr.name(), user = %config.username, "connected");
        Ok(K::new_client(db, Arc::clone(&self.passwords)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cqlop_core::{EnvSelector, FsSelector, Keyspace, KeyspaceParameters, ObjectMeta, ProviderConfigSpec, Role, RoleParameters};
    use std::sync::Mutex;

    fn provider_config(name: &str, credentials: ProviderCredentials) -> ProviderConfig {
        ProviderConfig {
            api_version: "cassandra.crossplane.io/v1alpha1".into(),
            metadata: ObjectMeta { name: Some(name.into()), ..Default::default() },
            spec: ProviderConfigSpec { credentials },
        }
    }

    fn secret_credentials() -> ProviderCredentials {
        ProviderCredentials {
            source: CredentialsSource::Secret,
            secret_ref: Some(SecretKeySelector { namespace: "ops".into(), name: "cassandra".into(), key: "creds".into() }),
            env: None,
            fs: None,
        }
    }

    fn secrets(payload: &str) -> Arc<MemorySecrets> {
        let s = Arc::new(MemorySecrets::new());
        s.put("ops", "cassandra", BTreeMap::from([("creds".to_string(), payload.as_bytes().to_vec())]));
        s
    }

    fn connector(payload: &str) -> (Connector, MemoryCluster) {
        let cluster = MemoryCluster::new();
        let configs: StaticProviderConfigs = [provider_config("default", secret_credentials())].into_iter().collect();
        let extractor = CommonCredentialExtractor::new().with_secrets(secrets(payload));
        (Connector::new(Arc::new(configs), Arc::new(extractor), Arc::new(cluster.clone())), cluster)
    }

    const GOOD: &str = r#"{"username":"cassandra","password":"cassandra","endpoint":"127.0.0.1","port":"9042"}"#;

    #[tokio::test]
    async fn connects_with_secret_credentials() {
        let (c, cluster) = connector(GOOD);
        let ks: AnyManaged = Keyspace::with_external_name("ks", "ks", KeyspaceParameters::default()).into();
        let client = c.connect::<Keyspace>(&ks).await.unwrap();
        let obs = client.observe(&tokio_util::sync::CancellationToken::new(), narrow::<Keyspace>(&ks).unwrap()).await.unwrap();
        assert!(!obs.resource_exists);
        assert!(cluster.statements().is_empty());
    }

    #[tokio::test]
    async fn wrong_kind_is_rejected_before_anything_else() {
        struct CountingTracker(Mutex<usize>);
        #[async_trait::async_trait]
        impl UsageTracker for CountingTracker {
            async fn track(&self, _: ResourceKind, _: &str, _: &str) -> anyhow::Result<()> {
                *self.0.lock().unwrap() += 1;
                Ok(())
            }
        }
        let tracker = Arc::new(CountingTracker(Mutex::new(0)));
        let (c, _) = connector(GOOD);
        let c = c.with_usage_tracker(tracker.clone());
        let role: AnyManaged = Role::new("r", RoleParameters::default()).into();
        let err = c.connect::<Keyspace>(&role).await.err().unwrap();
        assert_eq!(err.to_string(), "managed resource is not a Keyspace custom resource");
        assert_eq!(*tracker.0.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn step_errors_carry_context() {
        let ks: AnyManaged = Keyspace::with_external_name("ks", "ks", KeyspaceParameters::default()).into();

        let (c, _) = connector("not json");
        let err = c.connect::<Keyspace>(&ks).await.err().unwrap();
        assert!(err.to_string().starts_with("failed to parse credentials JSON"));

        let (c, _) = connector(r#"{"username":"cassandra","password":"wrong","endpoint":"x"}"#);
        let err = c.connect::<Keyspace>(&ks).await.err().unwrap();
        assert!(err.to_string().starts_with("cannot create new Service"));

        let (c, _) = connector(r#"{"username":"cassandra","password":"cassandra"}"#);
        let err = c.connect::<Keyspace>(&ks).await.err().unwrap();
        assert!(err.to_string().contains("missing endpoint"));

        let mut other = ks.clone();
        if let AnyManaged::Keyspace(k) = &mut other {
            k.spec.resource.provider_config_ref = Some(cqlop_core::Reference { name: "prod".into() });
        }
        let (c, _) = connector(GOOD);
        let err = c.connect::<Keyspace>(&other).await.err().unwrap();
        assert_eq!(err.to_string(), "cannot get ProviderConfig: ProviderConfig \"prod\" not found");

        let configs: StaticProviderConfigs = [provider_config("default", secret_credentials())].into_iter().collect();
        let c = Connector::new(Arc::new(configs), Arc::new(CommonCredentialExtractor::new()), Arc::new(MemoryCluster::new()));
        let err = c.connect::<Keyspace>(&ks).await.err().unwrap();
        assert!(err.to_string().starts_with("cannot get credentials"));
    }

    #[tokio::test]
    async fn native_driver_dials_the_credential_endpoint() {
        let ks: AnyManaged = Keyspace::with_external_name("ks", "ks", KeyspaceParameters::default()).into();
        let configs: StaticProviderConfigs = [provider_config("default", secret_credentials())].into_iter().collect();
        let extractor = CommonCredentialExtractor::new()
            .with_secrets(secrets(r#"{"username":"cassandra","password":"cassandra","endpoint":"127.0.0.1","port":"1"}"#));
        let c = Connector::new(Arc::new(configs), Arc::new(extractor), Arc::new(NativeDriver::new()));
        let err = c.connect::<Keyspace>(&ks).await.err().unwrap();
        let msg = err.to_string();
        assert!(msg.starts_with("cannot create new Service"), "{}", msg);
        assert!(msg.contains("127.0.0.1:1"), "{}", msg);
    }

    #[tokio::test]
    async fn environment_and_filesystem_sources() {
        let ex = CommonCredentialExtractor::new();
        std::env::set_var("CQLOP_TEST_CREDS", GOOD);
        let env = ProviderCredentials {
            source: CredentialsSource::Environment,
            secret_ref: None,
            env: Some(EnvSelector { name: "CQLOP_TEST_CREDS".into() }),
            fs: None,
        };
        assert_eq!(ex.extract(&env).await.unwrap(), GOOD.as_bytes());

        let path = std::env::temp_dir().join(format!("cqlop-creds-{}.json", std::process::id()));
        std::fs::write(&path, GOOD).unwrap();
        let fs = ProviderCredentials {
            source: CredentialsSource::Filesystem,
            secret_ref: None,
            env: None,
            fs: Some(FsSelector { path: path.display().to_string() }),
        };
        assert_eq!(ex.extract(&fs).await.unwrap(), GOOD.as_bytes());
        std::fs::remove_file(&path).ok();

        let none = ProviderCredentials { source: CredentialsSource::None, secret_ref: None, env: None, fs: None };
        assert!(ex.extract(&none).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn publisher_merges_details() {
        let s = MemorySecrets::new();
        let target = SecretReference { namespace: "apps".into(), name: "app-creds".into() };
        let details = ConnectionDetails::from([("username".to_string(), b"app".to_vec())]);
        s.publish(&target, &details).await.unwrap();
        assert_eq!(s.get("apps", "app-creds").unwrap()["username"], b"app".to_vec());
        let sel = SecretKeySelector { namespace: "apps".into(), name: "app-creds".into(), key: "username".into() };
        assert_eq!(s.read(&sel).await.unwrap(), b"app".to_vec());
    }
}
