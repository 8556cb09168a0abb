#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use cqlop_controller::connector::{CommonCredentialExtractor, MemorySecrets, StaticProviderConfigs};
use cqlop_controller::{Connector, PasswordGenerator, Reconciler};
use cqlop_core::{CredentialsSource, ObjectMeta, ProviderConfig, ProviderConfigSpec, ProviderCredentials, SecretKeySelector};
use cqlop_db::MemoryCluster;

pub const ADMIN_CREDS: &str = r#"{"username":"cassandra","password":"cassandra","endpoint":"127.0.0.1","port":"9042"}"#;

pub struct Harness {
    pub cluster: MemoryCluster,
    pub secrets: Arc<MemorySecrets>,
    pub connector: Connector,
}

impl Harness {
    pub fn new() -> Self {
        let cluster = MemoryCluster::new();
        let secrets = Arc::new(MemorySecrets::new());
        secrets.put("crossplane-system", "cassandra-creds", BTreeMap::from([("credentials".to_string(), ADMIN_CREDS.as_bytes().to_vec())]));
        let pc = ProviderConfig {
            api_version: "cassandra.crossplane.io/v1alpha1".into(),
            metadata: ObjectMeta { name: Some("default".into()), ..Default::default() },
            spec: ProviderConfigSpec {
                credentials: ProviderCredentials {
                    source: CredentialsSource::Secret,
                    secret_ref: Some(SecretKeySelector {
                        namespace: "crossplane-system".into(),
                        name: "cassandra-creds".into(),
                        key: "credentials".into(),
                    }),
                    env: None,
                    fs: None,
                },
            },
        };
        let configs: StaticProviderConfigs = [pc].into_iter().collect();
        let extractor = CommonCredentialExtractor::new().with_secrets(secrets.clone());
        let connector = Connector::new(Arc::new(configs), Arc::new(extractor), Arc::new(cluster.clone()));
        Self { cluster, secrets, connector }
    }

    pub fn with_passwords(mut self, passwords: Arc<dyn PasswordGenerator>) -> Self {
        self.connector = self.connector.with_password_generator(passwords);
        self
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.connector.clone()).with_publisher(self.secrets.clone())
    }
}
