//! cqlop core types: managed keyspaces, roles and grants as declared by the
//! caller, their status, and the provider configuration they connect through.

#![forbid(unsafe_code)]

pub mod manifest;
pub mod provider;
pub mod resources;
pub mod status;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
pub use manifest::{parse_manifests, ManifestError, ManifestSet};
pub use provider::{
    CredentialsSource, EnvSelector, FsSelector, ProviderConfig, ProviderConfigSpec, ProviderCredentials,
    SecretKeySelector,
};
pub use resources::{
    AnyManaged, Grant, GrantObservation, GrantParameters, GrantPrivilege, GrantSpec, GrantStatus, Keyspace,
    KeyspaceObservation, KeyspaceParameters, KeyspaceSpec, KeyspaceStatus, Managed, Manifest, Role, RoleObservation,
    RoleParameters, RolePrivilege, RoleSpec, RoleStatus,
};
pub use status::{Condition, ConditionReason, ConditionStatus, ConditionType, ResourceStatus};

pub const API_GROUP: &str = "cql.cassandra.crossplane.io";
pub const API_VERSION: &str = "cql.cassandra.crossplane.io/v1alpha1";

/// Annotation holding the name the object is addressed by in the database.
pub const EXTERNAL_NAME_ANNOTATION: &str = "crossplane.io/external-name";

/// Provider config used when a resource names none.
pub const DEFAULT_PROVIDER_CONFIG: &str = "default";

/// Secret material produced for a managed resource, keyed like a Kubernetes secret.
pub type ConnectionDetails = BTreeMap<String, Vec<u8>>;

pub const CONNECTION_USERNAME_KEY: &str = "username";
pub const CONNECTION_PASSWORD_KEY: &str = "password";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Keyspace,
    Role,
    Grant,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [ResourceKind::Keyspace, ResourceKind::Role, ResourceKind::Grant];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Keyspace => "Keyspace",
            ResourceKind::Role => "Role",
            ResourceKind::Grant => "Grant",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown resource kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for ResourceKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// Reference to another object by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reference {
    pub name: String,
}

/// Where connection details of a resource should be written.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretReference {
    pub namespace: String,
    pub name: String,
}

/// What happens to the external object when the managed resource goes away.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeletionPolicy {
    #[default]
    Delete,
    Orphan,
}

/// Fields shared by every managed resource spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config_ref: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_connection_secret_to_ref: Option<SecretReference>,
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
}

impl ResourceSpec {
    pub fn provider_config_name(&self) -> &str {
        self.provider_config_ref
            .as_ref()
            .map(|r| r.name.as_str())
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_PROVIDER_CONFIG)
    }
}

pub mod prelude {
    pub use super::{
        AnyManaged, ConnectionDetails, Grant, Keyspace, Managed, ResourceKind, Role, EXTERNAL_NAME_ANNOTATION,
    };
}
