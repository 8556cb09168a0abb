//! Managed resource kinds: Keyspace, Role and Grant.
//!
//! Every desired attribute is optional; `None` means the caller expressed no
//! preference and the controller may late-initialize it from live state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::provider::ProviderConfig;
use crate::status::ResourceStatus;
use crate::{
    DeletionPolicy, ObjectMeta, Reference, ResourceKind, ResourceSpec, Time, API_VERSION, EXTERNAL_NAME_ANNOTATION,
};

fn api_version() -> String {
    API_VERSION.to_string()
}

// ---------------- Keyspace ----------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KeyspaceParameters {
    /// `SimpleStrategy` or `NetworkTopologyStrategy`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_factor: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable_writes: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyspaceObservation {}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyspaceSpec {
    #[serde(flatten)]
    pub resource: ResourceSpec,
    #[serde(default)]
    pub for_provider: KeyspaceParameters,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyspaceStatus {
    #[serde(flatten)]
    pub resource: ResourceStatus,
    #[serde(default)]
    pub at_provider: KeyspaceObservation,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Keyspace {
    #[serde(default = "api_version")]
    pub api_version: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: KeyspaceSpec,
    #[serde(default)]
    pub status: KeyspaceStatus,
}

// ---------------- Role ----------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RolePrivilege {
    #[serde(rename = "superUser", default, skip_serializing_if = "Option::is_none")]
    pub super_user: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleParameters {
    #[serde(default)]
    pub privileges: RolePrivilege,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleObservation {}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoleSpec {
    #[serde(flatten)]
    pub resource: ResourceSpec,
    #[serde(default)]
    pub for_provider: RoleParameters,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoleStatus {
    #[serde(flatten)]
    pub resource: ResourceStatus,
    #[serde(default)]
    pub at_provider: RoleObservation,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    #[serde(default = "api_version")]
    pub api_version: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: RoleSpec,
    #[serde(default)]
    pub status: RoleStatus,
}

// ---------------- Grant ----------------

/// A privilege token as declared in manifests. Multi-word CQL permissions use
/// `_` as the separator (`ALL_PERMISSIONS`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrantPrivilege {
    AllPermissions,
    Alter,
    Authorize,
    Create,
    Describe,
    Drop,
    Execute,
    Modify,
    Select,
}

impl GrantPrivilege {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantPrivilege::AllPermissions => "ALL_PERMISSIONS",
            GrantPrivilege::Alter => "ALTER",
            GrantPrivilege::Authorize => "AUTHORIZE",
            GrantPrivilege::Create => "CREATE",
            GrantPrivilege::Describe => "DESCRIBE",
            GrantPrivilege::Drop => "DROP",
            GrantPrivilege::Execute => "EXECUTE",
            GrantPrivilege::Modify => "MODIFY",
            GrantPrivilege::Select => "SELECT",
        }
    }
}

impl fmt::Display for GrantPrivilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GrantParameters {
    #[serde(default)]
    pub privileges: Vec<GrantPrivilege>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Role object whose external name fills `role` when it is unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_ref: Option<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyspace: Option<String>,
    /// Keyspace object whose external name fills `keyspace` when it is unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyspace_ref: Option<Reference>,
}

/// Privileges last applied by the controller, in database token form.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GrantObservation {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub privileges: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GrantSpec {
    #[serde(flatten)]
    pub resource: ResourceSpec,
    #[serde(default)]
    pub for_provider: GrantParameters,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GrantStatus {
    #[serde(flatten)]
    pub resource: ResourceStatus,
    #[serde(default)]
    pub at_provider: GrantObservation,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    #[serde(default = "api_version")]
    pub api_version: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: GrantSpec,
    #[serde(default)]
    pub status: GrantStatus,
}

// ---------------- Managed ----------------

/// A managed resource kind: desired parameters, observed status and the
/// metadata the controller needs to address the external object.
pub trait Managed: Clone + fmt::Debug + Send + Sync + 'static {
    type Parameters: Clone + Default + PartialEq + fmt::Debug + Send + Sync;
    type Observation: Clone + Default + PartialEq + fmt::Debug + Send + Sync;

    const KIND: ResourceKind;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;
    fn resource_spec(&self) -> &ResourceSpec;
    fn resource_status(&self) -> &ResourceStatus;
    fn resource_status_mut(&mut self) -> &mut ResourceStatus;
    fn for_provider(&self) -> &Self::Parameters;
    fn for_provider_mut(&mut self) -> &mut Self::Parameters;
    fn at_provider(&self) -> &Self::Observation;
    fn at_provider_mut(&mut self) -> &mut Self::Observation;

    /// Narrow a tagged resource to this kind.
    fn from_any(any: &AnyManaged) -> Option<&Self>;
    fn from_any_mut(any: &mut AnyManaged) -> Option<&mut Self>;
    fn into_any(self) -> AnyManaged;

    fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or("")
    }

    fn external_name(&self) -> Option<&str> {
        self.metadata()
            .annotations
            .as_ref()?
            .get(EXTERNAL_NAME_ANNOTATION)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    fn set_external_name(&mut self, name: &str) {
        self.metadata_mut()
            .annotations
            .get_or_insert_with(Default::default)
            .insert(EXTERNAL_NAME_ANNOTATION.to_string(), name.to_string());
    }

    fn is_deleting(&self) -> bool {
        self.metadata().deletion_timestamp.is_some()
    }

    fn deletion_policy(&self) -> DeletionPolicy {
        self.resource_spec().deletion_policy
    }
}

macro_rules! managed_kind {
    ($ty:ident, $spec:ident, $status:ident, $params:ty, $obs:ty) => {
        impl Managed for $ty {
            type Parameters = $params;
            type Observation = $obs;

            const KIND: ResourceKind = ResourceKind::$ty;

            fn metadata(&self) -> &ObjectMeta { &self.metadata }
            fn metadata_mut(&mut self) -> &mut ObjectMeta { &mut self.metadata }
            fn resource_spec(&self) -> &ResourceSpec { &self.spec.resource }
            fn resource_status(&self) -> &ResourceStatus { &self.status.resource }
            fn resource_status_mut(&mut self) -> &mut ResourceStatus { &mut self.status.resource }
            fn for_provider(&self) -> &$params { &self.spec.for_provider }
            fn for_provider_mut(&mut self) -> &mut $params { &mut self.spec.for_provider }
            fn at_provider(&self) -> &$obs { &self.status.at_provider }
            fn at_provider_mut(&mut self) -> &mut $obs { &mut self.status.at_provider }

            fn from_any(any: &AnyManaged) -> Option<&Self> {
                match any {
                    AnyManaged::$ty(x) => Some(x),
                    _ => None,
                }
            }

            fn from_any_mut(any: &mut AnyManaged) -> Option<&mut Self> {
                match any {
                    AnyManaged::$ty(x) => Some(x),
                    _ => None,
                }
            }

            fn into_any(self) -> AnyManaged { AnyManaged::$ty(self) }
        }

        impl $ty {
            pub fn new(name: &str, for_provider: $params) -> Self {
                Self {
                    api_version: api_version(),
                    metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
                    spec: $spec { resource: ResourceSpec::default(), for_provider },
                    status: $status::default(),
                }
            }

            /// Same as `new` with the external name annotation set.
            pub fn with_external_name(name: &str, external: &str, for_provider: $params) -> Self {
                let mut me = Self::new(name, for_provider);
                me.set_external_name(external);
                me
            }
        }

        impl From<$ty> for AnyManaged {
            fn from(v: $ty) -> Self { AnyManaged::$ty(v) }
        }
    };
}

managed_kind!(Keyspace, KeyspaceSpec, KeyspaceStatus, KeyspaceParameters, KeyspaceObservation);
managed_kind!(Role, RoleSpec, RoleStatus, RoleParameters, RoleObservation);
managed_kind!(Grant, GrantSpec, GrantStatus, GrantParameters, GrantObservation);

/// Any managed resource, tagged by `kind` as in a manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum AnyManaged {
    Keyspace(Keyspace),
    Role(Role),
    Grant(Grant),
}

macro_rules! each {
    ($self:expr, $x:ident => $body:expr) => {
        match $self {
            AnyManaged::Keyspace($x) => $body,
            AnyManaged::Role($x) => $body,
            AnyManaged::Grant($x) => $body,
        }
    };
}

impl AnyManaged {
    pub fn kind(&self) -> ResourceKind {
        match self {
            AnyManaged::Keyspace(_) => ResourceKind::Keyspace,
            AnyManaged::Role(_) => ResourceKind::Role,
            AnyManaged::Grant(_) => ResourceKind::Grant,
        }
    }

    pub fn name(&self) -> &str { each!(self, x => x.name()) }
    pub fn external_name(&self) -> Option<&str> { each!(self, x => x.external_name()) }
    pub fn set_external_name(&mut self, name: &str) { each!(self, x => x.set_external_name(name)) }
    pub fn metadata(&self) -> &ObjectMeta { each!(self, x => x.metadata()) }
    pub fn resource_spec(&self) -> &ResourceSpec { each!(self, x => x.resource_spec()) }
    pub fn resource_status(&self) -> &ResourceStatus { each!(self, x => x.resource_status()) }
    pub fn resource_status_mut(&mut self) -> &mut ResourceStatus { each!(self, x => x.resource_status_mut()) }
    pub fn is_deleting(&self) -> bool { each!(self, x => x.is_deleting()) }

    /// Flag the resource for deletion as an API server would.
    pub fn mark_deleting(&mut self) {
        let meta = each!(self, x => x.metadata_mut());
        if meta.deletion_timestamp.is_none() {
            meta.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
    }

    /// Identity used to serialize reconciliation of one object.
    pub fn key(&self) -> (ResourceKind, String) {
        (self.kind(), self.name().to_string())
    }
}

/// One document of a manifest stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum Manifest {
    Keyspace(Keyspace),
    Role(Role),
    Grant(Grant),
    ProviderConfig(ProviderConfig),
}

impl From<AnyManaged> for Manifest {
    fn from(v: AnyManaged) -> Self {
        match v {
            AnyManaged::Keyspace(x) => Manifest::Keyspace(x),
            AnyManaged::Role(x) => Manifest::Role(x),
            AnyManaged::Grant(x) => Manifest::Grant(x),
        }
    }
}
