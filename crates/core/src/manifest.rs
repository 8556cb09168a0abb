//! Multi-document YAML manifest streams.

use serde::Deserialize;

use crate::{AnyManaged, Manifest, ProviderConfig};

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("document {index}: {source}")]
    Yaml {
        index: usize,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Documents of a stream split by what they configure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestSet {
    pub managed: Vec<AnyManaged>,
    pub provider_configs: Vec<ProviderConfig>,
}

impl ManifestSet {
    pub fn is_empty(&self) -> bool {
        self.managed.is_empty() && self.provider_configs.is_empty()
    }

    pub fn extend(&mut self, other: ManifestSet) {
        self.managed.extend(other.managed);
        self.provider_configs.extend(other.provider_configs);
    }
}

/// Parse a `---` separated stream. Empty documents are skipped.
pub fn parse_manifests(input: &str) -> Result<ManifestSet, ManifestError> {
    let mut set = ManifestSet::default();
    for (index, doc) in serde_yaml::Deserializer::from_str(input).enumerate() {
        let value = serde_yaml::Value::deserialize(doc).map_err(|source| ManifestError::Yaml { index, source })?;
        if value.is_null() {
            continue;
        }
        match serde_yaml::from_value::<Manifest>(value).map_err(|source| ManifestError::Yaml { index, source })? {
            Manifest::Keyspace(x) => set.managed.push(x.into()),
            Manifest::Role(x) => set.managed.push(x.into()),
            Manifest::Grant(x) => set.managed.push(x.into()),
            Manifest::ProviderConfig(pc) => set.provider_configs.push(pc),
        }
    }
    Ok(set)
}
