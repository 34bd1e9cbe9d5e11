//! Bootstrap configuration resolution
//!
//! The provisioning step leaves a ConfigMap in the cluster holding the
//! environment-specific values the manifests need. This module fetches that
//! record through any [`RecordSource`] and turns it into a [`BootstrapConfig`]
//! that is complete by construction.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use deckhand_common::yaml;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tracing::{debug, info};

use crate::{Error, Result};

/// Default name of the bootstrap ConfigMap
pub const DEFAULT_RECORD_NAME: &str = "deckhand-bootstrap";

/// A required key of the bootstrap record
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BootstrapKey {
    /// Public DNS domain of the environment
    Domain,
    /// Container registry login server
    RegistryEndpoint,
    /// Client id of the workload identity
    WorkloadIdentityClientId,
    /// Name of the secret store
    SecretStoreName,
    /// Directory tenant id
    TenantId,
    /// Storage account name
    StorageAccountName,
}

impl BootstrapKey {
    /// Every required key, in canonical order
    pub const ALL: [BootstrapKey; 6] = [
        BootstrapKey::Domain,
        BootstrapKey::RegistryEndpoint,
        BootstrapKey::WorkloadIdentityClientId,
        BootstrapKey::SecretStoreName,
        BootstrapKey::TenantId,
        BootstrapKey::StorageAccountName,
    ];

    /// Data key inside the ConfigMap
    pub fn key(self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::RegistryEndpoint => "registryEndpoint",
            Self::WorkloadIdentityClientId => "workloadIdentityClientId",
            Self::SecretStoreName => "secretStoreName",
            Self::TenantId => "tenantId",
            Self::StorageAccountName => "storageAccountName",
        }
    }

    /// Placeholder token this key replaces in manifest templates
    pub fn token(self) -> &'static str {
        match self {
            Self::Domain => "__DOMAIN__",
            Self::RegistryEndpoint => "__REGISTRY_ENDPOINT__",
            Self::WorkloadIdentityClientId => "__WORKLOAD_IDENTITY_CLIENT_ID__",
            Self::SecretStoreName => "__SECRET_STORE_NAME__",
            Self::TenantId => "__TENANT_ID__",
            Self::StorageAccountName => "__STORAGE_ACCOUNT_NAME__",
        }
    }
}

impl std::fmt::Display for BootstrapKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Resolved bootstrap values. Every [`BootstrapKey`] has a non-empty value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapConfig {
    values: BTreeMap<BootstrapKey, String>,
}

impl BootstrapConfig {
    /// Build from raw record data.
    ///
    /// Returns every missing key (absent or blank) in canonical order when
    /// the record is incomplete. Extra keys are ignored.
    pub fn from_record(data: &BTreeMap<String, String>) -> std::result::Result<Self, Vec<BootstrapKey>> {
        let mut values = BTreeMap::new();
        let mut missing = Vec::new();

        for key in BootstrapKey::ALL {
            match data.get(key.key()).map(|v| v.trim()) {
                Some(v) if !v.is_empty() => {
                    values.insert(key, v.to_string());
                }
                _ => missing.push(key),
            }
        }

        if missing.is_empty() {
            Ok(Self { values })
        } else {
            Err(missing)
        }
    }

    /// Value for a key
    pub fn get(&self, key: BootstrapKey) -> &str {
        self.values.get(&key).map(String::as_str).unwrap_or_default()
    }

    /// `(token, value)` pairs in canonical key order
    pub fn substitutions(&self) -> impl Iterator<Item = (&'static str, &str)> {
        BootstrapKey::ALL
            .into_iter()
            .map(move |key| (key.token(), self.get(key)))
    }
}

/// Where the bootstrap record lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordLocator {
    /// Namespace of the ConfigMap
    pub namespace: String,
    /// Name of the ConfigMap
    pub name: String,
}

impl RecordLocator {
    /// Create a locator
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for RecordLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Anything that can read the raw bootstrap record.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Fetch the record's data; `Ok(None)` when it does not exist.
    async fn fetch_record(&self, locator: &RecordLocator)
        -> Result<Option<BTreeMap<String, String>>>;
}

/// Reads bootstrap values from a local YAML map instead of the cluster.
///
/// Used by dry runs that must not contact the cluster at all.
#[derive(Clone, Debug)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    /// Source backed by the given file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RecordSource for FileSource {
    async fn fetch_record(
        &self,
        _locator: &RecordLocator,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value = yaml::parse_yaml(&yaml::normalize_line_endings(&content))?;
        // A full ConfigMap manifest is accepted as well as a bare map.
        let data = value.get("data").cloned().unwrap_or(value);
        Ok(Some(flatten_string_map(&data)))
    }
}

/// Keep the scalar entries of a JSON object as strings
pub(crate) fn flatten_string_map(value: &Value) -> BTreeMap<String, String> {
    let Some(map) = value.as_object() else {
        return BTreeMap::new();
    };
    map.iter()
        .filter_map(|(k, v)| {
            let s = match v {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((k.clone(), s))
        })
        .collect()
}

/// Fetch and validate the bootstrap record.
///
/// An absent record and a record with missing keys are reported as different
/// errors since they call for different fixes.
pub async fn resolve(source: &dyn RecordSource, locator: &RecordLocator) -> Result<BootstrapConfig> {
    debug!(record = %locator, "fetching bootstrap record");
    let Some(data) = source.fetch_record(locator).await? else {
        return Err(Error::RecordNotFound {
            namespace: locator.namespace.clone(),
            name: locator.name.clone(),
        });
    };

    let config = BootstrapConfig::from_record(&data).map_err(|missing| Error::MissingKeys {
        namespace: locator.namespace.clone(),
        name: locator.name.clone(),
        keys: missing.iter().map(|k| k.key().to_string()).collect(),
    })?;

    info!(record = %locator, keys = BootstrapKey::ALL.len(), "bootstrap configuration resolved");
    Ok(config)
}
