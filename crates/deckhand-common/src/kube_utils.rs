//! Kubernetes helpers built on kube-rs
//!
//! Covers what a delivery run needs from a directly reachable control plane:
//! building a client for an explicit kubeconfig/context, reading a ConfigMap,
//! and applying manifest documents with server-side apply. No kubectl binary
//! is involved on this path.

use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{Discovery, Scope};
use kube::{Client, Config};
use serde_json::Value;
use tracing::{debug, trace};

use crate::{Error, FIELD_MANAGER};

/// Build a client from an explicit kubeconfig path and/or context name.
///
/// With neither set the kube defaults apply (`KUBECONFIG`, then
/// `~/.kube/config`, then in-cluster config).
pub async fn create_client(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<Client, Error> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };

    let config = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).map_err(|e| {
                Error::unreachable(format!("failed to read kubeconfig {}: {}", path.display(), e))
            })?;
            Config::from_custom_kubeconfig(kc, &options)
                .await
                .map_err(|e| Error::unreachable(format!("invalid kubeconfig: {}", e)))?
        }
        None if context.is_some() => Config::from_kubeconfig(&options)
            .await
            .map_err(|e| Error::unreachable(format!("invalid kubeconfig: {}", e)))?,
        None => Config::infer()
            .await
            .map_err(|e| Error::unreachable(format!("no usable kubeconfig: {}", e)))?,
    };

    Ok(Client::try_from(config)?)
}

/// Identity of a manifest document
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DocumentRef {
    /// Full apiVersion (e.g. "apps/v1")
    pub api_version: String,
    /// Resource kind
    pub kind: String,
    /// metadata.name
    pub name: String,
    /// metadata.namespace, if the document names one
    pub namespace: Option<String>,
}

impl std::fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} ({})", self.kind, self.name, ns),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Extract apiVersion, kind, name and namespace from a document
pub fn document_ref(doc: &Value) -> Result<DocumentRef, Error> {
    let field = |pointer: &str| doc.pointer(pointer).and_then(Value::as_str);

    let api_version = field("/apiVersion")
        .ok_or_else(|| Error::internal_with_context("document_ref", "manifest missing apiVersion"))?;
    let kind = field("/kind")
        .ok_or_else(|| Error::internal_with_context("document_ref", "manifest missing kind"))?;
    let name = field("/metadata/name").ok_or_else(|| {
        Error::internal_with_context("document_ref", format!("{} missing metadata.name", kind))
    })?;

    Ok(DocumentRef {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        namespace: field("/metadata/namespace").map(str::to_string),
    })
}

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use deckhand_common::kube_utils::parse_api_version;
///
/// assert_eq!(parse_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Get priority for a Kubernetes resource kind (lower = apply first)
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" | "SecretProviderClass" => 5,
        "PersistentVolumeClaim" => 6,
        "Service" => 7,
        "Deployment" | "DaemonSet" | "StatefulSet" | "Job" | "CronJob" => 8,
        "Ingress" | "HorizontalPodAutoscaler" | "PodDisruptionBudget" => 9,
        _ => 10,
    }
}

/// Stable sort of documents into apply order.
///
/// Documents of equal priority keep their bundle order.
pub fn sort_for_apply(documents: &mut [Value]) {
    documents.sort_by_key(|doc| kind_priority(doc.get("kind").and_then(Value::as_str).unwrap_or("")));
}

/// Run API discovery once for a batch of applies
pub async fn run_discovery(client: &Client) -> Result<Discovery, Error> {
    Discovery::new(client.clone())
        .run()
        .await
        .map_err(|e| Error::unreachable(format!("api discovery failed: {}", e)))
}

/// Apply one document with server-side apply.
///
/// Namespaced kinds without `metadata.namespace` land in `default_namespace`.
/// Returns the reference of the object as applied.
pub async fn apply_document(
    client: &Client,
    discovery: &Discovery,
    doc: &Value,
    default_namespace: &str,
) -> Result<DocumentRef, Error> {
    let mut reference = document_ref(doc)?;
    let (group, version) = parse_api_version(&reference.api_version);
    let gvk = GroupVersionKind {
        group,
        version,
        kind: reference.kind.clone(),
    };

    let Some((api_resource, caps)) = discovery.resolve_gvk(&gvk) else {
        return Err(Error::delivery(format!(
            "unknown resource type {}/{}",
            reference.api_version, reference.kind
        )));
    };

    let api: Api<DynamicObject> = match caps.scope {
        Scope::Namespaced => {
            let ns = reference
                .namespace
                .get_or_insert_with(|| default_namespace.to_string())
                .clone();
            Api::namespaced_with(client.clone(), &ns, &api_resource)
        }
        Scope::Cluster => {
            reference.namespace = None;
            Api::all_with(client.clone(), &api_resource)
        }
    };

    api.patch(
        &reference.name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(doc),
    )
    .await
    .map_err(|e| Error::delivery(format!("failed to apply {}: {}", reference, e)))?;

    trace!(object = %reference, "applied manifest");
    Ok(reference)
}

/// Read a ConfigMap's string data.
///
/// Returns `Ok(None)` when the ConfigMap does not exist, so callers can tell
/// "absent" apart from "present but incomplete".
pub async fn get_config_map_data(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<Option<BTreeMap<String, String>>, Error> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    let Some(config_map) = api.get_opt(name).await? else {
        debug!(namespace = %namespace, name = %name, "config map not found");
        return Ok(None);
    };
    Ok(Some(config_map.data.unwrap_or_default()))
}
