//! Cluster context for the direct backend
//!
//! Which cluster a direct-mode call talks to is an explicit value, never
//! ambient session state. A [`ClusterContext`] names a kubeconfig and context;
//! connecting it yields a [`ClusterApi`] that is passed to every call, so tests
//! can hand in their own implementation next to a real one.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use deckhand_common::kube_utils::{self, DocumentRef};
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::info;

use crate::Result;

/// Operations the direct backend needs from a cluster control plane.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Read a ConfigMap's data; `Ok(None)` if it does not exist.
    async fn config_map(&self, namespace: &str, name: &str)
        -> Result<Option<BTreeMap<String, String>>>;

    /// Server-side apply one document. Namespaced objects without a
    /// namespace land in `default_namespace`.
    async fn apply_document(&self, doc: &Value, default_namespace: &str) -> Result<DocumentRef>;
}

/// Which kubeconfig and context to use for direct calls.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterContext {
    /// Explicit kubeconfig path; `None` uses the kube defaults
    pub kubeconfig: Option<PathBuf>,
    /// Context name inside the kubeconfig; `None` uses current-context
    pub context: Option<String>,
}

impl ClusterContext {
    /// Build a client for this context
    pub async fn connect(&self) -> Result<KubeCluster> {
        let client =
            kube_utils::create_client(self.kubeconfig.as_deref(), self.context.as_deref()).await?;
        info!(
            kubeconfig = ?self.kubeconfig,
            context = ?self.context,
            "connected to cluster"
        );
        Ok(KubeCluster::new(client))
    }
}

/// [`ClusterApi`] backed by a live kube-rs client
pub struct KubeCluster {
    client: kube::Client,
    discovery: OnceCell<kube::discovery::Discovery>,
}

impl KubeCluster {
    /// Wrap an existing client
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            discovery: OnceCell::new(),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        kube_utils::get_config_map_data(&self.client, namespace, name).await
    }

    async fn apply_document(&self, doc: &Value, default_namespace: &str) -> Result<DocumentRef> {
        let discovery = self
            .discovery
            .get_or_try_init(|| kube_utils::run_discovery(&self.client))
            .await?;
        kube_utils::apply_document(&self.client, discovery, doc, default_namespace).await
    }
}
