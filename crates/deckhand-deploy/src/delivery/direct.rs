use std::collections::BTreeMap;
use std::sync::Arc;

use deckhand_common::kube_utils::{document_ref, sort_for_apply};
use tracing::{info, warn};

use super::DeliveryResult;
use crate::bootstrap::RecordLocator;
use crate::context::ClusterApi;
use crate::render::ManifestBundle;
use crate::Result;

/// Applies documents over a live API connection with server-side apply.
pub struct DirectBackend {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
}

impl DirectBackend {
    /// Backend that applies into `namespace` through `cluster`
    pub fn new(cluster: Arc<dyn ClusterApi>, namespace: impl Into<String>) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
        }
    }

    pub(super) fn describe(&self) -> String {
        format!("direct (namespace {})", self.namespace)
    }

    /// Apply in kind-priority order, continuing past failed documents so
    /// one run reports every failure.
    pub(super) async fn apply(&self, bundle: &ManifestBundle) -> Result<DeliveryResult> {
        let mut documents = bundle.documents().to_vec();
        sort_for_apply(&mut documents);

        let mut lines = Vec::with_capacity(documents.len());
        let mut failures = Vec::new();

        for doc in &documents {
            match self.cluster.apply_document(doc, &self.namespace).await {
                Ok(reference) => lines.push(format!("{} applied", reference)),
                Err(e) => {
                    let label = document_ref(doc)
                        .map(|r| r.to_string())
                        .unwrap_or_else(|_| "<unnamed document>".to_string());
                    warn!(object = %label, error = %e, "failed to apply document");
                    lines.push(format!("{} failed: {}", label, e));
                    failures.push(label);
                }
            }
        }

        let raw_output = lines.join("\n");
        if failures.is_empty() {
            info!(documents = documents.len(), "bundle applied");
            Ok(DeliveryResult::success(raw_output))
        } else {
            Ok(DeliveryResult::failure(
                raw_output,
                format!(
                    "{} of {} documents failed to apply: {}",
                    failures.len(),
                    documents.len(),
                    failures.join(", ")
                ),
            ))
        }
    }

    pub(super) async fn fetch_record(
        &self,
        locator: &RecordLocator,
    ) -> Result<Option<BTreeMap<String, String>>> {
        self.cluster
            .config_map(&locator.namespace, &locator.name)
            .await
    }
}
