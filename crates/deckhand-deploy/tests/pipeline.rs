//! Integration tests for the deployment path
//!
//! Each test walks a release through version check, bootstrap resolution,
//! rendering and delivery the way the `deploy` command does, with in-memory
//! stand-ins for the cluster and the remote command channel.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use deckhand_common::kube_utils::{document_ref, DocumentRef};
use serde_json::Value;

use deckhand_deploy::bootstrap::{self, BootstrapKey, RecordLocator};
use deckhand_deploy::delivery::SUCCESS_MARKER;
use deckhand_deploy::render;
use deckhand_deploy::version::{self, ExclusionPolicy, ValidationStatus};
use deckhand_deploy::{
    ClusterApi, CommandOutput, CommandRunner, DirectBackend, Error, ExecutionBackend,
    ProxiedBackend, ProxiedConfig, Result,
};

// =============================================================================
// Test Fixtures
// =============================================================================

/// Cluster stand-in: a ConfigMap store plus an object store keyed by identity
#[derive(Default)]
struct InMemoryCluster {
    config_maps: BTreeMap<(String, String), BTreeMap<String, String>>,
    objects: Mutex<BTreeMap<String, Value>>,
    apply_calls: Mutex<usize>,
}

impl InMemoryCluster {
    fn with_bootstrap(data: BTreeMap<String, String>) -> Self {
        let mut cluster = Self::default();
        cluster.config_maps.insert(
            ("default".to_string(), "deckhand-bootstrap".to_string()),
            data,
        );
        cluster
    }

    fn snapshot(&self) -> BTreeMap<String, Value> {
        self.objects.lock().unwrap().clone()
    }

    fn apply_calls(&self) -> usize {
        *self.apply_calls.lock().unwrap()
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn apply_document(&self, doc: &Value, default_namespace: &str) -> Result<DocumentRef> {
        *self.apply_calls.lock().unwrap() += 1;
        let mut reference = document_ref(doc)?;
        reference
            .namespace
            .get_or_insert_with(|| default_namespace.to_string());
        self.objects
            .lock()
            .unwrap()
            .insert(reference.to_string(), doc.clone());
        Ok(reference)
    }
}

/// Remote channel stand-in returning a fixed apply response
struct CannedChannel {
    apply_response: String,
}

#[async_trait]
impl CommandRunner for CannedChannel {
    async fn run(&self, _program: &str, args: &[String]) -> Result<CommandOutput> {
        if args.iter().any(|a| a.contains("/readyz")) {
            return Ok(CommandOutput::ok("exitcode=0\nok"));
        }
        Ok(CommandOutput::ok(self.apply_response.clone()))
    }
}

fn bootstrap_data() -> BTreeMap<String, String> {
    BootstrapKey::ALL
        .iter()
        .map(|k| (k.key().to_string(), format!("{}-value", k.key())))
        .collect()
}

fn write(root: &Path, name: &str, content: &str) {
    let path = root.join(name);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// A repository with a base, a production overlay and a versions file
fn release_repo(overlay_tag: &str) -> tempfile::TempDir {
    let root = tempfile::tempdir().unwrap();
    write(root.path(), "versions.txt", "# release\nsvc-a:v1.0.0\n");
    write(
        root.path(),
        "deploy/base/svc-a.yaml",
        r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: svc-a
spec:
  template:
    spec:
      containers:
        - name: app
          image: __REGISTRY_ENDPOINT__/svc-a:latest
          env:
            - name: TENANT
              value: __TENANT_ID__
---
apiVersion: v1
kind: Service
metadata:
  name: svc-a
spec:
  ports:
    - name: http
      port: 80
"#,
    );
    write(
        root.path(),
        "deploy/base/kustomization.yaml",
        "resources:\n  - svc-a.yaml\n",
    );
    write(
        root.path(),
        "deploy/overlays/production/kustomization.yaml",
        &format!(
            "namespace: shop\r\nresources:\r\n  - ../../base\r\nimages:\r\n  - name: __REGISTRY_ENDPOINT__/svc-a\r\n    newTag: {}\r\n",
            overlay_tag
        ),
    );
    root
}

fn locator() -> RecordLocator {
    RecordLocator::new("default", "deckhand-bootstrap")
}

// =============================================================================
// Deployment path
// =============================================================================

/// A consistent release renders and lands every object in the cluster.
#[tokio::test]
async fn consistent_release_is_delivered() {
    let repo = release_repo("v1.0.0");
    let overlay = repo.path().join("deploy/overlays/production");

    let report = version::check(
        &repo.path().join("versions.txt"),
        &overlay,
        &ExclusionPolicy::default(),
        false,
    )
    .unwrap();
    assert_eq!(report.status, ValidationStatus::Pass);

    let cluster = Arc::new(InMemoryCluster::with_bootstrap(bootstrap_data()));
    let backend = ExecutionBackend::Direct(DirectBackend::new(cluster.clone(), "default"));

    let config = bootstrap::resolve(&backend, &locator()).await.unwrap();
    let bundle = render::render(&overlay, &config).unwrap();
    let result = backend.apply(&bundle).await.unwrap();

    assert!(result.applied);
    let objects = cluster.snapshot();
    let deployment = &objects["Deployment/svc-a (shop)"];
    let container = &deployment["spec"]["template"]["spec"]["containers"][0];
    assert_eq!(container["image"], "registryEndpoint-value/svc-a:v1.0.0");
    assert_eq!(container["env"][0]["value"], "tenantId-value");
    assert!(objects.contains_key("Service/svc-a (shop)"));
}

/// Re-running the same bundle leaves the same state and reports success again.
#[tokio::test]
async fn redelivery_is_idempotent() {
    let repo = release_repo("v1.0.0");
    let overlay = repo.path().join("deploy/overlays/production");
    let cluster = Arc::new(InMemoryCluster::with_bootstrap(bootstrap_data()));
    let backend = ExecutionBackend::Direct(DirectBackend::new(cluster.clone(), "default"));

    let config = bootstrap::resolve(&backend, &locator()).await.unwrap();
    let bundle = render::render(&overlay, &config).unwrap();

    let first = backend.apply(&bundle).await.unwrap();
    let after_first = cluster.snapshot();
    let second = backend.apply(&bundle).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(after_first, cluster.snapshot());
}

/// A stale overlay tag stops the run before the cluster is touched.
#[tokio::test]
async fn tag_mismatch_blocks_before_network() {
    let repo = release_repo("v0.9.0");
    let report = version::check(
        &repo.path().join("versions.txt"),
        &repo.path().join("deploy/overlays/production"),
        &ExclusionPolicy::default(),
        false,
    )
    .unwrap();

    assert_eq!(report.status, ValidationStatus::Fail);
    assert_eq!(report.mismatches[0].expected, "v1.0.0");
    assert_eq!(report.mismatches[0].declared, "v0.9.0");
    let err = report.ensure_passed().unwrap_err();
    assert!(err.is_local());
}

/// A record without tenantId fails resolution and nothing is rendered or applied.
#[tokio::test]
async fn missing_bootstrap_key_stops_before_render() {
    let mut data = bootstrap_data();
    data.remove("tenantId");
    let cluster = Arc::new(InMemoryCluster::with_bootstrap(data));
    let backend = ExecutionBackend::Direct(DirectBackend::new(cluster.clone(), "default"));

    match bootstrap::resolve(&backend, &locator()).await {
        Err(Error::MissingKeys { keys, .. }) => assert_eq!(keys, vec!["tenantId"]),
        other => panic!("expected MissingKeys, got {:?}", other),
    }
    assert_eq!(cluster.apply_calls(), 0);
}

/// Without the success marker the proxied apply is a failure, even with
/// partial "configured" lines in the output.
#[tokio::test]
async fn proxied_response_without_marker_is_failure() {
    let repo = release_repo("v1.0.0");
    let config = bootstrap::BootstrapConfig::from_record(&bootstrap_data()).unwrap();
    let bundle = render::render(&repo.path().join("deploy/overlays/production"), &config).unwrap();

    let channel = Arc::new(CannedChannel {
        apply_response: "deployment.apps/svc-a configured\nservice/svc-a conf".to_string(),
    });
    let backend = ExecutionBackend::Proxied(ProxiedBackend::new(
        channel,
        ProxiedConfig::new("rg", "aks-prod", "shop"),
    ));

    let result = backend.apply(&bundle).await.unwrap();
    assert!(!result.applied);
    assert!(result
        .failure_reason
        .unwrap()
        .contains("possibly truncated"));
}

#[tokio::test]
async fn proxied_response_with_marker_is_success() {
    let repo = release_repo("v1.0.0");
    let config = bootstrap::BootstrapConfig::from_record(&bootstrap_data()).unwrap();
    let bundle = render::render(&repo.path().join("deploy/overlays/production"), &config).unwrap();

    let channel = Arc::new(CannedChannel {
        apply_response: format!("service/svc-a unchanged\n{}\n", SUCCESS_MARKER),
    });
    let backend = ExecutionBackend::Proxied(ProxiedBackend::new(
        channel,
        ProxiedConfig::new("rg", "aks-prod", "shop"),
    ));

    assert!(backend.apply(&bundle).await.unwrap().applied);
}
