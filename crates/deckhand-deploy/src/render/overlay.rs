//! Layered overlay build
//!
//! Supports the subset of `kustomization.yaml` deckhand overlays use:
//! `resources`, strategic-merge `patches`, `images` and `namespace`. The
//! build reads only local files and is a pure function of their contents.

use std::path::{Path, PathBuf};

use deckhand_common::yaml::{self, normalize_line_endings};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::version::KUSTOMIZATION_FILE;
use crate::{Error, Result};

/// Kinds that never carry a namespace
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "PersistentVolume",
    "StorageClass",
    "PriorityClass",
    "IngressClass",
    "ClusterIssuer",
    "ClusterSecretStore",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
];

/// Keys whose list elements are merged by their `name` field
const MERGE_BY_NAME: &str = "name";

#[derive(Debug, Default, Deserialize)]
struct Kustomization {
    #[serde(default)]
    resources: Vec<String>,
    #[serde(default)]
    patches: Vec<PatchRef>,
    #[serde(default)]
    images: Vec<ImageOverride>,
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PatchRef {
    Path { path: String },
    Bare(String),
}

impl PatchRef {
    fn path(&self) -> &str {
        match self {
            Self::Path { path } | Self::Bare(path) => path,
        }
    }
}

/// One `images:` entry
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageOverride {
    /// Repository to match
    pub name: String,
    /// Replacement repository
    #[serde(default)]
    pub new_name: Option<String>,
    /// Replacement tag, as written
    #[serde(default)]
    pub new_tag: Option<String>,
    /// Replacement digest; wins over the tag
    #[serde(default)]
    pub digest: Option<String>,
}

/// Build the overlay rooted at `dir` into an ordered document list.
pub fn build(dir: &Path) -> Result<Vec<Value>> {
    let mut stack = Vec::new();
    build_dir(dir, &mut stack)
}

fn build_dir(dir: &Path, stack: &mut Vec<PathBuf>) -> Result<Vec<Value>> {
    let canonical = dir
        .canonicalize()
        .map_err(|e| Error::layering(dir.display().to_string(), format!("cannot open: {}", e)))?;
    if stack.contains(&canonical) {
        return Err(Error::layering(
            dir.display().to_string(),
            "resource cycle between overlays",
        ));
    }
    stack.push(canonical);

    let file = dir.join(KUSTOMIZATION_FILE);
    let kustomization = load_kustomization(&file)?;
    debug!(
        overlay = %dir.display(),
        resources = kustomization.resources.len(),
        patches = kustomization.patches.len(),
        images = kustomization.images.len(),
        "building overlay"
    );

    let mut documents = Vec::new();
    for resource in &kustomization.resources {
        let path = dir.join(resource);
        if path.is_dir() {
            documents.extend(build_dir(&path, stack)?);
        } else {
            documents.extend(read_documents(&path)?);
        }
    }

    for patch in &kustomization.patches {
        let path = dir.join(patch.path());
        for patch_doc in read_documents(&path)? {
            apply_patch(&mut documents, &patch_doc)
                .map_err(|msg| Error::layering(path.display().to_string(), msg))?;
        }
    }

    if let Some(namespace) = &kustomization.namespace {
        for doc in &mut documents {
            set_namespace(doc, namespace);
        }
    }

    for doc in &mut documents {
        rewrite_images(doc, &kustomization.images);
    }

    stack.pop();
    Ok(documents)
}

fn load_kustomization(file: &Path) -> Result<Kustomization> {
    let label = file.display().to_string();
    let content = std::fs::read_to_string(file)
        .map_err(|e| Error::layering(&label, format!("cannot read: {}", e)))?;
    let content = normalize_line_endings(&content);
    let value = yaml::parse_yaml(&content).map_err(|e| Error::layering(&label, e.to_string()))?;
    if value.is_null() {
        return Ok(Kustomization::default());
    }
    yaml::from_yaml_str(&content).map_err(|e| Error::layering(&label, e.to_string()))
}

fn read_documents(path: &Path) -> Result<Vec<Value>> {
    let label = path.display().to_string();
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::layering(&label, format!("cannot read: {}", e)))?;
    let documents = yaml::parse_documents(&normalize_line_endings(&content))
        .map_err(|e| Error::layering(&label, e.to_string()))?;
    if let Some(bad) = documents.iter().find(|d| !d.is_object()) {
        return Err(Error::layering(
            &label,
            format!("document is not a mapping: {}", bad),
        ));
    }
    trace!(file = %label, documents = documents.len(), "read resource file");
    Ok(documents)
}

fn identity(doc: &Value) -> (Option<&str>, Option<&str>) {
    (
        doc.get("kind").and_then(Value::as_str),
        doc.pointer("/metadata/name").and_then(Value::as_str),
    )
}

fn apply_patch(documents: &mut [Value], patch: &Value) -> std::result::Result<(), String> {
    let (kind, name) = identity(patch);
    let (Some(kind), Some(name)) = (kind, name) else {
        return Err("patch must set kind and metadata.name".to_string());
    };

    let mut matched = false;
    for doc in documents.iter_mut() {
        if identity(doc) == (Some(kind), Some(name)) {
            merge(doc, patch);
            matched = true;
        }
    }

    if matched {
        Ok(())
    } else {
        Err(format!("patch target {}/{} not found in resources", kind, name))
    }
}

/// Strategic merge of `patch` into `target`.
///
/// Maps merge recursively and `null` deletes. Lists whose elements are all
/// maps with a `name` merge element-wise by name; other lists replace.
pub fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => merge_maps(target, patch),
        (Value::Array(target), Value::Array(patch)) => {
            if is_named_list(target) && is_named_list(patch) {
                merge_named_lists(target, patch)
            } else {
                *target = patch.clone()
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

fn merge_maps(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        if value.is_null() {
            target.remove(key);
            continue;
        }
        match target.get_mut(key) {
            Some(existing) => merge(existing, value),
            None => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

fn is_named_list(items: &[Value]) -> bool {
    !items.is_empty()
        && items
            .iter()
            .all(|item| item.get(MERGE_BY_NAME).and_then(Value::as_str).is_some())
}

fn merge_named_lists(target: &mut Vec<Value>, patch: &[Value]) {
    for item in patch {
        let name = item.get(MERGE_BY_NAME).and_then(Value::as_str);
        match target
            .iter_mut()
            .find(|existing| existing.get(MERGE_BY_NAME).and_then(Value::as_str) == name)
        {
            Some(existing) => merge(existing, item),
            None => target.push(item.clone()),
        }
    }
}

fn set_namespace(doc: &mut Value, namespace: &str) {
    let kind = doc.get("kind").and_then(Value::as_str).unwrap_or_default();
    if CLUSTER_SCOPED_KINDS.contains(&kind) {
        return;
    }
    if let Some(metadata) = doc.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.insert("namespace".to_string(), Value::String(namespace.to_string()));
    }
}

/// Split an image reference into (repository, suffix) where the suffix is
/// `:tag`, `@digest` or empty.
pub fn split_image(image: &str) -> (&str, &str) {
    if let Some(at) = image.find('@') {
        return image.split_at(at);
    }
    match image.rfind(':') {
        Some(colon) if colon > image.rfind('/').unwrap_or(0) => image.split_at(colon),
        _ => (image, ""),
    }
}

fn rewrite_images(value: &mut Value, overrides: &[ImageOverride]) {
    if overrides.is_empty() {
        return;
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if key == "containers" || key == "initContainers" {
                    if let Some(containers) = child.as_array_mut() {
                        for container in containers {
                            rewrite_container(container, overrides);
                        }
                    }
                } else {
                    rewrite_images(child, overrides);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_images(item, overrides);
            }
        }
        _ => {}
    }
}

fn rewrite_container(container: &mut Value, overrides: &[ImageOverride]) {
    let Some(image) = container.get("image").and_then(Value::as_str) else {
        return;
    };
    let (repository, suffix) = split_image(image);
    let Some(rule) = overrides.iter().find(|o| o.name == repository) else {
        return;
    };

    let repository = rule.new_name.as_deref().unwrap_or(repository);
    let rewritten = match (&rule.digest, &rule.new_tag) {
        (Some(digest), _) => format!("{}@{}", repository, digest),
        (None, Some(tag)) => format!("{}:{}", repository, tag),
        (None, None) => format!("{}{}", repository, suffix),
    };
    trace!(from = %image, to = %rewritten, "rewriting image");
    container["image"] = Value::String(rewritten);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn write(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    const DEPLOYMENT: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: svc-a
spec:
  replicas: 1
  template:
    spec:
      containers:
        - name: app
          image: __REGISTRY_ENDPOINT__/svc-a:latest
          env:
            - name: MODE
              value: base
        - name: sidecar
          image: busybox:1.36
"#;

    fn base_and_overlay() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        write(root.path(), "base/deployment.yaml", DEPLOYMENT);
        write(
            root.path(),
            "base/kustomization.yaml",
            "resources:\n  - deployment.yaml\n",
        );
        write(
            root.path(),
            "overlays/prod/patch.yaml",
            r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: svc-a
spec:
  replicas: 3
  template:
    spec:
      containers:
        - name: app
          env:
            - name: MODE
              value: prod
            - name: EXTRA
              value: "1"
"#,
        );
        write(
            root.path(),
            "overlays/prod/kustomization.yaml",
            r#"namespace: shop
resources:
  - ../../base
patches:
  - path: patch.yaml
images:
  - name: __REGISTRY_ENDPOINT__/svc-a
    newTag: v1.0.0
"#,
        );
        root
    }

    #[test]
    fn builds_base_with_patch_namespace_and_images() {
        let root = base_and_overlay();
        let docs = build(&root.path().join("overlays/prod")).unwrap();
        assert_eq!(docs.len(), 1);

        let d = &docs[0];
        assert_eq!(d["metadata"]["namespace"], "shop");
        assert_eq!(d["spec"]["replicas"], 3);

        let containers = d["spec"]["template"]["spec"]["containers"].as_array().unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0]["image"], "__REGISTRY_ENDPOINT__/svc-a:v1.0.0");
        assert_eq!(containers[1]["image"], "busybox:1.36");

        let env = containers[0]["env"].as_array().unwrap();
        assert_eq!(env.len(), 2);
        assert_eq!(env[0]["value"], "prod");
        assert_eq!(env[1]["name"], "EXTRA");
    }

    #[test]
    fn unquoted_numeric_tags_are_kept_verbatim() {
        let root = tempfile::tempdir().unwrap();
        write(
            root.path(),
            "app.yaml",
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: app\nspec:\n  template:\n    spec:\n      containers:\n        - name: a\n          image: reg/svc-a:old\n        - name: b\n          image: reg/svc-b:old\n",
        );
        write(
            root.path(),
            "kustomization.yaml",
            "resources: [app.yaml]\nimages:\n  - name: reg/svc-a\n    newTag: 1.10\n  - name: reg/svc-b\n    newTag: 010\n",
        );

        let docs = build(root.path()).unwrap();
        let containers = &docs[0]["spec"]["template"]["spec"]["containers"];
        assert_eq!(containers[0]["image"], "reg/svc-a:1.10");
        assert_eq!(containers[1]["image"], "reg/svc-b:010");
    }

    #[test]
    fn crlf_overlay_builds_like_lf() {
        let root = base_and_overlay();
        let lf = build(&root.path().join("overlays/prod")).unwrap();

        let kfile = root.path().join("overlays/prod/kustomization.yaml");
        let crlf = fs::read_to_string(&kfile).unwrap().replace('\n', "\r\n");
        fs::write(&kfile, crlf).unwrap();

        assert_eq!(build(&root.path().join("overlays/prod")).unwrap(), lf);
    }

    #[test]
    fn patch_without_target_is_layering_error() {
        let root = tempfile::tempdir().unwrap();
        write(root.path(), "cm.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n");
        write(
            root.path(),
            "patch.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\ndata:\n  x: y\n",
        );
        write(
            root.path(),
            "kustomization.yaml",
            "resources: [cm.yaml]\npatches: [patch.yaml]\n",
        );
        let err = build(root.path()).unwrap_err();
        assert!(matches!(err, Error::Layering { .. }));
        assert!(err.to_string().contains("ConfigMap/b"));
    }

    #[test]
    fn missing_resource_is_layering_error() {
        let root = tempfile::tempdir().unwrap();
        write(root.path(), "kustomization.yaml", "resources: [absent.yaml]\n");
        assert!(matches!(build(root.path()), Err(Error::Layering { .. })));
    }

    #[test]
    fn resource_cycle_is_detected() {
        let root = tempfile::tempdir().unwrap();
        write(root.path(), "a/kustomization.yaml", "resources: [../b]\n");
        write(root.path(), "b/kustomization.yaml", "resources: [../a]\n");
        let err = build(&root.path().join("a")).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn namespace_skips_cluster_scoped_kinds() {
        let mut ns = json!({"kind": "Namespace", "metadata": {"name": "shop"}});
        set_namespace(&mut ns, "other");
        assert!(ns["metadata"].get("namespace").is_none());

        let mut svc = json!({"kind": "Service", "metadata": {"name": "web"}});
        set_namespace(&mut svc, "shop");
        assert_eq!(svc["metadata"]["namespace"], "shop");
    }

    #[test]
    fn merge_null_deletes_and_scalar_lists_replace() {
        let mut target = json!({"a": 1, "b": {"c": 2, "d": 3}, "args": ["x", "y"]});
        merge(&mut target, &json!({"b": {"d": null}, "args": ["z"]}));
        assert_eq!(target, json!({"a": 1, "b": {"c": 2}, "args": ["z"]}));
    }

    #[test]
    fn split_image_handles_ports_and_digests() {
        assert_eq!(split_image("reg:5000/app:v1"), ("reg:5000/app", ":v1"));
        assert_eq!(split_image("reg:5000/app"), ("reg:5000/app", ""));
        assert_eq!(split_image("app@sha256:abc"), ("app", "@sha256:abc"));
        assert_eq!(split_image("nginx"), ("nginx", ""));
    }

    #[test]
    fn image_digest_wins_over_tag() {
        let mut doc = json!({"spec": {"initContainers": [{"name": "i", "image": "app:old"}]}});
        rewrite_images(
            &mut doc,
            &[ImageOverride {
                name: "app".to_string(),
                new_name: Some("mirror/app".to_string()),
                new_tag: Some("v2".to_string()),
                digest: Some("sha256:abc".to_string()),
            }],
        );
        assert_eq!(doc["spec"]["initContainers"][0]["image"], "mirror/app@sha256:abc");
    }
}
