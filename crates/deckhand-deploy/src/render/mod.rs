//! Manifest rendering
//!
//! Builds the layered overlay into one YAML stream, then substitutes the
//! bootstrap values for placeholder tokens. Rendering either yields a fully
//! resolved [`ManifestBundle`] or fails without producing anything.

pub mod overlay;
pub mod tokens;

use std::collections::BTreeMap;
use std::path::Path;

use deckhand_common::yaml;
use serde_json::Value;
use tracing::info;

use crate::bootstrap::BootstrapConfig;
use crate::Result;

/// Fully resolved deployment documents, ready to apply.
#[derive(Clone, Debug, PartialEq)]
pub struct ManifestBundle {
    text: String,
    documents: Vec<Value>,
}

impl ManifestBundle {
    /// Wrap an already substituted YAML stream.
    ///
    /// Fails if the text does not parse.
    pub fn from_text(text: String) -> Result<Self> {
        let documents = yaml::parse_documents(&text)?;
        Ok(Self { text, documents })
    }

    /// The bundle as one `---`-separated YAML stream
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Parsed documents, in bundle order
    pub fn documents(&self) -> &[Value] {
        &self.documents
    }

    /// Number of documents
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Whether the bundle has no documents
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Document count per kind
    pub fn kind_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for doc in &self.documents {
            let kind = doc.get("kind").and_then(Value::as_str).unwrap_or("<none>");
            *counts.entry(kind.to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// One-line summary like `3 documents (Deployment=2, Service=1)`
    pub fn summary(&self) -> String {
        let kinds: Vec<String> = self
            .kind_counts()
            .into_iter()
            .map(|(kind, n)| format!("{}={}", kind, n))
            .collect();
        format!("{} documents ({})", self.len(), kinds.join(", "))
    }
}

/// Build the overlay at `overlay_dir` into an unsubstituted YAML stream.
///
/// Pure: the same input files always produce byte-identical output.
pub fn build(overlay_dir: &Path) -> Result<String> {
    let documents = overlay::build(overlay_dir)?;
    Ok(yaml::to_yaml_stream(&documents)?)
}

/// Build and resolve the bundle for `overlay_dir` with `config`.
pub fn render(overlay_dir: &Path, config: &BootstrapConfig) -> Result<ManifestBundle> {
    let built = build(overlay_dir)?;
    tokens::ensure_known(&built)?;
    let bundle = ManifestBundle::from_text(tokens::substitute(&built, config))?;
    info!(overlay = %overlay_dir.display(), bundle = %bundle.summary(), "rendered manifest bundle");
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::BootstrapKey;
    use crate::Error;
    use std::fs;

    fn config() -> BootstrapConfig {
        let data = BootstrapKey::ALL
            .iter()
            .map(|k| (k.key().to_string(), format!("{}-v", k.key().to_lowercase())))
            .collect();
        BootstrapConfig::from_record(&data).unwrap()
    }

    fn overlay(extra: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("app.yaml"),
            format!(
                r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: app
data:
  host: app.__DOMAIN__
  tenant: __TENANT_ID__
{extra}---
apiVersion: v1
kind: Service
metadata:
  name: app
spec:
  ports:
    - name: http
      port: 80
"#
            ),
        )
        .unwrap();
        fs::write(
            dir.path().join("kustomization.yaml"),
            "resources:\n  - app.yaml\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn render_resolves_all_tokens() {
        let dir = overlay("");
        let bundle = render(dir.path(), &config()).unwrap();
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.documents()[0]["data"]["host"], "app.domain-v");
        assert_eq!(bundle.documents()[0]["data"]["tenant"], "tenantid-v");
        assert!(!bundle.text().contains("__"));
        assert_eq!(bundle.summary(), "2 documents (ConfigMap=1, Service=1)");
    }

    #[test]
    fn render_is_deterministic() {
        let dir = overlay("");
        let first = render(dir.path(), &config()).unwrap();
        let second = render(dir.path(), &config()).unwrap();
        assert_eq!(first.text(), second.text());
    }

    #[test]
    fn token_shaped_values_are_rendered_as_given() {
        let dir = overlay("");
        let data = BootstrapKey::ALL
            .iter()
            .map(|k| (k.key().to_string(), "v".to_string()))
            .chain([("tenantId".to_string(), "__X__".to_string())])
            .collect();
        let config = BootstrapConfig::from_record(&data).unwrap();

        let bundle = render(dir.path(), &config).unwrap();
        assert_eq!(bundle.documents()[0]["data"]["tenant"], "__X__");
    }

    #[test]
    fn unknown_token_fails_without_bundle() {
        let dir = overlay("  zone: __ZONE__\n");
        let err = render(dir.path(), &config()).unwrap_err();
        assert!(matches!(err, Error::UnresolvedTokens { ref tokens } if tokens == &vec!["__ZONE__".to_string()]));
    }
}
