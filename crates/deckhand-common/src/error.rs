//! Error types for deckhand
//!
//! Variants follow the failure taxonomy of a deployment run: declaration,
//! consistency, resolution, rendering, delivery and import. Each variant
//! carries the specific items that failed so the message printed to the
//! operator names them directly.

use thiserror::Error;

/// Main error type for deckhand operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Filesystem or process error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parse or emit error
    #[error("yaml error: {message}")]
    Yaml {
        /// Description of what failed
        message: String,
    },

    /// Expected-version declaration is missing or malformed
    #[error("declaration error in {path}: {message}")]
    Declaration {
        /// Path of the declaration file
        path: String,
        /// Description of what's invalid
        message: String,
    },

    /// Declared tags disagree with the overlay
    #[error("version consistency check failed with {findings} finding(s)")]
    Consistency {
        /// Number of hard findings (mismatches plus unexplained omissions)
        findings: usize,
    },

    /// The bootstrap configuration record does not exist
    #[error(
        "bootstrap configuration record {namespace}/{name} not found (provisioning incomplete)"
    )]
    RecordNotFound {
        /// Namespace searched
        namespace: String,
        /// Record name
        name: String,
    },

    /// The bootstrap configuration record exists but lacks required keys
    #[error(
        "bootstrap configuration record {namespace}/{name} is missing required keys: {}",
        .keys.join(", ")
    )]
    MissingKeys {
        /// Namespace of the record
        namespace: String,
        /// Record name
        name: String,
        /// Every missing key, in canonical order
        keys: Vec<String>,
    },

    /// Manifests reference placeholder tokens with no bootstrap value
    #[error("unresolved placeholder tokens: {}", .tokens.join(", "))]
    UnresolvedTokens {
        /// Distinct tokens no bootstrap key supplies, sorted
        tokens: Vec<String>,
    },

    /// The overlay could not be built
    #[error("layering error at {path}: {message}")]
    Layering {
        /// File or directory being built
        path: String,
        /// Description of what failed
        message: String,
    },

    /// The cluster control plane or command channel cannot be reached
    #[error("cluster unreachable: {message}")]
    Unreachable {
        /// Description of what failed
        message: String,
    },

    /// The proxied channel never became ready
    #[error("command channel not ready after {attempts} attempts: {last_error}")]
    ReadinessTimeout {
        /// Attempts made
        attempts: u32,
        /// Output of the final attempt
        last_error: String,
    },

    /// The apply ran but its outcome could not be confirmed
    #[error("delivery failed: {message}")]
    Delivery {
        /// Description of what failed
        message: String,
    },

    /// One or more artifact imports failed
    #[error("{failed} of {total} image imports failed")]
    ImportFailed {
        /// Failed task count
        failed: usize,
        /// Total task count
        total: usize,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a declaration error for the given file
    pub fn declaration(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Declaration {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a layering error for the given path
    pub fn layering(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Layering {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create an unreachable error
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::Unreachable {
            message: msg.into(),
        }
    }

    /// Create a delivery error
    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::Delivery {
            message: msg.into(),
        }
    }

    /// Create a YAML error
    pub fn yaml(msg: impl Into<String>) -> Self {
        Self::Yaml {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error was raised before any network side effect.
    ///
    /// Declaration, consistency and rendering failures are all local checks.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::Declaration { .. }
                | Self::Consistency { .. }
                | Self::UnresolvedTokens { .. }
                | Self::Layering { .. }
                | Self::Yaml { .. }
        )
    }
}

impl From<crate::yaml::YamlError> for Error {
    fn from(err: crate::yaml::YamlError) -> Self {
        Self::yaml(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_names_every_key() {
        let err = Error::MissingKeys {
            namespace: "default".to_string(),
            name: "deckhand-bootstrap".to_string(),
            keys: vec!["tenantId".to_string(), "domain".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("default/deckhand-bootstrap"));
        assert!(msg.contains("tenantId, domain"));
    }

    #[test]
    fn record_not_found_is_distinct_from_missing_keys() {
        let err = Error::RecordNotFound {
            namespace: "ops".to_string(),
            name: "boot".to_string(),
        };
        assert!(err.to_string().contains("provisioning incomplete"));
        assert!(!err.to_string().contains("missing required keys"));
    }

    #[test]
    fn unresolved_tokens_lists_tokens() {
        let err = Error::UnresolvedTokens {
            tokens: vec!["__A__".to_string(), "__B__".to_string()],
        };
        assert!(err.to_string().contains("__A__, __B__"));
    }

    #[test]
    fn local_errors_are_classified() {
        assert!(Error::declaration("versions.txt", "empty").is_local());
        assert!(Error::Consistency { findings: 2 }.is_local());
        assert!(!Error::unreachable("down").is_local());
        assert!(!Error::ImportFailed {
            failed: 1,
            total: 2
        }
        .is_local());
    }
}
