//! Connection settings resolved from flags and environment.
//!
//! The kubeconfig resolution chain (highest priority first):
//! 1. Explicit `--kubeconfig` flag
//! 2. `DECKHAND_KUBECONFIG` environment variable
//! 3. Fall back to kube default (`KUBECONFIG` env / `~/.kube/config`)
//!
//! Registry and channel settings are read through clap's `env` support; the
//! variable names are collected here so help text and docs agree.

use std::path::{Path, PathBuf};

/// Kubeconfig override for direct delivery
pub const DECKHAND_KUBECONFIG_ENV: &str = "DECKHAND_KUBECONFIG";
/// Resource group of the managed cluster
pub const DECKHAND_RESOURCE_GROUP_ENV: &str = "DECKHAND_RESOURCE_GROUP";
/// Managed cluster name
pub const DECKHAND_CLUSTER_NAME_ENV: &str = "DECKHAND_CLUSTER_NAME";
/// Target registry for imports
pub const DECKHAND_TARGET_REGISTRY_ENV: &str = "DECKHAND_TARGET_REGISTRY";
/// Source registry for imports
pub const DECKHAND_SOURCE_REGISTRY_ENV: &str = "DECKHAND_SOURCE_REGISTRY";
/// Source registry user
pub const DECKHAND_SOURCE_USER_ENV: &str = "DECKHAND_SOURCE_USER";
/// Source registry password or token
pub const DECKHAND_SOURCE_PASSWORD_ENV: &str = "DECKHAND_SOURCE_PASSWORD";

/// Resolve a kubeconfig path using the priority chain.
///
/// Returns `Some(path)` if one is configured, `None` to use kube defaults.
pub fn resolve_kubeconfig(explicit: Option<&Path>) -> Option<PathBuf> {
    resolve_kubeconfig_from(explicit, std::env::var(DECKHAND_KUBECONFIG_ENV).ok())
}

fn resolve_kubeconfig_from(explicit: Option<&Path>, env_value: Option<String>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    env_value.filter(|p| !p.is_empty()).map(PathBuf::from)
}
