//! Common building blocks for deckhand: errors, retry, YAML and kube-rs helpers

#![deny(missing_docs)]

pub mod diagnostics;
pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod yaml;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every server-side apply issued by deckhand
pub const FIELD_MANAGER: &str = "deckhand";

/// Namespace used when neither the document nor the caller names one
pub const DEFAULT_NAMESPACE: &str = "default";
