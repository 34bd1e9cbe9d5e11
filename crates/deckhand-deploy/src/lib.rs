//! deckhand deployment engine
//!
//! The deployment path runs strictly in order:
//! 1. [`version`] - compare the expected-version declaration with the overlay
//! 2. [`bootstrap`] - fetch the bootstrap configuration record
//! 3. [`render`] - build the layered overlay and substitute placeholder tokens
//! 4. [`delivery`] - apply the bundle through the selected execution backend
//!
//! [`import`] is a separate entry point that copies images between registries
//! concurrently, sharing the [`runner`] seam and the diagnostic rule tables.

pub mod bootstrap;
pub mod context;
pub mod delivery;
pub mod import;
pub mod render;
pub mod runner;
pub mod version;

pub use bootstrap::{BootstrapConfig, BootstrapKey, FileSource, RecordLocator, RecordSource};
pub use context::{ClusterApi, ClusterContext, KubeCluster};
pub use delivery::{
    DeliveryResult, DirectBackend, ExecutionBackend, ProxiedBackend, ProxiedConfig,
    TransferMechanism,
};
pub use import::{
    FailureBucket, ImportCoordinator, ImportOutcome, ImportStatus, ImportSummary, ImportTask,
    RegistryCredentials,
};
pub use render::ManifestBundle;
pub use runner::{CommandOutput, CommandRunner, ProcessRunner};
pub use version::{
    ExclusionPolicy, OverlayTagMap, ValidationReport, ValidationStatus, VersionDeclaration,
};

pub use deckhand_common::{Error, Result};
