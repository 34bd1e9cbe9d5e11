//! Delivery of a rendered bundle to the cluster
//!
//! [`ExecutionBackend`] is a closed set of ways to reach the control plane.
//! Callers hold one value and call [`ExecutionBackend::apply`]; the backend
//! decides how the bundle travels. Both variants can also read the bootstrap
//! record, so resolution and delivery always go through the same channel.

mod direct;
mod proxied;

use std::collections::BTreeMap;

use async_trait::async_trait;

pub use direct::DirectBackend;
pub use proxied::{
    interpret_apply_output, readiness_config, ChannelFailure, ProxiedBackend, ProxiedConfig,
    TransferMechanism, CHANNEL_RULES, DEFAULT_INLINE_LIMIT, SUCCESS_MARKER,
};

use crate::bootstrap::{RecordLocator, RecordSource};
use crate::render::ManifestBundle;
use crate::Result;

/// Outcome of one apply
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryResult {
    /// Whether the whole bundle is known to have been applied
    pub applied: bool,
    /// Output returned by the backend
    pub raw_output: String,
    /// Why the apply is not considered successful
    pub failure_reason: Option<String>,
    /// Command that addresses the failure, when one is known
    pub remediation: Option<String>,
}

impl DeliveryResult {
    /// A successful result
    pub fn success(raw_output: impl Into<String>) -> Self {
        Self {
            applied: true,
            raw_output: raw_output.into(),
            ..Default::default()
        }
    }

    /// A failed result
    pub fn failure(raw_output: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            applied: false,
            raw_output: raw_output.into(),
            failure_reason: Some(reason.into()),
            remediation: None,
        }
    }

    /// Attach a remediation command
    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }
}

/// How deckhand reaches the cluster control plane
pub enum ExecutionBackend {
    /// Live API connection
    Direct(DirectBackend),
    /// Remote command channel with file attachments
    Proxied(ProxiedBackend),
}

impl ExecutionBackend {
    /// Apply every document of `bundle`.
    ///
    /// `Err` means the channel itself could not be used; an apply that ran
    /// but did not succeed is reported through [`DeliveryResult::applied`].
    pub async fn apply(&self, bundle: &ManifestBundle) -> Result<DeliveryResult> {
        match self {
            Self::Direct(backend) => backend.apply(bundle).await,
            Self::Proxied(backend) => backend.apply(bundle).await,
        }
    }

    /// Short human-readable description of the target
    pub fn describe(&self) -> String {
        match self {
            Self::Direct(backend) => backend.describe(),
            Self::Proxied(backend) => backend.describe(),
        }
    }
}

#[async_trait]
impl RecordSource for ExecutionBackend {
    async fn fetch_record(
        &self,
        locator: &RecordLocator,
    ) -> Result<Option<BTreeMap<String, String>>> {
        match self {
            Self::Direct(backend) => backend.fetch_record(locator).await,
            Self::Proxied(backend) => backend.fetch_record(locator).await,
        }
    }
}
