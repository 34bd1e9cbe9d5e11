//! Delivery through the managed-cluster remote command channel
//!
//! The channel (`az aks command invoke`) runs one shell command inside the
//! cluster's network and hands back a log blob instead of a structured exit
//! status. The inline command length is capped, so bundles normally travel
//! as a file attachment and the remote command applies that file. Success is
//! decided by finding [`SUCCESS_MARKER`] in the returned text.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use deckhand_common::diagnostics::{classify, Rule};
use deckhand_common::retry::{retry_with_fixed_backoff, RetryConfig, RetryError};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::DeliveryResult;
use crate::bootstrap::{flatten_string_map, RecordLocator};
use crate::render::ManifestBundle;
use crate::runner::{CommandOutput, CommandRunner};
use crate::{Error, Result};

/// Line echoed by the remote command after a successful apply
pub const SUCCESS_MARKER: &str = "deckhand-apply-ok";

/// Default maximum length of an inline remote command, in bytes
pub const DEFAULT_INLINE_LIMIT: usize = 10 * 1024;

const AZ: &str = "az";
const ATTACHMENT_NAME: &str = "bundle.yaml";
const HEREDOC_DELIMITER: &str = "DECKHAND_BUNDLE_EOF";
const READINESS_COMMAND: &str = "kubectl get --raw /readyz";
const KUBECTL_NOT_FOUND: &str = "(NotFound)";

/// Classified failure of the remote command channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelFailure {
    /// Identity or role assignment has not propagated yet
    NotReady,
    /// The caller lacks rights on the cluster
    Forbidden,
    /// Network access to the cluster management plane is disabled
    NetworkDisabled,
    /// The cluster or resource group does not exist
    NotFound,
    /// The channel reported that output was cut off
    Truncated,
}

impl ChannelFailure {
    /// Whether the readiness probe should try again after this failure
    pub fn is_propagation_delay(self) -> bool {
        matches!(self, Self::NotReady | Self::Forbidden)
    }

    /// Command that addresses this failure for the given cluster
    pub fn remediation(self, resource_group: &str, cluster_name: &str, namespace: &str) -> String {
        let scope = format!(
            "$(az aks show --resource-group {} --name {} --query id -o tsv)",
            resource_group, cluster_name
        );
        match self {
            Self::NotReady => format!(
                "az role assignment create --assignee $(az ad signed-in-user show --query id -o tsv) \
                 --role \"Azure Kubernetes Service Cluster User Role\" --scope {}",
                scope
            ),
            Self::Forbidden => format!(
                "az role assignment create --assignee $(az ad signed-in-user show --query id -o tsv) \
                 --role \"Azure Kubernetes Service RBAC Writer\" --scope {}",
                scope
            ),
            Self::NetworkDisabled => format!(
                "az aks update --resource-group {} --name {} --api-server-authorized-ip-ranges \"\"",
                resource_group, cluster_name
            ),
            Self::NotFound => format!(
                "az aks show --resource-group {} --name {} --output table",
                resource_group, cluster_name
            ),
            Self::Truncated => format!(
                "az aks command invoke --resource-group {} --name {} --command \"kubectl get all -n {}\"",
                resource_group, cluster_name, namespace
            ),
        }
    }
}

impl fmt::Display for ChannelFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotReady => "identity or role propagation pending",
            Self::Forbidden => "access forbidden",
            Self::NetworkDisabled => "network access disabled",
            Self::NotFound => "cluster not found",
            Self::Truncated => "output truncated",
        })
    }
}

/// Ordered classification rules for channel output. First match wins.
pub const CHANNEL_RULES: &[Rule<ChannelFailure>] = &[
    Rule::new("PublicNetworkAccessDisabled", ChannelFailure::NetworkDisabled),
    Rule::new("public network access is disabled", ChannelFailure::NetworkDisabled),
    Rule::new("network access is disabled", ChannelFailure::NetworkDisabled),
    Rule::new("ResourceGroupNotFound", ChannelFailure::NotFound),
    Rule::new("ResourceNotFound", ChannelFailure::NotFound),
    Rule::new("AuthorizationFailed", ChannelFailure::NotReady),
    Rule::new("does not have authorization to perform action", ChannelFailure::NotReady),
    Rule::new("RoleAssignmentNotFound", ChannelFailure::NotReady),
    Rule::new("AADSTS700016", ChannelFailure::NotReady),
    Rule::new("identity not found", ChannelFailure::NotReady),
    Rule::new("Error from server (Forbidden)", ChannelFailure::Forbidden),
    Rule::new("is forbidden", ChannelFailure::Forbidden),
    Rule::new("output truncated", ChannelFailure::Truncated),
    Rule::new("output was truncated", ChannelFailure::Truncated),
    Rule::new("exceeds the maximum", ChannelFailure::Truncated),
];

/// How the bundle reaches the remote side
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransferMechanism {
    /// Uploaded as a file next to the remote command
    #[default]
    Attachment,
    /// Embedded in the command as a heredoc when it fits the size limit
    Inline,
}

/// Connection parameters of the proxied channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxiedConfig {
    /// Resource group of the managed cluster
    pub resource_group: String,
    /// Managed cluster name
    pub cluster_name: String,
    /// Namespace applied into
    pub namespace: String,
    /// Maximum inline command length in bytes
    pub size_limit: usize,
    /// Preferred transfer mechanism
    pub transfer: TransferMechanism,
    /// Readiness probe bound and interval
    pub readiness: RetryConfig,
}

impl ProxiedConfig {
    /// Config with default size limit, attachment transfer and readiness bound
    pub fn new(
        resource_group: impl Into<String>,
        cluster_name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            resource_group: resource_group.into(),
            cluster_name: cluster_name.into(),
            namespace: namespace.into(),
            size_limit: DEFAULT_INLINE_LIMIT,
            transfer: TransferMechanism::Attachment,
            readiness: RetryConfig::default(),
        }
    }
}

#[derive(Debug)]
struct ProbeFailure {
    category: Option<ChannelFailure>,
    output: String,
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.category {
            Some(category) => write!(f, "{}: {}", category, excerpt(&self.output)),
            None => write!(f, "{}", excerpt(&self.output)),
        }
    }
}

/// Last few lines of channel output, for error messages
fn excerpt(output: &str) -> String {
    let lines: Vec<&str> = output.trim().lines().collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join(" | ")
}

/// Applies bundles through `az aks command invoke`.
pub struct ProxiedBackend {
    runner: Arc<dyn CommandRunner>,
    config: ProxiedConfig,
    ready: OnceCell<()>,
}

impl ProxiedBackend {
    /// Backend issuing commands through `runner`
    pub fn new(runner: Arc<dyn CommandRunner>, config: ProxiedConfig) -> Self {
        Self {
            runner,
            config,
            ready: OnceCell::new(),
        }
    }

    pub(super) fn describe(&self) -> String {
        format!(
            "proxied ({}/{}, namespace {})",
            self.config.resource_group, self.config.cluster_name, self.config.namespace
        )
    }

    fn invoke_args(&self, command: &str, attachment: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = [
            "aks",
            "command",
            "invoke",
            "--resource-group",
            self.config.resource_group.as_str(),
            "--name",
            self.config.cluster_name.as_str(),
            "--command",
            command,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if let Some(path) = attachment {
            args.push("--file".to_string());
            args.push(path.to_string());
        }
        args
    }

    fn remediation(&self, category: ChannelFailure) -> String {
        category.remediation(
            &self.config.resource_group,
            &self.config.cluster_name,
            &self.config.namespace,
        )
    }

    fn fatal(&self, category: Option<ChannelFailure>, output: &str) -> Error {
        let failure = ProbeFailure {
            category,
            output: output.to_string(),
        };
        match category {
            Some(c) => Error::unreachable(format!(
                "{}\n  remediation: {}",
                failure,
                self.remediation(c)
            )),
            None => Error::unreachable(failure.to_string()),
        }
    }

    async fn probe(&self) -> std::result::Result<(), ProbeFailure> {
        let output = self
            .runner
            .run(AZ, &self.invoke_args(READINESS_COMMAND, None))
            .await
            .map_err(|e| ProbeFailure {
                category: None,
                output: e.to_string(),
            })?;
        let text = output.combined();
        match (output.success, classify(&text, CHANNEL_RULES)) {
            (true, None) => Ok(()),
            (_, category) => Err(ProbeFailure {
                category,
                output: text,
            }),
        }
    }

    /// Probe the channel until it answers, retrying only propagation delays.
    async fn wait_until_ready(&self) -> Result<()> {
        info!(
            cluster = %self.config.cluster_name,
            attempts = self.config.readiness.max_attempts,
            "probing remote command channel"
        );
        let result = retry_with_fixed_backoff(
            &self.config.readiness,
            "channel-readiness",
            |e: &ProbeFailure| e.category.is_some_and(ChannelFailure::is_propagation_delay),
            || self.probe(),
        )
        .await;

        match result {
            Ok(()) => {
                info!("remote command channel ready");
                Ok(())
            }
            Err(RetryError::Exhausted { attempts, last }) => Err(Error::ReadinessTimeout {
                attempts,
                last_error: format!(
                    "{}\n  remediation: {}",
                    last,
                    self.remediation(last.category.unwrap_or(ChannelFailure::NotReady))
                ),
            }),
            Err(RetryError::Fatal { error, .. }) => Err(self.fatal(error.category, &error.output)),
        }
    }

    /// Runs the readiness probe at most once per backend.
    async fn ensure_ready(&self) -> Result<()> {
        self.ready
            .get_or_try_init(|| self.wait_until_ready())
            .await
            .map(|_| ())
    }

    fn apply_command(&self, source: &str) -> String {
        format!(
            "kubectl apply -n {} -f {} && echo {}",
            self.config.namespace, source, SUCCESS_MARKER
        )
    }

    /// The heredoc redirect belongs to kubectl, ahead of `&&`.
    fn inline_command(&self, bundle: &ManifestBundle) -> Option<String> {
        if self.config.transfer != TransferMechanism::Inline {
            return None;
        }
        let text = bundle.text();
        let newline = if text.ends_with('\n') { "" } else { "\n" };
        let command = format!(
            "kubectl apply -n {} -f - <<'{}' && echo {}\n{}{}{}\n",
            self.config.namespace,
            HEREDOC_DELIMITER,
            SUCCESS_MARKER,
            text,
            newline,
            HEREDOC_DELIMITER
        );
        if command.len() <= self.config.size_limit {
            Some(command)
        } else {
            debug!(
                length = command.len(),
                limit = self.config.size_limit,
                "bundle too large for inline transfer, using attachment"
            );
            None
        }
    }

    pub(super) async fn apply(&self, bundle: &ManifestBundle) -> Result<DeliveryResult> {
        self.ensure_ready().await?;

        let output = match self.inline_command(bundle) {
            Some(command) => {
                info!(bytes = bundle.text().len(), "applying bundle inline");
                self.runner.run(AZ, &self.invoke_args(&command, None)).await?
            }
            None => {
                let dir = tempfile::tempdir()?;
                let path = dir.path().join(ATTACHMENT_NAME);
                tokio::fs::write(&path, bundle.text()).await?;
                info!(bytes = bundle.text().len(), "applying bundle as attachment");
                let attachment = path.to_string_lossy().into_owned();
                let args =
                    self.invoke_args(&self.apply_command(ATTACHMENT_NAME), Some(&attachment));
                // dir must outlive the command
                let output = self.runner.run(AZ, &args).await?;
                drop(dir);
                output
            }
        };

        let result = interpret_apply_output(&output);
        if !result.applied {
            let category = classify(&output.combined(), CHANNEL_RULES)
                .unwrap_or(ChannelFailure::Truncated);
            warn!(reason = ?result.failure_reason, "proxied apply not confirmed");
            return Ok(result.with_remediation(self.remediation(category)));
        }
        Ok(result)
    }

    pub(super) async fn fetch_record(
        &self,
        locator: &RecordLocator,
    ) -> Result<Option<BTreeMap<String, String>>> {
        self.ensure_ready().await?;

        let command = format!(
            "kubectl get configmap {} -n {} -o json",
            locator.name, locator.namespace
        );
        let output = self.runner.run(AZ, &self.invoke_args(&command, None)).await?;
        let text = output.combined();

        if let Some(category) = classify(&text, CHANNEL_RULES) {
            return Err(self.fatal(Some(category), &text));
        }
        if text.contains(KUBECTL_NOT_FOUND) {
            debug!(record = %locator, "bootstrap record not found through channel");
            return Ok(None);
        }

        let json = match (text.find('{'), text.rfind('}')) {
            (Some(start), Some(end)) if start < end => &text[start..=end],
            _ => return Err(self.fatal(None, &text)),
        };
        let value: Value = serde_json::from_str(json)?;
        Ok(Some(flatten_string_map(
            value.get("data").unwrap_or(&Value::Null),
        )))
    }
}

/// Decide whether channel output confirms a successful apply.
///
/// Success needs [`SUCCESS_MARKER`] on a line of its own and no sign of
/// truncation. Partial `configured` lines never count as success.
pub fn interpret_apply_output(output: &CommandOutput) -> DeliveryResult {
    let text = output.combined();
    let marker_seen = text.lines().any(|line| line.trim() == SUCCESS_MARKER);
    let category = classify(&text, CHANNEL_RULES);

    if marker_seen && category != Some(ChannelFailure::Truncated) {
        return DeliveryResult::success(text);
    }

    let mut reason = format!(
        "success marker '{}' not confirmed; output possibly truncated, inspect cluster state manually",
        SUCCESS_MARKER
    );
    if let Some(category) = category {
        reason.push_str(&format!(" ({})", category));
    }
    DeliveryResult::failure(text, reason)
}

/// Readiness bound taken from CLI-style values
pub fn readiness_config(attempts: u32, interval_secs: u64) -> RetryConfig {
    RetryConfig::new(attempts, Duration::from_secs(interval_secs))
}
