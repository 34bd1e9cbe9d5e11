//! Deploy command - deliver a release to the cluster
//!
//! The run goes through four phases, each gated on the one before:
//! 1. Compare versions.txt with the overlay's image tags
//! 2. Resolve the bootstrap configuration record
//! 3. Render the overlay and substitute placeholder tokens
//! 4. Apply the bundle through the selected backend
//!
//! Phase 1 and phase 3 are local. Nothing reaches the cluster before the
//! version report has been printed.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tracing::{info, warn};

use deckhand_common::DEFAULT_NAMESPACE;
use deckhand_deploy::bootstrap::{self, DEFAULT_RECORD_NAME};
use deckhand_deploy::delivery::{readiness_config, DEFAULT_INLINE_LIMIT};
use deckhand_deploy::version::{self, ExclusionPolicy};
use deckhand_deploy::{
    render, ClusterContext, DeliveryResult, DirectBackend, ExecutionBackend, FileSource,
    ProcessRunner, ProxiedBackend, ProxiedConfig, RecordLocator, TransferMechanism,
};

use super::{require, CommandErrorExt};
use crate::config::{resolve_kubeconfig, DECKHAND_CLUSTER_NAME_ENV, DECKHAND_RESOURCE_GROUP_ENV};
use crate::{Error, Result};

/// Validate, render and apply a release
#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Deliver through the managed-cluster command channel instead of a direct connection
    #[arg(long)]
    pub invoke: bool,

    /// Resource group of the managed cluster (with --invoke)
    #[arg(short = 'g', long, env = DECKHAND_RESOURCE_GROUP_ENV)]
    pub resource_group: Option<String>,

    /// Managed cluster name (required with --invoke)
    #[arg(short = 'n', long, env = DECKHAND_CLUSTER_NAME_ENV)]
    pub cluster_name: Option<String>,

    /// Namespace to apply into
    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Overlay directory containing kustomization.yaml
    #[arg(short = 'k', long, default_value = "deploy/overlays/production")]
    pub manifest_dir: PathBuf,

    /// Expected-version declaration
    #[arg(long, default_value = "versions.txt")]
    pub versions_file: PathBuf,

    /// Name of the bootstrap ConfigMap
    #[arg(long, default_value = DEFAULT_RECORD_NAME)]
    pub config_map: String,

    /// Namespace of the bootstrap ConfigMap (defaults to --namespace)
    #[arg(long)]
    pub config_namespace: Option<String>,

    /// Kubeconfig for direct delivery
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context for direct delivery
    #[arg(long)]
    pub context: Option<String>,

    /// Component intentionally left out of the overlay (repeatable)
    #[arg(long = "exclude", value_name = "COMPONENT")]
    pub exclude: Vec<String>,

    /// Treat commented-out overlay image entries as intentional exclusions
    #[arg(long)]
    pub infer_exclusions_from_comments: bool,

    /// Report version findings as warnings instead of failing
    #[arg(long)]
    pub skip_version_check: bool,

    /// Render and print the bundle without applying it
    #[arg(long)]
    pub dry_run: bool,

    /// Also print the version report as JSON
    #[arg(long)]
    pub json: bool,

    /// Read bootstrap values from a local YAML file instead of the cluster
    #[arg(long)]
    pub bootstrap_file: Option<PathBuf>,

    /// Embed small bundles in the remote command instead of attaching them
    #[arg(long)]
    pub inline: bool,

    /// Maximum inline remote command length in bytes
    #[arg(long, default_value_t = DEFAULT_INLINE_LIMIT)]
    pub inline_limit: usize,

    /// Readiness probe attempts for the command channel
    #[arg(long, default_value_t = 10)]
    pub readiness_attempts: u32,

    /// Seconds between readiness probe attempts
    #[arg(long, default_value_t = 30)]
    pub readiness_interval_secs: u64,
}

impl DeployArgs {
    fn validate(&self) -> Result<()> {
        if self.invoke {
            require(&[
                ("--resource-group", self.resource_group.as_deref()),
                ("--cluster-name", self.cluster_name.as_deref()),
            ])?;
        }
        if self.dry_run && self.bootstrap_file.is_none() {
            return Err(Error::validation(
                "--dry-run requires --bootstrap-file so the cluster is never contacted",
            ));
        }
        Ok(())
    }

    fn exclusion_policy(&self) -> ExclusionPolicy {
        ExclusionPolicy {
            explicit: self.exclude.iter().cloned().collect(),
            infer_from_comments: self.infer_exclusions_from_comments,
        }
    }

    fn record_locator(&self) -> RecordLocator {
        RecordLocator::new(
            self.config_namespace.as_deref().unwrap_or(self.namespace.as_str()),
            &self.config_map,
        )
    }

    fn proxied_config(&self) -> ProxiedConfig {
        let mut config = ProxiedConfig::new(
            self.resource_group.clone().unwrap_or_default(),
            self.cluster_name.clone().unwrap_or_default(),
            &self.namespace,
        );
        config.size_limit = self.inline_limit;
        config.transfer = if self.inline {
            TransferMechanism::Inline
        } else {
            TransferMechanism::Attachment
        };
        config.readiness = readiness_config(self.readiness_attempts, self.readiness_interval_secs);
        config
    }

    /// A dry run reads bootstrap values locally and applies nothing.
    fn needs_backend(&self) -> bool {
        !self.dry_run
    }
}

async fn build_backend(args: &DeployArgs) -> Result<ExecutionBackend> {
    if args.invoke {
        let config = args.proxied_config();
        return Ok(ExecutionBackend::Proxied(ProxiedBackend::new(
            Arc::new(ProcessRunner),
            config,
        )));
    }

    let context = ClusterContext {
        kubeconfig: resolve_kubeconfig(args.kubeconfig.as_deref()),
        context: args.context.clone(),
    };
    let cluster = context.connect().await?;
    Ok(ExecutionBackend::Direct(DirectBackend::new(
        Arc::new(cluster),
        &args.namespace,
    )))
}

fn report_failure(result: &DeliveryResult) {
    let tail: Vec<&str> = result.raw_output.lines().rev().take(20).collect();
    eprintln!("Remote output (last {} lines):", tail.len());
    for line in tail.into_iter().rev() {
        eprintln!("  {}", line);
    }
    if let Some(remediation) = &result.remediation {
        eprintln!("Remediation:\n  {}", remediation);
    }
}

pub async fn run(args: DeployArgs) -> Result<()> {
    args.validate()?;

    info!("[Phase 1] Checking component versions...");
    let report = version::check(
        &args.versions_file,
        &args.manifest_dir,
        &args.exclusion_policy(),
        args.skip_version_check,
    )?;
    print!("{}", report.render());
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report).cmd_err()?);
    }
    report.ensure_passed()?;
    if report.overridden {
        warn!("Version findings overridden by --skip-version-check");
    }

    let backend = if args.needs_backend() {
        let backend = build_backend(&args).await?;
        info!("Using {} backend", backend.describe());
        Some(backend)
    } else {
        None
    };

    let locator = args.record_locator();
    info!("[Phase 2] Resolving bootstrap configuration {}...", locator);
    let config = match (&args.bootstrap_file, &backend) {
        (Some(path), _) => bootstrap::resolve(&FileSource::new(path), &locator).await?,
        (None, Some(backend)) => bootstrap::resolve(backend, &locator).await?,
        (None, None) => return Err(Error::validation("no source for bootstrap configuration")),
    };

    info!("[Phase 3] Rendering {}...", args.manifest_dir.display());
    let bundle = render::render(&args.manifest_dir, &config)?;
    info!("Rendered {}", bundle.summary());

    let Some(backend) = backend else {
        println!("{}", bundle.text());
        info!("Dry run - bundle not applied");
        return Ok(());
    };

    info!("[Phase 4] Applying bundle via {}...", backend.describe());
    let result = backend.apply(&bundle).await?;
    if !result.applied {
        report_failure(&result);
        let reason = result
            .failure_reason
            .unwrap_or_else(|| "apply not confirmed".to_string());
        return Err(deckhand_common::Error::delivery(reason).into());
    }

    info!("Deployment complete: {}", bundle.summary());
    Ok(())
}
