//! Parallel image import between registries
//!
//! Every [`ImportTask`] is an independent `az acr import`. The coordinator
//! launches all of them, waits for every one, and only then summarises.
//! Failures never cancel other tasks. Failed outcomes are grouped into
//! coarse buckets so the operator sees one remediation per cause.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use deckhand_common::diagnostics::{classify_or, Rule};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::runner::CommandRunner;
use crate::version::VersionDeclaration;
use crate::{Error, Result};

const AZ: &str = "az";
const REDACTED: &str = "<redacted>";

/// Credentials for the source registry
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    /// User name
    pub username: String,
    /// Password or token
    pub password: String,
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &REDACTED)
            .finish()
    }
}

/// One image to copy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportTask {
    /// `repository:tag` inside the source registry
    pub image_ref: String,
    /// Source registry host
    pub source_registry: String,
    /// Target registry name
    pub target_registry: String,
    /// Source credentials, if the source is private
    pub credentials: Option<RegistryCredentials>,
}

impl ImportTask {
    /// Create a task
    pub fn new(
        image_ref: impl Into<String>,
        source_registry: impl Into<String>,
        target_registry: impl Into<String>,
        credentials: Option<RegistryCredentials>,
    ) -> Self {
        Self {
            image_ref: image_ref.into(),
            source_registry: source_registry.into(),
            target_registry: target_registry.into(),
            credentials,
        }
    }

    /// One task per declared component, as `name:tag`
    pub fn from_declaration(
        declaration: &VersionDeclaration,
        source_registry: &str,
        target_registry: &str,
        credentials: Option<&RegistryCredentials>,
    ) -> Vec<Self> {
        declaration
            .entries
            .iter()
            .map(|entry| {
                Self::new(
                    format!("{}:{}", entry.name, entry.tag),
                    source_registry,
                    target_registry,
                    credentials.cloned(),
                )
            })
            .collect()
    }

    fn args(&self, redact: bool) -> Vec<String> {
        let mut args = vec![
            "acr".to_string(),
            "import".to_string(),
            "--name".to_string(),
            self.target_registry.clone(),
            "--source".to_string(),
            format!("{}/{}", self.source_registry.trim_end_matches('/'), self.image_ref),
            "--image".to_string(),
            self.image_ref.clone(),
            "--force".to_string(),
        ];
        if let Some(creds) = &self.credentials {
            args.push("--username".to_string());
            args.push(creds.username.clone());
            args.push("--password".to_string());
            args.push(if redact {
                REDACTED.to_string()
            } else {
                creds.password.clone()
            });
        }
        args
    }

    /// The import command with the password redacted
    pub fn display_command(&self) -> String {
        format!("{} {}", AZ, self.args(true).join(" "))
    }
}

/// Validate an `--image` reference (`repository:tag`)
pub fn parse_image_ref(image_ref: &str) -> Result<String> {
    let trimmed = image_ref.trim();
    match trimmed.rsplit_once(':') {
        Some((repo, tag)) if !repo.is_empty() && !tag.is_empty() && !tag.contains('/') => {
            Ok(trimmed.to_string())
        }
        _ => Err(Error::declaration(
            "--image",
            format!("expected repository:tag, got '{}'", image_ref),
        )),
    }
}

/// Coarse cause of a failed import
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FailureBucket {
    /// Source credentials missing or wrong
    Authentication,
    /// Image or tag does not exist, or the reference is malformed
    NotFound,
    /// Caller lacks rights on the target registry
    Authorization,
    /// Anything else
    Other,
}

impl fmt::Display for FailureBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Authentication => "authentication",
            Self::NotFound => "not found / invalid reference",
            Self::Authorization => "authorization",
            Self::Other => "other",
        })
    }
}

impl FailureBucket {
    /// One remediation command for every failure in this bucket
    pub fn remediation(self, task: &ImportTask) -> String {
        match self {
            Self::Authentication => format!(
                "deckhand import --target-registry {} --source-registry {} \
                 --source-user <user> --source-password <token>",
                task.target_registry, task.source_registry
            ),
            Self::NotFound => format!(
                "az acr repository show-tags --name {} --repository {} --output table",
                task.source_registry
                    .split('.')
                    .next()
                    .unwrap_or(task.source_registry.as_str()),
                task.image_ref
                    .rsplit_once(':')
                    .map_or(task.image_ref.as_str(), |(repo, _)| repo)
            ),
            Self::Authorization => format!(
                "az role assignment create --assignee $(az ad signed-in-user show --query id -o tsv) \
                 --role AcrPush --scope $(az acr show --name {} --query id -o tsv)",
                task.target_registry
            ),
            Self::Other => format!(
                "az acr show --name {} --query \"{{loginServer:loginServer,publicNetworkAccess:publicNetworkAccess}}\"",
                task.target_registry
            ),
        }
    }
}

/// Ordered classification rules for import diagnostics. First match wins.
pub const IMPORT_RULES: &[Rule<FailureBucket>] = &[
    Rule::new("authentication required", FailureBucket::Authentication),
    Rule::new("incorrect username or password", FailureBucket::Authentication),
    Rule::new("invalid username or password", FailureBucket::Authentication),
    Rule::new("unauthorized", FailureBucket::Authentication),
    Rule::new("AuthorizationFailed", FailureBucket::Authorization),
    Rule::new("does not have authorization", FailureBucket::Authorization),
    Rule::new("requested access to the resource is denied", FailureBucket::Authorization),
    Rule::new("manifest unknown", FailureBucket::NotFound),
    Rule::new("name unknown", FailureBucket::NotFound),
    Rule::new("invalid reference format", FailureBucket::NotFound),
    Rule::new("InvalidImageName", FailureBucket::NotFound),
    // missing tooling or Azure resources, not a missing image
    Rule::new("command not found", FailureBucket::Other),
    Rule::new("ResourceNotFound", FailureBucket::Other),
    Rule::new("ResourceGroupNotFound", FailureBucket::Other),
    Rule::new("not found", FailureBucket::NotFound),
];

/// Whether a task finished successfully
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportStatus {
    /// Image copied
    Succeeded,
    /// Copy failed
    Failed,
}

/// Result of one task
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportOutcome {
    /// The task that ran
    pub task: ImportTask,
    /// Final status
    pub status: ImportStatus,
    /// Captured diagnostic text, for failures
    pub diagnostic: Option<String>,
    /// Classified cause, for failures
    pub bucket: Option<FailureBucket>,
}

impl ImportOutcome {
    fn succeeded(task: ImportTask) -> Self {
        Self {
            task,
            status: ImportStatus::Succeeded,
            diagnostic: None,
            bucket: None,
        }
    }

    fn failed(task: ImportTask, diagnostic: String) -> Self {
        let bucket = classify_or(&diagnostic, IMPORT_RULES, FailureBucket::Other);
        Self {
            task,
            status: ImportStatus::Failed,
            diagnostic: Some(diagnostic),
            bucket: Some(bucket),
        }
    }

    /// Whether the task failed
    pub fn is_failed(&self) -> bool {
        self.status == ImportStatus::Failed
    }
}

async fn import_one(runner: &dyn CommandRunner, task: ImportTask) -> ImportOutcome {
    debug!(image = %task.image_ref, "starting import");
    match runner.run(AZ, &task.args(false)).await {
        Ok(output) if output.success => {
            info!(image = %task.image_ref, target = %task.target_registry, "imported image");
            ImportOutcome::succeeded(task)
        }
        Ok(output) => {
            warn!(image = %task.image_ref, "import failed");
            ImportOutcome::failed(task, output.combined())
        }
        Err(e) => {
            warn!(image = %task.image_ref, error = %e, "import could not start");
            ImportOutcome::failed(task, e.to_string())
        }
    }
}

/// Runs import tasks concurrently and collects every outcome.
pub struct ImportCoordinator {
    runner: Arc<dyn CommandRunner>,
    max_parallel: Option<usize>,
}

impl ImportCoordinator {
    /// Unbounded coordinator
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            max_parallel: None,
        }
    }

    /// Cap the number of imports in flight
    pub fn with_max_parallel(mut self, limit: Option<usize>) -> Self {
        self.max_parallel = limit.map(|n| n.max(1));
        self
    }

    /// Launch every task and wait for all of them.
    ///
    /// Outcomes are returned in task order, exactly one per task.
    pub async fn run(&self, tasks: Vec<ImportTask>) -> ImportSummary {
        info!(
            tasks = tasks.len(),
            max_parallel = ?self.max_parallel,
            "starting image imports"
        );
        let semaphore = self.max_parallel.map(|n| Arc::new(Semaphore::new(n)));

        let handles: Vec<_> = tasks
            .iter()
            .cloned()
            .map(|task| {
                let runner = Arc::clone(&self.runner);
                let semaphore = semaphore.clone();
                tokio::spawn(async move {
                    let _permit = match semaphore {
                        Some(s) => s.acquire_owned().await.ok(),
                        None => None,
                    };
                    import_one(runner.as_ref(), task).await
                })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (task, handle) in tasks.into_iter().zip(handles) {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => ImportOutcome::failed(task, format!("import task aborted: {}", e)),
            };
            outcomes.push(outcome);
        }

        ImportSummary { outcomes }
    }
}

/// Every outcome of one coordinator run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportSummary {
    /// Outcomes in task order
    pub outcomes: Vec<ImportOutcome>,
}

impl ImportSummary {
    /// Number of tasks
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    /// Number of failed tasks
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failed()).count()
    }

    /// Number of succeeded tasks
    pub fn succeeded(&self) -> usize {
        self.total() - self.failed()
    }

    /// Whether every task succeeded
    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    /// Failed outcomes grouped by bucket
    pub fn by_bucket(&self) -> BTreeMap<FailureBucket, Vec<&ImportOutcome>> {
        let mut buckets: BTreeMap<FailureBucket, Vec<&ImportOutcome>> = BTreeMap::new();
        for outcome in self.outcomes.iter().filter(|o| o.is_failed()) {
            let bucket = outcome.bucket.unwrap_or(FailureBucket::Other);
            buckets.entry(bucket).or_default().push(outcome);
        }
        buckets
    }

    /// One remediation per bucket that has failures
    pub fn remediations(&self) -> Vec<(FailureBucket, String)> {
        self.by_bucket()
            .into_iter()
            .filter_map(|(bucket, outcomes)| {
                outcomes
                    .first()
                    .map(|first| (bucket, bucket.remediation(&first.task)))
            })
            .collect()
    }

    /// Human-readable report
    pub fn render(&self) -> String {
        let mut out = format!(
            "Import summary: {} succeeded, {} failed ({} total)\n",
            self.succeeded(),
            self.failed(),
            self.total()
        );

        for (bucket, outcomes) in self.by_bucket() {
            out.push_str(&format!("\n{} failures ({}):\n", bucket, outcomes.len()));
            for outcome in &outcomes {
                let detail = outcome
                    .diagnostic
                    .as_deref()
                    .and_then(|d| d.trim().lines().last())
                    .unwrap_or("");
                out.push_str(&format!("  - {}: {}\n", outcome.task.image_ref, detail));
            }
            if let Some(first) = outcomes.first() {
                out.push_str(&format!("  remediation: {}\n", bucket.remediation(&first.task)));
            }
        }
        out
    }

    /// `Err(ImportFailed)` if any task failed
    pub fn ensure_success(&self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(Error::ImportFailed {
                failed: self.failed(),
                total: self.total(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandOutput, MockCommandRunner};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn task(image: &str) -> ImportTask {
        ImportTask::new(image, "src.example.io", "targetacr", None)
    }

    fn failing_runner(fail: &'static [(&'static str, &'static str)]) -> MockCommandRunner {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(move |_, args| {
            let image = args
                .iter()
                .position(|a| a == "--image")
                .map(|i| args[i + 1].clone())
                .unwrap_or_default();
            match fail.iter().find(|(name, _)| image.starts_with(name)) {
                Some((_, stderr)) => Ok(CommandOutput::failed(*stderr)),
                None => Ok(CommandOutput::ok("{}")),
            }
        });
        runner
    }

    #[test]
    fn command_uses_source_and_redacts_password() {
        let mut t = task("svc-a:v1");
        t.credentials = Some(RegistryCredentials {
            username: "bot".to_string(),
            password: "s3cret".to_string(),
        });
        let args = t.args(false);
        assert!(args.contains(&"src.example.io/svc-a:v1".to_string()));
        assert!(args.contains(&"s3cret".to_string()));

        let shown = t.display_command();
        assert!(shown.starts_with("az acr import --name targetacr"));
        assert!(!shown.contains("s3cret"));
        assert!(!format!("{:?}", t).contains("s3cret"));
    }

    #[test]
    fn image_refs_need_a_tag() {
        assert!(parse_image_ref("team/svc:v1").is_ok());
        assert!(parse_image_ref("svc").is_err());
        assert!(parse_image_ref("reg:5000/svc").is_err());
    }

    #[test]
    fn buckets_follow_rule_order() {
        let t = task("a:1");
        let auth = ImportOutcome::failed(t.clone(), "unauthorized: authentication required".into());
        assert_eq!(auth.bucket, Some(FailureBucket::Authentication));
        let authz = ImportOutcome::failed(
            t.clone(),
            "(AuthorizationFailed) The client does not have authorization".into(),
        );
        assert_eq!(authz.bucket, Some(FailureBucket::Authorization));
        let missing = ImportOutcome::failed(t.clone(), "manifest unknown: tag not found".into());
        assert_eq!(missing.bucket, Some(FailureBucket::NotFound));
        let other = ImportOutcome::failed(t, "connection reset by peer".into());
        assert_eq!(other.bucket, Some(FailureBucket::Other));
    }

    #[test]
    fn environment_failures_are_not_missing_images() {
        let t = task("a:1");
        for diagnostic in [
            "bash: az: command not found",
            "(ResourceNotFound) The Resource 'Microsoft.ContainerRegistry/registries/targetacr' \
             under resource group 'rg' was not found.",
            "(ResourceGroupNotFound) Resource group 'rg' could not be found.",
        ] {
            let outcome = ImportOutcome::failed(t.clone(), diagnostic.into());
            assert_eq!(outcome.bucket, Some(FailureBucket::Other), "{}", diagnostic);
        }
        let missing = ImportOutcome::failed(t, "Error: image svc:v9 not found".into());
        assert_eq!(missing.bucket, Some(FailureBucket::NotFound));
    }

    #[tokio::test]
    async fn two_auth_failures_share_one_remediation() {
        static FAIL: &[(&str, &str)] = &[
            ("svc-b", "unauthorized: authentication required"),
            ("svc-d", "Error: unauthorized: incorrect username or password"),
        ];
        let coordinator = ImportCoordinator::new(Arc::new(failing_runner(FAIL)));
        let tasks = ["svc-a:1", "svc-b:1", "svc-c:1", "svc-d:1", "svc-e:1"]
            .into_iter()
            .map(task)
            .collect();

        let summary = coordinator.run(tasks).await;
        assert_eq!(summary.total(), 5);
        assert_eq!(summary.succeeded(), 3);
        assert_eq!(summary.failed(), 2);

        let remediations = summary.remediations();
        assert_eq!(remediations.len(), 1);
        assert_eq!(remediations[0].0, FailureBucket::Authentication);

        let report = summary.render();
        assert_eq!(report.matches("remediation:").count(), 1);
        assert!(report.contains("3 succeeded, 2 failed"));
        assert!(matches!(
            summary.ensure_success(),
            Err(Error::ImportFailed { failed: 2, total: 5 })
        ));
    }

    #[tokio::test]
    async fn reports_n_outcomes_with_k_failures() {
        static FAIL: &[(&str, &str)] = &[
            ("f0", "manifest unknown"),
            ("f1", "boom"),
            ("f2", "AuthorizationFailed"),
        ];
        for n in 0..=4usize {
            for k in 0..=n.min(3) {
                let tasks: Vec<ImportTask> = (0..n)
                    .map(|i| {
                        if i < k {
                            task(&format!("f{}:1", i))
                        } else {
                            task(&format!("ok{}:1", i))
                        }
                    })
                    .collect();
                let summary = ImportCoordinator::new(Arc::new(failing_runner(FAIL)))
                    .run(tasks)
                    .await;
                assert_eq!(summary.total(), n);
                assert_eq!(summary.failed(), k);
                assert_eq!(summary.ensure_success().is_err(), k > 0);
            }
        }
    }

    struct SlowRunner {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl CommandRunner for SlowRunner {
        async fn run(&self, _program: &str, args: &[String]) -> Result<CommandOutput> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if args.iter().any(|a| a == "panic:1") {
                panic!("runner crashed");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(CommandOutput::ok(""))
        }
    }

    #[tokio::test]
    async fn bounded_pool_limits_concurrency() {
        let runner = Arc::new(SlowRunner {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let tasks = (0..6).map(|i| task(&format!("svc-{}:1", i))).collect();

        let summary = ImportCoordinator::new(runner.clone())
            .with_max_parallel(Some(2))
            .run(tasks)
            .await;

        assert!(summary.is_success());
        assert!(runner.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn aborted_task_still_yields_an_outcome() {
        let runner = Arc::new(SlowRunner {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let tasks = vec![task("svc-a:1"), task("panic:1"), task("svc-c:1")];

        let summary = ImportCoordinator::new(runner).run(tasks).await;
        assert_eq!(summary.total(), 3);
        assert_eq!(summary.failed(), 1);
        assert!(summary.outcomes[1].is_failed());
        assert_eq!(summary.outcomes[1].task.image_ref, "panic:1");
    }

    #[test]
    fn tasks_from_declaration_keep_order() {
        let decl = VersionDeclaration::parse("v", "svc-a:v1\nsvc-b:v2\n").unwrap();
        let tasks = ImportTask::from_declaration(&decl, "src.io", "acr", None);
        let refs: Vec<_> = tasks.iter().map(|t| t.image_ref.as_str()).collect();
        assert_eq!(refs, vec!["svc-a:v1", "svc-b:v2"]);
    }
}
