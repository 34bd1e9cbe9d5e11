//! Import command - copy release images into the target registry
//!
//! Every image is imported concurrently; all imports run to completion
//! before the summary is printed, and the command fails if any import did.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tracing::info;

use deckhand_deploy::import::parse_image_ref;
use deckhand_deploy::{
    ImportCoordinator, ImportTask, ProcessRunner, RegistryCredentials, VersionDeclaration,
};

use super::require;
use crate::config::{
    DECKHAND_SOURCE_PASSWORD_ENV, DECKHAND_SOURCE_REGISTRY_ENV, DECKHAND_SOURCE_USER_ENV,
    DECKHAND_TARGET_REGISTRY_ENV,
};
use crate::{Error, Result};

/// Import images from a source registry
#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Registry to import into
    #[arg(long, env = DECKHAND_TARGET_REGISTRY_ENV)]
    pub target_registry: Option<String>,

    /// Registry to import from
    #[arg(long, env = DECKHAND_SOURCE_REGISTRY_ENV)]
    pub source_registry: Option<String>,

    /// Source registry user
    #[arg(long, env = DECKHAND_SOURCE_USER_ENV)]
    pub source_user: Option<String>,

    /// Source registry password or token
    #[arg(long, env = DECKHAND_SOURCE_PASSWORD_ENV, hide_env_values = true)]
    pub source_password: Option<String>,

    /// Expected-version declaration listing the images to import
    #[arg(long)]
    pub versions_file: Option<PathBuf>,

    /// Additional image to import, as repository:tag (repeatable)
    #[arg(long = "image", value_name = "REPOSITORY:TAG")]
    pub images: Vec<String>,

    /// Maximum imports in flight (unbounded by default)
    #[arg(long)]
    pub max_parallel: Option<usize>,

    /// Print the import commands without running them
    #[arg(long)]
    pub dry_run: bool,
}

impl ImportArgs {
    fn credentials(&self) -> Result<Option<RegistryCredentials>> {
        match (&self.source_user, &self.source_password) {
            (Some(username), Some(password)) => Ok(Some(RegistryCredentials {
                username: username.clone(),
                password: password.clone(),
            })),
            (None, None) => Ok(None),
            _ => Err(Error::validation(
                "--source-user and --source-password must be given together",
            )),
        }
    }

    fn tasks(&self) -> Result<Vec<ImportTask>> {
        require(&[
            ("--target-registry", self.target_registry.as_deref()),
            ("--source-registry", self.source_registry.as_deref()),
        ])?;
        let target = self.target_registry.as_deref().unwrap_or_default();
        let source = self.source_registry.as_deref().unwrap_or_default();
        let credentials = self.credentials()?;

        let mut tasks = match &self.versions_file {
            Some(path) => ImportTask::from_declaration(
                &VersionDeclaration::load(path)?,
                source,
                target,
                credentials.as_ref(),
            ),
            None => Vec::new(),
        };
        for image in &self.images {
            tasks.push(ImportTask::new(
                parse_image_ref(image)?,
                source,
                target,
                credentials.clone(),
            ));
        }

        if tasks.is_empty() {
            return Err(Error::validation(
                "nothing to import: pass --versions-file or --image",
            ));
        }
        Ok(tasks)
    }
}

pub async fn run(args: ImportArgs) -> Result<()> {
    let tasks = args.tasks()?;

    if args.dry_run {
        info!("Dry run - would run {} imports:", tasks.len());
        for task in &tasks {
            println!("{}", task.display_command());
        }
        return Ok(());
    }

    let summary = ImportCoordinator::new(Arc::new(ProcessRunner))
        .with_max_parallel(args.max_parallel)
        .run(tasks)
        .await;

    print!("{}", summary.render());
    summary.ensure_success()?;
    info!("All {} images imported", summary.total());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Cli, Commands};
    use clap::Parser;

    fn parse(extra: &[&str]) -> ImportArgs {
        let mut argv = vec![
            "deckhand",
            "import",
            "--target-registry",
            "targetacr",
            "--source-registry",
            "src.example.io",
        ];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Import(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn credentials_must_come_in_pairs() {
        let args = parse(&["--source-user", "bot", "--image", "svc:v1"]);
        assert!(matches!(args.credentials(), Err(Error::Validation { .. })));

        let args = parse(&["--source-user", "bot", "--source-password", "pw"]);
        let creds = args.credentials().unwrap().unwrap();
        assert_eq!(creds.username, "bot");
    }

    #[test]
    fn tasks_combine_versions_file_and_images() {
        let dir = tempfile::tempdir().unwrap();
        let versions = dir.path().join("versions.txt");
        std::fs::write(&versions, "svc-a:v1\nsvc-b:v2\n").unwrap();

        let args = parse(&[
            "--versions-file",
            versions.to_str().unwrap(),
            "--image",
            "tools/migrate:v7",
        ]);
        let tasks = args.tasks().unwrap();
        let refs: Vec<_> = tasks.iter().map(|t| t.image_ref.as_str()).collect();
        assert_eq!(refs, vec!["svc-a:v1", "svc-b:v2", "tools/migrate:v7"]);
        assert!(tasks.iter().all(|t| t.target_registry == "targetacr"));
    }

    #[test]
    fn empty_task_list_is_rejected() {
        let args = parse(&[]);
        assert!(matches!(args.tasks(), Err(Error::Validation { .. })));
    }

    #[test]
    fn malformed_image_is_rejected() {
        let args = parse(&["--image", "no-tag"]);
        assert!(matches!(args.tasks(), Err(Error::Deploy(_))));
    }

    #[tokio::test]
    async fn dry_run_launches_nothing() {
        let args = parse(&[
            "--image",
            "svc:v1",
            "--source-user",
            "bot",
            "--source-password",
            "s3cret",
            "--dry-run",
        ]);
        run(args).await.unwrap();
    }
}
