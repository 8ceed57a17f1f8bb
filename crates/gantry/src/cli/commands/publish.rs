//! Publish CLI command
//!
//! Publishes every workspace package with a version ready to go out, in
//! dependency order, after the confirmation and registry pre-flight checks.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, ValueEnum};
use console::style;
use tracing::{debug, info};

use gantry_core::config::{load_config_or_default, validate_tag, Config, LATEST_TAG};
use gantry_core::monorepo::{
    Confirmer, CyclePolicy, EdgeKindPolicy, FailureStrategy, NpmPacker, PackageDiscovery,
    PublishOptions, PublishOrchestrator, PublishOutcome, PublishReport, TaggedAtHead,
    UnpublishedVersions, UpdateSource, Workspace,
};
use gantry_core::ConfigError;
use gantry_registry::{
    Access, NonInteractivePrompter, NpmConfig, NpmRegistry, OtpPrompter, RegistryClient,
    RegistrySession,
};

use crate::cli::output;
use crate::cli::progress::{publish_bar, ProgressReporter};
use crate::cli::prompt::{NoTerminalConfirmer, TerminalConfirmer, TerminalOtpPrompter};
use crate::cli::{Cli, OutputFormat};

/// Where the versions to publish come from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum VersionSource {
    /// Packages whose release tag points at HEAD
    #[default]
    FromGit,
    /// Manifest versions not yet on the registry
    FromPackage,
}

/// Access level for scoped packages
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AccessLevel {
    Public,
    Restricted,
}

impl From<AccessLevel> for Access {
    fn from(level: AccessLevel) -> Self {
        match level {
            AccessLevel::Public => Access::Public,
            AccessLevel::Restricted => Access::Restricted,
        }
    }
}

/// Publish changed packages to the registry
#[derive(Debug, Args)]
pub struct PublishCommand {
    /// Where the versions to publish come from (default: from-git)
    #[arg(value_enum)]
    pub source: Option<VersionSource>,

    /// Dependency kinds that order the publish: dependencies or all
    #[arg(long)]
    pub graph_type: Option<String>,

    /// Fail instead of breaking dependency cycles
    #[arg(long)]
    pub reject_cycles: bool,

    /// One-time password for registries with two-factor auth
    #[arg(long, env = "NPM_CONFIG_OTP", hide_env_values = true)]
    pub otp: Option<String>,

    /// Registry to publish to
    #[arg(long)]
    pub registry: Option<String>,

    /// Skip the publish permission check
    #[arg(long)]
    pub no_verify_access: bool,

    /// Subdirectory of every package to publish from
    #[arg(long)]
    pub contents: Option<PathBuf>,

    /// Publish nothing (deprecated, use `gantry version`)
    #[arg(long)]
    pub skip_npm: bool,

    /// Commit recorded as gitHead in the published manifests
    #[arg(long)]
    pub git_head: Option<String>,

    /// Dist-tag for every package
    #[arg(long)]
    pub dist_tag: Option<String>,

    /// Dist-tag for prerelease versions
    #[arg(long)]
    pub pre_dist_tag: Option<String>,

    /// Tag a non-latest publish lands on before it is moved
    #[arg(long)]
    pub temp_tag: Option<String>,

    /// Access level for scoped packages
    #[arg(long, value_enum)]
    pub access: Option<AccessLevel>,

    /// Packages published at once within a batch
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// After a failure: abort, skip-dependents or continue
    #[arg(long)]
    pub failure_policy: Option<String>,

    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,

    #[arg(long, hide = true, num_args = 0..=1)]
    pub scope: Option<Option<String>>,

    #[arg(long, hide = true, num_args = 0..=1)]
    pub since: Option<Option<String>>,
}

impl PublishCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        self.check_arguments()?;

        let root = std::env::current_dir()?;
        let (config, config_path) = load_config_or_default(&root)?;
        if let Some(path) = &config_path {
            debug!(path = %path.display(), "using config file");
        }
        let options = self.options(&config)?;

        info!(source = ?self.source(), root = %root.display(), "executing publish command");
        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(self.run(cli, &root, &config, options))
    }

    fn source(&self) -> VersionSource {
        self.source.unwrap_or_default()
    }

    /// Reject flags this command refuses to honour
    fn check_arguments(&self) -> Result<(), ConfigError> {
        if self.scope.is_some() {
            return Err(ConfigError::UnknownArgument("scope".to_string()));
        }
        if self.since.is_some() {
            return Err(ConfigError::UnknownArgument("since".to_string()));
        }
        if self.git_head.is_some() && self.source() != VersionSource::FromPackage {
            return Err(ConfigError::GitHeadRequiresFromPackage);
        }
        Ok(())
    }

    /// Config file values with command-line flags on top
    fn options(&self, config: &Config) -> anyhow::Result<PublishOptions> {
        let mut options = PublishOptions::from_config(&config.publish)?;

        if let Some(graph_type) = &self.graph_type {
            options.graph_type = EdgeKindPolicy::from_str(graph_type)?;
        }
        if self.reject_cycles {
            options.cycle_policy = CyclePolicy::Reject;
        }
        if self.no_verify_access {
            options.verify_access = false;
        }
        if let Some(contents) = &self.contents {
            options.contents = Some(contents.clone());
        }
        if let Some(tag) = &self.dist_tag {
            validate_tag("--dist-tag", tag)?;
            options.dist_tag = Some(tag.clone());
        }
        if let Some(tag) = &self.pre_dist_tag {
            validate_tag("--pre-dist-tag", tag)?;
            options.pre_dist_tag = Some(tag.clone());
        }
        if let Some(tag) = &self.temp_tag {
            validate_tag("--temp-tag", tag)?;
            if tag == LATEST_TAG {
                return Err(invalid("--temp-tag", "temporary tag cannot be 'latest'").into());
            }
            options.temp_tag = tag.clone();
        }
        if let Some(access) = self.access {
            options.access = Some(access.into());
        }
        if let Some(concurrency) = self.concurrency {
            if concurrency == 0 {
                return Err(invalid("--concurrency", "must be at least 1").into());
            }
            options.concurrency = concurrency;
        }
        if let Some(policy) = &self.failure_policy {
            options.failure_strategy =
                FailureStrategy::from_str(policy).map_err(|message| invalid("--failure-policy", message))?;
        }

        options.skip_npm = self.skip_npm;
        options.yes = self.yes;
        options.git_head = self.git_head.clone();
        Ok(options)
    }

    async fn run(
        &self,
        cli: &Cli,
        root: &Path,
        config: &Config,
        options: PublishOptions,
    ) -> anyhow::Result<()> {
        let workspace = Workspace::detect(root)?
            .with_context(|| format!("No workspace found in {}", root.display()))?
            .with_patterns(config.workspace.packages.clone());
        let packages = PackageDiscovery::new(workspace).discover()?;

        let text = cli.format == OutputFormat::Text && !cli.quiet;
        let interactive = console::user_attended() && console::user_attended_stderr();
        let bar = publish_bar(text);

        let client: Arc<dyn RegistryClient> = Arc::new(NpmRegistry::new(NpmConfig::load()?));
        let prompter: Arc<dyn OtpPrompter> = if interactive {
            Arc::new(TerminalOtpPrompter::new(bar.clone()))
        } else {
            Arc::new(NonInteractivePrompter)
        };
        let registry = self
            .registry
            .clone()
            .or_else(|| config.publish.registry.clone());
        let session = Arc::new(RegistrySession::new(
            client.clone(),
            prompter,
            registry.as_deref(),
            self.otp.clone(),
        )?);

        if text {
            for notice in session.notices() {
                for line in notice.messages() {
                    if notice.is_warning() {
                        output::warning(line);
                    } else {
                        output::info(line);
                    }
                }
            }
        }

        let source: Box<dyn UpdateSource> = match self.source() {
            VersionSource::FromGit => Box::new(TaggedAtHead::new(root)),
            VersionSource::FromPackage => Box::new(UnpublishedVersions::new(
                client.clone(),
                session.registry().clone(),
            )),
        };

        let confirmer: Arc<dyn Confirmer> = if interactive {
            Arc::new(TerminalConfirmer)
        } else {
            Arc::new(NoTerminalConfirmer)
        };

        let pack_dir = tempfile::Builder::new().prefix("gantry-pack-").tempdir()?;
        let orchestrator =
            PublishOrchestrator::new(options, session, Arc::new(NpmPacker::new(pack_dir.path())))
                .with_confirmer(confirmer)
                .with_callback(ProgressReporter::new(bar.clone()));

        let outcome = orchestrator.run(&packages, source.as_ref()).await;
        bar.finish_and_clear();
        report(cli, outcome?)
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Short status for JSON output
fn outcome_status(outcome: &PublishOutcome) -> &'static str {
    match outcome {
        PublishOutcome::HandOffToVersioning => "skipped",
        PublishOutcome::NothingToPublish => "nothing-to-publish",
        PublishOutcome::Declined => "declined",
        PublishOutcome::Completed(report) if report.success => "published",
        PublishOutcome::Completed(_) => "failed",
    }
}

fn report(cli: &Cli, outcome: PublishOutcome) -> anyhow::Result<()> {
    if cli.format == OutputFormat::Json {
        let json = match &outcome {
            PublishOutcome::Completed(report) => serde_json::json!({
                "status": outcome_status(&outcome),
                "report": report,
            }),
            other => serde_json::json!({ "status": outcome_status(other) }),
        };
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else if !cli.quiet {
        match &outcome {
            PublishOutcome::HandOffToVersioning => {
                output::warning("Instead of --skip-npm, call `gantry version` directly")
            }
            PublishOutcome::NothingToPublish => output::success("No changed packages to publish"),
            PublishOutcome::Declined => output::info("Publish cancelled"),
            PublishOutcome::Completed(report) => print_summary(report),
        }
    }

    match outcome {
        PublishOutcome::Completed(report) if !report.success => {
            anyhow::bail!(failure_message(&report))
        }
        _ => Ok(()),
    }
}

fn print_summary(report: &PublishReport) {
    if !report.cycles.is_empty() {
        output::warning("Dependency cycles detected, you should fix these!");
        for cycle in &report.cycles {
            println!("    {}", style(cycle).dim());
        }
    }

    let published = report.successful();
    if !published.is_empty() {
        println!();
        println!("{}", output::header("Successfully published:"));
        for result in &published {
            println!(
                " - {} {}",
                output::package_version(&result.package, &result.version),
                output::tag_style().apply_to(result.dist_tag.as_deref().unwrap_or(LATEST_TAG))
            );
        }
    }

    let failed = report.failed();
    if !failed.is_empty() {
        println!();
        println!("{}", output::header("Failed:"));
        for result in &failed {
            println!(
                " - {}: {}",
                result.package,
                style(result.error.as_deref().unwrap_or("unknown error")).red()
            );
        }
    }

    if !report.skipped.is_empty() {
        println!();
        println!("{}", output::header("Skipped:"));
        for skipped in &report.skipped {
            println!(" - {}: {}", skipped.name, style(&skipped.reason).yellow());
        }
    }

    println!();
    if report.success {
        output::success(&format!(
            "Published {} package(s) in {:.1}s",
            published.len(),
            report.total_duration.as_secs_f64()
        ));
    }
}

fn failure_message(report: &PublishReport) -> String {
    let failed = report.failed().len();
    if report.aborted {
        format!(
            "Publishing aborted after {} failure(s), {} package(s) not attempted",
            failed,
            report.skipped.len()
        )
    } else {
        format!(
            "{} package(s) failed to publish, {} skipped",
            failed,
            report.skipped.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Commands;
    use clap::Parser;
    use gantry_core::monorepo::PublishPlan;
    use std::time::Duration;

    fn parse(args: &[&str]) -> PublishCommand {
        let argv = ["gantry", "publish"].iter().chain(args.iter()).copied();
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Publish(cmd) => cmd,
        }
    }

    #[test]
    fn test_scope_and_since_are_rejected() {
        let err = parse(&["--scope", "@acme/*"]).check_arguments().unwrap_err();
        assert_eq!(err.to_string(), "Unknown argument: scope");

        let err = parse(&["--since"]).check_arguments().unwrap_err();
        assert_eq!(err.to_string(), "Unknown argument: since");
    }

    #[test]
    fn test_git_head_requires_from_package() {
        let err = parse(&["--git-head", "deadbeef"]).check_arguments().unwrap_err();
        assert_eq!(
            err.to_string(),
            "--git-head is only allowed with 'from-package' positional"
        );

        let err = parse(&["from-git", "--git-head", "deadbeef"])
            .check_arguments()
            .unwrap_err();
        assert!(matches!(err, ConfigError::GitHeadRequiresFromPackage));

        assert!(parse(&["from-package", "--git-head", "deadbeef"])
            .check_arguments()
            .is_ok());
    }

    #[test]
    fn test_default_source_is_from_git() {
        assert_eq!(parse(&[]).source(), VersionSource::FromGit);
        assert_eq!(parse(&["from-package"]).source(), VersionSource::FromPackage);
    }

    #[test]
    fn test_invalid_graph_type_names_the_value() {
        let err = parse(&["--graph-type", "poopy-pants"])
            .options(&Config::default())
            .unwrap_err();
        assert!(err.to_string().contains("poopy-pants"));
    }

    #[test]
    fn test_flags_override_config() {
        let mut config = Config::default();
        config.publish.concurrency = 2;
        config.publish.failure_policy = "continue".to_string();
        config.publish.dist_tag = Some("next".to_string());
        config.publish.verify_access = true;

        let options = parse(&[]).options(&config).unwrap();
        assert_eq!(options.concurrency, 2);
        assert_eq!(options.failure_strategy, FailureStrategy::ContinueAll);
        assert_eq!(options.dist_tag.as_deref(), Some("next"));
        assert!(options.verify_access);
        assert!(!options.yes);

        let options = parse(&[
            "--concurrency",
            "8",
            "--failure-policy",
            "skip-dependents",
            "--dist-tag",
            "beta",
            "--no-verify-access",
            "--graph-type",
            "all",
            "--reject-cycles",
            "--access",
            "restricted",
            "--contents",
            "dist",
            "-y",
        ])
        .options(&config)
        .unwrap();
        assert_eq!(options.concurrency, 8);
        assert_eq!(options.failure_strategy, FailureStrategy::SkipDependents);
        assert_eq!(options.dist_tag.as_deref(), Some("beta"));
        assert!(!options.verify_access);
        assert_eq!(options.graph_type, EdgeKindPolicy::All);
        assert_eq!(options.cycle_policy, CyclePolicy::Reject);
        assert_eq!(options.access, Some(Access::Restricted));
        assert_eq!(options.contents, Some(PathBuf::from("dist")));
        assert!(options.yes);
    }

    #[test]
    fn test_bad_flag_values() {
        let config = Config::default();
        assert!(parse(&["--temp-tag", "latest"]).options(&config).is_err());
        assert!(parse(&["--concurrency", "0"]).options(&config).is_err());
        assert!(parse(&["--failure-policy", "retry"]).options(&config).is_err());
        assert!(parse(&["--dist-tag", " "]).options(&config).is_err());
    }

    #[test]
    fn test_outcome_status_and_failure_message() {
        let report = PublishReport {
            packages: vec![],
            skipped: vec![],
            plan: PublishPlan::default(),
            cycles: vec![],
            ignored_edges: vec![],
            total_duration: Duration::ZERO,
            success: false,
            aborted: true,
        };
        assert_eq!(
            failure_message(&report),
            "Publishing aborted after 0 failure(s), 0 package(s) not attempted"
        );
        assert_eq!(outcome_status(&PublishOutcome::Completed(report)), "failed");
        assert_eq!(
            outcome_status(&PublishOutcome::NothingToPublish),
            "nothing-to-publish"
        );
    }
}
