//! Coordinated publishing for workspaces
//!
//! [`PublishOrchestrator::run`] is the whole publish command minus its CLI:
//! collect updates, build and linearize the graph, schedule batches, confirm,
//! verify access, then drive every package through pack, upload and dist-tag
//! with bounded concurrency inside each batch.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_registry::{
    normalize_registry, Access, AccessValidator, PublishOptions as UploadOptions, RegistryError,
    RegistrySession,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::{self, DEFAULT_CONCURRENCY, DEFAULT_TEMP_TAG, LATEST_TAG};
use crate::error::{ConfigError, PackageError, Result};

use super::contents::ContentResolver;
use super::cycles::{Cycle, CyclePolicy, CycleResolver};
use super::graph::{EdgeKindPolicy, PackageGraph};
use super::manifest::Package;
use super::pack::Packer;
use super::schedule::{PublishPlan, PublishScheduler};
use super::versioning::{PackageUpdate, UpdateSource};

/// Question asked before anything is published
pub const CONFIRM_PROMPT: &str = "Are you sure you want to publish these packages?";

/// What happens to the rest of the run after a package fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureStrategy {
    /// Finish the current batch, start no further batches
    #[default]
    AbortRemainingBatches,
    /// Keep going, but skip packages whose dependency failed or was skipped
    SkipDependents,
    /// Publish everything regardless of failures
    ContinueAll,
}

impl FromStr for FailureStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "abort" | "abort-on-batch-failure" => Ok(Self::AbortRemainingBatches),
            "skip-dependents" => Ok(Self::SkipDependents),
            "continue" => Ok(Self::ContinueAll),
            other => Err(format!(
                "invalid failure policy '{}', expected 'abort', 'skip-dependents' or 'continue'",
                other
            )),
        }
    }
}

impl std::fmt::Display for FailureStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AbortRemainingBatches => write!(f, "abort"),
            Self::SkipDependents => write!(f, "skip-dependents"),
            Self::ContinueAll => write!(f, "continue"),
        }
    }
}

/// Step a package's pipeline reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PublishState {
    Pending,
    Packed,
    Uploaded,
    TagApplied,
    Done,
    Failed,
}

impl std::fmt::Display for PublishState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Packed => write!(f, "packed"),
            Self::Uploaded => write!(f, "uploaded"),
            Self::TagApplied => write!(f, "tag-applied"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Result of publishing a single package
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagePublishResult {
    /// Package name
    pub package: String,
    /// Version that was published
    pub version: String,
    /// Final pipeline state
    pub state: PublishState,
    /// Whether publishing succeeded
    pub success: bool,
    /// Dist-tag the version ended up under
    pub dist_tag: Option<String>,
    /// Error message if failed
    pub error: Option<String>,
    /// Time taken to publish
    pub duration: Duration,
    /// Registry the package was published to
    pub registry_url: Option<String>,
    /// When the upload was accepted
    pub published_at: Option<DateTime<Utc>>,
}

/// A package that never started
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedPackage {
    /// Package name
    pub name: String,
    /// Reason for skipping
    pub reason: SkipReason,
}

/// Reason why a package is skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// A dependency failed or was skipped
    DependencyFailed(String),
    /// An earlier batch had a failure
    BatchAborted,
    /// A failure made every further write pointless
    RunAborted,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DependencyFailed(dep) => write!(f, "dependency '{}' failed", dep),
            Self::BatchAborted => write!(f, "an earlier batch failed"),
            Self::RunAborted => write!(f, "run aborted"),
        }
    }
}

/// Summary of a publish run that got as far as publishing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishReport {
    /// Results for every package that started, in plan order
    pub packages: Vec<PackagePublishResult>,
    /// Packages that never started
    pub skipped: Vec<SkippedPackage>,
    /// Batches the run followed
    pub plan: PublishPlan,
    /// Cycles found in the graph
    pub cycles: Vec<Cycle>,
    /// Edges ignored to break those cycles, as `(package, dependency)`
    pub ignored_edges: Vec<(String, String)>,
    /// Total duration
    pub total_duration: Duration,
    /// Whether every package was published
    pub success: bool,
    /// Whether the run stopped early on a fatal error
    pub aborted: bool,
}

impl PublishReport {
    /// Get successfully published packages
    pub fn successful(&self) -> Vec<&PackagePublishResult> {
        self.packages.iter().filter(|p| p.success).collect()
    }

    /// Get failed packages
    pub fn failed(&self) -> Vec<&PackagePublishResult> {
        self.packages.iter().filter(|p| !p.success).collect()
    }
}

/// How a run ended when it did not error out
#[derive(Debug, Clone)]
pub enum PublishOutcome {
    /// `--skip-npm`: nothing was done, versioning should take over
    HandOffToVersioning,
    /// The update source reported nothing to publish
    NothingToPublish,
    /// The user declined the confirmation
    Declined,
    /// Packages were published, possibly with failures
    Completed(PublishReport),
}

/// Options for a publish run
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Dependency kinds that order the run
    pub graph_type: EdgeKindPolicy,
    /// What to do about dependency cycles
    pub cycle_policy: CyclePolicy,
    /// Subdirectory of every package to publish from
    pub contents: Option<PathBuf>,
    /// Check publish permissions before uploading
    pub verify_access: bool,
    /// Publish nothing and hand off to versioning
    pub skip_npm: bool,
    /// Dist-tag for every package
    pub dist_tag: Option<String>,
    /// Dist-tag for prerelease versions
    pub pre_dist_tag: Option<String>,
    /// Tag a non-latest publish lands on first
    pub temp_tag: String,
    /// Access level unless a package sets its own
    pub access: Option<Access>,
    /// Packages published at once within a batch
    pub concurrency: usize,
    /// Strategy for handling failures
    pub failure_strategy: FailureStrategy,
    /// Skip the confirmation
    pub yes: bool,
    /// Commit recorded as `gitHead`
    pub git_head: Option<String>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            graph_type: EdgeKindPolicy::default(),
            cycle_policy: CyclePolicy::default(),
            contents: None,
            verify_access: true,
            skip_npm: false,
            dist_tag: None,
            pre_dist_tag: None,
            temp_tag: DEFAULT_TEMP_TAG.to_string(),
            access: None,
            concurrency: DEFAULT_CONCURRENCY,
            failure_strategy: FailureStrategy::default(),
            yes: false,
            git_head: None,
        }
    }
}

impl PublishOptions {
    /// Options from the `[publish]` section of the config file
    pub fn from_config(config: &config::PublishConfig) -> Result<Self> {
        let failure_strategy = FailureStrategy::from_str(&config.failure_policy).map_err(|e| {
            ConfigError::InvalidValue {
                field: "publish.failure_policy".to_string(),
                message: e,
            }
        })?;

        Ok(Self {
            graph_type: EdgeKindPolicy::from_str(&config.graph_type)?,
            cycle_policy: if config.reject_cycles {
                CyclePolicy::Reject
            } else {
                CyclePolicy::WarnAndLinearize
            },
            contents: config.contents.as_ref().map(PathBuf::from),
            verify_access: config.verify_access,
            skip_npm: false,
            dist_tag: config.dist_tag.clone(),
            pre_dist_tag: config.pre_dist_tag.clone(),
            temp_tag: config.temp_tag.clone(),
            access: config.access,
            concurrency: config.concurrency,
            failure_strategy,
            yes: false,
            git_head: None,
        })
    }

    /// Dist-tag `package` should end up under
    pub fn dist_tag_for(&self, package: &Package) -> String {
        let non_empty = |tag: &Option<String>| tag.clone().filter(|t| !t.trim().is_empty());

        non_empty(&self.dist_tag)
            .or_else(|| non_empty(&package.publish_config.tag))
            .or_else(|| {
                if package.is_prerelease() {
                    non_empty(&self.pre_dist_tag)
                } else {
                    None
                }
            })
            .unwrap_or_else(|| LATEST_TAG.to_string())
    }

    /// Access level for `package`; its own `publishConfig.access` wins
    pub fn access_for(&self, package: &Package) -> Option<Access> {
        package.publish_config.access.or(self.access)
    }
}

/// Callback for publish events
pub trait PublishCallback: Send + Sync {
    /// Called once the plan is final, before the first package starts
    fn on_plan_ready(&self, _plan: &PublishPlan) {}

    /// Called before publishing a package
    fn on_publish_start(&self, package: &str, version: &str);

    /// Called after publishing a package
    fn on_publish_complete(&self, package: &str, result: &PackagePublishResult);

    /// Called when a package is skipped
    fn on_skip(&self, package: &str, reason: &SkipReason);
}

/// Registry that broadcasts publish events to multiple callbacks
#[derive(Clone, Default)]
pub struct PublishCallbackRegistry {
    callbacks: Vec<Arc<dyn PublishCallback>>,
}

impl PublishCallbackRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback
    pub fn register<C: PublishCallback + 'static>(&mut self, callback: C) {
        self.callbacks.push(Arc::new(callback));
    }

    /// Notify all callbacks that the plan is ready
    pub fn on_plan_ready(&self, plan: &PublishPlan) {
        for cb in &self.callbacks {
            cb.on_plan_ready(plan);
        }
    }

    /// Notify all callbacks that a publish is starting
    pub fn on_publish_start(&self, package: &str, version: &str) {
        for cb in &self.callbacks {
            cb.on_publish_start(package, version);
        }
    }

    /// Notify all callbacks that a publish completed
    pub fn on_publish_complete(&self, package: &str, result: &PackagePublishResult) {
        for cb in &self.callbacks {
            cb.on_publish_complete(package, result);
        }
    }

    /// Notify all callbacks that a package was skipped
    pub fn on_skip(&self, package: &str, reason: &SkipReason) {
        for cb in &self.callbacks {
            cb.on_skip(package, reason);
        }
    }

    /// Check if the registry has no callbacks
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

/// Asks whether to go ahead with a publish
#[async_trait]
pub trait Confirmer: Send + Sync {
    /// `true` to publish `packages`
    async fn confirm(&self, message: &str, packages: &[PackageUpdate]) -> Result<bool>;
}

/// Confirmer that always agrees
pub struct AutoConfirm;

#[async_trait]
impl Confirmer for AutoConfirm {
    async fn confirm(&self, _message: &str, _packages: &[PackageUpdate]) -> Result<bool> {
        Ok(true)
    }
}

/// Drives a publish run
pub struct PublishOrchestrator {
    options: PublishOptions,
    session: Arc<RegistrySession>,
    packer: Arc<dyn Packer>,
    confirmer: Arc<dyn Confirmer>,
    callbacks: PublishCallbackRegistry,
}

impl PublishOrchestrator {
    /// Create an orchestrator that confirms automatically
    pub fn new(options: PublishOptions, session: Arc<RegistrySession>, packer: Arc<dyn Packer>) -> Self {
        Self {
            options,
            session,
            packer,
            confirmer: Arc::new(AutoConfirm),
            callbacks: PublishCallbackRegistry::new(),
        }
    }

    /// Ask `confirmer` before publishing unless `yes` is set
    pub fn with_confirmer(mut self, confirmer: Arc<dyn Confirmer>) -> Self {
        self.confirmer = confirmer;
        self
    }

    /// Report progress to `callback`
    pub fn with_callback<C: PublishCallback + 'static>(mut self, callback: C) -> Self {
        self.callbacks.register(callback);
        self
    }

    /// Publish whatever `source` reports out of `packages`.
    ///
    /// Everything up to the first upload is all-or-nothing: graph, cycle,
    /// access and two-factor errors return `Err` before any package starts.
    /// Per-package failures after that end up in the report.
    #[instrument(skip_all, fields(source = source.name(), packages = packages.len()))]
    pub async fn run(&self, packages: &[Package], source: &dyn UpdateSource) -> Result<PublishOutcome> {
        if self.options.skip_npm {
            warn!("Instead of --skip-npm, call `gantry version` directly");
            return Ok(PublishOutcome::HandOffToVersioning);
        }

        let updates = source.collect(packages).await?;
        let to_publish = select_updates(packages, &updates);
        if to_publish.is_empty() {
            info!("No changed packages to publish");
            return Ok(PublishOutcome::NothingToPublish);
        }

        let graph = PackageGraph::build(&to_publish, self.options.graph_type)?;
        let resolution = CycleResolver::new(self.options.cycle_policy).resolve(graph)?;
        let plan = PublishScheduler::schedule(&resolution.graph)?;
        info!(packages = plan.total(), batches = plan.batches().len(), "publish plan ready");

        if !self.options.yes {
            let listing: Vec<PackageUpdate> = plan
                .iter()
                .filter_map(|name| resolution.graph.get(name))
                .map(|p| PackageUpdate::new(&p.name, &p.version))
                .collect();
            if !self.confirmer.confirm(CONFIRM_PROMPT, &listing).await? {
                info!("publish cancelled");
                return Ok(PublishOutcome::Declined);
            }
        }

        let names: Vec<&str> = plan.iter().collect();
        let access = AccessValidator::new(self.options.verify_access)
            .verify(&names, &self.session)
            .await?;
        debug!(?access, "access pre-flight finished");
        let two_factor = self.session.requires_two_factor().await?;
        debug!(two_factor, "two-factor pre-flight finished");

        self.callbacks.on_plan_ready(&plan);
        let report = self
            .execute(&resolution.graph, plan, resolution.cycles, resolution.ignored_edges)
            .await;
        Ok(PublishOutcome::Completed(report))
    }

    async fn execute(
        &self,
        graph: &PackageGraph,
        plan: PublishPlan,
        cycles: Vec<Cycle>,
        ignored_edges: Vec<(String, String)>,
    ) -> PublishReport {
        let start = Instant::now();
        let strategy = self.options.failure_strategy;
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let results: Arc<Mutex<Vec<PackagePublishResult>>> = Arc::new(Mutex::new(Vec::new()));
        let abort = Arc::new(AtomicBool::new(false));
        let context = Arc::new(JobContext {
            options: self.options.clone(),
            contents: ContentResolver::new(self.options.contents.clone()),
            session: self.session.clone(),
            packer: self.packer.clone(),
            callbacks: self.callbacks.clone(),
            abort: abort.clone(),
        });

        let mut unavailable: HashSet<String> = HashSet::new();
        let mut skipped: Vec<SkippedPackage> = Vec::new();
        let mut skip = |name: &str, reason: SkipReason, unavailable: &mut HashSet<String>| {
            debug!(package = %name, reason = %reason, "skipping package");
            self.callbacks.on_skip(name, &reason);
            unavailable.insert(name.to_string());
            skipped.push(SkippedPackage {
                name: name.to_string(),
                reason,
            });
        };

        for (index, batch) in plan.batches().iter().enumerate() {
            let stop = if abort.load(Ordering::SeqCst) {
                Some(SkipReason::RunAborted)
            } else if strategy == FailureStrategy::AbortRemainingBatches && !unavailable.is_empty() {
                Some(SkipReason::BatchAborted)
            } else {
                None
            };
            if let Some(reason) = stop {
                for name in batch {
                    skip(name, reason.clone(), &mut unavailable);
                }
                continue;
            }

            debug!(batch = index, packages = batch.len(), "starting batch");
            let seen = results.lock().await.len();
            let mut handles = Vec::new();

            for name in batch {
                let Some(package) = graph.get(name) else {
                    continue;
                };

                if strategy == FailureStrategy::SkipDependents {
                    let failed_dep = graph
                        .dependencies(name)
                        .into_iter()
                        .find(|dep| unavailable.contains(*dep));
                    if let Some(dep) = failed_dep {
                        skip(name, SkipReason::DependencyFailed(dep.to_string()), &mut unavailable);
                        continue;
                    }
                }

                let package = package.clone();
                let context = context.clone();
                let semaphore = semaphore.clone();
                let results = results.clone();

                let handle = tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return false;
                    };
                    if context.abort.load(Ordering::SeqCst) {
                        return false;
                    }
                    let result = context.publish_package(&package).await;
                    results.lock().await.push(result);
                    true
                });
                handles.push((name.clone(), handle));
            }

            for (name, handle) in handles {
                match handle.await {
                    Ok(true) => {}
                    Ok(false) => skip(&name, SkipReason::RunAborted, &mut unavailable),
                    Err(e) => {
                        let version = graph.get(&name).map(|p| p.version.clone()).unwrap_or_default();
                        warn!(package = %name, error = %e, "publish task panicked");
                        let result = PackagePublishResult {
                            package: name.clone(),
                            version,
                            state: PublishState::Failed,
                            success: false,
                            dist_tag: None,
                            error: Some(format!("Publish task panicked: {}", e)),
                            duration: Duration::ZERO,
                            registry_url: None,
                            published_at: None,
                        };
                        self.callbacks.on_publish_complete(&name, &result);
                        results.lock().await.push(result);
                    }
                }
            }

            for result in results.lock().await[seen..].iter().filter(|r| !r.success) {
                unavailable.insert(result.package.clone());
            }
        }

        let mut packages = std::mem::take(&mut *results.lock().await);
        let order: HashMap<&str, usize> = plan.iter().enumerate().map(|(i, n)| (n, i)).collect();
        packages.sort_by_key(|r| order.get(r.package.as_str()).copied().unwrap_or(usize::MAX));

        let aborted = abort.load(Ordering::SeqCst);
        let total_duration = start.elapsed();
        let success = !aborted && skipped.is_empty() && packages.iter().all(|r| r.success);

        info!(
            success,
            published = packages.iter().filter(|r| r.success).count(),
            failed = packages.iter().filter(|r| !r.success).count(),
            skipped = skipped.len(),
            duration_ms = total_duration.as_millis(),
            "publish complete"
        );

        PublishReport {
            packages,
            skipped,
            plan,
            cycles,
            ignored_edges,
            total_duration,
            success,
            aborted,
        }
    }
}

/// Packages from `packages` that `updates` names, at their new versions.
///
/// Workspace order is kept; private and unknown packages are dropped.
fn select_updates(packages: &[Package], updates: &[PackageUpdate]) -> Vec<Package> {
    let versions: HashMap<&str, &str> = updates
        .iter()
        .map(|u| (u.name.as_str(), u.version.as_str()))
        .collect();

    for update in updates {
        if !packages.iter().any(|p| p.name == update.name) {
            warn!(package = %update.name, "update names a package outside the workspace, ignoring");
        }
    }

    packages
        .iter()
        .filter_map(|package| {
            let version = versions.get(package.name.as_str())?;
            if package.private {
                info!(package = %package.name, "skipping private package");
                return None;
            }
            Some(package.with_version(*version))
        })
        .collect()
}

/// Everything a publish task needs, shared by `Arc`
struct JobContext {
    options: PublishOptions,
    contents: ContentResolver,
    session: Arc<RegistrySession>,
    packer: Arc<dyn Packer>,
    callbacks: PublishCallbackRegistry,
    abort: Arc<AtomicBool>,
}

impl JobContext {
    #[instrument(skip_all, fields(package = %package.name, version = %package.version))]
    async fn publish_package(&self, package: &Package) -> PackagePublishResult {
        let start = Instant::now();
        self.callbacks.on_publish_start(&package.name, &package.version);

        let dist_tag = self.options.dist_tag_for(package);
        let mut state = PublishState::Pending;
        let mut registry_url = None;
        let outcome = self
            .drive(package, &dist_tag, &mut state, &mut registry_url)
            .await;

        let result = match outcome {
            Ok(published_at) => {
                info!(tag = %dist_tag, "published");
                PackagePublishResult {
                    package: package.name.clone(),
                    version: package.version.clone(),
                    state,
                    success: true,
                    dist_tag: Some(dist_tag),
                    error: None,
                    duration: start.elapsed(),
                    registry_url,
                    published_at: Some(published_at),
                }
            }
            Err(e) => {
                warn!(reached = %state, error = %e, "package publish failed");
                if e.is_fatal() {
                    self.abort.store(true, Ordering::SeqCst);
                }
                PackagePublishResult {
                    package: package.name.clone(),
                    version: package.version.clone(),
                    state: PublishState::Failed,
                    success: false,
                    dist_tag: None,
                    error: Some(e.to_string()),
                    duration: start.elapsed(),
                    registry_url,
                    published_at: None,
                }
            }
        };

        self.callbacks.on_publish_complete(&package.name, &result);
        result
    }

    async fn drive(
        &self,
        package: &Package,
        dist_tag: &str,
        state: &mut PublishState,
        registry_url: &mut Option<String>,
    ) -> std::result::Result<DateTime<Utc>, PackageError> {
        let contents = self.contents.resolve_existing(package)?;
        let archive = self.packer.pack(package, &contents).await?;
        *state = PublishState::Packed;

        let registry = self.registry_for(package)?;
        *registry_url = Some(registry.to_string());

        let final_tag = dist_tag == LATEST_TAG;
        let upload_tag = if final_tag { dist_tag } else { self.options.temp_tag.as_str() };
        let upload = UploadOptions::new(registry.clone(), upload_tag)
            .with_access(self.options.access_for(package))
            .with_git_head(self.options.git_head.clone());

        let client = self.session.client();
        let path = archive.path.as_path();
        self.with_otp(package, |otp| {
            let options = upload.clone().with_otp(otp);
            async move { client.publish(path, &options).await }
        })
        .await
        .map_err(|e| e.into_package_error(package, |source| PackageError::Publish {
            package: package.name.clone(),
            source,
        }))?;
        let published_at = Utc::now();
        *state = PublishState::Uploaded;
        debug!(tag = %upload_tag, registry = %registry, "uploaded");

        if !final_tag {
            let temp_tag = self.options.temp_tag.as_str();
            let tag_error = |tag: &str| {
                let tag = tag.to_string();
                move |source| PackageError::DistTag {
                    package: package.name.clone(),
                    tag,
                    source,
                }
            };

            self.with_otp(package, |otp| {
                let registry = &registry;
                async move {
                    client
                        .add_tag(registry, &package.name, &package.version, dist_tag, otp.as_deref())
                        .await
                }
            })
            .await
            .map_err(|e| e.into_package_error(package, tag_error(dist_tag)))?;

            self.with_otp(package, |otp| {
                let registry = &registry;
                async move {
                    client
                        .remove_tag(registry, &package.name, temp_tag, otp.as_deref())
                        .await
                }
            })
            .await
            .map_err(|e| e.into_package_error(package, tag_error(temp_tag)))?;

            *state = PublishState::TagApplied;
            debug!(tag = %dist_tag, temp_tag = %temp_tag, "dist-tag moved");
        }

        *state = PublishState::Done;
        Ok(published_at)
    }

    fn registry_for(&self, package: &Package) -> std::result::Result<Url, PackageError> {
        match package.publish_config.registry.as_deref() {
            Some(raw) if !raw.trim().is_empty() => {
                normalize_registry(raw).map_err(|source| PackageError::Publish {
                    package: package.name.clone(),
                    source,
                })
            }
            _ => Ok(self.session.registry().clone()),
        }
    }

    /// Run a registry write, answering one OTP challenge.
    ///
    /// The first attempt carries the session's code, if any. A challenge is
    /// answered through the session once; a second challenge, or a failure to
    /// obtain a code, is an [`OtpFailure::Fatal`].
    async fn with_otp<F, Fut>(&self, package: &Package, mut call: F) -> std::result::Result<(), OtpFailure>
    where
        F: FnMut(Option<String>) -> Fut,
        Fut: Future<Output = gantry_registry::Result<()>>,
    {
        let mut otp = self.session.acquire_otp().await.map_err(OtpFailure::Fatal)?;
        let mut refreshed = false;

        loop {
            match call(otp.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_otp_challenge() && !refreshed => {
                    debug!(package = %package.name, error = %e, "registry asked for a one-time password");
                    refreshed = true;
                    let code = self
                        .session
                        .refresh_otp(otp.as_deref())
                        .await
                        .map_err(OtpFailure::Fatal)?;
                    otp = Some(code);
                }
                Err(e) if e.is_otp_challenge() => return Err(OtpFailure::Fatal(e)),
                Err(e) => return Err(OtpFailure::Call(e)),
            }
        }
    }
}

/// Why a write guarded by [`JobContext::with_otp`] failed
enum OtpFailure {
    /// No usable one-time password
    Fatal(RegistryError),
    /// The write itself failed
    Call(RegistryError),
}

impl OtpFailure {
    fn into_package_error(
        self,
        package: &Package,
        wrap: impl FnOnce(RegistryError) -> PackageError,
    ) -> PackageError {
        match self {
            Self::Fatal(source) => PackageError::Otp {
                package: package.name.clone(),
                source,
            },
            Self::Call(source) => wrap(source),
        }
    }
}
