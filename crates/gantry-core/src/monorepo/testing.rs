//! Recording fakes for the registry, packer and prompter used by tests

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gantry_registry::{
    Access, OtpPrompter, Permission, PublishOptions as UploadOptions, RegistryClient,
    RegistryError, RegistrySession, Result, TagSupport, TwoFactorMode,
};
use url::Url;

use crate::error::PackageError;

use super::manifest::Package;
use super::pack::{PackedArchive, Packer};

/// File name the fake packer gives a package's tarball
pub fn archive_name(package: &str) -> String {
    format!("{}.tgz", package.trim_start_matches('@').replace('/', "-"))
}

/// One recorded upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub archive: String,
    pub registry: String,
    pub tag: String,
    pub otp: Option<String>,
    pub access: Option<Access>,
    pub git_head: Option<String>,
}

pub struct RecordingRegistry {
    user: Option<String>,
    two_factor: TwoFactorMode,
    required_otp: Option<String>,
    permissions: HashMap<String, Permission>,
    published: Mutex<HashMap<String, Vec<String>>>,
    failing_archives: HashSet<String>,
    calls: Mutex<Vec<String>>,
    uploads: Mutex<Vec<Upload>>,
}

impl RecordingRegistry {
    pub fn new() -> Self {
        Self {
            user: None,
            two_factor: TwoFactorMode::Disabled,
            required_otp: None,
            permissions: HashMap::new(),
            published: Mutex::new(HashMap::new()),
            failing_archives: HashSet::new(),
            calls: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    /// Require `code` on every write
    pub fn with_required_otp(mut self, code: &str) -> Self {
        self.two_factor = TwoFactorMode::AuthAndWrites;
        self.required_otp = Some(code.to_string());
        self
    }

    pub fn with_permission(mut self, package: &str, permission: &str) -> Self {
        self.permissions
            .insert(package.to_string(), Permission::parse(permission));
        self
    }

    /// Make uploads of `package` fail with a server error
    pub fn failing_upload(mut self, package: &str) -> Self {
        self.failing_archives.insert(archive_name(package));
        self
    }

    pub fn set_published(&self, package: &str, versions: &[&str]) {
        self.published.lock().unwrap().insert(
            package.to_string(),
            versions.iter().map(|v| v.to_string()).collect(),
        );
    }

    /// Every call, in the order it arrived
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// `"<registry> <package>"` for every version lookup
    pub fn version_lookups(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix("versions ").map(str::to_string))
            .collect()
    }

    /// `add`/`remove` dist-tag calls
    pub fn tag_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with("add ") || c.starts_with("remove "))
            .collect()
    }

    /// Uploads the registry accepted
    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_otp(&self, otp: Option<&str>) -> Result<()> {
        match (self.required_otp.as_deref(), otp) {
            (None, _) => Ok(()),
            (Some(_), None) => Err(RegistryError::OtpRequired),
            (Some(required), Some(given)) if required == given => Ok(()),
            (Some(_), Some(_)) => Err(RegistryError::OtpRejected),
        }
    }
}

#[async_trait]
impl RegistryClient for RecordingRegistry {
    async fn whoami(&self, registry: &Url) -> Result<Option<String>> {
        self.record(format!("whoami {}", registry));
        Ok(self.user.clone())
    }

    async fn two_factor_mode(&self, _registry: &Url) -> Result<TwoFactorMode> {
        self.record("two-factor".to_string());
        Ok(self.two_factor)
    }

    async fn package_permissions(
        &self,
        _registry: &Url,
        username: &str,
    ) -> Result<HashMap<String, Permission>> {
        self.record(format!("permissions {}", username));
        Ok(self.permissions.clone())
    }

    async fn published_versions(&self, registry: &Url, package: &str) -> Result<Vec<String>> {
        self.record(format!("versions {} {}", registry, package));
        match self.published.lock().unwrap().get(package) {
            Some(versions) => Ok(versions.clone()),
            None => Err(RegistryError::ApiError {
                status: 404,
                message: "Not found".to_string(),
            }),
        }
    }

    async fn publish(&self, tarball: &Path, options: &UploadOptions) -> Result<()> {
        let archive = tarball
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_default();
        self.record(format!("publish {} {}", archive, options.tag));
        self.check_otp(options.otp.as_deref())?;

        if self.failing_archives.contains(&archive) {
            return Err(RegistryError::ApiError {
                status: 500,
                message: "Internal Server Error".to_string(),
            });
        }

        self.uploads.lock().unwrap().push(Upload {
            archive,
            registry: options.registry.to_string(),
            tag: options.tag.clone(),
            otp: options.otp.clone(),
            access: options.access,
            git_head: options.git_head.clone(),
        });
        Ok(())
    }
}

#[async_trait]
impl TagSupport for RecordingRegistry {
    async fn add_tag(
        &self,
        _registry: &Url,
        package: &str,
        version: &str,
        tag: &str,
        otp: Option<&str>,
    ) -> Result<()> {
        self.record(format!("add {}@{} {}", package, version, tag));
        self.check_otp(otp)
    }

    async fn remove_tag(
        &self,
        _registry: &Url,
        package: &str,
        tag: &str,
        otp: Option<&str>,
    ) -> Result<()> {
        self.record(format!("remove {} {}", package, tag));
        self.check_otp(otp)
    }
}

/// Packer that writes nothing and tracks how many packs overlap
pub struct FakePacker {
    failing: HashSet<String>,
    delay: Duration,
    packed: Mutex<Vec<(String, PathBuf)>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakePacker {
    pub fn new() -> Self {
        Self {
            failing: HashSet::new(),
            delay: Duration::ZERO,
            packed: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self, package: &str) -> Self {
        self.failing.insert(package.to_string());
        self
    }

    pub fn with_delay_ms(mut self, millis: u64) -> Self {
        self.delay = Duration::from_millis(millis);
        self
    }

    /// `(package, contents)` for every pack call
    pub fn packed(&self) -> Vec<(String, PathBuf)> {
        self.packed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Packer for FakePacker {
    async fn pack(&self, package: &Package, contents: &Path) -> std::result::Result<PackedArchive, PackageError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.packed
            .lock()
            .unwrap()
            .push((package.name.clone(), contents.to_path_buf()));

        if self.failing.contains(&package.name) {
            return Err(PackageError::Pack {
                package: package.name.clone(),
                message: "prepack script failed".to_string(),
            });
        }

        Ok(PackedArchive {
            path: PathBuf::from("/packed").join(archive_name(&package.name)),
            integrity: None,
            size: Some(512),
        })
    }
}

/// Hands out scripted codes in order
pub struct ScriptedPrompter {
    codes: Mutex<Vec<String>>,
    pub calls: AtomicUsize,
}

impl ScriptedPrompter {
    pub fn new(codes: &[&str]) -> Self {
        Self {
            codes: Mutex::new(codes.iter().rev().map(|c| c.to_string()).collect()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl OtpPrompter for ScriptedPrompter {
    async fn prompt(&self, _message: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.codes
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| RegistryError::Prompt("no scripted code left".to_string()))
    }
}

/// Session against the canonical registry
pub fn session(
    client: Arc<RecordingRegistry>,
    prompter: Arc<ScriptedPrompter>,
    cli_otp: Option<&str>,
) -> Arc<RegistrySession> {
    Arc::new(
        RegistrySession::new(client, prompter, None, cli_otp.map(str::to_string)).unwrap(),
    )
}
