//! In-memory registry and prompter used by this crate's tests

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::error::{RegistryError, Result};
use crate::session::OtpPrompter;
use crate::traits::{RegistryClient, TagSupport};
use crate::types::{Permission, PublishOptions, TwoFactorMode};

pub struct FakeRegistry {
    username: Option<String>,
    two_factor: TwoFactorMode,
    two_factor_status: Option<u16>,
    permissions: HashMap<String, Permission>,
    permissions_status: Option<u16>,
    whoami_registries: Mutex<Vec<String>>,
    pub whoami_calls: AtomicUsize,
    pub two_factor_calls: AtomicUsize,
    pub permission_calls: AtomicUsize,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self {
            username: None,
            two_factor: TwoFactorMode::Disabled,
            two_factor_status: None,
            permissions: HashMap::new(),
            permissions_status: None,
            whoami_registries: Mutex::new(Vec::new()),
            whoami_calls: AtomicUsize::new(0),
            two_factor_calls: AtomicUsize::new(0),
            permission_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_user(mut self, username: &str) -> Self {
        self.username = Some(username.to_string());
        self
    }

    pub fn with_two_factor(mut self, mode: TwoFactorMode) -> Self {
        self.two_factor = mode;
        self
    }

    pub fn with_two_factor_status(mut self, status: u16) -> Self {
        self.two_factor_status = Some(status);
        self
    }

    pub fn with_permission(mut self, package: &str, permission: &str) -> Self {
        self.permissions
            .insert(package.to_string(), Permission::parse(permission));
        self
    }

    pub fn with_permissions_status(mut self, status: u16) -> Self {
        self.permissions_status = Some(status);
        self
    }

    pub fn whoami_registries(&self) -> Vec<String> {
        self.whoami_registries.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn whoami(&self, registry: &Url) -> Result<Option<String>> {
        self.whoami_calls.fetch_add(1, Ordering::SeqCst);
        self.whoami_registries
            .lock()
            .unwrap()
            .push(registry.to_string());
        Ok(self.username.clone())
    }

    async fn two_factor_mode(&self, _registry: &Url) -> Result<TwoFactorMode> {
        self.two_factor_calls.fetch_add(1, Ordering::SeqCst);
        match self.two_factor_status {
            Some(status) => Err(RegistryError::ApiError {
                status,
                message: "unavailable".to_string(),
            }),
            None => Ok(self.two_factor),
        }
    }

    async fn package_permissions(
        &self,
        _registry: &Url,
        _username: &str,
    ) -> Result<HashMap<String, Permission>> {
        self.permission_calls.fetch_add(1, Ordering::SeqCst);
        match self.permissions_status {
            Some(status) => Err(RegistryError::ApiError {
                status,
                message: "unavailable".to_string(),
            }),
            None => Ok(self.permissions.clone()),
        }
    }

    async fn published_versions(&self, _registry: &Url, _package: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn publish(&self, _tarball: &Path, _options: &PublishOptions) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl TagSupport for FakeRegistry {
    async fn add_tag(
        &self,
        _registry: &Url,
        _package: &str,
        _version: &str,
        _tag: &str,
        _otp: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }

    async fn remove_tag(
        &self,
        _registry: &Url,
        _package: &str,
        _tag: &str,
        _otp: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Hands out scripted codes in order and counts how often it was asked
pub struct ScriptedPrompter {
    codes: Mutex<Vec<String>>,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl ScriptedPrompter {
    pub fn new(codes: &[&str]) -> Self {
        Self {
            codes: Mutex::new(codes.iter().rev().map(|c| c.to_string()).collect()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay_ms(mut self, millis: u64) -> Self {
        self.delay = Duration::from_millis(millis);
        self
    }
}

#[async_trait]
impl OtpPrompter for ScriptedPrompter {
    async fn prompt(&self, _message: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.codes
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| RegistryError::Prompt("no scripted code left".to_string()))
    }
}
