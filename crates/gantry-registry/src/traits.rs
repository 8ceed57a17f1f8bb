//! Registry client traits

use std::collections::HashMap;
use std::path::Path;

use url::Url;

use crate::error::Result;
use crate::types::{Permission, PublishOptions, TwoFactorMode};

/// Trait for npm-compatible registries
///
/// Every call names the registry explicitly so that packages with a
/// `publishConfig.registry` override can share one client.
#[async_trait::async_trait]
pub trait RegistryClient: TagSupport + Send + Sync {
    /// Username of the authenticated principal, `None` when anonymous
    async fn whoami(&self, registry: &Url) -> Result<Option<String>>;

    /// Two-factor mode configured for the authenticated principal
    async fn two_factor_mode(&self, registry: &Url) -> Result<TwoFactorMode>;

    /// Packages `username` holds permissions on, keyed by package name
    async fn package_permissions(
        &self,
        registry: &Url,
        username: &str,
    ) -> Result<HashMap<String, Permission>>;

    /// Versions of `package` already present on the registry
    async fn published_versions(&self, registry: &Url, package: &str) -> Result<Vec<String>>;

    /// Upload a packed tarball
    async fn publish(&self, tarball: &Path, options: &PublishOptions) -> Result<()>;
}

/// Trait for dist-tag management
#[async_trait::async_trait]
pub trait TagSupport: Send + Sync {
    /// Point `tag` at `package@version`
    async fn add_tag(
        &self,
        registry: &Url,
        package: &str,
        version: &str,
        tag: &str,
        otp: Option<&str>,
    ) -> Result<()>;

    /// Remove `tag` from `package`
    async fn remove_tag(
        &self,
        registry: &Url,
        package: &str,
        tag: &str,
        otp: Option<&str>,
    ) -> Result<()>;
}
