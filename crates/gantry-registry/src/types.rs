//! Shared registry types

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{RegistryError, Result};

/// The canonical public npm registry
pub const CANONICAL_REGISTRY: &str = "https://registry.npmjs.org/";

/// Yarn's registry proxy, which mishandles authenticated writes
pub const YARN_REGISTRY: &str = "https://registry.yarnpkg.com";

/// Parse a registry URL and make sure its path ends with a slash so that
/// relative joins append instead of replacing the last segment.
pub fn normalize_registry(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw.trim()).map_err(|e| RegistryError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    if url.cannot_be_a_base() {
        return Err(RegistryError::InvalidUrl {
            url: raw.to_string(),
            reason: "not a hierarchical URL".to_string(),
        });
    }

    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Whether `url` points at the canonical public registry
pub fn is_canonical_registry(url: &Url) -> bool {
    normalize_registry(CANONICAL_REGISTRY)
        .map(|canonical| canonical == *url)
        .unwrap_or(false)
}

/// Escape a package name for use as a single URL path segment.
///
/// Scoped names keep their leading `@` but the separating slash is encoded,
/// which is what npm registries expect (`@scope%2fname`).
pub fn escape_package_name(name: &str) -> String {
    name.replace('/', "%2f")
}

/// Access level for newly published scoped packages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    /// Publicly installable
    Public,
    /// Only installable by members of the scope
    Restricted,
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::Restricted => write!(f, "restricted"),
        }
    }
}

impl std::str::FromStr for Access {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "restricted" => Ok(Self::Restricted),
            other => Err(format!(
                "invalid access level '{}', expected 'public' or 'restricted'",
                other
            )),
        }
    }
}

/// Permission a user holds on a package
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permission {
    ReadOnly,
    ReadWrite,
    Other(String),
}

impl Permission {
    /// Parse the permission strings returned by `-/user/<name>/package`
    pub fn parse(raw: &str) -> Self {
        match raw {
            "read-only" => Self::ReadOnly,
            "read-write" => Self::ReadWrite,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether this permission allows publishing
    pub fn can_publish(&self) -> bool {
        matches!(self, Self::ReadWrite)
    }
}

/// Two-factor authentication mode reported for the current user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwoFactorMode {
    /// 2FA is off, or enrollment is still pending
    Disabled,
    /// 2FA is only required to log in
    AuthOnly,
    /// 2FA is required for logins and every write
    AuthAndWrites,
}

impl TwoFactorMode {
    /// Whether publish and dist-tag writes need a one-time password
    pub fn requires_otp_for_writes(&self) -> bool {
        matches!(self, Self::AuthAndWrites)
    }
}

/// Options for a single publish request
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Registry to publish to
    pub registry: Url,
    /// One-time password, if the session acquired one
    pub otp: Option<String>,
    /// Access level, if overridden
    pub access: Option<Access>,
    /// Dist-tag the version is published under
    pub tag: String,
    /// Commit recorded as `gitHead` in the published manifest
    pub git_head: Option<String>,
}

impl PublishOptions {
    /// Create options for publishing under `tag`
    pub fn new(registry: Url, tag: impl Into<String>) -> Self {
        Self {
            registry,
            otp: None,
            access: None,
            tag: tag.into(),
            git_head: None,
        }
    }

    /// Attach a one-time password
    pub fn with_otp(mut self, otp: Option<String>) -> Self {
        self.otp = otp;
        self
    }

    /// Set the access level
    pub fn with_access(mut self, access: Option<Access>) -> Self {
        self.access = access;
        self
    }

    /// Record the commit the package was built from
    pub fn with_git_head(mut self, git_head: Option<String>) -> Self {
        self.git_head = git_head;
        self
    }
}
