//! Typed package manifests
//!
//! A [`Package`] is read once from `package.json` at the start of a run and
//! never mutated afterwards. Only the fields publishing needs are kept; all
//! other manifest fields are ignored.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use gantry_registry::Access;
use serde::{Deserialize, Serialize};

use crate::error::ManifestError;

/// Name of the manifest file inside every package directory
pub const MANIFEST_FILE: &str = "package.json";

/// The `publishConfig` block of a manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishConfig {
    /// Subdirectory to publish instead of the package root
    pub directory: Option<String>,
    /// Registry this package publishes to
    pub registry: Option<String>,
    /// Access level for the first publish of a scoped package
    pub access: Option<Access>,
    /// Dist-tag this package publishes under
    pub tag: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    name: Option<String>,
    version: Option<String>,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
    #[serde(default)]
    dev_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    peer_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    optional_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    publish_config: PublishConfig,
}

/// Kind of a declared dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DependencyKind {
    Production,
    Optional,
    Development,
    Peer,
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "dependencies"),
            Self::Optional => write!(f, "optionalDependencies"),
            Self::Development => write!(f, "devDependencies"),
            Self::Peer => write!(f, "peerDependencies"),
        }
    }
}

/// A workspace package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    /// Package name, unique within the workspace
    pub name: String,
    /// Version to publish
    pub version: String,
    /// Absolute package directory
    pub location: PathBuf,
    /// Whether the package must never be published
    pub private: bool,
    pub dependencies: BTreeMap<String, String>,
    pub dev_dependencies: BTreeMap<String, String>,
    pub peer_dependencies: BTreeMap<String, String>,
    pub optional_dependencies: BTreeMap<String, String>,
    /// Per-package publish overrides
    pub publish_config: PublishConfig,
}

impl Package {
    /// Read and validate the manifest in `location`
    pub fn load(location: &Path) -> Result<Self, ManifestError> {
        let path = location.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path).map_err(|source| ManifestError::Read {
            path: path.clone(),
            source,
        })?;
        Self::parse(location, &path, &content)
    }

    /// Parse manifest JSON for a package rooted at `location`
    pub fn from_json(location: impl Into<PathBuf>, content: &str) -> Result<Self, ManifestError> {
        let location = location.into();
        let path = location.join(MANIFEST_FILE);
        Self::parse(&location, &path, content)
    }

    fn parse(location: &Path, path: &Path, content: &str) -> Result<Self, ManifestError> {
        let raw: RawManifest =
            serde_json::from_str(content).map_err(|source| ManifestError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let name = raw
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| ManifestError::MissingField {
                path: path.to_path_buf(),
                field: "name",
            })?;
        let version = raw
            .version
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ManifestError::MissingField {
                path: path.to_path_buf(),
                field: "version",
            })?;

        semver::Version::parse(&version).map_err(|e| ManifestError::InvalidVersion {
            name: name.clone(),
            version: version.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            name,
            version,
            location: location.to_path_buf(),
            private: raw.private,
            dependencies: raw.dependencies,
            dev_dependencies: raw.dev_dependencies,
            peer_dependencies: raw.peer_dependencies,
            optional_dependencies: raw.optional_dependencies,
            publish_config: raw.publish_config,
        })
    }

    /// Copy of this package at another version
    pub fn with_version(&self, version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..self.clone()
        }
    }

    /// Whether the version carries a prerelease identifier
    pub fn is_prerelease(&self) -> bool {
        semver::Version::parse(&self.version)
            .map(|v| !v.pre.is_empty())
            .unwrap_or(false)
    }

    /// Declared dependencies of one kind
    pub fn declared(&self, kind: DependencyKind) -> &BTreeMap<String, String> {
        match kind {
            DependencyKind::Production => &self.dependencies,
            DependencyKind::Optional => &self.optional_dependencies,
            DependencyKind::Development => &self.dev_dependencies,
            DependencyKind::Peer => &self.peer_dependencies,
        }
    }
}
