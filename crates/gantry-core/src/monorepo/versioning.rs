//! Sources of the versions a publish run releases
//!
//! Computing version numbers is not this crate's job. An [`UpdateSource`]
//! only reports which packages have a version ready to go out, and the
//! orchestrator publishes exactly those.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use gantry_registry::{normalize_registry, RegistryClient};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, instrument};
use url::Url;

use crate::error::{GantryError, Result};

use super::manifest::Package;

/// `v1.2.3`, the tag of a fixed-mode release
static FIXED_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^v?(?P<version>\d+\.\d+\.\d+(?:-[0-9A-Za-z.-]+)?(?:\+[0-9A-Za-z.-]+)?)$")
        .expect("Invalid regex")
});

/// `name@1.2.3` or `@scope/name@1.2.3`, the tag of an independent release
static PACKAGE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<name>@?[^@\s]+)@(?P<version>\d+\.\d+\.\d+\S*)$").expect("Invalid regex")
});

/// A package with a version ready to publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageUpdate {
    /// Package name
    pub name: String,
    /// Version to publish
    pub version: String,
}

impl PackageUpdate {
    /// Create an update
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Reports the next-version map for a run
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Short name shown in logs
    fn name(&self) -> &'static str;

    /// Packages among `packages` that have a version to publish
    async fn collect(&self, packages: &[Package]) -> Result<Vec<PackageUpdate>>;
}

/// A precomputed update list, as handed over by a versioning step
#[derive(Debug, Clone, Default)]
pub struct FixedUpdates {
    updates: Vec<PackageUpdate>,
}

impl FixedUpdates {
    /// Publish exactly `updates`
    pub fn new(updates: Vec<PackageUpdate>) -> Self {
        Self { updates }
    }
}

#[async_trait]
impl UpdateSource for FixedUpdates {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn collect(&self, _packages: &[Package]) -> Result<Vec<PackageUpdate>> {
        Ok(self.updates.clone())
    }
}

/// `from-package`: manifest versions the registry does not have yet
pub struct UnpublishedVersions {
    client: Arc<dyn RegistryClient>,
    registry: Url,
}

impl UnpublishedVersions {
    /// Compare against `registry` unless a package overrides it
    pub fn new(client: Arc<dyn RegistryClient>, registry: Url) -> Self {
        Self { client, registry }
    }

    fn registry_for(&self, package: &Package) -> Result<Url> {
        match package.publish_config.registry.as_deref() {
            Some(raw) if !raw.trim().is_empty() => Ok(normalize_registry(raw)?),
            _ => Ok(self.registry.clone()),
        }
    }
}

#[async_trait]
impl UpdateSource for UnpublishedVersions {
    fn name(&self) -> &'static str {
        "from-package"
    }

    #[instrument(skip_all, fields(packages = packages.len()))]
    async fn collect(&self, packages: &[Package]) -> Result<Vec<PackageUpdate>> {
        let mut updates = Vec::new();
        for package in packages.iter().filter(|p| !p.private) {
            let registry = self.registry_for(package)?;
            let published = match self.client.published_versions(&registry, &package.name).await {
                Ok(versions) => versions,
                Err(e) if e.status() == Some(404) => Vec::new(),
                Err(e) => return Err(e.into()),
            };

            if published.iter().any(|v| *v == package.version) {
                debug!(package = %package.name, version = %package.version, "already published");
                continue;
            }
            updates.push(PackageUpdate::new(&package.name, &package.version));
        }

        info!(count = updates.len(), "found unpublished package versions");
        Ok(updates)
    }
}

/// `from-git`: packages whose release tag points at `HEAD`
#[derive(Debug, Clone)]
pub struct TaggedAtHead {
    root: PathBuf,
}

impl TaggedAtHead {
    /// Read tags from the repository at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn head_tags(&self) -> Result<Vec<String>> {
        let output = Command::new("git")
            .args(["tag", "--points-at", "HEAD"])
            .current_dir(&self.root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| GantryError::Versioning(format!("Failed to run git: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GantryError::Versioning(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Match release tags against manifest versions.
///
/// `name@version` selects one package, `v1.2.3` selects every package at
/// that version. A tag whose version differs from the manifest is ignored.
pub fn updates_from_tags(tags: &[String], packages: &[Package]) -> Vec<PackageUpdate> {
    let mut updates: Vec<PackageUpdate> = Vec::new();
    let mut push = |package: &Package| {
        if !updates.iter().any(|u| u.name == package.name) {
            updates.push(PackageUpdate::new(&package.name, &package.version));
        }
    };

    for tag in tags {
        if let Some(caps) = FIXED_TAG.captures(tag) {
            let version = &caps["version"];
            packages
                .iter()
                .filter(|p| !p.private && p.version == version)
                .for_each(&mut push);
        } else if let Some(caps) = PACKAGE_TAG.captures(tag) {
            let (name, version) = (&caps["name"], &caps["version"]);
            packages
                .iter()
                .filter(|p| !p.private && p.name == name && p.version == version)
                .for_each(&mut push);
        } else {
            debug!(tag = %tag, "ignoring tag that is not a release tag");
        }
    }

    updates
}

#[async_trait]
impl UpdateSource for TaggedAtHead {
    fn name(&self) -> &'static str {
        "from-git"
    }

    #[instrument(skip_all, fields(root = %self.root.display()))]
    async fn collect(&self, packages: &[Package]) -> Result<Vec<PackageUpdate>> {
        let tags = self.head_tags().await?;
        debug!(tags = ?tags, "tags at HEAD");
        let updates = updates_from_tags(&tags, packages);
        info!(count = updates.len(), "found packages tagged at HEAD");
        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monorepo::graph::tests::pkg;
    use crate::monorepo::testing::RecordingRegistry;

    fn tags(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_independent_tags() {
        let packages = vec![
            pkg("@acme/a", "1.2.0", &[]),
            pkg("b", "0.3.0", &[]),
            pkg("c", "2.0.0", &[]),
        ];
        let updates = updates_from_tags(&tags(&["@acme/a@1.2.0", "b@0.3.0", "c@1.0.0"]), &packages);
        assert_eq!(
            updates,
            vec![PackageUpdate::new("@acme/a", "1.2.0"), PackageUpdate::new("b", "0.3.0")]
        );
    }

    #[test]
    fn test_fixed_tag_selects_packages_at_version() {
        let mut internal = pkg("internal", "2.0.0-beta.1", &[]);
        internal.private = true;
        let packages = vec![
            pkg("a", "2.0.0-beta.1", &[]),
            pkg("b", "1.0.0", &[]),
            pkg("c", "2.0.0-beta.1", &[]),
            internal,
        ];
        let updates = updates_from_tags(&tags(&["v2.0.0-beta.1"]), &packages);
        let names: Vec<_> = updates.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn test_unrelated_tags_are_ignored() {
        let packages = vec![pkg("a", "1.0.0", &[])];
        assert!(updates_from_tags(&tags(&["nightly", "release-2024"]), &packages).is_empty());
    }

    #[test]
    fn test_overlapping_tags_do_not_duplicate() {
        let packages = vec![pkg("a", "1.0.0", &[])];
        let updates = updates_from_tags(&tags(&["v1.0.0", "a@1.0.0"]), &packages);
        assert_eq!(updates.len(), 1);
    }

    #[tokio::test]
    async fn test_unpublished_versions() {
        let client = Arc::new(RecordingRegistry::new());
        client.set_published("a", &["1.0.0"]);
        client.set_published("b", &["1.0.0"]);

        let mut internal = pkg("internal", "1.0.0", &[]);
        internal.private = true;
        let packages = vec![
            pkg("a", "1.0.0", &[]),
            pkg("b", "1.1.0", &[]),
            pkg("brand-new", "0.1.0", &[]),
            internal,
        ];

        let registry = normalize_registry("https://registry.npmjs.org").unwrap();
        let source = UnpublishedVersions::new(client.clone(), registry);
        let updates = source.collect(&packages).await.unwrap();

        assert_eq!(
            updates,
            vec![PackageUpdate::new("b", "1.1.0"), PackageUpdate::new("brand-new", "0.1.0")]
        );
        assert_eq!(source.name(), "from-package");
    }

    #[tokio::test]
    async fn test_unpublished_versions_uses_package_registry() {
        let client = Arc::new(RecordingRegistry::new());
        let mut package = pkg("a", "1.0.0", &[]);
        package.publish_config.registry = Some("https://npm.example.com".to_string());

        let registry = normalize_registry("https://registry.npmjs.org").unwrap();
        UnpublishedVersions::new(client.clone(), registry)
            .collect(&[package])
            .await
            .unwrap();

        assert_eq!(client.version_lookups(), vec!["https://npm.example.com/ a"]);
    }

    #[tokio::test]
    async fn test_fixed_updates() {
        let source = FixedUpdates::new(vec![PackageUpdate::new("a", "1.0.0")]);
        assert_eq!(source.collect(&[]).await.unwrap().len(), 1);
    }
}
