//! Package discovery in workspaces

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use glob::glob;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, info};

use crate::error::{ConfigError, Result};

use super::manifest::{Package, MANIFEST_FILE};
use super::workspace::Workspace;

fn invalid_pattern(message: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        field: "package_patterns".to_string(),
        message: message.to_string(),
    }
}

/// Package discovery for workspaces
pub struct PackageDiscovery {
    workspace: Workspace,
}

impl PackageDiscovery {
    /// Create a new package discovery instance
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    /// Workspace being searched
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Discover all packages in the workspace.
    ///
    /// Packages come back in pattern order, alphabetical within a pattern.
    /// Directories without a manifest and anything under `node_modules` are
    /// ignored; a manifest that fails to parse is an error.
    pub fn discover(&self) -> Result<Vec<Package>> {
        debug!(
            workspace_type = %self.workspace.workspace_type,
            patterns = self.workspace.package_patterns.len(),
            "discovering packages"
        );

        let (include, exclude) = self.split_patterns()?;
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut packages = Vec::new();

        for pattern in include {
            let full_pattern = if pattern == "." {
                self.workspace.root.to_string_lossy().to_string()
            } else {
                self.workspace
                    .root
                    .join(pattern.trim_end_matches('/'))
                    .to_string_lossy()
                    .to_string()
            };

            let mut matches = Vec::new();
            for entry in glob(&full_pattern).map_err(invalid_pattern)? {
                matches.push(entry.map_err(invalid_pattern)?);
            }
            matches.sort();

            for path in matches {
                let Some(location) = self.package_dir(&path) else {
                    continue;
                };
                if self.is_excluded(&location, &exclude) || !seen.insert(location.clone()) {
                    continue;
                }

                let package = Package::load(&location)?;
                debug!(package = %package.name, location = %location.display(), "found package");
                packages.push(package);
            }
        }

        info!(count = packages.len(), "discovered packages");
        Ok(packages)
    }

    fn split_patterns(&self) -> Result<(Vec<&str>, GlobSet)> {
        let mut include = Vec::new();
        let mut exclude = GlobSetBuilder::new();

        for pattern in &self.workspace.package_patterns {
            match pattern.strip_prefix('!') {
                Some(negated) => {
                    let negated = negated.trim_start_matches("./").trim_end_matches('/');
                    exclude.add(Glob::new(negated).map_err(invalid_pattern)?);
                }
                None => include.push(pattern.trim_start_matches("./")),
            }
        }

        let exclude = exclude.build().map_err(invalid_pattern)?;
        Ok((include, exclude))
    }

    /// Package directory for a glob match, `None` when it holds no manifest
    fn package_dir(&self, path: &Path) -> Option<PathBuf> {
        let location = if path.is_dir() {
            path.to_path_buf()
        } else if path.file_name().is_some_and(|f| f == MANIFEST_FILE) {
            path.parent()?.to_path_buf()
        } else {
            return None;
        };

        if location.join(MANIFEST_FILE).is_file() {
            Some(location)
        } else {
            None
        }
    }

    fn is_excluded(&self, location: &Path, exclude: &GlobSet) -> bool {
        let relative = location.strip_prefix(&self.workspace.root).unwrap_or(location);
        relative.components().any(|c| c.as_os_str() == "node_modules")
            || exclude.is_match(relative)
    }
}
