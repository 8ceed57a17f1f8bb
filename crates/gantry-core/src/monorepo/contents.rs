//! Content directory resolution

use std::path::{Path, PathBuf};

use crate::error::PackageError;

use super::manifest::Package;

/// Decides which directory of a package gets packed
#[derive(Debug, Clone, Default)]
pub struct ContentResolver {
    cli_contents: Option<PathBuf>,
}

impl ContentResolver {
    /// Create a resolver with the `--contents` override, if any
    pub fn new(cli_contents: Option<PathBuf>) -> Self {
        Self {
            cli_contents: cli_contents.filter(|p| !p.as_os_str().is_empty()),
        }
    }

    /// Directory to pack for `package`.
    ///
    /// `publishConfig.directory` wins over `--contents`, which wins over the
    /// package root. Relative choices are joined onto the package location.
    pub fn resolve(&self, package: &Package) -> PathBuf {
        let chosen: Option<&Path> = package
            .publish_config
            .directory
            .as_deref()
            .filter(|d| !d.is_empty())
            .map(Path::new)
            .or(self.cli_contents.as_deref());

        match chosen {
            Some(dir) => package.location.join(dir),
            None => package.location.clone(),
        }
    }

    /// Like [`resolve`](Self::resolve), but the directory must exist
    pub fn resolve_existing(&self, package: &Package) -> Result<PathBuf, PackageError> {
        let path = self.resolve(package);
        if path.is_dir() {
            Ok(path)
        } else {
            Err(PackageError::ContentPath {
                package: package.name.clone(),
                path,
            })
        }
    }
}
