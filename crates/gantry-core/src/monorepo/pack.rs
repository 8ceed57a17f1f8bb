//! Packing package contents into tarballs

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::error::PackageError;

use super::manifest::Package;

/// A packed tarball ready for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedArchive {
    /// Tarball on disk
    pub path: PathBuf,
    /// Subresource integrity string reported by the packer
    pub integrity: Option<String>,
    /// Tarball size in bytes
    pub size: Option<u64>,
}

/// Turns a content directory into a publishable archive
#[async_trait]
pub trait Packer: Send + Sync {
    /// Pack `contents` on behalf of `package`
    async fn pack(&self, package: &Package, contents: &Path) -> Result<PackedArchive, PackageError>;
}

#[derive(Debug, Deserialize)]
struct PackEntry {
    filename: String,
    integrity: Option<String>,
    size: Option<u64>,
}

/// Packer that shells out to `npm pack`
#[derive(Debug, Clone)]
pub struct NpmPacker {
    npm: Option<PathBuf>,
    destination: PathBuf,
}

impl NpmPacker {
    /// Write tarballs into `destination`, finding `npm` on `PATH` when first needed
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            npm: None,
            destination: destination.into(),
        }
    }

    /// Use a specific npm executable
    pub fn with_npm(npm: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            npm: Some(npm.into()),
            destination: destination.into(),
        }
    }

    fn npm(&self) -> Result<PathBuf, String> {
        match &self.npm {
            Some(npm) => Ok(npm.clone()),
            None => which::which("npm").map_err(|e| format!("npm not found on PATH: {}", e)),
        }
    }

    /// Parse the JSON `npm pack --json` prints
    pub fn parse_output(
        package: &str,
        destination: &Path,
        stdout: &str,
    ) -> Result<PackedArchive, PackageError> {
        // Lifecycle scripts may print before the JSON array, which starts on the last
        // line that opens with `[`
        let json = stdout
            .rfind("\n[")
            .map(|newline| &stdout[newline + 1..])
            .unwrap_or(stdout);

        let entries: Vec<PackEntry> = serde_json::from_str(json).map_err(|e| PackageError::Pack {
            package: package.to_string(),
            message: format!("unreadable npm pack output: {}", e),
        })?;

        let entry = entries.into_iter().next().ok_or_else(|| PackageError::Pack {
            package: package.to_string(),
            message: "npm pack produced no archive".to_string(),
        })?;

        Ok(PackedArchive {
            path: destination.join(entry.filename),
            integrity: entry.integrity,
            size: entry.size,
        })
    }
}

#[async_trait]
impl Packer for NpmPacker {
    #[instrument(skip_all, fields(package = %package.name))]
    async fn pack(&self, package: &Package, contents: &Path) -> Result<PackedArchive, PackageError> {
        let failed = |message: String| PackageError::Pack {
            package: package.name.clone(),
            message,
        };

        let npm = self.npm().map_err(failed)?;
        tokio::fs::create_dir_all(&self.destination)
            .await
            .map_err(|e| failed(format!("cannot create {}: {}", self.destination.display(), e)))?;

        debug!(contents = %contents.display(), "running npm pack");
        let output = Command::new(&npm)
            .arg("pack")
            .arg("--json")
            .arg("--pack-destination")
            .arg(&self.destination)
            .current_dir(contents)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| failed(format!("failed to run npm: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failed(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let archive = Self::parse_output(&package.name, &self.destination, &stdout)?;
        debug!(archive = %archive.path.display(), size = ?archive.size, "packed");
        Ok(archive)
    }
}
