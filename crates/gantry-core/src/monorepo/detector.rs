//! Workspace detection, one detector per layout tried in order

use std::path::Path;

use tracing::{debug, info};

use crate::error::Result;

use super::workspace::Workspace;

/// Trait for workspace detectors
pub trait WorkspaceDetector: Send + Sync {
    /// Detector name (e.g., "pnpm", "lerna")
    fn name(&self) -> &'static str;
    /// Try to detect a workspace at the given path
    fn detect(&self, path: &Path) -> Result<Option<Workspace>>;
}

/// Registry of workspace detectors, tried in order
pub struct WorkspaceDetectorRegistry {
    detectors: Vec<Box<dyn WorkspaceDetector>>,
}

impl WorkspaceDetectorRegistry {
    /// Create a registry with all built-in detectors
    pub fn new() -> Self {
        Self {
            detectors: vec![
                Box::new(PnpmDetector),
                Box::new(LernaDetector),
                Box::new(NpmYarnDetector),
            ],
        }
    }

    /// Try each detector in order, returning the first match
    pub fn detect(&self, path: &Path) -> Result<Option<Workspace>> {
        debug!(path = %path.display(), detectors = self.detectors.len(), "running workspace detection");
        for detector in &self.detectors {
            if let Some(ws) = detector.detect(path)? {
                info!(
                    detector = detector.name(),
                    workspace_type = %ws.workspace_type,
                    path = %path.display(),
                    "workspace detected"
                );
                return Ok(Some(ws));
            }
        }
        debug!(path = %path.display(), "no workspace detected");
        Ok(None)
    }
}

impl Default for WorkspaceDetectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Detects pnpm workspaces
pub struct PnpmDetector;

impl WorkspaceDetector for PnpmDetector {
    fn name(&self) -> &'static str {
        "pnpm"
    }

    fn detect(&self, path: &Path) -> Result<Option<Workspace>> {
        Workspace::detect_pnpm(path)
    }
}

/// Detects Lerna monorepos
pub struct LernaDetector;

impl WorkspaceDetector for LernaDetector {
    fn name(&self) -> &'static str {
        "lerna"
    }

    fn detect(&self, path: &Path) -> Result<Option<Workspace>> {
        Workspace::detect_lerna(path)
    }
}

/// Detects npm or Yarn workspaces
pub struct NpmYarnDetector;

impl WorkspaceDetector for NpmYarnDetector {
    fn name(&self) -> &'static str {
        "npm_yarn"
    }

    fn detect(&self, path: &Path) -> Result<Option<Workspace>> {
        Workspace::detect_npm_yarn(path)
    }
}
