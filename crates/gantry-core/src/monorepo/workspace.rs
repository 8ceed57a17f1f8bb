//! Workspace detection

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, Result};

/// Package globs used when a layout file names none
const DEFAULT_PATTERNS: &[&str] = &["packages/*"];

/// Kind of workspace layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceType {
    /// npm workspaces
    Npm,
    /// pnpm workspace
    Pnpm,
    /// Yarn workspaces (v1 or berry)
    Yarn,
    /// Lerna monorepo
    Lerna,
}

impl WorkspaceType {
    /// Get the configuration file that identifies this workspace type
    pub fn config_file(&self) -> &'static str {
        match self {
            Self::Npm | Self::Yarn => "package.json",
            Self::Pnpm => "pnpm-workspace.yaml",
            Self::Lerna => "lerna.json",
        }
    }
}

impl std::fmt::Display for WorkspaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Npm => write!(f, "npm"),
            Self::Pnpm => write!(f, "pnpm"),
            Self::Yarn => write!(f, "yarn"),
            Self::Lerna => write!(f, "lerna"),
        }
    }
}

/// A detected workspace
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Root path of the workspace
    pub root: PathBuf,
    /// Type of workspace
    pub workspace_type: WorkspaceType,
    /// Glob patterns for package locations, `!` negates
    pub package_patterns: Vec<String>,
    /// Whether the root itself is the only package
    pub is_single_package: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WorkspacesField {
    Array(Vec<String>),
    Object { packages: Vec<String> },
}

impl WorkspacesField {
    fn into_patterns(self) -> Vec<String> {
        match self {
            Self::Array(patterns) => patterns,
            Self::Object { packages } => packages,
        }
    }
}

#[derive(Deserialize)]
struct RootManifest {
    name: Option<String>,
    workspaces: Option<WorkspacesField>,
}

fn default_patterns() -> Vec<String> {
    DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect()
}

fn invalid(file: &Path, message: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        field: file.display().to_string(),
        message: message.to_string(),
    }
}

fn read_root_manifest(path: &Path) -> Result<Option<RootManifest>> {
    let package_json = path.join("package.json");
    if !package_json.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&package_json)?;
    let manifest = serde_json::from_str(&content).map_err(|e| invalid(&package_json, e))?;
    Ok(Some(manifest))
}

impl Workspace {
    /// Create a new workspace
    pub fn new(root: PathBuf, workspace_type: WorkspaceType) -> Self {
        Self {
            root,
            workspace_type,
            package_patterns: Vec::new(),
            is_single_package: false,
        }
    }

    /// Use `patterns` instead of the detected package globs
    pub fn with_patterns(mut self, patterns: Vec<String>) -> Self {
        if !patterns.is_empty() {
            self.package_patterns = patterns;
            self.is_single_package = false;
        }
        self
    }

    /// Detect workspace type and configuration from a directory
    pub fn detect(path: &Path) -> Result<Option<Self>> {
        debug!(path = %path.display(), "detecting workspace type");
        let registry = super::detector::WorkspaceDetectorRegistry::new();
        registry.detect(path)
    }

    /// Detect pnpm workspace
    pub(crate) fn detect_pnpm(path: &Path) -> Result<Option<Self>> {
        let pnpm_workspace = path.join("pnpm-workspace.yaml");
        if !pnpm_workspace.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&pnpm_workspace)?;

        #[derive(Deserialize)]
        struct PnpmWorkspace {
            packages: Option<Vec<String>>,
        }

        let config: Option<PnpmWorkspace> = if content.trim().is_empty() {
            None
        } else {
            serde_yaml::from_str(&content).map_err(|e| invalid(&pnpm_workspace, e))?
        };

        let mut ws = Workspace::new(path.to_path_buf(), WorkspaceType::Pnpm);
        ws.package_patterns = config
            .and_then(|c| c.packages)
            .unwrap_or_else(default_patterns);
        Ok(Some(ws))
    }

    /// Detect Lerna monorepo
    pub(crate) fn detect_lerna(path: &Path) -> Result<Option<Self>> {
        let lerna_json = path.join("lerna.json");
        if !lerna_json.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&lerna_json)?;

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct LernaConfig {
            packages: Option<Vec<String>>,
            #[serde(default)]
            use_workspaces: bool,
        }

        let config: LernaConfig =
            serde_json::from_str(&content).map_err(|e| invalid(&lerna_json, e))?;

        // useWorkspaces defers to the root manifest
        let from_manifest = if config.use_workspaces {
            read_root_manifest(path)?
                .and_then(|m| m.workspaces)
                .map(WorkspacesField::into_patterns)
        } else {
            None
        };

        let mut ws = Workspace::new(path.to_path_buf(), WorkspaceType::Lerna);
        ws.package_patterns = from_manifest
            .or(config.packages)
            .unwrap_or_else(default_patterns);
        Ok(Some(ws))
    }

    /// Detect npm or Yarn workspaces
    pub(crate) fn detect_npm_yarn(path: &Path) -> Result<Option<Self>> {
        let Some(manifest) = read_root_manifest(path)? else {
            return Ok(None);
        };

        let workspace_type = if path.join("yarn.lock").exists() {
            WorkspaceType::Yarn
        } else {
            WorkspaceType::Npm
        };

        if let Some(workspaces) = manifest.workspaces {
            let mut ws = Workspace::new(path.to_path_buf(), workspace_type);
            ws.package_patterns = workspaces.into_patterns();
            return Ok(Some(ws));
        }

        if manifest.name.is_some() {
            let mut ws = Workspace::new(path.to_path_buf(), workspace_type);
            ws.package_patterns = vec![".".to_string()];
            ws.is_single_package = true;
            return Ok(Some(ws));
        }

        Ok(None)
    }
}
