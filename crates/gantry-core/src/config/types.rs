//! Configuration types

use gantry_registry::Access;
use serde::{Deserialize, Serialize};

use super::defaults::{DEFAULT_CONCURRENCY, DEFAULT_TEMP_TAG};

/// Main configuration for Gantry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Workspace layout overrides
    pub workspace: WorkspaceConfig,

    /// Publish defaults, overridden by command-line flags
    pub publish: PublishConfig,
}

/// Workspace configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Package globs used instead of the detected workspace's own list
    pub packages: Vec<String>,
}

/// Publishing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Registry to publish to, the public npm registry when unset
    pub registry: Option<String>,

    /// Which dependency kinds order the publish (`dependencies` or `all`)
    pub graph_type: String,

    /// Fail instead of breaking dependency cycles
    pub reject_cycles: bool,

    /// Check publish permissions before uploading
    pub verify_access: bool,

    /// Subdirectory of every package to publish from
    pub contents: Option<String>,

    /// Dist-tag applied to every package
    pub dist_tag: Option<String>,

    /// Dist-tag applied to prerelease versions
    pub pre_dist_tag: Option<String>,

    /// Tag used while moving a non-latest dist-tag into place
    pub temp_tag: String,

    /// Access level for scoped packages
    pub access: Option<Access>,

    /// Packages published at once within a batch
    pub concurrency: usize,

    /// What happens after a package fails (`abort`, `skip-dependents`, `continue`)
    pub failure_policy: String,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            registry: None,
            graph_type: "dependencies".to_string(),
            reject_cycles: false,
            verify_access: true,
            contents: None,
            dist_tag: None,
            pre_dist_tag: None,
            temp_tag: DEFAULT_TEMP_TAG.to_string(),
            access: None,
            concurrency: DEFAULT_CONCURRENCY,
            failure_policy: "abort".to_string(),
        }
    }
}
