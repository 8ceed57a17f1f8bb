//! Error types for Gantry

use std::path::PathBuf;

use gantry_registry::{AccessError, RegistryError};
use thiserror::Error;

use crate::monorepo::cycles::Cycle;

/// Result type alias using GantryError
pub type Result<T> = std::result::Result<T, GantryError>;

/// Main error type for Gantry operations
#[derive(Debug, Error)]
pub enum GantryError {
    /// Configuration-related errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Package manifest errors
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Dependency graph errors
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Per-package publish pipeline errors
    #[error(transparent)]
    Package(#[from] PackageError),

    /// Registry errors raised outside a package pipeline
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Publish permission errors
    #[error(transparent)]
    Access(#[from] AccessError),

    /// The versioning collaborator could not produce updates
    #[error("Failed to collect package updates: {0}")]
    Versioning(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

impl GantryError {
    /// Create a new "other" error with a message
    pub fn other<S: Into<String>>(msg: S) -> Self {
        Self::Other(msg.into())
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    NotFound(PathBuf),

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {message}")]
    InvalidValue { field: String, message: String },

    /// A flag this command does not accept
    #[error("Unknown argument: {0}")]
    UnknownArgument(String),

    /// `--git-head` without the `from-package` positional
    #[error("--git-head is only allowed with 'from-package' positional")]
    GitHeadRequiresFromPackage,

    /// Confirmation is needed but nobody can answer it
    #[error("Confirmation required but the session is not interactive, pass --yes to skip it")]
    ConfirmationUnavailable,

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// IO error
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading a package manifest
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Manifest could not be read
    #[error("Failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Manifest is not valid JSON or has mistyped fields
    #[error("Failed to parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A required field is absent
    #[error("Manifest {path} is missing required field '{field}'")]
    MissingField { path: PathBuf, field: &'static str },

    /// The version is not a semantic version
    #[error("Package {name} has invalid version '{version}': {reason}")]
    InvalidVersion {
        name: String,
        version: String,
        reason: String,
    },
}

/// Dependency graph errors
#[derive(Debug, Error)]
pub enum GraphError {
    /// `--graph-type` value that is neither `dependencies` nor `all`
    #[error("Invalid graph type '{0}', expected 'dependencies' or 'all'")]
    InvalidEdgeKind(String),

    /// Two workspace packages share a name
    #[error("Package name '{0}' is used by more than one workspace package")]
    DuplicatePackage(String),

    /// Cycles found while cycles are rejected
    #[error(
        "Dependency cycles detected, you should fix these!\n{}",
        .cycles.iter().map(|c| c.to_string()).collect::<Vec<_>>().join("\n")
    )]
    Cycles { cycles: Vec<Cycle> },

    /// Scheduling met a graph that still has cycles
    #[error("Cannot schedule packages still caught in a dependency cycle: {}", .0.join(", "))]
    Unschedulable(Vec<String>),
}

/// Errors isolated to a single package's publish pipeline
#[derive(Debug, Error)]
pub enum PackageError {
    /// Resolved content directory is missing
    #[error("Content path for {package} does not exist: {path}")]
    ContentPath { package: String, path: PathBuf },

    /// Packing the content directory failed
    #[error("Failed to pack {package}: {message}")]
    Pack { package: String, message: String },

    /// Uploading the archive failed
    #[error("Failed to publish {package}: {source}")]
    Publish {
        package: String,
        #[source]
        source: RegistryError,
    },

    /// Moving a dist-tag failed
    #[error("Failed to update dist-tag '{tag}' for {package}: {source}")]
    DistTag {
        package: String,
        tag: String,
        #[source]
        source: RegistryError,
    },

    /// A one-time password could not be obtained or was refused
    #[error("One-time password failure for {package}: {source}")]
    Otp {
        package: String,
        #[source]
        source: RegistryError,
    },
}

impl PackageError {
    /// Whether this failure means no further writes can succeed in this run
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Otp { .. })
    }
}
