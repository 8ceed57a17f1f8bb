//! Gantry Core - publish orchestration for multi-package workspaces
//!
//! This crate provides the configuration, error handling, workspace model and
//! the publish pipeline used by the `gantry` command line tool.

pub mod config;
pub mod error;
pub mod monorepo;

pub use error::{ConfigError, GantryError, GraphError, ManifestError, PackageError, Result};
pub use monorepo::detector::{WorkspaceDetector, WorkspaceDetectorRegistry};
pub use monorepo::publishing::PublishCallbackRegistry;
pub use monorepo::{
    Package, PackageDiscovery, PublishOptions, PublishOrchestrator, PublishOutcome, PublishReport,
    Workspace,
};
