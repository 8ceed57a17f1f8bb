//! Workspace publishing
//!
//! This module holds everything between reading a workspace and the registry:
//! - Workspace detection (npm, yarn, pnpm, lerna) and package discovery
//! - Typed manifests and the dependency graph with cycle linearization
//! - Batch scheduling in dependency order
//! - Content resolution, packing and coordinated publishing

pub mod contents;
pub mod cycles;
pub mod detector;
pub mod discovery;
pub mod graph;
pub mod manifest;
pub mod pack;
pub mod publishing;
pub mod schedule;
pub mod versioning;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use contents::ContentResolver;
pub use cycles::{find_cycles, Cycle, CyclePolicy, CycleResolution, CycleResolver};
pub use discovery::PackageDiscovery;
pub use graph::{range_satisfied, EdgeKindPolicy, PackageGraph};
pub use manifest::{DependencyKind, Package};
pub use pack::{NpmPacker, PackedArchive, Packer};
pub use publishing::{
    AutoConfirm, Confirmer, FailureStrategy, PackagePublishResult, PublishCallback,
    PublishCallbackRegistry, PublishOptions, PublishOrchestrator, PublishOutcome, PublishReport,
    PublishState, SkipReason, SkippedPackage, CONFIRM_PROMPT,
};
pub use schedule::{PublishPlan, PublishScheduler};
pub use versioning::{
    updates_from_tags, FixedUpdates, PackageUpdate, TaggedAtHead, UnpublishedVersions,
    UpdateSource,
};
pub use workspace::{Workspace, WorkspaceType};
