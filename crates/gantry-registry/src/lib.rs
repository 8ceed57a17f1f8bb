//! npm registry integration for Gantry
//!
//! This crate owns everything that talks to a package registry during a
//! publish run:
//!
//! - [`RegistryClient`] / [`TagSupport`]: the registry contract the publish
//!   orchestrator calls through, plus [`NpmRegistry`], an HTTP implementation
//!   for npm-compatible registries.
//! - [`RegistrySession`]: per-run authentication state. Registry URL
//!   rewriting, identity lookup, two-factor detection and one-time password
//!   acquisition, each resolved at most once.
//! - [`AccessValidator`]: pre-flight check that the authenticated user may
//!   publish every package in the run.
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use gantry_registry::{NpmConfig, NpmRegistry, RegistrySession, NonInteractivePrompter};
//!
//! let client = Arc::new(NpmRegistry::new(NpmConfig::load()?));
//! let session = RegistrySession::new(client, Arc::new(NonInteractivePrompter), None, None)?;
//! let otp = session.acquire_otp().await?;
//! ```

pub mod access;
pub mod error;
pub mod npm;
pub mod session;
pub mod traits;
pub mod types;

#[cfg(test)]
mod testing;

pub use access::{AccessOutcome, AccessSkip, AccessValidator};
pub use error::{AccessError, RegistryError, Result};
pub use npm::{NpmConfig, NpmRegistry};
pub use session::{
    NonInteractivePrompter, OtpPrompter, OtpSource, RegistrySession, SessionNotice,
    OTP_PROMPT,
};
pub use traits::{RegistryClient, TagSupport};
pub use types::{
    escape_package_name, is_canonical_registry, normalize_registry, Access, Permission,
    PublishOptions, TwoFactorMode, CANONICAL_REGISTRY, YARN_REGISTRY,
};
