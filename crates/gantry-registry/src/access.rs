//! Publish permission checks

use tracing::{debug, info, warn};

use crate::error::AccessError;
use crate::session::RegistrySession;

/// Why access verification did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessSkip {
    /// Turned off for this run
    Disabled,
    /// The registry is not the canonical one
    ThirdPartyRegistry,
    /// No authenticated identity to check against
    Anonymous,
    /// The registry does not serve permission listings
    Unsupported,
}

impl std::fmt::Display for AccessSkip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "access verification disabled"),
            Self::ThirdPartyRegistry => write!(f, "third-party registry"),
            Self::Anonymous => write!(f, "cannot verify access for an anonymous identity"),
            Self::Unsupported => write!(f, "registry does not list package permissions"),
        }
    }
}

/// Result of an access check that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessOutcome {
    /// Every package is writable by `username`
    Verified { username: String, checked: usize },
    /// The check did not run
    Skipped(AccessSkip),
}

/// Verifies the session identity may publish a set of packages
#[derive(Debug, Clone, Copy)]
pub struct AccessValidator {
    verify_access: bool,
}

impl AccessValidator {
    /// Create a validator, `verify_access = false` turns it into a no-op
    pub fn new(verify_access: bool) -> Self {
        Self { verify_access }
    }

    /// Check every package in `packages`.
    ///
    /// Packages missing from the user's permission listing are allowed, since
    /// a first publish creates them. Packages listed with anything other than
    /// read-write are collected and reported together.
    pub async fn verify(
        &self,
        packages: &[&str],
        session: &RegistrySession,
    ) -> Result<AccessOutcome, AccessError> {
        if !self.verify_access {
            info!("skipping package access verification");
            return Ok(AccessOutcome::Skipped(AccessSkip::Disabled));
        }

        if !session.validates() {
            return Ok(AccessOutcome::Skipped(AccessSkip::ThirdPartyRegistry));
        }

        let username = match session.resolve_identity().await.map_err(AccessError::Lookup)? {
            Some(username) => username,
            None => {
                info!("no authenticated registry user, skipping package access verification");
                return Ok(AccessOutcome::Skipped(AccessSkip::Anonymous));
            }
        };

        let permissions = match session
            .client()
            .package_permissions(session.registry(), &username)
            .await
        {
            Ok(permissions) => permissions,
            Err(e) if matches!(e.status(), Some(404 | 500)) => {
                warn!(error = %e, "registry does not support listing package permissions, skipping access verification");
                return Ok(AccessOutcome::Skipped(AccessSkip::Unsupported));
            }
            Err(e) => return Err(AccessError::Lookup(e)),
        };

        let denied: Vec<String> = packages
            .iter()
            .filter(|name| {
                permissions
                    .get(**name)
                    .is_some_and(|permission| !permission.can_publish())
            })
            .map(|name| name.to_string())
            .collect();

        if !denied.is_empty() {
            return Err(AccessError::Denied {
                username,
                packages: denied,
            });
        }

        debug!(username = %username, packages = packages.len(), "package access verified");
        Ok(AccessOutcome::Verified {
            username,
            checked: packages.len(),
        })
    }
}
