//! Configuration validation

use std::str::FromStr;

use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::monorepo::graph::EdgeKindPolicy;
use crate::monorepo::publishing::FailureStrategy;

use super::defaults::LATEST_TAG;
use super::types::Config;

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_workspace(config)?;
    validate_publish(config)?;
    debug!("configuration validation passed");
    Ok(())
}

fn validate_workspace(config: &Config) -> Result<()> {
    for (i, pattern) in config.workspace.packages.iter().enumerate() {
        if pattern.trim().is_empty() {
            return Err(invalid(
                format!("workspace.packages[{}]", i),
                "package pattern cannot be empty",
            ));
        }
    }
    Ok(())
}

fn validate_publish(config: &Config) -> Result<()> {
    let publish = &config.publish;

    EdgeKindPolicy::from_str(&publish.graph_type)
        .map_err(|e| invalid("publish.graph_type", e.to_string()))?;

    FailureStrategy::from_str(&publish.failure_policy)
        .map_err(|e| invalid("publish.failure_policy", e))?;

    if publish.concurrency == 0 {
        return Err(invalid("publish.concurrency", "must be at least 1"));
    }

    if let Some(registry) = &publish.registry {
        gantry_registry::normalize_registry(registry)
            .map_err(|e| invalid("publish.registry", e.to_string()))?;
    }

    validate_tag("publish.temp_tag", &publish.temp_tag)?;
    if publish.temp_tag == LATEST_TAG {
        return Err(invalid(
            "publish.temp_tag",
            "temporary tag cannot be 'latest'",
        ));
    }
    if let Some(tag) = &publish.dist_tag {
        validate_tag("publish.dist_tag", tag)?;
    }
    if let Some(tag) = &publish.pre_dist_tag {
        validate_tag("publish.pre_dist_tag", tag)?;
    }

    Ok(())
}

/// Registries refuse tags that are empty or parse as a version
pub fn validate_tag(field: &str, tag: &str) -> Result<()> {
    if tag.trim().is_empty() {
        return Err(invalid(field, "tag cannot be empty"));
    }
    if semver::Version::parse(tag.trim_start_matches('v')).is_ok() {
        return Err(invalid(
            field,
            format!("tag '{}' looks like a version", tag),
        ));
    }
    Ok(())
}

fn invalid(field: impl Into<String>, message: impl Into<String>) -> crate::error::GantryError {
    ConfigError::InvalidValue {
        field: field.into(),
        message: message.into(),
    }
    .into()
}
