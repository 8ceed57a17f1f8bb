//! Terminal prompts for the one-time password and the publish confirmation

use async_trait::async_trait;
use dialoguer::{Confirm, Input};
use gantry_core::monorepo::{Confirmer, PackageUpdate};
use gantry_core::{ConfigError, GantryError};
use gantry_registry::{OtpPrompter, RegistryError};
use indicatif::ProgressBar;

use super::output;

/// Asks for one-time passwords on the terminal
pub struct TerminalOtpPrompter {
    progress: ProgressBar,
}

impl TerminalOtpPrompter {
    /// Prompt with `progress` hidden while the question is on screen
    pub fn new(progress: ProgressBar) -> Self {
        Self { progress }
    }
}

#[async_trait]
impl OtpPrompter for TerminalOtpPrompter {
    async fn prompt(&self, message: &str) -> gantry_registry::Result<String> {
        // dialoguer adds its own colon
        let prompt = message.trim_end_matches(':').to_string();
        let progress = self.progress.clone();

        tokio::task::spawn_blocking(move || {
            progress.suspend(|| Input::<String>::new().with_prompt(prompt).interact_text())
        })
        .await
        .map_err(|e| RegistryError::Prompt(e.to_string()))?
        .map_err(|e| RegistryError::Prompt(e.to_string()))
    }
}

/// Lists the packages and asks yes/no on the terminal
pub struct TerminalConfirmer;

#[async_trait]
impl Confirmer for TerminalConfirmer {
    async fn confirm(&self, message: &str, packages: &[PackageUpdate]) -> gantry_core::Result<bool> {
        println!();
        println!("{}", output::header("Changes:"));
        for update in packages {
            println!(" - {}", output::package_version(&update.name, &update.version));
        }
        println!();

        let prompt = message.to_string();
        tokio::task::spawn_blocking(move || Confirm::new().with_prompt(prompt).default(false).interact())
            .await
            .map_err(|e| GantryError::other(e.to_string()))?
            .map_err(|e| GantryError::other(format!("Confirmation failed: {}", e)))
    }
}

/// Confirmer for runs without a terminal; `--yes` is the only way through
pub struct NoTerminalConfirmer;

#[async_trait]
impl Confirmer for NoTerminalConfirmer {
    async fn confirm(&self, _message: &str, _packages: &[PackageUpdate]) -> gantry_core::Result<bool> {
        Err(ConfigError::ConfirmationUnavailable.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_terminal_confirmer_refuses() {
        let err = NoTerminalConfirmer
            .confirm("Are you sure?", &[PackageUpdate::new("a", "1.0.0")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("--yes"));
    }
}
