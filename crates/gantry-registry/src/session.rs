//! Per-run registry session
//!
//! A [`RegistrySession`] is created once per publish run and shared by every
//! worker through an `Arc`. Registry rewriting and the third-party decision
//! happen eagerly in [`RegistrySession::new`]; identity, two-factor mode and
//! the one-time password are resolved lazily and at most once.
//!
//! Concurrent callers of [`RegistrySession::acquire_otp`] never trigger more
//! than one prompt: the first caller prompts while holding the OTP guard, the
//! rest wait on the guard and then read the cached value, or the cached
//! failure when the prompt produced no code.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{RegistryError, Result};
use crate::traits::RegistryClient;
use crate::types::{is_canonical_registry, normalize_registry, CANONICAL_REGISTRY, YARN_REGISTRY};

/// Prompt shown when a one-time password is needed
pub const OTP_PROMPT: &str = "Enter OTP:";

/// Something the session decided that the user should hear about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionNotice {
    /// The Yarn proxy was swapped for the canonical registry
    YarnRegistryReplaced,
    /// The registry is not the canonical one, so identity and access checks are off
    ThirdPartyRegistry,
}

impl SessionNotice {
    /// Lines to show the user, in order
    pub fn messages(&self) -> &'static [&'static str] {
        match self {
            Self::YarnRegistryReplaced => &[
                "Yarn's registry proxy is broken, replacing with public npm registry",
                "If you don't have an npm token, you should exit and run `npm login`",
            ],
            Self::ThirdPartyRegistry => {
                &["Skipping all user and access validation due to third-party registry"]
            }
        }
    }

    /// Whether the notice is a warning rather than informational
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::YarnRegistryReplaced)
    }
}

/// Source of one-time passwords when the registry demands one
#[async_trait]
pub trait OtpPrompter: Send + Sync {
    /// Ask the user for a code
    async fn prompt(&self, message: &str) -> Result<String>;
}

/// Prompter for sessions without a terminal
pub struct NonInteractivePrompter;

#[async_trait]
impl OtpPrompter for NonInteractivePrompter {
    async fn prompt(&self, _message: &str) -> Result<String> {
        Err(RegistryError::Prompt(
            "a one-time password is required but the session is not interactive; pass --otp"
                .to_string(),
        ))
    }
}

/// Where the cached one-time password came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpSource {
    /// Supplied up front on the command line
    Cli,
    /// Typed in at a prompt during this run
    Prompt,
}

#[derive(Debug, Default)]
struct OtpState {
    value: Option<String>,
    source: Option<OtpSource>,
    prompts: usize,
    refreshed: bool,
    /// Why the last prompt produced no code; later callers get the same answer
    failure: Option<String>,
}

/// Authentication state for one publish run
pub struct RegistrySession {
    client: Arc<dyn RegistryClient>,
    prompter: Arc<dyn OtpPrompter>,
    registry: Url,
    validate: bool,
    notices: Vec<SessionNotice>,
    identity: OnceCell<Option<String>>,
    two_factor: OnceCell<bool>,
    otp: Mutex<OtpState>,
}

impl RegistrySession {
    /// Create a session for `configured_registry` (canonical registry when `None`)
    pub fn new(
        client: Arc<dyn RegistryClient>,
        prompter: Arc<dyn OtpPrompter>,
        configured_registry: Option<&str>,
        cli_otp: Option<String>,
    ) -> Result<Self> {
        let (registry, mut notices) = Self::resolve_registry(configured_registry)?;

        let validate = Self::should_validate(&registry);
        if !validate {
            info!(registry = %registry, "skipping user and access validation for third-party registry");
            notices.push(SessionNotice::ThirdPartyRegistry);
        }

        let mut otp = OtpState::default();
        if let Some(code) = cli_otp.filter(|c| !c.trim().is_empty()) {
            otp.value = Some(code.trim().to_string());
            otp.source = Some(OtpSource::Cli);
        }

        Ok(Self {
            client,
            prompter,
            registry,
            validate,
            notices,
            identity: OnceCell::new(),
            two_factor: OnceCell::new(),
            otp: Mutex::new(otp),
        })
    }

    /// Apply registry quirks to the configured URL
    pub fn resolve_registry(configured: Option<&str>) -> Result<(Url, Vec<SessionNotice>)> {
        let Some(raw) = configured.filter(|r| !r.trim().is_empty()) else {
            return Ok((normalize_registry(CANONICAL_REGISTRY)?, Vec::new()));
        };

        let url = normalize_registry(raw)?;
        if url == normalize_registry(YARN_REGISTRY)? {
            warn!("Yarn's registry proxy is broken, replacing with public npm registry");
            warn!("If you don't have an npm token, you should exit and run `npm login`");
            return Ok((
                normalize_registry(CANONICAL_REGISTRY)?,
                vec![SessionNotice::YarnRegistryReplaced],
            ));
        }

        Ok((url, Vec::new()))
    }

    /// Whether identity and access validation apply to `registry`
    pub fn should_validate(registry: &Url) -> bool {
        is_canonical_registry(registry)
    }

    /// Registry every package publishes to unless it overrides it
    pub fn registry(&self) -> &Url {
        &self.registry
    }

    /// Whether this session validates identity and access
    pub fn validates(&self) -> bool {
        self.validate
    }

    /// Notices collected while resolving the registry
    pub fn notices(&self) -> &[SessionNotice] {
        &self.notices
    }

    /// Client the session authenticates against
    pub fn client(&self) -> &Arc<dyn RegistryClient> {
        &self.client
    }

    /// Username of the authenticated principal, looked up once
    pub async fn resolve_identity(&self) -> Result<Option<String>> {
        if !self.validate {
            return Ok(None);
        }

        self.identity
            .get_or_try_init(|| async {
                let username = self.client.whoami(&self.registry).await?;
                match &username {
                    Some(name) => debug!(username = %name, "resolved registry identity"),
                    None => debug!("registry identity is anonymous"),
                }
                Ok::<_, RegistryError>(username)
            })
            .await
            .cloned()
    }

    /// Whether writes need a one-time password, looked up once
    pub async fn requires_two_factor(&self) -> Result<bool> {
        if !self.validate {
            return Ok(false);
        }

        self.two_factor
            .get_or_try_init(|| async {
                if self.resolve_identity().await?.is_none() {
                    return Ok::<bool, RegistryError>(false);
                }

                match self.client.two_factor_mode(&self.registry).await {
                    Ok(mode) => {
                        debug!(?mode, "resolved two-factor mode");
                        Ok(mode.requires_otp_for_writes())
                    }
                    Err(e)
                        if matches!(e.status(), Some(401 | 403 | 404))
                            || matches!(e, RegistryError::AuthenticationFailed(_)) =>
                    {
                        debug!(error = %e, "two-factor lookup unavailable, assuming not required");
                        Ok(false)
                    }
                    Err(e) => Err(e),
                }
            })
            .await
            .copied()
    }

    /// One-time password for the next write.
    ///
    /// A code supplied on the command line is returned as is. Otherwise the
    /// user is prompted once if two-factor auth is required, and the answer is
    /// reused for the rest of the run.
    pub async fn acquire_otp(&self) -> Result<Option<String>> {
        if let Some(otp) = self.otp.lock().await.value.clone() {
            return Ok(Some(otp));
        }

        if !self.requires_two_factor().await? {
            return Ok(None);
        }

        let mut state = self.otp.lock().await;
        if let Some(otp) = state.value.clone() {
            return Ok(Some(otp));
        }
        if let Some(failure) = &state.failure {
            return Err(RegistryError::Prompt(failure.clone()));
        }
        self.prompt_locked(&mut state).await.map(Some)
    }

    /// Replace a code the registry refused, or obtain one it demanded.
    ///
    /// `rejected` is the code that was sent, `None` when the request carried
    /// none. A rejected prompted code is re-prompted at most once per run; a
    /// rejected command-line code is fatal.
    pub async fn refresh_otp(&self, rejected: Option<&str>) -> Result<String> {
        let mut state = self.otp.lock().await;

        match (state.value.as_deref(), rejected) {
            (Some(current), Some(bad)) if current != bad => return Ok(current.to_string()),
            (Some(current), None) => return Ok(current.to_string()),
            _ => {}
        }

        if rejected.is_some() {
            if state.source == Some(OtpSource::Cli) {
                return Err(RegistryError::OtpRejected);
            }
            if state.refreshed {
                return Err(RegistryError::OtpRejected);
            }
            state.refreshed = true;
            warn!("one-time password was rejected, prompting for a new one");
        }

        self.prompt_locked(&mut state).await
    }

    /// Number of interactive prompts issued so far
    pub async fn prompt_count(&self) -> usize {
        self.otp.lock().await.prompts
    }

    async fn prompt_locked(&self, state: &mut OtpState) -> Result<String> {
        if let Some(failure) = &state.failure {
            return Err(RegistryError::Prompt(failure.clone()));
        }

        state.prompts += 1;
        let code = match self.prompter.prompt(OTP_PROMPT).await {
            Ok(code) => code.trim().to_string(),
            Err(e) => {
                state.failure = Some(match &e {
                    RegistryError::Prompt(message) => message.clone(),
                    other => other.to_string(),
                });
                return Err(e);
            }
        };
        if code.is_empty() {
            let message = "no one-time password entered".to_string();
            state.failure = Some(message.clone());
            return Err(RegistryError::Prompt(message));
        }

        state.value = Some(code.clone());
        state.source = Some(OtpSource::Prompt);
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRegistry, ScriptedPrompter};
    use crate::types::TwoFactorMode;
    use std::sync::atomic::Ordering;

    fn session(
        client: Arc<FakeRegistry>,
        prompter: Arc<ScriptedPrompter>,
        registry: Option<&str>,
        otp: Option<&str>,
    ) -> RegistrySession {
        RegistrySession::new(client, prompter, registry, otp.map(str::to_string)).unwrap()
    }

    #[test]
    fn test_yarn_registry_is_replaced() {
        for raw in ["https://registry.yarnpkg.com", "https://registry.yarnpkg.com/"] {
            let (url, notices) = RegistrySession::resolve_registry(Some(raw)).unwrap();
            assert_eq!(url.as_str(), "https://registry.npmjs.org/");
            assert_eq!(notices, vec![SessionNotice::YarnRegistryReplaced]);
        }
    }

    #[test]
    fn test_other_registries_pass_through() {
        let (url, notices) =
            RegistrySession::resolve_registry(Some("https://npm.example.com/repo")).unwrap();
        assert_eq!(url.as_str(), "https://npm.example.com/repo/");
        assert!(notices.is_empty());

        let (url, _) = RegistrySession::resolve_registry(None).unwrap();
        assert_eq!(url.as_str(), CANONICAL_REGISTRY);
    }

    #[tokio::test]
    async fn test_yarn_rewrite_still_validates() {
        let client = Arc::new(FakeRegistry::new().with_user("ada"));
        let session = session(
            client.clone(),
            Arc::new(ScriptedPrompter::new(&[])),
            Some("https://registry.yarnpkg.com"),
            None,
        );

        assert!(session.validates());
        assert_eq!(session.notices(), &[SessionNotice::YarnRegistryReplaced]);
        assert_eq!(session.resolve_identity().await.unwrap().as_deref(), Some("ada"));
        assert_eq!(
            client.whoami_registries().first().map(String::as_str),
            Some("https://registry.npmjs.org/")
        );
    }

    #[tokio::test]
    async fn test_third_party_registry_skips_validation() {
        let client = Arc::new(
            FakeRegistry::new()
                .with_user("ada")
                .with_two_factor(TwoFactorMode::AuthAndWrites),
        );
        let prompter = Arc::new(ScriptedPrompter::new(&["123456"]));
        let session = session(
            client.clone(),
            prompter.clone(),
            Some("https://npm.internal.example.com"),
            None,
        );

        assert!(!session.validates());
        assert_eq!(session.notices(), &[SessionNotice::ThirdPartyRegistry]);
        assert_eq!(session.resolve_identity().await.unwrap(), None);
        assert!(!session.requires_two_factor().await.unwrap());
        assert_eq!(session.acquire_otp().await.unwrap(), None);
        assert_eq!(client.whoami_calls.load(Ordering::SeqCst), 0);
        assert_eq!(client.two_factor_calls.load(Ordering::SeqCst), 0);
        assert_eq!(prompter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_identity_is_memoized() {
        let client = Arc::new(FakeRegistry::new().with_user("ada"));
        let session = session(client.clone(), Arc::new(ScriptedPrompter::new(&[])), None, None);

        for _ in 0..3 {
            assert_eq!(session.resolve_identity().await.unwrap().as_deref(), Some("ada"));
        }
        assert_eq!(client.whoami_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cli_otp_is_used_without_prompting() {
        let client = Arc::new(
            FakeRegistry::new()
                .with_user("ada")
                .with_two_factor(TwoFactorMode::AuthAndWrites),
        );
        let prompter = Arc::new(ScriptedPrompter::new(&["999999"]));
        let session = session(client.clone(), prompter.clone(), None, Some("654321"));

        assert_eq!(session.acquire_otp().await.unwrap().as_deref(), Some("654321"));
        assert_eq!(prompter.calls.load(Ordering::SeqCst), 0);
        assert_eq!(client.two_factor_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_prompt_when_two_factor_not_required() {
        let client = Arc::new(FakeRegistry::new().with_user("ada"));
        let prompter = Arc::new(ScriptedPrompter::new(&["123456"]));
        let session = session(client, prompter.clone(), None, None);

        assert_eq!(session.acquire_otp().await.unwrap(), None);
        assert_eq!(prompter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_anonymous_identity_skips_two_factor_lookup() {
        let client = Arc::new(FakeRegistry::new().with_two_factor(TwoFactorMode::AuthAndWrites));
        let session = session(client.clone(), Arc::new(ScriptedPrompter::new(&[])), None, None);

        assert!(!session.requires_two_factor().await.unwrap());
        assert_eq!(client.two_factor_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_two_factor_lookup_errors_mean_not_required() {
        let client = Arc::new(FakeRegistry::new().with_user("ada").with_two_factor_status(404));
        let session = session(client, Arc::new(ScriptedPrompter::new(&[])), None, None);

        assert!(!session.requires_two_factor().await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_prompts_once() {
        let client = Arc::new(
            FakeRegistry::new()
                .with_user("ada")
                .with_two_factor(TwoFactorMode::AuthAndWrites),
        );
        let prompter = Arc::new(ScriptedPrompter::new(&["111111", "222222"]).with_delay_ms(20));
        let session = Arc::new(session(client.clone(), prompter.clone(), None, None));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move { session.acquire_otp().await })
            })
            .collect();

        for handle in handles {
            let otp = handle.await.unwrap().unwrap();
            assert_eq!(otp.as_deref(), Some("111111"));
        }
        assert_eq!(prompter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.prompt_count().await, 1);
        assert_eq!(client.two_factor_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_prompt_is_not_repeated_for_waiting_callers() {
        let client = Arc::new(
            FakeRegistry::new()
                .with_user("ada")
                .with_two_factor(TwoFactorMode::AuthAndWrites),
        );
        let prompter = Arc::new(ScriptedPrompter::new(&["", "", "", ""]).with_delay_ms(20));
        let session = Arc::new(session(client, prompter.clone(), None, None));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move { session.acquire_otp().await })
            })
            .collect();

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(err.to_string().contains("no one-time password entered"));
        }
        assert_eq!(prompter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.prompt_count().await, 1);

        // a later challenge does not ask again either
        assert!(session.refresh_otp(None).await.is_err());
        assert_eq!(prompter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_prompter_error_is_cached() {
        let client = Arc::new(
            FakeRegistry::new()
                .with_user("ada")
                .with_two_factor(TwoFactorMode::AuthAndWrites),
        );
        let prompter = Arc::new(ScriptedPrompter::new(&[]));
        let session = session(client, prompter.clone(), None, None);

        let first = session.acquire_otp().await.unwrap_err();
        let second = session.acquire_otp().await.unwrap_err();
        assert_eq!(first.to_string(), second.to_string());
        assert_eq!(prompter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_prompted_otp_is_refreshed_once() {
        let client = Arc::new(
            FakeRegistry::new()
                .with_user("ada")
                .with_two_factor(TwoFactorMode::AuthAndWrites),
        );
        let prompter = Arc::new(ScriptedPrompter::new(&["111111", "222222", "333333"]));
        let session = session(client, prompter.clone(), None, None);

        let first = session.acquire_otp().await.unwrap().unwrap();
        let second = session.refresh_otp(Some(&first)).await.unwrap();
        assert_eq!(second, "222222");

        // a worker that sent the stale code picks up the refreshed one
        assert_eq!(session.refresh_otp(Some(&first)).await.unwrap(), "222222");

        let err = session.refresh_otp(Some(&second)).await.unwrap_err();
        assert!(matches!(err, RegistryError::OtpRejected));
        assert_eq!(prompter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejected_cli_otp_is_fatal() {
        let client = Arc::new(FakeRegistry::new().with_user("ada"));
        let prompter = Arc::new(ScriptedPrompter::new(&["222222"]));
        let session = session(client, prompter.clone(), None, Some("111111"));

        let err = session.refresh_otp(Some("111111")).await.unwrap_err();
        assert!(matches!(err, RegistryError::OtpRejected));
        assert_eq!(prompter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_challenge_without_otp_prompts() {
        let client = Arc::new(FakeRegistry::new().with_user("ada"));
        let prompter = Arc::new(ScriptedPrompter::new(&["424242"]));
        let session = session(client, prompter.clone(), None, None);

        assert_eq!(session.refresh_otp(None).await.unwrap(), "424242");
        assert_eq!(session.acquire_otp().await.unwrap().as_deref(), Some("424242"));
        assert_eq!(prompter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_interactive_prompter_errors() {
        let err = NonInteractivePrompter.prompt(OTP_PROMPT).await.unwrap_err();
        assert!(err.to_string().contains("--otp"));
    }
}
