//! npm registry client
//!
//! Talks to any npm-compatible registry over HTTP.
//!
//! ## Authentication
//!
//! Tokens are looked up per registry, checked in this order:
//! 1. An `//host/path/:_authToken=` entry in `~/.npmrc` whose prefix matches
//!    the request URL (longest prefix wins, `${VAR}` values are expanded)
//! 2. The `NPM_TOKEN` environment variable
//!
//! Requests without a token are sent anonymously.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use flate2::read::GzDecoder;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha512};
use tar::Archive;
use tracing::{debug, info, instrument};
use url::Url;

use crate::error::{RegistryError, Result};
use crate::traits::{RegistryClient, TagSupport};
use crate::types::{escape_package_name, Permission, PublishOptions, TwoFactorMode};

/// npm client configuration
#[derive(Debug, Clone, Default)]
pub struct NpmConfig {
    /// `(//host/path/, token)` pairs read from `.npmrc`
    pub scoped_tokens: Vec<(String, String)>,
    /// Token used when no scoped entry matches
    pub default_token: Option<String>,
}

impl NpmConfig {
    /// Create an empty config (anonymous requests)
    pub fn new() -> Self {
        Self::default()
    }

    /// Load tokens from `~/.npmrc` and `NPM_TOKEN`
    pub fn load() -> Result<Self> {
        let mut config = Self::new();

        if let Some(home_dir) = dirs::home_dir() {
            let npmrc_path = home_dir.join(".npmrc");
            if npmrc_path.exists() {
                let content = std::fs::read_to_string(&npmrc_path)?;
                config.scoped_tokens = parse_npmrc_tokens(&content);
                debug!(
                    entries = config.scoped_tokens.len(),
                    "loaded registry tokens from ~/.npmrc"
                );
            }
        }

        if let Ok(token) = std::env::var("NPM_TOKEN") {
            if !token.is_empty() {
                debug!("loaded fallback token from NPM_TOKEN");
                config.default_token = Some(token);
            }
        }

        Ok(config)
    }

    /// Set the fallback token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.default_token = Some(token.into());
        self
    }

    /// Add a token for a registry prefix such as `//npm.example.com/`
    pub fn with_scoped_token(mut self, prefix: impl Into<String>, token: impl Into<String>) -> Self {
        self.scoped_tokens.push((prefix.into(), token.into()));
        self
    }

    /// Token to send with a request to `url`
    pub fn token_for(&self, url: &Url) -> Option<&str> {
        let key = registry_key(url);
        self.scoped_tokens
            .iter()
            .filter(|(prefix, _)| key.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, token)| token.as_str())
            .or(self.default_token.as_deref())
    }
}

/// `//host[:port]/path` form used by `.npmrc` keys
fn registry_key(url: &Url) -> String {
    match url.port() {
        Some(port) => format!("//{}:{}{}", url.host_str().unwrap_or_default(), port, url.path()),
        None => format!("//{}{}", url.host_str().unwrap_or_default(), url.path()),
    }
}

/// Extract `//prefix/:_authToken=value` entries from `.npmrc` content
pub fn parse_npmrc_tokens(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let prefix = key.trim().strip_suffix(":_authToken")?;
            if !prefix.starts_with("//") {
                return None;
            }
            let value = expand_env(value.trim().trim_matches('"'));
            if value.is_empty() {
                None
            } else {
                Some((prefix.to_string(), value))
            }
        })
        .collect()
}

fn expand_env(value: &str) -> String {
    match value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        Some(name) => std::env::var(name).unwrap_or_default(),
        None => value.to_string(),
    }
}

/// Map a failed response to a registry error.
///
/// npm signals a missing or wrong one-time password with a 401 whose
/// `www-authenticate` header mentions `otp`, or whose body talks about a
/// one-time password.
pub fn classify_failure(
    status: u16,
    www_authenticate: Option<&str>,
    body: &str,
    otp_sent: bool,
) -> RegistryError {
    let otp_challenge = status == StatusCode::UNAUTHORIZED.as_u16()
        && (www_authenticate.is_some_and(|h| h.to_ascii_lowercase().contains("otp"))
            || body.to_ascii_lowercase().contains("one-time pass"));

    if otp_challenge {
        if otp_sent {
            RegistryError::OtpRejected
        } else {
            RegistryError::OtpRequired
        }
    } else {
        RegistryError::ApiError {
            status,
            message: body.to_string(),
        }
    }
}

/// npm registry client
pub struct NpmRegistry {
    config: NpmConfig,
    client: Client,
}

impl NpmRegistry {
    /// Create a new client
    pub fn new(config: NpmConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    fn endpoint(registry: &Url, path: &str) -> Result<Url> {
        registry.join(path).map_err(|e| RegistryError::InvalidUrl {
            url: format!("{}{}", registry, path),
            reason: e.to_string(),
        })
    }

    fn request(&self, method: Method, url: Url, otp: Option<&str>) -> RequestBuilder {
        let token = self.config.token_for(&url).map(str::to_string);
        let mut request = self
            .client
            .request(method, url)
            .header("Accept", "application/json");
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(otp) = otp {
            request = request.header("npm-otp", otp);
        }
        request
    }

    async fn check(response: Response, otp_sent: bool) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let www_authenticate = response
            .headers()
            .get("www-authenticate")
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(
            status.as_u16(),
            www_authenticate.as_deref(),
            &body,
            otp_sent,
        ))
    }

    /// Read a packed tarball and pull out its `package.json`
    pub async fn extract_package_info(
        path: &Path,
    ) -> Result<(serde_json::Map<String, serde_json::Value>, Vec<u8>)> {
        let tarball_data = tokio::fs::read(path).await?;

        let decoder = GzDecoder::new(&tarball_data[..]);
        let mut archive = Archive::new(decoder);
        let mut package_json_content = None;

        for entry in archive.entries()? {
            let mut entry = entry?;
            let entry_path = entry.path()?;

            // npm tarballs have package/ prefix
            if entry_path.components().count() == 2 && entry_path.ends_with("package.json") {
                let mut content = String::new();
                entry.read_to_string(&mut content)?;
                package_json_content = Some(content);
                break;
            }
        }

        let content = package_json_content.ok_or_else(|| {
            RegistryError::InvalidArtifact("No package.json found in tarball".to_string())
        })?;

        let manifest: serde_json::Value = serde_json::from_str(&content)
            .map_err(|e| RegistryError::InvalidArtifact(format!("Invalid package.json: {}", e)))?;

        match manifest {
            serde_json::Value::Object(map) => Ok((map, tarball_data)),
            _ => Err(RegistryError::InvalidArtifact(
                "package.json is not an object".to_string(),
            )),
        }
    }

    /// Build the document PUT to `/<package>` for a publish
    fn publish_payload(
        registry: &Url,
        mut manifest: serde_json::Map<String, serde_json::Value>,
        tarball_data: &[u8],
        options: &PublishOptions,
    ) -> Result<(String, serde_json::Value)> {
        let name = manifest
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RegistryError::InvalidArtifact("package.json has no name".to_string()))?
            .to_string();
        let version = manifest
            .get("version")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                RegistryError::InvalidArtifact("package.json has no version".to_string())
            })?
            .to_string();

        let integrity = format!("sha512-{}", BASE64.encode(Sha512::digest(tarball_data)));
        let filename = format!("{}-{}.tgz", name, version);
        let tarball_url =
            Self::endpoint(registry, &format!("{}/-/{}", escape_package_name(&name), filename))?;

        manifest.insert("_id".to_string(), format!("{}@{}", name, version).into());
        manifest.insert(
            "dist".to_string(),
            serde_json::json!({
                "integrity": integrity,
                "tarball": tarball_url.as_str(),
            }),
        );
        if let Some(git_head) = &options.git_head {
            manifest.insert("gitHead".to_string(), git_head.clone().into());
        }

        let description = manifest.get("description").cloned();
        let mut payload = serde_json::json!({
            "_id": name,
            "name": name,
            "description": description,
            "dist-tags": { options.tag.as_str(): version },
            "versions": { version.as_str(): manifest },
            "_attachments": {
                filename: {
                    "content_type": "application/octet-stream",
                    "data": BASE64.encode(tarball_data),
                    "length": tarball_data.len(),
                }
            },
        });
        if let (Some(access), Some(obj)) = (options.access, payload.as_object_mut()) {
            obj.insert("access".to_string(), access.to_string().into());
        }

        Ok((name, payload))
    }
}

#[async_trait]
impl RegistryClient for NpmRegistry {
    #[instrument(skip_all, fields(registry = %registry))]
    async fn whoami(&self, registry: &Url) -> Result<Option<String>> {
        let url = Self::endpoint(registry, "-/whoami")?;
        if self.config.token_for(&url).is_none() {
            debug!("no token for registry, treating identity as anonymous");
            return Ok(None);
        }

        let response = self.request(Method::GET, url, None).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }

        #[derive(Deserialize)]
        struct WhoAmI {
            username: Option<String>,
        }

        let whoami: WhoAmI = Self::check(response, false).await?.json().await?;
        Ok(whoami.username.filter(|u| !u.is_empty()))
    }

    #[instrument(skip_all, fields(registry = %registry))]
    async fn two_factor_mode(&self, registry: &Url) -> Result<TwoFactorMode> {
        let url = Self::endpoint(registry, "-/npm/v1/user")?;
        let response = self.request(Method::GET, url, None).send().await?;
        let profile: serde_json::Value = Self::check(response, false).await?.json().await?;

        // `tfa` is either an object, `false` or `null`
        let tfa = match profile.get("tfa") {
            Some(serde_json::Value::Object(tfa)) => tfa,
            _ => return Ok(TwoFactorMode::Disabled),
        };

        if tfa.get("pending").and_then(|p| p.as_bool()).unwrap_or(false) {
            return Ok(TwoFactorMode::Disabled);
        }

        Ok(match tfa.get("mode").and_then(|m| m.as_str()) {
            Some("auth-and-writes") => TwoFactorMode::AuthAndWrites,
            Some("auth-only") => TwoFactorMode::AuthOnly,
            _ => TwoFactorMode::Disabled,
        })
    }

    #[instrument(skip_all, fields(registry = %registry, username = %username))]
    async fn package_permissions(
        &self,
        registry: &Url,
        username: &str,
    ) -> Result<HashMap<String, Permission>> {
        let mut url = Self::endpoint(
            registry,
            &format!("-/user/{}/package", escape_package_name(username)),
        )?;
        url.query_pairs_mut().append_pair("format", "cli");

        let response = self.request(Method::GET, url, None).send().await?;
        let listing: HashMap<String, String> = Self::check(response, false).await?.json().await?;

        Ok(listing
            .into_iter()
            .map(|(name, permission)| (name, Permission::parse(&permission)))
            .collect())
    }

    #[instrument(skip_all, fields(registry = %registry, package = %package))]
    async fn published_versions(&self, registry: &Url, package: &str) -> Result<Vec<String>> {
        let url = Self::endpoint(registry, &escape_package_name(package))?;
        let response = self.request(Method::GET, url, None).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }

        #[derive(Deserialize)]
        struct Packument {
            #[serde(default)]
            versions: HashMap<String, serde::de::IgnoredAny>,
        }

        let packument: Packument = Self::check(response, false).await?.json().await?;
        let mut versions: Vec<String> = packument.versions.into_keys().collect();
        versions.sort();
        Ok(versions)
    }

    #[instrument(skip_all, fields(registry = %options.registry, tag = %options.tag))]
    async fn publish(&self, tarball: &Path, options: &PublishOptions) -> Result<()> {
        let (manifest, tarball_data) = Self::extract_package_info(tarball).await?;
        let (name, payload) =
            Self::publish_payload(&options.registry, manifest, &tarball_data, options)?;

        let url = Self::endpoint(&options.registry, &escape_package_name(&name))?;
        debug!(package = %name, url = %url, "uploading tarball");

        let response = self
            .request(Method::PUT, url, options.otp.as_deref())
            .json(&payload)
            .send()
            .await?;
        Self::check(response, options.otp.is_some()).await?;

        info!(package = %name, tag = %options.tag, "package uploaded");
        Ok(())
    }
}

#[async_trait]
impl TagSupport for NpmRegistry {
    #[instrument(skip_all, fields(registry = %registry, package = %package, tag = %tag))]
    async fn add_tag(
        &self,
        registry: &Url,
        package: &str,
        version: &str,
        tag: &str,
        otp: Option<&str>,
    ) -> Result<()> {
        // PUT /-/package/{package}/dist-tags/{tag}
        let url = Self::endpoint(
            registry,
            &format!("-/package/{}/dist-tags/{}", escape_package_name(package), tag),
        )?;

        let response = self
            .request(Method::PUT, url, otp)
            .json(&serde_json::json!(version))
            .send()
            .await?;
        Self::check(response, otp.is_some()).await?;

        info!(package, version, tag, "dist-tag added");
        Ok(())
    }

    #[instrument(skip_all, fields(registry = %registry, package = %package, tag = %tag))]
    async fn remove_tag(
        &self,
        registry: &Url,
        package: &str,
        tag: &str,
        otp: Option<&str>,
    ) -> Result<()> {
        // DELETE /-/package/{package}/dist-tags/{tag}
        let url = Self::endpoint(
            registry,
            &format!("-/package/{}/dist-tags/{}", escape_package_name(package), tag),
        )?;

        let response = self.request(Method::DELETE, url, otp).send().await?;
        Self::check(response, otp.is_some()).await?;

        info!(package, tag, "dist-tag removed");
        Ok(())
    }
}
