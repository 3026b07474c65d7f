use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use memberbridge_api::BridgeError;
use memberbridge_auth::{DEFAULT_JWKS_TTL, TrustConfig};
use memberbridge_sessions::{CookieOptions, SameSite};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "memberbridge.toml";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:5000";

pub const ENV_SESSION_SECRET: &str = "APP_SESSION_SECRET";
pub const ENV_ISSUER_ORIGIN: &str = "ISSUER_ORIGIN";
pub const ENV_CALLBACK_URL: &str = "APP_CALLBACK_URL";
pub const ENV_JWKS_CACHE_TTL: &str = "JWKS_CACHE_TTL_SECONDS";
pub const ENV_COOKIE_SECURE: &str = "SESSION_COOKIE_SECURE";
pub const ENV_COOKIE_SAMESITE: &str = "SESSION_COOKIE_SAMESITE";
pub const ENV_BIND_ADDR: &str = "BIND_ADDR";

/// Everything the service needs at startup. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub trust: TrustConfig,
    pub callback_url: String,
    pub cookie: CookieOptions,
    pub bind_addr: SocketAddr,
}

/// Optional file layer. The environment always wins over it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub session_secret: Option<String>,
    pub issuer_origin: Option<String>,
    pub callback_url: Option<String>,
    pub jwks_cache_ttl_seconds: Option<u64>,
    pub session_cookie_secure: Option<bool>,
    pub session_cookie_samesite: Option<String>,
    pub bind_addr: Option<String>,
}

/// Printable view of the effective configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub issuer_origin: String,
    pub expected_issuer: String,
    pub expected_audience: String,
    pub jwks_url: String,
    pub jwks_cache_ttl_seconds: u64,
    pub callback_url: String,
    pub cookie_name: String,
    pub cookie_secure: bool,
    pub cookie_samesite: String,
    pub bind_addr: String,
    pub session_secret: &'static str,
}

impl AppConfig {
    /// Load from the process environment, layered over `memberbridge.toml` in
    /// `config_dir` when that file exists.
    pub fn load(config_dir: Option<&Path>) -> Result<Self, BridgeError> {
        let file = match config_dir {
            Some(dir) => load_file_config(&dir.join(CONFIG_FILE_NAME))?,
            None => FileConfig::default(),
        };
        Self::from_sources(|name| std::env::var(name).ok(), &file)
    }

    pub fn from_sources(
        env: impl Fn(&str) -> Option<String>,
        file: &FileConfig,
    ) -> Result<Self, BridgeError> {
        let setting = |name: &str, from_file: Option<String>| {
            env(name)
                .filter(|v| !v.trim().is_empty())
                .or(from_file)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let session_secret = setting(ENV_SESSION_SECRET, file.session_secret.clone());
        let issuer_origin = setting(ENV_ISSUER_ORIGIN, file.issuer_origin.clone());
        let callback_url = setting(ENV_CALLBACK_URL, file.callback_url.clone());

        let (Some(session_secret), Some(issuer_origin), Some(callback_url)) =
            (&session_secret, &issuer_origin, &callback_url)
        else {
            let missing: Vec<&str> = [
                (ENV_SESSION_SECRET, session_secret.is_none()),
                (ENV_ISSUER_ORIGIN, issuer_origin.is_none()),
                (ENV_CALLBACK_URL, callback_url.is_none()),
            ]
            .into_iter()
            .filter_map(|(name, absent)| absent.then_some(name))
            .collect();
            return Err(BridgeError::Config(format!(
                "missing required settings: {}",
                missing.join(", ")
            )));
        };

        require_http_url(ENV_ISSUER_ORIGIN, issuer_origin)?;
        require_http_url(ENV_CALLBACK_URL, callback_url)?;

        let ttl = match setting(
            ENV_JWKS_CACHE_TTL,
            file.jwks_cache_ttl_seconds.map(|v| v.to_string()),
        ) {
            Some(raw) => Duration::from_secs(raw.parse::<u64>().map_err(|_| {
                BridgeError::Config(format!(
                    "{ENV_JWKS_CACHE_TTL} must be a non-negative integer, got {raw:?}"
                ))
            })?),
            None => DEFAULT_JWKS_TTL,
        };

        let secure = setting(
            ENV_COOKIE_SECURE,
            file.session_cookie_secure.map(|v| v.to_string()),
        )
        .is_none_or(|raw| parse_flag(&raw));

        let same_site = match setting(ENV_COOKIE_SAMESITE, file.session_cookie_samesite.clone()) {
            Some(raw) => raw.parse::<SameSite>()?,
            None => SameSite::Lax,
        };

        let bind_raw = setting(ENV_BIND_ADDR, file.bind_addr.clone())
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_raw.parse::<SocketAddr>().map_err(|e| {
            BridgeError::Config(format!("{ENV_BIND_ADDR} {bind_raw:?} is not a socket address: {e}"))
        })?;

        let cookie = CookieOptions {
            secure,
            same_site,
            use_host_prefix: secure,
            ..CookieOptions::default()
        };
        cookie.validate()?;

        Ok(Self {
            trust: TrustConfig::new(issuer_origin, session_secret.as_str(), ttl),
            callback_url: callback_url.trim_end_matches('/').to_string(),
            cookie,
            bind_addr,
        })
    }

    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            issuer_origin: self.trust.issuer_origin().to_string(),
            expected_issuer: self.trust.expected_issuer().to_string(),
            expected_audience: self.trust.expected_audience().to_string(),
            jwks_url: self.trust.jwks_url().to_string(),
            jwks_cache_ttl_seconds: self.trust.jwks_cache_ttl().as_secs(),
            callback_url: self.callback_url.clone(),
            cookie_name: self
                .cookie
                .effective_name()
                .unwrap_or_else(|_| self.cookie.name.clone()),
            cookie_secure: self.cookie.secure,
            cookie_samesite: self.cookie.same_site.to_string(),
            bind_addr: self.bind_addr.to_string(),
            session_secret: "<redacted>",
        }
    }
}

/// Accepts the usual spellings of "on".
fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn require_http_url(name: &str, value: &str) -> Result<(), BridgeError> {
    if value.starts_with("https://") || value.starts_with("http://") {
        Ok(())
    } else {
        Err(BridgeError::Config(format!(
            "{name} must be an http(s) URL, got {value:?}"
        )))
    }
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("memberbridge")
    } else {
        PathBuf::from(".memberbridge")
    }
}

/// Read the file layer; a missing file is an empty layer.
pub fn load_file_config(path: &Path) -> Result<FileConfig, BridgeError> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let content = fs::read_to_string(path)
        .map_err(|e| BridgeError::Config(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&content)
        .map_err(|e| BridgeError::Config(format!("invalid TOML in {}: {e}", path.display())))
}

/// Write the commented default file into `dir`. Existing files are kept
/// unless `force` is set. Returns the file path.
pub fn write_default_config_file(dir: &Path, force: bool) -> Result<PathBuf, BridgeError> {
    fs::create_dir_all(dir)
        .map_err(|e| BridgeError::Internal(format!("failed to create {}: {e}", dir.display())))?;

    let path = dir.join(CONFIG_FILE_NAME);
    if force || !path.exists() {
        fs::write(
            &path,
            include_str!("../../../docs/memberbridge/memberbridge.toml.example"),
        )
        .map_err(|e| BridgeError::Internal(format!("failed to write {}: {e}", path.display())))?;
    }
    Ok(path)
}

/// Environment snapshot helper for callers that want to inspect which
/// settings came from the environment.
pub fn env_overrides(env: impl Fn(&str) -> Option<String>) -> BTreeMap<&'static str, bool> {
    [
        ENV_SESSION_SECRET,
        ENV_ISSUER_ORIGIN,
        ENV_CALLBACK_URL,
        ENV_JWKS_CACHE_TTL,
        ENV_COOKIE_SECURE,
        ENV_COOKIE_SAMESITE,
        ENV_BIND_ADDR,
    ]
    .into_iter()
    .map(|name| (name, env(name).is_some_and(|v| !v.trim().is_empty())))
    .collect()
}
