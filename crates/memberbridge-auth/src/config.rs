//! Trust parameters derived from the issuer origin.

use std::fmt;
use std::time::Duration;

/// Default lifetime of a cached key set.
pub const DEFAULT_JWKS_TTL: Duration = Duration::from_secs(300);

/// Network timeout for one key-set fetch.
pub const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

const ISSUER_PATH: &str = "/members/api";
const JWKS_PATH: &str = "/members/.well-known/jwks.json";
const LOGIN_GATE_PATH: &str = "/app-login/";

/// What this service trusts about the issuer.
///
/// Issuer, audience and key-set URL are all derived from the origin so they
/// cannot drift apart. Audience equals issuer; the issuer mints member tokens
/// that way.
#[derive(Clone)]
pub struct TrustConfig {
    issuer_origin: String,
    expected_issuer: String,
    expected_audience: String,
    jwks_url: String,
    jwks_cache_ttl: Duration,
    session_secret: String,
}

impl TrustConfig {
    pub fn new(
        issuer_origin: &str,
        session_secret: impl Into<String>,
        jwks_cache_ttl: Duration,
    ) -> Self {
        let origin = issuer_origin.trim_end_matches('/').to_string();
        Self {
            expected_issuer: format!("{origin}{ISSUER_PATH}"),
            expected_audience: format!("{origin}{ISSUER_PATH}"),
            jwks_url: format!("{origin}{JWKS_PATH}"),
            issuer_origin: origin,
            jwks_cache_ttl,
            session_secret: session_secret.into(),
        }
    }

    pub fn issuer_origin(&self) -> &str {
        &self.issuer_origin
    }

    pub fn expected_issuer(&self) -> &str {
        &self.expected_issuer
    }

    pub fn expected_audience(&self) -> &str {
        &self.expected_audience
    }

    pub fn jwks_url(&self) -> &str {
        &self.jwks_url
    }

    /// Where unauthenticated members are sent to sign in.
    pub fn login_gate_url(&self) -> String {
        format!("{}{LOGIN_GATE_PATH}", self.issuer_origin)
    }

    pub fn jwks_cache_ttl(&self) -> Duration {
        self.jwks_cache_ttl
    }

    pub fn session_secret(&self) -> &str {
        &self.session_secret
    }
}

impl fmt::Debug for TrustConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustConfig")
            .field("issuer_origin", &self.issuer_origin)
            .field("expected_issuer", &self.expected_issuer)
            .field("expected_audience", &self.expected_audience)
            .field("jwks_url", &self.jwks_url)
            .field("jwks_cache_ttl", &self.jwks_cache_ttl)
            .field("session_secret", &"<redacted>")
            .finish()
    }
}
