//! Session cookie attributes.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use httpdate::fmt_http_date;
use memberbridge_api::BridgeError;

const HOST_PREFIX: &str = "__Host-";

/// Cross-site policy sent with the session cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    /// Only honoured by browsers together with `Secure`.
    None,
}

impl SameSite {
    pub fn as_str(self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SameSite {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(SameSite::Strict),
            "lax" => Ok(SameSite::Lax),
            "none" => Ok(SameSite::None),
            _ => Err(BridgeError::Config(format!(
                "invalid SameSite value {s:?} (expected Strict, Lax or None)"
            ))),
        }
    }
}

/// How the session cookie is rendered. `HttpOnly` is always set.
#[derive(Debug, Clone)]
pub struct CookieOptions {
    /// Base name; [`CookieOptions::effective_name`] adds any prefix.
    pub name: String,
    pub path: String,
    pub domain: Option<String>,
    pub secure: bool,
    pub same_site: SameSite,
    /// Use the `__Host-` prefix when no domain is set. Needs `Path=/` and `Secure`.
    pub use_host_prefix: bool,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            name: "memberbridge_session".to_string(),
            path: "/".to_string(),
            domain: None,
            secure: true,
            same_site: SameSite::Lax,
            use_host_prefix: false,
        }
    }
}

impl CookieOptions {
    /// Reject attribute combinations browsers silently drop.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.same_site == SameSite::None && !self.secure {
            return Err(BridgeError::Config(
                "SameSite=None cookies must be Secure".to_string(),
            ));
        }
        self.effective_name().map(drop)
    }

    /// Name as sent to the browser, including any prefix.
    pub fn effective_name(&self) -> Result<String, BridgeError> {
        if !self.use_host_prefix || self.domain.is_some() {
            return Ok(self.name.clone());
        }
        if self.path != "/" || !self.secure {
            return Err(BridgeError::Validation(format!(
                "{HOST_PREFIX} cookies need Path=/ and Secure"
            )));
        }
        let bare = self.name.trim_start_matches(HOST_PREFIX);
        Ok(format!("{HOST_PREFIX}{bare}"))
    }

    fn render(
        &self,
        value: &str,
        lifetime: Option<(u64, SystemTime)>,
    ) -> Result<String, BridgeError> {
        let mut out = format!("{}={value}; Path={}", self.effective_name()?, self.path);
        if let Some(domain) = &self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if self.secure {
            out.push_str("; Secure");
        }
        out.push_str("; HttpOnly; SameSite=");
        out.push_str(self.same_site.as_str());
        if let Some((max_age, expires)) = lifetime {
            // Expires is kept for clients that ignore Max-Age.
            out.push_str(&format!(
                "; Max-Age={max_age}; Expires={}",
                fmt_http_date(expires)
            ));
        }
        Ok(out)
    }
}

/// `Set-Cookie` value for `value`. Without `max_age_seconds` the cookie
/// lasts for the browser session.
pub fn build_set_cookie(
    value: &str,
    max_age_seconds: Option<u64>,
    opts: &CookieOptions,
) -> Result<String, BridgeError> {
    let lifetime =
        max_age_seconds.map(|secs| (secs, SystemTime::now() + Duration::from_secs(secs)));
    opts.render(value, lifetime)
}

/// `Set-Cookie` value that makes the browser drop the cookie.
pub fn build_clear_cookie(opts: &CookieOptions) -> Result<String, BridgeError> {
    opts.render("", Some((0, UNIX_EPOCH)))
}

/// Pull one cookie's value out of a `Cookie` request header.
pub fn find_cookie<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}
