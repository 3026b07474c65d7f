//! Signed session identifiers.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use memberbridge_api::BridgeError;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Binds a session id to the service's session secret so a cookie value
/// cannot be forged or guessed into another member's session.
#[derive(Clone)]
pub struct SessionSigner {
    mac: HmacSha256,
}

impl SessionSigner {
    pub fn new(secret: &str) -> Result<Self, BridgeError> {
        if secret.is_empty() {
            return Err(BridgeError::Config("session secret is empty".to_string()));
        }
        let mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
            .map_err(|e| BridgeError::Config(format!("unusable session secret: {e}")))?;
        Ok(Self { mac })
    }

    /// `<id>.<mac>` as stored in the cookie.
    pub fn sign(&self, session_id: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(session_id.as_bytes());
        let tag = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{session_id}.{tag}")
    }

    /// Returns the session id when the tag checks out.
    pub fn verify<'a>(&self, cookie_value: &'a str) -> Option<&'a str> {
        let (session_id, tag) = cookie_value.rsplit_once('.')?;
        let tag = URL_SAFE_NO_PAD.decode(tag).ok()?;
        let mut mac = self.mac.clone();
        mac.update(session_id.as_bytes());
        mac.verify_slice(&tag).ok()?;
        Some(session_id)
    }
}

impl std::fmt::Debug for SessionSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionSigner(<redacted>)")
    }
}
