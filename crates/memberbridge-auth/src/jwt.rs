//! Member token verification.

use std::sync::Arc;

use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use memberbridge_api::VerifiedIdentity;
use serde::Deserialize;

use crate::config::TrustConfig;
use crate::jwks::{Jwk, KeyCache};
use crate::{Error, Result, TokenError};

/// The only algorithm the issuer signs member tokens with.
pub const PINNED_ALGORITHM: Algorithm = Algorithm::RS512;
const PINNED_ALGORITHM_NAME: &str = "RS512";

/// Claims that must be present before any other check runs. `iat` is
/// enforced by [`MemberClaims`]; `jsonwebtoken` cannot require it by name.
const REQUIRED_CLAIMS: [&str; 4] = ["sub", "iss", "aud", "exp"];

/// Header fields read before the signature is checked.
#[derive(Debug, Deserialize)]
struct UnverifiedHeader {
    alg: Option<String>,
    kid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MemberClaims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// Verifies member tokens against the issuer's key set.
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    config: Arc<TrustConfig>,
    keys: Arc<KeyCache>,
}

impl TokenVerifier {
    pub fn new(config: Arc<TrustConfig>, keys: Arc<KeyCache>) -> Self {
        Self { config, keys }
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    pub fn keys(&self) -> &KeyCache {
        &self.keys
    }

    /// Verify `token` and return the identity it asserts.
    ///
    /// Checks run in a fixed order and stop at the first failure: header
    /// structure, `kid` presence, algorithm pin, key lookup, signature and
    /// claims, then a non-empty subject.
    pub async fn verify(&self, token: &str) -> Result<VerifiedIdentity> {
        let header = parse_unverified_header(token)?;

        let kid = header
            .kid
            .filter(|kid| !kid.is_empty())
            .ok_or(TokenError::MissingKeyId)?;

        if header.alg.as_deref() != Some(PINNED_ALGORITHM_NAME) {
            tracing::debug!(alg = ?header.alg, "token rejected: algorithm not pinned");
            return Err(TokenError::UnexpectedAlgorithm.into());
        }

        let jwk = self
            .keys
            .get_key(&kid)
            .await?
            .ok_or(TokenError::NoMatchingKey)?;

        let key = decoding_key(&jwk)?;
        let claims = self.decode_claims(token, &key)?;

        if claims.sub.is_empty() {
            return Err(TokenError::MissingSubject.into());
        }

        Ok(VerifiedIdentity {
            sub: claims.sub,
            iat: claims.iat,
            exp: claims.exp,
        })
    }

    fn decode_claims(&self, token: &str, key: &DecodingKey) -> Result<MemberClaims> {
        let mut validation = Validation::new(PINNED_ALGORITHM);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.set_issuer(&[self.config.expected_issuer()]);
        validation.set_audience(&[self.config.expected_audience()]);
        validation.set_required_spec_claims(&REQUIRED_CLAIMS);

        jsonwebtoken::decode::<MemberClaims>(token, key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::warn!(reason = ?e.kind(), "token rejected: verification failed");
                TokenError::VerificationFailed.into()
            })
    }
}

fn parse_unverified_header(token: &str) -> std::result::Result<UnverifiedHeader, TokenError> {
    let mut segments = token.split('.');
    let (Some(header), Some(_payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(TokenError::InvalidHeader);
    };

    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(header.trim_end_matches('='))
        .map_err(|_| TokenError::InvalidHeader)?;
    serde_json::from_slice(&raw).map_err(|_| TokenError::InvalidHeader)
}

fn decoding_key(jwk: &Jwk) -> Result<DecodingKey> {
    if jwk.kty != "RSA" {
        tracing::warn!(kid = ?jwk.kid, kty = %jwk.kty, "token rejected: key is not RSA");
        return Err(TokenError::VerificationFailed.into());
    }

    let n = jwk
        .n
        .as_deref()
        .ok_or_else(|| Error::Jwks("RSA JWK missing n".to_string()))?;
    let e = jwk
        .e
        .as_deref()
        .ok_or_else(|| Error::Jwks("RSA JWK missing e".to_string()))?;
    DecodingKey::from_rsa_components(n, e)
        .map_err(|err| Error::Jwks(format!("unusable RSA JWK: {err}")))
}
