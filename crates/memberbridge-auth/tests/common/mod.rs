#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use memberbridge_auth::{KeyCache, StaticJwksFetcher, TokenVerifier, TrustConfig};
use serde_json::{Value, json};

pub const ORIGIN: &str = "https://members.example";
pub const ISSUER: &str = "https://members.example/members/api";
pub const PRIMARY_KID: &str = "member-key-1";
pub const ALT_KID: &str = "member-key-2";
pub const JWKS_JSON: &str = include_str!("../../../../testdata/jwks.json");

pub fn primary_key() -> EncodingKey {
    EncodingKey::from_rsa_der(include_bytes!("../../../../testdata/issuer_rsa.der"))
}

pub fn alt_key() -> EncodingKey {
    EncodingKey::from_rsa_der(include_bytes!("../../../../testdata/issuer_rsa_alt.der"))
}

pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

pub fn member_claims(sub: &str) -> Value {
    let iat = now();
    json!({
        "sub": sub,
        "iss": ISSUER,
        "aud": ISSUER,
        "iat": iat,
        "exp": iat + 3600,
    })
}

pub fn sign_with(alg: Algorithm, kid: Option<&str>, claims: &Value, key: &EncodingKey) -> String {
    let mut header = Header::new(alg);
    header.kid = kid.map(str::to_string);
    jsonwebtoken::encode(&header, claims, key).unwrap()
}

pub fn sign(claims: &Value) -> String {
    sign_with(Algorithm::RS512, Some(PRIMARY_KID), claims, &primary_key())
}

pub fn trust_config(origin: &str) -> Arc<TrustConfig> {
    Arc::new(TrustConfig::new(origin, "test-secret", Duration::from_secs(300)))
}

pub fn verifier() -> TokenVerifier {
    let fetcher = StaticJwksFetcher::from_json(JWKS_JSON).unwrap();
    let keys = KeyCache::new(Arc::new(fetcher), Duration::from_secs(300));
    TokenVerifier::new(trust_config(ORIGIN), Arc::new(keys))
}
