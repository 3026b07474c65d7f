//! memberbridge-auth
//!
//! Verification of member tokens minted by the membership issuer:
//!
//! - **Key cache**: fetches the issuer's JWKS, caches it with a TTL, refreshes once on
//!   an unknown `kid`, and keeps serving the last good set through fetch outages.
//! - **Token verifier**: header parsing, a pinned `RS512` algorithm, `kid`-scoped key
//!   lookup, signature and `iss`/`aud`/`exp` checks, and a non-empty subject.
//!
//! ## Quick start
//! ```no_run
//! use std::sync::Arc;
//! use memberbridge_auth::{DEFAULT_JWKS_TTL, KeyCache, TokenVerifier, TrustConfig};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(TrustConfig::new(
//!     "https://members.example",
//!     "session-secret",
//!     DEFAULT_JWKS_TTL,
//! ));
//! let keys = Arc::new(KeyCache::for_config(&config)?);
//! let verifier = TokenVerifier::new(config, keys);
//!
//! let identity = verifier.verify("eyJ...").await?;
//! println!("sub={}", identity.sub);
//! # Ok(()) }
//! ```

#![forbid(unsafe_code)]

mod config;
mod error;
mod jwks;
mod jwt;

pub use config::{DEFAULT_JWKS_TTL, JWKS_FETCH_TIMEOUT, TrustConfig};
pub use error::{Error, Result, TokenError};
#[cfg(feature = "fetch-reqwest")]
pub use jwks::HttpJwksFetcher;
pub use jwks::{Jwk, JwksFetcher, JwksSet, KeyCache, StaticJwksFetcher};
pub use jwt::{PINNED_ALGORITHM, TokenVerifier};
