//! Error types.

use thiserror::Error;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a presented token is refused.
///
/// The rendered messages are what callers see. They are deliberately coarse;
/// the specific cause of a signature or claim failure only goes to the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    /// Header segment is missing or is not a base64url JSON object.
    #[error("invalid header")]
    InvalidHeader,

    /// Header has no `kid`.
    #[error("missing key id")]
    MissingKeyId,

    /// Header declares anything other than the pinned algorithm.
    #[error("unexpected algorithm")]
    UnexpectedAlgorithm,

    /// The issuer's key set has no key under the declared `kid`.
    #[error("no matching key")]
    NoMatchingKey,

    /// Signature, expiry, issuer, audience or required-claim check failed.
    #[error("verification failed")]
    VerificationFailed,

    /// `sub` decoded but is empty.
    #[error("missing subject")]
    MissingSubject,
}

/// Errors returned by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The token itself was rejected.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Unable to fetch, parse, or use the issuer's key set.
    #[error("JWKS error: {0}")]
    Jwks(String),
}

impl Error {
    /// True when the failure is about the presented token rather than the
    /// key-fetch infrastructure.
    pub fn is_token_error(&self) -> bool {
        matches!(self, Error::Token(_))
    }
}
