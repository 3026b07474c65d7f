use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use memberbridge_api::{
    CallbackOutcome, CallbackSubmission, ReplyStatus, SessionStore, VerifiedIdentity,
    session_keys,
};
use memberbridge_auth::{Error, TokenVerifier};
use serde_json::Value;

use crate::DEFAULT_RETURN_PATH;

const STATE_BYTES: usize = 24;

pub const INVALID_STATE: &str = "Invalid authentication state";
pub const MISSING_TOKEN: &str = "Missing token";
pub const SERVICE_UNAVAILABLE: &str = "Authentication service temporarily unavailable";

/// Redirect to the issuer's login gate for one login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateRedirect {
    pub location: String,
    pub state: String,
}

/// Both halves of the login flow. Holds no per-client state; everything
/// pending lives in the caller's session.
#[derive(Debug, Clone)]
pub struct LoginHandshake {
    verifier: TokenVerifier,
    callback_url: String,
}

impl LoginHandshake {
    pub fn new(verifier: TokenVerifier, callback_url: impl Into<String>) -> Self {
        Self {
            verifier,
            callback_url: callback_url.into(),
        }
    }

    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    pub fn callback_url(&self) -> &str {
        &self.callback_url
    }

    /// Start a login attempt for `requested_path` (path plus query).
    ///
    /// A fresh state replaces any attempt already pending in `session`.
    pub fn begin(&self, session: &mut dyn SessionStore, requested_path: &str) -> GateRedirect {
        let next = safe_next_path(Some(requested_path));
        let state = mint_state();
        session.set(session_keys::PENDING_STATE, Value::from(state.as_str()));
        session.set(session_keys::PENDING_RETURN, Value::from(next.as_str()));

        let return_url = format!(
            "{}?next={}&state={}",
            self.callback_url,
            urlencoding::encode(&next),
            urlencoding::encode(&state)
        );
        let location = format!(
            "{}?r={}",
            self.verifier.config().login_gate_url(),
            urlencoding::encode(&return_url)
        );
        tracing::debug!(next = %next, "redirecting to login gate");

        GateRedirect { location, state }
    }

    /// Finish a login attempt from the callback submission.
    ///
    /// The pending slot is consumed before anything else is checked, so a
    /// state value is good for exactly one submission.
    pub async fn complete(
        &self,
        session: &mut dyn SessionStore,
        submission: &CallbackSubmission,
    ) -> CallbackOutcome {
        let expected = session
            .remove(session_keys::PENDING_STATE)
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.is_empty());
        let pending_return = session
            .remove(session_keys::PENDING_RETURN)
            .and_then(|v| v.as_str().map(str::to_string));

        let state_matches = matches!(
            (submission.state(), expected.as_deref()),
            (Some(got), Some(want)) if got == want
        );
        if !state_matches {
            tracing::warn!(
                has_state = submission.state().is_some(),
                has_expected_state = expected.is_some(),
                "callback rejected: invalid authentication state"
            );
            return CallbackOutcome::failure(ReplyStatus::BadRequest, INVALID_STATE);
        }

        let next = safe_next_path(submission.next().or(pending_return.as_deref()));

        let Some(token) = submission.token() else {
            return CallbackOutcome::failure(ReplyStatus::BadRequest, MISSING_TOKEN);
        };

        match self.verifier.verify(token).await {
            Ok(identity) => {
                tracing::info!(sub = %identity.sub, iat = identity.iat, "member signed in");
                establish(session, &identity);
                CallbackOutcome::success(next)
            }
            Err(Error::Token(err)) => {
                tracing::warn!(error = %err, "member token rejected");
                CallbackOutcome::failure(ReplyStatus::Unauthorized, err.to_string())
            }
            Err(err) => {
                tracing::error!(error = %err, "token verification unavailable");
                CallbackOutcome::failure(ReplyStatus::ServiceUnavailable, SERVICE_UNAVAILABLE)
            }
        }
    }
}

fn establish(session: &mut dyn SessionStore, identity: &VerifiedIdentity) {
    session.set(session_keys::SUBJECT, Value::from(identity.sub.as_str()));
    session.set(session_keys::ISSUED_AT, Value::from(identity.iat));
    session.set(session_keys::EXPIRES_AT, Value::from(identity.exp));
    session.mark_permanent();
}

/// Fresh anti-forgery value: 24 CSPRNG bytes, base64url without padding.
pub fn mint_state() -> String {
    URL_SAFE_NO_PAD.encode(rand::random::<[u8; STATE_BYTES]>())
}

/// Collapse anything that is not a same-origin relative path to `/`.
pub fn safe_next_path(candidate: Option<&str>) -> String {
    match candidate {
        Some(path) if is_local_path(path) => path.to_string(),
        _ => DEFAULT_RETURN_PATH.to_string(),
    }
}

fn is_local_path(path: &str) -> bool {
    path.starts_with('/')
        && !path.starts_with("//")
        && !path.starts_with("/\\")
        && !path.chars().any(char::is_control)
}
