use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type Subject = String;

/// Session keys written by the login handshake.
pub mod session_keys {
    pub const SUBJECT: &str = "member_sub";
    pub const ISSUED_AT: &str = "member_iat";
    pub const EXPIRES_AT: &str = "member_exp";
    /// Anti-forgery state for a login attempt in flight.
    pub const PENDING_STATE: &str = "member_auth_state";
    /// Path the member originally asked for before being sent to the issuer.
    pub const PENDING_RETURN: &str = "member_auth_next";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedIdentity {
    pub sub: Subject,
    pub iat: i64,
    pub exp: i64,
}

/// Body posted by the callback page. Fields stay untyped so that a wrong JSON
/// type is reported the same way as a missing field.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackSubmission {
    #[serde(default)]
    pub token: Option<Value>,
    #[serde(default)]
    pub state: Option<Value>,
    #[serde(default)]
    pub next: Option<Value>,
}

impl CallbackSubmission {
    pub fn token(&self) -> Option<&str> {
        non_empty_str(self.token.as_ref())
    }

    pub fn state(&self) -> Option<&str> {
        non_empty_str(self.state.as_ref())
    }

    pub fn next(&self) -> Option<&str> {
        non_empty_str(self.next.as_ref())
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    BadRequest,
    Unauthorized,
    ServiceUnavailable,
}

impl ReplyStatus {
    pub fn http_code(self) -> u16 {
        match self {
            ReplyStatus::Ok => 200,
            ReplyStatus::BadRequest => 400,
            ReplyStatus::Unauthorized => 401,
            ReplyStatus::ServiceUnavailable => 503,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackOutcome {
    pub status: ReplyStatus,
    pub reply: CallbackReply,
}

impl CallbackOutcome {
    pub fn success(redirect: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Ok,
            reply: CallbackReply {
                ok: true,
                redirect: Some(redirect.into()),
                error: None,
            },
        }
    }

    pub fn failure(status: ReplyStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            reply: CallbackReply {
                ok: false,
                redirect: None,
                error: Some(error.into()),
            },
        }
    }
}

/// Identity fields as exposed by the session identity endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityView {
    pub sub: Option<Subject>,
    pub iat: Option<i64>,
    pub exp: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Key/value state scoped to one browser client.
pub trait SessionStore: Send {
    fn get(&self, key: &str) -> Option<&Value>;
    fn set(&mut self, key: &str, value: Value);
    fn remove(&mut self, key: &str) -> Option<Value>;
    fn clear(&mut self);
    /// Switch the session to the fixed absolute lifetime.
    fn mark_permanent(&mut self);
}

/// Reads the verified identity out of a session, if the member is signed in.
pub fn session_identity(session: &dyn SessionStore) -> Option<VerifiedIdentity> {
    let sub = session
        .get(session_keys::SUBJECT)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())?;
    Some(VerifiedIdentity {
        sub: sub.to_string(),
        iat: session
            .get(session_keys::ISSUED_AT)
            .and_then(Value::as_i64)
            .unwrap_or_default(),
        exp: session
            .get(session_keys::EXPIRES_AT)
            .and_then(Value::as_i64)
            .unwrap_or_default(),
    })
}

pub fn identity_view(session: &dyn SessionStore) -> IdentityView {
    IdentityView {
        sub: session
            .get(session_keys::SUBJECT)
            .and_then(Value::as_str)
            .map(str::to_string),
        iat: session.get(session_keys::ISSUED_AT).and_then(Value::as_i64),
        exp: session.get(session_keys::EXPIRES_AT).and_then(Value::as_i64),
    }
}

/// Plain map-backed session, handy for callers that keep state elsewhere.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapSession {
    pub values: BTreeMap<String, Value>,
    pub permanent: bool,
}

impl SessionStore for MapSession {
    fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    fn clear(&mut self) {
        self.values.clear();
        self.permanent = false;
    }

    fn mark_permanent(&mut self) {
        self.permanent = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn submission_ignores_non_string_fields() {
        let sub: CallbackSubmission =
            serde_json::from_value(json!({"token": 42, "state": "", "next": "/a"})).unwrap();
        assert_eq!(sub.token(), None);
        assert_eq!(sub.state(), None);
        assert_eq!(sub.next(), Some("/a"));
    }

    #[test]
    fn failure_reply_omits_redirect() {
        let out = CallbackOutcome::failure(ReplyStatus::Unauthorized, "verification failed");
        let body = serde_json::to_value(&out.reply).unwrap();
        assert_eq!(body, json!({"ok": false, "error": "verification failed"}));
        assert_eq!(out.status.http_code(), 401);
    }

    #[test]
    fn identity_requires_subject() {
        let mut session = MapSession::default();
        session.set(session_keys::ISSUED_AT, json!(10));
        assert!(session_identity(&session).is_none());
        assert_eq!(identity_view(&session).iat, Some(10));

        session.set(session_keys::SUBJECT, json!("member-1"));
        session.set(session_keys::EXPIRES_AT, json!(20));
        assert_eq!(
            session_identity(&session),
            Some(VerifiedIdentity {
                sub: "member-1".to_string(),
                iat: 10,
                exp: 20,
            })
        );
    }
}
