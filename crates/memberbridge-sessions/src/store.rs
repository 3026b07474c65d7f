//! In-memory, server-side session records.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use memberbridge_api::{BridgeError, SessionStore};
use serde_json::Value;

use crate::cookie::{CookieOptions, build_clear_cookie, build_set_cookie, find_cookie};
use crate::signer::SessionSigner;

/// Absolute lifetime of a session, independent of activity.
pub const SESSION_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
struct StoredSession {
    values: BTreeMap<String, Value>,
    permanent: bool,
    expires_at: SystemTime,
}

/// One client's session as seen by a single request.
///
/// Changes are local until handed back to [`MemorySessions::save`].
#[derive(Debug, Clone, Default)]
pub struct SessionData {
    id: Option<String>,
    values: BTreeMap<String, Value>,
    permanent: bool,
    expires_at: Option<SystemTime>,
    dirty: bool,
    rotate: bool,
}

impl SessionData {
    /// Id of the server-side record, `None` for a session not yet saved.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl SessionStore for SessionData {
    fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
        self.dirty = true;
    }

    fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.values.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    fn clear(&mut self) {
        self.values.clear();
        self.permanent = false;
        self.rotate = false;
        self.dirty = true;
    }

    fn mark_permanent(&mut self) {
        self.permanent = true;
        self.rotate = true;
        self.dirty = true;
    }
}

/// Session records keyed by random id; the browser only holds a signed id.
#[derive(Debug)]
pub struct MemorySessions {
    entries: DashMap<String, StoredSession>,
    signer: SessionSigner,
    cookie: CookieOptions,
    cookie_name: String,
    lifetime: Duration,
}

impl MemorySessions {
    pub fn new(secret: &str, cookie: CookieOptions) -> Result<Self, BridgeError> {
        cookie.validate()?;
        let cookie_name = cookie.effective_name()?;
        Ok(Self {
            entries: DashMap::new(),
            signer: SessionSigner::new(secret)?,
            cookie,
            cookie_name,
            lifetime: SESSION_LIFETIME,
        })
    }

    /// Override the absolute lifetime.
    #[must_use]
    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load the session named by the request's `Cookie` header. Unknown,
    /// forged or expired ids all yield a fresh, empty session.
    pub fn load(&self, cookie_header: Option<&str>) -> SessionData {
        let Some(id) = cookie_header
            .and_then(|header| find_cookie(header, &self.cookie_name))
            .and_then(|value| self.signer.verify(value))
        else {
            return SessionData::default();
        };

        let now = SystemTime::now();
        let found = self.entries.get(id).map(|entry| entry.value().clone());
        let stored = match found {
            Some(stored) if stored.expires_at > now => stored,
            Some(_) => {
                self.entries.remove(id);
                tracing::debug!("session expired");
                return SessionData::default();
            }
            None => return SessionData::default(),
        };

        SessionData {
            id: Some(id.to_string()),
            values: stored.values,
            permanent: stored.permanent,
            expires_at: Some(stored.expires_at),
            dirty: false,
            rotate: false,
        }
    }

    /// Persist `session` and return the `Set-Cookie` value to send, if any.
    ///
    /// Marking a session permanent issues a new id and restarts the absolute
    /// lifetime; the previous record is dropped.
    pub fn save(&self, mut session: SessionData) -> Result<Option<String>, BridgeError> {
        if !session.dirty {
            return Ok(None);
        }

        if session.values.is_empty() {
            return match session.id.take() {
                Some(id) => {
                    self.entries.remove(&id);
                    build_clear_cookie(&self.cookie).map(Some)
                }
                None => Ok(None),
            };
        }

        let now = SystemTime::now();
        let record = |expires_at| StoredSession {
            values: session.values,
            permanent: session.permanent,
            expires_at,
        };

        let (id, expires_at) = match (session.id.take(), session.expires_at) {
            (Some(id), Some(expires_at)) if !session.rotate => {
                // Update in place only; a record removed by a concurrent
                // request (logout, rotation) stays removed.
                let Some(mut entry) = self.entries.get_mut(&id) else {
                    tracing::debug!("session removed concurrently, not restoring it");
                    return build_clear_cookie(&self.cookie).map(Some);
                };
                *entry = record(expires_at);
                (id, expires_at)
            }
            (previous, _) => {
                if let Some(old) = previous {
                    self.entries.remove(&old);
                }
                self.purge_expired(now);
                let id = new_session_id();
                let expires_at = now + self.lifetime;
                self.entries.insert(id.clone(), record(expires_at));
                (id, expires_at)
            }
        };

        let max_age = session.permanent.then(|| {
            expires_at
                .duration_since(now)
                .unwrap_or_default()
                .as_secs()
        });
        build_set_cookie(&self.signer.sign(&id), max_age, &self.cookie).map(Some)
    }

    /// Remove `keys` from the stored record and keep in `session` only the
    /// values this call actually removed.
    ///
    /// The removal happens under the record's map lock, so when several
    /// requests hold copies of the same session, each value reaches at most
    /// one of them. A session that is not stored keeps nothing.
    pub fn consume(&self, session: &mut SessionData, keys: &[&str]) {
        let mut taken = Vec::new();
        if let Some(id) = session.id.as_deref() {
            if let Some(mut entry) = self.entries.get_mut(id) {
                for key in keys {
                    if let Some(value) = entry.values.remove(*key) {
                        taken.push(((*key).to_string(), value));
                    }
                }
            }
        }

        for key in keys {
            session.values.remove(*key);
        }
        session.values.extend(taken);
    }

    /// Drop every record whose absolute lifetime has run out.
    pub fn purge_expired(&self, now: SystemTime) {
        self.entries.retain(|_, stored| stored.expires_at > now);
    }
}

fn new_session_id() -> String {
    URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>())
}
