use std::sync::Arc;

use memberbridge_api::{SessionStore, VerifiedIdentity, session_identity};

use crate::handshake::{GateRedirect, LoginHandshake};

/// Result of guarding a protected operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision<T> {
    Redirect(GateRedirect),
    Proceed(T),
}

/// Redirect-or-proceed guard in front of protected operations.
#[derive(Debug, Clone)]
pub struct SessionGate {
    handshake: Arc<LoginHandshake>,
}

impl SessionGate {
    pub fn new(handshake: Arc<LoginHandshake>) -> Self {
        Self { handshake }
    }

    /// Run `op` with the signed-in identity, or start a login attempt for
    /// `requested_path` without running it.
    pub fn guard<T>(
        &self,
        session: &mut dyn SessionStore,
        requested_path: &str,
        op: impl FnOnce(VerifiedIdentity) -> T,
    ) -> GateDecision<T> {
        match session_identity(session) {
            Some(identity) => GateDecision::Proceed(op(identity)),
            None => GateDecision::Redirect(self.handshake.begin(session, requested_path)),
        }
    }
}

/// Sign the member out.
pub fn end_session(session: &mut dyn SessionStore) {
    session.clear();
}
