//! Redirect-out / callback-in login flow and the guard that starts it.

mod gate;
mod handshake;

pub use gate::{GateDecision, SessionGate, end_session};
pub use handshake::{
    GateRedirect, INVALID_STATE, LoginHandshake, MISSING_TOKEN, SERVICE_UNAVAILABLE, mint_state,
    safe_next_path,
};

/// Where members land when no usable return path survives validation.
pub const DEFAULT_RETURN_PATH: &str = "/";
