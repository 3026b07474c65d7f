//! memberbridge-sessions
//!
//! Concrete session storage behind the [`memberbridge_api::SessionStore`] trait:
//! server-side records in memory, addressed by an HMAC-signed id in an `HttpOnly`
//! cookie, with a fixed 24-hour absolute lifetime.

#![forbid(unsafe_code)]

mod cookie;
mod signer;
mod store;

pub use cookie::{CookieOptions, SameSite, build_clear_cookie, build_set_cookie, find_cookie};
pub use signer::SessionSigner;
pub use store::{MemorySessions, SESSION_LIFETIME, SessionData};
