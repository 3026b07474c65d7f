//! HTTP surface: protected pages, the login callback and logout.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use memberbridge_api::{
    BridgeError, CallbackSubmission, VerifiedIdentity, identity_view, session_keys,
};
use memberbridge_auth::{KeyCache, TokenVerifier};
use memberbridge_core::AppConfig;
use memberbridge_runtime::{GateDecision, LoginHandshake, SessionGate, end_session};
use memberbridge_sessions::{MemorySessions, SessionData};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::Instrument;

const CALLBACK_PAGE: &str = include_str!("callback.html");
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(600);
const USER_AGENT_LOG_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    handshake: Arc<LoginHandshake>,
    gate: SessionGate,
    sessions: Arc<MemorySessions>,
}

impl AppState {
    pub fn new(handshake: Arc<LoginHandshake>, sessions: Arc<MemorySessions>) -> Self {
        Self {
            gate: SessionGate::new(Arc::clone(&handshake)),
            handshake,
            sessions,
        }
    }

    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let trust = Arc::new(config.trust.clone());
        let keys = Arc::new(KeyCache::for_config(&trust)?);
        let verifier = TokenVerifier::new(Arc::clone(&trust), keys);
        let handshake = Arc::new(LoginHandshake::new(verifier, config.callback_url.clone()));
        let sessions = Arc::new(MemorySessions::new(
            trust.session_secret(),
            config.cookie.clone(),
        )?);
        Ok(Self::new(handshake, sessions))
    }
}

/// Failure while persisting a session; never caused by the client.
struct ServerError(BridgeError);

impl From<BridgeError> for ServerError {
    fn from(err: BridgeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/", get(home))
        .route("/api/me", get(me))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_member));

    Router::new()
        .merge(protected)
        .route("/healthz", get(healthz))
        .route("/auth/callback", get(callback_page))
        .route("/api/auth/callback", post(submit_callback))
        .route("/logout", post(logout))
        .with_state(state)
}

pub async fn serve(config: &AppConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(config)?;

    match state.handshake.verifier().keys().refresh().await {
        Ok(key_count) => tracing::info!(key_count, "issuer keys loaded"),
        Err(err) => tracing::warn!(error = %err, "issuer keys unavailable at startup"),
    }

    let sweeper = tokio::spawn(sweep_sessions(Arc::clone(&state.sessions)));

    let listener = TcpListener::bind(config.bind_addr).await?;
    tracing::info!(
        addr = %config.bind_addr,
        issuer = %config.trust.expected_issuer(),
        "memberbridge listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    tracing::info!("memberbridge stopped");
    Ok(())
}

async fn sweep_sessions(sessions: Arc<MemorySessions>) {
    let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        sessions.purge_expired(SystemTime::now());
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

async fn require_member(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ServerError> {
    let mut session = state.sessions.load(cookie_header(request.headers()));
    let requested = request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_string(), |pq| pq.to_string());

    match state.gate.guard(&mut session, &requested, |identity| identity) {
        GateDecision::Proceed(identity) => {
            tracing::debug!(sub = %identity.sub, path = %requested, "member request");
            request.extensions_mut().insert(identity);
            request.extensions_mut().insert(session);
            Ok(next.run(request).await)
        }
        GateDecision::Redirect(redirect) => {
            let cookie = state.sessions.save(session)?;
            Ok(with_cookie(found(&redirect.location), cookie))
        }
    }
}

async fn home(Extension(identity): Extension<VerifiedIdentity>) -> String {
    format!("Hello, {}", identity.sub)
}

async fn me(Extension(session): Extension<SessionData>) -> Response {
    Json(identity_view(&session)).into_response()
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true}))
}

async fn callback_page() -> Response {
    ([(header::CACHE_CONTROL, "no-store")], Html(CALLBACK_PAGE)).into_response()
}

async fn submit_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    let submission: CallbackSubmission = serde_json::from_slice(&body).unwrap_or_default();
    let user_agent: String = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .chars()
        .take(USER_AGENT_LOG_LIMIT)
        .collect();

    let mut session = state.sessions.load(cookie_header(&headers));
    state.sessions.consume(
        &mut session,
        &[session_keys::PENDING_STATE, session_keys::PENDING_RETURN],
    );
    let outcome = state
        .handshake
        .complete(&mut session, &submission)
        .instrument(tracing::info_span!("auth_callback", %user_agent))
        .await;
    let cookie = state.sessions.save(session)?;

    let status = StatusCode::from_u16(outcome.status.http_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let response = (
        status,
        [(header::CACHE_CONTROL, "no-store")],
        Json(outcome.reply),
    )
        .into_response();
    Ok(with_cookie(response, cookie))
}

async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let mut session = state.sessions.load(cookie_header(&headers));
    end_session(&mut session);
    let cookie = state.sessions.save(session)?;
    Ok(with_cookie(found("/"), cookie))
}

fn cookie_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::COOKIE).and_then(|v| v.to_str().ok())
}

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

fn with_cookie(mut response: Response, set_cookie: Option<String>) -> Response {
    if let Some(value) = set_cookie.and_then(|v| HeaderValue::from_str(&v).ok()) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    use axum::body::Body;
    use jsonwebtoken::{Algorithm, EncodingKey, Header};
    use memberbridge_auth::{StaticJwksFetcher, TrustConfig};
    use memberbridge_sessions::CookieOptions;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    const ORIGIN: &str = "https://members.example";
    const ISSUER: &str = "https://members.example/members/api";

    fn app() -> Router {
        let trust = Arc::new(TrustConfig::new(
            ORIGIN,
            "router-secret",
            Duration::from_secs(300),
        ));
        let fetcher =
            StaticJwksFetcher::from_json(include_str!("../../../testdata/jwks.json")).unwrap();
        let keys = Arc::new(KeyCache::new(Arc::new(fetcher), Duration::from_secs(300)));
        let handshake = Arc::new(LoginHandshake::new(
            TokenVerifier::new(trust, keys),
            "http://localhost:5000/auth/callback",
        ));
        let cookie = CookieOptions {
            secure: false,
            ..CookieOptions::default()
        };
        let sessions = Arc::new(MemorySessions::new("router-secret", cookie).unwrap());
        router(AppState::new(handshake, sessions))
    }

    fn token_for(sub: &str) -> String {
        let iat = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let claims =
            json!({"sub": sub, "iss": ISSUER, "aud": ISSUER, "iat": iat, "exp": iat + 600});
        let mut header = Header::new(Algorithm::RS512);
        header.kid = Some("member-key-1".to_string());
        let key = EncodingKey::from_rsa_der(include_bytes!("../../../testdata/issuer_rsa.der"));
        jsonwebtoken::encode(&header, &claims, &key).unwrap()
    }

    fn get(uri: &str, cookie: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post(uri: &str, cookie: Option<&str>, body: impl Into<Body>) -> Request {
        let mut builder = axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(body.into()).unwrap()
    }

    fn location(response: &Response) -> String {
        response.headers()[header::LOCATION]
            .to_str()
            .unwrap()
            .to_string()
    }

    /// `Set-Cookie` value reduced to the `Cookie` header a browser would send.
    fn session_cookie(response: &Response) -> String {
        response.headers()[header::SET_COOKIE]
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string()
    }

    /// State is base64url, so it survives percent-encoding unchanged.
    fn state_from(location: &str) -> String {
        location.rsplit("state%3D").next().unwrap().to_string()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_is_open() {
        let response = app().oneshot(get("/healthz", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({"ok": true}));
    }

    #[tokio::test]
    async fn anonymous_request_is_sent_to_login_gate() {
        let response = app().oneshot(get("/", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        let location = location(&response);
        assert!(location.starts_with("https://members.example/app-login/?r="));
        assert!(location.contains("next%3D%252F%26state%3D"));
        assert!(response.headers().contains_key(header::SET_COOKIE));
    }

    #[tokio::test]
    async fn login_round_trip_reaches_protected_route() {
        let app = app();

        let gate = app
            .clone()
            .oneshot(get("/api/me?tab=1", None))
            .await
            .unwrap();
        assert_eq!(gate.status(), StatusCode::FOUND);
        let pending_cookie = session_cookie(&gate);
        let state = state_from(&location(&gate));

        let body = json!({"token": token_for("member-7"), "state": state, "next": "/api/me?tab=1"});
        let callback = app
            .clone()
            .oneshot(post(
                "/api/auth/callback",
                Some(&pending_cookie),
                body.to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(callback.status(), StatusCode::OK);
        let member_cookie = session_cookie(&callback);
        assert_ne!(member_cookie, pending_cookie);
        assert_eq!(
            json_body(callback).await,
            json!({"ok": true, "redirect": "/api/me?tab=1"})
        );

        let me = app
            .clone()
            .oneshot(get("/api/me", Some(&member_cookie)))
            .await
            .unwrap();
        assert_eq!(me.status(), StatusCode::OK);
        let identity = json_body(me).await;
        assert_eq!(identity["sub"], "member-7");
        assert!(identity["exp"].as_i64().unwrap() > identity["iat"].as_i64().unwrap());

        let home = app
            .clone()
            .oneshot(get("/", Some(&member_cookie)))
            .await
            .unwrap();
        let text = axum::body::to_bytes(home.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&text[..], b"Hello, member-7");

        let stale = app
            .oneshot(get("/api/me", Some(&pending_cookie)))
            .await
            .unwrap();
        assert_eq!(stale.status(), StatusCode::FOUND);
    }

    #[tokio::test]
    async fn callback_state_is_accepted_once() {
        let app = app();
        let gate = app.clone().oneshot(get("/", None)).await.unwrap();
        let pending_cookie = session_cookie(&gate);
        let body = json!({"token": token_for("member-7"), "state": state_from(&location(&gate))});

        let first = app
            .clone()
            .oneshot(post("/api/auth/callback", Some(&pending_cookie), body.to_string()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let replay = app
            .clone()
            .oneshot(post("/api/auth/callback", Some(&pending_cookie), body.to_string()))
            .await
            .unwrap();
        assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(replay).await["error"],
            "Invalid authentication state"
        );
    }

    #[tokio::test]
    async fn malformed_body_is_an_invalid_state() {
        for body in ["not json", "[1,2,3]", "null", ""] {
            let response = app()
                .oneshot(post("/api/auth/callback", None, body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body:?}");
            assert_eq!(
                json_body(response).await,
                json!({"ok": false, "error": "Invalid authentication state"})
            );
        }
    }

    #[tokio::test]
    async fn bad_token_is_unauthorized() {
        let app = app();
        let gate = app.clone().oneshot(get("/", None)).await.unwrap();
        let cookie = session_cookie(&gate);
        let state = state_from(&location(&gate));

        let body = json!({"token": "a.b.c", "state": state});
        let response = app
            .oneshot(post("/api/auth/callback", Some(&cookie), body.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["ok"], false);
    }

    #[tokio::test]
    async fn logout_clears_session() {
        let app = app();
        let gate = app.clone().oneshot(get("/", None)).await.unwrap();
        let cookie = session_cookie(&gate);
        let state = state_from(&location(&gate));
        let body = json!({"token": token_for("member-9"), "state": state});
        let callback = app
            .clone()
            .oneshot(post("/api/auth/callback", Some(&cookie), body.to_string()))
            .await
            .unwrap();
        let member_cookie = session_cookie(&callback);

        let response = app
            .clone()
            .oneshot(post("/logout", Some(&member_cookie), Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/");
        assert!(
            response.headers()[header::SET_COOKIE]
                .to_str()
                .unwrap()
                .contains("Max-Age=0")
        );

        let after = app
            .oneshot(get("/", Some(&member_cookie)))
            .await
            .unwrap();
        assert_eq!(after.status(), StatusCode::FOUND);
    }

    #[tokio::test]
    async fn callback_page_is_served() {
        let response = app()
            .oneshot(get("/auth/callback?next=%2F&state=abc", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
        let html = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&html).contains("/api/auth/callback"));
    }
}
