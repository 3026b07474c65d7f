mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use common::*;
use memberbridge_auth::{Error, HttpJwksFetcher, JwksFetcher, KeyCache};
use tokio::net::TcpListener;

const JWKS_ROUTE: &str = "/members/.well-known/jwks.json";

async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

async fn jwks(State(up): State<Arc<AtomicBool>>) -> impl IntoResponse {
    if up.load(Ordering::SeqCst) {
        (StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], JWKS_JSON).into_response()
    } else {
        StatusCode::BAD_GATEWAY.into_response()
    }
}

#[tokio::test]
async fn fetches_issuer_key_set() {
    let up = Arc::new(AtomicBool::new(true));
    let origin = serve(Router::new().route(JWKS_ROUTE, get(jwks)).with_state(up)).await;
    let config = trust_config(&origin);
    let cache = KeyCache::for_config(&config).unwrap();

    let key = cache.get_key(PRIMARY_KID).await.unwrap().unwrap();
    assert_eq!(key.kty, "RSA");
    assert_eq!(cache.key_ids().await, vec![PRIMARY_KID, ALT_KID]);
}

#[tokio::test]
async fn http_error_is_a_fetch_failure() {
    let up = Arc::new(AtomicBool::new(false));
    let origin = serve(Router::new().route(JWKS_ROUTE, get(jwks)).with_state(up)).await;
    let fetcher = HttpJwksFetcher::new(format!("{origin}{JWKS_ROUTE}")).unwrap();

    assert!(matches!(fetcher.fetch().await, Err(Error::Jwks(_))));
}

#[tokio::test]
async fn payload_without_keys_list_is_rejected() {
    let origin = serve(Router::new().route(
        JWKS_ROUTE,
        get(|| async { ([(header::CONTENT_TYPE, "application/json")], r#"{"kids":[]}"#) }),
    ))
    .await;
    let fetcher = HttpJwksFetcher::new(format!("{origin}{JWKS_ROUTE}")).unwrap();

    assert!(matches!(fetcher.fetch().await, Err(Error::Jwks(_))));
}

#[tokio::test]
async fn slow_issuer_times_out() {
    let origin = serve(Router::new().route(
        JWKS_ROUTE,
        get(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            JWKS_JSON
        }),
    ))
    .await;
    let fetcher =
        HttpJwksFetcher::with_timeout(format!("{origin}{JWKS_ROUTE}"), Duration::from_millis(100))
            .unwrap();

    assert!(matches!(fetcher.fetch().await, Err(Error::Jwks(_))));
}

#[tokio::test]
async fn outage_after_first_fetch_serves_stale_keys() {
    let up = Arc::new(AtomicBool::new(true));
    let origin = serve(Router::new().route(JWKS_ROUTE, get(jwks)).with_state(Arc::clone(&up))).await;
    let fetcher = HttpJwksFetcher::new(format!("{origin}{JWKS_ROUTE}")).unwrap();
    let cache = KeyCache::new(Arc::new(fetcher), Duration::ZERO);
    assert!(cache.get_key(PRIMARY_KID).await.unwrap().is_some());

    up.store(false, Ordering::SeqCst);
    assert!(cache.get_key(PRIMARY_KID).await.unwrap().is_some());
    assert!(cache.get_key("unknown").await.unwrap().is_none());
}
