//! HTTP surface tests: the request-cache middleware, the signed webhook
//! endpoint, and the operator routes, exercised through `tower::oneshot`.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::Path;
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use dispensa::{
    CacheConfig, ContentCache, RequestCacheState, RoutePolicy, SIGNATURE_HEADER,
    WebhookSettings, ops_routes, request_cache_layer, signature_for, webhook_routes,
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

const SECRET: &str = "test-secret";

fn test_cache() -> Arc<ContentCache> {
    let config = CacheConfig {
        webhook: WebhookSettings {
            enabled: true,
            secret: SECRET.to_string(),
        },
        ..Default::default()
    };
    Arc::new(ContentCache::new(config).expect("cache config"))
}

/// Handlers embed a per-invocation marker so a cached response is
/// distinguishable from a re-executed handler.
async fn list_posts() -> Json<Value> {
    Json(json!({"posts": ["first", "second"], "marker": Uuid::new_v4()}))
}

async fn create_post() -> Json<Value> {
    Json(json!({"created": true, "marker": Uuid::new_v4()}))
}

async fn show_post(Path(slug): Path<String>) -> Json<Value> {
    Json(json!({"slug": slug, "marker": Uuid::new_v4()}))
}

async fn current_user() -> Json<Value> {
    Json(json!({"name": "anonymous", "marker": Uuid::new_v4()}))
}

/// Hand-built body with fields out of alphabetical order, unlike the
/// key-sorted form `serde_json` serializes.
async fn list_categories() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/json")],
        format!(
            r#"{{"total":2,"categories":["rust","cache"],"marker":"{}"}}"#,
            Uuid::new_v4()
        ),
    )
}

fn app(cache: &Arc<ContentCache>) -> Router {
    let state = RequestCacheState::new(Arc::clone(cache), RoutePolicy::content_api_defaults());
    Router::new()
        .route("/api/posts", get(list_posts).post(create_post))
        .route("/api/posts/{slug}", get(show_post))
        .route("/api/categories", get(list_categories))
        .route("/api/users/me", get(current_user))
        .layer(axum::middleware::from_fn_with_state(
            state,
            request_cache_layer,
        ))
        .merge(webhook_routes(Arc::clone(cache)))
        .merge(ops_routes(Arc::clone(cache)))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("infallible router");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, headers, body)
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[tokio::test]
async fn miss_then_hit_serves_the_cached_payload() {
    let cache = test_cache();
    let app = app(&cache);

    let (status, headers, first) = send(&app, get_request("/api/posts?page=1&limit=20")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(header_str(&headers, "x-cache"), Some("MISS"));
    assert!(header_str(&headers, header::ETAG.as_str()).is_some());
    assert_eq!(
        header_str(&headers, header::CACHE_CONTROL.as_str()),
        Some("public, s-maxage=300, stale-while-revalidate=150")
    );
    assert!(header_str(&headers, "x-response-time").is_some());

    let (status, headers, second) = send(&app, get_request("/api/posts?page=1&limit=20")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(header_str(&headers, "x-cache"), Some("HIT"));
    assert_eq!(header_str(&headers, "x-cache-age"), Some("0"));
    assert_eq!(first["marker"], second["marker"]);
}

#[tokio::test]
async fn query_parameter_order_does_not_fragment_the_cache() {
    let cache = test_cache();
    let app = app(&cache);

    let (_, _, first) = send(&app, get_request("/api/posts?page=1&limit=20")).await;
    let (_, headers, second) = send(&app, get_request("/api/posts?limit=20&page=1")).await;
    assert_eq!(header_str(&headers, "x-cache"), Some("HIT"));
    assert_eq!(first["marker"], second["marker"]);
}

#[tokio::test]
async fn conditional_request_gets_304() {
    let cache = test_cache();
    let app = app(&cache);

    let (_, headers, _) = send(&app, get_request("/api/posts")).await;
    let etag = header_str(&headers, header::ETAG.as_str())
        .expect("etag on miss")
        .to_string();

    let request = Request::builder()
        .uri("/api/posts")
        .header(header::IF_NONE_MATCH, &etag)
        .body(Body::empty())
        .expect("request");
    let (status, headers, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);
    assert_eq!(header_str(&headers, "x-cache"), Some("HIT"));
    assert_eq!(header_str(&headers, header::ETAG.as_str()), Some(etag.as_str()));
    assert_eq!(body, Value::Null);
}

#[tokio::test]
async fn etag_is_stable_across_miss_and_hit() {
    let cache = test_cache();
    let app = app(&cache);

    let (_, headers, _) = send(&app, get_request("/api/categories")).await;
    let miss_etag = header_str(&headers, header::ETAG.as_str())
        .expect("etag on miss")
        .to_string();

    let (_, headers, _) = send(&app, get_request("/api/categories")).await;
    assert_eq!(header_str(&headers, "x-cache"), Some("HIT"));
    assert_eq!(
        header_str(&headers, header::ETAG.as_str()),
        Some(miss_etag.as_str())
    );

    let request = Request::builder()
        .uri("/api/categories")
        .header(header::IF_NONE_MATCH, &miss_etag)
        .body(Body::empty())
        .expect("request");
    let (status, _, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn non_get_requests_bypass_the_cache() {
    let cache = test_cache();
    let app = app(&cache);

    let post = || {
        Request::builder()
            .method("POST")
            .uri("/api/posts")
            .body(Body::empty())
            .expect("request")
    };
    let (_, headers, first) = send(&app, post()).await;
    assert_eq!(header_str(&headers, "x-cache"), None);
    let (_, _, second) = send(&app, post()).await;
    assert_ne!(first["marker"], second["marker"]);
}

#[tokio::test]
async fn unlisted_routes_bypass_the_cache() {
    let cache = test_cache();
    let app = app(&cache);

    let (_, headers, first) = send(&app, get_request("/api/users/me")).await;
    assert_eq!(header_str(&headers, "x-cache"), None);
    let (_, _, second) = send(&app, get_request("/api/users/me")).await;
    assert_ne!(first["marker"], second["marker"]);
}

#[tokio::test]
async fn auth_scoped_content_is_partitioned_per_token() {
    let cache = test_cache();
    let app = app(&cache);
    let with_auth = |token: &str| {
        Request::builder()
            .uri("/api/posts/hello")
            .header(header::AUTHORIZATION, token)
            .body(Body::empty())
            .expect("request")
    };

    let (_, headers, alice) = send(&app, with_auth("Bearer aaa")).await;
    assert_eq!(header_str(&headers, header::VARY.as_str()), Some("authorization"));
    let (_, headers, bob) = send(&app, with_auth("Bearer bbb")).await;
    assert_eq!(header_str(&headers, "x-cache"), Some("MISS"));
    assert_ne!(alice["marker"], bob["marker"]);

    let (_, headers, alice_again) = send(&app, with_auth("Bearer aaa")).await;
    assert_eq!(header_str(&headers, "x-cache"), Some("HIT"));
    assert_eq!(alice["marker"], alice_again["marker"]);
}

#[tokio::test]
async fn signed_webhook_invalidates_cached_routes() {
    let cache = test_cache();
    let app = app(&cache);

    let (_, _, cached) = send(&app, get_request("/api/posts/hello")).await;
    let (_, headers, _) = send(&app, get_request("/api/posts/hello")).await;
    assert_eq!(header_str(&headers, "x-cache"), Some("HIT"));

    let payload = r#"{"type":"post.updated","data":{"slug":"hello"}}"#;
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/content")
        .header(SIGNATURE_HEADER, signature_for(payload.as_bytes(), SECRET))
        .body(Body::from(payload))
        .expect("request");
    let (status, _, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["invalidated"][0], "post:hello");

    let (_, headers, refetched) = send(&app, get_request("/api/posts/hello")).await;
    assert_eq!(header_str(&headers, "x-cache"), Some("MISS"));
    assert_ne!(cached["marker"], refetched["marker"]);
}

#[tokio::test]
async fn webhook_rejects_bad_signatures() {
    let cache = test_cache();
    let app = app(&cache);
    let payload = r#"{"type":"bulk.update"}"#;

    let unsigned = Request::builder()
        .method("POST")
        .uri("/webhooks/content")
        .body(Body::from(payload))
        .expect("request");
    let (status, _, _) = send(&app, unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let forged = Request::builder()
        .method("POST")
        .uri("/webhooks/content")
        .header(SIGNATURE_HEADER, signature_for(payload.as_bytes(), "wrong"))
        .body(Body::from(payload))
        .expect("request");
    let (status, _, _) = send(&app, forged).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn webhook_rejects_malformed_payloads() {
    let cache = test_cache();
    let app = app(&cache);
    let payload = "not json at all";

    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/content")
        .header(SIGNATURE_HEADER, signature_for(payload.as_bytes(), SECRET))
        .body(Body::from(payload))
        .expect("request");
    let (status, _, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "malformed payload");
}

#[tokio::test]
async fn operator_routes_report_and_administer_the_cache() {
    let cache = test_cache();
    let app = app(&cache);

    send(&app, get_request("/api/posts")).await;
    send(&app, get_request("/api/posts")).await;

    let (status, _, metrics) = send(&app, get_request("/cache/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["sets"], 1);
    assert_eq!(metrics["hits"], 1);

    let (status, _, report) = send(&app, get_request("/cache/inspect")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["local"].as_array().expect("local entries").len(), 1);

    let (status, _, health) = send(&app, get_request("/cache/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(health["status"].is_string());

    let invalidate = Request::builder()
        .method("POST")
        .uri("/cache/invalidate")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"pattern":"posts:*"}"#))
        .expect("request");
    let (status, _, outcome) = send(&app, invalidate).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["removed"], 1);

    let clear = Request::builder()
        .method("POST")
        .uri("/cache/clear")
        .body(Body::empty())
        .expect("request");
    let (status, _, _) = send(&app, clear).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(cache.store().is_empty());
}
