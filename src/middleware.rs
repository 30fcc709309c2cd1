//! Request-level cache middleware.
//!
//! Caches GET requests on policy-listed API routes and serves cached
//! JSON responses with freshness headers. Stale entries are still served
//! here (the handler is already consumed by the time staleness is known);
//! background refresh belongs to callers of
//! [`ContentCache::get_with_revalidate`](crate::ContentCache::get_with_revalidate).

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, instrument};

use crate::entry::CacheEntry;
use crate::keys::{RequestKey, etag_for};
use crate::swr::ContentCache;

/// Largest handler response the middleware will buffer for caching.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Maps request paths to cacheable content types. Longest prefix wins;
/// unmatched paths bypass the cache entirely.
#[derive(Debug, Clone, Default)]
pub struct RoutePolicy {
    routes: Vec<(String, String)>,
}

impl RoutePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// The content API's standard routes.
    pub fn content_api_defaults() -> Self {
        Self::new()
            .route("/api/posts/", "post")
            .route("/api/posts", "posts")
            .route("/api/categories", "categories")
            .route("/api/sitemap", "sitemap")
    }

    pub fn route(mut self, prefix: impl Into<String>, content_type: impl Into<String>) -> Self {
        self.routes.push((prefix.into(), content_type.into()));
        self
    }

    /// Content type and path remainder for a covered path. The remainder
    /// (everything after the matched prefix) becomes the key body, so
    /// `/api/posts/hello` under the `post` route keys as `post:hello`,
    /// the shape webhook invalidation patterns target.
    pub fn match_path<'a>(&self, path: &'a str) -> Option<(&str, &'a str)> {
        self.routes
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(prefix, content_type)| (content_type.as_str(), &path[prefix.len()..]))
    }
}

/// Shared cache state for the middleware.
#[derive(Clone)]
pub struct RequestCacheState {
    pub cache: Arc<ContentCache>,
    pub policy: Arc<RoutePolicy>,
}

impl RequestCacheState {
    pub fn new(cache: Arc<ContentCache>, policy: RoutePolicy) -> Self {
        Self {
            cache,
            policy: Arc::new(policy),
        }
    }
}

/// Middleware for response caching on content API routes.
///
/// Only GET requests on policy routes participate; everything else is
/// passed through untouched. Only 200 JSON responses are stored.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn request_cache_layer(
    State(state): State<RequestCacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let started = Instant::now();

    if request.method() != Method::GET {
        return next.run(request).await;
    }

    let path = request.uri().path().to_string();
    let Some((content_type, remainder)) = state
        .policy
        .match_path(&path)
        .map(|(content_type, remainder)| (content_type.to_string(), remainder.to_string()))
    else {
        return next.run(request).await;
    };
    let query = request.uri().query().unwrap_or("").to_string();

    let user_scoped = state
        .cache
        .config()
        .user_scoped
        .iter()
        .any(|scoped| scoped == &content_type);
    let mut key = RequestKey::new(content_type, remainder).query(&query);
    if user_scoped {
        if let Some(token) = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
        {
            key = key.auth_token(token);
        }
    }
    let key = key.build();

    if let Some(entry) = state.cache.store().get(&key).await {
        let body = match serde_json::to_vec(&entry.data) {
            Ok(body) => body,
            Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        };
        let etag = etag_for(&body);

        if if_none_match_matches(request.headers(), &etag) {
            debug!(%key, outcome = "not_modified", "serving 304");
            return not_modified(&etag, &entry, user_scoped, started);
        }

        debug!(%key, outcome = "hit", stale = entry.is_stale(), "serving cached response");
        return cached_response(body, &etag, &entry, user_scoped, "HIT", started);
    }

    debug!(%key, outcome = "miss", "cache miss, executing handler");
    let response = next.run(request).await;
    if response.status() != StatusCode::OK || !is_json(&response) {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let value: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        // not actually JSON; return it uncached
        Err(_) => return Response::from_parts(parts, Body::from(bytes)),
    };

    // serve the canonical stored form, so the validator and body match
    // what later hits produce regardless of the handler's field order
    let canonical = match serde_json::to_vec(&value) {
        Ok(canonical) => canonical,
        Err(_) => return Response::from_parts(parts, Body::from(bytes)),
    };

    state.cache.set(&key, value, None).await;
    let entry = state
        .cache
        .store()
        .get_stale(&key)
        .unwrap_or_else(|| unreachable_entry(&key));
    let etag = etag_for(&canonical);
    cached_response(canonical, &etag, &entry, user_scoped, "MISS", started)
}

// a set immediately followed by get_stale cannot miss; keep the
// fallback total anyway
fn unreachable_entry(key: &str) -> CacheEntry {
    CacheEntry::new(key, serde_json::Value::Null, std::time::Duration::from_secs(1), 0)
}

fn is_json(response: &Response) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"))
}

/// Compare an `If-None-Match` header against an ETag, tolerating quotes,
/// weak validators, and lists.
fn if_none_match_matches(headers: &HeaderMap, etag: &str) -> bool {
    let Some(candidates) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    candidates.split(',').any(|candidate| {
        let candidate = candidate
            .trim()
            .trim_start_matches("W/")
            .trim_matches('"');
        candidate == "*" || candidate == etag
    })
}

fn freshness_headers(
    builder: axum::http::response::Builder,
    etag: &str,
    entry: &CacheEntry,
    user_scoped: bool,
    started: Instant,
) -> axum::http::response::Builder {
    let swr_window = entry.ttl_seconds / 2;
    let mut builder = builder
        .header(header::ETAG, format!("\"{etag}\""))
        .header(
            header::CACHE_CONTROL,
            format!(
                "public, s-maxage={}, stale-while-revalidate={swr_window}",
                entry.ttl_seconds
            ),
        )
        .header("x-cache-age", entry.age().as_secs().to_string())
        .header(
            "x-response-time",
            format!("{}ms", started.elapsed().as_millis()),
        );
    if entry.is_stale() {
        builder = builder.header("x-cache-status", "STALE");
    }
    if user_scoped {
        builder = builder.header(header::VARY, HeaderValue::from_static("authorization"));
    }
    builder
}

fn cached_response(
    body: Vec<u8>,
    etag: &str,
    entry: &CacheEntry,
    user_scoped: bool,
    outcome: &'static str,
    started: Instant,
) -> Response {
    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-cache", outcome);
    freshness_headers(builder, etag, entry, user_scoped, started)
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn not_modified(etag: &str, entry: &CacheEntry, user_scoped: bool, started: Instant) -> Response {
    let builder = Response::builder()
        .status(StatusCode::NOT_MODIFIED)
        .header("x-cache", "HIT");
    freshness_headers(builder, etag, entry, user_scoped, started)
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
