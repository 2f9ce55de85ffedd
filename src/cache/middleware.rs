//! Serve/record middleware.
//!
//! Short-circuits GET requests onto cached entries, records origin responses
//! on a miss, and hands stale entries to the revalidator according to the
//! route strategy. The client always receives the origin handler's bytes on
//! a build; cache bookkeeping failures degrade to an uncached response.

use std::pin::pin;
use std::sync::{Arc, Mutex};

use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::http::context::RouteContext;

use super::{
    config::CacheConfig,
    entry::EntryMeta,
    index::{BuildToken, Index},
    keys::{self, VaryMap},
    revalidator::{RebuildJob, Revalidator},
    store::Store,
    strategy::{CacheAction, plan},
};

/// Header marking internally issued replay traffic. Operational middleware
/// (rate limiting and friends) must let requests carrying it through.
pub const INTERNAL_REPLAY_HEADER: &str = "x-internal-bootstrap";

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Shared state for the cache middleware.
#[derive(Clone)]
pub struct CacheState {
    pub config: CacheConfig,
    pub store: Arc<Store>,
    pub index: Index,
    pub revalidator: Arc<Revalidator>,
}

/// Build slot carried through a replay request's extensions so the
/// middleware commits with the revalidator's token instead of acquiring a
/// second one (which would always conflict).
#[derive(Clone)]
pub struct ReplayBuild(Arc<Mutex<Option<BuildToken>>>);

impl ReplayBuild {
    pub fn new(token: BuildToken) -> Self {
        Self(Arc::new(Mutex::new(Some(token))))
    }

    fn take(&self) -> Option<BuildToken> {
        match self.0.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

/// Middleware entry point; wire with `middleware::from_fn_with_state`.
pub async fn response_cache_layer(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() != Method::GET {
        return next.run(request).await;
    }

    let Some(route) = request.extensions().get::<RouteContext>().cloned() else {
        return next.run(request).await;
    };
    if route.canonical_path.is_empty() || !route.strategy.is_cacheable() {
        return next.run(request).await;
    }

    let key = keys::cache_key(&route.canonical_path, &route.language, &VaryMap::new());

    // A replay request always rebuilds; its build slot travels in the
    // extensions rather than through `acquire_build`.
    let replay_token = request
        .extensions()
        .get::<ReplayBuild>()
        .and_then(ReplayBuild::take);

    if replay_token.is_none() {
        let entry = cache.index.lookup(&key);
        match plan(route.strategy, entry.as_ref()) {
            CacheAction::Bypass => return next.run(request).await,
            CacheAction::ServeFresh => {
                if let Some(meta) = entry
                    && let Some(response) = serve_cached(&cache, &meta, &request, "HIT", true)
                {
                    return response;
                }
                // unreadable entry was discarded; fall through and rebuild
            }
            CacheAction::ServeStaleAsyncRebuild => {
                if let Some(meta) = entry
                    && let Some(response) = serve_cached(&cache, &meta, &request, "STALE", true)
                {
                    cache.revalidator.enqueue(RebuildJob {
                        key: key.clone(),
                        canonical_path: route.canonical_path.clone(),
                        language: route.language.clone(),
                    });
                    return response;
                }
            }
            CacheAction::ServeStaleSyncRebuild => {
                // Serve the stale copy one last time; dropping the entry
                // makes the next request rebuild synchronously.
                if let Some(meta) = entry
                    && let Some(response) = serve_cached(&cache, &meta, &request, "STALE", false)
                {
                    cache.index.remove(&key);
                    if let Err(error) = cache.store.delete(&key) {
                        warn!(
                            target = "statio::cache::middleware",
                            key = %key,
                            error = %error,
                            "failed to delete stale entry"
                        );
                    }
                    return response;
                }
            }
            CacheAction::BuildAndServe => {}
        }
    }

    build_and_serve(cache, key, route, replay_token, request, next).await
}

async fn build_and_serve(
    cache: CacheState,
    key: String,
    route: RouteContext,
    replay_token: Option<BuildToken>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let token = match replay_token {
        Some(token) => Some(token),
        None => match cache.index.acquire_build(&key) {
            Ok(token) => Some(token),
            Err(notify) => {
                // Someone else is already building this key. Wait briefly for
                // their commit instead of stampeding the handler; if nothing
                // lands, run the handler without caching.
                let mut notified = pin!(notify.notified());
                notified.as_mut().enable();

                if let Some(response) = serve_committed(&cache, &key, &request) {
                    return response;
                }
                let _ = timeout(cache.config.build_wait, notified).await;
                if let Some(response) = serve_committed(&cache, &key, &request) {
                    return response;
                }

                debug!(
                    target = "statio::cache::middleware",
                    key = %key,
                    "concurrent build did not materialise; serving uncached"
                );
                None
            }
        },
    };

    let response = next.run(request).await;

    let Some(token) = token else {
        return response;
    };

    if response.status() != StatusCode::OK {
        debug!(
            target = "statio::cache::middleware",
            key = %key,
            status = response.status().as_u16(),
            "not caching non-200 response"
        );
        cache.index.abort(token);
        return response;
    }

    // Cheap pre-check so oversized responses are never buffered in full.
    if let Some(length) = content_length(&response)
        && length > cache.config.max_body_bytes as u64
    {
        debug!(
            target = "statio::cache::middleware",
            key = %key,
            content_length = length,
            limit = cache.config.max_body_bytes,
            "response exceeds buffer cap; passing through"
        );
        cache.index.abort(token);
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(error) => {
            warn!(
                target = "statio::cache::middleware",
                key = %key,
                error = %error,
                "failed to buffer response body"
            );
            cache.index.abort(token);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if bytes.is_empty() || bytes.len() > cache.config.max_body_bytes {
        debug!(
            target = "statio::cache::middleware",
            key = %key,
            body_len = bytes.len(),
            "response body empty or over cap; passing through"
        );
        cache.index.abort(token);
        return Response::from_parts(parts, Body::from(bytes));
    }

    let etag = keys::payload_etag(&bytes);
    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let mut meta = EntryMeta::new(
        key.as_str(),
        route.canonical_path.as_str(),
        route.language.as_str(),
        route.strategy,
        content_type,
        etag.as_str(),
    );
    if let Some(previous) = cache.index.lookup(&key) {
        meta.created_at = previous.created_at;
    }

    match cache.store.put(meta, &bytes) {
        Ok(meta) => {
            let etag_value = keys::etag_header(&meta.etag);
            cache.index.commit(token, meta);

            let mut response = Response::from_parts(parts, Body::from(bytes));
            apply_cache_headers(&mut response, &etag_value, "MISS");
            response
        }
        Err(error) => {
            warn!(
                target = "statio::cache::middleware",
                key = %key,
                error = %error,
                "failed to persist entry; serving uncached"
            );
            cache.index.abort(token);
            Response::from_parts(parts, Body::from(bytes))
        }
    }
}

/// Serve the committed (non-stale) entry for `key`, if one exists.
fn serve_committed(cache: &CacheState, key: &str, request: &Request<Body>) -> Option<Response> {
    let meta = cache.index.lookup(key).filter(|meta| !meta.stale)?;
    serve_cached(cache, &meta, request, "HIT", true)
}

/// Stream a cached entry back to the client.
///
/// Returns `None` when the payload is unreadable; the entry is discarded so
/// the caller can fall through to a rebuild.
fn serve_cached(
    cache: &CacheState,
    meta: &EntryMeta,
    request: &Request<Body>,
    x_cache: &'static str,
    allow_not_modified: bool,
) -> Option<Response> {
    let etag = keys::etag_header(&meta.etag);

    if allow_not_modified
        && if_none_match_matches(request.headers().get(header::IF_NONE_MATCH), &etag)
    {
        let mut response = StatusCode::NOT_MODIFIED.into_response();
        if let Ok(value) = HeaderValue::from_str(&etag) {
            response.headers_mut().insert(header::ETAG, value);
        }
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        return Some(response);
    }

    match cache.store.read_payload(meta) {
        Ok(payload) => {
            let mut response = Response::new(Body::from(payload));
            if let Ok(value) = HeaderValue::from_str(&meta.content_type) {
                response.headers_mut().insert(header::CONTENT_TYPE, value);
            }
            apply_cache_headers(&mut response, &etag, x_cache);
            Some(response)
        }
        Err(error) => {
            warn!(
                target = "statio::cache::middleware",
                key = %meta.key,
                error = %error,
                "unreadable cache entry; discarding"
            );
            cache.index.remove(&meta.key);
            let _ = cache.store.delete(&meta.key);
            None
        }
    }
}

fn apply_cache_headers(response: &mut Response, etag: &str, x_cache: &'static str) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(etag) {
        headers.insert(header::ETAG, value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(X_CACHE, HeaderValue::from_static(x_cache));
}

fn if_none_match_matches(value: Option<&HeaderValue>, etag: &str) -> bool {
    let Some(value) = value.and_then(|value| value.to_str().ok()) else {
        return false;
    };
    if value.trim() == "*" {
        return true;
    }
    value.split(',').any(|candidate| candidate.trim() == etag)
}

fn content_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}
