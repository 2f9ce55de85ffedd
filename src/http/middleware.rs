//! Operational middleware: rate limiting and response logging.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use tracing::{error, warn};

use crate::cache::INTERNAL_REPLAY_HEADER;
use crate::config::RateLimitSettings;

/// Fixed-window request limiter keyed by client address.
///
/// Static assets get a larger budget; internally issued replay requests are
/// never limited.
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    static_max_requests: u32,
    buckets: DashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(settings: &RateLimitSettings) -> Self {
        let max_requests = settings.max_requests.get();
        Self {
            window: settings.window,
            max_requests,
            static_max_requests: max_requests.saturating_mul(settings.static_multiplier.get()),
            buckets: DashMap::new(),
        }
    }

    /// Record a request for `key`; returns whether it is allowed and how
    /// many slots remain in the current window.
    pub fn allow(&self, key: &str, is_static: bool) -> (bool, u32) {
        let limit = self.limit(is_static);
        let bucket_key = format!("{key}:{}", if is_static { "static" } else { "page" });
        let now = Instant::now();
        let window = self.window;

        let mut entry = self.buckets.entry(bucket_key).or_default();
        entry.retain(|instant| now.duration_since(*instant) < window);

        let remaining = limit.saturating_sub(entry.len() as u32);
        if remaining == 0 {
            return (false, 0);
        }

        entry.push(now);
        (true, remaining.saturating_sub(1))
    }

    pub fn limit(&self, is_static: bool) -> u32 {
        if is_static {
            self.static_max_requests
        } else {
            self.max_requests
        }
    }

    pub fn retry_after_secs(&self) -> u64 {
        self.window.as_secs().max(1)
    }
}

/// Enforce the request budget; replay traffic bypasses the limiter.
pub async fn rate_limit_layer(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.headers().contains_key(INTERNAL_REPLAY_HEADER) {
        return next.run(request).await;
    }

    let key = client_key(&request);
    let is_static = is_static_asset(request.uri().path());
    let (allowed, _remaining) = limiter.allow(&key, is_static);

    if !allowed {
        warn!(
            target = "statio::http::rate_limit",
            client = %key,
            path = %request.uri().path(),
            "request rejected by rate limiter"
        );
        let mut response = (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&limiter.retry_after_secs().to_string()) {
            headers.insert("retry-after", value);
        }
        if let Ok(value) = HeaderValue::from_str(&limiter.limit(is_static).to_string()) {
            headers.insert("x-ratelimit-limit", value);
        }
        return response;
    }

    next.run(request).await
}

/// Log client and server errors with timing.
pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;
    let status = response.status();

    if status.is_server_error() {
        error!(
            target = "statio::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            query = uri.query().unwrap_or(""),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "request failed",
        );
    } else if status.is_client_error() {
        warn!(
            target = "statio::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            query = uri.query().unwrap_or(""),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "client request error",
        );
    }

    response
}

fn client_key(request: &Request<Body>) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "local".to_string())
}

fn is_static_asset(path: &str) -> bool {
    const STATIC_PREFIXES: [&str; 5] = [
        "/assets/",
        "/static/",
        "/favicon.ico",
        "/robots.txt",
        "/manifest.json",
    ];
    STATIC_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}
