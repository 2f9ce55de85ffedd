//! Cache bootstrap.
//!
//! Replays every cacheable route through the live router so the cache is
//! fully populated before external traffic arrives. Requests carry the
//! internal replay header so operational middleware stays out of the way,
//! but go through the normal serve/record path: an already-fresh entry is a
//! HIT, everything else is built.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
};
use futures::{StreamExt, stream};
use tower::ServiceExt;
use tracing::{info, warn};

use crate::http::routes::RouteRegistry;

use super::middleware::INTERNAL_REPLAY_HEADER;

const SOURCE: &str = "statio::cache::warmer";

// Small fan-out; the per-key build lock keeps overlapping keys safe.
const WARM_CONCURRENCY: usize = 4;

/// Outcome of one bootstrap run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WarmSummary {
    /// Entries already cached and fresh.
    pub hits: usize,
    /// Entries built by this run.
    pub misses: usize,
    /// Routes that answered with a non-200 status.
    pub failures: usize,
    /// Routes that answered 5xx; these make the run fail.
    pub server_errors: usize,
}

impl WarmSummary {
    pub fn is_ok(&self) -> bool {
        self.server_errors == 0
    }

    pub fn total(&self) -> usize {
        self.hits + self.misses + self.failures
    }
}

enum WarmOutcome {
    Hit,
    Miss,
    Failed { server_error: bool },
}

/// Drives the request pipeline to warm the cache offline.
pub struct CacheWarmer {
    registry: Arc<RouteRegistry>,
    router: Router,
}

impl CacheWarmer {
    pub fn new(registry: Arc<RouteRegistry>, router: Router) -> Self {
        Self { registry, router }
    }

    /// Replay every `(canonical, language)` pair whose strategy is
    /// cacheable, with a small bounded fan-out.
    pub async fn run(&self) -> WarmSummary {
        let mut targets = Vec::new();
        for route in self.registry.routes() {
            if !route.strategy.is_cacheable() {
                info!(
                    target = SOURCE,
                    canonical = %route.canonical,
                    "skipping dynamic route"
                );
                continue;
            }
            for (language, url) in &route.paths {
                targets.push((route.canonical.clone(), language.clone(), url.clone()));
            }
        }

        let outcomes: Vec<WarmOutcome> = stream::iter(targets)
            .map(|(canonical, language, url)| {
                let router = self.router.clone();
                async move { warm_one(router, &canonical, &language, &url).await }
            })
            .buffer_unordered(WARM_CONCURRENCY)
            .collect()
            .await;

        let mut summary = WarmSummary::default();
        for outcome in outcomes {
            match outcome {
                WarmOutcome::Hit => summary.hits += 1,
                WarmOutcome::Miss => summary.misses += 1,
                WarmOutcome::Failed { server_error } => {
                    summary.failures += 1;
                    if server_error {
                        summary.server_errors += 1;
                    }
                }
            }
        }

        info!(
            target = SOURCE,
            hits = summary.hits,
            misses = summary.misses,
            failures = summary.failures,
            server_errors = summary.server_errors,
            "bootstrap finished"
        );

        summary
    }
}

async fn warm_one(router: Router, canonical: &str, language: &str, url: &str) -> WarmOutcome {
    let request = Request::builder()
        .method(Method::GET)
        .uri(url)
        .header(INTERNAL_REPLAY_HEADER, "true")
        .body(Body::empty());
    let request = match request {
        Ok(request) => request,
        Err(err) => {
            warn!(
                target = SOURCE,
                canonical = %canonical,
                url = %url,
                error = %err,
                "failed to build replay request"
            );
            return WarmOutcome::Failed {
                server_error: false,
            };
        }
    };

    let response = match router.oneshot(request).await {
        Ok(response) => response,
        Err(infallible) => match infallible {},
    };

    let status = response.status();
    if status == StatusCode::OK {
        let x_cache = response
            .headers()
            .get("x-cache")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        info!(
            target = SOURCE,
            canonical = %canonical,
            language = %language,
            url = %url,
            outcome = %x_cache,
            "route warmed"
        );
        if x_cache == "HIT" {
            WarmOutcome::Hit
        } else {
            WarmOutcome::Miss
        }
    } else {
        warn!(
            target = SOURCE,
            canonical = %canonical,
            language = %language,
            url = %url,
            status = status.as_u16(),
            "route failed to warm"
        );
        WarmOutcome::Failed {
            server_error: status.is_server_error(),
        }
    }
}
