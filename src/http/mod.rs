//! HTTP surface: router assembly, route context, handlers, middleware.

pub mod context;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod webhook;

use std::sync::Arc;

use axum::{
    Router,
    extract::FromRef,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};

use crate::cache::{CacheState, Invalidator, response_cache_layer};

pub use context::{RouteContext, route_context_layer};
pub use handlers::SiteState;
pub use middleware::{RateLimiter, log_responses, rate_limit_layer};
pub use routes::{RouteDef, RouteRegistry};

#[derive(Clone)]
pub struct AppState {
    pub site: SiteState,
    pub invalidator: Arc<Invalidator>,
}

impl FromRef<AppState> for SiteState {
    fn from_ref(state: &AppState) -> Self {
        state.site.clone()
    }
}

impl FromRef<AppState> for Arc<Invalidator> {
    fn from_ref(state: &AppState) -> Self {
        state.invalidator.clone()
    }
}

/// Assemble the full request pipeline.
///
/// Layer order, outermost first: response logging → rate limiting → route
/// context → response cache → handlers. The returned router is also what
/// gets injected into the revalidator for replay requests.
pub fn build_router(state: AppState, cache: CacheState, limiter: Arc<RateLimiter>) -> Router {
    let registry = state.site.registry.clone();

    let mut router = Router::new();
    for def in registry.routes() {
        for path in def.paths.values() {
            router = router.route(path, handlers::method_router_for(&def.handler));
            if path != "/" {
                router = router.route(
                    &format!("{path}/"),
                    handlers::method_router_for(&def.handler),
                );
            }
        }
    }

    if registry.resolve("/").is_none() {
        router = router.route("/", get(handlers::root_redirect));
    }

    router
        .route("/health/livez", get(handlers::livez))
        .route("/health/readyz", get(handlers::readyz))
        .route("/hooks/cms", post(webhook::handle))
        .fallback(handlers::not_found)
        .layer(from_fn_with_state(cache, response_cache_layer))
        .layer(from_fn_with_state(registry, route_context_layer))
        .layer(from_fn_with_state(limiter, rate_limit_layer))
        .layer(from_fn(log_responses))
        .with_state(state)
}
