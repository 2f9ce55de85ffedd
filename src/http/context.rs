//! Request-scoped route context.
//!
//! The route-context layer resolves the request path against the registry
//! and attaches a [`RouteContext`] extension. The cache middleware reads it;
//! requests without one (unknown paths, operational endpoints) bypass the
//! cache entirely.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};

use crate::cache::Strategy;

use super::routes::RouteRegistry;

/// Values the cache derives its key and policy from.
#[derive(Debug, Clone)]
pub struct RouteContext {
    /// Alias-independent route identifier; empty means unknown.
    pub canonical_path: String,
    /// Content locale tag; may be empty.
    pub language: String,
    pub strategy: Strategy,
}

/// Resolve the request path and attach the route context.
pub async fn route_context_layer(
    State(registry): State<Arc<RouteRegistry>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if let Some(resolved) = registry.resolve(request.uri().path()) {
        request.extensions_mut().insert(RouteContext {
            canonical_path: resolved.canonical.to_string(),
            language: resolved.language.to_string(),
            strategy: resolved.strategy,
        });
    }

    next.run(request).await
}
