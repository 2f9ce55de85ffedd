//! Origin handlers for registered routes.
//!
//! The generic content handler renders a complete HTML document from the
//! route definition; deployments plug real handlers in by name through
//! `method_router_for`. Handlers always set `Content-Type` before the body
//! goes out, as the cache recorder expects.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{MethodRouter, get},
};
use tracing::warn;

use super::AppState;
use super::context::RouteContext;
use super::routes::RouteRegistry;

/// Shared state for the site handlers.
#[derive(Clone)]
pub struct SiteState {
    pub registry: Arc<RouteRegistry>,
    pub default_language: String,
}

/// Select the handler registered under `name`; unknown names fall back to
/// the generic content handler.
pub fn method_router_for(name: &str) -> MethodRouter<AppState> {
    match name {
        "" | "content" => get(content),
        other => {
            warn!(
                target = "statio::http::handlers",
                handler = other,
                "unknown handler name, using content handler"
            );
            get(content)
        }
    }
}

/// Render the page for the resolved route.
pub async fn content(State(site): State<SiteState>, request: axum::extract::Request) -> Response {
    let Some(route) = request.extensions().get::<RouteContext>() else {
        return not_found_page(&site);
    };
    let Some(def) = site.registry.def_for_canonical(&route.canonical_path) else {
        return not_found_page(&site);
    };

    let language = if route.language.is_empty() {
        &site.default_language
    } else {
        &route.language
    };

    Html(format!(
        "<!doctype html>\n\
         <html lang=\"{language}\">\n\
         <head>\n\
         <meta charset=\"utf-8\">\n\
         <title>{title}</title>\n\
         <link rel=\"canonical\" href=\"{canonical}\">\n\
         </head>\n\
         <body data-template=\"{template}\">\n\
         <main id=\"content\"></main>\n\
         </body>\n\
         </html>\n",
        title = if def.title.is_empty() {
            &def.canonical
        } else {
            &def.title
        },
        canonical = def.canonical,
        template = def.template,
    ))
    .into_response()
}

/// `/` redirects to the default-language home.
pub async fn root_redirect(State(site): State<SiteState>) -> Response {
    let location = site
        .registry
        .url_for("/", &site.default_language)
        .unwrap_or_else(|| format!("/{}", site.default_language));

    let mut response = StatusCode::FOUND.into_response();
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    response
}

pub async fn livez() -> &'static str {
    "ok"
}

pub async fn readyz() -> &'static str {
    "ok"
}

pub async fn not_found(State(site): State<SiteState>) -> Response {
    not_found_page(&site)
}

fn not_found_page(site: &SiteState) -> Response {
    let language = &site.default_language;
    (
        StatusCode::NOT_FOUND,
        Html(format!(
            "<!doctype html>\n\
             <html lang=\"{language}\">\n\
             <head><meta charset=\"utf-8\"><title>Not Found</title></head>\n\
             <body><h1>404</h1><p>This page does not exist.</p></body>\n\
             </html>\n"
        )),
    )
        .into_response()
}
