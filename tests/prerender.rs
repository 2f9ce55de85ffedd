//! Bootstrap and full-pipeline behaviour with the assembled router.

use std::fs;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
};
use tower::ServiceExt;

use statio::cache::{
    CacheConfig, CacheState, CacheWarmer, Index, Invalidator, Revalidator, Store,
};
use statio::config::RateLimitSettings;
use statio::http::{self, AppState, RateLimiter, RouteRegistry, SiteState};

const ROUTES_JSON: &str = r#"{
  "routes": [
    {
      "canonical": "/",
      "paths": {"en": "/en"},
      "handler": "content",
      "template": "index.html",
      "title": "home.title",
      "strategy": "static"
    },
    {
      "canonical": "/features",
      "paths": {"en": "/en/features"},
      "handler": "content",
      "template": "content.html",
      "title": "features.title",
      "strategy": "incremental"
    },
    {
      "canonical": "/terms",
      "paths": {"en": "/en/terms"},
      "handler": "content",
      "template": "content.html",
      "title": "terms.title",
      "strategy": "immutable"
    },
    {
      "canonical": "/search",
      "paths": {"en": "/en/search"},
      "handler": "content",
      "template": "search.html",
      "title": "search.title",
      "strategy": "dynamic"
    }
  ]
}"#;

struct FullApp {
    router: Router,
    registry: Arc<RouteRegistry>,
    index: Index,
    store: Arc<Store>,
    _dir: tempfile::TempDir,
}

fn build_full_app(dir: tempfile::TempDir) -> FullApp {
    let routes_path = dir.path().join("routes.json");
    fs::write(&routes_path, ROUTES_JSON).unwrap();
    build_full_app_at(dir, &routes_path)
}

fn build_full_app_at(dir: tempfile::TempDir, routes_path: &Path) -> FullApp {
    let cache_dir = dir.path().join("cache");
    let config = CacheConfig {
        directory: cache_dir.clone(),
        revalidator_workers: 1,
        ..Default::default()
    };

    let store = Arc::new(Store::open(&cache_dir, config.gzip_min_bytes).unwrap());
    let index = Index::with_entries(store.load().unwrap());
    let registry = Arc::new(RouteRegistry::load(routes_path).unwrap());
    let revalidator = Arc::new(Revalidator::new(
        index.clone(),
        Some(registry.clone()),
        &config,
    ));
    let invalidator = Arc::new(Invalidator::new(index.clone(), store.clone()));
    let limiter = Arc::new(RateLimiter::new(&RateLimitSettings {
        window: Duration::from_secs(60),
        max_requests: NonZeroU32::new(10_000).unwrap(),
        static_multiplier: NonZeroU32::new(10).unwrap(),
    }));

    let cache_state = CacheState {
        config,
        store: store.clone(),
        index: index.clone(),
        revalidator: revalidator.clone(),
    };
    let state = AppState {
        site: SiteState {
            registry: registry.clone(),
            default_language: "en".to_string(),
        },
        invalidator,
    };

    let router = http::build_router(state, cache_state, limiter);
    revalidator.set_router(router.clone());

    FullApp {
        router,
        registry,
        index,
        store,
        _dir: dir,
    }
}

fn get(path: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn prerender_warms_every_cacheable_route() {
    let app = build_full_app(tempfile::tempdir().unwrap());

    let warmer = CacheWarmer::new(app.registry.clone(), app.router.clone());
    let summary = warmer.run().await;

    // three cacheable routes, the dynamic one is skipped
    assert_eq!(summary.total(), 3);
    assert_eq!(summary.misses, 3);
    assert_eq!(summary.failures, 0);
    assert!(summary.is_ok());
    assert_eq!(app.index.len(), 3);

    // a second run finds everything fresh
    let summary = warmer.run().await;
    assert_eq!(summary.hits, 3);
    assert_eq!(summary.misses, 0);

    // the dynamic route stays uncached even when requested directly
    let response = app.router.clone().oneshot(get("/en/search")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-cache").is_none());
    assert_eq!(app.index.len(), 3);
}

#[tokio::test]
async fn prerendered_entries_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let routes_path = dir.path().join("routes.json");
    fs::write(&routes_path, ROUTES_JSON).unwrap();

    let app = build_full_app_at(dir, &routes_path);
    let warmer = CacheWarmer::new(app.registry.clone(), app.router.clone());
    let summary = warmer.run().await;
    assert!(summary.is_ok());

    app.store.snapshot(app.index.export()).unwrap();

    let FullApp { _dir: dir, .. } = app;

    // reopen over the same directory
    let restarted = build_full_app_at(dir, &routes_path);
    assert_eq!(restarted.index.len(), 3);

    let response = restarted.router.clone().oneshot(get("/en")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-cache")
            .and_then(|v| v.to_str().ok()),
        Some("HIT")
    );
}

#[tokio::test]
async fn health_and_root_redirect_work() {
    let app = build_full_app(tempfile::tempdir().unwrap());

    let livez = app
        .router
        .clone()
        .oneshot(get("/health/livez"))
        .await
        .unwrap();
    assert_eq!(livez.status(), StatusCode::OK);

    let root = app.router.clone().oneshot(get("/")).await.unwrap();
    assert_eq!(root.status(), StatusCode::FOUND);
    assert_eq!(
        root.headers().get("location").and_then(|v| v.to_str().ok()),
        Some("/en")
    );
}

#[tokio::test]
async fn webhook_invalidates_through_the_full_pipeline() {
    let app = build_full_app(tempfile::tempdir().unwrap());

    let warmer = CacheWarmer::new(app.registry.clone(), app.router.clone());
    warmer.run().await;
    assert_eq!(app.index.len(), 3);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/hooks/cms")
        .header("content-type", "application/json")
        .body(Body::from(
            r#"{"event":"updated","entity":"post","action":"update"}"#,
        ))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    // static + incremental entries flip stale, the immutable one stays
    assert_eq!(json["invalidated"], 2);

    let stale = app
        .index
        .export()
        .into_iter()
        .filter(|meta| meta.stale)
        .count();
    assert_eq!(stale, 2);
}

#[tokio::test]
async fn unknown_path_is_not_cached() {
    let app = build_full_app(tempfile::tempdir().unwrap());

    let response = app.router.clone().oneshot(get("/nowhere")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(app.index.is_empty());
}
