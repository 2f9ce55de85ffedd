use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use statio::{
    cache::{CacheConfig, CacheState, CacheWarmer, Index, Invalidator, Revalidator, Store},
    config::{self, Command},
    http::{self, AppState, RateLimiter, RouteRegistry, SiteState},
    infra::{InfraError, telemetry},
};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| InfraError::configuration(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(Command::Serve(Box::default()));

    telemetry::init(&settings.logging)?;

    match command {
        Command::Serve(_) => run_serve(settings).await,
        Command::Prerender(_) => run_prerender(settings).await,
        Command::ClearCache(_) => run_clear_cache(settings).await,
    }
}

struct Application {
    router: axum::Router,
    registry: Arc<RouteRegistry>,
    store: Arc<Store>,
    index: Index,
    revalidator: Arc<Revalidator>,
}

fn build_application(settings: &config::Settings) -> Result<Application, InfraError> {
    let cache_config = CacheConfig::from(&settings.cache);

    let store = Arc::new(Store::open(
        &cache_config.directory,
        cache_config.gzip_min_bytes,
    )?);
    let entries = store.load()?;
    info!(
        target = "statio::startup",
        dir = %cache_config.directory.display(),
        entries = entries.len(),
        "cache index loaded"
    );
    let index = Index::with_entries(entries);

    let registry = Arc::new(RouteRegistry::load(&settings.routes.file)?);
    let revalidator = Arc::new(Revalidator::new(
        index.clone(),
        Some(registry.clone()),
        &cache_config,
    ));
    let invalidator = Arc::new(Invalidator::new(index.clone(), store.clone()));
    let limiter = Arc::new(RateLimiter::new(&settings.rate_limit));

    let cache_state = CacheState {
        config: cache_config,
        store: store.clone(),
        index: index.clone(),
        revalidator: revalidator.clone(),
    };
    let state = AppState {
        site: SiteState {
            registry: registry.clone(),
            default_language: settings.routes.default_language.clone(),
        },
        invalidator,
    };

    let router = http::build_router(state, cache_state, limiter);

    // The revalidator replays requests through the same router that hosts
    // the cache middleware; the handle is injected once assembly is done.
    revalidator.set_router(router.clone());

    Ok(Application {
        router,
        registry,
        store,
        index,
        revalidator,
    })
}

async fn run_serve(settings: config::Settings) -> Result<(), InfraError> {
    let app = build_application(&settings)?;

    let listener = TcpListener::bind(settings.server.addr).await?;
    info!(
        target = "statio::startup",
        addr = %settings.server.addr,
        "server listening"
    );

    axum::serve(
        listener,
        app.router
            .clone()
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Drain outstanding rebuilds before the final snapshot so their commits
    // are captured; a hung rebuild must not block shutdown forever.
    if tokio::time::timeout(settings.server.graceful_shutdown, app.revalidator.shutdown())
        .await
        .is_err()
    {
        warn!(
            target = "statio::shutdown",
            "revalidator did not drain in time"
        );
    }
    app.store.snapshot(app.index.export())?;
    info!(target = "statio::shutdown", "server stopped");
    Ok(())
}

async fn run_prerender(settings: config::Settings) -> Result<(), InfraError> {
    let app = build_application(&settings)?;

    info!(target = "statio::prerender", "starting cache pre-rendering");

    let warmer = CacheWarmer::new(app.registry.clone(), app.router.clone());
    let summary = warmer.run().await;

    app.revalidator.shutdown().await;
    app.store.snapshot(app.index.export())?;

    if summary.is_ok() {
        info!(
            target = "statio::prerender",
            routes = summary.total(),
            "cache pre-rendering completed"
        );
        Ok(())
    } else {
        Err(InfraError::Prerender {
            failed: summary.server_errors,
        })
    }
}

async fn run_clear_cache(settings: config::Settings) -> Result<(), InfraError> {
    let cache_config = CacheConfig::from(&settings.cache);
    let store = Store::open(&cache_config.directory, cache_config.gzip_min_bytes)?;

    let entries = store.load().map(|entries| entries.len()).unwrap_or(0);
    store.clear()?;

    info!(
        target = "statio::clear_cache",
        dir = %cache_config.directory.display(),
        entries_removed = entries,
        "cache cleared"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
