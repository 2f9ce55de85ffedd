//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "statio";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_CACHE_DIR: &str = "data/cache";
const DEFAULT_ROUTES_FILE: &str = "config/routes.json";
const DEFAULT_LANGUAGE: &str = "en";
const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;
const DEFAULT_GZIP_MIN_BYTES: usize = 1024;
const DEFAULT_REVALIDATOR_WORKERS: u32 = 2;
const DEFAULT_REVALIDATE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_REVALIDATE_QUEUE_LIMIT: usize = 64;
const DEFAULT_BUILD_WAIT_MILLIS: u64 = 5_000;
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;
const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u32 = 600;
const DEFAULT_RATE_LIMIT_STATIC_MULTIPLIER: u32 = 10;

/// Command-line arguments for the Statio binary.
#[derive(Debug, Parser)]
#[command(name = "statio", version, about = "Statio site server")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "STATIO_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP server.
    Serve(Box<ServeArgs>),
    /// Pre-render and cache every cacheable route, then exit.
    #[command(name = "prerender", aliases = ["bake", "warm", "prepare", "cache-all"])]
    Prerender(PrerenderArgs),
    /// Empty the cache directory and exit.
    #[command(name = "clear-cache", alias = "invalidate")]
    ClearCache(ClearCacheArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    #[command(flatten)]
    pub cache: CacheOverrides,

    #[command(flatten)]
    pub routes: RoutesOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the cache root directory.
    #[arg(long = "cache-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub cache_dir: Option<PathBuf>,

    /// Override the maximum buffered response size in bytes.
    #[arg(long = "cache-max-body-bytes", value_name = "BYTES")]
    pub cache_max_body_bytes: Option<usize>,

    /// Override the revalidator worker count.
    #[arg(long = "cache-revalidator-workers", value_name = "COUNT")]
    pub cache_revalidator_workers: Option<u32>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RoutesOverrides {
    /// Override the routes definition file.
    #[arg(long = "routes-file", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub routes_file: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PrerenderArgs {
    #[command(flatten)]
    pub cache: CacheOverrides,

    #[command(flatten)]
    pub routes: RoutesOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ClearCacheArgs {
    #[command(flatten)]
    pub cache: CacheOverrides,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub routes: RoutesSettings,
    pub rate_limit: RateLimitSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub directory: PathBuf,
    pub max_body_bytes: NonZeroUsize,
    pub gzip_min_bytes: usize,
    pub revalidator_workers: NonZeroU32,
    pub revalidate_timeout: Duration,
    pub revalidate_queue_limit: NonZeroUsize,
    pub build_wait: Duration,
}

#[derive(Debug, Clone)]
pub struct RoutesSettings {
    pub file: PathBuf,
    pub default_language: String,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub window: Duration,
    pub max_requests: NonZeroU32,
    pub static_multiplier: NonZeroU32,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Parse CLI arguments and load settings in one step.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let cli = CliArgs::parse();
    let settings = load(&cli)?;
    Ok((cli, settings))
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("STATIO").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Prerender(args)) => {
            raw.apply_cache_overrides(&args.cache);
            raw.apply_routes_overrides(&args.routes);
        }
        Some(Command::ClearCache(args)) => raw.apply_cache_overrides(&args.cache),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    routes: RawRoutesSettings,
    rate_limit: RawRateLimitSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    directory: Option<PathBuf>,
    max_body_bytes: Option<usize>,
    gzip_min_bytes: Option<usize>,
    revalidator_workers: Option<u32>,
    revalidate_timeout_seconds: Option<u64>,
    revalidate_queue_limit: Option<usize>,
    build_wait_millis: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRoutesSettings {
    file: Option<PathBuf>,
    default_language: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRateLimitSettings {
    window_seconds: Option<u64>,
    max_requests: Option<u32>,
    static_multiplier: Option<u32>,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }

        self.apply_cache_overrides(&overrides.cache);
        self.apply_routes_overrides(&overrides.routes);
    }

    fn apply_cache_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(dir) = overrides.cache_dir.as_ref() {
            self.cache.directory = Some(dir.clone());
        }
        if let Some(bytes) = overrides.cache_max_body_bytes {
            self.cache.max_body_bytes = Some(bytes);
        }
        if let Some(workers) = overrides.cache_revalidator_workers {
            self.cache.revalidator_workers = Some(workers);
        }
    }

    fn apply_routes_overrides(&mut self, overrides: &RoutesOverrides) {
        if let Some(file) = overrides.routes_file.as_ref() {
            self.routes.file = Some(file.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            routes,
            rate_limit,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            routes: build_routes_settings(routes)?,
            rate_limit: build_rate_limit_settings(rate_limit)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let directory = cache
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));

    let max_body_bytes = non_zero_usize(
        cache.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
        "cache.max_body_bytes",
    )?;

    let workers = non_zero_u32(
        cache
            .revalidator_workers
            .unwrap_or(DEFAULT_REVALIDATOR_WORKERS),
        "cache.revalidator_workers",
    )?;

    let timeout_secs = cache
        .revalidate_timeout_seconds
        .unwrap_or(DEFAULT_REVALIDATE_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "cache.revalidate_timeout_seconds",
            "must be greater than zero",
        ));
    }

    let queue_limit = non_zero_usize(
        cache
            .revalidate_queue_limit
            .unwrap_or(DEFAULT_REVALIDATE_QUEUE_LIMIT),
        "cache.revalidate_queue_limit",
    )?;

    Ok(CacheSettings {
        directory,
        max_body_bytes,
        gzip_min_bytes: cache.gzip_min_bytes.unwrap_or(DEFAULT_GZIP_MIN_BYTES),
        revalidator_workers: workers,
        revalidate_timeout: Duration::from_secs(timeout_secs),
        revalidate_queue_limit: queue_limit,
        build_wait: Duration::from_millis(
            cache.build_wait_millis.unwrap_or(DEFAULT_BUILD_WAIT_MILLIS),
        ),
    })
}

fn build_routes_settings(routes: RawRoutesSettings) -> Result<RoutesSettings, LoadError> {
    let file = routes
        .file
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ROUTES_FILE));

    let default_language = routes
        .default_language
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());

    Ok(RoutesSettings {
        file,
        default_language,
    })
}

fn build_rate_limit_settings(
    rate_limit: RawRateLimitSettings,
) -> Result<RateLimitSettings, LoadError> {
    let window_secs = rate_limit
        .window_seconds
        .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_SECS);
    if window_secs == 0 {
        return Err(LoadError::invalid(
            "rate_limit.window_seconds",
            "must be greater than zero",
        ));
    }

    let max_requests = non_zero_u32(
        rate_limit
            .max_requests
            .unwrap_or(DEFAULT_RATE_LIMIT_MAX_REQUESTS),
        "rate_limit.max_requests",
    )?;

    let static_multiplier = non_zero_u32(
        rate_limit
            .static_multiplier
            .unwrap_or(DEFAULT_RATE_LIMIT_STATIC_MULTIPLIER),
        "rate_limit.static_multiplier",
    )?;

    Ok(RateLimitSettings {
        window: Duration::from_secs(window_secs),
        max_requests,
        static_multiplier,
    })
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    format!("{host}:{port}")
        .parse()
        .map_err(|err| format!("failed to parse `{host}:{port}`: {err}"))
}

fn non_zero_u32(value: u32, key: &'static str) -> Result<NonZeroU32, LoadError> {
    NonZeroU32::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
