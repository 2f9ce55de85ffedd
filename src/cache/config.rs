//! Cache tuning knobs.

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;
const DEFAULT_GZIP_MIN_BYTES: usize = 1024;
const DEFAULT_REVALIDATOR_WORKERS: usize = 2;
const DEFAULT_REVALIDATE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_REVALIDATE_QUEUE_LIMIT: usize = 64;
const DEFAULT_BUILD_WAIT: Duration = Duration::from_secs(5);

/// Runtime configuration for the cache subsystem.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache root directory.
    pub directory: PathBuf,
    /// Largest response body the recorder will buffer; bigger responses are
    /// streamed through uncached.
    pub max_body_bytes: usize,
    /// Minimum raw size before a textual payload is stored gzip-framed.
    pub gzip_min_bytes: usize,
    /// Revalidator worker count.
    pub revalidator_workers: usize,
    /// Per-job deadline for background rebuilds.
    pub revalidate_timeout: Duration,
    /// Bounded rebuild queue capacity.
    pub revalidate_queue_limit: usize,
    /// How long a request may wait on a concurrent build before it falls
    /// through to an uncached handler run.
    pub build_wait: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data/cache"),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            gzip_min_bytes: DEFAULT_GZIP_MIN_BYTES,
            revalidator_workers: DEFAULT_REVALIDATOR_WORKERS,
            revalidate_timeout: DEFAULT_REVALIDATE_TIMEOUT,
            revalidate_queue_limit: DEFAULT_REVALIDATE_QUEUE_LIMIT,
            build_wait: DEFAULT_BUILD_WAIT,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            directory: settings.directory.clone(),
            max_body_bytes: settings.max_body_bytes.get(),
            gzip_min_bytes: settings.gzip_min_bytes,
            revalidator_workers: settings.revalidator_workers.get() as usize,
            revalidate_timeout: settings.revalidate_timeout,
            revalidate_queue_limit: settings.revalidate_queue_limit.get(),
            build_wait: settings.build_wait,
        }
    }
}
