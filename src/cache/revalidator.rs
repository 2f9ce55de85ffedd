//! Background rebuild worker.
//!
//! Stale entries under the `incremental` strategy are refreshed off the
//! request path: the middleware enqueues the key, a worker replays the
//! canonical URL through the live router, and the middleware commits the new
//! entry with the token carried inside the replay request.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request},
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::http::routes::RouteRegistry;

use super::config::CacheConfig;
use super::index::Index;
use super::middleware::{INTERNAL_REPLAY_HEADER, ReplayBuild};

const SOURCE: &str = "statio::cache::revalidator";

/// One queued rebuild.
#[derive(Debug, Clone)]
pub struct RebuildJob {
    pub key: String,
    pub canonical_path: String,
    pub language: String,
}

struct RevalidatorInner {
    index: Index,
    registry: Option<Arc<RouteRegistry>>,
    /// Injected after the router is assembled; used only for replay requests.
    router: RwLock<Option<Router>>,
    pending: Mutex<HashSet<String>>,
    job_timeout: Duration,
}

/// Worker pool draining the rebuild queue.
pub struct Revalidator {
    inner: Arc<RevalidatorInner>,
    tx: Mutex<Option<mpsc::Sender<RebuildJob>>>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<RebuildJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Revalidator {
    /// Create the revalidator and spawn its workers. The router handle is
    /// wired in later through [`set_router`](Self::set_router) because the
    /// router itself hosts the middleware that enqueues jobs here.
    pub fn new(index: Index, registry: Option<Arc<RouteRegistry>>, config: &CacheConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.revalidate_queue_limit);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let inner = Arc::new(RevalidatorInner {
            index,
            registry,
            router: RwLock::new(None),
            pending: Mutex::new(HashSet::new()),
            job_timeout: config.revalidate_timeout,
        });

        let mut workers = Vec::with_capacity(config.revalidator_workers);
        for worker_id in 0..config.revalidator_workers {
            let inner = inner.clone();
            let rx = rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => run_job(&inner, job).await,
                        None => break,
                    }
                }
                debug!(target = SOURCE, worker_id, "worker stopped");
            }));
        }

        Self {
            inner,
            tx: Mutex::new(Some(tx)),
            rx,
            workers: Mutex::new(workers),
        }
    }

    /// Inject the post-middleware router used for replay requests.
    pub fn set_router(&self, router: Router) {
        *write_lock(&self.inner.router) = Some(router);
    }

    /// Queue a rebuild. Idempotent: a key already queued or being processed
    /// collapses into the existing job.
    pub fn enqueue(&self, job: RebuildJob) {
        {
            let mut pending = lock_pending(&self.inner);
            if !pending.insert(job.key.clone()) {
                debug!(target = SOURCE, key = %job.key, "rebuild already queued");
                return;
            }
        }

        let sender = lock_mutex(&self.tx).clone();
        let Some(sender) = sender else {
            lock_pending(&self.inner).remove(&job.key);
            return;
        };

        if let Err(err) = sender.try_send(job) {
            let job = match err {
                mpsc::error::TrySendError::Full(job) => {
                    warn!(
                        target = SOURCE,
                        key = %job.key,
                        "rebuild queue full; dropping job"
                    );
                    job
                }
                mpsc::error::TrySendError::Closed(job) => job,
            };
            lock_pending(&self.inner).remove(&job.key);
        }
    }

    /// How many keys currently have a rebuild queued or running.
    pub fn pending_len(&self) -> usize {
        lock_pending(&self.inner).len()
    }

    /// Close the queue and wait for the workers to drain.
    pub async fn shutdown(&self) {
        lock_mutex(&self.tx).take();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *lock_mutex(&self.workers));
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(target = SOURCE, error = %err, "revalidator worker panicked");
            }
        }

        // Anything still queued never ran; clear its pending marks.
        let mut rx = self.rx.lock().await;
        while let Ok(job) = rx.try_recv() {
            lock_pending(&self.inner).remove(&job.key);
        }
    }
}

async fn run_job(inner: &RevalidatorInner, job: RebuildJob) {
    lock_pending(inner).remove(&job.key);

    let router = read_lock(&inner.router).clone();
    let Some(router) = router else {
        warn!(
            target = SOURCE,
            key = %job.key,
            "no router injected; dropping rebuild"
        );
        return;
    };

    let token = match inner.index.acquire_build(&job.key) {
        Ok(token) => token,
        Err(_) => {
            debug!(
                target = SOURCE,
                key = %job.key,
                "rebuild already in flight; dropping job"
            );
            return;
        }
    };

    let url = inner
        .registry
        .as_ref()
        .and_then(|registry| registry.url_for(&job.canonical_path, &job.language))
        .unwrap_or_else(|| job.canonical_path.clone());

    let request = Request::builder()
        .method(Method::GET)
        .uri(&url)
        .header(INTERNAL_REPLAY_HEADER, "true")
        .body(Body::empty());
    let mut request = match request {
        Ok(request) => request,
        Err(err) => {
            warn!(
                target = SOURCE,
                key = %job.key,
                url = %url,
                error = %err,
                "failed to build replay request"
            );
            return;
        }
    };
    request
        .extensions_mut()
        .insert(ReplayBuild::new(token));

    match tokio::time::timeout(inner.job_timeout, router.oneshot(request)).await {
        Ok(Ok(response)) if response.status().is_success() => {
            info!(
                target = SOURCE,
                key = %job.key,
                url = %url,
                "entry rebuilt"
            );
        }
        Ok(Ok(response)) => {
            // The middleware has already released the token; the stale entry
            // stays so the next request can retry.
            warn!(
                target = SOURCE,
                key = %job.key,
                url = %url,
                status = response.status().as_u16(),
                "rebuild returned non-success; keeping stale entry"
            );
        }
        Ok(Err(infallible)) => match infallible {},
        Err(_) => {
            warn!(
                target = SOURCE,
                key = %job.key,
                url = %url,
                timeout_secs = inner.job_timeout.as_secs(),
                "rebuild timed out"
            );
        }
    }
}

fn lock_pending(inner: &RevalidatorInner) -> std::sync::MutexGuard<'_, HashSet<String>> {
    lock_mutex(&inner.pending)
}

fn lock_mutex<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{middleware, routing::get};

    use crate::cache::middleware::{CacheState, response_cache_layer};
    use crate::cache::store::Store;
    use crate::cache::{Strategy, keys};
    use crate::http::context::RouteContext;

    use super::*;

    fn idle_config() -> CacheConfig {
        CacheConfig {
            revalidator_workers: 0,
            revalidate_queue_limit: 2,
            ..Default::default()
        }
    }

    fn job(key: &str) -> RebuildJob {
        RebuildJob {
            key: key.to_string(),
            canonical_path: "/about".to_string(),
            language: "en".to_string(),
        }
    }

    #[tokio::test]
    async fn enqueue_collapses_duplicate_keys() {
        let revalidator = Revalidator::new(Index::new(), None, &idle_config());

        revalidator.enqueue(job("k1"));
        revalidator.enqueue(job("k1"));
        revalidator.enqueue(job("k2"));

        assert_eq!(revalidator.pending_len(), 2);
    }

    #[tokio::test]
    async fn full_queue_drops_job_and_unmarks_key() {
        let config = CacheConfig {
            revalidator_workers: 0,
            revalidate_queue_limit: 1,
            ..Default::default()
        };
        let revalidator = Revalidator::new(Index::new(), None, &config);

        revalidator.enqueue(job("k1"));
        revalidator.enqueue(job("k2"));

        // k2 was rejected, so it can be queued again later
        assert_eq!(revalidator.pending_len(), 1);
        revalidator.enqueue(job("k2"));
        assert_eq!(revalidator.pending_len(), 1);
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_a_no_op() {
        let revalidator = Revalidator::new(Index::new(), None, &idle_config());
        revalidator.shutdown().await;

        revalidator.enqueue(job("k1"));
        assert_eq!(revalidator.pending_len(), 0);
    }

    #[tokio::test]
    async fn worker_rebuilds_stale_entry_through_the_router() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            directory: dir.path().to_path_buf(),
            revalidator_workers: 1,
            ..Default::default()
        };

        let store = Arc::new(Store::open(dir.path(), config.gzip_min_bytes).unwrap());
        let index = Index::new();
        let revalidator = Arc::new(Revalidator::new(index.clone(), None, &config));

        let state = CacheState {
            config,
            store,
            index: index.clone(),
            revalidator: revalidator.clone(),
        };

        let version = Arc::new(AtomicUsize::new(0));
        let handler_version = version.clone();
        let context = RouteContext {
            canonical_path: "/about".to_string(),
            language: "en".to_string(),
            strategy: Strategy::Incremental,
        };

        let router = Router::new()
            .route(
                "/about",
                get(move || {
                    let version = handler_version.clone();
                    async move { format!("version {}", version.load(Ordering::SeqCst)) }
                }),
            )
            .layer(middleware::from_fn_with_state(state, response_cache_layer))
            .layer(middleware::from_fn_with_state(
                context,
                |axum::extract::State(context): axum::extract::State<RouteContext>,
                 mut request: Request<Body>,
                 next: axum::middleware::Next| async move {
                    request.extensions_mut().insert(context);
                    next.run(request).await
                },
            ));

        revalidator.set_router(router.clone());

        // Seed the entry, then change the origin output and flag it stale.
        let seed = router
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/about")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(seed.status(), 200);

        let key = keys::cache_key("/about", "en", &Default::default());
        let old_etag = index.lookup(&key).unwrap().etag;

        version.store(1, Ordering::SeqCst);
        index.mark_stale(|_| true);

        revalidator.enqueue(job(&key));

        let mut rebuilt = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Some(meta) = index.lookup(&key)
                && !meta.stale
            {
                assert_ne!(meta.etag, old_etag, "rebuild must produce a new validator");
                rebuilt = true;
                break;
            }
        }
        assert!(rebuilt, "background rebuild never committed");
    }
}
