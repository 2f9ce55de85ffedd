//! Statio response cache.
//!
//! Persistent cache for rendered GET responses, keyed by the canonical route
//! fingerprint. The moving parts, leaves first:
//!
//! - **store**: on-disk payloads and metadata, atomic writes
//! - **index**: in-memory metadata with per-key build serialisation
//! - **keys**: deterministic fingerprints and weak validators
//! - **strategy**: per-route freshness decisions
//! - **middleware**: the serve/record layer on the request path
//! - **revalidator**: background rebuilds for stale entries
//! - **invalidator**: entity-scoped staleness flips from webhooks/CLI
//! - **warmer**: offline bootstrap through the live router

mod config;
mod entry;
mod index;
mod invalidator;
pub mod keys;
mod middleware;
mod revalidator;
mod store;
mod strategy;
mod warmer;

pub use config::CacheConfig;
pub use entry::{DEFAULT_CONTENT_TYPE, EntryMeta, PayloadEncoding, Strategy};
pub use index::{BuildToken, Index};
pub use invalidator::{EntityKind, InvalidationEvent, Invalidator};
pub use keys::{VaryMap, cache_key, etag_header, payload_etag};
pub use middleware::{CacheState, INTERNAL_REPLAY_HEADER, ReplayBuild, response_cache_layer};
pub use revalidator::{RebuildJob, Revalidator};
pub use store::{PayloadReader, SCHEMA_VERSION, Store, StoreError};
pub use strategy::{CacheAction, plan};
pub use warmer::{CacheWarmer, WarmSummary};
