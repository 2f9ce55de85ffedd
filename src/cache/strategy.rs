//! Freshness strategy decisions.
//!
//! A pure mapping from the route's strategy tag and the current entry state
//! to a serve action. No I/O happens here; the middleware executes whatever
//! action comes back.

use super::entry::{EntryMeta, Strategy};

/// What the middleware should do for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAction {
    /// Hand the request to the origin handler untouched.
    Bypass,
    /// Stream the cached payload.
    ServeFresh,
    /// Stream the stale payload now and enqueue a background rebuild.
    ServeStaleAsyncRebuild,
    /// Stream the stale payload one last time; the entry is dropped so the
    /// next request rebuilds synchronously.
    ServeStaleSyncRebuild,
    /// Run the handler, record the response, serve the handler's bytes.
    BuildAndServe,
}

/// Decide the action for `strategy` given the entry currently indexed.
pub fn plan(strategy: Strategy, entry: Option<&EntryMeta>) -> CacheAction {
    if strategy == Strategy::Dynamic {
        return CacheAction::Bypass;
    }

    match entry {
        None => CacheAction::BuildAndServe,
        Some(meta) if !meta.stale => CacheAction::ServeFresh,
        Some(_) => match strategy {
            Strategy::Static => CacheAction::ServeStaleSyncRebuild,
            Strategy::Incremental => CacheAction::ServeStaleAsyncRebuild,
            // Only explicit key invalidation can mark an immutable entry
            // stale; replace it on the spot so the response already carries
            // the new validator.
            Strategy::Immutable => CacheAction::BuildAndServe,
            Strategy::Dynamic => CacheAction::Bypass,
        },
    }
}
