//! In-memory entry index with per-key build serialisation.
//!
//! The index is the only shared mutable structure in the cache. Readers take
//! a snapshot copy and never touch the build table; writers serialise through
//! a [`BuildToken`], of which at most one exists per key. The table of
//! in-flight keys sits behind a single short mutex so `acquire_build` stays
//! O(1) without a lock per entry.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::Notify;
use tracing::warn;

use super::entry::EntryMeta;

const SOURCE: &str = "statio::cache::index";

struct IndexInner {
    entries: RwLock<HashMap<String, EntryMeta>>,
    building: Mutex<HashMap<String, Arc<Notify>>>,
}

/// Exclusive right to rebuild one key.
///
/// Obtained from [`Index::acquire_build`]; surrendered through
/// [`Index::commit`], [`Index::abort`], or by dropping it, so a panicking or
/// timed-out rebuild can never wedge a key.
pub struct BuildToken {
    key: String,
    inner: Arc<IndexInner>,
    released: bool,
}

impl std::fmt::Debug for BuildToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildToken")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}

impl BuildToken {
    pub fn key(&self) -> &str {
        &self.key
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(meta) = write_entries(&self.inner, "release").get_mut(&self.key) {
            meta.revalidating = false;
        }
        let notify = lock_building(&self.inner, "release").remove(&self.key);
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }
}

impl Drop for BuildToken {
    fn drop(&mut self) {
        self.release();
    }
}

/// Shared in-memory view of all cache entries.
#[derive(Clone)]
pub struct Index {
    inner: Arc<IndexInner>,
}

impl Index {
    pub fn new() -> Self {
        Self::with_entries(Vec::new())
    }

    /// Seed the index from a loaded store snapshot.
    pub fn with_entries(entries: Vec<EntryMeta>) -> Self {
        let map = entries
            .into_iter()
            .map(|meta| (meta.key.clone(), meta))
            .collect();
        Self {
            inner: Arc::new(IndexInner {
                entries: RwLock::new(map),
                building: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Non-blocking metadata lookup; returns a snapshot copy.
    pub fn lookup(&self, key: &str) -> Option<EntryMeta> {
        read_entries(&self.inner, "lookup").get(key).cloned()
    }

    pub fn len(&self) -> usize {
        read_entries(&self.inner, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim the build slot for `key`.
    ///
    /// Loses receive the current holder's [`Notify`] and may wait on it for
    /// the outcome of the in-flight build.
    pub fn acquire_build(&self, key: &str) -> Result<BuildToken, Arc<Notify>> {
        {
            let mut building = lock_building(&self.inner, "acquire_build");
            match building.entry(key.to_string()) {
                MapEntry::Occupied(slot) => return Err(slot.get().clone()),
                MapEntry::Vacant(slot) => {
                    slot.insert(Arc::new(Notify::new()));
                }
            }
        }

        if let Some(meta) = write_entries(&self.inner, "acquire_build").get_mut(key) {
            meta.revalidating = true;
        }

        Ok(BuildToken {
            key: key.to_string(),
            inner: self.inner.clone(),
            released: false,
        })
    }

    /// Publish a rebuilt entry and release the build slot.
    ///
    /// Waiters are woken only after the new metadata is visible.
    pub fn commit(&self, mut token: BuildToken, mut meta: EntryMeta) {
        debug_assert_eq!(token.key, meta.key, "token/meta key mismatch");

        meta.stale = false;
        meta.revalidating = false;
        write_entries(&self.inner, "commit").insert(meta.key.clone(), meta);
        token.release();
    }

    /// Release the build slot without touching the entry.
    pub fn abort(&self, mut token: BuildToken) {
        token.release();
    }

    /// Flip `stale` on every entry matching the predicate.
    pub fn mark_stale(&self, predicate: impl Fn(&EntryMeta) -> bool) -> usize {
        let mut entries = write_entries(&self.inner, "mark_stale");
        let mut touched = 0;
        for meta in entries.values_mut() {
            if predicate(meta) {
                meta.stale = true;
                touched += 1;
            }
        }
        touched
    }

    /// Remove every entry matching the predicate, returning the removed
    /// metadata so the caller can delete the store files.
    pub fn evict(&self, predicate: impl Fn(&EntryMeta) -> bool) -> Vec<EntryMeta> {
        let mut entries = write_entries(&self.inner, "evict");
        let keys: Vec<String> = entries
            .values()
            .filter(|meta| predicate(meta))
            .map(|meta| meta.key.clone())
            .collect();
        keys.iter()
            .filter_map(|key| entries.remove(key))
            .collect()
    }

    /// Remove a single entry.
    pub fn remove(&self, key: &str) -> Option<EntryMeta> {
        write_entries(&self.inner, "remove").remove(key)
    }

    /// Drop every entry; returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut entries = write_entries(&self.inner, "clear");
        let count = entries.len();
        entries.clear();
        count
    }

    /// Copy out all metadata, sorted by key for deterministic snapshots.
    pub fn export(&self) -> Vec<EntryMeta> {
        let mut entries: Vec<EntryMeta> =
            read_entries(&self.inner, "export").values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

// Poisoned locks are recovered rather than propagated: serving a possibly
// stale snapshot beats taking the request path down with a panic.

fn read_entries<'a>(
    inner: &'a IndexInner,
    op: &'static str,
) -> RwLockReadGuard<'a, HashMap<String, EntryMeta>> {
    inner.entries.read().unwrap_or_else(|poisoned| {
        warn_poisoned(op, "entries.read");
        poisoned.into_inner()
    })
}

fn write_entries<'a>(
    inner: &'a IndexInner,
    op: &'static str,
) -> RwLockWriteGuard<'a, HashMap<String, EntryMeta>> {
    inner.entries.write().unwrap_or_else(|poisoned| {
        warn_poisoned(op, "entries.write");
        poisoned.into_inner()
    })
}

fn lock_building<'a>(
    inner: &'a IndexInner,
    op: &'static str,
) -> MutexGuard<'a, HashMap<String, Arc<Notify>>> {
    inner.building.lock().unwrap_or_else(|poisoned| {
        warn_poisoned(op, "building.lock");
        poisoned.into_inner()
    })
}

fn warn_poisoned(op: &'static str, lock: &'static str) {
    warn!(
        target = SOURCE,
        op,
        lock,
        "recovered from poisoned index lock"
    );
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::entry::Strategy;
    use super::*;

    fn sample(key: &str, etag: &str) -> EntryMeta {
        EntryMeta::new(key, "/about", "en", Strategy::Static, None, etag)
    }

    fn sample_with_strategy(key: &str, strategy: Strategy) -> EntryMeta {
        EntryMeta::new(key, "/about", "en", strategy, None, "etag")
    }

    #[test]
    fn lookup_returns_snapshot_copy() {
        let index = Index::with_entries(vec![sample("k1", "e1")]);

        let mut copy = index.lookup("k1").expect("entry present");
        copy.etag = "mutated".to_string();

        assert_eq!(index.lookup("k1").unwrap().etag, "e1");
        assert!(index.lookup("missing").is_none());
    }

    #[test]
    fn second_acquire_conflicts_until_release() {
        let index = Index::new();

        let token = index.acquire_build("k1").expect("first acquire wins");
        assert!(index.acquire_build("k1").is_err());
        assert!(index.acquire_build("k2").is_ok());

        index.abort(token);
        assert!(index.acquire_build("k1").is_ok());
    }

    #[test]
    fn commit_publishes_and_clears_flags() {
        let index = Index::with_entries(vec![{
            let mut meta = sample("k1", "old");
            meta.stale = true;
            meta
        }]);

        let token = index.acquire_build("k1").unwrap();
        assert!(index.lookup("k1").unwrap().revalidating);

        let mut rebuilt = sample("k1", "new");
        rebuilt.stale = true; // commit must clear this regardless
        index.commit(token, rebuilt);

        let meta = index.lookup("k1").unwrap();
        assert_eq!(meta.etag, "new");
        assert!(!meta.stale);
        assert!(!meta.revalidating);
        assert!(index.acquire_build("k1").is_ok());
    }

    #[test]
    fn abort_leaves_previous_entry_intact() {
        let index = Index::with_entries(vec![sample("k1", "old")]);

        let token = index.acquire_build("k1").unwrap();
        index.abort(token);

        let meta = index.lookup("k1").unwrap();
        assert_eq!(meta.etag, "old");
        assert!(!meta.revalidating);
    }

    #[test]
    fn dropped_token_frees_the_slot() {
        let index = Index::new();

        {
            let _token = index.acquire_build("k1").unwrap();
            assert!(index.acquire_build("k1").is_err());
        }

        assert!(index.acquire_build("k1").is_ok());
    }

    #[tokio::test]
    async fn waiters_wake_after_commit() {
        let index = Index::new();

        let token = index.acquire_build("k1").unwrap();
        let notify = index.acquire_build("k1").expect_err("slot is taken");

        let mut notified = std::pin::pin!(notify.notified());
        notified.as_mut().enable();
        index.commit(token, sample("k1", "built"));

        tokio::time::timeout(Duration::from_secs(1), notified)
            .await
            .expect("commit wakes waiters");
        assert_eq!(index.lookup("k1").unwrap().etag, "built");
    }

    #[test]
    fn mark_stale_counts_matches() {
        let index = Index::with_entries(vec![
            sample_with_strategy("k1", Strategy::Static),
            sample_with_strategy("k2", Strategy::Incremental),
            sample_with_strategy("k3", Strategy::Immutable),
        ]);

        let touched = index.mark_stale(|meta| {
            matches!(meta.strategy, Strategy::Static | Strategy::Incremental)
        });

        assert_eq!(touched, 2);
        assert!(index.lookup("k1").unwrap().stale);
        assert!(index.lookup("k2").unwrap().stale);
        assert!(!index.lookup("k3").unwrap().stale);
    }

    #[test]
    fn evict_returns_removed_entries() {
        let index = Index::with_entries(vec![sample("k1", "e1"), sample("k2", "e2")]);

        let removed = index.evict(|meta| meta.key == "k1");

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].key, "k1");
        assert!(index.lookup("k1").is_none());
        assert!(index.lookup("k2").is_some());
    }

    #[test]
    fn export_is_sorted_by_key() {
        let index = Index::with_entries(vec![sample("kb", "e2"), sample("ka", "e1")]);

        let exported = index.export();
        assert_eq!(exported.len(), 2);
        assert_eq!(exported[0].key, "ka");
        assert_eq!(exported[1].key, "kb");
    }

    #[test]
    fn clear_empties_the_map() {
        let index = Index::with_entries(vec![sample("k1", "e1"), sample("k2", "e2")]);

        assert_eq!(index.clear(), 2);
        assert!(index.is_empty());
    }
}
