//! Entity-scoped cache invalidation.
//!
//! Translates discrete signals (CMS webhooks, CLI) into staleness flips or
//! evictions. Marking stale is a metadata flip only; nothing is rebuilt
//! eagerly, the next request under an eligible strategy triggers it.

use std::str::FromStr;
use std::sync::Arc;

use tracing::{info, warn};

use super::entry::Strategy;
use super::index::Index;
use super::store::Store;

const SOURCE: &str = "statio::cache::invalidator";

/// Entities the CMS reports changes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Post,
    Category,
    Tag,
    Author,
    /// Site-wide key/value configuration.
    KeyValue,
    /// Manual full CMS sync.
    Cms,
}

impl EntityKind {
    /// Whether a change to this entity also invalidates `immutable` entries.
    pub fn touches_immutable(&self) -> bool {
        matches!(self, Self::KeyValue | Self::Cms)
    }
}

impl FromStr for EntityKind {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "post" => Ok(Self::Post),
            "category" => Ok(Self::Category),
            "tag" => Ok(Self::Tag),
            "author" => Ok(Self::Author),
            "keyvalue" => Ok(Self::KeyValue),
            "cms" => Ok(Self::Cms),
            _ => Err(()),
        }
    }
}

/// A single invalidation signal.
#[derive(Debug, Clone)]
pub enum InvalidationEvent {
    /// Content changed somewhere under this entity.
    Entity(EntityKind),
    /// Explicitly invalidate one cache key.
    Key(String),
    /// Evict every entry and empty the store.
    ClearAll,
}

/// Applies invalidation events against the index and store.
pub struct Invalidator {
    index: Index,
    store: Arc<Store>,
}

impl Invalidator {
    pub fn new(index: Index, store: Arc<Store>) -> Self {
        Self { index, store }
    }

    /// Apply one event; returns how many entries were touched.
    pub fn apply(&self, event: InvalidationEvent) -> usize {
        let touched = match &event {
            InvalidationEvent::Entity(kind) => {
                if kind.touches_immutable() {
                    self.index.mark_stale(|_| true)
                } else {
                    self.index.mark_stale(|meta| {
                        matches!(meta.strategy, Strategy::Static | Strategy::Incremental)
                    })
                }
            }
            InvalidationEvent::Key(key) => self.index.mark_stale(|meta| meta.key == *key),
            InvalidationEvent::ClearAll => {
                let count = self.index.clear();
                if let Err(error) = self.store.clear() {
                    warn!(
                        target = SOURCE,
                        error = %error,
                        "failed to clear store directory"
                    );
                }
                count
            }
        };

        info!(
            target = SOURCE,
            event = ?event,
            invalidated = touched,
            "invalidation applied"
        );

        touched
    }
}
