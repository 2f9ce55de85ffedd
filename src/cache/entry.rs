//! Cache entry metadata and freshness strategies.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Content type recorded when the captured response did not set one.
pub const DEFAULT_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Per-route freshness policy, assigned to an entry at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Cached until a content invalidation; a stale entry is served once and
    /// rebuilt synchronously on the following request.
    Static,
    /// Stale entries are served immediately while a background rebuild runs.
    Incremental,
    /// Replaced only by explicit key-scoped invalidation or a full clear.
    Immutable,
    /// Never cached.
    Dynamic,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Incremental => "incremental",
            Self::Immutable => "immutable",
            Self::Dynamic => "dynamic",
        }
    }

    pub fn is_cacheable(&self) -> bool {
        !matches!(self, Self::Dynamic)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-disk payload framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    #[default]
    Identity,
    Gzip,
}

/// Metadata for a single cached response.
///
/// Serialized into the `index.json` snapshot and the per-entry `.meta`
/// sidecar; field names are part of the on-disk format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMeta {
    pub key: String,
    pub canonical_path: String,
    #[serde(default)]
    pub language: String,
    pub strategy: Strategy,
    pub content_type: String,
    #[serde(default)]
    pub payload_encoding: PayloadEncoding,
    #[serde(default)]
    pub payload_size_raw: u64,
    #[serde(default)]
    pub payload_size_stored: u64,
    pub etag: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub stale: bool,
    #[serde(default)]
    pub revalidating: bool,
}

impl EntryMeta {
    /// Build metadata for a freshly captured response. Payload sizes and the
    /// final encoding are filled in by the store when the entry is persisted.
    pub fn new(
        key: impl Into<String>,
        canonical_path: impl Into<String>,
        language: impl Into<String>,
        strategy: Strategy,
        content_type: Option<&str>,
        etag: impl Into<String>,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            key: key.into(),
            canonical_path: canonical_path.into(),
            language: language.into(),
            strategy,
            content_type: content_type
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(DEFAULT_CONTENT_TYPE)
                .to_string(),
            payload_encoding: PayloadEncoding::Identity,
            payload_size_raw: 0,
            payload_size_stored: 0,
            etag: etag.into(),
            created_at: now,
            updated_at: now,
            stale: false,
            revalidating: false,
        }
    }
}
