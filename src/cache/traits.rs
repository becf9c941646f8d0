//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use sha2::{Digest, Sha256};
use url::Url;

use super::tier::TierName;
use crate::http::{Method, Response};

/// Normalized identity of a cacheable request.
///
/// Method + URL with the fragment dropped and query pairs sorted, so that
/// `?b=2&a=1` and `?a=1&b=2` share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  normalized: String,
}

impl CacheKey {
  pub fn new(method: Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
      .query_pairs()
      .map(|(k, v)| (k.into_owned(), v.into_owned()))
      .collect();
    if pairs.is_empty() {
      url.set_query(None);
    } else {
      pairs.sort();
      url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    Self {
      normalized: format!("{} {}", method, url),
    }
  }

  /// SHA256 hash for stable, fixed-length storage keys
  pub fn hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.normalized.as_bytes());
    hex::encode(hasher.finalize())
  }

  pub fn as_str(&self) -> &str {
    &self.normalized
  }
}

/// A stored response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: CacheKey,
  pub response: Response,
  pub stored_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Writes for one key must be atomic with respect to reads of that key.
pub trait CacheStorage: Send + Sync + 'static {
  /// Get the entry for a key in a tier, regardless of age.
  fn get_entry(&self, tier: TierName, key: &CacheKey) -> Result<Option<CacheEntry>>;

  /// Store an entry, replacing any previous one. A replaced entry counts as newly inserted.
  fn put_entry(&self, tier: TierName, entry: &CacheEntry) -> Result<()>;

  /// Remove an entry. Returns whether it existed.
  fn remove_entry(&self, tier: TierName, key: &CacheKey) -> Result<bool>;

  /// Number of entries in a tier.
  fn count_entries(&self, tier: TierName) -> Result<usize>;

  /// Delete entries stored before `cutoff`.
  fn purge_stored_before(&self, tier: TierName, cutoff: DateTime<Utc>) -> Result<usize>;

  /// Delete the oldest-inserted entries until at most `keep` remain.
  fn evict_oldest(&self, tier: TierName, keep: usize) -> Result<usize>;

  /// Delete every entry of a tier.
  fn clear_tier(&self, tier: TierName) -> Result<usize>;
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Create a result served from the precached application shell.
  pub fn precached(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Precache,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache past its max age, served one last time while refreshing
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
  /// Application shell snapshot
  Precache,
}

impl CacheSource {
  pub fn as_str(self) -> &'static str {
    match self {
      CacheSource::Network => "network",
      CacheSource::CacheFresh => "cache",
      CacheSource::CacheStale => "cache (stale)",
      CacheSource::Offline => "cache (offline)",
      CacheSource::Precache => "app shell",
    }
  }
}
