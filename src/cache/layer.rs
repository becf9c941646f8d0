//! Cache layer that applies a tier's strategy around a network fetch.

use chrono::Utc;
use color_eyre::Result;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::lifecycle;
use super::tier::{Strategy, TierName, TierPolicy};
use super::traits::{CacheEntry, CacheKey, CacheResult, CacheStorage};
use crate::http::{Response, SyncError};

/// Cache layer that manages caching logic and network fetching.
///
/// The layer never talks to the network itself: every strategy receives a
/// `fetcher` that produces the network response on demand.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  /// Background refreshes still in flight
  refreshes: Arc<Mutex<JoinSet<()>>>,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer over the given storage backend.
  pub fn new(storage: Arc<S>) -> Self {
    Self {
      storage,
      refreshes: Arc::new(Mutex::new(JoinSet::new())),
    }
  }

  /// Fetch through the tier's strategy.
  pub async fn fetch<F, Fut>(
    &self,
    policy: &TierPolicy,
    key: CacheKey,
    fetcher: F,
  ) -> Result<CacheResult<Response>>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Response, SyncError>> + Send + 'static,
  {
    match policy.strategy {
      Strategy::NetworkFirst => self.network_first(policy, key, fetcher).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(policy, key, fetcher).await,
      Strategy::CacheFirst => self.cache_first(policy, key, fetcher).await,
    }
  }

  /// Network with a bounded wait, cached copy as fallback.
  ///
  /// 1. Race the fetcher against the tier timeout
  /// 2. On success, store and return
  /// 3. On error or timeout, serve the unexpired cached entry (offline mode)
  /// 4. With nothing cached, fail with `NoCachedResponse`
  pub async fn network_first<F, Fut>(
    &self,
    policy: &TierPolicy,
    key: CacheKey,
    fetcher: F,
  ) -> Result<CacheResult<Response>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, SyncError>>,
  {
    let outcome = match policy.network_timeout {
      // Dropping the future on timeout abandons the in-flight request
      Some(timeout) => match tokio::time::timeout(timeout, fetcher()).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::TimedOut(timeout)),
      },
      None => fetcher().await,
    };

    match outcome {
      Ok(response) => {
        self.store(policy, &key, &response)?;
        Ok(CacheResult::from_network(response))
      }
      Err(e) => {
        debug!(tier = %policy.name, key = key.as_str(), error = %e, "network failed, trying cache");
        let now = Utc::now();
        match self.storage.get_entry(policy.name, &key)? {
          Some(entry) if !policy.is_expired(entry.stored_at, now) => {
            Ok(CacheResult::offline(entry.response, entry.stored_at))
          }
          _ => Err(SyncError::NoCachedResponse(key.as_str().to_string()).into()),
        }
      }
    }
  }

  /// Cached copy immediately, refresh in the background.
  ///
  /// An entry past its max age is served this one last time and removed, so
  /// it is never served again unless the refresh replaces it.
  pub async fn stale_while_revalidate<F, Fut>(
    &self,
    policy: &TierPolicy,
    key: CacheKey,
    fetcher: F,
  ) -> Result<CacheResult<Response>>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Response, SyncError>> + Send + 'static,
  {
    match self.storage.get_entry(policy.name, &key)? {
      Some(entry) => {
        let expired = policy.is_expired(entry.stored_at, Utc::now());
        if expired {
          self.storage.remove_entry(policy.name, &key)?;
        }
        self.revalidate(policy.clone(), key, fetcher);
        Ok(CacheResult::from_cache(
          entry.response,
          entry.stored_at,
          expired,
        ))
      }
      None => {
        let response = fetcher().await?;
        self.store(policy, &key, &response)?;
        Ok(CacheResult::from_network(response))
      }
    }
  }

  /// Cached copy if present and unexpired; network only on a miss.
  pub async fn cache_first<F, Fut>(
    &self,
    policy: &TierPolicy,
    key: CacheKey,
    fetcher: F,
  ) -> Result<CacheResult<Response>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, SyncError>>,
  {
    if let Some(entry) = self.storage.get_entry(policy.name, &key)? {
      if !policy.is_expired(entry.stored_at, Utc::now()) {
        return Ok(CacheResult::from_cache(
          entry.response,
          entry.stored_at,
          false,
        ));
      }
      // Expired entries are a miss
      self.storage.remove_entry(policy.name, &key)?;
    }

    let response = fetcher().await?;
    self.store(policy, &key, &response)?;
    Ok(CacheResult::from_network(response))
  }

  /// Dispatch a background fetch whose response replaces the entry.
  fn revalidate<F, Fut>(&self, policy: TierPolicy, key: CacheKey, fetcher: F)
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Response, SyncError>> + Send + 'static,
  {
    let layer = self.clone();
    let task = async move {
      match fetcher().await {
        Ok(response) => {
          if let Err(e) = layer.store(&policy, &key, &response) {
            warn!(tier = %policy.name, key = key.as_str(), error = %e, "failed to store refreshed entry");
          }
        }
        Err(e) => {
          debug!(tier = %policy.name, key = key.as_str(), error = %e, "background refresh failed");
        }
      }
    };

    match self.refreshes.lock() {
      Ok(mut set) => {
        // Reap finished refreshes so the set does not grow unbounded
        while set.try_join_next().is_some() {}
        set.spawn(task);
      }
      Err(_) => {
        warn!("refresh tracker poisoned, refreshing untracked");
        tokio::spawn(task);
      }
    }
  }

  /// Wait until every background refresh has finished, including ones
  /// started while waiting.
  pub async fn wait_for_refreshes(&self) {
    loop {
      let mut pending = match self.refreshes.lock() {
        Ok(mut set) => std::mem::take(&mut *set),
        Err(_) => return,
      };
      if pending.is_empty() {
        return;
      }
      while let Some(joined) = pending.join_next().await {
        if let Err(e) = joined {
          warn!(error = %e, "background refresh did not complete");
        }
      }
    }
  }

  /// Write a cacheable response and sweep the tier.
  fn store(&self, policy: &TierPolicy, key: &CacheKey, response: &Response) -> Result<()> {
    if !response.is_cacheable() {
      return Ok(());
    }

    let now = Utc::now();
    self.storage.put_entry(
      policy.name,
      &CacheEntry {
        key: key.clone(),
        response: response.clone(),
        stored_at: now,
      },
    )?;
    lifecycle::enforce(self.storage.as_ref(), policy, now)?;
    Ok(())
  }

  /// Number of entries currently held by a tier.
  pub fn entry_count(&self, tier: TierName) -> Result<usize> {
    self.storage.count_entries(tier)
  }

  /// Empty a tier.
  pub fn clear(&self, tier: TierName) -> Result<usize> {
    self.storage.clear_tier(tier)
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      refreshes: Arc::clone(&self.refreshes),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::SqliteStorage;
  use crate::cache::tier::TierTable;
  use crate::cache::traits::CacheSource;
  use crate::http::Method;
  use crate::testing::eventually;
  use chrono::Duration;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use url::Url;

  fn setup() -> (Arc<SqliteStorage>, CacheLayer<SqliteStorage>, TierTable) {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let layer = CacheLayer::new(Arc::clone(&storage));
    (storage, layer, TierTable::default())
  }

  fn key(path: &str) -> CacheKey {
    CacheKey::new(
      Method::Get,
      &Url::parse(&format!("https://heritage.test{}", path)).unwrap(),
    )
  }

  fn seed(storage: &SqliteStorage, tier: TierName, key: &CacheKey, body: &str, age: Duration) {
    storage
      .put_entry(
        tier,
        &CacheEntry {
          key: key.clone(),
          response: Response::new(200, body.as_bytes().to_vec()),
          stored_at: Utc::now() - age,
        },
      )
      .unwrap();
  }

  fn counting(
    calls: &Arc<AtomicUsize>,
    result: Result<Response, SyncError>,
  ) -> impl FnOnce() -> futures::future::Ready<Result<Response, SyncError>> + Send + 'static {
    let calls = Arc::clone(calls);
    move || {
      calls.fetch_add(1, Ordering::SeqCst);
      futures::future::ready(result)
    }
  }

  #[tokio::test]
  async fn cache_first_serves_fresh_entry_without_network() {
    let (storage, layer, table) = setup();
    let policy = table.policy(TierName::Media);
    let k = key("/media/heritage/photo.jpg");
    seed(&storage, TierName::Media, &k, "cached", Duration::days(6));
    let calls = Arc::new(AtomicUsize::new(0));

    let result = layer
      .fetch(policy, k, counting(&calls, Ok(Response::new(200, "net"))))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::CacheFresh);
    assert_eq!(result.data.body, b"cached");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn cache_first_refetches_expired_entry() {
    let (storage, layer, table) = setup();
    let policy = table.policy(TierName::Media);
    let k = key("/media/heritage/photo.jpg");
    seed(&storage, TierName::Media, &k, "old", Duration::days(8));
    let calls = Arc::new(AtomicUsize::new(0));

    let result = layer
      .fetch(policy, k.clone(), counting(&calls, Ok(Response::new(200, "new"))))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stored = storage.get_entry(TierName::Media, &k).unwrap().unwrap();
    assert_eq!(stored.response.body, b"new");
  }

  #[tokio::test]
  async fn cache_first_does_not_store_errors() {
    let (storage, layer, table) = setup();
    let k = key("/media/missing.jpg");
    let calls = Arc::new(AtomicUsize::new(0));

    let result = layer
      .fetch(
        table.policy(TierName::Media),
        k.clone(),
        counting(&calls, Ok(Response::new(404, "nope"))),
      )
      .await
      .unwrap();

    assert_eq!(result.data.status, 404);
    assert!(storage.get_entry(TierName::Media, &k).unwrap().is_none());
  }

  #[tokio::test]
  async fn swr_serves_cached_and_refreshes_in_background() {
    let (storage, layer, table) = setup();
    let policy = table.policy(TierName::ApiDetail);
    let k = key("/api/v1/heritage-items/7/");
    seed(&storage, TierName::ApiDetail, &k, "v1", Duration::hours(2));
    let calls = Arc::new(AtomicUsize::new(0));

    let result = layer
      .fetch(policy, k.clone(), counting(&calls, Ok(Response::new(200, "v2"))))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::CacheFresh);
    assert_eq!(result.data.body, b"v1");

    let refreshed = eventually(|| {
      storage
        .get_entry(TierName::ApiDetail, &k)
        .unwrap()
        .is_some_and(|e| e.response.body == b"v2")
    })
    .await;
    assert!(refreshed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn waiting_for_refreshes_completes_the_swr_write() {
    let (storage, layer, table) = setup();
    let policy = table.policy(TierName::ApiDetail);
    let k = key("/api/v1/heritage-items/7/");
    seed(&storage, TierName::ApiDetail, &k, "v1", Duration::hours(2));
    let calls = Arc::new(AtomicUsize::new(0));

    layer
      .fetch(policy, k.clone(), counting(&calls, Ok(Response::new(200, "v2"))))
      .await
      .unwrap();
    layer.wait_for_refreshes().await;

    let stored = storage.get_entry(TierName::ApiDetail, &k).unwrap().unwrap();
    assert_eq!(stored.response.body, b"v2");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Nothing left to wait on
    layer.wait_for_refreshes().await;
  }

  #[tokio::test]
  async fn swr_serves_expired_entry_exactly_once_more() {
    let (storage, layer, table) = setup();
    let policy = table.policy(TierName::ApiDetail);
    let k = key("/api/v1/heritage-items/7/");
    seed(&storage, TierName::ApiDetail, &k, "ancient", Duration::hours(30));
    let calls = Arc::new(AtomicUsize::new(0));

    let first = layer
      .fetch(
        policy,
        k.clone(),
        counting(&calls, Err(SyncError::Unreachable("offline".into()))),
      )
      .await
      .unwrap();
    assert_eq!(first.source, CacheSource::CacheStale);
    assert_eq!(first.data.body, b"ancient");

    // Refresh failed, so the next read has nothing to serve
    let second = layer
      .fetch(
        policy,
        k,
        counting(&calls, Err(SyncError::Unreachable("offline".into()))),
      )
      .await;
    assert!(second.is_err());
  }

  #[tokio::test]
  async fn swr_waits_on_network_when_empty() {
    let (storage, layer, table) = setup();
    let k = key("/api/v1/heritage-items/8/");
    let calls = Arc::new(AtomicUsize::new(0));

    let result = layer
      .fetch(
        table.policy(TierName::ApiDetail),
        k.clone(),
        counting(&calls, Ok(Response::new(200, "fresh"))),
      )
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert!(storage.get_entry(TierName::ApiDetail, &k).unwrap().is_some());
  }

  #[tokio::test]
  async fn network_first_prefers_network_and_stores() {
    let (storage, layer, table) = setup();
    let k = key("/api/v1/heritage-items/?search=church");
    seed(&storage, TierName::ApiList, &k, "old page", Duration::minutes(5));
    let calls = Arc::new(AtomicUsize::new(0));

    let result = layer
      .fetch(
        table.policy(TierName::ApiList),
        k.clone(),
        counting(&calls, Ok(Response::new(200, "new page"))),
      )
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"new page");
    let stored = storage.get_entry(TierName::ApiList, &k).unwrap().unwrap();
    assert_eq!(stored.response.body, b"new page");
  }

  #[tokio::test]
  async fn network_first_falls_back_to_cache_offline() {
    let (storage, layer, table) = setup();
    let k = key("/api/v1/heritage-items/");
    seed(&storage, TierName::ApiList, &k, "cached page", Duration::minutes(30));
    let calls = Arc::new(AtomicUsize::new(0));

    let result = layer
      .fetch(
        table.policy(TierName::ApiList),
        k,
        counting(&calls, Err(SyncError::Unreachable("offline".into()))),
      )
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.body, b"cached page");
  }

  #[tokio::test]
  async fn network_first_never_serves_expired_fallback() {
    let (storage, layer, table) = setup();
    let k = key("/api/v1/heritage-items/");
    seed(&storage, TierName::ApiList, &k, "too old", Duration::minutes(61));
    let calls = Arc::new(AtomicUsize::new(0));

    let err = layer
      .fetch(
        table.policy(TierName::ApiList),
        k,
        counting(&calls, Err(SyncError::Unreachable("offline".into()))),
      )
      .await
      .unwrap_err();

    assert!(matches!(
      err.downcast_ref::<SyncError>(),
      Some(SyncError::NoCachedResponse(_))
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn network_first_times_out_to_cache() {
    let (storage, layer, table) = setup();
    let k = key("/api/v1/parishes/");
    seed(&storage, TierName::ApiList, &k, "cached", Duration::minutes(1));

    let result = layer
      .fetch(table.policy(TierName::ApiList), k, || async {
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        Ok(Response::new(200, "too late"))
      })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.body, b"cached");
  }

  #[tokio::test]
  async fn writes_respect_tier_ceiling() {
    let (storage, layer, mut table) = setup();
    table.policy_mut(TierName::ApiDetail).max_entries = 2;
    let policy = table.policy(TierName::ApiDetail);

    for id in 1..=4 {
      let calls = Arc::new(AtomicUsize::new(0));
      layer
        .fetch(
          policy,
          key(&format!("/api/v1/heritage-items/{}/", id)),
          counting(&calls, Ok(Response::new(200, "x"))),
        )
        .await
        .unwrap();
    }

    assert_eq!(storage.count_entries(TierName::ApiDetail).unwrap(), 2);
    assert!(storage
      .get_entry(TierName::ApiDetail, &key("/api/v1/heritage-items/1/"))
      .unwrap()
      .is_none());
    assert!(storage
      .get_entry(TierName::ApiDetail, &key("/api/v1/heritage-items/4/"))
      .unwrap()
      .is_some());
  }
}
