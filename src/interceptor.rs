//! The request dispatcher: every outbound request of the client goes through
//! `Interceptor::handle`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{
  CacheKey, CacheLayer, CacheResult, SqliteStorage, TierName, TierPolicy, TierTable,
};
use crate::classify::{Classifier, RouteClass};
use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::http::{Request, Response, SyncError, Transport};
use crate::queue::{QueuedMutation, ReplayReport, WriteQueue};
use crate::shell::{AppShell, ShellStorage};

const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(5);

/// What the caller gets back for an intercepted request.
#[derive(Debug)]
pub enum Outcome {
  /// A response, tagged with where it came from
  Response(CacheResult<Response>),
  /// Mutation accepted while offline; it will be replayed later
  Deferred(QueuedMutation),
}

impl Outcome {
  pub fn response(&self) -> Option<&Response> {
    match self {
      Outcome::Response(result) => Some(&result.data),
      Outcome::Deferred(_) => None,
    }
  }

  pub fn into_response(self) -> Option<CacheResult<Response>> {
    match self {
      Outcome::Response(result) => Some(result),
      Outcome::Deferred(_) => None,
    }
  }
}

/// Classifies requests and routes them to a cache tier, the write queue, the
/// app shell or straight to the network.
pub struct Interceptor {
  classifier: Classifier,
  tiers: TierTable,
  cache: CacheLayer<SqliteStorage>,
  queue: WriteQueue<SqliteStorage>,
  storage: Arc<SqliteStorage>,
  transport: Arc<dyn Transport>,
  connectivity: Connectivity,
  api_root: Url,
  app_url: Url,
}

impl Interceptor {
  pub fn new(
    config: &Config,
    storage: Arc<SqliteStorage>,
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
  ) -> Result<Self> {
    Ok(Self {
      classifier: Classifier::new(&config.api),
      tiers: TierTable::from_config(&config.tiers),
      cache: CacheLayer::new(Arc::clone(&storage)),
      queue: WriteQueue::new(Arc::clone(&storage), &config.queue),
      storage,
      transport,
      connectivity,
      api_root: config.api.root.clone(),
      app_url: config.api.app_url()?,
    })
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn storage(&self) -> &Arc<SqliteStorage> {
    &self.storage
  }

  pub fn api_root(&self) -> &Url {
    &self.api_root
  }

  pub fn classify(&self, request: &Request) -> RouteClass {
    self.classifier.classify(request)
  }

  /// Route one request.
  pub async fn handle(&self, request: Request) -> Result<Outcome> {
    let class = self.classifier.classify(&request);
    debug!(method = %request.method, url = %request.url, ?class, "intercepted");

    match class {
      RouteClass::Navigation => self.serve_shell(&request),
      RouteClass::MutationQueue => self.submit_mutation(request).await,
      RouteClass::UserData | RouteClass::Passthrough => {
        let response = self.send(request).await?;
        Ok(Outcome::Response(CacheResult::from_network(response)))
      }
      RouteClass::ApiList | RouteClass::ApiDetail | RouteClass::Media | RouteClass::MapTile => {
        let tier = class
          .tier()
          .ok_or_else(|| eyre!("Route {:?} has no cache tier", class))?;
        self.fetch_tiered(tier, request).await
      }
    }
  }

  fn serve_shell(&self, request: &Request) -> Result<Outcome> {
    match self.storage.load_shell()? {
      Some(shell) => Ok(Outcome::Response(CacheResult::precached(
        shell.response,
        shell.captured_at,
      ))),
      None => Err(SyncError::NoCachedResponse(request.url.to_string()).into()),
    }
  }

  async fn submit_mutation(&self, request: Request) -> Result<Outcome> {
    let attempt = send_observed(
      Arc::clone(&self.transport),
      self.connectivity.clone(),
      request.clone(),
    );
    let limit = self.queue.send_timeout();
    let result = match tokio::time::timeout(limit, attempt).await {
      Ok(result) => result,
      Err(_) => Err(SyncError::TimedOut(limit)),
    };
    match result {
      Ok(response) if response.status >= 400 => Err(
        SyncError::Rejected {
          method: request.method.to_string(),
          url: request.url.to_string(),
          status: response.status,
          body: response.body,
        }
        .into(),
      ),
      Ok(response) => Ok(Outcome::Response(CacheResult::from_network(response))),
      Err(e) if e.is_connectivity() => {
        debug!(url = %request.url, error = %e, "mutation deferred");
        let mutation = self.queue.enqueue(&request)?;
        Ok(Outcome::Deferred(mutation))
      }
      Err(e) => Err(e.into()),
    }
  }

  async fn fetch_tiered(&self, tier: TierName, request: Request) -> Result<Outcome> {
    let policy: &TierPolicy = self.tiers.policy(tier);
    let key = CacheKey::new(request.method, &request.url);
    let transport = Arc::clone(&self.transport);
    let connectivity = self.connectivity.clone();

    let result = self
      .cache
      .fetch(policy, key, move || {
        send_observed(transport, connectivity, request)
      })
      .await?;

    Ok(Outcome::Response(result))
  }

  async fn send(&self, request: Request) -> Result<Response, SyncError> {
    send_observed(Arc::clone(&self.transport), self.connectivity.clone(), request).await
  }

  /// Run one replay pass over the write queue.
  pub async fn replay(&self) -> Result<ReplayReport> {
    self.queue.replay(self.transport.as_ref()).await
  }

  /// Wait for stale-while-revalidate refreshes still running.
  pub async fn wait_for_refreshes(&self) {
    self.cache.wait_for_refreshes().await
  }

  pub fn pending_mutations(&self) -> Result<Vec<QueuedMutation>> {
    self.queue.pending()
  }

  /// Replay the queue every time connectivity comes back.
  pub fn spawn_replay_on_reconnect(self: &Arc<Self>) -> JoinHandle<()> {
    let mut rx = self.connectivity.subscribe();
    let this = Arc::clone(self);

    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        if !*rx.borrow_and_update() {
          continue;
        }
        info!(queue = this.queue.name(), "connectivity restored, replaying");
        if let Err(e) = this.replay().await {
          warn!(error = %e, "replay pass failed");
        }
      }
    })
  }

  /// Check whether the API answers at all and record the result.
  pub async fn check_reachability(&self) -> bool {
    let request = Request::get(self.api_root.clone());
    let online = match tokio::time::timeout(REACHABILITY_TIMEOUT, self.transport.send(request)).await {
      Ok(Ok(_)) => true,
      Ok(Err(e)) => {
        debug!(error = %e, "reachability check failed");
        false
      }
      Err(_) => false,
    };
    self.connectivity.set_online(online);
    online
  }

  /// Fetch the application entry document and store it as the shell snapshot.
  pub async fn precache_shell(&self) -> Result<AppShell> {
    let response = self.send(Request::get(self.app_url.clone())).await?;
    if !response.is_success() {
      return Err(eyre!(
        "App shell {} returned status {}",
        self.app_url,
        response.status
      ));
    }

    let shell = AppShell {
      url: self.app_url.to_string(),
      response,
      captured_at: Utc::now(),
    };
    self.storage.save_shell(&shell)?;
    info!(url = %shell.url, bytes = shell.response.body.len(), "app shell precached");
    Ok(shell)
  }

  /// Entry count and policy for every tier.
  pub fn tier_stats(&self) -> Result<Vec<(TierPolicy, usize)>> {
    TierName::ALL
      .into_iter()
      .map(|tier| {
        let count = self.cache.entry_count(tier)?;
        Ok((self.tiers.policy(tier).clone(), count))
      })
      .collect()
  }

  pub fn clear_tier(&self, tier: TierName) -> Result<usize> {
    self.cache.clear(tier)
  }
}

/// Send and record what the attempt says about connectivity.
async fn send_observed(
  transport: Arc<dyn Transport>,
  connectivity: Connectivity,
  request: Request,
) -> Result<Response, SyncError> {
  let result = transport.send(request).await;
  match &result {
    Ok(_) => connectivity.set_online(true),
    Err(SyncError::Unreachable(_)) => connectivity.set_online(false),
    Err(_) => {}
  }
  result
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, CacheStorage};
  use crate::config::ApiConfig;
  use crate::http::Method;
  use crate::testing::{eventually, ScriptedTransport};

  struct Harness {
    interceptor: Arc<Interceptor>,
    transport: ScriptedTransport,
    storage: Arc<SqliteStorage>,
  }

  fn harness() -> Harness {
    let config = Config::with_api(ApiConfig::with_root(
      Url::parse("https://patrimonio.test/api/v1/").unwrap(),
    ));
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let transport = ScriptedTransport::new();
    let interceptor = Interceptor::new(
      &config,
      Arc::clone(&storage),
      Arc::new(transport.clone()),
      Connectivity::new(true),
    )
    .unwrap();

    Harness {
      interceptor: Arc::new(interceptor),
      transport,
      storage,
    }
  }

  fn url(path: &str) -> Url {
    Url::parse(&format!("https://patrimonio.test{}", path)).unwrap()
  }

  fn contribution(title: &str) -> Request {
    Request::new(Method::Post, url("/api/v1/contributions/"))
      .with_json(&serde_json::json!({ "title": title }))
      .unwrap()
  }

  #[tokio::test]
  async fn navigation_uses_shell_without_network() {
    let h = harness();
    h.interceptor.precache_shell().await.unwrap();
    let before = h.transport.requests().len();
    h.transport.set_online(false);

    let outcome = h
      .interceptor
      .handle(Request::navigate(url("/heritage/42")))
      .await
      .unwrap();

    let result = outcome.into_response().unwrap();
    assert_eq!(result.source, CacheSource::Precache);
    assert_eq!(h.transport.requests().len(), before);
  }

  #[tokio::test]
  async fn navigation_without_shell_fails_without_network() {
    let h = harness();

    let err = h
      .interceptor
      .handle(Request::navigate(url("/")))
      .await
      .unwrap_err();

    assert!(matches!(
      err.downcast_ref::<SyncError>(),
      Some(SyncError::NoCachedResponse(_))
    ));
    assert!(h.transport.requests().is_empty());
  }

  #[tokio::test]
  async fn identity_paths_never_populate_a_tier() {
    let h = harness();

    for _ in 0..2 {
      let outcome = h
        .interceptor
        .handle(Request::get(url("/api/v1/users/me/")))
        .await
        .unwrap();
      assert_eq!(outcome.into_response().unwrap().source, CacheSource::Network);
    }

    assert_eq!(h.transport.hits("/api/v1/users/me/"), 2);
    for tier in TierName::ALL {
      assert_eq!(h.storage.count_entries(tier).unwrap(), 0);
    }
  }

  #[tokio::test]
  async fn identity_path_without_trailing_slash_is_not_cached() {
    let h = harness();

    for _ in 0..2 {
      let outcome = h
        .interceptor
        .handle(Request::get(url("/api/v1/users/me")))
        .await
        .unwrap();
      assert_eq!(outcome.into_response().unwrap().source, CacheSource::Network);
    }

    assert_eq!(h.transport.hits("/api/v1/users/me"), 2);
    for tier in TierName::ALL {
      assert_eq!(h.storage.count_entries(tier).unwrap(), 0);
    }
  }

  #[tokio::test]
  async fn identity_paths_fail_offline_even_after_success() {
    let h = harness();
    h.interceptor
      .handle(Request::get(url("/api/v1/notifications/")))
      .await
      .unwrap();
    h.transport.set_online(false);

    let err = h
      .interceptor
      .handle(Request::get(url("/api/v1/notifications/")))
      .await
      .unwrap_err();
    assert!(matches!(
      err.downcast_ref::<SyncError>(),
      Some(SyncError::Unreachable(_))
    ));
  }

  #[tokio::test]
  async fn offline_mutation_is_queued_once_and_replayed_once() {
    let h = harness();
    h.transport.set_online(false);

    let outcome = h.interceptor.handle(contribution("Molino de Alao")).await.unwrap();
    assert!(matches!(outcome, Outcome::Deferred(_)));
    assert_eq!(h.interceptor.pending_mutations().unwrap().len(), 1);
    assert!(!h.interceptor.connectivity().is_online());

    h.transport.set_online(true);
    let report = h.interceptor.replay().await.unwrap();
    assert_eq!(report.sent, 1);
    assert!(h.interceptor.pending_mutations().unwrap().is_empty());

    // One failed attempt plus exactly one replay
    assert_eq!(h.transport.hits("/api/v1/contributions/"), 2);

    let again = h.interceptor.replay().await.unwrap();
    assert_eq!(again.sent, 0);
    assert_eq!(h.transport.hits("/api/v1/contributions/"), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn hung_mutation_times_out_into_the_queue() {
    let h = harness();
    h.transport.set_latency(Duration::from_secs(3600));

    let outcome = h.interceptor.handle(contribution("Casa Tristan")).await.unwrap();

    assert!(matches!(outcome, Outcome::Deferred(_)));
    assert_eq!(h.interceptor.pending_mutations().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn server_rejection_is_propagated_not_queued() {
    let h = harness();
    h.transport.respond_with(|_| Ok(Response::new(400, r#"{"title":["required"]}"#)));

    let err = h.interceptor.handle(contribution("")).await.unwrap_err();

    assert!(matches!(
      err.downcast_ref::<SyncError>(),
      Some(SyncError::Rejected { status: 400, .. })
    ));
    assert!(h.interceptor.pending_mutations().unwrap().is_empty());
  }

  #[tokio::test]
  async fn online_mutation_is_not_queued() {
    let h = harness();
    h.transport.respond_with(|_| Ok(Response::new(201, r#"{"id":9}"#)));

    let outcome = h.interceptor.handle(contribution("Puente")).await.unwrap();

    assert_eq!(outcome.response().unwrap().status, 201);
    assert!(h.interceptor.pending_mutations().unwrap().is_empty());
  }

  #[tokio::test]
  async fn reconnect_signal_triggers_replay_in_order() {
    let h = harness();
    h.transport.set_online(false);
    h.interceptor.handle(contribution("A")).await.unwrap();
    h.interceptor.handle(contribution("B")).await.unwrap();
    let watcher = h.interceptor.spawn_replay_on_reconnect();

    h.transport.set_online(true);
    assert!(h.interceptor.check_reachability().await);

    let drained = eventually(|| {
      h.interceptor
        .pending_mutations()
        .map(|p| p.is_empty())
        .unwrap_or(false)
    })
    .await;
    assert!(drained);
    watcher.abort();

    let replayed: Vec<Vec<u8>> = h
      .transport
      .requests()
      .into_iter()
      .filter(|r| r.method == Method::Post && r.headers.contains_key("x-client-mutation-id"))
      .map(|r| r.body)
      .collect();
    assert_eq!(
      replayed,
      vec![br#"{"title":"A"}"#.to_vec(), br#"{"title":"B"}"#.to_vec()]
    );
  }

  #[tokio::test]
  async fn media_is_served_from_cache_on_second_request() {
    let h = harness();
    h.transport.respond_with(|_| Ok(Response::new(200, vec![0xFF, 0xD8])));
    let photo = || Request::get(url("/media/heritage/iglesia.jpg"));

    let first = h.interceptor.handle(photo()).await.unwrap();
    let second = h.interceptor.handle(photo()).await.unwrap();

    assert_eq!(first.into_response().unwrap().source, CacheSource::Network);
    assert_eq!(second.into_response().unwrap().source, CacheSource::CacheFresh);
    assert_eq!(h.transport.hits("/media/"), 1);
  }

  #[tokio::test]
  async fn detail_refresh_lands_before_wait_returns() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let h = harness();
    let served = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&served);
    h.transport.respond_with(move |_| {
      let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
      Ok(Response::new(200, format!("v{}", n)))
    });
    let detail = || Request::get(url("/api/v1/heritage-items/42/"));
    h.interceptor.handle(detail()).await.unwrap();
    h.transport.set_latency(Duration::from_millis(50));

    let second = h
      .interceptor
      .handle(detail())
      .await
      .unwrap()
      .into_response()
      .unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(second.data.body, b"v1");

    h.interceptor.wait_for_refreshes().await;
    assert_eq!(h.transport.hits("/api/v1/heritage-items/42/"), 2);
    let key = CacheKey::new(Method::Get, &url("/api/v1/heritage-items/42/"));
    let stored = h.storage.get_entry(TierName::ApiDetail, &key).unwrap().unwrap();
    assert_eq!(stored.response.body, b"v2");
  }

  #[tokio::test]
  async fn map_tiles_use_their_own_tier() {
    let h = harness();
    let tile = Request::get(Url::parse("https://a.tile.openstreetmap.org/13/2350/4100.png").unwrap());

    h.interceptor.handle(tile).await.unwrap();

    assert_eq!(h.storage.count_entries(TierName::MapTile).unwrap(), 1);
    assert_eq!(h.storage.count_entries(TierName::Media).unwrap(), 0);
  }

  #[tokio::test]
  async fn list_falls_back_to_cache_when_offline() {
    let h = harness();
    let list = || Request::get(url("/api/v1/heritage-items/?search=iglesia"));
    h.interceptor.handle(list()).await.unwrap();
    h.transport.set_online(false);

    let outcome = h.interceptor.handle(list()).await.unwrap();

    assert_eq!(outcome.into_response().unwrap().source, CacheSource::Offline);
  }

  #[tokio::test]
  async fn unmatched_requests_are_not_cached() {
    let h = harness();
    let font = || Request::get(Url::parse("https://fonts.example.org/inter.woff2").unwrap());

    h.interceptor.handle(font()).await.unwrap();
    h.interceptor.handle(font()).await.unwrap();

    assert_eq!(h.transport.hits("/inter.woff2"), 2);
  }

  #[tokio::test]
  async fn reachability_check_tracks_connectivity() {
    let h = harness();
    h.transport.set_online(false);
    assert!(!h.interceptor.check_reachability().await);
    assert!(!h.interceptor.connectivity().is_online());
    h.transport.set_online(true);
    assert!(h.interceptor.check_reachability().await);
  }

  #[tokio::test]
  async fn clear_tier_and_stats() {
    let h = harness();
    h.interceptor
      .handle(Request::get(url("/media/a.jpg")))
      .await
      .unwrap();

    let stats = h.interceptor.tier_stats().unwrap();
    let media = stats
      .iter()
      .find(|(policy, _)| policy.name == TierName::Media)
      .unwrap();
    assert_eq!(media.1, 1);

    assert_eq!(h.interceptor.clear_tier(TierName::Media).unwrap(), 1);
    assert_eq!(h.storage.count_entries(TierName::Media).unwrap(), 0);
  }
}
