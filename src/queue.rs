//! Durable write queue for contribution mutations that failed for lack of
//! connectivity.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::http::{Headers, Method, Request, Response, SyncError, Transport};

/// Headers that go stale between capture and replay. Credentials are
/// re-applied by the transport at send time.
const VOLATILE_HEADERS: &[&str] = &[
  "authorization",
  "cookie",
  "date",
  "if-modified-since",
  "if-none-match",
  "x-request-id",
];

/// Header carrying the client-generated id of a queued mutation.
pub const MUTATION_ID_HEADER: &str = "x-client-mutation-id";

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
  #[serde(default = "default_queue_name")]
  pub name: String,
  #[serde(default = "default_retention_hours")]
  pub retention_hours: i64,
  /// Limit on a single write attempt, first try or replay
  #[serde(default = "default_send_timeout_secs")]
  pub send_timeout_secs: u64,
}

fn default_queue_name() -> String {
  "contributions-queue".to_string()
}

fn default_retention_hours() -> i64 {
  24
}

fn default_send_timeout_secs() -> u64 {
  15
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      name: default_queue_name(),
      retention_hours: default_retention_hours(),
      send_timeout_secs: default_send_timeout_secs(),
    }
  }
}

/// A serialized mutation waiting for replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMutation {
  /// Client-generated; sent along on replay but not relied on for dedup
  pub id: Uuid,
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub body: Vec<u8>,
  pub enqueued_at: DateTime<Utc>,
}

impl QueuedMutation {
  /// Capture a request verbatim, minus volatile headers.
  pub fn capture(method: Method, url: Url, headers: Headers, body: Vec<u8>) -> Self {
    let headers = headers
      .into_iter()
      .filter(|(name, _)| !VOLATILE_HEADERS.contains(&name.as_str()))
      .collect();

    Self {
      id: Uuid::new_v4(),
      method,
      url,
      headers,
      body,
      enqueued_at: Utc::now(),
    }
  }

  pub fn from_request(request: &Request) -> Self {
    Self::capture(
      request.method,
      request.url.clone(),
      request.headers.clone(),
      request.body.clone(),
    )
  }

  /// Rebuild the plain request to reissue.
  pub fn to_request(&self) -> Request {
    let mut request = Request::new(self.method, self.url.clone()).with_body(self.body.clone());
    request.headers = self.headers.clone();
    request
      .headers
      .insert(MUTATION_ID_HEADER.to_string(), self.id.to_string());
    request
  }
}

/// Trait for queue storage backends.
pub trait QueueStorage: Send + Sync + 'static {
  /// Append a mutation to the named queue.
  fn push_mutation(&self, queue: &str, mutation: &QueuedMutation) -> Result<()>;

  /// All mutations of a queue, oldest first.
  fn list_mutations(&self, queue: &str) -> Result<Vec<QueuedMutation>>;

  /// Remove one mutation. Returns whether it existed.
  fn remove_mutation(&self, id: Uuid) -> Result<bool>;

  /// Drop mutations enqueued before `cutoff`.
  fn purge_mutations_before(&self, queue: &str, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
  /// Delivered and removed
  pub sent: usize,
  /// Refused by the server with a 4xx and removed
  pub rejected: usize,
  /// Older than the retention window, dropped unsent
  pub expired: usize,
  /// Still queued after the pass
  pub remaining: usize,
  /// Another pass was already running; nothing was done
  pub skipped: bool,
}

/// FIFO queue of mutations persisted across restarts.
pub struct WriteQueue<S: QueueStorage> {
  name: String,
  retention: Duration,
  send_timeout: std::time::Duration,
  storage: Arc<S>,
  /// Held for the duration of a replay pass
  replaying: Mutex<()>,
}

impl<S: QueueStorage> WriteQueue<S> {
  pub fn new(storage: Arc<S>, config: &QueueConfig) -> Self {
    Self {
      name: config.name.clone(),
      retention: Duration::hours(config.retention_hours),
      send_timeout: std::time::Duration::from_secs(config.send_timeout_secs.max(1)),
      storage,
      replaying: Mutex::new(()),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn send_timeout(&self) -> std::time::Duration {
    self.send_timeout
  }

  /// Persist a request for later replay.
  pub fn enqueue(&self, request: &Request) -> Result<QueuedMutation> {
    let mutation = QueuedMutation::from_request(request);
    self.storage.push_mutation(&self.name, &mutation)?;
    info!(
      queue = %self.name,
      id = %mutation.id,
      method = %mutation.method,
      url = %mutation.url,
      "mutation queued for replay"
    );
    Ok(mutation)
  }

  /// Pending mutations, oldest first.
  pub fn pending(&self) -> Result<Vec<QueuedMutation>> {
    self.storage.list_mutations(&self.name)
  }

  /// Replay queued mutations in submission order.
  ///
  /// Expired entries are dropped without being sent. The pass stops at the
  /// first entry that cannot be delivered so nothing is reordered. A call made
  /// while another pass is running returns immediately with `skipped`.
  pub async fn replay<T: Transport + ?Sized>(&self, transport: &T) -> Result<ReplayReport> {
    let Ok(_guard) = self.replaying.try_lock() else {
      debug!(queue = %self.name, "replay already in progress");
      return Ok(ReplayReport {
        skipped: true,
        ..Default::default()
      });
    };

    let mut report = ReplayReport::default();
    let now = Utc::now();

    report.expired = self
      .storage
      .purge_mutations_before(&self.name, now - self.retention)?;
    if report.expired > 0 {
      warn!(queue = %self.name, count = report.expired, "dropped mutations past retention window");
    }

    let pending = self.storage.list_mutations(&self.name)?;
    let total = pending.len();

    for mutation in pending {
      match send_with_timeout(transport, mutation.to_request(), self.send_timeout).await {
        Ok(response) if response.is_success() => {
          self.storage.remove_mutation(mutation.id)?;
          report.sent += 1;
          debug!(queue = %self.name, id = %mutation.id, status = response.status, "replayed");
        }
        Ok(response) if response.is_client_error() => {
          self.storage.remove_mutation(mutation.id)?;
          report.rejected += 1;
          warn!(
            queue = %self.name,
            id = %mutation.id,
            status = response.status,
            "server rejected replayed mutation, dropping it"
          );
        }
        Ok(response) => {
          debug!(queue = %self.name, id = %mutation.id, status = response.status, "replay stalled");
          break;
        }
        Err(e) => {
          debug!(queue = %self.name, id = %mutation.id, error = %e, "replay stalled");
          break;
        }
      }
    }

    report.remaining = total - report.sent - report.rejected;
    if report.sent > 0 || report.rejected > 0 {
      info!(
        queue = %self.name,
        sent = report.sent,
        rejected = report.rejected,
        remaining = report.remaining,
        "replay pass finished"
      );
    }

    Ok(report)
  }
}

/// Send a write, giving up after `limit`.
///
/// An expired attempt is abandoned and reported as `TimedOut`, which counts
/// as a connectivity failure.
pub async fn send_with_timeout<T: Transport + ?Sized>(
  transport: &T,
  request: Request,
  limit: std::time::Duration,
) -> Result<Response, SyncError> {
  match tokio::time::timeout(limit, transport.send(request)).await {
    Ok(result) => result,
    Err(_) => Err(SyncError::TimedOut(limit)),
  }
}
