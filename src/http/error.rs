use std::time::Duration;

use thiserror::Error;

/// Failures of the synchronization layer that callers need to tell apart.
///
/// These travel inside `color_eyre::Report`; recover them with
/// `report.downcast_ref::<SyncError>()`.
#[derive(Debug, Error)]
pub enum SyncError {
  /// No route to the server (DNS, refused connection, dropped link)
  #[error("network unavailable: {0}")]
  Unreachable(String),

  /// The network did not answer within the tier's timeout
  #[error("no response within {0:?}")]
  TimedOut(Duration),

  /// The server answered a mutation with a 4xx/5xx status
  #[error("server rejected {method} {url} with status {status}")]
  Rejected {
    method: String,
    url: String,
    status: u16,
    body: Vec<u8>,
  },

  /// Network failed and no usable cached copy exists
  #[error("no cached response available for {0}")]
  NoCachedResponse(String),

  /// Offline bundles are only built while connected
  #[error("cannot download an offline bundle without connectivity")]
  OfflineBundleRefused,

  /// Response arrived but could not be read
  #[error("protocol error: {0}")]
  Protocol(String),
}

impl SyncError {
  /// True for failures caused by missing connectivity rather than the server.
  pub fn is_connectivity(&self) -> bool {
    matches!(self, SyncError::Unreachable(_) | SyncError::TimedOut(_))
  }
}
