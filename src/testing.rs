//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::http::{Request, Response, SyncError, Transport};

type Handler = Box<dyn Fn(&Request) -> Result<Response, SyncError> + Send + Sync>;

struct Inner {
  online: AtomicBool,
  latency: Mutex<Duration>,
  handler: Mutex<Handler>,
  requests: Mutex<Vec<Request>>,
}

/// In-process transport with scripted responses and simulated link loss.
///
/// Every attempt is recorded, including the ones that fail for lack of
/// connectivity.
#[derive(Clone)]
pub struct ScriptedTransport {
  inner: Arc<Inner>,
}

impl ScriptedTransport {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Inner {
        online: AtomicBool::new(true),
        latency: Mutex::new(Duration::ZERO),
        handler: Mutex::new(Box::new(|_| Ok(Response::new(200, "{}")))),
        requests: Mutex::new(Vec::new()),
      }),
    }
  }

  pub fn set_online(&self, online: bool) {
    self.inner.online.store(online, Ordering::SeqCst);
  }

  pub fn set_latency(&self, latency: Duration) {
    *self.inner.latency.lock().unwrap() = latency;
  }

  pub fn respond_with<F>(&self, handler: F)
  where
    F: Fn(&Request) -> Result<Response, SyncError> + Send + Sync + 'static,
  {
    *self.inner.handler.lock().unwrap() = Box::new(handler);
  }

  pub fn requests(&self) -> Vec<Request> {
    self.inner.requests.lock().unwrap().clone()
  }

  /// Number of recorded attempts whose URL path starts with `prefix`.
  pub fn hits(&self, prefix: &str) -> usize {
    self
      .inner
      .requests
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url.path().starts_with(prefix))
      .count()
  }
}

impl Default for ScriptedTransport {
  fn default() -> Self {
    Self::new()
  }
}

impl Transport for ScriptedTransport {
  fn send(&self, request: Request) -> BoxFuture<'static, Result<Response, SyncError>> {
    let inner = Arc::clone(&self.inner);
    Box::pin(async move {
      let latency = *inner.latency.lock().unwrap();
      inner.requests.lock().unwrap().push(request.clone());
      if !latency.is_zero() {
        tokio::time::sleep(latency).await;
      }
      if !inner.online.load(Ordering::SeqCst) {
        return Err(SyncError::Unreachable("simulated link loss".to_string()));
      }
      let handler = inner.handler.lock().unwrap();
      handler(&request)
    })
  }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
  for _ in 0..200 {
    if condition() {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  condition()
}
