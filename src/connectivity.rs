//! Online/offline signal shared by the interceptor, the replay trigger and
//! the bundle builder.

use std::sync::Arc;

use tokio::sync::watch;

/// Cloneable handle on the current connectivity state.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record the observed state. Subscribers are woken only on a change.
  pub fn set_online(&self, online: bool) {
    self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn only_transitions_notify() {
    let connectivity = Connectivity::new(false);
    let mut rx = connectivity.subscribe();

    connectivity.set_online(false);
    assert!(!rx.has_changed().unwrap());

    connectivity.set_online(true);
    assert!(rx.has_changed().unwrap());
    assert!(*rx.borrow_and_update());
    assert!(connectivity.is_online());
  }

  #[test]
  fn clones_share_state() {
    let a = Connectivity::new(true);
    let b = a.clone();
    b.set_online(false);
    assert!(!a.is_online());
  }
}
