use tokio::sync::watch;
use tracing::info;

/// Process-wide online flag.
///
/// Written only by the connectivity signal (probe or `--offline`); every other
/// component holds a read-only receiver.
pub struct Connectivity {
  tx: watch::Sender<bool>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _) = watch::channel(online);
    Self { tx }
  }

  /// Record the observed state. Receivers are only woken on an edge.
  ///
  /// Returns true when the state changed.
  pub fn set(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      info!(online, "connectivity changed");
    }
    changed
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}
