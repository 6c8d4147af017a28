//! Error taxonomy shared by the cache and sync halves.

use std::time::Duration;

/// Errors produced by the store, cache and transport layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// Store open or transaction failure.
  #[error("storage error: {message}")]
  Storage { message: String },

  /// Fetch or connect failure (no usable response at all).
  #[error("network error: {message}")]
  Network { message: String },

  /// A remote call did not finish before its deadline.
  #[error("timed out after {after:?}")]
  Timeout { after: Duration },

  /// The upstream answered with a non-success status.
  #[error("upstream rejected request with status {status}")]
  UpstreamRejection { status: u16 },

  /// One or more app shell resources could not be fetched.
  #[error("manifest install failed for: {}", failed.join(", "))]
  ManifestInstall { failed: Vec<String> },

  #[error("note {id} not found")]
  NotFound { id: i64 },

  #[error("invalid request: {message}")]
  InvalidRequest { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
  pub fn storage(message: impl Into<String>) -> Self {
    Self::Storage {
      message: message.into(),
    }
  }

  pub fn network(message: impl Into<String>) -> Self {
    Self::Network {
      message: message.into(),
    }
  }

  /// Whether the failure means the remote endpoint is unreachable as a whole.
  ///
  /// Rejections and per-item timeouts concern a single submission only.
  pub fn is_transport(&self) -> bool {
    matches!(self, Self::Network { .. })
  }
}

impl From<rusqlite::Error> for Error {
  fn from(e: rusqlite::Error) -> Self {
    Self::storage(e.to_string())
  }
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Self::storage(format!("failed to (de)serialize record: {}", e))
  }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
  fn from(e: std::sync::PoisonError<T>) -> Self {
    Self::storage(format!("lock poisoned: {}", e))
  }
}

impl From<reqwest::Error> for Error {
  fn from(e: reqwest::Error) -> Self {
    // Client-side deadlines count as transport failures, like refused connections
    Self::network(e.to_string())
  }
}
