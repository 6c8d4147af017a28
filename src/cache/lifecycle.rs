//! Cache generations: install the app shell, activate, collect superseded generations.
//!
//! The configured version string is the only upgrade signal. Changing it makes
//! the next start install a fresh generation and delete every other one; not
//! changing it means clients keep serving the shell they already have.

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use url::Url;

use super::storage::CacheStorage;
use super::traits::{Fetcher, Request, Response};
use crate::error::{Error, Result};

/// The set of cache collections tied to one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
  pub prefix: String,
  pub version: String,
}

impl Generation {
  pub fn new(prefix: &str, version: &str) -> Self {
    Self {
      prefix: prefix.to_string(),
      version: version.to_string(),
    }
  }

  fn name(&self, kind: &str) -> String {
    format!("{}-{}-{}", self.prefix, kind, self.version)
  }

  pub fn shell(&self) -> String {
    self.name("shell")
  }

  pub fn runtime(&self) -> String {
    self.name("runtime")
  }

  pub fn api(&self) -> String {
    self.name("api")
  }

  pub fn reserved_names(&self) -> Vec<String> {
    vec![self.shell(), self.runtime(), self.api()]
  }

  /// Recover the generation owning a shell collection name.
  fn from_shell_name(prefix: &str, name: &str) -> Option<Self> {
    let version = name.strip_prefix(prefix)?.strip_prefix("-shell-")?;
    (!version.is_empty()).then(|| Self::new(prefix, version))
  }
}

/// Where a generation stands relative to the one being served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  /// Configured but not yet serving (install pending or failed)
  Installing,
  /// Serving all new requests
  Active,
  /// Replaced by another generation
  Superseded,
}

/// Owns the current-generation state. Nothing else writes it.
pub struct Lifecycle<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  origin: Url,
  manifest: Vec<String>,
  generation: Generation,
  current: watch::Sender<Option<Generation>>,
}

impl<S: CacheStorage, F: Fetcher> Lifecycle<S, F> {
  pub fn new(
    storage: Arc<S>,
    fetcher: Arc<F>,
    origin: Url,
    manifest: Vec<String>,
    generation: Generation,
  ) -> Self {
    let (current, _) = watch::channel(None);
    Self {
      storage,
      fetcher,
      origin,
      manifest,
      generation,
      current,
    }
  }

  /// Receiver for the generation new requests should use.
  pub fn subscribe(&self) -> watch::Receiver<Option<Generation>> {
    self.current.subscribe()
  }

  pub fn current(&self) -> Option<Generation> {
    self.current.borrow().clone()
  }

  pub fn phase_of(&self, generation: &Generation) -> Phase {
    if self.current.borrow().as_ref() == Some(generation) {
      Phase::Active
    } else if *generation == self.generation {
      Phase::Installing
    } else {
      Phase::Superseded
    }
  }

  /// Fetch every manifest resource and store them as the shell collection.
  ///
  /// All-or-nothing: if any resource fails, nothing is written.
  pub async fn install(&self) -> Result<()> {
    let generation = &self.generation;
    info!(version = %generation.version, resources = self.manifest.len(), "installing app shell");

    let mut requests = Vec::with_capacity(self.manifest.len());
    for path in &self.manifest {
      let url = self.origin.join(path).map_err(|e| Error::InvalidRequest {
        message: format!("bad manifest entry '{}': {}", path, e),
      })?;
      requests.push((path.clone(), Request::get(url)));
    }

    let fetched = join_all(
      requests
        .iter()
        .map(|(_, request)| self.fetcher.fetch(request)),
    )
    .await;

    let mut entries: Vec<(String, Response)> = Vec::with_capacity(requests.len());
    let mut failed = Vec::new();
    for ((path, request), result) in requests.iter().zip(fetched) {
      match result {
        Ok(response) if response.is_success() => {
          entries.push((request.cache_key().unwrap_or_default(), response));
        }
        Ok(response) => {
          warn!(resource = %path, status = response.status, "shell resource rejected");
          failed.push(path.clone());
        }
        Err(e) => {
          warn!(resource = %path, error = %e, "shell resource fetch failed");
          failed.push(path.clone());
        }
      }
    }

    if !failed.is_empty() {
      return Err(Error::ManifestInstall { failed });
    }

    self.storage.put_all(&generation.shell(), &entries)?;
    info!(version = %generation.version, "app shell installed");
    Ok(())
  }

  /// Make the configured generation current and delete every other collection.
  ///
  /// The generation's runtime and api collections are created here; request
  /// handling only writes into collections that already exist.
  /// Returns the names of the deleted collections.
  pub fn activate(&self) -> Result<Vec<String>> {
    let reserved = self.generation.reserved_names();
    let mut removed = Vec::new();

    for name in &reserved {
      self.storage.create_collection(name)?;
    }
    // Take over first so new requests stop reaching the old generation
    self.current.send_replace(Some(self.generation.clone()));

    for info in self.storage.collections()? {
      if reserved.contains(&info.name) {
        continue;
      }
      if self.storage.delete_collection(&info.name)? {
        info!(collection = %info.name, phase = ?Phase::Superseded, "deleted cache collection");
        removed.push(info.name);
      }
    }

    info!(version = %self.generation.version, removed = removed.len(), "cache generation active");
    Ok(removed)
  }

  /// Startup path: install if this version has no shell yet, then activate.
  ///
  /// When the install fails, the newest previously installed generation keeps
  /// serving and nothing is deleted.
  pub async fn ensure_current(&self) -> Result<Generation> {
    let collections = self.storage.collections()?;
    let shell = self.generation.shell();

    if !collections.iter().any(|c| c.name == shell) {
      if let Err(e) = self.install().await {
        let fallback = collections
          .iter()
          .filter_map(|c| {
            Generation::from_shell_name(&self.generation.prefix, &c.name).map(|g| (c.created_at, g))
          })
          .max_by_key(|(created_at, _)| *created_at)
          .map(|(_, g)| g);
        if let Some(previous) = fallback {
          warn!(version = %previous.version, error = %e, "install failed, keeping previous generation");
          self.current.send_replace(Some(previous));
        }
        return Err(e);
      }
    }

    self.activate()?;
    Ok(self.generation.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::layer::{CacheLayer, Target};
  use crate::cache::storage::SqliteStorage;
  use crate::cache::traits::CacheSource;
  use crate::testing::FakeFetcher;

  const ORIGIN: &str = "https://notes.test/";

  fn manifest(paths: &[&str]) -> Vec<String> {
    paths.iter().map(|p| p.to_string()).collect()
  }

  fn key(path: &str) -> String {
    Url::parse(ORIGIN).unwrap().join(path).unwrap().to_string()
  }

  fn lifecycle(
    storage: &Arc<SqliteStorage>,
    fetcher: &Arc<FakeFetcher>,
    version: &str,
    paths: &[&str],
  ) -> Lifecycle<SqliteStorage, FakeFetcher> {
    Lifecycle::new(
      Arc::clone(storage),
      Arc::clone(fetcher),
      Url::parse(ORIGIN).unwrap(),
      manifest(paths),
      Generation::new("notesync", version),
    )
  }

  fn serve(fetcher: &FakeFetcher, paths: &[&str]) {
    for path in paths {
      fetcher.respond(&key(path), Response::new(200, format!("body of {}", path)));
    }
  }

  fn names(storage: &SqliteStorage) -> Vec<String> {
    let mut names: Vec<String> = storage
      .collections()
      .unwrap()
      .into_iter()
      .map(|c| c.name)
      .collect();
    names.sort();
    names
  }

  fn generation_names(version: &str) -> Vec<String> {
    let mut names = Generation::new("notesync", version).reserved_names();
    names.sort();
    names
  }

  #[test]
  fn test_generation_names() {
    let g = Generation::new("notesync", "v3");
    assert_eq!(g.shell(), "notesync-shell-v3");
    assert_eq!(g.runtime(), "notesync-runtime-v3");
    assert_eq!(g.api(), "notesync-api-v3");
    assert_eq!(
      Generation::from_shell_name("notesync", "notesync-shell-v3"),
      Some(g)
    );
    assert_eq!(
      Generation::from_shell_name("notesync", "notesync-runtime-v3"),
      None
    );
  }

  #[tokio::test]
  async fn test_install_populates_shell() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(FakeFetcher::new());
    let paths = ["/", "/index.html", "/app.js"];
    serve(&fetcher, &paths);

    let lc = lifecycle(&storage, &fetcher, "v1", &paths);
    let generation = lc.ensure_current().await.unwrap();

    assert_eq!(lc.phase_of(&generation), Phase::Active);
    for path in paths {
      let entry = storage
        .match_entry("notesync-shell-v1", &key(path))
        .unwrap()
        .unwrap();
      assert_eq!(entry.response.body, format!("body of {}", path).as_bytes());
    }
  }

  #[tokio::test]
  async fn test_failed_install_commits_nothing() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(FakeFetcher::new());
    serve(&fetcher, &["/", "/index.html"]);

    let lc = lifecycle(&storage, &fetcher, "v1", &["/", "/index.html", "/app.js"]);
    let err = lc.ensure_current().await.unwrap_err();

    match err {
      Error::ManifestInstall { failed } => assert_eq!(failed, vec!["/app.js".to_string()]),
      other => panic!("unexpected error: {other}"),
    }
    assert!(storage.collections().unwrap().is_empty());
    assert_eq!(lc.current(), None);
    assert_eq!(
      lc.phase_of(&Generation::new("notesync", "v1")),
      Phase::Installing
    );
  }

  #[tokio::test]
  async fn test_upgrade_deletes_previous_generation() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(FakeFetcher::new());
    serve(&fetcher, &["/", "/index.html", "/app.js", "/app.css"]);

    let v1 = lifecycle(&storage, &fetcher, "v1", &["/", "/index.html", "/app.js"]);
    v1.ensure_current().await.unwrap();
    storage
      .put("notesync-runtime-v1", &key("/logo.png"), &Response::new(200, "png"))
      .unwrap();

    let v2 = lifecycle(
      &storage,
      &fetcher,
      "v2",
      &["/", "/index.html", "/app.js", "/app.css"],
    );
    let generation = v2.ensure_current().await.unwrap();

    assert_eq!(names(&storage), generation_names("v2"));
    assert_eq!(
      v2.phase_of(&Generation::new("notesync", "v1")),
      Phase::Superseded
    );
    assert_eq!(v2.phase_of(&generation), Phase::Active);
    assert!(storage
      .match_entry("notesync-shell-v2", &key("/app.css"))
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn test_same_version_skips_install() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(FakeFetcher::new());
    serve(&fetcher, &["/"]);

    lifecycle(&storage, &fetcher, "v1", &["/"])
      .ensure_current()
      .await
      .unwrap();
    assert_eq!(fetcher.calls(), 1);

    fetcher.set_online(false);
    let again = lifecycle(&storage, &fetcher, "v1", &["/"]);
    again.ensure_current().await.unwrap();
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(again.current(), Some(Generation::new("notesync", "v1")));
  }

  #[tokio::test]
  async fn test_failed_upgrade_keeps_serving_previous_generation() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(FakeFetcher::new());
    serve(&fetcher, &["/"]);

    lifecycle(&storage, &fetcher, "v1", &["/"])
      .ensure_current()
      .await
      .unwrap();

    fetcher.set_online(false);
    let v2 = lifecycle(&storage, &fetcher, "v2", &["/"]);
    assert!(v2.ensure_current().await.is_err());

    assert_eq!(v2.current(), Some(Generation::new("notesync", "v1")));
    assert_eq!(names(&storage), generation_names("v1"));
  }

  #[tokio::test]
  async fn test_late_refresh_does_not_bring_back_superseded_collection() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(FakeFetcher::new());
    serve(&fetcher, &["/", "/manifest.json"]);

    lifecycle(&storage, &fetcher, "v1", &["/"])
      .ensure_current()
      .await
      .unwrap();
    let old = Generation::new("notesync", "v1");
    let url = key("/manifest.json");
    storage
      .put(&old.runtime(), &url, &Response::new(200, "cached"))
      .unwrap();

    // Refresh starts against v1 and is held until v2 has taken over
    let gate = fetcher.hold(&url);
    let layer = CacheLayer::new(Arc::clone(&storage), Arc::clone(&fetcher));
    let target = Target {
      key: url.clone(),
      store_in: old.runtime(),
      lookup: vec![old.runtime(), old.shell()],
      json_placeholder: false,
    };
    let result = layer
      .stale_while_revalidate(&Request::get(Url::parse(&url).unwrap()), &target)
      .await;
    assert_eq!(result.source, CacheSource::CacheStale);

    lifecycle(&storage, &fetcher, "v2", &["/"])
      .ensure_current()
      .await
      .unwrap();

    gate.notify_one();
    result.revalidation.unwrap().await.unwrap();

    assert_eq!(names(&storage), generation_names("v2"));
    assert!(storage.match_entry(&old.runtime(), &url).unwrap().is_none());
  }
}
