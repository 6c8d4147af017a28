//! Cache layer that orchestrates caching policies with network fetching.

use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::{CacheEntry, CacheStorage};
use super::traits::{CacheResult, Fetcher, Request, Response};

/// Where a routed request reads from and writes to.
#[derive(Debug, Clone)]
pub struct Target {
  /// Normalized request identity
  pub key: String,
  /// Collection that receives fresh copies
  pub store_in: String,
  /// Collections searched on lookup, in order
  pub lookup: Vec<String>,
  /// Placeholder flavour when nothing can answer
  pub json_placeholder: bool,
}

/// Cache layer that manages caching logic and network fetching.
///
/// Cache and storage failures are recovered here: a broken lookup counts as
/// a miss and a failed write is logged, so callers always get a response.
pub struct CacheLayer<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
}

impl<S: CacheStorage, F: Fetcher> CacheLayer<S, F> {
  pub fn new(storage: Arc<S>, fetcher: Arc<F>) -> Self {
    Self { storage, fetcher }
  }

  pub fn fetcher(&self) -> &F {
    &self.fetcher
  }

  /// Cache-first strategy.
  ///
  /// 1. On hit, return immediately without touching the network
  /// 2. On miss, fetch and keep a copy of successful responses
  /// 3. On fetch error, return the offline placeholder
  pub async fn cache_first(&self, request: &Request, target: &Target) -> CacheResult {
    if let Some(entry) = lookup(&*self.storage, target) {
      debug!(key = %entry.key, "cache hit");
      return CacheResult::from_cache(entry.response, entry.stored_at);
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          store(&*self.storage, target, &response);
        }
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!(key = %target.key, error = %e, "cache-first fetch failed");
        CacheResult::placeholder(target.json_placeholder)
      }
    }
  }

  /// Network-first strategy.
  ///
  /// Live successful responses win and refresh the cache. Any other outcome
  /// falls back to the cached copy, then to the offline placeholder.
  pub async fn network_first(&self, request: &Request, target: &Target) -> CacheResult {
    match self.fetcher.fetch(request).await {
      Ok(response) if response.is_success() => {
        store(&*self.storage, target, &response);
        return CacheResult::from_network(response);
      }
      Ok(response) => {
        debug!(key = %target.key, status = response.status, "network-first upstream rejected");
      }
      Err(e) => {
        debug!(key = %target.key, error = %e, "network-first fetch failed");
      }
    }

    match lookup(&*self.storage, target) {
      Some(entry) => CacheResult::offline(entry.response, entry.stored_at),
      None => CacheResult::placeholder(target.json_placeholder),
    }
  }

  /// Stale-while-revalidate strategy.
  ///
  /// A cached copy is returned at once while a background fetch refreshes it
  /// for next time. Without a cached copy the caller waits on the network.
  pub async fn stale_while_revalidate(&self, request: &Request, target: &Target) -> CacheResult {
    if let Some(entry) = lookup(&*self.storage, target) {
      let storage = Arc::clone(&self.storage);
      let fetcher = Arc::clone(&self.fetcher);
      let request = request.clone();
      let target = target.clone();
      let previous = entry.digest.clone();

      let handle = tokio::spawn(async move {
        revalidate(&*storage, &*fetcher, &request, &target, &previous).await;
      });
      return CacheResult::stale(entry.response, entry.stored_at, handle);
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          store(&*self.storage, target, &response);
        }
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!(key = %target.key, error = %e, "revalidating fetch failed with nothing cached");
        CacheResult::placeholder(target.json_placeholder)
      }
    }
  }

  /// Network with placeholder fallback, for when no cache generation is active.
  pub async fn network_only(&self, request: &Request, json_placeholder: bool) -> CacheResult {
    match self.fetcher.fetch(request).await {
      Ok(response) => CacheResult::from_network(response),
      Err(e) => {
        debug!(url = %request.url, error = %e, "fetch failed without cache");
        CacheResult::placeholder(json_placeholder)
      }
    }
  }
}

impl<S: CacheStorage, F: Fetcher> Clone for CacheLayer<S, F> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
    }
  }
}

async fn revalidate<S: CacheStorage, F: Fetcher>(
  storage: &S,
  fetcher: &F,
  request: &Request,
  target: &Target,
  previous_digest: &str,
) {
  match fetcher.fetch(request).await {
    Ok(response) if response.is_success() => {
      let changed = response.digest() != previous_digest;
      store(storage, target, &response);
      debug!(key = %target.key, changed, "revalidated cached copy");
    }
    Ok(response) => {
      debug!(key = %target.key, status = response.status, "revalidation rejected, keeping cached copy");
    }
    Err(e) => {
      // The caller already has the cached copy
      warn!(key = %target.key, error = %e, "background revalidation failed");
    }
  }
}

fn lookup<S: CacheStorage>(storage: &S, target: &Target) -> Option<CacheEntry> {
  match storage.match_any(&target.lookup, &target.key) {
    Ok(entry) => entry,
    Err(e) => {
      warn!(key = %target.key, error = %e, "cache lookup failed, treating as miss");
      None
    }
  }
}

fn store<S: CacheStorage>(storage: &S, target: &Target, response: &Response) {
  if let Err(e) = storage.put(&target.store_in, &target.key, response) {
    warn!(key = %target.key, collection = %target.store_in, error = %e, "failed to store response");
  }
}
