//! Request interception: classify each request and dispatch it to a caching policy.

use tokio::sync::watch;
use tracing::debug;
use url::{Origin, Url};

use super::layer::{CacheLayer, Target};
use super::lifecycle::Generation;
use super::storage::CacheStorage;
use super::traits::{CacheResult, Fetcher, Request};
use crate::error::Result;

/// Request categories, in match priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
  /// Dynamic data under the API prefix
  Api,
  /// A request for an HTML document
  Navigation,
  /// Script, style, image or font
  Static,
  /// Anything else on the application origin
  Other,
}

/// Caching policy applied to a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
}

impl Category {
  pub fn strategy(&self) -> Strategy {
    match self {
      Self::Api | Self::Navigation => Strategy::NetworkFirst,
      Self::Static => Strategy::CacheFirst,
      Self::Other => Strategy::StaleWhileRevalidate,
    }
  }
}

/// Classification rules for intercepted requests.
#[derive(Debug, Clone)]
pub struct RouteRules {
  origin: Origin,
  api_prefix: String,
  static_extensions: Vec<String>,
}

impl RouteRules {
  pub fn new(app_url: &Url, api_prefix: &str, static_extensions: &[String]) -> Self {
    Self {
      origin: app_url.origin(),
      api_prefix: api_prefix.to_string(),
      static_extensions: static_extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
        .collect(),
    }
  }

  /// Category for `request`, or `None` when it bypasses the cache entirely.
  ///
  /// Non-GET and cross-origin requests bypass; the first matching rule wins.
  pub fn classify(&self, request: &Request) -> Option<Category> {
    if request.cache_key().is_none() || request.url.origin() != self.origin {
      return None;
    }

    let path = request.url.path();
    if path.starts_with(&self.api_prefix) {
      return Some(Category::Api);
    }
    if request.wants_html() {
      return Some(Category::Navigation);
    }
    if self.is_static_asset(path) {
      return Some(Category::Static);
    }
    Some(Category::Other)
  }

  fn is_static_asset(&self, path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or("");
    match file.rsplit_once('.') {
      Some((stem, ext)) if !stem.is_empty() => {
        let ext = ext.to_ascii_lowercase();
        self.static_extensions.iter().any(|e| *e == ext)
      }
      _ => false,
    }
  }
}

/// Routes intercepted requests through the current cache generation.
pub struct Router<S: CacheStorage, F: Fetcher> {
  rules: RouteRules,
  layer: CacheLayer<S, F>,
  generation: watch::Receiver<Option<Generation>>,
}

impl<S: CacheStorage, F: Fetcher> Router<S, F> {
  pub fn new(
    rules: RouteRules,
    layer: CacheLayer<S, F>,
    generation: watch::Receiver<Option<Generation>>,
  ) -> Self {
    Self {
      rules,
      layer,
      generation,
    }
  }

  /// Handle one request.
  ///
  /// Routed requests always produce a response. Only bypassed requests can
  /// fail, with the plain network error.
  pub async fn handle(&self, request: &Request) -> Result<CacheResult> {
    let Some(category) = self.rules.classify(request) else {
      debug!(method = %request.method, url = %request.url, "bypassing cache");
      let response = self.layer.fetcher().fetch(request).await?;
      return Ok(CacheResult::bypass(response));
    };

    // Snapshot: an activation mid-request does not affect this request
    let generation = self.generation.borrow().clone();
    let json_placeholder = category == Category::Api;
    let strategy = category.strategy();

    let Some(generation) = generation else {
      debug!(url = %request.url, "no active cache generation");
      return Ok(self.layer.network_only(request, json_placeholder).await);
    };

    let target = Self::target(request, category, &generation);
    debug!(key = %target.key, ?category, ?strategy, version = %generation.version, "routing request");

    let result = match strategy {
      Strategy::CacheFirst => self.layer.cache_first(request, &target).await,
      Strategy::NetworkFirst => self.layer.network_first(request, &target).await,
      Strategy::StaleWhileRevalidate => self.layer.stale_while_revalidate(request, &target).await,
    };
    Ok(result)
  }

  fn target(request: &Request, category: Category, generation: &Generation) -> Target {
    let store_in = match category {
      Category::Api => generation.api(),
      Category::Navigation | Category::Static | Category::Other => generation.runtime(),
    };

    // Own collection first, then the rest of the generation (shell included)
    let mut lookup = vec![store_in.clone()];
    lookup.extend(
      generation
        .reserved_names()
        .into_iter()
        .filter(|name| *name != store_in),
    );

    Target {
      key: request.cache_key().unwrap_or_default(),
      store_in,
      lookup,
      json_placeholder: category == Category::Api,
    }
  }
}
