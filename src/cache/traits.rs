//! Core types for the request cache: requests, responses and where they came from.

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use tokio::task::JoinHandle;
use url::Url;

use crate::error::Result;

/// Header marking a synthesized offline placeholder.
pub const OFFLINE_HEADER: &str = "x-notesync-offline";

/// An intercepted resource request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  /// Value of the Accept header, if any
  pub accept: Option<String>,
  /// True when the request is a top-level document navigation
  pub navigate: bool,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      accept: None,
      navigate: false,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A document navigation (GET, wants HTML).
  pub fn navigation(url: Url) -> Self {
    Self {
      accept: Some("text/html".to_string()),
      navigate: true,
      ..Self::get(url)
    }
  }

  pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
    self.accept = Some(accept.into());
    self
  }

  /// Normalized cache identity: the URL without its fragment. GET only.
  pub fn cache_key(&self) -> Option<String> {
    if self.method != Method::GET {
      return None;
    }
    let mut url = self.url.clone();
    url.set_fragment(None);
    Some(url.to_string())
  }

  pub fn wants_html(&self) -> bool {
    self.navigate
      || self
        .accept
        .as_deref()
        .is_some_and(|a| a.to_ascii_lowercase().contains("text/html"))
  }
}

/// A response snapshot. Stored wholesale, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_ascii_lowercase(), value.to_string()));
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  #[allow(dead_code)]
  pub fn is_offline_placeholder(&self) -> bool {
    self.header(OFFLINE_HEADER).is_some()
  }

  /// Synthesized response used when neither cache nor network can answer.
  pub fn offline_placeholder(json: bool) -> Self {
    let response = if json {
      Response::new(503, r#"{"error":"offline"}"#).with_header("content-type", "application/json")
    } else {
      Response::new(503, OFFLINE_PAGE).with_header("content-type", "text/html; charset=utf-8")
    };
    response.with_header(OFFLINE_HEADER, "1")
  }

  /// SHA-256 of the body, hex encoded.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(&self.body);
    hex::encode(hasher.finalize())
  }
}

const OFFLINE_PAGE: &str = "<!doctype html>\n<html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You are offline</h1><p>This page is not available offline yet. Your notes are saved locally \
and will sync when the connection returns.</p></body></html>\n";

/// Source of network responses.
///
/// Implementations report transport failures as `Err`; any HTTP status,
/// successful or not, is an `Ok` response.
pub trait Fetcher: Send + Sync + 'static {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

/// Result from a routed request, including metadata about the source.
#[derive(Debug)]
pub struct CacheResult {
  /// The response handed to the caller
  pub data: Response,
  /// Where the response came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// Background refresh started by stale-while-revalidate
  pub revalidation: Option<JoinHandle<()>>,
}

impl CacheResult {
  /// Create a new result from live network data.
  pub fn from_network(data: Response) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
      revalidation: None,
    }
  }

  /// Create a new result from cached data.
  pub fn from_cache(data: Response, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
      revalidation: None,
    }
  }

  /// Cached data served while a background refresh runs.
  pub fn stale(data: Response, cached_at: DateTime<Utc>, revalidation: JoinHandle<()>) -> Self {
    Self {
      data,
      source: CacheSource::CacheStale,
      cached_at: Some(cached_at),
      revalidation: Some(revalidation),
    }
  }

  /// Cached data served because the network failed.
  pub fn offline(data: Response, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
      revalidation: None,
    }
  }

  pub fn placeholder(json: bool) -> Self {
    Self {
      data: Response::offline_placeholder(json),
      source: CacheSource::Placeholder,
      cached_at: None,
      revalidation: None,
    }
  }

  pub fn bypass(data: Response) -> Self {
    Self {
      data,
      source: CacheSource::Bypass,
      cached_at: None,
      revalidation: None,
    }
  }
}

/// Indicates where a routed response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live data from the network
  Network,
  /// Cache hit, no network involved
  Cache,
  /// Cache hit while a background refresh is in flight
  CacheStale,
  /// Network failed or rejected the request, serving cached data
  Offline,
  /// Nothing cached and no network: synthesized offline response
  Placeholder,
  /// Request not handled by the cache at all
  Bypass,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::CacheStale => "cache (revalidating)",
      Self::Offline => "cache (offline)",
      Self::Placeholder => "offline placeholder",
      Self::Bypass => "network (bypass)",
    };
    f.write_str(s)
  }
}
