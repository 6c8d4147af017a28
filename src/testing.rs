//! Scripted network doubles shared by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use url::Url;

use crate::cache::{Fetcher, Request, Response};
use crate::error::{Error, Result};
use crate::notes::{NoteId, NotePayload};
use crate::sync::RemoteEndpoint;

/// A local URL nothing listens on.
pub fn closed_port_url() -> Url {
  let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
  let port = listener.local_addr().unwrap().port();
  drop(listener);
  Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap()
}

/// Fetcher answering from a fixed route table. Unknown keys get a 404.
pub struct FakeFetcher {
  routes: Mutex<HashMap<String, Response>>,
  online: AtomicBool,
  calls: AtomicUsize,
  gates: Mutex<HashMap<String, Arc<Notify>>>,
}

impl FakeFetcher {
  pub fn new() -> Self {
    Self {
      routes: Mutex::new(HashMap::new()),
      online: AtomicBool::new(true),
      calls: AtomicUsize::new(0),
      gates: Mutex::new(HashMap::new()),
    }
  }

  pub fn respond(&self, key: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(key.to_string(), response);
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  /// Make every later fetch of `key` wait for one `notify_one` on the returned gate.
  pub fn hold(&self, key: &str) -> Arc<Notify> {
    let gate = Arc::new(Notify::new());
    self
      .gates
      .lock()
      .unwrap()
      .insert(key.to_string(), Arc::clone(&gate));
    gate
  }
}

impl Fetcher for FakeFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.calls.fetch_add(1, Ordering::SeqCst);

    let key = request.url.to_string();
    let gate = self.gates.lock().unwrap().get(&key).cloned();
    if let Some(gate) = gate {
      gate.notified().await;
    }

    if !self.online.load(Ordering::SeqCst) {
      return Err(Error::network("connection refused"));
    }

    let response = self.routes.lock().unwrap().get(&key).cloned();
    Ok(response.unwrap_or_else(|| Response::new(404, "not found")))
  }
}

/// Remote endpoint recording every accepted payload.
pub struct FakeRemote {
  accepted: Mutex<Vec<NotePayload>>,
  calls: AtomicUsize,
  rejected: Mutex<HashSet<NoteId>>,
  hanging: Mutex<HashSet<NoteId>>,
  /// Submissions from this call index on fail at the transport level
  transport_fails_from: Mutex<Option<usize>>,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self {
      accepted: Mutex::new(Vec::new()),
      calls: AtomicUsize::new(0),
      rejected: Mutex::new(HashSet::new()),
      hanging: Mutex::new(HashSet::new()),
      transport_fails_from: Mutex::new(None),
    }
  }

  pub fn reject(&self, id: NoteId) {
    self.rejected.lock().unwrap().insert(id);
  }

  pub fn hang(&self, id: NoteId) {
    self.hanging.lock().unwrap().insert(id);
  }

  pub fn fail_transport_from(&self, call: usize) {
    *self.transport_fails_from.lock().unwrap() = Some(call);
  }

  /// Undo `fail_transport_from`.
  pub fn restore(&self) {
    *self.transport_fails_from.lock().unwrap() = None;
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn accepted_ids(&self) -> Vec<NoteId> {
    self.accepted.lock().unwrap().iter().map(|p| p.id).collect()
  }
}

impl RemoteEndpoint for FakeRemote {
  async fn submit(&self, payload: &NotePayload) -> Result<()> {
    let call = self.calls.fetch_add(1, Ordering::SeqCst);
    // Let concurrently running passes interleave
    tokio::task::yield_now().await;

    let hangs = self.hanging.lock().unwrap().contains(&payload.id);
    if hangs {
      std::future::pending::<()>().await;
    }

    let fails_from = *self.transport_fails_from.lock().unwrap();
    if fails_from.is_some_and(|from| call >= from) {
      return Err(Error::network("remote unreachable"));
    }

    if self.rejected.lock().unwrap().contains(&payload.id) {
      return Err(Error::UpstreamRejection { status: 500 });
    }

    self.accepted.lock().unwrap().push(payload.clone());
    Ok(())
  }
}
