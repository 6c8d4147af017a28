use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cache::{
  CacheLayer, CacheResult, Generation, Lifecycle, Request, RouteRules, Router, SqliteStorage,
};
use crate::config::Config;
use crate::event::{Event, EventHandler, Notification, SyncTrigger, WorkerMessage};
use crate::net::{HttpFetcher, HttpRemote};
use crate::notes::{Note, NoteId, NoteStore};
use crate::sync::{Connectivity, Reconciler, SyncOutcome};

/// Wires the note store, request cache and reconciler together.
pub struct App {
  config: Config,
  notes: Arc<NoteStore>,
  remote: Arc<HttpRemote>,
  connectivity: Connectivity,
  lifecycle: Lifecycle<SqliteStorage, HttpFetcher>,
  router: Router<SqliteStorage, HttpFetcher>,
  reconciler: Reconciler<HttpRemote>,
  notifications: broadcast::Sender<Notification>,
  /// Pin the connectivity flag to offline instead of probing
  force_offline: bool,
}

impl App {
  pub fn new(config: Config, force_offline: bool) -> Result<Self> {
    let data_dir = config.data_dir()?;
    let notes = Arc::new(NoteStore::open(&data_dir.join("notes.db"))?);
    let storage = Arc::new(SqliteStorage::open(&data_dir.join("cache.db"))?);

    let timeout = std::time::Duration::from_secs(config.remote.timeout_secs.max(1));
    let fetcher = Arc::new(HttpFetcher::new(timeout)?);
    let remote = Arc::new(HttpRemote::new(
      &config.remote.url,
      &config.remote.sync_path,
      timeout,
      Config::get_api_token(),
    )?);

    let generation = Generation::new(&config.cache.prefix, &config.cache.version);
    let lifecycle = Lifecycle::new(
      Arc::clone(&storage),
      Arc::clone(&fetcher),
      config.remote.url.clone(),
      config.cache.manifest.clone(),
      generation,
    );

    let rules = RouteRules::new(
      &config.remote.url,
      &config.router.api_prefix,
      &config.router.static_extensions,
    );
    let router = Router::new(
      rules,
      CacheLayer::new(Arc::clone(&storage), Arc::clone(&fetcher)),
      lifecycle.subscribe(),
    );

    // Assume online until the first probe says otherwise
    let connectivity = Connectivity::new(!force_offline);
    let (notifications, _) = broadcast::channel(64);
    let reconciler = Reconciler::new(
      Arc::clone(&notes),
      Arc::clone(&remote),
      connectivity.subscribe(),
      notifications.clone(),
    )
    .with_submit_timeout(config.sync.submit_timeout())
    .with_max_in_flight(config.sync.max_in_flight);

    Ok(Self {
      config,
      notes,
      remote,
      connectivity,
      lifecycle,
      router,
      reconciler,
      notifications,
      force_offline,
    })
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
    self.notifications.subscribe()
  }

  fn notify(&self, notification: Notification) {
    // No subscribers is fine
    let _ = self.notifications.send(notification);
  }

  pub fn create_note(&self, title: &str, content: &str) -> Result<Note> {
    let note = self
      .notes
      .create(title, content)
      .map_err(|e| eyre!("Could not save note: {}", e))?;
    self.notify(Notification::NotesChanged);
    Ok(note)
  }

  pub fn edit_note(&self, id: NoteId, title: Option<&str>, content: Option<&str>) -> Result<Note> {
    let note = self
      .notes
      .update(id, title, content)
      .map_err(|e| eyre!("Could not save note: {}", e))?;
    self.notify(Notification::NotesChanged);
    Ok(note)
  }

  /// Local-only delete: the remote store is not told.
  pub fn delete_note(&self, id: NoteId) -> Result<bool> {
    let removed = self
      .notes
      .delete(id)
      .map_err(|e| eyre!("Could not delete note: {}", e))?;
    if removed {
      self.notify(Notification::NotesChanged);
    }
    Ok(removed)
  }

  pub fn note(&self, id: NoteId) -> Result<Option<Note>> {
    self
      .notes
      .get(id)
      .map_err(|e| eyre!("Could not load note: {}", e))
  }

  pub fn all_notes(&self) -> Result<Vec<Note>> {
    self
      .notes
      .all()
      .map_err(|e| eyre!("Could not load notes: {}", e))
  }

  /// Probe the remote origin and publish the result as the online flag.
  pub async fn refresh_connectivity(&self) -> bool {
    let online = !self.force_offline && self.remote.probe().await;
    self.connectivity.set(online);
    online
  }

  /// Install (if needed) and activate the configured cache generation.
  ///
  /// Failures are reported as a warning; the app keeps working from the
  /// network or the previous generation.
  pub async fn start_cache(&self) -> Option<Generation> {
    match self.lifecycle.ensure_current().await {
      Ok(generation) => {
        info!(version = %generation.version, phase = ?self.lifecycle.phase_of(&generation), "cache ready");
        Some(generation)
      }
      Err(e) => {
        warn!(error = %e, "cache generation not activated");
        self.notify(Notification::Warning(format!("offline cache not updated: {}", e)));
        self.lifecycle.current()
      }
    }
  }

  /// Explicit install + activate, surfacing install failures.
  pub async fn install(&self) -> Result<(Generation, Vec<String>)> {
    self
      .lifecycle
      .install()
      .await
      .map_err(|e| eyre!("Install of {} failed: {}", self.config.cache.version, e))?;
    let removed = self.lifecycle.activate()?;
    let generation = self
      .lifecycle
      .current()
      .ok_or_else(|| eyre!("Generation did not become active"))?;
    Ok((generation, removed))
  }

  /// Route one request through the cache.
  pub async fn fetch(&self, request: &Request) -> Result<CacheResult> {
    if self.lifecycle.current().is_none() {
      self.start_cache().await;
    }
    Ok(self.router.handle(request).await?)
  }

  /// Manual sync action.
  pub async fn sync_now(&self) -> SyncOutcome {
    self.refresh_connectivity().await;
    self.reconciler.run_pass(SyncTrigger::Manual).await
  }

  /// Long-running worker: timers, connectivity edges and worker messages
  /// all funnel into the same reconciliation pass.
  pub async fn run(&self) -> Result<()> {
    let mut notifications = self.subscribe();

    if let Some(generation) = self.start_cache().await {
      println!("cache generation {} active", generation.version);
    }
    self.refresh_connectivity().await;
    println!(
      "{}",
      if self.connectivity.is_online() {
        "online"
      } else {
        "offline"
      }
    );

    let mut events = EventHandler::new(
      self.config.sync.interval(),
      self.config.sync.probe_interval(),
      self.connectivity.subscribe(),
    );
    events.listen_stdin();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
      tokio::select! {
        _ = &mut shutdown => {
          info!("shutting down");
          break;
        }
        Ok(notification) = notifications.recv() => {
          if let Some(line) = describe(&notification) {
            println!("{}", line);
          }
        }
        event = events.next() => match event {
          Some(event) => self.handle_event(event).await,
          None => break,
        },
      }
    }

    Ok(())
  }

  async fn handle_event(&self, event: Event) {
    match event {
      Event::Tick => {
        self.reconciler.run_pass(SyncTrigger::Timer).await;
      }
      Event::Probe => {
        self.refresh_connectivity().await;
      }
      Event::Connectivity(true) => {
        println!("online");
        self.reconciler.run_pass(SyncTrigger::ConnectivityRestored).await;
      }
      Event::Connectivity(false) => {
        println!("offline, changes will sync when the connection returns");
      }
      Event::Message(WorkerMessage::SyncTriggered) => {
        self.reconciler.run_pass(SyncTrigger::Message).await;
      }
    }
  }
}

/// Text for a notification, or `None` when it is not worth showing.
fn describe(notification: &Notification) -> Option<String> {
  match notification {
    Notification::NotesChanged => None,
    Notification::SyncFinished(SyncOutcome::UpToDate | SyncOutcome::Offline) => None,
    Notification::SyncFinished(outcome) => Some(outcome.to_string()),
    Notification::Warning(message) => Some(format!("warning: {}", message)),
  }
}
