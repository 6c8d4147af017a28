use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::sync::SyncOutcome;

/// Messages accepted on the cross-process channel, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
  /// Request a reconciliation pass
  SyncTriggered,
}

impl WorkerMessage {
  /// Parse one line; anything unrecognized is ignored.
  pub fn parse(line: &str) -> Option<Self> {
    let line = line.trim();
    if line.is_empty() {
      return None;
    }
    match serde_json::from_str(line) {
      Ok(message) => Some(message),
      Err(e) => {
        debug!(error = %e, "ignoring unrecognized worker message");
        None
      }
    }
  }
}

/// What asked for a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
  Timer,
  ConnectivityRestored,
  Manual,
  Message,
}

/// Notifications for whatever renders notes and sync indicators.
#[derive(Debug, Clone)]
pub enum Notification {
  /// Note list or sync indicators need a refresh
  NotesChanged,
  /// A reconciliation pass ended
  SyncFinished(SyncOutcome),
  /// Transient, non-blocking problem worth showing
  Warning(String),
}

/// Background worker events
#[derive(Debug)]
pub enum Event {
  /// Periodic sync timer
  Tick,
  /// Time to check connectivity again
  Probe,
  /// Edge of the online flag
  Connectivity(bool),
  /// Message from another process
  Message(WorkerMessage),
}

/// Event handler that produces events from timers, connectivity edges and stdin
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
  tx: mpsc::UnboundedSender<Event>,
}

impl EventHandler {
  pub fn new(
    sync_interval: Duration,
    probe_interval: Duration,
    mut online: watch::Receiver<bool>,
  ) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    spawn_ticker(tx.clone(), sync_interval, || Event::Tick);
    spawn_ticker(tx.clone(), probe_interval, || Event::Probe);

    // Forward connectivity edges
    let edges = tx.clone();
    tokio::spawn(async move {
      while online.changed().await.is_ok() {
        let state = *online.borrow_and_update();
        if edges.send(Event::Connectivity(state)).is_err() {
          break;
        }
      }
    });

    Self { rx, tx }
  }

  /// Read worker messages from stdin until it closes.
  pub fn listen_stdin(&self) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      let mut lines = BufReader::new(tokio::io::stdin()).lines();
      while let Ok(Some(line)) = lines.next_line().await {
        if let Some(message) = WorkerMessage::parse(&line) {
          if tx.send(Event::Message(message)).is_err() {
            break;
          }
        }
      }
      debug!("message channel closed");
    });
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

fn spawn_ticker(tx: mpsc::UnboundedSender<Event>, period: Duration, make: fn() -> Event) {
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
      interval.tick().await;
      if tx.send(make()).is_err() {
        break;
      }
    }
  });
}
