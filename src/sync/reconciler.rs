//! The reconciliation pass.

use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::{Notification, SyncTrigger};
use crate::notes::{Note, NoteId, NotePayload, NoteStore, SyncState};

/// The remote store notes are reconciled against.
///
/// Only the success/failure outcome of a submission matters. Transport
/// failures are reported as [`Error::Network`], non-2xx answers as
/// [`Error::UpstreamRejection`].
pub trait RemoteEndpoint: Send + Sync + 'static {
  fn submit(&self, payload: &NotePayload) -> impl Future<Output = Result<()>> + Send;
}

/// Per-item tallies of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Acknowledged and now synced
  pub synced: usize,
  /// Acknowledged, but edited meanwhile; still pending for the newer revision
  pub superseded: usize,
  /// Acknowledged, but already synced or deleted by someone else
  pub settled: usize,
  /// Remote answered with a non-success status
  pub rejected: usize,
  /// Submission exceeded its deadline
  pub timed_out: usize,
  /// Being submitted by another pass already
  pub skipped: usize,
  /// Never got an answer because the pass was aborted
  pub unattempted: usize,
}

impl SyncReport {
  /// Items still pending after this pass.
  pub fn remaining(&self) -> usize {
    self.superseded + self.rejected + self.timed_out + self.unattempted
  }
}

/// User-facing outcome of a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
  /// No network call was attempted
  Offline,
  /// Nothing pending
  UpToDate,
  /// Every claimed item got an answer
  Completed(SyncReport),
  /// The pass was cut short; unacknowledged items stay pending
  Failed { report: SyncReport, reason: String },
}

impl std::fmt::Display for SyncOutcome {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Offline => write!(f, "cannot sync, offline"),
      Self::UpToDate => write!(f, "up to date"),
      Self::Completed(report) => write!(
        f,
        "synced {} note(s), {} still pending",
        report.synced,
        report.remaining()
      ),
      Self::Failed { report, reason } => write!(
        f,
        "sync failed: {} ({} synced, {} still pending)",
        reason,
        report.synced,
        report.remaining()
      ),
    }
  }
}

/// Drains pending notes against a remote endpoint.
///
/// Safe to run concurrently: a note claimed by one pass is skipped by any
/// other pass until the first finishes with it, and acknowledgments only
/// apply to the exact revision that was submitted.
pub struct Reconciler<R: RemoteEndpoint> {
  store: Arc<NoteStore>,
  remote: Arc<R>,
  online: watch::Receiver<bool>,
  in_flight: Mutex<HashSet<NoteId>>,
  submit_timeout: Duration,
  max_in_flight: usize,
  notifications: broadcast::Sender<Notification>,
}

impl<R: RemoteEndpoint> Reconciler<R> {
  pub fn new(
    store: Arc<NoteStore>,
    remote: Arc<R>,
    online: watch::Receiver<bool>,
    notifications: broadcast::Sender<Notification>,
  ) -> Self {
    Self {
      store,
      remote,
      online,
      in_flight: Mutex::new(HashSet::new()),
      submit_timeout: Duration::from_secs(15),
      max_in_flight: 4,
      notifications,
    }
  }

  pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
    self.submit_timeout = timeout;
    self
  }

  pub fn with_max_in_flight(mut self, max: usize) -> Self {
    self.max_in_flight = max.max(1);
    self
  }

  /// Run one reconciliation pass and announce its outcome.
  pub async fn run_pass(&self, trigger: SyncTrigger) -> SyncOutcome {
    debug!(?trigger, "reconciliation pass starting");
    let outcome = self.reconcile().await;

    match &outcome {
      SyncOutcome::Failed { reason, .. } => warn!(?trigger, %reason, "reconciliation pass failed"),
      _ => info!(?trigger, %outcome, "reconciliation pass finished"),
    }

    let changed = match &outcome {
      SyncOutcome::Completed(report) | SyncOutcome::Failed { report, .. } => report.synced > 0,
      _ => false,
    };
    // No subscribers is fine
    let _ = self
      .notifications
      .send(Notification::SyncFinished(outcome.clone()));
    if changed {
      let _ = self.notifications.send(Notification::NotesChanged);
    }

    outcome
  }

  async fn reconcile(&self) -> SyncOutcome {
    if !*self.online.borrow() {
      return SyncOutcome::Offline;
    }

    let pending = match self.store.pending() {
      Ok(pending) => pending,
      Err(e) => {
        return SyncOutcome::Failed {
          report: SyncReport::default(),
          reason: format!("could not load pending notes: {}", e),
        }
      }
    };
    if pending.is_empty() {
      return SyncOutcome::UpToDate;
    }

    let mut report = SyncReport::default();
    let claim = match self.claim(pending) {
      Ok(claim) => claim,
      Err(e) => {
        return SyncOutcome::Failed {
          report,
          reason: e.to_string(),
        }
      }
    };
    report.skipped = claim.skipped;
    let total = claim.notes.len();

    let mut answers = stream::iter(claim.notes.iter().cloned())
      .map(|note| {
        let remote = Arc::clone(&self.remote);
        let deadline = self.submit_timeout;
        async move {
          let payload = note.payload();
          let result = tokio::time::timeout(deadline, remote.submit(&payload))
            .await
            .unwrap_or_else(|_| Err(Error::Timeout { after: deadline }));
          (note, result)
        }
      })
      .buffer_unordered(self.max_in_flight);

    let mut answered = 0;
    let mut failure = None;
    while let Some((note, result)) = answers.next().await {
      answered += 1;
      match result {
        Ok(()) => match self.acknowledge(&note) {
          Ok(Ack::Synced) => {
            debug!(note_id = note.id, revision = note.revision, "note synced");
            report.synced += 1;
          }
          Ok(Ack::Superseded) => {
            debug!(note_id = note.id, "acknowledgment superseded by a newer edit");
            report.superseded += 1;
          }
          Ok(Ack::Settled) => {
            debug!(note_id = note.id, "note already synced or deleted");
            report.settled += 1;
          }
          Err(e) => {
            failure = Some(format!("could not save sync state: {}", e));
            report.unattempted += 1;
            break;
          }
        },
        Err(e) if e.is_transport() => {
          failure = Some(e.to_string());
          report.unattempted += 1;
          break;
        }
        Err(Error::Timeout { after }) => {
          warn!(note_id = note.id, ?after, "submission timed out");
          report.timed_out += 1;
        }
        Err(e) => {
          warn!(note_id = note.id, error = %e, "submission rejected");
          report.rejected += 1;
        }
      }
    }
    // Dropping the stream cancels submissions still in flight
    drop(answers);
    report.unattempted += total - answered;

    match failure {
      Some(reason) => SyncOutcome::Failed { report, reason },
      None => SyncOutcome::Completed(report),
    }
  }

  /// Apply a remote acknowledgment for the submitted snapshot of `note`.
  fn acknowledge(&self, note: &Note) -> Result<Ack> {
    if self.store.mark_synced(note.id, note.revision)? {
      return Ok(Ack::Synced);
    }
    let ack = match self.store.get(note.id)? {
      Some(current) if current.sync_state == SyncState::Pending => Ack::Superseded,
      _ => Ack::Settled,
    };
    Ok(ack)
  }

  /// Reserve pending notes for this pass. Notes another pass holds are skipped.
  fn claim(&self, pending: Vec<Note>) -> Result<Claim<'_>> {
    let mut in_flight = self.in_flight.lock()?;
    let mut notes = Vec::with_capacity(pending.len());
    let mut skipped = 0;

    for note in pending {
      if in_flight.insert(note.id) {
        notes.push(note);
      } else {
        skipped += 1;
      }
    }

    Ok(Claim {
      in_flight: &self.in_flight,
      notes,
      skipped,
    })
  }
}

/// What an acknowledgment did to the stored note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ack {
  Synced,
  /// A newer edit is waiting for its own submission
  Superseded,
  /// Nothing left to do
  Settled,
}

/// Notes reserved by one pass; released when the pass ends.
struct Claim<'a> {
  in_flight: &'a Mutex<HashSet<NoteId>>,
  notes: Vec<Note>,
  skipped: usize,
}

impl Drop for Claim<'_> {
  fn drop(&mut self) {
    if let Ok(mut in_flight) = self.in_flight.lock() {
      for note in &self.notes {
        in_flight.remove(&note.id);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sync::Connectivity;
  use crate::testing::FakeRemote;

  struct Harness {
    store: Arc<NoteStore>,
    remote: Arc<FakeRemote>,
    connectivity: Connectivity,
    reconciler: Reconciler<FakeRemote>,
    notifications: broadcast::Receiver<Notification>,
  }

  fn harness() -> Harness {
    harness_with(1)
  }

  fn harness_with(max_in_flight: usize) -> Harness {
    let store = Arc::new(NoteStore::open_in_memory().unwrap());
    let remote = Arc::new(FakeRemote::new());
    let connectivity = Connectivity::new(true);
    let (tx, rx) = broadcast::channel(16);
    let reconciler = Reconciler::new(
      Arc::clone(&store),
      Arc::clone(&remote),
      connectivity.subscribe(),
      tx,
    )
    .with_max_in_flight(max_in_flight)
    .with_submit_timeout(Duration::from_millis(100));
    Harness {
      store,
      remote,
      connectivity,
      reconciler,
      notifications: rx,
    }
  }

  fn state(store: &NoteStore, id: NoteId) -> SyncState {
    store.get(id).unwrap().unwrap().sync_state
  }

  #[tokio::test]
  async fn test_offline_makes_no_calls() {
    let h = harness();
    let note = h.store.create("a", "b").unwrap();
    h.connectivity.set(false);

    let outcome = h.reconciler.run_pass(SyncTrigger::Manual).await;

    assert_eq!(outcome, SyncOutcome::Offline);
    assert_eq!(h.remote.calls(), 0);
    assert_eq!(state(&h.store, note.id), SyncState::Pending);
  }

  #[tokio::test]
  async fn test_empty_queue_is_up_to_date() {
    let h = harness();
    let outcome = h.reconciler.run_pass(SyncTrigger::Timer).await;
    assert_eq!(outcome, SyncOutcome::UpToDate);
    assert_eq!(h.remote.calls(), 0);
  }

  #[tokio::test]
  async fn test_pass_syncs_pending_notes() {
    let mut h = harness();
    let a = h.store.create("a", "1").unwrap();
    let b = h.store.create("b", "2").unwrap();

    let outcome = h.reconciler.run_pass(SyncTrigger::Manual).await;

    match outcome {
      SyncOutcome::Completed(report) => {
        assert_eq!(report.synced, 2);
        assert_eq!(report.remaining(), 0);
      }
      other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(state(&h.store, a.id), SyncState::Synced);
    assert_eq!(state(&h.store, b.id), SyncState::Synced);

    assert!(matches!(
      h.notifications.recv().await.unwrap(),
      Notification::SyncFinished(SyncOutcome::Completed(_))
    ));
    assert!(matches!(
      h.notifications.recv().await.unwrap(),
      Notification::NotesChanged
    ));
  }

  #[tokio::test]
  async fn test_second_pass_is_a_no_op() {
    let h = harness();
    h.store.create("a", "1").unwrap();
    h.store.create("b", "2").unwrap();

    h.reconciler.run_pass(SyncTrigger::Manual).await;
    let after_first = h.store.all().unwrap();
    let calls = h.remote.calls();

    let outcome = h.reconciler.run_pass(SyncTrigger::Timer).await;
    assert_eq!(outcome, SyncOutcome::UpToDate);
    assert_eq!(h.store.all().unwrap(), after_first);
    assert_eq!(h.remote.calls(), calls);
  }

  #[tokio::test]
  async fn test_edit_then_sync_round_trip() {
    let h = harness();
    let note = h.store.create("a", "1").unwrap();
    h.reconciler.run_pass(SyncTrigger::Manual).await;
    assert_eq!(state(&h.store, note.id), SyncState::Synced);

    h.store.update(note.id, Some("a2"), None).unwrap();
    assert_eq!(state(&h.store, note.id), SyncState::Pending);

    h.reconciler.run_pass(SyncTrigger::Manual).await;
    assert_eq!(state(&h.store, note.id), SyncState::Synced);
    assert_eq!(h.remote.accepted_ids(), vec![note.id, note.id]);
  }

  #[tokio::test]
  async fn test_transport_failure_mid_batch_leaves_rest_pending() {
    let h = harness();
    let ids: Vec<NoteId> = (0..4)
      .map(|i| h.store.create(&format!("n{i}"), "").unwrap().id)
      .collect();
    h.remote.fail_transport_from(2);

    let outcome = h.reconciler.run_pass(SyncTrigger::Manual).await;

    match outcome {
      SyncOutcome::Failed { report, .. } => {
        assert_eq!(report.synced, 2);
        assert_eq!(report.unattempted, 2);
      }
      other => panic!("unexpected outcome: {other:?}"),
    }

    // Only acknowledged notes are synced
    let accepted = h.remote.accepted_ids();
    for id in ids {
      let expected = if accepted.contains(&id) {
        SyncState::Synced
      } else {
        SyncState::Pending
      };
      assert_eq!(state(&h.store, id), expected);
    }
    assert_eq!(h.store.pending().unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_rejection_does_not_block_other_items() {
    let h = harness();
    let a = h.store.create("a", "").unwrap();
    let b = h.store.create("b", "").unwrap();
    h.remote.reject(a.id);

    let outcome = h.reconciler.run_pass(SyncTrigger::Manual).await;

    match outcome {
      SyncOutcome::Completed(report) => {
        assert_eq!(report.synced, 1);
        assert_eq!(report.rejected, 1);
      }
      other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(state(&h.store, a.id), SyncState::Pending);
    assert_eq!(state(&h.store, b.id), SyncState::Synced);
  }

  #[tokio::test]
  async fn test_stuck_submission_times_out() {
    let h = harness();
    let stuck = h.store.create("stuck", "").unwrap();
    let fine = h.store.create("fine", "").unwrap();
    h.remote.hang(stuck.id);

    let outcome = h.reconciler.run_pass(SyncTrigger::Manual).await;

    match outcome {
      SyncOutcome::Completed(report) => {
        assert_eq!(report.timed_out, 1);
        assert_eq!(report.synced, 1);
      }
      other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(state(&h.store, stuck.id), SyncState::Pending);
    assert_eq!(state(&h.store, fine.id), SyncState::Synced);
  }

  #[tokio::test]
  async fn test_overlapping_passes_submit_each_note_once() {
    let h = harness();
    for i in 0..3 {
      h.store.create(&format!("n{i}"), "").unwrap();
    }

    let (first, second) = tokio::join!(
      h.reconciler.run_pass(SyncTrigger::Timer),
      h.reconciler.run_pass(SyncTrigger::Manual),
    );

    assert_eq!(h.remote.calls(), 3);
    assert!(h.store.pending().unwrap().is_empty());

    let synced: usize = [first, second]
      .iter()
      .map(|outcome| match outcome {
        SyncOutcome::Completed(report) => report.synced,
        _ => 0,
      })
      .sum();
    assert_eq!(synced, 3);
  }

  #[tokio::test]
  async fn test_stale_acknowledgment_is_ignored() {
    let h = harness();
    let note = h.store.create("a", "1").unwrap();

    // Ack for the old revision arrives after a newer edit
    h.store.update(note.id, None, Some("2")).unwrap();
    assert!(!h.store.mark_synced(note.id, note.revision).unwrap());

    let outcome = h.reconciler.run_pass(SyncTrigger::Manual).await;
    assert!(matches!(outcome, SyncOutcome::Completed(_)));
    assert_eq!(state(&h.store, note.id), SyncState::Synced);
  }

  #[tokio::test]
  async fn test_concurrent_transport_failure_leaves_unacknowledged_pending() {
    let h = harness_with(4);
    let ids: Vec<NoteId> = (0..4)
      .map(|i| h.store.create(&format!("n{i}"), "").unwrap().id)
      .collect();
    h.remote.fail_transport_from(2);

    let report = match h.reconciler.run_pass(SyncTrigger::Manual).await {
      SyncOutcome::Failed { report, .. } => report,
      other => panic!("unexpected outcome: {other:?}"),
    };
    assert_eq!(report.synced + report.unattempted, ids.len());
    assert!(report.unattempted >= 2);

    // Answers dropped with the aborted stream never count as acknowledgments
    let accepted = h.remote.accepted_ids();
    let synced: Vec<NoteId> = ids
      .iter()
      .copied()
      .filter(|id| state(&h.store, *id) == SyncState::Synced)
      .collect();
    assert_eq!(synced.len(), report.synced);
    assert!(synced.iter().all(|id| accepted.contains(id)));

    // Claims were released, so the next pass picks up the rest
    h.remote.restore();
    let outcome = h.reconciler.run_pass(SyncTrigger::ConnectivityRestored).await;
    assert!(matches!(outcome, SyncOutcome::Completed(_)));
    assert!(h.store.pending().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_acknowledgment_classification() {
    let h = harness();

    let fresh = h.store.create("fresh", "").unwrap();
    assert_eq!(h.reconciler.acknowledge(&fresh).unwrap(), Ack::Synced);
    // Same acknowledgment delivered twice
    assert_eq!(h.reconciler.acknowledge(&fresh).unwrap(), Ack::Settled);

    let edited = h.store.create("edited", "").unwrap();
    h.store.update(edited.id, Some("edited again"), None).unwrap();
    assert_eq!(h.reconciler.acknowledge(&edited).unwrap(), Ack::Superseded);

    let deleted = h.store.create("deleted", "").unwrap();
    h.store.delete(deleted.id).unwrap();
    assert_eq!(h.reconciler.acknowledge(&deleted).unwrap(), Ack::Settled);

    let report = SyncReport {
      superseded: 1,
      settled: 2,
      ..SyncReport::default()
    };
    assert_eq!(report.remaining(), 1);
  }
}
