use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Locally assigned note identifier. Never reused once allocated.
pub type NoteId = i64;

/// Two-valued reconciliation status of a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
  /// Locally modified, not yet acknowledged by the remote store
  Pending,
  /// Acknowledged by the remote store
  Synced,
}

impl SyncState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Synced => "synced",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "pending" => Some(Self::Pending),
      "synced" => Some(Self::Synced),
      _ => None,
    }
  }
}

impl std::fmt::Display for SyncState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A small text document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
  pub id: NoteId,
  pub title: String,
  pub content: String,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  /// Bumped on every local write; acknowledgments carry the revision they cover
  pub revision: i64,
  pub sync_state: SyncState,
}

impl Note {
  /// Copy of this note with new text, marked pending.
  pub fn edited(&self, title: Option<&str>, content: Option<&str>, now: DateTime<Utc>) -> Self {
    Self {
      id: self.id,
      title: title.map(String::from).unwrap_or_else(|| self.title.clone()),
      content: content
        .map(String::from)
        .unwrap_or_else(|| self.content.clone()),
      created_at: self.created_at,
      updated_at: now,
      revision: self.revision + 1,
      sync_state: SyncState::Pending,
    }
  }

  pub fn payload(&self) -> NotePayload {
    NotePayload {
      id: self.id,
      title: self.title.clone(),
      content: self.content.clone(),
      timestamp: self.updated_at.timestamp_millis(),
    }
  }
}

/// Wire body POSTed to the remote sync endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotePayload {
  pub id: NoteId,
  pub title: String,
  pub content: String,
  /// Last local modification, milliseconds since the Unix epoch
  pub timestamp: i64,
}
