//! SQLite-backed note store.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use super::types::{Note, NoteId, SyncState};
use crate::db::{self, Migration};
use crate::error::{Error, Result};

const MIGRATIONS: &[Migration] = &[Migration {
  version: 1,
  sql: r#"
CREATE TABLE IF NOT EXISTS notes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    revision INTEGER NOT NULL DEFAULT 1,
    sync_state TEXT NOT NULL DEFAULT 'pending'
);

CREATE INDEX IF NOT EXISTS idx_notes_sync_state ON notes(sync_state);
"#,
}];

const NOTE_COLUMNS: &str = "id, title, content, created_at, updated_at, revision, sync_state";

/// Durable note storage. Every method runs in its own transaction.
pub struct NoteStore {
  conn: Mutex<Connection>,
}

impl NoteStore {
  /// Open (or create) the store at `path`, upgrading the schema if needed.
  pub fn open(path: &Path) -> Result<Self> {
    let conn = db::open(path, MIGRATIONS)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = db::open_in_memory(MIGRATIONS)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Create a note. The id comes from the store's own counter.
  pub fn create(&self, title: &str, content: &str) -> Result<Note> {
    let conn = self.conn.lock()?;
    let now = Utc::now();

    conn.execute(
      "INSERT INTO notes (title, content, created_at, updated_at, revision, sync_state)
       VALUES (?, ?, ?, ?, 1, ?)",
      params![
        title,
        content,
        now.timestamp_millis(),
        now.timestamp_millis(),
        SyncState::Pending.as_str()
      ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(note_id = id, "note created");

    Ok(Note {
      id,
      title: title.to_string(),
      content: content.to_string(),
      created_at: from_millis(now.timestamp_millis()),
      updated_at: from_millis(now.timestamp_millis()),
      revision: 1,
      sync_state: SyncState::Pending,
    })
  }

  /// Edit title and/or content. The stored note becomes pending.
  pub fn update(&self, id: NoteId, title: Option<&str>, content: Option<&str>) -> Result<Note> {
    let mut conn = self.conn.lock()?;
    let tx = conn.transaction()?;

    let current = get_in(&tx, id)?.ok_or(Error::NotFound { id })?;
    let next = current.edited(title, content, from_millis(Utc::now().timestamp_millis()));
    put_in(&tx, &next)?;

    tx.commit()?;
    debug!(note_id = id, revision = next.revision, "note updated");
    Ok(next)
  }

  /// Store a whole record value, replacing whatever was stored under its id.
  #[allow(dead_code)]
  pub fn put(&self, note: &Note) -> Result<()> {
    let conn = self.conn.lock()?;
    put_in(&conn, note)
  }

  pub fn get(&self, id: NoteId) -> Result<Option<Note>> {
    let conn = self.conn.lock()?;
    get_in(&conn, id)
  }

  /// All notes, most recently edited first.
  pub fn all(&self) -> Result<Vec<Note>> {
    let conn = self.conn.lock()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT {} FROM notes ORDER BY updated_at DESC, id DESC",
      NOTE_COLUMNS
    ))?;
    let notes = stmt
      .query_map([], note_from_row)?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(notes)
  }

  /// Notes awaiting reconciliation, looked up through the sync-state index.
  pub fn pending(&self) -> Result<Vec<Note>> {
    let conn = self.conn.lock()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT {} FROM notes WHERE sync_state = ? ORDER BY id",
      NOTE_COLUMNS
    ))?;
    let notes = stmt
      .query_map(params![SyncState::Pending.as_str()], note_from_row)?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(notes)
  }

  /// Apply a remote acknowledgment for `revision` of note `id`.
  ///
  /// Returns false when nothing changed: the note is already synced, was
  /// deleted, or was edited after the acknowledged revision was submitted.
  pub fn mark_synced(&self, id: NoteId, revision: i64) -> Result<bool> {
    let conn = self.conn.lock()?;
    let changed = conn.execute(
      "UPDATE notes SET sync_state = ?
       WHERE id = ? AND revision = ? AND sync_state = ?",
      params![
        SyncState::Synced.as_str(),
        id,
        revision,
        SyncState::Pending.as_str()
      ],
    )?;
    Ok(changed > 0)
  }

  /// Delete a note locally. Nothing is propagated to the remote store.
  pub fn delete(&self, id: NoteId) -> Result<bool> {
    let conn = self.conn.lock()?;
    let changed = conn.execute("DELETE FROM notes WHERE id = ?", params![id])?;
    Ok(changed > 0)
  }
}

fn get_in(conn: &Connection, id: NoteId) -> Result<Option<Note>> {
  let note = conn
    .query_row(
      &format!("SELECT {} FROM notes WHERE id = ?", NOTE_COLUMNS),
      params![id],
      note_from_row,
    )
    .optional()?;
  Ok(note)
}

fn put_in(conn: &Connection, note: &Note) -> Result<()> {
  conn.execute(
    "INSERT OR REPLACE INTO notes (id, title, content, created_at, updated_at, revision, sync_state)
     VALUES (?, ?, ?, ?, ?, ?, ?)",
    params![
      note.id,
      note.title,
      note.content,
      note.created_at.timestamp_millis(),
      note.updated_at.timestamp_millis(),
      note.revision,
      note.sync_state.as_str()
    ],
  )?;
  Ok(())
}

fn note_from_row(row: &Row<'_>) -> rusqlite::Result<Note> {
  let state: String = row.get(6)?;
  let sync_state = SyncState::parse(&state).ok_or_else(|| {
    rusqlite::Error::FromSqlConversionFailure(
      6,
      rusqlite::types::Type::Text,
      format!("unknown sync state '{}'", state).into(),
    )
  })?;

  Ok(Note {
    id: row.get(0)?,
    title: row.get(1)?,
    content: row.get(2)?,
    created_at: from_millis(row.get(3)?),
    updated_at: from_millis(row.get(4)?),
    revision: row.get(5)?,
    sync_state,
  })
}

fn from_millis(ms: i64) -> DateTime<Utc> {
  DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
