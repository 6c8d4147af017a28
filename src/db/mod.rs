//! SQLite connection helpers with versioned, idempotent migrations.

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// A numbered schema step. Statements must be safe to re-run.
pub struct Migration {
  pub version: u32,
  pub sql: &'static str,
}

/// Open or create the database at `path` and bring it up to the latest version.
pub fn open(path: &Path, migrations: &[Migration]) -> Result<Connection> {
  // Ensure parent directory exists
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)
      .map_err(|e| Error::storage(format!("failed to create database directory: {}", e)))?;
  }

  let mut conn = Connection::open(path).map_err(|e| {
    Error::storage(format!(
      "failed to open database at {}: {}",
      path.display(),
      e
    ))
  })?;

  upgrade(&mut conn, migrations)?;
  Ok(conn)
}

/// In-memory database, used by tests.
#[allow(dead_code)]
pub fn open_in_memory(migrations: &[Migration]) -> Result<Connection> {
  let mut conn = Connection::open_in_memory()?;
  upgrade(&mut conn, migrations)?;
  Ok(conn)
}

/// Default location for database files.
pub fn default_data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| Error::storage("could not determine data directory"))?;

  Ok(data_dir.join("notesync"))
}

/// Apply every migration newer than the stored `user_version`.
///
/// Each step and its version bump commit together, so a crash leaves the
/// database at the previous version with none of the step applied.
fn upgrade(conn: &mut Connection, migrations: &[Migration]) -> Result<()> {
  let current: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

  for migration in migrations.iter().filter(|m| m.version > current) {
    debug!(version = migration.version, "applying migration");
    let tx = conn.transaction()?;
    tx.execute_batch(migration.sql)
      .map_err(|e| Error::storage(format!("migration {} failed: {}", migration.version, e)))?;
    tx.pragma_update(None, "user_version", migration.version)?;
    tx.commit()?;
  }

  let latest = migrations.iter().map(|m| m.version).max().unwrap_or(0);
  if latest > current {
    info!(from = current, to = latest, "database upgraded");
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  const MIGRATIONS: &[Migration] = &[
    Migration {
      version: 1,
      sql: "CREATE TABLE IF NOT EXISTS a (id INTEGER PRIMARY KEY);",
    },
    Migration {
      version: 2,
      sql: "CREATE INDEX IF NOT EXISTS idx_a ON a(id);",
    },
  ];

  fn user_version(conn: &Connection) -> u32 {
    conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .unwrap()
  }

  #[test]
  fn test_open_applies_all_migrations() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("test.db");

    let conn = open(&path, MIGRATIONS).unwrap();
    assert_eq!(user_version(&conn), 2);
    assert!(path.exists());
  }

  #[test]
  fn test_reopen_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");

    drop(open(&path, &MIGRATIONS[..1]).unwrap());
    let conn = open(&path, MIGRATIONS).unwrap();
    assert_eq!(user_version(&conn), 2);

    drop(conn);
    let conn = open(&path, MIGRATIONS).unwrap();
    assert_eq!(user_version(&conn), 2);
  }

  #[test]
  fn test_failed_migration_rolls_back_whole_step() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");
    let broken = [
      Migration {
        version: 1,
        sql: "CREATE TABLE IF NOT EXISTS a (id INTEGER PRIMARY KEY);",
      },
      Migration {
        version: 2,
        sql: "CREATE TABLE b (id INTEGER PRIMARY KEY); ALTER TABLE missing ADD COLUMN x INTEGER;",
      },
    ];

    let err = open(&path, &broken).unwrap_err();
    assert!(matches!(err, Error::Storage { .. }));

    // Version 1 committed, nothing of version 2 survived
    let conn = Connection::open(&path).unwrap();
    assert_eq!(user_version(&conn), 1);
    let tables: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'b'",
        [],
        |row| row.get(0),
      )
      .unwrap();
    assert_eq!(tables, 0);
    drop(conn);

    let conn = open(&path, MIGRATIONS).unwrap();
    assert_eq!(user_version(&conn), 2);
  }
}
