//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::traits::Response;
use crate::db::{self, Migration};
use crate::error::{Error, Result};

/// A cached response keyed by normalized request identity.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: String,
  pub response: Response,
  /// When the entry was written
  pub stored_at: DateTime<Utc>,
  /// SHA-256 of the body
  pub digest: String,
}

/// A named cache collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
  pub name: String,
  pub created_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Only successful responses may be written; implementations reject anything
/// else so a failed upstream never overwrites a good entry.
pub trait CacheStorage: Send + Sync + 'static {
  /// All collections, oldest first.
  fn collections(&self) -> Result<Vec<CollectionInfo>>;

  /// Look up a request key in one collection.
  fn match_entry(&self, collection: &str, key: &str) -> Result<Option<CacheEntry>>;

  /// First hit for `key`, searching `collections` in order.
  fn match_any(&self, collections: &[String], key: &str) -> Result<Option<CacheEntry>> {
    for collection in collections {
      if let Some(entry) = self.match_entry(collection, key)? {
        return Ok(Some(entry));
      }
    }
    Ok(None)
  }

  /// Create an empty collection. No-op if it already exists.
  fn create_collection(&self, collection: &str) -> Result<()>;

  /// Store a single entry in an existing collection.
  ///
  /// Writing into a missing collection is an error, so a late write can never
  /// bring back a collection that activation deleted.
  fn put(&self, collection: &str, key: &str, response: &Response) -> Result<()>;

  /// Store several entries atomically, creating the collection if needed:
  /// either all are written or none.
  fn put_all(&self, collection: &str, entries: &[(String, Response)]) -> Result<()>;

  /// Remove a collection and every entry in it.
  fn delete_collection(&self, collection: &str) -> Result<bool>;
}

const MIGRATIONS: &[Migration] = &[Migration {
  version: 1,
  sql: r#"
CREATE TABLE IF NOT EXISTS cache_collections (
    name TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_entries (
    collection TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    digest TEXT NOT NULL,
    stored_at INTEGER NOT NULL,
    PRIMARY KEY (collection, request_key)
);
"#,
}];

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
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
}

impl CacheStorage for SqliteStorage {
  fn collections(&self) -> Result<Vec<CollectionInfo>> {
    let conn = self.conn.lock()?;
    let mut stmt =
      conn.prepare("SELECT name, created_at FROM cache_collections ORDER BY created_at, name")?;
    let infos = stmt
      .query_map([], |row| {
        Ok(CollectionInfo {
          name: row.get(0)?,
          created_at: from_millis(row.get(1)?),
        })
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(infos)
  }

  fn match_entry(&self, collection: &str, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.conn.lock()?;
    let row: Option<(u16, String, Vec<u8>, String, i64)> = conn
      .query_row(
        "SELECT status, headers, body, digest, stored_at FROM cache_entries
         WHERE collection = ? AND request_key = ?",
        params![collection, key],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()?;

    match row {
      Some((status, headers, body, digest, stored_at)) => Ok(Some(CacheEntry {
        key: key.to_string(),
        response: Response {
          status,
          headers: serde_json::from_str(&headers)?,
          body,
        },
        stored_at: from_millis(stored_at),
        digest,
      })),
      None => Ok(None),
    }
  }

  fn create_collection(&self, collection: &str) -> Result<()> {
    let conn = self.conn.lock()?;
    create_collection_in(&conn, collection, Utc::now())
  }

  fn put(&self, collection: &str, key: &str, response: &Response) -> Result<()> {
    let conn = self.conn.lock()?;
    let exists = conn
      .query_row(
        "SELECT 1 FROM cache_collections WHERE name = ?",
        params![collection],
        |_| Ok(()),
      )
      .optional()?
      .is_some();
    if !exists {
      return Err(Error::storage(format!(
        "cache collection {} does not exist",
        collection
      )));
    }
    write_entry(&conn, collection, key, response, Utc::now())
  }

  fn put_all(&self, collection: &str, entries: &[(String, Response)]) -> Result<()> {
    let mut conn = self.conn.lock()?;
    let tx = conn.transaction()?;
    let now = Utc::now();

    create_collection_in(&tx, collection, now)?;
    for (key, response) in entries {
      write_entry(&tx, collection, key, response, now)?;
    }

    // Dropping the transaction without commit rolls everything back
    tx.commit()?;
    Ok(())
  }

  fn delete_collection(&self, collection: &str) -> Result<bool> {
    let mut conn = self.conn.lock()?;
    let tx = conn.transaction()?;
    tx.execute(
      "DELETE FROM cache_entries WHERE collection = ?",
      params![collection],
    )?;
    let removed = tx.execute(
      "DELETE FROM cache_collections WHERE name = ?",
      params![collection],
    )?;
    tx.commit()?;
    Ok(removed > 0)
  }
}

fn create_collection_in(conn: &Connection, collection: &str, now: DateTime<Utc>) -> Result<()> {
  conn.execute(
    "INSERT OR IGNORE INTO cache_collections (name, created_at) VALUES (?, ?)",
    params![collection, now.timestamp_millis()],
  )?;
  Ok(())
}

fn write_entry(
  conn: &Connection,
  collection: &str,
  key: &str,
  response: &Response,
  now: DateTime<Utc>,
) -> Result<()> {
  if !response.is_success() {
    return Err(Error::InvalidRequest {
      message: format!("refusing to cache {} response for {}", response.status, key),
    });
  }

  conn.execute(
    "INSERT OR REPLACE INTO cache_entries (collection, request_key, status, headers, body, digest, stored_at)
     VALUES (?, ?, ?, ?, ?, ?, ?)",
    params![
      collection,
      key,
      response.status,
      serde_json::to_string(&response.headers)?,
      response.body,
      response.digest(),
      now.timestamp_millis()
    ],
  )?;
  Ok(())
}

fn from_millis(ms: i64) -> DateTime<Utc> {
  DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
