//! Namespace storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::{request_key, CachedResponse, EntryMeta};
use crate::error::{Error, Result};
use crate::http::{Request, Response};

/// Backend holding namespaces and their cached responses.
///
/// Shared by every execution context of the application; writers overwrite
/// by key and there is no cross-call isolation.
pub trait CacheStorage: Send + Sync {
  /// Create the namespace if it does not exist.
  fn open_namespace(&self, name: &str) -> Result<()>;

  /// Names of all existing namespaces, sorted.
  fn namespaces(&self) -> Result<Vec<String>>;

  /// Delete a namespace and its entries. Returns whether it existed.
  fn delete_namespace(&self, name: &str) -> Result<bool>;

  /// Look up the entry for `request`, honouring recorded vary headers.
  fn match_request(&self, namespace: &str, request: &Request) -> Result<Option<CachedResponse>>;

  /// Store `response` for `request`, replacing any previous entry.
  fn put(&self, namespace: &str, request: &Request, response: &Response) -> Result<()>;

  fn entry_count(&self, namespace: &str) -> Result<usize>;

  /// Delete oldest entries until at most `max_entries` remain.
  fn trim(&self, namespace: &str, max_entries: usize) -> Result<usize>;

  /// Delete every entry but keep the namespace.
  fn clear(&self, namespace: &str) -> Result<usize>;
}

/// SQLite-based namespace storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        Error::StorageUnavailable(format!("failed to create cache directory: {}", e))
      })?;
    }

    let conn = Connection::open(path)?;
    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn.execute_batch(CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::StorageUnavailable(format!("lock poisoned: {}", e)))
  }
}

const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS namespaces (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entries (
    namespace TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    meta TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    seq INTEGER NOT NULL,
    PRIMARY KEY (namespace, request_key)
);

CREATE INDEX IF NOT EXISTS idx_entries_seq ON entries(namespace, seq);
"#;

impl CacheStorage for SqliteStorage {
  fn open_namespace(&self, name: &str) -> Result<()> {
    let conn = self.conn()?;
    conn.execute(
      "INSERT OR IGNORE INTO namespaces (name, created_at) VALUES (?, ?)",
      params![name, Utc::now().to_rfc3339()],
    )?;
    Ok(())
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare("SELECT name FROM namespaces ORDER BY name")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
  }

  fn delete_namespace(&self, name: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM entries WHERE namespace = ?", params![name])?;
    let removed = tx.execute("DELETE FROM namespaces WHERE name = ?", params![name])?;
    tx.commit()?;
    Ok(removed > 0)
  }

  fn match_request(&self, namespace: &str, request: &Request) -> Result<Option<CachedResponse>> {
    let conn = self.conn()?;
    let row: Option<(String, u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT url, status, meta, body, stored_at FROM entries
         WHERE namespace = ? AND request_key = ?",
        params![namespace, request_key(request)],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()?;

    let Some((url, status, meta, body, stored_at)) = row else {
      return Ok(None);
    };

    let meta: EntryMeta = serde_json::from_str(&meta)?;
    let cached = CachedResponse {
      url,
      status,
      headers: meta.headers,
      kind: meta.kind,
      vary: meta.vary,
      body,
      stored_at: parse_datetime(&stored_at)?,
    };

    Ok(cached.matches(request).then_some(cached))
  }

  fn put(&self, namespace: &str, request: &Request, response: &Response) -> Result<()> {
    let cached = CachedResponse::capture(request, response);
    let meta = serde_json::to_string(&cached.meta())?;

    let conn = self.conn()?;
    conn.execute(
      "INSERT OR IGNORE INTO namespaces (name, created_at) VALUES (?, ?)",
      params![namespace, Utc::now().to_rfc3339()],
    )?;
    conn.execute(
      "INSERT OR REPLACE INTO entries
         (namespace, request_key, url, status, meta, body, stored_at, seq)
       VALUES (?, ?, ?, ?, ?, ?, ?,
         (SELECT COALESCE(MAX(seq), 0) + 1 FROM entries WHERE namespace = ?))",
      params![
        namespace,
        request_key(request),
        cached.url,
        cached.status,
        meta,
        cached.body,
        cached.stored_at.to_rfc3339(),
        namespace
      ],
    )?;
    Ok(())
  }

  fn entry_count(&self, namespace: &str) -> Result<usize> {
    let conn = self.conn()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM entries WHERE namespace = ?",
      params![namespace],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }

  fn trim(&self, namespace: &str, max_entries: usize) -> Result<usize> {
    let conn = self.conn()?;
    let removed = conn.execute(
      "DELETE FROM entries WHERE namespace = ?1 AND seq NOT IN (
         SELECT seq FROM entries WHERE namespace = ?1 ORDER BY seq DESC LIMIT ?2
       )",
      params![namespace, max_entries as i64],
    )?;
    Ok(removed)
  }

  fn clear(&self, namespace: &str) -> Result<usize> {
    let conn = self.conn()?;
    Ok(conn.execute("DELETE FROM entries WHERE namespace = ?", params![namespace])?)
  }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::StorageUnavailable(format!("bad timestamp '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::get;
  use reqwest::StatusCode;

  fn ok(body: &str) -> Response {
    Response::new(StatusCode::OK, body)
  }

  #[test]
  fn put_then_match_returns_body() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let req = get("/css/app.css");
    storage.put("ns", &req, &ok("body{}")).unwrap();

    let hit = storage.match_request("ns", &req).unwrap().expect("cached");
    assert_eq!(hit.body, b"body{}");
    assert_eq!(hit.status, 200);
    assert!(storage.match_request("other", &req).unwrap().is_none());
  }

  #[test]
  fn put_overwrites_by_key() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let req = get("/api/status");
    storage.put("ns", &req, &ok("one")).unwrap();
    storage.put("ns", &req, &ok("two")).unwrap();

    assert_eq!(storage.entry_count("ns").unwrap(), 1);
    assert_eq!(storage.match_request("ns", &req).unwrap().unwrap().body, b"two");
  }

  #[test]
  fn trim_keeps_newest_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    for i in 0..5 {
      storage.put("ns", &get(&format!("/img/{}.png", i)), &ok("x")).unwrap();
    }

    assert_eq!(storage.trim("ns", 3).unwrap(), 2);
    assert_eq!(storage.entry_count("ns").unwrap(), 3);
    assert!(storage.match_request("ns", &get("/img/0.png")).unwrap().is_none());
    assert!(storage.match_request("ns", &get("/img/4.png")).unwrap().is_some());
  }

  #[test]
  fn delete_namespace_drops_entries() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_namespace("keep").unwrap();
    storage.put("old", &get("/a.js"), &ok("x")).unwrap();

    assert!(storage.delete_namespace("old").unwrap());
    assert!(!storage.delete_namespace("old").unwrap());
    assert_eq!(storage.namespaces().unwrap(), vec!["keep".to_string()]);
    assert_eq!(storage.entry_count("old").unwrap(), 0);
  }

  #[test]
  fn survives_reopen_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage.put("ns", &get("/index.html"), &ok("<html>")).unwrap();
    }
    let storage = SqliteStorage::open(&path).unwrap();
    assert!(storage.match_request("ns", &get("/index.html")).unwrap().is_some());
  }
}
