//! Structured records that outlive any single request.
//!
//! Each partition is one SQLite table keyed by the record key with an index
//! on the record timestamp. Failures never reach callers: every operation
//! logs and returns an empty value instead.

pub mod schema;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};

/// Named record partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
  /// Keyed by `[symbol, timeframe]`
  MarketData,
  Signals,
  Preferences,
  ScanResults,
}

impl Partition {
  pub const ALL: [Partition; 4] = [
    Partition::MarketData,
    Partition::Signals,
    Partition::Preferences,
    Partition::ScanResults,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Partition::MarketData => "market_data",
      Partition::Signals => "signals",
      Partition::Preferences => "preferences",
      Partition::ScanResults => "scan_results",
    }
  }

  /// Number of key components records in this partition carry.
  fn key_arity(&self) -> usize {
    match self {
      Partition::MarketData => 2,
      _ => 1,
    }
  }
}

impl fmt::Display for Partition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A simple key or a composite tuple such as `[symbol, timeframe]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordKey {
  Simple(String),
  Composite(Vec<String>),
}

impl RecordKey {
  pub fn simple(key: impl Into<String>) -> Self {
    RecordKey::Simple(key.into())
  }

  pub fn composite<I, S>(parts: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    RecordKey::Composite(parts.into_iter().map(Into::into).collect())
  }

  fn arity(&self) -> usize {
    match self {
      RecordKey::Simple(_) => 1,
      RecordKey::Composite(parts) => parts.len(),
    }
  }

  fn encode(&self) -> Result<String> {
    Ok(serde_json::to_string(self)?)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
  pub key: RecordKey,
  pub payload: serde_json::Value,
  pub timestamp: DateTime<Utc>,
}

impl Record {
  /// A record stamped with the current time.
  pub fn new(key: RecordKey, payload: serde_json::Value) -> Self {
    Self {
      key,
      payload,
      timestamp: Utc::now(),
    }
  }

  pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
    self.timestamp = timestamp;
    self
  }
}

/// Fixed-width so lexical order in the index is chronological order.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
  ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::StorageUnavailable(format!("bad timestamp {}: {}", s, e)))
}

/// SQLite-backed record store.
pub struct PersistentStore {
  conn: Mutex<Connection>,
  retention: chrono::Duration,
}

impl PersistentStore {
  /// Open or create the store at `path` and bring its schema up to date.
  pub fn open(path: &Path, retention: chrono::Duration) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        Error::StorageUnavailable(format!("failed to create store directory: {}", e))
      })?;
    }
    Self::with_connection(Connection::open(path)?, retention)
  }

  pub fn open_in_memory(retention: chrono::Duration) -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?, retention)
  }

  fn with_connection(mut conn: Connection, retention: chrono::Duration) -> Result<Self> {
    schema::migrate(&mut conn)?;
    Ok(Self {
      conn: Mutex::new(conn),
      retention,
    })
  }

  pub fn retention(&self) -> chrono::Duration {
    self.retention
  }

  pub fn schema_version(&self) -> Option<u32> {
    let conn = self.conn().ok()?;
    schema::user_version(&conn).ok()
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::StorageUnavailable(format!("lock poisoned: {}", e)))
  }

  pub fn get(&self, partition: Partition, key: &RecordKey) -> Option<Record> {
    absorb("get", partition, self.try_get(partition, key), None)
  }

  /// Insert or replace the record under its key.
  pub fn put(&self, partition: Partition, record: &Record) -> bool {
    absorb("put", partition, self.try_put(partition, record).map(|_| true), false)
  }

  pub fn get_all(&self, partition: Partition) -> Vec<Record> {
    absorb("get_all", partition, self.try_get_all(partition), Vec::new())
  }

  /// Delete records strictly older than `now - retention`.
  pub fn delete_old(&self, partition: Partition) -> usize {
    let cutoff = Utc::now()
      .checked_sub_signed(self.retention)
      .unwrap_or(DateTime::<Utc>::MIN_UTC);
    absorb(
      "delete_old",
      partition,
      self.try_delete_before(partition, &cutoff),
      0,
    )
  }

  /// `delete_old` over every partition.
  pub fn delete_old_all(&self) -> usize {
    Partition::ALL.iter().map(|p| self.delete_old(*p)).sum()
  }

  /// Returns whether a record was removed.
  pub fn delete(&self, partition: Partition, key: &RecordKey) -> bool {
    absorb("delete", partition, self.try_delete(partition, key), false)
  }

  pub fn clear(&self, partition: Partition) -> bool {
    absorb("clear", partition, self.try_clear(partition).map(|_| true), false)
  }

  fn try_get(&self, partition: Partition, key: &RecordKey) -> Result<Option<Record>> {
    let conn = self.conn()?;
    let sql = format!("SELECT payload, timestamp FROM {} WHERE key = ?", partition);
    let row: Option<(String, String)> = conn
      .query_row(&sql, params![key.encode()?], |row| Ok((row.get(0)?, row.get(1)?)))
      .optional()?;

    let Some((payload, timestamp)) = row else {
      return Ok(None);
    };
    Ok(Some(Record {
      key: key.clone(),
      payload: serde_json::from_str(&payload)?,
      timestamp: parse_timestamp(&timestamp)?,
    }))
  }

  fn try_put(&self, partition: Partition, record: &Record) -> Result<()> {
    if record.key.arity() != partition.key_arity() {
      return Err(Error::InvalidRequest(format!(
        "{} expects a key with {} part(s), got {:?}",
        partition,
        partition.key_arity(),
        record.key
      )));
    }

    let conn = self.conn()?;
    let sql = format!(
      "INSERT OR REPLACE INTO {} (key, payload, timestamp) VALUES (?, ?, ?)",
      partition
    );
    conn.execute(
      &sql,
      params![
        record.key.encode()?,
        serde_json::to_string(&record.payload)?,
        format_timestamp(&record.timestamp)
      ],
    )?;
    Ok(())
  }

  fn try_get_all(&self, partition: Partition) -> Result<Vec<Record>> {
    let conn = self.conn()?;
    let sql = format!("SELECT key, payload, timestamp FROM {} ORDER BY timestamp", partition);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
        ))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    rows
      .into_iter()
      .map(|(key, payload, timestamp)| {
        Ok(Record {
          key: serde_json::from_str(&key)?,
          payload: serde_json::from_str(&payload)?,
          timestamp: parse_timestamp(&timestamp)?,
        })
      })
      .collect()
  }

  fn try_delete_before(&self, partition: Partition, cutoff: &DateTime<Utc>) -> Result<usize> {
    let conn = self.conn()?;
    let sql = format!("DELETE FROM {} WHERE timestamp < ?", partition);
    let removed = conn.execute(&sql, params![format_timestamp(cutoff)])?;
    if removed > 0 {
      tracing::debug!(%partition, removed, "deleted expired records");
    }
    Ok(removed)
  }

  fn try_delete(&self, partition: Partition, key: &RecordKey) -> Result<bool> {
    let conn = self.conn()?;
    let sql = format!("DELETE FROM {} WHERE key = ?", partition);
    Ok(conn.execute(&sql, params![key.encode()?])? > 0)
  }

  fn try_clear(&self, partition: Partition) -> Result<usize> {
    let conn = self.conn()?;
    Ok(conn.execute(&format!("DELETE FROM {}", partition), [])?)
  }
}

fn absorb<T>(op: &str, partition: Partition, result: Result<T>, fallback: T) -> T {
  match result {
    Ok(value) => value,
    Err(e) => {
      tracing::warn!(op, %partition, error = %e, "store operation failed");
      fallback
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;
  use serde_json::json;

  fn store() -> PersistentStore {
    PersistentStore::open_in_memory(Duration::hours(24)).unwrap()
  }

  #[test]
  fn put_then_get_returns_equal_record() {
    let store = store();
    let record = Record::new(
      RecordKey::composite(["BTCUSDT", "1h"]),
      json!({"close": 64000.5, "volume": [1, 2, 3]}),
    );

    assert!(store.put(Partition::MarketData, &record));
    let loaded = store.get(Partition::MarketData, &record.key).unwrap();
    assert_eq!(loaded, record);
  }

  #[test]
  fn last_write_wins() {
    let store = store();
    let key = RecordKey::simple("theme");
    store.put(Partition::Preferences, &Record::new(key.clone(), json!("light")));
    store.put(Partition::Preferences, &Record::new(key.clone(), json!("dark")));

    assert_eq!(store.get_all(Partition::Preferences).len(), 1);
    assert_eq!(store.get(Partition::Preferences, &key).unwrap().payload, json!("dark"));
  }

  #[test]
  fn delete_old_removes_only_expired_records() {
    let store = store();
    let now = Utc::now();
    let old = Record::new(RecordKey::simple("s-1"), json!({"side": "buy"})).at(now - Duration::hours(25));
    let fresh = Record::new(RecordKey::simple("s-2"), json!({"side": "sell"})).at(now - Duration::hours(1));
    store.put(Partition::Signals, &old);
    store.put(Partition::Signals, &fresh);

    assert_eq!(store.delete_old(Partition::Signals), 1);
    assert!(store.get(Partition::Signals, &old.key).is_none());
    assert_eq!(store.get(Partition::Signals, &fresh.key), Some(fresh));
  }

  #[test]
  fn unbounded_retention_keeps_everything() {
    let store = PersistentStore::open_in_memory(Duration::MAX).unwrap();
    let ancient = Record::new(RecordKey::simple("s-1"), json!({})).at(Utc::now() - Duration::days(3650));
    store.put(Partition::Signals, &ancient);

    assert_eq!(store.delete_old(Partition::Signals), 0);
    assert_eq!(store.get(Partition::Signals, &ancient.key), Some(ancient));
  }

  #[test]
  fn key_shape_must_match_partition() {
    let store = store();
    let wrong = Record::new(RecordKey::simple("BTCUSDT"), json!({}));
    assert!(!store.put(Partition::MarketData, &wrong));
    assert!(store.get_all(Partition::MarketData).is_empty());
  }

  #[test]
  fn missing_values_are_empty_not_errors() {
    let store = store();
    assert!(store.get(Partition::ScanResults, &RecordKey::simple("none")).is_none());
    assert!(!store.delete(Partition::ScanResults, &RecordKey::simple("none")));
    assert_eq!(store.delete_old_all(), 0);
    assert!(store.clear(Partition::ScanResults));
  }

  #[test]
  fn delete_and_clear() {
    let store = store();
    for id in ["a", "b", "c"] {
      store.put(Partition::ScanResults, &Record::new(RecordKey::simple(id), json!({"id": id})));
    }
    assert!(store.delete(Partition::ScanResults, &RecordKey::simple("b")));
    assert_eq!(store.get_all(Partition::ScanResults).len(), 2);

    assert!(store.clear(Partition::ScanResults));
    assert!(store.get_all(Partition::ScanResults).is_empty());
  }

  #[test]
  fn reopening_does_not_rerun_migrations() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.db");
    let record = Record::new(RecordKey::simple("layout"), json!({"columns": 3}));

    {
      let store = PersistentStore::open(&path, Duration::hours(24)).unwrap();
      assert_eq!(store.schema_version(), Some(schema::latest_version()));
      assert!(store.put(Partition::Preferences, &record));
    }

    let mut conn = Connection::open(&path).unwrap();
    assert_eq!(schema::migrate(&mut conn).unwrap(), 0);
    drop(conn);

    let store = PersistentStore::open(&path, Duration::hours(24)).unwrap();
    assert_eq!(store.schema_version(), Some(schema::latest_version()));
    assert_eq!(store.get(Partition::Preferences, &record.key), Some(record));
  }
}
