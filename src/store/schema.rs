//! Partition tables and their migrations.

use rusqlite::Connection;

use crate::error::Result;

/// Migrations in order; entry `i` moves the database to `user_version = i + 1`.
/// Only ever append.
const MIGRATIONS: &[&str] = &[
  r#"
CREATE TABLE IF NOT EXISTS market_data (
    key TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_market_data_timestamp ON market_data(timestamp);

CREATE TABLE IF NOT EXISTS signals (
    key TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_signals_timestamp ON signals(timestamp);

CREATE TABLE IF NOT EXISTS preferences (
    key TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_preferences_timestamp ON preferences(timestamp);
"#,
  r#"
CREATE TABLE IF NOT EXISTS scan_results (
    key TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_scan_results_timestamp ON scan_results(timestamp);
"#,
];

pub fn latest_version() -> u32 {
  MIGRATIONS.len() as u32
}

pub fn user_version(conn: &Connection) -> Result<u32> {
  Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Apply every migration newer than the database. Returns the number applied.
pub fn migrate(conn: &mut Connection) -> Result<usize> {
  let current = user_version(conn)? as usize;
  let pending = MIGRATIONS.iter().enumerate().skip(current);

  let mut applied = 0;
  for (index, sql) in pending {
    let tx = conn.transaction()?;
    tx.execute_batch(sql)?;
    tx.pragma_update(None, "user_version", (index + 1) as u32)?;
    tx.commit()?;
    applied += 1;
  }

  if applied > 0 {
    tracing::info!(from = current, to = latest_version(), "migrated store schema");
  }
  Ok(applied)
}
