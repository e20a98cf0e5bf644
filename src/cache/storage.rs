//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

use super::traits::Cacheable;
use crate::error::{Result, SyncError};

/// Sync bookkeeping for a collection or a single entity.
///
/// Kept in its own key-value table so that clearing entity rows does not
/// implicitly clear it, and vice versa.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
  /// When the last successful fetch for this key committed
  pub last_fetched_at: Option<DateTime<Utc>>,
  /// Total record count reported by the remote
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub remote_total_count: Option<u32>,
  /// Last page index committed
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub current_page: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub has_more: Option<bool>,
  /// Page index taken from the remote's "next" cursor
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub next_page: Option<u32>,
}

impl SyncMetadata {
  pub fn fetched_at(at: DateTime<Utc>) -> Self {
    Self {
      last_fetched_at: Some(at),
      ..Self::default()
    }
  }
}

/// A set of writes applied in one transaction.
///
/// Order of application: entity clear, metadata clear, entity upserts,
/// metadata puts.
#[derive(Debug)]
pub struct WriteBatch<'a, T> {
  pub clear_entities: bool,
  pub clear_metadata_prefix: Option<&'a str>,
  pub entities: &'a [T],
  pub metadata: Vec<(String, SyncMetadata)>,
}

impl<'a, T> WriteBatch<'a, T> {
  /// Upsert `entities`, leaving everything else alone.
  pub fn upsert(entities: &'a [T]) -> Self {
    Self {
      clear_entities: false,
      clear_metadata_prefix: None,
      entities,
      metadata: Vec::new(),
    }
  }

  /// Delete every row of the entity kind and every metadata key under `prefix`.
  pub fn reset(prefix: &'a str) -> Self {
    Self {
      clear_entities: true,
      clear_metadata_prefix: Some(prefix),
      entities: &[],
      metadata: Vec::new(),
    }
  }

  /// Drop existing rows of the kind before inserting.
  pub fn replacing(mut self) -> Self {
    self.clear_entities = true;
    self
  }

  pub fn with_metadata(mut self, key: impl Into<String>, metadata: SyncMetadata) -> Self {
    self.metadata.push((key.into(), metadata));
    self
  }
}

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Apply a batch of writes atomically.
  fn write_batch<T: Cacheable>(&self, batch: WriteBatch<'_, T>) -> Result<()>;

  /// Get a single entity by id.
  fn fetch_by_id<T: Cacheable>(&self, id: u32) -> Result<Option<T>>;

  /// Get every entity of the kind, ascending by id.
  fn fetch_all_sorted<T: Cacheable>(&self) -> Result<Vec<T>>;

  fn get_metadata(&self, key: &str) -> Result<Option<SyncMetadata>>;

  fn put_metadata(&self, key: &str, metadata: &SyncMetadata) -> Result<()>;

  /// Store a single entity, replacing any previous row with the same id.
  fn upsert<T: Cacheable>(&self, entity: &T) -> Result<()> {
    self.write_batch(WriteBatch::upsert(std::slice::from_ref(entity)))
  }

  fn upsert_all<T: Cacheable>(&self, entities: &[T]) -> Result<()> {
    self.write_batch(WriteBatch::upsert(entities))
  }

  /// Delete every entity of the kind. Metadata is untouched.
  fn delete_all<T: Cacheable>(&self) -> Result<()> {
    self.write_batch::<T>(WriteBatch::upsert(&[]).replacing())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) a cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| SyncError::Store(format!("Failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::Store(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// Open a throwaway database that lives as long as the value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| SyncError::Store(format!("Failed to open in-memory cache: {}", e)))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::Store(format!("Lock poisoned: {}", e)))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| SyncError::Store(format!("Failed to run cache migrations: {}", e)))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Entity rows (stores serialized JSON)
CREATE TABLE IF NOT EXISTS entity_cache (
    entity_type TEXT NOT NULL,
    entity_id INTEGER NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (entity_type, entity_id)
);

-- Sync bookkeeping, independent of entity rows
CREATE TABLE IF NOT EXISTS sync_metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl CacheStorage for SqliteStorage {
  fn write_batch<T: Cacheable>(&self, batch: WriteBatch<'_, T>) -> Result<()> {
    let mut conn = self.lock()?;
    let entity_type = T::entity_type();

    let tx = conn
      .transaction()
      .map_err(|e| SyncError::Store(format!("Failed to begin transaction: {}", e)))?;

    if batch.clear_entities {
      tx.execute(
        "DELETE FROM entity_cache WHERE entity_type = ?",
        params![entity_type],
      )
      .map_err(|e| SyncError::Store(format!("Failed to clear {} rows: {}", entity_type, e)))?;
    }

    if let Some(prefix) = batch.clear_metadata_prefix {
      tx.execute(
        "DELETE FROM sync_metadata
         WHERE key = ?1 OR substr(key, 1, length(?1) + 1) = ?1 || ':'",
        params![prefix],
      )
      .map_err(|e| SyncError::Store(format!("Failed to clear metadata {}: {}", prefix, e)))?;
    }

    for entity in batch.entities {
      let data = serde_json::to_vec(entity)
        .map_err(|e| SyncError::Store(format!("Failed to serialize entity: {}", e)))?;

      // INSERT OR REPLACE deletes the old row first, so updates are full replacements
      tx.execute(
        "INSERT OR REPLACE INTO entity_cache (entity_type, entity_id, data, cached_at)
         VALUES (?, ?, ?, datetime('now'))",
        params![entity_type, entity.cache_id(), data],
      )
      .map_err(|e| SyncError::Store(format!("Failed to store entity: {}", e)))?;
    }

    for (key, metadata) in &batch.metadata {
      put_metadata_row(&tx, key, metadata)?;
    }

    tx.commit()
      .map_err(|e| SyncError::Store(format!("Failed to commit transaction: {}", e)))?;

    Ok(())
  }

  fn fetch_by_id<T: Cacheable>(&self, id: u32) -> Result<Option<T>> {
    let conn = self.lock()?;

    let data: Option<Vec<u8>> = conn
      .query_row(
        "SELECT data FROM entity_cache WHERE entity_type = ? AND entity_id = ?",
        params![T::entity_type(), id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| SyncError::Store(format!("Failed to query entity {}: {}", id, e)))?;

    match data {
      Some(data) => {
        let entity = serde_json::from_slice(&data)
          .map_err(|e| SyncError::Store(format!("Failed to deserialize entity {}: {}", id, e)))?;
        Ok(Some(entity))
      }
      None => Ok(None),
    }
  }

  fn fetch_all_sorted<T: Cacheable>(&self) -> Result<Vec<T>> {
    let conn = self.lock()?;
    let entity_type = T::entity_type();

    let mut stmt = conn
      .prepare("SELECT entity_id, data FROM entity_cache WHERE entity_type = ? ORDER BY entity_id")
      .map_err(|e| SyncError::Store(format!("Failed to prepare entity query: {}", e)))?;

    let rows: Vec<(u32, Vec<u8>)> = stmt
      .query_map(params![entity_type], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| SyncError::Store(format!("Failed to query entities: {}", e)))?
      .collect::<rusqlite::Result<_>>()?;

    let entities = rows
      .into_iter()
      .filter_map(|(id, data)| match serde_json::from_slice(&data) {
        Ok(entity) => Some(entity),
        Err(e) => {
          warn!(entity_type, id, error = %e, "skipping undecodable cached row");
          None
        }
      })
      .collect();

    Ok(entities)
  }

  fn get_metadata(&self, key: &str) -> Result<Option<SyncMetadata>> {
    let conn = self.lock()?;

    let value: Option<String> = conn
      .query_row(
        "SELECT value FROM sync_metadata WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| SyncError::Store(format!("Failed to query metadata {}: {}", key, e)))?;

    value
      .map(|v| {
        serde_json::from_str(&v)
          .map_err(|e| SyncError::Store(format!("Failed to parse metadata {}: {}", key, e)))
      })
      .transpose()
  }

  fn put_metadata(&self, key: &str, metadata: &SyncMetadata) -> Result<()> {
    let conn = self.lock()?;
    put_metadata_row(&conn, key, metadata)
  }
}

fn put_metadata_row(conn: &Connection, key: &str, metadata: &SyncMetadata) -> Result<()> {
  let value = serde_json::to_string(metadata)
    .map_err(|e| SyncError::Store(format!("Failed to serialize metadata: {}", e)))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO sync_metadata (key, value, updated_at)
       VALUES (?, ?, datetime('now'))",
      params![key, value],
    )
    .map_err(|e| SyncError::Store(format!("Failed to store metadata {}: {}", key, e)))?;

  Ok(())
}
