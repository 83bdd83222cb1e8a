//! Versioned response-cache partitions and their SQLite storage.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Mutex, MutexGuard};

use crate::db::{self, StoreLocation};
use crate::net::{Request, Response};
use crate::store::{from_millis, StoreError, StoreResult};

const PARTITION_PREFIX: &str = "hearthkeep";

/// What a partition holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionRole {
  /// Pre-enumerated application shell
  Static,
  /// Pages and other responses served stale-while-revalidate
  Dynamic,
  /// API responses served network-first
  Api,
}

impl PartitionRole {
  fn as_str(&self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
      Self::Api => "api",
    }
  }
}

/// The three partition names for one cache version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePartitions {
  static_name: String,
  dynamic_name: String,
  api_name: String,
}

impl CachePartitions {
  pub fn for_version(version: &str) -> Self {
    let name = |role: PartitionRole| format!("{}-{}-{}", PARTITION_PREFIX, role.as_str(), version);
    Self {
      static_name: name(PartitionRole::Static),
      dynamic_name: name(PartitionRole::Dynamic),
      api_name: name(PartitionRole::Api),
    }
  }

  pub fn name(&self, role: PartitionRole) -> &str {
    match role {
      PartitionRole::Static => &self.static_name,
      PartitionRole::Dynamic => &self.dynamic_name,
      PartitionRole::Api => &self.api_name,
    }
  }

  pub fn is_current(&self, name: &str) -> bool {
    name == self.static_name || name == self.dynamic_name || name == self.api_name
  }
}

/// A response held in a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub response: Response,
  pub stored_at: DateTime<Utc>,
}

/// Trait for response cache backends.
pub trait ResponseStore: Send + Sync {
  /// Store (or replace) the response for `request` in `partition`.
  fn put(
    &self,
    partition: &str,
    request: &Request,
    response: &Response,
    stored_at: DateTime<Utc>,
  ) -> StoreResult<()>;

  fn get(&self, partition: &str, request: &Request) -> StoreResult<Option<CachedResponse>>;

  /// Names of every partition holding at least one response.
  fn partition_names(&self) -> StoreResult<Vec<String>>;

  /// Drop a partition. Returns how many responses it held.
  fn delete_partition(&self, partition: &str) -> StoreResult<usize>;
}

/// Schema for response cache tables.
const RESPONSE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS http_cache (
    partition TEXT NOT NULL,
    request_key TEXT NOT NULL,
    target TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at INTEGER NOT NULL,
    PRIMARY KEY (partition, request_key)
);
"#;

/// SQLite-based response store.
pub struct SqliteResponseStore {
  conn: Mutex<Connection>,
}

impl SqliteResponseStore {
  pub fn open(location: &StoreLocation) -> StoreResult<Self> {
    let conn = db::open(location, RESPONSE_SCHEMA).map_err(StoreError::Unavailable)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Poisoned(e.to_string()))
  }
}

impl ResponseStore for SqliteResponseStore {
  fn put(
    &self,
    partition: &str,
    request: &Request,
    response: &Response,
    stored_at: DateTime<Utc>,
  ) -> StoreResult<()> {
    let conn = self.conn()?;
    let headers = serde_json::to_string(&response.headers)?;

    conn.execute(
      "INSERT OR REPLACE INTO http_cache
         (partition, request_key, target, status, headers, body, stored_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
      params![
        partition,
        request.cache_key(),
        request.target(),
        response.status,
        headers,
        response.body,
        stored_at.timestamp_millis()
      ],
    )?;

    Ok(())
  }

  fn get(&self, partition: &str, request: &Request) -> StoreResult<Option<CachedResponse>> {
    let conn = self.conn()?;

    let row: Option<(u16, String, Vec<u8>, i64)> = conn
      .query_row(
        "SELECT status, headers, body, stored_at FROM http_cache
         WHERE partition = ?1 AND request_key = ?2",
        params![partition, request.cache_key()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()?;

    match row {
      Some((status, headers, body, stored_at)) => Ok(Some(CachedResponse {
        response: Response {
          status,
          headers: serde_json::from_str(&headers)?,
          body,
        },
        stored_at: from_millis(stored_at),
      })),
      None => Ok(None),
    }
  }

  fn partition_names(&self) -> StoreResult<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare("SELECT DISTINCT partition FROM http_cache ORDER BY partition")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
  }

  fn delete_partition(&self, partition: &str) -> StoreResult<usize> {
    let conn = self.conn()?;
    let removed = conn.execute(
      "DELETE FROM http_cache WHERE partition = ?1",
      params![partition],
    )?;
    Ok(removed)
  }
}
