//! Queue storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

use super::error::{StoreError, StoreResult};
use super::types::{CacheEntry, DeadLetter, Mutation, MutationKind, QueuedMutation};
use crate::db::{self, StoreLocation};

/// Trait for offline queue storage backends.
pub trait QueueStorage: Send + Sync {
  /// Insert or overwrite a mutation in its kind's partition. Returns the
  /// stored revision: 0 for a new id, one more than before on overwrite.
  fn put_mutation(&self, mutation: &QueuedMutation) -> StoreResult<u32>;

  /// All mutations of a kind, in insertion order.
  fn list_mutations(&self, kind: MutationKind) -> StoreResult<Vec<QueuedMutation>>;

  /// Remove a mutation if it is still at `revision`. Returns whether a row
  /// was removed.
  fn delete_mutation(&self, kind: MutationKind, id: &str, revision: u32) -> StoreResult<bool>;

  /// Remove every mutation of a kind. Returns how many were removed.
  fn clear_mutations(&self, kind: MutationKind) -> StoreResult<usize>;

  /// Increment the failure counter of a mutation still at `revision`.
  /// Returns the new count, or None if it was removed or overwritten.
  fn bump_attempts(&self, kind: MutationKind, id: &str, revision: u32) -> StoreResult<Option<u32>>;

  /// Move a mutation out of the pending partition into the dead-letter table.
  /// Nothing moves, and false is returned, unless the pending row is still at
  /// the letter's revision.
  fn move_to_dead_letter(&self, letter: &DeadLetter) -> StoreResult<bool>;

  /// Dead letters of a kind, oldest first.
  fn list_dead_letters(&self, kind: MutationKind) -> StoreResult<Vec<DeadLetter>>;

  /// Insert or overwrite a cache entry.
  fn put_cache_entry(&self, entry: &CacheEntry) -> StoreResult<()>;

  fn get_cache_entry(&self, key: &str) -> StoreResult<Option<CacheEntry>>;

  fn delete_cache_entry(&self, key: &str) -> StoreResult<()>;

  /// Walk entries in write order and delete those expired at `now`.
  fn sweep_cache_entries(&self, now: DateTime<Utc>) -> StoreResult<usize>;
}

/// Schema for queue tables.
const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS task_mutations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    payload TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    revision INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS asset_mutations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    payload TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    revision INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS booking_mutations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    payload TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    revision INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS dead_letters (
    kind TEXT NOT NULL,
    id TEXT NOT NULL,
    payload TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL,
    revision INTEGER NOT NULL DEFAULT 0,
    reason TEXT NOT NULL,
    dead_lettered_at INTEGER NOT NULL,
    PRIMARY KEY (kind, id)
);

-- Generic TTL cache
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    stored_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_stored_at ON cache_entries(stored_at);
"#;

/// SQLite-based queue storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  durable: bool,
}

impl SqliteStorage {
  /// Open storage at `location` and run migrations.
  pub fn open(location: &StoreLocation) -> StoreResult<Self> {
    let conn = db::open(location, QUEUE_SCHEMA).map_err(StoreError::Unavailable)?;

    Ok(Self {
      conn: Mutex::new(conn),
      durable: location.is_durable(),
    })
  }

  #[cfg(test)]
  pub fn in_memory() -> StoreResult<Self> {
    Self::open(&StoreLocation::Memory)
  }

  pub fn is_durable(&self) -> bool {
    self.durable
  }

  fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Poisoned(e.to_string()))
  }
}

impl QueueStorage for SqliteStorage {
  fn put_mutation(&self, mutation: &QueuedMutation) -> StoreResult<u32> {
    let conn = self.conn()?;
    let payload = serde_json::to_string(&mutation.payload)?;

    // Upsert keeps the original insertion position for a reused id
    let revision = conn.query_row(
      &format!(
        "INSERT INTO {} (id, payload, enqueued_at, synced, attempts, revision)
         VALUES (?1, ?2, ?3, ?4, ?5, 0)
         ON CONFLICT(id) DO UPDATE SET
           payload = excluded.payload,
           enqueued_at = excluded.enqueued_at,
           synced = excluded.synced,
           attempts = excluded.attempts,
           revision = revision + 1
         RETURNING revision",
        mutation.kind().table()
      ),
      params![
        mutation.id,
        payload,
        mutation.enqueued_at.timestamp_millis(),
        mutation.synced,
        mutation.attempts
      ],
      |row| row.get(0),
    )?;

    Ok(revision)
  }

  fn list_mutations(&self, kind: MutationKind) -> StoreResult<Vec<QueuedMutation>> {
    let conn = self.conn()?;

    let mut stmt = conn.prepare(&format!(
      "SELECT id, payload, enqueued_at, synced, attempts, revision FROM {} ORDER BY seq",
      kind.table()
    ))?;

    let rows: Vec<(String, String, i64, bool, u32, u32)> = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })?
      .collect::<Result<_, _>>()?;

    let mutations = rows
      .into_iter()
      .filter_map(|(id, payload, enqueued_at, synced, attempts, revision)| {
        match serde_json::from_str::<Mutation>(&payload) {
          Ok(payload) => Some(QueuedMutation {
            id,
            payload,
            enqueued_at: from_millis(enqueued_at),
            synced,
            attempts,
            revision,
          }),
          Err(e) => {
            warn!(%kind, %id, error = %e, "Skipping undecodable queued mutation");
            None
          }
        }
      })
      .collect();

    Ok(mutations)
  }

  fn delete_mutation(&self, kind: MutationKind, id: &str, revision: u32) -> StoreResult<bool> {
    let conn = self.conn()?;
    let removed = conn.execute(
      &format!("DELETE FROM {} WHERE id = ?1 AND revision = ?2", kind.table()),
      params![id, revision],
    )?;
    Ok(removed > 0)
  }

  fn clear_mutations(&self, kind: MutationKind) -> StoreResult<usize> {
    let conn = self.conn()?;
    let removed = conn.execute(&format!("DELETE FROM {}", kind.table()), [])?;
    Ok(removed)
  }

  fn bump_attempts(&self, kind: MutationKind, id: &str, revision: u32) -> StoreResult<Option<u32>> {
    let conn = self.conn()?;
    let attempts = conn
      .query_row(
        &format!(
          "UPDATE {} SET attempts = attempts + 1
           WHERE id = ?1 AND revision = ?2 RETURNING attempts",
          kind.table()
        ),
        params![id, revision],
        |row| row.get(0),
      )
      .optional()?;
    Ok(attempts)
  }

  fn move_to_dead_letter(&self, letter: &DeadLetter) -> StoreResult<bool> {
    let mut conn = self.conn()?;
    let mutation = &letter.mutation;
    let kind = mutation.kind();
    let payload = serde_json::to_string(&mutation.payload)?;

    let tx = conn.transaction()?;
    let removed = tx.execute(
      &format!("DELETE FROM {} WHERE id = ?1 AND revision = ?2", kind.table()),
      params![mutation.id, mutation.revision],
    )?;
    if removed == 0 {
      // Dropping the transaction rolls it back
      return Ok(false);
    }

    tx.execute(
      "INSERT OR REPLACE INTO dead_letters
         (kind, id, payload, enqueued_at, attempts, revision, reason, dead_lettered_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
      params![
        kind.as_str(),
        mutation.id,
        payload,
        mutation.enqueued_at.timestamp_millis(),
        mutation.attempts,
        mutation.revision,
        letter.reason,
        letter.dead_lettered_at.timestamp_millis()
      ],
    )?;
    tx.commit()?;

    Ok(true)
  }

  fn list_dead_letters(&self, kind: MutationKind) -> StoreResult<Vec<DeadLetter>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare(
      "SELECT id, payload, enqueued_at, attempts, revision, reason, dead_lettered_at
       FROM dead_letters WHERE kind = ?1 ORDER BY dead_lettered_at",
    )?;

    let rows: Vec<(String, String, i64, u32, u32, String, i64)> = stmt
      .query_map(params![kind.as_str()], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
          row.get(6)?,
        ))
      })?
      .collect::<Result<_, _>>()?;

    let mut letters = Vec::with_capacity(rows.len());
    for (id, payload, enqueued_at, attempts, revision, reason, dead_lettered_at) in rows {
      letters.push(DeadLetter {
        mutation: QueuedMutation {
          id,
          payload: serde_json::from_str(&payload)?,
          enqueued_at: from_millis(enqueued_at),
          synced: false,
          attempts,
          revision,
        },
        reason,
        dead_lettered_at: from_millis(dead_lettered_at),
      });
    }

    Ok(letters)
  }

  fn put_cache_entry(&self, entry: &CacheEntry) -> StoreResult<()> {
    let conn = self.conn()?;
    let data = serde_json::to_string(&entry.data)?;

    conn.execute(
      "INSERT OR REPLACE INTO cache_entries (key, data, stored_at, expires_at)
       VALUES (?1, ?2, ?3, ?4)",
      params![
        entry.key,
        data,
        entry.stored_at.timestamp_millis(),
        entry.expires_at.timestamp_millis()
      ],
    )?;

    Ok(())
  }

  fn get_cache_entry(&self, key: &str) -> StoreResult<Option<CacheEntry>> {
    let conn = self.conn()?;

    let row: Option<(String, i64, i64)> = conn
      .query_row(
        "SELECT data, stored_at, expires_at FROM cache_entries WHERE key = ?1",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()?;

    match row {
      Some((data, stored_at, expires_at)) => Ok(Some(CacheEntry {
        key: key.to_string(),
        data: serde_json::from_str(&data)?,
        stored_at: from_millis(stored_at),
        expires_at: from_millis(expires_at),
      })),
      None => Ok(None),
    }
  }

  fn delete_cache_entry(&self, key: &str) -> StoreResult<()> {
    let conn = self.conn()?;
    conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
    Ok(())
  }

  fn sweep_cache_entries(&self, now: DateTime<Utc>) -> StoreResult<usize> {
    let mut conn = self.conn()?;
    let now_ms = now.timestamp_millis();
    let tx = conn.transaction()?;

    let expired: Vec<String> = {
      let mut stmt = tx.prepare("SELECT key, expires_at FROM cache_entries ORDER BY stored_at")?;
      let entries: Vec<(String, i64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<_, _>>()?;

      entries
        .into_iter()
        .filter(|(_, expires_at)| now_ms > *expires_at)
        .map(|(key, _)| key)
        .collect()
    };

    for key in &expired {
      tx.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
    }
    tx.commit()?;

    Ok(expired.len())
  }
}

/// Open a store at `path`, falling back to a process-local one when the file
/// cannot be used. Errors other than `Unavailable` are returned as is.
pub fn open_or_memory<T>(
  name: &str,
  path: &Path,
  open: impl Fn(&StoreLocation) -> StoreResult<T>,
) -> StoreResult<T> {
  match open(&StoreLocation::File(path.to_path_buf())) {
    Err(StoreError::Unavailable(reason)) => {
      warn!(store = name, %reason, "Durable storage unavailable, using memory");
      open(&StoreLocation::Memory)
    }
    result => result,
  }
}

/// Millisecond timestamps are what every table stores.
pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
  DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::types::TaskMutation;
  use chrono::Duration;

  fn task(id: &str, title: &str) -> QueuedMutation {
    QueuedMutation {
      id: id.to_string(),
      payload: Mutation::Task(TaskMutation {
        id: Some(id.to_string()),
        title: title.to_string(),
        description: None,
        asset_id: None,
        due_date: None,
        priority: None,
        status: None,
      }),
      enqueued_at: Utc::now(),
      synced: false,
      attempts: 0,
      revision: 0,
    }
  }

  #[test]
  fn test_upsert_keeps_insertion_position() {
    let storage = SqliteStorage::in_memory().unwrap();
    storage.put_mutation(&task("a", "first")).unwrap();
    storage.put_mutation(&task("b", "second")).unwrap();
    storage.put_mutation(&task("a", "first, edited")).unwrap();

    let listed = storage.list_mutations(MutationKind::Task).unwrap();
    let ids: Vec<_> = listed.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    match &listed[0].payload {
      Mutation::Task(t) => assert_eq!(t.title, "first, edited"),
      other => panic!("unexpected payload {:?}", other),
    }
  }

  #[test]
  fn test_bump_attempts_on_missing_row() {
    let storage = SqliteStorage::in_memory().unwrap();
    storage.put_mutation(&task("a", "x")).unwrap();
    assert_eq!(storage.bump_attempts(MutationKind::Task, "a", 0).unwrap(), Some(1));
    assert_eq!(storage.bump_attempts(MutationKind::Task, "a", 0).unwrap(), Some(2));
    assert_eq!(storage.bump_attempts(MutationKind::Task, "zz", 0).unwrap(), None);
  }

  #[test]
  fn test_overwrite_bumps_revision_and_resets_attempts() {
    let storage = SqliteStorage::in_memory().unwrap();
    assert_eq!(storage.put_mutation(&task("a", "v1")).unwrap(), 0);
    storage.bump_attempts(MutationKind::Task, "a", 0).unwrap();
    assert_eq!(storage.put_mutation(&task("a", "v2")).unwrap(), 1);

    let listed = storage.list_mutations(MutationKind::Task).unwrap();
    assert_eq!(listed[0].revision, 1);
    assert_eq!(listed[0].attempts, 0);
  }

  #[test]
  fn test_stale_revision_leaves_newer_row_alone() {
    let storage = SqliteStorage::in_memory().unwrap();
    let v1 = task("a", "v1");
    storage.put_mutation(&v1).unwrap();
    storage.put_mutation(&task("a", "v2")).unwrap();

    assert!(!storage.delete_mutation(MutationKind::Task, "a", 0).unwrap());
    assert_eq!(storage.bump_attempts(MutationKind::Task, "a", 0).unwrap(), None);
    let moved = storage
      .move_to_dead_letter(&DeadLetter {
        mutation: v1,
        reason: "server rejected".into(),
        dead_lettered_at: Utc::now(),
      })
      .unwrap();
    assert!(!moved);

    let listed = storage.list_mutations(MutationKind::Task).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].attempts, 0);
    match &listed[0].payload {
      Mutation::Task(t) => assert_eq!(t.title, "v2"),
      other => panic!("unexpected payload {:?}", other),
    }
    assert!(storage.list_dead_letters(MutationKind::Task).unwrap().is_empty());

    assert!(storage.delete_mutation(MutationKind::Task, "a", 1).unwrap());
  }

  #[test]
  fn test_dead_letter_moves_row() {
    let storage = SqliteStorage::in_memory().unwrap();
    let mutation = task("a", "x");
    storage.put_mutation(&mutation).unwrap();

    let moved = storage
      .move_to_dead_letter(&DeadLetter {
        mutation: mutation.clone(),
        reason: "server rejected".into(),
        dead_lettered_at: Utc::now(),
      })
      .unwrap();
    assert!(moved);

    assert!(storage.list_mutations(MutationKind::Task).unwrap().is_empty());
    let letters = storage.list_dead_letters(MutationKind::Task).unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].mutation.id, "a");
    assert_eq!(letters[0].reason, "server rejected");
    assert!(storage.list_dead_letters(MutationKind::Asset).unwrap().is_empty());
  }

  #[test]
  fn test_sweep_only_removes_expired() {
    let storage = SqliteStorage::in_memory().unwrap();
    let now = Utc::now();
    for (key, ttl) in [("old", -10), ("fresh", 60)] {
      storage
        .put_cache_entry(&CacheEntry {
          key: key.to_string(),
          data: serde_json::json!(key),
          stored_at: now,
          expires_at: now + Duration::seconds(ttl),
        })
        .unwrap();
    }

    assert_eq!(storage.sweep_cache_entries(now).unwrap(), 1);
    assert!(storage.get_cache_entry("old").unwrap().is_none());
    assert!(storage.get_cache_entry("fresh").unwrap().is_some());
  }

  #[test]
  fn test_file_storage_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let location = StoreLocation::File(dir.path().join("queue.db"));

    {
      let storage = SqliteStorage::open(&location).unwrap();
      assert!(storage.is_durable());
      storage.put_mutation(&task("t1", "Replace filter")).unwrap();
    }

    let reopened = SqliteStorage::open(&location).unwrap();
    let listed = reopened.list_mutations(MutationKind::Task).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "t1");
  }

  #[test]
  fn test_unusable_path_falls_back_to_memory() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_or_memory("queue", dir.path(), SqliteStorage::open).unwrap();
    assert!(!storage.is_durable());

    storage.put_mutation(&task("t1", "Replace filter")).unwrap();
    assert_eq!(storage.list_mutations(MutationKind::Task).unwrap().len(), 1);
  }

  #[test]
  fn test_usable_path_stays_durable() {
    let dir = tempfile::tempdir().unwrap();
    let storage = open_or_memory("queue", &dir.path().join("queue.db"), SqliteStorage::open).unwrap();
    assert!(storage.is_durable());
  }

  #[test]
  fn test_unopenable_location_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    // A directory cannot be opened as a database file
    let location = StoreLocation::File(dir.path().to_path_buf());
    match SqliteStorage::open(&location) {
      Err(StoreError::Unavailable(_)) => {}
      Err(other) => panic!("unexpected error {:?}", other),
      Ok(_) => panic!("expected open to fail"),
    }
  }
}
