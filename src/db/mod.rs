//! SQLite connection helpers shared by the mutation queue and the response cache.

use rusqlite::Connection;
use std::path::{Path, PathBuf};

/// Where a store keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
  /// On-disk database file, created if missing.
  File(PathBuf),
  /// Process-local database. Nothing survives a restart.
  Memory,
}

impl StoreLocation {
  pub fn is_durable(&self) -> bool {
    matches!(self, StoreLocation::File(_))
  }
}

/// Open a connection and apply `schema`.
///
/// Errors are returned as plain strings; each store maps them into its own
/// error type.
pub fn open(location: &StoreLocation, schema: &str) -> Result<Connection, String> {
  let conn = match location {
    StoreLocation::File(path) => open_file(path)?,
    StoreLocation::Memory => Connection::open_in_memory()
      .map_err(|e| format!("Failed to open in-memory database: {}", e))?,
  };

  conn
    .execute_batch(schema)
    .map_err(|e| format!("Failed to run migrations: {}", e))?;

  Ok(conn)
}

fn open_file(path: &Path) -> Result<Connection, String> {
  // Ensure parent directory exists
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)
      .map_err(|e| format!("Failed to create database directory: {}", e))?;
  }

  Connection::open(path)
    .map_err(|e| format!("Failed to open database at {}: {}", path.display(), e))
}

/// Default directory for databases and logs.
pub fn default_data_dir() -> Option<PathBuf> {
  dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .map(|p| p.join("hearthkeep"))
}
