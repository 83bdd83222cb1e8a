use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
  /// The persistence engine could not be opened. Callers degrade to a
  /// non-durable store.
  #[error("Durable storage unavailable: {0}")]
  Unavailable(String),

  #[error("Storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("Lock poisoned: {0}")]
  Poisoned(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
