//! Record shapes held by the offline queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The three categories of user writes that can wait for connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
  Task,
  Asset,
  Booking,
}

impl MutationKind {
  pub const ALL: [MutationKind; 3] = [MutationKind::Task, MutationKind::Asset, MutationKind::Booking];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Task => "task",
      Self::Asset => "asset",
      Self::Booking => "booking",
    }
  }

  /// Table holding pending records of this kind.
  pub(crate) fn table(&self) -> &'static str {
    match self {
      Self::Task => "task_mutations",
      Self::Asset => "asset_mutations",
      Self::Booking => "booking_mutations",
    }
  }
}

impl fmt::Display for MutationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for MutationKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "task" | "tasks" => Ok(Self::Task),
      "asset" | "assets" => Ok(Self::Asset),
      "booking" | "bookings" => Ok(Self::Booking),
      other => Err(format!("unknown mutation kind '{}'", other)),
    }
  }
}

/// Maintenance task write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMutation {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub asset_id: Option<String>,
  /// ISO 8601 date
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub due_date: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub priority: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
}

/// Household asset write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetMutation {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub category: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub brand: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub model: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub location: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub purchase_date: Option<String>,
}

/// Service-provider booking write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingMutation {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
  pub provider_id: String,
  pub service_type: String,
  /// ISO 8601 timestamp
  pub scheduled_for: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub notes: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
}

/// A write waiting for the server, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Mutation {
  Task(TaskMutation),
  Asset(AssetMutation),
  Booking(BookingMutation),
}

impl Mutation {
  pub fn kind(&self) -> MutationKind {
    match self {
      Self::Task(_) => MutationKind::Task,
      Self::Asset(_) => MutationKind::Asset,
      Self::Booking(_) => MutationKind::Booking,
    }
  }

  pub fn id(&self) -> Option<&str> {
    match self {
      Self::Task(m) => m.id.as_deref(),
      Self::Asset(m) => m.id.as_deref(),
      Self::Booking(m) => m.id.as_deref(),
    }
  }

  pub(crate) fn set_id(&mut self, id: String) {
    match self {
      Self::Task(m) => m.id = Some(id),
      Self::Asset(m) => m.id = Some(id),
      Self::Booking(m) => m.id = Some(id),
    }
  }

  /// Body sent to the server: the record's own fields, without the kind tag.
  pub fn body(&self) -> serde_json::Result<serde_json::Value> {
    match self {
      Self::Task(m) => serde_json::to_value(m),
      Self::Asset(m) => serde_json::to_value(m),
      Self::Booking(m) => serde_json::to_value(m),
    }
  }
}

/// A mutation as stored in its kind's partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
  pub id: String,
  pub payload: Mutation,
  pub enqueued_at: DateTime<Utc>,
  pub synced: bool,
  /// Failed submissions so far
  pub attempts: u32,
  /// Bumped each time the record is overwritten under the same id
  #[serde(default)]
  pub revision: u32,
}

impl QueuedMutation {
  pub fn kind(&self) -> MutationKind {
    self.payload.kind()
  }
}

/// A mutation taken out of the pending queue after too many failed attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
  pub mutation: QueuedMutation,
  pub reason: String,
  pub dead_lettered_at: DateTime<Utc>,
}

/// A TTL-bounded cached value.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub key: String,
  pub data: serde_json::Value,
  pub stored_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now > self.expires_at
  }
}
