use std::fmt;

use crate::store::MutationKind;

/// Background-sync tag, one per mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyncTag {
  Tasks,
  Assets,
  Bookings,
}

impl SyncTag {
  pub const ALL: [SyncTag; 3] = [SyncTag::Tasks, SyncTag::Assets, SyncTag::Bookings];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Tasks => "sync-tasks",
      Self::Assets => "sync-assets",
      Self::Bookings => "sync-bookings",
    }
  }

  /// Known tag for a wire string; anything else is not ours.
  pub fn parse(tag: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|t| t.as_str() == tag)
  }

  pub fn for_kind(kind: MutationKind) -> Self {
    match kind {
      MutationKind::Task => Self::Tasks,
      MutationKind::Asset => Self::Assets,
      MutationKind::Booking => Self::Bookings,
    }
  }

  pub fn kind(&self) -> MutationKind {
    match self {
      Self::Tasks => MutationKind::Task,
      Self::Assets => MutationKind::Asset,
      Self::Bookings => MutationKind::Booking,
    }
  }
}

impl fmt::Display for SyncTag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}
