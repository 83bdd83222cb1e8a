//! Background sync: registration of replay intent and queue draining on wake.

mod platform;
mod replay;
mod tags;

pub use platform::{watch_connectivity, BackgroundSync, LocalSyncPlatform, SyncPlatform};
pub use replay::{DrainOutcome, Replayer};
pub use tags::SyncTag;
