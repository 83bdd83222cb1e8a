//! Queue replay on sync wakes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::tags::SyncTag;
use crate::net::MutationSink;
use crate::store::{MutationKind, OfflineQueue, QueuedMutation, StoreResult};

/// Result of one pass over a kind's pending records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Accepted by the server and removed
  pub submitted: usize,
  /// Failed and left pending for the next wake
  pub retained: usize,
  /// Failed for the last allowed time and moved to dead letters
  pub dead_lettered: usize,
  /// Failed after being overwritten or cleared mid-submission; the queue's
  /// current state was left as is
  pub superseded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
  Completed(DrainReport),
  /// A drain of the same kind was already running; this wake was coalesced
  AlreadyRunning,
}

/// Drains the offline queue against the server.
///
/// Records of one kind are submitted one at a time, and a kind is never
/// drained twice concurrently. Different kinds drain independently.
pub struct Replayer {
  queue: Arc<OfflineQueue>,
  sink: Arc<dyn MutationSink>,
  max_attempts: Option<u32>,
  in_flight: Mutex<HashSet<MutationKind>>,
}

/// Releases a kind's in-flight slot when the drain ends, however it ends.
struct InFlight<'a> {
  kinds: &'a Mutex<HashSet<MutationKind>>,
  kind: MutationKind,
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    if let Ok(mut kinds) = self.kinds.lock() {
      kinds.remove(&self.kind);
    }
  }
}

impl Replayer {
  pub fn new(queue: Arc<OfflineQueue>, sink: Arc<dyn MutationSink>) -> Self {
    Self {
      queue,
      sink,
      max_attempts: None,
      in_flight: Mutex::new(HashSet::new()),
    }
  }

  /// Dead-letter a record once it has failed this many times.
  pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
    self.max_attempts = max_attempts.filter(|n| *n > 0);
    self
  }

  pub fn is_draining(&self, kind: MutationKind) -> bool {
    self
      .in_flight
      .lock()
      .map(|kinds| kinds.contains(&kind))
      .unwrap_or(false)
  }

  fn begin(&self, kind: MutationKind) -> Option<InFlight<'_>> {
    let mut kinds = self.in_flight.lock().ok()?;
    if !kinds.insert(kind) {
      return None;
    }
    Some(InFlight {
      kinds: &self.in_flight,
      kind,
    })
  }

  /// Submit every pending record of `kind` in order.
  ///
  /// A failed submission leaves the record pending and moves on to the
  /// next one. Only storage errors end the pass early.
  pub async fn drain(&self, kind: MutationKind) -> StoreResult<DrainOutcome> {
    let Some(_in_flight) = self.begin(kind) else {
      debug!(%kind, "Drain already running, coalescing wake");
      return Ok(DrainOutcome::AlreadyRunning);
    };

    let pending = self.queue.list_pending(kind)?;
    let mut report = DrainReport::default();

    for mutation in pending {
      match self.sink.submit(&mutation).await {
        Ok(()) => {
          report.submitted += 1;
          if !self.queue.mark_synced(&mutation)? {
            debug!(%kind, id = %mutation.id, "Record changed while in flight, newer version stays pending");
          }
        }
        Err(e) => {
          let Some(attempts) = self.queue.record_failure(&mutation)? else {
            debug!(%kind, id = %mutation.id, error = %e, "Submission failed for a record changed or removed meanwhile");
            report.superseded += 1;
            continue;
          };
          debug!(%kind, id = %mutation.id, attempts, error = %e, "Submission failed");

          if !self.max_attempts.is_some_and(|max| attempts >= max) {
            report.retained += 1;
          } else if self.queue.dead_letter(
            QueuedMutation {
              attempts,
              ..mutation
            },
            e.to_string(),
          )? {
            report.dead_lettered += 1;
          } else {
            report.superseded += 1;
          }
        }
      }
    }

    info!(
      %kind,
      submitted = report.submitted,
      retained = report.retained,
      dead_lettered = report.dead_lettered,
      superseded = report.superseded,
      "Drain finished"
    );
    Ok(DrainOutcome::Completed(report))
  }

  /// Dispatch a wake to its kind's drain. Unknown tags are ignored.
  pub async fn handle_wake(&self, tag: &str) -> Option<StoreResult<DrainOutcome>> {
    let Some(tag) = SyncTag::parse(tag) else {
      debug!(tag, "Ignoring unknown sync tag");
      return None;
    };
    Some(self.drain(tag.kind()).await)
  }

  /// Drain every kind concurrently, as on app foreground.
  pub async fn drain_all(&self) -> Vec<(MutationKind, StoreResult<DrainOutcome>)> {
    let drains = MutationKind::ALL.map(|kind| async move { (kind, self.drain(kind).await) });
    futures::future::join_all(drains).await
  }

  /// Consume wakes until the channel closes, then wait for running drains.
  pub async fn run(self: Arc<Self>, mut wakes: mpsc::UnboundedReceiver<SyncTag>) {
    let mut drains = JoinSet::new();

    while let Some(tag) = wakes.recv().await {
      if self.is_draining(tag.kind()) {
        debug!(%tag, "Drain already running, coalescing wake");
        continue;
      }
      debug!(%tag, "Sync wake");
      let replayer = Arc::clone(&self);
      drains.spawn(async move {
        if let Err(e) = replayer.drain(tag.kind()).await {
          warn!(%tag, error = %e, "Drain aborted");
        }
      });

      // Reap finished drains so the set doesn't grow across a long session
      while drains.try_join_next().is_some() {}
    }

    while drains.join_next().await.is_some() {}
  }
}
