//! Best-effort background-sync registration and wake delivery.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::tags::SyncTag;
use crate::net::Network;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
  #[error("Background sync registration failed: {0}")]
  Registration(String),

  #[error("Nobody is listening for sync wakes")]
  Closed,
}

/// A facility that remembers sync tags and wakes us when connectivity returns.
pub trait SyncPlatform: Send + Sync {
  fn register(&self, tag: SyncTag) -> Result<(), SyncError>;
}

/// Entry point for requesting a replay.
///
/// Without a platform every request is a silent no-op: sync then only
/// happens when the app is open and drains explicitly.
#[derive(Clone, Default)]
pub struct BackgroundSync {
  platform: Option<Arc<dyn SyncPlatform>>,
}

impl BackgroundSync {
  pub fn new(platform: Option<Arc<dyn SyncPlatform>>) -> Self {
    Self { platform }
  }

  /// Ask to be woken for `tag`. Never fails.
  pub fn request_sync(&self, tag: SyncTag) {
    match &self.platform {
      None => debug!(%tag, "Background sync unsupported, skipping registration"),
      Some(platform) => match platform.register(tag) {
        Ok(()) => debug!(%tag, "Background sync registered"),
        Err(e) => warn!(%tag, error = %e, "Background sync registration failed"),
      },
    }
  }
}

/// In-process platform: holds registrations and emits them as wake events.
pub struct LocalSyncPlatform {
  registered: Mutex<BTreeSet<SyncTag>>,
  wakes: mpsc::UnboundedSender<SyncTag>,
}

impl LocalSyncPlatform {
  /// The receiver feeds [`super::Replayer::run`].
  pub fn new() -> (Self, mpsc::UnboundedReceiver<SyncTag>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let platform = Self {
      registered: Mutex::new(BTreeSet::new()),
      wakes: tx,
    };
    (platform, rx)
  }

  pub fn registered(&self) -> Vec<SyncTag> {
    match self.registered.lock() {
      Ok(set) => set.iter().copied().collect(),
      Err(_) => Vec::new(),
    }
  }

  /// Connectivity is back: fire and forget every registered tag.
  /// Returns how many wakes were sent.
  pub fn notify_online(&self) -> usize {
    let tags: Vec<SyncTag> = match self.registered.lock() {
      Ok(mut set) => std::mem::take(&mut *set).into_iter().collect(),
      Err(e) => {
        warn!(error = %e, "Sync registrations unavailable");
        return 0;
      }
    };

    tags.into_iter().filter(|tag| self.send(*tag)).count()
  }

  /// App came to the foreground: wake every tag, registered or not.
  pub fn wake_all(&self) -> usize {
    if let Ok(mut set) = self.registered.lock() {
      set.clear();
    }
    SyncTag::ALL.into_iter().filter(|tag| self.send(*tag)).count()
  }

  fn send(&self, tag: SyncTag) -> bool {
    match self.wakes.send(tag) {
      Ok(()) => true,
      Err(_) => {
        debug!(%tag, "Wake dropped, replayer stopped");
        false
      }
    }
  }
}

impl SyncPlatform for LocalSyncPlatform {
  fn register(&self, tag: SyncTag) -> Result<(), SyncError> {
    if self.wakes.is_closed() {
      return Err(SyncError::Closed);
    }
    self
      .registered
      .lock()
      .map_err(|e| SyncError::Registration(e.to_string()))?
      .insert(tag);
    Ok(())
  }
}

/// Tracks reachability between probes.
#[derive(Debug, Default)]
pub struct Connectivity {
  online: Option<bool>,
}

impl Connectivity {
  /// Record a probe result. True when this observation means we just came
  /// online (including the first observation).
  pub fn observe(&mut self, online: bool) -> bool {
    let came_online = online && self.online != Some(true);
    if self.online != Some(online) {
      info!(online, "Connectivity changed");
    }
    self.online = Some(online);
    came_online
  }
}

/// Probe the server every `interval` and fire pending wakes while reachable.
///
/// Tags registered while offline fire on the first probe after reconnect;
/// tags registered while online fire on the next probe. Runs until the task
/// is dropped.
pub async fn watch_connectivity(
  network: Arc<dyn Network>,
  probe_path: String,
  platform: Arc<LocalSyncPlatform>,
  interval: Duration,
) {
  let mut ticker = tokio::time::interval(interval);
  let mut connectivity = Connectivity::default();

  loop {
    ticker.tick().await;
    let online = network.probe(&probe_path).await;
    if connectivity.observe(online) {
      info!("Server reachable, firing registered sync wakes");
    }
    if online {
      let fired = platform.notify_online();
      if fired > 0 {
        debug!(fired, "Fired pending sync wakes");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::{FetchError, Request, Response};
  use futures::future::{BoxFuture, FutureExt};
  use std::collections::VecDeque;

  /// Answers from a script, then stays reachable.
  struct ScriptedNetwork {
    replies: Mutex<VecDeque<bool>>,
  }

  impl ScriptedNetwork {
    fn new(replies: &[bool]) -> Self {
      Self {
        replies: Mutex::new(replies.iter().copied().collect()),
      }
    }

    fn remaining(&self) -> usize {
      self.replies.lock().unwrap().len()
    }
  }

  impl Network for ScriptedNetwork {
    fn fetch<'a>(&'a self, _request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>> {
      let online = self.replies.lock().unwrap().pop_front().unwrap_or(true);
      async move {
        if online {
          Ok(Response::new(200, "ok"))
        } else {
          Err(FetchError::Network("offline".into()))
        }
      }
      .boxed()
    }
  }

  async fn next_wake(wakes: &mut mpsc::UnboundedReceiver<SyncTag>) -> Option<SyncTag> {
    tokio::time::timeout(Duration::from_secs(5), wakes.recv())
      .await
      .unwrap()
  }

  #[test]
  fn test_request_sync_without_platform_is_noop() {
    let sync = BackgroundSync::default();
    sync.request_sync(SyncTag::Tasks);
  }

  #[tokio::test]
  async fn test_registered_tags_fire_once_on_reconnect() {
    let (platform, mut wakes) = LocalSyncPlatform::new();
    let platform = Arc::new(platform);
    let sync = BackgroundSync::new(Some(platform.clone() as Arc<dyn SyncPlatform>));

    sync.request_sync(SyncTag::Tasks);
    sync.request_sync(SyncTag::Tasks);
    sync.request_sync(SyncTag::Bookings);
    assert_eq!(platform.registered(), vec![SyncTag::Tasks, SyncTag::Bookings]);

    assert_eq!(platform.notify_online(), 2);
    assert_eq!(wakes.recv().await, Some(SyncTag::Tasks));
    assert_eq!(wakes.recv().await, Some(SyncTag::Bookings));

    // Registrations are consumed by the wake
    assert_eq!(platform.notify_online(), 0);
    assert!(platform.registered().is_empty());
  }

  #[test]
  fn test_register_after_receiver_dropped_fails() {
    let (platform, wakes) = LocalSyncPlatform::new();
    drop(wakes);
    assert_eq!(platform.register(SyncTag::Assets), Err(SyncError::Closed));
  }

  #[tokio::test]
  async fn test_wake_all_sends_every_tag() {
    let (platform, mut wakes) = LocalSyncPlatform::new();
    assert_eq!(platform.wake_all(), 3);
    for tag in SyncTag::ALL {
      assert_eq!(wakes.recv().await, Some(tag));
    }
  }

  #[test]
  fn test_connectivity_reports_reconnects_only() {
    let mut connectivity = Connectivity::default();
    assert!(!connectivity.observe(false));
    assert!(connectivity.observe(true));
    assert!(!connectivity.observe(true));
    assert!(!connectivity.observe(false));
    assert!(connectivity.observe(true));
  }

  #[tokio::test]
  async fn test_watch_fires_on_reconnect_and_while_online() {
    let (platform, mut wakes) = LocalSyncPlatform::new();
    let platform = Arc::new(platform);
    platform.register(SyncTag::Tasks).unwrap();

    let network = Arc::new(ScriptedNetwork::new(&[false, false, true]));
    let watcher = tokio::spawn(watch_connectivity(
      network.clone(),
      "/".into(),
      platform.clone(),
      Duration::from_millis(5),
    ));

    // Held while offline, fired by the first reachable check
    assert_eq!(next_wake(&mut wakes).await, Some(SyncTag::Tasks));
    assert_eq!(network.remaining(), 0);

    // Already online: the next check fires it without a transition
    platform.register(SyncTag::Assets).unwrap();
    assert_eq!(next_wake(&mut wakes).await, Some(SyncTag::Assets));

    watcher.abort();
  }
}
