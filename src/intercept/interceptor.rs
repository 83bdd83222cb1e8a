//! Request interceptor applying the per-route caching discipline.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::partitions::{CachePartitions, PartitionRole, ResponseStore};
use super::strategy::{Router, Strategy};
use crate::clock::Clock;
use crate::net::{FetchError, Network, Request, Response};
use crate::store::StoreResult;

/// Where an intercepted response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh from the network
  Network,
  /// From a cache partition
  Cache,
  /// Synthesized empty listing for a critical API path
  OfflinePlaceholder,
}

/// Outcome of intercepting one request.
#[derive(Debug)]
pub struct Interception {
  pub response: Response,
  pub source: ResponseSource,
  /// Background refresh started for a stale-while-revalidate hit
  pub revalidation: Option<JoinHandle<()>>,
}

impl Interception {
  fn new(response: Response, source: ResponseSource) -> Self {
    Self {
      response,
      source,
      revalidation: None,
    }
  }
}

/// Sits between the application and the network, serving and refreshing
/// the response cache partitions.
pub struct Interceptor {
  network: Arc<dyn Network>,
  store: Arc<dyn ResponseStore>,
  partitions: CachePartitions,
  router: Router,
  clock: Arc<dyn Clock>,
}

impl Interceptor {
  pub fn new(
    network: Arc<dyn Network>,
    store: Arc<dyn ResponseStore>,
    partitions: CachePartitions,
    router: Router,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      network,
      store,
      partitions,
      router,
      clock,
    }
  }

  /// Pre-cache every static asset. Returns how many were stored.
  pub async fn install(&self) -> usize {
    let partition = self.partitions.name(PartitionRole::Static).to_string();
    let mut stored = 0;

    for path in self.router.static_assets() {
      let request = Request::get(path);
      match self.network.fetch(&request).await {
        Ok(response) if response.is_ok() => {
          if store_response(self.store.as_ref(), &partition, &request, &response, self.clock.as_ref()) {
            stored += 1;
          }
        }
        Ok(response) => warn!(path, status = response.status, "Static asset not pre-cached"),
        Err(e) => warn!(path, error = %e, "Static asset not pre-cached"),
      }
    }

    info!(stored, partition = %partition, "Install finished");
    stored
  }

  /// Delete every partition that does not belong to the current version.
  pub fn activate(&self) -> StoreResult<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.store.partition_names()? {
      if self.partitions.is_current(&name) {
        continue;
      }
      let removed = self.store.delete_partition(&name)?;
      info!(partition = %name, removed, "Deleted outdated cache partition");
      deleted.push(name);
    }
    Ok(deleted)
  }

  /// Serve `request` according to its route.
  pub async fn handle(&self, request: Request) -> Result<Interception, FetchError> {
    let strategy = self.router.classify(&request);
    debug!(url = %request.target(), ?strategy, "Intercepting request");

    match strategy {
      Strategy::Passthrough => {
        let response = self.network.fetch(&request).await?;
        Ok(Interception::new(response, ResponseSource::Network))
      }
      Strategy::NetworkFirst => self.network_first(request).await,
      Strategy::CacheFirst => self.cache_first(request).await,
      Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
    }
  }

  /// Network, then the last good cached copy, then the offline placeholder
  /// for critical listings.
  async fn network_first(&self, request: Request) -> Result<Interception, FetchError> {
    let partition = self.partitions.name(PartitionRole::Api);

    let error = match self.network.fetch(&request).await {
      Ok(response) => {
        if response.is_ok() {
          store_response(self.store.as_ref(), partition, &request, &response, self.clock.as_ref());
        }
        return Ok(Interception::new(response, ResponseSource::Network));
      }
      Err(e) => e,
    };

    if let Some(cached) = self.lookup(partition, &request) {
      debug!(url = %request.target(), error = %error, "Network failed, serving cached API response");
      return Ok(Interception::new(cached, ResponseSource::Cache));
    }

    if self.router.is_critical(&request.path) {
      info!(url = %request.target(), "Offline with nothing cached, serving placeholder");
      return Ok(Interception::new(
        Response::offline_placeholder(),
        ResponseSource::OfflinePlaceholder,
      ));
    }

    Err(error)
  }

  /// Cached copy, then network; navigations fall back to the cached root page.
  async fn cache_first(&self, request: Request) -> Result<Interception, FetchError> {
    let partition = self.partitions.name(PartitionRole::Static);

    if let Some(cached) = self.lookup(partition, &request) {
      return Ok(Interception::new(cached, ResponseSource::Cache));
    }

    match self.network.fetch(&request).await {
      Ok(response) => {
        if response.is_ok() {
          store_response(self.store.as_ref(), partition, &request, &response, self.clock.as_ref());
        }
        Ok(Interception::new(response, ResponseSource::Network))
      }
      Err(error) => {
        if request.navigate {
          if let Some(root) = self.lookup(partition, &Request::get("/")) {
            debug!(url = %request.target(), "Serving cached root page for failed navigation");
            return Ok(Interception::new(root, ResponseSource::Cache));
          }
        }
        Err(error)
      }
    }
  }

  /// Cached copy now with a background refresh, or wait on the network.
  async fn stale_while_revalidate(&self, request: Request) -> Result<Interception, FetchError> {
    let partition = self.partitions.name(PartitionRole::Dynamic).to_string();

    if let Some(cached) = self.lookup(&partition, &request) {
      let network = Arc::clone(&self.network);
      let store = Arc::clone(&self.store);
      let clock = Arc::clone(&self.clock);

      let revalidation = tokio::spawn(async move {
        match network.fetch(&request).await {
          Ok(response) if response.is_ok() => {
            store_response(store.as_ref(), &partition, &request, &response, clock.as_ref());
          }
          Ok(response) => {
            debug!(url = %request.target(), status = response.status, "Revalidation kept cached copy");
          }
          Err(e) => {
            debug!(url = %request.target(), error = %e, "Revalidation failed");
          }
        }
      });

      return Ok(Interception {
        response: cached,
        source: ResponseSource::Cache,
        revalidation: Some(revalidation),
      });
    }

    let response = self.network.fetch(&request).await?;
    if response.is_ok() {
      store_response(self.store.as_ref(), &partition, &request, &response, self.clock.as_ref());
    }
    Ok(Interception::new(response, ResponseSource::Network))
  }

  /// Cache read where a storage failure counts as a miss.
  fn lookup(&self, partition: &str, request: &Request) -> Option<Response> {
    match self.store.get(partition, request) {
      Ok(Some(cached)) => {
        debug!(partition, url = %request.target(), stored_at = %cached.stored_at, "Cache hit");
        Some(cached.response)
      }
      Ok(None) => None,
      Err(e) => {
        warn!(partition, url = %request.target(), error = %e, "Cache read failed");
        None
      }
    }
  }
}

/// Write a successful response. Storage failures are logged, not returned.
fn store_response(
  store: &dyn ResponseStore,
  partition: &str,
  request: &Request,
  response: &Response,
  clock: &dyn Clock,
) -> bool {
  match store.put(partition, request, response, clock.now()) {
    Ok(()) => true,
    Err(e) => {
      warn!(partition, url = %request.target(), error = %e, "Cache write failed");
      false
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::SystemClock;
  use crate::config::{CacheConfig, InterceptConfig};
  use crate::db::StoreLocation;
  use crate::intercept::partitions::SqliteResponseStore;
  use futures::future::{BoxFuture, FutureExt};
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  /// Network whose answers are scripted per target; unknown targets fail.
  #[derive(Default)]
  struct FakeNetwork {
    routes: Mutex<HashMap<String, Result<Response, FetchError>>>,
    calls: AtomicUsize,
  }

  impl FakeNetwork {
    fn respond(&self, target: &str, result: Result<Response, FetchError>) {
      self.routes.lock().unwrap().insert(target.to_string(), result);
    }

    fn go_offline(&self) {
      self.routes.lock().unwrap().clear();
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  impl Network for FakeNetwork {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let result = self
        .routes
        .lock()
        .unwrap()
        .get(&request.target())
        .cloned()
        .unwrap_or_else(|| Err(FetchError::Network("connection refused".into())));
      async move { result }.boxed()
    }
  }

  fn setup(version: &str) -> (Interceptor, Arc<FakeNetwork>, Arc<SqliteResponseStore>) {
    let network = Arc::new(FakeNetwork::default());
    let store = Arc::new(SqliteResponseStore::open(&StoreLocation::Memory).unwrap());
    let cache = CacheConfig {
      static_assets: vec!["/".into(), "/manifest.json".into()],
      ..CacheConfig::default()
    };
    let interceptor = Interceptor::new(
      network.clone(),
      store.clone(),
      CachePartitions::for_version(version),
      Router::new(&InterceptConfig::default(), &cache),
      Arc::new(SystemClock),
    );
    (interceptor, network, store)
  }

  fn tasks_body(titles: &[&str]) -> Response {
    Response::json(200, &serde_json::json!({ "data": titles }))
  }

  #[tokio::test]
  async fn test_network_first_caches_and_falls_back() {
    let (interceptor, network, _) = setup("v1");
    network.respond("/api/tasks", Ok(tasks_body(&["Replace filter"])));

    let online = interceptor.handle(Request::get("/api/tasks")).await.unwrap();
    assert_eq!(online.source, ResponseSource::Network);

    network.go_offline();
    let offline = interceptor.handle(Request::get("/api/tasks")).await.unwrap();
    assert_eq!(offline.source, ResponseSource::Cache);
    assert_eq!(offline.response, tasks_body(&["Replace filter"]));
  }

  #[tokio::test]
  async fn test_critical_path_without_cache_gets_placeholder() {
    let (interceptor, _, _) = setup("v1");

    let result = interceptor.handle(Request::get("/api/tasks")).await.unwrap();
    assert_eq!(result.source, ResponseSource::OfflinePlaceholder);
    assert_eq!(result.response.status, 200);

    let body = result.response.body_json().unwrap();
    assert_eq!(body["offline"], true);
    assert_eq!(body["data"], serde_json::json!([]));
    assert!(body["message"].as_str().is_some());
  }

  #[tokio::test]
  async fn test_non_critical_path_without_cache_propagates_error() {
    let (interceptor, _, _) = setup("v1");

    let result = interceptor.handle(Request::get("/api/bookings")).await;
    assert!(matches!(result, Err(FetchError::Network(_))));
  }

  #[tokio::test]
  async fn test_exact_request_match_for_fallback() {
    let (interceptor, network, _) = setup("v1");
    network.respond("/api/tasks?status=open", Ok(tasks_body(&["open"])));
    interceptor
      .handle(Request::get("/api/tasks?status=open"))
      .await
      .unwrap();

    network.go_offline();
    // Different query, nothing cached for it: placeholder, not the other listing
    let result = interceptor
      .handle(Request::get("/api/tasks?status=done"))
      .await
      .unwrap();
    assert_eq!(result.source, ResponseSource::OfflinePlaceholder);
  }

  #[tokio::test]
  async fn test_non_ok_response_never_overwrites_cache() {
    let (interceptor, network, _) = setup("v1");
    network.respond("/api/assets", Ok(tasks_body(&["Furnace"])));
    interceptor.handle(Request::get("/api/assets")).await.unwrap();

    network.respond("/api/assets", Ok(Response::new(503, "maintenance")));
    let degraded = interceptor.handle(Request::get("/api/assets")).await.unwrap();
    assert_eq!(degraded.source, ResponseSource::Network);
    assert_eq!(degraded.response.status, 503);

    network.go_offline();
    let offline = interceptor.handle(Request::get("/api/assets")).await.unwrap();
    assert_eq!(offline.source, ResponseSource::Cache);
    assert_eq!(offline.response, tasks_body(&["Furnace"]));
  }

  #[tokio::test]
  async fn test_cache_first_serves_without_network() {
    let (interceptor, network, _) = setup("v1");
    network.respond("/manifest.json", Ok(Response::new(200, "{}")));

    let first = interceptor.handle(Request::get("/manifest.json")).await.unwrap();
    assert_eq!(first.source, ResponseSource::Network);
    assert_eq!(network.calls(), 1);

    let second = interceptor.handle(Request::get("/manifest.json")).await.unwrap();
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(network.calls(), 1);
  }

  #[tokio::test]
  async fn test_failed_navigation_falls_back_to_root() {
    let (interceptor, network, _) = setup("v1");
    network.respond("/", Ok(Response::new(200, "<html>shell</html>")));
    assert_eq!(interceptor.install().await, 1);

    let navigation = interceptor
      .handle(Request::get("/manifest.json").navigation())
      .await
      .unwrap();
    assert_eq!(navigation.source, ResponseSource::Cache);
    assert_eq!(navigation.response.body, b"<html>shell</html>".to_vec());

    // Not a navigation: the failure surfaces
    let asset = interceptor.handle(Request::get("/manifest.json")).await;
    assert!(asset.is_err());
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_refreshes_in_background() {
    let (interceptor, network, _) = setup("v1");
    network.respond("/assets/42", Ok(Response::new(200, "old")));

    let miss = interceptor.handle(Request::get("/assets/42")).await.unwrap();
    assert_eq!(miss.source, ResponseSource::Network);
    assert!(miss.revalidation.is_none());

    network.respond("/assets/42", Ok(Response::new(200, "new")));
    let hit = interceptor.handle(Request::get("/assets/42")).await.unwrap();
    assert_eq!(hit.source, ResponseSource::Cache);
    assert_eq!(hit.response.body, b"old".to_vec());
    hit.revalidation.unwrap().await.unwrap();

    network.go_offline();
    let refreshed = interceptor.handle(Request::get("/assets/42")).await.unwrap();
    assert_eq!(refreshed.response.body, b"new".to_vec());
    refreshed.revalidation.unwrap().await.unwrap();
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_miss_waits_on_network_error() {
    let (interceptor, _, _) = setup("v1");
    let result = interceptor.handle(Request::get("/providers")).await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_writes_pass_through_uncached() {
    let (interceptor, network, store) = setup("v1");
    let request = Request::new(reqwest::Method::POST, "/api/tasks");
    network.respond("/api/tasks", Ok(Response::new(201, "created")));

    let result = interceptor.handle(request.clone()).await.unwrap();
    assert_eq!(result.response.status, 201);
    assert!(store.partition_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_activate_drops_old_versions() {
    let (old, network, store) = setup("v1");
    network.respond("/", Ok(Response::new(200, "shell")));
    network.respond("/api/tasks", Ok(tasks_body(&[])));
    old.install().await;
    old.handle(Request::get("/api/tasks")).await.unwrap();

    let new = Interceptor::new(
      network.clone(),
      store.clone(),
      CachePartitions::for_version("v2"),
      Router::new(&InterceptConfig::default(), &CacheConfig::default()),
      Arc::new(SystemClock),
    );
    new.install().await;

    let mut deleted = new.activate().unwrap();
    deleted.sort();
    assert_eq!(deleted, vec!["hearthkeep-api-v1", "hearthkeep-static-v1"]);
    assert_eq!(
      store.partition_names().unwrap(),
      vec!["hearthkeep-static-v2".to_string()]
    );
  }
}
