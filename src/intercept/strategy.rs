//! Per-request choice of caching discipline.

use reqwest::Method;
use std::collections::{BTreeSet, HashSet};

use crate::config::{CacheConfig, InterceptConfig};
use crate::net::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Never cached (writes and other non-GET requests)
  Passthrough,
  /// API routes: network, then cached copy, then offline placeholder
  NetworkFirst,
  /// Pre-enumerated static assets
  CacheFirst,
  /// Everything else
  StaleWhileRevalidate,
}

/// Classifies requests. Rules are checked in order and the first match wins.
#[derive(Debug, Clone)]
pub struct Router {
  api_prefix: String,
  static_assets: HashSet<String>,
  critical_paths: BTreeSet<String>,
}

impl Router {
  pub fn new(intercept: &InterceptConfig, cache: &CacheConfig) -> Self {
    Self {
      api_prefix: intercept.api_prefix.clone(),
      static_assets: cache.static_assets.iter().cloned().collect(),
      critical_paths: intercept.critical_paths.clone(),
    }
  }

  pub fn classify(&self, request: &Request) -> Strategy {
    if request.method != Method::GET {
      return Strategy::Passthrough;
    }
    if request.path.starts_with(&self.api_prefix) {
      return Strategy::NetworkFirst;
    }
    if self.static_assets.contains(&request.path) {
      return Strategy::CacheFirst;
    }
    Strategy::StaleWhileRevalidate
  }

  /// Whether an API path gets the offline placeholder when nothing is cached.
  pub fn is_critical(&self, path: &str) -> bool {
    let path = path.trim_end_matches('/');
    self.critical_paths.contains(path)
  }

  pub fn static_assets(&self) -> impl Iterator<Item = &str> {
    self.static_assets.iter().map(String::as_str)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn router() -> Router {
    Router::new(&InterceptConfig::default(), &CacheConfig::default())
  }

  #[test]
  fn test_api_prefix_is_network_first() {
    assert_eq!(router().classify(&Request::get("/api/tasks")), Strategy::NetworkFirst);
    assert_eq!(
      router().classify(&Request::get("/api/bookings?upcoming=1")),
      Strategy::NetworkFirst
    );
  }

  #[test]
  fn test_static_asset_requires_exact_match() {
    let router = router();
    assert_eq!(router.classify(&Request::get("/manifest.json")), Strategy::CacheFirst);
    assert_eq!(router.classify(&Request::get("/")), Strategy::CacheFirst);
    assert_eq!(
      router.classify(&Request::get("/manifest.json.map")),
      Strategy::StaleWhileRevalidate
    );
  }

  #[test]
  fn test_other_paths_are_stale_while_revalidate() {
    assert_eq!(
      router().classify(&Request::get("/assets/42")),
      Strategy::StaleWhileRevalidate
    );
  }

  #[test]
  fn test_non_get_passes_through() {
    let request = Request::new(Method::POST, "/api/tasks");
    assert_eq!(router().classify(&request), Strategy::Passthrough);
  }

  #[test]
  fn test_critical_paths() {
    let router = router();
    assert!(router.is_critical("/api/tasks"));
    assert!(router.is_critical("/api/assets/"));
    assert!(!router.is_critical("/api/bookings"));
    assert!(!router.is_critical("/api/tasks/17"));
  }
}
