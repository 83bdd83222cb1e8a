//! Transport-neutral request and response values.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Message shown by the UI while a critical listing is unavailable.
pub const OFFLINE_MESSAGE: &str =
  "You are offline. Showing an empty list until the connection is restored.";

/// An outgoing request as seen by the interceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  /// Path beginning with `/`
  pub path: String,
  pub query: Option<String>,
  /// Top-level page load, as opposed to a subresource or data request
  pub navigate: bool,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, target: &str) -> Self {
    let (path, query) = match target.split_once('?') {
      Some((path, query)) if !query.is_empty() => (path, Some(query.to_string())),
      Some((path, _)) => (path, None),
      None => (target, None),
    };
    // Exactly one leading slash; `//host/...` would otherwise read as another origin
    let path = format!("/{}", path.trim_start_matches('/'));

    Self {
      method,
      path,
      query,
      navigate: false,
      body: None,
    }
  }

  pub fn get(target: &str) -> Self {
    Self::new(Method::GET, target)
  }

  /// Mark as a page navigation.
  pub fn navigation(mut self) -> Self {
    self.navigate = true;
    self
  }

  pub fn with_json_body(mut self, body: &serde_json::Value) -> serde_json::Result<Self> {
    self.body = Some(serde_json::to_vec(body)?);
    Ok(self)
  }

  /// Path plus query, as sent on the wire.
  pub fn target(&self) -> String {
    match &self.query {
      Some(query) => format!("{}?{}", self.path, query),
      None => self.path.clone(),
    }
  }

  /// Stable key identifying this exact request in a response cache.
  pub fn cache_key(&self) -> String {
    let input = format!("{} {}", self.method.as_str(), self.target());

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response as stored in and served from cache partitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    Self {
      headers: vec![("content-type".to_string(), "application/json".to_string())],
      ..Self::new(status, value.to_string())
    }
  }

  /// Success-status stand-in for a critical listing with nothing cached.
  pub fn offline_placeholder() -> Self {
    Self::json(
      200,
      &serde_json::json!({
        "offline": true,
        "data": [],
        "message": OFFLINE_MESSAGE,
      }),
    )
  }

  /// Whether the status is in the 2xx range.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(key, _)| key.eq_ignore_ascii_case(name))
      .map(|(_, value)| value.as_str())
  }

  pub fn body_json(&self) -> serde_json::Result<serde_json::Value> {
    serde_json::from_slice(&self.body)
  }
}
