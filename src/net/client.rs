//! HTTP transport used for reads, connectivity probes and mutation submission.

use futures::future::{BoxFuture, FutureExt};
use reqwest::Method;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::error::FetchError;
use super::types::{Request, Response};
use crate::config::ServerConfig;
use crate::store::{MutationKind, QueuedMutation};

/// Anything that can turn a [`Request`] into a [`Response`].
///
/// `Ok` means the server answered, whatever the status. `Err` means no answer.
pub trait Network: Send + Sync {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>>;

  /// Whether the server can be reached right now.
  fn probe<'a>(&'a self, path: &'a str) -> BoxFuture<'a, bool> {
    async move {
      let request = Request::get(path);
      self.fetch(&request).await.is_ok()
    }
    .boxed()
  }
}

/// Destination for queued mutations during a sync drain.
pub trait MutationSink: Send + Sync {
  fn submit<'a>(&'a self, mutation: &'a QueuedMutation) -> BoxFuture<'a, Result<(), FetchError>>;
}

/// Endpoint accepting writes of `kind`.
pub fn submission_path(kind: MutationKind) -> &'static str {
  match kind {
    MutationKind::Task => "/api/tasks",
    MutationKind::Asset => "/api/assets",
    MutationKind::Booking => "/api/bookings",
  }
}

/// reqwest-backed client for the household API.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpNetwork {
  pub fn new(config: &ServerConfig, token: Option<String>) -> Result<Self, FetchError> {
    let base_url = Url::parse(&config.base_url)?;
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()?;

    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  /// Absolute URL for a request target, under the base URL's path.
  pub fn url_for(&self, request: &Request) -> Result<Url, FetchError> {
    let mut url = self.base_url.clone();
    let path = format!(
      "{}/{}",
      self.base_url.path().trim_end_matches('/'),
      request.path.trim_start_matches('/')
    );
    url.set_path(&path);
    url.set_query(request.query.as_deref());
    url.set_fragment(None);

    if url.origin() != self.base_url.origin() {
      return Err(FetchError::InvalidUrl(format!(
        "{} leaves {}",
        request.target(),
        self.base_url
      )));
    }
    Ok(url)
  }

  async fn send(&self, request: &Request) -> Result<Response, FetchError> {
    let url = self.url_for(request)?;
    debug!(method = %request.method, %url, "Sending request");

    let mut builder = self.client.request(request.method.clone(), url);
    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }
    if let Some(body) = &request.body {
      builder = builder
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body.clone());
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await?.to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

impl Network for HttpNetwork {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>> {
    self.send(request).boxed()
  }
}

impl MutationSink for HttpNetwork {
  fn submit<'a>(&'a self, mutation: &'a QueuedMutation) -> BoxFuture<'a, Result<(), FetchError>> {
    async move {
      let body = mutation
        .payload
        .body()
        .map_err(|e| FetchError::Encoding(e.to_string()))?;
      let request = Request::new(Method::POST, submission_path(mutation.kind()))
        .with_json_body(&body)
        .map_err(|e| FetchError::Encoding(e.to_string()))?;

      let response = self.send(&request).await?;
      if response.is_ok() {
        Ok(())
      } else {
        Err(FetchError::from_status(
          response.status,
          &String::from_utf8_lossy(&response.body),
        ))
      }
    }
    .boxed()
  }
}
