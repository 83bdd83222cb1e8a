use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  /// The request never produced a response (offline, DNS, refused, timeout).
  #[error("Network error: {0}")]
  Network(String),

  #[error("Invalid URL: {0}")]
  InvalidUrl(String),

  #[error("Could not encode request body: {0}")]
  Encoding(String),

  /// The server answered with a non-success status.
  #[error("Server returned {status}: {body}")]
  Status { status: u16, body: String },
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl FetchError {
  pub fn from_status(status: u16, body: &str) -> Self {
    let body = if body.len() <= MAX_ERROR_BODY_LENGTH {
      body.to_string()
    } else {
      let mut end = MAX_ERROR_BODY_LENGTH;
      while !body.is_char_boundary(end) {
        end -= 1;
      }
      format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    };
    FetchError::Status { status, body }
  }
}

impl From<reqwest::Error> for FetchError {
  fn from(e: reqwest::Error) -> Self {
    FetchError::Network(e.to_string())
  }
}

impl From<url::ParseError> for FetchError {
  fn from(e: url::ParseError) -> Self {
    FetchError::InvalidUrl(e.to_string())
  }
}
