//! Network access behind injectable traits.

mod client;
mod error;
mod types;

pub use client::{HttpNetwork, MutationSink, Network};
pub use error::FetchError;
pub use types::{Request, Response};
