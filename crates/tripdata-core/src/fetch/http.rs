//! [`Fetcher`] over HTTP(S) with `reqwest`.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use snafu::prelude::*;

use super::{FetchError, Fetcher};

/// Error building the HTTP client.
#[derive(Debug, Snafu)]
#[snafu(display("Failed to build HTTP client: {source}"))]
pub struct HttpClientError {
    source: reqwest::Error,
}

/// Fetches artifacts over HTTP.
///
/// `404 Not Found` maps to [`FetchError::NotFound`]; every other failure
/// (non-success status, connection error, truncated body) maps to
/// [`FetchError::Transport`].
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Build a fetcher with a fresh connection pool.
    pub fn new() -> Result<Self, HttpClientError> {
        let client = Client::builder()
            .user_agent(concat!("tripdata/", env!("CARGO_PKG_VERSION")))
            .build()
            .context(HttpClientSnafu)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Transport {
                url: url.to_string(),
                message: format!("HTTP {status}"),
            });
        }

        response.bytes().await.map_err(|e| FetchError::Transport {
            url: url.to_string(),
            message: format!("failed to read body: {e}"),
        })
    }
}
