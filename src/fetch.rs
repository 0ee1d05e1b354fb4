//! Fetch Service
//!
//! Resolves a digest to a byte stream by consulting upstream repositories
//! first and direct source URLs second. No hashing happens here: streaming
//! starts at the first byte received and verification is the caller's
//! responsibility.

use std::sync::Arc;

use futures::TryStreamExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::hashing::Algorithm;
use crate::repository::{RemoteContent, Repository};

pub struct FetchService {
    upstreams: Vec<Arc<dyn Repository>>,
    client: reqwest::Client,
}

impl FetchService {
    pub fn new(upstreams: Vec<Arc<dyn Repository>>, client: reqwest::Client) -> Self {
        Self { upstreams, client }
    }

    /// Resolve `(algo, hash)` via upstreams, then via `source_urls`.
    ///
    /// Sources must commit to a `Content-Length`; a 200 without one is
    /// rejected and the next source tried. Fails with `NotFound` when
    /// nothing yields the content.
    pub async fn fetch(
        &self,
        algo: Algorithm,
        hash: &str,
        source_urls: &[String],
    ) -> Result<RemoteContent> {
        for upstream in &self.upstreams {
            match upstream.fetch(algo, hash).await {
                Ok(Some(content)) => return Ok(content),
                Ok(None) => {}
                Err(e) => warn!(algo = %algo, hash, error = %e, "upstream fetch failed"),
            }
        }

        for url in source_urls {
            match self.fetch_source(url).await {
                Ok(content) => return Ok(content),
                Err(e) => debug!(url, error = %e, "source fetch failed"),
            }
        }

        Err(Error::NotFound {
            algo: algo.to_string(),
            hash: hash.to_string(),
        })
    }

    async fn fetch_source(&self, url: &str) -> Result<RemoteContent> {
        let resp = self.client.get(url).send().await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(Error::HttpStatus {
                code: resp.status().as_u16(),
            });
        }
        let len = resp
            .content_length()
            .ok_or_else(|| Error::MissingContentLength {
                url: url.to_string(),
            })?;

        let stream = resp
            .bytes_stream()
            .map_err(|e| std::io::Error::other(e.to_string()));
        Ok(RemoteContent {
            stream: Box::pin(stream),
            len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_upstreams_no_sources_is_not_found() {
        let service = FetchService::new(Vec::new(), reqwest::Client::new());
        let err = service
            .fetch(Algorithm::Sha256, "abc", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_source_is_not_found() {
        let service = FetchService::new(Vec::new(), reqwest::Client::new());
        let err = service
            .fetch(
                Algorithm::Sha256,
                "abc",
                &["http://127.0.0.1:1/content".to_string()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
