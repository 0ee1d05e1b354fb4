//! Upstream Repository
//!
//! Read view onto another fetchurl server. Servers chain: an upstream is
//! just another cache to the one below it, reached as
//! `GET/HEAD {base}/fetch/{algo}/{hash}`. Anything other than a clean 200
//! is reported as absent so the fetch service moves on to the next tier.

use async_trait::async_trait;
use futures::TryStreamExt;
use tracing::debug;

use crate::error::Result;
use crate::hashing::Algorithm;
use crate::repository::{RemoteContent, Repository};

pub struct UpstreamRepository {
    base_url: String,
    client: reqwest::Client,
}

impl UpstreamRepository {
    pub fn new(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Base URL of the upstream server (no trailing slash).
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn content_url(&self, algo: Algorithm, hash: &str) -> String {
        format!("{}/fetch/{}/{}", self.base_url, algo, hash)
    }
}

#[async_trait]
impl Repository for UpstreamRepository {
    async fn exists(&self, algo: Algorithm, hash: &str) -> Result<bool> {
        let url = self.content_url(algo, hash);
        match self.client.head(&url).send().await {
            Ok(resp) => Ok(resp.status() == reqwest::StatusCode::OK),
            Err(e) => {
                debug!(url, error = %e, "upstream HEAD failed");
                Ok(false)
            }
        }
    }

    async fn fetch(&self, algo: Algorithm, hash: &str) -> Result<Option<RemoteContent>> {
        let url = self.content_url(algo, hash);
        let resp = match self.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(url, error = %e, "upstream GET failed");
                return Ok(None);
            }
        };

        if resp.status() != reqwest::StatusCode::OK {
            debug!(url, status = %resp.status(), "upstream does not hold content");
            return Ok(None);
        }
        let Some(len) = resp.content_length() else {
            debug!(url, "upstream response without Content-Length");
            return Ok(None);
        };

        let stream = resp
            .bytes_stream()
            .map_err(|e| std::io::Error::other(e.to_string()));
        Ok(Some(RemoteContent {
            stream: Box::pin(stream),
            len,
        }))
    }
}
