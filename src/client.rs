//! Client Fetcher
//!
//! Library side of the fetch protocol. A client knows the digest of the
//! bytes it needs and a list of source URLs; it asks the configured cache
//! servers first (forwarding the sources so a miss can be filled) and only
//! then downloads directly.
//!
//! Every attempt verifies the digest as it streams into the caller's sink.
//! Once any bytes have landed in the sink a failed attempt is final: the
//! caller gets `PartialWrite` and must retry from scratch with a fresh
//! sink, because mixing bytes from two sources can never verify.

use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::error::{Error, Result};
use crate::hashing::{Algorithm, Hasher};
use crate::handler::SOURCE_URLS_HEADER;
use crate::sourcelist;

/// Environment variable holding the RFC 8941 list of cache server base URLs.
pub const SERVER_ENV: &str = "FETCHURL_SERVER";

pub struct Fetcher {
    client: reqwest::Client,
    servers: Vec<String>,
}

impl Fetcher {
    pub fn new(client: reqwest::Client, servers: Vec<String>) -> Self {
        Self { client, servers }
    }

    /// Build a fetcher whose server list comes from `FETCHURL_SERVER`.
    /// Empty or absent disables server mode.
    pub fn from_env(client: reqwest::Client) -> Self {
        let servers = match std::env::var(SERVER_ENV) {
            Ok(value) if !value.is_empty() => sourcelist::decode(&value),
            _ => Vec::new(),
        };
        Self::new(client, servers)
    }

    /// Configured cache servers.
    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Fetch content by digest into `out`.
    ///
    /// Servers are tried in order, then the direct source URLs. See the
    /// module docs for the partial-write contract.
    pub async fn fetch<W>(
        &self,
        algo_name: &str,
        hash: &str,
        urls: &[String],
        out: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let algo = Algorithm::parse(algo_name)?;

        let mut written: u64 = 0;
        let mut last_err: Option<Error> = None;

        for server in &self.servers {
            let base = server.trim_end_matches('/');
            let url = format!("{base}/api/fetchurl/{algo}/{hash}");
            let mut request = self.client.get(&url);
            if !urls.is_empty() {
                request = request.header(SOURCE_URLS_HEADER, sourcelist::encode(urls));
            }

            match self.attempt(request, algo, hash, out, &mut written).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(server = %server, error = %e, "failed to fetch from server");
                    if written > 0 {
                        return Err(e.into_partial_write());
                    }
                    last_err = Some(e);
                }
            }
        }

        for url in urls {
            let request = self.client.get(url);
            match self.attempt(request, algo, hash, out, &mut written).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(url = %url, error = %e, "failed to fetch from source");
                    if written > 0 {
                        return Err(e.into_partial_write());
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(Error::AllSourcesFailed {
            source: Box::new(last_err.unwrap_or(Error::NotFound {
                algo: algo.to_string(),
                hash: hash.to_string(),
            })),
        })
    }

    /// One download attempt: tee the body into `out` and a hasher, then
    /// compare digests.
    async fn attempt<W>(
        &self,
        request: reqwest::RequestBuilder,
        algo: Algorithm,
        expected_hash: &str,
        out: &mut W,
        written: &mut u64,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let resp = request.send().await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(Error::HttpStatus {
                code: resp.status().as_u16(),
            });
        }

        let mut hasher = Hasher::new(algo);
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            *written += chunk.len() as u64;
            hasher.update(&chunk);
        }
        out.flush().await?;

        let actual = hasher.finish();
        if actual != expected_hash {
            return Err(Error::HashMismatch {
                expected: expected_hash.to_string(),
                actual,
            });
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
