//! CAS HTTP Handler
//!
//! Serves `GET/HEAD /fetch/{algo}/{hash}` (and the client-facing
//! `/api/fetchurl/{algo}/{hash}` mount). Hits stream straight from disk
//! with immutable cache headers. Misses fetch from the configured upstreams
//! and the caller-advertised sources while streaming to the client, hashing
//! and persisting in one pass.
//!
//! Time-to-first-byte matters, so the response starts before verification
//! completes. Safety holds because a digest failure turns into an aborted
//! connection: the client sees a transport error, never a clean EOF on a
//! corrupt stream.

use std::sync::Arc;

use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::{Method, Request, Response, StatusCode};
use rand::seq::SliceRandom;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::hashing::{self, Algorithm, Hasher};
use crate::repository::{LocalStore, StoreWriter};
use crate::singleflight::{self, FillTable, Flight};
use crate::sourcelist;

/// Request header carrying the RFC 8941 list of source URLs.
pub const SOURCE_URLS_HEADER: &str = "X-Source-Urls";

/// Response body type used throughout the server.
pub type BoxedBody = BoxBody<Bytes, std::io::Error>;

/// Build a complete in-memory response body.
pub fn full_body(data: impl Into<Bytes>) -> BoxedBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Empty response body.
pub fn empty_body() -> BoxedBody {
    full_body(Bytes::new())
}

/// Plain-text error response.
pub fn text_response(status: StatusCode, message: &str) -> Response<BoxedBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(format!("{message}\n")))
        .unwrap_or_else(|_| Response::new(empty_body()))
}

/// CAS endpoint handler.
pub struct CasHandler {
    local: Arc<LocalStore>,
    client: reqwest::Client,
    upstreams: Vec<String>,
    fills: FillTable,
}

impl CasHandler {
    pub fn new(local: Arc<LocalStore>, client: reqwest::Client, upstreams: Vec<String>) -> Self {
        Self {
            local,
            client,
            upstreams: upstreams
                .into_iter()
                .map(|u| u.trim_end_matches('/').to_string())
                .collect(),
            fills: FillTable::new(),
        }
    }

    /// True if this request path is addressed to the CAS endpoint.
    pub fn matches(path: &str) -> bool {
        path.starts_with("/fetch/") || path.starts_with("/api/fetchurl/")
    }

    /// Serve one CAS request.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<BoxedBody> {
        let head = if req.method() == Method::GET {
            false
        } else if req.method() == Method::HEAD {
            true
        } else {
            return text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        };

        let Some((algo_raw, hash)) = parse_content_path(req.uri().path()) else {
            return text_response(
                StatusCode::BAD_REQUEST,
                "invalid path format, expected /fetch/{algo}/{hash}",
            );
        };
        let algo = match Algorithm::parse(&algo_raw) {
            Ok(algo) => algo,
            Err(_) => {
                return text_response(
                    StatusCode::BAD_REQUEST,
                    &format!("unsupported hash algorithm: {algo_raw}"),
                )
            }
        };
        if !hashing::is_valid_hex(algo, &hash) {
            return text_response(StatusCode::BAD_REQUEST, "malformed hash");
        }

        match self.local.exists(algo, &hash).await {
            Ok(true) => return self.serve_from_cache(algo, &hash, head).await,
            Ok(false) => {}
            Err(e) => {
                error!(error = %e, "failed to check cache existence");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error");
            }
        }

        // Cache miss. HEAD never triggers a fill.
        if head {
            return text_response(StatusCode::NOT_FOUND, "not found");
        }

        // Dynamic candidates: the RFC 8941 header plus the deprecated ?url=
        // query parameters, shuffled to spread load across mirrors.
        let mut candidates = parse_source_urls(&req);
        candidates.extend(parse_query_urls(&req));
        candidates.shuffle(&mut rand::thread_rng());

        // Configured upstreams are consulted first, as CAS URLs.
        let mut sources: Vec<String> = self
            .upstreams
            .iter()
            .map(|base| format!("{base}/api/fetchurl/{algo}/{hash}"))
            .collect();
        sources.extend(candidates.iter().cloned());

        if sources.is_empty() {
            return text_response(
                StatusCode::NOT_FOUND,
                "not found and no X-Source-Urls provided",
            );
        }

        match self.fills.join(&format!("{algo}:{hash}")) {
            Flight::Follower(outcome) => {
                debug!(algo = %algo, hash = %hash, "waiting on in-flight fill");
                if singleflight::wait(outcome).await {
                    self.serve_from_cache(algo, &hash, head).await
                } else {
                    text_response(StatusCode::BAD_GATEWAY, "failed to fetch")
                }
            }
            Flight::Leader(guard) => {
                // Another leader may have committed between our existence
                // check and winning the flight.
                if let Ok(true) = self.local.exists(algo, &hash).await {
                    guard.complete(true);
                    return self.serve_from_cache(algo, &hash, head).await;
                }
                self.lead_fill(algo, &hash, sources, candidates, guard).await
            }
        }
    }

    /// Stream a committed entry, updating recency.
    async fn serve_from_cache(&self, algo: Algorithm, hash: &str, head: bool) -> Response<BoxedBody> {
        let (file, size) = match self.local.open_read(algo, hash).await {
            Ok(pair) => pair,
            Err(e) => {
                // A concurrent eviction may have raced us; the client
                // retries through the fetch path.
                error!(algo = %algo, hash, error = %e, "failed to read from cache");
                return text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to retrieve from cache",
                );
            }
        };

        let body = if head {
            empty_body()
        } else {
            http_body_util::BodyExt::boxed(StreamBody::new(
                ReaderStream::new(file).map(|chunk| chunk.map(Frame::data)),
            ))
        };

        cache_response_builder(algo, hash, size)
            .body(body)
            .unwrap_or_else(|_| Response::new(empty_body()))
    }

    /// Leader side of a miss: walk the sources, stream the first usable one.
    async fn lead_fill(
        &self,
        algo: Algorithm,
        hash: &str,
        sources: Vec<String>,
        forwarded: Vec<String>,
        guard: crate::singleflight::FillGuard,
    ) -> Response<BoxedBody> {
        for source in &sources {
            info!(url = %source, algo = %algo, hash, "fetching from source");

            let mut request = self.client.get(source);
            if !forwarded.is_empty() {
                // Daisy-chained caches reach further back through the same
                // header we accepted.
                request = request.header(SOURCE_URLS_HEADER, sourcelist::encode(&forwarded));
            }

            let resp = match request.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(url = %source, error = %e, "source request failed");
                    continue;
                }
            };
            if resp.status() != reqwest::StatusCode::OK {
                warn!(url = %source, status = %resp.status(), "source refused");
                continue;
            }
            let Some(expected_len) = resp.content_length() else {
                // The protocol requires sources to commit to a length.
                warn!(url = %source, "source did not provide Content-Length");
                continue;
            };

            let writer = match self.local.begin_write(algo, hash).await {
                Ok(writer) => writer,
                Err(e) => {
                    error!(error = %e, "failed to create temp file");
                    guard.complete(false);
                    return text_response(StatusCode::BAD_GATEWAY, "failed to prepare storage");
                }
            };

            // From here on headers are written; failures abort the
            // connection instead of producing a new response.
            let (tx, rx) = mpsc::channel::<std::io::Result<Frame<Bytes>>>(16);
            let upstream = resp.bytes_stream();

            tokio::spawn(pump_fill(
                algo,
                hash.to_string(),
                source.clone(),
                Box::pin(upstream),
                writer,
                expected_len,
                tx,
                guard,
            ));

            return cache_response_builder(algo, hash, expected_len)
                .body(http_body_util::BodyExt::boxed(StreamBody::new(rx)))
                .unwrap_or_else(|_| Response::new(empty_body()));
        }

        guard.complete(false);
        text_response(StatusCode::BAD_GATEWAY, "failed to fetch: all sources failed")
    }
}

/// Tee the source body into the response, the temp file and the hasher.
/// Commits on a verified EOF; anything else aborts the response stream.
#[allow(clippy::too_many_arguments)]
async fn pump_fill(
    algo: Algorithm,
    hash: String,
    source: String,
    mut upstream: futures::stream::BoxStream<'static, reqwest::Result<Bytes>>,
    mut writer: StoreWriter,
    expected_len: u64,
    mut tx: mpsc::Sender<std::io::Result<Frame<Bytes>>>,
    guard: crate::singleflight::FillGuard,
) {
    let mut hasher = Hasher::new(algo);
    let mut client_gone = false;

    while let Some(chunk) = upstream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(url = %source, error = %e, "streaming from source failed");
                abort_response(&mut tx, "source stream failed").await;
                guard.complete(false);
                return;
            }
        };

        hasher.update(&chunk);
        if let Err(e) = writer.write_all(&chunk).await {
            error!(error = %e, "failed to write temp file");
            abort_response(&mut tx, "storage write failed").await;
            guard.complete(false);
            return;
        }
        if !client_gone && tx.send(Ok(Frame::data(chunk))).await.is_err() {
            // The requester left. The fill keeps going: the commit benefits
            // every waiter and future reader.
            debug!(algo = %algo, hash = %hash, "client disconnected mid-fill, continuing");
            client_gone = true;
        }
    }

    let actual = hasher.finish();
    if actual != hash {
        error!(expected = %hash, actual = %actual, url = %source, "hash mismatch");
        abort_response(&mut tx, "hash mismatch").await;
        guard.complete(false);
        return;
    }
    if writer.written() != expected_len {
        error!(
            expected = expected_len,
            got = writer.written(),
            url = %source,
            "size mismatch"
        );
        abort_response(&mut tx, "size mismatch").await;
        guard.complete(false);
        return;
    }

    match writer.commit().await {
        Ok(size) => {
            info!(algo = %algo, hash = %hash, size, "stored file");
            guard.complete(true);
            // Dropping the sender ends the response body cleanly.
        }
        Err(e) => {
            error!(error = %e, "failed to commit file");
            abort_response(&mut tx, "commit failed").await;
            guard.complete(false);
        }
    }
}

/// Error the response stream so the connection is torn down rather than
/// finished. Clients must treat anything short of a graceful end as a
/// rejection.
async fn abort_response(tx: &mut mpsc::Sender<std::io::Result<Frame<Bytes>>>, reason: &str) {
    let _ = tx.send(Err(std::io::Error::other(reason.to_string()))).await;
}

/// Immutable cache headers shared by every 200 response.
fn cache_response_builder(algo: Algorithm, hash: &str, len: u64) -> hyper::http::response::Builder {
    Response::builder()
        .status(StatusCode::OK)
        .header(
            hyper::header::CACHE_CONTROL,
            "public, max-age=31536000, immutable",
        )
        .header(
            hyper::header::LINK,
            format!("</fetch/{algo}/{hash}>; rel=\"canonical\""),
        )
        .header(hyper::header::CONTENT_LENGTH, len)
}

/// Extract `(algo, hash)` from `/fetch/...` or `/api/fetchurl/...` paths.
fn parse_content_path(path: &str) -> Option<(String, String)> {
    let rest = path
        .strip_prefix("/fetch/")
        .or_else(|| path.strip_prefix("/api/fetchurl/"))?;
    let mut parts = rest.trim_matches('/').split('/');
    let algo = parts.next()?;
    let hash = parts.next()?;
    if algo.is_empty() || hash.is_empty() || parts.next().is_some() {
        return None;
    }
    Some((algo.to_string(), hash.to_string()))
}

/// Decode every `X-Source-Urls` header value.
fn parse_source_urls<B>(req: &Request<B>) -> Vec<String> {
    let mut urls = Vec::new();
    for value in req.headers().get_all(SOURCE_URLS_HEADER) {
        match value.to_str() {
            Ok(value) => urls.extend(sourcelist::decode(value)),
            Err(e) => warn!(error = %e, "ignoring undecodable X-Source-Urls header"),
        }
    }
    urls
}

/// Deprecated `?url=` query parameters, still accepted for old clients.
fn parse_query_urls<B>(req: &Request<B>) -> Vec<String> {
    let Some(query) = req.uri().query() else {
        return Vec::new();
    };
    let Ok(parsed) = reqwest::Url::parse(&format!("http://localhost/?{query}")) else {
        return Vec::new();
    };
    parsed
        .query_pairs()
        .filter(|(k, _)| k == "url")
        .map(|(_, v)| v.into_owned())
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
