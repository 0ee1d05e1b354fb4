//! Intercepting Proxy Engine
//!
//! One hyper server doubles as an HTTP proxy and the CAS endpoint:
//!
//! - origin-form requests fall through to the CAS handler
//! - absolute-form requests run the proxy rules
//! - `CONNECT` is answered 200 and, when a CA is configured, MITM'd: the
//!   tunnel is TLS-terminated with a leaf certificate minted for the host
//!   and the decrypted requests run the same rules
//!
//! A rule hit turns upstream traffic into cache hits; everything else
//! passes through unmodified.

pub mod ca;
pub mod rules;

use std::sync::Arc;

use futures::StreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::fetch::FetchService;
use crate::handler::{empty_body, text_response, BoxedBody, CasHandler};
use crate::hashing;
use crate::repository::LocalStore;

pub use ca::CertificateAuthority;
pub use rules::{Candidate, Rule};

/// Headers that never cross the proxy.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

pub struct ProxyEngine {
    local: Arc<LocalStore>,
    fetch: Arc<FetchService>,
    rules: Vec<Arc<dyn Rule>>,
    cas: Arc<CasHandler>,
    ca: Option<Arc<CertificateAuthority>>,
    client: reqwest::Client,
}

impl ProxyEngine {
    pub fn new(
        local: Arc<LocalStore>,
        fetch: Arc<FetchService>,
        rules: Vec<Arc<dyn Rule>>,
        cas: Arc<CasHandler>,
        ca: Option<Arc<CertificateAuthority>>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            local,
            fetch,
            rules,
            cas,
            ca,
            client,
        }
    }

    /// Entry point for every connection the server accepts.
    pub async fn handle(self: Arc<Self>, req: Request<Incoming>) -> Response<BoxedBody> {
        if req.method() == Method::CONNECT {
            return self.handle_connect(req);
        }

        if req.uri().scheme().is_some() {
            // Absolute-form: a plain-HTTP proxy request.
            let Ok(url) = reqwest::Url::parse(&req.uri().to_string()) else {
                return text_response(StatusCode::BAD_REQUEST, "unparsable proxy target");
            };
            return self.handle_intercepted(req, url).await;
        }

        // Origin-form: local routes only.
        if CasHandler::matches(req.uri().path()) {
            return self.cas.handle(req).await;
        }
        text_response(StatusCode::NOT_FOUND, "not found")
    }

    /// Answer CONNECT and take over the tunnel.
    fn handle_connect(self: Arc<Self>, req: Request<Incoming>) -> Response<BoxedBody> {
        let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
            return text_response(StatusCode::BAD_REQUEST, "CONNECT without authority");
        };

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    if let Some(ca) = self.ca.clone() {
                        if let Err(e) = self.clone().mitm(upgraded, &authority, ca).await {
                            debug!(authority = %authority, error = %e, "mitm session ended");
                        }
                    } else {
                        tunnel(upgraded, &authority).await;
                    }
                }
                Err(e) => warn!(error = %e, "CONNECT upgrade failed"),
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .body(empty_body())
            .unwrap_or_else(|_| Response::new(empty_body()))
    }

    /// TLS-terminate the tunnel and serve the decrypted requests.
    async fn mitm(
        self: Arc<Self>,
        upgraded: hyper::upgrade::Upgraded,
        authority: &str,
        ca: Arc<CertificateAuthority>,
    ) -> Result<()> {
        let config = ca.server_config_for(authority)?;
        let acceptor = tokio_rustls::TlsAcceptor::from(config);
        let tls = acceptor.accept(TokioIo::new(upgraded)).await?;

        let engine = self;
        let authority = authority.to_string();
        let service = service_fn(move |req: Request<Incoming>| {
            let engine = Arc::clone(&engine);
            let authority = authority.clone();
            async move {
                let path_and_query = req
                    .uri()
                    .path_and_query()
                    .map(|pq| pq.as_str().to_string())
                    .unwrap_or_else(|| "/".to_string());
                let response =
                    match reqwest::Url::parse(&format!("https://{authority}{path_and_query}")) {
                        Ok(url) => engine.handle_intercepted(req, url).await,
                        Err(_) => text_response(StatusCode::BAD_REQUEST, "unparsable request"),
                    };
                Ok::<_, std::convert::Infallible>(response)
            }
        });

        hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(tls), service)
            .await
            .map_err(|e| Error::Internal(format!("mitm connection error: {e}")))?;
        Ok(())
    }

    /// Run the rules for one intercepted request.
    async fn handle_intercepted(
        &self,
        req: Request<Incoming>,
        url: reqwest::Url,
    ) -> Response<BoxedBody> {
        for rule in &self.rules {
            let candidates = rule.evaluate(&url).await;
            if candidates.is_empty() {
                continue;
            }

            for candidate in &candidates {
                if !hashing::is_valid_hex(candidate.algo, &candidate.hash) {
                    debug!(url = %url, hash = %candidate.hash, "rule produced malformed digest");
                    continue;
                }
                info!(url = %url, algo = %candidate.algo, hash = %candidate.hash, "proxy rule matched");

                match self.serve_candidate(candidate, &url).await {
                    Ok(response) => return response,
                    Err(e) => {
                        warn!(url = %url, error = %e, "failed to fetch/store in proxy, trying next candidate");
                    }
                }
            }

            // The first matching rule decides; nothing landed, so let the
            // request through untouched.
            break;
        }

        self.passthrough(req, url).await
    }

    /// Serve one candidate digest from cache, filling it on a miss with the
    /// original request URL as the sole source.
    async fn serve_candidate(
        &self,
        candidate: &Candidate,
        url: &reqwest::Url,
    ) -> Result<Response<BoxedBody>> {
        let Candidate { algo, hash } = candidate;

        if !self.local.exists(*algo, hash).await? {
            info!(algo = %algo, hash = %hash, "proxy cache miss, fetching");
            let fetch = Arc::clone(&self.fetch);
            let sources = vec![url.to_string()];
            let algo = *algo;
            let digest = hash.clone();
            self.local
                .fill_with(algo, hash, move || async move {
                    fetch.fetch(algo, &digest, &sources).await
                })
                .await?;
        } else {
            info!(algo = %algo, hash = %hash, "proxy cache hit");
        }

        let (file, size) = self.local.open_read(*algo, hash).await?;
        let body = StreamBody::new(ReaderStream::new(file).map(|chunk| chunk.map(Frame::data)));
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "application/octet-stream")
            .header(hyper::header::CONTENT_LENGTH, size)
            .header(
                hyper::header::CACHE_CONTROL,
                "public, max-age=31536000, immutable",
            )
            .body(http_body_util::BodyExt::boxed(body))
            .unwrap_or_else(|_| Response::new(empty_body())))
    }

    /// Relay a request the rules did not claim.
    async fn passthrough(&self, req: Request<Incoming>, url: reqwest::Url) -> Response<BoxedBody> {
        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, "failed to read proxied request body");
                return text_response(StatusCode::BAD_GATEWAY, "failed to read request body");
            }
        };

        let method = match reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) {
            Ok(method) => method,
            Err(_) => return text_response(StatusCode::BAD_REQUEST, "unsupported method"),
        };

        let mut request = self.client.request(method, url.clone()).body(body);
        for (name, value) in parts.headers.iter() {
            if !is_hop_by_hop(name.as_str()) {
                request = request.header(name.as_str(), value.as_bytes());
            }
        }

        let resp = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                error!(url = %url, error = %e, "passthrough request failed");
                return text_response(StatusCode::BAD_GATEWAY, "upstream request failed");
            }
        };

        let mut builder = Response::builder().status(resp.status().as_u16());
        for (name, value) in resp.headers().iter() {
            if !is_hop_by_hop(name.as_str()) {
                builder = builder.header(name.as_str(), value.as_bytes());
            }
        }

        let body = match resp.bytes().await {
            Ok(body) => body,
            Err(e) => {
                warn!(url = %url, error = %e, "failed to read passthrough response");
                return text_response(StatusCode::BAD_GATEWAY, "upstream response failed");
            }
        };
        builder
            .body(crate::handler::full_body(body))
            .unwrap_or_else(|_| Response::new(empty_body()))
    }
}

/// Blind CONNECT tunnel used when no CA is configured.
async fn tunnel(upgraded: hyper::upgrade::Upgraded, authority: &str) {
    match TcpStream::connect(authority).await {
        Ok(mut server) => {
            let mut client = TokioIo::new(upgraded);
            if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut server).await {
                debug!(authority = %authority, error = %e, "tunnel closed");
            }
        }
        Err(e) => warn!(authority = %authority, error = %e, "tunnel connect failed"),
    }
}

// =============================================================================
// Tests
// =============================================================================
