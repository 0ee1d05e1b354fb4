//! Server Assembly
//!
//! Builds the cache+proxy server out of its parts: eviction strategy and
//! policies, the byte-accounted manager, the sharded local store, the link
//! database, the fetch service, the CAS handler, the proxy rules and the
//! engine; then drives the accept loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use regex::Regex;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::db::LinkDb;
use crate::error::{Error, Result};
use crate::eviction::{
    EvictionManager, MaxSizePolicy, MinFreeSpacePolicy, Policy, StrategyRegistry,
};
use crate::fetch::FetchService;
use crate::handler::CasHandler;
use crate::hashing::Algorithm;
use crate::proxy::rules::{DbRule, NpmLearningRule, RegexRule};
use crate::proxy::{ca, ProxyEngine, Rule};
use crate::repository::{LocalStore, Repository, UpstreamRepository};

/// Server configuration, bound from CLI flags and `FETCHURL_*` env vars.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub cache_dir: PathBuf,
    /// Zero disables the max-size policy.
    pub max_cache_size: u64,
    /// Zero disables the min-free-space policy.
    pub min_free_space: u64,
    pub eviction_interval: Duration,
    pub eviction_strategy: String,
    pub upstreams: Vec<String>,
    pub ca_cert: String,
    pub ca_key: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            cache_dir: PathBuf::from("./cache"),
            max_cache_size: 1024 * 1024 * 1024,
            min_free_space: 0,
            eviction_interval: Duration::from_secs(60),
            eviction_strategy: "lru".to_string(),
            upstreams: Vec::new(),
            ca_cert: String::new(),
            ca_key: String::new(),
        }
    }
}

/// Everything the accept loop needs, plus handles tests poke at.
pub struct App {
    pub engine: Arc<ProxyEngine>,
    pub store: Arc<LocalStore>,
    pub eviction: Arc<EvictionManager>,
    pub db: Arc<LinkDb>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App").finish_non_exhaustive()
    }
}

/// Assemble the server components from configuration.
pub async fn build(cfg: &ServerConfig) -> Result<App> {
    let strategy = StrategyRegistry::with_defaults().get(&cfg.eviction_strategy)?;

    let mut policies: Vec<Box<dyn Policy>> = Vec::new();
    if cfg.max_cache_size > 0 {
        info!(max_size = cfg.max_cache_size, "adding max-cache-size policy");
        policies.push(Box::new(MaxSizePolicy {
            max_bytes: cfg.max_cache_size,
        }));
    }
    if cfg.min_free_space > 0 {
        info!(min_free = cfg.min_free_space, "adding min-free-space policy");
        policies.push(Box::new(MinFreeSpacePolicy {
            path: cfg.cache_dir.clone(),
            min_free_bytes: cfg.min_free_space,
        }));
    }
    if policies.is_empty() {
        info!("no eviction policies configured (unlimited cache)");
    }

    let eviction = Arc::new(EvictionManager::new(
        policies,
        strategy,
        cfg.eviction_interval,
    ));

    tokio::fs::create_dir_all(&cfg.cache_dir).await?;
    let store = Arc::new(LocalStore::new(&cfg.cache_dir, Some(Arc::clone(&eviction))));
    eviction.seed(store.walk()?);
    Arc::clone(&eviction).start(Arc::clone(&store));

    let db_path = cfg.cache_dir.join("links.db");
    let db = Arc::new(LinkDb::open(&db_path)?);

    // One CA serves both sides of the proxy: it signs the leaves presented
    // to clients, and the outbound client trusts it so chained MITM'd
    // origins verify.
    let ca_authority = match (cfg.ca_cert.is_empty(), cfg.ca_key.is_empty()) {
        (false, false) => {
            info!("loading CA certificate");
            Some(Arc::new(ca::load_ca(&cfg.ca_cert, &cfg.ca_key)?))
        }
        (true, true) => None,
        _ => {
            return Err(Error::Config(
                "ca-cert and ca-key must be provided together".into(),
            ))
        }
    };

    let mut client_builder = reqwest::Client::builder();
    if let Some(ca_authority) = &ca_authority {
        let cert = reqwest::Certificate::from_pem(ca_authority.cert_pem().as_bytes())?;
        client_builder = client_builder.add_root_certificate(cert);
    }
    let client = client_builder.build()?;

    let upstream_repos: Vec<Arc<dyn Repository>> = cfg
        .upstreams
        .iter()
        .map(|base| {
            Arc::new(UpstreamRepository::new(base, client.clone())) as Arc<dyn Repository>
        })
        .collect();
    let fetch = Arc::new(FetchService::new(upstream_repos, client.clone()));

    let cas = Arc::new(CasHandler::new(
        Arc::clone(&store),
        client.clone(),
        cfg.upstreams.clone(),
    ));

    let rules: Vec<Arc<dyn Rule>> = vec![
        Arc::new(RegexRule::new(
            Regex::new(r"sha256/(?P<hash>[a-f0-9]{64})")
                .map_err(|e| Error::Internal(format!("default rule pattern: {e}")))?,
            Algorithm::Sha256,
        )),
        Arc::new(DbRule::new(Arc::clone(&db), Algorithm::Sha256)),
        Arc::new(DbRule::new(Arc::clone(&db), Algorithm::Sha1)),
        Arc::new(NpmLearningRule::new(Arc::clone(&db), client.clone())),
    ];

    let engine = Arc::new(ProxyEngine::new(
        store.clone(),
        fetch,
        rules,
        cas,
        ca_authority,
        client,
    ));

    Ok(App {
        engine,
        store,
        eviction,
        db,
    })
}

/// Drive the accept loop on an already-bound listener.
pub async fn serve(listener: TcpListener, engine: Arc<ProxyEngine>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let engine = Arc::clone(&engine);

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let engine = Arc::clone(&engine);
                async move { Ok::<_, std::convert::Infallible>(engine.handle(req).await) }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                // Aborted fills surface here as connection errors; that is
                // the contract, not a fault.
                tracing::debug!(peer = %peer, error = %e, "connection closed");
            }
        });
    }
}

/// Build and run the cache+proxy server until the process dies.
pub async fn run_server(cfg: ServerConfig) -> Result<()> {
    let app = build(&cfg).await?;

    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        error!(addr = %addr, error = %e, "failed to bind");
        Error::Io(e)
    })?;
    info!(
        addr = %addr,
        cache_dir = %cfg.cache_dir.display(),
        "starting server (proxy + CAS)"
    );

    serve(listener, app.engine).await
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig {
            cache_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        let app = build(&cfg).await.unwrap();
        assert_eq!(app.eviction.current_bytes(), 0);
        assert!(app.db.is_empty().unwrap());
        assert!(dir.path().join("links.db").exists());
    }

    #[tokio::test]
    async fn test_build_rejects_unknown_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig {
            cache_dir: dir.path().to_path_buf(),
            eviction_strategy: "fifo".to_string(),
            ..Default::default()
        };

        assert!(matches!(
            build(&cfg).await.unwrap_err(),
            Error::StrategyNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_build_rejects_half_configured_ca() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig {
            cache_dir: dir.path().to_path_buf(),
            ca_cert: "ca.pem".to_string(),
            ..Default::default()
        };

        assert!(matches!(build(&cfg).await.unwrap_err(), Error::Config(_)));
    }
}
