//! fetchurl - Content-Addressable Storage proxy
//!
//! ```text
//! ┌──────────┐   GET /api/fetchurl/{algo}/{hash}   ┌──────────────┐
//! │  client  │────────────────────────────────────▶│ cache server │──▶ sources
//! └──────────┘        X-Source-Urls: "..."         └──────────────┘
//! ```
//!
//! Clients know the digest of the bytes they need; servers return a local
//! copy or fetch from an advertised source, verifying the digest as the
//! bytes stream.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fetchurl::client::Fetcher;
use fetchurl::error::Result;
use fetchurl::{app, proxy};

// =============================================================================
// CLI Arguments
// =============================================================================

/// fetchurl - a Content-Addressable Storage (CAS) proxy
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "FETCHURL_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "FETCHURL_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch a file by digest
    Get {
        /// Hash algorithm (sha1, sha256, sha512)
        algo: String,
        /// Expected digest, lowercase hex
        hash: String,
        /// Source URLs to advertise and fall back to
        #[arg(long = "url")]
        urls: Vec<String>,
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Start the cache + proxy server
    Server {
        /// Port to listen on
        #[arg(long, env = "FETCHURL_PORT", default_value = "8080")]
        port: u16,
        /// Directory to store cached files
        #[arg(long, env = "FETCHURL_CACHE_DIR", default_value = "./cache")]
        cache_dir: PathBuf,
        /// Max cache size in bytes (0 disables the policy)
        #[arg(long, env = "FETCHURL_MAX_CACHE_SIZE", default_value = "1073741824")]
        max_cache_size: u64,
        /// Min free disk space in bytes (0 disables the policy)
        #[arg(long, env = "FETCHURL_MIN_FREE_SPACE", default_value = "0")]
        min_free_space: u64,
        /// Seconds between eviction checks
        #[arg(long, env = "FETCHURL_EVICTION_INTERVAL", default_value = "60")]
        eviction_interval: u64,
        /// Eviction strategy to use (lru)
        #[arg(long, env = "FETCHURL_EVICTION_STRATEGY", default_value = "lru")]
        eviction_strategy: String,
        /// Upstream CAS servers, in consultation order
        #[arg(long = "upstream", env = "FETCHURL_UPSTREAM", value_delimiter = ',')]
        upstreams: Vec<String>,
        /// CA certificate for MITM interception (PEM, hex or file path)
        #[arg(long, env = "FETCHURL_CA_CERT", default_value = "")]
        ca_cert: String,
        /// CA private key for MITM interception (PEM, hex or file path)
        #[arg(long, env = "FETCHURL_CA_KEY", default_value = "")]
        ca_key: String,
    },
    /// Generate a CA certificate and key for the intercepting proxy
    Cert {
        /// Output path for the CA certificate
        #[arg(long, default_value = "ca.pem")]
        out_cert: PathBuf,
        /// Output path for the CA private key
        #[arg(long, default_value = "ca-key.pem")]
        out_key: PathBuf,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let result = match cli.command {
        Command::Get {
            algo,
            hash,
            urls,
            output,
        } => run_get(&algo, &hash, urls, output).await,
        Command::Server {
            port,
            cache_dir,
            max_cache_size,
            min_free_space,
            eviction_interval,
            eviction_strategy,
            upstreams,
            ca_cert,
            ca_key,
        } => {
            app::run_server(app::ServerConfig {
                port,
                cache_dir,
                max_cache_size,
                min_free_space,
                eviction_interval: Duration::from_secs(eviction_interval),
                eviction_strategy,
                upstreams,
                ca_cert,
                ca_key,
            })
            .await
        }
        Command::Cert { out_cert, out_key } => {
            info!(cert = %out_cert.display(), key = %out_key.display(), "generating CA certificate and key");
            proxy::ca::generate_ca(&out_cert, &out_key)
        }
    };

    if let Err(e) = result {
        error!(error = %e, "command failed");
        std::process::exit(1);
    }
}

async fn run_get(
    algo: &str,
    hash: &str,
    urls: Vec<String>,
    output: Option<PathBuf>,
) -> Result<()> {
    let fetcher = Fetcher::from_env(reqwest::Client::new());

    let result = match &output {
        Some(path) => {
            let mut file = tokio::fs::File::create(path).await?;
            fetcher.fetch(algo, hash, &urls, &mut file).await
        }
        None => {
            let mut stdout = tokio::io::stdout();
            fetcher.fetch(algo, hash, &urls, &mut stdout).await
        }
    };

    if result.is_err() {
        // A half-written output file would be mistaken for the artifact.
        if let Some(path) = &output {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!(path = %path.display(), error = %e, "failed to remove output file");
                }
            }
        }
    }
    result
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(cli: &Cli) {
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().expect("static directive"))
        .add_directive("rustls=warn".parse().expect("static directive"));

    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
