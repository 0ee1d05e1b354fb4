//! fetchurl - Content-Addressable HTTP Cache
//!
//! A cache for immutable build artifacts shared across CI jobs and
//! developer machines. Clients know the cryptographic digest of the bytes
//! they need and a list of source URLs; servers return a locally-stored
//! copy or fetch from a source, verifying the digest as the bytes stream.
//! Servers chain: an upstream server is just another cache to the one
//! below it.
//!
//! # Architecture
//!
//! ```text
//! client ──▶ CAS handler ──▶ fetch service ──▶ upstream / source URL
//!                │                                    │
//!                └── response ∥ temp file ∥ hasher ◀──┘
//!                          │
//!                 verified commit ──▶ eviction accounting
//! ```
//!
//! A digest mismatch mid-stream aborts the connection so no partial bytes
//! are ever trusted. An optional intercepting HTTPS proxy maps upstream
//! traffic onto the same engine through URL rules.
//!
//! # Modules
//!
//! - [`app`] - server assembly and accept loop
//! - [`client`] - library-side fetcher (servers, then direct sources)
//! - [`db`] - SQLite link database for learned URL → digest mappings
//! - [`error`] - error types
//! - [`eviction`] - policies, strategies and the byte-accounting manager
//! - [`fetch`] - upstreams-then-sources fetch service
//! - [`handler`] - the CAS HTTP endpoint
//! - [`hashing`] - digest algorithm registry
//! - [`proxy`] - intercepting HTTPS proxy and its rules
//! - [`repository`] - local sharded store and upstream views
//! - [`singleflight`] - at-most-one-fill-per-digest coordination
//! - [`sourcelist`] - RFC 8941 string-list codec

pub mod app;
pub mod client;
pub mod db;
pub mod error;
pub mod eviction;
pub mod fetch;
pub mod handler;
pub mod hashing;
pub mod proxy;
pub mod repository;
pub mod singleflight;
pub mod sourcelist;

// Re-export commonly used types
pub use client::Fetcher;
pub use error::{Error, Result};
pub use hashing::Algorithm;
pub use repository::LocalStore;
