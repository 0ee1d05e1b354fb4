//! Proxy Rules
//!
//! A rule maps an intercepted request URL to zero or more candidate
//! digests under which the response body would be cached. Rules may be
//! side-effectful: the npm learner never returns candidates but populates
//! the link database while traffic flows through.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::db::LinkDb;
use crate::hashing::Algorithm;

/// A digest under which an intercepted URL's bytes may be cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub algo: Algorithm,
    pub hash: String,
}

/// URL → candidate digests port.
#[async_trait]
pub trait Rule: Send + Sync {
    /// Candidates for this URL, best first. Empty means no match.
    async fn evaluate(&self, url: &reqwest::Url) -> Vec<Candidate>;
}

// =============================================================================
// Regex rule
// =============================================================================

/// Matches URLs against a pattern carrying the digest.
///
/// The pattern should capture the hex digest in a named group `hash`; the
/// first capture group is the fallback. The algorithm is fixed at
/// construction.
pub struct RegexRule {
    regex: Regex,
    algo: Algorithm,
}

impl RegexRule {
    pub fn new(regex: Regex, algo: Algorithm) -> Self {
        Self { regex, algo }
    }
}

#[async_trait]
impl Rule for RegexRule {
    async fn evaluate(&self, url: &reqwest::Url) -> Vec<Candidate> {
        let Some(captures) = self.regex.captures(url.as_str()) else {
            return Vec::new();
        };

        let hash = captures
            .name("hash")
            .map(|m| m.as_str())
            .or_else(|| captures.get(1).map(|m| m.as_str()));

        match hash {
            Some(hash) if !hash.is_empty() => vec![Candidate {
                algo: self.algo,
                hash: hash.to_string(),
            }],
            _ => Vec::new(),
        }
    }
}

// =============================================================================
// Link-database rules
// =============================================================================

/// Looks the full URL up in the link database for one algorithm.
pub struct DbRule {
    db: Arc<LinkDb>,
    algo: Algorithm,
}

impl DbRule {
    pub fn new(db: Arc<LinkDb>, algo: Algorithm) -> Self {
        Self { db, algo }
    }
}

#[async_trait]
impl Rule for DbRule {
    async fn evaluate(&self, url: &reqwest::Url) -> Vec<Candidate> {
        match self.db.get(url.as_str(), self.algo.as_str()) {
            Ok(Some(hash)) => vec![Candidate {
                algo: self.algo,
                hash,
            }],
            Ok(None) => Vec::new(),
            Err(e) => {
                debug!(url = %url, error = %e, "link database lookup failed");
                Vec::new()
            }
        }
    }
}

/// Returns every known digest for the URL, ordered by algorithm preference.
pub struct DbMultiRule {
    db: Arc<LinkDb>,
}

impl DbMultiRule {
    pub fn new(db: Arc<LinkDb>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Rule for DbMultiRule {
    async fn evaluate(&self, url: &reqwest::Url) -> Vec<Candidate> {
        let records = match self.db.get_all(url.as_str()) {
            Ok(records) => records,
            Err(e) => {
                debug!(url = %url, error = %e, "link database lookup failed");
                return Vec::new();
            }
        };

        records
            .into_iter()
            .filter_map(|record| {
                Algorithm::parse(&record.algo)
                    .ok()
                    .map(|algo| Candidate {
                        algo,
                        hash: record.hash,
                    })
            })
            .collect()
    }
}

// =============================================================================
// npm learner
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct NpmDist {
    #[serde(default)]
    tarball: String,
    #[serde(default)]
    shasum: String,
}

#[derive(Debug, Default, Deserialize)]
struct NpmVersion {
    #[serde(default)]
    dist: NpmDist,
}

#[derive(Debug, Default, Deserialize)]
struct NpmMetadata {
    #[serde(default)]
    versions: HashMap<String, NpmVersion>,
}

/// Extract `tarball → sha1` pairs from npm registry metadata JSON.
fn parse_npm_metadata(body: &[u8]) -> Option<Vec<(String, String)>> {
    let metadata: NpmMetadata = serde_json::from_slice(body).ok()?;
    let entries: Vec<(String, String)> = metadata
        .versions
        .into_values()
        .filter(|version| !version.dist.tarball.is_empty() && !version.dist.shasum.is_empty())
        .map(|version| (version.dist.tarball, version.dist.shasum))
        .collect();
    Some(entries)
}

/// Learns npm tarball digests from registry metadata requests.
///
/// Matches package metadata URLs, fetches the JSON and persists every
/// `versions.*.dist.{tarball, shasum}` pair. Learning is best-effort and
/// detached: the DB write runs on its own task so a cancelled request
/// cannot erase what was already extracted. Never yields candidates; the
/// original request proceeds normally.
pub struct NpmLearningRule {
    db: Arc<LinkDb>,
    client: reqwest::Client,
    metadata_url: Regex,
}

impl NpmLearningRule {
    pub fn new(db: Arc<LinkDb>, client: reqwest::Client) -> Self {
        Self {
            db,
            client,
            metadata_url: Regex::new(r"^https?://registry\.npmjs\.org/[^/]+/?$")
                .expect("npm metadata pattern is valid"),
        }
    }
}

#[async_trait]
impl Rule for NpmLearningRule {
    async fn evaluate(&self, url: &reqwest::Url) -> Vec<Candidate> {
        if !self.metadata_url.is_match(url.as_str()) {
            return Vec::new();
        }
        debug!(url = %url, "npm learning rule matched");

        let resp = match self.client.get(url.clone()).send().await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(url = %url, error = %e, "failed to fetch npm metadata");
                return Vec::new();
            }
        };
        if resp.status() != reqwest::StatusCode::OK {
            debug!(url = %url, status = %resp.status(), "npm metadata not available");
            return Vec::new();
        }

        let body = match resp.bytes().await {
            Ok(body) => body,
            Err(e) => {
                debug!(url = %url, error = %e, "failed to read npm metadata body");
                return Vec::new();
            }
        };
        let Some(entries) = parse_npm_metadata(&body) else {
            debug!(url = %url, "npm metadata did not parse");
            return Vec::new();
        };
        if entries.is_empty() {
            return Vec::new();
        }

        // Detached write: request cancellation must not lose the batch.
        let db = Arc::clone(&self.db);
        let package = url.path().to_string();
        tokio::spawn(async move {
            let count = entries.len();
            let result =
                tokio::task::spawn_blocking(move || db.insert_many("sha1", &entries)).await;
            match result {
                Ok(Ok(())) => info!(count, package = %package, "learned npm artifacts"),
                Ok(Err(e)) => debug!(package = %package, error = %e, "failed to store npm hashes"),
                Err(e) => debug!(package = %package, error = %e, "npm learning task failed"),
            }
        });

        Vec::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
