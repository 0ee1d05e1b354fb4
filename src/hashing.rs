//! Digest Algorithm Registry
//!
//! Normalizes algorithm names and constructs incremental hashers. Content
//! addresses are always the lowercase hex encoding of the digest, so a
//! hasher's `finish()` yields hex directly.

use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use crate::error::{Error, Result};

/// Supported digest algorithms.
///
/// SHA-256 is the preferred algorithm for new clients; SHA-1 exists for
/// ecosystems (npm) that still publish SHA-1 checksums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl Algorithm {
    /// Parse an algorithm name, normalizing it first.
    ///
    /// `"SHA-256"`, `"sha256"` and `"Sha_256"` all resolve to [`Algorithm::Sha256`].
    pub fn parse(name: &str) -> Result<Algorithm> {
        match normalize(name).as_str() {
            "sha1" => Ok(Algorithm::Sha1),
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            _ => Err(Error::UnsupportedAlgorithm(name.to_string())),
        }
    }

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha1 => "sha1",
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Length of the lowercase hex encoding of this algorithm's digest.
    pub fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha1 => 40,
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }

}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lowercase the algorithm name and strip any character outside `[a-z0-9]`,
/// so that e.g. "SHA256", "SHA-256", "sha-256" all resolve to "sha256".
pub fn normalize(name: &str) -> String {
    name.chars()
        .filter_map(|c| match c {
            'A'..='Z' => Some(c.to_ascii_lowercase()),
            'a'..='z' | '0'..='9' => Some(c),
            _ => None,
        })
        .collect()
}

/// True if the (possibly unnormalized) name resolves to a supported algorithm.
pub fn is_supported(name: &str) -> bool {
    Algorithm::parse(name).is_ok()
}

/// Incremental hasher for a supported algorithm.
pub enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    /// Construct a fresh hasher for the given algorithm.
    pub fn new(algo: Algorithm) -> Hasher {
        match algo {
            Algorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            Algorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            Algorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    /// Feed bytes into the hasher.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    /// Consume the hasher and return the lowercase hex digest.
    pub fn finish(self) -> String {
        match self {
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Validate that `hash` looks like a digest of `algo`: correct length,
/// lowercase hex characters only.
pub fn is_valid_hex(algo: Algorithm, hash: &str) -> bool {
    hash.len() == algo.hex_len()
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_variants() {
        assert_eq!(normalize("SHA-256"), "sha256");
        assert_eq!(normalize("sha256"), "sha256");
        assert_eq!(normalize("Sha_512"), "sha512");
        assert_eq!(normalize("SHA 1"), "sha1");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_parse_supported() {
        assert_eq!(Algorithm::parse("sha1").unwrap(), Algorithm::Sha1);
        assert_eq!(Algorithm::parse("SHA-256").unwrap(), Algorithm::Sha256);
        assert_eq!(Algorithm::parse("sha512").unwrap(), Algorithm::Sha512);
    }

    #[test]
    fn test_parse_unsupported() {
        let err = Algorithm::parse("md5").unwrap_err();
        assert!(matches!(err, Error::UnsupportedAlgorithm(_)));
        assert!(!is_supported("md4"));
        assert!(is_supported("sha256"));
    }

    #[test]
    fn test_hex_lengths() {
        assert_eq!(Algorithm::Sha1.hex_len(), 40);
        assert_eq!(Algorithm::Sha256.hex_len(), 64);
        assert_eq!(Algorithm::Sha512.hex_len(), 128);
    }

    #[test]
    fn test_hasher_sha256_known_vector() {
        let mut h = Hasher::new(Algorithm::Sha256);
        h.update(b"test content");
        assert_eq!(
            h.finish(),
            "6ae8a75555209fd6c44157c0aed8016e763ff435a19cf186f76863140143ff72"
        );
    }

    #[test]
    fn test_hasher_incremental_matches_oneshot() {
        let mut a = Hasher::new(Algorithm::Sha1);
        a.update(b"hello ");
        a.update(b"world");

        let mut b = Hasher::new(Algorithm::Sha1);
        b.update(b"hello world");

        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn test_is_valid_hex() {
        let good = "6ae8a75555209fd6c44157c0aed8016e763ff435a19cf186f76863140143ff72";
        assert!(is_valid_hex(Algorithm::Sha256, good));
        assert!(!is_valid_hex(Algorithm::Sha1, good));
        assert!(!is_valid_hex(Algorithm::Sha256, &good.to_uppercase()));
        assert!(!is_valid_hex(Algorithm::Sha256, "zz"));
    }

    proptest! {
        #[test]
        fn prop_normalize_idempotent(name in ".{0,64}") {
            let once = normalize(&name);
            prop_assert_eq!(normalize(&once), once.clone());
        }

        #[test]
        fn prop_normalize_output_charset(name in ".{0,64}") {
            prop_assert!(normalize(&name)
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
        }
    }
}
