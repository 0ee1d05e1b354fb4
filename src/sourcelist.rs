//! RFC 8941 Source-List Codec
//!
//! Structured-field string lists are the wire format for the `X-Source-Urls`
//! request header and the `FETCHURL_SERVER` environment variable. Encoding
//! always produces quoted strings; decoding tolerates item parameters
//! (`;q=0.9`), stray whitespace and empty input, and silently skips list
//! members that are not strings (bare tokens, numbers).

/// Encode a list of URLs as an RFC 8941 list of strings.
///
/// Each member is serialized as a quoted string with `\` and `"` escaped,
/// members joined by `", "`.
pub fn encode(urls: &[String]) -> String {
    let mut out = String::new();
    for (i, url) in urls.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('"');
        for c in url.chars() {
            if c == '\\' || c == '"' {
                out.push('\\');
            }
            out.push(c);
        }
        out.push('"');
    }
    out
}

/// Decode an RFC 8941 list, keeping only string members.
///
/// Malformed members terminate the member (best effort) rather than failing
/// the whole list; an unterminated quoted string drops that member.
pub fn decode(value: &str) -> Vec<String> {
    let mut urls = Vec::new();
    let bytes = value.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        // Skip leading whitespace and empty members.
        while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b'\t' || bytes[i] == b',') {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }

        if bytes[i] == b'"' {
            i += 1;
            let mut s = String::new();
            let mut closed = false;
            while i < bytes.len() {
                match bytes[i] {
                    b'\\' if i + 1 < bytes.len() => {
                        s.push(bytes[i + 1] as char);
                        i += 2;
                    }
                    b'"' => {
                        i += 1;
                        closed = true;
                        break;
                    }
                    b => {
                        s.push(b as char);
                        i += 1;
                    }
                }
            }
            if closed {
                urls.push(s);
            }
            // Skip parameters and anything else up to the next member.
            while i < bytes.len() && bytes[i] != b',' {
                i += 1;
            }
        } else {
            // Non-string member (token, number, inner list): skip to the
            // next comma.
            while i < bytes.len() && bytes[i] != b',' {
                i += 1;
            }
        }
    }

    urls
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_single() {
        assert_eq!(
            encode(&["http://example.com/a".to_string()]),
            "\"http://example.com/a\""
        );
    }

    #[test]
    fn test_encode_multiple() {
        let urls = vec!["http://a".to_string(), "http://b".to_string()];
        assert_eq!(encode(&urls), "\"http://a\", \"http://b\"");
    }

    #[test]
    fn test_encode_escapes() {
        assert_eq!(encode(&["a\"b\\c".to_string()]), "\"a\\\"b\\\\c\"");
    }

    #[test]
    fn test_encode_empty() {
        assert_eq!(encode(&[]), "");
    }

    #[test]
    fn test_decode_basic() {
        let urls = decode("\"http://a\", \"http://b\"");
        assert_eq!(urls, vec!["http://a", "http://b"]);
    }

    #[test]
    fn test_decode_with_parameters() {
        let urls = decode("\"http://a\";q=0.9, \"http://b\";x");
        assert_eq!(urls, vec!["http://a", "http://b"]);
    }

    #[test]
    fn test_decode_extra_whitespace() {
        let urls = decode("  \"http://a\" ,   \"http://b\"  ");
        assert_eq!(urls, vec!["http://a", "http://b"]);
    }

    #[test]
    fn test_decode_skips_non_strings() {
        let urls = decode("token, 42, \"http://a\", ?1");
        assert_eq!(urls, vec!["http://a"]);
    }

    #[test]
    fn test_decode_escapes() {
        let urls = decode("\"a\\\"b\\\\c\"");
        assert_eq!(urls, vec!["a\"b\\c"]);
    }

    #[test]
    fn test_decode_empty_input() {
        assert!(decode("").is_empty());
        assert!(decode("   ").is_empty());
    }

    #[test]
    fn test_decode_unterminated_string_dropped() {
        let urls = decode("\"http://a\", \"broken");
        assert_eq!(urls, vec!["http://a"]);
    }

    #[test]
    fn test_round_trip() {
        let urls = vec![
            "http://cache-1.internal:8080".to_string(),
            "https://mirror.example.com/artifacts?x=\"1\"".to_string(),
        ];
        assert_eq!(decode(&encode(&urls)), urls);
    }

    proptest! {
        // Round-trip over the printable-ASCII subset RFC 8941 strings carry.
        #[test]
        fn prop_round_trip(urls in proptest::collection::vec("[ -~]{0,40}", 0..6)) {
            prop_assert_eq!(decode(&encode(&urls)), urls);
        }
    }
}
