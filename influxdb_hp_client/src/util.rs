//! Timestamp, URL and query-template helpers.

use crate::{InvalidTimestampSnafu, Result};
use chrono::{DateTime, TimeZone, Utc};
use snafu::OptionExt;

/// Parse an ISO-8601 / RFC 3339 timestamp (`Z` suffix or numeric offset)
/// to epoch milliseconds.
pub fn parse_8601(s: &str) -> Result<i64> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis())
        .context(InvalidTimestampSnafu { input: s })
}

/// Format epoch milliseconds as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
pub fn to_8601(epoch_ms: i64) -> String {
    Utc.timestamp_millis_opt(epoch_ms)
        .single()
        .expect("millisecond timestamp in range")
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}

/// Percent-encode the characters the query endpoint cannot take raw:
/// `%`, `=`, `&`, newline and space. Everything else passes through.
pub fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 1);
    for ch in s.chars() {
        match ch {
            '%' | '=' | '&' | '\n' | ' ' => {
                out.push('%');
                out.push_str(&format!("{:02X}", ch as u32));
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Replace the first occurrence of `from` in `s`. Returns whether a
/// replacement happened.
pub fn replace_first(s: &mut String, from: &str, to: &str) -> bool {
    match s.find(from) {
        Some(pos) => {
            s.replace_range(pos..pos + from.len(), to);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format_round_trip() {
        let ms = parse_8601("2018-06-19T16:22:26Z").unwrap();
        assert_eq!(ms, 1529425346000);
        assert_eq!(to_8601(ms), "2018-06-19T16:22:26.000Z");

        let ms = parse_8601("2018-06-19T16:22:26.123Z").unwrap();
        assert_eq!(to_8601(ms), "2018-06-19T16:22:26.123Z");
    }

    #[test]
    fn parse_numeric_offset() {
        assert_eq!(
            parse_8601("2018-06-19T18:22:26+02:00").unwrap(),
            parse_8601("2018-06-19T16:22:26Z").unwrap()
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            parse_8601("yesterday").unwrap_err(),
            crate::Error::InvalidTimestamp { .. }
        ));
    }

    #[test]
    fn encode_reserved_chars_only() {
        assert_eq!(
            url_encode("SELECT v FROM load WHERE a='x%y' & b=2\n"),
            "SELECT%20v%20FROM%20load%20WHERE%20a%3D'x%25y'%20%26%20b%3D2%0A"
        );
        // comparison operators are left for the http layer
        assert_eq!(url_encode("time >= 'a'"), "time%20>%3D%20'a'");
    }

    #[test]
    fn replace_first_only() {
        let mut s = "a ? b ? c".to_string();
        assert!(replace_first(&mut s, "?", "'x'"));
        assert_eq!(s, "a 'x' b ? c");
        assert!(replace_first(&mut s, "?", "'y'"));
        assert_eq!(s, "a 'x' b 'y' c");
        assert!(!replace_first(&mut s, "?", "'z'"));
    }
}
