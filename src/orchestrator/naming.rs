//! Backend-legal identifiers derived from session keys.

use std::time::{SystemTime, UNIX_EPOCH};

/// Kubernetes object names used as label values are capped at 63 characters.
pub const MAX_NAME_LEN: usize = 63;

/// Prefix of every generated job name; guarantees a leading letter.
pub const NAME_PREFIX: &str = "sj";

/// Generate a unique job name for `session_key`.
///
/// The result is lowercase alphanumeric plus hyphens, at most
/// [`MAX_NAME_LEN`] characters, and shaped `sj-<session>-<suffix>`. The
/// suffix is the current time in nanoseconds in base 36 followed by eight
/// random hex digits, so repeated calls for the same session (after a
/// restart, say) do not collide.
pub fn job_name(session_key: &str) -> String {
    let suffix = unique_suffix();
    // "sj-" + "-" + suffix
    let budget = MAX_NAME_LEN - NAME_PREFIX.len() - 2 - suffix.len();

    let mut session = sanitize_name(session_key);
    session.truncate(budget);
    let session = session.trim_end_matches('-');

    if session.is_empty() {
        format!("{}-{}", NAME_PREFIX, suffix)
    } else {
        format!("{}-{}-{}", NAME_PREFIX, session, suffix)
    }
}

/// Lowercase, map everything outside `[a-z0-9]` to `-`, collapse runs and
/// trim hyphens from both ends.
pub fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Make `raw` a valid Kubernetes label value: `[A-Za-z0-9-_.]`, at most 63
/// characters, alphanumeric at both ends. Distinct inputs may collide, so
/// lookups by label must confirm against the unsanitized annotation.
pub fn sanitize_label_value(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LEN)
        .collect();
    mapped
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

fn unique_suffix() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", to_base36(nanos), &random[..8])
}

fn to_base36(mut n: u128) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn is_dns_label(s: &str) -> bool {
        !s.is_empty()
            && s.len() <= MAX_NAME_LEN
            && s.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && s.starts_with(|c: char| c.is_ascii_lowercase())
            && s.ends_with(|c: char| c.is_ascii_alphanumeric())
    }

    #[test]
    fn test_job_name_is_dns_label() {
        let long = "x".repeat(200);
        for key in [
            "C024BE91L:1700000000.000100",
            "team/Channel Name/ThreadTS",
            "",
            "!!!",
            long.as_str(),
            "ÜNÏCÖDÉ-ключ",
        ] {
            let name = job_name(key);
            assert!(is_dns_label(&name), "invalid name {name:?} for {key:?}");
        }
    }

    #[test]
    fn test_job_name_keeps_session_prefix() {
        let name = job_name("C024BE91L:1700000000.000100");
        assert!(name.starts_with("sj-c024be91l-1700000000-000100-"), "{name}");
    }

    #[test]
    fn test_repeated_calls_are_unique() {
        let names: HashSet<String> = (0..500).map(|_| job_name("same-session")).collect();
        assert_eq!(names.len(), 500);
    }

    #[test]
    fn test_sanitize_name_collapses_separators() {
        assert_eq!(sanitize_name("--A__b..C--"), "a-b-c");
        assert_eq!(sanitize_name("///"), "");
    }

    #[test]
    fn test_sanitize_label_value() {
        assert_eq!(
            sanitize_label_value("C024BE91L:1700000000.000100"),
            "C024BE91L_1700000000.000100"
        );
        assert_eq!(sanitize_label_value("_.weird._"), "weird");
        assert_eq!(sanitize_label_value(&"k".repeat(100)).len(), MAX_NAME_LEN);
        assert_eq!(sanitize_label_value("::"), "");
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }
}
