//! Canonical URL form used as the sole equality function for URL entries.

use url::{ParseError, Url};

/// Upper bound on normalization passes; real inputs settle in one or two.
const MAX_PASSES: usize = 8;

/// Normalize a URL for duplicate comparison.
///
/// Query and fragment are dropped, a missing scheme defaults to `https`,
/// scheme and host are lower-cased, leading `www.` labels are stripped, trailing
/// slashes are removed (a bare `/` path becomes empty) and the whole result
/// is lower-cased. Input that cannot be parsed into a URL with a host is
/// trimmed, lower-cased and stripped of trailing slashes instead.
///
/// The result is a fixpoint: `normalize(&normalize(u)) == normalize(u)`.
pub fn normalize(url: &str) -> String {
    let mut current = normalize_once(url);
    for _ in 1..MAX_PASSES {
        let next = normalize_once(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

/// A single normalization pass.
fn normalize_once(raw: &str) -> String {
    let trimmed = raw.trim();
    match parse_with_default_scheme(trimmed).and_then(|url| reassemble(&url)) {
        Some(normalized) => normalized,
        None => {
            tracing::trace!(input = trimmed, "unparseable URL, using string fallback");
            fallback(trimmed)
        }
    }
}

/// Parse `input`, retrying as `https://<input>` when it has no scheme.
/// Only URLs with a non-empty host are accepted.
fn parse_with_default_scheme(input: &str) -> Option<Url> {
    let url = match Url::parse(input) {
        Ok(url) if url.host_str().is_none() && looks_like_host_port(input) => {
            Url::parse(&format!("https://{input}")).ok()?
        }
        Ok(url) => url,
        Err(ParseError::RelativeUrlWithoutBase) => Url::parse(&format!("https://{input}")).ok()?,
        Err(_) => return None,
    };

    match url.host_str() {
        Some(host) if !host.is_empty() => Some(url),
        _ => None,
    }
}

/// `example.com:8080/x` parses with `example.com` as its scheme.
fn looks_like_host_port(input: &str) -> bool {
    !input.contains("://")
        && input
            .split_once(':')
            .is_some_and(|(_, rest)| rest.starts_with(|c: char| c.is_ascii_digit()))
}

/// Rebuild `scheme://host/path` from a parsed URL.
///
/// Returns `None` when nothing is left of the host once `www.` labels are
/// stripped.
fn reassemble(url: &Url) -> Option<String> {
    let host = url.host_str().unwrap_or_default().to_lowercase();
    let mut host = host.as_str();
    while let Some(rest) = host.strip_prefix("www.") {
        host = rest;
    }
    if host.is_empty() {
        return None;
    }
    let path = url.path().trim_end_matches('/');

    Some(format!("{}://{host}{path}", url.scheme()).to_lowercase())
}

fn fallback(trimmed: &str) -> String {
    trimmed.to_lowercase().trim_end_matches('/').to_string()
}
