//! XML sitemap parser.
//!
//! Handles the two document kinds of the sitemaps.org protocol:
//! - `<urlset>`: a list of `<url><loc>…</loc></url>` page entries
//! - `<sitemapindex>`: a list of `<sitemap><loc>…</loc></sitemap>` children

use chatkb_shared::{ChatKbError, Result};
use regex::Regex;
use std::sync::LazyLock;

/// A parsed sitemap document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sitemap {
    /// Page URLs, in document order.
    UrlSet(Vec<String>),
    /// Child sitemap URLs, in document order.
    Index(Vec<String>),
}

impl Sitemap {
    /// The `<loc>` values regardless of document kind.
    pub fn locations(&self) -> &[String] {
        match self {
            Sitemap::UrlSet(urls) | Sitemap::Index(urls) => urls,
        }
    }
}

// ---------------------------------------------------------------------------
// Regex patterns (compiled once)
// ---------------------------------------------------------------------------

/// Matches an opening `<urlset` or `<sitemapindex` tag, with optional prefix.
static ROOT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(?:[A-Za-z0-9_]+:)?(urlset|sitemapindex)[\s>]").expect("root regex")
});

/// Matches `<loc>…</loc>`, with optional namespace prefix.
static LOC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<(?:[A-Za-z0-9_]+:)?loc\s*>(.*?)</(?:[A-Za-z0-9_]+:)?loc\s*>")
        .expect("loc regex")
});

/// Matches `<![CDATA[…]]>` wrappers.
static CDATA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^<!\[CDATA\[(.*)\]\]>$").expect("cdata regex"));

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse sitemap XML. Empty `<loc>` values are skipped.
pub fn parse_sitemap(xml: &str) -> Result<Sitemap> {
    let root = ROOT_RE
        .captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| ChatKbError::parse("document has no <urlset> or <sitemapindex> root"))?;

    let locations: Vec<String> = LOC_RE
        .captures_iter(xml)
        .filter_map(|c| c.get(1))
        .map(|m| loc_value(m.as_str()))
        .filter(|loc| !loc.is_empty())
        .collect();

    Ok(match root {
        "sitemapindex" => Sitemap::Index(locations),
        _ => Sitemap::UrlSet(locations),
    })
}

fn loc_value(raw: &str) -> String {
    let trimmed = raw.trim();
    match CDATA_RE.captures(trimmed).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim().to_string(),
        None => unescape_xml(trimmed),
    }
}

/// Resolve the predefined XML entities and numeric character references.
fn unescape_xml(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let after = &rest[start..];
        match after.find(';').and_then(|end| decode_entity(&after[1..end]).map(|c| (c, end))) {
            Some((ch, end)) => {
                out.push(ch);
                rest = &after[end + 1..];
            }
            None => {
                out.push('&');
                rest = &after[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let code = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                name.strip_prefix('#')?.parse().ok()?
            };
            char::from_u32(code)
        }
    }
}
