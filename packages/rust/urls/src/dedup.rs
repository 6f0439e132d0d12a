//! Duplicate detection for single adds and sitemap batches.

use std::collections::HashMap;

use chatkb_shared::{EntryMetadata, EntryType, KnowledgeEntry};
use serde::Serialize;

use crate::normalize::normalize;

// ---------------------------------------------------------------------------
// Single add
// ---------------------------------------------------------------------------

/// Find an existing `url` entry that the candidate would duplicate.
///
/// The candidate is compared under its effective URL (`crawled_url` when the
/// metadata carries one) and under its name. An existing entry matches when
/// its normalized `name` or normalized `crawled_url` equals either key.
/// Non-`url` entries are never considered. The first match in input order
/// is returned.
pub fn find_duplicate<'a>(
    candidate_url: &str,
    candidate_metadata: Option<&EntryMetadata>,
    existing: &'a [KnowledgeEntry],
) -> Option<&'a KnowledgeEntry> {
    let effective = candidate_metadata
        .and_then(|m| m.crawled_url.as_deref())
        .unwrap_or(candidate_url);

    let mut keys = vec![normalize(effective)];
    let name_key = normalize(candidate_url);
    if !keys.contains(&name_key) {
        keys.push(name_key);
    }

    existing
        .iter()
        .filter(|entry| entry.kind == EntryType::Url)
        .find(|entry| {
            keys.contains(&normalize(&entry.name))
                || entry
                    .crawled_url()
                    .is_some_and(|crawled| keys.contains(&normalize(crawled)))
        })
}

// ---------------------------------------------------------------------------
// Sitemap batch
// ---------------------------------------------------------------------------

/// Outcome of [`deduplicate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupResult {
    /// First occurrence of every normalized URL, in input order.
    pub unique: Vec<String>,
    /// Every later occurrence, in input order.
    pub duplicates: Vec<DuplicateUrl>,
}

/// A URL dropped from a batch because an earlier URL normalizes the same.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateUrl {
    /// The URL as given.
    pub url: String,
    /// Its normalized form.
    pub normalized: String,
    /// The earlier URL it collides with, as given.
    pub conflicts_with: String,
}

/// Split a URL list into first occurrences and duplicates in one pass.
pub fn deduplicate<S: AsRef<str>>(urls: &[S]) -> DedupResult {
    let mut first_seen: HashMap<String, String> = HashMap::with_capacity(urls.len());
    let mut result = DedupResult::default();

    for url in urls {
        let url = url.as_ref();
        let normalized = normalize(url);

        match first_seen.get(&normalized) {
            Some(original) => result.duplicates.push(DuplicateUrl {
                url: url.to_string(),
                conflicts_with: original.clone(),
                normalized,
            }),
            None => {
                first_seen.insert(normalized, url.to_string());
                result.unique.push(url.to_string());
            }
        }
    }

    result
}
