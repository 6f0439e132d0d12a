//! URL canonicalization and duplicate detection for knowledge entries.
//!
//! Everything here is pure and infallible: malformed input degrades to a
//! best-effort string form instead of an error.
//!
//! - [`normalize`]: the canonical comparison form of a URL
//! - [`find_duplicate`]: the duplicate check run before a URL entry is saved
//! - [`deduplicate`]: in-batch dedup of sitemap URLs before crawling

mod dedup;
mod normalize;

pub use dedup::{DedupResult, DuplicateUrl, deduplicate, find_duplicate};
pub use normalize::normalize;
