//! XML sitemap fetching.
//!
//! A sitemap crawl starts here: the sitemap (or sitemap index) is downloaded
//! and flattened into the list of page URLs to crawl. Index documents are
//! expanded one level deep; nested indexes are not followed.

mod parser;

use std::time::Duration;

use chatkb_shared::{ChatKbError, Result};
use reqwest::Client;
use tracing::{debug, info, instrument, warn};
use url::Url;

pub use parser::{Sitemap, parse_sitemap};

/// Maximum number of redirects to follow when fetching a sitemap.
const MAX_REDIRECTS: usize = 5;

/// Default timeout in seconds for sitemap requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default maximum sitemap size (10 MB).
const MAX_RESPONSE_SIZE: u64 = 10 * 1024 * 1024;

/// Default cap on collected page URLs.
const DEFAULT_MAX_URLS: usize = 500;

/// User-Agent string for sitemap requests.
const USER_AGENT: &str = concat!("chatkb/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Configuration for sitemap fetching.
#[derive(Debug, Clone)]
pub struct SitemapOptions {
    /// Timeout for HTTP requests in seconds.
    pub timeout_secs: u64,
    /// Stop collecting once this many page URLs are found.
    pub max_urls: usize,
    /// Largest sitemap document accepted, in bytes.
    pub max_bytes: u64,
}

impl Default for SitemapOptions {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_urls: DEFAULT_MAX_URLS,
            max_bytes: MAX_RESPONSE_SIZE,
        }
    }
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

/// Fetch a sitemap and return its page URLs in document order.
///
/// For a sitemap index, each child sitemap is fetched in turn; children that
/// fail to download or parse are logged and skipped. Collection stops at
/// `opts.max_urls`.
#[instrument(skip_all, fields(url = %sitemap_url))]
pub async fn fetch_sitemap_urls(sitemap_url: &str, opts: &SitemapOptions) -> Result<Vec<String>> {
    let url = Url::parse(sitemap_url)
        .map_err(|e| ChatKbError::validation(format!("invalid sitemap URL {sitemap_url}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ChatKbError::validation(format!(
            "unsupported sitemap scheme: {}",
            url.scheme()
        )));
    }

    let client = build_client(opts)?;
    let root = fetch_and_parse(&client, url.as_str(), opts.max_bytes).await?;

    let mut urls = match root {
        Sitemap::UrlSet(urls) => urls,
        Sitemap::Index(children) => {
            info!(children = children.len(), "expanding sitemap index");
            let mut urls = Vec::new();
            for child in &children {
                if urls.len() >= opts.max_urls {
                    break;
                }
                match fetch_and_parse(&client, child, opts.max_bytes).await {
                    Ok(Sitemap::UrlSet(child_urls)) => {
                        debug!(child = %child, urls = child_urls.len(), "child sitemap read");
                        urls.extend(child_urls);
                    }
                    Ok(Sitemap::Index(_)) => {
                        warn!(child = %child, "nested sitemap index skipped");
                    }
                    Err(e) => {
                        warn!(child = %child, error = %e, "child sitemap failed, skipping");
                    }
                }
            }
            urls
        }
    };

    if urls.len() > opts.max_urls {
        debug!(found = urls.len(), max = opts.max_urls, "truncating sitemap URLs");
        urls.truncate(opts.max_urls);
    }

    info!(urls = urls.len(), "sitemap read");
    Ok(urls)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build a reqwest client with appropriate settings.
fn build_client(opts: &SitemapOptions) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(Duration::from_secs(opts.timeout_secs))
        .build()
        .map_err(|e| ChatKbError::Network(format!("failed to build HTTP client: {e}")))
}

/// Fetch a sitemap document and parse it.
async fn fetch_and_parse(client: &Client, url: &str, max_bytes: u64) -> Result<Sitemap> {
    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(|e| ChatKbError::Network(format!("{url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ChatKbError::Network(format!("{url}: HTTP {status}")));
    }

    if let Some(len) = response.content_length() {
        if len > max_bytes {
            return Err(ChatKbError::validation(format!(
                "{url}: sitemap too large ({len} bytes, max {max_bytes})"
            )));
        }
    }

    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| ChatKbError::Network(format!("{url}: failed to read body: {e}")))?
    {
        if (body.len() + chunk.len()) as u64 > max_bytes {
            return Err(ChatKbError::validation(format!(
                "{url}: sitemap exceeds {max_bytes} bytes"
            )));
        }
        body.extend_from_slice(&chunk);
    }
    let body = String::from_utf8_lossy(&body);

    parse_sitemap(&body).map_err(|e| ChatKbError::parse(format!("{url}: {e}")))
}
