//! Single-page fetching and readable-text extraction.
//!
//! [`PageFetcher`] downloads one URL (following redirects), guards against
//! requests to private network targets and turns the HTML into the Markdown
//! text stored in a `url` knowledge entry.

pub mod extract;

use std::net::IpAddr;
use std::time::Duration;

use chatkb_shared::{ChatKbError, CrawlSettings, Result};
use reqwest::Client;
use tracing::{debug, info, instrument};
use url::Url;

pub use extract::{ExtractedPage, extract_page};

/// User-Agent string for page requests.
const USER_AGENT: &str = concat!("chatkb/", env!("CARGO_PKG_VERSION"));

/// Maximum number of redirects followed per request.
const MAX_REDIRECTS: usize = 5;

// ---------------------------------------------------------------------------
// CrawledPage
// ---------------------------------------------------------------------------

/// A fetched page and its extracted text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawledPage {
    /// The URL as requested.
    pub requested_url: String,
    /// The URL actually served after redirects.
    pub crawled_url: String,
    /// Page title, if the document has one.
    pub title: Option<String>,
    /// Extracted Markdown text. May be empty.
    pub content: String,
    /// HTTP status of the final response.
    pub status_code: u16,
}

// ---------------------------------------------------------------------------
// PageFetcher
// ---------------------------------------------------------------------------

/// HTTP client for crawling single pages.
pub struct PageFetcher {
    client: Client,
    max_page_bytes: u64,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    allow_private_hosts: bool,
}

impl PageFetcher {
    /// Create a fetcher from crawl settings.
    pub fn new(settings: &CrawlSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| ChatKbError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_page_bytes: settings.max_page_bytes,
            allow_private_hosts: false,
        })
    }

    /// Allow fetching localhost/private IPs.
    pub fn allow_private_hosts(mut self) -> Self {
        self.allow_private_hosts = true;
        self
    }

    /// Fetch `url` and extract its readable text.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn fetch(&self, url: &str) -> Result<CrawledPage> {
        let parsed = Url::parse(url.trim())
            .map_err(|e| ChatKbError::validation(format!("invalid URL {url}: {e}")))?;
        self.check_target(&parsed)?;

        debug!("fetching page");
        let mut response = self
            .client
            .get(parsed.as_str())
            .send()
            .await
            .map_err(|e| ChatKbError::Network(format!("{url}: {e}")))?;

        let final_url = response.url().clone();
        if final_url != parsed {
            self.check_target(&final_url)?;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(ChatKbError::Network(format!("{url}: HTTP {status}")));
        }

        if let Some(len) = response.content_length() {
            if len > self.max_page_bytes {
                return Err(ChatKbError::validation(format!(
                    "{url}: page too large ({len} bytes, max {})",
                    self.max_page_bytes
                )));
            }
        }

        let is_plain_text = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/plain"));

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ChatKbError::Network(format!("{url}: body read failed: {e}")))?
        {
            if (body.len() + chunk.len()) as u64 > self.max_page_bytes {
                return Err(ChatKbError::validation(format!(
                    "{url}: page exceeds {} bytes",
                    self.max_page_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }
        let body = String::from_utf8_lossy(&body);

        let page = if is_plain_text {
            ExtractedPage {
                title: None,
                text: body.trim().to_string(),
            }
        } else {
            extract_page(&body, Some(&final_url))?
        };

        info!(
            crawled_url = %final_url,
            status = status.as_u16(),
            chars = page.text.chars().count(),
            "page fetched"
        );

        Ok(CrawledPage {
            requested_url: url.to_string(),
            crawled_url: final_url.to_string(),
            title: page.title,
            content: page.text,
            status_code: status.as_u16(),
        })
    }

    fn check_target(&self, url: &Url) -> Result<()> {
        if !self.allow_private_hosts && is_ssrf_target(url) {
            return Err(ChatKbError::validation(format!(
                "refusing to fetch private or non-HTTP target: {url}"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            let host = host.to_ascii_lowercase();
            host == "localhost"
                || host.ends_with(".localhost")
                || host.ends_with(".local")
                || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 link-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().is_some_and(|v4| is_private_ip(&IpAddr::V4(v4)))
        }
    }
}
