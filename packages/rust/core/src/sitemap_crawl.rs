//! Bulk sitemap crawl: sitemap → dedup → quota → sequential crawl-and-save.

use std::time::Instant;

use serde::Serialize;
use tracing::{info, instrument, warn};

use chatkb_crawler::PageFetcher;
use chatkb_shared::{EntryId, Result};
use chatkb_sitemap::{SitemapOptions, fetch_sitemap_urls};
use chatkb_urls::{DuplicateUrl, deduplicate, find_duplicate};

use crate::knowledge::{AddOutcome, KnowledgeBase};

/// What a sitemap crawl would do, computed before any page is fetched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SitemapPlan {
    pub sitemap_url: String,
    /// URLs listed by the sitemap (after the sitemap URL cap).
    pub found: usize,
    /// URLs that will be crawled, in sitemap order.
    pub to_crawl: Vec<String>,
    /// Repeats within the sitemap itself.
    pub in_batch_duplicates: Vec<DuplicateUrl>,
    /// URLs the knowledge base already holds.
    pub already_stored: Vec<String>,
    /// URLs dropped because the link quota is exhausted.
    pub over_quota: Vec<String>,
}

/// Outcome of one page of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Saved,
    Duplicate,
    Failed,
}

/// A page that could not be crawled or saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrawlFailure {
    pub url: String,
    pub error: String,
}

/// Summary of a finished sitemap crawl.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SitemapCrawlReport {
    pub run_id: String,
    pub plan: SitemapPlan,
    pub saved: Vec<EntryId>,
    /// Pages whose final URL matched a stored entry.
    pub duplicates_after_crawl: Vec<String>,
    pub failures: Vec<CrawlFailure>,
    pub elapsed_ms: u64,
}

/// Progress callback for reporting sitemap crawl status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called before a page is fetched.
    fn page_started(&self, url: &str, current: usize, total: usize);
    /// Called once a page is saved, skipped or failed.
    fn page_finished(&self, url: &str, status: PageStatus);
    /// Called when the crawl completes.
    fn done(&self, report: &SitemapCrawlReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn page_started(&self, _url: &str, _current: usize, _total: usize) {}
    fn page_finished(&self, _url: &str, _status: PageStatus) {}
    fn done(&self, _report: &SitemapCrawlReport) {}
}

impl KnowledgeBase {
    /// Read a sitemap and decide which of its URLs a crawl would fetch.
    ///
    /// 1. Fetch the sitemap URL list
    /// 2. Drop repeats within the list
    /// 3. Drop URLs already stored
    /// 4. Keep at most the remaining link quota
    #[instrument(skip_all, fields(bot = %self.bot_name(), sitemap = %sitemap_url))]
    pub async fn plan_sitemap(&self, sitemap_url: &str) -> Result<SitemapPlan> {
        let opts = SitemapOptions {
            timeout_secs: self.config.crawl.timeout_secs,
            max_urls: self.config.limits.max_sitemap_urls,
            ..SitemapOptions::default()
        };
        let urls = fetch_sitemap_urls(sitemap_url.trim(), &opts).await?;

        let deduped = deduplicate(&urls);
        let existing = self.url_entries().await?;
        let (stored, fresh): (Vec<String>, Vec<String>) = deduped
            .unique
            .into_iter()
            .partition(|url| find_duplicate(url, None, &existing).is_some());

        let remaining = self.config.limits.max_links.saturating_sub(existing.len());
        let mut to_crawl = fresh;
        let over_quota = if to_crawl.len() > remaining {
            to_crawl.split_off(remaining)
        } else {
            Vec::new()
        };

        info!(
            found = urls.len(),
            in_batch_duplicates = deduped.duplicates.len(),
            already_stored = stored.len(),
            over_quota = over_quota.len(),
            to_crawl = to_crawl.len(),
            "sitemap crawl planned"
        );

        Ok(SitemapPlan {
            sitemap_url: sitemap_url.trim().to_string(),
            found: urls.len(),
            to_crawl,
            in_batch_duplicates: deduped.duplicates,
            already_stored: stored,
            over_quota,
        })
    }

    /// Crawl every new URL of a sitemap and save the pages.
    ///
    /// Pages are fetched and saved strictly one at a time, with the
    /// configured delay between requests. A page that fails is recorded in
    /// the report and the batch continues.
    #[instrument(skip_all, fields(bot = %self.bot_name(), sitemap = %sitemap_url))]
    pub async fn crawl_sitemap(
        &self,
        sitemap_url: &str,
        fetcher: &PageFetcher,
        progress: &dyn ProgressReporter,
    ) -> Result<SitemapCrawlReport> {
        let start = Instant::now();

        progress.phase("Reading sitemap");
        let plan = self.plan_sitemap(sitemap_url).await?;
        let run_id = self
            .storage
            .insert_crawl_run(&self.bot_id, &plan.sitemap_url)
            .await?;

        progress.phase("Crawling pages");
        let total = plan.to_crawl.len();
        let delay = self.config.crawl_delay();
        let mut saved = Vec::new();
        let mut duplicates_after_crawl = Vec::new();
        let mut failures = Vec::new();

        for (i, url) in plan.to_crawl.iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            progress.page_started(url, i + 1, total);

            let result = match fetcher.fetch(url).await {
                Ok(page) => self.add_crawled(page, true).await,
                Err(e) => Err(e),
            };

            let status = match result {
                Ok(AddOutcome::Added(entry)) => {
                    saved.push(entry.id);
                    PageStatus::Saved
                }
                Ok(AddOutcome::Duplicate { existing }) => {
                    info!(%url, existing = %existing.name, "page resolved to a stored URL");
                    duplicates_after_crawl.push(url.clone());
                    PageStatus::Duplicate
                }
                Ok(AddOutcome::LimitReached { limit }) => {
                    failures.push(CrawlFailure {
                        url: url.clone(),
                        error: format!("link limit of {limit} reached"),
                    });
                    PageStatus::Failed
                }
                Err(e) => {
                    warn!(%url, error = %e, "page failed, continuing");
                    failures.push(CrawlFailure {
                        url: url.clone(),
                        error: e.to_string(),
                    });
                    PageStatus::Failed
                }
            };
            progress.page_finished(url, status);
        }

        let report = SitemapCrawlReport {
            run_id,
            plan,
            saved,
            duplicates_after_crawl,
            failures,
            elapsed_ms: start.elapsed().as_millis() as u64,
        };

        let stats = serde_json::json!({
            "found": report.plan.found,
            "planned": total,
            "saved": report.saved.len(),
            "in_batch_duplicates": report.plan.in_batch_duplicates.len(),
            "already_stored": report.plan.already_stored.len(),
            "over_quota": report.plan.over_quota.len(),
            "duplicates_after_crawl": report.duplicates_after_crawl.len(),
            "failures": report.failures,
            "elapsed_ms": report.elapsed_ms,
        });
        self.storage
            .finish_crawl_run(&report.run_id, &stats.to_string())
            .await?;

        info!(
            saved = report.saved.len(),
            failed = report.failures.len(),
            elapsed_ms = report.elapsed_ms,
            "sitemap crawl complete"
        );
        progress.done(&report);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::knowledge::tests::{mount_page, test_fetcher, test_kb};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Records every callback for assertions.
    #[derive(Default)]
    struct RecordingProgress {
        events: Mutex<Vec<String>>,
    }

    impl ProgressReporter for RecordingProgress {
        fn phase(&self, name: &str) {
            self.events.lock().unwrap().push(format!("phase:{name}"));
        }
        fn page_started(&self, _url: &str, current: usize, total: usize) {
            self.events.lock().unwrap().push(format!("start:{current}/{total}"));
        }
        fn page_finished(&self, _url: &str, status: PageStatus) {
            self.events.lock().unwrap().push(format!("finish:{status:?}"));
        }
        fn done(&self, report: &SitemapCrawlReport) {
            self.events
                .lock()
                .unwrap()
                .push(format!("done:{}", report.saved.len()));
        }
    }

    async fn mount_sitemap(server: &MockServer, paths: &[&str]) {
        let base = server.uri();
        let entries: String = paths
            .iter()
            .map(|p| format!("<url><loc>{base}{p}</loc></url>"))
            .collect();
        Mock::given(method("GET"))
            .and(path("/sitemap.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                r#"<?xml version="1.0"?><urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">{entries}</urlset>"#
            )))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn plan_drops_batch_and_stored_duplicates_and_trims_to_quota() {
        let server = MockServer::start().await;
        mount_sitemap(&server, &["/a", "/b", "/B/", "/c", "/d", "/e"]).await;
        mount_page(&server, "/a", "A").await;

        let kb = test_kb(3).await;
        let fetcher = test_fetcher();
        assert!(kb.add_url(&format!("{}/a", server.uri()), &fetcher).await.unwrap().is_added());

        let plan = kb
            .plan_sitemap(&format!("{}/sitemap.xml", server.uri()))
            .await
            .unwrap();

        let base = server.uri();
        assert_eq!(plan.found, 6);
        assert_eq!(plan.in_batch_duplicates.len(), 1);
        assert_eq!(plan.in_batch_duplicates[0].url, format!("{base}/B/"));
        assert_eq!(plan.already_stored, vec![format!("{base}/a")]);
        assert_eq!(plan.to_crawl, vec![format!("{base}/b"), format!("{base}/c")]);
        assert_eq!(plan.over_quota, vec![format!("{base}/d"), format!("{base}/e")]);
    }

    #[tokio::test]
    async fn crawl_saves_pages_and_accumulates_failures() {
        let server = MockServer::start().await;
        mount_sitemap(&server, &["/one", "/broken", "/two", "/one/"]).await;
        mount_page(&server, "/one", "First page").await;
        mount_page(&server, "/two", "Second page").await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let kb = test_kb(10).await;
        let progress = RecordingProgress::default();
        let report = kb
            .crawl_sitemap(
                &format!("{}/sitemap.xml", server.uri()),
                &test_fetcher(),
                &progress,
            )
            .await
            .unwrap();

        assert_eq!(report.plan.to_crawl.len(), 3);
        assert_eq!(report.saved.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].url, format!("{}/broken", server.uri()));

        let entries = kb.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.is_from_sitemap()));

        let events = progress.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "phase:Reading sitemap",
                "phase:Crawling pages",
                "start:1/3",
                "finish:Saved",
                "start:2/3",
                "finish:Failed",
                "start:3/3",
                "finish:Saved",
                "done:2",
            ]
        );

        let stats = kb.storage.crawl_run_stats(&report.run_id).await.unwrap().unwrap();
        let stats: serde_json::Value = serde_json::from_str(&stats).unwrap();
        assert_eq!(stats["saved"], 2);
        assert_eq!(stats["in_batch_duplicates"], 1);
    }

    #[tokio::test]
    async fn crawl_skips_pages_redirecting_to_stored_urls() {
        let server = MockServer::start().await;
        mount_sitemap(&server, &["/alias"]).await;
        mount_page(&server, "/home", "Home").await;
        Mock::given(method("GET"))
            .and(path("/alias"))
            .respond_with(
                ResponseTemplate::new(301).insert_header("location", format!("{}/home", server.uri())),
            )
            .mount(&server)
            .await;

        let kb = test_kb(10).await;
        let fetcher = test_fetcher();
        assert!(kb.add_url(&format!("{}/home", server.uri()), &fetcher).await.unwrap().is_added());

        let report = kb
            .crawl_sitemap(&format!("{}/sitemap.xml", server.uri()), &fetcher, &SilentProgress)
            .await
            .unwrap();

        assert!(report.saved.is_empty());
        assert_eq!(report.duplicates_after_crawl, vec![format!("{}/alias", server.uri())]);
        assert_eq!(kb.entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreadable_sitemap_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sitemap.xml"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let kb = test_kb(10).await;
        let result = kb
            .crawl_sitemap(&format!("{}/sitemap.xml", server.uri()), &test_fetcher(), &SilentProgress)
            .await;
        assert!(result.is_err());
    }
}
