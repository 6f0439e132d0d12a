//! The knowledge base of one bot: add flows, removal and context assembly.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument};

use chatkb_context::{AssembledContext, assemble, build_context};
use chatkb_crawler::{CrawledPage, PageFetcher};
use chatkb_shared::{
    AppConfig, ChatKbError, ContextLimits, CrawlSettings, EntryId, EntryMetadata, EntryType,
    KnowledgeEntry, LinkLimits, Result,
};
use chatkb_storage::Storage;
use chatkb_urls::find_duplicate;

/// Limits and crawl settings a [`KnowledgeBase`] operates under.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeConfig {
    pub context: ContextLimits,
    pub limits: LinkLimits,
    pub crawl: CrawlSettings,
}

impl KnowledgeConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            context: config.context.clone(),
            limits: config.limits.clone(),
            crawl: config.crawl.clone(),
        }
    }

    /// Pause between requests of a sitemap batch.
    pub fn crawl_delay(&self) -> Duration {
        Duration::from_millis(self.crawl.delay_ms)
    }
}

/// Result of adding a URL. Rejections are values, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    /// The page was saved.
    Added(KnowledgeEntry),
    /// An equivalent URL is already stored.
    Duplicate { existing: KnowledgeEntry },
    /// The bot already holds `limit` URL entries.
    LimitReached { limit: usize },
}

impl AddOutcome {
    pub fn is_added(&self) -> bool {
        matches!(self, AddOutcome::Added(_))
    }
}

/// Entry counts for one bot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeStats {
    pub bot: String,
    pub total: usize,
    pub by_type: Vec<(EntryType, usize)>,
    pub url_entries: usize,
    pub max_links: usize,
}

impl KnowledgeStats {
    /// URL entries that may still be added.
    pub fn remaining_links(&self) -> usize {
        self.max_links.saturating_sub(self.url_entries)
    }
}

/// Knowledge base of a single bot, backed by [`Storage`].
pub struct KnowledgeBase {
    pub(crate) storage: Storage,
    pub(crate) bot_id: String,
    bot_name: String,
    pub(crate) config: KnowledgeConfig,
}

impl KnowledgeBase {
    /// Open the knowledge base of `bot_name`, registering the bot if new.
    pub async fn open(storage: Storage, bot_name: &str, config: KnowledgeConfig) -> Result<Self> {
        let bot_name = bot_name.trim();
        if bot_name.is_empty() {
            return Err(ChatKbError::validation("bot name must not be empty"));
        }

        let bot_id = storage.ensure_bot(bot_name).await?;
        debug!(bot = bot_name, %bot_id, "knowledge base opened");

        Ok(Self {
            storage,
            bot_id,
            bot_name: bot_name.to_string(),
            config,
        })
    }

    pub fn bot_name(&self) -> &str {
        &self.bot_name
    }

    pub fn config(&self) -> &KnowledgeConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Manual entries
    // -----------------------------------------------------------------------

    /// Add a free-text entry.
    pub async fn add_text(&self, title: &str, content: &str) -> Result<KnowledgeEntry> {
        self.save_manual(EntryType::Text, title, content).await
    }

    /// Add a question/answer pair.
    pub async fn add_qa(&self, question: &str, answer: &str) -> Result<KnowledgeEntry> {
        self.save_manual(EntryType::Qa, question, answer).await
    }

    /// Add the text of a UTF-8 file, named after the file.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn add_file(&self, path: &Path) -> Result<KnowledgeEntry> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ChatKbError::validation(format!("not a file: {}", path.display())))?;

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ChatKbError::io(path, e))?;
        let content = String::from_utf8(bytes)
            .ok()
            .filter(|text| !text.contains('\0'))
            .ok_or_else(|| {
                ChatKbError::validation(format!("{name}: only UTF-8 text files are supported"))
            })?;

        self.save_manual(EntryType::File, &name, &content).await
    }

    async fn save_manual(
        &self,
        kind: EntryType,
        name: &str,
        content: &str,
    ) -> Result<KnowledgeEntry> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatKbError::validation(format!("{kind} entry needs a name")));
        }

        let entry = KnowledgeEntry::new(kind, name, content);
        self.storage.insert_entry(&self.bot_id, &entry).await?;
        info!(bot = %self.bot_name, id = %entry.id, kind = %entry.kind, "entry added");
        Ok(entry)
    }

    // -----------------------------------------------------------------------
    // URL entries
    // -----------------------------------------------------------------------

    /// Crawl and save a single URL.
    ///
    /// The requested URL and the link quota are checked before any request
    /// is made; the URL actually served is checked again after the fetch.
    #[instrument(skip_all, fields(bot = %self.bot_name, url = %url))]
    pub async fn add_url(&self, url: &str, fetcher: &PageFetcher) -> Result<AddOutcome> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ChatKbError::validation("URL must not be empty"));
        }

        let existing = self.url_entries().await?;
        if let Some(dup) = find_duplicate(url, None, &existing) {
            info!(existing = %dup.id, "URL already in knowledge base");
            return Ok(AddOutcome::Duplicate {
                existing: dup.clone(),
            });
        }

        if let Some(limit) = self.quota_exceeded(&existing) {
            return Ok(AddOutcome::LimitReached { limit });
        }

        let page = fetcher.fetch(url).await?;
        self.save_page(page, false, &existing).await
    }

    /// Save an already-crawled page.
    ///
    /// Pages from a sitemap batch skip the link quota (the batch was trimmed
    /// to it up front); the duplicate check always applies and runs first.
    pub async fn add_crawled(&self, page: CrawledPage, from_sitemap: bool) -> Result<AddOutcome> {
        let existing = self.url_entries().await?;
        self.save_page(page, from_sitemap, &existing).await
    }

    fn quota_exceeded(&self, existing: &[KnowledgeEntry]) -> Option<usize> {
        let limit = self.config.limits.max_links;
        (existing.len() >= limit).then(|| {
            info!(limit, "link quota reached");
            limit
        })
    }

    async fn save_page(
        &self,
        page: CrawledPage,
        from_sitemap: bool,
        existing: &[KnowledgeEntry],
    ) -> Result<AddOutcome> {
        let mut extra = serde_json::Map::new();
        if let Some(title) = &page.title {
            extra.insert("title".into(), title.clone().into());
        }
        extra.insert("status_code".into(), page.status_code.into());

        let metadata = EntryMetadata {
            crawled_url: Some(page.crawled_url),
            from_sitemap,
            extra,
        };

        if let Some(dup) = find_duplicate(&page.requested_url, Some(&metadata), existing) {
            info!(existing = %dup.id, "crawled URL already in knowledge base");
            return Ok(AddOutcome::Duplicate {
                existing: dup.clone(),
            });
        }

        if !from_sitemap {
            if let Some(limit) = self.quota_exceeded(existing) {
                return Ok(AddOutcome::LimitReached { limit });
            }
        }

        let entry = KnowledgeEntry::new(EntryType::Url, page.requested_url, page.content)
            .with_metadata(metadata);
        self.storage.insert_entry(&self.bot_id, &entry).await?;
        info!(
            id = %entry.id,
            url = %entry.name,
            chars = entry.content.chars().count(),
            from_sitemap,
            "URL entry added"
        );
        Ok(AddOutcome::Added(entry))
    }

    pub(crate) async fn url_entries(&self) -> Result<Vec<KnowledgeEntry>> {
        self.storage
            .list_entries_by_type(&self.bot_id, &EntryType::Url)
            .await
    }

    // -----------------------------------------------------------------------
    // Listing and removal
    // -----------------------------------------------------------------------

    /// All entries, newest first.
    pub async fn entries(&self) -> Result<Vec<KnowledgeEntry>> {
        self.storage.list_entries(&self.bot_id).await
    }

    pub async fn get(&self, id: &EntryId) -> Result<Option<KnowledgeEntry>> {
        self.storage.get_entry(&self.bot_id, id).await
    }

    /// Delete one entry. Returns `false` if it did not exist.
    pub async fn delete(&self, id: &EntryId) -> Result<bool> {
        let deleted = self.storage.delete_entry(&self.bot_id, id).await?;
        info!(bot = %self.bot_name, %id, deleted, "delete entry");
        Ok(deleted)
    }

    /// Delete every entry of this bot.
    pub async fn reset(&self) -> Result<usize> {
        self.storage.reset(&self.bot_id).await
    }

    pub async fn stats(&self) -> Result<KnowledgeStats> {
        let by_type = self.storage.count_by_type(&self.bot_id).await?;
        let url_entries = by_type
            .iter()
            .find(|(kind, _)| *kind == EntryType::Url)
            .map_or(0, |(_, n)| *n);

        Ok(KnowledgeStats {
            bot: self.bot_name.clone(),
            total: by_type.iter().map(|(_, n)| n).sum(),
            by_type,
            url_entries,
            max_links: self.config.limits.max_links,
        })
    }

    // -----------------------------------------------------------------------
    // Context
    // -----------------------------------------------------------------------

    /// The prompt context under the configured limits.
    pub async fn context(&self) -> Result<String> {
        self.context_with(&self.config.context).await
    }

    pub async fn context_with(&self, limits: &ContextLimits) -> Result<String> {
        let entries = self.entries().await?;
        Ok(build_context(&entries, limits))
    }

    /// Context text plus assembly statistics.
    pub async fn assemble_context(&self, limits: &ContextLimits) -> Result<AssembledContext> {
        let entries = self.entries().await?;
        Ok(assemble(&entries, limits))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) fn temp_db() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("chatkb_core_{}.db", Uuid::now_v7()))
    }

    pub(crate) fn test_config(max_links: usize) -> KnowledgeConfig {
        KnowledgeConfig {
            limits: LinkLimits {
                max_links,
                ..Default::default()
            },
            crawl: CrawlSettings {
                timeout_secs: 5,
                delay_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub(crate) async fn test_kb(max_links: usize) -> KnowledgeBase {
        let storage = Storage::open(&temp_db()).await.expect("open db");
        KnowledgeBase::open(storage, "support", test_config(max_links))
            .await
            .expect("open kb")
    }

    pub(crate) fn test_fetcher() -> PageFetcher {
        PageFetcher::new(&CrawlSettings::default())
            .unwrap()
            .allow_private_hosts()
    }

    pub(crate) async fn mount_page(server: &MockServer, route: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                format!("<html><head><title>{route}</title></head><body><main><p>{body}</p></main></body></html>"),
                "text/html",
            ))
            .mount(server)
            .await;
    }

    fn page(requested: &str, crawled: &str) -> CrawledPage {
        CrawledPage {
            requested_url: requested.into(),
            crawled_url: crawled.into(),
            title: None,
            content: "body".into(),
            status_code: 200,
        }
    }

    #[tokio::test]
    async fn manual_entries_and_context() {
        let kb = test_kb(10).await;
        kb.add_text("Opening hours", "Mon-Fri 9-17").await.unwrap();
        kb.add_qa("Do you ship abroad?", "Yes, to the EU.").await.unwrap();

        let context = kb.context().await.unwrap();
        assert!(context.starts_with("[Q&A]\nQuestion: Do you ship abroad?\nAnswer: Yes, to the EU."));
        assert!(context.contains("[Information: Opening hours]\nMon-Fri 9-17"));

        let stats = kb.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.url_entries, 0);
        assert_eq!(stats.remaining_links(), 10);
    }

    #[tokio::test]
    async fn blank_names_are_rejected() {
        let kb = test_kb(10).await;
        assert!(kb.add_text("  ", "content").await.is_err());
        assert!(kb.add_qa("", "answer").await.is_err());
    }

    #[tokio::test]
    async fn add_file_reads_utf8_text() {
        let kb = test_kb(10).await;
        let dir = std::env::temp_dir().join(format!("chatkb_files_{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();

        let text = dir.join("returns.md");
        std::fs::write(&text, "Returns are free within 30 days.").unwrap();
        let entry = kb.add_file(&text).await.unwrap();
        assert_eq!(entry.kind, EntryType::File);
        assert_eq!(entry.name, "returns.md");

        let binary = dir.join("logo.png");
        std::fs::write(&binary, [0x89, b'P', b'N', b'G', 0x00, 0xff]).unwrap();
        assert!(matches!(
            kb.add_file(&binary).await,
            Err(ChatKbError::Validation { .. })
        ));

        assert!(matches!(
            kb.add_file(&dir.join("missing.txt")).await,
            Err(ChatKbError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn add_url_saves_page_with_metadata() {
        let server = MockServer::start().await;
        mount_page(&server, "/pricing", "Plans start at $9").await;
        let kb = test_kb(10).await;

        let url = format!("{}/pricing", server.uri());
        let outcome = kb.add_url(&url, &test_fetcher()).await.unwrap();

        let AddOutcome::Added(entry) = outcome else {
            panic!("expected Added, got {outcome:?}");
        };
        assert_eq!(entry.kind, EntryType::Url);
        assert_eq!(entry.name, url);
        assert_eq!(entry.content, "Plans start at $9");
        assert_eq!(entry.crawled_url(), Some(url.as_str()));
        assert!(!entry.is_from_sitemap());

        let meta = entry.metadata.as_ref().unwrap();
        assert_eq!(meta.extra["title"], "/pricing");
        assert_eq!(meta.extra["status_code"], 200);
    }

    #[tokio::test]
    async fn add_url_rejects_duplicate_before_fetching() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("<main>A</main>", "text/html"))
            .expect(1)
            .mount(&server)
            .await;
        let kb = test_kb(10).await;
        let fetcher = test_fetcher();

        let url = format!("{}/a", server.uri());
        assert!(kb.add_url(&url, &fetcher).await.unwrap().is_added());

        let again = kb.add_url(&format!("{url}/?utm=x"), &fetcher).await.unwrap();
        assert!(matches!(again, AddOutcome::Duplicate { existing } if existing.name == url));
    }

    #[tokio::test]
    async fn add_url_rejects_duplicate_after_redirect() {
        let server = MockServer::start().await;
        mount_page(&server, "/pricing", "Plans").await;
        Mock::given(method("GET"))
            .and(path("/go/pricing"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", format!("{}/pricing", server.uri())),
            )
            .mount(&server)
            .await;

        let kb = test_kb(10).await;
        let fetcher = test_fetcher();
        assert!(
            kb.add_url(&format!("{}/pricing", server.uri()), &fetcher)
                .await
                .unwrap()
                .is_added()
        );

        let outcome = kb
            .add_url(&format!("{}/go/pricing", server.uri()), &fetcher)
            .await
            .unwrap();
        assert!(matches!(outcome, AddOutcome::Duplicate { .. }));
        assert_eq!(kb.stats().await.unwrap().url_entries, 1);
    }

    #[tokio::test]
    async fn add_url_respects_link_quota() {
        let server = MockServer::start().await;
        mount_page(&server, "/one", "One").await;
        mount_page(&server, "/two", "Two").await;
        let kb = test_kb(1).await;
        let fetcher = test_fetcher();

        assert!(kb.add_url(&format!("{}/one", server.uri()), &fetcher).await.unwrap().is_added());
        let outcome = kb.add_url(&format!("{}/two", server.uri()), &fetcher).await.unwrap();
        assert_eq!(outcome, AddOutcome::LimitReached { limit: 1 });
    }

    #[tokio::test]
    async fn duplicate_wins_over_full_quota() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/one"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("<main>One</main>", "text/html"))
            .expect(1)
            .mount(&server)
            .await;
        let kb = test_kb(1).await;
        let fetcher = test_fetcher();

        let url = format!("{}/one", server.uri());
        assert!(kb.add_url(&url, &fetcher).await.unwrap().is_added());

        let again = kb.add_url(&format!("{url}/"), &fetcher).await.unwrap();
        assert!(matches!(again, AddOutcome::Duplicate { existing } if existing.name == url));

        let crawled = kb.add_crawled(page(&url, &url), false).await.unwrap();
        assert!(matches!(crawled, AddOutcome::Duplicate { .. }));
        let other = format!("{}/two", server.uri());
        let crawled = kb.add_crawled(page(&other, &other), false).await.unwrap();
        assert_eq!(crawled, AddOutcome::LimitReached { limit: 1 });
    }

    #[tokio::test]
    async fn add_url_fetch_failure_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let kb = test_kb(10).await;

        let result = kb.add_url(&format!("{}/down", server.uri()), &test_fetcher()).await;
        assert!(matches!(result, Err(ChatKbError::Network(_))));
        assert!(kb.entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_crawled_quota_only_for_single_adds() {
        let kb = test_kb(1).await;
        assert!(kb.add_crawled(page("https://a.com/1", "https://a.com/1"), false).await.unwrap().is_added());

        let single = kb.add_crawled(page("https://a.com/2", "https://a.com/2"), false).await.unwrap();
        assert_eq!(single, AddOutcome::LimitReached { limit: 1 });

        let batch = kb.add_crawled(page("https://a.com/3", "https://a.com/3"), true).await.unwrap();
        let AddOutcome::Added(entry) = batch else {
            panic!("expected Added");
        };
        assert!(entry.is_from_sitemap());

        let dup = kb.add_crawled(page("https://www.a.com/3/", "https://a.com/3"), true).await.unwrap();
        assert!(matches!(dup, AddOutcome::Duplicate { .. }));
    }

    #[tokio::test]
    async fn delete_and_reset() {
        let kb = test_kb(10).await;
        let a = kb.add_text("a", "a").await.unwrap();
        kb.add_text("b", "b").await.unwrap();

        assert!(kb.delete(&a.id).await.unwrap());
        assert!(!kb.delete(&a.id).await.unwrap());
        assert_eq!(kb.reset().await.unwrap(), 1);
        assert!(kb.entries().await.unwrap().is_empty());
        assert_eq!(kb.context().await.unwrap(), "");
    }

    #[tokio::test]
    async fn bots_do_not_share_entries() {
        let db = temp_db();
        let support = KnowledgeBase::open(Storage::open(&db).await.unwrap(), "support", test_config(5))
            .await
            .unwrap();
        support.add_text("only support", "x").await.unwrap();

        let sales = KnowledgeBase::open(Storage::open(&db).await.unwrap(), "sales", test_config(5))
            .await
            .unwrap();
        assert!(sales.entries().await.unwrap().is_empty());
        assert_eq!(support.entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn context_with_smaller_budget() {
        let kb = test_kb(10).await;
        kb.add_text("long", &"word ".repeat(400)).await.unwrap();

        let limits = ContextLimits::default().with_max_chars(500);
        let assembled = kb.assemble_context(&limits).await.unwrap();
        assert!(assembled.stats.partial);
        assert!(assembled.text.ends_with(chatkb_context::BUDGET_MARKER));
        assert_eq!(kb.context_with(&limits).await.unwrap(), assembled.text);
    }
}
