//! Knowledge base service for chatkb.
//!
//! Ties storage, page crawling, URL deduplication and context assembly into
//! the operations a bot's knowledge base exposes (e.g. [`KnowledgeBase::add_url`]).

pub mod knowledge;
pub mod sitemap_crawl;

pub use knowledge::{AddOutcome, KnowledgeBase, KnowledgeConfig, KnowledgeStats};
pub use sitemap_crawl::{
    CrawlFailure, PageStatus, ProgressReporter, SilentProgress, SitemapCrawlReport, SitemapPlan,
};
