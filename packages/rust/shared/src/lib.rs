//! Shared types, error model, and configuration for chatkb.
//!
//! This crate is the foundation depended on by all other chatkb crates.
//! It provides:
//! - [`ChatKbError`]: the unified error type
//! - Domain types ([`KnowledgeEntry`], [`EntryType`], [`EntryMetadata`], [`EntryId`])
//! - Configuration ([`AppConfig`], [`ContextLimits`], [`CrawlSettings`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ContextLimits, CrawlSettings, DefaultsConfig, LinkLimits, config_dir,
    config_file_path, init_config, load_config, load_config_from,
};
pub use error::{ChatKbError, Result};
pub use types::{EntryId, EntryMetadata, EntryType, KnowledgeEntry};
