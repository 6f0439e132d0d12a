//! Core domain types for chatkb knowledge bases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// EntryId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for knowledge entry identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub Uuid);

impl EntryId {
    /// Generate a new time-sortable entry identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EntryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// EntryType
// ---------------------------------------------------------------------------

/// Kind of knowledge entry.
///
/// Serialized as a plain lower-case string. Unknown strings are kept in
/// [`EntryType::Other`] so newer rows survive a round-trip through older code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntryType {
    /// Question/answer pair; `name` is the question.
    Qa,
    /// Free text with a title.
    Text,
    /// Uploaded document; `name` is the file name.
    File,
    /// Crawled web page; `name` is the URL.
    Url,
    /// Any other type string.
    Other(String),
}

impl EntryType {
    /// The wire/database representation.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Qa => "qa",
            Self::Text => "text",
            Self::File => "file",
            Self::Url => "url",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for EntryType {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "qa" => Self::Qa,
            "text" => Self::Text,
            "file" => Self::File,
            "url" => Self::Url,
            _ => Self::Other(s.to_string()),
        }
    }
}

impl From<String> for EntryType {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<EntryType> for String {
    fn from(t: EntryType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// EntryMetadata
// ---------------------------------------------------------------------------

/// Optional structured metadata attached to an entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// The resolved URL actually fetched (after redirects), if it differs
    /// from or complements the entry name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawled_url: Option<String>,
    /// Set on entries created by a bulk sitemap crawl.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub from_sitemap: bool,
    /// Any other keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// KnowledgeEntry
// ---------------------------------------------------------------------------

/// One unit of training content used to ground chatbot responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    /// Unique, stable identifier.
    pub id: EntryId,
    /// Entry kind.
    #[serde(rename = "type")]
    pub kind: EntryType,
    /// Display label.
    pub name: String,
    /// Text body; may be empty.
    #[serde(default)]
    pub content: String,
    /// Optional structured metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EntryMetadata>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl KnowledgeEntry {
    /// Create a new entry with a fresh id and the current timestamp.
    pub fn new(kind: EntryType, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: EntryId::new(),
            kind,
            name: name.into(),
            content: content.into(),
            metadata: None,
            created_at: Utc::now(),
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: EntryMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The `crawled_url` metadata value, if any.
    pub fn crawled_url(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.crawled_url.as_deref())
    }

    /// Whether this entry came from a bulk sitemap crawl.
    pub fn is_from_sitemap(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.from_sitemap)
    }
}
