//! libSQL storage layer for chatbot knowledge bases.
//!
//! The [`Storage`] struct wraps a local libSQL database holding bots, their
//! knowledge entries and the history of sitemap crawl runs.
//!
//! **Access rules:**
//! - CLI / host application: read-write via [`Storage::open`]
//! - Chat request path: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chatkb_shared::{ChatKbError, EntryId, EntryMetadata, EntryType, KnowledgeEntry, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, params};
use uuid::Uuid;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ChatKbError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(ChatKbError::storage)?;

        let conn = db.connect().map_err(ChatKbError::storage)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ChatKbError::Storage(format!(
                "database not found: {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(ChatKbError::storage)?;

        let conn = db.connect().map_err(ChatKbError::storage)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    ChatKbError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ChatKbError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Bot operations
    // -----------------------------------------------------------------------

    /// Look up a bot by name. Returns its ID.
    pub async fn find_bot(&self, name: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT id FROM bots WHERE name = ?1", params![name])
            .await
            .map_err(ChatKbError::storage)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get::<String>(0).map_err(ChatKbError::storage)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(ChatKbError::storage(e)),
        }
    }

    /// Return the ID of the bot called `name`, creating it if needed.
    pub async fn ensure_bot(&self, name: &str) -> Result<String> {
        if let Some(id) = self.find_bot(name).await? {
            return Ok(id);
        }

        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = timestamp(&Utc::now());
        self.conn
            .execute(
                "INSERT INTO bots (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![id.as_str(), name, now.as_str()],
            )
            .await
            .map_err(ChatKbError::storage)?;

        tracing::info!(bot = name, bot_id = %id, "created bot");
        Ok(id)
    }

    /// List all bots. Returns `Vec<(id, name)>`.
    pub async fn list_bots(&self) -> Result<Vec<(String, String)>> {
        let mut rows = self
            .conn
            .query("SELECT id, name FROM bots ORDER BY name", params![])
            .await
            .map_err(ChatKbError::storage)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push((
                row.get::<String>(0).map_err(ChatKbError::storage)?,
                row.get::<String>(1).map_err(ChatKbError::storage)?,
            ));
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Knowledge entry operations
    // -----------------------------------------------------------------------

    /// Insert a knowledge entry for a bot.
    pub async fn insert_entry(&self, bot_id: &str, entry: &KnowledgeEntry) -> Result<()> {
        self.check_writable()?;

        let metadata_json = entry
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| ChatKbError::validation(format!("metadata serialization failed: {e}")))?;

        self.conn
            .execute(
                "INSERT INTO knowledge (id, bot_id, kind, name, content, metadata_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.id.to_string(),
                    bot_id,
                    entry.kind.as_str(),
                    entry.name.as_str(),
                    entry.content.as_str(),
                    metadata_json,
                    timestamp(&entry.created_at),
                ],
            )
            .await
            .map_err(ChatKbError::storage)?;
        Ok(())
    }

    /// Get one entry by ID.
    pub async fn get_entry(&self, bot_id: &str, id: &EntryId) -> Result<Option<KnowledgeEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, kind, name, content, metadata_json, created_at
                 FROM knowledge WHERE bot_id = ?1 AND id = ?2",
                params![bot_id, id.to_string()],
            )
            .await
            .map_err(ChatKbError::storage)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_entry(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(ChatKbError::storage(e)),
        }
    }

    /// List a bot's entries, newest first.
    pub async fn list_entries(&self, bot_id: &str) -> Result<Vec<KnowledgeEntry>> {
        let rows = self
            .conn
            .query(
                "SELECT id, kind, name, content, metadata_json, created_at
                 FROM knowledge WHERE bot_id = ?1 ORDER BY created_at DESC, id DESC",
                params![bot_id],
            )
            .await
            .map_err(ChatKbError::storage)?;

        collect_entries(rows).await
    }

    /// List a bot's entries of one type, newest first.
    pub async fn list_entries_by_type(
        &self,
        bot_id: &str,
        kind: &EntryType,
    ) -> Result<Vec<KnowledgeEntry>> {
        let rows = self
            .conn
            .query(
                "SELECT id, kind, name, content, metadata_json, created_at
                 FROM knowledge WHERE bot_id = ?1 AND kind = ?2
                 ORDER BY created_at DESC, id DESC",
                params![bot_id, kind.as_str()],
            )
            .await
            .map_err(ChatKbError::storage)?;

        collect_entries(rows).await
    }

    /// Count a bot's entries per type. Empty-content entries are counted too.
    pub async fn count_by_type(&self, bot_id: &str) -> Result<Vec<(EntryType, usize)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT kind, COUNT(*) FROM knowledge WHERE bot_id = ?1 GROUP BY kind ORDER BY kind",
                params![bot_id],
            )
            .await
            .map_err(ChatKbError::storage)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let kind: String = row.get(0).map_err(ChatKbError::storage)?;
            let count: i64 = row.get(1).map_err(ChatKbError::storage)?;
            results.push((EntryType::from(kind), count as usize));
        }
        Ok(results)
    }

    /// Delete one entry. Returns `false` when no such entry exists.
    pub async fn delete_entry(&self, bot_id: &str, id: &EntryId) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "DELETE FROM knowledge WHERE bot_id = ?1 AND id = ?2",
                params![bot_id, id.to_string()],
            )
            .await
            .map_err(ChatKbError::storage)?;
        Ok(changed > 0)
    }

    /// Delete every entry of a bot. Returns the number removed.
    pub async fn reset(&self, bot_id: &str) -> Result<usize> {
        self.check_writable()?;
        let removed = self
            .conn
            .execute("DELETE FROM knowledge WHERE bot_id = ?1", params![bot_id])
            .await
            .map_err(ChatKbError::storage)?;

        tracing::info!(bot_id, removed, "knowledge base reset");
        Ok(removed as usize)
    }

    // -----------------------------------------------------------------------
    // Crawl run operations
    // -----------------------------------------------------------------------

    /// Record the start of a sitemap crawl. Returns the generated run ID.
    pub async fn insert_crawl_run(&self, bot_id: &str, sitemap_url: &str) -> Result<String> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = timestamp(&Utc::now());
        self.conn
            .execute(
                "INSERT INTO crawl_runs (id, bot_id, sitemap_url, started_at) VALUES (?1, ?2, ?3, ?4)",
                params![id.as_str(), bot_id, sitemap_url, now.as_str()],
            )
            .await
            .map_err(ChatKbError::storage)?;
        Ok(id)
    }

    /// Mark a crawl run finished with its stats.
    pub async fn finish_crawl_run(&self, run_id: &str, stats_json: &str) -> Result<()> {
        self.check_writable()?;
        let now = timestamp(&Utc::now());
        self.conn
            .execute(
                "UPDATE crawl_runs SET finished_at = ?1, stats_json = ?2 WHERE id = ?3",
                params![now.as_str(), stats_json, run_id],
            )
            .await
            .map_err(ChatKbError::storage)?;
        Ok(())
    }

    /// Stats of a finished crawl run, if any.
    pub async fn crawl_run_stats(&self, run_id: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT stats_json FROM crawl_runs WHERE id = ?1",
                params![run_id],
            )
            .await
            .map_err(ChatKbError::storage)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<String>(0).ok()),
            Ok(None) => Ok(None),
            Err(e) => Err(ChatKbError::storage(e)),
        }
    }
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

async fn collect_entries(mut rows: libsql::Rows) -> Result<Vec<KnowledgeEntry>> {
    let mut results = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        results.push(row_to_entry(&row)?);
    }
    Ok(results)
}

/// Convert a database row to a [`KnowledgeEntry`].
fn row_to_entry(row: &libsql::Row) -> Result<KnowledgeEntry> {
    let id: String = row.get(0).map_err(ChatKbError::storage)?;
    let kind: String = row.get(1).map_err(ChatKbError::storage)?;
    let metadata = match row.get::<String>(4).ok() {
        Some(json) => Some(
            serde_json::from_str::<EntryMetadata>(&json)
                .map_err(|e| ChatKbError::Storage(format!("invalid metadata for {id}: {e}")))?,
        ),
        None => None,
    };
    let created_at: String = row.get(5).map_err(ChatKbError::storage)?;

    Ok(KnowledgeEntry {
        id: id
            .parse()
            .map_err(|e| ChatKbError::Storage(format!("invalid entry id {id}: {e}")))?,
        kind: EntryType::from(kind),
        name: row.get(2).map_err(ChatKbError::storage)?,
        content: row.get::<String>(3).unwrap_or_default(),
        metadata,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| ChatKbError::Storage(format!("invalid date: {e}")))?,
    })
}
