//! CLI command definitions, routing, and tracing setup.

use std::io::Read;
use std::path::{Path, PathBuf};

use chatkb_core::{
    AddOutcome, KnowledgeBase, KnowledgeConfig, PageStatus, ProgressReporter, SitemapCrawlReport,
};
use chatkb_crawler::PageFetcher;
use chatkb_shared::{AppConfig, EntryId, EntryType, KnowledgeEntry, init_config, load_config};
use chatkb_storage::Storage;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// chatkb: manage chatbot knowledge bases and build their prompt context.
#[derive(Parser)]
#[command(
    name = "chatkb",
    version,
    about = "Manage chatbot knowledge bases and assemble their prompt context.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Database path (overrides `defaults.db_path`).
    #[arg(long, env = "CHATKB_DB", global = true)]
    pub db: Option<PathBuf>,

    /// Bot whose knowledge base to use (overrides `defaults.bot`).
    #[arg(long, env = "CHATKB_BOT", global = true)]
    pub bot: Option<String>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Add a knowledge entry.
    Add {
        #[command(subcommand)]
        entry: AddEntry,
    },

    /// Crawl every page of an XML sitemap into the knowledge base.
    Sitemap {
        /// Sitemap or sitemap index URL.
        url: String,

        /// Only show which URLs would be crawled.
        #[arg(long)]
        dry_run: bool,

        /// Print the plan or report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List the bot's entries, newest first.
    List {
        /// Only entries of this type (qa, text, file, url, ...).
        #[arg(long = "type")]
        kind: Option<String>,

        /// Print entries as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Delete one entry by ID.
    Delete {
        /// Entry ID as shown by `list`.
        id: String,
    },

    /// Delete every entry of the bot.
    Reset {
        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },

    /// Print the assembled prompt context.
    Context {
        /// Character budget (overrides `context.max_chars`).
        #[arg(long)]
        max_chars: Option<usize>,

        /// Print assembly statistics to stderr.
        #[arg(long)]
        stats: bool,
    },

    /// Print the normalized form of each URL.
    Normalize {
        /// URLs to normalize.
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Remove duplicate URLs from a list (one per line).
    Dedup {
        /// File with one URL per line, or `-` for stdin.
        input: String,

        /// Print the full result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// `add` subcommands.
#[derive(Subcommand)]
pub(crate) enum AddEntry {
    /// Free text with a title. Use `-` as content to read stdin.
    Text { title: String, content: String },
    /// A question and its answer. Use `-` as answer to read stdin.
    Qa { question: String, answer: String },
    /// The contents of a UTF-8 text file.
    File { path: PathBuf },
    /// A single web page.
    Url { url: String },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "chatkb=info",
        1 => "chatkb=debug",
        _ => "chatkb=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Database and bot selection resolved from flags and config.
struct Target {
    config: AppConfig,
    db_path: PathBuf,
    bot: String,
}

impl Target {
    fn resolve(db: Option<PathBuf>, bot: Option<String>) -> Result<Self> {
        let config = load_config()?;
        let db_path = match db {
            Some(path) => path,
            None => config.defaults.resolved_db_path()?,
        };
        let bot = bot.unwrap_or_else(|| config.defaults.bot.clone());
        Ok(Self {
            config,
            db_path,
            bot,
        })
    }

    async fn open(&self) -> Result<KnowledgeBase> {
        let storage = Storage::open(&self.db_path).await?;
        Ok(KnowledgeBase::open(storage, &self.bot, KnowledgeConfig::from_app(&self.config)).await?)
    }

    async fn open_readonly(&self) -> Result<KnowledgeBase> {
        let storage = Storage::open_readonly(&self.db_path).await?;
        if storage.find_bot(&self.bot).await?.is_none() {
            return Err(eyre!(
                "bot '{}' has no knowledge base in {}",
                self.bot,
                self.db_path.display()
            ));
        }
        Ok(KnowledgeBase::open(storage, &self.bot, KnowledgeConfig::from_app(&self.config)).await?)
    }

    fn fetcher(&self) -> Result<PageFetcher> {
        Ok(PageFetcher::new(&self.config.crawl)?)
    }
}

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let Cli { db, bot, command, .. } = cli;

    let target = || Target::resolve(db.clone(), bot.clone());

    match command {
        Command::Add { entry } => cmd_add(&target()?, entry).await,
        Command::Sitemap { url, dry_run, json } => {
            cmd_sitemap(&target()?, &url, dry_run, json).await
        }
        Command::List { kind, json } => cmd_list(&target()?, kind.as_deref(), json).await,
        Command::Delete { id } => cmd_delete(&target()?, &id).await,
        Command::Reset { yes } => cmd_reset(&target()?, yes).await,
        Command::Context { max_chars, stats } => cmd_context(&target()?, max_chars, stats).await,
        Command::Normalize { urls } => cmd_normalize(&urls),
        Command::Dedup { input, json } => cmd_dedup(&input, json),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Knowledge base commands
// ---------------------------------------------------------------------------

async fn cmd_add(target: &Target, entry: AddEntry) -> Result<()> {
    let kb = target.open().await?;

    let added = match entry {
        AddEntry::Text { title, content } => kb.add_text(&title, &read_arg(&content)?).await?,
        AddEntry::Qa { question, answer } => kb.add_qa(&question, &read_arg(&answer)?).await?,
        AddEntry::File { path } => kb.add_file(&path).await?,
        AddEntry::Url { url } => {
            info!(url, bot = %target.bot, "adding URL");
            match kb.add_url(&url, &target.fetcher()?).await? {
                AddOutcome::Added(entry) => entry,
                AddOutcome::Duplicate { existing } => {
                    return Err(eyre!(
                        "'{url}' is already in the knowledge base as {} ({})",
                        existing.name,
                        existing.id
                    ));
                }
                AddOutcome::LimitReached { limit } => {
                    return Err(eyre!(
                        "link limit reached: bot '{}' already has {limit} URL entries",
                        target.bot
                    ));
                }
            }
        }
    };

    println!("Added {} entry {}", added.kind, added.id);
    println!("  Name:  {}", added.name);
    println!("  Chars: {}", added.content.chars().count());
    if let Some(crawled) = added.crawled_url().filter(|c| *c != added.name) {
        println!("  From:  {crawled}");
    }
    Ok(())
}

async fn cmd_sitemap(target: &Target, url: &str, dry_run: bool, json: bool) -> Result<()> {
    let kb = target.open().await?;

    if dry_run {
        let plan = kb.plan_sitemap(url).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&plan)?);
            return Ok(());
        }

        println!("Sitemap {}: {} URLs found", plan.sitemap_url, plan.found);
        for dup in &plan.in_batch_duplicates {
            println!("  duplicate  {} (same as {})", dup.url, dup.conflicts_with);
        }
        for url in &plan.already_stored {
            println!("  stored     {url}");
        }
        for url in &plan.over_quota {
            println!("  over quota {url}");
        }
        for url in &plan.to_crawl {
            println!("  crawl      {url}");
        }
        println!("{} page(s) would be crawled", plan.to_crawl.len());
        return Ok(());
    }

    let reporter = CliProgress::new();
    let report = kb.crawl_sitemap(url, &target.fetcher()?, &reporter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("  Sitemap crawl finished");
    println!("  Found:            {}", report.plan.found);
    println!("  Saved:            {}", report.saved.len());
    println!("  Batch duplicates: {}", report.plan.in_batch_duplicates.len());
    println!("  Already stored:   {}", report.plan.already_stored.len());
    println!("  Over link limit:  {}", report.plan.over_quota.len());
    println!("  Redirect dups:    {}", report.duplicates_after_crawl.len());
    println!("  Failed:           {}", report.failures.len());
    for failure in &report.failures {
        println!("    {}: {}", failure.url, failure.error);
    }
    println!("  Time:             {:.1}s", report.elapsed_ms as f64 / 1000.0);
    println!();
    Ok(())
}

async fn cmd_list(target: &Target, kind: Option<&str>, json: bool) -> Result<()> {
    let kb = target.open_readonly().await?;
    let mut entries = kb.entries().await?;
    if let Some(kind) = kind {
        let kind = EntryType::from(kind);
        entries.retain(|e| e.kind == kind);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for entry in &entries {
        println!("{}", format_entry_line(entry));
    }

    let stats = kb.stats().await?;
    let counts: Vec<String> = stats
        .by_type
        .iter()
        .map(|(kind, n)| format!("{kind}: {n}"))
        .collect();
    println!();
    println!(
        "{} entries for '{}' ({}); {}/{} links used",
        stats.total,
        stats.bot,
        if counts.is_empty() { "none".to_string() } else { counts.join(", ") },
        stats.url_entries,
        stats.max_links
    );
    Ok(())
}

async fn cmd_delete(target: &Target, id: &str) -> Result<()> {
    let id: EntryId = id
        .trim()
        .parse()
        .map_err(|e| eyre!("invalid entry ID '{id}': {e}"))?;
    let kb = target.open().await?;

    if !kb.delete(&id).await? {
        return Err(eyre!("no entry {id} for bot '{}'", target.bot));
    }
    println!("Deleted {id}");
    Ok(())
}

async fn cmd_reset(target: &Target, yes: bool) -> Result<()> {
    if !yes {
        return Err(eyre!(
            "this deletes every entry of bot '{}'; re-run with --yes to confirm",
            target.bot
        ));
    }
    let kb = target.open().await?;
    let removed = kb.reset().await?;
    println!("Removed {removed} entries from '{}'", target.bot);
    Ok(())
}

async fn cmd_context(target: &Target, max_chars: Option<usize>, stats: bool) -> Result<()> {
    let kb = target.open_readonly().await?;
    let mut limits = kb.config().context.clone();
    if let Some(max_chars) = max_chars {
        if max_chars == 0 {
            return Err(eyre!("--max-chars must be greater than 0"));
        }
        limits = limits.with_max_chars(max_chars);
    }

    let assembled = kb.assemble_context(&limits).await?;
    print!("{}", assembled.text);

    if stats {
        let s = &assembled.stats;
        eprintln!(
            "included={} capped={} empty={} partial={} omitted={} chars={}/{}",
            s.included, s.capped, s.skipped_empty, s.partial, s.omitted, s.chars, limits.max_chars
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// URL utilities
// ---------------------------------------------------------------------------

fn cmd_normalize(urls: &[String]) -> Result<()> {
    for url in urls {
        println!("{}", chatkb_urls::normalize(url));
    }
    Ok(())
}

fn cmd_dedup(input: &str, json: bool) -> Result<()> {
    let text = if input == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .wrap_err("failed to read stdin")?;
        buf
    } else {
        std::fs::read_to_string(Path::new(input)).wrap_err_with(|| format!("failed to read {input}"))?
    };

    let urls = read_url_list(&text);
    let result = chatkb_urls::deduplicate(&urls);

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    for url in &result.unique {
        println!("{url}");
    }
    for dup in &result.duplicates {
        eprintln!("duplicate: {} (same as {})", dup.url, dup.conflicts_with);
    }
    eprintln!(
        "{} unique, {} duplicate(s)",
        result.unique.len(),
        result.duplicates.len()
    );
    Ok(())
}

/// Non-empty, non-comment lines of a URL list.
fn read_url_list(text: &str) -> Vec<&str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect()
}

// ---------------------------------------------------------------------------
// Config commands
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `-` reads the value from stdin.
fn read_arg(value: &str) -> Result<String> {
    if value != "-" {
        return Ok(value.to_string());
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .wrap_err("failed to read stdin")?;
    Ok(buf)
}

fn format_entry_line(entry: &KnowledgeEntry) -> String {
    let mut line = format!(
        "{}  {:<5} {:>7} chars  {}",
        entry.id,
        entry.kind.as_str(),
        entry.content.chars().count(),
        entry.name
    );
    if entry.is_from_sitemap() {
        line.push_str("  [sitemap]");
    }
    line
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using indicatif spinners.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn page_started(&self, url: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Crawling [{current}/{total}] {url}"));
    }

    fn page_finished(&self, url: &str, status: PageStatus) {
        match status {
            PageStatus::Saved => {}
            PageStatus::Duplicate => self.spinner.println(format!("  = {url} (duplicate)")),
            PageStatus::Failed => self.spinner.println(format!("  ✗ {url}")),
        }
    }

    fn done(&self, _report: &SitemapCrawlReport) {
        self.spinner.finish_and_clear();
    }
}
