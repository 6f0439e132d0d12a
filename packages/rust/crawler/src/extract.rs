//! Readable-text extraction from fetched HTML.
//!
//! Picks the main content container, drops page chrome, converts what is
//! left to Markdown with `htmd` and runs a few cleanup passes over the result.

use std::sync::LazyLock;

use chatkb_shared::{ChatKbError, Result};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

/// Content containers, tried in order before falling back to `<body>`.
const CONTENT_SELECTORS: &[&str] = &["main", "article", r#"[role="main"]"#, ".content"];

/// Elements removed from the content container before conversion.
const CHROME_SELECTOR: &str =
    "nav, header, footer, aside, script, style, noscript, form, .sidebar, .nav";

/// Title and Markdown text pulled from one HTML page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedPage {
    /// `<title>`, or the first `<h1>` when the title is missing.
    pub title: Option<String>,
    /// Cleaned Markdown. Empty when the page has no readable text.
    pub text: String,
}

/// Extract the readable text of `html`. Relative links resolve against `base_url`.
pub fn extract_page(html: &str, base_url: Option<&Url>) -> Result<ExtractedPage> {
    let doc = Html::parse_document(html);
    let title = extract_title(&doc);

    let content_html = select_content(&doc);
    let content_html = strip_chrome(&content_html);
    let content_html = preprocess_tables(&content_html);

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec![
            "script", "style", "nav", "header", "footer", "aside", "iframe", "noscript", "svg",
        ])
        .build();

    let raw_markdown = converter
        .convert(&content_html)
        .map_err(|e| ChatKbError::Conversion(format!("htmd conversion failed: {e}")))?;

    let text = run_cleanup(&raw_markdown, base_url);
    debug!(raw_len = raw_markdown.len(), text_len = text.len(), "page text extracted");

    Ok(ExtractedPage { title, text })
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

fn extract_title(doc: &Html) -> Option<String> {
    ["title", "h1"].iter().find_map(|sel_str| {
        let sel = Selector::parse(sel_str).ok()?;
        let text = collapse_spaces(&doc.select(&sel).next()?.text().collect::<String>());
        (!text.is_empty()).then_some(text)
    })
}

fn select_content(doc: &Html) -> String {
    for sel_str in CONTENT_SELECTORS.iter().chain(&["body"]) {
        if let Ok(sel) = Selector::parse(sel_str) {
            if let Some(el) = doc.select(&sel).next() {
                return el.inner_html();
            }
        }
    }
    String::new()
}

/// Remove navigation and other chrome elements from an HTML fragment.
fn strip_chrome(html: &str) -> String {
    let Ok(chrome_sel) = Selector::parse(CHROME_SELECTOR) else {
        return html.to_string();
    };
    let doc = Html::parse_fragment(html);

    let mut result = doc.root_element().inner_html();
    for el in doc.select(&chrome_sel) {
        result = result.replace(&el.html(), "");
    }
    result
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// Rewrite `<table>` elements as Markdown tables; `htmd` drops table layout.
fn preprocess_tables(html: &str) -> String {
    let Ok(table_sel) = Selector::parse("table") else {
        return html.to_string();
    };
    let doc = Html::parse_fragment(html);
    if doc.select(&table_sel).next().is_none() {
        return html.to_string();
    }

    // Replace within the reserialized fragment so element HTML matches.
    let mut result = doc.root_element().inner_html();
    for table in doc.select(&table_sel) {
        result = result.replacen(&table.html(), &table_to_markdown(&table), 1);
    }
    result
}

fn table_to_markdown(table: &ElementRef) -> String {
    let (Ok(tr_sel), Ok(cell_sel)) = (Selector::parse("tr"), Selector::parse("th, td")) else {
        return String::new();
    };

    let rows: Vec<Vec<String>> = table
        .select(&tr_sel)
        .map(|tr| {
            tr.select(&cell_sel)
                .map(|cell| collapse_spaces(&cell.text().collect::<String>()).replace('|', "\\|"))
                .collect::<Vec<_>>()
        })
        .filter(|cells| !cells.is_empty())
        .collect();

    let cols = rows.iter().map(Vec::len).max().unwrap_or(0);
    if cols == 0 {
        return String::new();
    }

    let mut md = String::from("\n\n");
    md.push_str(&table_row(&rows[0], cols));
    md.push_str(&table_row(&vec!["---".to_string(); cols], cols));
    for row in &rows[1..] {
        md.push_str(&table_row(row, cols));
    }
    md.push('\n');
    md
}

fn table_row(cells: &[String], cols: usize) -> String {
    let mut padded = cells.to_vec();
    padded.resize(cols, String::new());
    format!("| {} |\n", padded.join(" | "))
}

// ---------------------------------------------------------------------------
// Cleanup passes
// ---------------------------------------------------------------------------

fn run_cleanup(md: &str, base_url: Option<&Url>) -> String {
    let mut result = strip_leftover_html(md);
    result = resolve_links(&result, base_url);
    result = trim_line_ends(&result);
    result = clean_blank_lines(&result);
    result.trim().to_string()
}

/// Remove layout tags that survived conversion, keeping their text.
fn strip_leftover_html(md: &str) -> String {
    static HTML_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"</?(?:div|span|section|article|figure|figcaption|details|summary)(?:\s[^>]*)?>")
            .expect("valid regex")
    });

    let mut in_code_block = false;
    md.lines()
        .map(|line| {
            if line.trim_start().starts_with("```") {
                in_code_block = !in_code_block;
            }
            if in_code_block {
                line.to_string()
            } else {
                HTML_TAG_RE.replace_all(line, "").into_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Resolve relative Markdown link targets against the page URL.
fn resolve_links(md: &str, base_url: Option<&Url>) -> String {
    static LINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(!?)\[([^\]]*)\]\(([^)\s]+)\)").expect("valid regex"));

    let Some(base) = base_url else {
        return md.to_string();
    };

    LINK_RE
        .replace_all(md, |caps: &regex::Captures| {
            let (bang, text, href) = (&caps[1], &caps[2], &caps[3]);
            let keep = href.starts_with('#') || href.contains("://") || href.starts_with("mailto:");
            match base.join(href) {
                Ok(resolved) if !keep => format!("{bang}[{text}]({resolved})"),
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn trim_line_ends(md: &str) -> String {
    md.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
}

/// Collapse runs of blank lines into one.
fn clean_blank_lines(md: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    MULTI_BLANK_RE.replace_all(md, "\n\n").into_owned()
}

fn collapse_spaces(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
