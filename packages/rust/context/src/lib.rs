//! Knowledge context assembly.
//!
//! Packs a bot's knowledge entries into one bounded text block for the LLM
//! system prompt. Curated content (Q&A, then free text) is placed first so it
//! survives truncation ahead of bulk-crawled pages.
//!
//! Assembly never fails: empty entries are skipped, oversized content and
//! budget overflow are truncated with in-band markers, and unknown entry
//! types sort last under a generic label.

use chatkb_shared::{ContextLimits, EntryType, KnowledgeEntry};
use serde::Serialize;
use tracing::debug;

/// Horizontal rule appended to every block.
pub const BLOCK_SEPARATOR: &str = "\n\n---\n\n";

/// Appended after the partial final block when the budget runs out.
pub const BUDGET_MARKER: &str = "\n[Knowledge base truncated to fit the context limit]";

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Assembled context plus counters for logging and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssembledContext {
    /// The text to inject into the system prompt.
    pub text: String,
    /// What happened to the input entries.
    pub stats: ContextStats,
}

/// Counters describing one assembly run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContextStats {
    /// Entries whose whole block was included.
    pub included: usize,
    /// Included entries whose content hit their per-type cap.
    pub capped: usize,
    /// Entries skipped because their content was empty.
    pub skipped_empty: usize,
    /// Whether a partial block was appended when the budget ran out.
    pub partial: bool,
    /// Non-empty entries left out entirely once the budget ran out.
    pub omitted: usize,
    /// Length of the text in characters.
    pub chars: usize,
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Build the knowledge context string for `entries` within `limits`.
///
/// Returns an empty string when no entry has content.
pub fn build_context(entries: &[KnowledgeEntry], limits: &ContextLimits) -> String {
    assemble(entries, limits).text
}

/// Same as [`build_context`], also reporting [`ContextStats`].
pub fn assemble(entries: &[KnowledgeEntry], limits: &ContextLimits) -> AssembledContext {
    let mut ordered: Vec<&KnowledgeEntry> = entries.iter().collect();
    ordered.sort_by(|a, b| {
        type_priority(&a.kind)
            .cmp(&type_priority(&b.kind))
            .then_with(|| b.created_at.cmp(&a.created_at))
    });

    let mut text = String::new();
    let mut used = 0usize;
    let mut stats = ContextStats::default();
    let mut rest: &[&KnowledgeEntry] = &[];

    for (index, entry) in ordered.iter().enumerate() {
        if is_empty(entry) {
            stats.skipped_empty += 1;
            continue;
        }

        let (block, capped) = render_block(entry, limits);
        let block_chars = block.chars().count();

        if used + block_chars <= limits.max_chars {
            text.push_str(&block);
            used += block_chars;
            stats.included += 1;
            if capped {
                stats.capped += 1;
            }
            continue;
        }

        let remaining = limits.max_chars.saturating_sub(used);
        if remaining >= limits.min_partial_chars {
            let (head, _) = truncate_chars(&block, remaining);
            text.push_str(head);
            text.push_str(BUDGET_MARKER);
            stats.partial = true;
        } else {
            stats.omitted += 1;
        }
        rest = &ordered[index + 1..];
        break;
    }

    stats.omitted += rest.iter().filter(|e| !is_empty(e)).count();
    stats.chars = text.chars().count();

    debug!(
        entries = entries.len(),
        included = stats.included,
        capped = stats.capped,
        skipped_empty = stats.skipped_empty,
        partial = stats.partial,
        omitted = stats.omitted,
        chars = stats.chars,
        max_chars = limits.max_chars,
        "knowledge context assembled"
    );

    AssembledContext { text, stats }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Sort key: lower goes first.
fn type_priority(kind: &EntryType) -> u8 {
    match kind {
        EntryType::Qa => 1,
        EntryType::Text => 2,
        EntryType::File => 3,
        EntryType::Url => 4,
        EntryType::Other(_) => 5,
    }
}

/// Per-type content cap in characters.
fn content_cap(kind: &EntryType, limits: &ContextLimits) -> usize {
    match kind {
        EntryType::Url => limits.url_cap,
        EntryType::File => limits.file_cap,
        _ => limits.default_cap,
    }
}

fn is_empty(entry: &KnowledgeEntry) -> bool {
    entry.content.trim().is_empty()
}

/// Render one labeled block. The flag reports whether content was capped.
fn render_block(entry: &KnowledgeEntry, limits: &ContextLimits) -> (String, bool) {
    let (content, capped) = truncate_chars(&entry.content, content_cap(&entry.kind, limits));

    let mut body = content.to_string();
    if capped {
        body.push_str(&format!(
            "\n[Content truncated, original size: {} bytes]",
            entry.content.len()
        ));
    }

    let name = &entry.name;
    let block = match entry.kind {
        EntryType::Qa => format!("[Q&A]\nQuestion: {name}\nAnswer: {body}"),
        EntryType::File => format!("[From document: {name}]\n{body}"),
        EntryType::Url => format!("[From webpage: {name}]\n{body}"),
        EntryType::Text | EntryType::Other(_) => format!("[Information: {name}]\n{body}"),
    };

    (block + BLOCK_SEPARATOR, capped)
}

/// Split `s` after `max` characters without breaking a code point.
fn truncate_chars(s: &str, max: usize) -> (&str, bool) {
    match s.char_indices().nth(max) {
        Some((byte_idx, _)) => (&s[..byte_idx], true),
        None => (s, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn entry(kind: EntryType, name: &str, content: &str, minutes_ago: i64) -> KnowledgeEntry {
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        KnowledgeEntry {
            created_at: base - Duration::minutes(minutes_ago),
            ..KnowledgeEntry::new(kind, name, content)
        }
    }

    fn limits(max_chars: usize) -> ContextLimits {
        ContextLimits::default().with_max_chars(max_chars)
    }

    #[test]
    fn empty_input_gives_empty_context() {
        assert_eq!(build_context(&[], &limits(1000)), "");
    }

    #[test]
    fn entries_without_content_give_empty_context() {
        let entries = vec![
            entry(EntryType::Text, "blank", "", 0),
            entry(EntryType::Url, "https://a.com", "   \n", 1),
        ];
        let assembled = assemble(&entries, &limits(1000));
        assert_eq!(assembled.text, "");
        assert_eq!(assembled.stats.skipped_empty, 2);
    }

    #[test]
    fn qa_block_precedes_url_block() {
        let entries = vec![
            entry(EntryType::Url, "https://example.com/faq", "Web page text.", 0),
            entry(EntryType::Qa, "Do you ship abroad?", "Yes, worldwide.", 0),
        ];
        let out = build_context(&entries, &limits(20_000));

        let qa = out.find("[Q&A]").expect("qa block");
        let url = out.find("[From webpage: https://example.com/faq]").expect("url block");
        assert!(qa < url);
        assert!(out.contains("Question: Do you ship abroad?\nAnswer: Yes, worldwide."));
    }

    #[test]
    fn type_priority_then_newest_first() {
        let entries = vec![
            entry(EntryType::Other("video".into()), "tour", "video transcript", 0),
            entry(EntryType::File, "manual.txt", "manual body", 0),
            entry(EntryType::Text, "older note", "old", 30),
            entry(EntryType::Text, "newer note", "new", 5),
            entry(EntryType::Url, "https://a.com", "page", 0),
        ];
        let out = build_context(&entries, &limits(20_000));

        let positions: Vec<usize> = [
            "[Information: newer note]",
            "[Information: older note]",
            "[From document: manual.txt]",
            "[From webpage: https://a.com]",
            "[Information: tour]",
        ]
        .iter()
        .map(|label| out.find(label).unwrap_or_else(|| panic!("missing {label}")))
        .collect();

        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{positions:?}");
    }

    #[test]
    fn equal_keys_keep_input_order() {
        let entries = vec![
            entry(EntryType::Text, "first", "one", 0),
            entry(EntryType::Text, "second", "two", 0),
        ];
        let out = build_context(&entries, &limits(20_000));
        assert!(out.find("first").unwrap() < out.find("second").unwrap());
    }

    #[test]
    fn every_block_ends_with_separator() {
        let entries = vec![entry(EntryType::Text, "note", "hello", 0)];
        let out = build_context(&entries, &limits(20_000));
        assert_eq!(out, "[Information: note]\nhello\n\n---\n\n");
    }

    #[test]
    fn url_content_capped_with_marker() {
        let content = "a".repeat(3_500);
        let entries = vec![entry(EntryType::Url, "https://big.example", &content, 0)];
        let assembled = assemble(&entries, &limits(20_000));
        let out = &assembled.text;

        assert!(out.contains(&"a".repeat(3_000)));
        assert!(!out.contains(&"a".repeat(3_001)));
        assert!(out.contains("[Content truncated, original size: 3500 bytes]"));
        assert_eq!(assembled.stats.capped, 1);
    }

    #[test]
    fn file_and_text_caps_differ() {
        let file = entry(EntryType::File, "doc.txt", &"f".repeat(6_000), 0);
        let text = entry(EntryType::Text, "note", &"t".repeat(6_000), 0);
        let out = build_context(&[file, text], &limits(40_000));

        assert!(out.contains(&"f".repeat(6_000)));
        assert!(out.contains(&"t".repeat(5_000)));
        assert!(!out.contains(&"t".repeat(5_001)));
    }

    #[test]
    fn cap_counts_characters_not_bytes() {
        let content = "é".repeat(3_100);
        let entries = vec![entry(EntryType::Url, "https://fr.example", &content, 0)];
        let out = build_context(&entries, &limits(20_000));

        assert!(out.contains(&"é".repeat(3_000)));
        assert!(!out.contains(&"é".repeat(3_001)));
        assert!(out.contains(&format!("original size: {} bytes", content.len())));
    }

    fn five_text_entries() -> Vec<KnowledgeEntry> {
        ["alpha", "beta", "gamma", "delta", "epsilon"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let digit = char::from(b'1' + i as u8);
                entry(
                    EntryType::Text,
                    name,
                    &digit.to_string().repeat(1_000),
                    i as i64,
                )
            })
            .collect()
    }

    #[test]
    fn budget_overflow_appends_partial_block() {
        let entries = five_text_entries();
        let assembled = assemble(&entries, &limits(2_500));
        let out = &assembled.text;

        assert_eq!(
            out.chars().count(),
            2_500 + BUDGET_MARKER.chars().count()
        );
        assert!(out.ends_with(BUDGET_MARKER));
        assert!(out.contains("[Information: gamma]"));
        assert!(!out.contains("delta"));
        assert!(!out.contains("4444"));
        assert!(!out.contains("epsilon"));

        assert_eq!(assembled.stats.included, 2);
        assert!(assembled.stats.partial);
        assert_eq!(assembled.stats.omitted, 2);
    }

    #[test]
    fn too_little_room_for_partial_block() {
        let entries = five_text_entries();
        // alpha (1028) + beta (1027) leaves 45 characters.
        let assembled = assemble(&entries, &limits(2_100));
        let out = &assembled.text;

        assert!(out.chars().count() <= 2_100);
        assert!(out.ends_with(BLOCK_SEPARATOR));
        assert!(!out.contains(BUDGET_MARKER));
        assert!(!out.contains("gamma"));
        assert_eq!(assembled.stats.included, 2);
        assert!(!assembled.stats.partial);
        assert_eq!(assembled.stats.omitted, 3);
    }

    #[test]
    fn partial_block_threshold_is_inclusive() {
        let entries = five_text_entries();

        // alpha (1028) + beta (1027) leaves exactly 200 characters.
        let at = assemble(&entries, &limits(2_255));
        assert!(at.stats.partial);
        assert!(at.text.ends_with(BUDGET_MARKER));
        assert_eq!(at.text.chars().count(), 2_255 + BUDGET_MARKER.chars().count());

        let below = assemble(&entries, &limits(2_254));
        assert!(!below.stats.partial);
        assert!(below.text.ends_with(BLOCK_SEPARATOR));
        assert_eq!(below.text.chars().count(), 2_055);
    }

    #[test]
    fn output_never_exceeds_budget_plus_marker() {
        let entries = five_text_entries();
        for max_chars in [0, 150, 600, 1_027, 1_028, 1_300, 3_000, 4_000, 10_000] {
            let out = build_context(&entries, &limits(max_chars));
            assert!(
                out.chars().count() <= max_chars + BUDGET_MARKER.chars().count(),
                "budget {max_chars} exceeded: {}",
                out.chars().count()
            );
        }
    }

    #[test]
    fn custom_caps_are_honored() {
        let limits = ContextLimits {
            max_chars: 10_000,
            url_cap: 10,
            file_cap: 10,
            default_cap: 10,
            min_partial_chars: 200,
        };
        let entries = vec![entry(EntryType::Qa, "q", "0123456789ABCDEF", 0)];
        let out = build_context(&entries, &limits);
        assert!(out.contains("Answer: 0123456789\n[Content truncated, original size: 16 bytes]"));
    }
}
