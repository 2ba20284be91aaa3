use crate::feed::normalize::LinkNormalizer;
use feed_rs::parser;
use std::collections::HashSet;
use thiserror::Error;
use url::Url;

/// One item of an account's recent window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    /// Link as published by the mirror that served it.
    pub display_link: String,
    /// Mirror-independent identity used for watermarks and deduplication.
    pub canonical_identity: String,
    /// Position in the newest-first window (0 = newest).
    pub rank: usize,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    /// Payload is not a parseable RSS/Atom/JSON feed
    #[error("Parse error: {0}")]
    Parse(String),
    /// Feed parsed but no entry links to a content item
    #[error("No items matching '{marker}' among {entries} entries")]
    NoItems { marker: String, entries: usize },
}

/// Per-account extraction settings.
#[derive(Debug, Clone, Copy)]
pub struct ExtractRules<'a> {
    pub item_marker: &'a str,
    pub window: usize,
    pub normalizer: &'a LinkNormalizer,
}

/// Result of extracting items with best-effort recovery.
#[derive(Debug)]
pub struct ParseResult {
    /// Newest-first, deduplicated, at most `window` long, never empty.
    pub items: Vec<FeedItem>,
    /// Matching links skipped because they were not absolute http(s) URLs.
    pub skipped: usize,
}

/// Extracts the recent item window from a raw feed payload.
///
/// Entries keep document order, which feeds publish newest-first. Entries
/// without an item link (profile/channel links, retweet stubs) are dropped
/// without consuming a rank, as are later duplicates of an identity already
/// seen in the same payload.
pub fn extract_items(bytes: &[u8], rules: &ExtractRules<'_>) -> Result<ParseResult, ExtractError> {
    let feed = parser::parse(bytes).map_err(|e| ExtractError::Parse(e.to_string()))?;
    let entries = feed.entries.len();

    let mut items: Vec<FeedItem> = Vec::new();
    let mut seen = HashSet::new();
    let mut skipped = 0;

    for entry in feed.entries {
        if items.len() >= rules.window {
            break;
        }

        let candidate = entry
            .links
            .iter()
            .map(|l| l.href.as_str())
            .find(|href| href.contains(rules.item_marker))
            .or_else(|| Some(entry.id.as_str()).filter(|id| id.contains(rules.item_marker)));

        let Some(raw) = candidate else {
            continue;
        };

        let Some(link) = parse_item_link(raw) else {
            skipped += 1;
            continue;
        };

        let canonical_identity = rules.normalizer.canonicalize(&link);
        if !seen.insert(canonical_identity.clone()) {
            tracing::debug!(identity = %canonical_identity, "Duplicate item in feed, keeping newest");
            continue;
        }

        items.push(FeedItem {
            display_link: raw.trim().to_string(),
            canonical_identity,
            rank: items.len(),
        });
    }

    if skipped > 0 {
        tracing::warn!(filtered = skipped, "Item links with invalid URLs skipped");
    }

    if items.is_empty() {
        return Err(ExtractError::NoItems {
            marker: rules.item_marker.to_string(),
            entries,
        });
    }

    Ok(ParseResult { items, skipped })
}

fn parse_item_link(raw: &str) -> Option<Url> {
    let url = Url::parse(raw.trim()).ok()?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Some(url),
        _ => None,
    }
}
