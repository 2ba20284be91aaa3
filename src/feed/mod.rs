//! Feed side of the relay: turning mirror payloads into a recent item window.
//!
//! - [`fetcher`] - HTTP retrieval of one candidate source with timeout and size limit
//! - [`parser`] - `feed-rs` based extraction of ranked, deduplicated item links
//! - [`normalize`] - mirror-independent canonical identities
//! - [`resolver`] - first-working-candidate selection per account
//!
//! # Example
//!
//! ```ignore
//! use feedrelay::feed::{resolve, ExtractRules, HttpFetcher};
//!
//! let rules = ExtractRules { item_marker: "/status/", window: 10, normalizer: &config.normalizer };
//! let resolved = resolve(&fetcher, &account.name, &account.sources, &rules).await?;
//! ```

mod fetcher;
mod normalize;
mod parser;
mod resolver;

pub use fetcher::{FetchError, FetchSource, HttpFetcher};
pub use normalize::LinkNormalizer;
pub use parser::{extract_items, ExtractError, ExtractRules, FeedItem, ParseResult};
pub use resolver::{resolve, CandidateAttempt, CandidateFailure, ResolvedSource, SourceUnavailable};
