use crate::feed::fetcher::{FetchError, FetchSource};
use crate::feed::parser::{extract_items, ExtractError, ExtractRules, FeedItem};
use thiserror::Error;

/// Why a single candidate source was passed over.
#[derive(Debug, Error)]
pub enum CandidateFailure {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
}

/// One failed candidate, kept for reporting.
#[derive(Debug)]
pub struct CandidateAttempt {
    pub source: String,
    pub failure: CandidateFailure,
}

/// Every candidate source for an account failed this cycle.
#[derive(Debug, Error)]
#[error("all {} candidate sources failed", .attempts.len())]
pub struct SourceUnavailable {
    pub attempts: Vec<CandidateAttempt>,
}

/// The recent window taken from exactly one candidate.
#[derive(Debug)]
pub struct ResolvedSource {
    pub source: String,
    pub items: Vec<FeedItem>,
    /// Candidates tried (and failed) before `source`.
    pub failed_attempts: Vec<CandidateAttempt>,
}

/// Tries `sources` in order and returns the first one that yields items.
///
/// Windows are never merged across candidates: ranks are only meaningful
/// within the feed that produced them.
pub async fn resolve<F: FetchSource>(
    fetcher: &F,
    account: &str,
    sources: &[String],
    rules: &ExtractRules<'_>,
) -> Result<ResolvedSource, SourceUnavailable> {
    let mut attempts = Vec::new();

    for source in sources {
        let outcome = match fetcher.fetch(source).await {
            Ok(bytes) => extract_items(&bytes, rules).map_err(CandidateFailure::from),
            Err(e) => Err(CandidateFailure::from(e)),
        };

        match outcome {
            Ok(result) => {
                tracing::debug!(
                    account = %account,
                    source = %source,
                    items = result.items.len(),
                    skipped = result.skipped,
                    "Resolved source"
                );
                return Ok(ResolvedSource {
                    source: source.clone(),
                    items: result.items,
                    failed_attempts: attempts,
                });
            }
            Err(failure) => {
                tracing::warn!(
                    account = %account,
                    source = %source,
                    error = %failure,
                    "Candidate source failed, trying next"
                );
                attempts.push(CandidateAttempt {
                    source: source.clone(),
                    failure,
                });
            }
        }
    }

    Err(SourceUnavailable { attempts })
}
