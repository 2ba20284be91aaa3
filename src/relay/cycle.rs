use crate::config::{Account, Config};
use crate::feed::{resolve, CandidateAttempt, ExtractRules, FetchSource, SourceUnavailable};
use crate::relay::delivery::{relay_batch, DeliveryError, Destination};
use crate::relay::detector::{detect, Detection};
use crate::storage::{load_or_empty, PersistError, StateStore};
use thiserror::Error;

/// Failures that end the whole cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    /// An item was delivered but its watermark could not be recorded.
    #[error("State write failed while relaying '{account}': {source}")]
    Persistence {
        account: String,
        #[source]
        source: PersistError,
    },
}

#[derive(Debug, Clone, Default)]
pub struct CycleOptions {
    /// Resolve and detect only; nothing is delivered or persisted.
    pub dry_run: bool,
    /// Restrict the cycle to these accounts (all when empty).
    pub only_accounts: Vec<String>,
}

/// What happened to one account this cycle.
#[derive(Debug)]
pub enum AccountOutcome {
    /// The watermark is already the newest item.
    UpToDate { source: String },
    /// Every item of the batch was delivered.
    Relayed {
        source: String,
        detection: Detection,
        delivered: Vec<String>,
    },
    /// Delivery stopped at `failed`; `delivered` made it before that.
    DeliveryFailed {
        source: String,
        delivered: Vec<String>,
        failed: String,
        error: DeliveryError,
    },
    /// No candidate source produced items; the account was skipped.
    SourceUnavailable(SourceUnavailable),
    /// Dry run: these identities would have been relayed, oldest first.
    Pending {
        source: String,
        detection: Detection,
        pending: Vec<String>,
    },
}

#[derive(Debug)]
pub struct AccountReport {
    pub account: String,
    /// Candidates that failed before the one that served this cycle.
    /// Empty for [`AccountOutcome::SourceUnavailable`], which carries its own.
    pub failed_sources: Vec<CandidateAttempt>,
    pub outcome: AccountOutcome,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub accounts: Vec<AccountReport>,
}

impl CycleReport {
    pub fn delivered(&self) -> usize {
        self.accounts
            .iter()
            .map(|r| match &r.outcome {
                AccountOutcome::Relayed { delivered, .. }
                | AccountOutcome::DeliveryFailed { delivered, .. } => delivered.len(),
                _ => 0,
            })
            .sum()
    }

    /// Accounts that were skipped or stopped short; the next cycle retries them.
    pub fn failed_accounts(&self) -> Vec<&str> {
        self.accounts
            .iter()
            .filter(|r| {
                matches!(
                    r.outcome,
                    AccountOutcome::SourceUnavailable(_) | AccountOutcome::DeliveryFailed { .. }
                )
            })
            .map(|r| r.account.as_str())
            .collect()
    }
}

/// Runs one relay cycle over the configured accounts.
///
/// State is loaded once, then accounts are processed one at a time. Source and
/// delivery failures are confined to their account; only a failed state write
/// stops the cycle.
pub async fn run_cycle<F, D, S>(
    config: &Config,
    fetcher: &F,
    destination: &D,
    store: &S,
    options: &CycleOptions,
) -> Result<CycleReport, CycleError>
where
    F: FetchSource,
    D: Destination,
    S: StateStore + ?Sized,
{
    let mut state = load_or_empty(store);
    let mut report = CycleReport::default();

    let accounts = config
        .accounts
        .iter()
        .filter(|a| options.only_accounts.is_empty() || options.only_accounts.contains(&a.name));

    for account in accounts {
        let rules = ExtractRules {
            item_marker: &account.item_marker,
            window: config.window,
            normalizer: &config.normalizer,
        };

        let resolved = match resolve(fetcher, &account.name, &account.sources, &rules).await {
            Ok(resolved) => resolved,
            Err(unavailable) => {
                tracing::warn!(
                    account = %account.name,
                    error = %unavailable,
                    "Skipping account this cycle"
                );
                report.accounts.push(AccountReport {
                    account: account.name.clone(),
                    failed_sources: Vec::new(),
                    outcome: AccountOutcome::SourceUnavailable(unavailable),
                });
                continue;
            }
        };

        let changes = detect(&resolved.items, state.watermark(&account.name));
        log_detection(account, &changes.detection, changes.batch.len());

        let outcome = if changes.batch.is_empty() {
            AccountOutcome::UpToDate {
                source: resolved.source,
            }
        } else if options.dry_run {
            AccountOutcome::Pending {
                source: resolved.source,
                detection: changes.detection,
                pending: changes
                    .batch
                    .iter()
                    .map(|i| i.canonical_identity.clone())
                    .collect(),
            }
        } else {
            let relayed = relay_batch(account, &changes.batch, destination, &mut state, store)
                .await
                .map_err(|source| CycleError::Persistence {
                    account: account.name.clone(),
                    source,
                })?;

            match relayed.failure {
                None => AccountOutcome::Relayed {
                    source: resolved.source,
                    detection: changes.detection,
                    delivered: relayed.delivered,
                },
                Some((item, error)) => AccountOutcome::DeliveryFailed {
                    source: resolved.source,
                    delivered: relayed.delivered,
                    failed: item.canonical_identity,
                    error,
                },
            }
        };

        report.accounts.push(AccountReport {
            account: account.name.clone(),
            failed_sources: resolved.failed_attempts,
            outcome,
        });
    }

    Ok(report)
}

fn log_detection(account: &Account, detection: &Detection, batch: usize) {
    match detection {
        Detection::NoWatermark => tracing::info!(
            account = %account.name,
            batch = batch,
            "First contact, relaying newest item only"
        ),
        Detection::Reset => tracing::warn!(
            account = %account.name,
            batch = batch,
            "Watermark not in recent window, resetting to newest item"
        ),
        Detection::Resumed { position } => tracing::info!(
            account = %account.name,
            position = *position,
            batch = batch,
            "Resumed from watermark"
        ),
    }
}
