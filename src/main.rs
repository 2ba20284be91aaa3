use anyhow::{Context, Result};
use clap::Parser;
use feedrelay::config::Config;
use feedrelay::feed::HttpFetcher;
use feedrelay::relay::{run_cycle, AccountOutcome, CycleOptions, CycleReport, WebhookDelivery};
use feedrelay::storage::{JsonStateStore, StateLock};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "feedrelay",
    version,
    about = "Relay new feed items to webhooks, exactly once and in order"
)]
struct Args {
    /// Config file
    #[arg(short, long, value_name = "FILE", default_value = "feedrelay.toml")]
    config: PathBuf,

    /// State file (overrides `state_path` from the config)
    #[arg(long, value_name = "FILE")]
    state: Option<PathBuf>,

    /// Number of recent items considered per account (overrides `window`)
    #[arg(long, value_name = "N")]
    window: Option<usize>,

    /// Only relay these accounts (repeatable)
    #[arg(long = "account", value_name = "NAME")]
    accounts: Vec<String>,

    /// Resolve and detect, but do not deliver or write state
    #[arg(long)]
    dry_run: bool,

    /// Remove a stale state lock before running
    #[arg(long)]
    break_lock: bool,

    /// Exit with status 2 when any account was skipped or failed delivery
    #[arg(long)]
    strict: bool,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_directive = if args.verbose {
        "feedrelay=debug"
    } else {
        "feedrelay=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive)),
        )
        .init();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = ?e, "Relay cycle aborted");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config '{}'", args.config.display()))?;

    if let Some(state) = args.state {
        config.state_path = state;
    }
    if let Some(window) = args.window {
        anyhow::ensure!(
            (1..=feedrelay::config::MAX_WINDOW).contains(&window),
            "--window must be between 1 and {}",
            feedrelay::config::MAX_WINDOW
        );
        config.window = window;
    }
    for name in &args.accounts {
        if config.account(name).is_none() {
            anyhow::bail!("Unknown account '{}' (not in {})", name, args.config.display());
        }
    }
    let config = config;

    if args.break_lock {
        StateLock::break_stale(&config.state_path).context("Failed to remove state lock")?;
    }
    // Dry runs never write state, so they do not contend for the lock.
    let _lock = if args.dry_run {
        None
    } else {
        Some(StateLock::acquire(&config.state_path)?)
    };

    let client = reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .timeout(config.timeout)
        .build()
        .context("Failed to build HTTP client")?;
    let fetcher = HttpFetcher::new(client.clone(), config.timeout);
    let delivery = WebhookDelivery::new(client, config.timeout);

    let mut store = JsonStateStore::new(&config.state_path);
    if let Some(legacy) = &config.legacy_account {
        store = store.with_legacy_account(legacy, config.normalizer.clone());
    }

    let options = CycleOptions {
        dry_run: args.dry_run,
        only_accounts: args.accounts,
    };

    let report = run_cycle(&config, &fetcher, &delivery, &store, &options)
        .await
        .context("State could not be persisted; rerun once the state file is writable")?;

    print_summary(&report);

    if args.strict && !report.failed_accounts().is_empty() {
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}

fn print_summary(report: &CycleReport) {
    for entry in &report.accounts {
        match &entry.outcome {
            AccountOutcome::UpToDate { source } => {
                println!("{}: up to date ({})", entry.account, source)
            }
            AccountOutcome::Relayed {
                source, delivered, ..
            } => {
                println!("{}: relayed {} from {}", entry.account, delivered.len(), source);
                for id in delivered {
                    println!("  {}", id);
                }
            }
            AccountOutcome::DeliveryFailed {
                delivered,
                failed,
                error,
                ..
            } => println!(
                "{}: relayed {}, stopped at {}: {}",
                entry.account,
                delivered.len(),
                failed,
                error
            ),
            AccountOutcome::SourceUnavailable(unavailable) => {
                println!("{}: skipped, {}", entry.account, unavailable);
                for attempt in &unavailable.attempts {
                    println!("  {}: {}", attempt.source, attempt.failure);
                }
            }
            AccountOutcome::Pending {
                detection, pending, ..
            } => {
                println!(
                    "{}: would relay {} ({:?})",
                    entry.account,
                    pending.len(),
                    detection
                );
                for id in pending {
                    println!("  {}", id);
                }
            }
        }
        for attempt in &entry.failed_sources {
            println!("  passed over {}: {}", attempt.source, attempt.failure);
        }
    }

    let failed = report.failed_accounts();
    tracing::info!(
        accounts = report.accounts.len(),
        delivered = report.delivered(),
        failed = failed.len(),
        "Cycle complete"
    );
}
