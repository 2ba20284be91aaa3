//! Configuration file parser for `feedrelay.toml`.
//!
//! The file is required: it names the accounts to relay. One [`Config`] is built
//! at startup, adjusted by command-line overrides, and then only borrowed by the
//! relay cycle. Unknown keys are accepted by serde and logged as warnings.
use crate::feed::LinkNormalizer;
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// The file parsed but describes an unusable setup.
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// `webhook_url_env` names a variable that is not set.
    #[error("Webhook for account '{account}' not configured: environment variable {var} is not set")]
    MissingWebhookEnv { account: String, var: String },
}

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_WINDOW: usize = 10;
pub const MAX_WINDOW: usize = 100;
pub const DEFAULT_TIMEOUT_SECS: u64 = 20;
pub const MAX_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_ITEM_MARKER: &str = "/status/";
pub const DEFAULT_MESSAGE_TEMPLATE: &str = "{link}";
pub const DEFAULT_USER_AGENT: &str =
    concat!("Mozilla/5.0 (compatible; feedrelay/", env!("CARGO_PKG_VERSION"), ")");

// ============================================================================
// File Layout
// ============================================================================

#[derive(Deserialize)]
#[serde(default)]
struct ConfigFile {
    state_path: PathBuf,
    window: usize,
    timeout_secs: u64,
    user_agent: String,
    canonical_domain: Option<String>,
    mirror_domains: Vec<String>,
    item_marker: String,
    message_template: String,
    legacy_account: Option<String>,
    accounts: Vec<AccountFile>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("state.json"),
            window: DEFAULT_WINDOW,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            canonical_domain: None,
            mirror_domains: Vec::new(),
            item_marker: DEFAULT_ITEM_MARKER.to_string(),
            message_template: DEFAULT_MESSAGE_TEMPLATE.to_string(),
            legacy_account: None,
            accounts: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
struct AccountFile {
    name: String,
    #[serde(default)]
    sources: Vec<String>,
    item_marker: Option<String>,
    message_template: Option<String>,
    destination: DestinationFile,
}

#[derive(Deserialize)]
struct DestinationFile {
    webhook_url: Option<String>,
    webhook_url_env: Option<String>,
    thread_id: Option<String>,
}

const KNOWN_KEYS: [&str; 10] = [
    "state_path",
    "window",
    "timeout_secs",
    "user_agent",
    "canonical_domain",
    "mirror_domains",
    "item_marker",
    "message_template",
    "legacy_account",
    "accounts",
];

const ACCOUNT_KEYS: [&str; 5] = [
    "name",
    "sources",
    "item_marker",
    "message_template",
    "destination",
];

const DESTINATION_KEYS: [&str; 3] = ["webhook_url", "webhook_url_env", "thread_id"];

/// Dotted paths of keys serde will ignore, e.g. `accounts.imassc.destination.thred_id`.
///
/// Accounts are named by their `name` when present, else by their position.
fn unknown_keys(raw: &toml::Table) -> Vec<String> {
    let mut unknown: Vec<String> = raw
        .keys()
        .filter(|key| !KNOWN_KEYS.contains(&key.as_str()))
        .cloned()
        .collect();

    let accounts = raw
        .get("accounts")
        .and_then(toml::Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for (index, account) in accounts.iter().enumerate() {
        let Some(table) = account.as_table() else {
            continue;
        };
        let label = table
            .get("name")
            .and_then(toml::Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| index.to_string());

        for key in table.keys() {
            if !ACCOUNT_KEYS.contains(&key.as_str()) {
                unknown.push(format!("accounts.{}.{}", label, key));
            }
        }
        if let Some(destination) = table.get("destination").and_then(toml::Value::as_table) {
            for key in destination.keys() {
                if !DESTINATION_KEYS.contains(&key.as_str()) {
                    unknown.push(format!("accounts.{}.destination.{}", label, key));
                }
            }
        }
    }

    unknown
}

// ============================================================================
// Resolved Configuration
// ============================================================================

/// Where an account's items are posted.
///
/// The webhook URL embeds its access token, so `Debug` never prints it.
#[derive(Clone)]
pub struct DestinationConfig {
    pub webhook_url: SecretString,
    /// Forum thread to post into, sent as the `thread_id` query parameter.
    pub thread_id: Option<String>,
}

impl std::fmt::Debug for DestinationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationConfig")
            .field("webhook_url", &"[REDACTED]")
            .field("thread_id", &self.thread_id)
            .finish()
    }
}

/// One watched account: where to read it and where to relay it.
#[derive(Debug, Clone)]
pub struct Account {
    pub name: String,
    /// Mirrors in preference order; the first one that yields items wins.
    pub sources: Vec<String>,
    /// Path marker that distinguishes item links from profile/channel links.
    pub item_marker: String,
    pub message_template: String,
    pub destination: DestinationConfig,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub state_path: PathBuf,
    /// How many of the newest matching items are considered per cycle.
    pub window: usize,
    pub timeout: Duration,
    pub user_agent: String,
    pub normalizer: LinkNormalizer,
    /// Account that inherits a pre-versioned `{"last_link": ...}` state file.
    pub legacy_account: Option<String>,
    pub accounts: Vec<Account>,
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file, resolving `webhook_url_env`
    /// references against the process environment.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let meta = std::fs::metadata(path)?;
        if meta.len() > Self::MAX_FILE_SIZE {
            return Err(ConfigError::TooLarge(format!(
                "Config file is {} bytes (max {} bytes)",
                meta.len(),
                Self::MAX_FILE_SIZE
            )));
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content, |var| std::env::var(var).ok())?;
        tracing::info!(
            path = %path.display(),
            accounts = config.accounts.len(),
            window = config.window,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate configuration text.
    ///
    /// `env` resolves `webhook_url_env` names; it is a parameter so tests do not
    /// have to touch the process environment.
    pub fn from_toml_str<E>(content: &str, env: E) -> Result<Self, ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in unknown_keys(&raw) {
                tracing::warn!(key = %key, "Unknown key in config file, ignoring");
            }
        }

        let file: ConfigFile = toml::from_str(content)?;
        Self::resolve(file, &env)
    }

    fn resolve<E>(file: ConfigFile, env: &E) -> Result<Self, ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        if !(1..=MAX_WINDOW).contains(&file.window) {
            return Err(ConfigError::Invalid(format!(
                "window must be between 1 and {}, got {}",
                MAX_WINDOW, file.window
            )));
        }
        if !(1..=MAX_TIMEOUT_SECS).contains(&file.timeout_secs) {
            return Err(ConfigError::Invalid(format!(
                "timeout_secs must be between 1 and {}, got {}",
                MAX_TIMEOUT_SECS, file.timeout_secs
            )));
        }
        if file.canonical_domain.is_none() && !file.mirror_domains.is_empty() {
            return Err(ConfigError::Invalid(
                "mirror_domains requires canonical_domain".to_string(),
            ));
        }
        if file.accounts.is_empty() {
            return Err(ConfigError::Invalid("no [[accounts]] configured".to_string()));
        }

        let normalizer = LinkNormalizer::new(
            file.canonical_domain.as_deref(),
            file.mirror_domains.as_slice(),
        );

        let mut seen = HashSet::new();
        let mut accounts = Vec::with_capacity(file.accounts.len());
        for account in file.accounts {
            let name = account.name.trim().to_string();
            if name.is_empty() {
                return Err(ConfigError::Invalid("account name must not be empty".to_string()));
            }
            if !seen.insert(name.clone()) {
                return Err(ConfigError::Invalid(format!("duplicate account '{}'", name)));
            }
            if account.sources.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "account '{}' has no sources",
                    name
                )));
            }
            for source in &account.sources {
                validate_http_url(source).map_err(|reason| {
                    ConfigError::Invalid(format!(
                        "account '{}': source '{}' {}",
                        name, source, reason
                    ))
                })?;
            }

            let item_marker = account
                .item_marker
                .unwrap_or_else(|| file.item_marker.clone());
            if item_marker.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "account '{}': item_marker must not be empty",
                    name
                )));
            }

            let destination = resolve_destination(&name, account.destination, env)?;

            accounts.push(Account {
                name,
                sources: account.sources,
                item_marker,
                message_template: account
                    .message_template
                    .unwrap_or_else(|| file.message_template.clone()),
                destination,
            });
        }

        if let Some(legacy) = &file.legacy_account {
            if !seen.contains(legacy) {
                return Err(ConfigError::Invalid(format!(
                    "legacy_account '{}' is not a configured account",
                    legacy
                )));
            }
        }

        Ok(Self {
            state_path: file.state_path,
            window: file.window,
            timeout: Duration::from_secs(file.timeout_secs),
            user_agent: file.user_agent,
            normalizer,
            legacy_account: file.legacy_account,
            accounts,
        })
    }

    pub fn account(&self, name: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.name == name)
    }
}

fn resolve_destination<E>(
    account: &str,
    file: DestinationFile,
    env: &E,
) -> Result<DestinationConfig, ConfigError>
where
    E: Fn(&str) -> Option<String>,
{
    let url = match (file.webhook_url, file.webhook_url_env) {
        (Some(_), Some(_)) => {
            return Err(ConfigError::Invalid(format!(
                "account '{}': set only one of webhook_url and webhook_url_env",
                account
            )))
        }
        (Some(url), None) => url,
        (None, Some(var)) => env(&var).ok_or_else(|| ConfigError::MissingWebhookEnv {
            account: account.to_string(),
            var: var.clone(),
        })?,
        (None, None) => {
            return Err(ConfigError::Invalid(format!(
                "account '{}': destination needs webhook_url or webhook_url_env",
                account
            )))
        }
    };

    // The reason is reported without the URL itself.
    validate_http_url(&url).map_err(|reason| {
        ConfigError::Invalid(format!("account '{}': webhook URL {}", account, reason))
    })?;

    Ok(DestinationConfig {
        webhook_url: SecretString::from(url),
        thread_id: file.thread_id.filter(|t| !t.trim().is_empty()),
    })
}

fn validate_http_url(raw: &str) -> Result<Url, &'static str> {
    let url = Url::parse(raw).map_err(|_| "is not a valid URL")?;
    match url.scheme() {
        "http" | "https" => {}
        _ => return Err("must use http or https"),
    }
    if url.host_str().is_none() {
        return Err("has no host");
    }
    Ok(url)
}

// ============================================================================
// Tests
// ============================================================================
