use crate::feed::LinkNormalizer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

const STATE_VERSION: u32 = 1;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum PersistError {
    /// State could not be read; callers degrade to an empty state.
    #[error("Failed to read state file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// State file exists but is not a state document.
    #[error("Corrupt state file '{path}': {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// State could not be written. Continuing would risk duplicate deliveries.
    #[error("Failed to write state file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ============================================================================
// Relay State
// ============================================================================

/// Watermark per account: the canonical identity of the last item relayed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayState {
    watermarks: BTreeMap<String, String>,
}

impl RelayState {
    pub fn watermark(&self, account: &str) -> Option<&str> {
        self.watermarks.get(account).map(String::as_str)
    }

    /// Records `identity` as the last item relayed for `account`.
    pub fn advance(&mut self, account: &str, identity: &str) {
        self.watermarks
            .insert(account.to_string(), identity.to_string());
    }

    pub fn len(&self) -> usize {
        self.watermarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watermarks.is_empty()
    }
}

/// Durable home of the [`RelayState`].
///
/// `save` must not return until the state is durable: the relay persists after
/// every delivered item and treats a returned error as fatal for the cycle.
pub trait StateStore {
    fn load(&self) -> Result<RelayState, PersistError>;
    fn save(&self, state: &RelayState) -> Result<(), PersistError>;
}

/// Loads state, degrading to an empty state when it is unreadable.
///
/// An empty state makes every account take the first-contact path, which
/// relays at most one item per account.
pub fn load_or_empty<S: StateStore + ?Sized>(store: &S) -> RelayState {
    match store.load() {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!(error = %e, "State unreadable, starting from empty state");
            RelayState::default()
        }
    }
}

// ============================================================================
// JSON File Store
// ============================================================================

/// On-disk layout. Unknown top-level keys from older layouts are read and
/// dropped; `last_link` is the single-account layout that preceded versioning.
#[derive(Deserialize)]
struct StateDocumentIn {
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    watermarks: BTreeMap<String, String>,
    #[serde(default)]
    last_link: Option<String>,
    #[serde(flatten)]
    other: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize)]
struct StateDocumentOut<'a> {
    version: u32,
    updated_at: DateTime<Utc>,
    watermarks: &'a BTreeMap<String, String>,
}

/// Stores [`RelayState`] as a JSON file, replaced atomically on every save.
pub struct JsonStateStore {
    path: PathBuf,
    legacy: Option<(String, LinkNormalizer)>,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            legacy: None,
        }
    }

    /// Adopts a legacy `{"last_link": ...}` document as `account`'s watermark,
    /// canonicalized with `normalizer` so it matches current identities.
    pub fn with_legacy_account(mut self, account: &str, normalizer: LinkNormalizer) -> Self {
        self.legacy = Some((account.to_string(), normalizer));
        self
    }

    fn parse(&self, content: &str) -> Result<RelayState, PersistError> {
        let doc: StateDocumentIn =
            serde_json::from_str(content).map_err(|source| PersistError::Corrupt {
                path: self.path.clone(),
                source,
            })?;

        for key in doc.other.keys().filter(|k| k.as_str() != "updated_at") {
            tracing::debug!(key = %key, "Ignoring obsolete key in state file");
        }
        if let Some(version) = doc.version.filter(|v| *v > STATE_VERSION) {
            tracing::warn!(version = version, "State file written by a newer version");
        }

        let mut state = RelayState {
            watermarks: doc.watermarks,
        };

        if let Some(link) = doc.last_link.filter(|l| !l.trim().is_empty()) {
            match &self.legacy {
                Some((account, normalizer)) if state.watermark(account).is_none() => {
                    let identity = Url::parse(link.trim())
                        .map(|url| normalizer.canonicalize(&url))
                        .unwrap_or_else(|_| link.trim().to_string());
                    tracing::info!(
                        account = %account,
                        watermark = %identity,
                        "Migrated legacy last_link watermark"
                    );
                    state.advance(account, &identity);
                }
                _ => tracing::debug!("Ignoring legacy last_link in state file"),
            }
        }

        Ok(state)
    }
}

impl StateStore for JsonStateStore {
    /// A missing file is the normal first-run case and yields an empty state.
    fn load(&self) -> Result<RelayState, PersistError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "No state file found, starting fresh");
                return Ok(RelayState::default());
            }
            Err(source) => {
                return Err(PersistError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if content.trim().is_empty() {
            return Ok(RelayState::default());
        }

        self.parse(&content)
    }

    fn save(&self, state: &RelayState) -> Result<(), PersistError> {
        let doc = StateDocumentOut {
            version: STATE_VERSION,
            updated_at: Utc::now(),
            watermarks: &state.watermarks,
        };
        let json = serde_json::to_vec_pretty(&doc).map_err(|e| PersistError::Write {
            path: self.path.clone(),
            source: std::io::Error::other(e),
        })?;

        atomic_write(&self.path, &json).map_err(|source| PersistError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

/// Writes `content` to `dst` using write-to-temp-then-rename, so a crash
/// leaves either the old or the new state file, never a partial one.
fn atomic_write(dst: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::time::{SystemTime, UNIX_EPOCH};
    let random_suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = dst.with_extension(format!("tmp.{:016x}", random_suffix));

    let result = (|| {
        let mut temp_file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        temp_file.write_all(content)?;
        temp_file.sync_all()?;
        drop(temp_file);

        // On Windows, rename fails if destination exists
        #[cfg(windows)]
        if dst.exists() {
            std::fs::remove_file(dst)?;
        }

        std::fs::rename(&temp_path, dst)?;
        sync_parent_dir(dst)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result
}

/// Flushes the directory entry created by a rename so it survives power loss.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
