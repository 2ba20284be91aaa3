//! Integration tests for whole relay cycles.
//!
//! Feeds are served from canned payloads and deliveries are recorded in memory;
//! state goes through the real JSON file store in a per-test temp directory, so
//! these tests exercise watermark durability across cycles.

use feedrelay::config::{Config, DestinationConfig};
use feedrelay::feed::{CandidateFailure, FetchError, FetchSource};
use feedrelay::relay::{
    run_cycle, AccountOutcome, CycleError, CycleOptions, DeliveryError, Destination, Detection,
};
use feedrelay::storage::{JsonStateStore, StateStore};
use pretty_assertions::assert_eq;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

// ============================================================================
// Fixtures
// ============================================================================

const CONFIG: &str = r#"
canonical_domain = "x.com"
mirror_domains = ["nitter.net", "xcancel.com"]

[[accounts]]
name = "alpha"
sources = ["https://nitter.net/alpha/rss", "https://xcancel.com/alpha/rss"]

[accounts.destination]
webhook_url = "https://discord.example/api/webhooks/1/alpha"

[[accounts]]
name = "beta"
sources = ["https://nitter.net/beta/rss"]
message_template = "{account}: {canonical}"

[accounts.destination]
webhook_url = "https://discord.example/api/webhooks/2/beta"
thread_id = "99"
"#;

fn config() -> Config {
    Config::from_toml_str(CONFIG, |_| None).unwrap()
}

fn rss(host: &str, account: &str, ids: &[u32]) -> String {
    let items: String = ids
        .iter()
        .map(|id| {
            format!(
                "<item><title>{id}</title><link>https://{host}/{account}/status/{id}#m</link></item>"
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0"?><rss version="2.0"><channel><title>{account}</title><link>https://{host}/{account}</link>{items}</channel></rss>"#
    )
}

fn id(account: &str, n: u32) -> String {
    format!("https://x.com/{}/status/{}", account, n)
}

/// Serves canned payloads; unknown URLs answer 503.
#[derive(Default)]
struct CannedFeeds {
    payloads: Mutex<HashMap<String, String>>,
}

impl CannedFeeds {
    fn serve(&self, url: &str, body: String) {
        self.payloads.lock().unwrap().insert(url.to_string(), body);
    }

    fn remove(&self, url: &str) {
        self.payloads.lock().unwrap().remove(url);
    }
}

impl FetchSource for CannedFeeds {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.payloads
            .lock()
            .unwrap()
            .get(url)
            .map(|body| body.clone().into_bytes())
            .ok_or(FetchError::HttpStatus(503))
    }
}

/// Records delivered messages per thread; messages containing a blocked
/// marker are rejected.
#[derive(Default)]
struct RecordingDestination {
    sent: Mutex<Vec<(Option<String>, String)>>,
    blocked: Mutex<HashSet<String>>,
}

impl RecordingDestination {
    fn block(&self, marker: &str) {
        self.blocked.lock().unwrap().insert(marker.to_string());
    }

    fn unblock_all(&self) {
        self.blocked.lock().unwrap().clear();
    }

    fn messages(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, m)| m.clone())
            .collect()
    }

    fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl Destination for RecordingDestination {
    async fn deliver(
        &self,
        destination: &DestinationConfig,
        content: &str,
    ) -> Result<(), DeliveryError> {
        let blocked = self
            .blocked
            .lock()
            .unwrap()
            .iter()
            .any(|marker| content.contains(marker.as_str()));
        if blocked {
            return Err(DeliveryError::HttpStatus(500));
        }
        self.sent
            .lock()
            .unwrap()
            .push((destination.thread_id.clone(), content.to_string()));
        Ok(())
    }
}

struct TempState {
    dir: PathBuf,
}

impl TempState {
    fn new(name: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("feedrelay_cycle_test_{}", name));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        Self { dir }
    }

    fn store(&self) -> JsonStateStore {
        JsonStateStore::new(self.dir.join("state.json"))
    }
}

impl Drop for TempState {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn outcome<'a>(report: &'a feedrelay::relay::CycleReport, account: &str) -> &'a AccountOutcome {
    &report
        .accounts
        .iter()
        .find(|r| r.account == account)
        .unwrap_or_else(|| panic!("no report for {}", account))
        .outcome
}

// ============================================================================
// Detection Scenarios Through a Full Cycle
// ============================================================================

#[tokio::test]
async fn test_first_contact_relays_newest_only() {
    let tmp = TempState::new("first_contact");
    let config = config();
    let feeds = CannedFeeds::default();
    feeds.serve("https://nitter.net/alpha/rss", rss("nitter.net", "alpha", &[5, 4, 3]));
    let dest = RecordingDestination::default();
    let store = tmp.store();

    let options = CycleOptions {
        only_accounts: vec!["alpha".to_string()],
        ..Default::default()
    };
    let report = run_cycle(&config, &feeds, &dest, &store, &options)
        .await
        .unwrap();

    match outcome(&report, "alpha") {
        AccountOutcome::Relayed {
            detection,
            delivered,
            ..
        } => {
            assert_eq!(*detection, Detection::NoWatermark);
            assert_eq!(delivered, &vec![id("alpha", 5)]);
        }
        other => panic!("Expected Relayed, got {:?}", other),
    }
    assert_eq!(dest.messages(), vec!["https://nitter.net/alpha/status/5#m"]);
    assert_eq!(
        store.load().unwrap().watermark("alpha"),
        Some(id("alpha", 5).as_str())
    );
}

#[tokio::test]
async fn test_resumed_cycle_delivers_oldest_first() {
    let tmp = TempState::new("resumed");
    let config = config();
    let feeds = CannedFeeds::default();
    let dest = RecordingDestination::default();
    let store = tmp.store();
    let options = CycleOptions {
        only_accounts: vec!["alpha".to_string()],
        ..Default::default()
    };

    feeds.serve("https://nitter.net/alpha/rss", rss("nitter.net", "alpha", &[3, 2, 1]));
    run_cycle(&config, &feeds, &dest, &store, &options).await.unwrap();
    dest.clear();

    feeds.serve(
        "https://nitter.net/alpha/rss",
        rss("nitter.net", "alpha", &[5, 4, 3, 2, 1]),
    );
    let report = run_cycle(&config, &feeds, &dest, &store, &options).await.unwrap();

    match outcome(&report, "alpha") {
        AccountOutcome::Relayed { detection, .. } => {
            assert_eq!(*detection, Detection::Resumed { position: 2 })
        }
        other => panic!("Expected Relayed, got {:?}", other),
    }
    assert_eq!(
        dest.messages(),
        vec![
            "https://nitter.net/alpha/status/4#m",
            "https://nitter.net/alpha/status/5#m"
        ]
    );
    assert_eq!(
        store.load().unwrap().watermark("alpha"),
        Some(id("alpha", 5).as_str())
    );

    // Nothing new: third cycle is a no-op
    dest.clear();
    let report = run_cycle(&config, &feeds, &dest, &store, &options).await.unwrap();
    assert!(matches!(outcome(&report, "alpha"), AccountOutcome::UpToDate { .. }));
    assert!(dest.messages().is_empty());
}

#[tokio::test]
async fn test_watermark_outside_window_resets_to_newest() {
    let tmp = TempState::new("reset");
    let config = config();
    let store = tmp.store();
    let mut state = feedrelay::storage::RelayState::default();
    state.advance("alpha", &id("alpha", 9));
    store.save(&state).unwrap();

    let feeds = CannedFeeds::default();
    feeds.serve(
        "https://nitter.net/alpha/rss",
        rss("nitter.net", "alpha", &[5, 4, 3, 2, 1]),
    );
    let dest = RecordingDestination::default();
    let options = CycleOptions {
        only_accounts: vec!["alpha".to_string()],
        ..Default::default()
    };

    let report = run_cycle(&config, &feeds, &dest, &store, &options).await.unwrap();

    match outcome(&report, "alpha") {
        AccountOutcome::Relayed {
            detection,
            delivered,
            ..
        } => {
            assert_eq!(*detection, Detection::Reset);
            assert_eq!(delivered, &vec![id("alpha", 5)]);
        }
        other => panic!("Expected Relayed, got {:?}", other),
    }
}

// ============================================================================
// Crash Safety and Isolation
// ============================================================================

#[tokio::test]
async fn test_failed_delivery_resumes_from_last_success() {
    let tmp = TempState::new("partial");
    let config = config();
    let feeds = CannedFeeds::default();
    let dest = RecordingDestination::default();
    let store = tmp.store();
    let options = CycleOptions {
        only_accounts: vec!["alpha".to_string()],
        ..Default::default()
    };

    feeds.serve("https://nitter.net/alpha/rss", rss("nitter.net", "alpha", &[3, 2, 1]));
    run_cycle(&config, &feeds, &dest, &store, &options).await.unwrap();
    dest.clear();

    // S4 goes through, S5 is rejected
    feeds.serve(
        "https://nitter.net/alpha/rss",
        rss("nitter.net", "alpha", &[5, 4, 3, 2, 1]),
    );
    dest.block("/status/5");
    let report = run_cycle(&config, &feeds, &dest, &store, &options).await.unwrap();

    match outcome(&report, "alpha") {
        AccountOutcome::DeliveryFailed {
            delivered, failed, ..
        } => {
            assert_eq!(delivered, &vec![id("alpha", 4)]);
            assert_eq!(failed, &id("alpha", 5));
        }
        other => panic!("Expected DeliveryFailed, got {:?}", other),
    }
    assert_eq!(report.failed_accounts(), vec!["alpha"]);
    assert_eq!(
        store.load().unwrap().watermark("alpha"),
        Some(id("alpha", 4).as_str())
    );

    // Next cycle with the same window retries only S5
    dest.clear();
    dest.unblock_all();
    run_cycle(&config, &feeds, &dest, &store, &options).await.unwrap();
    assert_eq!(dest.messages(), vec!["https://nitter.net/alpha/status/5#m"]);
}

#[tokio::test]
async fn test_mirror_switch_does_not_redeliver() {
    let tmp = TempState::new("mirror_switch");
    let config = config();
    let feeds = CannedFeeds::default();
    let dest = RecordingDestination::default();
    let store = tmp.store();
    let options = CycleOptions {
        only_accounts: vec!["alpha".to_string()],
        ..Default::default()
    };

    feeds.serve("https://nitter.net/alpha/rss", rss("nitter.net", "alpha", &[2, 1]));
    run_cycle(&config, &feeds, &dest, &store, &options).await.unwrap();
    dest.clear();

    // Primary mirror goes down; the fallback serves the same items plus one
    feeds.remove("https://nitter.net/alpha/rss");
    feeds.serve(
        "https://xcancel.com/alpha/rss",
        rss("xcancel.com", "alpha", &[3, 2, 1]),
    );
    let report = run_cycle(&config, &feeds, &dest, &store, &options).await.unwrap();

    match outcome(&report, "alpha") {
        AccountOutcome::Relayed { source, .. } => {
            assert_eq!(source, "https://xcancel.com/alpha/rss")
        }
        other => panic!("Expected Relayed, got {:?}", other),
    }
    assert_eq!(dest.messages(), vec!["https://xcancel.com/alpha/status/3#m"]);

    // The dead primary is still reported alongside the successful relay
    let failed = &report.accounts[0].failed_sources;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].source, "https://nitter.net/alpha/rss");
    assert!(matches!(
        failed[0].failure,
        CandidateFailure::Fetch(FetchError::HttpStatus(503))
    ));
}

#[tokio::test]
async fn test_unavailable_account_does_not_block_others() {
    let tmp = TempState::new("isolation");
    let config = config();
    let feeds = CannedFeeds::default();
    // alpha: every mirror down. beta: healthy.
    feeds.serve("https://nitter.net/beta/rss", rss("nitter.net", "beta", &[7, 6]));
    let dest = RecordingDestination::default();
    let store = tmp.store();

    let report = run_cycle(&config, &feeds, &dest, &store, &CycleOptions::default())
        .await
        .unwrap();

    match outcome(&report, "alpha") {
        AccountOutcome::SourceUnavailable(unavailable) => {
            assert_eq!(unavailable.attempts.len(), 2)
        }
        other => panic!("Expected SourceUnavailable, got {:?}", other),
    }
    assert!(matches!(outcome(&report, "beta"), AccountOutcome::Relayed { .. }));

    let sent = dest.sent.lock().unwrap().clone();
    assert_eq!(
        sent,
        vec![(Some("99".to_string()), format!("beta: {}", id("beta", 7)))]
    );

    let state = store.load().unwrap();
    assert_eq!(state.watermark("alpha"), None);
    assert_eq!(state.watermark("beta"), Some(id("beta", 7).as_str()));
}

#[tokio::test]
async fn test_state_write_failure_aborts_cycle() {
    let config = config();
    let feeds = CannedFeeds::default();
    feeds.serve("https://nitter.net/alpha/rss", rss("nitter.net", "alpha", &[1]));
    feeds.serve("https://nitter.net/beta/rss", rss("nitter.net", "beta", &[1]));
    let dest = RecordingDestination::default();
    let store = JsonStateStore::new("/nonexistent/feedrelay/state.json");

    let result = run_cycle(&config, &feeds, &dest, &store, &CycleOptions::default()).await;

    match result {
        Err(CycleError::Persistence { account, .. }) => assert_eq!(account, "alpha"),
        other => panic!("Expected Persistence error, got {:?}", other),
    }
    // beta is never attempted once alpha's watermark could not be recorded
    assert_eq!(dest.messages().len(), 1);
}

#[tokio::test]
async fn test_corrupt_state_degrades_to_first_contact() {
    let tmp = TempState::new("corrupt");
    std::fs::write(tmp.dir.join("state.json"), "{{{ definitely not json").unwrap();
    let config = config();
    let feeds = CannedFeeds::default();
    feeds.serve("https://nitter.net/alpha/rss", rss("nitter.net", "alpha", &[5, 4, 3]));
    let dest = RecordingDestination::default();
    let store = tmp.store();
    let options = CycleOptions {
        only_accounts: vec!["alpha".to_string()],
        ..Default::default()
    };

    let report = run_cycle(&config, &feeds, &dest, &store, &options).await.unwrap();

    assert_eq!(report.delivered(), 1);
    assert_eq!(
        store.load().unwrap().watermark("alpha"),
        Some(id("alpha", 5).as_str())
    );
}

#[tokio::test]
async fn test_dry_run_neither_delivers_nor_persists() {
    let tmp = TempState::new("dry_run");
    let config = config();
    let feeds = CannedFeeds::default();
    feeds.serve("https://nitter.net/alpha/rss", rss("nitter.net", "alpha", &[5, 4]));
    let dest = RecordingDestination::default();
    let store = tmp.store();
    let options = CycleOptions {
        dry_run: true,
        only_accounts: vec!["alpha".to_string()],
    };

    let report = run_cycle(&config, &feeds, &dest, &store, &options).await.unwrap();

    match outcome(&report, "alpha") {
        AccountOutcome::Pending { pending, .. } => assert_eq!(pending, &vec![id("alpha", 5)]),
        other => panic!("Expected Pending, got {:?}", other),
    }
    assert!(dest.messages().is_empty());
    assert!(!tmp.dir.join("state.json").exists());
}
