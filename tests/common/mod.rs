//! Common test utilities and fakes for starwatch tests
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use starwatch::config::DigestConfig;
use starwatch::credentials::CredentialStore;
use starwatch::digest::DigestSchedule;
use starwatch::enrich::Enricher;
use starwatch::fanout::FanOut;
use starwatch::github::{FetchOutcome, RateLimitInfo, StarSource};
use starwatch::models::Enrichment;
use starwatch::monitor::{MonitorDeps, MonitorSettings};
use starwatch::telegram::MessagingGateway;
use starwatch::{
    Destination, DigestMode, Message, Monitor, MonitorError, MonitorResult, StarredRepo, StateDb,
};

pub const OWNER: &str = "424242";
pub const INTERVAL_SECS: u64 = 300;

/// Temporary home for config, state and PID files
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub config_dir: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_dir = temp_dir.path().join("starwatch");
        std::fs::create_dir_all(&config_dir).expect("Failed to create config dir");

        Self {
            temp_dir,
            config_dir,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.temp_dir.path().join("state.db")
    }

    pub fn create_test_config(&self, content: &str) -> PathBuf {
        let config_path = self.config_dir.join("config.yml");
        std::fs::write(&config_path, content).expect("Failed to write test config");
        config_path
    }

    /// Config pointing every path into the temp dir
    pub fn create_minimal_config(&self) -> PathBuf {
        let root = self.temp_dir.path().display();
        let content = format!(
            r#"
monitor:
  interval: "5m"
telegram:
  owner_chat_id: "{owner}"
state:
  db_path: "{root}/state.db"
daemon:
  pid_file: "{root}/starwatch.pid"
  log_file: "{root}/starwatch.log"
"#,
            owner = OWNER,
            root = root,
        );
        self.create_test_config(&content)
    }
}

/// Monday 2024-06-10 12:00 UTC, before the 18:00 UTC daily flush
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap()
}

/// A starred repository; higher ids were starred later
pub fn star(id: u64) -> StarredRepo {
    StarredRepo {
        id,
        full_name: format!("octo/repo-{}", id),
        starred_at: base_time() - ChronoDuration::days(30) + ChronoDuration::minutes(id as i64),
        html_url: format!("https://github.com/octo/repo-{}", id),
        description: Some(format!("Repository number {}", id)),
        language: Some("Rust".to_string()),
        stargazers_count: 100 * id,
        forks_count: id,
        default_branch: Some("main".to_string()),
    }
}

/// Listing as GitHub returns it: most recently starred first
pub fn listing(ids: &[u64]) -> Vec<StarredRepo> {
    let mut stars: Vec<_> = ids.iter().copied().map(star).collect();
    stars.sort_by(|a, b| b.starred_at.cmp(&a.starred_at));
    stars
}

pub fn destination(id: &str) -> Destination {
    Destination::parse(id).expect("valid destination")
}

/// Star source that replays scripted results, then keeps returning the
/// current listing
pub struct ScriptedSource {
    script: Mutex<VecDeque<MonitorResult<FetchOutcome>>>,
    listing: Mutex<Vec<StarredRepo>>,
    calls: AtomicUsize,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(ids: &[u64]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            listing: Mutex::new(listing(ids)),
            calls: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        })
    }

    /// Make every fetch take this long
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Most fetches ever running at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn set_listing(&self, ids: &[u64]) {
        *self.listing.lock().unwrap() = listing(ids);
    }

    pub fn push_error(&self, error: MonitorError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StarSource for ScriptedSource {
    async fn fetch_stars(&self) -> MonitorResult<FetchOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(result) = self.script.lock().unwrap().pop_front() {
            return result;
        }

        Ok(FetchOutcome {
            stars: self.listing.lock().unwrap().clone(),
            pages: 1,
            rate_limit: Some(RateLimitInfo {
                limit: Some(5000),
                remaining: 4999,
                reset_at: None,
            }),
            ..Default::default()
        })
    }
}

/// Gateway that records every message and fails for chosen destinations
#[derive(Default)]
pub struct RecordingGateway {
    deliveries: Mutex<Vec<(Destination, Message)>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_for(&self, destination: &str) {
        self.failing.lock().unwrap().insert(destination.to_string());
    }

    pub fn recover(&self, destination: &str) {
        self.failing.lock().unwrap().remove(destination);
    }

    pub fn messages_for(&self, destination: &str) -> Vec<Message> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, _)| d.as_str() == destination)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn total(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }

    /// Repository ids delivered to a destination, in delivery order
    pub fn repo_ids_for(&self, destination: &str) -> Vec<u64> {
        self.messages_for(destination)
            .iter()
            .flat_map(|message| match message {
                Message::Single(repo) => vec![repo.repo.id],
                Message::Digest { repos, .. } => repos.iter().map(|r| r.repo.id).collect(),
                Message::Notice(_) => vec![],
            })
            .collect()
    }
}

#[async_trait]
impl MessagingGateway for RecordingGateway {
    async fn deliver(&self, destination: &Destination, message: &Message) -> MonitorResult<()> {
        if self.failing.lock().unwrap().contains(destination.as_str()) {
            return Err(MonitorError::Delivery {
                destination: destination.to_string(),
                reason: "Forbidden: bot was kicked from the group chat".to_string(),
            });
        }

        self.deliveries
            .lock()
            .unwrap()
            .push((destination.clone(), message.clone()));
        Ok(())
    }
}

/// Enricher that summarizes every repository and counts its calls
#[derive(Default)]
pub struct CountingEnricher {
    calls: AtomicUsize,
}

impl CountingEnricher {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Enricher for CountingEnricher {
    async fn enrich(&self, repo: &StarredRepo) -> Enrichment {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Enrichment {
            summary: Some(format!("Summary of {}", repo.full_name)),
            media: vec![],
        }
    }
}

#[derive(Default)]
pub struct MemoryCredentials {
    token: Mutex<Option<String>>,
}

impl CredentialStore for MemoryCredentials {
    fn get_token(&self) -> Result<Option<String>> {
        Ok(self.token.lock().unwrap().clone())
    }

    fn set_token(&self, token: &str) -> Result<()> {
        *self.token.lock().unwrap() = Some(token.to_string());
        Ok(())
    }

    fn remove_token(&self) -> Result<bool> {
        Ok(self.token.lock().unwrap().take().is_some())
    }
}

/// Everything a pipeline test needs to build (and rebuild) a monitor
pub struct Harness {
    pub db: Arc<StateDb>,
    pub source: Arc<ScriptedSource>,
    pub gateway: Arc<RecordingGateway>,
    pub enricher: Arc<CountingEnricher>,
    pub credentials: Arc<MemoryCredentials>,
    pub default_mode: DigestMode,
}

impl Harness {
    pub fn new(db: StateDb, ids: &[u64]) -> Self {
        Self {
            db: Arc::new(db),
            source: ScriptedSource::new(ids),
            gateway: RecordingGateway::new(),
            enricher: Arc::new(CountingEnricher::default()),
            credentials: Arc::new(MemoryCredentials::default()),
            default_mode: DigestMode::Instant,
        }
    }

    pub fn in_memory(ids: &[u64]) -> Self {
        Self::new(StateDb::open_in_memory().unwrap(), ids)
    }

    pub fn with_mode(mut self, mode: DigestMode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn settings(&self) -> MonitorSettings {
        MonitorSettings {
            owner: destination(OWNER),
            interval_secs: INTERVAL_SECS,
            min_interval_secs: 60,
            max_backoff_multiplier: 8,
            default_mode: self.default_mode,
            schedule: DigestSchedule::from_config(&DigestConfig::default()).unwrap(),
            tick: Duration::from_secs(1),
        }
    }

    /// A monitor restored from whatever the database holds
    pub fn monitor(&self, now: DateTime<Utc>) -> Monitor {
        let deps = MonitorDeps {
            db: self.db.clone(),
            source: self.source.clone(),
            fanout: FanOut::new(
                self.enricher.clone(),
                self.gateway.clone(),
                3,
                Duration::from_secs(5),
            ),
            credentials: self.credentials.clone(),
        };
        Monitor::open(deps, self.settings(), now).unwrap()
    }

    /// A monitor whose first poll has already recorded the baseline
    pub async fn baselined_monitor(&self, now: DateTime<Utc>) -> Monitor {
        let mut monitor = self.monitor(now);
        let report = monitor.on_tick(now).await;
        assert!(report.polled);
        assert_eq!(self.gateway.total(), 0);
        monitor
    }
}
