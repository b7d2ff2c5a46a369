//! Monitor Loop - schedules polls and owns every piece of mutable state
//!
//! A ticker task feeds a single consumer. The consumer runs at most one poll
//! cycle at a time; ticks that arrive while a cycle is in flight are dropped,
//! and owner commands wait in their queue until the cycle has finished.
//!
//! A cycle is Fetch -> Diff -> commit (KnownStarSet, queue, ETags in one
//! transaction) -> Aggregator -> Fan-out -> acknowledge.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::control::ControlState;
use crate::credentials::CredentialStore;
use crate::diff::{diff, KnownStarSet};
use crate::digest::{DigestSchedule, DigestState, Flush};
use crate::error::{MonitorError, MonitorResult};
use crate::fanout::FanOut;
use crate::github::{RateLimitInfo, StarSource};
use crate::models::{Destination, DigestMode};
use crate::state::{PersistedState, PollCommit, StateDb};

/// Attempts for a state write before the cycle gives up
const PERSIST_ATTEMPTS: u32 = 3;

/// Where the loop is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Polling,
    Backoff { until: DateTime<Utc> },
}

/// Owner commands, applied between cycles
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Pause,
    Resume,
    SetInterval(u64),
    SetDigestMode(DigestMode),
    /// `None` adds the owner's private chat
    AddDestination(Option<Destination>),
    RemoveDestination(Destination),
    ListDestinations,
    Status,
    SetToken(String),
    RemoveToken,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    Done(String),
    Rejected(String),
    Destinations(Vec<Destination>),
    Status(Box<MonitorStatus>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorStatus {
    pub paused: bool,
    pub interval_secs: u64,
    pub mode: DigestMode,
    pub destination_count: usize,
    pub destinations: Vec<String>,
    pub rate_limit: Option<RateLimitInfo>,
    pub state: LoopState,
    pub backoff_multiplier: u32,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub next_flush_at: Option<DateTime<Utc>>,
    pub pending: usize,
    pub known_stars: usize,
    pub baseline_established: bool,
    pub last_error: Option<String>,
}

/// What a tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub polled: bool,
    /// Repositories handed to fan-out
    pub delivered: usize,
}

/// Collaborators of the loop
pub struct MonitorDeps {
    pub db: Arc<StateDb>,
    pub source: Arc<dyn StarSource>,
    pub fanout: FanOut,
    pub credentials: Arc<dyn CredentialStore>,
}

/// Values used until persisted state says otherwise
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub owner: Destination,
    pub interval_secs: u64,
    pub min_interval_secs: u64,
    pub max_backoff_multiplier: u32,
    pub default_mode: DigestMode,
    pub schedule: DigestSchedule,
    pub tick: Duration,
}

type Envelope = (Command, oneshot::Sender<CommandReply>);

/// Sends commands to a running loop
#[derive(Clone)]
pub struct MonitorHandle {
    tx: mpsc::Sender<Envelope>,
}

impl MonitorHandle {
    pub async fn send(&self, command: Command) -> Result<CommandReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((command, reply_tx))
            .await
            .map_err(|_| anyhow!("Monitor loop is not running"))?;
        reply_rx
            .await
            .map_err(|_| anyhow!("Monitor loop stopped before replying"))
    }
}

pub struct CommandQueue {
    rx: mpsc::Receiver<Envelope>,
}

/// Queue for owner commands; the receiving half goes to [`Monitor::run`]
pub fn command_channel(capacity: usize) -> (MonitorHandle, CommandQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (MonitorHandle { tx }, CommandQueue { rx })
}

pub struct Monitor {
    db: Arc<StateDb>,
    source: Arc<dyn StarSource>,
    fanout: FanOut,
    credentials: Arc<dyn CredentialStore>,
    known: KnownStarSet,
    digest: DigestState,
    control: ControlState,
    state: LoopState,
    next_poll_at: DateTime<Utc>,
    baseline_established: bool,
    last_error: Option<String>,
    rate_limit: Option<RateLimitInfo>,
    tick: Duration,
}

impl Monitor {
    /// Rebuild the loop from persisted state, seeding defaults on first start
    pub fn restore(
        deps: MonitorDeps,
        settings: MonitorSettings,
        persisted: PersistedState,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let PersistedState {
            known_ids,
            pending,
            digest_mode,
            next_flush_at,
            control,
            baseline_established,
            last_error,
            ..
        } = persisted;

        let seed_control = control.is_none();
        let control = match control {
            Some(snapshot) => ControlState::restore(
                snapshot,
                settings.owner.clone(),
                settings.min_interval_secs,
                settings.max_backoff_multiplier,
            ),
            None => ControlState::new(
                settings.owner.clone(),
                settings.interval_secs,
                settings.min_interval_secs,
                settings.max_backoff_multiplier,
            ),
        };

        let seed_digest = digest_mode.is_none();
        let digest = DigestState::restore(
            digest_mode.unwrap_or(settings.default_mode),
            pending,
            next_flush_at,
            settings.schedule,
            now,
        );

        let (state, next_poll_at) = match control.backoff_until() {
            Some(until) if until > now => (LoopState::Backoff { until }, until),
            _ => (LoopState::Idle, now),
        };

        let monitor = Self {
            db: deps.db,
            source: deps.source,
            fanout: deps.fanout,
            credentials: deps.credentials,
            known: known_ids.into_iter().collect(),
            digest,
            control,
            state,
            next_poll_at,
            baseline_established,
            last_error,
            rate_limit: None,
            tick: settings.tick,
        };

        if seed_control {
            monitor.db.save_control(&monitor.control.snapshot())?;
        }
        if seed_digest {
            monitor
                .db
                .save_digest(monitor.digest.mode(), monitor.digest.next_flush_at())?;
        }

        info!(
            "Monitor restored: {} known stars, {} pending, mode {}, {} destinations{}",
            monitor.known.len(),
            monitor.digest.pending_len(),
            monitor.digest.mode(),
            monitor.control.destinations().len(),
            if monitor.control.is_paused() { ", paused" } else { "" }
        );
        Ok(monitor)
    }

    /// Convenience for callers that have not loaded the snapshot themselves
    pub fn open(deps: MonitorDeps, settings: MonitorSettings, now: DateTime<Utc>) -> Result<Self> {
        let persisted = deps.db.load_snapshot()?;
        Self::restore(deps, settings, persisted, now)
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn next_poll_at(&self) -> DateTime<Utc> {
        self.next_poll_at
    }

    /// Deliver whatever survived the previous run: leftover instant entries
    /// and digests whose flush time passed while the process was down
    pub async fn startup(&mut self, now: DateTime<Utc>) -> usize {
        let delivered = self.flush_due(now).await;
        if delivered > 0 {
            info!("Recovered {} undelivered stars at startup", delivered);
        }
        delivered
    }

    /// One scheduler step: leave an expired backoff, flush due digests, poll if due
    pub async fn on_tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        if let LoopState::Backoff { until } = self.state {
            if now >= until {
                info!("Rate limit reset reached, resuming polls");
                self.state = LoopState::Idle;
                self.control.set_backoff_until(None);
                self.persist_control();
            }
        }

        // Digests keep their schedule while polling is paused
        report.delivered += self.flush_due(now).await;

        if self.poll_due(now) {
            report.polled = true;
            report.delivered += self.run_cycle(now).await;
        }

        report
    }

    /// Poll now unless paused or backing off
    pub async fn check_now(&mut self, now: DateTime<Utc>) -> TickReport {
        if self.state == LoopState::Idle {
            self.next_poll_at = self.next_poll_at.min(now);
        }
        self.on_tick(now).await
    }

    fn poll_due(&self, now: DateTime<Utc>) -> bool {
        !self.control.is_paused() && self.state == LoopState::Idle && now >= self.next_poll_at
    }

    async fn run_cycle(&mut self, now: DateTime<Utc>) -> usize {
        self.state = LoopState::Polling;
        let result = self.poll(now).await;
        self.state = LoopState::Idle;

        match result {
            Ok(()) => self.flush_due(now).await,
            Err(e) => {
                self.handle_error(e, now).await;
                0
            }
        }
    }

    async fn poll(&mut self, now: DateTime<Utc>) -> MonitorResult<()> {
        let outcome = self.source.fetch_stars().await?;
        if outcome.rate_limit.is_some() {
            self.rate_limit = outcome.rate_limit;
        }

        let baseline = !self.baseline_established;
        let nothing_known = KnownStarSet::new();
        let known = if baseline { &nothing_known } else { &self.known };

        // Listing order is newest first; everything downstream is oldest first
        let mut new_stars = diff(&outcome.stars, known);
        new_stars.reverse();

        let commit = PollCommit {
            new_stars,
            enqueue: !baseline,
            changed: outcome.changed,
            revalidated: outcome.revalidated,
            checked_at: now,
            establish_baseline: baseline,
        };
        let db = self.db.clone();
        persist_with_retry("commit poll results", || db.commit_poll(&commit)).await?;

        self.known.insert_all(&commit.new_stars);
        if baseline {
            self.baseline_established = true;
            info!(
                "Baseline established with {} existing stars, no notifications sent",
                commit.new_stars.len()
            );
        } else {
            self.digest.enqueue(commit.new_stars.iter().cloned());
        }

        self.last_error = None;
        self.control.reset_backoff();
        self.next_poll_at = now + to_chrono(self.control.effective_interval());
        self.persist_control();

        info!(
            "Poll complete: {} new stars, {} pages ({} from cache), rate limit remaining {}",
            if baseline { 0 } else { commit.new_stars.len() },
            outcome.pages,
            outcome.cached_pages,
            self.rate_limit
                .map(|r| r.remaining.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        );
        Ok(())
    }

    async fn handle_error(&mut self, err: MonitorError, now: DateTime<Utc>) {
        match &err {
            MonitorError::RateLimited { reset_at } => {
                let until = (*reset_at).max(now);
                warn!("GitHub rate limit exhausted, backing off until {}", until);
                self.rate_limit = Some(RateLimitInfo {
                    limit: self.rate_limit.and_then(|r| r.limit),
                    remaining: 0,
                    reset_at: Some(until),
                });
                self.state = LoopState::Backoff { until };
                self.next_poll_at = until;
                self.control.set_backoff_until(Some(until));
            }
            MonitorError::Configuration { token_rejected, .. } => {
                error!("Poll failed: {}", err);
                self.next_poll_at = now + to_chrono(self.control.effective_interval());
                if *token_rejected && self.control.pause() {
                    warn!("GitHub token rejected, monitoring paused");
                    let owner = self.control.owner().clone();
                    let notice = "Your GitHub token was rejected and monitoring has been paused. \
                                  Set a new token, then resume monitoring.";
                    if let Err(e) = self.fanout.notify(&owner, notice).await {
                        error!("Failed to notify owner about the rejected token: {}", e);
                    }
                }
            }
            _ => {
                let multiplier = self.control.record_transient_failure();
                self.next_poll_at = now + to_chrono(self.control.effective_interval());
                warn!(
                    "Poll failed: {} (backoff x{}, next attempt at {})",
                    err, multiplier, self.next_poll_at
                );
            }
        }

        let message = err.to_string();
        if let Err(e) = self.db.set_last_error(Some(&message)) {
            error!("Failed to record last error: {:#}", e);
        }
        self.last_error = Some(message);
        self.persist_control();
    }

    /// Hand whatever the aggregator releases to fan-out, then acknowledge it
    async fn flush_due(&mut self, now: DateTime<Utc>) -> usize {
        let scheduled = self.digest.next_flush_at();
        let flush = self.digest.poll_flush(now);
        if self.digest.next_flush_at() != scheduled {
            self.persist_digest();
        }

        match flush {
            Some(flush) => self.deliver(flush).await,
            None => 0,
        }
    }

    async fn deliver(&mut self, flush: Flush) -> usize {
        let destinations = self.control.destinations().to_vec();
        let report = self.fanout.deliver(&flush, &destinations).await;

        if !report.failures.is_empty() {
            warn!(
                "Delivery failed for {} of {} destinations: {}",
                report.failed_destinations().len(),
                destinations.len(),
                report.failed_destinations().join(", ")
            );
        }

        // Nobody got it: keep the entries queued (and unacknowledged) for the next attempt
        if report.delivered == 0 && !report.failures.is_empty() {
            warn!(
                "No destination accepted {} stars, keeping them queued for retry",
                flush.repos.len()
            );
            self.digest.enqueue(flush.repos);
            return 0;
        }

        let ids = flush.ids();
        let db = self.db.clone();
        if let Err(e) = persist_with_retry("acknowledge delivery", || db.acknowledge(&ids)).await {
            error!("{}", e);
            self.last_error = Some(e.to_string());
        }

        flush.repos.len()
    }

    fn persist_control(&self) {
        if let Err(e) = self.db.save_control(&self.control.snapshot()) {
            error!("Failed to persist control state: {:#}", e);
        }
    }

    fn persist_digest(&self) {
        if let Err(e) = self
            .db
            .save_digest(self.digest.mode(), self.digest.next_flush_at())
        {
            error!("Failed to persist digest state: {:#}", e);
        }
    }

    fn saved(&self, result: Result<()>, done: String) -> CommandReply {
        match result {
            Ok(()) => CommandReply::Done(done),
            Err(e) => {
                error!("Failed to persist command result: {:#}", e);
                CommandReply::Rejected(format!("Change applied but not saved: {:#}", e))
            }
        }
    }

    /// Apply one owner command atomically with respect to the loop
    pub async fn apply_command(&mut self, command: Command, now: DateTime<Utc>) -> CommandReply {
        debug!("Applying command {:?}", command);

        match command {
            Command::Pause => {
                if !self.control.pause() {
                    return CommandReply::Done("Monitoring is already paused".to_string());
                }
                let result = self.db.save_control(&self.control.snapshot());
                self.saved(result, "Monitoring paused".to_string())
            }
            Command::Resume => {
                if !self.control.resume() {
                    return CommandReply::Done("Monitoring is already running".to_string());
                }
                if self.state == LoopState::Idle {
                    self.next_poll_at = self.next_poll_at.min(now);
                }
                let result = self.db.save_control(&self.control.snapshot());
                self.saved(result, "Monitoring resumed".to_string())
            }
            Command::SetInterval(secs) => {
                if let Err(e) = self.control.set_interval(secs) {
                    return CommandReply::Rejected(e.to_string());
                }
                if self.state == LoopState::Idle {
                    self.next_poll_at = self
                        .next_poll_at
                        .min(now + to_chrono(self.control.effective_interval()));
                }
                let result = self.db.save_control(&self.control.snapshot());
                self.saved(result, format!("Poll interval set to {} seconds", secs))
            }
            Command::SetDigestMode(mode) => {
                let flush = self.digest.set_mode(mode, now);
                let result = self
                    .db
                    .save_digest(self.digest.mode(), self.digest.next_flush_at());

                let mut message = format!("Digest mode set to {}", mode);
                if let Some(flush) = flush {
                    let count = self.deliver(flush).await;
                    message.push_str(&format!(", flushed {} pending stars", count));
                }
                self.saved(result, message)
            }
            Command::AddDestination(destination) => {
                if !self.control.add_destination(destination) {
                    return CommandReply::Done("Destination is already configured".to_string());
                }
                let result = self.db.save_control(&self.control.snapshot());
                self.saved(result, "Destination added".to_string())
            }
            Command::RemoveDestination(destination) => {
                if let Err(e) = self.control.remove_destination(&destination) {
                    return CommandReply::Rejected(e.to_string());
                }
                let result = self.db.save_control(&self.control.snapshot());
                self.saved(result, format!("Destination {} removed", destination))
            }
            Command::ListDestinations => {
                CommandReply::Destinations(self.control.destinations().to_vec())
            }
            Command::Status => CommandReply::Status(Box::new(self.status())),
            Command::SetToken(token) => {
                if let Err(e) = self.credentials.set_token(&token) {
                    return CommandReply::Rejected(format!("{:#}", e));
                }
                self.last_error = None;
                let result = self.db.set_last_error(None);
                self.saved(result, "GitHub token updated".to_string())
            }
            Command::RemoveToken => match self.credentials.remove_token() {
                Ok(true) => CommandReply::Done("GitHub token removed".to_string()),
                Ok(false) => CommandReply::Done("No GitHub token was stored".to_string()),
                Err(e) => CommandReply::Rejected(format!("{:#}", e)),
            },
        }
    }

    pub fn status(&self) -> MonitorStatus {
        let destinations = self.control.destinations();
        MonitorStatus {
            paused: self.control.is_paused(),
            interval_secs: self.control.interval_secs(),
            mode: self.digest.mode(),
            destination_count: destinations.len(),
            destinations: destinations.iter().map(|d| d.to_string()).collect(),
            rate_limit: self.rate_limit,
            state: self.state,
            backoff_multiplier: self.control.backoff_multiplier(),
            next_poll_at: (!self.control.is_paused()).then_some(self.next_poll_at),
            next_flush_at: self.digest.next_flush_at(),
            pending: self.digest.pending_len(),
            known_stars: self.known.len(),
            baseline_established: self.baseline_established,
            last_error: self.last_error.clone(),
        }
    }

    /// Drive the loop until shutdown
    pub async fn run(
        mut self,
        mut commands: CommandQueue,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let (tick_tx, mut tick_rx) = mpsc::channel::<()>(1);
        let in_flight = Arc::new(AtomicBool::new(false));
        let ticker = tokio::spawn(run_ticker(self.tick, tick_tx, in_flight.clone()));

        self.startup(Utc::now()).await;
        info!("Monitor loop started (tick every {}s)", self.tick.as_secs());

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Monitor loop received shutdown signal");
                    break;
                }
                Some(()) = tick_rx.recv() => {
                    in_flight.store(true, Ordering::Release);
                    self.on_tick(Utc::now()).await;
                    in_flight.store(false, Ordering::Release);
                }
                Some((command, reply)) = commands.rx.recv() => {
                    let answer = self.apply_command(command, Utc::now()).await;
                    if reply.send(answer).is_err() {
                        debug!("Command sender went away before the reply");
                    }
                }
            }
        }

        ticker.abort();
        info!("Monitor loop stopped");
        Ok(())
    }
}

/// Emit ticks, skipping (never queueing) those that land during a cycle
async fn run_ticker(every: Duration, tx: mpsc::Sender<()>, in_flight: Arc<AtomicBool>) {
    let mut ticks = interval(every);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticks.tick().await;
        if in_flight.load(Ordering::Acquire) {
            debug!("Cycle still in flight, skipping tick");
            continue;
        }
        match tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Closed(())) => break,
        }
    }
}

async fn persist_with_retry<T>(
    what: &str,
    mut op: impl FnMut() -> Result<T>,
) -> MonitorResult<T> {
    let mut last_error = None;

    for attempt in 1..=PERSIST_ATTEMPTS {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(
                    "Failed to {} (attempt {}/{}): {:#}",
                    what, attempt, PERSIST_ATTEMPTS, e
                );
                last_error = Some(e);
                if attempt < PERSIST_ATTEMPTS {
                    sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
            }
        }
    }

    Err(match last_error {
        Some(e) => MonitorError::persistence(&e.context(format!("failed to {}", what))),
        None => MonitorError::Persistence(format!("failed to {}", what)),
    })
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ticks_during_a_cycle_are_dropped_not_queued() {
        let (tx, mut rx) = mpsc::channel(1);
        let in_flight = Arc::new(AtomicBool::new(true));
        let ticker = tokio::spawn(run_ticker(
            Duration::from_millis(10),
            tx,
            in_flight.clone(),
        ));

        sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err(), "tick delivered while a cycle was running");

        in_flight.store(false, Ordering::Release);
        sleep(Duration::from_millis(100)).await;

        // Many ticks elapsed, but only one is ever waiting for the consumer
        let mut waiting = 0;
        while rx.try_recv().is_ok() {
            waiting += 1;
        }
        assert_eq!(waiting, 1);

        ticker.abort();
    }

    #[test]
    fn test_to_chrono_saturates() {
        assert_eq!(to_chrono(Duration::from_secs(90)), ChronoDuration::seconds(90));
        assert_eq!(to_chrono(Duration::MAX), ChronoDuration::days(365));
    }
}
