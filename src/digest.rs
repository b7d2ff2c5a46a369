//! Digest Aggregator & Scheduler
//!
//! Holds the notification mode and the pending queue, and decides when the
//! queue is handed to fan-out. In instant mode the queue is drained on every
//! poll. In daily and weekly mode it is drained when the scheduled flush time
//! has passed, which also covers a flush missed while the process was down.
//!
//! Mode changes are deterministic:
//! - into instant: whatever is pending is flushed immediately as one digest
//! - between daily and weekly: the queue is carried forward and the next
//!   flush is recomputed for the new mode

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, TimeZone, Utc, Weekday};
use std::collections::HashSet;

use crate::config::DigestConfig;
use crate::models::{DigestMode, StarredRepo};

/// Fixed local time (and weekday) at which digests fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestSchedule {
    pub time: NaiveTime,
    pub weekday: Weekday,
    pub offset: FixedOffset,
}

impl DigestSchedule {
    pub fn from_config(config: &DigestConfig) -> Result<Self> {
        let time = NaiveTime::parse_from_str(config.daily_time.trim(), "%H:%M")
            .with_context(|| format!("Invalid digest time '{}', expected HH:MM", config.daily_time))?;

        let weekday = config
            .weekly_day
            .trim()
            .parse::<Weekday>()
            .map_err(|_| anyhow!("Invalid weekly digest day '{}'", config.weekly_day))?;

        let offset = parse_utc_offset(&config.utc_offset)?;

        Ok(Self {
            time,
            weekday,
            offset,
        })
    }

    /// First flush instant strictly after `after`, or `None` in instant mode
    pub fn next_after(&self, mode: DigestMode, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.offset);
        let today = local.date_naive();

        let (first, step) = match mode {
            DigestMode::Instant => return None,
            DigestMode::Daily => (today, Duration::days(1)),
            DigestMode::Weekly => {
                let ahead = (7 + self.weekday.num_days_from_monday()
                    - local.weekday().num_days_from_monday())
                    % 7;
                (today + Duration::days(ahead as i64), Duration::days(7))
            }
        };

        let mut candidate = first.and_time(self.time);
        if candidate <= local.naive_local() {
            candidate += step;
        }

        self.offset
            .from_local_datetime(&candidate)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Parse "+03:00", "-0530", "+3" or "UTC"
pub fn parse_utc_offset(raw: &str) -> Result<FixedOffset> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("utc") || trimmed.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0).ok_or_else(|| anyhow!("Invalid UTC offset"));
    }

    let (sign, rest) = match trimmed.chars().next() {
        Some('+') => (1, &trimmed[1..]),
        Some('-') => (-1, &trimmed[1..]),
        _ => return Err(anyhow!("Invalid UTC offset '{}', expected e.g. +03:00", raw)),
    };

    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    let (hours, minutes) = match digits.len() {
        1 | 2 => (digits.as_str(), "0"),
        4 => digits.split_at(2),
        _ => return Err(anyhow!("Invalid UTC offset '{}', expected e.g. +03:00", raw)),
    };

    let hours: i32 = hours
        .parse()
        .with_context(|| format!("Invalid UTC offset hours in '{}'", raw))?;
    let minutes: i32 = minutes
        .parse()
        .with_context(|| format!("Invalid UTC offset minutes in '{}'", raw))?;

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| anyhow!("UTC offset out of range: '{}'", raw))
}

/// A batch released by the aggregator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flush {
    /// Oldest first
    pub repos: Vec<StarredRepo>,
    /// `None` for instant notifications, otherwise the digest kind to render
    pub digest: Option<DigestMode>,
}

impl Flush {
    pub fn ids(&self) -> Vec<u64> {
        self.repos.iter().map(|repo| repo.id).collect()
    }
}

#[derive(Debug, Clone)]
pub struct DigestState {
    mode: DigestMode,
    pending: Vec<StarredRepo>,
    next_flush_at: Option<DateTime<Utc>>,
    schedule: DigestSchedule,
}

impl DigestState {
    pub fn new(mode: DigestMode, schedule: DigestSchedule, now: DateTime<Utc>) -> Self {
        Self {
            mode,
            pending: Vec::new(),
            next_flush_at: schedule.next_after(mode, now),
            schedule,
        }
    }

    /// Rebuild from persisted state. A `next_flush_at` in the past is kept so
    /// the next [`poll_flush`](Self::poll_flush) recovers the missed flush.
    pub fn restore(
        mode: DigestMode,
        pending: Vec<StarredRepo>,
        next_flush_at: Option<DateTime<Utc>>,
        schedule: DigestSchedule,
        now: DateTime<Utc>,
    ) -> Self {
        let mut state = Self {
            mode,
            pending: Vec::new(),
            next_flush_at: match mode {
                DigestMode::Instant => None,
                _ => next_flush_at.or_else(|| schedule.next_after(mode, now)),
            },
            schedule,
        };
        state.enqueue(pending);
        state
    }

    pub fn mode(&self) -> DigestMode {
        self.mode
    }

    pub fn next_flush_at(&self) -> Option<DateTime<Utc>> {
        self.next_flush_at
    }

    pub fn pending(&self) -> &[StarredRepo] {
        &self.pending
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Append new stars, keeping the earliest occurrence of each id.
    /// Returns how many were added.
    pub fn enqueue(&mut self, repos: impl IntoIterator<Item = StarredRepo>) -> usize {
        let mut present: HashSet<u64> = self.pending.iter().map(|repo| repo.id).collect();
        let before = self.pending.len();

        for repo in repos {
            if present.insert(repo.id) {
                self.pending.push(repo);
            }
        }

        // Stable: equal timestamps keep arrival order
        self.pending.sort_by_key(|repo| repo.starred_at);
        self.pending.len() - before
    }

    /// Release whatever is due at `now`
    pub fn poll_flush(&mut self, now: DateTime<Utc>) -> Option<Flush> {
        match self.mode {
            DigestMode::Instant => self.take(None),
            mode => {
                let due = match self.next_flush_at {
                    Some(at) => at <= now,
                    None => {
                        self.next_flush_at = self.schedule.next_after(mode, now);
                        false
                    }
                };
                if !due {
                    return None;
                }

                self.next_flush_at = self.schedule.next_after(mode, now);
                self.take(Some(mode))
            }
        }
    }

    /// Switch mode. Entering instant mode releases the queue as one digest.
    pub fn set_mode(&mut self, mode: DigestMode, now: DateTime<Utc>) -> Option<Flush> {
        let previous = self.mode;
        self.mode = mode;

        if mode == previous {
            if self.next_flush_at.is_none() {
                self.next_flush_at = self.schedule.next_after(mode, now);
            }
            return None;
        }

        self.next_flush_at = self.schedule.next_after(mode, now);

        match mode {
            DigestMode::Instant => self.take(Some(previous)),
            _ => None,
        }
    }

    fn take(&mut self, digest: Option<DigestMode>) -> Option<Flush> {
        if self.pending.is_empty() {
            return None;
        }
        Some(Flush {
            repos: std::mem::take(&mut self.pending),
            digest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn star(id: u64, starred_at: &str) -> StarredRepo {
        StarredRepo {
            id,
            full_name: format!("owner/repo-{}", id),
            starred_at: at(starred_at),
            html_url: format!("https://github.com/owner/repo-{}", id),
            description: None,
            language: None,
            stargazers_count: 0,
            forks_count: 0,
            default_branch: None,
        }
    }

    fn schedule() -> DigestSchedule {
        DigestSchedule::from_config(&DigestConfig::default()).unwrap()
    }

    #[test]
    fn test_parse_utc_offset() {
        assert_eq!(parse_utc_offset("+03:00").unwrap().local_minus_utc(), 3 * 3600);
        assert_eq!(parse_utc_offset("-0530").unwrap().local_minus_utc(), -(5 * 3600 + 1800));
        assert_eq!(parse_utc_offset("+3").unwrap().local_minus_utc(), 3 * 3600);
        assert_eq!(parse_utc_offset("UTC").unwrap().local_minus_utc(), 0);
        assert!(parse_utc_offset("03:00").is_err());
        assert!(parse_utc_offset("+99:00").is_err());
    }

    #[test]
    fn test_schedule_from_config() {
        let s = schedule();
        assert_eq!(s.time, NaiveTime::from_hms_opt(21, 0, 0).unwrap());
        assert_eq!(s.weekday, Weekday::Sun);
        assert_eq!(s.offset.local_minus_utc(), 3 * 3600);

        let bad = DigestConfig {
            daily_time: "25:99".to_string(),
            ..DigestConfig::default()
        };
        assert!(DigestSchedule::from_config(&bad).is_err());
    }

    #[test]
    fn test_next_daily_flush() {
        let s = schedule();
        // 21:00 at +03:00 is 18:00 UTC
        assert_eq!(
            s.next_after(DigestMode::Daily, at("2024-06-10T17:00:00Z")),
            Some(at("2024-06-10T18:00:00Z"))
        );
        assert_eq!(
            s.next_after(DigestMode::Daily, at("2024-06-10T18:00:00Z")),
            Some(at("2024-06-11T18:00:00Z"))
        );
        // Local date already rolled over
        assert_eq!(
            s.next_after(DigestMode::Daily, at("2024-06-10T22:30:00Z")),
            Some(at("2024-06-11T18:00:00Z"))
        );
        assert_eq!(s.next_after(DigestMode::Instant, at("2024-06-10T17:00:00Z")), None);
    }

    #[test]
    fn test_next_weekly_flush() {
        let s = schedule();
        // 2024-06-10 is a Monday
        assert_eq!(
            s.next_after(DigestMode::Weekly, at("2024-06-10T12:00:00Z")),
            Some(at("2024-06-16T18:00:00Z"))
        );
        // Sunday before the flush time
        assert_eq!(
            s.next_after(DigestMode::Weekly, at("2024-06-16T17:59:00Z")),
            Some(at("2024-06-16T18:00:00Z"))
        );
        // Sunday after the flush time
        assert_eq!(
            s.next_after(DigestMode::Weekly, at("2024-06-16T18:00:01Z")),
            Some(at("2024-06-23T18:00:00Z"))
        );
    }

    #[test]
    fn test_instant_mode_drains_every_poll() {
        let now = at("2024-06-10T12:00:00Z");
        let mut state = DigestState::new(DigestMode::Instant, schedule(), now);
        assert_eq!(state.next_flush_at(), None);
        assert!(state.poll_flush(now).is_none());

        state.enqueue(vec![star(1, "2024-06-10T11:00:00Z")]);
        let flush = state.poll_flush(now).unwrap();
        assert_eq!(flush.ids(), vec![1]);
        assert_eq!(flush.digest, None);
        assert_eq!(state.pending_len(), 0);
    }

    #[test]
    fn test_daily_flush_fires_once_at_schedule() {
        let now = at("2024-06-10T12:00:00Z");
        let mut state = DigestState::new(DigestMode::Daily, schedule(), now);
        state.enqueue(vec![
            star(2, "2024-06-10T11:30:00Z"),
            star(1, "2024-06-10T11:00:00Z"),
        ]);

        assert!(state.poll_flush(at("2024-06-10T17:59:59Z")).is_none());

        let flush = state.poll_flush(at("2024-06-10T18:00:00Z")).unwrap();
        assert_eq!(flush.ids(), vec![1, 2]);
        assert_eq!(flush.digest, Some(DigestMode::Daily));
        assert_eq!(state.next_flush_at(), Some(at("2024-06-11T18:00:00Z")));

        assert!(state.poll_flush(at("2024-06-10T18:00:15Z")).is_none());
    }

    #[test]
    fn test_empty_queue_never_produces_digest() {
        let now = at("2024-06-10T12:00:00Z");
        let mut state = DigestState::new(DigestMode::Daily, schedule(), now);
        assert!(state.poll_flush(at("2024-06-10T18:00:00Z")).is_none());
        // Still rescheduled
        assert_eq!(state.next_flush_at(), Some(at("2024-06-11T18:00:00Z")));
    }

    #[test]
    fn test_enqueue_keeps_earliest_occurrence() {
        let now = at("2024-06-10T12:00:00Z");
        let mut state = DigestState::new(DigestMode::Daily, schedule(), now);
        assert_eq!(state.enqueue(vec![star(1, "2024-06-10T11:00:00Z")]), 1);

        let mut renamed = star(1, "2024-06-10T11:45:00Z");
        renamed.full_name = "owner/renamed".to_string();
        assert_eq!(state.enqueue(vec![renamed]), 0);

        assert_eq!(state.pending_len(), 1);
        assert_eq!(state.pending()[0].full_name, "owner/repo-1");
    }

    #[test]
    fn test_switch_to_instant_flushes_once() {
        let now = at("2024-06-10T12:00:00Z");
        let mut state = DigestState::new(DigestMode::Daily, schedule(), now);
        state.enqueue(vec![
            star(1, "2024-06-10T09:00:00Z"),
            star(2, "2024-06-10T10:00:00Z"),
        ]);

        let flush = state.set_mode(DigestMode::Instant, now).unwrap();
        assert_eq!(flush.ids(), vec![1, 2]);
        assert_eq!(flush.digest, Some(DigestMode::Daily));
        assert_eq!(state.next_flush_at(), None);

        // Nothing left for the next instant poll
        assert!(state.poll_flush(now).is_none());
    }

    #[test]
    fn test_switch_between_digests_carries_queue() {
        let now = at("2024-06-10T12:00:00Z");
        let mut state = DigestState::new(DigestMode::Daily, schedule(), now);
        state.enqueue(vec![star(1, "2024-06-10T09:00:00Z")]);

        assert!(state.set_mode(DigestMode::Weekly, now).is_none());
        assert_eq!(state.pending_len(), 1);
        assert_eq!(state.next_flush_at(), Some(at("2024-06-16T18:00:00Z")));

        // Daily time passes without a flush under weekly mode
        assert!(state.poll_flush(at("2024-06-10T18:00:00Z")).is_none());
        let flush = state.poll_flush(at("2024-06-16T18:00:00Z")).unwrap();
        assert_eq!(flush.digest, Some(DigestMode::Weekly));
    }

    #[test]
    fn test_restore_recovers_missed_flush() {
        let missed = at("2024-06-10T18:00:00Z");
        let restart = at("2024-06-11T07:00:00Z");
        let pending = vec![
            star(3, "2024-06-10T15:00:00Z"),
            star(1, "2024-06-10T09:00:00Z"),
            star(2, "2024-06-10T12:00:00Z"),
        ];

        let mut state =
            DigestState::restore(DigestMode::Daily, pending, Some(missed), schedule(), restart);

        let flush = state.poll_flush(restart).unwrap();
        assert_eq!(flush.ids(), vec![1, 2, 3]);
        assert_eq!(state.next_flush_at(), Some(at("2024-06-11T18:00:00Z")));
        assert!(state.poll_flush(restart).is_none());
    }
}
