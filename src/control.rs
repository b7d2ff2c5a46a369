//! Monitor control state: pause flag, poll interval, destinations and backoff
//!
//! One explicit value owned by the monitor loop. Every owner command goes
//! through it.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::models::Destination;
use crate::state::ControlSnapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlState {
    paused: bool,
    interval_secs: u64,
    min_interval_secs: u64,
    destinations: Vec<Destination>,
    owner: Destination,
    backoff_multiplier: u32,
    max_backoff_multiplier: u32,
    backoff_until: Option<DateTime<Utc>>,
}

impl ControlState {
    /// Fresh state: not paused, only the owner's private chat as destination
    pub fn new(
        owner: Destination,
        interval_secs: u64,
        min_interval_secs: u64,
        max_backoff_multiplier: u32,
    ) -> Self {
        Self {
            paused: false,
            interval_secs: interval_secs.max(min_interval_secs),
            min_interval_secs,
            destinations: vec![owner.clone()],
            owner,
            backoff_multiplier: 1,
            max_backoff_multiplier: max_backoff_multiplier.max(1),
            backoff_until: None,
        }
    }

    pub fn restore(
        snapshot: ControlSnapshot,
        owner: Destination,
        min_interval_secs: u64,
        max_backoff_multiplier: u32,
    ) -> Self {
        let mut state = Self::new(
            owner,
            snapshot.interval_secs,
            min_interval_secs,
            max_backoff_multiplier,
        );
        state.paused = snapshot.paused;
        if !snapshot.destinations.is_empty() {
            state.destinations = Vec::new();
            for destination in snapshot.destinations {
                if !state.destinations.contains(&destination) {
                    state.destinations.push(destination);
                }
            }
        }
        state.backoff_multiplier = snapshot
            .backoff_multiplier
            .clamp(1, state.max_backoff_multiplier);
        state.backoff_until = snapshot.backoff_until;
        state
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        ControlSnapshot {
            paused: self.paused,
            interval_secs: self.interval_secs,
            destinations: self.destinations.clone(),
            backoff_multiplier: self.backoff_multiplier,
            backoff_until: self.backoff_until,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Returns false if already paused
    pub fn pause(&mut self) -> bool {
        !std::mem::replace(&mut self.paused, true)
    }

    /// Returns false if not paused
    pub fn resume(&mut self) -> bool {
        std::mem::replace(&mut self.paused, false)
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    pub fn min_interval_secs(&self) -> u64 {
        self.min_interval_secs
    }

    pub fn set_interval(&mut self, secs: u64) -> Result<()> {
        if secs < self.min_interval_secs {
            return Err(anyhow!(
                "Interval must be at least {} seconds",
                self.min_interval_secs
            ));
        }
        self.interval_secs = secs;
        Ok(())
    }

    pub fn owner(&self) -> &Destination {
        &self.owner
    }

    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    /// Add a destination, the owner's private chat when none is given.
    /// Returns false if it was already listed.
    pub fn add_destination(&mut self, destination: Option<Destination>) -> bool {
        let destination = destination.unwrap_or_else(|| self.owner.clone());
        if self.destinations.contains(&destination) {
            return false;
        }
        self.destinations.push(destination);
        true
    }

    pub fn remove_destination(&mut self, destination: &Destination) -> Result<()> {
        let position = self
            .destinations
            .iter()
            .position(|d| d == destination)
            .ok_or_else(|| anyhow!("Destination {} is not configured", destination))?;

        if self.destinations.len() == 1 {
            return Err(anyhow!(
                "Cannot remove {}: at least one destination is required",
                destination
            ));
        }

        self.destinations.remove(position);
        Ok(())
    }

    pub fn backoff_multiplier(&self) -> u32 {
        self.backoff_multiplier
    }

    pub fn backoff_until(&self) -> Option<DateTime<Utc>> {
        self.backoff_until
    }

    pub fn set_backoff_until(&mut self, until: Option<DateTime<Utc>>) {
        self.backoff_until = until;
    }

    /// Double the multiplier up to its cap and return the new value
    pub fn record_transient_failure(&mut self) -> u32 {
        self.backoff_multiplier = self
            .backoff_multiplier
            .saturating_mul(2)
            .min(self.max_backoff_multiplier);
        self.backoff_multiplier
    }

    pub fn reset_backoff(&mut self) {
        self.backoff_multiplier = 1;
        self.backoff_until = None;
    }

    /// Delay until the next scheduled poll
    pub fn effective_interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.saturating_mul(self.backoff_multiplier as u64))
    }
}
