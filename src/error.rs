//! Error taxonomy for the monitoring pipeline
//!
//! Plumbing (config, state, CLI) uses `anyhow`. The pipeline itself speaks
//! [`MonitorError`] so the monitor loop can decide between backoff, retry and
//! graceful degradation.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors surfaced by the star fetcher, gateways and the monitor loop
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Missing or rejected GitHub token. Fatal to the cycle, not the process.
    #[error("configuration error: {reason}")]
    Configuration { reason: String, token_rejected: bool },

    /// GitHub quota exhausted; no request may be made before `reset_at`
    #[error("GitHub rate limit exhausted until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    /// Network failure, timeout or 5xx-class response
    #[error("transient failure: {0}")]
    Transient(String),

    /// Delivery to a single destination failed
    #[error("delivery to {destination} failed: {reason}")]
    Delivery { destination: String, reason: String },

    /// Summary or media selection could not be produced
    #[error("enrichment unavailable: {0}")]
    EnrichmentUnavailable(String),

    /// Persisted state could not be read or written
    #[error("state persistence failed: {0}")]
    Persistence(String),
}

impl MonitorError {
    pub fn missing_token() -> Self {
        MonitorError::Configuration {
            reason: "no GitHub token configured, run: starwatch auth set <token>".to_string(),
            token_rejected: false,
        }
    }

    pub fn token_rejected(details: impl Into<String>) -> Self {
        MonitorError::Configuration {
            reason: format!("GitHub rejected the token: {}", details.into()),
            token_rejected: true,
        }
    }

    pub fn persistence(err: &anyhow::Error) -> Self {
        MonitorError::Persistence(format!("{:#}", err))
    }

    /// Short machine-friendly name used in logs and status output
    pub fn kind(&self) -> &'static str {
        match self {
            MonitorError::Configuration { .. } => "configuration",
            MonitorError::RateLimited { .. } => "rate_limited",
            MonitorError::Transient(_) => "transient",
            MonitorError::Delivery { .. } => "delivery",
            MonitorError::EnrichmentUnavailable(_) => "enrichment_unavailable",
            MonitorError::Persistence(_) => "persistence",
        }
    }
}

impl From<reqwest::Error> for MonitorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            MonitorError::Transient(format!("request timed out: {}", err))
        } else {
            MonitorError::Transient(err.to_string())
        }
    }
}

pub type MonitorResult<T> = std::result::Result<T, MonitorError>;
