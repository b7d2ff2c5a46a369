//! Core data types shared across the pipeline

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A repository observed in the owner's starred list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarredRepo {
    /// Stable GitHub repository id (survives renames and transfers)
    pub id: u64,
    /// `owner/name`
    pub full_name: String,
    pub starred_at: DateTime<Utc>,
    pub html_url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub stargazers_count: u64,
    #[serde(default)]
    pub forks_count: u64,
    #[serde(default)]
    pub default_branch: Option<String>,
}

impl StarredRepo {
    pub fn owner(&self) -> &str {
        self.full_name.split('/').next().unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.full_name
            .split_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.full_name)
    }

    pub fn branch(&self) -> &str {
        self.default_branch.as_deref().unwrap_or("main")
    }
}

/// Output of the content enrichment service. Empty fields mean "unavailable".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enrichment {
    pub summary: Option<String>,
    pub media: Vec<String>,
}

impl Enrichment {
    pub fn is_empty(&self) -> bool {
        self.summary.is_none() && self.media.is_empty()
    }
}

/// A newly starred repository together with its enrichment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredRepo {
    pub repo: StarredRepo,
    pub summary: Option<String>,
    /// At most three preview media URLs
    pub media: Vec<String>,
}

impl MonitoredRepo {
    pub const MAX_MEDIA: usize = 3;

    pub fn new(repo: StarredRepo, enrichment: Enrichment) -> Self {
        let mut media = enrichment.media;
        media.truncate(Self::MAX_MEDIA);
        Self {
            repo,
            summary: enrichment.summary.filter(|s| !s.trim().is_empty()),
            media,
        }
    }

    /// Identifier-only notification, used when enrichment is unavailable
    pub fn bare(repo: StarredRepo) -> Self {
        Self::new(repo, Enrichment::default())
    }
}

/// Notification mode of the digest aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestMode {
    Instant,
    Daily,
    Weekly,
}

impl DigestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestMode::Instant => "instant",
            DigestMode::Daily => "daily",
            DigestMode::Weekly => "weekly",
        }
    }

    /// Parse a mode name. `off` is the legacy name for instant delivery.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "instant" | "off" => Some(DigestMode::Instant),
            "daily" => Some(DigestMode::Daily),
            "weekly" => Some(DigestMode::Weekly),
            _ => None,
        }
    }
}

impl fmt::Display for DigestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An opaque delivery target: a chat id, optionally with a forum topic
/// (`-100123/42`), or a public `@channel` name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Destination(String);

const DESTINATION_PATTERN: &str = r"^(-?\d+(/\d+)?|@[A-Za-z][A-Za-z0-9_]{3,})$";

impl Destination {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let valid = Regex::new(DESTINATION_PATTERN)
            .map(|re| re.is_match(trimmed))
            .unwrap_or(false);

        if valid {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(anyhow!(
                "Invalid destination '{}': expected a chat id, chat_id/thread_id or @channel",
                raw
            ))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn chat_id(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    pub fn thread_id(&self) -> Option<i64> {
        self.0
            .split_once('/')
            .and_then(|(_, thread)| thread.parse().ok())
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Destination {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Destination::parse(&value)
    }
}

impl From<Destination> for String {
    fn from(value: Destination) -> Self {
        value.0
    }
}

/// What the messaging gateway is asked to deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// One enriched repository
    Single(MonitoredRepo),
    /// Every repository accumulated since the last flush, oldest first
    Digest {
        mode: DigestMode,
        repos: Vec<MonitoredRepo>,
    },
    /// Plain text service notice (token problems and the like)
    Notice(String),
}

impl Message {
    pub fn repo_count(&self) -> usize {
        match self {
            Message::Single(_) => 1,
            Message::Digest { repos, .. } => repos.len(),
            Message::Notice(_) => 0,
        }
    }
}
