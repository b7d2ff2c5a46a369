//! Content enrichment: AI summary and preview media for a starred repository
//!
//! Enrichment never fails the pipeline. Every error is logged and turned into
//! an empty [`Enrichment`], and the notification goes out with bare content.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::ACCEPT;
use reqwest::{Client as HttpClient, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{Config, EnrichmentConfig};
use crate::credentials::CredentialStore;
use crate::error::{MonitorError, MonitorResult};
use crate::models::{Enrichment, StarredRepo};

/// READMEs shorter than this are not worth summarizing
const MIN_README_CHARS: usize = 50;
/// Upper bound on README text sent to the model
const MAX_README_CHARS: usize = 15_000;

const MEDIA_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".webp", ".mp4", ".mov", ".webm",
];
const BADGE_MARKERS: &[&str] = &["shields.io", "badgen.net", "/badge", "badge.fury.io"];
const MEDIA_PATTERN: &str = r#"!\[[^\]]*\]\(\s*<?([^)\s>]+)>?[^)]*\)|<img[^>]*?\ssrc\s*=\s*["']([^"']+)["']"#;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Enricher: Send + Sync {
    /// Summary and media for `repo`; empty fields when unavailable
    async fn enrich(&self, repo: &StarredRepo) -> Enrichment;
}

/// Used when enrichment is disabled
pub struct NoopEnricher;

#[async_trait]
impl Enricher for NoopEnricher {
    async fn enrich(&self, _repo: &StarredRepo) -> Enrichment {
        Enrichment::default()
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

/// README-driven enrichment backed by the Gemini API
pub struct GeminiEnricher {
    http: HttpClient,
    github_api: String,
    gemini_api: String,
    model: String,
    api_key: Option<String>,
    credentials: Arc<dyn CredentialStore>,
    summaries: bool,
    media: bool,
    max_media: usize,
}

impl GeminiEnricher {
    pub fn new(config: &Config, credentials: Arc<dyn CredentialStore>) -> Result<Self> {
        let enrichment: &EnrichmentConfig = &config.enrichment;
        let http = HttpClient::builder()
            .user_agent(config.github.user_agent.clone())
            .timeout(Duration::from_secs(enrichment.timeout))
            .build()
            .context("Failed to create enrichment HTTP client")?;

        let api_key = config.gemini_api_key();
        if api_key.is_none() && enrichment.enabled {
            warn!("GEMINI_API_KEY not configured, AI summaries disabled");
        }

        Ok(Self {
            http,
            github_api: config.github.api_base.trim_end_matches('/').to_string(),
            gemini_api: enrichment.api_base.trim_end_matches('/').to_string(),
            model: enrichment.model.clone(),
            api_key,
            credentials,
            summaries: enrichment.enabled,
            media: enrichment.media_selection,
            max_media: enrichment.max_media.min(3),
        })
    }

    async fn fetch_readme(&self, repo: &StarredRepo) -> MonitorResult<Option<String>> {
        let mut request = self
            .http
            .get(format!("{}/repos/{}/readme", self.github_api, repo.full_name))
            .header(ACCEPT, "application/vnd.github.raw+json");

        if let Ok(Some(token)) = self.credentials.get_token() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(response.text().await?)),
            other => Err(MonitorError::EnrichmentUnavailable(format!(
                "README request for {} returned {}",
                repo.full_name, other
            ))),
        }
    }

    async fn summarize(&self, api_key: &str, repo: &StarredRepo, readme: &str) -> MonitorResult<Option<String>> {
        let excerpt: String = readme.chars().take(MAX_README_CHARS).collect();
        let prompt = format!(
            "You are a senior software developer. Read the README of the GitHub repository {} below \
             and explain in two or three plain English sentences what the project does and what \
             its main features are. Skip installation, usage examples, licensing and contribution \
             guidelines.\n\n---\n{}\n---",
            repo.full_name, excerpt
        );

        let response = self
            .http
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.gemini_api, self.model
            ))
            .header("x-goog-api-key", api_key)
            .json(&json!({ "contents": [{ "parts": [{ "text": prompt }] }] }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MonitorError::EnrichmentUnavailable(format!(
                "Gemini returned {}",
                status
            )));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| MonitorError::EnrichmentUnavailable(format!("malformed Gemini response: {}", e)))?;

        let text = body
            .candidates
            .into_iter()
            .filter_map(|candidate| candidate.content)
            .flat_map(|content| content.parts)
            .filter_map(|part| part.text)
            .collect::<Vec<_>>()
            .join("")
            .trim()
            .to_string();

        Ok(Some(text).filter(|t| !t.is_empty()))
    }

    async fn try_enrich(&self, repo: &StarredRepo) -> MonitorResult<Enrichment> {
        let readme = match self.fetch_readme(repo).await? {
            Some(readme) => readme,
            None => {
                debug!("{} has no README", repo.full_name);
                return Ok(Enrichment::default());
            }
        };

        let media = if self.media {
            extract_media(&readme, repo.owner(), repo.name(), repo.branch())
                .into_iter()
                .take(self.max_media)
                .collect()
        } else {
            Vec::new()
        };

        let summary = match (&self.api_key, self.summaries) {
            (Some(key), true) if readme.chars().count() >= MIN_README_CHARS => {
                match self.summarize(key, repo, &readme).await {
                    Ok(summary) => summary,
                    Err(e) => {
                        // Media is still worth sending
                        warn!("Summary for {} unavailable: {}", repo.full_name, e);
                        None
                    }
                }
            }
            _ => None,
        };

        Ok(Enrichment { summary, media })
    }
}

#[async_trait]
impl Enricher for GeminiEnricher {
    async fn enrich(&self, repo: &StarredRepo) -> Enrichment {
        match self.try_enrich(repo).await {
            Ok(enrichment) => {
                info!(
                    "Enriched {} (summary: {}, media: {})",
                    repo.full_name,
                    enrichment.summary.is_some(),
                    enrichment.media.len()
                );
                enrichment
            }
            Err(e) => {
                warn!("Enrichment for {} unavailable: {}", repo.full_name, e);
                Enrichment::default()
            }
        }
    }
}

/// Image and video URLs referenced by a README, absolute, badge-free and de-duplicated
pub fn extract_media(markdown: &str, owner: &str, repo: &str, branch: &str) -> Vec<String> {
    let pattern = match Regex::new(MEDIA_PATTERN) {
        Ok(pattern) => pattern,
        Err(_) => return Vec::new(),
    };

    let mut seen = HashSet::new();
    pattern
        .captures_iter(markdown)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| resolve_media_url(m.as_str().trim(), owner, repo, branch))
        .filter(|url| is_media_url(url) && !is_badge(url))
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

fn resolve_media_url(url: &str, owner: &str, repo: &str, branch: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else if let Some(rest) = url.strip_prefix("//") {
        format!("https://{}", rest)
    } else {
        let path = url.trim_start_matches(|c| c == '.' || c == '/');
        format!(
            "https://raw.githubusercontent.com/{}/{}/{}/{}",
            owner, repo, branch, path
        )
    }
}

fn is_media_url(url: &str) -> bool {
    let path = url
        .split(|c| c == '?' || c == '#')
        .next()
        .unwrap_or(url)
        .to_lowercase();
    MEDIA_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

fn is_badge(url: &str) -> bool {
    let lower = url.to_lowercase();
    BADGE_MARKERS.iter().any(|marker| lower.contains(marker))
}
