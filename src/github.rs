//! Star Fetcher - conditional, paginated retrieval of the owner's starred list
//!
//! Every page is requested with the validator cached for its key. A 304 reuses
//! the cached payload (and the already parsed page when the validator has not
//! moved), a 200 stages a new cache entry. Staged entries are applied to the
//! cache only when the whole listing was fetched, so a rate limit or transport
//! failure halfway through never leaves a truncated view behind.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use octocrab::Octocrab;
use reqwest::header::{HeaderMap, ACCEPT, ETAG, IF_NONE_MATCH, RETRY_AFTER};
use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{page_key, CacheEntry, EtagCache};
use crate::config::GitHubConfig;
use crate::credentials::CredentialStore;
use crate::error::{MonitorError, MonitorResult};
use crate::models::StarredRepo;

/// Media type that adds `starred_at` to each listing entry
const STAR_MEDIA_TYPE: &str = "application/vnd.github.star+json";

/// Hard stop for runaway pagination
const MAX_PAGES: u32 = 400;

/// GitHub quota as reported by the last response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub limit: Option<u32>,
    pub remaining: u32,
    pub reset_at: Option<DateTime<Utc>>,
}

/// Result of one complete fetch of the starred listing
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    /// Every starred repository, most recently starred first
    pub stars: Vec<StarredRepo>,
    /// Cache entries written by this fetch (to be persisted)
    pub changed: Vec<CacheEntry>,
    /// Keys confirmed unchanged by a 304
    pub revalidated: Vec<String>,
    pub pages: u32,
    pub cached_pages: u32,
    pub rate_limit: Option<RateLimitInfo>,
}

/// Anything that can produce the owner's current starred set
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StarSource: Send + Sync {
    async fn fetch_stars(&self) -> MonitorResult<FetchOutcome>;
}

#[derive(Debug, Deserialize)]
struct StarredItem {
    starred_at: DateTime<Utc>,
    repo: RepoPayload,
}

#[derive(Debug, Deserialize)]
struct RepoPayload {
    id: u64,
    full_name: String,
    html_url: String,
    description: Option<String>,
    language: Option<String>,
    #[serde(default)]
    stargazers_count: u64,
    #[serde(default)]
    forks_count: u64,
    default_branch: Option<String>,
}

impl From<StarredItem> for StarredRepo {
    fn from(item: StarredItem) -> Self {
        StarredRepo {
            id: item.repo.id,
            full_name: item.repo.full_name,
            starred_at: item.starred_at,
            html_url: item.repo.html_url,
            description: item.repo.description,
            language: item.repo.language,
            stargazers_count: item.repo.stargazers_count,
            forks_count: item.repo.forks_count,
            default_branch: item.repo.default_branch,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GitHubErrorBody {
    message: String,
}

/// A page parsed from a given validator, reused while the validator holds
struct ParsedPage {
    etag: String,
    stars: Vec<StarredRepo>,
}

/// Conditional-request fetcher for `GET /user/starred`
pub struct StarFetcher {
    http: HttpClient,
    api_base: String,
    per_page: u32,
    cache: Arc<EtagCache>,
    credentials: Arc<dyn CredentialStore>,
    parsed: Mutex<HashMap<String, ParsedPage>>,
}

impl StarFetcher {
    pub fn new(
        config: &GitHubConfig,
        cache: Arc<EtagCache>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self> {
        let http = HttpClient::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.request_timeout))
            .build()
            .context("Failed to create GitHub HTTP client")?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            per_page: config.per_page.clamp(1, 100),
            cache,
            credentials,
            parsed: Mutex::new(HashMap::new()),
        })
    }

    fn token(&self) -> MonitorResult<String> {
        self.credentials
            .get_token()
            .map_err(|e| MonitorError::persistence(&e))?
            .ok_or_else(MonitorError::missing_token)
    }

    /// Parse a page payload, reusing the previous parse if the validator is unchanged
    fn parse_page(&self, key: &str, etag: &str, payload: &str) -> MonitorResult<Vec<StarredRepo>> {
        let mut parsed = self
            .parsed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(page) = parsed.get(key) {
            if !etag.is_empty() && page.etag == etag {
                debug!("Reusing parsed page {}", key);
                return Ok(page.stars.clone());
            }
        }

        let items: Vec<StarredItem> = serde_json::from_str(payload).map_err(|e| {
            MonitorError::Transient(format!("malformed starred listing for {}: {}", key, e))
        })?;
        let stars: Vec<StarredRepo> = items.into_iter().map(StarredRepo::from).collect();

        parsed.insert(
            key.to_string(),
            ParsedPage {
                etag: etag.to_string(),
                stars: stars.clone(),
            },
        );
        Ok(stars)
    }

    async fn fetch_page(
        &self,
        token: &str,
        page: u32,
        outcome: &mut FetchOutcome,
    ) -> MonitorResult<Vec<StarredRepo>> {
        let key = page_key(page);
        let cached = self.cache.get(&key);

        let mut request = self
            .http
            .get(format!("{}/user/starred", self.api_base))
            .query(&[("per_page", self.per_page), ("page", page)])
            .bearer_auth(token)
            .header(ACCEPT, STAR_MEDIA_TYPE)
            .header("X-GitHub-Api-Version", "2022-11-28");

        if let Some((etag, _)) = &cached {
            request = request.header(IF_NONE_MATCH, etag.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();

        if let Some(rate_limit) = parse_rate_limit(&headers) {
            outcome.rate_limit = Some(rate_limit);
        }

        match status {
            StatusCode::NOT_MODIFIED => {
                let (etag, payload) = cached.ok_or_else(|| {
                    MonitorError::Transient(format!("304 for uncached page {}", key))
                })?;
                outcome.cached_pages += 1;
                outcome.revalidated.push(key.clone());
                self.parse_page(&key, &etag, &payload)
            }
            s if s.is_success() => {
                let etag = headers
                    .get(ETAG)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let body = response.text().await?;
                let stars = self.parse_page(&key, &etag, &body)?;

                if !etag.is_empty() {
                    outcome.changed.push(CacheEntry::new(key, etag, body));
                }
                Ok(stars)
            }
            StatusCode::UNAUTHORIZED => {
                let message = response
                    .json::<GitHubErrorBody>()
                    .await
                    .map(|body| body.message)
                    .unwrap_or_else(|_| "401 Unauthorized".to_string());
                Err(MonitorError::token_rejected(message))
            }
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS
                if is_rate_limited(status, &headers) =>
            {
                Err(MonitorError::RateLimited {
                    reset_at: rate_limit_reset(&headers, Utc::now()),
                })
            }
            other => Err(MonitorError::Transient(format!(
                "GitHub returned {} for {}",
                other, key
            ))),
        }
    }
}

#[async_trait]
impl StarSource for StarFetcher {
    async fn fetch_stars(&self) -> MonitorResult<FetchOutcome> {
        let token = self.token()?;
        let mut outcome = FetchOutcome::default();
        let mut page = 1u32;

        loop {
            let stars = self.fetch_page(&token, page, &mut outcome).await?;
            let count = stars.len();
            outcome.stars.extend(stars);
            outcome.pages += 1;

            if count < self.per_page as usize {
                break;
            }
            if page >= MAX_PAGES {
                warn!("Reached maximum pagination limit ({} pages)", MAX_PAGES);
                break;
            }
            page += 1;
        }

        // Only a complete listing may touch the cache
        let now = Utc::now();
        for key in &outcome.revalidated {
            self.cache.touch(key, now);
        }
        for entry in &outcome.changed {
            self.cache.insert(entry.clone());
        }

        debug!(
            "Fetched {} stars over {} pages ({} from cache)",
            outcome.stars.len(),
            outcome.pages,
            outcome.cached_pages
        );
        Ok(outcome)
    }
}

fn header_value<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Quota headers of a GitHub response, if present
pub fn parse_rate_limit(headers: &HeaderMap) -> Option<RateLimitInfo> {
    let remaining = header_value::<u32>(headers, "x-ratelimit-remaining")?;
    Some(RateLimitInfo {
        limit: header_value(headers, "x-ratelimit-limit"),
        remaining,
        reset_at: header_value::<i64>(headers, "x-ratelimit-reset")
            .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single()),
    })
}

/// Primary quota exhausted, or a secondary limit asking us to retry later
fn is_rate_limited(status: StatusCode, headers: &HeaderMap) -> bool {
    let exhausted = header_value::<u32>(headers, "x-ratelimit-remaining") == Some(0);
    let retry_after = headers.contains_key(RETRY_AFTER);
    match status {
        StatusCode::TOO_MANY_REQUESTS => exhausted || retry_after,
        StatusCode::FORBIDDEN => exhausted || retry_after,
        _ => false,
    }
}

/// Earliest instant a new request may be made
pub fn rate_limit_reset(headers: &HeaderMap, now: DateTime<Utc>) -> DateTime<Utc> {
    if let Some(retry_after) = header_value::<i64>(headers, RETRY_AFTER.as_str()) {
        return now + ChronoDuration::seconds(retry_after.max(0));
    }

    header_value::<i64>(headers, "x-ratelimit-reset")
        .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single())
        .filter(|reset| *reset > now)
        .unwrap_or_else(|| now + ChronoDuration::seconds(60))
}

/// Check a token against the API and return the login it belongs to
pub async fn validate_token(token: &str, api_base: &str) -> Result<String> {
    let client = Octocrab::builder()
        .base_uri(api_base.to_string())
        .context("Invalid GitHub API base URL")?
        .personal_token(token.to_string())
        .build()
        .context("Failed to create GitHub client")?;

    let user = client
        .current()
        .user()
        .await
        .context("Failed to get current user information. Check your token.")?;

    info!("Token belongs to GitHub user: {}", user.login);
    Ok(user.login)
}
