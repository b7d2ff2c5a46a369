//! Messaging Gateway backed by the Telegram Bot API
//!
//! Media fall back to a plain text message when Telegram refuses them, and a
//! text message whose link preview cannot be fetched is re-sent with previews
//! disabled. Consecutive messages to one chat are spaced out, and a flood
//! limit answer (429 with `retry_after`) is retried once after the wait.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::TelegramConfig;
use crate::error::{MonitorError, MonitorResult};
use crate::formatter::{
    render_digest_header, render_notice, render_notification, MediaKind, CAPTION_LIMIT,
    TEXT_LIMIT,
};
use crate::models::{Destination, Message, MonitoredRepo};

const PREVIEW_FAILED: &str = "WEBPAGE_CURL_FAILED";

/// Longest flood-limit wait honored before giving up on a message
const MAX_RETRY_AFTER_SECS: u64 = 60;

/// Delivers rendered messages to a destination
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    async fn deliver(&self, destination: &Destination, message: &Message) -> MonitorResult<()>;
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

/// Why Telegram refused a call
struct Refusal {
    description: String,
    retry_after: Option<u64>,
}

impl Refusal {
    fn new(description: String) -> Self {
        Self {
            description,
            retry_after: None,
        }
    }
}

pub struct TelegramGateway {
    http: HttpClient,
    api_base: String,
    bot_token: String,
    parse_mode: String,
    message_delay: Duration,
}

impl TelegramGateway {
    pub fn new(config: &TelegramConfig, bot_token: String) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(config.request_timeout))
            .build()
            .context("Failed to create Telegram HTTP client")?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            bot_token,
            parse_mode: config.parse_mode.clone(),
            message_delay: Duration::from_millis(config.message_delay_ms),
        })
    }

    /// Invoke a Bot API method; the error is Telegram's description
    async fn call(&self, method: &str, destination: &Destination, body: Map<String, Value>) -> Result<(), String> {
        match self.call_once(method, destination, &body).await {
            Err(Refusal {
                description,
                retry_after: Some(secs),
            }) => {
                let wait = secs.min(MAX_RETRY_AFTER_SECS);
                warn!(
                    "Telegram flood limit for {} ({}), retrying in {}s",
                    destination, description, wait
                );
                sleep(Duration::from_secs(wait)).await;
                self.call_once(method, destination, &body)
                    .await
                    .map_err(|refusal| refusal.description)
            }
            other => other.map_err(|refusal| refusal.description),
        }
    }

    async fn call_once(&self, method: &str, destination: &Destination, body: &Map<String, Value>) -> Result<(), Refusal> {
        let mut body = body.clone();
        body.insert("chat_id".into(), json!(destination.chat_id()));
        if let Some(thread_id) = destination.thread_id() {
            body.insert("message_thread_id".into(), json!(thread_id));
        }

        let url = format!("{}/bot{}/{}", self.api_base, self.bot_token, method);
        let response = self
            .http
            .post(&url)
            .json(&Value::Object(body))
            .send()
            .await
            .map_err(|e| Refusal::new(format!("{} request failed: {}", method, e.without_url())))?;

        let status = response.status();
        let parsed = response.json::<ApiResponse>().await.ok();

        match parsed {
            Some(ApiResponse { ok: true, .. }) if status.is_success() => Ok(()),
            Some(ApiResponse {
                description,
                parameters,
                ..
            }) => Err(Refusal {
                description: description.unwrap_or_else(|| format!("{} returned {}", method, status)),
                retry_after: parameters.and_then(|p| p.retry_after),
            }),
            None => Err(Refusal::new(format!("{} returned {}", method, status))),
        }
    }

    async fn pace(&self) {
        if !self.message_delay.is_zero() {
            sleep(self.message_delay).await;
        }
    }

    async fn send_text(&self, destination: &Destination, text: &str) -> Result<(), String> {
        let body = |disable_preview: bool| {
            let mut body = Map::new();
            body.insert("text".into(), json!(text));
            body.insert("parse_mode".into(), json!(self.parse_mode));
            body.insert("disable_web_page_preview".into(), json!(disable_preview));
            body
        };

        match self.call("sendMessage", destination, body(false)).await {
            Err(reason) if reason.contains(PREVIEW_FAILED) => {
                warn!(
                    "Link preview failed for {}, retrying without preview",
                    destination
                );
                self.call("sendMessage", destination, body(true)).await
            }
            other => other,
        }
    }

    async fn send_media(&self, destination: &Destination, repo: &MonitoredRepo) -> Result<(), String> {
        let caption = render_notification(repo, CAPTION_LIMIT);

        if let [url] = repo.media.as_slice() {
            let kind = MediaKind::from_url(url);
            let (method, field) = match kind {
                MediaKind::Photo => ("sendPhoto", "photo"),
                MediaKind::Animation => ("sendAnimation", "animation"),
                MediaKind::Video => ("sendVideo", "video"),
            };
            let mut body = Map::new();
            body.insert(field.into(), json!(url));
            body.insert("caption".into(), json!(caption));
            body.insert("parse_mode".into(), json!(self.parse_mode));
            return self.call(method, destination, body).await;
        }

        let media: Vec<Value> = repo
            .media
            .iter()
            .enumerate()
            .map(|(i, url)| {
                let mut item = json!({
                    "type": MediaKind::from_url(url).input_media_type(),
                    "media": url,
                });
                if i == 0 {
                    item["caption"] = json!(caption);
                    item["parse_mode"] = json!(self.parse_mode);
                }
                item
            })
            .collect();

        let mut body = Map::new();
        body.insert("media".into(), Value::Array(media));
        self.call("sendMediaGroup", destination, body).await
    }

    async fn send_repo(&self, destination: &Destination, repo: &MonitoredRepo) -> Result<(), String> {
        if !repo.media.is_empty() {
            match self.send_media(destination, repo).await {
                Ok(()) => return Ok(()),
                Err(reason) => warn!(
                    "Media for {} rejected by {} ({}), sending text only",
                    repo.repo.full_name, destination, reason
                ),
            }
        }

        self.send_text(destination, &render_notification(repo, TEXT_LIMIT))
            .await
    }
}

#[async_trait]
impl MessagingGateway for TelegramGateway {
    async fn deliver(&self, destination: &Destination, message: &Message) -> MonitorResult<()> {
        let failure = |reason: String| MonitorError::Delivery {
            destination: destination.to_string(),
            reason,
        };

        match message {
            Message::Single(repo) => self.send_repo(destination, repo).await.map_err(failure),
            Message::Notice(text) => self
                .send_text(destination, &render_notice(text))
                .await
                .map_err(failure),
            Message::Digest { mode, repos } => {
                self.send_text(destination, &render_digest_header(*mode, repos.len()))
                    .await
                    .map_err(&failure)?;

                // Keep going so one bad entry does not hide the rest of the digest
                let mut failed = Vec::new();
                for repo in repos {
                    self.pace().await;
                    if let Err(reason) = self.send_repo(destination, repo).await {
                        failed.push(format!("{}: {}", repo.repo.full_name, reason));
                    }
                }

                if failed.is_empty() {
                    debug!("Delivered digest of {} to {}", repos.len(), destination);
                    Ok(())
                } else {
                    Err(failure(format!(
                        "{} of {} digest entries failed ({})",
                        failed.len(),
                        repos.len(),
                        failed.join("; ")
                    )))
                }
            }
        }
    }
}

/// Gateway for offline commands when no bot token is configured
pub struct DisabledGateway;

#[async_trait]
impl MessagingGateway for DisabledGateway {
    async fn deliver(&self, destination: &Destination, _message: &Message) -> MonitorResult<()> {
        Err(MonitorError::Delivery {
            destination: destination.to_string(),
            reason: "Telegram bot token is not configured".to_string(),
        })
    }
}
