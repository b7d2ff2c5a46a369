//! HTML rendering of notifications for the Telegram gateway

use crate::models::{DigestMode, MonitoredRepo};

/// Telegram's limit for media captions
pub const CAPTION_LIMIT: usize = 1024;
/// Telegram's limit for text messages
pub const TEXT_LIMIT: usize = 4096;

const NO_DESCRIPTION: &str = "No description available.";
const ELLIPSIS: char = '…';

/// How a media URL is sent, decided by its extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Animation,
    Video,
}

impl MediaKind {
    pub fn from_url(url: &str) -> Self {
        let path = url
            .split(|c| c == '?' || c == '#')
            .next()
            .unwrap_or(url)
            .to_lowercase();

        if [".mp4", ".mov", ".webm"].iter().any(|ext| path.ends_with(ext)) {
            MediaKind::Video
        } else if path.ends_with(".gif") {
            MediaKind::Animation
        } else {
            MediaKind::Photo
        }
    }

    /// `type` field of an InputMedia object
    pub fn input_media_type(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Animation => "animation",
            MediaKind::Video => "video",
        }
    }
}

pub fn html_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// 950, 1.2K, 3.4M
pub fn format_number(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

fn hashtag(language: &str) -> String {
    let tag: String = language
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    format!("#{}", tag)
}

/// Escape `raw` so the result fits in `budget` characters, cutting on a
/// character boundary (never inside an entity) and marking the cut
fn escape_within(raw: &str, budget: usize) -> String {
    let escaped = html_escape(raw);
    if escaped.chars().count() <= budget {
        return escaped;
    }

    let mut out = String::new();
    let mut used = 0;
    let room = budget.saturating_sub(1);
    for c in raw.chars() {
        let piece = html_escape(&c.to_string());
        let width = piece.chars().count();
        if used + width > room {
            break;
        }
        out.push_str(&piece);
        used += width;
    }
    out.trim_end().to_string() + &ELLIPSIS.to_string()
}

fn notification_body(repo: &MonitoredRepo, description: &str) -> String {
    let r = &repo.repo;
    let url = html_escape(&r.html_url);
    let language = r
        .language
        .as_deref()
        .map(hashtag)
        .unwrap_or_else(|| "Not specified".to_string());

    format!(
        "📦 <a href='{url}'>{name}</a>\n\n\
         📝 <b>Desc:</b>\n{description}\n\n\
         <blockquote>⭐ Stars: <b>{stars}</b> | 🍴 Forks: <b>{forks}</b></blockquote>\n\n\
         💻 <b>Lang:</b> {language}\n\n\
         <a href='{url}'>🔗 View on GitHub</a>",
        url = url,
        name = html_escape(&r.full_name),
        description = description,
        stars = format_number(r.stargazers_count),
        forks = format_number(r.forks_count),
        language = language,
    )
}

/// One repository as an HTML message no longer than `limit` characters.
/// The description absorbs any truncation so the markup stays intact.
pub fn render_notification(repo: &MonitoredRepo, limit: usize) -> String {
    let raw_description = repo
        .summary
        .as_deref()
        .or(repo.repo.description.as_deref())
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .unwrap_or(NO_DESCRIPTION);

    let skeleton = notification_body(repo, "").chars().count();
    let budget = limit.saturating_sub(skeleton);
    notification_body(repo, &escape_within(raw_description, budget))
}

pub fn render_digest_header(mode: DigestMode, count: usize) -> String {
    let kind = match mode {
        DigestMode::Weekly => "Weekly",
        _ => "Daily",
    };
    let noun = if count == 1 { "star" } else { "stars" };
    format!("📬 <b>{} digest: {} new {}</b>", kind, count, noun)
}

pub fn render_notice(text: &str) -> String {
    let budget = TEXT_LIMIT.saturating_sub(3);
    format!("⚠️ {}", escape_within(text, budget))
}
