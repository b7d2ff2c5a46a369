//! starwatch - GitHub star monitoring and notification daemon
//!
//! starwatch polls the owner's starred repositories with conditional requests,
//! detects newly starred ones, enriches them with an AI summary and preview
//! media, and delivers notifications to Telegram chats, either instantly or
//! as daily/weekly digests.
//!
//! ## Pipeline
//!
//! - [`github`]: Star Fetcher with ETag revalidation and rate-limit handling
//! - [`diff`]: detects stars not yet in the known set
//! - [`digest`]: Notification Aggregator (instant, daily, weekly)
//! - [`fanout`]: enrich once, deliver to every destination
//! - [`monitor`]: the loop that schedules polls and owns all state
//! - [`state`]: SQLite persistence of everything that must survive a restart

pub mod cache;
pub mod config;
pub mod control;
pub mod credentials;
pub mod daemon;
pub mod diff;
pub mod digest;
pub mod enrich;
pub mod error;
pub mod fanout;
pub mod formatter;
pub mod github;
pub mod models;
pub mod monitor;
pub mod state;
pub mod telegram;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{MonitorError, MonitorResult};
pub use models::{Destination, DigestMode, Message, MonitoredRepo, StarredRepo};
pub use monitor::{Command, CommandReply, Monitor, MonitorStatus};
pub use state::StateDb;
