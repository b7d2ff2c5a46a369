//! Destination Fan-out - enrich once, deliver everywhere
//!
//! Enrichment for a batch runs on a bounded pool. Each repository is enriched
//! exactly once however many destinations there are. Destinations are served
//! concurrently, and messages to one destination go out sequentially in
//! star-chronological order. A failing destination never stops the others.

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::digest::Flush;
use crate::enrich::Enricher;
use crate::error::MonitorError;
use crate::models::{Destination, Message, MonitoredRepo, StarredRepo};
use crate::telegram::MessagingGateway;

/// Outcome of delivering one batch
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub destinations: usize,
    pub messages: usize,
    pub delivered: usize,
    pub failures: Vec<MonitorError>,
    pub duration: Duration,
}

impl DeliveryReport {
    pub fn failed_destinations(&self) -> Vec<String> {
        self.failures
            .iter()
            .filter_map(|failure| match failure {
                MonitorError::Delivery { destination, .. } => Some(destination.clone()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct FanOut {
    enricher: Arc<dyn Enricher>,
    gateway: Arc<dyn MessagingGateway>,
    concurrency: usize,
    enrich_timeout: Duration,
    message_delay: Duration,
}

impl FanOut {
    pub fn new(
        enricher: Arc<dyn Enricher>,
        gateway: Arc<dyn MessagingGateway>,
        concurrency: usize,
        enrich_timeout: Duration,
    ) -> Self {
        Self {
            enricher,
            gateway,
            concurrency: concurrency.max(1),
            enrich_timeout,
            message_delay: Duration::ZERO,
        }
    }

    /// Space consecutive messages to the same destination
    pub fn with_message_delay(mut self, delay: Duration) -> Self {
        self.message_delay = delay;
        self
    }

    /// Enrich every repository once, with bounded concurrency, preserving order
    pub async fn enrich_all(&self, repos: &[StarredRepo]) -> Vec<MonitoredRepo> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut futures = FuturesUnordered::new();

        for (index, repo) in repos.iter().cloned().enumerate() {
            let semaphore = semaphore.clone();
            let enricher = self.enricher.clone();
            let enrich_timeout = self.enrich_timeout;

            futures.push(async move {
                // The semaphore is never closed
                let _permit = semaphore.acquire().await.ok();

                let enrichment = match timeout(enrich_timeout, enricher.enrich(&repo)).await {
                    Ok(enrichment) => enrichment,
                    Err(_) => {
                        warn!(
                            "Enrichment for {} timed out after {}s",
                            repo.full_name,
                            enrich_timeout.as_secs()
                        );
                        Default::default()
                    }
                };
                (index, MonitoredRepo::new(repo, enrichment))
            });
        }

        let mut enriched: Vec<Option<MonitoredRepo>> = vec![None; repos.len()];
        while let Some((index, monitored)) = futures.next().await {
            enriched[index] = Some(monitored);
        }
        enriched.into_iter().flatten().collect()
    }

    /// Messages a flush turns into: one per repository, or a single digest
    fn messages(flush: &Flush, enriched: Vec<MonitoredRepo>) -> Vec<Message> {
        match flush.digest {
            Some(mode) => vec![Message::Digest {
                mode,
                repos: enriched,
            }],
            None => enriched.into_iter().map(Message::Single).collect(),
        }
    }

    /// Enrich the batch and deliver it to every destination
    pub async fn deliver(&self, flush: &Flush, destinations: &[Destination]) -> DeliveryReport {
        let start = Instant::now();
        let enriched = self.enrich_all(&flush.repos).await;
        let messages = Self::messages(flush, enriched);

        let mut report = self.send_all(&messages, destinations).await;
        report.duration = start.elapsed();

        info!(
            "Delivered {} of {} messages to {} destinations in {:.2}s ({} failures)",
            report.delivered,
            report.messages * report.destinations,
            report.destinations,
            report.duration.as_secs_f64(),
            report.failures.len()
        );
        report
    }

    /// Deliver a plain notice to a single destination
    pub async fn notify(&self, destination: &Destination, text: &str) -> Result<(), MonitorError> {
        self.gateway
            .deliver(destination, &Message::Notice(text.to_string()))
            .await
    }

    async fn send_all(&self, messages: &[Message], destinations: &[Destination]) -> DeliveryReport {
        let per_destination = destinations.iter().map(|destination| {
            let gateway = self.gateway.clone();
            let delay = self.message_delay;
            async move {
                let mut delivered = 0;
                let mut failures = Vec::new();
                // In order: a destination sees stars oldest first
                for (i, message) in messages.iter().enumerate() {
                    if i > 0 && !delay.is_zero() {
                        sleep(delay).await;
                    }
                    match gateway.deliver(destination, message).await {
                        Ok(()) => {
                            debug!("Delivered {} repos to {}", message.repo_count(), destination);
                            delivered += 1;
                        }
                        Err(e) => {
                            error!("Delivery to {} failed: {}", destination, e);
                            failures.push(e);
                        }
                    }
                }
                (delivered, failures)
            }
        });

        let mut report = DeliveryReport {
            destinations: destinations.len(),
            messages: messages.len(),
            ..Default::default()
        };
        for (delivered, failures) in join_all(per_destination).await {
            report.delivered += delivered;
            report.failures.extend(failures);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::MockEnricher;
    use crate::models::{DigestMode, Enrichment};
    use crate::telegram::MockMessagingGateway;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Tracks how many enrichments run at the same time
    #[derive(Default)]
    struct PeakEnricher {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Enricher for PeakEnricher {
        async fn enrich(&self, _repo: &StarredRepo) -> Enrichment {
            let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_running, Ordering::SeqCst);
            sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Enrichment::default()
        }
    }

    fn star(id: u64) -> StarredRepo {
        StarredRepo {
            id,
            full_name: format!("owner/repo-{}", id),
            starred_at: Utc::now() - ChronoDuration::minutes(10 - id as i64),
            html_url: format!("https://github.com/owner/repo-{}", id),
            description: None,
            language: None,
            stargazers_count: 0,
            forks_count: 0,
            default_branch: None,
        }
    }

    fn summarizing_enricher(expected_calls: usize) -> MockEnricher {
        let mut enricher = MockEnricher::new();
        enricher
            .expect_enrich()
            .times(expected_calls)
            .returning(|repo| Enrichment {
                summary: Some(format!("about {}", repo.full_name)),
                media: vec![],
            });
        enricher
    }

    #[tokio::test]
    async fn test_enrich_all_preserves_order() {
        let fanout = FanOut::new(
            Arc::new(summarizing_enricher(5)),
            Arc::new(MockMessagingGateway::new()),
            2,
            Duration::from_secs(5),
        );

        let repos: Vec<_> = (1..=5).map(star).collect();
        let enriched = fanout.enrich_all(&repos).await;
        let ids: Vec<_> = enriched.iter().map(|m| m.repo.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(enriched[2].summary.as_deref(), Some("about owner/repo-3"));
    }

    #[tokio::test]
    async fn test_enriches_once_for_many_destinations() {
        let mut gateway = MockMessagingGateway::new();
        gateway.expect_deliver().times(6).returning(|_, _| Ok(()));

        let fanout = FanOut::new(
            Arc::new(summarizing_enricher(2)),
            Arc::new(gateway),
            3,
            Duration::from_secs(5),
        );

        let destinations = vec![
            Destination::parse("1").unwrap(),
            Destination::parse("2").unwrap(),
            Destination::parse("@three_chan").unwrap(),
        ];
        let flush = Flush {
            repos: vec![star(1), star(2)],
            digest: None,
        };

        let report = fanout.deliver(&flush, &destinations).await;
        assert_eq!(report.delivered, 6);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn test_failed_destination_is_isolated() {
        let mut gateway = MockMessagingGateway::new();
        gateway.expect_deliver().returning(|destination, _| {
            if destination.as_str() == "666" {
                Err(MonitorError::Delivery {
                    destination: destination.to_string(),
                    reason: "chat not found".to_string(),
                })
            } else {
                Ok(())
            }
        });

        let fanout = FanOut::new(
            Arc::new(summarizing_enricher(3)),
            Arc::new(gateway),
            3,
            Duration::from_secs(5),
        );

        let destinations = vec![
            Destination::parse("666").unwrap(),
            Destination::parse("777").unwrap(),
        ];
        let flush = Flush {
            repos: vec![star(1), star(2), star(3)],
            digest: Some(DigestMode::Daily),
        };

        let report = fanout.deliver(&flush, &destinations).await;
        assert_eq!(report.messages, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed_destinations(), vec!["666".to_string()]);
    }

    #[tokio::test]
    async fn test_enrichment_pool_is_bounded() {
        let enricher = Arc::new(PeakEnricher::default());
        let fanout = FanOut::new(
            enricher.clone(),
            Arc::new(MockMessagingGateway::new()),
            2,
            Duration::from_secs(5),
        );

        let repos: Vec<_> = (1..=8).map(star).collect();
        let enriched = fanout.enrich_all(&repos).await;

        assert_eq!(enriched.len(), 8);
        let peak = enricher.peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "peak concurrency was {}", peak);
        assert!(peak >= 1);
    }

    #[tokio::test]
    async fn test_messages_to_one_destination_are_spaced() {
        let mut gateway = MockMessagingGateway::new();
        gateway.expect_deliver().times(3).returning(|_, _| Ok(()));

        let fanout = FanOut::new(
            Arc::new(summarizing_enricher(3)),
            Arc::new(gateway),
            3,
            Duration::from_secs(5),
        )
        .with_message_delay(Duration::from_millis(50));

        let flush = Flush {
            repos: vec![star(1), star(2), star(3)],
            digest: None,
        };

        let start = Instant::now();
        let report = fanout
            .deliver(&flush, &[Destination::parse("1").unwrap()])
            .await;

        assert_eq!(report.delivered, 3);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
