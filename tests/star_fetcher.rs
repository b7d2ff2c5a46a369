//! Star Fetcher against a mocked GitHub API

mod common;

use assert_matches::assert_matches;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::MemoryCredentials;
use starwatch::cache::{page_key, EtagCache};
use starwatch::config::GitHubConfig;
use starwatch::credentials::CredentialStore;
use starwatch::github::{StarFetcher, StarSource};
use starwatch::MonitorError;

const TOKEN: &str = "ghp_test_token";

fn item(id: u64, starred_at: &str) -> Value {
    json!({
        "starred_at": starred_at,
        "repo": {
            "id": id,
            "full_name": format!("octo/repo-{}", id),
            "html_url": format!("https://github.com/octo/repo-{}", id),
            "description": "A repository",
            "language": "Rust",
            "stargazers_count": 42,
            "forks_count": 7,
            "default_branch": "main"
        }
    })
}

fn fetcher(server: &MockServer, per_page: u32, cache: Arc<EtagCache>, token: Option<&str>) -> StarFetcher {
    let credentials = MemoryCredentials::default();
    if let Some(token) = token {
        credentials.set_token(token).unwrap();
    }

    let config = GitHubConfig {
        api_base: server.uri(),
        per_page,
        ..Default::default()
    };
    StarFetcher::new(&config, cache, Arc::new(credentials)).unwrap()
}

#[tokio::test]
async fn test_fetches_every_page() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/user/starred"))
        .and(query_param("page", "1"))
        .and(query_param("per_page", "2"))
        .and(header("authorization", "Bearer ghp_test_token"))
        .and(header("accept", "application/vnd.github.star+json"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([
                    item(3, "2024-06-03T10:00:00Z"),
                    item(2, "2024-06-02T10:00:00Z")
                ]))
                .insert_header("x-ratelimit-limit", "5000")
                .insert_header("x-ratelimit-remaining", "4998"),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/user/starred"))
        .and(query_param("page", "2"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([item(1, "2024-06-01T10:00:00Z")]))
                .insert_header("x-ratelimit-limit", "5000")
                .insert_header("x-ratelimit-remaining", "4997"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let source = fetcher(&server, 2, Arc::new(EtagCache::new()), Some(TOKEN));
    let outcome = source.fetch_stars().await.unwrap();

    let ids: Vec<_> = outcome.stars.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![3, 2, 1]);
    assert_eq!(outcome.pages, 2);
    assert_eq!(outcome.cached_pages, 0);
    assert_eq!(outcome.stars[0].full_name, "octo/repo-3");
    assert_eq!(outcome.stars[0].stargazers_count, 42);

    let rate_limit = outcome.rate_limit.unwrap();
    assert_eq!(rate_limit.remaining, 4997);
    assert_eq!(rate_limit.limit, Some(5000));
}

#[tokio::test]
async fn test_not_modified_reuses_cached_page() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/user/starred"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/user/starred"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([item(7, "2024-06-01T10:00:00Z")]))
                .insert_header("etag", "\"v1\""),
        )
        .expect(1)
        .mount(&server)
        .await;

    let cache = Arc::new(EtagCache::new());
    let source = fetcher(&server, 100, cache.clone(), Some(TOKEN));

    let first = source.fetch_stars().await.unwrap();
    assert_eq!(first.changed.len(), 1);
    assert_eq!(first.changed[0].etag, "\"v1\"");
    assert!(first.revalidated.is_empty());
    assert_eq!(cache.len(), 1);

    let second = source.fetch_stars().await.unwrap();
    assert_eq!(second.stars, first.stars);
    assert_eq!(second.cached_pages, 1);
    assert!(second.changed.is_empty());
    assert_eq!(second.revalidated, vec![page_key(1)]);
}

#[tokio::test]
async fn test_primary_rate_limit_reports_reset_time() {
    let server = MockServer::start().await;
    let reset = Utc::now().timestamp() + 600;

    Mock::given(method("GET"))
        .and(path("/user/starred"))
        .respond_with(
            ResponseTemplate::new(403)
                .set_body_json(json!({ "message": "API rate limit exceeded" }))
                .insert_header("x-ratelimit-remaining", "0")
                .insert_header("x-ratelimit-reset", reset.to_string().as_str()),
        )
        .mount(&server)
        .await;

    let source = fetcher(&server, 100, Arc::new(EtagCache::new()), Some(TOKEN));
    let err = source.fetch_stars().await.unwrap_err();

    assert_matches!(err, MonitorError::RateLimited { reset_at } if reset_at.timestamp() == reset);
}

#[tokio::test]
async fn test_secondary_rate_limit_honors_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/user/starred"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "120"))
        .mount(&server)
        .await;

    let source = fetcher(&server, 100, Arc::new(EtagCache::new()), Some(TOKEN));
    let before = Utc::now();
    let err = source.fetch_stars().await.unwrap_err();

    match err {
        MonitorError::RateLimited { reset_at } => {
            let wait = (reset_at - before).num_seconds();
            assert!((119..=125).contains(&wait), "unexpected wait {}", wait);
        }
        other => panic!("expected RateLimited, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unauthorized_is_rejected_token() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/user/starred"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({ "message": "Bad credentials" })),
        )
        .mount(&server)
        .await;

    let source = fetcher(&server, 100, Arc::new(EtagCache::new()), Some(TOKEN));
    let err = source.fetch_stars().await.unwrap_err();

    assert_matches!(
        err,
        MonitorError::Configuration { token_rejected: true, ref reason } if reason.contains("Bad credentials")
    );
}

#[tokio::test]
async fn test_server_error_leaves_cache_untouched() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/user/starred"))
        .and(query_param("page", "1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([
                    item(2, "2024-06-02T10:00:00Z"),
                    item(1, "2024-06-01T10:00:00Z")
                ]))
                .insert_header("etag", "\"page-one\""),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/user/starred"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let cache = Arc::new(EtagCache::new());
    let source = fetcher(&server, 2, cache.clone(), Some(TOKEN));
    let err = source.fetch_stars().await.unwrap_err();

    assert_matches!(err, MonitorError::Transient(_));
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_missing_token_makes_no_request() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&server)
        .await;

    let source = fetcher(&server, 100, Arc::new(EtagCache::new()), None);
    let err = source.fetch_stars().await.unwrap_err();

    assert_matches!(
        err,
        MonitorError::Configuration {
            token_rejected: false,
            ..
        }
    );
}
