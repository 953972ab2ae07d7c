//! Integration tests for batch processing: scheduling, classification,
//! cancellation, and failover against a local mock HTTP server.
//!
//! Each test starts its own wiremock server so feeds never touch the network.
//! Timing assertions use real time; the delays are kept short.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use feedpool::{Config, FeedFormat, ParallelProcessor, ProcessingStatus, Source, Task};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const HELLO_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><item><title>Hello</title></item></channel></rss>"#;

fn processor_with(max_concurrency: usize) -> ParallelProcessor {
    let config = Config {
        max_concurrency,
        ..Config::default()
    };
    ParallelProcessor::new(config).unwrap()
}

fn sources_under(server: &MockServer, prefix: &str, count: usize) -> Vec<Source> {
    (0..count)
        .map(|i| {
            Source::new(
                format!("{}{}", prefix, i),
                format!("{}/{}/{}", server.uri(), prefix, i),
            )
        })
        .collect()
}

async fn serve_rss(server: &MockServer, delay: Duration) {
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(HELLO_RSS)
                .set_delay(delay),
        )
        .mount(server)
        .await;
}

// ============================================================================
// Result set
// ============================================================================

#[tokio::test]
async fn test_all_sources_succeed_with_two_workers() {
    let server = MockServer::start().await;
    serve_rss(&server, Duration::ZERO).await;

    let processor = processor_with(2);
    assert_eq!(processor.max_concurrency(), 2);

    let sources = sources_under(&server, "s", 5);
    let results = processor.process_parallel_feeds(&sources).await;

    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.status == ProcessingStatus::Success));
    assert!(results.iter().all(|r| r.items.len() == 1));
}

#[tokio::test]
async fn test_one_result_per_source_in_mixed_batch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/bad/"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/good/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(HELLO_RSS))
        .mount(&server)
        .await;

    let mut sources = sources_under(&server, "good", 4);
    sources.extend(sources_under(&server, "bad", 3));

    let results = processor_with(5).process_parallel_feeds(&sources).await;
    assert_eq!(results.len(), sources.len());

    let ids: HashSet<&str> = results.iter().map(|r| r.source_id.as_str()).collect();
    let expected: HashSet<&str> = sources.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, expected);

    for result in &results {
        if result.source_id.starts_with("good") {
            assert_eq!(result.status, ProcessingStatus::Success);
        } else {
            assert_eq!(result.status, ProcessingStatus::Retry);
            assert_eq!(result.attempt, 0);
            assert!(result.items.is_empty());
        }
    }
}

#[tokio::test]
async fn test_json_and_rss_sources_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/markets.json"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"{"items":[{"id":"x","title":"T"}]}"#),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fed.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(HELLO_RSS))
        .mount(&server)
        .await;

    let sources = vec![
        Source::new("markets", format!("{}/markets.json", server.uri()))
            .with_format(FeedFormat::Json),
        Source::new("fed", format!("{}/fed.xml", server.uri())),
    ];
    let results = processor_with(5).process_parallel_feeds(&sources).await;

    let markets = results.iter().find(|r| r.source_id == "markets").unwrap();
    assert_eq!(markets.items.len(), 1);
    assert!(markets.items[0].id.ends_with("_x"));
    assert_eq!(markets.items[0].title, "T");

    let fed = results.iter().find(|r| r.source_id == "fed").unwrap();
    assert_eq!(fed.items.len(), 1);
    assert_eq!(fed.items[0].title, "Hello");
    assert_eq!(fed.items[0].description, "");
    assert_eq!(fed.items[0].source_id, "fed");
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test]
async fn test_worker_count_bounds_parallelism() {
    let server = MockServer::start().await;
    serve_rss(&server, Duration::from_millis(300)).await;

    let processor = processor_with(5);
    let sources = sources_under(&server, "s", 6);

    let started = Instant::now();
    let results = processor.process_parallel_feeds(&sources).await;
    let elapsed = started.elapsed();

    assert_eq!(results.len(), 6);
    // Six slow fetches through five workers need two rounds
    assert!(elapsed >= Duration::from_millis(600), "elapsed {:?}", elapsed);
    assert!(results
        .iter()
        .all(|r| r.resources.concurrent_connections <= 5));
}

#[tokio::test]
async fn test_higher_priority_runs_first() {
    let server = MockServer::start().await;
    serve_rss(&server, Duration::ZERO).await;

    let processor = processor_with(1);
    let sources = vec![
        Source::new("low", format!("{}/low", server.uri())).with_priority(1),
        Source::new("high", format!("{}/high", server.uri())).with_priority(9),
        Source::new("mid-a", format!("{}/mid-a", server.uri())).with_priority(5),
        Source::new("mid-b", format!("{}/mid-b", server.uri())).with_priority(5),
    ];

    let results = processor.process_parallel_feeds(&sources).await;
    let order: Vec<&str> = results.iter().map(|r| r.source_id.as_str()).collect();
    assert_eq!(order, vec!["high", "mid-a", "mid-b", "low"]);
}

#[tokio::test]
async fn test_concurrency_change_applies_to_next_call() {
    let server = MockServer::start().await;
    serve_rss(&server, Duration::from_millis(200)).await;

    let processor = processor_with(1);
    let sources = sources_under(&server, "s", 3);

    let started = Instant::now();
    let (results, _) = tokio::join!(processor.process_parallel_feeds(&sources), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        processor.set_max_concurrency(10)
    });
    let serial = started.elapsed();
    assert_eq!(results.len(), 3);
    assert!(serial >= Duration::from_millis(600), "elapsed {:?}", serial);

    let started = Instant::now();
    let results = processor.process_parallel_feeds(&sources).await;
    let parallel = started.elapsed();
    assert_eq!(results.len(), 3);
    assert!(parallel < Duration::from_millis(600), "elapsed {:?}", parallel);
}

// ============================================================================
// Timeouts and retry classification
// ============================================================================

#[tokio::test]
async fn test_timeout_is_retry_until_budget_spent() {
    let server = MockServer::start().await;
    serve_rss(&server, Duration::from_secs(3)).await;

    let config = Config {
        total_timeout_secs: 1,
        ..Config::default()
    };
    let processor = ParallelProcessor::new(config).unwrap();
    let source = Source::new("slow", server.uri());

    let first = processor.process_task(Task::new(source.clone())).await;
    assert_eq!(first.status, ProcessingStatus::Retry);
    assert_eq!(first.attempt, 0);
    assert!(first.error.is_some());

    // Third resubmission: budget exhausted
    let last = processor
        .process_task(Task::resume(source, Task::DEFAULT_MAX_RETRIES))
        .await;
    assert_eq!(last.status, ProcessingStatus::Failure);
    assert_eq!(last.attempt, 3);
    assert!(last.items.is_empty());
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_mid_batch_reports_every_source() {
    let server = MockServer::start().await;
    serve_rss(&server, Duration::from_secs(5)).await;

    let processor = processor_with(2);
    let sources = sources_under(&server, "s", 4);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let results = processor
        .process_parallel_feeds_with_cancel(&sources, &cancel)
        .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(results.len(), 4);
    for result in &results {
        assert_eq!(result.status, ProcessingStatus::Failure);
        assert!(result.error.as_deref().unwrap().contains("cancelled"));
    }
    assert_eq!(processor.connections().active_count(), 0);

    // A cancelled batch is not evidence of unreliable sources
    let report = processor.optimize_resource_allocation();
    assert_eq!(report.metrics.error_rate, 0.0);
    assert!(report.recommendations.iter().all(|r| r.area != "reliability"));
}

// ============================================================================
// Failover
// ============================================================================

#[tokio::test]
async fn test_failover_gives_up_after_three_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let processor = processor_with(5);
    let source = Source::new("down", server.uri());
    let retries = processor.handle_failover_retry(&[source]).await;

    assert_eq!(retries.len(), 1);
    let retry = &retries[0];
    assert!(!retry.success);
    assert_eq!(retry.attempts, 3);
    assert!(retry.recovery_time >= Duration::from_millis(3000));
    assert!(retry.error.as_deref().unwrap().contains("500"));
}

#[tokio::test]
async fn test_failover_recovers_on_first_attempt() {
    let server = MockServer::start().await;
    serve_rss(&server, Duration::ZERO).await;

    let processor = processor_with(5);
    let source = Source::new("back", server.uri());
    let retries = processor.handle_failover_retry(&[source]).await;

    assert!(retries[0].success);
    assert_eq!(retries[0].attempts, 1);
    assert_eq!(retries[0].items.len(), 1);
    assert!(retries[0].error.is_none());
}

// ============================================================================
// Reports after a batch
// ============================================================================

#[tokio::test]
async fn test_error_rate_reflects_batch_outcomes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let processor = processor_with(5);
    let sources = sources_under(&server, "s", 3);
    processor.process_parallel_feeds(&sources).await;

    let report = processor.optimize_resource_allocation();
    assert_eq!(report.metrics.error_rate, 1.0);
    assert!(report
        .recommendations
        .iter()
        .any(|r| r.area == "reliability"));
}
