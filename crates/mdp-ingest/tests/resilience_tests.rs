//! Timing properties of the resilience wrapper
//!
//! All tests run on a paused tokio clock, so sleeps complete instantly while
//! `Instant` differences still reflect the scheduled delays.

mod common;

use common::{page, quick_resilience, ScriptedAdapter};
use mdp_ingest::config::ResilienceConfig;
use mdp_ingest::resilience::{CircuitState, Resilience};
use mdp_ingest::source::ResilientSource;
use mdp_ingest::stats::RunStats;
use mdp_ingest::{FetchError, SourceAdapter};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn source(adapter: &Arc<ScriptedAdapter>, config: ResilienceConfig, stats: &Arc<RunStats>) -> ResilientSource {
    let resilience = Resilience::new(
        "scripted",
        config,
        Arc::clone(stats),
        CancellationToken::new(),
    );
    let adapter: Arc<dyn SourceAdapter> = Arc::clone(adapter) as Arc<dyn SourceAdapter>;
    ResilientSource::new(adapter, resilience)
}

fn gaps(times: &[tokio::time::Instant]) -> Vec<Duration> {
    times.windows(2).map(|w| w[1] - w[0]).collect()
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_retry_exactly_max_retries_times() {
    let adapter = Arc::new(
        ScriptedAdapter::new("scripted", vec![])
            .then_always(Err(FetchError::transient("503 Service Unavailable"))),
    );
    let stats = Arc::new(RunStats::new());
    let config = ResilienceConfig {
        max_retries: 3,
        base_delay_ms: 500,
        max_delay_ms: 10_000,
        failure_threshold: 10,
        ..quick_resilience()
    };
    let source = source(&adapter, config, &stats);

    let err = source.fetch_page(None).await.unwrap_err();
    assert!(matches!(err, FetchError::Transient(_)));

    // One initial attempt plus three retries
    assert_eq!(adapter.call_count(), 4);
    assert_eq!(stats.snapshot().retries_issued, 3);

    let gaps = gaps(&adapter.call_times());
    assert_eq!(
        gaps,
        vec![
            Duration::from_millis(500),
            Duration::from_millis(1000),
            Duration::from_millis(2000)
        ]
    );
    assert!(gaps.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_blocks_calls_until_cooldown_then_probes_once() {
    let adapter = Arc::new(
        ScriptedAdapter::new("scripted", vec![])
            .then_always(Err(FetchError::transient("connection reset"))),
    );
    let stats = Arc::new(RunStats::new());
    let config = ResilienceConfig {
        max_retries: 5,
        failure_threshold: 2,
        cooldown_secs: 60,
        ..quick_resilience()
    };
    let source = source(&adapter, config, &stats);

    // Second consecutive failure opens the circuit
    let err = source.fetch_page(None).await.unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(adapter.call_count(), 2);
    assert!(matches!(
        source.resilience().circuit_state(),
        CircuitState::Open { .. }
    ));

    // No network call while open
    tokio::time::advance(Duration::from_secs(30)).await;
    let err = source.fetch_page(None).await.unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(adapter.call_count(), 2);

    // Cooldown elapsed: exactly one probe goes out, fails and reopens
    tokio::time::advance(Duration::from_secs(31)).await;
    let err = source.fetch_page(None).await.unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(adapter.call_count(), 3);
    assert_eq!(stats.snapshot().circuit_breaks, 2);
}

#[tokio::test(start_paused = true)]
async fn test_successful_probe_closes_circuit() {
    let adapter = Arc::new(ScriptedAdapter::new(
        "scripted",
        vec![
            Err(FetchError::transient("timeout")),
            page(vec![], None),
        ],
    ));
    let stats = Arc::new(RunStats::new());
    let config = ResilienceConfig {
        failure_threshold: 1,
        cooldown_secs: 10,
        ..quick_resilience()
    };
    let source = source(&adapter, config, &stats);

    assert!(source.fetch_page(None).await.unwrap_err().is_circuit_open());
    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(source.fetch_page(None).await.is_ok());
    assert_eq!(source.resilience().circuit_state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_waits_retry_after_and_does_not_consume_retries() {
    let adapter = Arc::new(ScriptedAdapter::new(
        "scripted",
        vec![
            Err(FetchError::RateLimited {
                retry_after: Some(Duration::from_secs(5)),
            }),
            page(vec![], None),
        ],
    ));
    let stats = Arc::new(RunStats::new());
    let config = ResilienceConfig {
        max_retries: 0,
        ..quick_resilience()
    };
    let source = source(&adapter, config, &stats);

    assert!(source.fetch_page(None).await.is_ok());

    let gaps = gaps(&adapter.call_times());
    assert_eq!(gaps.len(), 1);
    assert!(gaps[0] >= Duration::from_secs(5));

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.rate_limited, 1);
    assert_eq!(snapshot.retries_issued, 0);
    assert_eq!(source.resilience().circuit_state(), CircuitState::Closed);
}
