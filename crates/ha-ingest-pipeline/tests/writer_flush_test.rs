//! Batch writer flush and retry behavior against a mock store endpoint.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ha_ingest_core::config::TsdbConfig;
use ha_ingest_core::metrics::PipelineMetrics;
use ha_ingest_core::point::Point;
use ha_ingest_pipeline::tsdb::TsdbClient;
use ha_ingest_pipeline::writer::{BatchWriter, BatchWriterHandle};

fn tsdb_config(url: String, batch_size: usize, flush_interval: Duration) -> TsdbConfig {
    TsdbConfig {
        url,
        token: "secret".to_string(),
        org: "home".to_string(),
        bucket: "telemetry".to_string(),
        batch_size,
        flush_interval,
        write_timeout: Duration::from_secs(5),
        retry_buffer_batches: 100,
    }
}

struct WriterHarness {
    handle: BatchWriterHandle,
    task: tokio::task::JoinHandle<ha_ingest_core::error::IngestResult<()>>,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
}

fn start_writer(config: TsdbConfig) -> WriterHarness {
    let metrics = Arc::new(PipelineMetrics::new().unwrap());
    let shutdown = CancellationToken::new();
    let client = TsdbClient::new(&config).unwrap();
    let (writer, handle) =
        BatchWriter::channel(config, client, Arc::clone(&metrics), shutdown.clone());
    WriterHarness {
        handle,
        task: tokio::spawn(writer.run()),
        metrics,
        shutdown,
    }
}

fn point(n: i64) -> Point {
    let ts = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(n);
    Point::new("entity_state", ts)
        .tag("entity_id", "light.kitchen")
        .field("seq", n)
}

async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn size_trigger_flushes_a_full_batch_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/write"))
        .and(query_param("org", "home"))
        .and(query_param("bucket", "telemetry"))
        .and(query_param("precision", "ns"))
        .and(header("Authorization", "Token secret"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let harness = start_writer(tsdb_config(server.uri(), 2, Duration::from_secs(60)));
    harness.handle.enqueue(point(0)).await.unwrap();
    harness.handle.enqueue(point(1)).await.unwrap();

    let m = Arc::clone(&harness.metrics);
    assert!(wait_until(Duration::from_secs(5), || m.writer.batches_flushed.get() == 1).await);
    assert_eq!(harness.metrics.writer.points_written.get(), 2);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body = String::from_utf8(requests[0].body.clone()).unwrap();
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("seq=0i"));
    assert!(lines[1].contains("seq=1i"));

    harness.shutdown.cancel();
    drop(harness.handle);
    let _ = tokio::time::timeout(Duration::from_secs(5), harness.task).await;
}

#[tokio::test]
async fn age_trigger_flushes_a_partial_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let harness = start_writer(tsdb_config(server.uri(), 1000, Duration::from_millis(150)));
    harness.handle.enqueue(point(0)).await.unwrap();

    let m = Arc::clone(&harness.metrics);
    assert!(wait_until(Duration::from_secs(5), || m.writer.batches_flushed.get() == 1).await);
    assert_eq!(harness.metrics.writer.points_written.get(), 1);

    harness.shutdown.cancel();
    drop(harness.handle);
    let _ = tokio::time::timeout(Duration::from_secs(5), harness.task).await;
}

#[tokio::test]
async fn schema_rejection_dead_letters_the_batch_and_the_next_succeeds() {
    let server = MockServer::start().await;
    // First write is rejected as malformed; everything after succeeds.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(422).set_body_string("field type conflict"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let harness = start_writer(tsdb_config(server.uri(), 3, Duration::from_secs(60)));
    for n in 0..3 {
        harness.handle.enqueue(point(n)).await.unwrap();
    }
    let m = Arc::clone(&harness.metrics);
    assert!(
        wait_until(Duration::from_secs(5), || {
            m.writer
                .points_dead_lettered
                .with_label_values(&["tsdb:schema"])
                .get()
                == 3
        })
        .await
    );

    // The pipeline keeps going: the very next batch lands.
    for n in 3..6 {
        harness.handle.enqueue(point(n)).await.unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || m.writer.points_written.get() == 3).await);
    assert_eq!(harness.metrics.writer.batches_flushed.get(), 1);

    harness.shutdown.cancel();
    drop(harness.handle);
    let result = tokio::time::timeout(Duration::from_secs(5), harness.task)
        .await
        .expect("writer stopped")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn transient_failure_is_retried_until_it_lands() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let harness = start_writer(tsdb_config(server.uri(), 2, Duration::from_secs(60)));
    harness.handle.enqueue(point(0)).await.unwrap();
    harness.handle.enqueue(point(1)).await.unwrap();

    let m = Arc::clone(&harness.metrics);
    assert!(wait_until(Duration::from_secs(10), || m.writer.points_written.get() == 2).await);
    assert!(harness.metrics.writer.batches_retried.get() >= 1);
    // Nothing was lost to the dead-letter counters.
    assert_eq!(
        harness
            .metrics
            .writer
            .points_dead_lettered
            .with_label_values(&["tsdb:write"])
            .get(),
        0
    );

    harness.shutdown.cancel();
    drop(harness.handle);
    let _ = tokio::time::timeout(Duration::from_secs(5), harness.task).await;
}

#[tokio::test]
async fn closing_intake_forces_a_final_flush() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let harness = start_writer(tsdb_config(server.uri(), 1000, Duration::from_secs(60)));
    for n in 0..500 {
        harness.handle.enqueue(point(n)).await.unwrap();
    }
    drop(harness.handle);

    let result = tokio::time::timeout(Duration::from_secs(5), harness.task)
        .await
        .expect("writer stopped")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(harness.metrics.writer.points_written.get(), 500);

    let requests = server.received_requests().await.unwrap();
    let total_lines: usize = requests
        .iter()
        .map(|r| String::from_utf8(r.body.clone()).unwrap().lines().count())
        .sum();
    assert_eq!(total_lines, 500);
}

#[tokio::test]
async fn repeated_credential_rejection_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .mount(&server)
        .await;

    let harness = start_writer(tsdb_config(server.uri(), 1, Duration::from_secs(60)));
    for n in 0..3 {
        harness.handle.enqueue(point(n)).await.unwrap();
    }

    let result = tokio::time::timeout(Duration::from_secs(10), harness.task)
        .await
        .expect("writer gave up")
        .unwrap();
    assert!(result.is_err());
    assert_eq!(
        harness
            .metrics
            .writer
            .points_dead_lettered
            .with_label_values(&["tsdb:auth"])
            .get(),
        3
    );
}
