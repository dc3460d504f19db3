//! End-to-end runs of the load pipeline against small stand-in servers.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Response, Server};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use plow::aggregator::{Aggregator, Snapshot};
use plow::client;
use plow::config::{BodySource, Rate, RunConfig};
use plow::record::RecordPool;
use plow::worker::{self, WorkerContext};

fn config_for(url: &str) -> RunConfig {
    RunConfig {
        url: url.parse().unwrap(),
        method: hyper::Method::GET,
        headers: Vec::new(),
        body: BodySource::None,
        cert_path: None,
        key_path: None,
        insecure: false,
        concurrency: 1,
        requests: 0,
        duration: None,
        rate: Rate::Infinity,
        request_timeout: Some(Duration::from_secs(5)),
        dial_timeout: None,
        read_timeout: None,
        write_timeout: None,
        socks5: None,
        host_header: None,
        content_type: None,
    }
}

/// Mirrors the binary's wiring: client, bounded queue, worker pool and
/// aggregator, with the duration timer and an optional external cancel
/// arming the shared token.
async fn run_load(config: RunConfig, cancel_after: Option<Duration>) -> Snapshot {
    config.validate().unwrap();
    let start = Instant::now();
    let (http_client, counters) = client::build_client(&config).unwrap();
    let template = client::build_template(&config).unwrap();
    let aggregator = Arc::new(Aggregator::new(start));

    let cancel = CancellationToken::new();
    if let Some(d) = config.duration {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(d).await;
            cancel.cancel();
        });
    }
    if let Some(d) = cancel_after {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(d).await;
            cancel.cancel();
        });
    }

    let (tx, rx) = mpsc::channel(config.queue_capacity());
    let pool = RecordPool::new();
    let aggregator_task = tokio::spawn({
        let aggregator = aggregator.clone();
        let pool = pool.clone();
        async move { aggregator.run(rx, pool).await }
    });

    let ctx = WorkerContext {
        client: http_client,
        template,
        body: config.body.clone(),
        counters,
        cancel,
        limiter: worker::build_limiter(&config.rate),
        remaining: (config.requests > 0)
            .then(|| Arc::new(AtomicI64::new(config.requests as i64))),
        pool,
        start,
        request_timeout: config.request_timeout,
    };
    worker::run_pool(ctx, config.concurrency, tx).await;
    aggregator_task.await.unwrap();
    aggregator.snapshot()
}

fn assert_count_partition(snap: &Snapshot) {
    let codes: u64 = snap.codes.iter().map(|&(_, n)| n).sum();
    let errors: u64 = snap.errors.iter().map(|(_, n)| n).sum();
    assert_eq!(
        codes + errors,
        snap.count,
        "count must equal codes + errors: {:?}",
        snap
    );
}

/// A stand-in that alternates 200/400 responses deterministically.
fn alternating_server() -> SocketAddr {
    let counter = Arc::new(AtomicUsize::new(0));
    let make_svc = make_service_fn(move |_conn| {
        let counter = counter.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |_req| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    let status = if n % 2 == 0 { 200 } else { 400 };
                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(status)
                            .body(Body::from("ok"))
                            .unwrap(),
                    )
                }
            }))
        }
    });
    let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(async move {
        let _ = server.await;
    });
    addr
}

// Scenario: fixed count, single worker.
#[tokio::test]
async fn fixed_count_single_worker() {
    let server = MockServer::start().await;
    let body = "hello from the mock";
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let mut config = config_for(&server.uri());
    config.concurrency = 1;
    config.requests = 5;
    let snap = run_load(config, None).await;

    assert_eq!(snap.count, 5);
    assert_eq!(snap.codes, vec![("2xx", 5)]);
    assert!(snap.errors.is_empty());
    assert_eq!(snap.percentiles.len(), 7);
    for &(_, latency) in &snap.percentiles {
        assert!(latency > Duration::ZERO);
    }
    let hist_total: u64 = snap.histogram.iter().map(|b| b.count).sum();
    assert_eq!(hist_total, 5);
    assert!(
        snap.read_bytes >= 5 * body.len() as i64,
        "read {} bytes, body alone is {}",
        snap.read_bytes,
        5 * body.len()
    );
    assert_count_partition(&snap);
}

// Scenario: mixed codes across two workers.
#[tokio::test]
async fn mixed_codes_two_workers() {
    let addr = alternating_server();
    let mut config = config_for(&format!("http://{}/", addr));
    config.concurrency = 2;
    config.requests = 10;
    let snap = run_load(config, None).await;

    assert_eq!(snap.count, 10);
    assert_eq!(snap.codes, vec![("2xx", 5), ("4xx", 5)]);
    assert_count_partition(&snap);
}

// Scenario: duration cap with a rate limit.
#[tokio::test]
async fn duration_cap_with_rate_limit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = config_for(&server.uri());
    config.concurrency = 4;
    config.duration = Some(Duration::from_millis(500));
    config.rate = "20".parse().unwrap();
    let started = Instant::now();
    let snap = run_load(config, None).await;
    let took = started.elapsed();

    // 20 rps over 0.5 s plus the burst token and scheduling slack.
    assert!(snap.count >= 1);
    assert!(snap.count <= 15, "rate limit leaked: {} requests", snap.count);
    assert!(took < Duration::from_millis(900), "run overran: {:?}", took);
    for &(code, _) in &snap.codes {
        assert_eq!(code, "2xx");
    }
    assert_count_partition(&snap);
}

// Scenario: sub-second rate units parse to the right limit and hold.
#[tokio::test]
async fn rate_per_millisecond() {
    let rate: Rate = "10/ms".parse().unwrap();
    assert_eq!(rate.rps(), Some(10_000.0));

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let mut config = config_for(&server.uri());
    config.concurrency = 4;
    config.duration = Some(Duration::from_millis(200));
    config.rate = rate;
    let snap = run_load(config, None).await;
    assert!(
        snap.count <= 2_100,
        "rate limit leaked: {} requests in 200ms",
        snap.count
    );
}

// Scenario: external interruption of an unbounded run. The signal handler
// arms the same token this test cancels.
#[tokio::test]
async fn interrupt_unbounded_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = config_for(&server.uri());
    config.concurrency = 8;
    config.requests = 0;
    let snap = run_load(config, Some(Duration::from_millis(300))).await;

    // run_load only returns once every worker joined and the queue drained.
    assert!(snap.count > 0);
    assert_count_partition(&snap);
}

// Scenario: connection refused on every attempt.
#[tokio::test]
async fn transport_failure_counts_as_errors() {
    // Bind then drop a listener so the port is closed but was recently valid.
    let closed_addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let mut config = config_for(&format!("http://{}/", closed_addr));
    config.concurrency = 1;
    config.requests = 3;
    let snap = run_load(config, None).await;

    assert_eq!(snap.count, 3);
    assert!(snap.codes.is_empty());
    assert_eq!(snap.errors.len(), 1, "one distinct message: {:?}", snap.errors);
    assert_eq!(snap.errors[0].1, 3);
    assert_count_partition(&snap);
}

// With N > 0 the total attempts never exceed N even under high concurrency.
#[tokio::test]
async fn request_bound_never_exceeded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = config_for(&server.uri());
    config.concurrency = 8;
    config.requests = 40;
    let snap = run_load(config, None).await;
    assert_eq!(snap.count, 40);
    assert_eq!(snap.codes, vec![("2xx", 40)]);
}

// Streamed file bodies are opened per request; a missing file is recorded
// per attempt with zero elapsed, never fatal.
#[tokio::test]
async fn missing_stream_file_records_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = config_for(&server.uri());
    config.method = hyper::Method::POST;
    config.concurrency = 1;
    config.requests = 3;
    config.body = BodySource::File("/nonexistent/plow-body.bin".into());
    let snap = run_load(config, None).await;

    assert_eq!(snap.count, 3);
    assert!(snap.codes.is_empty());
    let errors: u64 = snap.errors.iter().map(|(_, n)| n).sum();
    assert_eq!(errors, 3);
    assert_eq!(snap.latency.max, Duration::ZERO);
}

// Streamed file bodies reach the server with their full content.
#[tokio::test]
async fn streamed_file_body_is_sent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("payload.txt");
    std::fs::write(&path, "streamed payload").unwrap();

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(wiremock::matchers::body_string("streamed payload"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = config_for(&server.uri());
    config.method = hyper::Method::POST;
    config.requests = 2;
    config.concurrency = 1;
    config.body = BodySource::File(path);
    let snap = run_load(config, None).await;

    assert_eq!(snap.codes, vec![("2xx", 2)]);
    assert!(snap.write_bytes >= 2 * "streamed payload".len() as i64);
}
