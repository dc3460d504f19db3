//! The request-issuing worker pool.
//!
//! Spawns C workers over the shared client and request template. Each worker
//! runs one request at a time: wait for a rate-limiter token, claim a slot
//! from the request counter, issue with the per-request timeout, classify
//! and drain the response, then hand the completed record to the aggregator
//! through the bounded queue. The whole pool is governed by one cancellation
//! token armed by the signal handler, the duration timer, counter
//! exhaustion, or queue closure.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::{Quota, RateLimiter};
use hyper::body::HttpBody;
use hyper::{Body, Request};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{HttpClient, RequestTemplate};
use crate::config::{BodySource, Rate};
use crate::record::{Record, RecordPool};
use crate::transport::ByteCounters;

/// Direct (un-keyed) limiter shared by every worker.
pub type Limiter = governor::DefaultDirectRateLimiter;

/// Builds the run's rate limiter: R tokens per second, burst of one.
/// `None` when the rate is unbounded.
pub fn build_limiter(rate: &Rate) -> Option<Arc<Limiter>> {
    let rps = rate.rps()?;
    if rps <= 0.0 {
        return None;
    }
    let period = Duration::from_secs_f64(1.0 / rps);
    let quota = Quota::with_period(period)?.allow_burst(NonZeroU32::new(1).unwrap());
    Some(Arc::new(RateLimiter::direct(quota)))
}

/// Everything a worker shares with its siblings.
#[derive(Clone)]
pub struct WorkerContext {
    pub client: HttpClient,
    pub template: RequestTemplate,
    pub body: BodySource,
    pub counters: ByteCounters,
    pub cancel: CancellationToken,
    pub limiter: Option<Arc<Limiter>>,
    /// Remaining request slots; `None` when the run is unbounded.
    pub remaining: Option<Arc<AtomicI64>>,
    pub pool: RecordPool,
    pub start: Instant,
    pub request_timeout: Option<Duration>,
}

/// Spawns `concurrency` workers and waits for all of them to exit. The
/// record queue closes when the last worker drops its sender.
pub async fn run_pool(
    ctx: WorkerContext,
    concurrency: u64,
    tx: mpsc::Sender<Box<Record>>,
) {
    let mut handles = Vec::with_capacity(concurrency as usize);
    for task_id in 0..concurrency {
        let ctx = ctx.clone();
        let tx = tx.clone();
        handles.push(tokio::spawn(run_worker(task_id, ctx, tx)));
    }
    drop(tx);
    for handle in handles {
        if let Err(e) = handle.await {
            if e.is_panic() {
                std::panic::resume_unwind(e.into_panic());
            }
        }
    }
}

/// One worker: sequential requests until the run terminates.
pub async fn run_worker(task_id: u64, ctx: WorkerContext, tx: mpsc::Sender<Box<Record>>) {
    debug!(task_id, "worker starting");
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        if let Some(limiter) = &ctx.limiter {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                _ = limiter.until_ready() => {}
            }
        }
        if let Some(remaining) = &ctx.remaining {
            // fetch_sub returns the previous value; anything at or below
            // zero means another worker already claimed the last slot.
            if remaining.fetch_sub(1, Ordering::SeqCst) <= 0 {
                ctx.cancel.cancel();
                break;
            }
        }

        let mut record = ctx.pool.get();
        let body = match prepare_body(&ctx.body).await {
            Ok(body) => body,
            Err(message) => {
                // The request never went out: elapsed stays zero.
                record.error = message;
                record.read_bytes = ctx.counters.read_total();
                record.write_bytes = ctx.counters.written_total();
                if tx.send(record).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let t1 = ctx.start.elapsed();
        let outcome = issue(&ctx, body).await;
        record.elapsed = ctx.start.elapsed().saturating_sub(t1);
        match outcome {
            Ok(code) => record.code = code,
            Err(message) => record.error = message,
        }
        record.read_bytes = ctx.counters.read_total();
        record.write_bytes = ctx.counters.written_total();

        // A send on a closed queue is the normal shutdown signal, not a
        // failure; anything else propagates.
        if tx.send(record).await.is_err() {
            break;
        }
    }
    debug!(task_id, "worker exiting");
}

/// Issues one request and fully drains the response so the byte counters
/// reflect the whole payload. The per-request timeout caps the entire
/// issue+drain cycle.
async fn issue(ctx: &WorkerContext, body: Body) -> Result<&'static str, String> {
    let mut request = Request::new(body);
    *request.method_mut() = ctx.template.method.clone();
    *request.uri_mut() = ctx.template.uri.clone();
    *request.headers_mut() = ctx.template.headers.clone();

    let cycle = async {
        let response = ctx
            .client
            .request(request)
            .await
            .map_err(|e| e.to_string())?;
        let code = status_class(response.status().as_u16())?;
        drain(response.into_body()).await?;
        Ok(code)
    };
    match ctx.request_timeout {
        Some(t) => tokio::time::timeout(t, cycle)
            .await
            .unwrap_or_else(|_| Err("request timed out".to_string())),
        None => cycle.await,
    }
}

/// Streams the body to nothing, chunk by chunk, without buffering it.
async fn drain(mut body: Body) -> Result<(), String> {
    while let Some(chunk) = body.data().await {
        chunk.map_err(|e| e.to_string())?;
    }
    Ok(())
}

async fn prepare_body(source: &BodySource) -> Result<Body, String> {
    match source {
        BodySource::None => Ok(Body::empty()),
        BodySource::Bytes(bytes) => Ok(Body::from(bytes.clone())),
        BodySource::File(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|e| format!("open {}: {}", path.display(), e))?;
            Ok(Body::wrap_stream(ReaderStream::new(file)))
        }
    }
}

/// Maps a status code to its class by integer division; codes outside
/// 1xx..5xx are rejected with a synthesized error message.
fn status_class(code: u16) -> Result<&'static str, String> {
    match code / 100 {
        1 => Ok("1xx"),
        2 => Ok("2xx"),
        3 => Ok("3xx"),
        4 => Ok("4xx"),
        5 => Ok("5xx"),
        _ => Err(format!("unexpected status code {}", code)),
    }
}
