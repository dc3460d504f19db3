//! The single consumer of completed-request records.
//!
//! Workers push records into a bounded queue; the aggregator drains it,
//! feeding every record into the quantile sketch, the streaming histogram,
//! the overall latency accumulator and the rolling one-second window. All
//! state sits behind one mutex, held only for O(1) updates or
//! O(quantiles + bins) snapshot copies; the printer and the chart server
//! read through [`Aggregator::snapshot`] and [`Aggregator::charts`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::histogram::{Bin, StreamingHistogram};
use crate::quantile::QuantileSketch;
use crate::record::{Record, RecordPool};
use crate::stats::{DurationStats, FloatStats, RunningStats};

struct State {
    count: u64,
    codes: HashMap<&'static str, u64>,
    errors: HashMap<String, u64>,
    latency: RunningStats,
    rps: RunningStats,
    sketch: QuantileSketch,
    histogram: StreamingHistogram,
    read_bytes: i64,
    write_bytes: i64,
    // Rolling one-second window.
    within_sec: RunningStats,
    last_within: RunningStats,
    last_rps: f64,
    no_data_within_sec: bool,
    prev_count: u64,
    prev_tick: Instant,
}

/// Streaming statistics engine for one run.
pub struct Aggregator {
    start: Instant,
    state: Mutex<State>,
    done: CancellationToken,
}

impl Aggregator {
    pub fn new(start: Instant) -> Self {
        Self {
            start,
            state: Mutex::new(State {
                count: 0,
                codes: HashMap::new(),
                errors: HashMap::new(),
                latency: RunningStats::new(),
                rps: RunningStats::new(),
                sketch: QuantileSketch::targeted(),
                histogram: StreamingHistogram::new(),
                read_bytes: 0,
                write_bytes: 0,
                within_sec: RunningStats::new(),
                last_within: RunningStats::new(),
                last_rps: 0.0,
                no_data_within_sec: true,
                prev_count: 0,
                prev_tick: start,
            }),
            done: CancellationToken::new(),
        }
    }

    /// Resolved once the record queue has been drained after close.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Consumes the record queue until it closes, rolling the one-second
    /// window in between. Records go back to the pool after ingestion.
    pub async fn run(&self, mut rx: mpsc::Receiver<Box<Record>>, pool: RecordPool) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + Duration::from_secs(1),
            Duration::from_secs(1),
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(record) => {
                        self.ingest(&record);
                        pool.put(record);
                    }
                    None => break,
                },
                _ = ticker.tick() => self.roll_second(),
            }
        }
        debug!("record queue closed, aggregator draining done");
        self.done.cancel();
    }

    /// Folds one completed request into every estimator.
    pub fn ingest(&self, record: &Record) {
        let mut s = self.state.lock().unwrap();
        s.count += 1;
        let secs = record.elapsed.as_secs_f64();
        s.latency.update(secs);
        s.within_sec.update(secs);
        s.sketch.insert(secs);
        s.histogram.insert(secs);
        if !record.code.is_empty() {
            *s.codes.entry(record.code).or_insert(0) += 1;
        }
        if !record.error.is_empty() {
            *s.errors.entry(record.error.clone()).or_insert(0) += 1;
        }
        s.read_bytes = record.read_bytes;
        s.write_bytes = record.write_bytes;
    }

    /// One-second tick: turns the count delta into an RPS sample and
    /// publishes the within-second view. Idle ticks record nothing so the
    /// RPS mean is not biased toward zero.
    pub fn roll_second(&self) {
        let mut s = self.state.lock().unwrap();
        let now = Instant::now();
        let dt = now.duration_since(s.prev_tick).as_secs_f64();
        let dc = s.count - s.prev_count;
        s.prev_tick = now;
        s.prev_count = s.count;
        if dc > 0 && dt > 0.0 {
            let rps = dc as f64 / dt;
            s.rps.update(rps);
            s.last_rps = rps;
            s.last_within = s.within_sec;
            s.within_sec.reset();
            s.no_data_within_sec = false;
        } else {
            s.no_data_within_sec = true;
        }
    }

    /// Deep copy of the full state for the printer.
    pub fn snapshot(&self) -> Snapshot {
        let mut s = self.state.lock().unwrap();
        let elapsed = self.start.elapsed();
        let elapsed_secs = elapsed.as_secs_f64().max(f64::EPSILON);

        let mut codes: Vec<(&'static str, u64)> = s.codes.iter().map(|(&k, &v)| (k, v)).collect();
        codes.sort_by_key(|&(k, _)| k);
        let mut errors: Vec<(String, u64)> =
            s.errors.iter().map(|(k, &v)| (k.clone(), v)).collect();
        errors.sort_by(|a, b| a.0.cmp(&b.0));

        let percentiles = s
            .sketch
            .results()
            .into_iter()
            .map(|(q, v)| (q, Duration::from_secs_f64(v.max(0.0))))
            .collect();

        Snapshot {
            elapsed,
            count: s.count,
            codes,
            errors,
            rps: s.count as f64 / elapsed_secs,
            read_throughput: s.read_bytes as f64 / elapsed_secs / (1024.0 * 1024.0),
            write_throughput: s.write_bytes as f64 / elapsed_secs / (1024.0 * 1024.0),
            read_bytes: s.read_bytes,
            write_bytes: s.write_bytes,
            latency: DurationStats::from_secs_stats(&s.latency),
            rps_stats: if s.rps.count() > 0 {
                Some(FloatStats::from_stats(&s.rps))
            } else {
                None
            },
            percentiles,
            histogram: s.histogram.bins().to_vec(),
        }
    }

    /// Rolling-window view for the chart server; `None` when the last
    /// second saw no samples.
    pub fn charts(&self) -> Option<ChartsData> {
        let s = self.state.lock().unwrap();
        if s.no_data_within_sec {
            return None;
        }
        Some(ChartsData {
            rps: s.last_rps,
            latency: DurationStats::from_secs_stats(&s.last_within),
        })
    }
}

/// Deep-copied aggregator view for the printer.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub elapsed: Duration,
    pub count: u64,
    /// (status class, count), ascending by class.
    pub codes: Vec<(&'static str, u64)>,
    /// (error message, count), ascending by message.
    pub errors: Vec<(String, u64)>,
    /// Overall requests per second: count / elapsed.
    pub rps: f64,
    /// MB/s read and written, 1024^2 bytes per MB.
    pub read_throughput: f64,
    pub write_throughput: f64,
    pub read_bytes: i64,
    pub write_bytes: i64,
    pub latency: DurationStats,
    /// Absent until the first per-second sample lands.
    pub rps_stats: Option<FloatStats>,
    /// The seven (quantile, latency) targets in ascending quantile order.
    pub percentiles: Vec<(f64, Duration)>,
    /// Histogram bins, ascending by mean; means are in seconds.
    pub histogram: Vec<Bin>,
}

/// Per-second view consumed by the chart server.
#[derive(Debug, Clone, Copy)]
pub struct ChartsData {
    pub rps: f64,
    pub latency: DurationStats,
}
