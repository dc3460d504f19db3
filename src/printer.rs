//! Periodic terminal reporting.
//!
//! Consumes aggregator snapshots on a configurable tick and renders either a
//! human tabular block or one JSON object per line. In tabular mode each
//! tick erases the previous block before drawing the new one; the final
//! block is always printed clean, without progress bars. Everything here
//! writes to stdout only; banners and logs go to stderr elsewhere.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{Aggregator, Snapshot};

const BAR_WIDTH: usize = 40;
const PROGRESS_WIDTH: usize = 48;

/// Report rendering options, straight off the CLI.
#[derive(Debug, Clone)]
pub struct PrinterConfig {
    /// Tick period; zero means "print only once at the end".
    pub interval: Duration,
    /// Single-line JSON per tick instead of the tabular block.
    pub json: bool,
    /// Render all durations as seconds.
    pub seconds: bool,
    /// Omit the histogram bars on the final block.
    pub clean: bool,
    /// Suppress per-tick output, keep only the final block.
    pub summary_only: bool,
    /// Request bound N, for the progress bar (0 = unbounded).
    pub requests: u64,
    /// Duration bound D, for the progress bar.
    pub duration: Option<Duration>,
}

pub struct Printer {
    config: PrinterConfig,
    erase_lines: usize,
}

impl Printer {
    pub fn new(config: PrinterConfig) -> Self {
        Self {
            config,
            erase_lines: 0,
        }
    }

    /// Prints until the aggregator signals done, then renders the final
    /// block.
    pub async fn run(mut self, aggregator: Arc<Aggregator>, done: CancellationToken) {
        if !self.config.interval.is_zero() && !self.config.summary_only {
            let mut ticker = tokio::time::interval(self.config.interval);
            loop {
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = ticker.tick() => {
                        let snap = aggregator.snapshot();
                        self.print(&snap, false);
                    }
                }
            }
        } else {
            done.cancelled().await;
        }
        let snap = aggregator.snapshot();
        self.print(&snap, true);
    }

    fn print(&mut self, snap: &Snapshot, last: bool) {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        if self.config.json {
            let _ = writeln!(out, "{}", self.render_json(snap));
            return;
        }
        let block = self.render_block(snap, last);
        if self.erase_lines > 0 {
            // Cursor up over the previous block, then clear to the end of
            // the screen before redrawing.
            let _ = write!(out, "\x1b[{}A\x1b[J", self.erase_lines);
        }
        let _ = write!(out, "{}", block);
        let _ = out.flush();
        self.erase_lines = block.lines().count();
    }

    fn fmt_duration(&self, d: Duration) -> String {
        if self.config.seconds {
            return format!("{:.3}s", d.as_secs_f64());
        }
        let secs = d.as_secs_f64();
        if secs >= 1.0 {
            format!("{:.2}s", secs)
        } else if secs >= 1e-3 {
            format!("{:.2}ms", secs * 1e3)
        } else if secs >= 1e-6 {
            format!("{:.2}us", secs * 1e6)
        } else {
            format!("{}ns", d.as_nanos())
        }
    }

    fn render_block(&self, snap: &Snapshot, last: bool) -> String {
        let mut b = String::new();

        if !last {
            if let Some(bar) = self.progress_bar(snap) {
                b.push_str(&bar);
                b.push('\n');
            }
        }

        b.push_str("Summary:\n");
        b.push_str(&format!(
            "  Elapsed  {:>9}\n",
            self.fmt_duration(snap.elapsed)
        ));
        b.push_str(&format!("  Count    {:>9}\n", snap.count));
        for &(code, n) in &snap.codes {
            b.push_str(&format!("    {}    {:>9}\n", code, n));
        }
        b.push_str(&format!("  RPS      {:>9.3}\n", snap.rps));
        b.push_str(&format!("  Reads    {:>7.3}MB/s\n", snap.read_throughput));
        b.push_str(&format!("  Writes   {:>7.3}MB/s\n", snap.write_throughput));

        if !snap.errors.is_empty() {
            b.push_str("\nError:\n");
            for (message, n) in &snap.errors {
                b.push_str(&format!("  {:>6}   \"{}\"\n", n, message));
            }
        }

        b.push_str(&format!(
            "\n{:<10}{:>10}{:>10}{:>10}{:>10}\n",
            "Statistics", "Min", "Mean", "StdDev", "Max"
        ));
        b.push_str(&format!(
            "  {:<8}{:>10}{:>10}{:>10}{:>10}\n",
            "Latency",
            self.fmt_duration(snap.latency.min),
            self.fmt_duration(snap.latency.mean),
            self.fmt_duration(snap.latency.stddev),
            self.fmt_duration(snap.latency.max),
        ));
        if let Some(rps) = &snap.rps_stats {
            b.push_str(&format!(
                "  {:<8}{:>10.2}{:>10.2}{:>10.2}{:>10.2}\n",
                "RPS", rps.min, rps.mean, rps.stddev, rps.max
            ));
        }

        b.push_str("\nLatency Percentile:\n");
        let mut header = String::from(" ");
        let mut values = String::from(" ");
        for &(q, v) in &snap.percentiles {
            header.push_str(&format!(" {:>9}", percentile_label(q)));
            values.push_str(&format!(" {:>9}", self.fmt_duration(v)));
        }
        b.push_str(&header);
        b.push('\n');
        b.push_str(&values);
        b.push('\n');

        if !snap.histogram.is_empty() {
            b.push_str("\nLatency Histogram:\n");
            let max_count = snap
                .histogram
                .iter()
                .map(|bin| bin.count)
                .max()
                .unwrap_or(1)
                .max(1);
            let total: u64 = snap.histogram.iter().map(|bin| bin.count).sum();
            for bin in &snap.histogram {
                let share = bin.count as f64 / total.max(1) as f64 * 100.0;
                b.push_str(&format!(
                    "  {:>9}  {:>8}  {:>6.2}%",
                    self.fmt_duration(Duration::from_secs_f64(bin.mean.max(0.0))),
                    bin.count,
                    share
                ));
                if !(last && self.config.clean) {
                    let width =
                        (bin.count as f64 / max_count as f64 * BAR_WIDTH as f64).round() as usize;
                    b.push_str("  ");
                    b.push_str(&"■".repeat(width));
                }
                b.push('\n');
            }
        }
        b
    }

    // Fraction complete against whichever bound is configured; with both,
    // the sooner bound shows the larger fraction and wins.
    fn progress_bar(&self, snap: &Snapshot) -> Option<String> {
        let mut fraction: Option<f64> = None;
        if self.config.requests > 0 {
            fraction = Some(snap.count as f64 / self.config.requests as f64);
        }
        if let Some(d) = self.config.duration {
            let f = snap.elapsed.as_secs_f64() / d.as_secs_f64();
            fraction = Some(fraction.map_or(f, |prev: f64| prev.max(f)));
        }
        let fraction = fraction?.clamp(0.0, 1.0);
        let filled = (fraction * PROGRESS_WIDTH as f64).round() as usize;
        Some(format!(
            "[{}{}] {:>6.2}%",
            "█".repeat(filled),
            "░".repeat(PROGRESS_WIDTH - filled),
            fraction * 100.0
        ))
    }

    fn render_json(&self, snap: &Snapshot) -> String {
        let codes: serde_json::Map<String, serde_json::Value> = snap
            .codes
            .iter()
            .map(|&(k, v)| (k.to_string(), v.into()))
            .collect();
        let errors: serde_json::Map<String, serde_json::Value> = snap
            .errors
            .iter()
            .map(|(k, v)| (k.clone(), (*v).into()))
            .collect();
        let percentiles: serde_json::Map<String, serde_json::Value> = snap
            .percentiles
            .iter()
            .map(|&(q, v)| (percentile_label(q), self.fmt_duration(v).into()))
            .collect();
        let histogram: Vec<serde_json::Value> = snap
            .histogram
            .iter()
            .map(|bin| {
                json!({
                    "Latency": self.fmt_duration(Duration::from_secs_f64(bin.mean.max(0.0))),
                    "Count": bin.count,
                })
            })
            .collect();
        let mut report = json!({
            "Summary": {
                "Elapsed": self.fmt_duration(snap.elapsed),
                "Count": snap.count,
                "RPS": snap.rps,
                "Reads": format!("{:.3}MB/s", snap.read_throughput),
                "Writes": format!("{:.3}MB/s", snap.write_throughput),
            },
            "Codes": codes,
            "Errors": errors,
            "Latency": {
                "Min": self.fmt_duration(snap.latency.min),
                "Mean": self.fmt_duration(snap.latency.mean),
                "StdDev": self.fmt_duration(snap.latency.stddev),
                "Max": self.fmt_duration(snap.latency.max),
            },
            "Percentiles": percentiles,
            "Histogram": histogram,
        });
        if let Some(rps) = &snap.rps_stats {
            report["RPSStats"] = json!({
                "Min": rps.min,
                "Mean": rps.mean,
                "StdDev": rps.stddev,
                "Max": rps.max,
            });
        }
        report.to_string()
    }
}

fn percentile_label(q: f64) -> String {
    // 0.999 -> "P99.9", trimming the trailing zeros the float drags in.
    let mut label = format!("{}", q * 100.0);
    while label.ends_with('0') && label.contains('.') {
        label.pop();
    }
    if label.ends_with('.') {
        label.pop();
    }
    format!("P{}", label)
}
