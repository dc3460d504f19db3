//! Targeted-quantile estimation over the latency stream.
//!
//! Implements the Cormode-Korn-Muthukrishnan-Srivastava sketch for a fixed
//! set of (quantile, epsilon) targets. Memory stays bounded regardless of how
//! many samples are inserted: samples are buffered, merged into a compressed
//! summary, and neighbouring summary entries are collapsed whenever the error
//! invariant allows it. `query(q)` returns a value whose rank is within
//! epsilon * count of q * count for each configured target.

/// The seven latency quantiles reported by the aggregator, with their
/// per-quantile error targets.
pub const TARGETS: [(f64, f64); 7] = [
    (0.50, 0.01),
    (0.75, 0.01),
    (0.90, 0.001),
    (0.95, 0.001),
    (0.99, 0.001),
    (0.999, 0.0001),
    (0.9999, 0.00001),
];

// Inserts are batched before being merged into the summary. 500 matches the
// chunk size the CKMS authors evaluated; larger buffers trade accuracy
// windows for fewer merge passes.
const BUFFER_CAP: usize = 500;

#[derive(Debug, Clone, Copy)]
struct Sample {
    value: f64,
    // Number of raw observations this summary entry covers.
    width: f64,
    // Allowed rank uncertainty inherited at insertion time.
    delta: f64,
}

/// Bounded-memory quantile summary with per-target error guarantees.
#[derive(Debug, Clone)]
pub struct QuantileSketch {
    targets: Vec<(f64, f64)>,
    samples: Vec<Sample>,
    buffer: Vec<f64>,
    n: f64,
}

impl QuantileSketch {
    /// A sketch tuned for the reported latency targets.
    pub fn targeted() -> Self {
        Self::with_targets(&TARGETS)
    }

    pub fn with_targets(targets: &[(f64, f64)]) -> Self {
        Self {
            targets: targets.to_vec(),
            samples: Vec::new(),
            buffer: Vec::with_capacity(BUFFER_CAP),
            n: 0.0,
        }
    }

    /// Total number of samples inserted so far.
    pub fn count(&self) -> u64 {
        (self.n + self.buffer.len() as f64) as u64
    }

    /// Insert one observation.
    pub fn insert(&mut self, v: f64) {
        self.buffer.push(v);
        if self.buffer.len() >= BUFFER_CAP {
            self.flush();
        }
    }

    /// Value at quantile `q`. Returns 0 when the sketch is empty.
    pub fn query(&mut self, q: f64) -> f64 {
        self.flush();
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut t = (q * self.n).ceil();
        t += (self.invariant(t) / 2.0).ceil();

        let mut prev = self.samples[0];
        let mut r = 0.0;
        for &cur in &self.samples[1..] {
            r += prev.width;
            if r + cur.width + cur.delta > t {
                return prev.value;
            }
            prev = cur;
        }
        prev.value
    }

    /// The (quantile, value) pairs for every configured target, in ascending
    /// quantile order.
    pub fn results(&mut self) -> Vec<(f64, f64)> {
        let mut qs: Vec<f64> = self.targets.iter().map(|&(q, _)| q).collect();
        qs.sort_by(|a, b| a.partial_cmp(b).unwrap());
        qs.into_iter().map(|q| (q, self.query(q))).collect()
    }

    /// Number of retained summary entries. Exposed for memory-bound checks.
    pub fn summary_len(&self) -> usize {
        self.samples.len()
    }

    // Error invariant f(r, n): the widest rank slack any target tolerates at
    // rank r. Entries may absorb neighbours as long as their combined width
    // stays under it.
    fn invariant(&self, r: f64) -> f64 {
        let mut m = f64::MAX;
        for &(q, eps) in &self.targets {
            let f = if q * self.n <= r {
                2.0 * eps * r / q
            } else {
                2.0 * eps * (self.n - r) / (1.0 - q)
            };
            if f < m {
                m = f;
            }
        }
        m
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let mut batch = std::mem::take(&mut self.buffer);
        batch.sort_by(|a, b| a.partial_cmp(b).unwrap());
        self.merge(&batch);
        self.compress();
    }

    fn merge(&mut self, batch: &[f64]) {
        let mut r = 0.0;
        let mut i = 0;
        for &v in batch {
            while i < self.samples.len() && self.samples[i].value <= v {
                r += self.samples[i].width;
                i += 1;
            }
            let delta = if i == 0 || i == self.samples.len() {
                // New minimum or maximum: its rank is exact.
                0.0
            } else {
                (self.invariant(r).floor() - 1.0).max(0.0)
            };
            self.samples.insert(
                i,
                Sample {
                    value: v,
                    width: 1.0,
                    delta,
                },
            );
            self.n += 1.0;
            i += 1;
        }
    }

    fn compress(&mut self) {
        if self.samples.len() < 3 {
            return;
        }
        // Walk backwards merging each entry into its right neighbour while
        // the invariant holds. The last entry is never absorbed so the
        // maximum stays exact.
        let mut i = self.samples.len() - 2;
        let mut r: f64 = self.samples[..i].iter().map(|s| s.width).sum();
        while i > 0 {
            let cur = self.samples[i];
            let next = self.samples[i + 1];
            if cur.width + next.width + next.delta <= self.invariant(r) {
                self.samples[i + 1].width += cur.width;
                self.samples.remove(i);
            }
            i -= 1;
            r -= self.samples[i].width;
        }
    }
}
