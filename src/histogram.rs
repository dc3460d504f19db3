//! Fixed-bin-count adaptive latency histogram.
//!
//! An online histogram in the Ben-Haim/Tom-Tov style: every insert either
//! lands on an existing bin center or opens a new bin, and when the bin
//! count exceeds the cap the two bins with the closest centers are merged
//! into their weighted mean. Bins are kept sorted by center so reports come
//! out in ascending order for free.

/// Number of bins retained; merges keep the histogram at or under this.
pub const MAX_BINS: usize = 8;

/// One histogram bin: the weighted center of its samples and how many it
/// absorbed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bin {
    pub mean: f64,
    pub count: u64,
}

/// Streaming histogram over non-negative latency samples.
#[derive(Debug, Clone, Default)]
pub struct StreamingHistogram {
    bins: Vec<Bin>,
    total: u64,
}

impl StreamingHistogram {
    pub fn new() -> Self {
        Self {
            bins: Vec::with_capacity(MAX_BINS + 1),
            total: 0,
        }
    }

    /// Insert one sample, merging the closest pair if the bin cap is hit.
    pub fn insert(&mut self, v: f64) {
        self.total += 1;
        match self
            .bins
            .binary_search_by(|b| b.mean.partial_cmp(&v).unwrap())
        {
            Ok(i) => {
                self.bins[i].count += 1;
                return;
            }
            Err(i) => self.bins.insert(i, Bin { mean: v, count: 1 }),
        }
        while self.bins.len() > MAX_BINS {
            self.merge_closest();
        }
    }

    /// Bins in ascending center order.
    pub fn bins(&self) -> &[Bin] {
        &self.bins
    }

    /// Total number of inserted samples across all bins.
    pub fn total(&self) -> u64 {
        self.total
    }

    fn merge_closest(&mut self) {
        let mut best = 0;
        let mut best_gap = f64::INFINITY;
        for i in 0..self.bins.len() - 1 {
            let gap = self.bins[i + 1].mean - self.bins[i].mean;
            if gap < best_gap {
                best_gap = gap;
                best = i;
            }
        }
        let a = self.bins[best];
        let b = self.bins[best + 1];
        let count = a.count + b.count;
        self.bins[best] = Bin {
            mean: (a.mean * a.count as f64 + b.mean * b.count as f64) / count as f64,
            count,
        };
        self.bins.remove(best + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        let h = StreamingHistogram::new();
        assert!(h.bins().is_empty());
        assert_eq!(h.total(), 0);
    }

    #[test]
    fn test_constant_stream_collapses_to_one_bin() {
        let mut h = StreamingHistogram::new();
        for _ in 0..1000 {
            h.insert(2.5);
        }
        assert_eq!(h.bins().len(), 1);
        assert_eq!(h.bins()[0].mean, 2.5);
        assert_eq!(h.bins()[0].count, 1000);
    }

    #[test]
    fn test_bin_cap_enforced() {
        let mut h = StreamingHistogram::new();
        for i in 0..10_000 {
            h.insert((i % 97) as f64);
        }
        assert!(h.bins().len() <= MAX_BINS);
    }

    #[test]
    fn test_counts_conserved_across_merges() {
        let mut h = StreamingHistogram::new();
        for i in 0..5_000u64 {
            h.insert((i * 7 % 1000) as f64 / 10.0);
        }
        let sum: u64 = h.bins().iter().map(|b| b.count).sum();
        assert_eq!(sum, 5_000);
        assert_eq!(h.total(), 5_000);
    }

    #[test]
    fn test_bins_sorted_ascending() {
        let mut h = StreamingHistogram::new();
        for v in [9.0, 1.0, 5.0, 3.0, 7.0, 2.0, 8.0, 4.0, 6.0, 0.5, 9.5] {
            h.insert(v);
        }
        let bins = h.bins();
        for w in bins.windows(2) {
            assert!(w[0].mean < w[1].mean);
        }
    }

    #[test]
    fn test_merge_produces_weighted_mean() {
        let mut h = StreamingHistogram::new();
        // Fill all eight bins, then force a merge between the closest pair.
        for v in [0.0, 10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0] {
            h.insert(v);
        }
        h.insert(0.0); // lands on existing bin, no merge
        assert_eq!(h.bins().len(), 8);
        h.insert(1.0); // gap 1.0 to the (0.0, count 2) bin: merge them
        assert_eq!(h.bins().len(), 8);
        let first = h.bins()[0];
        assert_eq!(first.count, 3);
        assert!((first.mean - 1.0 / 3.0).abs() < 1e-9);
    }
}
