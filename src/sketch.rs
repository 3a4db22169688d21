use std::time::Duration;

use tdigest::TDigest;

/// Streaming quantile sketch for latency samples, in milliseconds.
///
/// Wraps a [`TDigest`] behind a small insertion buffer: `tdigest`'s merge API
/// is batch-shaped (`merge_unsorted` consumes the digest and a sample vector),
/// so single-sample `add` calls are staged and folded in every
/// [`Self::FLUSH_AT`] samples. That keeps `add` amortized cheap on the
/// emission path while preserving the digest's bounded relative error at the
/// quantiles the report asks for (0, 0.5, 0.9, 0.95, 1.0).
///
/// The sketch never receives synthetic zero samples: callers skip the update
/// when a latency dimension was not observed (reused connection, cached DNS,
/// plaintext). `count` therefore equals the number of real observations.
#[derive(Debug, Clone)]
pub struct LatencySketch {
    digest: TDigest,
    buffer: Vec<f64>,
    count: u64,
}

impl LatencySketch {
    const FLUSH_AT: usize = 256;
    const COMPRESSION: usize = 100;

    pub fn new() -> Self {
        Self {
            digest: TDigest::new_with_size(Self::COMPRESSION),
            buffer: Vec::new(),
            count: 0,
        }
    }

    pub fn add(&mut self, sample: Duration) {
        self.buffer.push(sample.as_secs_f64() * 1000.0);
        self.count += 1;
        if self.buffer.len() >= Self::FLUSH_AT {
            self.flush();
        }
    }

    /// Number of samples observed so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Estimated latency at quantile `q` (0.0 ..= 1.0), in milliseconds.
    /// Returns 0.0 for an empty sketch.
    pub fn quantile(&mut self, q: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.flush();
        self.digest.estimate_quantile(q)
    }

    /// Same estimate expressed as a [`Duration`], for report formatting.
    pub fn quantile_duration(&mut self, q: f64) -> Duration {
        Duration::from_secs_f64(self.quantile(q).max(0.0) / 1000.0)
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let staged = std::mem::take(&mut self.buffer);
        let digest = std::mem::replace(&mut self.digest, TDigest::new_with_size(Self::COMPRESSION));
        self.digest = digest.merge_unsorted(staged);
    }
}

impl Default for LatencySketch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(samples: impl IntoIterator<Item = u64>) -> LatencySketch {
        let mut sketch = LatencySketch::new();
        for ms in samples {
            sketch.add(Duration::from_millis(ms));
        }
        sketch
    }

    #[test]
    fn empty_sketch_reports_zero() {
        let mut sketch = LatencySketch::new();
        assert!(sketch.is_empty());
        assert_eq!(sketch.quantile(0.5), 0.0);
    }

    #[test]
    fn counts_every_sample() {
        let sketch = filled(0..1000);
        assert_eq!(sketch.count(), 1000);
    }

    #[test]
    fn quantiles_are_monotonic() {
        let mut sketch = filled((0..2000).map(|i| i % 700));
        let qs = [0.0, 0.5, 0.9, 0.95, 1.0];
        let estimates: Vec<f64> = qs.iter().map(|&q| sketch.quantile(q)).collect();
        for pair in estimates.windows(2) {
            assert!(
                pair[0] <= pair[1],
                "quantile estimates must not decrease: {estimates:?}"
            );
        }
    }

    #[test]
    fn median_of_uniform_samples_is_close() {
        let mut sketch = filled(1..=1001);
        let median = sketch.quantile(0.5);
        assert!(
            (median - 501.0).abs() < 25.0,
            "median estimate {median} too far from 501"
        );
    }

    #[test]
    fn extremes_bracket_the_data() {
        let mut sketch = filled([5, 10, 20, 40, 80]);
        assert!(sketch.quantile(0.0) >= 0.0);
        assert!(sketch.quantile(1.0) <= 81.0);
        assert!(sketch.quantile(1.0) >= sketch.quantile(0.0));
    }

    #[test]
    fn flush_boundary_does_not_lose_samples() {
        // One more than the internal flush threshold.
        let sketch = filled(0..257);
        assert_eq!(sketch.count(), 257);
    }
}
