//! Data retrieval delay (DRD) estimation.
//!
//! Two independent sliding-window averages: one over segments the producer
//! generated for our own requests (original), one over segments some cache
//! answered (cached). The producer's generation delay is not network delay,
//! so it is taken out of original observations before they are averaged.

use std::collections::VecDeque;

use strand_core::config::DrdConfig;

/// Windowed mean and standard deviation of one delay stream.
#[derive(Debug, Clone)]
pub struct DelayEstimate {
    window: VecDeque<f64>,
    capacity: usize,
    initial_ms: f64,
    sum: f64,
    sum_sq: f64,
}

impl DelayEstimate {
    pub fn new(capacity: usize, initial_ms: f64) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            initial_ms,
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    pub fn observe(&mut self, value_ms: f64) {
        if self.window.len() == self.capacity {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
                self.sum_sq -= old * old;
            }
        }
        self.window.push_back(value_ms);
        self.sum += value_ms;
        self.sum_sq += value_ms * value_ms;
    }

    /// Mean of the window, or the initial estimate before any sample.
    pub fn value(&self) -> f64 {
        if self.window.is_empty() {
            self.initial_ms
        } else {
            self.sum / self.window.len() as f64
        }
    }

    pub fn deviation(&self) -> f64 {
        let n = self.window.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.sum / n as f64;
        // rounding can push this slightly negative
        (self.sum_sq / n as f64 - mean * mean).max(0.0).sqrt()
    }

    pub fn count(&self) -> usize {
        self.window.len()
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.sum = 0.0;
        self.sum_sq = 0.0;
    }
}

#[derive(Debug, Clone)]
pub struct DrdEstimator {
    original: DelayEstimate,
    cached: DelayEstimate,
}

impl DrdEstimator {
    pub fn new(config: &DrdConfig) -> Self {
        let window = config.window as usize;
        Self {
            original: DelayEstimate::new(window, config.initial_drd_ms),
            cached: DelayEstimate::new(window, config.initial_drd_ms),
        }
    }

    /// Feed one segment's round-trip delay.
    pub fn observe(&mut self, delay_ms: f64, is_original: bool, generation_delay_ms: f64) {
        if is_original {
            self.original
                .observe((delay_ms - generation_delay_ms).max(0.0));
        } else {
            self.cached.observe(delay_ms);
        }
    }

    pub fn original_estimate(&self) -> f64 {
        self.original.value()
    }

    pub fn cached_estimate(&self) -> f64 {
        self.cached.value()
    }

    pub fn original_deviation(&self) -> f64 {
        self.original.deviation()
    }

    pub fn cached_deviation(&self) -> f64 {
        self.cached.deviation()
    }

    pub fn original(&self) -> &DelayEstimate {
        &self.original
    }

    pub fn cached(&self) -> &DelayEstimate {
        &self.cached
    }

    pub fn reset(&mut self) {
        self.original.reset();
        self.cached.reset();
    }
}

impl Default for DrdEstimator {
    fn default() -> Self {
        Self::new(&DrdConfig::default())
    }
}
