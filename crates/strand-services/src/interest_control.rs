//! Interest control: how many samples may be outstanding at once.
//!
//! The window never drops below what the network delay requires to keep
//! the producer busy (`ceil(drd * rate / 1000)` samples) and never exceeds
//! the configured pipeline size. It grows by one per arrived sample while
//! the delay holds steady and the buffer is under target, and halves on a
//! timeout.

use std::sync::{Mutex, MutexGuard};

use crate::buffer_control::BufferObserver;

/// DRD may grow by this factor between updates and still count as stable.
const DRD_STABLE_GROWTH: f64 = 1.1;

/// Consecutive growing DRD updates before the window is pulled in.
const DRD_GROWTH_STREAK: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSnapshot {
    pub lower: u32,
    pub upper: u32,
    pub limit: u32,
    pub outstanding: u32,
}

#[derive(Debug)]
struct State {
    lower: u32,
    upper: u32,
    limit: u32,
    outstanding: u32,
    drd_ms: f64,
    rate: f64,
    growth_streak: u32,
    buffer_over_target: bool,
}

impl State {
    fn recompute_lower(&mut self) {
        let lower = if self.rate > 0.0 {
            (self.drd_ms * self.rate / 1000.0).ceil() as u32
        } else {
            1
        };
        self.lower = lower.clamp(1, self.upper);
        self.limit = self.limit.clamp(self.lower, self.upper);
    }

    fn stable(&self) -> bool {
        self.growth_streak == 0 && !self.buffer_over_target
    }
}

pub struct InterestControl {
    state: Mutex<State>,
}

impl InterestControl {
    pub fn new(max_pipeline: u32) -> Self {
        let upper = max_pipeline.max(1);
        Self {
            state: Mutex::new(State {
                lower: 1,
                upper,
                limit: 1,
                outstanding: 0,
                drd_ms: 0.0,
                rate: 0.0,
                growth_streak: 0,
                buffer_over_target: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start over from the lower limit for this rate and delay.
    pub fn initialize(&self, rate: f64, drd_ms: f64) {
        let mut s = self.lock();
        s.rate = rate;
        s.drd_ms = drd_ms;
        s.outstanding = 0;
        s.growth_streak = 0;
        s.buffer_over_target = false;
        s.limit = 1;
        s.recompute_lower();
        s.limit = s.lower;
        tracing::debug!(lower = s.lower, limit = s.limit, rate, drd_ms, "interest window initialized");
    }

    /// Samples that may be requested right now.
    pub fn room(&self) -> u32 {
        let s = self.lock();
        s.limit.saturating_sub(s.outstanding)
    }

    /// One more sample requested.
    pub fn increment(&self) {
        self.lock().outstanding += 1;
    }

    /// One sample no longer outstanding.
    pub fn decrement(&self) {
        let mut s = self.lock();
        s.outstanding = s.outstanding.saturating_sub(1);
    }

    /// Widen the window, e.g. when the buffer is running dry.
    pub fn burst(&self) {
        let mut s = self.lock();
        let step = (s.lower / 2).max(1);
        s.limit = (s.limit + step).min(s.upper);
        tracing::debug!(limit = s.limit, "interest window burst");
    }

    /// Narrow the window, e.g. when the buffer holds too much.
    pub fn withhold(&self) {
        let mut s = self.lock();
        let step = (s.lower / 2).max(1);
        s.limit = s.limit.saturating_sub(step).max(s.lower);
        tracing::debug!(limit = s.limit, "interest window withheld");
    }

    /// A request timed out: halve, never below the lower limit.
    pub fn on_timeout(&self) {
        let mut s = self.lock();
        s.limit = (s.limit / 2).max(s.lower);
        tracing::debug!(limit = s.limit, "interest window halved on timeout");
    }

    /// Feed buffered playable duration against the target. Overflowing
    /// the target by half again pulls the window in.
    pub fn observe_buffer(&self, buffered_ms: f64, target_ms: f64) {
        let over = {
            let mut s = self.lock();
            s.buffer_over_target = buffered_ms > target_ms;
            buffered_ms > target_ms * 1.5
        };
        if over {
            self.withhold();
        }
    }

    pub fn limit(&self) -> u32 {
        self.lock().limit
    }

    pub fn outstanding(&self) -> u32 {
        self.lock().outstanding
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        let s = self.lock();
        WindowSnapshot {
            lower: s.lower,
            upper: s.upper,
            limit: s.limit,
            outstanding: s.outstanding,
        }
    }
}

impl BufferObserver for InterestControl {
    fn on_sample_arrived(&self, _playback_no: u64) {
        let mut s = self.lock();
        s.outstanding = s.outstanding.saturating_sub(1);
        if s.stable() && s.limit < s.upper {
            s.limit += 1;
        }
    }

    fn on_target_rate_update(&self, rate: f64) {
        let mut s = self.lock();
        if (s.rate - rate).abs() > f64::EPSILON {
            s.rate = rate;
            s.recompute_lower();
        }
    }

    fn on_drd_update(&self, original_ms: f64, _cached_ms: f64) {
        let shrink = {
            let mut s = self.lock();
            let growing = s.drd_ms > 0.0 && original_ms > s.drd_ms * DRD_STABLE_GROWTH;
            s.growth_streak = if growing { s.growth_streak + 1 } else { 0 };
            s.drd_ms = original_ms;
            s.recompute_lower();
            if s.growth_streak >= DRD_GROWTH_STREAK {
                s.growth_streak = 0;
                true
            } else {
                false
            }
        };
        if shrink {
            self.withhold();
        }
    }
}
