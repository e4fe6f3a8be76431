//! Audio/video synchronization.
//!
//! Two playouts share one synchronizer. The master plays at its own pace
//! and only reports what it plays; the slave compares each sample's
//! publish timestamp with where the master is now and gets a playout
//! delay adjustment back.

use std::sync::Mutex;

use tokio::time::Instant;

/// Slave may lead the master by this much before being held back.
pub const TOLERABLE_LEADING_DRIFT_MS: i64 = 15;
/// Slave may lag the master by this much before being sped up.
pub const TOLERABLE_LAGGING_DRIFT_MS: i64 = 45;
/// Largest single adjustment.
pub const MAX_ADJUSTMENT_MS: i64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRole {
    Master,
    Slave,
}

#[derive(Debug, Clone, Copy, Default)]
struct SyncPoint {
    /// (publish timestamp, local play time) of the last sample.
    last: Option<(i64, Instant)>,
}

impl SyncPoint {
    /// Publish time this stream would be at, at `now`.
    fn projected(&self, now: Instant) -> Option<i64> {
        self.last
            .map(|(remote, local)| remote + now.saturating_duration_since(local).as_millis() as i64)
    }
}

#[derive(Debug, Default)]
struct State {
    master: SyncPoint,
    slave: SyncPoint,
}

#[derive(Debug, Default)]
pub struct AvSynchronizer {
    state: Mutex<State>,
}

impl AvSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample about to play and return the delay adjustment in ms
    /// (positive: wait longer, negative: play sooner). Always 0 for the
    /// master and until both sides have played something.
    pub fn synchronize(&self, role: SyncRole, remote_ts_ms: i64, local: Instant) -> i64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match role {
            SyncRole::Master => {
                state.master.last = Some((remote_ts_ms, local));
                0
            }
            SyncRole::Slave => {
                let adjustment = match state.master.projected(local) {
                    Some(master_now) => {
                        let drift = remote_ts_ms - master_now;
                        if drift > TOLERABLE_LEADING_DRIFT_MS || drift < -TOLERABLE_LAGGING_DRIFT_MS {
                            drift.clamp(-MAX_ADJUSTMENT_MS, MAX_ADJUSTMENT_MS)
                        } else {
                            0
                        }
                    }
                    None => 0,
                };
                if adjustment != 0 {
                    tracing::debug!(adjustment, remote_ts_ms, "av sync adjustment");
                }
                let played_at = local + std::time::Duration::from_millis(adjustment.max(0) as u64);
                state.slave.last = Some((remote_ts_ms, played_at));
                adjustment
            }
        }
    }

    /// Forget both sides, e.g. after a rebuffer.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = State::default();
    }

    pub fn is_initialized(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.master.last.is_some() && state.slave.last.is_some()
    }
}
