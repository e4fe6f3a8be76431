//! Per-stream statistics.

use std::sync::Mutex;

use serde::Serialize;

use crate::buffer::Occupancy;
use crate::pipeline::PipelineState;

/// Snapshot of every indicator a stream keeps.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatistics {
    pub state: PipelineState,
    pub thread: String,

    pub drd_original_ms: f64,
    pub drd_cached_ms: f64,
    pub drd_deviation_ms: f64,
    /// Producer's sample rate from the latest packet header.
    pub current_rate: f64,
    /// Samples the producer has published, as far as we know.
    pub published_count: u64,

    pub requests_sent: u64,
    pub retransmissions: u64,
    pub segments_received: u64,
    pub segments_original: u64,
    pub segments_cached: u64,
    pub segments_stray: u64,
    pub segments_invalid: u64,
    pub segments_lost: u64,
    pub segments_unverified: u64,
    /// Segments thrown away for not matching their sample's manifest.
    pub segments_rejected: u64,

    pub samples_assembled: u64,
    pub samples_recovered: u64,
    /// Samples whose held segments all matched the manifest.
    pub samples_verified: u64,
    /// Samples where the manifest check found segments that did not match.
    pub samples_corrupted: u64,
    pub samples_played: u64,
    pub samples_skipped: u64,
    pub samples_unrecoverable: u64,
    pub samples_dropped: u64,
    pub rebuffers: u64,

    pub pipeline_limit: u32,
    pub outstanding: u32,
    pub buffer: Occupancy,
}

impl Default for StreamStatistics {
    fn default() -> Self {
        Self {
            state: PipelineState::Idle,
            thread: String::new(),
            drd_original_ms: 0.0,
            drd_cached_ms: 0.0,
            drd_deviation_ms: 0.0,
            current_rate: 0.0,
            published_count: 0,
            requests_sent: 0,
            retransmissions: 0,
            segments_received: 0,
            segments_original: 0,
            segments_cached: 0,
            segments_stray: 0,
            segments_invalid: 0,
            segments_lost: 0,
            segments_unverified: 0,
            segments_rejected: 0,
            samples_assembled: 0,
            samples_recovered: 0,
            samples_verified: 0,
            samples_corrupted: 0,
            samples_played: 0,
            samples_skipped: 0,
            samples_unrecoverable: 0,
            samples_dropped: 0,
            rebuffers: 0,
            pipeline_limit: 0,
            outstanding: 0,
            buffer: Occupancy::default(),
        }
    }
}

/// Shared, lock-protected statistics. Writers update in place; readers
/// take a snapshot.
#[derive(Debug, Default)]
pub struct StatsStorage {
    inner: Mutex<StreamStatistics>,
}

impl StatsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update<F: FnOnce(&mut StreamStatistics)>(&self, f: F) {
        let mut stats = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }

    pub fn snapshot(&self) -> StreamStatistics {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or(serde_json::Value::Null)
    }
}
