//! Playout: drains Ready samples in playback order at publish cadence.
//!
//! Playout starts at the first Ready sample. After that it always looks at
//! the head: the sample with the smallest playback number past the last
//! one played. A Ready head is played; a head that stays incomplete longer
//! than the jitter allowance is skipped. Each played sample schedules the
//! next step `1000 / rate` ms later, shifted by the A/V sync adjustment.

use std::sync::Arc;
use std::time::Duration;

use strand_core::namespace::SampleClass;
use tokio::time::Instant;

use crate::av_sync::{AvSynchronizer, SyncRole};
use crate::buffer::{Assembled, Buffer, Removed};
use crate::fec::FecError;
use crate::pool::{PooledBuffer, SamplePool};

/// A sample on its way to the sink.
#[derive(Debug)]
pub struct PlayoutSample {
    pub thread: String,
    pub class: SampleClass,
    pub sample_no: u64,
    pub playback_no: u64,
    pub payload: PooledBuffer,
    pub publish_timestamp_ms: Option<i64>,
    /// Publish rate, samples per second. 0 when the header was missing.
    pub rate: f64,
    /// Data slices rebuilt from parity.
    pub rebuilt: usize,
}

#[derive(Debug)]
pub enum Step {
    /// Nothing playable; look again after a tick.
    Idle,
    /// Playout ran dry after playing.
    Rebuffer,
    /// Head sample incomplete, still within the jitter allowance.
    Wait(Duration),
    Played {
        sample: PlayoutSample,
        next_in: Duration,
        removed: Removed,
    },
    Skipped {
        playback_no: u64,
        removed: Removed,
    },
    /// Assembled but no pooled buffer to put it in.
    Dropped {
        playback_no: u64,
        removed: Removed,
    },
    Unrecoverable {
        playback_no: u64,
        error: FecError,
        removed: Removed,
    },
}

pub struct Playout {
    buffer: Arc<Buffer>,
    pool: SamplePool,
    jitter: Duration,
    tick: Duration,
    sync: Option<(Arc<AvSynchronizer>, SyncRole)>,
    last_played: Option<u64>,
    /// Current head and when it became head.
    head_since: Option<(u64, Instant)>,
    last_rate: f64,
    started: bool,
    dry: bool,
}

impl Playout {
    pub fn new(buffer: Arc<Buffer>, pool: SamplePool, jitter: Duration, tick: Duration) -> Self {
        Self {
            buffer,
            pool,
            jitter,
            tick,
            sync: None,
            last_played: None,
            head_since: None,
            last_rate: 0.0,
            started: false,
            dry: false,
        }
    }

    pub fn with_sync(mut self, sync: Arc<AvSynchronizer>, role: SyncRole) -> Self {
        self.sync = Some((sync, role));
        self
    }

    pub fn set_sync(&mut self, sync: Option<(Arc<AvSynchronizer>, SyncRole)>) {
        self.sync = sync;
    }

    pub fn last_played(&self) -> Option<u64> {
        self.last_played
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Start over, e.g. after a thread switch.
    pub fn reset(&mut self) {
        self.last_played = None;
        self.head_since = None;
        self.started = false;
        self.dry = false;
        if let Some((sync, _)) = &self.sync {
            sync.reset();
        }
    }

    pub fn step(&mut self) -> Step {
        let now = Instant::now();

        if !self.started {
            let Some(first) = self.buffer.next_ready() else {
                return Step::Idle;
            };
            // incomplete samples ahead of the first ready one are never played
            if first.playback_no > 0 {
                self.buffer.discard_through(first.playback_no - 1);
            }
            tracing::debug!(playback_no = first.playback_no, "playout started");
            self.started = true;
        }

        let Some(head) = self.buffer.next_playable(self.last_played) else {
            self.head_since = None;
            if self.dry || self.last_played.is_none() {
                return Step::Idle;
            }
            self.dry = true;
            if let Some((sync, _)) = &self.sync {
                sync.reset();
            }
            tracing::debug!(last = ?self.last_played, "playout ran dry");
            return Step::Rebuffer;
        };
        self.dry = false;

        match self.buffer.take(&head.key) {
            Some(Assembled::Sample(assembled)) => {
                self.head_since = None;
                self.last_played = Some(assembled.playback_no);
                let removed = self.buffer.discard_through(assembled.playback_no);

                let Some(mut payload) = self.pool.acquire() else {
                    tracing::warn!(
                        playback_no = assembled.playback_no,
                        "sample pool exhausted, dropping sample"
                    );
                    return Step::Dropped {
                        playback_no: assembled.playback_no,
                        removed,
                    };
                };
                payload.fill(&assembled.payload);

                let (rate, publish_ts) = match assembled.common {
                    Some(c) => (c.sample_rate, Some(c.publish_timestamp_ms)),
                    None => (self.last_rate, None),
                };
                if rate > 0.0 {
                    self.last_rate = rate;
                }
                let cadence_ms = if rate > 0.0 { 1000.0 / rate } else { self.tick.as_secs_f64() * 1000.0 };
                let adjustment = match (&self.sync, publish_ts) {
                    (Some((sync, role)), Some(ts)) => sync.synchronize(*role, ts, now),
                    _ => 0,
                };
                let next_ms = (cadence_ms + adjustment as f64).max(0.0);

                Step::Played {
                    sample: PlayoutSample {
                        thread: assembled.key.thread,
                        class: assembled.key.class,
                        sample_no: assembled.key.sample_no,
                        playback_no: assembled.playback_no,
                        payload,
                        publish_timestamp_ms: publish_ts,
                        rate,
                        rebuilt: assembled.rebuilt,
                    },
                    next_in: Duration::from_micros((next_ms * 1000.0).round() as u64),
                    removed,
                }
            }
            Some(Assembled::Unrecoverable {
                playback_no, error, ..
            }) => {
                self.head_since = None;
                self.last_played = Some(playback_no);
                tracing::warn!(playback_no, error = %error, "sample could not be assembled");
                Step::Unrecoverable {
                    playback_no,
                    error,
                    removed: self.buffer.discard_through(playback_no),
                }
            }
            None => {
                let since = match self.head_since {
                    Some((p, since)) if p == head.playback_no => since,
                    _ => {
                        self.head_since = Some((head.playback_no, now));
                        now
                    }
                };
                let waited = now.duration_since(since);
                if waited < self.jitter {
                    return Step::Wait(self.tick.min(self.jitter - waited));
                }
                self.head_since = None;
                self.last_played = Some(head.playback_no);
                tracing::debug!(
                    playback_no = head.playback_no,
                    state = ?head.state,
                    "skipping incomplete sample"
                );
                Step::Skipped {
                    playback_no: head.playback_no,
                    removed: self.buffer.discard_through(head.playback_no),
                }
            }
        }
    }
}
