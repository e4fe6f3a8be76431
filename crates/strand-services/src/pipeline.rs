//! Pipeline control: decides which samples to ask for next.
//!
//! ```text
//!   Idle ─start─▶ Bootstrap ─thread meta─▶ Fetching ◀─settle─ Adjusting
//!                    ▲                        │  └──rate change──▶┘
//!                    └──starvation / switch───┘
//!   any ─stop─▶ Stopped
//! ```
//!
//! Bootstrap positions the pipeline at the producer's most recent sample as
//! reported by the thread meta. Fetching then hands out consecutive samples
//! as the interest window makes room.

use std::time::Duration;

use serde::Serialize;
use strand_core::meta::{SegmentsInfo, ThreadMeta};
use strand_core::namespace::{SampleClass, StreamType};
use strand_core::{Name, StreamNamespace};
use tokio::time::Instant;

/// Rate change, relative, that counts as the producer changing pace.
const RATE_CHANGE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Bootstrap,
    Fetching,
    Adjusting,
    Stopped,
}

impl PipelineState {
    /// States in which samples are being requested.
    pub fn is_fetching(self) -> bool {
        matches!(self, PipelineState::Fetching | PipelineState::Adjusting)
    }
}

/// Segment names for one sample, as handed to the buffer and the face.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRequest {
    pub class: SampleClass,
    pub sample_no: u64,
    pub names: Vec<Name>,
}

#[derive(Debug)]
pub struct PipelineControl {
    namespace: StreamNamespace,
    thread: String,
    state: PipelineState,
    next_delta: u64,
    next_key: u64,
    /// Delta samples to hand out before the next key sample is due.
    deltas_until_key: u32,
    gop: u32,
    key_due: bool,
    segments: SegmentsInfo,
    rate: f64,
    /// Last sample arrival, or when fetching began.
    last_progress: Option<Instant>,
    starvation: Duration,
}

impl PipelineControl {
    pub fn new(namespace: StreamNamespace, starvation: Duration) -> Self {
        Self {
            namespace,
            thread: String::new(),
            state: PipelineState::Idle,
            next_delta: 0,
            next_key: 0,
            deltas_until_key: 0,
            gop: 0,
            key_due: false,
            segments: SegmentsInfo::default(),
            rate: 0.0,
            last_progress: None,
            starvation,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn thread(&self) -> &str {
        &self.thread
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn namespace(&self) -> &StreamNamespace {
        &self.namespace
    }

    /// Start fetching `thread`. Returns the prefix to discover its latest meta.
    pub fn start(&mut self, thread: &str) -> Name {
        self.thread = thread.to_string();
        self.enter_bootstrap()
    }

    /// Move to another thread of the same stream. The caller flushes the
    /// buffer and outstanding requests.
    pub fn switch_thread(&mut self, thread: &str) -> Name {
        tracing::info!(from = %self.thread, to = thread, "switching thread");
        self.start(thread)
    }

    /// Thread meta prefix for the current thread.
    pub fn meta_prefix(&self) -> Name {
        self.namespace.thread_meta_prefix(&self.thread)
    }

    fn enter_bootstrap(&mut self) -> Name {
        self.state = PipelineState::Bootstrap;
        self.last_progress = None;
        self.meta_prefix()
    }

    /// Position at the latest sample the thread meta reports. Ignored
    /// unless bootstrapping.
    pub fn bootstrap(&mut self, meta: &ThreadMeta) -> bool {
        if self.state != PipelineState::Bootstrap {
            return false;
        }
        match meta {
            ThreadMeta::Audio(m) => {
                self.next_delta = m.bundle_no + 1;
                self.key_due = false;
                self.gop = 0;
                self.segments = SegmentsInfo::default();
            }
            ThreadMeta::Video(m) => {
                self.next_key = m.key_seq_no;
                // deltas of the latest key sample's group
                self.next_delta = (m.delta_seq_no + 1).saturating_sub(u64::from(m.gop_pos));
                self.key_due = true;
                self.gop = m.gop;
                self.deltas_until_key = m.gop.saturating_sub(1).max(1);
                self.segments = m.segments;
            }
        }
        self.rate = meta.rate();
        self.state = PipelineState::Fetching;
        self.last_progress = Some(Instant::now());
        tracing::info!(
            thread = %self.thread,
            rate = self.rate,
            delta = self.next_delta,
            key = self.next_key,
            "pipeline bootstrapped"
        );
        true
    }

    /// Names for up to `room` further samples.
    pub fn next_batch(&mut self, room: u32) -> Vec<SampleRequest> {
        if !self.state.is_fetching() {
            return Vec::new();
        }
        (0..room).map(|_| self.next_sample()).collect()
    }

    fn next_sample(&mut self) -> SampleRequest {
        let class = if self.key_due {
            self.key_due = false;
            SampleClass::Key
        } else {
            SampleClass::Delta
        };

        let sample_no = match class {
            SampleClass::Key => {
                let n = self.next_key;
                self.next_key += 1;
                n
            }
            _ => {
                let n = self.next_delta;
                self.next_delta += 1;
                if self.gop > 0 {
                    self.deltas_until_key = self.deltas_until_key.saturating_sub(1);
                    if self.deltas_until_key == 0 {
                        self.key_due = true;
                        self.deltas_until_key = self.gop.saturating_sub(1).max(1);
                    }
                }
                n
            }
        };

        let (data, parity) = self.expected_segments(class);
        let mut names = Vec::with_capacity((data + parity) as usize);
        for seg in 0..data {
            names.push(self.namespace.segment(&self.thread, class, sample_no, seg));
        }
        for seg in 0..parity {
            names.push(self.namespace.parity(&self.thread, class, sample_no, seg));
        }
        SampleRequest {
            class,
            sample_no,
            names,
        }
    }

    /// Segments to ask for before the real totals are known.
    fn expected_segments(&self, class: SampleClass) -> (u64, u64) {
        if self.namespace.stream_type() == StreamType::Audio {
            return (1, 0);
        }
        let (data, parity) = match class {
            SampleClass::Key => (self.segments.key_avg_segments, self.segments.key_avg_parity),
            _ => (self.segments.delta_avg_segments, self.segments.delta_avg_parity),
        };
        ((data.ceil() as u64).max(1), parity.max(0.0).ceil() as u64)
    }

    pub fn on_sample_arrived(&mut self) {
        self.last_progress = Some(Instant::now());
    }

    /// Back to bootstrap if nothing has arrived for too long. Returns the
    /// meta prefix to refetch.
    pub fn check_starvation(&mut self) -> Option<Name> {
        if !self.state.is_fetching() {
            return None;
        }
        let stalled = self
            .last_progress
            .map_or(false, |t| t.elapsed() >= self.starvation);
        if !stalled {
            return None;
        }
        tracing::warn!(thread = %self.thread, "no samples arriving, rebootstrapping");
        Some(self.enter_bootstrap())
    }

    /// Producer rate from a sample header. True when the change is large
    /// enough that the window should be recomputed.
    pub fn on_rate_update(&mut self, rate: f64) -> bool {
        if !self.state.is_fetching() || rate <= 0.0 {
            return false;
        }
        let changed = self.rate <= 0.0 || (rate - self.rate).abs() > self.rate * RATE_CHANGE;
        if changed {
            tracing::debug!(old = self.rate, new = rate, "producer rate changed");
            self.rate = rate;
            self.state = PipelineState::Adjusting;
        }
        changed
    }

    /// Adjustment applied; resume steady fetching.
    pub fn settle(&mut self) {
        if self.state == PipelineState::Adjusting {
            self.state = PipelineState::Fetching;
        }
    }

    pub fn stop(&mut self) {
        self.state = PipelineState::Stopped;
        self.last_progress = None;
    }
}
