//! Buffer control: routes arriving segments into the buffer, keeps the
//! delay estimator fed and tells observers about buffer-driven events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use strand_core::manifest::Manifest;
use strand_core::namespace::SampleClass;

use crate::buffer::{Buffer, Integrity, Receipt, SlotState, Verification};
use crate::drd::DrdEstimator;
use crate::segment::WireSegment;
use crate::stats::StatsStorage;

/// Reacts to buffer events. Called after the buffer lock is released.
pub trait BufferObserver: Send + Sync {
    /// First segment of a sample arrived.
    fn on_sample_arrived(&self, playback_no: u64);

    /// Producer rate from a packet header segment.
    fn on_target_rate_update(&self, _rate: f64) {}

    fn on_drd_update(&self, _original_ms: f64, _cached_ms: f64) {}
}

/// Identifies one `attach` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

struct Registration {
    handle: ObserverHandle,
    observer: Weak<dyn BufferObserver>,
}

pub struct BufferControl {
    buffer: Arc<Buffer>,
    drd: Mutex<DrdEstimator>,
    stats: Arc<StatsStorage>,
    observers: Mutex<Vec<Registration>>,
    next_handle: AtomicU64,
}

impl BufferControl {
    pub fn new(buffer: Arc<Buffer>, drd: DrdEstimator, stats: Arc<StatsStorage>) -> Self {
        Self {
            buffer,
            drd: Mutex::new(drd),
            stats,
            observers: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    /// Register an observer. Held weakly; attaching the same observer twice
    /// gives two handles and two notifications per event.
    pub fn attach<O: BufferObserver + 'static>(&self, observer: &Arc<O>) -> ObserverHandle {
        let weak: Weak<dyn BufferObserver> = Arc::downgrade(observer) as Weak<dyn BufferObserver>;
        let handle = ObserverHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.registrations().push(Registration {
            handle,
            observer: weak,
        });
        handle
    }

    /// Remove exactly the registration `handle` names.
    pub fn detach(&self, handle: ObserverHandle) -> bool {
        let mut regs = self.registrations();
        let before = regs.len();
        regs.retain(|r| r.handle != handle);
        regs.len() != before
    }

    pub fn observer_count(&self) -> usize {
        let mut regs = self.registrations();
        regs.retain(|r| r.observer.strong_count() > 0);
        regs.len()
    }

    fn registrations(&self) -> std::sync::MutexGuard<'_, Vec<Registration>> {
        self.observers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Live observers, copied out so callbacks run without the registry lock.
    fn live_observers(&self) -> Vec<Arc<dyn BufferObserver>> {
        let mut regs = self.registrations();
        regs.retain(|r| r.observer.strong_count() > 0);
        regs.iter().filter_map(|r| r.observer.upgrade()).collect()
    }

    /// Hand a received segment to the buffer. Returns None if it was not
    /// wanted.
    pub fn segment_arrived(&self, segment: &WireSegment, round_trip: Duration) -> Option<Receipt> {
        let known_class = matches!(segment.sample_class(), SampleClass::Key | SampleClass::Delta);
        if !known_class || !self.buffer.is_requested(segment) {
            tracing::trace!(name = %segment.name(), "data is not in the buffer");
            self.stats.update(|s| s.segments_stray += 1);
            return None;
        }
        let Some(receipt) = self.buffer.received(segment) else {
            tracing::trace!(name = %segment.name(), "data is not in the buffer");
            self.stats.update(|s| s.segments_stray += 1);
            return None;
        };

        let rtt_ms = round_trip.as_secs_f64() * 1000.0;
        let original = segment.is_original();
        let dgen = segment.generation_delay_ms();
        let (drd_original, drd_cached, deviation) = {
            let mut drd = self.drd.lock().unwrap_or_else(|e| e.into_inner());
            drd.observe(rtt_ms, original, dgen);
            (
                drd.original_estimate(),
                drd.cached_estimate(),
                drd.original_deviation(),
            )
        };

        tracing::trace!(
            rtt_ms,
            original,
            dgen,
            drd = drd_original,
            thread = segment.thread_name(),
            sample = segment.sample_no(),
            seg = segment.segment_no(),
            "segment"
        );

        if receipt.rejected {
            tracing::warn!(
                thread = segment.thread_name(),
                sample = segment.sample_no(),
                seg = segment.segment_no(),
                "segment does not match the sample manifest"
            );
        }

        let newly_ready =
            receipt.new_state == SlotState::Ready && receipt.old_state != SlotState::Ready;
        self.stats.update(|s| {
            s.drd_original_ms = drd_original;
            s.drd_cached_ms = drd_cached;
            s.drd_deviation_ms = deviation;
            s.segments_received += 1;
            if original {
                s.segments_original += 1;
            } else {
                s.segments_cached += 1;
            }
            if newly_ready {
                s.samples_assembled += 1;
            }
            if receipt.rejected {
                s.segments_rejected += 1;
            }
            s.published_count = s.published_count.max(segment.sample_no() + 1);
        });

        let observers = self.live_observers();
        for o in &observers {
            o.on_drd_update(drd_original, drd_cached);
        }

        if segment.is_packet_header_segment() {
            if let Some(header) = segment.packet_header() {
                let rate = header.sample_rate;
                for o in &observers {
                    o.on_target_rate_update(rate);
                }
                self.stats.update(|s| s.current_rate = rate);
            }
        }

        if receipt.old_state == SlotState::New {
            let playback_no = receipt.playback_no.unwrap_or(receipt.key.sample_no);
            for o in &observers {
                o.on_sample_arrived(playback_no);
            }
        }

        Some(receipt)
    }

    /// Hand a received manifest to the buffer, which checks the segments
    /// it holds for that sample. None if the manifest is unreadable or no
    /// slot asked for it.
    pub fn manifest_arrived(&self, segment: &WireSegment) -> Option<Verification> {
        let manifest = match Manifest::from_wire(segment.data().content.clone()) {
            Ok(manifest) => manifest,
            Err(error) => {
                tracing::warn!(name = %segment.name(), %error, "unreadable manifest");
                self.stats.update(|s| s.segments_invalid += 1);
                return None;
            }
        };
        let Some(verification) = self.buffer.manifest_arrived(segment.name(), manifest) else {
            tracing::trace!(name = %segment.name(), "manifest is not in the buffer");
            self.stats.update(|s| s.segments_stray += 1);
            return None;
        };

        if verification.rejected.is_empty() {
            tracing::debug!(
                thread = segment.thread_name(),
                sample = segment.sample_no(),
                state = ?verification.new_state,
                "sample manifest verified"
            );
        } else {
            tracing::warn!(
                thread = segment.thread_name(),
                sample = segment.sample_no(),
                rejected = verification.rejected.len(),
                "segments do not match the sample manifest"
            );
        }

        let newly_ready = verification.new_state == SlotState::Ready
            && verification.old_state != SlotState::Ready;
        self.stats.update(|s| {
            s.segments_received += 1;
            match verification.integrity {
                Integrity::Verified => s.samples_verified += 1,
                Integrity::Failed => s.samples_corrupted += 1,
                Integrity::Unchecked | Integrity::Requested => {}
            }
            s.segments_rejected += verification.rejected.len() as u64;
            if newly_ready {
                s.samples_assembled += 1;
            }
        });
        Some(verification)
    }

    pub fn drd(&self) -> DrdEstimator {
        self.drd.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reset_drd(&self) {
        self.drd.lock().unwrap_or_else(|e| e.into_inner()).reset();
    }
}
