//! Sample buffer: reassembles samples from segments arriving in any order.
//!
//! Slots are keyed by (thread, sample class, sample number) and created
//! lazily the first time a segment of the sample is requested. A slot moves
//! `New → Assembling` on its first segment and becomes `Ready` once every
//! data segment is in, or once the gaps can be rebuilt from parity and the
//! held segments have been checked against the sample's manifest. Ready
//! slots leave the buffer when playout takes them; anything older than the
//! horizon is evicted.
//!
//! All slot mutation happens under one lock. Nothing here calls out while
//! holding it.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use strand_core::manifest::Manifest;
use strand_core::namespace::{
    NamespaceInfo, SampleClass, SegmentClass, StreamType, MANIFEST_COMPONENT, PARITY_COMPONENT,
};
use strand_core::wire::CommonHeader;
use strand_core::{Data, Name};
use tokio::time::Instant;

use crate::fec::{self, FecError};
use crate::segment::WireSegment;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub thread: String,
    pub class: SampleClass,
    pub sample_no: u64,
}

impl SlotKey {
    pub fn new(thread: &str, class: SampleClass, sample_no: u64) -> Self {
        Self {
            thread: thread.to_string(),
            class,
            sample_no,
        }
    }

    fn of(info: &NamespaceInfo) -> Self {
        Self::new(&info.thread_name, info.sample_class, info.sample_no)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    New,
    Assembling,
    Ready,
}

/// Where a slot stands on checking its segments against the manifest.
/// Only slots that would play rebuilt data go past `Unchecked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrity {
    Unchecked,
    Requested,
    Verified,
    /// At least one segment did not match and was thrown away.
    Failed,
}

#[derive(Debug)]
struct BufferSlot {
    prefix: Name,
    state: SlotState,
    pending: HashSet<Name>,
    data: BTreeMap<u64, Bytes>,
    parity: BTreeMap<u64, Bytes>,
    total_data: Option<u32>,
    total_parity: Option<u32>,
    playback_no: Option<u64>,
    common: Option<CommonHeader>,
    first_arrival: Option<Instant>,
    ready_at: Option<Instant>,
    integrity: Integrity,
    /// Stored segments not yet checked against a manifest.
    unchecked: Vec<Data>,
    manifest: Option<Manifest>,
}

impl BufferSlot {
    fn new(prefix: Name) -> Self {
        Self {
            prefix,
            state: SlotState::New,
            pending: HashSet::new(),
            data: BTreeMap::new(),
            parity: BTreeMap::new(),
            total_data: None,
            total_parity: None,
            playback_no: None,
            common: None,
            first_arrival: None,
            ready_at: None,
            integrity: Integrity::Unchecked,
            unchecked: Vec::new(),
            manifest: None,
        }
    }

    fn has_all_data(&self) -> bool {
        self.total_data
            .map_or(false, |t| (0..u64::from(t)).all(|i| self.data.contains_key(&i)))
    }

    fn is_recoverable(&self) -> bool {
        match self.total_data {
            Some(total) => fec::recoverable(
                &self.data,
                &self.parity,
                total,
                self.total_parity.unwrap_or(0),
            ),
            None => false,
        }
    }

    fn is_complete(&self) -> bool {
        self.has_all_data() || (self.integrity == Integrity::Verified && self.is_recoverable())
    }

    fn mark_ready_if_complete(&mut self, now: Instant) {
        if self.state != SlotState::Ready && self.is_complete() {
            self.state = SlotState::Ready;
            self.ready_at = Some(now);
        }
    }

    fn discard(&mut self, name: &Name) {
        if let Ok(info) = NamespaceInfo::classify(name) {
            if info.is_parity() {
                self.parity.remove(&info.segment_no);
            } else {
                self.data.remove(&info.segment_no);
            }
        }
    }

    /// Duration of the sample at its publish rate.
    fn duration_ms(&self) -> f64 {
        match self.common {
            Some(c) => {
                let rate = c.sample_rate;
                if rate > 0.0 {
                    1000.0 / rate
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }

    fn data_name(&self, seg: u64) -> Name {
        self.prefix.clone().append_segment(seg)
    }

    fn parity_name(&self, seg: u64) -> Name {
        self.data_name(seg).append(PARITY_COMPONENT)
    }

    fn manifest_name(&self) -> Name {
        self.prefix.clone().append(MANIFEST_COMPONENT)
    }
}

/// What happened to a slot when a segment landed in it.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub key: SlotKey,
    pub old_state: SlotState,
    pub new_state: SlotState,
    pub playback_no: Option<u64>,
    pub fetched_data: u32,
    pub fetched_parity: u32,
    pub total_data: Option<u32>,
    pub total_parity: Option<u32>,
    /// Totals became known with this segment.
    pub totals_learned: bool,
    /// Pending requests for segments past the real totals, or a manifest
    /// the slot stopped needing; no longer needed.
    pub surplus: Vec<Name>,
    /// The slot can be rebuilt from parity once this manifest checks out.
    /// Already registered as pending.
    pub manifest: Option<Name>,
    /// The segment did not match the manifest held for its sample and was
    /// thrown away.
    pub rejected: bool,
}

/// Outcome of checking a slot's segments against its manifest.
#[derive(Debug, Clone)]
pub struct Verification {
    pub key: SlotKey,
    pub old_state: SlotState,
    pub new_state: SlotState,
    pub playback_no: Option<u64>,
    pub integrity: Integrity,
    /// Segments that did not match and were thrown away.
    pub rejected: Vec<Name>,
}

/// The smallest playback number waiting in the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    pub key: SlotKey,
    pub playback_no: u64,
    pub state: SlotState,
}

/// A Ready slot, taken out of the buffer.
#[derive(Debug, Clone)]
pub struct AssembledSample {
    pub key: SlotKey,
    pub playback_no: u64,
    pub payload: Bytes,
    pub common: Option<CommonHeader>,
    /// Data slices rebuilt from parity.
    pub rebuilt: usize,
    /// First segment to ready, in ms.
    pub assembly_ms: u64,
}

#[derive(Debug)]
pub enum Assembled {
    Sample(AssembledSample),
    Unrecoverable {
        key: SlotKey,
        playback_no: u64,
        error: FecError,
    },
}

/// Slots removed without being played, and their still-pending requests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Removed {
    pub slots: usize,
    pub pending: Vec<Name>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, serde::Serialize)]
pub struct Occupancy {
    pub new: usize,
    pub assembling: usize,
    pub ready: usize,
    /// Playable duration sitting in Ready slots.
    pub ready_ms: f64,
}

pub struct Buffer {
    slots: Mutex<BTreeMap<SlotKey, BufferSlot>>,
    horizon: usize,
}

impl Buffer {
    pub fn new(horizon: usize) -> Self {
        Self {
            slots: Mutex::new(BTreeMap::new()),
            horizon: horizon.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<SlotKey, BufferSlot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register outstanding segment requests. Returns the pending names of
    /// slots evicted to keep each thread and class within the horizon.
    pub fn requested(&self, names: &[Name]) -> Vec<Name> {
        let mut slots = self.lock();
        let mut touched: HashSet<(String, SampleClass)> = HashSet::new();

        for name in names {
            let info = match NamespaceInfo::classify(name) {
                Ok(info)
                    if matches!(info.segment_class, SegmentClass::Data | SegmentClass::Parity) =>
                {
                    info
                }
                _ => {
                    tracing::trace!(name = %name, "not a sample segment, not buffered");
                    continue;
                }
            };
            let key = SlotKey::of(&info);
            touched.insert((key.thread.clone(), key.class));
            let suffix = if info.is_parity() { 2 } else { 1 };
            let prefix = name.prefix(name.len() - suffix);
            let slot = slots.entry(key).or_insert_with(|| {
                let mut slot = BufferSlot::new(prefix);
                if info.stream_type == StreamType::Audio {
                    slot.playback_no = Some(info.sample_no);
                }
                slot
            });
            slot.pending.insert(name.clone());
        }

        let mut evicted = Vec::new();
        for (thread, class) in touched {
            let group: Vec<SlotKey> = slots
                .keys()
                .filter(|k| k.thread == thread && k.class == class)
                .cloned()
                .collect();
            if group.len() <= self.horizon {
                continue;
            }
            for key in &group[..group.len() - self.horizon] {
                if let Some(slot) = slots.remove(key) {
                    tracing::debug!(
                        thread = %key.thread,
                        sample = key.sample_no,
                        state = ?slot.state,
                        "slot evicted past horizon"
                    );
                    evicted.extend(slot.pending);
                }
            }
        }
        evicted
    }

    pub fn is_requested(&self, segment: &WireSegment) -> bool {
        let Some(info) = segment.info() else {
            return false;
        };
        self.lock()
            .get(&SlotKey::of(info))
            .map(|slot| slot.pending.contains(segment.name()))
            .unwrap_or(false)
    }

    /// Store a segment. None if nobody is waiting for it.
    pub fn received(&self, segment: &WireSegment) -> Option<Receipt> {
        let info = segment.info()?;
        let key = SlotKey::of(info);
        let mut slots = self.lock();
        let slot = slots.get_mut(&key)?;
        if !slot.pending.remove(segment.name()) {
            return None;
        }

        let old_state = slot.state;
        let now = Instant::now();
        slot.first_arrival.get_or_insert(now);

        if let Some(manifest) = &slot.manifest {
            if !manifest.has_data(segment.data()) {
                slot.integrity = Integrity::Failed;
                return Some(Receipt {
                    key,
                    old_state,
                    new_state: slot.state,
                    playback_no: slot.playback_no,
                    fetched_data: slot.data.len() as u32,
                    fetched_parity: slot.parity.len() as u32,
                    total_data: slot.total_data,
                    total_parity: slot.total_parity,
                    totals_learned: false,
                    surplus: Vec::new(),
                    manifest: None,
                    rejected: true,
                });
            }
        } else {
            slot.unchecked.push(segment.data().clone());
        }

        if segment.is_parity() {
            slot.parity.insert(segment.segment_no(), segment.payload());
        } else {
            slot.data.insert(segment.segment_no(), segment.payload());
        }

        let mut totals_learned = false;
        if slot.total_data.is_none() {
            if let Some(total) = segment.total_data_segments() {
                slot.total_data = Some(total);
                totals_learned = true;
            }
        }
        if slot.total_parity.is_none() {
            if let Some(total) = segment.total_parity_segments() {
                slot.total_parity = Some(total);
                totals_learned = true;
            }
        }
        if slot.playback_no.is_none() {
            slot.playback_no = segment.playback_no();
        }
        if slot.common.is_none() {
            slot.common = segment.packet_header();
        }

        let mut surplus = Vec::new();
        if totals_learned {
            let total_data = slot.total_data.map(u64::from);
            let total_parity = slot.total_parity.map(u64::from);
            slot.pending.retain(|name| {
                let past = match NamespaceInfo::classify(name) {
                    Ok(i) if i.is_parity() => total_parity.map_or(false, |t| i.segment_no >= t),
                    Ok(i) => total_data.map_or(false, |t| i.segment_no >= t),
                    Err(_) => false,
                };
                if past {
                    surplus.push(name.clone());
                }
                !past
            });
        }

        let mut manifest = None;
        if slot.state != SlotState::Ready {
            slot.mark_ready_if_complete(now);
        }
        if slot.state == SlotState::Ready {
            if slot.integrity == Integrity::Requested {
                let name = slot.manifest_name();
                if slot.pending.remove(&name) {
                    surplus.push(name);
                }
                slot.integrity = Integrity::Unchecked;
            }
        } else {
            slot.state = SlotState::Assembling;
            if slot.integrity == Integrity::Unchecked && slot.is_recoverable() {
                let name = slot.manifest_name();
                slot.pending.insert(name.clone());
                slot.integrity = Integrity::Requested;
                manifest = Some(name);
            }
        }

        Some(Receipt {
            key,
            old_state,
            new_state: slot.state,
            playback_no: slot.playback_no,
            fetched_data: slot.data.len() as u32,
            fetched_parity: slot.parity.len() as u32,
            total_data: slot.total_data,
            total_parity: slot.total_parity,
            totals_learned,
            surplus,
            manifest,
            rejected: false,
        })
    }

    /// Check a slot's stored segments against its manifest. Segments that
    /// do not match are dropped from the slot. Segments arriving later are
    /// checked as they land. None if no slot is waiting for this manifest.
    pub fn manifest_arrived(&self, name: &Name, manifest: Manifest) -> Option<Verification> {
        let info = NamespaceInfo::classify(name).ok()?;
        if info.segment_class != SegmentClass::Manifest {
            return None;
        }
        let key = SlotKey::of(&info);
        let mut slots = self.lock();
        let slot = slots.get_mut(&key)?;
        if !slot.pending.remove(name) {
            return None;
        }

        let old_state = slot.state;
        let mut rejected = Vec::new();
        if slot.state != SlotState::Ready {
            for data in std::mem::take(&mut slot.unchecked) {
                if !manifest.has_data(&data) {
                    slot.discard(&data.name);
                    rejected.push(data.name);
                }
            }
            slot.integrity = if rejected.is_empty() {
                Integrity::Verified
            } else {
                Integrity::Failed
            };
            slot.manifest = Some(manifest);
            slot.mark_ready_if_complete(Instant::now());
        }

        Some(Verification {
            key,
            old_state,
            new_state: slot.state,
            playback_no: slot.playback_no,
            integrity: slot.integrity,
            rejected,
        })
    }

    /// Segments known to exist that were never requested.
    pub fn missing(&self, key: &SlotKey) -> Vec<Name> {
        let slots = self.lock();
        let Some(slot) = slots.get(key) else {
            return Vec::new();
        };
        let mut names = Vec::new();
        for seg in 0..slot.total_data.map(u64::from).unwrap_or(0) {
            let name = slot.data_name(seg);
            if !slot.data.contains_key(&seg) && !slot.pending.contains(&name) {
                names.push(name);
            }
        }
        for seg in 0..slot.total_parity.map(u64::from).unwrap_or(0) {
            let name = slot.parity_name(seg);
            if !slot.parity.contains_key(&seg) && !slot.pending.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Slot with the smallest playback number above `after`.
    pub fn next_playable(&self, after: Option<u64>) -> Option<Head> {
        self.lock()
            .iter()
            .filter_map(|(key, slot)| slot.playback_no.map(|p| (key, slot, p)))
            .filter(|(_, _, p)| after.map_or(true, |a| *p > a))
            .min_by_key(|(_, _, p)| *p)
            .map(|(key, slot, playback_no)| Head {
                key: key.clone(),
                playback_no,
                state: slot.state,
            })
    }

    /// Ready slot with the smallest playback number.
    pub fn next_ready(&self) -> Option<Head> {
        self.lock()
            .iter()
            .filter(|(_, slot)| slot.state == SlotState::Ready)
            .filter_map(|(key, slot)| slot.playback_no.map(|p| (key, p)))
            .min_by_key(|(_, p)| *p)
            .map(|(key, playback_no)| Head {
                key: key.clone(),
                playback_no,
                state: SlotState::Ready,
            })
    }

    /// Remove a Ready slot and put its sample together.
    pub fn take(&self, key: &SlotKey) -> Option<Assembled> {
        let slot = {
            let mut slots = self.lock();
            if slots.get(key)?.state != SlotState::Ready {
                return None;
            }
            slots.remove(key)?
        };

        let playback_no = slot.playback_no.unwrap_or(key.sample_no);
        let total_data = slot.total_data.unwrap_or(0);
        let total_parity = slot.total_parity.unwrap_or(0);
        match fec::recover(&slot.data, &slot.parity, total_data, total_parity) {
            Ok(recovered) => {
                let assembly_ms = match (slot.first_arrival, slot.ready_at) {
                    (Some(first), Some(ready)) => ready.duration_since(first).as_millis() as u64,
                    _ => 0,
                };
                Some(Assembled::Sample(AssembledSample {
                    key: key.clone(),
                    playback_no,
                    payload: recovered.payload,
                    common: slot.common,
                    rebuilt: recovered.rebuilt,
                    assembly_ms,
                }))
            }
            Err(error) => Some(Assembled::Unrecoverable {
                key: key.clone(),
                playback_no,
                error,
            }),
        }
    }

    /// Drop every slot with this playback number.
    pub fn skip(&self, playback_no: u64) -> Removed {
        self.remove_where(|slot| slot.playback_no == Some(playback_no))
    }

    /// Drop slots that can no longer be played.
    pub fn discard_through(&self, playback_no: u64) -> Removed {
        self.remove_where(|slot| slot.playback_no.map_or(false, |p| p <= playback_no))
    }

    fn remove_where<F: Fn(&BufferSlot) -> bool>(&self, doomed: F) -> Removed {
        let mut slots = self.lock();
        let keys: Vec<SlotKey> = slots
            .iter()
            .filter(|(_, slot)| doomed(slot))
            .map(|(k, _)| k.clone())
            .collect();
        let mut removed = Removed::default();
        for key in keys {
            if let Some(slot) = slots.remove(&key) {
                removed.slots += 1;
                removed.pending.extend(slot.pending);
            }
        }
        removed
    }

    pub fn occupancy(&self) -> Occupancy {
        let slots = self.lock();
        let mut occ = Occupancy::default();
        for slot in slots.values() {
            match slot.state {
                SlotState::New => occ.new += 1,
                SlotState::Assembling => occ.assembling += 1,
                SlotState::Ready => {
                    occ.ready += 1;
                    occ.ready_ms += slot.duration_ms();
                }
            }
        }
        occ
    }

    pub fn state(&self, key: &SlotKey) -> Option<SlotState> {
        self.lock().get(key).map(|s| s.state)
    }

    pub fn integrity(&self, key: &SlotKey) -> Option<Integrity> {
        self.lock().get(key).map(|s| s.integrity)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every slot. Returns requests that were still pending.
    pub fn reset(&self) -> Vec<Name> {
        let mut slots = self.lock();
        let pending = slots.values_mut().flat_map(|s| s.pending.drain()).collect();
        slots.clear();
        pending
    }
}
