//! Segment descriptor: a received piece of data, classified by its name
//! and tied to the request that fetched it.

use bytes::Bytes;
use strand_core::namespace::{NamespaceInfo, SampleClass, SegmentClass, StreamType};
use strand_core::wire::{
    common_header, CommonHeader, DataSegmentHeader, ImmutableHeaderPacket, SegmentHeader,
    VideoSegmentHeader, MAX_SAMPLE_SEGMENTS,
};
use strand_core::{Data, Name, Request};

/// A parity segment counts for this fraction of a data segment.
pub const PARITY_WEIGHT: f64 = 0.5;

#[derive(Debug, Clone)]
enum SegmentPacket {
    Audio(ImmutableHeaderPacket<DataSegmentHeader>),
    Video(ImmutableHeaderPacket<VideoSegmentHeader>),
    Opaque,
}

/// Read-only view over one received segment.
///
/// An unrecognised name or a data/parity segment whose content does not
/// parse gives an invalid descriptor. Invalid descriptors must not reach
/// the buffer.
#[derive(Debug, Clone)]
pub struct WireSegment {
    data: Data,
    request_nonce: u32,
    info: Option<NamespaceInfo>,
    packet: SegmentPacket,
}

impl WireSegment {
    pub fn new(data: Data, request: &Request) -> Self {
        Self::with_nonce(data, request.nonce)
    }

    pub fn with_nonce(data: Data, request_nonce: u32) -> Self {
        let info = NamespaceInfo::classify(&data.name).ok();
        let packet = match &info {
            Some(i) if matches!(i.segment_class, SegmentClass::Data | SegmentClass::Parity) => {
                match i.stream_type {
                    StreamType::Audio => {
                        SegmentPacket::Audio(ImmutableHeaderPacket::from_wire(data.content.clone()))
                    }
                    StreamType::Video => {
                        SegmentPacket::Video(ImmutableHeaderPacket::from_wire(data.content.clone()))
                    }
                }
            }
            _ => SegmentPacket::Opaque,
        };
        Self {
            data,
            request_nonce,
            info,
            packet,
        }
    }

    pub fn is_valid(&self) -> bool {
        match (&self.info, &self.packet) {
            (None, _) => false,
            (Some(_), SegmentPacket::Audio(p)) => p.is_valid() && self.has_sane_geometry(),
            (Some(_), SegmentPacket::Video(p)) => p.is_valid() && self.has_sane_geometry(),
            (Some(_), SegmentPacket::Opaque) => true,
        }
    }

    /// Sample totals this segment claims fit within `MAX_SAMPLE_SEGMENTS`
    /// and leave room for the segment itself.
    fn has_sane_geometry(&self) -> bool {
        let limit = i64::from(MAX_SAMPLE_SEGMENTS);
        if let Some(h) = self.video_header() {
            let (total, parity) = (i64::from(h.total_segments), i64::from(h.parity_segments));
            if total < 0 || parity < 0 || parity > total || total + parity > limit {
                return false;
            }
        }
        if let Some(last) = self.data.final_block_id {
            if last >= u64::from(MAX_SAMPLE_SEGMENTS) {
                return false;
            }
        }
        let total = if self.is_parity() {
            self.total_parity_segments()
        } else {
            self.total_data_segments()
        };
        total.map_or(true, |t| self.segment_no() < u64::from(t))
    }

    pub fn info(&self) -> Option<&NamespaceInfo> {
        self.info.as_ref()
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    pub fn name(&self) -> &Name {
        &self.data.name
    }

    pub fn request_nonce(&self) -> u32 {
        self.request_nonce
    }

    pub fn base_prefix(&self) -> Option<&Name> {
        self.info.as_ref().map(|i| &i.base_prefix)
    }

    pub fn api_version(&self) -> Option<u64> {
        self.info.as_ref().map(|i| i.api_version)
    }

    pub fn stream_type(&self) -> Option<StreamType> {
        self.info.as_ref().map(|i| i.stream_type)
    }

    pub fn stream_name(&self) -> &str {
        self.info.as_ref().map(|i| i.stream_name.as_str()).unwrap_or("")
    }

    pub fn thread_name(&self) -> &str {
        self.info.as_ref().map(|i| i.thread_name.as_str()).unwrap_or("")
    }

    pub fn is_meta(&self) -> bool {
        self.info.as_ref().map(|i| i.is_meta).unwrap_or(false)
    }

    pub fn sample_no(&self) -> u64 {
        self.info.as_ref().map(|i| i.sample_no).unwrap_or(0)
    }

    pub fn sample_class(&self) -> SampleClass {
        self.info
            .as_ref()
            .map(|i| i.sample_class)
            .unwrap_or(SampleClass::Unknown)
    }

    pub fn segment_no(&self) -> u64 {
        self.info.as_ref().map(|i| i.segment_no).unwrap_or(0)
    }

    pub fn segment_class(&self) -> SegmentClass {
        self.info
            .as_ref()
            .map(|i| i.segment_class)
            .unwrap_or(SegmentClass::Unknown)
    }

    pub fn is_parity(&self) -> bool {
        self.segment_class() == SegmentClass::Parity
    }

    /// Non-parity segment 0 carries the sample's common header.
    pub fn is_packet_header_segment(&self) -> bool {
        self.segment_class() == SegmentClass::Data && self.segment_no() == 0
    }

    /// Audio plays in sample order; video carries its playback number in
    /// the segment header since key and delta frames are numbered apart.
    pub fn playback_no(&self) -> Option<u64> {
        match &self.packet {
            SegmentPacket::Video(p) => p.header().ok().map(|h| {
                let n = h.playback_no;
                n.max(0) as u64
            }),
            SegmentPacket::Audio(_) => Some(self.sample_no()),
            SegmentPacket::Opaque => None,
        }
    }

    pub fn header(&self) -> Option<DataSegmentHeader> {
        match &self.packet {
            SegmentPacket::Audio(p) => p.header().ok(),
            SegmentPacket::Video(p) => p.header().ok().map(|h| h.base()),
            SegmentPacket::Opaque => None,
        }
    }

    pub fn video_header(&self) -> Option<VideoSegmentHeader> {
        match &self.packet {
            SegmentPacket::Video(p) => p.header().ok(),
            _ => None,
        }
    }

    /// Common header. Present on segment 0 and on parity segments.
    pub fn packet_header(&self) -> Option<CommonHeader> {
        let carries = self.is_packet_header_segment() || self.is_parity();
        if !carries {
            return None;
        }
        match &self.packet {
            SegmentPacket::Audio(p) => common_header(p),
            SegmentPacket::Video(p) => common_header(p),
            SegmentPacket::Opaque => None,
        }
    }

    /// True iff the producer answered this very request rather than a
    /// cache answering an earlier one.
    pub fn is_original(&self) -> bool {
        self.header()
            .map(|h| h.request_nonce() as u32 == self.request_nonce)
            .unwrap_or(false)
    }

    pub fn generation_delay_ms(&self) -> f64 {
        self.header().map(|h| h.generation_delay_ms()).unwrap_or(0.0)
    }

    /// Fraction of the sample this segment contributes.
    pub fn share_size(&self, total_data_slices: u32) -> f64 {
        if total_data_slices == 0 {
            return 0.0;
        }
        let weight = if self.is_parity() { PARITY_WEIGHT } else { 1.0 };
        weight / total_data_slices as f64
    }

    /// Number of data segments in the sample, if this segment says and the
    /// figure is within `MAX_SAMPLE_SEGMENTS`.
    pub fn total_data_segments(&self) -> Option<u32> {
        if let Some(h) = self.video_header() {
            let total = h.total_segments;
            if total > 0 {
                return u32::try_from(total)
                    .ok()
                    .filter(|t| *t <= MAX_SAMPLE_SEGMENTS);
            }
        }
        self.data
            .final_block_id
            .and_then(|last| u32::try_from(last).ok())
            .and_then(|last| last.checked_add(1))
            .filter(|t| *t <= MAX_SAMPLE_SEGMENTS)
    }

    /// Number of parity segments in the sample, if this segment says.
    pub fn total_parity_segments(&self) -> Option<u32> {
        self.video_header().and_then(|h| {
            let n = h.parity_segments;
            u32::try_from(n).ok().filter(|n| *n <= MAX_SAMPLE_SEGMENTS)
        })
    }

    /// The slice of sample bytes this segment carries.
    pub fn payload(&self) -> Bytes {
        match &self.packet {
            SegmentPacket::Audio(p) => p.payload_bytes(),
            SegmentPacket::Video(p) => p.payload_bytes(),
            SegmentPacket::Opaque => self.data.content.clone(),
        }
    }
}
