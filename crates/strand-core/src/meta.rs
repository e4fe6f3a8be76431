//! Stream and thread meta packets.
//!
//! Producers republish these periodically under versioned names. A
//! consumer fetches the newest version to learn which threads exist and
//! where each thread currently is, so it can start fetching near the head.

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::namespace::StreamType;
use crate::wire::{ImmutablePacket, MutablePacket, WireError};

const THREAD_TAG: u8 = b't';
const SYNC_TAG: u8 = b's';

// ── Stream meta ───────────────────────────────────────────────────────────────

/// Threads published under a stream, plus streams it should be synced with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamMeta {
    pub timestamp: u64,
    pub threads: Vec<String>,
    pub sync_streams: Vec<String>,
}

impl StreamMeta {
    pub fn new(timestamp: u64) -> Self {
        Self {
            timestamp,
            ..Default::default()
        }
    }

    pub fn with_threads<I, S>(timestamp: u64, threads: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            timestamp,
            threads: threads.into_iter().map(Into::into).collect(),
            sync_streams: Vec::new(),
        }
    }

    pub fn add_thread(&mut self, name: impl Into<String>) {
        self.threads.push(name.into());
    }

    pub fn add_sync_stream(&mut self, name: impl Into<String>) {
        self.sync_streams.push(name.into());
    }

    pub fn encode(&self) -> Result<Vec<u8>, MetaError> {
        let mut packet = MutablePacket::new(&[]);
        packet.add_blob(&self.timestamp.to_le_bytes())?;
        for (tag, names) in [(THREAD_TAG, &self.threads), (SYNC_TAG, &self.sync_streams)] {
            for name in names {
                let mut blob = Vec::with_capacity(name.len() + 1);
                blob.push(tag);
                blob.extend_from_slice(name.as_bytes());
                packet.add_blob(&blob)?;
            }
        }
        Ok(packet.into_vec())
    }

    pub fn decode(bytes: Bytes) -> Result<Self, MetaError> {
        let packet = valid(bytes)?;
        let mut blobs = packet.blobs();
        let ts = blobs.next().ok_or(MetaError::Missing("timestamp"))?;
        let ts: [u8; 8] = ts.try_into().map_err(|_| MetaError::Size {
            field: "timestamp",
            expected: 8,
            actual: ts.len(),
        })?;

        let mut meta = StreamMeta::new(u64::from_le_bytes(ts));
        for blob in blobs {
            let (tag, name) = blob.split_first().ok_or(MetaError::Missing("tag"))?;
            let name = std::str::from_utf8(name).map_err(|_| MetaError::Utf8)?;
            match *tag {
                THREAD_TAG => meta.add_thread(name),
                SYNC_TAG => meta.add_sync_stream(name),
                other => return Err(MetaError::UnknownTag(other)),
            }
        }
        Ok(meta)
    }
}

// ── Thread meta ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct AudioMetaWire {
    rate: f64,
    bundle_no: u64,
}

assert_eq_size!(AudioMetaWire, [u8; 16]);

#[derive(Debug, Clone, PartialEq)]
pub struct AudioThreadMeta {
    /// Bundles per second.
    pub rate: f64,
    /// Latest published bundle.
    pub bundle_no: u64,
    pub codec: String,
}

impl AudioThreadMeta {
    pub fn encode(&self) -> Result<Vec<u8>, MetaError> {
        let wire = AudioMetaWire {
            rate: self.rate,
            bundle_no: self.bundle_no,
        };
        let mut packet = MutablePacket::new(&[]);
        packet.add_blob(wire.as_bytes())?;
        packet.add_blob(self.codec.as_bytes())?;
        Ok(packet.into_vec())
    }

    pub fn decode(bytes: Bytes) -> Result<Self, MetaError> {
        let packet = valid(bytes)?;
        let wire = sized::<AudioMetaWire>(packet.blob(0), "audio meta")?;
        let codec = packet.blob(1).ok_or(MetaError::Missing("codec"))?;
        Ok(Self {
            rate: wire.rate,
            bundle_no: wire.bundle_no,
            codec: std::str::from_utf8(codec)
                .map_err(|_| MetaError::Utf8)?
                .to_string(),
        })
    }
}

/// Average segment counts per sample, used to size the first request
/// batch before the real counts are known.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SegmentsInfo {
    pub delta_avg_segments: f64,
    pub delta_avg_parity: f64,
    pub key_avg_segments: f64,
    pub key_avg_parity: f64,
}

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct VideoMetaWire {
    rate: f64,
    delta_seq_no: u64,
    key_seq_no: u64,
    gop_pos: u8,
    gop: u32,
    bitrate_kbps: u32,
    width: u32,
    height: u32,
    delta_avg_segments: f64,
    delta_avg_parity: f64,
    key_avg_segments: f64,
    key_avg_parity: f64,
}

assert_eq_size!(VideoMetaWire, [u8; 73]);

#[derive(Debug, Clone, PartialEq)]
pub struct VideoThreadMeta {
    /// Frames per second.
    pub rate: f64,
    pub delta_seq_no: u64,
    pub key_seq_no: u64,
    /// Position of the latest delta frame inside its GOP.
    pub gop_pos: u8,
    pub gop: u32,
    pub bitrate_kbps: u32,
    pub width: u32,
    pub height: u32,
    pub segments: SegmentsInfo,
}

impl VideoThreadMeta {
    pub fn encode(&self) -> Result<Vec<u8>, MetaError> {
        let wire = VideoMetaWire {
            rate: self.rate,
            delta_seq_no: self.delta_seq_no,
            key_seq_no: self.key_seq_no,
            gop_pos: self.gop_pos,
            gop: self.gop,
            bitrate_kbps: self.bitrate_kbps,
            width: self.width,
            height: self.height,
            delta_avg_segments: self.segments.delta_avg_segments,
            delta_avg_parity: self.segments.delta_avg_parity,
            key_avg_segments: self.segments.key_avg_segments,
            key_avg_parity: self.segments.key_avg_parity,
        };
        let mut packet = MutablePacket::new(&[]);
        packet.add_blob(wire.as_bytes())?;
        Ok(packet.into_vec())
    }

    pub fn decode(bytes: Bytes) -> Result<Self, MetaError> {
        let packet = valid(bytes)?;
        let w = sized::<VideoMetaWire>(packet.blob(0), "video meta")?;
        Ok(Self {
            rate: w.rate,
            delta_seq_no: w.delta_seq_no,
            key_seq_no: w.key_seq_no,
            gop_pos: w.gop_pos,
            gop: w.gop,
            bitrate_kbps: w.bitrate_kbps,
            width: w.width,
            height: w.height,
            segments: SegmentsInfo {
                delta_avg_segments: w.delta_avg_segments,
                delta_avg_parity: w.delta_avg_parity,
                key_avg_segments: w.key_avg_segments,
                key_avg_parity: w.key_avg_parity,
            },
        })
    }
}

/// Thread meta of either stream type.
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadMeta {
    Audio(AudioThreadMeta),
    Video(VideoThreadMeta),
}

impl ThreadMeta {
    pub fn decode(stream_type: StreamType, bytes: Bytes) -> Result<Self, MetaError> {
        match stream_type {
            StreamType::Audio => AudioThreadMeta::decode(bytes).map(ThreadMeta::Audio),
            StreamType::Video => VideoThreadMeta::decode(bytes).map(ThreadMeta::Video),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, MetaError> {
        match self {
            ThreadMeta::Audio(m) => m.encode(),
            ThreadMeta::Video(m) => m.encode(),
        }
    }

    pub fn stream_type(&self) -> StreamType {
        match self {
            ThreadMeta::Audio(_) => StreamType::Audio,
            ThreadMeta::Video(_) => StreamType::Video,
        }
    }

    pub fn rate(&self) -> f64 {
        match self {
            ThreadMeta::Audio(m) => m.rate,
            ThreadMeta::Video(m) => m.rate,
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn valid(bytes: Bytes) -> Result<ImmutablePacket, MetaError> {
    let packet = ImmutablePacket::from_wire(bytes);
    if !packet.is_valid() {
        return Err(MetaError::Wire(WireError::InvalidPacket));
    }
    Ok(packet)
}

fn sized<T: FromBytes>(blob: Option<&[u8]>, field: &'static str) -> Result<T, MetaError> {
    let blob = blob.ok_or(MetaError::Missing(field))?;
    T::read_from(blob).ok_or(MetaError::Size {
        field,
        expected: std::mem::size_of::<T>(),
        actual: blob.len(),
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetaError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("meta is missing {0}")]
    Missing(&'static str),

    #[error("{field} is {actual} bytes, expected {expected}")]
    Size {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("meta string is not utf-8")]
    Utf8,

    #[error("unknown meta tag {0:#04x}")]
    UnknownTag(u8),
}
