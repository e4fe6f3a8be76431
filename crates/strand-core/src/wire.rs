//! Strand wire format: the blob container and the fixed headers layered on it.
//!
//! A packet on the wire is:
//!
//!   [blob_count:1][{len:2 LE, blob:len}]*[payload:rest]
//!
//! Packets come in two flavours sharing one shape. `MutablePacket` owns a
//! `Vec<u8>` and can grow; it is what a producer builds. `ImmutablePacket`
//! holds a shared `Bytes` view and is what the consumer gets from the
//! network. Received bytes are never mutated in place, so every mutating
//! method exists only on the `Vec<u8>` flavour.
//!
//! Every mutation re-scans the whole buffer. Blob count is capped at 255,
//! so this stays cheap, and it keeps encode/decode symmetric by
//! construction.
//!
//! Header structs are #[repr(C, packed)] with zerocopy derives, the same
//! way every other on-wire struct in Strand is declared. Changing a field
//! here changes the protocol.

use std::marker::PhantomData;
use std::ops::Range;

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::crc::crc16;

// ── Limits ────────────────────────────────────────────────────────────────────

/// Maximum number of blobs in one packet (the count is a single byte).
pub const MAX_BLOBS: usize = 255;

/// Maximum length of a single blob (the length prefix is two bytes).
pub const MAX_BLOB_LEN: usize = 65535;

/// Bytes of overhead a blob of any length adds to a packet.
pub const BLOB_OVERHEAD: usize = 2;

/// Most segments, data and parity together, one sample may be cut into.
/// A sample's manifest lists every segment as one blob.
pub const MAX_SAMPLE_SEGMENTS: u32 = MAX_BLOBS as u32;

// ── Storage ───────────────────────────────────────────────────────────────────

/// Backing storage for a packet. Implemented for `Vec<u8>` (owned, mutable)
/// and `Bytes` (shared, read-only).
pub trait Storage: AsRef<[u8]> {}

impl Storage for Vec<u8> {}
impl Storage for Bytes {}

// ── Data Packet ───────────────────────────────────────────────────────────────

/// Blob list plus payload over some storage.
#[derive(Debug, Clone)]
pub struct DataPacket<S> {
    data: S,
    blobs: Vec<Range<usize>>,
    payload_start: usize,
    valid: bool,
}

/// Packet being prepared for sending.
pub type MutablePacket = DataPacket<Vec<u8>>;

/// Packet received from the network.
pub type ImmutablePacket = DataPacket<Bytes>;

/// Walk the blob table. Returns blob ranges and the payload offset, or None
/// if any declared length runs past the end of the buffer.
fn scan(bytes: &[u8]) -> Option<(Vec<Range<usize>>, usize)> {
    let (&count, _) = bytes.split_first()?;
    let mut blobs = Vec::with_capacity(count as usize);
    let mut pos = 1usize;

    for _ in 0..count {
        if pos + BLOB_OVERHEAD > bytes.len() {
            return None;
        }
        let len = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]) as usize;
        pos += BLOB_OVERHEAD;
        if pos + len > bytes.len() {
            return None;
        }
        blobs.push(pos..pos + len);
        pos += len;
    }

    Some((blobs, pos))
}

impl<S: Storage> DataPacket<S> {
    fn scanned(data: S) -> Self {
        let mut packet = Self {
            data,
            blobs: Vec::new(),
            payload_start: 0,
            valid: false,
        };
        packet.reinit();
        packet
    }

    fn reinit(&mut self) {
        match scan(self.data.as_ref()) {
            Some((blobs, payload_start)) => {
                self.blobs = blobs;
                self.payload_start = payload_start;
                self.valid = true;
            }
            None => {
                // No partial trust: an invalid packet exposes nothing.
                self.blobs.clear();
                self.payload_start = self.data.as_ref().len();
                self.valid = false;
            }
        }
    }

    /// False if the blob table overruns the buffer or the buffer is empty.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    pub fn blob(&self, index: usize) -> Option<&[u8]> {
        self.blobs
            .get(index)
            .map(|range| &self.data.as_ref()[range.clone()])
    }

    /// Blobs in insertion order.
    pub fn blobs(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.blobs
            .iter()
            .map(move |range| &self.data.as_ref()[range.clone()])
    }

    /// Payload bytes. Empty for an invalid packet.
    pub fn payload(&self) -> &[u8] {
        &self.data.as_ref()[self.payload_start..]
    }

    /// The full encoded packet.
    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    pub fn wire_len(&self) -> usize {
        self.data.as_ref().len()
    }

    /// Wire length of a packet holding `payload_len` bytes and blobs of the
    /// given lengths.
    pub fn wire_length(payload_len: usize, blob_lens: &[usize]) -> usize {
        1 + payload_len + blob_lens.iter().map(|l| l + BLOB_OVERHEAD).sum::<usize>()
    }
}

impl DataPacket<Vec<u8>> {
    /// Fresh packet with no blobs around `payload`.
    pub fn new(payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(1 + payload.len());
        data.push(0);
        data.extend_from_slice(payload);
        Self::scanned(data)
    }

    /// Wrap already-encoded bytes so more blobs can be appended.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self::scanned(data)
    }

    /// Insert a blob right before the payload.
    pub fn add_blob(&mut self, blob: &[u8]) -> Result<(), WireError> {
        if !self.valid {
            return Err(WireError::InvalidPacket);
        }
        if self.blobs.len() >= MAX_BLOBS {
            return Err(WireError::TooManyBlobs);
        }
        if blob.len() > MAX_BLOB_LEN {
            return Err(WireError::BlobTooLarge(blob.len()));
        }

        let len = (blob.len() as u16).to_le_bytes();
        let at = self.payload_start;
        self.data
            .splice(at..at, len.iter().chain(blob.iter()).copied());
        self.data[0] += 1;
        self.reinit();
        Ok(())
    }

    /// CRC-16 over the whole encoded packet.
    pub fn crc(&self) -> u16 {
        crc16(&self.data)
    }

    /// Give up mutability without copying.
    pub fn freeze(self) -> ImmutablePacket {
        DataPacket::scanned(Bytes::from(self.data))
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl DataPacket<Bytes> {
    pub fn from_wire(data: Bytes) -> Self {
        Self::scanned(data)
    }

    /// Payload as a shared slice of the received buffer.
    pub fn payload_bytes(&self) -> Bytes {
        self.data.slice(self.payload_start..)
    }

    pub fn blob_bytes(&self, index: usize) -> Option<Bytes> {
        self.blobs.get(index).map(|range| self.data.slice(range.clone()))
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

/// Encode blobs and a payload into one buffer.
pub fn encode(blobs: &[&[u8]], payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut packet = MutablePacket::new(payload);
    for blob in blobs {
        packet.add_blob(blob)?;
    }
    Ok(packet.into_vec())
}

/// Decode a received buffer. Check `is_valid()` before using the result.
pub fn decode(bytes: Bytes) -> ImmutablePacket {
    ImmutablePacket::from_wire(bytes)
}

// ── Header Packet ─────────────────────────────────────────────────────────────

/// Anything that can sit in the header slot: fixed size, no padding.
pub trait WireHeader: AsBytes + FromBytes + FromZeroes + Copy {}

impl<T: AsBytes + FromBytes + FromZeroes + Copy> WireHeader for T {}

/// A data packet whose last blob is a fixed-size header.
///
/// The header is set once. A second `set_header` is ignored and returns
/// false; it never touches the bytes of the first header.
#[derive(Debug, Clone)]
pub struct HeaderPacket<H, S> {
    packet: DataPacket<S>,
    header_set: bool,
    _header: PhantomData<H>,
}

pub type MutableHeaderPacket<H> = HeaderPacket<H, Vec<u8>>;
pub type ImmutableHeaderPacket<H> = HeaderPacket<H, Bytes>;

impl<H: WireHeader, S: Storage> HeaderPacket<H, S> {
    /// Valid only once a correctly sized header is present.
    pub fn is_valid(&self) -> bool {
        self.packet.is_valid() && self.header_set
    }

    pub fn is_header_set(&self) -> bool {
        self.header_set
    }

    /// The header. Fails if none has been set.
    pub fn header(&self) -> Result<H, WireError> {
        if !self.header_set {
            return Err(WireError::HeaderMissing);
        }
        let last = self
            .packet
            .blob(self.packet.blob_count().saturating_sub(1))
            .ok_or(WireError::HeaderMissing)?;
        H::read_from(last).ok_or(WireError::HeaderSize {
            expected: std::mem::size_of::<H>(),
            actual: last.len(),
        })
    }

    /// Blobs preceding the header.
    pub fn blobs(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let n = self.user_blob_count();
        self.packet.blobs().take(n)
    }

    pub fn blob(&self, index: usize) -> Option<&[u8]> {
        if index < self.user_blob_count() {
            self.packet.blob(index)
        } else {
            None
        }
    }

    pub fn user_blob_count(&self) -> usize {
        if self.header_set {
            self.packet.blob_count() - 1
        } else {
            self.packet.blob_count()
        }
    }

    pub fn payload(&self) -> &[u8] {
        self.packet.payload()
    }

    pub fn packet(&self) -> &DataPacket<S> {
        &self.packet
    }

    /// Wire overhead of the header blob.
    pub fn header_wire_len() -> usize {
        std::mem::size_of::<H>() + BLOB_OVERHEAD
    }
}

impl<H: WireHeader> HeaderPacket<H, Vec<u8>> {
    pub fn new(payload: &[u8]) -> Self {
        Self {
            packet: MutablePacket::new(payload),
            header_set: false,
            _header: PhantomData,
        }
    }

    pub fn with_header(header: &H, payload: &[u8]) -> Result<Self, WireError> {
        let mut packet = Self::new(payload);
        packet.set_header(header)?;
        Ok(packet)
    }

    /// Blobs must go in before the header so the header stays last.
    pub fn add_blob(&mut self, blob: &[u8]) -> Result<(), WireError> {
        if self.header_set {
            return Err(WireError::HeaderAlreadySet);
        }
        self.packet.add_blob(blob)
    }

    /// Append the header. Returns Ok(false) if a header was already set,
    /// leaving the packet untouched.
    pub fn set_header(&mut self, header: &H) -> Result<bool, WireError> {
        if self.header_set {
            return Ok(false);
        }
        self.packet.add_blob(header.as_bytes())?;
        self.header_set = true;
        Ok(true)
    }

    pub fn crc(&self) -> u16 {
        self.packet.crc()
    }

    pub fn freeze(self) -> ImmutableHeaderPacket<H> {
        HeaderPacket {
            packet: self.packet.freeze(),
            header_set: self.header_set,
            _header: PhantomData,
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.packet.into_vec()
    }
}

impl<H: WireHeader> HeaderPacket<H, Bytes> {
    /// Interpret received bytes. The last blob must be exactly one header.
    pub fn from_wire(data: Bytes) -> Self {
        Self::from_packet(ImmutablePacket::from_wire(data))
    }

    pub fn from_packet(packet: ImmutablePacket) -> Self {
        let header_set = packet.is_valid()
            && packet
                .blob(packet.blob_count().wrapping_sub(1))
                .map(|b| b.len() == std::mem::size_of::<H>())
                .unwrap_or(false);
        Self {
            packet,
            header_set,
            _header: PhantomData,
        }
    }

    pub fn payload_bytes(&self) -> Bytes {
        self.packet.payload_bytes()
    }
}

// ── Headers ───────────────────────────────────────────────────────────────────

/// Carried by segment 0 of every sample, ahead of the segment header.
///
/// Wire size: 24 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct CommonHeader {
    /// Producer's sample rate at publish time (samples per second).
    pub sample_rate: f64,
    /// Producer's monotonic publish timestamp.
    pub publish_timestamp_ms: i64,
    /// Producer's wall-clock publish time, seconds since epoch.
    pub publish_unix_timestamp: f64,
}

assert_eq_size!(CommonHeader, [u8; 24]);

/// Carried by every segment.
///
/// Wire size: 20 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct DataSegmentHeader {
    /// Nonce of the request this segment answered.
    pub request_nonce: i32,
    /// When the producer saw that request (producer clock, ms).
    pub request_arrival_ms: f64,
    /// Time the producer spent generating the data after the request arrived.
    pub generation_delay_ms: f64,
}

assert_eq_size!(DataSegmentHeader, [u8; 20]);

/// Video segments extend the segment header with framing information.
///
/// Wire size: 44 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct VideoSegmentHeader {
    pub request_nonce: i32,
    pub request_arrival_ms: f64,
    pub generation_delay_ms: f64,
    /// Number of data segments in the frame.
    pub total_segments: i32,
    /// Position of the frame in playback order across key and delta frames.
    pub playback_no: i64,
    /// Sequence number in the other class (delta for a key frame and vice versa).
    pub paired_seq_no: i64,
    /// Number of parity segments published for the frame.
    pub parity_segments: i32,
}

assert_eq_size!(VideoSegmentHeader, [u8; 44]);

/// Read access shared by both segment header layouts.
pub trait SegmentHeader: WireHeader {
    fn base(&self) -> DataSegmentHeader;

    /// Same header with the common segment fields replaced.
    fn with_base(self, base: DataSegmentHeader) -> Self;

    fn request_nonce(&self) -> i32 {
        let base = self.base();
        base.request_nonce
    }

    fn generation_delay_ms(&self) -> f64 {
        let base = self.base();
        base.generation_delay_ms
    }
}

impl SegmentHeader for DataSegmentHeader {
    fn base(&self) -> DataSegmentHeader {
        *self
    }

    fn with_base(self, base: DataSegmentHeader) -> Self {
        base
    }
}

impl SegmentHeader for VideoSegmentHeader {
    fn base(&self) -> DataSegmentHeader {
        DataSegmentHeader {
            request_nonce: self.request_nonce,
            request_arrival_ms: self.request_arrival_ms,
            generation_delay_ms: self.generation_delay_ms,
        }
    }

    fn with_base(self, base: DataSegmentHeader) -> Self {
        Self {
            request_nonce: base.request_nonce,
            request_arrival_ms: base.request_arrival_ms,
            generation_delay_ms: base.generation_delay_ms,
            ..self
        }
    }
}

impl DataSegmentHeader {
    pub fn new(request_nonce: i32, request_arrival_ms: f64, generation_delay_ms: f64) -> Self {
        Self {
            request_nonce,
            request_arrival_ms,
            generation_delay_ms,
        }
    }
}

impl VideoSegmentHeader {
    pub fn extend(
        base: DataSegmentHeader,
        total_segments: i32,
        playback_no: i64,
        paired_seq_no: i64,
        parity_segments: i32,
    ) -> Self {
        Self {
            request_nonce: base.request_nonce,
            request_arrival_ms: base.request_arrival_ms,
            generation_delay_ms: base.generation_delay_ms,
            total_segments,
            playback_no,
            paired_seq_no,
            parity_segments,
        }
    }
}

/// Segment 0 carries the common header as a regular blob ahead of the
/// segment header. Returns None if the blob is absent or the wrong size.
pub fn common_header<S: Storage, H: WireHeader>(
    packet: &HeaderPacket<H, S>,
) -> Option<CommonHeader> {
    packet
        .blob(0)
        .and_then(CommonHeader::read_from)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("packet is not valid")]
    InvalidPacket,

    #[error("packet already holds {} blobs", MAX_BLOBS)]
    TooManyBlobs,

    #[error("blob length {0} exceeds maximum {}", MAX_BLOB_LEN)]
    BlobTooLarge(usize),

    #[error("header has not been set")]
    HeaderMissing,

    #[error("header already set, blobs must be added before it")]
    HeaderAlreadySet,

    #[error("header blob is {actual} bytes, expected {expected}")]
    HeaderSize { expected: usize, actual: usize },

    #[error("sample needs {0} segments, at most {} allowed", MAX_SAMPLE_SEGMENTS)]
    TooManySegments(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
