//! Producer side: cut a sample into named segments.
//!
//! Consumers never call this in production, but the simulated producer in
//! the integration tests does, and an in-process producer can.

use bytes::Bytes;
use strand_core::manifest::Manifest;
use strand_core::namespace::{SampleClass, StreamType};
use strand_core::wire::{
    CommonHeader, DataSegmentHeader, ImmutableHeaderPacket, MutableHeaderPacket, SegmentHeader,
    VideoSegmentHeader, WireError, MAX_SAMPLE_SEGMENTS,
};
use strand_core::{Data, StreamNamespace};
use zerocopy::AsBytes;

use crate::fec;

/// Request-dependent fields written into every segment header.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SegmentStamp {
    pub nonce: i32,
    pub arrival_ms: f64,
    pub generation_delay_ms: f64,
}

impl SegmentStamp {
    /// Stamp for data generated in answer to a pending request.
    pub fn answering(nonce: i32, arrival_ms: f64, generation_delay_ms: f64) -> Self {
        Self {
            nonce,
            arrival_ms,
            generation_delay_ms,
        }
    }

    fn header(&self) -> DataSegmentHeader {
        DataSegmentHeader::new(self.nonce, self.arrival_ms, self.generation_delay_ms)
    }
}

/// One sample as handed over by the encoder.
#[derive(Debug, Clone)]
pub struct SampleSpec<'a> {
    pub class: SampleClass,
    pub sample_no: u64,
    pub playback_no: u64,
    pub paired_seq_no: u64,
    pub payload: &'a [u8],
    pub common: CommonHeader,
}

impl<'a> SampleSpec<'a> {
    pub fn new(class: SampleClass, sample_no: u64, payload: &'a [u8]) -> Self {
        Self {
            class,
            sample_no,
            playback_no: sample_no,
            paired_seq_no: 0,
            payload,
            common: CommonHeader {
                sample_rate: 0.0,
                publish_timestamp_ms: 0,
                publish_unix_timestamp: 0.0,
            },
        }
    }

    pub fn playback(mut self, playback_no: u64, paired_seq_no: u64) -> Self {
        self.playback_no = playback_no;
        self.paired_seq_no = paired_seq_no;
        self
    }

    pub fn rate(mut self, sample_rate: f64) -> Self {
        self.common.sample_rate = sample_rate;
        self
    }

    pub fn published_at(mut self, timestamp_ms: i64, unix_timestamp: f64) -> Self {
        self.common.publish_timestamp_ms = timestamp_ms;
        self.common.publish_unix_timestamp = unix_timestamp;
        self
    }
}

/// Everything published for one sample.
#[derive(Debug, Clone)]
pub struct PublishedSample {
    pub data: Vec<Data>,
    pub parity: Vec<Data>,
    pub manifest: Data,
}

impl PublishedSample {
    /// Data segments, then parity segments.
    pub fn segments(&self) -> impl Iterator<Item = &Data> + '_ {
        self.data.iter().chain(self.parity.iter())
    }
}

#[derive(Debug, Clone)]
pub struct SampleSlicer {
    namespace: StreamNamespace,
    thread: String,
    slice_size: usize,
    parity_ratio: f64,
}

impl SampleSlicer {
    /// `slice_size` is the payload carried per segment.
    pub fn new(namespace: StreamNamespace, thread: &str, slice_size: usize) -> Self {
        Self {
            namespace,
            thread: thread.to_string(),
            slice_size: slice_size.max(1),
            parity_ratio: 0.0,
        }
    }

    pub fn with_parity_ratio(mut self, ratio: f64) -> Self {
        self.parity_ratio = ratio;
        self
    }

    pub fn namespace(&self) -> &StreamNamespace {
        &self.namespace
    }

    pub fn thread(&self) -> &str {
        &self.thread
    }

    pub fn slice(
        &self,
        sample: &SampleSpec<'_>,
        stamp: SegmentStamp,
    ) -> Result<PublishedSample, WireError> {
        let mut slices: Vec<&[u8]> = sample.payload.chunks(self.slice_size).collect();
        if slices.is_empty() {
            slices.push(&[]);
        }
        let parity_count = fec::parity_count(slices.len(), self.parity_ratio);
        if slices.len() + parity_count > MAX_SAMPLE_SEGMENTS as usize {
            return Err(WireError::TooManySegments(slices.len() + parity_count));
        }
        let parity_payloads = fec::encode(&slices, parity_count);
        let totals = (slices.len() as i32, parity_payloads.len() as i32);
        let last_block = slices.len() as u64 - 1;

        let mut data = Vec::with_capacity(slices.len());
        for (seg, slice) in slices.iter().enumerate() {
            let seg = seg as u64;
            let name = self
                .namespace
                .segment(&self.thread, sample.class, sample.sample_no, seg);
            let content = self.encode_segment(sample, slice, seg == 0, totals, stamp)?;
            data.push(Data::new(name, content).with_final_block(last_block));
        }

        let mut parity = Vec::with_capacity(parity_payloads.len());
        for (seg, payload) in parity_payloads.iter().enumerate() {
            let name = self
                .namespace
                .parity(&self.thread, sample.class, sample.sample_no, seg as u64);
            let content = self.encode_segment(sample, payload, true, totals, stamp)?;
            parity.push(Data::new(name, content));
        }

        let manifest = Manifest::new(data.iter().chain(parity.iter()))?;
        let manifest = Data::new(
            self.namespace
                .manifest(&self.thread, sample.class, sample.sample_no),
            manifest.to_bytes(),
        );

        Ok(PublishedSample {
            data,
            parity,
            manifest,
        })
    }

    fn encode_segment(
        &self,
        sample: &SampleSpec<'_>,
        payload: &[u8],
        with_common: bool,
        (total_data, total_parity): (i32, i32),
        stamp: SegmentStamp,
    ) -> Result<Bytes, WireError> {
        let base = stamp.header();
        let bytes = match self.namespace.stream_type() {
            StreamType::Audio => {
                let mut packet = MutableHeaderPacket::<DataSegmentHeader>::new(payload);
                if with_common {
                    packet.add_blob(sample.common.as_bytes())?;
                }
                packet.set_header(&base)?;
                packet.into_vec()
            }
            StreamType::Video => {
                let header = VideoSegmentHeader::extend(
                    base,
                    total_data,
                    sample.playback_no as i64,
                    sample.paired_seq_no as i64,
                    total_parity,
                );
                let mut packet = MutableHeaderPacket::<VideoSegmentHeader>::new(payload);
                if with_common {
                    packet.add_blob(sample.common.as_bytes())?;
                }
                packet.set_header(&header)?;
                packet.into_vec()
            }
        };
        Ok(Bytes::from(bytes))
    }
}

/// Rewrite the request-dependent header fields of an already published
/// segment. Used when a producer answers a request from its own store.
pub fn restamp(data: &Data, stream_type: StreamType, stamp: SegmentStamp) -> Result<Data, WireError> {
    let content = match stream_type {
        StreamType::Audio => restamp_packet::<DataSegmentHeader>(&data.content, stamp)?,
        StreamType::Video => restamp_packet::<VideoSegmentHeader>(&data.content, stamp)?,
    };
    Ok(Data {
        name: data.name.clone(),
        content,
        final_block_id: data.final_block_id,
    })
}

fn restamp_packet<H: SegmentHeader>(content: &Bytes, stamp: SegmentStamp) -> Result<Bytes, WireError> {
    let received = ImmutableHeaderPacket::<H>::from_wire(content.clone());
    let header = received.header()?.with_base(stamp.header());
    let mut packet = MutableHeaderPacket::<H>::new(received.payload());
    for blob in received.blobs() {
        packet.add_blob(blob)?;
    }
    packet.set_header(&header)?;
    Ok(Bytes::from(packet.into_vec()))
}
