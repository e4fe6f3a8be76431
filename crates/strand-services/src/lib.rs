//! strand-services: the consumer pipeline: buffering, delay estimation,
//! request pacing, retransmission, playout, and the `RemoteStream` that
//! runs them. Also the producer-side slicer used to publish samples.

pub mod av_sync;
pub mod buffer;
pub mod buffer_control;
pub mod drd;
pub mod fec;
pub mod interest_control;
pub mod pacing;
pub mod pipeline;
pub mod playout;
pub mod pool;
pub mod retransmission;
pub mod segment;
pub mod service;
pub mod slicer;
pub mod stats;
pub mod stream;

pub use av_sync::{AvSynchronizer, SyncRole};
pub use buffer::{Buffer, Integrity, SlotKey, SlotState};
pub use buffer_control::{BufferControl, BufferObserver, ObserverHandle};
pub use drd::DrdEstimator;
pub use interest_control::InterestControl;
pub use pipeline::PipelineState;
pub use playout::PlayoutSample;
pub use pool::{PooledBuffer, SamplePool};
pub use retransmission::RetransmissionController;
pub use segment::WireSegment;
pub use service::{AcceptAll, Face, FetchError, SampleSink, Validator};
pub use slicer::{restamp, PublishedSample, SampleSlicer, SampleSpec, SegmentStamp};
pub use stats::StreamStatistics;
pub use stream::{RemoteStream, StreamError};
