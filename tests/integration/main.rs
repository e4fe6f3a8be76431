//! Strand integration test harness.
//!
//! Tests run a live producer and a `RemoteStream` against an in-process
//! simulated network. The tokio clock is paused, so seconds of streaming
//! take milliseconds of wall time and every run sees the same schedule.
//!
//!   cargo test --test integration
//!   RUST_LOG=strand_services=debug cargo test --test integration -- --nocapture
//!
//! Each test owns its network, producer and consumer; nothing is shared.

mod fault;
mod infra;
mod playout;
mod recovery;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use strand_core::config::StrandConfig;
use strand_core::{Data, Name, Request, StreamNamespace, StreamType};
use strand_services::{AcceptAll, Face, FetchError, RemoteStream};
use tracing_subscriber::EnvFilter;

pub use infra::*;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Base prefix every test stream is published under.
pub const BASE: &str = "/lab/studio";

/// Log to the test writer, filtered by RUST_LOG. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn namespace(stream_type: StreamType, stream: &str) -> StreamNamespace {
    let base = Name::parse(BASE).unwrap_or_default();
    StreamNamespace::new(base, stream_type, stream)
}

/// Consumer for the stream `producer` publishes.
pub fn consumer(net: &SimNetwork, producer: &LiveProducer, sink: &Arc<CollectingSink>) -> Result<RemoteStream> {
    consumer_with(net, producer, sink, StrandConfig::default())
}

pub fn consumer_with(
    net: &SimNetwork,
    producer: &LiveProducer,
    sink: &Arc<CollectingSink>,
    config: StrandConfig,
) -> Result<RemoteStream> {
    let ns = producer.namespace();
    let stream = RemoteStream::new(
        &ns.stream_prefix(),
        ns.stream_type(),
        config,
        net.face(),
        Arc::new(AcceptAll),
        sink.clone(),
    )?;
    Ok(stream)
}

/// Polls `condition` every 10ms of stream time until it holds or `timeout`
/// passes.
pub async fn wait_for_condition<F>(timeout: Duration, condition: F) -> Result<()>
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("condition not met within {timeout:?}")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// The simulated network answers published data and stamps it for the
/// request.
#[tokio::test(start_paused = true)]
async fn test_sim_answers_published_segments() -> Result<()> {
    init_tracing();
    let net = SimNetwork::new();
    let producer = LiveProducer::start(&net, namespace(StreamType::Video, "cam"), vec![ThreadSpec::video("hd", 1)])?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let name = producer.namespace().segment("hd", strand_core::SampleClass::Key, 0, 0);
    assert!(net.is_published(&name), "first key sample should be out");

    let request = Request::new(name.clone(), 42).with_lifetime(Duration::from_millis(500));
    let data: Data = net.face().express(request.clone()).await?;
    let segment = strand_services::WireSegment::new(data, &request);
    assert!(segment.is_valid());
    assert!(segment.is_original(), "answer should carry the request nonce");
    assert_eq!(segment.playback_no(), Some(1));
    assert_eq!(net.requests_for(&name), 1);
    Ok(())
}

/// A request for data that never shows up times out after its lifetime.
#[tokio::test(start_paused = true)]
async fn test_sim_times_out_unpublished() {
    init_tracing();
    let net = SimNetwork::new();
    let name = namespace(StreamType::Audio, "mic").segment("pcm", strand_core::SampleClass::Delta, 9, 0);
    let started = tokio::time::Instant::now();
    let result = net
        .face()
        .express(Request::new(name, 1).with_lifetime(Duration::from_millis(300)))
        .await;
    assert_eq!(result, Err(FetchError::Timeout));
    assert!(started.elapsed() >= Duration::from_millis(300));
}

/// Latest-version requests resolve to the newest meta under the prefix.
#[tokio::test(start_paused = true)]
async fn test_sim_serves_latest_meta() -> Result<()> {
    init_tracing();
    let net = SimNetwork::new();
    let ns = namespace(StreamType::Audio, "mic");
    let _producer = LiveProducer::start(&net, ns.clone(), vec![ThreadSpec::audio("pcm", 2)])?;
    tokio::time::sleep(Duration::from_millis(105)).await;

    let request = Request::new(ns.thread_meta_prefix("pcm"), 7).latest();
    let data = net.face().express(request).await?;
    let meta = strand_core::meta::ThreadMeta::decode(StreamType::Audio, data.content)?;
    match meta {
        strand_core::meta::ThreadMeta::Audio(m) => assert!(m.bundle_no >= 5, "bundle {}", m.bundle_no),
        other => bail!("unexpected meta {other:?}"),
    }
    Ok(())
}
