//! In-process network and producer.
//!
//! `SimNetwork` is a `Face` backed by a name-keyed store. A request for
//! data that is not published yet stays pending until it is, or until its
//! lifetime runs out. `LiveProducer` publishes samples into the store at
//! a fixed rate, the way a real producer keeps its thread meta current.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use strand_core::meta::{AudioThreadMeta, SegmentsInfo, StreamMeta, ThreadMeta, VideoThreadMeta};
use strand_core::{Data, Name, NamespaceInfo, Request, SampleClass, SegmentClass, StreamNamespace, StreamType};
use strand_services::{restamp, Face, FetchError, PlayoutSample, SampleSink, SampleSlicer, SampleSpec, SegmentStamp};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::fault::{corrupt, Faults, Verdict};

/// How often a pending request looks for its data.
const PENDING_POLL: Duration = Duration::from_millis(5);

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

// ── SimNetwork ────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct Stored {
    data: Data,
    published_at: Instant,
}

struct NetInner {
    epoch: Instant,
    store: Mutex<HashMap<Name, Stored>>,
    /// Newest object under a prefix, for "latest" requests.
    latest: Mutex<HashMap<Name, Data>>,
    requests: Mutex<HashMap<Name, u32>>,
    faults: Arc<Mutex<Faults>>,
}

#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<NetInner>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetInner {
                epoch: Instant::now(),
                store: Mutex::new(HashMap::new()),
                latest: Mutex::new(HashMap::new()),
                requests: Mutex::new(HashMap::new()),
                faults: Arc::new(Mutex::new(Faults::default())),
            }),
        }
    }

    pub fn face(&self) -> Arc<dyn Face> {
        Arc::new(self.clone())
    }

    pub fn publish(&self, data: Data) {
        let stored = Stored {
            data,
            published_at: Instant::now(),
        };
        lock(&self.inner.store).insert(stored.data.name.clone(), stored);
    }

    /// Publish `data` as the newest object under `prefix`.
    pub fn publish_latest(&self, prefix: Name, data: Data) {
        lock(&self.inner.latest).insert(prefix, data);
    }

    pub fn is_published(&self, name: &Name) -> bool {
        lock(&self.inner.store).contains_key(name)
    }

    pub fn requests_for(&self, name: &Name) -> u32 {
        lock(&self.inner.requests).get(name).copied().unwrap_or(0)
    }

    pub fn total_requests(&self) -> u32 {
        lock(&self.inner.requests).values().sum()
    }

    /// Milliseconds since the network came up.
    pub fn now_ms(&self) -> i64 {
        self.inner.epoch.elapsed().as_millis() as i64
    }

    pub(crate) fn faults(&self) -> Arc<Mutex<Faults>> {
        self.inner.faults.clone()
    }
}

impl NetInner {
    async fn answer(&self, request: &Request, from_cache: bool) -> Result<Data, FetchError> {
        let arrived = Instant::now();
        loop {
            if let Some(answer) = self.lookup(request, arrived, from_cache) {
                return answer;
            }
            if arrived.elapsed() >= request.lifetime {
                return Err(FetchError::Timeout);
            }
            tokio::time::sleep(PENDING_POLL).await;
        }
    }

    fn lookup(&self, request: &Request, arrived: Instant, from_cache: bool) -> Option<Result<Data, FetchError>> {
        if request.can_be_prefix {
            return lock(&self.latest).get(&request.name).cloned().map(Ok);
        }
        let stored = lock(&self.store).get(&request.name).cloned()?;
        if from_cache {
            return Some(Ok(stored.data));
        }
        let stream_type = match NamespaceInfo::classify(&request.name) {
            Ok(info) if matches!(info.segment_class, SegmentClass::Data | SegmentClass::Parity) => {
                info.stream_type
            }
            _ => return Some(Ok(stored.data)),
        };
        // answered by the producer itself: stamp this request's nonce
        let stamp = SegmentStamp::answering(
            request.nonce as i32,
            millis(self.epoch.elapsed()),
            millis(stored.published_at.saturating_duration_since(arrived)),
        );
        Some(restamp(&stored.data, stream_type, stamp).map_err(|e| FetchError::Nack(e.to_string())))
    }
}

impl Face for SimNetwork {
    fn express(&self, request: Request) -> BoxFuture<'static, Result<Data, FetchError>> {
        let inner = self.inner.clone();
        *lock(&inner.requests).entry(request.name.clone()).or_insert(0) += 1;
        let verdict = lock(&inner.faults).judge(&request.name);

        async move {
            match verdict {
                Verdict::Drop => {
                    tokio::time::sleep(request.lifetime).await;
                    Err(FetchError::Timeout)
                }
                Verdict::Deliver {
                    delay,
                    from_cache,
                    tamper,
                } => {
                    tokio::time::sleep(delay).await;
                    let answer = inner.answer(&request, from_cache).await;
                    if tamper {
                        answer.map(corrupt)
                    } else {
                        answer
                    }
                }
            }
        }
        .boxed()
    }
}

// ── LiveProducer ──────────────────────────────────────────────────────────────

/// One thread of a published stream.
#[derive(Debug, Clone)]
pub struct ThreadSpec {
    pub name: String,
    pub rate: f64,
    /// Samples per group, key included. Ignored for audio.
    pub gop: u32,
    pub payload_len: usize,
    pub slice_size: usize,
    pub parity_ratio: f64,
    /// Written into every sample payload so the consumer side can tell
    /// threads apart.
    pub tag: u8,
}

impl ThreadSpec {
    /// 25 fps, 10-sample groups, three data segments and one parity segment
    /// per sample.
    pub fn video(name: &str, tag: u8) -> Self {
        Self {
            name: name.to_string(),
            rate: 25.0,
            gop: 10,
            payload_len: 250,
            slice_size: 100,
            parity_ratio: 0.3,
            tag,
        }
    }

    /// 50 bundles a second, one segment each.
    pub fn audio(name: &str, tag: u8) -> Self {
        Self {
            name: name.to_string(),
            rate: 50.0,
            gop: 0,
            payload_len: 120,
            slice_size: 1000,
            parity_ratio: 0.0,
            tag,
        }
    }
}

/// `playback_no` as little-endian bytes, then the thread tag repeated.
pub fn sample_payload(tag: u8, playback_no: u64, len: usize) -> Vec<u8> {
    let mut payload = vec![tag; len.max(9)];
    payload[..8].copy_from_slice(&playback_no.to_le_bytes());
    payload
}

#[derive(Debug)]
struct ThreadState {
    playback_no: u64,
    next_key: u64,
    /// Delta numbers start at 1 so that 0 reads as "none yet".
    next_delta: u64,
    last_key: u64,
    gop_pos: u32,
    meta_version: u64,
}

impl Default for ThreadState {
    fn default() -> Self {
        Self {
            playback_no: 0,
            next_key: 0,
            next_delta: 1,
            last_key: 0,
            gop_pos: 0,
            meta_version: 0,
        }
    }
}

/// Publishes every thread of one stream until dropped.
pub struct LiveProducer {
    namespace: StreamNamespace,
    tasks: Vec<JoinHandle<()>>,
}

impl LiveProducer {
    pub fn start(net: &SimNetwork, namespace: StreamNamespace, threads: Vec<ThreadSpec>) -> Result<Self> {
        let meta = StreamMeta::with_threads(net.now_ms() as u64, threads.iter().map(|t| t.name.clone()));
        net.publish_latest(
            namespace.stream_meta_prefix(),
            Data::new(namespace.stream_meta(1, 0), meta.encode()?),
        );

        let tasks = threads
            .into_iter()
            .map(|spec| tokio::spawn(run_thread(net.clone(), namespace.clone(), spec)))
            .collect();
        Ok(Self { namespace, tasks })
    }

    pub fn namespace(&self) -> &StreamNamespace {
        &self.namespace
    }
}

impl Drop for LiveProducer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn run_thread(net: SimNetwork, namespace: StreamNamespace, spec: ThreadSpec) {
    let slicer = SampleSlicer::new(namespace, &spec.name, spec.slice_size).with_parity_ratio(spec.parity_ratio);
    let period = Duration::from_micros((1_000_000.0 / spec.rate).round() as u64);
    let mut tick = tokio::time::interval(period);
    let mut state = ThreadState::default();
    loop {
        tick.tick().await;
        if let Err(e) = publish_next(&net, &slicer, &spec, &mut state) {
            tracing::warn!(thread = %spec.name, error = %e, "producer stopped");
            return;
        }
    }
}

fn publish_next(net: &SimNetwork, slicer: &SampleSlicer, spec: &ThreadSpec, state: &mut ThreadState) -> Result<()> {
    let ns = slicer.namespace();
    let video = ns.stream_type() == StreamType::Video;
    let key = video && spec.gop > 0 && state.playback_no % u64::from(spec.gop) == 0;

    let (class, sample_no) = if key {
        let n = state.next_key;
        state.next_key += 1;
        state.last_key = n;
        state.gop_pos = 0;
        (SampleClass::Key, n)
    } else {
        let n = state.next_delta;
        state.next_delta += 1;
        state.gop_pos += 1;
        (SampleClass::Delta, n)
    };
    // audio bundles play in sample order
    let playback_no = if video { state.playback_no + 1 } else { sample_no };
    state.playback_no += 1;

    let payload = sample_payload(spec.tag, playback_no, spec.payload_len);
    let sample = SampleSpec::new(class, sample_no, &payload)
        .playback(playback_no, state.next_delta)
        .rate(spec.rate)
        .published_at(net.now_ms(), 0.0);
    let published = slicer.slice(&sample, SegmentStamp::default())?;
    for data in published.segments() {
        net.publish(data.clone());
    }
    net.publish(published.manifest.clone());

    let meta = if video {
        let data = published.data.len() as f64;
        let parity = published.parity.len() as f64;
        ThreadMeta::Video(VideoThreadMeta {
            rate: spec.rate,
            delta_seq_no: state.next_delta - 1,
            key_seq_no: state.last_key,
            gop_pos: state.gop_pos as u8,
            gop: spec.gop,
            bitrate_kbps: 1000,
            width: 640,
            height: 480,
            segments: SegmentsInfo {
                delta_avg_segments: data,
                delta_avg_parity: parity,
                key_avg_segments: data,
                key_avg_parity: parity,
            },
        })
    } else {
        ThreadMeta::Audio(AudioThreadMeta {
            rate: spec.rate,
            bundle_no: sample_no,
            codec: "opus".to_string(),
        })
    };
    state.meta_version += 1;
    net.publish_latest(
        ns.thread_meta_prefix(&spec.name),
        Data::new(ns.thread_meta(&spec.name, state.meta_version, 0), meta.encode()?),
    );
    Ok(())
}

// ── CollectingSink ────────────────────────────────────────────────────────────

/// What the sink saw of one played sample.
#[derive(Debug, Clone)]
pub struct Rendered {
    pub thread: String,
    pub playback_no: u64,
    pub tag: u8,
    /// Payload carries the playback number it was published with.
    pub intact: bool,
    pub rebuilt: usize,
    pub at: Instant,
}

#[derive(Default)]
pub struct CollectingSink {
    rendered: Mutex<Vec<Rendered>>,
}

impl CollectingSink {
    pub fn rendered(&self) -> Vec<Rendered> {
        lock(&self.rendered).clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.rendered).len()
    }

    pub fn playback_numbers(&self) -> Vec<u64> {
        lock(&self.rendered).iter().map(|r| r.playback_no).collect()
    }
}

impl SampleSink for CollectingSink {
    fn render(&self, sample: PlayoutSample) {
        let bytes: &[u8] = &sample.payload;
        let (intact, tag) = match bytes.len() {
            n if n >= 9 => {
                let mut no = [0u8; 8];
                no.copy_from_slice(&bytes[..8]);
                let tag = bytes[8];
                let intact = u64::from_le_bytes(no) == sample.playback_no && bytes[8..].iter().all(|b| *b == tag);
                (intact, tag)
            }
            _ => (false, 0),
        };
        lock(&self.rendered).push(Rendered {
            thread: sample.thread.clone(),
            playback_no: sample.playback_no,
            tag,
            intact,
            rebuilt: sample.rebuilt,
            at: Instant::now(),
        });
    }
}
