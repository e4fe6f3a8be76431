//! Remote stream: fetches one stream's samples and plays them out.
//!
//! `start` spawns two tasks sharing one buffer:
//!
//! - the control loop: handles answers, polls retransmission deadlines,
//!   bootstraps from thread meta and keeps the interest window full;
//! - the playout loop: drains Ready samples into the sink at publish pace.
//!
//! Every request runs as its own task and reports back to the control
//! loop over a channel. `stop` is synchronous: once it returns nothing is
//! requested or reissued.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use strand_core::config::StrandConfig;
use strand_core::meta::{MetaError, StreamMeta, ThreadMeta};
use strand_core::namespace::{NamespaceInfo, SegmentClass, StreamType};
use strand_core::{Data, Name, NameError, Request, StreamNamespace};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::av_sync::{AvSynchronizer, SyncRole};
use crate::buffer::{Buffer, SlotKey, SlotState};
use crate::buffer_control::{BufferControl, BufferObserver, ObserverHandle};
use crate::drd::DrdEstimator;
use crate::interest_control::InterestControl;
use crate::pipeline::{PipelineControl, PipelineState, SampleRequest};
use crate::playout::{Playout, Step};
use crate::pool::SamplePool;
use crate::retransmission::{Answer, Expiry, RetransmissionController};
use crate::segment::WireSegment;
use crate::service::{Face, FetchError, SampleSink, Validator};
use crate::stats::{StatsStorage, StreamStatistics};

const EVENT_QUEUE: usize = 1024;

/// Ready buffer the window aims for, in multiples of the jitter allowance.
const BUFFER_TARGET_JITTERS: f64 = 2.0;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Name(#[from] NameError),

    #[error("stream prefix names a {found} stream, expected {expected}")]
    TypeMismatch {
        expected: StreamType,
        found: StreamType,
    },

    #[error("meta fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error("stream has no thread named {0}")]
    UnknownThread(String),

    #[error("stream is already running")]
    AlreadyRunning,

    #[error("stream is not running")]
    NotRunning,
}

enum Event {
    Answer {
        request: Request,
        sent_at: Instant,
        result: Result<Data, FetchError>,
    },
    ThreadMeta {
        thread: String,
        result: Result<Data, FetchError>,
    },
}

#[derive(Debug, Default)]
struct MetaCache {
    stream: Option<StreamMeta>,
    threads: HashMap<String, ThreadMeta>,
}

struct Shared {
    namespace: StreamNamespace,
    config: StrandConfig,
    face: Arc<dyn Face>,
    validator: Arc<dyn Validator>,
    sink: Arc<dyn SampleSink>,
    control: BufferControl,
    interest: Arc<InterestControl>,
    retx: RetransmissionController,
    stats: Arc<StatsStorage>,
    pipeline: Mutex<PipelineControl>,
    meta: Mutex<MetaCache>,
    /// Samples requested that have not had a segment arrive yet.
    inflight: Mutex<HashSet<SlotKey>>,
    meta_pending: AtomicBool,
    /// Bumped on every flush so playout starts over.
    generation: AtomicU64,
    pool: SamplePool,
    sync: Mutex<Option<(Arc<AvSynchronizer>, SyncRole)>>,
}

struct Running {
    shutdown: broadcast::Sender<()>,
    _tasks: Vec<JoinHandle<()>>,
}

pub struct RemoteStream {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn nonce() -> u32 {
    rand::random()
}

impl RemoteStream {
    /// `stream_prefix` is `<base…>/ndnrtc/%FD<api>/<type>/<stream>`; its type
    /// component must match `stream_type`.
    pub fn new(
        stream_prefix: &Name,
        stream_type: StreamType,
        config: StrandConfig,
        face: Arc<dyn Face>,
        validator: Arc<dyn Validator>,
        sink: Arc<dyn SampleSink>,
    ) -> Result<Self, StreamError> {
        let namespace = StreamNamespace::from_prefix(stream_prefix)?;
        if namespace.stream_type() != stream_type {
            return Err(StreamError::TypeMismatch {
                expected: stream_type,
                found: namespace.stream_type(),
            });
        }

        let stats = Arc::new(StatsStorage::new());
        let buffer = Arc::new(Buffer::new(config.buffer.horizon as usize));
        let control = BufferControl::new(buffer, DrdEstimator::new(&config.drd), stats.clone());
        let interest = Arc::new(InterestControl::new(config.fetch.max_pipeline));
        control.attach(&interest);

        let shared = Shared {
            retx: RetransmissionController::new(&config.fetch),
            pipeline: Mutex::new(PipelineControl::new(
                namespace.clone(),
                Duration::from_millis(config.fetch.starvation_ms),
            )),
            pool: SamplePool::new(config.playout.pool_capacity as usize),
            namespace,
            config,
            face,
            validator,
            sink,
            control,
            interest,
            stats,
            meta: Mutex::new(MetaCache::default()),
            inflight: Mutex::new(HashSet::new()),
            meta_pending: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            sync: Mutex::new(None),
        };
        Ok(Self {
            shared: Arc::new(shared),
            running: Mutex::new(None),
        })
    }

    pub fn stream_prefix(&self) -> Name {
        self.shared.namespace.stream_prefix()
    }

    pub fn stream_type(&self) -> StreamType {
        self.shared.namespace.stream_type()
    }

    /// Fetch the latest stream meta and the meta of every thread it lists.
    pub async fn fetch_meta(&self) -> Result<StreamMeta, StreamError> {
        let shared = &self.shared;
        let data = shared.fetch_latest(shared.namespace.stream_meta_prefix()).await?;
        let stream_meta = StreamMeta::decode(data.content)?;

        let mut threads = HashMap::new();
        for thread in &stream_meta.threads {
            let data = shared
                .fetch_latest(shared.namespace.thread_meta_prefix(thread))
                .await?;
            let meta = ThreadMeta::decode(shared.namespace.stream_type(), data.content)?;
            threads.insert(thread.clone(), meta);
        }

        tracing::info!(
            stream = %shared.namespace.stream_name(),
            threads = ?stream_meta.threads,
            "stream meta fetched"
        );
        let mut cache = lock(&shared.meta);
        cache.stream = Some(stream_meta.clone());
        cache.threads = threads;
        Ok(stream_meta)
    }

    pub fn is_meta_fetched(&self) -> bool {
        lock(&self.shared.meta).stream.is_some()
    }

    /// Threads listed in the last fetched stream meta.
    pub fn threads(&self) -> Vec<String> {
        lock(&self.shared.meta)
            .stream
            .as_ref()
            .map(|m| m.threads.clone())
            .unwrap_or_default()
    }

    pub fn thread_meta(&self, thread: &str) -> Option<ThreadMeta> {
        lock(&self.shared.meta).threads.get(thread).cloned()
    }

    /// Playout of this stream follows (or leads) another stream's.
    /// Takes effect at the next `start`.
    pub fn set_av_sync(&self, sync: Arc<AvSynchronizer>, role: SyncRole) {
        *lock(&self.shared.sync) = Some((sync, role));
    }

    /// Start fetching and playing `thread`. Must be called inside a tokio
    /// runtime.
    pub fn start(&self, thread: &str) -> Result<(), StreamError> {
        let mut running = lock(&self.running);
        if running.is_some() {
            return Err(StreamError::AlreadyRunning);
        }
        {
            let meta = lock(&self.shared.meta);
            if let Some(stream) = &meta.stream {
                if !stream.threads.iter().any(|t| t == thread) {
                    return Err(StreamError::UnknownThread(thread.to_string()));
                }
            }
        }

        let shared = &self.shared;
        shared.retx.resume();
        shared.flush();
        lock(&shared.pipeline).start(thread);
        shared.meta_pending.store(false, Ordering::Release);
        shared.stats.update(|s| {
            s.thread = thread.to_string();
            s.state = PipelineState::Bootstrap;
        });

        let mut playout = Playout::new(
            shared.control.buffer().clone(),
            shared.pool.clone(),
            Duration::from_millis(shared.config.buffer.jitter_ms),
            Duration::from_millis(shared.config.playout.tick_ms.max(1)),
        );
        if shared.config.playout.av_sync {
            playout.set_sync(lock(&shared.sync).clone());
        }

        let (shutdown, _) = broadcast::channel(1);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let tasks = vec![
            tokio::spawn(control_loop(
                shared.clone(),
                events_rx,
                events_tx,
                shutdown.subscribe(),
            )),
            tokio::spawn(playout_loop(shared.clone(), playout, shutdown.subscribe())),
        ];
        *running = Some(Running {
            shutdown,
            _tasks: tasks,
        });

        tracing::info!(stream = %shared.namespace.stream_name(), thread, "stream started");
        Ok(())
    }

    /// Stop fetching and playing. Outstanding requests are retired without
    /// loss reports. Returns false if the stream was not running.
    pub fn stop(&self) -> bool {
        let Some(running) = lock(&self.running).take() else {
            return false;
        };
        let shared = &self.shared;
        lock(&shared.pipeline).stop();
        let outstanding = shared.retx.stop();
        let _ = running.shutdown.send(());
        shared.flush();
        shared.stats.update(|s| {
            s.state = PipelineState::Stopped;
            s.outstanding = 0;
        });
        tracing::info!(stream = %shared.namespace.stream_name(), outstanding, "stream stopped");
        true
    }

    /// Switch to another thread of the same stream. Flushes the buffer and
    /// bootstraps again. Returns false if `thread` is already playing.
    pub fn set_thread(&self, thread: &str) -> Result<bool, StreamError> {
        if !self.is_running() {
            return Err(StreamError::NotRunning);
        }
        if let Some(stream) = &lock(&self.shared.meta).stream {
            if !stream.threads.iter().any(|t| t == thread) {
                return Err(StreamError::UnknownThread(thread.to_string()));
            }
        }
        {
            let mut pipeline = lock(&self.shared.pipeline);
            if pipeline.thread() == thread {
                return Ok(false);
            }
            pipeline.switch_thread(thread);
        }
        self.shared.flush();
        self.shared.meta_pending.store(false, Ordering::Release);
        self.shared.stats.update(|s| s.thread = thread.to_string());
        Ok(true)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    pub fn attach<O: BufferObserver + 'static>(&self, observer: &Arc<O>) -> ObserverHandle {
        self.shared.control.attach(observer)
    }

    pub fn detach(&self, handle: ObserverHandle) -> bool {
        self.shared.control.detach(handle)
    }

    pub fn statistics(&self) -> StreamStatistics {
        self.shared.stats.snapshot()
    }

    /// False once any fetched data has failed the validator.
    pub fn is_verified(&self) -> bool {
        self.shared.stats.snapshot().segments_unverified == 0
    }

    pub fn statistics_json(&self) -> serde_json::Value {
        self.shared.stats.to_json()
    }
}

impl Drop for RemoteStream {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Control loop ──────────────────────────────────────────────────────────────

async fn control_loop(
    shared: Arc<Shared>,
    mut events: mpsc::Receiver<Event>,
    events_tx: mpsc::Sender<Event>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(Duration::from_millis(shared.config.fetch.tick_ms.max(1)));

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("control loop shutting down");
                return;
            }
            Some(event) = events.recv() => {
                shared.handle_event(event, &events_tx);
            }
            _ = tick.tick() => {
                shared.on_tick(&events_tx);
            }
        }
    }
}

// ── Playout loop ──────────────────────────────────────────────────────────────

async fn playout_loop(shared: Arc<Shared>, mut playout: Playout, mut shutdown: broadcast::Receiver<()>) {
    let tick = Duration::from_millis(shared.config.playout.tick_ms.max(1));
    let mut generation = shared.generation.load(Ordering::Acquire);
    let mut delay = tick;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("playout loop shutting down");
                return;
            }
            _ = tokio::time::sleep(delay) => {
                let current = shared.generation.load(Ordering::Acquire);
                if current != generation {
                    generation = current;
                    playout.reset();
                }
                delay = shared.play_step(&mut playout, tick);
            }
        }
    }
}

impl Shared {
    fn lifetime(&self) -> Duration {
        Duration::from_millis(self.config.fetch.request_lifetime_ms)
    }

    async fn fetch_latest(&self, prefix: Name) -> Result<Data, FetchError> {
        let request = Request::new(prefix, nonce())
            .latest()
            .with_lifetime(self.lifetime());
        let data = self.face.express(request).await?;
        self.check_signature(&data);
        Ok(data)
    }

    fn check_signature(&self, data: &Data) {
        if !self.validator.verify(data) {
            tracing::warn!(name = %data.name, "signature verification failed");
            self.stats.update(|s| s.segments_unverified += 1);
        }
    }

    /// Drop all buffered samples and retire their requests.
    fn flush(&self) {
        let pending = self.control.buffer().reset();
        self.retx.retire(&pending);
        lock(&self.inflight).clear();
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Requests of slots that left the buffer unplayed.
    fn write_off(&self, names: &[Name]) {
        if names.is_empty() {
            return;
        }
        self.retx.retire(names);
        let keys: HashSet<SlotKey> = names
            .iter()
            .filter_map(|n| NamespaceInfo::classify(n).ok())
            .map(|i| SlotKey::new(&i.thread_name, i.sample_class, i.sample_no))
            .collect();
        let mut inflight = lock(&self.inflight);
        for key in keys {
            if inflight.remove(&key) {
                self.interest.decrement();
            }
        }
    }

    fn express(&self, request: Request, events: &mpsc::Sender<Event>) {
        let answer = self.face.express(request.clone());
        let tx = events.clone();
        let sent_at = Instant::now();
        tokio::spawn(async move {
            let result = answer.await;
            let _ = tx
                .send(Event::Answer {
                    request,
                    sent_at,
                    result,
                })
                .await;
        });
    }

    /// How far ahead of the producer the window reaches.
    fn lookahead(&self) -> Duration {
        let rate = lock(&self.pipeline).rate();
        if rate <= 0.0 {
            return Duration::ZERO;
        }
        let ms = f64::from(self.interest.limit()) * 1000.0 / rate;
        Duration::from_micros((ms * 1000.0).round() as u64)
    }

    fn deadline(&self) -> Duration {
        self.retx.deadline(&self.control.drd(), self.lookahead())
    }

    fn issue(&self, names: &[Name], events: &mpsc::Sender<Event>) {
        let deadline = self.deadline();
        for name in names {
            let request = Request::new(name.clone(), nonce()).with_lifetime(self.lifetime());
            if !self.retx.issued(&request, deadline) {
                return;
            }
            self.stats.update(|s| s.requests_sent += 1);
            self.express(request, events);
        }
    }

    fn request_samples(&self, thread: &str, batch: Vec<SampleRequest>, events: &mpsc::Sender<Event>) {
        for sample in batch {
            let evicted = self.control.buffer().requested(&sample.names);
            self.write_off(&evicted);
            lock(&self.inflight).insert(SlotKey::new(thread, sample.class, sample.sample_no));
            self.interest.increment();
            tracing::trace!(
                thread,
                class = ?sample.class,
                sample = sample.sample_no,
                segments = sample.names.len(),
                "requesting sample"
            );
            self.issue(&sample.names, events);
        }
    }

    fn handle_event(&self, event: Event, events: &mpsc::Sender<Event>) {
        match event {
            Event::Answer {
                request,
                sent_at,
                result,
            } => match result {
                Ok(data) => self.on_data(request, sent_at, data, events),
                Err(error) => {
                    tracing::trace!(name = %request.name, error = %error, "request failed");
                    self.retx.timed_out(&request);
                }
            },
            Event::ThreadMeta { thread, result } => self.on_thread_meta(&thread, result),
        }
    }

    fn on_data(&self, request: Request, sent_at: Instant, data: Data, events: &mpsc::Sender<Event>) {
        let answer = self.retx.answered(&request);
        let round_trip = sent_at.elapsed();
        self.check_signature(&data);

        let segment = WireSegment::new(data, &request);
        if !segment.is_valid() {
            tracing::trace!(name = %segment.name(), "invalid segment");
            self.stats.update(|s| s.segments_invalid += 1);
            return;
        }
        // an earlier request for this name came back after it was reissued
        let superseded = answer == Answer::Superseded;
        if segment.segment_class() == SegmentClass::Manifest {
            if self.control.manifest_arrived(&segment).is_some() && superseded {
                self.retx.retire(std::slice::from_ref(segment.name()));
            }
            return;
        }
        let Some(receipt) = self.control.segment_arrived(&segment, round_trip) else {
            return;
        };

        if superseded {
            self.retx.retire(std::slice::from_ref(segment.name()));
        }
        if !receipt.surplus.is_empty() {
            self.retx.retire(&receipt.surplus);
        }
        if let Some(manifest) = &receipt.manifest {
            self.issue(std::slice::from_ref(manifest), events);
        }
        if receipt.old_state == SlotState::New {
            lock(&self.pipeline).on_sample_arrived();
            if !lock(&self.inflight).remove(&receipt.key) {
                // already written off as lost; undo the observer's decrement
                self.interest.increment();
            }
        }
        if segment.is_packet_header_segment() {
            if let Some(header) = segment.packet_header() {
                lock(&self.pipeline).on_rate_update(header.sample_rate);
            }
        }
        if receipt.totals_learned {
            let missing = self.control.buffer().missing(&receipt.key);
            if !missing.is_empty() {
                let evicted = self.control.buffer().requested(&missing);
                self.write_off(&evicted);
                self.issue(&missing, events);
            }
        }
    }

    fn fetch_thread_meta(&self, thread: String, prefix: Name, events: &mpsc::Sender<Event>) {
        if self.meta_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let request = Request::new(prefix, nonce())
            .latest()
            .with_lifetime(self.lifetime());
        let answer = self.face.express(request);
        let tx = events.clone();
        tokio::spawn(async move {
            let result = answer.await;
            let _ = tx.send(Event::ThreadMeta { thread, result }).await;
        });
    }

    fn on_thread_meta(&self, thread: &str, result: Result<Data, FetchError>) {
        self.meta_pending.store(false, Ordering::Release);
        let data = match result {
            Ok(data) => data,
            Err(error) => {
                tracing::debug!(thread, error = %error, "thread meta fetch failed, retrying");
                return;
            }
        };
        self.check_signature(&data);
        let meta = match ThreadMeta::decode(self.namespace.stream_type(), data.content) {
            Ok(meta) => meta,
            Err(error) => {
                tracing::warn!(thread, error = %error, "bad thread meta");
                return;
            }
        };

        let bootstrapped = {
            let mut pipeline = lock(&self.pipeline);
            pipeline.thread() == thread && pipeline.bootstrap(&meta)
        };
        if bootstrapped {
            let drd = self.control.drd().original_estimate();
            self.interest.initialize(meta.rate(), drd);
            lock(&self.inflight).clear();
            self.stats.update(|s| s.current_rate = meta.rate());
        }
        lock(&self.meta).threads.insert(thread.to_string(), meta);
    }

    fn retransmit(&self, events: &mpsc::Sender<Event>) {
        let deadline = self.deadline();
        let mut timeouts = 0;
        for expiry in self.retx.poll(deadline, nonce) {
            match expiry {
                Expiry::Reissue(request) => {
                    timeouts += 1;
                    self.stats.update(|s| {
                        s.retransmissions += 1;
                        s.requests_sent += 1;
                    });
                    self.express(request, events);
                }
                Expiry::Lost(name) => {
                    self.stats.update(|s| s.segments_lost += 1);
                    self.segment_lost(&name);
                }
            }
        }
        if timeouts > 0 {
            self.interest.on_timeout();
        }
    }

    /// A sample none of whose segments arrived no longer holds the window.
    fn segment_lost(&self, name: &Name) {
        let Ok(info) = NamespaceInfo::classify(name) else {
            return;
        };
        let key = SlotKey::new(&info.thread_name, info.sample_class, info.sample_no);
        if self.control.buffer().state(&key) == Some(SlotState::New) && lock(&self.inflight).remove(&key) {
            self.interest.decrement();
        }
        tracing::debug!(name = %name, "segment lost");
    }

    fn on_tick(&self, events: &mpsc::Sender<Event>) {
        if self.retx.is_stopped() {
            return;
        }

        let starved = lock(&self.pipeline).check_starvation();
        if starved.is_some() {
            // delay estimates from before the stall no longer hold
            self.flush();
            self.control.reset_drd();
        }

        let bootstrap = {
            let pipeline = lock(&self.pipeline);
            (pipeline.state() == PipelineState::Bootstrap)
                .then(|| (pipeline.thread().to_string(), pipeline.meta_prefix()))
        };
        if let Some((thread, prefix)) = bootstrap {
            self.fetch_thread_meta(thread, prefix, events);
        }

        self.retransmit(events);

        let (thread, batch) = {
            let mut pipeline = lock(&self.pipeline);
            if pipeline.state() == PipelineState::Adjusting {
                tracing::debug!(rate = pipeline.rate(), "window follows new rate");
                pipeline.settle();
            }
            let room = self.interest.room();
            (pipeline.thread().to_string(), pipeline.next_batch(room))
        };
        self.request_samples(&thread, batch, events);

        let occupancy = self.control.buffer().occupancy();
        let target_ms = self.config.buffer.jitter_ms as f64 * BUFFER_TARGET_JITTERS;
        self.interest.observe_buffer(occupancy.ready_ms, target_ms);

        let window = self.interest.snapshot();
        let state = lock(&self.pipeline).state();
        self.stats.update(|s| {
            s.state = state;
            s.pipeline_limit = window.limit;
            s.outstanding = window.outstanding;
            s.buffer = occupancy;
        });
    }

    /// One playout step. Returns how long to wait before the next.
    fn play_step(&self, playout: &mut Playout, tick: Duration) -> Duration {
        match playout.step() {
            Step::Idle => tick,
            Step::Rebuffer => {
                self.stats.update(|s| s.rebuffers += 1);
                tick
            }
            Step::Wait(wait) => wait,
            Step::Played {
                sample,
                next_in,
                removed,
            } => {
                self.write_off(&removed.pending);
                let rebuilt = sample.rebuilt > 0;
                self.stats.update(|s| {
                    s.samples_played += 1;
                    if rebuilt {
                        s.samples_recovered += 1;
                    }
                });
                self.sink.render(sample);
                next_in
            }
            Step::Skipped { removed, .. } => {
                self.write_off(&removed.pending);
                self.stats.update(|s| s.samples_skipped += 1);
                Duration::ZERO
            }
            Step::Dropped { removed, .. } => {
                self.write_off(&removed.pending);
                self.stats.update(|s| s.samples_dropped += 1);
                Duration::ZERO
            }
            Step::Unrecoverable { removed, .. } => {
                self.write_off(&removed.pending);
                self.stats.update(|s| s.samples_unrecoverable += 1);
                Duration::ZERO
            }
        }
    }
}
