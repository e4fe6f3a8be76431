use crate::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strand_core::wire;
use strand_core::{Data, Name, NamespaceInfo, SegmentClass};

use crate::infra::lock;

// ── Network conditions ──────────────────────────────────────────────────────

/// What happens to one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Never answered; the requester sees a timeout after the lifetime.
    Drop,
    /// `tamper` answers with the payload bytes flipped.
    Deliver {
        delay: Duration,
        from_cache: bool,
        tamper: bool,
    },
}

struct Rule {
    id: u64,
    matches: Box<dyn Fn(&Name) -> bool + Send>,
    /// None drops every match.
    remaining: Option<u32>,
}

/// Conditions every request through a `SimNetwork` is judged against.
pub struct Faults {
    delay: Duration,
    jitter: Duration,
    /// Probability a segment request is lost. Meta requests are spared.
    loss: f64,
    from_cache: bool,
    rules: Vec<Rule>,
    tamper: Vec<Rule>,
    next_rule: u64,
    rng: StdRng,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            jitter: Duration::ZERO,
            loss: 0.0,
            from_cache: false,
            rules: Vec::new(),
            tamper: Vec::new(),
            next_rule: 0,
            rng: StdRng::seed_from_u64(7),
        }
    }
}

impl Faults {
    pub fn judge(&mut self, name: &Name) -> Verdict {
        for rule in &mut self.rules {
            if !(rule.matches)(name) {
                continue;
            }
            match &mut rule.remaining {
                None => return Verdict::Drop,
                Some(0) => {}
                Some(n) => {
                    *n -= 1;
                    return Verdict::Drop;
                }
            }
        }

        if self.loss > 0.0 && is_segment(name) && self.rng.gen_bool(self.loss) {
            return Verdict::Drop;
        }
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(self.rng.gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        Verdict::Deliver {
            delay: self.delay + jitter,
            from_cache: self.from_cache,
            tamper: self.tamper.iter().any(|rule| (rule.matches)(name)),
        }
    }

    fn add_rule(&mut self, matches: Box<dyn Fn(&Name) -> bool + Send>, remaining: Option<u32>) -> u64 {
        let id = self.next_rule;
        self.next_rule += 1;
        self.rules.push(Rule { id, matches, remaining });
        id
    }

    fn add_tamper(&mut self, matches: Box<dyn Fn(&Name) -> bool + Send>) -> u64 {
        let id = self.next_rule;
        self.next_rule += 1;
        self.tamper.push(Rule {
            id,
            matches,
            remaining: None,
        });
        id
    }
}

/// Same blobs, segment header included, over a payload with every byte
/// flipped. Content that is not a wire packet comes back unchanged.
pub fn corrupt(data: Data) -> Data {
    let packet = wire::decode(data.content.clone());
    if !packet.is_valid() {
        return data;
    }
    let blobs: Vec<&[u8]> = packet.blobs().collect();
    let payload: Vec<u8> = packet.payload().iter().map(|b| !b).collect();
    match wire::encode(&blobs, &payload) {
        Ok(content) => Data {
            content: content.into(),
            ..data
        },
        Err(_) => data,
    }
}

/// Data or parity segment of some sample.
pub fn is_segment(name: &Name) -> bool {
    NamespaceInfo::classify(name)
        .map(|i| !i.is_meta && matches!(i.segment_class, SegmentClass::Data | SegmentClass::Parity))
        .unwrap_or(false)
}

// ── FaultGuard: Drop-based cleanup ─────────────────────────────────────────

type Undo = Box<dyn FnOnce(&mut Faults) + Send>;

/// Lifts the condition it was created for when dropped, panics included.
/// Each fault helper returns one; bind it to a named variable.
pub struct FaultGuard {
    faults: Arc<Mutex<Faults>>,
    undo: Option<Undo>,
}

impl FaultGuard {
    fn new(faults: Arc<Mutex<Faults>>, undo: Undo) -> Self {
        Self {
            faults,
            undo: Some(undo),
        }
    }
}

impl Drop for FaultGuard {
    fn drop(&mut self) {
        if let Some(undo) = self.undo.take() {
            let mut faults = lock(&self.faults);
            undo(&mut *faults);
        }
    }
}

// ── Fault helpers ───────────────────────────────────────────────────────────

/// One-way delay on every request, plus uniform jitter up to `jitter_ms`.
pub fn add_delay(net: &SimNetwork, delay_ms: u64, jitter_ms: u64) -> FaultGuard {
    let faults = net.faults();
    {
        let mut f = lock(&faults);
        f.delay = Duration::from_millis(delay_ms);
        f.jitter = Duration::from_millis(jitter_ms);
    }
    FaultGuard::new(
        faults,
        Box::new(|f| {
            f.delay = Duration::ZERO;
            f.jitter = Duration::ZERO;
        }),
    )
}

/// Lose `loss_pct` percent of segment requests. Seeded, so a run repeats.
pub fn add_packet_loss(net: &SimNetwork, loss_pct: u32, seed: u64) -> FaultGuard {
    let faults = net.faults();
    {
        let mut f = lock(&faults);
        f.loss = f64::from(loss_pct.min(100)) / 100.0;
        f.rng = StdRng::seed_from_u64(seed);
    }
    FaultGuard::new(faults, Box::new(|f| f.loss = 0.0))
}

/// Never answer requests whose name matches.
pub fn drop_matching<F>(net: &SimNetwork, matches: F) -> FaultGuard
where
    F: Fn(&Name) -> bool + Send + 'static,
{
    let faults = net.faults();
    let id = lock(&faults).add_rule(Box::new(matches), None);
    FaultGuard::new(faults, Box::new(move |f| f.rules.retain(|r| r.id != id)))
}

/// Drop the first `count` matching requests, answer the rest.
pub fn drop_first<F>(net: &SimNetwork, count: u32, matches: F) -> FaultGuard
where
    F: Fn(&Name) -> bool + Send + 'static,
{
    let faults = net.faults();
    let id = lock(&faults).add_rule(Box::new(matches), Some(count));
    FaultGuard::new(faults, Box::new(move |f| f.rules.retain(|r| r.id != id)))
}

/// Answer requests whose name matches with a forged payload under the
/// genuine headers, as a cache poisoned by a third party would.
pub fn tamper_matching<F>(net: &SimNetwork, matches: F) -> FaultGuard
where
    F: Fn(&Name) -> bool + Send + 'static,
{
    let faults = net.faults();
    let id = lock(&faults).add_tamper(Box::new(matches));
    FaultGuard::new(faults, Box::new(move |f| f.tamper.retain(|r| r.id != id)))
}

/// Answer from an in-network cache: data as published, not stamped for
/// the request.
pub fn serve_from_cache(net: &SimNetwork) -> FaultGuard {
    let faults = net.faults();
    lock(&faults).from_cache = true;
    FaultGuard::new(faults, Box::new(|f| f.from_cache = false))
}

// ── Invariant helpers ───────────────────────────────────────────────────────

/// Playback numbers never go backwards.
pub fn strictly_increasing(numbers: &[u64]) -> bool {
    numbers.windows(2).all(|w| w[0] < w[1])
}

/// Data segment `seg` of a sample of `thread`.
pub fn data_segment_of(thread: &'static str, seg: u64) -> impl Fn(&Name) -> bool + Send + 'static {
    move |name| {
        NamespaceInfo::classify(name)
            .map(|i| {
                !i.is_meta && i.thread_name == thread && i.segment_class == SegmentClass::Data && i.segment_no == seg
            })
            .unwrap_or(false)
    }
}
