//! Retransmission controller: notices requests that outlive their
//! deadline, reissues them a bounded number of times, then reports the
//! segment lost exactly once.
//!
//! Per request:
//!
//!   issued ──deadline──▶ timed-out ──reissue──▶ issued
//!      │                     │
//!      └──answer──▶ answered └──max retries──▶ retired (one loss report)
//!
//! Every transition happens under the request's map entry. Answers and
//! transport timeouts only count against the request they belong to: once
//! a name has been reissued, anything carrying an older nonce is
//! superseded and leaves the live request alone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use strand_core::config::FetchConfig;
use strand_core::{Name, Request};
use tokio::time::Instant;

use crate::drd::DrdEstimator;
use crate::pacing::RequestPacer;

/// Deadline = original DRD plus this many standard deviations.
const DEADLINE_DEVIATIONS: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Issued,
    Answered,
    TimedOut,
    Retired,
}

#[derive(Debug)]
struct Entry {
    request: Request,
    state: RequestState,
    issued_at: Instant,
    deadline: Instant,
    retries: u32,
}

/// How an arriving answer relates to what we asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    /// Outstanding request answered.
    Fresh { round_trip: Duration, retries: u32 },
    /// Answer for a request already answered or retired.
    Late,
    /// Answer to an earlier nonce of a request that has since been
    /// reissued. The reissued request stays outstanding.
    Superseded,
    /// Never issued through this controller.
    Unknown,
}

/// Outcome of a timeout poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expiry {
    Reissue(Request),
    Lost(Name),
}

pub struct RetransmissionController {
    table: DashMap<Name, Entry>,
    max_retries: u32,
    min_deadline: Duration,
    max_deadline: Duration,
    pacer: Mutex<RequestPacer>,
    stopped: AtomicBool,
}

impl RetransmissionController {
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            table: DashMap::new(),
            max_retries: config.max_retries,
            min_deadline: Duration::from_millis(config.min_deadline_ms),
            max_deadline: Duration::from_millis(config.request_lifetime_ms),
            pacer: Mutex::new(RequestPacer::new(config.retransmissions_per_sec)),
            stopped: AtomicBool::new(false),
        }
    }

    /// Deadline for a new request given current delay statistics.
    /// `lookahead` covers requests for samples not published yet, which
    /// wait at the producer until they are.
    pub fn deadline(&self, drd: &DrdEstimator, lookahead: Duration) -> Duration {
        let ms = drd.original_estimate() + DEADLINE_DEVIATIONS * drd.original_deviation();
        let network = Duration::from_micros((ms.max(0.0) * 1000.0).round() as u64);
        (network + lookahead).clamp(self.min_deadline, self.max_deadline)
    }

    /// Track a request that just went out. Refused after `stop()`.
    pub fn issued(&self, request: &Request, deadline: Duration) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        self.table.insert(
            request.name.clone(),
            Entry {
                request: request.clone(),
                state: RequestState::Issued,
                issued_at: now,
                deadline: now + deadline,
                retries: 0,
            },
        );
        true
    }

    pub fn answered(&self, request: &Request) -> Answer {
        match self.table.get_mut(&request.name) {
            Some(mut entry) => match entry.state {
                RequestState::Issued | RequestState::TimedOut
                    if entry.request.nonce != request.nonce =>
                {
                    Answer::Superseded
                }
                RequestState::Issued | RequestState::TimedOut => {
                    entry.state = RequestState::Answered;
                    Answer::Fresh {
                        round_trip: entry.issued_at.elapsed(),
                        retries: entry.retries,
                    }
                }
                RequestState::Answered | RequestState::Retired => Answer::Late,
            },
            None => Answer::Unknown,
        }
    }

    /// The transport gave up on a request before our deadline did.
    pub fn timed_out(&self, request: &Request) -> bool {
        match self.table.get_mut(&request.name) {
            Some(mut entry)
                if entry.state == RequestState::Issued && entry.request.nonce == request.nonce =>
            {
                entry.state = RequestState::TimedOut;
                true
            }
            _ => false,
        }
    }

    /// Expire overdue requests. Reissues get a fresh nonce from `nonce`;
    /// reissues the pacer refuses stay timed-out until a later poll.
    pub fn poll<F: FnMut() -> u32>(&self, reissue_deadline: Duration, mut nonce: F) -> Vec<Expiry> {
        if self.stopped.load(Ordering::Acquire) {
            return Vec::new();
        }
        let now = Instant::now();
        let keep_for = self.max_deadline * 2;

        self.table.retain(|_, e| {
            let settled = matches!(e.state, RequestState::Answered | RequestState::Retired);
            !(settled && now.duration_since(e.issued_at) > keep_for)
        });

        let candidates: Vec<Name> = self
            .table
            .iter()
            .filter(|e| {
                (e.state == RequestState::Issued && now >= e.deadline)
                    || e.state == RequestState::TimedOut
            })
            .map(|e| e.key().clone())
            .collect();

        let mut out = Vec::new();
        for name in candidates {
            let Some(mut entry) = self.table.get_mut(&name) else {
                continue;
            };
            if entry.state == RequestState::Issued && now >= entry.deadline {
                entry.state = RequestState::TimedOut;
            }
            if entry.state != RequestState::TimedOut {
                continue;
            }

            if entry.retries >= self.max_retries {
                entry.state = RequestState::Retired;
                tracing::debug!(name = %name, retries = entry.retries, "segment lost");
                out.push(Expiry::Lost(name.clone()));
                continue;
            }

            let allowed = self
                .pacer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .allow();
            if !allowed {
                continue;
            }

            entry.retries += 1;
            entry.request = entry.request.renewed(nonce());
            entry.state = RequestState::Issued;
            entry.issued_at = now;
            entry.deadline = now + reissue_deadline;
            tracing::trace!(name = %name, retry = entry.retries, "reissuing request");
            out.push(Expiry::Reissue(entry.request.clone()));
        }
        out
    }

    /// Retire requests nobody wants anymore. No loss reports.
    pub fn retire(&self, names: &[Name]) -> usize {
        let mut retired = 0;
        for name in names {
            if let Some(mut entry) = self.table.get_mut(name) {
                if matches!(entry.state, RequestState::Issued | RequestState::TimedOut) {
                    entry.state = RequestState::Retired;
                    retired += 1;
                }
            }
        }
        retired
    }

    /// Retire everything and refuse further issues until `resume()`.
    pub fn stop(&self) -> usize {
        self.stopped.store(true, Ordering::Release);
        let outstanding = self.outstanding();
        self.table.clear();
        outstanding
    }

    pub fn resume(&self) {
        self.stopped.store(false, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn state(&self, name: &Name) -> Option<RequestState> {
        self.table.get(name).map(|e| e.state)
    }

    /// Requests still waiting for an answer.
    pub fn outstanding(&self) -> usize {
        self.table
            .iter()
            .filter(|e| matches!(e.state, RequestState::Issued | RequestState::TimedOut))
            .count()
    }
}
