//! In-flight transaction bookkeeping.
//!
//! Every submitted command occupies one SID slot from allocation until
//! shortly after its terminal transition. A sequence terminates exactly
//! once, by reply, timeout or error; terminal slots are reusable as soon
//! as they are removed, which keeps the 1..254 SID space cycling under
//! load.
//!
//! The manager also maintains the running [`StatsSnapshot`]: reply/error/
//! timeout counters, round-trip times over a rolling 50-sample window,
//! and a messages-per-second gauge resampled once per second by the
//! client's tick task.
//!
//! Completion is delivered through a per-sequence oneshot channel; when
//! the caller has dropped its receiver the client falls back to the
//! broadcast event stream. The manager itself only hands the channel
//! back; delivery happens outside its lock.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::command::Request;
use crate::error::{FinsError, Result};
use crate::response::Response;

/// Size of the rolling round-trip sample window.
const RTT_WINDOW: usize = 50;

/// Per-call completion channel: resolves with the finished sequence or
/// the error that terminated it.
pub(crate) type CompletionSender = oneshot::Sender<std::result::Result<SequenceReport, FinsError>>;

/// Snapshot of the client's running statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    /// Replies delivered.
    pub replies: u64,
    /// Transactions terminated by error.
    pub errors: u64,
    /// Transactions terminated by timeout.
    pub timeouts: u64,
    /// Fastest round-trip in the sample window, milliseconds.
    pub min_reply_ms: f64,
    /// Slowest round-trip in the sample window, milliseconds.
    pub max_reply_ms: f64,
    /// Mean round-trip over the sample window, milliseconds.
    pub average_reply_ms: f64,
    /// Replies per second, resampled every 1000 ms.
    pub msg_per_sec: u64,
    /// Time since the client was created, milliseconds.
    pub runtime_ms: u64,
}

/// The completed (or failed) view of a transaction handed to callers.
#[derive(Debug, Clone)]
pub struct SequenceReport {
    /// Service ID of the transaction.
    pub sid: u8,
    /// The originating request.
    pub request: Request,
    /// The parsed reply, absent on timeout or error.
    pub response: Option<Response>,
    /// Caller-supplied tag, echoed back.
    pub tag: Option<String>,
    /// Whether the transport accepted the outbound frame.
    pub sent: bool,
    /// Round-trip time from submission to reply, milliseconds.
    pub rtt_ms: Option<f64>,
    /// Statistics at completion time.
    pub stats: StatsSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SequenceState {
    Pending,
    Complete,
    TimedOut,
    Errored,
}

/// One SID slot.
struct Sequence {
    request: Request,
    created_at: Instant,
    sent: bool,
    state: SequenceState,
    timer: Option<JoinHandle<()>>,
    completion: Option<CompletionSender>,
}

impl Sequence {
    fn is_terminal(&self) -> bool {
        self.state != SequenceState::Pending
    }
}

/// A terminal sequence ready for delivery, extracted from the manager so
/// the completion channel can be driven outside its lock.
pub(crate) struct Completed {
    pub report: SequenceReport,
    pub completion: Option<CompletionSender>,
}

#[derive(Debug)]
struct Stats {
    replies: u64,
    errors: u64,
    timeouts: u64,
    window: VecDeque<f64>,
    tick_counter: u64,
    msg_per_sec: u64,
    started: Instant,
}

impl Stats {
    fn new() -> Self {
        Self {
            replies: 0,
            errors: 0,
            timeouts: 0,
            window: VecDeque::with_capacity(RTT_WINDOW),
            tick_counter: 0,
            msg_per_sec: 0,
            started: Instant::now(),
        }
    }

    fn record_reply(&mut self, rtt_ms: f64) {
        self.replies += 1;
        self.tick_counter += 1;
        if self.window.len() == RTT_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(rtt_ms);
    }

    fn tick(&mut self) {
        self.msg_per_sec = self.tick_counter;
        self.tick_counter = 0;
    }

    fn snapshot(&self) -> StatsSnapshot {
        let (min, max, sum) = self
            .window
            .iter()
            .fold((f64::INFINITY, 0.0f64, 0.0f64), |(min, max, sum), &v| {
                (min.min(v), max.max(v), sum + v)
            });
        let samples = self.window.len();
        StatsSnapshot {
            replies: self.replies,
            errors: self.errors,
            timeouts: self.timeouts,
            min_reply_ms: if samples == 0 { 0.0 } else { min },
            max_reply_ms: max,
            average_reply_ms: if samples == 0 {
                0.0
            } else {
                sum / samples as f64
            },
            msg_per_sec: self.msg_per_sec,
            runtime_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

/// Table of in-flight transactions keyed by SID.
pub(crate) struct SequenceManager {
    slots: HashMap<u8, Sequence>,
    capacity: usize,
    stats: Stats,
}

impl SequenceManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            capacity,
            stats: Stats::new(),
        }
    }

    /// Registers a new sequence under its request's SID.
    ///
    /// A slot left behind by a terminal-but-not-yet-removed sequence is
    /// reclaimed; a live slot rejects reuse with [`FinsError::SidInUse`].
    pub fn add(&mut self, request: Request, completion: CompletionSender) -> Result<()> {
        let sid = request.sid;
        if let Some(existing) = self.slots.get(&sid) {
            if !existing.is_terminal() {
                return Err(FinsError::SidInUse { sid });
            }
        }
        trace!(sid, command = request.kind.name(), "sequence registered");
        self.slots.insert(
            sid,
            Sequence {
                request,
                created_at: Instant::now(),
                sent: false,
                state: SequenceState::Pending,
                timer: None,
                completion: Some(completion),
            },
        );
        Ok(())
    }

    /// Attaches the timeout timer task to a slot. Arrives immediately
    /// after `add`; a no-op if the sequence already terminated.
    pub fn set_timer(&mut self, sid: u8, timer: JoinHandle<()>) {
        match self.slots.get_mut(&sid) {
            Some(seq) if !seq.is_terminal() => seq.timer = Some(timer),
            _ => timer.abort(),
        }
    }

    /// Records that the transport accepted the outbound frame. Purely
    /// informational; the sequence still awaits its reply.
    pub fn confirm_sent(&mut self, sid: u8) {
        if let Some(seq) = self.slots.get_mut(&sid) {
            seq.sent = true;
        }
    }

    /// Returns a copy of the registered request, used by the receive path
    /// to decode the reply.
    pub fn request_for(&self, sid: u8) -> Option<Request> {
        self.slots
            .get(&sid)
            .filter(|seq| !seq.is_terminal())
            .map(|seq| seq.request.clone())
    }

    /// Completes a sequence with its parsed reply. Returns `None` if the
    /// SID is unknown or already terminal (a duplicate or late reply).
    pub fn done(&mut self, sid: u8, response: Response) -> Option<Completed> {
        let seq = self.slots.get_mut(&sid)?;
        if seq.is_terminal() {
            return None;
        }
        if let Some(timer) = seq.timer.take() {
            timer.abort();
        }
        seq.state = SequenceState::Complete;
        let rtt_ms = seq.created_at.elapsed().as_secs_f64() * 1000.0;
        self.stats.record_reply(rtt_ms);
        let stats = self.stats.snapshot();
        Some(Completed {
            report: SequenceReport {
                sid,
                request: seq.request.clone(),
                tag: seq.request.tag.clone(),
                response: Some(response),
                sent: seq.sent,
                rtt_ms: Some(rtt_ms),
                stats,
            },
            completion: seq.completion.take(),
        })
    }

    /// Expires a sequence whose timer fired. Returns `None` when the
    /// sequence already terminated (the reply won the race).
    pub fn expire(&mut self, sid: u8) -> Option<Completed> {
        let seq = self.slots.get_mut(&sid)?;
        if seq.is_terminal() {
            return None;
        }
        // The timer task is the caller here; dropping the handle detaches
        // it instead of aborting it mid-flight.
        drop(seq.timer.take());
        seq.state = SequenceState::TimedOut;
        self.stats.timeouts += 1;
        let stats = self.stats.snapshot();
        Some(Completed {
            report: SequenceReport {
                sid,
                request: seq.request.clone(),
                tag: seq.request.tag.clone(),
                response: None,
                sent: seq.sent,
                rtt_ms: None,
                stats,
            },
            completion: seq.completion.take(),
        })
    }

    /// Terminates a sequence with an error (transport write failure or a
    /// malformed reply). Returns `None` if already terminal.
    pub fn fail(&mut self, sid: u8) -> Option<Completed> {
        let seq = self.slots.get_mut(&sid)?;
        if seq.is_terminal() {
            return None;
        }
        if let Some(timer) = seq.timer.take() {
            timer.abort();
        }
        seq.state = SequenceState::Errored;
        self.stats.errors += 1;
        let stats = self.stats.snapshot();
        Some(Completed {
            report: SequenceReport {
                sid,
                request: seq.request.clone(),
                tag: seq.request.tag.clone(),
                response: None,
                sent: seq.sent,
                rtt_ms: None,
                stats,
            },
            completion: seq.completion.take(),
        })
    }

    /// Deletes a slot, cancelling any timer still attached. Returns
    /// whether a slot existed. Called exactly once per sequence after
    /// delivery.
    pub fn remove(&mut self, sid: u8) -> bool {
        match self.slots.remove(&sid) {
            Some(seq) => {
                if let Some(timer) = seq.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Number of sequences that have not yet terminated.
    pub fn active_count(&self) -> usize {
        self.slots.values().filter(|s| !s.is_terminal()).count()
    }

    /// Remaining admission capacity.
    pub fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.active_count())
    }

    /// Configured maximum of concurrent transactions.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Resamples the messages-per-second gauge; driven once per second.
    pub fn tick(&mut self) {
        self.stats.tick();
    }

    /// Current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Drops every sequence and cancels every timer. Undelivered
    /// completions are never delivered.
    pub fn close(&mut self) {
        for (_, seq) in self.slots.drain() {
            if let Some(timer) = seq.timer {
                timer.abort();
            }
        }
    }
}
