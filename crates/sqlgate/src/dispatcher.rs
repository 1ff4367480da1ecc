//! Dispatcher: the coalescing single-consumer call scheduler.
//!
//! Exactly one loop owns the right to talk to the engine. Callers enqueue a
//! [`Call`] and suspend on its reply slot; the loop, on waking for a call,
//! drains every call already queued (up to the configured maximum) into one
//! unit. Two or more drained calls become a single [`Request::Task`]
//! envelope and cost one service round trip; the ordered per-call outcomes
//! are fanned back to the reply slots by index. A single drained call is
//! sent unwrapped.
//!
//! The loop and the engine service share the connection worker thread, so
//! the envelope crosses the thread boundary exactly once per round trip.
//! Cancellation guards the enqueue step: a call that never reaches the
//! queue has no side effect. Once queued, cancelling only abandons the wait
//! - the engine work is not pulled back and its reply is discarded.

use crate::engine::Engine;
use crate::envelope::{Payload, Request};
use crate::service::Service;
use asupersync::{Cx, Outcome};
use sqlgate_core::Error;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::thread;

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Label used in closed-connection errors, usually the database path.
    pub path: String,
    /// Maximum number of queued calls merged into one round trip.
    pub max_coalesce: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            max_coalesce: 1000,
        }
    }
}

/// Single-resolution reply slot shared by a caller and the worker loop.
struct ReplySlot {
    state: Mutex<SlotState>,
}

struct SlotState {
    value: Option<Result<Payload, Error>>,
    waker: Option<Waker>,
}

impl ReplySlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState {
                value: None,
                waker: None,
            }),
        })
    }

    fn resolve(&self, value: Result<Payload, Error>) {
        let mut state = self.state.lock().expect("reply slot lock");
        if state.value.is_none() {
            state.value = Some(value);
            if let Some(waker) = state.waker.take() {
                waker.wake();
            }
        }
    }
}

/// A queued unit of work: immutable request + completion handle.
struct Call {
    request: Request,
    slot: Arc<ReplySlot>,
    /// Close marker; nothing behind it is admitted.
    last: bool,
}

/// Signals loop termination to `wait` callers.
struct DoneSignal {
    state: Mutex<(bool, Vec<Waker>)>,
}

impl DoneSignal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new((false, Vec::new())),
        })
    }

    fn finish(&self) {
        let mut state = self.state.lock().expect("done signal lock");
        state.0 = true;
        for waker in state.1.drain(..) {
            waker.wake();
        }
    }
}

/// Handle to the connection worker.
#[derive(Clone)]
pub struct Dispatcher {
    tx: Sender<Call>,
    closed: Arc<AtomicBool>,
    done: Arc<DoneSignal>,
    round_trips: Arc<AtomicU64>,
    path: Arc<str>,
}

impl Dispatcher {
    /// Start the connection worker hosting `engine` and return its handle.
    pub fn spawn(engine: Box<dyn Engine>, config: DispatcherConfig) -> Self {
        let (tx, rx) = channel();
        let done = DoneSignal::new();
        let round_trips = Arc::new(AtomicU64::new(0));
        let max_coalesce = config.max_coalesce.max(1);
        let loop_done = Arc::clone(&done);
        let loop_trips = Arc::clone(&round_trips);
        thread::Builder::new()
            .name("sqlgate-worker".to_string())
            .spawn(move || {
                let mut service = Service::new(engine);
                run(&rx, &mut service, max_coalesce, &loop_trips);
                loop_done.finish();
                // Reject stragglers until every sender is gone, so no slot
                // is ever left unresolved.
                while let Ok(call) = rx.recv() {
                    call.slot.resolve(Err(Error::closed("connection")));
                }
            })
            .expect("spawn connection worker");
        Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
            done,
            round_trips,
            path: Arc::from(config.path),
        }
    }

    /// Submit one request and await its reply.
    pub async fn submit(&self, cx: &Cx, request: Request) -> Outcome<Payload, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Outcome::Err(Error::closed(&self.path));
        }
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let slot = ReplySlot::new();
        let call = Call {
            request,
            slot: Arc::clone(&slot),
            last: false,
        };
        if self.tx.send(call).is_err() {
            return Outcome::Err(Error::closed(&self.path));
        }
        Reply { slot, cx }.await
    }

    /// Enqueue a request whose reply nobody will read. Used for
    /// fire-and-forget cleanup such as finalizing a prepared handle.
    pub(crate) fn post(&self, request: Request) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let call = Call {
            request,
            slot: ReplySlot::new(),
            last: false,
        };
        let _ = self.tx.send(call);
    }

    /// Stop admitting work and close the engine connection.
    ///
    /// Idempotent: the first call returns `true`, every later call `false`.
    /// Calls queued ahead of the close marker still run; everything behind
    /// it is rejected with the closed error.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let call = Call {
            request: Request::Close { force: false },
            slot: ReplySlot::new(),
            last: true,
        };
        let _ = self.tx.send(call);
        true
    }

    /// Suspend until the worker loop has drained and terminated the engine.
    pub async fn wait(&self, cx: &Cx) -> Outcome<(), Error> {
        WaitDone {
            done: Arc::clone(&self.done),
            cx,
        }
        .await
    }

    /// Whether `close` has been observed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of service round trips performed so far.
    ///
    /// Coalescing makes this smaller than the number of submitted calls
    /// under contention; exposed for instrumentation.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::Acquire)
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }
}

/// Future half of a submitted call.
struct Reply<'a> {
    slot: Arc<ReplySlot>,
    cx: &'a Cx,
}

impl Future for Reply<'_> {
    type Output = Outcome<Payload, Error>;

    fn poll(self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.slot.state.lock().expect("reply slot lock");
        if let Some(value) = state.value.take() {
            return Poll::Ready(match value {
                Ok(payload) => Outcome::Ok(payload),
                Err(err) => Outcome::Err(err),
            });
        }
        // The call is already queued; cancelling abandons the wait and the
        // eventual reply resolves into a slot nobody reads.
        if let Some(reason) = self.cx.cancel_reason() {
            return Poll::Ready(Outcome::Cancelled(reason));
        }
        state.waker = Some(task.waker().clone());
        Poll::Pending
    }
}

struct WaitDone<'a> {
    done: Arc<DoneSignal>,
    cx: &'a Cx,
}

impl Future for WaitDone<'_> {
    type Output = Outcome<(), Error>;

    fn poll(self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.done.state.lock().expect("done signal lock");
        if state.0 {
            return Poll::Ready(Outcome::Ok(()));
        }
        if let Some(reason) = self.cx.cancel_reason() {
            return Poll::Ready(Outcome::Cancelled(reason));
        }
        state.1.push(task.waker().clone());
        Poll::Pending
    }
}

/// The single-consumer loop. Returns when a close marker was served or all
/// senders are gone.
fn run(rx: &Receiver<Call>, service: &mut Service, max_coalesce: usize, trips: &AtomicU64) {
    while let Ok(first) = rx.recv() {
        let mut calls = vec![first];
        while calls.len() < max_coalesce {
            match rx.try_recv() {
                Ok(call) => calls.push(call),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }

        if let Some(pos) = calls.iter().position(|call| call.last) {
            let behind = calls.split_off(pos + 1);
            let close = calls.pop().expect("close marker present");
            if !calls.is_empty() {
                run_unit(service, calls, trips);
            }
            trips.fetch_add(1, Ordering::AcqRel);
            close.slot.resolve(service.invoke(close.request));
            tracing::trace!(target: "sqlgate::dispatcher", rejected = behind.len(), "connection closed");
            for call in behind {
                call.slot.resolve(Err(Error::closed("connection")));
            }
            while let Ok(call) = rx.try_recv() {
                call.slot.resolve(Err(Error::closed("connection")));
            }
            return;
        }

        run_unit(service, calls, trips);
    }
}

/// One round trip: a lone call goes through unwrapped, several are merged
/// into a task envelope and fanned back out in submission order.
fn run_unit(service: &mut Service, calls: Vec<Call>, trips: &AtomicU64) {
    trips.fetch_add(1, Ordering::AcqRel);
    if calls.len() == 1 {
        let mut calls = calls;
        let call = calls.pop().expect("single call");
        call.slot.resolve(service.invoke(call.request));
        return;
    }

    let merged = calls.len();
    let (requests, slots): (Vec<Request>, Vec<Arc<ReplySlot>>) = calls
        .into_iter()
        .map(|call| (call.request, call.slot))
        .unzip();
    tracing::trace!(target: "sqlgate::dispatcher", merged, "coalesced round trip");
    match service.invoke(Request::Task(requests)) {
        Ok(Payload::Task(results)) if results.len() == slots.len() => {
            for (slot, result) in slots.iter().zip(results) {
                slot.resolve(result);
            }
        }
        Ok(_) => {
            for slot in &slots {
                slot.resolve(Err(Error::protocol("task reply shape mismatch")));
            }
        }
        Err(err) => {
            for slot in &slots {
                slot.resolve(Err(err.clone()));
            }
        }
    }
}
