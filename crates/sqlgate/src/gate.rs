//! Gate: the async reader/writer lock.
//!
//! The gate is built from message passing rather than a native lock around
//! its state: a dedicated arbiter consumes typed intents from a
//! multi-producer queue and is the only code that ever mutates the
//! writer-flag/reader-count pair. Waiters are granted strictly in the order
//! the arbiter observes their intents; no reader/writer priority exists
//! beyond that ordering, so starvation is possible and accepted - it
//! matches the single-writer execution model of the engine behind it.
//!
//! Acquisition is cancellable at every point before the grant: a waiter
//! that observes cancellation marks itself abandoned and the arbiter skips
//! it before touching any state. A grant that lands on a waiter the caller
//! has already dropped is handed straight back as a release. Tokens are
//! RAII: [`Locked::unlock`] consumes the token, and dropping one releases
//! the gate, so exactly one release happens per acquisition on every exit
//! path. Releasing without holding is unrepresentable in this API, and the
//! arbiter asserts its invariants on every transition.

use asupersync::{Cx, Outcome};
use sqlgate_core::Error;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::thread;

/// Lock mode requested for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// No locking
    #[default]
    None,
    /// Shared lock; multiple shared holders may run in parallel
    Shared,
    /// Exclusive lock; excludes every other shared or exclusive holder
    Exclusive,
}

/// Which half of the gate an intent concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

enum Intent {
    Acquire { access: Access, cell: Arc<GrantCell> },
    Release { access: Access },
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Queued, not yet decided
    Waiting,
    /// Granted by the arbiter, not yet observed by the waiter
    Granted,
    /// Granted and observed; the waiter owns a token
    Taken,
    /// The waiter gave up before the grant
    Abandoned,
    /// The gate was torn down while the waiter was queued
    Closed,
}

struct GrantCell {
    state: Mutex<GrantState>,
}

struct GrantState {
    phase: Phase,
    waker: Option<Waker>,
}

impl GrantCell {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GrantState {
                phase: Phase::Waiting,
                waker: None,
            }),
        })
    }

    /// Arbiter side: grant unless the waiter already gave up.
    fn try_grant(&self) -> bool {
        let mut state = self.state.lock().expect("gate cell lock");
        if state.phase == Phase::Abandoned {
            return false;
        }
        state.phase = Phase::Granted;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
        true
    }

    /// Arbiter side: fail the waiter with the closed error.
    fn close(&self) {
        let mut state = self.state.lock().expect("gate cell lock");
        if state.phase == Phase::Waiting {
            state.phase = Phase::Closed;
            if let Some(waker) = state.waker.take() {
                waker.wake();
            }
        }
    }
}

/// Mirror of the arbiter's state, written only by the arbiter.
struct GateShared {
    closed: AtomicBool,
    writer: AtomicBool,
    readers: AtomicUsize,
}

/// The async reader/writer lock guarding one connection.
#[derive(Clone)]
pub struct Gate {
    intents: Sender<Intent>,
    shared: Arc<GateShared>,
}

impl Gate {
    /// Create a gate and start its arbiter.
    pub fn new() -> Self {
        let (intents, rx) = channel();
        let shared = Arc::new(GateShared {
            closed: AtomicBool::new(false),
            writer: AtomicBool::new(false),
            readers: AtomicUsize::new(0),
        });
        let arbiter_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("sqlgate-arbiter".to_string())
            .spawn(move || arbiter(rx, &arbiter_shared))
            .expect("spawn gate arbiter");
        Self { intents, shared }
    }

    /// Acquire the gate exclusively.
    pub async fn lock(&self, cx: &Cx) -> Outcome<Locked, Error> {
        self.acquire(cx, Access::Write).await
    }

    /// Acquire the gate shared.
    pub async fn read_lock(&self, cx: &Cx) -> Outcome<Locked, Error> {
        self.acquire(cx, Access::Read).await
    }

    async fn acquire(&self, cx: &Cx, access: Access) -> Outcome<Locked, Error> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Outcome::Err(Error::closed("gate"));
        }
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let cell = GrantCell::new();
        if self
            .intents
            .send(Intent::Acquire {
                access,
                cell: Arc::clone(&cell),
            })
            .is_err()
        {
            return Outcome::Err(Error::closed("gate"));
        }
        Acquire {
            cell,
            access,
            intents: &self.intents,
            cx,
        }
        .await
    }

    /// Tear the gate down: all queued and future acquisitions fail with the
    /// closed error. Terminal.
    pub fn close(&self) {
        let _ = self.intents.send(Intent::Close);
    }

    /// Whether a writer currently holds the gate.
    pub fn is_write_locked(&self) -> bool {
        self.shared.writer.load(Ordering::Acquire)
    }

    /// Number of shared holders.
    pub fn readers(&self) -> usize {
        self.shared.readers.load(Ordering::Acquire)
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// Token for one successful acquisition.
///
/// Owns the right to release exactly once: `unlock` consumes the token, and
/// dropping an un-unlocked token releases as well, so every exit path
/// releases the gate.
#[must_use = "dropping a Locked releases the gate immediately"]
pub struct Locked {
    intents: Sender<Intent>,
    access: Access,
    released: bool,
}

impl std::fmt::Debug for Locked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locked")
            .field("access", &self.access)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Locked {
    /// Release the gate.
    pub fn unlock(mut self) {
        self.release();
    }

    /// Whether this token came from a shared acquisition.
    pub fn is_shared(&self) -> bool {
        self.access == Access::Read
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            let _ = self.intents.send(Intent::Release {
                access: self.access,
            });
        }
    }
}

impl Drop for Locked {
    fn drop(&mut self) {
        self.release();
    }
}

/// Future for a queued acquisition.
struct Acquire<'a> {
    cell: Arc<GrantCell>,
    access: Access,
    intents: &'a Sender<Intent>,
    cx: &'a Cx,
}

impl Future for Acquire<'_> {
    type Output = Outcome<Locked, Error>;

    fn poll(self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.cell.state.lock().expect("gate cell lock");
        match state.phase {
            Phase::Granted => {
                state.phase = Phase::Taken;
                Poll::Ready(Outcome::Ok(Locked {
                    intents: self.intents.clone(),
                    access: self.access,
                    released: false,
                }))
            }
            Phase::Closed => Poll::Ready(Outcome::Err(Error::closed("gate"))),
            Phase::Waiting => {
                if let Some(reason) = self.cx.cancel_reason() {
                    state.phase = Phase::Abandoned;
                    return Poll::Ready(Outcome::Cancelled(reason));
                }
                state.waker = Some(task.waker().clone());
                Poll::Pending
            }
            Phase::Taken | Phase::Abandoned => {
                unreachable!("acquisition polled after completion")
            }
        }
    }
}

impl Drop for Acquire<'_> {
    fn drop(&mut self) {
        let mut state = self.cell.state.lock().expect("gate cell lock");
        match state.phase {
            Phase::Waiting => state.phase = Phase::Abandoned,
            // Granted but never observed: hand the grant straight back.
            Phase::Granted => {
                state.phase = Phase::Abandoned;
                let _ = self.intents.send(Intent::Release {
                    access: self.access,
                });
            }
            _ => {}
        }
    }
}

/// The single owner of the gate state.
fn arbiter(intents: Receiver<Intent>, shared: &GateShared) {
    let mut writer = false;
    let mut readers = 0_usize;
    let mut queue: VecDeque<(Access, Arc<GrantCell>)> = VecDeque::new();
    let mut closed = false;

    while let Ok(intent) = intents.recv() {
        match intent {
            Intent::Acquire { access, cell } => {
                if closed {
                    cell.close();
                } else {
                    queue.push_back((access, cell));
                }
            }
            Intent::Release { access } => {
                match access {
                    Access::Write => {
                        assert!(writer, "gate unlock without a writer");
                        assert_eq!(readers, 0, "gate unlock with readers present");
                        writer = false;
                    }
                    Access::Read => {
                        assert!(!writer, "gate read unlock with a writer present");
                        assert!(readers > 0, "gate read unlock without readers");
                        readers -= 1;
                    }
                }
                shared.writer.store(writer, Ordering::Release);
                shared.readers.store(readers, Ordering::Release);
            }
            Intent::Close => {
                if !closed {
                    closed = true;
                    shared.closed.store(true, Ordering::Release);
                    tracing::trace!(target: "sqlgate::gate", waiters = queue.len(), "gate closed");
                    for (_, cell) in queue.drain(..) {
                        cell.close();
                    }
                }
                // Keep serving releases from live tokens until every sender
                // is gone; new acquisitions fail above.
            }
        }

        // Serve the queue strictly in arrival order.
        while let Some((access, _)) = queue.front() {
            let admissible = match access {
                Access::Write => !writer && readers == 0,
                Access::Read => !writer,
            };
            if !admissible {
                break;
            }
            let (access, cell) = queue.pop_front().expect("non-empty queue");
            if cell.try_grant() {
                match access {
                    Access::Write => writer = true,
                    Access::Read => readers += 1,
                }
                assert!(
                    !(writer && readers > 0),
                    "gate granted writer and readers together"
                );
                shared.writer.store(writer, Ordering::Release);
                shared.readers.store(readers, Ordering::Release);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::types::{Budget, RegionId, TaskId};
    use asupersync::util::ArenaIndex;
    use std::task::Wake;
    use std::time::Duration;

    fn test_cx() -> Cx {
        Cx::for_testing()
    }

    fn cancelled_cx() -> Cx {
        let cx = Cx::new(
            RegionId::from_arena(ArenaIndex::new(0, 0)),
            TaskId::from_arena(ArenaIndex::new(0, 0)),
            Budget::INFINITE,
        );
        cx.set_cancel_requested(true);
        cx
    }

    struct NoopWaker;

    impl Wake for NoopWaker {
        fn wake(self: Arc<Self>) {}
    }

    fn block_on<F: Future>(future: F) -> F::Output {
        let waker = Waker::from(Arc::new(NoopWaker));
        let mut context = Context::from_waker(&waker);
        let mut pinned = Box::pin(future);
        loop {
            match pinned.as_mut().poll(&mut context) {
                Poll::Ready(value) => return value,
                Poll::Pending => thread::yield_now(),
            }
        }
    }

    fn poll_once<F: Future>(future: &mut Pin<Box<F>>) -> Poll<F::Output> {
        let waker = Waker::from(Arc::new(NoopWaker));
        let mut context = Context::from_waker(&waker);
        future.as_mut().poll(&mut context)
    }

    fn unwrap_lock(outcome: Outcome<Locked, Error>) -> Locked {
        match outcome {
            Outcome::Ok(token) => token,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    /// The arbiter applies state asynchronously; poll the mirrors briefly.
    fn wait_until(gate: &Gate, pred: impl Fn(&Gate) -> bool) {
        for _ in 0..10_000 {
            if pred(gate) {
                return;
            }
            thread::sleep(Duration::from_micros(100));
        }
        panic!("gate never reached expected state");
    }

    #[test]
    fn test_write_lock_excludes_writers_and_readers() {
        let gate = Gate::new();
        let cx = test_cx();

        let token = unwrap_lock(block_on(gate.lock(&cx)));
        wait_until(&gate, |g| g.is_write_locked());

        let mut second = Box::pin(gate.lock(&cx));
        assert!(poll_once(&mut second).is_pending());
        let mut reader = Box::pin(gate.read_lock(&cx));
        assert!(poll_once(&mut reader).is_pending());

        token.unlock();
        let second = unwrap_lock(block_on(second));
        assert!(gate.is_write_locked());
        assert_eq!(gate.readers(), 0);
        second.unlock();

        let reader = unwrap_lock(block_on(reader));
        wait_until(&gate, |g| !g.is_write_locked() && g.readers() == 1);
        reader.unlock();
        wait_until(&gate, |g| g.readers() == 0);
    }

    #[test]
    fn test_readers_run_in_parallel_and_block_writer_until_all_release() {
        let gate = Gate::new();
        let cx = test_cx();

        let first = unwrap_lock(block_on(gate.read_lock(&cx)));
        let second = unwrap_lock(block_on(gate.read_lock(&cx)));
        wait_until(&gate, |g| g.readers() == 2);

        let mut writer = Box::pin(gate.lock(&cx));
        assert!(poll_once(&mut writer).is_pending());

        first.unlock();
        wait_until(&gate, |g| g.readers() == 1);
        assert!(poll_once(&mut writer).is_pending());

        second.unlock();
        let writer = unwrap_lock(block_on(writer));
        assert!(gate.is_write_locked());
        assert_eq!(gate.readers(), 0);
        writer.unlock();
    }

    #[test]
    fn test_grants_serve_in_arrival_order() {
        let gate = Gate::new();
        let cx = test_cx();

        let token = unwrap_lock(block_on(gate.lock(&cx)));

        // Writer queued first, reader second: the reader must not overtake.
        let mut writer = Box::pin(gate.lock(&cx));
        assert!(poll_once(&mut writer).is_pending());
        let mut reader = Box::pin(gate.read_lock(&cx));
        assert!(poll_once(&mut reader).is_pending());

        token.unlock();
        let writer = unwrap_lock(block_on(writer));
        assert!(poll_once(&mut reader).is_pending());
        writer.unlock();
        unwrap_lock(block_on(reader)).unlock();
    }

    #[test]
    fn test_drop_token_releases() {
        let gate = Gate::new();
        let cx = test_cx();
        {
            let _token = unwrap_lock(block_on(gate.lock(&cx)));
            wait_until(&gate, |g| g.is_write_locked());
        }
        // Dropped without an explicit unlock; the gate must reopen.
        unwrap_lock(block_on(gate.lock(&cx))).unlock();
    }

    #[test]
    fn test_cancelled_acquisition_leaves_no_state() {
        let gate = Gate::new();
        let cx = test_cx();
        let cancelled = cancelled_cx();

        let token = unwrap_lock(block_on(gate.lock(&cx)));
        match block_on(gate.lock(&cancelled)) {
            Outcome::Cancelled(_) => {}
            other => panic!("expected cancellation, got {other:?}"),
        }
        token.unlock();

        // The cancelled waiter must not wedge the gate for later callers.
        unwrap_lock(block_on(gate.lock(&cx))).unlock();
    }

    #[test]
    fn test_abandoned_waiter_is_skipped() {
        let gate = Gate::new();
        let cx = test_cx();

        let token = unwrap_lock(block_on(gate.lock(&cx)));
        let mut abandoned = Box::pin(gate.lock(&cx));
        assert!(poll_once(&mut abandoned).is_pending());
        drop(abandoned);
        token.unlock();

        // The grant skipped the abandoned waiter and reaches this one.
        unwrap_lock(block_on(gate.lock(&cx))).unlock();
    }

    #[test]
    fn test_close_fails_pending_and_future_waiters() {
        let gate = Gate::new();
        let cx = test_cx();

        let token = unwrap_lock(block_on(gate.lock(&cx)));
        let mut pending = Box::pin(gate.lock(&cx));
        assert!(poll_once(&mut pending).is_pending());

        gate.close();
        match block_on(pending) {
            Outcome::Err(e) => assert!(e.is_closed()),
            other => panic!("expected closed error, got {other:?}"),
        }

        wait_until(&gate, |g| g.shared.closed.load(Ordering::Acquire));
        match block_on(gate.read_lock(&cx)) {
            Outcome::Err(e) => assert!(e.is_closed()),
            other => panic!("expected closed error, got {other:?}"),
        }

        // A live token can still release after teardown.
        token.unlock();
    }

    #[test]
    fn test_exclusivity_invariant_under_contention() {
        let gate = Gate::new();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let gate = gate.clone();
            handles.push(thread::spawn(move || {
                let cx = Cx::for_testing();
                for _ in 0..50 {
                    let token = unwrap_lock(block_on(gate.lock(&cx)));
                    // Only the arbiter mutates the mirrors, so a writer must
                    // never observe readers.
                    assert_eq!(gate.readers(), 0);
                    token.unlock();
                    let token = unwrap_lock(block_on(gate.read_lock(&cx)));
                    assert!(!gate.is_write_locked() || gate.readers() == 0);
                    token.unlock();
                }
            }));
        }
        for handle in handles {
            handle.join().expect("contention thread");
        }
    }
}
