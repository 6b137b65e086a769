// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::task::{self, Poll};

use crate::error::{AcquireError, AcquireResult};
use crate::waiter::{Entry, Lease, WaitState, WaiterPool};
use crate::{CancellationToken, ERR_POISONED_LOCK};

/// A non-negative counter with suspend-on-zero semantics.
///
/// Callers take units with [`decrement`][Self::decrement] (suspending while the count is
/// zero) and return them with [`increment`][Self::increment]. A non-consuming
/// [`peek_decrement`][Self::peek_decrement] resolves as soon as a decrement would currently
/// succeed, which is what [`decrement_any`] uses to multiplex over several counters.
///
/// # State encoding
///
/// A single signed word encodes both the count and closure: `C >= 0` means alive with count
/// `C`; `C < 0` means closed with count `!C`. `-1` is therefore closed-and-empty. Decrement
/// moves the word toward `0` from positive values and toward `-1` from negative values, so
/// close and decrement share one atomic word and unit accounting survives closure.
///
/// # Ordering
///
/// Suspended decrementers are resumed first-in-first-out. Peekers carry no ordering
/// guarantee and are released as a batch after every published unit.
#[derive(Debug)]
pub struct Counter {
    state: AtomicI64,
    decrementers: Mutex<VecDeque<Entry>>,
    peekers: Mutex<Vec<Entry>>,
    pool: WaiterPool,
}

impl Default for Counter {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Counter {
    /// Creates a counter holding `initial` units.
    #[must_use]
    pub fn new(initial: usize) -> Self {
        let initial = i64::try_from(initial).expect("initial count exceeds the representable range");

        Self {
            state: AtomicI64::new(initial),
            decrementers: Mutex::new(VecDeque::new()),
            peekers: Mutex::new(Vec::new()),
            pool: WaiterPool::new(),
        }
    }

    /// The number of units currently available, whether or not the counter is closed.
    #[must_use]
    pub fn count(&self) -> usize {
        let current = self.state.load(Ordering::Acquire);
        let count = if current >= 0 { current } else { !current };

        usize::try_from(count).expect("decoded count is non-negative by construction")
    }

    /// Whether [`close`][Self::close] (or [`close_if_zero`][Self::close_if_zero]) succeeded.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) < 0
    }

    /// Takes one unit if any is available right now. Succeeds on a closed counter that still
    /// holds units.
    pub fn try_decrement(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);

        loop {
            let next = if current > 0 {
                current - 1
            } else if current < -1 {
                current + 1
            } else {
                return false;
            };

            match self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Whether a [`try_decrement`][Self::try_decrement] would succeed right now.
    #[must_use]
    pub fn try_peek_decrement(&self) -> bool {
        let current = self.state.load(Ordering::Acquire);
        current > 0 || current < -1
    }

    /// Takes one unit, suspending until one is published.
    ///
    /// Fails with [`AcquireError::Closed`] when the counter is closed and empty, and with
    /// [`AcquireError::Cancelled`] when `token` fires before a unit is granted.
    pub fn decrement(&self, token: &CancellationToken) -> Decrement<'_> {
        Decrement {
            counter: self,
            token: token.clone(),
            stage: Stage::Init,
        }
    }

    /// Resolves once a decrement would currently succeed, without consuming a unit.
    ///
    /// By the time the caller reacts, a racing decrementer may already have taken the unit;
    /// the caller is expected to follow up with [`try_decrement`][Self::try_decrement] and
    /// re-attach on failure.
    pub fn peek_decrement(&self, token: &CancellationToken) -> PeekDecrement<'_> {
        PeekDecrement {
            counter: self,
            token: token.clone(),
            stage: Stage::Init,
        }
    }

    /// Publishes one unit.
    ///
    /// The unit is handed to the oldest live decrement waiter if there is one; otherwise it
    /// stays in the count. All pending peekers are resolved afterwards. Fails with
    /// [`AcquireError::Closed`] on a closed counter.
    pub fn increment(&self) -> AcquireResult<()> {
        let mut current = self.state.load(Ordering::Acquire);

        loop {
            if current < 0 {
                return Err(AcquireError::Closed);
            }

            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        self.dispatch_unit();
        Ok(())
    }

    /// Publishes one unit even on a closed counter.
    ///
    /// This is how a unit taken from a counter that closed mid-race is returned without
    /// being lost; see [`decrement_any`].
    pub fn force_increment(&self) {
        self.publish_unit();
        self.dispatch_unit();
    }

    /// Closes the counter, faulting every pending decrementer and peeker with
    /// [`AcquireError::Closed`]. Units already in the count remain takeable. Idempotent.
    pub fn close(&self) {
        let mut current = self.state.load(Ordering::Acquire);

        loop {
            if current < 0 {
                return;
            }

            match self.state.compare_exchange_weak(
                current,
                !current,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        tracing::debug!("counter closed");
        self.fault_waiters();
    }

    /// Closes the counter only if it holds exactly zero units.
    ///
    /// The close is a single compare-and-set from `0` to `-1`, so it cannot interleave with
    /// a concurrent [`increment`][Self::increment]: either the increment publishes first and
    /// this fails, or the close wins and the increment observes a closed counter.
    pub fn close_if_zero(&self) -> bool {
        if self
            .state
            .compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!("counter closed at zero");
            self.fault_waiters();
            true
        } else {
            false
        }
    }

    /// Adds one unit to the raw count without waking anyone.
    fn publish_unit(&self) {
        let mut current = self.state.load(Ordering::Acquire);

        loop {
            let next = if current >= 0 { current + 1 } else { current - 1 };

            match self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Hands a freshly published unit to the oldest live decrement waiter, then resolves all
    /// pending peekers as a batch.
    fn dispatch_unit(&self) {
        let granted = {
            let mut queue = self.decrementers.lock().expect(ERR_POISONED_LOCK);
            let mut granted = None;

            while let Some(entry) = queue.pop_front() {
                if !entry.is_live() {
                    continue;
                }

                if !self.try_decrement() {
                    // A racing caller consumed the unit synchronously; the waiter stays
                    // queued for the next one.
                    queue.push_front(entry);
                    break;
                }

                if entry.grant_quietly() {
                    granted = Some(entry);
                    break;
                }

                // Cancelled between the liveness check and the grant; return the unit and
                // try the next waiter.
                self.publish_unit();
            }

            granted
        };

        if let Some(entry) = granted {
            entry.wake();
        }

        self.release_peekers();
    }

    fn release_peekers(&self) {
        let resolved: Vec<Entry> = {
            let mut peekers = self.peekers.lock().expect(ERR_POISONED_LOCK);
            peekers.drain(..).filter(Entry::grant_quietly).collect()
        };

        for entry in resolved {
            entry.wake();
        }
    }

    fn fault_waiters(&self) {
        let decrementers: Vec<Entry> = {
            let mut queue = self.decrementers.lock().expect(ERR_POISONED_LOCK);
            queue.drain(..).collect()
        };
        let peekers: Vec<Entry> = {
            let mut peekers = self.peekers.lock().expect(ERR_POISONED_LOCK);
            peekers.drain(..).collect()
        };

        for entry in decrementers.into_iter().chain(peekers) {
            entry.fault_closed();
        }
    }
}

/// Takes one unit from whichever of `counters` first has one available.
///
/// All counters are first probed synchronously in order. If none has a unit, a peek is
/// attached to every counter; when one resolves, the take is re-attempted there and the race
/// re-enters if a competitor stole the unit. The resolved value is the index of the counter
/// the unit was taken from.
///
/// Fails with [`AcquireError::Closed`] as soon as any participating counter closes without a
/// winner, and with [`AcquireError::Cancelled`] when `token` fires first.
///
/// # Panics
///
/// Panics if `counters` is empty.
pub async fn decrement_any(
    counters: &[&Counter],
    token: &CancellationToken,
) -> AcquireResult<usize> {
    assert!(
        !counters.is_empty(),
        "decrement_any requires at least one counter"
    );

    loop {
        for (index, counter) in counters.iter().enumerate() {
            if counter.try_decrement() {
                return Ok(index);
            }
        }

        let peeks: Vec<_> = counters
            .iter()
            .map(|counter| Box::pin(counter.peek_decrement(token)))
            .collect();

        // Dropping the losing peeks detaches their token registrations and recycles their
        // waiters; nothing is consumed by a peek, so no unit needs returning here.
        let (outcome, index, _remaining) = futures::future::select_all(peeks).await;
        outcome?;

        if counters[index].try_decrement() {
            return Ok(index);
        }
    }
}

#[derive(Debug)]
enum Stage {
    Init,
    Waiting {
        lease: Lease,
        _registration: crate::Registration,
    },
    Done,
}

/// Future returned by [`Counter::decrement`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled or awaited"]
pub struct Decrement<'a> {
    counter: &'a Counter,
    token: CancellationToken,
    stage: Stage,
}

enum FastPath {
    Acquired,
    Closed,
    Enqueued(Lease),
}

impl Future for Decrement<'_> {
    type Output = AcquireResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            match &this.stage {
                Stage::Init => {
                    if this.token.is_cancelled() {
                        this.stage = Stage::Done;
                        return Poll::Ready(Err(AcquireError::Cancelled));
                    }

                    if this.counter.try_decrement() {
                        this.stage = Stage::Done;
                        return Poll::Ready(Ok(()));
                    }

                    let outcome = {
                        let mut queue = this.counter.decrementers.lock().expect(ERR_POISONED_LOCK);

                        // Re-checked under the queue lock so a unit published in between
                        // cannot slip past a waiter that is about to enqueue.
                        if this.counter.try_decrement() {
                            FastPath::Acquired
                        } else if this.counter.is_closed() {
                            FastPath::Closed
                        } else {
                            let lease = this.counter.pool.lease();
                            lease.register(cx.waker());
                            queue.push_back(lease.entry());
                            FastPath::Enqueued(lease)
                        }
                    };

                    match outcome {
                        FastPath::Acquired => {
                            this.stage = Stage::Done;
                            return Poll::Ready(Ok(()));
                        }
                        FastPath::Closed => {
                            this.stage = Stage::Done;
                            return Poll::Ready(Err(AcquireError::Closed));
                        }
                        FastPath::Enqueued(lease) => {
                            let entry = lease.entry();
                            let registration = this.token.register(move || {
                                entry.cancel();
                            });

                            this.stage = Stage::Waiting {
                                lease,
                                _registration: registration,
                            };
                            // Fall through to observe a token that fired during registration.
                        }
                    }
                }
                Stage::Waiting { lease, .. } => match lease.state() {
                    WaitState::Pending => {
                        lease.register(cx.waker());

                        if lease.state() == WaitState::Pending {
                            return Poll::Pending;
                        }
                    }
                    WaitState::Granted => {
                        this.settle();
                        return Poll::Ready(Ok(()));
                    }
                    WaitState::Cancelled => {
                        this.settle();
                        return Poll::Ready(Err(AcquireError::Cancelled));
                    }
                    WaitState::Closed => {
                        this.settle();
                        return Poll::Ready(Err(AcquireError::Closed));
                    }
                    WaitState::Idle => unreachable!("leased waiter observed as idle"),
                },
                Stage::Done => panic!("future polled after completion"),
            }
        }
    }
}

impl Decrement<'_> {
    /// Retires the waiter after its outcome has been observed.
    fn settle(&mut self) {
        if let Stage::Waiting { lease, .. } = std::mem::replace(&mut self.stage, Stage::Done) {
            if lease.state() != WaitState::Granted {
                // Granted waiters were already popped by the dispatcher; everything else
                // still has an entry sitting in the queue.
                let mut queue = self.counter.decrementers.lock().expect(ERR_POISONED_LOCK);
                queue.retain(|entry| !lease.owns(entry));
            }

            self.counter.pool.recycle(lease);
        }
    }
}

impl Drop for Decrement<'_> {
    fn drop(&mut self) {
        if let Stage::Waiting { lease, .. } = std::mem::replace(&mut self.stage, Stage::Done) {
            if lease.transition(WaitState::Pending, WaitState::Cancelled) {
                let mut queue = self.counter.decrementers.lock().expect(ERR_POISONED_LOCK);
                queue.retain(|entry| !lease.owns(entry));
            } else if lease.state() == WaitState::Granted {
                // The unit was handed to us but never observed; pass it on.
                self.counter.force_increment();
            }

            self.counter.pool.recycle(lease);
        }
    }
}

/// Future returned by [`Counter::peek_decrement`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled or awaited"]
pub struct PeekDecrement<'a> {
    counter: &'a Counter,
    token: CancellationToken,
    stage: Stage,
}

impl Future for PeekDecrement<'_> {
    type Output = AcquireResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            match &this.stage {
                Stage::Init => {
                    if this.token.is_cancelled() {
                        this.stage = Stage::Done;
                        return Poll::Ready(Err(AcquireError::Cancelled));
                    }

                    if this.counter.try_peek_decrement() {
                        this.stage = Stage::Done;
                        return Poll::Ready(Ok(()));
                    }

                    let outcome = {
                        let mut peekers = this.counter.peekers.lock().expect(ERR_POISONED_LOCK);

                        if this.counter.try_peek_decrement() {
                            FastPath::Acquired
                        } else if this.counter.is_closed() {
                            FastPath::Closed
                        } else {
                            let lease = this.counter.pool.lease();
                            lease.register(cx.waker());
                            peekers.push(lease.entry());
                            FastPath::Enqueued(lease)
                        }
                    };

                    match outcome {
                        FastPath::Acquired => {
                            this.stage = Stage::Done;
                            return Poll::Ready(Ok(()));
                        }
                        FastPath::Closed => {
                            this.stage = Stage::Done;
                            return Poll::Ready(Err(AcquireError::Closed));
                        }
                        FastPath::Enqueued(lease) => {
                            let entry = lease.entry();
                            let registration = this.token.register(move || {
                                entry.cancel();
                            });

                            this.stage = Stage::Waiting {
                                lease,
                                _registration: registration,
                            };
                        }
                    }
                }
                Stage::Waiting { lease, .. } => match lease.state() {
                    WaitState::Pending => {
                        lease.register(cx.waker());

                        if lease.state() == WaitState::Pending {
                            return Poll::Pending;
                        }
                    }
                    WaitState::Granted => {
                        this.settle();
                        return Poll::Ready(Ok(()));
                    }
                    WaitState::Cancelled => {
                        this.settle();
                        return Poll::Ready(Err(AcquireError::Cancelled));
                    }
                    WaitState::Closed => {
                        this.settle();
                        return Poll::Ready(Err(AcquireError::Closed));
                    }
                    WaitState::Idle => unreachable!("leased waiter observed as idle"),
                },
                Stage::Done => panic!("future polled after completion"),
            }
        }
    }
}

impl PeekDecrement<'_> {
    fn settle(&mut self) {
        if let Stage::Waiting { lease, .. } = std::mem::replace(&mut self.stage, Stage::Done) {
            if lease.state() != WaitState::Granted {
                let mut peekers = self.counter.peekers.lock().expect(ERR_POISONED_LOCK);
                peekers.retain(|entry| !lease.owns(entry));
            }

            self.counter.pool.recycle(lease);
        }
    }
}

impl Drop for PeekDecrement<'_> {
    fn drop(&mut self) {
        if let Stage::Waiting { lease, .. } = std::mem::replace(&mut self.stage, Stage::Done) {
            if lease.transition(WaitState::Pending, WaitState::Cancelled) {
                let mut peekers = self.counter.peekers.lock().expect(ERR_POISONED_LOCK);
                peekers.retain(|entry| !lease.owns(entry));
            }

            // Peeks consume nothing, so a granted-but-unobserved peek needs no restitution.
            self.counter.pool.recycle(lease);
        }
    }
}
