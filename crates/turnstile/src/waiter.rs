// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pooled waiter nodes shared by the acquire paths of every lock-style primitive.
//!
//! A waiter represents one suspended acquire. Its whole lifecycle is carried by a single
//! `AtomicU32` packing a 16-bit wrapping generation together with the state byte, so a state
//! transition and the stale-generation check are one compare-and-set. Queue entries hold
//! `(waiter, generation)` pairs; an entry whose generation no longer matches refers to a
//! recycled waiter and is discarded on pop. The resume continuation is the task [`Waker`]:
//! granting or faulting a waiter wakes the suspended task, and the task's own executor runs
//! the continuation, never the releasing thread.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Waker;

use futures::task::AtomicWaker;

use crate::constants::{ERR_POISONED_LOCK, ERR_STALE_LEASE};

/// Where a waiter is in its lifecycle.
///
/// `Pending` is the only state other parties may transition away from; every transition out
/// of it is a single compare-and-set, so exactly one of grant, cancel and close wins a race.
/// The terminal states are absorbing until the lease holder recycles the waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WaitState {
    /// In the pool, not leased.
    Idle = 0,

    /// Leased and enqueued; the owning task is suspended.
    Pending = 1,

    /// The primitive handed the resource to this waiter.
    Granted = 2,

    /// The caller's token fired, or the acquire future was dropped, before a grant.
    Cancelled = 3,

    /// The owning primitive was closed while this waiter was pending.
    Closed = 4,
}

impl WaitState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Pending,
            2 => Self::Granted,
            3 => Self::Cancelled,
            4 => Self::Closed,
            _ => unreachable!("corrupt waiter state byte"),
        }
    }
}

const fn pack(generation: u16, state: u8) -> u32 {
    ((generation as u32) << 8) | state as u32
}

fn unpack(packed: u32) -> (u16, WaitState) {
    let generation = u16::try_from(packed >> 8).expect("generation bits exceed u16");
    let state = WaitState::from_raw(u8::try_from(packed & 0xFF).expect("state bits exceed u8"));
    (generation, state)
}

/// One pooled waiter node.
#[derive(Debug)]
pub(crate) struct Waiter {
    packed: AtomicU32,
    waker: AtomicWaker,
}

impl Waiter {
    fn new() -> Self {
        Self {
            packed: AtomicU32::new(pack(0, WaitState::Idle as u8)),
            waker: AtomicWaker::new(),
        }
    }

    fn load(&self) -> (u16, WaitState) {
        unpack(self.packed.load(Ordering::Acquire))
    }

    /// Single compare-and-set covering both the generation check and the state transition.
    fn transition(&self, generation: u16, from: WaitState, to: WaitState) -> bool {
        self.packed
            .compare_exchange(
                pack(generation, from as u8),
                pack(generation, to as u8),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// The acquire future's exclusive handle on a leased waiter.
///
/// Only the lease holder may recycle the waiter, so the generation cannot advance while a
/// lease is live; reading through a lease therefore always observes the leased generation.
#[derive(Debug)]
pub(crate) struct Lease {
    waiter: Arc<Waiter>,
    generation: u16,
}

impl Lease {
    pub(crate) fn state(&self) -> WaitState {
        let (generation, state) = self.waiter.load();
        assert!(generation == self.generation, "{ERR_STALE_LEASE}");
        state
    }

    pub(crate) fn transition(&self, from: WaitState, to: WaitState) -> bool {
        self.waiter.transition(self.generation, from, to)
    }

    /// Registers the suspended task's waker. Callers re-register on every poll and re-check
    /// state afterwards, per the usual waker race protocol.
    pub(crate) fn register(&self, waker: &Waker) {
        self.waiter.waker.register(waker);
    }

    /// A queue entry referring to this lease.
    pub(crate) fn entry(&self) -> Entry {
        Entry {
            waiter: Arc::clone(&self.waiter),
            generation: self.generation,
        }
    }

    /// Whether `entry` refers to this lease's waiter and generation.
    pub(crate) fn owns(&self, entry: &Entry) -> bool {
        self.generation == entry.generation && Arc::ptr_eq(&self.waiter, &entry.waiter)
    }
}

/// A `(waiter, generation)` pair stored in a primitive's queue.
///
/// Entries are cheap clones; any number may exist for one lease. All of their operations are
/// generation-checked, so entries outliving a recycle are inert.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    waiter: Arc<Waiter>,
    generation: u16,
}

impl Entry {
    /// Whether the waiter is still pending under this entry's generation.
    pub(crate) fn is_live(&self) -> bool {
        self.waiter.load() == (self.generation, WaitState::Pending)
    }

    /// Transitions to `Granted` without waking. Used by cohort promotion, which publishes
    /// the primitive's state word before waking anyone.
    pub(crate) fn grant_quietly(&self) -> bool {
        self.waiter
            .transition(self.generation, WaitState::Pending, WaitState::Granted)
    }

    /// Faults the waiter with `Closed` and wakes it.
    pub(crate) fn fault_closed(&self) -> bool {
        if self
            .waiter
            .transition(self.generation, WaitState::Pending, WaitState::Closed)
        {
            self.wake();
            true
        } else {
            false
        }
    }

    /// Cancels the waiter and wakes it. Invoked from cancellation-token callbacks.
    pub(crate) fn cancel(&self) -> bool {
        if self
            .waiter
            .transition(self.generation, WaitState::Pending, WaitState::Cancelled)
        {
            self.wake();
            true
        } else {
            false
        }
    }

    pub(crate) fn wake(&self) {
        self.waiter.waker.wake();
    }
}

/// Per-primitive free list of waiter nodes.
///
/// A primitive leases a waiter per suspended acquire and recycles it once the acquire has
/// settled and left every queue reachable only through stale entries.
#[derive(Debug, Default)]
pub(crate) struct WaiterPool {
    free: Mutex<Vec<Arc<Waiter>>>,
}

impl WaiterPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Leases a waiter in the `Pending` state.
    pub(crate) fn lease(&self) -> Lease {
        let waiter = self
            .free
            .lock()
            .expect(ERR_POISONED_LOCK)
            .pop()
            .unwrap_or_else(|| Arc::new(Waiter::new()));

        let (generation, state) = waiter.load();
        debug_assert!(state == WaitState::Idle, "pooled waiter was not idle");

        // No store contention is possible: every outstanding entry for this waiter carries an
        // older generation, and generation-checked transitions are the only other writers.
        waiter
            .packed
            .store(pack(generation, WaitState::Pending as u8), Ordering::Release);

        Lease { waiter, generation }
    }

    /// Recycles a settled waiter: bumps the generation (invalidating every outstanding
    /// entry), clears the waker and returns the node to the free list.
    ///
    /// The lease must have left `Pending` first; recycling a pending waiter would race with
    /// grant and fault transitions.
    pub(crate) fn recycle(&self, lease: Lease) {
        let (generation, state) = lease.waiter.load();
        assert!(generation == lease.generation, "{ERR_STALE_LEASE}");
        debug_assert!(
            state != WaitState::Pending && state != WaitState::Idle,
            "waiter recycled while still pending"
        );

        let _stale_waker = lease.waiter.waker.take();
        lease.waiter.packed.store(
            pack(generation.wrapping_add(1), WaitState::Idle as u8),
            Ordering::Release,
        );

        self.free.lock().expect(ERR_POISONED_LOCK).push(lease.waiter);
    }
}
