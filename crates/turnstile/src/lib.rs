// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Asynchronous, cancellable synchronization primitives for cooperative, task-based
//! concurrency.
//!
//! Callers competing for a shared resource suspend instead of blocking an OS thread. Every
//! suspend-capable operation accepts a [`CancellationToken`] and settles with an explicit
//! outcome: the resource, [`AcquireError::Cancelled`], or [`AcquireError::Closed`].
//!
//! # Primitives
//!
//! - [`Counter`]: a non-negative counter with suspend-on-zero decrement, a non-consuming
//!   peek, and [`decrement_any`] for racing a take across several counters.
//! - [`Semaphore`]: a bounded counting semaphore returning a scoped release guard, with a
//!   runtime-adjustable limit and a synchronous timed take.
//! - [`RwLock`]: a shared/exclusive lock with fair and unfair variants and whole-cohort
//!   reader promotion.
//! - [`SwitchLock`]: a bi-directional shared lock; two groups exclude each other but run
//!   concurrently within a group.
//! - [`KeyedLock`]: a map-keyed mutex providing per-key exclusion with a single
//!   close-drains-all lifecycle.
//! - [`TaskStream`]: a serial executor guaranteeing first-in-first-out, one-at-a-time
//!   execution of queued closures, synchronous or async.
//! - [`TaskFlag`]: a coalesced, self-rearming callback driver.
//!
//! The primitives share one internal discipline: a compact atomic state word for the fast
//! path, a short-critical-section waiter queue of pooled, generation-checked waiter nodes,
//! and resumption through the task [`Waker`][std::task::Waker], so no user continuation ever
//! runs on the thread that released the resource. Components that must execute user closures
//! ([`TaskStream`], [`TaskFlag`]) do so through a pluggable [`Spawner`].
//!
//! # Example
//!
//! ```rust
//! use turnstile::{CancellationToken, Semaphore};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let semaphore = Semaphore::new(2);
//!
//! let first = semaphore.take(&CancellationToken::none()).await.unwrap();
//! let second = semaphore.take(&CancellationToken::none()).await.unwrap();
//! assert!(semaphore.try_take().is_none());
//!
//! drop(first);
//! assert!(semaphore.try_take().is_some());
//! # drop(second);
//! # }
//! ```

// Public API surface.
mod cancellation;
mod counter;
mod drain;
mod error;
mod flag;
mod keyed;
mod rwlock;
mod semaphore;
mod spawner;
mod stream;
mod switch;

pub use cancellation::{
    CancellationSource, CancellationToken, Cancelled, Registration, run_with_timeout,
};
pub use counter::{Counter, Decrement, PeekDecrement, decrement_any};
pub use drain::Drain;
pub use error::{AcquireError, AcquireResult, StreamTaskError};
pub use flag::{SetAndWait, TaskFlag};
pub use keyed::{KeyGuard, KeyedLock, LockKey};
pub use rwlock::{LockRead, LockWrite, ReadGuard, RwLock, WriteGuard};
pub use semaphore::{Semaphore, SemaphoreGuard, Take};
pub use spawner::{CustomSpawner, PoolSpawner, Spawner};
pub use stream::{Completion, QueuedTask, TaskStream};
pub use switch::{LockSide, Side, SwitchGuard, SwitchLock};

// Internal plumbing shared across the primitives.
mod constants;
mod timer;
mod waiter;

pub(crate) use constants::ERR_POISONED_LOCK;
