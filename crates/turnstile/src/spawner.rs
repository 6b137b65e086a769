// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! [`Spawner`] enum for plugging in runtime implementations.

use std::pin::Pin;
use std::sync::Arc;

type BoxedFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type SpawnFn = dyn Fn(BoxedFuture) + Send + Sync;

/// Runtime-agnostic work-item dispatch.
///
/// The serial executor and the task flag need a "queue this work item" facility so user
/// closures never execute on the thread that enqueued or released them. `Spawner` abstracts
/// that facility across runtimes: use the built-in variants for common setups, or
/// [`Spawner::new_custom`] for anything else.
///
/// # Examples
///
/// Using Tokio:
///
/// ```rust
/// use turnstile::Spawner;
///
/// # #[tokio::main]
/// # async fn main() {
/// let spawner = Spawner::Tokio;
/// spawner.spawn(async {
///     println!("work item running");
/// });
/// # }
/// ```
///
/// Without an async runtime, a background thread pool drives the work items:
///
/// ```rust
/// use turnstile::Spawner;
///
/// let spawner = Spawner::background_pool(2);
/// spawner.spawn(async {
///     println!("work item running");
/// });
/// ```
#[derive(Debug, Clone)]
pub enum Spawner {
    /// Spawns work items using [`tokio::spawn`].
    ///
    /// # Panics
    ///
    /// Panics if used outside of a Tokio runtime context.
    #[cfg(feature = "tokio")]
    Tokio,

    /// Drives each work item to completion on a background thread pool.
    ///
    /// Created via [`Spawner::background_pool`].
    Pool(PoolSpawner),

    /// Custom spawn implementation.
    ///
    /// Created via [`Spawner::new_custom`].
    Custom(CustomSpawner),
}

impl Spawner {
    /// Creates a spawner backed by `threads` background threads.
    ///
    /// Each work item is driven to completion on one of the threads, which blocks that thread
    /// for the duration of the item. Suitable when no async runtime is present; size the pool
    /// for the expected number of concurrently suspended items.
    #[must_use]
    pub fn background_pool(threads: usize) -> Self {
        assert!(threads >= 1, "a spawner pool requires at least one thread");

        Self::Pool(PoolSpawner {
            pool: threadpool::ThreadPool::new(threads),
        })
    }

    /// Creates a custom spawner from a closure.
    ///
    /// The closure receives a boxed, pinned future and is responsible for scheduling it on
    /// the appropriate runtime.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use turnstile::Spawner;
    ///
    /// let spawner = Spawner::new_custom(|fut| {
    ///     std::thread::spawn(move || futures::executor::block_on(fut));
    /// });
    /// ```
    pub fn new_custom<F>(f: F) -> Self
    where
        F: Fn(BoxedFuture) + Send + Sync + 'static,
    {
        Self::Custom(CustomSpawner(Arc::new(f)))
    }

    /// Queues a work item.
    ///
    /// The item runs independently of the caller and its output is discarded; use a channel
    /// or event to observe results.
    pub fn spawn(&self, work: impl Future<Output = ()> + Send + 'static) {
        match self {
            #[cfg(feature = "tokio")]
            Self::Tokio => {
                ::tokio::spawn(work);
            }
            Self::Pool(pool) => pool.spawn(Box::pin(work)),
            Self::Custom(custom) => (custom.0)(Box::pin(work)),
        }
    }
}

/// Thread-pool backed spawner; see [`Spawner::background_pool`].
#[derive(Debug, Clone)]
pub struct PoolSpawner {
    pool: threadpool::ThreadPool,
}

impl PoolSpawner {
    fn spawn(&self, work: BoxedFuture) {
        self.pool.execute(move || futures::executor::block_on(work));
    }
}

/// Internal wrapper for custom spawn functions.
#[derive(Clone)]
pub struct CustomSpawner(Arc<SpawnFn>);

impl std::fmt::Debug for CustomSpawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomSpawner").finish_non_exhaustive()
    }
}
