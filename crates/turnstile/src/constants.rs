// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

// If a lock is poisoned then safety invariants may have been violated and execution cannot
// continue because we can no longer uphold the guarantees of the synchronization primitives.
pub const ERR_POISONED_LOCK: &str = "poisoned lock - cannot continue execution because synchronization guarantees can no longer be upheld";

// A lease outliving its pooled waiter generation means a waiter was recycled while still
// referenced by the one party allowed to drive it. That is a bookkeeping bug, not a race.
pub const ERR_STALE_LEASE: &str = "waiter lease used after its pooled waiter was recycled";
