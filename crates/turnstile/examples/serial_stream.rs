// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Drives a serial task stream on a background thread pool, without an async runtime.

use std::sync::Arc;

use turnstile::{Counter, Spawner, TaskStream};

fn main() {
    let stream = TaskStream::new(Spawner::background_pool(2));
    let produced = Arc::new(Counter::new(0));

    // Queued closures run strictly one at a time, in order, even though the pool has two
    // threads available.
    let mut results = Vec::new();
    for index in 0..4_u32 {
        let produced = Arc::clone(&produced);
        results.push(stream.queue(move || {
            produced.increment().expect("counter is open");
            format!("step {index}")
        }));
    }

    for result in results {
        let value = futures::executor::block_on(result).expect("closure completed");
        println!("{value}");
    }

    // A consumer can suspend on the counter the producers above incremented.
    assert_eq!(produced.count(), 4);
    for _ in 0..4 {
        assert!(produced.try_decrement());
    }

    futures::executor::block_on(stream.completion());
    println!("drained; pending = {}", stream.pending_actions());
}
