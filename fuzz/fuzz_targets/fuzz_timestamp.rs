//! Fuzz target for timestamp parsing.
//!
//! Timestamps arrive from peers as strings, so parsing must never panic,
//! and anything that parses must survive a trip through the internal form.

#![no_main]

use container_replicator::reconciler::ReconcilerNaming;
use container_replicator::timestamp::Timestamp;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Should never panic
    let Ok(ts) = data.parse::<Timestamp>() else {
        return;
    };

    let reparsed: Timestamp = ts.internal().parse().expect("internal form must parse");
    assert_eq!(reparsed, ts);

    // Bucketing any parsed timestamp is total
    let naming = ReconcilerNaming::default();
    let start = naming.bucket_start(ts);
    assert!(start <= ts.as_secs());
});
