//! Fuzz target for decoding positional `sync` arguments.
//!
//! The argument list comes straight off the wire. Decoding must reject
//! garbage with an error, never a panic.

#![no_main]

use container_replicator::driver::SyncArgs;
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(Value::Array(args)) = serde_json::from_slice::<Value>(data) else {
        return;
    };

    if let Ok(parsed) = SyncArgs::from_args(&args) {
        // Whatever decodes re-encodes to something that decodes the same
        let again = SyncArgs::from_args(&parsed.to_args()).expect("re-encoded args must parse");
        assert_eq!(again, parsed);
        let _ = parsed.policy_state();
    }
});
