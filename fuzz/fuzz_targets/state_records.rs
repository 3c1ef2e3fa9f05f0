//! Arbitrary bytes fed to the lock and job record decoders.
//!
//! Whatever sits in the state store, decoding must yield a record or
//! absence, never a panic. Decoded records must survive re-encoding.
#![no_main]

use inbox_sync_core::{GlobalJobState, LockRecord, SingleJobState};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    if let Some(lock) = LockRecord::parse(text) {
        let encoded = serde_json::to_string(&lock).expect("lock record re-encodes");
        assert_eq!(LockRecord::parse(&encoded), Some(lock));
    }

    if let Ok(mut global) = serde_json::from_str::<GlobalJobState>(text) {
        global.push_error("fuzz", "entry", global.started_at);
        let _ = serde_json::to_string(&global).expect("global record re-encodes");
    }

    if let Ok(single) = serde_json::from_str::<SingleJobState>(text) {
        let _ = serde_json::to_string(&single).expect("single record re-encodes");
    }
});
