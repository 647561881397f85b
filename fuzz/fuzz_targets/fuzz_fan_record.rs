//! Fuzz target: persisted fan record decoder
//!
//! Drives `FanRecord::decode` with arbitrary NVS blob contents and
//! verifies:
//! - No panics on truncated or garbage blobs
//! - Any accepted record satisfies the duty and curve invariants
//! - An accepted record re-encodes to a blob that decodes identically
//!
//! cargo fuzz run fuzz_fan_record

#![no_main]

use libfuzzer_sys::fuzz_target;
use rackctl::fan::record::{FanRecord, RECORD_VERSION};

fuzz_target!(|data: &[u8]| {
    let Ok(rec) = FanRecord::decode(data) else {
        return;
    };
    assert_eq!(rec.version, RECORD_VERSION);
    assert!(rec.duty <= 100 && rec.min_duty <= rec.max_duty && rec.max_duty <= 100);
    assert!(rec.curve.windows(2).all(|w| w[0].temp < w[1].temp));

    let blob = rec.encode().expect("accepted record encodes");
    assert_eq!(FanRecord::decode(&blob).ok(), Some(rec));
});
