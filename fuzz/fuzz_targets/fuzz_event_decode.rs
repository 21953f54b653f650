#![no_main]

use agent_sessions::sessions::codec::decode_event;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(raw) = std::str::from_utf8(data) {
        if let Ok(record) = decode_event(raw) {
            assert!(!record.author.trim().is_empty());
        }
    }
});
