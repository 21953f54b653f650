#![no_main]

use agent_sessions::sessions::codec::{decode_document, encode_document};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };
    // Anything that decodes must re-encode into something that decodes again.
    if let Ok(document) = decode_document(raw) {
        let encoded = encode_document(&document).expect("decoded document re-encodes");
        let again = decode_document(&encoded).expect("re-encoded document decodes");
        assert_eq!(again.events.len(), document.events.len());
        let _ = document.into_session();
    }
});
