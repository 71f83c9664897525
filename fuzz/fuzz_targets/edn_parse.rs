#![no_main]

use libfuzzer_sys::fuzz_target;
use replcheck_core::parse_edn;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    if let Ok(value) = parse_edn(&raw) {
        let printed = value.to_string();
        assert!(!printed.is_empty());
        let _ = value.to_display_text();
    }
});
