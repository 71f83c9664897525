#![no_main]

use libfuzzer_sys::fuzz_target;
use replcheck_report::{normalize_output, NormalizerConfig};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let config = NormalizerConfig::default();
    let normalized = normalize_output(&raw, &config);
    assert!(normalized.lines().count() <= raw.lines().count() * 2 + 1);
});
