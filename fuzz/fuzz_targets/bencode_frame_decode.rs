#![no_main]

use libfuzzer_sys::fuzz_target;
use replcheck_transport::bencode::{decode_prefix, encode};
use replcheck_transport::Frame;

fuzz_target!(|data: &[u8]| {
    let Ok(Some((value, used))) = decode_prefix(data) else {
        return;
    };
    assert!(used > 0 && used <= data.len());

    let reencoded = encode(&value);
    let Ok(Some((again, again_used))) = decode_prefix(&reencoded) else {
        panic!("re-encoded value must decode");
    };
    assert_eq!(again, value);
    assert_eq!(again_used, reencoded.len());

    if let Some(frame) = Frame::from_bencode(value) {
        let round_trip = Frame::from_bencode(frame.to_bencode()).expect("frame dict");
        assert_eq!(round_trip.status, frame.status);
        assert_eq!(round_trip.id, frame.id);
    }
});
