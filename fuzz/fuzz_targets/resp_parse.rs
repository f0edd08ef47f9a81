#![no_main]

use listbuffer_core::broker::resp;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(Some((value, consumed))) = resp::parse(data) else {
        return;
    };
    assert!(consumed > 0 && consumed <= data.len());

    // A frame is self-delimiting: the consumed prefix alone parses to the
    // same value, and anything shorter is incomplete or rejected.
    match resp::parse(&data[..consumed]) {
        Ok(Some((again, n))) => {
            assert_eq!(n, consumed);
            assert_eq!(again, value);
        }
        other => panic!("prefix of a complete frame did not parse: {other:?}"),
    }
    if let Ok(Some((_, n))) = resp::parse(&data[..consumed - 1]) {
        panic!("truncated frame parsed as complete ({n} bytes)");
    }
});
