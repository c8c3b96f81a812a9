#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Frame-level decode robustness from arbitrary bytes:
    // - header field parsing
    // - version/class/opcode validation
    // - declared-length bounds (never trust the length field)
    // - partial-frame handling at every split point
    let mut buf = BytesMut::from(data);
    while let Ok(Some(frame)) = ssafab_wire::Frame::decode(&mut buf) {
        // A decoded frame must re-encode to a decodable frame.
        let mut out = BytesMut::new();
        frame.encode(&mut out);
        let redecoded = ssafab_wire::Frame::decode(&mut out)
            .expect("re-encoded frame must decode")
            .expect("re-encoded frame must be complete");
        assert_eq!(redecoded, frame);
    }
});
