#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Structured admin payload decoders must reject malformed input
    // without panicking.
    if let Ok(snapshot) = ssafab_wire::decode_counters(data) {
        let encoded = ssafab_wire::encode_counters(&snapshot);
        assert_eq!(
            ssafab_wire::decode_counters(&encoded).expect("round-trip"),
            snapshot
        );
    }
    if let Ok(info) = ssafab_wire::decode_node_info(data) {
        let encoded = ssafab_wire::encode_node_info(&info);
        assert_eq!(
            ssafab_wire::decode_node_info(&encoded).expect("round-trip"),
            info
        );
    }
    let _ = ssafab_wire::decode_disconnect(data);
});
