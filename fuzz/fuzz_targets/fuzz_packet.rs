#![no_main]

use devbridge::core::packet::{Packet, ProtocolVersion};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Fuzz packet parsing - test for panics, crashes, infinite loops
    let _ = Packet::from_bytes(data, ProtocolVersion::V1, 64 * 1024);
    let _ = Packet::from_bytes(data, ProtocolVersion::V2, 64 * 1024);
});
