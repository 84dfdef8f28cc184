#![no_main]

use h264_rtp::codec::h264::parser::Sps;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(sps) = Sps::parse(data) {
        let _ = sps.visible_resolution();
    }
});
