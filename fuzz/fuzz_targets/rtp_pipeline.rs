#![no_main]

use std::sync::Arc;

use bytes::Bytes;
use h264_rtp::channel::ChannelConfig;
use h264_rtp::channel::RtpPipeline;
use h264_rtp::event::NullSink;
use libfuzzer_sys::fuzz_target;

// Each datagram is prefixed with its length on one byte.
fuzz_target!(|data: &[u8]| {
    let mut pipeline = RtpPipeline::new(&ChannelConfig::default(), Arc::new(NullSink));
    pipeline.set_handler(|_| Ok(()));

    let mut data = data;
    while let Some((&len, rest)) = data.split_first() {
        let len = usize::from(len).min(rest.len());
        pipeline.process_datagram(Bytes::copy_from_slice(&rest[..len]));
        data = &rest[len..];
    }
});
