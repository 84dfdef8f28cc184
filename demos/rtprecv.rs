// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! rtprecv, a simple H.264 RTP receiver. Capable of writing the received stream to an Annex B
//! file, computing its MD5 checksum and, on Apple platforms, decoding it with VideoToolbox.

use std::fs::File;
use std::io::Write;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use argh::FromArgs;
use h264_rtp::channel::ChannelConfig;
use h264_rtp::channel::RtpChannel;
use h264_rtp::codec::h264::processor::Output;
use h264_rtp::event::EventCounters;
use h264_rtp::utils::AnnexBWriter;
use tokio::sync::mpsc;

/// Simple H.264 RTP receiver using h264-rtp
#[derive(Debug, FromArgs)]
struct Args {
    /// UDP port to listen on. Default: 5600
    #[argh(option, default = "5600")]
    port: u16,

    /// RTP payload type of the stream. Default: 96
    #[argh(option, default = "96")]
    payload_type: u8,

    /// output file to write the received Annex B stream to
    #[argh(option)]
    output: Option<PathBuf>,

    /// whether to display the MD5 of the received stream
    #[argh(switch)]
    compute_md5: bool,

    /// stop after receiving this many frames
    #[argh(option)]
    max_frames: Option<usize>,

    /// whether to decode the received frames (Apple platforms only)
    #[argh(switch)]
    decode: bool,
}

/// Sends the written stream to an optional file and an optional MD5 context.
struct StreamSink {
    file: Option<File>,
    md5: Option<md5::Context>,
}

impl Write for StreamSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(buf)?;
        }
        if let Some(md5) = self.md5.as_mut() {
            md5.consume(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn decoder() -> Box<dyn FnMut(&Output) + Send> {
    use h264_rtp::backend::videotoolbox::VideoToolboxBackend;
    use h264_rtp::decoder::DecompressionSession;

    let mut session = DecompressionSession::new(VideoToolboxBackend);
    session.set_image_handler(|image, pts, _| {
        log::debug!("Decoded {}x{} frame at {}", image.width(), image.height(), pts);
    });

    Box::new(move |output| {
        if let Err(e) = session.process(output) {
            log::warn!("Failed to decode: {}", e);
        }
    })
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn decoder() -> Box<dyn FnMut(&Output) + Send> {
    log::warn!("No decoder backend available on this platform, ignoring --decode");
    Box::new(|_| ())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let sink = StreamSink {
        file: args
            .output
            .as_ref()
            .map(|p| File::create(p).expect("error creating output file")),
        md5: args.compute_md5.then(md5::Context::new),
    };
    let writer = Arc::new(Mutex::new(AnnexBWriter::new(sink)));
    let mut decoder = args.decode.then(decoder);

    let config = ChannelConfig {
        bind_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port)),
        payload_type: args.payload_type,
        ..Default::default()
    };
    let counters = Arc::new(EventCounters::new());
    let mut channel = RtpChannel::new(config, counters.clone());

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let max_frames = args.max_frames;
    let handler_writer = Arc::clone(&writer);

    channel
        .set_handler(move |output| {
            if let Some(decoder) = decoder.as_mut() {
                decoder(&output);
            }

            let mut writer = handler_writer.lock().unwrap();
            if let Err(e) = writer.handle(&output) {
                log::debug!("Not writing output: {}", e);
            }

            if matches!(output, Output::SampleBuffer(_))
                && max_frames == Some(writer.samples_written())
            {
                let _ = done_tx.send(());
            }

            Ok(())
        })
        .expect("failed to set handler");
    channel
        .set_error_handler(|e| log::debug!("Dropped datagram: {}", e))
        .expect("failed to set error handler");

    channel.resume().expect("failed to start receiving");
    log::info!("Listening on {:?}", channel.local_addr());

    tokio::select! {
        _ = done_rx.recv() => (),
        _ = tokio::signal::ctrl_c() => log::info!("Interrupted"),
    }

    channel.cancel().await;

    let mut writer = writer.lock().unwrap();
    writer.finish().expect("error flushing output");
    println!("{} frames received", writer.samples_written());
    if let Some(md5) = writer.get_mut().md5.take() {
        println!("{:x}", md5.compute());
    }

    for (event, count) in counters.snapshot() {
        println!("{:?}: {}", event, count);
    }
}
