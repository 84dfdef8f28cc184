// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! UDP reception of H.264 RTP streams.
//!
//! [`RtpPipeline`] is the synchronous core: it turns datagrams into [`Output`]s and hands them to
//! the user's handler. [`RtpChannel`] owns the UDP socket and feeds the pipeline from a `tokio`
//! task while resumed.

use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::net::SocketAddrV4;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;
use log::debug;
use log::error;
use nix::sys::socket::bind;
use nix::sys::socket::setsockopt;
use nix::sys::socket::socket;
use nix::sys::socket::sockopt;
use nix::sys::socket::AddressFamily;
use nix::sys::socket::SockFlag;
use nix::sys::socket::SockType;
use nix::sys::socket::SockaddrStorage;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::codec::h264::nalu::Nalu;
use crate::codec::h264::processor::H264Processor;
use crate::codec::h264::processor::Output;
use crate::event::EventSink;
use crate::event::RtpEvent;
use crate::rtp::RtpProcessor;
use crate::Error;
use crate::Result;
use crate::DEFAULT_PAYLOAD_TYPE;
use crate::H264_CLOCK_RATE;

/// Port H.264 RTP streams are usually sent to.
pub const DEFAULT_PORT: u16 = 5600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub bind_address: SocketAddr,
    /// RTP payload type of the H.264 stream. Packets of other types are rejected.
    pub payload_type: u8,
    /// Clock rate of the RTP timestamps, in Hz.
    pub clock_rate: i32,
    /// Largest datagram that can be received without truncation.
    pub max_datagram_size: usize,
    /// `SO_RCVBUF`, left to the system default if `None`.
    pub recv_buffer_size: Option<usize>,
    /// `SO_REUSEADDR`.
    pub reuse_address: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            payload_type: DEFAULT_PAYLOAD_TYPE,
            clock_rate: H264_CLOCK_RATE,
            max_datagram_size: 65536,
            recv_buffer_size: None,
            reuse_address: true,
        }
    }
}

pub type OutputHandler = Box<dyn FnMut(Output) -> anyhow::Result<()> + Send>;
pub type ErrorHandler = Box<dyn FnMut(&Error) + Send>;

/// Runs datagrams through the RTP and H.264 processors.
pub struct RtpPipeline {
    events: Arc<dyn EventSink>,
    rtp_processor: RtpProcessor,
    h264_processor: H264Processor,
    handler: Option<OutputHandler>,
    error_handler: Option<ErrorHandler>,
}

impl RtpPipeline {
    pub fn new(config: &ChannelConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            rtp_processor: RtpProcessor::with_payload_type(
                Arc::clone(&events),
                config.payload_type,
                config.clock_rate,
            ),
            h264_processor: H264Processor::new(Arc::clone(&events)),
            events,
            handler: None,
            error_handler: None,
        }
    }

    /// Sets the closure receiving every format description and sample buffer produced.
    pub fn set_handler<F>(&mut self, handler: F)
    where
        F: FnMut(Output) -> anyhow::Result<()> + Send + 'static,
    {
        self.handler = Some(Box::new(handler));
    }

    /// Sets the closure receiving the errors stopping the processing of a datagram.
    pub fn set_error_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&Error) + Send + 'static,
    {
        self.error_handler = Some(Box::new(handler));
    }

    /// Processes one datagram. Processing stops at the first error, which is reported to the
    /// error handler.
    pub fn process_datagram(&mut self, datagram: Bytes) {
        self.events.post_event(RtpEvent::PacketReceived);

        if let Err(e) = self.try_process_datagram(datagram) {
            debug!("Error in RTP pipeline: {}", e);
            self.events.post_event(RtpEvent::ErrorInPipeline);
            if let Some(handler) = self.error_handler.as_mut() {
                handler(&e);
            }
        }
    }

    fn try_process_datagram(&mut self, datagram: Bytes) -> Result<()> {
        let nalus = match self.rtp_processor.process(datagram)? {
            Some(nalus) => nalus,
            None => return Ok(()),
        };

        self.events.post_event(RtpEvent::NaluProduced);

        for nalu in nalus {
            if let Err(e) = self.process_nalu(nalu) {
                match e {
                    Error::SkippedFrame(_) => self.events.post_event(RtpEvent::H264FrameSkipped),
                    _ => self.events.post_event(RtpEvent::ErrorInPipeline),
                }
                return Err(e);
            }
        }

        Ok(())
    }

    fn process_nalu(&mut self, nalu: Nalu) -> Result<()> {
        let output = match self.h264_processor.process(nalu)? {
            Some(output) => output,
            None => return Ok(()),
        };

        match output {
            Output::FormatDescription(_) => {
                self.events.post_event(RtpEvent::FormatDescriptionProduced)
            }
            Output::SampleBuffer(_) => self.events.post_event(RtpEvent::SampleBufferProduced),
        }
        self.events.post_event(RtpEvent::H264FrameProduced);

        if let Some(handler) = self.handler.as_mut() {
            handler(output)?;
        }

        Ok(())
    }
}

/// Creates the UDP socket described by `config`, ready to be handed to `tokio`.
fn bind_socket(config: &ChannelConfig) -> Result<std::net::UdpSocket> {
    let family = match config.bind_address {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };

    let fd = socket(family, SockType::Datagram, SockFlag::empty(), None)?;

    if config.reuse_address {
        setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    }
    if let Some(size) = config.recv_buffer_size {
        setsockopt(&fd, sockopt::RcvBuf, &size)?;
    }

    bind(fd.as_raw_fd(), &SockaddrStorage::from(config.bind_address))?;

    let socket = std::net::UdpSocket::from(fd);
    socket.set_nonblocking(true)?;

    Ok(socket)
}

async fn receive_loop(socket: UdpSocket, pipeline: Arc<Mutex<RtpPipeline>>, max_size: usize) {
    let mut buf = vec![0u8; max_size];

    loop {
        let result = socket.recv(&mut buf).await;

        let mut guard = match pipeline.lock() {
            Ok(guard) => guard,
            Err(_) => {
                error!("RTP pipeline poisoned, stopping reception");
                break;
            }
        };

        match result {
            Ok(len) => guard.process_datagram(Bytes::copy_from_slice(&buf[..len])),
            Err(e) => {
                error!("Failed to receive datagram: {}", e);
                let e = Error::from(e);
                if let Some(handler) = guard.error_handler.as_mut() {
                    handler(&e);
                }
                break;
            }
        }
    }
}

/// An H.264 RTP receiver bound to a UDP port while resumed.
pub struct RtpChannel {
    config: ChannelConfig,
    pipeline: Arc<Mutex<RtpPipeline>>,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl RtpChannel {
    pub fn new(config: ChannelConfig, events: Arc<dyn EventSink>) -> Self {
        let pipeline = RtpPipeline::new(&config, events);

        Self {
            config,
            pipeline: Arc::new(Mutex::new(pipeline)),
            task: None,
            local_addr: None,
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    fn with_pipeline(&self, f: impl FnOnce(&mut RtpPipeline)) -> Result<()> {
        if self.is_resumed() {
            return Err(Error::ChannelState("cannot configure a resumed channel"));
        }

        let mut pipeline = self
            .pipeline
            .lock()
            .map_err(|_| Error::ChannelState("pipeline poisoned"))?;
        f(&mut pipeline);

        Ok(())
    }

    pub fn set_handler<F>(&mut self, handler: F) -> Result<()>
    where
        F: FnMut(Output) -> anyhow::Result<()> + Send + 'static,
    {
        self.with_pipeline(|pipeline| pipeline.set_handler(handler))
    }

    pub fn set_error_handler<F>(&mut self, handler: F) -> Result<()>
    where
        F: FnMut(&Error) + Send + 'static,
    {
        self.with_pipeline(|pipeline| pipeline.set_error_handler(handler))
    }

    /// Whether the receive task is running. Turns false on its own if the task stops after a
    /// receive error.
    pub fn is_resumed(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Address the socket is bound to while resumed.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.filter(|_| self.is_resumed())
    }

    /// Binds the socket and starts receiving. Must be called from within a `tokio` runtime.
    /// Does nothing if the channel is already resumed.
    pub fn resume(&mut self) -> Result<()> {
        if self.is_resumed() {
            return Ok(());
        }

        let runtime = Handle::try_current()
            .map_err(|_| Error::ChannelState("resume() called outside of a tokio runtime"))?;

        let socket = match self.open_socket() {
            Ok(socket) => socket,
            Err(e) => {
                if let Ok(mut pipeline) = self.pipeline.lock() {
                    if let Some(handler) = pipeline.error_handler.as_mut() {
                        handler(&e);
                    }
                }
                return Err(e);
            }
        };

        let local_addr = socket.local_addr()?;
        debug!("RTP channel listening on {}", local_addr);

        self.local_addr = Some(local_addr);
        self.task = Some(runtime.spawn(receive_loop(
            socket,
            Arc::clone(&self.pipeline),
            self.config.max_datagram_size,
        )));

        Ok(())
    }

    fn open_socket(&self) -> Result<UdpSocket> {
        let socket = bind_socket(&self.config)?;
        Ok(UdpSocket::from_std(socket)?)
    }

    /// Stops receiving and closes the socket. The port is free to be bound again once this
    /// returns. Does nothing if the channel is not resumed.
    pub async fn cancel(&mut self) {
        self.local_addr = None;

        if let Some(task) = self.task.take() {
            debug!("RTP channel cancelled");
            task.abort();
            // The socket is dropped with the task's future.
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("RTP receive task failed: {}", e);
                }
            }
        }
    }
}

impl Drop for RtpChannel {
    /// Schedules the receive task for cancellation. The socket is closed the next time the runtime
    /// polls it. [`RtpChannel::cancel`] waits for that.
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use bytes::Bytes;

    use super::ChannelConfig;
    use super::RtpChannel;
    use super::RtpPipeline;
    use crate::codec::h264::processor::Output;
    use crate::event::EventCounters;
    use crate::event::NullSink;
    use crate::event::RtpEvent;
    use crate::media::tests::PPS;
    use crate::media::tests::SPS_640X480;
    use crate::Error;

    const IDR: [u8; 3] = [0x65, 0x88, 0x84];

    fn datagram(sequence_number: u16, timestamp: u32, payload: &[u8]) -> Bytes {
        let mut data = vec![0x80, 96];
        data.extend_from_slice(&sequence_number.to_be_bytes());
        data.extend_from_slice(&timestamp.to_be_bytes());
        data.extend_from_slice(&[0, 0, 0, 1]);
        data.extend_from_slice(payload);
        Bytes::from(data)
    }

    fn pipeline() -> (RtpPipeline, Arc<EventCounters>) {
        let counters = Arc::new(EventCounters::new());
        (
            RtpPipeline::new(&ChannelConfig::default(), counters.clone()),
            counters,
        )
    }

    #[test]
    fn default_config() {
        let config = ChannelConfig::default();
        assert_eq!(config.bind_address.to_string(), "0.0.0.0:5600");
        assert_eq!(config.payload_type, 96);
        assert_eq!(config.clock_rate, 90_000);
        assert!(config.reuse_address);
    }

    #[test]
    fn stream_produces_outputs() {
        let (mut pipeline, counters) = pipeline();
        let outputs = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outputs);
        pipeline.set_handler(move |output| {
            sink.lock().unwrap().push(output);
            Ok(())
        });

        pipeline.process_datagram(datagram(1, 0, &SPS_640X480));
        pipeline.process_datagram(datagram(2, 0, &PPS));
        pipeline.process_datagram(datagram(3, 3000, &IDR));

        let outputs = outputs.lock().unwrap();
        assert_eq!(outputs.len(), 2);
        assert!(matches!(outputs[0], Output::FormatDescription(_)));
        assert!(matches!(outputs[1], Output::SampleBuffer(_)));

        assert_eq!(counters.get(RtpEvent::PacketReceived), 3);
        assert_eq!(counters.get(RtpEvent::NaluProduced), 3);
        assert_eq!(counters.get(RtpEvent::FormatDescriptionProduced), 1);
        assert_eq!(counters.get(RtpEvent::SampleBufferProduced), 1);
        assert_eq!(counters.get(RtpEvent::H264FrameProduced), 2);
        assert_eq!(counters.get(RtpEvent::ErrorInPipeline), 0);
    }

    #[test]
    fn skipped_frame() {
        let (mut pipeline, counters) = pipeline();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        pipeline.set_error_handler(move |e| sink.lock().unwrap().push(e.to_string()));

        pipeline.process_datagram(datagram(1, 0, &IDR));

        assert_eq!(counters.get(RtpEvent::H264FrameSkipped), 1);
        assert_eq!(counters.get(RtpEvent::ErrorInPipeline), 1);
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[test]
    fn h264_error_counted_twice() {
        let (mut pipeline, counters) = pipeline();

        // SEI
        pipeline.process_datagram(datagram(1, 0, &[0x06, 0x05]));

        assert_eq!(counters.get(RtpEvent::H264FrameSkipped), 0);
        assert_eq!(counters.get(RtpEvent::ErrorInPipeline), 2);
    }

    #[test]
    fn rtp_error() {
        let (mut pipeline, counters) = pipeline();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        pipeline.set_error_handler(move |e: &Error| {
            let truncated = matches!(e, Error::Truncated { .. });
            sink.lock().unwrap().push(truncated);
        });

        pipeline.process_datagram(Bytes::from_static(&[0x80, 96, 0]));

        assert_eq!(counters.get(RtpEvent::PacketReceived), 1);
        assert_eq!(counters.get(RtpEvent::NaluProduced), 0);
        assert_eq!(counters.get(RtpEvent::ErrorInPipeline), 1);
        assert_eq!(*errors.lock().unwrap(), vec![true]);
    }

    #[test]
    fn handler_error_is_reported() {
        let (mut pipeline, counters) = pipeline();
        let errors = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&errors);
        pipeline.set_handler(|_| Err(anyhow::anyhow!("disk full")));
        pipeline.set_error_handler(move |_| *sink.lock().unwrap() += 1);

        pipeline.process_datagram(datagram(1, 0, &SPS_640X480));
        pipeline.process_datagram(datagram(2, 0, &PPS));

        assert_eq!(counters.get(RtpEvent::H264FrameProduced), 1);
        assert_eq!(*errors.lock().unwrap(), 1);
    }

    #[test]
    fn resume_outside_runtime() {
        let mut channel = RtpChannel::new(ChannelConfig::default(), Arc::new(NullSink));
        assert!(matches!(channel.resume(), Err(Error::ChannelState(_))));
        assert!(!channel.is_resumed());
        assert!(channel.local_addr().is_none());

        // Cancelling an idle channel is a no-op.
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(channel.cancel());
        assert!(channel.set_handler(|_| Ok(())).is_ok());
    }
}
