// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decompression sessions.
//!
//! A [`DecompressionSession`] feeds the output of the H.264 pipeline to a platform decoder. The
//! decoder itself is provided by a [`DecoderBackend`], which creates the platform session and
//! reports every decoded frame through an [`OutputCallback`]. The callback may be invoked from a
//! thread owned by the platform, in any order relative to the submissions.

use std::ops::BitOr;
use std::sync::Arc;
use std::sync::Mutex;

use log::debug;
use log::warn;

use crate::codec::h264::processor::Output;
use crate::media::FormatDescription;
use crate::media::MediaTime;
use crate::media::SampleBuffer;
use crate::Result;

/// Flags reported by the decoder with each frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeInfoFlags(pub u32);

impl DecodeInfoFlags {
    pub const ASYNCHRONOUS: Self = Self(1 << 0);
    pub const FRAME_DROPPED: Self = Self(1 << 1);
    pub const IMAGE_BUFFER_MODIFIABLE: Self = Self(1 << 2);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for DecodeInfoFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Flags given to the decoder with each frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeFrameFlags(pub u32);

impl DecodeFrameFlags {
    pub const ENABLE_ASYNCHRONOUS_DECOMPRESSION: Self = Self(1 << 0);
    pub const DO_NOT_OUTPUT_FRAME: Self = Self(1 << 1);
    pub const ONE_X_REAL_TIME_PLAYBACK: Self = Self(1 << 2);
    pub const ENABLE_TEMPORAL_PROCESSING: Self = Self(1 << 3);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for DecodeFrameFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Hints for selecting the decoder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecoderSpecification {
    pub enable_hardware_accelerated_video_decoder: Option<bool>,
    pub require_hardware_accelerated_video_decoder: Option<bool>,
}

/// `kCVPixelFormatType_420YpCbCr8BiPlanarVideoRange` ('420v').
pub const PIXEL_FORMAT_NV12_VIDEO_RANGE: u32 = 0x3432_3076;

/// Requirements on the image buffers the decoder outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageBufferAttributes {
    pub pixel_format_type: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub opengl_compatibility: bool,
    pub opengles_compatibility: bool,
    pub metal_compatibility: bool,
}

#[cfg(target_os = "ios")]
pub fn platform_defaults() -> (Option<DecoderSpecification>, Option<ImageBufferAttributes>) {
    let attributes = ImageBufferAttributes {
        pixel_format_type: Some(PIXEL_FORMAT_NV12_VIDEO_RANGE),
        opengles_compatibility: true,
        metal_compatibility: true,
        ..Default::default()
    };

    (None, Some(attributes))
}

/// Decoder hints and output attributes used when the caller does not provide any.
#[cfg(not(target_os = "ios"))]
pub fn platform_defaults() -> (Option<DecoderSpecification>, Option<ImageBufferAttributes>) {
    let specification = DecoderSpecification {
        enable_hardware_accelerated_video_decoder: Some(true),
        ..Default::default()
    };
    let attributes = ImageBufferAttributes {
        pixel_format_type: Some(PIXEL_FORMAT_NV12_VIDEO_RANGE),
        opengl_compatibility: true,
        ..Default::default()
    };

    (Some(specification), Some(attributes))
}

/// What the decoder reports for each submitted frame.
#[derive(Debug)]
pub struct FrameOutput<I> {
    /// Platform status code, zero on success.
    pub status: i32,
    pub info_flags: DecodeInfoFlags,
    /// The decoded image, if any was produced.
    pub image: Option<I>,
    pub presentation_time: MediaTime,
    pub presentation_duration: MediaTime,
}

pub type OutputCallback<I> = Arc<dyn Fn(FrameOutput<I>) + Send + Sync>;

/// A platform decoding session, created by a [`DecoderBackend`].
pub trait BackendSession {
    /// Whether the session can switch to `format` without being recreated.
    fn can_accept_format_description(&self, format: &FormatDescription) -> bool;

    /// Submits one sample. Decoded output is reported through the session's callback.
    fn decode_frame(&mut self, sample: &SampleBuffer, flags: DecodeFrameFlags)
        -> Result<DecodeInfoFlags>;

    /// Blocks until every pending asynchronous frame has been emitted.
    fn wait_for_asynchronous_frames(&mut self) -> Result<()>;

    /// Tears the session down. No callback is invoked afterwards.
    fn invalidate(&mut self);
}

/// Provider of decompression sessions.
pub trait DecoderBackend {
    /// Handle to a decoded picture.
    type Image: Send + 'static;
    type Session: BackendSession;

    /// Creates a session decoding streams of `format`. `callback` is invoked once per frame for
    /// the lifetime of the session.
    fn create_session(
        &self,
        format: &FormatDescription,
        decoder_specification: Option<&DecoderSpecification>,
        image_attributes: Option<&ImageBufferAttributes>,
        callback: OutputCallback<Self::Image>,
    ) -> Result<Self::Session>;
}

type ImageHandler<I> = Box<dyn FnMut(I, MediaTime, MediaTime) + Send>;

/// Decodes sample buffers with a lazily created backend session.
pub struct DecompressionSession<B: DecoderBackend> {
    backend: B,
    session: Option<B::Session>,
    format: Option<Arc<FormatDescription>>,
    decoder_specification: Option<DecoderSpecification>,
    image_attributes: Option<ImageBufferAttributes>,
    image_handler: Arc<Mutex<Option<ImageHandler<B::Image>>>>,
}

impl<B: DecoderBackend> DecompressionSession<B> {
    /// Creates a session using the platform's default decoder hints and output attributes.
    pub fn new(backend: B) -> Self {
        let (decoder_specification, image_attributes) = platform_defaults();
        Self::with_configuration(backend, decoder_specification, image_attributes)
    }

    pub fn with_configuration(
        backend: B,
        decoder_specification: Option<DecoderSpecification>,
        image_attributes: Option<ImageBufferAttributes>,
    ) -> Self {
        Self {
            backend,
            session: None,
            format: None,
            decoder_specification,
            image_attributes,
            image_handler: Arc::new(Mutex::new(None)),
        }
    }

    /// Sets the closure receiving each decoded image with its presentation time and duration.
    pub fn set_image_handler<F>(&mut self, handler: F)
    where
        F: FnMut(B::Image, MediaTime, MediaTime) + Send + 'static,
    {
        let mut slot = match self.image_handler.lock() {
            Ok(slot) => slot,
            Err(poisoned) => {
                warn!("Previous image handler panicked, replacing it");
                self.image_handler.clear_poison();
                poisoned.into_inner()
            }
        };
        *slot = Some(Box::new(handler));
    }

    pub fn format_description(&self) -> Option<&Arc<FormatDescription>> {
        self.format.as_ref()
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Switches to `format`. The backend session is dropped if it cannot accept it, and
    /// recreated on the next frame.
    pub fn set_format_description(&mut self, format: Arc<FormatDescription>) {
        if let Some(session) = self.session.as_mut() {
            if !session.can_accept_format_description(&format) {
                debug!(
                    "Decompression session cannot accept the new format ({}), invalidating",
                    format.coded_resolution()
                );
                session.invalidate();
                self.session = None;
            }
        }

        self.format = Some(format);
    }

    pub fn decode_frame(&mut self, sample: &SampleBuffer) -> Result<()> {
        if self.format.is_none() {
            self.format = Some(Arc::clone(sample.format_description()));
        }

        let session = match self.session.take() {
            Some(session) => session,
            None => self.create_session(sample)?,
        };
        let session = self.session.insert(session);

        let flags = DecodeFrameFlags::ENABLE_ASYNCHRONOUS_DECOMPRESSION
            | DecodeFrameFlags::ONE_X_REAL_TIME_PLAYBACK;
        let info = session.decode_frame(sample, flags)?;
        if info.contains(DecodeInfoFlags::FRAME_DROPPED) {
            debug!("Frame at {} dropped on submission", sample.presentation_time());
        }

        Ok(())
    }

    fn create_session(&self, sample: &SampleBuffer) -> Result<B::Session> {
        let format = self
            .format
            .as_ref()
            .unwrap_or_else(|| sample.format_description());

        let handler = Arc::clone(&self.image_handler);
        let callback: OutputCallback<B::Image> = Arc::new(move |output: FrameOutput<B::Image>| {
            if output.status != 0 {
                warn!(
                    "Decoding frame at {} failed with status {}",
                    output.presentation_time, output.status
                );
                return;
            }

            let image = match output.image {
                Some(image) => image,
                None => {
                    debug!(
                        "No image decoded at {} (flags {:#x})",
                        output.presentation_time, output.info_flags.0
                    );
                    return;
                }
            };

            let mut handler = match handler.lock() {
                Ok(handler) => handler,
                Err(_) => {
                    warn!(
                        "Image handler poisoned, dropping frame at {}",
                        output.presentation_time
                    );
                    return;
                }
            };
            if let Some(handler) = handler.as_mut() {
                handler(
                    image,
                    output.presentation_time,
                    output.presentation_duration,
                );
            }
        });

        self.backend.create_session(
            format,
            self.decoder_specification.as_ref(),
            self.image_attributes.as_ref(),
            callback,
        )
    }

    /// Hands one output of the H.264 pipeline to the decoder.
    pub fn process(&mut self, output: &Output) -> Result<()> {
        match output {
            Output::FormatDescription(format) => {
                self.set_format_description(Arc::clone(format));
                Ok(())
            }
            Output::SampleBuffer(sample) => self.decode_frame(sample),
        }
    }

    /// Waits for every submitted frame to be reported.
    pub fn flush(&mut self) -> Result<()> {
        match self.session.as_mut() {
            Some(session) => session.wait_for_asynchronous_frames(),
            None => Ok(()),
        }
    }
}

impl<B: DecoderBackend> Drop for DecompressionSession<B> {
    fn drop(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.invalidate();
        }
    }
}
