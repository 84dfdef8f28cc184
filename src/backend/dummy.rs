// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the decompression session
//! run so we can test it in isolation.
//!
//! Frames are "decoded" synchronously: the callback receives a copy of the submitted NALU as the
//! image.

use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use crate::decoder::BackendSession;
use crate::decoder::DecodeFrameFlags;
use crate::decoder::DecodeInfoFlags;
use crate::decoder::DecoderBackend;
use crate::decoder::DecoderSpecification;
use crate::decoder::FrameOutput;
use crate::decoder::ImageBufferAttributes;
use crate::decoder::OutputCallback;
use crate::media::FormatDescription;
use crate::media::SampleBuffer;
use crate::Error;
use crate::Resolution;
use crate::Result;

#[derive(Default)]
struct State {
    sessions_created: AtomicUsize,
    sessions_invalidated: AtomicUsize,
    frames_decoded: AtomicUsize,
    create_status: AtomicI32,
    callback_status: AtomicI32,
    last_decode_flags: Mutex<Option<DecodeFrameFlags>>,
}

/// Dummy backend, cloned handles share their statistics.
#[derive(Clone, Default)]
pub(crate) struct Backend {
    state: Arc<State>,
}

impl Backend {
    pub(crate) fn sessions_created(&self) -> usize {
        self.state.sessions_created.load(Ordering::SeqCst)
    }

    pub(crate) fn sessions_invalidated(&self) -> usize {
        self.state.sessions_invalidated.load(Ordering::SeqCst)
    }

    pub(crate) fn frames_decoded(&self) -> usize {
        self.state.frames_decoded.load(Ordering::SeqCst)
    }

    pub(crate) fn last_decode_flags(&self) -> Option<DecodeFrameFlags> {
        *self.state.last_decode_flags.lock().unwrap()
    }

    /// Makes session creation fail with `status`.
    pub(crate) fn set_create_status(&self, status: i32) {
        self.state.create_status.store(status, Ordering::SeqCst);
    }

    /// Makes every decoded frame report `status`.
    pub(crate) fn set_callback_status(&self, status: i32) {
        self.state.callback_status.store(status, Ordering::SeqCst);
    }
}

pub(crate) struct Session {
    state: Arc<State>,
    coded_resolution: Resolution,
    callback: Option<OutputCallback<Vec<u8>>>,
}

impl DecoderBackend for Backend {
    type Image = Vec<u8>;
    type Session = Session;

    fn create_session(
        &self,
        format: &FormatDescription,
        _: Option<&DecoderSpecification>,
        _: Option<&ImageBufferAttributes>,
        callback: OutputCallback<Vec<u8>>,
    ) -> Result<Session> {
        Error::check_status(
            self.state.create_status.load(Ordering::SeqCst),
            "creating dummy session",
        )?;

        self.state.sessions_created.fetch_add(1, Ordering::SeqCst);

        Ok(Session {
            state: Arc::clone(&self.state),
            coded_resolution: format.coded_resolution(),
            callback: Some(callback),
        })
    }
}

impl BackendSession for Session {
    fn can_accept_format_description(&self, format: &FormatDescription) -> bool {
        format.coded_resolution() == self.coded_resolution
    }

    fn decode_frame(
        &mut self,
        sample: &SampleBuffer,
        flags: DecodeFrameFlags,
    ) -> Result<DecodeInfoFlags> {
        let callback = self
            .callback
            .as_ref()
            .ok_or(Error::ChannelState("dummy session invalidated"))?;

        *self.state.last_decode_flags.lock().unwrap() = Some(flags);
        self.state.frames_decoded.fetch_add(1, Ordering::SeqCst);

        let status = self.state.callback_status.load(Ordering::SeqCst);
        callback(FrameOutput {
            status,
            info_flags: DecodeInfoFlags::default(),
            image: (status == 0).then(|| sample.nalu().to_vec()),
            presentation_time: sample.presentation_time(),
            presentation_duration: sample.timing().duration,
        });

        Ok(DecodeInfoFlags::default())
    }

    fn wait_for_asynchronous_frames(&mut self) -> Result<()> {
        Ok(())
    }

    fn invalidate(&mut self) {
        if self.callback.take().is_some() {
            self.state.sessions_invalidated.fetch_add(1, Ordering::SeqCst);
        }
    }
}
