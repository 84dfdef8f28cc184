// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Receiver for H.264 video carried over RTP (RFC 6184).
//!
//! Datagrams are parsed into RTP packets, depacketized into H.264 NAL units (reassembling FU-A
//! fragments and splitting STAP-A aggregates), and turned into format descriptions and sample
//! buffers that a [`decoder::DecompressionSession`] hands to a platform decoder backend.

pub mod backend;
pub mod channel;
pub mod codec;
pub mod decoder;
pub mod event;
pub mod media;
pub mod rtp;
pub mod utils;

mod error;

pub use error::Error;
pub use error::Result;

/// Clock rate of H.264 RTP timestamps, in Hz.
pub const H264_CLOCK_RATE: i32 = 90_000;

/// The dynamic payload type H.264 senders use by default.
pub const DEFAULT_PAYLOAD_TYPE: u8 = 96;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
