// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! RTP packets (RFC 3550) and H.264 depacketization (RFC 6184).

mod packet;
mod processor;

pub use packet::RtpPacket;
pub use packet::RTP_HEADER_LEN;
pub use processor::RtpProcessor;
