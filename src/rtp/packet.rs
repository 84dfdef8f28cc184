// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;

use byteorder::BigEndian;
use byteorder::ByteOrder;
use bytes::Bytes;

use crate::Error;
use crate::Result;

/// Size of the fixed RTP header.
pub const RTP_HEADER_LEN: usize = 12;

#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub version: u8,
    pub padding_flag: bool,
    pub extension_flag: bool,
    pub csrc_count: u8,
    pub marker_flag: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc_identifier: u32,
    /// Everything following the fixed header.
    pub body: Bytes,
}

impl RtpPacket {
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() < RTP_HEADER_LEN {
            return Err(Error::Truncated {
                needed: RTP_HEADER_LEN,
                got: data.len(),
            });
        }

        let header = &data[..RTP_HEADER_LEN];

        Ok(Self {
            version: header[0] >> 6,
            padding_flag: header[0] & 0x20 != 0,
            extension_flag: header[0] & 0x10 != 0,
            csrc_count: header[0] & 0x0f,
            marker_flag: header[1] & 0x80 != 0,
            payload_type: header[1] & 0x7f,
            sequence_number: BigEndian::read_u16(&header[2..4]),
            timestamp: BigEndian::read_u32(&header[4..8]),
            ssrc_identifier: BigEndian::read_u32(&header[8..12]),
            body: data.slice(RTP_HEADER_LEN..),
        })
    }
}

impl fmt::Display for RtpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: bool, c: char| if set { c.to_ascii_uppercase() } else { c };

        write!(
            f,
            "RtpPacket(version: {}, flags: {}{}{}, ",
            self.version,
            flag(self.padding_flag, 'p'),
            flag(self.extension_flag, 'e'),
            flag(self.marker_flag, 'm'),
        )?;
        if self.csrc_count > 1 {
            write!(f, "csrcCount: {}, ", self.csrc_count)?;
        }
        write!(
            f,
            "payloadType: {}, sequenceNumber: {}, timestamp: {}, ssrcIdentifier: {})",
            self.payload_type, self.sequence_number, self.timestamp, self.ssrc_identifier
        )
    }
}
