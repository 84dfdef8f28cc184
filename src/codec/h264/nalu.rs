// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 NAL units as carried in RTP payloads.

use std::fmt;

use bytes::Bytes;
use enumn::N;

use crate::media::MediaTime;
use crate::Error;
use crate::Result;

/// NAL unit types from Table 7-1 of the H.264 specification.
#[derive(N, Debug, PartialEq, Eq, Clone, Copy)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    Reserved17 = 17,
    Reserved18 = 18,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
    Reserved22 = 22,
    Reserved23 = 23,
}

/// Packetization types from RFC 6184, which reuse the unspecified NAL unit type values.
#[derive(N, Debug, PartialEq, Eq, Clone, Copy)]
pub enum H264RtpType {
    StapA = 24,
    StapB = 25,
    Mtap16 = 26,
    Mtap24 = 27,
    FuA = 28,
    FuB = 29,
}

/// The NAL unit types the receive pipeline knows how to handle.
#[derive(N, Debug, PartialEq, Eq, Clone, Copy)]
pub enum H264Kind {
    /// P/B frame.
    SliceNonIdr = 1,
    /// I frame.
    SliceIdr = 5,
    Sps = 7,
    Pps = 8,
}

impl H264Kind {
    pub fn is_slice(&self) -> bool {
        matches!(self, H264Kind::SliceNonIdr | H264Kind::SliceIdr)
    }
}

impl fmt::Display for H264Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            H264Kind::SliceNonIdr => "SliceNonIDR",
            H264Kind::SliceIdr => "SliceIDR",
            H264Kind::Sps => "SPS",
            H264Kind::Pps => "PPS",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NaluHeader {
    pub forbidden_zero_bit: bool,
    pub ref_idc: u8,
    pub raw_type: u8,
}

impl NaluHeader {
    pub fn parse(byte: u8) -> Self {
        Self {
            forbidden_zero_bit: byte & 0x80 != 0,
            ref_idc: (byte & 0x60) >> 5,
            raw_type: byte & 0x1f,
        }
    }

    /// Builds a NAL unit header byte with a cleared forbidden bit.
    pub fn header_byte(ref_idc: u8, raw_type: u8) -> u8 {
        ((ref_idc & 0x03) << 5) | (raw_type & 0x1f)
    }
}

/// A NAL unit along with the time of the RTP packet that carried it.
#[derive(Debug, Clone)]
pub struct Nalu {
    time: MediaTime,
    header: NaluHeader,
    /// Header byte followed by the payload.
    data: Bytes,
}

impl Nalu {
    pub fn new(time: MediaTime, data: Bytes) -> Result<Self> {
        let header = match data.first() {
            Some(byte) => NaluHeader::parse(*byte),
            None => return Err(Error::Truncated { needed: 1, got: 0 }),
        };

        Ok(Self { time, header, data })
    }

    pub fn time(&self) -> MediaTime {
        self.time
    }

    pub fn header(&self) -> &NaluHeader {
        &self.header
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// The payload following the one-byte header.
    pub fn body(&self) -> Bytes {
        self.data.slice(1..)
    }

    pub fn raw_type(&self) -> u8 {
        self.header.raw_type
    }

    pub fn ref_idc(&self) -> u8 {
        self.header.ref_idc
    }

    pub fn type_(&self) -> Option<NaluType> {
        NaluType::n(self.header.raw_type)
    }

    pub fn rtp_type(&self) -> Option<H264RtpType> {
        H264RtpType::n(self.header.raw_type)
    }

    pub fn kind(&self) -> Option<H264Kind> {
        H264Kind::n(self.header.raw_type)
    }
}
