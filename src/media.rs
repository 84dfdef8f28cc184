// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Platform-neutral media types handed from the H.264 pipeline to decoder backends.

use std::fmt;
use std::sync::Arc;

use byteorder::BigEndian;
use byteorder::ByteOrder;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::codec::h264::nalu::Nalu;
use crate::codec::h264::parser::Sps;
use crate::Error;
use crate::Resolution;
use crate::Result;

/// A rational time value, laid out like the platform's `CMTime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaTime {
    pub value: i64,
    pub timescale: i32,
    pub flags: u32,
}

impl MediaTime {
    pub const FLAG_VALID: u32 = 1;

    pub fn new(value: i64, timescale: i32) -> Self {
        Self {
            value,
            timescale,
            flags: Self::FLAG_VALID,
        }
    }

    pub fn invalid() -> Self {
        Self {
            value: 0,
            timescale: 0,
            flags: 0,
        }
    }

    /// Time of an RTP timestamp ticking at `clock_rate` Hz.
    pub fn from_rtp(timestamp: u32, clock_rate: i32) -> Self {
        Self::new(i64::from(timestamp), clock_rate)
    }

    pub fn is_valid(&self) -> bool {
        self.flags & Self::FLAG_VALID != 0 && self.timescale != 0
    }

    pub fn seconds(&self) -> Option<f64> {
        self.is_valid()
            .then(|| self.value as f64 / f64::from(self.timescale))
    }
}

impl Default for MediaTime {
    fn default() -> Self {
        Self::invalid()
    }
}

impl fmt::Display for MediaTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}/{}", self.value, self.timescale)
        } else {
            write!(f, "invalid")
        }
    }
}

/// Size of the big-endian length field preceding each NALU in AVCC samples.
pub const NAL_UNIT_HEADER_LENGTH: usize = 4;

/// Describes an H.264 stream: the parameter sets a decoder must be configured with.
#[derive(Debug, Clone)]
pub struct FormatDescription {
    sps: Bytes,
    pps: Bytes,
    parsed_sps: Sps,
}

impl FormatDescription {
    /// Creates a format description from complete SPS and PPS NAL units (headers included).
    pub fn from_parameter_sets(sps: Bytes, pps: Bytes) -> Result<Self> {
        if sps.is_empty() || pps.is_empty() {
            return Err(Error::IncompleteParameterSet {
                sps: !sps.is_empty(),
                pps: !pps.is_empty(),
            });
        }

        let parsed_sps = Sps::parse(&sps)?;

        Ok(Self {
            sps,
            pps,
            parsed_sps,
        })
    }

    pub fn sps(&self) -> &Bytes {
        &self.sps
    }

    pub fn pps(&self) -> &Bytes {
        &self.pps
    }

    pub fn parsed_sps(&self) -> &Sps {
        &self.parsed_sps
    }

    pub fn nal_unit_header_length(&self) -> usize {
        NAL_UNIT_HEADER_LENGTH
    }

    pub fn coded_resolution(&self) -> Resolution {
        Resolution::new(self.parsed_sps.width(), self.parsed_sps.height())
    }

    pub fn visible_resolution(&self) -> Resolution {
        self.parsed_sps.visible_resolution()
    }
}

impl PartialEq for FormatDescription {
    fn eq(&self, other: &Self) -> bool {
        self.sps == other.sps && self.pps == other.pps
    }
}

impl Eq for FormatDescription {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleTiming {
    pub duration: MediaTime,
    pub presentation: MediaTime,
    pub decode: MediaTime,
}

/// One coded picture in AVCC form, ready to be submitted to a decoder.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    data: Bytes,
    format: Arc<FormatDescription>,
    timing: SampleTiming,
    display_immediately: bool,
}

impl SampleBuffer {
    /// Wraps `nalu` into a single-sample buffer, prefixing it with its 32-bit big-endian length.
    pub fn from_nalu(nalu: &Nalu, format: Arc<FormatDescription>) -> Result<Self> {
        let len = u32::try_from(nalu.data().len())
            .map_err(|_| Error::UnsupportedFeature("NALU larger than 4GiB".into()))?;

        let mut data = BytesMut::with_capacity(NAL_UNIT_HEADER_LENGTH + nalu.data().len());
        data.put_u32(len);
        data.extend_from_slice(nalu.data());

        // The duration is unknown from a single RTP timestamp.
        let timing = SampleTiming {
            duration: MediaTime::invalid(),
            presentation: nalu.time(),
            decode: nalu.time(),
        };

        Ok(Self {
            data: data.freeze(),
            format,
            timing,
            display_immediately: false,
        })
    }

    /// Requests that this sample be presented without the pipeline's internal scheduling delay.
    pub fn set_display_immediately(&mut self) {
        self.display_immediately = true;
    }

    pub fn display_immediately(&self) -> bool {
        self.display_immediately
    }

    /// The AVCC-formatted sample data.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// The NALU carried by this sample, without its length prefix.
    pub fn nalu(&self) -> &[u8] {
        let len = BigEndian::read_u32(&self.data[..NAL_UNIT_HEADER_LENGTH]) as usize;
        &self.data[NAL_UNIT_HEADER_LENGTH..NAL_UNIT_HEADER_LENGTH + len]
    }

    pub fn format_description(&self) -> &Arc<FormatDescription> {
        &self.format
    }

    pub fn timing(&self) -> &SampleTiming {
        &self.timing
    }

    pub fn presentation_time(&self) -> MediaTime {
        self.timing.presentation
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::FormatDescription;
    use super::MediaTime;
    use super::SampleBuffer;
    use crate::codec::h264::nalu::Nalu;
    use crate::Error;
    use crate::Resolution;

    /// Baseline SPS for a 640x480 stream.
    pub const SPS_640X480: [u8; 9] = [0x67, 0x42, 0xc0, 0x1e, 0xda, 0x02, 0x80, 0xf6, 0x40];
    pub const PPS: [u8; 4] = [0x68, 0xce, 0x38, 0x80];

    pub fn format_640x480() -> Arc<FormatDescription> {
        Arc::new(
            FormatDescription::from_parameter_sets(
                Bytes::from_static(&SPS_640X480),
                Bytes::from_static(&PPS),
            )
            .unwrap(),
        )
    }

    #[test]
    fn media_time() {
        let time = MediaTime::from_rtp(180_000, 90_000);
        assert!(time.is_valid());
        assert_eq!(time.seconds(), Some(2.0));
        assert_eq!(time.to_string(), "180000/90000");

        let invalid = MediaTime::invalid();
        assert!(!invalid.is_valid());
        assert_eq!(invalid.seconds(), None);
        assert_eq!(invalid.to_string(), "invalid");
    }

    #[test]
    fn format_description_from_parameter_sets() {
        let format = format_640x480();
        assert_eq!(format.coded_resolution(), Resolution::new(640, 480));
        assert_eq!(format.visible_resolution(), Resolution::new(640, 480));
        assert_eq!(format.nal_unit_header_length(), 4);
        assert_eq!(*format, *format_640x480());
    }

    #[test]
    fn format_description_needs_both_sets() {
        let err =
            FormatDescription::from_parameter_sets(Bytes::from_static(&SPS_640X480), Bytes::new())
                .unwrap_err();
        assert!(matches!(
            err,
            Error::IncompleteParameterSet {
                sps: true,
                pps: false
            }
        ));
    }

    #[test]
    fn sample_buffer_is_length_prefixed() {
        let time = MediaTime::from_rtp(3000, 90_000);
        let nalu = Nalu::new(time, Bytes::from_static(&[0x65, 0x88, 0x84, 0x00])).unwrap();
        let mut sample = SampleBuffer::from_nalu(&nalu, format_640x480()).unwrap();

        assert_eq!(
            sample.data().as_ref(),
            &[0x00, 0x00, 0x00, 0x04, 0x65, 0x88, 0x84, 0x00]
        );
        assert_eq!(sample.nalu(), &[0x65, 0x88, 0x84, 0x00]);
        assert_eq!(sample.timing().presentation, time);
        assert_eq!(sample.timing().decode, time);
        assert!(!sample.timing().duration.is_valid());

        assert!(!sample.display_immediately());
        sample.set_display_immediately();
        assert!(sample.display_immediately());
    }
}
