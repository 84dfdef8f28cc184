// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Turns a sequence of H.264 NAL units into format descriptions and sample buffers.

use std::sync::Arc;

use log::debug;

use crate::codec::h264::nalu::H264Kind;
use crate::codec::h264::nalu::Nalu;
use crate::codec::h264::parameter_set::ParameterSet;
use crate::event::EventSink;
use crate::event::RtpEvent;
use crate::media::FormatDescription;
use crate::media::SampleBuffer;
use crate::Error;
use crate::Result;

#[derive(Debug, Clone)]
pub enum Output {
    /// A complete SPS/PPS pair was received. Emitted every time the pair completes.
    FormatDescription(Arc<FormatDescription>),
    /// A slice, ready to be decoded.
    SampleBuffer(SampleBuffer),
}

pub struct H264Processor {
    events: Arc<dyn EventSink>,
    /// The parameter set slices are described with.
    last_parameter_set: Option<ParameterSet>,
    last_format: Option<Arc<FormatDescription>>,
    /// Parameter set being collected.
    current_parameter_set: ParameterSet,
}

impl H264Processor {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self {
            events,
            last_parameter_set: None,
            last_format: None,
            current_parameter_set: Default::default(),
        }
    }

    /// The format description slices are currently attached to.
    pub fn format_description(&self) -> Option<&Arc<FormatDescription>> {
        self.last_format.as_ref()
    }

    pub fn process(&mut self, nalu: Nalu) -> Result<Option<Output>> {
        let kind = nalu.kind().ok_or(Error::UnknownH264Type(nalu.raw_type()))?;

        match kind {
            H264Kind::SliceIdr | H264Kind::SliceNonIdr => {
                return self.process_video_frame(&nalu).map(Some)
            }
            H264Kind::Sps => {
                self.current_parameter_set.sps = Some(nalu);
                self.events.post_event(RtpEvent::SpsReceived);
            }
            H264Kind::Pps => {
                self.current_parameter_set.pps = Some(nalu);
                self.events.post_event(RtpEvent::PpsReceived);
            }
        }

        if !self.current_parameter_set.is_complete() {
            return Ok(None);
        }

        let format = Arc::new(self.current_parameter_set.to_format_description()?);

        if self.last_parameter_set.as_ref() != Some(&self.current_parameter_set) {
            debug!(
                "H264 parameter set cycled ({} coded)",
                format.coded_resolution()
            );
            self.last_parameter_set = Some(std::mem::take(&mut self.current_parameter_set));
            self.last_format = Some(Arc::clone(&format));
            self.events.post_event(RtpEvent::H264ParameterSetCycled);
        }

        Ok(Some(Output::FormatDescription(format)))
    }

    fn process_video_frame(&self, nalu: &Nalu) -> Result<Output> {
        let format = match (&self.last_parameter_set, &self.last_format) {
            (Some(set), Some(format)) if set.is_complete() => Arc::clone(format),
            _ => {
                return Err(Error::SkippedFrame(
                    "No formatDescription, skipping frame.".into(),
                ))
            }
        };

        let mut sample = SampleBuffer::from_nalu(nalu, format)?;
        sample.set_display_immediately();

        Ok(Output::SampleBuffer(sample))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::H264Processor;
    use super::Output;
    use crate::codec::h264::nalu::Nalu;
    use crate::event::EventCounters;
    use crate::event::RtpEvent;
    use crate::media::tests::PPS;
    use crate::media::tests::SPS_640X480;
    use crate::media::MediaTime;
    use crate::Error;

    const IDR: [u8; 4] = [0x65, 0x88, 0x84, 0x21];
    const NON_IDR: [u8; 3] = [0x41, 0x9a, 0x02];

    fn nalu(timestamp: u32, data: &'static [u8]) -> Nalu {
        Nalu::new(MediaTime::from_rtp(timestamp, 90_000), Bytes::from_static(data)).unwrap()
    }

    fn processor() -> (H264Processor, Arc<EventCounters>) {
        let counters = Arc::new(EventCounters::new());
        (H264Processor::new(counters.clone()), counters)
    }

    #[test]
    fn slice_before_parameter_sets_is_skipped() {
        let (mut processor, _) = processor();
        let err = processor.process(nalu(0, &IDR)).unwrap_err();
        assert!(matches!(err, Error::SkippedFrame(_)));
    }

    #[test]
    fn unknown_type() {
        let (mut processor, _) = processor();
        // SEI
        let err = processor.process(nalu(0, &[0x06, 0x05, 0x00])).unwrap_err();
        assert!(matches!(err, Error::UnknownH264Type(6)));
    }

    #[test]
    fn parameter_sets_then_slices() {
        let (mut processor, counters) = processor();

        assert!(processor.process(nalu(0, &SPS_640X480)).unwrap().is_none());
        assert_eq!(counters.get(RtpEvent::SpsReceived), 1);

        let format = match processor.process(nalu(0, &PPS)).unwrap() {
            Some(Output::FormatDescription(format)) => format,
            other => panic!("unexpected output {:?}", other),
        };
        assert_eq!(format.sps().as_ref(), &SPS_640X480);
        assert_eq!(counters.get(RtpEvent::PpsReceived), 1);
        assert_eq!(counters.get(RtpEvent::H264ParameterSetCycled), 1);

        let sample = match processor.process(nalu(3000, &IDR)).unwrap() {
            Some(Output::SampleBuffer(sample)) => sample,
            other => panic!("unexpected output {:?}", other),
        };
        assert_eq!(sample.nalu(), &IDR);
        assert_eq!(&sample.data()[..4], &[0, 0, 0, 4]);
        assert!(sample.display_immediately());
        assert_eq!(sample.presentation_time(), MediaTime::from_rtp(3000, 90_000));
        assert!(Arc::ptr_eq(sample.format_description(), &format));

        assert!(matches!(
            processor.process(nalu(6000, &NON_IDR)).unwrap(),
            Some(Output::SampleBuffer(_))
        ));
    }

    #[test]
    fn cycle_only_on_change() {
        let (mut processor, counters) = processor();

        processor.process(nalu(0, &SPS_640X480)).unwrap();
        processor.process(nalu(0, &PPS)).unwrap();
        assert_eq!(counters.get(RtpEvent::H264ParameterSetCycled), 1);

        // The current set was reset on the cycle, so the SPS alone is not complete.
        assert!(processor.process(nalu(9000, &SPS_640X480)).unwrap().is_none());
        // Identical sets are reported again without cycling.
        assert!(matches!(
            processor.process(nalu(9000, &PPS)).unwrap(),
            Some(Output::FormatDescription(_))
        ));
        assert_eq!(counters.get(RtpEvent::H264ParameterSetCycled), 1);

        // A different PPS completes a new set with the pending SPS.
        let other_pps: &'static [u8] = &[0x68, 0xee, 0x3c, 0x80];
        assert!(matches!(
            processor.process(nalu(18000, other_pps)).unwrap(),
            Some(Output::FormatDescription(_))
        ));
        assert_eq!(counters.get(RtpEvent::H264ParameterSetCycled), 2);
        assert_eq!(
            processor.format_description().unwrap().pps().as_ref(),
            other_pps
        );
    }

    #[test]
    fn broken_sps_is_reported() {
        let (mut processor, counters) = processor();

        processor.process(nalu(0, &[0x67, 0x42])).unwrap();
        assert!(processor.process(nalu(0, &PPS)).is_err());
        assert_eq!(counters.get(RtpEvent::H264ParameterSetCycled), 0);
        assert!(processor.format_description().is_none());
    }
}
