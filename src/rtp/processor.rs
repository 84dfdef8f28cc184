// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use byteorder::BigEndian;
use byteorder::ByteOrder;
use bytes::Bytes;
use log::debug;

use crate::codec::h264::fu::Defragmenter;
use crate::codec::h264::fu::FragmentationUnit;
use crate::codec::h264::nalu::H264RtpType;
use crate::codec::h264::nalu::Nalu;
use crate::event::EventSink;
use crate::media::MediaTime;
use crate::rtp::RtpPacket;
use crate::Error;
use crate::Result;
use crate::DEFAULT_PAYLOAD_TYPE;
use crate::H264_CLOCK_RATE;

/// Extracts H.264 NAL units from RTP packets.
pub struct RtpProcessor {
    payload_type: u8,
    clock_rate: i32,
    defragmenter: Defragmenter,
}

impl RtpProcessor {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self::with_payload_type(events, DEFAULT_PAYLOAD_TYPE, H264_CLOCK_RATE)
    }

    pub fn with_payload_type(
        events: Arc<dyn EventSink>,
        payload_type: u8,
        clock_rate: i32,
    ) -> Self {
        Self {
            payload_type,
            clock_rate,
            defragmenter: Defragmenter::new(events),
        }
    }

    /// Processes one datagram. Returns `None` while a fragmented NAL unit is incomplete.
    pub fn process(&mut self, data: Bytes) -> Result<Option<Vec<Nalu>>> {
        let packet = RtpPacket::parse(data)?;

        debug!("{}", packet);

        let time = MediaTime::from_rtp(packet.timestamp, self.clock_rate);

        if packet.version != 2 {
            return Err(Error::UnsupportedFeature(format!(
                "RTP version {} not supported",
                packet.version
            )));
        }

        if packet.padding_flag {
            return Err(Error::UnsupportedFeature(
                "RTP padding flag not supported (yet)".into(),
            ));
        }

        if packet.extension_flag {
            return Err(Error::UnsupportedFeature(
                "RTP extension flag not supported (yet)".into(),
            ));
        }

        if packet.csrc_count != 0 {
            return Err(Error::UnsupportedFeature(
                "Non-zero CSRC not supported (yet)".into(),
            ));
        }

        let nalu = Nalu::new(time, packet.body.clone())?;

        if packet.payload_type != self.payload_type {
            return Err(Error::UnexpectedPayloadType(packet.payload_type));
        }

        match nalu.rtp_type() {
            Some(H264RtpType::FuA) => {
                let fragment = FragmentationUnit::new(packet.sequence_number, &nalu)?;
                Ok(self.defragmenter.process(fragment)?.map(|nalu| vec![nalu]))
            }
            Some(H264RtpType::StapA) => Self::process_stap_a(&nalu).map(Some),
            Some(type_) => Err(Error::UnsupportedFeature(format!(
                "Unsupported H264 RTP type: {:?}",
                type_
            ))),
            None => Ok(Some(vec![nalu])),
        }
    }

    /// Splits a single-time aggregation packet: a run of 16-bit size prefixed NAL units.
    fn process_stap_a(nalu: &Nalu) -> Result<Vec<Nalu>> {
        let mut nalus = Vec::new();
        let mut data = nalu.body();

        while data.len() >= 2 {
            let chunk_len = usize::from(BigEndian::read_u16(&data[..2]));

            if chunk_len > data.len() - 2 {
                return Err(Error::MalformedAggregate(format!(
                    "chunk length {} longer than the {} bytes left",
                    chunk_len,
                    data.len() - 2
                )));
            }
            if chunk_len == 0 {
                return Err(Error::MalformedAggregate("empty chunk".into()));
            }

            nalus.push(Nalu::new(nalu.time(), data.slice(2..2 + chunk_len))?);
            data = data.slice(2 + chunk_len..);
        }

        Ok(nalus)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::RtpProcessor;
    use crate::codec::h264::nalu::H264Kind;
    use crate::event::EventCounters;
    use crate::event::NullSink;
    use crate::media::MediaTime;
    use crate::Error;

    fn packet(first_byte: u8, payload_type: u8, sequence_number: u16, payload: &[u8]) -> Bytes {
        let mut data = vec![first_byte, payload_type];
        data.extend_from_slice(&sequence_number.to_be_bytes());
        data.extend_from_slice(&3000u32.to_be_bytes());
        data.extend_from_slice(&0x1234_5678u32.to_be_bytes());
        data.extend_from_slice(payload);
        Bytes::from(data)
    }

    fn processor() -> RtpProcessor {
        RtpProcessor::new(Arc::new(NullSink))
    }

    #[test]
    fn single_nalu() {
        let mut processor = processor();
        let nalus = processor
            .process(packet(0x80, 96, 1, &[0x65, 0x88, 0x80]))
            .unwrap()
            .unwrap();

        assert_eq!(nalus.len(), 1);
        assert_eq!(nalus[0].kind(), Some(H264Kind::SliceIdr));
        assert_eq!(nalus[0].data().as_ref(), &[0x65, 0x88, 0x80]);
        assert_eq!(nalus[0].time(), MediaTime::new(3000, 90_000));
    }

    #[test]
    fn marker_bit_does_not_change_payload_type() {
        let mut processor = processor();
        assert!(processor
            .process(packet(0x80, 0x80 | 96, 1, &[0x41, 0x00]))
            .unwrap()
            .is_some());
    }

    #[test]
    fn unsupported_header_features() {
        let mut processor = processor();
        for first_byte in [0xa0, 0x90, 0x81, 0x40] {
            let err = processor
                .process(packet(first_byte, 96, 1, &[0x65]))
                .unwrap_err();
            assert!(
                matches!(err, Error::UnsupportedFeature(_)),
                "{:#x}: {:?}",
                first_byte,
                err
            );
        }
    }

    #[test]
    fn wrong_payload_type() {
        let mut processor = processor();
        let err = processor.process(packet(0x80, 97, 1, &[0x65])).unwrap_err();
        assert!(matches!(err, Error::UnexpectedPayloadType(97)));
    }

    #[test]
    fn empty_payload() {
        let mut processor = processor();
        let err = processor.process(packet(0x80, 96, 1, &[])).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }

    #[test]
    fn fragmented_nalu() {
        let counters = Arc::new(EventCounters::new());
        let mut processor = RtpProcessor::new(counters.clone());

        assert!(processor
            .process(packet(0x80, 96, 10, &[0x7c, 0x85, 1, 2]))
            .unwrap()
            .is_none());
        assert!(processor
            .process(packet(0x80, 96, 11, &[0x7c, 0x05, 3]))
            .unwrap()
            .is_none());
        let nalus = processor
            .process(packet(0x80, 96, 12, &[0x7c, 0x45, 4]))
            .unwrap()
            .unwrap();

        assert_eq!(nalus.len(), 1);
        assert_eq!(nalus[0].data().as_ref(), &[0x65, 1, 2, 3, 4]);
    }

    #[test]
    fn stap_a() {
        let mut processor = processor();
        let payload = [
            0x78, // STAP-A
            0x00, 0x03, 0x67, 0x42, 0xc0, // SPS
            0x00, 0x02, 0x68, 0xce, // PPS
        ];
        let nalus = processor
            .process(packet(0x80, 96, 1, &payload))
            .unwrap()
            .unwrap();

        assert_eq!(nalus.len(), 2);
        assert_eq!(nalus[0].kind(), Some(H264Kind::Sps));
        assert_eq!(nalus[0].data().as_ref(), &[0x67, 0x42, 0xc0]);
        assert_eq!(nalus[1].kind(), Some(H264Kind::Pps));
        assert_eq!(nalus[1].data().as_ref(), &[0x68, 0xce]);
    }

    #[test]
    fn stap_a_trailing_byte_ignored() {
        let mut processor = processor();
        let payload = [
            0x78, // STAP-A
            0x00, 0x02, 0x68, 0xce, // PPS
            0x00, 0x02, 0x41, 0x9a, // non-IDR slice
            0x00, // lone trailing byte
        ];
        let nalus = processor
            .process(packet(0x80, 96, 1, &payload))
            .unwrap()
            .unwrap();

        assert_eq!(nalus.len(), 2);
        assert_eq!(nalus[0].data().as_ref(), &[0x68, 0xce]);
        assert_eq!(nalus[1].data().as_ref(), &[0x41, 0x9a]);
    }

    #[test]
    fn stap_a_overlong_chunk() {
        let mut processor = processor();
        let err = processor
            .process(packet(0x80, 96, 1, &[0x78, 0x00, 0x05, 0x67, 0x42]))
            .unwrap_err();
        assert!(matches!(err, Error::MalformedAggregate(_)));
    }

    #[test]
    fn stap_a_empty_chunk() {
        let mut processor = processor();
        let err = processor
            .process(packet(0x80, 96, 1, &[0x78, 0x00, 0x00, 0x00, 0x01, 0x41]))
            .unwrap_err();
        assert!(matches!(err, Error::MalformedAggregate(_)));
    }

    #[test]
    fn unsupported_packetization() {
        let mut processor = processor();
        // FU-B
        let err = processor
            .process(packet(0x80, 96, 1, &[0x7d, 0x85, 0x00, 0x01]))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFeature(_)));
    }
}
