// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! FU-A fragmentation units (RFC 6184 5.8) and their reassembly into NAL units.

use std::sync::Arc;

use bytes::Bytes;
use bytes::BytesMut;
use log::debug;

use crate::codec::h264::nalu::H264Kind;
use crate::codec::h264::nalu::Nalu;
use crate::codec::h264::nalu::NaluHeader;
use crate::event::EventSink;
use crate::event::RtpEvent;
use crate::media::MediaTime;
use crate::Error;
use crate::Result;

/// Where a fragment sits in its NAL unit, from the S and E bits of the FU header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Start,
    Middle,
    End,
}

#[derive(Debug, Clone)]
pub struct FragmentationUnit {
    position: Position,
    /// Type of the fragmented NAL unit.
    subtype: u8,
    /// `nal_ref_idc` of the FU indicator, which is also that of the fragmented NAL unit.
    ref_idc: u8,
    time: MediaTime,
    sequence_number: u16,
    body: Bytes,
}

impl FragmentationUnit {
    /// Parses the FU-A carried by `nalu`, whose header byte is the FU indicator.
    pub fn new(sequence_number: u16, nalu: &Nalu) -> Result<Self> {
        let payload = nalu.body();
        let header = match payload.first() {
            Some(byte) => *byte,
            None => return Err(Error::Truncated { needed: 1, got: 0 }),
        };

        let position = match header >> 6 {
            0b10 => Position::Start,
            0b00 => Position::Middle,
            0b01 => Position::End,
            _ => {
                return Err(Error::UnsupportedFeature(
                    "FU header with both start and end bits set".into(),
                ))
            }
        };

        if header & 0x20 != 0 {
            debug!("FU header reserved bit set (sequence number {})", sequence_number);
        }

        Ok(Self {
            position,
            subtype: header & 0x1f,
            ref_idc: nalu.ref_idc(),
            time: nalu.time(),
            sequence_number,
            body: payload.slice(1..),
        })
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn subtype(&self) -> u8 {
        self.subtype
    }

    pub fn sequence_number(&self) -> u16 {
        self.sequence_number
    }

    pub fn time(&self) -> MediaTime {
        self.time
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// Most fragments a NAL unit can be split into before reassembly is abandoned.
pub const MAX_PENDING_FRAGMENTS: usize = 4096;
/// Most payload bytes buffered for a single NAL unit.
pub const MAX_PENDING_BYTES: usize = 8 * 1024 * 1024;

/// Collects the fragments of a NAL unit and rebuilds it once the end fragment arrives.
pub struct Defragmenter {
    events: Arc<dyn EventSink>,
    fragments: Vec<FragmentationUnit>,
    pending_bytes: usize,
}

impl Defragmenter {
    pub fn new(events: Arc<dyn EventSink>) -> Self {
        Self {
            events,
            fragments: Vec::new(),
            pending_bytes: 0,
        }
    }

    /// Number of fragments waiting for their end fragment.
    pub fn pending(&self) -> usize {
        self.fragments.len()
    }

    pub fn process(&mut self, fragment: FragmentationUnit) -> Result<Option<Nalu>> {
        match fragment.position {
            Position::Start => {
                self.clear();
                self.push(fragment)?;
                Ok(None)
            }
            // Only a start fragment opens a NAL unit.
            Position::Middle if self.fragments.is_empty() => {
                debug!(
                    "Dropping middle fragment {} without a start fragment",
                    fragment.sequence_number
                );
                Ok(None)
            }
            Position::Middle => {
                self.push(fragment)?;
                Ok(None)
            }
            Position::End => {
                self.fragments.push(fragment);
                self.pending_bytes = 0;
                let fragments = std::mem::take(&mut self.fragments);
                self.reassemble(fragments).map(Some).inspect_err(|_| {
                    self.events.post_event(RtpEvent::BadFragmentationUnit);
                })
            }
        }
    }

    fn push(&mut self, fragment: FragmentationUnit) -> Result<()> {
        self.pending_bytes += fragment.body.len();
        self.fragments.push(fragment);

        if self.fragments.len() > MAX_PENDING_FRAGMENTS || self.pending_bytes > MAX_PENDING_BYTES {
            let err = fragmentation_error("Too much data pending reassembly", &self.fragments);
            self.clear();
            self.events.post_event(RtpEvent::BadFragmentationUnit);
            return Err(err);
        }

        Ok(())
    }

    fn clear(&mut self) {
        self.fragments.clear();
        self.pending_bytes = 0;
    }

    fn reassemble(&self, fragments: Vec<FragmentationUnit>) -> Result<Nalu> {
        let fragments = reorder_sequence(fragments)?;

        // reorder_sequence() guarantees a start and an end fragment.
        let first = &fragments[0];

        if fragments.iter().any(|fragment| fragment.time != first.time) {
            return Err(fragmentation_error(
                "Fragments carry different timestamps",
                &fragments,
            ));
        }

        if H264Kind::n(first.subtype).is_none() {
            return Err(Error::UnknownH264Type(first.subtype));
        }

        let len = 1 + fragments.iter().map(|f| f.body.len()).sum::<usize>();
        let mut data = BytesMut::with_capacity(len);
        data.extend_from_slice(&[NaluHeader::header_byte(first.ref_idc, first.subtype)]);
        for fragment in &fragments {
            data.extend_from_slice(&fragment.body);
        }

        Nalu::new(first.time, data.freeze())
    }
}

fn fragmentation_error(reason: &'static str, fragments: &[FragmentationUnit]) -> Error {
    Error::FragmentationUnit {
        reason,
        sequence_numbers: fragments.iter().map(|f| f.sequence_number).collect(),
    }
}

/// Sorts fragments by sequence number, accounting for the 16-bit wrap-around. Fails on gaps
/// and when the result does not go from a start fragment to an end fragment.
fn reorder_sequence(mut fragments: Vec<FragmentationUnit>) -> Result<Vec<FragmentationUnit>> {
    fragments.sort_by_key(|fragment| fragment.sequence_number);

    let (first, last) = match (fragments.first(), fragments.last()) {
        (Some(first), Some(last)) => (first.sequence_number, last.sequence_number),
        _ => return Err(fragmentation_error("No fragments", &fragments)),
    };

    // A run crossing the wrap-around holds both 0 and 65535 once sorted.
    let wraps_around = first == 0 && last == u16::MAX;

    let mut gap_index = None;
    for (index, pair) in fragments.windows(2).enumerate() {
        let delta = pair[1].sequence_number.wrapping_sub(pair[0].sequence_number);
        if delta == 1 {
            continue;
        }

        if !wraps_around {
            return Err(fragmentation_error(
                "Fragmentation unit doesn't wrap but have found a gap in sequence numbers",
                &fragments,
            ));
        }
        if gap_index.is_some() {
            return Err(fragmentation_error(
                "Fragmentation unit does wrap but have found more than one gap in sequence numbers",
                &fragments,
            ));
        }
        gap_index = Some(index + 1);
    }

    if wraps_around {
        match gap_index {
            Some(gap_index) => fragments.rotate_left(gap_index),
            // Every sequence number present: 65536 fragments is not a real stream.
            None => {
                return Err(fragmentation_error(
                    "Fragmentation unit wraps without a gap",
                    &fragments,
                ))
            }
        }
    }

    let starts = fragments.first().map(|f| f.position) == Some(Position::Start);
    let ends = fragments.last().map(|f| f.position) == Some(Position::End);
    if !starts || !ends {
        return Err(fragmentation_error(
            "First and last packets not start and end packets of a sequence",
            &fragments,
        ));
    }

    Ok(fragments)
}
