// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.
//!
//! This module is for anything that doesn't fit into the other top-level modules. Try not to add
//! new code here unless it really doesn't belong anywhere else.

use std::io::Write;
use std::sync::Arc;

use log::debug;

use crate::codec::h264::processor::Output;
use crate::media::FormatDescription;
use crate::media::SampleBuffer;
use crate::Error;
use crate::Result;

/// Four-byte Annex B start code.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Nothing written yet.
    Initial,
    /// Parameter sets written, waiting for the first sample.
    Configured,
    Recording,
    Finished,
}

/// Writes the pipeline's output as an H.264 Annex B elementary stream.
///
/// Parameter sets are written every time they change, followed by the samples using them.
/// Samples received before the first format description are refused.
pub struct AnnexBWriter<W: Write> {
    writer: W,
    state: WriterState,
    format: Option<Arc<FormatDescription>>,
    samples_written: usize,
}

impl<W: Write> AnnexBWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            state: WriterState::Initial,
            format: None,
            samples_written: 0,
        }
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn samples_written(&self) -> usize {
        self.samples_written
    }

    pub fn handle(&mut self, output: &Output) -> Result<()> {
        match output {
            Output::FormatDescription(format) => self.write_format_description(format),
            Output::SampleBuffer(sample) => self.write_sample(sample),
        }
    }

    pub fn write_format_description(&mut self, format: &Arc<FormatDescription>) -> Result<()> {
        if self.state == WriterState::Finished {
            return Err(Error::ChannelState("writer finished"));
        }

        if self.format.as_deref() == Some(format.as_ref()) {
            return Ok(());
        }

        debug!("Writing parameter sets for {}", format.visible_resolution());

        self.write_nalu(format.sps())?;
        self.write_nalu(format.pps())?;
        self.format = Some(Arc::clone(format));
        self.state = WriterState::Configured;

        Ok(())
    }

    pub fn write_sample(&mut self, sample: &SampleBuffer) -> Result<()> {
        match self.state {
            WriterState::Initial => return Err(Error::ChannelState("writer not configured")),
            WriterState::Finished => return Err(Error::ChannelState("writer finished")),
            WriterState::Configured | WriterState::Recording => (),
        }

        self.write_nalu(sample.nalu())?;
        self.samples_written += 1;
        self.state = WriterState::Recording;

        Ok(())
    }

    fn write_nalu(&mut self, nalu: &[u8]) -> Result<()> {
        self.writer.write_all(&START_CODE)?;
        self.writer.write_all(nalu)?;
        Ok(())
    }

    /// Flushes the stream. Nothing can be written afterwards.
    pub fn finish(&mut self) -> Result<()> {
        if self.state == WriterState::Finished {
            return Err(Error::ChannelState("writer finished"));
        }

        self.writer.flush()?;
        self.state = WriterState::Finished;

        Ok(())
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Iterator over the NAL units of an Annex B stream, start codes excluded.
pub struct AnnexBIterator<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> AnnexBIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn find_start_code(&self, offset: usize) -> Option<usize> {
        self.data[offset..]
            .windows(3)
            .position(|window| window == [0x00, 0x00, 0x01])
            .map(|pos| offset + pos)
    }
}

impl<'a> Iterator for AnnexBIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.find_start_code(self.pos)? + 3;

        let mut end = self.find_start_code(start).unwrap_or(self.data.len());
        self.pos = end;

        // Leading zero of a four-byte start code, or trailing_zero_8bits.
        while end > start && self.data[end - 1] == 0x00 {
            end -= 1;
        }

        Some(&self.data[start..end])
    }
}
