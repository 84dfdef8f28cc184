// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pipeline events.
//!
//! Every stage of the receive pipeline reports what it did through an [`EventSink`]. Events carry
//! no payload; they are meant for statistics and health displays.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RtpEvent {
    H264ParameterSetCycled,
    PpsReceived,
    SpsReceived,
    NaluProduced,
    BadFragmentationUnit,
    ErrorInPipeline,
    H264FrameProduced,
    H264FrameSkipped,
    FormatDescriptionProduced,
    SampleBufferProduced,
    PacketReceived,
}

impl RtpEvent {
    pub const ALL: [RtpEvent; 11] = [
        RtpEvent::H264ParameterSetCycled,
        RtpEvent::PpsReceived,
        RtpEvent::SpsReceived,
        RtpEvent::NaluProduced,
        RtpEvent::BadFragmentationUnit,
        RtpEvent::ErrorInPipeline,
        RtpEvent::H264FrameProduced,
        RtpEvent::H264FrameSkipped,
        RtpEvent::FormatDescriptionProduced,
        RtpEvent::SampleBufferProduced,
        RtpEvent::PacketReceived,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Receiver of pipeline events. Events may be posted from the channel's receive task.
pub trait EventSink: Send + Sync {
    fn post_event(&self, event: RtpEvent);
}

impl<F> EventSink for F
where
    F: Fn(RtpEvent) + Send + Sync,
{
    fn post_event(&self, event: RtpEvent) {
        self(event)
    }
}

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn post_event(&self, _: RtpEvent) {}
}

/// Sink counting how many times each event has been posted.
#[derive(Debug, Default)]
pub struct EventCounters {
    counts: [AtomicU64; RtpEvent::ALL.len()],
}

impl EventCounters {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn get(&self, event: RtpEvent) -> u64 {
        self.counts[event.index()].load(Ordering::Relaxed)
    }

    /// Returns the count of every event, in [`RtpEvent::ALL`] order.
    pub fn snapshot(&self) -> Vec<(RtpEvent, u64)> {
        RtpEvent::ALL
            .iter()
            .map(|event| (*event, self.get(*event)))
            .collect()
    }
}

impl EventSink for EventCounters {
    fn post_event(&self, event: RtpEvent) {
        self.counts[event.index()].fetch_add(1, Ordering::Relaxed);
    }
}
