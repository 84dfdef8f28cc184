// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::h264::nalu::Nalu;
use crate::media::FormatDescription;
use crate::Error;
use crate::Result;

/// The latest SPS and PPS seen in the stream.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    pub(crate) sps: Option<Nalu>,
    pub(crate) pps: Option<Nalu>,
}

impl ParameterSet {
    pub fn sps(&self) -> Option<&Nalu> {
        self.sps.as_ref()
    }

    pub fn pps(&self) -> Option<&Nalu> {
        self.pps.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }

    pub fn to_format_description(&self) -> Result<FormatDescription> {
        match (&self.sps, &self.pps) {
            (Some(sps), Some(pps)) => {
                FormatDescription::from_parameter_sets(sps.data().clone(), pps.data().clone())
            }
            (sps, pps) => Err(Error::IncompleteParameterSet {
                sps: sps.is_some(),
                pps: pps.is_some(),
            }),
        }
    }
}

impl PartialEq for ParameterSet {
    fn eq(&self, other: &Self) -> bool {
        fn data(nalu: &Option<Nalu>) -> Option<&[u8]> {
            nalu.as_ref().map(|nalu| nalu.data().as_ref())
        }

        data(&self.sps) == data(&other.sps) && data(&self.pps) == data(&other.pps)
    }
}
