// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("buffer too short: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("unknown H264 type: {0}")]
    UnknownH264Type(u8),
    #[error("unexpected RTP payload type: {0}")]
    UnexpectedPayloadType(u8),
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
    #[error("skipping frame: {0}")]
    SkippedFrame(String),
    #[error("fragmentation unit error: {reason} ({sequence_numbers:?})")]
    FragmentationUnit {
        reason: &'static str,
        sequence_numbers: Vec<u16>,
    },
    #[error("malformed STAP-A: {0}")]
    MalformedAggregate(String),
    #[error("incomplete parameter set (sps: {sps}, pps: {pps})")]
    IncompleteParameterSet { sps: bool, pps: bool },
    #[error("{context} failed with status {status}")]
    Platform { status: i32, context: &'static str },
    #[error("invalid state: {0}")]
    ChannelState(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Os(#[from] nix::Error),
    #[error(transparent)]
    Parse(#[from] anyhow::Error),
}

impl Error {
    /// Builds an error from a platform status code, or returns `Ok` if the status is zero.
    pub fn check_status(status: i32, context: &'static str) -> Result<()> {
        if status == 0 {
            Ok(())
        } else {
            Err(Error::Platform { status, context })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn check_status() {
        assert!(Error::check_status(0, "VTDecompressionSessionCreate").is_ok());
        let err = Error::check_status(-12911, "VTDecompressionSessionCreate").unwrap_err();
        assert!(matches!(err, Error::Platform { status: -12911, .. }));
        assert_eq!(
            err.to_string(),
            "VTDecompressionSessionCreate failed with status -12911"
        );
    }

    #[test]
    fn fragmentation_unit_message_lists_sequence_numbers() {
        let err = Error::FragmentationUnit {
            reason: "gap in sequence numbers",
            sequence_numbers: vec![1, 3],
        };
        assert_eq!(
            err.to_string(),
            "fragmentation unit error: gap in sequence numbers ([1, 3])"
        );
    }
}
