// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder backends.
//!
//! A backend is a provider of H.264 decoding, most likely hardware-accelerated like VideoToolbox.
//! Backends implement [`crate::decoder::DecoderBackend`] and are driven by a
//! [`crate::decoder::DecompressionSession`].

#[cfg(test)]
pub(crate) mod dummy;
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub mod videotoolbox;
