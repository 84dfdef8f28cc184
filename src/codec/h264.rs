// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod fu;
pub mod nalu;
pub(crate) mod nalu_reader;
pub mod parameter_set;
pub mod parser;
pub mod processor;
