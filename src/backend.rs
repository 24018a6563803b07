// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Implementations of [`crate::hw::VpuTransport`].
//!
//! The only backend shipped with the crate is a software simulation of the codec, used to
//! exercise sessions without hardware.

pub mod dummy;
