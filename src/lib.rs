// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Session manager for the Wave6 stateful hardware video encoder.
//!
//! The crate drives one encoding session per [`session::EncoderSession`]: format negotiation,
//! DMA and frame-buffer allocation, ROI map construction, CSC derivation, per-frame job
//! submission to the hardware and reconciliation of its asynchronous completions. The hardware
//! itself is reached through the [`hw::VpuTransport`] trait and buffers are exchanged through
//! the [`queue::BufferQueue`] trait.

pub mod backend;
pub mod color;
pub mod controls;
pub mod format;
pub mod geometry;
pub mod hw;
pub mod perf;
pub mod queue;
pub mod resources;
pub mod roi;
pub mod session;
pub mod worker;

use std::fmt;

/// A V4L2-style four character code describing a pixel or bitstream format.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Fourcc(pub u32);

impl Fourcc {
    pub const fn from_bytes(n: &[u8; 4]) -> Self {
        Self(n[0] as u32 | (n[1] as u32) << 8 | (n[2] as u32) << 16 | (n[3] as u32) << 24)
    }
}

impl From<u32> for Fourcc {
    fn from(fourcc: u32) -> Self {
        Self(fourcc)
    }
}

impl From<Fourcc> for u32 {
    fn from(fourcc: Fourcc) -> Self {
        fourcc.0
    }
}

impl From<&[u8; 4]> for Fourcc {
    fn from(n: &[u8; 4]) -> Self {
        Self::from_bytes(n)
    }
}

impl From<Fourcc> for [u8; 4] {
    fn from(n: Fourcc) -> Self {
        [n.0 as u8, (n.0 >> 8) as u8, (n.0 >> 16) as u8, (n.0 >> 24) as u8]
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let c: [u8; 4] = (*self).into();
        f.write_fmt(format_args!(
            "{}{}{}{}",
            c[0] as char, c[1] as char, c[2] as char, c[3] as char
        ))
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn get_area(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self { width: value.0, height: value.1 }
    }
}

/// A rectangle inside a picture, in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(left: u32, top: u32, width: u32, height: u32) -> Self {
        Self { left, top, width, height }
    }

    pub fn right(&self) -> u32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.top + self.height
    }
}

/// Rounds `value` up to the next multiple of `alignment`.
pub const fn align_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

/// Rounds `value` down to the previous multiple of `alignment`.
pub const fn align_down(value: u32, alignment: u32) -> u32 {
    value - value % alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_conversions() {
        let nv12 = Fourcc::from(b"NV12");
        assert_eq!(nv12.to_string(), "NV12");
        assert_eq!(<[u8; 4]>::from(nv12), *b"NV12");
        assert_eq!(u32::from(nv12), 0x3231_564e);
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0, 32), 0);
        assert_eq!(align_up(1, 32), 32);
        assert_eq!(align_up(1920, 512), 2048);
        assert_eq!(align_down(33, 32), 32);
        assert_eq!(align_down(31, 2), 30);
    }
}
