// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encode region alignment, source plane offsets and rate-control buffer sizing.

use crate::align_down;
use crate::align_up;
use crate::format::ComponentLayout;
use crate::format::ENC_PIC_SIZE_STEP;
use crate::Rect;

/// Horizontal position granularity of the encoded window inside the source.
pub const ENC_CROP_X_POS_STEP: u32 = 32;
/// Vertical position granularity of the encoded window inside the source.
pub const ENC_CROP_Y_POS_STEP: u32 = 2;
/// Granularity of user crop rectangles.
pub const ENC_CROP_STEP: u32 = 2;

/// The user crop and the hardware-aligned rectangle that covers it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncodeRegion {
    pub crop: Rect,
    pub codec_rect: Rect,
}

impl EncodeRegion {
    pub fn new(crop: Rect) -> Self {
        let codec_rect =
            align_region(&crop, ENC_CROP_X_POS_STEP, ENC_CROP_Y_POS_STEP, ENC_PIC_SIZE_STEP);

        Self { crop, codec_rect }
    }
}

/// Aligns `crop` to the hardware steps. The origin is rounded down to `(x_step, y_step)`, the
/// size is rounded up to `size_step` so that the result still covers all of `crop`.
pub fn align_region(crop: &Rect, x_step: u32, y_step: u32, size_step: u32) -> Rect {
    let left = align_down(crop.left, x_step);
    let top = align_down(crop.top, y_step);

    Rect {
        left,
        top,
        width: align_up(crop.width + crop.left - left, size_step),
        height: align_up(crop.height + crop.top - top, size_step),
    }
}

/// Byte offsets of the window at `region` inside a source frame whose luma plane has `stride`
/// bytes per line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlaneOffsets {
    pub luma: u64,
    pub chroma: u64,
}

pub fn compute_chroma_offset(
    stride: u32,
    bpp_luma: u32,
    bpp_chroma: u32,
    hdiv: u32,
    vdiv: u32,
    region: &Rect,
) -> PlaneOffsets {
    let luma = region.top as u64 * stride as u64 + region.left as u64 * bpp_luma as u64;

    let chroma_stride = stride.div_ceil(bpp_luma) as u64 * bpp_chroma as u64;
    // The vertical term is divided by both subsampling factors, as the firmware expects.
    let chroma = region.top as u64 * chroma_stride / vdiv as u64 / hdiv as u64
        + region.left as u64 * bpp_chroma as u64 / hdiv as u64;

    PlaneOffsets { luma, chroma }
}

/// Offsets of `region` for a raw format with the given component layout.
pub fn layout_offsets(stride: u32, layout: &ComponentLayout, region: &Rect) -> PlaneOffsets {
    compute_chroma_offset(stride, layout.bpp[0], layout.bpp[1], layout.hdiv, layout.vdiv, region)
}

/// Converts a coded picture buffer size into milliseconds at `bitrate`.
///
/// Results outside of `[10, 100000]`, including a zero bitrate, fall back to 10 seconds.
pub fn cpb_size_msec(cpb_size_kb: u32, bitrate: u32) -> u32 {
    const DEFAULT_CPB_MSEC: u64 = 10000;

    let cpb_size_bit = cpb_size_kb as u64 * 1000 * 8;
    let msec = cpb_size_bit * 1000 / (bitrate.max(1) as u64);

    if !(10..=100000).contains(&msec) {
        return DEFAULT_CPB_MSEC as u32;
    }
    msec as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_region_covers_crop() {
        let steps = [(32, 2, 8), (16, 16, 16), (1, 1, 1), (64, 4, 32)];

        for (sx, sy, ss) in steps {
            for left in (0..200).step_by(7) {
                for top in (0..100).step_by(5) {
                    for size in [1u32, 7, 128, 255, 1081] {
                        let crop = Rect::new(left, top, size + left % 3, size + top % 5);
                        let r = align_region(&crop, sx, sy, ss);

                        assert!(r.left <= crop.left);
                        assert!(r.top <= crop.top);
                        assert!(r.right() >= crop.right());
                        assert!(r.bottom() >= crop.bottom());
                        assert_eq!(r.left % sx, 0);
                        assert_eq!(r.top % sy, 0);
                        assert_eq!(r.width % ss, 0);
                        assert_eq!(r.height % ss, 0);
                    }
                }
            }
        }
    }

    #[test]
    fn encode_region_steps() {
        let region = EncodeRegion::new(Rect::new(40, 3, 1000, 500));
        assert_eq!(region.codec_rect, Rect::new(32, 2, 1008, 504));
    }

    #[test]
    fn offsets() {
        // NV12, 1920 bytes per line, window at (64, 10).
        let offsets = compute_chroma_offset(1920, 1, 2, 2, 2, &Rect::new(64, 10, 256, 128));
        assert_eq!(offsets.luma, 10 * 1920 + 64);
        assert_eq!(offsets.chroma, 10 * 3840 / 2 / 2 + 64 * 2 / 2);

        let at_origin = compute_chroma_offset(1920, 1, 2, 2, 2, &Rect::new(0, 0, 256, 128));
        assert_eq!(at_origin, PlaneOffsets::default());
    }

    #[test]
    fn cpb_size() {
        assert_eq!(cpb_size_msec(1000, 8_000_000), 1000);
        assert_eq!(cpb_size_msec(1000, 1), 10000);
        assert_eq!(cpb_size_msec(0, 2_097_152), 10000);
        assert_eq!(cpb_size_msec(1, 800_000), 10);
        assert_eq!(cpb_size_msec(1000, 0), 10000);
    }
}
