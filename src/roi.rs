// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Region of interest delta-QP maps.
//!
//! Users describe the map in CTU raster order. The hardware expects it grouped: CTUs are
//! gathered into `group.width` x `group.height` blocks, stored one block after the other.

use crate::align_up;
use crate::hw::params::CodecStd;
use crate::Resolution;

/// Column alignment of the hardware CTU grid, in pixels.
pub const ENC_CTU_WIDTH_ALIGNMENT: u32 = 512;
/// Largest number of map entries a user can provide.
pub const MAX_CUSTOM_MAP_UNITS: usize =
    (crate::format::MAX_ENC_PIC_WIDTH.div_ceil(16) * crate::format::MAX_ENC_PIC_HEIGHT.div_ceil(16))
        as usize;

/// Mask keeping the 6-bit two's complement delta QP of a map entry.
const DELTA_QP_MASK: u8 = 0x3f;

/// CTU grid of a picture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoiMapInfo {
    pub ctu: Resolution,
    pub group: Resolution,
    pub num_ctu_col: u32,
    pub num_ctu_row: u32,
    pub num_ctu: u32,
    pub num_group_col: u32,
    pub num_group_row: u32,
    pub custom_map_size: usize,
}

impl RoiMapInfo {
    /// Position of the CTU at `(row, col)` in the grouped map.
    fn map_index(&self, row: u32, col: u32) -> usize {
        let group = &self.group;
        let sub_index = group.width * (row % group.height) + (col % group.width);
        let index = self.num_group_col * (row / group.height) + (col / group.width);

        (index * group.width * group.height + sub_index) as usize
    }
}

pub fn roi_grid(std: CodecStd, width: u32, height: u32) -> RoiMapInfo {
    let (ctu, group) = match std {
        CodecStd::AvcEnc => (Resolution::from((16, 16)), Resolution::from((1, 1))),
        CodecStd::HevcEnc => (Resolution::from((32, 32)), Resolution::from((2, 2))),
    };

    let num_ctu_col = width.div_ceil(ctu.width);
    let num_ctu_row = height.div_ceil(ctu.height);

    let group_width = ctu.width * group.width;
    let group_height = ctu.height * group.height;
    let num_group_col = align_up(width, ENC_CTU_WIDTH_ALIGNMENT).div_ceil(group_width);
    let num_group_row = height.div_ceil(group_height);

    RoiMapInfo {
        ctu,
        group,
        num_ctu_col,
        num_ctu_row,
        num_ctu: num_ctu_col * num_ctu_row,
        num_group_col,
        num_group_row,
        custom_map_size: (num_group_col * num_group_row * group.width * group.height) as usize,
    }
}

/// Number of map bytes the hardware reads for a `width` x `height` picture.
pub fn internal_ctu_count(std: CodecStd, width: u32, height: u32) -> usize {
    roi_grid(std, width, height).custom_map_size
}

/// Writes `user_map`, given in CTU raster order, into the grouped layout of `roi`.
///
/// Nothing is written unless `user_map` holds exactly one entry per CTU. Values are truncated
/// to their low 6 bits.
pub fn remap_user_map(user_map: &[i32], roi: &RoiMapInfo, map: &mut [u8]) {
    if user_map.len() != roi.num_ctu as usize {
        log::debug!(
            "ignoring ROI map of {} entries, grid has {} CTUs",
            user_map.len(),
            roi.num_ctu
        );
        return;
    }

    for row in 0..roi.num_ctu_row {
        for col in 0..roi.num_ctu_col {
            let value = user_map[(row * roi.num_ctu_col + col) as usize];
            if let Some(dst) = map.get_mut(roi.map_index(row, col)) {
                *dst = (value as i8 as u8) & DELTA_QP_MASK;
            }
        }
    }
}

/// Reads a grouped map back into CTU raster order, sign extending each 6-bit entry.
pub fn raster_from_map(map: &[u8], roi: &RoiMapInfo) -> Vec<i32> {
    let mut out = Vec::with_capacity(roi.num_ctu as usize);

    for row in 0..roi.num_ctu_row {
        for col in 0..roi.num_ctu_col {
            let raw = map.get(roi.map_index(row, col)).copied().unwrap_or(0);
            out.push(((raw << 2) as i8 >> 2) as i32);
        }
    }

    out
}
