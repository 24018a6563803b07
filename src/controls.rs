// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Encoder controls.
//!
//! Controls are addressed by [`ControlId`] and carry plain integer values, as they would through
//! the V4L2 control interface. Every value is checked against the range of its control before
//! it is stored; menu controls are additionally checked against the entries the hardware
//! supports.

use enumn::N;
use thiserror::Error;

use crate::roi::MAX_CUSTOM_MAP_UNITS;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("value {value} of {id:?} is outside [{min}, {max}]")]
    OutOfRange { id: ControlId, value: i32, min: i32, max: i32 },
    #[error("value {value} of {id:?} is not a multiple of {step}")]
    InvalidStep { id: ControlId, value: i32, step: i32 },
    #[error("menu entry {value} of {id:?} is not supported")]
    InvalidMenuEntry { id: ControlId, value: i32 },
    #[error("{0:?} is read-only")]
    ReadOnly(ControlId),
    #[error("{0:?} takes an array of values")]
    ArrayControl(ControlId),
    #[error("ROI map has {0} entries, at most {MAX_CUSTOM_MAP_UNITS} are supported")]
    RoiMapTooLarge(usize),
}

pub type ControlResult<T> = Result<T, ControlError>;

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, N)]
pub enum H264Profile {
    Baseline = 0,
    ConstrainedBaseline = 1,
    Main = 2,
    Extended = 3,
    #[default]
    High = 4,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
pub enum H264Level {
    L1_0 = 0,
    L1b = 1,
    L1_1 = 2,
    L1_2 = 3,
    L1_3 = 4,
    L2_0 = 5,
    L2_1 = 6,
    L2_2 = 7,
    L3_0 = 8,
    L3_1 = 9,
    L3_2 = 10,
    L4_0 = 11,
    L4_1 = 12,
    L4_2 = 13,
    #[default]
    L5_0 = 14,
    L5_1 = 15,
    L5_2 = 16,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
pub enum H264LoopFilterMode {
    #[default]
    Enabled = 0,
    Disabled = 1,
    DisabledAtSliceBoundary = 2,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
pub enum H264EntropyMode {
    Cavlc = 0,
    #[default]
    Cabac = 1,
}

/// Sample aspect ratio indicator meaning "explicit width and height follow".
pub const VUI_SAR_IDC_EXTENDED: u32 = 17;

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
pub enum HevcProfile {
    #[default]
    Main = 0,
    MainStillPicture = 1,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
pub enum HevcLevel {
    L1 = 0,
    L2 = 1,
    L2_1 = 2,
    L3 = 3,
    L3_1 = 4,
    L4 = 5,
    L4_1 = 6,
    #[default]
    L5 = 7,
    L5_1 = 8,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
pub enum HevcLoopFilterMode {
    Disabled = 0,
    #[default]
    Enabled = 1,
    DisabledAtSliceBoundary = 2,
}

/// Refresh picture type. CRA (1) is not supported by the hardware.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
pub enum HevcRefreshType {
    None = 0,
    #[default]
    Idr = 2,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
pub enum BitrateMode {
    Vbr = 0,
    #[default]
    Cbr = 1,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
pub enum SliceMode {
    #[default]
    Single = 0,
    MaxMb = 1,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
pub enum FrameSkipMode {
    #[default]
    Disabled = 0,
    BufLimit = 2,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
pub enum RoiMode {
    #[default]
    None = 0,
    MapDeltaQp = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ControlId {
    HFlip,
    VFlip,
    Rotate,
    MinBuffersForOutput,
    GopSize,
    SliceMode,
    SliceMaxMb,
    BitrateMode,
    Bitrate,
    FrameRcEnable,
    MbRcEnable,
    ForceKeyFrame,
    PrependSpsPpsToIdr,
    IntraRefreshPeriod,
    FrameSkipMode,
    AverageQp,
    RoiMode,
    HevcProfile,
    HevcLevel,
    HevcMinQp,
    HevcMaxQp,
    HevcIFrameQp,
    HevcPFrameQp,
    HevcBFrameQp,
    HevcLoopFilterMode,
    HevcLfBetaOffsetDiv2,
    HevcLfTcOffsetDiv2,
    HevcRefreshType,
    HevcRefreshPeriod,
    HevcConstIntraPred,
    HevcStrongSmoothing,
    HevcTmvPrediction,
    H264Profile,
    H264Level,
    H264MinQp,
    H264MaxQp,
    H264IFrameQp,
    H264PFrameQp,
    H264BFrameQp,
    H264LoopFilterMode,
    H264LoopFilterBeta,
    H264LoopFilterAlpha,
    H264Transform8x8,
    H264ConstrainedIntraPrediction,
    H264ChromaQpIndexOffset,
    H264EntropyMode,
    H264IPeriod,
    H264VuiSarEnable,
    H264VuiSarIdc,
    H264VuiExtSarWidth,
    H264VuiExtSarHeight,
    H264CpbSize,
    RoiMapDeltaQp,
}

/// Range of the values a control accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlRange {
    pub min: i32,
    pub max: i32,
    pub step: i32,
    pub read_only: bool,
}

impl ControlRange {
    const fn new(min: i32, max: i32) -> Self {
        Self { min, max, step: 1, read_only: false }
    }
}

const BOOLEAN: ControlRange = ControlRange::new(0, 1);

const QP_MIN: i32 = 0;
const QP_MAX: i32 = 51;

impl ControlId {
    pub fn range(self) -> ControlRange {
        use ControlId::*;

        match self {
            HFlip | VFlip | FrameRcEnable | MbRcEnable | PrependSpsPpsToIdr => BOOLEAN,
            HevcConstIntraPred | HevcStrongSmoothing | HevcTmvPrediction => BOOLEAN,
            H264Transform8x8 | H264ConstrainedIntraPrediction | H264VuiSarEnable => BOOLEAN,
            Rotate => ControlRange { step: 90, ..ControlRange::new(0, 270) },
            MinBuffersForOutput => ControlRange::new(1, 32),
            GopSize | HevcRefreshPeriod | H264IPeriod => ControlRange::new(0, 2047),
            SliceMode | BitrateMode | RoiMode | HevcProfile | H264EntropyMode => BOOLEAN,
            SliceMaxMb => ControlRange::new(0, 0x3ffff),
            Bitrate => ControlRange::new(1, 240_000_000),
            ForceKeyFrame => ControlRange::new(0, 0),
            IntraRefreshPeriod => ControlRange::new(0, 2160),
            FrameSkipMode | HevcLoopFilterMode | HevcRefreshType => ControlRange::new(0, 2),
            H264LoopFilterMode => ControlRange::new(0, 2),
            AverageQp => ControlRange { read_only: true, ..ControlRange::new(0, QP_MAX) },
            HevcLevel => ControlRange::new(0, 8),
            H264Profile => ControlRange::new(0, 4),
            H264Level => ControlRange::new(0, 16),
            HevcMinQp | HevcMaxQp | HevcIFrameQp | HevcPFrameQp | HevcBFrameQp => {
                ControlRange::new(QP_MIN, QP_MAX)
            }
            H264MinQp | H264MaxQp | H264IFrameQp | H264PFrameQp | H264BFrameQp => {
                ControlRange::new(QP_MIN, QP_MAX)
            }
            HevcLfBetaOffsetDiv2 | HevcLfTcOffsetDiv2 => ControlRange::new(-6, 6),
            H264LoopFilterBeta | H264LoopFilterAlpha => ControlRange::new(-6, 6),
            H264ChromaQpIndexOffset => ControlRange::new(-12, 12),
            H264VuiSarIdc => ControlRange::new(0, VUI_SAR_IDC_EXTENDED as i32),
            H264VuiExtSarWidth | H264VuiExtSarHeight => ControlRange::new(0, 0xffff),
            H264CpbSize => ControlRange::new(0, 18_750_000),
            RoiMapDeltaQp => ControlRange::new(-QP_MAX, QP_MAX),
        }
    }

    /// Value the control takes in a new session.
    pub fn default_value(self) -> i32 {
        EncControls::default().get(self)
    }

    fn check(self, value: i32) -> ControlResult<()> {
        let range = self.range();

        if range.read_only {
            return Err(ControlError::ReadOnly(self));
        }
        if value < range.min || value > range.max {
            return Err(ControlError::OutOfRange {
                id: self,
                value,
                min: range.min,
                max: range.max,
            });
        }
        if (value - range.min) % range.step != 0 {
            return Err(ControlError::InvalidStep { id: self, value, step: range.step });
        }

        Ok(())
    }
}

fn menu<T: MenuEntry>(id: ControlId, value: i32) -> ControlResult<T> {
    u32::try_from(value)
        .ok()
        .and_then(T::from_entry)
        .ok_or(ControlError::InvalidMenuEntry { id, value })
}

/// A menu control value, built from its raw entry index.
trait MenuEntry: Sized {
    fn from_entry(value: u32) -> Option<Self>;
}

macro_rules! impl_menu {
    ($($t:ty),*) => {
        $(impl MenuEntry for $t {
            fn from_entry(value: u32) -> Option<Self> {
                <$t>::n(value)
            }
        })*
    };
}

impl_menu!(
    H264Profile,
    H264Level,
    H264LoopFilterMode,
    H264EntropyMode,
    HevcProfile,
    HevcLevel,
    HevcLoopFilterMode,
    HevcRefreshType,
    BitrateMode,
    SliceMode,
    FrameSkipMode,
    RoiMode
);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct H264Controls {
    pub profile: H264Profile,
    pub level: H264Level,
    pub min_qp: u32,
    pub max_qp: u32,
    pub i_frame_qp: u32,
    pub p_frame_qp: u32,
    pub b_frame_qp: u32,
    pub loop_filter_mode: H264LoopFilterMode,
    pub loop_filter_beta: i32,
    pub loop_filter_alpha: i32,
    pub transform_8x8: bool,
    pub constrained_intra_prediction: bool,
    pub chroma_qp_index_offset: i32,
    pub entropy_mode: H264EntropyMode,
    pub i_period: u32,
    pub vui_sar_enable: bool,
    pub vui_sar_idc: u32,
    pub vui_ext_sar_width: u32,
    pub vui_ext_sar_height: u32,
    /// Coded picture buffer size in kilobytes.
    pub cpb_size: u32,
}

impl Default for H264Controls {
    fn default() -> Self {
        Self {
            profile: Default::default(),
            level: Default::default(),
            min_qp: 8,
            max_qp: 51,
            i_frame_qp: 30,
            p_frame_qp: 30,
            b_frame_qp: 30,
            loop_filter_mode: Default::default(),
            loop_filter_beta: 0,
            loop_filter_alpha: 0,
            transform_8x8: true,
            constrained_intra_prediction: false,
            chroma_qp_index_offset: 0,
            entropy_mode: Default::default(),
            i_period: 0,
            vui_sar_enable: false,
            vui_sar_idc: 0,
            vui_ext_sar_width: 0,
            vui_ext_sar_height: 0,
            cpb_size: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HevcControls {
    pub profile: HevcProfile,
    pub level: HevcLevel,
    pub min_qp: u32,
    pub max_qp: u32,
    pub i_frame_qp: u32,
    pub p_frame_qp: u32,
    pub b_frame_qp: u32,
    pub loop_filter_mode: HevcLoopFilterMode,
    pub lf_beta_offset_div2: i32,
    pub lf_tc_offset_div2: i32,
    pub refresh_type: HevcRefreshType,
    pub refresh_period: u32,
    pub const_intra_pred: bool,
    pub strong_smoothing: bool,
    pub tmv_prediction: bool,
}

impl Default for HevcControls {
    fn default() -> Self {
        Self {
            profile: Default::default(),
            level: Default::default(),
            min_qp: 8,
            max_qp: 51,
            i_frame_qp: 30,
            p_frame_qp: 30,
            b_frame_qp: 30,
            loop_filter_mode: Default::default(),
            lf_beta_offset_div2: 0,
            lf_tc_offset_div2: 0,
            refresh_type: Default::default(),
            refresh_period: 0,
            const_intra_pred: false,
            strong_smoothing: true,
            tmv_prediction: true,
        }
    }
}

/// Values of every encoder control of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncControls {
    /// Bit 0 mirrors vertically, bit 1 horizontally.
    pub mirror_direction: u32,
    pub rot_angle: u32,
    pub min_buffers_for_output: u32,
    pub gop_size: u32,
    pub slice_mode: SliceMode,
    pub slice_max_mb: u32,
    pub bitrate_mode: BitrateMode,
    pub bitrate: u32,
    pub frame_rc_enable: bool,
    pub mb_rc_enable: bool,
    /// Pending request to encode the next queued frame as IDR.
    pub force_key_frame: bool,
    pub prepend_spspps_to_idr: bool,
    pub intra_refresh_period: u32,
    pub frame_skip_mode: FrameSkipMode,
    pub average_qp: u32,
    pub roi_mode: RoiMode,
    pub h264: H264Controls,
    pub hevc: HevcControls,
}

impl Default for EncControls {
    fn default() -> Self {
        Self {
            mirror_direction: 0,
            rot_angle: 0,
            min_buffers_for_output: 1,
            gop_size: 30,
            slice_mode: Default::default(),
            slice_max_mb: 1,
            bitrate_mode: Default::default(),
            bitrate: 2_097_152,
            frame_rc_enable: true,
            mb_rc_enable: true,
            force_key_frame: false,
            prepend_spspps_to_idr: true,
            intra_refresh_period: 0,
            frame_skip_mode: Default::default(),
            average_qp: 0,
            roi_mode: Default::default(),
            h264: Default::default(),
            hevc: Default::default(),
        }
    }
}

const MIRROR_VERTICAL: u32 = 1 << 0;
const MIRROR_HORIZONTAL: u32 = 1 << 1;

fn set_bit(bits: &mut u32, mask: u32, on: bool) {
    if on {
        *bits |= mask;
    } else {
        *bits &= !mask;
    }
}

impl EncControls {
    /// Validates `value` and stores it in the control `id`.
    pub fn set(&mut self, id: ControlId, value: i32) -> ControlResult<()> {
        use ControlId::*;

        if id == RoiMapDeltaQp {
            return Err(ControlError::ArrayControl(id));
        }
        id.check(value)?;

        let v = value as u32;
        let on = value != 0;

        match id {
            HFlip => set_bit(&mut self.mirror_direction, MIRROR_HORIZONTAL, on),
            VFlip => set_bit(&mut self.mirror_direction, MIRROR_VERTICAL, on),
            Rotate => self.rot_angle = v,
            MinBuffersForOutput => self.min_buffers_for_output = v,
            GopSize => self.gop_size = v,
            SliceMode => self.slice_mode = menu(id, value)?,
            SliceMaxMb => self.slice_max_mb = v,
            BitrateMode => self.bitrate_mode = menu(id, value)?,
            Bitrate => self.bitrate = v,
            FrameRcEnable => self.frame_rc_enable = on,
            MbRcEnable => self.mb_rc_enable = on,
            ForceKeyFrame => self.force_key_frame = true,
            PrependSpsPpsToIdr => self.prepend_spspps_to_idr = on,
            IntraRefreshPeriod => self.intra_refresh_period = v,
            FrameSkipMode => self.frame_skip_mode = menu(id, value)?,
            RoiMode => self.roi_mode = menu(id, value)?,
            HevcProfile => self.hevc.profile = menu(id, value)?,
            HevcLevel => self.hevc.level = menu(id, value)?,
            HevcMinQp => self.hevc.min_qp = v,
            HevcMaxQp => self.hevc.max_qp = v,
            HevcIFrameQp => self.hevc.i_frame_qp = v,
            HevcPFrameQp => self.hevc.p_frame_qp = v,
            HevcBFrameQp => self.hevc.b_frame_qp = v,
            HevcLoopFilterMode => self.hevc.loop_filter_mode = menu(id, value)?,
            HevcLfBetaOffsetDiv2 => self.hevc.lf_beta_offset_div2 = value,
            HevcLfTcOffsetDiv2 => self.hevc.lf_tc_offset_div2 = value,
            HevcRefreshType => self.hevc.refresh_type = menu(id, value)?,
            HevcRefreshPeriod => self.hevc.refresh_period = v,
            HevcConstIntraPred => self.hevc.const_intra_pred = on,
            HevcStrongSmoothing => self.hevc.strong_smoothing = on,
            HevcTmvPrediction => self.hevc.tmv_prediction = on,
            H264Profile => self.h264.profile = menu(id, value)?,
            H264Level => self.h264.level = menu(id, value)?,
            H264MinQp => self.h264.min_qp = v,
            H264MaxQp => self.h264.max_qp = v,
            H264IFrameQp => self.h264.i_frame_qp = v,
            H264PFrameQp => self.h264.p_frame_qp = v,
            H264BFrameQp => self.h264.b_frame_qp = v,
            H264LoopFilterMode => self.h264.loop_filter_mode = menu(id, value)?,
            H264LoopFilterBeta => self.h264.loop_filter_beta = value,
            H264LoopFilterAlpha => self.h264.loop_filter_alpha = value,
            H264Transform8x8 => self.h264.transform_8x8 = on,
            H264ConstrainedIntraPrediction => self.h264.constrained_intra_prediction = on,
            H264ChromaQpIndexOffset => self.h264.chroma_qp_index_offset = value,
            H264EntropyMode => self.h264.entropy_mode = menu(id, value)?,
            H264IPeriod => self.h264.i_period = v,
            H264VuiSarEnable => self.h264.vui_sar_enable = on,
            H264VuiSarIdc => self.h264.vui_sar_idc = v,
            H264VuiExtSarWidth => self.h264.vui_ext_sar_width = v,
            H264VuiExtSarHeight => self.h264.vui_ext_sar_height = v,
            H264CpbSize => self.h264.cpb_size = v,
            AverageQp => return Err(ControlError::ReadOnly(id)),
            RoiMapDeltaQp => return Err(ControlError::ArrayControl(id)),
        }

        log::debug!("control {:?} set to {}", id, value);
        Ok(())
    }

    /// Current value of the control `id`.
    pub fn get(&self, id: ControlId) -> i32 {
        use ControlId::*;

        let v = match id {
            HFlip => (self.mirror_direction & MIRROR_HORIZONTAL != 0) as u32,
            VFlip => (self.mirror_direction & MIRROR_VERTICAL != 0) as u32,
            Rotate => self.rot_angle,
            MinBuffersForOutput => self.min_buffers_for_output,
            GopSize => self.gop_size,
            SliceMode => self.slice_mode as u32,
            SliceMaxMb => self.slice_max_mb,
            BitrateMode => self.bitrate_mode as u32,
            Bitrate => self.bitrate,
            FrameRcEnable => self.frame_rc_enable as u32,
            MbRcEnable => self.mb_rc_enable as u32,
            ForceKeyFrame => 0,
            PrependSpsPpsToIdr => self.prepend_spspps_to_idr as u32,
            IntraRefreshPeriod => self.intra_refresh_period,
            FrameSkipMode => self.frame_skip_mode as u32,
            AverageQp => self.average_qp,
            RoiMode => self.roi_mode as u32,
            HevcProfile => self.hevc.profile as u32,
            HevcLevel => self.hevc.level as u32,
            HevcMinQp => self.hevc.min_qp,
            HevcMaxQp => self.hevc.max_qp,
            HevcIFrameQp => self.hevc.i_frame_qp,
            HevcPFrameQp => self.hevc.p_frame_qp,
            HevcBFrameQp => self.hevc.b_frame_qp,
            HevcLoopFilterMode => self.hevc.loop_filter_mode as u32,
            HevcLfBetaOffsetDiv2 => return self.hevc.lf_beta_offset_div2,
            HevcLfTcOffsetDiv2 => return self.hevc.lf_tc_offset_div2,
            HevcRefreshType => self.hevc.refresh_type as u32,
            HevcRefreshPeriod => self.hevc.refresh_period,
            HevcConstIntraPred => self.hevc.const_intra_pred as u32,
            HevcStrongSmoothing => self.hevc.strong_smoothing as u32,
            HevcTmvPrediction => self.hevc.tmv_prediction as u32,
            H264Profile => self.h264.profile as u32,
            H264Level => self.h264.level as u32,
            H264MinQp => self.h264.min_qp,
            H264MaxQp => self.h264.max_qp,
            H264IFrameQp => self.h264.i_frame_qp,
            H264PFrameQp => self.h264.p_frame_qp,
            H264BFrameQp => self.h264.b_frame_qp,
            H264LoopFilterMode => self.h264.loop_filter_mode as u32,
            H264LoopFilterBeta => return self.h264.loop_filter_beta,
            H264LoopFilterAlpha => return self.h264.loop_filter_alpha,
            H264Transform8x8 => self.h264.transform_8x8 as u32,
            H264ConstrainedIntraPrediction => self.h264.constrained_intra_prediction as u32,
            H264ChromaQpIndexOffset => return self.h264.chroma_qp_index_offset,
            H264EntropyMode => self.h264.entropy_mode as u32,
            H264IPeriod => self.h264.i_period,
            H264VuiSarEnable => self.h264.vui_sar_enable as u32,
            H264VuiSarIdc => self.h264.vui_sar_idc,
            H264VuiExtSarWidth => self.h264.vui_ext_sar_width,
            H264VuiExtSarHeight => self.h264.vui_ext_sar_height,
            H264CpbSize => self.h264.cpb_size,
            RoiMapDeltaQp => 0,
        };

        v as i32
    }
}

/// Checks a user delta-QP map before it is remapped.
pub fn validate_roi_map(map: &[i32]) -> ControlResult<()> {
    if map.len() > MAX_CUSTOM_MAP_UNITS {
        return Err(ControlError::RoiMapTooLarge(map.len()));
    }

    let range = ControlId::RoiMapDeltaQp.range();
    match map.iter().find(|&&v| v < range.min || v > range.max) {
        Some(&value) => Err(ControlError::OutOfRange {
            id: ControlId::RoiMapDeltaQp,
            value,
            min: range.min,
            max: range.max,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_ranges() {
        let ctrls = EncControls::default();
        let ids = [
            ControlId::GopSize,
            ControlId::Bitrate,
            ControlId::BitrateMode,
            ControlId::FrameRcEnable,
            ControlId::SliceMaxMb,
            ControlId::H264Profile,
            ControlId::H264Level,
            ControlId::H264EntropyMode,
            ControlId::H264MinQp,
            ControlId::H264Transform8x8,
            ControlId::HevcLevel,
            ControlId::HevcRefreshType,
            ControlId::HevcLoopFilterMode,
            ControlId::HevcStrongSmoothing,
            ControlId::HevcTmvPrediction,
            ControlId::HevcIFrameQp,
            ControlId::MinBuffersForOutput,
        ];

        for id in ids {
            let value = ctrls.get(id);
            let range = id.range();
            assert!(value >= range.min && value <= range.max, "{:?}", id);
        }

        assert_eq!(ControlId::H264Profile.default_value(), H264Profile::High as i32);
        assert_eq!(ControlId::H264Level.default_value(), H264Level::L5_0 as i32);
        assert_eq!(ControlId::HevcLevel.default_value(), HevcLevel::L5 as i32);
        assert_eq!(ControlId::HevcRefreshType.default_value(), HevcRefreshType::Idr as i32);
        assert_eq!(ControlId::Bitrate.default_value(), 2_097_152);
        assert_eq!(ControlId::GopSize.default_value(), 30);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let mut ctrls = EncControls::default();

        assert_eq!(
            ctrls.set(ControlId::H264MaxQp, 52),
            Err(ControlError::OutOfRange { id: ControlId::H264MaxQp, value: 52, min: 0, max: 51 })
        );
        assert!(ctrls.set(ControlId::Bitrate, 0).is_err());
        assert!(ctrls.set(ControlId::HevcLfTcOffsetDiv2, -7).is_err());
        assert_eq!(ctrls, EncControls::default());
    }

    #[test]
    fn rotation_step() {
        let mut ctrls = EncControls::default();

        ctrls.set(ControlId::Rotate, 180).unwrap();
        assert_eq!(ctrls.rot_angle, 180);
        assert_eq!(
            ctrls.set(ControlId::Rotate, 45),
            Err(ControlError::InvalidStep { id: ControlId::Rotate, value: 45, step: 90 })
        );
    }

    #[test]
    fn unsupported_menu_entries() {
        let mut ctrls = EncControls::default();

        // CRA refresh.
        assert!(matches!(
            ctrls.set(ControlId::HevcRefreshType, 1),
            Err(ControlError::InvalidMenuEntry { .. })
        ));
        // Level-limit frame skipping.
        assert!(ctrls.set(ControlId::FrameSkipMode, 1).is_err());
        ctrls.set(ControlId::FrameSkipMode, 2).unwrap();
        assert_eq!(ctrls.frame_skip_mode, FrameSkipMode::BufLimit);
    }

    #[test]
    fn mirror_bits() {
        let mut ctrls = EncControls::default();

        ctrls.set(ControlId::HFlip, 1).unwrap();
        assert_eq!(ctrls.mirror_direction, 2);
        ctrls.set(ControlId::VFlip, 1).unwrap();
        assert_eq!(ctrls.mirror_direction, 3);
        ctrls.set(ControlId::HFlip, 0).unwrap();
        assert_eq!(ctrls.mirror_direction, 1);
    }

    #[test]
    fn read_only_average_qp() {
        let mut ctrls = EncControls::default();
        assert_eq!(
            ctrls.set(ControlId::AverageQp, 3),
            Err(ControlError::ReadOnly(ControlId::AverageQp))
        );
        assert_eq!(
            ctrls.set(ControlId::RoiMapDeltaQp, 3),
            Err(ControlError::ArrayControl(ControlId::RoiMapDeltaQp))
        );
    }

    #[test]
    fn roi_map_validation() {
        assert!(validate_roi_map(&[0, -51, 51]).is_ok());
        assert!(validate_roi_map(&[52]).is_err());
        assert_eq!(
            validate_roi_map(&vec![0; MAX_CUSTOM_MAP_UNITS + 1]),
            Err(ControlError::RoiMapTooLarge(MAX_CUSTOM_MAP_UNITS + 1))
        );
    }
}
