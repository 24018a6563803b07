// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Translation of the negotiated formats and controls into the firmware open parameters.

use crate::align_up;
use crate::color::colour_primaries;
use crate::color::matrix_coefficients;
use crate::color::transfer_characteristics;
use crate::color::video_full_range_flag;
use crate::color::Colorimetry;
use crate::controls::BitrateMode;
use crate::controls::EncControls;
use crate::controls::FrameSkipMode;
use crate::controls::H264EntropyMode;
use crate::controls::H264Level;
use crate::controls::H264LoopFilterMode;
use crate::controls::H264Profile;
use crate::controls::HevcLevel;
use crate::controls::HevcLoopFilterMode;
use crate::controls::HevcProfile;
use crate::controls::HevcRefreshType;
use crate::controls::VUI_SAR_IDC_EXTENDED;
use crate::format::FormatDescriptor;
use crate::geometry::cpb_size_msec;
use crate::geometry::EncodeRegion;
use crate::hw::params::*;

/// Everything of a session that goes into [`EncOpenParam`].
pub(super) struct OpenConfig<'a> {
    pub std: CodecStd,
    pub src_desc: &'a FormatDescriptor,
    pub src_height: u32,
    pub dst_sizeimage: u32,
    pub region: &'a EncodeRegion,
    pub colorimetry: &'a Colorimetry,
    pub frame_rate: u32,
    pub controls: &'a EncControls,
    pub ar_base: u64,
}

fn h264_level(level: H264Level) -> u32 {
    match level {
        H264Level::L1_0 => 10,
        H264Level::L1b => 9,
        H264Level::L1_1 => 11,
        H264Level::L1_2 => 12,
        H264Level::L1_3 => 13,
        H264Level::L2_0 => 20,
        H264Level::L2_1 => 21,
        H264Level::L2_2 => 22,
        H264Level::L3_0 => 30,
        H264Level::L3_1 => 31,
        H264Level::L3_2 => 32,
        H264Level::L4_0 => 40,
        H264Level::L4_1 => 41,
        H264Level::L4_2 => 42,
        H264Level::L5_0 => 50,
        H264Level::L5_1 => 51,
        H264Level::L5_2 => 52,
    }
}

fn hevc_level(level: HevcLevel) -> u32 {
    match level {
        HevcLevel::L1 => 30,
        HevcLevel::L2 => 60,
        HevcLevel::L2_1 => 63,
        HevcLevel::L3 => 90,
        HevcLevel::L3_1 => 93,
        HevcLevel::L4 => 120,
        HevcLevel::L4_1 => 123,
        HevcLevel::L5 => 150,
        HevcLevel::L5_1 => 153,
    }
}

/// Number of rows refreshed per picture so that a full intra refresh spans `period` pictures.
pub(super) fn intra_refresh_arg(std: CodecStd, src_height: u32, period: u32) -> u32 {
    let ctu_size = match std {
        CodecStd::AvcEnc => 16,
        CodecStd::HevcEnc => 64,
    };
    let num_ctu_row = align_up(src_height, ctu_size) / ctu_size;

    if period < num_ctu_row {
        num_ctu_row.div_ceil(period)
    } else {
        1
    }
}

fn h264_param(ctrls: &EncControls, param: &mut EncCodecParam) {
    let h264 = &ctrls.h264;

    param.profile = match h264.profile {
        H264Profile::Baseline | H264Profile::ConstrainedBaseline => H264_PROFILE_BP,
        H264Profile::Main => H264_PROFILE_MP,
        H264Profile::Extended => H264_PROFILE_EXTENDED,
        H264Profile::High => H264_PROFILE_HP,
    };
    param.internal_bit_depth = 8;
    param.level = h264_level(h264.level);

    param.qp = h264.i_frame_qp;
    param.min_qp_i = h264.min_qp;
    param.max_qp_i = h264.max_qp;
    param.min_qp_p = h264.min_qp;
    param.max_qp_p = h264.max_qp;
    param.min_qp_b = h264.min_qp;
    param.max_qp_b = h264.max_qp;

    let (dbk, cross_slice) = match h264.loop_filter_mode {
        H264LoopFilterMode::Disabled => (false, false),
        H264LoopFilterMode::Enabled => (true, true),
        H264LoopFilterMode::DisabledAtSliceBoundary => (true, false),
    };
    param.en_dbk = dbk;
    param.en_lf_cross_slice_boundary = cross_slice;

    param.intra_period = h264.i_period;
    param.beta_offset_div2 = h264.loop_filter_beta;
    param.tc_offset_div2 = h264.loop_filter_alpha;
    param.en_transform8x8 = h264.transform_8x8 && h264.profile >= H264Profile::High;
    param.en_constrained_intra_pred = h264.constrained_intra_prediction;
    param.cb_qp_offset = h264.chroma_qp_index_offset;
    param.cr_qp_offset = h264.chroma_qp_index_offset;
    param.en_cabac =
        h264.entropy_mode == H264EntropyMode::Cabac && h264.profile >= H264Profile::Main;
    param.en_auto_level_adjusting = DEFAULT_EN_AUTO_LEVEL_ADJUSTING;
}

fn hevc_param(ctrls: &EncControls, param: &mut EncCodecParam) {
    let hevc = &ctrls.hevc;

    param.profile = match hevc.profile {
        HevcProfile::Main => HEVC_PROFILE_MAIN,
        HevcProfile::MainStillPicture => {
            param.en_still_picture = true;
            HEVC_PROFILE_STILLPICTURE
        }
    };
    param.internal_bit_depth = 8;
    param.level = hevc_level(hevc.level);

    param.qp = hevc.i_frame_qp;
    param.min_qp_i = hevc.min_qp;
    param.max_qp_i = hevc.max_qp;
    param.min_qp_p = hevc.min_qp;
    param.max_qp_p = hevc.max_qp;
    param.min_qp_b = hevc.min_qp;
    param.max_qp_b = hevc.max_qp;

    let (dbk, sao, cross_slice) = match hevc.loop_filter_mode {
        HevcLoopFilterMode::Disabled => (false, false, false),
        HevcLoopFilterMode::Enabled => (true, true, true),
        HevcLoopFilterMode::DisabledAtSliceBoundary => (true, true, false),
    };
    param.en_dbk = dbk;
    param.en_sao = sao;
    param.en_lf_cross_slice_boundary = cross_slice;

    param.decoding_refresh_type = match hevc.refresh_type {
        HevcRefreshType::None => DEC_REFRESH_TYPE_NON_IRAP,
        HevcRefreshType::Idr => DEC_REFRESH_TYPE_IDR,
    };
    param.intra_period = hevc.refresh_period;
    if param.idr_period != 0 {
        param.decoding_refresh_type = DEC_REFRESH_TYPE_IDR;
        param.intra_period = param.idr_period;
        param.idr_period = 0;
    }
    if param.en_still_picture {
        param.gop_preset_idx = PRESET_IDX_ALL_I;
        param.decoding_refresh_type = DEC_REFRESH_TYPE_IDR;
        param.intra_period = 0;
        param.idr_period = 0;
    }

    param.beta_offset_div2 = hevc.lf_beta_offset_div2;
    param.tc_offset_div2 = hevc.lf_tc_offset_div2;
    param.en_constrained_intra_pred = hevc.const_intra_pred;
    param.en_strong_intra_smoothing = hevc.strong_smoothing;
    param.en_temporal_mvp = hevc.tmv_prediction;
    param.num_ticks_poc_diff_one = DEFAULT_NUM_TICKS_POC_DIFF;
    param.en_auto_level_adjusting = DEFAULT_EN_AUTO_LEVEL_ADJUSTING;
    param.en_intra_trans_skip = DEFAULT_EN_INTRA_TRANS_SKIP;
    param.en_me_center = DEFAULT_EN_ME_CENTER;
    param.intra_4x4 = DEFAULT_INTRA_4X4;
}

/// Builds the open parameters of an instance encoding `cfg.region` of the source.
pub(super) fn enc_open_param(cfg: &OpenConfig) -> EncOpenParam {
    let ctrls = cfg.controls;
    let codec_rect = &cfg.region.codec_rect;

    let mut param = EncCodecParam {
        custom_map_endian: USER_DATA_ENDIAN,
        gop_preset_idx: PRESET_IDX_IPP_SINGLE,
        temp_layer_cnt: DEFAULT_TEMP_LAYER_CNT,
        rc_initial_level: DEFAULT_RC_INITIAL_LEVEL,
        rc_initial_qp: DEFAULT_RC_INITIAL_QP,
        pic_rc_max_dqp: DEFAULT_PIC_RC_MAX_DQP,
        en_adaptive_round: DEFAULT_EN_ADAPTIVE_ROUND,
        q_round_inter: DEFAULT_Q_ROUND_INTER,
        q_round_intra: DEFAULT_Q_ROUND_INTRA,

        frame_rate: cfg.frame_rate,
        idr_period: ctrls.gop_size,
        rc_mode: ctrls.bitrate_mode as u32,
        rc_update_speed: match ctrls.bitrate_mode {
            BitrateMode::Cbr => DEFAULT_RC_UPDATE_SPEED_CBR,
            BitrateMode::Vbr => DEFAULT_RC_UPDATE_SPEED_VBR,
        },
        en_rate_control: ctrls.frame_rc_enable,
        en_cu_level_rate_control: ctrls.mb_rc_enable,
        max_intra_pic_bit: cfg.dst_sizeimage * 8,
        max_inter_pic_bit: cfg.dst_sizeimage * 8,
        bitrate: ctrls.bitrate,
        cpb_size: cpb_size_msec(ctrls.h264.cpb_size, ctrls.bitrate),
        slice_mode: ctrls.slice_mode as u32,
        slice_arg: ctrls.slice_max_mb,
        forced_idr_header: ctrls.prepend_spspps_to_idr,
        en_vbv_overflow_drop_frame: ctrls.frame_skip_mode != FrameSkipMode::Disabled,
        conf_win: conf_window(&cfg.region.crop, codec_rect),
        en_qp_map: true,
        ..Default::default()
    };

    if ctrls.intra_refresh_period != 0 {
        param.intra_refresh_mode = INTRA_REFRESH_ROW;
        param.intra_refresh_arg =
            intra_refresh_arg(cfg.std, cfg.src_height, ctrls.intra_refresh_period);
    }

    let h264 = &ctrls.h264;
    if h264.vui_sar_enable {
        param.sar = SarInfo {
            enable: true,
            idc: match h264.vui_sar_idc {
                VUI_SAR_IDC_EXTENDED => H264_VUI_SAR_IDC_EXTENDED,
                idc => idc,
            },
            width: h264.vui_ext_sar_width,
            height: h264.vui_ext_sar_height,
        };
    }

    let colorimetry = cfg.colorimetry;
    param.color = ColorParam {
        video_signal_type_present: DEFAULT_VUI_VIDEO_SIGNAL_TYPE_PRESENT,
        color_range: video_full_range_flag(colorimetry.quantization),
        color_description_present: DEFAULT_VUI_COLOR_DESCRIPTION_PRESENT,
        color_primaries: colour_primaries(colorimetry.colorspace),
        transfer_characteristics: transfer_characteristics(
            colorimetry.colorspace,
            colorimetry.xfer_func,
        ),
        matrix_coefficients: matrix_coefficients(colorimetry.colorspace, colorimetry.ycbcr_enc),
    };

    match cfg.std {
        CodecStd::AvcEnc => h264_param(ctrls, &mut param),
        CodecStd::HevcEnc => hevc_param(ctrls, &mut param),
    }

    EncOpenParam {
        std: cfg.std,
        pic_width: codec_rect.width,
        pic_height: codec_rect.height,
        codec_param: param,
        stream_endian: STREAM_ENDIAN,
        source_endian: cfg.src_desc.source_endian,
        line_buf_int_en: true,
        packed_format: cfg.src_desc.packed_format,
        src_format: cfg.src_desc.src_format,
        ar_base: cfg.ar_base,
    }
}
