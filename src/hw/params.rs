// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parameter blocks exchanged with the Wave6 firmware.
//!
//! These are plain tagged structures; packing them into the firmware's register layout is the
//! job of the [`VpuTransport`](super::VpuTransport) implementation.

use enumn::N;

use crate::Rect;

/// Size of the per-type frame and auxiliary buffer index space.
pub const WAVE6_MAX_FBS: usize = 31;
/// Stride and height alignment of the compressed reconstruction buffers.
pub const FBC_BUF_ALIGNMENT: u32 = 32;
/// Size of the per-instance AR scratch buffer.
pub const AR_BUFFER_SIZE: usize = 4096;
/// Reconstructed frame index reported once the encoder has flushed its last frame.
pub const RECON_IDX_FLAG_ENC_END: i32 = -1;

pub const COMPRESSED_FRAME_MAP: u32 = 17;

pub const H264_PROFILE_BP: u32 = 1;
pub const H264_PROFILE_MP: u32 = 2;
pub const H264_PROFILE_EXTENDED: u32 = 3;
pub const H264_PROFILE_HP: u32 = 4;
pub const HEVC_PROFILE_MAIN: u32 = 1;
pub const HEVC_PROFILE_STILLPICTURE: u32 = 3;

pub const H264_VUI_SAR_IDC_EXTENDED: u32 = 255;

pub const DEC_REFRESH_TYPE_NON_IRAP: u32 = 0;
pub const DEC_REFRESH_TYPE_IDR: u32 = 2;

pub const INTRA_REFRESH_ROW: u32 = 1;

pub const PRESET_IDX_ALL_I: u32 = 1;
pub const PRESET_IDX_IPP_SINGLE: u32 = 9;

pub const DEFAULT_TEMP_LAYER_CNT: u32 = 1;
pub const DEFAULT_RC_INITIAL_LEVEL: u32 = 8;
pub const DEFAULT_RC_INITIAL_QP: i32 = -1;
pub const DEFAULT_PIC_RC_MAX_DQP: u32 = 3;
pub const DEFAULT_EN_ADAPTIVE_ROUND: bool = true;
pub const DEFAULT_Q_ROUND_INTER: u32 = 85;
pub const DEFAULT_Q_ROUND_INTRA: u32 = 171;
pub const DEFAULT_EN_INTRA_TRANS_SKIP: bool = true;
pub const DEFAULT_EN_ME_CENTER: bool = true;
pub const DEFAULT_INTRA_4X4: u32 = 3;
pub const DEFAULT_EN_AUTO_LEVEL_ADJUSTING: bool = true;
pub const DEFAULT_NUM_TICKS_POC_DIFF: u32 = 100;
pub const DEFAULT_RC_UPDATE_SPEED_CBR: u32 = 64;
pub const DEFAULT_RC_UPDATE_SPEED_VBR: u32 = 16;
pub const DEFAULT_VUI_VIDEO_SIGNAL_TYPE_PRESENT: bool = true;
pub const DEFAULT_VUI_COLOR_DESCRIPTION_PRESENT: bool = true;

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
pub enum CodecStd {
    #[default]
    HevcEnc = 0x01,
    AvcEnc = 0x03,
}

/// Source frame layouts understood by the pre-processor.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
pub enum SourceFormat {
    #[default]
    Yuv420 = 0,
    Yuv422 = 1,
    Yuv420P10_16BitMsb = 5,
    Yuyv = 21,
    Rgb32BitPacked = 90,
    RgbP10_32BitPacked = 92,
    Rgb24BitPacked = 95,
    Yuv444_24BitPacked = 96,
    Yuv444_24Bit = 97,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
pub enum EndianMode {
    #[default]
    Vdi128BitLittleEndian = 16,
    Vdi128BitLeByteSwap = 17,
    Vdi128BitLeWordByteSwap = 19,
}

/// Byte order used for the bitstream and for user data such as the custom QP map.
pub const STREAM_ENDIAN: EndianMode = EndianMode::Vdi128BitLittleEndian;
pub const USER_DATA_ENDIAN: EndianMode = EndianMode::Vdi128BitLittleEndian;

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
pub enum PackedFormat {
    #[default]
    NotPacked = 0,
    Yuyv = 1,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, N)]
pub enum AuxBufferType {
    FbcYTbl = 0,
    FbcCTbl = 1,
    MvCol = 2,
    SubSample = 3,
}

impl AuxBufferType {
    pub const ALL: [AuxBufferType; 4] = [
        AuxBufferType::FbcYTbl,
        AuxBufferType::FbcCTbl,
        AuxBufferType::MvCol,
        AuxBufferType::SubSample,
    ];
}

/// Picture type of an encoded frame, as reported in [`OutputInfo`].
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
pub enum PicType {
    I = 0,
    P = 1,
    B = 2,
    Idr = 5,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
pub enum ForcePicType {
    I = 0,
    P = 1,
    B = 2,
    Idr = 3,
    #[default]
    Disabled = 4,
}

/// Instance commands issued before sequence initialization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncCommand {
    EnableRotation,
    EnableMirroring,
    SetMirrorDirection(u32),
    SetRotationAngle(u32),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SarInfo {
    pub enable: bool,
    pub idc: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ColorParam {
    pub video_signal_type_present: bool,
    pub color_range: u32,
    pub color_description_present: bool,
    pub color_primaries: u32,
    pub transfer_characteristics: u32,
    pub matrix_coefficients: u32,
}

/// Conformance window offsets, in pixels from each edge of the coded picture.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConfWindow {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

/// Codec level parameters of an encoder instance.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncCodecParam {
    pub internal_bit_depth: u32,
    pub decoding_refresh_type: u32,
    pub idr_period: u32,
    pub intra_period: u32,
    pub gop_preset_idx: u32,
    pub frame_rate: u32,
    pub bitrate: u32,
    pub cpb_size: u32,
    pub rc_initial_qp: i32,
    pub rc_update_speed: u32,
    pub rc_mode: u32,
    pub rc_initial_level: u32,
    pub pic_rc_max_dqp: u32,
    pub intra_refresh_mode: u32,
    pub intra_refresh_arg: u32,
    pub beta_offset_div2: i32,
    pub tc_offset_div2: i32,
    pub qp: u32,
    pub min_qp_i: u32,
    pub max_qp_i: u32,
    pub min_qp_p: u32,
    pub max_qp_p: u32,
    pub min_qp_b: u32,
    pub max_qp_b: u32,
    pub cb_qp_offset: i32,
    pub cr_qp_offset: i32,
    pub q_round_intra: u32,
    pub q_round_inter: u32,
    pub slice_mode: u32,
    pub slice_arg: u32,
    pub level: u32,
    pub profile: u32,
    pub conf_win: ConfWindow,
    pub forced_idr_header: bool,
    pub temp_layer_cnt: u32,
    pub custom_map_endian: EndianMode,
    pub num_ticks_poc_diff_one: u32,
    pub color: ColorParam,
    pub sar: SarInfo,
    pub max_intra_pic_bit: u32,
    pub max_inter_pic_bit: u32,
    pub intra_4x4: u32,

    pub en_constrained_intra_pred: bool,
    pub en_intra_trans_skip: bool,
    pub en_me_center: bool,
    pub en_rate_control: bool,
    pub en_transform8x8: bool,
    pub en_temporal_mvp: bool,
    pub en_cabac: bool,
    pub en_dbk: bool,
    pub en_sao: bool,
    pub en_lf_cross_slice_boundary: bool,
    pub en_adaptive_round: bool,
    pub en_qp_map: bool,
    pub en_still_picture: bool,
    pub en_strong_intra_smoothing: bool,
    pub en_cu_level_rate_control: bool,
    pub en_vbv_overflow_drop_frame: bool,
    pub en_auto_level_adjusting: bool,
}

/// Everything the firmware needs to open an encoder instance.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncOpenParam {
    pub std: CodecStd,
    pub pic_width: u32,
    pub pic_height: u32,
    pub codec_param: EncCodecParam,
    pub stream_endian: EndianMode,
    pub source_endian: EndianMode,
    pub line_buf_int_en: bool,
    pub packed_format: PackedFormat,
    pub src_format: SourceFormat,
    pub ar_base: u64,
}

/// Minimum resource requirements reported once the sequence is initialized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InitialInfo {
    pub min_frame_buffer_count: u32,
    pub min_src_frame_count: u32,
    pub req_mv_buffer_count: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuxBufferSizeInfo {
    pub width: u32,
    pub height: u32,
    pub ty: Option<AuxBufferType>,
    pub mirror_direction: u32,
    pub rotation_angle: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuxBufferEntry {
    pub index: usize,
    pub addr: u64,
    pub size: usize,
}

/// Addresses of one frame, either a source picture or a reconstruction buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameBuffer {
    pub buf_y: u64,
    pub buf_cb: u64,
    pub buf_cr: u64,
    pub stride: u32,
    pub height: u32,
    pub map_type: u32,
}

/// Colour conversion applied to RGB sources. Coefficients are signed Q8 values in two's
/// complement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CscParams {
    pub format_order: u32,
    pub coef_ry: u32,
    pub coef_gy: u32,
    pub coef_by: u32,
    pub coef_rcb: u32,
    pub coef_gcb: u32,
    pub coef_bcb: u32,
    pub coef_rcr: u32,
    pub coef_gcr: u32,
    pub coef_bcr: u32,
    pub offset_y: u32,
    pub offset_cb: u32,
    pub offset_cr: u32,
}

/// Per-picture job descriptor handed to [`VpuTransport::submit_frame`].
///
/// [`VpuTransport::submit_frame`]: super::VpuTransport::submit_frame
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncParam {
    pub source_frame: FrameBuffer,
    pub pic_stream_buffer_addr: u64,
    pub pic_stream_buffer_size: usize,
    pub force_pic_qp_enable: bool,
    pub force_pic_qp_i: u32,
    pub force_pic_qp_p: u32,
    pub force_pic_qp_b: u32,
    pub force_pic_type_enable: bool,
    pub force_pic_type: ForcePicType,
    pub src_idx: usize,
    pub src_end: bool,
    pub csc: CscParams,
    pub custom_roi_map_enable: bool,
    pub custom_map_addr: u64,
}

/// Result of one finished job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutputInfo {
    pub bitstream_buffer: u64,
    pub bitstream_size: usize,
    pub pic_type: i32,
    pub recon_frame_index: i32,
    pub enc_src_idx: i32,
    pub avg_ctu_qp: u32,
    pub encoding_success: bool,
    pub frame_cycle: u64,
}

/// Conformance window that crops `codec_rect` back to `crop`. `codec_rect` must contain `crop`.
pub fn conf_window(crop: &Rect, codec_rect: &Rect) -> ConfWindow {
    let left = crop.left - codec_rect.left;
    let top = crop.top - codec_rect.top;

    ConfWindow {
        left,
        top,
        right: codec_rect.width - crop.width - left,
        bottom: codec_rect.height - crop.height - top,
    }
}
