// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Colorimetry: V4L2 colour description enums, RGB to YCbCr conversion coefficients and the
//! H.273 code points written into the VUI.

use enumn::N;

use crate::hw::params::CscParams;

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
pub enum Colorspace {
    #[default]
    Default = 0,
    Smpte170m = 1,
    Smpte240m = 2,
    Rec709 = 3,
    Bt878 = 4,
    System470M = 5,
    System470Bg = 6,
    Jpeg = 7,
    Srgb = 8,
    Oprgb = 9,
    Bt2020 = 10,
    Raw = 11,
    DciP3 = 12,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
pub enum TransferFunction {
    #[default]
    Default = 0,
    Rec709 = 1,
    Srgb = 2,
    Oprgb = 3,
    Smpte240m = 4,
    None = 5,
    DciP3 = 6,
    Smpte2084 = 7,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
pub enum YcbcrEncoding {
    #[default]
    Default = 0,
    Bt601 = 1,
    Rec709 = 2,
    Xv601 = 3,
    Xv709 = 4,
    Sycc = 5,
    Bt2020 = 6,
    Bt2020ConstLum = 7,
    Smpte240m = 8,
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, N)]
pub enum Quantization {
    #[default]
    Default = 0,
    FullRange = 1,
    LimRange = 2,
}

/// The four colour fields carried by a pixel format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Colorimetry {
    pub colorspace: Colorspace,
    pub ycbcr_enc: YcbcrEncoding,
    pub quantization: Quantization,
    pub xfer_func: TransferFunction,
}

impl Colorimetry {
    /// Folds encodings the hardware cannot express onto ones it can.
    pub fn normalized(mut self) -> Self {
        if self.ycbcr_enc == YcbcrEncoding::Bt2020ConstLum {
            self.ycbcr_enc = YcbcrEncoding::Bt2020;
        }
        if matches!(self.ycbcr_enc, YcbcrEncoding::Xv601 | YcbcrEncoding::Xv709)
            && self.quantization == Quantization::FullRange
        {
            self.quantization = Quantization::LimRange;
        }
        self
    }
}

impl Colorspace {
    pub fn default_xfer_func(self) -> TransferFunction {
        match self {
            Colorspace::Oprgb => TransferFunction::Oprgb,
            Colorspace::Smpte240m => TransferFunction::Smpte240m,
            Colorspace::DciP3 => TransferFunction::DciP3,
            Colorspace::Raw => TransferFunction::None,
            Colorspace::Srgb | Colorspace::Jpeg => TransferFunction::Srgb,
            _ => TransferFunction::Rec709,
        }
    }

    pub fn default_ycbcr_enc(self) -> YcbcrEncoding {
        match self {
            Colorspace::Rec709 | Colorspace::DciP3 => YcbcrEncoding::Rec709,
            Colorspace::Bt2020 => YcbcrEncoding::Bt2020,
            Colorspace::Smpte240m => YcbcrEncoding::Smpte240m,
            _ => YcbcrEncoding::Bt601,
        }
    }
}

/// Coefficients and offsets of one conversion matrix, before the bit depth is applied.
struct CscEntry {
    coef: [i32; 9],
    full_range: bool,
    chroma_offset: bool,
}

impl CscEntry {
    const fn new(coef: [i32; 9], full_range: bool) -> Self {
        Self { coef, full_range, chroma_offset: true }
    }

    const fn without_chroma_offset(self) -> Self {
        Self { chroma_offset: false, ..self }
    }

    fn apply(&self, is_10bit: bool, csc: &mut CscParams) {
        let c = self.coef.map(|c| c as u32);
        csc.coef_ry = c[0];
        csc.coef_gy = c[1];
        csc.coef_by = c[2];
        csc.coef_rcb = c[3];
        csc.coef_gcb = c[4];
        csc.coef_bcb = c[5];
        csc.coef_rcr = c[6];
        csc.coef_gcr = c[7];
        csc.coef_bcr = c[8];
        csc.offset_y = match (self.full_range, is_10bit) {
            (true, _) => 0x0,
            (false, true) => 0x40,
            (false, false) => 0x10,
        };
        let chroma = match (self.chroma_offset, is_10bit) {
            (false, _) => 0x0,
            (true, true) => 0x200,
            (true, false) => 0x80,
        };
        csc.offset_cb = chroma;
        csc.offset_cr = chroma;
    }
}

// Y   0.299(R)    0.587(G)    0.114(B)
// Cb -0.16874(R) -0.33126(G)  0.5(B)
// Cr  0.5(R)     -0.41869(G) -0.08131(B)
const CSC_601_FULL: CscEntry =
    CscEntry::new([0x099, 0x12d, 0x03a, -0x56, -0xaa, 0x100, 0x100, -0xd6, -0x2a], true);
// Y   0.258(R)   0.504(G)   0.098(B)
// Cb -0.1484(R) -0.2891(G)  0.4375(B)
// Cr  0.4375(R) -0.3672(G) -0.0703(B)
const CSC_601_LIMITED: CscEntry =
    CscEntry::new([0x084, 0x102, 0x032, -0x4c, -0x94, 0x0e0, 0x0e0, -0xbc, -0x24], false);
// Y   0.2126(R)   0.7152(G)   0.0722(B)
// Cb -0.11457(R) -0.38543(G)  0.5(B)
// Cr  0.5(R)     -0.45415(G) -0.04585(B)
const CSC_709_FULL: CscEntry =
    CscEntry::new([0x06d, 0x16e, 0x025, -0x3b, -0xc5, 0x100, 0x100, -0xe9, -0x17], true);
const CSC_709_LIMITED: CscEntry =
    CscEntry::new([0x05e, 0x13b, 0x020, -0x34, -0xad, 0x0e1, 0x0e1, -0xcc, -0x15], false);
// Y   0.2627(R)   0.678(G)    0.0593(B)
// Cb -0.13963(R) -0.36037(G)  0.5(B)
// Cr  0.5(R)     -0.45979(G) -0.04021(B)
const CSC_BT2020_FULL: CscEntry =
    CscEntry::new([0x087, 0x15b, 0x01e, -0x47, -0xb9, 0x100, 0x100, -0xeb, -0x15], true);
const CSC_BT2020_LIMITED: CscEntry =
    CscEntry::new([0x074, 0x12a, 0x01a, -0x3f, -0xa2, 0x0e1, 0x0e1, -0xcf, -0x12], false);
// Y   0.2122(R)  0.7013(G)  0.0865(B)
// Cb -0.1161(R) -0.3839(G)  0.5(B)
// Cr  0.5(R)    -0.4451(G) -0.0549(B)
const CSC_SMPTE240M_FULL: CscEntry =
    CscEntry::new([0x06d, 0x167, 0x02c, -0x3b, -0xc5, 0x100, 0x100, -0xe4, -0x1c], true);
const CSC_SMPTE240M_LIMITED: CscEntry =
    CscEntry::new([0x05d, 0x134, 0x026, -0x34, -0xad, 0x0e1, 0x0e1, -0xc8, -0x19], false);
// Y   0.2558(R)  0.5021(G)  0.0975(B)
// Cb -0.1476(R) -0.2899(G)  0.4375(B)
// Cr  0.4375(R) -0.3664(G) -0.0711(B)
const CSC_XV601_LIMITED: CscEntry =
    CscEntry::new([0x083, 0x101, 0x032, -0x4c, -0x94, 0x0e0, 0x0e0, -0xbc, -0x24], false)
        .without_chroma_offset();
// Y   0.1819(R)  0.6118(G)  0.0618(B)
// Cb -0.1003(R) -0.3372(G)  0.4375(B)
// Cr  0.4375(R) -0.3974(G) -0.0401(B)
const CSC_XV709_LIMITED: CscEntry =
    CscEntry::new([0x05d, 0x139, 0x020, -0x33, -0xad, 0x0e0, 0x0e0, -0xcb, -0x15], false)
        .without_chroma_offset();

fn csc_entry(enc: YcbcrEncoding, quantization: Quantization) -> Option<&'static CscEntry> {
    let full = quantization == Quantization::FullRange;

    match enc {
        YcbcrEncoding::Default | YcbcrEncoding::Bt601 if full => Some(&CSC_601_FULL),
        YcbcrEncoding::Default | YcbcrEncoding::Bt601 => Some(&CSC_601_LIMITED),
        YcbcrEncoding::Rec709 if full => Some(&CSC_709_FULL),
        YcbcrEncoding::Rec709 => Some(&CSC_709_LIMITED),
        YcbcrEncoding::Bt2020 if full => Some(&CSC_BT2020_FULL),
        YcbcrEncoding::Bt2020 => Some(&CSC_BT2020_LIMITED),
        YcbcrEncoding::Smpte240m if full => Some(&CSC_SMPTE240M_FULL),
        YcbcrEncoding::Smpte240m => Some(&CSC_SMPTE240M_LIMITED),
        YcbcrEncoding::Xv601 if quantization == Quantization::LimRange => {
            Some(&CSC_XV601_LIMITED)
        }
        YcbcrEncoding::Xv709 if quantization == Quantization::LimRange => {
            Some(&CSC_XV709_LIMITED)
        }
        _ => None,
    }
}

/// Fills the conversion matrix of `csc` for an RGB source.
///
/// Combinations without a matrix, such as XV601 in full range, leave the coefficients of
/// `csc` as they were. `format_order` is always updated.
pub fn derive_csc(
    enc: YcbcrEncoding,
    quantization: Quantization,
    is_10bit: bool,
    format_order: u32,
    csc: &mut CscParams,
) {
    csc.format_order = format_order;

    match csc_entry(enc, quantization) {
        Some(entry) => entry.apply(is_10bit, csc),
        None => log::debug!(
            "no CSC matrix for enc={:?} quantization={:?}, keeping previous coefficients",
            enc,
            quantization
        ),
    }
}

pub fn video_full_range_flag(quantization: Quantization) -> u32 {
    match quantization {
        Quantization::FullRange => 1,
        _ => 0,
    }
}

pub fn colour_primaries(colorspace: Colorspace) -> u32 {
    match colorspace {
        Colorspace::Smpte170m => 6,
        Colorspace::Rec709 | Colorspace::Srgb | Colorspace::Jpeg => 1,
        Colorspace::Bt2020 => 9,
        Colorspace::DciP3 => 11,
        Colorspace::Smpte240m => 7,
        Colorspace::System470M => 4,
        Colorspace::System470Bg => 5,
        _ => 2,
    }
}

pub fn transfer_characteristics(colorspace: Colorspace, xfer_func: TransferFunction) -> u32 {
    let xfer_func = match xfer_func {
        TransferFunction::Default => colorspace.default_xfer_func(),
        f => f,
    };

    match xfer_func {
        TransferFunction::Rec709 => match colorspace {
            Colorspace::Smpte170m => 6,
            Colorspace::Bt2020 => 14,
            _ => 1,
        },
        TransferFunction::Srgb => 13,
        TransferFunction::Smpte240m => 7,
        TransferFunction::None => 8,
        TransferFunction::Smpte2084 => 16,
        _ => 2,
    }
}

pub fn matrix_coefficients(colorspace: Colorspace, ycbcr_enc: YcbcrEncoding) -> u32 {
    let ycbcr_enc = match ycbcr_enc {
        YcbcrEncoding::Default => colorspace.default_ycbcr_enc(),
        e => e,
    };

    match ycbcr_enc {
        YcbcrEncoding::Bt601 | YcbcrEncoding::Xv601 => match colorspace {
            Colorspace::Smpte170m => 6,
            _ => 5,
        },
        YcbcrEncoding::Rec709 | YcbcrEncoding::Xv709 => 1,
        YcbcrEncoding::Bt2020 => 9,
        YcbcrEncoding::Bt2020ConstLum => 10,
        YcbcrEncoding::Smpte240m => 7,
        _ => 2,
    }
}
