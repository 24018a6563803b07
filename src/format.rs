// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Catalog of the formats accepted by the encoder and pixel format negotiation helpers.

use crate::color::Colorimetry;
use crate::hw::params::EndianMode;
use crate::hw::params::PackedFormat;
use crate::hw::params::SourceFormat;
use crate::Fourcc;

pub const MIN_ENC_PIC_WIDTH: u32 = 256;
pub const MIN_ENC_PIC_HEIGHT: u32 = 128;
pub const MAX_ENC_PIC_WIDTH: u32 = 4096;
pub const MAX_ENC_PIC_HEIGHT: u32 = 4096;
pub const DEFAULT_ENC_PIC_WIDTH: u32 = 416;
pub const DEFAULT_ENC_PIC_HEIGHT: u32 = 240;
/// Width and height granularity of an encoded picture.
pub const ENC_PIC_SIZE_STEP: u32 = 8;

pub const MAX_PLANES: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatKind {
    /// Compressed bitstream formats, produced on the capture queue.
    Codec,
    /// Raw frame formats, consumed on the output queue.
    Raw,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorFamily {
    Yuv,
    Rgb,
}

/// Memory layout of the colour components of a raw format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComponentLayout {
    /// Number of component planes, independent of how many memory planes hold them.
    pub comp_planes: usize,
    /// Bytes per pixel of each component plane.
    pub bpp: [u32; MAX_PLANES],
    /// Horizontal chroma subsampling.
    pub hdiv: u32,
    /// Vertical chroma subsampling.
    pub vdiv: u32,
}

impl ComponentLayout {
    const fn new(bpp: &[u32], hdiv: u32, vdiv: u32) -> Self {
        let mut out = [0; MAX_PLANES];
        let mut i = 0;
        while i < bpp.len() {
            out[i] = bpp[i];
            i += 1;
        }
        Self { comp_planes: bpp.len(), bpp: out, hdiv, vdiv }
    }

    const COMPRESSED: ComponentLayout = ComponentLayout::new(&[1], 1, 1);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub fourcc: Fourcc,
    pub kind: FormatKind,
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
    /// Number of memory planes.
    pub num_planes: usize,
    pub layout: ComponentLayout,
    pub family: ColorFamily,
    pub src_format: SourceFormat,
    pub source_endian: EndianMode,
    pub packed_format: PackedFormat,
    pub cbcr_interleave: bool,
    pub nv21: bool,
    pub is_10bit: bool,
    pub csc_order: u32,
}

impl FormatDescriptor {
    const fn codec(fourcc: &[u8; 4]) -> Self {
        Self {
            kind: FormatKind::Codec,
            layout: ComponentLayout::COMPRESSED,
            ..Self::raw(fourcc, 1, ComponentLayout::COMPRESSED, SourceFormat::Yuv420)
        }
    }

    const fn raw(
        fourcc: &[u8; 4],
        num_planes: usize,
        layout: ComponentLayout,
        src_format: SourceFormat,
    ) -> Self {
        Self {
            fourcc: Fourcc::from_bytes(fourcc),
            kind: FormatKind::Raw,
            min_width: MIN_ENC_PIC_WIDTH,
            max_width: MAX_ENC_PIC_WIDTH,
            min_height: MIN_ENC_PIC_HEIGHT,
            max_height: MAX_ENC_PIC_HEIGHT,
            num_planes,
            layout,
            family: ColorFamily::Yuv,
            src_format,
            source_endian: EndianMode::Vdi128BitLittleEndian,
            packed_format: PackedFormat::NotPacked,
            cbcr_interleave: false,
            nv21: false,
            is_10bit: false,
            csc_order: 0,
        }
    }

    const fn interleaved(self) -> Self {
        Self { cbcr_interleave: true, ..self }
    }

    const fn reversed(self) -> Self {
        Self { nv21: true, ..self }
    }

    const fn ten_bit(self, source_endian: EndianMode) -> Self {
        Self { is_10bit: true, source_endian, ..self }
    }

    const fn packed(self, packed_format: PackedFormat) -> Self {
        Self { packed_format, ..self }
    }

    const fn rgb(self, csc_order: u32) -> Self {
        Self { family: ColorFamily::Rgb, cbcr_interleave: true, csc_order, ..self }
    }

    pub fn is_rgb(&self) -> bool {
        self.family == ColorFamily::Rgb
    }
}

// Component orders of the CSC block.
const CSC_ORDER_RGB: u32 = 0;
const CSC_ORDER_BGR: u32 = 4;
const CSC_ORDER_ARGB: u32 = 0;
const CSC_ORDER_ABGR: u32 = 4;
const CSC_ORDER_RGBA: u32 = 8;
const CSC_ORDER_BGRA: u32 = 12;

const YUV420_3P: ComponentLayout = ComponentLayout::new(&[1, 1, 1], 2, 2);
const YUV420_2P: ComponentLayout = ComponentLayout::new(&[1, 2], 2, 2);
const YUV422_3P: ComponentLayout = ComponentLayout::new(&[1, 1, 1], 2, 1);
const YUV422_2P: ComponentLayout = ComponentLayout::new(&[1, 2], 2, 1);
const YUV444_2P: ComponentLayout = ComponentLayout::new(&[1, 2], 1, 1);
const P010_2P: ComponentLayout = ComponentLayout::new(&[2, 4], 2, 2);
const PACKED_16: ComponentLayout = ComponentLayout::new(&[2], 2, 1);
const PACKED_24: ComponentLayout = ComponentLayout::new(&[3], 1, 1);
const PACKED_32: ComponentLayout = ComponentLayout::new(&[4], 1, 1);

static CODEC_FORMATS: [FormatDescriptor; 2] =
    [FormatDescriptor::codec(b"HEVC"), FormatDescriptor::codec(b"H264")];

static RAW_FORMATS: [FormatDescriptor; 28] = {
    use FormatDescriptor as F;
    use SourceFormat::*;

    [
        F::raw(b"YU12", 1, YUV420_3P, Yuv420),
        F::raw(b"NV12", 1, YUV420_2P, Yuv420).interleaved(),
        F::raw(b"NV21", 1, YUV420_2P, Yuv420).interleaved().reversed(),
        F::raw(b"422P", 1, YUV422_3P, Yuv422),
        F::raw(b"NV16", 1, YUV422_2P, Yuv422).interleaved(),
        F::raw(b"NV61", 1, YUV422_2P, Yuv422).interleaved().reversed(),
        F::raw(b"YUYV", 1, PACKED_16, Yuyv).packed(PackedFormat::Yuyv),
        F::raw(b"YUV3", 1, PACKED_24, Yuv444_24BitPacked).interleaved(),
        F::raw(b"NV24", 1, YUV444_2P, Yuv444_24Bit).interleaved(),
        F::raw(b"NV42", 1, YUV444_2P, Yuv444_24Bit).interleaved().reversed(),
        F::raw(b"YM12", 3, YUV420_3P, Yuv420),
        F::raw(b"NM12", 2, YUV420_2P, Yuv420).interleaved(),
        F::raw(b"NM21", 2, YUV420_2P, Yuv420).interleaved().reversed(),
        F::raw(b"YM16", 3, YUV422_3P, Yuv422),
        F::raw(b"NM16", 2, YUV422_2P, Yuv422).interleaved(),
        F::raw(b"NM61", 2, YUV422_2P, Yuv422).interleaved().reversed(),
        F::raw(b"P010", 1, P010_2P, Yuv420P10_16BitMsb)
            .interleaved()
            .ten_bit(EndianMode::Vdi128BitLeByteSwap),
        F::raw(b"RGB3", 1, PACKED_24, Rgb24BitPacked).rgb(CSC_ORDER_RGB),
        F::raw(b"BGR3", 1, PACKED_24, Rgb24BitPacked).rgb(CSC_ORDER_BGR),
        F::raw(b"BA24", 1, PACKED_32, Rgb32BitPacked).rgb(CSC_ORDER_ARGB),
        F::raw(b"BX24", 1, PACKED_32, Rgb32BitPacked).rgb(CSC_ORDER_ARGB),
        F::raw(b"AB24", 1, PACKED_32, Rgb32BitPacked).rgb(CSC_ORDER_RGBA),
        F::raw(b"XB24", 1, PACKED_32, Rgb32BitPacked).rgb(CSC_ORDER_RGBA),
        F::raw(b"XR24", 1, PACKED_32, Rgb32BitPacked).rgb(CSC_ORDER_BGRA),
        F::raw(b"AR24", 1, PACKED_32, Rgb32BitPacked).rgb(CSC_ORDER_BGRA),
        F::raw(b"RX24", 1, PACKED_32, Rgb32BitPacked).rgb(CSC_ORDER_ABGR),
        F::raw(b"RA24", 1, PACKED_32, Rgb32BitPacked).rgb(CSC_ORDER_ABGR),
        F::raw(b"AR30", 1, PACKED_32, RgbP10_32BitPacked)
            .rgb(CSC_ORDER_ARGB)
            .ten_bit(EndianMode::Vdi128BitLeWordByteSwap),
    ]
};

fn table(kind: FormatKind) -> &'static [FormatDescriptor] {
    match kind {
        FormatKind::Codec => &CODEC_FORMATS,
        FormatKind::Raw => &RAW_FORMATS,
    }
}

pub fn find_by_pixel_format(fourcc: Fourcc, kind: FormatKind) -> Option<&'static FormatDescriptor> {
    table(kind).iter().find(|f| f.fourcc == fourcc)
}

/// Returns the `index`th format of `kind`, in enumeration order.
pub fn find_by_index(index: usize, kind: FormatKind) -> Option<&'static FormatDescriptor> {
    table(kind).get(index)
}

/// Stepwise range of frame sizes accepted for a format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSizeRange {
    pub min_width: u32,
    pub max_width: u32,
    pub step_width: u32,
    pub min_height: u32,
    pub max_height: u32,
    pub step_height: u32,
}

/// Frame sizes supported for `fourcc`, looking at bitstream formats first.
pub fn frame_size_range(fourcc: Fourcc) -> Option<FrameSizeRange> {
    let fmt = find_by_pixel_format(fourcc, FormatKind::Codec)
        .or_else(|| find_by_pixel_format(fourcc, FormatKind::Raw))?;

    Some(FrameSizeRange {
        min_width: fmt.min_width,
        max_width: fmt.max_width,
        step_width: ENC_PIC_SIZE_STEP,
        min_height: fmt.min_height,
        max_height: fmt.max_height,
        step_height: ENC_PIC_SIZE_STEP,
    })
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlaneFormat {
    pub bytesperline: u32,
    pub sizeimage: u32,
}

/// A negotiated multi-planar pixel format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PixFormat {
    pub fourcc: Fourcc,
    pub width: u32,
    pub height: u32,
    pub num_planes: usize,
    pub planes: [PlaneFormat; MAX_PLANES],
    pub colorimetry: Colorimetry,
}

impl PixFormat {
    /// Builds a format for `desc` at the given size.
    pub fn new(desc: &FormatDescriptor, width: u32, height: u32) -> Self {
        let mut fmt =
            Self { fourcc: desc.fourcc, num_planes: desc.num_planes, ..Default::default() };
        fmt.update(width, height);
        fmt
    }

    /// Recomputes the size and plane layout for a new resolution.
    pub fn update(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.planes = Default::default();

        let desc = find_by_pixel_format(self.fourcc, FormatKind::Raw);
        let desc = match desc {
            Some(desc) => desc,
            None => {
                self.planes[0].sizeimage = width * height * 3 / 2;
                return;
            }
        };

        let layout = &desc.layout;
        for p in 0..layout.comp_planes {
            let (hdiv, vdiv) = if p == 0 { (1, 1) } else { (layout.hdiv, layout.vdiv) };
            let bytesperline = width.div_ceil(hdiv) * layout.bpp[p];
            let sizeimage = bytesperline * height.div_ceil(vdiv);

            if desc.num_planes == 1 {
                if p == 0 {
                    self.planes[0].bytesperline = bytesperline;
                }
                self.planes[0].sizeimage += sizeimage;
            } else {
                self.planes[p] = PlaneFormat { bytesperline, sizeimage };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_every_tag() {
        for kind in [FormatKind::Codec, FormatKind::Raw] {
            let mut i = 0;
            while let Some(fmt) = find_by_index(i, kind) {
                let found = find_by_pixel_format(fmt.fourcc, kind).unwrap();
                assert_eq!(found.fourcc, fmt.fourcc);
                assert_eq!(found.kind, kind);
                // Tags are unique within a kind.
                assert!(std::ptr::eq(found, fmt), "duplicate {}", fmt.fourcc);
                i += 1;
            }
        }

        assert_eq!(table(FormatKind::Codec).len(), 2);
        assert_eq!(table(FormatKind::Raw).len(), 28);
        assert!(find_by_index(28, FormatKind::Raw).is_none());
        assert!(find_by_index(2, FormatKind::Codec).is_none());
    }

    #[test]
    fn lookup_miss() {
        assert!(find_by_pixel_format(Fourcc::from(b"VP80"), FormatKind::Codec).is_none());
        assert!(find_by_pixel_format(Fourcc::from(b"H264"), FormatKind::Raw).is_none());
        assert!(find_by_pixel_format(Fourcc::from(b"NV12"), FormatKind::Codec).is_none());
    }

    #[test]
    fn enumeration_order() {
        assert_eq!(find_by_index(0, FormatKind::Codec).unwrap().fourcc, Fourcc::from(b"HEVC"));
        assert_eq!(find_by_index(1, FormatKind::Codec).unwrap().fourcc, Fourcc::from(b"H264"));
        assert_eq!(find_by_index(0, FormatKind::Raw).unwrap().fourcc, Fourcc::from(b"YU12"));
        assert_eq!(find_by_index(27, FormatKind::Raw).unwrap().fourcc, Fourcc::from(b"AR30"));
    }

    #[test]
    fn hardware_tags() {
        let nv21 = find_by_pixel_format(Fourcc::from(b"NV21"), FormatKind::Raw).unwrap();
        assert!(nv21.cbcr_interleave && nv21.nv21);

        let p010 = find_by_pixel_format(Fourcc::from(b"P010"), FormatKind::Raw).unwrap();
        assert_eq!(p010.src_format as u32, 5);
        assert_eq!(p010.source_endian as u32, 17);
        assert!(p010.is_10bit);

        let yuyv = find_by_pixel_format(Fourcc::from(b"YUYV"), FormatKind::Raw).unwrap();
        assert_eq!(yuyv.src_format as u32, 21);
        assert_eq!(yuyv.packed_format, PackedFormat::Yuyv);

        let abgr = find_by_pixel_format(Fourcc::from(b"AR24"), FormatKind::Raw).unwrap();
        assert!(abgr.is_rgb());
        assert_eq!(abgr.csc_order, 12);
        assert_eq!(abgr.src_format as u32, 90);
    }

    #[test]
    fn plane_layouts() {
        let yu12 = find_by_pixel_format(Fourcc::from(b"YU12"), FormatKind::Raw).unwrap();
        let fmt = PixFormat::new(yu12, 1920, 1080);
        assert_eq!(fmt.num_planes, 1);
        assert_eq!(fmt.planes[0].bytesperline, 1920);
        assert_eq!(fmt.planes[0].sizeimage, 1920 * 1080 * 3 / 2);

        let nm12 = find_by_pixel_format(Fourcc::from(b"NM12"), FormatKind::Raw).unwrap();
        let fmt = PixFormat::new(nm12, 416, 240);
        assert_eq!(fmt.planes[0], PlaneFormat { bytesperline: 416, sizeimage: 416 * 240 });
        assert_eq!(fmt.planes[1], PlaneFormat { bytesperline: 416, sizeimage: 416 * 120 });

        let ym16 = find_by_pixel_format(Fourcc::from(b"YM16"), FormatKind::Raw).unwrap();
        let fmt = PixFormat::new(ym16, 256, 128);
        assert_eq!(fmt.planes[1], PlaneFormat { bytesperline: 128, sizeimage: 128 * 128 });

        let yuyv = find_by_pixel_format(Fourcc::from(b"YUYV"), FormatKind::Raw).unwrap();
        let fmt = PixFormat::new(yuyv, 640, 480);
        assert_eq!(fmt.planes[0], PlaneFormat { bytesperline: 1280, sizeimage: 1280 * 480 });

        let hevc = find_by_pixel_format(Fourcc::from(b"HEVC"), FormatKind::Codec).unwrap();
        let fmt = PixFormat::new(hevc, 416, 240);
        assert_eq!(fmt.planes[0], PlaneFormat { bytesperline: 0, sizeimage: 416 * 240 * 3 / 2 });
    }

    #[test]
    fn frame_sizes() {
        let range = frame_size_range(Fourcc::from(b"H264")).unwrap();
        assert_eq!(range.min_width, 256);
        assert_eq!(range.max_height, 4096);
        assert_eq!(range.step_width, 8);
        assert!(frame_size_range(Fourcc::from(b"NV12")).is_some());
        assert!(frame_size_range(Fourcc::from(b"MJPG")).is_none());
    }
}
