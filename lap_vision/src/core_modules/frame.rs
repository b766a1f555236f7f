// THEORY:
// The `frame` module is the entry gate of the vision system. Cameras hand over
// planar YUV 4:2:0 buffers in a handful of layouts (fully planar, semi-planar,
// strided "flexible" planes); everything downstream wants one canonical RGB
// image. This module owns that normalization and nothing else.
//
// Key architectural principles:
// 1.  **Borrow in, own out**: A `RawFrame` only borrows the camera's planes. The
//     converter reads them once and produces an owned `Frame`, so the caller may
//     recycle its buffers as soon as `convert` returns.
// 2.  **One sampler for every layout**: Each recognized scheme is resolved into
//     three `PlaneView`s (offset, row stride, pixel stride). Fully planar, NV12/NV21
//     and strided layouts then share the same per-pixel YUV → RGB path.
// 3.  **Validate before touching pixels**: Plane lengths are checked against the
//     declared geometry up front, so the hot loop indexes without bounds surprises
//     and a malformed frame is rejected as a whole.

use image::{GrayImage, Luma, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;

pub type Byte = u8;
pub type Luminance = f64;

/// Platform tag of the flexible YUV 4:2:0 format (three strided planes).
const TAG_YUV_420_888: u32 = 0x23;
/// Platform tag of NV21 (Y plane followed by interleaved V/U).
const TAG_NV21: u32 = 0x11;
/// Platform tag of YV12, also its FourCC.
const TAG_YV12: u32 = 0x3231_5659;
const FOURCC_I420: u32 = 0x3032_3449;
const FOURCC_NV12: u32 = 0x3231_564E;

/// Errors raised while normalizing a raw camera frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The declared layout is not one of the recognized planar schemes.
    #[error("unsupported frame format {0:?}")]
    UnsupportedFormat(PixelFormat),
    /// The layout is recognized but the plane count does not match it.
    #[error("{format:?} expects {expected} planes, got {got}")]
    PlaneCount {
        format: PixelFormat,
        expected: &'static str,
        got: usize,
    },
    /// A plane is too short for the declared geometry and strides.
    #[error("{plane} plane holds {len} bytes, the declared geometry needs {needed}")]
    PlaneTooShort {
        plane: &'static str,
        len: usize,
        needed: usize,
    },
    #[error("frame dimensions {width}x{height} are not usable")]
    InvalidDimensions { width: u32, height: u32 },
}

/// Declared pixel layout of a raw camera frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Three planes with individual row and pixel strides.
    Yuv420Flexible,
    /// Fully planar Y, U, V.
    I420,
    /// Fully planar Y, V, U.
    Yv12,
    /// Y plane followed by interleaved U/V.
    Nv12,
    /// Y plane followed by interleaved V/U.
    Nv21,
    /// Any tag this crate does not know how to decode.
    Unrecognized(u32),
}

impl PixelFormat {
    /// Maps a platform format constant or FourCC to a layout.
    pub fn from_tag(tag: u32) -> Self {
        match tag {
            TAG_YUV_420_888 => PixelFormat::Yuv420Flexible,
            TAG_NV21 => PixelFormat::Nv21,
            TAG_YV12 => PixelFormat::Yv12,
            FOURCC_I420 => PixelFormat::I420,
            FOURCC_NV12 => PixelFormat::Nv12,
            other => PixelFormat::Unrecognized(other),
        }
    }

    pub fn tag(self) -> u32 {
        match self {
            PixelFormat::Yuv420Flexible => TAG_YUV_420_888,
            PixelFormat::Nv21 => TAG_NV21,
            PixelFormat::Yv12 => TAG_YV12,
            PixelFormat::I420 => FOURCC_I420,
            PixelFormat::Nv12 => FOURCC_NV12,
            PixelFormat::Unrecognized(tag) => tag,
        }
    }
}

/// Quantization range of the incoming YUV samples (BT.601 coefficients).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorRange {
    /// Video range: Y in 16..=235, chroma in 16..=240.
    #[default]
    Limited,
    /// Full range: every channel spans 0..=255.
    Full,
}

impl ColorRange {
    fn to_rgb(self, y: Byte, u: Byte, v: Byte) -> Rgb<Byte> {
        let d = u as f32 - 128.0;
        let e = v as f32 - 128.0;
        let (c, [kr, kgu, kgv, kb]) = match self {
            ColorRange::Limited => ((y as f32 - 16.0) * 1.164, [1.596, 0.391, 0.813, 2.018]),
            ColorRange::Full => (y as f32, [1.402, 0.344, 0.714, 1.772]),
        };
        Rgb([
            clamp_byte(c + kr * e),
            clamp_byte(c - kgu * d - kgv * e),
            clamp_byte(c + kb * d),
        ])
    }
}

fn clamp_byte(value: f32) -> Byte {
    value.round().clamp(0.0, 255.0) as Byte
}

/// One borrowed plane of a raw frame.
#[derive(Debug, Clone, Copy)]
pub struct Plane<'a> {
    pub data: &'a [Byte],
    /// Bytes between the starts of two consecutive rows.
    pub row_stride: usize,
    /// Bytes between two horizontally adjacent samples.
    pub pixel_stride: usize,
}

impl<'a> Plane<'a> {
    pub fn new(data: &'a [Byte], row_stride: usize, pixel_stride: usize) -> Self {
        Self {
            data,
            row_stride,
            pixel_stride,
        }
    }

    /// A tightly packed plane: one byte per sample.
    pub fn packed(data: &'a [Byte], row_stride: usize) -> Self {
        Self::new(data, row_stride, 1)
    }
}

/// A raw planar frame as delivered by the camera. Borrows its planes.
#[derive(Debug, Clone)]
pub struct RawFrame<'a> {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: Vec<Plane<'a>>,
}

impl<'a> RawFrame<'a> {
    pub fn new(width: u32, height: u32, format: PixelFormat, planes: Vec<Plane<'a>>) -> Self {
        Self {
            width,
            height,
            format,
            planes,
        }
    }
}

/// Owned storage for one plane of a `RawFrameBuf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneBuf {
    pub data: Vec<Byte>,
    pub row_stride: usize,
    pub pixel_stride: usize,
}

impl PlaneBuf {
    pub fn new(data: Vec<Byte>, row_stride: usize, pixel_stride: usize) -> Self {
        Self {
            data,
            row_stride,
            pixel_stride,
        }
    }

    pub fn packed(data: Vec<Byte>, row_stride: usize) -> Self {
        Self::new(data, row_stride, 1)
    }
}

/// An owned raw frame, used when a frame has to cross a thread boundary
/// before it is converted.
#[derive(Debug, Clone)]
pub struct RawFrameBuf {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: Vec<PlaneBuf>,
    /// When the frame was captured. Crossing times are taken from here.
    pub captured_at: Instant,
}

impl RawFrameBuf {
    /// Wraps owned planes, stamping the frame with the current instant.
    pub fn new(width: u32, height: u32, format: PixelFormat, planes: Vec<PlaneBuf>) -> Self {
        Self::captured_at(width, height, format, planes, Instant::now())
    }

    pub fn captured_at(
        width: u32,
        height: u32,
        format: PixelFormat,
        planes: Vec<PlaneBuf>,
        captured_at: Instant,
    ) -> Self {
        Self {
            width,
            height,
            format,
            planes,
            captured_at,
        }
    }

    pub fn as_raw(&self) -> RawFrame<'_> {
        RawFrame {
            width: self.width,
            height: self.height,
            format: self.format,
            planes: self
                .planes
                .iter()
                .map(|plane| Plane::new(&plane.data, plane.row_stride, plane.pixel_stride))
                .collect(),
        }
    }
}

/// A canonical 3-channel frame. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    image: RgbImage,
}

impl Frame {
    pub fn from_rgb(image: RgbImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_rgb(self) -> RgbImage {
        self.image
    }

    /// Single-channel intensity image using Rec. 601 luma weights.
    pub fn luminance_image(&self) -> GrayImage {
        let (width, height) = self.dimensions();
        GrayImage::from_fn(width, height, |x, y| {
            Luma([luminance(self.image.get_pixel(x, y)).round().min(255.0) as Byte])
        })
    }
}

/// Luminance estimate (Rec. 601 luma) of a single RGB pixel.
pub fn luminance(pixel: &Rgb<Byte>) -> Luminance {
    let [red, green, blue] = pixel.0;
    0.299_f64 * red as f64 + 0.587_f64 * green as f64 + 0.114_f64 * blue as f64
}

/// Converts raw planar frames into canonical RGB frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameConverter {
    range: ColorRange,
}

impl FrameConverter {
    pub fn new(range: ColorRange) -> Self {
        Self { range }
    }

    pub fn range(&self) -> ColorRange {
        self.range
    }

    pub fn convert(&self, raw: &RawFrame<'_>) -> Result<Frame, FrameError> {
        if raw.width == 0 || raw.height == 0 {
            return Err(FrameError::InvalidDimensions {
                width: raw.width,
                height: raw.height,
            });
        }
        let layout = YuvLayout::resolve(raw)?;
        layout.validate(raw.width as usize, raw.height as usize)?;

        let mut image = RgbImage::new(raw.width, raw.height);
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            let (x, y) = (x as usize, y as usize);
            *pixel = self.range.to_rgb(
                layout.y.sample(x, y),
                layout.u.sample(x / 2, y / 2),
                layout.v.sample(x / 2, y / 2),
            );
        }
        Ok(Frame { image })
    }
}

/// A window into one plane: where sample (0, 0) lives and how to step.
#[derive(Debug, Clone, Copy)]
struct PlaneView<'a> {
    data: &'a [Byte],
    offset: usize,
    row_stride: usize,
    pixel_stride: usize,
}

impl<'a> PlaneView<'a> {
    fn of(plane: &Plane<'a>, offset: usize, pixel_stride: usize) -> Self {
        Self {
            data: plane.data,
            offset,
            row_stride: plane.row_stride,
            pixel_stride,
        }
    }

    #[inline]
    fn sample(&self, x: usize, y: usize) -> Byte {
        self.data[self.offset + y * self.row_stride + x * self.pixel_stride]
    }

    fn check(&self, name: &'static str, cols: usize, rows: usize) -> Result<(), FrameError> {
        let needed =
            self.offset + (rows - 1) * self.row_stride + (cols - 1) * self.pixel_stride + 1;
        if self.data.len() < needed {
            return Err(FrameError::PlaneTooShort {
                plane: name,
                len: self.data.len(),
                needed,
            });
        }
        Ok(())
    }
}

struct YuvLayout<'a> {
    y: PlaneView<'a>,
    u: PlaneView<'a>,
    v: PlaneView<'a>,
}

impl<'a> YuvLayout<'a> {
    fn resolve(raw: &RawFrame<'a>) -> Result<Self, FrameError> {
        let planes = &raw.planes;
        let height = raw.height as usize;
        let plane_count = |expected: &'static str| FrameError::PlaneCount {
            format: raw.format,
            expected,
            got: planes.len(),
        };

        match raw.format {
            PixelFormat::Yuv420Flexible => match planes.as_slice() {
                [y, u, v] => Ok(Self {
                    y: PlaneView::of(y, 0, y.pixel_stride),
                    u: PlaneView::of(u, 0, u.pixel_stride),
                    v: PlaneView::of(v, 0, v.pixel_stride),
                }),
                _ => Err(plane_count("3")),
            },
            PixelFormat::I420 | PixelFormat::Yv12 => {
                let (y, first, second) = match planes.as_slice() {
                    [y, first, second] => (
                        PlaneView::of(y, 0, 1),
                        PlaneView::of(first, 0, 1),
                        PlaneView::of(second, 0, 1),
                    ),
                    [single] => {
                        let chroma_stride = single.row_stride.div_ceil(2);
                        let first_offset = single.row_stride * height;
                        let second_offset = first_offset + chroma_stride * height.div_ceil(2);
                        let chroma = |offset| PlaneView {
                            data: single.data,
                            offset,
                            row_stride: chroma_stride,
                            pixel_stride: 1,
                        };
                        (PlaneView::of(single, 0, 1), chroma(first_offset), chroma(second_offset))
                    }
                    _ => return Err(plane_count("1 or 3")),
                };
                if raw.format == PixelFormat::I420 {
                    Ok(Self { y, u: first, v: second })
                } else {
                    Ok(Self { y, u: second, v: first })
                }
            }
            PixelFormat::Nv12 | PixelFormat::Nv21 => {
                let (y, interleaved) = match planes.as_slice() {
                    [y, uv] => (PlaneView::of(y, 0, 1), PlaneView::of(uv, 0, 2)),
                    [single] => (
                        PlaneView::of(single, 0, 1),
                        PlaneView::of(single, single.row_stride * height, 2),
                    ),
                    _ => return Err(plane_count("1 or 2")),
                };
                let shifted = PlaneView {
                    offset: interleaved.offset + 1,
                    ..interleaved
                };
                if raw.format == PixelFormat::Nv12 {
                    Ok(Self { y, u: interleaved, v: shifted })
                } else {
                    Ok(Self { y, u: shifted, v: interleaved })
                }
            }
            PixelFormat::Unrecognized(_) => Err(FrameError::UnsupportedFormat(raw.format)),
        }
    }

    fn validate(&self, width: usize, height: usize) -> Result<(), FrameError> {
        let (chroma_width, chroma_height) = (width.div_ceil(2), height.div_ceil(2));
        self.y.check("Y", width, height)?;
        self.u.check("U", chroma_width, chroma_height)?;
        self.v.check("V", chroma_width, chroma_height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i420_constant(width: u32, height: u32, y: u8, u: u8, v: u8) -> Vec<u8> {
        let luma = (width * height) as usize;
        let chroma = (width.div_ceil(2) * height.div_ceil(2)) as usize;
        let mut data = vec![y; luma];
        data.extend(std::iter::repeat_n(u, chroma));
        data.extend(std::iter::repeat_n(v, chroma));
        data
    }

    #[test]
    fn tags_map_to_layouts() {
        assert_eq!(PixelFormat::from_tag(35), PixelFormat::Yuv420Flexible);
        assert_eq!(PixelFormat::from_tag(17), PixelFormat::Nv21);
        assert_eq!(PixelFormat::from_tag(0x3231_5659), PixelFormat::Yv12);
        assert_eq!(PixelFormat::from_tag(u32::from_le_bytes(*b"I420")), PixelFormat::I420);
        assert_eq!(PixelFormat::from_tag(u32::from_le_bytes(*b"NV12")), PixelFormat::Nv12);
        assert_eq!(PixelFormat::from_tag(0x100), PixelFormat::Unrecognized(0x100));
        assert_eq!(PixelFormat::Nv12.tag(), u32::from_le_bytes(*b"NV12"));
    }

    #[test]
    fn unrecognized_format_is_rejected() {
        let data = vec![0u8; 64];
        let raw = RawFrame::new(4, 4, PixelFormat::from_tag(0x20), vec![Plane::packed(&data, 4)]);
        let err = FrameConverter::default().convert(&raw).unwrap_err();
        assert_eq!(err, FrameError::UnsupportedFormat(PixelFormat::Unrecognized(0x20)));
    }

    #[test]
    fn limited_range_extremes_map_to_black_and_white() {
        let converter = FrameConverter::new(ColorRange::Limited);
        for (y, expected) in [(16u8, 0u8), (235, 255)] {
            let data = i420_constant(4, 2, y, 128, 128);
            let raw = RawFrame::new(4, 2, PixelFormat::I420, vec![Plane::packed(&data, 4)]);
            let frame = converter.convert(&raw).unwrap();
            assert!(frame.as_rgb().pixels().all(|p| p.0 == [expected; 3]));
        }
    }

    #[test]
    fn full_range_gray_passes_luma_through() {
        let data = i420_constant(2, 2, 100, 128, 128);
        let raw = RawFrame::new(2, 2, PixelFormat::I420, vec![Plane::packed(&data, 2)]);
        let frame = FrameConverter::new(ColorRange::Full).convert(&raw).unwrap();
        assert_eq!(frame.dimensions(), (2, 2));
        assert_eq!(frame.as_rgb().get_pixel(1, 1).0, [100, 100, 100]);
    }

    #[test]
    fn semi_planar_orders_agree() {
        let luma = [120u8; 4];
        let nv12 = RawFrame::new(
            2,
            2,
            PixelFormat::Nv12,
            vec![Plane::packed(&luma, 2), Plane::packed(&[90, 240], 2)],
        );
        let nv21 = RawFrame::new(
            2,
            2,
            PixelFormat::Nv21,
            vec![Plane::packed(&luma, 2), Plane::packed(&[240, 90], 2)],
        );
        let converter = FrameConverter::default();
        let a = converter.convert(&nv12).unwrap();
        let b = converter.convert(&nv21).unwrap();
        assert_eq!(a, b);
        let [red, _, blue] = a.as_rgb().get_pixel(0, 0).0;
        assert!(red > blue, "high V should read as red, got r={red} b={blue}");
    }

    #[test]
    fn planar_orders_agree() {
        let i420 = i420_constant(4, 4, 80, 60, 200);
        let mut yv12 = i420.clone();
        // Swap the two chroma blocks.
        let (_, chroma) = yv12.split_at_mut(16);
        let (u, v) = chroma.split_at_mut(4);
        u.swap_with_slice(v);

        let converter = FrameConverter::default();
        let a = converter
            .convert(&RawFrame::new(4, 4, PixelFormat::I420, vec![Plane::packed(&i420, 4)]))
            .unwrap();
        let b = converter
            .convert(&RawFrame::new(4, 4, PixelFormat::Yv12, vec![Plane::packed(&yv12, 4)]))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn flexible_layout_honours_strides() {
        // Width 4 with 8-byte padded rows, chroma interleaved like a camera
        // exposing one VU buffer through two overlapping planes.
        let mut luma = vec![0u8; 8 * 2];
        for y in 0..2 {
            for x in 0..4 {
                luma[y * 8 + x] = 200;
            }
        }
        let interleaved = [128u8, 128, 128, 128];
        let raw = RawFrame::new(
            4,
            2,
            PixelFormat::Yuv420Flexible,
            vec![
                Plane::packed(&luma, 8),
                Plane::new(&interleaved[1..], 4, 2),
                Plane::new(&interleaved[..3], 4, 2),
            ],
        );
        let frame = FrameConverter::new(ColorRange::Full).convert(&raw).unwrap();
        assert!(frame.as_rgb().pixels().all(|p| p.0 == [200, 200, 200]));
    }

    #[test]
    fn short_planes_are_reported() {
        let data = vec![0u8; 10];
        let raw = RawFrame::new(4, 4, PixelFormat::I420, vec![Plane::packed(&data, 4)]);
        match FrameConverter::default().convert(&raw) {
            Err(FrameError::PlaneTooShort { plane: "Y", len: 10, needed: 16 }) => {}
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn plane_count_must_match_layout() {
        let data = vec![0u8; 24];
        let raw = RawFrame::new(
            4,
            4,
            PixelFormat::Yuv420Flexible,
            vec![Plane::packed(&data, 4)],
        );
        assert!(matches!(
            FrameConverter::default().convert(&raw),
            Err(FrameError::PlaneCount { got: 1, .. })
        ));
    }

    #[test]
    fn zero_sized_frames_are_rejected() {
        let raw = RawFrame::new(0, 4, PixelFormat::I420, vec![Plane::packed(&[], 0)]);
        assert_eq!(
            FrameConverter::default().convert(&raw).unwrap_err(),
            FrameError::InvalidDimensions { width: 0, height: 4 }
        );
    }

    #[test]
    fn owned_frames_convert_through_views() {
        let data = i420_constant(2, 2, 100, 128, 128);
        let owned = RawFrameBuf::new(2, 2, PixelFormat::I420, vec![PlaneBuf::packed(data, 2)]);
        let frame = FrameConverter::new(ColorRange::Full).convert(&owned.as_raw()).unwrap();
        drop(owned);
        assert_eq!(frame.luminance_image().get_pixel(0, 0).0, [100]);
    }
}
