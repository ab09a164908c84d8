//! Resize and colour conversion applied to a stored frame on delivery
//!
//! [`FrameProcessor`] is the seam where a GPU kernel would plug in.
//! [`HostProcessor`] is the CPU implementation: source pixels are brought to
//! RGB, resized, then packed into the requested layout using BT.601 limited
//! range coefficients.

use std::str::FromStr;

use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Result, VReaderError};
use crate::source::{Frame, PixelFormat};

/// Output pixel layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FourCC {
    /// 8-bit luma only
    Y800,
    #[default]
    Rgb24,
    Bgr24,
    /// Luma plane followed by interleaved 2x2-subsampled UV
    Nv12,
    /// Packed 4:2:2, `U Y0 V Y1`
    Uyvy,
    /// Planar 4:4:4, `Y` then `U` then `V`
    Yuv444,
    /// Planar `R`, `G`, `B`
    RgbPlanar,
    /// Planar `B`, `G`, `R`
    BgrPlanar,
}

impl FourCC {
    /// Byte size of a `width` x `height` picture in this layout.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let area = width as usize * height as usize;
        match self {
            FourCC::Y800 => area,
            FourCC::Nv12 => area * 3 / 2,
            FourCC::Uyvy => area * 2,
            FourCC::Rgb24
            | FourCC::Bgr24
            | FourCC::Yuv444
            | FourCC::RgbPlanar
            | FourCC::BgrPlanar => area * 3,
        }
    }

    fn check_dimensions(self, width: u32, height: u32) -> std::result::Result<(), String> {
        match self {
            FourCC::Nv12 if width % 2 != 0 || height % 2 != 0 => {
                Err(format!("NV12 needs even dimensions, got {width}x{height}"))
            }
            FourCC::Uyvy if width % 2 != 0 => Err(format!("UYVY needs an even width, got {width}")),
            _ => Ok(()),
        }
    }
}

impl FromStr for FourCC {
    type Err = VReaderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "y800" | "gray" => Ok(FourCC::Y800),
            "rgb24" | "rgb" => Ok(FourCC::Rgb24),
            "bgr24" | "bgr" => Ok(FourCC::Bgr24),
            "nv12" => Ok(FourCC::Nv12),
            "uyvy" => Ok(FourCC::Uyvy),
            "yuv444" => Ok(FourCC::Yuv444),
            "rgb_planar" | "rgbp" => Ok(FourCC::RgbPlanar),
            "bgr_planar" | "bgrp" => Ok(FourCC::BgrPlanar),
            other => Err(VReaderError::InvalidParameter(format!(
                "unknown pixel format {other}"
            ))),
        }
    }
}

/// Interpolation used when the requested size differs from the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResizeType {
    Nearest,
    #[default]
    Bilinear,
    Bicubic,
}

impl From<ResizeType> for FilterType {
    fn from(kind: ResizeType) -> Self {
        match kind {
            ResizeType::Nearest => FilterType::Nearest,
            ResizeType::Bilinear => FilterType::Triangle,
            ResizeType::Bicubic => FilterType::CatmullRom,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResizeOptions {
    /// Zero keeps the source width
    pub width: u32,
    /// Zero keeps the source height
    pub height: u32,
    pub kind: ResizeType,
}

impl ResizeOptions {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            kind: ResizeType::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ColorOptions {
    pub dst_fourcc: FourCC,
}

impl ColorOptions {
    pub fn new(dst_fourcc: FourCC) -> Self {
        Self { dst_fourcc }
    }
}

/// Per-request conversion settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameParameters {
    pub resize: ResizeOptions,
    pub color: ColorOptions,
}

impl FrameParameters {
    pub fn new(resize: ResizeOptions, color: ColorOptions) -> Self {
        Self { resize, color }
    }

    /// Output size for a source of `width` x `height`.
    pub fn output_size(&self, width: u32, height: u32) -> (u32, u32) {
        let w = if self.resize.width == 0 { width } else { self.resize.width };
        let h = if self.resize.height == 0 { height } else { self.resize.height };
        (w, h)
    }
}

/// Converted picture handed to consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
}

/// Converts stored frames into the layout a consumer asked for
pub trait FrameProcessor: Send + Sync {
    fn convert(&self, frame: &Frame, params: &FrameParameters) -> Result<FrameBuffer>;
}

/// CPU conversion path
#[derive(Debug, Default, Clone, Copy)]
pub struct HostProcessor;

impl FrameProcessor for HostProcessor {
    fn convert(&self, frame: &Frame, params: &FrameParameters) -> Result<FrameBuffer> {
        let meta = &frame.meta;
        let (width, height) = params.output_size(meta.width, meta.height);
        let fourcc = params.color.dst_fourcc;
        let unsupported = |reason: String| VReaderError::UnsupportedConversion {
            from: meta.format,
            to: fourcc,
            reason,
        };
        fourcc.check_dimensions(width, height).map_err(unsupported)?;
        let expected = meta
            .format
            .frame_size(meta.width, meta.height)
            .ok_or_else(|| unsupported("source frame is still compressed".into()))?;
        if frame.data.len() < expected {
            return Err(VReaderError::Decode(format!(
                "frame {} payload has {} bytes, expected {expected}",
                meta.index,
                frame.data.len()
            )));
        }
        trace!(index = meta.index, ?fourcc, width, height, "Converting frame");

        let same_size = (width, height) == (meta.width, meta.height);
        let data = match (meta.format, fourcc) {
            // Planes already in the requested layout
            (PixelFormat::Nv12, FourCC::Nv12) if same_size => frame.data.slice(..expected),
            (PixelFormat::Nv12 | PixelFormat::Y800, FourCC::Y800) if same_size => {
                frame.data.slice(..(width as usize * height as usize))
            }
            (PixelFormat::Rgb24, FourCC::Rgb24) if same_size => frame.data.slice(..expected),
            _ => {
                let rgb = to_rgb(frame)?;
                let rgb = if same_size {
                    rgb
                } else {
                    imageops::resize(&rgb, width, height, params.resize.kind.into())
                };
                Bytes::from(pack(&rgb, fourcc))
            }
        };

        Ok(FrameBuffer {
            data,
            width,
            height,
            fourcc,
        })
    }
}

fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

fn rgb_to_yuv([r, g, b]: [u8; 3]) -> [u8; 3] {
    let (r, g, b) = (i32::from(r), i32::from(g), i32::from(b));
    [
        clamp(((66 * r + 129 * g + 25 * b + 128) >> 8) + 16),
        clamp(((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128),
        clamp(((112 * r - 94 * g - 18 * b + 128) >> 8) + 128),
    ]
}

/// Expand any uncompressed source layout to an RGB image.
fn to_rgb(frame: &Frame) -> Result<RgbImage> {
    let meta = &frame.meta;
    let (w, h) = (meta.width as usize, meta.height as usize);
    let src = &frame.data;
    let mut rgb = Vec::with_capacity(w * h * 3);
    match meta.format {
        PixelFormat::Nv12 => {
            let luma_stride = meta.stride as usize;
            let chroma = &src[luma_stride * h..];
            let chroma_stride = w.div_ceil(2) * 2;
            for y in 0..h {
                for x in 0..w {
                    let luma = src[y * luma_stride + x];
                    let c = (y / 2) * chroma_stride + (x / 2) * 2;
                    rgb.extend_from_slice(&yuv_to_rgb(luma, chroma[c], chroma[c + 1]));
                }
            }
        }
        PixelFormat::Rgb24 | PixelFormat::Bgr24 => {
            let stride = meta.stride as usize;
            for y in 0..h {
                let row = &src[y * stride..y * stride + w * 3];
                if meta.format == PixelFormat::Rgb24 {
                    rgb.extend_from_slice(row);
                } else {
                    rgb.extend(row.chunks_exact(3).flat_map(|px| [px[2], px[1], px[0]]));
                }
            }
        }
        PixelFormat::Y800 => {
            let stride = meta.stride as usize;
            for y in 0..h {
                rgb.extend(src[y * stride..y * stride + w].iter().flat_map(|&l| [l, l, l]));
            }
        }
        PixelFormat::Mjpeg => {
            return Err(VReaderError::UnsupportedConversion {
                from: meta.format,
                to: FourCC::Rgb24,
                reason: "source frame is still compressed".into(),
            })
        }
    }
    RgbImage::from_raw(meta.width, meta.height, rgb)
        .ok_or_else(|| VReaderError::Decode("RGB buffer size mismatch".into()))
}

/// Pack an RGB image into `fourcc`.
fn pack(rgb: &RgbImage, fourcc: FourCC) -> Vec<u8> {
    let (w, h) = (rgb.width() as usize, rgb.height() as usize);
    let pixels = rgb.as_raw();
    let px = |x: usize, y: usize| -> [u8; 3] {
        let i = (y * w + x) * 3;
        [pixels[i], pixels[i + 1], pixels[i + 2]]
    };
    let mut out = Vec::with_capacity(fourcc.frame_size(w as u32, h as u32));

    match fourcc {
        FourCC::Rgb24 => out.extend_from_slice(pixels),
        FourCC::Bgr24 => out.extend(pixels.chunks_exact(3).flat_map(|p| [p[2], p[1], p[0]])),
        FourCC::Y800 => out.extend(pixels.chunks_exact(3).map(|p| rgb_to_yuv([p[0], p[1], p[2]])[0])),
        FourCC::RgbPlanar | FourCC::BgrPlanar => {
            let order = if fourcc == FourCC::RgbPlanar { [0, 1, 2] } else { [2, 1, 0] };
            for channel in order {
                out.extend(pixels.chunks_exact(3).map(|p| p[channel]));
            }
        }
        FourCC::Yuv444 => {
            let yuv: Vec<[u8; 3]> = pixels
                .chunks_exact(3)
                .map(|p| rgb_to_yuv([p[0], p[1], p[2]]))
                .collect();
            for plane in 0..3 {
                out.extend(yuv.iter().map(|s| s[plane]));
            }
        }
        FourCC::Nv12 => {
            out.extend(pixels.chunks_exact(3).map(|p| rgb_to_yuv([p[0], p[1], p[2]])[0]));
            for y in (0..h).step_by(2) {
                for x in (0..w).step_by(2) {
                    let block = [px(x, y), px(x + 1, y), px(x, y + 1), px(x + 1, y + 1)];
                    let (mut u, mut v) = (0u32, 0u32);
                    for sample in block {
                        let [_, cb, cr] = rgb_to_yuv(sample);
                        u += u32::from(cb);
                        v += u32::from(cr);
                    }
                    out.push(((u + 2) / 4) as u8);
                    out.push(((v + 2) / 4) as u8);
                }
            }
        }
        FourCC::Uyvy => {
            for y in 0..h {
                for x in (0..w).step_by(2) {
                    let [y0, u0, v0] = rgb_to_yuv(px(x, y));
                    let [y1, u1, v1] = rgb_to_yuv(px(x + 1, y));
                    out.push(((u32::from(u0) + u32::from(u1) + 1) / 2) as u8);
                    out.push(y0);
                    out.push(((u32::from(v0) + u32::from(v1) + 1) / 2) as u8);
                    out.push(y1);
                }
            }
        }
    }
    out
}
