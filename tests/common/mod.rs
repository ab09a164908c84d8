#![allow(dead_code)]

use std::sync::Arc;

use vreader::{
    ColorOptions, Config, DeviceRegistry, FourCC, FrameParameters, ResizeOptions, VideoReader,
};

/// Reader accounting device memory in its own registry so tests never see
/// each other's reservations.
pub fn reader() -> (VideoReader, Arc<DeviceRegistry>) {
    let config = Config::default();
    let registry = Arc::new(DeviceRegistry::new(&config.device));
    let reader = VideoReader::builder()
        .registry(Arc::clone(&registry))
        .config(config)
        .build();
    (reader, registry)
}

pub fn pattern(width: u32, height: u32, fps: u32, frames: u64) -> String {
    format!("pattern://?width={width}&height={height}&fps={fps}&frames={frames}")
}

pub fn params(fourcc: FourCC) -> FrameParameters {
    FrameParameters::new(ResizeOptions::new(0, 0), ColorOptions::new(fourcc))
}

pub fn resized(width: u32, height: u32, fourcc: FourCC) -> FrameParameters {
    FrameParameters::new(ResizeOptions::new(width, height), ColorOptions::new(fourcc))
}

/// Concatenated JPEG pictures, each a distinct gradient.
pub fn mjpeg_bytes(width: u32, height: u32, count: u8) -> Vec<u8> {
    let mut out = Vec::new();
    for seed in 0..count {
        let img = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([
                (x as u8).wrapping_mul(9).wrapping_add(seed * 40),
                (y as u8).wrapping_mul(11),
                seed * 60,
            ])
        });
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90)
            .encode_image(&img)
            .unwrap();
    }
    out
}
