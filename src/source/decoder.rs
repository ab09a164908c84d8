//! Software JPEG decode used by the MJPEG backend

use jpeg_decoder::Decoder;

use crate::error::{Result, VReaderError};

/// Interleaved RGB24 picture produced by the JPEG decoder
pub struct DecodedImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Decode one JPEG access unit to RGB24.
pub fn decode_jpeg(data: &[u8]) -> Result<DecodedImage> {
    #[cfg(feature = "fast-jpeg")]
    {
        decode_fast(data)
    }
    #[cfg(not(feature = "fast-jpeg"))]
    {
        decode_reference(data)
    }
}

/// Read only the frame header.
pub fn probe_jpeg(data: &[u8]) -> Result<(u32, u32)> {
    let mut decoder = Decoder::new(data);
    decoder
        .read_info()
        .map_err(|e| VReaderError::Decode(format!("jpeg header: {e}")))?;
    let info = decoder
        .info()
        .ok_or_else(|| VReaderError::Decode("jpeg header missing".into()))?;
    Ok((u32::from(info.width), u32::from(info.height)))
}

#[cfg(feature = "fast-jpeg")]
fn decode_fast(data: &[u8]) -> Result<DecodedImage> {
    let mut decoder = zune_jpeg::JpegDecoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| VReaderError::Decode(format!("jpeg: {e:?}")))?;
    let (width, height) = decoder
        .dimensions()
        .ok_or_else(|| VReaderError::Decode("jpeg dimensions unavailable".into()))?;
    to_rgb(pixels, width as u32, height as u32)
}

#[cfg_attr(feature = "fast-jpeg", allow(dead_code))]
fn decode_reference(data: &[u8]) -> Result<DecodedImage> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| VReaderError::Decode(format!("jpeg: {e}")))?;
    let info = decoder
        .info()
        .ok_or_else(|| VReaderError::Decode("jpeg header missing".into()))?;
    to_rgb(pixels, u32::from(info.width), u32::from(info.height))
}

/// Normalise grey, RGB and CMYK/RGBA output of either decoder to RGB24.
fn to_rgb(pixels: Vec<u8>, width: u32, height: u32) -> Result<DecodedImage> {
    let area = width as usize * height as usize;
    if area == 0 {
        return Err(VReaderError::Decode("jpeg has zero area".into()));
    }
    let pixels = match pixels.len() / area {
        3 => pixels,
        1 => pixels.iter().flat_map(|&y| [y, y, y]).collect(),
        4 => pixels
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect(),
        channels => {
            return Err(VReaderError::Decode(format!(
                "unexpected jpeg channel count {channels}"
            )))
        }
    };
    Ok(DecodedImage {
        pixels,
        width,
        height,
    })
}
