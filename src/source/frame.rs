use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Decoded frame with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Decode timestamp for latency tracking
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(data: Bytes, meta: FrameMetadata) -> Self {
        Self {
            data,
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        }
    }

    pub fn index(&self) -> u64 {
        self.meta.index
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("meta", &self.meta)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub index: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub pts: Option<Duration>, // Presentation time hint if the container has one
}

/// Pixel formats a decode backend can hand to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Y800,
    Mjpeg,
    Nv12,
}

impl PixelFormat {
    /// Payload size of a tightly packed frame, `None` for compressed formats.
    pub fn frame_size(self, width: u32, height: u32) -> Option<usize> {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(w * h * 3),
            PixelFormat::Y800 => Some(w * h),
            PixelFormat::Nv12 => Some(w * h + 2 * w.div_ceil(2) * h.div_ceil(2)),
            PixelFormat::Mjpeg => None,
        }
    }
}

/// Stream properties learned at open time or by the analysis pass
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Native frame rate, `None` when the container does not carry one.
    pub frame_rate: Option<f64>,
    /// Total number of frames, known only after analysis.
    pub total_frames: Option<u64>,
    /// Live sources deliver at their own cadence and cannot be paced.
    pub live: bool,
}

impl StreamInfo {
    pub fn frame_interval(&self) -> Option<Duration> {
        self.frame_rate
            .filter(|fps| *fps > 0.0)
            .map(|fps| Duration::from_secs_f64(1.0 / fps))
    }
}
