//! Deterministic synthetic NV12 stream
//!
//! `pattern://?width=W&height=H&fps=F&frames=N&live&fail_at=K`
//!
//! Every frame is a pure function of its index, so two readers of the same
//! pattern see byte-identical pictures. `live` makes the source deliver at its
//! own frame rate the way a network stream does; `fail_at` turns the decode of
//! frame `K` into a decoder fault.

use std::time::Instant;

use bytes::Bytes;
use tracing::debug;

use super::frame::{Frame, FrameMetadata, PixelFormat, StreamInfo};
use super::{OpenOptions, VideoSource};
use crate::error::{Result, VReaderError};
use crate::utils::query_pairs;

const DEFAULT_WIDTH: u32 = 320;
const DEFAULT_HEIGHT: u32 = 240;
const DEFAULT_FPS: f64 = 24.0;

pub struct PatternSource {
    info: StreamInfo,
    frames: Option<u64>,
    fail_at: Option<u64>,
    position: u64,
    /// Wall-clock origin used to pace live delivery
    clock: Option<(Instant, u64)>,
}

impl PatternSource {
    pub fn open(uri: &str, options: &OpenOptions) -> Result<Self> {
        let mut width = DEFAULT_WIDTH;
        let mut height = DEFAULT_HEIGHT;
        let mut fps = DEFAULT_FPS;
        let mut frames = None;
        let mut live = false;
        let mut fail_at = None;

        let bad = |key: &str, value: &str| {
            VReaderError::open_failed(uri, format!("bad value {value:?} for {key}"))
        };
        for (key, value) in query_pairs(uri) {
            match key {
                "width" => width = value.parse().map_err(|_| bad(key, value))?,
                "height" => height = value.parse().map_err(|_| bad(key, value))?,
                "fps" => fps = value.parse().map_err(|_| bad(key, value))?,
                "frames" => frames = Some(value.parse().map_err(|_| bad(key, value))?),
                "fail_at" => fail_at = Some(value.parse().map_err(|_| bad(key, value))?),
                "live" => live = value.is_empty() || value == "true" || value == "1",
                other => return Err(VReaderError::open_failed(uri, format!("unknown key {other}"))),
            }
        }
        if width == 0 || height == 0 || fps.is_nan() || fps <= 0.0 {
            return Err(VReaderError::open_failed(uri, "dimensions and fps must be positive"));
        }

        debug!(width, height, fps, ?frames, live, "Pattern source ready");
        Ok(Self {
            info: StreamInfo {
                width,
                height,
                format: PixelFormat::Nv12,
                frame_rate: Some(fps),
                total_frames: if options.analyze { frames } else { None },
                live,
            },
            frames,
            fail_at,
            position: 0,
            clock: None,
        })
    }

    fn render(&self, index: u64) -> Bytes {
        let (w, h) = (self.info.width as usize, self.info.height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let mut data = Vec::with_capacity(w * h + cw * ch * 2);

        // Diagonal gradient scrolling one step per frame with a vertical bar
        // that sweeps across the picture.
        let shift = (index % 256) as usize;
        let bar = (index as usize * 4) % w;
        for y in 0..h {
            for x in 0..w {
                let luma = if x.abs_diff(bar) < 2 {
                    235
                } else {
                    16 + ((x + y + shift) % 220)
                };
                data.push(luma as u8);
            }
        }
        for y in 0..ch {
            for x in 0..cw {
                data.push((64 + (x * 3 + shift) % 128) as u8);
                data.push((64 + (y * 5 + index as usize) % 128) as u8);
            }
        }
        Bytes::from(data)
    }

    fn pace(&mut self) {
        if !self.info.live {
            return;
        }
        let (origin, first) = *self.clock.get_or_insert((Instant::now(), self.position));
        if let Some(interval) = self.info.frame_interval() {
            let due = origin + interval.mul_f64((self.position - first) as f64);
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }
    }
}

impl VideoSource for PatternSource {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.frames.is_some_and(|total| self.position >= total) {
            return Ok(None);
        }
        if self.fail_at == Some(self.position) {
            return Err(VReaderError::Decode(format!(
                "corrupt access unit at frame {}",
                self.position
            )));
        }
        self.pace();

        let index = self.position;
        let pts = self
            .info
            .frame_interval()
            .map(|interval| interval.mul_f64(index as f64));
        let frame = Frame::new(
            self.render(index),
            FrameMetadata {
                index,
                width: self.info.width,
                height: self.info.height,
                stride: self.info.width,
                format: PixelFormat::Nv12,
                pts,
            },
        );
        self.position += 1;
        Ok(Some(frame))
    }

    fn seek(&mut self, index: u64) -> Result<()> {
        if let Some(total) = self.frames {
            if index >= total {
                return Err(VReaderError::OutOfRange { index, total });
            }
        }
        self.position = index;
        self.clock = None;
        Ok(())
    }

    fn probe_total(&mut self) -> Result<Option<u64>> {
        Ok(self.frames)
    }
}
