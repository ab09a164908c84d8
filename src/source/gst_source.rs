//! GStreamer-based source for container files and network streams
//!
//! `uridecodebin` picks the best available (hardware first) decoder; frames are
//! converted to NV12 and pulled from an appsink.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_pbutils as gst_pbutils;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use super::frame::{Frame, FrameMetadata, PixelFormat, StreamInfo};
use super::{OpenOptions, VideoSource};
use crate::error::{Result, VReaderError};

pub struct GstSource {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    uri: String,
    info: StreamInfo,
    position: u64,
    read_timeout: Duration,
}

impl GstSource {
    pub fn open(source: &str, options: &OpenOptions) -> Result<Self> {
        gst::init().map_err(|e| VReaderError::open_failed(source, format!("GStreamer init: {e}")))?;

        let uri = to_uri(source)?;
        let live = !uri.starts_with("file://");

        let mut info = StreamInfo {
            width: 0,
            height: 0,
            format: PixelFormat::Nv12,
            frame_rate: options.frame_rate,
            total_frames: None,
            live,
        };
        if options.analyze {
            discover(&uri, options.read_timeout, &mut info)?;
        }

        let pipeline_str = format!(
            "uridecodebin uri=\"{uri}\" ! \
             videoconvert ! \
             video/x-raw,format=NV12 ! \
             appsink name=appsink"
        );
        info!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| VReaderError::open_failed(&uri, e))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| VReaderError::open_failed(&uri, "failed to create pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| VReaderError::open_failed(&uri, "failed to find appsink element"))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| VReaderError::open_failed(&uri, "failed to cast to AppSink"))?;

        // Keep every frame and ignore the clock; the reader paces delivery
        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 3u32);
        appsink.set_property("drop", false);
        appsink.set_property("sync", false);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| VReaderError::open_failed(&uri, format!("failed to start: {e:?}")))?;

        Ok(Self {
            pipeline,
            appsink,
            uri,
            info,
            position: 0,
            read_timeout: options.read_timeout,
        })
    }

    fn bus_error(&self) -> Option<VReaderError> {
        let bus = self.pipeline.bus()?;
        let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
        match msg.view() {
            gst::MessageView::Error(err) => Some(VReaderError::Decode(format!(
                "{}: {}",
                self.uri,
                err.error()
            ))),
            _ => None,
        }
    }

    /// Wait for a pending preroll or flushing seek to finish.
    fn wait_settled(&self) -> bool {
        settled(self.pipeline.state(Some(gst::ClockTime::from_seconds(5))).0)
    }

    /// Frame rate from the caps negotiated on the appsink, once prerolled.
    fn negotiated_rate(&self) -> Option<f64> {
        let caps = self.appsink.static_pad("sink")?.current_caps()?;
        let video_info = gst_video::VideoInfo::from_caps(&caps).ok()?;
        fraction_rate(video_info.fps())
    }
}

fn fraction_rate(rate: gst::Fraction) -> Option<f64> {
    (rate.numer() > 0 && rate.denom() > 0)
        .then(|| f64::from(rate.numer()) / f64::from(rate.denom()))
}

/// Whether a state change completed, as opposed to failing or still pending.
fn settled(result: std::result::Result<gst::StateChangeSuccess, gst::StateChangeError>) -> bool {
    matches!(
        result,
        Ok(gst::StateChangeSuccess::Success | gst::StateChangeSuccess::NoPreroll)
    )
}

fn to_uri(source: &str) -> Result<String> {
    if source.contains("://") {
        return Ok(source.to_string());
    }
    let path = Path::new(source)
        .canonicalize()
        .map_err(|e| VReaderError::open_failed(source, e))?;
    Ok(format!("file://{}", path.display()))
}

/// Analysis pass: frame rate, dimensions and frame count from the container.
fn discover(uri: &str, timeout: Duration, info: &mut StreamInfo) -> Result<()> {
    let discoverer = gst_pbutils::Discoverer::new(gst::ClockTime::from_seconds(
        timeout.as_secs().max(1),
    ))
    .map_err(|e| VReaderError::open_failed(uri, e))?;
    let result = discoverer
        .discover_uri(uri)
        .map_err(|e| VReaderError::open_failed(uri, e))?;

    let stream = result
        .video_streams()
        .into_iter()
        .next()
        .ok_or_else(|| VReaderError::open_failed(uri, "no video stream"))?;
    if let Some(fps) = fraction_rate(stream.framerate()) {
        info.frame_rate = Some(fps);
    }
    info.width = stream.width();
    info.height = stream.height();
    if !info.live {
        info.total_frames = match (result.duration(), info.frame_rate) {
            (Some(duration), Some(fps)) => Some((duration.seconds_f64() * fps).round() as u64),
            _ => None,
        };
    }
    debug!(?info, "Discovered stream");
    Ok(())
}

/// Copy the planes out of a possibly padded NV12 buffer into a tight layout.
fn pack_nv12(data: &[u8], video_info: &gst_video::VideoInfo) -> Result<Vec<u8>> {
    let width = video_info.width() as usize;
    let height = video_info.height() as usize;
    let offsets = video_info.offset();
    let strides = video_info.stride();
    let planes = [(height, width), (height.div_ceil(2), width.div_ceil(2) * 2)];

    let mut packed = Vec::with_capacity(width * height + planes[1].0 * planes[1].1);
    for (plane, (rows, row_len)) in planes.into_iter().enumerate() {
        let stride = strides[plane] as usize;
        for row in 0..rows {
            let start = offsets[plane] + row * stride;
            let line = data
                .get(start..start + row_len)
                .ok_or_else(|| VReaderError::Decode("short NV12 buffer".into()))?;
            packed.extend_from_slice(line);
        }
    }
    Ok(packed)
}

impl VideoSource for GstSource {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let timeout = gst::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            if let Some(err) = self.bus_error() {
                return Err(err);
            }
            if self.appsink.is_eos() {
                return Ok(None);
            }
            warn!(uri = %self.uri, "No sample within {:?}", self.read_timeout);
            return Err(VReaderError::Stalled(self.read_timeout));
        };

        let buffer = sample
            .buffer()
            .ok_or_else(|| VReaderError::Decode("sample contains no buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| VReaderError::Decode("failed to map buffer".into()))?;
        let caps = sample
            .caps()
            .ok_or_else(|| VReaderError::Decode("sample has no caps".into()))?;
        let video_info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| VReaderError::Decode("failed to parse video info from caps".into()))?;

        let data = pack_nv12(map.as_slice(), &video_info)?;
        self.info.width = video_info.width();
        self.info.height = video_info.height();
        if self.info.frame_rate.is_none() {
            self.info.frame_rate = fraction_rate(video_info.fps());
            if let Some(fps) = self.info.frame_rate {
                debug!(uri = %self.uri, fps, "Frame rate from stream caps");
            }
        }

        let frame = Frame::new(
            Bytes::from(data),
            FrameMetadata {
                index: self.position,
                width: video_info.width(),
                height: video_info.height(),
                stride: video_info.width(),
                format: PixelFormat::Nv12,
                pts: buffer.pts().map(|pts| Duration::from_nanos(pts.nseconds())),
            },
        );
        self.position += 1;
        Ok(Some(frame))
    }

    fn seek(&mut self, index: u64) -> Result<()> {
        if let Some(total) = self.info.total_frames {
            if index >= total {
                return Err(VReaderError::OutOfRange { index, total });
            }
        }
        if self.info.frame_rate.is_none() {
            // Caps are only negotiated once the pipeline has prerolled
            if self.wait_settled() {
                self.info.frame_rate = self.negotiated_rate();
            }
        }
        let fps = self
            .info
            .frame_rate
            .ok_or_else(|| VReaderError::Decode("cannot seek without a frame rate".into()))?;
        let position = gst::ClockTime::from_nseconds((index as f64 / fps * 1e9).round() as u64);
        self.pipeline
            .seek_simple(gst::SeekFlags::FLUSH | gst::SeekFlags::ACCURATE, position)
            .map_err(|e| VReaderError::Decode(format!("seek to frame {index}: {e}")))?;
        // A sample pulled before the flush finishes would carry the wrong index
        if !self.wait_settled() {
            return Err(VReaderError::Decode(format!(
                "seek to frame {index} did not complete"
            )));
        }
        self.position = index;
        Ok(())
    }

    fn probe_total(&mut self) -> Result<Option<u64>> {
        if self.info.total_frames.is_none() && !self.info.live {
            let mut info = self.info.clone();
            discover(&self.uri, self.read_timeout, &mut info)?;
            self.info = info;
        }
        Ok(self.info.total_frames)
    }
}

impl Drop for GstSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
