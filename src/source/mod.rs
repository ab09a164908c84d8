//! Decode backends feeding the pipeline
//!
//! Demuxing and decoding live behind [`VideoSource`]; the pipeline only pulls
//! frames and asks for seeks. [`DefaultBackend`] picks an implementation from
//! the source string.

pub mod decoder;
pub mod frame;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_source;
pub mod mjpeg;
pub mod pattern;

pub use frame::{Frame, FrameMetadata, PixelFormat, StreamInfo};

use tracing::info;

use crate::error::{Result, VReaderError};
use crate::utils::SourceKind;

/// Options consumed when a source is opened
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Run the analysis pass to learn total frame count and native rate.
    pub analyze: bool,
    /// Upper bound for a single blocking pull from the backend.
    pub read_timeout: std::time::Duration,
    /// Rate learned by an earlier open, for sources that cannot report one
    /// without analysis.
    pub frame_rate: Option<f64>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            analyze: true,
            read_timeout: std::time::Duration::from_secs(5),
            frame_rate: None,
        }
    }
}

/// An opened, decoding video stream
pub trait VideoSource: Send {
    fn info(&self) -> &StreamInfo;

    /// Decode the next frame, `None` at end of stream.
    ///
    /// Frames are numbered from zero in decode order; after a successful
    /// [`seek`](Self::seek) the next frame carries the sought index.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Position the stream so that the next decoded frame has `index`.
    fn seek(&mut self, index: u64) -> Result<()>;

    /// Count frames when analysis was skipped at open time. Returns the total
    /// and leaves the read position undefined.
    fn probe_total(&mut self) -> Result<Option<u64>> {
        Ok(self.info().total_frames)
    }
}

/// Opens [`VideoSource`]s from a source string
pub trait SourceBackend: Send + Sync {
    fn open(&self, uri: &str, options: &OpenOptions) -> Result<Box<dyn VideoSource>>;
}

/// Built-in backend set: synthetic patterns, MJPEG files and, when compiled
/// in, GStreamer for everything else.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackend;

impl SourceBackend for DefaultBackend {
    fn open(&self, uri: &str, options: &OpenOptions) -> Result<Box<dyn VideoSource>> {
        let kind = SourceKind::detect(uri);
        info!(%uri, ?kind, analyze = options.analyze, "Opening source");
        match kind {
            SourceKind::Pattern => Ok(Box::new(pattern::PatternSource::open(uri, options)?)),
            SourceKind::Mjpeg => Ok(Box::new(mjpeg::MjpegSource::open(uri, options)?)),
            SourceKind::Container | SourceKind::Network => open_gstreamer(uri, options),
            SourceKind::Missing => Err(VReaderError::open_failed(uri, "no such file")),
        }
    }
}

#[cfg(feature = "gstreamer-pipeline")]
fn open_gstreamer(uri: &str, options: &OpenOptions) -> Result<Box<dyn VideoSource>> {
    Ok(Box::new(gst_source::GstSource::open(uri, options)?))
}

#[cfg(not(feature = "gstreamer-pipeline"))]
fn open_gstreamer(uri: &str, _options: &OpenOptions) -> Result<Box<dyn VideoSource>> {
    Err(VReaderError::open_failed(
        uri,
        "container and network sources need the gstreamer-pipeline feature",
    ))
}
