//! Decode-once, serve-many video frame reader
//!
//! A [`VideoReader`] decodes a source on its own thread into a bounded frame
//! store. Named consumers pull converted frames at their own pace in FAST or
//! BLOCKING mode, and batch callers fetch absolute frame indices through an
//! independent seek path.

pub mod device;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod source;
pub mod utils;

use std::path::Path;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use device::{DeviceRegistry, DeviceSelector};
pub use error::{Result, Status, VReaderError, VREADER_ERROR, VREADER_OK};
pub use logging::{enable_logs, LogLevel};
pub use pipeline::controller::{PipelineInfo, PipelineState, VideoReader, VideoReaderBuilder};
pub use pipeline::pacing::{FrameRateMode, SessionState};
pub use pipeline::processor::{
    ColorOptions, FourCC, FrameBuffer, FrameParameters, FrameProcessor, HostProcessor,
    ResizeOptions, ResizeType,
};
pub use source::{DefaultBackend, Frame, OpenOptions, PixelFormat, SourceBackend, VideoSource};

/// Global configuration that can be atomically swapped at runtime.
///
/// Readers take a snapshot when they are built; swapping the value later only
/// affects readers created afterwards.
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub device: DeviceConfig,
    pub decode: DecodeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub buffer_capacity: usize,
    /// Used when `init_pipeline` is given a zero timeout.
    pub timeout_ms: u64,
    /// Pacing rate for sources whose container carries no frame rate.
    pub default_frame_rate: f64,
    pub analyze: bool,
    pub mode: FrameRateMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub count: usize,
    /// Memory budget per device
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    /// Pin the decode thread to this CPU core
    pub pin_core: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 5,
            timeout_ms: 5_000,
            default_frame_rate: 24.0,
            analyze: true,
            mode: FrameRateMode::Blocking,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            count: 1,
            memory_bytes: 4 << 30,
        }
    }
}

impl Config {
    /// Defaults, overlaid with an optional TOML file, overlaid with
    /// `VREADER_<SECTION>__<KEY>` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("VREADER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

/// Performance metrics collected by one reader
#[derive(Debug, Default, Clone)]
pub struct Metrics {
    pub frames_decoded: u64,
    pub frames_evicted: u64,
    pub frames_delivered: u64,
    pub read_timeouts: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
}
