//! vreader command line front-end
//!
//! Decodes a source once and serves it to several consumers, optionally
//! dumping every delivered frame as raw bytes.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use tokio::task::JoinSet;
use tracing::{info, warn};

use vreader::{
    ColorOptions, Config, FourCC, FrameParameters, FrameRateMode, LogLevel, ResizeOptions,
    VReaderError, VideoReader,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Fast,
    Blocking,
}

impl From<Mode> for FrameRateMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Fast => FrameRateMode::Fast,
            Mode::Blocking => FrameRateMode::Blocking,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Verbosity {
    Off,
    Low,
    Medium,
    High,
}

impl From<Verbosity> for LogLevel {
    fn from(verbosity: Verbosity) -> Self {
        match verbosity {
            Verbosity::Off => LogLevel::Off,
            Verbosity::Low => LogLevel::Low,
            Verbosity::Medium => LogLevel::Medium,
            Verbosity::High => LogLevel::High,
        }
    }
}

/// Serve decoded frames from one source to several consumers
#[derive(Parser, Debug)]
#[command(name = "vreader", version)]
struct Args {
    /// File path, network URL or pattern:// test source
    source: String,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Delivery mode, defaults to the configured one
    #[arg(short, long, value_enum)]
    mode: Option<Mode>,

    /// Frames kept in the store
    #[arg(long)]
    capacity: Option<usize>,

    /// Device id, negative lets the registry choose
    #[arg(short, long, default_value_t = -1, allow_hyphen_values = true)]
    device: i32,

    /// Blocking read timeout in seconds, 0 for the configured default
    #[arg(short, long, default_value_t = 0)]
    timeout: u64,

    /// Number of concurrent consumers
    #[arg(long, default_value_t = 1)]
    consumers: usize,

    /// Frames each consumer pulls before stopping
    #[arg(short = 'n', long, default_value_t = 100)]
    frames: u64,

    /// Minimum gap between deliveries to one consumer, in milliseconds
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Output pixel format (rgb24, bgr24, nv12, y800, uyvy, yuv444, rgbp, bgrp)
    #[arg(short, long, default_value = "rgb24")]
    format: FourCC,

    /// Output width, 0 keeps the source width
    #[arg(long, default_value_t = 0)]
    width: u32,

    /// Output height, 0 keeps the source height
    #[arg(long, default_value_t = 0)]
    height: u32,

    /// Fetch these absolute indices through the batch path instead of streaming
    #[arg(long, value_delimiter = ',')]
    batch: Vec<u64>,

    /// Directory for raw frame dumps
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Skip the analysis pass at init
    #[arg(long)]
    skip_analyze: bool,

    #[arg(long, value_enum, default_value = "low")]
    log_level: Verbosity,
}

fn dump(
    reader: &VideoReader,
    dir: &Path,
    name: &str,
    index: u64,
    buffer: &vreader::FrameBuffer,
    params: &FrameParameters,
) -> Result<()> {
    let path = dir.join(format!("{name}_{index:06}.raw"));
    let mut file = BufWriter::new(File::create(&path)?);
    if !reader.dump_frame(buffer, params, &mut file).is_ok() {
        return Err(eyre!("failed to dump {}", path.display()));
    }
    Ok(())
}

/// Pull up to `frames` frames as `name`; returns how many were delivered.
fn consume(
    reader: &VideoReader,
    name: &str,
    frames: u64,
    delay: Duration,
    params: &FrameParameters,
    out: Option<&Path>,
) -> Result<u64> {
    let mut served = 0;
    while served < frames {
        match reader.get_frame(name, delay, params) {
            Ok((buffer, index)) => {
                served += 1;
                if let Some(dir) = out {
                    dump(reader, dir, name, index, &buffer, params)?;
                }
            }
            Err(e) if e.is_recoverable() => warn!(consumer = name, error = %e, "Retrying"),
            Err(VReaderError::EndOfStream | VReaderError::Closed) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(served)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    vreader::enable_logs(args.log_level.into());

    let config = Config::load(args.config.as_deref())?;
    vreader::CONFIG.store(Arc::new(config.clone()));
    if let Some(dir) = &args.out {
        fs::create_dir_all(dir)?;
    }

    let mut reader = VideoReader::new();
    if args.skip_analyze {
        reader.skip_analyze_stage();
    }
    reader.try_init_pipeline(
        &args.source,
        args.capacity.unwrap_or(config.pipeline.buffer_capacity),
        args.device.into(),
        args.timeout,
        args.mode.map_or(config.pipeline.mode, Into::into),
    )?;
    let params = FrameParameters::new(
        ResizeOptions::new(args.width, args.height),
        ColorOptions::new(args.format),
    );

    if !args.batch.is_empty() {
        let buffers = reader.get_frame_absolute(&args.batch, &params)?;
        if let Some(dir) = &args.out {
            for (index, buffer) in args.batch.iter().zip(&buffers) {
                dump(&reader, dir, "batch", *index, buffer, &params)?;
            }
        }
        info!(frames = buffers.len(), "Batch complete");
        return Ok(());
    }

    let reader = Arc::new(reader);
    let decoder = tokio::task::spawn_blocking({
        let reader = Arc::clone(&reader);
        move || reader.start_processing()
    });

    let mut consumers = JoinSet::new();
    for i in 0..args.consumers {
        let reader = Arc::clone(&reader);
        let out = args.out.clone();
        let (frames, delay) = (args.frames, Duration::from_millis(args.delay_ms));
        consumers.spawn_blocking(move || {
            let name = format!("consumer-{i}");
            consume(&reader, &name, frames, delay, &params, out.as_deref()).map(|n| (name, n))
        });
    }

    loop {
        tokio::select! {
            next = consumers.join_next() => match next {
                Some(result) => {
                    let (name, served) = result??;
                    info!(consumer = %name, served, "Consumer finished");
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping pipeline");
                reader.end_processing();
            }
        }
    }

    reader.end_processing();
    decoder.await?;

    let metrics = reader.metrics();
    info!(
        decoded = metrics.frames_decoded,
        evicted = metrics.frames_evicted,
        delivered = metrics.frames_delivered,
        timeouts = metrics.read_timeouts,
        avg_latency_ms = metrics.avg_latency_ms,
        max_latency_ms = metrics.max_latency_ms,
        "Done"
    );
    Ok(())
}
