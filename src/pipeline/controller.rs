//! Pipeline lifecycle and the public reader API
//!
//! A [`VideoReader`] owns at most one pipeline instance: the opened source,
//! the frame store, the consumer sessions, the batch path and the device
//! reservation. `start_processing` runs the decode loop on the calling thread;
//! everything else may be called concurrently from any number of threads.

use std::io::Write;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use tracing::{debug, error, info, instrument, warn};

use crate::device::{DeviceContext, DeviceRegistry, DeviceSelector};
use crate::error::{Result, Status, VReaderError};
use crate::logging::{self, LogLevel};
use crate::pipeline::batch::BatchReader;
use crate::pipeline::frame_store::{CloseReason, FrameStore};
use crate::pipeline::pacing::{FrameRateMode, PacingController, SessionState};
use crate::pipeline::processor::{FrameBuffer, FrameParameters, FrameProcessor, HostProcessor};
use crate::pipeline::watchdog::Watchdog;
use crate::source::{DefaultBackend, OpenOptions, SourceBackend, StreamInfo, VideoSource};
use crate::{Config, Metrics, CONFIG};

/// Longest single wait on consumers before the decode loop feeds the watchdog
const HOLD_SLICE: Duration = Duration::from_millis(50);

/// Lifecycle of one pipeline instance. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PipelineState {
    Created = 0,
    Running = 1,
    Closing = 2,
    Closed = 3,
}

impl PipelineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PipelineState::Created,
            1 => PipelineState::Running,
            2 => PipelineState::Closing,
            _ => PipelineState::Closed,
        }
    }
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(PipelineState::Created as u8))
    }

    fn load(&self) -> PipelineState {
        PipelineState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn advance(&self, from: PipelineState, to: PipelineState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish(&self) {
        self.0.store(PipelineState::Closed as u8, Ordering::Release);
    }
}

/// Snapshot of an initialized pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineInfo {
    pub uri: String,
    pub state: PipelineState,
    pub buffer_capacity: usize,
    pub device: u32,
    pub timeout: Duration,
    pub mode: FrameRateMode,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Option<f64>,
    pub total_frames: Option<u64>,
}

#[derive(Default)]
struct DeliveryStats {
    delivered: AtomicU64,
    latency_us_total: AtomicU64,
    latency_us_max: AtomicU64,
}

impl DeliveryStats {
    fn record(&self, latency: Duration) {
        let us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.latency_us_total.fetch_add(us, Ordering::Relaxed);
        self.latency_us_max.fetch_max(us, Ordering::Relaxed);
        metrics::counter!("vreader.frames_delivered").increment(1);
        metrics::histogram!("vreader.delivery_latency_ms").record(latency.as_secs_f64() * 1000.0);
    }
}

struct Instance {
    uri: String,
    info: StreamInfo,
    mode: FrameRateMode,
    /// Producer cadence in BLOCKING mode
    interval: Duration,
    /// Rate reported by the source once decoding started, when init had none
    learned_rate: OnceCell<f64>,
    state: StateCell,
    store: Arc<FrameStore>,
    pacer: PacingController,
    batch: BatchReader,
    /// Taken by the decode loop
    source: Mutex<Option<Box<dyn VideoSource>>>,
    device: DeviceContext,
    delivery: DeliveryStats,
}

impl Instance {
    fn frame_rate(&self) -> Option<f64> {
        self.info.frame_rate.or_else(|| self.learned_rate.get().copied())
    }

    fn frame_interval(&self) -> Duration {
        self.learned_rate
            .get()
            .map_or(self.interval, |fps| Duration::from_secs_f64(1.0 / fps))
    }

    fn shutdown(&self) {
        loop {
            let advanced = match self.state.load() {
                PipelineState::Created => {
                    self.state.advance(PipelineState::Created, PipelineState::Closed)
                }
                PipelineState::Running => {
                    self.state.advance(PipelineState::Running, PipelineState::Closing)
                }
                PipelineState::Closing | PipelineState::Closed => true,
            };
            if advanced {
                break;
            }
        }
        if self.store.close(CloseReason::Shutdown) {
            info!(uri = %self.uri, "Pipeline shutting down");
        }
        self.pacer.close_all();
    }

    /// Pull frames from `source` into the store until something closes it.
    fn run(&self, mut source: Box<dyn VideoSource>, timeout_ms: &Arc<AtomicU64>) -> CloseReason {
        let paced = self.mode == FrameRateMode::Blocking && !self.info.live;
        // Paced and live sources legitimately go one interval between frames
        let watchdog = match Watchdog::spawn(
            Arc::clone(&self.store),
            Arc::clone(timeout_ms),
            self.interval,
        ) {
            Ok(watchdog) => watchdog,
            Err(e) => return CloseReason::DecoderFault(e.to_string()),
        };

        let mut interval = self.frame_interval();
        let mut start = Instant::now();
        let mut produced: u32 = 0;
        loop {
            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return CloseReason::EndOfStream,
                Err(VReaderError::Stalled(period)) => return CloseReason::Stalled(period),
                Err(e) => return CloseReason::DecoderFault(e.to_string()),
            };
            watchdog.heartbeat(frame.index());

            if self.info.frame_rate.is_none() && self.learned_rate.get().is_none() {
                let reported = source.info().frame_rate.filter(|fps| *fps > 0.0);
                if let Some(fps) = reported {
                    if self.learned_rate.set(fps).is_ok() {
                        info!(uri = %self.uri, fps, "Frame rate reported by the stream");
                        interval = self.frame_interval();
                        start = Instant::now();
                        produced = 0;
                    }
                }
            }

            if paced {
                let due = start + interval.saturating_mul(produced);
                if self.store.sleep_until(due).is_err() {
                    return CloseReason::Shutdown;
                }
            }
            if self.mode == FrameRateMode::Blocking {
                if let Err(reason) = self.wait_for_consumers(&watchdog, timeout_ms, frame.index()) {
                    return reason;
                }
            }
            match self.store.push(frame) {
                Ok(()) => metrics::counter!("vreader.frames_decoded").increment(1),
                Err(VReaderError::Closed) => {
                    return self.store.close_reason().unwrap_or(CloseReason::Shutdown)
                }
                Err(e) => return CloseReason::DecoderFault(e.to_string()),
            }
            produced = produced.saturating_add(1);
        }
    }

    /// Hold the producer while a BLOCKING consumer still needs the oldest
    /// stored frame. A consumer that makes no progress for a whole timeout
    /// loses its claim and its frames get evicted.
    fn wait_for_consumers(
        &self,
        watchdog: &Watchdog,
        timeout_ms: &AtomicU64,
        index: u64,
    ) -> std::result::Result<(), CloseReason> {
        let held_since = Instant::now();
        loop {
            let timeout = Duration::from_millis(timeout_ms.load(Ordering::Relaxed));
            let remaining = timeout.saturating_sub(held_since.elapsed());
            if remaining.is_zero() {
                let lagging = self.store.release_lagging();
                if !lagging.is_empty() {
                    warn!(?lagging, ?timeout, "Consumers made no progress, evicting their frames");
                }
                return Ok(());
            }
            match self.store.wait_for_room(remaining.min(HOLD_SLICE)) {
                Ok(true) => return Ok(()),
                // Waiting on consumers is not a decoder stall
                Ok(false) => watchdog.heartbeat(index),
                Err(_) => return Err(self.store.close_reason().unwrap_or(CloseReason::Shutdown)),
            }
        }
    }
}

/// Builder for [`VideoReader`] with pluggable collaborators
#[derive(Default)]
pub struct VideoReaderBuilder {
    backend: Option<Arc<dyn SourceBackend>>,
    processor: Option<Arc<dyn FrameProcessor>>,
    registry: Option<Arc<DeviceRegistry>>,
    config: Option<Config>,
}

impl VideoReaderBuilder {
    pub fn backend(mut self, backend: impl SourceBackend + 'static) -> Self {
        self.backend = Some(Arc::new(backend));
        self
    }

    pub fn processor(mut self, processor: impl FrameProcessor + 'static) -> Self {
        self.processor = Some(Arc::new(processor));
        self
    }

    /// Account device memory in `registry` instead of the process-wide one.
    pub fn registry(mut self, registry: Arc<DeviceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use `config` instead of a snapshot of [`CONFIG`].
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> VideoReader {
        let config = self
            .config
            .map(Arc::new)
            .unwrap_or_else(|| CONFIG.load_full());
        VideoReader {
            backend: self.backend.unwrap_or_else(|| Arc::new(DefaultBackend)),
            processor: self.processor.unwrap_or_else(|| Arc::new(HostProcessor)),
            registry: self.registry.unwrap_or_else(DeviceRegistry::global),
            analyze: config.pipeline.analyze,
            timeout_ms: Arc::new(AtomicU64::new(config.pipeline.timeout_ms)),
            config,
            instance: None,
        }
    }
}

/// Decode-once, serve-many video reader
pub struct VideoReader {
    config: Arc<Config>,
    backend: Arc<dyn SourceBackend>,
    processor: Arc<dyn FrameProcessor>,
    registry: Arc<DeviceRegistry>,
    analyze: bool,
    timeout_ms: Arc<AtomicU64>,
    instance: Option<Instance>,
}

impl Default for VideoReader {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoReader {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> VideoReaderBuilder {
        VideoReaderBuilder::default()
    }

    fn instance(&self) -> Result<&Instance> {
        self.instance.as_ref().ok_or(VReaderError::NotInitialized)
    }

    /// Skip the analysis pass on the next `init_pipeline`. Total frame count
    /// stays unknown and batch reads probe it on demand.
    pub fn skip_analyze_stage(&mut self) {
        self.analyze = false;
    }

    pub fn enable_logs(&self, level: LogLevel) {
        logging::enable_logs(level);
    }

    /// Open `uri` and prepare a pipeline. Failures are logged and reported
    /// as [`Status::Error`].
    ///
    /// `device` takes a [`DeviceSelector`] or a raw id (negative means any
    /// device). A `timeout_sec` of zero selects the configured default.
    pub fn init_pipeline(
        &mut self,
        uri: &str,
        buffer_capacity: usize,
        device: impl Into<DeviceSelector>,
        timeout_sec: u64,
        mode: FrameRateMode,
    ) -> Status {
        let result = self.try_init_pipeline(uri, buffer_capacity, device.into(), timeout_sec, mode);
        if let Err(e) = &result {
            error!(%uri, error = %e, "Pipeline init failed");
        }
        Status::from(&result)
    }

    #[instrument(level = "debug", skip(self))]
    pub fn try_init_pipeline(
        &mut self,
        uri: &str,
        buffer_capacity: usize,
        device: DeviceSelector,
        timeout_sec: u64,
        mode: FrameRateMode,
    ) -> Result<()> {
        if let Some(previous) = self.instance.take() {
            debug!(uri = %previous.uri, "Tearing down previous pipeline");
            previous.shutdown();
        }

        let timeout_ms = match timeout_sec {
            0 => self.config.pipeline.timeout_ms,
            secs => secs.saturating_mul(1000),
        };
        self.timeout_ms.store(timeout_ms, Ordering::Relaxed);
        let options = OpenOptions {
            analyze: self.analyze,
            read_timeout: Duration::from_millis(timeout_ms),
            frame_rate: None,
        };
        let source = self.backend.open(uri, &options)?;
        let info = source.info().clone();

        let capacity = buffer_capacity.max(1);
        let frame_bytes = info
            .format
            .frame_size(info.width, info.height)
            .unwrap_or(info.width as usize * info.height as usize * 3);
        let device = self
            .registry
            .acquire(device, (frame_bytes as u64).saturating_mul(capacity as u64))?;

        let interval = info.frame_interval().unwrap_or_else(|| {
            let fps = self.config.pipeline.default_frame_rate;
            if fps > 0.0 {
                Duration::from_secs_f64(1.0 / fps)
            } else {
                Duration::ZERO
            }
        });
        let store = Arc::new(FrameStore::new(capacity));
        let batch = BatchReader::new(
            Arc::clone(&self.backend),
            uri,
            OpenOptions {
                analyze: false,
                frame_rate: info.frame_rate,
                ..options
            },
            info.total_frames,
        );

        info!(
            %uri,
            width = info.width,
            height = info.height,
            frame_rate = ?info.frame_rate,
            total_frames = ?info.total_frames,
            capacity,
            device = device.device(),
            ?mode,
            "Pipeline initialized"
        );
        self.instance = Some(Instance {
            uri: uri.to_owned(),
            info,
            mode,
            interval,
            learned_rate: OnceCell::new(),
            state: StateCell::new(),
            pacer: PacingController::new(Arc::clone(&store), mode),
            store,
            batch,
            source: Mutex::new(Some(source)),
            device,
            delivery: DeliveryStats::default(),
        });
        Ok(())
    }

    /// Run the decode loop on the calling thread until end of stream, a
    /// decoder fault, a stall or `end_processing`.
    pub fn start_processing(&self) {
        let Some(instance) = &self.instance else {
            warn!("start_processing called before init_pipeline");
            return;
        };
        if !instance
            .state
            .advance(PipelineState::Created, PipelineState::Running)
        {
            debug!(state = ?instance.state.load(), "Pipeline already started or stopped");
            return;
        }
        let source = instance
            .source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(source) = source else {
            instance.state.finish();
            return;
        };

        if let Some(core) = self.config.decode.pin_core {
            if core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
                debug!(core, "Pinned decode thread");
            } else {
                warn!(core, "Could not pin decode thread");
            }
        }

        info!(uri = %instance.uri, mode = ?instance.mode, "Decode loop started");
        let reason = instance.run(source, &self.timeout_ms);
        instance.store.close(reason.clone());
        instance.state.finish();

        let stats = instance.store.stats();
        match &reason {
            CloseReason::DecoderFault(msg) => {
                error!(uri = %instance.uri, error = %msg, "Decode loop failed")
            }
            CloseReason::Stalled(period) => {
                error!(uri = %instance.uri, ?period, "Decode loop stalled")
            }
            _ => info!(
                uri = %instance.uri,
                ?reason,
                decoded = stats.frames_written,
                evicted = stats.frames_evicted,
                "Decode loop finished"
            ),
        }
    }

    /// Stop the pipeline and release every blocked consumer. Safe to call any
    /// number of times, from any thread.
    pub fn end_processing(&self) {
        if let Some(instance) = &self.instance {
            instance.shutdown();
        }
    }

    /// Next frame for `consumer`, converted per `params`, with its index.
    ///
    /// A non-zero `delay` is the minimum gap since the previous delivery to
    /// the same consumer. Zero adds no wait; delays cannot be negative.
    pub fn get_frame(
        &self,
        consumer: &str,
        delay: Duration,
        params: &FrameParameters,
    ) -> Result<(FrameBuffer, u64)> {
        let instance = self.instance()?;
        let (buffer, frame) =
            instance
                .pacer
                .deliver(consumer, delay, self.timeout(), |frame| {
                    self.processor.convert(frame, params)
                })?;
        instance.delivery.record(frame.timestamp.elapsed());
        Ok((buffer, frame.index()))
    }

    /// Frames at absolute `indices`, in request order. Fails as a whole if
    /// any index is out of range.
    pub fn get_frame_absolute(
        &self,
        indices: &[u64],
        params: &FrameParameters,
    ) -> Result<Vec<FrameBuffer>> {
        self.instance()?
            .batch
            .read(indices, params, self.processor.as_ref())
    }

    /// Write the raw bytes of `buffer` to `writer`.
    pub fn dump_frame<W: Write + ?Sized>(
        &self,
        buffer: &FrameBuffer,
        params: &FrameParameters,
        writer: &mut W,
    ) -> Status {
        let result = write_raw(buffer, params, writer);
        if let Err(e) = &result {
            error!(error = %e, "Failed to dump frame");
        }
        Status::from(&result)
    }

    pub fn set_timeout(&self, ms: u64) {
        self.timeout_ms.store(ms, Ordering::Relaxed);
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms.load(Ordering::Relaxed)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms())
    }

    /// Native frame interval, from analysis or from the decoded stream, or
    /// the configured fallback rate's.
    pub fn frame_interval(&self) -> Option<Duration> {
        self.instance.as_ref().map(Instance::frame_interval)
    }

    pub fn frame_rate(&self) -> Option<f64> {
        self.instance.as_ref().and_then(Instance::frame_rate)
    }

    pub fn total_frames(&self) -> Option<u64> {
        self.instance.as_ref().and_then(|i| i.info.total_frames)
    }

    pub fn state(&self) -> Option<PipelineState> {
        self.instance.as_ref().map(|i| i.state.load())
    }

    pub fn session_state(&self, consumer: &str) -> Option<SessionState> {
        self.instance
            .as_ref()
            .and_then(|i| i.pacer.session_state(consumer))
    }

    pub fn pipeline_info(&self) -> Option<PipelineInfo> {
        let instance = self.instance.as_ref()?;
        Some(PipelineInfo {
            uri: instance.uri.clone(),
            state: instance.state.load(),
            buffer_capacity: instance.store.capacity(),
            device: instance.device.device(),
            timeout: self.timeout(),
            mode: instance.mode,
            width: instance.info.width,
            height: instance.info.height,
            frame_rate: instance.frame_rate(),
            total_frames: instance.info.total_frames,
        })
    }

    pub fn metrics(&self) -> Metrics {
        let Some(instance) = &self.instance else {
            return Metrics::default();
        };
        let store = instance.store.stats();
        let delivered = instance.delivery.delivered.load(Ordering::Relaxed);
        let total_us = instance.delivery.latency_us_total.load(Ordering::Relaxed);
        let max_us = instance.delivery.latency_us_max.load(Ordering::Relaxed);
        Metrics {
            frames_decoded: store.frames_written,
            frames_evicted: store.frames_evicted,
            frames_delivered: delivered,
            read_timeouts: store.read_timeouts,
            avg_latency_ms: if delivered == 0 {
                0.0
            } else {
                total_us as f64 / delivered as f64 / 1000.0
            },
            max_latency_ms: max_us as f64 / 1000.0,
        }
    }
}

impl Drop for VideoReader {
    fn drop(&mut self) {
        self.end_processing();
    }
}

fn write_raw<W: Write + ?Sized>(
    buffer: &FrameBuffer,
    params: &FrameParameters,
    writer: &mut W,
) -> Result<()> {
    if buffer.fourcc != params.color.dst_fourcc {
        return Err(VReaderError::InvalidParameter(format!(
            "buffer is {:?} but {:?} was requested",
            buffer.fourcc, params.color.dst_fourcc
        )));
    }
    let size = buffer.fourcc.frame_size(buffer.width, buffer.height);
    let payload = buffer.data.get(..size).ok_or_else(|| {
        VReaderError::InvalidParameter(format!(
            "buffer holds {} bytes, {:?} {}x{} needs {size}",
            buffer.data.len(),
            buffer.fourcc,
            buffer.width,
            buffer.height
        ))
    })?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::processor::{ColorOptions, FourCC, ResizeOptions};
    use crate::source::{Frame, FrameMetadata, PixelFormat};
    use crate::DeviceConfig;
    use bytes::Bytes;
    use std::thread;

    const CONTAINER_FRAMES: u64 = 6;

    /// Behaves like a demuxed container: the rate comes from analysis, an
    /// open hint or the first decoded frame, and seeking needs it.
    struct ContainerSource {
        info: StreamInfo,
        next: u64,
    }

    impl VideoSource for ContainerSource {
        fn info(&self) -> &StreamInfo {
            &self.info
        }

        fn next_frame(&mut self) -> Result<Option<Frame>> {
            if self.next >= CONTAINER_FRAMES {
                return Ok(None);
            }
            self.info.frame_rate.get_or_insert(50.0);
            let frame = Frame::new(
                Bytes::from(vec![self.next as u8 * 10; 16]),
                FrameMetadata {
                    index: self.next,
                    width: 4,
                    height: 4,
                    stride: 4,
                    format: PixelFormat::Y800,
                    pts: None,
                },
            );
            self.next += 1;
            Ok(Some(frame))
        }

        fn seek(&mut self, index: u64) -> Result<()> {
            if self.info.frame_rate.is_none() {
                return Err(VReaderError::Decode("cannot seek without a frame rate".into()));
            }
            self.next = index;
            Ok(())
        }

        fn probe_total(&mut self) -> Result<Option<u64>> {
            Ok(Some(CONTAINER_FRAMES))
        }
    }

    struct ContainerBackend;

    impl SourceBackend for ContainerBackend {
        fn open(&self, _uri: &str, options: &OpenOptions) -> Result<Box<dyn VideoSource>> {
            Ok(Box::new(ContainerSource {
                info: StreamInfo {
                    width: 4,
                    height: 4,
                    format: PixelFormat::Y800,
                    frame_rate: if options.analyze {
                        Some(50.0)
                    } else {
                        options.frame_rate
                    },
                    total_frames: options.analyze.then_some(CONTAINER_FRAMES),
                    live: false,
                },
                next: 0,
            }))
        }
    }

    fn container_reader() -> VideoReader {
        VideoReader::builder()
            .backend(ContainerBackend)
            .registry(Arc::new(DeviceRegistry::new(&DeviceConfig::default())))
            .build()
    }

    fn reader() -> VideoReader {
        VideoReader::builder()
            .registry(Arc::new(DeviceRegistry::new(&DeviceConfig::default())))
            .build()
    }

    fn rgb() -> FrameParameters {
        FrameParameters::new(ResizeOptions::new(0, 0), ColorOptions::new(FourCC::Rgb24))
    }

    #[test]
    fn calls_before_init_fail_cleanly() {
        let reader = reader();
        assert!(matches!(
            reader.get_frame("a", Duration::ZERO, &rgb()),
            Err(VReaderError::NotInitialized)
        ));
        reader.start_processing();
        reader.end_processing();
        assert_eq!(reader.state(), None);
    }

    #[test]
    fn bad_source_reports_error_status() {
        let mut reader = reader();
        let status = reader.init_pipeline("/missing.mjpeg", 4, 0, 1, FrameRateMode::Blocking);
        assert_eq!(status, Status::Error);
        assert_eq!(reader.state(), None);
    }

    #[test]
    fn zero_timeout_uses_configured_default() {
        let mut reader = reader();
        let status = reader.init_pipeline(
            "pattern://?width=4&height=4&frames=2",
            2,
            -1,
            0,
            FrameRateMode::Fast,
        );
        assert!(status.is_ok());
        assert_eq!(reader.timeout_ms(), 5_000);
        reader.set_timeout(250);
        assert_eq!(reader.timeout(), Duration::from_millis(250));
    }

    #[test]
    fn stop_before_start_closes_the_pipeline() {
        let mut reader = reader();
        reader.init_pipeline("pattern://?frames=3", 2, 0, 1, FrameRateMode::Blocking);
        assert_eq!(reader.state(), Some(PipelineState::Created));
        reader.end_processing();
        reader.end_processing();
        assert_eq!(reader.state(), Some(PipelineState::Closed));
        // A stopped pipeline never starts
        reader.start_processing();
        assert_eq!(reader.metrics().frames_decoded, 0);
    }

    #[test]
    fn decodes_to_end_of_stream() {
        let mut reader = reader();
        reader.init_pipeline(
            "pattern://?width=8&height=8&fps=500&frames=5",
            8,
            0,
            1,
            FrameRateMode::Blocking,
        );
        reader.start_processing();
        assert_eq!(reader.state(), Some(PipelineState::Closed));
        let indices: Vec<u64> = (0..5)
            .map(|_| reader.get_frame("c", Duration::ZERO, &rgb()).unwrap().1)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert!(matches!(
            reader.get_frame("c", Duration::ZERO, &rgb()),
            Err(VReaderError::EndOfStream)
        ));
        let metrics = reader.metrics();
        assert_eq!(metrics.frames_decoded, 5);
        assert_eq!(metrics.frames_delivered, 5);
    }

    #[test]
    fn decoder_fault_ends_the_instance() {
        let mut reader = reader();
        reader.init_pipeline(
            "pattern://?width=8&height=8&fps=500&frames=10&fail_at=2",
            8,
            0,
            1,
            FrameRateMode::Blocking,
        );
        reader.start_processing();
        assert_eq!(reader.get_frame("c", Duration::ZERO, &rgb()).unwrap().1, 0);
        assert_eq!(reader.get_frame("c", Duration::ZERO, &rgb()).unwrap().1, 1);
        assert!(matches!(
            reader.get_frame("c", Duration::ZERO, &rgb()),
            Err(VReaderError::Decode(_))
        ));
    }

    #[test]
    fn reinit_releases_the_previous_reservation() {
        let registry = Arc::new(DeviceRegistry::new(&DeviceConfig::default()));
        let mut reader = VideoReader::builder()
            .registry(Arc::clone(&registry))
            .build();
        reader.init_pipeline("pattern://?width=8&height=8", 4, 0, 1, FrameRateMode::Fast);
        let first = registry.total_reserved();
        assert!(first > 0);
        reader.init_pipeline("pattern://?width=8&height=8", 4, 0, 1, FrameRateMode::Fast);
        assert_eq!(registry.total_reserved(), first);
        drop(reader);
        assert_eq!(registry.total_reserved(), 0);
    }

    #[test]
    fn end_processing_stops_a_running_loop() {
        let mut reader = reader();
        reader.init_pipeline("pattern://?width=8&height=8&fps=200", 4, 0, 1, FrameRateMode::Blocking);
        thread::scope(|s| {
            s.spawn(|| reader.start_processing());
            reader.get_frame("c", Duration::ZERO, &rgb()).unwrap();
            reader.end_processing();
        });
        assert_eq!(reader.state(), Some(PipelineState::Closed));
        assert!(matches!(
            reader.get_frame("c", Duration::ZERO, &rgb()),
            Err(VReaderError::Closed)
        ));
    }

    #[test]
    fn dump_writes_exact_frame_size() {
        let reader = reader();
        let buffer = FrameBuffer {
            data: bytes::Bytes::from(vec![7u8; 4 * 2 * 3 / 2]),
            width: 4,
            height: 2,
            fourcc: FourCC::Nv12,
        };
        let params = FrameParameters::new(ResizeOptions::new(4, 2), ColorOptions::new(FourCC::Nv12));
        let mut out = Vec::new();
        assert!(reader.dump_frame(&buffer, &params, &mut out).is_ok());
        assert_eq!(out.len(), 12);

        let mismatched = FrameParameters::new(ResizeOptions::new(4, 2), ColorOptions::new(FourCC::Rgb24));
        assert_eq!(reader.dump_frame(&buffer, &mismatched, &mut out), Status::Error);
    }

    #[test]
    fn batch_reuses_the_analysed_frame_rate() {
        let mut reader = container_reader();
        assert!(reader
            .init_pipeline("clip.mp4", 2, 0, 1, FrameRateMode::Blocking)
            .is_ok());
        let gray = FrameParameters::new(ResizeOptions::new(0, 0), ColorOptions::new(FourCC::Y800));
        let out = reader.get_frame_absolute(&[4, 1], &gray).unwrap();
        assert_eq!(out[0].data[0], 40);
        assert_eq!(out[1].data[0], 10);
    }

    #[test]
    fn pacing_adopts_the_rate_reported_by_the_stream() {
        let mut reader = container_reader();
        reader.skip_analyze_stage();
        reader.init_pipeline("clip.mp4", 8, 0, 1, FrameRateMode::Blocking);
        assert_eq!(reader.frame_rate(), None);
        assert_eq!(reader.frame_interval(), Some(Duration::from_secs_f64(1.0 / 24.0)));

        let start = Instant::now();
        reader.start_processing();
        // Six frames at 50 fps, paced from the first one
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_millis(200));
        assert_eq!(reader.frame_rate(), Some(50.0));
        assert_eq!(reader.frame_interval(), Some(Duration::from_millis(20)));
        assert_eq!(reader.pipeline_info().unwrap().frame_rate, Some(50.0));
    }
}
