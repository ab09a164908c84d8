pub mod batch;
pub mod controller;
pub mod frame_store;
pub mod pacing;
pub mod processor;
pub mod watchdog;

pub use controller::{PipelineInfo, PipelineState, VideoReader, VideoReaderBuilder};
pub use frame_store::{CloseReason, FrameStore, StoreStats};
pub use pacing::{FrameRateMode, SessionState};
