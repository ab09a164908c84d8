//! Error types shared by every stage of the reader

use std::time::Duration;

use crate::pipeline::processor::FourCC;
use crate::source::frame::PixelFormat;

pub type Result<T> = std::result::Result<T, VReaderError>;

#[derive(Debug, thiserror::Error)]
pub enum VReaderError {
    #[error("failed to open source {uri}: {reason}")]
    Source { uri: String, reason: String },

    #[error("device unavailable: {0}")]
    Device(String),

    #[error("timed out after {0:?} waiting for a frame")]
    Timeout(Duration),

    /// The consumer asked for a frame that was already evicted from the store.
    #[error("frame {requested} expired, oldest retained frame is {oldest}")]
    FrameExpired { requested: u64, oldest: u64 },

    #[error("pipeline closed")]
    Closed,

    #[error("end of stream reached")]
    EndOfStream,

    #[error("frame index {index} is out of range, source has {total} frames")]
    OutOfRange { index: u64, total: u64 },

    #[error("unsupported conversion from {from:?} to {to:?}: {reason}")]
    UnsupportedConversion {
        from: PixelFormat,
        to: FourCC,
        reason: String,
    },

    #[error("decoder fault: {0}")]
    Decode(String),

    #[error("decoder produced no frame for {0:?}")]
    Stalled(Duration),

    /// Backend bug: the decode loop produced a non-consecutive index.
    #[error("frame {got} pushed out of order, expected {expected}")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("pipeline is not initialized")]
    NotInitialized,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl VReaderError {
    pub fn open_failed(uri: impl Into<String>, reason: impl ToString) -> Self {
        Self::Source {
            uri: uri.into(),
            reason: reason.to_string(),
        }
    }

    /// Errors a consumer can retry or recover from without restarting the pipeline.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::FrameExpired { .. })
    }

    /// Errors that end the decode loop of the instance that raised them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::OutOfOrder { .. } | Self::Stalled(_)
        )
    }
}

/// Synchronous status code returned by the init and dump entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
}

pub const VREADER_OK: Status = Status::Ok;
pub const VREADER_ERROR: Status = Status::Error;

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl<T> From<&Result<T>> for Status {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Status::Ok,
            Err(_) => Status::Error,
        }
    }
}
