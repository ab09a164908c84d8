//! Absolute-index frame retrieval
//!
//! Each call opens its own source through the backend, so batches never touch
//! the live frame store and any number of threads can run them at once.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::error::{Result, VReaderError};
use crate::pipeline::processor::{FrameBuffer, FrameParameters, FrameProcessor};
use crate::source::{OpenOptions, SourceBackend, VideoSource};

pub struct BatchReader {
    backend: Arc<dyn SourceBackend>,
    uri: String,
    options: OpenOptions,
    /// Known from the analysis pass; probed per call otherwise.
    total_frames: Option<u64>,
}

impl BatchReader {
    pub fn new(
        backend: Arc<dyn SourceBackend>,
        uri: &str,
        options: OpenOptions,
        total_frames: Option<u64>,
    ) -> Self {
        Self {
            backend,
            uri: uri.to_owned(),
            options,
            total_frames,
        }
    }

    /// Decode `indices` and return them converted, in request order.
    ///
    /// All or nothing: an out-of-range index or any decode failure fails the
    /// whole call.
    #[instrument(level = "debug", skip_all, fields(uri = %self.uri, count = indices.len()))]
    pub fn read(
        &self,
        indices: &[u64],
        params: &FrameParameters,
        processor: &dyn FrameProcessor,
    ) -> Result<Vec<FrameBuffer>> {
        if indices.is_empty() {
            return Ok(Vec::new());
        }

        let mut source = self.backend.open(&self.uri, &self.options)?;
        let total = match self.total_frames.or(source.info().total_frames) {
            Some(total) => Some(total),
            None => {
                let total = source.probe_total()?;
                // Probing leaves the read position undefined
                source = self.backend.open(&self.uri, &self.options)?;
                total
            }
        };
        if let Some(total) = total {
            if let Some(&index) = indices.iter().find(|&&index| index >= total) {
                return Err(VReaderError::OutOfRange { index, total });
            }
        }

        let unique: BTreeSet<u64> = indices.iter().copied().collect();
        debug!(unique = unique.len(), ?total, "Decoding batch");
        let mut decoded = HashMap::with_capacity(unique.len());
        let mut position = 0u64;
        for index in unique {
            let buffer = decode_at(source.as_mut(), &mut position, index, total, params, processor)?;
            decoded.insert(index, buffer);
        }

        indices
            .iter()
            .map(|index| {
                decoded
                    .get(index)
                    .cloned()
                    .ok_or_else(|| VReaderError::Decode(format!("frame {index} was not decoded")))
            })
            .collect()
    }
}

/// Decode one frame, seeking only when the source is not already positioned
/// on `index`.
fn decode_at(
    source: &mut dyn VideoSource,
    position: &mut u64,
    index: u64,
    total: Option<u64>,
    params: &FrameParameters,
    processor: &dyn FrameProcessor,
) -> Result<FrameBuffer> {
    if *position != index {
        source.seek(index)?;
    }
    let frame = source.next_frame()?.ok_or(VReaderError::OutOfRange {
        index,
        total: total.unwrap_or(index),
    })?;
    if frame.index() != index {
        return Err(VReaderError::Decode(format!(
            "seek to {index} landed on frame {}",
            frame.index()
        )));
    }
    *position = index + 1;
    processor.convert(&frame, params)
}
