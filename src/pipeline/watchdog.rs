//! Decode stall detection
//!
//! The decode loop sends a heartbeat per frame. If none arrives within the
//! reader timeout (plus one frame interval of pacing slack) the watchdog
//! closes the store with [`CloseReason::Stalled`] so blocked consumers are
//! released instead of waiting on a backend that will never deliver.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::error::Result;
use crate::pipeline::frame_store::{CloseReason, FrameStore};

pub struct Watchdog {
    heartbeat: Option<Sender<u64>>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// `timeout_ms` is re-read on every wait, so `set_timeout` applies to a
    /// running pipeline.
    pub fn spawn(
        store: Arc<FrameStore>,
        timeout_ms: Arc<AtomicU64>,
        slack: Duration,
    ) -> Result<Self> {
        let (tx, rx) = flume::unbounded::<u64>();
        let handle = thread::Builder::new()
            .name("vreader-watchdog".into())
            .spawn(move || loop {
                let bound = Duration::from_millis(timeout_ms.load(Ordering::Relaxed)) + slack;
                match rx.recv_timeout(bound) {
                    Ok(_) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        debug!("Watchdog stopped");
                        break;
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if store.close(CloseReason::Stalled(bound)) {
                            warn!(?bound, "Decoder stalled, closing frame store");
                        }
                        break;
                    }
                }
            })?;
        Ok(Self {
            heartbeat: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn heartbeat(&self, index: u64) {
        if let Some(tx) = &self.heartbeat {
            let _ = tx.send(index);
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        // Disconnecting the channel ends the thread without a stall verdict
        self.heartbeat.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
