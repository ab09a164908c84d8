//! Per-consumer delivery pacing
//!
//! Every consumer name owns a [`ConsumerSession`]. A [`PacingStrategy`],
//! chosen once per pipeline from [`FrameRateMode`], decides which stored frame
//! the session gets next:
//!
//! * FAST hands out the newest frame past the last one served, skipping
//!   anything the consumer was too slow to see.
//! * BLOCKING hands out exactly `last_served + 1`, waiting for it if needed,
//!   and claims that index in the store so the producer does not evict it.
//!
//! Sessions only hold the shared store handle, never the reader itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{Result, VReaderError};
use crate::pipeline::frame_store::FrameStore;
use crate::source::Frame;

/// Delivery mode, fixed for the lifetime of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FrameRateMode {
    /// Lowest latency; frames may be skipped.
    Fast,
    /// Every frame, in order, at the stream's native rate.
    #[default]
    Blocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Blocked on the store or on the requested delay
    Waiting,
    /// A frame was selected and is being converted
    Delivering,
    Closed,
}

#[derive(Debug)]
pub struct ConsumerSession {
    name: String,
    /// `None` until the first delivery
    last_served: Option<u64>,
    last_delivery: Option<Instant>,
    requested_delay: Duration,
    state: SessionState,
}

impl ConsumerSession {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            last_served: None,
            last_delivery: None,
            requested_delay: Duration::ZERO,
            state: SessionState::Idle,
        }
    }

    pub fn last_served(&self) -> Option<u64> {
        self.last_served
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Delay passed with the most recent request
    pub fn requested_delay(&self) -> Duration {
        self.requested_delay
    }

    /// Move past evicted frames so the next request lands inside the window.
    fn catch_up(&mut self, oldest: u64) {
        if let Some(skip_to) = oldest.checked_sub(1) {
            if self.last_served.map_or(true, |served| served < skip_to) {
                debug!(consumer = %self.name, oldest, "Consumer fell behind, skipping ahead");
                self.last_served = Some(skip_to);
            }
        }
    }
}

/// Frame selection policy for one delivery mode
pub trait PacingStrategy: Send + Sync {
    fn mode(&self) -> FrameRateMode;

    fn select(
        &self,
        store: &FrameStore,
        session: &ConsumerSession,
        timeout: Duration,
    ) -> Result<Arc<Frame>>;

    /// Called once `session` has been handed a frame.
    fn delivered(&self, _store: &FrameStore, _session: &ConsumerSession) {}
}

pub struct FastPacer;

impl PacingStrategy for FastPacer {
    fn mode(&self) -> FrameRateMode {
        FrameRateMode::Fast
    }

    fn select(
        &self,
        store: &FrameStore,
        session: &ConsumerSession,
        timeout: Duration,
    ) -> Result<Arc<Frame>> {
        store.read_newer(session.last_served, timeout)
    }
}

pub struct BlockingPacer;

impl PacingStrategy for BlockingPacer {
    fn mode(&self) -> FrameRateMode {
        FrameRateMode::Blocking
    }

    fn select(
        &self,
        store: &FrameStore,
        session: &ConsumerSession,
        timeout: Duration,
    ) -> Result<Arc<Frame>> {
        // A new session starts at the oldest retained frame, or the first
        // frame the decoder will produce.
        let target = match session.last_served {
            Some(served) => served + 1,
            None => store.oldest_index().unwrap_or(0),
        };
        store.claim(&session.name, target);
        store.read(target, timeout)
    }

    fn delivered(&self, store: &FrameStore, session: &ConsumerSession) {
        if let Some(served) = session.last_served {
            store.claim(&session.name, served + 1);
        }
    }
}

pub fn strategy_for(mode: FrameRateMode) -> Box<dyn PacingStrategy> {
    match mode {
        FrameRateMode::Fast => Box::new(FastPacer),
        FrameRateMode::Blocking => Box::new(BlockingPacer),
    }
}

/// Session table plus the strategy shared by all sessions of one pipeline
pub struct PacingController {
    store: Arc<FrameStore>,
    strategy: Box<dyn PacingStrategy>,
    sessions: Mutex<HashMap<String, Arc<Mutex<ConsumerSession>>>>,
}

impl PacingController {
    pub fn new(store: Arc<FrameStore>, mode: FrameRateMode) -> Self {
        Self {
            store,
            strategy: strategy_for(mode),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> FrameRateMode {
        self.strategy.mode()
    }

    fn session(&self, name: &str) -> Arc<Mutex<ConsumerSession>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(sessions.entry(name.to_owned()).or_insert_with(|| {
            debug!(consumer = name, mode = ?self.strategy.mode(), "New consumer session");
            Arc::new(Mutex::new(ConsumerSession::new(name)))
        }))
    }

    /// Select the next frame for `name` and run `convert` on it.
    ///
    /// A non-zero `delay` holds the delivery until at least `delay` after the
    /// previous one to the same consumer. Returns the converted value and the
    /// frame it came from.
    pub fn deliver<T>(
        &self,
        name: &str,
        delay: Duration,
        timeout: Duration,
        convert: impl FnOnce(&Frame) -> Result<T>,
    ) -> Result<(T, Arc<Frame>)> {
        let session = self.session(name);
        let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
        if session.state == SessionState::Closed {
            return Err(VReaderError::Closed);
        }

        session.state = SessionState::Waiting;
        session.requested_delay = delay;
        if let (false, Some(last)) = (delay.is_zero(), session.last_delivery) {
            if let Err(e) = self.store.sleep_until(last + delay) {
                session.state = SessionState::Closed;
                return Err(e);
            }
        }

        let frame = match self.strategy.select(&self.store, &session, timeout) {
            Ok(frame) => frame,
            Err(e) => {
                session.state = match e {
                    VReaderError::Closed => SessionState::Closed,
                    _ => SessionState::Idle,
                };
                if let VReaderError::FrameExpired { oldest, .. } = e {
                    session.catch_up(oldest);
                }
                return Err(e);
            }
        };

        session.state = SessionState::Delivering;
        session.last_served = Some(frame.index());
        session.last_delivery = Some(Instant::now());
        self.strategy.delivered(&self.store, &session);
        trace!(consumer = name, index = frame.index(), "Delivering frame");
        let converted = convert(&frame);
        session.state = SessionState::Idle;
        Ok((converted?, frame))
    }

    pub fn session_state(&self, name: &str) -> Option<SessionState> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(name)
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).state)
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drop every session. Waiters already hold their session and see the
    /// closed store on their own.
    pub fn close_all(&self) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(count = sessions.len(), "Closing consumer sessions");
        sessions.clear();
    }
}
