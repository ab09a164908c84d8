//! Bounded frame store shared by the decode thread and every consumer
//!
//! Frames are kept in a ring of `Arc<Frame>` in strictly increasing index
//! order; when the ring is full the oldest frame is evicted. Consumers that
//! must see every frame place a claim on the next index they need, and the
//! producer can wait for claimed frames to be read before evicting them. All
//! blocking in the pipeline happens on the store's condition variable, so
//! closing the store wakes every waiter at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tracing::{debug, trace};

use crate::error::{Result, VReaderError};
use crate::source::Frame;

/// Why the store stopped accepting frames
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// `end_processing` was called; every read fails from now on.
    Shutdown,
    /// The source ran out; retained frames stay readable.
    EndOfStream,
    DecoderFault(String),
    /// The watchdog saw no frame for the given period.
    Stalled(Duration),
}

impl CloseReason {
    fn to_error(&self) -> VReaderError {
        match self {
            CloseReason::Shutdown => VReaderError::Closed,
            CloseReason::EndOfStream => VReaderError::EndOfStream,
            CloseReason::DecoderFault(msg) => VReaderError::Decode(msg.clone()),
            CloseReason::Stalled(period) => VReaderError::Stalled(*period),
        }
    }
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicU64,
    frames_evicted: AtomicU64,
    frames_served: AtomicU64,
    read_timeouts: AtomicU64,
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub frames_written: u64,
    pub frames_evicted: u64,
    pub frames_served: u64,
    pub read_timeouts: u64,
}

struct StoreState {
    ring: HeapRb<Arc<Frame>>,
    /// Index the next push must carry, `None` before the first frame
    next_index: Option<u64>,
    closed: Option<CloseReason>,
    /// Consumer name to the lowest index it still needs
    claims: HashMap<String, u64>,
}

impl StoreState {
    fn oldest(&self) -> Option<u64> {
        self.next_index
            .map(|next| next - self.ring.occupied_len() as u64)
    }

    fn newest(&self) -> Option<&Arc<Frame>> {
        let len = self.ring.occupied_len();
        len.checked_sub(1).and_then(|last| self.ring.iter().nth(last))
    }

    /// `Ok(None)` when `index` has not been decoded yet.
    fn get(&self, index: u64) -> Result<Option<Arc<Frame>>> {
        let (Some(oldest), Some(next)) = (self.oldest(), self.next_index) else {
            return Ok(None);
        };
        if index < oldest {
            return Err(VReaderError::FrameExpired {
                requested: index,
                oldest,
            });
        }
        if index >= next {
            return Ok(None);
        }
        Ok(self.ring.iter().nth((index - oldest) as usize).cloned())
    }

    fn is_shut_down(&self) -> bool {
        self.closed == Some(CloseReason::Shutdown)
    }

    /// Whether the next push would evict a frame some consumer still needs.
    fn oldest_is_claimed(&self) -> bool {
        if !self.ring.is_full() {
            return false;
        }
        let Some(oldest) = self.oldest() else {
            return false;
        };
        self.claims.values().any(|&needed| needed <= oldest)
    }
}

/// Ring-buffered frame store with wait/notify reads
pub struct FrameStore {
    state: Mutex<StoreState>,
    changed: Condvar,

    /// Statistics
    stats: CachePadded<Stats>,
}

impl FrameStore {
    /// `capacity` is clamped to at least one frame.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(StoreState {
                ring: HeapRb::new(capacity.max(1)),
                next_index: None,
                closed: None,
                claims: HashMap::new(),
            }),
            changed: Condvar::new(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until notified or `deadline`; `Timeout` once the deadline passed.
    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, StoreState>,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<MutexGuard<'a, StoreState>> {
        let now = Instant::now();
        if now >= deadline {
            self.stats.read_timeouts.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("vreader.read_timeouts").increment(1);
            return Err(VReaderError::Timeout(timeout));
        }
        let (guard, _) = self
            .changed
            .wait_timeout(guard, deadline - now)
            .unwrap_or_else(PoisonError::into_inner);
        Ok(guard)
    }

    pub fn capacity(&self) -> usize {
        self.lock().ring.capacity().get()
    }

    pub fn len(&self) -> usize {
        self.lock().ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer: admit the next frame, evicting the oldest one when full.
    pub fn push(&self, frame: Frame) -> Result<()> {
        let index = frame.index();
        let mut state = self.lock();
        if state.closed.is_some() {
            return Err(VReaderError::Closed);
        }
        if let Some(expected) = state.next_index {
            if index != expected {
                return Err(VReaderError::OutOfOrder {
                    expected,
                    got: index,
                });
            }
        }

        if let Some(evicted) = state.ring.push_overwrite(Arc::new(frame)) {
            trace!(evicted = evicted.index(), "Evicted oldest frame");
            self.stats.frames_evicted.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("vreader.frames_evicted").increment(1);
        }
        state.next_index = Some(index + 1);
        drop(state);

        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        self.changed.notify_all();
        Ok(())
    }

    /// Producer: wait up to `timeout` until admitting the next frame would not
    /// evict one a consumer has claimed. `Ok(false)` if the oldest frame is
    /// still claimed when the time is up.
    pub fn wait_for_room(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.closed.is_some() {
                return Err(VReaderError::Closed);
            }
            if !state.oldest_is_claimed() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Record that `consumer` needs every frame from `index` on.
    pub fn claim(&self, consumer: &str, index: u64) {
        let mut state = self.lock();
        match state.claims.get_mut(consumer) {
            Some(needed) if *needed == index => return,
            Some(needed) => *needed = index,
            None => {
                state.claims.insert(consumer.to_owned(), index);
            }
        }
        drop(state);
        self.changed.notify_all();
    }

    pub fn release(&self, consumer: &str) {
        if self.lock().claims.remove(consumer).is_some() {
            self.changed.notify_all();
        }
    }

    /// Drop the claims pinning the oldest frame; returns the consumers
    /// that lost theirs.
    pub fn release_lagging(&self) -> Vec<String> {
        let mut state = self.lock();
        let Some(oldest) = state.oldest() else {
            return Vec::new();
        };
        let lagging: Vec<String> = state
            .claims
            .iter()
            .filter(|(_, needed)| **needed <= oldest)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &lagging {
            state.claims.remove(name);
        }
        lagging
    }

    /// Consumer: frame `index`, waiting up to `timeout` for it to be decoded.
    pub fn read(&self, index: u64, timeout: Duration) -> Result<Arc<Frame>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.is_shut_down() {
                return Err(VReaderError::Closed);
            }
            if let Some(frame) = state.get(index)? {
                self.stats.frames_served.fetch_add(1, Ordering::Relaxed);
                return Ok(frame);
            }
            if let Some(reason) = &state.closed {
                return Err(reason.to_error());
            }
            state = self.wait(state, deadline, timeout)?;
        }
    }

    /// Consumer: the newest frame whose index is greater than `after`.
    pub fn read_newer(&self, after: Option<u64>, timeout: Duration) -> Result<Arc<Frame>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.is_shut_down() {
                return Err(VReaderError::Closed);
            }
            if let Some(frame) = state.newest() {
                if after.map_or(true, |served| frame.index() > served) {
                    self.stats.frames_served.fetch_add(1, Ordering::Relaxed);
                    return Ok(Arc::clone(frame));
                }
            }
            if let Some(reason) = &state.closed {
                return Err(reason.to_error());
            }
            state = self.wait(state, deadline, timeout)?;
        }
    }

    /// Sleep until `deadline`, returning early with `Closed` on shutdown.
    pub fn sleep_until(&self, deadline: Instant) -> Result<()> {
        let mut state = self.lock();
        loop {
            if state.is_shut_down() {
                return Err(VReaderError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Stop admitting frames and wake every waiter. The first reason wins;
    /// returns whether this call closed the store.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut state = self.lock();
        let first = state.closed.is_none();
        if first {
            debug!(?reason, "Closing frame store");
            state.closed = Some(reason);
        } else if reason == CloseReason::Shutdown {
            // A shutdown after end of stream still has to fail later reads
            state.closed = Some(CloseReason::Shutdown);
        }
        drop(state);
        self.changed.notify_all();
        first
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lock().closed.clone()
    }

    pub fn oldest_index(&self) -> Option<u64> {
        self.lock().oldest()
    }

    pub fn newest_index(&self) -> Option<u64> {
        self.lock().newest().map(|frame| frame.index())
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            frames_written: self.stats.frames_written.load(Ordering::Relaxed),
            frames_evicted: self.stats.frames_evicted.load(Ordering::Relaxed),
            frames_served: self.stats.frames_served.load(Ordering::Relaxed),
            read_timeouts: self.stats.read_timeouts.load(Ordering::Relaxed),
        }
    }
}
