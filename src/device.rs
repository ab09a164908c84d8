//! Decode device selection and scoped memory reservations
//!
//! A [`DeviceRegistry`] tracks how much memory every pipeline instance holds
//! on each device. Instances acquire a [`DeviceContext`] at init; dropping it
//! returns the reservation, so teardown on any path leaves no residue.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use once_cell::sync::Lazy;
use tracing::{debug, info};

use crate::error::{Result, VReaderError};
use crate::DeviceConfig;

/// Which device a pipeline should decode on.
///
/// Raw integer ids convert with a fixed rule: non-negative values name a
/// device, negative values let the registry choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSelector {
    /// Exactly this device; out-of-range ids fail initialization.
    Fixed(u32),
    /// The device with the least memory reserved right now.
    Any,
    /// Rotate across all devices, one step per acquisition.
    RoundRobin,
}

impl From<i32> for DeviceSelector {
    fn from(id: i32) -> Self {
        u32::try_from(id).map_or(DeviceSelector::Any, DeviceSelector::Fixed)
    }
}

struct DeviceSlot {
    capacity: u64,
    reserved: CachePadded<AtomicU64>,
}

/// Process-wide accounting of device memory
pub struct DeviceRegistry {
    devices: Vec<DeviceSlot>,
    cursor: AtomicUsize,
}

static GLOBAL: Lazy<Arc<DeviceRegistry>> = Lazy::new(|| {
    let config = crate::CONFIG.load();
    Arc::new(DeviceRegistry::new(&config.device))
});

impl DeviceRegistry {
    pub fn new(config: &DeviceConfig) -> Self {
        let count = config.count.max(1);
        info!(count, memory_bytes = config.memory_bytes, "Device registry ready");
        Self {
            devices: (0..count)
                .map(|_| DeviceSlot {
                    capacity: config.memory_bytes,
                    reserved: CachePadded::new(AtomicU64::new(0)),
                })
                .collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Registry shared by readers that were not given one explicitly.
    pub fn global() -> Arc<DeviceRegistry> {
        GLOBAL.clone()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn reserved_bytes(&self, device: u32) -> u64 {
        self.devices
            .get(device as usize)
            .map_or(0, |slot| slot.reserved.load(Ordering::Acquire))
    }

    pub fn total_reserved(&self) -> u64 {
        (0..self.devices.len() as u32)
            .map(|id| self.reserved_bytes(id))
            .sum()
    }

    fn resolve(&self, selector: DeviceSelector) -> Result<u32> {
        let count = self.devices.len();
        match selector {
            DeviceSelector::Fixed(id) if (id as usize) < count => Ok(id),
            DeviceSelector::Fixed(id) => Err(VReaderError::Device(format!(
                "device {id} requested but only {count} available"
            ))),
            DeviceSelector::Any => Ok(self
                .devices
                .iter()
                .enumerate()
                .min_by_key(|(_, slot)| slot.reserved.load(Ordering::Acquire))
                .map_or(0, |(id, _)| id as u32)),
            DeviceSelector::RoundRobin => {
                Ok((self.cursor.fetch_add(1, Ordering::Relaxed) % count) as u32)
            }
        }
    }

    /// Select a device and reserve `bytes` on it for the caller's lifetime.
    pub fn acquire(self: &Arc<Self>, selector: DeviceSelector, bytes: u64) -> Result<DeviceContext> {
        let id = self.resolve(selector)?;
        let slot = &self.devices[id as usize];
        slot.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                reserved
                    .checked_add(bytes)
                    .filter(|total| *total <= slot.capacity)
            })
            .map_err(|reserved| {
                VReaderError::Device(format!(
                    "device {id} out of memory: {bytes} bytes requested, {} of {} in use",
                    reserved, slot.capacity
                ))
            })?;
        debug!(device = id, bytes, ?selector, "Acquired device context");
        Ok(DeviceContext {
            registry: Arc::clone(self),
            device: id,
            bytes,
        })
    }
}

/// A device reservation owned by exactly one pipeline instance
pub struct DeviceContext {
    registry: Arc<DeviceRegistry>,
    device: u32,
    bytes: u64,
}

impl DeviceContext {
    pub fn device(&self) -> u32 {
        self.device
    }

    pub fn reserved(&self) -> u64 {
        self.bytes
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device", &self.device)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        let slot = &self.registry.devices[self.device as usize];
        slot.reserved.fetch_sub(self.bytes, Ordering::AcqRel);
        debug!(device = self.device, bytes = self.bytes, "Released device context");
    }
}
