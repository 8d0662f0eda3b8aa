//! Block device drivers backing the swapped-out tiers.
//!
//! A [`BlockDriver`] exposes a fixed extent of a space and serves random
//! reads/writes of single fields. Persisted layout is the driver's own
//! concern; the paging core only moves fields through this interface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

use crate::paging::buffer::Field;
use crate::region::{Position, Region, Space};

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("position {position} is outside device extent {extent}")]
    OutOfRange { position: Position, extent: Region },
}

/// A random-access block device serving one tier.
pub trait BlockDriver: Send + Sync + std::fmt::Debug {
    /// Human-readable driver name, for logs.
    fn name(&self) -> &str;

    /// The extent of the device within its tier's space.
    fn extent(&self) -> Region;

    /// Read the field stored at `position`, if any.
    fn read(&self, position: Position) -> Result<Option<Field>, DeviceError>;

    /// Store `field` at `position`.
    fn write(&self, position: Position, field: Field) -> Result<(), DeviceError>;

    /// Remove whatever is stored at `position`; later reads return nothing.
    fn clear(&self, position: Position) -> Result<(), DeviceError>;
}

/// Read/write counters for a driver.
#[derive(Debug, Default)]
pub struct DeviceStats {
    reads: AtomicU64,
    writes: AtomicU64,
}

impl DeviceStats {
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

/// An in-memory block device.
///
/// Stands in for a real disk/driver stack in tests and single-process
/// deployments; one slot per position across the whole extent.
#[derive(Debug)]
pub struct MemBlockDriver {
    name: String,
    extent: Region,
    slots: Mutex<Vec<Option<Field>>>,
    stats: DeviceStats,
}

impl MemBlockDriver {
    /// Create a driver spanning the entire `space`.
    ///
    /// Panics if the space is empty; a zero-length device cannot serve pages.
    pub fn new(name: impl Into<String>, space: &Space) -> Self {
        assert!(!space.is_empty(), "device space must be non-empty");
        let extent = space
            .region(space.origin(), space.position(space.len() - 1))
            .unwrap_or_else(|_| unreachable!("full-space extent is always valid"));
        let name = name.into();
        debug!(driver = %name, extent = %extent, "Created in-memory block device");
        Self {
            name,
            extent,
            slots: Mutex::new(vec![None; space.len() as usize]),
            stats: DeviceStats::default(),
        }
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    fn slot_index(&self, position: Position) -> Result<usize, DeviceError> {
        self.extent
            .offset(position)
            .map(|offset| offset as usize)
            .ok_or(DeviceError::OutOfRange {
                position,
                extent: self.extent,
            })
    }
}

impl BlockDriver for MemBlockDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn extent(&self) -> Region {
        self.extent
    }

    fn read(&self, position: Position) -> Result<Option<Field>, DeviceError> {
        let index = self.slot_index(position)?;
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Ok(slots[index].clone())
    }

    fn write(&self, position: Position, field: Field) -> Result<(), DeviceError> {
        let index = self.slot_index(position)?;
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots[index] = Some(field);
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn clear(&self, position: Position) -> Result<(), DeviceError> {
        let index = self.slot_index(position)?;
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots[index] = None;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let space = Space::new(64);
        let driver = MemBlockDriver::new("test", &space);

        let position = space.position(7);
        driver.write(position, Field::from_u64(42)).unwrap();
        assert_eq!(driver.read(position).unwrap(), Some(Field::from_u64(42)));
        assert_eq!(driver.read(space.position(8)).unwrap(), None);

        driver.clear(position).unwrap();
        assert_eq!(driver.read(position).unwrap(), None);

        assert_eq!(driver.stats().writes(), 2);
        assert_eq!(driver.stats().reads(), 3);
    }

    #[test]
    fn test_rejects_foreign_position() {
        let space = Space::new(8);
        let other = Space::new(8);
        let driver = MemBlockDriver::new("test", &space);

        let result = driver.read(other.position(0));
        assert!(matches!(result, Err(DeviceError::OutOfRange { .. })));
    }
}
