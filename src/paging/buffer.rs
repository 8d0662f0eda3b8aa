//! Page content stores and the access-interception wrapper.
//!
//! Every page owns one raw store ([`RawBuffer`]) holding its fields. Callers
//! never touch the raw store directly: [`crate::paging::page::Page::buffer`]
//! hands out a [`PageBuffer`], which feeds the kernel's LRU and dirty
//! tracking on every access before delegating to the store.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::device::{BlockDriver, DeviceError};
use crate::paging::page::{PageId, PageInner};
use crate::region::{Position, Region, Size};

#[derive(Error, Debug)]
pub enum AccessError {
    #[error("position {position} is outside page region {region}")]
    OutOfRegion { position: Position, region: Region },

    #[error("page {page} has been freed")]
    PageFreed { page: PageId },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// A single stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    bytes: Bytes,
}

impl Field {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Convenience constructor for numeric payloads.
    pub fn from_u64(value: u64) -> Self {
        Self {
            bytes: Bytes::copy_from_slice(&value.to_le_bytes()),
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Which kind of raw store backs a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Mutable store written in place.
    InPlace,
    /// Persistent store; every write installs a new version.
    Versioned,
    /// Store delegating to a block device.
    Device,
}

/// Mutable in-place field store.
#[derive(Debug)]
pub struct InPlaceStore {
    region: Region,
    slots: Vec<Option<Field>>,
}

/// Persistent field store. Writes never mutate an existing snapshot; they
/// build a new one and swap it in, so concurrent readers of an old snapshot
/// are undisturbed.
#[derive(Debug)]
pub struct VersionedStore {
    region: Region,
    snapshot: Arc<Vec<Option<Field>>>,
    generation: u64,
}

impl VersionedStore {
    /// Number of versions installed so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Store reading and writing through a block device.
#[derive(Debug)]
pub struct DeviceStore {
    region: Region,
    driver: Arc<dyn BlockDriver>,
}

/// The raw content handle of one page.
///
/// An explicit tagged choice between the store disciplines a tier can use.
/// `set` on the versioned variant replaces the live snapshot, which is why
/// the owning page guards the whole read-modify-install sequence with its
/// per-page lock.
#[derive(Debug)]
pub enum RawBuffer {
    InPlace(InPlaceStore),
    Versioned(VersionedStore),
    Device(DeviceStore),
}

impl RawBuffer {
    /// Fresh in-place store covering `region`, all slots empty.
    pub fn in_place(region: Region) -> Self {
        Self::InPlace(InPlaceStore {
            region,
            slots: vec![None; region.size() as usize],
        })
    }

    /// Fresh versioned store covering `region`.
    pub fn versioned(region: Region) -> Self {
        Self::Versioned(VersionedStore {
            region,
            snapshot: Arc::new(vec![None; region.size() as usize]),
            generation: 0,
        })
    }

    /// Store backed by `driver`, windowed to `region`.
    pub fn device(region: Region, driver: Arc<dyn BlockDriver>) -> Self {
        Self::Device(DeviceStore { region, driver })
    }

    pub fn region(&self) -> &Region {
        match self {
            Self::InPlace(store) => &store.region,
            Self::Versioned(store) => &store.region,
            Self::Device(store) => &store.region,
        }
    }

    pub fn kind(&self) -> StoreKind {
        match self {
            Self::InPlace(_) => StoreKind::InPlace,
            Self::Versioned(_) => StoreKind::Versioned,
            Self::Device(_) => StoreKind::Device,
        }
    }

    fn offset(&self, position: Position) -> Result<usize, AccessError> {
        self.region()
            .offset(position)
            .map(|offset| offset as usize)
            .ok_or(AccessError::OutOfRegion {
                position,
                region: *self.region(),
            })
    }

    /// Read the field at `position`; absent entries pass through as `None`.
    pub fn get(&self, position: Position) -> Result<Option<Field>, AccessError> {
        let offset = self.offset(position)?;
        match self {
            Self::InPlace(store) => Ok(store.slots[offset].clone()),
            Self::Versioned(store) => Ok(store.snapshot[offset].clone()),
            Self::Device(store) => Ok(store.driver.read(position)?),
        }
    }

    /// Write `field` at `position`.
    ///
    /// The versioned variant installs a new snapshot; callers holding the
    /// per-page lock see the replacement atomically.
    pub fn set(&mut self, position: Position, field: Field) -> Result<(), AccessError> {
        let offset = self.offset(position)?;
        match self {
            Self::InPlace(store) => {
                store.slots[offset] = Some(field);
            }
            Self::Versioned(store) => {
                let mut slots = store.snapshot.as_ref().clone();
                slots[offset] = Some(field);
                store.snapshot = Arc::new(slots);
                store.generation += 1;
            }
            Self::Device(store) => {
                store.driver.write(position, field)?;
            }
        }
        Ok(())
    }

    /// Remove the field at `position`; later reads return `None`.
    pub fn clear(&mut self, position: Position) -> Result<(), AccessError> {
        let offset = self.offset(position)?;
        match self {
            Self::InPlace(store) => {
                store.slots[offset] = None;
            }
            Self::Versioned(store) => {
                let mut slots = store.snapshot.as_ref().clone();
                slots[offset] = None;
                store.snapshot = Arc::new(slots);
                store.generation += 1;
            }
            Self::Device(store) => {
                store.driver.clear(position)?;
            }
        }
        Ok(())
    }
}

/// The cache-bookkeeping wrapper around one page's raw store.
///
/// Obtained via `Page::buffer()`; fetching it is itself an access. Hold it
/// only for one logical operation and re-fetch it the next time: recency
/// must be recorded per access, and writes to a versioned store replace the
/// live snapshot underneath.
pub struct PageBuffer {
    inner: Arc<PageInner>,
}

impl PageBuffer {
    pub(crate) fn new(inner: Arc<PageInner>) -> Self {
        Self { inner }
    }

    /// Read the field at `position`, recording recency.
    ///
    /// Absent entries pass through unchanged.
    pub fn get(&self, position: Position) -> Result<Option<Field>, AccessError> {
        if self.inner.is_freed() {
            return Err(AccessError::PageFreed {
                page: self.inner.id(),
            });
        }
        self.inner.paging().recent_inner(&self.inner);
        let content = self.inner.lock_content();
        content.get(position)
    }

    /// Write `field` at `position`.
    ///
    /// The read-current-store / write / install / mark-dirty sequence runs
    /// under the per-page lock, so concurrent writers cannot lose an update
    /// on a versioned store. Recency and dirty are recorded only when the
    /// raw write succeeds; a failed write leaves the tracker untouched.
    pub fn set(&self, position: Position, field: Field) -> Result<(), AccessError> {
        if self.inner.is_freed() {
            return Err(AccessError::PageFreed {
                page: self.inner.id(),
            });
        }
        let mut content = self.inner.lock_content();
        content.set(position, field)?;
        self.inner.paging().recent_inner(&self.inner);
        self.inner.paging().dirty_inner(&self.inner);
        Ok(())
    }

    /// Remove the field at `position`.
    ///
    /// A modification like `set`: bookkeeping is recorded only when the raw
    /// clear succeeds.
    pub fn clear(&self, position: Position) -> Result<(), AccessError> {
        if self.inner.is_freed() {
            return Err(AccessError::PageFreed {
                page: self.inner.id(),
            });
        }
        let mut content = self.inner.lock_content();
        content.clear(position)?;
        self.inner.paging().recent_inner(&self.inner);
        self.inner.paging().dirty_inner(&self.inner);
        Ok(())
    }

    /// The owning page's region.
    pub fn region(&self) -> Region {
        self.inner.region()
    }

    /// Number of positions the page covers.
    pub fn size(&self) -> Size {
        self.inner.region().size()
    }

    /// Which kind of store currently backs the page.
    pub fn kind(&self) -> StoreKind {
        self.inner.lock_content().kind()
    }

    /// Holder count of the owning page, not of the raw store.
    ///
    /// Pages, not stores, are the reference-counted unit.
    pub fn references(&self) -> usize {
        self.inner.holders().load(Ordering::Acquire)
    }

    /// ID of the owning page.
    pub fn page_id(&self) -> PageId {
        self.inner.id()
    }
}
