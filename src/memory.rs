//! Physical memory allocation for buffer-backed tiers.
//!
//! A [`Memory`] hands out raw field stores sized to a region and reclaims
//! them on page release. [`FieldMemory`] is the standard implementation: a
//! fixed field budget with atomic usage accounting and O(1) alloc/free.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::debug;

use crate::paging::buffer::{RawBuffer, StoreKind};
use crate::region::{Region, Size};

#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("out of memory: requested {requested} fields, {available} available")]
    OutOfMemory { requested: Size, available: Size },

    #[error("memory cannot back a {kind:?} store")]
    UnsupportedStore { kind: StoreKind },
}

/// Who is asking for an allocation or access.
///
/// Opaque to this layer; carried through to allocators and drivers so a
/// concrete tier can enforce its own policy, and logged for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Credentials {
    owner: u64,
}

impl Credentials {
    /// Credentials of the kernel itself.
    pub fn kernel() -> Self {
        Self { owner: 0 }
    }

    /// Credentials of a user context.
    pub fn user(owner: u64) -> Self {
        Self { owner }
    }

    pub fn owner(&self) -> u64 {
        self.owner
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.owner == 0 {
            write!(f, "kernel")
        } else {
            write!(f, "user{}", self.owner)
        }
    }
}

/// Allocates and frees raw content stores for buffer-backed tiers.
pub trait Memory: Send + Sync + fmt::Debug {
    /// Allocate a store covering `region`.
    fn allocate(
        &self,
        credentials: &Credentials,
        region: &Region,
    ) -> Result<RawBuffer, AllocationError>;

    /// Return the fields covering `region` to the pool.
    ///
    /// Must be called exactly once per successful `allocate`, with the
    /// credentials the allocation was made under.
    fn free(&self, credentials: &Credentials, region: &Region);

    /// Total field budget.
    fn capacity(&self) -> Size;

    /// Fields currently allocated.
    fn allocated(&self) -> Size;
}

/// Budget-limited field pool.
#[derive(Debug)]
pub struct FieldMemory {
    /// Which kind of store allocations produce.
    kind: StoreKind,

    /// Total budget in fields.
    capacity: Size,

    /// Fields currently handed out.
    allocated: AtomicU64,
}

impl FieldMemory {
    /// A pool producing mutable in-place stores.
    pub fn new(capacity: Size) -> Self {
        Self {
            kind: StoreKind::InPlace,
            capacity,
            allocated: AtomicU64::new(0),
        }
    }

    /// A pool producing persistent versioned stores (copy-on-write).
    pub fn versioned(capacity: Size) -> Self {
        Self {
            kind: StoreKind::Versioned,
            ..Self::new(capacity)
        }
    }
}

impl Memory for FieldMemory {
    fn allocate(
        &self,
        credentials: &Credentials,
        region: &Region,
    ) -> Result<RawBuffer, AllocationError> {
        let requested = region.size();
        let previous = self.allocated.fetch_add(requested, Ordering::AcqRel);
        if previous + requested > self.capacity {
            self.allocated.fetch_sub(requested, Ordering::AcqRel);
            return Err(AllocationError::OutOfMemory {
                requested,
                available: self.capacity.saturating_sub(previous),
            });
        }

        debug!(
            credentials = %credentials,
            region = %region,
            allocated = previous + requested,
            capacity = self.capacity,
            "Allocated field store"
        );

        let buffer = match self.kind {
            StoreKind::InPlace => RawBuffer::in_place(*region),
            StoreKind::Versioned => RawBuffer::versioned(*region),
            StoreKind::Device => {
                self.allocated.fetch_sub(requested, Ordering::AcqRel);
                return Err(AllocationError::UnsupportedStore { kind: self.kind });
            }
        };
        Ok(buffer)
    }

    fn free(&self, credentials: &Credentials, region: &Region) {
        let released = region.size();
        self.allocated.fetch_sub(released, Ordering::AcqRel);
        debug!(
            credentials = %credentials,
            region = %region,
            "Freed field store"
        );
    }

    fn capacity(&self) -> Size {
        self.capacity
    }

    fn allocated(&self) -> Size {
        self.allocated.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Space;

    #[test]
    fn test_allocate_within_budget() {
        let space = Space::new(64);
        let memory = FieldMemory::new(32);

        let region = space.region(space.position(0), space.position(15)).unwrap();
        let buffer = memory.allocate(&Credentials::kernel(), &region).unwrap();
        assert_eq!(buffer.region().size(), 16);
        assert_eq!(memory.allocated(), 16);

        memory.free(&Credentials::kernel(), &region);
        assert_eq!(memory.allocated(), 0);
    }

    #[test]
    fn test_exhaustion() {
        let space = Space::new(64);
        let memory = FieldMemory::new(16);
        let credentials = Credentials::user(7);

        let first = space.region(space.position(0), space.position(15)).unwrap();
        memory.allocate(&credentials, &first).unwrap();

        let second = space.region(space.position(16), space.position(31)).unwrap();
        let result = memory.allocate(&credentials, &second);
        assert!(matches!(
            result,
            Err(AllocationError::OutOfMemory { requested: 16, .. })
        ));
        // Failed allocation must not leak budget.
        assert_eq!(memory.allocated(), 16);
    }
}
