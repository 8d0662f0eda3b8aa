//! Storage tiers and page creation.
//!
//! A [`SwapState`] is one storage tier: it validates page placement within
//! its space and produces fixed-size [`Page`]s backed by tier-specific
//! storage. [`BufferSwapState`] allocates from a [`Memory`] pool;
//! [`BlockSwapState`] windows pages onto a [`BlockDriver`]. Tiers keep no
//! page registry of their own: registries live in [`KernelPaging`] and in
//! higher layers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use thiserror::Error;
use tracing::debug;

use crate::device::BlockDriver;
use crate::memory::{AllocationError, Credentials, Memory};
use crate::paging::buffer::RawBuffer;
use crate::paging::kernel_paging::KernelPaging;
use crate::paging::page::{Page, PageBacking};
use crate::region::{AddressingError, Position, Region, Size, Space};

/// Unique identifier for a swap state.
pub type SwapStateId = u64;

/// Global monotonic swap state ID counter.
static NEXT_SWAP_STATE_ID: AtomicU64 = AtomicU64::new(0);

fn new_swap_state_id() -> SwapStateId {
    NEXT_SWAP_STATE_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Error, Debug)]
pub enum CreatePageError {
    /// The start position cannot host a full page inside the tier's space.
    #[error(transparent)]
    Addressing(#[from] AddressingError),

    /// The tier's backing allocator could not satisfy the request.
    #[error("page allocation failed")]
    Allocation(#[from] AllocationError),
}

/// One storage tier capable of producing pages.
///
/// Immutable after construction; `create_page` may be called repeatedly,
/// each call yielding an independent page. Two states are the same tier iff
/// id, tracker, page size and space all match ([`SwapState::matches`]).
pub trait SwapState: Send + Sync + fmt::Debug {
    fn id(&self) -> SwapStateId;

    /// The space this tier addresses.
    fn space(&self) -> &Space;

    /// Size of every page this tier creates.
    fn page_size(&self) -> Size;

    /// The shared recency/dirty tracker every page reports to.
    fn kernel_paging(&self) -> &Arc<KernelPaging>;

    /// Create a page of `page_size` positions starting at `start`.
    ///
    /// `start + page_size - 1` must stay inside the space; otherwise an
    /// addressing failure is raised and the backing allocator is never
    /// called. Allocator exhaustion propagates as an allocation failure.
    fn create_page(
        &self,
        credentials: &Credentials,
        start: Position,
    ) -> Result<Page, CreatePageError>;

    /// Tier identity comparison.
    fn matches(&self, other: &dyn SwapState) -> bool {
        self.id() == other.id()
            && self.page_size() == other.page_size()
            && self.space() == other.space()
            && Arc::ptr_eq(self.kernel_paging(), other.kernel_paging())
    }
}

/// Compute and validate the region of a page starting at `start`.
///
/// Rejects a start whose page end would land on the out-of-bounds sentinel
/// (no wraparound at the edge of the space) and any region whose size is not
/// exactly `page_size`.
pub fn page_region(
    space: &Space,
    page_size: Size,
    start: Position,
) -> Result<Region, AddressingError> {
    if page_size == 0 || page_size > space.len() {
        return Err(AddressingError::InvalidPageSize {
            page_size,
            len: space.len(),
        });
    }
    if !space.contains(start) {
        return Err(AddressingError::OutOfBounds {
            position: start,
            space: space.id(),
            len: space.len(),
        });
    }
    let end = space.add(start, page_size - 1);
    if end.is_out_of_bounds() {
        return Err(AddressingError::OutOfBounds {
            position: end,
            space: space.id(),
            len: space.len(),
        });
    }
    let region = space.region(start, end)?;
    if region.size() != page_size {
        return Err(AddressingError::WrongSize {
            start,
            end,
            expected: page_size,
            actual: region.size(),
        });
    }
    Ok(region)
}

/// A tier whose pages live in allocator-managed field stores.
#[derive(Debug)]
pub struct BufferSwapState {
    id: SwapStateId,
    space: Space,
    page_size: Size,
    paging: Arc<KernelPaging>,
    memory: Arc<dyn Memory>,
    this: Weak<BufferSwapState>,
}

impl BufferSwapState {
    pub fn new(
        space: Space,
        page_size: Size,
        paging: Arc<KernelPaging>,
        memory: Arc<dyn Memory>,
    ) -> Result<Arc<Self>, AddressingError> {
        if page_size == 0 || page_size > space.len() {
            return Err(AddressingError::InvalidPageSize {
                page_size,
                len: space.len(),
            });
        }
        Ok(Arc::new_cyclic(|this| Self {
            id: new_swap_state_id(),
            space,
            page_size,
            paging,
            memory,
            this: this.clone(),
        }))
    }

    fn as_state(&self) -> Arc<dyn SwapState> {
        self.this
            .upgrade()
            .expect("swap states are always constructed via Arc::new_cyclic")
    }
}

impl SwapState for BufferSwapState {
    fn id(&self) -> SwapStateId {
        self.id
    }

    fn space(&self) -> &Space {
        &self.space
    }

    fn page_size(&self) -> Size {
        self.page_size
    }

    fn kernel_paging(&self) -> &Arc<KernelPaging> {
        &self.paging
    }

    fn create_page(
        &self,
        credentials: &Credentials,
        start: Position,
    ) -> Result<Page, CreatePageError> {
        let region = page_region(&self.space, self.page_size, start)?;
        let content = self.memory.allocate(credentials, &region)?;
        let page = Page::new(
            region,
            self.as_state(),
            *credentials,
            content,
            PageBacking::Memory(Arc::clone(&self.memory)),
        );
        debug!(
            tier = self.id,
            page = page.id(),
            region = %region,
            credentials = %credentials,
            "Created buffer page"
        );
        Ok(page)
    }
}

/// A tier whose pages window onto a block device.
#[derive(Debug)]
pub struct BlockSwapState {
    id: SwapStateId,
    space: Space,
    page_size: Size,
    paging: Arc<KernelPaging>,
    driver: Arc<dyn BlockDriver>,
    this: Weak<BlockSwapState>,
}

impl BlockSwapState {
    pub fn new(
        space: Space,
        page_size: Size,
        paging: Arc<KernelPaging>,
        driver: Arc<dyn BlockDriver>,
    ) -> Result<Arc<Self>, AddressingError> {
        if page_size == 0 || page_size > space.len() {
            return Err(AddressingError::InvalidPageSize {
                page_size,
                len: space.len(),
            });
        }
        Ok(Arc::new_cyclic(|this| Self {
            id: new_swap_state_id(),
            space,
            page_size,
            paging,
            driver,
            this: this.clone(),
        }))
    }

    pub fn driver(&self) -> &Arc<dyn BlockDriver> {
        &self.driver
    }

    fn as_state(&self) -> Arc<dyn SwapState> {
        self.this
            .upgrade()
            .expect("swap states are always constructed via Arc::new_cyclic")
    }
}

impl SwapState for BlockSwapState {
    fn id(&self) -> SwapStateId {
        self.id
    }

    fn space(&self) -> &Space {
        &self.space
    }

    fn page_size(&self) -> Size {
        self.page_size
    }

    fn kernel_paging(&self) -> &Arc<KernelPaging> {
        &self.paging
    }

    fn create_page(
        &self,
        credentials: &Credentials,
        start: Position,
    ) -> Result<Page, CreatePageError> {
        let region = page_region(&self.space, self.page_size, start)?;
        let extent = self.driver.extent();
        for position in [region.start(), region.end()] {
            if !extent.contains(position) {
                return Err(AddressingError::OutOfBounds {
                    position,
                    space: self.space.id(),
                    len: extent.size(),
                }
                .into());
            }
        }
        let content = RawBuffer::device(region, Arc::clone(&self.driver));
        let page = Page::new(
            region,
            self.as_state(),
            *credentials,
            content,
            PageBacking::Device(Arc::clone(&self.driver)),
        );
        debug!(
            tier = self.id,
            page = page.id(),
            region = %region,
            driver = self.driver.name(),
            credentials = %credentials,
            "Created block page"
        );
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FieldMemory;
    use crate::paging::buffer::{AccessError, Field};

    fn buffer_state(space_len: u64, page_size: Size, capacity: Size) -> Arc<BufferSwapState> {
        let paging = Arc::new(KernelPaging::new());
        let memory = Arc::new(FieldMemory::new(capacity));
        BufferSwapState::new(Space::new(space_len), page_size, paging, memory).unwrap()
    }

    #[test]
    fn test_create_page_exact_page_size() {
        let state = buffer_state(64, 16, 64);
        let start = state.space().position(0);
        let page = state.create_page(&Credentials::kernel(), start).unwrap();
        assert_eq!(page.region().size(), 16);
        assert_eq!(page.region().start(), start);
    }

    #[test]
    fn test_create_page_rejects_edge_overflow() {
        let paging = Arc::new(KernelPaging::new());
        let memory = Arc::new(FieldMemory::new(64));
        let state = BufferSwapState::new(
            Space::new(64),
            16,
            paging,
            Arc::clone(&memory) as Arc<dyn Memory>,
        )
        .unwrap();

        // 56 + 16 - 1 = 71 > 63: page would run off the end of the space.
        let start = state.space().position(56);
        let result = state.create_page(&Credentials::kernel(), start);
        assert!(matches!(result, Err(CreatePageError::Addressing(_))));

        // The allocator must never have been called.
        assert_eq!(memory.allocated(), 0);
    }

    #[test]
    fn test_create_page_allocation_failure() {
        let state = buffer_state(64, 16, 8); // budget below one page
        let start = state.space().position(0);
        let result = state.create_page(&Credentials::kernel(), start);
        assert!(matches!(result, Err(CreatePageError::Allocation(_))));
    }

    #[test]
    fn test_set_then_get_across_buffer_fetches() {
        let state = buffer_state(64, 16, 64);
        let page = state
            .create_page(&Credentials::kernel(), state.space().position(16))
            .unwrap();

        let position = state.space().position(20);
        page.buffer().set(position, Field::from_u64(77)).unwrap();
        // A fresh wrapper must observe the write.
        assert_eq!(
            page.buffer().get(position).unwrap(),
            Some(Field::from_u64(77))
        );
    }

    #[test]
    fn test_recency_recorded_per_access() {
        let state = buffer_state(64, 16, 64);
        let paging = Arc::clone(state.kernel_paging());
        let page = state
            .create_page(&Credentials::kernel(), state.space().position(0))
            .unwrap();

        let buffer = page.buffer(); // one access
        for i in 0..5 {
            buffer
                .set(state.space().position(i), Field::from_u64(i))
                .unwrap();
        }
        for i in 0..5 {
            buffer.get(state.space().position(i)).unwrap();
        }
        // 1 fetch + 5 sets + 5 gets, no coalescing, no drops.
        assert_eq!(paging.access_count(&page), 11);
    }

    #[test]
    fn test_successful_set_marks_dirty_failed_set_does_not() {
        let state = buffer_state(64, 16, 64);
        let paging = Arc::clone(state.kernel_paging());
        let page = state
            .create_page(&Credentials::kernel(), state.space().position(0))
            .unwrap();

        let buffer = page.buffer();
        let accesses_before = paging.access_count(&page);

        // Out-of-region write fails and leaves bookkeeping untouched.
        let result = buffer.set(state.space().position(16), Field::from_u64(1));
        assert!(matches!(result, Err(AccessError::OutOfRegion { .. })));
        assert!(!paging.is_dirty(&page));
        assert_eq!(paging.access_count(&page), accesses_before);

        buffer
            .set(state.space().position(1), Field::from_u64(1))
            .unwrap();
        assert!(paging.is_dirty(&page));
    }

    #[test]
    fn test_free_removes_from_tracker() {
        let state = buffer_state(64, 16, 64);
        let paging = Arc::clone(state.kernel_paging());
        let page = state
            .create_page(&Credentials::kernel(), state.space().position(0))
            .unwrap();

        page.buffer().get(state.space().position(0)).unwrap();
        assert_eq!(paging.tracked_count(), 1);

        page.free().unwrap();
        assert_eq!(paging.tracked_count(), 0);
    }

    #[test]
    fn test_free_rejects_dirty_page() {
        let state = buffer_state(64, 16, 64);
        let page = state
            .create_page(&Credentials::kernel(), state.space().position(0))
            .unwrap();

        page.buffer()
            .set(state.space().position(0), Field::from_u64(1))
            .unwrap();

        let err = page.free().unwrap_err();
        assert!(matches!(err, crate::paging::page::FreeError::Dirty(_)));

        // The handle comes back; a clean page frees fine.
        let page = err.into_page();
        state.kernel_paging().clean(&page);
        page.free().unwrap();
    }

    #[test]
    fn test_free_rejects_outstanding_holders() {
        let state = buffer_state(64, 16, 64);
        let page = state
            .create_page(&Credentials::kernel(), state.space().position(0))
            .unwrap();
        let second = page.clone();
        assert_eq!(page.reference_count(), 2);

        let err = page.free().unwrap_err();
        assert!(matches!(err, crate::paging::page::FreeError::InUse(_)));
        drop(err.into_page());

        // Sole holder now; eager free succeeds.
        second.free().unwrap();
    }

    #[test]
    fn test_freed_page_not_retracked() {
        let state = buffer_state(64, 16, 64);
        let paging = Arc::clone(state.kernel_paging());
        let page = state
            .create_page(&Credentials::kernel(), state.space().position(0))
            .unwrap();

        // A stale wrapper outliving every page handle.
        let stale = page.buffer();
        assert_eq!(paging.tracked_count(), 1);
        drop(page); // last holder: release runs here
        assert_eq!(paging.tracked_count(), 0);

        // Accesses through the stale wrapper are rejected and must not
        // silently re-track the freed page.
        let result = stale.get(state.space().position(0));
        assert!(matches!(result, Err(AccessError::PageFreed { .. })));
        let result = stale.set(state.space().position(0), Field::from_u64(1));
        assert!(matches!(result, Err(AccessError::PageFreed { .. })));
        assert_eq!(paging.tracked_count(), 0);
    }

    #[test]
    fn test_memory_reclaimed_on_last_drop() {
        let paging = Arc::new(KernelPaging::new());
        let memory = Arc::new(FieldMemory::new(64));
        let state = BufferSwapState::new(
            Space::new(64),
            16,
            paging,
            Arc::clone(&memory) as Arc<dyn Memory>,
        )
        .unwrap();

        let page = state
            .create_page(&Credentials::kernel(), state.space().position(0))
            .unwrap();
        assert_eq!(memory.allocated(), 16);

        let clone = page.clone();
        drop(page);
        assert_eq!(memory.allocated(), 16); // still held
        drop(clone);
        assert_eq!(memory.allocated(), 0); // released exactly once
    }

    #[test]
    fn test_state_identity() {
        let paging = Arc::new(KernelPaging::new());
        let memory: Arc<dyn Memory> = Arc::new(FieldMemory::new(64));
        let a = BufferSwapState::new(Space::new(64), 16, Arc::clone(&paging), Arc::clone(&memory))
            .unwrap();
        let b =
            BufferSwapState::new(Space::new(64), 16, paging, memory).unwrap();
        assert!(a.matches(a.as_ref()));
        assert!(!a.matches(b.as_ref()));
    }
}
