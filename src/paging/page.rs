//! Pages: fixed-size, reference-counted units of tier content.
//!
//! A [`Page`] is a shared handle. Cloning it registers another holder;
//! dropping the last holder releases the backing store and removes the page
//! from the kernel tracker exactly once, so release can never double-free
//! regardless of caller discipline. [`Page::free`] releases eagerly and
//! refuses dirty pages so modified content cannot be dropped silently.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::device::BlockDriver;
use crate::memory::{Credentials, Memory};
use crate::paging::buffer::{PageBuffer, RawBuffer};
use crate::paging::kernel_paging::KernelPaging;
use crate::paging::swap_state::SwapState;
use crate::region::Region;

/// Unique identifier for a page.
pub type PageId = u64;

/// Global monotonic page ID counter.
static NEXT_PAGE_ID: AtomicUsize = AtomicUsize::new(0);

/// Allocate a new unique page ID.
fn new_page_id() -> PageId {
    NEXT_PAGE_ID.fetch_add(1, Ordering::Relaxed) as PageId
}

#[derive(Error, Debug)]
pub enum FreeError {
    /// The page holds modifications that were never written back. Swap it
    /// out first, then free it; the handle is returned inside the error.
    #[error("page is dirty; write it out before freeing")]
    Dirty(Page),

    /// Other holders still reference the page. The last holder's drop will
    /// release it; the handle is returned inside the error.
    #[error("page has other outstanding holders")]
    InUse(Page),
}

impl FreeError {
    /// Recover the page handle the failed `free` consumed.
    pub fn into_page(self) -> Page {
        match self {
            Self::Dirty(page) | Self::InUse(page) => page,
        }
    }
}

/// What reclaims a page's raw content when it is released.
pub enum PageBacking {
    /// Fields owned by an allocator; released back to it.
    Memory(Arc<dyn Memory>),

    /// A window onto a block device; the device content persists and
    /// nothing is reclaimed.
    Device(Arc<dyn BlockDriver>),
}

impl fmt::Debug for PageBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory(_) => f.write_str("PageBacking::Memory"),
            Self::Device(driver) => write!(f, "PageBacking::Device({})", driver.name()),
        }
    }
}

/// Shared state of one page.
#[derive(Debug)]
pub(crate) struct PageInner {
    id: PageId,
    region: Region,
    swap_state: Arc<dyn SwapState>,
    credentials: Credentials,
    paging: Arc<KernelPaging>,
    /// Per-page lock guarding the whole read/write/install sequence.
    content: Mutex<RawBuffer>,
    backing: PageBacking,
    /// Live `Page` handles.
    holders: AtomicUsize,
    freed: AtomicBool,
}

impl PageInner {
    pub(crate) fn id(&self) -> PageId {
        self.id
    }

    pub(crate) fn region(&self) -> Region {
        self.region
    }

    pub(crate) fn paging(&self) -> &Arc<KernelPaging> {
        &self.paging
    }

    pub(crate) fn holders(&self) -> &AtomicUsize {
        &self.holders
    }

    pub(crate) fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    pub(crate) fn lock_content(&self) -> MutexGuard<'_, RawBuffer> {
        self.content.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Release the page: untrack it, then reclaim the backing content.
    /// Idempotent; only the first call does the work.
    fn release(&self) {
        if self.freed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.paging.is_dirty_id(self.id) {
            warn!(
                page = self.id,
                region = %self.region,
                "Releasing a dirty page that was never written back; its modifications are lost"
            );
        }
        self.paging.remove_id(self.id);
        match &self.backing {
            PageBacking::Memory(memory) => memory.free(&self.credentials, &self.region),
            PageBacking::Device(driver) => {
                trace!(
                    page = self.id,
                    driver = driver.name(),
                    "Released device-backed page; device content persists"
                );
            }
        }
        debug!(page = self.id, region = %self.region, "Page released");
    }
}

/// A reference-counted handle to one page of tier content.
///
/// Identity is the pair (swap state, region). Clone to register another
/// holder; the last holder's drop performs the release.
#[derive(Debug)]
pub struct Page {
    inner: Arc<PageInner>,
}

impl Page {
    /// Build a page over freshly allocated content.
    ///
    /// For [`SwapState`] implementations; callers obtain pages through
    /// [`SwapState::create_page`].
    pub fn new(
        region: Region,
        swap_state: Arc<dyn SwapState>,
        credentials: Credentials,
        content: RawBuffer,
        backing: PageBacking,
    ) -> Self {
        let paging = Arc::clone(swap_state.kernel_paging());
        let inner = Arc::new(PageInner {
            id: new_page_id(),
            region,
            swap_state,
            credentials,
            paging,
            content: Mutex::new(content),
            backing,
            holders: AtomicUsize::new(1),
            freed: AtomicBool::new(false),
        });
        Self { inner }
    }

    /// Rebuild a handle from tracker-held shared state, registering a holder.
    pub(crate) fn from_inner(inner: Arc<PageInner>) -> Self {
        inner.holders.fetch_add(1, Ordering::AcqRel);
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<PageInner> {
        &self.inner
    }

    pub fn id(&self) -> PageId {
        self.inner.id
    }

    pub fn region(&self) -> Region {
        self.inner.region
    }

    /// The tier this page belongs to.
    pub fn swap_state(&self) -> Arc<dyn SwapState> {
        Arc::clone(&self.inner.swap_state)
    }

    /// The tracker this page reports to.
    pub fn kernel_paging(&self) -> &Arc<KernelPaging> {
        &self.inner.paging
    }

    /// The current access wrapper for this page's content.
    ///
    /// Obtaining the wrapper counts as an access; recency is recorded even
    /// if no get/set follows. Re-fetch it for every logical operation
    /// instead of caching it.
    pub fn buffer(&self) -> PageBuffer {
        self.inner.paging.recent_inner(&self.inner);
        PageBuffer::new(Arc::clone(&self.inner))
    }

    /// Number of live holders of this page.
    ///
    /// Informational: eviction and collection policy is built on top of it
    /// by higher layers.
    pub fn reference_count(&self) -> usize {
        self.inner.holders.load(Ordering::Acquire)
    }

    /// Whether the page has already been released.
    pub fn is_freed(&self) -> bool {
        self.inner.is_freed()
    }

    /// Whether the backing content outlives the page (device-backed).
    ///
    /// Write-back bookkeeping treats persistent pages as never holding
    /// unpersisted modifications: their writes go straight through to the
    /// device.
    pub fn is_persistent(&self) -> bool {
        matches!(self.inner.backing, PageBacking::Device(_))
    }

    /// Eagerly release the page: remove it from the tracker and return the
    /// backing content to its allocator.
    ///
    /// Fails on a dirty page (write it out first) and when other holders
    /// remain (their last drop releases instead); both failures hand the
    /// consumed handle back inside the error.
    pub fn free(self) -> Result<(), FreeError> {
        if self.inner.paging.is_dirty_id(self.inner.id) {
            return Err(FreeError::Dirty(self));
        }
        if self.inner.holders.load(Ordering::Acquire) > 1 {
            return Err(FreeError::InUse(self));
        }
        self.inner.release();
        Ok(())
    }
}

impl Clone for Page {
    fn clone(&self) -> Self {
        self.inner.holders.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if self.inner.holders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.release();
        }
    }
}

impl PartialEq for Page {
    /// Identity is (swap state, region).
    fn eq(&self, other: &Self) -> bool {
        self.inner.swap_state.id() == other.inner.swap_state.id()
            && self.inner.region == other.inner.region
    }
}

impl Eq for Page {}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "page{} [{}] tier{}",
            self.inner.id,
            self.inner.region,
            self.inner.swap_state.id()
        )
    }
}
