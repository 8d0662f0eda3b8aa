//! Process-wide recency and dirty tracking for pages.
//!
//! One [`KernelPaging`] instance is shared by every tier of a cache. Pages
//! report into it on each access; eviction policy reads the recency order
//! and write-back sweeps read the dirty partition. It is explicitly injected
//! at tier construction, never ambient, so independent caches can coexist
//! in one process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::trace;

use crate::paging::page::{Page, PageId, PageInner};

#[derive(Debug)]
struct Tracked {
    page: Weak<PageInner>,
    /// Logical clock value of the most recent access.
    tick: u64,
    dirty: bool,
    access_count: u64,
}

/// The kernel's least-recently-used order and dirty/clean partition.
///
/// Internally locked; safe to call from unrelated threads across unrelated
/// tiers and pages. Every mutating call naming a freed page is a no-op;
/// a freed page is never silently re-tracked.
#[derive(Debug, Default)]
pub struct KernelPaging {
    pages: Mutex<HashMap<PageId, Tracked>>,
    /// Logical access clock; strictly increasing across all pages.
    clock: AtomicU64,
}

impl KernelPaging {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PageId, Tracked>> {
        self.pages.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record an access to `page`, moving it to the front of the LRU order.
    pub fn recent(&self, page: &Page) {
        self.recent_inner(page.inner());
    }

    pub(crate) fn recent_inner(&self, inner: &Arc<PageInner>) {
        if inner.is_freed() {
            trace!(page = inner.id(), "Ignoring recency for freed page");
            return;
        }
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        let mut pages = self.lock();
        let entry = pages.entry(inner.id()).or_insert_with(|| Tracked {
            page: Arc::downgrade(inner),
            tick,
            dirty: false,
            access_count: 0,
        });
        entry.tick = tick;
        entry.access_count += 1;
    }

    /// Mark `page` as modified since its last write-back.
    pub fn dirty(&self, page: &Page) {
        self.dirty_inner(page.inner());
    }

    pub(crate) fn dirty_inner(&self, inner: &Arc<PageInner>) {
        if inner.is_freed() {
            trace!(page = inner.id(), "Ignoring dirty mark for freed page");
            return;
        }
        let mut pages = self.lock();
        if let Some(entry) = pages.get_mut(&inner.id()) {
            entry.dirty = true;
        } else {
            let tick = self.clock.fetch_add(1, Ordering::Relaxed);
            pages.insert(
                inner.id(),
                Tracked {
                    page: Arc::downgrade(inner),
                    tick,
                    dirty: true,
                    access_count: 0,
                },
            );
        }
    }

    /// Mark `page` clean, typically after its content was written out.
    pub fn clean(&self, page: &Page) {
        let mut pages = self.lock();
        if let Some(entry) = pages.get_mut(&page.id()) {
            entry.dirty = false;
        }
    }

    /// Stop tracking `page` entirely.
    pub fn remove(&self, page: &Page) {
        self.remove_id(page.id());
    }

    pub(crate) fn remove_id(&self, id: PageId) {
        self.lock().remove(&id);
    }

    pub fn is_dirty(&self, page: &Page) -> bool {
        self.is_dirty_id(page.id())
    }

    pub(crate) fn is_dirty_id(&self, id: PageId) -> bool {
        self.lock().get(&id).map(|e| e.dirty).unwrap_or(false)
    }

    pub fn is_tracked(&self, page: &Page) -> bool {
        self.lock().contains_key(&page.id())
    }

    /// Number of accesses recorded for `page` (buffer fetches, gets, sets).
    pub fn access_count(&self, page: &Page) -> u64 {
        self.lock()
            .get(&page.id())
            .map(|e| e.access_count)
            .unwrap_or(0)
    }

    /// Number of tracked pages.
    pub fn tracked_count(&self) -> usize {
        self.lock().len()
    }

    /// Number of tracked pages currently dirty.
    pub fn dirty_count(&self) -> usize {
        self.lock().values().filter(|e| e.dirty).count()
    }

    /// All dirty pages, for write-back sweeps.
    pub fn dirty_pages(&self) -> Vec<Page> {
        let pages = self.lock();
        pages
            .values()
            .filter(|entry| entry.dirty)
            .filter_map(|entry| entry.page.upgrade())
            .filter(|inner| !inner.is_freed())
            .map(Page::from_inner)
            .collect()
    }

    /// The page least recently accessed, if any survives.
    pub fn least_recent(&self) -> Option<Page> {
        let pages = self.lock();
        pages
            .values()
            .filter(|entry| entry.page.strong_count() > 0)
            .min_by_key(|entry| entry.tick)
            .and_then(|entry| entry.page.upgrade())
            .filter(|inner| !inner.is_freed())
            .map(Page::from_inner)
    }

    /// Select up to `count` eviction candidates, oldest access first.
    ///
    /// Pages in the protected set (e.g. a hot window pinned by a higher
    /// layer) are excluded.
    pub fn eviction_candidates(&self, count: usize, protected: &[PageId]) -> Vec<Page> {
        let pages = self.lock();
        let mut candidates: Vec<(u64, Arc<PageInner>)> = pages
            .iter()
            .filter(|(id, _)| !protected.contains(id))
            .filter_map(|(_, entry)| entry.page.upgrade().map(|inner| (entry.tick, inner)))
            .filter(|(_, inner)| !inner.is_freed())
            .collect();
        candidates.sort_by_key(|(tick, _)| *tick);
        candidates
            .into_iter()
            .take(count)
            .map(|(_, inner)| Page::from_inner(inner))
            .collect()
    }
}
