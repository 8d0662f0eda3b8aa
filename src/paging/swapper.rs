//! Cross-tier content motion: swappers and the swap system.
//!
//! A [`Swapper`] moves content between two adjacent tiers, translating
//! positions between their spaces; [`FieldSwapper`] is the generic
//! implementation, copying point-for-point through ordinary page buffers so
//! no tier needs special-casing. A [`SwapSystem`] owns the whole chain of
//! tiers, ordered most-swapped-out to most-swapped-in, with one swapper per
//! adjacent pair.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::memory::Credentials;
use crate::paging::buffer::AccessError;
use crate::paging::page::{Page, PageId};
use crate::paging::swap_state::{CreatePageError, SwapState, SwapStateId};
use crate::region::{Position, Region};

#[derive(Error, Debug)]
pub enum SwapError {
    #[error("a swap system needs at least one swapper")]
    EmptyChain,

    #[error("swapper {at} does not swap in from the previous swapper's in-state")]
    BrokenChain { at: usize },

    #[error("swap state {state} appears more than once in the chain")]
    DuplicateState { state: SwapStateId },

    #[error("swapper endpoints report to different kernel paging trackers")]
    TrackerMismatch,

    #[error("swap state {state} is not part of this swap system")]
    UnknownState { state: SwapStateId },

    #[error("swap state {state} is already the most swapped-in")]
    NotSwapInable { state: SwapStateId },

    #[error("swap state {state} is already the most swapped-out")]
    NotSwapOutable { state: SwapStateId },

    #[error("no swapper between out-state {out_state} and in-state {in_state}")]
    NoSuchSwapper {
        out_state: SwapStateId,
        in_state: SwapStateId,
    },

    #[error("regions differ in size: {out_size} vs {in_size}")]
    SizeMismatch { out_size: u64, in_size: u64 },

    #[error("page {page} belongs to swap state {actual}, expected {expected}")]
    WrongState {
        page: PageId,
        expected: SwapStateId,
        actual: SwapStateId,
    },

    #[error("region {region} is not contained in page region {page_region}")]
    RegionOutsidePage { region: Region, page_region: Region },

    #[error("position {position} has no counterpart in swap state {state}")]
    Untranslatable {
        position: Position,
        state: SwapStateId,
    },

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    CreatePage(#[from] CreatePageError),
}

/// Moves content between one swapped-out and one swapped-in tier.
///
/// Address translation between the two spaces is the swapper's
/// responsibility; pages only expose their (region, buffer) pair.
pub trait Swapper: Send + Sync + fmt::Debug {
    /// The swapped-out (slower, more persistent) endpoint.
    fn out_state(&self) -> &Arc<dyn SwapState>;

    /// The swapped-in (faster) endpoint.
    fn in_state(&self) -> &Arc<dyn SwapState>;

    /// Translate a position of the out-state's space into the in-state's.
    fn in_position(&self, out_position: Position) -> Position;

    /// Translate a position of the in-state's space into the out-state's.
    fn out_position(&self, in_position: Position) -> Position;

    /// Copy `out_region` of `out_page` into `in_region` of `in_page`
    /// (fault-in). The source page is left unmodified; the destination ends
    /// up clean and recency-tracked.
    fn read_in(
        &self,
        credentials: &Credentials,
        out_page: &Page,
        out_region: &Region,
        in_page: &Page,
        in_region: &Region,
    ) -> Result<(), SwapError>;

    /// Copy `in_region` of `in_page` into `out_region` of `out_page`
    /// (write-back). The source ends up clean; the destination is cleaned
    /// only when its backing persists on its own, so an intermediate tier
    /// holding the sole copy still refuses an eager free. Freeing the
    /// source afterwards is the caller's move.
    fn write_out(
        &self,
        credentials: &Credentials,
        in_page: &Page,
        in_region: &Region,
        out_page: &Page,
        out_region: &Region,
    ) -> Result<(), SwapError>;
}

fn require_page_in_state(page: &Page, state: &Arc<dyn SwapState>) -> Result<(), SwapError> {
    let page_state = page.swap_state();
    if page_state.matches(state.as_ref()) {
        Ok(())
    } else {
        Err(SwapError::WrongState {
            page: page.id(),
            expected: state.id(),
            actual: page_state.id(),
        })
    }
}

fn require_subregion(region: &Region, page: &Page) -> Result<(), SwapError> {
    let page_region = page.region();
    if page_region.contains(region.start()) && page_region.contains(region.end()) {
        Ok(())
    } else {
        Err(SwapError::RegionOutsidePage {
            region: *region,
            page_region,
        })
    }
}

/// Copy fields point-for-point between two equal-sized regions.
///
/// Goes through the ordinary page buffers, so recency bookkeeping happens
/// as for any other access. An absent source entry clears the matching
/// destination slot, so a reused destination page ends up mirroring the
/// source region exactly.
fn copy_fields(
    source_page: &Page,
    source_region: &Region,
    dest_page: &Page,
    dest_region: &Region,
) -> Result<u64, SwapError> {
    if source_region.size() != dest_region.size() {
        return Err(SwapError::SizeMismatch {
            out_size: source_region.size(),
            in_size: dest_region.size(),
        });
    }
    let source = source_page.buffer();
    let dest = dest_page.buffer();
    let mut copied = 0;
    for offset in 0..source_region.size() {
        match source.get(source_region.at(offset))? {
            Some(field) => {
                dest.set(dest_region.at(offset), field)?;
                copied += 1;
            }
            None => dest.clear(dest_region.at(offset))?,
        }
    }
    Ok(copied)
}

/// Generic field-copying swapper between any two tiers.
#[derive(Debug)]
pub struct FieldSwapper {
    out_state: Arc<dyn SwapState>,
    in_state: Arc<dyn SwapState>,
}

impl FieldSwapper {
    pub fn new(
        out_state: Arc<dyn SwapState>,
        in_state: Arc<dyn SwapState>,
    ) -> Result<Self, SwapError> {
        if out_state.matches(in_state.as_ref()) {
            return Err(SwapError::DuplicateState {
                state: out_state.id(),
            });
        }
        if !Arc::ptr_eq(out_state.kernel_paging(), in_state.kernel_paging()) {
            return Err(SwapError::TrackerMismatch);
        }
        Ok(Self {
            out_state,
            in_state,
        })
    }
}

impl Swapper for FieldSwapper {
    fn out_state(&self) -> &Arc<dyn SwapState> {
        &self.out_state
    }

    fn in_state(&self) -> &Arc<dyn SwapState> {
        &self.in_state
    }

    fn in_position(&self, out_position: Position) -> Position {
        self.in_state.space().from(out_position)
    }

    fn out_position(&self, in_position: Position) -> Position {
        self.out_state.space().from(in_position)
    }

    fn read_in(
        &self,
        credentials: &Credentials,
        out_page: &Page,
        out_region: &Region,
        in_page: &Page,
        in_region: &Region,
    ) -> Result<(), SwapError> {
        require_page_in_state(out_page, &self.out_state)?;
        require_page_in_state(in_page, &self.in_state)?;
        require_subregion(out_region, out_page)?;
        require_subregion(in_region, in_page)?;

        let copied = copy_fields(out_page, out_region, in_page, in_region)?;

        // The destination now mirrors the persistent source.
        let paging = self.in_state.kernel_paging();
        paging.clean(in_page);

        debug!(
            credentials = %credentials,
            out_page = out_page.id(),
            in_page = in_page.id(),
            copied,
            "Read in"
        );
        Ok(())
    }

    fn write_out(
        &self,
        credentials: &Credentials,
        in_page: &Page,
        in_region: &Region,
        out_page: &Page,
        out_region: &Region,
    ) -> Result<(), SwapError> {
        require_page_in_state(in_page, &self.in_state)?;
        require_page_in_state(out_page, &self.out_state)?;
        require_subregion(in_region, in_page)?;
        require_subregion(out_region, out_page)?;

        let copied = copy_fields(in_page, in_region, out_page, out_region)?;

        // The source's content now also lives one tier out, so it is clean.
        // The destination keeps the dirty mark the copy produced unless its
        // backing persists on its own: a memory-backed intermediate tier may
        // now hold the only copy, and must keep refusing an eager free until
        // the next write-out.
        let paging = self.in_state.kernel_paging();
        paging.clean(in_page);
        if out_page.is_persistent() {
            paging.clean(out_page);
        }

        debug!(
            credentials = %credentials,
            in_page = in_page.id(),
            out_page = out_page.id(),
            copied,
            "Wrote out"
        );
        Ok(())
    }
}

/// The full tier chain of one cache, most-swapped-out first.
///
/// Aggregates one swapper per adjacent (out-tier, in-tier) pair and selects
/// them by tier identity.
#[derive(Debug)]
pub struct SwapSystem {
    states: Vec<Arc<dyn SwapState>>,
    swappers: Vec<Arc<dyn Swapper>>,
}

impl SwapSystem {
    /// Build a swap system from a chain of swappers.
    ///
    /// `swappers[0]` swaps in from the most-swapped-out state; every
    /// following swapper must swap in from its predecessor's in-state, and
    /// no state may appear twice.
    pub fn new(swappers: Vec<Arc<dyn Swapper>>) -> Result<Self, SwapError> {
        let first = swappers.first().ok_or(SwapError::EmptyChain)?;
        let mut states: Vec<Arc<dyn SwapState>> = vec![Arc::clone(first.out_state())];
        for (at, swapper) in swappers.iter().enumerate() {
            if !swapper.out_state().matches(states[at].as_ref()) {
                return Err(SwapError::BrokenChain { at });
            }
            states.push(Arc::clone(swapper.in_state()));
        }
        for i in 0..states.len() {
            for later in &states[i + 1..] {
                if states[i].matches(later.as_ref()) {
                    return Err(SwapError::DuplicateState {
                        state: states[i].id(),
                    });
                }
            }
        }
        debug!(tiers = states.len(), "Built swap system");
        Ok(Self { states, swappers })
    }

    fn index_of(&self, state: &dyn SwapState) -> Result<usize, SwapError> {
        self.states
            .iter()
            .position(|candidate| candidate.matches(state))
            .ok_or(SwapError::UnknownState { state: state.id() })
    }

    /// All tiers, most-swapped-out first.
    pub fn swap_states(&self) -> &[Arc<dyn SwapState>] {
        &self.states
    }

    /// The most-swapped-out (most persistent) tier.
    pub fn swapped_out(&self) -> &Arc<dyn SwapState> {
        &self.states[0]
    }

    /// The most-swapped-in tier, whose pages expose directly usable fields.
    pub fn swapped_in_to_fields(&self) -> &Arc<dyn SwapState> {
        &self.states[self.states.len() - 1]
    }

    /// The tier content moves to when swapping in from `out_state`.
    pub fn in_from(&self, out_state: &dyn SwapState) -> Result<&Arc<dyn SwapState>, SwapError> {
        let index = self.index_of(out_state)?;
        if index + 1 < self.states.len() {
            Ok(&self.states[index + 1])
        } else {
            Err(SwapError::NotSwapInable {
                state: out_state.id(),
            })
        }
    }

    /// Every tier further in than `state`, nearest first.
    pub fn in_swap_states(
        &self,
        state: &dyn SwapState,
    ) -> Result<&[Arc<dyn SwapState>], SwapError> {
        let index = self.index_of(state)?;
        Ok(&self.states[index + 1..])
    }

    /// Every tier further out than `state`, most-swapped-out first.
    pub fn out_swap_states(
        &self,
        state: &dyn SwapState,
    ) -> Result<&[Arc<dyn SwapState>], SwapError> {
        let index = self.index_of(state)?;
        Ok(&self.states[..index])
    }

    /// The tier content moves to when swapping out from `in_state`.
    pub fn out_from(&self, in_state: &dyn SwapState) -> Result<&Arc<dyn SwapState>, SwapError> {
        let index = self.index_of(in_state)?;
        if index > 0 {
            Ok(&self.states[index - 1])
        } else {
            Err(SwapError::NotSwapOutable {
                state: in_state.id(),
            })
        }
    }

    /// Whether content in `state` can move further in.
    pub fn is_swap_inable(&self, state: &dyn SwapState) -> bool {
        matches!(self.index_of(state), Ok(index) if index + 1 < self.states.len())
    }

    /// Whether content in `state` can move further out.
    pub fn is_swap_outable(&self, state: &dyn SwapState) -> bool {
        matches!(self.index_of(state), Ok(index) if index > 0)
    }

    /// The swapper moving content between the adjacent pair
    /// (`out_state`, `in_state`).
    pub fn swapper(
        &self,
        out_state: &dyn SwapState,
        in_state: &dyn SwapState,
    ) -> Result<&Arc<dyn Swapper>, SwapError> {
        let out_index = self.index_of(out_state)?;
        let in_index = self.index_of(in_state)?;
        if in_index == out_index + 1 {
            Ok(&self.swappers[out_index])
        } else {
            Err(SwapError::NoSuchSwapper {
                out_state: out_state.id(),
                in_state: in_state.id(),
            })
        }
    }

    /// Fault a whole page one tier inward: create the peer page at the
    /// translated position and copy the content. The source page is left
    /// unmodified.
    pub fn swap_in(&self, credentials: &Credentials, out_page: &Page) -> Result<Page, SwapError> {
        let out_state = out_page.swap_state();
        let index = self.index_of(out_state.as_ref())?;
        if index + 1 >= self.states.len() {
            return Err(SwapError::NotSwapInable {
                state: out_state.id(),
            });
        }
        let swapper = &self.swappers[index];

        let start = swapper.in_position(out_page.region().start());
        if start.is_out_of_bounds() {
            return Err(SwapError::Untranslatable {
                position: out_page.region().start(),
                state: swapper.in_state().id(),
            });
        }
        let in_page = swapper.in_state().create_page(credentials, start)?;
        swapper.read_in(
            credentials,
            out_page,
            &out_page.region(),
            &in_page,
            &in_page.region(),
        )?;
        Ok(in_page)
    }

    /// Write a whole page one tier outward: create the peer page at the
    /// translated position and copy the content. The source ends up clean
    /// and the caller frees it once it is done; the new page stays dirty
    /// until its own content reaches a persistent tier.
    pub fn swap_out(&self, credentials: &Credentials, in_page: &Page) -> Result<Page, SwapError> {
        let in_state = in_page.swap_state();
        let index = self.index_of(in_state.as_ref())?;
        if index == 0 {
            return Err(SwapError::NotSwapOutable {
                state: in_state.id(),
            });
        }
        let swapper = &self.swappers[index - 1];

        let start = swapper.out_position(in_page.region().start());
        if start.is_out_of_bounds() {
            warn!(
                page = in_page.id(),
                position = %in_page.region().start(),
                "Page start has no counterpart in the out-tier"
            );
            return Err(SwapError::Untranslatable {
                position: in_page.region().start(),
                state: swapper.out_state().id(),
            });
        }
        let out_page = swapper.out_state().create_page(credentials, start)?;
        swapper.write_out(
            credentials,
            in_page,
            &in_page.region(),
            &out_page,
            &out_page.region(),
        )?;
        Ok(out_page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FieldMemory;
    use crate::paging::buffer::Field;
    use crate::paging::kernel_paging::KernelPaging;
    use crate::paging::swap_state::BufferSwapState;
    use crate::region::Space;

    fn chain(tiers: usize) -> (Arc<KernelPaging>, Vec<Arc<dyn SwapState>>, SwapSystem) {
        let paging = Arc::new(KernelPaging::new());
        let states: Vec<Arc<dyn SwapState>> = (0..tiers)
            .map(|_| {
                BufferSwapState::new(
                    Space::new(64),
                    16,
                    Arc::clone(&paging),
                    Arc::new(FieldMemory::new(64)),
                )
                .unwrap() as Arc<dyn SwapState>
            })
            .collect();
        let swappers: Vec<Arc<dyn Swapper>> = states
            .windows(2)
            .map(|pair| {
                Arc::new(FieldSwapper::new(Arc::clone(&pair[0]), Arc::clone(&pair[1])).unwrap())
                    as Arc<dyn Swapper>
            })
            .collect();
        let system = SwapSystem::new(swappers).unwrap();
        (paging, states, system)
    }

    #[test]
    fn test_chain_navigation() {
        let (_paging, states, system) = chain(3);

        assert!(system.swapped_out().matches(states[0].as_ref()));
        assert!(system.swapped_in_to_fields().matches(states[2].as_ref()));

        assert!(system
            .in_from(states[0].as_ref())
            .unwrap()
            .matches(states[1].as_ref()));
        assert!(system
            .out_from(states[2].as_ref())
            .unwrap()
            .matches(states[1].as_ref()));

        assert!(!system.is_swap_inable(states[2].as_ref()));
        assert!(!system.is_swap_outable(states[0].as_ref()));
        assert!(system.is_swap_inable(states[1].as_ref()));
        assert!(system.is_swap_outable(states[1].as_ref()));

        let inward = system.in_swap_states(states[0].as_ref()).unwrap();
        assert_eq!(inward.len(), 2);
        assert!(inward[0].matches(states[1].as_ref()));
        let outward = system.out_swap_states(states[2].as_ref()).unwrap();
        assert_eq!(outward.len(), 2);
        assert!(outward[1].matches(states[1].as_ref()));
        assert!(system.in_swap_states(states[2].as_ref()).unwrap().is_empty());
        assert!(system.out_swap_states(states[0].as_ref()).unwrap().is_empty());

        assert!(system
            .swapper(states[0].as_ref(), states[1].as_ref())
            .is_ok());
        assert!(matches!(
            system.swapper(states[0].as_ref(), states[2].as_ref()),
            Err(SwapError::NoSuchSwapper { .. })
        ));
    }

    #[test]
    fn test_unknown_state_rejected() {
        let (paging, _states, system) = chain(2);
        let stranger = BufferSwapState::new(
            Space::new(64),
            16,
            paging,
            Arc::new(FieldMemory::new(64)),
        )
        .unwrap();
        assert!(matches!(
            system.in_from(stranger.as_ref()),
            Err(SwapError::UnknownState { .. })
        ));
    }

    #[test]
    fn test_read_in_copies_without_modifying_source() {
        let (paging, states, system) = chain(2);
        let credentials = Credentials::kernel();

        let out_page = states[0]
            .create_page(&credentials, states[0].space().position(0))
            .unwrap();
        for i in 0..16 {
            out_page
                .buffer()
                .set(out_page.region().at(i), Field::from_u64(i))
                .unwrap();
        }
        paging.clean(&out_page);

        let in_page = system.swap_in(&credentials, &out_page).unwrap();

        for i in 0..16 {
            assert_eq!(
                in_page.buffer().get(in_page.region().at(i)).unwrap(),
                Some(Field::from_u64(i))
            );
            // Copy, not move: the source still holds its content.
            assert_eq!(
                out_page.buffer().get(out_page.region().at(i)).unwrap(),
                Some(Field::from_u64(i))
            );
        }

        // The freshly faulted-in page is clean.
        assert!(!paging.is_dirty(&in_page));
    }

    #[test]
    fn test_write_out_cleans_source() {
        let (paging, states, system) = chain(2);
        let credentials = Credentials::kernel();

        let in_page = states[1]
            .create_page(&credentials, states[1].space().position(16))
            .unwrap();
        in_page
            .buffer()
            .set(in_page.region().at(3), Field::from_u64(99))
            .unwrap();
        assert!(paging.is_dirty(&in_page));

        let out_page = system.swap_out(&credentials, &in_page).unwrap();
        assert!(!paging.is_dirty(&in_page));
        assert_eq!(
            out_page.buffer().get(out_page.region().at(3)).unwrap(),
            Some(Field::from_u64(99))
        );

        // Now clean, the source frees without complaint.
        in_page.free().unwrap();
    }

    #[test]
    fn test_intermediate_tier_keeps_only_copy_dirty() {
        let (paging, states, system) = chain(3);
        let credentials = Credentials::kernel();

        let hot = states[2]
            .create_page(&credentials, states[2].space().position(0))
            .unwrap();
        hot.buffer()
            .set(hot.region().at(3), Field::from_u64(7))
            .unwrap();

        // After the write-out the middle tier holds the only copy: it must
        // stay dirty, and an eager free must be refused.
        let mid = system.swap_out(&credentials, &hot).unwrap();
        assert!(!paging.is_dirty(&hot));
        hot.free().unwrap();

        assert!(paging.is_dirty(&mid));
        let err = mid.free().unwrap_err();
        assert!(matches!(err, crate::paging::page::FreeError::Dirty(_)));

        // Writing the middle tier out in turn makes it freeable.
        let mid = err.into_page();
        let cold = system.swap_out(&credentials, &mid).unwrap();
        assert!(!paging.is_dirty(&mid));
        mid.free().unwrap();
        assert_eq!(
            cold.buffer().get(cold.region().at(3)).unwrap(),
            Some(Field::from_u64(7))
        );
    }

    #[test]
    fn test_read_in_clears_stale_destination_fields() {
        let (paging, states, system) = chain(2);
        let credentials = Credentials::kernel();

        // Sparse source: a single field at offset 3.
        let out_page = states[0]
            .create_page(&credentials, states[0].space().position(0))
            .unwrap();
        out_page
            .buffer()
            .set(out_page.region().at(3), Field::from_u64(1))
            .unwrap();
        paging.clean(&out_page);

        // A reused destination full of stale content.
        let in_page = states[1]
            .create_page(&credentials, states[1].space().position(0))
            .unwrap();
        for i in 0..16 {
            in_page
                .buffer()
                .set(in_page.region().at(i), Field::from_u64(99))
                .unwrap();
        }

        let swapper = system.swapper(states[0].as_ref(), states[1].as_ref()).unwrap();
        swapper
            .read_in(
                &credentials,
                &out_page,
                &out_page.region(),
                &in_page,
                &in_page.region(),
            )
            .unwrap();

        // The destination mirrors the source exactly: stale fields are gone.
        for i in 0..16 {
            let expected = if i == 3 { Some(Field::from_u64(1)) } else { None };
            assert_eq!(
                in_page.buffer().get(in_page.region().at(i)).unwrap(),
                expected
            );
        }
        assert!(!paging.is_dirty(&in_page));
    }

    #[test]
    fn test_broken_chain_rejected() {
        let paging = Arc::new(KernelPaging::new());
        let make = || {
            BufferSwapState::new(
                Space::new(64),
                16,
                Arc::clone(&paging),
                Arc::new(FieldMemory::new(64)),
            )
            .unwrap() as Arc<dyn SwapState>
        };
        let (a, b, c, d) = (make(), make(), make(), make());

        let swappers: Vec<Arc<dyn Swapper>> = vec![
            Arc::new(FieldSwapper::new(a, b).unwrap()),
            // c does not continue from b.
            Arc::new(FieldSwapper::new(c, d).unwrap()),
        ];
        assert!(matches!(
            SwapSystem::new(swappers),
            Err(SwapError::BrokenChain { at: 1 })
        ));
    }
}
