//! Demand-paged core: pages, tiers, tracking, and swapping.
//!
//! - [`buffer`]: field values, raw content stores, the access wrapper
//! - [`page`]: reference-counted page handles and release semantics
//! - [`kernel_paging`]: shared LRU + dirty/clean tracker
//! - [`swap_state`]: storage tiers and page creation
//! - [`swapper`]: cross-tier content movers and the tier chain

pub mod buffer;
pub mod kernel_paging;
pub mod page;
pub mod swap_state;
pub mod swapper;
