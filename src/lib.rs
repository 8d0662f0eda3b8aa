//! page-tier: demand-paged tiered page cache.
//!
//! Storage tiers ([`paging::swap_state::SwapState`]) hand out fixed-size,
//! reference-counted pages over an abstract coordinate system. Every access
//! goes through a wrapper that feeds a shared LRU/dirty tracker
//! ([`paging::kernel_paging::KernelPaging`]), and content moves between
//! tiers through swappers aggregated in a
//! [`paging::swapper::SwapSystem`]:
//!
//! ```text
//! block device (cold) → in-place buffers (warm) → versioned buffers (hot)
//! ```
//!
//! The crate is a passive, synchronous library: callers bring their own
//! threads, and every operation either completes or raises a failure
//! synchronously.

pub mod config;
pub mod device;
pub mod memory;
pub mod paging;
pub mod region;

pub use config::{PagingConfig, TierConfig, TierKind};
pub use device::{BlockDriver, DeviceError, MemBlockDriver};
pub use memory::{AllocationError, Credentials, FieldMemory, Memory};
pub use paging::buffer::{AccessError, Field, PageBuffer, RawBuffer, StoreKind};
pub use paging::kernel_paging::KernelPaging;
pub use paging::page::{FreeError, Page, PageBacking, PageId};
pub use paging::swap_state::{
    BlockSwapState, BufferSwapState, CreatePageError, SwapState, SwapStateId,
};
pub use paging::swapper::{FieldSwapper, SwapError, SwapSystem, Swapper};
pub use region::{AddressingError, Position, Region, Size, Space, SpaceId};
