//! Runtime configuration for page-tier.
//!
//! Configuration can be loaded from a JSON file or constructed
//! programmatically. All tier-related knobs (page size, tier kinds and
//! capacities) live here, and [`PagingConfig::build`] turns a configuration
//! into a ready tier chain.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::MemBlockDriver;
use crate::memory::FieldMemory;
use crate::paging::kernel_paging::KernelPaging;
use crate::paging::swap_state::{BlockSwapState, BufferSwapState, SwapState};
use crate::paging::swapper::{FieldSwapper, SwapSystem, Swapper};
use crate::region::{Size, Space};

/// What backs a configured tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    /// In-memory block device (swapped-out end).
    Block,
    /// Allocator-backed pages written in place.
    Buffer,
    /// Allocator-backed pages with a persistent versioned store.
    Versioned,
}

/// One tier of the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Name used in logs.
    pub name: String,

    /// Backing kind.
    pub kind: TierKind,

    /// Capacity in pages.
    pub capacity_pages: u64,
}

/// Top-level configuration.
///
/// Tiers are listed most-swapped-out first, the order the swap system
/// chains them in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagingConfig {
    /// Positions per page, identical across tiers.
    pub page_size: Size,

    /// Tier chain, coldest first.
    pub tiers: Vec<TierConfig>,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            page_size: 256,
            tiers: vec![
                TierConfig {
                    name: "store".to_string(),
                    kind: TierKind::Block,
                    capacity_pages: 1024,
                },
                TierConfig {
                    name: "fields".to_string(),
                    kind: TierKind::Buffer,
                    capacity_pages: 64,
                },
            ],
        }
    }
}

impl PagingConfig {
    /// Load configuration from a JSON file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: PagingConfig = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(PagingConfig::default())
        }
    }

    /// Build the configured tier chain: a fresh tracker, one swap state per
    /// tier, and a swap system chaining them coldest to hottest.
    pub fn build(&self) -> anyhow::Result<(Arc<KernelPaging>, SwapSystem)> {
        anyhow::ensure!(self.page_size > 0, "page_size must be positive");
        anyhow::ensure!(
            self.tiers.len() >= 2,
            "a tier chain needs at least two tiers, got {}",
            self.tiers.len()
        );

        let paging = Arc::new(KernelPaging::new());
        let mut states: Vec<Arc<dyn SwapState>> = Vec::with_capacity(self.tiers.len());
        for tier in &self.tiers {
            anyhow::ensure!(
                tier.capacity_pages > 0,
                "tier {:?} must hold at least one page",
                tier.name
            );
            let len = self
                .page_size
                .checked_mul(tier.capacity_pages)
                .ok_or_else(|| {
                    anyhow::anyhow!("tier {:?} overflows the addressable space", tier.name)
                })?;
            let space = Space::new(len);
            let capacity = space.len();
            let state: Arc<dyn SwapState> = match tier.kind {
                TierKind::Block => {
                    let driver = Arc::new(MemBlockDriver::new(tier.name.clone(), &space));
                    BlockSwapState::new(space, self.page_size, Arc::clone(&paging), driver)?
                }
                TierKind::Buffer => BufferSwapState::new(
                    space,
                    self.page_size,
                    Arc::clone(&paging),
                    Arc::new(FieldMemory::new(capacity)),
                )?,
                TierKind::Versioned => BufferSwapState::new(
                    space,
                    self.page_size,
                    Arc::clone(&paging),
                    Arc::new(FieldMemory::versioned(capacity)),
                )?,
            };
            tracing::info!(
                tier = %tier.name,
                kind = ?tier.kind,
                capacity_pages = tier.capacity_pages,
                "Configured tier"
            );
            states.push(state);
        }

        let swappers: Vec<Arc<dyn Swapper>> = states
            .windows(2)
            .map(|pair| {
                FieldSwapper::new(Arc::clone(&pair[0]), Arc::clone(&pair[1]))
                    .map(|swapper| Arc::new(swapper) as Arc<dyn Swapper>)
            })
            .collect::<Result<_, _>>()?;

        let system = SwapSystem::new(swappers)?;
        Ok((paging, system))
    }
}
