// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the inquiline project.

//! Cache regions.
//!
//! A region is one contiguous window of guest address space together with
//! the executable slabs and per-address caches serving it. Regions own
//! their slabs and their cached analyses exclusively; erasing a region
//! releases both.

use rustc_hash::FxHashMap;

use crate::{
    analysis::InstAnalysis,
    exec_block::ExecBlock,
    memory::{Address, AddressRange},
};

/// Location of a translated sequence.
///
/// `block_idx` indexes the owning region's slab list, `seq_id` the sequence
/// inside that slab, and `bb_idx` the basic block registry entry the
/// sequence belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SeqLoc {
    pub block_idx: u16,
    pub seq_id: u16,
    pub bb_idx: u16,
}

/// Location of a translated instruction inside a region's slab list.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InstLoc {
    pub block_idx: u16,
    pub inst_id: u16,
}

/// Guest address footprint of a registered basic block.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BBInfo {
    pub start: Address,
    pub end: Address,
}

/// One guest-address window and the translated code hosted for it.
pub struct ExecRegion {
    pub(crate) covered: AddressRange,
    /// Cumulative guest bytes translated into this region.
    pub(crate) translated: u64,
    /// Spare capacity of the region's first slab, net of the reserve kept
    /// for covered-but-untranslated guest code.
    pub(crate) available: u64,
    pub(crate) blocks: Vec<ExecBlock>,
    /// Sequence head addresses to their translated location.
    pub(crate) sequence_cache: FxHashMap<Address, SeqLoc>,
    /// Every translated guest instruction address to its location.
    pub(crate) inst_cache: FxHashMap<Address, InstLoc>,
    pub(crate) analysis_cache: FxHashMap<Address, InstAnalysis>,
    /// Append-only registry of basic blocks; `bb_idx` values index it.
    pub(crate) bb_registry: Vec<BBInfo>,
}

impl ExecRegion {
    pub(crate) fn new(covered: AddressRange) -> Self {
        Self {
            covered,
            translated: 0,
            available: 0,
            blocks: Vec::new(),
            sequence_cache: FxHashMap::default(),
            inst_cache: FxHashMap::default(),
            analysis_cache: FxHashMap::default(),
            bb_registry: Vec::new(),
        }
    }

    /// Guest address window owned by the region.
    #[inline]
    pub fn covered(&self) -> AddressRange {
        self.covered
    }

    /// Executable slabs backing the region, in allocation order.
    #[inline]
    pub fn blocks(&self) -> &[ExecBlock] {
        &self.blocks
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Number of cached sequence entry points, splits included.
    #[inline]
    pub fn sequence_count(&self) -> usize {
        self.sequence_cache.len()
    }

    /// Number of translated guest instruction addresses.
    #[inline]
    pub fn instruction_count(&self) -> usize {
        self.inst_cache.len()
    }

    /// Number of registered basic blocks, splits included.
    #[inline]
    pub fn basic_block_count(&self) -> usize {
        self.bb_registry.len()
    }

    /// Iterates over cached sequence head addresses and their locations.
    pub fn sequences(&self) -> impl Iterator<Item = (Address, SeqLoc)> + '_ {
        self.sequence_cache.iter().map(|(addr, loc)| (*addr, *loc))
    }

    /// Iterates over translated instruction addresses and their locations.
    pub fn instructions(&self) -> impl Iterator<Item = (Address, InstLoc)> + '_ {
        self.inst_cache.iter().map(|(addr, loc)| (*addr, *loc))
    }

    /// Mean occupation ratio across the region's slabs.
    pub(crate) fn mean_occupation(&self) -> f32 {
        if self.blocks.is_empty() {
            return 0.0;
        }
        let total: f32 = self.blocks.iter().map(ExecBlock::occupation_ratio).sum();
        total / self.blocks.len() as f32
    }
}

impl std::fmt::Debug for ExecRegion {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("ExecRegion")
            .field("covered", &self.covered)
            .field("translated", &self.translated)
            .field("available", &self.available)
            .field("blocks", &self.blocks.len())
            .field("sequences", &self.sequence_cache.len())
            .field("basic_blocks", &self.bb_registry.len())
            .finish_non_exhaustive()
    }
}
