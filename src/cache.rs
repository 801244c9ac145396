// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the inquiline project.

//! The execution block manager.
//!
//! [`ExecBlockManager`] is the caching and lookup layer between the
//! translator and the dispatcher. It owns every translated code buffer,
//! maps guest instruction addresses to translated locations, splits
//! translated sequences on demand, invalidates regions when guest code
//! changes, and serves cached instruction analyses.
//!
//! Regions are kept sorted by covered start address; a one-slot MRU cache
//! short-circuits repeated searches for the same address. Admission of a
//! new basic block either reuses a region that already covers it, extends
//! a nearby region whose spare capacity affords the growth, or inserts a
//! fresh region in sorted position. Invalidation is two-phase: overlapping
//! regions are queued by [`ExecBlockManager::clear_cache`] and erased,
//! highest index first, by [`ExecBlockManager::flush_commit`].

pub mod region;

use nix::errno::Errno;
use rustc_hash::FxHashMap;

use crate::{
    analysis::{AnalysisType, InstAnalysis},
    exec_block::{ExecBlock, SeqType},
    memory::{Address, AddressRange},
    patch::{InstMetadata, Patch},
    tracing::{self, TraceItem},
};
pub use region::{BBInfo, ExecRegion, InstLoc, SeqLoc};

#[derive(Copy, Clone, Debug, Default)]
struct SearchCache {
    address: Address,
    region_idx: usize,
}

/// Owner of all translated code and of the guest-to-host mappings.
pub struct ExecBlockManager {
    regions: Vec<ExecRegion>,
    /// Analyses of instructions not belonging to any region.
    analysis_cache: FxHashMap<Address, InstAnalysis>,
    /// Region indices queued for erasure at the next flush commit.
    flush_list: Vec<usize>,
    search_cache: SearchCache,
    /// Cumulative guest bytes translated, starting at 1 so the expansion
    /// ratio is always defined.
    total_translated_size: u64,
    /// Cumulative host bytes emitted, starting at 1.
    total_translation_size: u64,
}

impl Default for ExecBlockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecBlockManager {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            analysis_cache: FxHashMap::default(),
            flush_list: Vec::new(),
            search_cache: SearchCache::default(),
            total_translated_size: 1,
            total_translation_size: 1,
        }
    }

    /// Regions currently owned by the manager, sorted by covered start.
    #[inline]
    pub fn regions(&self) -> &[ExecRegion] {
        &self.regions
    }

    /// Current guest-to-host bloat estimate, host bytes per guest byte.
    pub fn expansion_ratio(&self) -> f32 {
        tracing::event!(
            target: TraceItem::Region.as_str(),
            tracing::Level::TRACE,
            "Expansion ratio {} / {}",
            self.total_translation_size,
            self.total_translated_size,
        );
        self.total_translation_size as f32 / self.total_translated_size as f32
    }

    /// Index of the region covering `address`, or of the rightmost region
    /// whose start is below it.
    ///
    /// Callers must verify that the returned region actually contains
    /// `address` before treating it as a hit; admission uses the closest
    /// region as the starting point of its extension search.
    fn search_region(&mut self, address: Address) -> usize {
        if self.regions.is_empty() {
            return 0;
        }
        if self.search_cache.address == address {
            tracing::event!(
                target: TraceItem::Region.as_str(),
                tracing::Level::TRACE,
                "Search cache hit for {} in region {}",
                address,
                self.search_cache.region_idx,
            );
            return self.search_cache.region_idx;
        }
        let mut low = 0;
        let mut high = self.regions.len();
        while low + 1 != high {
            let idx = (low + high) / 2;
            if self.regions[idx].covered.start > address {
                high = idx;
            } else if self.regions[idx].covered.end <= address {
                low = idx;
            } else {
                tracing::event!(
                    target: TraceItem::Region.as_str(),
                    tracing::Level::TRACE,
                    "Exact match for {} in region {} {}",
                    address,
                    idx,
                    self.regions[idx].covered,
                );
                self.search_cache = SearchCache {
                    address,
                    region_idx: idx,
                };
                return idx;
            }
        }
        tracing::event!(
            target: TraceItem::Region.as_str(),
            tracing::Level::TRACE,
            "Low match for {} in region {} {}",
            address,
            low,
            self.regions[low].covered,
        );
        self.search_cache = SearchCache {
            address,
            region_idx: low,
        };
        low
    }

    /// Selects the region hosting a new basic block covering `code_range`,
    /// extending or creating one as needed.
    fn find_region(&mut self, code_range: AddressRange) -> usize {
        let low = self.search_region(code_range.start);
        let ratio = self.expansion_ratio();
        let mut best_region = self.regions.len();
        let mut best_cost = u64::MAX;
        for i in low..(low + 3).min(self.regions.len()) {
            // Easy case: the code range is inside one of the regions.
            if self.regions[i].covered.contains_range(&code_range) {
                tracing::event!(
                    target: TraceItem::Region.as_str(),
                    tracing::Level::TRACE,
                    "Basic block {} assigned to region {} {}",
                    code_range,
                    i,
                    self.regions[i].covered,
                );
                self.search_cache = SearchCache {
                    address: code_range.start,
                    region_idx: i,
                };
                return i;
            }
            // Hard case: guest bytes the region would have to grow by to
            // cover the range, weighted by the expansion ratio, must fit in
            // the region's spare capacity.
            let covered = self.regions[i].covered;
            let cost = code_range.end.0.saturating_sub(covered.end.0)
                + covered.start.0.saturating_sub(code_range.start.0);
            if ((cost as f32 * ratio) as u64) < self.regions[i].available && cost < best_cost {
                best_cost = cost;
                best_region = i;
            }
        }
        if best_region != self.regions.len() {
            tracing::event!(
                target: TraceItem::Region.as_str(),
                tracing::Level::TRACE,
                "Extending region {} {} to cover basic block {}",
                best_region,
                self.regions[best_region].covered,
                code_range,
            );
            let covered = &mut self.regions[best_region].covered;
            if covered.end < code_range.end {
                covered.end = code_range.end;
            }
            if covered.start > code_range.start {
                covered.start = code_range.start;
            }
            self.search_cache = SearchCache {
                address: code_range.start,
                region_idx: best_region,
            };
            return best_region;
        }
        // Else create a new region at its sorted position.
        let mut insert = low;
        while insert < self.regions.len() {
            if self.regions[insert].covered.start > code_range.start {
                break;
            }
            insert += 1;
        }
        tracing::event!(
            target: TraceItem::Region.as_str(),
            tracing::Level::TRACE,
            "Creating new region {} to cover basic block {}",
            insert,
            code_range,
        );
        self.regions.insert(insert, ExecRegion::new(code_range));
        self.search_cache = SearchCache {
            address: code_range.start,
            region_idx: insert,
        };
        insert
    }

    /// Translates `basic_block` into one or more sequences and records the
    /// guest-to-host mappings.
    ///
    /// On return the block is either freshly written or was already cached.
    /// `basic_block` must be non-empty, in ascending contiguous guest
    /// order.
    pub fn write_basic_block(&mut self, basic_block: &[Patch]) -> Result<(), Errno> {
        assert!(!basic_block.is_empty());
        let first = basic_block[0].metadata.address;
        let code_range =
            AddressRange::new(first, basic_block[basic_block.len() - 1].guest_end());
        let r = self.find_region(code_range);

        // Truncate against already cached sequences to prevent dedoubled
        // translations.
        let mut patch_end = basic_block.len();
        for (i, patch) in basic_block.iter().enumerate() {
            if self.regions[r]
                .sequence_cache
                .contains_key(&patch.metadata.address)
            {
                patch_end = i;
                break;
            }
        }
        if patch_end == 0 {
            tracing::event!(
                target: TraceItem::WriteBlock.as_str(),
                tracing::Level::TRACE,
                "Cache hit, basic block {} already exists",
                first,
            );
            return Ok(());
        }
        tracing::event!(
            target: TraceItem::WriteBlock.as_str(),
            tracing::Level::TRACE,
            "Writing new basic block {}",
            first,
        );

        self.regions[r].bb_registry.push(BBInfo {
            start: code_range.start,
            end: code_range.end,
        });
        let bb_idx = (self.regions[r].bb_registry.len() - 1) as u16;

        let mut translated = 0_u64;
        let mut translation = 0_u64;
        let mut patch_idx = 0_usize;
        // Write the basic block as one or more sequences, spilling into
        // additional slabs when the current ones refuse the write.
        while patch_idx < patch_end {
            let mut i = 0_usize;
            loop {
                if i >= self.regions[r].blocks.len() {
                    // Optimally a region has a single slab; mispredictions
                    // or oversized basic blocks cause overflows.
                    self.regions[r].blocks.push(ExecBlock::new()?);
                }
                let mut seq_type = SeqType::empty();
                if patch_idx == 0 {
                    seq_type |= SeqType::ENTRY;
                }
                if patch_end == basic_block.len() {
                    seq_type |= SeqType::EXIT;
                }
                let region = &mut self.regions[r];
                if let Some(res) =
                    region.blocks[i].write_sequence(&basic_block[patch_idx..patch_end], seq_type)
                {
                    let head = basic_block[patch_idx].metadata.address;
                    region.sequence_cache.insert(
                        head,
                        SeqLoc {
                            block_idx: i as u16,
                            seq_id: res.seq_id,
                            bb_idx,
                        },
                    );
                    let start_id = region.blocks[i].seq_start(res.seq_id);
                    let end_id = region.blocks[i].seq_end(res.seq_id);
                    for id in start_id..=end_id {
                        let patch = &basic_block[patch_idx + usize::from(id - start_id)];
                        region.inst_cache.insert(
                            patch.metadata.address,
                            InstLoc {
                                block_idx: i as u16,
                                inst_id: id,
                            },
                        );
                    }
                    let written_end =
                        basic_block[patch_idx + usize::from(res.patch_written) - 1].guest_end();
                    tracing::event!(
                        target: TraceItem::WriteBlock.as_str(),
                        tracing::Level::TRACE,
                        "Sequence {}-{} written in block {} as seqID {}",
                        head,
                        written_end,
                        i,
                        res.seq_id,
                    );
                    translated += written_end.0 - head.0;
                    translation += u64::from(res.bytes_written);
                    patch_idx += usize::from(res.patch_written);
                    break;
                }
                i += 1;
            }
        }
        self.total_translation_size += translation;
        self.total_translated_size += translated;
        self.update_region_stat(r, translated);
        Ok(())
    }

    fn update_region_stat(&mut self, r: usize, translated: u64) {
        let ratio = self.expansion_ratio();
        let region = &mut self.regions[r];
        region.translated += translated;
        // Spare slab space, with a reserve held back for the covered guest
        // code not yet translated. The first slab stands proxy for the
        // whole region.
        let available = region.blocks[0].epilogue_offset() as u64;
        let untranslated = region.covered.size().saturating_sub(region.translated);
        let reserved = (untranslated as f32 * ratio) as u64;
        region.available = available.saturating_sub(reserved);
        tracing::event!(
            target: TraceItem::Region.as_str(),
            tracing::Level::TRACE,
            "Region {} has {} bytes available of which {} are reserved for {} bytes of untranslated code",
            r,
            available,
            reserved,
            untranslated,
        );
    }

    /// Resolves `address` to a runnable sequence, splitting an existing
    /// sequence mid-stream when `address` falls inside one.
    pub fn get_seq_loc(&mut self, address: Address) -> Option<SeqLoc> {
        let r = self.search_region(address);
        if r < self.regions.len() && self.regions[r].covered.contains(address) {
            let region = &mut self.regions[r];
            // Attempt sequence cache resolution.
            if let Some(&loc) = region.sequence_cache.get(&address) {
                tracing::event!(
                    target: TraceItem::CacheLookup.as_str(),
                    tracing::Level::TRACE,
                    "Found sequence {} in block {} as seqID {}",
                    address,
                    loc.block_idx,
                    loc.seq_id,
                );
                return Some(loc);
            }
            // Attempt instruction cache resolution.
            if let Some(&InstLoc { block_idx, inst_id }) = region.inst_cache.get(&address) {
                let block = &region.blocks[usize::from(block_idx)];
                let existing_seq_id = block.seq_id_of(inst_id);
                let existing_bb_address = block.inst_address(block.seq_start(existing_seq_id));
                let existing_bb_idx = region.sequence_cache[&existing_bb_address].bb_idx;
                // Register the new basic block entered mid-stream.
                region.bb_registry.push(BBInfo {
                    start: address,
                    end: region.bb_registry[usize::from(existing_bb_idx)].end,
                });
                let new_bb_idx = (region.bb_registry.len() - 1) as u16;
                let new_seq_id = region.blocks[usize::from(block_idx)].split_sequence(inst_id);
                let loc = SeqLoc {
                    block_idx,
                    seq_id: new_seq_id,
                    bb_idx: new_bb_idx,
                };
                region.sequence_cache.insert(address, loc);
                tracing::event!(
                    target: TraceItem::CacheLookup.as_str(),
                    tracing::Level::TRACE,
                    "Split seqID {} at instID {} in block {} as new seqID {}",
                    existing_seq_id,
                    inst_id,
                    block_idx,
                    new_seq_id,
                );
                return Some(loc);
            }
        }
        tracing::event!(
            target: TraceItem::CacheLookup.as_str(),
            tracing::Level::TRACE,
            "Cache miss for sequence {}",
            address,
        );
        None
    }

    /// Resolves `address` like [`Self::get_seq_loc`] and arms the slab's
    /// dispatcher selector on the resolved sequence.
    pub fn get_exec_block(&mut self, address: Address) -> Option<&mut ExecBlock> {
        let loc = self.get_seq_loc(address)?;
        // The lookup above just resolved the region for `address`, so the
        // search cache answers directly.
        let r = self.search_region(address);
        let block = &mut self.regions[r].blocks[usize::from(loc.block_idx)];
        block.select_seq(loc.seq_id);
        Some(block)
    }

    /// Basic block footprint of the sequence starting exactly at `address`.
    ///
    /// Strict: hits only on sequence heads and never splits.
    pub fn get_bb_info(&mut self, address: Address) -> Option<BBInfo> {
        let r = self.search_region(address);
        if r < self.regions.len() && self.regions[r].covered.contains(address) {
            if let Some(loc) = self.regions[r].sequence_cache.get(&address) {
                return Some(self.regions[r].bb_registry[usize::from(loc.bb_idx)]);
            }
        }
        None
    }

    /// Returns a cached analysis of `metadata` covering at least the
    /// facets of `ty`, building and caching one if needed.
    ///
    /// Analyses of instructions inside a region live and die with it;
    /// others go to the manager-global cache, purged at flush commit.
    pub fn analyze_inst_metadata(
        &mut self,
        metadata: &InstMetadata,
        ty: AnalysisType,
    ) -> &InstAnalysis {
        use std::collections::hash_map::Entry;

        let address = metadata.address;
        let r = self.search_region(address);
        let in_region = r < self.regions.len() && self.regions[r].covered.contains(address);
        let cache = if in_region {
            tracing::event!(
                target: TraceItem::Analysis.as_str(),
                tracing::Level::TRACE,
                "Analysis of instruction {} cached in region {}",
                address,
                r,
            );
            &mut self.regions[r].analysis_cache
        } else {
            tracing::event!(
                target: TraceItem::Analysis.as_str(),
                tracing::Level::TRACE,
                "Analysis of instruction {} cached in global cache",
                address,
            );
            &mut self.analysis_cache
        };
        match cache.entry(address) {
            Entry::Occupied(mut entry) => {
                if !entry.get().analysis_type.contains(ty) {
                    // The cached analysis misses requested facets; the
                    // rebuilt one supersedes it.
                    entry.insert(InstAnalysis::build(metadata, ty));
                }
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(InstAnalysis::build(metadata, ty)),
        }
    }

    /// Queues every region overlapping `range` for erasure at the next
    /// [`Self::flush_commit`]. Queued regions remain queryable until then.
    pub fn clear_cache(&mut self, range: AddressRange) {
        tracing::event!(
            target: TraceItem::Invalidate.as_str(),
            tracing::Level::TRACE,
            "Erasing range {}",
            range,
        );
        for (i, region) in self.regions.iter().enumerate() {
            if region.covered.overlaps(&range) {
                self.flush_list.push(i);
            }
        }
    }

    /// Queues every region overlapping any of `ranges` and reboots the
    /// expansion-ratio estimator: large-scale invalidation signals an
    /// instrumentation change that can shift the ratio discontinuously.
    pub fn clear_cache_ranges(&mut self, ranges: &[AddressRange]) {
        for range in ranges {
            self.clear_cache(*range);
        }
        self.total_translated_size = 1;
        self.total_translation_size = 1;
    }

    /// Destroys all regions immediately, highest index first.
    pub fn clear_all(&mut self) {
        tracing::event!(
            target: TraceItem::Invalidate.as_str(),
            tracing::Level::TRACE,
            "Erasing all cache",
        );
        while !self.regions.is_empty() {
            self.erase_region(self.regions.len() - 1);
        }
        self.search_cache = SearchCache::default();
    }

    /// Erases the queued regions, freeing their slabs and analyses.
    ///
    /// Erasure proceeds in descending index order so that the indices of
    /// earlier regions stay valid while later ones are removed.
    pub fn flush_commit(&mut self) {
        if self.flush_list.is_empty() {
            return;
        }
        tracing::event!(
            target: TraceItem::Invalidate.as_str(),
            tracing::Level::TRACE,
            "Flushing analysis caches",
        );
        let mut flush_list = std::mem::take(&mut self.flush_list);
        flush_list.sort_unstable_by(|a, b| b.cmp(a));
        flush_list.dedup();
        for r in flush_list {
            self.erase_region(r);
        }
        self.analysis_cache.clear();
        self.search_cache = SearchCache::default();
    }

    fn erase_region(&mut self, r: usize) {
        tracing::event!(
            target: TraceItem::Invalidate.as_str(),
            tracing::Level::TRACE,
            "Erasing region {} {}",
            r,
            self.regions[r].covered,
        );
        // Dropping the region releases its slabs and cached analyses.
        self.regions.remove(r);
    }

    /// Writes a human-readable region occupancy summary to `output`.
    pub fn print_cache_statistics(&self, output: &mut dyn std::io::Write) -> std::io::Result<()> {
        let mut mean_occupation = 0.0_f32;
        let mut region_overflow = 0_usize;
        writeln!(output, "\tCache made of {} regions:", self.regions.len())?;
        for region in &self.regions {
            let occupation = region.mean_occupation();
            if region.blocks.len() > 1 {
                region_overflow += 1;
            }
            mean_occupation += occupation;
            writeln!(
                output,
                "\t\t[{}, {}]: {} blocks, {} occupation ratio",
                region.covered.start,
                region.covered.end,
                region.blocks.len(),
                occupation,
            )?;
        }
        if !self.regions.is_empty() {
            mean_occupation /= self.regions.len() as f32;
        }
        writeln!(output, "\tMean occupation ratio: {mean_occupation}")?;
        writeln!(output, "\tRegion overflow count: {region_overflow}")
    }
}

impl Drop for ExecBlockManager {
    fn drop(&mut self) {
        if tracing::event_enabled!(target: TraceItem::Region.as_str(), tracing::Level::DEBUG) {
            let mut stats = Vec::new();
            if self.print_cache_statistics(&mut stats).is_ok() {
                tracing::event!(
                    target: TraceItem::Region.as_str(),
                    tracing::Level::DEBUG,
                    "{}",
                    String::from_utf8_lossy(&stats),
                );
            }
        }
    }
}
