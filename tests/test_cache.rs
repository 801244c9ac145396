// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the inquiline project.

mod utils;

use inquiline::{
    cache::{BBInfo, ExecBlockManager},
    exec_block::SeqType,
    memory::{Address, AddressRange},
};
use utils::nop_block;

#[test]
fn write_single_block() {
    let mut manager = ExecBlockManager::new();
    manager.write_basic_block(&nop_block(0x1000, 3)).unwrap();

    assert_eq!(manager.regions().len(), 1);
    let region = &manager.regions()[0];
    assert_eq!(region.covered(), AddressRange::from(0x1000..0x100c));
    assert_eq!(region.block_count(), 1);
    assert_eq!(region.sequence_count(), 1);
    assert_eq!(region.instruction_count(), 3);
    assert_eq!(region.basic_block_count(), 1);

    let loc = manager.get_seq_loc(Address(0x1000)).unwrap();
    assert_eq!(loc.seq_id, 0);
    assert_eq!(loc.bb_idx, 0);
    assert_eq!(
        manager.get_bb_info(Address(0x1000)),
        Some(BBInfo {
            start: Address(0x1000),
            end: Address(0x100c),
        })
    );
}

#[test]
fn reinsertion_is_a_noop() {
    let mut manager = ExecBlockManager::new();
    manager.write_basic_block(&nop_block(0x1000, 3)).unwrap();
    let ratio = manager.expansion_ratio();

    manager.write_basic_block(&nop_block(0x1000, 3)).unwrap();
    assert_eq!(manager.regions().len(), 1);
    assert_eq!(manager.regions()[0].basic_block_count(), 1);
    assert_eq!(manager.regions()[0].sequence_count(), 1);
    assert_eq!(manager.expansion_ratio(), ratio);
}

#[test]
fn mid_sequence_lookup_splits_once() {
    let mut manager = ExecBlockManager::new();
    manager.write_basic_block(&nop_block(0x1000, 3)).unwrap();

    let loc = manager.get_seq_loc(Address(0x1004)).unwrap();
    assert_eq!(loc.seq_id, 1);
    assert_eq!(loc.bb_idx, 1);
    assert_eq!(manager.regions().len(), 1);
    let region = &manager.regions()[0];
    assert_eq!(region.block_count(), 1);
    assert_eq!(region.sequence_count(), 2);
    assert_eq!(region.basic_block_count(), 2);
    assert_eq!(
        manager.get_bb_info(Address(0x1004)),
        Some(BBInfo {
            start: Address(0x1004),
            end: Address(0x100c),
        })
    );

    // A second lookup hits the sequence cache without another split.
    let again = manager.get_seq_loc(Address(0x1004)).unwrap();
    assert_eq!(again, loc);
    assert_eq!(manager.regions()[0].sequence_count(), 2);
}

#[test]
fn adjacent_block_extends_region() {
    let mut manager = ExecBlockManager::new();
    manager.write_basic_block(&nop_block(0x1000, 3)).unwrap();
    manager.write_basic_block(&nop_block(0x100c, 2)).unwrap();

    assert_eq!(manager.regions().len(), 1);
    assert_eq!(
        manager.regions()[0].covered(),
        AddressRange::from(0x1000..0x1014)
    );
    assert!(manager.get_seq_loc(Address(0x100c)).is_some());
}

#[test]
fn distant_block_opens_new_region() {
    let mut manager = ExecBlockManager::new();
    manager.write_basic_block(&nop_block(0x1000, 3)).unwrap();
    manager.write_basic_block(&nop_block(0x9000, 1)).unwrap();

    assert_eq!(manager.regions().len(), 2);
    assert_eq!(manager.regions()[0].covered().end, Address(0x100c));
    assert_eq!(
        manager.regions()[1].covered(),
        AddressRange::from(0x9000..0x9004)
    );
}

#[test]
fn low_block_inserts_in_sorted_position() {
    let mut manager = ExecBlockManager::new();
    manager.write_basic_block(&nop_block(0x9000, 1)).unwrap();
    manager.write_basic_block(&nop_block(0x1000, 1)).unwrap();

    assert_eq!(manager.regions().len(), 2);
    assert_eq!(manager.regions()[0].covered().start, Address(0x1000));
    assert_eq!(manager.regions()[1].covered().start, Address(0x9000));
}

#[test]
fn contained_block_reuses_region() {
    let mut manager = ExecBlockManager::new();
    manager.write_basic_block(&nop_block(0x3000, 4)).unwrap();
    let covered = manager.regions()[0].covered();

    // A block strictly inside the covered window stays in the region even
    // though only its head is a new sequence entry.
    manager.write_basic_block(&nop_block(0x3004, 2)).unwrap();
    assert_eq!(manager.regions().len(), 1);
    assert_eq!(manager.regions()[0].covered(), covered);
    assert_eq!(manager.regions()[0].sequence_count(), 2);
    assert_eq!(manager.regions()[0].basic_block_count(), 2);
}

#[test]
fn truncation_against_cached_prefix() {
    let mut manager = ExecBlockManager::new();
    manager.write_basic_block(&nop_block(0x1000, 3)).unwrap();

    // 0xff8, 0xffc, 0x1000, 0x1004: the tail from 0x1000 on is cached, so
    // only the two leading patches are written and the sequence carries no
    // exit flag.
    manager.write_basic_block(&nop_block(0xff8, 4)).unwrap();
    assert_eq!(manager.regions().len(), 1);
    assert_eq!(manager.regions()[0].covered().start, Address(0xff8));
    assert_eq!(manager.regions()[0].instruction_count(), 5);

    let loc = manager.get_seq_loc(Address(0xff8)).unwrap();
    let block = manager.get_exec_block(Address(0xff8)).unwrap();
    assert_eq!(block.selected_seq(), Some(loc.seq_id));
    let seq_type = block.seq_type(loc.seq_id);
    assert!(seq_type.contains(SeqType::ENTRY));
    assert!(!seq_type.contains(SeqType::EXIT));

    // The registered footprint spans the whole basic block.
    assert_eq!(
        manager.get_bb_info(Address(0xff8)),
        Some(BBInfo {
            start: Address(0xff8),
            end: Address(0x1008),
        })
    );
}

#[test]
fn every_written_address_resolves() {
    let mut manager = ExecBlockManager::new();
    manager.write_basic_block(&nop_block(0x2000, 5)).unwrap();
    for i in 0..5 {
        assert!(
            manager.get_seq_loc(Address(0x2000 + 4 * i)).is_some(),
            "no sequence for instruction {i}"
        );
    }
}

#[test]
fn lookups_on_empty_manager_miss() {
    let mut manager = ExecBlockManager::new();
    assert!(manager.get_seq_loc(Address(0x1000)).is_none());
    assert!(manager.get_exec_block(Address(0x1000)).is_none());
    assert!(manager.get_bb_info(Address(0x1000)).is_none());
    assert_eq!(manager.expansion_ratio(), 1.0);
}

#[test]
fn oversized_block_overflows_into_second_slab() {
    let mut manager = ExecBlockManager::new();
    // 600 instructions of 8 host bytes each outgrow one 4 KiB slab.
    manager.write_basic_block(&nop_block(0x4000, 600)).unwrap();

    assert_eq!(manager.regions().len(), 1);
    assert_eq!(manager.regions()[0].block_count(), 2);
    for i in 0..600 {
        assert!(manager.get_seq_loc(Address(0x4000 + 4 * i)).is_some());
    }

    let mut out = Vec::new();
    manager.print_cache_statistics(&mut out).unwrap();
    let stats = String::from_utf8(out).unwrap();
    assert!(stats.contains("Cache made of 1 regions"), "{stats}");
    assert!(stats.contains("2 blocks"), "{stats}");
    assert!(stats.contains("Region overflow count: 1"), "{stats}");
}

#[test]
fn regions_stay_sorted_and_consistent() {
    let mut manager = ExecBlockManager::new();
    for start in [0x9000_u64, 0x1000, 0x5000, 0xd000, 0x3000] {
        manager.write_basic_block(&nop_block(start, 4)).unwrap();
    }
    // Some splits on top.
    assert!(manager.get_seq_loc(Address(0x5004)).is_some());
    assert!(manager.get_seq_loc(Address(0x9008)).is_some());

    let regions = manager.regions();
    for pair in regions.windows(2) {
        assert!(pair[0].covered().start < pair[1].covered().start);
    }
    for region in regions {
        for (address, loc) in region.sequences() {
            assert!(region.covered().contains(address));
            let (_, inst) = region
                .instructions()
                .find(|(inst_address, _)| *inst_address == address)
                .expect("sequence head missing from instruction cache");
            assert_eq!(inst.block_idx, loc.block_idx);
        }
    }
}

#[test]
fn invalidation_is_two_phase() {
    let mut manager = ExecBlockManager::new();
    manager.write_basic_block(&nop_block(0x1000, 3)).unwrap();
    manager.write_basic_block(&nop_block(0x9000, 1)).unwrap();

    manager.clear_cache(AddressRange::from(0xfff..0x1001));
    // Queued regions remain queryable until the commit.
    assert!(manager.get_seq_loc(Address(0x1000)).is_some());

    manager.flush_commit();
    assert!(manager.get_seq_loc(Address(0x1000)).is_none());
    assert!(manager.get_seq_loc(Address(0x9000)).is_some());
    assert_eq!(manager.regions().len(), 1);
    assert_eq!(
        manager.regions()[0].covered(),
        AddressRange::from(0x9000..0x9004)
    );
}

#[test]
fn overlapping_flushes_are_deduplicated() {
    let mut manager = ExecBlockManager::new();
    manager.write_basic_block(&nop_block(0x1000, 3)).unwrap();
    manager.write_basic_block(&nop_block(0x9000, 2)).unwrap();

    manager.clear_cache(AddressRange::from(0x0fff..0x9002));
    manager.clear_cache(AddressRange::from(0x9000..0x9001));
    manager.flush_commit();
    assert!(manager.regions().is_empty());

    // The manager keeps working after a full flush.
    manager.write_basic_block(&nop_block(0x2000, 1)).unwrap();
    assert!(manager.get_seq_loc(Address(0x2000)).is_some());
}

#[test]
fn range_set_invalidation_reboots_the_estimator() {
    let mut manager = ExecBlockManager::new();
    manager.write_basic_block(&nop_block(0x1000, 3)).unwrap();
    assert!(manager.expansion_ratio() > 1.0);

    manager.clear_cache_ranges(&[
        AddressRange::from(0x1000..0x1004),
        AddressRange::from(0x8000..0x8004),
    ]);
    assert_eq!(manager.expansion_ratio(), 1.0);
    manager.flush_commit();
    assert!(manager.regions().is_empty());
}

#[test]
fn clear_all_drops_everything() {
    let mut manager = ExecBlockManager::new();
    manager.write_basic_block(&nop_block(0x1000, 3)).unwrap();
    manager.write_basic_block(&nop_block(0x9000, 2)).unwrap();

    manager.clear_all();
    assert!(manager.regions().is_empty());
    for address in [0x1000_u64, 0x1004, 0x1008, 0x9000, 0x9004] {
        assert!(manager.get_seq_loc(Address(address)).is_none());
    }

    manager.write_basic_block(&nop_block(0x1000, 1)).unwrap();
    assert!(manager.get_seq_loc(Address(0x1000)).is_some());
}

#[test]
fn expansion_ratio_tracks_written_code() {
    let mut manager = ExecBlockManager::new();
    assert_eq!(manager.expansion_ratio(), 1.0);

    // Three instructions: 12 guest bytes, 24 host bytes, both counters
    // seeded at one.
    manager.write_basic_block(&nop_block(0x1000, 3)).unwrap();
    let expected = 25.0_f32 / 13.0_f32;
    assert!((manager.expansion_ratio() - expected).abs() < f32::EPSILON);
}
