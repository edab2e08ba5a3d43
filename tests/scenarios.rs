//! Two-tile protocol scenarios exercising the coherence transitions end to
//! end across real OS threads, not just unit-level calls into one module.

use std::collections::HashSet;
use std::time::Duration;

use tilesim::debug::{assert_cache_state, assert_dram_state, set_cache_state, set_dram_state};
use tilesim::prelude::*;

fn settle() {
    std::thread::sleep(Duration::from_millis(50));
}

fn two_tile_chip() -> Chip {
    Chip::new(SimConfig::default_two_tile()).unwrap()
}

#[test]
fn cold_load_installs_exclusive_and_home_tracks_it() {
    let chip = two_tile_chip();
    let (data, _) = chip.tile(0).load(0x10, 8);
    assert_eq!(data, vec![0u8; 8]);
    assert_cache_state(&chip, 0, 0x10, CState::Exclusive);
    assert_dram_state(&chip, 0, 0x10, DState::Exclusive);
}

#[test]
fn shared_promotion_on_second_reader() {
    let chip = two_tile_chip();
    chip.tile(0).load(0x10, 8);
    chip.tile(1).load(0x10, 8);
    settle();
    assert_cache_state(&chip, 0, 0x10, CState::Shared);
    assert_cache_state(&chip, 1, 0x10, CState::Shared);
    assert_dram_state(&chip, 0, 0x10, DState::Shared);
}

#[test]
fn store_invalidates_other_sharers() {
    let chip = two_tile_chip();
    chip.tile(0).load(0x10, 8);
    chip.tile(1).load(0x10, 8);
    chip.tile(1).store(0x10, &[9; 8]);
    settle();
    assert_cache_state(&chip, 1, 0x10, CState::Modified);
    assert_cache_state(&chip, 0, 0x10, CState::Invalid);
}

#[test]
fn reader_triggers_owner_flush_and_shares() {
    let chip = two_tile_chip();
    // Tile 0 takes the line exclusive and dirties it.
    chip.tile(0).load(0x10, 8);
    chip.tile(0).store(0x10, &[1, 2, 3, 4, 5, 6, 7, 8]);
    assert_cache_state(&chip, 0, 0x10, CState::Modified);

    // Tile 1 reads the same line; tile 0 must flush its dirty data to tile
    // 1 directly and downgrade to Shared, with home ending up tracking both
    // as sharers and holding the now-current data.
    let (read_back, _) = chip.tile(1).load(0x10, 8);
    settle();
    assert_eq!(read_back, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    assert_cache_state(&chip, 0, 0x10, CState::Shared);
    assert_cache_state(&chip, 1, 0x10, CState::Shared);
    assert_dram_state(&chip, 0, 0x10, DState::Shared);
}

#[test]
fn reader_on_home_tile_triggers_remote_owner_flush() {
    let chip = two_tile_chip();
    // Address 0 is homed at tile 0. Tile 1 takes it exclusive and dirties
    // it, making tile 1 both the requester-turned-owner and a tile distinct
    // from home. Tile 0's subsequent load is itself the home tile reading a
    // line it doesn't cache: home must fuse the flush into an
    // InvFlushCombinedReq routed to tile 1, whose data reply comes from
    // tile 1 (not from home), which the requester's reply match must still
    // catch.
    chip.tile(1).load(0, 8);
    chip.tile(1).store(0, &[1, 2, 3, 4, 5, 6, 7, 8]);
    assert_cache_state(&chip, 1, 0, CState::Modified);

    let (read_back, _) = chip.tile(0).load(0, 8);
    settle();
    assert_eq!(read_back, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    assert_cache_state(&chip, 1, 0, CState::Shared);
    assert_cache_state(&chip, 0, 0, CState::Shared);
    assert_dram_state(&chip, 0, 0, DState::Shared);
}

#[test]
fn unaligned_access_splits_across_two_lines() {
    let chip = two_tile_chip();
    let cfg = chip.config();
    let line = cfg.line_size as u64;
    // Straddle the boundary between the first and second lines.
    let addr = line - 4;
    let payload = [1u8, 2, 3, 4, 5, 6, 7, 8];
    chip.tile(0).store(addr, &payload);
    let (read_back, _) = chip.tile(0).load(addr, 8);
    assert_eq!(read_back, payload);
    // Both lines should now be resident at tile 0.
    assert_cache_state(&chip, 0, 0, CState::Modified);
    assert_cache_state(&chip, 0, line, CState::Modified);
}

#[test]
fn forced_eviction_of_modified_line_writes_back_to_home() {
    let chip = two_tile_chip();
    // Seed tile 0's cache directly with a dirty line and matching home
    // bookkeeping, then force the eviction the way a capacity conflict
    // would trigger it, and check the write-back lands at home.
    let data = vec![0xAAu8; chip.config().line_size];
    set_cache_state(&chip, 0, 0x20, CState::Modified, data.clone());
    set_dram_state(
        &chip,
        0,
        0x20,
        DState::Modified,
        HashSet::from([0]),
        vec![0u8; chip.config().line_size],
    );
    chip.tile(0).cache.debug_evict(0x20);
    settle();
    assert_dram_state(&chip, 0, 0x20, DState::Uncached);
}
