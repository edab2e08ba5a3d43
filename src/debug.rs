//! Debug/assert hooks for protocol tests.
//!
//! These bypass the coherence protocol entirely to set up or inspect state,
//! mirroring the simulator's original `debugSetDramState`/
//! `debugAssertDramState` pair. Safe only at a simulation quiescent point —
//! no core thread blocked on a reply, no in-flight directory transaction
//! touching the address in question. Calling these mid-transaction produces
//! a snapshot that races with whatever thread is mutating the same state;
//! that's a test-authoring bug, not something this module can detect.

use crate::cache::CState;
use crate::chip::Chip;
use crate::directory::DState;
use crate::message::TileId;

/// Force tile `tile`'s cache to hold `address` in `state` with the given
/// line contents, bypassing the protocol.
pub fn set_cache_state(chip: &Chip, tile: TileId, address: u64, state: CState, data: Vec<u8>) {
    chip.tile(tile).cache.debug_set_state(address, state, data);
}

/// Assert that tile `tile`'s cache holds `address` in exactly `expected`
/// state. Panics with a diagnostic dump on mismatch.
pub fn assert_cache_state(chip: &Chip, tile: TileId, address: u64, expected: CState) {
    let actual = chip.tile(tile).cache.peek_state(address);
    if actual != expected {
        let diagnostic = chip.diagnose(address);
        panic!(
            "cache state mismatch at tile {tile}, address 0x{address:016x}: expected {expected:?}, got {actual:?}\n{diagnostic}"
        );
    }
}

/// Force tile `tile`'s home directory entry for `address` into the given
/// state, sharer set, and data, bypassing the protocol.
pub fn set_dram_state(
    chip: &Chip,
    tile: TileId,
    address: u64,
    dstate: DState,
    sharers: std::collections::HashSet<TileId>,
    data: Vec<u8>,
) {
    chip.tile(tile)
        .directory
        .debug_set_state(address, dstate, sharers, data);
}

/// Assert that tile `tile`'s home directory entry for `address` is in
/// exactly `expected` state. Panics with a diagnostic dump on mismatch.
pub fn assert_dram_state(chip: &Chip, tile: TileId, address: u64, expected: DState) {
    let actual = chip.tile(tile).directory.peek_state(address);
    if actual != expected {
        let diagnostic = chip.diagnose(address);
        panic!(
            "directory state mismatch at home tile {tile}, address 0x{address:016x}: expected {expected:?}, got {actual:?}\n{diagnostic}"
        );
    }
}
