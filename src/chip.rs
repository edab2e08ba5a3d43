//! The chip: owns every tile, the address-home table, and the interconnect's
//! shared routing state. This is the "tile context" that replaces the
//! original simulator's global singletons — nothing in this crate reaches
//! for a process-wide static; every component either owns its state or
//! receives a handle to it at construction.

use std::sync::Arc;

use tracing::info;

use crate::addr::AddressMap;
use crate::config::SimConfig;
use crate::error::{ProtocolDiagnostic, Result, SimError};
use crate::message::TileId;
use crate::network::Interconnect;
use crate::tile::Tile;

/// A small multicore chip: `config.total_cores` tiles wired together over a
/// shared interconnect, each owning a slice of the address space as home.
pub struct Chip {
    config: SimConfig,
    addr_map: Arc<AddressMap>,
    tiles: Vec<Arc<Tile>>,
}

impl Chip {
    /// Build and start a chip from a validated configuration. Every tile's
    /// service threads are running by the time this returns.
    pub fn new(config: SimConfig) -> Result<Self> {
        config.validate()?;
        let addr_map = Arc::new(AddressMap::new(&config));
        let interconnect = Interconnect::new(config.total_cores);
        let tiles: Vec<Arc<Tile>> = (0..config.total_cores)
            .map(|id| Tile::new(id as TileId, &config, addr_map.clone(), &interconnect))
            .collect();
        for tile in &tiles {
            tile.start_services();
        }
        info!(tiles = tiles.len(), "chip built and service threads started");
        Ok(Chip {
            config,
            addr_map,
            tiles,
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn tile(&self, id: TileId) -> &Arc<Tile> {
        &self.tiles[id as usize]
    }

    pub fn tiles(&self) -> &[Arc<Tile>] {
        &self.tiles
    }

    /// Home tile for a given physical address.
    pub fn home_of(&self, addr: u64) -> Result<TileId> {
        self.addr_map.home_of(addr)
    }

    /// Build a diagnostic snapshot of every tile's cached state for
    /// `address`, plus the home directory's entry, for a protocol-violation
    /// error.
    pub fn diagnose(&self, address: u64) -> ProtocolDiagnostic {
        let line = self.addr_map.line_base(address);
        let cache_snapshot = self
            .tiles
            .iter()
            .map(|t| format!("tile {}: {:?}", t.id, t.cache.peek_state(line)))
            .collect();
        let directory_snapshot = self
            .home_of(line)
            .ok()
            .map(|home| format!("home tile {home}: {:?}", self.tile(home).directory.peek_state(line)));
        ProtocolDiagnostic {
            address: line,
            cache_snapshot,
            directory_snapshot,
        }
    }

    /// Assert that no tile holds `address` in a writable state while
    /// another tile holds it in any non-Invalid state, and that at most one
    /// tile holds it Modified/Exclusive. Intended for use at simulation
    /// quiescent points (see `debug` module); panics with a diagnostic dump
    /// on violation, matching this crate's "terminate with diagnostic"
    /// error handling policy.
    pub fn check_single_writer_invariant(&self, address: u64) -> Result<()> {
        use crate::cache::CState;
        let line = self.addr_map.line_base(address);
        let writers: Vec<TileId> = self
            .tiles
            .iter()
            .filter(|t| matches!(t.cache.peek_state(line), CState::Modified | CState::Exclusive))
            .map(|t| t.id)
            .collect();
        if writers.len() > 1 {
            return Err(SimError::protocol_violation(
                "more than one tile holds a writable copy of the same line",
                self.diagnose(line),
            ));
        }
        if !writers.is_empty() {
            let others_non_invalid = self
                .tiles
                .iter()
                .filter(|t| t.id != writers[0])
                .any(|t| t.cache.peek_state(line) != CState::Invalid);
            if others_non_invalid {
                return Err(SimError::protocol_violation(
                    "a writer coexists with another non-Invalid copy of the same line",
                    self.diagnose(line),
                ));
            }
        }
        Ok(())
    }

    /// Stop every tile's service threads. Only safe once the guest workload
    /// has quiesced; in-flight transactions are abandoned, not drained.
    pub fn shutdown(&self) {
        for tile in &self.tiles {
            tile.shutdown();
        }
    }
}

impl Drop for Chip {
    fn drop(&mut self) {
        self.shutdown();
    }
}
