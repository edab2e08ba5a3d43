//! Simulator configuration: the knobs enumerated by the external interface,
//! loaded from TOML and validated before a chip is ever built.

use serde::Deserialize;

use crate::error::{SimError, Result};

/// One entry of the address-home boundary table: tile `tile` is home for
/// the half-open range `[base, limit)`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Boundary {
    pub base: u64,
    pub limit: u64,
}

/// Full simulator configuration, mirroring the knob set the original
/// instrumentation tool exposed as command-line options.
#[derive(Debug, Clone, Deserialize)]
pub struct SimConfig {
    /// Cache line size in bytes. Must be a power of two.
    pub line_size: usize,
    /// Data cache size in bytes.
    pub dcache_size: usize,
    /// Instruction cache size in bytes (modeling only; this crate does not
    /// distinguish fetch traffic from data traffic at the protocol level).
    pub icache_size: usize,
    /// Data cache associativity (ways per set).
    pub dcache_associativity: usize,
    /// Instruction cache associativity.
    pub icache_associativity: usize,
    /// Bound on how many ways of a set are searched for a tag match before
    /// the controller gives up and treats the access as a miss. Exists for
    /// parity with the original per-cache search-depth knob; in practice
    /// should be >= associativity.
    pub dcache_max_search_depth: usize,
    pub icache_max_search_depth: usize,
    /// Statistics-only thresholds; never change protocol behavior.
    pub dcache_threshold_hit: u64,
    pub dcache_threshold_miss: u64,
    pub icache_threshold_hit: u64,
    pub icache_threshold_miss: u64,
    /// Total simulated cores (== number of tiles).
    pub total_cores: usize,
    /// Simulated guest processes sharing the chip; informational only.
    pub num_processes: usize,
    /// Master switch: if false, all memory operations bypass the
    /// coherence protocol entirely (single flat array, no messages).
    pub enable_shared_mem: bool,
    pub enable_dcache_modeling: bool,
    pub enable_icache_modeling: bool,
    /// One entry per tile, in tile-id order, partitioning the address
    /// space with no gaps or overlaps.
    pub boundaries: Vec<Boundary>,
}

impl SimConfig {
    /// A small, internally consistent default: two tiles, a 4 KiB cache
    /// each, splitting a 1 MiB address space evenly. Good enough to build a
    /// chip for a unit test without reaching for a config file.
    pub fn default_two_tile() -> Self {
        SimConfig {
            line_size: 64,
            dcache_size: 4096,
            icache_size: 4096,
            dcache_associativity: 2,
            icache_associativity: 2,
            dcache_max_search_depth: 2,
            icache_max_search_depth: 2,
            dcache_threshold_hit: 1,
            dcache_threshold_miss: 50,
            icache_threshold_hit: 1,
            icache_threshold_miss: 50,
            total_cores: 2,
            num_processes: 1,
            enable_shared_mem: true,
            enable_dcache_modeling: true,
            enable_icache_modeling: true,
            boundaries: vec![
                Boundary {
                    base: 0,
                    limit: 0x0008_0000,
                },
                Boundary {
                    base: 0x0008_0000,
                    limit: 0x0010_0000,
                },
            ],
        }
    }

    /// Parse and validate a configuration from a TOML document.
    ///
    /// The `toml` crate rejects duplicate keys within a table as a parse
    /// error, so a config file that repeats (say) `enable_shared_mem` twice
    /// never silently resolves to last-value-wins; it fails to parse at
    /// all, which is the behavior this crate wants.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SimConfig =
            toml::from_str(text).map_err(|e| SimError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every structural invariant the rest of the crate assumes holds.
    pub fn validate(&self) -> Result<()> {
        if self.line_size == 0 || !self.line_size.is_power_of_two() {
            return Err(SimError::Configuration(format!(
                "line_size must be a power of two, got {}",
                self.line_size
            )));
        }
        if self.dcache_associativity == 0 || self.icache_associativity == 0 {
            return Err(SimError::Configuration(
                "associativity must be at least 1".into(),
            ));
        }
        if self.dcache_size % (self.line_size * self.dcache_associativity) != 0 {
            return Err(SimError::Configuration(
                "dcache_size must be a whole multiple of line_size * associativity".into(),
            ));
        }
        if self.icache_size % (self.line_size * self.icache_associativity) != 0 {
            return Err(SimError::Configuration(
                "icache_size must be a whole multiple of line_size * associativity".into(),
            ));
        }
        if self.total_cores == 0 {
            return Err(SimError::Configuration("total_cores must be >= 1".into()));
        }
        if self.boundaries.len() != self.total_cores {
            return Err(SimError::Configuration(format!(
                "boundaries table has {} entries but total_cores is {}",
                self.boundaries.len(),
                self.total_cores
            )));
        }
        for (i, b) in self.boundaries.iter().enumerate() {
            if b.base >= b.limit {
                return Err(SimError::Configuration(format!(
                    "boundary {i} is empty or inverted: base {} >= limit {}",
                    b.base, b.limit
                )));
            }
            if i > 0 {
                let prev = self.boundaries[i - 1];
                if b.base < prev.limit {
                    return Err(SimError::Configuration(format!(
                        "boundary {i} overlaps the previous entry (base {} < prior limit {})",
                        b.base, prev.limit
                    )));
                }
                if b.base > prev.limit {
                    return Err(SimError::Configuration(format!(
                        "gap in the boundary table between entries {} and {i}",
                        i - 1
                    )));
                }
            }
        }
        Ok(())
    }

    /// Number of bytes needed to encode a tile id on the wire, rounded up
    /// from `total_cores`. Used by [`crate::message::Message::modeled_length`].
    pub fn tile_id_width_bytes(&self) -> usize {
        std::mem::size_of::<crate::message::TileId>()
    }

    /// Number of bytes needed to encode an address on the wire.
    pub fn address_width_bytes(&self) -> usize {
        std::mem::size_of::<u64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        SimConfig::default_two_tile().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_line_size() {
        let mut cfg = SimConfig::default_two_tile();
        cfg.line_size = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_overlapping_boundaries() {
        let mut cfg = SimConfig::default_two_tile();
        cfg.boundaries[1].base = cfg.boundaries[0].base;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_gap_in_boundaries() {
        let mut cfg = SimConfig::default_two_tile();
        cfg.boundaries[1].base += 16;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_keys_in_toml() {
        let text = r#"
            line_size = 64
            line_size = 128
        "#;
        assert!(SimConfig::from_toml_str(text).is_err());
    }
}
