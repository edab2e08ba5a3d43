//! Thin demo binary: build a chip from a config file (or the built-in
//! default), drive it with a small synthetic load/store trace across every
//! tile's core, and print the final per-tile cache/directory state plus
//! aggregate message counts.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tilesim::prelude::*;
use tracing::info;

fn load_config(path: Option<PathBuf>) -> anyhow::Result<SimConfig> {
    match path {
        Some(p) => {
            let text = std::fs::read_to_string(&p)
                .map_err(|e| anyhow::anyhow!("reading {}: {e}", p.display()))?;
            Ok(SimConfig::from_toml_str(&text)?)
        }
        None => Ok(SimConfig::default_two_tile()),
    }
}

/// A small synthetic trace: every core touches a shared counter line and a
/// tile-private line, interleaved, to exercise both the Shared-read and
/// Modified-write paths of the protocol.
fn run_trace(tile: &Arc<Tile>, shared_addr: u64, private_addr: u64, iterations: u64, ops_done: &AtomicU64) {
    for i in 0..iterations {
        let _ = tile.load(shared_addr, 8).0;
        if i % 4 == 0 {
            tile.store(shared_addr, &(i as u64).to_le_bytes());
        }
        tile.store(private_addr, &(i as u64).to_le_bytes());
        let _ = tile.load(private_addr, 8).0;
        ops_done.fetch_add(4, Ordering::Relaxed);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path)?;
    let total_cores = config.total_cores;
    let line_size = config.line_size as u64;
    let chip = Chip::new(config)?;

    info!(tiles = chip.tile_count(), "chip ready, starting trace");

    let shared_addr = 0u64;
    let ops_done = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::new();
    for tile in chip.tiles().iter().cloned() {
        let private_addr = (tile.id as u64) * line_size + line_size * (total_cores as u64 + 1);
        let ops_done = ops_done.clone();
        handles.push(std::thread::spawn(move || {
            run_trace(&tile, shared_addr, private_addr, 200, &ops_done);
        }));
    }
    for h in handles {
        h.join().expect("core thread panicked");
    }

    // Let inbound service threads catch up before inspecting final state.
    std::thread::sleep(std::time::Duration::from_millis(100));

    println!("trace complete: {} memory operations", ops_done.load(Ordering::Relaxed));
    for tile in chip.tiles() {
        println!(
            "tile {}: shared-line state = {:?}",
            tile.id,
            tile.cache.peek_state(shared_addr)
        );
    }
    if let Ok(home) = chip.home_of(shared_addr) {
        println!(
            "home tile {home}: shared-line directory state = {:?}",
            chip.tile(home).directory.peek_state(shared_addr)
        );
    }

    chip.shutdown();
    Ok(())
}
