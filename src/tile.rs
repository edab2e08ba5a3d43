//! A single tile: the bundle of core facade, cache controller, directory
//! slice, and network endpoint that the chip replicates `N` times.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::addr::AddressMap;
use crate::cache::CacheController;
use crate::config::SimConfig;
use crate::directory::DirectorySlice;
use crate::message::{Component, Message, MsgType, TileId};
use crate::network::{Interconnect, NetworkEndpoint};

/// How often a service loop wakes up to check the shutdown flag when no
/// message is waiting. Short enough that `Chip::shutdown` feels instant,
/// long enough not to spin.
const SERVICE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A tile: its private cache hierarchy, its slice of the home directory,
/// and the background threads that keep both responsive to inbound
/// protocol traffic while a guest load/store on this tile's core is
/// blocked on a reply of its own.
pub struct Tile {
    pub id: TileId,
    pub cache: Arc<CacheController>,
    pub directory: Arc<DirectorySlice>,
    net: Arc<NetworkEndpoint>,
    addr_map: Arc<AddressMap>,
    shutdown: Arc<AtomicBool>,
    service_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Tile {
    pub fn new(
        id: TileId,
        config: &SimConfig,
        addr_map: Arc<AddressMap>,
        interconnect: &Interconnect,
    ) -> Arc<Self> {
        let net = Arc::new(interconnect.endpoint(id));
        let cache = Arc::new(CacheController::new(
            id,
            config.line_size,
            config.dcache_size,
            config.dcache_associativity,
            config.dcache_max_search_depth,
            addr_map.clone(),
            net.clone(),
        ));
        let directory = Arc::new(DirectorySlice::new(id, config.line_size, net.clone()));
        Arc::new(Tile {
            id,
            cache,
            directory,
            net,
            addr_map,
            shutdown: Arc::new(AtomicBool::new(false)),
            service_threads: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the two background service threads that keep this tile
    /// responsive to inbound protocol traffic. Idempotent is not
    /// guaranteed; call exactly once per tile, after every tile in the chip
    /// has been constructed (so routing to sibling tiles is already live).
    pub fn start_services(self: &Arc<Self>) {
        let mut handles = self.service_threads.lock();
        handles.push(self.spawn_cache_inbound_loop());
        handles.push(self.spawn_directory_inbound_loop());
    }

    /// Signal every service thread to stop and wait for them to exit.
    /// Leaves in-flight transactions wherever they were; only safe to call
    /// once the guest workload driving this tile has quiesced.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut handles = self.service_threads.lock();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }

    fn spawn_cache_inbound_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = self.cache.clone();
        let net = self.net.clone();
        let shutdown = self.shutdown.clone();
        let tile_id = self.id;
        std::thread::Builder::new()
            .name(format!("tile{tile_id}-cache-inbound"))
            .spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    let msg = net.recv_timeout(
                        |m| {
                            m.receiver_component == Component::CacheController
                                && matches!(
                                    m.msg_type,
                                    MsgType::InvReq
                                        | MsgType::FlushReq
                                        | MsgType::InvFlushCombinedReq
                                )
                        },
                        SERVICE_POLL_INTERVAL,
                    );
                    if let Some(msg) = msg {
                        cache.handle_inbound(msg);
                    }
                }
            })
            .expect("failed to spawn cache-inbound service thread")
    }

    fn spawn_directory_inbound_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let directory = self.directory.clone();
        let net = self.net.clone();
        let shutdown = self.shutdown.clone();
        let tile_id = self.id;
        std::thread::Builder::new()
            .name(format!("tile{tile_id}-directory-inbound"))
            .spawn(move || {
                let mut workers: Vec<JoinHandle<()>> = Vec::new();
                while !shutdown.load(Ordering::SeqCst) {
                    let msg = net.recv_timeout(
                        |m| {
                            m.receiver_component == Component::Directory
                                && matches!(
                                    m.msg_type,
                                    MsgType::ShReq | MsgType::ExReq | MsgType::WbRep
                                )
                        },
                        SERVICE_POLL_INTERVAL,
                    );
                    if let Some(msg) = msg {
                        // A request that needs to forward an invalidate and
                        // block on the reply must not hold up the next
                        // unrelated line's request, so each one gets its
                        // own thread. The per-line lock inside the
                        // directory slice still serializes same-line
                        // traffic.
                        let directory = directory.clone();
                        workers.push(std::thread::spawn(move || directory.handle_request(msg)));
                    }
                    workers.retain(|h| !h.is_finished());
                }
                for w in workers {
                    let _ = w.join();
                }
            })
            .expect("failed to spawn directory-inbound service thread")
    }

    /// Read `size` bytes starting at `addr` on behalf of this tile's core.
    /// Splits across cache lines if the access isn't line-aligned; each
    /// segment is resolved independently, with no atomicity guarantee
    /// across segments. `all_hit` is true only if every segment was
    /// satisfied locally without a protocol round trip.
    pub fn load(&self, addr: u64, size: usize) -> (Vec<u8>, bool) {
        let segments = self.addr_map.segment(addr, size);
        let mut out = vec![0u8; size];
        let mut written = 0usize;
        let mut all_hit = true;
        for seg in &segments {
            let outcome = self
                .cache
                .read(seg.line_base, seg.offset, &mut out[written..written + seg.len]);
            if !outcome.hit {
                debug!(tile = self.id, address = seg.line_base, "load miss");
                all_hit = false;
            }
            written += seg.len;
        }
        (out, all_hit)
    }

    /// Write `bytes` starting at `addr` on behalf of this tile's core.
    /// Returns whether every segment was satisfied locally without a
    /// protocol round trip.
    pub fn store(&self, addr: u64, bytes: &[u8]) -> bool {
        let segments = self.addr_map.segment(addr, bytes.len());
        let mut read_off = 0usize;
        let mut all_hit = true;
        for seg in &segments {
            let outcome = self
                .cache
                .write(seg.line_base, seg.offset, &bytes[read_off..read_off + seg.len]);
            if !outcome.hit {
                debug!(tile = self.id, address = seg.line_base, "store miss");
                all_hit = false;
            }
            read_off += seg.len;
        }
        all_hit
    }

    /// Send a raw message from this tile, bypassing the core facade. Used
    /// by tests driving the protocol directly.
    pub fn send_raw(&self, to: TileId, msg: Message) {
        self.net.send(to, msg);
    }
}
