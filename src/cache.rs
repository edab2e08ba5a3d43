//! Cache line state machine and the per-tile L1/L2 controller.
//!
//! The controller is addressed by line-aligned address but organized
//! internally into sets, the way a real set-associative cache is. Locking
//! happens at set granularity: a thread that wins the lock on a set holds it
//! for the whole duration of any transaction touching a line mapped to that
//! set, whether that transaction was triggered by the local core (a miss)
//! or by an inbound protocol message from home (an invalidate or flush
//! request). That's coarser than the minimum required "one active
//! transaction per line", but it's a safe coarsening: two lines in the same
//! set never need independent progress in this model, and it keeps the
//! implementation a single lock per set instead of a second layer of
//! per-line bookkeeping under it.

use std::fmt;

use tracing::debug;

use crate::addr::AddressMap;
use crate::message::{Component, Message, MsgType, TileId, INVALID_TILE_ID};
use crate::network::NetworkEndpoint;

/// Cache line coherence state, from the requesting cache controller's point
/// of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CState {
    Invalid,
    Shared,
    Exclusive,
    Modified,
    Owned,
}

impl fmt::Display for CState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl CState {
    fn readable(self) -> bool {
        !matches!(self, CState::Invalid)
    }

    fn writable(self) -> bool {
        matches!(self, CState::Exclusive | CState::Modified)
    }

    fn dirty(self) -> bool {
        matches!(self, CState::Modified | CState::Owned)
    }
}

/// A single resident cache line.
#[derive(Debug, Clone)]
struct CacheLine {
    tag: u64,
    state: CState,
    data: Vec<u8>,
}

/// One set of `associativity` ways. Owns its own lock: acquiring a set's
/// mutex is what the rest of this module calls "locking the line".
struct CacheSet {
    ways: Vec<Option<CacheLine>>,
    /// Least-recently-used ordering, front = least recently touched.
    recency: std::collections::VecDeque<usize>,
}

impl CacheSet {
    fn new(associativity: usize) -> Self {
        CacheSet {
            ways: vec![None; associativity],
            recency: std::collections::VecDeque::new(),
        }
    }

    fn find(&self, tag: u64, search_depth: usize) -> Option<usize> {
        self.ways
            .iter()
            .take(search_depth.min(self.ways.len()))
            .position(|w| matches!(w, Some(line) if line.tag == tag))
    }

    fn touch(&mut self, way: usize) {
        self.recency.retain(|&w| w != way);
        self.recency.push_back(way);
    }

    /// Find a free way, or evict the least-recently-used one. Returns the
    /// way index and, if an eviction happened, the evicted line.
    fn allocate(&mut self) -> (usize, Option<CacheLine>) {
        if let Some(way) = self.ways.iter().position(|w| w.is_none()) {
            return (way, None);
        }
        let victim_way = self.recency.pop_front().unwrap_or(0);
        let evicted = self.ways[victim_way].take();
        (victim_way, evicted)
    }
}

/// Outcome of a single-line access against the controller.
pub struct AccessOutcome {
    /// Whether the access was satisfiable from local state without sending
    /// any protocol message.
    pub hit: bool,
}

/// Per-tile L1/L2 cache controller, participating in the MOSI protocol as a
/// requester and as an inbound message handler.
pub struct CacheController {
    tile_id: TileId,
    line_size: usize,
    num_sets: usize,
    associativity: usize,
    search_depth: usize,
    sets: Vec<parking_lot::Mutex<CacheSet>>,
    addr_map: std::sync::Arc<AddressMap>,
    net: std::sync::Arc<NetworkEndpoint>,
}

impl CacheController {
    pub fn new(
        tile_id: TileId,
        line_size: usize,
        cache_size: usize,
        associativity: usize,
        search_depth: usize,
        addr_map: std::sync::Arc<AddressMap>,
        net: std::sync::Arc<NetworkEndpoint>,
    ) -> Self {
        let capacity_lines = cache_size / line_size;
        let num_sets = (capacity_lines / associativity).max(1);
        let sets = (0..num_sets)
            .map(|_| parking_lot::Mutex::new(CacheSet::new(associativity)))
            .collect();
        CacheController {
            tile_id,
            line_size,
            num_sets,
            associativity,
            search_depth,
            sets,
            addr_map,
            net,
        }
    }

    fn set_index(&self, line_base: u64) -> usize {
        ((line_base / self.line_size as u64) as usize) % self.num_sets
    }

    /// Read `len` bytes at `line_base + offset` into `out`. Sends protocol
    /// messages to home and blocks on the reply if the line isn't already
    /// held in a readable state.
    pub fn read(&self, line_base: u64, offset: usize, out: &mut [u8]) -> AccessOutcome {
        let idx = self.set_index(line_base);
        let mut set = self.sets[idx].lock();
        if let Some(way) = set.find(line_base, self.search_depth) {
            let line = set.ways[way].as_ref().unwrap();
            if line.state.readable() {
                out.copy_from_slice(&line.data[offset..offset + out.len()]);
                set.touch(way);
                return AccessOutcome { hit: true };
            }
        }
        self.fetch_shared(&mut set, line_base);
        let way = set.find(line_base, self.associativity).expect("just fetched");
        let line = set.ways[way].as_ref().unwrap();
        out.copy_from_slice(&line.data[offset..offset + out.len()]);
        set.touch(way);
        AccessOutcome { hit: false }
    }

    /// Write `bytes` at `line_base + offset`. Sends protocol messages to
    /// home and blocks on the reply if the line isn't already held
    /// Exclusive/Modified.
    pub fn write(&self, line_base: u64, offset: usize, bytes: &[u8]) -> AccessOutcome {
        let idx = self.set_index(line_base);
        let mut set = self.sets[idx].lock();
        if let Some(way) = set.find(line_base, self.search_depth) {
            let line = set.ways[way].as_mut().unwrap();
            if line.state.writable() {
                line.data[offset..offset + bytes.len()].copy_from_slice(bytes);
                line.state = CState::Modified;
                set.touch(way);
                return AccessOutcome { hit: true };
            }
            if line.state == CState::Shared || line.state == CState::Owned {
                self.upgrade_to_exclusive(&mut set, way, line_base);
                let line = set.ways[way].as_mut().unwrap();
                line.data[offset..offset + bytes.len()].copy_from_slice(bytes);
                line.state = CState::Modified;
                set.touch(way);
                return AccessOutcome { hit: false };
            }
        }
        self.fetch_exclusive(&mut set, line_base);
        let way = set.find(line_base, self.associativity).expect("just fetched");
        let line = set.ways[way].as_mut().unwrap();
        line.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        line.state = CState::Modified;
        set.touch(way);
        AccessOutcome { hit: false }
    }

    fn home_of(&self, line_base: u64) -> TileId {
        self.addr_map
            .home_of(line_base)
            .expect("address map must cover every line this controller is ever asked about")
    }

    fn ensure_room(&self, set: &mut CacheSet, line_base: u64) -> usize {
        if let Some(way) = set.find(line_base, self.associativity) {
            return way;
        }
        let (way, evicted) = set.allocate();
        if let Some(victim) = evicted {
            self.writeback_if_dirty(&victim);
        }
        way
    }

    fn writeback_if_dirty(&self, victim: &CacheLine) {
        if victim.state.dirty() {
            let home = self.home_of(victim.tag);
            debug!(tile = self.tile_id, address = victim.tag, "evicting dirty line, writing back");
            // Unsolicited write-back on eviction: WB_REP, not WB_REQ. Per
            // §3/§4.2, WB_REQ is home *asking* a controller to write back
            // (the Owned-to-Shared pull this protocol's chosen policy never
            // actually issues, see DESIGN.md); WB_REP is the controller
            // volunteering dirty data to home without being asked, which is
            // exactly what an eviction does.
            self.net.send(
                home,
                Message {
                    msg_type: MsgType::WbRep,
                    sender_component: Component::CacheController,
                    receiver_component: Component::Directory,
                    from: self.tile_id,
                    to: home,
                    requester: self.tile_id,
                    single_receiver: INVALID_TILE_ID,
                    reply_expected: false,
                    address: victim.tag,
                    data: Some(victim.data.clone()),
                    modeled: true,
                    cache_line_utilization: 8,
                },
            );
        }
    }

    /// Fetch a line in Shared (or Exclusive, per the protocol's
    /// opportunistic-exclusive optimization) state and install it.
    fn fetch_shared(&self, set: &mut CacheSet, line_base: u64) {
        let way = self.ensure_room(set, line_base);
        let home = self.home_of(line_base);
        debug!(tile = self.tile_id, address = line_base, "SH_REQ -> home {home}");
        self.net.send(
            home,
            Message {
                msg_type: MsgType::ShReq,
                sender_component: Component::CacheController,
                receiver_component: Component::Directory,
                from: self.tile_id,
                to: home,
                requester: self.tile_id,
                single_receiver: INVALID_TILE_ID,
                reply_expected: true,
                address: line_base,
                data: None,
                modeled: true,
                cache_line_utilization: 8,
            },
        );
        // The data reply for a SH_REQ does not always come from home: when
        // home resolves the request by fusing a flush into an
        // InvFlushCombinedReq to the current Exclusive/Modified owner, the
        // owner's cache controller replies with the data directly (see
        // `handle_inbound`'s InvFlushCombinedReq arm), so `from` is the
        // owner's tile id, not home's. The set lock held across this call
        // guarantees at most one outstanding request per line, so matching
        // on address + type alone (without constraining the sender) is
        // still unambiguous.
        let reply = self.net.recv(|m| {
            m.address == line_base && matches!(m.msg_type, MsgType::ShRep | MsgType::ExRep)
        });
        let state = match reply.msg_type {
            MsgType::ExRep => CState::Exclusive,
            _ => CState::Shared,
        };
        let data = reply.data.unwrap_or_else(|| vec![0u8; self.line_size]);
        set.ways[way] = Some(CacheLine {
            tag: line_base,
            state,
            data,
        });
        set.touch(way);
    }

    /// Fetch a line in Modified state and install it.
    fn fetch_exclusive(&self, set: &mut CacheSet, line_base: u64) {
        let way = self.ensure_room(set, line_base);
        let home = self.home_of(line_base);
        debug!(tile = self.tile_id, address = line_base, "EX_REQ -> home {home}");
        self.net.send(
            home,
            Message {
                msg_type: MsgType::ExReq,
                sender_component: Component::CacheController,
                receiver_component: Component::Directory,
                from: self.tile_id,
                to: home,
                requester: self.tile_id,
                single_receiver: INVALID_TILE_ID,
                reply_expected: true,
                address: line_base,
                data: None,
                modeled: true,
                cache_line_utilization: 8,
            },
        );
        let reply = self
            .net
            .recv(|m| m.from == home && m.address == line_base && m.msg_type == MsgType::ExRep);
        let data = reply.data.unwrap_or_else(|| vec![0u8; self.line_size]);
        set.ways[way] = Some(CacheLine {
            tag: line_base,
            state: CState::Modified,
            data,
        });
        set.touch(way);
    }

    /// Upgrade a line already present as Shared/Owned to Exclusive/Modified
    /// without re-fetching data we already have.
    fn upgrade_to_exclusive(&self, set: &mut CacheSet, way: usize, line_base: u64) {
        let home = self.home_of(line_base);
        debug!(tile = self.tile_id, address = line_base, "EX_REQ (upgrade) -> home {home}");
        self.net.send(
            home,
            Message {
                msg_type: MsgType::ExReq,
                sender_component: Component::CacheController,
                receiver_component: Component::Directory,
                from: self.tile_id,
                to: home,
                requester: self.tile_id,
                single_receiver: INVALID_TILE_ID,
                reply_expected: true,
                address: line_base,
                data: None,
                modeled: true,
                cache_line_utilization: 8,
            },
        );
        // EX_REQ replies (UpgradeRep/ExRep) are always formed by home itself
        // even when an invalidation round-trip to another owner precedes
        // them, but match on address + type only, for the same reason as
        // `fetch_shared`'s reply match above: the set lock serializes this
        // line to one outstanding request at a time, so constraining the
        // sender adds no safety and only risks tying this match to an
        // assumption about which component replies.
        let reply = self.net.recv(|m| {
            m.address == line_base && matches!(m.msg_type, MsgType::UpgradeRep | MsgType::ExRep)
        });
        if let Some(line) = set.ways[way].as_mut() {
            if let Some(fresh_data) = reply.data {
                line.data = fresh_data;
            }
        }
    }

    /// Service one inbound message addressed to this controller: an
    /// invalidate, a flush, a write-back request, or the fused
    /// invalidate-and-flush-to-single-receiver message. Called from the
    /// tile's cache-inbound service loop, never from the local core thread.
    pub fn handle_inbound(&self, msg: Message) {
        let line_base = msg.address;
        let idx = self.set_index(line_base);
        let mut set = self.sets[idx].lock();
        let way = match set.find(line_base, self.associativity) {
            Some(w) => w,
            None => {
                // Already evicted locally; home's view is stale. Ack with
                // no data so the transaction at home can still complete.
                self.ack_inbound(&msg, MsgType::InvRep, None);
                return;
            }
        };

        match msg.msg_type {
            MsgType::InvReq => {
                let line = set.ways[way].take().unwrap();
                let data = line.state.dirty().then_some(line.data);
                set.recency.retain(|&w| w != way);
                self.ack_inbound(&msg, MsgType::InvRep, data);
            }
            MsgType::FlushReq => {
                let line = set.ways[way].as_mut().unwrap();
                let data = line.data.clone();
                line.state = CState::Shared;
                self.ack_inbound(&msg, MsgType::FlushRep, Some(data));
            }
            MsgType::InvFlushCombinedReq => {
                let line = set.ways[way].as_mut().unwrap();
                let data = line.data.clone();
                // Policy: the owner downgrades to Shared rather than
                // invalidating, per the directory's chosen resolution for
                // this transition (see DESIGN.md).
                line.state = CState::Shared;
                debug!(
                    tile = self.tile_id,
                    address = line_base,
                    "combined invalidate+flush: downgrading to Shared, handing data to {}",
                    msg.single_receiver
                );
                // Data goes straight to the single receiver as the reply
                // type it's actually waiting for.
                self.net.send(
                    msg.single_receiver,
                    Message {
                        msg_type: MsgType::ShRep,
                        sender_component: Component::CacheController,
                        receiver_component: Component::CacheController,
                        from: self.tile_id,
                        to: msg.single_receiver,
                        requester: msg.single_receiver,
                        single_receiver: INVALID_TILE_ID,
                        reply_expected: false,
                        address: line_base,
                        data: Some(data.clone()),
                        modeled: true,
                        cache_line_utilization: 8,
                    },
                );
                self.ack_inbound(&msg, MsgType::InvRep, Some(data));
            }
            other => {
                debug!(tile = self.tile_id, ?other, "ignoring unexpected inbound message type");
            }
        }
    }

    fn ack_inbound(&self, msg: &Message, reply_type: MsgType, data: Option<Vec<u8>>) {
        self.net.send(
            msg.from,
            Message {
                msg_type: reply_type,
                sender_component: Component::CacheController,
                receiver_component: Component::Directory,
                from: self.tile_id,
                to: msg.from,
                requester: msg.requester,
                single_receiver: INVALID_TILE_ID,
                reply_expected: false,
                address: msg.address,
                data,
                modeled: true,
                cache_line_utilization: 8,
            },
        );
    }

    /// Snapshot of this line's state, for debug hooks and diagnostics. Only
    /// safe to call at a simulation quiescent point (no in-flight
    /// transactions for `address`).
    pub fn peek_state(&self, address: u64) -> CState {
        let line_base = self.addr_map.line_base(address);
        let idx = self.set_index(line_base);
        let set = self.sets[idx].lock();
        match set.find(line_base, self.associativity) {
            Some(way) => set.ways[way].as_ref().unwrap().state,
            None => CState::Invalid,
        }
    }

    /// Force a line into a given state with given data, bypassing the
    /// protocol entirely. Test/debug use only.
    pub fn debug_set_state(&self, address: u64, state: CState, data: Vec<u8>) {
        let line_base = self.addr_map.line_base(address);
        let idx = self.set_index(line_base);
        let mut set = self.sets[idx].lock();
        let way = self.ensure_room(&mut set, line_base);
        if state == CState::Invalid {
            set.ways[way] = None;
            set.recency.retain(|&w| w != way);
        } else {
            set.ways[way] = Some(CacheLine {
                tag: line_base,
                state,
                data,
            });
            set.touch(way);
        }
    }

    /// Force an eviction of `address` regardless of recency, writing back
    /// if dirty. Test/debug use only (spec scenario: forced eviction).
    pub fn debug_evict(&self, address: u64) {
        let line_base = self.addr_map.line_base(address);
        let idx = self.set_index(line_base);
        let mut set = self.sets[idx].lock();
        if let Some(way) = set.find(line_base, self.associativity) {
            let victim = set.ways[way].take().unwrap();
            set.recency.retain(|&w| w != way);
            self.writeback_if_dirty(&victim);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::network::Interconnect;

    fn controller(tile_id: TileId, ic: &Interconnect) -> CacheController {
        let cfg = SimConfig::default_two_tile();
        let map = std::sync::Arc::new(AddressMap::new(&cfg));
        CacheController::new(
            tile_id,
            cfg.line_size,
            cfg.dcache_size,
            cfg.dcache_associativity,
            cfg.dcache_max_search_depth,
            map,
            std::sync::Arc::new(ic.endpoint(tile_id)),
        )
    }

    #[test]
    fn debug_set_and_peek_round_trip() {
        let ic = Interconnect::new(2);
        let c = controller(0, &ic);
        c.debug_set_state(0, CState::Modified, vec![7u8; 64]);
        assert_eq!(c.peek_state(0), CState::Modified);
        c.debug_set_state(0, CState::Invalid, vec![]);
        assert_eq!(c.peek_state(0), CState::Invalid);
    }

    #[test]
    fn fresh_line_reads_as_invalid() {
        let ic = Interconnect::new(2);
        let c = controller(0, &ic);
        assert_eq!(c.peek_state(0x40), CState::Invalid);
    }
}
