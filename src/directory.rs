//! DRAM directory slice: the home side of the protocol.
//!
//! Directory entries are materialized lazily, one per line address ever
//! requested, the way the simulator this one descends from looked entries
//! up in a map keyed by cache line address instead of pre-allocating one
//! per possible line. Each entry has its own lock; a request for line A
//! never waits behind an in-flight transaction for line B. A request that
//! needs to forward work to another tile (invalidate a current owner,
//! collect sharers) does so by blocking its own handling thread on a
//! matched receive — never the directory's accept loop, which keeps polling
//! for new incoming requests the moment it hands one off.

use std::collections::HashSet;

use tracing::debug;

use crate::linetable::LineTable;
use crate::message::{Component, Message, MsgType, TileId, INVALID_TILE_ID};
use crate::network::NetworkEndpoint;

/// Directory-side coherence state for a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DState {
    /// No tile holds a copy; home's data is authoritative.
    Uncached,
    Shared,
    Exclusive,
    Modified,
    Owned,
}

/// One directory entry: who has the line, in what state, and home's own
/// copy of the data (authoritative whenever `dstate` isn't Exclusive or
/// Modified).
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub dstate: DState,
    pub sharers: HashSet<TileId>,
    pub data: Vec<u8>,
}

impl Default for DirectoryEntry {
    fn default() -> Self {
        DirectoryEntry {
            dstate: DState::Uncached,
            sharers: HashSet::new(),
            data: Vec::new(),
        }
    }
}

/// Per-tile home directory slice.
pub struct DirectorySlice {
    tile_id: TileId,
    line_size: usize,
    entries: LineTable<DirectoryEntry>,
    net: std::sync::Arc<NetworkEndpoint>,
}

impl DirectorySlice {
    pub fn new(tile_id: TileId, line_size: usize, net: std::sync::Arc<NetworkEndpoint>) -> Self {
        DirectorySlice {
            tile_id,
            line_size,
            entries: LineTable::new(),
            net,
        }
    }

    fn blank_line(&self) -> Vec<u8> {
        vec![0u8; self.line_size]
    }

    /// Handle one inbound request addressed to this directory: SH_REQ,
    /// EX_REQ, or an unsolicited WB_REP from an evicting cache controller.
    /// Runs to completion on the calling thread, which may block on replies
    /// from other tiles along the way; the directory's accept loop spawns a
    /// fresh thread per request specifically so that blocking doesn't stall
    /// unrelated lines.
    pub fn handle_request(&self, msg: Message) {
        let entry_arc = self.entries.get_or_create(msg.address);
        let mut entry = entry_arc.lock();
        if entry.dstate == DState::Uncached && entry.data.is_empty() {
            entry.data = self.blank_line();
        }
        match msg.msg_type {
            MsgType::ShReq => self.handle_sh_req(&mut entry, msg),
            MsgType::ExReq => self.handle_ex_req(&mut entry, msg),
            MsgType::WbRep => self.handle_wb_rep(&mut entry, msg),
            other => debug!(tile = self.tile_id, ?other, "directory ignoring unexpected message"),
        }
    }

    fn handle_sh_req(&self, entry: &mut DirectoryEntry, msg: Message) {
        let requester = msg.requester;
        let address = msg.address;
        debug!(tile = self.tile_id, address, requester, dstate = ?entry.dstate, "SH_REQ");
        match entry.dstate {
            DState::Uncached => {
                entry.dstate = DState::Exclusive;
                entry.sharers = HashSet::from([requester]);
                self.reply(requester, address, MsgType::ExRep, Some(entry.data.clone()));
            }
            DState::Shared => {
                entry.sharers.insert(requester);
                self.reply(requester, address, MsgType::ShRep, Some(entry.data.clone()));
            }
            DState::Exclusive | DState::Modified => {
                let owner = *entry
                    .sharers
                    .iter()
                    .next()
                    .expect("Exclusive/Modified entry must have exactly one sharer");
                if owner == requester {
                    self.reply(requester, address, MsgType::ShRep, Some(entry.data.clone()));
                    return;
                }
                // Chosen policy for this transition: fuse the flush and the
                // reply into one message to the owner, which hands its data
                // straight to the requester and acks home; the owner ends
                // up Shared (not Invalid) and becomes a second sharer
                // alongside the requester.
                self.net.send(
                    owner,
                    Message {
                        msg_type: MsgType::InvFlushCombinedReq,
                        sender_component: Component::Directory,
                        receiver_component: Component::CacheController,
                        from: self.tile_id,
                        to: owner,
                        requester,
                        single_receiver: requester,
                        reply_expected: true,
                        address,
                        data: None,
                        modeled: true,
                        cache_line_utilization: 8,
                    },
                );
                let ack = self.net.recv(|m| {
                    m.from == owner && m.address == address && m.msg_type == MsgType::InvRep
                });
                if let Some(fresh) = ack.data {
                    entry.data = fresh;
                }
                entry.dstate = DState::Shared;
                entry.sharers = HashSet::from([owner, requester]);
            }
            DState::Owned => {
                entry.sharers.insert(requester);
                self.reply(requester, address, MsgType::ShRep, Some(entry.data.clone()));
            }
        }
    }

    fn handle_ex_req(&self, entry: &mut DirectoryEntry, msg: Message) {
        let requester = msg.requester;
        let address = msg.address;
        debug!(tile = self.tile_id, address, requester, dstate = ?entry.dstate, "EX_REQ");
        match entry.dstate {
            DState::Uncached => {
                entry.dstate = DState::Modified;
                entry.sharers = HashSet::from([requester]);
                self.reply(requester, address, MsgType::ExRep, Some(entry.data.clone()));
            }
            DState::Shared | DState::Owned => {
                let already_sole_sharer =
                    entry.sharers.len() == 1 && entry.sharers.contains(&requester);
                let others: Vec<TileId> = entry
                    .sharers
                    .iter()
                    .copied()
                    .filter(|t| *t != requester)
                    .collect();
                for other in &others {
                    self.net.send(
                        *other,
                        Message {
                            msg_type: MsgType::InvReq,
                            sender_component: Component::Directory,
                            receiver_component: Component::CacheController,
                            from: self.tile_id,
                            to: *other,
                            requester,
                            single_receiver: INVALID_TILE_ID,
                            reply_expected: true,
                            address,
                            data: None,
                            modeled: true,
                            cache_line_utilization: 8,
                        },
                    );
                }
                for other in &others {
                    let ack = self.net.recv(|m| {
                        m.from == *other && m.address == address && m.msg_type == MsgType::InvRep
                    });
                    if let Some(fresh) = ack.data {
                        entry.data = fresh;
                    }
                }
                entry.dstate = DState::Modified;
                entry.sharers = HashSet::from([requester]);
                let reply_type = if already_sole_sharer {
                    MsgType::UpgradeRep
                } else {
                    MsgType::ExRep
                };
                self.reply(requester, address, reply_type, Some(entry.data.clone()));
            }
            DState::Exclusive | DState::Modified => {
                let owner = *entry
                    .sharers
                    .iter()
                    .next()
                    .expect("Exclusive/Modified entry must have exactly one sharer");
                if owner == requester {
                    self.reply(requester, address, MsgType::UpgradeRep, None);
                    return;
                }
                self.net.send(
                    owner,
                    Message {
                        msg_type: MsgType::InvReq,
                        sender_component: Component::Directory,
                        receiver_component: Component::CacheController,
                        from: self.tile_id,
                        to: owner,
                        requester,
                        single_receiver: INVALID_TILE_ID,
                        reply_expected: true,
                        address,
                        data: None,
                        modeled: true,
                        cache_line_utilization: 8,
                    },
                );
                let ack = self.net.recv(|m| {
                    m.from == owner && m.address == address && m.msg_type == MsgType::InvRep
                });
                if let Some(fresh) = ack.data {
                    entry.data = fresh;
                }
                entry.dstate = DState::Modified;
                entry.sharers = HashSet::from([requester]);
                self.reply(requester, address, MsgType::ExRep, Some(entry.data.clone()));
            }
        }
    }

    fn handle_wb_rep(&self, entry: &mut DirectoryEntry, msg: Message) {
        debug!(tile = self.tile_id, address = msg.address, from = msg.from, "WB_REP");
        if let Some(data) = msg.data {
            entry.data = data;
        }
        entry.sharers.remove(&msg.from);
        if entry.sharers.is_empty() {
            entry.dstate = DState::Uncached;
        } else if matches!(entry.dstate, DState::Exclusive | DState::Modified) {
            entry.dstate = DState::Shared;
        }
        // WB_REP is fire-and-forget from the evicting cache controller's
        // point of view (reply_expected is false); nothing to send back.
    }

    fn reply(&self, to: TileId, address: u64, msg_type: MsgType, data: Option<Vec<u8>>) {
        self.net.send(
            to,
            Message {
                msg_type,
                sender_component: Component::Directory,
                receiver_component: Component::CacheController,
                from: self.tile_id,
                to,
                requester: to,
                single_receiver: INVALID_TILE_ID,
                reply_expected: false,
                address,
                data,
                modeled: true,
                cache_line_utilization: 8,
            },
        );
    }

    /// Snapshot of an entry's state, for debug hooks and diagnostics.
    pub fn peek_state(&self, address: u64) -> DState {
        match self.entries.get(address) {
            Some(entry) => entry.lock().dstate,
            None => DState::Uncached,
        }
    }

    /// Force an entry into a given state, bypassing the protocol. Test/debug
    /// use only.
    pub fn debug_set_state(&self, address: u64, dstate: DState, sharers: HashSet<TileId>, data: Vec<u8>) {
        let entry_arc = self.entries.get_or_create(address);
        let mut entry = entry_arc.lock();
        entry.dstate = dstate;
        entry.sharers = sharers;
        entry.data = data;
    }

    /// All line addresses this slice has ever materialized an entry for;
    /// used to build a protocol-violation diagnostic dump.
    pub fn known_addresses(&self) -> Vec<u64> {
        self.entries.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Interconnect;

    fn slice(tile_id: TileId, ic: &Interconnect) -> DirectorySlice {
        DirectorySlice::new(tile_id, 64, std::sync::Arc::new(ic.endpoint(tile_id)))
    }

    #[test]
    fn uncached_sh_req_grants_exclusive() {
        let ic = Interconnect::new(2);
        let home = slice(0, &ic);
        let requester_ep = ic.endpoint(1);
        home.handle_request(Message {
            msg_type: MsgType::ShReq,
            sender_component: Component::CacheController,
            receiver_component: Component::Directory,
            from: 1,
            to: 0,
            requester: 1,
            single_receiver: INVALID_TILE_ID,
            reply_expected: true,
            address: 0,
            data: None,
            modeled: true,
            cache_line_utilization: 8,
        });
        assert_eq!(home.peek_state(0), DState::Exclusive);
        let reply = requester_ep.recv(|m| m.address == 0);
        assert_eq!(reply.msg_type, MsgType::ExRep);
    }

    #[test]
    fn second_sharer_stays_shared() {
        let ic = Interconnect::new(3);
        let home = slice(0, &ic);
        let ep1 = ic.endpoint(1);
        let ep2 = ic.endpoint(2);
        home.handle_request(Message {
            msg_type: MsgType::ShReq,
            sender_component: Component::CacheController,
            receiver_component: Component::Directory,
            from: 1,
            to: 0,
            requester: 1,
            single_receiver: INVALID_TILE_ID,
            reply_expected: true,
            address: 0,
            data: None,
            modeled: true,
            cache_line_utilization: 8,
        });
        let _ = ep1.recv(|m| m.address == 0);
        home.debug_set_state(0, DState::Shared, HashSet::from([1]), vec![0; 64]);
        home.handle_request(Message {
            msg_type: MsgType::ShReq,
            sender_component: Component::CacheController,
            receiver_component: Component::Directory,
            from: 2,
            to: 0,
            requester: 2,
            single_receiver: INVALID_TILE_ID,
            reply_expected: true,
            address: 0,
            data: None,
            modeled: true,
            cache_line_utilization: 8,
        });
        assert_eq!(home.peek_state(0), DState::Shared);
        let reply = ep2.recv(|m| m.address == 0);
        assert_eq!(reply.msg_type, MsgType::ShRep);
    }
}
