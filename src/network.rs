//! The interconnect: a per-tile inbound queue with predicate-based receive.
//!
//! `recv` blocks until a packet already queued (or one that arrives later)
//! satisfies the caller's predicate. Packets that don't match stay queued in
//! arrival order for whichever later `recv` call does want them — this is
//! what lets a tile's core thread block on its own reply while a separate
//! thread on the same tile keeps servicing unrelated inbound protocol
//! traffic off the same queue.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::message::{Message, TileId};

struct Inbox {
    queue: Mutex<VecDeque<Message>>,
    arrived: Condvar,
}

impl Inbox {
    fn new() -> Self {
        Inbox {
            queue: Mutex::new(VecDeque::new()),
            arrived: Condvar::new(),
        }
    }
}

/// Shared routing state for a chip: one inbox per tile. Cheap to clone
/// (just an `Arc` bump); every tile's [`NetworkEndpoint`] holds a clone.
#[derive(Clone)]
pub struct Interconnect {
    inboxes: Arc<Vec<Arc<Inbox>>>,
}

impl Interconnect {
    pub fn new(tile_count: usize) -> Self {
        Interconnect {
            inboxes: Arc::new((0..tile_count).map(|_| Arc::new(Inbox::new())).collect()),
        }
    }

    /// A handle bound to one tile's identity, used for both sending to
    /// other tiles and receiving on this tile's own inbox.
    pub fn endpoint(&self, tile_id: TileId) -> NetworkEndpoint {
        NetworkEndpoint {
            tile_id,
            interconnect: self.clone(),
        }
    }
}

/// A single tile's view of the interconnect.
pub struct NetworkEndpoint {
    tile_id: TileId,
    interconnect: Interconnect,
}

impl NetworkEndpoint {
    pub fn tile_id(&self) -> TileId {
        self.tile_id
    }

    /// Enqueue `msg` on `to`'s inbox and wake anyone blocked on it. Returns
    /// the encoded byte length, as a stand-in for "bytes put on the wire".
    pub fn send(&self, to: TileId, msg: Message) -> usize {
        let len = msg.encode().len();
        let inbox = &self.interconnect.inboxes[to as usize];
        inbox.queue.lock().push_back(msg);
        inbox.arrived.notify_all();
        len
    }

    /// Block until a queued (or future) message on this tile's own inbox
    /// satisfies `pred`, then remove and return it. Messages that don't
    /// match are left in place, in arrival order, for another caller.
    pub fn recv<F>(&self, pred: F) -> Message
    where
        F: Fn(&Message) -> bool,
    {
        let inbox = &self.interconnect.inboxes[self.tile_id as usize];
        let mut guard = inbox.queue.lock();
        loop {
            if let Some(pos) = guard.iter().position(|m| pred(m)) {
                return guard.remove(pos).expect("position was just found");
            }
            inbox.arrived.wait(&mut guard);
        }
    }

    /// Non-blocking variant of [`NetworkEndpoint::recv`], for service loops
    /// that need to poll a shutdown flag between messages.
    pub fn try_recv<F>(&self, pred: F) -> Option<Message>
    where
        F: Fn(&Message) -> bool,
    {
        let inbox = &self.interconnect.inboxes[self.tile_id as usize];
        let mut guard = inbox.queue.lock();
        let pos = guard.iter().position(|m| pred(m))?;
        guard.remove(pos)
    }

    /// Block, with a timeout, for diagnostics/tests that want to assert "no
    /// matching message arrives". Returns `None` on timeout.
    pub fn recv_timeout<F>(&self, pred: F, timeout: std::time::Duration) -> Option<Message>
    where
        F: Fn(&Message) -> bool,
    {
        let inbox = &self.interconnect.inboxes[self.tile_id as usize];
        let mut guard = inbox.queue.lock();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(pos) = guard.iter().position(|m| pred(m)) {
                return guard.remove(pos);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let result = inbox.arrived.wait_for(&mut guard, deadline - now);
            if result.timed_out() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Component, MsgType, INVALID_TILE_ID};

    fn msg(msg_type: MsgType, from: TileId, to: TileId, address: u64) -> Message {
        Message {
            msg_type,
            sender_component: Component::CacheController,
            receiver_component: Component::Directory,
            from,
            to,
            requester: from,
            single_receiver: INVALID_TILE_ID,
            reply_expected: true,
            address,
            data: None,
            modeled: true,
            cache_line_utilization: 8,
        }
    }

    #[test]
    fn send_then_recv_same_tile() {
        let ic = Interconnect::new(2);
        let a = ic.endpoint(0);
        let b = ic.endpoint(1);
        a.send(1, msg(MsgType::ShReq, 0, 1, 0x1000));
        let got = b.recv(|m| m.msg_type == MsgType::ShReq);
        assert_eq!(got.address, 0x1000);
    }

    #[test]
    fn non_matching_messages_stay_queued() {
        let ic = Interconnect::new(2);
        let a = ic.endpoint(0);
        let b = ic.endpoint(1);
        a.send(1, msg(MsgType::ShReq, 0, 1, 0x1000));
        a.send(1, msg(MsgType::ExReq, 0, 1, 0x2000));
        let got = b.recv(|m| m.msg_type == MsgType::ExReq);
        assert_eq!(got.address, 0x2000);
        let got2 = b.recv(|m| m.msg_type == MsgType::ShReq);
        assert_eq!(got2.address, 0x1000);
    }

    #[test]
    fn recv_blocks_until_match_arrives_from_another_thread() {
        let ic = Interconnect::new(2);
        let a = ic.endpoint(0);
        let b = ic.endpoint(1);
        let handle = std::thread::spawn(move || b.recv(|m| m.msg_type == MsgType::WbReq));
        std::thread::sleep(std::time::Duration::from_millis(20));
        a.send(1, msg(MsgType::WbReq, 0, 1, 0x3000));
        let got = handle.join().unwrap();
        assert_eq!(got.address, 0x3000);
    }

    #[test]
    fn recv_timeout_returns_none_when_nothing_matches() {
        let ic = Interconnect::new(1);
        let a = ic.endpoint(0);
        let got = a.recv_timeout(
            |m| m.msg_type == MsgType::WbReq,
            std::time::Duration::from_millis(10),
        );
        assert!(got.is_none());
    }
}
