//! The coherence message: its shape, and the wire framing used to move it
//! across a [`crate::network::NetworkEndpoint`].
//!
//! The framing is intentionally field-by-field rather than a struct memcpy.
//! The simulator this crate descends from serialized `ShmemMsg` onto the
//! wire with a raw `memcpy` of the whole struct (data pointer included),
//! which only worked because sender and receiver shared an address space.
//! That trick does not survive a real byte-oriented transport, so every
//! field here is encoded and decoded explicitly.

use serde::{Deserialize, Serialize};

use crate::error::{SimError, Result};

/// Logical tile identity. Small integer, not a UUID: the number of tiles on
/// a chip is fixed at construction and never needs global uniqueness beyond
/// that chip.
pub type TileId = u32;

/// Sentinel for "no single receiver" / "no requester" in contexts where the
/// field is present on the wire but semantically absent.
pub const INVALID_TILE_ID: TileId = TileId::MAX;

/// Which half of a tile's memory subsystem a message is addressed to or
/// sent from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Component {
    /// The requesting/inbound-serving L1/L2 cache controller.
    CacheController,
    /// The home DRAM directory slice.
    Directory,
}

impl Component {
    fn to_byte(self) -> u8 {
        match self {
            Component::CacheController => 0,
            Component::Directory => 1,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Component::CacheController),
            1 => Ok(Component::Directory),
            other => Err(SimError::Transport(format!(
                "unrecognized component byte {other}"
            ))),
        }
    }
}

/// Every coherence message type defined by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgType {
    /// Request for a shared copy of a line.
    ShReq,
    /// Request for an exclusive copy of a line.
    ExReq,
    /// Reply confirming a Shared-to-Exclusive upgrade needs no data resend.
    UpgradeRep,
    /// Home asks a cache controller to invalidate its copy.
    InvReq,
    /// Home asks a cache controller to flush (and usually keep sharing).
    FlushReq,
    /// Home asks a cache controller to write its dirty copy back without
    /// downgrading sharer status (e.g. resolving an Owned-to-Shared
    /// transition that needs the canonical copy).
    WbReq,
    /// Fused "send your data straight to the requester, then ack home".
    InvFlushCombinedReq,
    /// Reply to SH_REQ, carries the line's data.
    ShRep,
    /// Reply to EX_REQ, carries the line's data.
    ExRep,
    /// Reply/ack to INV_REQ (and the combined variant); may carry dirty data.
    InvRep,
    /// Reply to FLUSH_REQ, carries the line's data.
    FlushRep,
    /// Write-back of a dirty line to home: either a reply to WB_REQ, or
    /// sent unsolicited by a cache controller evicting a Modified/Owned
    /// line before freeing the slot.
    WbRep,
}

impl MsgType {
    fn to_byte(self) -> u8 {
        match self {
            MsgType::ShReq => 0,
            MsgType::ExReq => 1,
            MsgType::UpgradeRep => 2,
            MsgType::InvReq => 3,
            MsgType::FlushReq => 4,
            MsgType::WbReq => 5,
            MsgType::InvFlushCombinedReq => 6,
            MsgType::ShRep => 7,
            MsgType::ExRep => 8,
            MsgType::InvRep => 9,
            MsgType::FlushRep => 10,
            MsgType::WbRep => 11,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0 => MsgType::ShReq,
            1 => MsgType::ExReq,
            2 => MsgType::UpgradeRep,
            3 => MsgType::InvReq,
            4 => MsgType::FlushReq,
            5 => MsgType::WbReq,
            6 => MsgType::InvFlushCombinedReq,
            7 => MsgType::ShRep,
            8 => MsgType::ExRep,
            9 => MsgType::InvRep,
            10 => MsgType::FlushRep,
            11 => MsgType::WbRep,
            other => {
                return Err(SimError::Transport(format!(
                    "unrecognized msg_type byte {other}"
                )))
            }
        })
    }

    /// True for messages that carry a `data` payload when present.
    pub fn is_data_bearing(self) -> bool {
        matches!(
            self,
            MsgType::ShRep | MsgType::ExRep | MsgType::FlushRep | MsgType::WbRep | MsgType::InvRep
        )
    }
}

/// A coherence protocol message, owned end to end: no borrowed data, no
/// shared pointer into someone else's cache line. Each hop that wants to
/// keep a copy of `data` clones it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MsgType,
    pub sender_component: Component,
    pub receiver_component: Component,
    /// The tile whose transport endpoint actually sent this message.
    pub from: TileId,
    /// The tile whose transport endpoint should receive this message.
    pub to: TileId,
    /// The tile on whose behalf this message exists (the original requester
    /// for a forwarded request, or the reply's ultimate consumer).
    pub requester: TileId,
    /// For fused messages: the tile that should receive the data payload
    /// directly, distinct from `to`. `INVALID_TILE_ID` when unused.
    pub single_receiver: TileId,
    /// Whether the sender is blocked awaiting a reply to this message.
    pub reply_expected: bool,
    /// Line-aligned physical address this message concerns.
    pub address: u64,
    /// Payload, present on data-bearing messages (and optionally on
    /// INV_REP, which may piggyback a dirty line during the combined
    /// invalidate-and-flush path).
    pub data: Option<Vec<u8>>,
    /// Whether this message should count toward modeled traffic stats.
    pub modeled: bool,
    /// Fraction of the cache line actually touched by the access that
    /// triggered this message, in eighths (0..=8); used for modeling only.
    pub cache_line_utilization: u32,
}

impl Message {
    /// Field-by-field wire encoding. Mirrors `getModeledLength`'s per-type
    /// byte accounting but serializes every field actually needed to
    /// reconstruct the message, not just the ones that count toward the
    /// modeled length.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + self.data.as_ref().map_or(0, Vec::len));
        buf.push(self.msg_type.to_byte());
        buf.push(self.sender_component.to_byte());
        buf.push(self.receiver_component.to_byte());
        buf.extend_from_slice(&self.from.to_le_bytes());
        buf.extend_from_slice(&self.to.to_le_bytes());
        buf.extend_from_slice(&self.requester.to_le_bytes());
        buf.extend_from_slice(&self.single_receiver.to_le_bytes());
        buf.push(self.reply_expected as u8);
        buf.extend_from_slice(&self.address.to_le_bytes());
        buf.push(self.modeled as u8);
        buf.extend_from_slice(&self.cache_line_utilization.to_le_bytes());
        match &self.data {
            Some(bytes) => {
                buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                buf.extend_from_slice(bytes);
            }
            None => buf.extend_from_slice(&0u32.to_le_bytes()),
        }
        buf
    }

    /// Inverse of [`Message::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = 0usize;
        let mut take = |n: usize| -> Result<&[u8]> {
            let slice = buf
                .get(cursor..cursor + n)
                .ok_or_else(|| SimError::Transport("truncated message".into()))?;
            cursor += n;
            Ok(slice)
        };

        let msg_type = MsgType::from_byte(take(1)?[0])?;
        let sender_component = Component::from_byte(take(1)?[0])?;
        let receiver_component = Component::from_byte(take(1)?[0])?;
        let from = TileId::from_le_bytes(take(4)?.try_into().unwrap());
        let to = TileId::from_le_bytes(take(4)?.try_into().unwrap());
        let requester = TileId::from_le_bytes(take(4)?.try_into().unwrap());
        let single_receiver = TileId::from_le_bytes(take(4)?.try_into().unwrap());
        let reply_expected = take(1)?[0] != 0;
        let address = u64::from_le_bytes(take(8)?.try_into().unwrap());
        let modeled = take(1)?[0] != 0;
        let cache_line_utilization = u32::from_le_bytes(take(4)?.try_into().unwrap());
        let data_len = u32::from_le_bytes(take(4)?.try_into().unwrap()) as usize;
        let data = if data_len > 0 {
            Some(take(data_len)?.to_vec())
        } else {
            None
        };

        Ok(Message {
            msg_type,
            sender_component,
            receiver_component,
            from,
            to,
            requester,
            single_receiver,
            reply_expected,
            address,
            data,
            modeled,
            cache_line_utilization,
        })
    }

    /// The modeled byte length of this message, following the original
    /// simulator's per-type accounting: one byte for the type tag, plus an
    /// address-width field for every message, plus a tile-id-width field
    /// for the combined invalidate+flush request, plus the data length for
    /// data-bearing replies.
    pub fn modeled_length(&self, address_width_bytes: usize, tile_id_width_bytes: usize) -> u32 {
        let base = 1 + address_width_bytes;
        let len = match self.msg_type {
            MsgType::InvFlushCombinedReq => base + tile_id_width_bytes,
            _ if self.msg_type.is_data_bearing() => {
                base + self.data.as_ref().map_or(0, Vec::len)
            }
            _ => base,
        };
        len as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(data: Option<Vec<u8>>) -> Message {
        Message {
            msg_type: MsgType::ExRep,
            sender_component: Component::Directory,
            receiver_component: Component::CacheController,
            from: 1,
            to: 0,
            requester: 0,
            single_receiver: INVALID_TILE_ID,
            reply_expected: false,
            address: 0xdead_beef_0000,
            data,
            modeled: true,
            cache_line_utilization: 8,
        }
    }

    #[test]
    fn round_trips_without_data() {
        let msg = sample(None);
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.msg_type, msg.msg_type);
        assert_eq!(decoded.address, msg.address);
        assert!(decoded.data.is_none());
    }

    #[test]
    fn round_trips_with_data() {
        let msg = sample(Some(vec![1, 2, 3, 4, 5, 6, 7, 8]));
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.data, msg.data);
        assert_eq!(decoded.single_receiver, INVALID_TILE_ID);
    }

    #[test]
    fn modeled_length_matches_spec_formula() {
        let mut msg = sample(Some(vec![0u8; 64]));
        assert_eq!(msg.modeled_length(8, 4), 1 + 8 + 64);
        msg.msg_type = MsgType::InvFlushCombinedReq;
        msg.data = None;
        assert_eq!(msg.modeled_length(8, 4), 1 + 8 + 4);
        msg.msg_type = MsgType::ShReq;
        assert_eq!(msg.modeled_length(8, 4), 1 + 8);
    }

    #[test]
    fn decode_rejects_truncated_buffer() {
        let msg = sample(None);
        let mut bytes = msg.encode();
        bytes.truncate(bytes.len() - 2);
        assert!(Message::decode(&bytes).is_err());
    }
}
