//! Relay wire format
//!
//! Announce / envelope: [1: tag] [16: peer_id] [N: payload]
//! Forward:             [2: tag] [16: src_id] [16: dst_id] [N: payload]

use crate::identity::{NodeId, NODE_ID_LEN};

/// Packet tags
pub const TAG_ANNOUNCE: u8 = 0x01;
pub const TAG_FORWARD: u8 = 0x02;

/// Shortest datagram the relay accepts (tag + peer id)
pub const MIN_ANNOUNCE_LEN: usize = 1 + NODE_ID_LEN;

/// Shortest forward datagram (tag + source id + destination id)
pub const MIN_FORWARD_LEN: usize = 1 + 2 * NODE_ID_LEN;

/// A parsed relay datagram, borrowing its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    Announce { peer: NodeId, payload: &'a [u8] },
    Forward { src: NodeId, dst: NodeId, payload: &'a [u8] },
}

/// Why a datagram was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reject {
    /// Shorter than the minimum for its tag
    TooShort,
    /// First byte is not a known tag
    UnknownTag(u8),
}

fn node_id_at(data: &[u8], offset: usize) -> NodeId {
    let mut id = [0u8; NODE_ID_LEN];
    id.copy_from_slice(&data[offset..offset + NODE_ID_LEN]);
    NodeId(id)
}

/// Parse one datagram
pub fn parse(data: &[u8]) -> Result<Frame<'_>, Reject> {
    if data.len() < MIN_ANNOUNCE_LEN {
        return Err(Reject::TooShort);
    }
    match data[0] {
        TAG_ANNOUNCE => Ok(Frame::Announce {
            peer: node_id_at(data, 1),
            payload: &data[MIN_ANNOUNCE_LEN..],
        }),
        TAG_FORWARD => {
            if data.len() < MIN_FORWARD_LEN {
                return Err(Reject::TooShort);
            }
            Ok(Frame::Forward {
                src: node_id_at(data, 1),
                dst: node_id_at(data, 1 + NODE_ID_LEN),
                payload: &data[MIN_FORWARD_LEN..],
            })
        }
        other => Err(Reject::UnknownTag(other)),
    }
}

/// Build an announce packet, optionally carrying a payload
pub fn build_announce(peer: &NodeId, payload: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(MIN_ANNOUNCE_LEN + payload.len());
    pkt.push(TAG_ANNOUNCE);
    pkt.extend_from_slice(peer.as_bytes());
    pkt.extend_from_slice(payload);
    pkt
}

/// Build a forward packet from `src` to `dst`
pub fn build_forward(src: &NodeId, dst: &NodeId, payload: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(MIN_FORWARD_LEN + payload.len());
    pkt.push(TAG_FORWARD);
    pkt.extend_from_slice(src.as_bytes());
    pkt.extend_from_slice(dst.as_bytes());
    pkt.extend_from_slice(payload);
    pkt
}
