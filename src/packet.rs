//! # Packet Model
//!
//! The unit of transfer for both gap engines: `{source_rank, id, payload}`,
//! framed so a receiver can read `source_rank` and `id` straight out of the
//! raw buffer with no prior knowledge of the sender (spec.md §3). `id` is
//! strictly monotonic per sender, starting at 1.
//!
//! Wire layout (fixed-size header, grounded on the original's `ct_ints`/
//! `rt_ints` packing): `source_rank: u64 LE | id: i32 LE | payload: [u32 LE; K]`.

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Fixed header size: 8 bytes for `source_rank`, 4 for `id`.
pub const HEADER_SIZE: usize = 8 + 4;

/// `Serialize`/`Deserialize` let [`Packet`] double as the payload type the
/// multi-channel communicator (`comm::Communicator::send`/`receive`) moves
/// over `bincode`; the gap engines never touch that path and keep using
/// [`Packet::encode`]/[`Packet::decode`] directly on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub source_rank: u64,
    pub id: i32,
    pub payload: Vec<u32>,
}

impl Packet {
    pub fn new(source_rank: u64, id: i32, payload: Vec<u32>) -> Self {
        Self {
            source_rank,
            id,
            payload,
        }
    }

    /// Wire size in bytes for a packet carrying `count` `u32` payload
    /// elements: `sizeof(rank) + sizeof(id) + count * 4`.
    pub const fn wire_size(count: usize) -> usize {
        HEADER_SIZE + count * 4
    }

    pub fn size(&self) -> usize {
        Self::wire_size(self.payload.len())
    }

    /// Serializes into the fixed layout described above. Does not involve
    /// `serde`/`bincode` on purpose: this is the hot path for every packet
    /// in the gap engines, and the layout must be self-describing without
    /// a schema (`source_rank`/`id` readable with no prior knowledge).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        buf.extend_from_slice(&self.source_rank.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        for word in &self.payload {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        buf
    }

    /// Inverse of [`Packet::encode`].
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE || (bytes.len() - HEADER_SIZE) % 4 != 0 {
            return None;
        }
        let source_rank = u64::from_le_bytes(bytes[0..8].try_into().ok()?);
        let id = i32::from_le_bytes(bytes[8..12].try_into().ok()?);
        let payload = bytes[HEADER_SIZE..]
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
            .collect();
        Some(Self {
            source_rank,
            id,
            payload,
        })
    }

    /// Reads just the source rank out of a raw buffer, without decoding the
    /// full packet — the property spec.md §3 requires of the framing.
    pub fn peek_source_rank(bytes: &[u8]) -> Option<u64> {
        bytes.get(0..8).map(|b| u64::from_le_bytes(b.try_into().unwrap()))
    }

    /// Reads just the id out of a raw buffer.
    pub fn peek_id(bytes: &[u8]) -> Option<i32> {
        bytes.get(8..12).map(|b| i32::from_le_bytes(b.try_into().unwrap()))
    }
}

/// Generates successive packets for one sender, filling the payload either
/// with random words or a fixed, uniform value — mirroring the original's
/// `generator<T>` dual `operator()`/`operator()(n)` overloads.
pub struct PacketGenerator {
    source_rank: u64,
    element_count: usize,
    next_id: i32,
    fixed_fill: Option<u32>,
}

impl PacketGenerator {
    pub fn new(source_rank: u64, element_count: usize, fixed_fill: Option<u32>) -> Self {
        Self {
            source_rank,
            element_count,
            next_id: 0,
            fixed_fill,
        }
    }

    /// Produces the next packet, advancing the monotonic id counter.
    pub fn generate(&mut self) -> Packet {
        self.next_id += 1;
        let payload = match self.fixed_fill {
            Some(value) => vec![value; self.element_count],
            None => {
                let mut rng = rand::thread_rng();
                let mut payload = vec![0u32; self.element_count];
                for word in &mut payload {
                    *word = rng.next_u32();
                }
                payload
            }
        };
        Packet::new(self.source_rank, self.next_id, payload)
    }

    pub fn current_id(&self) -> i32 {
        self.next_id
    }
}
