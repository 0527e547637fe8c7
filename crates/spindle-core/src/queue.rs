//! Frame layer: one direction of a lane, as payloads instead of raw slots.
//!
//! A [`FrameSender`] serializes a payload, places the bytes (header words
//! for scalars, the slot's static area for short buffers, the arena for
//! long ones) and publishes the header. A [`FrameReceiver`] drains the
//! ring, decodes each slot back into a [`Payload`] and releases arena
//! reservations as it goes.
//!
//! Both directions of a lane share one segment layout, defined by
//! [`offsets`]; host→worker and worker→host each get their own segment.

use std::sync::Arc;

use crate::arena::{Arena, ArenaReader, SlotAllocator};
use crate::codec::{self, Payload, TypeTag, Wire};
use crate::error::{DecodeError, EncodeError};
use crate::layout::{TaskHeader, HEADER_SEGMENT_BYTES, STATIC_PAYLOAD_BYTES};
use crate::ring::{RingConsumer, RingProducer};
use crate::shm::SharedMemory;

/// Byte offsets within one direction's segment: the 32-slot header ring,
/// one [`LockSector`](crate::layout::LockSector) for the ring's bitset
/// words, one for the arena's owner/release words, then the arena data.
/// Every word sits on its own cache line.
pub mod offsets {
    use crate::layout::{HEADER_SEGMENT_BYTES, LOCK_SECTOR_BYTES};

    pub const RING_BASE: usize = 0;
    pub const RING_PRODUCER: usize = HEADER_SEGMENT_BYTES;
    pub const RING_CONSUMER: usize = RING_PRODUCER + LOCK_SECTOR_BYTES / 2;
    pub const ARENA_OWNER: usize = HEADER_SEGMENT_BYTES + LOCK_SECTOR_BYTES;
    pub const ARENA_RELEASE: usize = ARENA_OWNER + LOCK_SECTOR_BYTES / 2;
    pub const ARENA_BASE: usize = ARENA_OWNER + LOCK_SECTOR_BYTES;

    /// Total segment size for a direction with the given arena cap.
    pub fn segment_bytes(arena_max: usize) -> usize {
        ARENA_BASE + arena_max
    }
}

/// Per-frame control fields chosen by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameMeta {
    pub id: u32,
    pub fn_id: u32,
    pub flags: u32,
}

/// Outcome of a send attempt. `Backpressure` means the ring or arena is
/// full; the frame was not published and the caller re-queues it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { slot: u32 },
    Backpressure,
}

/// A received frame, decoded.
#[derive(Debug)]
pub struct Frame {
    pub slot: u32,
    pub flags: u32,
    pub id: u32,
    pub fn_id: u32,
    pub payload: Result<Payload, DecodeError>,
}

/// Producer side of one direction.
pub struct FrameSender {
    ring: RingProducer,
    arena: Arena,
}

impl FrameSender {
    /// Lay a sender over a direction segment created with
    /// [`offsets::segment_bytes`].
    pub fn over(shm: Arc<SharedMemory>, arena_initial: usize, arena_max: usize) -> Self {
        debug_assert!(shm.len() >= offsets::segment_bytes(arena_max));
        let ring = RingProducer::new(
            shm.clone(),
            offsets::RING_BASE,
            offsets::RING_PRODUCER,
            offsets::RING_CONSUMER,
        );
        let alloc = SlotAllocator::new(shm, offsets::ARENA_OWNER, offsets::ARENA_RELEASE);
        let arena = Arena::new(alloc, offsets::ARENA_BASE, arena_initial, arena_max);
        Self { ring, arena }
    }

    /// Free header slots right now. A zero here is the dispatcher's cue to
    /// stop pumping.
    pub fn free_slots(&self) -> u32 {
        self.ring.free_slots()
    }

    /// Serialize and publish one frame.
    ///
    /// `Err` means the payload itself cannot be encoded (the frame will
    /// never fit); `Ok(Backpressure)` means it would fit later.
    pub fn send(&mut self, meta: FrameMeta, payload: &Payload) -> Result<SendOutcome, EncodeError> {
        if self.ring.free_mask() == 0 {
            return Ok(SendOutcome::Backpressure);
        }

        let mut header = TaskHeader {
            flags: meta.flags,
            id: meta.id,
            fn_id: meta.fn_id,
            ..Default::default()
        };

        let slot = match codec::to_wire(payload)? {
            Wire::Scalar { tag, bits } => {
                header.tag = tag as u32;
                header.set_raw64(bits);
                self.ring.publish(&header, &[])
            }
            Wire::Buffer { kind, bytes } if bytes.len() <= STATIC_PAYLOAD_BYTES => {
                header.tag = kind.tag(false) as u32;
                header.len = bytes.len() as u32;
                self.ring.publish(&header, &bytes)
            }
            Wire::Buffer { kind, bytes } => {
                let Some(r) = self.arena.reserve(bytes.len()) else {
                    return Ok(SendOutcome::Backpressure);
                };
                // Safety: the reservation is ours until the header below
                // is published.
                unsafe {
                    self.arena.chunk_mut(&r)[..bytes.len()].copy_from_slice(&bytes);
                }
                header.tag = kind.tag(true) as u32;
                header.start = r.start;
                header.end = r.start + bytes.len() as u32;
                header.len = bytes.len() as u32;
                header.slot = r.bit;
                self.ring.publish(&header, &[])
            }
        };

        // The free check at the top plus the single-producer rule mean the
        // publish cannot miss; keep the branch honest anyway.
        match slot {
            Some(slot) => Ok(SendOutcome::Sent { slot }),
            None => Ok(SendOutcome::Backpressure),
        }
    }
}

/// Consumer side of one direction.
pub struct FrameReceiver {
    ring: RingConsumer,
    arena: ArenaReader,
}

impl FrameReceiver {
    pub fn over(shm: Arc<SharedMemory>) -> Self {
        let ring = RingConsumer::new(
            shm.clone(),
            offsets::RING_BASE,
            offsets::RING_PRODUCER,
            offsets::RING_CONSUMER,
        );
        let arena = ArenaReader::new(shm, offsets::ARENA_BASE, offsets::ARENA_RELEASE);
        Self { ring, arena }
    }

    pub fn has_unread(&self) -> bool {
        self.ring.has_unread()
    }

    pub fn unread(&self) -> u32 {
        self.ring.unread_mask().count_ones()
    }

    /// Drain and decode up to `max` frames. Arena payloads are copied out
    /// and released before `take` returns, so a slow caller never holds
    /// arena capacity hostage.
    pub fn recv(&mut self, max: usize, mut take: impl FnMut(Frame)) -> usize {
        let arena = &self.arena;
        self.ring.drain(max, |slot, header, static_area| {
            let payload = decode_frame(&header, static_area, arena);
            take(Frame {
                slot,
                flags: header.flags,
                id: header.id,
                fn_id: header.fn_id,
                payload,
            });
        })
    }
}

fn decode_frame(
    header: &TaskHeader,
    static_area: &[u8],
    arena: &ArenaReader,
) -> Result<Payload, DecodeError> {
    let tag = TypeTag::from_u32(header.tag).ok_or(DecodeError::UnknownTag(header.tag))?;
    if let Some(scalar) = codec::scalar_from_wire(tag, header.raw64()) {
        return Ok(scalar);
    }
    let kind = tag.buffer_kind().ok_or(DecodeError::UnknownTag(header.tag))?;

    if tag.is_dynamic() {
        // Safety: the slot is unreleased and owned by this drain pass.
        let bytes = unsafe { arena.read(header.start, header.len) };
        let decoded = match bytes {
            Some(bytes) => codec::buffer_from_wire(kind, bytes),
            None => Err(DecodeError::PayloadOutOfBounds {
                start: header.start,
                len: header.len,
                max: u32::MAX,
            }),
        };
        arena.release(header.slot);
        decoded
    } else {
        let len = header.len as usize;
        let bytes = static_area
            .get(..len)
            .ok_or(DecodeError::PayloadOutOfBounds {
                start: 0,
                len: header.len,
                max: STATIC_PAYLOAD_BYTES as u32,
            })?;
        codec::buffer_from_wire(kind, bytes)
    }
}

const _: () = {
    assert!(offsets::ARENA_BASE == HEADER_SEGMENT_BYTES + 256);
};
