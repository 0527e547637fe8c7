//! Shared-memory layout: header slots, bitset lock sector, signal sector.
//!
//! One transport direction is made of four segments:
//!
//! - a header segment: 32 fixed slots, each an 8-word header prefix followed
//!   by a 128-word static payload area,
//! - a lock sector: the producer/consumer bitset words for the header ring,
//! - a dynamic payload arena (see [`crate::arena`]),
//! - a second lock sector holding the arena allocator's owner/release words.
//!
//! A lane additionally shares one signal sector (wake counter plus two hint
//! words) across both directions.

use std::sync::atomic::AtomicU32;

/// Number of header slots per ring. Also the width of the bitset words.
pub const SLOT_COUNT: usize = 32;

/// Header prefix per slot: 7 fields plus one reserved word.
pub const HEADER_WORDS: usize = 8;

/// Static payload area per slot, in u32 words (512 bytes).
pub const STATIC_WORDS: usize = 128;

/// Static payload capacity per slot, in bytes.
pub const STATIC_PAYLOAD_BYTES: usize = STATIC_WORDS * 4;

/// Full slot stride in u32 words.
pub const SLOT_STRIDE_WORDS: usize = HEADER_WORDS + STATIC_WORDS;

/// Size of a header segment in bytes.
pub const HEADER_SEGMENT_BYTES: usize = SLOT_COUNT * SLOT_STRIDE_WORDS * 4;

/// Dynamic arena: page granularity, default and maximum data capacity.
pub const ARENA_PAGE_BYTES: usize = 4096;
pub const ARENA_DEFAULT_INITIAL_BYTES: usize = 4 * 1024 * 1024;
pub const ARENA_MAX_BYTES: usize = 64 * 1024 * 1024;

/// Alignment of dynamic-arena reservations.
pub const ARENA_ALIGN: usize = 64;

const CACHE_LINE: usize = 64;

/// A pair of bitset words, each on its own cache line.
///
/// Bit `i` of `producer ^ consumer` means slot `i` holds data published by
/// the producer side and not yet released by the consumer side.
#[repr(C, align(64))]
pub struct LockSector {
    pub producer: AtomicU32,
    _pad1: [u8; CACHE_LINE - 4],
    pub consumer: AtomicU32,
    _pad2: [u8; CACHE_LINE - 4],
}

pub const LOCK_SECTOR_BYTES: usize = std::mem::size_of::<LockSector>();

/// Per-lane notification words, cache-line padded.
///
/// `op` is the wake counter the worker parks on; `rx_status` is 1 while the
/// worker is awake and 0 while it is parked; `tx_status` is 1 while the host
/// dispatcher is mid-pass (the "busy hint").
#[repr(C, align(64))]
pub struct SignalSector {
    pub op: AtomicU32,
    _pad1: [u8; CACHE_LINE - 4],
    pub rx_status: AtomicU32,
    _pad2: [u8; CACHE_LINE - 4],
    pub tx_status: AtomicU32,
    _pad3: [u8; CACHE_LINE - 4],
}

pub const SIGNAL_SECTOR_BYTES: usize = std::mem::size_of::<SignalSector>();

// Compile-time layout checks.
const _: () = {
    assert!(std::mem::size_of::<LockSector>() == 128);
    assert!(std::mem::align_of::<LockSector>() == 64);
    assert!(std::mem::size_of::<SignalSector>() == 192);
    assert!(HEADER_SEGMENT_BYTES == 32 * 136 * 4);
    assert!(STATIC_PAYLOAD_BYTES == 512);
};

/// Word offsets of the header fields within a slot prefix.
pub mod field {
    pub const FLAGS: usize = 0;
    pub const ID: usize = 1;
    pub const FN: usize = 2;
    pub const TAG: usize = 3;
    pub const START: usize = 4;
    pub const END: usize = 5;
    pub const LEN: usize = 6;
    pub const SLOT: usize = 7;
}

/// Result flag values carried in the `flags` header word.
pub const FLAG_FULFILLED: u32 = 0;
pub const FLAG_REJECTED: u32 = 1;

/// One task's control header, mirrored into/out of a ring slot.
///
/// `start`/`end` double as the raw bit pattern of header-encoded scalars;
/// `len` is the payload byte length for buffered kinds; `slot` is the
/// dynamic-arena bit handle when the payload lives in the arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskHeader {
    pub flags: u32,
    pub id: u32,
    pub fn_id: u32,
    pub tag: u32,
    pub start: u32,
    pub end: u32,
    pub len: u32,
    pub slot: u32,
}

impl TaskHeader {
    pub fn to_words(&self) -> [u32; HEADER_WORDS] {
        [
            self.flags, self.id, self.fn_id, self.tag, self.start, self.end, self.len, self.slot,
        ]
    }

    pub fn from_words(w: &[u32; HEADER_WORDS]) -> Self {
        Self {
            flags: w[field::FLAGS],
            id: w[field::ID],
            fn_id: w[field::FN],
            tag: w[field::TAG],
            start: w[field::START],
            end: w[field::END],
            len: w[field::LEN],
            slot: w[field::SLOT],
        }
    }

    /// Pack a 64-bit pattern into the `start`/`end` words.
    pub fn set_raw64(&mut self, bits: u64) {
        self.start = bits as u32;
        self.end = (bits >> 32) as u32;
    }

    /// Recover a 64-bit pattern from the `start`/`end` words.
    pub fn raw64(&self) -> u64 {
        (self.start as u64) | ((self.end as u64) << 32)
    }
}
