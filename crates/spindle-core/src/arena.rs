//! Dynamic payload arena and its 32-entry slot allocator.
//!
//! Payloads too large for a header slot's static area are written into a
//! growable arena segment. The producer side owns an allocation table of at
//! most [`SLOT_COUNT`] live entries sorted by start offset; the consumer
//! releases an entry by flipping its bit in the shared release word after
//! copying the payload out. The producer never scans on the hot path: freed
//! entries are swept out lazily, on every fourth allocation call and
//! whenever the table or address space looks full.
//!
//! The segment is mapped at its maximum size up front, so "growth" is a
//! bump of the committed byte counter and never relocates data.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::layout::{ARENA_ALIGN, ARENA_MAX_BYTES, ARENA_PAGE_BYTES, SLOT_COUNT};
use crate::shm::SharedMemory;

/// How many allocation calls between lazy sweeps of released entries.
const SWEEP_INTERVAL: u32 = 4;

/// A live arena reservation: byte range plus the bit index the consumer
/// flips to release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub start: u32,
    pub len: u32,
    pub bit: u32,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    start: u32,
    len: u32,
    bit: u32,
}

/// Producer-side allocation table over a shared owner/release word pair.
///
/// Bit `b` of `owner ^ release` means the reservation holding bit `b` is
/// still in flight. The producer flips `owner` on allocate; the consumer
/// flips `release` when done.
pub struct SlotAllocator {
    shm: Arc<SharedMemory>,
    owner_off: usize,
    release_off: usize,
    entries: Vec<Entry>,
    calls: u32,
}

impl SlotAllocator {
    pub fn new(shm: Arc<SharedMemory>, owner_off: usize, release_off: usize) -> Self {
        Self {
            shm,
            owner_off,
            release_off,
            entries: Vec::with_capacity(SLOT_COUNT),
            calls: 0,
        }
    }

    fn owner(&self) -> &AtomicU32 {
        self.shm.atomic_u32(self.owner_off)
    }

    fn release(&self) -> &AtomicU32 {
        self.shm.atomic_u32(self.release_off)
    }

    /// Number of live (unswept) entries.
    pub fn live(&self) -> usize {
        self.entries.len()
    }

    /// Reserve `size` bytes within the first `capacity` bytes of the arena.
    ///
    /// Sizes are rounded up to [`ARENA_ALIGN`]. Returns `None` when the
    /// table is full or no gap fits; that is backpressure, not an error.
    pub fn alloc(&mut self, size: usize, capacity: usize) -> Option<Reservation> {
        self.calls = self.calls.wrapping_add(1);
        if self.calls % SWEEP_INTERVAL == 0 {
            self.sweep();
        }

        let aligned = align_up(size);
        if aligned > capacity {
            return None;
        }

        if self.entries.len() == SLOT_COUNT {
            self.sweep();
            if self.entries.len() == SLOT_COUNT {
                return None;
            }
        }

        let (index, start) = match self.find_gap(aligned as u32, capacity as u32) {
            Some(found) => found,
            None => {
                // Retry once after reclaiming released entries.
                self.sweep();
                self.find_gap(aligned as u32, capacity as u32)?
            }
        };

        let bit = self.claim_bit()?;
        self.entries.insert(
            index,
            Entry {
                start,
                len: aligned as u32,
                bit,
            },
        );
        self.owner().fetch_xor(1 << bit, Ordering::AcqRel);

        Some(Reservation {
            start,
            len: aligned as u32,
            bit,
        })
    }

    /// Shrink the recorded length of a live reservation. Growing is not
    /// supported; a longer payload needs a fresh reservation.
    pub fn set_len(&mut self, bit: u32, new_len: usize) {
        let aligned = align_up(new_len) as u32;
        if let Some(entry) = self.entries.iter_mut().find(|e| e.bit == bit) {
            if aligned < entry.len {
                entry.len = aligned;
            }
        }
    }

    /// Drop entries the consumer has released. Keeps the table sorted.
    fn sweep(&mut self) {
        let owner = self.owner().load(Ordering::Acquire);
        let release = self.release().load(Ordering::Acquire);
        let in_flight = owner ^ release;
        self.entries.retain(|e| in_flight & (1 << e.bit) != 0);
    }

    /// First-fit over the gaps between sorted entries. Returns the insertion
    /// index and the gap's start offset.
    fn find_gap(&self, size: u32, capacity: u32) -> Option<(usize, u32)> {
        let mut cursor = 0u32;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.start - cursor >= size {
                return Some((i, cursor));
            }
            cursor = entry.start + entry.len;
        }
        if capacity - cursor >= size {
            return Some((self.entries.len(), cursor));
        }
        None
    }

    /// Lowest bit index not held by a live entry.
    fn claim_bit(&self) -> Option<u32> {
        let mut used = 0u32;
        for e in &self.entries {
            used |= 1 << e.bit;
        }
        if used == u32::MAX {
            return None;
        }
        Some((!used).trailing_zeros())
    }
}

/// Producer-side arena: a shared segment, its allocation table, and growth
/// bookkeeping.
pub struct Arena {
    alloc: SlotAllocator,
    base: usize,
    committed: usize,
    max: usize,
}

impl Arena {
    /// Wrap a segment whose payload area begins `base` bytes in. The
    /// segment must already be mapped at least `max` bytes past `base`.
    pub fn new(alloc: SlotAllocator, base: usize, initial: usize, max: usize) -> Self {
        debug_assert!(base + max <= alloc.shm.len());
        debug_assert!(initial <= max && max <= ARENA_MAX_BYTES);
        Self {
            alloc,
            base,
            committed: initial,
            max,
        }
    }

    pub fn committed(&self) -> usize {
        self.committed
    }

    pub fn live(&self) -> usize {
        self.alloc.live()
    }

    /// Reserve `size` bytes, growing the committed area if needed.
    pub fn reserve(&mut self, size: usize) -> Option<Reservation> {
        if let Some(r) = self.alloc.alloc(size, self.committed) {
            return Some(r);
        }
        if self.committed >= self.max {
            return None;
        }

        // Double, but never less than what this payload needs and never
        // past the hard cap.
        let need = page_up(self.committed + align_up(size));
        self.committed = (self.committed * 2).max(need).min(self.max);
        tracing::debug!(committed = self.committed, "arena grown");

        self.alloc.alloc(size, self.committed)
    }

    /// Shrink a live reservation after the payload turned out smaller.
    pub fn set_len(&mut self, bit: u32, new_len: usize) {
        self.alloc.set_len(bit, new_len);
    }

    /// Exclusive view of a reservation's bytes.
    ///
    /// # Safety
    /// The reservation must be live and not yet published to the consumer.
    pub unsafe fn chunk_mut(&self, r: &Reservation) -> &mut [u8] {
        self.alloc
            .shm
            .bytes_mut(self.base + r.start as usize, r.len as usize)
    }
}

/// Consumer-side view: read a payload range, then release its bit.
pub struct ArenaReader {
    shm: Arc<SharedMemory>,
    base: usize,
    release_off: usize,
}

impl ArenaReader {
    pub fn new(shm: Arc<SharedMemory>, base: usize, release_off: usize) -> Self {
        Self {
            shm,
            base,
            release_off,
        }
    }

    /// View a published payload range.
    ///
    /// # Safety
    /// The range must come from an unreleased reservation published by the
    /// producer side.
    pub unsafe fn bytes(&self, start: u32, len: u32) -> &[u8] {
        self.shm.bytes(self.base + start as usize, len as usize)
    }

    /// Like [`ArenaReader::bytes`] but refuses ranges past the mapping,
    /// so a corrupt header cannot read out of bounds.
    ///
    /// # Safety
    /// Same ownership rule as [`ArenaReader::bytes`].
    pub unsafe fn read(&self, start: u32, len: u32) -> Option<&[u8]> {
        let begin = self.base.checked_add(start as usize)?;
        let end = begin.checked_add(len as usize)?;
        if end > self.shm.len() {
            return None;
        }
        Some(self.shm.bytes(begin, len as usize))
    }

    /// Hand the reservation back to the producer.
    pub fn release(&self, bit: u32) {
        self.shm
            .atomic_u32(self.release_off)
            .fetch_xor(1 << bit, Ordering::AcqRel);
    }
}

fn align_up(size: usize) -> usize {
    (size + ARENA_ALIGN - 1) & !(ARENA_ALIGN - 1)
}

fn page_up(size: usize) -> usize {
    (size + ARENA_PAGE_BYTES - 1) & !(ARENA_PAGE_BYTES - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: usize = 0;
    const RELEASE: usize = 64;

    fn segment(len: usize) -> Arc<SharedMemory> {
        Arc::new(SharedMemory::create("arena-test", len).unwrap())
    }

    fn allocator(shm: &Arc<SharedMemory>) -> SlotAllocator {
        SlotAllocator::new(shm.clone(), OWNER, RELEASE)
    }

    fn reader(shm: &Arc<SharedMemory>, base: usize) -> ArenaReader {
        ArenaReader::new(shm.clone(), base, RELEASE)
    }

    #[test]
    fn sizes_round_to_alignment() {
        let shm = segment(8192);
        let mut alloc = allocator(&shm);
        let r = alloc.alloc(1, 4096).unwrap();
        assert_eq!(r.len, 64);
        let r2 = alloc.alloc(65, 4096).unwrap();
        assert_eq!(r2.len, 128);
        assert_eq!(r2.start, 64);
    }

    #[test]
    fn first_fit_reuses_released_gap() {
        let shm = segment(8192);
        let mut alloc = allocator(&shm);

        let a = alloc.alloc(64, 4096).unwrap();
        let b = alloc.alloc(64, 4096).unwrap();
        let _c = alloc.alloc(64, 4096).unwrap();
        assert_eq!((a.start, b.start), (0, 64));

        // Consumer releases the middle entry; the 4th call sweeps and the
        // gap at 64 is handed out again.
        reader(&shm, 128).release(b.bit);
        let d = alloc.alloc(64, 4096).unwrap();
        assert_eq!(d.start, 64);
    }

    #[test]
    fn sweep_is_lazy_until_fourth_call() {
        let shm = segment(8192);
        let mut alloc = allocator(&shm);

        let a = alloc.alloc(64, 4096).unwrap();
        reader(&shm, 128).release(a.bit);

        // Calls 2 and 3 do not sweep, so the entry still counts as live
        // and the next fit lands after it.
        let b = alloc.alloc(64, 4096).unwrap();
        assert_eq!(b.start, 64);
        let c = alloc.alloc(64, 4096).unwrap();
        assert_eq!(c.start, 128);

        // Call 4 sweeps first; the released range at 0 comes back.
        let d = alloc.alloc(64, 4096).unwrap();
        assert_eq!(d.start, 0);
    }

    #[test]
    fn full_table_is_backpressure() {
        let shm = segment(1 << 20);
        let mut alloc = allocator(&shm);
        for _ in 0..SLOT_COUNT {
            assert!(alloc.alloc(64, 1 << 19).is_some());
        }
        assert_eq!(alloc.live(), SLOT_COUNT);
        assert!(alloc.alloc(64, 1 << 19).is_none());

        // Releasing one entry lets the next call through.
        reader(&shm, 128).release(0);
        assert!(alloc.alloc(64, 1 << 19).is_some());
    }

    #[test]
    fn no_gap_is_backpressure() {
        let shm = segment(8192);
        let mut alloc = allocator(&shm);
        assert!(alloc.alloc(64, 128).is_some());
        assert!(alloc.alloc(64, 128).is_some());
        assert!(alloc.alloc(64, 128).is_none());
    }

    #[test]
    fn set_len_shrinks_only() {
        let shm = segment(8192);
        let mut alloc = allocator(&shm);
        let r = alloc.alloc(256, 4096).unwrap();
        alloc.set_len(r.bit, 64);

        // The shrunk tail is immediately reusable.
        let next = alloc.alloc(64, 4096).unwrap();
        assert_eq!(next.start, 64);

        // Growing via set_len is ignored.
        alloc.set_len(r.bit, 512);
        let third = alloc.alloc(64, 4096).unwrap();
        assert_eq!(third.start, 128);
    }

    #[test]
    fn arena_grows_to_fit_then_caps() {
        let shm = segment(128 + 64 * 1024);
        let mut arena = Arena::new(allocator(&shm), 128, 4096, 64 * 1024);

        // Too big for the initial 4 KiB, fits after growth.
        let r = arena.reserve(8000).unwrap();
        assert_eq!(r.start, 0);
        assert!(arena.committed() >= 8064);
        assert!(arena.committed() <= 64 * 1024);

        // Nothing can ever exceed the cap.
        assert!(arena.reserve(128 * 1024).is_none());
    }

    #[test]
    fn reservation_bytes_round_trip() {
        let shm = segment(8192);
        let mut arena = Arena::new(allocator(&shm), 128, 4096, 4096);

        let r = arena.reserve(5).unwrap();
        unsafe {
            arena.chunk_mut(&r)[..5].copy_from_slice(b"hello");
            assert_eq!(reader(&shm, 128).bytes(r.start, 5), b"hello");
        }
    }
}
