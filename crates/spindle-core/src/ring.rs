//! The header ring: 32 fixed slots handed off through a pair of bitset
//! words.
//!
//! Bit `i` of `producer ^ consumer` means slot `i` is published and unread.
//! The producer writes a slot's words while the bits match, then flips its
//! bit with release ordering; the consumer reads after an acquire load and
//! flips its own bit back when the slot's bytes are no longer needed. No
//! word is ever written by both sides, so the ring needs no CAS loops.
//!
//! Each direction of a lane has one ring; the producer role never migrates
//! across threads without external serialization.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::layout::{
    TaskHeader, HEADER_WORDS, SLOT_COUNT, SLOT_STRIDE_WORDS, STATIC_PAYLOAD_BYTES,
};
use crate::shm::SharedMemory;

/// How many consumed slots accumulate before the consumer publishes its
/// bit flips mid-drain.
const FLIP_BATCH: u32 = 8;

/// Producer half of a header ring.
pub struct RingProducer {
    shm: Arc<SharedMemory>,
    base: usize,
    producer_off: usize,
    consumer_off: usize,
}

impl RingProducer {
    pub fn new(
        shm: Arc<SharedMemory>,
        base: usize,
        producer_off: usize,
        consumer_off: usize,
    ) -> Self {
        debug_assert!(base + SLOT_COUNT * SLOT_STRIDE_WORDS * 4 <= shm.len());
        Self {
            shm,
            base,
            producer_off,
            consumer_off,
        }
    }

    fn producer(&self) -> &AtomicU32 {
        self.shm.atomic_u32(self.producer_off)
    }

    fn consumer(&self) -> &AtomicU32 {
        self.shm.atomic_u32(self.consumer_off)
    }

    /// Bitmask of slots currently free for publishing.
    pub fn free_mask(&self) -> u32 {
        let p = self.producer().load(Ordering::Relaxed);
        let c = self.consumer().load(Ordering::Acquire);
        !(p ^ c)
    }

    pub fn free_slots(&self) -> u32 {
        self.free_mask().count_ones()
    }

    /// Publish one header (plus up to 512 static payload bytes) into the
    /// lowest free slot. Returns the slot index, or `None` when all 32
    /// slots are unread — backpressure, not an error.
    pub fn publish(&mut self, header: &TaskHeader, static_bytes: &[u8]) -> Option<u32> {
        debug_assert!(static_bytes.len() <= STATIC_PAYLOAD_BYTES);
        let free = self.free_mask();
        if free == 0 {
            return None;
        }
        let slot = free.trailing_zeros();
        let offset = self.base + slot as usize * SLOT_STRIDE_WORDS * 4;

        let words = header.to_words();
        for (i, w) in words.iter().enumerate() {
            self.shm
                .atomic_u32(offset + i * 4)
                .store(*w, Ordering::Relaxed);
        }
        if !static_bytes.is_empty() {
            // Safety: the slot is free, so this side owns its bytes until
            // the producer bit flips below.
            unsafe {
                self.shm
                    .bytes_mut(offset + HEADER_WORDS * 4, static_bytes.len())
                    .copy_from_slice(static_bytes);
            }
        }

        self.producer().fetch_xor(1 << slot, Ordering::Release);
        Some(slot)
    }
}

/// Consumer half of a header ring.
pub struct RingConsumer {
    shm: Arc<SharedMemory>,
    base: usize,
    producer_off: usize,
    consumer_off: usize,
    /// Index of the last slot taken, for rotation fairness: each drain
    /// starts scanning just past it so low slot numbers are not favored.
    last_take: u32,
}

impl RingConsumer {
    pub fn new(
        shm: Arc<SharedMemory>,
        base: usize,
        producer_off: usize,
        consumer_off: usize,
    ) -> Self {
        Self {
            shm,
            base,
            producer_off,
            consumer_off,
            last_take: SLOT_COUNT as u32 - 1,
        }
    }

    fn producer(&self) -> &AtomicU32 {
        self.shm.atomic_u32(self.producer_off)
    }

    fn consumer(&self) -> &AtomicU32 {
        self.shm.atomic_u32(self.consumer_off)
    }

    /// Bitmask of published, unread slots.
    pub fn unread_mask(&self) -> u32 {
        let p = self.producer().load(Ordering::Acquire);
        let c = self.consumer().load(Ordering::Relaxed);
        p ^ c
    }

    pub fn has_unread(&self) -> bool {
        self.unread_mask() != 0
    }

    /// Drain up to `max` unread slots, invoking `take` with each slot's
    /// header and static payload area. The slot is released (its bytes may
    /// be overwritten) once `take` returns; callers copy what they keep.
    ///
    /// Release flips are batched every [`FLIP_BATCH`] slots so the producer
    /// sees capacity return before a long drain completes.
    pub fn drain(&mut self, max: usize, mut take: impl FnMut(u32, TaskHeader, &[u8])) -> usize {
        let unread = self.unread_mask();
        if unread == 0 {
            return 0;
        }

        let mut taken = 0usize;
        let mut flips = 0u32;
        let start = (self.last_take + 1) % SLOT_COUNT as u32;

        for step in 0..SLOT_COUNT as u32 {
            if taken == max {
                break;
            }
            let slot = (start + step) % SLOT_COUNT as u32;
            if unread & (1 << slot) == 0 {
                continue;
            }

            let offset = self.base + slot as usize * SLOT_STRIDE_WORDS * 4;
            let mut words = [0u32; HEADER_WORDS];
            for (i, w) in words.iter_mut().enumerate() {
                *w = self.shm.atomic_u32(offset + i * 4).load(Ordering::Relaxed);
            }
            let header = TaskHeader::from_words(&words);
            // Safety: the producer bit is flipped and ours is not, so this
            // side owns the slot bytes until the flip below.
            let static_area =
                unsafe { self.shm.bytes(offset + HEADER_WORDS * 4, STATIC_PAYLOAD_BYTES) };

            take(slot, header, static_area);

            flips |= 1 << slot;
            taken += 1;
            self.last_take = slot;
            if taken as u32 % FLIP_BATCH == 0 {
                self.consumer().fetch_xor(flips, Ordering::Release);
                flips = 0;
            }
        }

        if flips != 0 {
            self.consumer().fetch_xor(flips, Ordering::Release);
        }
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::HEADER_SEGMENT_BYTES;

    const PRODUCER_OFF: usize = HEADER_SEGMENT_BYTES;
    const CONSUMER_OFF: usize = HEADER_SEGMENT_BYTES + 64;

    struct Harness {
        shm: Arc<SharedMemory>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                shm: Arc::new(
                    SharedMemory::create("ring-test", HEADER_SEGMENT_BYTES + 128).unwrap(),
                ),
            }
        }

        fn producer(&self) -> RingProducer {
            RingProducer::new(self.shm.clone(), 0, PRODUCER_OFF, CONSUMER_OFF)
        }

        fn consumer(&self) -> RingConsumer {
            RingConsumer::new(self.shm.clone(), 0, PRODUCER_OFF, CONSUMER_OFF)
        }

        fn bits(&self) -> (u32, u32) {
            (
                self.shm.atomic_u32(PRODUCER_OFF).load(Ordering::Relaxed),
                self.shm.atomic_u32(CONSUMER_OFF).load(Ordering::Relaxed),
            )
        }
    }

    fn header(id: u32) -> TaskHeader {
        TaskHeader {
            id,
            fn_id: 1,
            tag: 8,
            ..Default::default()
        }
    }

    #[test]
    fn publish_then_drain_one() {
        let h = Harness::new();
        let slot = h.producer().publish(&header(42), b"payload").unwrap();
        assert_eq!(slot, 0);

        let mut cons = h.consumer();
        let mut seen = Vec::new();
        let n = cons.drain(usize::MAX, |slot, hdr, area| {
            seen.push((slot, hdr.id, area[..7].to_vec()));
        });
        assert_eq!(n, 1);
        assert_eq!(seen, vec![(0, 42, b"payload".to_vec())]);
        assert!(!cons.has_unread());
    }

    #[test]
    fn thirty_third_publish_is_backpressure() {
        let h = Harness::new();
        let mut prod = h.producer();
        for i in 0..SLOT_COUNT as u32 {
            assert_eq!(prod.publish(&header(i), &[]), Some(i));
        }
        assert_eq!(prod.free_slots(), 0);
        assert_eq!(prod.publish(&header(99), &[]), None);

        // Draining one slot restores exactly one unit of capacity.
        let mut cons = h.consumer();
        assert_eq!(cons.drain(1, |_, _, _| {}), 1);
        assert_eq!(prod.free_slots(), 1);
        assert!(prod.publish(&header(99), &[]).is_some());
    }

    #[test]
    fn drain_rotates_start_slot() {
        let h = Harness::new();
        let mut prod = h.producer();
        prod.publish(&header(0), &[]).unwrap();
        prod.publish(&header(1), &[]).unwrap();

        let mut cons = h.consumer();
        let mut order = Vec::new();
        cons.drain(1, |slot, _, _| order.push(slot));
        assert_eq!(order, vec![0]);

        // Refill slot 0; the next drain starts past the last take, so the
        // older slot 1 goes first.
        prod.publish(&header(2), &[]).unwrap();
        cons.drain(usize::MAX, |slot, _, _| order.push(slot));
        assert_eq!(order, vec![0, 1, 0]);
    }

    #[test]
    fn drain_respects_max() {
        let h = Harness::new();
        let mut prod = h.producer();
        for i in 0..10 {
            prod.publish(&header(i), &[]).unwrap();
        }
        let mut cons = h.consumer();
        assert_eq!(cons.drain(3, |_, _, _| {}), 3);
        assert_eq!(cons.unread_mask().count_ones(), 7);
    }

    #[test]
    fn bits_reconverge_after_full_cycle() {
        let h = Harness::new();
        let mut prod = h.producer();
        let mut cons = h.consumer();
        for round in 0..3 {
            for i in 0..SLOT_COUNT as u32 {
                prod.publish(&header(round * 100 + i), &[]).unwrap();
            }
            assert_eq!(cons.drain(usize::MAX, |_, _, _| {}), SLOT_COUNT);
        }
        let (p, c) = h.bits();
        assert_eq!(p, c);
    }

    #[test]
    fn headers_cross_intact() {
        let h = Harness::new();
        let mut sent = header(7);
        sent.set_raw64(f64::to_bits(2.5));
        sent.len = 0;
        sent.tag = 0;
        h.producer().publish(&sent, &[]).unwrap();

        let mut got = None;
        h.consumer().drain(1, |_, hdr, _| got = Some(hdr));
        assert_eq!(got.unwrap(), sent);
    }
}
