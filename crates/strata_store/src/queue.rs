//! Multi-producer dispatch ring with fan-out consumers.
//!
//! One publisher sequence is shared by every I/O worker; each writer thread
//! owns a consumer cursor and observes every event in publish order. The
//! publisher gates on the slowest consumer, so a stalled writer exerts
//! backpressure all the way to the network.
//!
//! Slot hand-off protocol:
//! - a producer CAS-claims the next sequence, writes the slot, then stamps
//!   it published (release store);
//! - a consumer may read slot `n` only after observing the stamp for `n`
//!   (acquire load), and releases it by advancing its cursor;
//! - slot `n` is reused for `n + capacity` only after every cursor has
//!   passed `n`.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::event::MeasurementEvent;

/// Outcome of claiming a publisher slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PubNext {
    Slot(u64),
    /// Lost the claim race; retry immediately.
    Contended,
    /// The ring is full; the caller decides whether to spin or back off.
    Full,
}

/// Outcome of polling a consumer cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubNext {
    Slot(u64),
    Empty,
}

/// A single writer thread's position in the queue.
#[derive(Debug)]
pub struct ConsumerCursor {
    value: AtomicI64,
}

impl ConsumerCursor {
    fn new() -> Self {
        Self {
            value: AtomicI64::new(-1),
        }
    }
}

pub struct DispatchQueue {
    slots: Box<[UnsafeCell<MeasurementEvent>]>,
    /// Per-slot stamp of the last published sequence; -1 means never used.
    published: Box<[AtomicI64]>,
    /// Highest claimed publisher sequence.
    claim: AtomicI64,
    cursors: Vec<Arc<ConsumerCursor>>,
    mask: i64,
}

// Slots are handed between threads by the sequence protocol above; the
// UnsafeCell access is confined to whoever holds the cursor for that slot.
unsafe impl Send for DispatchQueue {}
unsafe impl Sync for DispatchQueue {}

impl DispatchQueue {
    /// Build a queue with `capacity` slots (rounded up to a power of two),
    /// event buffers of `buf_capacity` bytes, and one consumer cursor per
    /// writer thread.
    pub fn new(capacity: usize, buf_capacity: usize, n_writers: usize) -> Arc<Self> {
        let capacity = capacity.max(2).next_power_of_two();
        let slots: Vec<UnsafeCell<MeasurementEvent>> = (0..capacity)
            .map(|_| UnsafeCell::new(MeasurementEvent::new(buf_capacity)))
            .collect();
        let published: Vec<AtomicI64> = (0..capacity).map(|_| AtomicI64::new(-1)).collect();
        let cursors = (0..n_writers.max(1))
            .map(|_| Arc::new(ConsumerCursor::new()))
            .collect();
        Arc::new(Self {
            slots: slots.into_boxed_slice(),
            published: published.into_boxed_slice(),
            claim: AtomicI64::new(-1),
            cursors,
            mask: capacity as i64 - 1,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn consumer(&self, writer_id: usize) -> Arc<ConsumerCursor> {
        Arc::clone(&self.cursors[writer_id])
    }

    fn min_consumed(&self) -> i64 {
        self.cursors
            .iter()
            .map(|c| c.value.load(Ordering::Acquire))
            .min()
            .unwrap_or(-1)
    }

    /// Claim the next publisher slot.
    pub fn next_pub(&self) -> PubNext {
        let current = self.claim.load(Ordering::Acquire);
        let next = current + 1;
        if next - self.capacity() as i64 > self.min_consumed() {
            return PubNext::Full;
        }
        match self
            .claim
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => PubNext::Slot(next as u64),
            Err(_) => PubNext::Contended,
        }
    }

    /// Make a claimed slot visible to consumers. The slot kind must no
    /// longer be `Incomplete` by this point.
    pub fn publish(&self, seq: u64) {
        self.published[(seq as i64 & self.mask) as usize].store(seq as i64, Ordering::Release);
    }

    /// Next unconsumed slot for this cursor, if published.
    pub fn next_sub(&self, cursor: &ConsumerCursor) -> SubNext {
        let next = cursor.value.load(Ordering::Relaxed) + 1;
        if self.published[(next & self.mask) as usize].load(Ordering::Acquire) == next {
            SubNext::Slot(next as u64)
        } else {
            SubNext::Empty
        }
    }

    /// Release a consumed slot. Withholding this (and returning from the
    /// drain loop instead) makes the same slot come back on the next poll,
    /// which is what the rebalance handshake relies on.
    pub fn done_sub(&self, cursor: &ConsumerCursor, seq: u64) {
        cursor.value.store(seq as i64, Ordering::Release);
    }

    /// Shared view of a published slot.
    pub fn event(&self, seq: u64) -> &MeasurementEvent {
        unsafe { &*self.slots[(seq as i64 & self.mask) as usize].get() }
    }

    /// Exclusive view of a claimed slot.
    ///
    /// # Safety
    /// The caller must hold the publisher claim for `seq` and must not have
    /// published it yet; no consumer can observe the slot before then.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn event_mut(&self, seq: u64) -> &mut MeasurementEvent {
        &mut *self.slots[(seq as i64 & self.mask) as usize].get()
    }
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("capacity", &self.capacity())
            .field("consumers", &self.cursors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    fn publish_row(queue: &DispatchQueue, writer_thread_id: i32, payload: i64) -> PubNext {
        match queue.next_pub() {
            PubNext::Slot(seq) => {
                let event = unsafe { queue.event_mut(seq) };
                event.kind = EventKind::Row { writer_thread_id };
                event.buf.clear();
                event.buf.extend_from_slice(&payload.to_le_bytes());
                queue.publish(seq);
                PubNext::Slot(seq)
            }
            other => other,
        }
    }

    fn drain(queue: &DispatchQueue, cursor: &ConsumerCursor) -> Vec<i64> {
        let mut out = Vec::new();
        while let SubNext::Slot(seq) = queue.next_sub(cursor) {
            let event = queue.event(seq);
            out.push(i64::from_le_bytes(event.buf()[..8].try_into().unwrap()));
            queue.done_sub(cursor, seq);
        }
        out
    }

    #[test]
    fn delivers_in_publish_order() {
        let queue = DispatchQueue::new(8, 64, 1);
        let cursor = queue.consumer(0);
        for i in 0..5 {
            assert!(matches!(publish_row(&queue, 0, i), PubNext::Slot(_)));
        }
        assert_eq!(drain(&queue, &cursor), vec![0, 1, 2, 3, 4]);
        assert_eq!(drain(&queue, &cursor), Vec::<i64>::new());
    }

    #[test]
    fn reports_full_until_consumers_advance() {
        let queue = DispatchQueue::new(4, 64, 1);
        let cursor = queue.consumer(0);
        for i in 0..4 {
            assert!(matches!(publish_row(&queue, 0, i), PubNext::Slot(_)));
        }
        assert_eq!(publish_row(&queue, 0, 99), PubNext::Full);

        // Consuming one slot frees exactly one publish.
        assert!(matches!(queue.next_sub(&cursor), SubNext::Slot(0)));
        queue.done_sub(&cursor, 0);
        assert!(matches!(publish_row(&queue, 0, 4), PubNext::Slot(_)));
        assert_eq!(publish_row(&queue, 0, 100), PubNext::Full);
    }

    #[test]
    fn fan_out_shows_every_event_to_every_cursor() {
        let queue = DispatchQueue::new(8, 64, 2);
        let a = queue.consumer(0);
        let b = queue.consumer(1);
        for i in 0..6 {
            assert!(matches!(publish_row(&queue, (i % 2) as i32, i), PubNext::Slot(_)));
        }
        assert_eq!(drain(&queue, &a), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(drain(&queue, &b), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn slowest_cursor_gates_the_publisher() {
        let queue = DispatchQueue::new(4, 64, 2);
        let a = queue.consumer(0);
        let _b = queue.consumer(1);
        for i in 0..4 {
            assert!(matches!(publish_row(&queue, 0, i), PubNext::Slot(_)));
        }
        // Fast consumer drains fully, slow one does not move.
        assert_eq!(drain(&queue, &a), vec![0, 1, 2, 3]);
        assert_eq!(publish_row(&queue, 0, 9), PubNext::Full);
    }

    #[test]
    fn concurrent_producers_keep_a_total_order() {
        let queue = DispatchQueue::new(64, 64, 1);
        let cursor = queue.consumer(0);
        let mut seen = Vec::new();
        std::thread::scope(|scope| {
            for t in 0..4 {
                let queue = &queue;
                scope.spawn(move || {
                    for i in 0..100 {
                        loop {
                            match publish_row(queue, 0, (t * 1_000 + i) as i64) {
                                PubNext::Slot(_) => break,
                                PubNext::Contended | PubNext::Full => std::hint::spin_loop(),
                            }
                        }
                    }
                });
            }
            let queue = &queue;
            scope.spawn(|| {
                while seen.len() < 400 {
                    match queue.next_sub(&cursor) {
                        SubNext::Slot(seq) => {
                            let event = queue.event(seq);
                            seen.push(i64::from_le_bytes(event.buf()[..8].try_into().unwrap()));
                            queue.done_sub(&cursor, seq);
                        }
                        SubNext::Empty => std::hint::spin_loop(),
                    }
                }
            });
        });
        // Every payload arrives exactly once and per-producer order holds.
        assert_eq!(seen.len(), 400);
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 400);
        for t in 0..4i64 {
            let per: Vec<i64> = seen
                .iter()
                .copied()
                .filter(|v| v / 1_000 == t)
                .collect();
            let mut expected = per.clone();
            expected.sort_unstable();
            assert_eq!(per, expected);
        }
    }
}
