// crates/framepipe-core/src/spsc.rs
//
// Bounded single-producer/single-consumer queue that recycles fixed-size
// byte slots instead of allocating per item.
//
// Two bounded control channels move slots between the endpoints:
//   working: producer to consumer, carries filled slots
//   pending: consumer to producer, carries drained slots
//
// A slot is an (index, buffer) pair. The buffer travels with the index, so
// at any moment each slot is owned by exactly one side: the producer's free
// list, the consumer's ready list, or in flight on one of the two channels.
// That ownership discipline is what makes the slot payload lock-free: the
// peer can never observe a buffer while the other side writes it.
//
// `put` copies the payload into a recycled slot and sends the slot on
// `working`; `get` copies the slot contents out into a fresh owned buffer
// and returns the slot on `pending`. Steady-state operation allocates only
// the `get`-side copy.

use std::collections::VecDeque;
use std::time::Duration;

use crossbeam_channel::{
    bounded, Receiver as ChannelReceiver, RecvTimeoutError, Sender as ChannelSender,
};

use crate::error::QueueError;

/// One fixed-size shared buffer plus its pool index.
///
/// The index exists so the free-list/in-flight bookkeeping is observable:
/// the full index multiset `{0..capacity}` must always be covered exactly
/// once across the two lists and the two channels.
struct Slot {
    index: usize,
    buf:   Box<[u8]>,
}

/// Create a slot queue with `capacity` slots of `item_size` bytes each and
/// return its two endpoints. All slots start on the producer's free list.
pub fn channel(capacity: usize, item_size: usize) -> (Producer, Consumer) {
    assert!(capacity >= 1, "slot queue needs at least one slot");
    assert!(item_size >= 1, "slot size must be non-zero");

    // Each channel is sized to hold every slot; sending a slot back can
    // therefore never block.
    let (working_tx, working_rx) = bounded(capacity);
    let (pending_tx, pending_rx) = bounded(capacity);

    let free = (0..capacity)
        .map(|index| Slot { index, buf: vec![0u8; item_size].into_boxed_slice() })
        .collect();

    let producer = Producer {
        capacity,
        item_size,
        free,
        working_tx,
        pending_rx,
    };
    let consumer = Consumer {
        capacity,
        item_size,
        ready: VecDeque::with_capacity(capacity),
        working_rx,
        pending_tx,
    };
    (producer, consumer)
}

// ── Producer ─────────────────────────────────────────────────────────────────

pub struct Producer {
    capacity:   usize,
    item_size:  usize,
    free:       VecDeque<Slot>,
    working_tx: ChannelSender<Slot>,
    pending_rx: ChannelReceiver<Slot>,
}

impl Producer {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Move every slot waiting on `pending` back onto the free list
    /// without blocking.
    pub fn reclaim(&mut self) {
        while let Ok(slot) = self.pending_rx.try_recv() {
            self.free.push_back(slot);
        }
    }

    /// True iff no slot is immediately available.
    pub fn is_full(&mut self) -> bool {
        self.reclaim();
        self.free.is_empty()
    }

    /// Write `data` into a recycled slot at `offset` and hand the slot to
    /// the consumer.
    ///
    /// `timeout` applies only when the free list is exhausted: `None`
    /// waits for the consumer indefinitely, `Some(0)` or an expired wait
    /// fails with [`QueueError::Full`]. An oversized payload fails with
    /// [`QueueError::SizeExceeded`] before any slot is taken.
    pub fn put(
        &mut self,
        data: &[u8],
        offset: usize,
        timeout: Option<Duration>,
    ) -> Result<(), QueueError> {
        if offset + data.len() > self.item_size {
            return Err(QueueError::SizeExceeded {
                offset,
                len: data.len(),
                item_size: self.item_size,
            });
        }

        self.reclaim();
        let slot = match self.free.pop_front() {
            Some(slot) => Some(slot),
            None => match timeout {
                None => Some(self.pending_rx.recv().map_err(|_| QueueError::Disconnected)?),
                Some(wait) if wait.is_zero() => None,
                Some(wait) => match self.pending_rx.recv_timeout(wait) {
                    Ok(slot) => Some(slot),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(QueueError::Disconnected)
                    }
                },
            },
        };
        let mut slot = slot.ok_or(QueueError::Full)?;

        slot.buf[offset..offset + data.len()].copy_from_slice(data);
        self.working_tx.send(slot).map_err(|_| QueueError::Disconnected)
    }

    /// As [`Producer::put`], but fails with [`QueueError::Full`] instead
    /// of waiting.
    pub fn put_nowait(&mut self, data: &[u8], offset: usize) -> Result<(), QueueError> {
        self.put(data, offset, Some(Duration::ZERO))
    }
}

// ── Consumer ─────────────────────────────────────────────────────────────────

pub struct Consumer {
    capacity:   usize,
    item_size:  usize,
    ready:      VecDeque<Slot>,
    working_rx: ChannelReceiver<Slot>,
    pending_tx: ChannelSender<Slot>,
}

impl Consumer {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Move every slot waiting on `working` onto the ready list without
    /// blocking.
    pub fn pull(&mut self) {
        while let Ok(slot) = self.working_rx.try_recv() {
            self.ready.push_back(slot);
        }
    }

    /// True iff no filled slot is immediately available.
    pub fn is_empty(&mut self) -> bool {
        self.pull();
        self.ready.is_empty()
    }

    /// Receive the oldest filled slot, copy its contents into an owned
    /// buffer, and recycle the slot.
    ///
    /// Timeout rules mirror [`Producer::put`]: `None` waits indefinitely,
    /// `Some(0)` or an expired wait fails with [`QueueError::Empty`].
    pub fn get(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, QueueError> {
        self.pull();
        let slot = match self.ready.pop_front() {
            Some(slot) => Some(slot),
            None => match timeout {
                None => Some(self.working_rx.recv().map_err(|_| QueueError::Disconnected)?),
                Some(wait) if wait.is_zero() => None,
                Some(wait) => match self.working_rx.recv_timeout(wait) {
                    Ok(slot) => Some(slot),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(QueueError::Disconnected)
                    }
                },
            },
        };
        let slot = slot.ok_or(QueueError::Empty)?;
        Ok(self.copy_and_recycle(slot))
    }

    /// As [`Consumer::get`], but fails with [`QueueError::Empty`] instead
    /// of waiting.
    pub fn get_nowait(&mut self) -> Result<Vec<u8>, QueueError> {
        self.get(Some(Duration::ZERO))
    }

    /// Drain everything currently ready, return the contents of the
    /// newest slot, and recycle all of them.
    ///
    /// This is the "drop older frames" primitive: a consumer that has
    /// fallen behind catches up to the live edge in one call, and every
    /// skipped slot goes straight back to the producer.
    pub fn get_latest_nowait(&mut self) -> Result<Vec<u8>, QueueError> {
        self.pull();
        let mut latest = self.ready.pop_front().ok_or(QueueError::Empty)?;
        while let Some(newer) = self.ready.pop_front() {
            let _ = self.pending_tx.send(latest);
            latest = newer;
        }
        Ok(self.copy_and_recycle(latest))
    }

    fn copy_and_recycle(&mut self, slot: Slot) -> Vec<u8> {
        let data = slot.buf.to_vec();
        // A failed recycle send means the producer is gone; the copy is
        // still valid, and the disconnect surfaces on the next wait.
        let _ = self.pending_tx.send(slot);
        data
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    const SHORT: Option<Duration> = Some(Duration::from_millis(20));

    /// Collect the producer-side free-list indices after reclaiming
    /// everything the consumer has returned.
    fn settled_indices(producer: &mut Producer) -> Vec<usize> {
        producer.reclaim();
        let mut indices: Vec<usize> = producer.free.iter().map(|s| s.index).collect();
        indices.sort_unstable();
        indices
    }

    #[test]
    fn put_get_round_trip() {
        let (mut tx, mut rx) = channel(4, 8);
        tx.put(b"framepip", 0, None).unwrap();
        assert_eq!(rx.get(None).unwrap(), b"framepip");
    }

    #[test]
    fn put_respects_offset() {
        let (mut tx, mut rx) = channel(1, 8);
        tx.put(b"\xAA\xBB", 3, None).unwrap();
        let data = rx.get(None).unwrap();
        assert_eq!(data.len(), 8);
        assert_eq!(&data[3..5], b"\xAA\xBB");
    }

    #[test]
    fn minimal_queue_still_round_trips() {
        let (mut tx, mut rx) = channel(1, 1);
        for byte in 0u8..16 {
            tx.put(&[byte], 0, None).unwrap();
            assert_eq!(rx.get(None).unwrap(), vec![byte]);
        }
        assert_eq!(settled_indices(&mut tx), vec![0]);
    }

    #[test]
    fn oversized_put_consumes_no_slot() {
        let (mut tx, mut rx) = channel(1, 4);
        let err = tx.put(&[0u8; 5], 0, None).unwrap_err();
        assert_eq!(
            err,
            QueueError::SizeExceeded { offset: 0, len: 5, item_size: 4 }
        );
        let err = tx.put(&[0u8; 4], 1, None).unwrap_err();
        assert!(matches!(err, QueueError::SizeExceeded { offset: 1, .. }));

        // The slot is still usable.
        tx.put(&[7u8; 4], 0, None).unwrap();
        assert_eq!(rx.get(None).unwrap(), vec![7u8; 4]);
    }

    #[test]
    fn full_and_empty_on_timeout() {
        let (mut tx, mut rx) = channel(2, 1);
        tx.put(b"a", 0, SHORT).unwrap();
        tx.put(b"b", 0, SHORT).unwrap();
        assert_eq!(tx.put_nowait(b"c", 0), Err(QueueError::Full));
        assert_eq!(tx.put(b"c", 0, SHORT), Err(QueueError::Full));

        assert_eq!(rx.get(SHORT).unwrap(), b"a");
        assert_eq!(rx.get(SHORT).unwrap(), b"b");
        assert_eq!(rx.get_nowait(), Err(QueueError::Empty));
        assert_eq!(rx.get(SHORT), Err(QueueError::Empty));

        // A drained slot unblocks the producer again.
        tx.put(b"c", 0, SHORT).unwrap();
        assert_eq!(rx.get(SHORT).unwrap(), b"c");
    }

    #[test]
    fn full_reports_after_nonblocking_drain() {
        let (mut tx, mut rx) = channel(1, 1);
        assert!(!tx.is_full());
        tx.put(b"x", 0, None).unwrap();
        assert!(tx.is_full());
        let _ = rx.get(None).unwrap();
        // The recycled slot is picked up by the drain inside is_full.
        assert!(!tx.is_full());
    }

    #[test]
    fn get_latest_skips_and_recycles() {
        let (mut tx, mut rx) = channel(4, 1);
        for byte in [1u8, 2, 3] {
            tx.put(&[byte], 0, None).unwrap();
        }
        assert_eq!(rx.get_latest_nowait().unwrap(), vec![3]);
        assert_eq!(rx.get_latest_nowait(), Err(QueueError::Empty));
        // All three slots went back to the producer, skipped ones included.
        assert_eq!(settled_indices(&mut tx), vec![0, 1, 2, 3]);
    }

    #[test]
    fn disconnected_consumer_fails_put() {
        let (mut tx, rx) = channel(2, 1);
        drop(rx);
        assert_eq!(tx.put(b"x", 0, None), Err(QueueError::Disconnected));
    }

    #[test]
    fn disconnected_producer_drains_then_fails_get() {
        let (mut tx, mut rx) = channel(2, 1);
        tx.put(b"x", 0, None).unwrap();
        drop(tx);
        // In-flight data is still delivered before the disconnect surfaces.
        assert_eq!(rx.get(None).unwrap(), b"x");
        assert_eq!(rx.get(SHORT), Err(QueueError::Disconnected));
    }

    #[test]
    fn index_multiset_is_preserved_under_churn() {
        let capacity = 8;
        let (mut tx, mut rx) = channel(capacity, 4);
        for round in 0u8..64 {
            tx.put(&[round; 4], 0, SHORT).unwrap();
            if round % 3 == 0 {
                let _ = rx.get(SHORT).unwrap();
            }
            if round % 7 == 0 {
                while rx.get_nowait().is_ok() {}
            }
        }
        while rx.get_nowait().is_ok() {}
        assert_eq!(settled_indices(&mut tx), (0..capacity).collect::<Vec<_>>());
    }

    #[test]
    fn saturation_across_threads_preserves_order_and_slots() {
        let (mut tx, mut rx) = channel(100, 4);

        let producer = thread::spawn(move || {
            for i in 0u8..100 {
                tx.put(&[i, i, i, i], 0, None).unwrap();
                if i % 10 == 9 {
                    thread::sleep(Duration::from_millis(10));
                }
            }
            tx
        });

        for i in 0u8..100 {
            assert_eq!(rx.get(Some(Duration::from_secs(5))).unwrap(), vec![i; 4]);
        }

        let mut tx = producer.join().unwrap();
        assert_eq!(settled_indices(&mut tx), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn blocking_get_wakes_on_put() {
        let (mut tx, mut rx) = channel(1, 1);
        let consumer = thread::spawn(move || rx.get(Some(Duration::from_secs(5))));
        thread::sleep(Duration::from_millis(30));
        tx.put(b"!", 0, None).unwrap();
        assert_eq!(consumer.join().unwrap().unwrap(), b"!");
    }

    #[test]
    fn empty_get_returns_within_timeout() {
        let (_tx, mut rx) = channel(1, 1);
        let start = Instant::now();
        assert_eq!(rx.get(Some(Duration::from_millis(50))), Err(QueueError::Empty));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
