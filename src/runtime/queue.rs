//! Bounded single-producer/single-consumer ring queue.
//!
//! A fixed-capacity circular buffer split into a [`Producer`] and a
//! [`Consumer`] endpoint. Each endpoint is `Send` but not `Clone`, so at
//! most one thread pushes and at most one thread pops at any instant; the
//! cursors are published with release stores and observed with acquire
//! loads, so no lock is needed between the two sides.
//!
//! The job queue wraps both endpoints in a mutex anyway, because several
//! worker threads share one consumer and the condition variable needs the
//! same lock to avoid lost wakeups.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Ring<T> {
    /// One slot more than the usable capacity: `head == tail` means empty,
    /// `tail + 1 == head` (mod slots) means full.
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Next slot to pop. Written only by the consumer.
    head: AtomicUsize,
    /// Next slot to push. Written only by the producer.
    tail: AtomicUsize,
}

// SAFETY: a slot is only ever accessed by the producer (between observing it
// free and publishing `tail`) or by the consumer (between observing it
// filled and publishing `head`), never by both at once.
unsafe impl<T: Send> Sync for Ring<T> {}
unsafe impl<T: Send> Send for Ring<T> {}

impl<T> Ring<T> {
    fn next(&self, idx: usize) -> usize {
        (idx + 1) % self.slots.len()
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if tail >= head {
            tail - head
        } else {
            tail + self.slots.len() - head
        }
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let mut head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        while head != tail {
            // SAFETY: slots in [head, tail) hold initialised values that
            // were never popped.
            unsafe { self.slots[head].get_mut().assume_init_drop() };
            head = (head + 1) % self.slots.len();
        }
    }
}

/// Create a queue holding at most `capacity` items.
///
/// # Panics
/// Panics if `capacity` is zero.
pub fn ring_queue<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity > 0, "ring queue capacity must be positive");
    let slots = (0..capacity + 1)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let ring = Arc::new(Ring {
        slots,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });
    (
        Producer {
            ring: Arc::clone(&ring),
        },
        Consumer { ring },
    )
}

/// Push endpoint of a ring queue.
pub struct Producer<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Producer<T> {
    /// Push an item.
    ///
    /// Returns the item back if the queue is full; the queue is left
    /// unchanged in that case.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        let ring = &*self.ring;
        let tail = ring.tail.load(Ordering::Relaxed);
        let next = ring.next(tail);
        if next == ring.head.load(Ordering::Acquire) {
            return Err(item);
        }
        // SAFETY: the slot at `tail` is free (the consumer has moved past it)
        // and only this producer writes there.
        unsafe { (*ring.slots[tail].get()).write(item) };
        ring.tail.store(next, Ordering::Release);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        let ring = &*self.ring;
        ring.next(ring.tail.load(Ordering::Relaxed)) == ring.head.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn capacity(&self) -> usize {
        self.ring.slots.len() - 1
    }
}

/// Pop endpoint of a ring queue.
pub struct Consumer<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Consumer<T> {
    /// Pop the oldest item, or `None` if the queue is empty.
    pub fn pop(&mut self) -> Option<T> {
        let ring = &*self.ring;
        let head = ring.head.load(Ordering::Relaxed);
        if head == ring.tail.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: the producer published this slot with a release store on
        // `tail`, and only this consumer reads it before advancing `head`.
        let item = unsafe { (*ring.slots[head].get()).assume_init_read() };
        ring.head.store(ring.next(head), Ordering::Release);
        Some(item)
    }

    pub fn is_empty(&self) -> bool {
        let ring = &*self.ring;
        ring.head.load(Ordering::Relaxed) == ring.tail.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_push_pop_fifo() {
        let (mut tx, mut rx) = ring_queue(4);
        assert!(rx.is_empty());
        assert_eq!(tx.capacity(), 4);

        for i in 0..4 {
            tx.push(i).unwrap();
        }
        assert!(tx.is_full());
        assert_eq!(rx.len(), 4);

        for i in 0..4 {
            assert_eq!(rx.pop(), Some(i));
        }
        assert!(rx.is_empty());
    }

    #[test]
    fn test_push_full_leaves_queue_unchanged() {
        let (mut tx, mut rx) = ring_queue(2);
        tx.push("a").unwrap();
        tx.push("b").unwrap();

        assert_eq!(tx.push("c"), Err("c"));
        assert_eq!(tx.len(), 2);

        assert_eq!(rx.pop(), Some("a"));
        assert_eq!(rx.pop(), Some("b"));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_pop_empty_leaves_queue_unchanged() {
        let (mut tx, mut rx) = ring_queue::<u32>(3);
        assert_eq!(rx.pop(), None);
        assert_eq!(rx.len(), 0);

        tx.push(7).unwrap();
        assert_eq!(rx.pop(), Some(7));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_wraparound() {
        let (mut tx, mut rx) = ring_queue(3);
        for round in 0..10 {
            tx.push(round * 2).unwrap();
            tx.push(round * 2 + 1).unwrap();
            assert_eq!(rx.pop(), Some(round * 2));
            assert_eq!(rx.pop(), Some(round * 2 + 1));
        }
        assert!(rx.is_empty());
    }

    #[test]
    fn test_drop_releases_pending_items() {
        let marker = Arc::new(());
        {
            let (mut tx, _rx) = ring_queue(4);
            tx.push(Arc::clone(&marker)).unwrap();
            tx.push(Arc::clone(&marker)).unwrap();
            assert_eq!(Arc::strong_count(&marker), 3);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_spsc_threads_preserve_order() {
        const COUNT: u64 = 100_000;
        let (mut tx, mut rx) = ring_queue(16);

        let producer = thread::spawn(move || {
            for i in 0..COUNT {
                let mut item = i;
                loop {
                    match tx.push(item) {
                        Ok(()) => break,
                        Err(back) => {
                            item = back;
                            thread::yield_now();
                        }
                    }
                }
            }
        });

        let mut expected = 0;
        while expected < COUNT {
            match rx.pop() {
                Some(v) => {
                    assert_eq!(v, expected);
                    expected += 1;
                }
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert!(rx.is_empty());
    }
}
