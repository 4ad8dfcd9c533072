//! Bounded job queue between a network thread and its workers.
//!
//! The network thread pushes without ever blocking: a full queue hands the
//! job back and the caller answers 503. Workers block on a condition
//! variable while the queue is empty. Shutdown is a broadcast.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::handler::{Handler, HandlerResult};
use crate::http::{Request, Response};
use crate::runtime::queue::{ring_queue, Consumer, Producer};
use crate::runtime::ConnRef;

/// Request and response travelling together between threads.
#[derive(Debug, Default)]
pub struct Exchange {
    pub request: Request,
    pub response: Response,
}

/// Handler work offloaded to a worker.
pub struct Job {
    pub conn: ConnRef,
    pub exchange: Box<Exchange>,
    pub handler: Arc<dyn Handler>,
}

impl Job {
    /// Run the handler, producing the completion to send back.
    pub fn run(self) -> Completion {
        let mut exchange = self.exchange;
        let result = {
            let Exchange { request, response } = &mut *exchange;
            self.handler.handle(request, response)
        };
        Completion {
            conn: self.conn,
            exchange,
            result,
        }
    }
}

/// A finished job on its way back to the owning network thread.
pub struct Completion {
    pub conn: ConnRef,
    pub exchange: Box<Exchange>,
    pub result: HandlerResult,
}

struct Slots<T> {
    producer: Producer<T>,
    consumer: Consumer<T>,
}

/// Multi-consumer bounded queue: a ring queue behind a mutex and condvar.
pub struct JobQueue<T> {
    slots: Mutex<Slots<T>>,
    ready: Condvar,
    shutdown: AtomicBool,
    capacity: usize,
}

impl<T> JobQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (producer, consumer) = ring_queue(capacity);
        Self {
            slots: Mutex::new(Slots { producer, consumer }),
            ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        // A worker panicking inside a handler never holds this lock.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue `job` and wake one worker.
    ///
    /// Hands the job back if the queue is full or shutting down.
    pub fn push(&self, job: T) -> Result<(), T> {
        if self.is_shut_down() {
            return Err(job);
        }
        let pushed = self.lock().producer.push(job);
        if pushed.is_ok() {
            self.ready.notify_one();
        }
        pushed
    }

    /// Take the oldest job, waiting while the queue is empty.
    ///
    /// Returns `None` once shutdown is set and the queue is drained. Waits
    /// are bounded by `poll_interval` so shutdown is noticed even without a
    /// broadcast.
    pub fn pop_or_wait(&self, poll_interval: Duration) -> Option<T> {
        let mut slots = self.lock();
        loop {
            if let Some(job) = slots.consumer.pop() {
                return Some(job);
            }
            if self.is_shut_down() {
                return None;
            }
            slots = match self.ready.wait_timeout(slots, poll_interval) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        self.lock().consumer.pop()
    }

    /// Stop accepting jobs and wake every waiting worker.
    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _guard = self.lock();
        self.ready.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.lock().consumer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().consumer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_push_rejects_when_full() {
        let queue = JobQueue::new(2);
        assert!(queue.push(1).is_ok());
        assert!(queue.push(2).is_ok());
        assert_eq!(queue.push(3), Err(3));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.try_pop(), Some(1));
        assert!(queue.push(3).is_ok());
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_push_rejected_after_shutdown() {
        let queue = JobQueue::new(4);
        queue.push("before").unwrap();
        queue.shut_down();
        assert_eq!(queue.push("after"), Err("after"));

        // Queued work still drains.
        assert_eq!(queue.pop_or_wait(Duration::from_millis(10)), Some("before"));
        assert_eq!(queue.pop_or_wait(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_sixteen_accepted_four_rejected_each_run_once() {
        let queue = Arc::new(JobQueue::new(16));

        let mut rejected = Vec::new();
        for id in 0..20u32 {
            if let Err(id) = queue.push(id) {
                rejected.push(id);
            }
        }
        assert_eq!(rejected, vec![16, 17, 18, 19]);

        let (tx, rx) = mpsc::channel();
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let tx = tx.clone();
                thread::spawn(move || {
                    while let Some(id) = queue.pop_or_wait(Duration::from_millis(10)) {
                        tx.send(id).unwrap();
                    }
                })
            })
            .collect();
        drop(tx);

        // Let the workers drain, then release them.
        let mut seen = HashSet::new();
        for _ in 0..16 {
            let id = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(seen.insert(id), "job {id} processed twice");
        }
        queue.shut_down();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(seen, (0..16).collect::<HashSet<_>>());
    }

    #[test]
    fn test_waiting_worker_is_woken_by_push() {
        let queue = Arc::new(JobQueue::new(4));
        let worker = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_or_wait(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        queue.push(42).unwrap();
        assert_eq!(worker.join().unwrap(), Some(42));
    }
}
