//! Worker threads running offloaded handlers.

use std::io;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::Waker;
use tracing::{debug, warn};

use crate::runtime::jobs::{Completion, Job, JobQueue};

/// Upper bound on one idle wait, so a missed broadcast cannot strand a
/// worker during shutdown.
const IDLE_WAIT: Duration = Duration::from_millis(250);

/// Spawn `count` workers serving `queue` for network thread `net_id`.
pub fn spawn_workers(
    net_id: usize,
    count: usize,
    queue: &Arc<JobQueue<Job>>,
    completions: &Sender<Completion>,
    waker: &Arc<Waker>,
) -> io::Result<Vec<JoinHandle<()>>> {
    (0..count)
        .map(|worker_id| {
            let queue = Arc::clone(queue);
            let completions = completions.clone();
            let waker = Arc::clone(waker);
            thread::Builder::new()
                .name(format!("worker-{net_id}-{worker_id}"))
                .spawn(move || worker_loop(&queue, &completions, &waker))
        })
        .collect()
}

fn worker_loop(queue: &JobQueue<Job>, completions: &Sender<Completion>, waker: &Waker) {
    debug!("Worker started");
    while let Some(job) = queue.pop_or_wait(IDLE_WAIT) {
        let completion = job.run();
        if completions.send(completion).is_err() {
            // The network thread is gone; nobody is left to answer.
            break;
        }
        if let Err(e) = waker.wake() {
            warn!(error = %e, "Failed to wake network thread");
        }
    }
    debug!("Worker exiting");
}
