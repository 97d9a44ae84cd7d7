//! Bounded background work queue.
//!
//! Jobs are fire-and-forget closures run by a pool of named threads fed from
//! a `crossbeam-channel` queue. At most `capacity` jobs may be in flight
//! (queued or running); beyond that [`WorkQueue::try_queue`] refuses.
//!
//! A pool size of zero is *manual* mode: nothing runs until a caller invokes
//! [`WorkQueue::flush`], which then runs every queued job on its own thread.
//!
//! Panics inside a job are caught and logged; they never take down a pool
//! thread or reach the submitter.

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, unbounded};
use parking_lot::{Condvar, Mutex};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, error, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Shutdown,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("work queue is full")]
    Full,
    #[error("work queue has been stopped")]
    Stopped,
}

#[derive(Debug, Default)]
struct Inflight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Inflight {
    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

pub struct WorkQueue {
    name: String,
    tx: Sender<Message>,
    rx: Receiver<Message>,
    capacity: usize,
    pool_size: usize,
    inflight: Arc<Inflight>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("pending", &self.pending())
            .field("pool_size", &self.pool_size)
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl WorkQueue {
    /// Start a queue with `pool_size` threads named `{name}-{i}`.
    pub fn new(name: &str, pool_size: usize, capacity: usize) -> std::io::Result<Self> {
        let (tx, rx) = unbounded::<Message>();
        let inflight = Arc::new(Inflight::default());
        let mut threads = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            let rx = rx.clone();
            let inflight = Arc::clone(&inflight);
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || run_pool_thread(&rx, &inflight))?;
            threads.push(handle);
        }
        debug!(queue = name, pool_size, capacity, "work queue: started");
        Ok(Self {
            name: name.to_owned(),
            tx,
            rx,
            capacity: capacity.max(1),
            pool_size,
            inflight,
            threads: Mutex::new(threads),
            stopped: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_manual(&self) -> bool {
        self.pool_size == 0
    }

    /// Jobs queued or running.
    #[must_use]
    pub fn pending(&self) -> usize {
        *self.inflight.count.lock()
    }

    /// Queue `job` unless the queue is full or stopped.
    pub fn try_queue(&self, job: impl FnOnce() + Send + 'static) -> Result<(), QueueError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(QueueError::Stopped);
        }
        {
            let mut count = self.inflight.count.lock();
            if *count >= self.capacity {
                return Err(QueueError::Full);
            }
            *count += 1;
        }
        match self.tx.try_send(Message::Run(Box::new(job))) {
            Ok(()) => {
                trace!(queue = %self.name, "work queue: job queued");
                Ok(())
            }
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.inflight.done();
                Err(QueueError::Stopped)
            }
        }
    }

    /// Wait until every job queued so far has finished.
    ///
    /// In manual mode the jobs are run here, including jobs they queue.
    pub fn flush(&self) {
        if self.is_manual() {
            loop {
                match self.rx.try_recv() {
                    Ok(Message::Run(job)) => run_job(job, &self.inflight),
                    Ok(Message::Shutdown) => {}
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                }
            }
            return;
        }
        let mut count = self.inflight.count.lock();
        while *count > 0 {
            self.inflight.idle.wait(&mut count);
        }
    }

    /// Refuse new jobs, let pool threads finish what is queued, and join them.
    ///
    /// In manual mode queued jobs are dropped without running. A pool thread
    /// calling this does not wait for itself.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        for _ in &threads {
            let _ = self.tx.send(Message::Shutdown);
        }
        let me = std::thread::current().id();
        for handle in threads {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                error!(queue = %self.name, "work queue: pool thread panicked");
            }
        }
        let mut dropped = 0_usize;
        while let Ok(message) = self.rx.try_recv() {
            if let Message::Run(job) = message {
                drop(job);
                self.inflight.done();
                dropped += 1;
            }
        }
        debug!(queue = %self.name, dropped, "work queue: stopped");
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        for _ in self.threads.get_mut().iter() {
            let _ = self.tx.send(Message::Shutdown);
        }
    }
}

fn run_pool_thread(rx: &Receiver<Message>, inflight: &Inflight) {
    while let Ok(message) = rx.recv() {
        match message {
            Message::Run(job) => run_job(job, inflight),
            Message::Shutdown => break,
        }
    }
}

fn run_job(job: Job, inflight: &Inflight) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("work queue: job panicked");
    }
    inflight.done();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn manual_mode_runs_on_flush() {
        let queue = WorkQueue::new("test-manual", 0, 8).expect("queue");
        assert!(queue.is_manual());
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            queue
                .try_queue(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .expect("queue");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending(), 3);
        queue.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn capacity_bounds_inflight_jobs() {
        let queue = WorkQueue::new("test-full", 0, 2).expect("queue");
        queue.try_queue(|| {}).expect("first");
        queue.try_queue(|| {}).expect("second");
        assert_eq!(queue.try_queue(|| {}), Err(QueueError::Full));
        queue.flush();
        queue.try_queue(|| {}).expect("room again");
    }

    #[test]
    fn stopped_queue_refuses_jobs() {
        let queue = WorkQueue::new("test-stop", 1, 4).expect("queue");
        queue.shutdown();
        assert_eq!(queue.try_queue(|| {}), Err(QueueError::Stopped));
    }

    #[test]
    fn manual_shutdown_drops_unrun_jobs() {
        let queue = WorkQueue::new("test-drop", 0, 4).expect("queue");
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&hits);
        queue
            .try_queue(move || {
                counted.fetch_add(1, Ordering::SeqCst);
            })
            .expect("queue");
        queue.shutdown();
        assert_eq!(queue.pending(), 0);
        queue.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pool_threads_run_jobs_and_survive_panics() {
        let queue = WorkQueue::new("test-pool", 2, 16).expect("queue");
        let hits = Arc::new(AtomicUsize::new(0));
        queue.try_queue(|| panic!("job failure")).expect("panicking job");
        for _ in 0..8 {
            let hits = Arc::clone(&hits);
            queue
                .try_queue(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .expect("queue");
        }
        queue.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 8);
        assert_eq!(queue.pending(), 0);
        queue.shutdown();
    }
}
