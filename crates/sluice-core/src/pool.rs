use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

type Job = Box<dyn FnOnce(usize) + Send + 'static>;

/// Fixed-size pool of OS threads consuming a FIFO task queue.
///
/// Each submitted task yields a [`TaskHandle`] that the submitter waits on.
/// Callers preserve output ordering by waiting on handles in submission
/// order, never by draining a completion queue.
pub struct WorkerPool {
    queue: Option<Sender<Job>>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `num_workers` worker threads (at least one).
    pub fn new(num_workers: usize) -> Self {
        let count = num_workers.max(1);
        let (queue, feed) = unbounded::<Job>();
        let stop = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(count);
        for worker_id in 0..count {
            let feed = feed.clone();
            let stop = Arc::clone(&stop);
            workers.push(thread::spawn(move || run_worker_loop(worker_id, feed, stop)));
        }
        tracing::debug!(workers = count, "worker pool started");

        Self {
            queue: Some(queue),
            stop,
            workers,
        }
    }

    /// Number of worker threads in this pool.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Queues a task and returns the handle holding its eventual result.
    ///
    /// The task receives the index of the worker that runs it. Submitters
    /// must wait every handle before dropping the pool; a handle abandoned
    /// at shutdown never resolves.
    pub fn submit<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(usize) -> T + Send + 'static,
    {
        let (done, result) = bounded(1);
        let job: Job = Box::new(move |worker_id| {
            // A dropped handle just discards the result.
            let _ = done.send(task(worker_id));
        });
        self.queue
            .as_ref()
            .expect("pool queue open for the pool's lifetime")
            .send(job)
            .expect("worker pool queue disconnected");
        TaskHandle { result }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.queue.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        tracing::debug!("worker pool stopped");
    }
}

fn run_worker_loop(worker_id: usize, feed: Receiver<Job>, stop: Arc<AtomicBool>) {
    while let Ok(job) = feed.recv() {
        // Tasks still queued at shutdown are never run.
        if stop.load(Ordering::Acquire) {
            break;
        }
        job(worker_id);
    }
}

/// Completion handle for one submitted task.
pub struct TaskHandle<T> {
    result: Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task has run and returns its result.
    pub fn wait(self) -> T {
        self.result
            .recv()
            .expect("task reaped before pool shutdown")
    }
}
