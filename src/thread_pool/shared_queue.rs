use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error};
use parking_lot::{Condvar, Mutex};

use crate::thread_pool::ThreadPool;
use crate::{Result, Status, StatusCode};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

impl Shared {
    /// Next job, or `None` once the pool is shutting down and the queue is drained.
    fn take(&self) -> Option<Job> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(job) = queue.jobs.pop_front() {
                return Some(job);
            }
            if queue.shutdown {
                return None;
            }
            self.available.wait(&mut queue);
        }
    }
}

fn run_worker(shared: Arc<Shared>) {
    while let Some(job) = shared.take() {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(
                "a task panicked on {}",
                thread::current().name().unwrap_or("a worker")
            );
        }
    }
}

/// Fixed set of worker threads taking jobs from one unbounded queue.
pub struct SharedQueueThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool for SharedQueueThreadPool {
    fn new(threads: u32) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let mut pool = SharedQueueThreadPool {
            shared,
            workers: Vec::new(),
        };
        for id in 0..threads.max(1) {
            let shared = Arc::clone(&pool.shared);
            let worker = thread::Builder::new()
                .name(format!("polydbm-worker-{}", id))
                .spawn(move || run_worker(shared))
                .map_err(|err| {
                    Status::new(
                        StatusCode::SystemError,
                        format!("spawning a worker failed: {}", err),
                    )
                })?;
            pool.workers.push(worker);
        }
        debug!("started {} workers", pool.workers.len());
        Ok(pool)
    }

    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.queue.lock().jobs.push_back(Box::new(job));
        self.shared.available.notify_one();
    }
}

impl Drop for SharedQueueThreadPool {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("a worker thread died");
            }
        }
        debug!("stopped the workers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn drop_drains_the_queue() {
        let done = Arc::new(AtomicUsize::new(0));
        {
            let pool = SharedQueueThreadPool::new(2).unwrap();
            for _ in 0..50 {
                let done = Arc::clone(&done);
                pool.spawn(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(50, done.load(Ordering::SeqCst));
    }
}
