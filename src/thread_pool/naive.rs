use std::thread::{self, JoinHandle};

use log::error;
use parking_lot::Mutex;

use crate::thread_pool::ThreadPool;
use crate::Result;

/// Starts a new thread for every job. The thread count argument is ignored.
pub struct NaiveThreadPool {
    running: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool for NaiveThreadPool {
    fn new(_threads: u32) -> Result<Self> {
        Ok(NaiveThreadPool {
            running: Mutex::new(Vec::new()),
        })
    }

    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut running = self.running.lock();
        running.retain(|handle| !handle.is_finished());
        running.push(thread::spawn(job));
    }
}

impl Drop for NaiveThreadPool {
    fn drop(&mut self) {
        for handle in self.running.get_mut().drain(..) {
            if handle.join().is_err() {
                error!("a task panicked");
            }
        }
    }
}
