use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::{Result, Status, StatusCode};

enum Slot<T> {
    Pending(Option<Waker>),
    Ready(Result<T>),
    Taken,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

/// Creates a connected promise and future.
pub(crate) fn channel<T>() -> (Promise<T>, Future<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot::Pending(None)),
        ready: Condvar::new(),
    });
    (
        Promise {
            shared: Some(Arc::clone(&shared)),
        },
        Future { shared },
    )
}

/// Write half of a [`Future`]. Dropping it unfulfilled resolves the future with
/// UNKNOWN_ERROR.
pub(crate) struct Promise<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Promise<T> {
    pub(crate) fn fulfill(mut self, result: Result<T>) {
        if let Some(shared) = self.shared.take() {
            resolve(&shared, result);
        }
    }
}

fn resolve<T>(shared: &Shared<T>, result: Result<T>) {
    let waker = {
        let mut slot = shared.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Ready(result)) {
            Slot::Pending(waker) => waker,
            _ => None,
        }
    };
    shared.ready.notify_all();
    if let Some(waker) = waker {
        waker.wake();
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            resolve(
                &shared,
                Err(Status::new(StatusCode::UnknownError, "task ended without a result")),
            );
        }
    }
}

/// Result of an operation running on an [`AsyncDbm`](crate::AsyncDbm) worker.
///
/// Block on it with [`get`](Future::get) or [`wait`](Future::wait), or `.await` it.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Future<T> {
    /// Whether the result has arrived.
    pub fn is_ready(&self) -> bool {
        !matches!(*self.shared.slot.lock(), Slot::Pending(_))
    }

    /// Blocks until the result arrives or `timeout` passes; `None` waits without limit.
    /// Returns whether the result has arrived.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut slot = self.shared.slot.lock();
        while let Slot::Pending(_) = *slot {
            match deadline {
                Some(deadline) => {
                    if self.shared.ready.wait_until(&mut slot, deadline).timed_out() {
                        return !matches!(*slot, Slot::Pending(_));
                    }
                }
                None => self.shared.ready.wait(&mut slot),
            }
        }
        true
    }

    /// Blocks until the result arrives and returns it.
    pub fn get(self) -> Result<T> {
        let mut slot = self.shared.slot.lock();
        while let Slot::Pending(_) = *slot {
            self.shared.ready.wait(&mut slot);
        }
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(result) => result,
            _ => Err(Status::new(StatusCode::UnknownError, "result already taken")),
        }
    }
}

impl<T> std::future::Future for Future<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.shared.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(result) => Poll::Ready(result),
            Slot::Pending(_) => {
                *slot = Slot::Pending(Some(cx.waker().clone()));
                Poll::Pending
            }
            Slot::Taken => Poll::Ready(Err(Status::new(
                StatusCode::UnknownError,
                "result already taken",
            ))),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_times_out_then_resolves() {
        let (promise, future) = channel::<u32>();
        assert!(!future.wait(Some(Duration::from_millis(10))));
        let handle = thread::spawn(move || promise.fulfill(Ok(7)));
        assert!(future.wait(None));
        assert!(future.is_ready());
        assert_eq!(7, future.get().unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn dropped_promise_gives_unknown_error() {
        let (promise, future) = channel::<()>();
        drop(promise);
        assert_eq!(future.get().unwrap_err(), StatusCode::UnknownError);
    }

    #[test]
    fn errors_pass_through() {
        let (promise, future) = channel::<()>();
        promise.fulfill(Err(Status::not_found("gone")));
        assert_eq!(future.get().unwrap_err(), StatusCode::NotFoundError);
    }
}
