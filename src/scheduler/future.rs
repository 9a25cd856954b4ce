//! Deferred completion of an enqueue call.
//!
//! A [`SubmissionFuture`] resolves once every command of its call has been
//! submitted to the device queues. It yields the call's events; waiting on those
//! events is what tells the caller the device work itself has finished.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{Result, StreamError};

struct Shared<E> {
    value: Mutex<Option<Result<Vec<E>>>>,
    ready: Condvar,
}

impl<E> Shared<E> {
    fn lock(&self) -> MutexGuard<'_, Option<Result<Vec<E>>>> {
        self.value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Sending half, owned by the scheduler's pending job.
pub(crate) struct Promise<E> {
    shared: Arc<Shared<E>>,
    fulfilled: bool,
}

impl<E> Promise<E> {
    pub fn fulfil(mut self, outcome: Result<Vec<E>>) {
        self.set(outcome);
    }

    fn set(&mut self, outcome: Result<Vec<E>>) {
        *self.shared.lock() = Some(outcome);
        self.fulfilled = true;
        self.shared.ready.notify_all();
    }
}

impl<E> Drop for Promise<E> {
    fn drop(&mut self) {
        if !self.fulfilled {
            self.set(Err(StreamError::Configuration(
                "enqueued work was discarded before submission".to_string(),
            )));
        }
    }
}

/// Event sequence of one enqueue call, available once submission completes.
pub struct SubmissionFuture<E> {
    shared: Arc<Shared<E>>,
}

pub(crate) fn promise<E>() -> (Promise<E>, SubmissionFuture<E>) {
    let shared = Arc::new(Shared {
        value: Mutex::new(None),
        ready: Condvar::new(),
    });
    (
        Promise {
            shared: Arc::clone(&shared),
            fulfilled: false,
        },
        SubmissionFuture { shared },
    )
}

impl<E> SubmissionFuture<E> {
    /// Whether submission has finished (successfully or not).
    pub fn is_ready(&self) -> bool {
        self.shared.lock().is_some()
    }

    /// Block until submission finishes and return the call's events in chunk order.
    pub fn wait(self) -> Result<Vec<E>> {
        let mut value = self.shared.lock();
        loop {
            if let Some(outcome) = value.take() {
                return outcome;
            }
            value = self
                .shared
                .ready
                .wait(value)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Like [`wait`](Self::wait), giving the future back if `timeout` elapses first.
    pub fn wait_timeout(self, timeout: Duration) -> std::result::Result<Result<Vec<E>>, Self> {
        let deadline = Instant::now() + timeout;
        {
            let mut value = self.shared.lock();
            loop {
                if let Some(outcome) = value.take() {
                    return Ok(outcome);
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                value = self
                    .shared
                    .ready
                    .wait_timeout(value, deadline - now)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|poisoned| poisoned.into_inner().0);
            }
        }
        Err(self)
    }
}

impl<E> fmt::Debug for SubmissionFuture<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmissionFuture")
            .field("ready", &self.is_ready())
            .finish()
    }
}
