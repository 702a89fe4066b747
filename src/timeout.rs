//! A cancelable, resettable, queue-extensible deadline.
//!
//! A [`DynamicTimeout`] owns a single armed timer driven by a background
//! task. When the timer elapses, the next queued delay (if any) starts;
//! otherwise the deadline rejects and every [`promise`](DynamicTimeout::promise)
//! future yields the reject value. A cancelled deadline leaves its promises
//! pending forever. Every mutator except `cancel_timeout` errors once the
//! deadline has rejected.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{ConfigError, TimeoutStateError};
use crate::signal::Fault;

pub struct DynamicTimeout {
    inner: Arc<Inner>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    reject_with: Fault,
    initial: Duration,
    state: Mutex<State>,
    changed: Notify,
    rejected_tx: watch::Sender<bool>,
}

struct State {
    deadline: Option<Instant>,
    queue: VecDeque<Duration>,
    total: Duration,
    started: Instant,
    rejected: bool,
    cancelled: bool,
}

enum Elapsed {
    Fire,
    Rearm,
    Stop,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_deadline(&self) -> Option<Instant> {
        let state = self.lock();
        if state.rejected || state.cancelled {
            return None;
        }
        state.deadline
    }

    fn on_elapsed(&self, expected: Instant) -> Elapsed {
        let mut state = self.lock();
        if state.rejected || state.cancelled {
            return Elapsed::Stop;
        }
        if state.deadline != Some(expected) {
            // Reset slipped in while we were sleeping.
            return Elapsed::Rearm;
        }
        match state.queue.pop_front() {
            Some(next) => {
                state.deadline = Some(Instant::now() + next);
                Elapsed::Rearm
            }
            None => {
                state.rejected = true;
                state.deadline = None;
                Elapsed::Fire
            }
        }
    }
}

async fn drive(inner: Arc<Inner>) {
    loop {
        let Some(wait_until) = inner.current_deadline() else {
            return;
        };
        tokio::select! {
            _ = tokio::time::sleep_until(wait_until) => {
                match inner.on_elapsed(wait_until) {
                    Elapsed::Fire => {
                        let _ = inner.rejected_tx.send(true);
                        return;
                    }
                    Elapsed::Rearm => {}
                    Elapsed::Stop => return,
                }
            }
            _ = inner.changed.notified() => {}
        }
    }
}

impl DynamicTimeout {
    /// Arms a deadline that rejects with `reject_with` after `initial`.
    pub fn new(reject_with: Fault, initial: Duration) -> Self {
        let now = Instant::now();
        let (rejected_tx, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            reject_with,
            initial,
            state: Mutex::new(State {
                deadline: Some(now + initial),
                queue: VecDeque::new(),
                total: initial,
                started: now,
                rejected: false,
                cancelled: false,
            }),
            changed: Notify::new(),
            rejected_tx,
        });
        let driver = tokio::spawn(drive(Arc::clone(&inner)));
        Self {
            inner,
            driver: Mutex::new(Some(driver)),
        }
    }

    /// [`new`](Self::new) from raw milliseconds; negative or non-finite
    /// values are rejected.
    pub fn with_millis(reject_with: Fault, millis: f64) -> Result<Self, Fault> {
        let initial = Duration::try_from_secs_f64(millis / 1000.0)
            .map_err(|_| Fault::error(ConfigError::InitialDelay { value: millis }))?;
        Ok(Self::new(reject_with, initial))
    }

    /// A future that yields the reject value when the deadline fires and
    /// never completes otherwise.
    pub fn promise(&self) -> impl Future<Output = Fault> + Send + 'static {
        let mut rejected_rx = self.inner.rejected_tx.subscribe();
        let reject_with = self.inner.reject_with.clone();
        async move {
            loop {
                if *rejected_rx.borrow_and_update() {
                    return reject_with;
                }
                if rejected_rx.changed().await.is_err() {
                    // Sender gone without rejecting: stay pending forever.
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    /// Queues `delay` to start once the current delay elapses.
    pub fn add_timeout(&self, delay: Duration) -> Result<(), TimeoutStateError> {
        let mut state = self.inner.lock();
        if state.rejected {
            return Err(TimeoutStateError::AlreadyRejected);
        }
        if !state.cancelled {
            state.queue.push_back(delay);
            state.total += delay;
        }
        drop(state);
        self.inner.changed.notify_one();
        Ok(())
    }

    /// [`add_timeout`](Self::add_timeout) from raw milliseconds.
    pub fn add_millis(&self, millis: f64) -> Result<(), Fault> {
        let delay = Duration::try_from_secs_f64(millis / 1000.0)
            .map_err(|_| Fault::error(ConfigError::QueueDelay { value: millis }))?;
        self.add_timeout(delay).map_err(Fault::error)
    }

    /// Cancels the current timer, clears the queue and restarts with
    /// `delay` (the initial delay when `None`).
    pub fn reset_timeout(&self, delay: Option<Duration>) -> Result<(), TimeoutStateError> {
        let delay = delay.unwrap_or(self.inner.initial);
        {
            let mut state = self.inner.lock();
            if state.rejected {
                return Err(TimeoutStateError::AlreadyRejected);
            }
            let now = Instant::now();
            state.queue.clear();
            state.deadline = Some(now + delay);
            state.total = delay;
            state.started = now;
            state.cancelled = false;
        }
        self.respawn_driver();
        Ok(())
    }

    /// Rejects immediately.
    pub fn execute_timeout(&self) -> Result<(), TimeoutStateError> {
        {
            let mut state = self.inner.lock();
            if state.rejected {
                return Err(TimeoutStateError::AlreadyRejected);
            }
            state.rejected = true;
            state.deadline = None;
            state.queue.clear();
        }
        let _ = self.inner.rejected_tx.send(true);
        self.inner.changed.notify_one();
        Ok(())
    }

    /// Cancels the timer and clears the queue; promises stay pending.
    /// Idempotent, and a no-op after rejection.
    pub fn cancel_timeout(&self) {
        {
            let mut state = self.inner.lock();
            if state.rejected || state.cancelled {
                return;
            }
            state.cancelled = true;
            state.deadline = None;
            state.queue.clear();
        }
        self.inner.changed.notify_one();
    }

    pub fn initial_delay(&self) -> Duration {
        self.inner.initial
    }

    /// The initial delay plus every delay queued since the last reset.
    pub fn total_delay(&self) -> Duration {
        self.inner.lock().total
    }

    /// When the deadline was armed (or last reset).
    pub fn start_time(&self) -> Instant {
        self.inner.lock().started
    }

    pub fn is_rejected(&self) -> bool {
        self.inner.lock().rejected
    }

    fn respawn_driver(&self) {
        let mut guard = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = guard.take() {
            old.abort();
        }
        *guard = Some(tokio::spawn(drive(Arc::clone(&self.inner))));
        self.inner.changed.notify_one();
    }
}

impl Drop for DynamicTimeout {
    fn drop(&mut self) {
        if let Some(driver) = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            driver.abort();
        }
    }
}

impl std::fmt::Debug for DynamicTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("DynamicTimeout")
            .field("initial", &self.inner.initial)
            .field("total", &state.total)
            .field("queued", &state.queue.len())
            .field("rejected", &state.rejected)
            .field("cancelled", &state.cancelled)
            .finish()
    }
}
