//! Per-invocation state sections owned by the built-in aspects.
//!
//! Each section lives in the shared context under a reserved `__core__` key
//! and is carried over when a retry re-enters the chain, so attempt counts,
//! pending deadlines and growing backoff delays survive across attempts.
//! All mutation happens between suspension points on the single cooperative
//! task, so plain mutexes are held only for the duration of a field update.

use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::aspect::{TargetFn, TargetResult};
use crate::error::TimeoutStateError;
use crate::signal::Fault;
use crate::timeout::DynamicTimeout;

/// Reserved section keys of the built-in aspects.
pub mod sections {
    pub const BACKOFF: &str = "__core__backoff";
    pub const METADATA: &str = "__core__metadata";
    pub const RETRY: &str = "__core__retry";
    pub const TIMEOUT: &str = "__core__timeout";

    pub const RESERVED: [&str; 4] = [BACKOFF, METADATA, RETRY, TIMEOUT];
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decides whether a plain error may trigger a retry. Signals bypass this.
#[derive(Clone)]
pub enum RetryCondition {
    Always,
    Never,
    Predicate(Arc<dyn Fn(&Fault) -> bool + Send + Sync>),
}

impl RetryCondition {
    pub fn predicate(f: impl Fn(&Fault) -> bool + Send + Sync + 'static) -> Self {
        RetryCondition::Predicate(Arc::new(f))
    }

    pub(crate) fn allows(&self, fault: &Fault) -> bool {
        match self {
            RetryCondition::Always => true,
            RetryCondition::Never => false,
            RetryCondition::Predicate(predicate) => predicate(fault),
        }
    }
}

impl From<bool> for RetryCondition {
    fn from(allow: bool) -> Self {
        if allow {
            RetryCondition::Always
        } else {
            RetryCondition::Never
        }
    }
}

impl std::fmt::Debug for RetryCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryCondition::Always => f.write_str("Always"),
            RetryCondition::Never => f.write_str("Never"),
            RetryCondition::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

/// Builds the fallback target for one attempt from the original target.
pub type FallbackFactory<T> = Arc<dyn Fn(TargetFn<T>) -> TargetFn<T> + Send + Sync>;

/// A [`FallbackFactory`] stored type-erased so retry state stays untyped.
pub(crate) type ErasedFactory = Arc<dyn Any + Send + Sync>;

pub(crate) fn erase_factory<T: Send + 'static>(factory: FallbackFactory<T>) -> ErasedFactory {
    Arc::new(factory)
}

pub(crate) fn downcast_factory<T: Send + 'static>(
    erased: &ErasedFactory,
) -> Option<FallbackFactory<T>> {
    erased.downcast_ref::<FallbackFactory<T>>().cloned()
}

/// A fallback that ignores the original target and runs `f` instead.
pub fn fallback_target<T, F, Fut>(f: F) -> FallbackFactory<T>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TargetResult<T>> + Send + 'static,
{
    let replacement = crate::aspect::target_fn(f);
    Arc::new(move |_original| Arc::clone(&replacement))
}

/// The three fallback slots, in descending priority:
/// `immediate` > `conditional` > `initial`. Only `initial` persists across
/// attempts.
#[derive(Default)]
pub(crate) struct FallbackSlots {
    pub immediate: Option<ErasedFactory>,
    pub conditional: Option<ErasedFactory>,
    pub initial: Option<ErasedFactory>,
}

/// A user-registered `{predicate, factory}` pair consulted on failure.
pub(crate) struct FallbackMatcher {
    pub predicate: Arc<dyn Fn(&Fault) -> bool + Send + Sync>,
    pub factory: ErasedFactory,
}

/// Retry bookkeeping for one invocation (`__core__retry`).
pub struct RetryState {
    pub(crate) max_count: u32,
    pub(crate) condition: RetryCondition,
    pub(crate) on_retry_each: Option<Arc<dyn Fn(u32) + Send + Sync>>,
    pub(crate) on_retry_exceeded: Option<Arc<dyn Fn(u32) + Send + Sync>>,
    pub(crate) count: Mutex<u32>,
    pub(crate) slots: Mutex<FallbackSlots>,
    pub(crate) matchers: Mutex<Vec<FallbackMatcher>>,
    pub(crate) derived: Mutex<Option<ErasedFactory>>,
}

impl RetryState {
    /// Retries performed so far in this invocation.
    pub fn count(&self) -> u32 {
        *lock(&self.count)
    }

    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    /// Resets the attempt counter, granting the full retry budget again.
    pub fn reset_count(&self) {
        *lock(&self.count) = 0;
    }

    pub(crate) fn set_count(&self, value: u32) {
        *lock(&self.count) = value;
    }
}

/// Timeout bookkeeping for one invocation (`__core__timeout`).
pub struct TimeoutState {
    pub(crate) delay: Duration,
    pub(crate) on_timeout: Option<Arc<dyn Fn() + Send + Sync>>,
    pub(crate) deadline: Mutex<Option<Arc<DynamicTimeout>>>,
}

impl TimeoutState {
    /// The configured initial delay.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Time since the pending deadline was armed; zero when none is pending.
    pub fn elapsed(&self) -> Duration {
        lock(&self.deadline)
            .as_ref()
            .map(|deadline| deadline.start_time().elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Restarts the pending deadline from its initial delay.
    pub fn reset(&self) -> Result<(), TimeoutStateError> {
        match lock(&self.deadline).as_ref() {
            Some(deadline) => deadline.reset_timeout(None),
            None => Ok(()),
        }
    }

    pub(crate) fn pending(&self) -> Option<Arc<DynamicTimeout>> {
        lock(&self.deadline).as_ref().map(Arc::clone)
    }

    /// Cancels and forgets the pending deadline so no timer outlives the
    /// invocation.
    pub(crate) fn cancel_pending(&self) {
        if let Some(deadline) = lock(&self.deadline).take() {
            deadline.cancel_timeout();
        }
    }
}

/// Delay progression for waits injected ahead of each attempt.
///
/// Delays are computed in f64 milliseconds so a strategy that goes negative
/// (a shrinking `linear`, say) is caught rather than wrapped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffStrategy {
    /// `next(d) = d`
    Fixed,
    /// `next(d) = d + add_ms`
    Linear { add_ms: f64 },
    /// `next(d) = d * factor`
    Exponential { factor: f64 },
}

impl BackoffStrategy {
    pub(crate) fn next(&self, current_ms: f64) -> f64 {
        match self {
            BackoffStrategy::Fixed => current_ms,
            BackoffStrategy::Linear { add_ms } => current_ms + add_ms,
            BackoffStrategy::Exponential { factor } => current_ms * factor,
        }
    }
}

/// Backoff bookkeeping for one invocation (`__core__backoff`).
pub struct BackoffState {
    pub(crate) strategy: Option<BackoffStrategy>,
    pub(crate) next_delay_ms: Mutex<f64>,
}

impl BackoffState {
    /// The delay accumulator the next attempt will start from.
    pub fn next_delay_ms(&self) -> f64 {
        *lock(&self.next_delay_ms)
    }
}
