//! The three built-in aspects: backoff, timeout and retry.
//!
//! Around-advice ordering is fixed through dependencies: backoff's wait sits
//! closest to the target, timeout's race wraps it (so backoff waits count
//! against the deadline), and retry contributes a result wrapper that swaps
//! in the attempt's fallback target. The deadline is created once per
//! invocation and deliberately survives re-entry, so one timeout budget
//! spans all attempts.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::aspect::{Advice, AroundFn, Aspect, CatchFn, EffectFn, TargetFn};
use crate::error::messages;
use crate::loader::state::{
    BackoffState, RetryState, TimeoutState, downcast_factory, lock, sections,
};
use crate::process::AroundApi;
use crate::signal::{Fault, RetrySignal, Signal};
use crate::timeout::DynamicTimeout;

fn middleware_invalid(message: &str) -> Fault {
    Fault::signal(Signal::MiddlewareInvalid {
        message: message.to_string(),
    })
}

/// Waits the strategy's next delay ahead of each attempt (`__core__backoff`).
pub(crate) fn backoff_aspect<T: Send + 'static>() -> Aspect<T> {
    let around: Advice<AroundFn<T>> = Advice::around(|view, api: AroundApi<T>| async move {
        let state = view.section::<BackoffState>(sections::BACKOFF)?;
        let Some(strategy) = state.strategy else {
            return Ok(());
        };

        let new_delay = {
            let mut next = lock(&state.next_delay_ms);
            if !next.is_finite() || *next < 0.0 {
                return Err(middleware_invalid(messages::BACKOFF_DELAY_NEGATIVE));
            }
            let computed = strategy.next(*next);
            if !computed.is_finite() || computed < 0.0 {
                return Err(middleware_invalid(messages::BACKOFF_DELAY_NEGATIVE));
            }
            *next = computed;
            computed
        };

        let wait = Duration::try_from_secs_f64(new_delay / 1000.0)
            .map_err(|_| middleware_invalid(messages::BACKOFF_DELAY_NEGATIVE))?;
        debug!(delay_ms = new_delay, "backoff wait scheduled");
        api.attach_to_target(move |inner: TargetFn<T>| {
            let wrapped: TargetFn<T> = Arc::new(move || {
                let inner = Arc::clone(&inner);
                Box::pin(async move {
                    tokio::time::sleep(wait).await;
                    inner().await
                })
            });
            wrapped
        });
        Ok(())
    });

    Aspect::new(sections::BACKOFF).on_around(around.uses([sections::BACKOFF]))
}

/// Races the target against a shared deadline (`__core__timeout`).
pub(crate) fn timeout_aspect<T: Send + 'static>() -> Aspect<T> {
    let around: Advice<AroundFn<T>> = Advice::around(|view, api: AroundApi<T>| async move {
        let state = view.section::<TimeoutState>(sections::TIMEOUT)?;
        let deadline = {
            let mut pending = lock(&state.deadline);
            match pending.as_ref() {
                Some(deadline) => Arc::clone(deadline),
                None => {
                    let created = Arc::new(DynamicTimeout::new(
                        Fault::signal(Signal::Timeout),
                        state.delay,
                    ));
                    *pending = Some(Arc::clone(&created));
                    created
                }
            }
        };

        api.attach_to_target(move |inner: TargetFn<T>| {
            let deadline = Arc::clone(&deadline);
            let wrapped: TargetFn<T> = Arc::new(move || {
                let inner = Arc::clone(&inner);
                let deadline = Arc::clone(&deadline);
                Box::pin(async move {
                    tokio::select! {
                        result = inner() => result,
                        fault = deadline.promise() => {
                            warn!("deadline fired before the target settled");
                            Err(fault)
                        }
                    }
                })
            });
            wrapped
        });
        Ok(())
    });

    let after_returning: Advice<EffectFn> = Advice::new(|view| async move {
        let state = view.section::<TimeoutState>(sections::TIMEOUT)?;
        state.cancel_pending();
        Ok(())
    });

    let after_throwing: Advice<CatchFn> = Advice::catching(|view, fault| async move {
        if matches!(fault, Fault::Signal(Signal::Timeout)) {
            let state = view.section::<TimeoutState>(sections::TIMEOUT)?;
            if let Some(on_timeout) = &state.on_timeout {
                on_timeout();
            }
        }
        Ok(())
    });

    Aspect::new(sections::TIMEOUT)
        .on_around(
            around
                .uses([sections::TIMEOUT])
                .depends_on([sections::BACKOFF]),
        )
        .on_after_returning(after_returning.uses([sections::TIMEOUT]))
        .on_after_throwing(after_throwing.uses([sections::TIMEOUT]))
}

/// Attempt counting, fallback selection and retry signalling
/// (`__core__retry`).
pub(crate) fn retry_aspect<T: Send + 'static>() -> Aspect<T> {
    let before: Advice<EffectFn> = Advice::new(|view| async move {
        let state = view.section::<RetryState>(sections::RETRY)?;
        let count = state.count();
        if count > 0 {
            if let Some(on_retry_each) = &state.on_retry_each {
                on_retry_each(count);
            }
        }

        // Fix the upcoming attempt's fallback: immediate beats conditional
        // beats initial. Only the initial slot survives the selection.
        let chosen = {
            let mut slots = lock(&state.slots);
            let immediate = slots.immediate.take();
            let conditional = slots.conditional.take();
            immediate.or(conditional).or_else(|| slots.initial.clone())
        };
        lock(&state.matchers).clear();
        *lock(&state.derived) = chosen;
        Ok(())
    });

    let around: Advice<AroundFn<T>> = Advice::around(|view, api: AroundApi<T>| async move {
        let state = view.section::<RetryState>(sections::RETRY)?;
        if state.count() == 0 {
            return Ok(());
        }
        let Some(erased) = lock(&state.derived).clone() else {
            return Ok(());
        };
        let factory = downcast_factory::<T>(&erased)
            .ok_or_else(|| middleware_invalid("fallback target has a mismatched output type"))?;
        api.attach_to_result(move |next: TargetFn<T>| factory(next));
        Ok(())
    });

    let after_throwing: Advice<CatchFn> = Advice::catching(|view, fault| async move {
        let state = view.section::<RetryState>(sections::RETRY)?;
        match &fault {
            // Foreign signals propagate untouched.
            Fault::Signal(Signal::Retry(_)) => {}
            Fault::Signal(_) => return Ok(()),
            Fault::Error(_) => {
                if !state.condition.allows(&fault) {
                    return Ok(());
                }
            }
        }

        let count = state.count();
        if count + 1 > state.max_count {
            if let Some(on_retry_exceeded) = &state.on_retry_exceeded {
                on_retry_exceeded(state.max_count);
            }
            warn!(max_count = state.max_count, "retry budget exhausted");
            return Err(Fault::signal(Signal::RetryExceeded {
                max_count: state.max_count,
            }));
        }
        state.set_count(count + 1);

        // Matchers probe the underlying reason, not the wrapping signal.
        let probe: Fault = match fault.as_retry().and_then(|rs| rs.error_reason.as_deref()) {
            Some(reason) => reason.clone(),
            None => fault.clone(),
        };
        let matched = {
            let matchers = lock(&state.matchers);
            matchers
                .iter()
                .find(|matcher| (matcher.predicate)(&probe))
                .map(|matcher| Arc::clone(&matcher.factory))
        };
        if let Some(factory) = matched {
            lock(&state.slots).conditional = Some(factory);
        }

        let signal = match &fault {
            // An in-flight retry signal keeps its reason and flags.
            Fault::Signal(Signal::Retry(rs)) => Signal::Retry(rs.clone()),
            other => Signal::Retry(RetrySignal {
                error_reason: Some(Box::new(other.clone())),
                propagated: false,
            }),
        };
        debug!(
            attempt = count + 1,
            max_count = state.max_count,
            "retry scheduled"
        );
        Err(Fault::signal(signal))
    });

    Aspect::new(sections::RETRY)
        .on_before(before.uses([sections::RETRY]))
        .on_around(
            around
                .uses([sections::RETRY])
                .depends_on([sections::TIMEOUT]),
        )
        .on_after_throwing(after_throwing.uses([sections::RETRY]))
}
