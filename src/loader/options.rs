//! Per-invocation handles, callable from target and middleware code.
//!
//! All handles resolve their state through the ambient chain scope, so they
//! work from any suspension point inside a loader invocation and error
//! outside one.

use std::sync::Arc;
use std::time::Duration;

use crate::context::SharedContext;
use crate::context::ambient;
use crate::error::{LoaderError, TimeoutStateError};
use crate::loader::metadata::LoaderMetadata;
use crate::loader::state::{
    FallbackFactory, FallbackMatcher, RetryState, TimeoutState, erase_factory, lock, sections,
};
use crate::process::chain::ChainScope;
use crate::signal::{Fault, Signal};

/// Read-only knobs over the built-in sections of the current invocation.
pub struct LoaderOptions {
    pub retry: RetryHandle,
    pub timeout: TimeoutHandle,
    pub metadata: LoaderMetadata,
}

/// The current invocation's [`LoaderOptions`].
pub fn loader_options() -> Result<LoaderOptions, LoaderError> {
    let scope = ambient::current::<ChainScope>()?;
    let context = &scope.context;
    Ok(LoaderOptions {
        retry: RetryHandle {
            state: context.section::<RetryState>(sections::RETRY)?,
        },
        timeout: TimeoutHandle {
            state: context.section::<TimeoutState>(sections::TIMEOUT)?,
        },
        metadata: (*context.section::<LoaderMetadata>(sections::METADATA)?).clone(),
    })
}

pub struct RetryHandle {
    state: Arc<RetryState>,
}

impl RetryHandle {
    /// Retries performed so far.
    pub fn count(&self) -> u32 {
        self.state.count()
    }

    pub fn max_count(&self) -> u32 {
        self.state.max_count()
    }

    /// Grants the full retry budget again.
    pub fn reset_retry_count(&self) {
        self.state.reset_count();
    }
}

pub struct TimeoutHandle {
    state: Arc<TimeoutState>,
}

impl TimeoutHandle {
    /// The configured initial delay.
    pub fn delay(&self) -> Duration {
        self.state.delay()
    }

    /// Time since the pending deadline was armed.
    pub fn elapsed_time(&self) -> Duration {
        self.state.elapsed()
    }

    /// Restarts the pending deadline from its initial delay.
    pub fn reset_timeout(&self) -> Result<(), TimeoutStateError> {
        self.state.reset()
    }
}

/// Read-only accessors to middleware sections of the current invocation.
/// The reserved built-in sections are not reachable through this.
pub struct MiddlewareOptions {
    context: Arc<SharedContext>,
}

/// The current invocation's [`MiddlewareOptions`].
pub fn middleware_options() -> Result<MiddlewareOptions, LoaderError> {
    let scope = ambient::current::<ChainScope>()?;
    Ok(MiddlewareOptions {
        context: Arc::clone(&scope.context),
    })
}

impl MiddlewareOptions {
    pub fn section<V>(&self, name: &str) -> Result<Arc<V>, LoaderError>
    where
        V: Send + Sync + 'static,
    {
        if sections::RESERVED.contains(&name) {
            return Err(LoaderError::ReservedName {
                name: name.to_string(),
            });
        }
        Ok(self.context.section::<V>(name)?)
    }
}

/// Requests an immediate retry from inside the target.
///
/// Returns the fault the target should raise; the retry aspect then
/// re-enters the chain. Outside a loader invocation the returned fault
/// carries the scope error instead of a retry signal.
pub fn retry_immediately() -> Fault {
    request_retry(None)
}

/// [`retry_immediately`] with a fallback for the next attempt; it lands in
/// the `immediate` slot and wins over every other fallback source.
pub fn retry_immediately_with<T: Send + 'static>(fallback: FallbackFactory<T>) -> Fault {
    request_retry(Some(erase_factory(fallback)))
}

fn request_retry(fallback: Option<crate::loader::state::ErasedFactory>) -> Fault {
    let state = match ambient::current::<ChainScope>()
        .map_err(LoaderError::from)
        .and_then(|scope| Ok(scope.context.section::<RetryState>(sections::RETRY)?))
    {
        Ok(state) => state,
        Err(error) => return Fault::error(error),
    };
    if fallback.is_some() {
        lock(&state.slots).immediate = fallback;
    }
    Fault::signal(Signal::retry(None))
}

/// Registers a `{predicate, fallback}` matcher consulted on the next
/// failure; the first matching predicate supplies the `conditional`
/// fallback slot.
pub fn retry_fallback<T, P>(when: P, fallback: FallbackFactory<T>) -> Result<(), LoaderError>
where
    T: Send + 'static,
    P: Fn(&Fault) -> bool + Send + Sync + 'static,
{
    let scope = ambient::current::<ChainScope>()?;
    let state = scope.context.section::<RetryState>(sections::RETRY)?;
    lock(&state.matchers).push(FallbackMatcher {
        predicate: Arc::new(when),
        factory: erase_factory(fallback),
    });
    Ok(())
}
