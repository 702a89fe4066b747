//! The loader facade: a process pre-packaged with retry, timeout and
//! backoff for unreliable async work.
//!
//! A [`Loader`] instantiates a [`Process`] over the three built-in aspects
//! plus any user middlewares, wires the two-phase exit so signals outrank
//! user errors, and re-enters the chain when a retry signal is consumed.
//! Nested loaders share an ambient hierarchy that drives the propagation
//! decision.

pub(crate) mod aspects;
pub mod metadata;
pub mod options;
pub mod state;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::debug;
use uuid::Uuid;

use crate::aspect::{Aspect, TargetFn, TargetResult};
use crate::context::{Section, SharedContext, ambient};
use crate::error::LoaderError;
use crate::loader::state::{ErasedFactory, erase_factory, sections};
use crate::process::chain::ChainScope;
use crate::process::{
    AfterThrow, BuildOptions, ContextGenerator, DetermineErrorFn, ExitHandle, HandleErrorFn,
    Process, ProcessOptions, ProcessOutput,
};
use crate::signal::{Fault, RetrySignal, Signal};

pub use metadata::{LoaderMetadata, PropagateRetry};
pub use options::{
    LoaderOptions, MiddlewareOptions, RetryHandle, TimeoutHandle, loader_options,
    middleware_options, retry_fallback, retry_immediately, retry_immediately_with,
};
pub use state::{
    BackoffState, BackoffStrategy, FallbackFactory, RetryCondition, RetryState, TimeoutState,
    fallback_target,
};

/// A structured async target; plain closures work through
/// [`Loader::execute_fn`] instead.
#[async_trait]
pub trait Target: Send + Sync {
    type Output: Send;

    async fn call(&self) -> TargetResult<Self::Output>;
}

/// Retry configuration for one loader.
pub struct RetryInput<T> {
    max_count: u32,
    condition: RetryCondition,
    fallback: Option<FallbackFactory<T>>,
    on_retry_each: Option<Arc<dyn Fn(u32) + Send + Sync>>,
    on_retry_exceeded: Option<Arc<dyn Fn(u32) + Send + Sync>>,
}

impl<T: Send + 'static> RetryInput<T> {
    /// `max_count` retries on top of the initial attempt.
    pub fn new(max_count: u32) -> Self {
        Self {
            max_count,
            condition: RetryCondition::Never,
            fallback: None,
            on_retry_each: None,
            on_retry_exceeded: None,
        }
    }

    /// Which plain errors may trigger a retry (signals always do).
    pub fn retry_on(mut self, condition: impl Into<RetryCondition>) -> Self {
        self.condition = condition.into();
        self
    }

    /// The initial fallback slot, consulted when no immediate or
    /// conditional fallback is set for an attempt.
    pub fn fallback(mut self, factory: FallbackFactory<T>) -> Self {
        self.fallback = Some(factory);
        self
    }

    /// Invoked at the start of every retried attempt with the attempt count.
    pub fn on_retry_each(mut self, callback: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_retry_each = Some(Arc::new(callback));
        self
    }

    /// Invoked once when the retry budget runs out.
    pub fn on_retry_exceeded(mut self, callback: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_retry_exceeded = Some(Arc::new(callback));
        self
    }
}

/// Timeout configuration for one loader.
pub struct TimeoutInput {
    delay: Duration,
    on_timeout: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl TimeoutInput {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            on_timeout: None,
        }
    }

    /// Invoked when the deadline fires.
    pub fn on_timeout(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_timeout = Some(Arc::new(callback));
        self
    }
}

/// Backoff configuration for one loader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffInput {
    pub strategy: BackoffStrategy,
    pub initial_delay_ms: f64,
}

impl BackoffInput {
    pub fn new(strategy: BackoffStrategy, initial_delay_ms: f64) -> Self {
        Self {
            strategy,
            initial_delay_ms,
        }
    }
}

/// The full loader input: retry and timeout are mandatory, backoff opts in.
pub struct LoaderInput<T> {
    retry: RetryInput<T>,
    timeout: TimeoutInput,
    backoff: Option<BackoffInput>,
}

impl<T: Send + 'static> LoaderInput<T> {
    pub fn new(retry: RetryInput<T>, timeout: TimeoutInput) -> Self {
        Self {
            retry,
            timeout,
            backoff: None,
        }
    }

    pub fn backoff(mut self, backoff: BackoffInput) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

/// A named aspect plus the generator for its context section. The section
/// is keyed by the aspect's name and regenerated for every attempt.
pub struct Middleware<T> {
    aspect: Aspect<T>,
    section_gen: Arc<dyn Fn() -> Section + Send + Sync>,
}

impl<T> Middleware<T> {
    pub fn new<V, G>(aspect: Aspect<T>, section: G) -> Self
    where
        V: Send + Sync + 'static,
        G: Fn() -> V + Send + Sync + 'static,
    {
        Self {
            aspect,
            section_gen: Arc::new(move || Arc::new(section()) as Section),
        }
    }

    pub fn name(&self) -> &str {
        self.aspect.name()
    }
}

/// User hook replacing the default re-raise for plain errors.
pub type OnHandleErrorFn<T> =
    Arc<dyn Fn(Fault) -> BoxFuture<'static, Result<ProcessOutput<T>, Fault>> + Send + Sync>;

/// Builder for a [`Loader`].
pub struct LoaderBuilder<T> {
    input: LoaderInput<T>,
    propagate: PropagateRetry,
    middlewares: Vec<Middleware<T>>,
    on_determine_error: Option<DetermineErrorFn>,
    on_handle_error: Option<OnHandleErrorFn<T>>,
}

impl<T: Send + 'static> LoaderBuilder<T> {
    /// Whether a consumed-by-default retry signal should instead escape
    /// this loader.
    pub fn propagate_retry(mut self, propagate: impl Into<PropagateRetry>) -> Self {
        self.propagate = propagate.into();
        self
    }

    pub fn middleware(mut self, middleware: Middleware<T>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Picks one error from a halt aggregate that contains no signals.
    pub fn on_determine_error(
        mut self,
        hook: impl Fn(&[Fault]) -> Fault + Send + Sync + 'static,
    ) -> Self {
        self.on_determine_error = Some(Arc::new(hook));
        self
    }

    /// Last-chance recovery for plain errors; signals never reach it.
    pub fn on_handle_error<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Fault) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ProcessOutput<T>, Fault>> + Send + 'static,
    {
        self.on_handle_error = Some(Arc::new(move |fault| Box::pin(hook(fault))));
        self
    }

    #[deprecated(note = "renamed to `on_determine_error`")]
    pub fn on_resolve_error(
        self,
        hook: impl Fn(&[Fault]) -> Fault + Send + Sync + 'static,
    ) -> Self {
        self.on_determine_error(hook)
    }

    #[deprecated(note = "renamed to `on_handle_error`")]
    pub fn on_resolve_continued_error<F, Fut>(self, hook: F) -> Self
    where
        F: Fn(Fault) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ProcessOutput<T>, Fault>> + Send + 'static,
    {
        self.on_handle_error(hook)
    }

    pub fn build(self) -> Result<Loader<T>, LoaderError> {
        let mut names = HashSet::new();
        for middleware in &self.middlewares {
            let name = middleware.name();
            if sections::RESERVED.contains(&name) {
                return Err(LoaderError::ReservedName {
                    name: name.to_string(),
                });
            }
            if !names.insert(name.to_string()) {
                return Err(LoaderError::DuplicateMiddleware {
                    name: name.to_string(),
                });
            }
        }

        if let Some(backoff) = &self.input.backoff {
            let params_finite = match backoff.strategy {
                BackoffStrategy::Fixed => true,
                BackoffStrategy::Linear { add_ms } => add_ms.is_finite(),
                BackoffStrategy::Exponential { factor } => factor.is_finite(),
            };
            if !params_finite
                || !backoff.initial_delay_ms.is_finite()
                || backoff.initial_delay_ms < 0.0
            {
                return Err(LoaderError::InvalidBackoff);
            }
        }

        let id = Uuid::new_v4();
        let LoaderInput {
            retry,
            timeout,
            backoff,
        } = self.input;

        let mut aspects = vec![
            aspects::backoff_aspect::<T>(),
            aspects::timeout_aspect::<T>(),
            aspects::retry_aspect::<T>(),
        ];
        let mut section_gens: Vec<(String, Arc<dyn Fn() -> Section + Send + Sync>)> = Vec::new();
        for middleware in self.middlewares {
            section_gens.push((middleware.name().to_string(), middleware.section_gen));
            aspects.push(middleware.aspect);
        }

        let generator = context_generator(id, retry, timeout, backoff, section_gens);

        // afterThrowing halts so a retry signal raised there overrides the
        // target's own error in the halt aggregate.
        let mut build = BuildOptions::default();
        build.after_throwing.after_throw = AfterThrow::Halt;

        let process_options = ProcessOptions {
            determine_error: determine_error(self.on_determine_error),
            handle_error: handle_error::<T>(id, self.propagate, self.on_handle_error),
            handle_continued_errors: Arc::new(|rejections| {
                for rejection in rejections {
                    debug!(%rejection, "continued rejection observed");
                }
            }),
        };

        let process = Process::new(aspects, build, process_options)?;
        Ok(Loader {
            id,
            propagate: self.propagate,
            process,
            generator,
        })
    }
}

/// A process pre-packaged with the retry/timeout/backoff aspects.
pub struct Loader<T> {
    id: Uuid,
    propagate: PropagateRetry,
    process: Process<T>,
    generator: ContextGenerator,
}

impl<T> std::fmt::Debug for Loader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("id", &self.id)
            .field("propagate", &self.propagate)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Loader<T> {
    pub fn builder(input: LoaderInput<T>) -> LoaderBuilder<T> {
        LoaderBuilder {
            input,
            propagate: PropagateRetry::Never,
            middlewares: Vec::new(),
            on_determine_error: None,
            on_handle_error: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn propagate_retry(&self) -> PropagateRetry {
        self.propagate
    }

    /// Runs `target` under this loader's aspects. The loader's identifier
    /// joins the ambient hierarchy for the duration of the invocation.
    pub async fn execute(&self, target: TargetFn<T>) -> Result<ProcessOutput<T>, Fault> {
        let parent = ambient::current::<LoaderMetadata>().ok();
        let metadata = LoaderMetadata::child_of(parent.as_deref(), self.id);
        ambient::open(metadata, self.process.execute(&self.generator, target)).await
    }

    /// [`execute`](Self::execute) with a plain async closure as the target.
    pub async fn execute_fn<F, Fut>(&self, target: F) -> Result<ProcessOutput<T>, Fault>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TargetResult<T>> + Send + 'static,
    {
        self.execute(crate::aspect::target_fn(target)).await
    }

    /// [`execute`](Self::execute) with a structured [`Target`].
    pub async fn run<G>(&self, target: G) -> Result<ProcessOutput<T>, Fault>
    where
        G: Target<Output = T> + 'static,
    {
        let target = Arc::new(target);
        let as_fn: TargetFn<T> = Arc::new(move || {
            let target = Arc::clone(&target);
            Box::pin(async move { target.call().await })
        });
        self.execute(as_fn).await
    }
}

fn context_generator<T: Send + 'static>(
    id: Uuid,
    retry: RetryInput<T>,
    timeout: TimeoutInput,
    backoff: Option<BackoffInput>,
    section_gens: Vec<(String, Arc<dyn Fn() -> Section + Send + Sync>)>,
) -> ContextGenerator {
    let initial_slot: Option<ErasedFactory> = retry.fallback.clone().map(erase_factory);
    let retry = Arc::new(retry);
    let timeout = Arc::new(timeout);

    Arc::new(move |previous: Option<&SharedContext>| {
        // Built-in sections carry over on re-entry so retry counts, the
        // pending deadline and the backoff accumulator span attempts.
        let retry_section: Arc<RetryState> = previous
            .and_then(|context| context.section::<RetryState>(sections::RETRY).ok())
            .unwrap_or_else(|| {
                Arc::new(RetryState {
                    max_count: retry.max_count,
                    condition: retry.condition.clone(),
                    on_retry_each: retry.on_retry_each.clone(),
                    on_retry_exceeded: retry.on_retry_exceeded.clone(),
                    count: std::sync::Mutex::new(0),
                    slots: std::sync::Mutex::new(state::FallbackSlots {
                        initial: initial_slot.clone(),
                        ..Default::default()
                    }),
                    matchers: std::sync::Mutex::new(Vec::new()),
                    derived: std::sync::Mutex::new(None),
                })
            });
        let timeout_section: Arc<TimeoutState> = previous
            .and_then(|context| context.section::<TimeoutState>(sections::TIMEOUT).ok())
            .unwrap_or_else(|| {
                Arc::new(TimeoutState {
                    delay: timeout.delay,
                    on_timeout: timeout.on_timeout.clone(),
                    deadline: std::sync::Mutex::new(None),
                })
            });
        let backoff_section: Arc<BackoffState> = previous
            .and_then(|context| context.section::<BackoffState>(sections::BACKOFF).ok())
            .unwrap_or_else(|| {
                Arc::new(BackoffState {
                    strategy: backoff.map(|b| b.strategy),
                    next_delay_ms: std::sync::Mutex::new(
                        backoff.map(|b| b.initial_delay_ms).unwrap_or(0.0),
                    ),
                })
            });
        let metadata: Arc<LoaderMetadata> = ambient::current::<LoaderMetadata>()
            .unwrap_or_else(|_| Arc::new(LoaderMetadata::child_of(None, id)));

        let mut builder = SharedContext::builder()
            .raw_section(sections::RETRY, retry_section as Section)
            .raw_section(sections::TIMEOUT, timeout_section as Section)
            .raw_section(sections::BACKOFF, backoff_section as Section)
            .raw_section(sections::METADATA, metadata as Section);
        for (name, generate) in &section_gens {
            builder = builder.raw_section(name.clone(), generate());
        }
        builder.build()
    })
}

/// Signals win by priority (first occurrence breaks ties); error-only
/// aggregates go to the user hook, defaulting to the first error.
fn determine_error(user: Option<DetermineErrorFn>) -> DetermineErrorFn {
    Arc::new(move |errors: &[Fault]| {
        if let Some(signal) = Fault::highest_signal(errors) {
            return signal.clone();
        }
        match &user {
            Some(hook) => hook(errors),
            None => errors
                .first()
                .cloned()
                .unwrap_or_else(|| Fault::msg(crate::error::messages::NO_ERROR_TO_DETERMINE)),
        }
    })
}

fn handle_error<T: Send + 'static>(
    id: Uuid,
    propagate: PropagateRetry,
    user: Option<OnHandleErrorFn<T>>,
) -> HandleErrorFn<T> {
    Arc::new(move |fault: Fault, exit: ExitHandle| {
        let user = user.clone();
        Box::pin(async move {
            match fault {
                Fault::Signal(Signal::Retry(retry_signal)) => {
                    let metadata = ambient::current::<LoaderMetadata>().map_err(Fault::error)?;
                    if metadata.should_propagate(id, propagate) {
                        cancel_pending_deadline();
                        debug!("retry signal propagates to the enclosing loader");
                        Err(Fault::signal(Signal::Retry(RetrySignal {
                            propagated: true,
                            ..retry_signal
                        })))
                    } else {
                        exit.rerun_chain();
                        Ok(ProcessOutput::Fallback)
                    }
                }
                Fault::Signal(_) => {
                    cancel_pending_deadline();
                    Err(fault)
                }
                Fault::Error(_) => {
                    cancel_pending_deadline();
                    match &user {
                        Some(hook) => hook(fault).await,
                        None => Err(fault),
                    }
                }
            }
        })
    })
}

/// Every exit path that does not re-enter must leave no timer behind.
fn cancel_pending_deadline() {
    if let Ok(scope) = ambient::current::<ChainScope>() {
        if let Ok(timeout) = scope.context.section::<TimeoutState>(sections::TIMEOUT) {
            timeout.cancel_pending();
        }
    }
}
