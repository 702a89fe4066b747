//! The process facade: aspects + build options + process options, organized
//! once and executed any number of times.
//!
//! A [`Process`] wraps a single async target with the batched advice the
//! organizer pre-computed. Each `execute` call generates a fresh shared
//! context, runs the chain, and loops when the exit hook requests re-entry
//! (the exit-outer escape used by retrying callers).

pub(crate) mod around;
pub(crate) mod batch;
pub(crate) mod chain;
pub(crate) mod organizer;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;

use crate::aspect::{AdviceKind, Aspect, TargetFn, TargetResult};
use crate::context::SharedContext;
use crate::error::{ProcessSetupError, Rejection, messages};
use crate::signal::Fault;

pub use around::AroundApi;
use chain::ChainOutcome;
use organizer::OrganizedAdvice;

/// How entries within one level of an advice kind are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    Parallel,
    Sequential,
}

/// Whether a failing level short-circuits its kind or all levels settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAggregation {
    Unit,
    All,
}

/// What a raised rejection does to the rest of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterThrow {
    Halt,
    Continue,
}

/// Per-kind execution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindOptions {
    pub strategy: ExecutionStrategy,
    pub aggregation: ErrorAggregation,
    pub after_throw: AfterThrow,
}

impl KindOptions {
    pub const fn new(
        strategy: ExecutionStrategy,
        aggregation: ErrorAggregation,
        after_throw: AfterThrow,
    ) -> Self {
        Self {
            strategy,
            aggregation,
            after_throw,
        }
    }
}

/// Execution policy per advice kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    pub before: KindOptions,
    pub around: KindOptions,
    pub after_returning: KindOptions,
    pub after_throwing: KindOptions,
    pub after: KindOptions,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            before: KindOptions::new(
                ExecutionStrategy::Parallel,
                ErrorAggregation::Unit,
                AfterThrow::Halt,
            ),
            around: KindOptions::new(
                ExecutionStrategy::Sequential,
                ErrorAggregation::Unit,
                AfterThrow::Halt,
            ),
            after_returning: KindOptions::new(
                ExecutionStrategy::Parallel,
                ErrorAggregation::All,
                AfterThrow::Continue,
            ),
            after_throwing: KindOptions::new(
                ExecutionStrategy::Parallel,
                ErrorAggregation::All,
                AfterThrow::Continue,
            ),
            after: KindOptions::new(
                ExecutionStrategy::Parallel,
                ErrorAggregation::All,
                AfterThrow::Continue,
            ),
        }
    }
}

impl BuildOptions {
    pub fn kind(&self, kind: AdviceKind) -> &KindOptions {
        match kind {
            AdviceKind::Before => &self.before,
            AdviceKind::Around => &self.around,
            AdviceKind::AfterReturning => &self.after_returning,
            AdviceKind::AfterThrowing => &self.after_throwing,
            AdviceKind::After => &self.after,
        }
    }

    pub fn kind_mut(&mut self, kind: AdviceKind) -> &mut KindOptions {
        match kind {
            AdviceKind::Before => &mut self.before,
            AdviceKind::Around => &mut self.around,
            AdviceKind::AfterReturning => &mut self.after_returning,
            AdviceKind::AfterThrowing => &mut self.after_throwing,
            AdviceKind::After => &mut self.after,
        }
    }
}

/// Result of a process invocation: the target's value, or the fallback
/// sentinel for runs recovered without one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutput<T> {
    Value(T),
    /// Distinct from every user value; the sole fallback sentinel.
    Fallback,
}

impl<T> ProcessOutput<T> {
    pub fn value(self) -> Option<T> {
        match self {
            ProcessOutput::Value(value) => Some(value),
            ProcessOutput::Fallback => None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, ProcessOutput::Fallback)
    }
}

/// Produces a fresh shared context per invocation; receives the previous
/// invocation's context on re-entry.
pub type ContextGenerator = Arc<dyn Fn(Option<&SharedContext>) -> SharedContext + Send + Sync>;

/// Picks one fault out of a halt aggregate.
pub type DetermineErrorFn = Arc<dyn Fn(&[Fault]) -> Fault + Send + Sync>;

/// Last-chance recovery; its value (or re-raise) becomes the invocation's
/// outcome unless it requests re-entry through the [`ExitHandle`].
pub type HandleErrorFn<T> =
    Arc<dyn Fn(Fault, ExitHandle) -> BoxFuture<'static, Result<ProcessOutput<T>, Fault>> + Send + Sync>;

/// Observation sink for continued rejections; cannot change the result.
pub type ContinuedErrorsFn = Arc<dyn Fn(&[Rejection]) + Send + Sync>;

/// The three user hooks of the two-phase exit.
pub struct ProcessOptions<T> {
    pub determine_error: DetermineErrorFn,
    pub handle_error: HandleErrorFn<T>,
    pub handle_continued_errors: ContinuedErrorsFn,
}

impl<T> Clone for ProcessOptions<T> {
    fn clone(&self) -> Self {
        Self {
            determine_error: Arc::clone(&self.determine_error),
            handle_error: Arc::clone(&self.handle_error),
            handle_continued_errors: Arc::clone(&self.handle_continued_errors),
        }
    }
}

impl<T: Send + 'static> Default for ProcessOptions<T> {
    fn default() -> Self {
        Self {
            determine_error: Arc::new(|errors| {
                errors
                    .first()
                    .cloned()
                    .unwrap_or_else(|| Fault::msg(messages::NO_ERROR_TO_DETERMINE))
            }),
            handle_error: Arc::new(|fault, _exit| Box::pin(async move { Err(fault) })),
            handle_continued_errors: Arc::new(|_| {}),
        }
    }
}

/// Handed to `handle_error`; requesting a rerun makes the process re-enter
/// the chain with a context generated from the current one, after the
/// current chain's scope has fully closed.
#[derive(Clone, Default)]
pub struct ExitHandle {
    rerun: Arc<AtomicBool>,
}

impl ExitHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn rerun_chain(&self) {
        self.rerun.store(true, Ordering::SeqCst);
    }

    pub(crate) fn requested(&self) -> bool {
        self.rerun.load(Ordering::SeqCst)
    }
}

/// An organized set of aspects wrapping a single async target.
pub struct Process<T> {
    organized: OrganizedAdvice<T>,
    build: BuildOptions,
    options: ProcessOptions<T>,
}

impl<T: Send + 'static> Process<T> {
    /// Organizes `aspects` eagerly; dependency and section violations fail
    /// here rather than at call time.
    pub fn new(
        aspects: Vec<Aspect<T>>,
        build: BuildOptions,
        options: ProcessOptions<T>,
    ) -> Result<Self, ProcessSetupError> {
        let organized = OrganizedAdvice::organize(&aspects, &build)?;
        Ok(Self {
            organized,
            build,
            options,
        })
    }

    /// Runs the chain once, re-entering while the exit hook requests it.
    pub async fn execute(
        &self,
        generator: &ContextGenerator,
        target: TargetFn<T>,
    ) -> Result<ProcessOutput<T>, Fault> {
        let mut previous: Option<Arc<SharedContext>> = None;
        loop {
            let context = Arc::new(generator(previous.as_deref()));
            match chain::run_chain(
                &self.organized,
                &self.build,
                &self.options,
                Arc::clone(&context),
                Arc::clone(&target),
            )
            .await
            {
                ChainOutcome::Done(result) => return result,
                ChainOutcome::Rerun => previous = Some(context),
            }
        }
    }

    /// [`execute`](Self::execute) with a plain async closure as the target.
    pub async fn execute_fn<F, Fut>(
        &self,
        generator: &ContextGenerator,
        target: F,
    ) -> Result<ProcessOutput<T>, Fault>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TargetResult<T>> + Send + 'static,
    {
        self.execute(generator, crate::aspect::target_fn(target))
            .await
    }
}
