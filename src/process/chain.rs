//! The chain executor: one invocation of a process.
//!
//! Runs before → around → target → afterReturning | afterThrowing → after
//! inside an ambient [`ChainScope`], tracking rejections along the way. A
//! `Halt` rejection parks the chain (only `after` still runs); `Continue`
//! rejections accumulate for observation. The two-phase exit then picks one
//! error from the halt aggregate, offers it to `handle_error` for recovery
//! or re-entry, and finally reports the continued rejections.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::aspect::{AdviceKind, TargetFn};
use crate::context::{SharedContext, ambient};
use crate::error::{Rejection, RejectionOrigin};
use crate::process::around::{AroundApi, resolve};
use crate::process::batch::run_batches;
use crate::process::organizer::OrganizedAdvice;
use crate::process::{AfterThrow, BuildOptions, ExitHandle, ProcessOptions, ProcessOutput};
use crate::signal::Fault;

/// Result of one chain run: finished, or re-enter with a fresh context.
pub(crate) enum ChainOutcome<T> {
    Done(Result<ProcessOutput<T>, Fault>),
    Rerun,
}

/// Ambient binding of a running chain. Per-invocation handles resolve their
/// sections through it.
pub(crate) struct ChainScope {
    pub context: Arc<SharedContext>,
}

pub(crate) async fn run_chain<T: Send + 'static>(
    organized: &OrganizedAdvice<T>,
    build: &BuildOptions,
    options: &ProcessOptions<T>,
    context: Arc<SharedContext>,
    target: TargetFn<T>,
) -> ChainOutcome<T> {
    let scope = ChainScope {
        context: Arc::clone(&context),
    };
    ambient::open(
        scope,
        run_chain_inner(organized, build, options, context, target),
    )
    .await
}

async fn run_chain_inner<T: Send + 'static>(
    organized: &OrganizedAdvice<T>,
    build: &BuildOptions,
    options: &ProcessOptions<T>,
    context: Arc<SharedContext>,
    target: TargetFn<T>,
) -> ChainOutcome<T> {
    let mut halt: Option<Rejection> = None;
    let mut continued: Vec<Rejection> = Vec::new();
    let mut value: Option<T> = None;

    if let Err(rejection) = run_batches(
        &organized.before,
        AdviceKind::Before,
        &build.before,
        &context,
        |e, v| (e.body)(v),
    )
    .await
    {
        route(rejection, build.before.after_throw, &mut halt, &mut continued);
    }

    if halt.is_none() {
        let api = AroundApi::new();
        match run_batches(
            &organized.around,
            AdviceKind::Around,
            &build.around,
            &context,
            |e, v| (e.body)(v, api.clone()),
        )
        .await
        {
            Err(rejection) => route(rejection, build.around.after_throw, &mut halt, &mut continued),
            Ok(()) => {
                let composed = resolve(api.take(), Arc::clone(&target));
                match composed().await {
                    Ok(result) => {
                        value = Some(result);
                        if let Err(rejection) = run_batches(
                            &organized.after_returning,
                            AdviceKind::AfterReturning,
                            &build.after_returning,
                            &context,
                            |e, v| (e.body)(v),
                        )
                        .await
                        {
                            route(
                                rejection,
                                build.after_returning.after_throw,
                                &mut halt,
                                &mut continued,
                            );
                        }
                    }
                    Err(fault) => {
                        debug!(%fault, "target rejected");
                        merge_halt(&mut halt, Rejection::target(fault.clone()));
                        if let Err(rejection) = run_batches(
                            &organized.after_throwing,
                            AdviceKind::AfterThrowing,
                            &build.after_throwing,
                            &context,
                            |e, v| (e.body)(v, fault.clone()),
                        )
                        .await
                        {
                            route(
                                rejection,
                                build.after_throwing.after_throw,
                                &mut halt,
                                &mut continued,
                            );
                        }
                    }
                }
            }
        }
    }

    // `after` runs in every terminal branch.
    if let Err(rejection) = run_batches(
        &organized.after,
        AdviceKind::After,
        &build.after,
        &context,
        |e, v| (e.body)(v),
    )
    .await
    {
        route(rejection, build.after.after_throw, &mut halt, &mut continued);
    }

    // Phase A: resolve the pending halt, if any.
    let outcome = match halt {
        Some(rejection) => {
            let chosen = (options.determine_error)(&rejection.errors);
            let exit = ExitHandle::new();
            let handled = (options.handle_error)(chosen, exit.clone()).await;
            if exit.requested() {
                (options.handle_continued_errors)(&continued);
                return ChainOutcome::Rerun;
            }
            handled
        }
        None => match value {
            Some(result) => Ok(ProcessOutput::Value(result)),
            None => Ok(ProcessOutput::Fallback),
        },
    };

    // Phase B: continued rejections are observed unconditionally.
    (options.handle_continued_errors)(&continued);
    ChainOutcome::Done(outcome)
}

fn route(
    rejection: Rejection,
    policy: AfterThrow,
    halt: &mut Option<Rejection>,
    continued: &mut Vec<Rejection>,
) {
    // Rejections from unrecognized sites always halt.
    let halts = matches!(policy, AfterThrow::Halt) || rejection.origin == RejectionOrigin::Unknown;
    if halts {
        warn!(%rejection, "chain halted");
        merge_halt(halt, rejection);
    } else {
        continued.push(rejection);
    }
}

/// Joins a new halt rejection onto the pending one: earlier errors stay
/// first so discovery order survives into `determine_error`, while the
/// newest origin wins (an afterThrowing halt overrides the target's).
fn merge_halt(halt: &mut Option<Rejection>, mut rejection: Rejection) {
    match halt {
        Some(existing) => {
            existing.errors.append(&mut rejection.errors);
            existing.origin = rejection.origin;
        }
        None => *halt = Some(rejection),
    }
}
