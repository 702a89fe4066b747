//! Engine-level tests: chain ordering, halt/continue routing, aggregation
//! and the two-phase exit.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use aspectflow::prelude::*;
use aspectflow::{ContextGenerator, ExitHandle};

type Log = Arc<Mutex<Vec<String>>>;

fn log_entry(log: &Log, label: &str) {
    log.lock().unwrap().push(label.to_string());
}

fn logged(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn empty_context() -> ContextGenerator {
    Arc::new(|_previous| SharedContext::builder().build())
}

fn recorder_aspect(log: Log) -> Aspect<String> {
    let before_log = log.clone();
    let around_log = log.clone();
    let returning_log = log.clone();
    let throwing_log = log.clone();
    let after_log = log;
    Aspect::new("recorder")
        .on_before(Advice::new(move |_view| {
            let log = before_log.clone();
            async move {
                log_entry(&log, "before");
                Ok(())
            }
        }))
        .on_around(Advice::around(move |_view, api: AroundApi<String>| {
            let log = around_log.clone();
            async move {
                log_entry(&log, "around");
                api.attach_to_target(move |inner: TargetFn<String>| {
                    let wrapped: TargetFn<String> = Arc::new(move || {
                        let inner = Arc::clone(&inner);
                        Box::pin(async move {
                            let value = inner().await?;
                            Ok(format!("wrapped({value})"))
                        })
                    });
                    wrapped
                });
                Ok(())
            }
        }))
        .on_after_returning(Advice::new(move |_view| {
            let log = returning_log.clone();
            async move {
                log_entry(&log, "afterReturning");
                Ok(())
            }
        }))
        .on_after_throwing(Advice::catching(move |_view, _fault| {
            let log = throwing_log.clone();
            async move {
                log_entry(&log, "afterThrowing");
                Ok(())
            }
        }))
        .on_after(Advice::new(move |_view| {
            let log = after_log.clone();
            async move {
                log_entry(&log, "after");
                Ok(())
            }
        }))
}

#[tokio::test]
async fn chain_runs_kinds_in_order_on_success() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let process = Process::new(
        vec![recorder_aspect(log.clone())],
        BuildOptions::default(),
        ProcessOptions::default(),
    )
    .unwrap();

    let result = process
        .execute_fn(&empty_context(), || async { Ok("x".to_string()) })
        .await
        .unwrap();

    assert_eq!(result, ProcessOutput::Value("wrapped(x)".to_string()));
    assert_eq!(
        logged(&log),
        vec!["before", "around", "afterReturning", "after"]
    );
}

#[tokio::test]
async fn failing_target_runs_after_throwing_instead_of_after_returning() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let process = Process::new(
        vec![recorder_aspect(log.clone())],
        BuildOptions::default(),
        ProcessOptions::default(),
    )
    .unwrap();

    let result = process
        .execute_fn(&empty_context(), || async {
            Err::<String, _>(Fault::msg("boom"))
        })
        .await;

    assert_eq!(result.unwrap_err().to_string(), "boom");
    assert_eq!(logged(&log), vec!["before", "around", "afterThrowing", "after"]);
}

#[tokio::test]
async fn before_halt_skips_target_but_still_runs_after() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let target_runs = Arc::new(AtomicU32::new(0));

    let failing_before = Aspect::new("gate").on_before(Advice::new(|_view| async {
        Err(Fault::msg("denied"))
    }));

    let process = Process::new(
        vec![failing_before, recorder_aspect(log.clone())],
        BuildOptions::default(),
        ProcessOptions::default(),
    )
    .unwrap();

    let runs = Arc::clone(&target_runs);
    let result = process
        .execute_fn(&empty_context(), move || {
            let runs = Arc::clone(&runs);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok("unreachable".to_string())
            }
        })
        .await;

    assert_eq!(result.unwrap_err().to_string(), "denied");
    assert_eq!(target_runs.load(Ordering::SeqCst), 0);
    // `before` of the recorder may or may not have run depending on level
    // interleaving, but the forward path after the halt must be skipped and
    // `after` must still run exactly once.
    let seen = logged(&log);
    assert!(!seen.contains(&"afterReturning".to_string()));
    assert!(!seen.contains(&"afterThrowing".to_string()));
    assert_eq!(seen.iter().filter(|s| s.as_str() == "after").count(), 1);
}

#[tokio::test]
async fn handle_error_recovery_becomes_the_result() {
    let process: Process<String> = Process::new(
        vec![],
        BuildOptions::default(),
        ProcessOptions {
            handle_error: Arc::new(|_fault, _exit: ExitHandle| {
                Box::pin(async move { Ok(ProcessOutput::Value("recovered".to_string())) })
            }),
            ..ProcessOptions::default()
        },
    )
    .unwrap();

    let result = process
        .execute_fn(&empty_context(), || async {
            Err::<String, _>(Fault::msg("boom"))
        })
        .await
        .unwrap();
    assert_eq!(result, ProcessOutput::Value("recovered".to_string()));
}

#[tokio::test]
async fn handle_error_can_return_the_fallback_sentinel() {
    let process: Process<String> = Process::new(
        vec![],
        BuildOptions::default(),
        ProcessOptions {
            handle_error: Arc::new(|_fault, _exit| {
                Box::pin(async move { Ok(ProcessOutput::Fallback) })
            }),
            ..ProcessOptions::default()
        },
    )
    .unwrap();

    let result = process
        .execute_fn(&empty_context(), || async {
            Err::<String, _>(Fault::msg("boom"))
        })
        .await
        .unwrap();
    assert!(result.is_fallback());
}

#[tokio::test]
async fn continued_rejections_are_observed_but_do_not_change_the_result() {
    let observed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);

    let leaky = Aspect::new("leaky").on_after_returning(Advice::new(|_view| async {
        Err(Fault::msg("afterReturning leak"))
    }));

    // afterReturning defaults to continue/all, so the value still wins.
    let process = Process::new(
        vec![leaky],
        BuildOptions::default(),
        ProcessOptions {
            handle_continued_errors: Arc::new(move |rejections| {
                for rejection in rejections {
                    sink.lock().unwrap().push(rejection.to_string());
                }
            }),
            ..ProcessOptions::default()
        },
    )
    .unwrap();

    let result = process
        .execute_fn(&empty_context(), || async { Ok("value".to_string()) })
        .await
        .unwrap();

    assert_eq!(result, ProcessOutput::Value("value".to_string()));
    let seen = observed.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].contains("afterReturning leak"));
}

#[tokio::test]
async fn determine_error_sees_every_halt_error() {
    let seen: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&seen);

    let noisy = Aspect::new("noisy").on_after_throwing(Advice::catching(|_view, _fault| async {
        Err(Fault::msg("cleanup failed"))
    }));

    let mut build = BuildOptions::default();
    build.after_throwing.after_throw = aspectflow::AfterThrow::Halt;

    let process: Process<String> = Process::new(
        vec![noisy],
        build,
        ProcessOptions {
            determine_error: Arc::new(move |errors| {
                *counter.lock().unwrap() = errors.len();
                errors.first().cloned().unwrap()
            }),
            ..ProcessOptions::default()
        },
    )
    .unwrap();

    let result = process
        .execute_fn(&empty_context(), || async {
            Err::<String, _>(Fault::msg("target failed"))
        })
        .await;

    // Target error plus the afterThrowing rejection, discovery order first.
    assert_eq!(*seen.lock().unwrap(), 2);
    assert_eq!(result.unwrap_err().to_string(), "target failed");
}

#[tokio::test]
async fn exit_handle_reruns_the_chain_with_a_carried_context() {
    struct Attempts(AtomicU32);

    let generator: ContextGenerator = Arc::new(|previous| {
        // Carry the attempt counter across re-entries.
        let attempts = previous
            .and_then(|context| context.section::<Attempts>("attempts").ok())
            .unwrap_or_else(|| Arc::new(Attempts(AtomicU32::new(0))));
        SharedContext::builder()
            .raw_section("attempts", attempts as aspectflow::Section)
            .build()
    });

    let counter_aspect = Aspect::new("counter").on_before(
        Advice::new(|view: SectionView| async move {
            view.section::<Attempts>("attempts")?
                .0
                .fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .uses(["attempts"]),
    );

    let process: Process<u32> = Process::new(
        vec![counter_aspect],
        BuildOptions::default(),
        ProcessOptions {
            handle_error: Arc::new(|fault, exit: ExitHandle| {
                Box::pin(async move {
                    if fault.to_string().contains("transient") {
                        exit.rerun_chain();
                    }
                    Err(fault)
                })
            }),
            ..ProcessOptions::default()
        },
    )
    .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_target = Arc::clone(&calls);
    let result = process
        .execute_fn(&generator, move || {
            let calls = Arc::clone(&calls_in_target);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Fault::msg("transient"))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(result, ProcessOutput::Value(7));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn parallel_level_failures_aggregate_under_unit() {
    let a = Aspect::new("a").on_before(Advice::new(|_view| async { Err(Fault::msg("a failed")) }));
    let b = Aspect::new("b").on_before(Advice::new(|_view| async { Err(Fault::msg("b failed")) }));

    let seen: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&seen);
    let process: Process<String> = Process::new(
        vec![a, b],
        BuildOptions::default(),
        ProcessOptions {
            determine_error: Arc::new(move |errors| {
                *counter.lock().unwrap() = errors.len();
                errors.first().cloned().unwrap()
            }),
            ..ProcessOptions::default()
        },
    )
    .unwrap();

    let result = process
        .execute_fn(&empty_context(), || async { Ok("x".to_string()) })
        .await;
    assert!(result.is_err());
    assert_eq!(*seen.lock().unwrap(), 2);
}

#[tokio::test]
async fn setup_errors_surface_at_construction() {
    let cyclic = vec![
        Aspect::<String>::new("a")
            .on_before(Advice::new(|_v| async { Ok(()) }).depends_on(["b"])),
        Aspect::<String>::new("b")
            .on_before(Advice::new(|_v| async { Ok(()) }).depends_on(["a"])),
    ];
    let err = Process::new(cyclic, BuildOptions::default(), ProcessOptions::default())
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(err, ProcessSetupError::DependencyCycle { .. }));
}
