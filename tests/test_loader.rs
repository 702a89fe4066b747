//! Loader-level tests: retry, timeout and backoff semantics, fallback
//! slots, nested propagation and the per-invocation handles.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aspectflow::prelude::*;
use aspectflow::messages;

fn counted() -> Arc<AtomicU32> {
    Arc::new(AtomicU32::new(0))
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

#[tokio::test]
async fn exhausted_retries_reject_with_retry_exceeded() {
    let runs = counted();
    let retried = counted();
    let exceeded = counted();

    let retried_hook = Arc::clone(&retried);
    let exceeded_hook = Arc::clone(&exceeded);
    let loader: Loader<String> = Loader::builder(LoaderInput::new(
        RetryInput::new(2)
            .retry_on(true)
            .on_retry_each(move |_count| {
                retried_hook.fetch_add(1, Ordering::SeqCst);
            })
            .on_retry_exceeded(move |_max| {
                exceeded_hook.fetch_add(1, Ordering::SeqCst);
            }),
        TimeoutInput::new(secs(5)),
    ))
    .build()
    .unwrap();

    let runs_in_target = Arc::clone(&runs);
    let err = loader
        .execute_fn(move || {
            let runs = Arc::clone(&runs_in_target);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(Fault::msg("x"))
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Fault::Signal(Signal::RetryExceeded { max_count: 2 })
    ));
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(retried.load(Ordering::SeqCst), 2);
    assert_eq!(exceeded.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_target_rejects_with_timeout() {
    let timed_out = counted();
    let hook = Arc::clone(&timed_out);
    let loader: Loader<String> = Loader::builder(LoaderInput::new(
        RetryInput::new(1).retry_on(false),
        TimeoutInput::new(Duration::from_millis(50)).on_timeout(move || {
            hook.fetch_add(1, Ordering::SeqCst);
        }),
    ))
    .build()
    .unwrap();

    let err = loader
        .execute_fn(|| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Err::<String, _>(Fault::msg("late failure"))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Fault::Signal(Signal::Timeout)));
    assert_eq!(timed_out.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_outranks_retryable_errors() {
    // Even with retries permitted, a timeout signal is not retried.
    let runs = counted();
    let loader: Loader<String> = Loader::builder(LoaderInput::new(
        RetryInput::new(5).retry_on(true),
        TimeoutInput::new(Duration::from_millis(20)),
    ))
    .build()
    .unwrap();

    let runs_in_target = Arc::clone(&runs);
    let err = loader
        .execute_fn(move || {
            let runs = Arc::clone(&runs_in_target);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(secs(10)).await;
                Ok("never".to_string())
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Fault::Signal(Signal::Timeout)));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn middleware_halt_wins_over_the_skipped_target() {
    let failing_before = Aspect::new("gate")
        .on_before(Advice::new(|_view| async { Err(Fault::msg("m")) }));

    let loader: Loader<String> = Loader::builder(LoaderInput::new(
        RetryInput::new(0),
        TimeoutInput::new(secs(5)),
    ))
    .middleware(Middleware::new(failing_before, || ()))
    .on_determine_error(|errors| errors.first().cloned().unwrap())
    .build()
    .unwrap();

    let err = loader
        .execute_fn(|| async { Err::<String, _>(Fault::msg("t")) })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "m");
}

#[tokio::test]
async fn retry_immediately_swaps_in_the_fallback() {
    let runs = counted();
    let loader: Loader<String> = Loader::builder(LoaderInput::new(
        RetryInput::new(3).retry_on(true),
        TimeoutInput::new(secs(5)),
    ))
    .build()
    .unwrap();

    let runs_in_target = Arc::clone(&runs);
    let result = loader
        .execute_fn(move || {
            let runs = Arc::clone(&runs_in_target);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(retry_immediately_with(fallback_target(|| async {
                    Ok("fb".to_string())
                })))
            }
        })
        .await
        .unwrap();

    assert_eq!(result, ProcessOutput::Value("fb".to_string()));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn immediate_fallback_is_consumed_after_one_attempt() {
    let runs = counted();
    let loader: Loader<String> = Loader::builder(LoaderInput::new(
        RetryInput::new(4).retry_on(true),
        TimeoutInput::new(secs(5)),
    ))
    .build()
    .unwrap();

    let runs_in_target = Arc::clone(&runs);
    let result = loader
        .execute_fn(move || {
            let runs = Arc::clone(&runs_in_target);
            async move {
                let attempt = runs.fetch_add(1, Ordering::SeqCst);
                if attempt == 0 {
                    // The fallback itself fails, so the following attempt
                    // must fall through to the real target again.
                    Err(retry_immediately_with(fallback_target(|| async {
                        Err::<String, _>(Fault::msg("fallback failed"))
                    })))
                } else {
                    Ok("real".to_string())
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(result, ProcessOutput::Value("real".to_string()));
    // Attempt 0 ran the target, attempt 1 ran the fallback, attempt 2 the
    // target again.
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn retry_fallback_matchers_feed_the_conditional_slot() {
    let loader: Loader<String> = Loader::builder(LoaderInput::new(
        RetryInput::new(2).retry_on(true),
        TimeoutInput::new(secs(5)),
    ))
    .build()
    .unwrap();

    let result = loader
        .execute_fn(|| async {
            retry_fallback(
                |fault| fault.to_string().contains("io"),
                fallback_target(|| async { Ok("fb-io".to_string()) }),
            )
            .map_err(Fault::error)?;
            Err::<String, _>(Fault::msg("io failure"))
        })
        .await
        .unwrap();

    assert_eq!(result, ProcessOutput::Value("fb-io".to_string()));
}

#[tokio::test]
async fn initial_fallback_persists_across_attempts() {
    let runs = counted();
    let loader: Loader<String> = Loader::builder(LoaderInput::new(
        RetryInput::new(1)
            .retry_on(true)
            .fallback(fallback_target(|| async { Ok("initial-fb".to_string()) })),
        TimeoutInput::new(secs(5)),
    ))
    .build()
    .unwrap();

    let runs_in_target = Arc::clone(&runs);
    let result = loader
        .execute_fn(move || {
            let runs = Arc::clone(&runs_in_target);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(Fault::msg("always"))
            }
        })
        .await
        .unwrap();

    // Attempt 0 fails, attempt 1 runs the initial-slot fallback.
    assert_eq!(result, ProcessOutput::Value("initial-fb".to_string()));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reset_retry_count_grants_more_retries() {
    let runs = counted();
    let loader: Loader<String> = Loader::builder(LoaderInput::new(
        RetryInput::new(1).retry_on(true),
        TimeoutInput::new(secs(5)),
    ))
    .build()
    .unwrap();

    let runs_in_target = Arc::clone(&runs);
    let result = loader
        .execute_fn(move || {
            let runs = Arc::clone(&runs_in_target);
            async move {
                let attempt = runs.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    loader_options().map_err(Fault::error)?.retry.reset_retry_count();
                    Err(Fault::msg("try again"))
                } else {
                    Ok("finally".to_string())
                }
            }
        })
        .await
        .unwrap();

    // max_count is 1, yet three resets buy three more attempts.
    assert_eq!(result, ProcessOutput::Value("finally".to_string()));
    assert_eq!(runs.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn propagated_retry_signals_escape_the_loader() {
    let loader: Loader<String> = Loader::builder(LoaderInput::new(
        RetryInput::new(3).retry_on(true),
        TimeoutInput::new(secs(5)),
    ))
    .propagate_retry(true)
    .build()
    .unwrap();

    let err = loader
        .execute_fn(|| async { Err::<String, _>(Fault::msg("x")) })
        .await
        .unwrap_err();

    match err {
        Fault::Signal(Signal::Retry(retry_signal)) => {
            assert!(retry_signal.propagated);
            let reason = retry_signal.error_reason.expect("carries the cause");
            assert_eq!(reason.to_string(), "x");
        }
        other => panic!("expected a propagated retry signal, got {other:?}"),
    }
}

#[tokio::test]
async fn nested_loaders_multiply_attempts() {
    let inner_runs = counted();

    let inner: Arc<Loader<String>> = Arc::new(
        Loader::builder(LoaderInput::new(
            RetryInput::new(2).retry_on(true),
            TimeoutInput::new(secs(5)),
        ))
        .propagate_retry(PropagateRetry::HasOuterContext)
        .build()
        .unwrap(),
    );

    let outer: Loader<String> = Loader::builder(LoaderInput::new(
        RetryInput::new(3).retry_on(true),
        TimeoutInput::new(secs(5)),
    ))
    .build()
    .unwrap();

    let inner_for_target = Arc::clone(&inner);
    let inner_runs_for_target = Arc::clone(&inner_runs);
    let err = outer
        .execute_fn(move || {
            let inner = Arc::clone(&inner_for_target);
            let inner_runs = Arc::clone(&inner_runs_for_target);
            async move {
                let outcome = inner
                    .execute_fn(move || {
                        let inner_runs = Arc::clone(&inner_runs);
                        async move {
                            inner_runs.fetch_add(1, Ordering::SeqCst);
                            Err::<String, _>(Fault::msg("inner always fails"))
                        }
                    })
                    .await?;
                Ok(match outcome {
                    ProcessOutput::Value(value) => value,
                    ProcessOutput::Fallback => "fallback".to_string(),
                })
            }
        })
        .await
        .unwrap_err();

    // The outer loader exhausts its own budget; every outer attempt re-ran
    // the inner target.
    assert!(matches!(
        err,
        Fault::Signal(Signal::RetryExceeded { max_count: 3 })
    ));
    assert!(inner_runs.load(Ordering::SeqCst) > 3);
}

#[tokio::test]
async fn propagation_stays_local_without_an_outer_context() {
    // HAS_OUTER_CONTEXT with no enclosing loader: the signal is consumed
    // and the loader retries by itself.
    let runs = counted();
    let loader: Loader<String> = Loader::builder(LoaderInput::new(
        RetryInput::new(1).retry_on(true),
        TimeoutInput::new(secs(5)),
    ))
    .propagate_retry(PropagateRetry::HasOuterContext)
    .build()
    .unwrap();

    let runs_in_target = Arc::clone(&runs);
    let err = loader
        .execute_fn(move || {
            let runs = Arc::clone(&runs_in_target);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(Fault::msg("x"))
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Fault::Signal(Signal::RetryExceeded { .. })));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn fixed_backoff_waits_before_every_attempt() {
    let started = tokio::time::Instant::now();
    let runs = counted();
    let loader: Loader<String> = Loader::builder(
        LoaderInput::new(
            RetryInput::new(2).retry_on(true),
            TimeoutInput::new(secs(3600)),
        )
        .backoff(BackoffInput::new(BackoffStrategy::Fixed, 100.0)),
    )
    .build()
    .unwrap();

    let runs_in_target = Arc::clone(&runs);
    let result = loader
        .execute_fn(move || {
            let runs = Arc::clone(&runs_in_target);
            async move {
                if runs.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Fault::msg("flaky"))
                } else {
                    Ok("ok".to_string())
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(result, ProcessOutput::Value("ok".to_string()));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
    assert!(elapsed < secs(3600));
}

#[tokio::test]
async fn shrinking_backoff_rejects_when_it_goes_negative() {
    let runs = counted();
    let loader: Loader<String> = Loader::builder(
        LoaderInput::new(
            RetryInput::new(2).retry_on(true),
            TimeoutInput::new(secs(5)),
        )
        .backoff(BackoffInput::new(
            BackoffStrategy::Linear { add_ms: -300.0 },
            100.0,
        )),
    )
    .build()
    .unwrap();

    let runs_in_target = Arc::clone(&runs);
    let err = loader
        .execute_fn(move || {
            let runs = Arc::clone(&runs_in_target);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok("never".to_string())
            }
        })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Fault::Signal(Signal::MiddlewareInvalid { .. })
    ));
    assert!(err.to_string().contains(messages::BACKOFF_DELAY_NEGATIVE));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn handles_expose_loader_and_middleware_state() {
    struct Quota(AtomicU32);

    let observed_delay = Arc::new(Mutex::new(None));
    let observed_depth = Arc::new(Mutex::new(None));

    let quota_aspect = Aspect::new("quota").on_before(
        Advice::new(|view: SectionView| async move {
            view.section::<Quota>("quota")?.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .uses(["quota"]),
    );

    let loader: Loader<u32> = Loader::builder(LoaderInput::new(
        RetryInput::new(0),
        TimeoutInput::new(secs(7)),
    ))
    .middleware(Middleware::new(quota_aspect, || Quota(AtomicU32::new(0))))
    .build()
    .unwrap();

    let delay_slot = Arc::clone(&observed_delay);
    let depth_slot = Arc::clone(&observed_depth);
    let result = loader
        .execute_fn(move || {
            let delay_slot = Arc::clone(&delay_slot);
            let depth_slot = Arc::clone(&depth_slot);
            async move {
                let options = loader_options().map_err(Fault::error)?;
                *delay_slot.lock().unwrap() = Some(options.timeout.delay());
                *depth_slot.lock().unwrap() = Some(options.metadata.depth());

                let middlewares = middleware_options().map_err(Fault::error)?;
                let quota = middlewares
                    .section::<Quota>("quota")
                    .map_err(Fault::error)?;
                Ok(quota.0.load(Ordering::SeqCst))
            }
        })
        .await
        .unwrap();

    // The middleware's before advice bumped its own section once.
    assert_eq!(result, ProcessOutput::Value(1));
    assert_eq!(*observed_delay.lock().unwrap(), Some(secs(7)));
    assert_eq!(*observed_depth.lock().unwrap(), Some(1));
}

#[tokio::test]
async fn middleware_options_refuse_reserved_sections() {
    let loader: Loader<u32> = Loader::builder(LoaderInput::new(
        RetryInput::new(0),
        TimeoutInput::new(secs(1)),
    ))
    .build()
    .unwrap();

    let err = loader
        .execute_fn(|| async {
            let middlewares = middleware_options().map_err(Fault::error)?;
            match middlewares.section::<u32>("__core__retry") {
                Err(error) => Err(Fault::error(error)),
                Ok(_) => Ok(0),
            }
        })
        .await
        .unwrap_err();

    assert!(err.to_string().contains("reserved"));
}

#[tokio::test]
async fn handles_error_outside_an_invocation() {
    assert!(loader_options().is_err());
    assert!(middleware_options().is_err());
    let fault = retry_immediately();
    assert!(fault.as_signal().is_none());
}

#[tokio::test]
async fn user_handle_error_recovers_plain_errors() {
    let loader: Loader<String> = Loader::builder(LoaderInput::new(
        RetryInput::new(0),
        TimeoutInput::new(secs(5)),
    ))
    .on_handle_error(|fault| async move {
        if fault.to_string() == "t" {
            Ok(ProcessOutput::Value("handled".to_string()))
        } else {
            Err(fault)
        }
    })
    .build()
    .unwrap();

    let result = loader
        .execute_fn(|| async { Err::<String, _>(Fault::msg("t")) })
        .await
        .unwrap();
    assert_eq!(result, ProcessOutput::Value("handled".to_string()));
}

#[tokio::test]
async fn config_settings_build_working_loaders() {
    let raw = serde_json::json!({
        "retry": { "max_count": 1, "can_retry_on_error": true },
        "timeout": { "delay_ms": 5000.0 }
    });
    let settings = LoaderConfig::from_json_str(&raw.to_string())
        .unwrap()
        .validate()
        .unwrap();

    let runs = counted();
    let loader: Loader<String> = Loader::builder(settings.loader_input())
        .build()
        .unwrap();

    let runs_in_target = Arc::clone(&runs);
    let result = loader
        .execute_fn(move || {
            let runs = Arc::clone(&runs_in_target);
            async move {
                if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Fault::msg("first try fails"))
                } else {
                    Ok("second try".to_string())
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(result, ProcessOutput::Value("second try".to_string()));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}
