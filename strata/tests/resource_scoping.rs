//! End-to-end scoping behavior: release ordering, interruption safety,
//! and background acquisition, exercised through the public API only.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata::{Cause, Ctx, Env, ExecStrategy, Finalizer, Managed, Outcome, ReleaseMap};

type TestError = String;

fn ctx() -> Ctx {
    Ctx::new(Env::new())
}

fn tracked(log: &Arc<Mutex<Vec<String>>>, name: &str) -> Managed<String, TestError> {
    let acquire_log = log.clone();
    let release_log = log.clone();
    let name = name.to_string();
    Managed::acquire_release(
        move |_ctx| {
            let log = acquire_log.clone();
            let name = name.clone();
            async move {
                log.lock().push(format!("acquire {name}"));
                Ok(name)
            }
        },
        move |name, _outcome| {
            let log = release_log.clone();
            async move {
                log.lock().push(format!("release {name}"));
                Ok(())
            }
        },
    )
}

#[tokio::test]
async fn chained_resources_release_in_reverse_acquisition_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let a = tracked(&log, "a");
    let b = tracked(&log, "b");
    let c = tracked(&log, "c");

    let app = a.and_then(move |_| b.clone()).and_then(move |_| c.clone());
    app.use_with(ctx(), |_| async { Ok(()) }).await.unwrap();

    assert_eq!(
        *log.lock(),
        vec![
            "acquire a",
            "acquire b",
            "acquire c",
            "release c",
            "release b",
            "release a"
        ]
    );
}

#[tokio::test]
async fn interrupting_the_body_still_releases_everything_once() {
    let releases = Arc::new(AtomicUsize::new(0));
    let release_count = releases.clone();
    let resource: Managed<u32, TestError> = Managed::acquire_release(
        |_ctx| async { Ok(7) },
        move |_value, _outcome| {
            let releases = release_count.clone();
            async move {
                releases.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
    );

    let context = ctx();
    let trigger = context.clone();
    let body = resource.use_with(context, |_value| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok::<(), _>(())
    });

    let interrupter = async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.interrupt();
    };

    let start = Instant::now();
    let (result, _) = tokio::join!(body, interrupter);

    assert_eq!(result.unwrap_err(), Cause::Interrupt);
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn release_sees_the_outcome_of_the_scope() {
    let seen = Arc::new(Mutex::new(Vec::new()));

    let seen_ok = seen.clone();
    let fine: Managed<(), TestError> = Managed::acquire_release(
        |_ctx| async { Ok(()) },
        move |_value, outcome| {
            let seen = seen_ok.clone();
            async move {
                seen.lock().push(outcome);
                Ok(())
            }
        },
    );

    fine.use_with(ctx(), |_| async { Ok(()) }).await.unwrap();
    fine.use_with(ctx(), |_| async {
        Err::<(), _>(Cause::fail("boom".to_string()))
    })
    .await
    .unwrap_err();

    let outcomes = seen.lock().clone();
    assert_eq!(outcomes[0], Outcome::Success);
    assert_eq!(
        outcomes[1],
        Outcome::Failure(Cause::fail("boom".to_string()))
    );
}

#[tokio::test]
async fn registration_against_a_closed_scope_runs_immediately() {
    let scope = Arc::new(ReleaseMap::<TestError>::new());
    scope
        .release_all(Outcome::Success, ExecStrategy::Sequential)
        .await
        .unwrap();

    let ran = Arc::new(AtomicUsize::new(0));
    let ran_count = ran.clone();
    let finalizer: Finalizer<TestError> = Arc::new(move |_outcome| {
        let ran = ran_count.clone();
        Box::pin(async move {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    });

    let key = scope.add_if_open(finalizer).await.unwrap();
    assert!(key.is_none());
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn parallel_release_overlaps_while_sequential_does_not() {
    async fn teardown_duration(strategy: ExecStrategy) -> Duration {
        let scope = ReleaseMap::<TestError>::new();
        for _ in 0..4 {
            let finalizer: Finalizer<TestError> = Arc::new(|_outcome| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                })
            });
            scope.add_if_open(finalizer).await.unwrap();
        }
        let start = Instant::now();
        scope.release_all(Outcome::Success, strategy).await.unwrap();
        start.elapsed()
    }

    let sequential = teardown_duration(ExecStrategy::Sequential).await;
    let parallel = teardown_duration(ExecStrategy::Parallel).await;

    // Four 50ms finalizers: ~200ms sequentially, ~50ms in parallel.
    assert!(sequential >= Duration::from_millis(180));
    assert!(parallel < Duration::from_millis(150));
}

#[tokio::test]
async fn release_failures_aggregate_with_body_failure() {
    let resource: Managed<u32, TestError> = Managed::acquire_release(
        |_ctx| async { Ok(1) },
        |_value, _outcome| async { Err(Cause::fail("close failed".to_string())) },
    );

    let cause = resource
        .use_with(ctx(), |_| async {
            Err::<(), _>(Cause::fail("body failed".to_string()))
        })
        .await
        .unwrap_err();

    let failures: Vec<String> = cause.failures().into_iter().cloned().collect();
    assert_eq!(
        failures,
        vec!["body failed".to_string(), "close failed".to_string()]
    );
}

#[tokio::test]
async fn forked_acquisition_does_not_outlive_its_scope() {
    let still_running = Arc::new(AtomicUsize::new(0));
    let running = still_running.clone();
    let slow: Managed<u32, TestError> = Managed::from_effect(move |ctx| {
        let running = running.clone();
        async move {
            running.fetch_add(1, Ordering::SeqCst);
            ctx.interruptible(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await?;
            Ok(1)
        }
    });

    let start = Instant::now();
    slow.fork()
        .use_with(ctx(), |_handle| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        })
        .await
        .unwrap();

    // use_with returned, so the finalizer interrupted the background task
    // and waited for it.
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(still_running.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn parallel_zip_failure_releases_the_winning_branch() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let healthy = tracked(&log, "healthy");

    // The failure lands after the healthy branch has finished acquiring.
    let slow_failure: Managed<String, TestError> = Managed::from_effect(|_ctx| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Err(Cause::fail("broken".to_string()))
    });

    let zipped = healthy.zip_with_par(&slow_failure, |a, _b| a);
    let cause = zipped.use_with(ctx(), |_| async { Ok(()) }).await.unwrap_err();

    assert_eq!(cause, Cause::fail("broken".to_string()));
    let entries = log.lock().clone();
    assert!(entries.contains(&"acquire healthy".to_string()));
    assert!(entries.contains(&"release healthy".to_string()));
}
