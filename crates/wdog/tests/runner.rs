use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use wdog::invoke::{InvokeError, invoke};
use wdog::launcher::{Launcher, LocalExecutor};
use wdog::protocol::{InvocationArgs, RunResult, STATUS_RUNNER_EXITED, STATUS_TIMEOUT_OCCURRED};
use wdog::runner::Runner;

const BUDGET: Duration = Duration::from_secs(5);

fn launcher() -> Arc<dyn Launcher> {
    Arc::new(LocalExecutor::new(env!("CARGO_BIN_EXE_test_runner")))
}

fn args(pairs: &[(&str, &str)]) -> InvocationArgs {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

async fn pid_of(runner: &mut Runner) -> String {
    let result = invoke(runner, &args(&[("mode", "pid")]), BUDGET)
        .await
        .unwrap();
    assert_eq!(result.code, 200);
    result.return_value().to_owned()
}

#[tokio::test]
async fn calls_see_exactly_their_own_output() {
    let mut runner = Runner::launch(launcher(), None).unwrap();
    for i in 0..3 {
        let out = format!("out {i}\n");
        let err = format!("err {i}\n");
        let ret = format!("ret {i}");
        let result = invoke(
            &mut runner,
            &args(&[("out", &out), ("err", &err), ("ret", &ret)]),
            BUDGET,
        )
        .await
        .unwrap();
        assert_eq!(result.code, 200);
        assert_eq!(result.return_value(), ret);
        assert_eq!(result.stdout, out);
        assert_eq!(result.stderr, err);
    }
    assert_eq!(runner.generation(), 0);
}

#[tokio::test]
async fn child_code_is_passed_through() {
    let mut runner = Runner::launch(launcher(), None).unwrap();
    let result = invoke(&mut runner, &args(&[("code", "404"), ("ret", "nope")]), BUDGET)
        .await
        .unwrap();
    assert_eq!(result.code, 404);
    assert_eq!(result.return_value(), "nope");
    assert_eq!(runner.generation(), 0);
}

#[tokio::test]
async fn timeout_kills_and_replaces_runner() {
    let budget = Duration::from_millis(300);
    let mut runner = Runner::launch(launcher(), None).unwrap();
    let before = pid_of(&mut runner).await;

    let started = Instant::now();
    let result = invoke(
        &mut runner,
        &args(&[("mode", "hang"), ("out", "partial")]),
        budget,
    )
    .await
    .unwrap();
    let elapsed = started.elapsed();
    assert_eq!(result.code, STATUS_TIMEOUT_OCCURRED);
    assert_eq!(result.return_value(), "timeout");
    assert_eq!(result.stdout, "partial");
    assert!(elapsed >= budget, "returned after {elapsed:?}");
    assert!(elapsed < budget + Duration::from_secs(5), "returned after {elapsed:?}");

    assert_eq!(runner.generation(), 1);
    assert_ne!(pid_of(&mut runner).await, before);
}

#[tokio::test]
async fn crash_is_reported_and_runner_replaced() {
    let mut runner = Runner::launch(launcher(), None).unwrap();
    let before = pid_of(&mut runner).await;

    let result = invoke(
        &mut runner,
        &args(&[("mode", "exit"), ("out", "last words")]),
        BUDGET,
    )
    .await
    .unwrap();
    assert_eq!(result.code, STATUS_RUNNER_EXITED);
    assert_eq!(result.return_value(), "exited");
    assert_eq!(result.stdout, "last words");

    assert_eq!(runner.generation(), 1);
    assert_ne!(pid_of(&mut runner).await, before);
}

#[tokio::test]
async fn undecodable_reply_restarts_runner() {
    let mut runner = Runner::launch(launcher(), None).unwrap();
    let before = pid_of(&mut runner).await;

    let err = invoke(&mut runner, &args(&[("mode", "garbage")]), BUDGET)
        .await
        .unwrap_err();
    assert!(matches!(err, InvokeError::Transport(_)), "{err:?}");

    // The child that sent it is never handed to the next caller.
    assert_eq!(runner.generation(), 1);
    assert_ne!(pid_of(&mut runner).await, before);
}

#[tokio::test]
async fn concurrent_callers_are_serialized() {
    let runner = Arc::new(Mutex::new(Runner::launch(launcher(), None).unwrap()));
    let calls: Vec<_> = (0..8)
        .map(|i| {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move {
                let id = i.to_string();
                let mut runner = runner.lock().await;
                let result = invoke(
                    &mut runner,
                    &args(&[("mode", "marker"), ("id", &id), ("ms", "20")]),
                    BUDGET,
                )
                .await
                .unwrap();
                (id, result)
            })
        })
        .collect();

    for call in calls {
        let (id, result): (String, RunResult) = call.await.unwrap();
        // Any overlap would put another call's marker between ours.
        assert_eq!(result.stdout, format!("begin {id}\nend {id}\n"));
        assert_eq!(result.return_value(), id);
    }
    assert_eq!(runner.lock().await.generation(), 0);
}

#[tokio::test]
async fn output_larger_than_a_pipe_does_not_stall() {
    let bytes = 1 << 20;
    let mut runner = Runner::launch(launcher(), None).unwrap();
    let result = invoke(
        &mut runner,
        &args(&[("mode", "flood"), ("bytes", &bytes.to_string())]),
        BUDGET,
    )
    .await
    .unwrap();
    assert_eq!(result.code, 200);
    assert_eq!(result.stdout.len(), bytes);
}

#[tokio::test]
async fn suffix_reaches_the_runner() {
    let mut runner = Runner::launch(launcher(), Some("-v2".to_owned())).unwrap();
    let result = invoke(&mut runner, &args(&[("mode", "suffix")]), BUDGET)
        .await
        .unwrap();
    assert_eq!(result.return_value(), "-v2");

    // Replacements keep the variant.
    runner.restart().await.unwrap();
    let result = invoke(&mut runner, &args(&[("mode", "suffix")]), BUDGET)
        .await
        .unwrap();
    assert_eq!(result.return_value(), "-v2");
}

#[tokio::test]
async fn stopped_runner_is_not_ready() {
    let mut runner = Runner::launch(launcher(), None).unwrap();
    assert!(runner.is_ready());
    runner.stop().await;
    assert!(!runner.is_ready());
}
