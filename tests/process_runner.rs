#![cfg(unix)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use drover_lib::migration::runner::{LineHandler, SPAWN_FAILED_CODE};
use drover_lib::migration::tools::ToolCommand;
use drover_lib::migration::ProcessRunner;
use tokio::sync::watch;

fn sh(script: &str) -> ToolCommand {
    ToolCommand {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
    }
}

fn collector() -> (Arc<Mutex<Vec<String>>>, LineHandler) {
    let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let handler: LineHandler = Arc::new(move |text| sink.lock().unwrap().push(text));
    (lines, handler)
}

#[tokio::test]
async fn merges_both_streams_and_redacts_credentials() -> anyhow::Result<()> {
    let runner = ProcessRunner::new(Duration::from_millis(500));
    let (lines, handler) = collector();
    let (_cancel_tx, mut cancel_rx) = watch::channel(false);

    let command = sh(
        "echo connecting to mongodb://user:pw@db:27017/orders; \
         echo oops >&2; \
         echo done",
    );
    let result = runner.run(&command, handler, &mut cancel_rx).await?;

    assert!(result.success());
    assert_eq!(result.exit_code, Some(0));
    let lines = lines.lock().unwrap();
    assert!(lines
        .iter()
        .any(|l| l.contains("mongodb://***:***@db:27017/orders")));
    assert!(!lines.iter().any(|l| l.contains("user:pw")));
    assert!(lines.iter().any(|l| l == "oops"));
    assert!(lines.iter().any(|l| l == "done"));
    Ok(())
}

#[tokio::test]
async fn stdout_line_order_is_preserved() -> anyhow::Result<()> {
    let runner = ProcessRunner::default();
    let (lines, handler) = collector();
    let (_cancel_tx, mut cancel_rx) = watch::channel(false);

    let command = sh("for i in 1 2 3 4 5; do echo line-$i; done");
    runner.run(&command, handler, &mut cancel_rx).await?;

    let lines = lines.lock().unwrap();
    let ordered: Vec<&String> = lines.iter().filter(|l| l.starts_with("line-")).collect();
    let expected: Vec<String> = (1..=5).map(|i| format!("line-{i}")).collect();
    assert_eq!(
        ordered.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
        expected.iter().map(|s| s.as_str()).collect::<Vec<_>>()
    );
    Ok(())
}

#[tokio::test]
async fn non_zero_exit_is_reported_not_swallowed() -> anyhow::Result<()> {
    let runner = ProcessRunner::default();
    let (_, handler) = collector();
    let (_cancel_tx, mut cancel_rx) = watch::channel(false);

    let result = runner
        .run(&sh("echo failing >&2; exit 3"), handler, &mut cancel_rx)
        .await?;
    assert_eq!(result.exit_code, Some(3));
    assert!(!result.signaled);
    assert!(!result.success());
    Ok(())
}

#[tokio::test]
async fn missing_binary_is_a_spawn_error() {
    let runner = ProcessRunner::default();
    let (_, handler) = collector();
    let (_cancel_tx, mut cancel_rx) = watch::channel(false);

    let command = ToolCommand {
        program: "/nonexistent/drover-test-tool".to_string(),
        args: Vec::new(),
    };
    let err = runner
        .run(&command, handler, &mut cancel_rx)
        .await
        .unwrap_err();
    assert_eq!(err.code(), SPAWN_FAILED_CODE);
}

#[tokio::test]
async fn cancellation_terminates_within_the_grace_period() -> anyhow::Result<()> {
    let runner = ProcessRunner::new(Duration::from_secs(5));
    let (lines, handler) = collector();
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = cancel_tx.send(true);
    });

    let started = Instant::now();
    let result = runner
        .run(&sh("echo started; sleep 30"), handler, &mut cancel_rx)
        .await?;

    assert!(result.signaled);
    assert!(!result.success());
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(lines.lock().unwrap().iter().any(|l| l == "started"));
    Ok(())
}

#[tokio::test]
async fn term_resistant_process_is_killed_after_grace() -> anyhow::Result<()> {
    let runner = ProcessRunner::new(Duration::from_millis(300));
    let (_, handler) = collector();
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = cancel_tx.send(true);
    });

    let started = Instant::now();
    let result = runner
        .run(
            &sh("trap '' TERM; echo stubborn; while :; do sleep 1; done"),
            handler,
            &mut cancel_rx,
        )
        .await?;

    assert!(result.signaled);
    // SIGKILL leaves no exit code.
    assert_eq!(result.exit_code, None);
    assert!(started.elapsed() < Duration::from_secs(10));
    Ok(())
}
