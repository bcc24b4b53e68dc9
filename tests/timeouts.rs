//! Exit-timeout ladder behavior against children that will not leave.

use std::time::{Duration, Instant};

use chute::{Error, ExecBuilder};

fn sh(script: &str) -> ExecBuilder<()> {
    ExecBuilder::new("/bin/sh").arguments(["-c", script])
}

#[tokio::test]
async fn soft_timeout_terminates_a_sleeping_child() {
    let err = sh("sleep 30")
        .soft_exit_timeout(Duration::from_millis(100))
        .hard_exit_timeout(Duration::from_secs(10))
        .run()
        .await
        .unwrap_err();
    let abnormal = err.abnormal_exit().expect("abnormal exit report");
    assert!(abnormal.soft_timeout_elapsed);
    assert!(!abnormal.hard_timeout_elapsed);
    // SIGTERM death reported with the shell convention.
    assert_eq!(abnormal.exit_code, 128 + 15);
}

#[tokio::test]
async fn hard_timeout_destroys_a_term_ignoring_child() {
    let started = Instant::now();
    let err = sh("trap '' TERM; sleep 100")
        .soft_exit_timeout(Duration::from_millis(50))
        .hard_exit_timeout(Duration::from_millis(100))
        .run()
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    let pid = match &err {
        Error::Process(p) => p.pid.expect("pid recorded"),
        other => panic!("expected process error, got {other}"),
    };
    let abnormal = err.abnormal_exit().expect("abnormal exit report");
    assert!(abnormal.soft_timeout_elapsed);
    assert!(abnormal.hard_timeout_elapsed);
    assert_eq!(abnormal.exit_code, 128 + 9);

    // The child is gone from the process table (it was reaped, so the
    // existence probe must fail).
    let probe = unsafe { libc::kill(pid as i32, 0) };
    assert_eq!(probe, -1);

    assert!(
        elapsed < Duration::from_secs(5),
        "ladder took {elapsed:?}, expected well under the sleep duration"
    );
}

#[tokio::test]
async fn zero_timeouts_mean_immediate_forced_termination() {
    let started = Instant::now();
    let err = sh("trap '' TERM; sleep 30")
        .soft_exit_timeout(Duration::ZERO)
        .hard_exit_timeout(Duration::ZERO)
        .run()
        .await
        .unwrap_err();
    let abnormal = err.abnormal_exit().expect("abnormal exit report");
    assert!(abnormal.soft_timeout_elapsed);
    assert!(abnormal.hard_timeout_elapsed);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn fast_child_never_sees_the_ladder() {
    sh("true")
        .soft_exit_timeout(Duration::from_secs(5))
        .hard_exit_timeout(Duration::from_secs(30))
        .run()
        .await
        .unwrap();
}

#[tokio::test]
async fn timeouts_on_a_later_stage_are_rejected() {
    let err = sh("true")
        .pipe_to("/bin/cat")
        .soft_exit_timeout(Duration::from_secs(1))
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
