//! Multi-stage pipelines, tee fan-out, and split boundaries.

use std::sync::{Arc, Mutex};

use tokio::io::AsyncReadExt;

use chute::{Error, ExecBuilder};

fn sh(script: &str) -> ExecBuilder<()> {
    ExecBuilder::new("/bin/sh").arguments(["-c", script])
}

/// 32 × 32 = 1024 `A` bytes from pure POSIX sh.
const KILO_OF_A: &str = "i=0; while [ $i -lt 32 ]; do printf 'AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA'; i=$((i+1)); done";

#[tokio::test]
async fn two_stage_pipeline_transforms_lines() {
    let out = sh("printf 'abc\\ndef\\n'")
        .output()
        .pipe_to("/bin/sh")
        .arguments(["-c", "while read line; do echo \"p:$line\"; done"])
        .output()
        .to_string_list(10, 80)
        .run()
        .await
        .unwrap();
    assert_eq!(out, vec!["p:abc", "p:def"]);
}

#[tokio::test]
async fn three_stage_pipeline_chains_directly() {
    let out = sh("printf '3\\n1\\n2\\n'")
        .pipe_to("/usr/bin/sort")
        .pipe_to("/usr/bin/head")
        .arguments(["-n", "2"])
        .output()
        .to_string_list(10, 80)
        .run()
        .await
        .unwrap();
    assert_eq!(out, vec!["1", "2"]);
}

#[tokio::test]
async fn tee_feeds_two_consumers_the_same_bytes() {
    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));
    let sink1 = Arc::clone(&first);
    let sink2 = Arc::clone(&second);

    sh(KILO_OF_A)
        .output()
        .copy_and_consume_bytes_with(move |mut reader| async move {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await?;
            sink1.lock().unwrap().extend_from_slice(&buf);
            Ok(())
        })
        .consume_bytes_with(move |mut reader| async move {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await?;
            sink2.lock().unwrap().extend_from_slice(&buf);
            Ok(())
        })
        .run()
        .await
        .unwrap();

    let first = first.lock().unwrap();
    let second = second.lock().unwrap();
    assert_eq!(first.len(), 1024);
    assert!(first.iter().all(|&b| b == b'A'));
    assert_eq!(*first, *second);
}

#[tokio::test]
async fn split_boundary_tees_into_the_next_stage() {
    let copied = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&copied);

    // The copy consumer forces the boundary into a split: bytes travel
    // through the parent, feeding both the consumer and the next stage.
    let out = sh("printf 'one\\ntwo\\n'")
        .output()
        .copy_and_consume_bytes_with(move |mut reader| async move {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await?;
            sink.lock().unwrap().extend_from_slice(&buf);
            Ok(())
        })
        .pipe_to("/bin/cat")
        .output()
        .to_string_list(10, 80)
        .run()
        .await
        .unwrap();

    assert_eq!(out, vec!["one", "two"]);
    assert_eq!(String::from_utf8_lossy(&copied.lock().unwrap()), "one\ntwo\n");
}

#[tokio::test]
async fn early_exit_downstream_does_not_wedge_the_pipeline() {
    // head exits after one line; the upstream stage keeps printing into a
    // closing pipe and must still be drained and reaped.
    let out = sh("i=0; while [ $i -lt 500 ]; do echo \"line $i\"; i=$((i+1)); done")
        .pipe_to("/usr/bin/head")
        .arguments(["-n", "1"])
        .output()
        .to_string_list(10, 80)
        .run()
        .await;
    // The upstream stage may exit with SIGPIPE (141), which its default
    // checker reports; the terminal output is intact either way.
    match out {
        Ok(lines) => assert_eq!(lines, vec!["line 0"]),
        Err(e) => {
            let abnormal = e.abnormal_exit().expect("only an abnormal exit is acceptable");
            assert_eq!(abnormal.exit_code, 141);
        }
    }
}

#[tokio::test]
async fn both_stages_failing_aggregates_in_order() {
    let err = sh("exit 2")
        .pipe_to("/bin/sh")
        .arguments(["-c", "exit 3"])
        .run()
        .await
        .unwrap_err();
    match err {
        Error::Pipeline(p) => {
            assert_eq!(p.stages.len(), 2);
            assert_eq!(p.stages[0].abnormal_exit().map(|a| a.exit_code), Some(2));
            assert_eq!(p.stages[1].abnormal_exit().map(|a| a.exit_code), Some(3));
        }
        other => panic!("expected pipeline error, got {other}"),
    }
}

#[tokio::test]
async fn single_failing_stage_raises_process_error() {
    let err = sh("printf 'fine\\n'")
        .pipe_to("/bin/sh")
        .arguments(["-c", "exit 9"])
        .run()
        .await
        .unwrap_err();
    match err {
        Error::Process(p) => {
            assert_eq!(p.abnormal_exit().map(|a| a.exit_code), Some(9));
        }
        other => panic!("expected process error, got {other}"),
    }
}

#[tokio::test]
async fn spawn_failure_mid_pipeline_cleans_up_and_raises() {
    let started = std::time::Instant::now();
    let err = sh("sleep 30")
        .pipe_to("/definitely/not/a/real/binary")
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Spawn(_)));
    // The already-spawned first stage was destroyed, not waited out.
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
}

#[tokio::test]
async fn pipeline_environment_is_inherited_from_previous_stage() {
    let out = sh("true")
        .modify_environment(|env| {
            env.insert("CHUTE_PIPE_MARKER".into(), "carried".into());
        })
        .pipe_to("/bin/sh")
        .arguments(["-c", "printf '%s' \"$CHUTE_PIPE_MARKER\""])
        .output()
        .to_single_string(100)
        .run()
        .await
        .unwrap();
    assert_eq!(out, "carried");
}
