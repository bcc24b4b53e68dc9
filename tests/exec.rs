//! Single-process execution against real `/bin/sh` children.

use std::sync::{Arc, Mutex};

use chute::{execute, execute_to_string, Error, ExecBuilder};

fn sh(script: &str) -> ExecBuilder<()> {
    ExecBuilder::new("/bin/sh").arguments(["-c", script])
}

#[tokio::test]
async fn trivial_echo_to_single_string() {
    let out = sh("printf 'hello\\n'")
        .output()
        .to_single_string(100)
        .run()
        .await
        .unwrap();
    assert_eq!(out, "hello\n");
}

#[tokio::test]
async fn empty_input_discard_output_succeeds_quietly() {
    execute("/bin/true", Vec::<String>::new()).await.unwrap();
}

#[tokio::test]
async fn failure_captures_gathered_stderr() {
    let err = sh("printf 'boom\\n' >&2; exit 1").run().await.unwrap_err();
    let abnormal = err.abnormal_exit().expect("abnormal exit report");
    assert_eq!(abnormal.exit_code, 1);
    assert_eq!(abnormal.stderr_lines, vec!["boom"]);
    assert!(!abnormal.soft_timeout_elapsed);
    assert!(!abnormal.hard_timeout_elapsed);
}

#[tokio::test]
async fn head_tail_capture_with_skip_marker() {
    let err = sh("i=1; while [ $i -le 10 ]; do echo \"L$i\" >&2; i=$((i+1)); done; exit 1")
        .error()
        .capture_head_lines(2)
        .capture_tail_lines(2)
        .done()
        .run()
        .await
        .unwrap_err();
    let abnormal = err.abnormal_exit().expect("abnormal exit report");
    assert_eq!(
        abnormal.stderr_lines,
        vec!["L1", "L2", "… (skipped 6 line(s)) …", "L9", "L10"]
    );
}

#[tokio::test]
async fn exit_code_attached_matches_child_status() {
    let err = sh("exit 42").run().await.unwrap_err();
    assert_eq!(err.abnormal_exit().map(|a| a.exit_code), Some(42));
    match err {
        Error::Process(p) => {
            assert!(p.pid.is_some());
            assert_eq!(p.command.to_string_lossy(), "/bin/sh");
        }
        other => panic!("expected process error, got {other}"),
    }
}

#[tokio::test]
async fn custom_exit_code_checker_accepts_nonzero() {
    sh("exit 3")
        .exit_code_checker(|code| code == 3)
        .run()
        .await
        .unwrap();
}

#[tokio::test]
async fn failing_exit_checker_is_recorded_as_problem() {
    let err = sh("exit 0")
        .fallible_exit_code_checker(|_| Err("policy unavailable".into()))
        .run()
        .await
        .unwrap_err();
    match err {
        Error::Process(p) => {
            assert_eq!(p.problems.len(), 1);
            assert!(p.to_string().contains("exit-code checker"));
        }
        other => panic!("expected process error, got {other}"),
    }
}

#[tokio::test]
async fn round_trip_single_string_through_cat() {
    let payload = "line one\nline two\nsome trailing text";
    let out = ExecBuilder::new("/bin/cat")
        .input()
        .from_string(payload)
        .output()
        .to_single_string(payload.len())
        .run()
        .await
        .unwrap();
    assert_eq!(out, payload);
}

#[tokio::test]
async fn round_trip_string_list_through_cat() {
    let lines = vec!["alpha", "beta", "gamma"];
    let out = ExecBuilder::new("/bin/cat")
        .input()
        .from_strings(lines.clone())
        .output()
        .to_string_list(100, 200)
        .run()
        .await
        .unwrap();
    assert_eq!(out, lines);
}

#[tokio::test]
async fn zero_max_chars_yields_empty_string_and_clean_exit() {
    let out = sh("printf 'plenty of output here\\n'")
        .output()
        .to_single_string(0)
        .run()
        .await
        .unwrap();
    assert_eq!(out, "");
}

#[tokio::test]
async fn single_string_cap_discards_excess() {
    let out = sh("printf 'abcdefghij'")
        .output()
        .to_single_string(4)
        .run()
        .await
        .unwrap();
    assert_eq!(out, "abcd");
}

#[tokio::test]
async fn execute_to_string_convenience() {
    let out = execute_to_string("/bin/echo", ["hi"]).await.unwrap();
    assert_eq!(out, "hi\n");
}

#[tokio::test]
async fn redirect_merges_stderr_into_stdout() {
    let out = sh("echo out; echo err >&2")
        .error()
        .redirect()
        .output()
        .to_single_string(100)
        .run()
        .await
        .unwrap();
    assert!(out.contains("out"));
    assert!(out.contains("err"));
}

#[tokio::test]
async fn transfer_output_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    sh("printf 'to file\\n'")
        .output()
        .transfer_to(&path)
        .run()
        .await
        .unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "to file\n");
}

#[tokio::test]
async fn append_output_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log.txt");
    std::fs::write(&path, "first\n").unwrap();
    sh("printf 'second\\n'")
        .output()
        .append_to(&path)
        .run()
        .await
        .unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
}

#[tokio::test]
async fn transfer_output_to_writer() {
    use tokio::io::AsyncReadExt;
    let (writer, mut reader) = tokio::io::duplex(1024);
    let collector = tokio::spawn(async move {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        buf
    });
    sh("printf 'streamed'")
        .output()
        .transfer_to_writer(writer)
        .run()
        .await
        .unwrap();
    assert_eq!(collector.await.unwrap(), b"streamed");
}

#[tokio::test]
async fn copy_consumer_runs_alongside_the_file_target() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("copy.txt");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    sh("printf 'x\\ny\\n'")
        .output()
        .copy_and_consume_lines_with(move |line| sink.lock().unwrap().push(line))
        .transfer_to(&path)
        .run()
        .await
        .unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "x\ny\n");
    assert_eq!(*seen.lock().unwrap(), vec!["x", "y"]);
}

#[tokio::test]
async fn input_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("in.txt");
    std::fs::write(&path, "from a file").unwrap();
    let out = ExecBuilder::new("/bin/cat")
        .input()
        .transfer_from_path(&path)
        .output()
        .to_single_string(100)
        .run()
        .await
        .unwrap();
    assert_eq!(out, "from a file");
}

#[tokio::test]
async fn consume_lines_with_sees_every_line() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    sh("printf 'a\\nb\\nc\\n'")
        .output()
        .consume_lines_with(move |line| sink.lock().unwrap().push(line))
        .run()
        .await
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn failing_output_consumer_is_reported_after_completion() {
    let err = sh("printf 'data\\n'")
        .output()
        .consume_bytes_with(|_reader| async {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "consumer blew up"))
        })
        .run()
        .await
        .unwrap_err();
    match err {
        Error::Process(p) => {
            assert!(p.to_string().contains("output consumer"));
            assert!(p.to_string().contains("consumer blew up"));
        }
        other => panic!("expected process error, got {other}"),
    }
}

#[tokio::test]
async fn while_running_hook_observes_live_process() {
    let observed_pid = Arc::new(Mutex::new(0u32));
    let cell = Arc::clone(&observed_pid);
    sh("sleep 0.1")
        .while_running(move |handle| async move {
            *cell.lock().unwrap() = handle.pid();
            let code = handle.wait().await;
            assert_eq!(code, 0);
            Ok(())
        })
        .run()
        .await
        .unwrap();
    assert!(*observed_pid.lock().unwrap() > 0);
}

#[tokio::test]
async fn log_on_success_does_not_fail_the_run() {
    sh("echo 'just a warning' >&2")
        .error()
        .log_on_success(true)
        .done()
        .run()
        .await
        .unwrap();
}

#[tokio::test]
async fn spawn_failure_raises_spawn_error() {
    let err = execute("/definitely/not/a/real/binary", Vec::<String>::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Spawn(_)));
}

#[tokio::test]
async fn missing_working_directory_is_a_config_error() {
    let err = sh("true")
        .directory("/definitely/not/a/real/directory")
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn input_on_second_stage_is_a_config_error() {
    let err = ExecBuilder::new("/bin/echo")
        .pipe_to("/bin/cat")
        .input()
        .empty()
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn second_output_disposition_is_a_config_error() {
    let err = sh("true")
        .output()
        .discard()
        .output()
        .to_single_string(10)
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn capture_settings_after_processor_are_rejected() {
    let err = sh("true")
        .output()
        .copy_and_consume_bytes_with(|mut reader| async move {
            use tokio::io::AsyncReadExt;
            let mut sink = Vec::new();
            reader.read_to_end(&mut sink).await.map(|_| ())
        })
        .capture_head_lines(3)
        .done()
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn environment_is_passed_to_the_child() {
    let out = sh("printf '%s' \"$CHUTE_TEST_MARKER\"")
        .modify_environment(|env| {
            env.insert("CHUTE_TEST_MARKER".into(), "present".into());
        })
        .output()
        .to_single_string(100)
        .run()
        .await
        .unwrap();
    assert_eq!(out, "present");
}

#[tokio::test]
async fn run_async_completes_in_background() {
    let handle = sh("printf 'bg\\n'")
        .output()
        .to_single_string(100)
        .run_async();
    assert_eq!(handle.await.unwrap().unwrap(), "bg\n");
}
