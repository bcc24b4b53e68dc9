//! Pipeline execution: spawning the chain and collecting the outcome.
//!
//! The runner owns the whole execution of one frozen stage list:
//!
//! 1. Validate every stage (argument rules, working directory).
//! 2. Create the per-stage shared state and spawn every task; the tasks
//!    park on the spawn-status gate.
//! 3. Wire pipeline groups: consecutive `pipeline` boundaries get an OS
//!    pipe created up-front, so the group's children are launched with
//!    their endpoints already connected and no bytes pass through user
//!    space. A split boundary instead leaves both sides piped to the
//!    parent and a feeder task bridges them.
//! 4. Spawn the children in stage order. Any failure destroys the
//!    already-spawned peers (descendants first), publishes `Failed` so the
//!    parked tasks exit, and raises a spawn error with the cause.
//! 5. Publish `Started`, join every task, then walk the stages in order
//!    collecting problems into the final result.
//!
//! ## Concurrency
//!
//! Stage endpoints live in a slot mutex and are taken exactly once by the
//! task owning them; the gate guarantees no task observes the slots before
//! they are populated. The runner itself only rejoins the tasks.

pub(crate) mod stage;

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::debug;

use crate::config::{
    ConsumerKind, ErrorTarget, InputDisposition, OutputTarget, StageConfig,
    DEFAULT_HARD_EXIT_TIMEOUT, DEFAULT_SOFT_EXIT_TIMEOUT,
};
use crate::error::{Error, HandlerError, HandlerRole, PipelineError, Problem, ProcessError, Result};
use crate::io::HeadTailGatherer;
use crate::process::{spawn_stage, destroy_process_tree, ProcessHandle, SpawnSpec, StdioSpec};
use stage::{
    file_writer_consumer, gather_consumer, lock, spawn_hook_task, spawn_input_task,
    spawn_stream_tasks, spawn_waiter_task, split_feeder_consumer, SpawnStatus, StageShared,
    StageTask, StdStream, WaiterParams,
};

/// Identity of one stage as configured, used for error reports and the
/// while-running handle.
struct StageIdentity {
    command: PathBuf,
    arguments: Vec<String>,
}

/// Per-stage wiring notes carried from task building to spawning.
struct WiringNotes {
    /// Stdout feeds the next stage's stdin at the OS level.
    pipe_out: bool,
    /// Stdin is fed by the previous stage's stdout at the OS level.
    pipe_in: bool,
    /// Stderr is merged into stdout at the fd level.
    redirect: bool,
}

/// Execute a frozen stage list to completion.
///
/// Returns `Ok(())` on a fully clean run; the terminal stage's typed
/// result travels out of band through the result channel the builder
/// wired into the last stage's output consumer.
pub(crate) async fn run_pipeline(configs: Vec<StageConfig>) -> Result<()> {
    let _section = crate::guard::enter().await;

    let soft_exit_timeout = configs
        .first()
        .map_or(DEFAULT_SOFT_EXIT_TIMEOUT, |c| c.soft_exit_timeout);
    let hard_exit_timeout = configs
        .first()
        .map_or(DEFAULT_HARD_EXIT_TIMEOUT, |c| c.hard_exit_timeout);

    validate(&configs)?;

    let stage_count = configs.len();
    let (status_tx, status_rx) = watch::channel(SpawnStatus::Waiting);
    let shareds: Vec<Arc<StageShared>> = (0..stage_count)
        .map(|_| Arc::new(StageShared::new(status_rx.clone())))
        .collect();

    let mut tasks: Vec<StageTask> = Vec::new();
    let mut specs: Vec<SpawnSpec> = Vec::with_capacity(stage_count);
    let mut identities: Vec<StageIdentity> = Vec::with_capacity(stage_count);
    let mut notes: Vec<WiringNotes> = Vec::with_capacity(stage_count);

    for (k, config) in configs.into_iter().enumerate() {
        let (spec, identity, note) = build_stage(
            k,
            config,
            &shareds,
            soft_exit_timeout,
            hard_exit_timeout,
            &mut tasks,
        );
        specs.push(spec);
        identities.push(identity);
        notes.push(note);
    }

    // Parent-held read ends for stages whose stderr is redirected into a
    // piped stdout.
    let mut parent_stdout: Vec<Option<OwnedFd>> = (0..stage_count).map(|_| None).collect();

    if let Err((k, e)) = wire(&mut specs, &notes, &mut parent_stdout) {
        let _ = status_tx.send(SpawnStatus::Failed);
        join_tasks(tasks, &shareds).await;
        return Err(Error::spawn(&identities[k].command, e));
    }

    // Spawn in stage order; all pipes already exist, so a group's children
    // come up with their endpoints pre-wired.
    let mut children = Vec::with_capacity(stage_count);
    for (k, spec) in specs.into_iter().enumerate() {
        match spawn_stage(spec) {
            Ok(child) => {
                debug!(
                    command = %identities[k].command.display(),
                    pid = child.id().unwrap_or(0),
                    "spawned stage"
                );
                children.push(child);
            }
            Err(e) => {
                let _ = status_tx.send(SpawnStatus::Failed);
                for mut child in children {
                    match child.id() {
                        Some(pid) => destroy_process_tree(pid),
                        None => {
                            let _ = child.start_kill();
                        }
                    }
                    let _ = child.wait().await;
                }
                join_tasks(tasks, &shareds).await;
                return Err(Error::spawn(&identities[k].command, e));
            }
        }
    }

    let mut pids: Vec<Option<u32>> = Vec::with_capacity(stage_count);
    for (k, mut child) in children.into_iter().enumerate() {
        let pid = child.id();
        pids.push(pid);

        let (exit_tx, exit_rx) = watch::channel(None);
        let handle = ProcessHandle::new(
            pid.unwrap_or(0),
            identities[k].command.clone(),
            identities[k].arguments.clone(),
            exit_rx,
        );

        let mut slots = lock(&shareds[k].slots);
        slots.stdin = child
            .stdin
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncWrite + Send + Unpin>);
        slots.stdout = child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>);
        if slots.stdout.is_none() {
            if let Some(fd) = parent_stdout[k].take() {
                match wrap_pipe_read_end(fd) {
                    Ok(reader) => slots.stdout = Some(reader),
                    Err(e) => shareds[k]
                        .record(Problem::Handler(HandlerError::io(HandlerRole::Output, e))),
                }
            }
        }
        slots.stderr = child
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>);
        slots.handle = Some(handle);
        slots.exit_tx = Some(exit_tx);
        slots.child = Some(child);
    }

    let _ = status_tx.send(SpawnStatus::Started);
    debug!(stages = stage_count, "pipeline started");

    join_tasks(tasks, &shareds).await;

    let mut failures: Vec<ProcessError> = Vec::new();
    for (k, identity) in identities.into_iter().enumerate() {
        let problems = shareds[k].take_problems();
        if !problems.is_empty() {
            failures.push(ProcessError {
                command: identity.command,
                arguments: identity.arguments,
                pid: pids[k],
                problems,
            });
        }
    }
    match failures.len() {
        0 => Ok(()),
        1 => match failures.pop() {
            Some(failure) => Err(Error::Process(failure)),
            None => Ok(()),
        },
        _ => Err(Error::Pipeline(PipelineError { stages: failures })),
    }
}

fn validate(configs: &[StageConfig]) -> Result<()> {
    for config in configs {
        config.rule.validate_all(&config.arguments)?;
        if let Some(dir) = &config.directory {
            if !dir.is_dir() {
                return Err(crate::error::ConfigError::new(format!(
                    "working directory `{}` does not exist",
                    dir.display()
                ))
                .into());
            }
        }
    }
    for config in configs.iter().skip(1) {
        debug_assert!(config.input.is_pipeline());
    }
    Ok(())
}

/// Dismantle one stage config into its spawn spec, its identity, and the
/// full task set, all registered against the stage's shared state.
fn build_stage(
    k: usize,
    config: StageConfig,
    shareds: &[Arc<StageShared>],
    soft_exit_timeout: Duration,
    hard_exit_timeout: Duration,
    tasks: &mut Vec<StageTask>,
) -> (SpawnSpec, StageIdentity, WiringNotes) {
    let shared = &shareds[k];
    let stdout_user = config.stdout_in_user_space();
    let stderr_user = config.stderr_in_user_space();

    let StageConfig {
        command,
        arguments,
        rule,
        directory,
        environment,
        input,
        input_charset: _,
        output,
        error,
        soft_exit_timeout: _,
        hard_exit_timeout: _,
        exit_checker,
        while_running,
    } = config;

    if output.capture.gather {
        *lock(&shared.stdout_gather) = Some(HeadTailGatherer::new(
            output.capture.head_limit,
            output.capture.tail_limit,
        ));
    }
    if error.capture.gather {
        *lock(&shared.stderr_gather) = Some(HeadTailGatherer::new(
            error.capture.head_limit,
            error.capture.tail_limit,
        ));
    }

    let mut note = WiringNotes {
        pipe_out: false,
        pipe_in: matches!(input, InputDisposition::Pipeline),
        redirect: matches!(error.target, ErrorTarget::Redirect),
    };

    let stdin_spec = match input {
        InputDisposition::Empty => StdioSpec::Null,
        InputDisposition::Inherit => StdioSpec::Inherit,
        InputDisposition::File(path) => StdioSpec::ReadFile(path),
        InputDisposition::Handler(producer) => {
            tasks.push(spawn_input_task(k, shared, producer));
            StdioSpec::Piped
        }
        // Placeholder; replaced by the group pipe's read end in `wire`.
        InputDisposition::Pipeline => StdioSpec::Null,
        // Fed by the previous stage's split feeder.
        InputDisposition::PipelineSplit => StdioSpec::Piped,
    };

    let mut out_consumers = Vec::new();
    let stdout_spec = if stdout_user {
        match output.target {
            OutputTarget::Handler(consumer) => {
                out_consumers.push((HandlerRole::Output, ConsumerKind::User, consumer));
            }
            OutputTarget::File { path, append } => {
                out_consumers.push((
                    HandlerRole::Output,
                    ConsumerKind::Capture,
                    file_writer_consumer(path, append),
                ));
            }
            OutputTarget::PipelineSplit => {
                out_consumers.push((
                    HandlerRole::Output,
                    ConsumerKind::Capture,
                    split_feeder_consumer(Arc::clone(&shareds[k + 1])),
                ));
            }
            OutputTarget::Discard | OutputTarget::Inherit | OutputTarget::Pipeline => {}
        }
        for (kind, consumer) in output.extra {
            out_consumers.push((HandlerRole::Output, kind, consumer));
        }
        if output.capture.gather {
            out_consumers.push((
                HandlerRole::Output,
                ConsumerKind::Capture,
                gather_consumer(
                    Arc::clone(shared),
                    StdStream::Out,
                    output.capture.max_line_len,
                    output.charset,
                ),
            ));
        }
        StdioSpec::Piped
    } else {
        match output.target {
            OutputTarget::Discard => StdioSpec::Null,
            OutputTarget::Inherit => StdioSpec::Inherit,
            OutputTarget::File { path, append } => StdioSpec::WriteFile { path, append },
            OutputTarget::Pipeline => {
                note.pipe_out = true;
                // Placeholder; replaced by the group pipe's write end.
                StdioSpec::Null
            }
            // Both force user-space handling above.
            OutputTarget::Handler(_) | OutputTarget::PipelineSplit => StdioSpec::Piped,
        }
    };
    spawn_stream_tasks(k, shared, StdStream::Out, out_consumers, tasks);

    let mut err_consumers = Vec::new();
    let stderr_spec = if stderr_user {
        match error.target {
            ErrorTarget::Handler(consumer) => {
                err_consumers.push((HandlerRole::ErrorStream, ConsumerKind::User, consumer));
            }
            ErrorTarget::File { path, append } => {
                err_consumers.push((
                    HandlerRole::ErrorStream,
                    ConsumerKind::Capture,
                    file_writer_consumer(path, append),
                ));
            }
            ErrorTarget::Gather
            | ErrorTarget::Discard
            | ErrorTarget::Inherit
            | ErrorTarget::Redirect => {}
        }
        for (kind, consumer) in error.extra {
            err_consumers.push((HandlerRole::ErrorStream, kind, consumer));
        }
        if error.capture.gather {
            err_consumers.push((
                HandlerRole::ErrorStream,
                ConsumerKind::Capture,
                gather_consumer(
                    Arc::clone(shared),
                    StdStream::Err,
                    error.capture.max_line_len,
                    error.charset,
                ),
            ));
        }
        StdioSpec::Piped
    } else {
        match error.target {
            ErrorTarget::Gather | ErrorTarget::Discard => StdioSpec::Null,
            ErrorTarget::Inherit => StdioSpec::Inherit,
            ErrorTarget::File { path, append } => StdioSpec::WriteFile { path, append },
            // Placeholder; resolved against the stdout spec in `wire`.
            ErrorTarget::Redirect => StdioSpec::Null,
            ErrorTarget::Handler(_) => StdioSpec::Piped,
        }
    };
    spawn_stream_tasks(k, shared, StdStream::Err, err_consumers, tasks);

    tasks.push(spawn_waiter_task(
        k,
        shared,
        WaiterParams {
            soft_exit_timeout,
            hard_exit_timeout,
            exit_checker,
            gather_stdout_on_fail: output.capture.gather,
            log_stderr_on_success: error.capture.log_on_success,
            command: command.clone(),
        },
    ));

    if let Some(hook) = while_running {
        tasks.push(spawn_hook_task(k, shared, hook));
    }

    let mut argv = rule.format(&command, &arguments).into_iter();
    let program = argv.next().unwrap_or_default();
    let spec = SpawnSpec {
        program,
        arguments: argv.collect(),
        directory,
        environment: environment.into_iter().collect(),
        stdin: stdin_spec,
        stdout: stdout_spec,
        stderr: stderr_spec,
    };

    (
        spec,
        StageIdentity {
            command,
            arguments,
        },
        note,
    )
}

/// Create the OS pipes for pipeline groups and resolve stderr redirects.
fn wire(
    specs: &mut [SpawnSpec],
    notes: &[WiringNotes],
    parent_stdout: &mut [Option<OwnedFd>],
) -> std::result::Result<(), (usize, std::io::Error)> {
    for k in 0..specs.len().saturating_sub(1) {
        if notes[k].pipe_out && notes[k + 1].pipe_in {
            let (read_end, write_end) = os_pipe().map_err(|e| (k, e))?;
            specs[k].stdout = StdioSpec::Fd(write_end);
            specs[k + 1].stdin = StdioSpec::Fd(read_end);
        }
    }

    for k in 0..specs.len() {
        if !notes[k].redirect {
            continue;
        }
        let stdout = std::mem::replace(&mut specs[k].stdout, StdioSpec::Null);
        let (stdout, stderr) = match stdout {
            StdioSpec::Piped => {
                // The merged stream must land in one pipe the parent can
                // read, so the pipe is created by hand and its write end
                // duplicated into both child streams.
                let (read_end, write_end) = os_pipe().map_err(|e| (k, e))?;
                let dup = write_end.try_clone().map_err(|e| (k, e))?;
                parent_stdout[k] = Some(read_end);
                (StdioSpec::Fd(write_end), StdioSpec::Fd(dup))
            }
            StdioSpec::Fd(fd) => {
                let dup = fd.try_clone().map_err(|e| (k, e))?;
                (StdioSpec::Fd(fd), StdioSpec::Fd(dup))
            }
            StdioSpec::WriteFile { path, append } => {
                let mut options = std::fs::OpenOptions::new();
                options.write(true).create(true);
                if append {
                    options.append(true);
                } else {
                    options.truncate(true);
                }
                let file = options.open(&path).map_err(|e| (k, e))?;
                let fd = OwnedFd::from(file);
                let dup = fd.try_clone().map_err(|e| (k, e))?;
                (StdioSpec::Fd(fd), StdioSpec::Fd(dup))
            }
            StdioSpec::Inherit => (StdioSpec::Inherit, StdioSpec::Inherit),
            other => (other, StdioSpec::Null),
        };
        specs[k].stdout = stdout;
        specs[k].stderr = stderr;
    }
    Ok(())
}

fn os_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe().map_err(|e| std::io::Error::from_raw_os_error(e as i32))
}

/// Wrap the parent-held read end of a hand-made pipe into an async reader.
fn wrap_pipe_read_end(fd: OwnedFd) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin>> {
    // SAFETY: fd is owned and valid; F_SETFL with O_NONBLOCK has no
    // memory-safety implications.
    let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, libc::O_NONBLOCK) };
    if ret == -1 {
        return Err(std::io::Error::last_os_error());
    }
    let receiver = tokio::net::unix::pipe::Receiver::from_owned_fd(fd)?;
    Ok(Box::new(receiver))
}

async fn join_tasks(tasks: Vec<StageTask>, shareds: &[Arc<StageShared>]) {
    for task in tasks {
        if let Err(e) = task.handle.await {
            if e.is_panic() {
                shareds[task.stage].record(Problem::Handler(HandlerError::new(
                    task.role,
                    format!("{} panicked", task.role),
                )));
            }
        }
    }
}
