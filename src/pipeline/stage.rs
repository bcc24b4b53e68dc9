//! Per-stage runtime state and the task set servicing one child.
//!
//! Every task is spawned before any process exists and parks on the spawn
//! status gate. Tasks decide what to do from the status alone: on
//! `Started` they take their stream endpoint from the now-populated slots,
//! on `Failed` they exit without touching anything.
//!
//! Two counters pace the waiter. The I/O counter tracks user-provided
//! processing (input producers, user consumers); it must reach zero before
//! the exit-timeout ladder starts, so a timeout can never interrupt user
//! processing mid-buffer. The capture counter tracks library-built
//! consumers (gatherers, file writers, split feeders, the tee pump),
//! which observe EOF when the child goes away; the waiter joins them
//! after reaping, before it reads the gathered diagnostics. Keeping them
//! off the I/O counter is what lets the ladder destroy a silent child
//! that would otherwise hold its pipes open forever.
//!
//! ## Task inventory
//!
//! | Task | Created when |
//! |---|---|
//! | input | input disposition is a user producer |
//! | stream main | the stream has exactly one consumer, runs it directly |
//! | tee pump + fan-out | the stream has several consumers |
//! | while-running | a hook is configured |
//! | waiter | always |

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::charset::Charset;
use crate::config::{ConsumerFn, ConsumerKind, ExitChecker, HookFn, InputFn};
use crate::error::{AbnormalExit, HandlerError, HandlerRole, Problem};
use crate::io::{HeadTailGatherer, LineReader, StageReader, StageStdin, Tee, TeeReader};
use crate::process::{self, ProcessHandle};

/// Spawn status published to every task through the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SpawnStatus {
    Waiting,
    Started,
    Failed,
}

/// Which standard stream a consumer set services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StdStream {
    Out,
    Err,
}

/// Counts tasks holding an endpoint of the child; the last release wakes
/// the stage's waiter.
pub(crate) struct IoCounter {
    count: AtomicUsize,
    notify: Notify,
}

impl IoCounter {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    pub(crate) fn add(&self, n: usize) {
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }

    pub(crate) async fn wait_zero(&self) {
        loop {
            // Register before checking so a release in between is not lost.
            let notified = self.notify.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Endpoints and handles of one stage, populated between spawn and the
/// gate release, then taken exactly once by their owning tasks.
#[derive(Default)]
pub(crate) struct StageSlots {
    pub stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub child: Option<Child>,
    pub handle: Option<ProcessHandle>,
    pub exit_tx: Option<watch::Sender<Option<i32>>>,
}

/// State shared between one stage's tasks and the pipeline runner.
pub(crate) struct StageShared {
    pub status: watch::Receiver<SpawnStatus>,
    pub slots: Mutex<StageSlots>,
    /// User-provided processing still holding an endpoint.
    pub io: IoCounter,
    /// Library capture consumers still draining.
    pub capture: IoCounter,
    problems: Mutex<Vec<Problem>>,
    pub stdout_gather: Mutex<Option<HeadTailGatherer>>,
    pub stderr_gather: Mutex<Option<HeadTailGatherer>>,
}

impl StageShared {
    pub(crate) fn new(status: watch::Receiver<SpawnStatus>) -> Self {
        Self {
            status,
            slots: Mutex::new(StageSlots::default()),
            io: IoCounter::new(),
            capture: IoCounter::new(),
            problems: Mutex::new(Vec::new()),
            stdout_gather: Mutex::new(None),
            stderr_gather: Mutex::new(None),
        }
    }

    fn counter(&self, kind: ConsumerKind) -> &IoCounter {
        match kind {
            ConsumerKind::User => &self.io,
            ConsumerKind::Capture => &self.capture,
        }
    }

    pub(crate) fn record(&self, problem: Problem) {
        lock(&self.problems).push(problem);
    }

    pub(crate) fn take_problems(&self) -> Vec<Problem> {
        std::mem::take(&mut *lock(&self.problems))
    }

    fn gather_cell(&self, stream: StdStream) -> &Mutex<Option<HeadTailGatherer>> {
        match stream {
            StdStream::Out => &self.stdout_gather,
            StdStream::Err => &self.stderr_gather,
        }
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Park until the gate leaves `Waiting`; `true` means the processes are up
/// and the slots are populated.
pub(crate) async fn wait_started(rx: &mut watch::Receiver<SpawnStatus>) -> bool {
    loop {
        match *rx.borrow_and_update() {
            SpawnStatus::Started => return true,
            SpawnStatus::Failed => return false,
            SpawnStatus::Waiting => {}
        }
        if rx.changed().await.is_err() {
            return false;
        }
    }
}

/// Releases one counter registration on drop, so a task's registration is
/// paid back on every exit path including panics.
struct IoRelease {
    shared: Arc<StageShared>,
    kind: ConsumerKind,
}

impl IoRelease {
    fn new(shared: Arc<StageShared>, kind: ConsumerKind) -> Self {
        shared.counter(kind).add(1);
        Self { shared, kind }
    }
}

impl Drop for IoRelease {
    fn drop(&mut self) {
        self.shared.counter(self.kind).release();
    }
}

/// One spawned task with enough identity to attribute a panic.
pub(crate) struct StageTask {
    pub stage: usize,
    pub role: HandlerRole,
    pub handle: JoinHandle<()>,
}

/// Spawn the input-producer task. Registers one I/O count for the child's
/// stdin endpoint.
pub(crate) fn spawn_input_task(
    stage: usize,
    shared: &Arc<StageShared>,
    producer: InputFn,
) -> StageTask {
    let release = IoRelease::new(Arc::clone(shared), ConsumerKind::User);
    let shared = Arc::clone(shared);
    let handle = tokio::spawn(async move {
        let _release = release;
        let mut status = shared.status.clone();
        if !wait_started(&mut status).await {
            return;
        }
        let stdin = lock(&shared.slots).stdin.take();
        let Some(stdin) = stdin else { return };
        if let Err(e) = producer(StageStdin::new(stdin)).await {
            shared.record(Problem::Handler(HandlerError::io(HandlerRole::Input, e)));
        }
    });
    StageTask {
        stage,
        role: HandlerRole::Input,
        handle,
    }
}

/// Spawn the tasks servicing one output stream given its consumer set.
///
/// One consumer runs directly over the child's pipe; several consumers
/// get a tee pump plus one fan-out task each. Each task registers on the
/// counter matching its [`ConsumerKind`] before any process is spawned.
pub(crate) fn spawn_stream_tasks(
    stage: usize,
    shared: &Arc<StageShared>,
    stream: StdStream,
    consumers: Vec<(HandlerRole, ConsumerKind, ConsumerFn)>,
    tasks: &mut Vec<StageTask>,
) {
    match consumers.len() {
        0 => {}
        1 => {
            let Some((role, kind, consumer)) = consumers.into_iter().next() else {
                return;
            };
            let release = IoRelease::new(Arc::clone(shared), kind);
            let shared = Arc::clone(shared);
            let handle = tokio::spawn(async move {
                let _release = release;
                let mut status = shared.status.clone();
                if !wait_started(&mut status).await {
                    return;
                }
                let source = take_stream(&shared, stream);
                let Some(source) = source else { return };
                if let Err(e) = consumer(StageReader::new(source)).await {
                    shared.record(Problem::Handler(HandlerError::io(role, e)));
                }
            });
            tasks.push(StageTask {
                stage,
                role,
                handle,
            });
        }
        n => {
            let (tee, readers) = Tee::new(n);

            // Pump task: owns the child's pipe end and feeds the tee. It
            // finishes when the child's stream closes, so it counts as
            // capture work, not user I/O.
            let release = IoRelease::new(Arc::clone(shared), ConsumerKind::Capture);
            let pump_shared = Arc::clone(shared);
            let pump_role = match stream {
                StdStream::Out => HandlerRole::Output,
                StdStream::Err => HandlerRole::ErrorStream,
            };
            let pump = tokio::spawn(async move {
                let _release = release;
                let mut status = pump_shared.status.clone();
                if !wait_started(&mut status).await {
                    return;
                }
                let source = take_stream(&pump_shared, stream);
                let Some(source) = source else { return };
                tee.run(StageReader::new(source)).await;
            });
            tasks.push(StageTask {
                stage,
                role: pump_role,
                handle: pump,
            });

            for ((role, kind, consumer), reader) in consumers.into_iter().zip(readers) {
                tasks.push(spawn_fanout_task(stage, shared, role, kind, consumer, reader));
            }
        }
    }
}

fn spawn_fanout_task(
    stage: usize,
    shared: &Arc<StageShared>,
    role: HandlerRole,
    kind: ConsumerKind,
    consumer: ConsumerFn,
    reader: TeeReader,
) -> StageTask {
    let release = IoRelease::new(Arc::clone(shared), kind);
    let shared = Arc::clone(shared);
    let handle = tokio::spawn(async move {
        let _release = release;
        let mut status = shared.status.clone();
        if !wait_started(&mut status).await {
            return;
        }
        if let Err(e) = consumer(StageReader::new(Box::new(reader))).await {
            shared.record(Problem::Handler(HandlerError::io(role, e)));
        }
    });
    StageTask {
        stage,
        role,
        handle,
    }
}

fn take_stream(
    shared: &StageShared,
    stream: StdStream,
) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
    let mut slots = lock(&shared.slots);
    match stream {
        StdStream::Out => slots.stdout.take(),
        StdStream::Err => slots.stderr.take(),
    }
}

/// Spawn the while-running hook task.
pub(crate) fn spawn_hook_task(
    stage: usize,
    shared: &Arc<StageShared>,
    hook: HookFn,
) -> StageTask {
    let shared = Arc::clone(shared);
    let handle = tokio::spawn(async move {
        let mut status = shared.status.clone();
        if !wait_started(&mut status).await {
            return;
        }
        let handle = lock(&shared.slots).handle.clone();
        let Some(handle) = handle else { return };
        if let Err(e) = hook(handle).await {
            shared.record(Problem::Handler(HandlerError::io(
                HandlerRole::WhileRunning,
                e,
            )));
        }
    });
    StageTask {
        stage,
        role: HandlerRole::WhileRunning,
        handle,
    }
}

/// Everything the waiter needs beyond the shared state.
pub(crate) struct WaiterParams {
    pub soft_exit_timeout: Duration,
    pub hard_exit_timeout: Duration,
    pub exit_checker: ExitChecker,
    /// Include gathered stdout in the abnormal-exit report.
    pub gather_stdout_on_fail: bool,
    /// Warn with gathered stderr when the stage succeeds.
    pub log_stderr_on_success: bool,
    pub command: std::path::PathBuf,
}

/// Spawn the waiter: joins the stage's I/O, walks the exit-timeout ladder,
/// reaps the child, and runs the exit-code checker.
pub(crate) fn spawn_waiter_task(
    stage: usize,
    shared: &Arc<StageShared>,
    params: WaiterParams,
) -> StageTask {
    let shared = Arc::clone(shared);
    let handle = tokio::spawn(async move {
        let mut status = shared.status.clone();
        if !wait_started(&mut status).await {
            return;
        }
        shared.io.wait_zero().await;

        let (child, handle, exit_tx) = {
            let mut slots = lock(&shared.slots);
            (
                slots.child.take(),
                slots.handle.take(),
                slots.exit_tx.take(),
            )
        };
        let (Some(mut child), Some(handle), Some(exit_tx)) = (child, handle, exit_tx) else {
            return;
        };

        let mut soft_elapsed = false;
        let mut hard_elapsed = false;

        let still_running = matches!(child.try_wait(), Ok(None));
        if still_running
            && tokio::time::timeout(params.soft_exit_timeout, child.wait())
                .await
                .is_err()
        {
            soft_elapsed = true;
            debug!(pid = handle.pid(), "soft exit timeout elapsed, terminating");
            handle.terminate();

            if tokio::time::timeout(params.hard_exit_timeout, child.wait())
                .await
                .is_err()
            {
                hard_elapsed = true;
                debug!(pid = handle.pid(), "hard exit timeout elapsed, destroying");
                // The descendant set must be captured before the kill;
                // killing the child reparents them out of reach.
                process::destroy_process_tree(handle.pid());
            }
        }

        let exit_code = match child.wait().await {
            Ok(status) => process::exit_code_of(status),
            Err(e) => {
                shared.record(Problem::Handler(HandlerError::io(
                    HandlerRole::ExitChecker,
                    e,
                )));
                let _ = exit_tx.send(Some(-1));
                return;
            }
        };
        let _ = exit_tx.send(Some(exit_code));

        // The child is gone, so the capture consumers are observing EOF;
        // join them before reading the gathered diagnostics.
        shared.capture.wait_zero().await;

        match (params.exit_checker)(exit_code) {
            Err(e) => {
                shared.record(Problem::Handler(HandlerError::new(
                    HandlerRole::ExitChecker,
                    e,
                )));
            }
            Ok(false) => {
                let stderr_lines = lock(&shared.stderr_gather)
                    .take()
                    .map(HeadTailGatherer::into_lines)
                    .unwrap_or_default();
                let stdout_lines = if params.gather_stdout_on_fail {
                    lock(&shared.stdout_gather)
                        .take()
                        .map(HeadTailGatherer::into_lines)
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };
                shared.record(Problem::AbnormalExit(AbnormalExit {
                    exit_code,
                    soft_timeout_elapsed: soft_elapsed,
                    hard_timeout_elapsed: hard_elapsed,
                    stderr_lines,
                    stdout_lines,
                }));
            }
            Ok(true) => {
                if params.log_stderr_on_success {
                    let gathered = lock(&shared.stderr_gather)
                        .take()
                        .filter(|g| !g.is_empty())
                        .map(HeadTailGatherer::into_lines);
                    if let Some(lines) = gathered {
                        warn!(
                            command = %params.command.display(),
                            pid = handle.pid(),
                            stderr = %lines.join("\n"),
                            "process succeeded with error output"
                        );
                    }
                }
            }
        }
    });
    StageTask {
        stage,
        role: HandlerRole::ExitChecker,
        handle,
    }
}

/// Library-built consumer writing the stream to a file, used when the
/// stream also has tee consumers and cannot be redirected at the fd level.
pub(crate) fn file_writer_consumer(path: std::path::PathBuf, append: bool) -> ConsumerFn {
    Box::new(move |mut reader| {
        Box::pin(async move {
            let mut options = tokio::fs::OpenOptions::new();
            options.write(true).create(true);
            if append {
                options.append(true);
            } else {
                options.truncate(true);
            }
            let mut file = options.open(&path).await?;
            tokio::io::copy(&mut reader, &mut file).await?;
            Ok(())
        })
    })
}

/// Library-built consumer feeding lines into the stage's gatherer cell.
pub(crate) fn gather_consumer(
    shared: Arc<StageShared>,
    stream: StdStream,
    max_line_len: usize,
    charset: Charset,
) -> ConsumerFn {
    Box::new(move |reader| {
        Box::pin(async move {
            let mut lines = LineReader::new(reader, max_line_len, charset);
            while let Some(line) = lines.next_line().await? {
                if let Some(g) = lock(shared.gather_cell(stream)).as_mut() {
                    g.push(line);
                }
            }
            Ok(())
        })
    })
}

/// Library-built consumer bridging a split-pipeline boundary: copies the
/// upstream stage's stdout into the downstream stage's stdin.
///
/// Holds an I/O registration on the downstream stage (its stdin endpoint)
/// which is released once the copy finishes and the pipe is closed. A
/// broken pipe from the downstream child exiting early is normal pipeline
/// behavior, not a problem; the remaining upstream output is drained so
/// sibling tee consumers are not stalled.
pub(crate) fn split_feeder_consumer(next: Arc<StageShared>) -> ConsumerFn {
    // Register the downstream stdin endpoint now, before spawn; the guard
    // travels with the closure so the count is paid back even if the
    // closure is dropped unrun.
    let downstream = IoRelease::new(Arc::clone(&next), ConsumerKind::Capture);
    Box::new(move |mut reader| {
        Box::pin(async move {
            let _downstream = downstream;
            let stdin = lock(&next.slots).stdin.take();
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match tokio::io::copy(&mut reader, &mut stdin).await {
                Ok(_) => {
                    let _ = stdin.shutdown().await;
                    drop(stdin);
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    drop(stdin);
                    let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
    })
}
