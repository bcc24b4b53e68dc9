//! Frozen per-stage configuration.
//!
//! [`StageConfig`] is built up by the public builder and consumed by the
//! pipeline runner; once a runner takes it, nothing mutates it. User
//! callbacks are stored type-erased as boxed async closures so a stage
//! config has a single concrete type regardless of what the handlers do;
//! the terminal stage's typed result travels through a oneshot channel
//! wired up by the builder.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::args::ArgumentRule;
use crate::charset::Charset;
use crate::error::BoxError;
use crate::io::{StageReader, StageStdin};
use crate::process::ProcessHandle;

/// Default soft exit timeout applied when none is configured.
pub const DEFAULT_SOFT_EXIT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default hard exit timeout applied when none is configured.
pub const DEFAULT_HARD_EXIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default head lines kept per captured stream.
pub const DEFAULT_CAPTURE_HEAD: usize = 5;
/// Default tail lines kept per captured stream.
pub const DEFAULT_CAPTURE_TAIL: usize = 5;
/// Default maximum captured line length in characters.
pub const DEFAULT_CAPTURE_LINE_LEN: usize = 256;

/// Boxed async input producer: receives the child's stdin and writes to it.
pub(crate) type InputFn =
    Box<dyn FnOnce(StageStdin) -> BoxFuture<'static, io::Result<()>> + Send>;

/// Boxed async stream consumer: receives one readable leg of the child's
/// stdout or stderr.
pub(crate) type ConsumerFn =
    Box<dyn FnOnce(StageReader) -> BoxFuture<'static, io::Result<()>> + Send>;

/// Boxed async while-running hook.
pub(crate) type HookFn =
    Box<dyn FnOnce(ProcessHandle) -> BoxFuture<'static, io::Result<()>> + Send>;

/// Exit-code predicate. `Ok(true)` accepts the code, `Ok(false)` reports
/// an abnormal exit, `Err` is recorded as an exit-checker problem.
pub(crate) type ExitChecker =
    Box<dyn Fn(i32) -> std::result::Result<bool, BoxError> + Send + Sync>;

/// Who a stream consumer belongs to. User consumers must finish before
/// the exit-timeout ladder starts; library capture consumers observe EOF
/// when the child exits (or is destroyed) and are joined after the reap,
/// so a silent long-running child cannot stall the ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConsumerKind {
    User,
    Capture,
}

/// Where a stage's stdin comes from.
pub(crate) enum InputDisposition {
    /// Immediate end of input (the default).
    Empty,
    /// Inherit the parent's stdin.
    Inherit,
    /// Read from a file.
    File(PathBuf),
    /// A user producer writes into the pipe.
    Handler(InputFn),
    /// Wired directly to the previous stage's stdout by the OS.
    Pipeline,
    /// Fed in user space by the previous stage's split feeder.
    PipelineSplit,
}

impl InputDisposition {
    pub(crate) fn is_pipeline(&self) -> bool {
        matches!(self, Self::Pipeline | Self::PipelineSplit)
    }
}

/// The main consumer of a stage's stdout.
pub(crate) enum OutputTarget {
    /// Discard (the default). Becomes the null device unless gathering or
    /// extra consumers force the stream into user space.
    Discard,
    /// Inherit the parent's stdout.
    Inherit,
    /// Write to a file. OS-level redirection when no user-space processing
    /// is needed, a copy task otherwise.
    File { path: PathBuf, append: bool },
    /// A user consumer. When the builder wired a typed result producer,
    /// this is it (wrapped to send through the result channel).
    Handler(ConsumerFn),
    /// Wired directly to the next stage's stdin by the OS.
    Pipeline,
    /// Read in user space and copied into the next stage's stdin, so it
    /// can be teed and gathered on the way.
    PipelineSplit,
}

/// The main consumer of a stage's stderr.
pub(crate) enum ErrorTarget {
    /// No explicit consumer (the default); the stream is still read and
    /// gathered for diagnostics.
    Gather,
    /// Discard without capture.
    Discard,
    /// Inherit the parent's stderr.
    Inherit,
    /// Write to a file.
    File { path: PathBuf, append: bool },
    /// A user consumer.
    Handler(ConsumerFn),
    /// Merge into the stage's stdout at the fd level. Disables stderr
    /// capture, gathering, and log-on-success.
    Redirect,
}

/// Per-stream capture limits.
#[derive(Debug, Clone)]
pub(crate) struct CapturePolicy {
    pub head_limit: usize,
    pub tail_limit: usize,
    pub max_line_len: usize,
    /// Gather this stream for the abnormal-exit report (stdout opts in,
    /// stderr defaults on).
    pub gather: bool,
    /// Log gathered stderr as a warning when the stage succeeds.
    pub log_on_success: bool,
    /// Set once a processor is attached to this stream; capture settings
    /// are rejected afterwards.
    pub locked: bool,
}

impl CapturePolicy {
    fn for_stdout() -> Self {
        Self {
            head_limit: DEFAULT_CAPTURE_HEAD,
            tail_limit: DEFAULT_CAPTURE_TAIL,
            max_line_len: DEFAULT_CAPTURE_LINE_LEN,
            gather: false,
            log_on_success: false,
            locked: false,
        }
    }

    fn for_stderr() -> Self {
        Self {
            gather: true,
            ..Self::for_stdout()
        }
    }
}

/// Full stdout configuration of one stage.
pub(crate) struct OutputSpec {
    pub target: OutputTarget,
    /// Additional tee consumers from `copy_and_*` calls.
    pub extra: Vec<(ConsumerKind, ConsumerFn)>,
    pub capture: CapturePolicy,
    pub charset: Charset,
    /// Whether a disposition was explicitly chosen (a second choice is a
    /// configuration error).
    pub target_set: bool,
}

/// Full stderr configuration of one stage.
pub(crate) struct ErrorSpec {
    pub target: ErrorTarget,
    pub extra: Vec<(ConsumerKind, ConsumerFn)>,
    pub capture: CapturePolicy,
    pub charset: Charset,
    pub target_set: bool,
}

/// One stage of a pipeline, frozen at `run()`.
pub(crate) struct StageConfig {
    pub command: PathBuf,
    pub arguments: Vec<String>,
    pub rule: ArgumentRule,
    pub directory: Option<PathBuf>,
    pub environment: HashMap<String, String>,
    pub input: InputDisposition,
    pub input_charset: Charset,
    pub output: OutputSpec,
    pub error: ErrorSpec,
    /// Pipeline-wide, held on the first stage only.
    pub soft_exit_timeout: Duration,
    /// Pipeline-wide, held on the first stage only.
    pub hard_exit_timeout: Duration,
    pub exit_checker: ExitChecker,
    pub while_running: Option<HookFn>,
}

impl StageConfig {
    /// First-stage config: the environment is a clone of the parent's.
    pub(crate) fn first(command: PathBuf) -> Self {
        Self::with_environment(command, std::env::vars().collect())
    }

    /// Non-first stage config inheriting the previous stage's frozen
    /// environment.
    pub(crate) fn with_environment(
        command: PathBuf,
        environment: HashMap<String, String>,
    ) -> Self {
        let rule = ArgumentRule::for_command(&command);
        Self {
            command,
            arguments: Vec::new(),
            rule,
            directory: None,
            environment,
            input: InputDisposition::Empty,
            input_charset: Charset::default(),
            output: OutputSpec {
                target: OutputTarget::Discard,
                extra: Vec::new(),
                capture: CapturePolicy::for_stdout(),
                charset: Charset::default(),
                target_set: false,
            },
            error: ErrorSpec {
                target: ErrorTarget::Gather,
                extra: Vec::new(),
                capture: CapturePolicy::for_stderr(),
                charset: Charset::default(),
                target_set: false,
            },
            soft_exit_timeout: DEFAULT_SOFT_EXIT_TIMEOUT,
            hard_exit_timeout: DEFAULT_HARD_EXIT_TIMEOUT,
            exit_checker: Box::new(|code| Ok(code == 0)),
            while_running: None,
        }
    }

    /// Whether stdout must be read in user space: any handler, any extra
    /// consumer, gathering, or a split-pipeline boundary.
    pub(crate) fn stdout_in_user_space(&self) -> bool {
        !self.output.extra.is_empty()
            || self.output.capture.gather
            || matches!(
                self.output.target,
                OutputTarget::Handler(_) | OutputTarget::PipelineSplit
            )
    }

    /// Whether stderr must be read in user space: any handler, any extra
    /// consumer, or gathering. Redirect merges the stream away entirely.
    pub(crate) fn stderr_in_user_space(&self) -> bool {
        if matches!(self.error.target, ErrorTarget::Redirect) {
            return false;
        }
        !self.error.extra.is_empty()
            || self.error.capture.gather
            || matches!(self.error.target, ErrorTarget::Handler(_))
    }
}
