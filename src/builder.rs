//! The public configuration surface: [`ExecBuilder`] and its stream views.
//!
//! A builder describes one stage; `pipe_to` freezes it and opens the next.
//! The builder is parameterized by the pipeline's result type `O`, fixed by
//! whichever terminal output method is chosen: `to_single_string` turns an
//! `ExecBuilder<()>` into an `ExecBuilder<String>`, `process_with` into the
//! handler's type, and so on. Only the terminal stage can carry a result,
//! which the type parameter enforces at compile time.
//!
//! Configuration mistakes that the type system cannot catch (a second
//! output disposition, capture settings after a processor was attached,
//! input on a non-first stage) are deferred: the first one is remembered
//! and reported as a [`ConfigError`] when `run()` is called, keeping the
//! chained-call style intact.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::charset::{Charset, Decoder};
use crate::config::{
    ConsumerFn, ConsumerKind, ErrorTarget, InputDisposition, OutputTarget, StageConfig,
};
use crate::error::{BoxError, ConfigError, Error, Result};
use crate::io::{LineReader, StageReader, StageStdin, StageWriter};
use crate::pipeline::run_pipeline;
use crate::pipeline::stage::file_writer_consumer;
use crate::process::ProcessHandle;

/// Capture limit used by [`execute_to_string`].
pub const DEFAULT_STRING_CAPTURE: usize = 65_536;

/// Run a command to completion with no captured output.
///
/// Standard input is empty, stdout is discarded, stderr is gathered for
/// the error report. Raises on abnormal exit.
pub async fn execute(
    command: impl Into<PathBuf>,
    arguments: impl IntoIterator<Item = impl Into<String>>,
) -> Result<()> {
    ExecBuilder::new(command).arguments(arguments).run().await
}

/// Run a command and return its standard output as one string, capped at
/// [`DEFAULT_STRING_CAPTURE`] characters. Output beyond the cap is read
/// and discarded so the child can exit normally.
pub async fn execute_to_string(
    command: impl Into<PathBuf>,
    arguments: impl IntoIterator<Item = impl Into<String>>,
) -> Result<String> {
    ExecBuilder::new(command)
        .arguments(arguments)
        .output()
        .to_single_string(DEFAULT_STRING_CAPTURE)
        .run()
        .await
}

/// How the pipeline's typed result is produced at run time.
enum ResultMode<O> {
    /// No result consumer; the value is produced directly (unit).
    Immediate(Box<dyn FnOnce() -> O + Send>),
    /// The terminal stage's output is processed into the value.
    Consume(Box<dyn FnOnce(StageReader) -> BoxFuture<'static, io::Result<O>> + Send>),
}

/// Builder for a process or pipeline execution returning `O`.
pub struct ExecBuilder<O = ()> {
    stages: Vec<StageConfig>,
    current: StageConfig,
    result: ResultMode<O>,
    deferred: Option<ConfigError>,
}

impl ExecBuilder<()> {
    /// Start configuring a process running `command`.
    ///
    /// The stage starts with empty input, discarded output, gathered
    /// stderr, the `code == 0` exit checker, and the default exit
    /// timeouts; the environment is a copy of the parent's.
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            stages: Vec::new(),
            current: StageConfig::first(command.into()),
            result: ResultMode::Immediate(Box::new(|| ())),
            deferred: None,
        }
    }

    /// Freeze this stage and open the next one, connecting this stage's
    /// stdout to the next stage's stdin.
    ///
    /// When this stage's stdout needs user-space handling (tee copies or
    /// gather-on-fail), the boundary becomes a split point: the bytes are
    /// routed through the parent. Otherwise the two children are connected
    /// directly by an OS pipe.
    pub fn pipe_to(mut self, command: impl Into<PathBuf>) -> ExecBuilder<()> {
        if self.current.output.target_set {
            self.defer("cannot pipe: this stage's output is already configured");
        }
        let split = self.current.stdout_in_user_space();
        self.current.output.target = if split {
            OutputTarget::PipelineSplit
        } else {
            OutputTarget::Pipeline
        };
        self.current.output.target_set = true;

        let mut next = StageConfig::with_environment(
            command.into(),
            self.current.environment.clone(),
        );
        next.input = if split {
            InputDisposition::PipelineSplit
        } else {
            InputDisposition::Pipeline
        };
        self.stages.push(std::mem::replace(&mut self.current, next));
        self
    }

    fn with_result<T>(self, result: ResultMode<T>) -> ExecBuilder<T> {
        ExecBuilder {
            stages: self.stages,
            current: self.current,
            result,
            deferred: self.deferred,
        }
    }
}

impl<O> ExecBuilder<O> {
    /// Replace the argument vector.
    pub fn arguments(
        mut self,
        arguments: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.current.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    /// Set the working directory. It must exist on the host filesystem.
    pub fn directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.current.directory = Some(directory.into());
        self
    }

    /// Replace the whole environment of this stage.
    pub fn environment(mut self, environment: HashMap<String, String>) -> Self {
        self.current.environment = environment;
        self
    }

    /// Mutate this stage's environment in place.
    pub fn modify_environment(
        mut self,
        modify: impl FnOnce(&mut HashMap<String, String>),
    ) -> Self {
        modify(&mut self.current.environment);
        self
    }

    /// Replace the exit-code predicate (default: `code == 0`).
    pub fn exit_code_checker(
        mut self,
        checker: impl Fn(i32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.current.exit_checker = Box::new(move |code| Ok(checker(code)));
        self
    }

    /// Replace the exit-code predicate with a fallible one. An `Err` is
    /// recorded as an exit-checker problem rather than an abnormal exit.
    pub fn fallible_exit_code_checker(
        mut self,
        checker: impl Fn(i32) -> std::result::Result<bool, BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.current.exit_checker = Box::new(checker);
        self
    }

    /// Run a hook concurrently with the child. The hook receives a
    /// [`ProcessHandle`] for identity, liveness, and termination.
    pub fn while_running<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce(ProcessHandle) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = io::Result<()>> + Send + 'static,
    {
        self.current.while_running = Some(Box::new(move |handle| Box::pin(hook(handle))));
        self
    }

    /// Time allowed between I/O draining and graceful termination.
    /// Pipeline-wide; only valid on the first stage.
    pub fn soft_exit_timeout(mut self, timeout: std::time::Duration) -> Self {
        if self.stages.is_empty() {
            self.current.soft_exit_timeout = timeout;
        } else {
            self.defer("exit timeouts are pipeline-wide and belong on the first stage");
        }
        self
    }

    /// Time allowed after graceful termination before the child and its
    /// descendants are destroyed. Pipeline-wide; only valid on the first
    /// stage.
    pub fn hard_exit_timeout(mut self, timeout: std::time::Duration) -> Self {
        if self.stages.is_empty() {
            self.current.hard_exit_timeout = timeout;
        } else {
            self.defer("exit timeouts are pipeline-wide and belong on the first stage");
        }
        self
    }

    /// Configure standard input. Only valid on the first stage; later
    /// stages are fed by their predecessor.
    pub fn input(self) -> InputView<O> {
        InputView { b: self }
    }

    /// Configure standard output.
    pub fn output(self) -> OutputView<O> {
        OutputView { b: self }
    }

    /// Configure standard error.
    pub fn error(self) -> ErrorView<O> {
        ErrorView { b: self }
    }

    fn defer(&mut self, message: &str) {
        if self.deferred.is_none() {
            self.deferred = Some(ConfigError::new(message));
        }
    }

    fn set_input(&mut self, disposition: InputDisposition) {
        if self.stages.is_empty() {
            self.current.input = disposition;
        } else {
            self.defer("input can only be configured on the first stage of a pipeline");
        }
    }

    fn set_output_target(&mut self, target: OutputTarget, locks_capture: bool) {
        if self.current.output.target_set {
            self.defer(
                "output disposition already configured; use a copy_and_ variant for \
                 additional consumers",
            );
            return;
        }
        self.current.output.target_set = true;
        if locks_capture {
            self.current.output.capture.locked = true;
        }
        self.current.output.target = target;
    }

    fn set_error_target(&mut self, target: ErrorTarget, locks_capture: bool) {
        if self.current.error.target_set {
            self.defer(
                "error disposition already configured; use a copy_and_ variant for \
                 additional consumers",
            );
            return;
        }
        self.current.error.target_set = true;
        if locks_capture {
            self.current.error.capture.locked = true;
        }
        self.current.error.target = target;
    }
}

impl<O: Send + 'static> ExecBuilder<O> {
    /// Execute the pipeline to completion.
    ///
    /// Returns the terminal stage's result on success. After this returns
    /// (or raises), every child started by this invocation has exited and
    /// every pipe endpoint owned by the library is closed.
    pub async fn run(self) -> Result<O> {
        let ExecBuilder {
            mut stages,
            mut current,
            result,
            deferred,
        } = self;
        if let Some(e) = deferred {
            return Err(e.into());
        }

        let (immediate, receiver) = match result {
            ResultMode::Immediate(value) => (Some(value), None),
            ResultMode::Consume(process) => {
                let (tx, rx) = oneshot::channel::<O>();
                let consumer: ConsumerFn = Box::new(move |reader| {
                    Box::pin(async move {
                        let value = process(reader).await?;
                        let _ = tx.send(value);
                        Ok(())
                    })
                });
                current.output.target = OutputTarget::Handler(consumer);
                (None, Some(rx))
            }
        };

        stages.push(current);
        run_pipeline(stages).await?;

        match (immediate, receiver) {
            (Some(value), _) => Ok(value()),
            (None, Some(mut rx)) => rx.try_recv().map_err(|_| {
                Error::Config(ConfigError::new(
                    "result consumer completed without producing a value",
                ))
            }),
            (None, None) => Err(Error::Config(ConfigError::new("no result configured"))),
        }
    }

    /// Execute the pipeline on a background task, returning immediately.
    pub fn run_async(self) -> tokio::task::JoinHandle<Result<O>> {
        tokio::spawn(self.run())
    }
}

/// Standard input configuration of the first stage.
pub struct InputView<O> {
    b: ExecBuilder<O>,
}

impl<O> InputView<O> {
    /// Return to the builder without changing the disposition.
    pub fn done(self) -> ExecBuilder<O> {
        self.b
    }

    /// Character handling for text-producing input methods.
    pub fn charset(mut self, charset: Charset) -> Self {
        self.b.current.input_charset = charset;
        self
    }

    /// Use the platform-native character handling.
    pub fn native_charset(self) -> Self {
        self.charset(crate::util::native_charset())
    }

    /// The child reads immediate end of input (the default).
    pub fn empty(mut self) -> ExecBuilder<O> {
        self.b.set_input(InputDisposition::Empty);
        self.b
    }

    /// The child inherits the parent's stdin.
    pub fn inherited(mut self) -> ExecBuilder<O> {
        self.b.set_input(InputDisposition::Inherit);
        self.b
    }

    /// Feed the child a single string.
    pub fn from_string(mut self, input: impl Into<String>) -> ExecBuilder<O> {
        let input = input.into();
        self.b.set_input(InputDisposition::Handler(Box::new(move |mut w| {
            Box::pin(async move {
                ok_if_broken_pipe(w.write_str(&input).await)?;
                ok_if_broken_pipe(w.close().await)
            })
        })));
        self.b
    }

    /// Feed the child one line per string.
    pub fn from_strings(
        mut self,
        lines: impl IntoIterator<Item = impl Into<String>>,
    ) -> ExecBuilder<O> {
        let lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        self.b.set_input(InputDisposition::Handler(Box::new(move |mut w| {
            Box::pin(async move {
                for line in &lines {
                    ok_if_broken_pipe(w.write_line(line).await)?;
                }
                ok_if_broken_pipe(w.close().await)
            })
        })));
        self.b
    }

    /// The child reads from a file.
    pub fn transfer_from_path(mut self, path: impl Into<PathBuf>) -> ExecBuilder<O> {
        self.b.set_input(InputDisposition::File(path.into()));
        self.b
    }

    /// Copy an async reader into the child's stdin. The reader is read to
    /// end of stream (or until the child stops accepting input) and then
    /// dropped.
    pub fn transfer_from<R>(mut self, reader: R) -> ExecBuilder<O>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.b.set_input(InputDisposition::Handler(Box::new(move |mut w| {
            Box::pin(async move {
                let mut reader = reader;
                ok_if_broken_pipe(tokio::io::copy(&mut reader, &mut w).await.map(|_| ()))?;
                ok_if_broken_pipe(w.close().await)
            })
        })));
        self.b
    }

    /// Produce the child's input with an async byte-stream callback.
    pub fn produce_bytes_with<F, Fut>(mut self, producer: F) -> ExecBuilder<O>
    where
        F: FnOnce(StageStdin) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = io::Result<()>> + Send + 'static,
    {
        self.b.set_input(InputDisposition::Handler(Box::new(move |w| {
            Box::pin(producer(w))
        })));
        self.b
    }

    /// Produce the child's input with a text-oriented callback.
    pub fn produce_with<F, Fut>(mut self, producer: F) -> ExecBuilder<O>
    where
        F: FnOnce(StageWriter) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = io::Result<()>> + Send + 'static,
    {
        self.b.set_input(InputDisposition::Handler(Box::new(move |w| {
            Box::pin(producer(StageWriter::new(w)))
        })));
        self.b
    }
}

/// Standard output configuration of one stage.
pub struct OutputView<O> {
    b: ExecBuilder<O>,
}

impl<O> OutputView<O> {
    /// Return to the builder without changing the disposition.
    pub fn done(self) -> ExecBuilder<O> {
        self.b
    }

    /// Character handling for captured and processed output.
    pub fn charset(mut self, charset: Charset) -> Self {
        self.tune(|c| c.output.charset = charset);
        self
    }

    /// Include gathered stdout in the abnormal-exit report.
    pub fn gather_on_fail(mut self, enabled: bool) -> Self {
        self.tune(|c| c.output.capture.gather = enabled);
        self
    }

    /// Head lines kept when gathering stdout.
    pub fn capture_head_lines(mut self, lines: usize) -> Self {
        self.tune(|c| c.output.capture.head_limit = lines);
        self
    }

    /// Tail lines kept when gathering stdout.
    pub fn capture_tail_lines(mut self, lines: usize) -> Self {
        self.tune(|c| c.output.capture.tail_limit = lines);
        self
    }

    /// Maximum length of a gathered line in characters (at least 1).
    pub fn max_capture_line_length(mut self, length: usize) -> Self {
        if length == 0 {
            self.b.defer("max capture line length must be at least 1");
        } else {
            self.tune(|c| c.output.capture.max_line_len = length);
        }
        self
    }

    /// Add a tee consumer receiving a copy of the byte stream, keeping the
    /// disposition open for further configuration.
    pub fn copy_and_consume_bytes_with<F, Fut>(mut self, consumer: F) -> Self
    where
        F: FnOnce(StageReader) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = io::Result<()>> + Send + 'static,
    {
        self.b.current.output.capture.locked = true;
        self.b.current.output.extra.push((
            ConsumerKind::User,
            Box::new(move |r| Box::pin(consumer(r))),
        ));
        self
    }

    /// Add a tee consumer writing a copy of the stream to a file.
    pub fn copy_and_transfer_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.b.current.output.capture.locked = true;
        self.b.current.output.extra.push((
            ConsumerKind::Capture,
            file_writer_consumer(path.into(), false),
        ));
        self
    }

    /// Add a tee consumer appending a copy of the stream to a file.
    pub fn copy_and_append_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.b.current.output.capture.locked = true;
        self.b.current.output.extra.push((
            ConsumerKind::Capture,
            file_writer_consumer(path.into(), true),
        ));
        self
    }

    /// Add a tee consumer receiving a copy of the output line by line.
    pub fn copy_and_consume_with<F, Fut>(mut self, consumer: F) -> Self
    where
        F: FnOnce(LineReader<StageReader>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = io::Result<()>> + Send + 'static,
    {
        let max_line_len = self.b.current.output.capture.max_line_len;
        let charset = self.b.current.output.charset;
        self.b.current.output.capture.locked = true;
        self.b.current.output.extra.push((
            ConsumerKind::User,
            Box::new(move |r| Box::pin(consumer(LineReader::new(r, max_line_len, charset)))),
        ));
        self
    }

    /// Add a tee consumer invoking a callback for every line of output.
    pub fn copy_and_consume_lines_with<F>(mut self, mut consumer: F) -> Self
    where
        F: FnMut(String) + Send + 'static,
    {
        let max_line_len = self.b.current.output.capture.max_line_len;
        let charset = self.b.current.output.charset;
        self.b.current.output.capture.locked = true;
        self.b.current.output.extra.push((
            ConsumerKind::User,
            Box::new(move |r| {
                Box::pin(async move {
                    let mut lines = LineReader::new(r, max_line_len, charset);
                    while let Some(line) = lines.next_line().await? {
                        consumer(line);
                    }
                    Ok(())
                })
            }),
        ));
        self
    }

    fn tune(&mut self, apply: impl FnOnce(&mut StageConfig)) {
        if self.b.current.output.capture.locked {
            self.b
                .defer("output capture settings must be set before attaching a processor");
        } else {
            apply(&mut self.b.current);
        }
    }
}

impl OutputView<()> {
    /// Discard the child's output (the default).
    pub fn discard(mut self) -> ExecBuilder<()> {
        self.b.set_output_target(OutputTarget::Discard, false);
        self.b
    }

    /// The child inherits the parent's stdout.
    pub fn inherited(mut self) -> ExecBuilder<()> {
        self.b.set_output_target(OutputTarget::Inherit, false);
        self.b
    }

    /// Write the output to a file, truncating it first.
    pub fn transfer_to(mut self, path: impl Into<PathBuf>) -> ExecBuilder<()> {
        self.b.set_output_target(
            OutputTarget::File {
                path: path.into(),
                append: false,
            },
            true,
        );
        self.b
    }

    /// Append the output to a file.
    pub fn append_to(mut self, path: impl Into<PathBuf>) -> ExecBuilder<()> {
        self.b.set_output_target(
            OutputTarget::File {
                path: path.into(),
                append: true,
            },
            true,
        );
        self.b
    }

    /// Copy the output into an async writer, flushing at end of stream.
    pub fn transfer_to_writer<W>(mut self, writer: W) -> ExecBuilder<()>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.b.set_output_target(
            OutputTarget::Handler(Box::new(move |mut r| {
                Box::pin(async move {
                    let mut writer = writer;
                    tokio::io::copy(&mut r, &mut writer).await?;
                    writer.flush().await
                })
            })),
            true,
        );
        self.b
    }

    /// Consume the byte stream with an async callback.
    pub fn consume_bytes_with<F, Fut>(mut self, consumer: F) -> ExecBuilder<()>
    where
        F: FnOnce(StageReader) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = io::Result<()>> + Send + 'static,
    {
        self.b.set_output_target(
            OutputTarget::Handler(Box::new(move |r| Box::pin(consumer(r)))),
            true,
        );
        self.b
    }

    /// Consume the output line by line with an async callback receiving a
    /// [`LineReader`].
    pub fn consume_with<F, Fut>(mut self, consumer: F) -> ExecBuilder<()>
    where
        F: FnOnce(LineReader<StageReader>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = io::Result<()>> + Send + 'static,
    {
        let max_line_len = self.b.current.output.capture.max_line_len;
        let charset = self.b.current.output.charset;
        self.b.set_output_target(
            OutputTarget::Handler(Box::new(move |r| {
                Box::pin(consumer(LineReader::new(r, max_line_len, charset)))
            })),
            true,
        );
        self.b
    }

    /// Invoke a callback for every line of output.
    pub fn consume_lines_with<F>(mut self, mut consumer: F) -> ExecBuilder<()>
    where
        F: FnMut(String) + Send + 'static,
    {
        let max_line_len = self.b.current.output.capture.max_line_len;
        let charset = self.b.current.output.charset;
        self.b.set_output_target(
            OutputTarget::Handler(Box::new(move |r| {
                Box::pin(async move {
                    let mut lines = LineReader::new(r, max_line_len, charset);
                    while let Some(line) = lines.next_line().await? {
                        consumer(line);
                    }
                    Ok(())
                })
            })),
            true,
        );
        self.b
    }

    /// Collect the output into a single string of at most `max_chars`
    /// characters. Output past the cap is read and discarded so the child
    /// can exit normally.
    pub fn to_single_string(mut self, max_chars: usize) -> ExecBuilder<String> {
        let charset = self.b.current.output.charset;
        self.b.set_output_target(OutputTarget::Discard, true);
        self.b.with_result(ResultMode::Consume(Box::new(move |reader| {
            Box::pin(collect_string(reader, charset, max_chars))
        })))
    }

    /// Collect the output into a list of at most `max_lines` lines of at
    /// most `max_line_len` characters each. Excess lines are read and
    /// discarded.
    pub fn to_string_list(
        mut self,
        max_lines: usize,
        max_line_len: usize,
    ) -> ExecBuilder<Vec<String>> {
        let charset = self.b.current.output.charset;
        self.b.set_output_target(OutputTarget::Discard, true);
        self.b.with_result(ResultMode::Consume(Box::new(move |reader| {
            Box::pin(async move {
                let mut lines = LineReader::new(reader, max_line_len.max(1), charset);
                let mut out = Vec::new();
                while let Some(line) = lines.next_line().await? {
                    if out.len() < max_lines {
                        out.push(line);
                    }
                }
                Ok(out)
            })
        })))
    }

    /// Process the byte stream into the pipeline's result.
    pub fn process_bytes_with<T, F, Fut>(mut self, process: F) -> ExecBuilder<T>
    where
        T: Send + 'static,
        F: FnOnce(StageReader) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = io::Result<T>> + Send + 'static,
    {
        self.b.set_output_target(OutputTarget::Discard, true);
        self.b.with_result(ResultMode::Consume(Box::new(move |reader| {
            Box::pin(process(reader))
        })))
    }

    /// Process the output line-wise into the pipeline's result.
    pub fn process_with<T, F, Fut>(mut self, process: F) -> ExecBuilder<T>
    where
        T: Send + 'static,
        F: FnOnce(LineReader<StageReader>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = io::Result<T>> + Send + 'static,
    {
        let max_line_len = self.b.current.output.capture.max_line_len;
        let charset = self.b.current.output.charset;
        self.b.set_output_target(OutputTarget::Discard, true);
        self.b.with_result(ResultMode::Consume(Box::new(move |reader| {
            Box::pin(process(LineReader::new(reader, max_line_len, charset)))
        })))
    }

    /// Pipe the output into another command, opening its builder.
    pub fn pipe_to(self, command: impl Into<PathBuf>) -> ExecBuilder<()> {
        self.b.pipe_to(command)
    }
}

/// Standard error configuration of one stage.
pub struct ErrorView<O> {
    b: ExecBuilder<O>,
}

impl<O> ErrorView<O> {
    /// Return to the builder without changing the disposition.
    pub fn done(self) -> ExecBuilder<O> {
        self.b
    }

    /// Character handling for captured and processed stderr.
    pub fn charset(mut self, charset: Charset) -> Self {
        self.tune(|c| c.error.charset = charset);
        self
    }

    /// Warn with the gathered stderr when the stage succeeds anyway.
    pub fn log_on_success(mut self, enabled: bool) -> Self {
        self.tune(|c| c.error.capture.log_on_success = enabled);
        self
    }

    /// Head lines kept when gathering stderr.
    pub fn capture_head_lines(mut self, lines: usize) -> Self {
        self.tune(|c| c.error.capture.head_limit = lines);
        self
    }

    /// Tail lines kept when gathering stderr.
    pub fn capture_tail_lines(mut self, lines: usize) -> Self {
        self.tune(|c| c.error.capture.tail_limit = lines);
        self
    }

    /// Maximum length of a gathered stderr line in characters (at least 1).
    pub fn max_capture_line_length(mut self, length: usize) -> Self {
        if length == 0 {
            self.b.defer("max capture line length must be at least 1");
        } else {
            self.tune(|c| c.error.capture.max_line_len = length);
        }
        self
    }

    /// Add a tee consumer receiving a copy of the stderr byte stream.
    pub fn copy_and_consume_bytes_with<F, Fut>(mut self, consumer: F) -> Self
    where
        F: FnOnce(StageReader) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = io::Result<()>> + Send + 'static,
    {
        if matches!(self.b.current.error.target, ErrorTarget::Redirect) {
            self.b.defer("a redirected stderr cannot have consumers");
            return self;
        }
        self.b.current.error.capture.locked = true;
        self.b.current.error.extra.push((
            ConsumerKind::User,
            Box::new(move |r| Box::pin(consumer(r))),
        ));
        self
    }

    /// Add a tee consumer writing a copy of stderr to a file.
    pub fn copy_and_transfer_to(mut self, path: impl Into<PathBuf>) -> Self {
        if matches!(self.b.current.error.target, ErrorTarget::Redirect) {
            self.b.defer("a redirected stderr cannot have consumers");
            return self;
        }
        self.b.current.error.capture.locked = true;
        self.b.current.error.extra.push((
            ConsumerKind::Capture,
            file_writer_consumer(path.into(), false),
        ));
        self
    }

    /// Add a tee consumer invoking a callback for every stderr line.
    pub fn copy_and_consume_lines_with<F>(mut self, mut consumer: F) -> Self
    where
        F: FnMut(String) + Send + 'static,
    {
        if matches!(self.b.current.error.target, ErrorTarget::Redirect) {
            self.b.defer("a redirected stderr cannot have consumers");
            return self;
        }
        let max_line_len = self.b.current.error.capture.max_line_len;
        let charset = self.b.current.error.charset;
        self.b.current.error.capture.locked = true;
        self.b.current.error.extra.push((
            ConsumerKind::User,
            Box::new(move |r| {
                Box::pin(async move {
                    let mut lines = LineReader::new(r, max_line_len, charset);
                    while let Some(line) = lines.next_line().await? {
                        consumer(line);
                    }
                    Ok(())
                })
            }),
        ));
        self
    }

    /// Discard stderr entirely, including the diagnostic gathering.
    pub fn discard(mut self) -> ExecBuilder<O> {
        self.b.set_error_target(ErrorTarget::Discard, false);
        self.b.current.error.capture.gather = false;
        self.b.current.error.capture.log_on_success = false;
        self.b
    }

    /// The child inherits the parent's stderr; nothing is gathered.
    pub fn inherited(mut self) -> ExecBuilder<O> {
        self.b.set_error_target(ErrorTarget::Inherit, false);
        self.b.current.error.capture.gather = false;
        self.b.current.error.capture.log_on_success = false;
        self.b
    }

    /// Write stderr to a file, truncating it first.
    pub fn transfer_to(mut self, path: impl Into<PathBuf>) -> ExecBuilder<O> {
        self.b.set_error_target(
            ErrorTarget::File {
                path: path.into(),
                append: false,
            },
            true,
        );
        self.b
    }

    /// Append stderr to a file.
    pub fn append_to(mut self, path: impl Into<PathBuf>) -> ExecBuilder<O> {
        self.b.set_error_target(
            ErrorTarget::File {
                path: path.into(),
                append: true,
            },
            true,
        );
        self.b
    }

    /// Copy stderr into an async writer, flushing at end of stream.
    pub fn transfer_to_writer<W>(mut self, writer: W) -> ExecBuilder<O>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.b.set_error_target(
            ErrorTarget::Handler(Box::new(move |mut r| {
                Box::pin(async move {
                    let mut writer = writer;
                    tokio::io::copy(&mut r, &mut writer).await?;
                    writer.flush().await
                })
            })),
            true,
        );
        self.b
    }

    /// Consume the stderr byte stream with an async callback.
    pub fn consume_bytes_with<F, Fut>(mut self, consumer: F) -> ExecBuilder<O>
    where
        F: FnOnce(StageReader) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = io::Result<()>> + Send + 'static,
    {
        self.b.set_error_target(
            ErrorTarget::Handler(Box::new(move |r| Box::pin(consumer(r)))),
            true,
        );
        self.b
    }

    /// Consume stderr line by line with an async callback receiving a
    /// [`LineReader`].
    pub fn consume_with<F, Fut>(mut self, consumer: F) -> ExecBuilder<O>
    where
        F: FnOnce(LineReader<StageReader>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = io::Result<()>> + Send + 'static,
    {
        let max_line_len = self.b.current.error.capture.max_line_len;
        let charset = self.b.current.error.charset;
        self.b.set_error_target(
            ErrorTarget::Handler(Box::new(move |r| {
                Box::pin(consumer(LineReader::new(r, max_line_len, charset)))
            })),
            true,
        );
        self.b
    }

    /// Invoke a callback for every stderr line.
    pub fn consume_lines_with<F>(mut self, mut consumer: F) -> ExecBuilder<O>
    where
        F: FnMut(String) + Send + 'static,
    {
        let max_line_len = self.b.current.error.capture.max_line_len;
        let charset = self.b.current.error.charset;
        self.b.set_error_target(
            ErrorTarget::Handler(Box::new(move |r| {
                Box::pin(async move {
                    let mut lines = LineReader::new(r, max_line_len, charset);
                    while let Some(line) = lines.next_line().await? {
                        consumer(line);
                    }
                    Ok(())
                })
            })),
            true,
        );
        self.b
    }

    /// Merge stderr into the stage's stdout at the fd level. Disables
    /// stderr capture, gathering, and log-on-success for this stage.
    pub fn redirect(mut self) -> ExecBuilder<O> {
        if !self.b.current.error.extra.is_empty() {
            self.b.defer("a redirected stderr cannot have consumers");
            return self.b;
        }
        self.b.set_error_target(ErrorTarget::Redirect, false);
        self.b.current.error.capture.gather = false;
        self.b.current.error.capture.log_on_success = false;
        self.b
    }

    fn tune(&mut self, apply: impl FnOnce(&mut StageConfig)) {
        if self.b.current.error.capture.locked {
            self.b
                .defer("error capture settings must be set before attaching a processor");
        } else {
            apply(&mut self.b.current);
        }
    }
}

fn ok_if_broken_pipe(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

/// Collect up to `max_chars` characters, then keep reading and discarding
/// so the child never blocks on a full pipe.
async fn collect_string(
    mut reader: StageReader,
    charset: Charset,
    max_chars: usize,
) -> io::Result<String> {
    let mut decoder = Decoder::new(charset);
    let mut out = String::new();
    let mut count = 0usize;
    let mut buf = vec![0u8; 4096];
    let mut scratch = String::new();
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            if count < max_chars {
                scratch.clear();
                decoder.finish(&mut scratch)?;
                for c in scratch.chars() {
                    if count == max_chars {
                        break;
                    }
                    out.push(c);
                    count += 1;
                }
            }
            return Ok(out);
        }
        if count < max_chars {
            scratch.clear();
            decoder.decode(&buf[..n], &mut scratch)?;
            for c in scratch.chars() {
                if count == max_chars {
                    break;
                }
                out.push(c);
                count += 1;
            }
        }
    }
}
