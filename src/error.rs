//! Typed failure taxonomy for process and pipeline execution.
//!
//! Failures are collected per stage while a pipeline runs and only surfaced
//! once it has concluded; nothing is dropped mid-flight. A single stage with
//! problems raises [`ProcessError`], two or more raise [`PipelineError`]
//! with the per-stage errors in pipeline order. [`AbnormalExit`] carries the
//! diagnostic head/tail capture of the streams so a failure message is
//! useful without re-running the command.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Boxed error type accepted from user callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Which user-supplied callback a [`HandlerError`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerRole {
    /// Standard input producer.
    Input,
    /// Standard output consumer.
    Output,
    /// Standard error consumer.
    ErrorStream,
    /// The while-running hook.
    WhileRunning,
    /// The exit-code checker.
    ExitChecker,
}

impl fmt::Display for HandlerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Input => "input producer",
            Self::Output => "output consumer",
            Self::ErrorStream => "error consumer",
            Self::WhileRunning => "while-running hook",
            Self::ExitChecker => "exit-code checker",
        })
    }
}

/// A user callback raised or returned an error.
#[derive(Debug, Error)]
#[error("{role} failed: {source}")]
pub struct HandlerError {
    /// Which callback failed.
    pub role: HandlerRole,
    /// The underlying cause.
    #[source]
    pub source: BoxError,
}

impl HandlerError {
    pub(crate) fn new(role: HandlerRole, source: impl Into<BoxError>) -> Self {
        Self {
            role,
            source: source.into(),
        }
    }

    pub(crate) fn io(role: HandlerRole, source: io::Error) -> Self {
        Self {
            role,
            source: Box::new(source),
        }
    }
}

/// The exit-code checker rejected the child's exit status.
#[derive(Debug)]
pub struct AbnormalExit {
    /// The child's actual exit code. Signal deaths are reported as
    /// `128 + signal number`.
    pub exit_code: i32,
    /// Whether the soft exit timeout elapsed before the child exited.
    pub soft_timeout_elapsed: bool,
    /// Whether the hard exit timeout elapsed and the child was destroyed.
    pub hard_timeout_elapsed: bool,
    /// Head/tail capture of standard error, if gathering was enabled.
    pub stderr_lines: Vec<String>,
    /// Head/tail capture of standard output, if gather-on-fail was enabled.
    pub stdout_lines: Vec<String>,
}

impl fmt::Display for AbnormalExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process exited abnormally with code {}", self.exit_code)?;
        if self.soft_timeout_elapsed {
            write!(f, " (soft exit timeout elapsed)")?;
        }
        if self.hard_timeout_elapsed {
            write!(f, " (hard exit timeout elapsed, process destroyed)")?;
        }
        if !self.stderr_lines.is_empty() {
            write!(f, "\n  stderr:")?;
            for line in &self.stderr_lines {
                write!(f, "\n    {line}")?;
            }
        }
        if !self.stdout_lines.is_empty() {
            write!(f, "\n  stdout:")?;
            for line in &self.stdout_lines {
                write!(f, "\n    {line}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for AbnormalExit {}

/// A single recorded problem of one stage.
#[derive(Debug, Error)]
pub enum Problem {
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error(transparent)]
    AbnormalExit(#[from] AbnormalExit),
}

/// All problems of one stage, with the command identity attached.
#[derive(Debug)]
pub struct ProcessError {
    /// The command the stage ran.
    pub command: PathBuf,
    /// Its argument vector.
    pub arguments: Vec<String>,
    /// OS process id, when the child was actually spawned.
    pub pid: Option<u32>,
    /// Everything that went wrong, in collection order.
    pub problems: Vec<Problem>,
}

impl ProcessError {
    /// The abnormal-exit report, if one of the problems is one.
    pub fn abnormal_exit(&self) -> Option<&AbnormalExit> {
        self.problems.iter().find_map(|p| match p {
            Problem::AbnormalExit(e) => Some(e),
            Problem::Handler(_) => None,
        })
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process `{}`", self.command.display())?;
        if !self.arguments.is_empty() {
            write!(f, " {:?}", self.arguments)?;
        }
        if let Some(pid) = self.pid {
            write!(f, " (pid {pid})")?;
        }
        write!(f, " failed")?;
        match self.problems.as_slice() {
            [] => Ok(()),
            [one] => write!(f, ": {one}"),
            many => {
                write!(f, " with {} problems:", many.len())?;
                for p in many {
                    write!(f, "\n  - {p}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        // A single problem is the direct cause; several are enumerated in
        // the message instead.
        match self.problems.as_slice() {
            [one] => Some(one),
            _ => None,
        }
    }
}

/// Two or more pipeline stages failed.
#[derive(Debug)]
pub struct PipelineError {
    /// Per-stage errors in pipeline order.
    pub stages: Vec<ProcessError>,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} pipeline stages failed:", self.stages.len())?;
        for stage in &self.stages {
            write!(f, "\n  - {stage}")?;
        }
        Ok(())
    }
}

impl std::error::Error for PipelineError {}

/// A process (or one stage of a pipeline) could not be started.
///
/// Every child already spawned by the same invocation has been destroyed
/// forcibly by the time this is raised.
#[derive(Debug, Error)]
#[error("failed to start `{}`: {source}", command.display())]
pub struct SpawnError {
    /// The command that failed to start.
    pub command: PathBuf,
    #[source]
    pub source: io::Error,
}

/// An argument was rejected by the active [`ArgumentRule`](crate::args::ArgumentRule).
#[derive(Debug, Error)]
#[error("invalid argument at index {index}: {reason} (argument: {argument:?})")]
pub struct ArgumentError {
    /// Position of the offending argument in the vector.
    pub index: usize,
    /// The argument text.
    pub argument: String,
    /// Why it was rejected.
    pub reason: String,
}

/// The builder was configured in a way that cannot be executed.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Top-level error raised by `run()` and the convenience entry points.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    InvalidArgument(#[from] ArgumentError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// The abnormal-exit report of the first stage that has one, if any.
    ///
    /// Convenient for callers that only need the exit code and captured
    /// streams without matching the whole taxonomy.
    pub fn abnormal_exit(&self) -> Option<&AbnormalExit> {
        match self {
            Self::Process(p) => p.abnormal_exit(),
            Self::Pipeline(p) => p.stages.iter().find_map(ProcessError::abnormal_exit),
            _ => None,
        }
    }

    pub(crate) fn spawn(command: &Path, source: io::Error) -> Self {
        Self::Spawn(SpawnError {
            command: command.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_problem_is_direct_cause() {
        let err = ProcessError {
            command: PathBuf::from("/bin/true"),
            arguments: vec![],
            pid: Some(42),
            problems: vec![Problem::Handler(HandlerError::io(
                HandlerRole::Output,
                io::Error::new(io::ErrorKind::BrokenPipe, "gone"),
            ))],
        };
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("pid 42"));
    }

    #[test]
    fn test_multiple_problems_are_enumerated() {
        let err = ProcessError {
            command: PathBuf::from("/bin/false"),
            arguments: vec!["-x".into()],
            pid: None,
            problems: vec![
                Problem::Handler(HandlerError::io(
                    HandlerRole::Input,
                    io::Error::new(io::ErrorKind::BrokenPipe, "gone"),
                )),
                Problem::AbnormalExit(AbnormalExit {
                    exit_code: 1,
                    soft_timeout_elapsed: false,
                    hard_timeout_elapsed: false,
                    stderr_lines: vec!["boom".into()],
                    stdout_lines: vec![],
                }),
            ],
        };
        assert!(std::error::Error::source(&err).is_none());
        let msg = err.to_string();
        assert!(msg.contains("2 problems"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn test_abnormal_exit_lookup() {
        let err = Error::Process(ProcessError {
            command: PathBuf::from("x"),
            arguments: vec![],
            pid: Some(1),
            problems: vec![Problem::AbnormalExit(AbnormalExit {
                exit_code: 7,
                soft_timeout_elapsed: true,
                hard_timeout_elapsed: false,
                stderr_lines: vec![],
                stdout_lines: vec![],
            })],
        });
        assert_eq!(err.abnormal_exit().map(|a| a.exit_code), Some(7));
    }
}
