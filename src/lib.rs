#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::return_self_not_must_use)]

//! # chute
//!
//! Subprocess and pipeline execution for the tokio runtime.
//!
//! chute launches one child process, or a chain of them connected stdout
//! to stdin, and drives every standard stream concurrently: user producers
//! feed stdin, user consumers and capture buffers drain stdout and stderr
//! (fanned out through a zero-copy tee when several want the same stream),
//! and a per-stage waiter applies a soft-then-hard exit-timeout ladder
//! once I/O drains. Failures are collected per stage and reported
//! precisely: which callback failed, what the exit code was, and the first
//! and last lines of what the process said on the way down.
//!
//! ## Quick start
//!
//! ```no_run
//! # async fn demo() -> chute::Result<()> {
//! // One-shot capture
//! let listing = chute::execute_to_string("/bin/ls", ["-l"]).await?;
//!
//! // A pipeline with per-stage configuration
//! let sorted: Vec<String> = chute::ExecBuilder::new("/bin/cat")
//!     .input()
//!     .from_string("b\na\nc\n")
//!     .pipe_to("/usr/bin/sort")
//!     .output()
//!     .to_string_list(100, 200)
//!     .run()
//!     .await?;
//! # let _ = (listing, sorted);
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees
//!
//! - After `run()` returns or raises, every child started by the
//!   invocation has exited and every library-owned pipe endpoint is
//!   closed.
//! - A callback error never aborts the pipeline mid-flight; the stage's
//!   pipe end is closed, the child runs to its own exit, and the problem
//!   is reported afterwards.
//! - A spawn failure destroys every already-spawned child of the same
//!   invocation, descendants included, before the error is raised.

pub mod args;
pub mod builder;
pub mod charset;
pub mod error;
pub mod fs_util;
pub mod guard;
pub mod io;
pub mod process;
pub mod util;

mod config;
mod pipeline;

// Re-export the key types at crate root for convenience.
pub use args::ArgumentRule;
pub use builder::{
    execute, execute_to_string, ErrorView, ExecBuilder, InputView, OutputView,
    DEFAULT_STRING_CAPTURE,
};
pub use charset::Charset;
pub use error::{
    AbnormalExit, ArgumentError, BoxError, ConfigError, Error, HandlerError, HandlerRole,
    PipelineError, Problem, ProcessError, Result, SpawnError,
};
pub use io::{HeadTailGatherer, LineReader, StageReader, StageStdin, StageWriter};
pub use process::{destroy_process_tree, ProcessHandle};
